//! SecretStore: redb-backed durable secret cache.
//!
//! Every write is its own committed transaction, so a secret is fully
//! synced before `save` returns. There is no cross-secret atomicity: a
//! crash between minting and saving a secret means it is minted again on
//! the next run.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::tables::SECRETS;

/// Convert any `Display` error into a `CacheError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| CacheError::$variant(e.to_string())
    };
}

/// Narrow durable key-value interface used for at-most-once secret
/// generation across runs.
///
/// The empty string is the not-found sentinel: `load` never fails just
/// because a name is absent, and deleting an absent name is a no-op.
pub trait SecretCache: Send + Sync {
    /// Load a secret, or `""` when it has never been saved.
    fn load(&self, name: &str) -> CacheResult<String>;

    /// Durably store a secret, replacing any previous value.
    fn save(&self, name: &str, value: &str) -> CacheResult<()>;

    /// Forget a secret so the next run regenerates it.
    fn delete(&self, name: &str) -> CacheResult<()>;

    /// Names of every stored secret, sorted.
    fn names(&self) -> CacheResult<Vec<String>>;

    /// Return the cached secret, deriving and saving it first if absent.
    fn load_or_derive(
        &self,
        name: &str,
        derive: &mut dyn FnMut() -> CacheResult<String>,
    ) -> CacheResult<String> {
        let existing = self.load(name)?;
        if !existing.is_empty() {
            return Ok(existing);
        }
        let value = derive()?;
        self.save(name, &value)?;
        debug!(%name, "derived and cached new secret");
        Ok(value)
    }
}

/// Thread-safe secret store backed by redb.
#[derive(Clone)]
pub struct SecretStore {
    db: Arc<Database>,
}

impl SecretStore {
    /// Open (or create) a persistent cache at the given path.
    pub fn open(path: &Path) -> CacheResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "secret cache opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory cache (for testing).
    pub fn open_in_memory() -> CacheResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory secret cache opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> CacheResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(SECRETS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Every `(name, secret)` pair, sorted by name.
    pub fn entries(&self) -> CacheResult<Vec<(String, String)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            results.push((key.value().to_string(), value.value().to_string()));
        }
        Ok(results)
    }
}

impl SecretCache for SecretStore {
    fn load(&self, name: &str) -> CacheResult<String> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => Ok(guard.value().to_string()),
            None => Ok(String::new()),
        }
    }

    fn save(&self, name: &str, value: &str) -> CacheResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
            table.insert(name, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, "secret cached");
        Ok(())
    }

    fn delete(&self, name: &str) -> CacheResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, existed, "secret forgotten");
        Ok(())
    }

    fn names(&self) -> CacheResult<Vec<String>> {
        Ok(self.entries()?.into_iter().map(|(name, _)| name).collect())
    }
}
