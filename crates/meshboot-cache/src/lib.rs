//! meshboot-cache: durable credential cache for meshboot.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the handful of secrets
//! that must survive across orchestrator runs (management tokens, the
//! gossip key, issued agent/service tokens that config generators read
//! from disk) so that re-running the bootstrap never mints them twice.
//!
//! The orchestrator only sees the [`SecretCache`] trait; [`SecretStore`]
//! is the redb implementation, `Clone` + `Send` + `Sync` via
//! `Arc<Database>`.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{CacheError, CacheResult};
pub use store::{SecretCache, SecretStore};
