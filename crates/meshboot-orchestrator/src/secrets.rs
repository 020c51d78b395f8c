//! Cached secrets that follow feature toggles.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use meshboot_cache::SecretCache;
use meshboot_core::Topology;
use meshboot_core::config::SecurityConfig;
use rand::RngCore;
use tracing::{debug, info};

use crate::error::{BootstrapResult, ResultExt};

pub const GOSSIP_KEY: &str = "gossip-key";
/// Marks one generation of TLS material; certificate tooling keys its CA on it.
pub const TLS_MATERIAL: &str = "tls-material";

const GOSSIP_KEY_BYTES: usize = 32;
const TLS_MARKER_BYTES: usize = 16;

/// Secrets held for the enabled features.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedSecrets {
    pub gossip_key: Option<String>,
    pub tls_marker: Option<String>,
}

/// Cache name of a cluster's management token.
pub fn management_token_name(cluster: &str) -> String {
    format!("management-token/{cluster}")
}

/// Bring the cached secrets in line with the enabled features: derive the
/// gossip key and TLS marker once while their feature is on, and forget
/// whatever a disabled feature left behind.
pub fn reconcile_cached_secrets(
    cache: &dyn SecretCache,
    security: &SecurityConfig,
    topology: &Topology,
) -> BootstrapResult<CachedSecrets> {
    let gossip_key = if security.gossip_encryption {
        let key = cache
            .load_or_derive(GOSSIP_KEY, &mut || Ok(generate_gossip_key()))
            .context(|| "derive gossip key")?;
        Some(key)
    } else {
        forget(cache, GOSSIP_KEY)?;
        None
    };

    let tls_marker = if security.tls {
        let marker = cache
            .load_or_derive(TLS_MATERIAL, &mut || Ok(generate_tls_marker()))
            .context(|| "derive TLS marker")?;
        Some(marker)
    } else {
        forget(cache, TLS_MATERIAL)?;
        None
    };

    if !security.acls {
        for cluster in &topology.clusters {
            forget(cache, &management_token_name(&cluster.name))?;
        }
    }

    Ok(CachedSecrets {
        gossip_key,
        tls_marker,
    })
}

fn forget(cache: &dyn SecretCache, name: &str) -> BootstrapResult<()> {
    let existed = !cache
        .load(name)
        .context(|| format!("load {name}"))?
        .is_empty();
    cache.delete(name).context(|| format!("delete {name}"))?;
    if existed {
        info!(%name, "feature disabled, cached secret removed");
    } else {
        debug!(%name, "nothing cached");
    }
    Ok(())
}

fn generate_gossip_key() -> String {
    let mut key = [0u8; GOSSIP_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut key);
    STANDARD.encode(key)
}

fn generate_tls_marker() -> String {
    let mut marker = [0u8; TLS_MARKER_BYTES];
    rand::thread_rng().fill_bytes(&mut marker);
    URL_SAFE_NO_PAD.encode(marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use meshboot_cache::SecretStore;

    fn security() -> SecurityConfig {
        SecurityConfig::default()
    }

    #[test]
    fn gossip_key_is_derived_once() {
        let cache = SecretStore::open_in_memory().unwrap();
        let topo = testutil::topology(testutil::TWO_DC);
        let mut security = security();
        security.gossip_encryption = true;

        let first = reconcile_cached_secrets(&cache, &security, &topo)
            .unwrap()
            .gossip_key
            .unwrap();
        assert_eq!(STANDARD.decode(&first).unwrap().len(), GOSSIP_KEY_BYTES);

        let second = reconcile_cached_secrets(&cache, &security, &topo)
            .unwrap()
            .gossip_key
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn tls_marker_is_derived_once_and_kept() {
        let cache = SecretStore::open_in_memory().unwrap();
        let topo = testutil::topology(testutil::TWO_DC);
        let mut security = security();
        security.tls = true;

        let first = reconcile_cached_secrets(&cache, &security, &topo).unwrap();
        let marker = first.tls_marker.unwrap();
        assert_eq!(URL_SAFE_NO_PAD.decode(&marker).unwrap().len(), TLS_MARKER_BYTES);
        assert_eq!(cache.load(TLS_MATERIAL).unwrap(), marker);
        assert_eq!(first.gossip_key, None);

        let second = reconcile_cached_secrets(&cache, &security, &topo).unwrap();
        assert_eq!(second.tls_marker.as_deref(), Some(marker.as_str()));

        security.tls = false;
        let third = reconcile_cached_secrets(&cache, &security, &topo).unwrap();
        assert_eq!(third.tls_marker, None);
        assert_eq!(cache.load(TLS_MATERIAL).unwrap(), "");
    }

    #[test]
    fn existing_tls_marker_is_not_replaced() {
        let cache = SecretStore::open_in_memory().unwrap();
        let topo = testutil::topology(testutil::TWO_DC);
        cache.save(TLS_MATERIAL, "ca-2026").unwrap();
        let mut security = security();
        security.tls = true;

        let secrets = reconcile_cached_secrets(&cache, &security, &topo).unwrap();
        assert_eq!(secrets.tls_marker.as_deref(), Some("ca-2026"));
    }

    #[test]
    fn disabled_features_forget_their_secrets() {
        let cache = SecretStore::open_in_memory().unwrap();
        let topo = testutil::topology(testutil::TWO_DC);
        cache.save(GOSSIP_KEY, "old-key").unwrap();
        cache.save(TLS_MATERIAL, "ca").unwrap();
        cache.save("management-token/dc1", "root").unwrap();
        cache.save("agent-token/dc1/dc1-client1", "agent").unwrap();

        let mut security = security();
        security.acls = false;
        assert_eq!(
            reconcile_cached_secrets(&cache, &security, &topo).unwrap(),
            CachedSecrets::default()
        );

        assert_eq!(cache.names().unwrap(), vec!["agent-token/dc1/dc1-client1"]);
    }

    #[test]
    fn acls_on_keeps_management_tokens() {
        let cache = SecretStore::open_in_memory().unwrap();
        let topo = testutil::topology(testutil::TWO_DC);
        cache.save("management-token/dc1", "root").unwrap();

        reconcile_cached_secrets(&cache, &security(), &topo).unwrap();
        assert_eq!(cache.load("management-token/dc1").unwrap(), "root");
    }
}
