//! The bootstrap run: a fixed sequence of steps over the topology.

use std::collections::BTreeMap;
use std::sync::Arc;

use meshboot_api::ClientProvider;
use meshboot_cache::SecretCache;
use meshboot_core::config::BootstrapConfig;
use meshboot_core::{LinkMode, Topology};
use tracing::{debug, info};

use crate::acl::bootstrap_acls;
use crate::clients::Clients;
use crate::entries::reconcile_entries;
use crate::error::BootstrapResult;
use crate::issue::{Issuer, Route};
use crate::link::{establish_peerings, push_replication_token};
use crate::registry::{CredentialKind, TokenRegistry};
use crate::secrets::reconcile_cached_secrets;
use crate::tenancy::init_tenancy;
use crate::wait::{
    wait_anti_entropy, wait_cross_cluster_kv, wait_for_completion, wait_for_leader,
    wait_token_live,
};

/// Drives a topology from "processes running" to "secured and healthy".
///
/// Every step is idempotent; a failed run is recovered by running again.
pub struct Orchestrator {
    clients: Clients,
    config: BootstrapConfig,
    cache: Arc<dyn SecretCache>,
    issuer: Issuer,
    registry: TokenRegistry,
    /// Token used to talk to each processed cluster.
    management: BTreeMap<String, String>,
}

impl Orchestrator {
    pub fn new(
        topology: Arc<Topology>,
        config: BootstrapConfig,
        provider: Arc<dyn ClientProvider>,
        cache: Arc<dyn SecretCache>,
    ) -> Self {
        let clients = Clients::new(provider, topology);
        let issuer = Issuer::new(clients.clone(), Arc::clone(&cache), config.tenancy.enabled);
        Self {
            clients,
            config,
            cache,
            issuer,
            registry: TokenRegistry::new(),
            management: BTreeMap::new(),
        }
    }

    /// Credentials issued by the last run.
    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    /// Management token used for `cluster` by the last run.
    pub fn management_token(&self, cluster: &str) -> Option<&str> {
        self.management.get(cluster).map(String::as_str)
    }

    /// Run the whole bootstrap. With `primary_only`, stop after the
    /// primary cluster (no secondaries, no linking).
    pub async fn run_bootstrap(&mut self, primary_only: bool) -> BootstrapResult<()> {
        self.registry = TokenRegistry::new();
        self.management.clear();

        let clients = self.clients.clone();
        let topology = clients.topology();
        topology.validate()?;
        self.config.validate(topology)?;
        let secrets =
            reconcile_cached_secrets(self.cache.as_ref(), &self.config.security, topology)?;
        debug!(
            gossip_key = secrets.gossip_key.is_some(),
            tls_marker = secrets.tls_marker.is_some(),
            "cached secrets reconciled"
        );

        let primary = topology.primary().name.clone();
        info!(
            cluster = %primary,
            link_mode = ?topology.link_mode,
            clusters = topology.clusters.len(),
            primary_only,
            "bootstrap starting"
        );

        self.bring_up(&primary).await?;
        let mut processed = vec![primary.clone()];

        if !primary_only {
            let secondaries: Vec<String> = topology.secondaries().map(|c| c.name.clone()).collect();
            for cluster in secondaries.iter().filter(|c| topology.is_self_primary(c)) {
                self.bring_up(cluster).await?;
            }
            match topology.link_mode {
                LinkMode::Federation => self.federate(&primary, &secondaries).await?,
                LinkMode::Peering => establish_peerings(&clients, &self.management).await?,
            }
            processed.extend(secondaries);
        }

        let entry_clusters = match topology.link_mode {
            LinkMode::Federation => std::slice::from_ref(&primary),
            LinkMode::Peering => processed.as_slice(),
        };
        for cluster in entry_clusters {
            reconcile_entries(&clients, &self.config, cluster, self.token(cluster)).await?;
        }

        let budget = self.config.timeouts.final_check()?;
        wait_for_completion(
            &clients,
            &processed,
            &self.management,
            self.config.tenancy.enabled,
            budget,
        )
        .await?;

        info!(
            clusters = processed.len(),
            credentials = self.registry.len(),
            "bootstrap complete"
        );
        Ok(())
    }

    /// Bring up a cluster that owns its ACL system.
    async fn bring_up(&mut self, cluster: &str) -> BootstrapResult<()> {
        wait_for_leader(&self.clients, cluster, "").await?;

        let token = if self.config.security.acls {
            bootstrap_acls(
                &self.clients,
                self.cache.as_ref(),
                &self.config.security,
                cluster,
            )
            .await?
        } else {
            String::new()
        };
        self.management.insert(cluster.to_string(), token.clone());

        if self.config.tenancy.enabled {
            init_tenancy(&self.clients, cluster, &token).await?;
        }

        if self.config.security.acls {
            let pending = self
                .issuer
                .issue_cluster(&mut self.registry, &Route::local(cluster, &token))
                .await?;
            debug_assert!(pending.is_empty());
            wait_anti_entropy(
                &self.clients,
                &self.registry,
                cluster,
                &token,
                self.config.tenancy.enabled,
            )
            .await?;
        }

        info!(%cluster, "cluster ready");
        Ok(())
    }

    /// Join every secondary to the primary's WAN federation.
    async fn federate(&mut self, primary: &str, secondaries: &[String]) -> BootstrapResult<()> {
        let token = self.token(primary).to_string();
        let acls = self.config.security.acls;

        if acls {
            self.issuer
                .issue(
                    &mut self.registry,
                    CredentialKind::Replication,
                    &Route::local(primary, &token),
                )
                .await?;
            push_replication_token(&self.clients, &self.registry, &token).await?;
        }

        for cluster in secondaries {
            wait_for_leader(&self.clients, cluster, "").await?;
            self.management.insert(cluster.clone(), token.clone());
            if !acls {
                info!(%cluster, "cluster ready");
                continue;
            }

            wait_token_live(&self.clients, cluster, &token).await?;
            let commits = self
                .issuer
                .issue_cluster(&mut self.registry, &Route::through(primary, &token, cluster))
                .await?;
            let count = commits.len();
            for commit in commits {
                commit().await?;
            }
            debug!(%cluster, count, "deferred credentials committed");

            wait_anti_entropy(
                &self.clients,
                &self.registry,
                cluster,
                &token,
                self.config.tenancy.enabled,
            )
            .await?;
            info!(%cluster, "cluster ready");
        }

        for cluster in secondaries {
            wait_cross_cluster_kv(&self.clients, primary, cluster, &token).await?;
        }
        Ok(())
    }

    fn token(&self, cluster: &str) -> &str {
        self.management_token(cluster).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CredentialKey;
    use crate::testutil;
    use meshboot_api::fake::FakeMesh;
    use meshboot_cache::SecretStore;

    fn orchestrator(mesh: &FakeMesh, config: BootstrapConfig) -> (Orchestrator, SecretStore) {
        let topology = testutil::topology(testutil::TWO_DC);
        let cache = SecretStore::open_in_memory().unwrap();
        let orch = Orchestrator::new(
            topology,
            config,
            Arc::new(mesh.clone()),
            Arc::new(cache.clone()),
        );
        (orch, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn primary_only_leaves_secondaries_alone() {
        let (mesh, _) = testutil::federation();
        let (mut orch, _cache) = orchestrator(&mesh, BootstrapConfig::default());

        orch.run_bootstrap(true).await.unwrap();
        assert_eq!(mesh.count_in("leader", "dc2"), 0);
        assert_eq!(mesh.count_in("agent_update_token", "dc2"), 0);
        assert!(!orch.registry().contains(&CredentialKey::replication()));
        assert!(orch.registry().contains(&CredentialKey::mesh_gateway("dc1")));
    }

    #[tokio::test(start_paused = true)]
    async fn acls_disabled_skips_credentials() {
        let (mesh, _) = testutil::federation();
        let mut config = BootstrapConfig::default();
        config.security.acls = false;
        let (mut orch, cache) = orchestrator(&mesh, config);
        cache.save("management-token/dc1", "leftover").unwrap();

        orch.run_bootstrap(false).await.unwrap();
        assert_eq!(mesh.count("acl_bootstrap"), 0);
        assert_eq!(mesh.count("token_create"), 0);
        assert!(orch.registry().is_empty());
        assert_eq!(cache.load("management-token/dc1").unwrap(), "");
        // Linking still happens.
        assert_eq!(mesh.count("kv_put"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_fails_before_any_call() {
        let (mesh, _) = testutil::federation();
        let mut config = BootstrapConfig::default();
        config
            .config_entries
            .insert("dc2".to_string(), vec![meshboot_core::ConfigEntry::new("service-defaults", "pong")]);
        let (mut orch, _cache) = orchestrator(&mesh, config);

        let err = orch.run_bootstrap(false).await.unwrap_err();
        assert!(matches!(err, crate::error::BootstrapError::Config(_)));
        assert!(mesh.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn huge_final_check_fails_before_any_call() {
        for value in ["18446744073709551615s", "9999999999999999h"] {
            let (mesh, _) = testutil::federation();
            let mut config = BootstrapConfig::default();
            config.timeouts.final_check = value.to_string();
            let (mut orch, _cache) = orchestrator(&mesh, config);

            let err = orch.run_bootstrap(false).await.unwrap_err();
            assert!(matches!(err, crate::error::BootstrapError::Config(_)), "{value}: {err}");
            assert!(mesh.calls().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unvalidated_topology_is_rejected() {
        let (mesh, _) = testutil::federation();
        let mut topology = (*testutil::topology(testutil::TWO_DC)).clone();
        topology.clusters.clear();
        topology.nodes.clear();
        let mut orch = Orchestrator::new(
            Arc::new(topology),
            BootstrapConfig::default(),
            Arc::new(mesh.clone()),
            Arc::new(SecretStore::open_in_memory().unwrap()),
        );

        let err = orch.run_bootstrap(false).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::BootstrapError::Topology(meshboot_core::TopologyError::NoClusters)
        ));
        assert!(mesh.calls().is_empty());
    }
}
