//! End-to-end bootstrap runs against the in-memory control plane.

use std::sync::Arc;

use meshboot_api::ApiError;
use meshboot_api::fake::FakeMesh;
use meshboot_cache::{CacheResult, SecretCache, SecretStore};
use meshboot_core::config::BootstrapConfig;
use meshboot_core::entry::{EXPORTED_SERVICES, PROXY_DEFAULTS, SERVICE_DEFAULTS, SERVICE_INTENTIONS};
use meshboot_core::{ConfigEntry, Topology};
use meshboot_orchestrator::{BootstrapError, CredentialKey, Orchestrator};

const FEDERATION: &str = r#"
link_mode = "federation"

[[clusters]]
name = "dc1"
primary = true

[[clusters]]
name = "dc2"

[[nodes]]
cluster = "dc1"
name = "dc1-server1"
role = "server"
address = "10.0.1.11"

[[nodes]]
cluster = "dc1"
name = "dc1-client1"
role = "agent"
address = "10.0.1.12"

[nodes.service]
name = "ping"

[nodes.service.upstream]
name = "pong"
datacenter = "dc2"

[[nodes]]
cluster = "dc1"
name = "dc1-mgw"
role = "mesh-gateway"
address = "10.0.1.13"

[[nodes]]
cluster = "dc2"
name = "dc2-server1"
role = "server"
address = "10.0.2.11"

[[nodes]]
cluster = "dc2"
name = "dc2-server2"
role = "server"
address = "10.0.2.14"

[[nodes]]
cluster = "dc2"
name = "dc2-client1"
role = "agent"
address = "10.0.2.12"

[nodes.service]
name = "pong"
"#;

/// Cache that marks every save in the mesh journal.
struct RecordingCache {
    inner: SecretStore,
    mesh: FakeMesh,
}

impl SecretCache for RecordingCache {
    fn load(&self, name: &str) -> CacheResult<String> {
        self.inner.load(name)
    }

    fn save(&self, name: &str, value: &str) -> CacheResult<()> {
        self.mesh.note(&format!("save {name}"));
        self.inner.save(name, value)
    }

    fn delete(&self, name: &str) -> CacheResult<()> {
        self.inner.delete(name)
    }

    fn names(&self) -> CacheResult<Vec<String>> {
        self.inner.names()
    }
}

struct Harness {
    mesh: FakeMesh,
    cache: SecretStore,
    topology: Arc<Topology>,
}

impl Harness {
    fn new(topology: &str) -> Self {
        let topology = Arc::new(Topology::from_toml_str(topology).unwrap());
        Self {
            mesh: FakeMesh::from_topology(&topology),
            cache: SecretStore::open_in_memory().unwrap(),
            topology,
        }
    }

    fn federation() -> Self {
        Self::new(FEDERATION)
    }

    fn peering() -> Self {
        let toml = FEDERATION
            .replace("link_mode = \"federation\"", "link_mode = \"peering\"")
            .replace("datacenter = \"dc2\"", "peer = \"dc2\"");
        Self::new(&toml)
    }

    fn orchestrator(&self, config: BootstrapConfig) -> Orchestrator {
        let cache = RecordingCache {
            inner: self.cache.clone(),
            mesh: self.mesh.clone(),
        };
        Orchestrator::new(
            Arc::clone(&self.topology),
            config,
            Arc::new(self.mesh.clone()),
            Arc::new(cache),
        )
    }

    /// Journal index of the first call authenticated with `token` in
    /// `cluster`.
    fn first_use(&self, cluster: &str, token: &str) -> usize {
        self.mesh
            .calls()
            .iter()
            .position(|c| c.cluster == cluster && c.token == token)
            .unwrap()
    }
}

fn booting(address: &str) -> ApiError {
    ApiError::status(500, address, "ACL system not yet available")
}

// ── Example scenarios ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn federation_first_run() {
    let h = Harness::federation();
    h.mesh.set_leaderless("dc1", 3);
    h.mesh.set_sync_delay("dc2", 2);
    h.mesh
        .fail_next("agent_update_token", "dc2-server1", 3, booting("10.0.2.11:8500"));

    let mut orch = h.orchestrator(BootstrapConfig::default());
    orch.run_bootstrap(false).await.unwrap();

    let root = orch.management_token("dc1").unwrap().to_string();
    assert!(h.mesh.is_bootstrapped("dc1"));
    assert_eq!(h.mesh.count("acl_bootstrap"), 1);
    assert_eq!(h.cache.load("management-token/dc1").unwrap(), root);
    assert_eq!(orch.management_token("dc2"), Some(root.as_str()));

    // Agents in both clusters got their tokens and synced.
    for (cluster, node) in [("dc1", "dc1-client1"), ("dc1", "dc1-mgw"), ("dc2", "dc2-client1")] {
        let secret = orch
            .registry()
            .get(&CredentialKey::agent(cluster, node))
            .unwrap()
            .to_string();
        assert_eq!(
            h.mesh
                .agent_token(cluster, node, meshboot_api::AgentTokenKind::Agent)
                .as_deref(),
            Some(secret.as_str())
        );
    }
    assert!(h.mesh.all_synced("dc1"));
    assert!(h.mesh.all_synced("dc2"));

    // Replication token reached every dc2 server.
    let replication = orch.registry().get(&CredentialKey::replication()).unwrap();
    for server in ["dc2-server1", "dc2-server2"] {
        assert_eq!(
            h.mesh
                .agent_token("dc2", server, meshboot_api::AgentTokenKind::Replication)
                .as_deref(),
            Some(replication)
        );
    }

    // WAN path proven, and both clusters accepted the readiness write.
    assert_eq!(h.mesh.kv("dc2", "meshboot/wan-check").as_deref(), Some("dc1"));
    assert!(h.mesh.kv("dc1", "meshboot/ready").is_some());
    assert!(h.mesh.kv("dc2", "meshboot/ready").is_some());

    // Config entries live on the primary only.
    assert!(h.mesh.config_entry("dc1", SERVICE_INTENTIONS, "pong").is_some());
    assert!(h.mesh.config_entry("dc1", PROXY_DEFAULTS, "global").is_some());
    assert!(h.mesh.config_entries("dc2").is_empty());

    // Every registered credential is cached under its name.
    for (key, secret) in orch.registry().iter() {
        assert_eq!(h.cache.load(&key.cache_name()).unwrap(), secret, "{key}");
    }
}

#[tokio::test(start_paused = true)]
async fn federation_second_run_is_all_updates() {
    let h = Harness::federation();
    h.mesh.set_leaderless("dc1", 3);
    h.mesh.set_sync_delay("dc2", 2);
    h.mesh
        .fail_next("agent_update_token", "dc2-server1", 3, booting("10.0.2.11:8500"));

    let mut orch = h.orchestrator(BootstrapConfig::default());
    orch.run_bootstrap(false).await.unwrap();
    let first_calls = h.mesh.calls().len();
    let first_registry = orch.registry().clone();
    let first_cache = h.cache.entries().unwrap();
    let first_entries = h.mesh.config_entries("dc1");

    h.mesh.clear_calls();
    let mut orch = h.orchestrator(BootstrapConfig::default());
    orch.run_bootstrap(false).await.unwrap();

    for op in ["acl_bootstrap", "policy_create", "token_create", "config_entry_delete"] {
        assert_eq!(h.mesh.count(op), 0, "{op}");
    }
    assert!(h.mesh.count("token_update") > 0);
    assert!(h.mesh.count("policy_update") > 0);
    // Each wait is satisfied on its first poll.
    assert_eq!(h.mesh.count("leader"), 2);
    assert_eq!(h.mesh.count("acl_bootstrap"), 0);

    assert_eq!(orch.registry(), &first_registry);
    assert_eq!(h.cache.entries().unwrap(), first_cache);
    assert_eq!(h.mesh.config_entries("dc1"), first_entries);
    assert!(h.mesh.calls().len() < first_calls);
}

// ── Safety properties ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn management_token_is_saved_before_use() {
    let h = Harness::federation();
    let mut orch = h.orchestrator(BootstrapConfig::default());
    orch.run_bootstrap(false).await.unwrap();

    let root = orch.management_token("dc1").unwrap();
    let saved = h.mesh.note_position("save management-token/dc1").unwrap();
    assert!(saved <= h.first_use("dc1", root));
}

#[tokio::test(start_paused = true)]
async fn deferred_credentials_are_cached_after_liveness() {
    let h = Harness::federation();
    let mut orch = h.orchestrator(BootstrapConfig::default());
    orch.run_bootstrap(false).await.unwrap();

    for key in [
        CredentialKey::agent("dc2", "dc2-client1"),
        CredentialKey::agent("dc2", "dc2-server2"),
    ] {
        let secret = orch.registry().get(&key).unwrap();
        let saved = h
            .mesh
            .note_position(&format!("save {}", key.cache_name()))
            .unwrap();
        // The liveness check on dc2 servers runs with the new token itself.
        assert!(h.first_use("dc2", secret) < saved, "{key}");
    }
}

#[tokio::test(start_paused = true)]
async fn failed_liveness_leaves_deferred_credentials_uncached() {
    let h = Harness::federation();
    // First self-read on dc2-server1 checks the management token; the next
    // one is the first deferred commit.
    h.mesh.fail_after(
        "token_read_self",
        "dc2-server1",
        1,
        ApiError::status(500, "10.0.2.11:8500", "Permission denied"),
    );

    let mut orch = h.orchestrator(BootstrapConfig::default());
    let err = orch.run_bootstrap(false).await.unwrap_err();
    assert!(matches!(err, BootstrapError::Api { .. }));

    assert!(orch.registry().contains(&CredentialKey::agent("dc2", "dc2-client1")));
    let names = h.cache.names().unwrap();
    assert!(names.iter().all(|n| !n.contains("/dc2/")), "{names:?}");
    assert!(names.contains(&"agent-token/dc1/dc1-client1".to_string()));
}

#[tokio::test(start_paused = true)]
async fn crash_after_bootstrap_resumes_without_rebootstrap() {
    let h = Harness::federation();
    h.mesh.fail_next(
        "token_create",
        "dc1",
        1,
        ApiError::status(500, "10.0.1.11:8500", "internal error"),
    );

    let mut orch = h.orchestrator(BootstrapConfig::default());
    assert!(orch.run_bootstrap(false).await.is_err());
    assert!(h.mesh.is_bootstrapped("dc1"));
    let root = h.cache.load("management-token/dc1").unwrap();
    assert!(!root.is_empty());

    let mut orch = h.orchestrator(BootstrapConfig::default());
    orch.run_bootstrap(false).await.unwrap();
    assert_eq!(h.mesh.count("acl_bootstrap"), 1);
    assert_eq!(orch.management_token("dc1"), Some(root.as_str()));
}

#[tokio::test(start_paused = true)]
async fn stale_entries_are_removed_most_dependent_first() {
    let h = Harness::federation();
    h.mesh
        .insert_config_entry("dc1", ConfigEntry::new(SERVICE_DEFAULTS, "legacy"));
    h.mesh
        .insert_config_entry("dc1", ConfigEntry::new(SERVICE_INTENTIONS, "legacy"));
    h.mesh
        .insert_config_entry("dc1", ConfigEntry::new("service-resolver", "legacy"));

    let mut orch = h.orchestrator(BootstrapConfig::default());
    orch.run_bootstrap(false).await.unwrap();

    let deleted: Vec<String> = h
        .mesh
        .deleted_entries("dc1")
        .iter()
        .map(|k| k.kind.clone())
        .collect();
    assert_eq!(
        deleted,
        vec![SERVICE_INTENTIONS, "service-resolver", SERVICE_DEFAULTS]
    );
}

#[tokio::test(start_paused = true)]
async fn unhealthy_mesh_hits_the_deadline() {
    let h = Harness::federation();
    h.mesh.set_check_status("dc2", "pong", "critical");
    let mut config = BootstrapConfig::default();
    config.timeouts.final_check = "30s".to_string();

    let mut orch = h.orchestrator(config);
    let err = orch.run_bootstrap(false).await.unwrap_err();
    match err {
        BootstrapError::DeadlineExceeded { deadline, detail } => {
            assert_eq!(deadline.as_secs(), 30);
            assert!(detail.contains("pong"), "{detail}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ── Peering ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn peering_bootstraps_each_cluster_and_peers_once() {
    let h = Harness::peering();
    let mut orch = h.orchestrator(BootstrapConfig::default());
    orch.run_bootstrap(false).await.unwrap();

    assert_eq!(h.mesh.count("acl_bootstrap"), 2);
    let dc1 = orch.management_token("dc1").unwrap();
    let dc2 = orch.management_token("dc2").unwrap();
    assert_ne!(dc1, dc2);
    assert_eq!(h.cache.load("management-token/dc2").unwrap(), dc2);
    assert!(h.mesh.peering("dc1", "dc2").unwrap().is_established());
    assert!(h.mesh.peering("dc2", "dc1").unwrap().is_established());
    assert!(!orch.registry().contains(&CredentialKey::replication()));

    // The consumed service is exported from and authorised in dc2.
    assert!(h.mesh.config_entry("dc2", EXPORTED_SERVICES, "default").is_some());
    let intention = h.mesh.config_entry("dc2", SERVICE_INTENTIONS, "pong").unwrap();
    assert_eq!(intention.body["Sources"][0]["Peer"], "dc1");

    h.mesh.clear_calls();
    let mut orch = h.orchestrator(BootstrapConfig::default());
    orch.run_bootstrap(false).await.unwrap();
    assert_eq!(h.mesh.count("peering_generate_token"), 0);
    assert_eq!(h.mesh.count("peering_establish"), 0);
    assert_eq!(h.mesh.count("acl_bootstrap"), 0);
}
