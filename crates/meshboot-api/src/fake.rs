//! In-memory control plane for tests.
//!
//! [`FakeMesh`] models just enough of a multi-cluster control plane to
//! drive the orchestrator end to end: leader election, ACL bootstrap and
//! token resolution (federation secondaries resolve through the primary),
//! agent anti-entropy, config entries, tenancy, peering and KV. Every call
//! is journaled, and faults can be injected per operation and target.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use meshboot_core::{ConfigEntry, EntryKey, LinkMode, Topology, DEFAULT_TENANCY};

use crate::client::{ClientProvider, ControlPlane};
use crate::error::{ApiError, ApiResult};
use crate::types::{
    AclPolicy, AclToken, AgentTokenKind, CatalogNode, HealthCheck, HealthNode, HealthService,
    Namespace, Partition, Peering, ServiceHealth, Tenancy,
};

/// One journaled API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: String,
    pub cluster: String,
    pub node: String,
    pub token: String,
}

#[derive(Debug, Clone)]
struct Fault {
    op: String,
    target: String,
    skip: u32,
    remaining: u32,
    error: ApiError,
}

#[derive(Debug, Clone)]
struct FakeNode {
    cluster: String,
    name: String,
    partition: String,
    address: String,
    runs_agent: bool,
    agent_tokens: BTreeMap<&'static str, String>,
}

#[derive(Debug, Clone)]
struct FakeService {
    node: String,
    name: String,
    namespace: String,
    partition: String,
    status: String,
}

#[derive(Debug, Default)]
struct ClusterState {
    leaderless_polls: u32,
    sync_delay: u32,
    bootstrapped: bool,
    tokens: Vec<AclToken>,
    policies: Vec<AclPolicy>,
    catalog: BTreeMap<String, CatalogNode>,
    pending_sync: BTreeMap<String, u32>,
    services: Vec<FakeService>,
    entries: BTreeMap<EntryKey, ConfigEntry>,
    deleted_entries: Vec<EntryKey>,
    partitions: BTreeSet<String>,
    namespaces: BTreeSet<(String, String)>,
    peerings: BTreeMap<String, Peering>,
    kv: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct MeshState {
    link_mode: LinkMode,
    primary: String,
    nodes: Vec<FakeNode>,
    clusters: BTreeMap<String, ClusterState>,
    journal: Vec<Call>,
    notes: Vec<(usize, String)>,
    faults: Vec<Fault>,
    next_id: u64,
}

impl MeshState {
    fn node_by_address(&self, address: &str) -> Option<&FakeNode> {
        self.nodes.iter().find(|n| n.address == address)
    }

    /// Cluster whose ACL store answers for `cluster`.
    fn acl_authority(&self, cluster: &str) -> String {
        match self.link_mode {
            LinkMode::Federation => self.primary.clone(),
            LinkMode::Peering => cluster.to_string(),
        }
    }

    fn cluster_mut(&mut self, cluster: &str) -> &mut ClusterState {
        self.clusters.entry(cluster.to_string()).or_default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn mark_synced(&mut self, cluster: &str, node: &str) {
        let state = self.cluster_mut(cluster);
        if let Some(entry) = state.catalog.get_mut(node) {
            if entry.tagged_addresses.is_none() {
                entry.tagged_addresses =
                    Some(BTreeMap::from([("lan".to_string(), entry.address.clone())]));
            }
        }
    }
}

fn tenancy_or_default(value: &str) -> &str {
    if value.is_empty() { DEFAULT_TENANCY } else { value }
}

fn matches_scope(filter: &str, actual: &str) -> bool {
    filter.is_empty() || filter == "*" || tenancy_or_default(filter) == tenancy_or_default(actual)
}

/// Shared handle on the fake control plane.
#[derive(Clone, Default)]
pub struct FakeMesh {
    state: Arc<Mutex<MeshState>>,
}

impl FakeMesh {
    /// Build a fresh, un-bootstrapped mesh for every cluster and node of
    /// the topology. Agents start unsynced (no tagged addresses); every
    /// bound service starts passing.
    pub fn from_topology(topology: &Topology) -> Self {
        let mut state = MeshState {
            link_mode: topology.link_mode,
            primary: topology.primary().name.clone(),
            ..Default::default()
        };

        for cluster in &topology.clusters {
            let entry = state.cluster_mut(&cluster.name);
            entry.partitions.insert(DEFAULT_TENANCY.to_string());
            entry
                .namespaces
                .insert((DEFAULT_TENANCY.to_string(), DEFAULT_TENANCY.to_string()));
        }

        for node in &topology.nodes {
            state.nodes.push(FakeNode {
                cluster: node.cluster.clone(),
                name: node.name.clone(),
                partition: node.partition().to_string(),
                address: node.api_address(topology.http_port),
                runs_agent: node.runs_agent(),
                agent_tokens: BTreeMap::new(),
            });
            let cluster = state.cluster_mut(&node.cluster);
            if node.runs_agent() {
                cluster.catalog.insert(
                    node.name.clone(),
                    CatalogNode {
                        node: node.name.clone(),
                        address: node.address.clone(),
                        datacenter: node.cluster.clone(),
                        tagged_addresses: None,
                        partition: node.partition().to_string(),
                    },
                );
            }
            if let Some(service) = &node.service {
                cluster.services.push(FakeService {
                    node: node.name.clone(),
                    name: service.id.name.clone(),
                    namespace: service.id.namespace().to_string(),
                    partition: service.id.partition().to_string(),
                    status: "passing".to_string(),
                });
            }
        }

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MeshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Scenario setup ─────────────────────────────────────────────

    /// Pre-seed a management token, as `acl.tokens.initial_management`
    /// would. Bootstrap is then no longer allowed.
    pub fn with_initial_management(self, cluster: &str, secret: &str) -> Self {
        {
            let mut state = self.lock();
            let id = state.next_id();
            let authority = state.acl_authority(cluster);
            let acl = state.cluster_mut(&authority);
            acl.bootstrapped = true;
            acl.tokens.push(management_token(id, secret));
        }
        self
    }

    /// Report no leader for the next `polls` leader queries of `cluster`.
    pub fn set_leaderless(&self, cluster: &str, polls: u32) {
        self.lock().cluster_mut(cluster).leaderless_polls = polls;
    }

    /// Agents of `cluster` post their tagged addresses only after this many
    /// catalog listings following token injection.
    pub fn set_sync_delay(&self, cluster: &str, listings: u32) {
        self.lock().cluster_mut(cluster).sync_delay = listings;
    }

    /// Fail the next `times` calls of `op` aimed at `target` (a cluster or
    /// node name) with `error`.
    pub fn fail_next(&self, op: &str, target: &str, times: u32, error: ApiError) {
        self.lock().faults.push(Fault {
            op: op.to_string(),
            target: target.to_string(),
            skip: 0,
            remaining: times,
            error,
        });
    }

    /// Let `skip` calls of `op` aimed at `target` through, then fail one.
    pub fn fail_after(&self, op: &str, target: &str, skip: u32, error: ApiError) {
        self.lock().faults.push(Fault {
            op: op.to_string(),
            target: target.to_string(),
            skip,
            remaining: 1,
            error,
        });
    }

    pub fn set_check_status(&self, cluster: &str, service: &str, status: &str) {
        let mut state = self.lock();
        for svc in state.cluster_mut(cluster).services.iter_mut() {
            if svc.name == service {
                svc.status = status.to_string();
            }
        }
    }

    pub fn insert_config_entry(&self, cluster: &str, entry: ConfigEntry) {
        self.lock()
            .cluster_mut(cluster)
            .entries
            .insert(entry.key(), entry);
    }

    pub fn add_partition(&self, cluster: &str, name: &str) {
        let mut state = self.lock();
        let c = state.cluster_mut(cluster);
        c.partitions.insert(name.to_string());
        c.namespaces
            .insert((name.to_string(), DEFAULT_TENANCY.to_string()));
    }

    // ── Journal ────────────────────────────────────────────────────

    /// Record a marker in the journal, positioned after every call so far.
    pub fn note(&self, marker: &str) {
        let mut state = self.lock();
        let at = state.journal.len();
        state.notes.push((at, marker.to_string()));
    }

    /// Journal position of the first note equal to `marker`.
    pub fn note_position(&self, marker: &str) -> Option<usize> {
        self.lock()
            .notes
            .iter()
            .find(|(_, m)| m == marker)
            .map(|(at, _)| *at)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().journal.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.lock().journal.iter().filter(|c| c.op == op).count()
    }

    pub fn count_in(&self, op: &str, cluster: &str) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|c| c.op == op && c.cluster == cluster)
            .count()
    }

    pub fn clear_calls(&self) {
        let mut state = self.lock();
        state.journal.clear();
        state.notes.clear();
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn is_bootstrapped(&self, cluster: &str) -> bool {
        let mut state = self.lock();
        let authority = state.acl_authority(cluster);
        state.cluster_mut(&authority).bootstrapped
    }

    /// Tokens resolvable in `cluster`.
    pub fn tokens(&self, cluster: &str) -> Vec<AclToken> {
        let mut state = self.lock();
        let authority = state.acl_authority(cluster);
        state.cluster_mut(&authority).tokens.clone()
    }

    pub fn token_by_description(&self, cluster: &str, description: &str) -> Option<AclToken> {
        self.tokens(cluster)
            .into_iter()
            .find(|t| t.description == description)
    }

    pub fn policies(&self, cluster: &str) -> Vec<AclPolicy> {
        let mut state = self.lock();
        let authority = state.acl_authority(cluster);
        state.cluster_mut(&authority).policies.clone()
    }

    pub fn agent_token(&self, cluster: &str, node: &str, kind: AgentTokenKind) -> Option<String> {
        self.lock()
            .nodes
            .iter()
            .find(|n| n.cluster == cluster && n.name == node)
            .and_then(|n| n.agent_tokens.get(kind.as_str()).cloned())
    }

    pub fn config_entries(&self, cluster: &str) -> Vec<ConfigEntry> {
        self.lock()
            .cluster_mut(cluster)
            .entries
            .values()
            .cloned()
            .collect()
    }

    pub fn config_entry(&self, cluster: &str, kind: &str, name: &str) -> Option<ConfigEntry> {
        self.lock()
            .cluster_mut(cluster)
            .entries
            .values()
            .find(|e| e.kind == kind && e.name == name)
            .cloned()
    }

    /// Entries deleted from `cluster`, in deletion order.
    pub fn deleted_entries(&self, cluster: &str) -> Vec<EntryKey> {
        self.lock().cluster_mut(cluster).deleted_entries.clone()
    }

    pub fn partitions(&self, cluster: &str) -> BTreeSet<String> {
        self.lock().cluster_mut(cluster).partitions.clone()
    }

    pub fn namespaces(&self, cluster: &str) -> BTreeSet<(String, String)> {
        self.lock().cluster_mut(cluster).namespaces.clone()
    }

    pub fn peering(&self, cluster: &str, peer: &str) -> Option<Peering> {
        self.lock().cluster_mut(cluster).peerings.get(peer).cloned()
    }

    pub fn kv(&self, cluster: &str, key: &str) -> Option<String> {
        self.lock().cluster_mut(cluster).kv.get(key).cloned()
    }

    /// Whether every agent of `cluster` has posted tagged addresses.
    pub fn all_synced(&self, cluster: &str) -> bool {
        self.lock()
            .cluster_mut(cluster)
            .catalog
            .values()
            .all(CatalogNode::has_tagged_addresses)
    }

    // ── Call plumbing ──────────────────────────────────────────────

    /// Journal a call and apply any matching fault. Returns the addressed
    /// node's `(cluster, node)`.
    fn enter(&self, op: &str, address: &str, token: &str) -> ApiResult<(String, String)> {
        let mut state = self.lock();
        let Some(node) = state.node_by_address(address) else {
            return Err(ApiError::transport(address, "connection refused"));
        };
        let (cluster, name) = (node.cluster.clone(), node.name.clone());
        state.journal.push(Call {
            op: op.to_string(),
            cluster: cluster.clone(),
            node: name.clone(),
            token: token.to_string(),
        });

        let fault = state.faults.iter_mut().find(|f| {
            f.op == op && f.remaining > 0 && (f.target == cluster || f.target == name)
        });
        if let Some(fault) = fault {
            if fault.skip > 0 {
                fault.skip -= 1;
            } else {
                fault.remaining -= 1;
                return Err(fault.error.clone());
            }
        }
        Ok((cluster, name))
    }
}

fn management_token(id: u64, secret: &str) -> AclToken {
    AclToken {
        accessor_id: format!("accessor-{id}"),
        secret_id: secret.to_string(),
        description: "Bootstrap Token (Global Management)".to_string(),
        policies: vec![crate::types::PolicyLink {
            id: "00000000-0000-0000-0000-000000000001".to_string(),
            name: "global-management".to_string(),
        }],
        ..Default::default()
    }
}

fn acl_not_found(address: &str) -> ApiError {
    ApiError::status(403, address, "ACL not found")
}

impl ClientProvider for FakeMesh {
    fn client(&self, address: &str, token: &str) -> Arc<dyn ControlPlane> {
        Arc::new(FakeClient {
            mesh: self.clone(),
            address: address.to_string(),
            token: token.to_string(),
        })
    }
}

/// Handle on one node of a [`FakeMesh`].
pub struct FakeClient {
    mesh: FakeMesh,
    address: String,
    token: String,
}

impl FakeClient {
    fn enter(&self, op: &str) -> ApiResult<(String, String)> {
        self.mesh.enter(op, &self.address, &self.token)
    }
}

#[async_trait]
impl ControlPlane for FakeClient {
    async fn leader(&self) -> ApiResult<String> {
        let (cluster, _) = self.enter("leader")?;
        let mut state = self.mesh.lock();
        let c = state.cluster_mut(&cluster);
        if c.leaderless_polls > 0 {
            c.leaderless_polls -= 1;
            return Ok(String::new());
        }
        let leader = state
            .nodes
            .iter()
            .find(|n| n.cluster == cluster)
            .map(|n| n.address.clone())
            .unwrap_or_default();
        Ok(leader)
    }

    async fn acl_bootstrap(&self) -> ApiResult<AclToken> {
        let (cluster, _) = self.enter("acl_bootstrap")?;
        let mut state = self.mesh.lock();
        if state.cluster_mut(&cluster).leaderless_polls > 0 {
            return Err(ApiError::status(500, &self.address, "No cluster leader"));
        }
        let id = state.next_id();
        let authority = state.acl_authority(&cluster);
        let acl = state.cluster_mut(&authority);
        if acl.bootstrapped {
            return Err(ApiError::status(
                403,
                &self.address,
                "Permission denied: ACL bootstrap no longer allowed (reset index: 1)",
            ));
        }
        acl.bootstrapped = true;
        let token = management_token(id, &format!("{authority}-management-{id}"));
        acl.tokens.push(token.clone());
        Ok(token)
    }

    async fn token_read_self(&self) -> ApiResult<AclToken> {
        let (cluster, _) = self.enter("token_read_self")?;
        let mut state = self.mesh.lock();
        let authority = state.acl_authority(&cluster);
        state
            .cluster_mut(&authority)
            .tokens
            .iter()
            .find(|t| !self.token.is_empty() && t.secret_id == self.token)
            .cloned()
            .ok_or_else(|| acl_not_found(&self.address))
    }

    async fn policy_read_by_name(
        &self,
        name: &str,
        tenancy: &Tenancy,
    ) -> ApiResult<Option<AclPolicy>> {
        let (cluster, _) = self.enter("policy_read_by_name")?;
        let mut state = self.mesh.lock();
        let authority = state.acl_authority(&cluster);
        Ok(state
            .cluster_mut(&authority)
            .policies
            .iter()
            .find(|p| p.name == name && matches_scope(&tenancy.partition, &p.partition))
            .cloned())
    }

    async fn policy_create(&self, policy: &AclPolicy) -> ApiResult<AclPolicy> {
        let (cluster, _) = self.enter("policy_create")?;
        let mut state = self.mesh.lock();
        let id = state.next_id();
        let authority = state.acl_authority(&cluster);
        let acl = state.cluster_mut(&authority);
        if acl
            .policies
            .iter()
            .any(|p| p.name == policy.name && matches_scope(&policy.partition, &p.partition))
        {
            return Err(ApiError::status(
                400,
                &self.address,
                format!("Invalid Policy: A Policy with Name {:?} already exists", policy.name),
            ));
        }
        let mut created = policy.clone();
        created.id = format!("policy-{id}");
        acl.policies.push(created.clone());
        Ok(created)
    }

    async fn policy_update(&self, policy: &AclPolicy) -> ApiResult<AclPolicy> {
        let (cluster, _) = self.enter("policy_update")?;
        let mut state = self.mesh.lock();
        let authority = state.acl_authority(&cluster);
        let acl = state.cluster_mut(&authority);
        let existing = acl
            .policies
            .iter_mut()
            .find(|p| p.id == policy.id)
            .ok_or_else(|| ApiError::status(404, &self.address, "Cannot find policy to update"))?;
        *existing = policy.clone();
        Ok(policy.clone())
    }

    async fn token_list(&self, tenancy: &Tenancy) -> ApiResult<Vec<AclToken>> {
        let (cluster, _) = self.enter("token_list")?;
        let mut state = self.mesh.lock();
        let authority = state.acl_authority(&cluster);
        Ok(state
            .cluster_mut(&authority)
            .tokens
            .iter()
            .filter(|t| matches_scope(&tenancy.partition, &t.partition))
            .cloned()
            .collect())
    }

    async fn token_create(&self, token: &AclToken) -> ApiResult<AclToken> {
        let (cluster, _) = self.enter("token_create")?;
        let mut state = self.mesh.lock();
        let id = state.next_id();
        let authority = state.acl_authority(&cluster);
        let mut created = token.clone();
        created.accessor_id = format!("accessor-{id}");
        if created.secret_id.is_empty() {
            created.secret_id = format!("{authority}-secret-{id}");
        }
        state.cluster_mut(&authority).tokens.push(created.clone());
        Ok(created)
    }

    async fn token_update(&self, token: &AclToken) -> ApiResult<AclToken> {
        let (cluster, _) = self.enter("token_update")?;
        let mut state = self.mesh.lock();
        let authority = state.acl_authority(&cluster);
        let acl = state.cluster_mut(&authority);
        let existing = acl
            .tokens
            .iter_mut()
            .find(|t| t.accessor_id == token.accessor_id)
            .ok_or_else(|| ApiError::status(403, &self.address, "ACL not found"))?;
        let secret = existing.secret_id.clone();
        *existing = token.clone();
        existing.secret_id = secret;
        Ok(existing.clone())
    }

    async fn catalog_nodes(&self, partition: &str) -> ApiResult<Vec<CatalogNode>> {
        let (cluster, _) = self.enter("catalog_nodes")?;
        let mut state = self.mesh.lock();

        let mut ready = Vec::new();
        for (node, remaining) in state.cluster_mut(&cluster).pending_sync.iter_mut() {
            if *remaining == 0 {
                ready.push(node.clone());
            } else {
                *remaining -= 1;
            }
        }
        for node in ready {
            state.cluster_mut(&cluster).pending_sync.remove(&node);
            state.mark_synced(&cluster, &node);
        }

        Ok(state
            .cluster_mut(&cluster)
            .catalog
            .values()
            .filter(|n| matches_scope(partition, &n.partition))
            .cloned()
            .collect())
    }

    async fn catalog_services(&self, tenancy: &Tenancy) -> ApiResult<BTreeMap<String, Vec<String>>> {
        let (cluster, _) = self.enter("catalog_services")?;
        let mut state = self.mesh.lock();
        Ok(state
            .cluster_mut(&cluster)
            .services
            .iter()
            .filter(|s| {
                matches_scope(&tenancy.partition, &s.partition)
                    && matches_scope(&tenancy.namespace, &s.namespace)
            })
            .map(|s| (s.name.clone(), Vec::new()))
            .collect())
    }

    async fn health_service(&self, name: &str, tenancy: &Tenancy) -> ApiResult<Vec<ServiceHealth>> {
        let (cluster, _) = self.enter("health_service")?;
        let mut state = self.mesh.lock();
        Ok(state
            .cluster_mut(&cluster)
            .services
            .iter()
            .filter(|s| {
                s.name == name
                    && matches_scope(&tenancy.partition, &s.partition)
                    && matches_scope(&tenancy.namespace, &s.namespace)
            })
            .map(|s| ServiceHealth {
                node: HealthNode {
                    node: s.node.clone(),
                },
                service: HealthService {
                    id: s.name.clone(),
                    service: s.name.clone(),
                    namespace: s.namespace.clone(),
                    partition: s.partition.clone(),
                },
                checks: vec![
                    HealthCheck {
                        check_id: "serfHealth".to_string(),
                        status: "passing".to_string(),
                        service_id: String::new(),
                    },
                    HealthCheck {
                        check_id: format!("service:{}", s.name),
                        status: s.status.clone(),
                        service_id: s.name.clone(),
                    },
                ],
            })
            .collect())
    }

    async fn config_entries_list(&self, kind: &str, tenancy: &Tenancy) -> ApiResult<Vec<ConfigEntry>> {
        let (cluster, _) = self.enter("config_entries_list")?;
        let mut state = self.mesh.lock();
        Ok(state
            .cluster_mut(&cluster)
            .entries
            .iter()
            .filter(|(key, _)| {
                key.kind == kind
                    && matches_scope(&tenancy.partition, &key.partition)
                    && matches_scope(&tenancy.namespace, &key.namespace)
            })
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn config_entry_set(&self, entry: &ConfigEntry) -> ApiResult<()> {
        let (cluster, _) = self.enter("config_entry_set")?;
        self.mesh
            .lock()
            .cluster_mut(&cluster)
            .entries
            .insert(entry.key(), entry.clone());
        Ok(())
    }

    async fn config_entry_delete(&self, kind: &str, name: &str, tenancy: &Tenancy) -> ApiResult<()> {
        let (cluster, _) = self.enter("config_entry_delete")?;
        let key = EntryKey::new(kind, name, &tenancy.namespace, &tenancy.partition);
        let mut state = self.mesh.lock();
        let c = state.cluster_mut(&cluster);
        if c.entries.remove(&key).is_some() {
            c.deleted_entries.push(key);
        }
        Ok(())
    }

    async fn partitions_list(&self) -> ApiResult<Vec<Partition>> {
        let (cluster, _) = self.enter("partitions_list")?;
        let mut state = self.mesh.lock();
        Ok(state
            .cluster_mut(&cluster)
            .partitions
            .iter()
            .map(|name| Partition {
                name: name.clone(),
                description: String::new(),
            })
            .collect())
    }

    async fn partition_create(&self, name: &str) -> ApiResult<()> {
        let (cluster, _) = self.enter("partition_create")?;
        let mut state = self.mesh.lock();
        let c = state.cluster_mut(&cluster);
        c.partitions.insert(name.to_string());
        c.namespaces
            .insert((name.to_string(), DEFAULT_TENANCY.to_string()));
        Ok(())
    }

    async fn partition_delete(&self, name: &str) -> ApiResult<()> {
        let (cluster, _) = self.enter("partition_delete")?;
        let mut state = self.mesh.lock();
        let c = state.cluster_mut(&cluster);
        c.partitions.remove(name);
        c.namespaces.retain(|(p, _)| p != name);
        Ok(())
    }

    async fn namespaces_list(&self, partition: &str) -> ApiResult<Vec<Namespace>> {
        let (cluster, _) = self.enter("namespaces_list")?;
        let mut state = self.mesh.lock();
        Ok(state
            .cluster_mut(&cluster)
            .namespaces
            .iter()
            .filter(|(p, _)| matches_scope(partition, p))
            .map(|(p, name)| Namespace {
                name: name.clone(),
                partition: p.clone(),
                description: String::new(),
            })
            .collect())
    }

    async fn namespace_create(&self, partition: &str, name: &str) -> ApiResult<()> {
        let (cluster, _) = self.enter("namespace_create")?;
        self.mesh.lock().cluster_mut(&cluster).namespaces.insert((
            tenancy_or_default(partition).to_string(),
            name.to_string(),
        ));
        Ok(())
    }

    async fn namespace_delete(&self, partition: &str, name: &str) -> ApiResult<()> {
        let (cluster, _) = self.enter("namespace_delete")?;
        self.mesh
            .lock()
            .cluster_mut(&cluster)
            .namespaces
            .remove(&(tenancy_or_default(partition).to_string(), name.to_string()));
        Ok(())
    }

    async fn peering_read(&self, peer: &str, _partition: &str) -> ApiResult<Option<Peering>> {
        let (cluster, _) = self.enter("peering_read")?;
        Ok(self
            .mesh
            .lock()
            .cluster_mut(&cluster)
            .peerings
            .get(peer)
            .cloned())
    }

    async fn peering_generate_token(&self, peer: &str, _partition: &str) -> ApiResult<String> {
        let (cluster, _) = self.enter("peering_generate_token")?;
        let mut state = self.mesh.lock();
        let id = state.next_id();
        state.cluster_mut(&cluster).peerings.insert(
            peer.to_string(),
            Peering {
                id: format!("peering-{id}"),
                name: peer.to_string(),
                state: "PENDING".to_string(),
            },
        );
        Ok(format!("{cluster}/{peer}/{id}"))
    }

    async fn peering_establish(&self, peer: &str, token: &str, _partition: &str) -> ApiResult<()> {
        let (cluster, _) = self.enter("peering_establish")?;
        let mut parts = token.splitn(3, '/');
        let (Some(dialer), Some(name), Some(_)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ApiError::status(400, &self.address, "invalid peering token"));
        };
        let (dialer, name) = (dialer.to_string(), name.to_string());

        let mut state = self.mesh.lock();
        let id = state.next_id();
        let Some(remote) = state
            .clusters
            .get_mut(&dialer)
            .and_then(|c| c.peerings.get_mut(&name))
        else {
            return Err(ApiError::status(400, &self.address, "peering token was not generated"));
        };
        remote.state = "ACTIVE".to_string();
        state.cluster_mut(&cluster).peerings.insert(
            peer.to_string(),
            Peering {
                id: format!("peering-{id}"),
                name: peer.to_string(),
                state: "ACTIVE".to_string(),
            },
        );
        Ok(())
    }

    async fn kv_put(&self, key: &str, value: &str, datacenter: Option<&str>) -> ApiResult<()> {
        let (cluster, _) = self.enter("kv_put")?;
        let mut state = self.mesh.lock();
        let target = match datacenter {
            None => cluster,
            Some(dc) if dc == cluster => cluster,
            Some(dc) if state.link_mode == LinkMode::Federation && state.clusters.contains_key(dc) => {
                dc.to_string()
            }
            Some(_) => {
                return Err(ApiError::status(500, &self.address, "No path to datacenter"));
            }
        };
        state
            .cluster_mut(&target)
            .kv
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn agent_update_token(&self, kind: AgentTokenKind, token: &str) -> ApiResult<()> {
        let (cluster, node) = self.enter("agent_update_token")?;
        let mut state = self.mesh.lock();
        let mut schedule = false;
        if let Some(entry) = state
            .nodes
            .iter_mut()
            .find(|n| n.cluster == cluster && n.name == node)
        {
            entry.agent_tokens.insert(kind.as_str(), token.to_string());
            schedule = entry.runs_agent && kind != AgentTokenKind::Replication;
        }
        if !schedule {
            return Ok(());
        }
        let delay = state.cluster_mut(&cluster).sync_delay;
        let synced = state
            .cluster_mut(&cluster)
            .catalog
            .get(&node)
            .is_some_and(CatalogNode::has_tagged_addresses);
        if synced {
            return Ok(());
        }
        if delay == 0 {
            state.mark_synced(&cluster, &node);
        } else {
            state
                .cluster_mut(&cluster)
                .pending_sync
                .entry(node)
                .or_insert(delay);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPOLOGY: &str = r#"
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

[[nodes]]
cluster = "dc2"
name = "dc2-server1"
role = "server"
address = "10.0.2.11"
"#;

    fn mesh() -> FakeMesh {
        FakeMesh::from_topology(&Topology::from_toml_str(TOPOLOGY).unwrap())
    }

    #[tokio::test]
    async fn bootstrap_is_one_time() {
        let mesh = mesh();
        let client = mesh.client("10.0.1.11:8500", "");
        let token = client.acl_bootstrap().await.unwrap();
        assert!(!token.secret_id.is_empty());

        let err = client.acl_bootstrap().await.unwrap_err();
        assert!(err.message().contains("ACL bootstrap no longer allowed"));
        assert_eq!(mesh.count("acl_bootstrap"), 2);
    }

    #[tokio::test]
    async fn secondaries_resolve_primary_tokens() {
        let mesh = mesh();
        let root = mesh
            .client("10.0.1.11:8500", "")
            .acl_bootstrap()
            .await
            .unwrap();

        let remote = mesh.client("10.0.2.11:8500", &root.secret_id);
        assert_eq!(
            remote.token_read_self().await.unwrap().accessor_id,
            root.accessor_id
        );

        let bogus = mesh.client("10.0.2.11:8500", "bogus");
        assert!(bogus.token_read_self().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn faults_apply_to_target_only() {
        let mesh = mesh();
        mesh.fail_next(
            "leader",
            "dc2",
            1,
            ApiError::status(500, "10.0.2.11:8500", "No cluster leader"),
        );
        assert!(mesh.client("10.0.1.11:8500", "").leader().await.is_ok());
        assert!(mesh.client("10.0.2.11:8500", "").leader().await.is_err());
        assert!(mesh.client("10.0.2.11:8500", "").leader().await.is_ok());
    }

    #[tokio::test]
    async fn agent_sync_follows_token_injection() {
        let mesh = mesh();
        mesh.set_sync_delay("dc1", 1);
        let agent = mesh.client("10.0.1.12:8500", "t");
        let server = mesh.client("10.0.1.11:8500", "t");

        agent
            .agent_update_token(AgentTokenKind::Agent, "agent-secret")
            .await
            .unwrap();
        let nodes = server.catalog_nodes("").await.unwrap();
        assert!(nodes.iter().all(|n| !n.has_tagged_addresses()));

        let nodes = server.catalog_nodes("").await.unwrap();
        let client = nodes.iter().find(|n| n.node == "dc1-client1").unwrap();
        assert!(client.has_tagged_addresses());
        assert_eq!(
            mesh.agent_token("dc1", "dc1-client1", AgentTokenKind::Agent)
                .as_deref(),
            Some("agent-secret")
        );
    }

    #[tokio::test]
    async fn peering_handshake_activates_both_sides() {
        let topo = TOPOLOGY.replace("link_mode = \"federation\"", "link_mode = \"peering\"");
        let mesh = FakeMesh::from_topology(&Topology::from_toml_str(&topo).unwrap());
        let dc1 = mesh.client("10.0.1.11:8500", "");
        let dc2 = mesh.client("10.0.2.11:8500", "");

        let token = dc1.peering_generate_token("dc2", "").await.unwrap();
        assert_eq!(mesh.peering("dc1", "dc2").unwrap().state, "PENDING");

        dc2.peering_establish("dc1", &token, "").await.unwrap();
        assert!(mesh.peering("dc1", "dc2").unwrap().is_established());
        assert!(mesh.peering("dc2", "dc1").unwrap().is_established());
    }

    #[tokio::test]
    async fn unknown_address_is_unreachable() {
        let mesh = mesh();
        let err = mesh.client("10.9.9.9:8500", "").leader().await.unwrap_err();
        assert!(err.is_transport());
        assert!(mesh.calls().is_empty());
    }
}
