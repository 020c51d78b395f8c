//! Control-plane client traits.
//!
//! Every other component talks to the control plane through
//! [`ClientProvider`]: it hands out a [`ControlPlane`] handle bound to one
//! address and one token, and never lets callers build clients directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use meshboot_core::ConfigEntry;

use crate::error::ApiResult;
use crate::types::{
    AclPolicy, AclToken, AgentTokenKind, CatalogNode, Namespace, Partition, Peering,
    ServiceHealth, Tenancy,
};

/// Operations against one control-plane node.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    // ── Status ─────────────────────────────────────────────────────

    /// Current leader address, or `""` while no leader is elected.
    async fn leader(&self) -> ApiResult<String>;

    // ── ACL ────────────────────────────────────────────────────────

    /// One-time ACL bootstrap; returns the management token.
    async fn acl_bootstrap(&self) -> ApiResult<AclToken>;

    /// Read the token this handle authenticates with.
    async fn token_read_self(&self) -> ApiResult<AclToken>;

    async fn policy_read_by_name(
        &self,
        name: &str,
        tenancy: &Tenancy,
    ) -> ApiResult<Option<AclPolicy>>;

    async fn policy_create(&self, policy: &AclPolicy) -> ApiResult<AclPolicy>;

    async fn policy_update(&self, policy: &AclPolicy) -> ApiResult<AclPolicy>;

    async fn token_list(&self, tenancy: &Tenancy) -> ApiResult<Vec<AclToken>>;

    async fn token_create(&self, token: &AclToken) -> ApiResult<AclToken>;

    async fn token_update(&self, token: &AclToken) -> ApiResult<AclToken>;

    // ── Catalog & health ───────────────────────────────────────────

    async fn catalog_nodes(&self, partition: &str) -> ApiResult<Vec<CatalogNode>>;

    /// Service names to tags.
    async fn catalog_services(&self, tenancy: &Tenancy) -> ApiResult<BTreeMap<String, Vec<String>>>;

    async fn health_service(&self, name: &str, tenancy: &Tenancy) -> ApiResult<Vec<ServiceHealth>>;

    // ── Config entries ─────────────────────────────────────────────

    async fn config_entries_list(&self, kind: &str, tenancy: &Tenancy) -> ApiResult<Vec<ConfigEntry>>;

    async fn config_entry_set(&self, entry: &ConfigEntry) -> ApiResult<()>;

    async fn config_entry_delete(&self, kind: &str, name: &str, tenancy: &Tenancy) -> ApiResult<()>;

    // ── Tenancy ────────────────────────────────────────────────────

    async fn partitions_list(&self) -> ApiResult<Vec<Partition>>;

    async fn partition_create(&self, name: &str) -> ApiResult<()>;

    async fn partition_delete(&self, name: &str) -> ApiResult<()>;

    async fn namespaces_list(&self, partition: &str) -> ApiResult<Vec<Namespace>>;

    async fn namespace_create(&self, partition: &str, name: &str) -> ApiResult<()>;

    async fn namespace_delete(&self, partition: &str, name: &str) -> ApiResult<()>;

    // ── Peering ────────────────────────────────────────────────────

    async fn peering_read(&self, peer: &str, partition: &str) -> ApiResult<Option<Peering>>;

    /// Generate a peering token for `peer` to establish with.
    async fn peering_generate_token(&self, peer: &str, partition: &str) -> ApiResult<String>;

    async fn peering_establish(&self, peer: &str, token: &str, partition: &str) -> ApiResult<()>;

    // ── KV ─────────────────────────────────────────────────────────

    /// Write a key, optionally routed to a remote datacenter.
    async fn kv_put(&self, key: &str, value: &str, datacenter: Option<&str>) -> ApiResult<()>;

    // ── Agent ──────────────────────────────────────────────────────

    /// Set one of the token slots of the agent behind this address.
    async fn agent_update_token(&self, kind: AgentTokenKind, token: &str) -> ApiResult<()>;
}

/// Hands out authenticated control-plane handles.
pub trait ClientProvider: Send + Sync {
    fn client(&self, address: &str, token: &str) -> Arc<dyn ControlPlane>;
}
