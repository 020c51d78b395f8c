//! Wire types for the control-plane HTTP API.
//!
//! Field names follow the API's PascalCase JSON. Only the fields the
//! orchestrator reads or writes are modelled.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ── ACL ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AclToken {
    #[serde(rename = "AccessorID", default, skip_serializing_if = "String::is_empty")]
    pub accessor_id: String,
    #[serde(rename = "SecretID", default, skip_serializing_if = "String::is_empty")]
    pub secret_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicyLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_identities: Vec<ServiceIdentity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_identities: Vec<NodeIdentity>,
    #[serde(default)]
    pub local: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyLink {
    #[serde(rename = "ID", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceIdentity {
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datacenters: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeIdentity {
    pub node_name: String,
    pub datacenter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AclPolicy {
    #[serde(rename = "ID", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

/// Which agent token slot `agent_update_token` writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentTokenKind {
    Agent,
    Replication,
}

impl AgentTokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentTokenKind::Agent => "agent",
            AgentTokenKind::Replication => "replication",
        }
    }
}

impl fmt::Display for AgentTokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Catalog & health ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogNode {
    pub node: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub datacenter: String,
    /// `null` until the node's agent has completed an anti-entropy sync.
    #[serde(default)]
    pub tagged_addresses: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

impl CatalogNode {
    pub fn has_tagged_addresses(&self) -> bool {
        self.tagged_addresses
            .as_ref()
            .is_some_and(|tagged| !tagged.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceHealth {
    pub node: HealthNode,
    pub service: HealthService,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthNode {
    pub node: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    /// `passing`, `warning`, `critical` or `maintenance`.
    pub status: String,
    #[serde(rename = "ServiceID", default)]
    pub service_id: String,
}

// ── Tenancy ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Partition {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Namespace {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(default)]
    pub description: String,
}

/// Partition/namespace scope of a request. Empty fields are omitted from
/// the query string, which is how multi-tenancy fields are scrubbed when
/// the control plane does not support them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Tenancy {
    pub partition: String,
    pub namespace: String,
}

impl Tenancy {
    /// The implicit scope (no tenancy parameters sent).
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(partition: &str, namespace: &str) -> Self {
        Self {
            partition: partition.to_string(),
            namespace: namespace.to_string(),
        }
    }

    pub fn partition(partition: &str) -> Self {
        Self::new(partition, "")
    }

    /// Query parameters for this scope.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if !self.partition.is_empty() {
            out.push(("partition", self.partition.clone()));
        }
        if !self.namespace.is_empty() {
            out.push(("ns", self.namespace.clone()));
        }
        out
    }
}

// ── Peering ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Peering {
    #[serde(rename = "ID", default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: String,
}

impl Peering {
    /// A peering that has completed (or is completing) the handshake.
    /// `PENDING` means a token was generated but never established.
    pub fn is_established(&self) -> bool {
        matches!(self.state.as_str(), "ACTIVE" | "ESTABLISHING")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct PeeringTokenRequest<'a> {
    pub peer_name: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct PeeringTokenResponse {
    pub peering_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct PeeringEstablishRequest<'a> {
    pub peer_name: &'a str,
    pub peering_token: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct AgentTokenRequest<'a> {
    pub token: &'a str,
}
