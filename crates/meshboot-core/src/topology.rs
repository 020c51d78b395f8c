//! Topology inventory: the read-only cluster/node/service model.
//!
//! The topology is produced by an external compiler and handed to the
//! orchestrator as a TOML document. Nothing in meshboot mutates it; the
//! orchestrator only walks it in declaration order.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name used by the control plane for the implicit partition and namespace.
pub const DEFAULT_TENANCY: &str = "default";

/// Default HTTP API port of every control-plane agent.
pub const DEFAULT_HTTP_PORT: u16 = 8500;

/// Result type alias for topology operations.
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Errors raised while loading or validating a topology.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to read topology: {0}")]
    Read(String),

    #[error("failed to parse topology: {0}")]
    Parse(String),

    #[error("topology declares no clusters")]
    NoClusters,

    #[error("duplicate cluster: {0}")]
    DuplicateCluster(String),

    #[error("federation topology needs exactly one primary cluster, found {0}")]
    PrimaryCount(usize),

    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("duplicate node {node} in cluster {cluster}")]
    DuplicateNode { cluster: String, node: String },

    #[error("cluster {0} has no server nodes")]
    NoServers(String),

    #[error("invalid upstream for service {service}: {reason}")]
    InvalidUpstream { service: String, reason: String },
}

/// How the clusters of a topology are linked together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// WAN federation under one primary datacenter.
    #[default]
    Federation,
    /// Bidirectional cluster peering; every cluster is its own primary.
    Peering,
}

/// Role a node plays in its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    Server,
    Agent,
    MeshGateway,
    /// Catalog-registered proxy without a local agent process.
    RegistrationProxy,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::Server => "server",
            NodeRole::Agent => "agent",
            NodeRole::MeshGateway => "mesh-gateway",
            NodeRole::RegistrationProxy => "registration-proxy",
        };
        f.write_str(s)
    }
}

fn or_default(value: &str) -> &str {
    if value.is_empty() {
        DEFAULT_TENANCY
    } else {
        value
    }
}

// ── Services ───────────────────────────────────────────────────────

/// Fully-qualified service identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

impl ServiceId {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: String::new(),
            partition: String::new(),
        }
    }

    pub fn with_tenancy(name: &str, namespace: &str, partition: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            partition: partition.to_string(),
        }
    }

    /// Namespace, with the implicit default filled in.
    pub fn namespace(&self) -> &str {
        or_default(&self.namespace)
    }

    /// Partition, with the implicit default filled in.
    pub fn partition(&self) -> &str {
        or_default(&self.partition)
    }

    /// Stable `{partition}/{namespace}/{name}` key.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.partition(), self.namespace(), self.name)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Where an upstream lives relative to its downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamLocality<'a> {
    Local,
    Datacenter(&'a str),
    Peer(&'a str),
}

/// Upstream dependency of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    #[serde(flatten)]
    pub id: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
}

impl Upstream {
    /// Locality of the upstream. Datacenter and peer are mutually exclusive
    /// (enforced by [`Topology::validate`]).
    pub fn locality(&self) -> UpstreamLocality<'_> {
        match (&self.datacenter, &self.peer) {
            (Some(dc), _) => UpstreamLocality::Datacenter(dc),
            (None, Some(peer)) => UpstreamLocality::Peer(peer),
            (None, None) => UpstreamLocality::Local,
        }
    }
}

/// Application service bound to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    #[serde(flatten)]
    pub id: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,
}

// ── Nodes & clusters ───────────────────────────────────────────────

/// A member of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub cluster: String,
    pub name: String,
    pub role: NodeRole,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    /// Local network address (IP or hostname, no port).
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
}

impl Node {
    pub fn partition(&self) -> &str {
        or_default(&self.partition)
    }

    pub fn is_server(&self) -> bool {
        self.role == NodeRole::Server
    }

    /// Whether an agent process runs on this node (and therefore needs an
    /// agent token and performs anti-entropy sync).
    pub fn runs_agent(&self) -> bool {
        self.role != NodeRole::RegistrationProxy
    }

    /// `host:port` of the node's HTTP API.
    pub fn api_address(&self, http_port: u16) -> String {
        format!("{}:{}", self.address, http_port)
    }
}

/// A control-plane instance (a datacenter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub primary: bool,
}

/// The whole inventory: clusters, their nodes, and linking mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub link_mode: LinkMode,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    pub clusters: Vec<Cluster>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

impl Topology {
    /// Load and validate a topology TOML file.
    pub fn from_file(path: &Path) -> TopologyResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| TopologyError::Read(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a topology from TOML text.
    pub fn from_toml_str(content: &str) -> TopologyResult<Self> {
        let topology: Topology =
            toml::from_str(content).map_err(|e| TopologyError::Parse(e.to_string()))?;
        topology.validate()?;
        Ok(topology)
    }

    /// Check the structural invariants the orchestrator relies on.
    pub fn validate(&self) -> TopologyResult<()> {
        if self.clusters.is_empty() {
            return Err(TopologyError::NoClusters);
        }

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if !names.insert(cluster.name.as_str()) {
                return Err(TopologyError::DuplicateCluster(cluster.name.clone()));
            }
        }

        let primaries = self.clusters.iter().filter(|c| c.primary).count();
        match self.link_mode {
            LinkMode::Federation if primaries != 1 => {
                return Err(TopologyError::PrimaryCount(primaries));
            }
            LinkMode::Peering if primaries > 1 => {
                return Err(TopologyError::PrimaryCount(primaries));
            }
            _ => {}
        }

        let mut seen_nodes = HashSet::new();
        for node in &self.nodes {
            if !names.contains(node.cluster.as_str()) {
                return Err(TopologyError::UnknownCluster(node.cluster.clone()));
            }
            if !seen_nodes.insert((node.cluster.as_str(), node.name.as_str())) {
                return Err(TopologyError::DuplicateNode {
                    cluster: node.cluster.clone(),
                    node: node.name.clone(),
                });
            }
            if let Some(svc) = &node.service {
                self.validate_upstream(node, svc)?;
            }
        }

        for cluster in &self.clusters {
            if self.servers(&cluster.name).next().is_none() {
                return Err(TopologyError::NoServers(cluster.name.clone()));
            }
        }

        Ok(())
    }

    fn validate_upstream(&self, node: &Node, svc: &Service) -> TopologyResult<()> {
        let Some(upstream) = &svc.upstream else {
            return Ok(());
        };
        let invalid = |reason: String| TopologyError::InvalidUpstream {
            service: svc.id.key(),
            reason,
        };

        if upstream.datacenter.is_some() && upstream.peer.is_some() {
            return Err(invalid(
                "datacenter and peer are mutually exclusive".to_string(),
            ));
        }
        match upstream.locality() {
            UpstreamLocality::Local => Ok(()),
            UpstreamLocality::Datacenter(dc) => {
                if self.link_mode != LinkMode::Federation {
                    return Err(invalid("datacenter upstreams need federation".to_string()));
                }
                if self.cluster(dc).is_none() || dc == node.cluster {
                    return Err(invalid(format!("{dc} is not a remote datacenter")));
                }
                Ok(())
            }
            UpstreamLocality::Peer(peer) => {
                if self.link_mode != LinkMode::Peering {
                    return Err(invalid("peer upstreams need peering".to_string()));
                }
                if self.cluster(peer).is_none() || peer == node.cluster {
                    return Err(invalid(format!("{peer} is not a remote peer")));
                }
                Ok(())
            }
        }
    }

    // ── Clusters ───────────────────────────────────────────────────

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// The designated primary: the flagged cluster, or the first one when
    /// a peering topology flags none.
    pub fn primary(&self) -> &Cluster {
        self.clusters
            .iter()
            .find(|c| c.primary)
            .unwrap_or(&self.clusters[0])
    }

    pub fn is_primary(&self, cluster: &str) -> bool {
        self.primary().name == cluster
    }

    /// Whether the cluster owns its own ACL system. In peering mode every
    /// cluster does; in federation mode only the primary.
    pub fn is_self_primary(&self, cluster: &str) -> bool {
        match self.link_mode {
            LinkMode::Peering => true,
            LinkMode::Federation => self.is_primary(cluster),
        }
    }

    /// Every cluster except the designated primary, in declaration order.
    pub fn secondaries(&self) -> impl Iterator<Item = &Cluster> {
        let primary = self.primary().name.clone();
        self.clusters.iter().filter(move |c| c.name != primary)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn members<'a, 'c>(&'a self, cluster: &'c str) -> impl Iterator<Item = &'a Node> {
        self.nodes.iter().filter(move |n| n.cluster == cluster)
    }

    pub fn node(&self, cluster: &str, name: &str) -> Option<&Node> {
        self.members(cluster).find(|n| n.name == name)
    }

    pub fn servers<'a>(&'a self, cluster: &'a str) -> impl Iterator<Item = &'a Node> {
        self.members(cluster).filter(|n| n.is_server())
    }

    /// Address used to reach the cluster's leader: its first server.
    pub fn leader_address(&self, cluster: &str) -> TopologyResult<String> {
        self.servers(cluster)
            .next()
            .map(|n| n.api_address(self.http_port))
            .ok_or_else(|| TopologyError::NoServers(cluster.to_string()))
    }

    pub fn gateways<'a>(&'a self, cluster: &'a str) -> impl Iterator<Item = &'a Node> {
        self.members(cluster)
            .filter(|n| n.role == NodeRole::MeshGateway)
    }

    /// Nodes running an agent process.
    pub fn agents<'a>(&'a self, cluster: &'a str) -> impl Iterator<Item = &'a Node> {
        self.members(cluster).filter(|n| n.runs_agent())
    }

    /// Services bound to the cluster's nodes.
    pub fn services<'a>(&'a self, cluster: &'a str) -> impl Iterator<Item = (&'a Node, &'a Service)> {
        self.members(cluster)
            .filter_map(|n| n.service.as_ref().map(|s| (n, s)))
    }

    /// Every service of the topology with its node.
    pub fn all_services(&self) -> impl Iterator<Item = (&Node, &Service)> {
        self.nodes
            .iter()
            .filter_map(|n| n.service.as_ref().map(|s| (n, s)))
    }

    // ── Tenancy ────────────────────────────────────────────────────

    /// Partitions referenced by the cluster's nodes, services and local
    /// upstreams (including `default`).
    pub fn partitions(&self, cluster: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::from([DEFAULT_TENANCY.to_string()]);
        for node in self.members(cluster) {
            out.insert(node.partition().to_string());
        }
        for (_, svc) in self.services(cluster) {
            out.insert(svc.id.partition().to_string());
            if let Some(up) = &svc.upstream {
                if up.locality() == UpstreamLocality::Local {
                    out.insert(up.id.partition().to_string());
                }
            }
        }
        out
    }

    /// `(partition, namespace)` pairs referenced by the cluster's services
    /// and local upstreams (including `default/default`).
    pub fn namespaces(&self, cluster: &str) -> BTreeSet<(String, String)> {
        let mut out = BTreeSet::new();
        for partition in self.partitions(cluster) {
            out.insert((partition, DEFAULT_TENANCY.to_string()));
        }
        for (_, svc) in self.services(cluster) {
            out.insert((
                svc.id.partition().to_string(),
                svc.id.namespace().to_string(),
            ));
            if let Some(up) = &svc.upstream {
                if up.locality() == UpstreamLocality::Local {
                    out.insert((up.id.partition().to_string(), up.id.namespace().to_string()));
                }
            }
        }
        out
    }
}
