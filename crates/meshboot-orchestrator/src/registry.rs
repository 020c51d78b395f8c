//! Token registry: secrets issued during one run.
//!
//! Later phases look up what earlier phases issued (agent tokens for
//! anti-entropy injection, the replication token for federation). A key
//! is written exactly once per run, and a lookup of a key that was never
//! written means the phases ran out of order: both are defects, reported
//! with the full (redacted) registry contents.

use std::collections::BTreeMap;
use std::fmt;

use meshboot_core::ServiceId;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("credential {key} registered twice")]
    Duplicate { key: String },

    #[error("credential {key} is not registered; registry holds [{registered}]")]
    Missing { key: String, registered: String },
}

/// Kind of credential issued during bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CredentialKind {
    Agent,
    MeshGateway,
    Service,
    Replication,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CredentialKind::Agent => "agent",
            CredentialKind::MeshGateway => "mesh-gateway",
            CredentialKind::Service => "service",
            CredentialKind::Replication => "replication",
        };
        f.write_str(s)
    }
}

/// `(kind, scope)` identity of a registered credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialKey {
    pub kind: CredentialKind,
    pub scope: String,
}

impl CredentialKey {
    pub fn agent(cluster: &str, node: &str) -> Self {
        Self {
            kind: CredentialKind::Agent,
            scope: format!("{cluster}/{node}"),
        }
    }

    pub fn mesh_gateway(cluster: &str) -> Self {
        Self {
            kind: CredentialKind::MeshGateway,
            scope: cluster.to_string(),
        }
    }

    pub fn service(cluster: &str, service: &ServiceId) -> Self {
        Self {
            kind: CredentialKind::Service,
            scope: format!("{cluster}/{}", service.key()),
        }
    }

    pub fn replication() -> Self {
        Self {
            kind: CredentialKind::Replication,
            scope: String::new(),
        }
    }

    /// Name of the cached secret holding this credential.
    pub fn cache_name(&self) -> String {
        match self.kind {
            CredentialKind::Agent => format!("agent-token/{}", self.scope),
            CredentialKind::MeshGateway => format!("mesh-gateway-token/{}", self.scope),
            CredentialKind::Service => format!("service-token/{}", self.scope),
            CredentialKind::Replication => "replication-token".to_string(),
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}:{}", self.kind, self.scope)
        }
    }
}

/// In-memory map of issued credentials, owned by one orchestrator run.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TokenRegistry {
    entries: BTreeMap<CredentialKey, String>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret. A second write for the same key is a defect.
    pub fn insert(&mut self, key: CredentialKey, secret: String) -> Result<(), RegistryError> {
        if self.entries.contains_key(&key) {
            return Err(RegistryError::Duplicate {
                key: key.to_string(),
            });
        }
        self.entries.insert(key, secret);
        Ok(())
    }

    /// Look up a secret that an earlier phase must have registered.
    pub fn get(&self, key: &CredentialKey) -> Result<&str, RegistryError> {
        self.entries
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| RegistryError::Missing {
                key: key.to_string(),
                registered: self.dump(),
            })
    }

    pub fn contains(&self, key: &CredentialKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CredentialKey> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CredentialKey, &str)> {
        self.entries.iter().map(|(k, v)| (k, v.as_str()))
    }

    /// Registered keys with secrets redacted.
    fn dump(&self) -> String {
        self.entries
            .keys()
            .map(|k| format!("{k}=<redacted>"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Debug for TokenRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRegistry")
            .field("entries", &format_args!("[{}]", self.dump()))
            .finish()
    }
}
