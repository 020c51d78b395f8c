//! Config entries: kind-typed routing, defaults and intention objects.
//!
//! Entries use the control plane's own wire format (PascalCase keys), so
//! the same type is read from meshboot.toml and sent over the API. Only
//! the identifying fields are typed; everything else is kept verbatim in
//! `body`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::topology::DEFAULT_TENANCY;

pub const PROXY_DEFAULTS: &str = "proxy-defaults";
pub const SERVICE_DEFAULTS: &str = "service-defaults";
pub const SERVICE_INTENTIONS: &str = "service-intentions";
pub const SERVICE_ROUTER: &str = "service-router";
pub const SERVICE_SPLITTER: &str = "service-splitter";
pub const SERVICE_RESOLVER: &str = "service-resolver";
pub const INGRESS_GATEWAY: &str = "ingress-gateway";
pub const TERMINATING_GATEWAY: &str = "terminating-gateway";
pub const API_GATEWAY: &str = "api-gateway";
pub const EXPORTED_SERVICES: &str = "exported-services";
pub const MESH: &str = "mesh";

/// Kinds in deletion order: an entry may only reference entries of kinds
/// that come after it. Kinds not listed here are deleted first.
pub const DELETION_ORDER: &[&str] = &[
    SERVICE_INTENTIONS,
    SERVICE_ROUTER,
    SERVICE_SPLITTER,
    SERVICE_RESOLVER,
    INGRESS_GATEWAY,
    TERMINATING_GATEWAY,
    API_GATEWAY,
    EXPORTED_SERVICES,
    MESH,
    SERVICE_DEFAULTS,
    PROXY_DEFAULTS,
];

/// Position of a kind in the deletion walk.
pub fn deletion_rank(kind: &str) -> usize {
    DELETION_ORDER
        .iter()
        .position(|k| *k == kind)
        .map(|i| i + 1)
        .unwrap_or(0)
}

/// A single config entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    #[serde(rename = "Kind")]
    pub kind: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Namespace", default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(rename = "Partition", default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ConfigEntry {
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: String::new(),
            partition: String::new(),
            body: Map::new(),
        }
    }

    pub fn with_tenancy(mut self, namespace: &str, partition: &str) -> Self {
        self.namespace = namespace.to_string();
        self.partition = partition.to_string();
        self
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.body.insert(key.to_string(), value);
        self
    }

    pub fn key(&self) -> EntryKey {
        EntryKey::new(&self.kind, &self.name, &self.namespace, &self.partition)
    }

    /// Strip enterprise-only tenancy fields, including those nested in
    /// intention sources and exported-service consumers.
    pub fn scrub_tenancy(&mut self) {
        self.namespace.clear();
        self.partition.clear();
        for list in ["Sources", "Services"] {
            if let Some(Value::Array(items)) = self.body.get_mut(list) {
                for item in items {
                    if let Value::Object(obj) = item {
                        obj.remove("Namespace");
                        obj.remove("Partition");
                    }
                }
            }
        }
    }
}

/// Identity of a config entry. Empty tenancy is normalized to `default`
/// so observed and desired entries compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub partition: String,
}

impl EntryKey {
    pub fn new(kind: &str, name: &str, namespace: &str, partition: &str) -> Self {
        let norm = |s: &str| {
            if s.is_empty() {
                DEFAULT_TENANCY.to_string()
            } else {
                s.to_string()
            }
        };
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: norm(namespace),
            partition: norm(partition),
        }
    }

    /// Sort key for deletion: kind rank, then tenancy, then name.
    pub fn deletion_sort_key(&self) -> (usize, &str, &str, &str, &str) {
        (
            deletion_rank(&self.kind),
            &self.kind,
            &self.partition,
            &self.namespace,
            &self.name,
        )
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.kind, self.partition, self.namespace, self.name
        )
    }
}
