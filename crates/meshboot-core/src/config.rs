//! meshboot.toml configuration parser.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entry::ConfigEntry;
use crate::topology::{LinkMode, Topology};

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub tenancy: TenancyConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// User-defined config entries, keyed by cluster name.
    #[serde(default)]
    pub config_entries: BTreeMap<String, Vec<ConfigEntry>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "enabled")]
    pub acls: bool,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub gossip_encryption: bool,
    #[serde(default)]
    pub kubernetes_auth: bool,
    /// Pre-seeded management token (`acl.tokens.initial_management`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_management_token: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            acls: true,
            tls: false,
            gossip_encryption: false,
            kubernetes_auth: false,
            initial_management_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenancyConfig {
    /// Admin partitions and namespaces (enterprise only).
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Write an allow intention for every upstream/downstream pair.
    #[serde(default = "enabled")]
    pub default_intentions: bool,
    /// Expose envoy metrics through proxy-defaults.
    #[serde(default)]
    pub prometheus: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            default_intentions: true,
            prometheus: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Deadline for the final whole-topology health check (e.g. "10m").
    #[serde(default = "default_final_check")]
    pub final_check: String,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            final_check: default_final_check(),
        }
    }
}

/// Longest accepted final health-check deadline.
pub const MAX_FINAL_CHECK: Duration = Duration::from_secs(7 * 24 * 3600);

impl TimeoutConfig {
    pub fn final_check(&self) -> ConfigResult<Duration> {
        let budget = parse_duration(&self.final_check).ok_or_else(|| {
            ConfigError::Invalid(format!("bad final_check duration {:?}", self.final_check))
        })?;
        if budget > MAX_FINAL_CHECK {
            return Err(ConfigError::Invalid(format!(
                "final_check {:?} exceeds the {}h limit",
                self.final_check,
                MAX_FINAL_CHECK.as_secs() / 3600
            )));
        }
        Ok(budget)
    }
}

fn enabled() -> bool {
    true
}

fn default_final_check() -> String {
    "10m".to_string()
}

impl BootstrapConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check the invariants that span config and topology.
    pub fn validate(&self, topology: &Topology) -> ConfigResult<()> {
        if self.security.kubernetes_auth && topology.link_mode == LinkMode::Peering {
            return Err(ConfigError::Invalid(
                "kubernetes auth and peering cannot be enabled together".to_string(),
            ));
        }

        self.timeouts.final_check()?;

        for (cluster, entries) in &self.config_entries {
            if topology.cluster(cluster).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "config entries for unknown cluster {cluster}"
                )));
            }
            if topology.link_mode == LinkMode::Federation
                && !topology.is_primary(cluster)
                && !entries.is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "config entries for {cluster} must be written to the primary; they replicate"
                )));
            }
            for entry in entries {
                if entry.kind.is_empty() || entry.name.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "config entry in {cluster} needs Kind and Name"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Parse a duration string like "5s", "500ms", "1m". Values that do not
/// fit in a `u64` of seconds are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
