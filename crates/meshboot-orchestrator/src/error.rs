//! Orchestrator error types.

use std::time::Duration;

use meshboot_api::ApiError;
use meshboot_cache::CacheError;
use meshboot_core::{ConfigError, TopologyError};
use thiserror::Error;

use crate::registry::RegistryError;

/// Errors that abort a bootstrap run.
///
/// There is no partial rollback: re-running the bootstrap is the recovery
/// path, and every step is idempotent.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("{context}: {source}")]
    Api {
        context: String,
        #[source]
        source: ApiError,
    },

    #[error("{context}: {source}")]
    Cache {
        context: String,
        #[source]
        source: CacheError,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("token registry defect: {0}")]
    Registry(#[from] RegistryError),

    #[error("mesh did not become healthy within {deadline:?}: {detail}")]
    DeadlineExceeded { deadline: Duration, detail: String },
}

pub type BootstrapResult<T> = Result<T, BootstrapError>;

impl BootstrapError {
    pub fn api(context: impl Into<String>, source: ApiError) -> Self {
        Self::Api {
            context: context.into(),
            source,
        }
    }

    pub fn cache(context: impl Into<String>, source: CacheError) -> Self {
        Self::Cache {
            context: context.into(),
            source,
        }
    }
}

/// Attach phase context to collaborator errors.
pub trait ResultExt<T> {
    fn context<C: Into<String>>(self, context: impl FnOnce() -> C) -> BootstrapResult<T>;
}

impl<T> ResultExt<T> for Result<T, ApiError> {
    fn context<C: Into<String>>(self, context: impl FnOnce() -> C) -> BootstrapResult<T> {
        self.map_err(|e| BootstrapError::api(context(), e))
    }
}

impl<T> ResultExt<T> for Result<T, CacheError> {
    fn context<C: Into<String>>(self, context: impl FnOnce() -> C) -> BootstrapResult<T> {
        self.map_err(|e| BootstrapError::cache(context(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_context_is_prefixed() {
        let result: Result<(), ApiError> =
            Err(ApiError::status(500, "10.0.1.11:8500", "Permission denied"));
        let err = result
            .context(|| "create agent tokens in dc1")
            .unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("create agent tokens in dc1: "));
        assert!(text.contains("Permission denied"));
    }
}
