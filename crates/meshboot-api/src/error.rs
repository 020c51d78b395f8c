//! Control-plane client error types.

use thiserror::Error;

/// Result type alias for control-plane calls.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors returned by a control-plane call.
///
/// The control plane reports most conditions only through its error text,
/// so callers classify errors by matching on [`ApiError::message`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("transport error talking to {address}: {message}")]
    Transport { address: String, message: String },

    #[error("unexpected response code {status} from {address}: {body}")]
    Status {
        status: u16,
        address: String,
        body: String,
    },

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn transport(address: &str, message: impl Into<String>) -> Self {
        Self::Transport {
            address: address.to_string(),
            message: message.into(),
        }
    }

    pub fn status(status: u16, address: &str, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            address: address.to_string(),
            body: body.into(),
        }
    }

    /// Full error text, as matched by transient-error classifiers.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// HTTP status code, if the server answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Whether the addressed object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Status { status: 404, .. } => true,
            Self::Status { body, .. } => body.contains("ACL not found"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_detection() {
        assert!(ApiError::status(404, "10.0.0.1:8500", "").is_not_found());
        assert!(
            ApiError::status(403, "10.0.0.1:8500", "rpc error making call: ACL not found")
                .is_not_found()
        );
        assert!(!ApiError::status(500, "10.0.0.1:8500", "No cluster leader").is_not_found());
        assert!(!ApiError::transport("10.0.0.1:8500", "connection refused").is_not_found());
    }

    #[test]
    fn message_includes_body() {
        let err = ApiError::status(500, "10.0.0.1:8500", "No cluster leader");
        assert!(err.message().contains("No cluster leader"));
        assert_eq!(err.status_code(), Some(500));
    }
}
