//! meshboot-api: control-plane client for meshboot.
//!
//! - **`client`**: [`ControlPlane`] handle and [`ClientProvider`] factory traits
//! - **`http_client`**: hyper-based implementation over the HTTP API
//! - **`types`**: ACL, catalog, health, tenancy and peering wire types
//! - **`fake`**: in-memory multi-cluster control plane (feature `testing`)

pub mod client;
pub mod error;
pub mod http_client;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use client::{ClientProvider, ControlPlane};
pub use error::{ApiError, ApiResult};
pub use http_client::{HttpClientProvider, HttpControlPlane};
pub use types::*;
