//! meshboot-orchestrator: takes a freshly started multi-cluster control
//! plane to a secured, linked and healthy mesh.
//!
//! - **`acl`**: one-time ACL bootstrap with write-before-use persistence
//! - **`issue`**: agent, mesh-gateway, service and replication credentials,
//!   committed immediately or deferred until the target cluster accepts them
//! - **`wait`**: convergence waiters (leader, token liveness, anti-entropy,
//!   WAN KV path, final health)
//! - **`link`**: replication token push (federation) or peering handshake
//! - **`entries`**: central config entry reconciliation
//! - **`tenancy`** / **`secrets`**: partitions and namespaces, cached
//!   secrets that follow feature toggles
//! - **`orchestrator`**: the fixed step order tying it together
//!
//! Everything runs sequentially on the caller's task; waits are inline
//! fixed-interval polls.

pub mod acl;
pub mod classify;
pub mod clients;
pub mod entries;
pub mod error;
pub mod issue;
pub mod link;
pub mod orchestrator;
pub mod poll;
pub mod registry;
pub mod secrets;
pub mod tenancy;
pub mod wait;

#[cfg(test)]
mod testutil;

pub use clients::Clients;
pub use error::{BootstrapError, BootstrapResult};
pub use issue::{CommitFn, IssueResult, Issuer, Route};
pub use orchestrator::Orchestrator;
pub use registry::{CredentialKey, CredentialKind, RegistryError, TokenRegistry};
