//! meshboot-core: shared model for the meshboot orchestrator.
//!
//! - **`topology`**: clusters, nodes and services produced by the
//!   topology compiler (read-only to the orchestrator)
//! - **`config`**: `meshboot.toml`: enabled security features, tenancy,
//!   mesh defaults, deadlines and user config entries
//! - **`entry`**: config-entry wire model and kind deletion order

pub mod config;
pub mod entry;
pub mod topology;

pub use config::{BootstrapConfig, ConfigError, ConfigResult, MAX_FINAL_CHECK};
pub use entry::{ConfigEntry, EntryKey};
pub use topology::*;
