//! redb table definitions for the credential cache.

use redb::TableDefinition;

/// Secrets keyed by their fixed cache name (e.g. `management-token/dc1`).
pub const SECRETS: TableDefinition<&str, &str> = TableDefinition::new("secrets");
