//! redb table definitions for the membership store.

use redb::TableDefinition;

/// Member records keyed by rank, JSON-serialized.
pub const MEMBERS: TableDefinition<u32, &[u8]> = TableDefinition::new("members");

/// Scalar metadata (data version).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const DATA_VERSION_KEY: &str = "data_version";
