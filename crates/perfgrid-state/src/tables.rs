//! redb table definitions for the profile store.

use redb::TableDefinition;

/// Persisted worker profiles keyed by worker key (`<all>` for the aggregate).
///
/// Values are JSON-serialized [`ProfileRecord`](crate::ProfileRecord)s.
pub const PROFILES: TableDefinition<&str, &[u8]> = TableDefinition::new("profiles");
