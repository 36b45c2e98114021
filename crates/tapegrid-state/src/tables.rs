//! redb table definitions for the TapeGrid catalog.
//!
//! Resource tables use `{family}:{name}` keys, object tables the object id.
//! Values are JSON-serialized domain types.

use redb::TableDefinition;

/// Drives keyed by `{family}:{name}`.
pub const DEVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");

/// Media keyed by `{family}:{name}`.
pub const MEDIA: TableDefinition<&str, &[u8]> = TableDefinition::new("media");

/// Object metadata keyed by object id.
pub const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

/// Layouts (with their extents) keyed by object id.
pub const LAYOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("layouts");

/// Lock records keyed by `LockTarget::key()`.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

/// Hardware audit log keyed by a monotonically increasing sequence number.
pub const LOGS: TableDefinition<u64, &[u8]> = TableDefinition::new("logs");
