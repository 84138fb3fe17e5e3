//! Namespace directory: one record per logical blob naming its primary
//! shard and tombstone state.

pub mod directory;
pub mod record;

pub use directory::{DirectoryEntry, NamespaceDirectory};
pub use record::NamespaceRecord;
