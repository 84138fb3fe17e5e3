//! Merged, paginated listings across all shards.

pub mod engine;
pub mod marker;

pub use engine::{ListOptions, ListedBlob, ListingEngine, ListingEntry, ListingPage};
