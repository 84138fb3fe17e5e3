//! Deterministic placement of blob names onto shards.
//!
//! The hash fold below is part of the on-disk contract of a deployment:
//! changing the digest, the windows or their byte order would move every
//! blob created afterwards to a different shard than existing records.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::storage::backend::ObjectStore;

/// Map `blob_name` to a shard index in `[0, shard_count)`.
///
/// SHA-256 of the UTF-8 name, folded to 64 bits by XOR-ing the
/// little-endian `i64` windows at bytes 0..8, 8..16 and 24..32, then the
/// absolute value modulo `shard_count`.
///
/// `shard_count` must be non-zero.
pub fn resolve_shard(blob_name: &str, shard_count: usize) -> usize {
    debug_assert!(shard_count > 0, "shard_count must be positive");
    let digest = Sha256::digest(blob_name.as_bytes());
    let window = |offset: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[offset..offset + 8]);
        i64::from_le_bytes(bytes)
    };
    let folded = window(0) ^ window(8) ^ window(24);
    (folded.unsigned_abs() % shard_count as u64) as usize
}

/// The ordered, immutable list of data shards.
///
/// Shard indexes are positions in this list; records persist the account
/// name and map it back through [`ShardSet::index_of`].
pub struct ShardSet {
    shards: Vec<Arc<dyn ObjectStore>>,
}

impl ShardSet {
    /// Build a shard set.  Fails on an empty list or duplicate accounts.
    pub fn new(shards: Vec<Arc<dyn ObjectStore>>) -> anyhow::Result<Self> {
        if shards.is_empty() {
            anyhow::bail!("at least one shard must be configured");
        }
        for (i, shard) in shards.iter().enumerate() {
            if shards[..i].iter().any(|s| s.account() == shard.account()) {
                anyhow::bail!("duplicate shard account: {}", shard.account());
            }
        }
        Ok(Self { shards })
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn ObjectStore>> {
        self.shards.get(index)
    }

    /// Position of the shard backed by `account`.
    pub fn index_of(&self, account: &str) -> Option<usize> {
        self.shards.iter().position(|s| s.account() == account)
    }

    /// Shard index a new blob with this name is placed on.
    pub fn resolve(&self, blob_name: &str) -> usize {
        resolve_shard(blob_name, self.shards.len())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<dyn ObjectStore>)> {
        self.shards.iter().enumerate()
    }
}
