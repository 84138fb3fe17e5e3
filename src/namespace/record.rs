//! Namespace record type and its metadata encoding.
//!
//! A record is persisted as a zero-byte blob on the namespace account, in a
//! container with the same name as the logical container and under the same
//! blob name.  Fixed fields travel as metadata:
//!
//! | key               | value                                    |
//! |-------------------|------------------------------------------|
//! | `primary_account` | account name of the primary shard        |
//! | `container`       | logical container                        |
//! | `blob_name`       | percent-encoded logical blob name        |
//! | `tombstoned`      | `true` / `false`                         |
//! | `user_<key>`      | user metadata of the logical blob        |
//!
//! The account name rather than the shard index is stored so a record keeps
//! naming the same account if the shard list is ever reordered.  The
//! `container` and `blob_name` entries must agree with where the record was
//! found; a record that disagrees was copied or restored to the wrong place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::errors::ShardError;
use crate::placement::ShardSet;
use crate::storage::backend::BlobAttributes;

pub(crate) const PRIMARY_ACCOUNT_KEY: &str = "primary_account";
pub(crate) const CONTAINER_KEY: &str = "container";
pub(crate) const BLOB_NAME_KEY: &str = "blob_name";
pub(crate) const TOMBSTONED_KEY: &str = "tombstoned";
pub(crate) const USER_META_PREFIX: &str = "user_";

/// Metadata values must be plain ASCII.
const METADATA_VALUE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Where a logical blob lives and whether it is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceRecord {
    pub container: String,
    pub blob_name: String,
    /// Index into the [`ShardSet`].
    pub primary_shard: usize,
    pub tombstoned: bool,
    /// Version token of the persisted record; `None` until first written.
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    /// User metadata of the logical blob.
    pub metadata: BTreeMap<String, String>,
}

impl NamespaceRecord {
    /// A new, not yet persisted, active record.
    pub fn new(container: &str, blob_name: &str, primary_shard: usize) -> Self {
        Self {
            container: container.to_string(),
            blob_name: blob_name.to_string(),
            primary_shard,
            tombstoned: false,
            etag: None,
            last_modified: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.tombstoned
    }

    /// Encode the record as blob metadata.
    pub(crate) fn to_metadata(
        &self,
        shards: &ShardSet,
    ) -> Result<BTreeMap<String, String>, ShardError> {
        let account = shards.get(self.primary_shard).ok_or_else(|| {
            anyhow::anyhow!(
                "record {}/{} names shard {} outside the shard set",
                self.container,
                self.blob_name,
                self.primary_shard
            )
        })?;
        let mut out = BTreeMap::new();
        out.insert(PRIMARY_ACCOUNT_KEY.to_string(), account.account().to_string());
        out.insert(CONTAINER_KEY.to_string(), self.container.clone());
        out.insert(
            BLOB_NAME_KEY.to_string(),
            utf8_percent_encode(&self.blob_name, METADATA_VALUE_ENCODE_SET).to_string(),
        );
        out.insert(TOMBSTONED_KEY.to_string(), self.tombstoned.to_string());
        for (k, v) in &self.metadata {
            out.insert(format!("{USER_META_PREFIX}{k}"), v.clone());
        }
        Ok(out)
    }

    /// Decode a record from the attributes of its backing blob.
    pub(crate) fn from_attributes(
        container: &str,
        blob_name: &str,
        attrs: &BlobAttributes,
        shards: &ShardSet,
    ) -> Result<Self, ShardError> {
        let account = attrs.metadata.get(PRIMARY_ACCOUNT_KEY).ok_or_else(|| {
            anyhow::anyhow!("namespace record {container}/{blob_name} has no primary account")
        })?;
        if let Some(stored) = attrs.metadata.get(CONTAINER_KEY) {
            if stored != container {
                return Err(anyhow::anyhow!(
                    "namespace record {container}/{blob_name} belongs to container {stored}"
                )
                .into());
            }
        }
        if let Some(stored) = attrs.metadata.get(BLOB_NAME_KEY) {
            if decode_blob_name(stored).as_deref() != Some(blob_name) {
                return Err(anyhow::anyhow!(
                    "namespace record {container}/{blob_name} describes blob {stored}"
                )
                .into());
            }
        }
        let primary_shard = shards.index_of(account).ok_or_else(|| {
            anyhow::anyhow!(
                "namespace record {container}/{blob_name} names unknown account {account}"
            )
        })?;
        let tombstoned = attrs
            .metadata
            .get(TOMBSTONED_KEY)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let metadata = attrs
            .metadata
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(USER_META_PREFIX)
                    .map(|key| (key.to_string(), v.clone()))
            })
            .collect();

        Ok(Self {
            container: container.to_string(),
            blob_name: blob_name.to_string(),
            primary_shard,
            tombstoned,
            etag: Some(attrs.properties.etag.clone()),
            last_modified: Some(attrs.properties.last_modified),
            metadata,
        })
    }
}

/// Tombstone flag as carried in listing metadata.
pub(crate) fn metadata_tombstoned(metadata: &BTreeMap<String, String>) -> bool {
    metadata
        .get(TOMBSTONED_KEY)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Decode the `blob_name` metadata value.
pub(crate) fn decode_blob_name(value: &str) -> Option<String> {
    percent_decode_str(value)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}
