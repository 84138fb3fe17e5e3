//! Cross-shard listing merge.
//!
//! A listing fans out to every shard and to the namespace directory, joins
//! shard items against directory entries by path, keeps only what the
//! directory says is live on its primary shard, and pages the result by
//! ordinal sort key.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use metrics::{counter, histogram};
use tracing::{debug, warn};

use super::marker::{decode_marker, encode_marker, sort_key};
use crate::config::{ListingConfig, TimeoutPolicy};
use crate::errors::ShardError;
use crate::metrics::{LISTINGS_TOTAL, LISTING_DURATION_SECONDS, SHARD_LISTINGS_SOFT_FAILED_TOTAL};
use crate::namespace::{DirectoryEntry, NamespaceDirectory};
use crate::placement::ShardSet;
use crate::storage::backend::{
    list_all, BlobItem, BlobProperties, ListInclude, ListItem, ListRequest, ObjectStore,
    StoreError,
};

/// Hard cap on page size.
pub const MAX_RESULTS_LIMIT: u32 = 5000;

/// Parameters of a merged listing.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: String,
    /// Hierarchy delimiter.  Empty is treated as none.
    pub delimiter: Option<String>,
    /// Marker from a previous page.
    pub marker: Option<String>,
    /// Page size; defaults to the configured value, capped at 5000.
    pub max_results: Option<u32>,
    pub include: ListInclude,
}

/// A live blob (or one of its snapshots) on its primary shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedBlob {
    pub name: String,
    pub snapshot: Option<String>,
    /// Primary shard holding the listed copy.
    pub shard: usize,
    pub properties: BlobProperties,
    pub metadata: std::collections::BTreeMap<String, String>,
}

/// One entry of a merged listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingEntry {
    Blob(ListedBlob),
    Prefix(String),
}

impl ListingEntry {
    fn key(&self) -> String {
        match self {
            ListingEntry::Blob(b) => sort_key(&b.name, b.snapshot.as_deref()),
            ListingEntry::Prefix(p) => sort_key(p, None),
        }
    }
}

/// One page of a merged listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub entries: Vec<ListingEntry>,
    /// Marker for the next page; `None` on the last page.
    pub next_marker: Option<String>,
}

/// Item of a shard listing tagged with its shard.
struct ShardItem {
    shard: usize,
    item: ListItem,
}

impl ShardItem {
    fn path(&self) -> &str {
        match &self.item {
            ListItem::Blob(b) => &b.name,
            ListItem::Prefix(p) => p,
        }
    }

    fn snapshot(&self) -> Option<&str> {
        match &self.item {
            ListItem::Blob(b) => b.snapshot.as_deref(),
            ListItem::Prefix(_) => None,
        }
    }
}

fn entry_path(entry: &DirectoryEntry) -> &str {
    match entry {
        DirectoryEntry::Record(r) => &r.blob_name,
        DirectoryEntry::Prefix(p) => p,
    }
}

/// Merges shard listings with the namespace directory.
pub struct ListingEngine {
    shards: Arc<ShardSet>,
    directory: Arc<NamespaceDirectory>,
    config: ListingConfig,
}

impl ListingEngine {
    pub fn new(
        shards: Arc<ShardSet>,
        directory: Arc<NamespaceDirectory>,
        config: ListingConfig,
    ) -> Self {
        Self {
            shards,
            directory,
            config,
        }
    }

    /// List one page of live blobs in `container`.
    pub async fn list(
        &self,
        container: &str,
        options: &ListOptions,
    ) -> Result<ListingPage, ShardError> {
        let start = Instant::now();
        let result = self.list_inner(container, options).await;
        histogram!(LISTING_DURATION_SECONDS).record(start.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        counter!(LISTINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn list_inner(
        &self,
        container: &str,
        options: &ListOptions,
    ) -> Result<ListingPage, ShardError> {
        let delimiter = options.delimiter.as_deref().filter(|d| !d.is_empty());
        if delimiter.is_some() && options.include.snapshots {
            return Err(ShardError::malformed(
                "Snapshots cannot be listed together with a delimiter",
            ));
        }
        let max_results = match options.max_results {
            Some(0) => {
                return Err(ShardError::malformed("maxresults must be greater than zero"));
            }
            Some(n) => n,
            None => self.config.default_max_results,
        }
        .min(MAX_RESULTS_LIMIT) as usize;
        let marker_key = options
            .marker
            .as_deref()
            .filter(|m| !m.is_empty())
            .map(|m| decode_marker(container, m))
            .transpose()?;

        let request = ListRequest {
            prefix: options.prefix.clone(),
            delimiter: delimiter.map(str::to_string),
            include: options.include,
            max_results: self.config.shard_page_size,
        };
        let timeout = self.config.timeout();

        let shard_calls = self
            .shards
            .iter()
            .map(|(index, store)| self.list_shard(index, store.as_ref(), container, &request));
        let (directory, shard_results) = tokio::join!(
            self.directory
                .list_entries(container, &options.prefix, delimiter, Some(timeout)),
            join_all(shard_calls)
        );
        let mut directory = directory?;
        let mut shard_items = Vec::new();
        for result in shard_results {
            shard_items.extend(result?);
        }

        directory.sort_by(|a, b| entry_path(a).cmp(entry_path(b)));
        shard_items.sort_by(|a, b| {
            a.path()
                .cmp(b.path())
                .then_with(|| sort_key("", a.snapshot()).cmp(&sort_key("", b.snapshot())))
                .then_with(|| a.shard.cmp(&b.shard))
        });

        let mut merged = join_with_directory(shard_items, &directory);
        merged.sort_by(|a, b| a.0.cmp(&b.0));
        merged.dedup_by(|a, b| a.0 == b.0);

        let mut entries: Vec<(String, ListingEntry)> = Vec::with_capacity(max_results + 1);
        for (key, entry) in merged {
            if let Some(marker) = &marker_key {
                if key.as_str() <= marker.as_str() {
                    continue;
                }
            }
            if let ListingEntry::Prefix(prefix) = &entry {
                if !self.prefix_is_live(container, prefix, timeout).await? {
                    debug!("Hiding {}/{}: no live records below it", container, prefix);
                    continue;
                }
            }
            entries.push((key, entry));
            if entries.len() > max_results {
                break;
            }
        }

        let next_marker = if entries.len() > max_results {
            entries.truncate(max_results);
            entries.last().map(|(key, _)| encode_marker(container, key))
        } else {
            None
        };

        Ok(ListingPage {
            entries: entries.into_iter().map(|(_, e)| e).collect(),
            next_marker,
        })
    }

    /// Fully list one shard, applying the soft-failure rules.
    async fn list_shard(
        &self,
        index: usize,
        store: &dyn ObjectStore,
        container: &str,
        request: &ListRequest,
    ) -> Result<Vec<ShardItem>, ShardError> {
        let timeout = self.config.timeout();
        match list_all(store, container, request, Some(timeout)).await {
            Ok(items) => Ok(items
                .into_iter()
                .map(|item| ShardItem { shard: index, item })
                .collect()),
            Err(StoreError::ContainerNotFound { .. }) => {
                debug!(
                    "Container {} not materialized on {}; treating as empty",
                    container,
                    store.account()
                );
                counter!(
                    SHARD_LISTINGS_SOFT_FAILED_TOTAL,
                    "account" => store.account().to_string(),
                    "reason" => "container_absent"
                )
                .increment(1);
                Ok(Vec::new())
            }
            Err(StoreError::Timeout(limit))
                if self.config.timeout_policy == TimeoutPolicy::Empty =>
            {
                warn!(
                    "Listing {} on {} timed out after {:?}; treating as empty",
                    container,
                    store.account(),
                    limit
                );
                counter!(
                    SHARD_LISTINGS_SOFT_FAILED_TOTAL,
                    "account" => store.account().to_string(),
                    "reason" => "timeout"
                )
                .increment(1);
                Ok(Vec::new())
            }
            Err(e) => Err(ShardError::backend(store.account(), e)),
        }
    }

    async fn prefix_is_live(
        &self,
        container: &str,
        prefix: &str,
        timeout: Duration,
    ) -> Result<bool, ShardError> {
        tokio::time::timeout(timeout, self.directory.has_live_records(container, prefix))
            .await
            .map_err(|_| {
                ShardError::backend(self.directory.account(), StoreError::Timeout(timeout))
            })?
    }
}

/// Join path-ordered shard items against path-ordered directory entries.
///
/// A blob survives when its record is live and names the item's shard as
/// primary.  A prefix survives when the directory holds the same prefix.
fn join_with_directory(
    shard_items: Vec<ShardItem>,
    directory: &[DirectoryEntry],
) -> Vec<(String, ListingEntry)> {
    let mut out = Vec::new();
    let mut cursor = 0;
    for shard_item in shard_items {
        let path = shard_item.path().to_string();
        while cursor < directory.len() && entry_path(&directory[cursor]) < path.as_str() {
            cursor += 1;
        }
        let group = directory[cursor..]
            .iter()
            .take_while(|e| entry_path(e) == path);

        match shard_item.item {
            ListItem::Blob(blob) => {
                let record = group.filter_map(|e| match e {
                    DirectoryEntry::Record(r) => Some(r),
                    DirectoryEntry::Prefix(_) => None,
                });
                let keep = record
                    .into_iter()
                    .any(|r| r.is_active() && r.primary_shard == shard_item.shard);
                if keep {
                    out.push(listed_blob(shard_item.shard, blob));
                }
            }
            ListItem::Prefix(prefix) => {
                if group.into_iter().any(|e| matches!(e, DirectoryEntry::Prefix(_))) {
                    out.push((sort_key(&prefix, None), ListingEntry::Prefix(prefix)));
                }
            }
        }
    }
    out
}

fn listed_blob(shard: usize, blob: BlobItem) -> (String, ListingEntry) {
    let key = sort_key(&blob.name, blob.snapshot.as_deref());
    let entry = ListingEntry::Blob(ListedBlob {
        name: blob.name,
        snapshot: blob.snapshot,
        shard,
        properties: blob.properties,
        metadata: blob.metadata,
    });
    debug_assert_eq!(entry.key(), key);
    (key, entry)
}
