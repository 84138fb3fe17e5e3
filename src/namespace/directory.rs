//! CAS-protected namespace directory.
//!
//! Every mutation reads the record's ETag and writes conditionally on it.
//! A lost race is retried a bounded number of times and then surfaces as
//! [`ShardError::Conflict`]; nothing is ever locked and nothing is ever
//! overwritten blindly.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use rand::Rng;
use tracing::{debug, info};

use super::record::NamespaceRecord;
use crate::errors::ShardError;
use crate::metrics::CAS_CONFLICTS_TOTAL;
use crate::placement::ShardSet;
use crate::storage::backend::{
    list_all, BlobAttributes, ListInclude, ListItem, ListRequest, ObjectStore, StoreError,
    WriteCondition,
};

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEntry {
    Record(NamespaceRecord),
    /// A hierarchy node produced by a delimiter.
    Prefix(String),
}

/// Namespace directory over a dedicated account.
pub struct NamespaceDirectory {
    store: Arc<dyn ObjectStore>,
    shards: Arc<ShardSet>,
    cas_retries: u32,
}

impl NamespaceDirectory {
    pub fn new(store: Arc<dyn ObjectStore>, shards: Arc<ShardSet>, cas_retries: u32) -> Self {
        Self {
            store,
            shards,
            cas_retries: cas_retries.max(1),
        }
    }

    pub fn shards(&self) -> &Arc<ShardSet> {
        &self.shards
    }

    /// Account holding the records.
    pub fn account(&self) -> &str {
        self.store.account()
    }

    /// Fetch the record for a blob, tombstoned or not.
    ///
    /// Snapshots share the record of their base blob, so `snapshot` does not
    /// select a different record.
    pub async fn fetch(
        &self,
        container: &str,
        blob: &str,
        _snapshot: Option<&str>,
    ) -> Result<Option<NamespaceRecord>, ShardError> {
        let attrs = self
            .store
            .fetch_attributes(container, blob, None)
            .await
            .or_else(|e| match e {
                StoreError::ContainerNotFound { .. } | StoreError::BlobNotFound { .. } => Ok(None),
                other => Err(ShardError::backend(self.store.account(), other)),
            })?;
        attrs
            .map(|a| NamespaceRecord::from_attributes(container, blob, &a, &self.shards))
            .transpose()
    }

    /// Fetch the record only if it is not tombstoned.
    pub async fn fetch_active(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<Option<NamespaceRecord>, ShardError> {
        Ok(self
            .fetch(container, blob, None)
            .await?
            .filter(NamespaceRecord::is_active))
    }

    /// Return the active record for a blob, creating it if needed.
    ///
    /// A new record is placed with [`ShardSet::resolve`].  A tombstoned
    /// record is revived on the shard it already names.
    pub async fn create_if_absent(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<NamespaceRecord, ShardError> {
        self.create_if_absent_at(container, blob, None).await
    }

    /// Like [`create_if_absent`](Self::create_if_absent), placing a brand
    /// new record on `placement` instead of the resolved shard.
    pub async fn create_if_absent_at(
        &self,
        container: &str,
        blob: &str,
        placement: Option<usize>,
    ) -> Result<NamespaceRecord, ShardError> {
        for attempt in 1..=self.cas_retries {
            match self.fetch(container, blob, None).await? {
                Some(record) if record.is_active() => return Ok(record),
                Some(mut record) => {
                    record.tombstoned = false;
                    record.metadata.clear();
                    match self.save(&record).await {
                        Ok(revived) => {
                            info!(
                                "Revived {}/{} on shard {}",
                                container, blob, revived.primary_shard
                            );
                            return Ok(revived);
                        }
                        Err(ShardError::Conflict { .. }) => {
                            self.note_conflict("revive", attempt).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => {
                    let shard = placement.unwrap_or_else(|| self.shards.resolve(blob));
                    let record = NamespaceRecord::new(container, blob, shard);
                    match self.insert(&record).await {
                        Ok(created) => {
                            debug!("Created record {}/{} on shard {}", container, blob, shard);
                            return Ok(created);
                        }
                        // Lost the creation race: the next fetch returns the winner.
                        Err(ShardError::Conflict { .. }) => {
                            counter!(CAS_CONFLICTS_TOTAL, "operation" => "create").increment(1);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        // The last attempt may have lost to a writer that has since landed.
        match self.fetch(container, blob, None).await? {
            Some(record) if record.is_active() => Ok(record),
            _ => Err(self.conflict(container, blob)),
        }
    }

    /// Write `record` conditionally on the ETag it was read with.
    ///
    /// Returns the record with its new ETag, or `Conflict` when the stored
    /// record changed (or vanished) since it was read.
    pub async fn save(&self, record: &NamespaceRecord) -> Result<NamespaceRecord, ShardError> {
        let Some(etag) = record.etag.as_deref() else {
            return self.insert(record).await;
        };
        let metadata = record.to_metadata(&self.shards)?;
        match self
            .store
            .set_metadata(&record.container, &record.blob_name, metadata, Some(etag))
            .await
        {
            Ok(ack) => {
                let mut saved = record.clone();
                saved.etag = Some(ack.etag);
                saved.last_modified = Some(ack.last_modified);
                Ok(saved)
            }
            Err(
                StoreError::PreconditionFailed { .. }
                | StoreError::BlobNotFound { .. }
                | StoreError::ContainerNotFound { .. },
            ) => Err(ShardError::Conflict {
                container: record.container.clone(),
                blob: record.blob_name.clone(),
                attempts: 1,
            }),
            Err(e) => Err(ShardError::backend(self.store.account(), e)),
        }
    }

    /// Read-modify-write a record under CAS.
    ///
    /// `mutate` returns `false` when the record needs no change.  Returns
    /// `None` if no record exists.
    pub async fn update<F>(
        &self,
        container: &str,
        blob: &str,
        mut mutate: F,
    ) -> Result<Option<NamespaceRecord>, ShardError>
    where
        F: FnMut(&mut NamespaceRecord) -> bool + Send,
    {
        for attempt in 1..=self.cas_retries {
            let Some(mut record) = self.fetch(container, blob, None).await? else {
                return Ok(None);
            };
            if !mutate(&mut record) {
                return Ok(Some(record));
            }
            match self.save(&record).await {
                Ok(saved) => return Ok(Some(saved)),
                Err(ShardError::Conflict { .. }) => self.note_conflict("update", attempt).await,
                Err(e) => return Err(e),
            }
        }
        Err(self.conflict(container, blob))
    }

    /// Tombstone a record.  Already tombstoned records are returned as-is.
    pub async fn mark_tombstoned(
        &self,
        record: &NamespaceRecord,
    ) -> Result<Option<NamespaceRecord>, ShardError> {
        self.update(&record.container, &record.blob_name, |r| {
            if r.tombstoned {
                false
            } else {
                r.tombstoned = true;
                true
            }
        })
        .await
    }

    /// List records and hierarchy prefixes under `prefix`, in name order.
    pub async fn list_entries(
        &self,
        container: &str,
        prefix: &str,
        delimiter: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Vec<DirectoryEntry>, ShardError> {
        let request = ListRequest {
            prefix: prefix.to_string(),
            delimiter: delimiter.map(str::to_string),
            include: ListInclude {
                snapshots: false,
                metadata: true,
            },
            max_results: None,
        };
        let items = match list_all(self.store.as_ref(), container, &request, timeout).await {
            Ok(items) => items,
            Err(StoreError::ContainerNotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(ShardError::backend(self.store.account(), e)),
        };

        items
            .into_iter()
            .filter_map(|item| match item {
                ListItem::Prefix(p) => Some(Ok(DirectoryEntry::Prefix(p))),
                ListItem::Blob(b) if b.snapshot.is_none() => {
                    let attrs = BlobAttributes {
                        properties: b.properties,
                        metadata: b.metadata,
                    };
                    Some(
                        NamespaceRecord::from_attributes(container, &b.name, &attrs, &self.shards)
                            .map(DirectoryEntry::Record),
                    )
                }
                ListItem::Blob(_) => None,
            })
            .collect()
    }

    /// Whether any non-tombstoned record exists under `prefix`.
    ///
    /// Stops at the first live record found.
    pub async fn has_live_records(
        &self,
        container: &str,
        prefix: &str,
    ) -> Result<bool, ShardError> {
        let request = ListRequest {
            prefix: prefix.to_string(),
            delimiter: None,
            include: ListInclude {
                snapshots: false,
                metadata: true,
            },
            max_results: None,
        };
        let mut token: Option<String> = None;
        loop {
            let segment = match self
                .store
                .list_segmented(container, &request, token.as_deref())
                .await
            {
                Ok(segment) => segment,
                Err(StoreError::ContainerNotFound { .. }) => return Ok(false),
                Err(e) => return Err(ShardError::backend(self.store.account(), e)),
            };
            let live = segment.items.iter().any(|item| match item {
                ListItem::Blob(b) => !super::record::metadata_tombstoned(&b.metadata),
                ListItem::Prefix(_) => false,
            });
            if live {
                return Ok(true);
            }
            match segment.next_token {
                Some(next) => token = Some(next),
                None => return Ok(false),
            }
        }
    }

    /// Persist a record that does not exist yet.
    ///
    /// The backing container is created on first use.
    async fn insert(&self, record: &NamespaceRecord) -> Result<NamespaceRecord, ShardError> {
        let metadata = record.to_metadata(&self.shards)?;
        let mut created_container = false;
        loop {
            let result = self
                .store
                .put_blob(
                    &record.container,
                    &record.blob_name,
                    Bytes::new(),
                    metadata.clone(),
                    WriteCondition::IfNoneMatch,
                )
                .await;
            match result {
                Ok(ack) => {
                    let mut saved = record.clone();
                    saved.etag = Some(ack.etag);
                    saved.last_modified = Some(ack.last_modified);
                    return Ok(saved);
                }
                Err(StoreError::AlreadyExists { .. } | StoreError::PreconditionFailed { .. }) => {
                    return Err(ShardError::Conflict {
                        container: record.container.clone(),
                        blob: record.blob_name.clone(),
                        attempts: 1,
                    })
                }
                Err(StoreError::ContainerNotFound { .. }) if !created_container => {
                    created_container = true;
                    self.store
                        .create_container(&record.container)
                        .await
                        .map_err(|e| ShardError::backend(self.store.account(), e))?;
                }
                Err(e) => return Err(ShardError::backend(self.store.account(), e)),
            }
        }
    }

    async fn note_conflict(&self, operation: &'static str, attempt: u32) {
        counter!(CAS_CONFLICTS_TOTAL, "operation" => operation).increment(1);
        if attempt < self.cas_retries {
            let jitter = rand::thread_rng().gen_range(5..25u64);
            tokio::time::sleep(Duration::from_millis(jitter * u64::from(attempt))).await;
        }
    }

    fn conflict(&self, container: &str, blob: &str) -> ShardError {
        ShardError::Conflict {
            container: container.to_string(),
            blob: blob.to_string(),
            attempts: self.cas_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::{CopyOutcome, ListSegment, StoreFuture, WriteAck};
    use crate::storage::memory::{MemoryCloud, MemoryObjectStore};
    use crate::testing::TestCluster;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// How [`ContendedStore`] interferes with conditional writes.
    enum Contention {
        /// The first create-only write is beaten by another writer.
        LoseFirstCreate(AtomicBool),
        /// Every conditional write fails its precondition.
        Always,
    }

    /// Namespace account whose conditional writes race another writer.
    struct ContendedStore {
        inner: MemoryObjectStore,
        contention: Contention,
    }

    impl ContendedStore {
        fn rejected(container: &str, blob: &str) -> StoreError {
            StoreError::PreconditionFailed {
                container: container.to_string(),
                blob: blob.to_string(),
            }
        }
    }

    impl ObjectStore for ContendedStore {
        fn account(&self) -> &str {
            self.inner.account()
        }

        fn blob_url(&self, container: &str, blob: &str) -> String {
            self.inner.blob_url(container, blob)
        }

        fn create_container(&self, container: &str) -> StoreFuture<'_, bool> {
            self.inner.create_container(container)
        }

        fn list_segmented(
            &self,
            container: &str,
            request: &ListRequest,
            token: Option<&str>,
        ) -> StoreFuture<'_, ListSegment> {
            self.inner.list_segmented(container, request, token)
        }

        fn fetch_attributes(
            &self,
            container: &str,
            blob: &str,
            snapshot: Option<&str>,
        ) -> StoreFuture<'_, Option<BlobAttributes>> {
            self.inner.fetch_attributes(container, blob, snapshot)
        }

        fn put_blob(
            &self,
            container: &str,
            blob: &str,
            data: Bytes,
            metadata: BTreeMap<String, String>,
            condition: WriteCondition,
        ) -> StoreFuture<'_, WriteAck> {
            if condition == WriteCondition::None {
                return self.inner.put_blob(container, blob, data, metadata, condition);
            }
            let (container, blob) = (container.to_string(), blob.to_string());
            Box::pin(async move {
                match &self.contention {
                    Contention::Always => Err(Self::rejected(&container, &blob)),
                    Contention::LoseFirstCreate(lost) => {
                        if !lost.swap(true, Ordering::SeqCst) {
                            self.inner
                                .put_blob(&container, &blob, data, metadata, WriteCondition::None)
                                .await?;
                            return Err(StoreError::AlreadyExists { container, blob });
                        }
                        self.inner
                            .put_blob(&container, &blob, data, metadata, condition)
                            .await
                    }
                }
            })
        }

        fn set_metadata(
            &self,
            container: &str,
            blob: &str,
            metadata: BTreeMap<String, String>,
            if_match: Option<&str>,
        ) -> StoreFuture<'_, WriteAck> {
            if matches!(self.contention, Contention::Always) && if_match.is_some() {
                let err = Self::rejected(container, blob);
                return Box::pin(async move { Err(err) });
            }
            self.inner.set_metadata(container, blob, metadata, if_match)
        }

        fn start_copy(
            &self,
            source_url: &str,
            container: &str,
            blob: &str,
        ) -> StoreFuture<'_, CopyOutcome> {
            self.inner.start_copy(source_url, container, blob)
        }

        fn abort_copy(&self, container: &str, blob: &str, copy_id: &str) -> StoreFuture<'_, ()> {
            self.inner.abort_copy(container, blob, copy_id)
        }

        fn delete_if_exists(&self, container: &str, blob: &str) -> StoreFuture<'_, bool> {
            self.inner.delete_if_exists(container, blob)
        }
    }

    /// A directory over a contended namespace account, sharing the memory
    /// cloud so direct writes stay visible.
    async fn contended_directory(
        contention: Contention,
        cas_retries: u32,
    ) -> (NamespaceDirectory, MemoryObjectStore) {
        let cluster = TestCluster::new(3);
        let cloud: Arc<MemoryCloud> = Arc::clone(&cluster.cloud);
        let store = ContendedStore {
            inner: cloud.account("namespace"),
            contention,
        };
        store.create_container("c").await.unwrap();
        let directory = NamespaceDirectory::new(
            Arc::new(store),
            Arc::clone(&cluster.shards),
            cas_retries,
        );
        (directory, cloud.account("namespace"))
    }

    #[tokio::test]
    async fn test_create_if_absent_places_by_hash() {
        let cluster = TestCluster::new(3);
        let record = cluster.directory.create_if_absent("c", "foo").await.unwrap();
        assert_eq!(record.primary_shard, 2);
        assert!(record.is_active());
        assert!(record.etag.is_some());

        let again = cluster.directory.create_if_absent("c", "foo").await.unwrap();
        assert_eq!(again, record);
    }

    #[tokio::test]
    async fn test_create_if_absent_at_honors_placement() {
        let cluster = TestCluster::new(3);
        let record = cluster
            .directory
            .create_if_absent_at("c", "foo", Some(0))
            .await
            .unwrap();
        assert_eq!(record.primary_shard, 0);
    }

    #[tokio::test]
    async fn test_concurrent_creates_converge() {
        let cluster = TestCluster::new(4);
        let directory = Arc::clone(&cluster.directory);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let directory = Arc::clone(&directory);
            handles.push(tokio::spawn(async move {
                directory.create_if_absent("race", "same/name").await
            }));
        }
        let mut records = Vec::new();
        for h in handles {
            records.push(h.await.unwrap().unwrap());
        }
        let first = &records[0];
        assert!(records
            .iter()
            .all(|r| r.primary_shard == first.primary_shard && r.etag == first.etag));

        let entries = directory.list_entries("race", "", None, None).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_lost_final_create_returns_winner() {
        let (directory, _) =
            contended_directory(Contention::LoseFirstCreate(AtomicBool::new(false)), 1).await;
        let record = directory.create_if_absent("c", "foo").await.unwrap();
        assert_eq!(record.primary_shard, 2);
        assert!(record.is_active());

        let stored = directory.fetch("c", "foo", None).await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_conflict() {
        let (directory, raw) = contended_directory(Contention::Always, 3).await;
        let err = directory.create_if_absent("c", "new").await.unwrap_err();
        assert!(matches!(err, ShardError::Conflict { attempts: 3, .. }));

        // Seed a record behind the directory's back, then fail to mutate it.
        let record = NamespaceRecord::new("c", "doc", 1);
        raw.put_blob(
            "c",
            "doc",
            Bytes::new(),
            record.to_metadata(directory.shards()).unwrap(),
            WriteCondition::None,
        )
        .await
        .unwrap();
        let err = directory
            .update("c", "doc", |r| {
                r.metadata.insert("k".to_string(), "v".to_string());
                true
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::Conflict { attempts: 3, .. }));

        let current = directory.fetch_active("c", "doc").await.unwrap().unwrap();
        let err = directory.mark_tombstoned(&current).await.unwrap_err();
        assert!(matches!(err, ShardError::Conflict { attempts: 3, .. }));
        assert!(directory.fetch_active("c", "doc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_detects_concurrent_mutation() {
        let cluster = TestCluster::new(2);
        let stale = cluster.directory.create_if_absent("c", "doc").await.unwrap();

        let mut fresh = stale.clone();
        fresh.metadata.insert("k".to_string(), "v".to_string());
        cluster.directory.save(&fresh).await.unwrap();

        let mut conflicting = stale.clone();
        conflicting.tombstoned = true;
        let err = cluster.directory.save(&conflicting).await.unwrap_err();
        assert!(matches!(err, ShardError::Conflict { .. }));

        let stored = cluster.directory.fetch("c", "doc", None).await.unwrap().unwrap();
        assert!(stored.is_active());
        assert_eq!(stored.metadata.get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn test_mark_tombstoned_is_idempotent() {
        let cluster = TestCluster::new(2);
        let record = cluster.directory.create_if_absent("c", "doc").await.unwrap();

        let first = cluster.directory.mark_tombstoned(&record).await.unwrap().unwrap();
        assert!(first.tombstoned);
        let second = cluster.directory.mark_tombstoned(&record).await.unwrap().unwrap();
        assert!(second.tombstoned);
        assert_eq!(first.etag, second.etag);

        assert!(cluster.directory.fetch_active("c", "doc").await.unwrap().is_none());
        assert!(cluster.directory.fetch("c", "doc", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_revive_keeps_prior_shard() {
        let cluster = TestCluster::new(3);
        let record = cluster
            .directory
            .create_if_absent_at("c", "foo", Some(0))
            .await
            .unwrap();
        cluster.directory.mark_tombstoned(&record).await.unwrap();

        // "foo" resolves to shard 2, but the revived record stays on 0.
        let revived = cluster.directory.create_if_absent("c", "foo").await.unwrap();
        assert_eq!(revived.primary_shard, 0);
        assert!(revived.is_active());
    }

    #[tokio::test]
    async fn test_update_missing_record_returns_none() {
        let cluster = TestCluster::new(2);
        let out = cluster
            .directory
            .update("c", "nothing", |_| true)
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_fetch_missing_container_is_absent() {
        let cluster = TestCluster::new(2);
        assert!(cluster
            .directory
            .fetch("nowhere", "x", Some("2024-01-01T00:00:00.0000000Z"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_namespace_outage_is_backend_unavailable() {
        let cluster = TestCluster::new(2);
        cluster.namespace.set_unavailable(true);
        let err = cluster.directory.create_if_absent("c", "x").await.unwrap_err();
        assert!(matches!(err, ShardError::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_list_entries_and_live_records() {
        let cluster = TestCluster::new(2);
        for name in ["a/1", "a/2", "b/1", "root"] {
            cluster.directory.create_if_absent("c", name).await.unwrap();
        }
        let b1 = cluster.directory.fetch("c", "b/1", None).await.unwrap().unwrap();
        cluster.directory.mark_tombstoned(&b1).await.unwrap();

        let entries = cluster
            .directory
            .list_entries("c", "", Some("/"), None)
            .await
            .unwrap();
        let rendered: Vec<String> = entries
            .iter()
            .map(|e| match e {
                DirectoryEntry::Prefix(p) => format!("P:{p}"),
                DirectoryEntry::Record(r) => format!("R:{}", r.blob_name),
            })
            .collect();
        assert_eq!(rendered, vec!["P:a/", "P:b/", "R:root"]);

        assert!(cluster.directory.has_live_records("c", "a/").await.unwrap());
        assert!(!cluster.directory.has_live_records("c", "b/").await.unwrap());
        assert!(!cluster.directory.has_live_records("other", "a/").await.unwrap());
    }

    #[tokio::test]
    async fn test_user_metadata_roundtrips_through_save() {
        let cluster = TestCluster::new(2);
        let record = cluster
            .directory
            .update("c", "x", |_| true)
            .await
            .unwrap();
        assert!(record.is_none());

        let mut record = cluster.directory.create_if_absent("c", "x").await.unwrap();
        record.metadata = BTreeMap::from([("owner".to_string(), "ops".to_string())]);
        let saved = cluster.directory.save(&record).await.unwrap();
        let fetched = cluster.directory.fetch("c", "x", None).await.unwrap().unwrap();
        assert_eq!(fetched, saved);
    }
}
