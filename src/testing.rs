//! In-memory clusters for unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::{AccountConfig, Config, ListingConfig};
use crate::listing::ListingEngine;
use crate::namespace::{NamespaceDirectory, NamespaceRecord};
use crate::ops::{self, BlobTarget};
use crate::placement::ShardSet;
use crate::replication::{MemoryJobQueue, ReplicationTrigger};
use crate::storage::backend::{ObjectStore, WriteCondition};
use crate::storage::memory::{MemoryCloud, MemoryObjectStore};
use crate::AppState;

/// Metadata that makes a write eligible under the default policy.
pub fn replicate_meta() -> BTreeMap<String, String> {
    BTreeMap::from([("replicate".to_string(), "true".to_string())])
}

/// `n` memory shards named `shard0..`, a `namespace` account and a memory
/// queue, wired into an [`AppState`].
pub struct TestCluster {
    pub cloud: Arc<MemoryCloud>,
    pub stores: Vec<Arc<MemoryObjectStore>>,
    pub namespace: Arc<MemoryObjectStore>,
    pub shards: Arc<ShardSet>,
    pub directory: Arc<NamespaceDirectory>,
    pub listing: Arc<ListingEngine>,
    pub queue: Arc<MemoryJobQueue>,
    pub state: AppState,
}

impl TestCluster {
    /// Base configuration: metadata policy, no polling or idle delays.
    pub fn config() -> Config {
        let mut config = Config::default();
        config.replication.copy_poll_interval_ms = 0;
        config.replication.idle_sleep_ms = 0;
        config
    }

    pub fn new(n: usize) -> Self {
        Self::with_config(n, None, Self::config())
    }

    /// Every account returns at most `page_size` items per listing call.
    pub fn with_page_size(n: usize, page_size: usize) -> Self {
        Self::with_config(n, Some(page_size), Self::config())
    }

    pub fn with_listing(n: usize, listing: ListingConfig) -> Self {
        let mut config = Self::config();
        config.listing = listing;
        Self::with_config(n, None, config)
    }

    pub fn with_config(n: usize, page_size: Option<usize>, mut config: Config) -> Self {
        let cloud = MemoryCloud::new();
        let open = |name: &str| {
            let store = cloud.account(name);
            Arc::new(match page_size {
                Some(size) => store.with_page_size(size),
                None => store,
            })
        };
        config.shards = (0..n)
            .map(|i| AccountConfig::memory(&format!("shard{i}")))
            .collect();
        let stores: Vec<Arc<MemoryObjectStore>> =
            config.shards.iter().map(|a| open(&a.name)).collect();
        let namespace = open(&config.namespace.account.name);
        let queue = Arc::new(MemoryJobQueue::new());

        let state = AppState::new(
            config,
            stores
                .iter()
                .map(|s| Arc::clone(s) as Arc<dyn ObjectStore>)
                .collect(),
            Arc::clone(&namespace) as Arc<dyn ObjectStore>,
            Arc::clone(&queue) as Arc<dyn crate::replication::JobQueue>,
        )
        .unwrap();

        Self {
            shards: Arc::clone(&state.shards),
            directory: Arc::clone(&state.directory),
            listing: Arc::clone(&state.listing),
            cloud,
            stores,
            namespace,
            queue,
            state,
        }
    }

    pub fn shard(&self, index: usize) -> &MemoryObjectStore {
        &self.stores[index]
    }

    /// Upload bytes to the primary shard the way a redirected client would.
    pub async fn upload(&self, target: &BlobTarget, data: &[u8]) {
        self.upload_with_metadata(target, data, BTreeMap::new()).await;
    }

    async fn upload_with_metadata(
        &self,
        target: &BlobTarget,
        data: &[u8],
        metadata: BTreeMap<String, String>,
    ) {
        self.stores[target.record.primary_shard]
            .put_blob(
                &target.record.container,
                &target.record.blob_name,
                Bytes::copy_from_slice(data),
                metadata,
                WriteCondition::None,
            )
            .await
            .unwrap();
    }

    /// Full write path without replication-eligible metadata.
    pub async fn put(&self, container: &str, name: &str, data: &[u8]) -> NamespaceRecord {
        self.put_with_metadata(container, name, data, BTreeMap::new())
            .await
    }

    /// Full write path with `replicate=true`.
    pub async fn put_replicated(
        &self,
        container: &str,
        name: &str,
        data: &[u8],
    ) -> NamespaceRecord {
        self.put_with_metadata(container, name, data, replicate_meta())
            .await
    }

    pub async fn put_with_metadata(
        &self,
        container: &str,
        name: &str,
        data: &[u8],
        metadata: BTreeMap<String, String>,
    ) -> NamespaceRecord {
        let target = ops::prepare_write(&self.state, container, name).await.unwrap();
        self.upload_with_metadata(&target, data, metadata.clone()).await;
        ops::complete_write(&self.state, &target.record, ReplicationTrigger::Create, &metadata)
            .await
            .unwrap();
        self.directory
            .fetch_active(container, name)
            .await
            .unwrap()
            .unwrap()
    }

    /// Copy a blob from its primary to every other shard directly.
    pub async fn replicate_everywhere(&self, container: &str, name: &str) {
        let record = self.directory.fetch_active(container, name).await.unwrap().unwrap();
        let source_url = self.stores[record.primary_shard].blob_url(container, name);
        for (index, store) in self.stores.iter().enumerate() {
            if index == record.primary_shard {
                continue;
            }
            store.create_container(container).await.unwrap();
            store.start_copy(&source_url, container, name).await.unwrap();
        }
    }

    /// Snapshot a blob on its primary shard at time `at`.
    pub async fn snapshot(&self, container: &str, name: &str, at: DateTime<Utc>) -> String {
        let record = self.directory.fetch_active(container, name).await.unwrap().unwrap();
        self.stores[record.primary_shard]
            .snapshot_blob_at(container, name, at)
            .unwrap()
    }

    /// Write straight to a shard without a namespace record.
    pub async fn put_untracked(&self, shard: usize, container: &str, name: &str, data: &[u8]) {
        let store = &self.stores[shard];
        store.create_container(container).await.unwrap();
        store
            .put_blob(
                container,
                name,
                Bytes::copy_from_slice(data),
                BTreeMap::new(),
                WriteCondition::None,
            )
            .await
            .unwrap();
    }
}
