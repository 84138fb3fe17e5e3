//! blobshard library: one logical blob namespace over many storage accounts.
//!
//! New blobs are placed on a shard by hashing their name, a CAS-protected
//! namespace directory records where every blob lives and whether it was
//! deleted, listings merge every shard with the directory, and replication
//! converges copies on the other shards in the background.

use std::sync::Arc;

pub mod config;
pub mod errors;
pub mod listing;
pub mod metrics;
pub mod namespace;
pub mod ops;
pub mod placement;
pub mod replication;
pub mod server;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::{AccountConfig, BackendKind, Config, QueueBackend};
use crate::listing::ListingEngine;
use crate::namespace::NamespaceDirectory;
use crate::placement::ShardSet;
use crate::replication::{
    JobQueue, MemoryJobQueue, ReplicationCoordinator, ReplicationPolicy, ReplicationWorker,
    SqliteJobQueue,
};
use crate::storage::azure::AzureBlobStore;
use crate::storage::backend::ObjectStore;
use crate::storage::memory::MemoryCloud;

/// Shared state handed to every blob operation.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Configured data shards, in placement order.
    pub shards: Arc<ShardSet>,
    pub directory: Arc<NamespaceDirectory>,
    pub listing: Arc<ListingEngine>,
    pub coordinator: Arc<ReplicationCoordinator>,
    pub queue: Arc<dyn JobQueue>,
}

impl AppState {
    /// Wire the components together.
    ///
    /// Spawns the replication dispatcher, so it must run inside a Tokio
    /// runtime.
    pub fn new(
        config: Config,
        shard_stores: Vec<Arc<dyn ObjectStore>>,
        namespace_store: Arc<dyn ObjectStore>,
        queue: Arc<dyn JobQueue>,
    ) -> anyhow::Result<Self> {
        let shards = Arc::new(ShardSet::new(shard_stores)?);
        let directory = Arc::new(NamespaceDirectory::new(
            namespace_store,
            Arc::clone(&shards),
            config.namespace.cas_retries,
        ));
        let listing = Arc::new(ListingEngine::new(
            Arc::clone(&shards),
            Arc::clone(&directory),
            config.listing.clone(),
        ));
        let policy = ReplicationPolicy::from_config(&config.replication)?;
        let coordinator = Arc::new(ReplicationCoordinator::new(
            Arc::clone(&shards),
            policy,
            Arc::clone(&queue),
        ));
        Ok(Self {
            config: Arc::new(config),
            shards,
            directory,
            listing,
            coordinator,
            queue,
        })
    }

    /// A replication worker over this state's shards and queue.
    pub fn worker(&self) -> ReplicationWorker {
        ReplicationWorker::new(
            Arc::clone(&self.shards),
            Arc::clone(&self.directory),
            Arc::clone(&self.queue),
            self.config.replication.clone(),
        )
    }
}

/// Build the application state described by `config`.
///
/// Memory accounts share one in-process cloud so copies between them
/// resolve.  Must run inside a Tokio runtime.
pub fn build_state(config: Config) -> anyhow::Result<AppState> {
    config.validate()?;
    let cloud = MemoryCloud::new();
    let open = |account: &AccountConfig| -> anyhow::Result<Arc<dyn ObjectStore>> {
        Ok(match account.backend {
            BackendKind::Memory => Arc::new(cloud.account(&account.name)),
            BackendKind::Azure => Arc::new(AzureBlobStore::new(
                account.name.clone(),
                account.endpoint.clone(),
                &account.key_env(),
                &account.sas_env(),
                account.request_timeout(),
            )?),
        })
    };

    let shard_stores = config
        .shards
        .iter()
        .map(&open)
        .collect::<anyhow::Result<Vec<_>>>()?;
    let namespace_store = open(&config.namespace.account)?;

    let queue: Arc<dyn JobQueue> = match config.replication.queue.backend {
        QueueBackend::Memory => Arc::new(MemoryJobQueue::new()),
        QueueBackend::Sqlite => Arc::new(SqliteJobQueue::new(&config.replication.queue.path)?),
    };

    tracing::info!(
        "Sharding {} account(s), namespace on {}, {:?} replication queue",
        shard_stores.len(),
        namespace_store.account(),
        config.replication.queue.backend
    );
    AppState::new(config, shard_stores, namespace_store, queue)
}
