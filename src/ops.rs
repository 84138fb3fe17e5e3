//! Blob operations as the HTTP front end drives them.
//!
//! Blob bytes never pass through here.  A write asks for a target with
//! [`prepare_write`], the client uploads straight to the primary shard, and
//! [`complete_write`] then records the blob's metadata and schedules
//! replication.  Reads and listings only ever see the primary copy.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::errors::ShardError;
use crate::listing::{ListOptions, ListingPage};
use crate::namespace::NamespaceRecord;
use crate::replication::ReplicationTrigger;
use crate::storage::backend::{ObjectStore, StoreError};
use crate::AppState;

/// Where the client is sent to read or write a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobTarget {
    pub record: NamespaceRecord,
    /// Account of the primary shard.
    pub account: String,
    /// URL of the blob on the primary shard.
    pub url: String,
}

fn primary_store<'a>(
    state: &'a AppState,
    record: &NamespaceRecord,
) -> Result<&'a std::sync::Arc<dyn ObjectStore>, ShardError> {
    state.shards.get(record.primary_shard).ok_or_else(|| {
        ShardError::Internal(anyhow::anyhow!(
            "record {}/{} names unconfigured shard {}",
            record.container,
            record.blob_name,
            record.primary_shard
        ))
    })
}

fn target(state: &AppState, record: NamespaceRecord) -> Result<BlobTarget, ShardError> {
    let store = primary_store(state, &record)?;
    Ok(BlobTarget {
        account: store.account().to_string(),
        url: store.blob_url(&record.container, &record.blob_name),
        record,
    })
}

/// Create (or revive) the record for a blob and return its write target.
///
/// The blob's container is created on the primary shard if needed.
pub async fn prepare_write(
    state: &AppState,
    container: &str,
    blob: &str,
) -> Result<BlobTarget, ShardError> {
    let record = state.directory.create_if_absent(container, blob).await?;
    let store = primary_store(state, &record)?;
    store
        .create_container(container)
        .await
        .map_err(|e| ShardError::backend(store.account(), e))?;
    target(state, record)
}

/// Finish a write: persist the blob's user metadata on its record and
/// schedule replication if the policy asks for it.
///
/// Returns the number of replication jobs scheduled.
pub async fn complete_write(
    state: &AppState,
    record: &NamespaceRecord,
    trigger: ReplicationTrigger,
    metadata: &BTreeMap<String, String>,
) -> Result<usize, ShardError> {
    let record = if &record.metadata == metadata {
        record.clone()
    } else {
        state
            .directory
            .update(&record.container, &record.blob_name, |r| {
                if &r.metadata == metadata {
                    false
                } else {
                    r.metadata = metadata.clone();
                    true
                }
            })
            .await?
            .ok_or_else(|| ShardError::NotFound {
                container: record.container.clone(),
                blob: record.blob_name.clone(),
            })?
    };

    if !state
        .coordinator
        .should_replicate(trigger, &record.container, &record.blob_name, metadata)
    {
        return Ok(0);
    }
    Ok(state.coordinator.enqueue_replication(&record, false))
}

/// Delete a blob.
///
/// The record is tombstoned first so the blob disappears from listings at
/// once, then the primary copy is removed.  Replicas are cleaned up by the
/// worker.  Returns `None` if there was no live blob.
pub async fn delete_blob(
    state: &AppState,
    container: &str,
    blob: &str,
) -> Result<Option<NamespaceRecord>, ShardError> {
    let Some(record) = state.directory.fetch_active(container, blob).await? else {
        return Ok(None);
    };
    let Some(tombstoned) = state.directory.mark_tombstoned(&record).await? else {
        return Ok(None);
    };

    let store = primary_store(state, &tombstoned)?;
    store
        .delete_if_exists(container, blob)
        .await
        .map_err(|e| ShardError::backend(store.account(), e))?;
    info!(
        "Deleted {}/{} from primary {}",
        container,
        blob,
        store.account()
    );

    if state.coordinator.should_replicate(
        ReplicationTrigger::Delete,
        container,
        blob,
        &tombstoned.metadata,
    ) {
        state.coordinator.enqueue_replication(&tombstoned, true);
    }
    Ok(Some(tombstoned))
}

/// Server-side copy of `source` onto `dest`.
///
/// The destination is placed on the source's primary shard, moving it if
/// it lived elsewhere.  This is the only way a blob changes shard.  The
/// copy is started before the record moves, so a rejected copy leaves the
/// destination where and as it was.
pub async fn copy_blob(
    state: &AppState,
    source_container: &str,
    source_blob: &str,
    dest_container: &str,
    dest_blob: &str,
) -> Result<BlobTarget, ShardError> {
    let source = state
        .directory
        .fetch_active(source_container, source_blob)
        .await?
        .ok_or_else(|| ShardError::NotFound {
            container: source_container.to_string(),
            blob: source_blob.to_string(),
        })?;
    let shard = source.primary_shard;

    let store = primary_store(state, &source)?;
    let source_url = store.blob_url(source_container, source_blob);
    store
        .create_container(dest_container)
        .await
        .map_err(|e| ShardError::backend(store.account(), e))?;
    let outcome = store
        .start_copy(&source_url, dest_container, dest_blob)
        .await
        .map_err(|e| match e {
            StoreError::BlobNotFound { .. } => ShardError::NotFound {
                container: source_container.to_string(),
                blob: source_blob.to_string(),
            },
            other => ShardError::backend(store.account(), other),
        })?;
    debug!(
        "Copy {} of {}/{} -> {}/{} is {:?}",
        outcome.copy_id, source_container, source_blob, dest_container, dest_blob, outcome.status
    );

    state
        .directory
        .create_if_absent_at(dest_container, dest_blob, Some(shard))
        .await?;
    let mut previous = shard;
    let dest = state
        .directory
        .update(dest_container, dest_blob, |r| {
            previous = r.primary_shard;
            if r.primary_shard == shard && r.metadata == source.metadata {
                false
            } else {
                r.primary_shard = shard;
                r.metadata = source.metadata.clone();
                true
            }
        })
        .await?
        .ok_or_else(|| ShardError::NotFound {
            container: dest_container.to_string(),
            blob: dest_blob.to_string(),
        })?;

    if previous != shard {
        debug!(
            "Moved {}/{} from shard {} to shard {}",
            dest_container, dest_blob, previous, shard
        );
        if let Some(old) = state.shards.get(previous) {
            if let Err(e) = old.delete_if_exists(dest_container, dest_blob).await {
                warn!(
                    "Failed to remove {}/{} from former primary {}: {}",
                    dest_container,
                    dest_blob,
                    old.account(),
                    e
                );
            }
        }
    }

    if state.coordinator.should_replicate(
        ReplicationTrigger::Copy,
        dest_container,
        dest_blob,
        &dest.metadata,
    ) {
        state.coordinator.enqueue_replication(&dest, false);
    }
    target(state, dest)
}

/// Read target for a blob, or `None` if it does not exist or was deleted.
pub async fn lookup(
    state: &AppState,
    container: &str,
    blob: &str,
    snapshot: Option<&str>,
) -> Result<Option<BlobTarget>, ShardError> {
    let Some(record) = state.directory.fetch_active(container, blob).await? else {
        return Ok(None);
    };
    let mut found = target(state, record)?;
    if let Some(snapshot) = snapshot {
        let sep = if found.url.contains('?') { '&' } else { '?' };
        found.url = format!("{}{sep}snapshot={snapshot}", found.url);
    }
    Ok(Some(found))
}

/// One page of the merged listing of `container`.
pub async fn list(
    state: &AppState,
    container: &str,
    options: &ListOptions,
) -> Result<ListingPage, ShardError> {
    state.listing.list(container, options).await
}
