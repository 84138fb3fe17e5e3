//! Replication coordinator.
//!
//! Writers call [`ReplicationCoordinator::enqueue_replication`], which only
//! hands jobs to an in-process channel and returns.  A dispatcher task owns
//! the queue side: it enqueues each job and logs failures.  A write is
//! never delayed or failed by replication.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::job::ReplicationJob;
use super::policy::{ReplicationPolicy, ReplicationTrigger};
use super::queue::JobQueue;
use crate::metrics::{REPLICATION_ENQUEUE_FAILURES_TOTAL, REPLICATION_JOBS_ENQUEUED_TOTAL};
use crate::namespace::NamespaceRecord;
use crate::placement::ShardSet;

/// Schedules replication jobs without blocking writers.
pub struct ReplicationCoordinator {
    shards: Arc<ShardSet>,
    policy: ReplicationPolicy,
    sender: mpsc::UnboundedSender<ReplicationJob>,
    /// Jobs handed to the dispatcher and not yet enqueued.
    in_flight: Arc<watch::Sender<usize>>,
}

impl ReplicationCoordinator {
    /// Create a coordinator and spawn its dispatcher.
    ///
    /// Must be called within a Tokio runtime.  The dispatcher stops once
    /// the coordinator is dropped.
    pub fn new(shards: Arc<ShardSet>, policy: ReplicationPolicy, queue: Arc<dyn JobQueue>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (in_flight, _) = watch::channel(0usize);
        let in_flight = Arc::new(in_flight);
        tokio::spawn(dispatch(receiver, queue, Arc::clone(&in_flight)));
        Self {
            shards,
            policy,
            sender,
            in_flight,
        }
    }

    pub fn policy(&self) -> &ReplicationPolicy {
        &self.policy
    }

    /// Whether a write replicates under the configured policy.
    pub fn should_replicate(
        &self,
        trigger: ReplicationTrigger,
        container: &str,
        blob: &str,
        metadata: &BTreeMap<String, String>,
    ) -> bool {
        self.policy.should_replicate(trigger, container, blob, metadata)
    }

    /// Schedule one job per non-primary shard and return how many were
    /// scheduled.
    ///
    /// Copies go from the primary to every other shard; with `is_delete`
    /// every other shard is told to drop its copy instead.
    pub fn enqueue_replication(&self, record: &NamespaceRecord, is_delete: bool) -> usize {
        let Some(primary) = self.shards.get(record.primary_shard) else {
            warn!(
                "Not replicating {}/{}: shard {} is not configured",
                record.container, record.blob_name, record.primary_shard
            );
            return 0;
        };

        let mut scheduled = 0;
        for (index, target) in self.shards.iter() {
            if index == record.primary_shard {
                continue;
            }
            let job = if is_delete {
                ReplicationJob::delete_replica(
                    target.account(),
                    &record.container,
                    &record.blob_name,
                )
            } else {
                ReplicationJob::begin_replicate(
                    primary.account(),
                    target.account(),
                    &record.container,
                    &record.blob_name,
                )
            };
            self.in_flight.send_modify(|n| *n += 1);
            match self.sender.send(job) {
                Ok(()) => scheduled += 1,
                Err(mpsc::error::SendError(job)) => {
                    self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
                    counter!(REPLICATION_ENQUEUE_FAILURES_TOTAL).increment(1);
                    warn!(
                        "Replication dispatcher is gone; dropped {} for {}/{}",
                        job.kind_label(),
                        job.container,
                        job.blob_name
                    );
                }
            }
        }
        debug!(
            "Scheduled {} replication job(s) for {}/{} (delete={})",
            scheduled, record.container, record.blob_name, is_delete
        );
        scheduled
    }

    /// Wait until every scheduled job has reached the queue (or failed).
    pub async fn flush(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

async fn dispatch(
    mut receiver: mpsc::UnboundedReceiver<ReplicationJob>,
    queue: Arc<dyn JobQueue>,
    in_flight: Arc<watch::Sender<usize>>,
) {
    while let Some(job) = receiver.recv().await {
        match queue.enqueue(&job, Duration::ZERO).await {
            Ok(()) => {
                counter!(REPLICATION_JOBS_ENQUEUED_TOTAL, "kind" => job.kind_label()).increment(1);
            }
            Err(e) => {
                counter!(REPLICATION_ENQUEUE_FAILURES_TOTAL).increment(1);
                warn!(
                    "Failed to enqueue {} for {}/{}: {}",
                    job.kind_label(),
                    job.container,
                    job.blob_name,
                    e
                );
            }
        }
        in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}
