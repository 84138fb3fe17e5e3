//! Replication worker.
//!
//! Drains the job queue and converges replicas.  Every handler is safe to
//! run twice, out of order or concurrently with another worker: copies are
//! skipped when the destination already matches, deletes of absent blobs
//! succeed, and every job re-reads the namespace record before acting.

use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use super::job::{JobKind, ReplicationJob};
use super::queue::{JobQueue, LeasedJob};
use crate::config::ReplicationConfig;
use crate::metrics::{
    REPLICATION_JOBS_FAILED_TOTAL, REPLICATION_JOBS_PROCESSED_TOTAL,
    REPLICATION_POISON_JOBS_TOTAL, REPLICATION_QUEUE_DEPTH,
};
use crate::namespace::NamespaceDirectory;
use crate::placement::ShardSet;
use crate::storage::backend::{CopyStatus, ObjectStore};

/// Counts reported by a worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Jobs handled and acknowledged.
    pub processed: usize,
    /// Jobs that failed (left for redelivery) or were dropped as poison.
    pub errors: usize,
}

impl WorkerReport {
    fn absorb(&mut self, other: WorkerReport) {
        self.processed += other.processed;
        self.errors += other.errors;
    }
}

/// What handling a job amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The destination now matches, or the replica is gone.
    Completed,
    /// A copy is still running; a progress check was queued.
    Deferred,
    /// Nothing to do.
    Skipped(&'static str),
}

impl JobOutcome {
    fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Deferred => "deferred",
            JobOutcome::Skipped(_) => "skipped",
        }
    }
}

/// Consumer of the replication queue.
pub struct ReplicationWorker {
    shards: Arc<ShardSet>,
    directory: Arc<NamespaceDirectory>,
    queue: Arc<dyn JobQueue>,
    config: ReplicationConfig,
}

impl ReplicationWorker {
    pub fn new(
        shards: Arc<ShardSet>,
        directory: Arc<NamespaceDirectory>,
        queue: Arc<dyn JobQueue>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            shards,
            directory,
            queue,
            config,
        }
    }

    /// Run `max_iterations` dequeue rounds, sleeping while the queue is
    /// empty.
    pub async fn run(&self, max_iterations: usize) -> WorkerReport {
        let mut report = WorkerReport::default();
        for iteration in 0..max_iterations {
            match self.run_once().await {
                Ok((round, 0)) if iteration + 1 < max_iterations => {
                    report.absorb(round);
                    tokio::time::sleep(self.config.idle_sleep()).await;
                }
                Ok((round, _)) => report.absorb(round),
                Err(e) => {
                    warn!("Replication queue unavailable: {}", e);
                    report.errors += 1;
                    tokio::time::sleep(self.config.idle_sleep()).await;
                }
            }
        }
        info!(
            "Replication worker finished: processed={} errors={}",
            report.processed, report.errors
        );
        report
    }

    /// Lease one batch and handle it.  Returns the counts and how many jobs
    /// were leased.
    pub async fn run_once(&self) -> anyhow::Result<(WorkerReport, usize)> {
        if let Ok(depth) = self.queue.approximate_len().await {
            gauge!(REPLICATION_QUEUE_DEPTH).set(depth as f64);
        }
        let batch = self
            .queue
            .dequeue(self.config.batch_size.max(1), self.config.visibility_timeout())
            .await?;
        let leased = batch.len();
        let mut report = WorkerReport::default();
        for leased_job in batch {
            report.absorb(self.process(leased_job).await);
        }
        Ok((report, leased))
    }

    async fn process(&self, leased: LeasedJob) -> WorkerReport {
        let job = &leased.job;
        let kind = job.kind_label();

        if leased.dequeue_count > self.config.max_dequeue_count {
            warn!(
                "Dropping {} for {}/{} after {} deliveries",
                kind, job.container, job.blob_name, leased.dequeue_count
            );
            counter!(REPLICATION_POISON_JOBS_TOTAL).increment(1);
            if let Err(e) = self.queue.ack(&leased.receipt).await {
                warn!("Failed to drop poison job: {}", e);
            }
            return WorkerReport {
                processed: 0,
                errors: 1,
            };
        }

        match self.handle(job).await {
            Ok(outcome) => {
                if let JobOutcome::Skipped(reason) = &outcome {
                    debug!(
                        "Skipped {} for {}/{}: {}",
                        kind, job.container, job.blob_name, reason
                    );
                }
                counter!(
                    REPLICATION_JOBS_PROCESSED_TOTAL,
                    "kind" => kind,
                    "outcome" => outcome.label()
                )
                .increment(1);
                match self.queue.ack(&leased.receipt).await {
                    Ok(()) => WorkerReport {
                        processed: 1,
                        errors: 0,
                    },
                    Err(e) => {
                        warn!("Failed to acknowledge {}: {}", kind, e);
                        WorkerReport {
                            processed: 0,
                            errors: 1,
                        }
                    }
                }
            }
            Err(e) => {
                counter!(REPLICATION_JOBS_FAILED_TOTAL, "kind" => kind).increment(1);
                warn!(
                    "{} for {}/{} failed (delivery {}): {:#}",
                    kind, job.container, job.blob_name, leased.dequeue_count, e
                );
                WorkerReport {
                    processed: 0,
                    errors: 1,
                }
            }
        }
    }

    /// Handle one job without touching its lease.
    pub async fn handle(&self, job: &ReplicationJob) -> anyhow::Result<JobOutcome> {
        match &job.kind {
            JobKind::BeginReplicate => self.begin_replicate(job).await,
            JobKind::DeleteReplica => self.delete_replica(job).await,
            JobKind::CopyProgress {
                copy_id,
                started_at,
            } => self.copy_progress(job, copy_id, *started_at).await,
        }
    }

    fn store(&self, account: &str) -> anyhow::Result<(usize, &Arc<dyn ObjectStore>)> {
        let index = self
            .shards
            .index_of(account)
            .ok_or_else(|| anyhow::anyhow!("unknown shard account {}", account))?;
        let store = self
            .shards
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("unknown shard index {}", index))?;
        Ok((index, store))
    }

    async fn begin_replicate(&self, job: &ReplicationJob) -> anyhow::Result<JobOutcome> {
        let destination = job
            .destination
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("replication job without a destination"))?;
        let (container, blob) = (job.container.as_str(), job.blob_name.as_str());

        let Some(record) = self.directory.fetch_active(container, blob).await? else {
            return Ok(JobOutcome::Skipped("record missing or tombstoned"));
        };
        let (source_index, source) = self.store(&job.source)?;
        if record.primary_shard != source_index {
            return Ok(JobOutcome::Skipped("source is no longer primary"));
        }
        let (dest_index, dest) = self.store(destination)?;
        if dest_index == record.primary_shard {
            return Ok(JobOutcome::Skipped("destination is primary"));
        }

        let Some(source_attrs) = source.fetch_attributes(container, blob, None).await? else {
            return Ok(JobOutcome::Skipped("source blob missing"));
        };
        if matches!(&source_attrs.properties.copy, Some(c) if c.status == CopyStatus::Pending) {
            anyhow::bail!("source {}/{} is still being copied", container, blob);
        }

        let source_url = source.blob_url(container, blob);
        if let Some(existing) = dest.fetch_attributes(container, blob, None).await? {
            match &existing.properties.copy {
                Some(copy) if copy.status == CopyStatus::Pending && copy.source == source_url => {
                    // The destination was stamped when the copy started, so
                    // redeliveries keep the original timeout clock.
                    let started_at = existing.properties.last_modified;
                    let check = job.copy_progress(destination, &copy.id, started_at);
                    self.queue
                        .enqueue(&check, self.config.copy_poll_interval())
                        .await?;
                    return Ok(JobOutcome::Deferred);
                }
                _ if existing.same_content(&source_attrs) => {
                    return Ok(JobOutcome::Skipped("destination already current"));
                }
                _ => {}
            }
        }

        dest.create_container(container).await?;
        let outcome = dest.start_copy(&source_url, container, blob).await?;
        match outcome.status {
            CopyStatus::Success => {
                debug!("Replicated {}/{} {} -> {}", container, blob, job.source, destination);
                Ok(JobOutcome::Completed)
            }
            CopyStatus::Pending => {
                let check = job.copy_progress(destination, &outcome.copy_id, Utc::now());
                self.queue
                    .enqueue(&check, self.config.copy_poll_interval())
                    .await?;
                Ok(JobOutcome::Deferred)
            }
            CopyStatus::Failed | CopyStatus::Aborted => Err(anyhow::anyhow!(
                "copy of {}/{} to {} ended as {:?}",
                container,
                blob,
                destination,
                outcome.status
            )),
        }
    }

    async fn copy_progress(
        &self,
        job: &ReplicationJob,
        copy_id: &str,
        started_at: chrono::DateTime<Utc>,
    ) -> anyhow::Result<JobOutcome> {
        let destination = job
            .destination
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("progress job without a destination"))?;
        let (container, blob) = (job.container.as_str(), job.blob_name.as_str());
        let (_, dest) = self.store(destination)?;

        let limit = self.config.progress_check_timeout();
        let attrs = tokio::time::timeout(limit, dest.fetch_attributes(container, blob, None))
            .await
            .map_err(|_| anyhow::anyhow!("copy status check timed out after {:?}", limit))??;
        let Some(attrs) = attrs else {
            return Ok(JobOutcome::Skipped("destination vanished"));
        };
        let Some(copy) = attrs.properties.copy.filter(|c| c.id == copy_id) else {
            return Ok(JobOutcome::Skipped("copy superseded"));
        };

        match copy.status {
            CopyStatus::Success => Ok(JobOutcome::Completed),
            CopyStatus::Pending => {
                let elapsed = Utc::now().signed_duration_since(started_at);
                let timed_out = elapsed
                    .to_std()
                    .map(|e| e > self.config.copy_timeout())
                    .unwrap_or(false);
                if timed_out {
                    warn!(
                        "Copy {} of {}/{} to {} exceeded {:?}; restarting",
                        copy_id,
                        container,
                        blob,
                        destination,
                        self.config.copy_timeout()
                    );
                    dest.abort_copy(container, blob, copy_id).await?;
                    let restart =
                        ReplicationJob::begin_replicate(&job.source, destination, container, blob);
                    self.queue
                        .enqueue(&restart, std::time::Duration::ZERO)
                        .await?;
                } else {
                    let check = job.copy_progress(destination, copy_id, started_at);
                    self.queue
                        .enqueue(&check, self.config.copy_poll_interval())
                        .await?;
                }
                Ok(JobOutcome::Deferred)
            }
            CopyStatus::Failed | CopyStatus::Aborted => {
                warn!(
                    "Copy {} of {}/{} to {} ended as {:?}",
                    copy_id, container, blob, destination, copy.status
                );
                Ok(JobOutcome::Skipped("copy did not succeed"))
            }
        }
    }

    async fn delete_replica(&self, job: &ReplicationJob) -> anyhow::Result<JobOutcome> {
        let (container, blob) = (job.container.as_str(), job.blob_name.as_str());
        let (_, target) = self.store(&job.source)?;

        // A live record means the blob was written again after the delete
        // that queued this job; its replicas are current.
        if let Some(record) = self.directory.fetch(container, blob, None).await? {
            if record.is_active() {
                return Ok(JobOutcome::Skipped("blob is live"));
            }
        }
        let existed = target.delete_if_exists(container, blob).await?;
        debug!(
            "Deleted replica {}/{} on {} (existed={})",
            container, blob, job.source, existed
        );
        Ok(JobOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::queue::MemoryJobQueue;
    use crate::testing::TestCluster;

    #[tokio::test]
    async fn test_begin_replicate_replay_is_idempotent() {
        let cluster = TestCluster::new(3);
        let record = cluster.put_replicated("c", "foo", b"payload").await;
        assert_eq!(record.primary_shard, 2);
        let job = ReplicationJob::begin_replicate("shard2", "shard0", "c", "foo");

        let worker = cluster.state.worker();
        assert_eq!(worker.handle(&job).await.unwrap(), JobOutcome::Completed);
        let once = cluster.shard(0).fetch_attributes("c", "foo", None).await.unwrap().unwrap();

        assert!(matches!(worker.handle(&job).await.unwrap(), JobOutcome::Skipped(_)));
        let twice = cluster.shard(0).fetch_attributes("c", "foo", None).await.unwrap().unwrap();
        assert_eq!(once, twice);
        assert_eq!(cluster.shard(0).read_blob("c", "foo").unwrap(), &b"payload"[..]);
    }

    #[tokio::test]
    async fn test_delete_replica_of_absent_blob_is_noop() {
        let cluster = TestCluster::new(3);
        let worker = cluster.state.worker();
        let job = ReplicationJob::delete_replica("shard1", "c", "never-written");
        assert_eq!(worker.handle(&job).await.unwrap(), JobOutcome::Completed);
        assert_eq!(worker.handle(&job).await.unwrap(), JobOutcome::Completed);
    }

    #[tokio::test]
    async fn test_delete_replica_spares_primary() {
        let cluster = TestCluster::new(3);
        cluster.put("c", "foo", b"x").await;
        let worker = cluster.state.worker();
        let job = ReplicationJob::delete_replica("shard2", "c", "foo");
        assert!(matches!(worker.handle(&job).await.unwrap(), JobOutcome::Skipped(_)));
        assert!(cluster.shard(2).contains("c", "foo"));
    }

    #[tokio::test]
    async fn test_delete_replica_after_revive_is_skipped() {
        let cluster = TestCluster::new(3);
        cluster.put_replicated("c", "foo", b"v1").await;
        crate::ops::delete_blob(&cluster.state, "c", "foo").await.unwrap();
        let leftover = ReplicationJob::delete_replica("shard0", "c", "foo");

        cluster.put_replicated("c", "foo", b"v2").await;
        let worker = cluster.state.worker();
        let begin = ReplicationJob::begin_replicate("shard2", "shard0", "c", "foo");
        assert_eq!(worker.handle(&begin).await.unwrap(), JobOutcome::Completed);

        assert!(matches!(worker.handle(&leftover).await.unwrap(), JobOutcome::Skipped(_)));
        assert_eq!(cluster.shard(0).read_blob("c", "foo").unwrap(), &b"v2"[..]);
    }

    #[tokio::test]
    async fn test_stale_begin_replicate_is_skipped() {
        let cluster = TestCluster::new(3);
        cluster.put("c", "foo", b"x").await;
        let worker = cluster.state.worker();

        // Wrong source.
        let job = ReplicationJob::begin_replicate("shard1", "shard0", "c", "foo");
        assert!(matches!(worker.handle(&job).await.unwrap(), JobOutcome::Skipped(_)));

        // Tombstoned record.
        crate::ops::delete_blob(&cluster.state, "c", "foo").await.unwrap();
        let job = ReplicationJob::begin_replicate("shard2", "shard0", "c", "foo");
        assert!(matches!(worker.handle(&job).await.unwrap(), JobOutcome::Skipped(_)));
        assert!(!cluster.shard(0).contains("c", "foo"));
    }

    #[tokio::test]
    async fn test_pending_copy_is_tracked_to_completion() {
        let cluster = TestCluster::new(2);
        // "foo" lives on shard 0 with two shards.
        let record = cluster.put_replicated("c", "foo", b"slow").await;
        assert_eq!(record.primary_shard, 0);
        cluster.shard(1).set_pending_copy_checks(3);
        cluster.state.coordinator.flush().await;

        let report = cluster.state.worker().run(6).await;
        assert_eq!(report.errors, 0);
        assert!(report.processed >= 3);
        assert_eq!(cluster.shard(1).read_blob("c", "foo").unwrap(), &b"slow"[..]);
        assert_eq!(cluster.queue.approximate_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_copy_is_restarted() {
        let mut config = TestCluster::config();
        config.replication.copy_timeout_secs = 0;
        let cluster = TestCluster::with_config(2, None, config);
        cluster.put("c", "foo", b"x").await;
        cluster.shard(1).set_pending_copy_checks(100);

        let worker = cluster.state.worker();
        let begin = ReplicationJob::begin_replicate("shard0", "shard1", "c", "foo");
        assert_eq!(worker.handle(&begin).await.unwrap(), JobOutcome::Deferred);
        let progress = cluster.queue.jobs().pop().unwrap();
        assert!(matches!(progress.kind, JobKind::CopyProgress { .. }));

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(worker.handle(&progress).await.unwrap(), JobOutcome::Deferred);
        let restart = cluster.queue.jobs().pop().unwrap();
        assert_eq!(restart.kind, JobKind::BeginReplicate);
    }

    #[tokio::test]
    async fn test_redelivered_begin_keeps_copy_start_time() {
        let cluster = TestCluster::new(2);
        cluster.put("c", "foo", b"x").await;
        cluster.shard(1).set_pending_copy_checks(100);

        let worker = cluster.state.worker();
        let begin = ReplicationJob::begin_replicate("shard0", "shard1", "c", "foo");
        let started = |job: ReplicationJob| match job.kind {
            JobKind::CopyProgress { started_at, .. } => started_at,
            other => panic!("expected a progress check, got {other:?}"),
        };
        assert_eq!(worker.handle(&begin).await.unwrap(), JobOutcome::Deferred);
        let first = started(cluster.queue.jobs().pop().unwrap());

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(worker.handle(&begin).await.unwrap(), JobOutcome::Deferred);
        let second = started(cluster.queue.jobs().pop().unwrap());
        assert!(second <= first);
    }

    #[tokio::test]
    async fn test_poison_job_is_dropped() {
        let mut config = TestCluster::config();
        config.replication.max_dequeue_count = 2;
        config.replication.visibility_timeout_secs = 0;
        let cluster = TestCluster::with_config(2, None, config);

        // Unknown destination account fails every time.
        let job = ReplicationJob::begin_replicate("shard0", "elsewhere", "c", "foo");
        cluster.put("c", "foo", b"x").await;
        cluster
            .queue
            .enqueue(&job, std::time::Duration::ZERO)
            .await
            .unwrap();

        let report = cluster.state.worker().run(3).await;
        assert_eq!(report.processed, 0);
        assert_eq!(report.errors, 3);
        assert_eq!(cluster.queue.approximate_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_counts_iterations_on_empty_queue() {
        let cluster = TestCluster::new(2);
        let worker = ReplicationWorker::new(
            Arc::clone(&cluster.shards),
            Arc::clone(&cluster.directory),
            Arc::new(MemoryJobQueue::new()),
            TestCluster::config().replication,
        );
        assert_eq!(worker.run(3).await, WorkerReport::default());
    }
}
