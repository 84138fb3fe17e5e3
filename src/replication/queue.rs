//! Job queue contract and the in-process implementation.
//!
//! Delivery is at-least-once: a dequeued job is leased, not removed, and
//! comes back once its lease expires unless it was acknowledged.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::job::ReplicationJob;

/// Boxed future returned by [`JobQueue`] methods.
pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// A job handed to a consumer under a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedJob {
    /// Token acknowledging this delivery.
    pub receipt: String,
    /// How many times the job has been delivered, this one included.
    pub dequeue_count: u32,
    pub job: ReplicationJob,
}

/// Durable, lease-based queue of replication jobs.
pub trait JobQueue: Send + Sync + 'static {
    /// Add a job that becomes visible after `delay`.
    fn enqueue(&self, job: &ReplicationJob, delay: Duration) -> QueueFuture<'_, ()>;

    /// Lease up to `max` visible jobs for `lease`.
    fn dequeue(&self, max: usize, lease: Duration) -> QueueFuture<'_, Vec<LeasedJob>>;

    /// Remove a leased job.  Stale receipts are ignored.
    fn ack(&self, receipt: &str) -> QueueFuture<'_, ()>;

    /// Number of queued jobs, visible or not.
    fn approximate_len(&self) -> QueueFuture<'_, usize>;
}

struct QueuedJob {
    job: ReplicationJob,
    visible_at: Instant,
    dequeue_count: u32,
    receipt: Option<String>,
}

/// In-process queue.  Jobs are lost when the process exits.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<QueuedJob>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all queued jobs in insertion order.
    pub fn jobs(&self) -> Vec<ReplicationJob> {
        let jobs = self.jobs.lock().expect("mutex poisoned");
        jobs.iter().map(|q| q.job.clone()).collect()
    }
}

impl JobQueue for MemoryJobQueue {
    fn enqueue(&self, job: &ReplicationJob, delay: Duration) -> QueueFuture<'_, ()> {
        let job = job.clone();
        Box::pin(async move {
            let mut jobs = self.jobs.lock().expect("mutex poisoned");
            jobs.push(QueuedJob {
                job,
                visible_at: Instant::now() + delay,
                dequeue_count: 0,
                receipt: None,
            });
            Ok(())
        })
    }

    fn dequeue(&self, max: usize, lease: Duration) -> QueueFuture<'_, Vec<LeasedJob>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut jobs = self.jobs.lock().expect("mutex poisoned");
            let mut leased = Vec::new();
            for queued in jobs.iter_mut().filter(|q| q.visible_at <= now).take(max) {
                let receipt = uuid::Uuid::new_v4().to_string();
                queued.visible_at = now + lease;
                queued.dequeue_count += 1;
                queued.receipt = Some(receipt.clone());
                leased.push(LeasedJob {
                    receipt,
                    dequeue_count: queued.dequeue_count,
                    job: queued.job.clone(),
                });
            }
            Ok(leased)
        })
    }

    fn ack(&self, receipt: &str) -> QueueFuture<'_, ()> {
        let receipt = receipt.to_string();
        Box::pin(async move {
            let mut jobs = self.jobs.lock().expect("mutex poisoned");
            jobs.retain(|q| q.receipt.as_deref() != Some(receipt.as_str()));
            Ok(())
        })
    }

    fn approximate_len(&self) -> QueueFuture<'_, usize> {
        Box::pin(async move { Ok(self.jobs.lock().expect("mutex poisoned").len()) })
    }
}
