//! Asynchronous replication of blobs to non-primary shards.
//!
//! The coordinator turns eligible writes into queued jobs without blocking
//! the writer; the worker drains the queue and converges replicas.

pub mod coordinator;
pub mod job;
pub mod policy;
pub mod queue;
pub mod sqlite;
pub mod worker;

pub use coordinator::ReplicationCoordinator;
pub use job::{JobKind, ReplicationJob};
pub use policy::{ReplicationPolicy, ReplicationTrigger};
pub use queue::{JobQueue, LeasedJob, MemoryJobQueue};
pub use sqlite::SqliteJobQueue;
pub use worker::{JobOutcome, ReplicationWorker, WorkerReport};
