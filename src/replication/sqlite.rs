//! SQLite-backed durable job queue.
//!
//! Uses `rusqlite` with the `bundled` feature.  Jobs are stored as JSON
//! rows with a millisecond `visible_at` timestamp; leasing pushes the
//! timestamp forward and stamps a fresh receipt.  All async trait methods
//! are thin wrappers around synchronous calls executed under a `Mutex`.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use metrics::counter;
use rusqlite::{params, Connection};
use tracing::warn;

use super::job::ReplicationJob;
use super::queue::{JobQueue, LeasedJob, QueueFuture};
use crate::metrics::REPLICATION_POISON_JOBS_TOTAL;

/// Job queue backed by a single SQLite database file.
pub struct SqliteJobQueue {
    conn: Mutex<Connection>,
}

impl SqliteJobQueue {
    /// Open (or create) the queue at `path`.
    ///
    /// Passing `":memory:"` creates an in-memory database.
    pub fn new(path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && path != ":memory:" {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let queue = Self {
            conn: Mutex::new(conn),
        };
        queue.init_db()?;
        Ok(queue)
    }

    /// Create the queue table.  Idempotent.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS replication_jobs (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                body           TEXT NOT NULL,
                visible_at     INTEGER NOT NULL,
                dequeue_count  INTEGER NOT NULL DEFAULT 0,
                receipt        TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_replication_jobs_visible
                ON replication_jobs(visible_at);
            ",
        )?;
        Ok(())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl JobQueue for SqliteJobQueue {
    fn enqueue(&self, job: &ReplicationJob, delay: Duration) -> QueueFuture<'_, ()> {
        let body = job.to_json();
        Box::pin(async move {
            let body = body?;
            let visible_at = now_millis() + delay.as_millis() as i64;
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO replication_jobs (body, visible_at) VALUES (?1, ?2)",
                params![body, visible_at],
            )?;
            Ok(())
        })
    }

    fn dequeue(&self, max: usize, lease: Duration) -> QueueFuture<'_, Vec<LeasedJob>> {
        Box::pin(async move {
            let now = now_millis();
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction()?;
            let rows: Vec<(i64, String, u32)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, body, dequeue_count FROM replication_jobs
                     WHERE visible_at <= ?1 ORDER BY visible_at, id LIMIT ?2",
                )?;
                let mapped = stmt.query_map(params![now, max as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                mapped.collect::<Result<_, _>>()?
            };

            let mut leased = Vec::with_capacity(rows.len());
            for (id, body, count) in rows {
                // An undecodable row can never be handled; drop it so it
                // does not block the rows behind it.
                let job = match ReplicationJob::from_json(&body) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!("Dropping undecodable replication job {}: {}", id, e);
                        counter!(REPLICATION_POISON_JOBS_TOTAL).increment(1);
                        tx.execute("DELETE FROM replication_jobs WHERE id = ?1", params![id])?;
                        continue;
                    }
                };
                let receipt = uuid::Uuid::new_v4().to_string();
                let dequeue_count = count + 1;
                tx.execute(
                    "UPDATE replication_jobs
                     SET visible_at = ?1, dequeue_count = ?2, receipt = ?3
                     WHERE id = ?4",
                    params![now + lease.as_millis() as i64, dequeue_count, receipt, id],
                )?;
                leased.push(LeasedJob {
                    receipt,
                    dequeue_count,
                    job,
                });
            }
            tx.commit()?;
            Ok(leased)
        })
    }

    fn ack(&self, receipt: &str) -> QueueFuture<'_, ()> {
        let receipt = receipt.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "DELETE FROM replication_jobs WHERE receipt = ?1",
                params![receipt],
            )?;
            Ok(())
        })
    }

    fn approximate_len(&self) -> QueueFuture<'_, usize> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM replication_jobs", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }
}
