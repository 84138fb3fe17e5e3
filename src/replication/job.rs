//! Replication job messages.
//!
//! Jobs are serialized as JSON and name accounts rather than shard indexes,
//! so a queued job stays meaningful across worker restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a job asks the worker to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Copy the blob from the primary (`source`) to `destination`.
    BeginReplicate,
    /// Remove the copy held by `source`.
    DeleteReplica,
    /// Check on a server-side copy started earlier.
    CopyProgress {
        copy_id: String,
        started_at: DateTime<Utc>,
    },
}

/// One unit of replication work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationJob {
    #[serde(flatten)]
    pub kind: JobKind,
    /// Account the data is read from, or the replica to delete.
    pub source: String,
    /// Account receiving the copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub container: String,
    pub blob_name: String,
}

impl ReplicationJob {
    pub fn begin_replicate(source: &str, destination: &str, container: &str, blob: &str) -> Self {
        Self {
            kind: JobKind::BeginReplicate,
            source: source.to_string(),
            destination: Some(destination.to_string()),
            container: container.to_string(),
            blob_name: blob.to_string(),
        }
    }

    pub fn delete_replica(target: &str, container: &str, blob: &str) -> Self {
        Self {
            kind: JobKind::DeleteReplica,
            source: target.to_string(),
            destination: None,
            container: container.to_string(),
            blob_name: blob.to_string(),
        }
    }

    /// Follow-up check for a copy into `destination`.
    pub fn copy_progress(
        &self,
        destination: &str,
        copy_id: &str,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: JobKind::CopyProgress {
                copy_id: copy_id.to_string(),
                started_at,
            },
            source: self.source.clone(),
            destination: Some(destination.to_string()),
            container: self.container.clone(),
            blob_name: self.blob_name.clone(),
        }
    }

    /// Metric label for the job kind.
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            JobKind::BeginReplicate => "begin_replicate",
            JobKind::DeleteReplica => "delete_replica",
            JobKind::CopyProgress { .. } => "copy_progress",
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(body: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let job = ReplicationJob::begin_replicate("shard2", "shard0", "c", "foo");
        let json: serde_json::Value = serde_json::from_str(&job.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "begin_replicate");
        assert_eq!(json["source"], "shard2");
        assert_eq!(json["destination"], "shard0");
        assert_eq!(json["blob_name"], "foo");

        let delete = ReplicationJob::delete_replica("shard1", "c", "foo");
        let json: serde_json::Value = serde_json::from_str(&delete.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "delete_replica");
        assert!(json.get("destination").is_none());
    }

    #[test]
    fn test_progress_job_parses_back() {
        let job = ReplicationJob::begin_replicate("a", "b", "c", "dir/x");
        let progress = job.copy_progress("b", "copy-1", Utc::now());
        let parsed = ReplicationJob::from_json(&progress.to_json().unwrap()).unwrap();
        assert_eq!(parsed, progress);
        assert_eq!(parsed.kind_label(), "copy_progress");
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let body = r#"{"type":"rebalance","source":"a","container":"c","blob_name":"b"}"#;
        assert!(ReplicationJob::from_json(body).is_err());
    }
}
