//! Abstract object store trait.
//!
//! Every physical account (a data shard or the namespace account) is
//! reached through [`ObjectStore`].  The trait models the small subset of
//! a blob service the sharding core needs: segmented listings, attribute
//! reads, conditional writes, server-side copy and idempotent deletes.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors reported by an object store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The container has not been materialized on this account.
    #[error("The specified container does not exist: {container}")]
    ContainerNotFound { container: String },

    /// The blob does not exist.
    #[error("The specified blob does not exist: {container}/{blob}")]
    BlobNotFound { container: String, blob: String },

    /// A create-only write found an existing blob.
    #[error("The specified blob already exists: {container}/{blob}")]
    AlreadyExists { container: String, blob: String },

    /// An ETag precondition did not hold.
    #[error("The condition specified using HTTP conditional header(s) is not met: {container}/{blob}")]
    PreconditionFailed { container: String, blob: String },

    /// The call did not complete within its deadline.
    #[error("The operation timed out after {0:?}")]
    Timeout(Duration),

    /// Any other transport or service failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed future returned by every [`ObjectStore`] method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Which optional datasets a listing should return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListInclude {
    /// Include blob snapshots.
    pub snapshots: bool,
    /// Include user metadata on each blob.
    pub metadata: bool,
}

/// Parameters of a segmented listing call.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub prefix: String,
    /// Hierarchy delimiter.  `None` lists flat.
    pub delimiter: Option<String>,
    pub include: ListInclude,
    /// Page size hint for the backend.
    pub max_results: Option<u32>,
}

/// State of a server-side copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    Pending,
    Success,
    Aborted,
    Failed,
}

impl CopyStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pending" => Some(CopyStatus::Pending),
            "success" => Some(CopyStatus::Success),
            "aborted" => Some(CopyStatus::Aborted),
            "failed" => Some(CopyStatus::Failed),
            _ => None,
        }
    }
}

/// Copy properties recorded on a copy destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyInfo {
    pub id: String,
    pub source: String,
    pub status: CopyStatus,
    /// `"copied/total"` bytes, when the backend reports it.
    pub progress: Option<String>,
}

/// System properties of a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub content_length: u64,
    pub content_type: String,
    /// Base64 MD5 of the content, when known.
    pub content_md5: Option<String>,
    pub copy: Option<CopyInfo>,
}

/// Properties plus user metadata, as returned by an attribute fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobAttributes {
    pub properties: BlobProperties,
    pub metadata: BTreeMap<String, String>,
}

impl BlobAttributes {
    /// Whether `self` already holds the same content and metadata as
    /// `other`.  ETags differ across accounts so they are not compared.
    pub fn same_content(&self, other: &BlobAttributes) -> bool {
        self.properties.content_length == other.properties.content_length
            && self.properties.content_md5 == other.properties.content_md5
            && self.metadata == other.metadata
    }
}

/// A blob returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobItem {
    pub name: String,
    pub snapshot: Option<String>,
    pub properties: BlobProperties,
    pub metadata: BTreeMap<String, String>,
}

/// One entry of a physical listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListItem {
    Blob(BlobItem),
    /// A synthetic directory node produced by a delimiter.
    Prefix(String),
}

/// One page of a physical listing.
#[derive(Debug, Clone, Default)]
pub struct ListSegment {
    pub items: Vec<ListItem>,
    /// Continuation token for the next page.
    pub next_token: Option<String>,
}

/// Precondition attached to a blob write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    None,
    /// Only create; fail if the blob exists.
    IfNoneMatch,
    /// Only overwrite the version carrying this ETag.
    IfMatch(String),
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// Result of starting a server-side copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub copy_id: String,
    pub status: CopyStatus,
}

/// Async blob service contract, one instance per account.
pub trait ObjectStore: Send + Sync + 'static {
    /// Account name; unique within a deployment.
    fn account(&self) -> &str;

    /// URL other accounts can use as a copy source for this blob.
    fn blob_url(&self, container: &str, blob: &str) -> String;

    /// Create `container` if needed.  Returns `true` when it was created.
    fn create_container(&self, container: &str) -> StoreFuture<'_, bool>;

    /// Fetch one page of blobs and prefixes in `container`.
    fn list_segmented(
        &self,
        container: &str,
        request: &ListRequest,
        token: Option<&str>,
    ) -> StoreFuture<'_, ListSegment>;

    /// Read properties and metadata.  `Ok(None)` when the blob is absent.
    fn fetch_attributes(
        &self,
        container: &str,
        blob: &str,
        snapshot: Option<&str>,
    ) -> StoreFuture<'_, Option<BlobAttributes>>;

    /// Upload a block blob with metadata under a write condition.
    fn put_blob(
        &self,
        container: &str,
        blob: &str,
        data: Bytes,
        metadata: BTreeMap<String, String>,
        condition: WriteCondition,
    ) -> StoreFuture<'_, WriteAck>;

    /// Replace user metadata, optionally guarded by an ETag.
    fn set_metadata(
        &self,
        container: &str,
        blob: &str,
        metadata: BTreeMap<String, String>,
        if_match: Option<&str>,
    ) -> StoreFuture<'_, WriteAck>;

    /// Start a server-side copy from `source_url` into `container/blob`.
    fn start_copy(
        &self,
        source_url: &str,
        container: &str,
        blob: &str,
    ) -> StoreFuture<'_, CopyOutcome>;

    /// Abort a pending copy.
    fn abort_copy(&self, container: &str, blob: &str, copy_id: &str) -> StoreFuture<'_, ()>;

    /// Delete a blob and its snapshots.  Returns `false` if it was absent.
    fn delete_if_exists(&self, container: &str, blob: &str) -> StoreFuture<'_, bool>;
}

/// Drain every page of a listing, applying `timeout` to each call.
pub async fn list_all(
    store: &dyn ObjectStore,
    container: &str,
    request: &ListRequest,
    timeout: Option<Duration>,
) -> StoreResult<Vec<ListItem>> {
    let mut items = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let call = store.list_segmented(container, request, token.as_deref());
        let segment = match timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| StoreError::Timeout(limit))??,
            None => call.await?,
        };
        items.extend(segment.items);
        match segment.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    Ok(items)
}
