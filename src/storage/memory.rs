//! In-memory object store.
//!
//! Accounts live inside a shared [`MemoryCloud`] so a server-side copy can
//! resolve its `memory://account/container/blob` source URL the same way a
//! real blob service resolves a source account.  Each account keeps its
//! containers in `RwLock`-guarded ordered maps.
//!
//! A few knobs exist to exercise the sharding core: a listing page size,
//! an artificial listing delay, an "unavailable" switch, and a pending-copy
//! mode where server-side copies only complete after a number of
//! attribute checks.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};

use super::backend::{
    BlobAttributes, BlobItem, BlobProperties, CopyInfo, CopyOutcome, CopyStatus, ListItem,
    ListRequest, ListSegment, ObjectStore, StoreError, StoreFuture, StoreResult, WriteAck,
    WriteCondition,
};

const URL_SCHEME: &str = "memory://";
const DEFAULT_PAGE_SIZE: usize = 5000;
const SNAPSHOT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.7fZ";

#[derive(Debug, Clone)]
struct PendingCopy {
    remaining_checks: u32,
    data: Bytes,
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    metadata: BTreeMap<String, String>,
    etag: String,
    last_modified: DateTime<Utc>,
    copy: Option<CopyInfo>,
    pending: Option<PendingCopy>,
}

impl StoredBlob {
    fn attributes(&self) -> BlobAttributes {
        BlobAttributes {
            properties: BlobProperties {
                etag: self.etag.clone(),
                last_modified: self.last_modified,
                content_length: self.data.len() as u64,
                content_type: "application/octet-stream".to_string(),
                content_md5: Some(content_md5(&self.data)),
                copy: self.copy.clone(),
            },
            metadata: self.metadata.clone(),
        }
    }

    fn item(&self, name: &str, snapshot: Option<&str>, with_metadata: bool) -> BlobItem {
        let attrs = self.attributes();
        BlobItem {
            name: name.to_string(),
            snapshot: snapshot.map(str::to_string),
            properties: attrs.properties,
            metadata: if with_metadata {
                attrs.metadata
            } else {
                BTreeMap::new()
            },
        }
    }
}

#[derive(Debug, Default)]
struct BlobSlot {
    current: Option<StoredBlob>,
    snapshots: BTreeMap<String, StoredBlob>,
}

type Container = BTreeMap<String, BlobSlot>;
type Account = HashMap<String, Container>;

/// Registry of in-memory accounts.
#[derive(Debug, Default)]
pub struct MemoryCloud {
    accounts: RwLock<HashMap<String, Account>>,
    etag_seq: AtomicU64,
}

impl MemoryCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register (or reopen) an account and return a store handle for it.
    pub fn account(self: &Arc<Self>, name: &str) -> MemoryObjectStore {
        {
            let mut accounts = self.accounts.write().expect("rwlock poisoned");
            accounts.entry(name.to_string()).or_default();
        }
        MemoryObjectStore {
            cloud: Arc::clone(self),
            account: name.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            pending_copy_checks: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            list_delay_ms: AtomicU64::new(0),
        }
    }

    fn next_etag(&self) -> String {
        let seq = self.etag_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("\"0x8D{seq:012X}\"")
    }
}

/// One in-memory account.
pub struct MemoryObjectStore {
    cloud: Arc<MemoryCloud>,
    account: String,
    page_size: usize,
    pending_copy_checks: AtomicU32,
    unavailable: AtomicBool,
    list_delay_ms: AtomicU64,
}

impl MemoryObjectStore {
    /// Cap every listing page at `page_size` items.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Copies into this account stay pending until their attributes have
    /// been fetched `checks` times.  Zero completes copies immediately.
    pub fn set_pending_copy_checks(&self, checks: u32) {
        self.pending_copy_checks.store(checks, Ordering::Relaxed);
    }

    /// Make every call fail as if the account were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Delay every listing call.
    pub fn set_list_delay(&self, delay: Duration) {
        self.list_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Snapshot the current version of a blob at time `at`.
    pub fn snapshot_blob_at(
        &self,
        container: &str,
        blob: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<String> {
        let snapshot = at.format(SNAPSHOT_FORMAT).to_string();
        self.with_account_mut(|account| {
            let slot = account
                .get_mut(container)
                .ok_or_else(|| container_not_found(container))?
                .get_mut(blob)
                .ok_or_else(|| blob_not_found(container, blob))?;
            let current = slot
                .current
                .clone()
                .ok_or_else(|| blob_not_found(container, blob))?;
            slot.snapshots.insert(snapshot.clone(), current);
            Ok(snapshot.clone())
        })
    }

    /// Whether the current version of a blob exists.
    pub fn contains(&self, container: &str, blob: &str) -> bool {
        self.read_blob(container, blob).is_some()
    }

    /// Content of the current version of a blob.
    pub fn read_blob(&self, container: &str, blob: &str) -> Option<Bytes> {
        let accounts = self.cloud.accounts.read().expect("rwlock poisoned");
        accounts
            .get(&self.account)?
            .get(container)?
            .get(blob)?
            .current
            .as_ref()
            .map(|b| b.data.clone())
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "account {} is unavailable",
                self.account
            )));
        }
        Ok(())
    }

    fn with_account_mut<T>(
        &self,
        f: impl FnOnce(&mut Account) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.check_available()?;
        let mut accounts = self.cloud.accounts.write().expect("rwlock poisoned");
        let account = accounts.entry(self.account.clone()).or_default();
        f(account)
    }

    fn with_account<T>(&self, f: impl FnOnce(&Account) -> StoreResult<T>) -> StoreResult<T> {
        self.check_available()?;
        let accounts = self.cloud.accounts.read().expect("rwlock poisoned");
        match accounts.get(&self.account) {
            Some(account) => f(account),
            None => f(&Account::new()),
        }
    }

    fn list_page(
        &self,
        container: &str,
        request: &ListRequest,
        token: Option<&str>,
    ) -> StoreResult<ListSegment> {
        self.with_account(|account| {
            let blobs = account
                .get(container)
                .ok_or_else(|| container_not_found(container))?;
            let prefix = request.prefix.as_str();
            let delimiter = request.delimiter.as_deref().filter(|d| !d.is_empty());

            // (resume key, item) in listing order.
            let mut entries: Vec<(ResumeKey, ListItem)> = Vec::new();
            let mut last_prefix: Option<String> = None;
            for (name, slot) in blobs.range(prefix.to_string()..) {
                if !name.starts_with(prefix) {
                    break;
                }
                if let Some(delim) = delimiter {
                    let rest = &name[prefix.len()..];
                    if let Some(pos) = rest.find(delim) {
                        let node = format!("{prefix}{}{delim}", &rest[..pos]);
                        if last_prefix.as_deref() != Some(node.as_str()) {
                            entries.push((
                                ResumeKey::prefix(&node),
                                ListItem::Prefix(node.clone()),
                            ));
                            last_prefix = Some(node);
                        }
                        continue;
                    }
                }
                if request.include.snapshots {
                    for (snapshot, stored) in &slot.snapshots {
                        entries.push((
                            ResumeKey::snapshot(name, snapshot),
                            ListItem::Blob(stored.item(
                                name,
                                Some(snapshot),
                                request.include.metadata,
                            )),
                        ));
                    }
                }
                if let Some(stored) = &slot.current {
                    entries.push((
                        ResumeKey::current(name),
                        ListItem::Blob(stored.item(name, None, request.include.metadata)),
                    ));
                }
            }

            let page_size = request
                .max_results
                .map(|m| m as usize)
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .min(self.page_size)
                .max(1);
            let start = match token {
                Some(token) => {
                    let resume = ResumeKey::decode(token)?;
                    entries.partition_point(|(key, _)| key < &resume)
                }
                None => 0,
            };
            let mut remaining = entries.into_iter().skip(start);
            let items: Vec<ListItem> = remaining
                .by_ref()
                .take(page_size)
                .map(|(_, i)| i)
                .collect();
            let next_token = remaining.next().map(|(key, _)| key.encode()).transpose()?;
            Ok(ListSegment { items, next_token })
        })
    }
}

/// Position of a listing entry.  Entries sort by name, then a hierarchy
/// node before snapshots before the current version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ResumeKey {
    name: String,
    slot: u8,
    snapshot: String,
}

impl ResumeKey {
    fn prefix(node: &str) -> Self {
        Self {
            name: node.to_string(),
            slot: 0,
            snapshot: String::new(),
        }
    }

    fn snapshot(name: &str, snapshot: &str) -> Self {
        Self {
            name: name.to_string(),
            slot: 1,
            snapshot: snapshot.to_string(),
        }
    }

    fn current(name: &str) -> Self {
        Self {
            name: name.to_string(),
            slot: 2,
            snapshot: String::new(),
        }
    }

    fn encode(&self) -> StoreResult<String> {
        serde_json::to_string(&(&self.name, self.slot, &self.snapshot))
            .map_err(|e| StoreError::Backend(e.into()))
    }

    fn decode(token: &str) -> StoreResult<Self> {
        let (name, slot, snapshot): (String, u8, String) = serde_json::from_str(token)
            .map_err(|e| anyhow::anyhow!("invalid continuation token {token:?}: {e}"))?;
        Ok(Self {
            name,
            slot,
            snapshot,
        })
    }
}

fn content_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    BASE64_STANDARD.encode(hasher.finalize())
}

fn container_not_found(container: &str) -> StoreError {
    StoreError::ContainerNotFound {
        container: container.to_string(),
    }
}

fn blob_not_found(container: &str, blob: &str) -> StoreError {
    StoreError::BlobNotFound {
        container: container.to_string(),
        blob: blob.to_string(),
    }
}

/// Split `memory://account/container/blob[?snapshot=..]`.
fn parse_url(url: &str) -> Option<(String, String, String, Option<String>)> {
    let rest = url.strip_prefix(URL_SCHEME)?;
    let (path, snapshot) = match rest.split_once("?snapshot=") {
        Some((path, snap)) => (path, Some(snap.to_string())),
        None => (rest, None),
    };
    let (account, path) = path.split_once('/')?;
    let (container, blob) = path.split_once('/')?;
    if blob.is_empty() {
        return None;
    }
    Some((
        account.to_string(),
        container.to_string(),
        blob.to_string(),
        snapshot,
    ))
}

impl ObjectStore for MemoryObjectStore {
    fn account(&self) -> &str {
        &self.account
    }

    fn blob_url(&self, container: &str, blob: &str) -> String {
        format!("{URL_SCHEME}{}/{container}/{blob}", self.account)
    }

    fn create_container(&self, container: &str) -> StoreFuture<'_, bool> {
        let container = container.to_string();
        Box::pin(async move {
            self.with_account_mut(|account| {
                if account.contains_key(&container) {
                    return Ok(false);
                }
                account.insert(container, Container::new());
                Ok(true)
            })
        })
    }

    fn list_segmented(
        &self,
        container: &str,
        request: &ListRequest,
        token: Option<&str>,
    ) -> StoreFuture<'_, ListSegment> {
        let container = container.to_string();
        let request = request.clone();
        let token = token.map(str::to_string);
        Box::pin(async move {
            let delay = self.list_delay_ms.load(Ordering::Relaxed);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.list_page(&container, &request, token.as_deref())
        })
    }

    fn fetch_attributes(
        &self,
        container: &str,
        blob: &str,
        snapshot: Option<&str>,
    ) -> StoreFuture<'_, Option<BlobAttributes>> {
        let container = container.to_string();
        let blob = blob.to_string();
        let snapshot = snapshot.map(str::to_string);
        Box::pin(async move {
            let next_etag = self.cloud.next_etag();
            self.with_account_mut(|account| {
                let Some(slot) = account.get_mut(&container).and_then(|c| c.get_mut(&blob)) else {
                    return Ok(None);
                };
                if let Some(snapshot) = snapshot {
                    return Ok(slot.snapshots.get(&snapshot).map(StoredBlob::attributes));
                }
                let Some(stored) = slot.current.as_mut() else {
                    return Ok(None);
                };
                // Each check advances a pending copy; the last one lands it.
                let landed = match stored.pending.as_mut() {
                    Some(pending) => {
                        pending.remaining_checks = pending.remaining_checks.saturating_sub(1);
                        pending.remaining_checks == 0
                    }
                    None => false,
                };
                if landed {
                    if let Some(pending) = stored.pending.take() {
                        stored.data = pending.data;
                        stored.metadata = pending.metadata;
                        stored.etag = next_etag;
                        stored.last_modified = Utc::now();
                        if let Some(copy) = stored.copy.as_mut() {
                            copy.status = CopyStatus::Success;
                        }
                    }
                }
                Ok(Some(stored.attributes()))
            })
        })
    }

    fn put_blob(
        &self,
        container: &str,
        blob: &str,
        data: Bytes,
        metadata: BTreeMap<String, String>,
        condition: WriteCondition,
    ) -> StoreFuture<'_, WriteAck> {
        let container = container.to_string();
        let blob = blob.to_string();
        Box::pin(async move {
            let etag = self.cloud.next_etag();
            self.with_account_mut(|account| {
                let blobs = account
                    .get_mut(&container)
                    .ok_or_else(|| container_not_found(&container))?;
                let existing = blobs.get(&blob).and_then(|s| s.current.as_ref());
                match (&condition, existing) {
                    (WriteCondition::IfNoneMatch, Some(_)) => {
                        return Err(StoreError::AlreadyExists { container, blob })
                    }
                    (WriteCondition::IfMatch(_), None) => {
                        return Err(blob_not_found(&container, &blob))
                    }
                    (WriteCondition::IfMatch(expected), Some(current))
                        if &current.etag != expected =>
                    {
                        return Err(StoreError::PreconditionFailed { container, blob })
                    }
                    _ => {}
                }
                let now = Utc::now();
                blobs.entry(blob).or_default().current = Some(StoredBlob {
                    data,
                    metadata,
                    etag: etag.clone(),
                    last_modified: now,
                    copy: None,
                    pending: None,
                });
                Ok(WriteAck {
                    etag,
                    last_modified: now,
                })
            })
        })
    }

    fn set_metadata(
        &self,
        container: &str,
        blob: &str,
        metadata: BTreeMap<String, String>,
        if_match: Option<&str>,
    ) -> StoreFuture<'_, WriteAck> {
        let container = container.to_string();
        let blob = blob.to_string();
        let if_match = if_match.map(str::to_string);
        Box::pin(async move {
            let etag = self.cloud.next_etag();
            self.with_account_mut(|account| {
                let stored = account
                    .get_mut(&container)
                    .ok_or_else(|| container_not_found(&container))?
                    .get_mut(&blob)
                    .and_then(|s| s.current.as_mut())
                    .ok_or_else(|| blob_not_found(&container, &blob))?;
                if let Some(expected) = if_match {
                    if stored.etag != expected {
                        return Err(StoreError::PreconditionFailed { container, blob });
                    }
                }
                let now = Utc::now();
                stored.metadata = metadata;
                stored.etag = etag.clone();
                stored.last_modified = now;
                Ok(WriteAck {
                    etag,
                    last_modified: now,
                })
            })
        })
    }

    fn start_copy(
        &self,
        source_url: &str,
        container: &str,
        blob: &str,
    ) -> StoreFuture<'_, CopyOutcome> {
        let source_url = source_url.to_string();
        let container = container.to_string();
        let blob = blob.to_string();
        Box::pin(async move {
            self.check_available()?;
            let (src_account, src_container, src_blob, src_snapshot) = parse_url(&source_url)
                .ok_or_else(|| anyhow::anyhow!("invalid copy source URL: {source_url}"))?;
            let etag = self.cloud.next_etag();
            let pending_checks = self.pending_copy_checks.load(Ordering::Relaxed);

            let mut accounts = self.cloud.accounts.write().expect("rwlock poisoned");
            let source = accounts
                .get(&src_account)
                .and_then(|a| a.get(&src_container))
                .and_then(|c| c.get(&src_blob))
                .and_then(|slot| match &src_snapshot {
                    Some(snap) => slot.snapshots.get(snap),
                    None => slot.current.as_ref(),
                })
                .cloned()
                .ok_or_else(|| blob_not_found(&src_container, &src_blob))?;

            let blobs = accounts
                .entry(self.account.clone())
                .or_default()
                .get_mut(&container)
                .ok_or_else(|| container_not_found(&container))?;
            let copy_id = uuid::Uuid::new_v4().to_string();
            let status = if pending_checks == 0 {
                CopyStatus::Success
            } else {
                CopyStatus::Pending
            };
            let copy = Some(CopyInfo {
                id: copy_id.clone(),
                source: source_url.clone(),
                status,
                progress: None,
            });
            let stored = if status == CopyStatus::Success {
                StoredBlob {
                    data: source.data,
                    metadata: source.metadata,
                    etag,
                    last_modified: Utc::now(),
                    copy,
                    pending: None,
                }
            } else {
                StoredBlob {
                    data: Bytes::new(),
                    metadata: BTreeMap::new(),
                    etag,
                    last_modified: Utc::now(),
                    copy,
                    pending: Some(PendingCopy {
                        remaining_checks: pending_checks,
                        data: source.data,
                        metadata: source.metadata,
                    }),
                }
            };
            blobs.entry(blob).or_default().current = Some(stored);
            Ok(CopyOutcome { copy_id, status })
        })
    }

    fn abort_copy(&self, container: &str, blob: &str, copy_id: &str) -> StoreFuture<'_, ()> {
        let container = container.to_string();
        let blob = blob.to_string();
        let copy_id = copy_id.to_string();
        Box::pin(async move {
            self.with_account_mut(|account| {
                let stored = account
                    .get_mut(&container)
                    .and_then(|c| c.get_mut(&blob))
                    .and_then(|s| s.current.as_mut())
                    .ok_or_else(|| blob_not_found(&container, &blob))?;
                match stored.copy.as_mut() {
                    Some(copy) if copy.id == copy_id && copy.status == CopyStatus::Pending => {
                        copy.status = CopyStatus::Aborted;
                        stored.pending = None;
                        stored.data = Bytes::new();
                        Ok(())
                    }
                    _ => Err(StoreError::Backend(anyhow::anyhow!(
                        "no pending copy {copy_id} on {container}/{blob}"
                    ))),
                }
            })
        })
    }

    fn delete_if_exists(&self, container: &str, blob: &str) -> StoreFuture<'_, bool> {
        let container = container.to_string();
        let blob = blob.to_string();
        Box::pin(async move {
            self.with_account_mut(|account| {
                Ok(account
                    .get_mut(&container)
                    .and_then(|c| c.remove(&blob))
                    .is_some())
            })
        })
    }
}
