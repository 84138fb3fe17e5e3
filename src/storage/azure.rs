//! Azure Blob Storage account backend.
//!
//! Each configured shard (and the namespace account) can be a real Azure
//! storage account reached over the Blob REST API with `reqwest`.
//!
//! Credentials are read from the environment variables named in the
//! account's configuration:
//!   - `key_env`: base64 account key, used for Shared Key auth
//!   - `sas_env`: SAS token, appended to every request URL
//!
//! Copy sources handed to other accounts are plain blob URLs with the SAS
//! token appended when one is configured.  Shared-Key-only accounts must
//! therefore allow the destination account to read the source.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use sha2::Sha256;
use tracing::{debug, info};

use super::backend::{
    BlobAttributes, BlobItem, BlobProperties, CopyInfo, CopyOutcome, CopyStatus, ListItem,
    ListRequest, ListSegment, ObjectStore, StoreError, StoreFuture, StoreResult, WriteAck,
    WriteCondition,
};

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

const META_HEADER_PREFIX: &str = "x-ms-meta-";

/// Percent-encoding set for Azure blob names: encode everything except
/// unreserved characters and '/'.
const AZURE_BLOB_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Azure authentication method.
enum AzureAuth {
    SharedKey { key_bytes: Vec<u8> },
    SasToken { token: String },
}

/// One Azure storage account.
pub struct AzureBlobStore {
    client: reqwest::Client,
    account: String,
    base_url: String,
    auth: AzureAuth,
    timeout: Duration,
}

/// A request before signing.
struct AzureRequest<'a> {
    method: Method,
    container: &'a str,
    blob: Option<&'a str>,
    query: Vec<(String, String)>,
    /// `x-ms-*` headers other than date and version.
    headers: Vec<(String, String)>,
    content_type: Option<&'static str>,
    if_match: Option<String>,
    if_none_match: Option<String>,
    body: Bytes,
}

impl<'a> AzureRequest<'a> {
    fn new(method: Method, container: &'a str, blob: Option<&'a str>) -> Self {
        Self {
            method,
            container,
            blob,
            query: Vec::new(),
            headers: Vec::new(),
            content_type: None,
            if_match: None,
            if_none_match: None,
            body: Bytes::new(),
        }
    }

    fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_lowercase(), value.into()));
        self
    }

    fn metadata(mut self, metadata: &BTreeMap<String, String>) -> Self {
        for (k, v) in metadata {
            self.headers
                .push((format!("{META_HEADER_PREFIX}{}", k.to_lowercase()), v.clone()));
        }
        self
    }
}

impl AzureBlobStore {
    /// Create a store for `account`.
    ///
    /// `endpoint` overrides `https://{account}.blob.core.windows.net`
    /// (for Azurite and similar emulators).
    pub fn new(
        account: String,
        endpoint: Option<String>,
        key_env: &str,
        sas_env: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        let base_url = endpoint
            .filter(|e| !e.is_empty())
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", account));

        let auth = Self::resolve_auth(key_env, sas_env)?;

        info!("Azure account initialized: account={} url={}", account, base_url);

        Ok(Self {
            client,
            account,
            base_url,
            auth,
            timeout,
        })
    }

    /// Resolve authentication from the configured environment variables.
    fn resolve_auth(key_env: &str, sas_env: &str) -> anyhow::Result<AzureAuth> {
        if let Ok(key) = std::env::var(key_env) {
            let key_bytes = BASE64_STANDARD
                .decode(key.trim())
                .map_err(|e| anyhow::anyhow!("Invalid {} (not valid base64): {}", key_env, e))?;
            return Ok(AzureAuth::SharedKey { key_bytes });
        }

        if let Ok(token) = std::env::var(sas_env) {
            let token = token.strip_prefix('?').unwrap_or(&token).to_string();
            return Ok(AzureAuth::SasToken { token });
        }

        Err(anyhow::anyhow!(
            "No Azure credentials found. Set {} or {}.",
            key_env,
            sas_env
        ))
    }

    fn container_url(&self, container: &str) -> String {
        format!("{}/{}", self.base_url, container)
    }

    fn object_url(&self, container: &str, blob: &str) -> String {
        let encoded_blob =
            percent_encoding::utf8_percent_encode(blob, &AZURE_BLOB_ENCODE_SET).to_string();
        format!("{}/{}/{}", self.base_url, container, encoded_blob)
    }

    fn maybe_append_sas(&self, url: String) -> String {
        match &self.auth {
            AzureAuth::SasToken { token } => {
                if url.contains('?') {
                    format!("{}&{}", url, token)
                } else {
                    format!("{}?{}", url, token)
                }
            }
            AzureAuth::SharedKey { .. } => url,
        }
    }

    /// Build the Shared Key `Authorization` header value.
    fn authorization(
        &self,
        key_bytes: &[u8],
        request: &AzureRequest<'_>,
        date: &str,
    ) -> anyhow::Result<String> {
        let string_to_sign = string_to_sign(&self.account, request, date);
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(key_bytes)
            .map_err(|e| anyhow::anyhow!("HMAC key error: {}", e))?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());
        Ok(format!("SharedKey {}:{}", self.account, signature))
    }

    /// Sign and send a request.  Non-success statuses are returned as-is.
    async fn send(&self, request: AzureRequest<'_>) -> StoreResult<reqwest::Response> {
        let date = httpdate::fmt_http_date(SystemTime::now());
        let url = match request.blob {
            Some(blob) => self.object_url(request.container, blob),
            None => self.container_url(request.container),
        };

        let mut builder = self
            .client
            .request(request.method.clone(), self.maybe_append_sas(url))
            .query(&request.query)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION);
        for (k, v) in &request.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(content_type) = request.content_type {
            builder = builder.header("Content-Type", content_type);
        }
        if let Some(etag) = &request.if_match {
            builder = builder.header("If-Match", etag.as_str());
        }
        if let Some(etag) = &request.if_none_match {
            builder = builder.header("If-None-Match", etag.as_str());
        }
        if let AzureAuth::SharedKey { key_bytes } = &self.auth {
            builder = builder.header(
                "Authorization",
                self.authorization(key_bytes, &request, &date)?,
            );
        }
        if !request.body.is_empty() || request.method == Method::PUT {
            builder = builder.body(request.body.clone());
        }

        debug!(
            "Azure {} {}/{}",
            request.method,
            request.container,
            request.blob.unwrap_or("")
        );

        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                StoreError::Timeout(self.timeout)
            } else {
                StoreError::Backend(anyhow::anyhow!("Azure request failed: {}", e))
            }
        })
    }

    /// Turn a non-success response into a [`StoreError`].
    async fn into_error(
        resp: reqwest::Response,
        container: &str,
        blob: Option<&str>,
    ) -> StoreError {
        let status = resp.status();
        let code = error_code(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        map_azure_error(status, &code, container, blob, &body)
    }

    async fn expect_success(
        &self,
        request: AzureRequest<'_>,
    ) -> StoreResult<reqwest::Response> {
        let container = request.container.to_string();
        let blob = request.blob.map(str::to_string);
        let resp = self.send(request).await?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(Self::into_error(resp, &container, blob.as_deref()).await)
        }
    }
}

/// Azure Shared Key string-to-sign:
///
/// ```text
/// VERB\nContent-Encoding\nContent-Language\nContent-Length\nContent-MD5\n
/// Content-Type\nDate\nIf-Modified-Since\nIf-Match\nIf-None-Match\n
/// If-Unmodified-Since\nRange\nCanonicalizedHeaders\nCanonicalizedResource
/// ```
fn string_to_sign(account: &str, request: &AzureRequest<'_>, date: &str) -> String {
    let content_length = match request.body.len() {
        0 => String::new(),
        len => len.to_string(),
    };

    let mut ms_headers: Vec<(String, String)> = vec![
        ("x-ms-date".to_string(), date.to_string()),
        ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
    ];
    ms_headers.extend(
        request
            .headers
            .iter()
            .filter(|(k, _)| k.starts_with("x-ms-"))
            .cloned(),
    );
    ms_headers.sort_by(|a, b| a.0.cmp(&b.0));
    let canonicalized_headers = ms_headers
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v.trim()))
        .collect::<Vec<_>>()
        .join("\n");

    // The canonicalized resource uses the un-encoded blob name.
    let mut canonicalized_resource = match request.blob {
        Some(blob) => format!("/{}/{}/{}", account, request.container, blob),
        None => format!("/{}/{}", account, request.container),
    };
    let mut params: Vec<(String, String)> = request
        .query
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    for (k, v) in &params {
        canonicalized_resource.push_str(&format!("\n{}:{}", k, v));
    }

    format!(
        "{}\n\n\n{}\n\n{}\n\n\n{}\n{}\n\n\n{}\n{}",
        request.method,
        content_length,
        request.content_type.unwrap_or(""),
        request.if_match.as_deref().unwrap_or(""),
        request.if_none_match.as_deref().unwrap_or(""),
        canonicalized_headers,
        canonicalized_resource
    )
}

fn error_code(headers: &HeaderMap) -> String {
    headers
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn map_azure_error(
    status: StatusCode,
    code: &str,
    container: &str,
    blob: Option<&str>,
    body: &str,
) -> StoreError {
    let blob_name = blob.unwrap_or_default().to_string();
    match (status, code) {
        (StatusCode::NOT_FOUND, "ContainerNotFound") => StoreError::ContainerNotFound {
            container: container.to_string(),
        },
        (StatusCode::NOT_FOUND, _) if blob.is_some() => StoreError::BlobNotFound {
            container: container.to_string(),
            blob: blob_name,
        },
        (StatusCode::NOT_FOUND, _) => StoreError::ContainerNotFound {
            container: container.to_string(),
        },
        (StatusCode::PRECONDITION_FAILED, _) => StoreError::PreconditionFailed {
            container: container.to_string(),
            blob: blob_name,
        },
        (StatusCode::CONFLICT, "BlobAlreadyExists") => StoreError::AlreadyExists {
            container: container.to_string(),
            blob: blob_name,
        },
        _ => StoreError::Backend(anyhow::anyhow!(
            "Azure {}/{}: HTTP {} {} - {}",
            container,
            blob_name,
            status,
            code,
            body
        )),
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_http_time(value: &str) -> Option<DateTime<Utc>> {
    httpdate::parse_http_date(value).ok().map(DateTime::<Utc>::from)
}

fn write_ack(headers: &HeaderMap) -> WriteAck {
    WriteAck {
        etag: header_str(headers, "etag").unwrap_or_default().to_string(),
        last_modified: header_str(headers, "last-modified")
            .and_then(parse_http_time)
            .unwrap_or_else(Utc::now),
    }
}

fn copy_info(
    id: Option<&str>,
    status: Option<&str>,
    source: Option<&str>,
    progress: Option<&str>,
) -> Option<CopyInfo> {
    Some(CopyInfo {
        id: id?.to_string(),
        status: CopyStatus::parse(status?)?,
        source: source.unwrap_or_default().to_string(),
        progress: progress.map(str::to_string),
    })
}

/// Build attributes from the headers of a Get Blob Properties response.
fn attributes_from_headers(headers: &HeaderMap) -> BlobAttributes {
    let metadata = headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(META_HEADER_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();
    BlobAttributes {
        properties: BlobProperties {
            etag: header_str(headers, "etag").unwrap_or_default().to_string(),
            last_modified: header_str(headers, "last-modified")
                .and_then(parse_http_time)
                .unwrap_or_else(|| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH)),
            content_length: header_str(headers, "content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            content_type: header_str(headers, "content-type")
                .unwrap_or("application/octet-stream")
                .to_string(),
            content_md5: header_str(headers, "content-md5").map(str::to_string),
            copy: copy_info(
                header_str(headers, "x-ms-copy-id"),
                header_str(headers, "x-ms-copy-status"),
                header_str(headers, "x-ms-copy-source"),
                header_str(headers, "x-ms-copy-progress"),
            ),
        },
        metadata,
    }
}

#[derive(Default)]
struct BlobBuilder {
    name: String,
    snapshot: Option<String>,
    etag: String,
    last_modified: Option<DateTime<Utc>>,
    content_length: u64,
    content_type: String,
    content_md5: Option<String>,
    copy_id: Option<String>,
    copy_status: Option<String>,
    copy_source: Option<String>,
    copy_progress: Option<String>,
    metadata: BTreeMap<String, String>,
}

impl BlobBuilder {
    fn build(self) -> BlobItem {
        let copy = copy_info(
            self.copy_id.as_deref(),
            self.copy_status.as_deref(),
            self.copy_source.as_deref(),
            self.copy_progress.as_deref(),
        );
        BlobItem {
            name: self.name,
            snapshot: self.snapshot,
            properties: BlobProperties {
                etag: self.etag,
                last_modified: self
                    .last_modified
                    .unwrap_or_else(|| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH)),
                content_length: self.content_length,
                content_type: self.content_type,
                content_md5: self.content_md5,
                copy,
            },
            metadata: self.metadata,
        }
    }
}

/// Parse a List Blobs `EnumerationResults` document.
fn parse_list_blobs(body: &str) -> anyhow::Result<ListSegment> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(body);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut path: Vec<String> = Vec::new();
    let mut segment = ListSegment::default();
    let mut blob: Option<BlobBuilder> = None;
    let mut prefix: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match tag.as_str() {
                    "Blob" => blob = Some(BlobBuilder::default()),
                    "BlobPrefix" => prefix = Some(String::new()),
                    _ => {}
                }
                path.push(tag);
            }
            Ok(Event::End(_)) => {
                match path.pop().as_deref() {
                    Some("Blob") => {
                        if let Some(b) = blob.take() {
                            segment.items.push(ListItem::Blob(b.build()));
                        }
                    }
                    Some("BlobPrefix") => {
                        if let Some(p) = prefix.take() {
                            segment.items.push(ListItem::Prefix(p));
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(ref t)) => {
                let text = t.unescape()?.into_owned();
                let tail: Vec<&str> = path.iter().map(String::as_str).collect();
                match tail.as_slice() {
                    [.., "EnumerationResults", "NextMarker"] if !text.is_empty() => {
                        segment.next_token = Some(text);
                    }
                    [.., "BlobPrefix", "Name"] => prefix = Some(text),
                    [.., "Blob", "Name"] => {
                        if let Some(b) = blob.as_mut() {
                            b.name = text;
                        }
                    }
                    [.., "Blob", "Snapshot"] => {
                        if let Some(b) = blob.as_mut() {
                            b.snapshot = Some(text);
                        }
                    }
                    [.., "Blob", "Metadata", key] => {
                        if let Some(b) = blob.as_mut() {
                            b.metadata.insert(key.to_lowercase(), text);
                        }
                    }
                    [.., "Blob", "Properties", field] => {
                        if let Some(b) = blob.as_mut() {
                            match *field {
                                "Etag" => b.etag = text,
                                "Last-Modified" => b.last_modified = parse_http_time(&text),
                                "Content-Length" => b.content_length = text.parse().unwrap_or(0),
                                "Content-Type" => b.content_type = text,
                                "Content-MD5" => b.content_md5 = Some(text),
                                "CopyId" => b.copy_id = Some(text),
                                "CopyStatus" => b.copy_status = Some(text),
                                "CopySource" => b.copy_source = Some(text),
                                "CopyProgress" => b.copy_progress = Some(text),
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(anyhow::anyhow!("Malformed List Blobs response: {}", e)),
        }
        buf.clear();
    }

    Ok(segment)
}

impl ObjectStore for AzureBlobStore {
    fn account(&self) -> &str {
        &self.account
    }

    fn blob_url(&self, container: &str, blob: &str) -> String {
        self.maybe_append_sas(self.object_url(container, blob))
    }

    fn create_container(&self, container: &str) -> StoreFuture<'_, bool> {
        let container = container.to_string();
        Box::pin(async move {
            let request =
                AzureRequest::new(Method::PUT, &container, None).query("restype", "container");
            let resp = self.send(request).await?;
            match resp.status() {
                StatusCode::CREATED => Ok(true),
                StatusCode::CONFLICT => Ok(false),
                _ => Err(Self::into_error(resp, &container, None).await),
            }
        })
    }

    fn list_segmented(
        &self,
        container: &str,
        request: &ListRequest,
        token: Option<&str>,
    ) -> StoreFuture<'_, ListSegment> {
        let container = container.to_string();
        let list = request.clone();
        let token = token.map(str::to_string);
        Box::pin(async move {
            let mut request = AzureRequest::new(Method::GET, &container, None)
                .query("restype", "container")
                .query("comp", "list");
            if !list.prefix.is_empty() {
                request = request.query("prefix", list.prefix.clone());
            }
            if let Some(delimiter) = list.delimiter.as_deref().filter(|d| !d.is_empty()) {
                request = request.query("delimiter", delimiter);
            }
            let include: Vec<&str> = [
                (list.include.metadata, "metadata"),
                (list.include.snapshots, "snapshots"),
                (true, "copy"),
            ]
            .iter()
            .filter(|(on, _)| *on)
            .map(|(_, name)| *name)
            .collect();
            request = request.query("include", include.join(","));
            if let Some(token) = token {
                request = request.query("marker", token);
            }
            if let Some(max) = list.max_results {
                request = request.query("maxresults", max.to_string());
            }

            let resp = self.expect_success(request).await?;
            let body = resp
                .text()
                .await
                .map_err(|e| anyhow::anyhow!("Azure list body read failed: {}", e))?;
            Ok(parse_list_blobs(&body)?)
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
            let mut request = AzureRequest::new(Method::HEAD, &container, Some(&blob));
            if let Some(snapshot) = snapshot {
                request = request.query("snapshot", snapshot);
            }
            let resp = self.send(request).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !resp.status().is_success() {
                return Err(Self::into_error(resp, &container, Some(&blob)).await);
            }
            Ok(Some(attributes_from_headers(resp.headers())))
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
            let mut request = AzureRequest::new(Method::PUT, &container, Some(&blob))
                .header("x-ms-blob-type", "BlockBlob")
                .metadata(&metadata);
            request.content_type = Some("application/octet-stream");
            request.body = data;
            match condition {
                WriteCondition::None => {}
                WriteCondition::IfNoneMatch => request.if_none_match = Some("*".to_string()),
                WriteCondition::IfMatch(etag) => request.if_match = Some(etag),
            }
            let resp = self.expect_success(request).await?;
            Ok(write_ack(resp.headers()))
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
            let mut request = AzureRequest::new(Method::PUT, &container, Some(&blob))
                .query("comp", "metadata")
                .metadata(&metadata);
            request.if_match = if_match;
            let resp = self.expect_success(request).await?;
            Ok(write_ack(resp.headers()))
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
            let request = AzureRequest::new(Method::PUT, &container, Some(&blob))
                .header("x-ms-copy-source", source_url);
            let resp = self.expect_success(request).await?;
            let headers = resp.headers();
            let copy_id = header_str(headers, "x-ms-copy-id")
                .ok_or_else(|| anyhow::anyhow!("Azure copy response missing x-ms-copy-id"))?
                .to_string();
            let status = header_str(headers, "x-ms-copy-status")
                .and_then(CopyStatus::parse)
                .unwrap_or(CopyStatus::Pending);
            Ok(CopyOutcome { copy_id, status })
        })
    }

    fn abort_copy(&self, container: &str, blob: &str, copy_id: &str) -> StoreFuture<'_, ()> {
        let container = container.to_string();
        let blob = blob.to_string();
        let copy_id = copy_id.to_string();
        Box::pin(async move {
            let request = AzureRequest::new(Method::PUT, &container, Some(&blob))
                .query("comp", "copy")
                .query("copyid", copy_id)
                .header("x-ms-copy-action", "abort");
            self.expect_success(request).await?;
            Ok(())
        })
    }

    fn delete_if_exists(&self, container: &str, blob: &str) -> StoreFuture<'_, bool> {
        let container = container.to_string();
        let blob = blob.to_string();
        Box::pin(async move {
            let request = AzureRequest::new(Method::DELETE, &container, Some(&blob))
                .header("x-ms-delete-snapshots", "include");
            let resp = self.send(request).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(false);
            }
            if !resp.status().is_success() {
                return Err(Self::into_error(resp, &container, Some(&blob)).await);
            }
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn test_store() -> AzureBlobStore {
        AzureBlobStore {
            client: reqwest::Client::new(),
            account: "acct".to_string(),
            base_url: "https://acct.blob.core.windows.net".to_string(),
            auth: AzureAuth::SasToken {
                token: "sv=2023&sig=abc".to_string(),
            },
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_string_to_sign_layout() {
        let mut request = AzureRequest::new(Method::PUT, "cont", Some("dir/blob.txt"))
            .query("comp", "metadata")
            .header("x-ms-meta-color", "blue");
        request.if_match = Some("\"0x1\"".to_string());
        request.body = Bytes::from_static(b"hello");
        request.content_type = Some("application/octet-stream");

        let sts = string_to_sign("acct", &request, "Mon, 01 Jan 2024 00:00:00 GMT");
        let lines: Vec<&str> = sts.split('\n').collect();
        assert_eq!(lines[0], "PUT");
        assert_eq!(lines[3], "5");
        assert_eq!(lines[5], "application/octet-stream");
        assert_eq!(lines[8], "\"0x1\"");
        assert_eq!(lines[9], "");
        assert_eq!(lines[12], "x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT");
        assert_eq!(lines[13], "x-ms-meta-color:blue");
        assert_eq!(lines[14], format!("x-ms-version:{}", AZURE_API_VERSION));
        assert_eq!(lines[15], "/acct/cont/dir/blob.txt");
        assert_eq!(lines[16], "comp:metadata");
    }

    #[test]
    fn test_empty_body_has_empty_content_length() {
        let request = AzureRequest::new(Method::DELETE, "cont", Some("b"));
        let sts = string_to_sign("acct", &request, "d");
        assert_eq!(sts.split('\n').nth(3), Some(""));
    }

    #[test]
    fn test_blob_url_encoding_and_sas() {
        let store = test_store();
        assert_eq!(
            store.blob_url("cont", "a b/c.txt"),
            "https://acct.blob.core.windows.net/cont/a%20b/c.txt?sv=2023&sig=abc"
        );
    }

    #[test]
    fn test_parse_list_blobs() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="cont">
  <Prefix>a/</Prefix>
  <Blobs>
    <Blob>
      <Name>a/one.txt</Name>
      <Snapshot>2024-01-01T00:00:00.0000000Z</Snapshot>
      <Properties>
        <Last-Modified>Mon, 01 Jan 2024 00:00:00 GMT</Last-Modified>
        <Etag>0x8D1</Etag>
        <Content-Length>12</Content-Length>
        <Content-Type>text/plain</Content-Type>
        <Content-MD5>abc==</Content-MD5>
      </Properties>
      <Metadata><Replicate>true</Replicate></Metadata>
    </Blob>
    <Blob>
      <Name>a/two&amp;three.txt</Name>
      <Properties>
        <Etag>0x8D2</Etag>
        <Content-Length>0</Content-Length>
        <CopyId>cid</CopyId>
        <CopyStatus>pending</CopyStatus>
        <CopySource>https://other/cont/x</CopySource>
      </Properties>
    </Blob>
    <BlobPrefix><Name>a/sub/</Name></BlobPrefix>
  </Blobs>
  <NextMarker>2!opaque</NextMarker>
</EnumerationResults>"#;
        let segment = parse_list_blobs(xml).unwrap();
        assert_eq!(segment.next_token.as_deref(), Some("2!opaque"));
        assert_eq!(segment.items.len(), 3);
        match &segment.items[0] {
            ListItem::Blob(b) => {
                assert_eq!(b.name, "a/one.txt");
                assert_eq!(b.snapshot.as_deref(), Some("2024-01-01T00:00:00.0000000Z"));
                assert_eq!(b.properties.content_length, 12);
                assert_eq!(b.metadata.get("replicate").map(String::as_str), Some("true"));
            }
            other => panic!("unexpected item {:?}", other),
        }
        match &segment.items[1] {
            ListItem::Blob(b) => {
                assert_eq!(b.name, "a/two&three.txt");
                assert_eq!(b.properties.copy.as_ref().unwrap().status, CopyStatus::Pending);
            }
            other => panic!("unexpected item {:?}", other),
        }
        assert_eq!(segment.items[2], ListItem::Prefix("a/sub/".to_string()));
    }

    #[test]
    fn test_parse_empty_next_marker() {
        let xml = "<EnumerationResults><Blobs/><NextMarker/></EnumerationResults>";
        let segment = parse_list_blobs(xml).unwrap();
        assert!(segment.items.is_empty());
        assert!(segment.next_token.is_none());
    }

    #[test]
    fn test_attributes_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("etag", HeaderValue::from_static("\"0x8D3\""));
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.insert("x-ms-meta-primary_account", HeaderValue::from_static("shard1"));
        headers.insert("x-ms-copy-id", HeaderValue::from_static("id-1"));
        headers.insert("x-ms-copy-status", HeaderValue::from_static("success"));
        let attrs = attributes_from_headers(&headers);
        assert_eq!(attrs.properties.etag, "\"0x8D3\"");
        assert_eq!(attrs.properties.content_length, 42);
        assert_eq!(
            attrs.metadata.get("primary_account").map(String::as_str),
            Some("shard1")
        );
        assert_eq!(attrs.properties.copy.unwrap().status, CopyStatus::Success);
    }

    #[test]
    fn test_error_mapping() {
        let err = map_azure_error(StatusCode::NOT_FOUND, "ContainerNotFound", "c", None, "");
        assert!(matches!(err, StoreError::ContainerNotFound { .. }));
        let err = map_azure_error(StatusCode::NOT_FOUND, "BlobNotFound", "c", Some("b"), "");
        assert!(matches!(err, StoreError::BlobNotFound { .. }));
        let err = map_azure_error(
            StatusCode::PRECONDITION_FAILED,
            "ConditionNotMet",
            "c",
            Some("b"),
            "",
        );
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));
        let err = map_azure_error(StatusCode::CONFLICT, "BlobAlreadyExists", "c", Some("b"), "");
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        let err = map_azure_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "InternalError",
            "c",
            None,
            "x",
        );
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[test]
    fn test_resolve_auth_from_env() {
        std::env::set_var("BLOBSHARD_TEST_AZURE_KEY", BASE64_STANDARD.encode(b"secret"));
        let auth =
            AzureBlobStore::resolve_auth("BLOBSHARD_TEST_AZURE_KEY", "BLOBSHARD_TEST_UNSET_SAS")
                .unwrap();
        assert!(matches!(auth, AzureAuth::SharedKey { ref key_bytes } if key_bytes == b"secret"));

        std::env::set_var("BLOBSHARD_TEST_AZURE_SAS", "?sv=1&sig=2");
        let auth =
            AzureBlobStore::resolve_auth("BLOBSHARD_TEST_UNSET_KEY", "BLOBSHARD_TEST_AZURE_SAS")
                .unwrap();
        assert!(matches!(auth, AzureAuth::SasToken { ref token } if token == "sv=1&sig=2"));

        assert!(AzureBlobStore::resolve_auth("BLOBSHARD_NOPE_1", "BLOBSHARD_NOPE_2").is_err());
    }
}
