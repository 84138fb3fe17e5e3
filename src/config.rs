//! Configuration loading and types for blobshard.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: the data shards, the namespace account, listings, replication,
//! logging and observability.  Components receive their subsection at
//! construction; nothing reads configuration from global state.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Ordered data shards.  Order defines shard indexes.
    #[serde(default)]
    pub shards: Vec<AccountConfig>,

    /// Namespace directory settings.
    #[serde(default)]
    pub namespace: NamespaceConfig,

    /// Merged listing settings.
    #[serde(default)]
    pub listing: ListingConfig,

    /// Replication policy, queue and worker settings.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + admin endpoint).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shards: Vec::new(),
            namespace: NamespaceConfig::default(),
            listing: ListingConfig::default(),
            replication: ReplicationConfig::default(),
            logging: LoggingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Which object store implementation backs an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store; contents are lost on exit.
    #[default]
    Memory,
    /// Azure Blob Storage over REST.
    Azure,
}

/// One physical storage account.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Account name.  Unique across shards and the namespace account.
    pub name: String,

    #[serde(default)]
    pub backend: BackendKind,

    /// Custom blob endpoint (e.g. an Azurite emulator).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Environment variable holding the base64 account key.
    #[serde(default)]
    pub key_env: Option<String>,

    /// Environment variable holding a SAS token.
    #[serde(default)]
    pub sas_env: Option<String>,

    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl AccountConfig {
    /// A memory-backed account named `name`.
    pub fn memory(name: &str) -> Self {
        Self {
            name: name.to_string(),
            backend: BackendKind::Memory,
            endpoint: None,
            key_env: None,
            sas_env: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// Key variable, defaulting to `BLOBSHARD_<NAME>_KEY`.
    pub fn key_env(&self) -> String {
        self.key_env
            .clone()
            .unwrap_or_else(|| format!("BLOBSHARD_{}_KEY", env_suffix(&self.name)))
    }

    /// SAS variable, defaulting to `BLOBSHARD_<NAME>_SAS`.
    pub fn sas_env(&self) -> String {
        self.sas_env
            .clone()
            .unwrap_or_else(|| format!("BLOBSHARD_{}_SAS", env_suffix(&self.name)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn env_suffix(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Namespace directory configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceConfig {
    /// Account storing namespace records.
    #[serde(default = "default_namespace_account")]
    pub account: AccountConfig,

    /// Compare-and-swap attempts before a write reports a conflict.
    #[serde(default = "default_cas_retries")]
    pub cas_retries: u32,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            account: default_namespace_account(),
            cas_retries: default_cas_retries(),
        }
    }
}

/// What a timed-out shard listing turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Fail the whole listing.
    #[default]
    Fail,
    /// Treat the shard as empty.
    Empty,
}

/// Merged listing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingConfig {
    /// Deadline for each backend listing call, in milliseconds.
    #[serde(default = "default_listing_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,

    /// Page size when the caller does not ask for one.
    #[serde(default = "default_max_results")]
    pub default_max_results: u32,

    /// Page size requested from each shard; backend default if unset.
    #[serde(default)]
    pub shard_page_size: Option<u32>,
}

impl ListingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_listing_timeout_ms(),
            timeout_policy: TimeoutPolicy::default(),
            default_max_results: default_max_results(),
            shard_page_size: None,
        }
    }
}

/// How replication eligibility is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Disabled,
    All,
    /// A user metadata attribute must carry a given value.
    #[default]
    Metadata,
    /// `container/blob` must match a regular expression.
    Pattern,
}

/// Replication job queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Replication job queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,

    /// SQLite database path.
    #[serde(default = "default_queue_path")]
    pub path: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            path: default_queue_path(),
        }
    }
}

/// Replication configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub policy: PolicyKind,

    /// Metadata attribute checked by the `metadata` policy.
    #[serde(default = "default_metadata_name")]
    pub metadata_name: String,

    /// Value (case-insensitive) the attribute must carry.
    #[serde(default = "default_metadata_value")]
    pub metadata_value: String,

    /// Regular expression for the `pattern` policy.
    #[serde(default)]
    pub pattern: Option<String>,

    #[serde(default)]
    pub queue: QueueConfig,

    /// Jobs leased per worker iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Lease length before an unacknowledged job is redelivered.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Deliveries after which a job is dropped.
    #[serde(default = "default_max_dequeue_count")]
    pub max_dequeue_count: u32,

    /// Delay before checking a pending copy again.
    #[serde(default = "default_copy_poll_interval_ms")]
    pub copy_poll_interval_ms: u64,

    /// Pending copies older than this are aborted and restarted.
    #[serde(default = "default_copy_timeout_secs")]
    pub copy_timeout_secs: u64,

    /// Deadline for a single copy status check.
    #[serde(default = "default_progress_check_timeout_ms")]
    pub progress_check_timeout_ms: u64,

    /// Worker sleep when the queue is empty.
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
}

impl ReplicationConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn copy_poll_interval(&self) -> Duration {
        Duration::from_millis(self.copy_poll_interval_ms)
    }

    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs)
    }

    pub fn progress_check_timeout(&self) -> Duration {
        Duration::from_millis(self.progress_check_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            metadata_name: default_metadata_name(),
            metadata_value: default_metadata_value(),
            pattern: None,
            queue: QueueConfig::default(),
            batch_size: default_batch_size(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_dequeue_count: default_max_dequeue_count(),
            copy_poll_interval_ms: default_copy_poll_interval_ms(),
            copy_timeout_secs: default_copy_timeout_secs(),
            progress_check_timeout_ms: default_progress_check_timeout_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Bind address of the worker's admin endpoint (`/healthz`, `/metrics`).
    #[serde(default = "default_admin_bind")]
    pub admin_bind: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            admin_bind: default_admin_bind(),
        }
    }
}

// -- Default value functions --------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_namespace_account() -> AccountConfig {
    AccountConfig::memory("namespace")
}

fn default_cas_retries() -> u32 {
    3
}

fn default_listing_timeout_ms() -> u64 {
    30_000
}

fn default_max_results() -> u32 {
    5000
}

fn default_queue_path() -> String {
    "./data/replication-queue.db".to_string()
}

fn default_metadata_name() -> String {
    "replicate".to_string()
}

fn default_metadata_value() -> String {
    "true".to_string()
}

fn default_batch_size() -> usize {
    32
}

fn default_visibility_timeout_secs() -> u64 {
    60
}

fn default_max_dequeue_count() -> u32 {
    10
}

fn default_copy_poll_interval_ms() -> u64 {
    5000
}

fn default_copy_timeout_secs() -> u64 {
    3600
}

fn default_progress_check_timeout_ms() -> u64 {
    30_000
}

fn default_idle_sleep_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_admin_bind() -> String {
    "127.0.0.1:9464".to_string()
}

impl Config {
    /// Check invariants serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.shards.is_empty() {
            anyhow::bail!("at least one shard must be configured");
        }
        let mut seen = std::collections::HashSet::new();
        for account in self.shards.iter().chain(std::iter::once(&self.namespace.account)) {
            if account.name.is_empty() {
                anyhow::bail!("account names must not be empty");
            }
            if !seen.insert(account.name.as_str()) {
                anyhow::bail!("duplicate account name: {}", account.name);
            }
        }
        if self.namespace.cas_retries == 0 {
            anyhow::bail!("namespace.cas_retries must be at least 1");
        }
        if self.listing.default_max_results == 0 {
            anyhow::bail!("listing.default_max_results must be at least 1");
        }
        if self.replication.policy == PolicyKind::Pattern {
            let pattern = self
                .replication
                .pattern
                .as_deref()
                .ok_or_else(|| {
                    anyhow::anyhow!("replication.pattern is required for the pattern policy")
                })?;
            regex::Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("invalid replication.pattern: {}", e))?;
        }
        Ok(())
    }
}

/// Load and validate configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let config: Config = serde_yaml::from_str("shards:\n  - name: shard0\n").unwrap();
        config.validate().unwrap();
        assert_eq!(config.shards[0].backend, BackendKind::Memory);
        assert_eq!(config.namespace.account.name, "namespace");
        assert_eq!(config.namespace.cas_retries, 3);
        assert_eq!(config.listing.timeout_policy, TimeoutPolicy::Fail);
        assert_eq!(config.listing.default_max_results, 5000);
        assert_eq!(config.replication.policy, PolicyKind::Metadata);
        assert_eq!(config.replication.metadata_name, "replicate");
        assert_eq!(config.replication.queue.backend, QueueBackend::Memory);
        assert!(config.observability.metrics);
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
shards:
  - name: east
    backend: azure
    endpoint: http://127.0.0.1:10000/east
    key_env: EAST_KEY
  - name: west-2
    backend: azure
namespace:
  account:
    name: ns
  cas_retries: 5
listing:
  timeout_ms: 250
  timeout_policy: empty
  shard_page_size: 100
replication:
  policy: pattern
  pattern: "^logs/"
  queue:
    backend: sqlite
    path: /tmp/q.db
  batch_size: 8
logging:
  level: debug
  format: json
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.shards[0].key_env(), "EAST_KEY");
        assert_eq!(config.shards[1].key_env(), "BLOBSHARD_WEST_2_KEY");
        assert_eq!(config.shards[1].sas_env(), "BLOBSHARD_WEST_2_SAS");
        assert_eq!(config.listing.timeout(), Duration::from_millis(250));
        assert_eq!(config.listing.timeout_policy, TimeoutPolicy::Empty);
        assert_eq!(config.listing.shard_page_size, Some(100));
        assert_eq!(config.replication.queue.backend, QueueBackend::Sqlite);
        assert_eq!(config.replication.batch_size, 8);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(Config::default().validate().is_err());

        let dup: Config =
            serde_yaml::from_str("shards:\n  - name: a\n  - name: a\n").unwrap();
        assert!(dup.validate().is_err());

        let clash: Config =
            serde_yaml::from_str("shards:\n  - name: namespace\n").unwrap();
        assert!(clash.validate().is_err());

        let pattern: Config = serde_yaml::from_str(
            "shards:\n  - name: a\nreplication:\n  policy: pattern\n",
        )
        .unwrap();
        assert!(pattern.validate().is_err());

        let bad_regex: Config = serde_yaml::from_str(
            "shards:\n  - name: a\nreplication:\n  policy: pattern\n  pattern: \"(\"\n",
        )
        .unwrap();
        assert!(bad_regex.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "shards:\n  - name: s0\n  - name: s1").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.shards.len(), 2);
    }
}
