//! Replication eligibility.

use std::collections::BTreeMap;

use regex::Regex;

use crate::config::{PolicyKind, ReplicationConfig};

/// Write operation that may trigger replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationTrigger {
    /// Put Blob (create or overwrite).
    Create,
    CommitBlockList,
    SetMetadata,
    SetProperties,
    PutPage,
    Delete,
    Copy,
    /// Staging a block changes nothing visible.
    PutBlock,
    Lease,
}

impl ReplicationTrigger {
    /// Whether the operation changes replicated state at all.
    pub fn is_eligible(self) -> bool {
        !matches!(self, ReplicationTrigger::PutBlock | ReplicationTrigger::Lease)
    }
}

/// Decides which writes replicate.
#[derive(Debug, Clone)]
pub enum ReplicationPolicy {
    Disabled,
    All,
    /// User metadata `key` must equal `value`, ignoring case.
    MetadataFlag { key: String, value: String },
    /// `container/blob` must match.
    PathPattern(Regex),
}

impl ReplicationPolicy {
    pub fn from_config(config: &ReplicationConfig) -> anyhow::Result<Self> {
        Ok(match config.policy {
            PolicyKind::Disabled => ReplicationPolicy::Disabled,
            PolicyKind::All => ReplicationPolicy::All,
            PolicyKind::Metadata => ReplicationPolicy::MetadataFlag {
                key: config.metadata_name.to_lowercase(),
                value: config.metadata_value.clone(),
            },
            PolicyKind::Pattern => {
                let pattern = config
                    .pattern
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("pattern policy without a pattern"))?;
                ReplicationPolicy::PathPattern(Regex::new(pattern)?)
            }
        })
    }

    /// Whether a `trigger` on `container/blob` with `metadata` replicates.
    pub fn should_replicate(
        &self,
        trigger: ReplicationTrigger,
        container: &str,
        blob: &str,
        metadata: &BTreeMap<String, String>,
    ) -> bool {
        if !trigger.is_eligible() {
            return false;
        }
        match self {
            ReplicationPolicy::Disabled => false,
            ReplicationPolicy::All => true,
            ReplicationPolicy::MetadataFlag { key, value } => metadata
                .iter()
                .any(|(k, v)| k.eq_ignore_ascii_case(key) && v.eq_ignore_ascii_case(value)),
            ReplicationPolicy::PathPattern(re) => re.is_match(&format!("{container}/{blob}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_metadata_flag() {
        let policy = ReplicationPolicy::from_config(&ReplicationConfig::default()).unwrap();
        let on = meta(&[("Replicate", "TRUE")]);
        let off = meta(&[("replicate", "false")]);
        assert!(policy.should_replicate(ReplicationTrigger::Create, "c", "b", &on));
        assert!(!policy.should_replicate(ReplicationTrigger::Create, "c", "b", &off));
        assert!(!policy.should_replicate(ReplicationTrigger::Create, "c", "b", &BTreeMap::new()));
        assert!(!policy.should_replicate(ReplicationTrigger::PutBlock, "c", "b", &on));
        assert!(!policy.should_replicate(ReplicationTrigger::Lease, "c", "b", &on));
    }

    #[test]
    fn test_path_pattern() {
        let config = ReplicationConfig {
            policy: PolicyKind::Pattern,
            pattern: Some("^logs/.*\\.gz$".to_string()),
            ..Default::default()
        };
        let policy = ReplicationPolicy::from_config(&config).unwrap();
        let none = BTreeMap::new();
        assert!(policy.should_replicate(ReplicationTrigger::Copy, "logs", "2024/a.gz", &none));
        assert!(!policy.should_replicate(ReplicationTrigger::Copy, "logs", "2024/a.txt", &none));
        assert!(!policy.should_replicate(ReplicationTrigger::Copy, "data", "a.gz", &none));
    }

    #[test]
    fn test_all_and_disabled() {
        let none = BTreeMap::new();
        for trigger in [
            ReplicationTrigger::Create,
            ReplicationTrigger::CommitBlockList,
            ReplicationTrigger::SetMetadata,
            ReplicationTrigger::SetProperties,
            ReplicationTrigger::PutPage,
            ReplicationTrigger::Delete,
            ReplicationTrigger::Copy,
        ] {
            assert!(ReplicationPolicy::All.should_replicate(trigger, "c", "b", &none));
            assert!(!ReplicationPolicy::Disabled.should_replicate(trigger, "c", "b", &none));
        }
    }
}
