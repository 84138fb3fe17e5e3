//! Listing sort keys and continuation markers.
//!
//! Every listed item has a sort key `path + "\n" + snapshot`, with `zzzz`
//! standing in for the current version so snapshots sort ahead of it.
//! A marker is the base64 of `/{container}/{sort key}` of the last item a
//! page returned.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::errors::ShardError;

const CURRENT_VERSION_SUFFIX: &str = "zzzz";

/// Ordinal sort key of a listed item.
pub fn sort_key(path: &str, snapshot: Option<&str>) -> String {
    format!("{}\n{}", path, snapshot.unwrap_or(CURRENT_VERSION_SUFFIX))
}

/// Encode the marker resuming after the item with `key`.
pub fn encode_marker(container: &str, key: &str) -> String {
    BASE64_STANDARD.encode(format!("/{container}/{key}"))
}

/// Decode a marker issued for `container` back into a sort key.
pub fn decode_marker(container: &str, marker: &str) -> Result<String, ShardError> {
    let raw = BASE64_STANDARD
        .decode(marker.trim())
        .map_err(|_| ShardError::malformed("The marker is not valid base64"))?;
    let text = String::from_utf8(raw)
        .map_err(|_| ShardError::malformed("The marker is not valid UTF-8"))?;
    let scope = format!("/{container}/");
    text.strip_prefix(&scope)
        .map(str::to_string)
        .ok_or_else(|| ShardError::malformed("The marker was issued for a different container"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshots_sort_before_current() {
        let current = sort_key("a", None);
        let snap = sort_key("a", Some("2024-05-01T10:00:00.0000000Z"));
        let later = sort_key("a", Some("2024-05-02T10:00:00.0000000Z"));
        assert!(snap < later);
        assert!(later < current);
        assert!(current < sort_key("a/b", None));
        assert!(current < sort_key("ab", Some("2020-01-01T00:00:00.0000000Z")));
    }

    #[test]
    fn test_marker_decodes_to_key() {
        let key = sort_key("dir/caf\u{e9}.txt", Some("2024-05-01T10:00:00.0000000Z"));
        let marker = encode_marker("photos", &key);
        assert_eq!(decode_marker("photos", &marker).unwrap(), key);
    }

    #[test]
    fn test_bad_markers_are_malformed() {
        for marker in ["***", "//8="] {
            let err = decode_marker("c", marker).unwrap_err();
            assert!(matches!(err, ShardError::Malformed { .. }), "{marker}");
        }
        let other = encode_marker("other", "a\nzzzz");
        assert!(matches!(
            decode_marker("c", &other),
            Err(ShardError::Malformed { .. })
        ));
    }
}
