//! Cursor generation. A cursor is an opaque, human-meaningful string handed
//! back to clients and echoed on the next pull — ordering authority rests
//! with the Store's monotonic event `id`, never with the cursor text itself.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Produces `"{epoch_ms}_{16 hex chars of sha256(iso_timestamp, client_id, operation_json)}"`.
///
/// The epoch-millisecond prefix makes cursors sort roughly chronologically
/// at a glance; the hash suffix makes them unique even when two operations
/// from different clients land in the same millisecond.
pub fn generate(ts: DateTime<Utc>, client_id: &str, operation_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ts.to_rfc3339().as_bytes());
    hasher.update(client_id.as_bytes());
    hasher.update(operation_json.as_bytes());
    let digest = hasher.finalize();
    let hex = hex_prefix(&digest, 8);
    format!("{}_{}", ts.timestamp_millis(), hex)
}

fn hex_prefix(bytes: &[u8], byte_count: usize) -> String {
    bytes
        .iter()
        .take(byte_count)
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_is_deterministic_for_same_inputs() {
        let ts = Utc::now();
        let a = generate(ts, "alice", r#"{"op":"setCell"}"#);
        let b = generate(ts, "alice", r#"{"op":"setCell"}"#);
        assert_eq!(a, b);
    }

    #[test]
    fn cursor_differs_on_any_input_change() {
        let ts = Utc::now();
        let a = generate(ts, "alice", r#"{"op":"setCell"}"#);
        let b = generate(ts, "bob", r#"{"op":"setCell"}"#);
        assert_ne!(a, b);
    }

    #[test]
    fn cursor_has_epoch_ms_prefix_and_16_hex_suffix() {
        let ts = Utc::now();
        let cursor = generate(ts, "alice", "{}");
        let (prefix, suffix) = cursor.split_once('_').unwrap();
        assert_eq!(prefix, ts.timestamp_millis().to_string());
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
