//! Content-based deduplication of results within one job run.
//!
//! Results are hashed with SHA-256 over a canonical JSON form: object keys
//! sorted recursively, no insignificant whitespace, array order kept, strings
//! compared byte for byte. Two results that differ only in key order or
//! formatting therefore hash identically.

use std::collections::HashMap;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Canonical serialization used for hashing.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a &String cannot fail.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(values) => {
            out.push('[');
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hex-encoded SHA-256 of the canonical form.
pub fn content_hash(value: &Value) -> String {
    hex::encode(digest(value))
}

fn digest(value: &Value) -> [u8; 32] {
    Sha256::digest(canonical_json(value).as_bytes()).into()
}

/// Registry of result hashes seen during one job run.
#[derive(Debug, Default)]
pub struct Deduplicator {
    /// hash → id of the item that first produced it
    seen: Mutex<HashMap<[u8; 32], String>>,
}

impl Deduplicator {
    /// A deduplicator that has seen nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `result` and report whether an equivalent result was already seen.
    pub async fn check_and_record(&self, result: &Value) -> bool {
        self.record_owner(result, "").await.is_some()
    }

    /// Record `result` as produced by `item_id`. Returns the id of the first
    /// item that produced an equivalent result, or `None` if this is the first.
    ///
    /// The lookup and insert happen under one lock, so two identical results
    /// racing here cannot both be treated as first.
    pub async fn record_owner(&self, result: &Value, item_id: &str) -> Option<String> {
        let hash = digest(result);
        let mut seen = self.seen.lock().await;
        match seen.get(&hash) {
            Some(owner) => Some(owner.clone()),
            None => {
                seen.insert(hash, item_id.to_string());
                None
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.lock().await.is_empty()
    }
}
