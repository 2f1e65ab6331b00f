//! Canonical JSON encoding and Keccak hashing of certificate payloads.
//!
//! The canonical form is what issuers sign and what verifiers re-hash, so it
//! must not depend on map iteration order or whitespace: object keys are
//! sorted at every depth and the output uses compact `,`/`:` separators.

use serde::Serialize;
use serde_json::{Map, Value};
use sha3::{Digest, Keccak256};

use crate::error::CertResult;

/// Encode `value` as canonical JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> CertResult<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&sort_keys(value))?)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key, sort_keys(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

pub fn keccak256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(input);
    hasher.finalize().into()
}

/// Keccak-256 as `0x`-prefixed lowercase hex.
pub fn keccak_hex(input: &[u8]) -> String {
    format!("0x{}", hex::encode(keccak256(input)))
}
