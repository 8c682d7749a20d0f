//! Content references: canonical hashing of JSON values.
//!
//! A [`Reference`] is the BLAKE3 hash of a value's canonical JSON bytes,
//! rendered as 64 lowercase hex characters. Canonical form means object
//! keys in sorted order (guaranteed by `serde_json`'s map representation)
//! and link sigils stripped of incidental attributes, so two values that
//! name the same target hash identically regardless of schema hints.

pub mod link;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reference::link::parse_link;

/// BLAKE3 hashes are 64 hex characters (256 bits).
pub const REFERENCE_LEN: usize = 64;

/// Content hash of a canonical JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reference(String);

impl Reference {
    /// Wrap an existing 64-hex-char digest, validating its format.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, InvalidReference> {
        let hex = hex.into();
        if hex.len() != REFERENCE_LEN {
            return Err(InvalidReference::Length(hex.len()));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(InvalidReference::NonHex);
        }
        Ok(Self(hex))
    }

    /// Hash raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    /// The digest as a hex string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Malformed digest string.
#[derive(Debug, thiserror::Error)]
pub enum InvalidReference {
    /// Wrong character count.
    #[error("reference must be {REFERENCE_LEN} hex characters, got {0}")]
    Length(usize),

    /// Non-hex or uppercase characters present.
    #[error("reference must be lowercase hexadecimal")]
    NonHex,
}

/// Compute the content reference of a value.
///
/// The value is normalised first, so `refer(v) == refer(normalize(v))` for
/// all `v`.
pub fn refer(value: &Value) -> Reference {
    let canonical = normalize(value);
    // serde_json::Value maps are BTreeMap-backed: serialisation emits keys
    // in sorted order, which is exactly the canonical byte form we hash.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    Reference::from_bytes(&bytes)
}

/// Normalise a value for hashing.
///
/// Link sigils are reduced to their `(id, path, space)` tuple — `schema`
/// hints do not contribute to identity. All other values pass through
/// structurally unchanged. Idempotent.
pub fn normalize(value: &Value) -> Value {
    if let Some(link) = parse_link(value) {
        return link.identity_value();
    }
    match value {
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
