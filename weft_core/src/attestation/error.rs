//! Error types for address resolution.

use thiserror::Error;

use crate::address::{format_path, PathSegment};

/// Errors raised while resolving or writing a value at an address path.
#[derive(Debug, Clone, Error)]
pub enum AddressError {
    /// An intermediate position on the path is absent. `prefix` is the
    /// longest path prefix that resolved to a present value, so callers can
    /// synthesise the missing parents.
    #[error("not found: no value past `{}`", format_path(.prefix))]
    NotFound {
        /// Longest valid prefix of the requested path.
        prefix: Vec<PathSegment>,
    },

    /// A position on the path holds a value that cannot be traversed or
    /// written through (a primitive mid-path, or an invalid array key).
    #[error("type mismatch at `{}`: found {actual}", format_path(.prefix))]
    TypeMismatch {
        /// Path to the offending value.
        prefix: Vec<PathSegment>,
        /// JSON type name of the value actually found there.
        actual: &'static str,
    },

    /// A `data:` URI could not be parsed or decoded.
    #[error("invalid data URI: {0}")]
    InvalidDataUri(String),

    /// The fact's media type does not match the address.
    #[error("unsupported media type: expected {expected}, got {actual}")]
    UnsupportedMediaType {
        /// Media type the address requires.
        expected: String,
        /// Media type actually present.
        actual: String,
    },
}

impl AddressError {
    /// True for the not-found case, which `write_value_or_throw` recovers
    /// from by synthesising parents.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AddressError::NotFound { .. })
    }
}

/// JSON type name for diagnostics.
pub fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
