//! Link sigils: embedded references between fact values.
//!
//! A link is the JSON shape `{"/": {"link@1": {id, path?, space?, schema?}}}`.
//! Anything else is not a link. A link whose `id` begins `data:` embeds
//! immutable JSON directly as a data URI instead of naming an entity.

use base64::Engine;
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::address::{Address, EntityId, SpaceId};
use crate::attestation::error::AddressError;

/// Sigil wrapper key.
const SIGIL_KEY: &str = "/";

/// Versioned link tag inside the sigil.
pub const LINK_TAG: &str = "link@1";

/// Parsed form of a link sigil.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    /// Target entity id (`of:...`) or a `data:` URI.
    pub id: EntityId,

    /// Path into the target value. Stored as raw strings; array positions
    /// are digit strings on the wire.
    pub path: Vec<String>,

    /// Target space; `None` means the same space as the containing fact.
    pub space: Option<SpaceId>,

    /// Optional schema hint. Ignored for link identity.
    pub schema: Option<Value>,
}

impl Link {
    /// Link to an entity's root in the implicit space.
    pub fn to_entity(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            path: Vec::new(),
            space: None,
            schema: None,
        }
    }

    /// Set the path into the target.
    pub fn at(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }

    /// Set an explicit target space.
    pub fn in_space(mut self, space: SpaceId) -> Self {
        self.space = Some(space);
        self
    }

    /// Attach a schema hint.
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// True when the target is a data URI rather than an entity.
    pub fn is_data_uri(&self) -> bool {
        self.id.is_data_uri()
    }

    /// Structural identity comparison, ignoring schema hints.
    pub fn same_target(&self, other: &Link) -> bool {
        self.id == other.id && self.path == other.path && self.space == other.space
    }

    /// Resolve this link to a concrete address, defaulting the space to the
    /// one containing the link.
    pub fn to_address(&self, ambient: &SpaceId, the: &str) -> Address {
        let space = self.space.clone().unwrap_or_else(|| ambient.clone());
        let path = self
            .path
            .iter()
            .map(|s| match s.parse::<usize>() {
                Ok(i) => crate::address::PathSegment::Index(i),
                Err(_) => crate::address::PathSegment::Key(s.clone()),
            })
            .collect();
        Address::new(space, self.id.clone(), the).with_path(path)
    }

    /// Render as a sigil value, including the schema hint if present.
    pub fn to_value(&self) -> Value {
        let mut body = Map::new();
        body.insert("id".to_string(), Value::String(self.id.as_str().to_string()));
        if !self.path.is_empty() {
            body.insert(
                "path".to_string(),
                Value::Array(self.path.iter().map(|s| Value::String(s.clone())).collect()),
            );
        }
        if let Some(space) = &self.space {
            body.insert("space".to_string(), Value::String(space.as_str().to_string()));
        }
        if let Some(schema) = &self.schema {
            body.insert("schema".to_string(), schema.clone());
        }

        let mut tagged = Map::new();
        tagged.insert(LINK_TAG.to_string(), Value::Object(body));
        let mut sigil = Map::new();
        sigil.insert(SIGIL_KEY.to_string(), Value::Object(tagged));
        Value::Object(sigil)
    }

    /// Render as a sigil value with incidental attributes stripped. This is
    /// the form content hashing sees.
    pub fn identity_value(&self) -> Value {
        Link {
            id: self.id.clone(),
            path: self.path.clone(),
            space: self.space.clone(),
            schema: None,
        }
        .to_value()
    }
}

/// Parse a value as a link sigil. Returns `None` on any non-link shape,
/// including sigil-like objects with extra keys or an unknown tag.
pub fn parse_link(value: &Value) -> Option<Link> {
    let outer = value.as_object()?;
    if outer.len() != 1 {
        return None;
    }
    let tagged = outer.get(SIGIL_KEY)?.as_object()?;
    if tagged.len() != 1 {
        return None;
    }
    let body = tagged.get(LINK_TAG)?.as_object()?;

    let id = EntityId::new(body.get("id")?.as_str()?);
    let path = match body.get("path") {
        None => Vec::new(),
        Some(Value::Array(items)) => {
            let mut path = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => path.push(s.clone()),
                    Value::Number(n) => path.push(n.to_string()),
                    _ => return None,
                }
            }
            path
        }
        Some(_) => return None,
    };
    let space = match body.get("space") {
        None => None,
        Some(Value::String(s)) => Some(SpaceId::new(s.clone())),
        Some(_) => return None,
    };
    let schema = body.get("schema").cloned();

    for key in body.keys() {
        if !matches!(key.as_str(), "id" | "path" | "space" | "schema") {
            return None;
        }
    }

    Some(Link { id, path, space, schema })
}

/// Structural link comparison ignoring schema hints. Non-links never match.
pub fn are_links_same(a: &Value, b: &Value) -> bool {
    match (parse_link(a), parse_link(b)) {
        (Some(a), Some(b)) => a.same_target(&b),
        _ => false,
    }
}

/// A decoded `data:` URI payload.
#[derive(Debug, Clone)]
pub struct DataUri {
    /// Declared media type (`application/json` in this core).
    pub media_type: String,

    /// Raw decoded payload bytes.
    pub payload: Bytes,
}

impl DataUri {
    /// Parse `data:<media>[;base64],<payload>`.
    pub fn parse(uri: &str) -> Result<Self, AddressError> {
        let rest = uri
            .strip_prefix("data:")
            .ok_or_else(|| AddressError::InvalidDataUri(uri.to_string()))?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| AddressError::InvalidDataUri(uri.to_string()))?;

        let (media_type, is_base64) = match header.strip_suffix(";base64") {
            Some(media) => (media, true),
            None => (header, false),
        };
        let media_type = if media_type.is_empty() {
            "text/plain".to_string()
        } else {
            media_type.to_string()
        };

        let bytes = if is_base64 {
            base64::engine::general_purpose::STANDARD
                .decode(payload)
                .map_err(|_| AddressError::InvalidDataUri(uri.to_string()))?
        } else {
            // Percent-decoding is intentionally minimal: JSON payloads in
            // practice only need %20 / %22 / %7B-style escapes.
            percent_decode(payload).map_err(|_| AddressError::InvalidDataUri(uri.to_string()))?
        };

        Ok(Self {
            media_type,
            payload: Bytes::from(bytes),
        })
    }

    /// Decode the payload as JSON, checking the media type against the
    /// expected one from the address.
    pub fn json(&self, expected_media_type: &str) -> Result<Value, AddressError> {
        if self.media_type != expected_media_type {
            return Err(AddressError::UnsupportedMediaType {
                expected: expected_media_type.to_string(),
                actual: self.media_type.clone(),
            });
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| AddressError::InvalidDataUri(e.to_string()))
    }
}

fn percent_decode(input: &str) -> Result<Vec<u8>, ()> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input.get(i + 1..i + 3).ok_or(())?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| ())?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}
