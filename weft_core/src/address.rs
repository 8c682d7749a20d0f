//! Addressing types: spaces, entities, media types, and value paths.
//!
//! An [`Address`] names a sub-value inside one fact: the owning space, the
//! entity, the media type of the fact, and a path into its JSON value. An
//! empty path addresses the whole fact value.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The only media type the core stores.
pub const JSON_MEDIA_TYPE: &str = "application/json";

/// Identifier of an authorisation/ownership domain. Each space holds its
/// own replica and commit sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceId(String);

impl SpaceId {
    /// Create a space identifier from its DID (or any opaque string).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpaceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Opaque entity identifier, rendered as `of:<suffix>`.
///
/// Link targets may instead carry a `data:` URI in the identifier position;
/// [`EntityId::is_data_uri`] distinguishes the two.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    const PREFIX: &'static str = "of:";

    /// Create an entity id from an already-prefixed string (`of:...` or a
    /// `data:` URI).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create an entity id from a bare suffix, adding the `of:` prefix.
    pub fn of(suffix: impl AsRef<str>) -> Self {
        Self(format!("{}{}", Self::PREFIX, suffix.as_ref()))
    }

    /// The identifier as a string slice, prefix included.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The suffix after `of:`, or the whole string if unprefixed.
    pub fn suffix(&self) -> &str {
        self.0.strip_prefix(Self::PREFIX).unwrap_or(&self.0)
    }

    /// True when the identifier embeds immutable JSON as a data URI.
    pub fn is_data_uri(&self) -> bool {
        self.0.starts_with("data:")
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// One step of a path into a JSON value: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Array index.
    Index(usize),
    /// Object key. On arrays only `"length"` is accepted.
    Key(String),
}

impl PathSegment {
    /// Interpret this segment as an array index if possible. A `Key` made
    /// of ASCII digits counts (JSON object keys are always strings on the
    /// wire).
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(i) => Some(*i),
            PathSegment::Key(k) => k.parse::<usize>().ok(),
        }
    }

    /// True when this segment is the array `length` pseudo-key.
    pub fn is_length(&self) -> bool {
        matches!(self, PathSegment::Key(k) if k == "length")
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => f.write_str(k),
            PathSegment::Index(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(s: &str) -> Self {
        PathSegment::Key(s.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(s: String) -> Self {
        PathSegment::Key(s)
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        PathSegment::Index(i)
    }
}

/// Render a path as a dotted string for error messages and logs.
pub fn format_path(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for (i, seg) in path.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        out.push_str(&seg.to_string());
    }
    out
}

/// Full address of a sub-value: `(space, id, the)` plus a path into the
/// fact value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Owning space.
    pub space: SpaceId,

    /// Entity within the space.
    pub id: EntityId,

    /// Media type of the fact (`the` in the wire form).
    pub the: String,

    /// Path into the JSON value; empty means the whole value.
    pub path: Vec<PathSegment>,
}

impl Address {
    /// Address the root value of an entity's JSON fact.
    pub fn root(space: SpaceId, id: EntityId) -> Self {
        Self {
            space,
            id,
            the: JSON_MEDIA_TYPE.to_string(),
            path: Vec::new(),
        }
    }

    /// Address with an explicit media type.
    pub fn new(space: SpaceId, id: EntityId, the: impl Into<String>) -> Self {
        Self {
            space,
            id,
            the: the.into(),
            path: Vec::new(),
        }
    }

    /// Replace the path.
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }

    /// Derive the address of a child position.
    pub fn child(&self, segment: impl Into<PathSegment>) -> Self {
        let mut path = self.path.clone();
        path.push(segment.into());
        Self {
            space: self.space.clone(),
            id: self.id.clone(),
            the: self.the.clone(),
            path,
        }
    }

    /// True when this address names the whole fact value.
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// The `(id, the)` pair used as the replica key.
    pub fn entity_key(&self) -> (EntityId, String) {
        (self.id.clone(), self.the.clone())
    }

    /// True when `self`'s path is a prefix of `other`'s (or equal) and both
    /// name the same entity. Used for overlap checks between claims.
    pub fn covers(&self, other: &Address) -> bool {
        self.space == other.space
            && self.id == other.id
            && self.the == other.the
            && self.path.len() <= other.path.len()
            && self.path.iter().zip(other.path.iter()).all(|(a, b)| a == b)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.space, self.id, self.the)?;
        if !self.path.is_empty() {
            write!(f, "#{}", format_path(&self.path))?;
        }
        Ok(())
    }
}
