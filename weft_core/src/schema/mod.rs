//! Schema engine: the JSON-schema subset that drives reads.
//!
//! Supported keywords: `type`, `properties`, `additionalProperties`,
//! `items`, `prefixItems`, `required`, `$ref` (fragment pointers plus a
//! small table of known absolute refs), `$defs`, `anyOf`, `oneOf` — and
//! the engine annotations `asCell`, `asStream`, and `ifc`.

pub mod walk;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use walk::{is_always_true, labels_at, schema_at_path, SchemaWalk};

/// A schema: either a boolean (`true` accepts everything, `false`
/// nothing) or a node with keywords.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Schema {
    /// Boolean schema.
    Bool(bool),

    /// Keyword schema.
    Node(Box<SchemaNode>),
}

impl Schema {
    /// The schema accepting every value.
    pub fn always() -> Self {
        Schema::Bool(true)
    }

    /// The schema rejecting every value.
    pub fn never() -> Self {
        Schema::Bool(false)
    }

    /// Wrap a node.
    pub fn node(node: SchemaNode) -> Self {
        Schema::Node(Box::new(node))
    }

    /// Parse a schema from its JSON form.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Render to the JSON form.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Bool(true))
    }

    /// The node, if this is a keyword schema.
    pub fn as_node(&self) -> Option<&SchemaNode> {
        match self {
            Schema::Node(node) => Some(node),
            Schema::Bool(_) => None,
        }
    }

    /// True when a sub-cell handle replaces the value at this position.
    pub fn is_cell(&self) -> bool {
        self.as_node().and_then(|n| n.as_cell).unwrap_or(false)
    }

    /// True when this position is an event stream.
    pub fn is_stream(&self) -> bool {
        self.as_node().and_then(|n| n.as_stream).unwrap_or(false)
    }

    /// Classification labels attached directly to this schema.
    pub fn labels(&self) -> Vec<crate::cfc::Label> {
        self.as_node()
            .and_then(|n| n.ifc.as_ref())
            .map(|ifc| {
                ifc.classification
                    .iter()
                    .map(|name| crate::cfc::Label::new(name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// `type` keyword: a single name or a list of alternatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeSpec {
    /// One type name.
    One(String),

    /// Any of several type names.
    Many(Vec<String>),
}

/// Flow-control annotation carried by a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfcAnnotation {
    /// Classification labels attached at this position.
    pub classification: Vec<String>,
}

/// A keyword schema node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchemaNode {
    /// `type` keyword.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<TypeSpec>,

    /// Named object properties.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Schema>>,

    /// Schema for properties not named in `properties`. Absent means
    /// everything is allowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<Box<Schema>>,

    /// Schema for array elements past `prefixItems`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,

    /// Per-position schemas for the first array elements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_items: Option<Vec<Schema>>,

    /// Required property names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,

    /// `$ref` keyword.
    #[serde(rename = "$ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    /// `$defs` keyword.
    #[serde(rename = "$defs", skip_serializing_if = "Option::is_none")]
    pub defs: Option<BTreeMap<String, Schema>>,

    /// `anyOf` alternatives.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub any_of: Option<Vec<Schema>>,

    /// `oneOf` alternatives (walked like `anyOf`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<Schema>>,

    /// Replace the value at this position with a sub-cell handle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_cell: Option<bool>,

    /// As `asCell`, but the position is an event stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_stream: Option<bool>,

    /// Classification labels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ifc: Option<IfcAnnotation>,
}

/// Resolve a `$ref` against the root schema.
///
/// Fragment JSON pointers (`#`, `#/$defs/name`, `#/properties/x/items`,
/// …) are walked structurally; a small table of known absolute refs is
/// honoured; anything else resolves to `None` (treated as failure by
/// callers).
pub fn resolve_ref(root: &Schema, reference: &str) -> Option<Schema> {
    if let Some(known) = known_ref(reference) {
        return Some(known);
    }

    let pointer = reference.strip_prefix('#')?;
    if pointer.is_empty() {
        return Some(root.clone());
    }

    // Walk the pointer in (keyword, key) steps; single-schema keywords
    // consume one segment, keyed containers two.
    let mut segments = pointer.strip_prefix('/')?.split('/');
    let mut current = root.clone();
    loop {
        let Some(raw) = segments.next() else {
            return Some(current);
        };
        let keyword = unescape(raw);
        let node = current.as_node()?.clone();
        current = match keyword.as_str() {
            "items" => (*node.items?).clone(),
            "additionalProperties" => (*node.additional_properties?).clone(),
            "$defs" => {
                let key = unescape(segments.next()?);
                node.defs?.get(&key)?.clone()
            }
            "properties" => {
                let key = unescape(segments.next()?);
                node.properties?.get(&key)?.clone()
            }
            "prefixItems" => {
                let index: usize = segments.next()?.parse().ok()?;
                node.prefix_items?.get(index)?.clone()
            }
            "anyOf" => {
                let index: usize = segments.next()?.parse().ok()?;
                node.any_of?.get(index)?.clone()
            }
            "oneOf" => {
                let index: usize = segments.next()?.parse().ok()?;
                node.one_of?.get(index)?.clone()
            }
            _ => return None,
        };
    }
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Absolute refs the engine knows without fetching anything.
fn known_ref(reference: &str) -> Option<Schema> {
    match reference {
        "https://json-schema.org/draft/2020-12/schema"
        | "http://json-schema.org/draft-07/schema#" => Some(Schema::always()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_bool_and_node() {
        assert_eq!(Schema::from_value(&json!(true)), Some(Schema::always()));
        assert_eq!(Schema::from_value(&json!(false)), Some(Schema::never()));

        let schema = Schema::from_value(&json!({
            "type": "object",
            "properties": {"n": {"type": "number"}},
            "required": ["n"],
        }))
        .unwrap();
        let node = schema.as_node().unwrap();
        assert_eq!(node.schema_type, Some(TypeSpec::One("object".to_string())));
        assert!(node.properties.as_ref().unwrap().contains_key("n"));
        assert_eq!(node.required, Some(vec!["n".to_string()]));
    }

    #[test]
    fn test_parse_annotations() {
        let schema = Schema::from_value(&json!({
            "asCell": true,
            "ifc": {"classification": ["secret"]},
        }))
        .unwrap();
        assert!(schema.is_cell());
        assert!(!schema.is_stream());
        assert_eq!(schema.labels(), vec![crate::cfc::Label::new("secret")]);
    }

    #[test]
    fn test_serde_roundtrip_preserves_keywords() {
        let value = json!({
            "anyOf": [{"type": "string"}, {"type": "number"}],
            "prefixItems": [{"type": "boolean"}],
            "additionalProperties": false,
            "asStream": true,
        });
        let schema = Schema::from_value(&value).unwrap();
        assert_eq!(schema.to_value(), value);
    }

    #[test]
    fn test_resolve_root_ref() {
        let root = Schema::from_value(&json!({"type": "number"})).unwrap();
        assert_eq!(resolve_ref(&root, "#"), Some(root.clone()));
    }

    #[test]
    fn test_resolve_defs_ref() {
        let root = Schema::from_value(&json!({
            "$defs": {
                "item": {"type": "string"},
                "list": {"type": "array", "items": {"$ref": "#/$defs/item"}},
            },
        }))
        .unwrap();
        let item = resolve_ref(&root, "#/$defs/item").unwrap();
        assert_eq!(item, Schema::from_value(&json!({"type": "string"})).unwrap());

        let nested = resolve_ref(&root, "#/$defs/list/items").unwrap();
        assert_eq!(
            nested,
            Schema::from_value(&json!({"$ref": "#/$defs/item"})).unwrap()
        );
    }

    #[test]
    fn test_resolve_properties_pointer() {
        let root = Schema::from_value(&json!({
            "properties": {"a": {"properties": {"b": {"type": "null"}}}},
        }))
        .unwrap();
        let b = resolve_ref(&root, "#/properties/a/properties/b").unwrap();
        assert_eq!(b, Schema::from_value(&json!({"type": "null"})).unwrap());
    }

    #[test]
    fn test_unknown_ref_is_none() {
        let root = Schema::always();
        assert_eq!(resolve_ref(&root, "https://example.com/schema.json"), None);
        assert_eq!(resolve_ref(&root, "#/$defs/missing"), None);
        assert_eq!(resolve_ref(&root, "not-a-fragment"), None);
    }

    #[test]
    fn test_known_absolute_refs() {
        let root = Schema::never();
        assert_eq!(
            resolve_ref(&root, "https://json-schema.org/draft/2020-12/schema"),
            Some(Schema::always())
        );
    }

    #[test]
    fn test_pointer_escapes() {
        let root = Schema::from_value(&json!({
            "$defs": {"a/b": {"type": "string"}},
        }))
        .unwrap();
        let schema = resolve_ref(&root, "#/$defs/a~1b").unwrap();
        assert_eq!(schema, Schema::from_value(&json!({"type": "string"})).unwrap());
    }
}
