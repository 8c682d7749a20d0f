//! Schema-at-path computation.
//!
//! Walking a schema mirrors walking the value: object keys go through
//! `properties` / `additionalProperties`, array indices through
//! `prefixItems` / `items`, and `anyOf` / `oneOf` recurse into every
//! branch with the reduced alternatives re-assembled at the end. `$ref`s
//! are resolved on entry with a scope-guarded cycle tracker. Labels from
//! `ifc` annotations are collected along the whole walk.

use std::collections::HashSet;

use crate::address::PathSegment;
use crate::cfc::Label;

use super::{resolve_ref, Schema, SchemaNode, TypeSpec};

/// Result of a schema walk: the schema governing the final position
/// (`None` when a `$ref` failed to resolve) plus the labels encountered.
#[derive(Debug, Clone)]
pub struct SchemaWalk {
    /// Schema at the path, reduced.
    pub schema: Option<Schema>,

    /// Classification labels collected along the walk.
    pub labels: Vec<Label>,
}

/// Compute the schema governing `path` under `root`.
pub fn schema_at_path(root: &Schema, path: &[PathSegment]) -> SchemaWalk {
    let mut labels = Vec::new();
    let schema = walk(root, root, path, &mut labels, &mut HashSet::new());
    SchemaWalk { schema, labels }
}

/// Labels encountered walking `path` under `root`.
pub fn labels_at(root: &Schema, path: &[PathSegment]) -> Vec<Label> {
    schema_at_path(root, path).labels
}

/// True when the schema accepts everything, ignoring only the engine
/// annotations (`asCell`, `asStream`, `ifc`). `$defs` carries no
/// constraint of its own and is ignored too.
pub fn is_always_true(schema: &Schema) -> bool {
    match schema {
        Schema::Bool(b) => *b,
        Schema::Node(node) => {
            node.schema_type.is_none()
                && node.properties.is_none()
                && node.additional_properties.is_none()
                && node.items.is_none()
                && node.prefix_items.is_none()
                && node.required.is_none()
                && node.reference.is_none()
                && node.any_of.is_none()
                && node.one_of.is_none()
        }
    }
}

fn walk(
    root: &Schema,
    schema: &Schema,
    path: &[PathSegment],
    labels: &mut Vec<Label>,
    visiting: &mut HashSet<String>,
) -> Option<Schema> {
    let schema = reduce(root, schema, labels, visiting)?;

    let Some((segment, rest)) = path.split_first() else {
        return Some(schema);
    };

    match &schema {
        Schema::Bool(b) => Some(Schema::Bool(*b)),
        Schema::Node(node) => {
            let branches = node.any_of.as_ref().or(node.one_of.as_ref());
            if let Some(branches) = branches {
                let results: Vec<Option<Schema>> = branches
                    .iter()
                    .map(|branch| walk(root, branch, path, labels, visiting))
                    .collect();
                return combine(results);
            }

            let child = step(node, segment);
            walk(root, &child, rest, labels, visiting)
        }
    }
}

/// Resolve top-level `$ref`s and collect this node's labels. The visiting
/// set guards against `$ref` loops; entries are released on scope exit so
/// legitimate recursive schemas still resolve at deeper path positions.
fn reduce(
    root: &Schema,
    schema: &Schema,
    labels: &mut Vec<Label>,
    visiting: &mut HashSet<String>,
) -> Option<Schema> {
    let Schema::Node(node) = schema else {
        return Some(schema.clone());
    };

    for label in schema.labels() {
        if !labels.contains(&label) {
            labels.push(label);
        }
    }

    let Some(reference) = &node.reference else {
        return Some(schema.clone());
    };

    if !visiting.insert(reference.clone()) {
        // Pure `$ref` cycle with no progress through the value: treat the
        // re-entry as unconstrained to break the loop.
        return Some(Schema::always());
    }
    let resolved = resolve_ref(root, reference);
    let result = match resolved {
        Some(resolved) => reduce(root, &resolved, labels, visiting),
        None => None,
    };
    visiting.remove(reference);
    result
}

/// One structural step through a node.
fn step(node: &SchemaNode, segment: &PathSegment) -> Schema {
    if is_array_node(node) {
        if segment.is_length() {
            return number_schema();
        }
        if let Some(index) = segment.as_index() {
            if let Some(prefix) = &node.prefix_items {
                if let Some(schema) = prefix.get(index) {
                    return schema.clone();
                }
            }
            return node
                .items
                .as_deref()
                .cloned()
                .unwrap_or_else(Schema::always);
        }
    }

    let key = segment.to_string();
    if let Some(properties) = &node.properties {
        if let Some(schema) = properties.get(&key) {
            return schema.clone();
        }
    }
    // Unseen properties fall through to additionalProperties; absent
    // means unconstrained.
    node.additional_properties
        .as_deref()
        .cloned()
        .unwrap_or_else(Schema::always)
}

fn is_array_node(node: &SchemaNode) -> bool {
    let typed_array = match &node.schema_type {
        Some(TypeSpec::One(t)) => t == "array",
        Some(TypeSpec::Many(ts)) => ts.iter().any(|t| t == "array"),
        None => false,
    };
    typed_array || node.items.is_some() || node.prefix_items.is_some()
}

fn number_schema() -> Schema {
    Schema::node(SchemaNode {
        schema_type: Some(TypeSpec::One("number".to_string())),
        ..SchemaNode::default()
    })
}

/// Re-assemble branch results: any `true` wins, `false` branches and
/// unresolved branches are pruned, duplicates (by JSON form) dropped.
fn combine(results: Vec<Option<Schema>>) -> Option<Schema> {
    let resolved: Vec<Schema> = results.into_iter().flatten().collect();
    if resolved.is_empty() {
        return None;
    }
    if resolved.iter().any(|s| is_always_true(s)) {
        return Some(Schema::always());
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut branches = Vec::new();
    for schema in resolved {
        if matches!(schema, Schema::Bool(false)) {
            continue;
        }
        let form = serde_json::to_string(&schema.to_value()).unwrap_or_default();
        if seen.insert(form) {
            branches.push(schema);
        }
    }

    match branches.len() {
        0 => Some(Schema::never()),
        1 => branches.into_iter().next(),
        _ => Some(Schema::node(SchemaNode {
            any_of: Some(branches),
            ..SchemaNode::default()
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serde_json::Value;

    fn schema(v: Value) -> Schema {
        Schema::from_value(&v).unwrap()
    }

    fn path(segs: &[&str]) -> Vec<PathSegment> {
        segs.iter()
            .map(|s| match s.parse::<usize>() {
                Ok(i) => PathSegment::Index(i),
                Err(_) => PathSegment::Key(s.to_string()),
            })
            .collect()
    }

    #[test]
    fn test_empty_path_returns_root() {
        let root = schema(json!({"type": "number"}));
        let walk = schema_at_path(&root, &[]);
        assert_eq!(walk.schema, Some(root));
    }

    #[test]
    fn test_object_property_walk() {
        let root = schema(json!({
            "type": "object",
            "properties": {"a": {"properties": {"b": {"type": "string"}}}},
        }));
        let walk = schema_at_path(&root, &path(&["a", "b"]));
        assert_eq!(walk.schema, Some(schema(json!({"type": "string"}))));
    }

    #[test]
    fn test_unseen_property_uses_additional() {
        let constrained = schema(json!({
            "properties": {"a": true},
            "additionalProperties": {"type": "number"},
        }));
        let walk = schema_at_path(&constrained, &path(&["other"]));
        assert_eq!(walk.schema, Some(schema(json!({"type": "number"}))));

        // Absent additionalProperties means unconstrained.
        let open = schema(json!({"properties": {"a": true}}));
        let walk = schema_at_path(&open, &path(&["other"]));
        assert_eq!(walk.schema, Some(Schema::always()));
    }

    #[test]
    fn test_array_prefix_items_and_items() {
        let root = schema(json!({
            "type": "array",
            "prefixItems": [{"type": "string"}],
            "items": {"type": "number"},
        }));
        let first = schema_at_path(&root, &path(&["0"]));
        assert_eq!(first.schema, Some(schema(json!({"type": "string"}))));

        let later = schema_at_path(&root, &path(&["5"]));
        assert_eq!(later.schema, Some(schema(json!({"type": "number"}))));
    }

    #[test]
    fn test_array_length_is_number() {
        let root = schema(json!({"type": "array", "items": true}));
        let walk = schema_at_path(&root, &path(&["length"]));
        assert_eq!(walk.schema, Some(schema(json!({"type": "number"}))));
    }

    #[test]
    fn test_any_of_branches_reduced() {
        let root = schema(json!({
            "anyOf": [
                {"properties": {"x": {"type": "string"}}},
                {"properties": {"x": {"type": "number"}}},
            ],
        }));
        let walk = schema_at_path(&root, &path(&["x"]));
        assert_eq!(
            walk.schema,
            Some(schema(json!({
                "anyOf": [{"type": "string"}, {"type": "number"}],
            })))
        );
    }

    #[test]
    fn test_any_of_true_branch_wins() {
        let root = schema(json!({
            "anyOf": [
                {"properties": {"x": {"type": "string"}}},
                {},
            ],
        }));
        let walk = schema_at_path(&root, &path(&["x"]));
        assert_eq!(walk.schema, Some(Schema::always()));
    }

    #[test]
    fn test_any_of_duplicates_deduped() {
        let root = schema(json!({
            "anyOf": [
                {"properties": {"x": {"type": "string"}}},
                {"properties": {"x": {"type": "string"}}},
            ],
        }));
        let walk = schema_at_path(&root, &path(&["x"]));
        assert_eq!(walk.schema, Some(schema(json!({"type": "string"}))));
    }

    #[test]
    fn test_ref_resolution_during_walk() {
        let root = schema(json!({
            "properties": {"node": {"$ref": "#/$defs/tree"}},
            "$defs": {
                "tree": {
                    "properties": {
                        "value": {"type": "number"},
                        "kids": {"type": "array", "items": {"$ref": "#/$defs/tree"}},
                    },
                },
            },
        }));
        // Recursive schema resolves at increasing depth.
        let walk = schema_at_path(&root, &path(&["node", "kids", "0", "value"]));
        assert_eq!(walk.schema, Some(schema(json!({"type": "number"}))));
    }

    #[test]
    fn test_unresolved_ref_is_none() {
        let root = schema(json!({"properties": {"x": {"$ref": "#/$defs/nope"}}}));
        let walk = schema_at_path(&root, &path(&["x"]));
        assert!(walk.schema.is_none());
    }

    #[test]
    fn test_pure_ref_cycle_breaks() {
        let root = schema(json!({"$ref": "#"}));
        let walk = schema_at_path(&root, &path(&["anything"]));
        assert_eq!(walk.schema, Some(Schema::always()));
    }

    #[test]
    fn test_labels_collected_along_walk() {
        let root = schema(json!({
            "ifc": {"classification": ["confidential"]},
            "properties": {
                "inner": {
                    "ifc": {"classification": ["secret"]},
                    "properties": {"leaf": {"type": "number"}},
                },
                "open": {"type": "string"},
            },
        }));

        let walk = schema_at_path(&root, &path(&["inner", "leaf"]));
        assert_eq!(
            walk.labels,
            vec![Label::new("confidential"), Label::new("secret")]
        );

        // A sibling path only sees the outer label.
        let walk = schema_at_path(&root, &path(&["open"]));
        assert_eq!(walk.labels, vec![Label::new("confidential")]);
    }

    #[test]
    fn test_is_always_true_ignores_annotations() {
        assert!(is_always_true(&Schema::always()));
        assert!(!is_always_true(&Schema::never()));
        assert!(is_always_true(&schema(json!({
            "asCell": true,
            "ifc": {"classification": ["secret"]},
        }))));
        assert!(!is_always_true(&schema(json!({"type": "object"}))));
    }

    #[test]
    fn test_walk_through_bool_schema() {
        let walk = schema_at_path(&Schema::always(), &path(&["a", "b"]));
        assert_eq!(walk.schema, Some(Schema::always()));
        let walk = schema_at_path(&Schema::never(), &path(&["a"]));
        assert_eq!(walk.schema, Some(Schema::never()));
    }
}
