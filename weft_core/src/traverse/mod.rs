//! Traverser: schema-directed walk of a composed value.
//!
//! Starting at an address, the traverser materialises a [`View`] of the
//! value, following links into other facts (loading them through the
//! transaction so they become reads), cutting the walk at positions whose
//! schema says `asCell` / `asStream`, and recording which documents were
//! not present so the caller can trigger a sync. Cycles through links are
//! detected and surface as cell references instead of infinite descent.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;

use crate::address::{Address, EntityId, PathSegment, SpaceId};
use crate::reference::link::parse_link;
use crate::schema::{schema_at_path, Schema};
use crate::transaction::{ReadError, ReadOptions, Transaction};

/// Materialised view of a value: the dynamic-proxy replacement. Access is
/// by explicit key lookup; `asCell` / `asStream` positions become
/// references instead of inline values.
#[derive(Debug, Clone, PartialEq)]
pub enum View {
    /// A scalar (or a value the schema treats as opaque).
    Leaf(Value),

    /// Object with materialised entries.
    Object(BTreeMap<String, View>),

    /// Array with materialised elements.
    Array(Vec<View>),

    /// A sub-cell boundary.
    Cell(CellRef),

    /// An event-stream boundary.
    Stream(CellRef),
}

impl View {
    /// Entry lookup on objects; `None` elsewhere.
    pub fn key(&self, key: &str) -> Option<&View> {
        match self {
            View::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Element lookup on arrays; `None` elsewhere.
    pub fn index(&self, index: usize) -> Option<&View> {
        match self {
            View::Array(items) => items.get(index),
            _ => None,
        }
    }

    /// The leaf value, if this is one.
    pub fn as_leaf(&self) -> Option<&Value> {
        match self {
            View::Leaf(value) => Some(value),
            _ => None,
        }
    }

    /// Collapse the view back into a plain JSON value. Cell and stream
    /// boundaries re-render as link sigils.
    pub fn to_value(&self) -> Value {
        match self {
            View::Leaf(value) => value.clone(),
            View::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect(),
            ),
            View::Array(items) => Value::Array(items.iter().map(View::to_value).collect()),
            View::Cell(cell) | View::Stream(cell) => cell.to_link_value(),
        }
    }
}

/// Reference to a cell position reached during traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct CellRef {
    /// Address of the referenced position.
    pub address: Address,

    /// Schema governing the referenced value, when known.
    pub schema: Option<Schema>,
}

impl CellRef {
    fn to_link_value(&self) -> Value {
        let mut link = crate::reference::link::Link::to_entity(self.address.id.clone())
            .at(self.address.path.iter().map(|s| s.to_string()).collect())
            .in_space(self.address.space.clone());
        if let Some(schema) = &self.schema {
            link = link.with_schema(schema.to_value());
        }
        link.to_value()
    }
}

/// Everything a traversal produced.
#[derive(Debug)]
pub struct Traversal {
    /// The materialised view; `None` when the start address is absent.
    pub view: Option<View>,

    /// Entities actually read, in first-touch order.
    pub reads: Vec<(SpaceId, EntityId, String)>,

    /// Schema used per reached entity (the schema-selector map).
    pub schema_claims: HashMap<(SpaceId, EntityId, String), Schema>,

    /// Entities that were not present in their replica.
    pub missing: Vec<(SpaceId, EntityId, String)>,
}

/// Schema-directed walker bound to a transaction.
pub struct Traverser<'t> {
    tx: &'t mut Transaction,
    visited: HashSet<String>,
    reads: Vec<(SpaceId, EntityId, String)>,
    schema_claims: HashMap<(SpaceId, EntityId, String), Schema>,
    missing: Vec<(SpaceId, EntityId, String)>,
}

impl<'t> Traverser<'t> {
    /// A traverser whose loads go through `tx`.
    pub fn new(tx: &'t mut Transaction) -> Self {
        Self {
            tx,
            visited: HashSet::new(),
            reads: Vec::new(),
            schema_claims: HashMap::new(),
            missing: Vec::new(),
        }
    }

    /// Walk the value at `address` under `schema`.
    pub fn traverse(
        mut self,
        address: &Address,
        schema: Option<&Schema>,
    ) -> Result<Traversal, ReadError> {
        // The start position counts as visited so a loop back to it cuts
        // off as a cell boundary.
        self.visited.insert(visit_key(address));
        let view = self.walk_address(address, schema.cloned())?;
        Ok(Traversal {
            view,
            reads: self.reads,
            schema_claims: self.schema_claims,
            missing: self.missing,
        })
    }

    /// Load the value at an address and walk it.
    fn walk_address(
        &mut self,
        address: &Address,
        schema_root: Option<Schema>,
    ) -> Result<Option<View>, ReadError> {
        let entity = (
            address.space.clone(),
            address.id.clone(),
            address.the.clone(),
        );
        if !self.reads.contains(&entity) {
            self.reads.push(entity.clone());
        }
        if let Some(schema) = &schema_root {
            self.schema_claims
                .entry(entity.clone())
                .or_insert_with(|| schema.clone());
        }

        let labels = schema_root
            .as_ref()
            .map(|s| crate::schema::labels_at(s, &[]))
            .unwrap_or_default();
        let value = match self.tx.read(address, ReadOptions { labels }) {
            Ok(attestation) => attestation.value,
            // A sub-path into a document we do not have reads as absent;
            // the entity is reported missing for the caller to sync.
            Err(crate::transaction::TransactionError::Address(
                crate::attestation::error::AddressError::NotFound { .. },
            )) => {
                if !self.missing.contains(&entity) {
                    self.missing.push(entity);
                }
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if value.is_none() && address.is_root() && !address.id.is_data_uri() {
            if !self.missing.contains(&entity) {
                self.missing.push(entity);
            }
            return Ok(None);
        }

        match value {
            None => Ok(None),
            Some(value) => self.walk_value(&value, address, &schema_root, &[]).map(Some),
        }
    }

    /// Walk a loaded value. `rel_path` is the position relative to the
    /// traversal start (where `schema_root` is anchored); the absolute
    /// path of a position is the start path plus `rel_path`.
    fn walk_value(
        &mut self,
        value: &Value,
        address: &Address,
        schema_root: &Option<Schema>,
        rel_path: &[PathSegment],
    ) -> Result<View, ReadError> {
        let position_schema = schema_root
            .as_ref()
            .and_then(|root| schema_at_path(root, rel_path).schema);

        let is_cell = position_schema.as_ref().map(Schema::is_cell).unwrap_or(false);
        let is_stream = position_schema
            .as_ref()
            .map(Schema::is_stream)
            .unwrap_or(false);

        if let Some(link) = parse_link(value) {
            let target = link.to_address(&address.space, &address.the);
            let target_schema = link
                .schema
                .as_ref()
                .and_then(Schema::from_value)
                .or(position_schema.clone());

            if is_stream {
                return Ok(View::Stream(CellRef {
                    address: target,
                    schema: target_schema,
                }));
            }
            if is_cell {
                return Ok(View::Cell(CellRef {
                    address: target,
                    schema: target_schema,
                }));
            }

            // Follow the link; a revisit of the same target under the same
            // walk becomes a cell boundary instead of a cycle.
            let key = visit_key(&target);
            if !self.visited.insert(key.clone()) {
                return Ok(View::Cell(CellRef {
                    address: target,
                    schema: target_schema,
                }));
            }
            let result = self.walk_address(&target, target_schema.clone());
            self.visited.remove(&key);
            return Ok(result?.unwrap_or(View::Leaf(Value::Null)));
        }

        if is_stream {
            return Ok(View::Stream(CellRef {
                address: absolute(address, rel_path),
                schema: position_schema,
            }));
        }
        if is_cell {
            return Ok(View::Cell(CellRef {
                address: absolute(address, rel_path),
                schema: position_schema,
            }));
        }

        match value {
            Value::Object(map) => {
                let mut out = BTreeMap::new();
                for (key, child) in map {
                    let mut child_path = rel_path.to_vec();
                    child_path.push(PathSegment::Key(key.clone()));
                    let view = self.walk_value(child, address, schema_root, &child_path)?;
                    out.insert(key.clone(), view);
                }
                Ok(View::Object(out))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, child) in items.iter().enumerate() {
                    let mut child_path = rel_path.to_vec();
                    child_path.push(PathSegment::Index(i));
                    out.push(self.walk_value(child, address, schema_root, &child_path)?);
                }
                Ok(View::Array(out))
            }
            other => Ok(View::Leaf(other.clone())),
        }
    }
}

fn visit_key(address: &Address) -> String {
    address.to_string()
}

/// Absolute address of a position `rel_path` below the traversal start.
fn absolute(start: &Address, rel_path: &[PathSegment]) -> Address {
    let mut address = start.clone();
    address.path.extend(rel_path.iter().cloned());
    address
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::JSON_MEDIA_TYPE;
    use crate::cfc::{CfcConfig, CfcMode, Label};
    use crate::reference::link::Link;
    use crate::storage::StorageManager;
    use crate::transaction::WriteOptions;
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> Arc<StorageManager> {
        Arc::new(StorageManager::ephemeral())
    }

    fn tx(storage: &Arc<StorageManager>) -> Transaction {
        Transaction::new(storage.clone(), CfcConfig::default())
    }

    fn addr(entity: &str) -> Address {
        Address::root(SpaceId::new("s"), EntityId::of(entity))
    }

    fn seed(storage: &Arc<StorageManager>, entity: &str, value: Value) {
        let mut t = tx(storage);
        t.write(&addr(entity), Some(value), WriteOptions::default())
            .unwrap();
        t.commit().unwrap();
    }

    #[test]
    fn test_plain_value_materialises() {
        let storage = setup();
        seed(&storage, "doc", json!({"n": 1, "list": [true, "x"]}));

        let mut t = tx(&storage);
        let result = Traverser::new(&mut t).traverse(&addr("doc"), None).unwrap();
        let view = result.view.unwrap();

        assert_eq!(view.key("n").unwrap().as_leaf(), Some(&json!(1)));
        assert_eq!(
            view.key("list").unwrap().index(1).unwrap().as_leaf(),
            Some(&json!("x"))
        );
        assert_eq!(result.reads.len(), 1);
        assert!(result.missing.is_empty());
    }

    #[test]
    fn test_links_followed_and_read_recorded() {
        let storage = setup();
        seed(&storage, "target", json!({"inner": 42}));
        seed(
            &storage,
            "doc",
            json!({"ref": Link::to_entity("of:target").to_value()}),
        );

        let mut t = tx(&storage);
        let result = Traverser::new(&mut t).traverse(&addr("doc"), None).unwrap();
        let view = result.view.unwrap();

        assert_eq!(
            view.key("ref").unwrap().key("inner").unwrap().as_leaf(),
            Some(&json!(42))
        );
        assert_eq!(result.reads.len(), 2);
        assert_eq!(result.reads[1].1, EntityId::of("target"));
    }

    #[test]
    fn test_link_with_path_resolves_sub_value() {
        let storage = setup();
        seed(&storage, "target", json!({"deep": {"n": 9}}));
        seed(
            &storage,
            "doc",
            json!({"ref": Link::to_entity("of:target")
                .at(vec!["deep".to_string(), "n".to_string()])
                .to_value()}),
        );

        let mut t = tx(&storage);
        let result = Traverser::new(&mut t).traverse(&addr("doc"), None).unwrap();
        assert_eq!(
            result.view.unwrap().key("ref").unwrap().as_leaf(),
            Some(&json!(9))
        );
    }

    #[test]
    fn test_cycle_becomes_cell_boundary() {
        let storage = setup();
        seed(
            &storage,
            "a",
            json!({"next": Link::to_entity("of:b").to_value()}),
        );
        seed(
            &storage,
            "b",
            json!({"next": Link::to_entity("of:a").to_value()}),
        );

        let mut t = tx(&storage);
        let result = Traverser::new(&mut t).traverse(&addr("a"), None).unwrap();
        let view = result.view.unwrap();

        // a → b → (a again) cut off as a cell reference.
        let back = view.key("next").unwrap().key("next").unwrap();
        match back {
            View::Cell(cell) => assert_eq!(cell.address.id, EntityId::of("a")),
            other => panic!("expected cell boundary, got {:?}", other),
        }
    }

    #[test]
    fn test_as_cell_position_not_followed() {
        let storage = setup();
        seed(&storage, "target", json!({"big": "payload"}));
        seed(
            &storage,
            "doc",
            json!({"sub": Link::to_entity("of:target").to_value()}),
        );

        let schema = Schema::from_value(&json!({
            "properties": {"sub": {"asCell": true}},
        }))
        .unwrap();

        let mut t = tx(&storage);
        let result = Traverser::new(&mut t)
            .traverse(&addr("doc"), Some(&schema))
            .unwrap();
        let view = result.view.unwrap();

        match view.key("sub").unwrap() {
            View::Cell(cell) => assert_eq!(cell.address.id, EntityId::of("target")),
            other => panic!("expected cell, got {:?}", other),
        }
        // The target was never loaded.
        assert_eq!(result.reads.len(), 1);
    }

    #[test]
    fn test_as_stream_position() {
        let storage = setup();
        seed(&storage, "doc", json!({"events": []}));

        let schema = Schema::from_value(&json!({
            "properties": {"events": {"asStream": true}},
        }))
        .unwrap();

        let mut t = tx(&storage);
        let result = Traverser::new(&mut t)
            .traverse(&addr("doc"), Some(&schema))
            .unwrap();
        match result.view.unwrap().key("events").unwrap() {
            View::Stream(cell) => {
                assert_eq!(cell.address.path, vec![PathSegment::from("events")]);
            }
            other => panic!("expected stream, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_document_reported() {
        let storage = setup();
        seed(
            &storage,
            "doc",
            json!({"ref": Link::to_entity("of:absent").to_value()}),
        );

        let mut t = tx(&storage);
        let result = Traverser::new(&mut t).traverse(&addr("doc"), None).unwrap();
        assert_eq!(
            result.missing,
            vec![(
                SpaceId::new("s"),
                EntityId::of("absent"),
                JSON_MEDIA_TYPE.to_string()
            )]
        );
        // The absent target renders as null.
        assert_eq!(
            result.view.unwrap().key("ref").unwrap().as_leaf(),
            Some(&json!(null))
        );
    }

    #[test]
    fn test_schema_claims_recorded_per_entity() {
        let storage = setup();
        seed(
            &storage,
            "doc",
            json!({"ref": Link::to_entity("of:target")
                .with_schema(json!({"type": "object"}))
                .to_value()}),
        );
        seed(&storage, "target", json!({}));

        let root_schema = Schema::always();
        let mut t = tx(&storage);
        let result = Traverser::new(&mut t)
            .traverse(&addr("doc"), Some(&root_schema))
            .unwrap();

        let target_key = (
            SpaceId::new("s"),
            EntityId::of("target"),
            JSON_MEDIA_TYPE.to_string(),
        );
        assert_eq!(
            result.schema_claims.get(&target_key),
            Some(&Schema::from_value(&json!({"type": "object"})).unwrap())
        );
    }

    #[test]
    fn test_labels_taint_through_traversal() {
        let storage = setup();
        seed(&storage, "doc", json!({"secretish": 1}));

        let schema = Schema::from_value(&json!({
            "ifc": {"classification": ["secret"]},
        }))
        .unwrap();

        let config = CfcConfig::with_mode(CfcMode::Enforcing);
        let mut t = Transaction::new(storage.clone(), config);
        Traverser::new(&mut t)
            .traverse(&addr("doc"), Some(&schema))
            .unwrap();
        assert_eq!(t.taint().level(), &Label::new("secret"));
    }

    #[test]
    fn test_view_to_value_roundtrip() {
        let storage = setup();
        seed(&storage, "doc", json!({"a": [1, {"b": null}], "s": "x"}));

        let mut t = tx(&storage);
        let result = Traverser::new(&mut t).traverse(&addr("doc"), None).unwrap();
        assert_eq!(
            result.view.unwrap().to_value(),
            json!({"a": [1, {"b": null}], "s": "x"})
        );
    }
}
