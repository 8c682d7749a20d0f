//! Change sets: normalise-and-diff a user value against current state.
//!
//! Given the current value of an entity and a desired next value, produce
//! a minimal list of [`ChangeRecord`]s that turns one into the other.
//! Along the way:
//!
//! - equal sub-trees are skipped;
//! - array shrinkage becomes one `length` write plus ascending deletions
//!   for the truncated indices;
//! - legacy `$alias` forms and data-URI links are inlined by value;
//! - objects carrying an id marker are split off into their own entity,
//!   leaving a link at the original position.

pub mod compact;

use serde_json::{Map, Number, Value};

use crate::address::{Address, EntityId, PathSegment};
use crate::attestation::error::AddressError;
use crate::attestation::resolve;
use crate::reference::link::{parse_link, DataUri, Link};
use crate::reference::{normalize, refer};
use crate::transaction::{ReadOptions, Transaction, TransactionError, WriteOptions};

pub use compact::compact;

/// Marker key naming the stable identity of an embedded object. An object
/// carrying it is stored as its own entity, linked from its position.
pub const ID_KEY: &str = "$ID";

/// Marker key redirecting the effective id to a named property of the
/// object.
pub const ID_FIELD_KEY: &str = "$ID_FIELD";

/// One write in a change set.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Where to write.
    pub address: Address,

    /// Value to write; `None` deletes.
    pub value: Option<Value>,
}

impl ChangeRecord {
    /// A write record.
    pub fn write(address: Address, value: Value) -> Self {
        Self {
            address,
            value: Some(value),
        }
    }

    /// A deletion record.
    pub fn delete(address: Address) -> Self {
        Self {
            address,
            value: None,
        }
    }
}

/// Diff `next` against the current value at `address` (an entity root),
/// producing the change set that makes the entity equal to `next`.
///
/// Reads performed here go through the transaction, so the current values
/// become part of its claims.
pub fn diff_changes(
    tx: &mut Transaction,
    address: &Address,
    next: &Value,
) -> Result<Vec<ChangeRecord>, TransactionError> {
    let current = match tx.read(address, ReadOptions::default()) {
        Ok(attestation) => attestation.value,
        // A position whose parents do not exist yet diffs against nothing;
        // staging will synthesise the parents.
        Err(TransactionError::Address(AddressError::NotFound { .. })) => None,
        Err(e) => return Err(e),
    };
    let mut out = Vec::new();
    let transformed = transform(tx, address, current.as_ref(), next, &mut out)?;
    diff_value(current.as_ref(), &transformed, address, &mut out);
    Ok(out)
}

/// Stage a change set in order. Deletions under missing parents are
/// treated as already satisfied.
pub fn apply_changes(
    tx: &mut Transaction,
    records: &[ChangeRecord],
) -> Result<(), TransactionError> {
    for record in records {
        match &record.value {
            Some(value) => {
                tx.write_value_or_throw(&record.address, value.clone())?;
            }
            None => match tx.write(&record.address, None, WriteOptions::default()) {
                Ok(_) => {}
                Err(TransactionError::Address(AddressError::NotFound { .. })) => {}
                Err(e) => return Err(e),
            },
        }
    }
    Ok(())
}

/// Rewrite a value for storage: inline aliases and data URIs, split off
/// id-marked objects into their own entities (emitting their writes), and
/// recurse into containers.
fn transform(
    tx: &mut Transaction,
    address: &Address,
    base: Option<&Value>,
    value: &Value,
    out: &mut Vec<ChangeRecord>,
) -> Result<Value, TransactionError> {
    if let Some(path) = parse_alias(value) {
        // Legacy alias: inline the referenced slice of the current value.
        let inlined = resolve(base, &path)?.unwrap_or(Value::Null);
        return Ok(inlined);
    }

    if let Some(link) = parse_link(value) {
        if link.is_data_uri() {
            let decoded = DataUri::parse(link.id.as_str())?.json(&address.the)?;
            return Ok(decoded);
        }
        return Ok(value.clone());
    }

    match value {
        Value::Object(map) if map.contains_key(ID_KEY) || map.contains_key(ID_FIELD_KEY) => {
            allocate_entity(tx, address, map, out)
        }
        Value::Object(map) => {
            let mut next = Map::new();
            for (key, child) in map {
                let child_addr = address.child(key.as_str());
                let transformed = transform(tx, &child_addr, base, child, out)?;
                next.insert(key.clone(), transformed);
            }
            Ok(Value::Object(next))
        }
        Value::Array(items) => {
            let mut next = Vec::with_capacity(items.len());
            for (i, child) in items.iter().enumerate() {
                let child_addr = address.child(i);
                next.push(transform(tx, &child_addr, base, child, out)?);
            }
            Ok(Value::Array(next))
        }
        other => Ok(other.clone()),
    }
}

/// Split an id-marked object into its own entity. The entity id is the
/// causal hash of `(containing entity, effective id)`; an existing value
/// at that entity is diffed rather than replaced wholesale.
fn allocate_entity(
    tx: &mut Transaction,
    address: &Address,
    map: &Map<String, Value>,
    out: &mut Vec<ChangeRecord>,
) -> Result<Value, TransactionError> {
    let effective_id = match map.get(ID_FIELD_KEY) {
        Some(Value::String(field)) => map.get(field).cloned().unwrap_or(Value::Null),
        _ => map.get(ID_KEY).cloned().unwrap_or(Value::Null),
    };

    let cause = serde_json::json!({
        "namespace": address.id.as_str(),
        "id": effective_id,
    });
    let entity = EntityId::of(refer(&cause).as_str());

    let mut contents = Map::new();
    for (key, child) in map {
        if key == ID_KEY || key == ID_FIELD_KEY {
            continue;
        }
        contents.insert(key.clone(), child.clone());
    }

    let entity_root = Address::new(address.space.clone(), entity.clone(), address.the.clone());
    let current = tx.read(&entity_root, ReadOptions::default())?.value;
    let transformed = transform(
        tx,
        &entity_root,
        current.as_ref(),
        &Value::Object(contents),
        out,
    )?;
    diff_value(current.as_ref(), &transformed, &entity_root, out);

    Ok(Link::to_entity(entity).to_value())
}

/// Structural diff of `next` against `current` rooted at `address`.
fn diff_value(
    current: Option<&Value>,
    next: &Value,
    address: &Address,
    out: &mut Vec<ChangeRecord>,
) {
    if let Some(current) = current {
        if normalize(current) == normalize(next) {
            return;
        }
    }

    match (current, next) {
        (Some(Value::Object(cur)), Value::Object(nxt)) => {
            for (key, child) in nxt {
                diff_value(cur.get(key), child, &address.child(key.as_str()), out);
            }
            for key in cur.keys() {
                if !nxt.contains_key(key) {
                    out.push(ChangeRecord::delete(address.child(key.as_str())));
                }
            }
        }
        (Some(Value::Array(cur)), Value::Array(nxt)) => {
            if nxt.len() < cur.len() {
                out.push(ChangeRecord::write(
                    address.child("length"),
                    Value::Number(Number::from(nxt.len())),
                ));
                for i in nxt.len()..cur.len() {
                    out.push(ChangeRecord::delete(address.child(i)));
                }
            }
            let shared = nxt.len().min(cur.len());
            for i in 0..shared {
                diff_value(Some(&cur[i]), &nxt[i], &address.child(i), out);
            }
            for (i, child) in nxt.iter().enumerate().skip(cur.len()) {
                out.push(ChangeRecord::write(address.child(i), child.clone()));
            }
        }
        _ => {
            out.push(ChangeRecord::write(address.clone(), next.clone()));
        }
    }
}

/// Parse the legacy alias form `{"$alias": {"path": [...]}}`.
fn parse_alias(value: &Value) -> Option<Vec<PathSegment>> {
    let outer = value.as_object()?;
    if outer.len() != 1 {
        return None;
    }
    let body = outer.get("$alias")?.as_object()?;
    let path = body.get("path")?.as_array()?;
    let mut segments = Vec::with_capacity(path.len());
    for item in path {
        match item {
            Value::String(s) => segments.push(match s.parse::<usize>() {
                Ok(i) => PathSegment::Index(i),
                Err(_) => PathSegment::Key(s.clone()),
            }),
            Value::Number(n) => segments.push(PathSegment::Index(n.as_u64()? as usize)),
            _ => return None,
        }
    }
    Some(segments)
}
