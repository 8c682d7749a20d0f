//! Attestations: resolved values at addresses.
//!
//! An [`Attestation`] pairs an [`Address`] with the value it resolves to,
//! and is the unit of transactional claim. This module also implements the
//! path semantics shared by reads and writes:
//!
//! - an empty path addresses the whole fact value;
//! - a missing final key reads as absent (`None`), not an error;
//! - a missing intermediate reports the last valid prefix;
//! - a primitive mid-path is a type mismatch naming the exact prefix;
//! - arrays accept non-negative integer keys and the `length` pseudo-key.

pub mod error;

use serde_json::{Number, Value};

use crate::address::{Address, PathSegment};
use error::{json_type_name, AddressError};

/// Proof of what an address resolves to. `value: None` means the position
/// is absent (or the fact is retracted/unclaimed for a root address).
#[derive(Debug, Clone, PartialEq)]
pub struct Attestation {
    /// Address this attestation covers.
    pub address: Address,

    /// Resolved value, if any.
    pub value: Option<Value>,
}

impl Attestation {
    /// Attest `value` at `address`.
    pub fn new(address: Address, value: Option<Value>) -> Self {
        Self { address, value }
    }

    /// Read a sub-value relative to this attestation.
    pub fn read(&self, rel: &[PathSegment]) -> Result<Attestation, AddressError> {
        let value = resolve(self.value.as_ref(), rel)?;
        let mut address = self.address.clone();
        address.path.extend(rel.iter().cloned());
        Ok(Attestation::new(address, value))
    }

    /// Write a sub-value relative to this attestation, producing a new
    /// attestation. Writing an identical value returns a clone of `self`.
    pub fn write(&self, rel: &[PathSegment], next: Option<Value>) -> Result<Attestation, AddressError> {
        let current = resolve(self.value.as_ref(), rel)?;
        if current == next {
            return Ok(self.clone());
        }
        let value = apply(self.value.clone(), rel, next)?;
        Ok(Attestation::new(self.address.clone(), value))
    }
}

/// Resolve `path` against an optional root value.
///
/// Returns the value at the path (`None` when the final position is simply
/// absent), or an error when the path cannot be traversed.
pub fn resolve(root: Option<&Value>, path: &[PathSegment]) -> Result<Option<Value>, AddressError> {
    let mut current = match root {
        Some(v) => v,
        None => {
            if path.is_empty() {
                return Ok(None);
            }
            return Err(AddressError::NotFound { prefix: Vec::new() });
        }
    };

    for (depth, segment) in path.iter().enumerate() {
        let is_final = depth + 1 == path.len();
        match step(current, segment, &path[..depth])? {
            Step::Into(next) => current = next,
            Step::Computed(value) => {
                if is_final {
                    return Ok(Some(value));
                }
                // Walking past a computed scalar (array length).
                return Err(AddressError::TypeMismatch {
                    prefix: path[..=depth].to_vec(),
                    actual: "number",
                });
            }
            Step::Absent => {
                if is_final {
                    return Ok(None);
                }
                return Err(AddressError::NotFound {
                    prefix: path[..depth].to_vec(),
                });
            }
        }
    }

    Ok(Some(current.clone()))
}

/// Outcome of descending one segment.
enum Step<'v> {
    /// A present child value.
    Into(&'v Value),
    /// A synthesised value (array `length`).
    Computed(Value),
    /// The position is absent.
    Absent,
}

fn step<'v>(
    current: &'v Value,
    segment: &PathSegment,
    prefix: &[PathSegment],
) -> Result<Step<'v>, AddressError> {
    match current {
        Value::Object(map) => {
            let key = segment.to_string();
            match map.get(&key) {
                Some(child) => Ok(Step::Into(child)),
                None => Ok(Step::Absent),
            }
        }
        Value::Array(items) => {
            if segment.is_length() {
                return Ok(Step::Computed(Value::Number(Number::from(items.len()))));
            }
            match segment.as_index() {
                Some(i) => match items.get(i) {
                    Some(child) => Ok(Step::Into(child)),
                    None => Ok(Step::Absent),
                },
                None => Err(AddressError::TypeMismatch {
                    prefix: prefix.to_vec(),
                    actual: "array",
                }),
            }
        }
        other => Err(AddressError::TypeMismatch {
            prefix: prefix.to_vec(),
            actual: json_type_name(other),
        }),
    }
}

/// Apply a write of `next` at `path` over `root`, returning the new root.
///
/// The root is owned and mutated along the path (the caller clones from its
/// snapshot first, which gives copy-on-write at the transaction layer).
/// Writing `None` deletes the final property; on arrays it nulls an
/// in-range index and ignores an out-of-range one.
pub fn apply(
    root: Option<Value>,
    path: &[PathSegment],
    next: Option<Value>,
) -> Result<Option<Value>, AddressError> {
    if path.is_empty() {
        return Ok(next);
    }
    let mut root = match root {
        Some(v) => v,
        None => return Err(AddressError::NotFound { prefix: Vec::new() }),
    };
    apply_inner(&mut root, path, 0, next)?;
    Ok(Some(root))
}

fn apply_inner(
    current: &mut Value,
    path: &[PathSegment],
    depth: usize,
    next: Option<Value>,
) -> Result<(), AddressError> {
    let segment = &path[depth];
    let is_final = depth + 1 == path.len();

    if is_final {
        return write_leaf(current, segment, &path[..depth], next);
    }

    match current {
        Value::Object(map) => {
            let key = segment.to_string();
            match map.get_mut(&key) {
                Some(child) => apply_inner(child, path, depth + 1, next),
                None => Err(AddressError::NotFound {
                    prefix: path[..depth].to_vec(),
                }),
            }
        }
        Value::Array(items) => {
            if segment.is_length() {
                return Err(AddressError::TypeMismatch {
                    prefix: path[..=depth].to_vec(),
                    actual: "number",
                });
            }
            let i = segment.as_index().ok_or(AddressError::TypeMismatch {
                prefix: path[..depth].to_vec(),
                actual: "array",
            })?;
            match items.get_mut(i) {
                Some(child) => apply_inner(child, path, depth + 1, next),
                None => Err(AddressError::NotFound {
                    prefix: path[..depth].to_vec(),
                }),
            }
        }
        other => Err(AddressError::TypeMismatch {
            prefix: path[..depth].to_vec(),
            actual: json_type_name(other),
        }),
    }
}

fn write_leaf(
    parent: &mut Value,
    segment: &PathSegment,
    prefix: &[PathSegment],
    next: Option<Value>,
) -> Result<(), AddressError> {
    match parent {
        Value::Object(map) => {
            let key = segment.to_string();
            match next {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            if segment.is_length() {
                return write_length(items, prefix, segment, next);
            }
            let i = segment.as_index().ok_or(AddressError::TypeMismatch {
                prefix: prefix.to_vec(),
                actual: "array",
            })?;
            match next {
                Some(value) => {
                    if i >= items.len() {
                        items.resize(i + 1, Value::Null);
                    }
                    items[i] = value;
                }
                None => {
                    // Deleting past the end is a no-op; truncation is
                    // expressed through `length` writes.
                    if i < items.len() {
                        items[i] = Value::Null;
                    }
                }
            }
            Ok(())
        }
        other => Err(AddressError::TypeMismatch {
            prefix: prefix.to_vec(),
            actual: json_type_name(other),
        }),
    }
}

fn write_length(
    items: &mut Vec<Value>,
    prefix: &[PathSegment],
    segment: &PathSegment,
    next: Option<Value>,
) -> Result<(), AddressError> {
    let Some(value) = next else {
        return Ok(());
    };
    let mut full = prefix.to_vec();
    full.push(segment.clone());
    let n = value
        .as_u64()
        .ok_or(AddressError::TypeMismatch {
            prefix: full,
            actual: json_type_name(&value),
        })? as usize;
    if n <= items.len() {
        items.truncate(n);
    } else {
        items.resize(n, Value::Null);
    }
    Ok(())
}
