//! Change-set compaction.
//!
//! A change set may contain writes whose paths overlap: a write at `P`
//! followed by writes under `P.*`, or narrow writes later replaced by a
//! wider one. Compaction folds overlapping records together so each
//! surviving record touches a disjoint path, without changing what the
//! set does when applied in order.

use crate::attestation::apply;

use super::ChangeRecord;

/// Compact a change set.
///
/// Later writes under an earlier, wider write are folded into the wider
/// record's value. A later write at or above an earlier record replaces
/// it. Records that overlap in neither direction keep their order.
pub fn compact(records: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    let mut out: Vec<ChangeRecord> = Vec::with_capacity(records.len());

    'next_record: for record in records {
        // A wider (or equal) earlier record absorbs this one.
        for kept in out.iter_mut() {
            if kept.address.covers(&record.address) {
                let rel = &record.address.path[kept.address.path.len()..];
                match apply(kept.value.clone(), rel, record.value.clone()) {
                    Ok(folded) => {
                        kept.value = folded;
                        continue 'next_record;
                    }
                    // Cannot fold (e.g. child of a deletion): keep the
                    // narrow record in order.
                    Err(_) => break,
                }
            }
        }

        // This record supersedes any earlier, narrower ones.
        out.retain(|kept| !record.address.covers(&kept.address));
        out.push(record);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, EntityId, SpaceId};
    use serde_json::json;

    fn root() -> Address {
        Address::root(SpaceId::new("s"), EntityId::of("e"))
    }

    /// Apply records in order over a base value, mirroring what staging
    /// does, so semantic preservation can be checked directly.
    fn play(base: Option<serde_json::Value>, records: &[ChangeRecord]) -> Option<serde_json::Value> {
        let mut value = base;
        for record in records {
            value = apply(value, &record.address.path, record.value.clone()).unwrap();
        }
        value
    }

    #[test]
    fn test_child_folds_into_parent() {
        let records = vec![
            ChangeRecord::write(root(), json!({"a": 1, "b": 2})),
            ChangeRecord::write(root().child("a"), json!(9)),
        ];
        let compacted = compact(records.clone());
        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted[0].address, root());
        assert_eq!(compacted[0].value, Some(json!({"a": 9, "b": 2})));

        assert_eq!(play(None, &records), play(None, &compacted));
    }

    #[test]
    fn test_wider_write_drops_earlier_children() {
        let records = vec![
            ChangeRecord::write(root().child("a"), json!(1)),
            ChangeRecord::write(root().child("b"), json!(2)),
            ChangeRecord::write(root(), json!({"fresh": true})),
        ];
        let compacted = compact(records.clone());
        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted[0].value, Some(json!({"fresh": true})));

        let base = Some(json!({}));
        assert_eq!(play(base.clone(), &records), play(base, &compacted));
    }

    #[test]
    fn test_same_address_last_wins() {
        let records = vec![
            ChangeRecord::write(root().child("n"), json!(1)),
            ChangeRecord::write(root().child("n"), json!(2)),
        ];
        let compacted = compact(records.clone());
        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted[0].value, Some(json!(2)));
    }

    #[test]
    fn test_disjoint_records_keep_order() {
        let records = vec![
            ChangeRecord::write(root().child("a"), json!(1)),
            ChangeRecord::write(root().child("b"), json!(2)),
        ];
        assert_eq!(compact(records.clone()), records);
    }

    #[test]
    fn test_deletion_folds_into_parent() {
        let records = vec![
            ChangeRecord::write(root(), json!({"a": 1, "b": 2})),
            ChangeRecord::delete(root().child("b")),
        ];
        let compacted = compact(records.clone());
        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted[0].value, Some(json!({"a": 1})));
    }

    #[test]
    fn test_records_across_entities_untouched() {
        let other = Address::root(SpaceId::new("s"), EntityId::of("f"));
        let records = vec![
            ChangeRecord::write(root(), json!(1)),
            ChangeRecord::write(other.clone(), json!(2)),
        ];
        assert_eq!(compact(records.clone()), records);
    }

    #[test]
    fn test_deep_fold_chain() {
        let records = vec![
            ChangeRecord::write(root(), json!({"a": {"b": {"c": 1}}})),
            ChangeRecord::write(root().child("a").child("b").child("c"), json!(2)),
            ChangeRecord::write(root().child("a").child("b"), json!({"c": 3})),
        ];
        let compacted = compact(records.clone());
        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted[0].value, Some(json!({"a": {"b": {"c": 3}}})));

        assert_eq!(play(None, &records), play(None, &compacted));
    }
}
