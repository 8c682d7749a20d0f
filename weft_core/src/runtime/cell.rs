//! Cell handles: the user-facing surface over addresses.
//!
//! A cell names one position (entity root or a path below it) under an
//! optional schema. Reads go through the traverser, so `asCell`
//! positions come back as sub-handles and labels feed the transaction
//! taint; writes go through the diff/compaction pipeline so only what
//! changed is staged. Methods come in two flavours: ambient (each call
//! opens its own retried transaction) and bound (`with_tx`).

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::warn;

use crate::address::{Address, PathSegment};
use crate::changes::{compact, diff_changes};
use crate::reference::link::Link;
use crate::scheduler::{ActionCallback, ActionId, ActionKind, RangeClaim, Scheduler, Timing};
use crate::schema::{labels_at, schema_at_path, Schema};
use crate::transaction::{ReadOptions, Transaction, TransactionError, WriteOptions};
use crate::traverse::{Traverser, View};

use super::RuntimeInner;

/// Handle to one addressed position under a schema.
#[derive(Clone)]
pub struct Cell {
    inner: Arc<RuntimeInner>,
    address: Address,
    schema: Option<Schema>,
}

impl Cell {
    pub(crate) fn new(inner: Arc<RuntimeInner>, address: Address, schema: Option<Schema>) -> Self {
        Self {
            inner,
            address,
            schema,
        }
    }

    /// The address this cell covers.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The schema attached to this cell, if any.
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    /// Derive a child handle one path segment down. The child's schema is
    /// the parent schema walked one step.
    pub fn key(&self, segment: impl Into<PathSegment>) -> Cell {
        let segment = segment.into();
        let schema = self
            .schema
            .as_ref()
            .and_then(|s| schema_at_path(s, &[segment.clone()]).schema);
        Cell {
            inner: self.inner.clone(),
            address: self.address.child(segment),
            schema,
        }
    }

    /// Reinterpret this position under a different schema.
    pub fn as_schema(&self, schema: Schema) -> Cell {
        Cell {
            inner: self.inner.clone(),
            address: self.address.clone(),
            schema: Some(schema),
        }
    }

    /// Bind this cell to an open transaction.
    pub fn with_tx<'a>(&'a self, tx: &'a mut Transaction) -> TxCell<'a> {
        TxCell { cell: self, tx }
    }

    /// Same entity, media type, and path under the same runtime.
    pub fn equals(&self, other: &Cell) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) && self.address == other.address
    }

    /// Render this cell as a link sigil (implicit space).
    pub fn get_as_link(&self) -> Value {
        Link::to_entity(self.address.id.clone())
            .at(self.address.path.iter().map(|s| s.to_string()).collect())
            .to_value()
    }

    /// Render this cell as a normalised full link: explicit space, no
    /// schema hint.
    pub fn get_as_normalized_full_link(&self) -> Value {
        Link::to_entity(self.address.id.clone())
            .at(self.address.path.iter().map(|s| s.to_string()).collect())
            .in_space(self.address.space.clone())
            .to_value()
    }

    // === Ambient operations (one transaction per call) ===

    /// Read through the schema, materialising a view.
    pub fn get(&self) -> Option<View> {
        let mut tx = super::open_transaction(&self.inner);
        let view = self.with_tx(&mut tx).get();
        if tx.commit().is_err() {
            return None;
        }
        view
    }

    /// Read the stored JSON, link sigils intact.
    pub fn get_raw(&self) -> Option<Value> {
        let mut tx = super::open_transaction(&self.inner);
        let value = self.with_tx(&mut tx).get_raw();
        let _ = tx.commit();
        value
    }

    /// Replace the value at this position, staging only what changed.
    pub fn set(&self, value: Value) -> bool {
        self.retried(move |cell| cell.set(value.clone()))
    }

    /// Send a value: events queue on stream cells, anything else is a
    /// plain `set`.
    pub fn send(&self, value: Value) -> bool {
        let is_stream = self.schema.as_ref().map(Schema::is_stream).unwrap_or(false);
        if is_stream {
            self.inner.scheduler.queue_event(&self.address, value);
            true
        } else {
            self.set(value)
        }
    }

    /// Merge the keys of `partial` into the current object value.
    pub fn update(&self, partial: Value) -> bool {
        self.retried(move |cell| cell.update(partial.clone()))
    }

    /// Append to the array at this position, creating it if absent.
    pub fn push(&self, item: Value) -> bool {
        self.retried(move |cell| cell.push(item.clone()))
    }

    /// Register an effect that fires whenever a change is visible through
    /// this cell's schema. The callback runs once immediately.
    pub fn sink<F>(&self, mut callback: F) -> SinkHandle
    where
        F: FnMut(Option<View>) + Send + 'static,
    {
        let cell = self.clone();
        let action: ActionCallback = Arc::new(Mutex::new(move |tx: &mut Transaction| {
            let view = cell.with_tx(tx).get();
            callback(view);
            Ok(())
        }));

        let id = self.inner.scheduler.register(
            ActionKind::Effect,
            Timing::immediate(),
            vec![RangeClaim::from_address(&self.address)],
            Vec::new(),
            action,
        );
        self.inner.scheduler.mark_dirty(id);

        SinkHandle {
            scheduler: self.inner.scheduler.clone(),
            id,
        }
    }

    fn retried<F>(&self, mut body: F) -> bool
    where
        F: FnMut(&mut TxCell<'_>) -> Result<(), TransactionError>,
    {
        let inner = self.inner.clone();
        crate::transaction::edit_with_retry(
            move || super::open_transaction(&inner),
            |tx| {
                let mut bound = self.with_tx(tx);
                body(&mut bound)
            },
            crate::transaction::DEFAULT_MAX_RETRIES,
        )
    }
}

/// A cell bound to an open transaction.
pub struct TxCell<'a> {
    cell: &'a Cell,
    tx: &'a mut Transaction,
}

impl TxCell<'_> {
    /// Read through the schema, materialising a view.
    pub fn get(&mut self) -> Option<View> {
        match Traverser::new(self.tx).traverse(&self.cell.address, self.cell.schema.as_ref()) {
            Ok(traversal) => traversal.view,
            Err(e) => {
                warn!(address = %self.cell.address, error = %e, "cell read failed");
                None
            }
        }
    }

    /// Read the stored JSON, link sigils intact.
    pub fn get_raw(&mut self) -> Option<Value> {
        let labels = self
            .cell
            .schema
            .as_ref()
            .map(|s| labels_at(s, &[]))
            .unwrap_or_default();
        self.tx
            .read(&self.cell.address, ReadOptions { labels })
            .ok()
            .and_then(|attestation| attestation.value)
    }

    /// Replace the value at this position through the diff pipeline.
    pub fn set(&mut self, value: Value) -> Result<(), TransactionError> {
        let records = compact(diff_changes(self.tx, &self.cell.address, &value)?);
        for record in records {
            let labels = self.destination_labels(&record.address);
            match record.value {
                Some(value) => {
                    match self.tx.write(&record.address, Some(value.clone()), WriteOptions { labels }) {
                        Ok(_) => {}
                        Err(TransactionError::Address(
                            crate::attestation::error::AddressError::NotFound { .. },
                        )) => {
                            self.tx.write_value_or_throw(&record.address, value)?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => {
                    self.tx
                        .write(&record.address, None, WriteOptions { labels })?;
                }
            }
        }
        Ok(())
    }

    /// Merge the keys of `partial` into the current object value.
    pub fn update(&mut self, partial: Value) -> Result<(), TransactionError> {
        let Value::Object(map) = partial else {
            return self.set(partial);
        };
        for (key, value) in map {
            let address = self.cell.address.child(key.as_str());
            let labels = self.destination_labels(&address);
            match self.tx.write(&address, Some(value.clone()), WriteOptions { labels }) {
                Ok(_) => {}
                Err(TransactionError::Address(
                    crate::attestation::error::AddressError::NotFound { .. },
                )) => {
                    self.tx.write_value_or_throw(&address, value)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Append to the array at this position, creating it if absent.
    pub fn push(&mut self, item: Value) -> Result<(), TransactionError> {
        let current = self
            .tx
            .read(&self.cell.address, ReadOptions::default())
            .map(|attestation| attestation.value)
            .unwrap_or(None);
        let next_index = match &current {
            Some(Value::Array(items)) => items.len(),
            _ => 0,
        };
        if current.is_none() {
            self.tx
                .write_value_or_throw(&self.cell.address, json!([item]))?;
            return Ok(());
        }
        let address = self.cell.address.child(next_index);
        let labels = self.destination_labels(&address);
        self.tx.write(&address, Some(item), WriteOptions { labels })?;
        Ok(())
    }

    /// Labels governing a write destination: the cell's schema walked to
    /// the record's position. Records against other entities (allocated
    /// by id markers) default to unlabelled.
    fn destination_labels(&self, address: &Address) -> Vec<crate::cfc::Label> {
        let Some(schema) = &self.cell.schema else {
            return Vec::new();
        };
        if address.id != self.cell.address.id
            || address.space != self.cell.address.space
            || !self.cell.address.covers(address)
        {
            return Vec::new();
        }
        let rel = &address.path[self.cell.address.path.len()..];
        labels_at(schema, rel)
    }
}

/// Cancellation handle for a sink registration.
pub struct SinkHandle {
    scheduler: Arc<Scheduler>,
    id: ActionId,
}

impl SinkHandle {
    /// Remove the sink from the graph.
    pub fn cancel(self) {
        self.scheduler.cancel(self.id);
    }

    /// The underlying action id.
    pub fn action_id(&self) -> ActionId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SpaceId;
    use crate::runtime::Runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime() -> Runtime {
        Runtime::ephemeral()
    }

    fn space() -> SpaceId {
        SpaceId::new("s")
    }

    #[test]
    fn test_set_get_raw_roundtrip() {
        let rt = runtime();
        let cell = rt.get_cell(&space(), "doc", None);
        assert!(cell.set(json!({"a": [1, 2]})));
        assert_eq!(cell.get_raw(), Some(json!({"a": [1, 2]})));
    }

    #[test]
    fn test_key_derives_child_handle() {
        let rt = runtime();
        let cell = rt.get_cell(&space(), "doc", None);
        cell.set(json!({"nested": {"n": 7}}));

        let child = cell.key("nested").key("n");
        assert_eq!(child.get_raw(), Some(json!(7)));
        assert_eq!(child.address().path.len(), 2);
    }

    #[test]
    fn test_key_walks_schema() {
        let rt = runtime();
        let schema = Schema::from_value(&json!({
            "properties": {"inner": {"type": "number", "ifc": {"classification": ["secret"]}}},
        }))
        .unwrap();
        let cell = rt.get_cell(&space(), "doc", Some(schema));
        let child = cell.key("inner");
        assert_eq!(
            child.schema(),
            Some(&Schema::from_value(
                &json!({"type": "number", "ifc": {"classification": ["secret"]}})
            )
            .unwrap())
        );
    }

    #[test]
    fn test_update_merges_keys() {
        let rt = runtime();
        let cell = rt.get_cell(&space(), "doc", None);
        cell.set(json!({"keep": 1, "change": 2}));
        assert!(cell.update(json!({"change": 3, "fresh": 4})));
        assert_eq!(
            cell.get_raw(),
            Some(json!({"keep": 1, "change": 3, "fresh": 4}))
        );
    }

    #[test]
    fn test_push_creates_and_appends() {
        let rt = runtime();
        let cell = rt.get_cell(&space(), "list", None);
        assert!(cell.push(json!(1)));
        assert!(cell.push(json!(2)));
        assert_eq!(cell.get_raw(), Some(json!([1, 2])));
    }

    #[test]
    fn test_get_materialises_view() {
        let rt = runtime();
        let cell = rt.get_cell(&space(), "doc", None);
        cell.set(json!({"n": 5}));

        let view = cell.get().unwrap();
        assert_eq!(view.key("n").unwrap().as_leaf(), Some(&json!(5)));
    }

    #[test]
    fn test_equals_same_entity_only() {
        let rt = runtime();
        let a = rt.get_cell(&space(), "doc", None);
        let b = rt.get_cell(&space(), "doc", None);
        let c = rt.get_cell(&space(), "other", None);
        assert!(a.equals(&b));
        assert!(!a.equals(&c));
        assert!(!a.equals(&a.key("x")));

        // Another runtime never compares equal.
        let rt2 = runtime();
        let foreign = rt2.get_cell(&space(), "doc", None);
        assert!(!a.equals(&foreign));
    }

    #[test]
    fn test_links_render() {
        let rt = runtime();
        let cell = rt.get_cell(&space(), "doc", None).key("sub");

        let link = crate::reference::link::parse_link(&cell.get_as_link()).unwrap();
        assert_eq!(link.id, cell.address().id);
        assert_eq!(link.path, vec!["sub".to_string()]);
        assert!(link.space.is_none());

        let full = crate::reference::link::parse_link(&cell.get_as_normalized_full_link()).unwrap();
        assert_eq!(full.space, Some(space()));
    }

    #[test]
    fn test_sink_fires_on_change() {
        let rt = runtime();
        let cell = rt.get_cell(&space(), "doc", None);
        cell.set(json!(0));

        let fires = Arc::new(AtomicUsize::new(0));
        let fires_in = fires.clone();
        let handle = cell.sink(move |_view| {
            fires_in.fetch_add(1, Ordering::SeqCst);
        });

        // Initial run plus one per change.
        rt.idle();
        assert_eq!(fires.load(Ordering::SeqCst), 1);

        cell.set(json!(1));
        rt.idle();
        assert_eq!(fires.load(Ordering::SeqCst), 2);

        // Unrelated cells do not fire the sink.
        rt.get_cell(&space(), "other", None).set(json!(9));
        rt.idle();
        assert_eq!(fires.load(Ordering::SeqCst), 2);

        handle.cancel();
        cell.set(json!(2));
        rt.idle();
        assert_eq!(fires.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_set_is_minimal_via_diff() {
        let rt = runtime();
        let cell = rt.get_cell(&space(), "doc", None);
        cell.set(json!({"a": 1, "b": 2}));

        let mut tx = rt.edit();
        let mut bound = cell.with_tx(&mut tx);
        bound.set(json!({"a": 1, "b": 3})).unwrap();
        let novelty = tx.journal().novelty(&space());
        // Only the changed key was staged.
        assert_eq!(novelty.len(), 1);
        assert_eq!(novelty[0].address.path, vec![PathSegment::from("b")]);
        tx.commit().unwrap();
    }

    #[test]
    fn test_send_on_plain_cell_sets() {
        let rt = runtime();
        let cell = rt.get_cell(&space(), "doc", None);
        assert!(cell.send(json!(42)));
        assert_eq!(cell.get_raw(), Some(json!(42)));
    }
}
