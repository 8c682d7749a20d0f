//! Runtime façade: cells, edits, and pattern instantiation.
//!
//! A [`Runtime`] ties the pieces together: it owns the storage manager
//! and the scheduler, stamps every transaction with a commit hook that
//! feeds novelty back into dirty propagation, and hands out [`Cell`]
//! handles as the user-facing surface.

pub mod cell;
pub mod pattern;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tracing::debug;

use crate::address::{Address, EntityId, SpaceId};
use crate::cfc::{CfcConfig, CfcMode};
use crate::reference::link::Link;
use crate::reference::{refer, Reference};
use crate::replica::error::ReplicaError;
use crate::scheduler::{ActionCallback, ActionId, ActionKind, RangeClaim, Scheduler, Timing};
use crate::schema::Schema;
use crate::storage::StorageManager;
use crate::transaction::{
    edit_with_retry, ReadOptions, Transaction, TransactionError, WriteOptions, DEFAULT_MAX_RETRIES,
};

pub use cell::{Cell, SinkHandle, TxCell};
pub use pattern::{Pattern, PatternFile};

/// Evaluates a pattern instance: input value in, result value out. The
/// compiler/eval harness registers one per pattern id.
pub type Evaluator = Arc<dyn Fn(Option<Value>) -> Option<Value> + Send + Sync>;

pub(crate) struct RuntimeInner {
    pub(crate) storage: Arc<StorageManager>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) cfc: CfcConfig,
    pub(crate) evaluators: RwLock<HashMap<Reference, Evaluator>>,
}

/// Entity identity by cause: a stable string id, or a structured cause
/// value hashed into one.
#[derive(Debug, Clone)]
pub enum CellCause {
    /// Use the string as the entity id suffix directly.
    Name(String),

    /// Hash the value to derive the id.
    Structured(Value),
}

impl From<&str> for CellCause {
    fn from(s: &str) -> Self {
        CellCause::Name(s.to_string())
    }
}

impl From<Value> for CellCause {
    fn from(v: Value) -> Self {
        CellCause::Structured(v)
    }
}

impl CellCause {
    fn entity_id(&self) -> EntityId {
        match self {
            CellCause::Name(name) => EntityId::of(name),
            CellCause::Structured(value) => EntityId::of(refer(value).as_str()),
        }
    }
}

/// The reactive runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// A runtime over in-memory storage with flow checks disabled.
    pub fn ephemeral() -> Self {
        Self::with_config(Arc::new(StorageManager::ephemeral()), CfcConfig::default())
    }

    /// A runtime persisting spaces under `base_path`.
    pub fn open(base_path: impl AsRef<Path>) -> Result<Self, ReplicaError> {
        Ok(Self::with_config(
            Arc::new(StorageManager::open(base_path)?),
            CfcConfig::default(),
        ))
    }

    /// A runtime over explicit storage and flow-control configuration.
    pub fn with_config(storage: Arc<StorageManager>, cfc: CfcConfig) -> Self {
        let inner = Arc::new(RuntimeInner {
            storage,
            scheduler: Arc::new(Scheduler::new()),
            cfc,
            evaluators: RwLock::new(HashMap::new()),
        });

        // Actions run against transactions wired back into the scheduler.
        let weak = Arc::downgrade(&inner);
        inner
            .scheduler
            .set_transaction_factory(Arc::new(move || {
                match weak.upgrade() {
                    Some(inner) => open_transaction(&inner),
                    // The runtime is gone; an unhooked transaction still
                    // satisfies the factory contract.
                    None => Transaction::new(
                        Arc::new(StorageManager::ephemeral()),
                        CfcConfig::default(),
                    ),
                }
            }));

        let weak = Arc::downgrade(&inner);
        inner.scheduler.set_auto_start(Arc::new(move |address| {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            resume_process(&inner, &address.space, &address.id).is_some()
        }));

        Self { inner }
    }

    /// A sibling runtime over the same storage in a different
    /// flow-control mode.
    pub fn with_cfc_mode(&self, mode: CfcMode) -> Self {
        let cfc = CfcConfig {
            mode,
            lattice: self.inner.cfc.lattice.clone(),
        };
        Self::with_config(self.inner.storage.clone(), cfc)
    }

    /// Open a transaction bound to this runtime.
    pub fn edit(&self) -> Transaction {
        open_transaction(&self.inner)
    }

    /// Run `body` with commit and conflict retry, up to the default
    /// retry budget.
    pub fn edit_with_retry<F>(&self, body: F) -> bool
    where
        F: FnMut(&mut Transaction) -> Result<(), TransactionError>,
    {
        self.edit_with_retry_bounded(body, DEFAULT_MAX_RETRIES)
    }

    /// As [`Runtime::edit_with_retry`] with an explicit retry budget.
    pub fn edit_with_retry_bounded<F>(&self, body: F, max_retries: u32) -> bool
    where
        F: FnMut(&mut Transaction) -> Result<(), TransactionError>,
    {
        let inner = self.inner.clone();
        edit_with_retry(move || open_transaction(&inner), body, max_retries)
    }

    /// A cell handle for `(space, cause)` under an optional schema.
    pub fn get_cell(
        &self,
        space: &SpaceId,
        cause: impl Into<CellCause>,
        schema: Option<Schema>,
    ) -> Cell {
        let address = Address::root(space.clone(), cause.into().entity_id());
        Cell::new(self.inner.clone(), address, schema)
    }

    /// Block until the scheduler is quiescent.
    pub fn idle(&self) {
        self.inner.scheduler.idle();
    }

    /// The scheduler, for direct action and stream registration.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    /// The storage manager backing this runtime.
    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.inner.storage
    }

    // === Patterns ===

    /// Persist a pattern record in `space`. The fact's entity is the
    /// pattern's content id, so re-installing is idempotent.
    pub fn install_pattern(
        &self,
        space: &SpaceId,
        pattern: &Pattern,
    ) -> Result<Reference, TransactionError> {
        let id = pattern.id();
        let address = Address::root(space.clone(), EntityId::of(id.as_str()));
        let value = pattern.to_value();

        let ok = self.edit_with_retry(|tx| {
            tx.write(&address, Some(value.clone()), WriteOptions::default())?;
            Ok(())
        });
        if !ok {
            return Err(TransactionError::Aborted {
                reason: "pattern install failed".to_string(),
            });
        }
        debug!(pattern = %id, "pattern installed");
        Ok(id)
    }

    /// Load a pattern record back by content id.
    pub fn pattern(
        &self,
        space: &SpaceId,
        id: &Reference,
    ) -> Result<Option<Pattern>, TransactionError> {
        let address = Address::root(space.clone(), EntityId::of(id.as_str()));
        let mut tx = self.edit();
        let value = tx.read(&address, ReadOptions::default())?.value;
        Ok(value.as_ref().and_then(Pattern::from_value))
    }

    /// Register the evaluator for a pattern id.
    pub fn register_evaluator(&self, id: Reference, evaluator: Evaluator) {
        self.inner.evaluators.write().insert(id, evaluator);
    }

    /// Instantiate a pattern: wire `input` to `result` through the
    /// registered evaluator, persist the process fact that makes the
    /// instance resumable, and schedule the first run.
    pub fn run(
        &self,
        pattern_id: &Reference,
        input: &Cell,
        result: &Cell,
    ) -> Result<ActionId, TransactionError> {
        let process = json!({
            "pattern": pattern_id.as_str(),
            "input": full_link(input.address()).to_value(),
            "result": full_link(result.address()).to_value(),
        });
        let process_address = process_address(&result.address().space, &result.address().id);

        let ok = self.edit_with_retry(|tx| {
            tx.write(&process_address, Some(process.clone()), WriteOptions::default())?;
            Ok(())
        });
        if !ok {
            return Err(TransactionError::Aborted {
                reason: "process fact write failed".to_string(),
            });
        }

        Ok(register_process_action(
            &self.inner,
            pattern_id.clone(),
            input.address().clone(),
            result.address().clone(),
        ))
    }

    /// Re-attach a pattern instance from its persisted process fact, by
    /// result cell. Returns `None` when no process fact exists.
    pub fn resume(&self, result: &Cell) -> Option<ActionId> {
        resume_process(&self.inner, &result.address().space, &result.address().id)
    }
}

/// Open a transaction wired into the runtime's scheduler.
fn open_transaction(inner: &Arc<RuntimeInner>) -> Transaction {
    let weak = Arc::downgrade(&inner.scheduler);
    Transaction::new(inner.storage.clone(), inner.cfc.clone()).with_commit_hook(Arc::new(
        move |space, novelty| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.on_commit(space, novelty);
            }
        },
    ))
}

/// Address of the process fact for a result entity, derived causally so
/// any session can re-derive it from the result cell alone.
fn process_address(space: &SpaceId, result: &EntityId) -> Address {
    let id = EntityId::of(refer(&json!({"process": result.as_str()})).as_str());
    Address::root(space.clone(), id)
}

/// Render a normalised full link (explicit space, no schema hint).
fn full_link(address: &Address) -> Link {
    Link::to_entity(address.id.clone())
        .at(address.path.iter().map(|s| s.to_string()).collect())
        .in_space(address.space.clone())
}

/// Register the computation action for a pattern instance.
fn register_process_action(
    inner: &Arc<RuntimeInner>,
    pattern_id: Reference,
    input: Address,
    result: Address,
) -> ActionId {
    let weak = Arc::downgrade(inner);
    let input_in = input.clone();
    let result_in = result.clone();
    let callback: ActionCallback = Arc::new(Mutex::new(move |tx: &mut Transaction| {
        let Some(inner) = weak.upgrade() else {
            return Ok(());
        };
        let evaluator = inner.evaluators.read().get(&pattern_id).cloned();
        let Some(evaluator) = evaluator else {
            // No harness registered yet; stay quiet until one shows up.
            return Ok(());
        };
        let input_value = tx.read(&input_in, ReadOptions::default())?.value;
        if let Some(output) = evaluator(input_value) {
            tx.write(&result_in, Some(output), WriteOptions::default())?;
        }
        Ok(())
    }));

    let id = inner.scheduler.register(
        ActionKind::Computation,
        Timing::immediate(),
        vec![RangeClaim::from_address(&input)],
        vec![RangeClaim::from_address(&result)],
        callback,
    );
    inner.scheduler.mark_dirty(id);
    id
}

/// Load the process fact for `result` and re-register its action.
fn resume_process(
    inner: &Arc<RuntimeInner>,
    space: &SpaceId,
    result: &EntityId,
) -> Option<ActionId> {
    let address = process_address(space, result);
    let mut tx = open_transaction(inner);
    let value = tx.read(&address, ReadOptions::default()).ok()?.value?;

    let pattern_id = Reference::from_hex(value.get("pattern")?.as_str()?).ok()?;
    let input = crate::reference::link::parse_link(value.get("input")?)?.to_address(
        space,
        crate::address::JSON_MEDIA_TYPE,
    );
    let result_address = crate::reference::link::parse_link(value.get("result")?)?.to_address(
        space,
        crate::address::JSON_MEDIA_TYPE,
    );

    debug!(pattern = %pattern_id, "process resumed");
    Some(register_process_action(
        inner,
        pattern_id,
        input,
        result_address,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_cause_forms() {
        let named = CellCause::from("input").entity_id();
        assert_eq!(named.as_str(), "of:input");

        let structured = CellCause::from(json!({"parent": "of:x", "n": 1})).entity_id();
        assert!(structured.as_str().starts_with("of:"));
        assert_eq!(structured.as_str().len(), 3 + 64);

        // Structured causes are stable.
        let again = CellCause::from(json!({"n": 1, "parent": "of:x"})).entity_id();
        assert_eq!(structured, again);
    }

    #[test]
    fn test_edit_reaches_scheduler() {
        let runtime = Runtime::ephemeral();
        let space = SpaceId::new("s");
        let cell = runtime.get_cell(&space, "seed", None);

        assert!(cell.set(json!({"n": 1})));
        assert_eq!(cell.get_raw(), Some(json!({"n": 1})));
    }

    #[test]
    fn test_install_and_load_pattern() {
        let runtime = Runtime::ephemeral();
        let space = SpaceId::new("s");
        let pattern = Pattern::new("main.ts", vec![PatternFile::new("main.ts", "export {}")]);

        let id = runtime.install_pattern(&space, &pattern).unwrap();
        assert_eq!(id, pattern.id());

        let loaded = runtime.pattern(&space, &id).unwrap().unwrap();
        assert_eq!(loaded, pattern);
        assert_eq!(loaded.id(), id);

        // Unknown id loads nothing.
        let missing = Reference::from_bytes(b"nope");
        assert!(runtime.pattern(&space, &missing).unwrap().is_none());
    }

    #[test]
    fn test_run_pattern_reacts_to_input() {
        let runtime = Runtime::ephemeral();
        let space = SpaceId::new("s");
        let pattern = Pattern::new("sum.ts", vec![PatternFile::new("sum.ts", "…")]);
        let id = runtime.install_pattern(&space, &pattern).unwrap();

        runtime.register_evaluator(
            id.clone(),
            Arc::new(|input| {
                let total: i64 = input?
                    .get("values")?
                    .as_array()?
                    .iter()
                    .filter_map(Value::as_i64)
                    .sum();
                Some(json!({"sum": total}))
            }),
        );

        let input = runtime.get_cell(&space, "input", None);
        let result = runtime.get_cell(&space, "result", None);
        input.set(json!({"values": [1, 2, 3]}));

        runtime.run(&id, &input, &result).unwrap();
        runtime.idle();
        assert_eq!(result.get_raw(), Some(json!({"sum": 6})));

        // Updating the input recomputes the result.
        input.set(json!({"values": [10, 20]}));
        runtime.idle();
        assert_eq!(result.get_raw(), Some(json!({"sum": 30})));
    }

    #[test]
    fn test_resume_from_process_fact() {
        let runtime = Runtime::ephemeral();
        let space = SpaceId::new("s");
        let pattern = Pattern::new("echo.ts", vec![PatternFile::new("echo.ts", "…")]);
        let id = runtime.install_pattern(&space, &pattern).unwrap();
        runtime.register_evaluator(id.clone(), Arc::new(|input| input));

        let input = runtime.get_cell(&space, "input", None);
        let result = runtime.get_cell(&space, "result", None);
        runtime.run(&id, &input, &result).unwrap();
        runtime.idle();

        // A second runtime over the same storage resumes by result cell.
        let second = Runtime::with_config(runtime.storage().clone(), CfcConfig::default());
        second.register_evaluator(id, Arc::new(|input| input));
        let result2 = second.get_cell(&space, "result", None);
        assert!(second.resume(&result2).is_some());

        let input2 = second.get_cell(&space, "input", None);
        input2.set(json!("hello"));
        second.idle();
        assert_eq!(result2.get_raw(), Some(json!("hello")));
    }

    #[test]
    fn test_resume_without_process_fact() {
        let runtime = Runtime::ephemeral();
        let space = SpaceId::new("s");
        let orphan = runtime.get_cell(&space, "orphan", None);
        assert!(runtime.resume(&orphan).is_none());
    }
}
