//! Reactive scheduler: dirty propagation over an inferred action graph.
//!
//! Actions declare (or discover, from their first run's journal) read and
//! write sets as range claims. A commit's novelty marks every action
//! whose reads overlap the written ranges; the dirty frontier drains in
//! topological order of inferred edges, effects after computations, with
//! at most two executions per action per drain to keep cycles finite.
//! Debounce and throttle windows defer execution through a timer wheel,
//! and `idle()` blocks until both the frontier and the wheel are empty.

pub mod events;
pub mod graph;
pub mod timing;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::address::Address;
use crate::transaction::{Activity, Journal, Transaction, WriteRecord, DEFAULT_MAX_RETRIES};
use crate::address::SpaceId;

pub use events::{HandlerCallback, HandlerId};
pub use graph::{ActionCallback, ActionId, ActionKind, RangeClaim};
pub use timing::Timing;

use events::StreamTable;
use graph::{ActionGraph, ActionIdx};
use timing::TimerWheel;

/// Supplies a fresh transaction (with the runtime's commit hook attached)
/// for each action execution.
pub type TxFactory = Arc<dyn Fn() -> Transaction + Send + Sync>;

/// Invoked when an event is queued to a stream with no handler. Returning
/// `true` means a computation was started and delivery should be retried.
pub type AutoStartHook = Arc<dyn Fn(&Address) -> bool + Send + Sync>;

struct SchedulerState {
    graph: ActionGraph,
    dirty: Vec<ActionIdx>,
    timers: TimerWheel,
    streams: StreamTable,
    dispatching: bool,
    auto_start: Option<AutoStartHook>,
    started: HashSet<Address>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            graph: ActionGraph::default(),
            dirty: Vec::new(),
            timers: TimerWheel::default(),
            streams: StreamTable::default(),
            dispatching: false,
            auto_start: None,
            started: HashSet::new(),
        }
    }
}

/// Single-threaded cooperative scheduler.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    factory: Mutex<Option<TxFactory>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// An empty scheduler. A transaction factory must be installed before
    /// any action can run.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            factory: Mutex::new(None),
        }
    }

    /// Install the transaction factory actions run against.
    pub fn set_transaction_factory(&self, factory: TxFactory) {
        *self.factory.lock() = Some(factory);
    }

    /// Install the hook consulted when an event targets a handler-less
    /// stream.
    pub fn set_auto_start(&self, hook: AutoStartHook) {
        self.state.lock().auto_start = Some(hook);
    }

    /// Register an action with its initial claims. Returns a handle for
    /// cancellation; the action stays live until cancelled.
    pub fn register(
        &self,
        kind: ActionKind,
        timing: Timing,
        reads: Vec<RangeClaim>,
        writes: Vec<RangeClaim>,
        callback: ActionCallback,
    ) -> ActionId {
        let mut st = self.state.lock();
        let (id, _) = st.graph.insert(kind, timing, reads, writes, callback);
        debug!(?id, ?kind, "action registered");
        id
    }

    /// Mark an action dirty, honouring its timing options.
    pub fn mark_dirty(&self, id: ActionId) {
        let mut st = self.state.lock();
        if let Some(idx) = st.graph.idx_of(id) {
            trigger(&mut st, idx, Instant::now());
        }
    }

    /// Remove an action from the graph, the frontier, and the wheel.
    pub fn cancel(&self, id: ActionId) {
        let mut st = self.state.lock();
        if let Some(idx) = st.graph.idx_of(id) {
            st.dirty.retain(|&d| d != idx);
        }
        st.timers.cancel(id);
        st.graph.remove(id);
    }

    /// React to a commit: every action whose reads overlap the novelty is
    /// triggered.
    pub fn on_commit(&self, space: &SpaceId, novelty: &[WriteRecord]) {
        let claims: Vec<RangeClaim> = novelty
            .iter()
            .map(|write| RangeClaim::from_address(&write.address))
            .collect();
        let _ = space;

        let mut st = self.state.lock();
        let now = Instant::now();
        for idx in st.graph.dependents(&claims) {
            trigger(&mut st, idx, now);
        }
    }

    /// Register an event handler under a stream address.
    pub fn register_handler(&self, address: &Address, callback: HandlerCallback) -> HandlerId {
        self.state.lock().streams.register(address, callback)
    }

    /// Remove an event handler.
    pub fn unregister_handler(&self, id: HandlerId) {
        self.state.lock().streams.unregister(id);
    }

    /// Append one event to a stream's queue.
    pub fn queue_event(&self, address: &Address, event: Value) {
        self.state.lock().streams.enqueue(address, event);
    }

    /// Drain the dirty frontier once, running actions in topological
    /// order. Does not advance timers.
    pub fn drain(&self) {
        {
            let mut st = self.state.lock();
            let indices: Vec<ActionIdx> = st.graph.iter().map(|(idx, _)| idx).collect();
            for idx in indices {
                if let Some(node) = st.graph.get_mut(idx) {
                    node.runs_in_drain = 0;
                }
            }
        }

        loop {
            let next = {
                let mut st = self.state.lock();
                let mut chosen = None;
                while chosen.is_none() {
                    if st.dirty.is_empty() {
                        break;
                    }
                    let ordered = st.graph.schedule_order(&st.dirty.clone());
                    let Some(&idx) = ordered.first() else {
                        break;
                    };
                    st.dirty.retain(|&d| d != idx);
                    match st.graph.get_mut(idx) {
                        Some(node) if node.runs_in_drain < 2 => {
                            node.runs_in_drain += 1;
                            chosen = Some((node.id, node.callback.clone()));
                        }
                        // Cycle cap reached (or the node is gone): the
                        // dirty entry is dropped without running.
                        _ => {}
                    }
                }
                chosen
            };

            match next {
                Some((id, callback)) => self.run_action(id, callback),
                None => break,
            }
        }
    }

    /// Block until the dirty frontier, event queues, and timer wheel are
    /// all empty.
    pub fn idle(&self) {
        loop {
            self.dispatch_events();
            self.drain();

            enum Wait {
                Again,
                Sleep(Instant),
                Done,
            }

            let wait = {
                let st = self.state.lock();
                if !st.dirty.is_empty() || !st.streams.is_drained() {
                    Wait::Again
                } else if let Some(deadline) = st.timers.next_deadline() {
                    Wait::Sleep(deadline)
                } else {
                    Wait::Done
                }
            };

            match wait {
                Wait::Again => continue,
                Wait::Done => break,
                Wait::Sleep(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    }
                    let mut st = self.state.lock();
                    let due = st.timers.pop_due(Instant::now());
                    for id in due {
                        // The window already elapsed; enqueue directly.
                        if let Some(idx) = st.graph.idx_of(id) {
                            if !st.dirty.contains(&idx) {
                                st.dirty.push(idx);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Deliver queued events, one transaction per handler per event. The
    /// dispatcher is single-flight: events queued while it runs are
    /// drained by the running instance.
    fn dispatch_events(&self) {
        {
            let mut st = self.state.lock();
            if st.dispatching {
                return;
            }
            st.dispatching = true;
        }

        loop {
            let item = { self.state.lock().streams.pop_next() };
            let Some((address, event)) = item else {
                break;
            };

            let mut handlers = { self.state.lock().streams.handlers_for(&address) };
            if handlers.is_empty() {
                if self.try_auto_start(&address) {
                    handlers = { self.state.lock().streams.handlers_for(&address) };
                }
            }
            if handlers.is_empty() {
                debug!(address = %address, "dropping event with no handler");
                continue;
            }

            for handler in handlers {
                self.run_handler(&handler, &event);
            }
        }

        self.state.lock().dispatching = false;
    }

    fn try_auto_start(&self, address: &Address) -> bool {
        let hook = {
            let mut st = self.state.lock();
            if st.auto_start.is_none() || !st.started.insert(address.clone()) {
                // Started once already (or nothing to start): never retry,
                // otherwise a failing start would loop forever.
                return false;
            }
            st.auto_start.clone()
        };
        match hook {
            Some(hook) => hook(address),
            None => false,
        }
    }

    /// Run one action body with conflict retry, then refresh its claims
    /// from the journal it produced.
    fn run_action(&self, id: ActionId, callback: ActionCallback) {
        let Some(factory) = self.factory.lock().clone() else {
            warn!("no transaction factory installed; action skipped");
            return;
        };

        for _attempt in 0..=DEFAULT_MAX_RETRIES {
            let mut tx = factory();
            let result = {
                let mut body = callback.lock();
                body(&mut tx)
            };
            match result {
                Ok(()) => match tx.commit() {
                    Ok(_) => {
                        self.refresh_claims(id, tx.journal());
                        return;
                    }
                    Err(e) if e.is_conflict() => continue,
                    Err(e) => {
                        warn!(?id, error = %e, "action commit failed");
                        return;
                    }
                },
                Err(e) if e.is_retryable() => continue,
                Err(e) => {
                    warn!(?id, error = %e, "action failed");
                    return;
                }
            }
        }
        warn!(?id, "action exhausted conflict retries");
    }

    fn run_handler(&self, handler: &HandlerCallback, event: &Value) {
        let Some(factory) = self.factory.lock().clone() else {
            warn!("no transaction factory installed; event dropped");
            return;
        };

        for _attempt in 0..=DEFAULT_MAX_RETRIES {
            let mut tx = factory();
            let result = {
                let mut body = handler.lock();
                body(&mut tx, event)
            };
            match result {
                Ok(()) => match tx.commit() {
                    Ok(_) => return,
                    Err(e) if e.is_conflict() => continue,
                    Err(e) => {
                        warn!(error = %e, "event handler commit failed");
                        return;
                    }
                },
                Err(e) if e.is_retryable() => continue,
                Err(e) => {
                    warn!(error = %e, "event handler failed");
                    return;
                }
            }
        }
        warn!("event handler exhausted conflict retries");
    }

    /// Replace an action's claims with the ranges its last run touched.
    fn refresh_claims(&self, id: ActionId, journal: &Journal) {
        let mut reads = Vec::new();
        let mut writes = Vec::new();
        for entry in journal.activity() {
            let claim = RangeClaim::from_address(entry.address());
            match entry {
                Activity::Read { .. } => {
                    if !reads.contains(&claim) {
                        reads.push(claim);
                    }
                }
                Activity::Write { .. } => {
                    if !writes.contains(&claim) {
                        writes.push(claim);
                    }
                }
            }
        }

        let mut st = self.state.lock();
        if let Some(idx) = st.graph.idx_of(id) {
            if let Some(node) = st.graph.get_mut(idx) {
                node.reads = reads;
                node.writes = writes;
                node.last_run = Some(Instant::now());
            }
        }
    }
}

/// Trigger an action under its timing rules. Must hold the state lock.
fn trigger(st: &mut SchedulerState, idx: ActionIdx, now: Instant) {
    let Some(node) = st.graph.get(idx) else {
        return;
    };
    let id = node.id;

    if let Some(window) = node.timing.debounce {
        // Every trigger restarts the window.
        st.timers.schedule(id, now + window);
        return;
    }

    if let Some(window) = node.timing.throttle {
        if let Some(last) = node.last_run {
            if now.duration_since(last) < window {
                // Coalesce into one run at the window's end.
                if !st.timers.is_scheduled(id) {
                    st.timers.schedule(id, last + window);
                }
                return;
            }
        }
    }

    if !st.dirty.contains(&idx) {
        st.dirty.push(idx);
    }
}
