//! Event streams: per-address queues and handler registry.
//!
//! A cell position whose schema says `asStream` behaves as a queue:
//! `queue_event` appends, and the scheduler's single-flight dispatcher
//! delivers each event to every handler registered under the address.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::address::Address;
use crate::transaction::{Transaction, TransactionError};

/// Handler callback: one event in its own transaction.
pub type HandlerCallback =
    Arc<Mutex<dyn FnMut(&mut Transaction, &Value) -> Result<(), TransactionError> + Send>>;

/// Stable identifier of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

struct Handler {
    id: HandlerId,
    callback: HandlerCallback,
}

/// Queues and handlers keyed by stream address.
#[derive(Default)]
pub(crate) struct StreamTable {
    queues: HashMap<Address, VecDeque<Value>>,
    handlers: HashMap<Address, Vec<Handler>>,
}

impl StreamTable {
    /// Append an event to the address's queue.
    pub fn enqueue(&mut self, address: &Address, event: Value) {
        self.queues
            .entry(address.clone())
            .or_default()
            .push_back(event);
    }

    /// Register a handler under an address.
    pub fn register(&mut self, address: &Address, callback: HandlerCallback) -> HandlerId {
        let id = HandlerId(Uuid::new_v4());
        self.handlers
            .entry(address.clone())
            .or_default()
            .push(Handler { id, callback });
        id
    }

    /// Remove a handler. Unknown ids are ignored.
    pub fn unregister(&mut self, id: HandlerId) {
        for handlers in self.handlers.values_mut() {
            handlers.retain(|h| h.id != id);
        }
        self.handlers.retain(|_, handlers| !handlers.is_empty());
    }

    /// Pop the next `(address, event)` pair from any non-empty queue.
    pub fn pop_next(&mut self) -> Option<(Address, Value)> {
        let address = self
            .queues
            .iter()
            .find(|(_, queue)| !queue.is_empty())
            .map(|(address, _)| address.clone())?;
        let event = self.queues.get_mut(&address)?.pop_front()?;
        Some((address, event))
    }

    /// Handlers for an address, cloned for lock-free invocation.
    pub fn handlers_for(&self, address: &Address) -> Vec<HandlerCallback> {
        self.handlers
            .get(address)
            .map(|handlers| handlers.iter().map(|h| h.callback.clone()).collect())
            .unwrap_or_default()
    }

    /// True when no events wait in any queue.
    pub fn is_drained(&self) -> bool {
        self.queues.values().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{EntityId, PathSegment, SpaceId};

    fn addr() -> Address {
        Address::root(SpaceId::new("s"), EntityId::of("cell"))
            .with_path(vec![PathSegment::from("events")])
    }

    fn noop_handler() -> HandlerCallback {
        Arc::new(Mutex::new(|_tx: &mut Transaction, _ev: &Value| Ok(())))
    }

    #[test]
    fn test_enqueue_and_pop_fifo() {
        let mut table = StreamTable::default();
        table.enqueue(&addr(), serde_json::json!(1));
        table.enqueue(&addr(), serde_json::json!(2));

        let (address, first) = table.pop_next().unwrap();
        assert_eq!(address, addr());
        assert_eq!(first, serde_json::json!(1));
        let (_, second) = table.pop_next().unwrap();
        assert_eq!(second, serde_json::json!(2));
        assert!(table.pop_next().is_none());
        assert!(table.is_drained());
    }

    #[test]
    fn test_register_and_unregister() {
        let mut table = StreamTable::default();
        let id = table.register(&addr(), noop_handler());
        assert_eq!(table.handlers_for(&addr()).len(), 1);

        table.unregister(id);
        assert!(table.handlers_for(&addr()).is_empty());
        // Unknown id is a no-op.
        table.unregister(id);
    }

    #[test]
    fn test_handlers_keyed_by_full_address() {
        let mut table = StreamTable::default();
        table.register(&addr(), noop_handler());

        let other = Address::root(SpaceId::new("s"), EntityId::of("cell"))
            .with_path(vec![PathSegment::from("other")]);
        assert!(table.handlers_for(&other).is_empty());
    }
}
