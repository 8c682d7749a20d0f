//! Action graph: arena-backed nodes with read/write range claims.
//!
//! Nodes live in a vector with a free list; external handles are stable
//! ids mapped to 32-bit indices. Edges are not stored: `A → B` exists iff
//! some write claim of `A` overlaps some read claim of `B` (prefix match
//! in either direction), computed on demand over the candidate set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::{Address, EntityId, PathSegment, SpaceId};
use crate::transaction::{Transaction, TransactionError};

use super::timing::Timing;

/// One element of an action's declared read or write set: an entity plus
/// a path prefix within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeClaim {
    /// Space of the claimed entity.
    pub space: SpaceId,

    /// Claimed entity.
    pub of: EntityId,

    /// Media type.
    pub the: String,

    /// Path prefix; empty claims the whole fact.
    pub path: Vec<PathSegment>,
}

impl RangeClaim {
    /// Claim the position an address names.
    pub fn from_address(address: &Address) -> Self {
        Self {
            space: address.space.clone(),
            of: address.id.clone(),
            the: address.the.clone(),
            path: address.path.clone(),
        }
    }

    /// Two claims overlap when they name the same entity and one path is
    /// a prefix of the other.
    pub fn overlaps(&self, other: &RangeClaim) -> bool {
        if self.space != other.space || self.of != other.of || self.the != other.the {
            return false;
        }
        let shared = self.path.len().min(other.path.len());
        self.path[..shared] == other.path[..shared]
    }
}

/// Whether an action is a pure producer or runs for side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Pure computation writing back into the graph.
    Computation,

    /// Side-effecting action, ordered after computations.
    Effect,
}

/// Stable external identifier of a registered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId(Uuid);

impl ActionId {
    pub(crate) fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

/// The callback an action runs: a transaction body.
pub type ActionCallback =
    Arc<Mutex<dyn FnMut(&mut Transaction) -> Result<(), TransactionError> + Send>>;

/// Arena slot index.
pub(crate) type ActionIdx = u32;

pub(crate) struct ActionNode {
    pub id: ActionId,
    pub kind: ActionKind,
    pub timing: Timing,
    pub reads: Vec<RangeClaim>,
    pub writes: Vec<RangeClaim>,
    pub callback: ActionCallback,
    /// Registration order, the scheduling tie-breaker.
    pub order: u64,
    /// Executions in the current drain (cycle cap).
    pub runs_in_drain: u32,
    pub last_run: Option<Instant>,
}

/// Arena of action nodes with an id index.
#[derive(Default)]
pub(crate) struct ActionGraph {
    nodes: Vec<Option<ActionNode>>,
    free: Vec<ActionIdx>,
    index: HashMap<ActionId, ActionIdx>,
    next_order: u64,
}

impl ActionGraph {
    pub fn insert(
        &mut self,
        kind: ActionKind,
        timing: Timing,
        reads: Vec<RangeClaim>,
        writes: Vec<RangeClaim>,
        callback: ActionCallback,
    ) -> (ActionId, ActionIdx) {
        let id = ActionId::fresh();
        let order = self.next_order;
        self.next_order += 1;
        let node = ActionNode {
            id,
            kind,
            timing,
            reads,
            writes,
            callback,
            order,
            runs_in_drain: 0,
            last_run: None,
        };

        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                (self.nodes.len() - 1) as ActionIdx
            }
        };
        self.index.insert(id, idx);
        (id, idx)
    }

    pub fn remove(&mut self, id: ActionId) -> Option<ActionNode> {
        let idx = self.index.remove(&id)?;
        let node = self.nodes[idx as usize].take();
        self.free.push(idx);
        node
    }

    pub fn idx_of(&self, id: ActionId) -> Option<ActionIdx> {
        self.index.get(&id).copied()
    }

    pub fn get(&self, idx: ActionIdx) -> Option<&ActionNode> {
        self.nodes.get(idx as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, idx: ActionIdx) -> Option<&mut ActionNode> {
        self.nodes.get_mut(idx as usize).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActionIdx, &ActionNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|node| (i as ActionIdx, node)))
    }

    /// Actions whose read set overlaps any of the given write claims.
    pub fn dependents(&self, writes: &[RangeClaim]) -> Vec<ActionIdx> {
        self.iter()
            .filter(|(_, node)| {
                node.reads
                    .iter()
                    .any(|read| writes.iter().any(|write| write.overlaps(read)))
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    /// True when `b` depends on `a` (a write of `a` overlaps a read of
    /// `b`).
    fn depends(&self, a: &ActionNode, b: &ActionNode) -> bool {
        a.writes
            .iter()
            .any(|write| b.reads.iter().any(|read| write.overlaps(read)))
    }

    /// Order a candidate set for execution: topological by inferred
    /// edges, effects after computations, ties by registration order.
    /// A cycle is broken by releasing its earliest-registered member.
    pub fn schedule_order(&self, candidates: &[ActionIdx]) -> Vec<ActionIdx> {
        let mut remaining: Vec<ActionIdx> = candidates.to_vec();
        let mut out = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            // Ready = no incoming edge from another remaining candidate.
            let mut ready: Vec<ActionIdx> = remaining
                .iter()
                .copied()
                .filter(|&idx| {
                    let Some(node) = self.get(idx) else {
                        return true;
                    };
                    !remaining.iter().any(|&other| {
                        other != idx
                            && self
                                .get(other)
                                .map(|o| self.depends(o, node))
                                .unwrap_or(false)
                    })
                })
                .collect();

            if ready.is_empty() {
                // Cycle: release the earliest-registered member.
                let fallback = remaining
                    .iter()
                    .copied()
                    .min_by_key(|&idx| self.get(idx).map(|n| n.order).unwrap_or(u64::MAX));
                match fallback {
                    Some(idx) => ready = vec![idx],
                    None => break,
                }
            }

            ready.sort_by_key(|&idx| {
                self.get(idx)
                    .map(|n| (n.kind == ActionKind::Effect, n.order))
                    .unwrap_or((true, u64::MAX))
            });

            let chosen = ready[0];
            remaining.retain(|&idx| idx != chosen);
            out.push(chosen);
        }

        out
    }
}
