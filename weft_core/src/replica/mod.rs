//! Per-space fact replica.
//!
//! A replica holds two layers: *confirmed* facts (acknowledged by the
//! remote provider, or loaded from the durable store at startup) and a
//! *pending* overlay of locally committed facts. Queries read pending
//! first. Commits go through [`SpaceReplica::apply`], which verifies every
//! read claim against the composed view before writing anything — the
//! optimistic-concurrency gate the transaction engine relies on.

pub mod error;
pub mod fact;
pub mod store;

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;
use uuid::Uuid;

use crate::address::{EntityId, SpaceId};
use crate::reference::Reference;

use error::{ConflictEntry, ConflictError, ReplicaError};
use fact::{Claim, CommitReceipt, Fact};
use store::FactStore;

/// Replica key: one entity/media-type pair.
pub type EntityKey = (EntityId, String);

/// Predicate deciding which facts a subscriber cares about.
pub type SubscriptionFilter = Box<dyn Fn(&Fact) -> bool + Send + Sync>;

/// Callback invoked with each newly applied fact.
pub type SubscriptionCallback = Box<dyn FnMut(&Fact) + Send + Sync>;

struct Subscriber {
    id: Uuid,
    filter: SubscriptionFilter,
    callback: SubscriptionCallback,
}

/// Handle for cancelling a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(Uuid);

/// The fact store for one space.
pub struct SpaceReplica {
    space: SpaceId,

    /// Server-acknowledged (or durably loaded) facts.
    confirmed: HashMap<EntityKey, Fact>,

    /// Locally committed facts not yet confirmed. Read before `confirmed`.
    pending: HashMap<EntityKey, Fact>,

    /// Append-only hash chains per entity, newest last.
    history: HashMap<EntityKey, Vec<Reference>>,

    /// Total order of commits applied to this replica.
    commit_seq: u64,

    subscribers: Vec<Subscriber>,

    store: Option<FactStore>,
}

impl SpaceReplica {
    /// In-memory replica with no durable backing.
    pub fn ephemeral(space: SpaceId) -> Self {
        Self {
            space,
            confirmed: HashMap::new(),
            pending: HashMap::new(),
            history: HashMap::new(),
            commit_seq: 0,
            subscribers: Vec::new(),
            store: None,
        }
    }

    /// Open a replica backed by a durable store, loading current heads
    /// into the confirmed layer.
    pub fn open(space: SpaceId, base_path: impl AsRef<Path>) -> Result<Self, ReplicaError> {
        let store = FactStore::open(base_path)?;
        let mut confirmed = HashMap::new();
        let mut history = HashMap::new();

        for (key, hash) in store.read_heads()? {
            let fact = store.get(&hash)?;
            let entity_key = (fact.of.clone(), fact.the.clone());
            debug_assert_eq!(head_key(&entity_key.0, &entity_key.1), key);
            history.insert(entity_key.clone(), vec![hash]);
            confirmed.insert(entity_key, fact);
        }

        Ok(Self {
            space,
            confirmed,
            pending: HashMap::new(),
            history,
            commit_seq: 0,
            subscribers: Vec::new(),
            store: Some(store),
        })
    }

    /// The space this replica belongs to.
    pub fn space(&self) -> &SpaceId {
        &self.space
    }

    /// Current fact for `(of, the)` through the composed view. `None`
    /// means unclaimed; a retraction is a present fact with no value.
    pub fn get(&self, of: &EntityId, the: &str) -> Option<&Fact> {
        let key = (of.clone(), the.to_string());
        self.pending.get(&key).or_else(|| self.confirmed.get(&key))
    }

    /// Hash of the current fact, or `None` for unclaimed.
    pub fn state_hash(&self, of: &EntityId, the: &str) -> Option<Reference> {
        self.get(of, the).map(Fact::hash)
    }

    /// Hash chain for an entity, oldest first.
    pub fn history(&self, of: &EntityId, the: &str) -> &[Reference] {
        self.history
            .get(&(of.clone(), the.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of commits applied.
    pub fn commit_seq(&self) -> u64 {
        self.commit_seq
    }

    /// Verify `claims` against the composed view, then apply `facts`.
    ///
    /// All-or-nothing: if any claim diverges the whole batch is rejected
    /// and nothing is written. On success the new facts land in the
    /// pending layer (and the durable store, if present) and subscribers
    /// are notified.
    pub fn apply(
        &mut self,
        claims: &[Claim],
        facts: Vec<Fact>,
    ) -> Result<CommitReceipt, ConflictError> {
        let mut conflicts = Vec::new();
        for claim in claims {
            let actual = self.state_hash(&claim.of, &claim.the);
            if actual != claim.expected {
                conflicts.push(ConflictEntry {
                    of: claim.of.clone(),
                    the: claim.the.clone(),
                    expected: claim.expected.clone(),
                    actual: self.get(&claim.of, &claim.the).cloned(),
                });
            }
        }
        if !conflicts.is_empty() {
            debug!(
                space = %self.space,
                conflicts = conflicts.len(),
                "rejecting commit: claims diverged"
            );
            return Err(ConflictError {
                space: self.space.clone(),
                conflicts,
            });
        }

        let mut written = Vec::with_capacity(facts.len());
        for fact in &facts {
            let hash = fact.hash();
            let key = (fact.of.clone(), fact.the.clone());

            if let Some(store) = &self.store {
                // Durability failures surface as a conflict-free panic-less
                // degrade: the commit still applies in memory.
                if let Err(e) = store.put(fact) {
                    tracing::warn!(space = %self.space, error = %e, "fact persistence failed");
                }
            }

            self.history.entry(key.clone()).or_default().push(hash.clone());
            self.pending.insert(key, fact.clone());
            written.push(hash);
        }

        if let Some(store) = &self.store {
            let heads: HashMap<String, Reference> = self
                .heads()
                .map(|(key, fact)| (head_key(&key.0, &key.1), fact.hash()))
                .collect();
            if let Err(e) = store.write_heads(&heads) {
                tracing::warn!(space = %self.space, error = %e, "heads persistence failed");
            }
        }

        self.commit_seq += 1;
        let receipt = CommitReceipt {
            seq: self.commit_seq,
            facts: written,
        };

        debug!(
            space = %self.space,
            seq = receipt.seq,
            facts = facts.len(),
            "commit applied"
        );

        for fact in &facts {
            for sub in &mut self.subscribers {
                if (sub.filter)(fact) {
                    (sub.callback)(fact);
                }
            }
        }

        Ok(receipt)
    }

    /// Acknowledge a pending fact as durable upstream, moving it to the
    /// confirmed layer. A stale hash (the entity moved on locally) leaves
    /// the pending layer untouched but still records the confirmation.
    pub fn confirm(&mut self, of: &EntityId, the: &str, hash: &Reference) {
        let key = (of.clone(), the.to_string());
        if let Some(fact) = self.pending.remove(&key) {
            if &fact.hash() == hash {
                self.confirmed.insert(key, fact);
                return;
            }
            // Not the confirmed one: keep it pending.
            self.pending.insert(key.clone(), fact);
        }
        // Confirmation for an older fact: record it as the confirmed base
        // if we can recover it from the store.
        if let Some(store) = &self.store {
            if let Ok(fact) = store.get(hash) {
                self.confirmed.insert(key, fact);
            }
        }
    }

    /// Register a change subscriber. The filter decides which facts are
    /// delivered; the callback observes each applied fact matching it.
    pub fn subscribe(
        &mut self,
        filter: SubscriptionFilter,
        callback: SubscriptionCallback,
    ) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.subscribers.push(Subscriber {
            id,
            filter,
            callback,
        });
        SubscriptionId(id)
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.retain(|s| s.id != id.0);
    }

    /// Iterate the composed view (pending over confirmed).
    pub fn heads(&self) -> impl Iterator<Item = (&EntityKey, &Fact)> {
        self.confirmed
            .iter()
            .filter(|(key, _)| !self.pending.contains_key(*key))
            .chain(self.pending.iter())
    }

    /// Query the current state of a set of entities: value, chain
    /// position, and hash. Unclaimed entities are omitted from the
    /// result.
    pub fn select(&self, entities: &[EntityKey]) -> HashMap<EntityKey, EntityState> {
        let mut out = HashMap::new();
        for key in entities {
            let (of, the) = key;
            if let Some(fact) = self.get(of, the) {
                out.insert(
                    key.clone(),
                    EntityState {
                        value: fact.is.clone(),
                        version: self.history(of, the).len() as u64,
                        hash: fact.hash(),
                    },
                );
            }
        }
        out
    }
}

/// One entity's state as returned by [`SpaceReplica::select`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    /// Current value; `None` for a retraction.
    pub value: Option<serde_json::Value>,

    /// Position in the entity's history chain (1 = first fact).
    pub version: u64,

    /// Hash of the current fact.
    pub hash: Reference,
}

fn head_key(of: &EntityId, the: &str) -> String {
    format!("{}|{}", of, the)
}
