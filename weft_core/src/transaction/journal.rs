//! Transaction activity journal.
//!
//! Every read and write a transaction performs lands here in program
//! order. The journal is sufficient to reconstruct what the transaction
//! observed (*history*) and what it introduced (*novelty*).

use serde_json::Value;

use crate::address::{Address, EntityId, SpaceId};

/// One journal entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Activity {
    /// A read and the value it resolved to.
    Read {
        /// Address read.
        address: Address,
        /// Value observed (`None` = absent).
        value: Option<Value>,
    },

    /// A write and the value it staged.
    Write {
        /// Address written.
        address: Address,
        /// Value staged (`None` = delete/retract).
        value: Option<Value>,
    },
}

impl Activity {
    /// The address this entry touches.
    pub fn address(&self) -> &Address {
        match self {
            Activity::Read { address, .. } | Activity::Write { address, .. } => address,
        }
    }

    /// True for write entries.
    pub fn is_write(&self) -> bool {
        matches!(self, Activity::Write { .. })
    }
}

/// A write extracted from the journal.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Address written.
    pub address: Address,
    /// Value staged.
    pub value: Option<Value>,
}

/// A read extracted from the journal.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRecord {
    /// Address read.
    pub address: Address,
    /// Value observed.
    pub value: Option<Value>,
}

/// Ordered log of a transaction's reads and writes.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<Activity>,
}

impl Journal {
    /// Empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a read entry.
    pub fn record_read(&mut self, address: Address, value: Option<Value>) {
        self.entries.push(Activity::Read { address, value });
    }

    /// Append a write entry.
    pub fn record_write(&mut self, address: Address, value: Option<Value>) {
        self.entries.push(Activity::Write { address, value });
    }

    /// The full activity log in program order.
    pub fn activity(&self) -> &[Activity] {
        &self.entries
    }

    /// Writes made in this transaction against `space`, in program order.
    pub fn novelty(&self, space: &SpaceId) -> Vec<WriteRecord> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                Activity::Write { address, value } if &address.space == space => {
                    Some(WriteRecord {
                        address: address.clone(),
                        value: value.clone(),
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Reads observed against `space`, in program order.
    pub fn history(&self, space: &SpaceId) -> Vec<ReadRecord> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                Activity::Read { address, value } if &address.space == space => Some(ReadRecord {
                    address: address.clone(),
                    value: value.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Entities written in `space`, deduplicated, in first-write order.
    /// This is the order commit composes facts in.
    pub fn written_entities(&self, space: &SpaceId) -> Vec<(EntityId, String)> {
        let mut seen = Vec::new();
        for entry in &self.entries {
            if let Activity::Write { address, .. } = entry {
                if &address.space != space {
                    continue;
                }
                let key = address.entity_key();
                if !seen.contains(&key) {
                    seen.push(key);
                }
            }
        }
        seen
    }

    /// True when no writes have been journaled at all.
    pub fn is_read_only(&self) -> bool {
        !self.entries.iter().any(Activity::is_write)
    }
}
