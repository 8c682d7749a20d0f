//! Facts: the canonical value of an entity at a moment.
//!
//! A fact asserts (or retracts) the value of `(of, the)` and chains to its
//! predecessor through `cause`, forming a per-entity history. The fact's
//! identity is the content hash of its canonical wire form.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::EntityId;
use crate::reference::{refer, Reference};

/// Canonical fact record. Wire form is `{the, of, is?, cause?}`; a fact
/// with no `is` is a retraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Media type of the value.
    pub the: String,

    /// Entity this fact is about.
    pub of: EntityId,

    /// Asserted value; absent for retractions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is: Option<Value>,

    /// Hash of the prior fact in this entity's chain; absent for the first
    /// fact of a chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Reference>,
}

impl Fact {
    /// Assert a value with no prior.
    pub fn assert(of: EntityId, the: impl Into<String>, is: Value) -> Self {
        Self {
            the: the.into(),
            of,
            is: Some(is),
            cause: None,
        }
    }

    /// Retract the entity's value.
    pub fn retract(of: EntityId, the: impl Into<String>) -> Self {
        Self {
            the: the.into(),
            of,
            is: None,
            cause: None,
        }
    }

    /// Chain this fact onto a predecessor.
    pub fn caused_by(mut self, cause: Reference) -> Self {
        self.cause = Some(cause);
        self
    }

    /// True when this fact retracts rather than asserts.
    pub fn is_retraction(&self) -> bool {
        self.is.is_none()
    }

    /// Content hash of the canonical wire form. Stable under key order and
    /// independent of how the fact was constructed.
    pub fn hash(&self) -> Reference {
        let wire = serde_json::to_value(self).unwrap_or(Value::Null);
        refer(&wire)
    }
}

/// A read claim submitted at commit: the observed state of one entity.
/// `expected: None` claims the entity was unclaimed (no fact at all).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Entity the claim covers.
    pub of: EntityId,

    /// Media type read.
    pub the: String,

    /// Hash observed at read time, or `None` for unclaimed.
    pub expected: Option<Reference>,
}

impl Claim {
    /// Claim that `(of, the)` was observed at `expected`.
    pub fn new(of: EntityId, the: impl Into<String>, expected: Option<Reference>) -> Self {
        Self {
            of,
            the: the.into(),
            expected,
        }
    }
}

/// Receipt for a successfully applied commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    /// Position in the space's commit sequence.
    pub seq: u64,

    /// Hashes of the facts written, in submission order.
    pub facts: Vec<Reference>,
}
