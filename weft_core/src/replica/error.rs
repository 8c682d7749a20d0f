//! Error types for the replica layer.

use thiserror::Error;

use crate::address::{EntityId, SpaceId};
use crate::reference::Reference;

use super::fact::Fact;

/// One diverging entity discovered while verifying commit claims.
#[derive(Debug, Clone)]
pub struct ConflictEntry {
    /// Entity whose observed state no longer matches.
    pub of: EntityId,

    /// Media type of the diverging fact.
    pub the: String,

    /// Hash the committing transaction claimed to have observed.
    pub expected: Option<Reference>,

    /// Fact actually current in the replica (`None` if unclaimed).
    pub actual: Option<Fact>,
}

/// Optimistic-commit failure: one or more claims diverged from the
/// replica's current state. The whole batch is rejected.
#[derive(Debug, Clone, Error)]
#[error("commit conflict in {space}: {} diverging entities", conflicts.len())]
pub struct ConflictError {
    /// Space the commit targeted.
    pub space: SpaceId,

    /// Every claim that failed verification.
    pub conflicts: Vec<ConflictEntry>,
}

impl ConflictError {
    /// True when `of` is among the diverging entities.
    pub fn involves(&self, of: &EntityId) -> bool {
        self.conflicts.iter().any(|c| &c.of == of)
    }
}

/// Errors from replica operations.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// I/O error from the durable store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Fact (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored fact's bytes do not hash to its file name.
    #[error("integrity error: fact {expected} hashed to {actual}")]
    HashMismatch {
        /// Hash the file name promised.
        expected: Reference,
        /// Hash actually computed from the bytes.
        actual: Reference,
    },

    /// Requested fact is not in the store.
    #[error("fact not found: {0}")]
    FactNotFound(Reference),

    /// Claim verification failed.
    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_error_display_and_involves() {
        let err = ConflictError {
            space: SpaceId::new("s"),
            conflicts: vec![ConflictEntry {
                of: EntityId::of("e"),
                the: "application/json".to_string(),
                expected: None,
                actual: None,
            }],
        };
        assert!(err.to_string().contains("1 diverging"));
        assert!(err.involves(&EntityId::of("e")));
        assert!(!err.involves(&EntityId::of("other")));
    }

    #[test]
    fn test_replica_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ReplicaError = io.into();
        assert!(matches!(err, ReplicaError::Io(_)));
    }
}
