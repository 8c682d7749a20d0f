//! Error types for the transaction engine.

use thiserror::Error;

use crate::address::{Address, SpaceId};
use crate::attestation::error::AddressError;
use crate::cfc::CfcViolation;
use crate::replica::error::{ConflictError, ReplicaError};

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Address resolution failure (not found, type mismatch, bad data URI,
    /// wrong media type).
    #[error(transparent)]
    Address(#[from] AddressError),

    /// Optimistic commit failed: claims diverged from the replica.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Replica or durable-store failure.
    #[error(transparent)]
    Storage(#[from] ReplicaError),

    /// A second write space was requested on a transaction that already
    /// holds a writer.
    #[error("write isolation: writer already open for {open}, requested {requested}")]
    WriteIsolation {
        /// Space the writer is bound to.
        open: SpaceId,
        /// Space the rejected call asked for.
        requested: SpaceId,
    },

    /// Operation on a transaction that already committed or aborted.
    #[error("transaction is complete")]
    Complete,

    /// The transaction was aborted.
    #[error("transaction aborted: {reason}")]
    Aborted {
        /// Reason given at abort time.
        reason: String,
    },

    /// Flow-control violation in enforcing mode.
    #[error(transparent)]
    Cfc(#[from] CfcViolation),

    /// Write attempted through an immutable data-URI target.
    #[error("cannot write through immutable data: {0}")]
    ImmutableTarget(Address),
}

impl TransactionError {
    /// True when this error reports an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TransactionError::Conflict(_) | TransactionError::Storage(ReplicaError::Conflict(_))
        )
    }

    /// True when re-running the transaction body may succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_conflict() || matches!(self, TransactionError::Aborted { .. })
    }
}

/// Result error type for reads.
pub type ReadError = TransactionError;

/// Result error type for writes.
pub type WriteError = TransactionError;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::EntityId;

    #[test]
    fn test_is_conflict() {
        let conflict = ConflictError {
            space: SpaceId::new("s"),
            conflicts: vec![],
        };
        assert!(TransactionError::Conflict(conflict.clone()).is_conflict());
        assert!(TransactionError::Storage(ReplicaError::Conflict(conflict)).is_conflict());
        assert!(!TransactionError::Complete.is_conflict());
    }

    #[test]
    fn test_is_retryable() {
        assert!(TransactionError::Aborted {
            reason: "user".to_string()
        }
        .is_retryable());
        assert!(!TransactionError::Complete.is_retryable());
        assert!(!TransactionError::WriteIsolation {
            open: SpaceId::new("a"),
            requested: SpaceId::new("b"),
        }
        .is_retryable());
    }

    #[test]
    fn test_write_isolation_display() {
        let err = TransactionError::WriteIsolation {
            open: SpaceId::new("a"),
            requested: SpaceId::new("b"),
        };
        let msg = err.to_string();
        assert!(msg.contains('a'));
        assert!(msg.contains('b'));
    }

    #[test]
    fn test_address_error_converts() {
        let err: TransactionError = AddressError::NotFound { prefix: vec![] }.into();
        assert!(matches!(err, TransactionError::Address(_)));
        let _ = EntityId::of("unused");
    }
}
