//! weft_core: a reactive computation runtime over a content-addressed,
//! schema-aware, transactional memory layer.
//!
//! The crate is organised bottom-up:
//!
//! - [`reference`] — canonical BLAKE3 content hashes and link sigils;
//! - [`address`] / [`attestation`] — addresses, path reads/writes, and
//!   the attestations transactions claim;
//! - [`replica`] / [`storage`] — per-space fact stores with a pending
//!   overlay, optimistic claim checking, and durable backing;
//! - [`transaction`] — journaled snapshot-isolated sessions with
//!   compare-and-commit and conflict retry;
//! - [`changes`] — normalise-and-diff change sets with compaction;
//! - [`schema`] / [`cfc`] — the JSON-schema subset and the
//!   classification lattice it carries;
//! - [`traverse`] — schema-directed materialisation of composed values;
//! - [`scheduler`] — dirty propagation over an inferred action graph;
//! - [`runtime`] — the cell/pattern façade tying it all together.

pub mod address;
pub mod attestation;
pub mod cfc;
pub mod changes;
pub mod reference;
pub mod replica;
pub mod runtime;
pub mod scheduler;
pub mod schema;
pub mod storage;
pub mod transaction;
pub mod traverse;

pub use address::{Address, EntityId, PathSegment, SpaceId, JSON_MEDIA_TYPE};
pub use attestation::error::AddressError;
pub use attestation::Attestation;
pub use cfc::{CfcConfig, CfcMode, CfcViolation, Label, Lattice};
pub use changes::{compact, diff_changes, ChangeRecord};
pub use reference::link::{are_links_same, parse_link, Link};
pub use reference::{normalize, refer, Reference};
pub use replica::error::{ConflictError, ReplicaError};
pub use replica::fact::{Claim, CommitReceipt, Fact};
pub use replica::{EntityState, SpaceReplica};
pub use runtime::{Cell, CellCause, Evaluator, Pattern, PatternFile, Runtime, SinkHandle, TxCell};
pub use scheduler::{ActionId, ActionKind, RangeClaim, Scheduler, Timing};
pub use schema::{Schema, SchemaNode};
pub use storage::StorageManager;
pub use transaction::{
    edit_with_retry, ReadOptions, Transaction, TransactionError, TxStatus, WriteOptions,
    DEFAULT_MAX_RETRIES,
};
pub use traverse::{Traversal, Traverser, View};
