//! Transactions: snapshot-isolated read/write sessions over replicas.
//!
//! A transaction may read from any number of spaces but write to exactly
//! one. Reads cache the first-observed fact per entity (snapshot
//! isolation) and later see the transaction's own staged writes
//! (read-your-writes). Commit submits a claim for every entity read in
//! the write space together with one composed fact per written entity;
//! the replica verifies the claims atomically.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::address::{Address, EntityId, PathSegment, SpaceId, JSON_MEDIA_TYPE};
use crate::attestation::error::AddressError;
use crate::attestation::{apply, resolve, Attestation};
use crate::cfc::{CfcConfig, CfcMode, CfcViolation, Label, TaintContext};
use crate::reference::link::DataUri;
use crate::replica::fact::{Claim, CommitReceipt, Fact};
use crate::storage::StorageManager;

use super::error::{ReadError, TransactionError, WriteError};
use super::journal::{Journal, WriteRecord};

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    /// Accepting reads and writes.
    Ready,

    /// Committed.
    Done,

    /// Aborted, with the reason given.
    Aborted {
        /// Reason passed to `abort`.
        reason: String,
    },
}

impl TxStatus {
    /// True while the transaction accepts operations.
    pub fn is_ready(&self) -> bool {
        matches!(self, TxStatus::Ready)
    }
}

/// Combined status and journal view.
#[derive(Debug)]
pub struct StatusReport<'a> {
    /// Current lifecycle state.
    pub status: &'a TxStatus,

    /// The activity journal so far.
    pub journal: &'a Journal,
}

/// Options for a read: labels the caller derived from the schema at the
/// read position, joined into the transaction taint.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Classification labels encountered at the read position.
    pub labels: Vec<Label>,
}

/// Options for a write: the destination's classification labels.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Labels attached to the destination position.
    pub labels: Vec<Label>,
}

/// Token proving a read space was opened on a transaction.
#[derive(Debug, Clone)]
pub struct Reader {
    space: SpaceId,
}

impl Reader {
    /// The space this reader covers.
    pub fn space(&self) -> &SpaceId {
        &self.space
    }
}

/// Token proving the (single) write space was opened on a transaction.
#[derive(Debug, Clone)]
pub struct Writer {
    space: SpaceId,
}

impl Writer {
    /// The space this writer is bound to.
    pub fn space(&self) -> &SpaceId {
        &self.space
    }
}

/// Hook invoked after a successful commit with the space and its novelty.
pub type CommitHook = Arc<dyn Fn(&SpaceId, &[WriteRecord]) + Send + Sync>;

type SnapKey = (SpaceId, EntityId, String);

/// A snapshot-isolated read/write session.
pub struct Transaction {
    storage: Arc<StorageManager>,
    cfc: CfcConfig,
    status: TxStatus,
    journal: Journal,

    /// First-read fact per entity; also the claim set at commit.
    snapshots: HashMap<SnapKey, Option<Fact>>,

    /// Staged value per written entity (composed over the snapshot).
    overlay: HashMap<SnapKey, Option<Value>>,

    /// Entities in first-write order, for fact composition.
    write_order: Vec<SnapKey>,

    /// The single space writes are allowed against, once locked.
    write_space: Option<SpaceId>,

    taint: TaintContext,
    violations: Vec<CfcViolation>,

    /// Data-URI payloads decoded in this transaction (decoded once each).
    data_cache: HashMap<String, Value>,

    receipt: Option<CommitReceipt>,
    on_commit: Option<CommitHook>,
}

impl Transaction {
    /// Open a transaction over the given storage.
    pub fn new(storage: Arc<StorageManager>, cfc: CfcConfig) -> Self {
        let taint = TaintContext::new(&cfc.lattice);
        Self {
            storage,
            cfc,
            status: TxStatus::Ready,
            journal: Journal::new(),
            snapshots: HashMap::new(),
            overlay: HashMap::new(),
            write_order: Vec::new(),
            write_space: None,
            taint,
            violations: Vec::new(),
            data_cache: HashMap::new(),
            receipt: None,
            on_commit: None,
        }
    }

    /// Install a hook fired once after a successful writing commit.
    pub fn with_commit_hook(mut self, hook: CommitHook) -> Self {
        self.on_commit = Some(hook);
        self
    }

    /// Current status and journal.
    pub fn status(&self) -> StatusReport<'_> {
        StatusReport {
            status: &self.status,
            journal: &self.journal,
        }
    }

    /// The activity journal.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Current taint level.
    pub fn taint(&self) -> &TaintContext {
        &self.taint
    }

    /// Join labels into the taint directly. Schema-directed readers call
    /// this for labels discovered below the position they read.
    pub fn absorb_labels(&mut self, labels: &[Label]) {
        if self.cfc.mode != CfcMode::Disabled {
            let lattice = self.cfc.lattice.clone();
            self.taint.absorb(&lattice, labels.iter());
        }
    }

    /// Violations recorded in dry-run mode.
    pub fn violations(&self) -> &[CfcViolation] {
        &self.violations
    }

    /// Open a reader for a space. Any number of spaces may be read.
    pub fn reader(&mut self, space: &SpaceId) -> Result<Reader, TransactionError> {
        self.ensure_ready()?;
        self.storage.replica(space)?;
        Ok(Reader {
            space: space.clone(),
        })
    }

    /// Open the writer for a space. The first call locks the write space;
    /// later calls for the same space return an equivalent writer, and any
    /// other space fails with a write-isolation error.
    pub fn writer(&mut self, space: &SpaceId) -> Result<Writer, TransactionError> {
        self.ensure_ready()?;
        match &self.write_space {
            None => {
                self.storage.replica(space)?;
                self.write_space = Some(space.clone());
                Ok(Writer {
                    space: space.clone(),
                })
            }
            Some(open) if open == space => Ok(Writer {
                space: space.clone(),
            }),
            Some(open) => Err(TransactionError::WriteIsolation {
                open: open.clone(),
                requested: space.clone(),
            }),
        }
    }

    /// Read the value at an address.
    pub fn read(&mut self, address: &Address, options: ReadOptions) -> Result<Attestation, ReadError> {
        self.ensure_ready()?;
        self.check_media_type(address)?;

        let root = self.current_root(address)?;
        let value = resolve(root.as_ref(), &address.path)?;

        self.journal.record_read(address.clone(), value.clone());
        if self.cfc.mode != CfcMode::Disabled {
            let lattice = self.cfc.lattice.clone();
            self.taint.absorb(&lattice, options.labels.iter());
        }

        Ok(Attestation::new(address.clone(), value))
    }

    /// Stage a write at an address. `None` deletes the final property (or
    /// retracts the fact for a root write).
    pub fn write(
        &mut self,
        address: &Address,
        value: Option<Value>,
        options: WriteOptions,
    ) -> Result<Attestation, WriteError> {
        self.ensure_ready()?;
        self.check_media_type(address)?;
        if address.id.is_data_uri() {
            return Err(TransactionError::ImmutableTarget(address.clone()));
        }

        match &self.write_space {
            None => self.write_space = Some(address.space.clone()),
            Some(open) if open != &address.space => {
                return Err(TransactionError::WriteIsolation {
                    open: open.clone(),
                    requested: address.space.clone(),
                });
            }
            Some(_) => {}
        }

        if self.cfc.mode != CfcMode::Disabled {
            if let Err(violation) =
                self.taint
                    .check_write(&self.cfc.lattice, &options.labels, address)
            {
                match self.cfc.mode {
                    CfcMode::Enforcing => {
                        self.status = TxStatus::Aborted {
                            reason: violation.to_string(),
                        };
                        debug!(address = %address, "aborting on flow violation");
                        return Err(TransactionError::Cfc(violation));
                    }
                    CfcMode::DryRun => {
                        warn!(
                            address = %address,
                            taint = %violation.taint,
                            destination = %violation.destination,
                            "flow violation (dry run)"
                        );
                        self.violations.push(violation);
                    }
                    CfcMode::Disabled => {}
                }
            }
        }

        let key = snap_key(address);
        let base = if address.is_root() {
            // Root writes replace unconditionally; peek the current value
            // for the no-op check without taking a claim.
            match self.overlay.get(&key) {
                Some(staged) => staged.clone(),
                None => {
                    let handle = self.storage.replica(&address.space)?;
                    let replica = handle.read();
                    replica
                        .get(&address.id, &address.the)
                        .and_then(|f| f.is.clone())
                }
            }
        } else {
            self.current_root(address)?
        };

        // Writing the value already present is a no-op.
        let current = resolve(base.as_ref(), &address.path)?;
        if current == value {
            return Ok(Attestation::new(address.clone(), value));
        }

        let next_root = if address.is_root() {
            value.clone()
        } else {
            apply(base, &address.path, value.clone())?
        };

        if !self.overlay.contains_key(&key) {
            self.write_order.push(key.clone());
        }
        self.overlay.insert(key, next_root);
        self.journal.record_write(address.clone(), value.clone());

        Ok(Attestation::new(address.clone(), value))
    }

    /// Write, synthesising missing parent containers when the path does
    /// not exist yet: a segment that parses as an array index creates an
    /// array, any other segment an object.
    pub fn write_value_or_throw(
        &mut self,
        address: &Address,
        value: Value,
    ) -> Result<Attestation, WriteError> {
        match self.write(address, Some(value.clone()), WriteOptions::default()) {
            Err(TransactionError::Address(AddressError::NotFound { prefix })) => {
                let root_present = self.current_root(address)?.is_some();
                if !root_present {
                    // Synthesise the whole chain from the fact root.
                    let mut v = value;
                    for segment in address.path.iter().rev() {
                        v = container_for(segment, v);
                    }
                    let root_addr = Address {
                        space: address.space.clone(),
                        id: address.id.clone(),
                        the: address.the.clone(),
                        path: Vec::new(),
                    };
                    self.write(&root_addr, Some(v), WriteOptions::default())
                } else {
                    // Create containers below the last valid prefix.
                    let remaining = &address.path[prefix.len()..];
                    let mut v = value;
                    for segment in remaining[1..].iter().rev() {
                        v = container_for(segment, v);
                    }
                    let mut target_path = prefix;
                    target_path.push(remaining[0].clone());
                    let target = Address {
                        space: address.space.clone(),
                        id: address.id.clone(),
                        the: address.the.clone(),
                        path: target_path,
                    };
                    self.write(&target, Some(v), WriteOptions::default())
                }
            }
            other => other,
        }
    }

    /// Abort the transaction. Idempotent after termination.
    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.status.is_ready() {
            let reason = reason.into();
            debug!(reason = %reason, "transaction aborted");
            self.status = TxStatus::Aborted { reason };
        }
    }

    /// Commit staged writes.
    ///
    /// Read-only transactions commit without touching the replica. A
    /// repeated commit returns the original receipt; commit after abort
    /// fails with the completion error.
    pub fn commit(&mut self) -> Result<CommitReceipt, TransactionError> {
        match &self.status {
            TxStatus::Ready => {}
            TxStatus::Done => {
                return self
                    .receipt
                    .clone()
                    .ok_or(TransactionError::Complete);
            }
            TxStatus::Aborted { .. } => return Err(TransactionError::Complete),
        }

        let Some(space) = self.write_space.clone().filter(|_| !self.write_order.is_empty())
        else {
            // Nothing staged: equivalent to abort, modulo the journal.
            self.status = TxStatus::Done;
            let receipt = CommitReceipt {
                seq: 0,
                facts: Vec::new(),
            };
            self.receipt = Some(receipt.clone());
            return Ok(receipt);
        };

        let claims = self.build_claims(&space);
        let facts = self.build_facts(&space)?;
        let novelty = self.journal.novelty(&space);

        let handle = self.storage.replica(&space)?;
        let receipt = {
            let mut replica = handle.write();
            replica.apply(&claims, facts)?
        };

        self.status = TxStatus::Done;
        self.receipt = Some(receipt.clone());
        debug!(space = %space, seq = receipt.seq, "transaction committed");

        if let Some(hook) = &self.on_commit {
            hook(&space, &novelty);
        }

        Ok(receipt)
    }

    // === Internals ===

    fn ensure_ready(&self) -> Result<(), TransactionError> {
        if self.status.is_ready() {
            Ok(())
        } else {
            Err(TransactionError::Complete)
        }
    }

    fn check_media_type(&self, address: &Address) -> Result<(), TransactionError> {
        if address.the == JSON_MEDIA_TYPE {
            Ok(())
        } else {
            Err(TransactionError::Address(AddressError::UnsupportedMediaType {
                expected: JSON_MEDIA_TYPE.to_string(),
                actual: address.the.clone(),
            }))
        }
    }

    /// The root value this transaction sees for an address's entity:
    /// staged overlay first, then the snapshot (claimed on first read).
    fn current_root(&mut self, address: &Address) -> Result<Option<Value>, TransactionError> {
        if address.id.is_data_uri() {
            let uri = address.id.as_str().to_string();
            if let Some(decoded) = self.data_cache.get(&uri) {
                return Ok(Some(decoded.clone()));
            }
            let decoded = DataUri::parse(&uri)?.json(&address.the)?;
            self.data_cache.insert(uri, decoded.clone());
            return Ok(Some(decoded));
        }

        let key = snap_key(address);
        if let Some(staged) = self.overlay.get(&key) {
            return Ok(staged.clone());
        }
        if let Some(fact) = self.snapshots.get(&key) {
            return Ok(fact.as_ref().and_then(|f| f.is.clone()));
        }

        let handle = self.storage.replica(&address.space)?;
        let fact = {
            let replica = handle.read();
            replica.get(&address.id, &address.the).cloned()
        };
        let value = fact.as_ref().and_then(|f| f.is.clone());
        self.snapshots.insert(key, fact);
        Ok(value)
    }

    fn build_claims(&self, space: &SpaceId) -> Vec<Claim> {
        let mut claims: Vec<Claim> = self
            .snapshots
            .iter()
            .filter(|((s, _, _), _)| s == space)
            .map(|((_, of, the), fact)| {
                Claim::new(of.clone(), the.clone(), fact.as_ref().map(Fact::hash))
            })
            .collect();
        claims.sort_by(|a, b| (&a.of, &a.the).cmp(&(&b.of, &b.the)));
        claims
    }

    fn build_facts(&self, space: &SpaceId) -> Result<Vec<Fact>, TransactionError> {
        let mut facts = Vec::with_capacity(self.write_order.len());
        for key in &self.write_order {
            let (_, of, the) = key;
            let Some(composed) = self.overlay.get(key) else {
                continue;
            };

            let cause = match self.snapshots.get(key) {
                Some(fact) => fact.as_ref().map(Fact::hash),
                None => {
                    // Blind root write: chain onto whatever is current
                    // without claiming it (last writer wins).
                    let handle = self.storage.replica(space)?;
                    let replica = handle.read();
                    replica.state_hash(of, the)
                }
            };

            let mut fact = match composed {
                Some(value) => Fact::assert(of.clone(), the.clone(), value.clone()),
                None => Fact::retract(of.clone(), the.clone()),
            };
            if let Some(cause) = cause {
                fact = fact.caused_by(cause);
            }
            facts.push(fact);
        }
        Ok(facts)
    }
}

fn snap_key(address: &Address) -> SnapKey {
    (
        address.space.clone(),
        address.id.clone(),
        address.the.clone(),
    )
}

/// Build the container implied by a path segment, holding `inner` at that
/// segment's position.
fn container_for(segment: &PathSegment, inner: Value) -> Value {
    match segment.as_index() {
        Some(i) => {
            let mut items = vec![Value::Null; i];
            items.push(inner);
            Value::Array(items)
        }
        None => {
            let mut map = Map::new();
            map.insert(segment.to_string(), inner);
            Value::Object(map)
        }
    }
}
