//! Contextual flow control: classification labels and taint tracking.
//!
//! Labels form a join-semilattice with a designated bottom. Schemas attach
//! labels through their `ifc` annotation; reads join encountered labels
//! into the transaction's taint, and writes are checked against the
//! destination's label. The runtime runs in one of three modes: checks
//! off, computed-but-not-enforced, or enforcing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Address;

/// One element of the classification lattice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    /// Create a label by name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The label name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Label {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A finite join-semilattice of labels with a unique bottom.
///
/// Construction takes the covering edges (`lower`, `upper`); `leq` is
/// upward reachability and `join` the least common upper bound. Labels
/// not in the lattice are incomparable to everything but themselves.
#[derive(Debug, Clone)]
pub struct Lattice {
    bottom: Label,
    /// Direct superiors per label.
    ups: HashMap<Label, Vec<Label>>,
    members: HashSet<Label>,
}

impl Lattice {
    /// Build a lattice from its bottom and covering edges.
    pub fn new(bottom: Label, edges: &[(Label, Label)]) -> Self {
        let mut ups: HashMap<Label, Vec<Label>> = HashMap::new();
        let mut members = HashSet::new();
        members.insert(bottom.clone());
        for (lower, upper) in edges {
            members.insert(lower.clone());
            members.insert(upper.clone());
            ups.entry(lower.clone()).or_default().push(upper.clone());
        }
        Self {
            bottom,
            ups,
            members,
        }
    }

    /// The four-level reference chain:
    /// `unclassified ≤ confidential ≤ secret ≤ topsecret`.
    pub fn reference() -> Self {
        let chain = ["unclassified", "confidential", "secret", "topsecret"];
        let edges: Vec<(Label, Label)> = chain
            .windows(2)
            .map(|w| (Label::new(w[0]), Label::new(w[1])))
            .collect();
        Self::new(Label::new(chain[0]), &edges)
    }

    /// The designated bottom element.
    pub fn bottom(&self) -> &Label {
        &self.bottom
    }

    /// True when `label` is an element of this lattice.
    pub fn contains(&self, label: &Label) -> bool {
        self.members.contains(label)
    }

    /// Reachability test: is `a ≤ b`?
    pub fn leq(&self, a: &Label, b: &Label) -> bool {
        if a == b {
            return true;
        }
        if a == &self.bottom {
            return self.members.contains(b);
        }
        self.upper_set(a).contains(b)
    }

    /// All labels reachable upward from `label`, itself included.
    fn upper_set(&self, label: &Label) -> HashSet<Label> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        seen.insert(label.clone());
        queue.push_back(label.clone());
        while let Some(current) = queue.pop_front() {
            if let Some(ups) = self.ups.get(&current) {
                for up in ups {
                    if seen.insert(up.clone()) {
                        queue.push_back(up.clone());
                    }
                }
            }
        }
        seen
    }

    /// Least upper bound of two labels.
    ///
    /// Returns `None` when either label is unknown to the lattice. When
    /// the configured order admits several minimal upper bounds (it is
    /// then not a true semilattice), the lexicographically smallest is
    /// chosen so the result stays deterministic.
    pub fn join(&self, a: &Label, b: &Label) -> Option<Label> {
        if !self.contains(a) || !self.contains(b) {
            return None;
        }
        if self.leq(a, b) {
            return Some(b.clone());
        }
        if self.leq(b, a) {
            return Some(a.clone());
        }
        let uppers_a = self.upper_set(a);
        let uppers_b = self.upper_set(b);
        let common: Vec<Label> = uppers_a.intersection(&uppers_b).cloned().collect();
        let mut minimal: Vec<Label> = common
            .iter()
            .filter(|c| !common.iter().any(|d| d != *c && self.leq(d, c)))
            .cloned()
            .collect();
        minimal.sort();
        minimal.into_iter().next()
    }

    /// Fold `join` over a set of labels, starting from bottom. Unknown
    /// labels are skipped.
    pub fn join_all<'a>(&self, labels: impl IntoIterator<Item = &'a Label>) -> Label {
        let mut acc = self.bottom.clone();
        for label in labels {
            if let Some(joined) = self.join(&acc, label) {
                acc = joined;
            }
        }
        acc
    }
}

/// Runtime enforcement mode for flow checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CfcMode {
    /// No label propagation or checks.
    #[default]
    Disabled,

    /// Checks are computed and recorded but never enforced.
    DryRun,

    /// Violations abort the transaction.
    Enforcing,
}

/// Mode plus lattice, shared across a runtime.
#[derive(Debug, Clone)]
pub struct CfcConfig {
    /// Enforcement mode.
    pub mode: CfcMode,

    /// The classification lattice in force.
    pub lattice: Arc<Lattice>,
}

impl Default for CfcConfig {
    fn default() -> Self {
        Self {
            mode: CfcMode::Disabled,
            lattice: Arc::new(Lattice::reference()),
        }
    }
}

impl CfcConfig {
    /// A config in the given mode over the reference lattice.
    pub fn with_mode(mode: CfcMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Per-transaction taint: the join of every label reached via reads.
#[derive(Debug, Clone)]
pub struct TaintContext {
    level: Label,
}

impl TaintContext {
    /// Fresh taint at the lattice bottom.
    pub fn new(lattice: &Lattice) -> Self {
        Self {
            level: lattice.bottom().clone(),
        }
    }

    /// Current taint level.
    pub fn level(&self) -> &Label {
        &self.level
    }

    /// Join the given labels into the taint.
    pub fn absorb<'a>(&mut self, lattice: &Lattice, labels: impl IntoIterator<Item = &'a Label>) {
        for label in labels {
            if let Some(joined) = lattice.join(&self.level, label) {
                self.level = joined;
            }
        }
    }

    /// Check a write against the destination's label (the join of the
    /// labels attached to the destination position). Returns the
    /// violation if the taint may not flow there.
    pub fn check_write(
        &self,
        lattice: &Lattice,
        destination: &[Label],
        address: &Address,
    ) -> Result<(), CfcViolation> {
        let dest_level = lattice.join_all(destination);
        if lattice.leq(&self.level, &dest_level) {
            Ok(())
        } else {
            Err(CfcViolation {
                taint: self.level.clone(),
                destination: dest_level,
                address: address.clone(),
            })
        }
    }
}

/// A write whose destination label cannot absorb the transaction taint.
#[derive(Debug, Clone, Error)]
#[error("flow violation at {address}: taint `{taint}` exceeds destination `{destination}`")]
pub struct CfcViolation {
    /// Taint level at the time of the write.
    pub taint: Label,

    /// Effective label of the destination.
    pub destination: Label,

    /// Where the write was attempted.
    pub address: Address,
}
