//! Durable per-space fact storage.
//!
//! Storage layout:
//! ```text
//! {base_path}/
//! +-- _heads.json            # "of|the" -> current fact hash
//! +-- facts/
//!     +-- ab/
//!     |   +-- ab12...ef.json # immutable fact record, content-addressed
//!     +-- cd/
//!         +-- ...
//! ```
//!
//! Fact files are immutable once written; all writes go through a temp
//! file followed by an atomic rename.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::reference::Reference;

use super::error::ReplicaError;
use super::fact::Fact;

const FACTS_DIR: &str = "facts";
const HEADS_FILE: &str = "_heads.json";

/// Content-addressed fact files plus a heads index.
pub struct FactStore {
    base_path: PathBuf,
}

impl FactStore {
    /// Open (or create) a store rooted at `base_path`.
    pub fn open(base_path: impl AsRef<Path>) -> Result<Self, ReplicaError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(base_path.join(FACTS_DIR))?;
        Ok(Self { base_path })
    }

    /// Persist a fact, returning its hash. Writing an already-stored fact
    /// is a no-op (content addressing deduplicates).
    pub fn put(&self, fact: &Fact) -> Result<Reference, ReplicaError> {
        let hash = fact.hash();
        let path = self.fact_path(&hash);

        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string(fact)?;
            let temp_path = path.with_extension("tmp");
            fs::write(&temp_path, json)?;
            fs::rename(&temp_path, &path)?;
        }

        Ok(hash)
    }

    /// Load a fact by hash, verifying its content against the name.
    pub fn get(&self, hash: &Reference) -> Result<Fact, ReplicaError> {
        let path = self.fact_path(hash);
        if !path.exists() {
            return Err(ReplicaError::FactNotFound(hash.clone()));
        }
        let json = fs::read_to_string(&path)?;
        let fact: Fact = serde_json::from_str(&json)?;

        let actual = fact.hash();
        if &actual != hash {
            return Err(ReplicaError::HashMismatch {
                expected: hash.clone(),
                actual,
            });
        }
        Ok(fact)
    }

    /// True when a fact with this hash is stored.
    pub fn contains(&self, hash: &Reference) -> bool {
        self.fact_path(hash).exists()
    }

    /// Replace the heads index atomically.
    pub fn write_heads(&self, heads: &HashMap<String, Reference>) -> Result<(), ReplicaError> {
        let path = self.base_path.join(HEADS_FILE);
        let json = serde_json::to_string_pretty(heads)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Read the heads index; empty if none has been written yet.
    pub fn read_heads(&self) -> Result<HashMap<String, Reference>, ReplicaError> {
        let path = self.base_path.join(HEADS_FILE);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn fact_path(&self, hash: &Reference) -> PathBuf {
        let hex = hash.as_str();
        self.base_path
            .join(FACTS_DIR)
            .join(&hex[0..2])
            .join(format!("{}.json", hex))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::EntityId;
    use serde_json::json;
    use tempfile::TempDir;

    fn fact(n: i64) -> Fact {
        Fact::assert(EntityId::of("e"), "application/json", json!({"n": n}))
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::open(dir.path()).unwrap();

        let f = fact(1);
        let hash = store.put(&f).unwrap();
        assert!(store.contains(&hash));
        assert_eq!(store.get(&hash).unwrap(), f);
    }

    #[test]
    fn test_put_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::open(dir.path()).unwrap();

        let f = fact(2);
        let h1 = store.put(&f).unwrap();
        let h2 = store.put(&f).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_get_missing_fact() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::open(dir.path()).unwrap();

        let missing = fact(3).hash();
        assert!(matches!(
            store.get(&missing),
            Err(ReplicaError::FactNotFound(_))
        ));
    }

    #[test]
    fn test_get_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::open(dir.path()).unwrap();

        let f = fact(4);
        let hash = store.put(&f).unwrap();

        // Overwrite the fact file with a different (valid) record.
        let path = store.fact_path(&hash);
        fs::write(&path, serde_json::to_string(&fact(5)).unwrap()).unwrap();

        assert!(matches!(
            store.get(&hash),
            Err(ReplicaError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_heads_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FactStore::open(dir.path()).unwrap();

        assert!(store.read_heads().unwrap().is_empty());

        let mut heads = HashMap::new();
        heads.insert("of:e|application/json".to_string(), fact(1).hash());
        store.write_heads(&heads).unwrap();

        assert_eq!(store.read_heads().unwrap(), heads);
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let f = fact(6);
        let hash = {
            let store = FactStore::open(dir.path()).unwrap();
            store.put(&f).unwrap()
        };
        let store = FactStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&hash).unwrap(), f);
    }
}
