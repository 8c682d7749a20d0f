//! Storage manager: owns the replicas of every space a runtime touches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::address::SpaceId;
use crate::replica::error::ReplicaError;
use crate::replica::SpaceReplica;

/// Shared handle to one space's replica.
pub type ReplicaHandle = Arc<RwLock<SpaceReplica>>;

/// Opens and caches replicas. With a base path, each space persists under
/// its own subdirectory; without one, replicas are purely in-memory.
///
/// Replicas are not shared between managers, but two managers opened on
/// the same directory share the durable fact files underneath.
pub struct StorageManager {
    base_path: Option<PathBuf>,
    replicas: RwLock<HashMap<SpaceId, ReplicaHandle>>,
}

impl StorageManager {
    /// Manager with no durable backing.
    pub fn ephemeral() -> Self {
        Self {
            base_path: None,
            replicas: RwLock::new(HashMap::new()),
        }
    }

    /// Manager persisting each space under `base_path`.
    pub fn open(base_path: impl AsRef<Path>) -> Result<Self, ReplicaError> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path: Some(base_path),
            replicas: RwLock::new(HashMap::new()),
        })
    }

    /// True when this manager persists to disk.
    pub fn is_durable(&self) -> bool {
        self.base_path.is_some()
    }

    /// The replica for `space`, opening it on first use.
    pub fn replica(&self, space: &SpaceId) -> Result<ReplicaHandle, ReplicaError> {
        if let Some(handle) = self.replicas.read().get(space) {
            return Ok(handle.clone());
        }

        let mut replicas = self.replicas.write();
        // Double-checked: another caller may have opened it meanwhile.
        if let Some(handle) = replicas.get(space) {
            return Ok(handle.clone());
        }

        let replica = match &self.base_path {
            Some(base) => SpaceReplica::open(space.clone(), base.join(space_dir(space)))?,
            None => SpaceReplica::ephemeral(space.clone()),
        };
        let handle = Arc::new(RwLock::new(replica));
        replicas.insert(space.clone(), handle.clone());
        Ok(handle)
    }

    /// Spaces with an open replica.
    pub fn open_spaces(&self) -> Vec<SpaceId> {
        self.replicas.read().keys().cloned().collect()
    }
}

/// Directory name for a space: identifiers may contain path separators.
fn space_dir(space: &SpaceId) -> String {
    space.as_str().replace(['/', '\\'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{EntityId, JSON_MEDIA_TYPE};
    use crate::replica::fact::Fact;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_replica_is_cached() {
        let manager = StorageManager::ephemeral();
        let space = SpaceId::new("s");
        let a = manager.replica(&space).unwrap();
        let b = manager.replica(&space).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.open_spaces(), vec![space]);
    }

    #[test]
    fn test_durable_roundtrip_across_managers() {
        let dir = TempDir::new().unwrap();
        let space = SpaceId::new("did:key:home");
        let fact = Fact::assert(EntityId::of("e"), JSON_MEDIA_TYPE, json!(1));

        {
            let manager = StorageManager::open(dir.path()).unwrap();
            let replica = manager.replica(&space).unwrap();
            replica.write().apply(&[], vec![fact.clone()]).unwrap();
        }

        let manager = StorageManager::open(dir.path()).unwrap();
        let replica = manager.replica(&space).unwrap();
        let guard = replica.read();
        assert_eq!(guard.get(&EntityId::of("e"), JSON_MEDIA_TYPE), Some(&fact));
    }

    #[test]
    fn test_space_dir_sanitised() {
        assert_eq!(space_dir(&SpaceId::new("did:key:a/b")), "did:key:a_b");
    }
}
