use dashmap::DashMap;
use std::path::Path;
use tracing::{debug, info};

use super::tracker::ProgressSnapshot;
use crate::core::errors::{OrchestratorError, Result};

const SNAPSHOT_TREE: &str = "progress_snapshots";

/// Append-or-replace persistence of snapshots keyed by run id
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &ProgressSnapshot) -> Result<()>;
    fn load(&self, run_id: &str) -> Result<Option<ProgressSnapshot>>;
    fn run_ids(&self) -> Result<Vec<String>>;
}

/// In-process store
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: DashMap<String, ProgressSnapshot>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        self.snapshots
            .insert(snapshot.run_id.clone(), snapshot.clone());
        Ok(())
    }

    fn load(&self, run_id: &str) -> Result<Option<ProgressSnapshot>> {
        Ok(self.snapshots.get(run_id).map(|s| s.clone()))
    }

    fn run_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.snapshots.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// Sled-backed store; snapshots are JSON compressed with zstd
pub struct SledSnapshotStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledSnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| {
            OrchestratorError::database(format!("open snapshot db {}", path.display()), e)
        })?;
        let tree = db.open_tree(SNAPSHOT_TREE)?;
        info!(path = %path.display(), "Opened snapshot store");
        Ok(Self { db, tree })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl SnapshotStore for SledSnapshotStore {
    fn save(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        let serialized = serde_json::to_vec(snapshot)?;
        let compressed = zstd::encode_all(&*serialized, 3)
            .map_err(|e| OrchestratorError::io("compress snapshot", e))?;
        self.tree.insert(snapshot.run_id.as_bytes(), compressed)?;
        self.tree.flush()?;
        debug!(
            run_id = %snapshot.run_id,
            sequence = snapshot.sequence,
            bytes = serialized.len(),
            "Saved progress snapshot"
        );
        Ok(())
    }

    fn load(&self, run_id: &str) -> Result<Option<ProgressSnapshot>> {
        match self.tree.get(run_id.as_bytes())? {
            Some(compressed) => {
                let bytes = zstd::decode_all(&compressed[..])
                    .map_err(|e| OrchestratorError::io("decompress snapshot", e))?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            None => Ok(None),
        }
    }

    fn run_ids(&self) -> Result<Vec<String>> {
        self.tree
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                Ok(String::from_utf8_lossy(&key).into_owned())
            })
            .collect()
    }
}
