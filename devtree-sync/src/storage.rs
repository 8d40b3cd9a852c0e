//! Snapshot persistence for the authoritative tree.
//!
//! The whole tree is written as one JSON document. Writes happen on a timer
//! when something changed and on shutdown; a crash loses at most one
//! interval of mutations.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use devtree_core::{SnapshotError, TreeSnapshot};

#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    dirty: AtomicBool,
    saves: AtomicU64,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dirty: AtomicBool::new(false),
            saves: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Load the persisted snapshot. A missing file is not an error.
    pub fn load(&self) -> Result<Option<TreeSnapshot>, SnapshotError> {
        if !self.path.exists() {
            log::info!("No snapshot at {}, starting empty", self.path.display());
            return Ok(None);
        }
        let snapshot = TreeSnapshot::load(&self.path)?;
        log::info!(
            "Loaded snapshot from {} ({} devices, {} views)",
            self.path.display(),
            snapshot.devices.len(),
            snapshot.views.len()
        );
        Ok(Some(snapshot))
    }

    /// Clear the dirty flag, returning its previous value.
    ///
    /// Call with the tree locked, right before taking the snapshot to be
    /// saved; any mutation after that point marks the store dirty again.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Write `snapshot`. Does not touch the dirty flag.
    pub fn save(&self, snapshot: &TreeSnapshot) -> Result<(), SnapshotError> {
        snapshot.save(&self.path)?;
        self.saves.fetch_add(1, Ordering::Relaxed);
        log::info!("Saved snapshot to {}", self.path.display());
        Ok(())
    }
}
