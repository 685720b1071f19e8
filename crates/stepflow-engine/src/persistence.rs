//! Snapshot persistence collaborators.
//!
//! The store saves a [`FlowState`] after every replacement and loads one at
//! construction.  Both are best-effort: failures are logged by the caller and
//! never block the in-memory update.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use stepflow_types::{FlowState, Result};

use crate::store::lock;

/// Save/load/clear of a state snapshot.
pub trait Persistence: Send + Sync {
    fn save(&self, state: &FlowState) -> Result<()>;

    /// Returns `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<FlowState>>;

    fn clear(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemoryPersistence
// ---------------------------------------------------------------------------

/// Keeps the last saved snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    slot: Mutex<Option<FlowState>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the slot, as if `state` had been saved by an earlier session.
    pub fn with_state(state: FlowState) -> Self {
        Self {
            slot: Mutex::new(Some(state)),
        }
    }

    /// The last saved snapshot.
    pub fn saved(&self) -> Option<FlowState> {
        lock(&self.slot).clone()
    }
}

impl Persistence for MemoryPersistence {
    fn save(&self, state: &FlowState) -> Result<()> {
        *lock(&self.slot) = Some(state.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<FlowState>> {
        Ok(lock(&self.slot).clone())
    }

    fn clear(&self) -> Result<()> {
        lock(&self.slot).take();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonFilePersistence
// ---------------------------------------------------------------------------

/// Writes the snapshot as pretty-printed JSON to a single file.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store the snapshot as `<dir>/flow-state.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("flow-state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persistence for JsonFilePersistence {
    fn save(&self, state: &FlowState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, json)?;
        tracing::debug!(path = %self.path.display(), step = %state.step, "Flow state saved");
        Ok(())
    }

    fn load(&self) -> Result<Option<FlowState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&self.path)?;
        let state: FlowState = serde_json::from_str(&json)?;
        Ok(Some(state))
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
