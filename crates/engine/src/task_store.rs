//! Durable storage for task records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use skyvault_transfer::TransferError;
use tracing::warn;

use crate::task::TransferTask;

/// Persistence collaborator for [`TransferTask`] records.
pub trait TaskStore: Send + Sync {
    fn save(&self, task: &TransferTask) -> Result<(), TransferError>;
    fn load(&self, id: &str) -> Result<Option<TransferTask>, TransferError>;
    /// Removes a record. Removing an unknown ID is not an error.
    fn delete(&self, id: &str) -> Result<(), TransferError>;
    fn list(&self) -> Result<Vec<TransferTask>, TransferError>;
}

// ---------------------------------------------------------------------------
// MemoryTaskStore
// ---------------------------------------------------------------------------

/// Volatile store, for tests and embedded use.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, TransferTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn save(&self, task: &TransferTask) -> Result<(), TransferError> {
        let mut tasks = self.tasks.write().unwrap();
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<TransferTask>, TransferError> {
        Ok(self.tasks.read().unwrap().get(id).cloned())
    }

    fn delete(&self, id: &str) -> Result<(), TransferError> {
        self.tasks.write().unwrap().remove(id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<TransferTask>, TransferError> {
        Ok(self.tasks.read().unwrap().values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// JsonTaskStore
// ---------------------------------------------------------------------------

/// One JSON file per task in a directory.
///
/// Writes go to a temporary file that is renamed over the record, so a
/// crash never leaves a half-written task behind.
pub struct JsonTaskStore {
    dir: PathBuf,
}

impl JsonTaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, TransferError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(TransferError::InvalidRequest(format!("invalid task id: {id:?}")));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

impl TaskStore for JsonTaskStore {
    fn save(&self, task: &TransferTask) -> Result<(), TransferError> {
        let path = self.path_for(&task.id)?;
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(task)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<TransferTask>, TransferError> {
        let path = self.path_for(id)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, id: &str) -> Result<(), TransferError> {
        let path = self.path_for(id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<TransferTask>, TransferError> {
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            match serde_json::from_slice::<TransferTask>(&bytes) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable task record");
                }
            }
        }
        Ok(tasks)
    }
}
