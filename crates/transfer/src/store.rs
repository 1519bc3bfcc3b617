use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::TransferError;
use crate::validation::validate_location;

/// Byte-addressable storage medium the transfer engine reads and writes.
///
/// Locations are relative, `/`-separated paths. Implementations must be
/// safe to call from several threads at once.
pub trait ObjectStore: Send + Sync {
    /// Reads up to `len` bytes starting at `offset`. Returns fewer bytes
    /// only when the artifact ends first.
    fn read_at(&self, location: &str, offset: u64, len: usize) -> Result<Vec<u8>, TransferError>;

    /// Writes `data` at `offset`, creating the artifact if needed. Returns
    /// once the bytes are durable.
    fn write_at(&self, location: &str, offset: u64, data: &[u8]) -> Result<usize, TransferError>;

    /// Creates an empty artifact, truncating any existing one.
    fn create(&self, location: &str) -> Result<(), TransferError>;

    /// Removes an artifact. Deleting something absent is not an error.
    fn delete(&self, location: &str) -> Result<(), TransferError>;

    /// Moves an artifact, replacing any existing target.
    fn rename(&self, from: &str, to: &str) -> Result<(), TransferError>;

    /// Size of an artifact, or `None` if it does not exist.
    fn size(&self, location: &str) -> Result<Option<u64>, TransferError>;
}

// ---------------------------------------------------------------------------
// LocalStore
// ---------------------------------------------------------------------------

/// [`ObjectStore`] backed by a directory on the local filesystem.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a location to an absolute path under the root.
    pub fn path_of(&self, location: &str) -> Result<PathBuf, TransferError> {
        validate_location(location)?;
        Ok(self.root.join(location))
    }

    fn open_for_write(&self, location: &str, truncate: bool) -> Result<File, TransferError> {
        let path = self.path_of(location)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(truncate)
            .open(&path)?;
        Ok(file)
    }
}

impl ObjectStore for LocalStore {
    fn read_at(&self, location: &str, offset: u64, len: usize) -> Result<Vec<u8>, TransferError> {
        let path = self.path_of(location)?;
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TransferError::NotFound(location.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write_at(&self, location: &str, offset: u64, data: &[u8]) -> Result<usize, TransferError> {
        let mut file = self.open_for_write(location, false)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(data.len())
    }

    fn create(&self, location: &str) -> Result<(), TransferError> {
        let file = self.open_for_write(location, true)?;
        file.sync_all()?;
        Ok(())
    }

    fn delete(&self, location: &str) -> Result<(), TransferError> {
        let path = self.path_of(location)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(location, "artifact deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), TransferError> {
        let src = self.path_of(from)?;
        let dst = self.path_of(to)?;
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::rename(&src, &dst) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(TransferError::NotFound(from.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn size(&self, location: &str) -> Result<Option<u64>, TransferError> {
        let path = self.path_of(location)?;
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
