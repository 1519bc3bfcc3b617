use std::path::{Component, Path};

use crate::TransferError;

/// Longest file name accepted for an upload, in bytes.
const MAX_NAME_LEN: usize = 255;

/// Validates that a store location does not escape the store root.
///
/// Rejects:
/// - Empty locations
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_location(location: &str) -> Result<(), TransferError> {
    if location.is_empty() {
        return Err(TransferError::InvalidPath("empty location".into()));
    }

    let path = Path::new(location);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute location not allowed: {location}"
        )));
    }

    let mut normal = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {location}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute location not allowed: {location}"
                )));
            }
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
        }
    }

    if normal == 0 {
        return Err(TransferError::InvalidPath(format!(
            "location names no file: {location}"
        )));
    }

    Ok(())
}

/// Validates a client-supplied file name.
///
/// A name is a single path segment: no separators, no `.`/`..`, no NUL.
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.trim().is_empty() {
        return Err(TransferError::InvalidRequest("file name is empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(TransferError::InvalidRequest(format!(
            "file name longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if name == "." || name == ".." {
        return Err(TransferError::InvalidRequest(format!(
            "file name not allowed: {name}"
        )));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(TransferError::InvalidRequest(format!(
            "file name must not contain separators: {name:?}"
        )));
    }
    Ok(())
}
