//! Crash-safe file helpers shared by the stores.
//!
//! Whole-document writes go through [`atomic_write`]: a temp file in the target
//! directory is written, synced, then renamed over the target, so a reader never
//! observes a half-written JSON document.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| StoreError::io(format!("creating {}", parent.display()), e))?;
    }
    Ok(())
}

/// Writes `data` to `target` via temp file + rename.
pub(crate) fn atomic_write(target: &Path, data: &[u8]) -> Result<(), StoreError> {
    ensure_parent_dir(target)?;
    let parent = match target.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    };

    let mut temp = tempfile::NamedTempFile::new_in(&parent)
        .map_err(|e| StoreError::io(format!("creating temp file in {}", parent.display()), e))?;
    temp.write_all(data)
        .map_err(|e| StoreError::io(format!("writing temp file for {}", target.display()), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(format!("syncing temp file for {}", target.display()), e))?;
    temp.persist(target).map_err(|e| {
        StoreError::io(format!("renaming temp file to {}", target.display()), e.error)
    })?;
    Ok(())
}

pub(crate) fn write_json<T: Serialize>(target: &Path, value: &T) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| StoreError::json(format!("encoding {}", target.display()), e))?;
    atomic_write(target, &data)
}

/// Reads a JSON document; `Ok(None)` when the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| StoreError::json(format!("decoding {}", path.display()), e))
}

/// Opens (creating if needed) a lock file without truncating it.
pub(crate) fn open_lock_file(path: &Path) -> Result<File, StoreError> {
    ensure_parent_dir(path)?;
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| StoreError::io(format!("opening lock {}", path.display()), e))
}
