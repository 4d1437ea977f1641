//! Scoped, file-locked accessor over the serialized registry.
//!
//! All registry state lives in a single JSON file. Concurrent request
//! handlers, possibly in different daemon processes, coordinate through
//! advisory locks: any number of shared holders, or one exclusive holder.
//!
//! The lock is held on a sidecar `<file>.lock` so the data file itself can
//! be atomically replaced by rename without invalidating held locks.

use std::fs::OpenOptions;
use std::path::PathBuf;

use fs2::FileExt;

use crate::error::{Error, Result};

use super::data::PersistentData;

pub struct PersistentStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl PersistentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Run `f` over a read-only view of the registry under a shared lock.
    ///
    /// The lock is released on every exit path, including failure of `f`.
    pub fn with_shared_lock<T>(&self, f: impl FnOnce(&PersistentData) -> Result<T>) -> Result<T> {
        let lock_file = self.open_lock_file()?;
        lock_file.lock_shared()?;
        let out = self.read_data().and_then(|data| f(&data));
        let _ = FileExt::unlock(&lock_file);
        out
    }

    /// Run `f` over a mutable view of the registry under an exclusive lock.
    ///
    /// Iff `f` succeeds, the mutated view is re-serialized and atomically
    /// replaces the backing file before the lock is released. On failure the
    /// file is left untouched.
    pub fn with_exclusive_lock<T>(
        &self,
        f: impl FnOnce(&mut PersistentData) -> Result<T>,
    ) -> Result<T> {
        let lock_file = self.open_lock_file()?;
        lock_file.lock_exclusive()?;
        let out = self.read_data().and_then(|mut data| {
            let value = f(&mut data)?;
            self.persist(&data)?;
            Ok(value)
        });
        let _ = FileExt::unlock(&lock_file);
        out
    }

    fn open_lock_file(&self) -> Result<std::fs::File> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;
        Ok(file)
    }

    /// A missing or empty backing file reads as an empty registry; anything
    /// else must parse and re-validate, or the read fails loudly.
    fn read_data(&self) -> Result<PersistentData> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistentData::default())
            }
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(PersistentData::default());
        }
        let data: PersistentData = serde_json::from_str(&raw).map_err(|e| {
            Error::internal(format!(
                "registry file {} is corrupted: {}",
                self.path.display(),
                e
            ))
        })?;
        for group in &data.groups {
            group.validate().map_err(|e| {
                Error::internal(format!(
                    "registry file {} holds an invalid group: {}",
                    self.path.display(),
                    e
                ))
            })?;
        }
        Ok(data)
    }

    fn persist(&self, data: &PersistentData) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)
            .map_err(|e| Error::internal(format!("failed to serialize registry: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
