//! Per-instance lockfiles.
//!
//! An instance id is guarded by an OS-level advisory lock on
//! `<lock_dir>/local-instance-<id>.lock` so two groups cannot claim the same
//! id across daemon restarts. The flock prevents racing allocations while
//! this process is alive; the file *content* (`in-use` / `available`) is the
//! durable marker other tooling reads after the lock is dropped.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InUseState {
    InUse,
    Available,
}

impl InUseState {
    fn marker(self) -> &'static str {
        match self {
            InUseState::InUse => "in-use",
            InUseState::Available => "available",
        }
    }
}

/// An exclusively held lock on one instance id.
///
/// Dropping the handle releases the flock but leaves the marker content in
/// place.
#[derive(Debug)]
pub struct InstanceLockfile {
    file: File,
    path: PathBuf,
    id: u32,
}

impl InstanceLockfile {
    /// Acquire the lockfile for `id`, failing with `Conflict` if another
    /// process holds it.
    pub fn acquire(lock_dir: &Path, id: u32) -> Result<Self> {
        std::fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("local-instance-{}.lock", id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::conflict(format!(
                "instance id {} is locked by another process ({})",
                id,
                path.display()
            ))
        })?;
        Ok(Self { file, path, id })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the durable marker while keeping the flock held.
    pub fn mark(&mut self, state: InUseState) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(state.marker().as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}
