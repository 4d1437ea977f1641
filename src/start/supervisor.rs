//! Supervision of one launcher child process.
//!
//! A supervisor holds at most one child at a time. `setup` records a
//! just-spawned child, `wait` blocks until it exits or is signalled, and
//! `interrupt` requests termination from any thread (including the signal
//! worker) while a `wait` is in flight.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited,
    Signalled,
}

/// How the supervised child ended: an exit code, or the killing signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub kind: ExitKind,
    pub code: i32,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.kind == ExitKind::Exited && self.code == 0
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self {
                kind: ExitKind::Exited,
                code,
            },
            None => Self {
                kind: ExitKind::Signalled,
                code: status.signal().unwrap_or(0),
            },
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ExitKind::Exited => write!(f, "exited with code {}", self.code),
            ExitKind::Signalled => write!(f, "terminated by signal {}", self.code),
        }
    }
}

pub struct SubprocessSupervisor {
    child: Mutex<Option<Child>>,
    // 0 while no child is supervised; read by interrupt() without the lock
    // so the signal worker never blocks behind wait().
    pid: AtomicI32,
}

impl Default for SubprocessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SubprocessSupervisor {
    pub fn new() -> Self {
        Self {
            child: Mutex::new(None),
            pid: AtomicI32::new(0),
        }
    }

    /// Record a just-launched child. Fails if one is already supervised.
    pub async fn setup(&self, child: Child) -> Result<()> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Err(Error::internal("a subprocess is already being supervised"));
        }
        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);
        *guard = Some(child);
        Ok(())
    }

    /// Block until the supervised child exits or is signalled.
    ///
    /// After this returns, `setup` may be called again.
    pub async fn wait(&self) -> Result<ExitInfo> {
        let mut child = self
            .child
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::internal("no subprocess under supervision"))?;
        let status = child.wait().await;
        self.pid.store(0, Ordering::SeqCst);
        Ok(ExitInfo::from_status(status?))
    }

    /// Request termination of the supervised child. Idempotent; callable
    /// from any thread.
    pub fn interrupt(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid <= 0 {
            return;
        }
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!(pid, error = %e, "failed to deliver SIGTERM to supervised child");
        }
    }
}
