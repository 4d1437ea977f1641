//! Daemon directory structure.
//!
//! Provides a single `DaemonPaths` struct that resolves all standard
//! locations and ensures they exist on first launch:
//!
//! - State:     `$XDG_STATE_HOME/cvdd/` (or `~/.local/state/cvdd/`)
//! - Registry:  `<state>/instance_registry.json`
//! - Logs:      `<state>/logs/`
//! - Locks:     `<tmp>/cvd/lock/` (instance lockfiles, shared with other
//!   launcher tooling, so they live under the system temp dir)
//!
//! `CVDD_STATE_DIR` overrides the state root; tests use it for isolation.

use std::path::PathBuf;

use tracing::info;

const APP_NAME: &str = "cvdd";

/// All resolved daemon directory paths.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    /// Machine-managed state root.
    pub state: PathBuf,
    /// Backing file for the instance registry.
    pub registry_file: PathBuf,
    /// Daemon log files.
    pub logs: PathBuf,
    /// Per-instance lockfiles.
    pub lock_dir: PathBuf,
}

impl DaemonPaths {
    /// Resolve all paths from the environment.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let state = state_dir()?;
        Some(Self {
            registry_file: state.join("instance_registry.json"),
            logs: state.join("logs"),
            lock_dir: std::env::temp_dir().join("cvd").join("lock"),
            state,
        })
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.state, &self.logs, &self.lock_dir] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }
        Ok(())
    }
}

fn state_dir() -> Option<PathBuf> {
    // CVDD_STATE_DIR takes priority (used by tests for isolation)
    if let Ok(dir) = std::env::var("CVDD_STATE_DIR") {
        return Some(PathBuf::from(dir));
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return Some(PathBuf::from(xdg).join(APP_NAME));
    }
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".local").join("state").join(APP_NAME))
}

/// The system-wide user home directory, as seen at daemon start.
pub fn system_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
