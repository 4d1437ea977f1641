//! Force-stop collaborator for failed launches.
//!
//! When the launcher child dies after daemonizing, `run_cvd` processes may
//! survive in the background with a registry entry about to be rolled back.
//! The orchestrator asks a `DeviceStopper` to find and kill them by the
//! group's first instance id. The production implementation walks `/proc`,
//! matching processes that carry the daemon's marker env and the instance
//! id; tests substitute a recording stub.

use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::error::{Error, Result};

use super::{CVD_MARK_ENV, CUTTLEFISH_INSTANCE_ENV};

const LAUNCHER_PROCESS_NAME: &str = "run_cvd";

const COLLECTOR_FAILURE_GUIDANCE: &str = r#"
  Consider running:
     cvd reset -y

  cvd start failed. While run_cvd processes should be collected to manually
  clean them up, collecting run_cvd failed.
"#;

const STOP_FAILURE_GUIDANCE: &str = r#"
  Consider running:
     cvd reset -y

  cvd start failed, and stopping run_cvd processes failed.
"#;

pub trait DeviceStopper: Send + Sync {
    /// Find and forcefully stop the surviving launcher processes of the
    /// group identified by its first instance id.
    fn force_stop_group(&self, first_instance_id: u32) -> Result<()>;
}

/// `/proc`-scanning implementation.
pub struct RunCvdProcessManager;

impl RunCvdProcessManager {
    fn collect_group_pids(first_instance_id: u32) -> std::io::Result<Vec<i32>> {
        let marker = format!("{}=true", CVD_MARK_ENV);
        let instance = format!("{}={}", CUTTLEFISH_INSTANCE_ENV, first_instance_id);
        let mut pids = Vec::new();
        for entry in std::fs::read_dir("/proc")? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
                continue;
            };
            if !Self::comm_matches(&entry.path()) {
                continue;
            }
            // The process may exit between listing and reading; skip it.
            let Ok(environ) = std::fs::read(entry.path().join("environ")) else {
                continue;
            };
            let mut has_marker = false;
            let mut has_instance = false;
            for var in environ.split(|b| *b == 0) {
                let var = String::from_utf8_lossy(var);
                has_marker |= var == marker;
                has_instance |= var == instance;
            }
            if has_marker && has_instance {
                pids.push(pid);
            }
        }
        Ok(pids)
    }

    fn comm_matches(proc_dir: &Path) -> bool {
        match std::fs::read_to_string(proc_dir.join("comm")) {
            Ok(comm) => comm.trim().starts_with(LAUNCHER_PROCESS_NAME),
            Err(_) => false,
        }
    }
}

impl DeviceStopper for RunCvdProcessManager {
    fn force_stop_group(&self, first_instance_id: u32) -> Result<()> {
        let pids = Self::collect_group_pids(first_instance_id)
            .map_err(|_| Error::internal(COLLECTOR_FAILURE_GUIDANCE))?;
        info!(
            first_instance_id,
            count = pids.len(),
            "force-stopping surviving run_cvd processes"
        );
        let mut failed = false;
        for pid in pids {
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) => {}
                // Already gone.
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => {
                    warn!(pid, error = %e, "failed to kill run_cvd process");
                    failed = true;
                }
            }
        }
        if failed {
            return Err(Error::internal(STOP_FAILURE_GUIDANCE));
        }
        Ok(())
    }
}
