//! Introspection over the on-disk launcher toolkit.
//!
//! Different toolkit versions ship different binary names and flag sets.
//! Rather than hard-coding a support matrix, callers ask which executable
//! serves an operation and whether it accepts a given flag. Flag probing
//! runs the binary once with `--helpfull` and caches the output per binary
//! path; all answers are pure functions of the toolkit on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};

const START_BIN_CANDIDATES: &[&str] = &["cvd_internal_start", "launch_cvd"];
const STOP_BIN_CANDIDATES: &[&str] = &["cvd_internal_stop", "stop_cvd"];
const STATUS_BIN_CANDIDATES: &[&str] = &["cvd_internal_status", "cvd_status"];

#[derive(Default)]
pub struct HostToolIntrospector {
    help_cache: Mutex<HashMap<PathBuf, String>>,
}

impl HostToolIntrospector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base name of the executable serving `op` in this toolkit.
    pub fn exec_base_name(&self, artifacts: &Path, op: &str) -> Result<String> {
        let candidates = Self::candidates(op)?;
        for candidate in candidates {
            if artifacts.join("bin").join(candidate).is_file() {
                return Ok((*candidate).to_string());
            }
        }
        Err(Error::invalid(format!(
            "no {} binary found under {}/bin",
            op,
            artifacts.display()
        )))
    }

    /// Whether the executable serving `op` accepts `--<flag>`.
    pub fn accepts_flag(&self, artifacts: &Path, op: &str, flag: &str) -> Result<bool> {
        let base = self.exec_base_name(artifacts, op)?;
        let bin = artifacts.join("bin").join(base);
        let help = self.help_output(&bin)?;
        // Matches both the single- and double-dash spellings.
        Ok(help.contains(&format!("-{}", flag)))
    }

    fn candidates(op: &str) -> Result<&'static [&'static str]> {
        match op {
            "start" => Ok(START_BIN_CANDIDATES),
            "stop" => Ok(STOP_BIN_CANDIDATES),
            "status" => Ok(STATUS_BIN_CANDIDATES),
            other => Err(Error::invalid(format!(
                "unknown host tool operation: \"{}\"",
                other
            ))),
        }
    }

    fn help_output(&self, bin: &Path) -> Result<String> {
        {
            let cache = self.help_cache.lock().expect("help cache mutex poisoned");
            if let Some(cached) = cache.get(bin) {
                return Ok(cached.clone());
            }
        }
        debug!(bin = %bin.display(), "probing launcher flags via --helpfull");
        let output = std::process::Command::new(bin).arg("--helpfull").output()?;
        let mut help = String::from_utf8_lossy(&output.stdout).into_owned();
        help.push_str(&String::from_utf8_lossy(&output.stderr));
        self.help_cache
            .lock()
            .expect("help cache mutex poisoned")
            .insert(bin.to_path_buf(), help.clone());
        Ok(help)
    }
}
