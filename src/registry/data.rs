//! Persisted data model for the instance registry.
//!
//! `PersistentData` is the root of the serialized registry file. Groups and
//! instances are plain `serde` values; all views handed out by the registry
//! are by-value snapshots of these records, so nothing outside the registry
//! ever aliases the persisted state.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One virtual device within a group.
///
/// The instance id is unique across the entire registry, not just within the
/// owning group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: u32,
    pub name: String,
}

impl Instance {
    /// Device name as exposed to tooling: `<group>-<instance>`.
    pub fn device_name(&self, group_name: &str) -> String {
        format!("{}-{}", group_name, self.name)
    }
}

/// One virtual-device group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub home_directory: PathBuf,
    pub host_artifacts_path: PathBuf,
    pub product_out_path: String,
    #[serde(default)]
    pub is_default_group: bool,
    pub instances: Vec<Instance>,
    pub start_time: DateTime<Utc>,
}

impl Group {
    /// Re-validate a group, e.g. after loading it from disk or from an
    /// imported serialized form.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_group_name(&self.name) {
            return Err(Error::invalid(format!(
                "group name \"{}\" is ill-formed",
                self.name
            )));
        }
        if !self.home_directory.is_absolute() {
            return Err(Error::invalid(format!(
                "home directory \"{}\" is not an absolute path",
                self.home_directory.display()
            )));
        }
        for instance in &self.instances {
            if !is_valid_instance_name(&instance.name) {
                return Err(Error::invalid(format!(
                    "instance name \"{}\" is invalid",
                    instance.name
                )));
            }
        }
        Ok(())
    }

    pub fn find_by_id(&self, id: u32) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn find_by_instance_name(&self, name: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.name == name)
    }
}

/// Input to `InstanceRegistry::add_group`; the registry stamps the start
/// time and returns the stored `Group`.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub name: String,
    pub home_directory: PathBuf,
    pub host_artifacts_path: PathBuf,
    pub product_out_path: String,
    pub is_default_group: bool,
    pub instances: Vec<Instance>,
}

impl GroupSpec {
    pub(crate) fn into_group(self) -> Group {
        Group {
            name: self.name,
            home_directory: self.home_directory,
            host_artifacts_path: self.host_artifacts_path,
            product_out_path: self.product_out_path,
            is_default_group: self.is_default_group,
            instances: self.instances,
            start_time: Utc::now(),
        }
    }
}

/// Root of the registry's backing file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentData {
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub acloud_translator_optout: bool,
}

/// Group names follow `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_group_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Per-instance names are non-empty words: `[A-Za-z0-9_]+`.
pub fn is_valid_instance_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A launcher toolkit directory must at least carry a `bin/` subdirectory.
pub fn looks_like_host_artifacts(path: &Path) -> bool {
    path.join("bin").is_dir()
}
