//! The persistent instance registry.
//!
//! `InstanceRegistry` owns all known instance groups, enforcing the
//! uniqueness invariants under the store's exclusive lock:
//!
//! - a home directory belongs to at most one group
//! - an instance id belongs to at most one instance across all groups
//!
//! All views handed out are by-value snapshots; mutations are totally
//! ordered by exclusive-lock acquisition.

pub mod data;
pub mod lockfile;
pub mod query;
pub mod store;

use std::path::PathBuf;

use tracing::debug;

use crate::error::{Error, Result};

pub use data::{Group, GroupSpec, Instance, PersistentData};
pub use lockfile::{InUseState, InstanceLockfile};
pub use query::{Filter, InstanceView};
pub use store::PersistentStore;

const JSON_GROUPS_KEY: &str = "Groups";

pub struct InstanceRegistry {
    store: PersistentStore,
}

impl InstanceRegistry {
    pub fn new(backing_file: impl Into<PathBuf>) -> Self {
        Self {
            store: PersistentStore::new(backing_file),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.store.with_shared_lock(|data| Ok(data.groups.is_empty()))
    }

    /// Validate `spec`, then append it as a new group.
    ///
    /// Validation happens before any side effect; the home directory is
    /// created if missing; the uniqueness checks and the append happen
    /// atomically under the exclusive lock.
    pub fn add_group(&self, spec: GroupSpec) -> Result<Group> {
        if !data::is_valid_group_name(&spec.name) {
            return Err(Error::invalid(format!(
                "group name \"{}\" is ill-formed",
                spec.name
            )));
        }
        if !spec.home_directory.is_absolute() {
            return Err(Error::invalid(format!(
                "home directory \"{}\" is not an absolute path",
                spec.home_directory.display()
            )));
        }
        std::fs::create_dir_all(&spec.home_directory)?;
        if !data::looks_like_host_artifacts(&spec.host_artifacts_path) {
            return Err(Error::invalid(format!(
                "ANDROID_HOST_OUT \"{}\" is not a tool directory",
                spec.host_artifacts_path.display()
            )));
        }
        for instance in &spec.instances {
            if !data::is_valid_instance_name(&instance.name) {
                return Err(Error::invalid(format!(
                    "instance name \"{}\" is invalid",
                    instance.name
                )));
            }
        }

        let group = spec.into_group();
        self.store.with_exclusive_lock(move |data| {
            Self::check_group_conflicts(data, &group)?;
            debug!(group = %group.name, home = %group.home_directory.display(), "adding instance group");
            data.groups.push(group.clone());
            Ok(group)
        })
    }

    /// Remove the first group with the given name. Returns whether one was
    /// removed.
    pub fn remove_group(&self, group_name: &str) -> Result<bool> {
        self.store.with_exclusive_lock(|data| {
            match data.groups.iter().position(|g| g.name == group_name) {
                Some(idx) => {
                    data.groups.remove(idx);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Empty the registry, returning the groups it held.
    pub fn clear(&self) -> Result<Vec<Group>> {
        self.store
            .with_exclusive_lock(|data| Ok(std::mem::take(&mut data.groups)))
    }

    pub fn list_groups(&self) -> Result<Vec<Group>> {
        self.store.with_shared_lock(|data| Ok(data.groups.clone()))
    }

    pub fn find_groups(&self, filter: &Filter) -> Result<Vec<Group>> {
        self.store
            .with_shared_lock(|data| Ok(query::find_groups(data, filter)))
    }

    pub fn find_instances(&self, filter: &Filter) -> Result<Vec<InstanceView>> {
        self.store
            .with_shared_lock(|data| Ok(query::find_instances(data, filter)))
    }

    /// Append groups parsed from an external serialized blob of the form
    /// `{ "Groups": [ <group> ... ] }`.
    ///
    /// Existing groups are kept; a conflict with any of them fails the whole
    /// import with no mutation.
    pub fn load_from_json(&self, blob: &str) -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(blob)
            .map_err(|e| Error::invalid(format!("serialized registry is not valid JSON: {}", e)))?;
        let group_array = value
            .get(JSON_GROUPS_KEY)
            .ok_or_else(|| {
                Error::invalid(format!(
                    "serialized registry has no \"{}\" key",
                    JSON_GROUPS_KEY
                ))
            })?
            .as_array()
            .ok_or_else(|| {
                Error::invalid(format!("\"{}\" is not an array", JSON_GROUPS_KEY))
            })?;

        let mut new_groups = Vec::with_capacity(group_array.len());
        for group_value in group_array {
            let group: Group = serde_json::from_value(group_value.clone())
                .map_err(|e| Error::invalid(format!("malformed group entry: {}", e)))?;
            group.validate()?;
            new_groups.push(group);
        }

        self.store.with_exclusive_lock(move |data| {
            for group in &new_groups {
                Self::check_group_conflicts(data, group)?;
                data.groups.push(group.clone());
            }
            Ok(())
        })
    }

    pub fn set_acloud_optout(&self, optout: bool) -> Result<()> {
        self.store.with_exclusive_lock(|data| {
            data.acloud_translator_optout = optout;
            Ok(())
        })
    }

    pub fn acloud_optout(&self) -> Result<bool> {
        self.store
            .with_shared_lock(|data| Ok(data.acloud_translator_optout))
    }

    /// Uniqueness checks performed under the exclusive lock: the home
    /// directory must not belong to any existing group, and no instance id
    /// may already be taken anywhere in the registry.
    fn check_group_conflicts(data: &PersistentData, group: &Group) -> Result<()> {
        let home_filter = Filter::home(group.home_directory.clone());
        if let Some(existing) = query::find_groups(data, &home_filter).first() {
            return Err(Error::conflict(format!(
                "new group conflicts with existing group: {} at {}",
                existing.name,
                existing.home_directory.display()
            )));
        }
        for instance in &group.instances {
            if let Some(existing) = query::find_instances(data, &Filter::id(instance.id)).first() {
                return Err(Error::conflict(format!(
                    "new instance conflicts with existing instance: {} with id {}",
                    existing.name, existing.id
                )));
            }
        }
        Ok(())
    }
}
