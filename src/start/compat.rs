//! Backward-compatibility filesystem side effects.
//!
//! Two families of symlinks keep older tooling working:
//!
//! - Default-group symlinks under the system-wide user home
//!   (`~/cuttlefish_runtime.<id>` etc.), created only when the user neither
//!   overrode HOME nor passed selector flags.
//! - acloud workspace symlinks under `<tmp>/acloud_cvd_temp/`, so the
//!   Python acloud tool keeps finding its per-instance directories.
//!
//! Everything here is best-effort from the orchestrator's point of view:
//! callers log failures and keep going.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::error::Result;

use super::planner::GroupCreationPlan;
use super::LAUNCHED_BY_ACLOUD_ENV;

/// Replace whatever sits at `link` with a symlink to `target`.
///
/// An existing directory is removed recursively, an existing file or
/// symlink is unlinked. Existence probes never follow symlinks.
pub fn ensure_symlink(target: &Path, link: &Path) -> Result<()> {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_dir() => {
            std::fs::remove_dir_all(link)?;
        }
        Ok(_) => {
            std::fs::remove_file(link)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

/// Extra symlinks under the system-wide home for the default group, so
/// tooling that predates instance groups keeps resolving its fixed paths.
pub fn create_symlinks(plan: &GroupCreationPlan, system_home: &Path) -> Result<()> {
    std::fs::create_dir_all(&plan.home)?;

    let mut smallest_id = u32::MAX;
    for instance in &plan.instances {
        smallest_id = smallest_id.min(instance.id);
        let instance_home = plan
            .home
            .join("cuttlefish")
            .join("instances")
            .join(format!("cvd-{}", instance.id));
        ensure_symlink(
            &instance_home,
            &system_home.join(format!("cuttlefish_runtime.{}", instance.id)),
        )?;
    }
    if smallest_id == u32::MAX {
        return Err(crate::error::Error::internal(
            "the group did not have any instance, which is not expected",
        ));
    }

    ensure_symlink(
        &plan.home.join("cuttlefish"),
        &system_home.join("cuttlefish"),
    )?;
    ensure_symlink(
        &plan
            .home
            .join("cuttlefish")
            .join("assembly")
            .join("cuttlefish_config.json"),
        &system_home.join(".cuttlefish_config.json"),
    )?;
    ensure_symlink(
        &system_home.join(format!("cuttlefish_runtime.{}", smallest_id)),
        &system_home.join("cuttlefish_runtime"),
    )?;
    Ok(())
}

/// Reconcile the acloud workspace directories with this launch.
///
/// Stale per-instance entries are removed unless acloud itself started the
/// launch, then fresh symlinks to the group home are created. Deletion
/// failures are logged and do not stop symlink creation.
pub fn acloud_compat_actions(
    plan: &GroupCreationPlan,
    envs: &HashMap<String, String>,
    tmp_dir: &Path,
) -> Result<()> {
    let compat_prefix = tmp_dir.join("acloud_cvd_temp");
    let compat_homes: Vec<PathBuf> = plan
        .instances
        .iter()
        .map(|i| compat_prefix.join(format!("local-instance-{}", i.id)))
        .collect();

    let launched_by_acloud = envs.get(LAUNCHED_BY_ACLOUD_ENV).map(String::as_str) == Some("true");

    for compat_home in &compat_homes {
        let meta = match std::fs::symlink_metadata(compat_home) {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        if launched_by_acloud {
            continue;
        }
        let removed = if meta.file_type().is_dir() {
            // acloud created a real directory
            std::fs::remove_dir_all(compat_home)
        } else {
            // a previous launch created a symbolic link
            std::fs::remove_file(compat_home)
        };
        if let Err(e) = removed {
            error!(path = %compat_home.display(), error = %e, "removing stale acloud entry failed");
            continue;
        }
    }

    std::fs::create_dir_all(&plan.home)?;
    std::fs::create_dir_all(&compat_prefix)?;
    ensure_symlink(&plan.host_artifacts_path, &plan.home.join("host_bins"))?;

    for compat_home in &compat_homes {
        if compat_home == &plan.home {
            warn!(
                home = %plan.home.display(),
                "the HOME directory is an acloud workspace and will be deleted \
                 by the next launch using the same HOME"
            );
            continue;
        }
        ensure_symlink(&plan.home, compat_home)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::start::planner::PerInstancePlan;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "cvdd_compat_{}_{}",
            tag,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn plan_with(home: PathBuf, artifacts: PathBuf, ids: &[u32]) -> GroupCreationPlan {
        GroupCreationPlan {
            group_name: "cvd".into(),
            home,
            host_artifacts_path: artifacts,
            product_out_path: "/opt/out".into(),
            instances: ids
                .iter()
                .map(|id| PerInstancePlan {
                    id: *id,
                    name: id.to_string(),
                    lockfile: None,
                })
                .collect(),
            is_default_group: true,
            args: vec![],
            envs: HashMap::new(),
        }
    }

    #[test]
    fn ensure_symlink_replaces_directory_and_file() {
        let dir = temp_dir("replace");
        let target = dir.join("target");
        std::fs::create_dir_all(&target).unwrap();

        let link = dir.join("link");
        std::fs::create_dir_all(link.join("nested")).unwrap();
        ensure_symlink(&target, &link).unwrap();
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_link(&link).unwrap(), target);

        std::fs::remove_file(&link).unwrap();
        std::fs::write(&link, b"plain file").unwrap();
        ensure_symlink(&target, &link).unwrap();
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn default_group_symlinks_point_into_group_home() {
        let dir = temp_dir("symlinks");
        let system_home = dir.join("system_home");
        std::fs::create_dir_all(&system_home).unwrap();
        let plan = plan_with(dir.join("group_home"), dir.join("toolkit"), &[2, 3]);

        create_symlinks(&plan, &system_home).unwrap();

        let runtime2 = system_home.join("cuttlefish_runtime.2");
        assert_eq!(
            std::fs::read_link(&runtime2).unwrap(),
            plan.home.join("cuttlefish/instances/cvd-2")
        );
        let runtime = system_home.join("cuttlefish_runtime");
        assert_eq!(
            std::fs::read_link(&runtime).unwrap(),
            system_home.join("cuttlefish_runtime.2")
        );
        assert!(std::fs::symlink_metadata(system_home.join("cuttlefish")).is_ok());
        assert!(std::fs::symlink_metadata(system_home.join(".cuttlefish_config.json")).is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn acloud_compat_replaces_stale_entries() {
        let dir = temp_dir("acloud");
        let tmp = dir.join("tmp");
        let plan = plan_with(dir.join("home"), dir.join("toolkit"), &[4]);

        // A stale directory from a previous acloud run.
        let stale = tmp.join("acloud_cvd_temp/local-instance-4");
        std::fs::create_dir_all(stale.join("leftover")).unwrap();

        acloud_compat_actions(&plan, &HashMap::new(), &tmp).unwrap();

        assert!(std::fs::symlink_metadata(&stale).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_link(&stale).unwrap(), plan.home);
        assert_eq!(
            std::fs::read_link(plan.home.join("host_bins")).unwrap(),
            plan.host_artifacts_path
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn acloud_entries_survive_when_launched_by_acloud() {
        let dir = temp_dir("acloud_keep");
        let tmp = dir.join("tmp");
        let plan = plan_with(dir.join("home"), dir.join("toolkit"), &[6]);

        let existing = tmp.join("acloud_cvd_temp/local-instance-6");
        std::fs::create_dir_all(&existing).unwrap();

        let mut envs = HashMap::new();
        envs.insert(LAUNCHED_BY_ACLOUD_ENV.to_string(), "true".to_string());
        acloud_compat_actions(&plan, &envs, &tmp).unwrap();

        // The deletion pass skips acloud's entry; the symlink pass still
        // points it at the group home.
        assert!(std::fs::symlink_metadata(&existing)
            .unwrap()
            .file_type()
            .is_symlink());
        assert_eq!(std::fs::read_link(&existing).unwrap(), plan.home);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
