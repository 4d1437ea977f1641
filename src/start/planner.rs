//! Group-creation planning.
//!
//! Turns one start request (subcommand args, environment, selector hints)
//! into a concrete `GroupCreationPlan`: the group identity, the resolved
//! instance ids and names, and the captured args/envs the rewriter will
//! canonicalize. The plan also holds the per-instance lockfiles, acquired
//! here so an id cannot be claimed twice across concurrent requests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::registry::data::{is_valid_group_name, is_valid_instance_name};
use crate::registry::{Instance, InstanceLockfile};

use super::rewriter::consume_flag_values;
use super::{ANDROID_HOST_OUT_ENV, ANDROID_PRODUCT_OUT_ENV, CUTTLEFISH_INSTANCE_ENV};

pub const DEFAULT_GROUP_NAME: &str = "cvd";

pub const GROUP_NAME_SELECTOR: &str = "group_name";
pub const INSTANCE_NAME_SELECTOR: &str = "instance_name";

/// One planned instance plus its acquired lockfile.
#[derive(Debug)]
pub struct PerInstancePlan {
    pub id: u32,
    pub name: String,
    pub lockfile: Option<InstanceLockfile>,
}

impl PerInstancePlan {
    pub fn as_instance(&self) -> Instance {
        Instance {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

#[derive(Debug)]
pub struct GroupCreationPlan {
    pub group_name: String,
    pub home: PathBuf,
    pub host_artifacts_path: PathBuf,
    pub product_out_path: String,
    pub instances: Vec<PerInstancePlan>,
    pub is_default_group: bool,
    pub args: Vec<String>,
    pub envs: HashMap<String, String>,
}

impl GroupCreationPlan {
    pub fn instance_records(&self) -> Vec<Instance> {
        self.instances.iter().map(|p| p.as_instance()).collect()
    }

    pub fn first_instance_id(&self) -> Option<u32> {
        self.instances.first().map(|p| p.id)
    }
}

pub struct PlannerInput<'a> {
    pub subcmd_args: &'a [String],
    pub envs: &'a HashMap<String, String>,
    pub selector_args: &'a [String],
    /// The OS's notion of `$HOME` at daemon start.
    pub system_home: &'a Path,
    pub client_pwd: &'a Path,
    pub lock_dir: &'a Path,
}

/// Build a deterministic creation plan from one request's inputs.
pub fn plan_group(input: PlannerInput<'_>) -> Result<GroupCreationPlan> {
    let selector = parse_selector_args(input.selector_args)?;

    let group_name = match &selector.group_name {
        Some(name) => {
            if !is_valid_group_name(name) {
                return Err(Error::invalid(format!(
                    "group name \"{}\" is ill-formed",
                    name
                )));
            }
            name.clone()
        }
        None => DEFAULT_GROUP_NAME.to_string(),
    };

    let ids = resolve_instance_ids(input.subcmd_args, input.envs)?;
    let names = match &selector.instance_names {
        Some(names) => {
            if names.len() != ids.len() {
                return Err(Error::invalid(format!(
                    "{} instance names given for {} instances",
                    names.len(),
                    ids.len()
                )));
            }
            for name in names {
                if !is_valid_instance_name(name) {
                    return Err(Error::invalid(format!(
                        "instance name \"{}\" is invalid",
                        name
                    )));
                }
            }
            names.clone()
        }
        None => ids.iter().map(|id| id.to_string()).collect(),
    };

    let home_overridden = input
        .envs
        .get("HOME")
        .map(|h| Path::new(h) != input.system_home)
        .unwrap_or(false);
    let is_default_group = !home_overridden && input.selector_args.is_empty();

    let home = match input.envs.get("HOME") {
        Some(h) => PathBuf::from(h),
        None if is_default_group => input.system_home.to_path_buf(),
        None => std::env::temp_dir().join("cvd").join("home").join(&group_name),
    };

    let host_artifacts_path = input
        .envs
        .get(ANDROID_HOST_OUT_ENV)
        .map(PathBuf::from)
        .ok_or_else(|| {
            Error::Precondition(format!("{} is not given", ANDROID_HOST_OUT_ENV))
        })?;
    let product_out_path = input
        .envs
        .get(ANDROID_PRODUCT_OUT_ENV)
        .cloned()
        .unwrap_or_else(|| host_artifacts_path.to_string_lossy().into_owned());

    let mut instances = Vec::with_capacity(ids.len());
    for (id, name) in ids.iter().zip(names) {
        let lockfile = InstanceLockfile::acquire(input.lock_dir, *id)?;
        instances.push(PerInstancePlan {
            id: *id,
            name,
            lockfile: Some(lockfile),
        });
    }

    Ok(GroupCreationPlan {
        group_name,
        home,
        host_artifacts_path,
        product_out_path,
        instances,
        is_default_group,
        args: input.subcmd_args.to_vec(),
        envs: input.envs.clone(),
    })
}

#[derive(Debug, Default)]
struct SelectorOpts {
    group_name: Option<String>,
    instance_names: Option<Vec<String>>,
}

fn parse_selector_args(selector_args: &[String]) -> Result<SelectorOpts> {
    let mut args = selector_args.to_vec();
    let mut opts = SelectorOpts::default();
    if let Some(name) = consume_flag_values(&mut args, GROUP_NAME_SELECTOR).pop() {
        opts.group_name = Some(name);
    }
    if let Some(joined) = consume_flag_values(&mut args, INSTANCE_NAME_SELECTOR).pop() {
        opts.instance_names = Some(joined.split(',').map(|s| s.to_string()).collect());
    }
    if let Some(unknown) = args.first() {
        return Err(Error::invalid(format!(
            "unrecognized selector argument: \"{}\"",
            unknown
        )));
    }
    Ok(opts)
}

/// Instance ids come from the numbering flags if given, then the
/// `CUTTLEFISH_INSTANCE` env, and default to `[1]`.
fn resolve_instance_ids(
    subcmd_args: &[String],
    envs: &HashMap<String, String>,
) -> Result<Vec<u32>> {
    // Work on a scratch copy; the captured args keep the client's flags for
    // the rewriter to strip.
    let mut args = subcmd_args.to_vec();
    let instance_nums = consume_flag_values(&mut args, "instance_nums");
    let num_instances = consume_flag_values(&mut args, "num_instances");
    let base_instance_num = consume_flag_values(&mut args, "base_instance_num");

    if let Some(joined) = instance_nums.last() {
        let mut ids = Vec::new();
        for part in joined.split(',') {
            let id: u32 = part.trim().parse().map_err(|_| {
                Error::invalid(format!("instance id is not a number: \"{}\"", part))
            })?;
            ids.push(id);
        }
        if ids.is_empty() {
            return Err(Error::invalid("--instance_nums was given but empty"));
        }
        return Ok(ids);
    }

    let base: u32 = match base_instance_num.last() {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::invalid(format!("instance id is not a number: \"{}\"", raw)))?,
        None => match envs.get(CUTTLEFISH_INSTANCE_ENV) {
            Some(raw) => raw.parse().map_err(|_| {
                Error::invalid(format!("{} is not a number: \"{}\"", CUTTLEFISH_INSTANCE_ENV, raw))
            })?,
            None => 1,
        },
    };
    let count: u32 = match num_instances.last() {
        Some(raw) => raw.parse().map_err(|_| {
            Error::invalid(format!("instance count is not a number: \"{}\"", raw))
        })?,
        None => 1,
    };
    if count == 0 {
        return Err(Error::invalid("--num_instances must be at least 1"));
    }
    Ok((base..base + count).collect())
}
