//! Canonicalization of launcher arguments and environment.
//!
//! Clients may pass instance-numbering flags from any toolkit era; the
//! planner has already resolved the actual instance identities, so this
//! module strips the client's flags and re-emits the canonical spelling the
//! on-disk launcher understands, verified through the introspector. It also
//! owns the daemon-mode flag policy and HOME normalization.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::registry::Instance;

use super::host_tool::HostToolIntrospector;
use super::{
    ANDROID_HOST_OUT_ENV, ANDROID_PRODUCT_OUT_ENV, ANDROID_SOONG_HOST_OUT_ENV, CVD_MARK_ENV,
    CUTTLEFISH_INSTANCE_ENV,
};

const POSSIBLE_CMDS: &str = "\"cvd start\" or \"launch_cvd\"";

/// Everything the rewriter needs about one planned launch.
pub struct RewriteInput<'a> {
    pub args: Vec<String>,
    pub envs: HashMap<String, String>,
    pub instances: &'a [Instance],
    pub group_name: &'a str,
    pub home: &'a Path,
    pub host_artifacts_path: &'a Path,
    pub product_out_path: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenCommand {
    pub args: Vec<String>,
    pub envs: HashMap<String, String>,
}

pub struct ArgEnvRewriter<'a> {
    pub introspector: &'a HostToolIntrospector,
}

impl ArgEnvRewriter<'_> {
    /// Strip the client's instance-numbering flags and re-emit the canonical
    /// form, then overlay the child environment block.
    pub fn rewrite(&self, input: RewriteInput<'_>) -> Result<RewrittenCommand> {
        let RewriteInput {
            mut args,
            mut envs,
            instances,
            group_name,
            home,
            host_artifacts_path,
            product_out_path,
        } = input;

        // Discard whatever the client supplied; the planner's identities win.
        // group_id is stripped too so rewriting an already-rewritten command
        // yields the same result.
        consume_flag_values(&mut args, "instance_nums");
        consume_flag_values(&mut args, "num_instances");
        consume_flag_values(&mut args, "base_instance_num");
        consume_flag_values(&mut args, "group_id");

        let ids: Vec<u32> = instances.iter().map(|i| i.id).collect();
        if ids.is_empty() {
            return Err(Error::internal("group has no instances"));
        }
        let min = *ids.iter().min().expect("ids is non-empty");
        let max = *ids.iter().max().expect("ids is non-empty");
        let is_sorted = ids.windows(2).all(|w| w[0] <= w[1]);
        let is_consecutive = (max - min) as usize == ids.len() - 1;

        if !is_consecutive || !is_sorted {
            if !self.accepts(host_artifacts_path, "instance_nums")? {
                return Err(Error::invalid(
                    "launcher does not accept --instance_nums but the group's \
                     instance ids are not a consecutive run",
                ));
            }
            let joined = ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            args.push(format!("--instance_nums={}", joined));
        } else {
            if ids.len() > 1 {
                if !self.accepts(host_artifacts_path, "num_instances")? {
                    return Err(Error::invalid(
                        "--num_instances is not supported but multi-tenancy requested",
                    ));
                }
                args.push(format!("--num_instances={}", ids.len()));
            }
            // Older launchers predate base_instance_num; emit it only when
            // understood.
            if self
                .accepts(host_artifacts_path, "base_instance_num")
                .unwrap_or(false)
            {
                args.push(format!("--base_instance_num={}", min));
            }
            envs.insert(CUTTLEFISH_INSTANCE_ENV.to_string(), min.to_string());
        }

        if self.accepts(host_artifacts_path, "group_id").unwrap_or(false) {
            args.push(format!("--group_id={}", group_name));
        }

        envs.insert("HOME".to_string(), home.to_string_lossy().into_owned());
        envs.insert(
            ANDROID_HOST_OUT_ENV.to_string(),
            host_artifacts_path.to_string_lossy().into_owned(),
        );
        // Old branches read the soong variable instead.
        envs.insert(
            ANDROID_SOONG_HOST_OUT_ENV.to_string(),
            host_artifacts_path.to_string_lossy().into_owned(),
        );
        envs.insert(
            ANDROID_PRODUCT_OUT_ENV.to_string(),
            product_out_path.to_string(),
        );
        envs.insert(CVD_MARK_ENV.to_string(), "true".to_string());

        Ok(RewrittenCommand { args, envs })
    }

    fn accepts(&self, artifacts: &Path, flag: &str) -> Result<bool> {
        self.introspector.accepts_flag(artifacts, "start", flag)
    }
}

/// Remove every occurrence of a gflags-style value flag (`--name=v`,
/// `-name=v`, `--name v`, `-name v`) and return the values in order.
pub(crate) fn consume_flag_values(args: &mut Vec<String>, name: &str) -> Vec<String> {
    let eq_double = format!("--{}=", name);
    let eq_single = format!("-{}=", name);
    let bare_double = format!("--{}", name);
    let bare_single = format!("-{}", name);

    let mut values = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].clone();
        if let Some(v) = arg
            .strip_prefix(&eq_double)
            .or_else(|| arg.strip_prefix(&eq_single))
        {
            values.push(v.to_string());
            args.remove(i);
        } else if arg == bare_double || arg == bare_single {
            args.remove(i);
            if i < args.len() {
                values.push(args.remove(i));
            }
        } else {
            i += 1;
        }
    }
    values
}

/// Daemon-mode flag policy: `--nodaemon` is rejected, `--daemon[=<v>]`
/// accepts only truthy values, and the caller appends `--daemon=true`
/// afterwards regardless.
pub fn consume_daemon_mode_flag(args: &mut Vec<String>) -> Result<()> {
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].clone();
        let value = if let Some(v) = arg
            .strip_prefix("--daemon=")
            .or_else(|| arg.strip_prefix("-daemon="))
        {
            Some(v)
        } else if arg == "--daemon" || arg == "-daemon" {
            None
        } else if arg == "--nodaemon" || arg == "-nodaemon" {
            return Err(Error::invalid(format!(
                "--nodaemon is not supported by {}",
                POSSIBLE_CMDS
            )));
        } else {
            i += 1;
            continue;
        };

        if let Some(value) = value {
            if value.contains(',') {
                return Err(Error::invalid(format!(
                    "{} had a comma that is not allowed",
                    value
                )));
            }
            let is_true = ["y", "yes", "true"]
                .iter()
                .any(|t| t.eq_ignore_ascii_case(value));
            let is_false = ["n", "no", "false"]
                .iter()
                .any(|t| t.eq_ignore_ascii_case(value));
            if is_false {
                return Err(Error::invalid(format!(
                    "\"--daemon={}\" was given and is not supported by {}",
                    value, POSSIBLE_CMDS
                )));
            }
            if !is_true {
                return Err(Error::invalid(format!(
                    "invalid --daemon option: \"{}\". {} supports only \"--daemon=true\"",
                    value, POSSIBLE_CMDS
                )));
            }
        }
        args.remove(i);
    }
    Ok(())
}

/// Whether the subcommand args ask for launcher help output.
pub fn is_help_request(args: &[String]) -> bool {
    args.iter().any(|a| {
        matches!(
            a.as_str(),
            "--help" | "-help" | "--helpfull" | "-helpfull" | "--helpxml" | "-helpxml"
        )
    })
}

/// Resolve a client-supplied HOME to an absolute path.
///
/// `~` never expands here: the client's home is unknowable on this side, so
/// a leading tilde is rejected outright. Relative paths resolve against the
/// client's working directory, lexically, without following symlinks.
pub fn normalize_home(given: &str, client_pwd: &Path) -> Result<PathBuf> {
    if given.starts_with('~') {
        return Err(Error::invalid("the HOME directory should not start with ~"));
    }
    let path = Path::new(given);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        client_pwd.join(path)
    };
    Ok(lexical_normalize(&absolute))
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
