//! End-to-end handling of one `start` / `launch_cvd` request.
//!
//! The orchestrator wires the planner, rewriter, registry, supervisor and
//! signal bridge together for a single request:
//!
//! ```text
//! PLAN → REGISTER → LAUNCH → WAIT ─success→ POST(symlinks+marks) → DONE
//!             │         │       └─failure→ CLEANUP(force-stop) → UNREGISTER → DONE
//!             │         └─error→ UNREGISTER → DONE
//!             └─conflict→ DONE(error)
//! ```
//!
//! The group is registered *before* the child is spawned and removed only on
//! a terminal launch failure, so a surviving `run_cvd` process always has a
//! registry entry during its lifetime.

pub mod compat;
pub mod host_tool;
pub mod planner;
pub mod rewriter;
pub mod signal_bridge;
pub mod stopper;
pub mod supervisor;

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::registry::{Filter, GroupSpec, InUseState, InstanceRegistry};
use crate::response::{GroupInfo, InstanceInfo, Response, Status};

use host_tool::HostToolIntrospector;
use planner::{plan_group, GroupCreationPlan, PlannerInput};
use rewriter::{ArgEnvRewriter, RewriteInput, RewrittenCommand};
use signal_bridge::SignalBridge;
use stopper::DeviceStopper;
use supervisor::SubprocessSupervisor;

pub const ANDROID_HOST_OUT_ENV: &str = "ANDROID_HOST_OUT";
pub const ANDROID_SOONG_HOST_OUT_ENV: &str = "ANDROID_SOONG_HOST_OUT";
pub const ANDROID_PRODUCT_OUT_ENV: &str = "ANDROID_PRODUCT_OUT";
pub const CUTTLEFISH_INSTANCE_ENV: &str = "CUTTLEFISH_INSTANCE";
/// Marker env the daemon sets on children so they can be found again.
pub const CVD_MARK_ENV: &str = "CVD_MARK";
pub const LAUNCHED_BY_ACLOUD_ENV: &str = "LAUNCHED_BY_ACLOUD";

const SUPPORTED_COMMANDS: [&str; 2] = ["start", "launch_cvd"];

/// One client start request as delivered by the transport.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub command: String,
    pub args: Vec<String>,
    pub selector_args: Vec<String>,
    pub envs: HashMap<String, String>,
    pub working_dir: PathBuf,
}

/// Collaborator handling the synthesized `load` sub-request when the client
/// passed `--config_file`.
pub trait LoadDelegate: Send + Sync {
    fn load(&self, config_file: &str, args: &[String], envs: &HashMap<String, String>) -> Response;
}

/// Ambient filesystem context captured at daemon start.
#[derive(Debug, Clone)]
pub struct OrchestratorContext {
    /// The OS's notion of `$HOME` when the daemon started.
    pub system_home: PathBuf,
    /// Root for acloud-compat workspaces, normally the system temp dir.
    pub tmp_dir: PathBuf,
    /// Directory holding per-instance lockfiles.
    pub lock_dir: PathBuf,
}

pub struct StartOrchestrator {
    registry: Arc<InstanceRegistry>,
    introspector: HostToolIntrospector,
    stopper: Arc<dyn DeviceStopper>,
    load_delegate: Arc<dyn LoadDelegate>,
    context: OrchestratorContext,
}

impl StartOrchestrator {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        stopper: Arc<dyn DeviceStopper>,
        load_delegate: Arc<dyn LoadDelegate>,
        context: OrchestratorContext,
    ) -> Self {
        Self {
            registry,
            introspector: HostToolIntrospector::new(),
            stopper,
            load_delegate,
            context,
        }
    }

    /// Handle one start request end to end. Never panics the transport: all
    /// failures come back as typed responses.
    pub async fn handle(&self, request: StartRequest, out: &mut (dyn Write + Send)) -> Response {
        match self.handle_inner(request, out).await {
            Ok(response) => response,
            Err(e) => Response::from_error(&e),
        }
    }

    async fn handle_inner(
        &self,
        request: StartRequest,
        out: &mut (dyn Write + Send),
    ) -> Result<Response> {
        if !SUPPORTED_COMMANDS.contains(&request.command.as_str()) {
            return Err(Error::invalid(format!(
                "subcommand should be \"start\" or \"launch_cvd\" but is \"{}\"",
                request.command
            )));
        }

        let mut args = request.args.clone();
        if let Some(config_file) = rewriter::consume_flag_values(&mut args, "config_file").pop() {
            info!(config_file = %config_file, "request carries --config_file, delegating to load");
            return Ok(self.load_delegate.load(&config_file, &args, &request.envs));
        }

        if !request.working_dir.is_dir() {
            return Err(Error::Precondition(format!(
                "working directory \"{}\" does not exist",
                request.working_dir.display()
            )));
        }

        let mut envs = request.envs.clone();
        match envs.get("HOME").cloned() {
            Some(home) if home.is_empty() => {
                envs.remove("HOME");
            }
            Some(home) => {
                let normalized = rewriter::normalize_home(&home, &request.working_dir)?;
                envs.insert("HOME".to_string(), normalized.to_string_lossy().into_owned());
            }
            None => {}
        }
        let host_artifacts = envs
            .get(ANDROID_HOST_OUT_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| {
                Error::Precondition(format!("{} is not given", ANDROID_HOST_OUT_ENV))
            })?;
        let bin_name = self.introspector.exec_base_name(&host_artifacts, "start")?;

        if rewriter::is_help_request(&args) {
            return self
                .run_help(&host_artifacts, &bin_name, &args, &envs, &request)
                .await;
        }

        rewriter::consume_daemon_mode_flag(&mut args)?;
        args.push("--daemon=true".to_string());

        let mut plan = plan_group(PlannerInput {
            subcmd_args: &args,
            envs: &envs,
            selector_args: &request.selector_args,
            system_home: &self.context.system_home,
            client_pwd: &request.working_dir,
            lock_dir: &self.context.lock_dir,
        })?;

        let instance_records = plan.instance_records();
        let rewriter = ArgEnvRewriter {
            introspector: &self.introspector,
        };
        let rewritten = rewriter.rewrite(RewriteInput {
            args: plan.args.clone(),
            envs: plan.envs.clone(),
            instances: &instance_records,
            group_name: &plan.group_name,
            home: &plan.home,
            host_artifacts_path: &plan.host_artifacts_path,
            product_out_path: &plan.product_out_path,
        })?;

        // Reserve the identity before any child exists (conflicts and
        // validation errors return here with no side effects).
        self.registry.add_group(GroupSpec {
            name: plan.group_name.clone(),
            home_directory: plan.home.clone(),
            host_artifacts_path: plan.host_artifacts_path.clone(),
            product_out_path: plan.product_out_path.clone(),
            is_default_group: plan.is_default_group,
            instances: instance_records,
        })?;

        let supervisor = Arc::new(SubprocessSupervisor::new());
        let bridge = match SignalBridge::arm() {
            Ok(bridge) => bridge,
            Err(e) => {
                self.rollback(&plan.group_name);
                return Err(e);
            }
        };
        let interrupter = spawn_interrupter(bridge.read_fd(), Arc::clone(&supervisor));

        let launch_result = self
            .launch_device(&supervisor, &plan, &bin_name, &rewritten, &request)
            .await;

        // The rollback, if any, must finish while the bridge is still armed:
        // a signal arriving mid-cleanup lands in the pipe instead of the
        // default disposition killing the daemon.
        let launch_result = match launch_result {
            Ok(response) if response.status == Status::Ok => Ok(response),
            Ok(response) => {
                self.rollback(&plan.group_name);
                Ok(response)
            }
            Err(e) => {
                self.rollback(&plan.group_name);
                Err(e)
            }
        };

        // Closing the write end lets the interrupter observe EOF and exit.
        bridge.disarm();
        let _ = interrupter.await;

        let response = launch_result?;
        if response.status != Status::Ok {
            return Ok(response);
        }

        if plan.is_default_group {
            if let Err(e) = compat::create_symlinks(&plan, &self.context.system_home) {
                error!(error = %e, "failed to create symlinks for default group");
            }
        }
        mark_lockfiles_in_use(&mut plan);
        self.write_group_status(&plan.group_name, out)?;

        Ok(fill_group_info(response, &plan))
    }

    /// `--help` launches the tool and forwards its exit status with no
    /// registry mutation.
    async fn run_help(
        &self,
        host_artifacts: &Path,
        bin_name: &str,
        args: &[String],
        envs: &HashMap<String, String>,
        request: &StartRequest,
    ) -> Result<Response> {
        let bin_path = host_artifacts.join("bin").join(bin_name);
        show_launch_command(&bin_path, args, envs);
        let supervisor = SubprocessSupervisor::new();
        let child = build_command(&bin_path, args, envs, &request.working_dir).spawn()?;
        supervisor.setup(child).await?;
        let exit = supervisor.wait().await?;
        Ok(Response::from_exit(exit))
    }

    async fn launch_device(
        &self,
        supervisor: &SubprocessSupervisor,
        plan: &GroupCreationPlan,
        bin_name: &str,
        rewritten: &RewrittenCommand,
        request: &StartRequest,
    ) -> Result<Response> {
        let bin_path = plan.host_artifacts_path.join("bin").join(bin_name);
        show_launch_command(&bin_path, &rewritten.args, &rewritten.envs);

        let child =
            build_command(&bin_path, &rewritten.args, &rewritten.envs, &request.working_dir)
                .spawn()?;
        supervisor.setup(child).await?;

        if let Err(e) = compat::acloud_compat_actions(plan, &rewritten.envs, &self.context.tmp_dir)
        {
            error!(error = %e, "acloud compatibility actions failed; continuing, they are minor");
        }

        let exit = supervisor.wait().await?;
        if !exit.success() {
            info!(%exit, "device launch failed, cleaning up");
            // run_cvd processes may still be running in the background; the
            // order of stop-then-unregister must be kept.
            let first_id = plan
                .first_instance_id()
                .ok_or_else(|| Error::internal("plan has no instances"))?;
            if let Err(e) = self.stopper.force_stop_group(first_id) {
                // Non-Ok responses from here still flow through the caller's
                // rollback branch before the bridge is torn down.
                return Ok(Response::with_status(Status::Internal, e.to_string()));
            }
            return Err(Error::ChildFailed(exit));
        }
        Ok(Response::from_exit(exit))
    }

    fn rollback(&self, group_name: &str) {
        match self.registry.remove_group(group_name) {
            Ok(true) => {}
            Ok(false) => warn!(group = group_name, "rollback found no group to remove"),
            Err(e) => {
                error!(group = group_name, error = %e, "failed to roll back group registration")
            }
        }
    }

    fn write_group_status(&self, group_name: &str, out: &mut (dyn Write + Send)) -> Result<()> {
        let groups = self.registry.find_groups(&Filter::group_name(group_name))?;
        let group = groups.first().ok_or_else(|| {
            Error::internal(format!("group \"{}\" disappeared after launch", group_name))
        })?;
        let json = serde_json::to_string_pretty(group)
            .map_err(|e| Error::internal(format!("failed to serialize group status: {}", e)))?;
        out.write_all(json.as_bytes())?;
        out.write_all(b"\n")?;
        Ok(())
    }
}

/// Dedicated worker turning signal-pipe bytes into child interrupts. Ends
/// cleanly when the pipe's write end closes.
fn spawn_interrupter(
    read_fd: RawFd,
    supervisor: Arc<SubprocessSupervisor>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut pipe = unsafe { File::from_raw_fd(read_fd) };
        let mut buf = [0u8; std::mem::size_of::<libc::c_int>()];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => return,
                // Interrupt regardless of which signal arrived.
                Ok(_) => supervisor.interrupt(),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "failed to read from signal pipe");
                    return;
                }
            }
        }
    })
}

fn build_command(
    bin: &Path,
    args: &[String],
    envs: &HashMap<String, String>,
    working_dir: &Path,
) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(bin);
    cmd.args(args)
        .env_clear()
        .envs(envs)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        // The daemon's own stdout carries the group status JSON, so all
        // launcher output goes to stderr.
        .stdout(stderr_stdio())
        .stderr(Stdio::inherit());
    cmd
}

fn stderr_stdio() -> Stdio {
    let fd = unsafe { libc::dup(libc::STDERR_FILENO) };
    if fd < 0 {
        Stdio::inherit()
    } else {
        unsafe { Stdio::from_raw_fd(fd) }
    }
}

fn show_launch_command(bin: &Path, args: &[String], envs: &HashMap<String, String>) {
    let interesting = [
        "HOME",
        ANDROID_HOST_OUT_ENV,
        ANDROID_SOONG_HOST_OUT_ENV,
        ANDROID_PRODUCT_OUT_ENV,
        CUTTLEFISH_INSTANCE_ENV,
    ];
    let mut line = String::new();
    for name in interesting {
        if let Some(value) = envs.get(name) {
            line.push_str(&format!("{}=\"{}\" ", name, value));
        }
    }
    line.push_str(&bin.to_string_lossy());
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    info!(command = %line, "launcher command");
}

fn mark_lockfiles_in_use(plan: &mut GroupCreationPlan) {
    for instance in &mut plan.instances {
        if let Some(lockfile) = instance.lockfile.as_mut() {
            if let Err(e) = lockfile.mark(InUseState::InUse) {
                error!(id = instance.id, error = %e, "failed to mark instance lockfile in-use");
            }
        }
    }
}

fn fill_group_info(mut response: Response, plan: &GroupCreationPlan) -> Response {
    response.group_info = Some(GroupInfo {
        group_name: plan.group_name.clone(),
        home_directories: vec![plan.home.to_string_lossy().into_owned()],
        instances: plan
            .instances
            .iter()
            .map(|i| InstanceInfo {
                name: i.name.clone(),
                instance_id: i.id,
            })
            .collect(),
    });
    response
}
