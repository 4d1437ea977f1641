//! cvdd: local controller for virtual-device instance groups.
//!
//! A thin CLI over the daemon core. `start` runs one full orchestration
//! (plan, register, launch, supervise, compensate) while `list`, `remove`
//! and `clear` are direct registry operations standing in for the daemon's
//! RPC surface.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use cvdd::logging;
use cvdd::paths::{self, DaemonPaths};
use cvdd::registry::InstanceRegistry;
use cvdd::response::{Response, Status};
use cvdd::start::stopper::RunCvdProcessManager;
use cvdd::start::{LoadDelegate, OrchestratorContext, StartOrchestrator, StartRequest};

/// Local controller for virtual-device instance groups
#[derive(Parser, Debug)]
#[command(name = "cvdd", version, about = "Local controller for virtual-device instance groups")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch a new instance group and register it
    Start {
        /// Group name hint
        #[arg(long)]
        group_name: Option<String>,

        /// Comma-separated per-instance names
        #[arg(long)]
        instance_name: Option<String>,

        /// Arguments forwarded to the device launcher
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        launcher_args: Vec<String>,
    },
    /// Print all registered groups as JSON
    List,
    /// Remove one group from the registry by name
    Remove { name: String },
    /// Clear the whole registry
    Clear,
}

/// The `load` subcommand lives in the full daemon; this CLI only reports
/// that delegation target as unavailable.
struct LoadUnsupported;

impl LoadDelegate for LoadUnsupported {
    fn load(
        &self,
        config_file: &str,
        _args: &[String],
        _envs: &HashMap<String, String>,
    ) -> Response {
        Response::with_status(
            Status::FailedPrecondition,
            format!(
                "--config_file={}: loading from a config file is served by the \
                 daemon's load handler, which is not wired into this CLI",
                config_file
            ),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let daemon_paths =
        DaemonPaths::resolve().context("cannot resolve the state directory; is HOME set?")?;
    let _log_guard = logging::init(&daemon_paths.logs);
    daemon_paths.ensure()?;

    let registry = Arc::new(InstanceRegistry::new(daemon_paths.registry_file.clone()));

    match cli.command {
        Commands::Start {
            group_name,
            instance_name,
            launcher_args,
        } => {
            let context = OrchestratorContext {
                system_home: paths::system_home().context("HOME is not set")?,
                tmp_dir: std::env::temp_dir(),
                lock_dir: daemon_paths.lock_dir.clone(),
            };
            let orchestrator = StartOrchestrator::new(
                registry,
                Arc::new(RunCvdProcessManager),
                Arc::new(LoadUnsupported),
                context,
            );

            let mut selector_args = Vec::new();
            if let Some(name) = group_name {
                selector_args.push(format!("--group_name={}", name));
            }
            if let Some(names) = instance_name {
                selector_args.push(format!("--instance_name={}", names));
            }

            let request = StartRequest {
                command: "start".to_string(),
                args: launcher_args,
                selector_args,
                envs: std::env::vars().collect(),
                working_dir: std::env::current_dir()?,
            };

            let mut stdout = std::io::stdout();
            let response = orchestrator.handle(request, &mut stdout).await;
            finish(response)
        }
        Commands::List => {
            let groups = registry.list_groups()?;
            let listing = serde_json::json!({ "Groups": groups });
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(())
        }
        Commands::Remove { name } => {
            if registry.remove_group(&name)? {
                eprintln!("removed group \"{}\"", name);
                Ok(())
            } else {
                eprintln!("no group named \"{}\"", name);
                std::process::exit(1);
            }
        }
        Commands::Clear => {
            let cleared = registry.clear()?;
            eprintln!("cleared {} group(s)", cleared.len());
            Ok(())
        }
    }
}

fn finish(response: Response) -> Result<()> {
    match response.status {
        Status::Ok => Ok(()),
        status => {
            eprintln!("cvd start failed ({:?}): {}", status, response.message);
            std::process::exit(1);
        }
    }
}
