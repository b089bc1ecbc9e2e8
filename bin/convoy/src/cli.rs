use std::{path::PathBuf, time::Duration};

use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use logger::LogLevel;
use model::PullPolicy;

use crate::{
  ops::{
    DownOptions, LogsOptions, RmOptions, RmiPolicy, RunOptions,
    UpOptions,
  },
  progress::ProgressMode,
};

#[derive(Debug, Parser)]
#[command(
  name = "convoy",
  about = "Define and run multi-container applications",
  version
)]
pub struct CliArgs {
  /// Project file (default: compose.yaml / compose.yml in the
  /// working directory).
  #[arg(short = 'f', long = "file", global = true)]
  pub file: Option<PathBuf>,

  /// Project name override.
  #[arg(short = 'p', long = "project-name", global = true)]
  pub project_name: Option<String>,

  /// Record Engine mutations without issuing them.
  #[arg(long, global = true)]
  pub dry_run: bool,

  /// Use the legacy `_` container name separator.
  #[arg(long, global = true)]
  pub compatibility: bool,

  /// Progress output style.
  #[arg(long, global = true)]
  pub progress: Option<ProgressMode>,

  #[arg(long, global = true)]
  pub log_level: Option<LogLevel>,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
  /// Create and start the project's containers
  Up(UpArgs),
  /// Stop and remove the project's containers
  Down(DownArgs),
  /// Start existing containers
  Start(ServicesArgs),
  /// Stop running containers without removing them
  Stop(TimeoutArgs),
  /// Restart containers
  Restart(TimeoutArgs),
  /// Create containers without starting them
  Create(UpArgs),
  /// Force-stop containers
  Kill(KillArgs),
  /// Remove stopped containers
  Rm(RmArgs),
  /// Set replica counts and converge
  Scale(ScaleArgs),
  /// Run a one-off command on a service
  Run(RunArgs),
  /// List the project's containers
  Ps,
  /// Stream container logs
  Logs(LogsArgs),
  /// Pause running containers
  Pause(ServicesArgs),
  /// Unpause paused containers
  Unpause(ServicesArgs),
}

#[derive(Debug, Args)]
pub struct ServicesArgs {
  pub services: Vec<String>,
}

#[derive(Debug, Args)]
pub struct TimeoutArgs {
  pub services: Vec<String>,
  /// Shutdown grace period in seconds.
  #[arg(short = 't', long = "timeout")]
  pub timeout: Option<u64>,
}

#[derive(Debug, Args)]
pub struct KillArgs {
  pub services: Vec<String>,
  /// Signal to send (default SIGKILL).
  #[arg(short = 's', long = "signal")]
  pub signal: Option<String>,
}

#[derive(Debug, Args)]
pub struct UpArgs {
  pub services: Vec<String>,

  /// Run containers in the background.
  #[arg(short = 'd', long)]
  pub detach: bool,

  /// Wait for services to be running and healthy.
  #[arg(long)]
  pub wait: bool,

  /// Seconds to wait before giving up.
  #[arg(long = "wait-timeout")]
  pub wait_timeout: Option<u64>,

  /// Remove containers for services no longer in the project.
  #[arg(long = "remove-orphans")]
  pub remove_orphans: bool,

  /// Recreate containers even if unchanged.
  #[arg(long = "force-recreate")]
  pub force_recreate: bool,

  /// Never recreate existing containers.
  #[arg(long = "no-recreate", conflicts_with = "force_recreate")]
  pub no_recreate: bool,

  /// Don't start linked services.
  #[arg(long = "no-deps")]
  pub no_deps: bool,

  /// Don't start the containers after creating them.
  #[arg(long = "no-start")]
  pub no_start: bool,

  /// Recreate anonymous volumes instead of adopting them.
  #[arg(short = 'V', long = "renew-anon-volumes")]
  pub renew_anon_volumes: bool,

  /// Pull without printing progress.
  #[arg(long = "quiet-pull")]
  pub quiet_pull: bool,

  /// Scale overrides, `SERVICE=N`.
  #[arg(long = "scale")]
  pub scale: Vec<String>,

  /// Attach only these services' logs.
  #[arg(long = "attach")]
  pub attach: Vec<String>,

  /// Pull policy override: always, missing, never, build.
  #[arg(long = "pull")]
  pub pull: Option<String>,

  /// Shutdown grace period override in seconds.
  #[arg(short = 't', long = "timeout")]
  pub timeout: Option<u64>,
}

impl UpArgs {
  pub fn to_options(&self) -> anyhow::Result<UpOptions> {
    Ok(UpOptions {
      services: self.services.clone(),
      detach: self.detach,
      wait: self.wait,
      wait_timeout: self.wait_timeout.map(Duration::from_secs),
      remove_orphans: self.remove_orphans
        || crate::config::convoy_config().remove_orphans,
      force_recreate: self.force_recreate,
      no_recreate: self.no_recreate,
      no_deps: self.no_deps,
      no_start: self.no_start,
      renew_anon_volumes: self.renew_anon_volumes,
      quiet_pull: self.quiet_pull,
      scale: parse_scales(&self.scale)?,
      attach_services: self.attach.clone(),
      pull: self
        .pull
        .as_deref()
        .map(parse_pull_policy)
        .transpose()?,
      timeout: self.timeout.map(Duration::from_secs),
    })
  }
}

#[derive(Debug, Args)]
pub struct DownArgs {
  /// Remove containers for services no longer in the project.
  #[arg(long = "remove-orphans")]
  pub remove_orphans: bool,

  /// Remove named volumes declared by the project.
  #[arg(short = 'v', long)]
  pub volumes: bool,

  /// Remove images used by the project.
  #[arg(long)]
  pub rmi: Option<RmiPolicy>,

  /// Shutdown grace period in seconds.
  #[arg(short = 't', long = "timeout")]
  pub timeout: Option<u64>,
}

impl DownArgs {
  pub fn to_options(&self) -> DownOptions {
    DownOptions {
      remove_orphans: self.remove_orphans
        || crate::config::convoy_config().remove_orphans,
      volumes: self.volumes,
      rmi: self.rmi,
      timeout: self.timeout.map(Duration::from_secs),
    }
  }
}

#[derive(Debug, Args)]
pub struct RmArgs {
  pub services: Vec<String>,

  /// Remove running containers too.
  #[arg(short = 'f', long)]
  pub force: bool,

  /// Also remove anonymous volumes.
  #[arg(short = 'v', long)]
  pub volumes: bool,
}

impl RmArgs {
  pub fn to_options(&self) -> RmOptions {
    RmOptions {
      force: self.force,
      volumes: self.volumes,
    }
  }
}

#[derive(Debug, Args)]
pub struct ScaleArgs {
  /// `SERVICE=N` pairs.
  #[arg(required = true)]
  pub scales: Vec<String>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
  pub service: String,

  /// Command and arguments to run.
  #[arg(trailing_var_arg = true)]
  pub command: Vec<String>,

  /// Return immediately instead of waiting for exit.
  #[arg(short = 'd', long)]
  pub detach: bool,

  /// Don't start linked services.
  #[arg(long = "no-deps")]
  pub no_deps: bool,

  /// Remove the container after it exits.
  #[arg(long = "rm")]
  pub remove: bool,

  /// Assign a name to the container.
  #[arg(long)]
  pub name: Option<String>,

  /// Pull policy override.
  #[arg(long = "pull")]
  pub pull: Option<String>,
}

impl RunArgs {
  pub fn to_options(&self) -> anyhow::Result<RunOptions> {
    Ok(RunOptions {
      command: if self.command.is_empty() {
        None
      } else {
        Some(self.command.clone())
      },
      detach: self.detach,
      no_deps: self.no_deps,
      remove: self.remove,
      name: self.name.clone(),
      pull: self
        .pull
        .as_deref()
        .map(parse_pull_policy)
        .transpose()?,
    })
  }
}

#[derive(Debug, Args)]
pub struct LogsArgs {
  pub services: Vec<String>,

  /// Follow log output.
  #[arg(short = 'f', long)]
  pub follow: bool,

  /// Number of lines from the end of each log.
  #[arg(long)]
  pub tail: Option<String>,

  /// Show timestamps.
  #[arg(short = 't', long)]
  pub timestamps: bool,
}

impl LogsArgs {
  pub fn to_options(&self) -> LogsOptions {
    LogsOptions {
      services: self.services.clone(),
      follow: self.follow,
      tail: self.tail.clone(),
      timestamps: self.timestamps,
    }
  }
}

pub fn parse_scales(
  entries: &[String],
) -> anyhow::Result<Vec<(String, u32)>> {
  entries
    .iter()
    .map(|entry| {
      let (service, count) =
        entry.split_once('=').with_context(|| {
          format!(
            "invalid scale '{entry}', expected SERVICE=N"
          )
        })?;
      let count: u32 = count.parse().with_context(|| {
        format!("invalid replica count in '{entry}'")
      })?;
      Ok((service.to_string(), count))
    })
    .collect()
}

fn parse_pull_policy(raw: &str) -> anyhow::Result<PullPolicy> {
  match raw {
    "always" => Ok(PullPolicy::Always),
    "missing" | "if_not_present" => Ok(PullPolicy::Missing),
    "never" => Ok(PullPolicy::Never),
    "build" => Ok(PullPolicy::Build),
    _ => Err(anyhow!(
      "invalid pull policy '{raw}', expected always | missing | never | build"
    )),
  }
}
