use std::{sync::OnceLock, time::Duration};

use clap::Parser;
use logger::{LogConfig, LogLevel, StdioLogMode};
use serde::Deserialize;

use crate::cli::CliArgs;

pub fn convoy_args() -> &'static CliArgs {
  static CONVOY_ARGS: OnceLock<CliArgs> = OnceLock::new();
  CONVOY_ARGS.get_or_init(CliArgs::parse)
}

/// Environment the controller observes. The `COMPOSE_` names are
/// kept for interoperability with other compose tooling.
#[derive(Debug, Default, Deserialize)]
struct Env {
  compose_project_name: Option<String>,
  compose_parallel_limit: Option<usize>,
  compose_ignore_orphans: Option<String>,
  compose_remove_orphans: Option<String>,
  compose_compatibility: Option<String>,
  compose_default_platform: Option<String>,
  /// Cap on concurrent Engine calls across the whole run.
  convoy_engine_limit: Option<usize>,
  /// Per-call Engine deadline in seconds.
  convoy_engine_deadline: Option<u64>,
  convoy_log_level: Option<LogLevel>,
  convoy_log_json: Option<String>,
}

#[derive(Debug)]
pub struct ConvoyConfig {
  pub project_name: Option<String>,
  pub parallel_limit: Option<usize>,
  pub ignore_orphans: bool,
  pub remove_orphans: bool,
  pub compatibility: bool,
  pub default_platform: Option<String>,
  pub engine_limit: Option<usize>,
  pub engine_deadline: Duration,
  pub logging: LogConfig,
}

pub fn convoy_config() -> &'static ConvoyConfig {
  static CONVOY_CONFIG: OnceLock<ConvoyConfig> = OnceLock::new();
  CONVOY_CONFIG.get_or_init(|| {
    let env = match envy::from_env::<Env>() {
      Ok(env) => env,
      Err(e) => {
        eprintln!("Invalid environment configuration | {e}");
        Env::default()
      }
    };
    let args = convoy_args();
    ConvoyConfig {
      project_name: args
        .project_name
        .clone()
        .or(env.compose_project_name),
      parallel_limit: env.compose_parallel_limit,
      ignore_orphans: truthy(env.compose_ignore_orphans),
      remove_orphans: truthy(env.compose_remove_orphans),
      compatibility: args.compatibility
        || truthy(env.compose_compatibility),
      default_platform: env.compose_default_platform,
      engine_limit: env.convoy_engine_limit,
      engine_deadline: Duration::from_secs(
        env.convoy_engine_deadline.unwrap_or(10),
      ),
      logging: LogConfig {
        level: args
          .log_level
          .or(env.convoy_log_level)
          .unwrap_or_default(),
        stdio: if truthy(env.convoy_log_json) {
          StdioLogMode::Json
        } else {
          StdioLogMode::Standard
        },
        pretty: false,
        ansi: true,
        location: false,
      },
    }
  })
}

fn truthy(value: Option<String>) -> bool {
  value
    .map(|v| {
      matches!(
        v.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
      )
    })
    .unwrap_or(false)
}
