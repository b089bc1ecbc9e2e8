use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use model::Project;
use tokio_util::sync::CancellationToken;

#[macro_use]
extern crate tracing;

mod cli;
mod config;
mod convert;
mod engine;
mod error;
mod graph;
mod labels;
mod lifecycle;
mod observe;
mod ops;
mod plan;
mod progress;

use cli::Command;
use engine::{DockerEngine, DryRunEngine, Engine, Guarded};
use ops::{Controller, LogsOptions, Settings};
use progress::Progress;

const PROJECT_FILE_CANDIDATES: [&str; 4] = [
  "compose.yaml",
  "compose.yml",
  "docker-compose.yaml",
  "docker-compose.yml",
];

fn project_file() -> anyhow::Result<PathBuf> {
  if let Some(file) = &config::convoy_args().file {
    return Ok(file.clone());
  }
  for candidate in PROJECT_FILE_CANDIDATES {
    let path = PathBuf::from(candidate);
    if path.is_file() {
      return Ok(path);
    }
  }
  Err(anyhow::anyhow!(
    "No project file found. Specify one with --file."
  ))
}

/// Load and normalize the project, applying the name override from
/// flags or environment.
async fn load_project() -> anyhow::Result<Project> {
  let path = project_file()?;
  let mut project = Project::from_yaml_file(&path).await?;
  if let Some(name) = &config::convoy_config().project_name {
    project.name = name.clone();
    project.validate()?;
  }
  Ok(project)
}

/// The project name for verbs that can work from labels alone.
async fn project_name() -> anyhow::Result<String> {
  if let Some(name) = &config::convoy_config().project_name {
    return Ok(name.clone());
  }
  let project = load_project().await.context(
    "A project name is required: pass --project-name or a project file",
  )?;
  Ok(project.name)
}

fn build_engine() -> anyhow::Result<Arc<dyn Engine>> {
  let config = config::convoy_config();
  let docker: Arc<dyn Engine> =
    Arc::new(DockerEngine::connect()?);
  let guarded: Arc<dyn Engine> = Arc::new(Guarded::new(
    docker,
    config.engine_limit,
    config.engine_deadline,
  ));
  if config::convoy_args().dry_run {
    Ok(Arc::new(DryRunEngine::new(guarded)))
  } else {
    Ok(guarded)
  }
}

async fn app(cancel: CancellationToken) -> anyhow::Result<i32> {
  let args = config::convoy_args();
  let config = config::convoy_config();

  let (progress, progress_task) = Progress::init(
    args.progress.unwrap_or_default(),
  );
  let controller = Controller::new(
    build_engine()?,
    progress.clone(),
    cancel.clone(),
    Settings {
      compatibility: config.compatibility,
      parallel_limit: config.parallel_limit,
      ignore_orphans: config.ignore_orphans,
      default_platform: config.default_platform.clone(),
      ..Default::default()
    },
  );

  let code = match &args.command {
    Command::Up(up) => {
      let project = load_project().await?;
      let options = up.to_options()?;
      let detach = options.detach;
      let attach = options.attach_services.clone();
      controller.up(&project, options).await?;
      if !detach {
        controller
          .logs(
            &project.name,
            LogsOptions {
              services: attach,
              follow: true,
              ..Default::default()
            },
          )
          .await?;
      }
      0
    }
    Command::Create(up) => {
      let project = load_project().await?;
      controller.create(&project, up.to_options()?).await?;
      0
    }
    Command::Down(down) => {
      let name = project_name().await?;
      let model = load_project().await.ok();
      let summary = controller
        .down(&name, model.as_ref(), down.to_options())
        .await?;
      info!(
        "Removed {} containers, {} networks, {} volumes, {} images",
        summary.containers,
        summary.networks,
        summary.volumes,
        summary.images
      );
      0
    }
    Command::Start(start) => {
      let project = load_project().await?;
      controller.start(&project, &start.services).await?;
      0
    }
    Command::Stop(stop) => {
      let project = load_project().await?;
      controller
        .stop(
          &project,
          &stop.services,
          stop.timeout.map(std::time::Duration::from_secs),
        )
        .await?;
      0
    }
    Command::Restart(restart) => {
      let project = load_project().await?;
      controller
        .restart(
          &project,
          &restart.services,
          restart.timeout.map(std::time::Duration::from_secs),
        )
        .await?;
      0
    }
    Command::Kill(kill) => {
      let project = load_project().await?;
      controller
        .kill(&project, &kill.services, kill.signal.clone())
        .await?;
      0
    }
    Command::Rm(rm) => {
      let project = load_project().await?;
      let removed = controller
        .rm(&project, &rm.services, rm.to_options())
        .await?;
      info!("Removed {removed} containers");
      0
    }
    Command::Scale(scale) => {
      let project = load_project().await?;
      let scales = cli::parse_scales(&scale.scales)?;
      controller.scale(&project, scales).await?;
      0
    }
    Command::Run(run) => {
      let project = load_project().await?;
      let code = controller
        .run(&project, &run.service, run.to_options()?)
        .await?;
      code.clamp(0, 255) as i32
    }
    Command::Ps => {
      let name = project_name().await?;
      let rows = controller.ps(&name).await?;
      let mut table = comfy_table::Table::new();
      table.set_header(["NAME", "SERVICE", "STATE", "IMAGE"]);
      for row in rows {
        table.add_row([
          row.name,
          row.service,
          row.state,
          row.image,
        ]);
      }
      println!("{table}");
      0
    }
    Command::Logs(logs) => {
      let name = project_name().await?;
      controller.logs(&name, logs.to_options()).await?;
      0
    }
    Command::Pause(pause) => {
      let project = load_project().await?;
      controller.pause(&project, &pause.services).await?;
      0
    }
    Command::Unpause(unpause) => {
      let project = load_project().await?;
      controller.unpause(&project, &unpause.services).await?;
      0
    }
  };

  // Let the writer drain before the process exits.
  drop(controller);
  drop(progress);
  let _ = progress_task.await;

  Ok(code)
}

#[tokio::main]
async fn main() {
  dotenvy::dotenv().ok();

  // Parses args and environment once; exits on bad flags.
  let config = config::convoy_config();
  if let Err(e) = logger::init(&config.logging) {
    eprintln!("Failed to init logger | {e:#}");
    std::process::exit(1);
  }

  let cancel = CancellationToken::new();
  tokio::spawn(watch_signals(cancel.clone()));

  let code = match app(cancel).await {
    Ok(code) => code,
    Err(e) => {
      error!("{e:#}");
      1
    }
  };
  std::process::exit(code);
}

/// First signal cancels the run gracefully; a second one exits
/// immediately.
async fn watch_signals(cancel: CancellationToken) {
  let mut term = match tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  ) {
    Ok(term) => term,
    Err(e) => {
      error!("Failed to install SIGTERM handler | {e}");
      return;
    }
  };

  tokio::select! {
    _ = tokio::signal::ctrl_c() => {},
    _ = term.recv() => {},
  }
  info!("Interrupt received, canceling. Interrupt again to force.");
  cancel.cancel();

  tokio::select! {
    _ = tokio::signal::ctrl_c() => {},
    _ = term.recv() => {},
  }
  error!("Forced exit");
  std::process::exit(130);
}
