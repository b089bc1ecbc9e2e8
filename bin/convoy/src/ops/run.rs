use anyhow::Context;
use model::{Project, PullPolicy};

use crate::{
  convert::{ContainerSpecArgs, container_spec},
  error::{ConvergeError, ErrorKind},
  labels,
};

use super::{Controller, UpOptions};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
  /// Overrides the service command.
  pub command: Option<Vec<String>>,
  /// Return immediately instead of waiting for exit.
  pub detach: bool,
  /// Skip converging the service's dependencies first.
  pub no_deps: bool,
  /// Remove the container (and its anonymous volumes) after exit.
  pub remove: bool,
  /// Fixed container name instead of the generated one-off name.
  pub name: Option<String>,
  pub pull: Option<PullPolicy>,
}

impl Controller {
  /// Create and start a one-off container for a single service,
  /// returning its exit code (0 when detached). The container is
  /// labeled `oneoff=true` and never participates in convergence.
  #[instrument(
    "Run",
    skip_all,
    fields(project = project.name, service = service_name)
  )]
  pub async fn run(
    &self,
    project: &Project,
    service_name: &str,
    options: RunOptions,
  ) -> anyhow::Result<i64> {
    project.validate().map_err(|e| {
      ConvergeError::new(
        ErrorKind::Validation,
        project.name.clone(),
        e,
      )
    })?;
    let service = project.service(service_name)?;

    self.ensure_resources(project).await?;

    if !options.no_deps {
      let deps: Vec<String> = service
        .dependencies()
        .into_iter()
        .map(|(name, _)| name)
        .filter(|name| project.services.contains_key(name))
        .collect();
      if !deps.is_empty() {
        self
          .up(
            project,
            UpOptions {
              services: deps,
              ..Default::default()
            },
          )
          .await
          .context("Failed to start dependencies")?;
      }
    }

    let image_id = self
      .resolve_image(service, options.pull, false)
      .await?;
    let hash =
      labels::config_hash(project, service, Some(&image_id));

    let name = options.name.clone().unwrap_or_else(|| {
      labels::oneoff_name(
        &project.name,
        service_name,
        self.settings.compatibility,
      )
    });
    let id = format!("Container {name}");

    let mut spec = container_spec(ContainerSpecArgs {
      project,
      service,
      index: 1,
      config_hash: &hash,
      oneoff: true,
      compatibility: self.settings.compatibility,
      adopted_binds: &[],
      command_override: options.command.clone(),
      default_platform: self
        .settings
        .default_platform
        .as_deref(),
    });
    // One-offs never publish the service's ports.
    spec.ports.clear();
    let secondary: Vec<_> =
      spec.endpoints.iter().skip(1).cloned().collect();

    self
      .progress
      .working(&id, Some(service_name), "create", "Creating");
    self
      .engine
      .create_container(&name, spec)
      .await
      .map_err(|e| {
        ConvergeError::new(ErrorKind::from(&e), &name, e.clone())
      })?;
    for endpoint in secondary {
      self
        .engine
        .connect_network(&endpoint.network, &name, endpoint.clone())
        .await
        .map_err(|e| {
          ConvergeError::new(
            ErrorKind::from(&e),
            &endpoint.network,
            e.clone(),
          )
        })?;
    }

    self
      .progress
      .working(&id, Some(service_name), "start", "Starting");
    self.engine.start_container(&name).await.map_err(|e| {
      ConvergeError::new(ErrorKind::StartFailed, &name, e.clone())
    })?;
    self
      .progress
      .done(&id, Some(service_name), "start", "Started");

    if options.detach {
      return Ok(0);
    }

    let code =
      self.engine.wait_container(&name).await.map_err(|e| {
        ConvergeError::new(ErrorKind::from(&e), &name, e.clone())
      })?;
    self.progress.done(
      &id,
      Some(service_name),
      "exit",
      format!("Exited ({code})"),
    );

    if options.remove {
      match self.engine.remove_container(&name, true, true).await
      {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => {
          warn!("failed to remove one-off container {name} | {e}")
        }
      }
    }

    Ok(code)
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use super::*;
  use crate::{
    engine::{ContainerState, fake::FakeEngine},
    ops::Settings,
    progress::Progress,
  };
  use tokio_util::sync::CancellationToken;

  fn controller(engine: Arc<FakeEngine>) -> Controller {
    Controller::new(
      engine,
      Progress::sink(),
      CancellationToken::new(),
      Settings {
        settle: Duration::from_millis(5),
        stop_slack: Duration::from_millis(50),
        ..Default::default()
      },
    )
  }

  fn demo() -> Project {
    Project::from_yaml(
      "
name: demo
services:
  db:
    image: pg
    healthcheck:
      test: pg_isready
  web:
    image: nginx
    depends_on:
      db:
        condition: service_healthy
",
    )
    .unwrap()
  }

  fn engine_with_images() -> Arc<FakeEngine> {
    let engine = Arc::new(FakeEngine::new());
    engine.add_image("pg", "sha256:pg");
    engine.add_image("nginx", "sha256:nginx");
    engine
  }

  #[tokio::test]
  async fn run_starts_deps_and_returns_exit_code() {
    let engine = engine_with_images();
    engine.exit_on_start("demo-web-run-1", 0);
    let controller = controller(engine.clone());
    let project = demo();

    let code = controller
      .run(
        &project,
        "web",
        RunOptions {
          name: Some(String::from("demo-web-run-1")),
          command: Some(vec![String::from("true")]),
          ..Default::default()
        },
      )
      .await
      .unwrap();

    assert_eq!(code, 0);
    // Dependency converged first.
    assert_eq!(
      engine.container("demo-db-1").unwrap().state,
      ContainerState::Running
    );
    let oneoff = engine.container("demo-web-run-1").unwrap();
    assert_eq!(oneoff.labels[labels::ONEOFF_LABEL], "true");
  }

  #[tokio::test]
  async fn run_with_remove_cleans_up() {
    let engine = engine_with_images();
    engine.exit_on_start("demo-web-run-2", 0);
    let controller = controller(engine.clone());
    let project = demo();

    let code = controller
      .run(
        &project,
        "web",
        RunOptions {
          name: Some(String::from("demo-web-run-2")),
          remove: true,
          no_deps: true,
          ..Default::default()
        },
      )
      .await
      .unwrap();

    assert_eq!(code, 0);
    assert!(engine.container("demo-web-run-2").is_none());
  }

  #[tokio::test]
  async fn run_propagates_nonzero_exit() {
    let engine = engine_with_images();
    engine.exit_on_start("demo-web-run-3", 3);
    let controller = controller(engine.clone());
    let project = demo();

    let code = controller
      .run(
        &project,
        "web",
        RunOptions {
          name: Some(String::from("demo-web-run-3")),
          no_deps: true,
          ..Default::default()
        },
      )
      .await
      .unwrap();
    assert_eq!(code, 3);
  }
}
