use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use futures_util::future::join_all;
use model::Project;

use crate::{
  error::{ConvergeError, ErrorKind},
  graph::{Direction, NodeHandle, ServiceGraph},
  lifecycle::Executor,
  observe::{ObservedState, observe},
};

use super::Controller;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlVerb {
  Start,
  Stop,
  Restart,
  Kill,
}

/// Shared state for the specialized ops behind Start, Stop, Restart
/// and Kill. These never touch configuration: whatever containers
/// exist are driven as they are.
struct ControlRun {
  executor: Executor,
  observed: Arc<ObservedState>,
  project: Project,
  verb: ControlVerb,
  timeout: Option<Duration>,
  signal: Option<String>,
}

impl ControlRun {
  async fn apply(&self, handle: NodeHandle) -> anyhow::Result<()> {
    let service = self.project.service(handle.service())?;
    let containers = self.observed.service(&service.name);
    let grace = self
      .timeout
      .unwrap_or_else(|| service.stop_grace_period());

    if containers.is_empty() {
      return match self.verb {
        // Stopping or killing nothing is idempotent success.
        ControlVerb::Stop | ControlVerb::Kill => Ok(()),
        ControlVerb::Start | ControlVerb::Restart => Err(
          ConvergeError::new(
            ErrorKind::NotFound,
            service.name.clone(),
            anyhow!(
              "no containers to act on for service '{}'",
              service.name
            ),
          )
          .into(),
        ),
      };
    }

    match self.verb {
      ControlVerb::Start => {
        let starts = containers.iter().map(|container| {
          self.executor.start_replica(service, &container.name)
        });
        for result in join_all(starts).await {
          result?;
        }
      }
      ControlVerb::Stop => {
        let stops = containers.iter().map(|container| {
          self.executor.stop_replica(
            &container.name,
            service.stop_signal.clone(),
            grace,
          )
        });
        for result in join_all(stops).await {
          result?;
        }
      }
      ControlVerb::Restart => {
        // Restart is stop-then-start; configuration is untouched.
        let restarts = containers.iter().map(|container| async {
          self
            .executor
            .stop_replica(
              &container.name,
              service.stop_signal.clone(),
              grace,
            )
            .await?;
          self
            .executor
            .start_replica(service, &container.name)
            .await
        });
        for result in join_all(restarts).await {
          result?;
        }
      }
      ControlVerb::Kill => {
        let signal =
          self.signal.as_deref().unwrap_or("SIGKILL");
        let kills = containers.iter().map(|container| async {
          match self
            .executor
            .engine
            .kill_container(&container.name, signal)
            .await
          {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
              Err(anyhow::Error::from(ConvergeError::new(
                ErrorKind::from(&e),
                container.name.clone(),
                e.clone(),
              )))
            }
          }
        });
        for result in join_all(kills).await {
          result?;
        }
      }
    }

    if matches!(
      self.verb,
      ControlVerb::Start | ControlVerb::Restart
    ) {
      handle.mark_started();
      if handle.demands().healthy {
        let names: Vec<String> = containers
          .iter()
          .map(|c| c.name.clone())
          .collect();
        self
          .executor
          .await_one_healthy(service, &names)
          .await?;
        handle.mark_healthy();
      }
    }
    Ok(())
  }
}

impl Controller {
  async fn control(
    &self,
    project: &Project,
    services: &[String],
    verb: ControlVerb,
    direction: Direction,
    timeout: Option<Duration>,
    signal: Option<String>,
  ) -> anyhow::Result<()> {
    let graph = ServiceGraph::from_project(project)?;
    let graph = if services.is_empty() {
      graph
    } else {
      graph.subset(services, false)
    };
    let observed = Arc::new(
      observe(
        self.engine.as_ref(),
        &project.name,
        Some(&project.service_names()),
      )
      .await?,
    );

    let run = Arc::new(ControlRun {
      executor: self.executor(),
      observed,
      project: project.clone(),
      verb,
      timeout,
      signal,
    });
    let op_run = run.clone();
    self
      .scheduler()
      .run(&graph, direction, move |handle| {
        let run = op_run.clone();
        async move { run.apply(handle).await }
      })
      .await?;
    Ok(())
  }

  #[instrument("Start", skip_all, fields(project = project.name))]
  pub async fn start(
    &self,
    project: &Project,
    services: &[String],
  ) -> anyhow::Result<()> {
    self
      .control(
        project,
        services,
        ControlVerb::Start,
        Direction::Forward,
        None,
        None,
      )
      .await
  }

  #[instrument("Stop", skip_all, fields(project = project.name))]
  pub async fn stop(
    &self,
    project: &Project,
    services: &[String],
    timeout: Option<Duration>,
  ) -> anyhow::Result<()> {
    self
      .control(
        project,
        services,
        ControlVerb::Stop,
        Direction::Reverse,
        timeout,
        None,
      )
      .await
  }

  #[instrument("Restart", skip_all, fields(project = project.name))]
  pub async fn restart(
    &self,
    project: &Project,
    services: &[String],
    timeout: Option<Duration>,
  ) -> anyhow::Result<()> {
    self
      .control(
        project,
        services,
        ControlVerb::Restart,
        Direction::Forward,
        timeout,
        None,
      )
      .await
  }

  #[instrument("Kill", skip_all, fields(project = project.name))]
  pub async fn kill(
    &self,
    project: &Project,
    services: &[String],
    signal: Option<String>,
  ) -> anyhow::Result<()> {
    self
      .control(
        project,
        services,
        ControlVerb::Kill,
        Direction::Reverse,
        None,
        signal,
      )
      .await
  }

  /// Pause has no ordering concerns; every running container is
  /// paused in parallel.
  #[instrument("Pause", skip_all, fields(project = project.name))]
  pub async fn pause(
    &self,
    project: &Project,
    services: &[String],
  ) -> anyhow::Result<()> {
    self.pause_impl(project, services, true).await
  }

  #[instrument("Unpause", skip_all, fields(project = project.name))]
  pub async fn unpause(
    &self,
    project: &Project,
    services: &[String],
  ) -> anyhow::Result<()> {
    self.pause_impl(project, services, false).await
  }

  async fn pause_impl(
    &self,
    project: &Project,
    services: &[String],
    pause: bool,
  ) -> anyhow::Result<()> {
    let observed = observe(
      self.engine.as_ref(),
      &project.name,
      Some(&project.service_names()),
    )
    .await?;
    let targets = observed
      .by_service
      .iter()
      .filter(|(service, _)| {
        services.is_empty()
          || services.iter().any(|s| s == *service)
      })
      .flat_map(|(_, containers)| containers.iter());

    let actions = targets.map(|container| async move {
      let result = if pause {
        self.engine.pause_container(&container.name).await
      } else {
        self.engine.unpause_container(&container.name).await
      };
      match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(anyhow::Error::from(ConvergeError::new(
          ErrorKind::from(&e),
          container.name.clone(),
          e.clone(),
        ))),
      }
    });
    for result in join_all(actions).await {
      result?;
    }
    Ok(())
  }
}
