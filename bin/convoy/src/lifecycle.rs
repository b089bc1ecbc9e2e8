use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use anyhow::{Context, anyhow};
use futures_util::future::join_all;
use model::{Project, ServiceSpec};
use tokio_util::sync::CancellationToken;

use crate::{
  convert::{ContainerSpecArgs, container_spec},
  engine::{
    Container, ContainerState, Engine, EngineError, HealthState,
    retry_transient,
  },
  error::{ConvergeError, ErrorKind},
  graph::NodeHandle,
  labels,
  plan::{ReplicaAction, ServicePlan},
  progress::Progress,
};

const ENGINE_ATTEMPTS: u32 = 4;
const HEALTH_POLL: Duration = Duration::from_millis(250);

/// Drives per-container state machines to carry out service plans.
/// Owns retry, timeout and rollback semantics; emits a progress
/// event for every transition.
#[derive(Clone)]
pub struct Executor {
  pub engine: Arc<dyn Engine>,
  pub progress: Progress,
  pub cancel: CancellationToken,
  /// How long a container without a healthcheck must survive after
  /// start before it counts as up.
  pub settle: Duration,
  /// Slack past the stop grace period before escalating to kill.
  pub stop_slack: Duration,
  pub compatibility: bool,
  pub default_platform: Option<String>,
}

/// Per-service knobs threaded down from the verb options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
  pub renew_anon_volumes: bool,
  pub no_start: bool,
  /// Overrides the service's stop grace period.
  pub stop_timeout: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct ApplyOutcome {
  pub created: Vec<String>,
  pub started: Vec<String>,
  pub removed: Vec<String>,
}

impl Executor {
  fn grace(
    &self,
    service: &ServiceSpec,
    options: &ApplyOptions,
  ) -> Duration {
    options
      .stop_timeout
      .unwrap_or_else(|| service.stop_grace_period())
  }

  /// Execute a service's action plan. Removes are issued before any
  /// create so a vacating replica never races a replacement for its
  /// name or index. Surviving replica actions then run in parallel.
  /// Afterwards readiness is driven as far as the dependents of this
  /// service demand.
  #[instrument(
    "ApplyPlan",
    skip_all,
    fields(service = service.name)
  )]
  pub async fn apply_plan(
    &self,
    project: &Project,
    service: &ServiceSpec,
    plan: &ServicePlan,
    handle: &NodeHandle,
    config_hash: &str,
    options: &ApplyOptions,
  ) -> anyhow::Result<ApplyOutcome> {
    plan.validate()?;
    let mut outcome = ApplyOutcome::default();
    let grace = self.grace(service, options);

    let removes = plan
      .actions
      .iter()
      .filter_map(|action| match action {
        ReplicaAction::Remove { existing } => Some(existing),
        _ => None,
      })
      .map(|existing| async move {
        self
          .stop_and_remove(
            &service.name,
            &existing.name,
            service.stop_signal.clone(),
            grace,
            false,
          )
          .await
          .map(|_| existing.name.clone())
      });
    for result in join_all(removes).await {
      outcome.removed.push(result?);
    }

    let survivors = plan
      .actions
      .iter()
      .filter(|action| !action.is_remove())
      .map(|action| self.apply_replica(
        project,
        service,
        action,
        config_hash,
        options,
        grace,
      ));
    let results = join_all(survivors).await;

    let mut failed = Vec::new();
    for result in results {
      match result {
        Ok(ReplicaOutcome::Created { name, started }) => {
          outcome.created.push(name.clone());
          if started {
            outcome.started.push(name);
          }
        }
        Ok(ReplicaOutcome::Started { name }) => {
          outcome.started.push(name)
        }
        Ok(ReplicaOutcome::Kept) => {}
        Err(e) => failed.push(e),
      }
    }
    if let Some(first) = failed.into_iter().next() {
      let running = outcome.started.len();
      return Err(first.context(format!(
        "service '{}' converged {running}/{} replicas",
        service.name, plan.want
      )));
    }

    handle.mark_started();

    if options.no_start {
      return Ok(outcome);
    }

    let demands = handle.demands();
    let replica_names: Vec<String> = plan
      .actions
      .iter()
      .filter_map(|action| match action {
        ReplicaAction::Create { index }
        | ReplicaAction::Recreate { index, .. } => {
          Some(labels::container_name(
            service,
            &project.name,
            *index,
            self.compatibility,
          ))
        }
        ReplicaAction::Start { existing, .. }
        | ReplicaAction::Keep { existing, .. } => {
          Some(existing.name.clone())
        }
        ReplicaAction::Remove { .. } => None,
      })
      .collect();

    if demands.healthy {
      self
        .await_one_healthy(service, &replica_names)
        .await?;
      handle.mark_healthy();
    }

    if demands.completed {
      self.await_completion(service, &replica_names).await?;
      handle.mark_completed();
    }

    Ok(outcome)
  }

  async fn apply_replica(
    &self,
    project: &Project,
    service: &ServiceSpec,
    action: &ReplicaAction,
    config_hash: &str,
    options: &ApplyOptions,
    grace: Duration,
  ) -> anyhow::Result<ReplicaOutcome> {
    match action {
      ReplicaAction::Create { index } => {
        let name = self
          .create_replica(
            project,
            service,
            *index,
            config_hash,
            Vec::new(),
          )
          .await?;
        if !options.no_start {
          self.start_replica(service, &name).await?;
        }
        Ok(ReplicaOutcome::Created {
          name,
          started: !options.no_start,
        })
      }
      ReplicaAction::Recreate { existing, index } => {
        let name = self
          .recreate_replica(
            project, service, existing, *index, config_hash,
            options, grace,
          )
          .await?;
        Ok(ReplicaOutcome::Created {
          name,
          started: !options.no_start,
        })
      }
      ReplicaAction::Start { existing, .. } => {
        if options.no_start {
          return Ok(ReplicaOutcome::Kept);
        }
        self.start_replica(service, &existing.name).await?;
        Ok(ReplicaOutcome::Started {
          name: existing.name.clone(),
        })
      }
      ReplicaAction::Keep { existing, .. } => {
        self.progress.done(
          format!("Container {}", existing.name),
          Some(&service.name),
          "up-to-date",
          "Running",
        );
        Ok(ReplicaOutcome::Kept)
      }
      ReplicaAction::Remove { .. } => {
        unreachable!("removes are drained before replica actions")
      }
    }
  }

  /// Create one replica under its canonical name, first clearing any
  /// stale container squatting on that name. Secondary networks are
  /// connected before the caller starts the container.
  async fn create_replica(
    &self,
    project: &Project,
    service: &ServiceSpec,
    index: u32,
    config_hash: &str,
    adopted_binds: Vec<String>,
  ) -> anyhow::Result<String> {
    let name = labels::container_name(
      service,
      &project.name,
      index,
      self.compatibility,
    );
    let id = format!("Container {name}");

    // A name is taken regardless of container state.
    match self.engine.inspect_container(&name).await {
      Ok(_) => {
        self.progress.working(
          &id,
          Some(&service.name),
          "create",
          "Removing stale container",
        );
        self
          .engine
          .remove_container(&name, true, false)
          .await
          .map_err(|e| self.err(&e, &name))?;
      }
      Err(e) if e.is_not_found() => {}
      Err(e) => return Err(self.err(&e, &name).into()),
    }

    self
      .progress
      .working(&id, Some(&service.name), "create", "Creating");
    let spec = container_spec(ContainerSpecArgs {
      project,
      service,
      index,
      config_hash,
      oneoff: false,
      compatibility: self.compatibility,
      adopted_binds: &adopted_binds,
      command_override: None,
      default_platform: self.default_platform.as_deref(),
    });
    let secondary: Vec<_> =
      spec.endpoints.iter().skip(1).cloned().collect();
    retry_transient(ENGINE_ATTEMPTS, || {
      self.engine.create_container(&name, spec.clone())
    })
    .await
    .map_err(|e| self.err(&e, &name))?;

    for endpoint in secondary {
      self
        .engine
        .connect_network(&endpoint.network, &name, endpoint.clone())
        .await
        .map_err(|e| self.err(&e, &endpoint.network))?;
    }

    self
      .progress
      .done(&id, Some(&service.name), "create", "Created");
    Ok(name)
  }

  /// Start a replica and confirm it survives its settle window.
  /// Health-gated readiness is handled at the service level.
  pub(crate) async fn start_replica(
    &self,
    service: &ServiceSpec,
    name: &str,
  ) -> anyhow::Result<()> {
    let id = format!("Container {name}");
    self
      .progress
      .working(&id, Some(&service.name), "start", "Starting");
    retry_transient(ENGINE_ATTEMPTS, || {
      self.engine.start_container(name)
    })
    .await
    .map_err(|e| self.err(&e, name))?;

    let has_healthcheck = service
      .healthcheck
      .as_ref()
      .map(|check| check.is_active())
      .unwrap_or(false);
    if !has_healthcheck {
      tokio::time::sleep(self.settle).await;
      let details = self
        .engine
        .inspect_container(name)
        .await
        .map_err(|e| self.err(&e, name))?;
      if matches!(
        details.state,
        ContainerState::Exited | ContainerState::Dead
      ) && !service.restart.restarts_on_failure()
      {
        let code = details.exit_code.unwrap_or(-1);
        self.progress.error_event(
          &id,
          Some(&service.name),
          "start",
          format!("Exited ({code})"),
        );
        return Err(
          ConvergeError::new(
            ErrorKind::StartFailed,
            name,
            anyhow!(
              "container exited with code {code} immediately after start"
            ),
          )
          .into(),
        );
      }
    }
    self
      .progress
      .done(&id, Some(&service.name), "start", "Started");
    Ok(())
  }

  /// Atomic replacement of one replica:
  ///
  /// 1. snapshot mounts for anonymous volume adoption
  /// 2. stop the old container with its grace period
  /// 3. rename it to a sentinel, freeing the canonical name
  /// 4. create the replacement under the canonical name
  /// 5. start the replacement and let it settle
  /// 6. remove the sentinel
  ///
  /// Any failure after step 3 removes the replacement and renames
  /// the sentinel back, so exactly one container answers to the
  /// canonical name on every exit path.
  async fn recreate_replica(
    &self,
    project: &Project,
    service: &ServiceSpec,
    existing: &Container,
    index: u32,
    config_hash: &str,
    options: &ApplyOptions,
    grace: Duration,
  ) -> anyhow::Result<String> {
    let canonical = labels::container_name(
      service,
      &project.name,
      index,
      self.compatibility,
    );
    let id = format!("Container {canonical}");
    self.progress.working(
      &id,
      Some(&service.name),
      "recreate",
      "Recreating",
    );

    let details =
      match self.engine.inspect_container(&existing.name).await {
        Ok(details) => Some(details),
        // Gone since the snapshot; fall through to a plain create.
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(self.err(&e, &existing.name).into()),
      };

    let adopted_binds = match (&details, options.renew_anon_volumes)
    {
      (Some(details), false) => details
        .volume_mounts
        .iter()
        .filter(|mount| {
          service.volumes.iter().any(|spec_mount| {
            spec_mount.is_anonymous()
              && spec_mount.target == mount.destination
          })
        })
        .map(|mount| {
          format!("{}:{}", mount.name, mount.destination)
        })
        .collect(),
      _ => Vec::new(),
    };

    if details.is_none() {
      let name = self
        .create_replica(
          project,
          service,
          index,
          config_hash,
          adopted_binds,
        )
        .await?;
      if !options.no_start {
        self.start_replica(service, &name).await?;
      }
      return Ok(name);
    }

    self
      .stop_replica(
        &existing.name,
        service.stop_signal.clone(),
        grace,
      )
      .await?;

    let sentinel = labels::sentinel_name(&canonical);
    self
      .engine
      .rename_container(&existing.name, &sentinel)
      .await
      .map_err(|e| self.err(&e, &existing.name))?;

    let created = async {
      let name = self
        .create_replica(
          project,
          service,
          index,
          config_hash,
          adopted_binds,
        )
        .await?;
      if !options.no_start {
        self.start_replica(service, &name).await?;
      }
      Ok::<String, anyhow::Error>(name)
    }
    .await;

    match created {
      Ok(name) => {
        self
          .engine
          .remove_container(
            &sentinel,
            true,
            options.renew_anon_volumes,
          )
          .await
          .map_err(|e| self.err(&e, &sentinel))?;
        self.progress.done(
          &id,
          Some(&service.name),
          "recreate",
          "Recreated",
        );
        Ok(name)
      }
      Err(e) => {
        // Roll back: the prior container gets its name back.
        if let Err(cleanup) = self
          .engine
          .remove_container(&canonical, true, false)
          .await
          && !cleanup.is_not_found()
        {
          warn!(
            "failed to remove replacement for {canonical} during rollback | {cleanup}"
          );
        }
        if let Err(restore) = self
          .engine
          .rename_container(&sentinel, &canonical)
          .await
        {
          warn!(
            "failed to restore {canonical} from {sentinel} | {restore}"
          );
        }
        Err(e.context(format!(
          "recreate of '{canonical}' rolled back"
        )))
      }
    }
  }

  /// Stop with the grace period, then escalate to kill if the
  /// container is still running past grace plus slack. The Engine
  /// stop call is shielded so an in-flight stop completes even when
  /// the run is being canceled.
  pub async fn stop_replica(
    &self,
    name: &str,
    signal: Option<String>,
    grace: Duration,
  ) -> anyhow::Result<()> {
    let engine = self.engine.clone();
    let container = name.to_string();
    let stop = tokio::spawn(async move {
      retry_transient(ENGINE_ATTEMPTS, || {
        engine.stop_container(
          &container,
          signal.clone(),
          Some(grace),
        )
      })
      .await
    });
    match stop.await.context("stop task failed")? {
      Ok(()) => {}
      Err(e) if e.is_not_found() => return Ok(()),
      Err(e) => return Err(self.err(&e, name).into()),
    }

    let deadline = Instant::now() + grace + self.stop_slack;
    loop {
      match self.engine.inspect_container(name).await {
        Ok(details)
          if details.state == ContainerState::Running =>
        {
          if Instant::now() >= deadline {
            warn!(
              "container {name} survived its stop grace period, killing"
            );
            match self
              .engine
              .kill_container(name, "SIGKILL")
              .await
            {
              Ok(()) => return Ok(()),
              Err(e) if e.is_not_found() => return Ok(()),
              Err(e) => return Err(self.err(&e, name).into()),
            }
          }
          tokio::time::sleep(HEALTH_POLL).await;
        }
        Ok(_) => return Ok(()),
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(self.err(&e, name).into()),
      }
    }
  }

  pub async fn stop_and_remove(
    &self,
    service: &str,
    name: &str,
    signal: Option<String>,
    grace: Duration,
    remove_volumes: bool,
  ) -> anyhow::Result<()> {
    let id = format!("Container {name}");
    self.progress.working(&id, Some(service), "stop", "Stopping");
    self.stop_replica(name, signal, grace).await?;
    self
      .progress
      .working(&id, Some(service), "remove", "Removing");
    match self
      .engine
      .remove_container(name, true, remove_volumes)
      .await
    {
      Ok(()) => {}
      Err(e) if e.is_not_found() => {}
      Err(e) => return Err(self.err(&e, name).into()),
    }
    self.progress.done(&id, Some(service), "remove", "Removed");
    Ok(())
  }

  /// Gate: at least one replica reports healthy within the
  /// healthcheck's declared budget.
  pub(crate) async fn await_one_healthy(
    &self,
    service: &ServiceSpec,
    names: &[String],
  ) -> anyhow::Result<()> {
    let budget = service
      .healthcheck
      .as_ref()
      .map(|check| check.readiness_budget())
      .unwrap_or(self.settle);
    let deadline = Instant::now() + budget;
    let id = format!("Service {}", service.name);
    self.progress.working(
      &id,
      Some(&service.name),
      "health",
      "Waiting",
    );

    loop {
      let mut all_down = true;
      for name in names {
        match self.engine.inspect_container(name).await {
          Ok(details) => {
            match details.health {
              Some(HealthState::Healthy) => {
                self.progress.done(
                  &id,
                  Some(&service.name),
                  "health",
                  "Healthy",
                );
                return Ok(());
              }
              Some(HealthState::Starting) => all_down = false,
              Some(HealthState::Unhealthy) => {}
              // No check on the container: running is enough.
              None
                if details.state
                  == ContainerState::Running =>
              {
                self.progress.done(
                  &id,
                  Some(&service.name),
                  "health",
                  "Started",
                );
                return Ok(());
              }
              None => {}
            }
          }
          Err(e) if e.is_not_found() => {}
          Err(e) => return Err(self.err(&e, name).into()),
        }
      }
      if all_down || Instant::now() >= deadline {
        self.progress.error_event(
          &id,
          Some(&service.name),
          "health",
          "Unhealthy",
        );
        return Err(
          ConvergeError::new(
            ErrorKind::HealthFailed,
            service.name.clone(),
            anyhow!(
              "no replica of '{}' reached healthy within {budget:?}",
              service.name
            ),
          )
          .into(),
        );
      }
      tokio::time::sleep(HEALTH_POLL).await;
    }
  }

  /// Gate: every replica exits zero (one-shot services).
  async fn await_completion(
    &self,
    service: &ServiceSpec,
    names: &[String],
  ) -> anyhow::Result<()> {
    for name in names {
      let code = match self.engine.wait_container(name).await {
        Ok(code) => code,
        Err(e) if e.is_not_found() => continue,
        Err(e) => return Err(self.err(&e, name).into()),
      };
      if code != 0 {
        return Err(
          ConvergeError::new(
            ErrorKind::StartFailed,
            name.clone(),
            anyhow!("container exited with code {code}"),
          )
          .into(),
        );
      }
    }
    self.progress.done(
      format!("Service {}", service.name),
      Some(&service.name),
      "exit",
      "Exited (0)",
    );
    Ok(())
  }

  fn err(&self, e: &EngineError, resource: &str) -> ConvergeError {
    ConvergeError::new(e.into(), resource, e.clone())
  }
}

enum ReplicaOutcome {
  Created { name: String, started: bool },
  Started { name: String },
  Kept,
}
