use std::{
  collections::BTreeMap,
  sync::{Arc, Mutex},
  time::{Duration, Instant},
};

use anyhow::anyhow;
use model::{Project, PullPolicy};

use crate::{
  engine::{ContainerState, HealthState},
  error::{ConvergeError, ErrorKind},
  graph::{Direction, NodeHandle, ServiceGraph},
  labels,
  lifecycle::{ApplyOptions, Executor},
  observe::observe,
  plan::{PlanOptions, ServicePlan, plan_service},
};

use super::Controller;

#[derive(Debug, Clone, Default)]
pub struct UpOptions {
  /// Restrict convergence to these services (all when empty).
  pub services: Vec<String>,
  pub detach: bool,
  /// Block until every container is running or healthy.
  pub wait: bool,
  pub wait_timeout: Option<Duration>,
  pub remove_orphans: bool,
  pub force_recreate: bool,
  pub no_recreate: bool,
  pub no_deps: bool,
  pub no_start: bool,
  pub renew_anon_volumes: bool,
  pub quiet_pull: bool,
  /// Per-service scale overrides.
  pub scale: Vec<(String, u32)>,
  pub attach_services: Vec<String>,
  pub pull: Option<PullPolicy>,
  /// Overrides every service's stop grace period.
  pub timeout: Option<Duration>,
}

#[derive(Debug, Default, Clone)]
pub struct UpSummary {
  pub created: Vec<String>,
  pub started: Vec<String>,
  pub removed: Vec<String>,
}

impl UpSummary {
  fn merge(&mut self, outcome: crate::lifecycle::ApplyOutcome) {
    self.created.extend(outcome.created);
    self.started.extend(outcome.started);
    self.removed.extend(outcome.removed);
  }
}

/// Everything a per-service op needs, shared across the scheduler's
/// tasks.
struct UpRun {
  executor: Executor,
  project: Project,
  plans: BTreeMap<String, (ServicePlan, String)>,
  apply: ApplyOptions,
  summary: Mutex<UpSummary>,
}

impl UpRun {
  async fn converge(
    &self,
    handle: NodeHandle,
  ) -> anyhow::Result<()> {
    let service = self.project.service(handle.service())?;
    let Some((plan, hash)) = self.plans.get(handle.service())
    else {
      return Ok(());
    };
    let outcome = self
      .executor
      .apply_plan(
        &self.project,
        service,
        plan,
        &handle,
        hash,
        &self.apply,
      )
      .await?;
    self.summary.lock().unwrap().merge(outcome);
    Ok(())
  }
}

impl Controller {
  /// Converge the Engine to the project model: observe, diff, then
  /// execute every service's plan under dependency gating. Nothing
  /// touches the Engine until the model and its graph validate.
  #[instrument("Up", skip_all, fields(project = project.name))]
  pub async fn up(
    &self,
    project: &Project,
    options: UpOptions,
  ) -> anyhow::Result<UpSummary> {
    project.validate().map_err(|e| {
      ConvergeError::new(
        ErrorKind::Validation,
        project.name.clone(),
        e,
      )
    })?;
    for service in &options.services {
      if !project.services.contains_key(service) {
        return Err(
          ConvergeError::new(
            ErrorKind::Validation,
            service.clone(),
            anyhow!("no such service: '{service}'"),
          )
          .into(),
        );
      }
    }
    let graph = ServiceGraph::from_project(project)?;
    let graph = if options.services.is_empty() {
      graph
    } else {
      graph.subset(&options.services, !options.no_deps)
    };

    self.ensure_resources(project).await?;
    let images = self
      .resolve_images(
        project,
        graph.nodes(),
        options.pull,
        options.quiet_pull,
      )
      .await?;
    let observed = observe(
      self.engine.as_ref(),
      &project.name,
      Some(&project.service_names()),
    )
    .await?;
    self
      .handle_orphans(&observed, options.remove_orphans)
      .await?;

    let mut plans = BTreeMap::new();
    for node in graph.nodes() {
      let service = project.service(node)?;
      let image_id = images.get(node).map(String::as_str);
      let hash = labels::config_hash(project, service, image_id);
      let plan_options = PlanOptions {
        force_recreate: options.force_recreate,
        no_recreate: options.no_recreate,
        renew_anon_volumes: options.renew_anon_volumes,
        scale_override: options
          .scale
          .iter()
          .find(|(name, _)| name == node)
          .map(|(_, scale)| *scale),
      };
      let plan = plan_service(
        service,
        observed.service(node),
        &hash,
        image_id,
        &plan_options,
      );
      plans.insert(node.clone(), (plan, hash));
    }

    let run = Arc::new(UpRun {
      executor: self.executor(),
      project: project.clone(),
      plans,
      apply: ApplyOptions {
        renew_anon_volumes: options.renew_anon_volumes,
        no_start: options.no_start,
        stop_timeout: options.timeout,
      },
      summary: Mutex::new(UpSummary::default()),
    });

    let op_run = run.clone();
    self
      .scheduler()
      .run(&graph, Direction::Forward, move |handle| {
        let run = op_run.clone();
        async move { run.converge(handle).await }
      })
      .await?;

    if options.wait && !options.no_start {
      self
        .wait_ready(project, &graph, options.wait_timeout)
        .await?;
    }

    let summary = run.summary.lock().unwrap().clone();
    Ok(summary)
  }

  /// Up without starting anything.
  pub async fn create(
    &self,
    project: &Project,
    mut options: UpOptions,
  ) -> anyhow::Result<UpSummary> {
    options.no_start = true;
    self.up(project, options).await
  }

  /// Adjust effective scales and converge the listed services.
  pub async fn scale(
    &self,
    project: &Project,
    scales: Vec<(String, u32)>,
  ) -> anyhow::Result<UpSummary> {
    for (service, _) in &scales {
      if !project.services.contains_key(service) {
        return Err(
          ConvergeError::new(
            ErrorKind::Validation,
            service.clone(),
            anyhow!("no such service: '{service}'"),
          )
          .into(),
        );
      }
    }
    let options = UpOptions {
      services: scales
        .iter()
        .map(|(service, _)| service.clone())
        .collect(),
      scale: scales,
      ..Default::default()
    };
    self.up(project, options).await
  }

  /// Poll every planned replica until it is running (and healthy,
  /// when a check is declared) or the timeout elapses.
  async fn wait_ready(
    &self,
    project: &Project,
    graph: &ServiceGraph,
    timeout: Option<Duration>,
  ) -> anyhow::Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut pending: Vec<(String, String)> = Vec::new();
    for node in graph.nodes() {
      let service = project.service(node)?;
      for index in 1..=service.scale {
        pending.push((
          node.clone(),
          labels::container_name(
            service,
            &project.name,
            index,
            self.settings.compatibility,
          ),
        ));
      }
    }

    while !pending.is_empty() {
      if self.cancel.is_cancelled() {
        return Err(
          ConvergeError::new(
            ErrorKind::Canceled,
            project.name.clone(),
            anyhow!("wait canceled"),
          )
          .into(),
        );
      }
      let mut still_pending = Vec::new();
      for (service, name) in pending {
        let ready = match self
          .engine
          .inspect_container(&name)
          .await
        {
          Ok(details) => match details.state {
            ContainerState::Running => !matches!(
              details.health,
              Some(HealthState::Starting)
                | Some(HealthState::Unhealthy)
            ),
            // One-shots count once they exit clean.
            ContainerState::Exited => {
              if details.exit_code.unwrap_or(0) != 0 {
                return Err(
                  ConvergeError::new(
                    ErrorKind::StartFailed,
                    name.clone(),
                    anyhow!(
                      "container exited with code {}",
                      details.exit_code.unwrap_or(-1)
                    ),
                  )
                  .into(),
                );
              }
              true
            }
            _ => false,
          },
          Err(e) if e.is_not_found() => false,
          Err(e) => {
            return Err(
              ConvergeError::new(
                ErrorKind::from(&e),
                name.clone(),
                e.clone(),
              )
              .into(),
            );
          }
        };
        if !ready {
          still_pending.push((service, name));
        }
      }
      pending = still_pending;
      if pending.is_empty() {
        break;
      }
      if let Some(deadline) = deadline
        && Instant::now() >= deadline
      {
        let names: Vec<&str> =
          pending.iter().map(|(_, name)| name.as_str()).collect();
        return Err(
          ConvergeError::new(
            ErrorKind::HealthFailed,
            project.name.clone(),
            anyhow!(
              "containers did not become ready in time: {}",
              names.join(", ")
            ),
          )
          .into(),
        );
      }
      tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    engine::{Engine, Filters, fake::FakeEngine},
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

  fn demo(web_env: &str) -> Project {
    Project::from_yaml(&format!(
      "
name: demo
services:
  db:
    image: pg
    healthcheck:
      test: pg_isready
  web:
    image: nginx
    environment:
      MODE: '{web_env}'
    depends_on:
      db:
        condition: service_healthy
",
    ))
    .unwrap()
  }

  fn engine_with_images() -> Arc<FakeEngine> {
    let engine = Arc::new(FakeEngine::new());
    engine.add_image("pg", "sha256:pg");
    engine.add_image("nginx", "sha256:nginx");
    engine
  }

  #[tokio::test]
  async fn fresh_up_orders_web_after_db_health() {
    let engine = engine_with_images();
    let controller = controller(engine.clone());
    let project = demo("a");

    let summary = controller
      .up(&project, UpOptions::default())
      .await
      .unwrap();

    assert_eq!(engine.network_names(), vec!["demo_default"]);
    assert_eq!(
      engine.container_names(),
      vec!["demo-db-1", "demo-web-1"]
    );
    assert_eq!(summary.started.len(), 2);

    // Gating: db started strictly before web was even created.
    let calls = engine.calls();
    let position = |call: &str| {
      calls.iter().position(|c| c == call).unwrap()
    };
    assert!(position("start demo-db-1") < position("create demo-web-1"));

    // Identity labels on every managed container.
    let web = engine.container("demo-web-1").unwrap();
    assert_eq!(web.labels[labels::PROJECT_LABEL], "demo");
    assert_eq!(web.labels[labels::SERVICE_LABEL], "web");
    assert_eq!(web.labels[labels::CONTAINER_NUMBER_LABEL], "1");
    assert!(web.labels.contains_key(labels::CONFIG_HASH_LABEL));
    assert!(web.labels.contains_key(labels::VERSION_LABEL));
    assert_eq!(
      web.labels[labels::DEPENDS_ON_LABEL],
      "db:service_healthy:true"
    );
  }

  #[tokio::test]
  async fn second_up_is_all_keep() {
    let engine = engine_with_images();
    let controller = controller(engine.clone());
    let project = demo("a");

    controller
      .up(&project, UpOptions::default())
      .await
      .unwrap();
    engine.clear_calls();

    let summary = controller
      .up(&project, UpOptions::default())
      .await
      .unwrap();

    assert!(summary.created.is_empty());
    assert!(summary.started.is_empty());
    let calls = engine.calls();
    assert!(
      calls.iter().all(|call| {
        !call.starts_with("create ")
          && !call.starts_with("start ")
          && !call.starts_with("stop ")
          && !call.starts_with("remove ")
      }),
      "expected no container mutations, got {calls:?}"
    );
  }

  #[tokio::test]
  async fn changed_service_recreates_only_itself() {
    let engine = engine_with_images();
    let controller = controller(engine.clone());

    controller
      .up(&demo("a"), UpOptions::default())
      .await
      .unwrap();
    let db_id = engine.container("demo-db-1").unwrap().id;
    let old_web_id = engine.container("demo-web-1").unwrap().id;
    engine.clear_calls();

    controller
      .up(&demo("b"), UpOptions::default())
      .await
      .unwrap();

    // db untouched, web atomically replaced.
    assert_eq!(engine.container("demo-db-1").unwrap().id, db_id);
    let new_web = engine.container("demo-web-1").unwrap();
    assert_ne!(new_web.id, old_web_id);
    assert_eq!(
      engine.container_names(),
      vec!["demo-db-1", "demo-web-1"]
    );
    let calls = engine.calls();
    assert!(
      !calls.iter().any(|c| c.contains("demo-db-1")),
      "db must not be touched: {calls:?}"
    );
  }

  #[tokio::test]
  async fn scale_converges_replica_count() {
    let engine = engine_with_images();
    let controller = controller(engine.clone());
    let project = demo("a");

    controller
      .up(&project, UpOptions::default())
      .await
      .unwrap();
    controller
      .scale(&project, vec![(String::from("web"), 3)])
      .await
      .unwrap();

    assert_eq!(
      engine.container_names(),
      vec![
        "demo-db-1",
        "demo-web-1",
        "demo-web-2",
        "demo-web-3"
      ]
    );
    for name in ["demo-web-1", "demo-web-2", "demo-web-3"] {
      assert_eq!(
        engine.container(name).unwrap().state,
        ContainerState::Running
      );
    }

    // And back down.
    controller
      .scale(&project, vec![(String::from("web"), 1)])
      .await
      .unwrap();
    assert_eq!(
      engine.container_names(),
      vec!["demo-db-1", "demo-web-1"]
    );
  }

  #[tokio::test]
  async fn scale_rejects_unknown_service() {
    let engine = engine_with_images();
    let controller = controller(engine.clone());
    let err = controller
      .scale(&demo("a"), vec![(String::from("ghost"), 2)])
      .await
      .unwrap_err();
    let converge = err.downcast_ref::<ConvergeError>().unwrap();
    assert_eq!(converge.kind, ErrorKind::Validation);
  }

  #[tokio::test]
  async fn crashing_dependency_blocks_dependent() {
    let engine = engine_with_images();
    engine.exit_on_start("demo-db-1", 1);
    let controller = controller(engine.clone());

    let err = controller
      .up(&demo("a"), UpOptions::default())
      .await
      .unwrap_err();
    let errors = err
      .downcast_ref::<crate::error::ConvergeErrors>()
      .unwrap();
    assert_eq!(
      errors.kind("db"),
      Some(ErrorKind::HealthFailed)
    );
    assert_eq!(
      errors.kind("web"),
      Some(ErrorKind::DependencyFailed)
    );

    // No web container was ever created; db remains for diagnosis.
    assert_eq!(engine.container_names(), vec!["demo-db-1"]);
  }

  #[tokio::test]
  async fn unhealthy_dependency_fails_health_gate() {
    let engine = engine_with_images();
    engine.set_unhealthy("demo-db-1");
    let controller = controller(engine.clone());

    let err = controller
      .up(&demo("a"), UpOptions::default())
      .await
      .unwrap_err();
    let errors = err
      .downcast_ref::<crate::error::ConvergeErrors>()
      .unwrap();
    assert_eq!(errors.kind("db"), Some(ErrorKind::HealthFailed));
  }

  #[tokio::test]
  async fn cycle_is_rejected_without_engine_mutation() {
    let engine = engine_with_images();
    let controller = controller(engine.clone());
    let project = Project::from_yaml(
      "
name: demo
services:
  a:
    image: x
    depends_on:
      b:
        condition: service_started
  b:
    image: x
    depends_on:
      a:
        condition: service_started
",
    )
    .unwrap();

    let err = controller
      .up(&project, UpOptions::default())
      .await
      .unwrap_err();
    let converge = err.downcast_ref::<ConvergeError>().unwrap();
    assert_eq!(converge.kind, ErrorKind::Validation);
    assert!(engine.calls().is_empty());
    assert!(engine.container_names().is_empty());
  }

  #[tokio::test]
  async fn remove_orphans_clears_stale_services() {
    let engine = engine_with_images();
    let controller = controller(engine.clone());

    // A container from a service no longer in the model.
    engine.seed_container(
      "demo-old-1",
      std::collections::HashMap::from([
        (
          labels::PROJECT_LABEL.to_string(),
          String::from("demo"),
        ),
        (
          labels::SERVICE_LABEL.to_string(),
          String::from("old"),
        ),
      ]),
      ContainerState::Exited,
      "sha256:old",
    );

    controller
      .up(
        &demo("a"),
        UpOptions {
          remove_orphans: true,
          ..Default::default()
        },
      )
      .await
      .unwrap();

    // No project-labeled container is unmatched by a service.
    let remaining = engine
      .list_containers(Filters::label(
        labels::PROJECT_LABEL,
        "demo",
      ))
      .await
      .unwrap();
    assert!(
      remaining
        .iter()
        .all(|c| c.labels[labels::SERVICE_LABEL] != "old")
    );
  }

  #[tokio::test]
  async fn missing_image_with_never_pull_fails_fast() {
    let engine = Arc::new(FakeEngine::new());
    engine.add_image("pg", "sha256:pg");
    let controller = controller(engine.clone());

    let err = controller
      .up(
        &demo("a"),
        UpOptions {
          pull: Some(PullPolicy::Never),
          ..Default::default()
        },
      )
      .await
      .unwrap_err();
    let converge = err.downcast_ref::<ConvergeError>().unwrap();
    assert_eq!(converge.kind, ErrorKind::NotFound);
    assert!(engine.container_names().is_empty());
  }

  #[tokio::test]
  async fn missing_image_is_pulled_by_default() {
    let engine = Arc::new(FakeEngine::new());
    engine.add_image("pg", "sha256:pg");
    let controller = controller(engine.clone());

    controller
      .up(&demo("a"), UpOptions::default())
      .await
      .unwrap();
    assert!(
      engine.calls().contains(&String::from("pull nginx"))
    );
  }

  #[tokio::test]
  async fn create_does_not_start() {
    let engine = engine_with_images();
    let controller = controller(engine.clone());

    let summary = controller
      .create(&demo("a"), UpOptions::default())
      .await
      .unwrap();

    assert_eq!(summary.created.len(), 2);
    assert!(summary.started.is_empty());
    assert_eq!(
      engine.container("demo-db-1").unwrap().state,
      ContainerState::Created
    );
    assert!(
      !engine
        .calls()
        .iter()
        .any(|c| c.starts_with("start "))
    );
  }
}
