use std::{
  collections::BTreeMap,
  sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
  },
  time::Duration,
};

use futures_util::future::join_all;
use model::Project;

use crate::{
  graph::{Direction, NodeHandle, ServiceGraph},
  lifecycle::Executor,
  observe::{ObservedState, observe},
};

use super::Controller;

#[derive(Debug, Clone, Copy, Default)]
pub struct DownOptions {
  pub remove_orphans: bool,
  /// Remove named project volumes (and anonymous ones with the
  /// containers).
  pub volumes: bool,
  pub rmi: Option<RmiPolicy>,
  /// Overrides every service's stop grace period.
  pub timeout: Option<Duration>,
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  strum::Display,
  clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
pub enum RmiPolicy {
  /// Remove every image used by a project container.
  All,
  /// Remove only images named for the project itself.
  Local,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RmOptions {
  pub force: bool,
  pub volumes: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DownSummary {
  pub containers: u32,
  pub networks: u32,
  pub volumes: u32,
  pub images: u32,
}

impl DownSummary {
  pub fn total(&self) -> u32 {
    self.containers + self.networks + self.volumes + self.images
  }
}

struct DownRun {
  executor: Executor,
  observed: Arc<ObservedState>,
  /// service -> (stop signal, grace period)
  graces: BTreeMap<String, (Option<String>, Duration)>,
  remove_volumes: bool,
  removed: AtomicU32,
}

impl DownRun {
  async fn teardown(
    &self,
    handle: NodeHandle,
  ) -> anyhow::Result<()> {
    let service = handle.service();
    let (signal, grace) = self
      .graces
      .get(service)
      .cloned()
      .unwrap_or((None, Duration::from_secs(10)));
    let removals =
      self.observed.service(service).iter().map(|container| {
        let signal = signal.clone();
        async move {
          self
            .executor
            .stop_and_remove(
              service,
              &container.name,
              signal,
              grace,
              self.remove_volumes,
            )
            .await
        }
      });
    for result in join_all(removals).await {
      result?;
      self.removed.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
  }
}

impl Controller {
  /// Tear the project down: stop and remove every managed container
  /// in reverse dependency order, then clean up project resources
  /// per the options. Works from the model when available, or from
  /// labels alone given a bare project name.
  #[instrument("Down", skip_all, fields(project = project_name))]
  pub async fn down(
    &self,
    project_name: &str,
    model: Option<&Project>,
    options: DownOptions,
  ) -> anyhow::Result<DownSummary> {
    let active = model.map(|p| p.service_names());
    let observed = Arc::new(
      observe(
        self.engine.as_ref(),
        project_name,
        active.as_deref(),
      )
      .await?,
    );
    let graph = match model {
      Some(project) => ServiceGraph::from_project(project)?,
      None => ServiceGraph::from_observed(&observed),
    };

    let mut graces = BTreeMap::new();
    if let Some(project) = model {
      for (name, service) in &project.services {
        graces.insert(
          name.clone(),
          (
            service.stop_signal.clone(),
            options
              .timeout
              .unwrap_or_else(|| service.stop_grace_period()),
          ),
        );
      }
    }

    let run = Arc::new(DownRun {
      executor: self.executor(),
      observed: observed.clone(),
      graces,
      remove_volumes: options.volumes,
      removed: AtomicU32::new(0),
    });

    let op_run = run.clone();
    self
      .scheduler()
      .run(&graph, Direction::Reverse, move |handle| {
        let run = op_run.clone();
        async move { run.teardown(handle).await }
      })
      .await?;

    let mut summary = DownSummary {
      containers: run.removed.load(Ordering::Relaxed),
      ..Default::default()
    };

    // One-offs and (optionally) orphans go with the project.
    let executor = self.executor();
    let mut extra: Vec<&crate::engine::Container> =
      observed.oneoff.iter().collect();
    if options.remove_orphans {
      extra.extend(observed.orphans.iter());
    }
    let removals = extra.iter().map(|container| {
      executor.stop_and_remove(
        "down",
        &container.name,
        None,
        options.timeout.unwrap_or(Duration::from_secs(10)),
        options.volumes,
      )
    });
    for result in join_all(removals).await {
      result?;
      summary.containers += 1;
    }

    // The network survives a plain down; deeper cleanups take it
    // too.
    if options.volumes || options.rmi.is_some() {
      for network in &observed.networks {
        match self.engine.remove_network(&network.name).await {
          Ok(()) => {
            summary.networks += 1;
            self.progress.done(
              format!("Network {}", network.name),
              None,
              "remove",
              "Removed",
            );
          }
          Err(e) if e.is_not_found() => {}
          Err(e) => return Err(e.into()),
        }
      }
    }

    if options.volumes {
      for volume in &observed.volumes {
        match self.engine.remove_volume(&volume.name).await {
          Ok(()) => {
            summary.volumes += 1;
            self.progress.done(
              format!("Volume {}", volume.name),
              None,
              "remove",
              "Removed",
            );
          }
          Err(e) if e.is_not_found() => {}
          Err(e) => return Err(e.into()),
        }
      }
    }

    if let Some(policy) = options.rmi {
      let mut images: Vec<&str> = observed
        .by_service
        .values()
        .flatten()
        .chain(observed.oneoff.iter())
        .map(|container| container.image.as_str())
        .filter(|image| !image.is_empty())
        .collect();
      images.sort_unstable();
      images.dedup();
      for image in images {
        if policy == RmiPolicy::Local
          && !image.starts_with(project_name)
        {
          continue;
        }
        match self.engine.remove_image(image).await {
          Ok(()) => summary.images += 1,
          Err(e) if e.is_not_found() => {}
          Err(e) => {
            warn!("failed to remove image {image} | {e}")
          }
        }
      }
    }

    Ok(summary)
  }

  /// Remove stopped containers of the listed services (all when
  /// empty). Running containers are skipped unless forced. Networks
  /// and volumes are always preserved.
  #[instrument("Remove", skip_all, fields(project = project.name))]
  pub async fn rm(
    &self,
    project: &Project,
    services: &[String],
    options: RmOptions,
  ) -> anyhow::Result<u32> {
    let observed = Arc::new(
      observe(
        self.engine.as_ref(),
        &project.name,
        Some(&project.service_names()),
      )
      .await?,
    );
    let graph = ServiceGraph::from_project(project)?;
    let graph = if services.is_empty() {
      graph
    } else {
      graph.subset(services, false)
    };

    let removed = Arc::new(AtomicU32::new(0));
    let executor = self.executor();
    let progress = self.progress.clone();
    let observed_op = observed.clone();
    let removed_op = removed.clone();
    self
      .scheduler()
      .run(&graph, Direction::Reverse, move |handle| {
        let executor = executor.clone();
        let progress = progress.clone();
        let observed = observed_op.clone();
        let removed = removed_op.clone();
        async move {
          let service = handle.service().to_string();
          for container in observed.service(&service) {
            let running = container.state
              == crate::engine::ContainerState::Running;
            if running && !options.force {
              progress.warning(
                format!("Container {}", container.name),
                "running, skipped (use --force)",
              );
              continue;
            }
            executor
              .stop_and_remove(
                &service,
                &container.name,
                None,
                Duration::from_secs(10),
                options.volumes,
              )
              .await?;
            removed.fetch_add(1, Ordering::Relaxed);
          }
          Ok(())
        }
      })
      .await?;

    Ok(removed.load(Ordering::Relaxed))
  }
}
