use std::{
  collections::BTreeMap, sync::Arc, time::Duration,
};

use anyhow::{Context, anyhow};
use model::{Project, PullPolicy};
use tokio_util::sync::CancellationToken;

use crate::{
  engine::{
    CreateNetwork, CreateVolume, Engine, Filters,
  },
  error::{ConvergeError, ErrorKind},
  graph::Scheduler,
  labels,
  lifecycle::Executor,
  observe::ObservedState,
  progress::Progress,
};

pub mod control;
pub mod down;
pub mod logs;
pub mod ps;
pub mod run;
pub mod up;

pub use down::{DownOptions, RmOptions, RmiPolicy};
pub use logs::LogsOptions;
pub use run::RunOptions;
pub use up::{UpOptions, UpSummary};

/// Process-wide defaults resolved once at startup. Tests construct
/// these directly.
#[derive(Debug, Clone)]
pub struct Settings {
  /// Use the legacy `_` separator in container names.
  pub compatibility: bool,
  /// Bound on concurrently executing service ops.
  pub parallel_limit: Option<usize>,
  /// Suppress the orphan warning entirely.
  pub ignore_orphans: bool,
  /// Early-exit window for containers without healthchecks.
  pub settle: Duration,
  /// Grace slack before stop escalates to kill.
  pub stop_slack: Duration,
  pub default_platform: Option<String>,
}

impl Default for Settings {
  fn default() -> Settings {
    Settings {
      compatibility: false,
      parallel_limit: None,
      ignore_orphans: false,
      settle: Duration::from_secs(1),
      stop_slack: Duration::from_secs(2),
      default_platform: None,
    }
  }
}

/// Top level orchestrator: wires the Observer, Diff & Policy, the
/// Dependency Scheduler and the Lifecycle Executor together for each
/// public verb. Holds no state beyond its collaborators; everything
/// else is per-run.
pub struct Controller {
  pub engine: Arc<dyn Engine>,
  pub progress: Progress,
  pub cancel: CancellationToken,
  pub settings: Settings,
}

impl Controller {
  pub fn new(
    engine: Arc<dyn Engine>,
    progress: Progress,
    cancel: CancellationToken,
    settings: Settings,
  ) -> Controller {
    Controller {
      engine,
      progress,
      cancel,
      settings,
    }
  }

  pub(crate) fn executor(&self) -> Executor {
    Executor {
      engine: self.engine.clone(),
      progress: self.progress.clone(),
      cancel: self.cancel.clone(),
      settle: self.settings.settle,
      stop_slack: self.settings.stop_slack,
      compatibility: self.settings.compatibility,
      default_platform: self.settings.default_platform.clone(),
    }
  }

  pub(crate) fn scheduler(&self) -> Scheduler {
    Scheduler {
      max_parallel: self.settings.parallel_limit,
      cancel: self.cancel.clone(),
    }
  }

  /// Create the project's missing networks and volumes. External
  /// definitions are required to exist already.
  pub(crate) async fn ensure_resources(
    &self,
    project: &Project,
  ) -> anyhow::Result<()> {
    let existing_networks = self
      .engine
      .list_networks(Filters::default())
      .await
      .context("Failed to list networks")?;
    for (key, def) in &project.networks {
      let name = project.network_name(key);
      let exists =
        existing_networks.iter().any(|n| n.name == name);
      if exists {
        continue;
      }
      if def.external {
        return Err(
          ConvergeError::new(
            ErrorKind::NotFound,
            name.clone(),
            anyhow!(
              "external network '{name}' is not present on the engine"
            ),
          )
          .into(),
        );
      }
      self.progress.working(
        format!("Network {name}"),
        None,
        "create",
        "Creating",
      );
      let mut labels_map = std::collections::BTreeMap::new();
      labels_map.insert(
        labels::PROJECT_LABEL.to_string(),
        project.name.clone(),
      );
      labels_map
        .insert(labels::NETWORK_LABEL.to_string(), key.clone());
      self
        .engine
        .create_network(CreateNetwork {
          name: name.clone(),
          driver: def.driver.clone(),
          attachable: def.attachable,
          labels: labels_map,
          options: def
            .driver_opts
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        })
        .await
        .with_context(|| {
          format!("Failed to create network '{name}'")
        })?;
      self.progress.done(
        format!("Network {name}"),
        None,
        "create",
        "Created",
      );
    }

    let existing_volumes = self
      .engine
      .list_volumes(Filters::default())
      .await
      .context("Failed to list volumes")?;
    for (key, def) in &project.volumes {
      let name = project.volume_name(key);
      let exists =
        existing_volumes.iter().any(|v| v.name == name);
      if exists {
        continue;
      }
      if def.external {
        return Err(
          ConvergeError::new(
            ErrorKind::NotFound,
            name.clone(),
            anyhow!(
              "external volume '{name}' is not present on the engine"
            ),
          )
          .into(),
        );
      }
      self.progress.working(
        format!("Volume {name}"),
        None,
        "create",
        "Creating",
      );
      let mut labels_map = std::collections::BTreeMap::new();
      labels_map.insert(
        labels::PROJECT_LABEL.to_string(),
        project.name.clone(),
      );
      labels_map
        .insert(labels::VOLUME_LABEL.to_string(), key.clone());
      self
        .engine
        .create_volume(CreateVolume {
          name: name.clone(),
          driver: def.driver.clone(),
          labels: labels_map,
          driver_opts: def
            .driver_opts
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        })
        .await
        .with_context(|| {
          format!("Failed to create volume '{name}'")
        })?;
      self.progress.done(
        format!("Volume {name}"),
        None,
        "create",
        "Created",
      );
    }
    Ok(())
  }

  /// Resolve the image id for every service in `services`, honoring
  /// the pull policy. The resolved digest feeds the config hash and
  /// the recreate decision.
  pub(crate) async fn resolve_images(
    &self,
    project: &Project,
    services: &[String],
    pull_override: Option<PullPolicy>,
    quiet: bool,
  ) -> anyhow::Result<BTreeMap<String, String>> {
    let resolves = services.iter().map(|name| async {
      let service = project.service(name)?;
      let id = self
        .resolve_image(service, pull_override, quiet)
        .await?;
      Ok::<(String, String), anyhow::Error>((name.clone(), id))
    });
    let mut images = BTreeMap::new();
    for result in futures_util::future::join_all(resolves).await {
      let (service, id) = result?;
      images.insert(service, id);
    }
    Ok(images)
  }

  async fn resolve_image(
    &self,
    service: &model::ServiceSpec,
    pull_override: Option<PullPolicy>,
    quiet: bool,
  ) -> anyhow::Result<String> {
    let image = service.image.as_deref().with_context(|| {
      format!("service '{}' has no image", service.name)
    })?;
    let policy = pull_override.unwrap_or(service.pull_policy);
    let id = format!("Image {image}");

    if policy == PullPolicy::Always {
      if !quiet {
        self.progress.working(&id, None, "pull", "Pulling");
      }
      self
        .engine
        .pull_image(image, service.platform.as_deref())
        .await
        .map_err(|e| {
          ConvergeError::new(ErrorKind::from(&e), image, e.clone())
        })?;
      if !quiet {
        self.progress.done(&id, None, "pull", "Pulled");
      }
    }

    match self.engine.inspect_image(image).await {
      Ok(info) => return Ok(info.id),
      Err(e) if e.is_not_found() => {}
      Err(e) => {
        return Err(
          ConvergeError::new(ErrorKind::from(&e), image, e.clone())
            .into(),
        );
      }
    }

    match policy {
      PullPolicy::Missing | PullPolicy::Always => {
        if !quiet {
          self.progress.working(&id, None, "pull", "Pulling");
        }
        self
          .engine
          .pull_image(image, service.platform.as_deref())
          .await
          .map_err(|e| {
            ConvergeError::new(
              ErrorKind::from(&e),
              image,
              e.clone(),
            )
          })?;
        if !quiet {
          self.progress.done(&id, None, "pull", "Pulled");
        }
        let info =
          self.engine.inspect_image(image).await.map_err(|e| {
            ConvergeError::new(
              ErrorKind::from(&e),
              image,
              e.clone(),
            )
          })?;
        Ok(info.id)
      }
      PullPolicy::Never => Err(
        ConvergeError::new(
          ErrorKind::NotFound,
          image,
          anyhow!(
            "image '{image}' is not present and the pull policy is 'never'"
          ),
        )
        .into(),
      ),
      PullPolicy::Build => Err(
        ConvergeError::new(
          ErrorKind::NotFound,
          image,
          anyhow!(
            "image '{image}' is not present; it is expected from the external builder"
          ),
        )
        .into(),
      ),
    }
  }

  /// Remove or report containers carrying the project label with no
  /// matching active service.
  pub(crate) async fn handle_orphans(
    &self,
    observed: &ObservedState,
    remove: bool,
  ) -> anyhow::Result<()> {
    if observed.orphans.is_empty() {
      return Ok(());
    }
    if remove {
      let executor = self.executor();
      let removals =
        observed.orphans.iter().map(|container| {
          executor.stop_and_remove(
            "orphans",
            &container.name,
            None,
            Duration::from_secs(10),
            false,
          )
        });
      for result in
        futures_util::future::join_all(removals).await
      {
        result?;
      }
    } else if !self.settings.ignore_orphans {
      let names: Vec<&str> = observed
        .orphans
        .iter()
        .map(|c| c.name.as_str())
        .collect();
      self.progress.warning(
        "orphans",
        format!(
          "Found orphan containers ({}) for this project. Remove them with --remove-orphans.",
          names.join(", ")
        ),
      );
    }
    Ok(())
  }
}
