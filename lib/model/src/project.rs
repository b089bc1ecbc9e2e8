use std::path::PathBuf;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::service::ServiceSpec;

/// A named application: services plus the resources they reference.
/// Immutable for the duration of a convergence run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
  /// Lowercase project name, the sole identifier grouping
  /// everything the engine creates for this application.
  pub name: String,
  #[serde(default)]
  pub services: IndexMap<String, ServiceSpec>,
  #[serde(default)]
  pub networks: IndexMap<String, NetworkDef>,
  #[serde(default)]
  pub volumes: IndexMap<String, VolumeDef>,
  #[serde(default)]
  pub configs: IndexMap<String, FileObjectDef>,
  #[serde(default)]
  pub secrets: IndexMap<String, FileObjectDef>,
  #[serde(default)]
  pub working_dir: Option<PathBuf>,
  /// Resolved environment the loader interpolated against.
  #[serde(default)]
  pub environment: IndexMap<String, String>,
}

impl Project {
  /// Deserialize an already interpolated project document and
  /// normalize it. Fails on an invalid model, never on the Engine.
  pub fn from_yaml(contents: &str) -> anyhow::Result<Project> {
    let mut project: Project = serde_yaml_ng::from_str(contents)
      .context("Failed to parse project document")?;
    project.normalize();
    project.validate()?;
    Ok(project)
  }

  pub async fn from_yaml_file(
    path: &std::path::Path,
  ) -> anyhow::Result<Project> {
    let contents = tokio::fs::read_to_string(path)
      .await
      .with_context(|| {
        format!("Failed to read project file at {path:?}")
      })?;
    Self::from_yaml(&contents)
  }

  /// Copy map keys onto the specs and materialize the implicit
  /// `default` network for services which declare none.
  pub fn normalize(&mut self) {
    let mut needs_default = false;
    for (name, service) in self.services.iter_mut() {
      service.name = name.clone();
      if service.networks.is_empty() && service.network_mode.is_none()
      {
        needs_default = true;
        service.networks.insert(String::from("default"), None);
      }
    }
    if (needs_default
      || self
        .services
        .values()
        .any(|s| s.networks.contains_key("default")))
      && !self.networks.contains_key("default")
    {
      self
        .networks
        .insert(String::from("default"), NetworkDef::default());
    }
  }

  pub fn service(
    &self,
    name: &str,
  ) -> anyhow::Result<&ServiceSpec> {
    self.services.get(name).with_context(|| {
      format!("No service '{name}' in project '{}'", self.name)
    })
  }

  /// Engine-side name for a project network.
  pub fn network_name(&self, key: &str) -> String {
    match self.networks.get(key).and_then(|n| n.name.as_deref()) {
      Some(name) => name.to_string(),
      None => format!("{}_{key}", self.name),
    }
  }

  /// Engine-side name for a project volume.
  pub fn volume_name(&self, key: &str) -> String {
    match self.volumes.get(key).and_then(|v| v.name.as_deref()) {
      Some(name) => name.to_string(),
      None => format!("{}_{key}", self.name),
    }
  }

  pub fn service_names(&self) -> Vec<String> {
    self.services.keys().cloned().collect()
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkDef {
  /// Overrides the `<project>_<key>` naming convention.
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub driver: Option<String>,
  /// Managed outside the project. Never created or removed.
  #[serde(default)]
  pub external: bool,
  #[serde(default)]
  pub attachable: bool,
  #[serde(default)]
  pub labels: IndexMap<String, String>,
  #[serde(default)]
  pub driver_opts: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeDef {
  /// Overrides the `<project>_<key>` naming convention.
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub driver: Option<String>,
  /// Managed outside the project. Never created or removed.
  #[serde(default)]
  pub external: bool,
  #[serde(default)]
  pub labels: IndexMap<String, String>,
  #[serde(default)]
  pub driver_opts: IndexMap<String, String>,
}

/// A config or secret definition. The contents are delivered to
/// containers as bind mounts of the resolved file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileObjectDef {
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub file: Option<PathBuf>,
  #[serde(default)]
  pub external: bool,
}
