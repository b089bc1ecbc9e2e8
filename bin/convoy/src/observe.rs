use std::collections::BTreeMap;

use anyhow::Context;

use crate::{
  engine::{
    Container, Engine, Filters, NetworkSummary, VolumeSummary,
  },
  labels,
};

/// Snapshot of everything the Engine holds for a project. Read-only
/// and best effort: containers may come or go between the listing
/// and any follow-up inspect, so downstream consumers tolerate
/// not-found on anything in here.
#[derive(Debug, Default)]
pub struct ObservedState {
  /// Managed replicas bucketed by service, replica index ascending.
  pub by_service: BTreeMap<String, Vec<Container>>,
  /// `run`-spawned one-off containers. Never converged, removed on
  /// teardown.
  pub oneoff: Vec<Container>,
  /// Project-labeled containers not matching any active service.
  pub orphans: Vec<Container>,
  pub networks: Vec<NetworkSummary>,
  pub volumes: Vec<VolumeSummary>,
}

impl ObservedState {
  pub fn service(&self, name: &str) -> &[Container] {
    self
      .by_service
      .get(name)
      .map(Vec::as_slice)
      .unwrap_or_default()
  }

  pub fn container_count(&self) -> usize {
    self.by_service.values().map(Vec::len).sum::<usize>()
      + self.oneoff.len()
      + self.orphans.len()
  }
}

/// Query the Engine for the project's containers, networks and
/// volumes. Never mutates Engine state; the three listings are
/// issued concurrently.
///
/// `active_services` scopes orphan classification; `None` (used by
/// verbs operating on a bare project name) treats every service
/// label found as active.
pub async fn observe(
  engine: &dyn Engine,
  project: &str,
  active_services: Option<&[String]>,
) -> anyhow::Result<ObservedState> {
  let filter =
    || Filters::label(labels::PROJECT_LABEL, project);
  let (containers, networks, volumes) = tokio::try_join!(
    engine.list_containers(filter()),
    engine.list_networks(filter()),
    engine.list_volumes(filter()),
  )
  .context("Failed to observe engine state")?;

  let mut state = ObservedState {
    networks,
    volumes,
    ..Default::default()
  };

  for container in containers {
    if container
      .labels
      .get(labels::ONEOFF_LABEL)
      .map(String::as_str)
      == Some("true")
    {
      state.oneoff.push(container);
      continue;
    }
    match container.labels.get(labels::SERVICE_LABEL) {
      Some(service)
        if active_services
          .map(|active| active.iter().any(|s| s == service))
          .unwrap_or(true) =>
      {
        state
          .by_service
          .entry(service.clone())
          .or_default()
          .push(container);
      }
      // Carries the project label but matches no active service.
      _ => state.orphans.push(container),
    }
  }

  for replicas in state.by_service.values_mut() {
    replicas.sort_by_key(|container| {
      (
        labels::container_number(&container.labels)
          .unwrap_or(u32::MAX),
        container.name.clone(),
      )
    });
  }

  Ok(state)
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use super::*;
  use crate::engine::{ContainerState, fake::FakeEngine};

  fn labels_for(
    project: &str,
    service: &str,
    number: u32,
  ) -> HashMap<String, String> {
    HashMap::from([
      (labels::PROJECT_LABEL.to_string(), project.to_string()),
      (labels::SERVICE_LABEL.to_string(), service.to_string()),
      (
        labels::CONTAINER_NUMBER_LABEL.to_string(),
        number.to_string(),
      ),
    ])
  }

  #[tokio::test]
  async fn buckets_and_sorts_replicas() {
    let engine = FakeEngine::new();
    engine.seed_container(
      "demo-web-2",
      labels_for("demo", "web", 2),
      ContainerState::Running,
      "sha256:img",
    );
    engine.seed_container(
      "demo-web-1",
      labels_for("demo", "web", 1),
      ContainerState::Running,
      "sha256:img",
    );
    // Different project is invisible.
    engine.seed_container(
      "other-web-1",
      labels_for("other", "web", 1),
      ContainerState::Running,
      "sha256:img",
    );

    let state = observe(
      &engine,
      "demo",
      Some(&[String::from("web")]),
    )
    .await
    .unwrap();

    let replicas = state.service("web");
    assert_eq!(replicas.len(), 2);
    assert_eq!(replicas[0].name, "demo-web-1");
    assert_eq!(replicas[1].name, "demo-web-2");
    assert!(state.orphans.is_empty());
  }

  #[tokio::test]
  async fn classifies_orphans_and_oneoffs() {
    let engine = FakeEngine::new();
    engine.seed_container(
      "demo-old-1",
      labels_for("demo", "old", 1),
      ContainerState::Exited,
      "sha256:img",
    );
    let mut oneoff = labels_for("demo", "web", 1);
    oneoff.insert(
      labels::ONEOFF_LABEL.to_string(),
      String::from("true"),
    );
    engine.seed_container(
      "demo-web-run-abc",
      oneoff,
      ContainerState::Running,
      "sha256:img",
    );

    let state = observe(
      &engine,
      "demo",
      Some(&[String::from("web")]),
    )
    .await
    .unwrap();

    assert_eq!(state.orphans.len(), 1);
    assert_eq!(state.orphans[0].name, "demo-old-1");
    assert_eq!(state.oneoff.len(), 1);
    assert!(state.service("web").is_empty());
  }
}
