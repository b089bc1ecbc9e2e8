use std::collections::BTreeSet;

use model::ServiceSpec;

use crate::{
  engine::{Container, ContainerState},
  labels,
};

/// User options affecting per-service reconciliation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
  pub force_recreate: bool,
  pub no_recreate: bool,
  pub renew_anon_volumes: bool,
  pub scale_override: Option<u32>,
}

/// One decision for one replica slot.
#[derive(Debug, Clone)]
pub enum ReplicaAction {
  Create { index: u32 },
  Recreate { existing: Container, index: u32 },
  Start { existing: Container, index: u32 },
  Keep { existing: Container, index: u32 },
  Remove { existing: Container },
}

impl ReplicaAction {
  pub fn is_remove(&self) -> bool {
    matches!(self, ReplicaAction::Remove { .. })
  }

  pub fn existing(&self) -> Option<&Container> {
    match self {
      ReplicaAction::Recreate { existing, .. }
      | ReplicaAction::Start { existing, .. }
      | ReplicaAction::Keep { existing, .. }
      | ReplicaAction::Remove { existing } => Some(existing),
      ReplicaAction::Create { .. } => None,
    }
  }
}

/// The ordered action list for one service. Removes come first so
/// an over-scaled replica never collides with a replacement taking
/// its name or index.
#[derive(Debug, Clone, Default)]
pub struct ServicePlan {
  pub service: String,
  pub want: u32,
  pub actions: Vec<ReplicaAction>,
}

impl ServicePlan {
  /// A plan that touches nothing: every action is Keep.
  pub fn is_noop(&self) -> bool {
    self
      .actions
      .iter()
      .all(|action| matches!(action, ReplicaAction::Keep { .. }))
  }

  /// Valid iff the surviving replica count equals the desired scale
  /// and no two actions target the same existing container.
  pub fn validate(&self) -> anyhow::Result<()> {
    let surviving = self
      .actions
      .iter()
      .filter(|action| !action.is_remove())
      .count() as u32;
    if surviving != self.want {
      anyhow::bail!(
        "plan for '{}' leaves {surviving} replicas, want {}",
        self.service,
        self.want
      );
    }
    let mut seen = BTreeSet::new();
    for action in &self.actions {
      if let Some(existing) = action.existing()
        && !seen.insert(existing.id.clone())
      {
        anyhow::bail!(
          "plan for '{}' targets container '{}' twice",
          self.service,
          existing.name
        );
      }
    }
    Ok(())
  }
}

/// Reconcile one service against its observed replicas.
///
/// `config_hash` is the digest freshly computed for this run, and
/// `image_id` the image the run resolved (None when resolution was
/// skipped). The observed slice must be replica-index sorted, as the
/// Observer produces it.
pub fn plan_service(
  service: &ServiceSpec,
  observed: &[Container],
  config_hash: &str,
  image_id: Option<&str>,
  opts: &PlanOptions,
) -> ServicePlan {
  let want = opts.scale_override.unwrap_or(service.scale);

  let mut removes = Vec::new();
  let mut kept = Vec::new();
  let mut used_indices = BTreeSet::new();

  for (position, container) in observed.iter().enumerate() {
    if position as u32 >= want {
      removes.push(ReplicaAction::Remove {
        existing: container.clone(),
      });
      continue;
    }
    let index = labels::container_number(&container.labels)
      .unwrap_or(position as u32 + 1);
    used_indices.insert(index);
    kept.push(decide(container, index, config_hash, image_id, opts));
  }

  // Fill the remaining slots with the lowest free indices.
  let mut creates = Vec::new();
  let missing = want as usize - kept.len();
  let mut index = 1;
  while creates.len() < missing {
    if !used_indices.contains(&index) {
      creates.push(ReplicaAction::Create { index });
      used_indices.insert(index);
    }
    index += 1;
  }

  let mut actions = removes;
  actions.extend(kept);
  actions.extend(creates);

  ServicePlan {
    service: service.name.clone(),
    want,
    actions,
  }
}

/// The recreation decision for one existing container.
fn decide(
  container: &Container,
  index: u32,
  config_hash: &str,
  image_id: Option<&str>,
  opts: &PlanOptions,
) -> ReplicaAction {
  let existing = container.clone();

  if opts.force_recreate {
    return ReplicaAction::Recreate { existing, index };
  }

  if opts.no_recreate {
    // Never recreate, even if the image digest moved: start what is
    // there, keep what runs.
    return match container.state {
      ContainerState::Running
      | ContainerState::Restarting
      | ContainerState::Paused => {
        ReplicaAction::Keep { existing, index }
      }
      _ => ReplicaAction::Start { existing, index },
    };
  }

  let hash_matches = container
    .labels
    .get(labels::CONFIG_HASH_LABEL)
    .map(String::as_str)
    == Some(config_hash);
  if !hash_matches {
    return ReplicaAction::Recreate { existing, index };
  }

  if let Some(image_id) = image_id
    && container.image_id != image_id
  {
    return ReplicaAction::Recreate { existing, index };
  }

  match container.state {
    ContainerState::Running
    | ContainerState::Restarting
    | ContainerState::Paused => {
      ReplicaAction::Keep { existing, index }
    }
    // A dead container cannot be started again.
    ContainerState::Dead | ContainerState::Removing => {
      ReplicaAction::Recreate { existing, index }
    }
    _ => ReplicaAction::Start { existing, index },
  }
}
