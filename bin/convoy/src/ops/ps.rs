use serde::Serialize;

use crate::{labels, observe::observe};

use super::Controller;

/// One row of the container listing.
#[derive(Debug, Clone, Serialize)]
pub struct PsRow {
  pub name: String,
  pub service: String,
  pub image: String,
  pub state: String,
  pub oneoff: bool,
}

impl Controller {
  /// List the project's managed containers, replicas and one-offs
  /// alike. Works from the project name alone.
  pub async fn ps(
    &self,
    project_name: &str,
  ) -> anyhow::Result<Vec<PsRow>> {
    let observed =
      observe(self.engine.as_ref(), project_name, None).await?;

    let mut rows: Vec<PsRow> = observed
      .by_service
      .iter()
      .flat_map(|(service, containers)| {
        containers.iter().map(|container| PsRow {
          name: container.name.clone(),
          service: service.clone(),
          image: container.image.clone(),
          state: container.state.to_string(),
          oneoff: false,
        })
      })
      .chain(observed.oneoff.iter().map(|container| PsRow {
        name: container.name.clone(),
        service: container
          .labels
          .get(labels::SERVICE_LABEL)
          .cloned()
          .unwrap_or_default(),
        image: container.image.clone(),
        state: container.state.to_string(),
        oneoff: true,
      }))
      .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(rows)
  }
}
