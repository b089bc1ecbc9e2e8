use std::collections::BTreeMap;

use model::{Project, ServiceSpec};
use sha2::{Digest, Sha256};

/// Label keys stamped on every managed Engine resource. These are
/// bit-exact for interoperability with other compose tooling.
pub const PROJECT_LABEL: &str = "com.docker.compose.project";
pub const SERVICE_LABEL: &str = "com.docker.compose.service";
pub const CONTAINER_NUMBER_LABEL: &str =
  "com.docker.compose.container-number";
pub const ONEOFF_LABEL: &str = "com.docker.compose.oneoff";
pub const VERSION_LABEL: &str = "com.docker.compose.version";
pub const CONFIG_HASH_LABEL: &str =
  "com.docker.compose.config-hash";
pub const DEPENDS_ON_LABEL: &str = "com.docker.compose.depends_on";

pub const NETWORK_LABEL: &str = "com.docker.compose.network";
pub const VOLUME_LABEL: &str = "com.docker.compose.volume";

pub fn separator(compatibility: bool) -> char {
  if compatibility { '_' } else { '-' }
}

/// Canonical name for replica `index` of a service. A
/// `container_name` override wins when declared.
pub fn container_name(
  service: &ServiceSpec,
  project: &str,
  index: u32,
  compatibility: bool,
) -> String {
  if let Some(name) = service.container_name.as_deref() {
    return name.to_string();
  }
  let sep = separator(compatibility);
  format!("{project}{sep}{}{sep}{index}", service.name)
}

/// Name for a `run`-spawned one-off container. The random suffix
/// keeps it clear of replica names.
pub fn oneoff_name(
  project: &str,
  service: &str,
  compatibility: bool,
) -> String {
  let sep = separator(compatibility);
  let suffix = uuid::Uuid::new_v4().simple().to_string();
  format!("{project}{sep}{service}{sep}run{sep}{}", &suffix[..12])
}

/// Temporary name an old container is parked under while its
/// replacement takes the canonical name during recreate.
pub fn sentinel_name(canonical: &str) -> String {
  let suffix = uuid::Uuid::new_v4().simple().to_string();
  format!("{canonical}_replace_{}", &suffix[..12])
}

/// The full label set for a managed container.
pub fn container_labels(
  project: &Project,
  service: &ServiceSpec,
  index: u32,
  oneoff: bool,
  config_hash: &str,
) -> BTreeMap<String, String> {
  let mut labels: BTreeMap<String, String> = service
    .labels
    .iter()
    .map(|(k, v)| (k.clone(), v.clone()))
    .collect();
  labels
    .insert(PROJECT_LABEL.to_string(), project.name.clone());
  labels
    .insert(SERVICE_LABEL.to_string(), service.name.clone());
  labels.insert(
    CONTAINER_NUMBER_LABEL.to_string(),
    index.to_string(),
  );
  labels.insert(ONEOFF_LABEL.to_string(), oneoff.to_string());
  labels.insert(
    VERSION_LABEL.to_string(),
    env!("CARGO_PKG_VERSION").to_string(),
  );
  labels.insert(
    CONFIG_HASH_LABEL.to_string(),
    config_hash.to_string(),
  );
  let depends_on = serialize_depends_on(service);
  if !depends_on.is_empty() {
    labels.insert(DEPENDS_ON_LABEL.to_string(), depends_on);
  }
  labels
}

/// `service:condition:required` triples, comma separated. Enough to
/// rebuild teardown ordering from Engine state alone.
pub fn serialize_depends_on(service: &ServiceSpec) -> String {
  service
    .dependencies()
    .iter()
    .map(|(name, dep)| {
      format!("{name}:{}:{}", dep.condition, dep.required)
    })
    .collect::<Vec<_>>()
    .join(",")
}

pub fn parse_depends_on(
  label: &str,
) -> Vec<(String, model::DependsOnSpec)> {
  label
    .split(',')
    .filter(|entry| !entry.is_empty())
    .filter_map(|entry| {
      let mut parts = entry.splitn(3, ':');
      let name = parts.next()?.to_string();
      let condition = match parts.next() {
        Some("service_healthy") => {
          model::DependencyCondition::Healthy
        }
        Some("service_completed_successfully") => {
          model::DependencyCondition::CompletedSuccessfully
        }
        _ => model::DependencyCondition::Started,
      };
      let required = parts.next() != Some("false");
      Some((name, model::DependsOnSpec { condition, required }))
    })
    .collect()
}

/// Replica index parsed from the container-number label.
pub fn container_number(
  labels: &std::collections::HashMap<String, String>,
) -> Option<u32> {
  labels.get(CONTAINER_NUMBER_LABEL)?.parse().ok()
}

/// Deterministic digest of the resolved service definition. Any
/// byte-level difference in the canonicalized config yields a new
/// hash; equal hashes mean an existing container may be reused.
///
/// The replica count is excluded: scaling a service up or down must
/// not invalidate the replicas already running.
pub fn config_hash(
  project: &Project,
  service: &ServiceSpec,
  image_id: Option<&str>,
) -> String {
  let mut spec = serde_json::to_value(service)
    .expect("ServiceSpec serialization is infallible");
  if let Some(map) = spec.as_object_mut() {
    map.remove("scale");
    map.remove("pull_policy");
  }
  let networks: Vec<String> = service
    .networks
    .keys()
    .map(|key| project.network_name(key))
    .collect();
  let volumes: Vec<String> = service
    .volumes
    .iter()
    .filter_map(|mount| mount.source.as_deref())
    .map(|key| {
      if project.volumes.contains_key(key) {
        project.volume_name(key)
      } else {
        key.to_string()
      }
    })
    .collect();
  let configs: Vec<String> = service
    .configs
    .iter()
    .filter_map(|reference| {
      project
        .configs
        .get(&reference.source)
        .and_then(|def| def.file.as_deref())
        .map(|file| {
          format!("{}:{}", reference.source, file.display())
        })
    })
    .collect();
  let secrets: Vec<String> = service
    .secrets
    .iter()
    .filter_map(|reference| {
      project
        .secrets
        .get(&reference.source)
        .and_then(|def| def.file.as_deref())
        .map(|file| {
          format!("{}:{}", reference.source, file.display())
        })
    })
    .collect();
  let canonical = serde_json::json!({
    "service": spec,
    "networks": networks,
    "volumes": volumes,
    "configs": configs,
    "secrets": secrets,
    "image_id": image_id,
  });
  // Maps inside a Value are sorted, so the rendering is canonical.
  let mut hasher = Sha256::new();
  hasher.update(canonical.to_string().as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn demo() -> Project {
    Project::from_yaml(
      "
name: demo
services:
  web:
    image: nginx
    environment:
      A: '1'
",
    )
    .unwrap()
  }

  #[test]
  fn canonical_names() {
    let project = demo();
    let web = &project.services["web"];
    assert_eq!(
      container_name(web, "demo", 1, false),
      "demo-web-1"
    );
    assert_eq!(container_name(web, "demo", 2, true), "demo_web_2");

    let mut named = web.clone();
    named.container_name = Some(String::from("frontend"));
    assert_eq!(container_name(&named, "demo", 1, false), "frontend");
  }

  #[test]
  fn config_hash_is_deterministic() {
    let project = demo();
    let web = &project.services["web"];
    let a = config_hash(&project, web, Some("sha256:abc"));
    let b = config_hash(&project, web, Some("sha256:abc"));
    assert_eq!(a, b);
  }

  #[test]
  fn config_hash_tracks_definition_changes() {
    let project = demo();
    let web = &project.services["web"];
    let base = config_hash(&project, web, None);

    let mut changed = web.clone();
    changed
      .environment
      .insert(String::from("A"), String::from("2"));
    assert_ne!(config_hash(&project, &changed, None), base);

    // A moved image digest also invalidates the hash.
    assert_ne!(config_hash(&project, web, Some("sha256:abc")), base);
  }

  #[test]
  fn config_hash_tracks_moved_config_file() {
    let base = Project::from_yaml(
      "
name: demo
services:
  web:
    image: nginx
    configs:
      - source: app
configs:
  app:
    file: /srv/demo/app.toml
",
    )
    .unwrap();
    let mut moved = base.clone();
    moved.configs.get_mut("app").unwrap().file =
      Some(std::path::PathBuf::from("/srv/demo/v2/app.toml"));

    assert_ne!(
      config_hash(&base, &base.services["web"], None),
      config_hash(&moved, &moved.services["web"], None),
    );
  }

  #[test]
  fn config_hash_ignores_scale() {
    let project = demo();
    let web = &project.services["web"];
    let base = config_hash(&project, web, None);
    let mut scaled = web.clone();
    scaled.scale = 5;
    assert_eq!(config_hash(&project, &scaled, None), base);
  }

  #[test]
  fn depends_on_round_trips_through_label() {
    let project = Project::from_yaml(
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
    .unwrap();
    let label = serialize_depends_on(&project.services["web"]);
    assert_eq!(label, "db:service_healthy:true");
    let parsed = parse_depends_on(&label);
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].0, "db");
    assert_eq!(
      parsed[0].1.condition,
      model::DependencyCondition::Healthy
    );
    assert!(parsed[0].1.required);
  }
}
