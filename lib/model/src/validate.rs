use std::{collections::HashMap, sync::OnceLock};

use regex::Regex;

use crate::{
  DependencyCondition, Project, VolumeMountKind,
};

/// `[a-z0-9][a-z0-9_-]*`, shared by project and service names.
pub fn name_regex() -> &'static Regex {
  static NAME_REGEX: OnceLock<Regex> = OnceLock::new();
  NAME_REGEX.get_or_init(|| {
    Regex::new(r"^[a-z0-9][a-z0-9_-]*$")
      .expect("Failed to initialize name regex")
  })
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid project '{project}':{}", problems.iter().map(|p| format!("\n  - {p}")).collect::<String>())]
pub struct ValidationError {
  pub project: String,
  pub problems: Vec<String>,
}

impl Project {
  /// Model-level validation. Everything here is checkable without
  /// touching the Engine; convergence refuses to start otherwise.
  /// Dependency cycles are detected separately at graph build time.
  pub fn validate(&self) -> Result<(), ValidationError> {
    let mut problems = Vec::new();

    if !name_regex().is_match(&self.name) {
      problems.push(format!(
        "project name '{}' must match [a-z0-9][a-z0-9_-]*",
        self.name
      ));
    }

    let mut container_names: HashMap<&str, &str> = HashMap::new();

    for (name, service) in &self.services {
      if !name_regex().is_match(name) {
        problems.push(format!(
          "service name '{name}' must match [a-z0-9][a-z0-9_-]*"
        ));
      }

      if service.image.is_none() {
        problems.push(format!(
          "service '{name}' has no image. Images are produced by an external builder before convergence"
        ));
      }

      if let Some(container_name) = service.container_name.as_deref()
      {
        if service.scale > 1 {
          problems.push(format!(
            "service '{name}' declares container_name with scale {}. A fixed name cannot be shared by replicas",
            service.scale
          ));
        }
        if let Some(other) =
          container_names.insert(container_name, name)
        {
          problems.push(format!(
            "services '{other}' and '{name}' both declare container_name '{container_name}'"
          ));
        }
      }

      for (dep_name, dep) in service.dependencies() {
        let Some(target) = self.services.get(&dep_name) else {
          if dep.required {
            problems.push(format!(
              "service '{name}' depends on undefined service '{dep_name}'"
            ));
          }
          continue;
        };
        match dep.condition {
          DependencyCondition::Healthy => {
            let has_check = target
              .healthcheck
              .as_ref()
              .map(|c| c.is_active())
              .unwrap_or(false);
            if !has_check {
              problems.push(format!(
                "service '{name}' waits on '{dep_name}' becoming healthy, but '{dep_name}' has no healthcheck"
              ));
            }
          }
          DependencyCondition::CompletedSuccessfully => {
            if target.restart.is_long_running() {
              problems.push(format!(
                "service '{name}' waits on '{dep_name}' completing, but restart policy '{}' keeps '{dep_name}' running",
                target.restart
              ));
            }
          }
          DependencyCondition::Started => {}
        }
        if dep_name == *name {
          problems
            .push(format!("service '{name}' depends on itself"));
        }
      }

      for network in service.networks.keys() {
        if !self.networks.contains_key(network) {
          problems.push(format!(
            "service '{name}' joins undefined network '{network}'"
          ));
        }
      }

      for (kind, references, definitions) in [
        ("config", &service.configs, &self.configs),
        ("secret", &service.secrets, &self.secrets),
      ] {
        for reference in references {
          match definitions.get(&reference.source) {
            None => problems.push(format!(
              "service '{name}' references undefined {kind} '{}'",
              reference.source
            )),
            Some(def) if def.file.is_none() => {
              problems.push(format!(
                "{kind} '{}' has no file. Only file-backed {kind}s can be mounted",
                reference.source
              ))
            }
            Some(_) => {}
          }
        }
      }

      for mount in &service.volumes {
        match mount.kind {
          VolumeMountKind::Volume => {
            if let Some(source) = mount.source.as_deref()
              && !self.volumes.contains_key(source)
            {
              problems.push(format!(
                "service '{name}' mounts undefined volume '{source}'"
              ));
            }
          }
          VolumeMountKind::Tmpfs => {
            if mount.source.is_some() {
              problems.push(format!(
                "service '{name}' declares a tmpfs mount with a source"
              ));
            }
          }
          VolumeMountKind::Bind => {}
        }
      }
    }

    if problems.is_empty() {
      Ok(())
    } else {
      Err(ValidationError {
        project: self.name.clone(),
        problems,
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use indexmap::IndexMap;

  use crate::*;

  fn project(yaml: &str) -> anyhow::Result<Project> {
    Project::from_yaml(yaml)
  }

  #[test]
  fn accepts_minimal_project() {
    let project = project(
      "
name: demo
services:
  web:
    image: nginx
",
    )
    .unwrap();
    assert_eq!(project.services["web"].name, "web");
    // Implicit default network materialized.
    assert!(project.networks.contains_key("default"));
    assert!(
      project.services["web"].networks.contains_key("default")
    );
    assert_eq!(project.network_name("default"), "demo_default");
  }

  #[test]
  fn rejects_bad_names_and_missing_image() {
    let err = project(
      "
name: Demo
services:
  Web: {}
",
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("project name 'Demo'"));
    assert!(err.contains("service name 'Web'"));
    assert!(err.contains("no image"));
  }

  #[test]
  fn rejects_undefined_dependency() {
    let err = project(
      "
name: demo
services:
  web:
    image: nginx
    depends_on:
      db:
        condition: service_started
",
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("undefined service 'db'"));
  }

  #[test]
  fn optional_missing_dependency_is_dropped() {
    let project = project(
      "
name: demo
services:
  web:
    image: nginx
    depends_on:
      dashboard:
        condition: service_started
        required: false
",
    )
    .unwrap();
    assert_eq!(project.services.len(), 1);
  }

  #[test]
  fn rejects_healthy_gate_without_healthcheck() {
    let err = project(
      "
name: demo
services:
  db:
    image: pg
  web:
    image: nginx
    depends_on:
      db:
        condition: service_healthy
",
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("has no healthcheck"));
  }

  #[test]
  fn rejects_completion_gate_on_long_running_service() {
    let err = project(
      "
name: demo
services:
  migrate:
    image: migrator
    restart: always
  web:
    image: nginx
    depends_on:
      migrate:
        condition: service_completed_successfully
",
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("keeps 'migrate' running"));
  }

  #[test]
  fn rejects_conflicting_container_names() {
    let err = project(
      "
name: demo
services:
  one:
    image: a
    container_name: app
  two:
    image: b
    container_name: app
",
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("both declare container_name 'app'"));
  }

  #[test]
  fn rejects_container_name_with_scale() {
    let err = project(
      "
name: demo
services:
  one:
    image: a
    scale: 3
    container_name: app
",
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("scale 3"));
  }

  #[test]
  fn rejects_unknown_network_and_volume_references() {
    let err = project(
      "
name: demo
services:
  web:
    image: nginx
    networks:
      backend:
    volumes:
      - type: volume
        source: data
        target: /data
",
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("undefined network 'backend'"));
    assert!(err.contains("undefined volume 'data'"));
  }

  #[test]
  fn rejects_unknown_and_fileless_config_references() {
    let err = project(
      "
name: demo
services:
  web:
    image: nginx
    configs:
      - source: app
      - source: ghost
    secrets:
      - source: token
configs:
  app: {}
secrets:
  token:
    file: /etc/demo/token
",
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("undefined config 'ghost'"));
    assert!(err.contains("config 'app' has no file"));
    assert!(!err.contains("token"));
  }

  #[test]
  fn environment_deserializes_as_map() {
    let project = project(
      "
name: demo
services:
  web:
    image: nginx
    environment:
      A: '1'
      B: '2'
",
    )
    .unwrap();
    let env: IndexMap<String, String> =
      project.services["web"].environment.clone();
    assert_eq!(env["A"], "1");
    assert_eq!(env["B"], "2");
  }
}
