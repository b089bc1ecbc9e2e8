//! Translation from the project model to the Engine's create
//! payload. Everything name-shaped is resolved here: volume and
//! network keys become Engine names, `service:X` references become
//! `container:` modes against X's first replica.

use model::{CommandLine, Project, ServiceSpec, VolumeMountKind};

use crate::{
  engine::{
    CreateContainer, EndpointSpec, HealthcheckSpec, PortSpec,
    UlimitSpec,
  },
  labels,
};

pub struct ContainerSpecArgs<'a> {
  pub project: &'a Project,
  pub service: &'a ServiceSpec,
  pub index: u32,
  pub config_hash: &'a str,
  pub oneoff: bool,
  pub compatibility: bool,
  /// `volume:/target` binds adopted from a replaced container.
  pub adopted_binds: &'a [String],
  pub command_override: Option<Vec<String>>,
  pub default_platform: Option<&'a str>,
}

pub fn container_spec(args: ContainerSpecArgs<'_>) -> CreateContainer {
  let ContainerSpecArgs {
    project,
    service,
    index,
    config_hash,
    oneoff,
    compatibility,
    adopted_binds,
    command_override,
    default_platform,
  } = args;

  let mut binds: Vec<String> = adopted_binds.to_vec();
  let mut anon_volumes = Vec::new();
  let mut tmpfs = service.tmpfs.clone();
  for mount in &service.volumes {
    match mount.kind {
      VolumeMountKind::Volume => match mount.source.as_deref() {
        Some(source) => {
          let volume = project.volume_name(source);
          binds.push(bind_entry(
            &volume,
            &mount.target,
            mount.read_only,
          ));
        }
        None => {
          // Adopted targets already carry a volume.
          if !adopted_binds.iter().any(|bind| {
            bind.split(':').nth(1) == Some(mount.target.as_str())
          }) {
            anon_volumes.push(mount.target.clone());
          }
        }
      },
      VolumeMountKind::Bind => {
        if let Some(source) = mount.source.as_deref() {
          binds.push(bind_entry(
            source,
            &mount.target,
            mount.read_only,
          ));
        }
      }
      VolumeMountKind::Tmpfs => tmpfs.push(mount.target.clone()),
    }
  }

  // Configs and secrets are file-backed on a plain engine; each
  // lands as a read-only bind of the resolved file.
  for reference in &service.configs {
    if let Some(file) = project
      .configs
      .get(&reference.source)
      .and_then(|def| def.file.as_deref())
    {
      let file = file.display().to_string();
      let target = reference
        .target
        .clone()
        .unwrap_or_else(|| format!("/{}", reference.source));
      binds.push(bind_entry(&file, &target, true));
    }
  }
  for reference in &service.secrets {
    if let Some(file) = project
      .secrets
      .get(&reference.source)
      .and_then(|def| def.file.as_deref())
    {
      let file = file.display().to_string();
      let target = reference.target.clone().unwrap_or_else(|| {
        format!("/run/secrets/{}", reference.source)
      });
      binds.push(bind_entry(&file, &target, true));
    }
  }

  let network_mode =
    service.network_mode.as_deref().map(|mode| {
      resolve_container_reference(project, mode, compatibility)
    });
  let ipc_mode = service.ipc.as_deref().map(|mode| {
    resolve_container_reference(project, mode, compatibility)
  });

  // With an explicit network mode the container joins no project
  // networks.
  let endpoints = if network_mode.is_some() {
    Vec::new()
  } else {
    let mut attachments: Vec<_> =
      service.networks.iter().collect();
    attachments.sort_by_key(|(name, attachment)| {
      let priority = attachment
        .as_ref()
        .map(|a| a.priority)
        .unwrap_or_default();
      (-priority, name.to_string())
    });
    attachments
      .into_iter()
      .map(|(name, attachment)| {
        let attachment = attachment.clone().unwrap_or_default();
        let mut aliases = attachment.aliases.clone();
        if !aliases.contains(&service.name) {
          aliases.push(service.name.clone());
        }
        EndpointSpec {
          network: project.network_name(name),
          aliases,
          ipv4_address: attachment.ipv4_address,
          ipv6_address: attachment.ipv6_address,
          mac_address: attachment.mac_address,
        }
      })
      .collect()
  };

  CreateContainer {
    image: service.image.clone().unwrap_or_default(),
    entrypoint: service
      .entrypoint
      .as_ref()
      .map(CommandLine::to_exec),
    command: command_override.or_else(|| {
      service.command.as_ref().map(CommandLine::to_exec)
    }),
    env: service
      .environment
      .iter()
      .map(|(key, value)| format!("{key}={value}"))
      .collect(),
    labels: labels::container_labels(
      project,
      service,
      index,
      oneoff,
      config_hash,
    ),
    binds,
    anon_volumes,
    tmpfs,
    devices: service.devices.clone(),
    cap_add: service.cap_add.clone(),
    cap_drop: service.cap_drop.clone(),
    sysctls: service
      .sysctls
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect(),
    ulimits: service
      .ulimits
      .iter()
      .map(|(name, ulimit)| UlimitSpec {
        name: name.clone(),
        soft: ulimit.soft,
        hard: ulimit.hard,
      })
      .collect(),
    init: service.init,
    privileged: service.privileged,
    read_only: service.read_only,
    user: service.user.clone(),
    working_dir: service.working_dir.clone(),
    network_mode,
    ipc_mode,
    endpoints,
    ports: service
      .ports
      .iter()
      .map(|port| PortSpec {
        target: port.target,
        published: port.published,
        host_ip: port.host_ip.clone(),
        protocol: port.protocol.clone(),
      })
      .collect(),
    restart: match service.restart {
      model::RestartPolicy::No => None,
      policy => Some(policy.to_string()),
    },
    healthcheck: service
      .healthcheck
      .as_ref()
      .filter(|check| check.is_active())
      .map(convert_healthcheck),
    stop_signal: service.stop_signal.clone(),
    stop_grace: service.stop_grace_period.map(|d| d.0),
    platform: service
      .platform
      .clone()
      .or_else(|| default_platform.map(str::to_string)),
  }
}

fn bind_entry(
  source: &str,
  target: &str,
  read_only: bool,
) -> String {
  if read_only {
    format!("{source}:{target}:ro")
  } else {
    format!("{source}:{target}")
  }
}

/// `service:X` becomes `container:<X's first replica>`; everything
/// else passes through (`host`, `none`, `container:name`, ...).
fn resolve_container_reference(
  project: &Project,
  mode: &str,
  compatibility: bool,
) -> String {
  match mode.strip_prefix("service:") {
    Some(service) => match project.services.get(service) {
      Some(spec) => format!(
        "container:{}",
        labels::container_name(
          spec,
          &project.name,
          1,
          compatibility,
        )
      ),
      None => mode.to_string(),
    },
    None => mode.to_string(),
  }
}

/// Health probe config in exec form. A bare string test becomes
/// `CMD-SHELL`.
fn convert_healthcheck(
  check: &model::HealthCheckSpec,
) -> HealthcheckSpec {
  let test = match check.test.as_ref() {
    Some(CommandLine::Shell(line)) => {
      vec![String::from("CMD-SHELL"), line.clone()]
    }
    Some(CommandLine::Exec(args)) => args.clone(),
    None => Vec::new(),
  };
  HealthcheckSpec {
    test,
    interval: check.interval.map(|d| d.0),
    timeout: check.timeout.map(|d| d.0),
    retries: check.retries,
    start_period: check.start_period.map(|d| d.0),
    start_interval: check.start_interval.map(|d| d.0),
  }
}
