use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bollard::Docker;
use futures_util::StreamExt;

use super::{
  Container, ContainerDetails, ContainerState, CreateContainer,
  CreateNetwork, CreateVolume, EndpointSpec, Engine, EngineError,
  EngineResult, Filters, HealthState, ImageInfo, LogStream,
  LogsQuery, NetworkSummary, VolumeSummary, parse_container_state,
};

/// The production Engine, speaking to a Docker compatible API
/// through bollard. All conversions between the wire models and the
/// engine types live here.
pub struct DockerEngine {
  docker: Docker,
}

impl DockerEngine {
  pub fn connect() -> anyhow::Result<DockerEngine> {
    let docker = Docker::connect_with_defaults().map_err(|e| {
      anyhow::anyhow!("Failed to connect to container engine: {e}")
    })?;
    Ok(DockerEngine { docker })
  }
}

fn map_err(
  e: bollard::errors::Error,
  resource: &'static str,
  name: &str,
) -> EngineError {
  match e {
    bollard::errors::Error::DockerResponseServerError {
      status_code,
      message,
    } => match status_code {
      404 => EngineError::NotFound {
        resource,
        name: name.to_string(),
      },
      409 => EngineError::Conflict {
        resource,
        name: name.to_string(),
        message,
      },
      500.. => EngineError::Unavailable { message },
      _ => EngineError::Api { message },
    },
    // Everything below the HTTP layer is transport trouble.
    e => EngineError::Unavailable {
      message: format!("{e}"),
    },
  }
}

fn convert_summary(
  summary: bollard::models::ContainerSummary,
) -> Container {
  Container {
    id: summary.id.unwrap_or_default(),
    name: summary
      .names
      .unwrap_or_default()
      .first()
      .map(|name| name.trim_start_matches('/').to_string())
      .unwrap_or_default(),
    image: summary.image.unwrap_or_default(),
    image_id: summary.image_id.unwrap_or_default(),
    labels: summary.labels.unwrap_or_default(),
    state: summary
      .state
      .map(|state| parse_container_state(&state.to_string()))
      .unwrap_or_default(),
    created: summary.created.unwrap_or_default(),
  }
}

fn convert_details(
  inspect: bollard::models::ContainerInspectResponse,
) -> ContainerDetails {
  let state = inspect.state.unwrap_or_default();
  let health = state
    .health
    .and_then(|h| h.status)
    .and_then(|status| {
      match status.to_string().to_lowercase().as_str() {
        "starting" => Some(HealthState::Starting),
        "healthy" => Some(HealthState::Healthy),
        "unhealthy" => Some(HealthState::Unhealthy),
        _ => None,
      }
    });
  ContainerDetails {
    id: inspect.id.unwrap_or_default(),
    name: inspect
      .name
      .as_deref()
      .map(|name| name.trim_start_matches('/').to_string())
      .unwrap_or_default(),
    image_id: inspect.image.unwrap_or_default(),
    labels: inspect
      .config
      .and_then(|config| config.labels)
      .unwrap_or_default(),
    state: state
      .status
      .map(|status| parse_container_state(&status.to_string()))
      .unwrap_or(ContainerState::Unknown),
    health,
    exit_code: state.exit_code,
    volume_mounts: inspect
      .mounts
      .unwrap_or_default()
      .into_iter()
      .filter(|mount| {
        mount
          .typ
          .as_ref()
          .map(|typ| typ.to_string().to_lowercase() == "volume")
          .unwrap_or(false)
      })
      .filter_map(|mount| {
        Some(super::VolumeMountPoint {
          name: mount.name?,
          destination: mount.destination?,
        })
      })
      .collect(),
    networks: inspect
      .network_settings
      .and_then(|settings| settings.networks)
      .map(|networks| networks.into_keys().collect())
      .unwrap_or_default(),
  }
}

fn convert_endpoint(
  endpoint: &EndpointSpec,
) -> bollard::models::EndpointSettings {
  let ipam = if endpoint.ipv4_address.is_some()
    || endpoint.ipv6_address.is_some()
  {
    Some(bollard::models::EndpointIpamConfig {
      ipv4_address: endpoint.ipv4_address.clone(),
      ipv6_address: endpoint.ipv6_address.clone(),
      ..Default::default()
    })
  } else {
    None
  };
  bollard::models::EndpointSettings {
    aliases: if endpoint.aliases.is_empty() {
      None
    } else {
      Some(endpoint.aliases.clone())
    },
    ipam_config: ipam,
    mac_address: endpoint.mac_address.clone(),
    ..Default::default()
  }
}

fn convert_restart_policy(
  name: &str,
) -> Option<bollard::models::RestartPolicy> {
  use bollard::models::RestartPolicyNameEnum::*;
  let name = match name {
    "always" => ALWAYS,
    "on-failure" => ON_FAILURE,
    "unless-stopped" => UNLESS_STOPPED,
    "no" => NO,
    _ => return None,
  };
  Some(bollard::models::RestartPolicy {
    name: Some(name),
    maximum_retry_count: None,
  })
}

fn create_body(
  spec: &CreateContainer,
) -> bollard::models::ContainerCreateBody {
  let port_bindings: bollard::models::PortMap = spec
    .ports
    .iter()
    .filter(|port| port.published.is_some())
    .map(|port| {
      (
        format!("{}/{}", port.target, port.protocol),
        Some(vec![bollard::models::PortBinding {
          host_ip: port.host_ip.clone(),
          host_port: port.published.map(|p| p.to_string()),
        }]),
      )
    })
    .collect();

  let host_config = bollard::models::HostConfig {
    binds: if spec.binds.is_empty() {
      None
    } else {
      Some(spec.binds.clone())
    },
    tmpfs: if spec.tmpfs.is_empty() {
      None
    } else {
      Some(
        spec
          .tmpfs
          .iter()
          .map(|path| (path.clone(), String::new()))
          .collect(),
      )
    },
    devices: if spec.devices.is_empty() {
      None
    } else {
      Some(
        spec
          .devices
          .iter()
          .map(|device| bollard::models::DeviceMapping {
            path_on_host: Some(device.clone()),
            path_in_container: Some(device.clone()),
            cgroup_permissions: None,
          })
          .collect(),
      )
    },
    cap_add: if spec.cap_add.is_empty() {
      None
    } else {
      Some(spec.cap_add.clone())
    },
    cap_drop: if spec.cap_drop.is_empty() {
      None
    } else {
      Some(spec.cap_drop.clone())
    },
    sysctls: if spec.sysctls.is_empty() {
      None
    } else {
      Some(spec.sysctls.clone().into_iter().collect())
    },
    ulimits: if spec.ulimits.is_empty() {
      None
    } else {
      Some(
        spec
          .ulimits
          .iter()
          .map(|ulimit| bollard::models::ResourcesUlimits {
            name: Some(ulimit.name.clone()),
            soft: Some(ulimit.soft),
            hard: Some(ulimit.hard),
          })
          .collect(),
      )
    },
    init: spec.init,
    privileged: Some(spec.privileged),
    readonly_rootfs: Some(spec.read_only),
    network_mode: spec.network_mode.clone(),
    ipc_mode: spec.ipc_mode.clone(),
    port_bindings: if port_bindings.is_empty() {
      None
    } else {
      Some(port_bindings)
    },
    restart_policy: spec
      .restart
      .as_deref()
      .and_then(convert_restart_policy),
    ..Default::default()
  };

  // Only the first endpoint can ride along on create; the rest are
  // connected before start.
  let networking_config = spec.endpoints.first().map(|endpoint| {
    bollard::models::NetworkingConfig {
      endpoints_config: Some(HashMap::from([(
        endpoint.network.clone(),
        convert_endpoint(endpoint),
      )])),
    }
  });

  let healthcheck = spec.healthcheck.as_ref().map(|check| {
    bollard::models::HealthConfig {
      test: Some(check.test.clone()),
      interval: check.interval.map(nanos),
      timeout: check.timeout.map(nanos),
      retries: check.retries.map(|r| r as i64),
      start_period: check.start_period.map(nanos),
      start_interval: check.start_interval.map(nanos),
    }
  });

  bollard::models::ContainerCreateBody {
    image: Some(spec.image.clone()),
    entrypoint: spec.entrypoint.clone(),
    cmd: spec.command.clone(),
    volumes: if spec.anon_volumes.is_empty() {
      None
    } else {
      Some(
        spec
          .anon_volumes
          .iter()
          .map(|target| (target.clone(), Default::default()))
          .collect(),
      )
    },
    env: if spec.env.is_empty() {
      None
    } else {
      Some(spec.env.clone())
    },
    labels: Some(
      spec
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    ),
    user: spec.user.clone(),
    working_dir: spec.working_dir.clone(),
    stop_signal: spec.stop_signal.clone(),
    stop_timeout: spec.stop_grace.map(|d| d.as_secs() as i64),
    healthcheck,
    host_config: Some(host_config),
    networking_config,
    ..Default::default()
  }
}

fn nanos(duration: Duration) -> i64 {
  duration.as_nanos() as i64
}

#[async_trait]
impl Engine for DockerEngine {
  async fn list_containers(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<Container>> {
    let options =
      bollard::query_parameters::ListContainersOptionsBuilder::default()
        .all(true)
        .filters(&filters.as_map())
        .build();
    let containers = self
      .docker
      .list_containers(Some(options))
      .await
      .map_err(|e| map_err(e, "container", "<list>"))?;
    Ok(containers.into_iter().map(convert_summary).collect())
  }

  async fn inspect_container(
    &self,
    name: &str,
  ) -> EngineResult<ContainerDetails> {
    let inspect = self
      .docker
      .inspect_container(
        name,
        None::<bollard::query_parameters::InspectContainerOptions>,
      )
      .await
      .map_err(|e| map_err(e, "container", name))?;
    Ok(convert_details(inspect))
  }

  async fn create_container(
    &self,
    name: &str,
    spec: CreateContainer,
  ) -> EngineResult<String> {
    let mut builder =
      bollard::query_parameters::CreateContainerOptionsBuilder::default()
        .name(name);
    if let Some(platform) = spec.platform.as_deref() {
      builder = builder.platform(platform);
    }
    let response = self
      .docker
      .create_container(Some(builder.build()), create_body(&spec))
      .await
      .map_err(|e| map_err(e, "container", name))?;
    Ok(response.id)
  }

  async fn start_container(&self, name: &str) -> EngineResult<()> {
    self
      .docker
      .start_container(
        name,
        None::<bollard::query_parameters::StartContainerOptions>,
      )
      .await
      .map_err(|e| map_err(e, "container", name))
  }

  async fn stop_container(
    &self,
    name: &str,
    signal: Option<String>,
    grace: Option<Duration>,
  ) -> EngineResult<()> {
    let mut builder =
      bollard::query_parameters::StopContainerOptionsBuilder::default();
    if let Some(signal) = signal {
      builder = builder.signal(&signal);
    }
    if let Some(grace) = grace {
      builder = builder.t(grace.as_secs() as i32);
    }
    self
      .docker
      .stop_container(name, Some(builder.build()))
      .await
      .map_err(|e| map_err(e, "container", name))
  }

  async fn kill_container(
    &self,
    name: &str,
    signal: &str,
  ) -> EngineResult<()> {
    let options =
      bollard::query_parameters::KillContainerOptionsBuilder::default()
        .signal(signal)
        .build();
    self
      .docker
      .kill_container(name, Some(options))
      .await
      .map_err(|e| map_err(e, "container", name))
  }

  async fn pause_container(&self, name: &str) -> EngineResult<()> {
    self
      .docker
      .pause_container(name)
      .await
      .map_err(|e| map_err(e, "container", name))
  }

  async fn unpause_container(
    &self,
    name: &str,
  ) -> EngineResult<()> {
    self
      .docker
      .unpause_container(name)
      .await
      .map_err(|e| map_err(e, "container", name))
  }

  async fn remove_container(
    &self,
    name: &str,
    force: bool,
    volumes: bool,
  ) -> EngineResult<()> {
    let options =
      bollard::query_parameters::RemoveContainerOptionsBuilder::default()
        .force(force)
        .v(volumes)
        .build();
    self
      .docker
      .remove_container(name, Some(options))
      .await
      .map_err(|e| map_err(e, "container", name))
  }

  async fn rename_container(
    &self,
    name: &str,
    new_name: &str,
  ) -> EngineResult<()> {
    let options =
      bollard::query_parameters::RenameContainerOptionsBuilder::default()
        .name(new_name)
        .build();
    self
      .docker
      .rename_container(name, options)
      .await
      .map_err(|e| map_err(e, "container", name))
  }

  async fn wait_container(&self, name: &str) -> EngineResult<i64> {
    let mut stream = self.docker.wait_container(
      name,
      None::<bollard::query_parameters::WaitContainerOptions>,
    );
    match stream.next().await {
      Some(Ok(response)) => Ok(response.status_code),
      // Non-zero exits surface as a typed error on the stream.
      Some(Err(
        bollard::errors::Error::DockerContainerWaitError {
          code,
          ..
        },
      )) => Ok(code),
      Some(Err(e)) => Err(map_err(e, "container", name)),
      None => Err(EngineError::Api {
        message: format!(
          "wait on container '{name}' ended without a status"
        ),
      }),
    }
  }

  async fn container_logs(
    &self,
    name: &str,
    query: LogsQuery,
  ) -> EngineResult<LogStream> {
    let mut builder =
      bollard::query_parameters::LogsOptionsBuilder::default()
        .stdout(true)
        .stderr(true)
        .follow(query.follow)
        .timestamps(query.timestamps);
    if let Some(tail) = query.tail.as_deref() {
      builder = builder.tail(tail);
    }
    let name = name.to_string();
    let stream = self
      .docker
      .logs(&name, Some(builder.build()))
      .map(move |chunk| match chunk {
        Ok(output) => Ok(
          String::from_utf8_lossy(&output.into_bytes())
            .trim_end_matches('\n')
            .to_string(),
        ),
        Err(e) => Err(map_err(e, "container", &name)),
      });
    Ok(Box::pin(stream))
  }

  async fn list_networks(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<NetworkSummary>> {
    let options =
      bollard::query_parameters::ListNetworksOptionsBuilder::default()
        .filters(&filters.as_map())
        .build();
    let networks = self
      .docker
      .list_networks(Some(options))
      .await
      .map_err(|e| map_err(e, "network", "<list>"))?;
    Ok(
      networks
        .into_iter()
        .map(|network| NetworkSummary {
          id: network.id.unwrap_or_default(),
          name: network.name.unwrap_or_default(),
          labels: network.labels.unwrap_or_default(),
        })
        .collect(),
    )
  }

  async fn create_network(
    &self,
    spec: CreateNetwork,
  ) -> EngineResult<String> {
    let request = bollard::models::NetworkCreateRequest {
      name: spec.name.clone(),
      driver: spec.driver.clone(),
      attachable: Some(spec.attachable),
      labels: Some(
        spec
          .labels
          .iter()
          .map(|(k, v)| (k.clone(), v.clone()))
          .collect(),
      ),
      options: if spec.options.is_empty() {
        None
      } else {
        Some(spec.options.clone())
      },
      ..Default::default()
    };
    let response = self
      .docker
      .create_network(request)
      .await
      .map_err(|e| map_err(e, "network", &spec.name))?;
    Ok(response.id)
  }

  async fn remove_network(&self, name: &str) -> EngineResult<()> {
    self
      .docker
      .remove_network(name)
      .await
      .map_err(|e| map_err(e, "network", name))
  }

  async fn connect_network(
    &self,
    network: &str,
    container: &str,
    endpoint: EndpointSpec,
  ) -> EngineResult<()> {
    let request = bollard::models::NetworkConnectRequest {
      container: Some(container.to_string()),
      endpoint_config: Some(convert_endpoint(&endpoint)),
    };
    self
      .docker
      .connect_network(network, request)
      .await
      .map_err(|e| map_err(e, "network", network))
  }

  async fn list_volumes(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<VolumeSummary>> {
    let options =
      bollard::query_parameters::ListVolumesOptionsBuilder::default()
        .filters(&filters.as_map())
        .build();
    let response = self
      .docker
      .list_volumes(Some(options))
      .await
      .map_err(|e| map_err(e, "volume", "<list>"))?;
    Ok(
      response
        .volumes
        .unwrap_or_default()
        .into_iter()
        .map(|volume| VolumeSummary {
          name: volume.name,
          labels: volume.labels,
        })
        .collect(),
    )
  }

  async fn create_volume(
    &self,
    spec: CreateVolume,
  ) -> EngineResult<()> {
    let options = bollard::models::VolumeCreateOptions {
      name: Some(spec.name.clone()),
      driver: spec.driver.clone(),
      labels: Some(
        spec
          .labels
          .iter()
          .map(|(k, v)| (k.clone(), v.clone()))
          .collect(),
      ),
      driver_opts: if spec.driver_opts.is_empty() {
        None
      } else {
        Some(spec.driver_opts.clone())
      },
      ..Default::default()
    };
    self
      .docker
      .create_volume(options)
      .await
      .map_err(|e| map_err(e, "volume", &spec.name))?;
    Ok(())
  }

  async fn remove_volume(&self, name: &str) -> EngineResult<()> {
    self
      .docker
      .remove_volume(
        name,
        None::<bollard::query_parameters::RemoveVolumeOptions>,
      )
      .await
      .map_err(|e| map_err(e, "volume", name))
  }

  async fn inspect_image(
    &self,
    name: &str,
  ) -> EngineResult<ImageInfo> {
    let inspect = self
      .docker
      .inspect_image(name)
      .await
      .map_err(|e| map_err(e, "image", name))?;
    Ok(ImageInfo {
      id: inspect.id.unwrap_or_default(),
    })
  }

  async fn pull_image(
    &self,
    name: &str,
    platform: Option<&str>,
  ) -> EngineResult<()> {
    let mut builder =
      bollard::query_parameters::CreateImageOptionsBuilder::default()
        .from_image(name);
    if let Some(platform) = platform {
      builder = builder.platform(platform);
    }
    let mut stream =
      self.docker.create_image(Some(builder.build()), None, None);
    while let Some(progress) = stream.next().await {
      progress.map_err(|e| map_err(e, "image", name))?;
    }
    Ok(())
  }

  async fn remove_image(&self, name: &str) -> EngineResult<()> {
    self
      .docker
      .remove_image(
        name,
        None::<bollard::query_parameters::RemoveImageOptions>,
        None,
      )
      .await
      .map_err(|e| map_err(e, "image", name))?;
    Ok(())
  }
}
