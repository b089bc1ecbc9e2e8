use std::{
  collections::{HashMap, HashSet},
  sync::Mutex,
  time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;

use super::{
  Container, ContainerDetails, ContainerState, CreateContainer,
  CreateNetwork, CreateVolume, EndpointSpec, Engine, EngineError,
  EngineResult, Filters, HealthState, ImageInfo, LogStream,
  LogsQuery, NetworkSummary, VolumeSummary,
};

/// In-memory Engine for tests. Mutations are recorded in `calls`
/// in invocation order so tests can assert ordering guarantees.
#[derive(Default)]
pub struct FakeEngine {
  state: Mutex<FakeState>,
  calls: Mutex<Vec<String>>,
  fail_start: Mutex<HashSet<String>>,
  exit_on_start: Mutex<HashMap<String, i64>>,
  unhealthy: Mutex<HashSet<String>>,
  ignore_stop: Mutex<HashSet<String>>,
}

#[derive(Default)]
struct FakeState {
  containers: HashMap<String, FakeContainer>,
  networks: HashMap<String, HashMap<String, String>>,
  volumes: HashMap<String, HashMap<String, String>>,
  images: HashMap<String, String>,
  next_id: u64,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
  pub id: String,
  pub name: String,
  pub image: String,
  pub image_id: String,
  pub labels: HashMap<String, String>,
  pub state: ContainerState,
  pub health: Option<HealthState>,
  pub exit_code: Option<i64>,
  pub has_healthcheck: bool,
  pub binds: Vec<String>,
  pub networks: Vec<String>,
  pub created: i64,
}

impl FakeEngine {
  pub fn new() -> FakeEngine {
    FakeEngine::default()
  }

  pub fn add_image(&self, name: &str, id: &str) {
    self
      .state
      .lock()
      .unwrap()
      .images
      .insert(name.to_string(), id.to_string());
  }

  /// Make `start` fail for this container name.
  pub fn fail_start(&self, name: &str) {
    self.fail_start.lock().unwrap().insert(name.to_string());
  }

  /// Make the container exit immediately on start.
  pub fn exit_on_start(&self, name: &str, code: i64) {
    self
      .exit_on_start
      .lock()
      .unwrap()
      .insert(name.to_string(), code);
  }

  /// Health probes for this container report unhealthy.
  pub fn set_unhealthy(&self, name: &str) {
    self.unhealthy.lock().unwrap().insert(name.to_string());
  }

  /// The container shrugs off SIGTERM; only kill takes it down.
  pub fn ignore_stop(&self, name: &str) {
    self.ignore_stop.lock().unwrap().insert(name.to_string());
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn clear_calls(&self) {
    self.calls.lock().unwrap().clear();
  }

  pub fn container(&self, name: &str) -> Option<FakeContainer> {
    self.state.lock().unwrap().containers.get(name).cloned()
  }

  pub fn container_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self
      .state
      .lock()
      .unwrap()
      .containers
      .keys()
      .cloned()
      .collect();
    names.sort();
    names
  }

  pub fn network_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self
      .state
      .lock()
      .unwrap()
      .networks
      .keys()
      .cloned()
      .collect();
    names.sort();
    names
  }

  pub fn volume_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self
      .state
      .lock()
      .unwrap()
      .volumes
      .keys()
      .cloned()
      .collect();
    names.sort();
    names
  }

  /// Seed a pre-existing container, as if left by a prior run.
  pub fn seed_container(
    &self,
    name: &str,
    labels: HashMap<String, String>,
    state: ContainerState,
    image_id: &str,
  ) {
    let mut inner = self.state.lock().unwrap();
    inner.next_id += 1;
    let container = FakeContainer {
      id: format!("fake-{}", inner.next_id),
      name: name.to_string(),
      image: image_id.to_string(),
      image_id: image_id.to_string(),
      labels,
      state,
      health: None,
      exit_code: matches!(state, ContainerState::Exited)
        .then_some(0),
      has_healthcheck: false,
      binds: Vec::new(),
      networks: Vec::new(),
      created: inner.next_id as i64,
    };
    inner.containers.insert(name.to_string(), container);
  }

  fn record(&self, call: String) {
    self.calls.lock().unwrap().push(call);
  }

  fn matches(
    container: &FakeContainer,
    filters: &Filters,
  ) -> bool {
    filters.labels.iter().all(|filter| {
      match filter.split_once('=') {
        Some((key, value)) => {
          container.labels.get(key).map(String::as_str)
            == Some(value)
        }
        None => container.labels.contains_key(filter),
      }
    }) && (filters.names.is_empty()
      || filters.names.iter().any(|n| container.name.contains(n)))
  }
}

fn not_found(
  resource: &'static str,
  name: &str,
) -> EngineError {
  EngineError::NotFound {
    resource,
    name: name.to_string(),
  }
}

#[async_trait]
impl Engine for FakeEngine {
  async fn list_containers(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<Container>> {
    let inner = self.state.lock().unwrap();
    let mut containers: Vec<Container> = inner
      .containers
      .values()
      .filter(|container| Self::matches(container, &filters))
      .map(|container| Container {
        id: container.id.clone(),
        name: container.name.clone(),
        image: container.image.clone(),
        image_id: container.image_id.clone(),
        labels: container.labels.clone(),
        state: container.state,
        created: container.created,
      })
      .collect();
    containers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(containers)
  }

  async fn inspect_container(
    &self,
    name: &str,
  ) -> EngineResult<ContainerDetails> {
    let mut inner = self.state.lock().unwrap();
    let unhealthy =
      self.unhealthy.lock().unwrap().contains(name);
    let container = inner
      .containers
      .get_mut(name)
      .ok_or(not_found("container", name))?;
    // Probes resolve on first observation after start.
    if container.health == Some(HealthState::Starting) {
      container.health = Some(if unhealthy {
        HealthState::Unhealthy
      } else {
        HealthState::Healthy
      });
    }
    Ok(ContainerDetails {
      id: container.id.clone(),
      name: container.name.clone(),
      image_id: container.image_id.clone(),
      labels: container.labels.clone(),
      state: container.state,
      health: container.health,
      exit_code: container.exit_code,
      volume_mounts: container
        .binds
        .iter()
        .filter_map(|bind| {
          let (source, rest) = bind.split_once(':')?;
          if source.starts_with('/') {
            return None;
          }
          Some(super::VolumeMountPoint {
            name: source.to_string(),
            destination: rest
              .split(':')
              .next()
              .unwrap_or(rest)
              .to_string(),
          })
        })
        .collect(),
      networks: container.networks.clone(),
    })
  }

  async fn create_container(
    &self,
    name: &str,
    spec: CreateContainer,
  ) -> EngineResult<String> {
    self.record(format!("create {name}"));
    let mut inner = self.state.lock().unwrap();
    if inner.containers.contains_key(name) {
      return Err(EngineError::Conflict {
        resource: "container",
        name: name.to_string(),
        message: String::from("name already in use"),
      });
    }
    let image_id = inner
      .images
      .get(&spec.image)
      .cloned()
      .unwrap_or_else(|| format!("sha256:{}", spec.image));
    inner.next_id += 1;
    let container = FakeContainer {
      id: format!("fake-{}", inner.next_id),
      name: name.to_string(),
      image: spec.image.clone(),
      image_id,
      labels: spec.labels.clone().into_iter().collect(),
      state: ContainerState::Created,
      health: None,
      exit_code: None,
      has_healthcheck: spec.healthcheck.is_some(),
      binds: spec.binds.clone(),
      networks: spec
        .endpoints
        .iter()
        .map(|endpoint| endpoint.network.clone())
        .collect(),
      created: inner.next_id as i64,
    };
    let id = container.id.clone();
    inner.containers.insert(name.to_string(), container);
    Ok(id)
  }

  async fn start_container(&self, name: &str) -> EngineResult<()> {
    self.record(format!("start {name}"));
    if self.fail_start.lock().unwrap().contains(name) {
      return Err(EngineError::Api {
        message: format!("cannot start container {name}"),
      });
    }
    let exit = self.exit_on_start.lock().unwrap().get(name).copied();
    let mut inner = self.state.lock().unwrap();
    let container = inner
      .containers
      .get_mut(name)
      .ok_or(not_found("container", name))?;
    match exit {
      Some(code) => {
        container.state = ContainerState::Exited;
        container.exit_code = Some(code);
      }
      None => {
        container.state = ContainerState::Running;
        container.exit_code = None;
        if container.has_healthcheck {
          container.health = Some(HealthState::Starting);
        }
      }
    }
    Ok(())
  }

  async fn stop_container(
    &self,
    name: &str,
    _signal: Option<String>,
    _grace: Option<Duration>,
  ) -> EngineResult<()> {
    self.record(format!("stop {name}"));
    if self.ignore_stop.lock().unwrap().contains(name) {
      return Ok(());
    }
    let mut inner = self.state.lock().unwrap();
    let container = inner
      .containers
      .get_mut(name)
      .ok_or(not_found("container", name))?;
    if matches!(
      container.state,
      ContainerState::Running | ContainerState::Paused
    ) {
      container.state = ContainerState::Exited;
      container.exit_code = Some(0);
      container.health = None;
    }
    Ok(())
  }

  async fn kill_container(
    &self,
    name: &str,
    signal: &str,
  ) -> EngineResult<()> {
    self.record(format!("kill {name} {signal}"));
    let mut inner = self.state.lock().unwrap();
    let container = inner
      .containers
      .get_mut(name)
      .ok_or(not_found("container", name))?;
    container.state = ContainerState::Exited;
    container.exit_code = Some(137);
    Ok(())
  }

  async fn pause_container(&self, name: &str) -> EngineResult<()> {
    self.record(format!("pause {name}"));
    let mut inner = self.state.lock().unwrap();
    let container = inner
      .containers
      .get_mut(name)
      .ok_or(not_found("container", name))?;
    if container.state == ContainerState::Running {
      container.state = ContainerState::Paused;
    }
    Ok(())
  }

  async fn unpause_container(
    &self,
    name: &str,
  ) -> EngineResult<()> {
    self.record(format!("unpause {name}"));
    let mut inner = self.state.lock().unwrap();
    let container = inner
      .containers
      .get_mut(name)
      .ok_or(not_found("container", name))?;
    if container.state == ContainerState::Paused {
      container.state = ContainerState::Running;
    }
    Ok(())
  }

  async fn remove_container(
    &self,
    name: &str,
    force: bool,
    _volumes: bool,
  ) -> EngineResult<()> {
    self.record(format!("remove {name}"));
    let mut inner = self.state.lock().unwrap();
    let container = inner
      .containers
      .get(name)
      .ok_or(not_found("container", name))?;
    if container.state == ContainerState::Running && !force {
      return Err(EngineError::Conflict {
        resource: "container",
        name: name.to_string(),
        message: String::from("container is running"),
      });
    }
    inner.containers.remove(name);
    Ok(())
  }

  async fn rename_container(
    &self,
    name: &str,
    new_name: &str,
  ) -> EngineResult<()> {
    self.record(format!("rename {name} -> {new_name}"));
    let mut inner = self.state.lock().unwrap();
    if inner.containers.contains_key(new_name) {
      return Err(EngineError::Conflict {
        resource: "container",
        name: new_name.to_string(),
        message: String::from("name already in use"),
      });
    }
    let mut container = inner
      .containers
      .remove(name)
      .ok_or(not_found("container", name))?;
    container.name = new_name.to_string();
    inner.containers.insert(new_name.to_string(), container);
    Ok(())
  }

  async fn wait_container(&self, name: &str) -> EngineResult<i64> {
    for _ in 0..500 {
      {
        let inner = self.state.lock().unwrap();
        let container = inner
          .containers
          .get(name)
          .ok_or(not_found("container", name))?;
        if container.state == ContainerState::Exited {
          return Ok(container.exit_code.unwrap_or(0));
        }
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Err(EngineError::Api {
      message: format!("container '{name}' never exited"),
    })
  }

  async fn container_logs(
    &self,
    name: &str,
    _query: LogsQuery,
  ) -> EngineResult<LogStream> {
    let lines = vec![Ok(format!("log line from {name}"))];
    Ok(futures_util::stream::iter(lines).boxed())
  }

  async fn list_networks(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<NetworkSummary>> {
    let inner = self.state.lock().unwrap();
    Ok(
      inner
        .networks
        .iter()
        .filter(|(_, labels)| {
          filters.labels.iter().all(|filter| {
            match filter.split_once('=') {
              Some((key, value)) => {
                labels.get(key).map(String::as_str) == Some(value)
              }
              None => labels.contains_key(filter),
            }
          })
        })
        .map(|(name, labels)| NetworkSummary {
          id: format!("net-{name}"),
          name: name.clone(),
          labels: labels.clone(),
        })
        .collect(),
    )
  }

  async fn create_network(
    &self,
    spec: CreateNetwork,
  ) -> EngineResult<String> {
    self.record(format!("create network {}", spec.name));
    let mut inner = self.state.lock().unwrap();
    inner.networks.insert(
      spec.name.clone(),
      spec.labels.into_iter().collect(),
    );
    Ok(format!("net-{}", spec.name))
  }

  async fn remove_network(&self, name: &str) -> EngineResult<()> {
    self.record(format!("remove network {name}"));
    let mut inner = self.state.lock().unwrap();
    inner
      .networks
      .remove(name)
      .map(|_| ())
      .ok_or(not_found("network", name))
  }

  async fn connect_network(
    &self,
    network: &str,
    container: &str,
    _endpoint: EndpointSpec,
  ) -> EngineResult<()> {
    self.record(format!("connect {container} {network}"));
    let mut inner = self.state.lock().unwrap();
    let container = inner
      .containers
      .get_mut(container)
      .ok_or(not_found("container", container))?;
    container.networks.push(network.to_string());
    Ok(())
  }

  async fn list_volumes(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<VolumeSummary>> {
    let inner = self.state.lock().unwrap();
    Ok(
      inner
        .volumes
        .iter()
        .filter(|(_, labels)| {
          filters.labels.iter().all(|filter| {
            match filter.split_once('=') {
              Some((key, value)) => {
                labels.get(key).map(String::as_str) == Some(value)
              }
              None => labels.contains_key(filter),
            }
          })
        })
        .map(|(name, labels)| VolumeSummary {
          name: name.clone(),
          labels: labels.clone(),
        })
        .collect(),
    )
  }

  async fn create_volume(
    &self,
    spec: CreateVolume,
  ) -> EngineResult<()> {
    self.record(format!("create volume {}", spec.name));
    let mut inner = self.state.lock().unwrap();
    inner.volumes.insert(
      spec.name.clone(),
      spec.labels.into_iter().collect(),
    );
    Ok(())
  }

  async fn remove_volume(&self, name: &str) -> EngineResult<()> {
    self.record(format!("remove volume {name}"));
    let mut inner = self.state.lock().unwrap();
    inner
      .volumes
      .remove(name)
      .map(|_| ())
      .ok_or(not_found("volume", name))
  }

  async fn inspect_image(
    &self,
    name: &str,
  ) -> EngineResult<ImageInfo> {
    let inner = self.state.lock().unwrap();
    inner
      .images
      .get(name)
      .map(|id| ImageInfo { id: id.clone() })
      .ok_or(not_found("image", name))
  }

  async fn pull_image(
    &self,
    name: &str,
    _platform: Option<&str>,
  ) -> EngineResult<()> {
    self.record(format!("pull {name}"));
    let mut inner = self.state.lock().unwrap();
    inner
      .images
      .insert(name.to_string(), format!("sha256:{name}"));
    Ok(())
  }

  async fn remove_image(&self, name: &str) -> EngineResult<()> {
    self.record(format!("remove image {name}"));
    let mut inner = self.state.lock().unwrap();
    inner.images.remove(name);
    Ok(())
  }
}
