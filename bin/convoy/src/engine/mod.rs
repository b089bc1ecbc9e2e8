use std::{
  collections::HashMap, future::Future, str::FromStr, sync::Arc,
  time::Duration,
};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::Semaphore;

pub mod docker;
pub mod dry;
#[cfg(test)]
pub mod fake;

pub use docker::DockerEngine;
pub use dry::DryRunEngine;

pub type EngineResult<T> = Result<T, EngineError>;

/// Typed Engine failure. `NotFound` is load bearing: most verbs
/// treat it as benign for idempotence, and the Observer guarantees
/// nothing about a container surviving between list and inspect.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
  #[error("{resource} '{name}' not found")]
  NotFound { resource: &'static str, name: String },
  #[error("conflict on {resource} '{name}': {message}")]
  Conflict {
    resource: &'static str,
    name: String,
    message: String,
  },
  #[error("engine unavailable: {message}")]
  Unavailable { message: String },
  #[error("engine api error: {message}")]
  Api { message: String },
  #[error("engine call exceeded deadline of {deadline:?}")]
  Timeout { deadline: Duration },
}

impl EngineError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, EngineError::NotFound { .. })
  }

  /// Worth retrying with backoff.
  pub fn is_transient(&self) -> bool {
    matches!(self, EngineError::Unavailable { .. })
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  strum::Display,
  strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ContainerState {
  Created,
  Running,
  Paused,
  Restarting,
  Removing,
  Exited,
  Dead,
  #[default]
  Unknown,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum HealthState {
  Starting,
  Healthy,
  Unhealthy,
}

/// One row of a container listing, converted out of the Engine's
/// wire shape.
#[derive(Debug, Clone, Default)]
pub struct Container {
  pub id: String,
  /// Primary name, without the leading slash.
  pub name: String,
  pub image: String,
  pub image_id: String,
  pub labels: HashMap<String, String>,
  pub state: ContainerState,
  pub created: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
  pub id: String,
  pub name: String,
  pub image_id: String,
  pub labels: HashMap<String, String>,
  pub state: ContainerState,
  pub health: Option<HealthState>,
  pub exit_code: Option<i64>,
  /// Named volume mounts, for anonymous volume adoption.
  pub volume_mounts: Vec<VolumeMountPoint>,
  pub networks: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VolumeMountPoint {
  pub name: String,
  pub destination: String,
}

/// Everything needed to create one container. Assembled from the
/// service definition by the convert layer; the Engine
/// implementations translate it to their wire shape.
#[derive(Debug, Clone, Default)]
pub struct CreateContainer {
  pub image: String,
  pub entrypoint: Option<Vec<String>>,
  pub command: Option<Vec<String>>,
  pub env: Vec<String>,
  pub labels: std::collections::BTreeMap<String, String>,
  /// `volume:/target[:ro]` and `/host:/target[:ro]` entries.
  pub binds: Vec<String>,
  /// Mount targets backed by anonymous volumes.
  pub anon_volumes: Vec<String>,
  pub tmpfs: Vec<String>,
  pub devices: Vec<String>,
  pub cap_add: Vec<String>,
  pub cap_drop: Vec<String>,
  pub sysctls: HashMap<String, String>,
  pub ulimits: Vec<UlimitSpec>,
  pub init: Option<bool>,
  pub privileged: bool,
  pub read_only: bool,
  pub user: Option<String>,
  pub working_dir: Option<String>,
  pub network_mode: Option<String>,
  pub ipc_mode: Option<String>,
  /// Network endpoints, priority ordered. The first is passed at
  /// create time, the rest connected before start.
  pub endpoints: Vec<EndpointSpec>,
  pub ports: Vec<PortSpec>,
  pub restart: Option<String>,
  pub healthcheck: Option<HealthcheckSpec>,
  pub stop_signal: Option<String>,
  pub stop_grace: Option<Duration>,
  pub platform: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EndpointSpec {
  pub network: String,
  pub aliases: Vec<String>,
  pub ipv4_address: Option<String>,
  pub ipv6_address: Option<String>,
  pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PortSpec {
  pub target: u16,
  pub published: Option<u16>,
  pub host_ip: Option<String>,
  pub protocol: String,
}

#[derive(Debug, Clone, Default)]
pub struct UlimitSpec {
  pub name: String,
  pub soft: i64,
  pub hard: i64,
}

#[derive(Debug, Clone, Default)]
pub struct HealthcheckSpec {
  /// Exec form including the `CMD` / `CMD-SHELL` discriminator.
  pub test: Vec<String>,
  pub interval: Option<Duration>,
  pub timeout: Option<Duration>,
  pub retries: Option<u32>,
  pub start_period: Option<Duration>,
  pub start_interval: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkSummary {
  pub id: String,
  pub name: String,
  pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateNetwork {
  pub name: String,
  pub driver: Option<String>,
  pub attachable: bool,
  pub labels: std::collections::BTreeMap<String, String>,
  pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct VolumeSummary {
  pub name: String,
  pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateVolume {
  pub name: String,
  pub driver: Option<String>,
  pub labels: std::collections::BTreeMap<String, String>,
  pub driver_opts: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
  pub id: String,
}

#[derive(Debug, Clone, Default)]
pub struct LogsQuery {
  pub follow: bool,
  pub tail: Option<String>,
  pub timestamps: bool,
}

pub type LogStream = BoxStream<'static, EngineResult<String>>;

/// Label / name filters for list calls.
#[derive(Debug, Clone, Default)]
pub struct Filters {
  pub labels: Vec<String>,
  pub names: Vec<String>,
}

impl Filters {
  pub fn label(key: &str, value: &str) -> Filters {
    Filters {
      labels: vec![format!("{key}={value}")],
      names: Vec::new(),
    }
  }

  pub fn as_map(&self) -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    if !self.labels.is_empty() {
      map.insert(String::from("label"), self.labels.clone());
    }
    if !self.names.is_empty() {
      map.insert(String::from("name"), self.names.clone());
    }
    map
  }
}

/// The capability set the convergence engine needs from a container
/// runtime. Production uses [DockerEngine]; `--dry-run` routes
/// through [DryRunEngine]; tests use an in-memory fake.
#[async_trait]
pub trait Engine: Send + Sync {
  // Containers
  async fn list_containers(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<Container>>;
  async fn inspect_container(
    &self,
    name: &str,
  ) -> EngineResult<ContainerDetails>;
  async fn create_container(
    &self,
    name: &str,
    spec: CreateContainer,
  ) -> EngineResult<String>;
  async fn start_container(&self, name: &str) -> EngineResult<()>;
  async fn stop_container(
    &self,
    name: &str,
    signal: Option<String>,
    grace: Option<Duration>,
  ) -> EngineResult<()>;
  async fn kill_container(
    &self,
    name: &str,
    signal: &str,
  ) -> EngineResult<()>;
  async fn pause_container(&self, name: &str) -> EngineResult<()>;
  async fn unpause_container(&self, name: &str)
  -> EngineResult<()>;
  async fn remove_container(
    &self,
    name: &str,
    force: bool,
    volumes: bool,
  ) -> EngineResult<()>;
  async fn rename_container(
    &self,
    name: &str,
    new_name: &str,
  ) -> EngineResult<()>;
  /// Blocks until the container exits; returns the exit code.
  async fn wait_container(&self, name: &str) -> EngineResult<i64>;
  async fn container_logs(
    &self,
    name: &str,
    query: LogsQuery,
  ) -> EngineResult<LogStream>;

  // Networks
  async fn list_networks(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<NetworkSummary>>;
  async fn create_network(
    &self,
    spec: CreateNetwork,
  ) -> EngineResult<String>;
  async fn remove_network(&self, name: &str) -> EngineResult<()>;
  async fn connect_network(
    &self,
    network: &str,
    container: &str,
    endpoint: EndpointSpec,
  ) -> EngineResult<()>;

  // Volumes
  async fn list_volumes(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<VolumeSummary>>;
  async fn create_volume(
    &self,
    spec: CreateVolume,
  ) -> EngineResult<()>;
  async fn remove_volume(&self, name: &str) -> EngineResult<()>;

  // Images
  async fn inspect_image(
    &self,
    name: &str,
  ) -> EngineResult<ImageInfo>;
  async fn pull_image(
    &self,
    name: &str,
    platform: Option<&str>,
  ) -> EngineResult<()>;
  async fn remove_image(&self, name: &str) -> EngineResult<()>;
}

pub fn parse_container_state(raw: &str) -> ContainerState {
  ContainerState::from_str(raw)
    .unwrap_or(ContainerState::Unknown)
}

/// Caps overall concurrency against the Engine and bounds every
/// unary call with a deadline. Streaming and blocking calls (logs,
/// wait) are exempt from both; Stop's deadline is widened by the
/// requested grace period.
pub struct Guarded {
  inner: Arc<dyn Engine>,
  limit: Option<Arc<Semaphore>>,
  deadline: Duration,
}

impl Guarded {
  pub fn new(
    inner: Arc<dyn Engine>,
    limit: Option<usize>,
    deadline: Duration,
  ) -> Guarded {
    Guarded {
      inner,
      limit: limit.map(|n| Arc::new(Semaphore::new(n.max(1)))),
      deadline,
    }
  }

  async fn unary<T>(
    &self,
    deadline: Duration,
    fut: impl Future<Output = EngineResult<T>>,
  ) -> EngineResult<T> {
    let _permit = match &self.limit {
      Some(semaphore) => {
        Some(semaphore.acquire().await.map_err(|_| {
          EngineError::Unavailable {
            message: String::from("engine limiter closed"),
          }
        })?)
      }
      None => None,
    };
    match tokio::time::timeout(deadline, fut).await {
      Ok(res) => res,
      Err(_) => Err(EngineError::Timeout { deadline }),
    }
  }
}

#[async_trait]
impl Engine for Guarded {
  async fn list_containers(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<Container>> {
    self
      .unary(self.deadline, self.inner.list_containers(filters))
      .await
  }

  async fn inspect_container(
    &self,
    name: &str,
  ) -> EngineResult<ContainerDetails> {
    self
      .unary(self.deadline, self.inner.inspect_container(name))
      .await
  }

  async fn create_container(
    &self,
    name: &str,
    spec: CreateContainer,
  ) -> EngineResult<String> {
    self
      .unary(self.deadline, self.inner.create_container(name, spec))
      .await
  }

  async fn start_container(&self, name: &str) -> EngineResult<()> {
    self
      .unary(self.deadline, self.inner.start_container(name))
      .await
  }

  async fn stop_container(
    &self,
    name: &str,
    signal: Option<String>,
    grace: Option<Duration>,
  ) -> EngineResult<()> {
    let deadline = self.deadline + grace.unwrap_or_default();
    self
      .unary(
        deadline,
        self.inner.stop_container(name, signal, grace),
      )
      .await
  }

  async fn kill_container(
    &self,
    name: &str,
    signal: &str,
  ) -> EngineResult<()> {
    self
      .unary(self.deadline, self.inner.kill_container(name, signal))
      .await
  }

  async fn pause_container(&self, name: &str) -> EngineResult<()> {
    self
      .unary(self.deadline, self.inner.pause_container(name))
      .await
  }

  async fn unpause_container(
    &self,
    name: &str,
  ) -> EngineResult<()> {
    self
      .unary(self.deadline, self.inner.unpause_container(name))
      .await
  }

  async fn remove_container(
    &self,
    name: &str,
    force: bool,
    volumes: bool,
  ) -> EngineResult<()> {
    self
      .unary(
        self.deadline,
        self.inner.remove_container(name, force, volumes),
      )
      .await
  }

  async fn rename_container(
    &self,
    name: &str,
    new_name: &str,
  ) -> EngineResult<()> {
    self
      .unary(
        self.deadline,
        self.inner.rename_container(name, new_name),
      )
      .await
  }

  async fn wait_container(&self, name: &str) -> EngineResult<i64> {
    // Blocks for the container's lifetime. No deadline.
    self.inner.wait_container(name).await
  }

  async fn container_logs(
    &self,
    name: &str,
    query: LogsQuery,
  ) -> EngineResult<LogStream> {
    self.inner.container_logs(name, query).await
  }

  async fn list_networks(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<NetworkSummary>> {
    self
      .unary(self.deadline, self.inner.list_networks(filters))
      .await
  }

  async fn create_network(
    &self,
    spec: CreateNetwork,
  ) -> EngineResult<String> {
    self
      .unary(self.deadline, self.inner.create_network(spec))
      .await
  }

  async fn remove_network(&self, name: &str) -> EngineResult<()> {
    self
      .unary(self.deadline, self.inner.remove_network(name))
      .await
  }

  async fn connect_network(
    &self,
    network: &str,
    container: &str,
    endpoint: EndpointSpec,
  ) -> EngineResult<()> {
    self
      .unary(
        self.deadline,
        self.inner.connect_network(network, container, endpoint),
      )
      .await
  }

  async fn list_volumes(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<VolumeSummary>> {
    self
      .unary(self.deadline, self.inner.list_volumes(filters))
      .await
  }

  async fn create_volume(
    &self,
    spec: CreateVolume,
  ) -> EngineResult<()> {
    self
      .unary(self.deadline, self.inner.create_volume(spec))
      .await
  }

  async fn remove_volume(&self, name: &str) -> EngineResult<()> {
    self
      .unary(self.deadline, self.inner.remove_volume(name))
      .await
  }

  async fn inspect_image(
    &self,
    name: &str,
  ) -> EngineResult<ImageInfo> {
    self
      .unary(self.deadline, self.inner.inspect_image(name))
      .await
  }

  async fn pull_image(
    &self,
    name: &str,
    platform: Option<&str>,
  ) -> EngineResult<()> {
    // Pulls take as long as the registry takes.
    self.inner.pull_image(name, platform).await
  }

  async fn remove_image(&self, name: &str) -> EngineResult<()> {
    self
      .unary(self.deadline, self.inner.remove_image(name))
      .await
  }
}

/// Retry transient Engine failures with exponential backoff. Logical
/// errors (not found, conflicts) pass straight through.
pub async fn retry_transient<T, F, Fut>(
  attempts: u32,
  mut call: F,
) -> EngineResult<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = EngineResult<T>>,
{
  let mut backoff = Duration::from_millis(100);
  let mut attempt = 0;
  loop {
    match call().await {
      Err(e) if e.is_transient() && attempt + 1 < attempts => {
        attempt += 1;
        debug!(
          "transient engine error (attempt {attempt}): {e}"
        );
        tokio::time::sleep(backoff).await;
        backoff *= 2;
      }
      res => return res,
    }
  }
}
