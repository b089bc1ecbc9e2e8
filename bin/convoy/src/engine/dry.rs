use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
  time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;

use super::{
  Container, ContainerDetails, ContainerState, CreateContainer,
  CreateNetwork, CreateVolume, EndpointSpec, Engine, EngineResult,
  Filters, HealthState, ImageInfo, LogStream, LogsQuery,
  NetworkSummary, VolumeSummary,
};

/// Records every mutation it would have made instead of issuing it.
/// Reads pass through to the real Engine, with an overlay so that
/// containers "created" during the run inspect as running and
/// healthy, letting the rest of the pipeline proceed normally.
pub struct DryRunEngine {
  inner: Arc<dyn Engine>,
  calls: Mutex<Vec<String>>,
  overlay: Mutex<HashMap<String, ContainerDetails>>,
}

impl DryRunEngine {
  pub fn new(inner: Arc<dyn Engine>) -> DryRunEngine {
    DryRunEngine {
      inner,
      calls: Mutex::new(Vec::new()),
      overlay: Mutex::new(HashMap::new()),
    }
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  fn record(&self, call: String) {
    info!("DRY-RUN {call}");
    self.calls.lock().unwrap().push(call);
  }
}

#[async_trait]
impl Engine for DryRunEngine {
  async fn list_containers(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<Container>> {
    self.inner.list_containers(filters).await
  }

  async fn inspect_container(
    &self,
    name: &str,
  ) -> EngineResult<ContainerDetails> {
    if let Some(details) =
      self.overlay.lock().unwrap().get(name).cloned()
    {
      return Ok(details);
    }
    self.inner.inspect_container(name).await
  }

  async fn create_container(
    &self,
    name: &str,
    spec: CreateContainer,
  ) -> EngineResult<String> {
    self.record(format!("create container {name}"));
    let details = ContainerDetails {
      id: format!("dryrun-{name}"),
      name: name.to_string(),
      image_id: spec.image.clone(),
      labels: spec.labels.clone().into_iter().collect(),
      state: ContainerState::Created,
      health: None,
      exit_code: None,
      volume_mounts: Vec::new(),
      networks: spec
        .endpoints
        .iter()
        .map(|e| e.network.clone())
        .collect(),
    };
    self
      .overlay
      .lock()
      .unwrap()
      .insert(name.to_string(), details);
    Ok(format!("dryrun-{name}"))
  }

  async fn start_container(&self, name: &str) -> EngineResult<()> {
    self.record(format!("start container {name}"));
    if let Some(details) =
      self.overlay.lock().unwrap().get_mut(name)
    {
      details.state = ContainerState::Running;
      details.health = Some(HealthState::Healthy);
    }
    Ok(())
  }

  async fn stop_container(
    &self,
    name: &str,
    _signal: Option<String>,
    _grace: Option<Duration>,
  ) -> EngineResult<()> {
    self.record(format!("stop container {name}"));
    if let Some(details) =
      self.overlay.lock().unwrap().get_mut(name)
    {
      details.state = ContainerState::Exited;
      details.exit_code = Some(0);
    }
    Ok(())
  }

  async fn kill_container(
    &self,
    name: &str,
    signal: &str,
  ) -> EngineResult<()> {
    self.record(format!("kill container {name} ({signal})"));
    Ok(())
  }

  async fn pause_container(&self, name: &str) -> EngineResult<()> {
    self.record(format!("pause container {name}"));
    Ok(())
  }

  async fn unpause_container(
    &self,
    name: &str,
  ) -> EngineResult<()> {
    self.record(format!("unpause container {name}"));
    Ok(())
  }

  async fn remove_container(
    &self,
    name: &str,
    _force: bool,
    _volumes: bool,
  ) -> EngineResult<()> {
    self.record(format!("remove container {name}"));
    self.overlay.lock().unwrap().remove(name);
    Ok(())
  }

  async fn rename_container(
    &self,
    name: &str,
    new_name: &str,
  ) -> EngineResult<()> {
    self.record(format!("rename container {name} -> {new_name}"));
    let mut overlay = self.overlay.lock().unwrap();
    if let Some(mut details) = overlay.remove(name) {
      details.name = new_name.to_string();
      overlay.insert(new_name.to_string(), details);
    }
    Ok(())
  }

  async fn wait_container(&self, name: &str) -> EngineResult<i64> {
    self.record(format!("wait container {name}"));
    Ok(0)
  }

  async fn container_logs(
    &self,
    _name: &str,
    _query: LogsQuery,
  ) -> EngineResult<LogStream> {
    Ok(futures_util::stream::empty().boxed())
  }

  async fn list_networks(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<NetworkSummary>> {
    self.inner.list_networks(filters).await
  }

  async fn create_network(
    &self,
    spec: CreateNetwork,
  ) -> EngineResult<String> {
    self.record(format!("create network {}", spec.name));
    Ok(format!("dryrun-{}", spec.name))
  }

  async fn remove_network(&self, name: &str) -> EngineResult<()> {
    self.record(format!("remove network {name}"));
    Ok(())
  }

  async fn connect_network(
    &self,
    network: &str,
    container: &str,
    _endpoint: EndpointSpec,
  ) -> EngineResult<()> {
    self.record(format!(
      "connect container {container} to network {network}"
    ));
    Ok(())
  }

  async fn list_volumes(
    &self,
    filters: Filters,
  ) -> EngineResult<Vec<VolumeSummary>> {
    self.inner.list_volumes(filters).await
  }

  async fn create_volume(
    &self,
    spec: CreateVolume,
  ) -> EngineResult<()> {
    self.record(format!("create volume {}", spec.name));
    Ok(())
  }

  async fn remove_volume(&self, name: &str) -> EngineResult<()> {
    self.record(format!("remove volume {name}"));
    Ok(())
  }

  async fn inspect_image(
    &self,
    name: &str,
  ) -> EngineResult<ImageInfo> {
    match self.inner.inspect_image(name).await {
      Ok(info) => Ok(info),
      // Pretend the pull this run would perform already happened.
      Err(e) if e.is_not_found() => Ok(ImageInfo {
        id: format!("dryrun:{name}"),
      }),
      Err(e) => Err(e),
    }
  }

  async fn pull_image(
    &self,
    name: &str,
    _platform: Option<&str>,
  ) -> EngineResult<()> {
    self.record(format!("pull image {name}"));
    Ok(())
  }

  async fn remove_image(&self, name: &str) -> EngineResult<()> {
    self.record(format!("remove image {name}"));
    Ok(())
  }
}
