use std::{str::FromStr, time::Duration};

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

/// One service definition, producing `scale` identically configured
/// containers (replicas) at convergence time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
  /// Copied from the project map key during normalization.
  #[serde(skip)]
  pub name: String,
  pub image: Option<String>,
  /// Carried on the model for completeness. Image building is
  /// performed by an external builder before convergence.
  #[serde(default)]
  pub build: Option<BuildSpec>,
  #[serde(default)]
  pub command: Option<CommandLine>,
  #[serde(default)]
  pub entrypoint: Option<CommandLine>,
  #[serde(default)]
  pub environment: IndexMap<String, String>,
  #[serde(default)]
  pub labels: IndexMap<String, String>,
  /// Desired replica count. `0` keeps the service in the model
  /// without running anything for it.
  #[serde(default = "default_scale")]
  pub scale: u32,
  #[serde(default)]
  pub networks: IndexMap<String, Option<NetworkAttachment>>,
  #[serde(default)]
  pub volumes: Vec<VolumeMount>,
  #[serde(default)]
  pub configs: Vec<FileReference>,
  #[serde(default)]
  pub secrets: Vec<FileReference>,
  #[serde(default)]
  pub tmpfs: Vec<String>,
  #[serde(default)]
  pub devices: Vec<String>,
  #[serde(default)]
  pub cap_add: Vec<String>,
  #[serde(default)]
  pub cap_drop: Vec<String>,
  #[serde(default)]
  pub sysctls: IndexMap<String, String>,
  #[serde(default)]
  pub ulimits: IndexMap<String, Ulimit>,
  #[serde(default)]
  pub init: Option<bool>,
  #[serde(default)]
  pub privileged: bool,
  #[serde(default)]
  pub read_only: bool,
  #[serde(default)]
  pub depends_on: IndexMap<String, DependsOnSpec>,
  #[serde(default)]
  pub restart: RestartPolicy,
  #[serde(default)]
  pub healthcheck: Option<HealthCheckSpec>,
  #[serde(default)]
  pub stop_signal: Option<String>,
  #[serde(default)]
  pub stop_grace_period: Option<ComposeDuration>,
  #[serde(default)]
  pub ports: Vec<PortSpec>,
  #[serde(default)]
  pub expose: Vec<String>,
  /// `bridge`, `host`, `none`, `service:X` or `container:X`.
  #[serde(default)]
  pub network_mode: Option<String>,
  /// `service:X`, `container:X`, `host` or `shareable`.
  #[serde(default)]
  pub ipc: Option<String>,
  #[serde(default)]
  pub links: Vec<String>,
  #[serde(default)]
  pub volumes_from: Vec<String>,
  #[serde(default)]
  pub container_name: Option<String>,
  #[serde(default)]
  pub pull_policy: PullPolicy,
  #[serde(default)]
  pub platform: Option<String>,
  #[serde(default)]
  pub user: Option<String>,
  #[serde(default)]
  pub working_dir: Option<String>,
}

fn default_scale() -> u32 {
  1
}

impl ServiceSpec {
  /// All dependency edges for scheduling: explicit `depends_on`
  /// entries merged with the implicit edges contributed by `links`,
  /// `volumes_from`, `network_mode: service:X` and `ipc: service:X`.
  pub fn dependencies(&self) -> IndexMap<String, DependsOnSpec> {
    let mut edges = self.depends_on.clone();
    let implicit = self
      .links
      .iter()
      .map(|link| match link.split_once(':') {
        Some((service, _alias)) => service,
        None => link.as_str(),
      })
      .chain(self.volumes_from.iter().filter_map(|source| {
        // `container:X` references an unmanaged container.
        match source.split_once(':') {
          Some(("container", _)) => None,
          Some((service, _mode)) => Some(service),
          None => Some(source.as_str()),
        }
      }))
      .chain(service_reference(self.network_mode.as_deref()))
      .chain(service_reference(self.ipc.as_deref()));
    for service in implicit {
      edges
        .entry(service.to_string())
        .or_insert(DependsOnSpec::default());
    }
    edges
  }

  pub fn stop_grace_period(&self) -> Duration {
    self
      .stop_grace_period
      .map(|d| d.0)
      .unwrap_or(Duration::from_secs(10))
  }
}

fn service_reference(mode: Option<&str>) -> Option<&str> {
  mode.and_then(|mode| mode.strip_prefix("service:"))
}

/// Shell form (string) or exec form (list).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
  Shell(String),
  Exec(Vec<String>),
}

impl CommandLine {
  /// Exec-form argv. Shell form is delegated to `/bin/sh -c`.
  pub fn to_exec(&self) -> Vec<String> {
    match self {
      CommandLine::Exec(args) => args.clone(),
      CommandLine::Shell(line) => vec![
        String::from("/bin/sh"),
        String::from("-c"),
        line.clone(),
      ],
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSpec {
  #[serde(default)]
  pub context: Option<String>,
  #[serde(default)]
  pub dockerfile: Option<String>,
  #[serde(default)]
  pub args: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkAttachment {
  #[serde(default)]
  pub aliases: Vec<String>,
  #[serde(default)]
  pub ipv4_address: Option<String>,
  #[serde(default)]
  pub ipv6_address: Option<String>,
  #[serde(default)]
  pub mac_address: Option<String>,
  /// Higher priority networks are connected first.
  #[serde(default)]
  pub priority: i64,
}

/// Reference from a service to a project-level config or secret.
/// The resolved file lands in the container as a read-only mount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileReference {
  pub source: String,
  /// Defaults to `/<source>` for configs and `/run/secrets/<source>`
  /// for secrets.
  #[serde(default)]
  pub target: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMount {
  #[serde(default, rename = "type")]
  pub kind: VolumeMountKind,
  /// Volume key, bind path, or None for an anonymous volume.
  #[serde(default)]
  pub source: Option<String>,
  pub target: String,
  #[serde(default)]
  pub read_only: bool,
}

impl VolumeMount {
  pub fn is_anonymous(&self) -> bool {
    self.kind == VolumeMountKind::Volume && self.source.is_none()
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VolumeMountKind {
  #[default]
  Volume,
  Bind,
  Tmpfs,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Ulimit {
  pub soft: i64,
  pub hard: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnSpec {
  #[serde(default)]
  pub condition: DependencyCondition,
  /// Optional dependencies may fail without blocking dependents.
  #[serde(default = "default_true")]
  pub required: bool,
}

impl Default for DependsOnSpec {
  fn default() -> Self {
    DependsOnSpec {
      condition: DependencyCondition::Started,
      required: true,
    }
  }
}

fn default_true() -> bool {
  true
}

/// What a dependency must reach before dependents may run.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
)]
pub enum DependencyCondition {
  #[default]
  #[serde(rename = "service_started")]
  #[strum(serialize = "service_started")]
  Started,
  #[serde(rename = "service_healthy")]
  #[strum(serialize = "service_healthy")]
  Healthy,
  #[serde(rename = "service_completed_successfully")]
  #[strum(serialize = "service_completed_successfully")]
  CompletedSuccessfully,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
)]
pub enum RestartPolicy {
  #[default]
  #[serde(rename = "no")]
  #[strum(serialize = "no")]
  No,
  #[serde(rename = "always")]
  #[strum(serialize = "always")]
  Always,
  #[serde(rename = "on-failure")]
  #[strum(serialize = "on-failure")]
  OnFailure,
  #[serde(rename = "unless-stopped")]
  #[strum(serialize = "unless-stopped")]
  UnlessStopped,
}

impl RestartPolicy {
  /// Whether the engine itself restarts containers exiting non-zero.
  pub fn restarts_on_failure(&self) -> bool {
    matches!(
      self,
      RestartPolicy::Always
        | RestartPolicy::OnFailure
        | RestartPolicy::UnlessStopped
    )
  }

  /// A service under these policies never terminates on purpose,
  /// making completion gating on it ill-defined.
  pub fn is_long_running(&self) -> bool {
    matches!(
      self,
      RestartPolicy::Always | RestartPolicy::UnlessStopped
    )
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckSpec {
  /// `["CMD", ...]`, `["CMD-SHELL", "..."]` or a bare shell string.
  #[serde(default)]
  pub test: Option<CommandLine>,
  #[serde(default)]
  pub disable: bool,
  #[serde(default)]
  pub interval: Option<ComposeDuration>,
  #[serde(default)]
  pub timeout: Option<ComposeDuration>,
  #[serde(default)]
  pub retries: Option<u32>,
  #[serde(default)]
  pub start_period: Option<ComposeDuration>,
  #[serde(default)]
  pub start_interval: Option<ComposeDuration>,
}

impl HealthCheckSpec {
  pub fn is_active(&self) -> bool {
    !self.disable && self.test.is_some()
  }

  pub fn interval(&self) -> Duration {
    self.interval.map(|d| d.0).unwrap_or(Duration::from_secs(30))
  }

  pub fn retries(&self) -> u32 {
    self.retries.unwrap_or(3)
  }

  pub fn start_period(&self) -> Duration {
    self.start_period.map(|d| d.0).unwrap_or_default()
  }

  /// Total budget for a container to first report healthy.
  pub fn readiness_budget(&self) -> Duration {
    self.start_period()
      + self.interval() * self.retries().max(1)
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortSpec {
  pub target: u16,
  #[serde(default)]
  pub published: Option<u16>,
  #[serde(default)]
  pub host_ip: Option<String>,
  #[serde(default = "default_protocol")]
  pub protocol: String,
}

fn default_protocol() -> String {
  String::from("tcp")
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PullPolicy {
  Always,
  #[default]
  #[serde(alias = "if_not_present")]
  Missing,
  Never,
  /// The image comes from an external builder. Treated as local
  /// only, like `never`, but reported distinctly when absent.
  Build,
}

/// A duration in the project document: `"1m30s"`, `"500ms"`, `"10s"`
/// or a bare number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComposeDuration(pub Duration);

impl FromStr for ComposeDuration {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut unit = String::new();
    let mut parts = Vec::new();
    for c in s.trim().chars() {
      if c.is_ascii_digit() || c == '.' {
        if !unit.is_empty() {
          parts.push((number.clone(), unit.clone()));
          number.clear();
          unit.clear();
        }
        number.push(c);
      } else if !c.is_whitespace() {
        unit.push(c);
      }
    }
    parts.push((number, unit));
    for (number, unit) in parts {
      if number.is_empty() {
        anyhow::bail!("Invalid duration '{s}'");
      }
      let value: f64 = number
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid duration '{s}'"))?;
      let scaled = match unit.as_str() {
        "ns" => Duration::from_nanos(value as u64),
        "us" | "µs" => Duration::from_micros(value as u64),
        "ms" => Duration::from_secs_f64(value / 1000.0),
        // Bare numbers are seconds.
        "s" | "" => Duration::from_secs_f64(value),
        "m" => Duration::from_secs_f64(value * 60.0),
        "h" => Duration::from_secs_f64(value * 3600.0),
        _ => anyhow::bail!("Invalid duration unit '{unit}' in '{s}'"),
      };
      total += scaled;
    }
    Ok(ComposeDuration(total))
  }
}

impl<'de> Deserialize<'de> for ComposeDuration {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
      Number(f64),
      String(String),
    }
    match Raw::deserialize(deserializer)? {
      Raw::Number(seconds) => {
        Ok(ComposeDuration(Duration::from_secs_f64(seconds)))
      }
      Raw::String(s) => {
        s.parse().map_err(serde::de::Error::custom)
      }
    }
  }
}
