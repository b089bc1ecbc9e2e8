use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};

/// How progress events are rendered. TTY spinners are a renderer
/// concern layered elsewhere; the engine only knows these.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  strum::Display,
  clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
  #[default]
  Plain,
  Json,
  Quiet,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
  Working,
  Done,
  Warning,
  Error,
}

/// One lifecycle transition of one resource.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
  pub timestamp: i64,
  /// Resource identity, e.g. `Container demo-web-1`.
  pub id: String,
  /// Owning resource, e.g. the service name.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub parent: Option<String>,
  /// Lifecycle phase: create, start, stop, remove, ...
  pub phase: String,
  pub status: ProgressStatus,
  pub message: String,
}

/// Cloneable handle feeding the single writer task. Ordering of
/// writes is guaranteed by the channel; callers never hold a lock.
#[derive(Clone)]
pub struct Progress {
  tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl Progress {
  /// Spawn the writer task. The handle resolves once every
  /// [Progress] clone is dropped and the queue is drained.
  pub fn init(mode: ProgressMode) -> (Progress, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let writer = tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        match mode {
          ProgressMode::Quiet => {}
          ProgressMode::Json => {
            match serde_json::to_string(&event) {
              Ok(line) => println!("{line}"),
              Err(e) => {
                warn!("failed to serialize progress event | {e}")
              }
            }
          }
          ProgressMode::Plain => match event.status {
            ProgressStatus::Working => {}
            ProgressStatus::Warning => {
              eprintln!("WARN  {}  {}", event.id, event.message)
            }
            ProgressStatus::Error => {
              eprintln!("ERROR  {}  {}", event.id, event.message)
            }
            ProgressStatus::Done => {
              println!(" {}  {}", event.id, event.message)
            }
          },
        }
      }
    });
    (Progress { tx }, writer)
  }

  /// A handle that renders nothing, for tests.
  #[cfg(test)]
  pub fn sink() -> Progress {
    Progress::init(ProgressMode::Quiet).0
  }

  pub fn event(
    &self,
    id: impl Into<String>,
    parent: Option<&str>,
    phase: &str,
    status: ProgressStatus,
    message: impl Into<String>,
  ) {
    let event = ProgressEvent {
      timestamp: chrono::Utc::now().timestamp_millis(),
      id: id.into(),
      parent: parent.map(str::to_string),
      phase: phase.to_string(),
      status,
      message: message.into(),
    };
    // A closed writer only means the run is shutting down.
    let _ = self.tx.send(event);
  }

  pub fn working(
    &self,
    id: impl Into<String>,
    parent: Option<&str>,
    phase: &str,
    message: impl Into<String>,
  ) {
    self.event(id, parent, phase, ProgressStatus::Working, message);
  }

  pub fn done(
    &self,
    id: impl Into<String>,
    parent: Option<&str>,
    phase: &str,
    message: impl Into<String>,
  ) {
    self.event(id, parent, phase, ProgressStatus::Done, message);
  }

  pub fn warning(
    &self,
    id: impl Into<String>,
    message: impl Into<String>,
  ) {
    self.event(
      id,
      None,
      "warn",
      ProgressStatus::Warning,
      message,
    );
  }

  pub fn error_event(
    &self,
    id: impl Into<String>,
    parent: Option<&str>,
    phase: &str,
    message: impl Into<String>,
  ) {
    self.event(id, parent, phase, ProgressStatus::Error, message);
  }
}
