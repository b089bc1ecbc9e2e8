use std::{collections::BTreeMap, fmt};

/// Classification of a convergence failure. Every error surfaced by
/// a verb carries one of these, the resource it concerns, and the
/// underlying cause chain.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
  NotFound,
  Conflict,
  Validation,
  EngineUnavailable,
  Engine,
  Timeout,
  StartFailed,
  HealthFailed,
  DependencyFailed,
  Canceled,
}

impl From<&crate::engine::EngineError> for ErrorKind {
  fn from(e: &crate::engine::EngineError) -> ErrorKind {
    use crate::engine::EngineError::*;
    match e {
      NotFound { .. } => ErrorKind::NotFound,
      Conflict { .. } => ErrorKind::Conflict,
      Unavailable { .. } => ErrorKind::EngineUnavailable,
      Timeout { .. } => ErrorKind::Timeout,
      Api { .. } => ErrorKind::Engine,
    }
  }
}

#[derive(Debug)]
pub struct ConvergeError {
  pub kind: ErrorKind,
  pub resource: String,
  pub source: anyhow::Error,
}

impl ConvergeError {
  pub fn new(
    kind: ErrorKind,
    resource: impl Into<String>,
    source: impl Into<anyhow::Error>,
  ) -> ConvergeError {
    ConvergeError {
      kind,
      resource: resource.into(),
      source: source.into(),
    }
  }
}

impl fmt::Display for ConvergeError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} [{}] | {:#}",
      self.kind, self.resource, self.source
    )
  }
}

impl std::error::Error for ConvergeError {}

/// Per-node failures collected across a scheduler run. Node identity
/// is preserved so callers can report exactly which services failed.
#[derive(Debug, Default)]
pub struct ConvergeErrors {
  pub errors: BTreeMap<String, anyhow::Error>,
}

impl ConvergeErrors {
  pub fn insert(
    &mut self,
    node: impl Into<String>,
    error: anyhow::Error,
  ) {
    self.errors.insert(node.into(), error);
  }

  pub fn is_empty(&self) -> bool {
    self.errors.is_empty()
  }

  pub fn into_result(self) -> Result<(), ConvergeErrors> {
    if self.is_empty() { Ok(()) } else { Err(self) }
  }

  /// The kind attached to a node error, if it was a [ConvergeError].
  pub fn kind(&self, node: &str) -> Option<ErrorKind> {
    self
      .errors
      .get(node)
      .and_then(|e| e.downcast_ref::<ConvergeError>())
      .map(|e| e.kind)
  }
}

impl fmt::Display for ConvergeErrors {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} service(s) failed to converge", self.errors.len())?;
    for (node, error) in &self.errors {
      write!(f, "\n  {node}: {error:#}")?;
    }
    Ok(())
  }
}

impl std::error::Error for ConvergeErrors {}
