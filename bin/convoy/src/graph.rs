use std::{
  collections::BTreeMap, future::Future, sync::Arc,
};

use anyhow::anyhow;
use model::{DependencyCondition, Project};
use tokio::{
  sync::{Semaphore, watch},
  task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
  error::{ConvergeError, ConvergeErrors, ErrorKind},
  labels,
  observe::ObservedState,
};

/// A dependency edge: the owning node waits on `to` reaching
/// `condition` before it may run.
#[derive(Debug, Clone)]
pub struct Edge {
  pub to: String,
  pub condition: DependencyCondition,
  pub required: bool,
}

/// The acyclic service graph a convergence run executes over.
#[derive(Debug, Clone, Default)]
pub struct ServiceGraph {
  nodes: Vec<String>,
  deps: BTreeMap<String, Vec<Edge>>,
}

impl ServiceGraph {
  /// Build from the model, folding the implicit edges (`links`,
  /// `volumes_from`, `network_mode`/`ipc` service references) into
  /// the same DAG. Rejects cycles before anything touches the
  /// Engine.
  pub fn from_project(
    project: &Project,
  ) -> Result<ServiceGraph, ConvergeError> {
    let mut graph = ServiceGraph::default();
    for (name, service) in &project.services {
      graph.nodes.push(name.clone());
      let edges = service
        .dependencies()
        .into_iter()
        .filter(|(dep, _)| project.services.contains_key(dep))
        .map(|(dep, spec)| Edge {
          to: dep,
          condition: spec.condition,
          required: spec.required,
        })
        .collect();
      graph.deps.insert(name.clone(), edges);
    }
    if let Some(cycle) = graph.find_cycle() {
      return Err(ConvergeError::new(
        ErrorKind::Validation,
        project.name.clone(),
        anyhow!(
          "dependency cycle detected: {}",
          cycle.join(" -> ")
        ),
      ));
    }
    Ok(graph)
  }

  /// Rebuild ordering from Engine state alone, using the serialized
  /// depends_on label. Lets teardown order correctly when only the
  /// project name is known.
  pub fn from_observed(state: &ObservedState) -> ServiceGraph {
    let mut graph = ServiceGraph::default();
    for (service, containers) in &state.by_service {
      graph.nodes.push(service.clone());
      let edges = containers
        .first()
        .and_then(|c| c.labels.get(labels::DEPENDS_ON_LABEL))
        .map(|label| {
          labels::parse_depends_on(label)
            .into_iter()
            .filter(|(dep, _)| state.by_service.contains_key(dep))
            .map(|(dep, spec)| Edge {
              to: dep,
              condition: spec.condition,
              required: spec.required,
            })
            .collect()
        })
        .unwrap_or_default();
      graph.deps.insert(service.clone(), edges);
    }
    graph
  }

  /// Restrict to `roots`, optionally pulling in their transitive
  /// dependencies.
  pub fn subset(
    &self,
    roots: &[String],
    with_deps: bool,
  ) -> ServiceGraph {
    let mut keep: Vec<String> = Vec::new();
    let mut queue: Vec<String> = roots
      .iter()
      .filter(|r| self.deps.contains_key(*r))
      .cloned()
      .collect();
    while let Some(node) = queue.pop() {
      if keep.contains(&node) {
        continue;
      }
      keep.push(node.clone());
      if with_deps {
        for edge in &self.deps[&node] {
          queue.push(edge.to.clone());
        }
      }
    }
    let nodes: Vec<String> = self
      .nodes
      .iter()
      .filter(|n| keep.contains(n))
      .cloned()
      .collect();
    let deps = nodes
      .iter()
      .map(|node| {
        let edges = self.deps[node]
          .iter()
          .filter(|edge| keep.contains(&edge.to))
          .cloned()
          .collect();
        (node.clone(), edges)
      })
      .collect();
    ServiceGraph { nodes, deps }
  }

  pub fn nodes(&self) -> &[String] {
    &self.nodes
  }

  pub fn contains(&self, node: &str) -> bool {
    self.deps.contains_key(node)
  }

  pub fn dependencies(&self, node: &str) -> &[Edge] {
    self
      .deps
      .get(node)
      .map(Vec::as_slice)
      .unwrap_or_default()
  }

  fn dependents(&self, node: &str) -> Vec<String> {
    self
      .deps
      .iter()
      .filter(|(_, edges)| edges.iter().any(|e| e.to == node))
      .map(|(name, _)| name.clone())
      .collect()
  }

  /// The milestones dependents demand of this node, telling its op
  /// how far past "started" it must drive readiness.
  pub fn demands(&self, node: &str) -> Demands {
    let mut demands = Demands::default();
    for edges in self.deps.values() {
      for edge in edges.iter().filter(|e| e.to == node) {
        match edge.condition {
          DependencyCondition::Healthy => demands.healthy = true,
          DependencyCondition::CompletedSuccessfully => {
            demands.completed = true
          }
          DependencyCondition::Started => {}
        }
      }
    }
    demands
  }

  fn find_cycle(&self) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
      New,
      Active,
      Done,
    }
    fn visit(
      graph: &ServiceGraph,
      node: &str,
      marks: &mut BTreeMap<String, Mark>,
      path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
      marks.insert(node.to_string(), Mark::Active);
      path.push(node.to_string());
      for edge in graph.dependencies(node) {
        match marks.get(&edge.to).copied().unwrap_or(Mark::New) {
          Mark::Active => {
            let start = path
              .iter()
              .position(|n| n == &edge.to)
              .unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(edge.to.clone());
            return Some(cycle);
          }
          Mark::New => {
            if let Some(cycle) =
              visit(graph, &edge.to, marks, path)
            {
              return Some(cycle);
            }
          }
          Mark::Done => {}
        }
      }
      path.pop();
      marks.insert(node.to_string(), Mark::Done);
      None
    }

    let mut marks = BTreeMap::new();
    for node in &self.nodes {
      if marks.get(node).is_none()
        && let Some(cycle) =
          visit(self, node, &mut marks, &mut Vec::new())
      {
        return Some(cycle);
      }
    }
    None
  }
}

/// Readiness milestones dependents may gate on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Demands {
  pub healthy: bool,
  pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFinish {
  Ok,
  Failed,
  Skipped,
}

#[derive(Debug, Clone, Default)]
pub struct NodeStatus {
  pub started: bool,
  pub healthy: bool,
  pub completed: bool,
  pub finished: Option<NodeFinish>,
}

/// Handed to each node op: identifies the node, carries what its
/// dependents demand, and publishes milestones as they are reached
/// so dependents can proceed before the op itself returns.
#[derive(Clone)]
pub struct NodeHandle {
  service: String,
  demands: Demands,
  tx: watch::Sender<NodeStatus>,
}

impl NodeHandle {
  pub fn service(&self) -> &str {
    &self.service
  }

  pub fn demands(&self) -> Demands {
    self.demands
  }

  pub fn mark_started(&self) {
    self.tx.send_modify(|status| status.started = true);
  }

  pub fn mark_healthy(&self) {
    self.tx.send_modify(|status| {
      status.started = true;
      status.healthy = true;
    });
  }

  pub fn mark_completed(&self) {
    self.tx.send_modify(|status| status.completed = true);
  }

  #[cfg(test)]
  pub fn detached(service: &str, demands: Demands) -> NodeHandle {
    let (tx, _rx) = watch::channel(NodeStatus::default());
    NodeHandle {
      service: service.to_string(),
      demands,
      tx,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  /// Dependencies gate dependents (Up, Start).
  Forward,
  /// Edges inverted, gating reduced to "dependents done" (Down,
  /// Stop, Kill).
  Reverse,
}

enum Gate {
  Wait,
  Open,
  Blocked,
}

fn eval_gate(status: &NodeStatus, edge: Option<&Edge>) -> Gate {
  let Some(edge) = edge else {
    // Reverse mode: done either way is enough.
    return match status.finished {
      Some(_) => Gate::Open,
      None => Gate::Wait,
    };
  };
  let met = match edge.condition {
    DependencyCondition::Started => status.started,
    DependencyCondition::Healthy => status.healthy,
    DependencyCondition::CompletedSuccessfully => status.completed,
  };
  if met {
    return Gate::Open;
  }
  match status.finished {
    None => Gate::Wait,
    // Op return without error is the definition of "started".
    Some(NodeFinish::Ok)
      if edge.condition == DependencyCondition::Started =>
    {
      Gate::Open
    }
    Some(_) if edge.required => Gate::Blocked,
    Some(_) => Gate::Open,
  }
}

/// Executes one op per node with bounded parallelism, releasing each
/// node once every gating condition on its dependency edges has
/// completed. Errors are aggregated per node; a required dependency
/// failure skips dependents and marks them failed-by-dependency.
pub struct Scheduler {
  pub max_parallel: Option<usize>,
  pub cancel: CancellationToken,
}

impl Scheduler {
  pub async fn run<F, Fut>(
    &self,
    graph: &ServiceGraph,
    direction: Direction,
    op: F,
  ) -> Result<(), ConvergeErrors>
  where
    F: Fn(NodeHandle) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
  {
    let limiter = self
      .max_parallel
      .map(|n| Arc::new(Semaphore::new(n.max(1))));

    let mut txs = BTreeMap::new();
    let mut rxs = BTreeMap::new();
    for node in graph.nodes() {
      let (tx, rx) = watch::channel(NodeStatus::default());
      txs.insert(node.clone(), tx);
      rxs.insert(node.clone(), rx);
    }

    let mut tasks: JoinSet<(String, anyhow::Result<()>)> =
      JoinSet::new();

    for node in graph.nodes() {
      let waits: Vec<(
        String,
        watch::Receiver<NodeStatus>,
        Option<Edge>,
      )> = match direction {
        Direction::Forward => graph
          .dependencies(node)
          .iter()
          .map(|edge| {
            (
              edge.to.clone(),
              rxs[&edge.to].clone(),
              Some(edge.clone()),
            )
          })
          .collect(),
        Direction::Reverse => graph
          .dependents(node)
          .into_iter()
          .map(|dependent| {
            let rx = rxs[&dependent].clone();
            (dependent, rx, None)
          })
          .collect(),
      };
      let tx = txs[node].clone();
      let demands = graph.demands(node);
      let op = op.clone();
      let cancel = self.cancel.clone();
      let limiter = limiter.clone();
      let node = node.clone();

      tasks.spawn(async move {
        let mut blocked_by: Option<String> = None;
        'gates: for (dep, mut rx, edge) in waits {
          loop {
            let gate = {
              let status = rx.borrow().clone();
              eval_gate(&status, edge.as_ref())
            };
            match gate {
              Gate::Open => break,
              Gate::Blocked => {
                blocked_by = Some(dep);
                break 'gates;
              }
              Gate::Wait => {}
            }
            tokio::select! {
              changed = rx.changed() => {
                if changed.is_err() {
                  blocked_by = Some(dep);
                  break 'gates;
                }
              }
              _ = cancel.cancelled() => {
                tx.send_modify(|status| {
                  status.finished = Some(NodeFinish::Skipped)
                });
                return (
                  node.clone(),
                  Err(
                    ConvergeError::new(
                      ErrorKind::Canceled,
                      node.clone(),
                      anyhow!("run canceled before start"),
                    )
                    .into(),
                  ),
                );
              }
            }
          }
        }

        if let Some(dep) = blocked_by {
          tx.send_modify(|status| {
            status.finished = Some(NodeFinish::Skipped)
          });
          return (
            node.clone(),
            Err(
              ConvergeError::new(
                ErrorKind::DependencyFailed,
                node.clone(),
                anyhow!("required dependency '{dep}' failed"),
              )
              .into(),
            ),
          );
        }

        let _permit = match &limiter {
          Some(semaphore) => {
            tokio::select! {
              permit = semaphore.clone().acquire_owned() => {
                match permit {
                  Ok(permit) => Some(permit),
                  Err(_) => None,
                }
              }
              _ = cancel.cancelled() => {
                tx.send_modify(|status| {
                  status.finished = Some(NodeFinish::Skipped)
                });
                return (
                  node.clone(),
                  Err(
                    ConvergeError::new(
                      ErrorKind::Canceled,
                      node.clone(),
                      anyhow!("run canceled before start"),
                    )
                    .into(),
                  ),
                );
              }
            }
          }
          None => None,
        };

        let handle = NodeHandle {
          service: node.clone(),
          demands,
          tx: tx.clone(),
        };
        let result = tokio::select! {
          result = op(handle) => result,
          _ = cancel.cancelled() => {
            Err(
              ConvergeError::new(
                ErrorKind::Canceled,
                node.clone(),
                anyhow!("run canceled"),
              )
              .into(),
            )
          }
        };

        tx.send_modify(|status| {
          status.finished = Some(match &result {
            Ok(()) => {
              status.started = true;
              NodeFinish::Ok
            }
            Err(_) => NodeFinish::Failed,
          })
        });

        (node, result)
      });
    }

    // Only the tasks publish from here on.
    drop(txs);

    let mut errors = ConvergeErrors::default();
    while let Some(joined) = tasks.join_next().await {
      match joined {
        Ok((_, Ok(()))) => {}
        Ok((node, Err(e))) => errors.insert(node, e),
        Err(e) => {
          errors
            .insert("scheduler", anyhow!("task panicked: {e}"));
        }
      }
    }
    errors.into_result()
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      Mutex,
      atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
  };

  use super::*;
  use crate::error::ErrorKind;

  fn project(yaml: &str) -> Project {
    Project::from_yaml(yaml).unwrap()
  }

  fn three_tier() -> Project {
    project(
      "
name: demo
services:
  db:
    image: pg
    healthcheck:
      test: pg_isready
  cache:
    image: redis
  web:
    image: nginx
    depends_on:
      db:
        condition: service_healthy
      cache:
        condition: service_started
",
    )
  }

  fn scheduler() -> Scheduler {
    Scheduler {
      max_parallel: None,
      cancel: CancellationToken::new(),
    }
  }

  #[test]
  fn rejects_cycles_with_a_named_cycle() {
    let project = project(
      "
name: demo
services:
  a:
    image: x
    depends_on:
      b:
        condition: service_started
  b:
    image: x
    depends_on:
      a:
        condition: service_started
",
    );
    let err = ServiceGraph::from_project(&project).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    let message = format!("{err}");
    assert!(message.contains("dependency cycle detected"));
    assert!(message.contains("a -> b") || message.contains("b -> a"));
  }

  #[test]
  fn demands_reflect_dependent_conditions() {
    let graph =
      ServiceGraph::from_project(&three_tier()).unwrap();
    assert!(graph.demands("db").healthy);
    assert!(!graph.demands("db").completed);
    assert!(!graph.demands("cache").healthy);
    assert!(!graph.demands("web").healthy);
  }

  #[test]
  fn subset_keeps_transitive_dependencies() {
    let graph =
      ServiceGraph::from_project(&three_tier()).unwrap();
    let subset = graph.subset(&[String::from("web")], true);
    assert_eq!(subset.nodes().len(), 3);
    let without =
      graph.subset(&[String::from("web")], false);
    assert_eq!(without.nodes(), &[String::from("web")]);
    assert!(without.dependencies("web").is_empty());
  }

  #[tokio::test]
  async fn forward_order_respects_gating() {
    let graph =
      ServiceGraph::from_project(&three_tier()).unwrap();
    let order: Arc<Mutex<Vec<String>>> = Default::default();

    let record = order.clone();
    scheduler()
      .run(&graph, Direction::Forward, move |handle: NodeHandle| {
        let record = record.clone();
        async move {
          if handle.service() == "db" {
            // Dependents must not start until healthy is marked.
            tokio::time::sleep(Duration::from_millis(20)).await;
            record
              .lock()
              .unwrap()
              .push(String::from("db-healthy"));
            handle.mark_healthy();
          }
          record
            .lock()
            .unwrap()
            .push(handle.service().to_string());
          Ok(())
        }
      })
      .await
      .unwrap();

    let order = order.lock().unwrap().clone();
    let position = |entry: &str| {
      order.iter().position(|o| o == entry).unwrap()
    };
    assert!(position("db-healthy") < position("web"));
    assert!(position("cache") < position("web"));
  }

  #[tokio::test]
  async fn reverse_order_stops_dependents_first() {
    let graph =
      ServiceGraph::from_project(&three_tier()).unwrap();
    let order: Arc<Mutex<Vec<String>>> = Default::default();

    let record = order.clone();
    scheduler()
      .run(&graph, Direction::Reverse, move |handle: NodeHandle| {
        let record = record.clone();
        async move {
          record
            .lock()
            .unwrap()
            .push(handle.service().to_string());
          Ok(())
        }
      })
      .await
      .unwrap();

    let order = order.lock().unwrap().clone();
    let position =
      |entry: &str| order.iter().position(|o| o == entry).unwrap();
    assert!(position("web") < position("db"));
    assert!(position("web") < position("cache"));
  }

  #[tokio::test]
  async fn required_failure_skips_dependents() {
    let graph =
      ServiceGraph::from_project(&three_tier()).unwrap();
    let ran: Arc<Mutex<Vec<String>>> = Default::default();

    let record = ran.clone();
    let errors = scheduler()
      .run(&graph, Direction::Forward, move |handle: NodeHandle| {
        let record = record.clone();
        async move {
          if handle.service() == "db" {
            anyhow::bail!("boom");
          }
          record
            .lock()
            .unwrap()
            .push(handle.service().to_string());
          Ok(())
        }
      })
      .await
      .unwrap_err();

    assert!(!ran.lock().unwrap().contains(&String::from("web")));
    assert_eq!(
      errors.kind("web"),
      Some(ErrorKind::DependencyFailed)
    );
    assert!(errors.errors.contains_key("db"));
    // cache has no part in the failure.
    assert!(!errors.errors.contains_key("cache"));
  }

  #[tokio::test]
  async fn optional_failure_does_not_block() {
    let project = project(
      "
name: demo
services:
  flaky:
    image: x
  web:
    image: nginx
    depends_on:
      flaky:
        condition: service_started
        required: false
",
    );
    let graph = ServiceGraph::from_project(&project).unwrap();
    let ran: Arc<Mutex<Vec<String>>> = Default::default();

    let record = ran.clone();
    let errors = scheduler()
      .run(&graph, Direction::Forward, move |handle: NodeHandle| {
        let record = record.clone();
        async move {
          if handle.service() == "flaky" {
            anyhow::bail!("boom");
          }
          record
            .lock()
            .unwrap()
            .push(handle.service().to_string());
          Ok(())
        }
      })
      .await
      .unwrap_err();

    assert!(ran.lock().unwrap().contains(&String::from("web")));
    assert!(errors.errors.contains_key("flaky"));
    assert!(!errors.errors.contains_key("web"));
  }

  #[tokio::test]
  async fn parallelism_is_bounded() {
    let project = project(
      "
name: demo
services:
  a:
    image: x
  b:
    image: x
  c:
    image: x
  d:
    image: x
",
    );
    let graph = ServiceGraph::from_project(&project).unwrap();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let scheduler = Scheduler {
      max_parallel: Some(2),
      cancel: CancellationToken::new(),
    };
    let (current_op, peak_op) = (current.clone(), peak.clone());
    scheduler
      .run(&graph, Direction::Forward, move |_handle| {
        let current = current_op.clone();
        let peak = peak_op.clone();
        async move {
          let now = current.fetch_add(1, Ordering::SeqCst) + 1;
          peak.fetch_max(now, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(10)).await;
          current.fetch_sub(1, Ordering::SeqCst);
          Ok(())
        }
      })
      .await
      .unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
  }

  #[tokio::test]
  async fn cancellation_skips_pending_nodes() {
    let graph =
      ServiceGraph::from_project(&three_tier()).unwrap();
    let cancel = CancellationToken::new();
    let scheduler = Scheduler {
      max_parallel: None,
      cancel: cancel.clone(),
    };

    let errors = scheduler
      .run(&graph, Direction::Forward, move |handle: NodeHandle| {
        let cancel = cancel.clone();
        async move {
          if handle.service() == "db" {
            // Cancel mid-run; web is still waiting on the gate
            // and must observe cancellation, not a gate change.
            cancel.cancel();
            tokio::time::sleep(Duration::from_millis(50)).await;
          }
          Ok(())
        }
      })
      .await
      .unwrap_err();

    assert_eq!(errors.kind("web"), Some(ErrorKind::Canceled));
  }
}
