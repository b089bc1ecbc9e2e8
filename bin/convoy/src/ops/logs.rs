use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::{engine::LogsQuery, observe::observe};

use super::Controller;

#[derive(Debug, Clone, Default)]
pub struct LogsOptions {
  /// Restrict to these services (all when empty).
  pub services: Vec<String>,
  pub follow: bool,
  pub tail: Option<String>,
  pub timestamps: bool,
}

impl Controller {
  /// Stream logs from the project's containers to stdout, one
  /// reader task per container merged through a single printer so
  /// lines never interleave mid-write.
  #[instrument("Logs", skip_all, fields(project = project_name))]
  pub async fn logs(
    &self,
    project_name: &str,
    options: LogsOptions,
  ) -> anyhow::Result<()> {
    let observed =
      observe(self.engine.as_ref(), project_name, None).await?;

    let targets: Vec<String> = observed
      .by_service
      .iter()
      .filter(|(service, _)| {
        options.services.is_empty()
          || options.services.iter().any(|s| s == *service)
      })
      .flat_map(|(_, containers)| {
        containers.iter().map(|c| c.name.clone())
      })
      .collect();

    let width =
      targets.iter().map(String::len).max().unwrap_or(0);
    let (tx, mut rx) = mpsc::channel::<String>(64);

    for name in targets {
      let engine = self.engine.clone();
      let tx = tx.clone();
      let query = LogsQuery {
        follow: options.follow,
        tail: options.tail.clone(),
        timestamps: options.timestamps,
      };
      tokio::spawn(async move {
        let mut stream =
          match engine.container_logs(&name, query).await {
            Ok(stream) => stream,
            Err(e) => {
              warn!("failed to open logs for {name} | {e}");
              return;
            }
          };
        while let Some(line) = stream.next().await {
          match line {
            Ok(line) => {
              let formatted =
                format!("{name:<width$}  | {line}");
              if tx.send(formatted).await.is_err() {
                return;
              }
            }
            Err(e) => {
              warn!("log stream for {name} ended | {e}");
              return;
            }
          }
        }
      });
    }
    drop(tx);

    loop {
      tokio::select! {
        line = rx.recv() => {
          match line {
            Some(line) => println!("{line}"),
            None => return Ok(()),
          }
        }
        _ = self.cancel.cancelled() => return Ok(()),
      }
    }
  }
}
