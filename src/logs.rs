//! Container log fan-in
//!
//! Locates an application's replicas through the runtime's label filter,
//! never through the orchestrator's in-memory tracking, so logs keep
//! flowing even for containers the control plane lost track of. Output is
//! split into lines and published to the hub topic `app:<app_id>`; build
//! output reaches subscribers on `build:<build_id>`.

use crate::error::Result;
use crate::hub::LogHub;
use crate::runtime::{ContainerRuntime, ContainerSummary, APP_ID_LABEL};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default number of historical lines when following a container.
const FOLLOW_TAIL: u32 = 100;

/// Hub topic carrying one build's output.
pub fn build_topic(build_id: Uuid) -> String {
    format!("build:{}", build_id)
}

/// Hub topic carrying one application's aggregated container output.
pub fn app_topic(app_id: Uuid) -> String {
    format!("app:{}", app_id)
}

pub struct LogStreamer {
    runtime: Arc<dyn ContainerRuntime>,
    hub: LogHub,
}

impl LogStreamer {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, hub: LogHub) -> Self {
        Self { runtime, hub }
    }

    /// All containers labeled as belonging to the app, running or not.
    pub async fn containers_for_app(&self, app_id: Uuid) -> Result<Vec<ContainerSummary>> {
        let id = app_id.to_string();
        let all = self.runtime.list_containers(true, None).await?;
        Ok(all
            .into_iter()
            .filter(|c| c.labels.get(APP_ID_LABEL) == Some(&id))
            .collect())
    }

    /// Collect the last `tail` lines from every replica.
    pub async fn recent_logs(&self, app_id: Uuid, tail: u32) -> Result<Vec<String>> {
        let containers = self.containers_for_app(app_id).await?;
        let mut lines = Vec::new();
        for container in containers {
            let mut stream = match self
                .runtime
                .container_logs(&container.id, false, Some(tail))
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(container_id = %container.id, error = %err, "Failed to fetch logs");
                    continue;
                }
            };
            let mut buffer = LineBuffer::default();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => lines.extend(buffer.push(&chunk.data)),
                    Err(err) => {
                        warn!(container_id = %container.id, error = %err, "Log stream error");
                        break;
                    }
                }
            }
            lines.extend(buffer.flush());
        }
        Ok(lines)
    }

    /// Follow every replica of an app, publishing each line to the app's
    /// hub topic. Returns when `shutdown` fires or every stream ends.
    pub async fn stream_app_logs(&self, app_id: Uuid, shutdown: CancellationToken) -> Result<()> {
        let containers = self.containers_for_app(app_id).await?;
        let topic = app_topic(app_id);

        let mut tasks = Vec::with_capacity(containers.len());
        for container in containers {
            let runtime = Arc::clone(&self.runtime);
            let hub = self.hub.clone();
            let topic = topic.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                follow_container(runtime, hub, topic, container.id, shutdown).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

async fn follow_container(
    runtime: Arc<dyn ContainerRuntime>,
    hub: LogHub,
    topic: String,
    container_id: String,
    shutdown: CancellationToken,
) {
    let mut stream = match runtime
        .container_logs(&container_id, true, Some(FOLLOW_TAIL))
        .await
    {
        Ok(stream) => stream,
        Err(err) => {
            warn!(container_id = %container_id, error = %err, "Failed to follow logs");
            return;
        }
    };

    let mut buffer = LineBuffer::default();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(container_id = %container_id, "Log streaming stopped");
                break;
            }
            chunk = stream.next() => match chunk {
                Some(Ok(chunk)) => {
                    for line in buffer.push(&chunk.data) {
                        hub.publish(&topic, line).await;
                    }
                }
                Some(Err(err)) => {
                    warn!(container_id = %container_id, error = %err, "Error reading container logs");
                    break;
                }
                None => {
                    debug!(container_id = %container_id, "Container log stream ended");
                    break;
                }
            }
        }
    }
    for line in buffer.flush() {
        hub.publish(&topic, line).await;
    }
}

/// Splits a byte stream into complete text lines. Chunks may end mid-line;
/// the partial tail is held back until its newline arrives.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        lines
    }

    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerSpec, FakeRuntime};
    use std::collections::HashMap;

    #[test]
    fn test_line_buffer_splits_partial_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"hel").is_empty());
        assert_eq!(buffer.push(b"lo\nwor"), vec!["hello"]);
        assert_eq!(buffer.push(b"ld\n"), vec!["world"]);
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn test_line_buffer_strips_carriage_returns_and_blanks() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.push(b"one\r\n\ntwo\n"), vec!["one", "two"]);
        assert!(buffer.push(b"tail").is_empty());
        assert_eq!(buffer.flush(), Some("tail".to_string()));
    }

    #[tokio::test]
    async fn test_containers_found_by_label_not_name() {
        let runtime = Arc::new(FakeRuntime::new());
        let app_id = Uuid::new_v4();

        // A container with an unrelated name but the right label.
        let mut spec = ContainerSpec::new("something-else", "img:1");
        spec.labels =
            HashMap::from([(APP_ID_LABEL.to_string(), app_id.to_string())]);
        runtime.create_container(&spec).await.unwrap();

        // Right name prefix, wrong label.
        let mut other = ContainerSpec::new("nanopaas-api", "img:1");
        other.labels =
            HashMap::from([(APP_ID_LABEL.to_string(), Uuid::new_v4().to_string())]);
        runtime.create_container(&other).await.unwrap();

        let streamer = LogStreamer::new(runtime, LogHub::new());
        let found = streamer.containers_for_app(app_id).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "something-else");
    }

    #[tokio::test]
    async fn test_recent_logs_aggregates_replicas() {
        let runtime = Arc::new(FakeRuntime::new());
        let app_id = Uuid::new_v4();

        for name in ["nanopaas-api", "nanopaas-api-1"] {
            let mut spec = ContainerSpec::new(name, "img:1");
            spec.labels =
                HashMap::from([(APP_ID_LABEL.to_string(), app_id.to_string())]);
            let id = runtime.create_container(&spec).await.unwrap();
            runtime.set_canned_logs(&id, vec![format!("hello from {}", name)]);
        }

        let streamer =
            LogStreamer::new(runtime.clone(), LogHub::new());
        let mut lines = streamer.recent_logs(app_id, 50).await.unwrap();
        lines.sort();
        assert_eq!(
            lines,
            vec!["hello from nanopaas-api", "hello from nanopaas-api-1"]
        );
    }

    #[tokio::test]
    async fn test_stream_publishes_to_app_topic() {
        let runtime = Arc::new(FakeRuntime::new());
        let hub = LogHub::new();
        let app_id = Uuid::new_v4();

        let mut spec = ContainerSpec::new("nanopaas-api", "img:1");
        spec.labels = HashMap::from([(APP_ID_LABEL.to_string(), app_id.to_string())]);
        let id = runtime.create_container(&spec).await.unwrap();
        runtime.set_canned_logs(&id, vec!["line one".into(), "line two".into()]);

        let mut sub = hub.register().await.unwrap();
        hub.subscribe(sub.id, app_topic(app_id)).await;

        let streamer = LogStreamer::new(runtime, hub.clone());
        streamer
            .stream_app_logs(app_id, CancellationToken::new())
            .await
            .unwrap();

        let first = sub.receiver.recv().await.unwrap();
        assert_eq!(first.payload, "line one");
        let second = sub.receiver.recv().await.unwrap();
        assert_eq!(second.payload, "line two");
    }
}
