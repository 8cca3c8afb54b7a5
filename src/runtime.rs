//! Container runtime abstraction
//!
//! The rest of the control plane only ever talks to [`ContainerRuntime`].
//! `DockerRuntime` (in `docker.rs`) implements it against a real daemon;
//! [`FakeRuntime`] implements it in memory so every orchestration and build
//! path is testable without a daemon.

use crate::error::{PaasError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Label stamped on every managed container and network.
pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "nanopaas";

/// Owning application id, used by the log handler to locate replicas.
pub const APP_ID_LABEL: &str = "nanopaas.app.id";
pub const APP_SLUG_LABEL: &str = "nanopaas.app.slug";
pub const REPLICA_LABEL: &str = "nanopaas.replica";
pub const DEPLOYMENT_ID_LABEL: &str = "nanopaas.deployment.id";

/// Restart behavior the runtime applies to a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    OnFailure(u32),
    UnlessStopped,
    No,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::OnFailure(3)
    }
}

/// Everything needed to create one replica container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Full container name, already carrying the managed prefix
    pub name: String,
    pub image: String,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Exposed TCP ports; each gets a host-auto-assigned binding
    pub ports: Vec<u16>,
    /// Memory cap in bytes, 0 for unlimited
    pub memory_limit: i64,
    /// CPU quota in microseconds, 0 for unlimited
    pub cpu_quota: i64,
    pub restart_policy: RestartPolicy,
    /// Bridge network to attach to
    pub network: Option<String>,
    /// Unix user the entrypoint runs as
    pub user: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: Vec::new(),
            labels: HashMap::new(),
            ports: Vec::new(),
            memory_limit: 0,
            cpu_quota: 0,
            restart_policy: RestartPolicy::default(),
            network: None,
            user: Some("1000".to_string()),
        }
    }
}

/// Listing entry for a container.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub labels: HashMap<String, String>,
    pub ip_address: Option<String>,
}

/// Inspection result for one container.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    /// None when the image defines no health check
    pub healthy: Option<bool>,
    /// network name -> address
    pub ip_addresses: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

/// Which stream a log chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// A decoded piece of container output. The daemon's 8-byte multiplex
/// framing is stripped at the adapter boundary; consumers see text bytes.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub source: LogSource,
    pub data: Bytes,
}

/// Callback receiving raw build output chunks as they arrive.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A tarred build context plus everything the daemon needs to build it.
#[derive(Debug, Clone)]
pub struct ImageBuildRequest {
    /// Uncompressed tar archive of the build context
    pub context: Vec<u8>,
    /// Dockerfile path relative to the context root
    pub dockerfile_path: String,
    pub tags: Vec<String>,
    pub build_args: HashMap<String, String>,
    pub no_cache: bool,
    pub pull_parent: bool,
}

#[derive(Debug, Clone)]
pub struct BuiltImage {
    /// Opaque daemon-side image id
    pub id: String,
    /// The tag the image was built under
    pub tag: String,
}

pub type LogStream = BoxStream<'static, Result<LogChunk>>;

/// The minimum runtime surface the control plane needs.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Liveness of the daemon.
    async fn ping(&self) -> Result<()>;

    /// Create the shared bridge network if absent. Idempotent.
    async fn ensure_network(&self, name: &str) -> Result<()>;

    /// Build an image from a tarred context, forwarding every output chunk
    /// to `on_log`. Honors `cancel` by ceasing output forwarding.
    async fn build_image(
        &self,
        req: ImageBuildRequest,
        cancel: &CancellationToken,
        on_log: &LogCallback,
    ) -> Result<BuiltImage>;

    /// Create a container. Refuses name collisions.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn restart_container(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;

    /// List containers, optionally including stopped ones, optionally
    /// filtered by name prefix.
    async fn list_containers(
        &self,
        all: bool,
        name_prefix: Option<&str>,
    ) -> Result<Vec<ContainerSummary>>;

    /// Stream container output. With `follow` the stream stays open until
    /// the container exits or the consumer drops it.
    async fn container_logs(
        &self,
        id: &str,
        follow: bool,
        tail: Option<u32>,
    ) -> Result<LogStream>;

    /// True when the runtime reports the container healthy; falls back to
    /// "is running" when the image defines no health check.
    async fn health(&self, id: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Fake runtime for tests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
    healthy: bool,
    ip: String,
}

#[derive(Debug, Clone)]
pub struct RecordedBuild {
    pub tags: Vec<String>,
    pub dockerfile_path: String,
    pub context_len: usize,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    networks: HashSet<String>,
    build_requests: Vec<RecordedBuild>,
    fail_create_names: HashSet<String>,
    fail_start_names: HashSet<String>,
    fail_start_images: HashSet<String>,
    fail_builds: bool,
    canned_logs: HashMap<String, Vec<String>>,
}

/// In-memory stand-in for a container daemon.
///
/// Failure injection knobs let tests drive every rollback and teardown
/// path: creates or starts can be failed by container name or image tag,
/// builds can fail wholesale or be slowed down to expose cancellation.
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    next_id: AtomicU64,
    next_ip: AtomicU64,
    build_delay: Mutex<Option<Duration>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            next_id: AtomicU64::new(1),
            next_ip: AtomicU64::new(2),
            build_delay: Mutex::new(None),
        }
    }

    pub fn fail_create_for_name(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_create_names
            .insert(name.to_string());
    }

    pub fn fail_start_for_name(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_start_names
            .insert(name.to_string());
    }

    pub fn fail_start_for_image(&self, image: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_start_images
            .insert(image.to_string());
    }

    pub fn fail_builds(&self, fail: bool) {
        self.state.lock().unwrap().fail_builds = fail;
    }

    /// Make every image build take this long, so tests can cancel mid-build
    /// or fill the job queue.
    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_canned_logs(&self, container_id: &str, lines: Vec<String>) {
        self.state
            .lock()
            .unwrap()
            .canned_logs
            .insert(container_id.to_string(), lines);
    }

    pub fn set_unhealthy(&self, container_id: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(container_id) {
            c.healthy = false;
        }
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .map(|c| c.spec.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn running_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.running)
            .count()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn build_requests(&self) -> Vec<RecordedBuild> {
        self.state.lock().unwrap().build_requests.clone()
    }

    pub fn networks(&self) -> Vec<String> {
        let mut nets: Vec<String> = self.state.lock().unwrap().networks.iter().cloned().collect();
        nets.sort();
        nets
    }

    pub fn image_of(&self, container_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|c| c.spec.image.clone())
    }

    fn summary(c: &FakeContainer) -> ContainerSummary {
        ContainerSummary {
            id: c.id.clone(),
            name: c.spec.name.clone(),
            image: c.spec.image.clone(),
            state: if c.running { "running" } else { "exited" }.to_string(),
            labels: c.spec.labels.clone(),
            ip_address: Some(c.ip.clone()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().networks.insert(name.to_string());
        Ok(())
    }

    async fn build_image(
        &self,
        req: ImageBuildRequest,
        cancel: &CancellationToken,
        on_log: &LogCallback,
    ) -> Result<BuiltImage> {
        let tag = req
            .tags
            .first()
            .cloned()
            .ok_or_else(|| PaasError::build_failed("no tag supplied"))?;

        {
            let mut state = self.state.lock().unwrap();
            state.build_requests.push(RecordedBuild {
                tags: req.tags.clone(),
                dockerfile_path: req.dockerfile_path.clone(),
                context_len: req.context.len(),
            });
        }

        on_log(&format!("Step 1/1 : building {}\n", tag));

        let delay = *self.build_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(PaasError::cancelled("build cancelled"));
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(PaasError::cancelled("build cancelled"));
        }

        if self.state.lock().unwrap().fail_builds {
            on_log("error: build step failed\n");
            return Err(PaasError::build_failed("fake build failure"));
        }

        on_log(&format!("Successfully tagged {}\n", tag));
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(BuiltImage {
            id: format!("sha256:fake{:08x}", n),
            tag,
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state
            .containers
            .values()
            .any(|c| c.spec.name == spec.name)
        {
            return Err(PaasError::runtime(format!(
                "container name '{}' is already in use",
                spec.name
            )));
        }
        if state.fail_create_names.contains(&spec.name) {
            return Err(PaasError::runtime(format!(
                "injected create failure for '{}'",
                spec.name
            )));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake{:012x}", n);
        let octet = self.next_ip.fetch_add(1, Ordering::SeqCst) % 250 + 2;
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                healthy: true,
                ip: format!("172.28.0.{}", octet),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let fail = {
            let c = state
                .containers
                .get(id)
                .ok_or_else(|| PaasError::runtime(format!("no such container: {}", id)))?;
            state.fail_start_names.contains(&c.spec.name)
                || state.fail_start_images.contains(&c.spec.image)
        };
        if fail {
            return Err(PaasError::runtime(format!(
                "injected start failure for {}",
                id
            )));
        }
        state.containers.get_mut(id).expect("checked above").running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.get_mut(id) {
            c.running = false;
        }
        Ok(())
    }

    async fn restart_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(id) {
            Some(c) => {
                c.running = true;
                c.healthy = true;
                Ok(())
            }
            None => Err(PaasError::runtime(format!("no such container: {}", id))),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.get(id) {
            if c.running && !force {
                return Err(PaasError::runtime(format!(
                    "container {} is running; use force",
                    id
                )));
            }
            state.containers.remove(id);
        }
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let state = self.state.lock().unwrap();
        let c = state
            .containers
            .get(id)
            .ok_or_else(|| PaasError::runtime(format!("no such container: {}", id)))?;
        let mut ips = HashMap::new();
        if let Some(network) = &c.spec.network {
            ips.insert(network.clone(), c.ip.clone());
        }
        Ok(ContainerDetails {
            id: c.id.clone(),
            name: c.spec.name.clone(),
            image: c.spec.image.clone(),
            running: c.running,
            healthy: Some(c.healthy),
            ip_addresses: ips,
            labels: c.spec.labels.clone(),
        })
    }

    async fn list_containers(
        &self,
        all: bool,
        name_prefix: Option<&str>,
    ) -> Result<Vec<ContainerSummary>> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<ContainerSummary> = state
            .containers
            .values()
            .filter(|c| all || c.running)
            .filter(|c| name_prefix.map_or(true, |p| c.spec.name.starts_with(p)))
            .map(Self::summary)
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn container_logs(
        &self,
        id: &str,
        _follow: bool,
        tail: Option<u32>,
    ) -> Result<LogStream> {
        let state = self.state.lock().unwrap();
        if !state.containers.contains_key(id) {
            return Err(PaasError::runtime(format!("no such container: {}", id)));
        }
        let mut lines = state.canned_logs.get(id).cloned().unwrap_or_default();
        if let Some(tail) = tail {
            let skip = lines.len().saturating_sub(tail as usize);
            lines = lines.split_off(skip);
        }
        let chunks: Vec<Result<LogChunk>> = lines
            .into_iter()
            .map(|l| {
                Ok(LogChunk {
                    source: LogSource::Stdout,
                    data: Bytes::from(format!("{}\n", l)),
                })
            })
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn health(&self, id: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        let c = state
            .containers
            .get(id)
            .ok_or_else(|| PaasError::runtime(format!("no such container: {}", id)))?;
        Ok(c.running && c.healthy)
    }
}
