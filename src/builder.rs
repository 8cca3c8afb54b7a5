//! Build engine: source in, tagged image out
//!
//! A fixed pool of workers consumes a bounded job queue. Each job acquires
//! its source into a private scratch directory, resolves or synthesizes a
//! Dockerfile, tars the context and hands it to the container runtime with
//! the job's log callback wired to the build output stream. Builds are
//! cancellable and deadline-bounded.

use crate::config::BuilderConfig;
use crate::domain::BuildStatus;
use crate::error::{ErrorKind, PaasError, Result};
use crate::runtime::{ContainerRuntime, ImageBuildRequest, LogCallback};
use crate::store::BuildStore;
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Dockerfile names probed in order before synthesis kicks in.
const DOCKERFILE_CANDIDATES: [&str; 4] = [
    "Dockerfile",
    "dockerfile",
    "Dockerfile.prod",
    "Dockerfile.production",
];

/// Where a build job takes its source from.
pub enum SourceInput {
    /// Gzipped tar archive of the source tree
    Archive(Vec<u8>),
    /// Git repository, shallow-cloned at an optional ref
    Repository {
        url: String,
        reference: Option<String>,
    },
    /// Plain HTTP download (not implemented)
    Url(String),
}

/// Callback invoked once after a successful build with (image_id, image_tag).
pub type SuccessCallback = Box<dyn FnOnce(String, String) + Send + Sync>;

/// One unit of work for the pool.
pub struct BuildJob {
    pub build_id: Uuid,
    pub app_slug: String,
    /// Port the synthesized Dockerfile exposes
    pub primary_port: u16,
    pub source: SourceInput,
    pub on_log: LogCallback,
    result_tx: Option<oneshot::Sender<BuildOutcome>>,
    on_success: Option<SuccessCallback>,
    cancel: CancellationToken,
}

impl BuildJob {
    pub fn new(
        build_id: Uuid,
        app_slug: impl Into<String>,
        primary_port: u16,
        source: SourceInput,
        on_log: LogCallback,
    ) -> Self {
        Self {
            build_id,
            app_slug: app_slug.into(),
            primary_port,
            source,
            on_log,
            result_tx: None,
            on_success: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_result_channel(mut self, tx: oneshot::Sender<BuildOutcome>) -> Self {
        self.result_tx = Some(tx);
        self
    }

    pub fn with_on_success(mut self, callback: SuccessCallback) -> Self {
        self.on_success = Some(callback);
        self
    }
}

/// Terminal result of one build job.
#[derive(Debug)]
pub struct BuildOutcome {
    pub build_id: Uuid,
    pub image_id: Option<String>,
    pub image_tag: Option<String>,
    pub error: Option<PaasError>,
    pub duration: std::time::Duration,
}

/// Worker pool turning sources into tagged images.
pub struct BuildEngine {
    config: BuilderConfig,
    runtime: Arc<dyn ContainerRuntime>,
    builds: Arc<BuildStore>,
    queue_tx: mpsc::Sender<BuildJob>,
    active: RwLock<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl BuildEngine {
    /// Create the engine and start its workers.
    pub fn new(
        config: BuilderConfig,
        runtime: Arc<dyn ContainerRuntime>,
        builds: Arc<BuildStore>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let engine = Arc::new(Self {
            config,
            runtime,
            builds,
            queue_tx,
            active: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            workers: StdMutex::new(Vec::new()),
        });

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let mut handles = Vec::new();
        for worker_id in 0..engine.config.worker_count.max(1) {
            let engine = Arc::clone(&engine);
            let queue_rx = Arc::clone(&queue_rx);
            handles.push(tokio::spawn(async move {
                engine.worker_loop(worker_id, queue_rx).await;
            }));
        }
        *engine.workers.lock().unwrap() = handles;

        info!(
            workers = engine.config.worker_count,
            work_dir = %engine.config.work_dir.display(),
            "Build engine started"
        );
        engine
    }

    /// Submit a job. Fails fast with `queue_full` instead of blocking.
    pub async fn submit(&self, mut job: BuildJob) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(PaasError::runtime("build engine is shutting down"));
        }

        let token = CancellationToken::new();
        job.cancel = token.clone();
        self.active.write().await.insert(job.build_id, token);

        let build_id = job.build_id;
        match self.queue_tx.try_send(job) {
            Ok(()) => {
                info!(build_id = %build_id, "Build job submitted");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.active.write().await.remove(&build_id);
                Err(PaasError::queue_full("build queue is full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.active.write().await.remove(&build_id);
                Err(PaasError::runtime("build engine is shutting down"))
            }
        }
    }

    /// Cancel a queued or running build. Returns false for unknown or
    /// already-finished builds.
    pub async fn cancel_build(&self, build_id: Uuid) -> bool {
        let token = self.active.read().await.get(&build_id).cloned();
        let Some(token) = token else {
            return false;
        };
        token.cancel();
        let _ = self
            .builds
            .update(build_id, |b| {
                if !b.is_terminal() {
                    b.cancel();
                }
            })
            .await;
        info!(build_id = %build_id, "Build cancelled");
        true
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Jobs sitting in the queue, not yet picked up by a worker.
    pub fn queue_length(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    /// Stop accepting work and wait for in-flight builds to drain.
    pub async fn shutdown(&self) {
        info!("Shutting down build engine");
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        info!("Build engine stopped");
    }

    async fn worker_loop(&self, worker_id: usize, queue_rx: Arc<Mutex<mpsc::Receiver<BuildJob>>>) {
        debug!(worker_id, "Build worker started");
        loop {
            let job = {
                let mut rx = queue_rx.lock().await;
                tokio::select! {
                    job = rx.recv() => job,
                    _ = self.shutdown.cancelled() => None,
                }
            };
            match job {
                Some(job) => self.process_job(worker_id, job).await,
                None => break,
            }
        }
        debug!(worker_id, "Build worker stopping");
    }

    async fn process_job(&self, worker_id: usize, job: BuildJob) {
        let started = Instant::now();
        let build_id = job.build_id;

        // Cancelled while still queued: skip processing entirely.
        let status = self.builds.get(build_id).await.map(|b| b.status);
        if status == Some(BuildStatus::Cancelled) || job.cancel.is_cancelled() {
            let _ = self
                .builds
                .update(build_id, |b| {
                    if !b.is_terminal() {
                        b.cancel();
                    }
                })
                .await;
            self.finish(job, Err(PaasError::cancelled("build cancelled")), started)
                .await;
            return;
        }

        info!(worker = worker_id, build_id = %build_id, app = %job.app_slug, "Processing build");
        let _ = self.builds.update(build_id, |b| b.start()).await;

        (job.on_log)(&format!("[NanoPaaS] Build {} started\n", short(&build_id)));

        let scratch = self
            .config
            .work_dir
            .join(format!("nanopaas-build-{}", short(&build_id)));

        let result = self.run_build(&job, &scratch).await;

        if self.config.cleanup_on_finish {
            if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(build_id = %build_id, error = %e, "Failed to clean scratch directory");
                }
            }
        }

        self.finish(job, result, started).await;
    }

    async fn run_build(
        &self,
        job: &BuildJob,
        scratch: &Path,
    ) -> Result<(String, String)> {
        tokio::fs::create_dir_all(scratch).await.map_err(|e| {
            PaasError::build_failed(format!("failed to create build directory: {}", e))
        })?;

        self.acquire_source(job, scratch).await?;

        let dockerfile_path =
            resolve_dockerfile(scratch, job.primary_port, job.on_log.as_ref())?;
        let _ = self
            .builds
            .update(job.build_id, |b| {
                b.dockerfile_path = dockerfile_path.clone();
            })
            .await;

        let image_tag = self
            .builds
            .get(job.build_id)
            .await
            .map(|b| b.image_tag_for(&job.app_slug))
            .ok_or_else(|| PaasError::not_found(format!("build {} not found", job.build_id)))?;
        (job.on_log)(&format!("[NanoPaaS] Building image: {}\n", image_tag));

        let build_args = self
            .builds
            .get(job.build_id)
            .await
            .map(|b| b.build_args.into_iter().collect::<HashMap<_, _>>())
            .unwrap_or_default();

        let context = {
            let scratch = scratch.to_path_buf();
            tokio::task::spawn_blocking(move || create_context_tar(&scratch))
                .await
                .map_err(|e| PaasError::build_failed(format!("context task failed: {}", e)))?
                .map_err(|e| {
                    PaasError::build_failed(format!("failed to create build context: {}", e))
                })?
        };

        let request = ImageBuildRequest {
            context,
            dockerfile_path,
            tags: vec![image_tag],
            build_args,
            no_cache: false,
            pull_parent: true,
        };

        let built = tokio::select! {
            result = self.runtime.build_image(request, &job.cancel, &job.on_log) => result?,
            _ = job.cancel.cancelled() => {
                return Err(PaasError::cancelled("build cancelled"));
            }
            _ = tokio::time::sleep(self.config.max_build_time()) => {
                return Err(PaasError::build_failed("deadline exceeded"));
            }
        };

        Ok((built.id, built.tag))
    }

    async fn acquire_source(&self, job: &BuildJob, scratch: &Path) -> Result<()> {
        match &job.source {
            SourceInput::Archive(data) => {
                (job.on_log)("[NanoPaaS] Extracting source archive...\n");
                let data = data.clone();
                let dest = scratch.to_path_buf();
                tokio::task::spawn_blocking(move || extract_archive(&data, &dest))
                    .await
                    .map_err(|e| {
                        PaasError::source_fetch_failed(format!("extraction task failed: {}", e))
                    })?
            }
            SourceInput::Repository { url, reference } => {
                (job.on_log)(&format!("[NanoPaaS] Cloning repository: {}\n", url));
                clone_repository(url, reference.as_deref(), scratch).await
            }
            SourceInput::Url(_) => Err(PaasError::source_fetch_failed(
                "URL source download is not implemented",
            )),
        }
    }

    async fn finish(
        &self,
        job: BuildJob,
        result: Result<(String, String)>,
        started: Instant,
    ) {
        let build_id = job.build_id;
        let duration = started.elapsed();

        // A cancellation racing the build wins over a late success: results
        // of cancelled builds are discarded and no callbacks fire.
        let result = if job.cancel.is_cancelled() && result.is_ok() {
            Err(PaasError::cancelled("build cancelled"))
        } else {
            result
        };

        let outcome = match result {
            Ok((image_id, image_tag)) => {
                (job.on_log)(&format!(
                    "[NanoPaaS] Build completed successfully in {:.1}s\n",
                    duration.as_secs_f64()
                ));
                let _ = self
                    .builds
                    .update(build_id, |b| b.succeed(&image_id, &image_tag))
                    .await;
                info!(build_id = %build_id, image = %image_tag, ?duration, "Build succeeded");

                if let Some(on_success) = job.on_success {
                    let (id, tag) = (image_id.clone(), image_tag.clone());
                    tokio::spawn(async move {
                        on_success(id, tag);
                    });
                }

                BuildOutcome {
                    build_id,
                    image_id: Some(image_id),
                    image_tag: Some(image_tag),
                    error: None,
                    duration,
                }
            }
            Err(err) if err.kind == ErrorKind::Cancelled => {
                let _ = self
                    .builds
                    .update(build_id, |b| {
                        if !b.is_terminal() {
                            b.cancel();
                        }
                    })
                    .await;
                info!(build_id = %build_id, "Build cancelled, result discarded");
                BuildOutcome {
                    build_id,
                    image_id: None,
                    image_tag: None,
                    error: Some(err),
                    duration,
                }
            }
            Err(err) => {
                (job.on_log)(&format!("[NanoPaaS] Build failed: {}\n", err.message));
                let _ = self
                    .builds
                    .update(build_id, |b| {
                        if !b.is_terminal() {
                            b.fail(&err.message);
                        }
                    })
                    .await;
                error!(build_id = %build_id, error = %err, ?duration, "Build failed");
                BuildOutcome {
                    build_id,
                    image_id: None,
                    image_tag: None,
                    error: Some(err),
                    duration,
                }
            }
        };

        self.active.write().await.remove(&build_id);

        if let Some(tx) = job.result_tx {
            let _ = tx.send(outcome);
        }
    }
}

fn short(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Reject any entry whose cleaned path would land outside the extraction
/// root: no absolute paths, no parent-directory components.
fn is_safe_entry_path(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Extract a gzipped tar archive into `dest`, preserving file modes.
fn extract_archive(data: &[u8], dest: &Path) -> Result<()> {
    let gz = GzDecoder::new(data);
    let mut archive = tar::Archive::new(gz);
    archive.set_preserve_permissions(true);

    let entries = archive
        .entries()
        .map_err(|e| PaasError::source_fetch_failed(format!("failed to read archive: {}", e)))?;

    for entry in entries {
        let mut entry = entry
            .map_err(|e| PaasError::source_fetch_failed(format!("corrupt archive entry: {}", e)))?;
        let path: PathBuf = entry
            .path()
            .map_err(|e| PaasError::source_fetch_failed(format!("bad entry path: {}", e)))?
            .into_owned();

        if !is_safe_entry_path(&path) {
            return Err(PaasError::source_fetch_failed(format!(
                "archive entry '{}' escapes the build directory",
                path.display()
            )));
        }

        let target = dest.join(&path);
        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target).map_err(|e| {
                    PaasError::source_fetch_failed(format!("failed to create directory: {}", e))
                })?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        PaasError::source_fetch_failed(format!("failed to create directory: {}", e))
                    })?;
                }
                entry.unpack(&target).map_err(|e| {
                    PaasError::source_fetch_failed(format!(
                        "failed to extract '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
            }
            // Links and special files are not part of a build context.
            _ => {}
        }
    }

    Ok(())
}

/// Shallow clone of a git repository into `dest`.
async fn clone_repository(url: &str, reference: Option<&str>, dest: &Path) -> Result<()> {
    let mut cmd = tokio::process::Command::new("git");
    cmd.arg("clone").arg("--depth").arg("1");
    if let Some(reference) = reference {
        cmd.arg("--branch").arg(reference);
    }
    cmd.arg(url).arg(dest);

    let output = cmd
        .output()
        .await
        .map_err(|e| PaasError::source_fetch_failed(format!("failed to run git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PaasError::source_fetch_failed(format!(
            "git clone failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Tar up the scratch directory as the image build context.
fn create_context_tar(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    builder.into_inner()
}

/// Find a Dockerfile in the scratch directory, or synthesize one from the
/// project layout. Returns the Dockerfile path relative to the context root.
fn resolve_dockerfile(dir: &Path, port: u16, log: &(dyn Fn(&str) + Send + Sync)) -> Result<String> {
    for candidate in DOCKERFILE_CANDIDATES {
        if dir.join(candidate).is_file() {
            log(&format!("[NanoPaaS] Found Dockerfile: {}\n", candidate));
            return Ok(candidate.to_string());
        }
    }

    let dockerfile = synthesize_dockerfile(dir, port, log)?;
    std::fs::write(dir.join("Dockerfile"), dockerfile).map_err(|e| {
        PaasError::build_failed(format!("failed to write generated Dockerfile: {}", e))
    })?;
    log("[NanoPaaS] Generated Dockerfile from project layout\n");
    Ok("Dockerfile".to_string())
}

/// First matching project descriptor wins.
fn synthesize_dockerfile(
    dir: &Path,
    port: u16,
    log: &(dyn Fn(&str) + Send + Sync),
) -> Result<String> {
    if dir.join("requirements.txt").is_file() {
        log("[NanoPaaS] Detected Python project\n");
        return Ok(python_dockerfile(port));
    }
    if dir.join("package.json").is_file() {
        log("[NanoPaaS] Detected Node.js project\n");
        return Ok(node_dockerfile(port));
    }
    if dir.join("go.mod").is_file() {
        log("[NanoPaaS] Detected Go project\n");
        return Ok(go_dockerfile(port));
    }
    if dir.join("Gemfile").is_file() {
        log("[NanoPaaS] Detected Ruby project\n");
        return Ok(ruby_dockerfile(port));
    }
    Err(PaasError::dockerfile_missing(
        "no Dockerfile found and no known project descriptor to generate one from",
    ))
}

fn python_dockerfile(port: u16) -> String {
    format!(
        r#"FROM python:3.11-slim

WORKDIR /app

COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt

COPY . .

RUN useradd -m -u 1000 appuser && chown -R appuser:appuser /app
USER appuser

EXPOSE {port}

CMD ["python", "app.py"]
"#
    )
}

fn node_dockerfile(port: u16) -> String {
    format!(
        r#"FROM node:20-alpine

WORKDIR /app

COPY package*.json ./
RUN npm ci --only=production

COPY . .

RUN adduser -D -u 1000 appuser && chown -R appuser:appuser /app
USER appuser

EXPOSE {port}

CMD ["node", "index.js"]
"#
    )
}

fn go_dockerfile(port: u16) -> String {
    format!(
        r#"FROM golang:1.22-alpine AS builder

WORKDIR /app
COPY go.* ./
RUN go mod download
COPY . .
RUN CGO_ENABLED=0 GOOS=linux go build -o /app/main .

FROM alpine:latest
RUN apk --no-cache add ca-certificates
RUN adduser -D -u 1000 appuser

WORKDIR /app
COPY --from=builder /app/main .
RUN chown appuser:appuser /app/main

USER appuser
EXPOSE {port}
CMD ["./main"]
"#
    )
}

fn ruby_dockerfile(port: u16) -> String {
    format!(
        r#"FROM ruby:3.2-slim

WORKDIR /app

COPY Gemfile* ./
RUN bundle install --without development test

COPY . .

RUN useradd -m -u 1000 appuser && chown -R appuser:appuser /app
USER appuser

EXPOSE {port}

CMD ["ruby", "app.rb"]
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn silent(_line: &str) {}

    #[test]
    fn test_entry_path_safety() {
        assert!(is_safe_entry_path(Path::new("app.py")));
        assert!(is_safe_entry_path(Path::new("./src/main.rs")));
        assert!(is_safe_entry_path(Path::new("deep/nested/file")));
        assert!(!is_safe_entry_path(Path::new("../evil.txt")));
        assert!(!is_safe_entry_path(Path::new("src/../../evil.txt")));
        assert!(!is_safe_entry_path(Path::new("/etc/passwd")));
    }

    #[test]
    fn test_extract_rejects_traversal() {
        let dir = tempdir().unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let data = b"gotcha";
        // tar::Header::set_path refuses `..`, so smuggle the name in raw,
        // the way a hostile archive would.
        let mut header = tar::Header::new_gnu();
        let name = b"../escape.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();
        let tarball = builder.into_inner().unwrap();

        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut gz, &tarball).unwrap();
        let gzipped = gz.finish().unwrap();

        let err = extract_archive(&gzipped, dir.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SourceFetchFailed);
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn test_extract_preserves_layout() {
        let dir = tempdir().unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in [("app.py", "print('hi')"), ("lib/util.py", "x = 1")] {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        let tarball = builder.into_inner().unwrap();

        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut gz, &tarball).unwrap();
        let gzipped = gz.finish().unwrap();

        extract_archive(&gzipped, dir.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.py")).unwrap(),
            "print('hi')"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("lib/util.py")).unwrap(),
            "x = 1"
        );
    }

    #[test]
    fn test_dockerfile_probe_order() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile.prod"), "FROM scratch").unwrap();
        assert_eq!(
            resolve_dockerfile(dir.path(), 8080, &silent).unwrap(),
            "Dockerfile.prod"
        );

        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch").unwrap();
        assert_eq!(
            resolve_dockerfile(dir.path(), 8080, &silent).unwrap(),
            "Dockerfile"
        );
    }

    #[test]
    fn test_synthesis_detection_order() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Gemfile"), "").unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "").unwrap();
        // Python wins over Ruby.
        let dockerfile = synthesize_dockerfile(dir.path(), 9000, &silent).unwrap();
        assert!(dockerfile.starts_with("FROM python"));
        assert!(dockerfile.contains("EXPOSE 9000"));
    }

    #[test]
    fn test_synthesis_requires_descriptor() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "nothing to see").unwrap();
        let err = synthesize_dockerfile(dir.path(), 8080, &silent).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DockerfileMissing);
    }

    #[test]
    fn test_synthesized_dockerfiles_are_unprivileged() {
        for dockerfile in [
            python_dockerfile(8080),
            node_dockerfile(8080),
            go_dockerfile(8080),
            ruby_dockerfile(8080),
        ] {
            assert!(dockerfile.contains("USER appuser"), "{}", dockerfile);
            assert!(dockerfile.contains("1000"), "{}", dockerfile);
            assert!(dockerfile.contains("EXPOSE 8080"), "{}", dockerfile);
            assert!(dockerfile.contains("CMD ["), "{}", dockerfile);
        }
    }

    #[test]
    fn test_context_tar_contains_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch").unwrap();
        std::fs::write(dir.path().join("main.go"), "package main").unwrap();

        let data = create_context_tar(dir.path()).unwrap();
        let mut archive = tar::Archive::new(&data[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("Dockerfile")));
        assert!(names.iter().any(|n| n.ends_with("main.go")));
    }
}
