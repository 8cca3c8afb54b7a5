//! End-to-end build engine tests on the in-memory runtime
//!
//! Covers archive intake, Dockerfile synthesis, cancellation, queue
//! backpressure, the deterministic image tag and the build-then-deploy
//! pipeline.

use nanopaas::builder::{BuildEngine, BuildJob, SourceInput};
use nanopaas::config::{BuilderConfig, OrchestratorConfig, RouterConfig};
use nanopaas::domain::{AppStatus, Build, BuildSource, BuildStatus};
use nanopaas::error::ErrorKind;
use nanopaas::hub::LogHub;
use nanopaas::orchestrator::Orchestrator;
use nanopaas::router::TraefikRouter;
use nanopaas::runtime::{ContainerRuntime, FakeRuntime, LogCallback};
use nanopaas::service::PaasService;
use nanopaas::store::{AppStore, BuildStore};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

struct Harness {
    service: Arc<PaasService>,
    runtime: Arc<FakeRuntime>,
    dir: TempDir,
}

fn setup() -> Harness {
    setup_with(BuilderConfig::default())
}

fn setup_with(mut builder_config: BuilderConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    builder_config.work_dir = dir.path().join("work");

    let runtime = Arc::new(FakeRuntime::new());
    let rt: Arc<dyn ContainerRuntime> = runtime.clone();
    let router = Arc::new(
        TraefikRouter::new(RouterConfig {
            dynamic_config_path: dir.path().join("dynamic.yml"),
            ..Default::default()
        })
        .unwrap(),
    );
    let apps = Arc::new(AppStore::new());
    let builds = Arc::new(BuildStore::new());
    let engine = BuildEngine::new(builder_config, Arc::clone(&rt), Arc::clone(&builds));
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        "nanopaas-",
        "nanopaas",
        Arc::clone(&rt),
        Arc::clone(&router),
    );
    let service = PaasService::new(apps, builds, engine, orchestrator, router, LogHub::new(), rt);

    Harness {
        service,
        runtime,
        dir,
    }
}

/// Gzipped tarball with the given (path, content) entries. Names are
/// written raw so tests can also smuggle in traversal paths the way a
/// hostile archive would.
fn gzip_tar(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        let name = path.as_bytes();
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, content.as_bytes()).unwrap();
    }
    let tarball = builder.into_inner().unwrap();

    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    gz.write_all(&tarball).unwrap();
    gz.finish().unwrap()
}

async fn wait_for_terminal(h: &Harness, build_id: Uuid) -> Build {
    for _ in 0..200 {
        let build = h.service.get_build(build_id).await.unwrap();
        if build.is_terminal() {
            return build;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("build {} did not reach a terminal state", build_id);
}

async fn wait_for_status(h: &Harness, build_id: Uuid, status: BuildStatus) {
    for _ in 0..200 {
        let build = h.service.get_build(build_id).await.unwrap();
        if build.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("build {} never reached {:?}", build_id, status);
}

#[tokio::test]
async fn test_archive_build_then_autodeploy() {
    let h = setup();
    let app = h
        .service
        .create_app("API", "api", Uuid::new_v4())
        .await
        .unwrap();
    let archive = gzip_tar(&[
        ("Dockerfile", "FROM alpine\nEXPOSE 8080\nCMD [\"./run\"]\n"),
        ("run", "#!/bin/sh\necho hi\n"),
    ]);

    let build = h
        .service
        .submit_archive_build(app.id, archive)
        .await
        .unwrap();

    let done = wait_for_terminal(&h, build.id).await;
    assert_eq!(done.status, BuildStatus::Succeeded);
    assert!(done.completed_at.is_some());
    assert_eq!(
        done.image_tag.as_deref(),
        Some(done.image_tag_for("api").as_str())
    );
    assert!(done.image_id.is_some());

    // The existing Dockerfile was used as-is.
    let requests = h.runtime.build_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].dockerfile_path, "Dockerfile");

    // The success callback deploys the fresh image.
    for _ in 0..200 {
        let app = h.service.get_app(app.id).await.unwrap();
        if app.status == AppStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let app = h.service.get_app(app.id).await.unwrap();
    assert_eq!(app.status, AppStatus::Running);
    assert_eq!(app.current_image_tag, done.image_tag);
    assert_eq!(h.runtime.running_count(), 1);
}

#[tokio::test]
async fn test_dockerfile_synthesis_for_python() {
    let h = setup_with(BuilderConfig {
        cleanup_on_finish: false,
        ..Default::default()
    });
    let app = h
        .service
        .create_app("Py", "py", Uuid::new_v4())
        .await
        .unwrap();
    let archive = gzip_tar(&[
        ("requirements.txt", "flask==3.0\n"),
        ("app.py", "print('hello')\n"),
    ]);

    let build = h
        .service
        .submit_archive_build(app.id, archive)
        .await
        .unwrap();
    let done = wait_for_terminal(&h, build.id).await;
    assert_eq!(done.status, BuildStatus::Succeeded);

    // The scratch directory still holds the synthesized Dockerfile.
    let short = build.id.simple().to_string()[..8].to_string();
    let scratch = h
        .dir
        .path()
        .join("work")
        .join(format!("nanopaas-build-{}", short));
    let dockerfile = std::fs::read_to_string(scratch.join("Dockerfile")).unwrap();
    assert!(dockerfile.starts_with("FROM python"));
    assert!(dockerfile.contains("USER appuser"));
    assert!(dockerfile.contains("-u 1000"));
    assert!(dockerfile.contains("EXPOSE 8080"));
}

#[tokio::test]
async fn test_build_without_descriptor_fails() {
    let h = setup();
    let app = h
        .service
        .create_app("Mystery", "mystery", Uuid::new_v4())
        .await
        .unwrap();
    let archive = gzip_tar(&[("README.md", "no build descriptor here\n")]);

    let build = h
        .service
        .submit_archive_build(app.id, archive)
        .await
        .unwrap();
    let done = wait_for_terminal(&h, build.id).await;

    assert_eq!(done.status, BuildStatus::Failed);
    assert!(done
        .error_message
        .as_deref()
        .unwrap()
        .contains("no Dockerfile found"));
    // A failed build leaves the app where it was.
    let app = h.service.get_app(app.id).await.unwrap();
    assert_eq!(app.status, AppStatus::Created);
    assert!(app.current_image_tag.is_none());
}

#[tokio::test]
async fn test_path_traversal_is_rejected() {
    let h = setup();
    let app = h
        .service
        .create_app("Evil", "evil", Uuid::new_v4())
        .await
        .unwrap();
    let archive = gzip_tar(&[
        ("Dockerfile", "FROM alpine\n"),
        ("../outside.txt", "should never land\n"),
    ]);

    let build = h
        .service
        .submit_archive_build(app.id, archive)
        .await
        .unwrap();
    let done = wait_for_terminal(&h, build.id).await;

    assert_eq!(done.status, BuildStatus::Failed);
    assert!(done
        .error_message
        .as_deref()
        .unwrap()
        .contains("escapes the build directory"));
    assert!(!h.dir.path().join("outside.txt").exists());
    assert_eq!(h.runtime.build_requests().len(), 0);
}

#[tokio::test]
async fn test_cancel_running_build_skips_callbacks() {
    let h = setup();
    h.runtime.set_build_delay(Duration::from_secs(30));
    let app = h
        .service
        .create_app("Slow", "slow", Uuid::new_v4())
        .await
        .unwrap();
    let archive = gzip_tar(&[("Dockerfile", "FROM alpine\n")]);

    let build = h
        .service
        .submit_archive_build(app.id, archive)
        .await
        .unwrap();
    wait_for_status(&h, build.id, BuildStatus::Running).await;

    assert!(h.service.cancel_build(build.id).await.unwrap());
    let done = wait_for_terminal(&h, build.id).await;
    assert_eq!(done.status, BuildStatus::Cancelled);
    assert!(done.completed_at.is_some());

    // No deploy fired and the app image never changed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let app = h.service.get_app(app.id).await.unwrap();
    assert!(app.current_image_tag.is_none());
    assert_ne!(app.status, AppStatus::Running);
    assert_eq!(h.runtime.running_count(), 0);
    assert!(h.service.deployments_for_app(app.id).await.is_empty());
}

#[tokio::test]
async fn test_cancel_unknown_build_is_not_found() {
    let h = setup();
    let err = h.service.cancel_build(Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn test_queue_full_fails_fast() {
    let h = setup_with(BuilderConfig {
        worker_count: 1,
        queue_capacity: 1,
        ..Default::default()
    });
    h.runtime.set_build_delay(Duration::from_secs(30));
    let app = h
        .service
        .create_app("Busy", "busy", Uuid::new_v4())
        .await
        .unwrap();
    let archive = gzip_tar(&[("Dockerfile", "FROM alpine\n")]);

    // First build occupies the single worker.
    let first = h
        .service
        .submit_archive_build(app.id, archive.clone())
        .await
        .unwrap();
    wait_for_status(&h, first.id, BuildStatus::Running).await;

    // Second build sits in the queue.
    h.service
        .submit_archive_build(app.id, archive.clone())
        .await
        .unwrap();
    assert_eq!(h.service.build_queue_length(), 1);

    // Third is refused immediately.
    let err = h
        .service
        .submit_archive_build(app.id, archive)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::QueueFull);

    assert_eq!(h.service.active_build_count().await, 2);
}

#[tokio::test]
async fn test_url_source_is_an_explicit_failure() {
    let dir = tempfile::tempdir().unwrap();
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime::new());
    let builds = Arc::new(BuildStore::new());
    let engine = BuildEngine::new(
        BuilderConfig {
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        },
        runtime,
        Arc::clone(&builds),
    );

    let mut build = Build::new(Uuid::new_v4(), BuildSource::Url);
    build.source_url = Some("https://example.com/src.tar.gz".to_string());
    let build_id = build.id;
    builds.insert(build).await;

    let quiet: LogCallback = Arc::new(|_| {});
    let (tx, rx) = tokio::sync::oneshot::channel();
    let job = BuildJob::new(
        build_id,
        "urly",
        8080,
        SourceInput::Url("https://example.com/src.tar.gz".to_string()),
        quiet,
    )
    .with_result_channel(tx);

    engine.submit(job).await.unwrap();
    let outcome = rx.await.unwrap();
    let err = outcome.error.unwrap();
    assert_eq!(err.kind, ErrorKind::SourceFetchFailed);
    assert!(err.message.contains("not implemented"));
    assert_eq!(
        builds.get(build_id).await.unwrap().status,
        BuildStatus::Failed
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn test_image_tags_are_deterministic_per_build() {
    let h = setup();
    let app = h
        .service
        .create_app("API", "api", Uuid::new_v4())
        .await
        .unwrap();
    let archive = gzip_tar(&[("Dockerfile", "FROM alpine\n")]);

    let one = h
        .service
        .submit_archive_build(app.id, archive.clone())
        .await
        .unwrap();
    let one = wait_for_terminal(&h, one.id).await;
    let two = h
        .service
        .submit_archive_build(app.id, archive)
        .await
        .unwrap();
    let two = wait_for_terminal(&h, two.id).await;

    let tag_one = one.image_tag.unwrap();
    let tag_two = two.image_tag.unwrap();
    assert_ne!(tag_one, tag_two);
    assert!(tag_one.starts_with("nanopaas/api:"));
    assert!(tag_one.ends_with(&one.id.simple().to_string()[..8]));
    assert!(tag_two.ends_with(&two.id.simple().to_string()[..8]));
}

#[tokio::test]
async fn test_concurrent_subscribers_see_same_build_log() {
    let h = setup();
    h.runtime.set_build_delay(Duration::from_millis(400));
    let app = h
        .service
        .create_app("API", "api", Uuid::new_v4())
        .await
        .unwrap();
    let archive = gzip_tar(&[("Dockerfile", "FROM alpine\n")]);

    let build = h
        .service
        .submit_archive_build(app.id, archive)
        .await
        .unwrap();
    let mut a = h.service.subscribe_build_logs(build.id).await.unwrap();
    let mut b = h.service.subscribe_build_logs(build.id).await.unwrap();

    wait_for_terminal(&h, build.id).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut lines_a = Vec::new();
    while let Ok(msg) = a.receiver.try_recv() {
        lines_a.push(msg.payload);
    }
    let mut lines_b = Vec::new();
    while let Ok(msg) = b.receiver.try_recv() {
        lines_b.push(msg.payload);
    }

    assert!(!lines_a.is_empty());
    assert_eq!(lines_a, lines_b);
    assert!(lines_a.iter().any(|l| l.contains("[NanoPaaS]")));
}

#[tokio::test]
async fn test_repo_build_records_source() {
    let h = setup();
    let app = h
        .service
        .create_app("Git", "git-app", Uuid::new_v4())
        .await
        .unwrap();

    // The clone fails in this environment; what matters is the record and
    // the terminal failure path.
    let build = h
        .service
        .submit_repo_build(
            app.id,
            "https://invalid.invalid/nope.git",
            Some("main".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(build.source, BuildSource::Repository);
    assert_eq!(
        build.source_url.as_deref(),
        Some("https://invalid.invalid/nope.git")
    );
    assert_eq!(build.git_ref.as_deref(), Some("main"));

    let done = wait_for_terminal(&h, build.id).await;
    assert_eq!(done.status, BuildStatus::Failed);
    assert!(done.error_message.is_some());
}
