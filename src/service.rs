//! Public core operations
//!
//! The facade the HTTP layer drives: application CRUD, build submission,
//! deploy/scale/stop/restart, and log subscriptions. Deploy-class
//! operations for one application are serialized through an app-keyed
//! mutex; operations on distinct apps proceed concurrently.

use crate::builder::{BuildEngine, BuildJob, SourceInput, SuccessCallback};
use crate::domain::{App, AppStatus, Build, BuildSource, Deployment, MAX_REPLICAS};
use crate::error::{PaasError, Result};
use crate::hub::{LogHub, SubscriberHandle};
use crate::logs::{app_topic, build_topic, LogStreamer};
use crate::orchestrator::Orchestrator;
use crate::router::TraefikRouter;
use crate::runtime::{ContainerRuntime, LogCallback};
use crate::store::{AppStore, BuildStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Partial update for mutable application fields. The slug is immutable.
#[derive(Debug, Default, Clone)]
pub struct AppUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub target_replicas: Option<usize>,
    pub memory_limit: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub ports: Option<Vec<u16>>,
    pub subdomain: Option<String>,
}

/// Per-application mutexes so deploy-class operations never interleave for
/// the same app.
#[derive(Default)]
struct AppLocks {
    locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl AppLocks {
    fn get(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct PaasService {
    apps: Arc<AppStore>,
    builds: Arc<BuildStore>,
    engine: Arc<BuildEngine>,
    orchestrator: Arc<Orchestrator>,
    router: Arc<TraefikRouter>,
    hub: LogHub,
    runtime: Arc<dyn ContainerRuntime>,

    locks: Arc<AppLocks>,
    app_streams: Arc<StdMutex<HashMap<Uuid, CancellationToken>>>,
}

impl PaasService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        apps: Arc<AppStore>,
        builds: Arc<BuildStore>,
        engine: Arc<BuildEngine>,
        orchestrator: Arc<Orchestrator>,
        router: Arc<TraefikRouter>,
        hub: LogHub,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Arc<Self> {
        Arc::new(Self {
            apps,
            builds,
            engine,
            orchestrator,
            router,
            hub,
            runtime,
            locks: Arc::new(AppLocks::default()),
            app_streams: Arc::new(StdMutex::new(HashMap::new())),
        })
    }

    // ------------------------------------------------------------------
    // Applications
    // ------------------------------------------------------------------

    pub async fn create_app(
        &self,
        name: impl Into<String>,
        slug: impl Into<String>,
        owner_id: Uuid,
    ) -> Result<App> {
        let app = App::new(name, slug, owner_id)?;
        self.apps.insert(app.clone()).await?;
        info!(app_id = %app.id, slug = %app.slug, "App created");
        Ok(app)
    }

    pub async fn get_app(&self, id: Uuid) -> Result<App> {
        self.apps
            .get(id)
            .await
            .ok_or_else(|| PaasError::not_found(format!("app {} not found", id)))
    }

    pub async fn get_app_by_slug(&self, slug: &str) -> Result<App> {
        self.apps
            .get_by_slug(slug)
            .await
            .ok_or_else(|| PaasError::not_found(format!("app '{}' not found", slug)))
    }

    pub async fn list_apps(&self) -> Vec<App> {
        self.apps.list().await
    }

    pub async fn update_app(&self, id: Uuid, update: AppUpdate) -> Result<App> {
        if let Some(target) = update.target_replicas {
            if target > MAX_REPLICAS {
                return Err(PaasError::invalid_argument(format!(
                    "replica count must be between 0 and {}, got {}",
                    MAX_REPLICAS, target
                )));
            }
        }
        if let Some(ports) = &update.ports {
            if ports.is_empty() {
                return Err(PaasError::invalid_argument(
                    "an app needs at least its primary port",
                ));
            }
        }
        self.apps
            .update(id, |app| {
                if let Some(name) = update.name {
                    app.name = name;
                }
                if let Some(description) = update.description {
                    app.description = description;
                }
                if let Some(target) = update.target_replicas {
                    app.target_replicas = target;
                }
                if let Some(memory_limit) = update.memory_limit {
                    app.memory_limit = memory_limit;
                }
                if let Some(cpu_quota) = update.cpu_quota {
                    app.cpu_quota = cpu_quota;
                }
                if let Some(ports) = update.ports {
                    app.ports = ports;
                }
                if let Some(subdomain) = update.subdomain {
                    app.subdomain = subdomain;
                }
                app.updated_at = chrono::Utc::now();
                app.clone()
            })
            .await
    }

    /// Stop the app's replicas, drop its route, delete the record.
    pub async fn delete_app(&self, id: Uuid) -> Result<()> {
        let lock = self.locks.get(id);
        let _guard = lock.lock().await;

        let mut app = self.get_app(id).await?;
        self.orchestrator.stop(&mut app).await?;
        if let Some(token) = self.app_streams.lock().unwrap().remove(&id) {
            token.cancel();
        }
        self.apps.remove(id).await?;
        info!(app_id = %id, slug = %app.slug, "App deleted");
        Ok(())
    }

    pub async fn set_env(&self, id: Uuid, key: &str, value: &str) -> Result<App> {
        self.apps
            .update(id, |app| {
                app.set_env(key, value);
                app.clone()
            })
            .await
    }

    pub async fn delete_env(&self, id: Uuid, key: &str) -> Result<App> {
        self.apps
            .update(id, |app| {
                app.delete_env(key);
                app.clone()
            })
            .await
    }

    pub fn app_url(&self, app: &App) -> String {
        self.router.app_url(app)
    }

    // ------------------------------------------------------------------
    // Deploy / scale / stop / restart
    // ------------------------------------------------------------------

    /// Deploy the app, optionally adopting a new image tag and replica
    /// count first.
    pub async fn deploy(
        &self,
        app_id: Uuid,
        image_tag: Option<String>,
        replicas: Option<usize>,
    ) -> Result<Deployment> {
        deploy_app(
            &self.locks,
            &self.apps,
            &self.orchestrator,
            app_id,
            image_tag,
            replicas,
        )
        .await
    }

    pub async fn scale(&self, app_id: Uuid, replicas: usize) -> Result<()> {
        let lock = self.locks.get(app_id);
        let _guard = lock.lock().await;

        let mut app = self.get_app(app_id).await?;
        let result = self.orchestrator.scale(&mut app, replicas).await;
        self.apps.put(app).await;
        result
    }

    pub async fn restart(&self, app_id: Uuid) -> Result<()> {
        let lock = self.locks.get(app_id);
        let _guard = lock.lock().await;

        let app = self.get_app(app_id).await?;
        self.orchestrator.restart(&app).await
    }

    pub async fn stop(&self, app_id: Uuid) -> Result<()> {
        let lock = self.locks.get(app_id);
        let _guard = lock.lock().await;

        let mut app = self.get_app(app_id).await?;
        let result = self.orchestrator.stop(&mut app).await;
        self.apps.put(app).await;
        result
    }

    pub async fn deployment(&self, id: Uuid) -> Result<Deployment> {
        self.orchestrator
            .deployment(id)
            .await
            .ok_or_else(|| PaasError::not_found(format!("deployment {} not found", id)))
    }

    pub async fn deployments_for_app(&self, app_id: Uuid) -> Vec<Deployment> {
        self.orchestrator.deployments_for_app(app_id).await
    }

    // ------------------------------------------------------------------
    // Builds
    // ------------------------------------------------------------------

    /// Submit a gzipped tar archive build. On success the app is deployed
    /// on the new image.
    pub async fn submit_archive_build(&self, app_id: Uuid, archive: Vec<u8>) -> Result<Build> {
        let app = self.get_app(app_id).await?;
        let build = Build::new(app_id, BuildSource::Archive);
        self.enqueue_build(app, build, SourceInput::Archive(archive))
            .await
    }

    /// Submit a git repository build at an optional ref.
    pub async fn submit_repo_build(
        &self,
        app_id: Uuid,
        url: impl Into<String>,
        reference: Option<String>,
    ) -> Result<Build> {
        let app = self.get_app(app_id).await?;
        let url = url.into();
        let mut build = Build::new(app_id, BuildSource::Repository);
        build.source_url = Some(url.clone());
        build.git_ref = reference.clone();
        self.enqueue_build(app, build, SourceInput::Repository { url, reference })
            .await
    }

    async fn enqueue_build(&self, app: App, build: Build, source: SourceInput) -> Result<Build> {
        let build_id = build.id;
        let app_id = app.id;
        self.builds.insert(build.clone()).await;

        let topic = build_topic(build_id);
        let hub = self.hub.clone();
        let on_log: LogCallback = Arc::new(move |chunk: &str| {
            let line = chunk.trim_end();
            if !line.is_empty() {
                hub.try_publish(&topic, line);
            }
        });

        // On success, leave the building state, swap the app to the new
        // image and deploy it.
        let prior_status = app.status;
        let locks = Arc::clone(&self.locks);
        let apps = Arc::clone(&self.apps);
        let orchestrator = Arc::clone(&self.orchestrator);
        let on_success: SuccessCallback = Box::new(move |_image_id, image_tag| {
            tokio::spawn(async move {
                info!(app_id = %app_id, image = %image_tag, "Build succeeded, deploying");
                let _ = apps
                    .update(app_id, |a| {
                        if a.status == AppStatus::Building {
                            a.status = prior_status;
                            a.updated_at = chrono::Utc::now();
                        }
                    })
                    .await;
                if let Err(err) =
                    deploy_app(&locks, &apps, &orchestrator, app_id, Some(image_tag), None).await
                {
                    error!(app_id = %app_id, error = %err, "Deployment after build failed");
                }
            });
        });

        let (result_tx, result_rx) = oneshot::channel();
        let job = BuildJob::new(
            build_id,
            app.slug.clone(),
            app.primary_port(),
            source,
            on_log,
        )
        .with_result_channel(result_tx)
        .with_on_success(on_success);

        // Mark the app building before the job can run; a failed or
        // cancelled build puts the previous status back so the app record
        // stays truthful.
        let _ = self.apps.update(app_id, |a| a.mark_building()).await;

        if let Err(err) = self.engine.submit(job).await {
            // Submission never happened; leave no trace of the build.
            self.builds.remove(build_id).await;
            let _ = self
                .apps
                .update(app_id, |a| {
                    if a.status == AppStatus::Building {
                        a.status = prior_status;
                        a.updated_at = chrono::Utc::now();
                    }
                })
                .await;
            return Err(err);
        }

        let apps = Arc::clone(&self.apps);
        tokio::spawn(async move {
            if let Ok(outcome) = result_rx.await {
                if outcome.error.is_some() {
                    let _ = apps
                        .update(app_id, |a| {
                            if a.status == AppStatus::Building {
                                a.status = prior_status;
                                a.updated_at = chrono::Utc::now();
                            }
                        })
                        .await;
                }
            }
        });

        self.builds
            .get(build_id)
            .await
            .ok_or_else(|| PaasError::not_found(format!("build {} not found", build_id)))
    }

    pub async fn get_build(&self, id: Uuid) -> Result<Build> {
        self.builds
            .get(id)
            .await
            .ok_or_else(|| PaasError::not_found(format!("build {} not found", id)))
    }

    pub async fn builds_for_app(&self, app_id: Uuid) -> Vec<Build> {
        self.builds.list_for_app(app_id).await
    }

    /// Cancel a queued or running build. Returns false when the build had
    /// already finished.
    pub async fn cancel_build(&self, id: Uuid) -> Result<bool> {
        self.get_build(id).await?;
        Ok(self.engine.cancel_build(id).await)
    }

    pub async fn active_build_count(&self) -> usize {
        self.engine.active_count().await
    }

    pub fn build_queue_length(&self) -> usize {
        self.engine.queue_length()
    }

    // ------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------

    /// Subscribe to a build's output topic.
    pub async fn subscribe_build_logs(&self, build_id: Uuid) -> Result<SubscriberHandle> {
        self.get_build(build_id).await?;
        let handle = self
            .hub
            .register()
            .await
            .ok_or_else(|| PaasError::runtime("log hub is stopped"))?;
        self.hub.subscribe(handle.id, build_topic(build_id)).await;
        Ok(handle)
    }

    /// Subscribe to an app's aggregated container output, starting the
    /// label-filtered fan-in task when it is not already running.
    pub async fn subscribe_app_logs(&self, app_id: Uuid) -> Result<SubscriberHandle> {
        self.get_app(app_id).await?;
        self.ensure_app_stream(app_id);

        let handle = self
            .hub
            .register()
            .await
            .ok_or_else(|| PaasError::runtime("log hub is stopped"))?;
        self.hub.subscribe(handle.id, app_topic(app_id)).await;
        Ok(handle)
    }

    /// Last `tail` lines across all of an app's replicas.
    pub async fn recent_app_logs(&self, app_id: Uuid, tail: u32) -> Result<Vec<String>> {
        self.get_app(app_id).await?;
        let streamer = LogStreamer::new(Arc::clone(&self.runtime), self.hub.clone());
        streamer.recent_logs(app_id, tail).await
    }

    fn ensure_app_stream(&self, app_id: Uuid) {
        let token = {
            let mut streams = self.app_streams.lock().unwrap();
            if streams.contains_key(&app_id) {
                return;
            }
            let token = CancellationToken::new();
            streams.insert(app_id, token.clone());
            token
        };

        let streams = Arc::clone(&self.app_streams);
        let streamer = LogStreamer::new(Arc::clone(&self.runtime), self.hub.clone());
        tokio::spawn(async move {
            if let Err(err) = streamer.stream_app_logs(app_id, token).await {
                warn!(app_id = %app_id, error = %err, "App log streaming failed");
            }
            streams.lock().unwrap().remove(&app_id);
        });
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Ordered shutdown: stop taking builds and drain the pool, then close
    /// the hub, then stop the orchestrator's background work.
    pub async fn shutdown(&self) {
        for token in self.app_streams.lock().unwrap().values() {
            token.cancel();
        }
        self.engine.shutdown().await;
        self.hub.stop().await;
        self.orchestrator.shutdown().await;
    }
}

/// The deploy pipeline, shared between the public operation and the
/// build-success callback. Holds the app's mutex for the whole swap and
/// persists whatever state the orchestrator settled on, including after a
/// rollback.
async fn deploy_app(
    locks: &AppLocks,
    apps: &AppStore,
    orchestrator: &Orchestrator,
    app_id: Uuid,
    image_tag: Option<String>,
    replicas: Option<usize>,
) -> Result<Deployment> {
    let lock = locks.get(app_id);
    let _guard = lock.lock().await;

    let mut app = apps
        .get(app_id)
        .await
        .ok_or_else(|| PaasError::not_found(format!("app {} not found", app_id)))?;

    if let Some(replicas) = replicas {
        if replicas == 0 || replicas > MAX_REPLICAS {
            return Err(PaasError::invalid_argument(format!(
                "deploy replica count must be between 1 and {}, got {}",
                MAX_REPLICAS, replicas
            )));
        }
        app.target_replicas = replicas;
    }
    if let Some(tag) = image_tag {
        if app.current_image_tag.as_deref() != Some(tag.as_str()) {
            app.update_image(tag);
        }
    }

    let result = orchestrator.deploy(&mut app).await;
    apps.put(app).await;
    result
}
