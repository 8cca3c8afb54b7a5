//! Deployment state machine and replica management
//!
//! The orchestrator exclusively owns the app -> container tracking map and
//! the deployment registry. Deploy tears the old replica set down, creates
//! the new one, and rolls back to the previous image when anything fails.
//! Scale-up is additive, scale-down trims trailing replicas. After every
//! replica-set change the router configurator is handed the fresh endpoint
//! list, with each replica's address resolved on the shared bridge network.
//!
//! Per-app serialization of deploy/scale/stop/restart is the caller's
//! responsibility; distinct apps may proceed concurrently.

use crate::config::OrchestratorConfig;
use crate::domain::{App, Deployment, MAX_REPLICAS};
use crate::error::{PaasError, Result};
use crate::router::{Endpoint, TraefikRouter};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, APP_ID_LABEL, APP_SLUG_LABEL, DEPLOYMENT_ID_LABEL,
    REPLICA_LABEL,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Timeout for the runtime-level restart issued on an unhealthy replica.
const UNHEALTHY_RESTART_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Orchestrator {
    config: OrchestratorConfig,
    container_prefix: String,
    network: String,
    runtime: Arc<dyn ContainerRuntime>,
    router: Arc<TraefikRouter>,

    /// app id -> container ids, in replica order
    containers: RwLock<HashMap<Uuid, Vec<String>>>,
    deployments: RwLock<HashMap<Uuid, Deployment>>,

    shutdown: CancellationToken,
    health_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Create the orchestrator and start its health monitor.
    pub fn new(
        config: OrchestratorConfig,
        container_prefix: impl Into<String>,
        network: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
        router: Arc<TraefikRouter>,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            config,
            container_prefix: container_prefix.into(),
            network: network.into(),
            runtime,
            router,
            containers: RwLock::new(HashMap::new()),
            deployments: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            health_task: StdMutex::new(None),
        });

        let monitor = Arc::clone(&orchestrator);
        let handle = tokio::spawn(async move {
            monitor.health_loop().await;
        });
        *orchestrator.health_task.lock().unwrap() = Some(handle);

        info!(
            health_check_interval_secs = orchestrator.config.health_check_interval_secs,
            "Orchestrator started"
        );
        orchestrator
    }

    /// Swap the application to its current image at its target replica
    /// count. On failure the previous image is restored when one exists.
    pub async fn deploy(&self, app: &mut App) -> Result<Deployment> {
        if !app.can_deploy() {
            return Err(PaasError::invalid_argument(format!(
                "app is not in a deployable state: {}",
                app.status
            )));
        }
        let image = app
            .current_image_tag
            .clone()
            .ok_or_else(|| PaasError::invalid_argument("no image available for deployment"))?;

        let mut deployment = Deployment::new(app.id, &image, app.target_replicas);
        deployment.previous_image_tag = app.previous_image_tag.clone();

        info!(
            deployment_id = %deployment.id,
            app_id = %app.id,
            image = %image,
            replicas = app.target_replicas,
            "Starting deployment"
        );

        app.mark_deploying();
        deployment.start();
        self.record(&deployment).await;

        // Old replica set goes down first; individual failures are logged
        // but do not abort the deployment.
        self.teardown_tracked(app.id).await;

        let target = app.target_replicas;
        let result = match tokio::time::timeout(
            self.config.deployment_timeout(),
            self.start_replicas(app, &image, &mut deployment, 0, target),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PaasError::timeout("deployment deadline exceeded")),
        };

        match result {
            Ok(ids) => {
                let count = ids.len();
                self.track(app.id, ids.clone()).await;
                deployment.succeed(ids);
                app.replicas = count;
                app.mark_running();
                self.record(&deployment).await;
                self.refresh_route(app).await;
                info!(
                    deployment_id = %deployment.id,
                    app_id = %app.id,
                    replicas = count,
                    "Deployment succeeded"
                );
                Ok(deployment)
            }
            Err(err) => {
                deployment.fail(&err.message);
                app.mark_failed();
                self.untrack(app.id).await;
                app.replicas = 0;
                warn!(
                    deployment_id = %deployment.id,
                    app_id = %app.id,
                    error = %err,
                    "Deployment failed"
                );

                if app.previous_image_tag.is_some() {
                    let rollback_result = self.rollback(app, &mut deployment, &err).await;
                    self.record(&deployment).await;
                    rollback_result?;
                } else {
                    self.record(&deployment).await;
                    self.router.remove_route(app.id).await.ok();
                }
                Err(err)
            }
        }
    }

    /// Re-deploy the previous image after a failed deployment.
    async fn rollback(
        &self,
        app: &mut App,
        deployment: &mut Deployment,
        cause: &PaasError,
    ) -> Result<()> {
        // Swap back; previous_image_tag now holds the bad image.
        app.rollback_image();
        let image = app
            .current_image_tag
            .clone()
            .expect("rollback requires a previous image");

        info!(app_id = %app.id, image = %image, "Attempting rollback");

        let target = app.target_replicas;
        match self
            .start_replicas(app, &image, deployment, 0, target)
            .await
        {
            Ok(ids) => {
                let count = ids.len();
                self.track(app.id, ids).await;
                app.replicas = count;
                app.mark_running();
                deployment.rollback_reason = Some(format!(
                    "rolled back to previous image after failed deployment: {}",
                    cause.message
                ));
                self.refresh_route(app).await;
                info!(app_id = %app.id, replicas = count, "Rollback succeeded");
                Ok(())
            }
            Err(rollback_err) => {
                deployment.mark_rolled_back(format!("rollback failed: {}", rollback_err.message));
                self.untrack(app.id).await;
                app.replicas = 0;
                self.router.remove_route(app.id).await.ok();
                warn!(app_id = %app.id, error = %rollback_err, "Rollback failed");
                Err(PaasError::rollback_failed(format!(
                    "rollback failed: {}",
                    rollback_err.message
                )))
            }
        }
    }

    /// Adjust the replica count. Scale-up is additive: replicas created
    /// before a failure stay running and the error is surfaced for the
    /// caller to retry. Scale-down trims the highest replica indices first.
    pub async fn scale(&self, app: &mut App, target: usize) -> Result<()> {
        if target > MAX_REPLICAS {
            return Err(PaasError::invalid_argument(format!(
                "replica count must be between 0 and {}, got {}",
                MAX_REPLICAS, target
            )));
        }
        if target > 0 && app.current_image_tag.is_none() {
            return Err(PaasError::invalid_argument(
                "cannot scale an app with no image; build or deploy first",
            ));
        }

        let current = self.tracked(app.id).await;
        info!(
            app_id = %app.id,
            current = current.len(),
            target,
            "Scaling app"
        );

        if target == current.len() {
            app.target_replicas = target;
            return Ok(());
        }
        app.target_replicas = target;

        if target > current.len() {
            self.scale_up(app, current.len(), target).await?;
        } else {
            self.scale_down(app, current, target).await;
        }

        app.replicas = target;
        if target > 0 {
            app.mark_running();
            self.refresh_route(app).await;
        } else {
            app.mark_stopped();
            self.router.remove_route(app.id).await.ok();
        }
        Ok(())
    }

    async fn scale_up(&self, app: &mut App, from: usize, to: usize) -> Result<()> {
        let image = app
            .current_image_tag
            .clone()
            .expect("scale_up requires an image");

        for replica in from..to {
            let name = app.container_name(&self.container_prefix, replica);
            self.remove_residue(&name).await;

            let spec = self.replica_spec(app, &image, None, replica, &name);
            let id = match self.runtime.create_container(&spec).await {
                Ok(id) => id,
                Err(err) => {
                    self.settle_partial_scale(app).await;
                    return Err(PaasError::runtime(format!(
                        "failed to create replica {}: {}",
                        replica, err.message
                    )));
                }
            };
            if let Err(err) = self.runtime.start_container(&id).await {
                let _ = self.runtime.remove_container(&id, true).await;
                self.settle_partial_scale(app).await;
                return Err(PaasError::runtime(format!(
                    "failed to start replica {}: {}",
                    replica, err.message
                )));
            }

            self.containers
                .write()
                .await
                .entry(app.id)
                .or_default()
                .push(id);
            debug!(app_id = %app.id, replica, "Scaled up replica");
        }
        Ok(())
    }

    /// A failed scale-up leaves the new replicas it managed to start. Bring
    /// the app record and route table in line with what actually runs.
    async fn settle_partial_scale(&self, app: &mut App) {
        let running = self.tracked(app.id).await.len();
        app.replicas = running;
        if running > 0 {
            self.refresh_route(app).await;
        }
    }

    async fn scale_down(&self, app: &mut App, current: Vec<String>, target: usize) {
        let to_remove = &current[target..];
        for id in to_remove {
            if let Err(err) = self
                .runtime
                .stop_container(id, self.config.stop_timeout())
                .await
            {
                warn!(app_id = %app.id, error = %err, "Failed to stop replica during scale down");
            }
            if let Err(err) = self.runtime.remove_container(id, true).await {
                warn!(app_id = %app.id, error = %err, "Failed to remove replica during scale down");
            }
            debug!(app_id = %app.id, container_id = %id, "Scaled down replica");
        }
        self.containers
            .write()
            .await
            .insert(app.id, current[..target].to_vec());
    }

    /// Stop and remove every replica; the app ends at zero replicas.
    pub async fn stop(&self, app: &mut App) -> Result<()> {
        self.teardown_tracked(app.id).await;
        app.replicas = 0;
        app.mark_stopped();
        self.router.remove_route(app.id).await.ok();
        info!(app_id = %app.id, "App stopped");
        Ok(())
    }

    /// Restart every replica in place. Individual failures are logged and
    /// do not change app state.
    pub async fn restart(&self, app: &App) -> Result<()> {
        for id in self.tracked(app.id).await {
            if let Err(err) = self
                .runtime
                .restart_container(&id, self.config.stop_timeout())
                .await
            {
                warn!(app_id = %app.id, container_id = %id, error = %err, "Failed to restart replica");
            }
        }
        info!(app_id = %app.id, "App restarted");
        Ok(())
    }

    /// Container ids tracked for an app, in replica order.
    pub async fn tracked(&self, app_id: Uuid) -> Vec<String> {
        self.containers
            .read()
            .await
            .get(&app_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn deployment(&self, id: Uuid) -> Option<Deployment> {
        self.deployments.read().await.get(&id).cloned()
    }

    pub async fn deployments_for_app(&self, app_id: Uuid) -> Vec<Deployment> {
        let mut list: Vec<Deployment> = self
            .deployments
            .read()
            .await
            .values()
            .filter(|d| d.app_id == app_id)
            .cloned()
            .collect();
        list.sort_by_key(|d| d.created_at);
        list
    }

    /// Stop the health monitor.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.shutdown.cancel();
        let handle = self.health_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Orchestrator stopped");
    }

    async fn start_replicas(
        &self,
        app: &App,
        image: &str,
        deployment: &mut Deployment,
        from: usize,
        to: usize,
    ) -> Result<Vec<String>> {
        let mut created: Vec<String> = Vec::new();

        for replica in from..to {
            let name = app.container_name(&self.container_prefix, replica);
            self.remove_residue(&name).await;

            let spec = self.replica_spec(app, image, Some(deployment.id), replica, &name);
            let id = match self.runtime.create_container(&spec).await {
                Ok(id) => id,
                Err(err) => {
                    self.remove_all(&created).await;
                    return Err(PaasError::runtime(format!(
                        "failed to create replica {} ({}): {}",
                        replica, name, err.message
                    )));
                }
            };

            if let Err(err) = self.runtime.start_container(&id).await {
                let _ = self.runtime.remove_container(&id, true).await;
                self.remove_all(&created).await;
                return Err(PaasError::runtime(format!(
                    "failed to start replica {} ({}): {}",
                    replica, name, err.message
                )));
            }

            deployment.add_container(id.clone());
            debug!(container_id = %id, name = %name, replica, "Replica started");
            created.push(id);
        }

        Ok(created)
    }

    fn replica_spec(
        &self,
        app: &App,
        image: &str,
        deployment_id: Option<Uuid>,
        replica: usize,
        name: &str,
    ) -> ContainerSpec {
        let mut spec = ContainerSpec::new(name, image);
        spec.env = app.env_slice();
        spec.ports = app.ports.clone();
        spec.memory_limit = app.memory_limit;
        spec.cpu_quota = app.cpu_quota;
        spec.network = Some(self.network.clone());
        spec.labels = self.labels(app, deployment_id, replica);
        spec
    }

    fn labels(
        &self,
        app: &App,
        deployment_id: Option<Uuid>,
        replica: usize,
    ) -> HashMap<String, String> {
        let mut labels = HashMap::from([
            (APP_ID_LABEL.to_string(), app.id.to_string()),
            (APP_SLUG_LABEL.to_string(), app.slug.clone()),
            (REPLICA_LABEL.to_string(), replica.to_string()),
            ("traefik.enable".to_string(), "true".to_string()),
            (
                format!("traefik.http.routers.{}.rule", app.slug),
                format!("Host(`{}`)", self.router.app_host(app)),
            ),
            (
                format!("traefik.http.services.{}.loadbalancer.server.port", app.slug),
                app.primary_port().to_string(),
            ),
        ]);
        if let Some(deployment_id) = deployment_id {
            labels.insert(DEPLOYMENT_ID_LABEL.to_string(), deployment_id.to_string());
        }
        labels
    }

    /// Force-remove any leftover container holding a name we are about to
    /// use. Residue from prior runs would otherwise fail the create.
    async fn remove_residue(&self, name: &str) {
        let listed = self
            .runtime
            .list_containers(true, Some(&self.container_prefix))
            .await
            .unwrap_or_default();
        for container in listed {
            if container.name == name {
                info!(name = %name, id = %container.id, "Removing leftover container with same name");
                if let Err(err) = self.runtime.remove_container(&container.id, true).await {
                    warn!(name = %name, error = %err, "Failed to remove leftover container");
                }
            }
        }
    }

    async fn remove_all(&self, ids: &[String]) {
        for id in ids {
            if let Err(err) = self.runtime.remove_container(id, true).await {
                warn!(container_id = %id, error = %err, "Failed to remove container during teardown");
            }
        }
    }

    /// Stop and remove everything tracked for an app. Best effort.
    async fn teardown_tracked(&self, app_id: Uuid) {
        let ids = self.tracked(app_id).await;
        for id in &ids {
            if let Err(err) = self
                .runtime
                .stop_container(id, self.config.stop_timeout())
                .await
            {
                warn!(app_id = %app_id, container_id = %id, error = %err, "Failed to stop container");
            }
            if let Err(err) = self.runtime.remove_container(id, true).await {
                warn!(app_id = %app_id, container_id = %id, error = %err, "Failed to remove container");
            }
        }
        self.untrack(app_id).await;
    }

    async fn track(&self, app_id: Uuid, ids: Vec<String>) {
        self.containers.write().await.insert(app_id, ids);
    }

    async fn untrack(&self, app_id: Uuid) {
        self.containers.write().await.remove(&app_id);
    }

    async fn record(&self, deployment: &Deployment) {
        self.deployments
            .write()
            .await
            .insert(deployment.id, deployment.clone());
    }

    /// Hand the router the live endpoint list, resolving each replica's
    /// address on the shared bridge network.
    async fn refresh_route(&self, app: &App) {
        let ids = self.tracked(app.id).await;
        let mut endpoints = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.runtime.inspect_container(id).await {
                Ok(details) => {
                    let ip = details
                        .ip_addresses
                        .get(&self.network)
                        .cloned()
                        .or_else(|| details.ip_addresses.values().next().cloned())
                        // No address yet: the proxy will fail its health
                        // check until the next refresh.
                        .unwrap_or_else(|| "127.0.0.1".to_string());
                    endpoints.push(Endpoint::new(ip, app.primary_port()));
                }
                Err(err) => {
                    warn!(container_id = %id, error = %err, "Failed to resolve replica address");
                }
            }
        }
        if let Err(err) = self.router.add_route(app, endpoints).await {
            warn!(app_id = %app.id, error = %err, "Failed to update route");
        }
    }

    async fn health_loop(&self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.health_check_interval()) => {
                    self.check_health().await;
                }
                _ = self.shutdown.cancelled() => {
                    debug!("Health monitor stopped");
                    break;
                }
            }
        }
    }

    /// One health sweep over every tracked replica. Unhealthy replicas get
    /// a runtime-level restart; app state, tracking and deployment records
    /// are never touched here.
    async fn check_health(&self) {
        let snapshot: HashMap<Uuid, Vec<String>> = self.containers.read().await.clone();
        for (app_id, ids) in snapshot {
            for id in ids {
                match self.runtime.health(&id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(app_id = %app_id, container_id = %id, "Replica unhealthy, restarting");
                        if let Err(err) = self
                            .runtime
                            .restart_container(&id, UNHEALTHY_RESTART_TIMEOUT)
                            .await
                        {
                            warn!(container_id = %id, error = %err, "Failed to restart unhealthy replica");
                        }
                    }
                    Err(err) => {
                        warn!(app_id = %app_id, container_id = %id, error = %err, "Health check failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::runtime::FakeRuntime;

    fn test_setup() -> (Arc<Orchestrator>, Arc<FakeRuntime>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let router = Arc::new(
            TraefikRouter::new(RouterConfig {
                dynamic_config_path: dir.path().join("dynamic.yml"),
                ..Default::default()
            })
            .unwrap(),
        );
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            "nanopaas-",
            "nanopaas",
            runtime.clone(),
            router,
        );
        (orchestrator, runtime, dir)
    }

    fn running_app(slug: &str) -> App {
        let mut app = App::new(slug, slug, Uuid::new_v4()).unwrap();
        app.update_image(format!("nanopaas/{}:11111111", slug));
        app
    }

    #[tokio::test]
    async fn test_labels_carry_identity() {
        let (orchestrator, _runtime, _dir) = test_setup();
        let app = running_app("api");
        let deployment_id = Uuid::new_v4();
        let labels = orchestrator.labels(&app, Some(deployment_id), 2);

        assert_eq!(labels.get(APP_ID_LABEL), Some(&app.id.to_string()));
        assert_eq!(labels.get(APP_SLUG_LABEL), Some(&"api".to_string()));
        assert_eq!(labels.get(REPLICA_LABEL), Some(&"2".to_string()));
        assert_eq!(
            labels.get(DEPLOYMENT_ID_LABEL),
            Some(&deployment_id.to_string())
        );
        assert_eq!(
            labels.get("traefik.http.routers.api.rule"),
            Some(&"Host(`api.localhost`)".to_string())
        );
        assert_eq!(
            labels.get("traefik.http.services.api.loadbalancer.server.port"),
            Some(&"8080".to_string())
        );
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_residue_removed_before_deploy() {
        let (orchestrator, runtime, _dir) = test_setup();

        // A leftover container from a prior run squats on the name.
        let leftover = ContainerSpec::new("nanopaas-api", "old/image:1");
        runtime.create_container(&leftover).await.unwrap();

        let mut app = running_app("api");
        app.target_replicas = 1;
        orchestrator.deploy(&mut app).await.unwrap();

        assert_eq!(runtime.running_count(), 1);
        let names = runtime.container_names();
        assert_eq!(names, vec!["nanopaas-api"]);
        orchestrator.shutdown().await;
    }
}
