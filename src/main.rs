use nanopaas::builder::BuildEngine;
use nanopaas::config::Config;
use nanopaas::docker::DockerRuntime;
use nanopaas::hub::LogHub;
use nanopaas::orchestrator::Orchestrator;
use nanopaas::router::TraefikRouter;
use nanopaas::runtime::ContainerRuntime;
use nanopaas::service::PaasService;
use nanopaas::store::{AppStore, BuildStore};
use nanopaas::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nanopaas=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("nanopaas.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    // An unreachable daemon is fatal: nothing works without it.
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(config.docker.host.as_deref())
            .await
            .map_err(|e| {
                error!(error = %e, "Container runtime unreachable");
                e
            })?,
    );

    runtime
        .ensure_network(&config.docker.default_network)
        .await
        .map_err(|e| anyhow::anyhow!("failed to ensure network: {}", e))?;

    let router = Arc::new(TraefikRouter::new(config.router.clone()).map_err(|e| {
        error!(error = %e, "Dynamic config path unusable");
        e
    })?);

    let hub = LogHub::new();
    let apps = Arc::new(AppStore::new());
    let builds = Arc::new(BuildStore::new());

    let engine = BuildEngine::new(config.builder.clone(), Arc::clone(&runtime), Arc::clone(&builds));

    let orchestrator = Orchestrator::new(
        config.orchestrator.clone(),
        config.docker.container_prefix.clone(),
        config.docker.default_network.clone(),
        Arc::clone(&runtime),
        Arc::clone(&router),
    );

    let service = PaasService::new(
        apps,
        builds,
        engine,
        orchestrator,
        router,
        hub,
        Arc::clone(&runtime),
    );

    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Control plane ready; HTTP layer attaches here"
    );

    wait_for_shutdown_signal().await;

    // Ordered teardown: no new work, drain builds, close the hub, stop the
    // orchestrator's background loops.
    info!("Shutting down");
    let shutdown = service.shutdown();
    if tokio::time::timeout(config.server.shutdown_timeout(), shutdown)
        .await
        .is_err()
    {
        error!("Shutdown timed out, exiting anyway");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting control plane");
    info!(
        workers = config.builder.worker_count,
        queue_capacity = config.builder.queue_capacity,
        work_dir = %config.builder.work_dir.display(),
        max_build_time_secs = config.builder.max_build_time_secs,
        "Build engine configuration"
    );
    info!(
        health_check_interval_secs = config.orchestrator.health_check_interval_secs,
        deployment_timeout_secs = config.orchestrator.deployment_timeout_secs,
        "Orchestrator configuration"
    );
    info!(
        domain = %config.router.domain,
        dynamic_config = %config.router.dynamic_config_path.display(),
        https = config.router.enable_https,
        "Router configuration"
    );
    info!(
        network = %config.docker.default_network,
        container_prefix = %config.docker.container_prefix,
        "Container runtime configuration"
    );
}
