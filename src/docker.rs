//! Docker-backed implementation of the container runtime
//!
//! Connection priority:
//! 1. Explicit host from configuration
//! 2. DOCKER_HOST environment variable
//! 3. Common socket paths (platform-specific)

use crate::error::{PaasError, Result};
use crate::runtime::{
    BuiltImage, ContainerDetails, ContainerRuntime, ContainerSpec, ContainerSummary,
    ImageBuildRequest, LogCallback, LogChunk, LogSource, LogStream, RestartPolicy,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Container runtime backed by a local Docker daemon.
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon and verify it responds.
    pub async fn connect(host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host,
                    e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                     Ensure Docker is running and accessible.",
                    host,
                    e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.is_empty() || path.contains("//") {
                continue;
            }
            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon. \
                 Start Docker Desktop, Colima, or dockerd, or set DOCKER_HOST. \
                 Underlying error: {}",
                e
            )
        })
    }

    fn restart_policy(policy: &RestartPolicy) -> bollard::models::RestartPolicy {
        match policy {
            RestartPolicy::Always => bollard::models::RestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                maximum_retry_count: None,
            },
            RestartPolicy::OnFailure(n) => bollard::models::RestartPolicy {
                name: Some(RestartPolicyNameEnum::ON_FAILURE),
                maximum_retry_count: Some(*n as i64),
            },
            RestartPolicy::UnlessStopped => bollard::models::RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            },
            RestartPolicy::No => bollard::models::RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            },
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| PaasError::runtime(format!("docker daemon not responding: {}", e)))
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert("name", vec![name]);
        let networks = self
            .client
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .map_err(|e| PaasError::runtime(format!("failed to list networks: {}", e)))?;

        // The name filter is a substring match, so check for an exact hit.
        if networks.iter().any(|n| n.name.as_deref() == Some(name)) {
            debug!(network = name, "Network already exists");
            return Ok(());
        }

        let mut labels = HashMap::new();
        labels.insert(MANAGED_BY_LABEL, MANAGED_BY_VALUE);
        self.client
            .create_network(CreateNetworkOptions {
                name,
                driver: "bridge",
                labels,
                ..Default::default()
            })
            .await
            .map_err(|e| PaasError::runtime(format!("failed to create network '{}': {}", name, e)))?;

        info!(network = name, "Network created");
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
            .ok_or_else(|| PaasError::build_failed("no image tag supplied"))?;

        let options = BuildImageOptions {
            dockerfile: req.dockerfile_path.clone(),
            t: tag.clone(),
            nocache: req.no_cache,
            pull: req.pull_parent,
            rm: true,
            buildargs: req.build_args.clone(),
            labels: HashMap::from([(
                "built-by".to_string(),
                MANAGED_BY_VALUE.to_string(),
            )]),
            ..Default::default()
        };

        let mut stream = self
            .client
            .build_image(options, None, Some(req.context.into()));

        let mut image_id: Option<String> = None;
        let mut build_error: Option<String> = None;

        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                // The daemon-side build keeps going; we just stop forwarding
                // output and discard the result.
                return Err(PaasError::cancelled("build cancelled"));
            }
            match item {
                Ok(info) => {
                    if let Some(chunk) = info.stream {
                        on_log(&chunk);
                    }
                    if let Some(status) = info.status {
                        on_log(&format!("{}\n", status));
                    }
                    if let Some(err) = info.error {
                        build_error = Some(err);
                    }
                    if let Some(aux) = info.aux {
                        if let Some(id) = aux.id {
                            image_id = Some(id);
                        }
                    }
                }
                Err(e) => {
                    return Err(PaasError::build_failed(format!("docker build failed: {}", e)));
                }
            }
        }

        if let Some(err) = build_error {
            return Err(PaasError::build_failed(format!("docker build failed: {}", err)));
        }

        info!(tag = %tag, "Image built");
        Ok(BuiltImage {
            id: image_id.unwrap_or_else(|| tag.clone()),
            tag,
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            // Empty host port asks the daemon for an ephemeral one.
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(String::new()),
                }]),
            );
        }

        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            restart_policy: Some(Self::restart_policy(&spec.restart_policy)),
            memory: (spec.memory_limit > 0).then_some(spec.memory_limit),
            cpu_quota: (spec.cpu_quota > 0).then_some(spec.cpu_quota),
            network_mode: spec.network.clone(),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(vec!["NET_BIND_SERVICE".to_string()]),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            user: spec.user.clone(),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 409, ..
                } => PaasError::runtime(format!(
                    "container name '{}' is already in use",
                    spec.name
                )),
                e => PaasError::runtime(format!(
                    "failed to create container '{}' from image '{}': {}",
                    spec.name, spec.image, e
                )),
            })?;

        info!(
            id = %short_id(&response.id),
            name = %spec.name,
            image = %spec.image,
            "Container created"
        );
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                PaasError::runtime(format!("failed to start container {}: {}", short_id(id), e))
            })?;
        info!(id = %short_id(id), "Container started");
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                info!(id = %short_id(id), "Container stopped");
                Ok(())
            }
            // Already stopped or already gone.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            })
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(id = %short_id(id), "Container already stopped or missing");
                Ok(())
            }
            Err(e) => Err(PaasError::runtime(format!(
                "failed to stop container {}: {}",
                short_id(id),
                e
            ))),
        }
    }

    async fn restart_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let options = RestartContainerOptions {
            t: timeout.as_secs() as isize,
        };
        self.client
            .restart_container(id, Some(options))
            .await
            .map_err(|e| {
                PaasError::runtime(format!(
                    "failed to restart container {}: {}",
                    short_id(id),
                    e
                ))
            })?;
        info!(id = %short_id(id), "Container restarted");
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(id, Some(options)).await {
            Ok(_) => {
                debug!(id = %short_id(id), "Container removed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(id = %short_id(id), "Container not found");
                Ok(())
            }
            Err(e) => {
                warn!(id = %short_id(id), error = %e, "Failed to remove container");
                Err(PaasError::runtime(format!(
                    "failed to remove container {}: {}",
                    short_id(id),
                    e
                )))
            }
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                PaasError::runtime(format!(
                    "failed to inspect container {}: {}",
                    short_id(id),
                    e
                ))
            })?;

        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let healthy = info.state.as_ref().and_then(|s| {
            s.health.as_ref().and_then(|h| {
                h.status.map(|status| {
                    status == bollard::models::HealthStatusEnum::HEALTHY
                })
            })
        });

        let mut ip_addresses = HashMap::new();
        if let Some(settings) = &info.network_settings {
            if let Some(networks) = &settings.networks {
                for (network, endpoint) in networks {
                    if let Some(ip) = &endpoint.ip_address {
                        if !ip.is_empty() {
                            ip_addresses.insert(network.clone(), ip.clone());
                        }
                    }
                }
            }
        }

        Ok(ContainerDetails {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: info
                .config
                .as_ref()
                .and_then(|c| c.image.clone())
                .unwrap_or_default(),
            running,
            healthy,
            ip_addresses,
            labels: info
                .config
                .and_then(|c| c.labels)
                .unwrap_or_default(),
        })
    }

    async fn list_containers(
        &self,
        all: bool,
        name_prefix: Option<&str>,
    ) -> Result<Vec<ContainerSummary>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(prefix) = name_prefix {
            filters.insert("name".to_string(), vec![prefix.to_string()]);
        }

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| PaasError::runtime(format!("failed to list containers: {}", e)))?;

        let mut result = Vec::with_capacity(containers.len());
        for c in containers {
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            // The name filter is a substring match; enforce the prefix here.
            if let Some(prefix) = name_prefix {
                if !name.starts_with(prefix) {
                    continue;
                }
            }
            let ip_address = c.network_settings.as_ref().and_then(|s| {
                s.networks.as_ref().and_then(|nets| {
                    nets.values()
                        .filter_map(|e| e.ip_address.clone())
                        .find(|ip| !ip.is_empty())
                })
            });
            result.push(ContainerSummary {
                id: c.id.unwrap_or_default(),
                name,
                image: c.image.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                ip_address,
            });
        }
        Ok(result)
    }

    async fn container_logs(
        &self,
        id: &str,
        follow: bool,
        tail: Option<u32>,
    ) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: tail.map(|t| t.to_string()).unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let stream = self.client.logs(id, Some(options)).map(|item| match item {
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                Ok(LogChunk {
                    source: LogSource::Stdout,
                    data: message,
                })
            }
            Ok(LogOutput::StdErr { message }) => Ok(LogChunk {
                source: LogSource::Stderr,
                data: message,
            }),
            Ok(LogOutput::StdIn { .. }) => Ok(LogChunk {
                source: LogSource::Stdout,
                data: bytes::Bytes::new(),
            }),
            Err(e) => Err(PaasError::runtime(format!("log stream error: {}", e))),
        });

        Ok(Box::pin(stream))
    }

    async fn health(&self, id: &str) -> Result<bool> {
        let details = self.inspect_container(id).await?;
        Ok(details.healthy.unwrap_or(details.running))
    }
}

fn short_id(id: &str) -> &str {
    if id.len() > 12 {
        &id[..12]
    } else {
        id
    }
}
