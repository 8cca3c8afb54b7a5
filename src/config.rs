use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// API server settings (the HTTP layer binds with these)
    #[serde(default)]
    pub server: ServerConfig,

    /// Container runtime settings
    #[serde(default)]
    pub docker: DockerConfig,

    /// Build engine settings
    #[serde(default)]
    pub builder: BuilderConfig,

    /// Orchestrator settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Reverse proxy routing settings
    #[serde(default)]
    pub router: RouterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 8080)
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Grace period for in-flight work on shutdown, seconds (default: 15)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker daemon address, e.g. "unix:///var/run/docker.sock" or
    /// "tcp://host:2375". Empty means DOCKER_HOST then platform defaults.
    pub host: Option<String>,

    /// Prefix for every managed container name (default: "nanopaas-")
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// Shared bridge network all replicas attach to (default: "nanopaas")
    #[serde(default = "default_network")]
    pub default_network: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            container_prefix: default_container_prefix(),
            default_network: default_network(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuilderConfig {
    /// Number of parallel build workers (default: 4)
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Pending build queue capacity (default: 100)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Root directory for per-build scratch space (default: system temp dir)
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Per-build deadline in seconds (default: 900)
    #[serde(default = "default_max_build_time")]
    pub max_build_time_secs: u64,

    /// Remove scratch directories when a build finishes (default: true)
    #[serde(default = "default_cleanup_on_finish")]
    pub cleanup_on_finish: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            work_dir: default_work_dir(),
            max_build_time_secs: default_max_build_time(),
            cleanup_on_finish: default_cleanup_on_finish(),
        }
    }
}

impl BuilderConfig {
    pub fn max_build_time(&self) -> Duration {
        Duration::from_secs(self.max_build_time_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Seconds between health sweeps (default: 30)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Deadline for a full deployment in seconds (default: 300)
    #[serde(default = "default_deployment_timeout")]
    pub deployment_timeout_secs: u64,

    /// Graceful stop timeout per container in seconds (default: 30)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval(),
            deployment_timeout_secs: default_deployment_timeout(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl OrchestratorConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn deployment_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    /// Base routing domain; apps live at <subdomain>.<domain> (default: localhost)
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Dynamic configuration file the external proxy watches
    #[serde(default = "default_dynamic_config_path")]
    pub dynamic_config_path: PathBuf,

    /// HTTP entry port of the proxy (default: 80)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS entry port of the proxy (default: 443)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Emit TLS-enabled routes (default: false)
    #[serde(default)]
    pub enable_https: bool,

    /// ACME certificate resolver name the proxy is configured with
    #[serde(default = "default_cert_resolver")]
    pub cert_resolver: String,

    /// Proxy entry point names routes are attached to
    #[serde(default = "default_entry_points")]
    pub entry_points: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            dynamic_config_path: default_dynamic_config_path(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            enable_https: false,
            cert_resolver: default_cert_resolver(),
            entry_points: default_entry_points(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    15
}

fn default_container_prefix() -> String {
    "nanopaas-".to_string()
}

fn default_network() -> String {
    "nanopaas".to_string()
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    100
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_max_build_time() -> u64 {
    15 * 60
}

fn default_cleanup_on_finish() -> bool {
    true
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_deployment_timeout() -> u64 {
    5 * 60
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_dynamic_config_path() -> PathBuf {
    PathBuf::from("./traefik/dynamic/dynamic.yml")
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_cert_resolver() -> String {
    "letsencrypt".to_string()
}

fn default_entry_points() -> Vec<String> {
    vec!["web".to_string()]
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults
    /// so the binary runs out of the box.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
