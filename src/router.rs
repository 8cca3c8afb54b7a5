//! Traefik dynamic configuration materialization
//!
//! Keeps the (app -> backend endpoints) table in memory and rewrites the
//! whole dynamic configuration file after every mutation. The external proxy
//! watches the file; we are its only writer. Writes go through a temp file
//! and an atomic rename so the watcher only ever sees complete snapshots.

use crate::config::RouterConfig;
use crate::domain::App;
use crate::error::{PaasError, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// One backend replica address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    pub weight: u32,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            weight: 1,
        }
    }
}

/// Routing entry for one application.
#[derive(Debug, Clone)]
pub struct Route {
    pub app_id: Uuid,
    pub slug: String,
    pub subdomain: String,
    pub port: u16,
    pub endpoints: Vec<Endpoint>,
}

/// Materializes the route table into Traefik's file provider format.
pub struct TraefikRouter {
    config: RouterConfig,
    routes: RwLock<HashMap<Uuid, Route>>,
}

impl TraefikRouter {
    pub fn new(config: RouterConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.dynamic_config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(
            domain = %config.domain,
            config_path = %config.dynamic_config_path.display(),
            "Router configurator initialized"
        );
        Ok(Self {
            config,
            routes: RwLock::new(HashMap::new()),
        })
    }

    /// Add or replace the route for an app, then rewrite the config file.
    pub async fn add_route(&self, app: &App, endpoints: Vec<Endpoint>) -> Result<()> {
        let route = Route {
            app_id: app.id,
            slug: app.slug.clone(),
            subdomain: app.subdomain.clone(),
            port: app.primary_port(),
            endpoints,
        };
        let count = route.endpoints.len();
        self.routes.write().await.insert(app.id, route);
        self.regenerate().await?;
        info!(
            app_id = %app.id,
            host = %format!("{}.{}", app.subdomain, self.config.domain),
            endpoints = count,
            "Route added"
        );
        Ok(())
    }

    pub async fn remove_route(&self, app_id: Uuid) -> Result<()> {
        self.routes.write().await.remove(&app_id);
        self.regenerate().await?;
        info!(app_id = %app_id, "Route removed");
        Ok(())
    }

    pub async fn update_endpoints(&self, app_id: Uuid, endpoints: Vec<Endpoint>) -> Result<()> {
        {
            let mut routes = self.routes.write().await;
            let route = routes
                .get_mut(&app_id)
                .ok_or_else(|| PaasError::not_found(format!("no route for app {}", app_id)))?;
            route.endpoints = endpoints;
        }
        self.regenerate().await?;
        debug!(app_id = %app_id, "Endpoints updated");
        Ok(())
    }

    pub async fn route(&self, app_id: Uuid) -> Option<Route> {
        self.routes.read().await.get(&app_id).cloned()
    }

    pub async fn routes(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self.routes.read().await.values().cloned().collect();
        routes.sort_by(|a, b| a.slug.cmp(&b.slug));
        routes
    }

    /// Hostname an app is served at.
    pub fn app_host(&self, app: &App) -> String {
        format!("{}.{}", app.subdomain, self.config.domain)
    }

    /// Public URL of an app: scheme follows the TLS flag, default ports are
    /// omitted.
    pub fn app_url(&self, app: &App) -> String {
        let (scheme, port) = if self.config.enable_https {
            ("https", self.config.https_port)
        } else {
            ("http", self.config.http_port)
        };
        if port == 80 || port == 443 {
            format!("{}://{}.{}", scheme, app.subdomain, self.config.domain)
        } else {
            format!("{}://{}.{}:{}", scheme, app.subdomain, self.config.domain, port)
        }
    }

    /// Rewrite the dynamic config file from the current route table.
    async fn regenerate(&self) -> Result<()> {
        let routes = self.routes().await;
        let rendered = render_config(&routes, &self.config);

        let path = &self.config.dynamic_config_path;
        let tmp = path.with_extension("yml.tmp");
        tokio::fs::write(&tmp, rendered.as_bytes())
            .await
            .map_err(|e| PaasError::runtime(format!("failed to write dynamic config: {}", e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| PaasError::runtime(format!("failed to commit dynamic config: {}", e)))?;

        debug!(path = %path.display(), routes = routes.len(), "Dynamic config regenerated");
        Ok(())
    }

    /// Static Traefik bootstrap configuration matching the dynamic file
    /// this configurator writes. Meant for operator setup, not consumed by
    /// the control plane itself.
    pub fn static_config(&self) -> String {
        let dynamic_dir = self
            .config
            .dynamic_config_path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ".".to_string());
        format!(
            r#"api:
  dashboard: true
  insecure: true

entryPoints:
  web:
    address: ":{}"
  websecure:
    address: ":{}"

providers:
  file:
    directory: "{}"
    watch: true

log:
  level: INFO

accessLog: {{}}
"#,
            self.config.http_port, self.config.https_port, dynamic_dir
        )
    }
}

/// Render the full dynamic configuration. Pure and deterministic: routes
/// are rendered sorted by slug, endpoints in their given order, so equal
/// tables produce byte-equal files.
fn render_config(routes: &[Route], config: &RouterConfig) -> String {
    let mut out = String::new();
    out.push_str("http:\n");
    out.push_str("  routers:\n");
    for route in routes {
        let _ = writeln!(out, "    {}-router:", route.slug);
        let _ = writeln!(
            out,
            "      rule: \"Host(`{}.{}`)\"",
            route.subdomain, config.domain
        );
        let _ = writeln!(out, "      service: {}", route.slug);
        out.push_str("      entryPoints:\n");
        for entry_point in &config.entry_points {
            let _ = writeln!(out, "        - {}", entry_point);
        }
        if config.enable_https && !config.cert_resolver.is_empty() {
            out.push_str("      tls:\n");
            let _ = writeln!(out, "        certResolver: {}", config.cert_resolver);
        }
    }

    out.push_str("\n  services:\n");
    for route in routes {
        let _ = writeln!(out, "    {}:", route.slug);
        out.push_str("      loadBalancer:\n");
        out.push_str("        servers:\n");
        for endpoint in &route.endpoints {
            let _ = writeln!(
                out,
                "          - url: \"http://{}:{}\"",
                endpoint.ip, endpoint.port
            );
        }
        out.push_str("        healthCheck:\n");
        out.push_str("          path: /health\n");
        out.push_str("          interval: 10s\n");
        out.push_str("          timeout: 3s\n");
    }

    out.push_str("\n  middlewares:\n");
    for route in routes {
        let _ = writeln!(out, "    {}-headers:", route.slug);
        out.push_str("      headers:\n");
        out.push_str("        customRequestHeaders:\n");
        let _ = writeln!(out, "          X-NanoPaaS-App: \"{}\"", route.slug);
        out.push_str("        customResponseHeaders:\n");
        out.push_str("          X-Powered-By: \"NanoPaaS\"\n");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_route(slug: &str, ips: &[&str]) -> Route {
        Route {
            app_id: Uuid::new_v4(),
            slug: slug.to_string(),
            subdomain: slug.to_string(),
            port: 8080,
            endpoints: ips.iter().map(|ip| Endpoint::new(*ip, 8080)).collect(),
        }
    }

    #[test]
    fn test_render_basic() {
        let config = RouterConfig::default();
        let routes = vec![test_route("api", &["172.28.0.2", "172.28.0.3"])];
        let rendered = render_config(&routes, &config);

        assert!(rendered.contains("api-router:"));
        assert!(rendered.contains("rule: \"Host(`api.localhost`)\""));
        assert!(rendered.contains("- url: \"http://172.28.0.2:8080\""));
        assert!(rendered.contains("- url: \"http://172.28.0.3:8080\""));
        assert!(rendered.contains("path: /health"));
        assert!(rendered.contains("X-NanoPaaS-App: \"api\""));
        assert!(rendered.contains("X-Powered-By: \"NanoPaaS\""));
        assert!(!rendered.contains("certResolver"));
    }

    #[test]
    fn test_render_https() {
        let config = RouterConfig {
            enable_https: true,
            ..Default::default()
        };
        let routes = vec![test_route("api", &["172.28.0.2"])];
        let rendered = render_config(&routes, &config);
        assert!(rendered.contains("tls:"));
        assert!(rendered.contains("certResolver: letsencrypt"));
    }

    #[test]
    fn test_render_is_deterministic_and_sorted() {
        let config = RouterConfig::default();
        let a = test_route("aardvark", &["10.0.0.1"]);
        let z = test_route("zebra", &["10.0.0.2"]);

        let one = render_config(&[a.clone(), z.clone()], &config);
        let two = render_config(&[a, z], &config);
        assert_eq!(one, two);

        let idx_a = one.find("aardvark-router").unwrap();
        let idx_z = one.find("zebra-router").unwrap();
        assert!(idx_a < idx_z);
    }

    #[tokio::test]
    async fn test_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = RouterConfig {
            dynamic_config_path: dir.path().join("dynamic.yml"),
            ..Default::default()
        };
        let router = TraefikRouter::new(config).unwrap();

        let app = App::new("API", "api", Uuid::new_v4()).unwrap();
        router
            .add_route(&app, vec![Endpoint::new("172.28.0.2", 8080)])
            .await
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("dynamic.yml")).unwrap();
        assert!(content.contains("Host(`api.localhost`)"));

        // Re-applying identical endpoints must not change the file.
        router
            .update_endpoints(app.id, vec![Endpoint::new("172.28.0.2", 8080)])
            .await
            .unwrap();
        let again = std::fs::read_to_string(dir.path().join("dynamic.yml")).unwrap();
        assert_eq!(content, again);

        router.remove_route(app.id).await.unwrap();
        let emptied = std::fs::read_to_string(dir.path().join("dynamic.yml")).unwrap();
        assert!(!emptied.contains("Host(`api."));
    }

    #[tokio::test]
    async fn test_update_endpoints_requires_route() {
        let dir = tempfile::tempdir().unwrap();
        let config = RouterConfig {
            dynamic_config_path: dir.path().join("dynamic.yml"),
            ..Default::default()
        };
        let router = TraefikRouter::new(config).unwrap();
        let err = router
            .update_endpoints(Uuid::new_v4(), vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_app_url_port_elision() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new("API", "api", Uuid::new_v4()).unwrap();

        let plain = TraefikRouter::new(RouterConfig {
            dynamic_config_path: dir.path().join("a.yml"),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(plain.app_url(&app), "http://api.localhost");

        let odd_port = TraefikRouter::new(RouterConfig {
            dynamic_config_path: dir.path().join("b.yml"),
            http_port: 8000,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(odd_port.app_url(&app), "http://api.localhost:8000");

        let https = TraefikRouter::new(RouterConfig {
            dynamic_config_path: dir.path().join("c.yml"),
            enable_https: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(https.app_url(&app), "https://api.localhost");
    }

    #[test]
    fn test_static_config_mentions_dynamic_dir() {
        let dir = tempfile::tempdir().unwrap();
        let router = TraefikRouter::new(RouterConfig {
            dynamic_config_path: dir.path().join("dynamic.yml"),
            ..Default::default()
        })
        .unwrap();
        let static_config = router.static_config();
        assert!(static_config.contains("watch: true"));
        assert!(static_config.contains(&dir.path().display().to_string()));
    }
}
