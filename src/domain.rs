//! Core entities: applications, builds, deployments
//!
//! Each entity is the single source of truth for its own lifecycle. State
//! transitions go through methods that mutate fields and stamp timestamps;
//! callers reject transitions from impermissible states before invoking them.

use crate::error::{PaasError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Hard ceiling on replicas per application.
pub const MAX_REPLICAS: usize = 10;

/// Default memory cap for new applications: 512 MiB.
pub const DEFAULT_MEMORY_LIMIT: i64 = 512 * 1024 * 1024;

/// Default CPU quota in microseconds per period (half of one CPU).
pub const DEFAULT_CPU_QUOTA: i64 = 50_000;

/// Default primary service port for new applications.
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Created,
    Building,
    Deploying,
    Running,
    Stopped,
    Failed,
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AppStatus::Created => "created",
            AppStatus::Building => "building",
            AppStatus::Deploying => "deploying",
            AppStatus::Running => "running",
            AppStatus::Stopped => "stopped",
            AppStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A deployed application: replicas of one image, routed by hostname.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: Uuid,
    pub name: String,
    /// URL-safe identity, immutable after creation
    pub slug: String,
    #[serde(default)]
    pub description: String,
    pub status: AppStatus,

    /// Ordered environment mapping handed to every replica
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,

    /// Exposed TCP ports; the first entry is the primary service port
    pub ports: Vec<u16>,

    /// Memory cap in bytes
    pub memory_limit: i64,
    /// CPU quota in microseconds
    pub cpu_quota: i64,

    pub current_image_tag: Option<String>,
    pub previous_image_tag: Option<String>,

    pub replicas: usize,
    pub target_replicas: usize,

    pub subdomain: String,
    pub owner_id: Uuid,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl App {
    /// Create an application with defaults. Fails on an invalid slug.
    pub fn new(name: impl Into<String>, slug: impl Into<String>, owner_id: Uuid) -> Result<Self> {
        let slug = slug.into();
        validate_slug(&slug)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            subdomain: slug.clone(),
            slug,
            description: String::new(),
            status: AppStatus::Created,
            env_vars: BTreeMap::new(),
            ports: vec![DEFAULT_PORT],
            memory_limit: DEFAULT_MEMORY_LIMIT,
            cpu_quota: DEFAULT_CPU_QUOTA,
            current_image_tag: None,
            previous_image_tag: None,
            replicas: 0,
            target_replicas: 1,
            owner_id,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        })
    }

    /// The port the router sends traffic to.
    pub fn primary_port(&self) -> u16 {
        self.ports.first().copied().unwrap_or(DEFAULT_PORT)
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env_vars.insert(key.into(), value.into());
        self.updated_at = Utc::now();
    }

    pub fn delete_env(&mut self, key: &str) -> bool {
        let removed = self.env_vars.remove(key).is_some();
        if removed {
            self.updated_at = Utc::now();
        }
        removed
    }

    /// Environment as `KEY=value` pairs, in key order.
    pub fn env_slice(&self) -> Vec<String> {
        self.env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    /// Whether a deployment may start from the current status.
    pub fn can_deploy(&self) -> bool {
        matches!(
            self.status,
            AppStatus::Created | AppStatus::Running | AppStatus::Stopped | AppStatus::Failed
        )
    }

    pub fn mark_building(&mut self) {
        self.status = AppStatus::Building;
        self.updated_at = Utc::now();
    }

    pub fn mark_deploying(&mut self) {
        self.status = AppStatus::Deploying;
        self.updated_at = Utc::now();
    }

    pub fn mark_running(&mut self) {
        let now = Utc::now();
        self.status = AppStatus::Running;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_stopped(&mut self) {
        let now = Utc::now();
        self.status = AppStatus::Stopped;
        self.stopped_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self) {
        self.status = AppStatus::Failed;
        self.updated_at = Utc::now();
    }

    /// Adopt a freshly built image, remembering the one it replaces.
    pub fn update_image(&mut self, tag: impl Into<String>) {
        self.previous_image_tag = self.current_image_tag.take();
        self.current_image_tag = Some(tag.into());
        self.updated_at = Utc::now();
    }

    /// Swap current and previous image tags. Returns false when there is
    /// nothing to roll back to. Does not touch `previous_image_tag`
    /// semantics beyond the swap: a rollback is not an image update.
    pub fn rollback_image(&mut self) -> bool {
        if self.previous_image_tag.is_none() {
            return false;
        }
        std::mem::swap(&mut self.current_image_tag, &mut self.previous_image_tag);
        self.updated_at = Utc::now();
        true
    }

    /// Container name for a replica index: bare slug for replica 0,
    /// `slug-<n>` otherwise, under the managed prefix.
    pub fn container_name(&self, prefix: &str, replica: usize) -> String {
        if replica == 0 {
            format!("{}{}", prefix, self.slug)
        } else {
            format!("{}{}-{}", prefix, self.slug, replica)
        }
    }
}

/// Slug rules: lowercase alphanumerics and hyphens, DNS-label length, no
/// leading or trailing hyphen. The slug becomes a routable hostname.
pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.is_empty() || slug.len() > 63 {
        return Err(PaasError::invalid_argument(format!(
            "slug must be 1-63 characters, got {}",
            slug.len()
        )));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(PaasError::invalid_argument(format!(
            "slug '{}' may only contain lowercase letters, digits and hyphens",
            slug
        )));
    }
    if slug.starts_with('-') || slug.ends_with('-') {
        return Err(PaasError::invalid_argument(format!(
            "slug '{}' may not start or end with a hyphen",
            slug
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Running => "running",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Where the build takes its source from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSource {
    /// Gzipped tar archive streamed in with the request
    Archive,
    /// Git repository, shallow-cloned
    Repository,
    /// Plain HTTP download
    Url,
}

/// One attempt at turning a source into a tagged image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub app_id: Uuid,
    pub status: BuildStatus,
    pub source: BuildSource,
    pub source_url: Option<String>,
    pub git_ref: Option<String>,

    pub dockerfile_path: String,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    pub image_tag: Option<String>,
    pub image_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub error_message: Option<String>,
}

impl Build {
    pub fn new(app_id: Uuid, source: BuildSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            app_id,
            status: BuildStatus::Queued,
            source,
            source_url: None,
            git_ref: None,
            dockerfile_path: "Dockerfile".to_string(),
            build_args: BTreeMap::new(),
            image_tag: None,
            image_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn start(&mut self) {
        self.status = BuildStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn succeed(&mut self, image_id: impl Into<String>, image_tag: impl Into<String>) {
        self.status = BuildStatus::Succeeded;
        self.completed_at = Some(Utc::now());
        self.image_id = Some(image_id.into());
        self.image_tag = Some(image_tag.into());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = BuildStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(message.into());
    }

    pub fn cancel(&mut self) {
        self.status = BuildStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end - started)
    }

    /// Deterministic image tag: `nanopaas/<slug>:<first 8 hex of build id>`.
    pub fn image_tag_for(&self, app_slug: &str) -> String {
        let hex = self.id.simple().to_string();
        format!("nanopaas/{}:{}", app_slug, &hex[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Succeeded => "succeeded",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// The transactional unit of swapping an application to (image, replicas).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub app_id: Uuid,
    pub image_tag: String,
    pub status: DeploymentStatus,
    pub replicas: usize,
    pub container_ids: Vec<String>,

    pub previous_image_tag: Option<String>,
    pub rollback_reason: Option<String>,
    pub rolled_back_from: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub error_message: Option<String>,
}

impl Deployment {
    pub fn new(app_id: Uuid, image_tag: impl Into<String>, replicas: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            app_id,
            image_tag: image_tag.into(),
            status: DeploymentStatus::Pending,
            replicas,
            container_ids: Vec::new(),
            previous_image_tag: None,
            rollback_reason: None,
            rolled_back_from: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn start(&mut self) {
        self.status = DeploymentStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn succeed(&mut self, container_ids: Vec<String>) {
        self.status = DeploymentStatus::Succeeded;
        self.completed_at = Some(Utc::now());
        self.container_ids = container_ids;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = DeploymentStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(message.into());
    }

    pub fn mark_rolled_back(&mut self, reason: impl Into<String>) {
        self.status = DeploymentStatus::RolledBack;
        self.completed_at = Some(Utc::now());
        self.rollback_reason = Some(reason.into());
    }

    pub fn add_container(&mut self, container_id: impl Into<String>) {
        self.container_ids.push(container_id.into());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end - started)
    }
}
