//! NanoPaaS - a lightweight self-hosted platform-as-a-service
//!
//! This library is the server-side control plane:
//! - Builds container images from source archives or git repositories,
//!   with Dockerfile auto-detection and synthesis, on a bounded worker pool
//! - Orchestrates per-application replica containers: deploy, scale,
//!   restart, stop, health-driven self-healing, rollback on failure
//! - Materializes the live route table into a file-based dynamic
//!   configuration consumed by an external reverse proxy (Traefik)
//! - Fans build and container logs out to streaming subscribers through an
//!   in-process pub/sub hub with bounded queues

pub mod builder;
pub mod config;
pub mod docker;
pub mod domain;
pub mod error;
pub mod hub;
pub mod logs;
pub mod orchestrator;
pub mod router;
pub mod runtime;
pub mod service;
pub mod store;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
