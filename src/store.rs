//! Process-local registries for applications and builds
//!
//! Durable persistence lives behind an external collaborator boundary; these
//! registries are the in-process single source of truth the control plane
//! programs against. Build workers and the service layer mutate records
//! through closure-based updates so readers always observe one consistent
//! version.

use crate::domain::{App, Build};
use crate::error::{PaasError, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct AppStore {
    apps: RwLock<HashMap<Uuid, App>>,
}

impl AppStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new application. Slugs are unique.
    pub async fn insert(&self, app: App) -> Result<()> {
        let mut apps = self.apps.write().await;
        if apps.values().any(|a| a.slug == app.slug) {
            return Err(PaasError::conflict(format!(
                "an app with slug '{}' already exists",
                app.slug
            )));
        }
        apps.insert(app.id, app);
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Option<App> {
        self.apps.read().await.get(&id).cloned()
    }

    pub async fn get_by_slug(&self, slug: &str) -> Option<App> {
        self.apps
            .read()
            .await
            .values()
            .find(|a| a.slug == slug)
            .cloned()
    }

    pub async fn list(&self) -> Vec<App> {
        let mut apps: Vec<App> = self.apps.read().await.values().cloned().collect();
        apps.sort_by_key(|a| a.created_at);
        apps
    }

    /// Apply a mutation to a stored application.
    pub async fn update<F, R>(&self, id: Uuid, f: F) -> Result<R>
    where
        F: FnOnce(&mut App) -> R,
    {
        let mut apps = self.apps.write().await;
        let app = apps
            .get_mut(&id)
            .ok_or_else(|| PaasError::not_found(format!("app {} not found", id)))?;
        Ok(f(app))
    }

    /// Replace a whole record, typically after the orchestrator mutated a
    /// working copy under the per-app lock.
    pub async fn put(&self, app: App) {
        self.apps.write().await.insert(app.id, app);
    }

    pub async fn remove(&self, id: Uuid) -> Result<App> {
        self.apps
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| PaasError::not_found(format!("app {} not found", id)))
    }
}

#[derive(Default)]
pub struct BuildStore {
    builds: RwLock<HashMap<Uuid, Build>>,
}

impl BuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, build: Build) {
        self.builds.write().await.insert(build.id, build);
    }

    pub async fn get(&self, id: Uuid) -> Option<Build> {
        self.builds.read().await.get(&id).cloned()
    }

    pub async fn list_for_app(&self, app_id: Uuid) -> Vec<Build> {
        let mut builds: Vec<Build> = self
            .builds
            .read()
            .await
            .values()
            .filter(|b| b.app_id == app_id)
            .cloned()
            .collect();
        builds.sort_by_key(|b| b.created_at);
        builds
    }

    pub async fn update<F, R>(&self, id: Uuid, f: F) -> Result<R>
    where
        F: FnOnce(&mut Build) -> R,
    {
        let mut builds = self.builds.write().await;
        let build = builds
            .get_mut(&id)
            .ok_or_else(|| PaasError::not_found(format!("build {} not found", id)))?;
        Ok(f(build))
    }

    pub async fn remove(&self, id: Uuid) -> Option<Build> {
        self.builds.write().await.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AppStatus, BuildSource, BuildStatus};

    #[tokio::test]
    async fn test_slug_uniqueness() {
        let store = AppStore::new();
        let owner = Uuid::new_v4();
        store
            .insert(App::new("API", "api", owner).unwrap())
            .await
            .unwrap();
        let err = store
            .insert(App::new("API 2", "api", owner).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_update_and_lookup() {
        let store = AppStore::new();
        let app = App::new("API", "api", Uuid::new_v4()).unwrap();
        let id = app.id;
        store.insert(app).await.unwrap();

        store.update(id, |a| a.mark_running()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().status, AppStatus::Running);
        assert!(store.get_by_slug("api").await.is_some());
        assert!(store.get_by_slug("nope").await.is_none());

        let missing = store.update(Uuid::new_v4(), |_| ()).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_build_store_updates_visible() {
        let store = BuildStore::new();
        let build = Build::new(Uuid::new_v4(), BuildSource::Archive);
        let id = build.id;
        store.insert(build).await;

        store.update(id, |b| b.start()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().status, BuildStatus::Running);
    }
}
