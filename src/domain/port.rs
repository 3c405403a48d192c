use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::Error;
use async_trait::async_trait;

use super::{
    error::PlatformError,
    model::{AddContent, AppPatch, AppSource, ApplicationRecord, Artifact, RouteMapping},
};

#[async_trait]
pub trait AppManager: Send + Sync {
    async fn create_app(&self, app: &AppPatch) -> Result<ApplicationRecord, PlatformError>;

    async fn read_app(&self, app_id: &str) -> Result<ApplicationRecord, PlatformError>;

    async fn update_app(
        &self,
        app_id: &str,
        patch: &AppPatch,
    ) -> Result<ApplicationRecord, PlatformError>;

    async fn delete_app(&self, app_id: &str, recursive: bool) -> Result<(), PlatformError>;

    async fn upload_app(
        &self,
        app_id: &str,
        path: &Path,
        add_content: &[AddContent],
    ) -> Result<(), PlatformError>;

    async fn start_app(&self, app_id: &str, timeout: Duration) -> Result<(), PlatformError>;

    async fn stop_app(&self, app_id: &str, timeout: Duration) -> Result<(), PlatformError>;

    async fn start_docker_app(&self, app_id: &str, timeout: Duration) -> Result<(), PlatformError>;

    async fn wait_for_app_to_start(
        &self,
        app_id: &str,
        timeout: Duration,
    ) -> Result<(), PlatformError>;

    async fn restage_app(&self, app_id: &str, timeout: Duration) -> Result<(), PlatformError>;

    /// Returns the id the platform assigned to the new binding.
    async fn create_service_binding(
        &self,
        app_id: &str,
        service_instance: &str,
        params: Option<&BTreeMap<String, serde_json::Value>>,
    ) -> Result<String, PlatformError>;

    async fn delete_service_binding(&self, binding_id: &str) -> Result<(), PlatformError>;
}

#[async_trait]
pub trait RouteManager: Send + Sync {
    async fn read_route_mappings_by_app(
        &self,
        app_id: &str,
    ) -> Result<Vec<RouteMapping>, PlatformError>;

    async fn read_route_mappings_by_route(
        &self,
        route_id: &str,
    ) -> Result<Vec<RouteMapping>, PlatformError>;

    async fn read_route_mapping(&self, mapping_id: &str) -> Result<RouteMapping, PlatformError>;

    /// Returns the id of the new mapping.
    async fn create_route_mapping(
        &self,
        route_id: &str,
        app_id: &str,
        port: Option<u16>,
    ) -> Result<String, PlatformError>;

    async fn delete_route_mapping(&self, mapping_id: &str) -> Result<(), PlatformError>;
}

#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    async fn resolve(&self, app_name: &str, source: &AppSource) -> Result<Artifact, Error>;
}
