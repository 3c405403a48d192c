use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    time::Duration,
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use flate2::{write::GzEncoder, Compression};
use log::debug;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    error::PlatformError,
    model::{
        AddContent, AppPatch, AppState, ApplicationRecord, PackageState, RouteMapping,
    },
    port::{AppManager, RouteManager},
};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_QUOTA: u32 = 1024;
const DEFAULT_STACK: &str = "cflinuxfs4";

/// Mutating call accepted by the platform, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    CreateApp { name: String, instances: u32 },
    UpdateApp { app_id: String, patch: AppPatch },
    DeleteApp(String),
    UploadApp(String),
    StartApp(String),
    StopApp(String),
    StartDockerApp(String),
    WaitForAppToStart(String),
    RestageApp(String),
    CreateServiceBinding { app_id: String, service_instance: String },
    DeleteServiceBinding(String),
    CreateRouteMapping { route_id: String, app_id: String },
    DeleteRouteMapping(String),
}

/// Port operation, the unit fault injection is armed on in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateApp,
    ReadApp,
    UpdateApp,
    DeleteApp,
    UploadApp,
    StartApp,
    StopApp,
    StartDockerApp,
    WaitForAppToStart,
    RestageApp,
    CreateServiceBinding,
    DeleteServiceBinding,
    ReadRouteMappings,
    ReadRouteMapping,
    CreateRouteMapping,
    DeleteRouteMapping,
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    Reject(String),
    Timeout,
    NotFound,
}

#[cfg(test)]
struct Fault {
    operation: Operation,
    skip: usize,
    kind: FaultKind,
}

struct StoredApp {
    record: ApplicationRecord,
    package: Option<Bytes>,
}

struct StoredBinding {
    app_id: String,
    service_instance: String,
}

#[derive(Default)]
struct State {
    apps: BTreeMap<String, StoredApp>,
    bindings: BTreeMap<String, StoredBinding>,
    mappings: BTreeMap<String, RouteMapping>,
    #[cfg(test)]
    faults: Vec<Fault>,
    journal: Vec<PlatformCall>,
}

impl State {
    #[cfg(not(test))]
    fn check(&mut self, _operation: Operation, _subject: &str) -> Result<(), PlatformError> {
        Ok(())
    }

    /// Consumes the first fault armed for `operation`, once its skip count
    /// runs out.
    #[cfg(test)]
    fn check(&mut self, operation: Operation, subject: &str) -> Result<(), PlatformError> {
        let Some(position) = self.faults.iter().position(|f| f.operation == operation) else {
            return Ok(());
        };
        let fault = &mut self.faults[position];
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        let fault = self.faults.remove(position);
        debug!("Injecting {:?} into {:?} of {}", fault.kind, operation, subject);
        Err(match fault.kind {
            FaultKind::Reject(reason) => PlatformError::Rejected(reason),
            FaultKind::Timeout => PlatformError::Timeout {
                app_id: subject.to_string(),
                timeout: Duration::ZERO,
            },
            FaultKind::NotFound => PlatformError::not_found("resource", subject),
        })
    }

    fn app(&self, app_id: &str) -> Result<&StoredApp, PlatformError> {
        self.apps
            .get(app_id)
            .ok_or_else(|| PlatformError::not_found("application", app_id))
    }

    fn app_mut(&mut self, app_id: &str) -> Result<&mut StoredApp, PlatformError> {
        self.apps
            .get_mut(app_id)
            .ok_or_else(|| PlatformError::not_found("application", app_id))
    }

    fn run(&mut self, app_id: &str, call: PlatformCall) -> Result<(), PlatformError> {
        let app = self.app_mut(app_id)?;
        if app.package.is_none() && app.record.docker_image.is_none() {
            return Err(PlatformError::Rejected(format!(
                "application {} has no package to run",
                app_id
            )));
        }
        app.record.state = AppState::Started;
        app.record.package_state = PackageState::Staged;
        self.journal.push(call);
        Ok(())
    }
}

/// Control plane kept in memory. Serves as sandbox for the HTTP surface and as
/// test double, with a journal of accepted mutations and fault injection.
#[derive(Default)]
pub struct InMemoryPlatform {
    state: Mutex<State>,
}

#[async_trait]
impl AppManager for InMemoryPlatform {
    async fn create_app(&self, app: &AppPatch) -> Result<ApplicationRecord, PlatformError> {
        let mut state = self.state.lock().await;
        let name = app.name.clone().unwrap_or_default();
        state.check(Operation::CreateApp, &name)?;
        let space = app.space.clone().unwrap_or_default();
        if name.is_empty() {
            return Err(PlatformError::Rejected("application name is required".to_string()));
        }
        if state
            .apps
            .values()
            .any(|existing| existing.record.name == name && existing.record.space == space)
        {
            return Err(PlatformError::Rejected(format!(
                "the app name {} is already taken in space {}",
                name, space
            )));
        }
        let record = ApplicationRecord {
            id: Uuid::new_v4().to_string(),
            name: name.clone(),
            space,
            instances: app.instances.unwrap_or(1),
            memory: Some(app.memory.unwrap_or(DEFAULT_QUOTA)),
            disk_quota: Some(app.disk_quota.unwrap_or(DEFAULT_QUOTA)),
            stack: Some(app.stack.clone().unwrap_or_else(|| DEFAULT_STACK.to_string())),
            buildpack: app.buildpack.clone(),
            command: app.command.clone(),
            enable_ssh: Some(app.enable_ssh.unwrap_or(true)),
            health_check_type: app.health_check_type.unwrap_or_default(),
            health_check_http_endpoint: app.health_check_http_endpoint.clone(),
            health_check_timeout: app.health_check_timeout,
            environment: app.environment.clone().unwrap_or_default(),
            ports: app
                .ports
                .clone()
                .unwrap_or_else(|| BTreeSet::from([DEFAULT_PORT])),
            docker_image: app.docker_image.clone(),
            state: AppState::Stopped,
            package_state: PackageState::Pending,
        };
        state.apps.insert(
            record.id.clone(),
            StoredApp {
                record: record.clone(),
                package: None,
            },
        );
        state.journal.push(PlatformCall::CreateApp {
            name,
            instances: record.instances,
        });
        Ok(record)
    }

    async fn read_app(&self, app_id: &str) -> Result<ApplicationRecord, PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::ReadApp, app_id)?;
        Ok(state.app(app_id)?.record.clone())
    }

    async fn update_app(
        &self,
        app_id: &str,
        patch: &AppPatch,
    ) -> Result<ApplicationRecord, PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::UpdateApp, app_id)?;
        let record = &mut state.app_mut(app_id)?.record;
        if let Some(name) = &patch.name {
            record.name = name.clone();
        }
        if let Some(space) = &patch.space {
            record.space = space.clone();
        }
        if let Some(instances) = patch.instances {
            record.instances = instances;
        }
        if let Some(ports) = &patch.ports {
            record.ports = ports.clone();
        }
        if let Some(environment) = &patch.environment {
            record.environment = environment.clone();
        }
        if let Some(health_check_type) = patch.health_check_type {
            record.health_check_type = health_check_type;
        }
        if patch.docker_image.is_some() {
            record.docker_image = patch.docker_image.clone();
        }
        replace(&mut record.enable_ssh, &patch.enable_ssh);
        replace(&mut record.memory, &patch.memory);
        replace(&mut record.disk_quota, &patch.disk_quota);
        replace(&mut record.command, &patch.command);
        replace(&mut record.health_check_http_endpoint, &patch.health_check_http_endpoint);
        replace(&mut record.health_check_timeout, &patch.health_check_timeout);
        replace(&mut record.buildpack, &patch.buildpack);
        replace(&mut record.stack, &patch.stack);
        let updated = record.clone();
        state.journal.push(PlatformCall::UpdateApp {
            app_id: app_id.to_string(),
            patch: patch.clone(),
        });
        Ok(updated)
    }

    async fn delete_app(&self, app_id: &str, recursive: bool) -> Result<(), PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::DeleteApp, app_id)?;
        state.app(app_id)?;
        let attached = state.bindings.values().any(|b| b.app_id == app_id)
            || state.mappings.values().any(|m| m.app_id == app_id);
        if attached && !recursive {
            return Err(PlatformError::Rejected(format!(
                "application {} still has bindings or route mappings",
                app_id
            )));
        }
        state.bindings.retain(|_, binding| binding.app_id != app_id);
        state.mappings.retain(|_, mapping| mapping.app_id != app_id);
        state.apps.remove(app_id);
        state.journal.push(PlatformCall::DeleteApp(app_id.to_string()));
        Ok(())
    }

    async fn upload_app(
        &self,
        app_id: &str,
        path: &Path,
        add_content: &[AddContent],
    ) -> Result<(), PlatformError> {
        {
            let mut state = self.state.lock().await;
            state.check(Operation::UploadApp, app_id)?;
            state.app(app_id)?;
        }
        let path = path.to_path_buf();
        let add_content = add_content.to_vec();
        let package = tokio::task::spawn_blocking(move || package(&path, &add_content))
            .await
            .map_err(|e| anyhow!("packaging task failed: {}", e))??;
        debug!("Packaged {} bytes for application {}", package.len(), app_id);

        let mut state = self.state.lock().await;
        let app = state.app_mut(app_id)?;
        app.package = Some(package);
        app.record.package_state = PackageState::Pending;
        state.journal.push(PlatformCall::UploadApp(app_id.to_string()));
        Ok(())
    }

    async fn start_app(&self, app_id: &str, _timeout: Duration) -> Result<(), PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::StartApp, app_id)?;
        state.run(app_id, PlatformCall::StartApp(app_id.to_string()))
    }

    async fn stop_app(&self, app_id: &str, _timeout: Duration) -> Result<(), PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::StopApp, app_id)?;
        state.app_mut(app_id)?.record.state = AppState::Stopped;
        state.journal.push(PlatformCall::StopApp(app_id.to_string()));
        Ok(())
    }

    async fn start_docker_app(&self, app_id: &str, _timeout: Duration) -> Result<(), PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::StartDockerApp, app_id)?;
        if state.app(app_id)?.record.docker_image.is_none() {
            return Err(PlatformError::Rejected(format!(
                "application {} has no docker image",
                app_id
            )));
        }
        state.run(app_id, PlatformCall::StartDockerApp(app_id.to_string()))
    }

    async fn wait_for_app_to_start(
        &self,
        app_id: &str,
        timeout: Duration,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::WaitForAppToStart, app_id)?;
        if state.app(app_id)?.record.state != AppState::Started {
            return Err(PlatformError::Timeout {
                app_id: app_id.to_string(),
                timeout,
            });
        }
        state
            .journal
            .push(PlatformCall::WaitForAppToStart(app_id.to_string()));
        Ok(())
    }

    async fn restage_app(&self, app_id: &str, _timeout: Duration) -> Result<(), PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::RestageApp, app_id)?;
        state.run(app_id, PlatformCall::RestageApp(app_id.to_string()))
    }

    async fn create_service_binding(
        &self,
        app_id: &str,
        service_instance: &str,
        _params: Option<&BTreeMap<String, serde_json::Value>>,
    ) -> Result<String, PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::CreateServiceBinding, service_instance)?;
        state.app(app_id)?;
        let binding_id = Uuid::new_v4().to_string();
        state.bindings.insert(
            binding_id.clone(),
            StoredBinding {
                app_id: app_id.to_string(),
                service_instance: service_instance.to_string(),
            },
        );
        state.journal.push(PlatformCall::CreateServiceBinding {
            app_id: app_id.to_string(),
            service_instance: service_instance.to_string(),
        });
        Ok(binding_id)
    }

    async fn delete_service_binding(&self, binding_id: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::DeleteServiceBinding, binding_id)?;
        state
            .bindings
            .remove(binding_id)
            .ok_or_else(|| PlatformError::not_found("service binding", binding_id))?;
        state
            .journal
            .push(PlatformCall::DeleteServiceBinding(binding_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl RouteManager for InMemoryPlatform {
    async fn read_route_mappings_by_app(
        &self,
        app_id: &str,
    ) -> Result<Vec<RouteMapping>, PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::ReadRouteMappings, app_id)?;
        Ok(state
            .mappings
            .values()
            .filter(|mapping| mapping.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn read_route_mappings_by_route(
        &self,
        route_id: &str,
    ) -> Result<Vec<RouteMapping>, PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::ReadRouteMappings, route_id)?;
        Ok(state
            .mappings
            .values()
            .filter(|mapping| mapping.route_id == route_id)
            .cloned()
            .collect())
    }

    async fn read_route_mapping(&self, mapping_id: &str) -> Result<RouteMapping, PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::ReadRouteMapping, mapping_id)?;
        state
            .mappings
            .get(mapping_id)
            .cloned()
            .ok_or_else(|| PlatformError::not_found("route mapping", mapping_id))
    }

    async fn create_route_mapping(
        &self,
        route_id: &str,
        app_id: &str,
        port: Option<u16>,
    ) -> Result<String, PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::CreateRouteMapping, route_id)?;
        let app_port = state.app(app_id)?.record.ports.iter().next().copied();
        let mapping = RouteMapping {
            mapping_id: Uuid::new_v4().to_string(),
            route_id: route_id.to_string(),
            app_id: app_id.to_string(),
            port: port.or(app_port),
        };
        let mapping_id = mapping.mapping_id.clone();
        state.mappings.insert(mapping_id.clone(), mapping);
        state.journal.push(PlatformCall::CreateRouteMapping {
            route_id: route_id.to_string(),
            app_id: app_id.to_string(),
        });
        Ok(mapping_id)
    }

    async fn delete_route_mapping(&self, mapping_id: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock().await;
        state.check(Operation::DeleteRouteMapping, mapping_id)?;
        state
            .mappings
            .remove(mapping_id)
            .ok_or_else(|| PlatformError::not_found("route mapping", mapping_id))?;
        state
            .journal
            .push(PlatformCall::DeleteRouteMapping(mapping_id.to_string()));
        Ok(())
    }
}

fn replace<T: Clone>(current: &mut Option<T>, incoming: &Option<T>) {
    if incoming.is_some() {
        *current = incoming.clone();
    }
}

/// Gzipped tarball of the application bits, extra content included.
fn package(path: &Path, add_content: &[AddContent]) -> Result<Bytes, anyhow::Error> {
    let tar_gz = BytesMut::new().writer();
    let enc = GzEncoder::new(tar_gz, Compression::default());
    let mut tar = tar::Builder::new(enc);
    if path.is_dir() {
        tar.append_dir_all(".", path)
            .with_context(|| format!("Can't package {}", path.display()))?;
    } else {
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("Can't package {}", path.display()))?;
        tar.append_path_with_name(path, name)
            .with_context(|| format!("Can't package {}", path.display()))?;
    }
    for content in add_content {
        tar.append_path_with_name(&content.source, &content.destination)
            .with_context(|| format!("Can't add {} to the package", content.source))?;
    }
    let tar_gz = tar.into_inner()?.finish()?;
    Ok(tar_gz.into_inner().freeze())
}

#[cfg(test)]
impl InMemoryPlatform {
    pub async fn fail_next(&self, operation: Operation, kind: FaultKind) {
        self.fail_after(operation, 0, kind).await
    }

    /// Lets `skip` calls of `operation` through, then fails the next one.
    pub async fn fail_after(&self, operation: Operation, skip: usize, kind: FaultKind) {
        self.state.lock().await.faults.push(Fault {
            operation,
            skip,
            kind,
        });
    }

    pub async fn journal(&self) -> Vec<PlatformCall> {
        self.state.lock().await.journal.clone()
    }

    pub async fn clear_journal(&self) {
        self.state.lock().await.journal.clear();
    }

    pub async fn applications(&self) -> Vec<ApplicationRecord> {
        let state = self.state.lock().await;
        state.apps.values().map(|app| app.record.clone()).collect()
    }

    /// Service instances bound to the application, sorted.
    pub async fn bindings_of(&self, app_id: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut instances: Vec<String> = state
            .bindings
            .values()
            .filter(|binding| binding.app_id == app_id)
            .map(|binding| binding.service_instance.clone())
            .collect();
        instances.sort();
        instances
    }

    pub async fn package_entries(&self, app_id: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let Some(package) = state.apps.get(app_id).and_then(|app| app.package.clone()) else {
            return vec![];
        };
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(package.as_ref()));
        let mut entries: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().display().to_string())
            .collect();
        entries.sort();
        entries
    }
}
