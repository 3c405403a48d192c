use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    time::Duration,
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{deposed::DeposedResources, error::ReconcileError};

/// Timeout (in seconds) applied to start, restage and wait operations when the
/// configuration does not set one.
pub const DEFAULT_APP_TIMEOUT: u64 = 60;

/// Desired configuration of an application, as declared by the caller.
///
/// The same shape doubles as the applied configuration stored in
/// [`AppResource`]: once applied, binding ids, mapping ids and the values the
/// platform computed are stamped back into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub name: String,
    pub space: String,
    pub ports: Option<BTreeSet<u16>>,
    #[serde(default = "default_instances")]
    pub instances: u32,
    pub memory: Option<u32>,
    pub disk_quota: Option<u32>,
    pub stack: Option<String>,
    pub buildpack: Option<String>,
    pub command: Option<String>,
    pub enable_ssh: Option<bool>,
    #[serde(default)]
    pub health_check_type: HealthCheckType,
    pub health_check_http_endpoint: Option<String>,
    pub health_check_timeout: Option<u32>,
    pub environment: Option<BTreeMap<String, String>>,
    pub source: AppSource,
    #[serde(default)]
    pub add_content: Vec<AddContent>,
    #[serde(default)]
    pub service_bindings: Vec<ServiceBinding>,
    #[serde(default)]
    pub routes: Option<RouteConfig>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default)]
    pub blue_green: BlueGreen,
}

fn default_instances() -> u32 {
    1
}

fn default_timeout() -> u64 {
    DEFAULT_APP_TIMEOUT
}

impl ApplicationSpec {
    pub fn new(name: impl Into<String>, space: impl Into<String>, source: AppSource) -> Self {
        Self {
            name: name.into(),
            space: space.into(),
            ports: None,
            instances: default_instances(),
            memory: None,
            disk_quota: None,
            stack: None,
            buildpack: None,
            command: None,
            enable_ssh: None,
            health_check_type: HealthCheckType::default(),
            health_check_http_endpoint: None,
            health_check_timeout: None,
            environment: None,
            source,
            add_content: vec![],
            service_bindings: vec![],
            routes: None,
            timeout: default_timeout(),
            stopped: false,
            blue_green: BlueGreen::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn is_docker(&self) -> bool {
        matches!(self.source, AppSource::Docker(_))
    }

    /// Boundary checks the declarative layer does not express structurally.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.name.is_empty() {
            return Err(ReconcileError::InvalidConfig(
                "application name must not be empty".to_string(),
            ));
        }
        if self.space.is_empty() {
            return Err(ReconcileError::InvalidConfig(format!(
                "application {} has no space",
                self.name
            )));
        }
        if self.instances == 0 {
            return Err(ReconcileError::InvalidConfig(format!(
                "application {} needs at least one instance",
                self.name
            )));
        }
        if self.is_docker() && !self.add_content.is_empty() {
            return Err(ReconcileError::InvalidConfig(
                "'add_content' cannot be used with a docker image".to_string(),
            ));
        }
        let duplicated = self
            .service_bindings
            .iter()
            .map(|binding| binding.service_instance.as_str())
            .duplicates()
            .join(", ");
        if !duplicated.is_empty() {
            return Err(ReconcileError::InvalidConfig(format!(
                "service instances bound more than once: {}",
                duplicated
            )));
        }
        match &self.routes {
            Some(RouteConfig::Legacy(legacy)) => {
                if legacy.stage.route().is_some() != legacy.live.route().is_some() {
                    return Err(ReconcileError::InvalidConfig(
                        "both 'stage_route' and 'live_route' need to be provided to deploy the app using blue-green routing".to_string(),
                    ));
                }
            }
            Some(RouteConfig::Set(entries)) => {
                if entries.is_empty() {
                    return Err(ReconcileError::InvalidConfig(
                        "'routes' must contain at least one route".to_string(),
                    ));
                }
                if entries.iter().any(|entry| entry.route.is_empty()) {
                    return Err(ReconcileError::InvalidConfig(
                        "route ids in 'routes' must not be empty".to_string(),
                    ));
                }
                if entries.iter().any(|entry| entry.port == Some(0)) {
                    return Err(ReconcileError::InvalidConfig(
                        "route port must be between 1 and 65535".to_string(),
                    ));
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Takes over every plain attribute of `desired`, leaving the parts that
    /// are reconciled separately (source, bindings, routes, stopped) untouched.
    pub fn adopt_attributes(&mut self, desired: &ApplicationSpec) {
        self.name = desired.name.clone();
        self.space = desired.space.clone();
        self.instances = desired.instances;
        self.health_check_type = desired.health_check_type;
        self.timeout = desired.timeout;
        self.blue_green = desired.blue_green.clone();
        adopt(&mut self.ports, &desired.ports);
        adopt(&mut self.memory, &desired.memory);
        adopt(&mut self.disk_quota, &desired.disk_quota);
        adopt(&mut self.stack, &desired.stack);
        adopt(&mut self.buildpack, &desired.buildpack);
        adopt(&mut self.command, &desired.command);
        adopt(&mut self.enable_ssh, &desired.enable_ssh);
        adopt(&mut self.health_check_http_endpoint, &desired.health_check_http_endpoint);
        adopt(&mut self.health_check_timeout, &desired.health_check_timeout);
        adopt(&mut self.environment, &desired.environment);
        // docker image changes are pushed as plain attributes
        if self.is_docker() && desired.is_docker() {
            self.source = desired.source.clone();
        }
    }

    /// Mirrors the platform's view of the application back into the
    /// configuration.
    pub fn absorb(&mut self, record: &ApplicationRecord) {
        self.name = record.name.clone();
        self.space = record.space.clone();
        self.instances = record.instances;
        self.health_check_type = record.health_check_type;
        self.stopped = record.state != AppState::Started;
        adopt(&mut self.memory, &record.memory);
        adopt(&mut self.disk_quota, &record.disk_quota);
        adopt(&mut self.stack, &record.stack);
        adopt(&mut self.buildpack, &record.buildpack);
        adopt(&mut self.command, &record.command);
        adopt(&mut self.enable_ssh, &record.enable_ssh);
        adopt(&mut self.health_check_http_endpoint, &record.health_check_http_endpoint);
        adopt(&mut self.health_check_timeout, &record.health_check_timeout);
        if !record.ports.is_empty() {
            self.ports = Some(record.ports.clone());
        }
        if !record.environment.is_empty() || self.environment.is_some() {
            self.environment = Some(record.environment.clone());
        }
        if let (AppSource::Docker(docker), Some(image)) = (&mut self.source, &record.docker_image) {
            docker.image = image.clone();
        }
    }
}

fn adopt<T: Clone>(current: &mut Option<T>, incoming: &Option<T>) {
    if incoming.is_some() {
        *current = incoming.clone();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    #[default]
    Port,
    Process,
    Http,
    None,
}

/// Where the application's bits come from. Exactly one kind is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppSource {
    Url(String),
    Git(GitSource),
    GithubRelease(ReleaseSource),
    Docker(DockerSource),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Url,
    Git,
    GithubRelease,
    Docker,
}

impl AppSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            AppSource::Url(_) => SourceKind::Url,
            AppSource::Git(_) => SourceKind::Git,
            AppSource::GithubRelease(_) => SourceKind::GithubRelease,
            AppSource::Docker(_) => SourceKind::Docker,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSource {
    pub url: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSource {
    pub owner: String,
    pub repo: String,
    pub version: String,
    pub filename: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerSource {
    pub image: String,
    pub credentials: Option<BTreeMap<String, String>>,
}

/// Extra file copied into the application package at `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddContent {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueGreen {
    #[serde(default)]
    pub enable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub service_instance: String,
    #[serde(default)]
    pub params: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub binding_id: Option<String>,
}

impl ServiceBinding {
    pub fn new(service_instance: impl Into<String>) -> Self {
        Self {
            service_instance: service_instance.into(),
            params: None,
            binding_id: None,
        }
    }
}

/// Route configuration, either the deprecated slot block or the route set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteConfig {
    #[serde(rename = "route")]
    Legacy(LegacyRoutes),
    #[serde(rename = "routes")]
    Set(BTreeSet<RouteEntry>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RouteSlot {
    Default,
    Stage,
    Live,
}

impl RouteSlot {
    pub const ALL: [RouteSlot; 3] = [RouteSlot::Default, RouteSlot::Stage, RouteSlot::Live];

    pub fn name(&self) -> &'static str {
        match self {
            RouteSlot::Default => "default_route",
            RouteSlot::Stage => "stage_route",
            RouteSlot::Live => "live_route",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyRoutes {
    #[serde(default)]
    pub default: SlotBinding,
    #[serde(default)]
    pub stage: SlotBinding,
    #[serde(default)]
    pub live: SlotBinding,
}

impl LegacyRoutes {
    pub fn slot(&self, slot: RouteSlot) -> &SlotBinding {
        match slot {
            RouteSlot::Default => &self.default,
            RouteSlot::Stage => &self.stage,
            RouteSlot::Live => &self.live,
        }
    }

    pub fn slot_mut(&mut self, slot: RouteSlot) -> &mut SlotBinding {
        match slot {
            RouteSlot::Default => &mut self.default,
            RouteSlot::Stage => &mut self.stage,
            RouteSlot::Live => &mut self.live,
        }
    }
}

/// One legacy slot: the route it points at and the mapping that binds it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBinding {
    pub route: Option<String>,
    pub mapping_id: Option<String>,
}

impl SlotBinding {
    pub fn to(route: impl Into<String>) -> Self {
        Self {
            route: Some(route.into()),
            mapping_id: None,
        }
    }

    /// The configured route, with empty strings read as unset.
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref().filter(|route| !route.is_empty())
    }

    pub fn mapping_id(&self) -> Option<&str> {
        self.mapping_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Member of the route set. Identity is the route id alone; port and mapping
/// id are filled in by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub route: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub mapping_id: Option<String>,
}

impl RouteEntry {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            port: None,
            mapping_id: None,
        }
    }
}

impl PartialEq for RouteEntry {
    fn eq(&self, other: &Self) -> bool {
        self.route == other.route
    }
}

impl Eq for RouteEntry {}

impl PartialOrd for RouteEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RouteEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.route.cmp(&other.route)
    }
}

/// Association between a route and an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMapping {
    pub mapping_id: String,
    pub route_id: String,
    pub app_id: String,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppState {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageState {
    Pending,
    Staged,
    Failed,
}

/// The platform's view of a deployed application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub id: String,
    pub name: String,
    pub space: String,
    pub instances: u32,
    pub memory: Option<u32>,
    pub disk_quota: Option<u32>,
    pub stack: Option<String>,
    pub buildpack: Option<String>,
    pub command: Option<String>,
    pub enable_ssh: Option<bool>,
    pub health_check_type: HealthCheckType,
    pub health_check_http_endpoint: Option<String>,
    pub health_check_timeout: Option<u32>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: BTreeSet<u16>,
    pub docker_image: Option<String>,
    pub state: AppState,
    pub package_state: PackageState,
}

/// Attribute payload sent to the platform: the full set on create, only the
/// changed fields on update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_ssh: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<BTreeSet<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_quota: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_type: Option<HealthCheckType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_http_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_timeout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buildpack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_credentials: Option<BTreeMap<String, String>>,
}

impl AppPatch {
    pub fn from_spec(spec: &ApplicationSpec) -> Self {
        let (docker_image, docker_credentials) = match &spec.source {
            AppSource::Docker(docker) => (Some(docker.image.clone()), docker.credentials.clone()),
            _ => (None, None),
        };
        Self {
            name: Some(spec.name.clone()),
            space: Some(spec.space.clone()),
            instances: Some(spec.instances),
            enable_ssh: spec.enable_ssh,
            ports: spec.ports.clone(),
            memory: spec.memory,
            disk_quota: spec.disk_quota,
            command: spec.command.clone(),
            health_check_type: Some(spec.health_check_type),
            health_check_http_endpoint: spec.health_check_http_endpoint.clone(),
            health_check_timeout: spec.health_check_timeout,
            buildpack: spec.buildpack.clone(),
            stack: spec.stack.clone(),
            environment: spec.environment.clone(),
            docker_image,
            docker_credentials,
        }
    }

    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn scale(instances: u32) -> Self {
        Self {
            instances: Some(instances),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Local bits ready for upload, or a container image the platform pulls itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Local { path: PathBuf, ephemeral: bool },
    Image(String),
}

/// Everything the caller persists between two reconciliations of one
/// application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppResource {
    pub id: String,
    pub spec: ApplicationSpec,
    pub record: ApplicationRecord,
    #[serde(default)]
    pub deposed: DeposedResources,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ApplicationSpec {
        ApplicationSpec::new("web", "space-1", AppSource::Url("file:///srv/web".to_string()))
    }

    #[test]
    fn binding_the_same_instance_twice_is_rejected() {
        let mut spec = spec();
        spec.service_bindings = vec![
            ServiceBinding::new("db"),
            ServiceBinding::new("cache"),
            ServiceBinding::new("db"),
        ];

        let error = spec.validate().unwrap_err();

        assert!(matches!(error, ReconcileError::InvalidConfig(message) if message.ends_with(": db")));
    }

    #[test]
    fn empty_route_set_is_rejected() {
        let mut spec = spec();
        spec.routes = Some(RouteConfig::Set(BTreeSet::new()));

        assert!(matches!(spec.validate(), Err(ReconcileError::InvalidConfig(_))));
    }

    #[test]
    fn zero_instances_are_rejected() {
        let mut spec = spec();
        spec.instances = 0;

        assert!(matches!(spec.validate(), Err(ReconcileError::InvalidConfig(_))));
    }

    #[test]
    fn plain_spec_is_valid() {
        assert!(spec().validate().is_ok());
    }
}
