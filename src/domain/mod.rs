use std::{sync::Arc, time::Duration};

use error::ReconcileFailure;
use log::info;
use model::{AppResource, ApplicationSpec};
use port::{AppManager, ArtifactResolver, RouteManager};

pub mod bindings;
pub mod bluegreen;
pub mod classifier;
pub mod deposed;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod port;
pub mod routes;
pub mod upload;

#[cfg(test)]
pub(crate) mod fixtures;

pub struct ReconciliationService {
    pub app_manager: Arc<dyn AppManager>,
    pub route_manager: Arc<dyn RouteManager>,
    pub artifact_resolver: Arc<dyn ArtifactResolver>,
    pub settings: RolloutSettings,
}

/// Pauses and naming used while rolling out applications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutSettings {
    /// Wait before the platform is asked for the package state of fresh bits.
    pub staging_settle: Duration,
    /// Wait after a venerable instance is removed.
    pub drain_pause: Duration,
    pub venerable_suffix: String,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            staging_settle: Duration::from_secs(5),
            drain_pause: Duration::from_secs(5),
            venerable_suffix: "-venerable".to_string(),
        }
    }
}

pub enum Event {
    Create(ApplicationSpec),
    Update {
        desired: ApplicationSpec,
        observed: AppResource,
    },
    Delete(AppResource),
}

impl Event {
    /// Lifecycle phase for a pair of desired configuration and persisted
    /// resource. Nothing to do when neither exists.
    pub fn plan(desired: Option<ApplicationSpec>, observed: Option<AppResource>) -> Option<Event> {
        match (desired, observed) {
            (Some(desired), None) => Some(Event::Create(desired)),
            (Some(desired), Some(observed)) => Some(Event::Update { desired, observed }),
            (None, Some(observed)) => Some(Event::Delete(observed)),
            (None, None) => None,
        }
    }
}

/// Runs one reconciliation and returns the resource to persist, `None` once
/// the application is deleted.
///
/// On failure, [`ReconcileFailure::state`] holds the resource to persist in
/// place of the previous one; when it is `None`, the previous one stays valid.
pub async fn reconcile(
    event: Event,
    service: &ReconciliationService,
) -> Result<Option<AppResource>, ReconcileFailure> {
    match event {
        Event::Create(desired) => {
            info!("Creating application {}", desired.name);
            let resource = lifecycle::create(service, &desired).await?;
            Ok(Some(resource))
        }
        Event::Update { desired, observed } => {
            info!("Updating application {} ({})", desired.name, observed.id);
            let resource = lifecycle::update(service, observed, &desired).await?;
            Ok(Some(resource))
        }
        Event::Delete(observed) => {
            info!("Deleting application {} ({})", observed.spec.name, observed.id);
            lifecycle::delete(service, observed).await?;
            Ok(None)
        }
    }
}

pub async fn read_application(
    resource: AppResource,
    service: &ReconciliationService,
) -> Result<Option<AppResource>, ReconcileFailure> {
    lifecycle::read(service, resource).await
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::domain::{
        error::ReconcileError,
        fixtures::Harness,
        model::{AppSource, AppState, DockerSource, RouteConfig, RouteEntry, ServiceBinding},
        port::{AppManager, RouteManager},
    };
    use crate::infra::memory::{FaultKind, Operation, PlatformCall};

    async fn create(harness: &Harness, spec: ApplicationSpec) -> AppResource {
        reconcile(Event::Create(spec), &harness.service)
            .await
            .unwrap()
            .unwrap()
    }

    async fn update(harness: &Harness, observed: AppResource, desired: ApplicationSpec) -> AppResource {
        reconcile(Event::Update { desired, observed }, &harness.service)
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn plan_picks_the_lifecycle_phase() {
        let spec = ApplicationSpec::new("web", "space-1", AppSource::Url("file:///srv".to_string()));
        assert!(matches!(Event::plan(Some(spec.clone()), None), Some(Event::Create(_))));
        assert!(Event::plan(None, None).is_none());
    }

    #[tokio::test]
    async fn create_binds_and_starts_the_application() {
        let harness = Harness::new();
        let mut spec = harness.spec("web");
        spec.service_bindings = vec![ServiceBinding::new("db")];
        spec.routes = Some(RouteConfig::Set(BTreeSet::from([RouteEntry::new("route-1")])));

        let resource = create(&harness, spec).await;

        assert_eq!(resource.record.state, AppState::Started);
        assert!(!resource.spec.stopped);
        assert!(resource.spec.service_bindings[0].binding_id.is_some());
        let Some(RouteConfig::Set(routes)) = &resource.spec.routes else {
            panic!("route set expected");
        };
        assert!(routes.iter().all(|entry| entry.mapping_id.is_some()));
        assert_eq!(resource.spec.memory, Some(1024));
        assert_eq!(harness.platform.bindings_of(&resource.id).await, vec!["db".to_string()]);
    }

    #[tokio::test]
    async fn failed_create_deletes_the_application() {
        let harness = Harness::new();
        let mut spec = harness.spec("web");
        spec.service_bindings = vec![ServiceBinding::new("db")];
        harness
            .platform
            .fail_next(Operation::CreateServiceBinding, FaultKind::Reject("no such service".to_string()))
            .await;

        let failure = reconcile(Event::Create(spec), &harness.service)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ReconcileError::PartialBindingFailure { .. }));
        assert!(failure.state.is_none());
        assert!(harness.platform.applications().await.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_routes_mapped_elsewhere() {
        let harness = Harness::new();
        let other = harness.platform.create_app(&harness.patch("other")).await.unwrap();
        harness.platform.create_route_mapping("route-1", &other.id, None).await.unwrap();
        let mut spec = harness.spec("web");
        spec.routes = Some(RouteConfig::Set(BTreeSet::from([RouteEntry::new("route-1")])));

        let failure = reconcile(Event::Create(spec), &harness.service)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ReconcileError::ConflictingBinding { .. }));
        assert_eq!(harness.platform.applications().await.len(), 1);
    }

    #[tokio::test]
    async fn stopped_applications_are_not_started() {
        let harness = Harness::new();
        let mut spec = harness.spec("web");
        spec.stopped = true;

        let resource = create(&harness, spec).await;
        assert_eq!(resource.record.state, AppState::Stopped);
        assert!(!harness
            .platform
            .journal()
            .await
            .iter()
            .any(|call| matches!(call, PlatformCall::StartApp(_))));
    }

    #[tokio::test]
    async fn scaling_is_pushed_without_restart() {
        let harness = Harness::new();
        let spec = harness.spec("web");
        let resource = create(&harness, spec.clone()).await;
        harness.platform.clear_journal().await;

        let mut desired = spec;
        desired.instances = 3;
        let updated = update(&harness, resource.clone(), desired).await;

        assert_eq!(updated.id, resource.id);
        assert_eq!(updated.record.instances, 3);
        assert_eq!(
            harness.platform.journal().await,
            vec![PlatformCall::UpdateApp {
                app_id: resource.id.clone(),
                patch: model::AppPatch::scale(3),
            }]
        );
    }

    #[tokio::test]
    async fn environment_change_restages() {
        let harness = Harness::new();
        let spec = harness.spec("web");
        let resource = create(&harness, spec.clone()).await;
        harness.platform.clear_journal().await;

        let mut desired = spec;
        desired.environment = Some(BTreeMap::from([("MODE".to_string(), "prod".to_string())]));
        let updated = update(&harness, resource.clone(), desired).await;

        let journal = harness.platform.journal().await;
        assert!(journal.contains(&PlatformCall::RestageApp(resource.id.clone())));
        assert!(journal.contains(&PlatformCall::WaitForAppToStart(resource.id.clone())));
        assert_eq!(
            updated.spec.environment.unwrap().get("MODE").map(String::as_str),
            Some("prod")
        );
    }

    #[tokio::test]
    async fn restage_changes_made_while_stopping_are_not_lost() {
        let harness = Harness::new();
        let spec = harness.spec("web");
        let resource = create(&harness, spec.clone()).await;
        harness.platform.clear_journal().await;

        let mut stopping = spec.clone();
        stopping.stopped = true;
        stopping.buildpack = Some("go_buildpack".to_string());
        let stopped = update(&harness, resource.clone(), stopping.clone()).await;

        assert_eq!(stopped.record.state, AppState::Stopped);
        assert!(harness
            .platform
            .journal()
            .await
            .contains(&PlatformCall::RestageApp(resource.id.clone())));

        let mut restarting = stopping;
        restarting.stopped = false;
        let restarted = update(&harness, stopped, restarting).await;

        assert_eq!(restarted.record.state, AppState::Started);
        assert_eq!(restarted.spec.buildpack.as_deref(), Some("go_buildpack"));
    }

    #[tokio::test]
    async fn restage_keeps_a_stopped_application_stopped() {
        let harness = Harness::new();
        let mut spec = harness.spec("web");
        let running = create(&harness, spec.clone()).await;
        spec.stopped = true;
        let resource = update(&harness, running, spec.clone()).await;
        harness.platform.clear_journal().await;

        let mut desired = spec;
        desired.buildpack = Some("go_buildpack".to_string());
        let updated = update(&harness, resource.clone(), desired).await;

        assert_eq!(updated.record.state, AppState::Stopped);
        let journal = harness.platform.journal().await;
        assert!(journal.contains(&PlatformCall::RestageApp(resource.id.clone())));
        assert!(!journal.contains(&PlatformCall::WaitForAppToStart(resource.id.clone())));
    }

    #[tokio::test]
    async fn reconciliation_runs_on_a_spawned_task() {
        let harness = Harness::new();
        let mut spec = harness.spec("web");
        spec.service_bindings = vec![ServiceBinding::new("db")];
        let resource = create(&harness, spec.clone()).await;
        let Harness {
            platform,
            service,
            workdir: _workdir,
        } = harness;
        let service = Arc::new(service);

        let mut desired = spec;
        desired.service_bindings.clear();
        let updated = tokio::spawn({
            let service = service.clone();
            async move {
                reconcile(
                    Event::Update {
                        desired,
                        observed: resource,
                    },
                    &service,
                )
                .await
            }
        })
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert!(platform.bindings_of(&updated.id).await.is_empty());

        let outcome = tokio::spawn(async move { reconcile(Event::Delete(updated), &service).await })
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_none());
        assert!(platform.applications().await.is_empty());
    }

    #[tokio::test]
    async fn failed_upload_prevents_any_start() {
        let harness = Harness::new();
        let spec = harness.spec("web");
        let resource = create(&harness, spec.clone()).await;
        harness.platform.clear_journal().await;
        harness
            .platform
            .fail_next(Operation::UploadApp, FaultKind::Reject("disk full".to_string()))
            .await;

        let mut desired = spec;
        desired.add_content = vec![model::AddContent {
            source: harness.workdir.path().join("index.html").display().to_string(),
            destination: "public/index.html".to_string(),
        }];
        desired.routes = Some(RouteConfig::Set(BTreeSet::from([RouteEntry::new("route-1")])));
        let failure = reconcile(
            Event::Update {
                desired,
                observed: resource.clone(),
            },
            &harness.service,
        )
        .await
        .unwrap_err();

        assert!(matches!(failure.error, ReconcileError::UploadFailure(_)));
        let state = failure.state.expect("partial state");
        assert!(state.spec.add_content.is_empty());
        assert!(matches!(state.spec.routes, Some(RouteConfig::Set(ref routes)) if routes.len() == 1));
        assert!(!harness.platform.journal().await.iter().any(|call| matches!(
            call,
            PlatformCall::StartApp(_) | PlatformCall::RestageApp(_) | PlatformCall::StopApp(_)
        )));
    }

    #[tokio::test]
    async fn partial_binding_failure_keeps_created_bindings_in_state() {
        let harness = Harness::new();
        let spec = harness.spec("web");
        let resource = create(&harness, spec.clone()).await;
        harness
            .platform
            .fail_after(Operation::CreateServiceBinding, 1, FaultKind::Reject("quota".to_string()))
            .await;

        let mut desired = spec;
        desired.service_bindings = vec![ServiceBinding::new("db"), ServiceBinding::new("queue")];
        let failure = reconcile(
            Event::Update {
                desired,
                observed: resource,
            },
            &harness.service,
        )
        .await
        .unwrap_err();

        let state = failure.state.expect("partial state");
        assert_eq!(state.spec.service_bindings.len(), 1);
        assert_eq!(state.spec.service_bindings[0].service_instance, "db");
        assert!(state.spec.service_bindings[0].binding_id.is_some());
    }

    #[tokio::test]
    async fn switching_to_docker_replaces_the_application() {
        let harness = Harness::new();
        let spec = harness.spec("web");
        let resource = create(&harness, spec.clone()).await;

        let mut desired = spec;
        desired.source = AppSource::Docker(DockerSource {
            image: "nginx:1.27".to_string(),
            credentials: None,
        });
        let replaced = update(&harness, resource.clone(), desired).await;

        assert_ne!(replaced.id, resource.id);
        assert_eq!(replaced.record.docker_image.as_deref(), Some("nginx:1.27"));
        assert!(harness.platform.read_app(&resource.id).await.unwrap_err().is_not_found());
        assert!(harness
            .platform
            .journal()
            .await
            .contains(&PlatformCall::StartDockerApp(replaced.id.clone())));
    }

    #[tokio::test]
    async fn blue_green_rollout_runs_for_restart_changes() {
        let harness = Harness::new();
        let mut spec = harness.spec("web");
        spec.blue_green.enable = true;
        let resource = create(&harness, spec.clone()).await;

        let mut desired = spec;
        desired.memory = Some(2048);
        let rolled = update(&harness, resource.clone(), desired).await;

        assert_ne!(rolled.id, resource.id);
        assert_eq!(rolled.record.memory, Some(2048));
        assert!(rolled.deposed.is_empty());
    }

    #[tokio::test]
    async fn update_sweeps_leftover_deposed_applications() {
        let harness = Harness::new();
        let spec = harness.spec("web");
        let mut resource = create(&harness, spec.clone()).await;
        let leftover = harness.platform.create_app(&harness.patch("web-venerable")).await.unwrap();
        resource
            .deposed
            .record(leftover.id.clone(), deposed::ResourceKind::Application);

        let updated = update(&harness, resource, spec).await;

        assert!(updated.deposed.is_empty());
        assert!(harness.platform.read_app(&leftover.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_releases_everything_and_tolerates_missing_pieces() {
        let harness = Harness::new();
        let mut spec = harness.spec("web");
        spec.service_bindings = vec![ServiceBinding::new("db")];
        spec.routes = Some(RouteConfig::Set(BTreeSet::from([RouteEntry::new("route-1")])));
        let mut resource = create(&harness, spec).await;
        resource.spec.service_bindings.push(ServiceBinding {
            binding_id: Some("binding-404".to_string()),
            ..ServiceBinding::new("gone")
        });

        let outcome = reconcile(Event::Delete(resource.clone()), &harness.service)
            .await
            .unwrap();

        assert!(outcome.is_none());
        assert!(harness.platform.applications().await.is_empty());
        assert!(harness
            .platform
            .read_route_mappings_by_route("route-1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn read_returns_none_once_the_application_is_gone() {
        let harness = Harness::new();
        let resource = create(&harness, harness.spec("web")).await;
        harness.platform.delete_app(&resource.id, true).await.unwrap();

        assert!(read_application(resource, &harness.service).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_mirrors_drift_and_prunes_deposed() {
        let harness = Harness::new();
        let mut resource = create(&harness, harness.spec("web")).await;
        resource
            .deposed
            .record("already-gone", deposed::ResourceKind::Application);
        harness
            .platform
            .update_app(&resource.id, &model::AppPatch::scale(5))
            .await
            .unwrap();

        let refreshed = read_application(resource, &harness.service)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(refreshed.spec.instances, 5);
        assert!(refreshed.deposed.is_empty());
    }
}
