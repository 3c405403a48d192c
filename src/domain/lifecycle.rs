use std::collections::BTreeSet;

use log::{debug, info, warn};

use super::{
    bindings::{self, BindingReconciler},
    bluegreen::BlueGreenOrchestrator,
    classifier::{classify, ChangeSet, ChangeTier},
    deposed::DeposedResources,
    error::{ReconcileError, ReconcileFailure},
    model::{
        AppPatch, AppResource, AppState, ApplicationRecord, ApplicationSpec, Artifact,
        LegacyRoutes, PackageState, RouteConfig,
    },
    routes::{BindMode, RouteReconciler},
    upload::{UploadCoordinator, UploadHandle},
    ReconciliationService,
};

pub async fn create(
    service: &ReconciliationService,
    desired: &ApplicationSpec,
) -> Result<AppResource, ReconcileError> {
    create_with(service, desired, BindMode::Fresh).await
}

/// Creates the application and everything hanging off it. Once the
/// application exists, any failure deletes it again before the error is
/// returned.
pub async fn create_with(
    service: &ReconciliationService,
    desired: &ApplicationSpec,
    mode: BindMode<'_>,
) -> Result<AppResource, ReconcileError> {
    desired.validate()?;
    let artifact = service
        .artifact_resolver
        .resolve(&desired.name, &desired.source)
        .await
        .map_err(ReconcileError::Artifact)?;
    if let Some(routes) = &desired.routes {
        RouteReconciler::new(service.route_manager.as_ref())
            .preflight(routes, mode)
            .await?;
    }

    let record = service
        .app_manager
        .create_app(&AppPatch::from_spec(desired))
        .await?;
    info!("Created application {} with id {}", desired.name, record.id);

    let mut spec = desired.clone();
    match provision(service, &mut spec, &record.id, artifact, mode).await {
        Ok(record) => {
            spec.absorb(&record);
            Ok(AppResource {
                id: record.id.clone(),
                spec,
                record,
                deposed: DeposedResources::default(),
            })
        }
        Err(e) => {
            warn!(
                "Creation of application {} failed, deleting it: {}",
                desired.name, e
            );
            if let Err(cleanup) = service.app_manager.delete_app(&record.id, true).await {
                warn!("Can't delete application {}: {}", record.id, cleanup);
            }
            Err(e)
        }
    }
}

async fn provision(
    service: &ReconciliationService,
    spec: &mut ApplicationSpec,
    app_id: &str,
    artifact: Artifact,
    mode: BindMode<'_>,
) -> Result<ApplicationRecord, ReconcileError> {
    let apps = service.app_manager.as_ref();
    let upload = UploadCoordinator::dispatch(
        service.app_manager.clone(),
        app_id,
        artifact,
        spec.add_content.clone(),
    );

    if let Err(e) = attach(service, spec, app_id, mode).await {
        upload.settle().await;
        return Err(e);
    }
    upload.join().await?;

    if !spec.stopped {
        if spec.is_docker() {
            apps.start_docker_app(app_id, spec.timeout()).await?;
        } else {
            apps.start_app(app_id, spec.timeout()).await?;
        }
        info!("Started application {}", app_id);
    }
    Ok(apps.read_app(app_id).await?)
}

async fn attach(
    service: &ReconciliationService,
    spec: &mut ApplicationSpec,
    app_id: &str,
    mode: BindMode<'_>,
) -> Result<(), ReconcileError> {
    if !spec.service_bindings.is_empty() {
        let wanted = std::mem::take(&mut spec.service_bindings);
        spec.service_bindings = BindingReconciler::new(service.app_manager.as_ref())
            .add(app_id, wanted)
            .await?;
    }
    if let Some(routes) = spec.routes.as_mut() {
        RouteReconciler::new(service.route_manager.as_ref())
            .bind_on_create(routes, app_id, mode)
            .await?;
    }
    Ok(())
}

/// Moves an existing application to `desired`.
///
/// Deposed leftovers of an earlier rollout are swept first. Then the change
/// decides the path: a source kind switch replaces the application, bigger
/// changes of a blue-green application roll out a new one, anything else is
/// applied in place.
pub async fn update(
    service: &ReconciliationService,
    observed: AppResource,
    desired: &ApplicationSpec,
) -> Result<AppResource, ReconcileFailure> {
    let mut observed = observed;
    if let Err(e) = desired.validate() {
        return Err(ReconcileFailure::with_state(e, observed));
    }
    if !observed.deposed.is_empty() {
        observed.deposed = std::mem::take(&mut observed.deposed)
            .sweep(service.app_manager.as_ref())
            .await;
    }

    let changes = classify(&observed.spec, desired);
    if changes.is_empty() {
        debug!("Application {} is up to date", observed.id);
        return Ok(observed);
    }
    if changes.replace {
        info!(
            "Source of application {} changed kind, replacing it",
            observed.id
        );
        delete(service, observed).await?;
        return Ok(create(service, desired).await?);
    }
    if desired.blue_green.enable && changes.needs_new_instance() {
        return BlueGreenOrchestrator::new(service)
            .rollout(observed, desired)
            .await;
    }
    standard_update(service, observed, desired, &changes).await
}

/// Applies the change to the running application. Progress made before a
/// failure is kept in the returned state.
pub async fn standard_update(
    service: &ReconciliationService,
    observed: AppResource,
    desired: &ApplicationSpec,
    changes: &ChangeSet,
) -> Result<AppResource, ReconcileFailure> {
    let mut next = observed;
    match apply(service, &mut next, desired, changes).await {
        Ok(()) => Ok(next),
        Err(e) => {
            warn!("Update of application {} failed: {}", next.id, e);
            Err(ReconcileFailure::with_state(e, next))
        }
    }
}

async fn apply(
    service: &ReconciliationService,
    next: &mut AppResource,
    desired: &ApplicationSpec,
    changes: &ChangeSet,
) -> Result<(), ReconcileError> {
    let apps = service.app_manager.as_ref();
    let app_id = next.id.clone();
    let timeout = desired.timeout();
    let was_started = next.record.state == AppState::Started;

    if changes.tier > ChangeTier::None {
        debug!("Pushing {:?} to application {}", changes.patch, app_id);
        next.record = apps.update_app(&app_id, &changes.patch).await?;
        next.spec.adopt_attributes(desired);
        next.spec.absorb(&next.record);
    }

    let upload = if changes.binary_changed {
        let artifact = service
            .artifact_resolver
            .resolve(&desired.name, &desired.source)
            .await
            .map_err(ReconcileError::Artifact)?;
        UploadCoordinator::dispatch(
            service.app_manager.clone(),
            &app_id,
            artifact,
            desired.add_content.clone(),
        )
    } else {
        UploadHandle::ready()
    };

    let mut restage = changes.tier == ChangeTier::Restage;
    let mut restart = changes.tier == ChangeTier::Restart;
    let attached = async {
        if changes.bindings_changed {
            update_bindings(service, next, desired).await?;
            restage = true;
        }
        if changes.routes_changed {
            update_routes(service, next, desired).await?;
        }
        Ok::<(), ReconcileError>(())
    }
    .await;
    if let Err(e) = attached {
        upload.settle().await;
        return Err(e);
    }
    upload.join().await?;

    if changes.binary_changed {
        next.spec.source = desired.source.clone();
        next.spec.add_content = desired.add_content.clone();
    }
    if changes.binary_changed || restage {
        tokio::time::sleep(service.settings.staging_settle).await;
        let record = apps.read_app(&app_id).await?;
        if record.package_state == PackageState::Pending {
            debug!("Package of application {} is pending, restarting it", app_id);
            restage = false;
            restart = true;
        } else {
            restage = true;
        }
    }

    // restage even when stopping, the new droplet is needed on the next start
    let mut started = false;
    if restage {
        info!("Restaging application {}", app_id);
        apps.restage_app(&app_id, timeout).await?;
        if was_started {
            apps.wait_for_app_to_start(&app_id, timeout).await?;
        }
        started = true;
    } else if restart && !desired.stopped {
        info!("Restarting application {}", app_id);
        apps.stop_app(&app_id, timeout).await?;
        apps.start_app(&app_id, timeout).await?;
        started = true;
    }

    if desired.stopped {
        if changes.stopped_changed || started {
            info!("Stopping application {}", app_id);
            apps.stop_app(&app_id, timeout).await?;
        }
    } else if changes.stopped_changed && !started {
        info!("Starting application {}", app_id);
        apps.start_app(&app_id, timeout).await?;
    }

    next.record = apps.read_app(&app_id).await?;
    next.spec.adopt_attributes(desired);
    next.spec.absorb(&next.record);
    Ok(())
}

async fn update_bindings(
    service: &ReconciliationService,
    next: &mut AppResource,
    desired: &ApplicationSpec,
) -> Result<(), ReconcileError> {
    let reconciler = BindingReconciler::new(service.app_manager.as_ref());
    let (to_delete, to_add) = bindings::diff(&next.spec.service_bindings, &desired.service_bindings);

    reconciler.remove(&to_delete).await?;
    next.spec.service_bindings.retain(|binding| {
        !to_delete
            .iter()
            .any(|gone| gone.service_instance == binding.service_instance)
    });

    match reconciler.add(&next.id, to_add).await {
        Ok(added) => {
            next.spec.service_bindings =
                bindings::merge_ids(&desired.service_bindings, &next.spec.service_bindings, &added);
            Ok(())
        }
        Err(ReconcileError::PartialBindingFailure { bound, source }) => {
            next.spec.service_bindings.extend(bound.iter().cloned());
            Err(ReconcileError::PartialBindingFailure { bound, source })
        }
        Err(e) => Err(e),
    }
}

async fn update_routes(
    service: &ReconciliationService,
    next: &mut AppResource,
    desired: &ApplicationSpec,
) -> Result<(), ReconcileError> {
    let routes = RouteReconciler::new(service.route_manager.as_ref());
    let app_id = next.id.as_str();
    let (current, result) = match (next.spec.routes.take(), &desired.routes) {
        (Some(RouteConfig::Legacy(mut current)), Some(RouteConfig::Legacy(wanted))) => {
            let result = routes.reconcile_legacy(&mut current, wanted, app_id).await;
            (Some(RouteConfig::Legacy(current)), result)
        }
        (Some(RouteConfig::Legacy(current)), Some(RouteConfig::Set(wanted))) => {
            match routes.migrate_legacy(&current, wanted, app_id).await {
                Ok(migrated) => (Some(RouteConfig::Set(migrated)), Ok(())),
                Err(e) => (Some(RouteConfig::Legacy(current)), Err(e)),
            }
        }
        (Some(RouteConfig::Set(mut current)), Some(RouteConfig::Set(wanted))) => {
            let result = routes.reconcile_set(&mut current, wanted, app_id).await;
            (Some(RouteConfig::Set(current)), result)
        }
        (Some(RouteConfig::Set(mut current)), Some(RouteConfig::Legacy(wanted))) => {
            let mut result = routes.reconcile_set(&mut current, &BTreeSet::new(), app_id).await;
            if result.is_ok() {
                let mut legacy = LegacyRoutes::default();
                result = routes.reconcile_legacy(&mut legacy, wanted, app_id).await;
                (Some(RouteConfig::Legacy(legacy)), result)
            } else {
                (Some(RouteConfig::Set(current)), result)
            }
        }
        (None, Some(RouteConfig::Legacy(wanted))) => {
            let mut legacy = LegacyRoutes::default();
            let result = routes.reconcile_legacy(&mut legacy, wanted, app_id).await;
            (Some(RouteConfig::Legacy(legacy)), result)
        }
        (None, Some(RouteConfig::Set(wanted))) => {
            let mut current = BTreeSet::new();
            let result = routes.reconcile_set(&mut current, wanted, app_id).await;
            (Some(RouteConfig::Set(current)), result)
        }
        (Some(current), None) => match routes.unbind_all(&current).await {
            Ok(()) => (None, Ok(())),
            Err(e) => (Some(current), Err(e)),
        },
        (None, None) => (None, Ok(())),
    };
    next.spec.routes = current;
    result
}

/// Tears the application down. Bindings and route mappings go first; the
/// application deletion itself never fails the operation so the resource can
/// be dropped from state.
pub async fn delete(
    service: &ReconciliationService,
    resource: AppResource,
) -> Result<(), ReconcileFailure> {
    let mut resource = resource;
    resource.deposed = std::mem::take(&mut resource.deposed)
        .sweep(service.app_manager.as_ref())
        .await;

    if let Err(e) = release(service, &resource.spec).await {
        return Err(ReconcileFailure::with_state(e, resource));
    }
    match service.app_manager.delete_app(&resource.id, false).await {
        Ok(()) => info!("Deleted application {}", resource.id),
        Err(e) => warn!("Can't delete application {}: {}", resource.id, e),
    }
    Ok(())
}

async fn release(
    service: &ReconciliationService,
    spec: &ApplicationSpec,
) -> Result<(), ReconcileError> {
    BindingReconciler::new(service.app_manager.as_ref())
        .remove(&spec.service_bindings)
        .await?;
    if let Some(routes) = &spec.routes {
        RouteReconciler::new(service.route_manager.as_ref())
            .unbind_all(routes)
            .await?;
    }
    Ok(())
}

/// Refreshes the resource from the platform. `None` means the application is
/// gone.
pub async fn read(
    service: &ReconciliationService,
    resource: AppResource,
) -> Result<Option<AppResource>, ReconcileFailure> {
    let record = match service.app_manager.read_app(&resource.id).await {
        Err(e) if e.is_not_found() => {
            info!("Application {} no longer exists", resource.id);
            return Ok(None);
        }
        result => result?,
    };

    let mut resource = resource;
    resource.spec.absorb(&record);
    resource.record = record;
    if let Some(routes) = &resource.spec.routes {
        resource.spec.routes = Some(
            RouteReconciler::new(service.route_manager.as_ref())
                .refresh(routes, &resource.id)
                .await?,
        );
    }
    resource.deposed = std::mem::take(&mut resource.deposed)
        .reconcile_on_read(service.app_manager.as_ref())
        .await;
    Ok(Some(resource))
}
