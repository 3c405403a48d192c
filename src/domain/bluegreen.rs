use log::{debug, error, info};

use super::{
    deposed::ResourceKind,
    error::{ReconcileError, ReconcileFailure},
    lifecycle,
    model::{AppPatch, AppResource, AppState, ApplicationSpec},
    routes::{BindMode, RouteReconciler},
    ReconciliationService,
};

/// Steps of a blue-green rollout, in the order they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RolloutPhase {
    Preparing,
    VenerableRenamed,
    ReplacementCreated,
    RoutesRebound,
    ScalingExchange,
    VenerableDeleting,
    Done,
    Failed,
}

/// Replaces a running application by a new one next to it, moving routes and
/// instances over before the old ("venerable") one is deleted.
///
/// The venerable id lands in the deposed set as soon as the replacement
/// exists. A rollout failing past that point leaves it there, and the next
/// reconciliation finishes the deletion.
pub struct BlueGreenOrchestrator<'a> {
    service: &'a ReconciliationService,
    phase: RolloutPhase,
}

impl<'a> BlueGreenOrchestrator<'a> {
    pub fn new(service: &'a ReconciliationService) -> Self {
        Self {
            service,
            phase: RolloutPhase::Preparing,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> RolloutPhase {
        self.phase
    }

    fn advance(&mut self, phase: RolloutPhase) {
        debug!("Blue-green rollout: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    pub async fn rollout(
        &mut self,
        observed: AppResource,
        desired: &ApplicationSpec,
    ) -> Result<AppResource, ReconcileFailure> {
        let mut resource = observed;
        info!(
            "Starting blue-green rollout of application {} ({})",
            resource.spec.name, resource.id
        );
        match self.run(&mut resource, desired).await {
            Ok(()) => {
                self.advance(RolloutPhase::Done);
                info!("Blue-green rollout of application {} done", resource.id);
                Ok(resource)
            }
            Err(e) => {
                error!(
                    "Blue-green rollout of application {} failed during {:?}: {}",
                    desired.name, self.phase, e
                );
                self.advance(RolloutPhase::Failed);
                Err(ReconcileFailure::with_state(e, resource))
            }
        }
    }

    async fn run(
        &mut self,
        resource: &mut AppResource,
        desired: &ApplicationSpec,
    ) -> Result<(), ReconcileError> {
        let apps = self.service.app_manager.as_ref();
        let settings = &self.service.settings;

        let venerable = apps.read_app(&resource.id).await?;
        let venerable_id = venerable.id.clone();
        let venerable_name = format!("{}{}", venerable.name, settings.venerable_suffix);
        resource.record = apps
            .update_app(&venerable_id, &AppPatch::rename(venerable_name.as_str()))
            .await?;
        info!("Renamed application {} to {}", venerable_id, venerable_name);
        self.advance(RolloutPhase::VenerableRenamed);

        let mut pinned = desired.clone();
        pinned.instances = 1;
        let replacement = lifecycle::create_with(
            self.service,
            &pinned,
            BindMode::Replacement {
                venerable_id: &venerable_id,
            },
        )
        .await?;
        let mut deposed = std::mem::take(&mut resource.deposed);
        deposed.record(venerable_id.as_str(), ResourceKind::Application);
        *resource = AppResource {
            deposed,
            ..replacement
        };
        self.advance(RolloutPhase::ReplacementCreated);

        if let Some(routes) = resource.spec.routes.as_mut() {
            RouteReconciler::new(self.service.route_manager.as_ref())
                .rebind(routes, &resource.id, &venerable_id)
                .await?;
        }
        self.advance(RolloutPhase::RoutesRebound);

        self.advance(RolloutPhase::ScalingExchange);
        let timeout = desired.timeout();
        let mut replacement_instances = resource.record.instances;
        let mut venerable_instances = venerable.instances;
        while replacement_instances < desired.instances || venerable_instances > 1 {
            if replacement_instances < desired.instances {
                replacement_instances += 1;
                resource.record = apps
                    .update_app(&resource.id, &AppPatch::scale(replacement_instances))
                    .await?;
                resource.spec.instances = replacement_instances;
                if resource.record.state != AppState::Stopped {
                    apps.wait_for_app_to_start(&resource.id, timeout).await?;
                }
            }
            if venerable_instances > 1 {
                venerable_instances -= 1;
                apps.update_app(&venerable_id, &AppPatch::scale(venerable_instances))
                    .await?;
                tokio::time::sleep(settings.drain_pause).await;
            }
            debug!(
                "Scaling exchange: replacement at {}, venerable at {}",
                replacement_instances, venerable_instances
            );
        }

        self.advance(RolloutPhase::VenerableDeleting);
        match apps.delete_app(&venerable_id, true).await {
            Ok(()) => info!("Deleted venerable application {}", venerable_id),
            Err(e) if e.is_not_found() => {
                debug!("Venerable application {} already deleted", venerable_id)
            }
            Err(e) => return Err(e.into()),
        }
        resource.deposed.forget(&venerable_id);

        resource.record = apps.read_app(&resource.id).await?;
        resource.spec.absorb(&resource.record);
        Ok(())
    }
}
