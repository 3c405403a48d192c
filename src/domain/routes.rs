use std::collections::BTreeSet;

use log::{debug, info};

use super::{
    error::ReconcileError,
    model::{LegacyRoutes, RouteConfig, RouteEntry, RouteMapping, RouteSlot, SlotBinding},
    port::RouteManager,
};

/// Whether two route configurations point at different routes. Mapping ids
/// and ports are platform-assigned and ignored.
pub fn routes_differ(old: Option<&RouteConfig>, new: Option<&RouteConfig>) -> bool {
    match (old, new) {
        (None, None) => false,
        (Some(RouteConfig::Legacy(old)), Some(RouteConfig::Legacy(new))) => RouteSlot::ALL
            .iter()
            .any(|slot| old.slot(*slot).route() != new.slot(*slot).route()),
        (Some(RouteConfig::Set(old)), Some(RouteConfig::Set(new))) => old != new,
        _ => true,
    }
}

/// How a freshly created application gets its routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode<'a> {
    /// A brand-new application: default and live slots, or the whole set.
    Fresh,
    /// The replacement of a blue-green rollout: only the stage slot. The rest
    /// moves over once the replacement is up, see [`RouteReconciler::rebind`].
    Replacement { venerable_id: &'a str },
}

impl BindMode<'_> {
    /// Application the routes may already be mapped to.
    fn owner(&self) -> &str {
        match self {
            BindMode::Fresh => "",
            BindMode::Replacement { venerable_id } => venerable_id,
        }
    }
}

pub struct RouteReconciler<'a> {
    routes: &'a dyn RouteManager,
}

impl<'a> RouteReconciler<'a> {
    pub fn new(routes: &'a dyn RouteManager) -> Self {
        Self { routes }
    }

    /// Ensures the route is unmapped or mapped only to `excluded_app_id`.
    pub async fn validate_route(
        &self,
        route_id: &str,
        excluded_app_id: &str,
    ) -> Result<String, ReconcileError> {
        self.mappings_owned_by(route_id, &[excluded_app_id]).await?;
        Ok(route_id.to_string())
    }

    async fn mappings_owned_by(
        &self,
        route_id: &str,
        allowed: &[&str],
    ) -> Result<Vec<RouteMapping>, ReconcileError> {
        let mappings = self.routes.read_route_mappings_by_route(route_id).await?;
        if let Some(conflict) = mappings
            .iter()
            .find(|mapping| !allowed.contains(&mapping.app_id.as_str()))
        {
            return Err(ReconcileError::ConflictingBinding {
                route_id: route_id.to_string(),
                app_id: conflict.app_id.clone(),
            });
        }
        Ok(mappings)
    }

    async fn release_mapping(&self, mapping_id: &str) -> Result<(), ReconcileError> {
        match self.routes.delete_route_mapping(mapping_id).await {
            Ok(()) => {
                debug!("Deleted route mapping {}", mapping_id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Route mapping {} already deleted", mapping_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn map_entry(&self, entry: &mut RouteEntry, app_id: &str) -> Result<(), ReconcileError> {
        let mapping_id = self
            .routes
            .create_route_mapping(&entry.route, app_id, entry.port)
            .await?;
        entry.mapping_id = Some(mapping_id);
        self.refresh_port(entry).await
    }

    async fn refresh_port(&self, entry: &mut RouteEntry) -> Result<(), ReconcileError> {
        if let Some(mapping_id) = entry.mapping_id.as_deref() {
            entry.port = self.routes.read_route_mapping(mapping_id).await?.port;
        }
        Ok(())
    }

    /// Pre-flight check run before an application is created.
    pub async fn preflight(&self, config: &RouteConfig, mode: BindMode<'_>) -> Result<(), ReconcileError> {
        match config {
            RouteConfig::Legacy(legacy) => {
                for slot in RouteSlot::ALL {
                    if let Some(route) = legacy.slot(slot).route() {
                        self.validate_route(route, mode.owner()).await?;
                    }
                }
            }
            RouteConfig::Set(entries) => {
                for entry in entries {
                    self.validate_route(&entry.route, mode.owner()).await?;
                }
            }
        }
        Ok(())
    }

    /// Maps the routes of a just-created application.
    pub async fn bind_on_create(
        &self,
        config: &mut RouteConfig,
        app_id: &str,
        mode: BindMode<'_>,
    ) -> Result<(), ReconcileError> {
        match (config, mode) {
            (RouteConfig::Legacy(legacy), BindMode::Fresh) => {
                for slot in [RouteSlot::Default, RouteSlot::Live] {
                    self.map_slot(legacy, slot, app_id).await?;
                }
            }
            (RouteConfig::Legacy(legacy), BindMode::Replacement { .. }) => {
                self.map_slot(legacy, RouteSlot::Stage, app_id).await?;
            }
            (RouteConfig::Set(entries), BindMode::Fresh) => {
                let mut mapped = BTreeSet::new();
                for mut entry in std::mem::take(entries) {
                    self.map_entry(&mut entry, app_id).await?;
                    mapped.insert(entry);
                }
                *entries = mapped;
            }
            (RouteConfig::Set(_), BindMode::Replacement { .. }) => {}
        }
        Ok(())
    }

    async fn map_slot(
        &self,
        legacy: &mut LegacyRoutes,
        slot: RouteSlot,
        app_id: &str,
    ) -> Result<(), ReconcileError> {
        let binding = legacy.slot_mut(slot);
        if let Some(route) = binding.route() {
            let mapping_id = self.routes.create_route_mapping(route, app_id, None).await?;
            info!("Mapped {} {} to application {}", slot.name(), route, app_id);
            binding.mapping_id = Some(mapping_id);
        }
        Ok(())
    }

    /// Moves the routes of a blue-green rollout onto the replacement. Routes
    /// may still be mapped to the venerable application; those already mapped
    /// to the replacement are left as they are.
    pub async fn rebind(
        &self,
        config: &mut RouteConfig,
        replacement_id: &str,
        venerable_id: &str,
    ) -> Result<(), ReconcileError> {
        let allowed = [venerable_id, replacement_id];
        match config {
            RouteConfig::Legacy(legacy) => {
                for slot in [RouteSlot::Default, RouteSlot::Live] {
                    let binding = legacy.slot_mut(slot);
                    let Some(route) = binding.route().map(str::to_string) else {
                        continue;
                    };
                    let mappings = self.mappings_owned_by(&route, &allowed).await?;
                    binding.mapping_id = match mappings.iter().find(|m| m.app_id == replacement_id) {
                        Some(existing) => Some(existing.mapping_id.clone()),
                        None => Some(self.routes.create_route_mapping(&route, replacement_id, None).await?),
                    };
                    info!("Mapped {} {} to replacement {}", slot.name(), route, replacement_id);
                }
            }
            RouteConfig::Set(entries) => {
                let mut rebound = BTreeSet::new();
                for mut entry in std::mem::take(entries) {
                    let mappings = self.mappings_owned_by(&entry.route, &allowed).await?;
                    entry.mapping_id = match mappings.iter().find(|m| m.app_id == replacement_id) {
                        Some(existing) => Some(existing.mapping_id.clone()),
                        None => Some(
                            self.routes
                                .create_route_mapping(&entry.route, replacement_id, entry.port)
                                .await?,
                        ),
                    };
                    self.refresh_port(&mut entry).await?;
                    rebound.insert(entry);
                }
                *entries = rebound;
            }
        }
        Ok(())
    }

    /// Moves one legacy slot from its old route to its new one and returns the
    /// new mapping id, if a new route was mapped.
    pub async fn reconcile_slot(
        &self,
        old: &LegacyRoutes,
        new: &LegacyRoutes,
        slot: RouteSlot,
        app_id: &str,
    ) -> Result<Option<String>, ReconcileError> {
        let (old_binding, new_binding) = (old.slot(slot), new.slot(slot));
        if old_binding.route() == new_binding.route() {
            return Ok(old_binding.mapping_id.clone());
        }
        let mut mapping_id = None;
        if let Some(route) = new_binding.route() {
            self.validate_route(route, app_id).await?;
            mapping_id = Some(self.routes.create_route_mapping(route, app_id, None).await?);
        }
        if old_binding.route().is_some() {
            if let Some(old_mapping) = old_binding.mapping_id() {
                self.release_mapping(old_mapping).await?;
            }
        }
        Ok(mapping_id)
    }

    /// Applies `new` slot by slot onto `current`. Progress stays in `current`
    /// when a slot fails.
    pub async fn reconcile_legacy(
        &self,
        current: &mut LegacyRoutes,
        new: &LegacyRoutes,
        app_id: &str,
    ) -> Result<(), ReconcileError> {
        for slot in RouteSlot::ALL {
            let mapping_id = self.reconcile_slot(current, new, slot, app_id).await?;
            *current.slot_mut(slot) = SlotBinding {
                route: new.slot(slot).route.clone(),
                mapping_id,
            };
        }
        Ok(())
    }

    /// Brings the observed route set to `desired`: maps what is missing,
    /// unmaps what is no longer wanted. Progress stays in `observed` when a
    /// call fails.
    pub async fn reconcile_set(
        &self,
        observed: &mut BTreeSet<RouteEntry>,
        desired: &BTreeSet<RouteEntry>,
        app_id: &str,
    ) -> Result<(), ReconcileError> {
        let to_add: Vec<RouteEntry> = desired.difference(observed).cloned().collect();
        let to_remove: Vec<RouteEntry> = observed.difference(desired).cloned().collect();

        for mut entry in to_add {
            self.validate_route(&entry.route, app_id).await?;
            self.map_entry(&mut entry, app_id).await?;
            info!("Mapped route {} to application {}", entry.route, app_id);
            observed.insert(entry);
        }
        for entry in to_remove {
            if let Some(mapping_id) = entry.mapping_id.as_deref().filter(|id| !id.is_empty()) {
                self.release_mapping(mapping_id).await?;
                info!("Unmapped route {} from application {}", entry.route, app_id);
            }
            observed.remove(&entry);
        }
        Ok(())
    }

    /// Moves from the slot block to the route set. A desired route already held
    /// by a slot keeps that slot's mapping; slot mappings left over are removed.
    pub async fn migrate_legacy(
        &self,
        old: &LegacyRoutes,
        desired: &BTreeSet<RouteEntry>,
        app_id: &str,
    ) -> Result<BTreeSet<RouteEntry>, ReconcileError> {
        let mut migrated = BTreeSet::new();
        for mut entry in desired.iter().cloned() {
            let inherited = RouteSlot::ALL
                .iter()
                .map(|slot| old.slot(*slot))
                .find(|binding| binding.route() == Some(entry.route.as_str()))
                .and_then(|binding| binding.mapping_id.clone());
            match inherited {
                Some(mapping_id) => {
                    debug!("Route {} keeps mapping {}", entry.route, mapping_id);
                    entry.mapping_id = Some(mapping_id);
                    self.refresh_port(&mut entry).await?;
                }
                None => {
                    self.validate_route(&entry.route, app_id).await?;
                    self.map_entry(&mut entry, app_id).await?;
                }
            }
            migrated.insert(entry);
        }
        for slot in RouteSlot::ALL {
            let binding = old.slot(slot);
            if let (Some(route), Some(mapping_id)) = (binding.route(), binding.mapping_id()) {
                if !migrated.contains(&RouteEntry::new(route)) {
                    self.release_mapping(mapping_id).await?;
                }
            }
        }
        Ok(migrated)
    }

    /// Re-reads the mappings of `app_id` and keeps the configuration in line
    /// with what is actually mapped.
    pub async fn refresh(
        &self,
        config: &RouteConfig,
        app_id: &str,
    ) -> Result<RouteConfig, ReconcileError> {
        let current = self.routes.read_route_mappings_by_app(app_id).await?;
        match config {
            RouteConfig::Legacy(legacy) => {
                let mut refreshed = LegacyRoutes::default();
                let mut found = false;
                for slot in RouteSlot::ALL {
                    let wanted = legacy.slot(slot).route();
                    if let Some(mapping) = current
                        .iter()
                        .find(|mapping| Some(mapping.route_id.as_str()) == wanted)
                    {
                        found = true;
                        *refreshed.slot_mut(slot) = SlotBinding {
                            route: Some(mapping.route_id.clone()),
                            mapping_id: Some(mapping.mapping_id.clone()),
                        };
                    }
                }
                Ok(if found {
                    RouteConfig::Legacy(refreshed)
                } else {
                    config.clone()
                })
            }
            RouteConfig::Set(entries) => {
                let refreshed = current
                    .iter()
                    .filter_map(|mapping| {
                        let known = entries.get(&RouteEntry::new(mapping.route_id.clone()))?;
                        match known.mapping_id.as_deref() {
                            Some(id) if id != mapping.mapping_id => None,
                            _ => Some(RouteEntry {
                                route: mapping.route_id.clone(),
                                port: mapping.port,
                                mapping_id: Some(mapping.mapping_id.clone()),
                            }),
                        }
                    })
                    .collect();
                Ok(RouteConfig::Set(refreshed))
            }
        }
    }

    /// Removes every mapping the configuration knows about.
    pub async fn unbind_all(&self, config: &RouteConfig) -> Result<(), ReconcileError> {
        let mapping_ids: Vec<&str> = match config {
            RouteConfig::Legacy(legacy) => RouteSlot::ALL
                .iter()
                .filter_map(|slot| legacy.slot(*slot).mapping_id())
                .collect(),
            RouteConfig::Set(entries) => entries
                .iter()
                .filter_map(|entry| entry.mapping_id.as_deref())
                .filter(|id| !id.is_empty())
                .collect(),
        };
        for mapping_id in mapping_ids {
            self.release_mapping(mapping_id).await?;
        }
        Ok(())
    }
}
