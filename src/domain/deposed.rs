use std::collections::BTreeMap;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::port::AppManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Application,
}

/// Resources a rollout superseded but has not seen deleted yet.
///
/// Stored on the persisted resource record and rewritten functionally: every
/// operation consumes the current set and hands back the next one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeposedResources(BTreeMap<String, ResourceKind>);

impl DeposedResources {
    /// Idempotent; returns whether the id was new.
    pub fn record(&mut self, id: impl Into<String>, kind: ResourceKind) -> bool {
        self.0.insert(id.into(), kind).is_none()
    }

    pub fn forget(&mut self, id: &str) -> bool {
        self.0.remove(id).is_some()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Drops every id the platform confirms gone. Anything else, including ids
    /// whose lookup failed for another reason, is kept for the next cycle.
    pub async fn reconcile_on_read(self, apps: &dyn AppManager) -> Self {
        let mut next = BTreeMap::new();
        for (id, kind) in self.0 {
            match apps.read_app(&id).await {
                Err(e) if e.is_not_found() => {
                    debug!("Deposed {:?} {} no longer exists, forgetting it", kind, id);
                }
                Err(e) => {
                    warn!("Can't check deposed {:?} {}: {}", kind, id, e);
                    next.insert(id, kind);
                }
                Ok(_) => {
                    next.insert(id, kind);
                }
            }
        }
        DeposedResources(next)
    }

    /// Deletes the applications still tracked. Entries are dropped once the
    /// deletion succeeds or the application is already gone; failures keep
    /// them for a later pass.
    pub async fn sweep(self, apps: &dyn AppManager) -> Self {
        let mut next = BTreeMap::new();
        for (id, kind) in self.0 {
            match kind {
                ResourceKind::Application => match apps.delete_app(&id, true).await {
                    Ok(()) => info!("Deleted deposed application {}", id),
                    Err(e) if e.is_not_found() => {
                        debug!("Deposed application {} already deleted", id)
                    }
                    Err(e) => {
                        warn!("Can't delete deposed application {}: {}", id, e);
                        next.insert(id, kind);
                    }
                },
            }
        }
        DeposedResources(next)
    }
}
