use log::debug;
use split_iter::Splittable;

use super::{error::ReconcileError, model::ServiceBinding, port::AppManager};

/// Splits the change between two binding lists into `(to_delete, to_add)`.
///
/// Entries are matched on `service_instance` alone: the binding id only exists
/// on the observed side.
pub fn diff(
    old: &[ServiceBinding],
    new: &[ServiceBinding],
) -> (Vec<ServiceBinding>, Vec<ServiceBinding>) {
    let to_delete = old
        .iter()
        .filter(|binding| !contains_instance(new, &binding.service_instance))
        .cloned()
        .collect();
    let to_add = new
        .iter()
        .filter(|binding| !contains_instance(old, &binding.service_instance))
        .cloned()
        .collect();
    (to_delete, to_add)
}

fn contains_instance(bindings: &[ServiceBinding], service_instance: &str) -> bool {
    bindings
        .iter()
        .any(|binding| binding.service_instance == service_instance)
}

/// Rebuilds the desired list with the binding ids known so far: freshly
/// issued ones from `added`, kept ones from `observed`.
pub fn merge_ids(
    desired: &[ServiceBinding],
    observed: &[ServiceBinding],
    added: &[ServiceBinding],
) -> Vec<ServiceBinding> {
    desired
        .iter()
        .map(|binding| {
            let binding_id = added
                .iter()
                .chain(observed.iter())
                .find(|known| known.service_instance == binding.service_instance)
                .and_then(|known| known.binding_id.clone());
            ServiceBinding {
                binding_id,
                ..binding.clone()
            }
        })
        .collect()
}

pub struct BindingReconciler<'a> {
    apps: &'a dyn AppManager,
}

impl<'a> BindingReconciler<'a> {
    pub fn new(apps: &'a dyn AppManager) -> Self {
        Self { apps }
    }

    /// Binds every entry to `app_id` and stamps the issued binding id on it.
    ///
    /// Stops at the first failure. Bindings created before it are not rolled
    /// back; they travel in [`ReconcileError::PartialBindingFailure`].
    pub async fn add(
        &self,
        app_id: &str,
        entries: Vec<ServiceBinding>,
    ) -> Result<Vec<ServiceBinding>, ReconcileError> {
        let mut bound = Vec::with_capacity(entries.len());
        for mut entry in entries {
            match self
                .apps
                .create_service_binding(app_id, &entry.service_instance, entry.params.as_ref())
                .await
            {
                Ok(binding_id) => {
                    debug!(
                        "Created binding with id '{}' for service instance '{}'",
                        binding_id, entry.service_instance
                    );
                    entry.binding_id = Some(binding_id);
                    bound.push(entry);
                }
                Err(source) => {
                    return Err(ReconcileError::PartialBindingFailure { bound, source });
                }
            }
        }
        Ok(bound)
    }

    /// Deletes the given bindings. Entries without a binding id have nothing
    /// to delete and are skipped.
    pub async fn remove(&self, entries: &[ServiceBinding]) -> Result<(), ReconcileError> {
        let (unbound, bound): (Vec<&ServiceBinding>, Vec<&ServiceBinding>) = {
            let (unbound, bound) = entries.iter().split(|binding| {
                binding
                    .binding_id
                    .as_deref()
                    .is_some_and(|binding_id| !binding_id.is_empty())
            });
            (unbound.collect(), bound.collect())
        };
        for binding in unbound {
            debug!(
                "Ignoring binding for service instance '{}' as no corresponding binding id was found",
                binding.service_instance
            );
        }
        for binding in bound {
            let binding_id = binding.binding_id.as_deref().unwrap_or_default();
            debug!(
                "Deleting binding with id '{}' for service instance '{}'",
                binding_id, binding.service_instance
            );
            match self.apps.delete_service_binding(binding_id).await {
                Err(e) if e.is_not_found() => {
                    debug!("Binding {} already deleted", binding_id);
                }
                result => result?,
            }
        }
        Ok(())
    }
}
