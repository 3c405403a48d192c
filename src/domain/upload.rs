use std::{path::Path, sync::Arc};

use anyhow::anyhow;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use super::{
    error::{PlatformError, ReconcileError},
    model::{AddContent, Artifact},
    port::AppManager,
};

pub struct UploadCoordinator;

impl UploadCoordinator {
    /// Starts uploading the artifact in the background. Container images have
    /// nothing to upload and get a handle that is already complete.
    pub fn dispatch(
        apps: Arc<dyn AppManager>,
        app_id: &str,
        artifact: Artifact,
        add_content: Vec<AddContent>,
    ) -> UploadHandle {
        let Artifact::Local { path, ephemeral } = artifact else {
            return UploadHandle::ready();
        };
        let app_id = app_id.to_string();
        info!("Uploading {} for application {}", path.display(), app_id);
        let task = tokio::spawn(async move {
            let result = apps.upload_app(&app_id, &path, &add_content).await;
            if result.is_ok() {
                debug!("Upload of application {} done", app_id);
                if ephemeral {
                    discard(&path).await;
                }
            }
            result
        });
        UploadHandle { task: Some(task) }
    }
}

async fn discard(path: &Path) {
    let removal = if path.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    if let Err(e) = removal {
        warn!("Can't remove staged bits {}: {}", path.display(), e);
    }
}

/// The single join point of an upload started by [`UploadCoordinator`].
#[must_use = "an upload has to be joined before the application is started"]
pub struct UploadHandle {
    task: Option<JoinHandle<Result<(), PlatformError>>>,
}

impl UploadHandle {
    pub fn ready() -> Self {
        Self { task: None }
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.task.is_some()
    }

    pub async fn join(self) -> Result<(), ReconcileError> {
        let Some(task) = self.task else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result.map_err(ReconcileError::UploadFailure),
            Err(e) => Err(ReconcileError::UploadFailure(PlatformError::Other(anyhow!(
                "upload task aborted: {}",
                e
            )))),
        }
    }

    /// Waits for the upload to end and drops its outcome. Used on error paths
    /// where the application is about to be torn down anyway.
    pub async fn settle(self) {
        if let Err(e) = self.join().await {
            debug!("Discarding upload outcome: {}", e);
        }
    }
}
