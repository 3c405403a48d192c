use std::{sync::Arc, time::Duration};

use tempfile::TempDir;

use super::{
    model::{AppPatch, AppSource, ApplicationSpec},
    ReconciliationService, RolloutSettings,
};
use crate::infra::{artifact::LocalArtifactResolver, memory::InMemoryPlatform};

/// Reconciliation service wired to a fresh in-memory platform, with every
/// pause set to zero.
pub struct Harness {
    pub platform: Arc<InMemoryPlatform>,
    pub service: ReconciliationService,
    /// Application bits served through `file://` sources.
    pub workdir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let workdir = tempfile::tempdir().unwrap();
        std::fs::write(workdir.path().join("index.html"), "<h1>hello</h1>").unwrap();
        let staging = workdir.path().join(".staging");
        std::fs::create_dir(&staging).unwrap();

        let platform = Arc::new(InMemoryPlatform::default());
        let service = ReconciliationService {
            app_manager: platform.clone(),
            route_manager: platform.clone(),
            artifact_resolver: Arc::new(LocalArtifactResolver::new(staging)),
            settings: RolloutSettings {
                staging_settle: Duration::ZERO,
                drain_pause: Duration::ZERO,
                ..Default::default()
            },
        };
        Self {
            platform,
            service,
            workdir,
        }
    }

    pub fn spec(&self, name: &str) -> ApplicationSpec {
        let url = format!("file://{}", self.workdir.path().join("index.html").display());
        ApplicationSpec::new(name, "space-1", AppSource::Url(url))
    }

    pub fn patch(&self, name: &str) -> AppPatch {
        AppPatch::from_spec(&self.spec(name))
    }
}
