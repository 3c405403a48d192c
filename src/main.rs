use std::{error::Error, sync::Arc};

use crate::config::load_config;
use crate::domain::RolloutSettings;
use crate::infra::{artifact::LocalArtifactResolver, memory::InMemoryPlatform, web::router};
use log::info;
use tokio::net::TcpListener;

mod config;
mod domain;
mod infra;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Start appshift - application lifecycle reconciler");

    let config = load_config()?;
    info!("Loaded config {:?}", config);

    // no remote control plane is wired in: reconcile against the in-memory sandbox
    let platform = Arc::new(InMemoryPlatform::default());
    let service = domain::ReconciliationService {
        app_manager: platform.clone(),
        route_manager: platform,
        artifact_resolver: Arc::new(LocalArtifactResolver::new(&config.staging_dir)),
        settings: RolloutSettings::from(&config.rollout),
    };

    let listener = TcpListener::bind(&config.listen_address).await?;
    info!("Listening on {}", config.listen_address);
    axum::serve(listener, router(service)).await?;
    Ok(())
}
