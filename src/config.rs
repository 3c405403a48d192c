use std::time::Duration;

use anyhow::{Context, Error};
use config::Config;

use crate::domain::RolloutSettings;

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub listen_address: String,
    pub staging_dir: String,
    pub rollout: RolloutConfig,
}

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RolloutConfig {
    pub staging_settle_secs: u64,
    pub drain_pause_secs: u64,
    pub venerable_suffix: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:3000".to_string(),
            staging_dir: std::env::temp_dir()
                .join("appshift")
                .display()
                .to_string(),
            rollout: RolloutConfig::default(),
        }
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        let settings = RolloutSettings::default();
        Self {
            staging_settle_secs: settings.staging_settle.as_secs(),
            drain_pause_secs: settings.drain_pause.as_secs(),
            venerable_suffix: settings.venerable_suffix,
        }
    }
}

impl From<&RolloutConfig> for RolloutSettings {
    fn from(config: &RolloutConfig) -> Self {
        Self {
            staging_settle: Duration::from_secs(config.staging_settle_secs),
            drain_pause: Duration::from_secs(config.drain_pause_secs),
            venerable_suffix: config.venerable_suffix.clone(),
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("appshift")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

pub fn load_config() -> Result<AppConfig, Error> {
    let config = Config::builder()
        .add_source(environment())
        .build()
        .context("Can't load configuration")?;

    config
        .try_deserialize()
        .context("Can't deserialize AppConfig from loaded configuration")
}
