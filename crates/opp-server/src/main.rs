//! Open Peer Power Rust Server
//!
//! Loads a YAML configuration, sets up the configured platforms and runs
//! until Ctrl-C.

mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use opp_helpers::{load_yaml, CoordinatorConfig, EntityPlatform, OpenPeerPower, PlatformConfig};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::demo::DemoIntegration;

#[derive(Debug, Default, Deserialize)]
struct LoggerConfig {
    /// Filter used when `RUST_LOG` is not set, e.g. `debug` or
    /// `info,opp_helpers=debug`
    default: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerConfig {
    #[serde(default)]
    logger: LoggerConfig,

    /// Coordinator settings of the demo integration
    #[serde(default)]
    demo: Option<CoordinatorConfig>,

    #[serde(default)]
    sensor: Vec<PlatformConfig>,
}

impl ServerConfig {
    fn load(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => load_yaml(path).with_context(|| format!("loading {}", path.display())),
            None => Ok(Self::default()),
        }
    }

    fn sensor_platforms(&self) -> Vec<PlatformConfig> {
        if self.sensor.is_empty() {
            vec![PlatformConfig::new(demo::DOMAIN)]
        } else {
            self.sensor.clone()
        }
    }

    fn demo_coordinator(&self) -> CoordinatorConfig {
        self.demo.clone().unwrap_or_else(|| {
            CoordinatorConfig::new("demo station").with_update_interval(std::time::Duration::from_secs(30))
        })
    }
}

fn init_logging(logger: &LoggerConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(logger.default.as_deref().unwrap_or("info"))
            .context("invalid logger.default filter")?,
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn setup_platforms(opp: &Arc<OpenPeerPower>, config: &ServerConfig) -> Vec<Arc<EntityPlatform>> {
    let mut platforms = Vec::new();
    for platform_config in config.sensor_platforms() {
        if platform_config.platform != demo::DOMAIN {
            warn!("Unable to find platform {}", platform_config.platform);
            continue;
        }
        let integration = Arc::new(DemoIntegration::new(config.demo_coordinator()));
        let platform = EntityPlatform::new(Arc::clone(opp), "sensor", integration, platform_config);
        // A platform that is not ready keeps retrying in the background
        platform.async_setup().await;
        platforms.push(platform);
    }
    platforms
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ServerConfig::load(config_path.as_ref())?;
    init_logging(&config.logger)?;

    info!("Starting Open Peer Power (Rust)");

    let opp = OpenPeerPower::new();
    let platforms = setup_platforms(&opp, &config).await;
    opp.async_start();

    info!(
        entities = opp.states.entity_count(),
        "Open Peer Power is running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    opp.async_stop();
    for platform in platforms {
        platform.async_reset().await;
    }

    Ok(())
}
