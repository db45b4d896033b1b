//! Demo integration: a simulated weather station polled through a coordinator

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opp_config_entries::ConfigEntry;
use opp_core::Attributes;
use opp_helpers::{
    AddEntities, CoordinatorConfig, CoordinatorEntity, DataUpdateCoordinator, Entity,
    IntegrationPlatform, OpenPeerPower, PlatformConfig, SetupError, UpdateError,
};
use serde_json::json;
use tracing::debug;

pub const DOMAIN: &str = "demo";

/// One reading of the simulated station
#[derive(Debug, Clone, PartialEq)]
pub struct StationReading {
    pub temperature: f64,
    pub humidity: u8,
    pub fetched_at: DateTime<Utc>,
}

/// Simulated station; every fetch moves the readings one step along a
/// fixed cycle
#[derive(Debug, Default)]
pub struct WeatherStation {
    step: AtomicU64,
}

impl WeatherStation {
    pub async fn fetch(&self) -> Result<StationReading, UpdateError> {
        let step = self.step.fetch_add(1, Ordering::Relaxed);
        let phase = (step % 12) as f64;
        Ok(StationReading {
            temperature: 18.0 + phase * 0.5,
            humidity: 40 + (step % 20) as u8,
            fetched_at: Utc::now(),
        })
    }
}

pub struct DemoIntegration {
    coordinator_config: CoordinatorConfig,
    station: Arc<WeatherStation>,
}

impl DemoIntegration {
    pub fn new(coordinator_config: CoordinatorConfig) -> Self {
        Self {
            coordinator_config,
            station: Arc::new(WeatherStation::default()),
        }
    }

    async fn setup(&self, opp: &OpenPeerPower, add_entities: AddEntities) -> Result<(), SetupError> {
        let station = Arc::clone(&self.station);
        let coordinator = DataUpdateCoordinator::from_config(opp, self.coordinator_config.clone(), move || {
            let station = Arc::clone(&station);
            async move { station.fetch().await }
        });
        coordinator.async_config_entry_first_refresh().await?;
        debug!(coordinator = %coordinator.name(), "First refresh done");

        let entities: Vec<Arc<dyn Entity>> = vec![
            Arc::new(
                CoordinatorEntity::new(Arc::clone(&coordinator))
                    .with_unique_id("demo-station-temperature")
                    .with_name("Station Temperature")
                    .with_unit("°C")
                    .with_state(|reading: &StationReading| Some(format!("{:.1}", reading.temperature)))
                    .with_attributes(reading_attributes),
            ),
            Arc::new(
                CoordinatorEntity::new(coordinator)
                    .with_unique_id("demo-station-humidity")
                    .with_name("Station Humidity")
                    .with_unit("%")
                    .with_icon("mdi:water-percent")
                    .with_state(|reading: &StationReading| Some(reading.humidity.to_string())),
            ),
        ];
        add_entities.schedule(entities, false);
        Ok(())
    }
}

fn reading_attributes(reading: &StationReading) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert("fetched_at".to_string(), json!(reading.fetched_at.to_rfc3339()));
    attributes
}

#[async_trait]
impl IntegrationPlatform for DemoIntegration {
    async fn async_setup_entry(
        &self,
        opp: Arc<OpenPeerPower>,
        _entry: Arc<ConfigEntry>,
        add_entities: AddEntities,
    ) -> Result<(), SetupError> {
        self.setup(&opp, add_entities).await
    }

    async fn async_setup_platform(
        &self,
        opp: Arc<OpenPeerPower>,
        _config: &PlatformConfig,
        add_entities: AddEntities,
    ) -> Result<(), SetupError> {
        self.setup(&opp, add_entities).await
    }
}
