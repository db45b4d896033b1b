//! Helpers integrations build on
//!
//! - [`DataUpdateCoordinator`]: fetch data once per interval and fan it out to
//!   every listening entity
//! - [`Debouncer`]: collapse bursts of refresh requests
//! - [`EntityPlatform`]: set up an integration, assign entity ids and poll
//!   entities
//! - [`CoordinatorEntity`]: an entity backed by a coordinator

pub mod config;
pub mod debouncer;
pub mod entity;
pub mod entity_platform;
pub mod error;
pub mod event;
pub mod opp;
pub mod update_coordinator;

pub use config::{load_yaml, parse_time_period, CoordinatorConfig, PlatformConfig};
pub use debouncer::Debouncer;
pub use entity::{CoordinatorEntity, Entity, EntityHandle, Polling};
pub use entity_platform::{
    AddEntities, AddEntitiesResult, EntityAddOutcome, EntityPlatform, IntegrationPlatform,
};
pub use error::{AddEntityError, ConfigError, PlatformError, SetupError, UpdateError};
pub use opp::OpenPeerPower;
pub use update_coordinator::{CoordinatorStatus, DataUpdateCoordinator};
