//! Error types for coordinators and platforms

use std::path::PathBuf;
use std::time::Duration;

use opp_core::EntityIdError;
use opp_registries::{DeviceRegistryError, EntityRegistryError};
use thiserror::Error;

/// Why fetching data or updating an entity failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("timed out")]
    Timeout,

    /// Transport level failure talking to the data source
    #[error("{0}")]
    Connection(String),

    /// Raised on purpose by an update method that could not produce data
    #[error("{0}")]
    UpdateFailed(String),

    /// No update method was provided. Never retried or swallowed.
    #[error("update method not implemented")]
    NotImplemented,

    #[error("{0}")]
    Unexpected(String),
}

impl UpdateError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::UpdateFailed(message.into())
    }

    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::Connection(err.to_string())
    }

    pub fn unexpected(err: impl std::fmt::Display) -> Self {
        Self::Unexpected(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for UpdateError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

/// Result of setting up an integration platform
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SetupError {
    /// A dependency is not reachable yet; setup is retried with backoff
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("{0}")]
    Failed(String),

    #[error("integration does not support {0}")]
    NotImplemented(&'static str),
}

impl SetupError {
    pub fn not_ready(reason: impl std::fmt::Display) -> Self {
        Self::NotReady(reason.to_string())
    }
}

/// Why a single entity was not added to a platform
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddEntityError {
    #[error("error on device update: {0}")]
    UpdateBeforeAdd(UpdateError),

    #[error("invalid entity id {entity_id}: {source}")]
    InvalidEntityId {
        entity_id: String,
        #[source]
        source: EntityIdError,
    },

    #[error("Platform {platform} does not generate unique IDs. ID {unique_id} {detail} - ignoring {entity_id}")]
    DuplicateUniqueId {
        platform: String,
        unique_id: String,
        entity_id: String,
        detail: String,
    },

    #[error("Entity id already exists - ignoring: {0}")]
    DuplicateEntityId(String),

    #[error(transparent)]
    Device(#[from] DeviceRegistryError),

    #[error(transparent)]
    Registry(#[from] EntityRegistryError),

    #[error("platform {0} was reset while the entity was being added")]
    PlatformReset(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Timed out adding entities for domain {domain} with platform {platform} after {timeout:?}")]
    AddEntitiesTimeout {
        domain: String,
        platform: String,
        timeout: Duration,
    },

    #[error("platform {0} has been destroyed")]
    Destroyed(String),

    #[error("platform {0} was reset before the entities were added")]
    Reset(String),
}

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid time period '{0}', expected seconds or HH:MM[:SS]")]
    InvalidTimePeriod(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
