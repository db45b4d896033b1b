//! Config entry type
//!
//! A ConfigEntry is one configured instance of an integration, e.g. one
//! weather account or one hub. Platforms set up from an entry inherit its
//! preferences.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How the entry was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    #[default]
    User,
    /// Imported from YAML configuration
    Import,
    Discovery,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryDisabledBy {
    User,
}

/// A configuration entry for an integration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Unique identifier (ULID)
    pub entry_id: String,

    /// Integration domain (e.g. "hue", "met")
    pub domain: String,

    pub title: String,

    /// Connection data captured when the entry was created
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,

    /// User-tunable options
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub source: ConfigEntrySource,

    /// Register newly discovered entities as disabled
    #[serde(default)]
    pub pref_disable_new_entities: bool,

    /// Do not poll entities of this entry
    #[serde(default)]
    pub pref_disable_polling: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<ConfigEntryDisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ConfigEntry {
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            options: HashMap::new(),
            source: ConfigEntrySource::User,
            pref_disable_new_entities: false,
            pref_disable_polling: false,
            disabled_by: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_options(mut self, options: HashMap<String, serde_json::Value>) -> Self {
        self.options = options;
        self
    }

    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_pref_disable_polling(mut self, disable: bool) -> Self {
        self.pref_disable_polling = disable;
        self
    }

    pub fn with_pref_disable_new_entities(mut self, disable: bool) -> Self {
        self.pref_disable_new_entities = disable;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    /// Typed lookup in `options`, falling back to `data`
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.options
            .get(key)
            .or_else(|| self.data.get(key))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
