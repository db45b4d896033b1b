//! Entity Registry
//!
//! Remembers which entity id was handed out for each
//! `(domain, platform, unique_id)` so an entity keeps its id across reloads,
//! and records whether the user or the integration disabled it.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use opp_core::util::slugify;
use opp_core::{EntityId, EntityIdError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Longest entity id the registry will generate
pub const MAX_LENGTH_ENTITY_ID: usize = 255;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntityRegistryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    InvalidEntityId(#[from] EntityIdError),
}

/// Reason an entity was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledBy {
    ConfigEntry,
    Device,
    Integration,
    User,
}

/// A registered entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    /// Internal ULID
    pub id: String,
    pub entity_id: EntityId,
    pub unique_id: String,
    /// Integration that provides this entity
    pub platform: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// User-set name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name the integration gave the entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<DisabledBy>,

    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl EntityEntry {
    pub fn domain(&self) -> &str {
        self.entity_id.domain()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    fn key(&self) -> UniqueKey {
        (
            self.domain().to_string(),
            self.platform.clone(),
            self.unique_id.clone(),
        )
    }
}

/// Everything `get_or_create` needs besides the identity triple.
///
/// Fields left `None` keep whatever an existing entry already has.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistration {
    /// Object id to try when an entity id has to be generated
    pub suggested_object_id: Option<String>,
    pub config_entry_id: Option<String>,
    pub device_id: Option<String>,
    /// Only applied when the entry is created
    pub disabled_by: Option<DisabledBy>,
    pub original_name: Option<String>,
    pub original_icon: Option<String>,
    pub unit_of_measurement: Option<String>,
}

type UniqueKey = (String, String, String);

/// Entity Registry
///
/// Entries are stored as `Arc<EntityEntry>`. Every mutation takes the
/// primary write lock first, so id generation and insertion cannot interleave.
pub struct EntityRegistry {
    /// entity_id -> entry, in registration order
    by_entity_id: RwLock<IndexMap<String, Arc<EntityEntry>>>,

    /// (domain, platform, unique_id) -> entity_id
    by_unique_id: DashMap<UniqueKey, String>,

    /// config_entry_id -> entity_ids
    by_config_entry_id: DashMap<String, HashSet<String>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            by_entity_id: RwLock::new(IndexMap::new()),
            by_unique_id: DashMap::new(),
            by_config_entry_id: DashMap::new(),
        }
    }

    fn index_entry(&self, idx: &mut IndexMap<String, Arc<EntityEntry>>, entry: Arc<EntityEntry>) {
        let entity_id = entry.entity_id.to_string();
        self.by_unique_id.insert(entry.key(), entity_id.clone());
        if let Some(ref config_entry_id) = entry.config_entry_id {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(entity_id.clone());
        }
        idx.insert(entity_id, entry);
    }

    fn unindex_entry(&self, entry: &EntityEntry) {
        self.by_unique_id.remove(&entry.key());
        if let Some(ref config_entry_id) = entry.config_entry_id {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(&entry.entity_id.to_string());
            }
        }
    }

    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned()
    }

    /// Entity id registered for a unique id, if any
    pub fn get_entity_id(&self, domain: &str, platform: &str, unique_id: &str) -> Option<String> {
        self.by_unique_id
            .get(&(domain.to_string(), platform.to_string(), unique_id.to_string()))
            .map(|r| r.value().clone())
    }

    pub fn is_registered(&self, entity_id: &str) -> bool {
        self.by_entity_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(entity_id)
    }

    /// Generate a free entity id from a suggested object id.
    ///
    /// The suggestion is slugified; `_2`, `_3`, ... is appended until the id
    /// is neither registered nor `is_taken`.
    pub fn generate_entity_id(
        &self,
        domain: &str,
        suggested_object_id: &str,
        is_taken: impl Fn(&str) -> bool,
    ) -> Result<EntityId, EntityIdError> {
        let idx = self.by_entity_id.read().unwrap_or_else(PoisonError::into_inner);
        generate_free_id(domain, suggested_object_id, |id| {
            idx.contains_key(id) || is_taken(id)
        })
    }

    /// Return the entry for `(domain, platform, unique_id)`, creating it if
    /// needed.
    ///
    /// An existing entry keeps its entity id and disabled state; the other
    /// fields of `registration` that are set overwrite it. A new entry gets
    /// an id generated from `suggested_object_id`, or from
    /// `<platform>_<unique_id>` when there is no suggestion.
    pub fn get_or_create(
        &self,
        domain: &str,
        platform: &str,
        unique_id: &str,
        registration: EntityRegistration,
        is_taken: impl Fn(&str) -> bool,
    ) -> Result<Arc<EntityEntry>, EntityRegistryError> {
        let mut idx = self.by_entity_id.write().unwrap_or_else(PoisonError::into_inner);

        let key = (domain.to_string(), platform.to_string(), unique_id.to_string());
        let existing_id = self.by_unique_id.get(&key).map(|r| r.value().clone());

        if let Some(existing) = existing_id.and_then(|id| idx.get(&id).cloned()) {
            debug!(entity_id = %existing.entity_id, "Found existing registry entry");
            let mut entry = (*existing).clone();
            let before = (
                entry.config_entry_id.clone(),
                entry.device_id.clone(),
                entry.original_name.clone(),
                entry.original_icon.clone(),
                entry.unit_of_measurement.clone(),
            );
            let EntityRegistration {
                config_entry_id,
                device_id,
                original_name,
                original_icon,
                unit_of_measurement,
                ..
            } = registration;
            entry.config_entry_id = config_entry_id.or(entry.config_entry_id);
            entry.device_id = device_id.or(entry.device_id);
            entry.original_name = original_name.or(entry.original_name);
            entry.original_icon = original_icon.or(entry.original_icon);
            entry.unit_of_measurement = unit_of_measurement.or(entry.unit_of_measurement);

            let after = (
                entry.config_entry_id.clone(),
                entry.device_id.clone(),
                entry.original_name.clone(),
                entry.original_icon.clone(),
                entry.unit_of_measurement.clone(),
            );
            if before == after {
                return Ok(existing);
            }

            entry.modified_at = Utc::now();
            self.unindex_entry(&existing);
            let entry = Arc::new(entry);
            self.index_entry(&mut idx, Arc::clone(&entry));
            return Ok(entry);
        }

        let suggestion = registration
            .suggested_object_id
            .clone()
            .unwrap_or_else(|| format!("{platform}_{unique_id}"));
        let entity_id = generate_free_id(domain, &suggestion, |id| {
            idx.contains_key(id) || is_taken(id)
        })?;

        let now = Utc::now();
        let entry = Arc::new(EntityEntry {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            entity_id,
            unique_id: unique_id.to_string(),
            platform: platform.to_string(),
            config_entry_id: registration.config_entry_id,
            device_id: registration.device_id,
            name: None,
            original_name: registration.original_name,
            icon: None,
            original_icon: registration.original_icon,
            unit_of_measurement: registration.unit_of_measurement,
            disabled_by: registration.disabled_by,
            created_at: now,
            modified_at: now,
        });
        self.index_entry(&mut idx, Arc::clone(&entry));

        info!(entity_id = %entry.entity_id, platform, "Registered new entity");
        Ok(entry)
    }

    /// Apply `f` to an entry.
    ///
    /// The entity id and unique id are not meant to be changed this way.
    pub fn update<F>(&self, entity_id: &str, f: F) -> Result<Arc<EntityEntry>, EntityRegistryError>
    where
        F: FnOnce(&mut EntityEntry),
    {
        let mut idx = self.by_entity_id.write().unwrap_or_else(PoisonError::into_inner);
        let Some(existing) = idx.get(entity_id).cloned() else {
            return Err(EntityRegistryError::NotFound(entity_id.to_string()));
        };

        let mut entry = (*existing).clone();
        f(&mut entry);
        entry.modified_at = Utc::now();

        self.unindex_entry(&existing);
        let entry = Arc::new(entry);
        self.index_entry(&mut idx, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn remove(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        let removed = self
            .by_entity_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(entity_id)?;
        self.unindex_entry(&removed);
        info!(entity_id, "Removed entity from registry");
        Some(removed)
    }

    pub fn entities_for_config_entry(&self, config_entry_id: &str) -> Vec<Arc<EntityEntry>> {
        self.by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_entity_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_free_id(
    domain: &str,
    suggested_object_id: &str,
    is_taken: impl Fn(&str) -> bool,
) -> Result<EntityId, EntityIdError> {
    let preferred = format!("{domain}.{}", slugify(suggested_object_id));
    let mut candidate = truncate(&preferred, MAX_LENGTH_ENTITY_ID);
    let mut tries = 1;
    while is_taken(&candidate) {
        tries += 1;
        let suffix = format!("_{tries}");
        candidate = format!(
            "{}{suffix}",
            truncate(&preferred, MAX_LENGTH_ENTITY_ID - suffix.len())
        );
    }
    candidate.parse()
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
