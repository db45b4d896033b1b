//! Device Registry
//!
//! Devices are found by any of their identifiers or connections. Entities
//! that describe their device through [`DeviceInfo`] all end up linked to
//! the same [`DeviceEntry`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::entity_registry::DisabledBy;

pub const CONNECTION_NETWORK_MAC: &str = "mac";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceRegistryError {
    #[error("device info needs at least one identifier or connection")]
    MissingIdentifiers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEntryType {
    /// A cloud or software service rather than hardware
    Service,
}

/// `(integration domain, id)` pair naming a device inside one integration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentifier(pub String, pub String);

impl DeviceIdentifier {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self(domain.into(), id.into())
    }

    fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// `(connection type, id)` pair such as `("mac", "aa:bb:cc:dd:ee:ff")`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceConnection(pub String, pub String);

impl DeviceConnection {
    /// Build a connection, normalizing MAC addresses
    pub fn new(connection_type: impl Into<String>, id: impl Into<String>) -> Self {
        let connection_type = connection_type.into();
        let id = id.into();
        let id = if connection_type == CONNECTION_NETWORK_MAC {
            format_mac(&id)
        } else {
            id
        };
        Self(connection_type, id)
    }

    fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// Lowercase, colon separated MAC address.
///
/// Accepts `AA:BB:..`, `AA-BB-..`, `aabb.ccdd.eeff` and bare 12-digit hex;
/// anything else is returned unchanged.
pub fn format_mac(mac: &str) -> String {
    let separators = |sep: char| mac.chars().filter(|c| *c == sep).count();

    let hex = match mac.len() {
        17 if separators(':') == 5 => return mac.to_lowercase(),
        17 if separators('-') == 5 => mac.replace('-', ""),
        14 if separators('.') == 2 => mac.replace('.', ""),
        12 if mac.chars().all(|c| c.is_ascii_hexdigit()) => mac.to_string(),
        _ => return mac.to_string(),
    };

    let hex = hex.to_lowercase();
    let pairs: Vec<&str> = (0..hex.len())
        .step_by(2)
        .filter_map(|i| hex.get(i..i + 2))
        .collect();
    pairs.join(":")
}

/// Device metadata an entity reports about the hardware or service behind it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub identifiers: Vec<DeviceIdentifier>,
    #[serde(default)]
    pub connections: Vec<DeviceConnection>,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    /// Identifier of the device this one is reached through (e.g. a hub)
    pub via_device: Option<DeviceIdentifier>,
    pub entry_type: Option<DeviceEntryType>,
    /// Used only when the device has no name yet
    pub default_name: Option<String>,
    pub default_manufacturer: Option<String>,
    pub default_model: Option<String>,
}

impl DeviceInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identifier(mut self, domain: impl Into<String>, id: impl Into<String>) -> Self {
        self.identifiers.push(DeviceIdentifier::new(domain, id));
        self
    }

    pub fn with_connection(
        mut self,
        connection_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        self.connections.push(DeviceConnection::new(connection_type, id));
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_sw_version(mut self, sw_version: impl Into<String>) -> Self {
        self.sw_version = Some(sw_version.into());
        self
    }

    pub fn with_via_device(mut self, domain: impl Into<String>, id: impl Into<String>) -> Self {
        self.via_device = Some(DeviceIdentifier::new(domain, id));
        self
    }

    pub fn with_entry_type(mut self, entry_type: DeviceEntryType) -> Self {
        self.entry_type = Some(entry_type);
        self
    }
}

/// A registered device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Internal UUID
    pub id: String,
    pub identifiers: Vec<DeviceIdentifier>,
    pub connections: Vec<DeviceConnection>,
    pub config_entries: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// User-set name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_by_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_type: Option<DeviceEntryType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<DisabledBy>,

    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl DeviceEntry {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            identifiers: Vec::new(),
            connections: Vec::new(),
            config_entries: Vec::new(),
            name: None,
            name_by_user: None,
            manufacturer: None,
            model: None,
            sw_version: None,
            via_device_id: None,
            entry_type: None,
            disabled_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// User name if set, else the integration's name
    pub fn display_name(&self) -> Option<&str> {
        self.name_by_user.as_deref().or(self.name.as_deref())
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }
}

/// Device Registry
///
/// Entries are stored as `Arc<DeviceEntry>`; identifier and connection
/// indexes point at the device id.
pub struct DeviceRegistry {
    by_id: DashMap<String, Arc<DeviceEntry>>,
    by_identifier: DashMap<String, String>,
    by_connection: DashMap<String, String>,
    by_config_entry_id: DashMap<String, HashSet<String>>,
    /// Serializes `get_or_create` so two entities describing the same new
    /// device cannot create it twice
    write_lock: std::sync::Mutex<()>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_identifier: DashMap::new(),
            by_connection: DashMap::new(),
            by_config_entry_id: DashMap::new(),
            write_lock: std::sync::Mutex::new(()),
        }
    }

    fn index_entry(&self, entry: Arc<DeviceEntry>) {
        let device_id = entry.id.clone();
        for identifier in &entry.identifiers {
            self.by_identifier.insert(identifier.key(), device_id.clone());
        }
        for connection in &entry.connections {
            self.by_connection.insert(connection.key(), device_id.clone());
        }
        for config_entry_id in &entry.config_entries {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(device_id.clone());
        }
        self.by_id.insert(device_id, entry);
    }

    fn unindex_entry(&self, entry: &DeviceEntry) {
        for identifier in &entry.identifiers {
            self.by_identifier.remove(&identifier.key());
        }
        for connection in &entry.connections {
            self.by_connection.remove(&connection.key());
        }
        for config_entry_id in &entry.config_entries {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(&entry.id);
            }
        }
        self.by_id.remove(&entry.id);
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.by_id.get(device_id).map(|r| Arc::clone(r.value()))
    }

    /// Look a device up by any identifier, then by any connection
    pub fn get_device(
        &self,
        identifiers: &[DeviceIdentifier],
        connections: &[DeviceConnection],
    ) -> Option<Arc<DeviceEntry>> {
        identifiers
            .iter()
            .find_map(|i| self.by_identifier.get(&i.key()).map(|id| id.clone()))
            .or_else(|| {
                connections
                    .iter()
                    .find_map(|c| self.by_connection.get(&c.key()).map(|id| id.clone()))
            })
            .and_then(|id| self.get(&id))
    }

    /// Find or create the device described by `info` and link it to a config
    /// entry.
    ///
    /// Values in `info` overwrite the stored ones; `default_*` values only
    /// fill in fields that are still empty. `via_device` is resolved to the
    /// registered device id when that device is known.
    pub fn get_or_create(
        &self,
        config_entry_id: &str,
        info: &DeviceInfo,
    ) -> Result<Arc<DeviceEntry>, DeviceRegistryError> {
        if info.identifiers.is_empty() && info.connections.is_empty() {
            return Err(DeviceRegistryError::MissingIdentifiers);
        }

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let existing = self.get_device(&info.identifiers, &info.connections);
        let mut entry = match &existing {
            Some(existing) => {
                debug!(device_id = %existing.id, "Found existing device");
                (**existing).clone()
            }
            None => DeviceEntry::new(),
        };

        if !entry.config_entries.iter().any(|id| id == config_entry_id) {
            entry.config_entries.push(config_entry_id.to_string());
        }
        for identifier in &info.identifiers {
            if !entry.identifiers.contains(identifier) {
                entry.identifiers.push(identifier.clone());
            }
        }
        for connection in &info.connections {
            if !entry.connections.contains(connection) {
                entry.connections.push(connection.clone());
            }
        }

        apply(&mut entry.name, &info.name, &info.default_name);
        apply(&mut entry.manufacturer, &info.manufacturer, &info.default_manufacturer);
        apply(&mut entry.model, &info.model, &info.default_model);
        apply(&mut entry.sw_version, &info.sw_version, &None);
        if info.entry_type.is_some() {
            entry.entry_type = info.entry_type;
        }
        if let Some(via) = &info.via_device {
            if let Some(via_device) = self.get_device(std::slice::from_ref(via), &[]) {
                entry.via_device_id = Some(via_device.id.clone());
            }
        }

        if let Some(existing) = existing {
            if same_device(&existing, &entry) {
                return Ok(existing);
            }
            entry.modified_at = Utc::now();
            self.unindex_entry(&existing);
        } else {
            info!(device_id = %entry.id, name = ?entry.name, "Registered new device");
        }

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        Ok(entry)
    }

    pub fn devices_for_config_entry(&self, config_entry_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let entry = self.get(device_id)?;
        self.unindex_entry(&entry);
        info!(device_id, "Removed device");
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(field: &mut Option<String>, value: &Option<String>, default: &Option<String>) {
    if value.is_some() {
        field.clone_from(value);
    } else if field.is_none() {
        field.clone_from(default);
    }
}

fn same_device(a: &DeviceEntry, b: &DeviceEntry) -> bool {
    a.identifiers == b.identifiers
        && a.connections == b.connections
        && a.config_entries == b.config_entries
        && a.name == b.name
        && a.manufacturer == b.manufacturer
        && a.model == b.model
        && a.sw_version == b.sw_version
        && a.via_device_id == b.via_device_id
        && a.entry_type == b.entry_type
}
