//! Open Peer Power Registries
//!
//! In-memory entity and device registries. Platforms use them to give
//! entities with a unique id a stable entity id and to group entities by
//! the device they belong to.

pub mod device_registry;
pub mod entity_registry;

pub use device_registry::{
    format_mac, DeviceConnection, DeviceEntry, DeviceEntryType, DeviceIdentifier, DeviceInfo,
    DeviceRegistry, DeviceRegistryError, CONNECTION_NETWORK_MAC,
};
pub use entity_registry::{
    DisabledBy, EntityEntry, EntityRegistration, EntityRegistry, EntityRegistryError,
};
