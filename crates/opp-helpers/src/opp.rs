//! The running instance handed to coordinators and platforms

use std::sync::Arc;

use opp_core::events::{OPENPEERPOWER_START, OPENPEERPOWER_STOP};
use opp_core::{Context, Event};
use opp_event_bus::EventBus;
use opp_registries::{DeviceRegistry, EntityRegistry};
use opp_state_store::StateStore;
use tracing::info;

/// The central Open Peer Power instance
pub struct OpenPeerPower {
    /// Event bus for pub/sub communication
    pub bus: Arc<EventBus>,
    /// Current state of every entity
    pub states: Arc<StateStore>,
    pub entity_registry: Arc<EntityRegistry>,
    pub device_registry: Arc<DeviceRegistry>,
}

impl OpenPeerPower {
    pub fn new() -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let states = Arc::new(StateStore::new(bus.clone()));
        Arc::new(Self {
            bus,
            states,
            entity_registry: Arc::new(EntityRegistry::new()),
            device_registry: Arc::new(DeviceRegistry::new()),
        })
    }

    /// Fire the start event
    pub fn async_start(&self) {
        info!("Open Peer Power started");
        self.bus.fire(Event::new(
            OPENPEERPOWER_START,
            serde_json::Value::Null,
            Context::new(),
        ));
    }

    /// Fire the stop event; coordinators stop scheduling refreshes
    pub fn async_stop(&self) {
        info!("Stopping Open Peer Power");
        self.bus.fire(Event::new(
            OPENPEERPOWER_STOP,
            serde_json::Value::Null,
            Context::new(),
        ));
    }
}
