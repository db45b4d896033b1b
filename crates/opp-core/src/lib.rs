//! Core types for Open Peer Power
//!
//! The leaf crate of the workspace. Everything else builds on the types here:
//! [`EntityId`], [`State`], [`Event`], [`Context`] and the [`RemoveListener`]
//! handle returned by every subscription-style API.

mod callback;
mod context;
mod entity_id;
mod event;
mod state;
pub mod util;

pub use callback::RemoveListener;
pub use context::Context;
pub use entity_id::{split_entity_id, valid_entity_id, EntityId, EntityIdError};
pub use event::{Event, EventData, EventOrigin, EventType};
pub use state::{Attributes, State};

/// Maximum length of a state value
pub const MAX_STATE_LENGTH: usize = 255;

/// State written for entities whose backing source is unreachable
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// State written when an entity has no value yet
pub const STATE_UNKNOWN: &str = "unknown";

/// Name used for entity ids when an entity provides neither a name nor an id
pub const DEVICE_DEFAULT_NAME: &str = "Unnamed Device";

/// Attribute holding the display name of an entity
pub const ATTR_FRIENDLY_NAME: &str = "friendly_name";

/// Attribute holding the unit of the state value
pub const ATTR_UNIT_OF_MEASUREMENT: &str = "unit_of_measurement";

/// Attribute holding the icon of an entity
pub const ATTR_ICON: &str = "icon";

/// Well-known events fired on the bus
pub mod events {
    use super::*;

    /// Fired whenever an entity state is written or removed
    pub const STATE_CHANGED: &str = "state_changed";

    /// Fired once when the process has finished starting
    pub const OPENPEERPOWER_START: &str = "openpeerpower_start";

    /// Fired once when the process begins shutting down
    pub const OPENPEERPOWER_STOP: &str = "openpeerpower_stop";

    /// Data for STATE_CHANGED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }
}
