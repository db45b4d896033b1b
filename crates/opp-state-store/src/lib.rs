//! Entity state store for Open Peer Power
//!
//! Holds the current [`State`] of every entity and fires `state_changed` on
//! the bus whenever one is written or removed. Entity ids can be reserved
//! before their first state exists so that two platforms adding entities at
//! the same time cannot both claim the same id.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use opp_core::events::StateChangedData;
use opp_core::{Attributes, Context, EntityId, State, MAX_STATE_LENGTH};
use opp_event_bus::EventBus;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, trace};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateStoreError {
    #[error("entity id {0} already has a state")]
    AlreadyExists(String),

    #[error("entity id {0} is already reserved")]
    AlreadyReserved(String),

    #[error("state for {entity_id} is {length} characters, max is {MAX_STATE_LENGTH}")]
    StateTooLong { entity_id: String, length: usize },
}

pub struct StateStore {
    states: DashMap<String, State>,
    reserved: DashMap<String, ()>,
    bus: Arc<EventBus>,
}

impl StateStore {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            reserved: DashMap::new(),
            bus,
        }
    }

    /// Write the state of an entity and fire `state_changed`.
    ///
    /// Writing the same value and attributes again is a no-op unless
    /// `force_update` is set; `last_changed` only moves when the value does.
    /// A successful write releases any reservation on the id.
    #[instrument(skip(self, state, attributes, context), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: &EntityId,
        state: impl Into<String>,
        attributes: Attributes,
        force_update: bool,
        context: Context,
    ) -> Result<State, StateStoreError> {
        let state = state.into();
        let length = state.chars().count();
        if length > MAX_STATE_LENGTH {
            return Err(StateStoreError::StateTooLong {
                entity_id: entity_id.to_string(),
                length,
            });
        }

        let key = entity_id.to_string();
        let old_state = self.states.get(&key).map(|s| s.clone());

        let new_state = match &old_state {
            Some(old) if !force_update && old.state == state && old.attributes == attributes => {
                trace!("State unchanged");
                return Ok(old.clone());
            }
            Some(old) => old.with_update(state, attributes, context.clone()),
            None => State::new(entity_id.clone(), state, attributes, context.clone()),
        };

        debug!(state = %new_state.state, "Writing state");
        self.states.insert(key.clone(), new_state.clone());
        self.reserved.remove(&key);

        self.bus.fire_typed(
            StateChangedData {
                entity_id: entity_id.clone(),
                old_state,
                new_state: Some(new_state.clone()),
            },
            context,
        );

        Ok(new_state)
    }

    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.states
            .get(entity_id)
            .is_some_and(|s| s.state == state)
    }

    /// Sorted ids of every entity with a state, optionally limited to one domain
    pub fn entity_ids(&self, domain: Option<&str>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .states
            .iter()
            .filter(|s| domain.map_or(true, |d| s.entity_id.domain() == d))
            .map(|s| s.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Remove an entity's state and any reservation on its id.
    ///
    /// Fires `state_changed` with no new state if there was a state.
    #[instrument(skip(self, context), fields(entity_id = %entity_id))]
    pub fn remove(&self, entity_id: &EntityId, context: Context) -> Option<State> {
        let key = entity_id.to_string();
        self.reserved.remove(&key);

        let old_state = self.states.remove(&key).map(|(_, s)| s)?;
        trace!("Removed state");
        self.bus.fire_typed(
            StateChangedData {
                entity_id: entity_id.clone(),
                old_state: Some(old_state.clone()),
                new_state: None,
            },
            context,
        );
        Some(old_state)
    }

    /// Claim an id that has no state yet.
    ///
    /// The reservation lasts until a state is written for the id or it is
    /// removed.
    pub fn reserve(&self, entity_id: &EntityId) -> Result<(), StateStoreError> {
        let key = entity_id.to_string();
        match self.reserved.entry(key) {
            Entry::Occupied(slot) => Err(StateStoreError::AlreadyReserved(slot.key().clone())),
            Entry::Vacant(slot) => {
                if self.states.contains_key(slot.key()) {
                    return Err(StateStoreError::AlreadyExists(slot.key().clone()));
                }
                slot.insert(());
                Ok(())
            }
        }
    }

    /// Whether an id is neither in use nor reserved
    pub fn is_available(&self, entity_id: &str) -> bool {
        !self.states.contains_key(entity_id) && !self.reserved.contains_key(entity_id)
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

pub type SharedStateStore = Arc<StateStore>;
