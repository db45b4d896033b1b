//! Event bus for Open Peer Power
//!
//! Every event type gets its own broadcast channel, created on first use.
//! Consumers either hold a [`broadcast::Receiver`] themselves or register a
//! callback with [`EventBus::listen`] / [`EventBus::listen_once`], which
//! drives the receiver from a spawned task and hands back a
//! [`RemoveListener`].

use dashmap::DashMap;
use opp_core::{Context, Event, EventData, EventType, RemoveListener};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace, warn};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    channels: DashMap<EventType, broadcast::Sender<Event>>,
    all: broadcast::Sender<Event>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Bus whose per-type channels buffer `capacity` events per slow receiver
    pub fn with_capacity(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        Self {
            channels: DashMap::new(),
            all,
            capacity,
        }
    }

    pub fn subscribe(&self, event_type: impl Into<EventType>) -> broadcast::Receiver<Event> {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "Subscribing");
        self.channels
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Receiver for every event regardless of type
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    pub fn fire(&self, event: Event) {
        debug!(event_type = %event.event_type, "Firing event");
        if let Some(sender) = self.channels.get(&event.event_type) {
            // No receivers is not an error
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event);
    }

    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T, context: Context) {
        let data = match serde_json::to_value(&data) {
            Ok(data) => data,
            Err(err) => {
                warn!(event_type = T::event_type(), error = %err, "Dropping unserializable event");
                return;
            }
        };
        self.fire(Event::new(T::event_type(), data, context));
    }

    /// Call `callback` for every event of `event_type` until the returned
    /// handle is removed.
    ///
    /// The subscription exists as soon as this returns. Must be called from
    /// within a tokio runtime.
    pub fn listen<F>(&self, event_type: impl Into<EventType>, callback: F) -> RemoveListener
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let mut rx = self.subscribe(event_type.clone());
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(event_type = %event_type, skipped, "Listener fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        RemoveListener::new(move || task.abort())
    }

    /// Call `callback` for the next event of `event_type` only
    pub fn listen_once<F>(&self, event_type: impl Into<EventType>, callback: F) -> RemoveListener
    where
        F: FnOnce(Event) + Send + 'static,
    {
        let mut rx = self.subscribe(event_type);
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        callback(event);
                        break;
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
        RemoveListener::new(move || task.abort())
    }

    /// Number of event types that have had a subscriber
    pub fn event_type_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedEventBus = Arc<EventBus>;
