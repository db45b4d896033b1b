//! Configurable entity for platform tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opp_helpers::{Entity, EntityHandle, Polling, UpdateError};
use opp_registries::DeviceInfo;

/// Counts updates running at the same time, possibly across entities
#[derive(Default)]
pub struct UpdateTracker {
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl UpdateTracker {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Most updates that were ever running at once
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An entity whose every property can be set up front.
///
/// Updates count themselves and report to an [`UpdateTracker`], which can
/// be shared between entities.
pub struct MockEntity {
    unique_id: Option<String>,
    entity_id: Option<String>,
    name: Option<String>,
    should_poll: bool,
    polling: Polling,
    device_info: Option<DeviceInfo>,
    enabled_default: bool,
    update_delay: Duration,
    added_delay: Duration,
    state: Mutex<Option<String>>,
    available: AtomicBool,
    fail_update: AtomicBool,
    updates: AtomicUsize,
    tracker: Arc<UpdateTracker>,
    removed: AtomicBool,
}

impl MockEntity {
    pub fn new() -> Self {
        Self {
            unique_id: None,
            entity_id: None,
            name: None,
            should_poll: false,
            polling: Polling::Async,
            device_info: None,
            enabled_default: true,
            update_delay: Duration::ZERO,
            added_delay: Duration::ZERO,
            state: Mutex::new(None),
            available: AtomicBool::new(true),
            fail_update: AtomicBool::new(false),
            updates: AtomicUsize::new(0),
            tracker: UpdateTracker::new(),
            removed: AtomicBool::new(false),
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_state(self, state: impl Into<String>) -> Self {
        *self.state.lock().unwrap() = Some(state.into());
        self
    }

    pub fn polled(mut self) -> Self {
        self.should_poll = true;
        self
    }

    pub fn with_polling(mut self, polling: Polling) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_update_delay(mut self, delay: Duration) -> Self {
        self.update_delay = delay;
        self
    }

    /// Make `async_added_to_opp` take this long
    pub fn with_added_delay(mut self, delay: Duration) -> Self {
        self.added_delay = delay;
        self
    }

    pub fn with_device_info(mut self, device_info: DeviceInfo) -> Self {
        self.device_info = Some(device_info);
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_default = false;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<UpdateTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn failing_update(self) -> Self {
        self.fail_update.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_state(&self, state: impl Into<String>) {
        *self.state.lock().unwrap() = Some(state.into());
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_updates(&self) -> usize {
        self.tracker.max_concurrent()
    }

    pub fn was_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    fn start_update(&self) {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.tracker.enter();
    }

    fn finish_update(&self) -> Result<(), UpdateError> {
        self.tracker.exit();
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(UpdateError::failed("mock update failed"));
        }
        Ok(())
    }
}

impl Default for MockEntity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Entity for MockEntity {
    fn unique_id(&self) -> Option<String> {
        self.unique_id.clone()
    }

    fn entity_id(&self) -> Option<String> {
        self.entity_id.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn state(&self) -> Option<String> {
        self.state.lock().unwrap().clone()
    }

    fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn should_poll(&self) -> bool {
        self.should_poll
    }

    fn polling(&self) -> Polling {
        self.polling
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        self.device_info.clone()
    }

    fn entity_registry_enabled_default(&self) -> bool {
        self.enabled_default
    }

    async fn async_update(&self) -> Result<(), UpdateError> {
        self.start_update();
        if !self.update_delay.is_zero() {
            tokio::time::sleep(self.update_delay).await;
        }
        self.finish_update()
    }

    fn update(&self) -> Result<(), UpdateError> {
        self.start_update();
        if !self.update_delay.is_zero() {
            std::thread::sleep(self.update_delay);
        }
        self.finish_update()
    }

    async fn async_added_to_opp(&self, _handle: EntityHandle) {
        if !self.added_delay.is_zero() {
            tokio::time::sleep(self.added_delay).await;
        }
    }

    async fn async_will_remove_from_opp(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }
}
