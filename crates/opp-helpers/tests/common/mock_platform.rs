//! Integration whose setup outcome is scripted by the test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opp_config_entries::ConfigEntry;
use opp_helpers::{AddEntities, Entity, IntegrationPlatform, OpenPeerPower, PlatformConfig, SetupError};

/// Adds its entities on setup, after failing as scripted
#[derive(Default)]
pub struct MockIntegration {
    entities: Mutex<Vec<Arc<dyn Entity>>>,
    not_ready_remaining: AtomicUsize,
    setup_calls: AtomicUsize,
    setup_delay: Option<Duration>,
    failure: Option<String>,
    parallel_updates: Option<usize>,
}

impl MockIntegration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(self, entities: Vec<Arc<dyn Entity>>) -> Self {
        *self.entities.lock().unwrap() = entities;
        self
    }

    /// Report not ready on the first `times` setups
    pub fn not_ready_for(self, times: usize) -> Self {
        self.not_ready_remaining.store(times, Ordering::SeqCst);
        self
    }

    pub fn with_setup_delay(mut self, delay: Duration) -> Self {
        self.setup_delay = Some(delay);
        self
    }

    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    pub fn with_parallel_updates(mut self, parallel_updates: usize) -> Self {
        self.parallel_updates = Some(parallel_updates);
        self
    }

    pub fn setup_calls(&self) -> usize {
        self.setup_calls.load(Ordering::SeqCst)
    }

    async fn setup(&self, add_entities: AddEntities) -> Result<(), SetupError> {
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.setup_delay {
            tokio::time::sleep(delay).await;
        }
        let not_ready = self
            .not_ready_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if not_ready {
            return Err(SetupError::not_ready("device offline"));
        }
        if let Some(reason) = &self.failure {
            return Err(SetupError::Failed(reason.clone()));
        }
        let entities = self.entities.lock().unwrap().clone();
        add_entities.schedule(entities, false);
        Ok(())
    }
}

#[async_trait]
impl IntegrationPlatform for MockIntegration {
    async fn async_setup_entry(
        &self,
        _opp: Arc<OpenPeerPower>,
        _entry: Arc<ConfigEntry>,
        add_entities: AddEntities,
    ) -> Result<(), SetupError> {
        self.setup(add_entities).await
    }

    async fn async_setup_platform(
        &self,
        _opp: Arc<OpenPeerPower>,
        _config: &PlatformConfig,
        add_entities: AddEntities,
    ) -> Result<(), SetupError> {
        self.setup(add_entities).await
    }

    fn parallel_updates(&self) -> Option<usize> {
        self.parallel_updates
    }
}
