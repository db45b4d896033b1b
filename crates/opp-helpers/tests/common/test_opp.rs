//! Isolated Open Peer Power instance for tests

use std::sync::Arc;

use opp_helpers::{EntityPlatform, IntegrationPlatform, OpenPeerPower, PlatformConfig};

pub struct TestOpp {
    pub opp: Arc<OpenPeerPower>,
}

impl TestOpp {
    pub fn new() -> Self {
        Self {
            opp: OpenPeerPower::new(),
        }
    }

    /// Platform for `domain` named after `config.platform`
    pub fn platform(
        &self,
        domain: &str,
        integration: Arc<dyn IntegrationPlatform>,
        config: PlatformConfig,
    ) -> Arc<EntityPlatform> {
        EntityPlatform::new(Arc::clone(&self.opp), domain, integration, config)
    }

    pub fn state(&self, entity_id: &str) -> Option<String> {
        self.opp.states.get(entity_id).map(|state| state.state)
    }

    pub fn assert_state(&self, entity_id: &str, expected: &str) {
        let state = self.state(entity_id);
        assert_eq!(
            state.as_deref(),
            Some(expected),
            "Expected entity {} to be in state '{}', but was {:?}",
            entity_id,
            expected,
            state
        );
    }
}

impl Default for TestOpp {
    fn default() -> Self {
        Self::new()
    }
}
