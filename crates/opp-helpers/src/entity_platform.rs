//! Lifecycle of a group of entities provided by one integration for one domain
//!
//! An [`EntityPlatform`] sets up its integration (retrying with backoff while
//! the integration reports it is not ready), gives every entity a valid and
//! unique entity id, keeps the entity registry in sync, limits how many
//! entity updates run at once and polls the entities that ask for it.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;
use opp_config_entries::ConfigEntry;
use opp_core::{split_entity_id, EntityId, RemoveListener, DEVICE_DEFAULT_NAME};
use opp_registries::{DisabledBy, EntityEntry, EntityRegistration};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PlatformConfig;
use crate::entity::{run_entity_update, Entity, EntityHandle, Polling};
use crate::error::{AddEntityError, PlatformError, SetupError};
use crate::event::track_time_interval;
use crate::opp::OpenPeerPower;

/// Setup still running after this is logged
pub const SLOW_SETUP_WARNING: Duration = Duration::from_secs(10);

/// Setup is abandoned and retried after this
pub const SLOW_SETUP_MAX_WAIT: Duration = Duration::from_secs(60);

/// Retry `n` of a not-ready setup waits `min(n, 6)` times this
pub const PLATFORM_NOT_READY_BASE_WAIT: Duration = Duration::from_secs(30);

const PLATFORM_NOT_READY_MAX_FACTOR: u32 = 6;

/// Time allowed per entity when adding a batch
pub const SLOW_ADD_ENTITY_MAX_WAIT: Duration = Duration::from_secs(15);

/// Lower bound on the time allowed for adding a batch
pub const SLOW_ADD_MIN_TIMEOUT: Duration = Duration::from_secs(500);

/// Poll period when neither config nor integration sets one
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(15);

/// The per-integration code a platform drives
#[async_trait]
pub trait IntegrationPlatform: Send + Sync + 'static {
    /// Set up entities for a config entry
    async fn async_setup_entry(
        &self,
        _opp: Arc<OpenPeerPower>,
        _entry: Arc<ConfigEntry>,
        _add_entities: AddEntities,
    ) -> Result<(), SetupError> {
        Err(SetupError::NotImplemented("config entries"))
    }

    /// Set up entities from a YAML platform entry
    async fn async_setup_platform(
        &self,
        _opp: Arc<OpenPeerPower>,
        _config: &PlatformConfig,
        _add_entities: AddEntities,
    ) -> Result<(), SetupError> {
        Err(SetupError::NotImplemented("platform setup"))
    }

    /// Max concurrent entity updates; `Some(0)` means unlimited and `None`
    /// lets the first entity decide
    fn parallel_updates(&self) -> Option<usize> {
        None
    }

    fn scan_interval(&self) -> Option<Duration> {
        None
    }
}

/// What happened to an entity handed to [`EntityPlatform::async_add_entities`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityAddOutcome {
    Added(EntityId),
    /// Registered but disabled in the entity registry, so not added
    Disabled(EntityId),
}

pub type AddEntitiesResult = Result<Vec<Result<EntityAddOutcome, AddEntityError>>, PlatformError>;

/// Callback given to an integration during setup
#[derive(Clone)]
pub struct AddEntities {
    platform: Weak<EntityPlatform>,
    label: String,
    generation: u64,
}

impl AddEntities {
    /// Add entities in the background.
    ///
    /// Setup does not complete until these additions have finished.
    pub fn schedule(&self, entities: Vec<Arc<dyn Entity>>, update_before_add: bool) {
        match self.platform.upgrade() {
            Some(platform) => {
                platform.schedule_add_entities(entities, update_before_add, self.generation)
            }
            None => warn!("Platform {} is gone, dropping {} entities", self.label, entities.len()),
        }
    }

    /// Add entities and wait for the result
    pub async fn async_add(
        &self,
        entities: Vec<Arc<dyn Entity>>,
        update_before_add: bool,
    ) -> AddEntitiesResult {
        match self.platform.upgrade() {
            Some(platform) => {
                platform
                    .add_entities_in(entities, update_before_add, self.generation)
                    .await
            }
            None => Err(PlatformError::Destroyed(self.label.clone())),
        }
    }
}

#[derive(Clone)]
enum SetupTarget {
    Entry(Arc<ConfigEntry>),
    Platform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupOutcome {
    Complete,
    Retry,
    Failed,
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct PlatformEntity {
    entity: Arc<dyn Entity>,
    handle: EntityHandle,
}

struct UpdateGate {
    limit: Option<usize>,
    semaphore: Option<Arc<Semaphore>>,
}

#[derive(Default)]
struct PlatformState {
    setup_tries: u32,
    /// Waits out the backoff and runs retried setups until one settles
    retry: Option<JoinHandle<()>>,
    /// Bumped by every reset; work started before a reset is discarded
    generation: u64,
    setup_complete: bool,
    destroyed: bool,
    polling: Option<RemoveListener>,
    tasks: Vec<JoinHandle<()>>,
}

/// Manages the entities of one integration for one domain
pub struct EntityPlatform {
    opp: Arc<OpenPeerPower>,
    domain: String,
    platform_name: String,
    integration: Arc<dyn IntegrationPlatform>,
    config: PlatformConfig,
    scan_interval: Duration,
    config_entry: Mutex<Option<Arc<ConfigEntry>>>,
    /// entity_id -> entity, in the order they were added
    entities: Mutex<IndexMap<String, PlatformEntity>>,
    update_gate: OnceLock<UpdateGate>,
    state: Mutex<PlatformState>,
    /// Held for the duration of one poll cycle
    process_updates: tokio::sync::Mutex<()>,
    weak_self: Weak<Self>,
}

impl EntityPlatform {
    pub fn new(
        opp: Arc<OpenPeerPower>,
        domain: impl Into<String>,
        integration: Arc<dyn IntegrationPlatform>,
        config: PlatformConfig,
    ) -> Arc<Self> {
        let scan_interval = config
            .scan_interval
            .or_else(|| integration.scan_interval())
            .unwrap_or(DEFAULT_SCAN_INTERVAL);

        Arc::new_cyclic(|weak| Self {
            opp,
            domain: domain.into(),
            platform_name: config.platform.clone(),
            integration,
            config,
            scan_interval,
            config_entry: Mutex::new(None),
            entities: Mutex::new(IndexMap::new()),
            update_gate: OnceLock::new(),
            state: Mutex::new(PlatformState::default()),
            process_updates: tokio::sync::Mutex::new(()),
            weak_self: weak.clone(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_entities(&self) -> MutexGuard<'_, IndexMap<String, PlatformEntity>> {
        self.entities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn label(&self) -> String {
        format!("{}.{}", self.domain, self.platform_name)
    }

    pub fn opp(&self) -> &Arc<OpenPeerPower> {
        &self.opp
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    pub fn entity_namespace(&self) -> Option<&str> {
        self.config.entity_namespace.as_deref()
    }

    pub fn config_entry(&self) -> Option<Arc<ConfigEntry>> {
        self.config_entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ids of the live entities, in the order they were added
    pub fn entity_ids(&self) -> Vec<String> {
        self.lock_entities().keys().cloned().collect()
    }

    pub fn entity_count(&self) -> usize {
        self.lock_entities().len()
    }

    pub fn get_entity(&self, entity_id: &str) -> Option<EntityHandle> {
        self.lock_entities()
            .get(entity_id)
            .map(|entry| entry.handle.clone())
    }

    pub fn is_setup_complete(&self) -> bool {
        self.lock_state().setup_complete
    }

    /// Failed setup attempts since the last success or reset
    pub fn setup_tries(&self) -> u32 {
        self.lock_state().setup_tries
    }

    pub fn has_pending_retry(&self) -> bool {
        self.lock_state()
            .retry
            .as_ref()
            .is_some_and(|retry| !retry.is_finished())
    }

    pub fn has_polling(&self) -> bool {
        self.lock_state().polling.is_some()
    }

    /// Concurrency limit for entity updates, once the first entity has
    /// decided it; `None` also means unlimited
    pub fn parallel_updates_limit(&self) -> Option<usize> {
        self.update_gate.get().and_then(|gate| gate.limit)
    }

    fn add_entities_callback(&self, generation: u64) -> AddEntities {
        AddEntities {
            platform: self.weak_self.clone(),
            label: self.label(),
            generation,
        }
    }

    fn generation(&self) -> u64 {
        self.lock_state().generation
    }

    /// Set up the platform for a config entry.
    ///
    /// Returns whether setup completed. A not-ready or timed out setup is
    /// retried in the background.
    pub async fn async_setup_entry(&self, entry: Arc<ConfigEntry>) -> bool {
        *self
            .config_entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&entry));
        self.run_setup(SetupTarget::Entry(entry)).await
    }

    /// Set up the platform from its YAML configuration
    pub async fn async_setup(&self) -> bool {
        self.run_setup(SetupTarget::Platform).await
    }

    async fn run_setup(&self, target: SetupTarget) -> bool {
        match self.attempt_setup(&target).await {
            SetupOutcome::Complete => true,
            SetupOutcome::Retry => {
                self.schedule_retry(target);
                false
            }
            SetupOutcome::Failed => false,
        }
    }

    async fn attempt_setup(&self, target: &SetupTarget) -> SetupOutcome {
        let generation = {
            let state = self.lock_state();
            if state.destroyed {
                warn!("Platform {} has been destroyed, not setting up", self.label());
                return SetupOutcome::Failed;
            }
            state.generation
        };

        info!("Setting up {}", self.label());
        let slow_setup = {
            let label = self.label();
            let after = self.config.slow_setup_warning;
            AbortOnDrop(tokio::spawn(async move {
                tokio::time::sleep(after).await;
                warn!("Setup of platform {} is taking over {} seconds.", label, after.as_secs());
            }))
        };

        let add_entities = self.add_entities_callback(generation);
        let setup = async {
            match target {
                SetupTarget::Entry(entry) => {
                    self.integration
                        .async_setup_entry(Arc::clone(&self.opp), Arc::clone(entry), add_entities)
                        .await
                }
                SetupTarget::Platform => {
                    self.integration
                        .async_setup_platform(Arc::clone(&self.opp), &self.config, add_entities)
                        .await
                }
            }
        };
        let result = tokio::time::timeout(self.config.setup_timeout, setup).await;
        drop(slow_setup);

        if self.generation() != generation {
            debug!(platform = %self.platform_name, "Platform was reset during setup, discarding result");
            return SetupOutcome::Failed;
        }

        match result {
            Ok(Ok(())) => {
                self.await_pending_tasks().await;
                let mut state = self.lock_state();
                if state.generation != generation {
                    return SetupOutcome::Failed;
                }
                state.setup_complete = true;
                state.setup_tries = 0;
                debug!(platform = %self.platform_name, domain = %self.domain, "Setup complete");
                SetupOutcome::Complete
            }
            Ok(Err(SetupError::NotReady(reason))) => {
                debug!(platform = %self.platform_name, %reason, "Platform not ready");
                SetupOutcome::Retry
            }
            Ok(Err(err)) => {
                error!("Error while setting up {} platform for {}: {}", self.platform_name, self.domain, err);
                SetupOutcome::Failed
            }
            Err(_) => {
                error!(
                    "Setup of platform {} is taking longer than {} seconds. Startup will proceed without waiting any longer.",
                    self.platform_name,
                    self.config.setup_timeout.as_secs()
                );
                SetupOutcome::Retry
            }
        }
    }

    /// Count a failed attempt and work out how long to back off.
    ///
    /// `None` once the platform is destroyed.
    fn next_retry_wait(&self) -> Option<Duration> {
        let mut state = self.lock_state();
        if state.destroyed {
            return None;
        }
        state.setup_tries += 1;
        let tries = state.setup_tries;
        let wait = self.config.not_ready_base_wait * tries.min(PLATFORM_NOT_READY_MAX_FACTOR);
        if tries == 1 {
            warn!(
                "Platform {} not ready yet. Retrying in {} seconds (attempt {})",
                self.platform_name,
                wait.as_secs(),
                tries
            );
        } else {
            debug!(
                "Platform {} not ready yet. Retrying in {} seconds (attempt {})",
                self.platform_name,
                wait.as_secs(),
                tries
            );
        }
        Some(wait)
    }

    /// Start the retry task, replacing any previous one.
    ///
    /// The task owns every retried attempt, so aborting it also cancels a
    /// setup that is still in flight.
    fn schedule_retry(&self, target: SetupTarget) {
        let Some(mut wait) = self.next_retry_wait() else {
            return;
        };
        let weak = self.weak_self.clone();
        let retry = tokio::spawn(async move {
            loop {
                tokio::time::sleep(wait).await;
                let Some(platform) = weak.upgrade() else {
                    return;
                };
                if platform.attempt_setup(&target).await != SetupOutcome::Retry {
                    return;
                }
                match platform.next_retry_wait() {
                    Some(next) => wait = next,
                    None => return,
                }
            }
        });

        if let Some(previous) = self.lock_state().retry.replace(retry) {
            previous.abort();
        }
    }

    async fn await_pending_tasks(&self) {
        loop {
            let pending = std::mem::take(&mut self.lock_state().tasks);
            if pending.is_empty() {
                return;
            }
            for result in join_all(pending).await {
                if let Err(err) = result {
                    if !err.is_cancelled() {
                        error!(platform = %self.platform_name, error = %err, "Adding entities panicked");
                    }
                }
            }
        }
    }

    fn schedule_add_entities(
        &self,
        entities: Vec<Arc<dyn Entity>>,
        update_before_add: bool,
        generation: u64,
    ) {
        let Some(platform) = self.weak_self.upgrade() else {
            return;
        };
        let task = tokio::spawn(async move {
            if let Err(err) = platform
                .add_entities_in(entities, update_before_add, generation)
                .await
            {
                warn!(error = %err, "Scheduled entity add failed");
            }
        });
        self.lock_state().tasks.push(task);
    }

    /// Add a batch of entities.
    ///
    /// Each entity is added independently: one failing does not stop the
    /// others, and every failure is logged and reported in its slot of the
    /// returned list.
    pub async fn async_add_entities(
        &self,
        new_entities: Vec<Arc<dyn Entity>>,
        update_before_add: bool,
    ) -> AddEntitiesResult {
        let generation = self.generation();
        self.add_entities_in(new_entities, update_before_add, generation)
            .await
    }

    /// Add a batch on behalf of a setup that started in `generation`
    async fn add_entities_in(
        &self,
        new_entities: Vec<Arc<dyn Entity>>,
        update_before_add: bool,
        generation: u64,
    ) -> AddEntitiesResult {
        if new_entities.is_empty() {
            return Ok(Vec::new());
        }
        {
            let state = self.lock_state();
            if state.destroyed {
                return Err(PlatformError::Destroyed(self.label()));
            }
            if state.generation != generation {
                return Err(PlatformError::Reset(self.label()));
            }
        }

        let count = u32::try_from(new_entities.len()).unwrap_or(u32::MAX);
        let timeout = SLOW_ADD_ENTITY_MAX_WAIT
            .saturating_mul(count)
            .max(SLOW_ADD_MIN_TIMEOUT);

        let adds = new_entities
            .into_iter()
            .map(|entity| self.add_entity(entity, update_before_add, generation));
        let results = match tokio::time::timeout(timeout, join_all(adds)).await {
            Ok(results) => results,
            Err(_) => {
                let err = PlatformError::AddEntitiesTimeout {
                    domain: self.domain.clone(),
                    platform: self.platform_name.clone(),
                    timeout,
                };
                warn!("{}", err);
                self.start_polling_if_needed();
                return Err(err);
            }
        };

        for err in results.iter().filter_map(|result| result.as_ref().err()) {
            error!(platform = %self.platform_name, domain = %self.domain, "{}", err);
        }

        self.start_polling_if_needed();
        Ok(results)
    }

    /// Concurrency gate for entity updates, decided by the first entity
    fn parallel_updates_semaphore(&self, polling: Polling) -> Option<Arc<Semaphore>> {
        self.update_gate
            .get_or_init(|| {
                let configured = self
                    .config
                    .parallel_updates
                    .or_else(|| self.integration.parallel_updates());
                let limit = match configured {
                    Some(0) => None,
                    Some(limit) => Some(limit),
                    None if polling == Polling::Async => None,
                    None => Some(1),
                };
                debug!(platform = %self.platform_name, ?limit, "Parallel updates decided");
                UpdateGate {
                    limit,
                    semaphore: limit.map(|permits| Arc::new(Semaphore::new(permits))),
                }
            })
            .semaphore
            .clone()
    }

    fn generate_entity_id(
        &self,
        entities: &IndexMap<String, PlatformEntity>,
        suggested_object_id: &str,
    ) -> Result<EntityId, AddEntityError> {
        let states = &self.opp.states;
        self.opp
            .entity_registry
            .generate_entity_id(&self.domain, suggested_object_id, |id| {
                entities.contains_key(id) || !states.is_available(id)
            })
            .map_err(|source| AddEntityError::InvalidEntityId {
                entity_id: format!("{}.{}", self.domain, suggested_object_id),
                source,
            })
    }

    async fn add_entity(
        &self,
        entity: Arc<dyn Entity>,
        update_before_add: bool,
        generation: u64,
    ) -> Result<EntityAddOutcome, AddEntityError> {
        let semaphore = self.parallel_updates_semaphore(entity.polling());

        if update_before_add {
            let label = entity
                .entity_id()
                .or_else(|| entity.name())
                .unwrap_or_else(|| self.platform_name.clone());
            run_entity_update(Arc::clone(&entity), semaphore.clone(), &label, false)
                .await
                .map_err(AddEntityError::UpdateBeforeAdd)?;
        }

        let namespace = self.config.entity_namespace.as_deref();
        let config_entry = self.config_entry();
        let unique_id = entity.unique_id();
        let mut entity_id = entity.entity_id();
        let mut requested_entity_id = None;
        let mut suggested_object_id = None;
        let mut registry_entry: Option<Arc<EntityEntry>> = None;

        if let Some(unique_id) = &unique_id {
            if let Some(requested) = &entity_id {
                requested_entity_id = Some(requested.clone());
                suggested_object_id = split_entity_id(requested).map(|(_, object_id)| object_id.to_string());
            } else {
                suggested_object_id = entity.name();
            }
            if let Some(namespace) = namespace {
                suggested_object_id = suggested_object_id.map(|object_id| format!("{namespace} {object_id}"));
            }

            let mut device_id = None;
            if let (Some(config_entry), Some(device_info)) = (&config_entry, entity.device_info()) {
                let device = self
                    .opp
                    .device_registry
                    .get_or_create(&config_entry.entry_id, &device_info)?;
                device_id = Some(device.id.clone());
            }

            let disabled_by = if !entity.entity_registry_enabled_default()
                || config_entry.as_ref().is_some_and(|e| e.pref_disable_new_entities)
            {
                Some(DisabledBy::Integration)
            } else {
                None
            };

            let registration = EntityRegistration {
                suggested_object_id: suggested_object_id.clone(),
                config_entry_id: config_entry.as_ref().map(|e| e.entry_id.clone()),
                device_id,
                disabled_by,
                original_name: entity.name(),
                original_icon: entity.icon(),
                unit_of_measurement: entity.unit_of_measurement(),
            };

            let entry = {
                let entities = self.lock_entities();
                let states = &self.opp.states;
                self.opp.entity_registry.get_or_create(
                    &self.domain,
                    &self.platform_name,
                    unique_id,
                    registration,
                    |id| entities.contains_key(id) || !states.is_available(id),
                )?
            };

            if entry.is_disabled() {
                info!("Not adding entity {} because it's disabled", entry.entity_id);
                return Ok(EntityAddOutcome::Disabled(entry.entity_id.clone()));
            }

            entity_id = Some(entry.entity_id.to_string());
            registry_entry = Some(entry);
        } else if let Some(requested) = &entity_id {
            // A platform may not pick an id the registry has handed out
            if self.opp.entity_registry.is_registered(requested) {
                suggested_object_id = split_entity_id(requested).map(|(_, object_id)| object_id.to_string());
                entity_id = None;
            }
        }

        let generated = entity_id.is_none();
        let suggestion = if generated {
            let object_id = suggested_object_id
                .or_else(|| entity.name())
                .unwrap_or_else(|| DEVICE_DEFAULT_NAME.to_string());
            match namespace {
                Some(namespace) => format!("{namespace} {object_id}"),
                None => object_id,
            }
        } else {
            String::new()
        };

        let (entity_id, handle) = {
            let mut entities = self.lock_entities();
            if self.generation() != generation {
                return Err(AddEntityError::PlatformReset(self.label()));
            }

            let entity_id = match entity_id {
                Some(requested) => requested
                    .parse::<EntityId>()
                    .map_err(|source| AddEntityError::InvalidEntityId {
                        entity_id: requested.clone(),
                        source,
                    })?,
                None => self.generate_entity_id(&entities, &suggestion)?,
            };

            let mut entity_id = entity_id;
            loop {
                let key = entity_id.to_string();
                let taken = entities.contains_key(&key) || self.opp.states.reserve(&entity_id).is_err();
                if !taken {
                    break;
                }
                if generated {
                    // Claimed elsewhere since generation; pick the next free id
                    entity_id = self.generate_entity_id(&entities, &suggestion)?;
                    continue;
                }
                return Err(match &unique_id {
                    Some(unique_id) => AddEntityError::DuplicateUniqueId {
                        platform: self.platform_name.clone(),
                        unique_id: unique_id.clone(),
                        entity_id: key,
                        detail: match &requested_entity_id {
                            Some(requested) => format!("is already used by {requested}"),
                            None => "already exists".to_string(),
                        },
                    },
                    None => AddEntityError::DuplicateEntityId(key),
                });
            }

            let handle = EntityHandle::new(
                Arc::clone(&self.opp),
                entity_id.clone(),
                &entity,
                semaphore,
                registry_entry,
            );
            entities.insert(
                entity_id.to_string(),
                PlatformEntity {
                    entity: Arc::clone(&entity),
                    handle: handle.clone(),
                },
            );
            (entity_id, handle)
        };

        let weak = self.weak_self.clone();
        let key = entity_id.to_string();
        handle.on_remove(RemoveListener::new(move || {
            if let Some(platform) = weak.upgrade() {
                platform.forget_entity(&key);
            }
        }));

        entity.async_added_to_opp(handle.clone()).await;
        handle.write_state();

        debug!(entity_id = %entity_id, platform = %self.platform_name, "Added entity");
        Ok(EntityAddOutcome::Added(entity_id))
    }

    fn any_polled_entity(&self) -> bool {
        self.lock_entities()
            .values()
            .any(|entry| entry.entity.should_poll())
    }

    fn start_polling_if_needed(&self) {
        if self
            .config_entry()
            .is_some_and(|entry| entry.pref_disable_polling)
        {
            return;
        }
        let any_polled = self.any_polled_entity();

        let mut state = self.lock_state();
        if state.destroyed || state.polling.is_some() || !any_polled {
            return;
        }
        let weak = self.weak_self.clone();
        state.polling = Some(track_time_interval(self.scan_interval, move || {
            if let Some(platform) = weak.upgrade() {
                tokio::spawn(async move { platform.async_update_entity_states().await });
            }
        }));
        debug!(platform = %self.platform_name, scan_interval = ?self.scan_interval, "Polling started");
    }

    /// Update every polled entity and write its state.
    ///
    /// Skipped with a warning while the previous cycle is still running.
    pub async fn async_update_entity_states(&self) {
        let Ok(_cycle) = self.process_updates.try_lock() else {
            warn!(
                "Updating {} {} took longer than the scheduled update interval {:?}",
                self.platform_name, self.domain, self.scan_interval
            );
            return;
        };

        let handles: Vec<EntityHandle> = self
            .lock_entities()
            .values()
            .filter(|entry| entry.entity.should_poll())
            .map(|entry| entry.handle.clone())
            .collect();

        join_all(handles.iter().map(|handle| handle.async_update_op_state(true))).await;
    }

    /// Remove one entity; polling stops once no polled entity is left
    pub async fn async_remove_entity(&self, entity_id: &str) -> bool {
        let handle = self.get_entity(entity_id);
        let Some(handle) = handle else {
            return false;
        };
        handle.async_remove().await;
        self.forget_entity(entity_id);
        true
    }

    /// Drop an entity from the platform, stopping polling once no polled
    /// entity is left
    fn forget_entity(&self, entity_id: &str) {
        let any_polled = {
            let mut entities = self.lock_entities();
            entities.shift_remove(entity_id);
            entities.values().any(|entry| entry.entity.should_poll())
        };
        if !any_polled {
            if let Some(polling) = self.lock_state().polling.take() {
                polling.remove();
            }
        }
    }

    /// Remove every entity and stop all timers.
    ///
    /// The platform can be set up again afterwards with a fresh retry count.
    pub async fn async_reset(&self) {
        {
            let mut state = self.lock_state();
            state.generation += 1;
            if let Some(retry) = state.retry.take() {
                retry.abort();
            }
            for task in state.tasks.drain(..) {
                task.abort();
            }
        }

        let entity_ids = self.entity_ids();
        join_all(entity_ids.iter().map(|id| self.async_remove_entity(id))).await;

        let mut state = self.lock_state();
        if let Some(polling) = state.polling.take() {
            polling.remove();
        }
        state.setup_complete = false;
        state.setup_tries = 0;
    }

    pub async fn async_unload_entry(&self) -> bool {
        self.async_reset().await;
        true
    }

    /// Reset and refuse any further setup
    pub async fn async_destroy(&self) {
        self.lock_state().destroyed = true;
        self.async_reset().await;
    }
}

impl Drop for EntityPlatform {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(retry) = state.retry.take() {
            retry.abort();
        }
        if let Some(polling) = state.polling.take() {
            polling.remove();
        }
    }
}
