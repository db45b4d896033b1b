//! Entities and the handle they get once added to a platform

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use opp_core::{
    Attributes, Context, EntityId, RemoveListener, ATTR_FRIENDLY_NAME, ATTR_ICON,
    ATTR_UNIT_OF_MEASUREMENT, MAX_STATE_LENGTH, STATE_UNAVAILABLE, STATE_UNKNOWN,
};
use opp_registries::{DeviceInfo, EntityEntry};
use tokio::sync::Semaphore;
use tracing::{error, warn};

use crate::error::UpdateError;
use crate::opp::OpenPeerPower;
use crate::update_coordinator::DataUpdateCoordinator;

/// An update running longer than this is logged
pub const SLOW_UPDATE_WARNING: Duration = Duration::from_secs(10);

/// How an entity refreshes itself.
///
/// The first entity added to a platform decides the platform's default
/// update concurrency: anything but [`Polling::Async`] is limited to one
/// update at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polling {
    /// No update method
    None,
    /// Blocking [`Entity::update`], run on the blocking thread pool
    Sync,
    /// [`Entity::async_update`]
    Async,
}

/// A unit of state exposed by an integration.
///
/// Every method has a default so implementors only override what they
/// provide. Implementations use interior mutability for anything an update
/// changes.
#[async_trait]
pub trait Entity: Send + Sync + 'static {
    /// Stable id used to keep the entity id across restarts
    fn unique_id(&self) -> Option<String> {
        None
    }

    /// Requested entity id; generated from the name when absent or taken
    fn entity_id(&self) -> Option<String> {
        None
    }

    fn name(&self) -> Option<String> {
        None
    }

    /// Current state; `None` is written as `unknown`
    fn state(&self) -> Option<String> {
        None
    }

    fn available(&self) -> bool {
        true
    }

    /// Whether the platform should poll this entity every scan interval
    fn should_poll(&self) -> bool {
        true
    }

    fn polling(&self) -> Polling {
        Polling::None
    }

    /// Write the state even when nothing changed
    fn force_update(&self) -> bool {
        false
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        None
    }

    fn unit_of_measurement(&self) -> Option<String> {
        None
    }

    fn icon(&self) -> Option<String> {
        None
    }

    fn extra_state_attributes(&self) -> Option<Attributes> {
        None
    }

    /// `false` registers the entity disabled
    fn entity_registry_enabled_default(&self) -> bool {
        true
    }

    async fn async_update(&self) -> Result<(), UpdateError> {
        Ok(())
    }

    /// Blocking update, only called when [`Entity::polling`] is [`Polling::Sync`]
    fn update(&self) -> Result<(), UpdateError> {
        Ok(())
    }

    /// Called once the entity has an id, before its first state is written
    async fn async_added_to_opp(&self, _handle: EntityHandle) {}

    async fn async_will_remove_from_opp(&self) {}
}

/// Run an entity's update under the platform's concurrency limit.
///
/// `warning` logs when the update is still running after
/// [`SLOW_UPDATE_WARNING`].
pub(crate) async fn run_entity_update(
    entity: Arc<dyn Entity>,
    semaphore: Option<Arc<Semaphore>>,
    label: &str,
    warning: bool,
) -> Result<(), UpdateError> {
    let _permit = match semaphore {
        Some(semaphore) => Some(
            semaphore
                .acquire_owned()
                .await
                .map_err(UpdateError::unexpected)?,
        ),
        None => None,
    };

    let update = async {
        match entity.polling() {
            Polling::Async => entity.async_update().await,
            Polling::Sync => {
                let entity = Arc::clone(&entity);
                tokio::task::spawn_blocking(move || entity.update())
                    .await
                    .map_err(UpdateError::unexpected)?
            }
            Polling::None => Ok(()),
        }
    };
    tokio::pin!(update);

    if warning {
        match tokio::time::timeout(SLOW_UPDATE_WARNING, &mut update).await {
            Ok(result) => return result,
            Err(_) => warn!(
                "Update of {} is taking over {} seconds",
                label,
                SLOW_UPDATE_WARNING.as_secs()
            ),
        }
    }
    update.await
}

/// Given to an entity when a platform adds it.
///
/// Cheap to clone. Holds the entity weakly so an entity can keep its own
/// handle.
#[derive(Clone)]
pub struct EntityHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    opp: Arc<OpenPeerPower>,
    entity_id: EntityId,
    entity: Weak<dyn Entity>,
    semaphore: Option<Arc<Semaphore>>,
    registry_entry: Option<Arc<EntityEntry>>,
    on_remove: Mutex<Vec<RemoveListener>>,
    removed: AtomicBool,
    update_staged: AtomicBool,
}

impl EntityHandle {
    pub(crate) fn new(
        opp: Arc<OpenPeerPower>,
        entity_id: EntityId,
        entity: &Arc<dyn Entity>,
        semaphore: Option<Arc<Semaphore>>,
        registry_entry: Option<Arc<EntityEntry>>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                opp,
                entity_id,
                entity: Arc::downgrade(entity),
                semaphore,
                registry_entry,
                on_remove: Mutex::new(Vec::new()),
                removed: AtomicBool::new(false),
                update_staged: AtomicBool::new(false),
            }),
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.inner.entity_id
    }

    pub fn opp(&self) -> &Arc<OpenPeerPower> {
        &self.inner.opp
    }

    pub fn registry_entry(&self) -> Option<&Arc<EntityEntry>> {
        self.inner.registry_entry.as_ref()
    }

    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::SeqCst)
    }

    /// Write the entity's current state to the state store
    pub fn write_state(&self) {
        if self.is_removed() {
            return;
        }
        let Some(entity) = self.inner.entity.upgrade() else {
            return;
        };
        let entity_id = &self.inner.entity_id;
        let entry = self.inner.registry_entry.as_deref();

        let mut attributes = Attributes::new();
        let state = if !entity.available() {
            STATE_UNAVAILABLE.to_string()
        } else {
            if let Some(extra) = entity.extra_state_attributes() {
                attributes.extend(extra);
            }
            entity.state().unwrap_or_else(|| STATE_UNKNOWN.to_string())
        };

        let state = if state.chars().count() > MAX_STATE_LENGTH {
            error!(
                "State {} for {} is longer than {}, falling back to {}",
                state, entity_id, MAX_STATE_LENGTH, STATE_UNKNOWN
            );
            STATE_UNKNOWN.to_string()
        } else {
            state
        };

        if let Some(unit) = entity.unit_of_measurement() {
            attributes.insert(ATTR_UNIT_OF_MEASUREMENT.to_string(), unit.into());
        }
        let name = entry.and_then(|e| e.name.clone()).or_else(|| entity.name());
        if let Some(name) = name {
            attributes.insert(ATTR_FRIENDLY_NAME.to_string(), name.into());
        }
        let icon = entry.and_then(|e| e.icon.clone()).or_else(|| entity.icon());
        if let Some(icon) = icon {
            attributes.insert(ATTR_ICON.to_string(), icon.into());
        }

        if let Err(err) = self.inner.opp.states.set(
            entity_id,
            state,
            attributes,
            entity.force_update(),
            Context::new(),
        ) {
            error!(entity_id = %entity_id, error = %err, "Failed to write state");
        }
    }

    /// Run the entity's update, holding a slot of the platform's limit.
    ///
    /// A second call while an update is already queued or running returns
    /// right away.
    pub async fn async_device_update(&self, warning: bool) -> Result<(), UpdateError> {
        if self
            .inner
            .update_staged
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = match self.inner.entity.upgrade() {
            Some(entity) => {
                let label = self.inner.entity_id.to_string();
                run_entity_update(entity, self.inner.semaphore.clone(), &label, warning).await
            }
            None => Ok(()),
        };
        self.inner.update_staged.store(false, Ordering::SeqCst);
        result
    }

    /// Optionally update the entity, then write its state.
    ///
    /// A failed update is logged and nothing is written.
    pub async fn async_update_op_state(&self, force_refresh: bool) {
        if force_refresh {
            if let Err(err) = self.async_device_update(true).await {
                error!(entity_id = %self.inner.entity_id, error = %err, "Update for {} fails", self.inner.entity_id);
                return;
            }
        }
        self.write_state();
    }

    /// Spawn [`Self::async_update_op_state`]
    pub fn schedule_update_op_state(&self, force_refresh: bool) {
        let handle = self.clone();
        tokio::spawn(async move { handle.async_update_op_state(force_refresh).await });
    }

    /// Run `listener` when the entity is removed
    pub fn on_remove(&self, listener: RemoveListener) {
        if self.is_removed() {
            listener.remove();
            return;
        }
        self.inner
            .on_remove
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Tear the entity down and remove its state.
    ///
    /// `on_remove` listeners run newest first.
    pub async fn async_remove(&self) {
        if self.inner.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners: Vec<RemoveListener> = std::mem::take(
            &mut *self
                .inner
                .on_remove
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for listener in listeners.into_iter().rev() {
            listener.remove();
        }

        if let Some(entity) = self.inner.entity.upgrade() {
            entity.async_will_remove_from_opp().await;
        }
        self.inner
            .opp
            .states
            .remove(&self.inner.entity_id, Context::new());
    }
}

impl std::fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("entity_id", &self.inner.entity_id)
            .field("removed", &self.is_removed())
            .finish()
    }
}

type StateFn<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;
type AttributesFn<T> = Arc<dyn Fn(&T) -> Attributes + Send + Sync>;

/// Entity whose state comes from a [`DataUpdateCoordinator`].
///
/// Not polled: it writes its state whenever the coordinator notifies, and
/// is available exactly when the coordinator's last refresh succeeded.
pub struct CoordinatorEntity<T> {
    coordinator: Arc<DataUpdateCoordinator<T>>,
    unique_id: Option<String>,
    name: Option<String>,
    device_info: Option<DeviceInfo>,
    unit_of_measurement: Option<String>,
    icon: Option<String>,
    enabled_default: bool,
    state_fn: Option<StateFn<T>>,
    attributes_fn: Option<AttributesFn<T>>,
}

impl<T> CoordinatorEntity<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(coordinator: Arc<DataUpdateCoordinator<T>>) -> Self {
        Self {
            coordinator,
            unique_id: None,
            name: None,
            device_info: None,
            unit_of_measurement: None,
            icon: None,
            enabled_default: true,
            state_fn: None,
            attributes_fn: None,
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_device_info(mut self, device_info: DeviceInfo) -> Self {
        self.device_info = Some(device_info);
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit_of_measurement = Some(unit.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn with_enabled_default(mut self, enabled: bool) -> Self {
        self.enabled_default = enabled;
        self
    }

    /// Derive the state from the coordinator data
    pub fn with_state<F>(mut self, state_fn: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        self.state_fn = Some(Arc::new(state_fn));
        self
    }

    /// Derive extra attributes from the coordinator data
    pub fn with_attributes<F>(mut self, attributes_fn: F) -> Self
    where
        F: Fn(&T) -> Attributes + Send + Sync + 'static,
    {
        self.attributes_fn = Some(Arc::new(attributes_fn));
        self
    }

    pub fn coordinator(&self) -> &Arc<DataUpdateCoordinator<T>> {
        &self.coordinator
    }
}

#[async_trait]
impl<T> Entity for CoordinatorEntity<T>
where
    T: Send + Sync + 'static,
{
    fn unique_id(&self) -> Option<String> {
        self.unique_id.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn state(&self) -> Option<String> {
        let state_fn = self.state_fn.as_ref()?;
        self.coordinator.data().and_then(|data| state_fn(&data))
    }

    fn available(&self) -> bool {
        self.coordinator.last_update_success()
    }

    fn should_poll(&self) -> bool {
        false
    }

    fn polling(&self) -> Polling {
        Polling::Async
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        self.device_info.clone()
    }

    fn unit_of_measurement(&self) -> Option<String> {
        self.unit_of_measurement.clone()
    }

    fn icon(&self) -> Option<String> {
        self.icon.clone()
    }

    fn extra_state_attributes(&self) -> Option<Attributes> {
        let attributes_fn = self.attributes_fn.as_ref()?;
        self.coordinator.data().map(|data| attributes_fn(&data))
    }

    fn entity_registry_enabled_default(&self) -> bool {
        self.enabled_default
    }

    async fn async_update(&self) -> Result<(), UpdateError> {
        self.coordinator.async_request_refresh().await
    }

    async fn async_added_to_opp(&self, handle: EntityHandle) {
        let writer = handle.clone();
        let unsub = self
            .coordinator
            .async_add_listener(move || writer.write_state());
        handle.on_remove(unsub);
    }
}
