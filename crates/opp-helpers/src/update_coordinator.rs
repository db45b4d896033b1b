//! Fetch data once and fan it out to every entity that needs it
//!
//! A [`DataUpdateCoordinator`] owns the latest successfully fetched value of
//! one data source. Entities subscribe with [`DataUpdateCoordinator::async_add_listener`]
//! instead of polling on their own, so the polling cadence no longer grows
//! with the entity count.
//!
//! Automatic refreshes only run while at least one listener is registered.
//! The next refresh is scheduled at the current time floored to the second
//! plus the update interval, which keeps the cadence from drifting by the
//! time each fetch takes.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use opp_core::events::OPENPEERPOWER_STOP;
use opp_core::RemoveListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::debouncer::Debouncer;
use crate::error::{SetupError, UpdateError};
use crate::event::{floor_to_second, track_point_in_utc_time};
use crate::opp::OpenPeerPower;

/// Cooldown of the request-refresh debouncer
pub const REQUEST_REFRESH_DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Whether a requested refresh runs before or after the cooldown
pub const REQUEST_REFRESH_DEFAULT_IMMEDIATE: bool = true;

type UpdateMethod<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, UpdateError>> + Send + Sync>;
type Listener = Arc<dyn Fn() + Send + Sync>;

/// Where a coordinator is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorStatus {
    /// No refresh has been attempted yet
    NeverUpdated,
    /// The last refresh succeeded
    Healthy,
    /// The last refresh failed; `data` still holds the last good value
    Degraded,
    /// Shut down; nothing is scheduled or fetched any more
    Stopped,
}

struct CoordinatorState<T> {
    data: Option<Arc<T>>,
    last_update_success: bool,
    attempted: bool,
    stopped: bool,
    update_interval: Option<Duration>,
    unsub_refresh: Option<JoinHandle<()>>,
    last_exception: Option<UpdateError>,
}

/// Manages fetching data from a single endpoint
pub struct DataUpdateCoordinator<T> {
    name: String,
    update_method: Option<UpdateMethod<T>>,
    request_refresh_debouncer: Debouncer<UpdateError>,
    state: Mutex<CoordinatorState<T>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    unsub_shutdown: Mutex<Option<RemoveListener>>,
    weak_self: Weak<Self>,
}

impl<T> DataUpdateCoordinator<T>
where
    T: Send + Sync + 'static,
{
    /// Coordinator calling `update_method` every `update_interval` while it
    /// has listeners.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F, Fut>(
        opp: &OpenPeerPower,
        name: impl Into<String>,
        update_interval: Option<Duration>,
        update_method: F,
    ) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, UpdateError>> + Send + 'static,
    {
        let mut config = CoordinatorConfig::new(name);
        config.update_interval = update_interval;
        Self::from_config(opp, config, update_method)
    }

    pub fn from_config<F, Fut>(opp: &OpenPeerPower, config: CoordinatorConfig, update_method: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, UpdateError>> + Send + 'static,
    {
        let update_method: UpdateMethod<T> = Arc::new(move || Box::pin(update_method()));
        Self::build(opp, config, Some(update_method))
    }

    /// Coordinator without an update method, fed only through
    /// [`Self::async_set_updated_data`]
    pub fn push_only(opp: &OpenPeerPower, name: impl Into<String>) -> Arc<Self> {
        Self::build(opp, CoordinatorConfig::new(name), None)
    }

    fn build(
        opp: &OpenPeerPower,
        config: CoordinatorConfig,
        update_method: Option<UpdateMethod<T>>,
    ) -> Arc<Self> {
        let coordinator = Arc::new_cyclic(|weak: &Weak<Self>| {
            let refresh_target = weak.clone();
            let request_refresh_debouncer = Debouncer::new(
                config.name.clone(),
                config.request_refresh_cooldown,
                config.request_refresh_immediate,
                move || {
                    let coordinator = refresh_target.upgrade();
                    async move {
                        match coordinator {
                            Some(coordinator) => coordinator.async_refresh().await,
                            None => Ok(()),
                        }
                    }
                },
            );

            Self {
                name: config.name,
                update_method,
                request_refresh_debouncer,
                state: Mutex::new(CoordinatorState {
                    data: None,
                    last_update_success: true,
                    attempted: false,
                    stopped: false,
                    update_interval: config.update_interval,
                    unsub_refresh: None,
                    last_exception: None,
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                unsub_shutdown: Mutex::new(None),
                weak_self: weak.clone(),
            }
        });

        let weak = Arc::downgrade(&coordinator);
        let unsub = opp.bus.listen_once(OPENPEERPOWER_STOP, move |_| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.stop_refresh();
            }
        });
        *coordinator
            .unsub_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(unsub);

        coordinator
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest successfully fetched value
    pub fn data(&self) -> Option<Arc<T>> {
        self.lock_state().data.clone()
    }

    pub fn last_update_success(&self) -> bool {
        self.lock_state().last_update_success
    }

    /// Error of the last failed refresh, cleared by the next success
    pub fn last_exception(&self) -> Option<UpdateError> {
        self.lock_state().last_exception.clone()
    }

    pub fn status(&self) -> CoordinatorStatus {
        let state = self.lock_state();
        if state.stopped {
            CoordinatorStatus::Stopped
        } else if !state.attempted {
            CoordinatorStatus::NeverUpdated
        } else if state.last_update_success {
            CoordinatorStatus::Healthy
        } else {
            CoordinatorStatus::Degraded
        }
    }

    pub fn update_interval(&self) -> Option<Duration> {
        self.lock_state().update_interval
    }

    /// Change the refresh period; takes effect from now if listeners exist
    pub fn set_update_interval(&self, update_interval: Option<Duration>) {
        {
            let mut state = self.lock_state();
            if state.stopped {
                return;
            }
            state.update_interval = update_interval;
            if update_interval.is_none() {
                if let Some(timer) = state.unsub_refresh.take() {
                    timer.abort();
                }
                return;
            }
        }
        if self.listener_count() > 0 {
            self.schedule_refresh();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    /// Whether an automatic refresh is currently scheduled
    pub fn has_scheduled_refresh(&self) -> bool {
        self.lock_state()
            .unsub_refresh
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Register a callback run after every refresh attempt.
    ///
    /// The first listener starts the refresh schedule; removing the last one
    /// stops it. Registering the same callback twice registers it twice, and
    /// each returned handle removes one registration.
    pub fn async_add_listener<F>(&self, update_callback: F) -> RemoveListener
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let schedule = {
            let mut listeners = self.lock_listeners();
            listeners.push((id, Arc::new(update_callback)));
            listeners.len() == 1
        };
        if schedule {
            self.schedule_refresh();
        }

        let weak = self.weak_self.clone();
        RemoveListener::new(move || {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.remove_listener(id);
            }
        })
    }

    fn remove_listener(&self, id: u64) {
        let empty = {
            let mut listeners = self.lock_listeners();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            listeners.is_empty()
        };
        if empty {
            if let Some(timer) = self.lock_state().unsub_refresh.take() {
                timer.abort();
            }
        }
    }

    /// Arm the timer for the next automatic refresh
    fn schedule_refresh(&self) {
        let mut state = self.lock_state();
        if state.stopped {
            return;
        }
        let Some(interval) = state.update_interval else {
            return;
        };
        let Ok(interval) = chrono::Duration::from_std(interval) else {
            warn!(coordinator = %self.name, ?interval, "Update interval out of range, not scheduling");
            return;
        };

        if let Some(timer) = state.unsub_refresh.take() {
            timer.abort();
        }

        let weak = self.weak_self.clone();
        let next = floor_to_second(Utc::now()) + interval;
        state.unsub_refresh = Some(track_point_in_utc_time(next, move || {
            if let Some(coordinator) = weak.upgrade() {
                tokio::spawn(async move { coordinator.handle_refresh_interval().await });
            }
        }));
    }

    async fn handle_refresh_interval(&self) {
        if let Err(err) = self.async_refresh().await {
            error!(coordinator = %self.name, error = %err, "Scheduled refresh failed");
        }
    }

    /// Request a refresh through the debouncer.
    ///
    /// Bursts of requests within the cooldown collapse into one fetch.
    pub async fn async_request_refresh(&self) -> Result<(), UpdateError> {
        self.request_refresh_debouncer.call().await
    }

    /// Fetch new data now.
    ///
    /// Fetch failures are recorded in [`Self::last_update_success`] and
    /// logged once when the coordinator starts failing; they are not
    /// returned. Only a missing update method is an error.
    pub async fn async_refresh(&self) -> Result<(), UpdateError> {
        {
            let mut state = self.lock_state();
            if let Some(timer) = state.unsub_refresh.take() {
                timer.abort();
            }
            if state.stopped {
                debug!(coordinator = %self.name, "Coordinator stopped, skipping refresh");
                return Ok(());
            }
        }
        self.request_refresh_debouncer.cancel();

        let Some(update_method) = self.update_method.clone() else {
            self.lock_state().last_exception = Some(UpdateError::NotImplemented);
            if self.listener_count() > 0 {
                self.schedule_refresh();
            }
            return Err(UpdateError::NotImplemented);
        };

        let start = Instant::now();
        let result = update_method().await;

        {
            let mut state = self.lock_state();
            state.attempted = true;
            match result {
                Ok(data) => {
                    state.data = Some(Arc::new(data));
                    state.last_exception = None;
                    if !state.last_update_success {
                        state.last_update_success = true;
                        info!("Fetching {} data recovered", self.name);
                    }
                }
                Err(UpdateError::NotImplemented) => {
                    state.last_exception = Some(UpdateError::NotImplemented);
                    drop(state);
                    if self.listener_count() > 0 {
                        self.schedule_refresh();
                    }
                    return Err(UpdateError::NotImplemented);
                }
                Err(err) => {
                    if state.last_update_success {
                        state.last_update_success = false;
                        match &err {
                            UpdateError::Timeout => error!("Timeout fetching {} data", self.name),
                            UpdateError::Connection(reason) => {
                                error!("Error requesting {} data: {}", self.name, reason)
                            }
                            UpdateError::UpdateFailed(reason) => {
                                error!("Error fetching {} data: {}", self.name, reason)
                            }
                            _ => error!("Unexpected error fetching {} data: {}", self.name, err),
                        }
                    }
                    state.last_exception = Some(err);
                }
            }
        }

        debug!(
            "Finished fetching {} data in {:.3} seconds",
            self.name,
            start.elapsed().as_secs_f64()
        );

        self.notify_listeners();
        Ok(())
    }

    /// Store data obtained elsewhere, e.g. from a push message, and notify
    /// listeners without fetching
    pub fn async_set_updated_data(&self, data: T) {
        {
            let mut state = self.lock_state();
            if let Some(timer) = state.unsub_refresh.take() {
                timer.abort();
            }
            state.data = Some(Arc::new(data));
            state.attempted = true;
            state.last_update_success = true;
            state.last_exception = None;
        }
        self.request_refresh_debouncer.cancel();
        debug!("Manually updated {} data", self.name);

        self.notify_listeners();
    }

    /// Reschedule if anyone is listening, then call every listener in
    /// registration order
    fn notify_listeners(&self) {
        let listeners: Vec<Listener> = self
            .lock_listeners()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        if !listeners.is_empty() {
            self.schedule_refresh();
        }
        for listener in listeners {
            listener();
        }
    }

    /// Refresh during config entry setup.
    ///
    /// A failed fetch becomes [`SetupError::NotReady`] so the platform retries
    /// setup with backoff.
    pub async fn async_config_entry_first_refresh(&self) -> Result<(), SetupError> {
        self.async_refresh()
            .await
            .map_err(|err| SetupError::Failed(err.to_string()))?;
        if self.last_update_success() {
            return Ok(());
        }
        let reason = self
            .last_exception()
            .map(|err| err.to_string())
            .unwrap_or_else(|| format!("{} data not available", self.name));
        Err(SetupError::NotReady(reason))
    }

    /// Stop scheduling refreshes for good
    pub fn async_shutdown(&self) {
        if let Some(unsub) = self
            .unsub_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            unsub.remove();
        }
        self.stop_refresh();
    }

    fn stop_refresh(&self) {
        {
            let mut state = self.lock_state();
            state.stopped = true;
            state.update_interval = None;
            if let Some(timer) = state.unsub_refresh.take() {
                timer.abort();
            }
        }
        self.request_refresh_debouncer.cancel();
        debug!(coordinator = %self.name, "Stopped refreshing");
    }
}

impl<T> Drop for DataUpdateCoordinator<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.unsub_refresh.take() {
            timer.abort();
        }
        if let Some(unsub) = self
            .unsub_shutdown
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            unsub.remove();
        }
    }
}
