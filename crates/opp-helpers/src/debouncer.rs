//! Collapse bursts of calls into one execution per cooldown window

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, error};

type DebouncedFn<E> = Arc<dyn Fn() -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

/// Runs a function at most once per `cooldown`.
///
/// A call made while the cooldown timer is armed, or while the function is
/// running, is not dropped: it marks the debouncer so the function runs once
/// more when the timer fires. The window is fixed; calls during it do not
/// push the timer back.
pub struct Debouncer<E> {
    inner: Arc<Inner<E>>,
}

struct Inner<E> {
    name: String,
    cooldown: Duration,
    immediate: bool,
    function: DebouncedFn<E>,
    state: Mutex<DebounceState>,
    execute_lock: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct DebounceState {
    timer: Option<JoinHandle<()>>,
    execute_at_end_of_timer: bool,
}

impl<E> Clone for Debouncer<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Debouncer<E>
where
    E: Display + Send + 'static,
{
    /// `immediate` runs the first call right away; otherwise every call waits
    /// for the end of the window.
    pub fn new<F, Fut>(name: impl Into<String>, cooldown: Duration, immediate: bool, function: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let function: DebouncedFn<E> = Arc::new(move || Box::pin(function()));
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                cooldown,
                immediate,
                function,
                state: Mutex::new(DebounceState::default()),
                execute_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.inner.cooldown
    }

    pub fn immediate(&self) -> bool {
        self.inner.immediate
    }

    /// Request an execution.
    ///
    /// Returns the function's result when this call ran it, `Ok(())` when
    /// the request was deferred to the end of the window.
    pub async fn call(&self) -> Result<(), E> {
        let inner = &self.inner;
        {
            let mut state = inner.lock_state();
            if state.timer.is_some() {
                state.execute_at_end_of_timer = true;
                return Ok(());
            }
        }

        let Ok(_guard) = inner.execute_lock.try_lock() else {
            debug!(debouncer = %inner.name, "Call in progress, deferring");
            inner.lock_state().execute_at_end_of_timer = true;
            return Ok(());
        };

        if !inner.immediate {
            let mut state = inner.lock_state();
            state.execute_at_end_of_timer = true;
            Inner::schedule_timer(inner, &mut state);
            return Ok(());
        }

        if inner.lock_state().timer.is_some() {
            return Ok(());
        }

        let result = (inner.function)().await;
        Inner::schedule_timer(inner, &mut inner.lock_state());
        result
    }

    /// Drop the armed timer and any deferred call without running it
    pub fn cancel(&self) {
        let mut state = self.inner.lock_state();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.execute_at_end_of_timer = false;
    }

    /// Whether a call is waiting for the end of the window
    pub fn has_pending_call(&self) -> bool {
        self.inner.lock_state().execute_at_end_of_timer
    }

    /// Whether the cooldown timer is armed
    pub fn is_cooling_down(&self) -> bool {
        self.inner.lock_state().timer.is_some()
    }
}

impl<E> Inner<E>
where
    E: Display + Send + 'static,
{
    fn lock_state(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_timer(inner: &Arc<Self>, state: &mut DebounceState) {
        if let Some(previous) = state.timer.take() {
            previous.abort();
        }
        let this = Arc::clone(inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(this.cooldown).await;
            Inner::on_debounce(this).await;
        }));
    }

    async fn on_debounce(inner: Arc<Self>) {
        {
            let mut state = inner.lock_state();
            // This task is the timer; release the slot without aborting ourselves
            state.timer = None;
            if !state.execute_at_end_of_timer {
                return;
            }
            state.execute_at_end_of_timer = false;
        }

        let Ok(_guard) = inner.execute_lock.try_lock() else {
            return;
        };
        if inner.lock_state().timer.is_some() {
            return;
        }

        if let Err(err) = (inner.function)().await {
            error!(debouncer = %inner.name, error = %err, "Unexpected exception from debounced call");
        }
        Inner::schedule_timer(&inner, &mut inner.lock_state());
    }
}
