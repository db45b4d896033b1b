//! Timer helpers
//!
//! Both helpers must be called from within a tokio runtime. Sleeping goes
//! through `tokio::time`, so they follow a paused test clock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use opp_core::RemoveListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Run `action` once at `point_in_time`.
///
/// A point in the past runs on the next tick of the runtime. Aborting the
/// returned handle cancels the call.
pub fn track_point_in_utc_time<F>(point_in_time: DateTime<Utc>, action: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    let delay = (point_in_time - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        action();
    })
}

/// Run `action` every `interval`, starting one interval from now.
///
/// `action` runs inline on the timer task; anything slow should be spawned
/// by the callback itself so the cadence does not drift.
pub fn track_time_interval<F>(interval: Duration, action: F) -> RemoveListener
where
    F: Fn() + Send + Sync + 'static,
{
    let task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            action();
        }
    });
    RemoveListener::new(move || task.abort())
}

/// Drop the sub-second part of a timestamp
pub fn floor_to_second(time: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = time.timestamp_subsec_nanos();
    time - chrono::Duration::nanoseconds(i64::from(nanos))
}
