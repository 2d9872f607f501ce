use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone, Timelike};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shortest period a loop may run at
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Handle to a named background loop
pub struct ScheduledTask {
    pub name: String,
    pub handle: JoinHandle<()>,
}

/// Spawns periodic loops that stop when the shared token is cancelled
#[derive(Clone)]
pub struct Scheduler {
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `task` after `initial_delay`, then every `period`.
    ///
    /// A tick that overruns its period delays the next one instead of bursting.
    pub fn every<F, Fut>(&self, name: &str, initial_delay: Duration, period: Duration, mut task: F) -> ScheduledTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let task_name = name.to_string();

        if period < MIN_PERIOD {
            warn!(task = name, period_ms = period.as_millis() as u64, "period too short, using 1s");
        }
        let period = period.max(MIN_PERIOD);

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut timer = interval_at(start, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }

                debug!(task = %task_name, "tick");

                // a tick in flight finishes unless shutdown interrupts it
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = task() => {}
                }
            }

            info!(task = %task_name, "scheduled task stopped");
        });

        ScheduledTask { name: name.to_string(), handle }
    }

    /// Run `task` at the next local `hour`:00, then every `period`
    pub fn daily_at<F, Fut>(&self, name: &str, hour: u32, period: Duration, task: F) -> ScheduledTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = delay_until_hour(Local::now(), hour);
        info!(task = name, hour, delay_secs = delay.as_secs(), "daily task scheduled");
        self.every(name, delay, period, task)
    }
}

/// Time from `now` until the next occurrence of `hour`:00:00 in `now`'s zone.
///
/// If `now` is exactly on the hour the next day is used.
pub fn delay_until_hour<Tz: TimeZone>(now: DateTime<Tz>, hour: u32) -> Duration {
    let hour = hour.min(23);

    let today = now
        .with_hour(hour)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0));

    let next = match today {
        Some(candidate) if candidate > now => candidate,
        Some(candidate) => candidate + ChronoDuration::days(1),
        // hour skipped by a DST change, retry tomorrow at the same wall time
        None => now.clone() + ChronoDuration::days(1),
    };

    (next - now).to_std().unwrap_or(Duration::from_secs(0))
}
