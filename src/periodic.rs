//! Cancellable, reschedulable periodic tasks.
//!
//! Every background activity of the gateway (a connection's round-robin tick,
//! the export sweep, compaction, trend checks, config sync) is a tokio task
//! driven by `tokio::time::interval` plus a `watch` channel carrying its
//! period. Sending a new period reschedules the ticker; sending `None`, calling
//! [`TaskHandle::cancel`] or dropping the handle stops it.
//!
//! Ticks never overlap: the next tick is only awaited after the previous body
//! has finished, and missed ticks are skipped rather than bunched up.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a task started with [`spawn_periodic`].
pub struct TaskHandle {
    name: String,
    period: watch::Sender<Option<Duration>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current period, `None` once cancelled.
    pub fn period(&self) -> Option<Duration> {
        *self.period.borrow()
    }

    /// Switch to a new period. The next tick fires one new period from now.
    /// Returns false if the task was cancelled or the period is unchanged.
    pub fn reschedule(&self, period: Duration) -> bool {
        let period = period.max(MIN_PERIOD);
        let changed = self.period.send_if_modified(|current| match current {
            Some(p) if *p != period => {
                *current = Some(period);
                true
            }
            _ => false,
        });
        if changed {
            tracing::debug!(task = %self.name, ?period, "Task rescheduled");
        }
        changed
    }

    /// Stop after the current tick (if any) completes.
    pub fn cancel(&self) {
        self.period.send_replace(None);
    }

    pub fn is_cancelled(&self) -> bool {
        self.period().is_none()
    }

    /// Cancel and wait for the task to exit.
    pub async fn shutdown(&self) {
        self.cancel();
        let join = self.join.lock().take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                tracing::warn!(task = %self.name, error = %e, "Task ended abnormally");
            }
        }
    }
}

fn ticker(period: Duration, start: Instant) -> Interval {
    let mut interval = interval_at(start, period.max(MIN_PERIOD));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Run `tick` every `period`, the first time immediately.
pub fn spawn_periodic<F, Fut>(name: impl Into<String>, period: Duration, tick: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    spawn_periodic_at(name, period, Instant::now(), tick)
}

/// Run `tick` every `period`, the first time at `start`.
pub fn spawn_periodic_at<F, Fut>(name: impl Into<String>, period: Duration, start: Instant, mut tick: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let period = period.max(MIN_PERIOD);
    let (tx, mut rx) = watch::channel(Some(period));
    let task_name = name.clone();

    let join = tokio::spawn(async move {
        let mut interval = ticker(period, start);
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = *rx.borrow_and_update();
                    match next {
                        Some(period) => interval = ticker(period, Instant::now() + period),
                        None => break,
                    }
                }
            }
        }
        tracing::debug!(task = %task_name, "Periodic task stopped");
    });

    TaskHandle {
        name,
        period: tx,
        join: Mutex::new(Some(join)),
    }
}
