//! Periodic driver for the lifecycle orchestrator.
//!
//! Each tick lists the active and expired sets and spawns one task per pass.
//! A pass whose task from an earlier tick is still running is skipped, so a
//! slow broker never leads to two overlapping transitions for one pass.

use crate::lifecycle::clock::delay_until_next_boundary;
use crate::lifecycle::orchestrator::Orchestrator;
use crate::models::Pass;
use crate::services::metrics::{SCHEDULER_DISPATCHED, SCHEDULER_SKIPPED_TOTAL, SCHEDULER_TICKS_TOTAL};
use dashmap::DashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatched: usize,
    /// Passes still held by a task from an earlier tick.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy)]
enum Evaluation {
    Active,
    Expired,
}

/// Marks a pass as in flight until dropped.
struct InFlightGuard {
    set: Arc<DashSet<String>>,
    name: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<DashSet<String>>, name: &str) -> Option<Self> {
        if set.insert(name.to_string()) {
            Some(Self {
                set: Arc::clone(set),
                name: name.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.name);
    }
}

pub struct PassScheduler {
    orchestrator: Arc<Orchestrator>,
    period: Duration,
    in_flight: Arc<DashSet<String>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PassScheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, period: Duration) -> Self {
        Self {
            orchestrator,
            period,
            in_flight: Arc::new(DashSet::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            timer: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start the timer. Claims left by an earlier process are released
    /// first, then the first tick lands on the next wall-clock multiple of
    /// the period. Calling `start` twice is a no-op. A stopped scheduler
    /// cannot be restarted; build a new one.
    pub fn start(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            tracing::warn!("Scheduler has been stopped and cannot be restarted");
            return;
        }
        let Ok(mut timer) = self.timer.lock() else {
            tracing::error!("Scheduler timer lock poisoned, not starting");
            return;
        };
        if timer.is_some() {
            tracing::warn!("Scheduler already started");
            return;
        }

        let scheduler = Arc::clone(self);
        *timer = Some(tokio::spawn(async move { scheduler.run().await }));
    }

    async fn run(&self) {
        match self.orchestrator.release_interrupted_claims().await {
            Ok(0) => {}
            Ok(released) => tracing::warn!(released, "Released claims of interrupted transitions"),
            Err(e) => tracing::error!(error = %e, "Failed to release interrupted claims"),
        }

        let delay = delay_until_next_boundary(self.orchestrator.clock().now(), self.period);
        tracing::info!(
            period_secs = self.period.as_secs(),
            first_tick_in_ms = delay.as_millis() as u64,
            "Pass scheduler started"
        );

        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Pass scheduler timer stopped");
                    break;
                }
                _ = interval.tick() => {
                    let summary = self.run_tick().await;
                    tracing::debug!(
                        dispatched = summary.dispatched,
                        skipped = summary.skipped,
                        "Scheduler tick"
                    );
                }
            }
        }
    }

    /// Stop the timer and wait for in-flight pass tasks to finish. Provisioning
    /// calls already running are not cancelled.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let handle = self.timer.lock().ok().and_then(|mut timer| timer.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Scheduler timer task failed");
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Pass scheduler stopped");
    }

    /// Evaluate both sets once. Returns as soon as the per-pass tasks are
    /// spawned; use [`PassScheduler::wait_idle`] to wait for them.
    pub async fn run_tick(&self) -> TickSummary {
        metrics::counter!(SCHEDULER_TICKS_TOTAL).increment(1);
        let mut summary = TickSummary::default();

        match self.orchestrator.active_passes().await {
            Ok(passes) => {
                for pass in passes {
                    self.dispatch(pass, Evaluation::Active, &mut summary);
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to list active passes"),
        }

        match self.orchestrator.expired_passes().await {
            Ok(passes) => {
                for pass in passes {
                    self.dispatch(pass, Evaluation::Expired, &mut summary);
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to list expired passes"),
        }

        metrics::gauge!(SCHEDULER_DISPATCHED).set(summary.dispatched as f64);
        summary
    }

    /// Wait until every spawned pass task has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    fn dispatch(&self, pass: Pass, evaluation: Evaluation, summary: &mut TickSummary) {
        let Some(guard) = InFlightGuard::acquire(&self.in_flight, &pass.name) else {
            tracing::debug!(pass = %pass.name, "Pass still in flight, skipping");
            metrics::counter!(SCHEDULER_SKIPPED_TOTAL).increment(1);
            summary.skipped += 1;
            return;
        };

        let orchestrator = Arc::clone(&self.orchestrator);
        self.tracker.spawn(async move {
            let _guard = guard;
            let name = pass.name.clone();
            let result = match evaluation {
                Evaluation::Active => orchestrator.evaluate_active(pass).await,
                Evaluation::Expired => orchestrator.evaluate_expired(pass).await,
            };
            if let Err(e) = result {
                tracing::error!(pass = %name, error = %e, "Pass evaluation failed");
            }
        });
        summary.dispatched += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_guard_releases_on_drop() {
        let set = Arc::new(DashSet::new());
        let guard = InFlightGuard::acquire(&set, "alpha").unwrap();
        assert!(InFlightGuard::acquire(&set, "alpha").is_none());
        assert!(InFlightGuard::acquire(&set, "beta").is_some());

        drop(guard);
        assert!(InFlightGuard::acquire(&set, "alpha").is_some());
    }
}
