//! Scheduler Engine — one long-lived loop per report schedule.
//!
//! Polls at a short interval until the wall clock enters a firing window,
//! persists the idempotency marker, runs the dispatch pipeline, then sleeps
//! until the next occurrence. Sleeps are interruptible by shutdown and reload.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use milo_core::config::SchedulerConfig;
use milo_core::error::{MiloError, Result};
use milo_core::traits::ScheduleStore;
use milo_core::types::{RunTrigger, ScheduleKey};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;

use crate::pipeline::ReportDispatch;
use crate::recurrence;

/// Where a scheduler loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Polling,
    Firing,
    ComputingNextWindow,
    Sleeping,
    Stopped,
}

/// Timing knobs for the loop.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub poll_interval: Duration,
    pub window: Duration,
    pub error_backoff: Duration,
    pub utc_offset: FixedOffset,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl SchedulerOptions {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let utc_offset = FixedOffset::east_opt(config.utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| {
                tracing::warn!(
                    "⚠️ utc_offset_minutes={} out of range, using UTC",
                    config.utc_offset_minutes
                );
                Utc.fix()
            });
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            window: Duration::from_secs(config.window_secs.max(1)),
            error_backoff: Duration::from_secs(config.error_backoff_secs.max(1)),
            utc_offset,
        }
    }

    fn window_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::seconds(60))
    }
}

/// Source of "now". Swapped out in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What one poll decided.
struct TickOutcome {
    fired: bool,
    next_fire: Option<DateTime<Utc>>,
}

/// The loop for a single `(report_type, scope)` schedule.
pub struct TriggerScheduler {
    key: ScheduleKey,
    store: Arc<dyn ScheduleStore>,
    dispatch: Arc<dyn ReportDispatch>,
    options: SchedulerOptions,
    clock: Arc<dyn Clock>,
    state: watch::Sender<SchedulerState>,
    reload: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
}

impl TriggerScheduler {
    pub fn new(
        key: ScheduleKey,
        store: Arc<dyn ScheduleStore>,
        dispatch: Arc<dyn ReportDispatch>,
        options: SchedulerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            key,
            store,
            dispatch,
            options,
            clock: Arc::new(SystemClock),
            state: watch::Sender::new(SchedulerState::Idle),
            reload: Arc::new(Notify::new()),
            shutdown,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Notifying this wakes the loop so it re-reads the schedule.
    pub fn reload_handle(&self) -> Arc<Notify> {
        self.reload.clone()
    }

    pub fn state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }

    /// Run until shutdown. Never returns on tick errors.
    pub async fn run(mut self) {
        tracing::info!(
            "⏰ Scheduler started for {} (poll every {}s)",
            self.key,
            self.options.poll_interval.as_secs()
        );

        while !*self.shutdown.borrow() {
            self.set_state(SchedulerState::Polling);
            let wait = match self.tick().await {
                Ok(outcome) => self.wait_after(&outcome),
                Err(e) => {
                    tracing::error!(
                        "❌ Scheduler tick failed for {}: {e} — retrying in {}s",
                        self.key,
                        self.options.error_backoff.as_secs()
                    );
                    self.options.error_backoff
                }
            };
            if !self.pause(wait).await {
                break;
            }
        }

        self.set_state(SchedulerState::Stopped);
        tracing::info!("⏹️ Scheduler stopped for {}", self.key);
    }

    /// One poll: read a fresh snapshot, fire if due.
    async fn tick(&self) -> Result<TickOutcome> {
        let now = self.clock.now();
        let schedule = self
            .store
            .load_schedule(&self.key)
            .await
            .map_err(|e| MiloError::SchedulerTick(format!("load schedule {}: {e}", self.key)))?;

        let Some(schedule) = schedule else {
            return Ok(TickOutcome {
                fired: false,
                next_fire: None,
            });
        };

        let offset = self.options.utc_offset;
        if !recurrence::is_due(&schedule, now, offset, self.options.window_delta()) {
            return Ok(TickOutcome {
                fired: false,
                next_fire: schedule
                    .is_schedulable()
                    .then(|| recurrence::next_fire_after(&schedule, now, offset))
                    .flatten(),
            });
        }

        self.set_state(SchedulerState::Firing);
        tracing::info!("🔔 Schedule due: {} ({})", self.key, schedule.frequency.as_str());

        // Marker first: a crash after this point cannot fire the same period twice.
        self.store
            .mark_fired(&self.key, now)
            .await
            .map_err(|e| MiloError::SchedulerTick(format!("persist last_run_at for {}: {e}", self.key)))?;

        match self
            .dispatch
            .run(&self.key.report_type, self.key.scope, RunTrigger::Scheduled)
            .await
        {
            Ok(result) => tracing::info!(
                "✅ Scheduled {} done: sent {}/{} (failed {})",
                self.key,
                result.sent,
                result.attempted,
                result.failed
            ),
            Err(e) => tracing::error!("❌ Scheduled dispatch for {} failed: {e}", self.key),
        }

        self.set_state(SchedulerState::ComputingNextWindow);
        let next_fire = recurrence::next_fire_after(&schedule, self.clock.now(), offset);
        if let Some(next) = next_fire {
            tracing::info!("📅 Next {} run at {}", self.key, next.to_rfc3339());
        }
        Ok(TickOutcome {
            fired: true,
            next_fire,
        })
    }

    /// How long to wait before the next poll.
    fn wait_after(&self, outcome: &TickOutcome) -> Duration {
        let until_next = outcome
            .next_fire
            .map(|next| (next - self.clock.now()).to_std().unwrap_or(Duration::ZERO));

        match (outcome.fired, until_next) {
            (true, Some(until)) => {
                self.set_state(SchedulerState::Sleeping);
                until
            }
            (false, Some(until)) => until.min(self.options.poll_interval),
            (_, None) => self.options.poll_interval,
        }
    }

    /// Sleep, waking early on reload. Returns `false` on shutdown.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.reload.notified() => {
                tracing::debug!("Schedule {} reloaded", self.key);
                true
            }
            changed = self.shutdown.changed() => changed.is_ok() && !*self.shutdown.borrow(),
        }
    }
}

struct SchedulerHandle {
    reload: Arc<Notify>,
    state: watch::Receiver<SchedulerState>,
    task: JoinHandle<()>,
}

/// Owns one `TriggerScheduler` task per schedule key.
pub struct SchedulerRegistry {
    store: Arc<dyn ScheduleStore>,
    dispatch: Arc<dyn ReportDispatch>,
    options: SchedulerOptions,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
    schedulers: Mutex<HashMap<ScheduleKey, SchedulerHandle>>,
}

impl SchedulerRegistry {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        dispatch: Arc<dyn ReportDispatch>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            store,
            dispatch,
            options,
            clock: Arc::new(SystemClock),
            shutdown_tx: watch::Sender::new(false),
            schedulers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Shutdown channel shared with the schedulers (and the dispatcher).
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a scheduler for every stored schedule. Returns how many run.
    pub async fn start(&self) -> Result<usize> {
        let schedules = self.store.list_schedules().await?;
        for schedule in &schedules {
            self.ensure(&schedule.key()).await;
        }
        let count = self.schedulers.lock().await.len();
        tracing::info!("⏰ {count} report scheduler(s) running");
        Ok(count)
    }

    /// Spawn a scheduler for `key`, or wake the existing one to reload.
    pub async fn ensure(&self, key: &ScheduleKey) {
        if *self.shutdown_tx.borrow() {
            return;
        }
        let mut schedulers = self.schedulers.lock().await;
        if let Some(handle) = schedulers.get(key)
            && !handle.task.is_finished()
        {
            handle.reload.notify_one();
            return;
        }

        let scheduler = TriggerScheduler::new(
            key.clone(),
            self.store.clone(),
            self.dispatch.clone(),
            self.options.clone(),
            self.shutdown_tx.subscribe(),
        )
        .with_clock(self.clock.clone());
        let handle = SchedulerHandle {
            reload: scheduler.reload_handle(),
            state: scheduler.state(),
            task: tokio::spawn(scheduler.run()),
        };
        schedulers.insert(key.clone(), handle);
    }

    pub async fn keys(&self) -> Vec<ScheduleKey> {
        self.schedulers.lock().await.keys().cloned().collect()
    }

    pub async fn state(&self, key: &ScheduleKey) -> Option<SchedulerState> {
        self.schedulers
            .lock()
            .await
            .get(key)
            .map(|h| *h.state.borrow())
    }

    /// Signal every loop to stop and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<_> = self.schedulers.lock().await.drain().collect();
        let (keys, tasks): (Vec<_>, Vec<_>) = handles.into_iter().map(|(k, h)| (k, h.task)).unzip();
        for (key, joined) in keys.iter().zip(futures::future::join_all(tasks).await) {
            if let Err(e) = joined {
                tracing::warn!("⚠️ Scheduler task for {key} ended abnormally: {e}");
            }
        }
    }
}
