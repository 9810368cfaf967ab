//! The fire-and-persist cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bl_standby::StandbyGuard;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{SystemClock, WallClock};
use crate::dispatcher::TaskDispatcher;
use crate::store::ScheduleStore;
use crate::trigger::{DueCheck, ScheduleEntry};
use crate::{Result, SchedulerConfig, SchedulerError};

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    /// Entry name and enqueued task id
    pub fired: Vec<(String, Uuid)>,
    pub baselined: Vec<String>,
    /// Enqueue failed; window restored for the next tick
    pub misfired: Vec<String>,
    /// Due by wall clock but fired too recently by the monotonic clock
    pub held_back: Vec<String>,
}

pub struct PeriodicScheduler {
    config: SchedulerConfig,
    store: Arc<dyn ScheduleStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    clock: Arc<dyn WallClock>,
    /// Monotonic time of each entry's last fire in this process
    fired_at: Mutex<HashMap<String, Instant>>,
    tick_lock: tokio::sync::Mutex<()>,
    running: Arc<RwLock<bool>>,
}

/// Millisecond precision, matching what the stores persist.
fn truncate_millis(now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Same entry and window always map to the same task id, so a duplicate
/// firing is deduplicated by the broker.
fn firing_id(entry: &str, window: DateTime<Utc>) -> Uuid {
    let key = format!("{entry}@{}", window.timestamp_millis());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
}

impl PeriodicScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn ScheduleStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Self {
        Self {
            config,
            store,
            dispatcher,
            clock: Arc::new(SystemClock),
            fired_at: Mutex::new(HashMap::new()),
            tick_lock: tokio::sync::Mutex::new(()),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Store configured definitions, keeping persisted last-fired-at.
    ///
    /// Fails without writing anything if an entry names a task outside `catalog`.
    pub async fn sync_entries(&self, entries: &[ScheduleEntry], catalog: &HashSet<String>) -> Result<usize> {
        for entry in entries {
            if !catalog.contains(&entry.task_name) {
                return Err(SchedulerError::UnknownTask {
                    entry: entry.name.clone(),
                    task: entry.task_name.clone(),
                });
            }
        }
        for entry in entries {
            self.store.upsert(entry).await?;
        }
        info!(count = entries.len(), "Schedule entries synchronized");
        Ok(entries.len())
    }

    /// Check every enabled entry once and fire the due ones.
    pub async fn tick(&self) -> Result<TickReport> {
        let _serialized = self.tick_lock.lock().await;
        let now = truncate_millis(self.clock.now());
        let mut report = TickReport::default();

        for entry in self.store.list().await? {
            if !entry.enabled {
                continue;
            }

            match entry.trigger.check(entry.last_fired_at, now) {
                DueCheck::NotDue => {}
                DueCheck::Baseline { at } => {
                    self.store.set_last_fired(&entry.name, Some(at)).await?;
                    debug!(entry = %entry.name, baseline = %at, "Recorded cron baseline");
                    report.baselined.push(entry.name.clone());
                }
                DueCheck::Fire { window } => {
                    if self.fired_too_recently(&entry) {
                        report.held_back.push(entry.name.clone());
                        continue;
                    }
                    match self.fire(&entry, window, now).await {
                        Ok(id) => report.fired.push((entry.name.clone(), id)),
                        Err(SchedulerError::Dispatch(reason)) => {
                            error!(entry = %entry.name, window = %window, error = %reason, "Schedule misfire");
                            metrics::counter!("backlot.scheduler.misfires_total", "entry" => entry.name.clone())
                                .increment(1);
                            report.misfired.push(entry.name.clone());
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Ok(report)
    }

    fn fired_too_recently(&self, entry: &ScheduleEntry) -> bool {
        let Some(period) = entry.trigger.period() else {
            return false;
        };
        let fired_at = self.fired_at.lock();
        match fired_at.get(&entry.name) {
            Some(last) if last.elapsed() < period => {
                warn!(entry = %entry.name, "Wall clock says due but monotonic clock disagrees, holding back");
                true
            }
            _ => false,
        }
    }

    /// Persist the window, then enqueue. On enqueue failure the old window is restored.
    async fn fire(&self, entry: &ScheduleEntry, window: DateTime<Utc>, now: DateTime<Utc>) -> Result<Uuid> {
        self.store.set_last_fired(&entry.name, Some(window)).await?;

        let countdown = if entry.jitter.is_zero() {
            0.0
        } else {
            rand::rng().random_range(0.0..=entry.jitter.as_secs_f64())
        };
        let mut request = entry.request(countdown);
        request.id = Some(firing_id(&entry.name, window));

        match self.dispatcher.dispatch(request).await {
            Ok(id) => {
                // Anchor at the window, not the fire, so a late tick does not push back the next one
                let lag = (now - window).to_std().unwrap_or_default();
                let anchor = Instant::now().checked_sub(lag).unwrap_or_else(Instant::now);
                self.fired_at.lock().insert(entry.name.clone(), anchor);
                metrics::counter!("backlot.scheduler.fired_total", "entry" => entry.name.clone()).increment(1);
                info!(
                    entry = %entry.name,
                    task_name = %entry.task_name,
                    task_id = %id,
                    window = %window,
                    countdown_secs = countdown,
                    "Schedule fired"
                );
                Ok(id)
            }
            Err(e) => {
                if let Err(restore) = self.store.set_last_fired(&entry.name, entry.last_fired_at).await {
                    error!(entry = %entry.name, error = %restore, "Failed to restore last-fired-at after misfire");
                }
                Err(e)
            }
        }
    }

    /// Tick on an interval while `guard` reports leadership.
    pub async fn start(self: &Arc<Self>, guard: StandbyGuard) {
        if !self.config.enabled {
            info!("Periodic scheduler is disabled");
            return;
        }

        let mut running = self.running.write().await;
        if *running {
            warn!("Scheduler already running");
            return;
        }
        *running = true;
        drop(running);

        info!(tick_interval_ms = self.config.tick_interval.as_millis() as u64, "Starting periodic scheduler");

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(scheduler.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !*scheduler.running.read().await {
                    break;
                }
                if !guard.should_process() {
                    continue;
                }
                if let Err(e) = scheduler.tick().await {
                    error!(error = %e, "Scheduler tick failed");
                }
            }
        });
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!("Periodic scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_firing_id_is_stable_per_window() {
        let window = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        assert_eq!(firing_id("purge", window), firing_id("purge", window));
        assert_ne!(firing_id("purge", window), firing_id("purge", later));
        assert_ne!(firing_id("purge", window), firing_id("other", window));
    }
}
