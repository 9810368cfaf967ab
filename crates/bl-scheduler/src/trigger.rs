//! Schedule entries and their due checks.

use std::str::FromStr;
use std::time::Duration;

use bl_common::{RetryPolicy, TaskRequest};
use bl_config::ScheduleEntryConfig;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::{Map, Value};
use tracing::warn;

use crate::{Result, SchedulerError};

/// Upper bound on cron occurrences walked in one due check. A longer backlog
/// is worked off over the following ticks.
const MAX_CRON_CATCH_UP: usize = 10_000;

#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fire every `period`, aligned to the previous window.
    Interval(Duration),
    /// Fire at each crontab occurrence.
    Cron { expression: String, schedule: Schedule },
}

/// Result of checking one entry against the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueCheck {
    /// Fire now and record `window` as the new last-fired-at.
    Fire { window: DateTime<Utc> },
    /// No history yet; record `at` without firing.
    Baseline { at: DateTime<Utc> },
    NotDue,
}

impl Trigger {
    pub fn interval(period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(SchedulerError::InvalidTrigger {
                entry: String::new(),
                reason: "interval must be positive".to_string(),
            });
        }
        Ok(Trigger::Interval(period))
    }

    /// Parse a crontab expression. Five-field expressions get a leading seconds field of `0`.
    pub fn cron(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let normalized = if expression.split_whitespace().count() == 5 {
            format!("0 {expression}")
        } else {
            expression.to_string()
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidTrigger {
            entry: String::new(),
            reason: format!("invalid cron expression '{expression}': {e}"),
        })?;

        Ok(Trigger::Cron {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// `(kind, spec)` as persisted by schedule stores.
    pub fn to_parts(&self) -> (&'static str, String) {
        match self {
            Trigger::Interval(period) => ("interval", period.as_millis().to_string()),
            Trigger::Cron { expression, .. } => ("cron", expression.clone()),
        }
    }

    pub fn from_parts(kind: &str, spec: &str) -> Result<Self> {
        match kind {
            "interval" => {
                let millis: u64 = spec.parse().map_err(|_| SchedulerError::InvalidTrigger {
                    entry: String::new(),
                    reason: format!("invalid interval '{spec}'"),
                })?;
                Self::interval(Duration::from_millis(millis))
            }
            "cron" => Self::cron(spec),
            other => Err(SchedulerError::InvalidTrigger {
                entry: String::new(),
                reason: format!("unknown trigger kind '{other}'"),
            }),
        }
    }

    pub fn period(&self) -> Option<Duration> {
        match self {
            Trigger::Interval(period) => Some(*period),
            Trigger::Cron { .. } => None,
        }
    }

    /// Decide whether an entry last fired at `last_fired` is due at `now`.
    ///
    /// Interval windows are `last + k * period` for the largest `k` that is not
    /// in the future; cron windows are the latest occurrence in `(last, now]`.
    pub fn check(&self, last_fired: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DueCheck {
        match self {
            Trigger::Interval(period) => {
                let Some(last) = last_fired else {
                    return DueCheck::Fire { window: now };
                };
                let Ok(elapsed) = (now - last).to_std() else {
                    // Wall clock moved behind the recorded window
                    return DueCheck::NotDue;
                };
                if elapsed < *period {
                    return DueCheck::NotDue;
                }
                let periods = elapsed.as_nanos() / period.as_nanos().max(1);
                let advance = period.as_nanos().saturating_mul(periods);
                let window = i64::try_from(advance)
                    .ok()
                    .map(chrono::Duration::nanoseconds)
                    .and_then(|d| last.checked_add_signed(d))
                    .unwrap_or(now);
                DueCheck::Fire { window }
            }
            Trigger::Cron { schedule, expression } => {
                let Some(last) = last_fired else {
                    return DueCheck::Baseline { at: now };
                };
                let mut latest = None;
                for (walked, occurrence) in schedule.after(&last).enumerate() {
                    if occurrence > now {
                        break;
                    }
                    latest = Some(occurrence);
                    if walked + 1 >= MAX_CRON_CATCH_UP {
                        warn!(expression = %expression, "Cron backlog truncated");
                        break;
                    }
                }
                match latest {
                    Some(window) => DueCheck::Fire { window },
                    None => DueCheck::NotDue,
                }
            }
        }
    }
}

/// A periodic task definition plus its persisted firing state.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub name: String,
    pub task_name: String,
    pub trigger: Trigger,
    pub enabled: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Upper bound of the random countdown added to each enqueued task
    pub jitter: Duration,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub queue: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
}

impl ScheduleEntry {
    pub fn new(name: impl Into<String>, task_name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            task_name: task_name.into(),
            trigger,
            enabled: true,
            last_fired_at: None,
            jitter: Duration::ZERO,
            args: Vec::new(),
            kwargs: Map::new(),
            queue: None,
            retry_policy: None,
        }
    }

    pub fn from_config(config: &ScheduleEntryConfig) -> Result<Self> {
        let with_entry = |e: SchedulerError| match e {
            SchedulerError::InvalidTrigger { reason, .. } => SchedulerError::InvalidTrigger {
                entry: config.name.clone(),
                reason,
            },
            other => other,
        };

        let trigger = match (config.every_secs, &config.cron) {
            (Some(secs), None) => Trigger::interval(Duration::from_secs(secs)).map_err(with_entry)?,
            (None, Some(expression)) => Trigger::cron(expression).map_err(with_entry)?,
            _ => {
                return Err(SchedulerError::InvalidTrigger {
                    entry: config.name.clone(),
                    reason: "set exactly one of every_secs or cron".to_string(),
                })
            }
        };

        Ok(Self {
            name: config.name.clone(),
            task_name: config.task.clone(),
            trigger,
            enabled: config.enabled,
            last_fired_at: None,
            jitter: Duration::from_secs(config.jitter_secs),
            args: config.args.clone(),
            kwargs: config.kwargs.clone(),
            queue: config.queue.clone(),
            retry_policy: config.retry_policy.clone(),
        })
    }

    /// Task request for one firing, delayed by `countdown` seconds.
    pub fn request(&self, countdown: f64) -> TaskRequest {
        let mut request = TaskRequest::new(self.task_name.clone())
            .with_args(self.args.clone())
            .with_kwargs(self.kwargs.clone());
        if let Some(queue) = &self.queue {
            request = request.with_queue(queue.clone());
        }
        if let Some(policy) = &self.retry_policy {
            request = request.with_retry_policy(policy.clone());
        }
        if countdown > 0.0 {
            request = request.with_countdown(countdown);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_interval_first_tick_fires() {
        let trigger = Trigger::interval(Duration::from_secs(60)).unwrap();
        assert_eq!(trigger.check(None, at(5)), DueCheck::Fire { window: at(5) });
    }

    #[test]
    fn test_interval_not_due_before_period() {
        let trigger = Trigger::interval(Duration::from_secs(60)).unwrap();
        assert_eq!(trigger.check(Some(at(0)), at(59)), DueCheck::NotDue);
        assert_eq!(trigger.check(Some(at(0)), at(60)), DueCheck::Fire { window: at(60) });
    }

    #[test]
    fn test_interval_window_aligned_despite_late_tick() {
        let trigger = Trigger::interval(Duration::from_secs(60)).unwrap();
        // tick arrives 7s late: window stays on the grid
        assert_eq!(trigger.check(Some(at(0)), at(67)), DueCheck::Fire { window: at(60) });
        // several missed windows collapse into one firing at the latest window
        assert_eq!(trigger.check(Some(at(0)), at(250)), DueCheck::Fire { window: at(240) });
    }

    #[test]
    fn test_interval_clock_behind_last_fire() {
        let trigger = Trigger::interval(Duration::from_secs(60)).unwrap();
        assert_eq!(trigger.check(Some(at(100)), at(50)), DueCheck::NotDue);
    }

    #[test]
    fn test_cron_baseline_then_fire() {
        let trigger = Trigger::cron("*/5 * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap();
        assert_eq!(trigger.check(None, start), DueCheck::Baseline { at: start });

        let before = Utc.with_ymd_and_hms(2024, 1, 1, 12, 4, 59).unwrap();
        assert_eq!(trigger.check(Some(start), before), DueCheck::NotDue);

        let after = Utc.with_ymd_and_hms(2024, 1, 1, 12, 11, 30).unwrap();
        let window = Utc.with_ymd_and_hms(2024, 1, 1, 12, 10, 0).unwrap();
        assert_eq!(trigger.check(Some(start), after), DueCheck::Fire { window });
    }

    #[test]
    fn test_cron_six_field_and_invalid() {
        assert!(Trigger::cron("30 0 3 * * *").is_ok());
        assert!(Trigger::cron("not a cron").is_err());
        assert!(Trigger::interval(Duration::ZERO).is_err());
    }

    #[test]
    fn test_parts_round_trip_for_store() {
        let (kind, spec) = Trigger::cron("0 3 * * *").unwrap().to_parts();
        assert_eq!((kind, spec.as_str()), ("cron", "0 3 * * *"));
        let restored = Trigger::from_parts(kind, &spec).unwrap();
        assert!(matches!(restored, Trigger::Cron { .. }));

        let (kind, spec) = Trigger::interval(Duration::from_secs(90)).unwrap().to_parts();
        assert_eq!(Trigger::from_parts(kind, &spec).unwrap().period(), Some(Duration::from_secs(90)));
        assert!(Trigger::from_parts("weekly", "1").is_err());
    }

    #[test]
    fn test_entry_from_config() {
        let config = ScheduleEntryConfig {
            name: "purge".into(),
            task: "delete_expired_activation_tokens".into(),
            every_secs: Some(86_400),
            jitter_secs: 30,
            queue: Some("maintenance".into()),
            ..Default::default()
        };
        let entry = ScheduleEntry::from_config(&config).unwrap();
        assert_eq!(entry.trigger.period(), Some(Duration::from_secs(86_400)));
        assert_eq!(entry.jitter, Duration::from_secs(30));

        let request = entry.request(12.5);
        assert_eq!(request.task_name, "delete_expired_activation_tokens");
        assert_eq!(request.queue.as_deref(), Some("maintenance"));
        assert_eq!(request.countdown, Some(12.5));

        let both = ScheduleEntryConfig {
            name: "bad".into(),
            task: "t".into(),
            every_secs: Some(1),
            cron: Some("* * * * *".into()),
            ..Default::default()
        };
        assert!(matches!(
            ScheduleEntry::from_config(&both),
            Err(SchedulerError::InvalidTrigger { entry, .. }) if entry == "bad"
        ));
    }
}
