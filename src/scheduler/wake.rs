use chrono::{DateTime, NaiveTime, Utc};
use rand::Rng;

use crate::config::{MissedWakePolicy, ScheduleConfig};
use crate::error::Result;
use crate::scheduler::cron::CronExpr;

/// A wake handled later than planned by more than this is missed.
const MISSED_GRACE_SECS: i64 = 60;

/// Bounds for the constraint retry delay.
const RETRY_MIN_SECS: u64 = 30;
const RETRY_MAX_SECS: u64 = 900;
const RETRY_FALLBACK_SECS: u64 = 300;

/// Computes wake instants from the cron expression, the nightly window
/// and the jitter bound.
///
/// A cron instant that falls outside the window is pushed forward to the
/// next window start; a window whose end precedes its start crosses
/// midnight. Jitter is applied after clamping.
#[derive(Debug, Clone)]
pub struct WakePlanner {
    cron: CronExpr,
    window_start: NaiveTime,
    window_end: NaiveTime,
    jitter_ms: u64,
    on_missed: MissedWakePolicy,
}

impl WakePlanner {
    /// Build a planner from an already validated schedule section.
    pub fn from_config(schedule: &ScheduleConfig) -> Result<Self> {
        let cron = CronExpr::parse(&schedule.expression)?;
        let (window_start, window_end) = schedule.window()?;
        Ok(Self {
            cron,
            window_start,
            window_end,
            jitter_ms: schedule.jitter_ms,
            on_missed: schedule.on_missed,
        })
    }

    /// Next planned wake at or after `after`, before jitter.
    pub fn next_due(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let due = self.cron.next_after(after)?;
        Some(self.clamp_to_window(due))
    }

    /// Next planned wake once the wake due at `last_due` has been handled.
    ///
    /// Floors the search one cron tick past `last_due` so a cycle that
    /// finishes within the same minute cannot re-fire the same instant.
    pub fn next_due_after(
        &self,
        last_due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let floor = (last_due + chrono::Duration::minutes(1)).max(now);
        self.next_due(floor)
    }

    /// Apply a uniform random delay in `[0, jitter_ms]` to a planned wake.
    pub fn with_jitter(&self, due: DateTime<Utc>) -> DateTime<Utc> {
        if self.jitter_ms == 0 {
            return due;
        }
        let delay = rand::thread_rng().gen_range(0..=self.jitter_ms);
        due + chrono::Duration::milliseconds(delay as i64)
    }

    /// True when handling of the wake planned for `planned` started so
    /// late (suspended machine, stopped process) that the catch-up
    /// policy applies instead of a normal run.
    pub fn is_missed(&self, planned: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - planned > chrono::Duration::seconds(MISSED_GRACE_SECS)
    }

    pub fn missed_policy(&self) -> MissedWakePolicy {
        self.on_missed
    }

    /// Delay before re-checking constraints that blocked a wake: a
    /// quarter of the schedule cadence, clamped to `[30s, 15min]`.
    pub fn constraint_retry(&self, now: DateTime<Utc>) -> std::time::Duration {
        let fallback = std::time::Duration::from_secs(RETRY_FALLBACK_SECS);
        let Some(first) = self.next_due(now) else {
            return fallback;
        };
        let Some(second) = self.next_due(first + chrono::Duration::minutes(1)) else {
            return fallback;
        };
        let cadence_secs = (second - first).num_seconds().max(0) as u64;
        std::time::Duration::from_secs((cadence_secs / 4).clamp(RETRY_MIN_SECS, RETRY_MAX_SECS))
    }

    fn clamp_to_window(&self, due: DateTime<Utc>) -> DateTime<Utc> {
        if self.in_window(due.time()) {
            return due;
        }
        let start_today = due.date_naive().and_time(self.window_start).and_utc();
        if due < start_today {
            start_today
        } else {
            start_today + chrono::Duration::days(1)
        }
    }

    /// Window membership over `[start, end)`; end before start wraps
    /// across midnight.
    fn in_window(&self, t: NaiveTime) -> bool {
        if self.window_start <= self.window_end {
            t >= self.window_start && t < self.window_end
        } else {
            t >= self.window_start || t < self.window_end
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, mi, 0).unwrap()
    }

    fn planner(expression: &str, start: &str, end: &str, jitter_ms: u64) -> WakePlanner {
        let schedule = ScheduleConfig {
            expression: expression.to_string(),
            window_start: start.to_string(),
            window_end: end.to_string(),
            jitter_ms,
            on_missed: MissedWakePolicy::Skip,
        };
        WakePlanner::from_config(&schedule).unwrap()
    }

    fn nightly() -> WakePlanner {
        planner("*/30 1-5 * * *", "01:00", "05:00", 0)
    }

    #[test]
    fn test_cron_instant_inside_window_is_kept() {
        assert_eq!(nightly().next_due(at(10, 0, 45)), Some(at(10, 1, 0)));
        assert_eq!(nightly().next_due(at(10, 2, 10)), Some(at(10, 2, 30)));
    }

    #[test]
    fn test_wake_before_window_clamps_to_window_start() {
        let p = planner("15 0 * * *", "01:00", "05:00", 0);
        assert_eq!(p.next_due(at(10, 0, 0)), Some(at(10, 1, 0)));
    }

    #[test]
    fn test_wake_past_window_end_rolls_to_next_day() {
        // Cron still matches at 05:30 but the window closed at 05:00.
        assert_eq!(nightly().next_due(at(10, 5, 10)), Some(at(11, 1, 0)));
    }

    #[test]
    fn test_window_end_is_exclusive() {
        let p = planner("0 5 * * *", "01:00", "05:00", 0);
        assert_eq!(p.next_due(at(10, 4, 0)), Some(at(11, 1, 0)));
    }

    #[test]
    fn test_overnight_window_wraps_midnight() {
        let p = planner("0 * * * *", "22:00", "03:00", 0);
        // 21:00 is before the window opens; push to 22:00.
        assert_eq!(p.next_due(at(10, 20, 30)), Some(at(10, 22, 0)));
        // 23:00 and 02:00 are inside the wrapped window.
        assert_eq!(p.next_due(at(10, 22, 30)), Some(at(10, 23, 0)));
        assert_eq!(p.next_due(at(11, 1, 30)), Some(at(11, 2, 0)));
        // 03:00 is past the wrapped end; next start is the same evening.
        assert_eq!(p.next_due(at(11, 2, 10)), Some(at(11, 22, 0)));
        assert_eq!(p.next_due(at(11, 3, 10)), Some(at(11, 22, 0)));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let p = planner("*/30 1-5 * * *", "01:00", "05:00", 5_000);
        let due = at(10, 1, 0);
        for _ in 0..200 {
            let jittered = p.with_jitter(due);
            assert!(jittered >= due);
            assert!(jittered <= due + chrono::Duration::milliseconds(5_000));
        }
        assert_eq!(nightly().with_jitter(due), due);
    }

    #[test]
    fn test_missed_detection_uses_grace() {
        let p = nightly();
        let planned = at(10, 2, 0);
        assert!(!p.is_missed(planned, planned));
        assert!(!p.is_missed(planned, planned + chrono::Duration::seconds(30)));
        assert!(p.is_missed(planned, planned + chrono::Duration::seconds(61)));
        assert!(p.is_missed(planned, at(10, 2, 35)));
    }

    #[test]
    fn test_skipped_wake_recomputes_next_occurrence() {
        // A 02:00 wake discovered at 02:35 is discarded; the next
        // occurrence is 03:00.
        assert_eq!(nightly().next_due(at(10, 2, 35)), Some(at(10, 3, 0)));
    }

    #[test]
    fn test_replan_after_run_skips_fired_instant() {
        let p = nightly();
        let fired = at(10, 2, 0);
        let shortly_after = fired + chrono::Duration::seconds(5);
        assert_eq!(p.next_due_after(fired, shortly_after), Some(at(10, 2, 30)));
        // A cycle that outlived the next slot plans from now instead.
        assert_eq!(p.next_due_after(fired, at(10, 2, 40)), Some(at(10, 3, 0)));
    }

    #[test]
    fn test_constraint_retry_is_quarter_of_cadence() {
        let p = nightly();
        assert_eq!(
            p.constraint_retry(at(10, 1, 5)),
            std::time::Duration::from_secs(450)
        );
        // A one-minute cadence clamps up to the floor.
        let busy = planner("* * * * *", "00:00", "23:59", 0);
        assert_eq!(
            busy.constraint_retry(at(10, 12, 0)),
            std::time::Duration::from_secs(RETRY_MIN_SECS)
        );
        // An impossible schedule falls back to a fixed delay.
        let never = planner("0 0 30 2 *", "00:00", "23:59", 0);
        assert_eq!(
            never.constraint_retry(at(10, 12, 0)),
            std::time::Duration::from_secs(RETRY_FALLBACK_SECS)
        );
    }

    #[test]
    fn test_from_config_rejects_bad_schedule() {
        let bad_cron = ScheduleConfig {
            expression: String::from("not cron"),
            ..ScheduleConfig::default()
        };
        assert!(WakePlanner::from_config(&bad_cron).is_err());

        let bad_window = ScheduleConfig {
            window_start: String::from("25:00"),
            ..ScheduleConfig::default()
        };
        assert!(WakePlanner::from_config(&bad_window).is_err());
    }
}
