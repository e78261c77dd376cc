//! Pure cron-tick arithmetic for the scheduler.
//!
//! Expressions use the seven-field form of the `cron` crate
//! (`sec min hour day-of-month month day-of-week [year]`). Tick computation
//! is a pure function of the expression and a reference instant; the
//! scheduler stores only materialize what these functions return.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use crate::error::CoordinationError;

/// Iteration guard for pathological catch-up ranges (for example a
/// per-second expression that fell behind by days).
const MAX_TICK_SCAN: usize = 100_000;

/// Parses a cron expression, mapping parse errors to a typed failure.
pub fn parse(expression: &str) -> Result<Schedule, CoordinationError> {
    Schedule::from_str(expression).map_err(|e| CoordinationError::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// First tick strictly after `after`.
pub fn next_after(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Latest tick `t` with `from <= t <= until`, scanning forward from `from`.
pub fn latest_tick_in(
    schedule: &Schedule,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if from > until {
        return None;
    }
    // `Schedule::after` is exclusive, so back up one second to include a
    // tick landing exactly on `from`.
    let start = from - Duration::seconds(1);
    let mut latest = None;
    for tick in schedule.after(&start).take(MAX_TICK_SCAN) {
        if tick > until {
            break;
        }
        latest = Some(tick);
    }
    latest
}

/// A planning step for one due job definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanStep {
    /// Scheduled time of the run to materialize, if any.
    pub run_at: Option<DateTime<Utc>>,
    /// New `next_due` for the definition (always strictly after `now`).
    pub next_due: Option<DateTime<Utc>>,
}

/// Catch-up policy for definitions whose ticks fell behind `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatchUpPolicy {
    /// Materialize one run at the most recent tick not after `now`, then
    /// resume forward. Never creates a backlog.
    #[default]
    FireOnce,
    /// Materialize nothing for missed ticks; just advance `next_due`.
    SkipMissed,
}

/// Plans the next run for a definition due at `next_due` (≤ `now`).
pub fn plan(
    schedule: &Schedule,
    next_due: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: CatchUpPolicy,
) -> PlanStep {
    let run_at = match policy {
        CatchUpPolicy::FireOnce => latest_tick_in(schedule, next_due, now),
        CatchUpPolicy::SkipMissed => None,
    };
    PlanStep {
        run_at,
        next_due: next_after(schedule, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, h, m, s).unwrap()
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(parse("not a cron").is_err());
        assert!(parse("0 */5 * * * *").is_ok());
    }

    #[test]
    fn next_after_is_exclusive() {
        let every_five = parse("0 */5 * * * *").unwrap();
        let next = next_after(&every_five, at(10, 0, 0)).unwrap();
        assert_eq!(next, at(10, 5, 0));
    }

    #[test]
    fn latest_tick_floors_to_boundary() {
        let every_five = parse("0 */5 * * * *").unwrap();
        // An hour behind: the latest tick not after 10:02:30 is 10:00.
        let tick = latest_tick_in(&every_five, at(9, 0, 0), at(10, 2, 30)).unwrap();
        assert_eq!(tick, at(10, 0, 0));
    }

    #[test]
    fn latest_tick_includes_range_start() {
        let every_five = parse("0 */5 * * * *").unwrap();
        let tick = latest_tick_in(&every_five, at(10, 0, 0), at(10, 0, 0)).unwrap();
        assert_eq!(tick, at(10, 0, 0));
    }

    #[test]
    fn fire_once_materializes_single_catchup_run() {
        let every_five = parse("0 */5 * * * *").unwrap();
        // Fell behind by an hour.
        let step = plan(&every_five, at(9, 0, 0), at(10, 2, 30), CatchUpPolicy::FireOnce);
        assert_eq!(step.run_at, Some(at(10, 0, 0)));
        assert_eq!(step.next_due, Some(at(10, 5, 0)));
    }

    #[test]
    fn skip_missed_only_advances() {
        let every_five = parse("0 */5 * * * *").unwrap();
        let step = plan(&every_five, at(9, 0, 0), at(10, 2, 30), CatchUpPolicy::SkipMissed);
        assert_eq!(step.run_at, None);
        assert_eq!(step.next_due, Some(at(10, 5, 0)));
    }

    #[test]
    fn on_time_tick_runs_at_its_boundary() {
        let every_five = parse("0 */5 * * * *").unwrap();
        let step = plan(&every_five, at(10, 5, 0), at(10, 5, 0), CatchUpPolicy::FireOnce);
        assert_eq!(step.run_at, Some(at(10, 5, 0)));
        assert_eq!(step.next_due, Some(at(10, 10, 0)));
    }
}
