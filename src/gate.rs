use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};

use crate::db::Database;
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::monday_of;

/// A week counts as reviewed once it has any blocked interval starting in it,
/// or an explicit "nothing blocked" confirmation.
pub fn is_week_confirmed(db: &Database, user_id: &str, week_start: NaiveDate) -> rusqlite::Result<bool> {
    let from = week_start.and_time(NaiveTime::MIN);
    let to = from + Duration::days(7);
    if db.count_intervals_starting_between(user_id, from, to)? > 0 {
        return Ok(true);
    }
    db.has_week_confirmation(user_id, week_start)
}

/// Plans for a future week open on the Saturday before it.
pub fn earliest_generation_day(week_start: NaiveDate) -> NaiveDate {
    week_start - Duration::days(2)
}

pub fn ensure_monday(week_start: NaiveDate) -> SchedulerResult<()> {
    if week_start.weekday() != Weekday::Mon {
        return Err(SchedulerError::validation(format!(
            "week start {} is a {}, expected a Monday",
            week_start,
            week_start.weekday()
        )));
    }
    Ok(())
}

/// Pure gate decision for generating a plan for `week_start` on `today`.
pub fn evaluate(
    week_start: NaiveDate,
    today: NaiveDate,
    bypass: bool,
    confirmed: bool,
) -> SchedulerResult<()> {
    ensure_monday(week_start)?;

    let current_week = monday_of(today);
    if week_start < current_week {
        return Err(SchedulerError::validation(format!(
            "week of {} has already passed",
            week_start
        )));
    }
    if week_start == current_week {
        return Ok(());
    }

    let earliest = earliest_generation_day(week_start);
    if !bypass && today < earliest {
        return Err(SchedulerError::GateViolation {
            week_start,
            earliest,
            reason: "future weeks open for planning on the weekend before".to_string(),
        });
    }

    if !confirmed {
        return Err(SchedulerError::GateViolation {
            week_start,
            earliest: today,
            reason: "review that week's availability first (block time or confirm it is clear)"
                .to_string(),
        });
    }

    Ok(())
}

pub fn check(
    db: &Database,
    user_id: &str,
    week_start: NaiveDate,
    today: NaiveDate,
    bypass: bool,
) -> SchedulerResult<()> {
    // Only future weeks need the confirmation lookup
    let confirmed = if week_start > monday_of(today) {
        is_week_confirmed(db, user_id, week_start)?
    } else {
        true
    };
    let result = evaluate(week_start, today, bypass, confirmed);
    if let Err(err) = &result {
        log::info!("Plan gate refused week {} for {}: {}", week_start, user_id, err);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UnavailableInterval;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, d).unwrap()
    }

    // Tests run in the week of Monday 2026-10-19
    fn next_week() -> NaiveDate {
        date(10, 26)
    }

    fn setup_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.init().unwrap();
        db
    }

    mod evaluate_tests {
        use super::*;

        #[test]
        fn current_week_is_always_open() {
            assert!(evaluate(date(10, 19), date(10, 21), false, false).is_ok());
        }

        #[test]
        fn next_week_on_wednesday_names_saturday() {
            let err = evaluate(next_week(), date(10, 21), false, true).unwrap_err();
            match err {
                SchedulerError::GateViolation { earliest, .. } => {
                    assert_eq!(earliest, date(10, 24));
                }
                other => panic!("expected gate violation, got {:?}", other),
            }
        }

        #[test]
        fn next_week_on_saturday_and_sunday() {
            assert!(evaluate(next_week(), date(10, 24), false, true).is_ok());
            assert!(evaluate(next_week(), date(10, 25), false, true).is_ok());
        }

        #[test]
        fn bypass_skips_weekend_rule() {
            assert!(evaluate(next_week(), date(10, 21), true, true).is_ok());
        }

        #[test]
        fn unconfirmed_future_week_is_refused() {
            let err = evaluate(next_week(), date(10, 24), false, false).unwrap_err();
            assert!(matches!(err, SchedulerError::GateViolation { .. }));
        }

        #[test]
        fn week_after_next_waits_for_its_own_weekend() {
            let err = evaluate(date(11, 2), date(10, 24), false, true).unwrap_err();
            match err {
                SchedulerError::GateViolation { earliest, .. } => {
                    assert_eq!(earliest, date(10, 31));
                }
                other => panic!("expected gate violation, got {:?}", other),
            }
        }

        #[test]
        fn past_week_and_non_monday_are_validation_errors() {
            assert!(matches!(
                evaluate(date(10, 12), date(10, 21), false, true),
                Err(SchedulerError::Validation(_))
            ));
            assert!(matches!(
                evaluate(date(10, 20), date(10, 21), false, true),
                Err(SchedulerError::Validation(_))
            ));
        }
    }

    mod confirmation_tests {
        use super::*;

        #[test]
        fn unreviewed_week_is_not_confirmed() {
            let db = setup_db();
            assert!(!is_week_confirmed(&db, "alice", next_week()).unwrap());
        }

        #[test]
        fn explicit_confirmation_counts() {
            let db = setup_db();
            db.confirm_week("alice", next_week(), date(10, 24).and_hms_opt(9, 0, 0).unwrap())
                .unwrap();
            assert!(is_week_confirmed(&db, "alice", next_week()).unwrap());
            assert!(!is_week_confirmed(&db, "bob", next_week()).unwrap());
        }

        #[test]
        fn interval_starting_in_week_counts() {
            let db = setup_db();
            let start = date(10, 28).and_hms_opt(18, 0, 0).unwrap();
            db.add_interval(&UnavailableInterval::manual(
                "alice",
                start,
                start + Duration::hours(2),
            ))
            .unwrap();
            assert!(is_week_confirmed(&db, "alice", next_week()).unwrap());
            assert!(!is_week_confirmed(&db, "alice", date(11, 2)).unwrap());
        }

        #[test]
        fn check_consults_store_for_future_weeks() {
            let db = setup_db();
            assert!(check(&db, "alice", next_week(), date(10, 24), false).is_err());
            db.confirm_week("alice", next_week(), date(10, 24).and_hms_opt(9, 0, 0).unwrap())
                .unwrap();
            assert!(check(&db, "alice", next_week(), date(10, 24), false).is_ok());
        }
    }
}
