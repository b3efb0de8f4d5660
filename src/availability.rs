//! Availability resolution
//!
//! Turns a user's study-hour preferences, explicit blocked intervals and
//! recurring commitments into the concrete open slots of a date range. A slot
//! is a candidate start time for one block; slots on the same day may overlap
//! each other, so the planner tracks what it has already taken.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{AvailabilityProfile, Block, RecurringEvent, UnavailableInterval};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Slot {
    pub fn date(&self) -> NaiveDate {
        self.start.date()
    }

    pub fn overlaps(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        self.start < end && start < self.end
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Availability {
    pub days: Vec<DayAvailability>,
}

impl Availability {
    /// All slots in chronological order.
    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.days.iter().flat_map(|d| d.slots.iter())
    }

    pub fn day(&self, date: NaiveDate) -> Option<&DayAvailability> {
        self.days.iter().find(|d| d.date == date)
    }

    pub fn slot_count(&self) -> usize {
        self.days.iter().map(|d| d.slots.len()).sum()
    }

    /// Whether any slot remains today at or after `now`. Same-day scheduling
    /// is only offered while this holds.
    pub fn has_same_day_capacity(&self, now: NaiveDateTime) -> bool {
        self.day(now.date())
            .is_some_and(|day| day.slots.iter().any(|slot| slot.start >= now))
    }
}

pub struct ResolveRequest<'a> {
    pub profile: Option<&'a AvailabilityProfile>,
    pub intervals: &'a [UnavailableInterval],
    pub recurring: &'a [RecurringEvent],
    pub occupied: &'a [Block],
    pub start: NaiveDate,
    pub days: u32,
    pub granularity_minutes: i64,
    pub slot_minutes: i64,
}

/// Expands recurring commitments into concrete intervals for `[start, start+days)`.
/// The day before `start` is included so that overnight events spill over.
pub fn expand_recurring(
    events: &[RecurringEvent],
    start: NaiveDate,
    days: u32,
) -> Vec<UnavailableInterval> {
    let mut intervals = Vec::new();
    for offset in -1..days as i64 {
        let date = start + Duration::days(offset);
        for event in events {
            if let Some(interval) = event.interval_on(date) {
                intervals.push(interval);
            }
        }
    }
    intervals
}

pub fn resolve(request: &ResolveRequest) -> SchedulerResult<Availability> {
    let profile = request.profile.ok_or(SchedulerError::IncompleteProfile)?;
    if request.granularity_minutes <= 0 || request.slot_minutes <= 0 {
        return Err(SchedulerError::validation(
            "slot length and granularity must be positive",
        ));
    }

    let mut blocked: Vec<UnavailableInterval> = request.intervals.to_vec();
    blocked.extend(expand_recurring(request.recurring, request.start, request.days));

    let occupied: Vec<&Block> = request
        .occupied
        .iter()
        .filter(|b| b.counts_toward_cycle())
        .collect();

    let step = Duration::minutes(request.granularity_minutes);
    let length = Duration::minutes(request.slot_minutes);

    let mut days = Vec::with_capacity(request.days as usize);
    for offset in 0..request.days as i64 {
        let date = request.start + Duration::days(offset);
        let (earliest, latest) = profile.window_for(date);
        let close = date.and_time(latest);

        let mut slots = Vec::new();
        let mut cursor = date.and_time(earliest);
        while cursor + length <= close {
            let end = cursor + length;
            let free = !blocked.iter().any(|i| i.overlaps(cursor, end))
                && !occupied.iter().any(|b| b.overlaps(cursor, end));
            if free {
                slots.push(Slot { start: cursor, end });
            }
            cursor += step;
        }

        days.push(DayAvailability { date, slots });
    }

    Ok(Availability { days })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlockKind, BlockStatus, IntervalSource};
    use chrono::{NaiveTime, Weekday};

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(offset_days: i64, h: u32, m: u32) -> NaiveDateTime {
        (monday() + Duration::days(offset_days)).and_time(time(h, m))
    }

    fn profile() -> AvailabilityProfile {
        AvailabilityProfile {
            user_id: "alice".to_string(),
            weekday_earliest: time(9, 0),
            weekday_latest: time(17, 0),
            weekend_earliest: time(10, 0),
            weekend_latest: time(12, 0),
            use_same_weekend: false,
        }
    }

    fn request<'a>(
        profile: &'a AvailabilityProfile,
        intervals: &'a [UnavailableInterval],
        recurring: &'a [RecurringEvent],
        occupied: &'a [Block],
    ) -> ResolveRequest<'a> {
        ResolveRequest {
            profile: Some(profile),
            intervals,
            recurring,
            occupied,
            start: monday(),
            days: 7,
            granularity_minutes: 30,
            slot_minutes: 60,
        }
    }

    fn block(start: NaiveDateTime, status: BlockStatus) -> Block {
        Block {
            id: 1,
            user_id: "alice".to_string(),
            topic_id: 1,
            kind: BlockKind::Reinforcement,
            scheduled_at: start,
            duration_minutes: 60,
            status,
            completed_at: None,
            session_number: 1,
            session_total: 1,
            rerating_score: None,
            created_at: start,
        }
    }

    #[test]
    fn missing_profile_is_incomplete() {
        let req = ResolveRequest {
            profile: None,
            intervals: &[],
            recurring: &[],
            occupied: &[],
            start: monday(),
            days: 7,
            granularity_minutes: 30,
            slot_minutes: 60,
        };
        assert!(matches!(
            resolve(&req),
            Err(SchedulerError::IncompleteProfile)
        ));
    }

    #[test]
    fn weekday_slots_fill_the_window() {
        let p = profile();
        let availability = resolve(&request(&p, &[], &[], &[])).unwrap();
        let monday_slots = &availability.day(monday()).unwrap().slots;

        // 09:00 through 16:00 in 30 minute steps
        assert_eq!(monday_slots.len(), 15);
        assert_eq!(monday_slots[0].start, at(0, 9, 0));
        assert_eq!(monday_slots.last().unwrap().end, at(0, 17, 0));
    }

    #[test]
    fn weekend_uses_weekend_window() {
        let p = profile();
        let availability = resolve(&request(&p, &[], &[], &[])).unwrap();
        let saturday = &availability.day(monday() + Duration::days(5)).unwrap().slots;
        let starts: Vec<_> = saturday.iter().map(|s| s.start.time()).collect();
        assert_eq!(starts, vec![time(10, 0), time(10, 30), time(11, 0)]);
    }

    #[test]
    fn blocked_interval_removes_overlapping_slots() {
        let p = profile();
        let lunch = [UnavailableInterval::manual("alice", at(0, 12, 0), at(0, 13, 0))];
        let availability = resolve(&request(&p, &lunch, &[], &[])).unwrap();
        let monday_slots = &availability.day(monday()).unwrap().slots;

        assert_eq!(monday_slots.len(), 12);
        assert!(monday_slots
            .iter()
            .all(|s| !s.overlaps(at(0, 12, 0), at(0, 13, 0))));
        // Touching the interval edge is fine
        assert!(monday_slots.iter().any(|s| s.start == at(0, 11, 0)));
        assert!(monday_slots.iter().any(|s| s.start == at(0, 13, 0)));
    }

    #[test]
    fn recurring_events_are_subtracted() {
        let p = profile();
        let gym = [RecurringEvent {
            id: 1,
            user_id: "alice".to_string(),
            label: "Gym".to_string(),
            start_time: time(9, 0),
            end_time: time(11, 0),
            days_of_week: vec![Weekday::Tue],
            start_date: None,
            end_date: None,
        }];
        let availability = resolve(&request(&p, &[], &gym, &[])).unwrap();
        let tuesday = &availability.day(monday() + Duration::days(1)).unwrap().slots;
        assert_eq!(tuesday[0].start, at(1, 11, 0));
        let monday_slots = &availability.day(monday()).unwrap().slots;
        assert_eq!(monday_slots[0].start, at(0, 9, 0));
    }

    #[test]
    fn overnight_event_from_previous_day_blocks_morning() {
        let mut p = profile();
        p.weekday_earliest = time(0, 0);
        let shift = [RecurringEvent {
            id: 1,
            user_id: "alice".to_string(),
            label: "Night shift".to_string(),
            start_time: time(22, 0),
            end_time: time(6, 0),
            days_of_week: vec![Weekday::Sun],
            start_date: None,
            end_date: None,
        }];
        let availability = resolve(&request(&p, &[], &shift, &[])).unwrap();
        let monday_slots = &availability.day(monday()).unwrap().slots;
        assert_eq!(monday_slots[0].start, at(0, 6, 0));
    }

    #[test]
    fn occupied_blocks_are_subtracted_but_missed_ones_are_not() {
        let p = profile();
        let blocks = [
            block(at(0, 9, 0), BlockStatus::Scheduled),
            block(at(1, 9, 0), BlockStatus::Missed),
        ];
        let availability = resolve(&request(&p, &[], &[], &blocks)).unwrap();
        assert_eq!(
            availability.day(monday()).unwrap().slots[0].start,
            at(0, 10, 0)
        );
        assert_eq!(
            availability.day(monday() + Duration::days(1)).unwrap().slots[0].start,
            at(1, 9, 0)
        );
    }

    #[test]
    fn expand_recurring_marks_source() {
        let events = [RecurringEvent {
            id: 1,
            user_id: "alice".to_string(),
            label: "Choir".to_string(),
            start_time: time(19, 0),
            end_time: time(21, 0),
            days_of_week: vec![Weekday::Mon, Weekday::Thu],
            start_date: None,
            end_date: None,
        }];
        let intervals = expand_recurring(&events, monday(), 7);
        assert_eq!(intervals.len(), 2);
        assert!(intervals.iter().all(|i| i.source == IntervalSource::Recurring));
    }

    #[test]
    fn same_day_capacity_depends_on_now() {
        let p = profile();
        let availability = resolve(&request(&p, &[], &[], &[])).unwrap();
        assert!(availability.has_same_day_capacity(at(0, 15, 30)));
        assert!(availability.has_same_day_capacity(at(0, 16, 0)));
        assert!(!availability.has_same_day_capacity(at(0, 16, 1)));
        // Outside the resolved range
        assert!(!availability.has_same_day_capacity(at(9, 9, 0)));
    }
}
