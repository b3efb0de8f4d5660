//! The `Scheduler` is the single entry point used by the CLI. It owns the
//! store, the clock and the configuration, and holds no other state between
//! calls.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::availability::{self, Availability, ResolveRequest};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::{Database, Stats};
use crate::error::{SchedulerError, SchedulerResult};
use crate::gate;
use crate::ledger;
use crate::lifecycle;
use crate::models::{
    AvailabilityProfile, Block, BlockStatus, ConfidenceRating, EventRecord, IntervalSource,
    NewBlock, NextAction, PlanOutcome, RecurringEvent, SchedulingEvent, Subject, Topic,
    UnavailableInterval, UnmetDemand, UnmetReason, SCHEDULABLE_LEVEL,
};
use crate::planner::{self, PlanningInput};
use crate::rerating;

pub struct Scheduler {
    db: Database,
    clock: Box<dyn Clock>,
    config: Config,
}

fn week_bounds(week_start: NaiveDate, days: u32) -> (NaiveDateTime, NaiveDateTime) {
    let from = week_start.and_time(NaiveTime::MIN);
    (from, from + Duration::days(days as i64))
}

impl Scheduler {
    pub fn new(db: Database, clock: Box<dyn Clock>, config: Config) -> Self {
        Self { db, clock, config }
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    // Syllabus
    pub fn add_subject(&self, name: &str, exam_date: Option<NaiveDate>) -> SchedulerResult<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SchedulerError::validation("subject name must not be empty"));
        }
        Ok(self.db.add_subject(name, exam_date)?)
    }

    pub fn list_subjects(&self) -> SchedulerResult<Vec<Subject>> {
        Ok(self.db.list_subjects()?)
    }

    pub fn add_topic(
        &self,
        subject_id: i64,
        name: &str,
        level: i32,
        parent_id: Option<i64>,
        order_index: i32,
    ) -> SchedulerResult<i64> {
        if !(1..=SCHEDULABLE_LEVEL).contains(&level) {
            return Err(SchedulerError::validation(format!(
                "topic level must be between 1 and {}",
                SCHEDULABLE_LEVEL
            )));
        }
        if self.db.get_subject(subject_id)?.is_none() {
            return Err(SchedulerError::not_found(format!("Subject {}", subject_id)));
        }
        if let Some(parent) = parent_id {
            let parent_topic = self
                .db
                .get_topic(parent)?
                .ok_or_else(|| SchedulerError::not_found(format!("Topic {}", parent)))?;
            if parent_topic.level >= level {
                return Err(SchedulerError::validation(
                    "a topic must sit below its parent in the syllabus",
                ));
            }
        }
        Ok(self
            .db
            .add_topic(subject_id, name.trim(), level, parent_id, order_index)?)
    }

    pub fn list_topics(&self, subject_id: Option<i64>) -> SchedulerResult<Vec<Topic>> {
        Ok(self.db.list_topics(subject_id)?)
    }

    // Confidence
    pub fn save_rating(
        &self,
        user_id: &str,
        topic_id: i64,
        rating: Option<i32>,
    ) -> SchedulerResult<Option<ConfidenceRating>> {
        ledger::save_rating(&self.db, user_id, topic_id, rating, self.clock.now())
    }

    pub fn list_ratings(&self, user_id: &str) -> SchedulerResult<Vec<ConfidenceRating>> {
        Ok(self.db.list_ratings(user_id)?)
    }

    // Availability
    /// Stores the study-hour profile and replaces all manually blocked
    /// intervals with `intervals`.
    pub fn save_availability(
        &self,
        user_id: &str,
        profile: &AvailabilityProfile,
        intervals: &[UnavailableInterval],
    ) -> SchedulerResult<()> {
        profile.validate().map_err(SchedulerError::Validation)?;
        for interval in intervals {
            validate_interval(interval.start, interval.end)?;
        }

        let profile = AvailabilityProfile {
            user_id: user_id.to_string(),
            ..profile.clone()
        };

        self.db.in_transaction(|db| -> SchedulerResult<()> {
            db.upsert_profile(&profile)?;
            db.delete_manual_intervals(user_id)?;
            for interval in intervals {
                db.add_interval(&UnavailableInterval {
                    id: None,
                    user_id: user_id.to_string(),
                    source: IntervalSource::Manual,
                    ..interval.clone()
                })?;
            }
            Ok(())
        })?;

        log::info!(
            "Saved availability for {} with {} blocked interval(s)",
            user_id,
            intervals.len()
        );
        Ok(())
    }

    pub fn get_profile(&self, user_id: &str) -> SchedulerResult<Option<AvailabilityProfile>> {
        Ok(self.db.get_profile(user_id)?)
    }

    /// Adds one blocked interval without touching the others.
    pub fn block_time(
        &self,
        user_id: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
        reason: Option<String>,
    ) -> SchedulerResult<i64> {
        validate_interval(start, end)?;
        let mut interval = UnavailableInterval::manual(user_id, start, end);
        interval.reason = reason;
        Ok(self.db.add_interval(&interval)?)
    }

    pub fn add_recurring_event(
        &self,
        user_id: &str,
        event: &RecurringEvent,
    ) -> SchedulerResult<i64> {
        if event.label.trim().is_empty() {
            return Err(SchedulerError::validation("recurring event needs a label"));
        }
        if event.days_of_week.is_empty() {
            return Err(SchedulerError::validation(
                "recurring event needs at least one weekday",
            ));
        }
        if let (Some(from), Some(until)) = (event.start_date, event.end_date) {
            if until < from {
                return Err(SchedulerError::validation(
                    "recurring event ends before it starts",
                ));
            }
        }
        let event = RecurringEvent {
            user_id: user_id.to_string(),
            ..event.clone()
        };
        Ok(self.db.add_recurring_event(&event)?)
    }

    pub fn list_recurring_events(&self, user_id: &str) -> SchedulerResult<Vec<RecurringEvent>> {
        Ok(self.db.list_recurring_events(user_id)?)
    }

    pub fn remove_recurring_event(&self, user_id: &str, id: i64) -> SchedulerResult<()> {
        if !self.db.delete_recurring_event(user_id, id)? {
            return Err(SchedulerError::not_found(format!("Recurring event {}", id)));
        }
        Ok(())
    }

    pub fn confirm_week(&self, user_id: &str, week_start: NaiveDate) -> SchedulerResult<()> {
        gate::ensure_monday(week_start)?;
        let now = self.clock.now();
        self.db.in_transaction(|db| -> SchedulerResult<()> {
            db.confirm_week(user_id, week_start, now)?;
            db.append_event(user_id, &SchedulingEvent::WeekConfirmed { week_start }, now)?;
            Ok(())
        })
    }

    pub fn is_week_confirmed(&self, user_id: &str, week_start: NaiveDate) -> SchedulerResult<bool> {
        gate::ensure_monday(week_start)?;
        Ok(gate::is_week_confirmed(&self.db, user_id, week_start)?)
    }

    /// Open slots of a week as they stand now, for display.
    pub fn week_availability(
        &self,
        user_id: &str,
        week_start: NaiveDate,
    ) -> SchedulerResult<Availability> {
        gate::ensure_monday(week_start)?;
        let profile = self.db.get_profile(user_id)?;
        self.resolve_availability(user_id, profile.as_ref(), week_start, 7)
    }

    fn resolve_availability(
        &self,
        user_id: &str,
        profile: Option<&AvailabilityProfile>,
        start: NaiveDate,
        days: u32,
    ) -> SchedulerResult<Availability> {
        let (from, to) = week_bounds(start, days);
        let intervals = self.db.list_intervals_overlapping(user_id, from, to)?;
        let recurring = self.db.list_recurring_events(user_id)?;
        let occupied = self.db.list_blocks_between(user_id, from, to)?;
        availability::resolve(&ResolveRequest {
            profile,
            intervals: &intervals,
            recurring: &recurring,
            occupied: &occupied,
            start,
            days,
            granularity_minutes: self.config.granularity_minutes,
            slot_minutes: self.config.block_minutes,
        })
    }

    // Planning
    /// Runs one planner pass for the week starting `week_start`. `subjects`
    /// limits the pass to those subjects; empty means all. Returns the blocks
    /// created by this pass and the demand it could not meet.
    pub fn generate_plan(
        &self,
        user_id: &str,
        week_start: NaiveDate,
        subjects: &[i64],
        availability_override: Option<AvailabilityProfile>,
    ) -> SchedulerResult<PlanOutcome> {
        let now = self.clock.now();
        gate::check(
            &self.db,
            user_id,
            week_start,
            now.date(),
            self.config.gate_bypass,
        )?;

        let profile = match availability_override {
            Some(profile) => Some(profile),
            None => self.db.get_profile(user_id)?,
        };
        if let Some(profile) = &profile {
            profile.validate().map_err(SchedulerError::Validation)?;
        }

        let blocks = self.db.list_blocks(user_id)?;
        let first_week = planner::is_first_week(&blocks, week_start);
        let availability = self.resolve_availability(
            user_id,
            profile.as_ref(),
            week_start,
            planner::horizon_days(first_week),
        )?;

        let topics = ledger::rateable_topics(&self.db, user_id, subjects)?;
        let changes = self.db.list_rating_changes(user_id)?;
        log::debug!(
            "Planning {} topic(s) for week of {} in {} order{}",
            topics.len(),
            week_start,
            self.config.priority.as_str(),
            if first_week { " (first week)" } else { "" }
        );

        let allocation = planner::plan(&PlanningInput {
            topics: &topics,
            blocks: &blocks,
            rating_changes: &changes,
            availability: &availability,
            week_start,
            now,
            block_minutes: self.config.block_minutes,
            first_week,
            priority: self.config.priority,
        });

        for (block_id, session_number) in &allocation.renumbered {
            if let Err(e) = self.db.renumber_block(*block_id, *session_number) {
                log::error!("Failed to renumber block {}: {}", block_id, e);
            }
        }

        let mut created = Vec::with_capacity(allocation.new_blocks.len());
        let mut unmet = allocation.unmet;
        for new_block in &allocation.new_blocks {
            match self.persist_block(user_id, new_block, now) {
                Ok(block) => created.push(block),
                Err(e) => {
                    log::error!(
                        "Failed to store session {} for topic {}: {}",
                        new_block.session_number,
                        new_block.topic_id,
                        e
                    );
                    unmet.push(UnmetDemand {
                        topic_id: new_block.topic_id,
                        sessions: 1,
                        reason: UnmetReason::WriteFailed,
                    });
                    let failure = SchedulingEvent::AllocationFailed {
                        topic_id: new_block.topic_id,
                        reason: e.to_string(),
                    };
                    if let Err(e) = self.db.append_event(user_id, &failure, now) {
                        log::warn!("Could not record allocation failure: {}", e);
                    }
                }
            }
        }

        let summary = SchedulingEvent::PlanGenerated {
            week_start,
            created: created.len(),
            unmet: unmet.len(),
        };
        if let Err(e) = self.db.append_event(user_id, &summary, now) {
            log::warn!("Could not record plan summary: {}", e);
        }
        log::info!(
            "Planned week of {} for {}: {} new block(s), {} unmet",
            week_start,
            user_id,
            created.len(),
            unmet.len()
        );

        Ok(PlanOutcome {
            week_start,
            blocks: created,
            unmet,
        })
    }

    fn persist_block(
        &self,
        user_id: &str,
        new_block: &NewBlock,
        now: NaiveDateTime,
    ) -> SchedulerResult<Block> {
        self.db.in_transaction(|db| -> SchedulerResult<Block> {
            let block = db.insert_block(user_id, new_block, now)?;
            db.append_event(
                user_id,
                &SchedulingEvent::BlockCreated {
                    block_id: block.id,
                    topic_id: block.topic_id,
                    scheduled_at: block.scheduled_at,
                    session_number: block.session_number,
                    session_total: block.session_total,
                },
                now,
            )?;
            Ok(block)
        })
    }

    pub fn week_view(&self, user_id: &str, week_start: NaiveDate) -> SchedulerResult<Vec<Block>> {
        gate::ensure_monday(week_start)?;
        let (from, to) = week_bounds(week_start, 7);
        Ok(self.db.list_blocks_between(user_id, from, to)?)
    }

    // Block lifecycle
    pub fn mark_done(&self, user_id: &str, block_id: i64) -> SchedulerResult<Block> {
        lifecycle::transition(&self.db, user_id, block_id, BlockStatus::Done, self.clock.now())
    }

    pub fn mark_skipped(&self, user_id: &str, block_id: i64) -> SchedulerResult<Block> {
        lifecycle::transition(&self.db, user_id, block_id, BlockStatus::Skipped, self.clock.now())
    }

    pub fn mark_scheduled(&self, user_id: &str, block_id: i64) -> SchedulerResult<Block> {
        lifecycle::transition(
            &self.db,
            user_id,
            block_id,
            BlockStatus::Scheduled,
            self.clock.now(),
        )
    }

    pub fn sweep_missed(&self, user_id: Option<&str>) -> SchedulerResult<Vec<Block>> {
        lifecycle::sweep_missed(&self.db, user_id, self.clock.now())
    }

    pub fn first_attempt_completion(&self, user_id: &str, block_id: i64) -> SchedulerResult<bool> {
        let block = lifecycle::load_owned_block(&self.db, user_id, block_id)?;
        lifecycle::first_attempt_completion(&self.db, &block)
    }

    pub fn submit_rerating(
        &self,
        user_id: &str,
        block_id: i64,
        rating: i32,
    ) -> SchedulerResult<NextAction> {
        rerating::submit_rerating(&self.db, user_id, block_id, rating, self.clock.now())
    }

    // History
    pub fn events(&self, user_id: &str, limit: usize) -> SchedulerResult<Vec<EventRecord>> {
        Ok(self.db.list_events(user_id, limit)?)
    }

    pub fn stats(&self, user_id: &str) -> SchedulerResult<Stats> {
        let mut stats = self.db.get_stats(user_id)?;
        stats.first_attempt_done = lifecycle::first_attempt_count(&self.db, user_id)?;
        Ok(stats)
    }
}

fn validate_interval(start: NaiveDateTime, end: NaiveDateTime) -> SchedulerResult<()> {
    if end <= start {
        return Err(SchedulerError::validation(format!(
            "blocked interval must end after it starts ({} - {})",
            start, end
        )));
    }
    Ok(())
}
