//! Re-rating at the end of a cycle
//!
//! After the final session of a cycle the user rates the topic again. Low
//! scores start a new reinforcement cycle; high scores push the topic onto a
//! widening maintenance schedule. The planner creates the actual blocks on
//! its next pass.

use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::db::Database;
use crate::error::{SchedulerError, SchedulerResult};
use crate::lifecycle::load_owned_block;
use crate::models::{
    sessions_needed, BlockStatus, NextAction, RatingChangeEvent, RatingSource, SchedulingEvent,
};

/// Days until the next maintenance review, by length of the high-rating streak.
pub const MAINTENANCE_INTERVALS: [i64; 5] = [7, 14, 30, 60, 90];

pub const MIN_RERATING: i32 = 1;
pub const MAX_RERATING: i32 = 5;

pub fn maintenance_interval_days(streak: usize) -> i64 {
    let index = streak.clamp(1, MAINTENANCE_INTERVALS.len()) - 1;
    MAINTENANCE_INTERVALS[index]
}

/// Number of trailing re-ratings of 4 or more. `changes` holds one topic's
/// history, oldest first; self-assessments are not part of the streak.
pub fn high_rerating_streak(changes: &[RatingChangeEvent]) -> usize {
    changes
        .iter()
        .rev()
        .filter(|c| c.source == RatingSource::Rerating)
        .take_while(|c| c.new_rating >= 4)
        .count()
}

pub fn next_action(rating: i32, streak: usize, today: NaiveDate) -> NextAction {
    match sessions_needed(rating) {
        0 => {
            let interval_days = maintenance_interval_days(streak);
            NextAction::Maintain {
                interval_days,
                due_on: today + Duration::days(interval_days),
            }
        }
        sessions => NextAction::Reinforce { sessions },
    }
}

pub fn submit_rerating(
    db: &Database,
    user_id: &str,
    block_id: i64,
    rating: i32,
    now: NaiveDateTime,
) -> SchedulerResult<NextAction> {
    if !(MIN_RERATING..=MAX_RERATING).contains(&rating) {
        return Err(SchedulerError::validation(format!(
            "re-rating must be between {} and {}, got {}",
            MIN_RERATING, MAX_RERATING, rating
        )));
    }

    let block = load_owned_block(db, user_id, block_id)?;
    if !block.is_final_session() {
        return Err(SchedulerError::validation(format!(
            "block {} is session {} of {}; re-rating follows the final session",
            block_id, block.session_number, block.session_total
        )));
    }
    if block.rerating_score.is_some() {
        return Err(SchedulerError::Conflict(format!(
            "block {} has already been re-rated",
            block_id
        )));
    }
    if !matches!(block.status, BlockStatus::Scheduled | BlockStatus::Done) {
        return Err(SchedulerError::validation(format!(
            "a {} block cannot be re-rated",
            block.status.label()
        )));
    }

    db.in_transaction(|db| -> SchedulerResult<()> {
        if block.status == BlockStatus::Scheduled
            && !db.update_block_status(block_id, BlockStatus::Scheduled, BlockStatus::Done, Some(now))?
        {
            return Err(SchedulerError::Conflict(format!(
                "block {} changed while being re-rated",
                block_id
            )));
        }
        db.set_rerating_score(block_id, rating)?;
        db.upsert_rating(user_id, block.topic_id, rating, now)?;
        db.append_rating_change(user_id, block.topic_id, rating, RatingSource::Rerating, now)?;
        Ok(())
    })?;

    let history = db.list_topic_rating_changes(user_id, block.topic_id)?;
    let action = next_action(rating, high_rerating_streak(&history), now.date());
    log::info!(
        "Topic {} re-rated {} by {}: {}",
        block.topic_id,
        rating,
        user_id,
        action.describe()
    );

    let decision = SchedulingEvent::ReratingDecision {
        block_id,
        topic_id: block.topic_id,
        rating,
        next_action: action.clone(),
    };
    if let Err(e) = db.append_event(user_id, &decision, now) {
        log::warn!("Could not record re-rating decision for block {}: {}", block_id, e);
    }

    Ok(action)
}
