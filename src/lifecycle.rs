use chrono::NaiveDateTime;

use crate::db::Database;
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{Block, BlockStatus, SchedulingEvent};

/// Loads a block and checks it belongs to `user_id`.
pub fn load_owned_block(db: &Database, user_id: &str, block_id: i64) -> SchedulerResult<Block> {
    let block = db
        .get_block(block_id)?
        .ok_or_else(|| SchedulerError::not_found(format!("Block {}", block_id)))?;
    if block.user_id != user_id {
        return Err(SchedulerError::Authorization { block_id });
    }
    Ok(block)
}

/// Moves a block to `target`. Asking for the state the block is already in
/// changes nothing and records nothing.
pub fn transition(
    db: &Database,
    user_id: &str,
    block_id: i64,
    target: BlockStatus,
    now: NaiveDateTime,
) -> SchedulerResult<Block> {
    let mut block = load_owned_block(db, user_id, block_id)?;
    if block.status == target {
        return Ok(block);
    }
    if !block.status.can_transition_to(target) {
        return Err(SchedulerError::validation(format!(
            "cannot mark a {} block as {}",
            block.status.label(),
            target.label()
        )));
    }

    let from = block.status;
    let completed_at = (target == BlockStatus::Done).then_some(now);

    db.in_transaction(|db| -> SchedulerResult<()> {
        if !db.update_block_status(block_id, from, target, completed_at)? {
            return Err(SchedulerError::Conflict(format!(
                "block {} changed while being updated",
                block_id
            )));
        }
        db.append_event(
            user_id,
            &SchedulingEvent::StatusChanged {
                block_id,
                from,
                to: target,
            },
            now,
        )?;
        Ok(())
    })?;

    log::info!("Block {} {} -> {}", block_id, from.as_str(), target.as_str());
    block.status = target;
    block.completed_at = completed_at;
    Ok(block)
}

/// Marks every elapsed scheduled block as missed, for one user or all of
/// them. A block that fails to update is logged and left for the next sweep.
pub fn sweep_missed(
    db: &Database,
    user_id: Option<&str>,
    now: NaiveDateTime,
) -> SchedulerResult<Vec<Block>> {
    let candidates = db.list_scheduled_started_before(user_id, now)?;
    let mut missed = Vec::new();

    for mut block in candidates.into_iter().filter(|b| b.has_elapsed(now)) {
        let result = db.in_transaction(|db| -> SchedulerResult<bool> {
            if !db.update_block_status(block.id, BlockStatus::Scheduled, BlockStatus::Missed, None)? {
                return Ok(false);
            }
            db.append_event(
                &block.user_id,
                &SchedulingEvent::BlockMissed {
                    block_id: block.id,
                    topic_id: block.topic_id,
                    scheduled_at: block.scheduled_at,
                },
                now,
            )?;
            Ok(true)
        });

        match result {
            Ok(true) => {
                block.status = BlockStatus::Missed;
                missed.push(block);
            }
            Ok(false) => {}
            Err(e) => log::error!("Failed to mark block {} missed: {}", block.id, e),
        }
    }

    if !missed.is_empty() {
        log::info!("Swept {} missed block(s)", missed.len());
    }
    Ok(missed)
}

/// Whether a done block was completed before it was ever swept to missed.
/// Only the earliest missed event is compared, however often the block was
/// missed afterwards.
pub fn first_attempt_completion(db: &Database, block: &Block) -> SchedulerResult<bool> {
    let completed_at = match (block.status, block.completed_at) {
        (BlockStatus::Done, Some(at)) => at,
        _ => return Ok(false),
    };
    let missed = db.missed_event_times(block.id)?;
    Ok(missed.first().map_or(true, |first| completed_at < *first))
}

/// Number of the user's done blocks that were completed on the first attempt.
pub fn first_attempt_count(db: &Database, user_id: &str) -> SchedulerResult<i64> {
    let mut count = 0;
    for block in db.list_blocks(user_id)? {
        if first_attempt_completion(db, &block)? {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlockKind, NewBlock};
    use chrono::{Duration, NaiveDate};

    fn setup_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.init().unwrap();
        db
    }

    fn at(day: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn seed_block(db: &Database, user: &str, start: NaiveDateTime) -> Block {
        let topic = match db.list_topics(None).unwrap().first() {
            Some(topic) => topic.id,
            None => {
                let subject = db.add_subject("Biology", None).unwrap();
                db.add_topic(subject, "Osmosis", 3, None, 0).unwrap()
            }
        };
        db.insert_block(
            user,
            &NewBlock {
                topic_id: topic,
                kind: BlockKind::Reinforcement,
                scheduled_at: start,
                duration_minutes: 60,
                session_number: 1,
                session_total: 1,
            },
            at(19, 7),
        )
        .unwrap()
    }

    fn event_kinds(db: &Database, user: &str) -> Vec<&'static str> {
        db.list_events(user, 50)
            .unwrap()
            .iter()
            .rev()
            .map(|r| r.event.kind())
            .collect()
    }

    mod transition_tests {
        use super::*;

        #[test]
        fn done_sets_completion_and_logs_event() {
            let db = setup_db();
            let block = seed_block(&db, "alice", at(19, 9));

            let updated = transition(&db, "alice", block.id, BlockStatus::Done, at(19, 10)).unwrap();
            assert_eq!(updated.status, BlockStatus::Done);
            assert_eq!(updated.completed_at, Some(at(19, 10)));

            let stored = db.get_block(block.id).unwrap().unwrap();
            assert_eq!(stored.status, BlockStatus::Done);
            assert_eq!(event_kinds(&db, "alice"), vec!["status_changed"]);
        }

        #[test]
        fn same_state_is_a_no_op() {
            let db = setup_db();
            let block = seed_block(&db, "alice", at(19, 9));
            transition(&db, "alice", block.id, BlockStatus::Scheduled, at(19, 8)).unwrap();
            assert!(event_kinds(&db, "alice").is_empty());
        }

        #[test]
        fn terminal_to_terminal_is_rejected() {
            let db = setup_db();
            let block = seed_block(&db, "alice", at(19, 9));
            transition(&db, "alice", block.id, BlockStatus::Skipped, at(19, 8)).unwrap();
            let err = transition(&db, "alice", block.id, BlockStatus::Done, at(19, 10)).unwrap_err();
            assert!(matches!(err, SchedulerError::Validation(_)));
        }

        #[test]
        fn revert_clears_completion() {
            let db = setup_db();
            let block = seed_block(&db, "alice", at(19, 9));
            transition(&db, "alice", block.id, BlockStatus::Done, at(19, 10)).unwrap();
            let reverted =
                transition(&db, "alice", block.id, BlockStatus::Scheduled, at(19, 11)).unwrap();
            assert_eq!(reverted.completed_at, None);
            assert_eq!(db.get_block(block.id).unwrap().unwrap().completed_at, None);
        }

        #[test]
        fn other_users_block_is_unauthorized() {
            let db = setup_db();
            let block = seed_block(&db, "alice", at(19, 9));
            let err = transition(&db, "bob", block.id, BlockStatus::Done, at(19, 10)).unwrap_err();
            assert!(matches!(err, SchedulerError::Authorization { .. }));
        }

        #[test]
        fn unknown_block_is_not_found() {
            let db = setup_db();
            let err = transition(&db, "alice", 42, BlockStatus::Done, at(19, 10)).unwrap_err();
            assert!(matches!(err, SchedulerError::NotFound(_)));
        }
    }

    mod sweep_tests {
        use super::*;

        #[test]
        fn only_elapsed_blocks_are_missed() {
            let db = setup_db();
            let past = seed_block(&db, "alice", at(19, 9));
            let running = seed_block(&db, "alice", at(19, 11));

            let missed = sweep_missed(&db, None, at(19, 11) + Duration::minutes(30)).unwrap();
            assert_eq!(missed.len(), 1);
            assert_eq!(missed[0].id, past.id);
            assert_eq!(missed[0].status, BlockStatus::Missed);
            assert_eq!(
                db.get_block(running.id).unwrap().unwrap().status,
                BlockStatus::Scheduled
            );
        }

        #[test]
        fn sweep_is_idempotent() {
            let db = setup_db();
            seed_block(&db, "alice", at(19, 9));
            assert_eq!(sweep_missed(&db, Some("alice"), at(19, 12)).unwrap().len(), 1);
            assert!(sweep_missed(&db, Some("alice"), at(19, 13)).unwrap().is_empty());
            assert_eq!(event_kinds(&db, "alice"), vec!["block_missed"]);
        }

        #[test]
        fn sweep_can_be_scoped_to_one_user() {
            let db = setup_db();
            seed_block(&db, "alice", at(19, 9));
            let bobs = seed_block(&db, "bob", at(19, 9));
            let missed = sweep_missed(&db, Some("alice"), at(19, 12)).unwrap();
            assert_eq!(missed.len(), 1);
            assert_eq!(
                db.get_block(bobs.id).unwrap().unwrap().status,
                BlockStatus::Scheduled
            );
        }

        #[test]
        fn missed_reverted_and_missed_again_logs_twice() {
            let db = setup_db();
            let block = seed_block(&db, "alice", at(19, 9));
            sweep_missed(&db, None, at(19, 12)).unwrap();
            transition(&db, "alice", block.id, BlockStatus::Scheduled, at(19, 13)).unwrap();
            sweep_missed(&db, None, at(19, 14)).unwrap();

            assert_eq!(db.missed_event_times(block.id).unwrap().len(), 2);
        }
    }

    mod first_attempt_tests {
        use super::*;

        #[test]
        fn done_without_misses_is_first_attempt() {
            let db = setup_db();
            let block = seed_block(&db, "alice", at(19, 9));
            let done = transition(&db, "alice", block.id, BlockStatus::Done, at(19, 10)).unwrap();
            assert!(first_attempt_completion(&db, &done).unwrap());
        }

        #[test]
        fn done_after_a_miss_is_not_first_attempt() {
            let db = setup_db();
            let block = seed_block(&db, "alice", at(19, 9));
            sweep_missed(&db, None, at(19, 12)).unwrap();
            transition(&db, "alice", block.id, BlockStatus::Scheduled, at(19, 13)).unwrap();
            let done = transition(&db, "alice", block.id, BlockStatus::Done, at(19, 14)).unwrap();
            assert!(!first_attempt_completion(&db, &done).unwrap());
        }

        #[test]
        fn count_skips_blocks_done_after_a_miss() {
            let db = setup_db();
            let clean = seed_block(&db, "alice", at(19, 9));
            let late = seed_block(&db, "alice", at(19, 11));
            seed_block(&db, "alice", at(20, 9));
            transition(&db, "alice", clean.id, BlockStatus::Done, at(19, 10)).unwrap();
            sweep_missed(&db, Some("alice"), at(19, 13)).unwrap();
            transition(&db, "alice", late.id, BlockStatus::Scheduled, at(19, 14)).unwrap();
            transition(&db, "alice", late.id, BlockStatus::Done, at(19, 15)).unwrap();

            assert_eq!(first_attempt_count(&db, "alice").unwrap(), 1);
            assert_eq!(first_attempt_count(&db, "bob").unwrap(), 0);
        }

        #[test]
        fn scheduled_block_is_not_completed() {
            let db = setup_db();
            let block = seed_block(&db, "alice", at(19, 9));
            assert!(!first_attempt_completion(&db, &block).unwrap());
        }
    }
}
