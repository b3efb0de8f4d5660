use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::db::Database;
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{ConfidenceRating, RatingSource, MAX_RATING, MIN_RATING};
use crate::planner::RateableTopic;

/// Records a self-assessed confidence rating, or clears it with `None`.
/// A change of value starts a new cycle for the topic.
pub fn save_rating(
    db: &Database,
    user_id: &str,
    topic_id: i64,
    rating: Option<i32>,
    now: NaiveDateTime,
) -> SchedulerResult<Option<ConfidenceRating>> {
    let topic = db
        .get_topic(topic_id)?
        .ok_or_else(|| SchedulerError::not_found(format!("Topic {}", topic_id)))?;
    if !topic.is_rateable() {
        return Err(SchedulerError::validation(format!(
            "'{}' is a level {} heading; only level 3 topics can be rated",
            topic.name, topic.level
        )));
    }

    let rating = match rating {
        Some(rating) => rating,
        None => {
            if db.delete_rating(user_id, topic_id)? {
                log::info!("Cleared rating for topic {} ({})", topic_id, user_id);
            }
            return Ok(None);
        }
    };

    if !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(SchedulerError::validation(format!(
            "rating must be between {} and {}, got {}",
            MIN_RATING, MAX_RATING, rating
        )));
    }

    db.in_transaction(|db| -> SchedulerResult<()> {
        let previous = db.get_rating(user_id, topic_id)?.map(|r| r.rating);
        db.upsert_rating(user_id, topic_id, rating, now)?;
        if previous != Some(rating) {
            db.append_rating_change(user_id, topic_id, rating, RatingSource::Assessment, now)?;
        }
        Ok(())
    })?;

    Ok(db.get_rating(user_id, topic_id)?)
}

/// The user's positively rated leaf topics, optionally limited to some
/// subjects, with each subject's exam date attached.
pub fn rateable_topics(
    db: &Database,
    user_id: &str,
    subject_ids: &[i64],
) -> SchedulerResult<Vec<RateableTopic>> {
    let exam_dates: HashMap<i64, _> = db
        .list_subjects()?
        .into_iter()
        .map(|s| (s.id, s.exam_date))
        .collect();

    let mut topics = Vec::new();
    for rating in db.list_ratings(user_id)? {
        if !rating.is_schedulable() {
            continue;
        }
        let topic = match db.get_topic(rating.topic_id)? {
            Some(topic) => topic,
            None => continue,
        };
        if !subject_ids.is_empty() && !subject_ids.contains(&topic.subject_id) {
            continue;
        }
        topics.push(RateableTopic {
            exam_date: exam_dates.get(&topic.subject_id).copied().flatten(),
            rating: rating.rating,
            topic,
        });
    }
    Ok(topics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn setup_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.init().unwrap();
        db
    }

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn seed(db: &Database) -> (i64, i64, i64) {
        let subject = db
            .add_subject("Physics", NaiveDate::from_ymd_opt(2027, 6, 1))
            .unwrap();
        let unit = db.add_topic(subject, "Mechanics", 1, None, 0).unwrap();
        let leaf = db.add_topic(subject, "Momentum", 3, Some(unit), 1).unwrap();
        (subject, unit, leaf)
    }

    mod save_tests {
        use super::*;

        #[test]
        fn new_rating_appends_change() {
            let db = setup_db();
            let (_, _, leaf) = seed(&db);
            let saved = save_rating(&db, "alice", leaf, Some(2), at(9)).unwrap().unwrap();
            assert_eq!(saved.rating, 2);

            let changes = db.list_topic_rating_changes("alice", leaf).unwrap();
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].source, RatingSource::Assessment);
        }

        #[test]
        fn unchanged_rating_does_not_restart_cycle() {
            let db = setup_db();
            let (_, _, leaf) = seed(&db);
            save_rating(&db, "alice", leaf, Some(2), at(9)).unwrap();
            save_rating(&db, "alice", leaf, Some(2), at(10)).unwrap();
            save_rating(&db, "alice", leaf, Some(1), at(11)).unwrap();
            assert_eq!(db.list_topic_rating_changes("alice", leaf).unwrap().len(), 2);
        }

        #[test]
        fn none_clears_rating() {
            let db = setup_db();
            let (_, _, leaf) = seed(&db);
            save_rating(&db, "alice", leaf, Some(3), at(9)).unwrap();
            assert!(save_rating(&db, "alice", leaf, None, at(10)).unwrap().is_none());
            assert!(db.get_rating("alice", leaf).unwrap().is_none());
        }

        #[test]
        fn negative_ratings_are_accepted() {
            let db = setup_db();
            let (_, _, leaf) = seed(&db);
            let saved = save_rating(&db, "alice", leaf, Some(-2), at(9)).unwrap().unwrap();
            assert!(!saved.is_schedulable());
        }

        #[test]
        fn out_of_range_rejected() {
            let db = setup_db();
            let (_, _, leaf) = seed(&db);
            for bad in [-3, 6] {
                let err = save_rating(&db, "alice", leaf, Some(bad), at(9)).unwrap_err();
                assert!(matches!(err, SchedulerError::Validation(_)));
            }
        }

        #[test]
        fn heading_topics_cannot_be_rated() {
            let db = setup_db();
            let (_, unit, _) = seed(&db);
            let err = save_rating(&db, "alice", unit, Some(2), at(9)).unwrap_err();
            assert!(matches!(err, SchedulerError::Validation(_)));
        }

        #[test]
        fn unknown_topic_is_not_found() {
            let db = setup_db();
            let err = save_rating(&db, "alice", 99, Some(2), at(9)).unwrap_err();
            assert!(matches!(err, SchedulerError::NotFound(_)));
        }
    }

    mod rateable_tests {
        use super::*;

        #[test]
        fn only_positive_ratings_with_exam_dates() {
            let db = setup_db();
            let (subject, _, leaf) = seed(&db);
            let other = db.add_topic(subject, "Energy", 3, None, 2).unwrap();
            save_rating(&db, "alice", leaf, Some(1), at(9)).unwrap();
            save_rating(&db, "alice", other, Some(0), at(9)).unwrap();

            let topics = rateable_topics(&db, "alice", &[]).unwrap();
            assert_eq!(topics.len(), 1);
            assert_eq!(topics[0].topic.id, leaf);
            assert_eq!(topics[0].exam_date, NaiveDate::from_ymd_opt(2027, 6, 1));
        }

        #[test]
        fn subject_filter_applies() {
            let db = setup_db();
            let (subject, _, leaf) = seed(&db);
            let maths = db.add_subject("Maths", None).unwrap();
            let algebra = db.add_topic(maths, "Algebra", 3, None, 0).unwrap();
            save_rating(&db, "alice", leaf, Some(1), at(9)).unwrap();
            save_rating(&db, "alice", algebra, Some(2), at(9)).unwrap();

            let physics_only = rateable_topics(&db, "alice", &[subject]).unwrap();
            assert_eq!(physics_only.len(), 1);
            assert_eq!(rateable_topics(&db, "alice", &[maths]).unwrap()[0].topic.id, algebra);
            assert_eq!(rateable_topics(&db, "alice", &[]).unwrap().len(), 2);
        }
    }
}
