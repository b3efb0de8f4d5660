use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use std::path::Path;

use crate::models::{
    AvailabilityProfile, Block, BlockKind, BlockStatus, ConfidenceRating, EventRecord,
    IntervalSource, NewBlock, RatingChangeEvent, RatingSource, RecurringEvent, SchedulingEvent,
    Subject, Topic, UnavailableInterval,
};

// Fraction is written only when non-zero and is optional when reading
const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S%.f";
const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M";

const BLOCK_COLUMNS: &str = "id, user_id, topic_id, kind, scheduled_at, duration_minutes, status, \
     completed_at, session_number, session_total, rerating_score, created_at";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS subjects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                exam_date TEXT
            );

            CREATE TABLE IF NOT EXISTS topics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                level INTEGER NOT NULL CHECK(level BETWEEN 1 AND 3),
                parent_id INTEGER,
                order_index INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (subject_id) REFERENCES subjects(id) ON DELETE CASCADE,
                FOREIGN KEY (parent_id) REFERENCES topics(id) ON DELETE SET NULL
            );

            -- One active rating per (user, topic)
            CREATE TABLE IF NOT EXISTS confidence_ratings (
                user_id TEXT NOT NULL,
                topic_id INTEGER NOT NULL,
                rating INTEGER NOT NULL CHECK(rating BETWEEN -2 AND 5),
                last_updated TEXT NOT NULL,
                PRIMARY KEY (user_id, topic_id),
                FOREIGN KEY (topic_id) REFERENCES topics(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS rating_change_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                topic_id INTEGER NOT NULL,
                new_rating INTEGER NOT NULL,
                source TEXT NOT NULL CHECK(source IN ('assessment', 'rerating')),
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS blocks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                topic_id INTEGER NOT NULL,
                kind TEXT NOT NULL DEFAULT 'reinforcement',
                scheduled_at TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'scheduled' CHECK(status IN ('scheduled', 'done', 'missed', 'skipped')),
                completed_at TEXT,
                session_number INTEGER NOT NULL,
                session_total INTEGER NOT NULL,
                rerating_score INTEGER,
                created_at TEXT NOT NULL,
                FOREIGN KEY (topic_id) REFERENCES topics(id)
            );

            CREATE TABLE IF NOT EXISTS availability_profiles (
                user_id TEXT PRIMARY KEY,
                weekday_earliest TEXT NOT NULL,
                weekday_latest TEXT NOT NULL,
                weekend_earliest TEXT NOT NULL,
                weekend_latest TEXT NOT NULL,
                use_same_weekend INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS unavailable_intervals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                start_at TEXT NOT NULL,
                end_at TEXT NOT NULL,
                reason TEXT,
                source TEXT NOT NULL DEFAULT 'manual' CHECK(source IN ('manual', 'recurring'))
            );

            CREATE TABLE IF NOT EXISTS recurring_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                label TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                days_of_week TEXT NOT NULL,
                start_date TEXT,
                end_date TEXT
            );

            CREATE TABLE IF NOT EXISTS week_confirmations (
                user_id TEXT NOT NULL,
                week_start TEXT NOT NULL,
                confirmed_at TEXT NOT NULL,
                PRIMARY KEY (user_id, week_start)
            );

            -- Append-only typed event store
            CREATE TABLE IF NOT EXISTS scheduling_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                block_id INTEGER,
                topic_id INTEGER,
                payload TEXT NOT NULL,
                occurred_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_topics_subject ON topics(subject_id);
            CREATE INDEX IF NOT EXISTS idx_rating_changes_topic ON rating_change_events(user_id, topic_id);
            CREATE INDEX IF NOT EXISTS idx_blocks_user_time ON blocks(user_id, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_blocks_status ON blocks(status);
            CREATE INDEX IF NOT EXISTS idx_intervals_user_start ON unavailable_intervals(user_id, start_at);
            CREATE INDEX IF NOT EXISTS idx_events_block ON scheduling_events(block_id, kind);
            CREATE INDEX IF NOT EXISTS idx_events_user ON scheduling_events(user_id);
            "#,
        )?;

        // Run migrations for existing databases
        self.migrate()?;

        self.conn
            .execute_batch("CREATE INDEX IF NOT EXISTS idx_blocks_kind ON blocks(kind);")?;

        Ok(())
    }

    // Handle schema migrations for existing databases
    fn migrate(&self) -> Result<()> {
        // Maintenance reviews were added after the first release
        let has_kind: bool = self.conn.prepare("SELECT kind FROM blocks LIMIT 1").is_ok();

        if !has_kind {
            self.conn.execute_batch(
                "ALTER TABLE blocks ADD COLUMN kind TEXT NOT NULL DEFAULT 'reinforcement';",
            )?;
        }

        Ok(())
    }

    /// Runs `f` inside a single SQLite transaction; any error rolls back.
    pub fn in_transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Self) -> std::result::Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }

    // Syllabus operations
    pub fn add_subject(&self, name: &str, exam_date: Option<NaiveDate>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO subjects (name, exam_date) VALUES (?1, ?2)",
            params![name, exam_date.map(fmt_date)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_subjects(&self) -> Result<Vec<Subject>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, exam_date FROM subjects ORDER BY name")?;
        let rows = stmt.query_map([], row_to_subject)?;
        rows.collect()
    }

    pub fn get_subject(&self, id: i64) -> Result<Option<Subject>> {
        self.conn
            .query_row(
                "SELECT id, name, exam_date FROM subjects WHERE id = ?1",
                params![id],
                row_to_subject,
            )
            .optional()
    }

    pub fn add_topic(
        &self,
        subject_id: i64,
        name: &str,
        level: i32,
        parent_id: Option<i64>,
        order_index: i32,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO topics (subject_id, name, level, parent_id, order_index) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![subject_id, name, level, parent_id, order_index],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_topic(&self, id: i64) -> Result<Option<Topic>> {
        self.conn
            .query_row(
                "SELECT id, subject_id, name, level, parent_id, order_index FROM topics WHERE id = ?1",
                params![id],
                row_to_topic,
            )
            .optional()
    }

    pub fn list_topics(&self, subject_id: Option<i64>) -> Result<Vec<Topic>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, subject_id, name, level, parent_id, order_index
            FROM topics
            WHERE ?1 IS NULL OR subject_id = ?1
            ORDER BY subject_id, order_index, id
            "#,
        )?;
        let rows = stmt.query_map(params![subject_id], row_to_topic)?;
        rows.collect()
    }

    // Confidence ledger
    pub fn get_rating(&self, user_id: &str, topic_id: i64) -> Result<Option<ConfidenceRating>> {
        self.conn
            .query_row(
                "SELECT user_id, topic_id, rating, last_updated FROM confidence_ratings WHERE user_id = ?1 AND topic_id = ?2",
                params![user_id, topic_id],
                row_to_rating,
            )
            .optional()
    }

    pub fn list_ratings(&self, user_id: &str) -> Result<Vec<ConfidenceRating>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, topic_id, rating, last_updated FROM confidence_ratings WHERE user_id = ?1 ORDER BY topic_id",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_rating)?;
        rows.collect()
    }

    pub fn upsert_rating(
        &self,
        user_id: &str,
        topic_id: i64,
        rating: i32,
        at: NaiveDateTime,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO confidence_ratings (user_id, topic_id, rating, last_updated)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, topic_id) DO UPDATE SET
                rating = excluded.rating,
                last_updated = excluded.last_updated
            "#,
            params![user_id, topic_id, rating, fmt_datetime(at)],
        )?;
        Ok(())
    }

    pub fn delete_rating(&self, user_id: &str, topic_id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM confidence_ratings WHERE user_id = ?1 AND topic_id = ?2",
            params![user_id, topic_id],
        )?;
        Ok(rows > 0)
    }

    pub fn append_rating_change(
        &self,
        user_id: &str,
        topic_id: i64,
        new_rating: i32,
        source: RatingSource,
        at: NaiveDateTime,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO rating_change_events (user_id, topic_id, new_rating, source, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, topic_id, new_rating, source.as_str(), fmt_datetime(at)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Rating changes for a user, oldest first.
    pub fn list_rating_changes(&self, user_id: &str) -> Result<Vec<RatingChangeEvent>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, topic_id, new_rating, source, created_at
            FROM rating_change_events
            WHERE user_id = ?1
            ORDER BY created_at, id
            "#,
        )?;
        let rows = stmt.query_map(params![user_id], row_to_rating_change)?;
        rows.collect()
    }

    pub fn list_topic_rating_changes(
        &self,
        user_id: &str,
        topic_id: i64,
    ) -> Result<Vec<RatingChangeEvent>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, topic_id, new_rating, source, created_at
            FROM rating_change_events
            WHERE user_id = ?1 AND topic_id = ?2
            ORDER BY created_at, id
            "#,
        )?;
        let rows = stmt.query_map(params![user_id, topic_id], row_to_rating_change)?;
        rows.collect()
    }

    // Blocks
    pub fn insert_block(
        &self,
        user_id: &str,
        block: &NewBlock,
        created_at: NaiveDateTime,
    ) -> Result<Block> {
        self.conn.execute(
            r#"
            INSERT INTO blocks (user_id, topic_id, kind, scheduled_at, duration_minutes, status,
                                session_number, session_total, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'scheduled', ?6, ?7, ?8)
            "#,
            params![
                user_id,
                block.topic_id,
                block.kind.as_str(),
                fmt_datetime(block.scheduled_at),
                block.duration_minutes,
                block.session_number,
                block.session_total,
                fmt_datetime(created_at),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_block(id)?
            .ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    pub fn get_block(&self, id: i64) -> Result<Option<Block>> {
        let sql = format!("SELECT {} FROM blocks WHERE id = ?1", BLOCK_COLUMNS);
        self.conn
            .query_row(&sql, params![id], row_to_block)
            .optional()
    }

    pub fn list_blocks(&self, user_id: &str) -> Result<Vec<Block>> {
        let sql = format!(
            "SELECT {} FROM blocks WHERE user_id = ?1 ORDER BY scheduled_at, id",
            BLOCK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], row_to_block)?;
        rows.collect()
    }

    /// Blocks whose start falls in `[from, to)`.
    pub fn list_blocks_between(
        &self,
        user_id: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Block>> {
        let sql = format!(
            "SELECT {} FROM blocks WHERE user_id = ?1 AND scheduled_at >= ?2 AND scheduled_at < ?3 ORDER BY scheduled_at, id",
            BLOCK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![user_id, fmt_datetime(from), fmt_datetime(to)],
            row_to_block,
        )?;
        rows.collect()
    }

    /// Scheduled blocks that started before `before`, optionally for one user.
    /// Callers still check the end time.
    pub fn list_scheduled_started_before(
        &self,
        user_id: Option<&str>,
        before: NaiveDateTime,
    ) -> Result<Vec<Block>> {
        let sql = format!(
            r#"
            SELECT {} FROM blocks
            WHERE status = 'scheduled'
              AND scheduled_at < ?1
              AND (?2 IS NULL OR user_id = ?2)
            ORDER BY scheduled_at, id
            "#,
            BLOCK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![fmt_datetime(before), user_id], row_to_block)?;
        rows.collect()
    }

    /// Compare-and-set on status so a concurrent transition cannot be
    /// overwritten. Returns false if the block was no longer in `from`.
    pub fn update_block_status(
        &self,
        id: i64,
        from: BlockStatus,
        to: BlockStatus,
        completed_at: Option<NaiveDateTime>,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE blocks SET status = ?1, completed_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                to.as_str(),
                completed_at.map(fmt_datetime),
                id,
                from.as_str()
            ],
        )?;
        Ok(rows > 0)
    }

    pub fn set_rerating_score(&self, id: i64, score: i32) -> Result<()> {
        self.conn.execute(
            "UPDATE blocks SET rerating_score = ?1 WHERE id = ?2",
            params![score, id],
        )?;
        Ok(())
    }

    pub fn renumber_block(&self, id: i64, session_number: u32) -> Result<()> {
        self.conn.execute(
            "UPDATE blocks SET session_number = ?1 WHERE id = ?2 AND status = 'scheduled'",
            params![session_number, id],
        )?;
        Ok(())
    }

    // Availability
    pub fn get_profile(&self, user_id: &str) -> Result<Option<AvailabilityProfile>> {
        self.conn
            .query_row(
                r#"
                SELECT user_id, weekday_earliest, weekday_latest, weekend_earliest, weekend_latest, use_same_weekend
                FROM availability_profiles
                WHERE user_id = ?1
                "#,
                params![user_id],
                |row| {
                    Ok(AvailabilityProfile {
                        user_id: row.get(0)?,
                        weekday_earliest: parse_time(row.get(1)?, 1)?,
                        weekday_latest: parse_time(row.get(2)?, 2)?,
                        weekend_earliest: parse_time(row.get(3)?, 3)?,
                        weekend_latest: parse_time(row.get(4)?, 4)?,
                        use_same_weekend: row.get(5)?,
                    })
                },
            )
            .optional()
    }

    pub fn upsert_profile(&self, profile: &AvailabilityProfile) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO availability_profiles
                (user_id, weekday_earliest, weekday_latest, weekend_earliest, weekend_latest, use_same_weekend)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id) DO UPDATE SET
                weekday_earliest = excluded.weekday_earliest,
                weekday_latest = excluded.weekday_latest,
                weekend_earliest = excluded.weekend_earliest,
                weekend_latest = excluded.weekend_latest,
                use_same_weekend = excluded.use_same_weekend
            "#,
            params![
                profile.user_id,
                fmt_time(profile.weekday_earliest),
                fmt_time(profile.weekday_latest),
                fmt_time(profile.weekend_earliest),
                fmt_time(profile.weekend_latest),
                profile.use_same_weekend,
            ],
        )?;
        Ok(())
    }

    pub fn add_interval(&self, interval: &UnavailableInterval) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO unavailable_intervals (user_id, start_at, end_at, reason, source) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                interval.user_id,
                fmt_datetime(interval.start),
                fmt_datetime(interval.end),
                interval.reason,
                interval.source.as_str(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn delete_manual_intervals(&self, user_id: &str) -> Result<usize> {
        self.conn.execute(
            "DELETE FROM unavailable_intervals WHERE user_id = ?1 AND source = 'manual'",
            params![user_id],
        )
    }

    /// Intervals overlapping `[from, to)`.
    pub fn list_intervals_overlapping(
        &self,
        user_id: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<UnavailableInterval>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, start_at, end_at, reason, source
            FROM unavailable_intervals
            WHERE user_id = ?1 AND start_at < ?3 AND end_at > ?2
            ORDER BY start_at, id
            "#,
        )?;
        let rows = stmt.query_map(
            params![user_id, fmt_datetime(from), fmt_datetime(to)],
            |row| {
                let source: String = row.get(5)?;
                Ok(UnavailableInterval {
                    id: Some(row.get(0)?),
                    user_id: row.get(1)?,
                    start: parse_datetime(row.get(2)?, 2)?,
                    end: parse_datetime(row.get(3)?, 3)?,
                    reason: row.get(4)?,
                    source: IntervalSource::from_str(&source),
                })
            },
        )?;
        rows.collect()
    }

    pub fn count_intervals_starting_between(
        &self,
        user_id: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM unavailable_intervals WHERE user_id = ?1 AND start_at >= ?2 AND start_at < ?3",
            params![user_id, fmt_datetime(from), fmt_datetime(to)],
            |row| row.get(0),
        )
    }

    pub fn add_recurring_event(&self, event: &RecurringEvent) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO recurring_events (user_id, label, start_time, end_time, days_of_week, start_date, end_date)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                event.user_id,
                event.label,
                fmt_time(event.start_time),
                fmt_time(event.end_time),
                fmt_weekdays(&event.days_of_week),
                event.start_date.map(fmt_date),
                event.end_date.map(fmt_date),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_recurring_events(&self, user_id: &str) -> Result<Vec<RecurringEvent>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, label, start_time, end_time, days_of_week, start_date, end_date
            FROM recurring_events
            WHERE user_id = ?1
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let start_date: Option<String> = row.get(6)?;
            let end_date: Option<String> = row.get(7)?;
            Ok(RecurringEvent {
                id: row.get(0)?,
                user_id: row.get(1)?,
                label: row.get(2)?,
                start_time: parse_time(row.get(3)?, 3)?,
                end_time: parse_time(row.get(4)?, 4)?,
                days_of_week: parse_weekdays(row.get(5)?, 5)?,
                start_date: start_date.map(|d| parse_date(d, 6)).transpose()?,
                end_date: end_date.map(|d| parse_date(d, 7)).transpose()?,
            })
        })?;
        rows.collect()
    }

    pub fn delete_recurring_event(&self, user_id: &str, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM recurring_events WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(rows > 0)
    }

    // Week confirmations
    pub fn confirm_week(&self, user_id: &str, week_start: NaiveDate, at: NaiveDateTime) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO week_confirmations (user_id, week_start, confirmed_at) VALUES (?1, ?2, ?3)",
            params![user_id, fmt_date(week_start), fmt_datetime(at)],
        )?;
        Ok(())
    }

    pub fn has_week_confirmation(&self, user_id: &str, week_start: NaiveDate) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM week_confirmations WHERE user_id = ?1 AND week_start = ?2",
            params![user_id, fmt_date(week_start)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // Event store
    pub fn append_event(
        &self,
        user_id: &str,
        event: &SchedulingEvent,
        at: NaiveDateTime,
    ) -> Result<i64> {
        let payload = serde_json::to_string(event)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn.execute(
            r#"
            INSERT INTO scheduling_events (user_id, kind, block_id, topic_id, payload, occurred_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                user_id,
                event.kind(),
                event.block_id(),
                event.topic_id(),
                payload,
                fmt_datetime(at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent events first.
    pub fn list_events(&self, user_id: &str, limit: usize) -> Result<Vec<EventRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, user_id, payload, occurred_at
            FROM scheduling_events
            WHERE user_id = ?1
            ORDER BY occurred_at DESC, id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            let payload: String = row.get(2)?;
            let event: SchedulingEvent = serde_json::from_str(&payload)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
            Ok(EventRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                occurred_at: parse_datetime(row.get(3)?, 3)?,
                event,
            })
        })?;
        rows.collect()
    }

    /// Times at which a block was swept to missed, oldest first.
    pub fn missed_event_times(&self, block_id: i64) -> Result<Vec<NaiveDateTime>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT occurred_at FROM scheduling_events
            WHERE block_id = ?1 AND kind = 'block_missed'
            ORDER BY occurred_at, id
            "#,
        )?;
        let rows = stmt.query_map(params![block_id], |row| parse_datetime(row.get(0)?, 0))?;
        rows.collect()
    }

    pub fn get_stats(&self, user_id: &str) -> Result<Stats> {
        let count_status = |status: BlockStatus| -> Result<i64> {
            self.conn.query_row(
                "SELECT COUNT(*) FROM blocks WHERE user_id = ?1 AND status = ?2",
                params![user_id, status.as_str()],
                |row| row.get(0),
            )
        };

        let rated_topics: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM confidence_ratings WHERE user_id = ?1 AND rating > 0",
            params![user_id],
            |row| row.get(0),
        )?;

        let missed_events: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM scheduling_events WHERE user_id = ?1 AND kind = 'block_missed'",
            params![user_id],
            |row| row.get(0),
        )?;

        let avg_rating: f64 = self
            .conn
            .query_row(
                "SELECT COALESCE(AVG(rating), 0) FROM confidence_ratings WHERE user_id = ?1 AND rating > 0",
                params![user_id],
                |row| row.get(0),
            )
            .unwrap_or(0.0);

        Ok(Stats {
            rated_topics,
            scheduled: count_status(BlockStatus::Scheduled)?,
            done: count_status(BlockStatus::Done)?,
            missed: count_status(BlockStatus::Missed)?,
            skipped: count_status(BlockStatus::Skipped)?,
            missed_events,
            first_attempt_done: 0,
            avg_rating,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Stats {
    pub rated_topics: i64,
    pub scheduled: i64,
    pub done: i64,
    pub missed: i64,
    pub skipped: i64,
    pub missed_events: i64,
    // Filled in by the scheduler, which owns the first-attempt rule
    pub first_attempt_done: i64,
    pub avg_rating: f64,
}

fn row_to_subject(row: &Row) -> Result<Subject> {
    let exam_date: Option<String> = row.get(2)?;
    Ok(Subject {
        id: row.get(0)?,
        name: row.get(1)?,
        exam_date: exam_date.map(|d| parse_date(d, 2)).transpose()?,
    })
}

fn row_to_topic(row: &Row) -> Result<Topic> {
    Ok(Topic {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        name: row.get(2)?,
        level: row.get(3)?,
        parent_id: row.get(4)?,
        order_index: row.get(5)?,
    })
}

fn row_to_rating(row: &Row) -> Result<ConfidenceRating> {
    Ok(ConfidenceRating {
        user_id: row.get(0)?,
        topic_id: row.get(1)?,
        rating: row.get(2)?,
        last_updated: parse_datetime(row.get(3)?, 3)?,
    })
}

fn row_to_rating_change(row: &Row) -> Result<RatingChangeEvent> {
    let source: String = row.get(4)?;
    Ok(RatingChangeEvent {
        id: row.get(0)?,
        user_id: row.get(1)?,
        topic_id: row.get(2)?,
        new_rating: row.get(3)?,
        source: RatingSource::from_str(&source),
        timestamp: parse_datetime(row.get(5)?, 5)?,
    })
}

fn row_to_block(row: &Row) -> Result<Block> {
    let kind: String = row.get(3)?;
    let status: String = row.get(6)?;
    let completed_at: Option<String> = row.get(7)?;
    Ok(Block {
        id: row.get(0)?,
        user_id: row.get(1)?,
        topic_id: row.get(2)?,
        kind: BlockKind::from_str(&kind).ok_or_else(|| invalid_text(3, &kind))?,
        scheduled_at: parse_datetime(row.get(4)?, 4)?,
        duration_minutes: row.get(5)?,
        status: BlockStatus::from_str(&status).ok_or_else(|| invalid_text(6, &status))?,
        completed_at: completed_at.map(|v| parse_datetime(v, 7)).transpose()?,
        session_number: row.get(8)?,
        session_total: row.get(9)?,
        rerating_score: row.get(10)?,
        created_at: parse_datetime(row.get(11)?, 11)?,
    })
}

fn invalid_text(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected value '{}'", value).into(),
    )
}

fn fmt_datetime(value: NaiveDateTime) -> String {
    value.format(DATETIME_FMT).to_string()
}

fn fmt_date(value: NaiveDate) -> String {
    value.format(DATE_FMT).to_string()
}

fn fmt_time(value: NaiveTime) -> String {
    value.format(TIME_FMT).to_string()
}

fn fmt_weekdays(days: &[Weekday]) -> String {
    days.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_datetime(value: String, idx: usize) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&value, DATETIME_FMT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_date(value: String, idx: usize) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(&value, DATE_FMT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_time(value: String, idx: usize) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(&value, TIME_FMT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_weekdays(value: String, idx: usize) -> Result<Vec<Weekday>> {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().parse::<Weekday>().map_err(|_| invalid_text(idx, s)))
        .collect()
}
