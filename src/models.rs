use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

pub type UserId = String;

pub const MIN_RATING: i32 = -2;
pub const MAX_RATING: i32 = 5;

// Only topics at this depth of the syllabus tree can be rated and scheduled
pub const SCHEDULABLE_LEVEL: i32 = 3;

/// Reinforcement sessions owed for a cycle started at the given confidence.
pub fn sessions_needed(rating: i32) -> u32 {
    match rating {
        1 => 3,
        2 => 2,
        3 => 1,
        _ => 0,
    }
}

pub fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub id: i64,
    pub name: String,
    pub exam_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: i64,
    pub subject_id: i64,
    pub name: String,
    pub level: i32,
    pub parent_id: Option<i64>,
    pub order_index: i32,
}

impl Topic {
    pub fn is_rateable(&self) -> bool {
        self.level == SCHEDULABLE_LEVEL
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceRating {
    pub user_id: UserId,
    pub topic_id: i64,
    pub rating: i32,
    pub last_updated: NaiveDateTime,
}

impl ConfidenceRating {
    // Zero and negative ratings mean "do not schedule"
    pub fn is_schedulable(&self) -> bool {
        self.rating > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Scheduled,
    Done,
    Missed,
    Skipped,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Scheduled => "scheduled",
            BlockStatus::Done => "done",
            BlockStatus::Missed => "missed",
            BlockStatus::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "scheduled" => Some(BlockStatus::Scheduled),
            "done" => Some(BlockStatus::Done),
            "missed" => Some(BlockStatus::Missed),
            "skipped" => Some(BlockStatus::Skipped),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BlockStatus::Scheduled => "Scheduled",
            BlockStatus::Done => "Done",
            BlockStatus::Missed => "Missed",
            BlockStatus::Skipped => "Skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BlockStatus::Scheduled)
    }

    /// Terminal states are only reachable from `Scheduled`; any state may be
    /// reverted to `Scheduled`.
    pub fn can_transition_to(&self, next: BlockStatus) -> bool {
        match next {
            BlockStatus::Scheduled => true,
            _ => *self == BlockStatus::Scheduled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Reinforcement,
    Maintenance,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Reinforcement => "reinforcement",
            BlockKind::Maintenance => "maintenance",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "reinforcement" => Some(BlockKind::Reinforcement),
            "maintenance" => Some(BlockKind::Maintenance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: i64,
    pub user_id: UserId,
    pub topic_id: i64,
    pub kind: BlockKind,
    pub scheduled_at: NaiveDateTime,
    pub duration_minutes: i64,
    pub status: BlockStatus,
    pub completed_at: Option<NaiveDateTime>,
    pub session_number: u32,
    pub session_total: u32,
    pub rerating_score: Option<i32>,
    pub created_at: NaiveDateTime,
}

impl Block {
    pub fn ends_at(&self) -> NaiveDateTime {
        self.scheduled_at + Duration::minutes(self.duration_minutes)
    }

    pub fn day(&self) -> NaiveDate {
        self.scheduled_at.date()
    }

    pub fn is_final_session(&self) -> bool {
        self.session_number == self.session_total
    }

    // Scheduled and done blocks are delivered work; missed and skipped ones are owed again
    pub fn counts_toward_cycle(&self) -> bool {
        matches!(self.status, BlockStatus::Scheduled | BlockStatus::Done)
    }

    pub fn overlaps(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        self.scheduled_at < end && start < self.ends_at()
    }

    pub fn has_elapsed(&self, now: NaiveDateTime) -> bool {
        self.ends_at() < now
    }
}

/// A block the planner has decided to create but which is not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlock {
    pub topic_id: i64,
    pub kind: BlockKind,
    pub scheduled_at: NaiveDateTime,
    pub duration_minutes: i64,
    pub session_number: u32,
    pub session_total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityProfile {
    pub user_id: UserId,
    pub weekday_earliest: NaiveTime,
    pub weekday_latest: NaiveTime,
    pub weekend_earliest: NaiveTime,
    pub weekend_latest: NaiveTime,
    pub use_same_weekend: bool,
}

impl AvailabilityProfile {
    /// The `[earliest, latest)` study window that applies on `date`.
    pub fn window_for(&self, date: NaiveDate) -> (NaiveTime, NaiveTime) {
        if is_weekend(date) && !self.use_same_weekend {
            (self.weekend_earliest, self.weekend_latest)
        } else {
            (self.weekday_earliest, self.weekday_latest)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.weekday_earliest >= self.weekday_latest {
            return Err("weekday earliest time must be before latest time".to_string());
        }
        if !self.use_same_weekend && self.weekend_earliest >= self.weekend_latest {
            return Err("weekend earliest time must be before latest time".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalSource {
    Manual,
    Recurring,
}

impl IntervalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalSource::Manual => "manual",
            IntervalSource::Recurring => "recurring",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "recurring" => IntervalSource::Recurring,
            _ => IntervalSource::Manual,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailableInterval {
    pub id: Option<i64>,
    pub user_id: UserId,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub reason: Option<String>,
    pub source: IntervalSource,
}

impl UnavailableInterval {
    pub fn manual(user_id: &str, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            id: None,
            user_id: user_id.to_string(),
            start,
            end,
            reason: None,
            source: IntervalSource::Manual,
        }
    }

    pub fn overlaps(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        self.start < end && start < self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringEvent {
    pub id: i64,
    pub user_id: UserId,
    pub label: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub days_of_week: Vec<Weekday>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl RecurringEvent {
    pub fn occurs_on(&self, date: NaiveDate) -> bool {
        if !self.days_of_week.contains(&date.weekday()) {
            return false;
        }
        if self.start_date.is_some_and(|from| date < from) {
            return false;
        }
        if self.end_date.is_some_and(|until| date > until) {
            return false;
        }
        true
    }

    /// Concrete blocked interval for one occurrence. An end time at or before
    /// the start time runs past midnight.
    pub fn interval_on(&self, date: NaiveDate) -> Option<UnavailableInterval> {
        if !self.occurs_on(date) {
            return None;
        }
        let start = date.and_time(self.start_time);
        let end_date = if self.end_time <= self.start_time {
            date.succ_opt()?
        } else {
            date
        };
        Some(UnavailableInterval {
            id: None,
            user_id: self.user_id.clone(),
            start,
            end: end_date.and_time(self.end_time),
            reason: Some(self.label.clone()),
            source: IntervalSource::Recurring,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingSource {
    Assessment,
    Rerating,
}

impl RatingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatingSource::Assessment => "assessment",
            RatingSource::Rerating => "rerating",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "rerating" => RatingSource::Rerating,
            _ => RatingSource::Assessment,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingChangeEvent {
    pub id: i64,
    pub user_id: UserId,
    pub topic_id: i64,
    pub new_rating: i32,
    pub source: RatingSource,
    pub timestamp: NaiveDateTime,
}

// Advisory follow-up returned by a re-rating
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NextAction {
    Reinforce { sessions: u32 },
    Maintain { interval_days: i64, due_on: NaiveDate },
}

impl NextAction {
    pub fn describe(&self) -> String {
        match self {
            NextAction::Reinforce { sessions } => {
                format!("{} reinforcement session(s) will be planned", sessions)
            }
            NextAction::Maintain {
                interval_days,
                due_on,
            } => format!(
                "maintenance review in {} days (due {})",
                interval_days, due_on
            ),
        }
    }
}

/// Typed entries of the append-only event store. The same log serves as the
/// audit trail and as input for missed-event lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulingEvent {
    BlockCreated {
        block_id: i64,
        topic_id: i64,
        scheduled_at: NaiveDateTime,
        session_number: u32,
        session_total: u32,
    },
    StatusChanged {
        block_id: i64,
        from: BlockStatus,
        to: BlockStatus,
    },
    BlockMissed {
        block_id: i64,
        topic_id: i64,
        scheduled_at: NaiveDateTime,
    },
    ReratingDecision {
        block_id: i64,
        topic_id: i64,
        rating: i32,
        next_action: NextAction,
    },
    PlanGenerated {
        week_start: NaiveDate,
        created: usize,
        unmet: usize,
    },
    AllocationFailed {
        topic_id: i64,
        reason: String,
    },
    WeekConfirmed {
        week_start: NaiveDate,
    },
}

impl SchedulingEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulingEvent::BlockCreated { .. } => "block_created",
            SchedulingEvent::StatusChanged { .. } => "status_changed",
            SchedulingEvent::BlockMissed { .. } => "block_missed",
            SchedulingEvent::ReratingDecision { .. } => "rerating_decision",
            SchedulingEvent::PlanGenerated { .. } => "plan_generated",
            SchedulingEvent::AllocationFailed { .. } => "allocation_failed",
            SchedulingEvent::WeekConfirmed { .. } => "week_confirmed",
        }
    }

    pub fn block_id(&self) -> Option<i64> {
        match self {
            SchedulingEvent::BlockCreated { block_id, .. }
            | SchedulingEvent::StatusChanged { block_id, .. }
            | SchedulingEvent::BlockMissed { block_id, .. }
            | SchedulingEvent::ReratingDecision { block_id, .. } => Some(*block_id),
            _ => None,
        }
    }

    pub fn topic_id(&self) -> Option<i64> {
        match self {
            SchedulingEvent::BlockCreated { topic_id, .. }
            | SchedulingEvent::BlockMissed { topic_id, .. }
            | SchedulingEvent::ReratingDecision { topic_id, .. }
            | SchedulingEvent::AllocationFailed { topic_id, .. } => Some(*topic_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub user_id: UserId,
    pub occurred_at: NaiveDateTime,
    pub event: SchedulingEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmetReason {
    NoCapacity,
    Deferred,
    WriteFailed,
}

impl UnmetReason {
    pub fn label(&self) -> &'static str {
        match self {
            UnmetReason::NoCapacity => "no open slot",
            UnmetReason::Deferred => "deferred to a later week",
            UnmetReason::WriteFailed => "store write failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmetDemand {
    pub topic_id: i64,
    pub sessions: u32,
    pub reason: UnmetReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub week_start: NaiveDate,
    pub blocks: Vec<Block>,
    pub unmet: Vec<UnmetDemand>,
}

// JSON output wrapper for CLI
#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
