use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Block {block_id} does not belong to this user")]
    Authorization { block_id: i64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Plan for week of {week_start} cannot be generated yet: {reason}; earliest permitted day is {earliest}")]
    GateViolation {
        week_start: NaiveDate,
        earliest: NaiveDate,
        reason: String,
    },

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("No availability profile saved; set your study hours first")]
    IncompleteProfile,

    #[error("Store unavailable: {0}")]
    Upstream(#[from] rusqlite::Error),

    #[error("Event payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl SchedulerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SchedulerError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        SchedulerError::NotFound(what.into())
    }

    /// Errors the user can fix by changing their input or waiting for the gate.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            SchedulerError::Validation(_)
                | SchedulerError::GateViolation { .. }
                | SchedulerError::IncompleteProfile
                | SchedulerError::NotFound(_)
                | SchedulerError::Authorization { .. }
        )
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_violation_names_earliest_day() {
        let err = SchedulerError::GateViolation {
            week_start: NaiveDate::from_ymd_opt(2026, 10, 26).unwrap(),
            earliest: NaiveDate::from_ymd_opt(2026, 10, 24).unwrap(),
            reason: "next week opens at the weekend".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("2026-10-26"));
        assert!(msg.contains("earliest permitted day is 2026-10-24"));
    }

    #[test]
    fn store_errors_are_not_user_facing() {
        let err: SchedulerError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(!err.is_user_facing());
        assert!(SchedulerError::validation("bad").is_user_facing());
    }
}
