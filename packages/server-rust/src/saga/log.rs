//! Saga log records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a saga log entry. Stored as `0`, `1` and `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogType {
    Session,
    Do,
    Undo,
}

impl LogType {
    #[must_use]
    pub fn code(self) -> i16 {
        match self {
            Self::Session => 0,
            Self::Do => 1,
            Self::Undo => 2,
        }
    }

    #[must_use]
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Session),
            1 => Some(Self::Do),
            2 => Some(Self::Undo),
            _ => None,
        }
    }
}

/// Marker stored on a Session log after a clean rollback.
pub const ROLLED_BACK: &str = "rolled back";

/// Marker stored on a Session log after crash recovery compensated it.
pub const RECOVERED: &str = "recovered";

/// One row of the saga log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaLog {
    pub id: String,
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
    /// `None` until acknowledged.
    pub finished_at: Option<DateTime<Utc>>,
    pub log_type: LogType,
    pub step_name: String,
    pub step_param: Vec<u8>,
    pub step_error: Option<String>,
}

impl SagaLog {
    fn new(
        correlation_id: &str,
        log_type: LogType,
        step_name: &str,
        step_param: Vec<u8>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            correlation_id: correlation_id.to_string(),
            started_at: at,
            finished_at: None,
            log_type,
            step_name: step_name.to_string(),
            step_param,
            step_error: None,
        }
    }

    #[must_use]
    pub fn session(correlation_id: &str, at: DateTime<Utc>) -> Self {
        Self::new(correlation_id, LogType::Session, "", Vec::new(), at)
    }

    #[must_use]
    pub fn step(correlation_id: &str, step_name: &str, param: Vec<u8>, at: DateTime<Utc>) -> Self {
        Self::new(correlation_id, LogType::Do, step_name, param, at)
    }

    #[must_use]
    pub fn undo(correlation_id: &str, step_name: &str, param: Vec<u8>, at: DateTime<Utc>) -> Self {
        Self::new(correlation_id, LogType::Undo, step_name, param, at)
    }

    /// Finished without error.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.finished_at.is_some() && self.step_error.is_none()
    }
}
