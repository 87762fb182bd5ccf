//! Audit trail model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Actor id recorded for transitions made by automation rather than a user.
pub const SYSTEM_ACTOR_ID: i64 = 0;

/// Kind of lifecycle event recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Created,
    Updated,
    StatusChange,
    CommentAdded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::StatusChange => "STATUS_CHANGE",
            Self::CommentAdded => "COMMENT_ADDED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one lifecycle event, stored in `cr_history`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub history_id: i64,
    pub cr_id: i64,

    /// Acting user, or [`SYSTEM_ACTOR_ID`] for automation.
    pub changed_by_user_id: i64,

    /// `CREATED`, `UPDATED`, `STATUS_CHANGE` or `COMMENT_ADDED`.
    pub event_type: String,

    pub old_status: Option<String>,

    /// Empty for events that do not change a status.
    pub new_status: String,

    /// When the event occurred (Unix).
    pub timestamp: i64,
}

impl AuditEntry {
    pub fn is_system(&self) -> bool {
        self.changed_by_user_id == SYSTEM_ACTOR_ID
    }

    pub fn is_event(&self, event_type: EventType) -> bool {
        self.event_type == event_type.as_str()
    }
}
