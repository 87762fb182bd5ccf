//! Super Manager review record.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One immutable approval/rejection decision on a change request.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Review {
    pub review_id: i64,
    pub cr_id: i64,

    /// Reviewing Super Manager.
    pub sm_user_id: i64,

    /// `APPROVED` or `REJECTED`.
    pub review_decision: String,

    /// When the decision was recorded (Unix).
    pub reviewed_at: i64,
}
