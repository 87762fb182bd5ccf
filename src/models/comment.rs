//! Comment model for change request discussions.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Append-only comment on a change request.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Comment {
    pub comment_id: i64,
    pub cr_id: i64,

    /// Comment author.
    pub user_id: i64,

    pub comment_text: String,

    /// Creation timestamp (Unix).
    pub created_at: i64,
}
