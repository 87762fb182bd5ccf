//! Append-only audit trail for change request lifecycle events.
//!
//! Entries are only ever inserted. Writers pass the open transaction of the
//! operation being audited so the entry commits or rolls back with it.

use crate::db::now;
use crate::db::DbPool;
use crate::error::AppError;
use crate::models::{AuditEntry, EventType};
use sqlx::SqliteConnection;

/// An audit entry about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditEntry {
    pub cr_id: i64,
    pub actor_user_id: i64,
    pub event_type: EventType,
    pub old_status: Option<String>,
    pub new_status: String,
}

impl NewAuditEntry {
    /// A CR was created in `initial_status`.
    pub fn created(cr_id: i64, actor_user_id: i64, initial_status: impl Into<String>) -> Self {
        Self {
            cr_id,
            actor_user_id,
            event_type: EventType::Created,
            old_status: None,
            new_status: initial_status.into(),
        }
    }

    /// Title or payload edited; the approval status is recorded on both sides.
    pub fn updated(cr_id: i64, actor_user_id: i64, approval_status: impl Into<String>) -> Self {
        let status = approval_status.into();
        Self {
            cr_id,
            actor_user_id,
            event_type: EventType::Updated,
            old_status: Some(status.clone()),
            new_status: status,
        }
    }

    /// Approval or execution status moved from `old` to `new`.
    pub fn status_change(
        cr_id: i64,
        actor_user_id: i64,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        Self {
            cr_id,
            actor_user_id,
            event_type: EventType::StatusChange,
            old_status: Some(old.into()),
            new_status: new.into(),
        }
    }

    /// A comment was added; no status moved.
    pub fn comment_added(cr_id: i64, actor_user_id: i64) -> Self {
        Self {
            cr_id,
            actor_user_id,
            event_type: EventType::CommentAdded,
            old_status: None,
            new_status: String::new(),
        }
    }
}

/// Append an entry using the caller's connection (normally `&mut *tx`).
///
/// # Returns
/// The new entry's `history_id`
pub async fn append(conn: &mut SqliteConnection, entry: &NewAuditEntry) -> Result<i64, AppError> {
    let history_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO cr_history (cr_id, changed_by_user_id, event_type, old_status, new_status, timestamp)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING history_id
        "#,
    )
    .bind(entry.cr_id)
    .bind(entry.actor_user_id)
    .bind(entry.event_type.as_str())
    .bind(entry.old_status.as_deref())
    .bind(&entry.new_status)
    .bind(now())
    .fetch_one(conn)
    .await?;

    Ok(history_id)
}

/// Audit history for a CR, oldest first.
///
/// Entries written within the same second keep their insertion order.
pub async fn history_for(pool: &DbPool, cr_id: i64) -> Result<Vec<AuditEntry>, AppError> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        r#"
        SELECT history_id, cr_id, changed_by_user_id, event_type, old_status, new_status, timestamp
        FROM cr_history
        WHERE cr_id = ?
        ORDER BY timestamp ASC, history_id ASC
        "#,
    )
    .bind(cr_id)
    .fetch_all(pool)
    .await?;

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SYSTEM_ACTOR_ID;
    use tempfile::tempdir;

    async fn setup_test_db() -> DbPool {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        // Keep the dir alive by leaking it (for test purposes)
        std::mem::forget(dir);

        let pool = crate::db::initialize(&db_path).await.unwrap();

        sqlx::query("INSERT INTO users (user_id, username, email) VALUES (1, 'alice', 'alice@example.com')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO teams (team_id, name) VALUES (1, 'edge')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            r#"INSERT INTO change_requests
            (cr_id, requester_user_id, requester_team_id, title, config_changes_payload, created_at, approval_status, execution_status)
            VALUES (1, 1, 1, 'Test CR', '{}', 0, 'PENDING_APPROVAL', 'DRAFT')"#,
        )
        .execute(&pool)
        .await
        .unwrap();

        pool
    }

    #[test]
    fn test_updated_entry_records_same_status_twice() {
        let entry = NewAuditEntry::updated(7, 3, "REJECTED");
        assert_eq!(entry.old_status.as_deref(), Some("REJECTED"));
        assert_eq!(entry.new_status, "REJECTED");
        assert_eq!(entry.event_type, EventType::Updated);
    }

    #[test]
    fn test_comment_entry_has_empty_marker() {
        let entry = NewAuditEntry::comment_added(7, 3);
        assert!(entry.old_status.is_none());
        assert!(entry.new_status.is_empty());
    }

    #[tokio::test]
    async fn test_append_and_read_in_order() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();

        append(&mut conn, &NewAuditEntry::created(1, 1, "PENDING_APPROVAL"))
            .await
            .unwrap();
        append(&mut conn, &NewAuditEntry::comment_added(1, 1))
            .await
            .unwrap();
        append(
            &mut conn,
            &NewAuditEntry::status_change(1, SYSTEM_ACTOR_ID, "DRAFT", "IN_PROGRESS"),
        )
        .await
        .unwrap();
        drop(conn);

        let history = history_for(&pool, 1).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].is_event(EventType::Created));
        assert!(history[0].old_status.is_none());
        assert!(history[1].is_event(EventType::CommentAdded));
        assert!(history[2].is_system());
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_entries_cannot_be_modified_or_deleted() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let id = append(&mut conn, &NewAuditEntry::created(1, 1, "PENDING_APPROVAL"))
            .await
            .unwrap();
        drop(conn);

        let update = sqlx::query("UPDATE cr_history SET new_status = 'APPROVED' WHERE history_id = ?")
            .bind(id)
            .execute(&pool)
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM cr_history WHERE history_id = ?")
            .bind(id)
            .execute(&pool)
            .await;
        assert!(delete.is_err());

        assert_eq!(history_for(&pool, 1).await.unwrap().len(), 1);
    }
}
