//! Capability checks: the Review Gate, the Execution Gate and team membership.
//!
//! Every check reads the grant tables directly. Nothing is cached, so a
//! revoked capability takes effect on the next request.

use crate::db::DbPool;
use crate::error::AppError;
use crate::models::{Role, RoleFlags};

/// Whether `user_id` currently holds `role`.
pub async fn has_role(pool: &DbPool, user_id: i64, role: Role) -> Result<bool, AppError> {
    let sql = format!("SELECT 1 FROM {} WHERE user_id = ?", role.table());
    let found = sqlx::query(&sql)
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .is_some();

    Ok(found)
}

/// Whether `user_id` is currently a member of `team_id`.
pub async fn is_member(pool: &DbPool, user_id: i64, team_id: i64) -> Result<bool, AppError> {
    let found = sqlx::query("SELECT 1 FROM user_team_membership WHERE user_id = ? AND team_id = ?")
        .bind(user_id)
        .bind(team_id)
        .fetch_optional(pool)
        .await?
        .is_some();

    Ok(found)
}

/// Derive both role flags for a user.
pub async fn role_flags(pool: &DbPool, user_id: i64) -> Result<RoleFlags, AppError> {
    Ok(RoleFlags {
        is_super_manager: has_role(pool, user_id, Role::SuperManager).await?,
        is_gateway_editor: has_role(pool, user_id, Role::GatewayEditor).await?,
    })
}

/// Fail with `Forbidden` unless `user_id` holds `role`.
pub async fn require_role(pool: &DbPool, user_id: i64, role: Role) -> Result<(), AppError> {
    if has_role(pool, user_id, role).await? {
        Ok(())
    } else {
        Err(AppError::forbidden(format!("{} access required", role)))
    }
}

/// Review Gate: only Super Managers may record a review decision.
pub async fn require_reviewer(pool: &DbPool, user_id: i64) -> Result<(), AppError> {
    require_role(pool, user_id, Role::SuperManager).await
}

/// Execution Gate: only Gateway Editors may move execution status.
pub async fn require_executor(pool: &DbPool, user_id: i64) -> Result<(), AppError> {
    require_role(pool, user_id, Role::GatewayEditor).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_test_db() -> DbPool {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::mem::forget(dir);

        let pool = crate::db::initialize(&db_path).await.unwrap();

        for (id, name) in [(1, "alice"), (2, "bob")] {
            sqlx::query("INSERT INTO users (user_id, username, email) VALUES (?, ?, ?)")
                .bind(id)
                .bind(name)
                .bind(format!("{}@example.com", name))
                .execute(&pool)
                .await
                .unwrap();
        }
        sqlx::query("INSERT INTO teams (team_id, name) VALUES (10, 'edge')")
            .execute(&pool)
            .await
            .unwrap();

        pool
    }

    #[tokio::test]
    async fn test_review_gate_follows_grant_rows() {
        let pool = setup_test_db().await;

        let err = require_reviewer(&pool, 1).await.unwrap_err();
        assert_eq!(err.kind(), "FORBIDDEN");

        sqlx::query("INSERT INTO super_managers (user_id) VALUES (1)")
            .execute(&pool)
            .await
            .unwrap();
        require_reviewer(&pool, 1).await.unwrap();

        // Revocation is visible immediately
        sqlx::query("DELETE FROM super_managers WHERE user_id = 1")
            .execute(&pool)
            .await
            .unwrap();
        assert!(require_reviewer(&pool, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_execution_gate_is_independent_of_review_gate() {
        let pool = setup_test_db().await;

        sqlx::query("INSERT INTO super_managers (user_id) VALUES (2)")
            .execute(&pool)
            .await
            .unwrap();
        assert!(require_executor(&pool, 2).await.is_err());

        sqlx::query("INSERT INTO gateway_editors (user_id) VALUES (2)")
            .execute(&pool)
            .await
            .unwrap();
        require_executor(&pool, 2).await.unwrap();

        let flags = role_flags(&pool, 2).await.unwrap();
        assert!(flags.is_super_manager);
        assert!(flags.is_gateway_editor);
        assert_eq!(role_flags(&pool, 1).await.unwrap(), RoleFlags::default());
    }

    #[tokio::test]
    async fn test_membership_check() {
        let pool = setup_test_db().await;
        assert!(!is_member(&pool, 1, 10).await.unwrap());

        sqlx::query("INSERT INTO user_team_membership (user_id, team_id) VALUES (1, 10)")
            .execute(&pool)
            .await
            .unwrap();
        assert!(is_member(&pool, 1, 10).await.unwrap());
        assert!(!is_member(&pool, 2, 10).await.unwrap());
    }
}
