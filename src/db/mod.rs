//! Database layer for the change request store.
//!
//! This module handles all database operations including:
//! - Connection pool management with WAL mode
//! - Schema migrations
//! - Timestamp helpers shared by the services

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Type alias for the SQLite connection pool.
pub type DbPool = Pool<Sqlite>;

/// How long a write waits for SQLite's writer lock.
///
/// Review, execution and automation transactions each open with their
/// conditional UPDATE, so a contender waits here and then re-evaluates the
/// condition against committed state.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Enough for request handlers plus the automation worker.
const MAX_CONNECTIONS: u32 = 5;

/// Database-related errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),
}

/// Migrations applied in order; each name is recorded once in `_migrations`.
const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_initial_schema",
    include_str!("migrations/0001_initial_schema.sql"),
)];

/// Get the current Unix timestamp.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Initialize the database: create the file if needed and run migrations.
///
/// # Arguments
/// * `db_path` - Path to the SQLite database file
///
/// # Returns
/// A connection pool configured with WAL mode
pub async fn initialize(db_path: &Path) -> Result<DbPool, DbError> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbError::Migration(format!("Failed to create database directory: {}", e))
            })?;
        }
    }

    let pool = create_pool(db_path).await?;

    run_migrations(&pool).await?;

    log::info!("[db] Database ready at {}", db_path.display());
    Ok(pool)
}

/// Open the change request store.
///
/// WAL lets list and detail reads proceed while a lifecycle transaction
/// holds the writer lock. Foreign keys are on so reviews, comments and
/// audit entries cannot point at a missing CR.
async fn create_pool(db_path: &Path) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
}

/// Run all pending database migrations.
async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    let mut conn = pool.acquire().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    for (name, sql) in MIGRATIONS {
        let applied: Option<(i64,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;

        if applied.is_some() {
            continue;
        }

        for statement in parse_sql_statements(sql) {
            sqlx::query(&statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| DbError::Migration(format!("{}: {}", name, e)))?;
        }

        sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
            .bind(name)
            .execute(&mut *conn)
            .await?;

        log::info!("[db] Applied migration {}", name);
    }

    Ok(())
}

/// Parse SQL statements from a migration file.
///
/// This handles:
/// - Comments (lines starting with --)
/// - Semicolons inside parentheses (e.g., `strftime('%s', 'now')`)
/// - Semicolons inside trigger bodies (`BEGIN ... END;`)
/// - Multi-line statements
fn parse_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current_statement = String::new();
    let mut paren_depth: i32 = 0;
    let mut block_depth: i32 = 0;

    for line in sql.lines() {
        let trimmed = line.trim();

        // Skip comment-only lines
        if trimmed.starts_with("--") {
            continue;
        }

        let upper = trimmed.to_ascii_uppercase();
        if upper == "BEGIN" {
            block_depth += 1;
        } else if block_depth > 0 && upper.starts_with("END") {
            block_depth -= 1;
        }

        // Remove inline comments
        let line_without_comment = match line.find("--") {
            Some(idx) => &line[..idx],
            None => line,
        };

        for ch in line_without_comment.chars() {
            match ch {
                '(' => {
                    paren_depth += 1;
                    current_statement.push(ch);
                }
                ')' => {
                    paren_depth = paren_depth.saturating_sub(1);
                    current_statement.push(ch);
                }
                ';' if paren_depth == 0 && block_depth == 0 => {
                    let stmt = current_statement.trim().to_string();
                    if !stmt.is_empty() {
                        statements.push(stmt);
                    }
                    current_statement.clear();
                }
                _ => {
                    current_statement.push(ch);
                }
            }
        }

        if !current_statement.is_empty() {
            current_statement.push(' ');
        }
    }

    // Handle any remaining statement without trailing semicolon
    let final_stmt = current_statement.trim().to_string();
    if !final_stmt.is_empty() {
        statements.push(final_stmt);
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_initialize_creates_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        let pool = initialize(&db_path).await.unwrap();

        assert!(db_path.exists());

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_migrations' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert!(table_names.contains(&"users"));
        assert!(table_names.contains(&"teams"));
        assert!(table_names.contains(&"user_team_membership"));
        assert!(table_names.contains(&"super_managers"));
        assert!(table_names.contains(&"gateway_editors"));
        assert!(table_names.contains(&"change_requests"));
        assert!(table_names.contains(&"cr_super_manager_review"));
        assert!(table_names.contains(&"cr_comments"));
        assert!(table_names.contains(&"cr_history"));
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        let _pool1 = initialize(&db_path).await.unwrap();
        let pool2 = initialize(&db_path).await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations")
            .fetch_one(&pool2)
            .await
            .unwrap();
        assert_eq!(count.0, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn test_store_runs_in_wal_with_foreign_keys() {
        let dir = tempdir().unwrap();
        let pool = initialize(&dir.path().join("test.db")).await.unwrap();

        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.0.to_lowercase(), "wal");

        // A comment on a CR that does not exist is refused by the store
        let orphan = sqlx::query(
            "INSERT INTO cr_comments (cr_id, user_id, comment_text, created_at) VALUES (42, 1, 'x', 0)",
        )
        .execute(&pool)
        .await;
        assert!(orphan.is_err());
    }

    #[tokio::test]
    async fn test_contending_writer_waits_for_lock() {
        let dir = tempdir().unwrap();
        let pool = initialize(&dir.path().join("test.db")).await.unwrap();

        let mut first = pool.begin().await.unwrap();
        sqlx::query("INSERT INTO teams (name) VALUES ('edge')")
            .execute(&mut *first)
            .await
            .unwrap();

        let contender = pool.clone();
        let second = tokio::spawn(async move {
            let mut tx = contender.begin().await?;
            sqlx::query("INSERT INTO teams (name) VALUES ('core')")
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        });

        // The second writer is blocked on the lock, not failed
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!second.is_finished());
        first.commit().await.unwrap();

        second.await.unwrap().unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM teams")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_parse_keeps_trigger_body_together() {
        let sql = r#"
            CREATE TABLE t (id INTEGER, ts INTEGER DEFAULT (strftime('%s', 'now')));
            -- comment line
            CREATE TRIGGER t_no_delete
            BEFORE DELETE ON t
            BEGIN
                SELECT RAISE(ABORT, 'nope');
            END;
            CREATE INDEX idx_t ON t(id)
        "#;

        let statements = parse_sql_statements(sql);
        assert_eq!(statements.len(), 3);
        assert!(statements[1].contains("SELECT RAISE(ABORT, 'nope');"));
        assert!(statements[1].ends_with("END"));
        assert!(statements[2].starts_with("CREATE INDEX"));
    }
}
