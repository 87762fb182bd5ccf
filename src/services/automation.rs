//! Automation coordinator for approved change requests.
//!
//! When a CR reaches `APPROVED` + `DRAFT` the coordinator moves execution to
//! `IN_PROGRESS` on behalf of the system actor and notifies the CI/CD webhook.
//!
//! The coordinator runs as a background worker fed by a bounded queue. The
//! lifecycle engine enqueues a CR only after its review transaction has
//! committed, and the worker reloads the CR before acting since other changes
//! may have landed in between. Processing the same CR twice is a no-op the
//! second time.

use crate::db::now;
use crate::db::DbPool;
use crate::error::AppError;
use crate::models::{ApprovalStatus, ExecutionStatus, SYSTEM_ACTOR_ID};
use crate::services::audit_log::{self, NewAuditEntry};
use crate::services::lifecycle;
use crate::services::webhook::{WebhookConfig, WebhookNotifier, WebhookPayload};
use serde::Serialize;
use sqlx::FromRow;
use tokio::sync::{mpsc, oneshot};

/// Default capacity of the automation queue.
pub const DEFAULT_QUEUE_SIZE: usize = 64;

/// Automation coordinator configuration.
#[derive(Debug, Clone)]
pub struct AutomationConfig {
    /// CI/CD webhook settings.
    pub webhook: WebhookConfig,

    /// Maximum number of queued commands before enqueue fails.
    pub queue_size: usize,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            webhook: WebhookConfig::default(),
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

/// Result of processing one CR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AutomationOutcome {
    /// Execution moved `DRAFT` → `IN_PROGRESS`.
    Transitioned { webhook_dispatched: bool },

    /// CR was not `APPROVED` + `DRAFT`; nothing changed.
    Skipped {
        approval_status: String,
        execution_status: String,
    },
}

/// CR status as exposed to CI/CD pipelines.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CiStatus {
    pub cr_id: i64,
    pub title: String,
    pub approval_status: String,
    pub execution_status: String,

    /// Approved and still in `DRAFT`.
    pub can_execute: bool,

    pub config_changes: String,

    /// Requester team name.
    pub requester_team: String,

    pub created_at: i64,
}

/// Commands accepted by the automation worker.
#[derive(Debug)]
pub enum AutomationCommand {
    /// Process a CR; the result is only logged.
    Process(i64),

    /// Process a CR and report the outcome.
    ProcessNow(i64, oneshot::Sender<Result<AutomationOutcome, AppError>>),

    /// Reply once every earlier command has been handled.
    Flush(oneshot::Sender<()>),

    /// Stop the worker.
    Stop,
}

/// Lightweight handle for sending work to the automation worker.
#[derive(Clone)]
pub struct AutomationHandle {
    command_tx: mpsc::Sender<AutomationCommand>,
}

impl AutomationHandle {
    /// Queue a CR without waiting. Fails if the queue is full or the worker stopped.
    pub fn enqueue(&self, cr_id: i64) -> Result<(), AppError> {
        self.command_tx
            .try_send(AutomationCommand::Process(cr_id))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    AppError::internal("Automation queue is full")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    AppError::internal("Automation coordinator not running")
                }
            })
    }

    /// Process a CR through the worker and wait for the outcome.
    pub async fn process_now(&self, cr_id: i64) -> Result<AutomationOutcome, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(AutomationCommand::ProcessNow(cr_id, reply_tx))
            .await
            .map_err(|_| AppError::internal("Automation coordinator not running"))?;

        reply_rx
            .await
            .map_err(|_| AppError::internal("Automation coordinator dropped the request"))?
    }

    /// Wait until everything queued before this call has been processed.
    pub async fn flush(&self) -> Result<(), AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(AutomationCommand::Flush(reply_tx))
            .await
            .map_err(|_| AppError::internal("Automation coordinator not running"))?;

        reply_rx
            .await
            .map_err(|_| AppError::internal("Automation coordinator stopped"))
    }

    /// Stop the worker after the commands already queued.
    pub async fn stop(&self) {
        let _ = self.command_tx.send(AutomationCommand::Stop).await;
    }
}

/// Moves approved CRs into execution and notifies CI/CD.
#[derive(Clone)]
pub struct AutomationCoordinator {
    pool: DbPool,
    notifier: Option<WebhookNotifier>,
}

impl AutomationCoordinator {
    /// Create a coordinator. The webhook is disabled when its URL is empty.
    pub fn new(pool: DbPool, webhook: WebhookConfig) -> Result<Self, AppError> {
        let notifier = WebhookNotifier::new(webhook)?;
        match &notifier {
            Some(n) => log::info!("[automation] CI/CD webhook enabled: {}", n.url()),
            None => log::info!("[automation] CI/CD webhook not configured"),
        }
        Ok(Self { pool, notifier })
    }

    /// Start the background worker.
    ///
    /// The worker owns the coordinator and handles commands one at a time in
    /// arrival order. It exits on `Stop` or when every handle is dropped.
    pub fn start(self, queue_size: usize) -> AutomationHandle {
        let (tx, mut rx) = mpsc::channel::<AutomationCommand>(queue_size.max(1));

        tokio::spawn(async move {
            log::info!("[automation] Worker started");
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    AutomationCommand::Process(cr_id) => {
                        if let Err(e) = self.process_approved_cr(cr_id).await {
                            log::error!("[automation] Processing CR {} failed: {}", cr_id, e);
                        }
                    }
                    AutomationCommand::ProcessNow(cr_id, reply) => {
                        let result = self.process_approved_cr(cr_id).await;
                        let _ = reply.send(result);
                    }
                    AutomationCommand::Flush(reply) => {
                        let _ = reply.send(());
                    }
                    AutomationCommand::Stop => {
                        log::info!("[automation] Worker stopping");
                        break;
                    }
                }
            }
            log::info!("[automation] Worker stopped");
        });

        AutomationHandle { command_tx: tx }
    }

    /// Move an approved, not-yet-started CR into `IN_PROGRESS`.
    ///
    /// Reloads the CR and returns `Skipped` unless it is `APPROVED` + `DRAFT`.
    /// The status update and its audit entry commit together; the webhook is
    /// dispatched only after that commit and never affects the result.
    pub async fn process_approved_cr(&self, cr_id: i64) -> Result<AutomationOutcome, AppError> {
        let cr = lifecycle::load_change_request(&self.pool, cr_id).await?;

        if !cr.can_execute() {
            log::debug!(
                "[automation] CR {} not eligible ({} / {})",
                cr_id,
                cr.approval_status,
                cr.execution_status
            );
            return Ok(AutomationOutcome::Skipped {
                approval_status: cr.approval_status,
                execution_status: cr.execution_status,
            });
        }

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE change_requests
            SET execution_status = ?
            WHERE cr_id = ? AND approval_status = ? AND execution_status = ?
            "#,
        )
        .bind(ExecutionStatus::InProgress.as_str())
        .bind(cr_id)
        .bind(ApprovalStatus::APPROVED.as_str())
        .bind(ExecutionStatus::Draft.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Another run or an editor got there first
            tx.rollback().await?;
            let current = lifecycle::load_change_request(&self.pool, cr_id).await?;
            return Ok(AutomationOutcome::Skipped {
                approval_status: current.approval_status,
                execution_status: current.execution_status,
            });
        }

        audit_log::append(
            &mut tx,
            &NewAuditEntry::status_change(
                cr_id,
                SYSTEM_ACTOR_ID,
                ExecutionStatus::Draft.as_str(),
                ExecutionStatus::InProgress.as_str(),
            ),
        )
        .await?;

        tx.commit().await?;
        log::info!("[automation] CR {} transitioned to IN_PROGRESS", cr_id);

        let webhook_dispatched = match &self.notifier {
            Some(notifier) => {
                let mut started = cr;
                started.execution_status = ExecutionStatus::InProgress.as_str().to_string();
                notifier.dispatch(WebhookPayload::from_change_request(&started, now()));
                true
            }
            None => false,
        };

        Ok(AutomationOutcome::Transitioned { webhook_dispatched })
    }
}

/// CI/CD view of a CR. Pure read.
pub async fn ci_status(pool: &DbPool, cr_id: i64) -> Result<CiStatus, AppError> {
    sqlx::query_as::<_, CiStatus>(
        r#"
        SELECT
            cr.cr_id, cr.title, cr.approval_status, cr.execution_status,
            (cr.approval_status = 'APPROVED' AND cr.execution_status = 'DRAFT') AS can_execute,
            cr.config_changes_payload AS config_changes,
            t.name AS requester_team,
            cr.created_at
        FROM change_requests cr
        JOIN teams t ON t.team_id = cr.requester_team_id
        WHERE cr.cr_id = ?
        "#,
    )
    .bind(cr_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::not_found_with_id("ChangeRequest", cr_id))
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

        sqlx::query("INSERT INTO users (user_id, username, email) VALUES (1, 'alice', 'alice@example.com')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO teams (team_id, name) VALUES (1, 'edge')")
            .execute(&pool)
            .await
            .unwrap();

        pool
    }

    async fn insert_cr(pool: &DbPool, cr_id: i64, approval: &str, execution: &str) {
        sqlx::query(
            r#"INSERT INTO change_requests
            (cr_id, requester_user_id, requester_team_id, title, config_changes_payload, created_at, approval_status, execution_status)
            VALUES (?, 1, 1, 'bump timeout', '{"timeout":30}', 0, ?, ?)"#,
        )
        .bind(cr_id)
        .bind(approval)
        .bind(execution)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_transitions_approved_draft() {
        let pool = setup_test_db().await;
        insert_cr(&pool, 1, "APPROVED", "DRAFT").await;

        let coordinator = AutomationCoordinator::new(pool.clone(), WebhookConfig::default()).unwrap();
        let outcome = coordinator.process_approved_cr(1).await.unwrap();
        assert_eq!(
            outcome,
            AutomationOutcome::Transitioned {
                webhook_dispatched: false
            }
        );

        let cr = lifecycle::load_change_request(&pool, 1).await.unwrap();
        assert_eq!(cr.execution_status, "IN_PROGRESS");

        let history = audit_log::history_for(&pool, 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_system());
        assert_eq!(history[0].old_status.as_deref(), Some("DRAFT"));
        assert_eq!(history[0].new_status, "IN_PROGRESS");
    }

    #[tokio::test]
    async fn test_skips_pending_without_error() {
        let pool = setup_test_db().await;
        insert_cr(&pool, 1, "PENDING_APPROVAL", "DRAFT").await;

        let coordinator = AutomationCoordinator::new(pool.clone(), WebhookConfig::default()).unwrap();
        let outcome = coordinator.process_approved_cr(1).await.unwrap();
        assert!(matches!(outcome, AutomationOutcome::Skipped { .. }));
        assert!(audit_log::history_for(&pool, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_cr_is_not_found() {
        let pool = setup_test_db().await;
        let coordinator = AutomationCoordinator::new(pool, WebhookConfig::default()).unwrap();
        let err = coordinator.process_approved_cr(99).await.unwrap_err();
        assert_eq!(err.kind(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let pool = setup_test_db().await;
        insert_cr(&pool, 1, "APPROVED", "DRAFT").await;

        let coordinator = AutomationCoordinator::new(pool.clone(), WebhookConfig::default()).unwrap();
        coordinator.process_approved_cr(1).await.unwrap();
        let second = coordinator.process_approved_cr(1).await.unwrap();

        assert_eq!(
            second,
            AutomationOutcome::Skipped {
                approval_status: "APPROVED".to_string(),
                execution_status: "IN_PROGRESS".to_string(),
            }
        );
        assert_eq!(audit_log::history_for(&pool, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_processes_queue_in_order() {
        let pool = setup_test_db().await;
        insert_cr(&pool, 1, "APPROVED", "DRAFT").await;
        insert_cr(&pool, 2, "APPROVED", "DRAFT").await;

        let handle = AutomationCoordinator::new(pool.clone(), WebhookConfig::default())
            .unwrap()
            .start(DEFAULT_QUEUE_SIZE);

        handle.enqueue(1).unwrap();
        handle.enqueue(2).unwrap();
        handle.flush().await.unwrap();

        for id in [1, 2] {
            let cr = lifecycle::load_change_request(&pool, id).await.unwrap();
            assert_eq!(cr.execution_status, "IN_PROGRESS");
        }

        let again = handle.process_now(1).await.unwrap();
        assert!(matches!(again, AutomationOutcome::Skipped { .. }));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_worker_rejects_work() {
        let pool = setup_test_db().await;
        let handle = AutomationCoordinator::new(pool, WebhookConfig::default())
            .unwrap()
            .start(4);

        handle.stop().await;
        // Give the worker a moment to drop its receiver
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(handle.process_now(1).await.is_err());
    }

    #[tokio::test]
    async fn test_ci_status_projection() {
        let pool = setup_test_db().await;
        insert_cr(&pool, 1, "APPROVED", "DRAFT").await;

        let status = ci_status(&pool, 1).await.unwrap();
        assert!(status.can_execute);
        assert_eq!(status.requester_team, "edge");
        assert_eq!(status.config_changes, r#"{"timeout":30}"#);

        let coordinator = AutomationCoordinator::new(pool.clone(), WebhookConfig::default()).unwrap();
        coordinator.process_approved_cr(1).await.unwrap();
        assert!(!ci_status(&pool, 1).await.unwrap().can_execute);

        assert_eq!(ci_status(&pool, 2).await.unwrap_err().kind(), "NOT_FOUND");
    }
}
