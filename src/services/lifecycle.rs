//! Change request lifecycle engine.
//!
//! Owns the approval and execution state machines. Every operation validates
//! the caller and the current state before writing, then applies the CR row
//! change and its audit entry in one transaction. Status writes are
//! conditional on the status that was validated, so a concurrent writer that
//! got there first turns the loser into `InvalidState` instead of a lost update.

use crate::db::now;
use crate::db::DbPool;
use crate::error::AppError;
use crate::models::{
    ApprovalStatus, AuditEntry, ChangeRequest, ChangeRequestDetail, ChangeRequestFilter, Comment,
    ExecutionStatus, Review, ReviewDecision,
};
use crate::services::audit_log::{self, NewAuditEntry};
use crate::services::automation::AutomationHandle;
use crate::services::directory;
use crate::services::gates;
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite};

/// Change requests returned per page by [`LifecycleEngine::list`].
pub const PAGE_SIZE: i64 = 20;

const CR_COLUMNS: &str = "cr_id, requester_user_id, requester_team_id, title, \
    config_changes_payload, created_at, approval_status, execution_status";

/// Input for creating a change request.
#[derive(Debug, Clone, Deserialize)]
pub struct NewChangeRequest {
    pub requester_team_id: i64,
    pub title: String,

    /// Serialized JSON object.
    pub config_changes_payload: String,
}

/// Partial edit of a change request. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeRequestUpdate {
    pub title: Option<String>,
    pub config_changes_payload: Option<String>,
}

/// Load a change request or fail with `NotFound`.
pub async fn load_change_request(pool: &DbPool, cr_id: i64) -> Result<ChangeRequest, AppError> {
    let sql = format!("SELECT {} FROM change_requests WHERE cr_id = ?", CR_COLUMNS);
    sqlx::query_as::<_, ChangeRequest>(&sql)
        .bind(cr_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("ChangeRequest", cr_id))
}

fn validate_title(title: &str) -> Result<&str, AppError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(AppError::invalid_value_field("Title must not be empty", "title"));
    }
    Ok(title)
}

/// The payload is opaque but must be a JSON object.
fn validate_payload(payload: &str) -> Result<(), AppError> {
    serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(payload)
        .map(|_| ())
        .map_err(|e| {
            AppError::invalid_payload(format!("config_changes_payload must be a JSON object: {}", e))
        })
}

/// Coordinates every state-changing operation on change requests.
#[derive(Clone)]
pub struct LifecycleEngine {
    pool: DbPool,
    automation: AutomationHandle,
}

impl LifecycleEngine {
    pub fn new(pool: DbPool, automation: AutomationHandle) -> Self {
        Self { pool, automation }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn automation(&self) -> &AutomationHandle {
        &self.automation
    }

    /// Create a CR in `PENDING_APPROVAL` / `DRAFT`.
    ///
    /// The requester must belong to the team the CR is raised for.
    pub async fn create(
        &self,
        requester_user_id: i64,
        input: NewChangeRequest,
    ) -> Result<ChangeRequest, AppError> {
        if !gates::is_member(&self.pool, requester_user_id, input.requester_team_id).await? {
            return Err(AppError::unauthorized(format!(
                "User {} is not a member of team {}",
                requester_user_id, input.requester_team_id
            )));
        }
        let title = validate_title(&input.title)?;
        validate_payload(&input.config_changes_payload)?;

        let initial_approval = ApprovalStatus::Pending;
        let mut tx = self.pool.begin().await?;

        let cr_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO change_requests
                (requester_user_id, requester_team_id, title, config_changes_payload,
                 created_at, approval_status, execution_status)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING cr_id
            "#,
        )
        .bind(requester_user_id)
        .bind(input.requester_team_id)
        .bind(title)
        .bind(&input.config_changes_payload)
        .bind(now())
        .bind(initial_approval.as_str())
        .bind(ExecutionStatus::Draft.as_str())
        .fetch_one(&mut *tx)
        .await?;

        audit_log::append(
            &mut tx,
            &NewAuditEntry::created(cr_id, requester_user_id, initial_approval.as_str()),
        )
        .await?;

        tx.commit().await?;
        log::info!(
            "[engine] CR {} created by user {} for team {}",
            cr_id,
            requester_user_id,
            input.requester_team_id
        );

        load_change_request(&self.pool, cr_id).await
    }

    /// Edit title and/or payload. Only the requester may edit, and only
    /// before the CR is approved.
    pub async fn update(
        &self,
        caller_id: i64,
        cr_id: i64,
        changes: ChangeRequestUpdate,
    ) -> Result<ChangeRequest, AppError> {
        let cr = load_change_request(&self.pool, cr_id).await?;

        if cr.requester_user_id != caller_id {
            return Err(AppError::forbidden("Only the requester can edit a change request"));
        }
        if cr.approval()?.is_approved() {
            return Err(AppError::invalid_state_at(
                "Cannot edit an approved change request",
                cr.approval_status,
            ));
        }

        let title = changes.title.as_deref().map(validate_title).transpose()?;
        if let Some(payload) = &changes.config_changes_payload {
            validate_payload(payload)?;
        }

        let mut tx = self.pool.begin().await?;

        // Re-checked in the write so an approval landing in between wins
        let approval_status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE change_requests
            SET title = COALESCE(?, title),
                config_changes_payload = COALESCE(?, config_changes_payload)
            WHERE cr_id = ? AND approval_status != ?
            RETURNING approval_status
            "#,
        )
        .bind(title)
        .bind(changes.config_changes_payload.as_deref())
        .bind(cr_id)
        .bind(ApprovalStatus::APPROVED.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(approval_status) = approval_status else {
            tx.rollback().await?;
            return Err(AppError::invalid_state_at(
                "Cannot edit an approved change request",
                ApprovalStatus::APPROVED.as_str(),
            ));
        };

        audit_log::append(&mut tx, &NewAuditEntry::updated(cr_id, caller_id, approval_status))
            .await?;

        tx.commit().await?;
        log::info!("[engine] CR {} updated by user {}", cr_id, caller_id);

        load_change_request(&self.pool, cr_id).await
    }

    /// Record a Super Manager's decision on a pending CR.
    ///
    /// An approval is handed to the automation coordinator after commit.
    /// Enqueue failures are logged; the review stands either way.
    pub async fn record_review(
        &self,
        reviewer_id: i64,
        cr_id: i64,
        decision: &str,
    ) -> Result<ChangeRequest, AppError> {
        gates::require_reviewer(&self.pool, reviewer_id).await?;

        let cr = load_change_request(&self.pool, cr_id).await?;
        if !cr.approval()?.accepts_review() {
            return Err(AppError::invalid_state_at(
                "Change request has already been reviewed",
                cr.approval_status,
            ));
        }

        let decision: ReviewDecision = decision.parse()?;
        let new_status = ApprovalStatus::from(decision);
        let reviewed_at = now();

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE change_requests SET approval_status = ? WHERE cr_id = ? AND approval_status = ?",
        )
        .bind(new_status.as_str())
        .bind(cr_id)
        .bind(ApprovalStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AppError::invalid_state(
                "Change request was reviewed concurrently",
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO cr_super_manager_review (cr_id, sm_user_id, review_decision, reviewed_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(cr_id)
        .bind(reviewer_id)
        .bind(decision.as_str())
        .bind(reviewed_at)
        .execute(&mut *tx)
        .await?;

        audit_log::append(
            &mut tx,
            &NewAuditEntry::status_change(
                cr_id,
                reviewer_id,
                ApprovalStatus::Pending.as_str(),
                new_status.as_str(),
            ),
        )
        .await?;

        tx.commit().await?;
        log::info!(
            "[engine] CR {} {} by super manager {}",
            cr_id,
            decision,
            reviewer_id
        );

        if new_status.is_approved() {
            if let Err(e) = self.automation.enqueue(cr_id) {
                log::warn!("[engine] Failed to enqueue CR {} for automation: {}", cr_id, e);
            }
        }

        load_change_request(&self.pool, cr_id).await
    }

    /// Move the execution status of an approved CR.
    ///
    /// Any of the four execution values may follow any other once approved.
    pub async fn update_execution_status(
        &self,
        caller_id: i64,
        cr_id: i64,
        new_status: &str,
    ) -> Result<ChangeRequest, AppError> {
        let cr = load_change_request(&self.pool, cr_id).await?;

        if !cr.approval()?.is_approved() {
            return Err(AppError::invalid_state_at(
                "Execution status can only change after approval",
                cr.approval_status,
            ));
        }
        gates::require_executor(&self.pool, caller_id).await?;
        let new_status: ExecutionStatus = new_status.parse()?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE change_requests
            SET execution_status = ?
            WHERE cr_id = ? AND approval_status = ? AND execution_status = ?
            "#,
        )
        .bind(new_status.as_str())
        .bind(cr_id)
        .bind(ApprovalStatus::APPROVED.as_str())
        .bind(&cr.execution_status)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AppError::invalid_state(
                "Execution status changed concurrently",
            ));
        }

        audit_log::append(
            &mut tx,
            &NewAuditEntry::status_change(cr_id, caller_id, &cr.execution_status, new_status.as_str()),
        )
        .await?;

        tx.commit().await?;
        log::info!(
            "[engine] CR {} execution {} -> {} by user {}",
            cr_id,
            cr.execution_status,
            new_status,
            caller_id
        );

        load_change_request(&self.pool, cr_id).await
    }

    /// Append a comment to a CR.
    pub async fn add_comment(
        &self,
        caller_id: i64,
        cr_id: i64,
        text: &str,
    ) -> Result<Comment, AppError> {
        load_change_request(&self.pool, cr_id).await?;
        directory::find_user(&self.pool, caller_id).await?;

        if text.trim().is_empty() {
            return Err(AppError::invalid_value_field(
                "Comment text must not be empty",
                "comment_text",
            ));
        }

        let mut tx = self.pool.begin().await?;

        let comment = sqlx::query_as::<_, Comment>(
            r#"
            INSERT INTO cr_comments (cr_id, user_id, comment_text, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING comment_id, cr_id, user_id, comment_text, created_at
            "#,
        )
        .bind(cr_id)
        .bind(caller_id)
        .bind(text)
        .bind(now())
        .fetch_one(&mut *tx)
        .await?;

        audit_log::append(&mut tx, &NewAuditEntry::comment_added(cr_id, caller_id)).await?;

        tx.commit().await?;
        log::debug!("[engine] Comment {} added to CR {}", comment.comment_id, cr_id);

        Ok(comment)
    }

    /// List CRs newest first, [`PAGE_SIZE`] per page. Pages below 1 are treated as 1.
    pub async fn list(
        &self,
        filter: &ChangeRequestFilter,
        page: i64,
    ) -> Result<Vec<ChangeRequest>, AppError> {
        let offset = (page.max(1) - 1).saturating_mul(PAGE_SIZE);

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM change_requests WHERE 1 = 1",
            CR_COLUMNS
        ));
        if let Some(status) = filter.approval_status {
            qb.push(" AND approval_status = ").push_bind(status.as_str());
        }
        if let Some(status) = filter.execution_status {
            qb.push(" AND execution_status = ").push_bind(status.as_str());
        }
        if let Some(team_id) = filter.requester_team_id {
            qb.push(" AND requester_team_id = ").push_bind(team_id);
        }
        if let Some(user_id) = filter.requester_user_id {
            qb.push(" AND requester_user_id = ").push_bind(user_id);
        }
        qb.push(" ORDER BY created_at DESC, cr_id DESC LIMIT ")
            .push_bind(PAGE_SIZE)
            .push(" OFFSET ")
            .push_bind(offset);

        let crs = qb
            .build_query_as::<ChangeRequest>()
            .fetch_all(&self.pool)
            .await?;

        Ok(crs)
    }

    /// A CR with its reviews, comments and audit history.
    pub async fn get(&self, cr_id: i64) -> Result<ChangeRequestDetail, AppError> {
        let change_request = load_change_request(&self.pool, cr_id).await?;

        let reviews = sqlx::query_as::<_, Review>(
            r#"
            SELECT review_id, cr_id, sm_user_id, review_decision, reviewed_at
            FROM cr_super_manager_review
            WHERE cr_id = ?
            ORDER BY reviewed_at ASC, review_id ASC
            "#,
        )
        .bind(cr_id)
        .fetch_all(&self.pool)
        .await?;

        let comments = self.fetch_comments(cr_id).await?;
        let history = audit_log::history_for(&self.pool, cr_id).await?;

        Ok(ChangeRequestDetail {
            change_request,
            reviews,
            comments,
            history,
        })
    }

    /// Comments on a CR in creation order.
    pub async fn list_comments(&self, cr_id: i64) -> Result<Vec<Comment>, AppError> {
        load_change_request(&self.pool, cr_id).await?;
        self.fetch_comments(cr_id).await
    }

    /// Audit history of a CR, oldest first.
    pub async fn history(&self, cr_id: i64) -> Result<Vec<AuditEntry>, AppError> {
        load_change_request(&self.pool, cr_id).await?;
        audit_log::history_for(&self.pool, cr_id).await
    }

    async fn fetch_comments(&self, cr_id: i64) -> Result<Vec<Comment>, AppError> {
        let comments = sqlx::query_as::<_, Comment>(
            r#"
            SELECT comment_id, cr_id, user_id, comment_text, created_at
            FROM cr_comments
            WHERE cr_id = ?
            ORDER BY created_at ASC, comment_id ASC
            "#,
        )
        .bind(cr_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(comments)
    }
}
