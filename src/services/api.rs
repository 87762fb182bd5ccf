//! REST API routes for the change request service.
//!
//! Handlers only translate between HTTP and the lifecycle engine, the
//! automation coordinator and the directory. No workflow rule lives here.

use crate::error::AppError;
use crate::models::{
    AuditEntry, ChangeRequest, ChangeRequestDetail, ChangeRequestFilter, Comment, Role, RoleGrant,
    Team, TeamDetail, User, UserProfile,
};
use crate::services::automation::{self, AutomationOutcome, CiStatus};
use crate::services::directory;
use crate::services::identity::Caller;
use crate::services::lifecycle::{ChangeRequestUpdate, NewChangeRequest};
use crate::services::server::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ── Error handling ───────────────────────────────────────────────────────────

/// JSON error body.
#[derive(Serialize)]
struct ApiError {
    code: String,
    message: String,
}

/// Wrapper to make AppError usable as an axum error response.
pub struct ApiErr(AppError);

impl ApiErr {
    fn status(&self) -> StatusCode {
        match &self.0 {
            AppError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::InvalidState { .. } | AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::InvalidValue { .. }
            | AppError::InvalidDecision { .. }
            | AppError::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
            AppError::Database { .. } | AppError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("[api] {}", self.0);
        }
        // Storage details stay in the log
        let message = match &self.0 {
            AppError::Database { .. } => "Internal error".to_string(),
            other => other.to_string(),
        };
        (
            status,
            Json(ApiError {
                code: self.0.kind().to_string(),
                message,
            }),
        )
            .into_response()
    }
}

impl From<AppError> for ApiErr {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

type ApiResult<T> = Result<T, ApiErr>;

// ── Request bodies ───────────────────────────────────────────────────────────

/// Accepts the payload either as a JSON object or as a string holding one.
fn payload_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

#[derive(Deserialize)]
struct CreateChangeRequestBody {
    requester_team_id: i64,
    title: String,
    #[serde(alias = "config_changes_payload")]
    config_changes: serde_json::Value,
}

#[derive(Deserialize)]
struct UpdateChangeRequestBody {
    title: Option<String>,
    #[serde(alias = "config_changes_payload")]
    config_changes: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ReviewBody {
    #[serde(alias = "review_decision")]
    decision: String,
}

#[derive(Deserialize)]
struct ExecutionStatusBody {
    execution_status: String,
}

#[derive(Deserialize)]
struct CommentBody {
    comment_text: String,
}

#[derive(Deserialize)]
struct UserIdBody {
    user_id: i64,
}

#[derive(Deserialize)]
struct CreateTeamBody {
    name: String,
}

#[derive(Deserialize)]
struct CreateUserBody {
    username: String,
    email: String,
}

/// Raw query parameters; each is parsed in the handler so a bad value is
/// reported as `INVALID_VALUE` naming the field.
#[derive(Deserialize)]
struct ListQuery {
    approval_status: Option<String>,
    execution_status: Option<String>,
    requester_team_id: Option<String>,
    requester_user_id: Option<String>,
    page: Option<String>,
}

/// Parse an optional query value. Empty values count as absent.
fn query_param<T: FromStr>(raw: Option<&str>, field: &str) -> Result<Option<T>, AppError> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| AppError::invalid_value_field(format!("Invalid {} '{}'", field, value), field)),
    }
}

impl ListQuery {
    fn page(&self) -> Result<i64, AppError> {
        Ok(query_param::<i64>(self.page.as_deref(), "page")?
            .unwrap_or(1)
            .max(1))
    }

    fn filter(&self) -> Result<ChangeRequestFilter, AppError> {
        Ok(ChangeRequestFilter {
            approval_status: query_param(self.approval_status.as_deref(), "approval_status")?,
            execution_status: query_param(self.execution_status.as_deref(), "execution_status")?,
            requester_team_id: query_param(self.requester_team_id.as_deref(), "requester_team_id")?,
            requester_user_id: query_param(self.requester_user_id.as_deref(), "requester_user_id")?,
        })
    }
}

#[derive(Serialize)]
struct ListResponse {
    page: i64,
    page_size: i64,
    change_requests: Vec<ChangeRequest>,
}

/// Map the admin path segment to a role.
fn role_from_path(segment: &str) -> Result<Role, AppError> {
    match segment {
        "super-managers" => Ok(Role::SuperManager),
        "gateway-editors" => Ok(Role::GatewayEditor),
        other => Err(AppError::not_found_with_id("Role", other)),
    }
}

// ── Routes ───────────────────────────────────────────────────────────────────

/// Routes that need an identified caller (identity middleware is applied in server.rs).
pub fn protected_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/change-requests",
            post(create_change_request).get(list_change_requests),
        )
        .route(
            "/api/v1/change-requests/{id}",
            get(get_change_request).put(update_change_request),
        )
        .route(
            "/api/v1/change-requests/{id}/comments",
            post(add_comment).get(list_comments),
        )
        .route("/api/v1/change-requests/{id}/history", get(get_history))
        .route("/api/v1/change-requests/{id}/review", post(review_change_request))
        .route(
            "/api/v1/change-requests/{id}/execution-status",
            put(update_execution_status),
        )
        .route(
            "/api/v1/automation/change-requests/{id}/trigger",
            post(trigger_automation),
        )
        .route("/api/v1/admin/{role}", post(grant_role).get(list_role_holders))
        .route("/api/v1/admin/{role}/{user_id}", delete(revoke_role))
        .route("/api/v1/teams", post(create_team).get(list_teams))
        .route("/api/v1/teams/my-teams", get(list_my_teams))
        .route("/api/v1/teams/{id}", get(get_team))
        .route("/api/v1/teams/{id}/members", post(add_team_member))
        .route(
            "/api/v1/teams/{id}/members/{user_id}",
            delete(remove_team_member),
        )
        .route("/api/v1/users", post(create_user).get(list_users))
        .route("/api/v1/users/me", get(get_current_user))
}

/// Routes open to unauthenticated callers.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/v1/automation/change-requests/{id}/status",
            get(get_ci_status),
        )
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /api/v1/change-requests
async fn create_change_request(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<CreateChangeRequestBody>,
) -> ApiResult<(StatusCode, Json<ChangeRequest>)> {
    let cr = state
        .engine
        .create(
            caller.user_id,
            NewChangeRequest {
                requester_team_id: body.requester_team_id,
                title: body.title,
                config_changes_payload: payload_text(body.config_changes),
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(cr)))
}

/// GET /api/v1/change-requests
async fn list_change_requests(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ListResponse>> {
    let page = query.page()?;
    let filter = query.filter()?;
    let change_requests = state.engine.list(&filter, page).await?;
    Ok(Json(ListResponse {
        page,
        page_size: crate::services::lifecycle::PAGE_SIZE,
        change_requests,
    }))
}

/// GET /api/v1/change-requests/{id}
async fn get_change_request(
    State(state): State<AppState>,
    Path(cr_id): Path<i64>,
) -> ApiResult<Json<ChangeRequestDetail>> {
    Ok(Json(state.engine.get(cr_id).await?))
}

/// PUT /api/v1/change-requests/{id}
async fn update_change_request(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(cr_id): Path<i64>,
    Json(body): Json<UpdateChangeRequestBody>,
) -> ApiResult<Json<ChangeRequest>> {
    let changes = ChangeRequestUpdate {
        title: body.title,
        config_changes_payload: body.config_changes.map(payload_text),
    };
    Ok(Json(state.engine.update(caller.user_id, cr_id, changes).await?))
}

/// POST /api/v1/change-requests/{id}/comments
async fn add_comment(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(cr_id): Path<i64>,
    Json(body): Json<CommentBody>,
) -> ApiResult<(StatusCode, Json<Comment>)> {
    let comment = state
        .engine
        .add_comment(caller.user_id, cr_id, &body.comment_text)
        .await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

/// GET /api/v1/change-requests/{id}/comments
async fn list_comments(
    State(state): State<AppState>,
    Path(cr_id): Path<i64>,
) -> ApiResult<Json<Vec<Comment>>> {
    Ok(Json(state.engine.list_comments(cr_id).await?))
}

/// GET /api/v1/change-requests/{id}/history
async fn get_history(
    State(state): State<AppState>,
    Path(cr_id): Path<i64>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    Ok(Json(state.engine.history(cr_id).await?))
}

/// POST /api/v1/change-requests/{id}/review
async fn review_change_request(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(cr_id): Path<i64>,
    Json(body): Json<ReviewBody>,
) -> ApiResult<Json<ChangeRequest>> {
    let cr = state
        .engine
        .record_review(caller.user_id, cr_id, &body.decision)
        .await?;
    Ok(Json(cr))
}

/// PUT /api/v1/change-requests/{id}/execution-status
async fn update_execution_status(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(cr_id): Path<i64>,
    Json(body): Json<ExecutionStatusBody>,
) -> ApiResult<Json<ChangeRequest>> {
    let cr = state
        .engine
        .update_execution_status(caller.user_id, cr_id, &body.execution_status)
        .await?;
    Ok(Json(cr))
}

/// GET /api/v1/automation/change-requests/{id}/status
async fn get_ci_status(
    State(state): State<AppState>,
    Path(cr_id): Path<i64>,
) -> ApiResult<Json<CiStatus>> {
    Ok(Json(automation::ci_status(state.engine.pool(), cr_id).await?))
}

/// POST /api/v1/automation/change-requests/{id}/trigger
async fn trigger_automation(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(cr_id): Path<i64>,
) -> ApiResult<Json<AutomationOutcome>> {
    log::info!("[api] User {} triggered automation for CR {}", caller.user_id, cr_id);
    Ok(Json(state.engine.automation().process_now(cr_id).await?))
}

/// POST /api/v1/admin/{role}
async fn grant_role(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(role): Path<String>,
    Json(body): Json<UserIdBody>,
) -> ApiResult<(StatusCode, Json<RoleGrant>)> {
    let role = role_from_path(&role)?;
    let grant =
        directory::grant_role(state.engine.pool(), caller.user_id, body.user_id, role).await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

/// GET /api/v1/admin/{role}
async fn list_role_holders(
    State(state): State<AppState>,
    Path(role): Path<String>,
) -> ApiResult<Json<Vec<RoleGrant>>> {
    let role = role_from_path(&role)?;
    Ok(Json(directory::list_role_holders(state.engine.pool(), role).await?))
}

/// DELETE /api/v1/admin/{role}/{user_id}
async fn revoke_role(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((role, user_id)): Path<(String, i64)>,
) -> ApiResult<StatusCode> {
    let role = role_from_path(&role)?;
    directory::revoke_role(state.engine.pool(), caller.user_id, user_id, role).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/teams
async fn create_team(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<CreateTeamBody>,
) -> ApiResult<(StatusCode, Json<Team>)> {
    let team = directory::add_team(state.engine.pool(), caller.user_id, &body.name).await?;
    Ok((StatusCode::CREATED, Json(team)))
}

/// GET /api/v1/teams
async fn list_teams(State(state): State<AppState>) -> ApiResult<Json<Vec<Team>>> {
    Ok(Json(directory::list_teams(state.engine.pool()).await?))
}

/// GET /api/v1/teams/my-teams
async fn list_my_teams(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Json<Vec<Team>>> {
    Ok(Json(
        directory::list_user_teams(state.engine.pool(), caller.user_id).await?,
    ))
}

/// GET /api/v1/teams/{id}
async fn get_team(
    State(state): State<AppState>,
    Path(team_id): Path<i64>,
) -> ApiResult<Json<TeamDetail>> {
    Ok(Json(directory::get_team(state.engine.pool(), team_id).await?))
}

/// POST /api/v1/teams/{id}/members
async fn add_team_member(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(team_id): Path<i64>,
    Json(body): Json<UserIdBody>,
) -> ApiResult<StatusCode> {
    directory::add_member(state.engine.pool(), caller.user_id, team_id, body.user_id).await?;
    Ok(StatusCode::CREATED)
}

/// DELETE /api/v1/teams/{id}/members/{user_id}
async fn remove_team_member(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((team_id, user_id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    directory::remove_member(state.engine.pool(), caller.user_id, team_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/users
async fn create_user(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<CreateUserBody>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let user =
        directory::add_user(state.engine.pool(), caller.user_id, &body.username, &body.email)
            .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// GET /api/v1/users
async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(directory::list_users(state.engine.pool()).await?))
}

/// GET /api/v1/users/me
async fn get_current_user(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Json<UserProfile>> {
    Ok(Json(directory::get_user(state.engine.pool(), caller.user_id).await?))
}
