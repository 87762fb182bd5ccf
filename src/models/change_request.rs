//! Change request model and its two status machines.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use super::{AuditEntry, Comment, Review};

/// Outcome of a single Super Manager review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

impl ReviewDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl FromStr for ReviewDecision {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(AppError::invalid_decision(format!(
                "'{}' is not a review decision. Must be APPROVED or REJECTED",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Approval status of a change request.
///
/// Terminal decisions are grouped under `Decided` so code that only cares
/// whether a CR has left review matches one arm. `NeedsRework` is stored and
/// parsed but no transition currently produces or consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ApprovalStatus {
    Pending,
    Decided(ReviewDecision),
    NeedsRework,
}

impl ApprovalStatus {
    pub const APPROVED: Self = Self::Decided(ReviewDecision::Approved);
    pub const REJECTED: Self = Self::Decided(ReviewDecision::Rejected);

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING_APPROVAL",
            Self::Decided(decision) => decision.as_str(),
            Self::NeedsRework => "NEEDS_REWORK",
        }
    }

    pub fn is_approved(&self) -> bool {
        *self == Self::APPROVED
    }

    /// Whether a review may still be recorded.
    pub fn accepts_review(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl From<ReviewDecision> for ApprovalStatus {
    fn from(decision: ReviewDecision) -> Self {
        Self::Decided(decision)
    }
}

impl FromStr for ApprovalStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_APPROVAL" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::APPROVED),
            "REJECTED" => Ok(Self::REJECTED),
            "NEEDS_REWORK" => Ok(Self::NeedsRework),
            other => Err(AppError::invalid_value_field(
                format!("'{}' is not an approval status", other),
                "approval_status",
            )),
        }
    }
}

impl TryFrom<String> for ApprovalStatus {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ApprovalStatus> for String {
    fn from(status: ApprovalStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational rollout status, gated by approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Draft,
    InProgress,
    Completed,
    Canceled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Canceled => "CANCELED",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(AppError::invalid_value_field(
                format!("'{}' is not an execution status", other),
                "execution_status",
            )),
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configuration change request as stored in `change_requests`.
///
/// Statuses are stored as their wire strings; use [`ChangeRequest::approval`]
/// and [`ChangeRequest::execution`] for the typed view.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChangeRequest {
    pub cr_id: i64,
    pub requester_user_id: i64,
    pub requester_team_id: i64,
    pub title: String,

    /// Opaque JSON object describing the gateway configuration change.
    pub config_changes_payload: String,

    /// Creation timestamp (Unix).
    pub created_at: i64,

    pub approval_status: String,
    pub execution_status: String,
}

impl ChangeRequest {
    /// Typed approval status.
    pub fn approval(&self) -> Result<ApprovalStatus, AppError> {
        self.approval_status.parse()
    }

    /// Typed execution status.
    pub fn execution(&self) -> Result<ExecutionStatus, AppError> {
        self.execution_status.parse()
    }

    /// Ready for the automated hand-off: approved and not yet started.
    pub fn can_execute(&self) -> bool {
        matches!(
            (self.approval(), self.execution()),
            (Ok(ApprovalStatus::APPROVED), Ok(ExecutionStatus::Draft))
        )
    }

    /// Execution may only leave `DRAFT` once approved.
    pub fn satisfies_execution_gate(&self) -> bool {
        match self.execution() {
            Ok(ExecutionStatus::Draft) => true,
            Ok(_) => self.approval().map(|a| a.is_approved()).unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// A change request with its reviews, comments and audit history.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRequestDetail {
    #[serde(flatten)]
    pub change_request: ChangeRequest,
    pub reviews: Vec<Review>,
    pub comments: Vec<Comment>,
    pub history: Vec<AuditEntry>,
}

/// Filters for listing change requests. `None` means "any".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeRequestFilter {
    pub approval_status: Option<ApprovalStatus>,
    pub execution_status: Option<ExecutionStatus>,
    pub requester_team_id: Option<i64>,
    pub requester_user_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(approval: &str, execution: &str) -> ChangeRequest {
        ChangeRequest {
            cr_id: 1,
            requester_user_id: 1,
            requester_team_id: 1,
            title: "bump timeout".to_string(),
            config_changes_payload: r#"{"timeout":30}"#.to_string(),
            created_at: 0,
            approval_status: approval.to_string(),
            execution_status: execution.to_string(),
        }
    }

    #[test]
    fn test_approval_status_round_trips_wire_strings() {
        for s in ["PENDING_APPROVAL", "APPROVED", "REJECTED", "NEEDS_REWORK"] {
            let status: ApprovalStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert!("approved".parse::<ApprovalStatus>().is_err());
    }

    #[test]
    fn test_approval_status_serde_uses_wire_strings() {
        let json = serde_json::to_string(&ApprovalStatus::APPROVED).unwrap();
        assert_eq!(json, "\"APPROVED\"");

        let status: ApprovalStatus = serde_json::from_str("\"PENDING_APPROVAL\"").unwrap();
        assert_eq!(status, ApprovalStatus::Pending);

        assert!(serde_json::from_str::<ApprovalStatus>("\"MAYBE\"").is_err());
    }

    #[test]
    fn test_review_decision_rejects_other_values() {
        assert_eq!(
            "APPROVED".parse::<ReviewDecision>().unwrap(),
            ReviewDecision::Approved
        );
        let err = "NEEDS_REWORK".parse::<ReviewDecision>().unwrap_err();
        assert_eq!(err.kind(), "INVALID_DECISION");
    }

    #[test]
    fn test_execution_status_parse() {
        assert_eq!(
            "IN_PROGRESS".parse::<ExecutionStatus>().unwrap(),
            ExecutionStatus::InProgress
        );
        let err = "DONE".parse::<ExecutionStatus>().unwrap_err();
        assert_eq!(err.kind(), "INVALID_VALUE");
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Canceled).unwrap(),
            "\"CANCELED\""
        );
    }

    #[test]
    fn test_only_pending_accepts_review() {
        assert!(ApprovalStatus::Pending.accepts_review());
        assert!(!ApprovalStatus::APPROVED.accepts_review());
        assert!(!ApprovalStatus::REJECTED.accepts_review());
        assert!(!ApprovalStatus::NeedsRework.accepts_review());
    }

    #[test]
    fn test_can_execute_and_execution_gate() {
        assert!(sample("APPROVED", "DRAFT").can_execute());
        assert!(!sample("APPROVED", "IN_PROGRESS").can_execute());
        assert!(!sample("PENDING_APPROVAL", "DRAFT").can_execute());

        assert!(sample("PENDING_APPROVAL", "DRAFT").satisfies_execution_gate());
        assert!(sample("APPROVED", "COMPLETED").satisfies_execution_gate());
        assert!(!sample("REJECTED", "IN_PROGRESS").satisfies_execution_gate());
    }
}
