//! Data models for the change request service.
//!
//! These models represent the entities stored in SQLite and returned by the
//! HTTP API. Row models derive `FromRow` for SQLx and `Serialize` for JSON.

pub mod audit_entry;
pub mod change_request;
pub mod comment;
pub mod directory;
pub mod review;

// Re-exports for convenient access
pub use audit_entry::{AuditEntry, EventType, SYSTEM_ACTOR_ID};
pub use change_request::{
    ApprovalStatus, ChangeRequest, ChangeRequestDetail, ChangeRequestFilter, ExecutionStatus,
    ReviewDecision,
};
pub use comment::Comment;
pub use directory::{Role, RoleFlags, RoleGrant, Team, TeamDetail, User, UserProfile};
pub use review::Review;
