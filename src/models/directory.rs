//! Users, teams and capability grants.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub user_id: i64,
    pub username: String,
    pub email: String,
}

/// A team that can raise change requests.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Team {
    pub team_id: i64,
    pub name: String,
}

/// A team with its current members.
#[derive(Debug, Clone, Serialize)]
pub struct TeamDetail {
    #[serde(flatten)]
    pub team: Team,
    pub members: Vec<User>,
}

/// Capability granted to a user through a role table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// May approve or reject change requests.
    SuperManager,
    /// May advance execution status of approved change requests.
    GatewayEditor,
}

impl Role {
    /// Table holding one row per grant.
    pub fn table(&self) -> &'static str {
        match self {
            Self::SuperManager => "super_managers",
            Self::GatewayEditor => "gateway_editors",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SuperManager => write!(f, "super manager"),
            Self::GatewayEditor => write!(f, "gateway editor"),
        }
    }
}

/// One row of a role table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RoleGrant {
    pub user_id: i64,
    pub added_at: i64,
}

/// Role flags derived from grant rows at read time. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleFlags {
    pub is_super_manager: bool,
    pub is_gateway_editor: bool,
}

/// A user with their derived role flags and team ids.
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    #[serde(flatten)]
    pub user: User,
    #[serde(flatten)]
    pub roles: RoleFlags,
    pub team_ids: Vec<i64>,
}
