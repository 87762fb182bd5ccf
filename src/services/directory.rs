//! Users, teams, role grants and team membership.

use crate::db::now;
use crate::db::DbPool;
use crate::error::AppError;
use crate::models::{Role, RoleGrant, Team, TeamDetail, User, UserProfile};
use crate::services::gates;

pub async fn create_user(pool: &DbPool, username: &str, email: &str) -> Result<User, AppError> {
    let username = username.trim();
    let email = email.trim();
    if username.is_empty() {
        return Err(AppError::invalid_value_field("Username must not be empty", "username"));
    }
    if email.is_empty() {
        return Err(AppError::invalid_value_field("Email must not be empty", "email"));
    }

    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (username, email) VALUES (?, ?) RETURNING user_id, username, email",
    )
    .bind(username)
    .bind(email)
    .fetch_one(pool)
    .await?;

    log::info!("[directory] Created user {} ({})", user.user_id, user.username);
    Ok(user)
}

pub async fn create_team(pool: &DbPool, name: &str) -> Result<Team, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::invalid_value_field("Team name must not be empty", "name"));
    }

    let team = sqlx::query_as::<_, Team>("INSERT INTO teams (name) VALUES (?) RETURNING team_id, name")
        .bind(name)
        .fetch_one(pool)
        .await?;

    log::info!("[directory] Created team {} ({})", team.team_id, team.name);
    Ok(team)
}

/// Load a user or fail with `NotFound`.
pub async fn find_user(pool: &DbPool, user_id: i64) -> Result<User, AppError> {
    sqlx::query_as::<_, User>("SELECT user_id, username, email FROM users WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("User", user_id))
}

async fn find_team(pool: &DbPool, team_id: i64) -> Result<Team, AppError> {
    sqlx::query_as::<_, Team>("SELECT team_id, name FROM teams WHERE team_id = ?")
        .bind(team_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("Team", team_id))
}

/// Register a user on behalf of a Super Manager.
pub async fn add_user(
    pool: &DbPool,
    caller_id: i64,
    username: &str,
    email: &str,
) -> Result<User, AppError> {
    gates::require_role(pool, caller_id, Role::SuperManager).await?;
    create_user(pool, username, email).await
}

/// Return the user named `username`, creating it if absent.
pub async fn ensure_user(pool: &DbPool, username: &str, email: &str) -> Result<User, AppError> {
    let existing = sqlx::query_as::<_, User>(
        "SELECT user_id, username, email FROM users WHERE username = ?",
    )
    .bind(username.trim())
    .fetch_optional(pool)
    .await?;

    match existing {
        Some(user) => Ok(user),
        None => create_user(pool, username, email).await,
    }
}

pub async fn list_users(pool: &DbPool) -> Result<Vec<User>, AppError> {
    let users = sqlx::query_as::<_, User>(
        "SELECT user_id, username, email FROM users ORDER BY username ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(users)
}

/// Create a team. Only Gateway Editors may create teams.
pub async fn add_team(pool: &DbPool, caller_id: i64, name: &str) -> Result<Team, AppError> {
    gates::require_role(pool, caller_id, Role::GatewayEditor).await?;
    create_team(pool, name).await
}

pub async fn list_teams(pool: &DbPool) -> Result<Vec<Team>, AppError> {
    let teams = sqlx::query_as::<_, Team>("SELECT team_id, name FROM teams ORDER BY name ASC")
        .fetch_all(pool)
        .await?;
    Ok(teams)
}

/// Teams `user_id` currently belongs to.
pub async fn list_user_teams(pool: &DbPool, user_id: i64) -> Result<Vec<Team>, AppError> {
    let teams = sqlx::query_as::<_, Team>(
        r#"
        SELECT t.team_id, t.name
        FROM teams t
        JOIN user_team_membership m ON m.team_id = t.team_id
        WHERE m.user_id = ?
        ORDER BY t.name ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(teams)
}

pub async fn get_team(pool: &DbPool, team_id: i64) -> Result<TeamDetail, AppError> {
    let team = find_team(pool, team_id).await?;
    let members = sqlx::query_as::<_, User>(
        r#"
        SELECT u.user_id, u.username, u.email
        FROM users u
        JOIN user_team_membership m ON m.user_id = u.user_id
        WHERE m.team_id = ?
        ORDER BY u.username ASC
        "#,
    )
    .bind(team_id)
    .fetch_all(pool)
    .await?;

    Ok(TeamDetail { team, members })
}

/// A user with role flags and team ids derived from current rows.
pub async fn get_user(pool: &DbPool, user_id: i64) -> Result<UserProfile, AppError> {
    let user = find_user(pool, user_id).await?;
    let roles = gates::role_flags(pool, user_id).await?;
    let team_ids: Vec<i64> = sqlx::query_scalar(
        "SELECT team_id FROM user_team_membership WHERE user_id = ? ORDER BY team_id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(UserProfile {
        user,
        roles,
        team_ids,
    })
}

// ── Role grants ──────────────────────────────────────────────────────────────

async fn insert_grant(pool: &DbPool, user_id: i64, role: Role) -> Result<RoleGrant, AppError> {
    find_user(pool, user_id).await?;

    let sql = format!(
        "INSERT INTO {} (user_id, added_at) VALUES (?, ?) RETURNING user_id, added_at",
        role.table()
    );
    sqlx::query_as::<_, RoleGrant>(&sql)
        .bind(user_id)
        .bind(now())
        .fetch_one(pool)
        .await
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict { .. } => {
                AppError::conflict(format!("User {} is already a {}", user_id, role))
            }
            other => other,
        })
}

/// Grant `role` to `user_id`. Only Super Managers may grant.
pub async fn grant_role(
    pool: &DbPool,
    granter_id: i64,
    user_id: i64,
    role: Role,
) -> Result<RoleGrant, AppError> {
    gates::require_reviewer(pool, granter_id).await?;
    let grant = insert_grant(pool, user_id, role).await?;
    log::info!("[directory] User {} granted {} by {}", user_id, role, granter_id);
    Ok(grant)
}

/// Revoke `role` from `user_id`. Only Super Managers may revoke.
pub async fn revoke_role(
    pool: &DbPool,
    granter_id: i64,
    user_id: i64,
    role: Role,
) -> Result<(), AppError> {
    gates::require_reviewer(pool, granter_id).await?;

    let sql = format!("DELETE FROM {} WHERE user_id = ?", role.table());
    let result = sqlx::query(&sql).bind(user_id).execute(pool).await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found_with_id(format!("{} grant", role), user_id));
    }

    log::info!("[directory] User {} lost {} (revoked by {})", user_id, role, granter_id);
    Ok(())
}

pub async fn list_role_holders(pool: &DbPool, role: Role) -> Result<Vec<RoleGrant>, AppError> {
    let sql = format!(
        "SELECT user_id, added_at FROM {} ORDER BY added_at ASC, user_id ASC",
        role.table()
    );
    let grants = sqlx::query_as::<_, RoleGrant>(&sql).fetch_all(pool).await?;
    Ok(grants)
}

/// Seed a Super Manager without a granter. Already being one is not an error.
pub async fn bootstrap_super_manager(pool: &DbPool, user_id: i64) -> Result<(), AppError> {
    match insert_grant(pool, user_id, Role::SuperManager).await {
        Ok(_) => {
            log::info!("[directory] Bootstrapped super manager {}", user_id);
            Ok(())
        }
        Err(AppError::Conflict { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

// ── Team membership ──────────────────────────────────────────────────────────

/// Team members and Gateway Editors may change a team's membership.
async fn require_team_admin(pool: &DbPool, caller_id: i64, team_id: i64) -> Result<(), AppError> {
    if gates::is_member(pool, caller_id, team_id).await?
        || gates::has_role(pool, caller_id, Role::GatewayEditor).await?
    {
        Ok(())
    } else {
        Err(AppError::forbidden(format!(
            "Only members of team {} or gateway editors can change its membership",
            team_id
        )))
    }
}

pub async fn add_member(
    pool: &DbPool,
    caller_id: i64,
    team_id: i64,
    user_id: i64,
) -> Result<(), AppError> {
    find_team(pool, team_id).await?;
    require_team_admin(pool, caller_id, team_id).await?;
    find_user(pool, user_id).await?;

    sqlx::query("INSERT INTO user_team_membership (user_id, team_id) VALUES (?, ?)")
        .bind(user_id)
        .bind(team_id)
        .execute(pool)
        .await
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict { .. } => AppError::conflict(format!(
                "User {} is already a member of team {}",
                user_id, team_id
            )),
            other => other,
        })?;

    log::info!("[directory] User {} joined team {} (by {})", user_id, team_id, caller_id);
    Ok(())
}

pub async fn remove_member(
    pool: &DbPool,
    caller_id: i64,
    team_id: i64,
    user_id: i64,
) -> Result<(), AppError> {
    find_team(pool, team_id).await?;
    require_team_admin(pool, caller_id, team_id).await?;

    let result = sqlx::query("DELETE FROM user_team_membership WHERE user_id = ? AND team_id = ?")
        .bind(user_id)
        .bind(team_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found_with_id("Team membership", user_id));
    }

    log::info!("[directory] User {} left team {} (by {})", user_id, team_id, caller_id);
    Ok(())
}
