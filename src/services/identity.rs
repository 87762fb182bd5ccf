//! Caller identity for the HTTP API.
//!
//! Credentials are checked by an upstream authenticating proxy, which passes
//! the authenticated user id in the `X-User-Id` header. This middleware only
//! parses that header; role flags are looked up per operation.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated user making a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
}

#[derive(Serialize)]
struct IdentityError {
    code: String,
    message: String,
}

/// Parse a positive user id from a header value.
fn parse_user_id(value: &str) -> Option<i64> {
    value.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

/// Axum middleware that requires a valid `X-User-Id` header.
///
/// On success the [`Caller`] is stored in the request extensions.
pub async fn identity_middleware(mut request: Request<Body>, next: Next) -> Response {
    let user_id = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_user_id);

    match user_id {
        Some(user_id) => {
            request.extensions_mut().insert(Caller { user_id });
            next.run(request).await
        }
        None => {
            let error = IdentityError {
                code: "UNAUTHORIZED".to_string(),
                message: "Missing or invalid X-User-Id header".to_string(),
            };
            (StatusCode::UNAUTHORIZED, Json(error)).into_response()
        }
    }
}
