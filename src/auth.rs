//! Caller identity from the fronting identity-aware proxy.
//!
//! The service never authenticates users itself: the proxy in front of it
//! verifies the session and forwards the caller's stable subject id and
//! email as trusted headers. Identity is never read from the request body.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Header carrying the verified subject identifier.
pub const USER_HEADER: &str = "x-forwarded-user";
/// Header carrying the verified email, when the proxy knows it.
pub const EMAIL_HEADER: &str = "x-forwarded-email";

/// Verified caller identity. Extraction fails with 401 before the handler
/// body runs, so unauthenticated requests never reach the model or store.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub sub: String,
    pub email: Option<String>,
}

impl AuthUser {
    /// Best identifier to record against usage accounting.
    pub fn email_or_sub(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.sub)
    }
}

#[derive(Debug)]
pub struct Unauthorized;

impl IntoResponse for Unauthorized {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "You must be logged in." })),
        )
            .into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Unauthorized;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header_str = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let sub = header_str(USER_HEADER).ok_or(Unauthorized)?;
        let email = header_str(EMAIL_HEADER);

        Ok(AuthUser { sub, email })
    }
}
