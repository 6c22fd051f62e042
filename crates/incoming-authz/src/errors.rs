//! Service error types.
//!
//! All errors map to HTTP status codes via the `IntoResponse` impl. Messages
//! returned to callers are generic; the specific cause is logged server-side
//! or carried in the decision's reason code.

use crate::auth::TokenError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Service-level error.
///
/// - Unauthenticated: 401 Unauthorized, with `WWW-Authenticate`
/// - Forbidden: 403 Forbidden
/// - ServiceUnavailable: 503 Service Unavailable
#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AuthzError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            AuthzError::Unauthenticated(_) => 401,
            AuthzError::Forbidden(_) => 403,
            AuthzError::ServiceUnavailable(_) => 503,
        }
    }
}

impl From<TokenError> for AuthzError {
    fn from(e: TokenError) -> Self {
        AuthzError::Unauthenticated(e.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AuthzError::Unauthenticated(message) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", message.clone())
            }
            AuthzError::Forbidden(message) => (StatusCode::FORBIDDEN, "FORBIDDEN", message.clone()),
            AuthzError::ServiceUnavailable(reason) => {
                tracing::warn!(target: "authz.http", reason = %reason, "Service unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Service temporarily unavailable".to_string(),
                )
            }
        };

        let mut response = (
            status,
            Json(ErrorResponse {
                error: ErrorDetail {
                    code: code.to_string(),
                    message,
                },
            }),
        )
            .into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer error=\"invalid_token\""),
            );
        }

        response
    }
}
