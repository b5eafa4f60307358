//! Shared wire types for the auth surface.
//!
//! Flow-specific request/response bodies live next to their handlers; the
//! types here are the ones several flows share, plus the error envelope every
//! failure uses.

use axum::Json;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Failure categories surfaced to clients. Messages stay coarse on purpose;
/// the code is what front-ends branch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    InvalidCredentials,
    InvalidToken,
    InvalidDocument,
    AlreadyExists,
    RateLimited,
    NotFound,
    IncompleteOnboarding,
    Forbidden,
    Internal,
}

impl ErrorKind {
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::InvalidCredentials => "invalid_credentials",
            Self::InvalidToken => "invalid_token",
            Self::InvalidDocument => "invalid_document",
            Self::AlreadyExists => "already_exists",
            Self::RateLimited => "rate_limited",
            Self::NotFound => "not_found",
            Self::IncompleteOnboarding => "incomplete_onboarding",
            Self::Forbidden => "forbidden",
            Self::Internal => "internal_error",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::InvalidInput | Self::InvalidDocument => StatusCode::BAD_REQUEST,
            Self::InvalidCredentials | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::AlreadyExists | Self::IncompleteOnboarding => StatusCode::CONFLICT,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<i64>,
}

/// Uniform error response.
pub fn error_response(kind: ErrorKind, message: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        kind.status(),
        Json(ErrorBody {
            success: false,
            error: message.to_string(),
            code: kind.code().to_string(),
            retry_after: None,
        }),
    )
}

/// Rate-limit response carrying the seconds to wait.
pub fn rate_limited_response(message: &str, retry_after: i64) -> (StatusCode, Json<ErrorBody>) {
    (
        ErrorKind::RateLimited.status(),
        Json(ErrorBody {
            success: false,
            error: message.to_string(),
            code: ErrorKind::RateLimited.code().to_string(),
            retry_after: Some(retry_after),
        }),
    )
}

/// The user shape returned from registration, login, and verification flows.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub name: String,
    pub role: String,
    pub account_type: String,
    pub status: String,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub kyc_level: String,
    pub kyc_status: String,
}

/// Bearer token pair plus bookkeeping. Token fields keep their conventional
/// snake_case names; OAuth-style clients expect them verbatim.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokens {
    #[serde(rename = "access_token")]
    pub access_token: String,
    #[serde(rename = "refresh_token")]
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_statuses() {
        assert_eq!(ErrorKind::InvalidInput.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorKind::InvalidCredentials.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ErrorKind::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorKind::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorKind::IncompleteOnboarding.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn error_body_serializes_envelope() {
        let (status, body) = error_response(ErrorKind::InvalidToken, "invalid token");
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let json = serde_json::to_value(&body.0).unwrap_or_default();
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "invalid_token");
        assert!(json.get("retry_after").is_none());
    }

    #[test]
    fn rate_limited_body_carries_retry_after() {
        let (status, body) = rate_limited_response("slow down", 42);
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        let json = serde_json::to_value(&body.0).unwrap_or_default();
        assert_eq!(json["retry_after"], 42);
    }

    #[test]
    fn session_tokens_keep_oauth_field_names() {
        let tokens = SessionTokens {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 3600,
        };
        let json = serde_json::to_value(&tokens).unwrap_or_default();
        assert!(json.get("access_token").is_some());
        assert!(json.get("refresh_token").is_some());
        assert!(json.get("expiresIn").is_some());
    }
}
