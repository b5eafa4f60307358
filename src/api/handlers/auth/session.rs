//! Session lifecycle: issuance, refresh rotation, and logout.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

use super::state::AppState;
use super::storage::{insert_session, revoke_session, rotate_session_refresh};
use super::tokens::{self, ACCESS_TTL_SECONDS, TokenKind};
use super::types::{ErrorBody, ErrorKind, SessionTokens, error_response};
use super::utils::{extract_bearer_token, hash_token, now_unix_seconds};

pub(crate) type ApiError = (StatusCode, Json<ErrorBody>);

/// Create a session row and sign its token pair. The session id is minted
/// here so the claims and the row agree.
pub(crate) async fn issue_session(
    pool: &PgPool,
    secret: &str,
    user_id: Uuid,
    device_id: Option<&str>,
    ip: Option<&str>,
    country: Option<&str>,
) -> anyhow::Result<SessionTokens> {
    let session_id = Uuid::new_v4();
    let now = now_unix_seconds();
    let pair = tokens::issue_pair(secret, user_id, session_id, now)?;

    insert_session(
        pool,
        session_id,
        user_id,
        &hash_token(&pair.refresh_token),
        device_id,
        ip,
        country,
        pair.refresh_expires_at,
    )
    .await?;

    Ok(SessionTokens {
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: ACCESS_TTL_SECONDS,
    })
}

/// Verified claims of the bearer access token on a protected request.
pub(crate) struct Principal {
    pub user_id: Uuid,
    pub session_id: Uuid,
}

/// Require a valid bearer access token.
pub(crate) fn require_access(headers: &HeaderMap, state: &AppState) -> Result<Principal, ApiError> {
    let Some(token) = extract_bearer_token(headers) else {
        return Err(error_response(ErrorKind::InvalidToken, "Missing bearer token"));
    };
    let claims = tokens::verify(state.auth.token_secret(), &token, TokenKind::Access)
        .map_err(|_| error_response(ErrorKind::InvalidToken, "Invalid token"))?;
    let (Ok(user_id), Ok(session_id)) = (Uuid::parse_str(&claims.sub), Uuid::parse_str(&claims.sid))
    else {
        return Err(error_response(ErrorKind::InvalidToken, "Invalid token"));
    };
    Ok(Principal {
        user_id,
        session_id,
    })
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefreshRequest {
    refresh_token: String,
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair", body = SessionTokens),
        (status = 400, description = "Validation error", body = ErrorBody),
        (status = 401, description = "Invalid or revoked refresh token", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn refresh(
    pool: Extension<PgPool>,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<RefreshRequest>>,
) -> impl IntoResponse {
    let request = match payload {
        Some(Json(payload)) => payload,
        None => {
            return error_response(ErrorKind::InvalidInput, "Missing payload").into_response();
        }
    };

    let secret = state.auth.token_secret();
    let Ok(claims) = tokens::verify(secret, &request.refresh_token, TokenKind::Refresh) else {
        return error_response(ErrorKind::InvalidToken, "Invalid refresh token").into_response();
    };
    let (Ok(user_id), Ok(session_id)) = (Uuid::parse_str(&claims.sub), Uuid::parse_str(&claims.sid))
    else {
        return error_response(ErrorKind::InvalidToken, "Invalid refresh token").into_response();
    };

    // Rotate: sign a fresh pair for the same session, then swap the stored
    // hash only if the presented token still matches a live session.
    let now = now_unix_seconds();
    let Ok(pair) = tokens::issue_pair(secret, user_id, session_id, now) else {
        return error_response(ErrorKind::Internal, "Token issuance failed").into_response();
    };

    let rotated = rotate_session_refresh(
        &pool,
        session_id,
        &hash_token(&request.refresh_token),
        &hash_token(&pair.refresh_token),
        pair.refresh_expires_at,
    )
    .await;

    match rotated {
        Ok(true) => (
            StatusCode::OK,
            Json(SessionTokens {
                access_token: pair.access_token,
                refresh_token: pair.refresh_token,
                token_type: "Bearer".to_string(),
                expires_in: ACCESS_TTL_SECONDS,
            }),
        )
            .into_response(),
        Ok(false) => {
            error_response(ErrorKind::InvalidToken, "Invalid refresh token").into_response()
        }
        Err(err) => {
            error!("Session rotation failed: {err}");
            error_response(ErrorKind::Internal, "Session refresh failed").into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session revoked"),
        (status = 401, description = "Invalid token", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<AppState>>,
) -> impl IntoResponse {
    let principal = match require_access(&headers, &state) {
        Ok(principal) => principal,
        Err(err) => return err.into_response(),
    };

    match revoke_session(&pool, principal.session_id, principal.user_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            error!("Session revocation failed: {err}");
            error_response(ErrorKind::Internal, "Logout failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::{AppState, AuthConfig};
    use super::*;
    use anyhow::Result;
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;

    fn app_state() -> Arc<AppState> {
        Arc::new(AppState::new(AuthConfig::new(
            SecretString::from("test-signing-secret"),
            "http://localhost:3000".to_string(),
        )))
    }

    #[tokio::test]
    async fn refresh_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = refresh(Extension(pool), Extension(app_state()), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn refresh_rejects_garbage_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = refresh(
            Extension(pool),
            Extension(app_state()),
            Some(Json(RefreshRequest {
                refresh_token: "not-a-jwt".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn refresh_rejects_access_token_in_refresh_slot() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let state = app_state();
        let pair = tokens::issue_pair(
            state.auth.token_secret(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            now_unix_seconds(),
        )?;
        let response = refresh(
            Extension(pool),
            Extension(state),
            Some(Json(RefreshRequest {
                refresh_token: pair.access_token,
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn logout_requires_bearer_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = logout(HeaderMap::new(), Extension(pool), Extension(app_state()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[test]
    fn require_access_accepts_valid_access_token() -> Result<()> {
        let state = app_state();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();
        let pair = tokens::issue_pair(state.auth.token_secret(), user, session, now_unix_seconds())?;

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", pair.access_token).parse()?,
        );
        let principal = require_access(&headers, &state)
            .map_err(|_| anyhow::anyhow!("expected principal"))?;
        assert_eq!(principal.user_id, user);
        assert_eq!(principal.session_id, session);

        // A refresh token in the Authorization header must not pass.
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", pair.refresh_token).parse()?,
        );
        assert!(require_access(&headers, &state).is_err());
        Ok(())
    }
}
