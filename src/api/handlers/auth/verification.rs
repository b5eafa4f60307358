//! OTP issuance and verification endpoints.
//!
//! `/otp/send` answers 200 whether or not the identifier belongs to an
//! account, so the endpoint cannot be used to enumerate users. A challenge is
//! only armed when the account exists.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;
use utoipa::ToSchema;

use super::otp::{IssueOutcome, OTP_TTL_SECONDS, OtpChannel, VerifyOutcome};
use super::rate_limit::{RateLimitAction, RateLimitDecision};
use super::session::{ApiError, issue_session};
use super::state::AppState;
use super::storage::{
    Identifier, find_user_by_identifier, mark_channel_verified, record_login_event,
    touch_last_login, upsert_device,
};
use super::types::{
    ErrorBody, ErrorKind, SessionTokens, UserSummary, error_response, rate_limited_response,
};
use super::utils::{extract_client_ip, extract_country, fingerprint_from_headers};
use crate::api::delivery::OtpMessage;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeBody {
    pub identifier: String,
    pub channel: OtpChannel,
    pub expires_in: i64,
}

/// Issue a code and push it through the sender. A challenge whose delivery
/// fails is disarmed before the error is reported.
pub(crate) async fn dispatch_challenge(
    state: &AppState,
    identifier: &Identifier,
    channel: OtpChannel,
) -> Result<ChallengeBody, ApiError> {
    let code = match state.otp.issue(identifier.as_str(), channel).await {
        IssueOutcome::Issued { code, .. } => code,
        IssueOutcome::RateLimited { retry_after } => {
            return Err(rate_limited_response("Too many codes requested", retry_after));
        }
    };

    let message = OtpMessage {
        to: identifier.as_str().to_string(),
        channel,
        code,
    };
    if let Err(err) = state.otp_sender.send_code(&message) {
        error!("OTP delivery failed: {err}");
        state.otp.discard(identifier.as_str(), channel).await;
        return Err(error_response(ErrorKind::Internal, "Code delivery failed"));
    }

    Ok(ChallengeBody {
        identifier: identifier.as_str().to_string(),
        channel,
        expires_in: OTP_TTL_SECONDS,
    })
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OtpSendRequest {
    identifier: String,
    channel: Option<OtpChannel>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OtpSendResponse {
    pub success: bool,
    pub channel: OtpChannel,
    pub expires_in: i64,
}

#[utoipa::path(
    post,
    path = "/v1/auth/otp/send",
    request_body = OtpSendRequest,
    responses(
        (status = 200, description = "Code sent if the account exists", body = OtpSendResponse),
        (status = 400, description = "Validation error", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn otp_send(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<OtpSendRequest>>,
) -> impl IntoResponse {
    let request = match payload {
        Some(Json(payload)) => payload,
        None => {
            return error_response(ErrorKind::InvalidInput, "Missing payload").into_response();
        }
    };

    let Some(identifier) = Identifier::parse(&request.identifier) else {
        return error_response(ErrorKind::InvalidInput, "Invalid identifier").into_response();
    };
    let channel = request.channel.unwrap_or_else(|| identifier.default_channel());
    if matches!(identifier, Identifier::Email(_)) && channel != OtpChannel::Email {
        return error_response(ErrorKind::InvalidInput, "Channel does not match identifier")
            .into_response();
    }
    if matches!(identifier, Identifier::Phone(_)) && channel == OtpChannel::Email {
        return error_response(ErrorKind::InvalidInput, "Channel does not match identifier")
            .into_response();
    }

    let client_ip = extract_client_ip(&headers);
    if state
        .rate_limiter
        .check_ip(client_ip.as_deref(), RateLimitAction::OtpSend)
        == RateLimitDecision::Limited
        || state
            .rate_limiter
            .check_identifier(identifier.as_str(), RateLimitAction::OtpSend)
            == RateLimitDecision::Limited
    {
        return rate_limited_response("Rate limited", 60).into_response();
    }

    match find_user_by_identifier(&pool, &identifier).await {
        Ok(Some(_)) => {
            if let Err(err) = dispatch_challenge(&state, &identifier, channel).await {
                return err.into_response();
            }
        }
        Ok(None) => {
            // No account, answer as if a code went out.
        }
        Err(err) => {
            error!("User lookup failed: {err}");
            return error_response(ErrorKind::Internal, "Code delivery failed").into_response();
        }
    }

    (
        StatusCode::OK,
        Json(OtpSendResponse {
            success: true,
            channel,
            expires_in: OTP_TTL_SECONDS,
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OtpVerifyRequest {
    identifier: String,
    channel: Option<OtpChannel>,
    code: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OtpVerifyResponse {
    pub success: bool,
    pub verified: bool,
    pub user: UserSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionTokens>,
}

#[utoipa::path(
    post,
    path = "/v1/auth/otp/verify",
    request_body = OtpVerifyRequest,
    responses(
        (status = 200, description = "Channel verified, session issued for active accounts", body = OtpVerifyResponse),
        (status = 400, description = "Malformed code", body = ErrorBody),
        (status = 401, description = "Invalid or expired code", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn otp_verify(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<OtpVerifyRequest>>,
) -> impl IntoResponse {
    let request = match payload {
        Some(Json(payload)) => payload,
        None => {
            return error_response(ErrorKind::InvalidInput, "Missing payload").into_response();
        }
    };

    let Some(identifier) = Identifier::parse(&request.identifier) else {
        return error_response(ErrorKind::InvalidInput, "Invalid identifier").into_response();
    };
    let channel = request.channel.unwrap_or_else(|| identifier.default_channel());

    let client_ip = extract_client_ip(&headers);
    if state
        .rate_limiter
        .check_ip(client_ip.as_deref(), RateLimitAction::OtpVerify)
        == RateLimitDecision::Limited
    {
        return rate_limited_response("Rate limited", 60).into_response();
    }

    match state.otp.verify(identifier.as_str(), channel, &request.code).await {
        VerifyOutcome::Malformed => {
            return error_response(ErrorKind::InvalidInput, "Malformed code").into_response();
        }
        VerifyOutcome::Invalid => {
            return error_response(ErrorKind::InvalidCredentials, "Invalid or expired code")
                .into_response();
        }
        VerifyOutcome::Verified => {}
    }

    let user = match find_user_by_identifier(&pool, &identifier).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return error_response(ErrorKind::InvalidCredentials, "Invalid or expired code")
                .into_response();
        }
        Err(err) => {
            error!("User lookup failed: {err}");
            return error_response(ErrorKind::Internal, "Verification failed").into_response();
        }
    };

    if let Err(err) = mark_channel_verified(&pool, user.id, channel).await {
        error!("Channel verification update failed: {err}");
        return error_response(ErrorKind::Internal, "Verification failed").into_response();
    }

    // Re-read so the summary reflects the activation.
    let user = match super::storage::find_user_by_id(&pool, user.id).await {
        Ok(Some(user)) => user,
        Ok(None) | Err(_) => user,
    };

    // A verified code on an active account is a completed login, either a
    // step-up or a post-activation first session. It gets the same
    // bookkeeping as a direct password login.
    let session = if user.status == "active" {
        let fingerprint = fingerprint_from_headers(&headers);
        let country = extract_country(&headers);
        let device_id = fingerprint.as_ref().map(|f| f.device_id.clone());

        if let Err(err) =
            record_login_event(&pool, user.id, true, country.as_deref(), device_id.as_deref())
                .await
        {
            error!("Login event insert failed: {err}");
        }
        if let Some(ref fingerprint) = fingerprint
            && let Err(err) = upsert_device(
                &pool,
                user.id,
                &fingerprint.device_id,
                &fingerprint.browser,
                &fingerprint.os,
                &fingerprint.device_class,
            )
            .await
        {
            error!("Device upsert failed: {err}");
        }
        if let Err(err) = touch_last_login(&pool, user.id).await {
            error!("Last-login stamp failed: {err}");
        }

        match issue_session(
            &pool,
            state.auth.token_secret(),
            user.id,
            device_id.as_deref(),
            client_ip.as_deref(),
            country.as_deref(),
        )
        .await
        {
            Ok(tokens) => Some(tokens),
            Err(err) => {
                error!("Session issuance failed: {err}");
                return error_response(ErrorKind::Internal, "Verification failed").into_response();
            }
        }
    } else {
        None
    };

    (
        StatusCode::OK,
        Json(OtpVerifyResponse {
            success: true,
            verified: true,
            user: UserSummary::from(&user),
            session,
        }),
    )
        .into_response()
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
    async fn otp_send_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = otp_send(HeaderMap::new(), Extension(pool), Extension(app_state()), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn otp_send_rejects_bad_identifier() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = otp_send(
            HeaderMap::new(),
            Extension(pool),
            Extension(app_state()),
            Some(Json(OtpSendRequest {
                identifier: "definitely not valid".to_string(),
                channel: None,
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn otp_send_rejects_mismatched_channel() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = otp_send(
            HeaderMap::new(),
            Extension(pool),
            Extension(app_state()),
            Some(Json(OtpSendRequest {
                identifier: "user@example.com".to_string(),
                channel: Some(OtpChannel::Sms),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn otp_verify_rejects_malformed_code() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = otp_verify(
            HeaderMap::new(),
            Extension(pool),
            Extension(app_state()),
            Some(Json(OtpVerifyRequest {
                identifier: "user@example.com".to_string(),
                channel: None,
                code: "12 456".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn otp_verify_rejects_unknown_challenge() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = otp_verify(
            HeaderMap::new(),
            Extension(pool),
            Extension(app_state()),
            Some(Json(OtpVerifyRequest {
                identifier: "user@example.com".to_string(),
                channel: None,
                code: "123456".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn dispatch_challenge_arms_store() -> Result<()> {
        let state = app_state();
        let identifier = Identifier::Email("user@example.com".to_string());
        let challenge = dispatch_challenge(&state, &identifier, OtpChannel::Email)
            .await
            .map_err(|_| anyhow::anyhow!("expected challenge"))?;
        assert_eq!(challenge.expires_in, OTP_TTL_SECONDS);
        assert_eq!(challenge.channel, OtpChannel::Email);
        Ok(())
    }
}
