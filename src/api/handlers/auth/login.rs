//! Password login with risk-based step-up.
//!
//! Every attempt is scored from the device fingerprint, the geo/hour pattern
//! of the account's recent logins, and the failure rate. High-risk logins,
//! accounts with 2FA enabled, and administrators get no session until the OTP
//! challenge returned here is completed through `/otp/verify`.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{Timelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use super::otp::OtpChannel;
use super::rate_limit::{RateLimitAction, RateLimitDecision};
use super::risk::{DeviceFingerprint, LoginContext, detect_anomaly, requires_step_up, score_risk};
use super::session::issue_session;
use super::state::AppState;
use super::storage::{
    Identifier, UserRow, find_device, find_user_by_identifier, insert_security_alert,
    login_history, recent_failures, record_login_event, touch_last_login, upsert_device,
};
use super::types::{
    ErrorBody, ErrorKind, SessionTokens, UserSummary, error_response, rate_limited_response,
};
use super::utils::{
    extract_client_ip, extract_country, fingerprint_from_headers, verify_password, vpn_suspected,
};
use super::verification::{ChallengeBody, dispatch_challenge};
use crate::api::delivery::enqueue_notification;

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    identifier: String,
    password: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub success: bool,
    pub step_up_required: bool,
    pub risk_score: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionTokens>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeBody>,
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session issued, or an OTP challenge when step-up is required", body = LoginResponse),
        (status = 400, description = "Validation error", body = ErrorBody),
        (status = 401, description = "Invalid credentials", body = ErrorBody),
        (status = 403, description = "Account pending verification or deactivated", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<LoginRequest>>,
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

    let client_ip = extract_client_ip(&headers);
    if state
        .rate_limiter
        .check_ip(client_ip.as_deref(), RateLimitAction::Login)
        == RateLimitDecision::Limited
        || state
            .rate_limiter
            .check_identifier(identifier.as_str(), RateLimitAction::Login)
            == RateLimitDecision::Limited
    {
        return rate_limited_response("Rate limited", 60).into_response();
    }

    let user = match find_user_by_identifier(&pool, &identifier).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return error_response(ErrorKind::InvalidCredentials, "Invalid credentials")
                .into_response();
        }
        Err(err) => {
            error!("User lookup failed: {err}");
            return error_response(ErrorKind::Internal, "Login failed").into_response();
        }
    };

    match user.status.as_str() {
        "active" => {}
        "pending_verification" => {
            return error_response(ErrorKind::Forbidden, "Account pending verification")
                .into_response();
        }
        _ => {
            return error_response(ErrorKind::Forbidden, "Account deactivated").into_response();
        }
    }

    let password_ok = match verify_password(&request.password, &user.password_hash) {
        Ok(ok) => ok,
        Err(err) => {
            error!("Password verification failed: {err}");
            return error_response(ErrorKind::Internal, "Login failed").into_response();
        }
    };

    let fingerprint = fingerprint_from_headers(&headers);
    let country = extract_country(&headers);

    if !password_ok {
        if let Err(err) = record_login_event(
            &pool,
            user.id,
            false,
            country.as_deref(),
            fingerprint.as_ref().map(|f| f.device_id.as_str()),
        )
        .await
        {
            error!("Login event insert failed: {err}");
        }
        return error_response(ErrorKind::InvalidCredentials, "Invalid credentials")
            .into_response();
    }

    let assessment = match assess(&pool, &user, &fingerprint, country.clone(), &headers).await {
        Ok(assessment) => assessment,
        Err(err) => {
            error!("Risk assessment failed: {err}");
            return error_response(ErrorKind::Internal, "Login failed").into_response();
        }
    };

    let device_id = fingerprint.as_ref().map(|f| f.device_id.clone());
    for (alert_type, severity) in alerts_for(&assessment) {
        if let Err(err) = insert_security_alert(
            &pool,
            user.id,
            alert_type,
            severity,
            device_id.as_deref(),
            country.as_deref(),
        )
        .await
        {
            error!("Security alert insert failed: {err}");
        }
    }

    if assessment.step_up {
        let Some(channel) = step_up_channel(&user) else {
            // 2FA or risk demands a challenge but no channel is verified.
            return error_response(ErrorKind::Forbidden, "No verified channel for step-up")
                .into_response();
        };
        let target = match channel {
            OtpChannel::Email => user.email.clone(),
            OtpChannel::Sms | OtpChannel::Voice => user.phone.clone(),
        };
        let Some(target) = target else {
            return error_response(ErrorKind::Forbidden, "No verified channel for step-up")
                .into_response();
        };
        let target = match channel {
            OtpChannel::Email => Identifier::Email(target),
            OtpChannel::Sms | OtpChannel::Voice => Identifier::Phone(target),
        };

        info!(
            user_id = %user.id,
            risk_score = assessment.score,
            "step-up challenge required"
        );
        let challenge = match dispatch_challenge(&state, &target, channel).await {
            Ok(challenge) => challenge,
            Err(err) => return err.into_response(),
        };

        return (
            StatusCode::OK,
            Json(LoginResponse {
                success: true,
                step_up_required: true,
                risk_score: assessment.score,
                user: None,
                session: None,
                challenge: Some(challenge),
            }),
        )
            .into_response();
    }

    if let Err(err) =
        record_login_event(&pool, user.id, true, country.as_deref(), device_id.as_deref()).await
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

    if assessment.anomaly {
        alert_anomalous_login(&pool, &user, country.as_deref()).await;
    }

    let session = match issue_session(
        &pool,
        state.auth.token_secret(),
        user.id,
        device_id.as_deref(),
        client_ip.as_deref(),
        country.as_deref(),
    )
    .await
    {
        Ok(session) => session,
        Err(err) => {
            error!("Session issuance failed: {err}");
            return error_response(ErrorKind::Internal, "Login failed").into_response();
        }
    };

    (
        StatusCode::OK,
        Json(LoginResponse {
            success: true,
            step_up_required: false,
            risk_score: assessment.score,
            user: Some(UserSummary::from(&user)),
            session: Some(session),
            challenge: None,
        }),
    )
        .into_response()
}

struct Assessment {
    score: u8,
    step_up: bool,
    anomaly: bool,
    /// A fingerprintable client this account has never logged in from.
    new_device: bool,
}

/// Alert rows to persist for a login that passed the credential check.
fn alerts_for(assessment: &Assessment) -> Vec<(&'static str, &'static str)> {
    let mut alerts = Vec::new();
    if assessment.step_up {
        alerts.push(("step_up_challenge", "medium"));
    } else if assessment.new_device {
        alerts.push(("new_device", "low"));
    }
    if assessment.anomaly {
        alerts.push(("anomalous_login", "high"));
    }
    alerts
}

async fn assess(
    pool: &PgPool,
    user: &UserRow,
    fingerprint: &Option<DeviceFingerprint>,
    country: Option<String>,
    headers: &HeaderMap,
) -> anyhow::Result<Assessment> {
    let device = match fingerprint {
        Some(fingerprint) => find_device(pool, user.id, &fingerprint.device_id).await?,
        None => None,
    };
    let failures = recent_failures(pool, user.id).await?;
    let history = login_history(pool, user.id).await?;

    let context = LoginContext {
        device_known: device.is_some(),
        device_trusted: device.as_ref().is_some_and(|d| d.trusted),
        country,
        hour: u8::try_from(Utc::now().hour()).unwrap_or(0),
        recent_failures: failures,
        vpn_suspected: vpn_suspected(headers),
    };

    let score = score_risk(&context, &history);
    Ok(Assessment {
        score,
        step_up: requires_step_up(score, user.two_factor_enabled, &user.role),
        anomaly: detect_anomaly(&context, &history),
        new_device: fingerprint.is_some() && device.is_none(),
    })
}

/// Prefer the verified email for step-up codes, fall back to the verified
/// phone.
fn step_up_channel(user: &UserRow) -> Option<OtpChannel> {
    if user.email.is_some() && user.email_verified_at.is_some() {
        Some(OtpChannel::Email)
    } else if user.phone.is_some() && user.phone_verified_at.is_some() {
        Some(OtpChannel::Sms)
    } else {
        None
    }
}

async fn alert_anomalous_login(pool: &PgPool, user: &UserRow, country: Option<&str>) {
    let Some(ref email) = user.email else {
        warn!(user_id = %user.id, "anomalous login, no email on file for alert");
        return;
    };
    let payload = serde_json::json!({
        "name": user.name,
        "country": country,
    })
    .to_string();

    let result = async {
        let mut tx = pool.begin().await?;
        enqueue_notification(&mut tx, "email", email, "security_alert", &payload).await?;
        tx.commit().await?;
        anyhow::Ok(())
    }
    .await;

    if let Err(err) = result {
        error!("Security alert enqueue failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::{AppState, AuthConfig};
    use super::*;
    use anyhow::Result;
    use chrono::Utc;
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;
    use uuid::Uuid;

    fn app_state() -> Arc<AppState> {
        Arc::new(AppState::new(AuthConfig::new(
            SecretString::from("test-signing-secret"),
            "http://localhost:3000".to_string(),
        )))
    }

    #[tokio::test]
    async fn login_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = login(HeaderMap::new(), Extension(pool), Extension(app_state()), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn login_rejects_invalid_identifier() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = login(
            HeaderMap::new(),
            Extension(pool),
            Extension(app_state()),
            Some(Json(LoginRequest {
                identifier: "not an identifier".to_string(),
                password: "passw0rd-ok".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[test]
    fn alerts_cover_step_up_anomaly_and_new_device() {
        let assessment = Assessment {
            score: 55,
            step_up: true,
            anomaly: true,
            new_device: true,
        };
        assert_eq!(
            alerts_for(&assessment),
            vec![("step_up_challenge", "medium"), ("anomalous_login", "high")]
        );

        let assessment = Assessment {
            score: 25,
            step_up: false,
            anomaly: false,
            new_device: true,
        };
        assert_eq!(alerts_for(&assessment), vec![("new_device", "low")]);

        let assessment = Assessment {
            score: 0,
            step_up: false,
            anomaly: false,
            new_device: false,
        };
        assert!(alerts_for(&assessment).is_empty());
    }

    fn user(email_verified: bool, phone_verified: bool) -> UserRow {
        UserRow {
            id: Uuid::new_v4(),
            email: Some("user@example.com".to_string()),
            phone: Some("+15550109999".to_string()),
            password_hash: "$argon2id$hash".to_string(),
            name: "Test User".to_string(),
            role: "customer".to_string(),
            account_type: "individual".to_string(),
            status: "active".to_string(),
            email_verified_at: email_verified.then(Utc::now),
            phone_verified_at: phone_verified.then(Utc::now),
            two_factor_enabled: false,
            kyc_level: "none".to_string(),
            kyc_status: "not_started".to_string(),
        }
    }

    #[test]
    fn step_up_channel_prefers_verified_email() {
        assert_eq!(step_up_channel(&user(true, true)), Some(OtpChannel::Email));
        assert_eq!(step_up_channel(&user(false, true)), Some(OtpChannel::Sms));
        assert_eq!(step_up_channel(&user(false, false)), None);
    }
}
