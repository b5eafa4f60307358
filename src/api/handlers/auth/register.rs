//! Multi-channel registration.
//!
//! Accounts can be created with an email, a phone number, a social provider,
//! or any combination. Channel registrations land in `pending_verification`
//! and a code goes out per supplied channel; a provider-only registration
//! is pre-verified by the provider, so the account starts `active` and a
//! session is issued in the response. The welcome notification and the
//! provider link are enqueued in the same transaction as the insert.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, warn};
use utoipa::ToSchema;

use super::otp::OtpChannel;
use super::rate_limit::{RateLimitAction, RateLimitDecision};
use super::session::issue_session;
use super::state::AppState;
use super::storage::{Identifier, NewUser, insert_user, link_provider};
use super::types::{
    ErrorBody, ErrorKind, SessionTokens, UserSummary, error_response, rate_limited_response,
};
use super::utils::{
    extract_client_ip, extract_country, hash_password, is_unique_violation, normalize_email,
    normalize_phone, valid_email, valid_password, valid_phone,
};
use super::verification::{ChallengeBody, dispatch_challenge};
use crate::api::delivery::enqueue_notification;

const ACCOUNT_TYPES: [&str; 3] = ["individual", "business", "hybrid"];

/// Identity asserted by an external social provider. The provider has
/// already verified the subject, so no OTP round trip is needed for it.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderLink {
    name: String,
    subject: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    email: Option<String>,
    phone: Option<String>,
    password: String,
    name: String,
    account_type: Option<String>,
    provider: Option<ProviderLink>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    pub user: UserSummary,
    pub requires_verification: bool,
    /// One armed challenge per supplied channel.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub verification: Vec<ChallengeBody>,
    /// Channels whose code could not be delivered; no code is on the way for
    /// these, request a fresh one through `/otp/send`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub delivery_failures: Vec<OtpChannel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionTokens>,
}

#[utoipa::path(
    post,
    path = "/v1/auth/register/multi-channel",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created, verification pending", body = RegisterResponse),
        (status = 400, description = "Validation error", body = ErrorBody),
        (status = 409, description = "Identifier already registered", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn register(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<RegisterRequest>>,
) -> impl IntoResponse {
    let request = match payload {
        Some(Json(payload)) => payload,
        None => {
            return error_response(ErrorKind::InvalidInput, "Missing payload").into_response();
        }
    };

    let email = request
        .email
        .as_deref()
        .map(normalize_email)
        .filter(|email| !email.is_empty());
    let phone = request
        .phone
        .as_deref()
        .map(normalize_phone)
        .filter(|phone| !phone.is_empty());

    let provider = match request.provider {
        Some(link) => {
            let name = link.name.trim();
            let subject = link.subject.trim();
            if name.is_empty() || subject.is_empty() {
                return error_response(ErrorKind::InvalidInput, "Invalid provider link")
                    .into_response();
            }
            Some(ProviderLink {
                name: name.to_string(),
                subject: subject.to_string(),
                email: link.email,
            })
        }
        None => None,
    };

    if email.is_none() && phone.is_none() && provider.is_none() {
        return error_response(
            ErrorKind::InvalidInput,
            "An email, phone number or provider is required",
        )
        .into_response();
    }
    if let Some(ref email) = email
        && !valid_email(email)
    {
        return error_response(ErrorKind::InvalidInput, "Invalid email").into_response();
    }
    if let Some(ref phone) = phone
        && !valid_phone(phone)
    {
        return error_response(ErrorKind::InvalidInput, "Invalid phone number").into_response();
    }
    if !valid_password(&request.password) {
        return error_response(ErrorKind::InvalidInput, "Password too weak").into_response();
    }
    let name = request.name.trim();
    if name.is_empty() || name.chars().count() > 120 {
        return error_response(ErrorKind::InvalidInput, "Invalid name").into_response();
    }
    let account_type = request
        .account_type
        .as_deref()
        .unwrap_or("individual");
    if !ACCOUNT_TYPES.contains(&account_type) {
        return error_response(ErrorKind::InvalidInput, "Invalid account type").into_response();
    }

    // A provider-only registration is vouched for by the provider; its email
    // (when the provider shares one) arrives pre-verified.
    let provider_only = email.is_none() && phone.is_none();
    let mut email = email;
    if provider_only
        && let Some(provider_email) = provider.as_ref().and_then(|link| link.email.as_deref())
    {
        let provider_email = normalize_email(provider_email);
        if !valid_email(&provider_email) {
            return error_response(ErrorKind::InvalidInput, "Invalid provider email")
                .into_response();
        }
        email = Some(provider_email);
    }

    // Email is the primary channel when both identifiers are given. A
    // provider-only registration has no channel to challenge.
    let identifier = match (&email, &phone) {
        _ if provider_only => None,
        (Some(email), _) => Some(Identifier::Email(email.clone())),
        (None, Some(phone)) => Some(Identifier::Phone(phone.clone())),
        (None, None) => None,
    };

    let rate_key = identifier.as_ref().map_or_else(
        || provider.as_ref().map(|link| link.subject.as_str()).unwrap_or_default(),
        Identifier::as_str,
    );
    let client_ip = extract_client_ip(&headers);
    if state
        .rate_limiter
        .check_ip(client_ip.as_deref(), RateLimitAction::Register)
        == RateLimitDecision::Limited
        || state
            .rate_limiter
            .check_identifier(rate_key, RateLimitAction::Register)
            == RateLimitDecision::Limited
    {
        return rate_limited_response("Rate limited", 60).into_response();
    }

    let password_hash = match hash_password(&request.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Password hashing failed: {err}");
            return error_response(ErrorKind::Internal, "Registration failed").into_response();
        }
    };

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(err) => {
            error!("Transaction start failed: {err}");
            return error_response(ErrorKind::Internal, "Registration failed").into_response();
        }
    };

    let user = match insert_user(
        &mut tx,
        &NewUser {
            email: email.as_deref(),
            phone: phone.as_deref(),
            password_hash: &password_hash,
            name,
            account_type,
            status: if provider_only {
                "active"
            } else {
                "pending_verification"
            },
            email_verified: provider_only && email.is_some(),
        },
    )
    .await
    {
        Ok(user) => user,
        Err(err) if is_unique_violation(&err) => {
            return error_response(ErrorKind::AlreadyExists, "Identifier already registered")
                .into_response();
        }
        Err(err) => {
            error!("User insert failed: {err}");
            return error_response(ErrorKind::Internal, "Registration failed").into_response();
        }
    };

    if let Some(ref link) = provider {
        match link_provider(&mut tx, user.id, &link.name, &link.subject).await {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                return error_response(
                    ErrorKind::AlreadyExists,
                    "Provider identity already linked",
                )
                .into_response();
            }
            Err(err) => {
                error!("Provider link failed: {err}");
                return error_response(ErrorKind::Internal, "Registration failed").into_response();
            }
        }
    }

    if let Some(ref email) = email {
        let payload = serde_json::json!({ "name": name }).to_string();
        if let Err(err) = enqueue_notification(&mut tx, "email", email, "welcome", &payload).await {
            error!("Welcome notification enqueue failed: {err}");
            return error_response(ErrorKind::Internal, "Registration failed").into_response();
        }
    }

    if let Err(err) = tx.commit().await {
        error!("Registration commit failed: {err}");
        return error_response(ErrorKind::Internal, "Registration failed").into_response();
    }

    if provider_only {
        let session = match issue_session(
            &pool,
            state.auth.token_secret(),
            user.id,
            None,
            client_ip.as_deref(),
            extract_country(&headers).as_deref(),
        )
        .await
        {
            Ok(tokens) => tokens,
            Err(err) => {
                error!("Session issuance failed: {err}");
                return error_response(ErrorKind::Internal, "Registration failed").into_response();
            }
        };
        return (
            StatusCode::CREATED,
            Json(RegisterResponse {
                success: true,
                user: UserSummary::from(&user),
                requires_verification: false,
                verification: Vec::new(),
                delivery_failures: Vec::new(),
                session: Some(session),
            }),
        )
            .into_response();
    }

    // One challenge per supplied channel. The account exists either way; a
    // failed code delivery is reported back and re-requested through
    // /otp/send rather than rolling back the user.
    let (verification, delivery_failures) =
        arm_channels(&state, email.as_deref(), phone.as_deref()).await;

    (
        StatusCode::CREATED,
        Json(RegisterResponse {
            success: true,
            user: UserSummary::from(&user),
            requires_verification: true,
            verification,
            delivery_failures,
            session: None,
        }),
    )
        .into_response()
}

/// Arm one OTP challenge per supplied channel. Channels whose delivery fails
/// are returned separately so the caller never believes a code went out when
/// none did.
async fn arm_channels(
    state: &AppState,
    email: Option<&str>,
    phone: Option<&str>,
) -> (Vec<ChallengeBody>, Vec<OtpChannel>) {
    let mut verification = Vec::new();
    let mut delivery_failures = Vec::new();

    let channels = email
        .map(|email| Identifier::Email(email.to_string()))
        .into_iter()
        .chain(phone.map(|phone| Identifier::Phone(phone.to_string())));
    for identifier in channels {
        let channel = identifier.default_channel();
        match dispatch_challenge(state, &identifier, channel).await {
            Ok(challenge) => verification.push(challenge),
            Err(_) => {
                warn!(
                    identifier = identifier.as_str(),
                    channel = channel.as_str(),
                    "registration code delivery failed"
                );
                delivery_failures.push(channel);
            }
        }
    }
    (verification, delivery_failures)
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

    fn request(email: Option<&str>, phone: Option<&str>) -> RegisterRequest {
        RegisterRequest {
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            password: "passw0rd-ok".to_string(),
            name: "Test User".to_string(),
            account_type: None,
            provider: None,
        }
    }

    async fn register_status(request: RegisterRequest) -> Result<StatusCode> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = register(
            HeaderMap::new(),
            Extension(pool),
            Extension(app_state()),
            Some(Json(request)),
        )
        .await
        .into_response();
        Ok(response.status())
    }

    #[tokio::test]
    async fn register_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = register(HeaderMap::new(), Extension(pool), Extension(app_state()), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn register_requires_some_identifier() -> Result<()> {
        assert_eq!(
            register_status(request(None, None)).await?,
            StatusCode::BAD_REQUEST
        );
        Ok(())
    }

    #[tokio::test]
    async fn register_rejects_invalid_email() -> Result<()> {
        assert_eq!(
            register_status(request(Some("nope"), None)).await?,
            StatusCode::BAD_REQUEST
        );
        Ok(())
    }

    #[tokio::test]
    async fn register_rejects_invalid_phone() -> Result<()> {
        assert_eq!(
            register_status(request(None, Some("123"))).await?,
            StatusCode::BAD_REQUEST
        );
        Ok(())
    }

    #[tokio::test]
    async fn register_rejects_weak_password() -> Result<()> {
        let mut weak = request(Some("user@example.com"), None);
        weak.password = "short".to_string();
        assert_eq!(register_status(weak).await?, StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn register_rejects_unknown_account_type() -> Result<()> {
        let mut bad = request(Some("user@example.com"), None);
        bad.account_type = Some("cooperative".to_string());
        assert_eq!(register_status(bad).await?, StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn register_rejects_blank_provider_link() -> Result<()> {
        let mut bad = request(None, None);
        bad.provider = Some(ProviderLink {
            name: "google".to_string(),
            subject: "  ".to_string(),
            email: None,
        });
        assert_eq!(register_status(bad).await?, StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn register_rejects_invalid_provider_email() -> Result<()> {
        let mut bad = request(None, None);
        bad.provider = Some(ProviderLink {
            name: "google".to_string(),
            subject: "subject-123".to_string(),
            email: Some("not-an-email".to_string()),
        });
        assert_eq!(register_status(bad).await?, StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn register_rejects_blank_name() -> Result<()> {
        let mut bad = request(Some("user@example.com"), None);
        bad.name = "   ".to_string();
        assert_eq!(register_status(bad).await?, StatusCode::BAD_REQUEST);
        Ok(())
    }

    struct FailingOtpSender;

    impl crate::api::delivery::OtpSender for FailingOtpSender {
        fn send_code(&self, _message: &crate::api::delivery::OtpMessage) -> Result<()> {
            anyhow::bail!("delivery provider unavailable")
        }
    }

    #[tokio::test]
    async fn arm_channels_reports_failed_deliveries() {
        let state = Arc::new(
            AppState::new(AuthConfig::new(
                SecretString::from("test-signing-secret"),
                "http://localhost:3000".to_string(),
            ))
            .with_otp_sender(Arc::new(FailingOtpSender)),
        );
        let (verification, failures) =
            arm_channels(&state, Some("user@example.com"), Some("+15550109999")).await;
        assert!(verification.is_empty());
        assert_eq!(failures, vec![OtpChannel::Email, OtpChannel::Sms]);
    }

    #[tokio::test]
    async fn arm_channels_arms_one_challenge_per_channel() {
        let state = app_state();
        let (verification, failures) =
            arm_channels(&state, Some("user@example.com"), Some("+15550109999")).await;
        assert_eq!(verification.len(), 2);
        assert!(failures.is_empty());
    }
}
