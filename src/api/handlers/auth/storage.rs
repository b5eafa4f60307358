//! Database access shared across the auth flows: users, sessions, devices,
//! login events, and security alerts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{Instrument, info_span};
use uuid::Uuid;

use crate::api::handlers::auth::otp::OtpChannel;
use crate::api::handlers::auth::risk::{HISTORY_DEPTH, LoginHistory};
use crate::api::handlers::auth::types::UserSummary;

/// Lookback window for counting failed logins toward the risk score.
pub const FAILURE_WINDOW_MINUTES: i64 = 15;

const USER_COLUMNS: &str = r"
    id, email, phone, password_hash, name, role, account_type, status,
    email_verified_at, phone_verified_at, two_factor_enabled,
    kyc_level, kyc_status
";

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password_hash: String,
    pub name: String,
    pub role: String,
    pub account_type: String,
    pub status: String,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub phone_verified_at: Option<DateTime<Utc>>,
    pub two_factor_enabled: bool,
    pub kyc_level: String,
    pub kyc_status: String,
}

impl From<&UserRow> for UserSummary {
    fn from(user: &UserRow) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            phone: user.phone.clone(),
            name: user.name.clone(),
            role: user.role.clone(),
            account_type: user.account_type.clone(),
            status: user.status.clone(),
            email_verified: user.email_verified_at.is_some(),
            phone_verified: user.phone_verified_at.is_some(),
            kyc_level: user.kyc_level.clone(),
            kyc_status: user.kyc_status.clone(),
        }
    }
}

/// A login identifier, already normalized. Anything containing `@` is treated
/// as an email, everything else as a phone number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identifier {
    Email(String),
    Phone(String),
}

impl Identifier {
    pub fn parse(raw: &str) -> Option<Self> {
        use crate::api::handlers::auth::utils::{
            normalize_email, normalize_phone, valid_email, valid_phone,
        };
        if raw.contains('@') {
            let email = normalize_email(raw);
            valid_email(&email).then_some(Self::Email(email))
        } else {
            let phone = normalize_phone(raw);
            valid_phone(&phone).then_some(Self::Phone(phone))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Email(value) | Self::Phone(value) => value,
        }
    }

    /// The channel a code for this identifier defaults to.
    pub const fn default_channel(&self) -> OtpChannel {
        match self {
            Self::Email(_) => OtpChannel::Email,
            Self::Phone(_) => OtpChannel::Sms,
        }
    }
}

pub async fn find_user_by_identifier(
    pool: &PgPool,
    identifier: &Identifier,
) -> Result<Option<UserRow>> {
    let (column, value) = match identifier {
        Identifier::Email(email) => ("email", email),
        Identifier::Phone(phone) => ("phone", phone),
    };
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = $1");
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    sqlx::query_as::<_, UserRow>(&query)
        .bind(value)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to look up user by identifier")
}

pub async fn find_user_by_id(pool: &PgPool, user_id: Uuid) -> Result<Option<UserRow>> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    sqlx::query_as::<_, UserRow>(&query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to look up user by id")
}

pub struct NewUser<'a> {
    pub email: Option<&'a str>,
    pub phone: Option<&'a str>,
    pub password_hash: &'a str,
    pub name: &'a str,
    pub account_type: &'a str,
    /// `pending_verification` for channel registrations, `active` when a
    /// social provider already vouched for the identity.
    pub status: &'a str,
    /// Stamp `email_verified_at` at insert; set for provider-supplied emails.
    pub email_verified: bool,
}

/// Insert a user. Runs inside the caller's transaction so the welcome
/// notification and provider link can be enqueued atomically.
pub async fn insert_user(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    new_user: &NewUser<'_>,
) -> Result<UserRow, sqlx::Error> {
    let query = format!(
        r"
        INSERT INTO users (email, phone, password_hash, name, role, account_type, status, email_verified_at)
        VALUES ($1, $2, $3, $4, 'customer', $5, $6, CASE WHEN $7 THEN NOW() END)
        RETURNING {USER_COLUMNS}
        "
    );
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query.as_str()
    );
    sqlx::query_as::<_, UserRow>(&query)
        .bind(new_user.email)
        .bind(new_user.phone)
        .bind(new_user.password_hash)
        .bind(new_user.name)
        .bind(new_user.account_type)
        .bind(new_user.status)
        .bind(new_user.email_verified)
        .fetch_one(&mut **tx)
        .instrument(span)
        .await
}

/// Link a social provider identity to a user. The (provider, subject) pair is
/// unique; a violation means the identity is already bound to another account.
pub async fn link_provider(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    provider: &str,
    subject: &str,
) -> Result<(), sqlx::Error> {
    let query = r"
        INSERT INTO social_identities (user_id, provider, subject)
        VALUES ($1, $2, $3)
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(provider)
        .bind(subject)
        .execute(&mut **tx)
        .instrument(span)
        .await?;
    Ok(())
}

/// Mark the identifier's channel verified, and activate a pending account
/// once every channel supplied at registration is verified. The channel being
/// verified now counts as verified inside the CASE because SET expressions
/// see the pre-update row.
pub async fn mark_channel_verified(pool: &PgPool, user_id: Uuid, channel: OtpChannel) -> Result<()> {
    let (column, email_now, phone_now) = match channel {
        OtpChannel::Email => ("email_verified_at", "TRUE", "FALSE"),
        OtpChannel::Sms | OtpChannel::Voice => ("phone_verified_at", "FALSE", "TRUE"),
    };
    let query = format!(
        r"
        UPDATE users
        SET {column} = COALESCE({column}, NOW()),
            status = CASE
                WHEN status = 'pending_verification'
                     AND (email IS NULL OR email_verified_at IS NOT NULL OR {email_now})
                     AND (phone IS NULL OR phone_verified_at IS NOT NULL OR {phone_now})
                THEN 'active'
                ELSE status
            END,
            updated_at = NOW()
        WHERE id = $1
        "
    );
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query.as_str()
    );
    sqlx::query(&query)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to mark channel verified")?;
    Ok(())
}

/// Insert a session row. The id is generated by the caller so the signed
/// tokens can carry it.
pub async fn insert_session(
    pool: &PgPool,
    session_id: Uuid,
    user_id: Uuid,
    refresh_hash: &[u8],
    device_id: Option<&str>,
    ip: Option<&str>,
    country: Option<&str>,
    expires_at: i64,
) -> Result<()> {
    let query = r"
        INSERT INTO user_sessions (id, user_id, refresh_hash, device_id, ip, country, expires_at, last_seen_at)
        VALUES ($1, $2, $3, $4, $5, $6, TO_TIMESTAMP($7), NOW())
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_id)
        .bind(user_id)
        .bind(refresh_hash)
        .bind(device_id)
        .bind(ip)
        .bind(country)
        .bind(expires_at)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to insert session")?;
    Ok(())
}

/// Rotate the stored refresh hash, but only if the presented one matches a
/// live session belonging to an active user. Returns false when the session
/// is gone, revoked, expired, the hash does not match, or the account has
/// been deactivated since the session was issued.
pub async fn rotate_session_refresh(
    pool: &PgPool,
    session_id: Uuid,
    presented_hash: &[u8],
    new_hash: &[u8],
    new_expires_at: i64,
) -> Result<bool> {
    let query = r"
        UPDATE user_sessions
        SET refresh_hash = $3,
            expires_at = TO_TIMESTAMP($4),
            last_seen_at = NOW()
        FROM users
        WHERE user_sessions.id = $1
          AND user_sessions.refresh_hash = $2
          AND user_sessions.revoked_at IS NULL
          AND user_sessions.expires_at > NOW()
          AND users.id = user_sessions.user_id
          AND users.status = 'active'
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(session_id)
        .bind(presented_hash)
        .bind(new_hash)
        .bind(new_expires_at)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to rotate session")?;
    Ok(result.rows_affected() == 1)
}

/// Revoke a session; revoking an already-revoked session is a no-op.
pub async fn revoke_session(pool: &PgPool, session_id: Uuid, user_id: Uuid) -> Result<()> {
    let query = r"
        UPDATE user_sessions
        SET revoked_at = COALESCE(revoked_at, NOW())
        WHERE id = $1 AND user_id = $2
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_id)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to revoke session")?;
    Ok(())
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct DeviceRow {
    pub device_id: String,
    pub trusted: bool,
}

pub async fn find_device(
    pool: &PgPool,
    user_id: Uuid,
    device_id: &str,
) -> Result<Option<DeviceRow>> {
    let query = r"
        SELECT device_id, trusted
        FROM user_devices
        WHERE user_id = $1 AND device_id = $2
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, DeviceRow>(query)
        .bind(user_id)
        .bind(device_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to look up device")
}

/// Record the device on a successful login; a repeat sighting just bumps
/// `last_seen_at`.
pub async fn upsert_device(
    pool: &PgPool,
    user_id: Uuid,
    device_id: &str,
    browser: &str,
    os: &str,
    device_class: &str,
) -> Result<()> {
    let query = r"
        INSERT INTO user_devices (user_id, device_id, browser, os, device_class, trusted, last_seen_at)
        VALUES ($1, $2, $3, $4, $5, FALSE, NOW())
        ON CONFLICT (user_id, device_id)
        DO UPDATE SET last_seen_at = NOW()
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(device_id)
        .bind(browser)
        .bind(os)
        .bind(device_class)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to upsert device")?;
    Ok(())
}

pub async fn record_login_event(
    pool: &PgPool,
    user_id: Uuid,
    success: bool,
    country: Option<&str>,
    device_id: Option<&str>,
) -> Result<()> {
    let query = r"
        INSERT INTO login_events (user_id, success, country, device_id)
        VALUES ($1, $2, $3, $4)
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(success)
        .bind(country)
        .bind(device_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to record login event")?;
    Ok(())
}

/// Stamp the account's most recent successful login.
pub async fn touch_last_login(pool: &PgPool, user_id: Uuid) -> Result<()> {
    let query = r"
        UPDATE users
        SET last_login_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to stamp last login")?;
    Ok(())
}

/// Persist a security alert raised by the risk layer. Alerts start
/// unresolved; support tooling flips the flag.
pub async fn insert_security_alert(
    pool: &PgPool,
    user_id: Uuid,
    alert_type: &str,
    severity: &str,
    device_id: Option<&str>,
    country: Option<&str>,
) -> Result<()> {
    let query = r"
        INSERT INTO security_alerts (user_id, alert_type, severity, device_id, country, resolved)
        VALUES ($1, $2, $3, $4, $5, FALSE)
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(alert_type)
        .bind(severity)
        .bind(device_id)
        .bind(country)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to insert security alert")?;
    Ok(())
}

/// Failed attempts for this account in the last `FAILURE_WINDOW_MINUTES`.
pub async fn recent_failures(pool: &PgPool, user_id: Uuid) -> Result<i64> {
    let query = r"
        SELECT COUNT(*) AS failures
        FROM login_events
        WHERE user_id = $1
          AND success = FALSE
          AND created_at > NOW() - ($2 * INTERVAL '1 minute')
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(FAILURE_WINDOW_MINUTES)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to count recent failures")?;
    Ok(row.get("failures"))
}

/// Countries and login hours from the last successful logins, newest first.
pub async fn login_history(pool: &PgPool, user_id: Uuid) -> Result<LoginHistory> {
    let query = r"
        SELECT country, EXTRACT(HOUR FROM created_at AT TIME ZONE 'UTC')::int AS hour
        FROM login_events
        WHERE user_id = $1 AND success = TRUE
        ORDER BY created_at DESC
        LIMIT $2
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(user_id)
        .bind(HISTORY_DEPTH)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to load login history")?;

    let mut history = LoginHistory::default();
    for row in rows {
        if let Some(country) = row.get::<Option<String>, _>("country") {
            history.countries.push(country);
        }
        let hour: i32 = row.get("hour");
        history.hours.push(u8::try_from(hour).unwrap_or(0));
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_parse_classifies_and_normalizes() {
        assert_eq!(
            Identifier::parse(" User@Example.COM "),
            Some(Identifier::Email("user@example.com".to_string()))
        );
        assert_eq!(
            Identifier::parse("+1 (555) 010-9999"),
            Some(Identifier::Phone("+15550109999".to_string()))
        );
        assert_eq!(Identifier::parse("not valid"), None);
        assert_eq!(Identifier::parse("bad@"), None);
    }

    #[test]
    fn identifier_default_channel() {
        let email = Identifier::Email("user@example.com".to_string());
        let phone = Identifier::Phone("+15550109999".to_string());
        assert_eq!(email.default_channel(), OtpChannel::Email);
        assert_eq!(phone.default_channel(), OtpChannel::Sms);
    }

    #[test]
    fn user_summary_reflects_verification_timestamps() {
        let user = UserRow {
            id: Uuid::new_v4(),
            email: Some("user@example.com".to_string()),
            phone: None,
            password_hash: "$argon2id$hash".to_string(),
            name: "Test User".to_string(),
            role: "customer".to_string(),
            account_type: "individual".to_string(),
            status: "active".to_string(),
            email_verified_at: Some(Utc::now()),
            phone_verified_at: None,
            two_factor_enabled: false,
            kyc_level: "none".to_string(),
            kyc_status: "not_started".to_string(),
        };
        let summary = UserSummary::from(&user);
        assert!(summary.email_verified);
        assert!(!summary.phone_verified);
        assert_eq!(summary.account_type, "individual");
    }
}
