//! OTP fan-out and the notification outbox worker.
//!
//! One-time codes are delivered synchronously on the request path through an
//! `OtpSender`; if delivery fails the handler discards the pending challenge
//! and reports the failure, so a code the user can never receive is not left
//! armed.
//!
//! Security alerts (new-device logins, KYC decisions) go through a
//! transactional outbox instead. Flows enqueue rows in `delivery_outbox`
//! inside their own transaction, and a background task polls that table,
//! locks a batch via `FOR UPDATE SKIP LOCKED`, and hands each row to a
//! `NotificationSender`. Failed rows are retried with exponential backoff and
//! jitter until a max attempt threshold, then marked `failed`.
//!
//! The default senders log instead of talking to a provider; production wires
//! in implementations backed by an email API, an SMS gateway, and a voice
//! call service.

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::api::handlers::auth::otp::OtpChannel;

/// A one-time code on its way to the user.
#[derive(Clone, Debug)]
pub struct OtpMessage {
    pub to: String,
    pub channel: OtpChannel,
    pub code: String,
}

/// Request-path delivery of one-time codes.
pub trait OtpSender: Send + Sync {
    /// Deliver a code or return an error so the caller can disarm the
    /// challenge.
    fn send_code(&self, message: &OtpMessage) -> Result<()>;
}

/// Local dev sender that logs the code instead of delivering it.
#[derive(Clone, Debug)]
pub struct LogOtpSender;

impl OtpSender for LogOtpSender {
    fn send_code(&self, message: &OtpMessage) -> Result<()> {
        info!(
            to = %message.to,
            channel = %message.channel.as_str(),
            code = %message.code,
            "otp delivery stub"
        );
        Ok(())
    }
}

/// An outbox row handed to the notification sender.
#[derive(Clone, Debug)]
pub struct NotificationMessage {
    pub channel: String,
    pub to_address: String,
    pub template: String,
    pub payload_json: String,
}

/// Notification delivery abstraction used by the outbox worker.
pub trait NotificationSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    fn send(&self, message: &NotificationMessage) -> Result<()>;
}

/// Local dev sender that logs the payload.
#[derive(Clone, Debug)]
pub struct LogNotificationSender;

impl NotificationSender for LogNotificationSender {
    fn send(&self, message: &NotificationMessage) -> Result<()> {
        info!(
            channel = %message.channel,
            to_address = %message.to_address,
            template = %message.template,
            payload = %message.payload_json,
            "notification outbox send stub"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DeliveryWorkerConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl DeliveryWorkerConfig {
    /// Default worker config: 5s poll interval, 10 messages per batch,
    /// 5 max attempts, and 5s->5m exponential backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    /// Clamp zero or inconsistent values to workable ones.
    #[must_use]
    pub fn normalize(self) -> Self {
        let poll_interval = if self.poll_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.poll_interval
        };
        let batch_size = self.batch_size.max(1);
        let max_attempts = self.max_attempts.max(1);
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.backoff_base
        };
        let backoff_max = self.backoff_max.max(backoff_base);
        Self {
            poll_interval,
            batch_size,
            max_attempts,
            backoff_base,
            backoff_max,
        }
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub const fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub const fn backoff_max(&self) -> Duration {
        self.backoff_max
    }
}

impl Default for DeliveryWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Enqueue a notification inside the caller's transaction so the message and
/// the state change it announces commit or roll back together.
pub async fn enqueue_notification(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    channel: &str,
    to_address: &str,
    template: &str,
    payload_json: &str,
) -> Result<()> {
    let query = r"
        INSERT INTO delivery_outbox (channel, to_address, template, payload_json, status, attempts, next_attempt_at)
        VALUES ($1, $2, $3, $4::jsonb, 'pending', 0, NOW())
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(channel)
        .bind(to_address)
        .bind(template)
        .bind(payload_json)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to enqueue notification")?;
    Ok(())
}

/// Spawn a background task that polls and processes the notification outbox.
pub fn spawn_outbox_worker(
    pool: PgPool,
    sender: Arc<dyn NotificationSender>,
    config: DeliveryWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();
        let poll_interval = config.poll_interval();

        loop {
            let batch_result = process_outbox_batch(&pool, sender.as_ref(), &config).await;
            if let Err(err) = batch_result {
                error!("notification outbox batch failed: {err}");
            }

            sleep(poll_interval).await;
        }
    })
}

async fn process_outbox_batch(
    pool: &PgPool,
    sender: &dyn NotificationSender,
    config: &DeliveryWorkerConfig,
) -> Result<usize> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start outbox transaction")?;

    // Grab a locked batch so multiple workers can run without double-sending.
    let query = r"
        SELECT id, channel, to_address, template, payload_json::text AS payload_json, attempts
        FROM delivery_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(i64::try_from(config.batch_size()).unwrap_or(0))
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to load outbox batch")?;

    if rows.is_empty() {
        // Commit even on empty to release locks and keep the poll loop consistent.
        tx.commit()
            .await
            .context("failed to commit empty outbox batch")?;
        return Ok(0);
    }

    let row_count = rows.len();
    for row in rows {
        let id: Uuid = row.get("id");
        let attempts: i32 = row.get("attempts");
        let attempts = u32::try_from(attempts).unwrap_or(0);
        let message = NotificationMessage {
            channel: row.get("channel"),
            to_address: row.get("to_address"),
            template: row.get("template"),
            payload_json: row.get("payload_json"),
        };

        let send_result = sender.send(&message);
        update_outbox_status(&mut tx, id, attempts, send_result, config).await?;
    }

    tx.commit()
        .await
        .context("failed to commit outbox batch")?;

    Ok(row_count)
}

async fn update_outbox_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    attempts: u32,
    send_result: Result<()>,
    config: &DeliveryWorkerConfig,
) -> Result<()> {
    let next_attempt = attempts.saturating_add(1);
    let next_attempts_i32 = i32::try_from(next_attempt).unwrap_or(i32::MAX);
    match send_result {
        Ok(()) => {
            let query = r"
                UPDATE delivery_outbox
                SET status = 'sent',
                    attempts = $2,
                    last_error = NULL,
                    sent_at = NOW(),
                    next_attempt_at = NOW()
                WHERE id = $1
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(id)
                .bind(next_attempts_i32)
                .execute(&mut **tx)
                .instrument(span)
                .await
                .context("failed to update outbox status to sent")?;
        }
        Err(err) => {
            if next_attempt >= config.max_attempts() {
                let query = r"
                    UPDATE delivery_outbox
                    SET status = 'failed',
                        attempts = $2,
                        last_error = $3,
                        next_attempt_at = NOW()
                    WHERE id = $1
                ";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(id)
                    .bind(next_attempts_i32)
                    .bind(err.to_string())
                    .execute(&mut **tx)
                    .instrument(span)
                    .await
                    .context("failed to update outbox status to failed")?;
            } else {
                let delay =
                    backoff_delay(next_attempt, config.backoff_base(), config.backoff_max());
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                let query = r"
                    UPDATE delivery_outbox
                    SET status = 'pending',
                        attempts = $2,
                        last_error = $3,
                        next_attempt_at = NOW() + ($4 * INTERVAL '1 millisecond')
                    WHERE id = $1
                ";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(id)
                    .bind(next_attempts_i32)
                    .bind(err.to_string())
                    .bind(delay_ms)
                    .execute(&mut **tx)
                    .instrument(span)
                    .await
                    .context("failed to update outbox retry schedule")?;
            }
        }
    }

    Ok(())
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_senders_accept_messages() -> Result<()> {
        LogOtpSender.send_code(&OtpMessage {
            to: "user@example.com".to_string(),
            channel: OtpChannel::Email,
            code: "123456".to_string(),
        })?;
        LogNotificationSender.send(&NotificationMessage {
            channel: "email".to_string(),
            to_address: "user@example.com".to_string(),
            template: "security_alert".to_string(),
            payload_json: "{}".to_string(),
        })?;
        Ok(())
    }

    #[test]
    fn normalize_clamps_zero_values() {
        let config = DeliveryWorkerConfig::new()
            .with_poll_interval_seconds(0)
            .with_batch_size(0)
            .with_max_attempts(0)
            .with_backoff_base_seconds(0)
            .with_backoff_max_seconds(0)
            .normalize();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.batch_size(), 1);
        assert_eq!(config.max_attempts(), 1);
        assert_eq!(config.backoff_base(), Duration::from_secs(1));
        assert!(config.backoff_max() >= config.backoff_base());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);
        let first = backoff_delay(1, base, max);
        let tenth = backoff_delay(10, base, max);
        assert!(first <= base);
        assert!(tenth <= max);
        // Jitter keeps the delay at no less than half the computed value.
        assert!(tenth >= max / 2);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let delay = Duration::from_millis(1000);
        for _ in 0..16 {
            let jittered = jitter_delay(delay);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= delay);
        }
    }
}
