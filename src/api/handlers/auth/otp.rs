//! One-time-password challenges.
//!
//! Challenges are held in process memory keyed by identifier and channel. A
//! challenge is consumed on successful verification, expires after five
//! minutes, and tolerates at most five wrong attempts. Re-issuing to the same
//! identifier replaces the pending challenge but counts against a rolling
//! resend window so a caller cannot mint codes indefinitely.

use std::collections::HashMap;

use rand::Rng;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::api::handlers::auth::utils::now_unix_seconds;

pub const OTP_TTL_SECONDS: i64 = 5 * 60;
pub const OTP_MAX_ATTEMPTS: u8 = 5;
pub const OTP_RESEND_WINDOW_SECONDS: i64 = 10 * 60;
pub const OTP_RESEND_LIMIT: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OtpChannel {
    Email,
    Sms,
    Voice,
}

impl OtpChannel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Voice => "voice",
        }
    }
}

#[derive(Debug)]
struct OtpChallenge {
    code: String,
    expires_at: i64,
    attempts: u8,
    /// Issue timestamps within the resend window, newest last.
    issued_at: Vec<i64>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum IssueOutcome {
    Issued { code: String, expires_at: i64 },
    /// Too many sends in the rolling window.
    RateLimited { retry_after: i64 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Not six ASCII digits. Does not count as an attempt.
    Malformed,
    /// Missing, expired, exhausted, or wrong code. Intentionally vague.
    Invalid,
    Verified,
}

/// In-memory store of pending challenges.
#[derive(Debug, Default)]
pub struct OtpStore {
    challenges: Mutex<HashMap<(String, OtpChannel), OtpChallenge>>,
}

fn generate_code() -> String {
    format!("{:06}", OsRng.gen_range(0..1_000_000u32))
}

fn well_formed(code: &str) -> bool {
    code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit())
}

impl OtpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh challenge, replacing any pending one for the same
    /// identifier and channel.
    pub async fn issue(&self, identifier: &str, channel: OtpChannel) -> IssueOutcome {
        self.issue_at(identifier, channel, now_unix_seconds()).await
    }

    async fn issue_at(&self, identifier: &str, channel: OtpChannel, now: i64) -> IssueOutcome {
        let mut challenges = self.challenges.lock().await;

        // Drop fully dead entries so the map does not grow unbounded. An
        // expired challenge whose resend history is still inside the window
        // is kept so the send limit cannot be reset by waiting out the TTL.
        challenges.retain(|_, challenge| {
            challenge.expires_at > now
                || challenge
                    .issued_at
                    .last()
                    .is_some_and(|&at| at > now - OTP_RESEND_WINDOW_SECONDS)
        });

        let key = (identifier.to_string(), channel);
        let mut issued_at: Vec<i64> = challenges
            .get(&key)
            .map(|challenge| {
                challenge
                    .issued_at
                    .iter()
                    .copied()
                    .filter(|&at| at > now - OTP_RESEND_WINDOW_SECONDS)
                    .collect()
            })
            .unwrap_or_default();

        if issued_at.len() >= OTP_RESEND_LIMIT {
            let retry_after = issued_at
                .first()
                .map_or(OTP_RESEND_WINDOW_SECONDS, |&oldest| {
                    (oldest + OTP_RESEND_WINDOW_SECONDS - now).max(1)
                });
            return IssueOutcome::RateLimited { retry_after };
        }

        issued_at.push(now);
        let code = generate_code();
        let expires_at = now + OTP_TTL_SECONDS;
        challenges.insert(
            key,
            OtpChallenge {
                code: code.clone(),
                expires_at,
                attempts: 0,
                issued_at,
            },
        );

        IssueOutcome::Issued { code, expires_at }
    }

    /// Check a submitted code. A correct code consumes the challenge; a wrong
    /// code burns one of the five attempts.
    pub async fn verify(&self, identifier: &str, channel: OtpChannel, code: &str) -> VerifyOutcome {
        self.verify_at(identifier, channel, code, now_unix_seconds())
            .await
    }

    async fn verify_at(
        &self,
        identifier: &str,
        channel: OtpChannel,
        code: &str,
        now: i64,
    ) -> VerifyOutcome {
        if !well_formed(code) {
            return VerifyOutcome::Malformed;
        }

        let mut challenges = self.challenges.lock().await;
        let key = (identifier.to_string(), channel);

        let Some(challenge) = challenges.get_mut(&key) else {
            return VerifyOutcome::Invalid;
        };

        if challenge.expires_at <= now || challenge.attempts >= OTP_MAX_ATTEMPTS {
            return VerifyOutcome::Invalid;
        }

        if challenge.code != code {
            challenge.attempts += 1;
            return VerifyOutcome::Invalid;
        }

        challenges.remove(&key);
        VerifyOutcome::Verified
    }

    /// Drop a pending challenge, used when delivery fails after issuance.
    pub async fn discard(&self, identifier: &str, channel: OtpChannel) {
        let mut challenges = self.challenges.lock().await;
        challenges.remove(&(identifier.to_string(), channel));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "user@example.com";

    fn issued_code(outcome: IssueOutcome) -> String {
        match outcome {
            IssueOutcome::Issued { code, .. } => code,
            IssueOutcome::RateLimited { .. } => panic!("expected issued"),
        }
    }

    #[tokio::test]
    async fn issue_and_verify_consumes_challenge() {
        let store = OtpStore::new();
        let code = issued_code(store.issue(ID, OtpChannel::Email).await);

        assert_eq!(
            store.verify(ID, OtpChannel::Email, &code).await,
            VerifyOutcome::Verified
        );
        // Consumed, a replay fails.
        assert_eq!(
            store.verify(ID, OtpChannel::Email, &code).await,
            VerifyOutcome::Invalid
        );
    }

    #[tokio::test]
    async fn malformed_codes_fail_fast_without_burning_attempts() {
        let store = OtpStore::new();
        let code = issued_code(store.issue(ID, OtpChannel::Sms).await);

        for bad in ["12345", "1234567", "12a456", ""] {
            assert_eq!(
                store.verify(ID, OtpChannel::Sms, bad).await,
                VerifyOutcome::Malformed
            );
        }
        assert_eq!(
            store.verify(ID, OtpChannel::Sms, &code).await,
            VerifyOutcome::Verified
        );
    }

    #[tokio::test]
    async fn wrong_code_burns_attempts_until_locked() {
        let store = OtpStore::new();
        let code = issued_code(store.issue(ID, OtpChannel::Email).await);
        let wrong = if code == "000000" { "000001" } else { "000000" };

        for _ in 0..OTP_MAX_ATTEMPTS {
            assert_eq!(
                store.verify(ID, OtpChannel::Email, wrong).await,
                VerifyOutcome::Invalid
            );
        }
        // Attempts exhausted, even the right code is rejected.
        assert_eq!(
            store.verify(ID, OtpChannel::Email, &code).await,
            VerifyOutcome::Invalid
        );
    }

    #[tokio::test]
    async fn expired_challenge_is_rejected() {
        let store = OtpStore::new();
        let now = now_unix_seconds();
        let code = issued_code(store.issue_at(ID, OtpChannel::Email, now).await);

        assert_eq!(
            store
                .verify_at(ID, OtpChannel::Email, &code, now + OTP_TTL_SECONDS + 1)
                .await,
            VerifyOutcome::Invalid
        );
    }

    #[tokio::test]
    async fn reissue_replaces_pending_code() {
        let store = OtpStore::new();
        let now = now_unix_seconds();
        let first = issued_code(store.issue_at(ID, OtpChannel::Email, now).await);
        let second = issued_code(store.issue_at(ID, OtpChannel::Email, now + 1).await);

        if first != second {
            assert_eq!(
                store.verify_at(ID, OtpChannel::Email, &first, now + 2).await,
                VerifyOutcome::Invalid
            );
        }
        assert_eq!(
            store
                .verify_at(ID, OtpChannel::Email, &second, now + 2)
                .await,
            VerifyOutcome::Verified
        );
    }

    #[tokio::test]
    async fn resend_limit_applies_within_window() {
        let store = OtpStore::new();
        let now = now_unix_seconds();

        for offset in 0..OTP_RESEND_LIMIT as i64 {
            assert!(matches!(
                store.issue_at(ID, OtpChannel::Sms, now + offset).await,
                IssueOutcome::Issued { .. }
            ));
        }
        let limited = store.issue_at(ID, OtpChannel::Sms, now + 10).await;
        match limited {
            IssueOutcome::RateLimited { retry_after } => assert!(retry_after > 0),
            IssueOutcome::Issued { .. } => panic!("expected rate limit"),
        }

        // Outside the rolling window the limit resets.
        assert!(matches!(
            store
                .issue_at(ID, OtpChannel::Sms, now + OTP_RESEND_WINDOW_SECONDS + 1)
                .await,
            IssueOutcome::Issued { .. }
        ));
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let store = OtpStore::new();
        let email_code = issued_code(store.issue(ID, OtpChannel::Email).await);
        let sms_code = issued_code(store.issue(ID, OtpChannel::Sms).await);

        assert_eq!(
            store.verify(ID, OtpChannel::Email, &email_code).await,
            VerifyOutcome::Verified
        );
        assert_eq!(
            store.verify(ID, OtpChannel::Sms, &sms_code).await,
            VerifyOutcome::Verified
        );
    }

    #[tokio::test]
    async fn discard_removes_pending_challenge() {
        let store = OtpStore::new();
        let code = issued_code(store.issue(ID, OtpChannel::Voice).await);
        store.discard(ID, OtpChannel::Voice).await;
        assert_eq!(
            store.verify(ID, OtpChannel::Voice, &code).await,
            VerifyOutcome::Invalid
        );
    }

    #[test]
    fn generated_codes_are_six_digits() {
        for _ in 0..32 {
            assert!(well_formed(&generate_code()));
        }
    }
}
