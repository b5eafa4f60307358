//! Shared state injected into handlers via `Extension`.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::api::delivery::{LogOtpSender, OtpSender};
use crate::api::handlers::auth::kyc::storage::{DocumentStore, PostgresDocumentStore};
use crate::api::handlers::auth::otp::OtpStore;
use crate::api::handlers::auth::rate_limit::{NoopRateLimiter, RateLimiter};

/// Auth settings sourced from CLI flags. The signing secret stays wrapped
/// until the moment a token is signed or verified.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    token_secret: SecretString,
    frontend_url: String,
}

impl AuthConfig {
    #[must_use]
    pub const fn new(token_secret: SecretString, frontend_url: String) -> Self {
        Self {
            token_secret,
            frontend_url,
        }
    }

    #[must_use]
    pub fn token_secret(&self) -> &str {
        self.token_secret.expose_secret()
    }

    #[must_use]
    pub fn frontend_url(&self) -> &str {
        &self.frontend_url
    }
}

/// Process-wide auth state: configuration, pending OTP challenges, and the
/// pluggable seams (delivery, rate limiting, document storage).
pub struct AppState {
    pub auth: AuthConfig,
    pub otp: OtpStore,
    pub otp_sender: Arc<dyn OtpSender>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub documents: Arc<dyn DocumentStore>,
}

impl AppState {
    #[must_use]
    pub fn new(auth: AuthConfig) -> Self {
        Self {
            auth,
            otp: OtpStore::new(),
            otp_sender: Arc::new(LogOtpSender),
            rate_limiter: Arc::new(NoopRateLimiter),
            documents: Arc::new(PostgresDocumentStore),
        }
    }

    #[must_use]
    pub fn with_otp_sender(mut self, sender: Arc<dyn OtpSender>) -> Self {
        self.otp_sender = sender;
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    #[must_use]
    pub fn with_document_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.documents = store;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig::new(
            SecretString::from("signing-secret"),
            "http://localhost:3000".to_string(),
        )
    }

    #[test]
    fn config_exposes_secret_only_on_demand() {
        let config = config();
        assert_eq!(config.token_secret(), "signing-secret");
        assert_eq!(config.frontend_url(), "http://localhost:3000");
        // Debug output must not leak the secret.
        assert!(!format!("{config:?}").contains("signing-secret"));
    }

    #[test]
    fn state_builders_replace_seams() {
        let state = AppState::new(config()).with_rate_limiter(Arc::new(NoopRateLimiter));
        assert_eq!(state.auth.frontend_url(), "http://localhost:3000");
    }
}
