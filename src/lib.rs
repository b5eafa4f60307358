//! # Idento (Identity Verification & Risk)
//!
//! `idento` is the authentication and identity-risk service of the marketplace
//! platform. It owns the flows with real state-transition logic:
//!
//! - **Multi-channel registration**: email, phone or a pre-verified social
//!   provider; channel possession is proven with short-lived OTP codes before
//!   the account is activated.
//! - **OTP issuance/verification**: one active challenge per
//!   (identifier, channel), 5-minute expiry, attempt and resend caps, codes
//!   consumed on first successful verification.
//! - **Sessions**: HS256 access tokens (24 h) plus stateful refresh tokens
//!   (7 d) whose hashes are stored per device session and rotated on refresh.
//! - **Device & risk**: deterministic device fingerprints, an additive risk
//!   score in `[0, 100]`, and a step-up gate that demands a second OTP factor
//!   for risky or privileged logins.
//! - **KYC**: document submission with MIME/size validation, an admin review
//!   state machine, and an aggregate status derived from the per-level
//!   required document set.
//! - **Onboarding**: step sequencing per account type, idempotent
//!   save-and-resume with opaque resume tokens, and strict completion that
//!   derives feature entitlements.
//!
//! Catalog, cart, orders and payments are separate services; `idento` only
//! speaks to them through the issued sessions and verification flags.

pub mod api;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_app_user_agent() {
        assert!(APP_USER_AGENT.starts_with("idento/"));
    }
}
