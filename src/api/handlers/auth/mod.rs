//! Auth handlers and supporting modules.
//!
//! This module coordinates registration, OTP challenges, risk-scored login,
//! session lifecycle, KYC review, and onboarding progress.
//!
//! ## Step-up policy
//!
//! A login gets a session directly only when none of these hold: the account
//! has 2FA enabled, the account is an administrator, or the risk score
//! reaches the step-up threshold. Otherwise the login answer carries an OTP
//! challenge and `/otp/verify` finishes the handshake.
//!
//! ## Token handling
//!
//! Raw refresh and resume tokens never touch the database; only their
//! SHA-256 hashes are stored. Access tokens are stateless HS256 JWTs.

pub mod kyc;
pub mod login;
pub mod onboarding;
pub(crate) mod otp;
mod rate_limit;
pub mod register;
pub(crate) mod risk;
pub mod session;
mod state;
mod storage;
pub(crate) mod tokens;
pub(crate) mod types;
mod utils;
pub mod verification;

pub use rate_limit::NoopRateLimiter;
pub use state::{AppState, AuthConfig};
