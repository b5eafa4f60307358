//! Signed session tokens: HS256 access/refresh pairs.
//!
//! Access tokens are stateless and short-lived (24 h). Refresh tokens live
//! 7 days and are additionally anchored to a session row (hash stored, rotated
//! on refresh) so logout can revoke them.

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ACCESS_TTL_SECONDS: i64 = 24 * 60 * 60;
pub const REFRESH_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User id.
    pub sub: String,
    /// Session row id; shared by the access/refresh pair.
    pub sid: String,
    /// "access" or "refresh".
    pub kind: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: i64,
    pub refresh_expires_at: i64,
}

/// Verification failures are deliberately collapsed into one variant so
/// callers cannot leak why a token was rejected.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidToken;

impl std::fmt::Display for InvalidToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid token")
    }
}

impl std::error::Error for InvalidToken {}

fn sign(
    secret: &str,
    user_id: Uuid,
    session_id: Uuid,
    kind: TokenKind,
    now: i64,
    ttl: i64,
) -> Result<String, InvalidToken> {
    let claims = SessionClaims {
        sub: user_id.to_string(),
        sid: session_id.to_string(),
        kind: kind.as_str().to_string(),
        iat: now,
        exp: now + ttl,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| InvalidToken)
}

/// Issue an access/refresh pair for a session.
///
/// # Errors
/// Returns `InvalidToken` if signing fails.
pub fn issue_pair(
    secret: &str,
    user_id: Uuid,
    session_id: Uuid,
    now: i64,
) -> Result<TokenPair, InvalidToken> {
    let access_token = sign(
        secret,
        user_id,
        session_id,
        TokenKind::Access,
        now,
        ACCESS_TTL_SECONDS,
    )?;
    let refresh_token = sign(
        secret,
        user_id,
        session_id,
        TokenKind::Refresh,
        now,
        REFRESH_TTL_SECONDS,
    )?;
    Ok(TokenPair {
        access_token,
        refresh_token,
        access_expires_at: now + ACCESS_TTL_SECONDS,
        refresh_expires_at: now + REFRESH_TTL_SECONDS,
    })
}

/// Verify signature, expiry, and token kind.
///
/// # Errors
/// Returns `InvalidToken` for any failure (signature, expiry, wrong kind,
/// malformed claims) without distinguishing them.
pub fn verify(secret: &str, token: &str, expected: TokenKind) -> Result<SessionClaims, InvalidToken> {
    let data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| InvalidToken)?;

    if data.claims.kind != expected.as_str() {
        return Err(InvalidToken);
    }
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::utils::now_unix_seconds;

    const SECRET: &str = "test-signing-secret";

    #[test]
    fn pair_round_trips_with_matching_claims() -> Result<(), InvalidToken> {
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();
        let now = now_unix_seconds();
        let pair = issue_pair(SECRET, user, session, now)?;

        assert_eq!(pair.access_expires_at, now + ACCESS_TTL_SECONDS);
        assert_eq!(pair.refresh_expires_at, now + REFRESH_TTL_SECONDS);

        let access = verify(SECRET, &pair.access_token, TokenKind::Access)?;
        assert_eq!(access.sub, user.to_string());
        assert_eq!(access.sid, session.to_string());

        let refresh = verify(SECRET, &pair.refresh_token, TokenKind::Refresh)?;
        assert_eq!(refresh.sid, access.sid);
        Ok(())
    }

    #[test]
    fn kind_mismatch_is_rejected() -> Result<(), InvalidToken> {
        let pair = issue_pair(SECRET, Uuid::new_v4(), Uuid::new_v4(), now_unix_seconds())?;
        assert_eq!(
            verify(SECRET, &pair.access_token, TokenKind::Refresh),
            Err(InvalidToken)
        );
        assert_eq!(
            verify(SECRET, &pair.refresh_token, TokenKind::Access),
            Err(InvalidToken)
        );
        Ok(())
    }

    #[test]
    fn wrong_secret_is_rejected() -> Result<(), InvalidToken> {
        let pair = issue_pair(SECRET, Uuid::new_v4(), Uuid::new_v4(), now_unix_seconds())?;
        assert_eq!(
            verify("other-secret", &pair.access_token, TokenKind::Access),
            Err(InvalidToken)
        );
        Ok(())
    }

    #[test]
    fn expired_token_is_rejected() -> Result<(), InvalidToken> {
        // Issue the pair far enough in the past that even the refresh token
        // is beyond the validation leeway.
        let past = now_unix_seconds() - REFRESH_TTL_SECONDS - 120;
        let pair = issue_pair(SECRET, Uuid::new_v4(), Uuid::new_v4(), past)?;
        assert_eq!(
            verify(SECRET, &pair.access_token, TokenKind::Access),
            Err(InvalidToken)
        );
        assert_eq!(
            verify(SECRET, &pair.refresh_token, TokenKind::Refresh),
            Err(InvalidToken)
        );
        Ok(())
    }

    #[test]
    fn tampered_token_is_rejected() -> Result<(), InvalidToken> {
        let pair = issue_pair(SECRET, Uuid::new_v4(), Uuid::new_v4(), now_unix_seconds())?;
        let mut tampered = pair.access_token.clone();
        tampered.pop();
        assert_eq!(
            verify(SECRET, &tampered, TokenKind::Access),
            Err(InvalidToken)
        );
        Ok(())
    }
}
