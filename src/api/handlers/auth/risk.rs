//! Login risk scoring and device fingerprinting.
//!
//! All functions here are pure; handlers gather the signals (device rows,
//! recent login history) and feed them in. Scores are additive per signal and
//! capped at 100.

use sha2::{Digest, Sha256};

pub const RISK_UNKNOWN_DEVICE: u8 = 25;
pub const RISK_NEW_COUNTRY: u8 = 30;
pub const RISK_UNUSUAL_HOUR: u8 = 15;
pub const RISK_RECENT_FAILURES: u8 = 20;
pub const RISK_VPN_SUSPECTED: u8 = 10;
pub const RISK_CAP: u8 = 100;

/// Score at or above which a login must complete a second factor.
pub const STEP_UP_THRESHOLD: u8 = 50;

/// Failed attempts in the lookback window must exceed this before the signal
/// fires.
pub const RECENT_FAILURE_THRESHOLD: i64 = 3;

/// Hours of circular distance from any recent login hour before the hour
/// counts as unusual.
pub const HOUR_DEVIATION_LIMIT: u8 = 6;

/// How many most-recent successful logins inform the history signals.
pub const HISTORY_DEPTH: i64 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceFingerprint {
    /// Hex SHA-256 over the stable request attributes.
    pub device_id: String,
    pub browser: String,
    pub os: String,
    pub device_class: String,
}

/// Derive a stable fingerprint from the user agent and accept-language pair.
pub fn fingerprint_device(user_agent: &str, accept_language: &str) -> DeviceFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(user_agent.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(accept_language.as_bytes());
    let device_id = format!("{:x}", hasher.finalize());

    DeviceFingerprint {
        device_id,
        browser: parse_browser(user_agent).to_string(),
        os: parse_os(user_agent).to_string(),
        device_class: parse_device_class(user_agent).to_string(),
    }
}

fn parse_browser(user_agent: &str) -> &'static str {
    // Order matters, Chrome ships "Safari" in its UA and Edge ships both.
    if user_agent.contains("Edg/") || user_agent.contains("Edge/") {
        "edge"
    } else if user_agent.contains("OPR/") || user_agent.contains("Opera") {
        "opera"
    } else if user_agent.contains("Firefox/") {
        "firefox"
    } else if user_agent.contains("Chrome/") || user_agent.contains("Chromium/") {
        "chrome"
    } else if user_agent.contains("Safari/") {
        "safari"
    } else {
        "unknown"
    }
}

fn parse_os(user_agent: &str) -> &'static str {
    if user_agent.contains("Android") {
        "android"
    } else if user_agent.contains("iPhone") || user_agent.contains("iPad") {
        "ios"
    } else if user_agent.contains("Windows") {
        "windows"
    } else if user_agent.contains("Mac OS X") || user_agent.contains("Macintosh") {
        "macos"
    } else if user_agent.contains("Linux") {
        "linux"
    } else {
        "unknown"
    }
}

fn parse_device_class(user_agent: &str) -> &'static str {
    if user_agent.contains("iPad") || user_agent.contains("Tablet") {
        "tablet"
    } else if user_agent.contains("Mobile")
        || user_agent.contains("Android")
        || user_agent.contains("iPhone")
    {
        "mobile"
    } else {
        "desktop"
    }
}

/// Signals gathered for the login being scored.
#[derive(Clone, Debug, Default)]
pub struct LoginContext {
    pub device_known: bool,
    pub device_trusted: bool,
    pub country: Option<String>,
    /// Hour of day (0..=23) in UTC.
    pub hour: u8,
    /// Failed attempts for this account in the lookback window.
    pub recent_failures: i64,
    pub vpn_suspected: bool,
}

/// The user's last successful logins, newest first, at most `HISTORY_DEPTH`.
#[derive(Clone, Debug, Default)]
pub struct LoginHistory {
    pub countries: Vec<String>,
    pub hours: Vec<u8>,
}

impl LoginHistory {
    pub fn is_empty(&self) -> bool {
        self.countries.is_empty() && self.hours.is_empty()
    }
}

fn circular_hour_distance(a: u8, b: u8) -> u8 {
    let diff = a.abs_diff(b);
    diff.min(24 - diff)
}

fn country_is_anomalous(context: &LoginContext, history: &LoginHistory) -> bool {
    match &context.country {
        Some(country) if !history.countries.is_empty() => {
            !history.countries.iter().any(|seen| seen == country)
        }
        _ => false,
    }
}

fn hour_is_anomalous(context: &LoginContext, history: &LoginHistory) -> bool {
    if history.hours.is_empty() {
        return false;
    }
    history
        .hours
        .iter()
        .all(|&seen| circular_hour_distance(context.hour, seen) > HOUR_DEVIATION_LIMIT)
}

/// Additive risk score, capped at `RISK_CAP`. A trusted device suppresses the
/// unknown-device signal but nothing else.
pub fn score_risk(context: &LoginContext, history: &LoginHistory) -> u8 {
    let mut score: u16 = 0;

    if !context.device_known && !context.device_trusted {
        score += u16::from(RISK_UNKNOWN_DEVICE);
    }
    if country_is_anomalous(context, history) {
        score += u16::from(RISK_NEW_COUNTRY);
    }
    if hour_is_anomalous(context, history) {
        score += u16::from(RISK_UNUSUAL_HOUR);
    }
    if context.recent_failures > RECENT_FAILURE_THRESHOLD {
        score += u16::from(RISK_RECENT_FAILURES);
    }
    if context.vpn_suspected {
        score += u16::from(RISK_VPN_SUSPECTED);
    }

    u8::try_from(score.min(u16::from(RISK_CAP))).unwrap_or(RISK_CAP)
}

/// Whether this login must complete an OTP challenge before a session is
/// issued. Administrators always step up.
pub fn requires_step_up(score: u8, two_factor_enabled: bool, role: &str) -> bool {
    two_factor_enabled || role == "admin" || score >= STEP_UP_THRESHOLD
}

/// Whether the login deviates from the account's pattern enough to raise a
/// security alert even when it succeeds.
pub fn detect_anomaly(context: &LoginContext, history: &LoginHistory) -> bool {
    country_is_anomalous(context, history) || hour_is_anomalous(context, history)
}
