//! Session handshake: the `userOnline` frame and the values it carries.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use super::frame::{UserAgent, UserOnlineFrame, PROTOCOL_VERSION};

const NONCE_DIGITS: usize = 15;
const NONCE_MODULUS: u64 = 1_000_000_000_000_000;

/// Random 15-digit decimal string (leading zeros allowed).
pub fn generate_nonce() -> String {
    let value = rand::thread_rng().gen_range(0..NONCE_MODULUS);
    format!("{value:0width$}", width = NONCE_DIGITS)
}

/// Seconds since the unix epoch; 0 if the clock is before the epoch.
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Milliseconds since the unix epoch; 0 if the clock is before the epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Builds the `userOnline` frame that opens a session.
///
/// Besides the mandatory fields the frame identifies the client the way the
/// official mobile app does; some firmware ignores sessions without them.
pub fn user_online(apikey: &str, sequence: u64) -> UserOnlineFrame {
    UserOnlineFrame {
        user_agent: UserAgent::App,
        version: PROTOCOL_VERSION,
        nonce: generate_nonce(),
        apikey: apikey.to_string(),
        ts: unix_seconds().to_string(),
        sequence: sequence.to_string(),
        apk_version: Some("1.8".to_string()),
        os: Some("ios".to_string()),
        at: Some("at".to_string()),
        model: Some("iPhone10,6".to_string()),
        rom_version: Some("11.1.2".to_string()),
    }
}
