//! HTTP Basic `Authorization` header decoding.
//!
//! Tolerates any whitespace and a missing `:` separator (treated as an
//! empty password rather than a parse failure) — some NTRIP base-station
//! firmwares send malformed Basic headers, and this spec treats that as
//! `AuthFailed`, not `MalformedRequest`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

pub fn decode_basic_auth(header_value: &str) -> Option<(String, String)> {
    let value = header_value.trim();
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8_lossy(&decoded);
    match text.split_once(':') {
        Some((user, pass)) => Some((user.to_string(), pass.to_string())),
        None => Some((text.trim().to_string(), String::new())),
    }
}

pub fn encode_basic_auth(user: &str, pass: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
}
