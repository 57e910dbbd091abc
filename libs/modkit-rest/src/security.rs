//! Header redaction rules shared by the traffic log.

use http::HeaderName;

/// Replacement printed instead of a sensitive header value.
pub const REDACTED: &str = "[REDACTED]";

/// Headers that are never printed, whatever the log configuration says.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
];

/// Whether a header value must be masked in logs.
///
/// `extra` holds additional lowercase names configured by the caller.
#[must_use]
pub fn is_sensitive_header(name: &HeaderName, extra: &[String]) -> bool {
    let name = name.as_str();
    SENSITIVE_HEADERS.contains(&name) || extra.iter().any(|e| e.eq_ignore_ascii_case(name))
}
