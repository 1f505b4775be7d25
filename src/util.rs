//! Encoding utilities, timestamps, and input validation.

use base64::Engine as _;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{GatepassError, Result};

// ---------------------------------------------------------------------------
// Base64
// ---------------------------------------------------------------------------

/// URL-safe base64, the alphabet used for token text and key material.
pub fn b64url_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE.encode(data)
}

pub fn b64url_decode(s: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::URL_SAFE
        .decode(s)
        .map_err(|e| GatepassError::Other(format!("invalid base64: {e}")))
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Current UTC time as RFC 3339 with second precision and a `Z` suffix.
pub fn now_utc_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    let now = now.replace_nanosecond(0).unwrap_or(now);
    now.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Regex for participant identifiers: starts with alphanumeric, then up to
/// 127 more alphanumeric / hyphen / dot / underscore characters.  The
/// character set excludes the token payload separator `|`.
static PARTICIPANT_ID_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| {
        regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-_.]{0,127}$").unwrap()
    });

/// Validate a participant identifier.
pub fn validate_participant_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(GatepassError::Validation(
            "participant identifier must not be empty".into(),
        ));
    }
    if !PARTICIPANT_ID_RE.is_match(id) {
        return Err(GatepassError::Validation(format!(
            "invalid participant identifier '{}': 1-128 chars, alphanumeric/hyphen/dot/underscore",
            id
        )));
    }
    Ok(())
}

/// Maximum number of rows allowed in a roster CSV.
pub const MAX_ROSTER_ROWS: usize = 10_000;

// ---------------------------------------------------------------------------
// Version constants (set by build.rs)
// ---------------------------------------------------------------------------

pub const GIT_HASH: &str = env!("GATEPASS_GIT_HASH");
pub const BUILD_TS: &str = env!("GATEPASS_BUILD_TS");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Human-readable version line.
pub fn version_string() -> String {
    format!("gatepass v{VERSION} (git {GIT_HASH}, built {BUILD_TS})")
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
