//! Unverified JWT claim reading.
//!
//! The limiter keys requests on claims but never authenticates them: the
//! signature segment is ignored and may be empty. Forged claims only change
//! which bucket the forger is counted in, so this is not a trust boundary and
//! must never be used for authorization.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::{Map, Value};
use tracing::debug;

/// Reads the payload segment of a compact JWT and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnverifiedClaims;

impl UnverifiedClaims {
    /// Decode the claims object from an `Authorization` header value or a
    /// bare token.
    ///
    /// Returns `None` unless the token has exactly three dot-separated
    /// segments and the middle one is base64url-encoded JSON object.
    pub fn decode(&self, authorization: &str) -> Option<Map<String, Value>> {
        let token = strip_bearer(authorization.trim());

        let mut segments = token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            debug!("Token is not a three-segment JWT");
            return None;
        };

        let bytes = match URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "JWT payload is not base64url");
                return None;
            }
        };

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(claims)) => Some(claims),
            Ok(_) => {
                debug!("JWT payload is not a JSON object");
                None
            }
            Err(e) => {
                debug!(error = %e, "JWT payload is not JSON");
                None
            }
        }
    }

    /// Join the named claims, in order, with `separator`.
    ///
    /// Missing claims are skipped; if none of them are present the result is
    /// `None` so the caller falls back to IP keying.
    pub fn extract(&self, authorization: &str, names: &[String], separator: &str) -> Option<String> {
        if names.is_empty() {
            return None;
        }
        let claims = self.decode(authorization)?;

        let values: Vec<String> = names
            .iter()
            .filter_map(|name| claims.get(name).and_then(claim_to_string))
            .collect();

        if values.is_empty() {
            debug!(claims = ?names, "None of the configured claims are present");
            return None;
        }
        Some(values.join(separator))
    }
}

fn strip_bearer(value: &str) -> &str {
    match value.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => value[7..].trim(),
        _ => value,
    }
}

pub(crate) fn claim_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}
