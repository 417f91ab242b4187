//! Anti-bot protection for state-mutating requests.
//!
//! Four checks guard every POST, PUT and PATCH: a single-use form token,
//! an empty honeypot, a minimum time between form load and submit, and an
//! optional idempotency key that may only be used once.

mod challenge;
mod engine;
mod settings;
mod token;

pub use challenge::{Challenge, CHALLENGE_COOKIE};
pub use engine::{AntiBotEngine, Submission};
pub use settings::{AntiBotSettings, ConfigEntry, SettingsStore};
pub use token::{FormToken, TokenStore};

/// Why a submission was refused. Each maps to a 403 with `X-Rejection-Reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The honeypot field was filled in
    Honeypot,
    /// Submitted sooner than the minimum time after the form loaded
    TooFast,
    /// Token missing, unknown or expired
    InvalidToken,
    /// Token was already consumed
    ReusedToken,
}

impl Rejection {
    /// Value of the `X-Rejection-Reason` header.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::Honeypot => "Bot detected",
            Rejection::TooFast => "Form submitted too quickly",
            Rejection::InvalidToken => "Invalid form token",
            Rejection::ReusedToken => "Form token already used",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
