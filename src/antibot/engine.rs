//! Anti-bot validation of mutating requests.

use axum::http::{HeaderMap, Method};
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::challenge::{Challenge, CHALLENGE_COOKIE};
use super::settings::{AntiBotSettings, SettingsStore};
use super::token::{FormToken, TokenStore};
use super::{now_millis, Rejection};
use crate::config::{AntiBotConfig, ChallengeType};
use crate::error::{GatewayError, Result};
use crate::identity::cookie_value;

pub const FORM_TOKEN_HEADER: &str = "x-form-token";
pub const FORM_LOAD_TIME_HEADER: &str = "x-form-load-time";
pub const HONEYPOT_HEADER: &str = "x-honeypot";
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

/// Where a submission's form token came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TokenSource {
    /// `X-Form-Token`; the form load time header is then required too
    #[default]
    Header,
    /// The meta-refresh challenge cookie; the token's issue time stands in
    /// for the load time
    ChallengeCookie,
}

/// The anti-bot fields of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Submission {
    pub token: Option<String>,
    pub token_source: TokenSource,
    /// Client-reported form load time, milliseconds since the epoch
    pub load_time_ms: Option<i64>,
    pub honeypot: Option<String>,
    pub idempotency_key: Option<String>,
}

impl Submission {
    /// Read the submission headers. The token falls back to the challenge
    /// cookie when the header is absent.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };

        let (token, token_source) = match header(FORM_TOKEN_HEADER).filter(|t| !t.is_empty()) {
            Some(token) => (Some(token), TokenSource::Header),
            None => (
                cookie_value(headers, CHALLENGE_COOKIE),
                TokenSource::ChallengeCookie,
            ),
        };

        let load_time_ms = header(FORM_LOAD_TIME_HEADER).and_then(|v| match v.parse::<i64>() {
            Ok(ms) => Some(ms),
            Err(_) => {
                debug!(value = %v, "Ignoring unparsable form load time");
                None
            }
        });

        // A repeated honeypot header counts as filled if any copy is
        let honeypots: Vec<String> = headers
            .get_all(HONEYPOT_HEADER)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_string())
            .collect();
        let honeypot = honeypots
            .iter()
            .find(|h| !h.is_empty())
            .or(honeypots.first())
            .cloned();

        Self {
            token,
            token_source,
            load_time_ms,
            honeypot,
            idempotency_key: header(IDEMPOTENCY_KEY_HEADER).filter(|k| !k.is_empty()),
        }
    }
}

/// Issues form tokens and challenges, and validates submissions.
pub struct AntiBotEngine {
    settings: Arc<SettingsStore>,
    tokens: TokenStore,
    /// Idempotency keys already seen; expiry and capacity bound memory
    idempotency: Cache<String, ()>,
}

impl AntiBotEngine {
    pub fn new(config: &AntiBotConfig) -> Self {
        let settings = Arc::new(SettingsStore::new(AntiBotSettings::from(config)));
        let idempotency = Cache::builder()
            .max_capacity(config.idempotency_capacity)
            .time_to_live(Duration::from_secs(config.idempotency_ttl_secs))
            .build();

        Self {
            settings,
            tokens: TokenStore::new(
                Duration::from_secs(config.token_ttl_secs),
                config.token_capacity,
            ),
            idempotency,
        }
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    /// Whether a request with this method must pass validation.
    pub fn applies_to(&self, method: &Method) -> bool {
        self.settings.current().enabled
            && matches!(*method, Method::POST | Method::PUT | Method::PATCH)
    }

    pub fn issue_form_token(&self) -> FormToken {
        let now = now_millis();
        FormToken {
            token: self.tokens.issue(now),
            load_time: now,
            expires_in: self.tokens.ttl().as_secs(),
            honeypot_field: self.settings.current().honeypot_field.clone(),
        }
    }

    /// Issue a challenge of the configured type. Meta-refresh pages reload
    /// `redirect_path`.
    pub fn issue_challenge(&self, redirect_path: &str) -> Challenge {
        let settings = self.settings.current();
        let token = self.tokens.issue(now_millis());
        match settings.challenge_type {
            ChallengeType::Metarefresh => Challenge::MetaRefresh {
                token,
                delay_secs: settings.metarefresh_delay_secs,
                redirect_path: redirect_path.to_string(),
                cookie_max_age: self.tokens.ttl(),
            },
            ChallengeType::Token => Challenge::Token { token },
        }
    }

    pub fn validate(&self, submission: &Submission) -> Result<()> {
        self.validate_at(submission, now_millis())
    }

    /// Run the checks in order: required headers, token consumption,
    /// honeypot, submit time, then idempotency key. The first failing check
    /// decides the outcome.
    ///
    /// The token, honeypot and (for header tokens) load time must all be
    /// present; the honeypot may be empty. An incomplete submission is an
    /// invalid token and does not burn the token it carries.
    pub fn validate_at(&self, submission: &Submission, now_ms: i64) -> Result<()> {
        let settings = self.settings.current();

        let Some(token) = submission.token.as_deref() else {
            return Err(reject(Rejection::InvalidToken));
        };
        let load_time_missing = submission.token_source == TokenSource::Header
            && submission.load_time_ms.is_none();
        if submission.honeypot.is_none() || load_time_missing {
            debug!(
                honeypot = submission.honeypot.is_some(),
                load_time = submission.load_time_ms.is_some(),
                "Submission missing anti-bot headers"
            );
            return Err(reject(Rejection::InvalidToken));
        }
        let issued_at = self.tokens.consume(token, now_ms).map_err(reject)?;

        if submission.honeypot.as_deref().is_some_and(|h| !h.is_empty()) {
            return Err(reject(Rejection::Honeypot));
        }

        // A client cannot claim the form loaded before its token existed
        let loaded_at = submission
            .load_time_ms
            .map_or(issued_at, |reported| reported.max(issued_at));
        let elapsed = now_ms.saturating_sub(loaded_at);
        let min_submit = i64::try_from(settings.min_submit_time_ms).unwrap_or(i64::MAX);
        if elapsed < min_submit {
            debug!(elapsed_ms = elapsed, min_ms = settings.min_submit_time_ms, "Submission too fast");
            return Err(reject(Rejection::TooFast));
        }

        if let Some(key) = submission.idempotency_key.as_deref() {
            let entry = self.idempotency.entry(key.to_string()).or_insert_with(|| ());
            if !entry.is_fresh() {
                warn!(idempotency_key = %key, "Duplicate request blocked");
                return Err(GatewayError::DuplicateRequest);
            }
        }

        Ok(())
    }

    /// Evict expired tokens and idempotency keys.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let removed = self.tokens.sweep(now_ms);
        self.idempotency.run_pending_tasks();
        removed
    }
}

fn reject(rejection: Rejection) -> GatewayError {
    warn!(reason = rejection.reason(), "Anti-bot rejection");
    GatewayError::AntiBot(rejection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn engine() -> AntiBotEngine {
        AntiBotEngine::new(&AntiBotConfig::default())
    }

    fn submission(token: &FormToken) -> Submission {
        Submission {
            token: Some(token.token.clone()),
            token_source: TokenSource::Header,
            load_time_ms: Some(token.load_time),
            honeypot: Some(String::new()),
            idempotency_key: None,
        }
    }

    fn rejection(result: Result<()>) -> Option<Rejection> {
        match result {
            Err(GatewayError::AntiBot(r)) => Some(r),
            _ => None,
        }
    }

    #[test]
    fn test_valid_submission_accepted_once() {
        let engine = engine();
        let token = engine.issue_form_token();
        let sub = submission(&token);

        assert!(engine.validate_at(&sub, token.load_time + 2_100).is_ok());
        assert_eq!(
            rejection(engine.validate_at(&sub, token.load_time + 2_200)),
            Some(Rejection::ReusedToken)
        );
    }

    #[test]
    fn test_honeypot_rejected() {
        let engine = engine();
        let token = engine.issue_form_token();
        let sub = Submission {
            honeypot: Some("bot@spam.com".into()),
            ..submission(&token)
        };
        assert_eq!(
            rejection(engine.validate_at(&sub, token.load_time + 5_000)),
            Some(Rejection::Honeypot)
        );
    }

    #[test]
    fn test_too_fast_rejected() {
        let engine = engine();
        let token = engine.issue_form_token();
        let sub = submission(&token);
        assert_eq!(
            rejection(engine.validate_at(&sub, token.load_time + 1_999)),
            Some(Rejection::TooFast)
        );

        let token = engine.issue_form_token();
        assert!(engine
            .validate_at(&submission(&token), token.load_time + 2_000)
            .is_ok());
    }

    #[test]
    fn test_earlier_reported_load_time_ignored() {
        let engine = engine();
        let token = engine.issue_form_token();
        let sub = Submission {
            load_time_ms: Some(token.load_time - 60_000),
            ..submission(&token)
        };
        assert_eq!(
            rejection(engine.validate_at(&sub, token.load_time + 100)),
            Some(Rejection::TooFast)
        );
    }

    #[test]
    fn test_missing_and_unknown_token_invalid() {
        let engine = engine();
        assert_eq!(
            rejection(engine.validate_at(&Submission::default(), now_millis())),
            Some(Rejection::InvalidToken)
        );

        let sub = Submission {
            token: Some("invalid-token-12345".into()),
            load_time_ms: Some(now_millis()),
            honeypot: Some(String::new()),
            ..Submission::default()
        };
        assert_eq!(
            rejection(engine.validate_at(&sub, now_millis())),
            Some(Rejection::InvalidToken)
        );
    }

    #[test]
    fn test_incomplete_submission_invalid_and_token_kept() {
        let engine = engine();
        let token = engine.issue_form_token();
        let later = token.load_time + 5_000;

        let token_only = Submission {
            token: Some(token.token.clone()),
            ..Submission::default()
        };
        assert_eq!(
            rejection(engine.validate_at(&token_only, later)),
            Some(Rejection::InvalidToken)
        );

        let no_honeypot = Submission {
            honeypot: None,
            ..submission(&token)
        };
        assert_eq!(
            rejection(engine.validate_at(&no_honeypot, later)),
            Some(Rejection::InvalidToken)
        );

        let no_load_time = Submission {
            load_time_ms: None,
            ..submission(&token)
        };
        assert_eq!(
            rejection(engine.validate_at(&no_load_time, later)),
            Some(Rejection::InvalidToken)
        );

        // None of the above consumed the token
        assert!(engine.validate_at(&submission(&token), later).is_ok());
    }

    #[test]
    fn test_challenge_cookie_needs_no_load_time() {
        let engine = engine();
        let challenge = engine.issue_challenge("/form");
        let sub = Submission {
            token: Some(challenge.token().to_string()),
            token_source: TokenSource::ChallengeCookie,
            honeypot: Some(String::new()),
            ..Submission::default()
        };
        assert_eq!(
            rejection(engine.validate_at(&sub, now_millis())),
            Some(Rejection::TooFast)
        );

        let challenge = engine.issue_challenge("/form");
        let sub = Submission {
            token: Some(challenge.token().to_string()),
            ..sub
        };
        assert!(engine.validate_at(&sub, now_millis() + 2_500).is_ok());
    }

    #[test]
    fn test_huge_min_submit_time_saturates() {
        let engine = AntiBotEngine::new(&AntiBotConfig {
            min_submit_time_ms: u64::MAX,
            ..AntiBotConfig::default()
        });
        let token = engine.issue_form_token();
        assert_eq!(
            rejection(engine.validate_at(&submission(&token), token.load_time + 60_000)),
            Some(Rejection::TooFast)
        );
    }

    #[test]
    fn test_idempotency_key_blocks_duplicate() {
        let engine = engine();
        let first = engine.issue_form_token();
        let second = engine.issue_form_token();
        let key = Some("4b8a3c1e-idem".to_string());

        let sub = Submission {
            idempotency_key: key.clone(),
            ..submission(&first)
        };
        assert!(engine.validate_at(&sub, first.load_time + 2_500).is_ok());

        let sub = Submission {
            idempotency_key: key,
            ..submission(&second)
        };
        assert!(matches!(
            engine.validate_at(&sub, second.load_time + 2_500),
            Err(GatewayError::DuplicateRequest)
        ));
    }

    #[test]
    fn test_applies_only_to_mutating_methods() {
        let engine = engine();
        assert!(engine.applies_to(&Method::POST));
        assert!(engine.applies_to(&Method::PUT));
        assert!(engine.applies_to(&Method::PATCH));
        assert!(!engine.applies_to(&Method::GET));
        assert!(!engine.applies_to(&Method::DELETE));

        engine.settings().set("antibot-enabled", "false").unwrap();
        assert!(!engine.applies_to(&Method::POST));
    }

    #[test]
    fn test_submission_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-form-load-time", HeaderValue::from_static("1700000000000"));
        headers.insert("x-honeypot", HeaderValue::from_static(""));
        headers.insert("x-idempotency-key", HeaderValue::from_static("k-1"));
        headers.insert(
            "cookie",
            HeaderValue::from_static("X-Form-Token-Challenge=from-cookie"),
        );

        let sub = Submission::from_headers(&headers);
        assert_eq!(sub.token.as_deref(), Some("from-cookie"));
        assert_eq!(sub.token_source, TokenSource::ChallengeCookie);
        assert_eq!(sub.load_time_ms, Some(1_700_000_000_000));
        assert_eq!(sub.honeypot.as_deref(), Some(""));
        assert_eq!(sub.idempotency_key.as_deref(), Some("k-1"));

        headers.insert("x-form-token", HeaderValue::from_static("from-header"));
        let sub = Submission::from_headers(&headers);
        assert_eq!(sub.token.as_deref(), Some("from-header"));
        assert_eq!(sub.token_source, TokenSource::Header);

        headers.remove("x-honeypot");
        assert_eq!(Submission::from_headers(&headers).honeypot, None);
    }

    #[test]
    fn test_repeated_honeypot_header_counts_as_filled() {
        let mut headers = HeaderMap::new();
        headers.append("x-honeypot", HeaderValue::from_static(""));
        headers.append("x-honeypot", HeaderValue::from_static("bot@spam.com"));
        assert_eq!(
            Submission::from_headers(&headers).honeypot.as_deref(),
            Some("bot@spam.com")
        );

        let engine = engine();
        let token = engine.issue_form_token();
        let sub = Submission {
            honeypot: Submission::from_headers(&headers).honeypot,
            ..submission(&token)
        };
        assert_eq!(
            rejection(engine.validate_at(&sub, token.load_time + 5_000)),
            Some(Rejection::Honeypot)
        );
    }

    #[test]
    fn test_challenge_follows_settings() {
        let engine = engine();
        let challenge = engine.issue_challenge("/form");
        assert!(matches!(challenge, Challenge::MetaRefresh { delay_secs: 3, .. }));

        engine.settings().set("antibot-challenge-type", "token").unwrap();
        let challenge = engine.issue_challenge("/form");
        assert!(matches!(challenge, Challenge::Token { .. }));

        // Challenge tokens are valid form tokens
        let sub = Submission {
            token: Some(challenge.token().to_string()),
            load_time_ms: Some(now_millis()),
            honeypot: Some(String::new()),
            ..Submission::default()
        };
        assert!(engine.validate_at(&sub, now_millis() + 2_500).is_ok());
    }
}
