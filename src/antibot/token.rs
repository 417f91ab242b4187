//! Single-use form tokens.

use moka::ops::compute::Op;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use super::Rejection;

/// Token issued to a client before it renders a form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormToken {
    pub token: String,
    /// Issue time, milliseconds since the epoch
    pub load_time: i64,
    /// Seconds until the token stops being accepted
    pub expires_in: u64,
    pub honeypot_field: String,
}

#[derive(Debug, Clone, Copy)]
struct TokenRecord {
    issued_at_ms: i64,
    used: bool,
}

/// Issued tokens and whether each has been consumed.
///
/// Consumed tokens are kept until they expire so a replay is reported as a
/// reuse rather than as an unknown token. The store is bounded: past
/// `capacity` the cache evicts entries, and an evicted token is simply
/// unknown.
pub struct TokenStore {
    tokens: Cache<String, TokenRecord>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        let tokens = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { tokens, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a new random token. Returns the token string.
    pub fn issue(&self, now_ms: i64) -> String {
        let token = Uuid::new_v4().to_string();
        self.tokens.insert(
            token.clone(),
            TokenRecord {
                issued_at_ms: now_ms,
                used: false,
            },
        );
        trace!(token = %token, "Issued form token");
        token
    }

    /// Mark a token used, exactly once.
    ///
    /// Compute calls on one key run one at a time, so of any number of
    /// concurrent attempts only one succeeds. Returns the issue time.
    pub fn consume(&self, token: &str, now_ms: i64) -> std::result::Result<i64, Rejection> {
        let mut outcome = Err(Rejection::InvalidToken);
        self.tokens
            .entry(token.to_string())
            .and_compute_with(|entry| {
                let Some(entry) = entry else {
                    return Op::Nop;
                };
                let record = *entry.value();
                if record.used {
                    outcome = Err(Rejection::ReusedToken);
                    return Op::Nop;
                }
                if self.is_expired(record.issued_at_ms, now_ms) {
                    debug!("Form token expired");
                    return Op::Remove;
                }

                outcome = Ok(record.issued_at_ms);
                Op::Put(TokenRecord {
                    used: true,
                    ..record
                })
            });
        outcome
    }

    /// Evict expired tokens, used or not. Returns how many were removed.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let expired: Vec<_> = self
            .tokens
            .iter()
            .filter(|(_, record)| self.is_expired(record.issued_at_ms, now_ms))
            .map(|(token, _)| token)
            .collect();
        for token in &expired {
            self.tokens.invalidate(token.as_str());
        }
        self.tokens.run_pending_tasks();
        expired.len()
    }

    /// Tokens currently held, after pending evictions have been applied.
    pub fn entry_count(&self) -> u64 {
        self.tokens.run_pending_tasks();
        self.tokens.entry_count()
    }

    fn is_expired(&self, issued_at_ms: i64, now_ms: i64) -> bool {
        now_ms.saturating_sub(issued_at_ms) > self.ttl.as_millis() as i64
    }
}
