//! Core rate limiter implementation.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use super::counter::WindowCounter;
use super::key::CounterKey;
use super::queue::{QueueTicket, RequestQueue};
use crate::rules::{Rule, RuleSnapshot};

/// Admission decision for one request.
#[derive(Debug)]
pub enum Decision {
    /// Within the limit; forward immediately
    Allow { remaining: u64 },
    /// Over the limit but holding a queue slot; forward after the ticket releases
    Queue(QueueTicket),
    /// Over the limit with no queue capacity
    Reject {
        /// The rule queues, but its queue is full
        queue_full: bool,
        /// Time until the identifier's window closes
        retry_after: Duration,
    },
}

/// The core rate limiter that manages counters and the request queue.
///
/// Counters live in a sharded map; each increment-and-check runs while
/// holding that key's entry, so two concurrent requests can never both take
/// the last slot, and unrelated identifiers never contend on one lock.
pub struct RateLimiter {
    /// Counters indexed by rule and identifier
    counters: DashMap<CounterKey, WindowCounter>,
    queue: Arc<RequestQueue>,
}

impl RateLimiter {
    pub fn new(queue: Arc<RequestQueue>) -> Self {
        Self {
            counters: DashMap::new(),
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    /// Count a request against `rule` for `identifier` and decide what
    /// happens to it.
    pub fn admit(&self, rule: &Rule, identifier: &str, now: Instant) -> Decision {
        let key = CounterKey::new(rule.id, identifier);
        let limit = u64::from(rule.spec.allowed_requests);
        let window = rule.window();

        // The entry guard is released at the end of this block, before the
        // queue is touched.
        let status = {
            let mut counter = self.counters.entry(key.clone()).or_insert_with(|| {
                debug!(key = %key, limit, window_secs = window.as_secs(), "Creating counter");
                WindowCounter::new(now)
            });
            counter.hit(now, window, limit)
        };

        trace!(
            key = %key,
            count = status.count,
            limit,
            within_limit = status.within_limit,
            "Checked rate limit"
        );

        if status.within_limit {
            return Decision::Allow {
                remaining: status.remaining,
            };
        }

        if rule.spec.queue_enabled {
            let max_size = rule.spec.max_queue_size as usize;
            if let Some(ticket) =
                self.queue
                    .try_enqueue(rule.id, max_size, rule.delay_per_request(), now)
            {
                debug!(key = %key, delay_ms = ticket.delay().as_millis() as u64, "Rate limit exceeded, queued");
                return Decision::Queue(ticket);
            }
            debug!(key = %key, "Rate limit exceeded, queue full");
            return Decision::Reject {
                queue_full: true,
                retry_after: status.reset_in,
            };
        }

        debug!(key = %key, "Rate limit exceeded");
        Decision::Reject {
            queue_full: false,
            retry_after: status.reset_in,
        }
    }

    /// Current count for an identifier, or `None` if it has no counter.
    pub fn counter_value(&self, rule: &Rule, identifier: &str, now: Instant) -> Option<u64> {
        let key = CounterKey::new(rule.id, identifier);
        self.counters
            .get(&key)
            .map(|c| c.current_count(now, rule.window()))
    }

    /// Drop counters whose window has closed or whose rule is gone.
    /// Returns how many were removed.
    pub fn sweep(&self, now: Instant, rules: &RuleSnapshot) -> usize {
        let before = self.counters.len();
        self.counters.retain(|key, counter| {
            rules
                .get(&key.rule_id)
                .is_some_and(|compiled| !counter.is_expired(now, compiled.rule.window()))
        });
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed, remaining = self.counters.len(), "Swept counters");
        }
        removed
    }

    /// Drop every counter of one rule.
    pub fn forget_rule(&self, rule_id: &Uuid) {
        self.counters.retain(|key, _| &key.rule_id != rule_id);
    }

    /// Get the number of active counters.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Arc::new(RequestQueue::new()))
    }
}
