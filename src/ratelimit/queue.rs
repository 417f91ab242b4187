//! Per-rule delay queue.
//!
//! A request that is over its limit on a queue-enabled rule gets a
//! [`QueueTicket`] instead of a rejection. Tickets are paced so consecutive
//! releases for one rule are at least `delayPerRequestMs` apart. Waiting is a
//! timer, not a task: the request's own future sleeps until its release time
//! and the slot is given back when the ticket is dropped, whether the request
//! was released, cancelled by shutdown or abandoned by a disconnecting client.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

#[derive(Debug, Default)]
struct QueueState {
    /// Tickets handed out and not yet dropped
    depth: usize,
    /// Release time of the most recently issued ticket
    last_release: Option<Instant>,
}

/// The queue of a single rule. Capacity is shared by all identifiers.
#[derive(Debug, Default)]
struct RuleQueue {
    state: Mutex<QueueState>,
}

/// Per-rule queues plus the shutdown switch that cancels all waiters.
pub struct RequestQueue {
    queues: DashMap<Uuid, Arc<RuleQueue>>,
    shutdown: watch::Sender<bool>,
}

impl RequestQueue {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queues: DashMap::new(),
            shutdown,
        }
    }

    /// Reserve a place in the rule's queue.
    ///
    /// Returns `None` when the queue already holds `max_size` requests; a full
    /// queue is a rejection, never a blocking wait.
    pub fn try_enqueue(
        &self,
        rule_id: Uuid,
        max_size: usize,
        delay: Duration,
        now: Instant,
    ) -> Option<QueueTicket> {
        let queue = self.queues.entry(rule_id).or_default().clone();

        let (release_at, position) = {
            let mut state = queue.state.lock();
            if state.depth >= max_size {
                debug!(rule_id = %rule_id, depth = state.depth, max_size, "Queue full");
                return None;
            }

            let base = state.last_release.map_or(now, |last| last.max(now));
            let release_at = base + delay;
            state.last_release = Some(release_at);
            state.depth += 1;
            (release_at, state.depth)
        };

        trace!(
            rule_id = %rule_id,
            position,
            delay_ms = (release_at - now).as_millis() as u64,
            "Request queued"
        );

        Some(QueueTicket {
            queue,
            enqueued_at: now,
            release_at,
            position,
            shutdown: self.shutdown.subscribe(),
        })
    }

    /// Number of requests currently waiting on a rule.
    pub fn depth(&self, rule_id: &Uuid) -> usize {
        self.queues
            .get(rule_id)
            .map(|q| q.state.lock().depth)
            .unwrap_or(0)
    }

    /// Cancel every waiting ticket. Tickets waited on afterwards fail at once.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        debug!(queues = self.queues.len(), "Request queue closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Drop queues with no outstanding tickets. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.queues.len();
        self.queues
            .retain(|_, queue| Arc::strong_count(queue) > 1 || queue.state.lock().depth > 0);
        before - self.queues.len()
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A reserved place in a rule's queue.
#[derive(Debug)]
pub struct QueueTicket {
    queue: Arc<RuleQueue>,
    enqueued_at: Instant,
    release_at: Instant,
    position: usize,
    shutdown: watch::Receiver<bool>,
}

impl QueueTicket {
    /// Delay between enqueue and release.
    pub fn delay(&self) -> Duration {
        self.release_at.saturating_duration_since(self.enqueued_at)
    }

    /// 1-based position at enqueue time.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Suspend until release. Fails with `ShuttingDown` if the queue is
    /// closed first; dropping the future cancels the wait.
    pub async fn wait(mut self) -> Result<Duration> {
        if *self.shutdown.borrow() {
            return Err(GatewayError::ShuttingDown);
        }

        let release_at = self.release_at;
        let delay = self.delay();
        tokio::select! {
            _ = tokio::time::sleep_until(release_at) => Ok(delay),
            _ = self.shutdown.wait_for(|closed| *closed) => Err(GatewayError::ShuttingDown),
        }
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.last_release = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(1000);

    #[tokio::test(start_paused = true)]
    async fn test_ticket_waits_for_delay() {
        let queue = RequestQueue::new();
        let rule = Uuid::new_v4();
        let start = Instant::now();

        let ticket = queue.try_enqueue(rule, 1, DELAY, start).unwrap();
        assert_eq!(ticket.position(), 1);
        assert_eq!(ticket.delay(), DELAY);
        assert_eq!(queue.depth(&rule), 1);

        let waited = ticket.wait().await.unwrap();
        assert_eq!(waited, DELAY);
        assert!(Instant::now() >= start + DELAY);
        assert_eq!(queue.depth(&rule), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_pending_until_release() {
        let queue = RequestQueue::new();
        let rule = Uuid::new_v4();
        let ticket = queue.try_enqueue(rule, 1, DELAY, Instant::now()).unwrap();

        let mut wait = tokio_test::task::spawn(ticket.wait());
        tokio_test::assert_pending!(wait.poll());

        tokio::time::advance(DELAY / 2).await;
        tokio_test::assert_pending!(wait.poll());

        tokio::time::advance(DELAY / 2).await;
        tokio_test::assert_ready_ok!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_rejects() {
        let queue = RequestQueue::new();
        let rule = Uuid::new_v4();
        let now = Instant::now();

        let _held = queue.try_enqueue(rule, 1, DELAY, now).unwrap();
        assert!(queue.try_enqueue(rule, 1, DELAY, now).is_none());

        // Zero capacity never admits
        assert!(queue.try_enqueue(Uuid::new_v4(), 0, DELAY, now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_releases_are_paced() {
        let queue = RequestQueue::new();
        let rule = Uuid::new_v4();
        let now = Instant::now();

        let first = queue.try_enqueue(rule, 3, DELAY, now).unwrap();
        let second = queue.try_enqueue(rule, 3, DELAY, now).unwrap();
        let third = queue.try_enqueue(rule, 3, DELAY, now).unwrap();

        assert_eq!(first.delay(), DELAY);
        assert_eq!(second.delay(), DELAY * 2);
        assert_eq!(third.delay(), DELAY * 3);
        assert_eq!(third.position(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_frees_slot_and_resets_pacing() {
        let queue = RequestQueue::new();
        let rule = Uuid::new_v4();
        let now = Instant::now();

        let ticket = queue.try_enqueue(rule, 1, DELAY, now).unwrap();
        drop(ticket);
        assert_eq!(queue.depth(&rule), 0);

        let again = queue.try_enqueue(rule, 1, DELAY, now).unwrap();
        assert_eq!(again.delay(), DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_waiters() {
        let queue = Arc::new(RequestQueue::new());
        let rule = Uuid::new_v4();
        let ticket = queue
            .try_enqueue(rule, 1, Duration::from_secs(60), Instant::now())
            .unwrap();

        let waiter = tokio::spawn(ticket.wait());
        tokio::task::yield_now().await;
        queue.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(GatewayError::ShuttingDown)));
        assert!(queue.is_closed());
        assert_eq!(queue.depth(&rule), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_busy_queues() {
        let queue = RequestQueue::new();
        let busy = Uuid::new_v4();
        let idle = Uuid::new_v4();
        let now = Instant::now();

        let _ticket = queue.try_enqueue(busy, 1, DELAY, now).unwrap();
        drop(queue.try_enqueue(idle, 1, DELAY, now));

        assert_eq!(queue.sweep(), 1);
        assert_eq!(queue.depth(&busy), 1);
    }
}
