//! Traffic analytics: running totals and a bounded log of recent requests.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// One data-plane request as seen by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub client_ip: String,
    pub status_code: u16,
    /// Passed every gate and was forwarded
    pub allowed: bool,
    /// Turned away by a rate limit or anti-bot check
    pub blocked: bool,
    /// Waited in a rule's queue before being forwarded or cancelled
    pub queued: bool,
}

/// Totals since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub allowed: u64,
    pub blocked: u64,
    pub queued: u64,
}

pub struct Analytics {
    allowed: AtomicU64,
    blocked: AtomicU64,
    queued: AtomicU64,
    log: Mutex<VecDeque<TrafficRecord>>,
    capacity: usize,
}

impl Analytics {
    pub fn new(capacity: usize) -> Self {
        Self {
            allowed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            log: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Count a request and append it to the log, evicting the oldest entry
    /// once the log is full.
    pub fn record(&self, record: TrafficRecord) {
        if record.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else if record.blocked {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        }
        if record.queued {
            self.queued.fetch_add(1, Ordering::Relaxed);
        }

        if self.capacity == 0 {
            return;
        }
        let mut log = self.log.lock();
        while log.len() >= self.capacity {
            log.pop_front();
        }
        log.push_back(record);
    }

    pub fn summary(&self) -> Summary {
        Summary {
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
        }
    }

    /// Up to `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<TrafficRecord> {
        self.log.lock().iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, allowed: bool, queued: bool) -> TrafficRecord {
        TrafficRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            method: "GET".into(),
            path: path.into(),
            host: Some("localhost".into()),
            client_ip: "127.0.0.1".into(),
            status_code: if allowed { 200 } else { 429 },
            allowed,
            blocked: !allowed,
            queued,
        }
    }

    #[test]
    fn test_summary_counts() {
        let analytics = Analytics::new(10);
        analytics.record(record("/a", true, false));
        analytics.record(record("/a", true, true));
        analytics.record(record("/a", false, false));

        assert_eq!(
            analytics.summary(),
            Summary {
                allowed: 2,
                blocked: 1,
                queued: 1
            }
        );
    }

    #[test]
    fn test_failures_are_neither_allowed_nor_blocked() {
        let analytics = Analytics::new(10);
        let not_found = TrafficRecord {
            status_code: 404,
            blocked: false,
            ..record("/missing", false, false)
        };
        let bad_gateway = TrafficRecord {
            status_code: 502,
            blocked: false,
            ..record("/down", false, false)
        };
        analytics.record(not_found);
        analytics.record(bad_gateway);
        analytics.record(record("/limited", false, false));

        assert_eq!(
            analytics.summary(),
            Summary {
                allowed: 0,
                blocked: 1,
                queued: 0
            }
        );
        assert_eq!(analytics.recent(10).len(), 3);
    }

    #[test]
    fn test_log_is_bounded_and_newest_first() {
        let analytics = Analytics::new(2);
        analytics.record(record("/1", true, false));
        analytics.record(record("/2", true, false));
        analytics.record(record("/3", true, false));

        let recent = analytics.recent(10);
        let paths: Vec<_> = recent.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/3", "/2"]);
        assert_eq!(analytics.recent(1).len(), 1);
        assert_eq!(analytics.summary().allowed, 3);
    }

    #[test]
    fn test_record_json_shape() {
        let value = serde_json::to_value(record("/x", true, false)).unwrap();
        assert_eq!(value["clientIp"], "127.0.0.1");
        assert_eq!(value["statusCode"], 200);
    }
}
