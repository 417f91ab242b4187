//! Counter key generation.

use uuid::Uuid;

/// A key that uniquely identifies a counter.
///
/// Counters are scoped to a rule, so the same identifier under two rules
/// never shares quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The rule this counter belongs to
    pub rule_id: Uuid,
    /// The resolved identifier (IP, claims, header, cookie or body value)
    pub identifier: String,
}

impl CounterKey {
    pub fn new(rule_id: Uuid, identifier: &str) -> Self {
        Self {
            rule_id,
            identifier: identifier.to_string(),
        }
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.rule_id, self.identifier)
    }
}
