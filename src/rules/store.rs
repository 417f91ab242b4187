//! In-memory rule table with atomically published snapshots.
//!
//! Admin writes go through a single mutex and rebuild an immutable
//! [`RuleSnapshot`], which is swapped in with `ArcSwap`. Request handling
//! only ever loads the current snapshot, so an in-flight evaluation sees
//! either the old or the new rule set, never a half-applied one.

use arc_swap::ArcSwap;
use axum::http::Method;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::pattern::{glob_match, PathPattern};
use super::rule::{BodyLimitSettings, QueueSettings, Rule, RuleSpec};
use crate::error::{GatewayError, Result};

/// A rule prepared for request matching.
#[derive(Debug)]
pub struct CompiledRule {
    pub rule: Rule,
    pub pattern: PathPattern,
    /// JWT claim names, resolved once per snapshot
    pub claims: Vec<String>,
    pub target: Option<url::Url>,
    methods: Vec<String>,
    hosts: Vec<String>,
    /// Creation order, the last tie-breaker
    seq: u64,
}

impl CompiledRule {
    fn compile(rule: Rule, seq: u64) -> Self {
        let pattern = PathPattern::new(rule.spec.path_pattern.trim());
        let claims = rule
            .spec
            .jwt_claims
            .as_ref()
            .map(|c| c.names())
            .unwrap_or_default();
        let target = rule
            .spec
            .target_uri
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .and_then(|t| url::Url::parse(t).ok());

        Self {
            methods: split_list(rule.spec.methods.as_deref())
                .map(|m| m.to_ascii_uppercase())
                .collect(),
            hosts: split_list(rule.spec.hosts.as_deref())
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            rule,
            pattern,
            claims,
            target,
            seq,
        }
    }

    pub fn id(&self) -> Uuid {
        self.rule.id
    }

    /// Whether this rule applies to the request.
    pub fn matches(&self, method: &Method, host: Option<&str>, path: &str) -> bool {
        if !self.pattern.matches(path) {
            return false;
        }
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m == method.as_str()) {
            return false;
        }
        if !self.hosts.is_empty() {
            let Some(host) = host else { return false };
            let host = host.to_ascii_lowercase();
            if !self.hosts.iter().any(|h| glob_match(h, &host)) {
                return false;
            }
        }
        true
    }
}

fn split_list(raw: Option<&str>) -> impl Iterator<Item = &str> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Immutable view of the active rules.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    version: u64,
    /// Active rules, most specific first
    rules: Vec<Arc<CompiledRule>>,
}

impl RuleSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Arc<CompiledRule>> {
        self.rules.iter().find(|r| r.id() == *id)
    }

    /// Find the single rule that governs a request.
    ///
    /// Longest literal prefix wins; ties go to the lower `priority`, then to
    /// the rule created first.
    pub fn find(&self, method: &Method, host: Option<&str>, path: &str) -> Option<Arc<CompiledRule>> {
        self.rules
            .iter()
            .find(|r| r.matches(method, host, path))
            .cloned()
    }
}

#[derive(Debug)]
struct StoredRule {
    seq: u64,
    rule: Rule,
}

#[derive(Debug, Default)]
struct RuleTable {
    rules: HashMap<Uuid, StoredRule>,
    next_seq: u64,
    version: u64,
}

/// Rule table owned by the admin API.
pub struct RuleStore {
    table: Mutex<RuleTable>,
    snapshot: ArcSwap<RuleSnapshot>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(RuleTable::default()),
            snapshot: ArcSwap::from_pointee(RuleSnapshot::default()),
        }
    }

    /// The current snapshot for request evaluation.
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.snapshot.load_full()
    }

    /// Create a rule and assign its id.
    pub fn create(&self, spec: RuleSpec) -> Result<Rule> {
        spec.validate()?;

        let mut table = self.table.lock();
        let rule = Rule {
            id: Uuid::new_v4(),
            spec,
        };
        let seq = table.next_seq;
        table.next_seq += 1;
        table.rules.insert(
            rule.id,
            StoredRule {
                seq,
                rule: rule.clone(),
            },
        );
        self.publish(&mut table);

        info!(
            rule_id = %rule.id,
            path_pattern = %rule.spec.path_pattern,
            allowed_requests = rule.spec.allowed_requests,
            window_seconds = rule.spec.window_seconds,
            "Created rate limit rule"
        );
        Ok(rule)
    }

    /// All rules in creation order.
    pub fn list(&self) -> Vec<Rule> {
        let table = self.table.lock();
        let mut stored: Vec<&StoredRule> = table.rules.values().collect();
        stored.sort_by_key(|s| s.seq);
        stored.into_iter().map(|s| s.rule.clone()).collect()
    }

    pub fn list_active(&self) -> Vec<Rule> {
        self.list().into_iter().filter(|r| r.spec.active).collect()
    }

    pub fn get(&self, id: Uuid) -> Result<Rule> {
        self.table
            .lock()
            .rules
            .get(&id)
            .map(|s| s.rule.clone())
            .ok_or(GatewayError::RuleNotFound(id))
    }

    /// Replace every field of an existing rule. Creation order is kept.
    pub fn update(&self, id: Uuid, spec: RuleSpec) -> Result<Rule> {
        spec.validate()?;
        self.modify(id, |rule| rule.spec = spec)
    }

    pub fn patch_queue_config(&self, id: Uuid, settings: QueueSettings) -> Result<Rule> {
        self.modify(id, |rule| {
            rule.spec.queue_enabled = settings.queue_enabled;
            rule.spec.max_queue_size = settings.max_queue_size;
            rule.spec.delay_per_request_ms = settings.delay_per_request_ms;
        })
    }

    pub fn patch_body_limit(&self, id: Uuid, settings: BodyLimitSettings) -> Result<Rule> {
        self.modify(id, |rule| {
            rule.spec.body_limit_enabled = settings.body_limit_enabled;
            rule.spec.body_field_path = settings.body_field_path;
            rule.spec.body_limit_type = settings.body_limit_type;
        })
    }

    /// Remove a rule. Its counters disappear on the next sweep.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let mut table = self.table.lock();
        table
            .rules
            .remove(&id)
            .ok_or(GatewayError::RuleNotFound(id))?;
        self.publish(&mut table);
        info!(rule_id = %id, "Deleted rate limit rule");
        Ok(())
    }

    /// Rebuild and republish the snapshot without changing any rule.
    pub fn refresh(&self) -> u64 {
        let mut table = self.table.lock();
        self.publish(&mut table)
    }

    /// Load seed rules from a YAML list of rule specs.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Vec<Rule>> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        self.load_yaml(&contents)
    }

    pub fn load_yaml(&self, yaml: &str) -> Result<Vec<Rule>> {
        let specs: Vec<RuleSpec> = serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse rules: {}", e)))?;
        specs.into_iter().map(|spec| self.create(spec)).collect()
    }

    fn modify<F>(&self, id: Uuid, apply: F) -> Result<Rule>
    where
        F: FnOnce(&mut Rule),
    {
        let mut table = self.table.lock();
        let stored = table
            .rules
            .get_mut(&id)
            .ok_or(GatewayError::RuleNotFound(id))?;

        let mut candidate = stored.rule.clone();
        apply(&mut candidate);
        candidate.id = id;
        candidate.spec.validate()?;
        stored.rule = candidate.clone();

        self.publish(&mut table);
        info!(rule_id = %id, path_pattern = %candidate.spec.path_pattern, "Updated rate limit rule");
        Ok(candidate)
    }

    fn publish(&self, table: &mut RuleTable) -> u64 {
        table.version += 1;

        let mut rules: Vec<Arc<CompiledRule>> = table
            .rules
            .values()
            .filter(|s| s.rule.spec.active)
            .map(|s| Arc::new(CompiledRule::compile(s.rule.clone(), s.seq)))
            .collect();
        rules.sort_by(|a, b| {
            b.pattern
                .specificity()
                .cmp(&a.pattern.specificity())
                .then(a.rule.spec.priority.cmp(&b.rule.spec.priority))
                .then(a.seq.cmp(&b.seq))
        });

        let snapshot = RuleSnapshot {
            version: table.version,
            rules,
        };
        debug!(
            version = snapshot.version,
            active_rules = snapshot.len(),
            "Published rule snapshot"
        );
        self.snapshot.store(Arc::new(snapshot));
        table.version
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}
