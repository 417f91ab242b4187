//! Rate limit rule model.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

/// Default separator placed between JWT claim values.
pub const DEFAULT_CLAIM_SEPARATOR: &str = ":";

/// How an extracted identifier relates to the caller's IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    /// The extracted value is the whole key
    #[default]
    ReplaceIp,
    /// The key becomes `<ip>:<value>`
    CombineWithIp,
}

/// Ordered JWT claim names.
///
/// Accepted either as a JSON array or as a string holding a JSON-encoded
/// array, and echoed back in the form it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimNames {
    List(Vec<String>),
    Encoded(String),
}

impl ClaimNames {
    /// The claim names in order. A string that is not a JSON array is read
    /// as a comma-separated list.
    pub fn names(&self) -> Vec<String> {
        match self {
            ClaimNames::List(names) => names.clone(),
            ClaimNames::Encoded(raw) => serde_json::from_str::<Vec<String>>(raw)
                .unwrap_or_else(|_| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                }),
        }
    }
}

/// A rule as written through the admin API, without its server-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    pub path_pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_uri: Option<String>,
    pub allowed_requests: u32,
    pub window_seconds: u32,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Lower wins between equally specific patterns
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub queue_enabled: bool,
    #[serde(default)]
    pub max_queue_size: u32,
    #[serde(default)]
    pub delay_per_request_ms: u64,

    #[serde(default)]
    pub jwt_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_claims: Option<ClaimNames>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_claim_separator: Option<String>,

    #[serde(default)]
    pub header_limit_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_limit_type: Option<LimitType>,

    #[serde(default)]
    pub cookie_limit_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_limit_type: Option<LimitType>,

    #[serde(default)]
    pub body_limit_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_field_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_limit_type: Option<LimitType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_content_type: Option<String>,

    /// Comma-separated methods; empty matches any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<String>,
    /// Comma-separated host globs; empty matches any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<String>,
}

fn default_active() -> bool {
    true
}

impl RuleSpec {
    /// A minimal active rule, mostly useful in tests and seed files.
    pub fn new(path_pattern: &str, target_uri: &str, allowed_requests: u32, window_seconds: u32) -> Self {
        Self {
            path_pattern: path_pattern.to_string(),
            target_uri: Some(target_uri.to_string()),
            allowed_requests,
            window_seconds,
            active: true,
            priority: 0,
            queue_enabled: false,
            max_queue_size: 0,
            delay_per_request_ms: 0,
            jwt_enabled: false,
            jwt_claims: None,
            jwt_claim_separator: None,
            header_limit_enabled: false,
            header_name: None,
            header_limit_type: None,
            cookie_limit_enabled: false,
            cookie_name: None,
            cookie_limit_type: None,
            body_limit_enabled: false,
            body_field_path: None,
            body_limit_type: None,
            body_content_type: None,
            methods: None,
            hosts: None,
        }
    }

    /// Check the rule before it is stored. Invalid rules are rejected, never clamped.
    pub fn validate(&self) -> Result<()> {
        if !self.path_pattern.starts_with('/') {
            return Err(GatewayError::Validation(format!(
                "pathPattern must start with '/': {}",
                self.path_pattern
            )));
        }
        if self.allowed_requests == 0 {
            return Err(GatewayError::Validation(
                "allowedRequests must be positive".into(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(GatewayError::Validation(
                "windowSeconds must be positive".into(),
            ));
        }

        match self.target_uri.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            Some(target) => {
                let url = url::Url::parse(target).map_err(|e| {
                    GatewayError::Validation(format!("targetUri is not a valid URL: {}", e))
                })?;
                if !matches!(url.scheme(), "http" | "https") || !url.has_host() {
                    return Err(GatewayError::Validation(format!(
                        "targetUri must be an absolute http(s) URL: {}",
                        target
                    )));
                }
            }
            None if self.active && self.path_pattern.trim() != "/**" => {
                return Err(GatewayError::Validation(
                    "targetUri is required for active rules".into(),
                ));
            }
            None => {}
        }

        Ok(())
    }
}

/// A stored rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    #[serde(flatten)]
    pub spec: RuleSpec,
}

impl Rule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.spec.window_seconds))
    }

    pub fn delay_per_request(&self) -> Duration {
        Duration::from_millis(self.spec.delay_per_request_ms)
    }

    pub fn claim_separator(&self) -> &str {
        self.spec
            .jwt_claim_separator
            .as_deref()
            .unwrap_or(DEFAULT_CLAIM_SEPARATOR)
    }
}

/// Partial update of a rule's queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSettings {
    pub queue_enabled: bool,
    #[serde(default)]
    pub max_queue_size: u32,
    #[serde(default)]
    pub delay_per_request_ms: u64,
}

/// Partial update of a rule's body-limit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyLimitSettings {
    pub body_limit_enabled: bool,
    #[serde(default)]
    pub body_field_path: Option<String>,
    #[serde(default)]
    pub body_limit_type: Option<LimitType>,
}
