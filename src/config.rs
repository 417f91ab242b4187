//! Configuration management for Ratewarden.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{GatewayError, Result};

/// Environment variable prefix; nesting uses `__` (e.g. `RATEWARDEN__SERVER__GATEWAY_ADDR`).
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend client configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Anti-bot defaults (runtime-adjustable through the admin API)
    #[serde(default)]
    pub antibot: AntiBotConfig,

    #[serde(default)]
    pub analytics: AnalyticsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Data-plane address (proxied routes and token endpoints)
    #[serde(default = "default_gateway_addr")]
    pub gateway_addr: SocketAddr,

    /// Admin API address
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,

    /// Largest request body buffered for identifier extraction and forwarding
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Take the client IP from the first `X-Forwarded-For` entry
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            gateway_addr: default_gateway_addr(),
            admin_addr: default_admin_addr(),
            max_body_bytes: default_max_body_bytes(),
            trust_forwarded_for: false,
        }
    }
}

fn default_gateway_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

/// Backend client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Whole-request timeout; exceeding it yields 504
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Optional YAML file of rules loaded at startup
    pub rules_path: Option<String>,

    /// How often expired counters, tokens and idle queues are swept
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    30
}

/// Challenge page flavour served by `/api/tokens/challenge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeType {
    /// HTML page with a meta-refresh tag
    Metarefresh,
    /// Bare JSON token for script-driven clients
    Token,
}

/// Anti-bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiBotConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Submissions faster than this after the form loaded are rejected
    #[serde(default = "default_min_submit_time")]
    pub min_submit_time_ms: u64,

    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Most tokens held at once; the least useful are evicted past this
    #[serde(default = "default_token_capacity")]
    pub token_capacity: u64,

    #[serde(default = "default_honeypot_field")]
    pub honeypot_field: String,

    #[serde(default = "default_challenge_type")]
    pub challenge_type: ChallengeType,

    #[serde(default = "default_metarefresh_delay")]
    pub metarefresh_delay_secs: u64,

    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_secs: u64,

    #[serde(default = "default_idempotency_capacity")]
    pub idempotency_capacity: u64,
}

impl Default for AntiBotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_submit_time_ms: default_min_submit_time(),
            token_ttl_secs: default_token_ttl(),
            token_capacity: default_token_capacity(),
            honeypot_field: default_honeypot_field(),
            challenge_type: default_challenge_type(),
            metarefresh_delay_secs: default_metarefresh_delay(),
            idempotency_ttl_secs: default_idempotency_ttl(),
            idempotency_capacity: default_idempotency_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_min_submit_time() -> u64 {
    2_000
}

fn default_token_ttl() -> u64 {
    600
}

fn default_token_capacity() -> u64 {
    100_000
}

fn default_honeypot_field() -> String {
    "_hp_email".to_string()
}

fn default_challenge_type() -> ChallengeType {
    ChallengeType::Metarefresh
}

fn default_metarefresh_delay() -> u64 {
    3
}

fn default_idempotency_ttl() -> u64 {
    3_600
}

fn default_idempotency_capacity() -> u64 {
    100_000
}

/// Analytics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Number of recent traffic records kept in memory
    #[serde(default = "default_traffic_log_capacity")]
    pub traffic_log_capacity: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            traffic_log_capacity: default_traffic_log_capacity(),
        }
    }
}

fn default_traffic_log_capacity() -> usize {
    10_000
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl GatewayConfig {
    /// Load configuration from an optional file layered under `RATEWARDEN__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatewayConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_yaml::from_str(yaml).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_body_bytes == 0 {
            return Err(GatewayError::Config(
                "server.max_body_bytes must be positive".into(),
            ));
        }
        if self.antibot.token_ttl_secs == 0 {
            return Err(GatewayError::Config(
                "antibot.token_ttl_secs must be positive".into(),
            ));
        }
        if self.antibot.token_capacity == 0 {
            return Err(GatewayError::Config(
                "antibot.token_capacity must be positive".into(),
            ));
        }
        if i64::try_from(self.antibot.min_submit_time_ms).is_err() {
            return Err(GatewayError::Config(
                "antibot.min_submit_time_ms is out of range".into(),
            ));
        }
        if self.rate_limiting.sweep_interval_secs == 0 {
            return Err(GatewayError::Config(
                "rate_limiting.sweep_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}
