//! Runtime-adjustable anti-bot settings.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::{AntiBotConfig, ChallengeType};
use crate::error::{GatewayError, Result};

pub const KEY_ENABLED: &str = "antibot-enabled";
pub const KEY_MIN_SUBMIT_TIME: &str = "antibot-min-submit-time";
pub const KEY_HONEYPOT_FIELD: &str = "antibot-honeypot-field";
pub const KEY_CHALLENGE_TYPE: &str = "antibot-challenge-type";
pub const KEY_METAREFRESH_DELAY: &str = "antibot-metarefresh-delay";

/// The anti-bot settings in effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntiBotSettings {
    pub enabled: bool,
    pub min_submit_time_ms: u64,
    pub honeypot_field: String,
    pub challenge_type: ChallengeType,
    pub metarefresh_delay_secs: u64,
}

impl From<&AntiBotConfig> for AntiBotSettings {
    fn from(config: &AntiBotConfig) -> Self {
        Self {
            enabled: config.enabled,
            min_submit_time_ms: config.min_submit_time_ms,
            honeypot_field: config.honeypot_field.clone(),
            challenge_type: config.challenge_type,
            metarefresh_delay_secs: config.metarefresh_delay_secs,
        }
    }
}

/// One setting as shown by the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEntry {
    pub config_key: String,
    pub config_value: String,
}

impl ConfigEntry {
    fn new(key: &str, value: impl ToString) -> Self {
        Self {
            config_key: key.to_string(),
            config_value: value.to_string(),
        }
    }
}

/// Settings readable lock-free by the request path and written by the admin API.
pub struct SettingsStore {
    defaults: AntiBotSettings,
    current: ArcSwap<AntiBotSettings>,
    /// Serializes writers so concurrent updates to different keys both land
    write: Mutex<()>,
}

impl SettingsStore {
    pub fn new(defaults: AntiBotSettings) -> Self {
        Self {
            current: ArcSwap::from_pointee(defaults.clone()),
            defaults,
            write: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Arc<AntiBotSettings> {
        self.current.load_full()
    }

    /// All settings as key/value pairs.
    pub fn entries(&self) -> Vec<ConfigEntry> {
        let current = self.current();
        KEYS.iter()
            .filter_map(|key| entry_of(&current, key))
            .collect()
    }

    /// Update one setting from its string form. Returns the stored value in
    /// the same form `entries` reports it.
    pub fn set(&self, key: &str, value: &str) -> Result<ConfigEntry> {
        let value = value.trim();
        let _guard = self.write.lock();
        let mut next = AntiBotSettings::clone(&self.current.load());

        match key {
            KEY_ENABLED => next.enabled = parse_bool(key, value)?,
            KEY_MIN_SUBMIT_TIME => next.min_submit_time_ms = parse_number(key, value)?,
            KEY_HONEYPOT_FIELD => {
                if value.is_empty() {
                    return Err(GatewayError::Validation(format!("{} must not be empty", key)));
                }
                next.honeypot_field = value.to_string();
            }
            KEY_CHALLENGE_TYPE => {
                next.challenge_type = match value.to_ascii_lowercase().as_str() {
                    "metarefresh" => ChallengeType::Metarefresh,
                    "token" => ChallengeType::Token,
                    _ => {
                        return Err(GatewayError::Validation(format!(
                            "{} must be 'metarefresh' or 'token', got '{}'",
                            key, value
                        )))
                    }
                }
            }
            KEY_METAREFRESH_DELAY => next.metarefresh_delay_secs = parse_number(key, value)?,
            _ => {
                return Err(GatewayError::Validation(format!(
                    "Unknown config key: {}",
                    key
                )))
            }
        }

        let entry = entry_of(&next, key)
            .ok_or_else(|| GatewayError::Validation(format!("Unknown config key: {}", key)))?;
        self.current.store(Arc::new(next));
        info!(key = %key, value = %entry.config_value, "Updated anti-bot setting");
        Ok(entry)
    }

    /// Restore one setting to its startup value.
    pub fn reset(&self, key: &str) -> Result<ConfigEntry> {
        let value = match key {
            KEY_ENABLED => self.defaults.enabled.to_string(),
            KEY_MIN_SUBMIT_TIME => self.defaults.min_submit_time_ms.to_string(),
            KEY_HONEYPOT_FIELD => self.defaults.honeypot_field.clone(),
            KEY_CHALLENGE_TYPE => challenge_name(self.defaults.challenge_type).to_string(),
            KEY_METAREFRESH_DELAY => self.defaults.metarefresh_delay_secs.to_string(),
            _ => {
                return Err(GatewayError::Validation(format!(
                    "Unknown config key: {}",
                    key
                )))
            }
        };
        self.set(key, &value)
    }
}

const KEYS: [&str; 5] = [
    KEY_ENABLED,
    KEY_MIN_SUBMIT_TIME,
    KEY_HONEYPOT_FIELD,
    KEY_CHALLENGE_TYPE,
    KEY_METAREFRESH_DELAY,
];

fn entry_of(settings: &AntiBotSettings, key: &str) -> Option<ConfigEntry> {
    let entry = match key {
        KEY_ENABLED => ConfigEntry::new(key, settings.enabled),
        KEY_MIN_SUBMIT_TIME => ConfigEntry::new(key, settings.min_submit_time_ms),
        KEY_HONEYPOT_FIELD => ConfigEntry::new(key, &settings.honeypot_field),
        KEY_CHALLENGE_TYPE => ConfigEntry::new(key, challenge_name(settings.challenge_type)),
        KEY_METAREFRESH_DELAY => ConfigEntry::new(key, settings.metarefresh_delay_secs),
        _ => return None,
    };
    Some(entry)
}

fn challenge_name(challenge: ChallengeType) -> &'static str {
    match challenge {
        ChallengeType::Metarefresh => "metarefresh",
        ChallengeType::Token => "token",
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    value
        .to_ascii_lowercase()
        .parse()
        .map_err(|_| GatewayError::Validation(format!("{} must be true or false, got '{}'", key, value)))
}

/// Non-negative and small enough to compare against signed millisecond clocks.
fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .ok()
        .filter(|n| i64::try_from(*n).is_ok())
        .ok_or_else(|| {
            GatewayError::Validation(format!(
                "{} must be an integer between 0 and {}, got '{}'",
                key,
                i64::MAX,
                value
            ))
        })
}
