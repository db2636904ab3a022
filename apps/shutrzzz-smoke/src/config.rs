//! Environment-backed configuration for `shutrzzz-smoke`.

use std::{env, error::Error, fmt};

use client_core::{ClientConfig, UserIdentity};

const DEFAULT_USER: &str = "demo-user";
const DEFAULT_EVENT_LEAD_SECS: u64 = 3;
const MAX_EVENT_LEAD_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// Identity the scripted session signs in as.
    pub user: UserIdentity,
    /// Runtime tuning forwarded to `spawn_runtime`.
    pub client: ClientConfig,
    /// How far in the future the seeded demo event starts.
    pub event_lead_secs: u64,
}

impl SmokeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let user = optional_trimmed_env("SHUTRZZZ_USER", &mut lookup)
            .unwrap_or_else(|| DEFAULT_USER.to_owned());
        let user = UserIdentity::new(user.as_str()).map_err(|err| ConfigError::InvalidValue {
            key: "SHUTRZZZ_USER",
            value: user.clone(),
            reason: err.message,
        })?;

        let retry_max_attempts = parse_optional_u32("SHUTRZZZ_RETRY_MAX_ATTEMPTS", &mut lookup)?;
        let retry_initial_delay_ms =
            parse_optional_u64("SHUTRZZZ_RETRY_INITIAL_DELAY_MS", &mut lookup)?;
        let retry_max_delay_ms = parse_optional_u64("SHUTRZZZ_RETRY_MAX_DELAY_MS", &mut lookup)?;
        let countdown_tick_ms = parse_optional_u64("SHUTRZZZ_COUNTDOWN_TICK_MS", &mut lookup)?;
        let rollback_on_failure = parse_optional_bool("SHUTRZZZ_ROLLBACK_ON_FAILURE", &mut lookup)?;
        let event_lead_secs = parse_optional_u64("SHUTRZZZ_EVENT_LEAD_SECS", &mut lookup)?
            .unwrap_or(DEFAULT_EVENT_LEAD_SECS);

        if retry_max_attempts == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "SHUTRZZZ_RETRY_MAX_ATTEMPTS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if event_lead_secs > MAX_EVENT_LEAD_SECS {
            return Err(ConfigError::InvalidValue {
                key: "SHUTRZZZ_EVENT_LEAD_SECS",
                value: event_lead_secs.to_string(),
                reason: format!("must be at most {MAX_EVENT_LEAD_SECS} (one year)"),
            });
        }
        if countdown_tick_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "SHUTRZZZ_COUNTDOWN_TICK_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            user,
            client: ClientConfig {
                retry_max_attempts,
                retry_initial_delay_ms,
                retry_max_delay_ms,
                countdown_tick_ms,
                rollback_on_failure,
            },
            event_lead_secs,
        })
    }
}

/// Errors produced while parsing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u32<F>(key: &'static str, lookup: &mut F) -> Result<Option<u32>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_bool<F>(key: &'static str, lookup: &mut F) -> Result<Option<bool>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean (true/false)".to_owned(),
        }),
    }
}
