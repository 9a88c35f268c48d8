//! Settings read from environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be set")]
    Missing { key: &'static str },

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Concurrency and rate caps for one remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSettings {
    pub max_concurrency: usize,
    pub max_rps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    pub poll_interval: Duration,
    /// Runs driven in parallel by one dispatcher.
    pub worker_concurrency: usize,
    pub max_attempts: u32,
    pub chunk_size: usize,
    /// Running runs without a heartbeat for this long are reaped.
    pub stale_after: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5000),
            worker_concurrency: 2,
            max_attempts: 5,
            chunk_size: 50,
            stale_after: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    pub embedding: String,
    pub sanitizer: String,
    pub call_timeout: Duration,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            embedding: "http://localhost:8081/embed".to_string(),
            sanitizer: "http://localhost:8082/sanitize".to_string(),
            call_timeout: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: Option<String>,
    pub embed: LimitSettings,
    pub sanitize: LimitSettings,
    pub dispatch: DispatchSettings,
    pub endpoints: EndpointSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            embed: LimitSettings {
                max_concurrency: 8,
                max_rps: 5,
            },
            sanitize: LimitSettings {
                max_concurrency: 4,
                max_rps: 2,
            },
            dispatch: DispatchSettings::default(),
            endpoints: EndpointSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup; unset keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            database_url: get("DATABASE_URL"),
            embed: LimitSettings {
                max_concurrency: parse_or(get("EMBED_MAX_CONCURRENCY"), "EMBED_MAX_CONCURRENCY", defaults.embed.max_concurrency)?,
                max_rps: parse_or(get("EMBED_MAX_RPS"), "EMBED_MAX_RPS", defaults.embed.max_rps)?,
            },
            sanitize: LimitSettings {
                max_concurrency: parse_or(
                    get("SANITIZE_MAX_CONCURRENCY"),
                    "SANITIZE_MAX_CONCURRENCY",
                    defaults.sanitize.max_concurrency,
                )?,
                max_rps: parse_or(get("SANITIZE_MAX_RPS"), "SANITIZE_MAX_RPS", defaults.sanitize.max_rps)?,
            },
            dispatch: DispatchSettings {
                poll_interval: Duration::from_millis(parse_or(
                    get("WORKER_POLL_INTERVAL"),
                    "WORKER_POLL_INTERVAL",
                    defaults.dispatch.poll_interval.as_millis() as u64,
                )?),
                worker_concurrency: parse_or(
                    get("WORKER_CONCURRENCY"),
                    "WORKER_CONCURRENCY",
                    defaults.dispatch.worker_concurrency,
                )?,
                max_attempts: parse_or(get("RUN_MAX_ATTEMPTS"), "RUN_MAX_ATTEMPTS", defaults.dispatch.max_attempts)?,
                chunk_size: parse_or(get("RUN_CHUNK_SIZE"), "RUN_CHUNK_SIZE", defaults.dispatch.chunk_size)?,
                stale_after: Duration::from_secs(parse_or(
                    get("RUN_STALE_AFTER_SECS"),
                    "RUN_STALE_AFTER_SECS",
                    defaults.dispatch.stale_after.as_secs(),
                )?),
            },
            endpoints: EndpointSettings {
                embedding: get("EMBEDDING_ENDPOINT").unwrap_or(defaults.endpoints.embedding),
                sanitizer: get("SANITIZER_ENDPOINT").unwrap_or(defaults.endpoints.sanitizer),
                call_timeout: Duration::from_millis(parse_or(
                    get("REMOTE_CALL_TIMEOUT_MS"),
                    "REMOTE_CALL_TIMEOUT_MS",
                    defaults.endpoints.call_timeout.as_millis() as u64,
                )?),
            },
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing { key: "DATABASE_URL" })
    }
}

/// Parses a positive number, falling back to `default` when unset.
fn parse_or<T>(raw: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::Invalid { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.embed.max_rps, 5);
        assert_eq!(settings.dispatch.poll_interval, Duration::from_secs(5));
        assert!(settings.require_database_url().is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let settings = Settings::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/media"),
            ("EMBED_MAX_CONCURRENCY", "16"),
            ("SANITIZE_MAX_RPS", "1"),
            ("WORKER_POLL_INTERVAL", "250"),
            ("RUN_MAX_ATTEMPTS", "3"),
            ("RUN_STALE_AFTER_SECS", "60"),
            ("EMBEDDING_ENDPOINT", "https://embed.internal/v1"),
        ]))
        .unwrap();

        assert_eq!(settings.require_database_url().unwrap(), "postgres://localhost/media");
        assert_eq!(settings.embed.max_concurrency, 16);
        assert_eq!(settings.sanitize.max_rps, 1);
        assert_eq!(settings.dispatch.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.dispatch.max_attempts, 3);
        assert_eq!(settings.dispatch.stale_after, Duration::from_secs(60));
        assert_eq!(settings.endpoints.embedding, "https://embed.internal/v1");
    }

    #[test]
    fn rejects_garbage_and_zero() {
        let err = Settings::from_lookup(lookup(&[("EMBED_MAX_RPS", "fast")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "EMBED_MAX_RPS",
                value: "fast".to_string()
            }
        );
        assert!(Settings::from_lookup(lookup(&[("WORKER_CONCURRENCY", "0")])).is_err());
    }
}
