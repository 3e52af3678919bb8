//! Environment-driven configuration (spec §6, §9 "process-wide mutable
//! state"). Collected once into a single typed, validated struct rather than
//! scattered `env::var` calls scattered through handlers — this service has
//! materially more required configuration than the teacher's `PORT`/
//! `CORS_ORIGINS` pair, so it earns its own module (shaped like the
//! `GatewayConfig` seen elsewhere in the pack).

use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub database_url: String,
    pub redis_url: String,
    pub policy_base_url: String,
    pub anti_replay_enabled: bool,
    pub anti_replay_ttl_seconds: u64,
    pub log_level: String,
    pub log_format: LogFormat,
    pub port: u16,
    pub shutdown_grace: Duration,
    pub redis_timeout: Duration,
    pub policy_timeout: Duration,
    pub audit_timeout: Duration,
    pub healthcheck_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl GatewayConfig {
    /// Load from environment, applying the defaults named in spec §6 and
    /// failing fast (rather than at the first request) if something required
    /// is missing or malformed.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .context("DATABASE_URL is required (Postgres DSN for the audit log)")?;

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://redis:6379/0".to_string());
        url::Url::parse(&redis_url)
            .map_err(|e| anyhow!("REDIS_URL is not a valid URL: {e}"))?;

        let policy_base_url =
            env::var("POLICY_ENGINE_URL").unwrap_or_else(|_| "http://opa:8181".to_string());
        url::Url::parse(&policy_base_url)
            .map_err(|e| anyhow!("POLICY_ENGINE_URL is not a valid URL: {e}"))?;

        let anti_replay_enabled = env_bool("ANTI_REPLAY_ENABLED", true)?;
        let anti_replay_ttl_seconds = env_u64("ANTI_REPLAY_TTL_SECONDS", 86_400)?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = match env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string()).as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let port = env_u64("PORT", 8080)?
            .try_into()
            .map_err(|_| anyhow!("PORT does not fit in u16"))?;
        let shutdown_grace =
            Duration::from_secs(env_u64("SERVER_SHUTDOWN_GRACE_SECONDS", 10)?);

        Ok(Self {
            database_url,
            redis_url,
            policy_base_url,
            anti_replay_enabled,
            anti_replay_ttl_seconds,
            log_level,
            log_format,
            port,
            shutdown_grace,
            redis_timeout: Duration::from_millis(200),
            policy_timeout: Duration::from_millis(350),
            audit_timeout: Duration::from_secs(2),
            healthcheck_timeout: Duration::from_secs(2),
        })
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(anyhow!("{key} has an invalid boolean value: {other}")),
        },
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map_err(|e| anyhow!("{key} is not a valid integer: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_rejects_garbage() {
        std::env::set_var("TEST_BOOL_FLAG", "maybe");
        assert!(env_bool("TEST_BOOL_FLAG", true).is_err());
        std::env::remove_var("TEST_BOOL_FLAG");
    }

    #[test]
    fn env_bool_defaults_when_unset() {
        std::env::remove_var("TEST_BOOL_UNSET");
        assert_eq!(env_bool("TEST_BOOL_UNSET", true).unwrap(), true);
    }
}
