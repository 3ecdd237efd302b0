//! Worker configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use common::Money;
use domain::PricingPolicy;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables, optionally loaded from a `.env` file:
/// - `HOST`, `PORT`: bind address of the operational endpoints (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `DATABASE_URL`: PostgreSQL url; unset selects the in-memory store
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default 10)
/// - `NATS_URL`: NATS server; unset selects the in-memory publisher
/// - `SCHEDULER_INTERVAL_SECS`: lifecycle pass interval (default 30)
/// - `SESSION_SWEEP_INTERVAL_SECS`: guest session sweep interval (default 3600)
/// - `GUEST_SESSION_TTL_HOURS`: guest session lifetime (default 24)
/// - `SIDE_EFFECT_TIMEOUT_MS`: bound on each side effect (default 2000)
/// - `TAX_RATE_BP`: tax rate in basis points (default 1000)
/// - `SHIPPING_FLAT_CENTS`: flat shipping fee (default 1000)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub nats_url: Option<String>,
    pub scheduler_interval: Duration,
    pub session_sweep_interval: Duration,
    pub guest_session_ttl: chrono::Duration,
    pub side_effect_timeout: Duration,
    pub pricing: PricingPolicy,
}

impl Config {
    /// Loads configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is not an error
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            host: text("HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "PORT", defaults.port)?,
            log_level: text("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse(&lookup, "LOG_FORMAT", defaults.log_format)?,
            database_url: text("DATABASE_URL"),
            database_max_connections: parse(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            nats_url: text("NATS_URL"),
            scheduler_interval: Duration::from_secs(parse(
                &lookup,
                "SCHEDULER_INTERVAL_SECS",
                defaults.scheduler_interval.as_secs(),
            )?),
            session_sweep_interval: Duration::from_secs(parse(
                &lookup,
                "SESSION_SWEEP_INTERVAL_SECS",
                defaults.session_sweep_interval.as_secs(),
            )?),
            guest_session_ttl: chrono::Duration::hours(parse(
                &lookup,
                "GUEST_SESSION_TTL_HOURS",
                defaults.guest_session_ttl.num_hours(),
            )?),
            side_effect_timeout: Duration::from_millis(parse(
                &lookup,
                "SIDE_EFFECT_TIMEOUT_MS",
                defaults.side_effect_timeout.as_millis() as u64,
            )?),
            pricing: PricingPolicy {
                tax_rate_bp: parse(&lookup, "TAX_RATE_BP", defaults.pricing.tax_rate_bp)?,
                shipping_flat: Money::from_cents(parse(
                    &lookup,
                    "SHIPPING_FLAT_CENTS",
                    defaults.pricing.shipping_flat.cents(),
                )?),
            },
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        _ => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            database_max_connections: 10,
            nats_url: None,
            scheduler_interval: fulfillment::DEFAULT_LIFECYCLE_INTERVAL,
            session_sweep_interval: fulfillment::DEFAULT_SESSION_SWEEP_INTERVAL,
            guest_session_ttl: chrono::Duration::hours(domain::DEFAULT_SESSION_TTL_HOURS),
            side_effect_timeout: fulfillment::DEFAULT_EMIT_TIMEOUT,
            pricing: PricingPolicy::default(),
        }
    }
}
