//! Application configuration
//!
//! Defaults are layered under environment variables with the `config` crate.
//! Nested keys use a double underscore, e.g. `APP_PAYOUT__MAX_AMOUNT=200.00`
//! or `APP_PROVIDER__DEV_MODE=true`. `DATABASE_URL` and `REDIS_URL` are read
//! unprefixed.

use bigdecimal::BigDecimal;
use serde::Deserialize;
use std::time::Duration;

const ENV_PREFIX: &str = "APP";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
    pub payout: PayoutSettings,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayoutSettings {
    pub min_amount: BigDecimal,
    pub max_amount: BigDecimal,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_ceiling_ms: u64,
    pub concurrency: usize,
    pub job_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub scheduler_interval_ms: u64,
    pub orphan_after_secs: u64,
    pub stale_submission_secs: u64,
    pub query_backoff_ceiling_secs: u64,
    pub high_value_threshold: BigDecimal,
    pub allow_manual_attempt_reset: bool,
}

impl PayoutSettings {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub merchant_id: String,
    #[serde(default)]
    pub merchant_secret: String,
    #[serde(default)]
    pub api_v3_key: String,
    #[serde(default)]
    pub platform_public_key: String,
    #[serde(default = "default_signature_skew")]
    pub signature_max_skew_secs: i64,
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_signature_skew() -> i64 {
    300
}

impl AppConfig {
    /// Load defaults overridden by the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let source = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__");
        Self::build(source)
    }

    fn build(source: config::Environment) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("payout.min_amount", "0.01")?
            .set_default("payout.max_amount", "200.00")?
            .set_default("payout.max_attempts", 3)?
            .set_default("payout.retry_base_ms", 5_000)?
            .set_default("payout.retry_ceiling_ms", 3_600_000)?
            .set_default("payout.concurrency", 5)?
            .set_default("payout.job_timeout_ms", 30_000)?
            .set_default("payout.poll_interval_ms", 1_000)?
            .set_default("payout.scheduler_interval_ms", 5_000)?
            .set_default("payout.orphan_after_secs", 120)?
            .set_default("payout.stale_submission_secs", 600)?
            .set_default("payout.query_backoff_ceiling_secs", 3_600)?
            .set_default("payout.high_value_threshold", "10.00")?
            .set_default("payout.allow_manual_attempt_reset", false)?
            .set_default("provider.signature_max_skew_secs", 300)?
            .set_default("provider.dev_mode", false)?
            .add_source(source)
            .set_override_option("database_url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("redis_url", std::env::var("REDIS_URL").ok())?
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let payout = &self.payout;
        if payout.min_amount <= BigDecimal::from(0) {
            return Err(ConfigError::Invalid("payout.min_amount must be positive".into()));
        }
        if payout.min_amount > payout.max_amount {
            return Err(ConfigError::Invalid(
                "payout.min_amount must not exceed payout.max_amount".into(),
            ));
        }
        if payout.max_attempts == 0 {
            return Err(ConfigError::Invalid("payout.max_attempts must be at least 1".into()));
        }
        if payout.concurrency == 0 {
            return Err(ConfigError::Invalid("payout.concurrency must be at least 1".into()));
        }
        if payout.retry_base_ms == 0 || payout.retry_ceiling_ms < payout.retry_base_ms {
            return Err(ConfigError::Invalid(
                "payout.retry_ceiling_ms must be at least payout.retry_base_ms (> 0)".into(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
