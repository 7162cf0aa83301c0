//! Logging and tracing configuration for the payout service
//!
//! Structured JSON logs in production, human-readable output in development.
//! Beneficiary identifiers and webhook secrets never reach the logs in clear.

use std::env;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Detect environment from `ENVIRONMENT` (or `ENV`).
    pub fn from_env() -> Self {
        Self::parse(
            &env::var("ENVIRONMENT")
                .or_else(|_| env::var("ENV"))
                .unwrap_or_else(|_| "development".to_string()),
        )
    }

    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        }
    }

    pub fn default_log_level(&self) -> Level {
        match self {
            Self::Development => Level::DEBUG,
            Self::Staging => Level::INFO,
            Self::Production => Level::INFO,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Initialize the tracing subscriber.
///
/// # Environment Variables
/// - `ENVIRONMENT` or `ENV`: "production", "staging" or "development"
/// - `RUST_LOG`: override the filter (e.g. "prize_payout=debug")
/// - `LOG_FORMAT`: force "json" or "pretty"
pub fn init_tracing() {
    let environment = Environment::from_env();

    let use_json = env::var("LOG_FORMAT")
        .map(|f| f.to_lowercase() == "json")
        .unwrap_or_else(|_| environment.is_production());

    let default_directives = format!(
        "{}={},tower_http=debug,axum=info,sqlx=warn,hyper=warn,reqwest=warn",
        env!("CARGO_PKG_NAME").replace('-', "_"),
        environment.default_log_level()
    );
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_directives))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if use_json {
        let json_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_level(true)
            .with_file(false)
            .with_line_number(false)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).init();
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(pretty_layer).init();
    }

    tracing::info!(
        environment = ?environment,
        format = if use_json { "json" } else { "pretty" },
        "Tracing initialized"
    );
}

/// Mask a beneficiary identifier (e.g. an openid) for logging.
///
/// Shows the first 4 and last 4 characters.
///
/// # Examples
/// ```
/// # use prize_payout::logging::mask_beneficiary;
/// assert_eq!(mask_beneficiary("oUpF8uMuAJO_M2pxb1Q9zNjWeS6o"), "oUpF...eS6o");
/// assert_eq!(mask_beneficiary("short"), "****");
/// ```
pub fn mask_beneficiary(beneficiary_id: &str) -> String {
    let chars: Vec<char> = beneficiary_id.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Redact secret-bearing fields from JSON-like text before logging it.
pub fn redact_sensitive_data(text: &str) -> String {
    const SENSITIVE_KEYS: [&str; 10] = [
        "ciphertext",
        "associated_data",
        "nonce",
        "signature",
        "merchant_secret",
        "api_v3_key",
        "openid",
        "secret",
        "token",
        "authorization",
    ];

    let mut result = text.to_string();
    for key in SENSITIVE_KEYS {
        let pattern = format!(r#""{}":\s*"[^"]*""#, key);
        if let Ok(re) = regex::Regex::new(&pattern) {
            result = re
                .replace_all(&result, format!(r#""{}": "[REDACTED]""#, key))
                .to_string();
        }
    }
    result
}

/// Log an operation duration at debug level.
///
/// ```no_run
/// # use prize_payout::log_performance;
/// log_performance!(operation = "provider_submit", duration_ms = 145);
/// ```
#[macro_export]
macro_rules! log_performance {
    ($($key:tt = $value:expr),* $(,)?) => {
        tracing::debug!(
            event_type = "performance",
            $($key = tracing::field::debug(&$value)),*
        );
    };
}
