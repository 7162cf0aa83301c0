//! Provider Gateway
//!
//! Stateless adapter over the external payment provider. The pipeline only
//! depends on [`PayoutGateway`]; the concrete adapters are the HTTP client in
//! [`wechat`] and the development-mode [`simulated`] gateway.

pub mod crypto;
pub mod simulated;
pub mod types;
pub mod wechat;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use std::fmt;
use std::str::FromStr;

use crate::payouts::models::{has_minor_unit_precision, PayoutIntent};

pub use simulated::SimulatedGateway;
pub use types::{
    EncryptedResource, QueryOutcome, SubmitOutcome, TransferNotification, WebhookEnvelope,
    WebhookHeaders,
};
pub use wechat::WeChatPayGateway;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider configuration error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("malformed provider payload: {0}")]
    Payload(String),
}

#[async_trait]
pub trait PayoutGateway: Send + Sync {
    fn name(&self) -> &'static str;

    fn limits(&self) -> &AmountLimits;

    /// Pure range and precision check; no I/O.
    fn validate_amount(&self, amount: &BigDecimal) -> bool {
        self.limits().contains(amount)
    }

    /// One external submit call. Safe to repeat with the same idempotency
    /// key; provider-side deduplication collapses duplicates.
    async fn submit(&self, intent: &PayoutIntent) -> SubmitOutcome;

    /// Look up a transfer by our idempotency key.
    async fn query(&self, idempotency_key: &str) -> QueryOutcome;

    /// Authenticate a webhook delivery. Must be checked before anything else
    /// is done with the body.
    fn verify_signature(&self, headers: &WebhookHeaders, raw_body: &[u8]) -> bool;

    fn decrypt_payload(
        &self,
        resource: &EncryptedResource,
    ) -> Result<serde_json::Value, ProviderError>;
}

// ============================================================================
// Amount Validation
// ============================================================================

/// Provider-configured payout bounds, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountLimits {
    pub min: BigDecimal,
    pub max: BigDecimal,
}

impl AmountLimits {
    pub fn new(min: BigDecimal, max: BigDecimal) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, amount: &BigDecimal) -> bool {
        has_minor_unit_precision(amount) && *amount >= self.min && *amount <= self.max
    }
}

impl Default for AmountLimits {
    fn default() -> Self {
        Self {
            min: BigDecimal::from_str("0.01").unwrap_or_default(),
            max: BigDecimal::from(200),
        }
    }
}

impl fmt::Display for AmountLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}]",
            self.min.with_scale(2),
            self.max.with_scale(2)
        )
    }
}

// ============================================================================
// Idempotency Keys
// ============================================================================

const IDEMPOTENCY_KEY_PREFIX: &str = "PO";
const IDEMPOTENCY_DIGEST_LEN: usize = 30;

/// Deterministic key from beneficiary, source event and creation timestamp.
///
/// 32 alphanumeric characters, which fits the provider's `out_batch_no`
/// limit.
pub fn build_idempotency_key(
    beneficiary_id: &str,
    source_event_id: &str,
    created_at_millis: i64,
) -> String {
    let digest = crypto::sha256_hex(&format!(
        "{}|{}|{}",
        beneficiary_id, source_event_id, created_at_millis
    ));
    format!(
        "{}{}",
        IDEMPOTENCY_KEY_PREFIX,
        &digest[..IDEMPOTENCY_DIGEST_LEN]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn amount_limits_are_inclusive() {
        let limits = AmountLimits::default();
        assert!(limits.contains(&dec("0.01")));
        assert!(limits.contains(&dec("18.00")));
        assert!(limits.contains(&dec("200.00")));
        assert!(!limits.contains(&dec("0.00")));
        assert!(!limits.contains(&dec("200.01")));
        assert!(!limits.contains(&dec("250.00")));
        assert!(!limits.contains(&dec("1.005")));
        assert_eq!(limits.to_string(), "[0.01, 200.00]");
    }

    #[test]
    fn idempotency_key_is_deterministic() {
        let a = build_idempotency_key("user-1", "draw-1", 1_700_000_000_000);
        let b = build_idempotency_key("user-1", "draw-1", 1_700_000_000_000);
        let c = build_idempotency_key("user-1", "draw-1", 1_700_000_000_001);
        let d = build_idempotency_key("user-2", "draw-1", 1_700_000_000_000);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 32);
        assert!(a.starts_with("PO"));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
