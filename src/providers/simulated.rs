//! Development-mode gateway
//!
//! Settles every transfer immediately without touching the network. Webhook
//! resources are accepted as unencrypted base64 JSON.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::info;

use super::types::{EncryptedResource, QueryOutcome, SubmitOutcome, WebhookHeaders};
use super::{AmountLimits, PayoutGateway, ProviderError};
use crate::payouts::models::PayoutIntent;

pub struct SimulatedGateway {
    limits: AmountLimits,
}

impl SimulatedGateway {
    pub fn new(limits: AmountLimits) -> Self {
        Self { limits }
    }

    fn reference_for(idempotency_key: &str) -> String {
        format!("SIM-{}", idempotency_key)
    }
}

#[async_trait]
impl PayoutGateway for SimulatedGateway {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn limits(&self) -> &AmountLimits {
        &self.limits
    }

    async fn submit(&self, intent: &PayoutIntent) -> SubmitOutcome {
        info!(
            intent_id = %intent.id,
            amount = %intent.amount,
            "Simulated transfer settled"
        );
        SubmitOutcome::Accepted {
            reference: Self::reference_for(&intent.idempotency_key),
            settled: true,
        }
    }

    async fn query(&self, idempotency_key: &str) -> QueryOutcome {
        QueryOutcome::Succeeded {
            reference: Self::reference_for(idempotency_key),
        }
    }

    fn verify_signature(&self, _headers: &WebhookHeaders, _raw_body: &[u8]) -> bool {
        true
    }

    fn decrypt_payload(
        &self,
        resource: &EncryptedResource,
    ) -> Result<serde_json::Value, ProviderError> {
        let plaintext = BASE64
            .decode(&resource.ciphertext)
            .map_err(|e| ProviderError::Crypto(e.to_string()))?;
        serde_json::from_slice(&plaintext).map_err(|e| ProviderError::Payload(e.to_string()))
    }
}
