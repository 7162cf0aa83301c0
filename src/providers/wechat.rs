//! WeChat Pay style batch-transfer adapter
//!
//! Submits single-line transfer batches keyed by the intent's idempotency key
//! (`out_batch_no`), signs outbound requests with HMAC-SHA256, verifies
//! inbound webhooks with the platform's Ed25519 key and decrypts their
//! AES-256-GCM resources with the API v3 key.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::crypto::{self, AEAD_ALGORITHM};
use super::types::{EncryptedResource, QueryOutcome, SubmitOutcome, WebhookHeaders};
use super::{AmountLimits, PayoutGateway, ProviderError};
use crate::clock::Clock;
use crate::config::ProviderConfig;
use crate::payouts::models::PayoutIntent;

const TRANSFER_BATCHES_PATH: &str = "/v3/transfer/batches";
const AUTH_SCHEME: &str = "PAYOUT-HMAC-SHA256";
const DEFAULT_REMARK: &str = "prize payout";

pub struct WeChatPayGateway {
    http: Client,
    base_url: String,
    app_id: String,
    merchant_id: String,
    merchant_secret: String,
    api_v3_key: Vec<u8>,
    platform_public_key: Vec<u8>,
    signature_max_skew_secs: i64,
    limits: AmountLimits,
    clock: Arc<dyn Clock>,
}

impl WeChatPayGateway {
    pub fn new(
        config: &ProviderConfig,
        limits: AmountLimits,
        clock: Arc<dyn Clock>,
        request_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        if config.base_url.is_empty() {
            return Err(ProviderError::Config("provider.base_url is required".into()));
        }
        if config.merchant_id.is_empty() || config.merchant_secret.is_empty() {
            return Err(ProviderError::Config(
                "provider.merchant_id and provider.merchant_secret are required".into(),
            ));
        }
        if config.api_v3_key.len() != 32 {
            return Err(ProviderError::Config(
                "provider.api_v3_key must be exactly 32 bytes".into(),
            ));
        }
        let platform_public_key = hex::decode(&config.platform_public_key)
            .ok()
            .filter(|k| k.len() == 32)
            .ok_or_else(|| {
                ProviderError::Config(
                    "provider.platform_public_key must be a hex Ed25519 key".into(),
                )
            })?;

        let http = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            merchant_id: config.merchant_id.clone(),
            merchant_secret: config.merchant_secret.clone(),
            api_v3_key: config.api_v3_key.as_bytes().to_vec(),
            platform_public_key,
            signature_max_skew_secs: config.signature_max_skew_secs,
            limits,
            clock,
        })
    }

    fn authorization(&self, method: &Method, path: &str, body: &str) -> Result<String, ProviderError> {
        let timestamp = self.clock.now().timestamp();
        let nonce = Uuid::new_v4().simple().to_string();
        let message = crypto::request_signing_message(method.as_str(), path, timestamp, &nonce, body);
        let signature = crypto::hmac_sha256_hex(&self.merchant_secret, &message)?;

        Ok(format!(
            r#"{} mchid="{}",nonce_str="{}",timestamp="{}",signature="{}""#,
            AUTH_SCHEME, self.merchant_id, nonce, timestamp, signature
        ))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<(StatusCode, String), ProviderError> {
        let payload = body.unwrap_or_default();
        let authorization = self.authorization(&method, path, &payload)?;

        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("authorization", authorization)
            .header("accept", "application/json");
        if !payload.is_empty() {
            request = request
                .header("content-type", "application/json")
                .body(payload);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        Ok((status, text))
    }
}

#[async_trait]
impl PayoutGateway for WeChatPayGateway {
    fn name(&self) -> &'static str {
        "wechat_pay"
    }

    fn limits(&self) -> &AmountLimits {
        &self.limits
    }

    async fn submit(&self, intent: &PayoutIntent) -> SubmitOutcome {
        let Some(amount_fen) = intent.amount_minor_units() else {
            return SubmitOutcome::Rejected {
                reason: format!("amount {} is not expressible in minor units", intent.amount),
            };
        };
        let remark = intent.memo.as_deref().unwrap_or(DEFAULT_REMARK);

        let body = json!({
            "appid": self.app_id,
            "out_batch_no": intent.idempotency_key,
            "batch_name": DEFAULT_REMARK,
            "batch_remark": remark,
            "total_amount": amount_fen,
            "total_num": 1,
            "transfer_detail_list": [{
                "out_detail_no": format!("{}_001", intent.idempotency_key),
                "transfer_amount": amount_fen,
                "transfer_remark": remark,
                "openid": intent.beneficiary_id,
            }],
        });

        debug!(
            intent_id = %intent.id,
            out_batch_no = %intent.idempotency_key,
            amount_fen,
            "Submitting transfer batch"
        );

        match self
            .send(Method::POST, TRANSFER_BATCHES_PATH, Some(body.to_string()))
            .await
        {
            Ok((status, text)) => classify_submit(status, &text),
            Err(e) => SubmitOutcome::TransientError {
                reason: format!("provider request failed: {}", e),
            },
        }
    }

    async fn query(&self, idempotency_key: &str) -> QueryOutcome {
        let path = format!(
            "{}/out-batch-no/{}?need_query_detail=false",
            TRANSFER_BATCHES_PATH, idempotency_key
        );
        match self.send(Method::GET, &path, None).await {
            Ok((status, text)) => classify_query(status, &text),
            Err(e) => QueryOutcome::TransientError {
                reason: format!("provider request failed: {}", e),
            },
        }
    }

    fn verify_signature(&self, headers: &WebhookHeaders, raw_body: &[u8]) -> bool {
        let Ok(timestamp) = headers.timestamp.parse::<i64>() else {
            warn!("Webhook timestamp is not numeric");
            return false;
        };
        let skew = (self.clock.now().timestamp() - timestamp).abs();
        if skew > self.signature_max_skew_secs {
            warn!(skew_secs = skew, "Webhook timestamp outside allowed window");
            return false;
        }
        let Ok(signature) = BASE64.decode(&headers.signature) else {
            warn!("Webhook signature is not base64");
            return false;
        };

        crypto::verify_ed25519(
            &self.platform_public_key,
            &headers.signed_message(raw_body),
            &signature,
        )
    }

    fn decrypt_payload(
        &self,
        resource: &EncryptedResource,
    ) -> Result<serde_json::Value, ProviderError> {
        if resource.algorithm != AEAD_ALGORITHM {
            return Err(ProviderError::Crypto(format!(
                "unsupported algorithm {}",
                resource.algorithm
            )));
        }
        let plaintext = crypto::decrypt_aes_256_gcm(
            &self.api_v3_key,
            &resource.nonce,
            resource.associated_data.as_deref().unwrap_or_default(),
            &resource.ciphertext,
        )?;
        serde_json::from_slice(&plaintext).map_err(|e| ProviderError::Payload(e.to_string()))
    }
}

// ============================================================================
// Response Classification
// ============================================================================

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    batch_id: String,
    #[serde(default)]
    batch_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    transfer_batch: QueryBatch,
}

#[derive(Debug, Deserialize)]
struct QueryBatch {
    batch_id: String,
    batch_status: String,
    #[serde(default)]
    close_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn error_reason(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { code, message }) => format!(
            "{} {}: {}",
            status.as_u16(),
            code.unwrap_or_else(|| "UNKNOWN".to_string()),
            message.unwrap_or_default()
        ),
        Err(_) => format!("{} {}", status.as_u16(), body.chars().take(200).collect::<String>()),
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub(crate) fn classify_submit(status: StatusCode, body: &str) -> SubmitOutcome {
    if status.is_success() {
        return match serde_json::from_str::<SubmitResponse>(body) {
            Ok(resp) => SubmitOutcome::Accepted {
                settled: resp.batch_status.as_deref() == Some("FINISHED"),
                reference: resp.batch_id,
            },
            Err(e) => SubmitOutcome::TransientError {
                reason: format!("unreadable submit response: {}", e),
            },
        };
    }
    if is_transient(status) {
        SubmitOutcome::TransientError {
            reason: error_reason(status, body),
        }
    } else {
        SubmitOutcome::Rejected {
            reason: error_reason(status, body),
        }
    }
}

pub(crate) fn classify_query(status: StatusCode, body: &str) -> QueryOutcome {
    if status == StatusCode::NOT_FOUND {
        return QueryOutcome::NotFound;
    }
    if !status.is_success() {
        return QueryOutcome::TransientError {
            reason: error_reason(status, body),
        };
    }
    match serde_json::from_str::<QueryResponse>(body) {
        Ok(QueryResponse { transfer_batch }) => match transfer_batch.batch_status.as_str() {
            "FINISHED" => QueryOutcome::Succeeded {
                reference: transfer_batch.batch_id,
            },
            "CLOSED" => QueryOutcome::Failed {
                reference: Some(transfer_batch.batch_id),
                reason: transfer_batch
                    .close_reason
                    .unwrap_or_else(|| "batch closed by provider".to_string()),
            },
            _ => QueryOutcome::Processing,
        },
        Err(e) => QueryOutcome::TransientError {
            reason: format!("unreadable query response: {}", e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use aes_gcm::aead::{Aead, KeyInit, Payload};
    use aes_gcm::{Aes256Gcm, Nonce};
    use chrono::{TimeZone, Utc};
    use ed25519_dalek::{Signer, SigningKey};

    const API_V3_KEY: &str = "0123456789abcdef0123456789abcdef";

    fn gateway(clock: Arc<ManualClock>) -> (WeChatPayGateway, SigningKey) {
        let signing_key = SigningKey::from_bytes(&[9u8; 32]);
        let config = ProviderConfig {
            base_url: "https://provider.invalid".into(),
            app_id: "wx-app".into(),
            merchant_id: "1900000001".into(),
            merchant_secret: "merchant-secret".into(),
            api_v3_key: API_V3_KEY.into(),
            platform_public_key: hex::encode(signing_key.verifying_key().to_bytes()),
            signature_max_skew_secs: 300,
            dev_mode: false,
        };
        let gateway = WeChatPayGateway::new(
            &config,
            AmountLimits::default(),
            clock,
            Duration::from_secs(5),
        )
        .unwrap();
        (gateway, signing_key)
    }

    fn signed_headers(key: &SigningKey, timestamp: i64, body: &[u8]) -> WebhookHeaders {
        let mut headers = WebhookHeaders {
            signature: String::new(),
            timestamp: timestamp.to_string(),
            nonce: "n0nce".into(),
            serial: Some("serial-1".into()),
        };
        let signature = key.sign(&headers.signed_message(body));
        headers.signature = BASE64.encode(signature.to_bytes());
        headers
    }

    #[test]
    fn rejects_incomplete_configuration() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let config = ProviderConfig::default();
        assert!(matches!(
            WeChatPayGateway::new(&config, AmountLimits::default(), clock, Duration::from_secs(1)),
            Err(ProviderError::Config(_))
        ));
    }

    #[test]
    fn verifies_fresh_signed_webhooks_only() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let (gateway, key) = gateway(clock.clone());
        let body = br#"{"event_type":"TRANSFER.SUCCESS"}"#;

        let headers = signed_headers(&key, now.timestamp(), body);
        assert!(gateway.verify_signature(&headers, body));
        assert!(!gateway.verify_signature(&headers, br#"{"event_type":"TRANSFER.CLOSED"}"#));

        let stale = signed_headers(&key, now.timestamp() - 301, body);
        assert!(!gateway.verify_signature(&stale, body));

        let forged = signed_headers(&SigningKey::from_bytes(&[1u8; 32]), now.timestamp(), body);
        assert!(!gateway.verify_signature(&forged, body));
    }

    #[test]
    fn decrypts_transfer_resource() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (gateway, _) = gateway(clock);

        let cipher = Aes256Gcm::new_from_slice(API_V3_KEY.as_bytes()).unwrap();
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(b"abcdefghijkl"),
                Payload {
                    msg: br#"{"out_batch_no":"PO123","batch_id":"B1"}"#,
                    aad: b"mch_payment",
                },
            )
            .unwrap();
        let resource = EncryptedResource {
            algorithm: AEAD_ALGORITHM.into(),
            ciphertext: BASE64.encode(ciphertext),
            associated_data: Some("mch_payment".into()),
            nonce: "abcdefghijkl".into(),
            original_type: Some("mch_payment".into()),
        };

        let value = gateway.decrypt_payload(&resource).unwrap();
        assert_eq!(value["out_batch_no"], "PO123");

        let mut wrong = resource.clone();
        wrong.algorithm = "AES_128_CBC".into();
        assert!(gateway.decrypt_payload(&wrong).is_err());
    }

    #[test]
    fn submit_responses_are_classified() {
        assert_eq!(
            classify_submit(StatusCode::OK, r#"{"out_batch_no":"PO1","batch_id":"B1","batch_status":"ACCEPTED"}"#),
            SubmitOutcome::Accepted {
                reference: "B1".into(),
                settled: false
            }
        );
        assert!(matches!(
            classify_submit(StatusCode::BAD_REQUEST, r#"{"code":"PARAM_ERROR","message":"bad openid"}"#),
            SubmitOutcome::Rejected { reason } if reason.contains("PARAM_ERROR")
        ));
        assert!(matches!(
            classify_submit(StatusCode::TOO_MANY_REQUESTS, "{}"),
            SubmitOutcome::TransientError { .. }
        ));
        assert!(matches!(
            classify_submit(StatusCode::BAD_GATEWAY, "upstream down"),
            SubmitOutcome::TransientError { .. }
        ));
    }

    #[test]
    fn query_responses_are_classified() {
        assert_eq!(classify_query(StatusCode::NOT_FOUND, ""), QueryOutcome::NotFound);
        assert_eq!(
            classify_query(
                StatusCode::OK,
                r#"{"transfer_batch":{"batch_id":"B1","batch_status":"FINISHED"}}"#
            ),
            QueryOutcome::Succeeded {
                reference: "B1".into()
            }
        );
        assert!(matches!(
            classify_query(
                StatusCode::OK,
                r#"{"transfer_batch":{"batch_id":"B1","batch_status":"CLOSED","close_reason":"OVERDUE_CLOSE"}}"#
            ),
            QueryOutcome::Failed { reason, .. } if reason == "OVERDUE_CLOSE"
        ));
        assert_eq!(
            classify_query(
                StatusCode::OK,
                r#"{"transfer_batch":{"batch_id":"B1","batch_status":"PROCESSING"}}"#
            ),
            QueryOutcome::Processing
        );
    }
}
