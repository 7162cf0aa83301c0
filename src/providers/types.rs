//! Provider-facing types
//!
//! Outcomes are closed variants so the worker's state machine handles every
//! case exhaustively.

use http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Result of a single submit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The provider took the transfer. `settled` is true when the response
    /// already reports final success, otherwise confirmation arrives later by
    /// webhook or query.
    Accepted { reference: String, settled: bool },
    /// Deterministic rejection; retrying cannot help.
    Rejected { reason: String },
    /// Timeout, 5xx, rate limit or network failure.
    TransientError { reason: String },
}

/// Result of querying a transfer by idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Succeeded { reference: String },
    Failed { reference: Option<String>, reason: String },
    Processing,
    NotFound,
    TransientError { reason: String },
}

pub const SIGNATURE_HEADER: &str = "wechatpay-signature";
pub const TIMESTAMP_HEADER: &str = "wechatpay-timestamp";
pub const NONCE_HEADER: &str = "wechatpay-nonce";
pub const SERIAL_HEADER: &str = "wechatpay-serial";

/// Authentication headers of an inbound webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookHeaders {
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
    pub serial: Option<String>,
}

impl WebhookHeaders {
    /// Extract the signature headers; `None` when any required one is missing.
    pub fn from_header_map(headers: &HeaderMap) -> Option<Self> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Some(Self {
            signature: get(SIGNATURE_HEADER)?,
            timestamp: get(TIMESTAMP_HEADER)?,
            nonce: get(NONCE_HEADER)?,
            serial: get(SERIAL_HEADER),
        })
    }

    /// The byte string the provider signs: `timestamp\nnonce\nbody\n`.
    pub fn signed_message(&self, raw_body: &[u8]) -> Vec<u8> {
        let mut message =
            Vec::with_capacity(self.timestamp.len() + self.nonce.len() + raw_body.len() + 3);
        message.extend_from_slice(self.timestamp.as_bytes());
        message.push(b'\n');
        message.extend_from_slice(self.nonce.as_bytes());
        message.push(b'\n');
        message.extend_from_slice(raw_body);
        message.push(b'\n');
        message
    }
}

/// Encrypted `resource` block of a webhook notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedResource {
    pub algorithm: String,
    pub ciphertext: String,
    #[serde(default)]
    pub associated_data: Option<String>,
    pub nonce: String,
    #[serde(default)]
    pub original_type: Option<String>,
}

/// Outer, unencrypted webhook envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    pub event_type: String,
    pub resource: EncryptedResource,
}

pub const EVENT_TRANSFER_SUCCESS: &str = "TRANSFER.SUCCESS";
pub const EVENT_TRANSFER_CLOSED: &str = "TRANSFER.CLOSED";

/// Decrypted transfer notification.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferNotification {
    /// Our idempotency key, echoed back by the provider.
    pub out_batch_no: String,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub batch_status: Option<String>,
    #[serde(default)]
    pub close_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn webhook_headers_require_signature_timestamp_and_nonce() {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("c2ln"));
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_static("1700000000"));
        assert!(WebhookHeaders::from_header_map(&headers).is_none());

        headers.insert(NONCE_HEADER, HeaderValue::from_static("abc"));
        let parsed = WebhookHeaders::from_header_map(&headers).unwrap();
        assert_eq!(parsed.nonce, "abc");
        assert!(parsed.serial.is_none());
        assert_eq!(parsed.signed_message(b"{}"), b"1700000000\nabc\n{}\n".to_vec());
    }
}
