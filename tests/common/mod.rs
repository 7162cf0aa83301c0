//! Shared fixtures for the payout integration tests
//!
//! Everything runs against the in-memory ledger and queue with a manual
//! clock. The scripted gateway signs and encrypts webhooks the same way the
//! real provider does (Ed25519 over `timestamp\nnonce\nbody\n`, resource
//! encrypted with AES-256-GCM).

#![allow(dead_code)]

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bigdecimal::BigDecimal;
use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::{Signer, SigningKey};
use http::{HeaderMap, HeaderValue};
use serde_json::json;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use prize_payout::clock::{Clock, ManualClock};
use prize_payout::error::PayoutError;
use prize_payout::payouts::{
    AuditAction, MemoryLedger, PayoutAuditEntry, PayoutId, PayoutIntent, PayoutLedger,
    PayoutStateMachine,
};
use prize_payout::providers::crypto::{self, AEAD_ALGORITHM};
use prize_payout::providers::types::{
    NONCE_HEADER, SERIAL_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use prize_payout::providers::{
    AmountLimits, EncryptedResource, PayoutGateway, ProviderError, QueryOutcome, SubmitOutcome,
    WebhookHeaders,
};
use prize_payout::queue::{JobQueue, MemoryQueue};
use prize_payout::services::{InitiatePayout, InitiatorConfig, PayoutInitiator, WebhookReconciler};
use prize_payout::workers::{
    PayoutProcessor, PayoutProcessorConfig, RetryPolicy, RetryScheduler, RetrySchedulerConfig,
};

pub const API_V3_KEY: &[u8; 32] = b"0123456789abcdef0123456789abcdef";
const PLATFORM_SIGNING_SEED: [u8; 32] = [7u8; 32];
const RESOURCE_NONCE: &str = "a1b2c3d4e5f6";
const RESOURCE_AAD: &str = "transfer";

pub const JOB_TIMEOUT: Duration = Duration::from_millis(50);

// ============================================================================
// Scripted Gateway
// ============================================================================

/// One scripted response to a submit call.
#[derive(Debug, Clone)]
pub enum ScriptedSubmit {
    Respond(SubmitOutcome),
    /// Never answers within the job timeout.
    Hang,
}

/// Gateway whose submit and query answers are queued up by the test.
/// An empty submit script settles the transfer synchronously; an empty
/// query script reports `Processing`.
pub struct ScriptedGateway {
    limits: AmountLimits,
    platform_key: SigningKey,
    submits: Mutex<VecDeque<ScriptedSubmit>>,
    queries: Mutex<VecDeque<QueryOutcome>>,
    submitted_keys: Mutex<Vec<String>>,
    queried_keys: Mutex<Vec<String>>,
    submit_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    finished_submits: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            limits: AmountLimits::default(),
            platform_key: SigningKey::from_bytes(&PLATFORM_SIGNING_SEED),
            submits: Mutex::new(VecDeque::new()),
            queries: Mutex::new(VecDeque::new()),
            submitted_keys: Mutex::new(Vec::new()),
            queried_keys: Mutex::new(Vec::new()),
            submit_delay: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            finished_submits: AtomicUsize::new(0),
        }
    }

    /// Every submit sleeps for `delay` before answering.
    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = Some(delay);
    }

    /// Highest number of submit calls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn finished_submits(&self) -> usize {
        self.finished_submits.load(Ordering::SeqCst)
    }

    /// Idempotency keys of every query call, in call order.
    pub fn queried_keys(&self) -> Vec<String> {
        self.queried_keys.lock().unwrap().clone()
    }

    pub fn script_submits(&self, steps: impl IntoIterator<Item = ScriptedSubmit>) {
        self.submits.lock().unwrap().extend(steps);
    }

    pub fn script_queries(&self, outcomes: impl IntoIterator<Item = QueryOutcome>) {
        self.queries.lock().unwrap().extend(outcomes);
    }

    /// Idempotency keys of every submit call, in call order.
    pub fn submitted_keys(&self) -> Vec<String> {
        self.submitted_keys.lock().unwrap().clone()
    }

    pub fn submit_calls(&self) -> usize {
        self.submitted_keys.lock().unwrap().len()
    }

    pub fn settled_reference(idempotency_key: &str) -> String {
        format!("REF-{}", idempotency_key)
    }

    async fn scripted_submit(&self, intent: &PayoutIntent) -> SubmitOutcome {
        let step = self.submits.lock().unwrap().pop_front();
        match step {
            Some(ScriptedSubmit::Respond(outcome)) => outcome,
            Some(ScriptedSubmit::Hang) => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                SubmitOutcome::TransientError {
                    reason: "scripted hang finished".into(),
                }
            }
            None => SubmitOutcome::Accepted {
                reference: Self::settled_reference(&intent.idempotency_key),
                settled: true,
            },
        }
    }
}

#[async_trait]
impl PayoutGateway for ScriptedGateway {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn limits(&self) -> &AmountLimits {
        &self.limits
    }

    async fn submit(&self, intent: &PayoutIntent) -> SubmitOutcome {
        self.submitted_keys
            .lock()
            .unwrap()
            .push(intent.idempotency_key.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.submit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = self.scripted_submit(intent).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished_submits.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    async fn query(&self, idempotency_key: &str) -> QueryOutcome {
        self.queried_keys
            .lock()
            .unwrap()
            .push(idempotency_key.to_string());
        self.queries
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(QueryOutcome::Processing)
    }

    fn verify_signature(&self, headers: &WebhookHeaders, raw_body: &[u8]) -> bool {
        let Ok(signature) = BASE64.decode(&headers.signature) else {
            return false;
        };
        crypto::verify_ed25519(
            self.platform_key.verifying_key().as_bytes(),
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
            API_V3_KEY,
            &resource.nonce,
            resource.associated_data.as_deref().unwrap_or_default(),
            &resource.ciphertext,
        )?;
        serde_json::from_slice(&plaintext).map_err(|e| ProviderError::Payload(e.to_string()))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn amount(value: &str) -> BigDecimal {
    BigDecimal::from_str(value).unwrap()
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<MemoryLedger>,
    pub queue: Arc<MemoryQueue>,
    pub gateway: Arc<ScriptedGateway>,
    pub machine: PayoutStateMachine,
    pub initiator: Arc<PayoutInitiator>,
    pub reconciler: Arc<WebhookReconciler>,
    pub processor: PayoutProcessor,
    pub scheduler: RetryScheduler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_initiator_config(InitiatorConfig::default())
    }

    pub fn with_initiator_config(initiator_config: InitiatorConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let ledger = Arc::new(MemoryLedger::new());
        let queue = Arc::new(MemoryQueue::new());
        let gateway = Arc::new(ScriptedGateway::new());

        let machine = PayoutStateMachine::new(ledger.clone(), clock.clone(), RetryPolicy::default());

        let initiator = Arc::new(PayoutInitiator::new(
            machine.clone(),
            gateway.clone(),
            queue.clone(),
            initiator_config,
        ));
        let reconciler = Arc::new(WebhookReconciler::new(machine.clone(), gateway.clone()));
        let processor = PayoutProcessor::new(
            machine.clone(),
            gateway.clone(),
            queue.clone(),
            PayoutProcessorConfig {
                concurrency: 1,
                job_timeout: JOB_TIMEOUT,
                poll_interval: Duration::from_millis(10),
            },
        );
        let scheduler = RetryScheduler::new(
            machine.clone(),
            gateway.clone(),
            queue.clone(),
            RetrySchedulerConfig {
                query_timeout: JOB_TIMEOUT,
                ..RetrySchedulerConfig::default()
            },
        );

        Self {
            clock,
            ledger,
            queue,
            gateway,
            machine,
            initiator,
            reconciler,
            processor,
            scheduler,
        }
    }

    /// Report a win for `source_event_id`.
    pub async fn win(&self, source_event_id: &str, value: &str) -> Result<PayoutIntent, PayoutError> {
        self.initiator
            .initiate(InitiatePayout {
                beneficiary_id: "oUpF8uMuAJO_M2pxb1Q9zNjWeS6o".into(),
                source_event_id: source_event_id.into(),
                amount: amount(value),
                memo: Some("lottery prize".into()),
            })
            .await
    }

    pub async fn intent(&self, id: PayoutId) -> PayoutIntent {
        self.ledger.get(id).await.unwrap().expect("intent exists")
    }

    pub async fn audit(&self, id: PayoutId) -> Vec<PayoutAuditEntry> {
        self.ledger.audit_trail(id).await.unwrap()
    }

    pub async fn actions(&self, id: PayoutId) -> Vec<AuditAction> {
        self.audit(id).await.into_iter().map(|e| e.action).collect()
    }

    pub async fn queue_depth(&self) -> u64 {
        self.queue.depth().await.unwrap()
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }
}

// ============================================================================
// Webhook Builders
// ============================================================================

/// Encrypted notification body as the provider would deliver it. The
/// notification id is derived from the content, so identical calls produce
/// a redelivery of the same notification.
pub fn webhook_body(
    event_type: &str,
    out_batch_no: &str,
    batch_id: Option<&str>,
    close_reason: Option<&str>,
) -> Vec<u8> {
    let notification_id = format!(
        "EV-{}-{}-{}",
        event_type,
        out_batch_no,
        batch_id.or(close_reason).unwrap_or("none")
    );
    webhook_body_with_id(&notification_id, event_type, out_batch_no, batch_id, close_reason)
}

pub fn webhook_body_with_id(
    notification_id: &str,
    event_type: &str,
    out_batch_no: &str,
    batch_id: Option<&str>,
    close_reason: Option<&str>,
) -> Vec<u8> {
    let batch_status = if event_type == "TRANSFER.SUCCESS" {
        "FINISHED"
    } else {
        "CLOSED"
    };
    let notification = json!({
        "out_batch_no": out_batch_no,
        "batch_id": batch_id,
        "batch_status": batch_status,
        "close_reason": close_reason,
    });

    let cipher = Aes256Gcm::new_from_slice(API_V3_KEY).unwrap();
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(RESOURCE_NONCE.as_bytes()),
            Payload {
                msg: notification.to_string().as_bytes(),
                aad: RESOURCE_AAD.as_bytes(),
            },
        )
        .unwrap();

    json!({
        "id": notification_id,
        "create_time": "2026-03-01T12:00:05+08:00",
        "event_type": event_type,
        "resource_type": "encrypt-resource",
        "resource": {
            "algorithm": AEAD_ALGORITHM,
            "ciphertext": BASE64.encode(ciphertext),
            "associated_data": RESOURCE_AAD,
            "nonce": RESOURCE_NONCE,
            "original_type": "mch_payment",
        },
    })
    .to_string()
    .into_bytes()
}

pub fn success_webhook(out_batch_no: &str, batch_id: &str) -> Vec<u8> {
    webhook_body("TRANSFER.SUCCESS", out_batch_no, Some(batch_id), None)
}

pub fn closed_webhook(out_batch_no: &str, close_reason: &str) -> Vec<u8> {
    webhook_body("TRANSFER.CLOSED", out_batch_no, None, Some(close_reason))
}

/// Headers carrying a valid platform signature over `body`.
pub fn signed_headers(body: &[u8]) -> HeaderMap {
    let timestamp = "1772366405";
    let nonce = "5K8264ILTKCH16CQ2502SI8ZNMTM67VS";

    let mut message = Vec::new();
    message.extend_from_slice(timestamp.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(nonce.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(body);
    message.push(b'\n');

    let signature = SigningKey::from_bytes(&PLATFORM_SIGNING_SEED).sign(&message);

    let mut headers = HeaderMap::new();
    headers.insert(
        SIGNATURE_HEADER,
        HeaderValue::from_str(&BASE64.encode(signature.to_bytes())).unwrap(),
    );
    headers.insert(TIMESTAMP_HEADER, HeaderValue::from_static("1772366405"));
    headers.insert(
        NONCE_HEADER,
        HeaderValue::from_static("5K8264ILTKCH16CQ2502SI8ZNMTM67VS"),
    );
    headers.insert(SERIAL_HEADER, HeaderValue::from_static("PUB_KEY_ID_0114"));
    headers
}
