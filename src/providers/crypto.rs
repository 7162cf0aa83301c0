//! Signing and decryption primitives for the provider protocol.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::ProviderError;

type HmacSha256 = Hmac<Sha256>;

pub const AEAD_ALGORITHM: &str = "AEAD_AES_256_GCM";
const GCM_NONCE_LEN: usize = 12;

/// Verify an Ed25519 signature. Any malformed input is a failed verification.
pub fn verify_ed25519(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let pk_bytes: [u8; 32] = match public_key.try_into() {
        Ok(b) => b,
        Err(_) => return false,
    };
    let sig_bytes: [u8; 64] = match signature.try_into() {
        Ok(b) => b,
        Err(_) => return false,
    };
    let verifying_key = match VerifyingKey::from_bytes(&pk_bytes) {
        Ok(k) => k,
        Err(_) => return false,
    };

    verifying_key
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

/// Hex HMAC-SHA256 of `message` under `secret`.
pub fn hmac_sha256_hex(secret: &str, message: &str) -> Result<String, ProviderError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| ProviderError::Crypto(format!("invalid HMAC key: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Canonical string for outbound request signing.
pub fn request_signing_message(
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: &str,
) -> String {
    format!("{}\n{}\n{}\n{}\n{}\n", method, path, timestamp, nonce, body)
}

/// Decrypt an `AEAD_AES_256_GCM` resource. The key is the 32-byte API v3 key.
pub fn decrypt_aes_256_gcm(
    key: &[u8],
    nonce: &str,
    associated_data: &str,
    ciphertext_b64: &str,
) -> Result<Vec<u8>, ProviderError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| ProviderError::Crypto("API v3 key must be 32 bytes".to_string()))?;

    if nonce.len() != GCM_NONCE_LEN {
        return Err(ProviderError::Crypto(format!(
            "nonce must be {} bytes, got {}",
            GCM_NONCE_LEN,
            nonce.len()
        )));
    }

    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .map_err(|e| ProviderError::Crypto(format!("ciphertext is not base64: {}", e)))?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce.as_bytes()),
            Payload {
                msg: &ciphertext,
                aad: associated_data.as_bytes(),
            },
        )
        .map_err(|_| ProviderError::Crypto("authentication tag mismatch".to_string()))
}

/// Short hex digest used to derive idempotency keys.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}
