//! Encrypted JSON envelopes: `{ "_encrypted": "<base64(nonce || ciphertext)>" }`.
//!
//! AES-256-GCM keyed with SHA-256 of the pre-shared communication secret.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ENVELOPE_FIELD: &str = "_encrypted";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope is not valid base64")]
    Encoding,
    #[error("envelope too short")]
    TooShort,
    #[error("envelope failed authentication")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
    #[error("decrypted payload is not JSON")]
    Json,
    #[error("`_encrypted` must be a string")]
    Shape,
}

pub struct EnvelopeCipher {
    cipher: Aes256Gcm,
}

impl EnvelopeCipher {
    pub fn new(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, EnvelopeError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EnvelopeError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, EnvelopeError> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|_| EnvelopeError::Encoding)?;
        if raw.len() <= NONCE_LEN {
            return Err(EnvelopeError::TooShort);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EnvelopeError::Decrypt)
    }

    /// Returns the decrypted JSON if `body` is an envelope, `None` if it is
    /// ordinary JSON.
    pub fn open_json(&self, body: &Value) -> Result<Option<Value>, EnvelopeError> {
        let Some(field) = body.as_object().and_then(|o| o.get(ENVELOPE_FIELD)) else {
            return Ok(None);
        };
        let encoded = field.as_str().ok_or(EnvelopeError::Shape)?;
        let plaintext = self.decrypt(encoded)?;
        serde_json::from_slice(&plaintext)
            .map(Some)
            .map_err(|_| EnvelopeError::Json)
    }

    pub fn seal_json(&self, value: &Value) -> Result<Value, EnvelopeError> {
        let plaintext = serde_json::to_vec(value).map_err(|_| EnvelopeError::Json)?;
        let encoded = self.encrypt(&plaintext)?;
        Ok(serde_json::json!({ ENVELOPE_FIELD: encoded }))
    }
}
