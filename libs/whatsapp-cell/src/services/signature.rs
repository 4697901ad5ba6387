//! HMAC-SHA256 verification of `X-Hub-Signature-256`.
//!
//! The digest is always computed over the raw request bytes. Parsing and
//! re-serializing the JSON first would change the bytes and break every
//! signature.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::error::WebhookError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Clone)]
pub struct SignatureValidator {
    secret: Vec<u8>,
}

impl fmt::Debug for SignatureValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureValidator")
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl SignatureValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.secret.is_empty()
    }

    /// Returns whether `header_value` is the HMAC of `body` under the webhook secret.
    pub fn validate_signature(&self, body: &[u8], header_value: &str) -> bool {
        if !self.is_configured() {
            warn!("webhook_secret_not_configured");
            return false;
        }

        let trimmed = header_value.trim();
        let hex_digest = trimmed.strip_prefix(SIGNATURE_PREFIX).unwrap_or(trimmed);

        let provided = match hex::decode(hex_digest) {
            Ok(bytes) => bytes,
            Err(_) => {
                warn!(header_length = header_value.len(), "webhook_signature_not_hex");
                return false;
            }
        };

        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(m) => m,
            Err(_) => {
                warn!("webhook_signature_invalid_key");
                return false;
            }
        };
        mac.update(body);

        // verify_slice compares in constant time
        let valid = mac.verify_slice(&provided).is_ok();
        if !valid {
            warn!(
                body_length = body.len(),
                digest_length = provided.len(),
                "webhook_signature_mismatch"
            );
        }
        valid
    }

    /// Maps a missing header to 401 and a mismatch to 403.
    pub fn verify_request(&self, body: &[u8], header_value: Option<&str>) -> Result<(), WebhookError> {
        let header_value = header_value.ok_or(WebhookError::MissingSignature)?;

        if self.validate_signature(body, header_value) {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }

    /// Header value the provider would send for `body`.
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        mac.update(body);
        format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
    }
}

/// Constant-time comparison for short shared secrets.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
