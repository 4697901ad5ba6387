use std::sync::Arc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use serde_json::{json, Value};
use uuid::Uuid;

use shared_config::AppConfig;

type HmacSha256 = Hmac<Sha256>;

pub struct TestConfig {
    pub verify_token: String,
    pub webhook_secret: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            verify_token: "test-verify-token".to_string(),
            webhook_secret: "test-webhook-secret-must-be-long-enough".to_string(),
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
        }
    }
}

impl TestConfig {
    pub fn with_supabase(url: &str) -> Self {
        Self {
            supabase_url: url.to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            ..Self::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            whatsapp_verify_token: self.verify_token.clone(),
            whatsapp_webhook_secret: self.webhook_secret.clone(),
            ..AppConfig::default()
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

pub struct SignatureTestUtils;

impl SignatureTestUtils {
    /// `X-Hub-Signature-256` header value for `body`.
    pub fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    pub fn sign_with_wrong_secret(body: &[u8]) -> String {
        Self::sign("wrong-secret", body)
    }
}

/// Canonical WhatsApp Cloud API payloads.
pub struct WhatsAppPayloads;

impl WhatsAppPayloads {
    pub fn envelope(value: Value) -> Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "102290129340398",
                "changes": [{
                    "field": "messages",
                    "value": value
                }]
            }]
        })
    }

    pub fn text_message(from: &str, provider_id: &str, body: &str) -> Value {
        Self::envelope(json!({
            "messaging_product": "whatsapp",
            "metadata": {
                "display_phone_number": "15550783881",
                "phone_number_id": "106540352242922"
            },
            "contacts": [{
                "profile": { "name": "Maria Souza" },
                "wa_id": from
            }],
            "messages": [{
                "from": from,
                "id": provider_id,
                "timestamp": "1717000000",
                "type": "text",
                "text": { "body": body }
            }]
        }))
    }

    pub fn status_update(provider_id: &str, status: &str) -> Value {
        Self::envelope(json!({
            "messaging_product": "whatsapp",
            "metadata": {
                "display_phone_number": "15550783881",
                "phone_number_id": "106540352242922"
            },
            "statuses": [{
                "id": provider_id,
                "status": status,
                "timestamp": "1717000100",
                "recipient_id": "5511999999999"
            }]
        }))
    }

    pub fn failed_status(provider_id: &str, code: i64, title: &str) -> Value {
        Self::envelope(json!({
            "messaging_product": "whatsapp",
            "statuses": [{
                "id": provider_id,
                "status": "failed",
                "timestamp": "1717000200",
                "recipient_id": "5511999999999",
                "errors": [{ "code": code, "title": title }]
            }]
        }))
    }

    pub fn random_provider_id() -> String {
        format!("wamid.{}", Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = TestConfig::default();
        let app_config = config.to_app_config();

        assert!(app_config.is_whatsapp_configured());
        assert!(!app_config.is_store_configured());
    }

    #[test]
    fn test_signature_format() {
        let signature = SignatureTestUtils::sign("secret", b"{}");

        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), "sha256=".len() + 64);
        assert_ne!(signature, SignatureTestUtils::sign_with_wrong_secret(b"{}"));
    }

    #[test]
    fn test_text_message_payload_shape() {
        let payload = WhatsAppPayloads::text_message("5511999999999", "wamid.X", "Oi");

        assert_eq!(payload["entry"][0]["changes"][0]["value"]["messages"][0]["from"], "5511999999999");
        assert_eq!(payload["entry"][0]["changes"][0]["value"]["messages"][0]["text"]["body"], "Oi");
    }
}
