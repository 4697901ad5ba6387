use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub whatsapp_verify_token: String,
    pub whatsapp_webhook_secret: String,
    pub webhook_event_rate_per_second: u32,
    pub webhook_verify_rate_per_minute: u32,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub handler_timeout_secs: u64,
    pub data_retention_days: u32,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            whatsapp_verify_token: env::var("WHATSAPP_VERIFY_TOKEN")
                .unwrap_or_else(|_| {
                    warn!("WHATSAPP_VERIFY_TOKEN not set, using empty value");
                    String::new()
                }),
            whatsapp_webhook_secret: env::var("WHATSAPP_WEBHOOK_SECRET")
                .unwrap_or_else(|_| {
                    warn!("WHATSAPP_WEBHOOK_SECRET not set, using empty value");
                    String::new()
                }),
            webhook_event_rate_per_second: parse_or("WEBHOOK_EVENT_RATE_PER_SECOND", 100),
            webhook_verify_rate_per_minute: parse_or("WEBHOOK_VERIFY_RATE_PER_MINUTE", 100),
            breaker_failure_threshold: parse_or("WEBHOOK_BREAKER_FAILURE_THRESHOLD", 5),
            breaker_cooldown_secs: parse_or("WEBHOOK_BREAKER_COOLDOWN_SECS", 60),
            handler_timeout_secs: parse_or("WEBHOOK_HANDLER_TIMEOUT_SECS", 10),
            data_retention_days: parse_or("LGPD_DATA_RETENTION_DAYS", 365),
            port: parse_or("PORT", 3000),
        };

        if !config.is_whatsapp_configured() {
            warn!("WhatsApp webhook not fully configured - every delivery will be rejected");
        }

        if !config.is_store_configured() {
            warn!("Supabase not configured - messages will only be kept in memory");
        }

        config
    }

    pub fn is_whatsapp_configured(&self) -> bool {
        !self.whatsapp_verify_token.is_empty()
            && !self.whatsapp_webhook_secret.is_empty()
    }

    pub fn is_store_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            whatsapp_verify_token: String::new(),
            whatsapp_webhook_secret: String::new(),
            webhook_event_rate_per_second: 100,
            webhook_verify_rate_per_minute: 100,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 60,
            handler_timeout_secs: 10,
            data_retention_days: 365,
            port: 3000,
        }
    }
}

fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
