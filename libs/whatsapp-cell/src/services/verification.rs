use std::sync::Arc;

use tracing::{info, warn};

use crate::error::WebhookError;
use crate::models::{CorrelationContext, VerificationQuery};
use crate::services::audit::{AuditEntry, AuditEventType, AuditOutcome};
use crate::services::metrics::{MetricsSink, VERIFICATION_TOTAL};
use crate::services::rate_limit::TokenBucketRateLimiter;
use crate::services::signature::constant_time_eq;

pub const VERIFY_ENDPOINT: &str = "GET /webhooks/whatsapp";
const SUBSCRIBE_MODE: &str = "subscribe";

/// Subscription handshake: echoes `hub.challenge` back when mode and token check out.
pub struct VerificationHandshake {
    verify_token: String,
    rate_limiter: Arc<TokenBucketRateLimiter>,
    metrics: Arc<dyn MetricsSink>,
}

impl VerificationHandshake {
    pub fn new(
        verify_token: impl Into<String>,
        rate_limiter: Arc<TokenBucketRateLimiter>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            verify_token: verify_token.into(),
            rate_limiter,
            metrics,
        }
    }

    /// Rate limits the caller, then runs the handshake.
    pub async fn handle(&self, query: &VerificationQuery, context: &CorrelationContext) -> Result<u64, WebhookError> {
        let result = match self.rate_limiter.check_rate_limit(&context.client_id).await {
            Ok(()) => self.verify_subscription(
                query.mode.as_deref(),
                query.verify_token.as_deref(),
                query.challenge.as_deref(),
            ),
            Err(error) => Err(error),
        };

        self.record(&result, context);
        result
    }

    pub fn verify_subscription(
        &self,
        mode: Option<&str>,
        verify_token: Option<&str>,
        challenge: Option<&str>,
    ) -> Result<u64, WebhookError> {
        match mode {
            Some(SUBSCRIBE_MODE) => {},
            Some(other) => {
                return Err(WebhookError::Verification(format!("unsupported hub.mode '{}'", other)));
            },
            None => return Err(WebhookError::Verification("hub.mode is required".to_string())),
        }

        // An unset token on our side must never match an empty one from the caller.
        let token_matches = !self.verify_token.is_empty()
            && verify_token.is_some_and(|token| constant_time_eq(token.as_bytes(), self.verify_token.as_bytes()));

        if !token_matches {
            return Err(WebhookError::InvalidVerifyToken);
        }

        let challenge = challenge
            .ok_or_else(|| WebhookError::Verification("hub.challenge is required".to_string()))?;

        challenge.trim().parse::<u64>()
            .map_err(|_| WebhookError::Verification("hub.challenge must be a non-negative integer".to_string()))
    }

    fn record(&self, result: &Result<u64, WebhookError>, context: &CorrelationContext) {
        match result {
            Ok(_) => {
                self.metrics.increment_counter(VERIFICATION_TOTAL, VERIFY_ENDPOINT, "success");
                info!(correlation_id = %context.correlation_id, "WhatsApp webhook subscription verified");

                AuditEntry::new(AuditEventType::SubscriptionVerified, "Webhook subscription verified", AuditOutcome::Success)
                    .with_correlation(context.correlation_id)
                    .with_ip(context.client_id.clone())
                    .log();
            },
            Err(error) => {
                self.metrics.increment_counter(VERIFICATION_TOTAL, VERIFY_ENDPOINT, error.metric_label());
                warn!(
                    correlation_id = %context.correlation_id,
                    client_id = %context.client_id,
                    error = %error,
                    "WhatsApp webhook verification rejected"
                );

                AuditEntry::new(AuditEventType::SubscriptionRejected, "Webhook subscription rejected", AuditOutcome::Denied)
                    .with_correlation(context.correlation_id)
                    .with_ip(context.client_id.clone())
                    .add_context("reason", error.metric_label())
                    .log();
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::metrics::WebhookMetrics;
    use crate::services::rate_limit::RateLimitConfig;
    use assert_matches::assert_matches;

    fn handshake(token: &str) -> (VerificationHandshake, Arc<WebhookMetrics>) {
        let metrics = Arc::new(WebhookMetrics::new());
        let limiter = Arc::new(TokenBucketRateLimiter::new("verify", RateLimitConfig::per_minute(2)));
        (VerificationHandshake::new(token, limiter, metrics.clone()), metrics)
    }

    #[test]
    fn test_valid_handshake_echoes_challenge() {
        let (handshake, _) = handshake("clinic-token");
        assert_eq!(
            handshake.verify_subscription(Some("subscribe"), Some("clinic-token"), Some("12345")).unwrap(),
            12345
        );
    }

    #[test]
    fn test_wrong_token_is_rejected() {
        let (handshake, _) = handshake("clinic-token");
        assert_matches!(
            handshake.verify_subscription(Some("subscribe"), Some("wrong"), Some("12345")),
            Err(WebhookError::InvalidVerifyToken)
        );
        assert_matches!(
            handshake.verify_subscription(Some("subscribe"), None, Some("12345")),
            Err(WebhookError::InvalidVerifyToken)
        );
    }

    #[test]
    fn test_unconfigured_token_rejects_everything() {
        let (handshake, _) = handshake("");
        assert_matches!(
            handshake.verify_subscription(Some("subscribe"), Some(""), Some("1")),
            Err(WebhookError::InvalidVerifyToken)
        );
    }

    #[test]
    fn test_bad_mode_and_challenge_are_verification_errors() {
        let (handshake, _) = handshake("clinic-token");
        assert_matches!(
            handshake.verify_subscription(Some("unsubscribe"), Some("clinic-token"), Some("1")),
            Err(WebhookError::Verification(_))
        );
        assert_matches!(
            handshake.verify_subscription(Some("subscribe"), Some("clinic-token"), Some("-5")),
            Err(WebhookError::Verification(_))
        );
        assert_matches!(
            handshake.verify_subscription(Some("subscribe"), Some("clinic-token"), Some("abc")),
            Err(WebhookError::Verification(_))
        );
    }

    #[tokio::test]
    async fn test_handle_counts_outcomes_and_rate_limits() {
        let (handshake, metrics) = handshake("clinic-token");
        let context = CorrelationContext::new("10.0.0.1");
        let query = VerificationQuery {
            mode: Some("subscribe".to_string()),
            verify_token: Some("clinic-token".to_string()),
            challenge: Some("42".to_string()),
        };

        assert_eq!(handshake.handle(&query, &context).await.unwrap(), 42);
        assert_eq!(handshake.handle(&query, &context).await.unwrap(), 42);
        assert_matches!(handshake.handle(&query, &context).await, Err(WebhookError::RateLimitExceeded { .. }));

        assert_eq!(metrics.counter_value(VERIFICATION_TOTAL, VERIFY_ENDPOINT, "success"), 2);
        assert_eq!(metrics.counter_value(VERIFICATION_TOTAL, VERIFY_ENDPOINT, "rate_limited"), 1);
    }
}
