// =====================================================================================
// WHATSAPP CELL HANDLERS
// =====================================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{info, instrument, warn};

use shared_config::AppConfig;
use shared_database::SupabaseClient;
use shared_utils::middleware::ComplianceHeaders;

use crate::error::{WebhookError, WebhookRejection, CORRELATION_ID_HEADER};
use crate::models::{Checkpoint, CorrelationContext, VerificationQuery};
use crate::services::{
    CircuitBreaker, CircuitBreakerConfig, EventRouter, InMemoryMessageStore, MessageHandler,
    MessageStore, RateLimitConfig, SignatureValidator, StatusHandler, SupabaseMessageStore,
    TokenBucketRateLimiter, VerificationHandshake, WebhookDispatcher, WebhookMetrics,
    WebhookBody, WebhookRequest, SIGNATURE_HEADER,
};

const FORWARDED_FOR: &str = "x-forwarded-for";

pub struct WhatsAppHandlers {
    verification: VerificationHandshake,
    dispatcher: WebhookDispatcher,
    breaker: Arc<CircuitBreaker>,
    store: Arc<dyn MessageStore>,
    metrics: Arc<WebhookMetrics>,
    compliance: ComplianceHeaders,
    config: Arc<AppConfig>,
}

impl WhatsAppHandlers {
    /// Persists to Supabase when configured, otherwise keeps messages in memory.
    pub fn new(config: Arc<AppConfig>) -> Self {
        let store: Arc<dyn MessageStore> = if config.is_store_configured() {
            Arc::new(SupabaseMessageStore::new(SupabaseClient::new(&config)))
        } else {
            warn!("Using in-memory WhatsApp message store");
            Arc::new(InMemoryMessageStore::new())
        };

        Self::with_store(config, store)
    }

    pub fn with_store(config: Arc<AppConfig>, store: Arc<dyn MessageStore>) -> Self {
        let metrics = Arc::new(WebhookMetrics::new());

        let breaker = Arc::new(CircuitBreaker::new("whatsapp_events", CircuitBreakerConfig {
            failure_threshold: config.breaker_failure_threshold.max(1),
            cooldown: Duration::from_secs(config.breaker_cooldown_secs),
            call_timeout: Some(config.handler_timeout_secs)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }));

        let verification = VerificationHandshake::new(
            config.whatsapp_verify_token.clone(),
            Arc::new(TokenBucketRateLimiter::new(
                "whatsapp_verify",
                RateLimitConfig::per_minute(config.webhook_verify_rate_per_minute),
            )),
            metrics.clone(),
        );

        let dispatcher = WebhookDispatcher::new(
            Arc::new(TokenBucketRateLimiter::new(
                "whatsapp_events",
                RateLimitConfig::per_second(config.webhook_event_rate_per_second),
            )),
            SignatureValidator::new(&config.whatsapp_webhook_secret),
            EventRouter::new(
                MessageHandler::new(store.clone()),
                StatusHandler::new(store.clone()),
                breaker.clone(),
            ),
            metrics.clone(),
        );

        Self {
            verification,
            dispatcher,
            breaker,
            store,
            metrics,
            compliance: ComplianceHeaders::from_config(&config),
            config,
        }
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    pub fn metrics(&self) -> Arc<WebhookMetrics> {
        self.metrics.clone()
    }

    pub fn compliance(&self) -> ComplianceHeaders {
        self.compliance.clone()
    }
}

/// Peer address first, then the first `X-Forwarded-For` hop.
fn client_id(request: &Request) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    request.headers()
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

fn with_correlation_id(mut response: Response, context: &CorrelationContext) -> Response {
    if let Ok(value) = HeaderValue::from_str(&context.correlation_id.to_string()) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

// =====================================================================================
// WEBHOOK ENDPOINTS
// =====================================================================================

/// `GET /webhooks/whatsapp` subscription handshake.
#[instrument(skip_all)]
pub async fn verify_webhook(
    State(handlers): State<Arc<WhatsAppHandlers>>,
    request: Request,
) -> Result<Response, WebhookRejection> {
    let context = CorrelationContext::new(client_id(&request));

    let Query(query) = Query::<VerificationQuery>::try_from_uri(request.uri()).map_err(|e| {
        WebhookRejection::new(
            WebhookError::Verification(format!("invalid query string: {}", e)),
            Checkpoint::Received,
            context.correlation_id,
        )
    })?;

    let challenge = handlers.verification.handle(&query, &context).await
        .map_err(|e| WebhookRejection::new(e, Checkpoint::Received, context.correlation_id))?;

    Ok(with_correlation_id((StatusCode::OK, challenge.to_string()).into_response(), &context))
}

/// `POST /webhooks/whatsapp` event delivery.
#[instrument(skip_all)]
pub async fn receive_webhook(
    State(handlers): State<Arc<WhatsAppHandlers>>,
    request: Request,
) -> Result<Response, WebhookRejection> {
    let context = CorrelationContext::new(client_id(&request));

    // Non UTF-8 header bytes can never match a hex digest.
    let signature = request.headers()
        .get(SIGNATURE_HEADER)
        .map(|value| value.to_str().unwrap_or_default().to_string());

    let body = WebhookBody::Pending(request.into_body());

    let correlation = context.clone();
    let response = handlers.dispatcher
        .dispatch(WebhookRequest { context, signature, body })
        .await?;

    Ok(with_correlation_id((StatusCode::OK, Json(response)).into_response(), &correlation))
}

// =====================================================================================
// OPERATIONAL ENDPOINTS
// =====================================================================================

#[instrument(skip(handlers))]
pub async fn webhook_health(State(handlers): State<Arc<WhatsAppHandlers>>) -> impl IntoResponse {
    let breaker = handlers.breaker.snapshot().await;
    let store = handlers.store.health_check().await;

    let store_reachable = store.is_ok();
    let healthy = store_reachable && handlers.config.is_whatsapp_configured();
    if !store_reachable {
        warn!("WhatsApp message store health check failed");
    }

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (status, Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "whatsapp_configured": handlers.config.is_whatsapp_configured(),
        "circuit_breaker": breaker,
        "store": {
            "reachable": store_reachable,
            "error": store.err().map(|e| e.to_string()),
        },
        "timestamp": chrono::Utc::now(),
    })))
}

#[instrument(skip(handlers))]
pub async fn webhook_metrics(State(handlers): State<Arc<WhatsAppHandlers>>) -> impl IntoResponse {
    info!("WhatsApp webhook metrics requested");
    Json(handlers.metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest};

    #[test]
    fn test_client_id_prefers_peer_address() {
        let mut request = HttpRequest::builder()
            .uri("/")
            .header(FORWARDED_FOR, "203.0.113.9")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 443))));

        assert_eq!(client_id(&request), "10.0.0.7");
    }

    #[test]
    fn test_client_id_falls_back_to_forwarded_for() {
        let request = HttpRequest::builder()
            .uri("/")
            .header(FORWARDED_FOR, " 198.51.100.4 , 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_id(&request), "198.51.100.4");

        let bare = HttpRequest::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(client_id(&bare), "unknown");
    }
}
