// =====================================================================================
// WEBHOOK DISPATCHER - STAGED REQUEST PIPELINE
// =====================================================================================
//
// RECEIVED -> SIGNATURE_CHECKED -> CLASSIFIED -> HANDLED -> RESPONDED
//
// Each stage either hands the request to the next one or rejects it, tagged
// with the last checkpoint reached.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{WebhookError, WebhookRejection};
use crate::models::{
    Checkpoint, CorrelationContext, EventKind, ProcessingResult, WebhookEnvelope, WebhookResponse,
};
use crate::services::audit::{AuditEntry, AuditEventType, AuditOutcome};
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::classifier::EventClassifier;
use crate::services::message::MessageHandler;
use crate::services::metrics::{MetricsSink, WEBHOOK_ERRORS_TOTAL, WEBHOOK_LATENCY_SECONDS, WEBHOOK_REQUESTS_TOTAL};
use crate::services::rate_limit::TokenBucketRateLimiter;
use crate::services::signature::SignatureValidator;
use crate::services::status::StatusHandler;

pub const EVENTS_ENDPOINT: &str = "POST /webhooks/whatsapp";
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub enum WebhookBody {
    /// Not read yet. `BodyStage` buffers it under the size limit.
    Pending(Body),
    Buffered(Bytes),
}

impl WebhookBody {
    pub fn buffered(&self) -> Result<&Bytes, WebhookError> {
        match self {
            WebhookBody::Buffered(bytes) => Ok(bytes),
            WebhookBody::Pending(_) => Err(WebhookError::Processing("request body was not buffered".to_string())),
        }
    }
}

impl From<Body> for WebhookBody {
    fn from(body: Body) -> Self {
        WebhookBody::Pending(body)
    }
}

impl From<Bytes> for WebhookBody {
    fn from(bytes: Bytes) -> Self {
        WebhookBody::Buffered(bytes)
    }
}

#[derive(Debug)]
pub struct WebhookRequest {
    pub context: CorrelationContext,
    pub signature: Option<String>,
    pub body: WebhookBody,
}

#[async_trait]
pub trait WebhookStage: Send + Sync {
    async fn handle(&self, request: WebhookRequest) -> Result<WebhookResponse, WebhookRejection>;
}

// =====================================================================================
// STAGES
// =====================================================================================

pub struct RateLimitStage<S> {
    limiter: Arc<TokenBucketRateLimiter>,
    next: S,
}

impl<S> RateLimitStage<S> {
    pub fn new(limiter: Arc<TokenBucketRateLimiter>, next: S) -> Self {
        Self { limiter, next }
    }
}

#[async_trait]
impl<S: WebhookStage> WebhookStage for RateLimitStage<S> {
    async fn handle(&self, request: WebhookRequest) -> Result<WebhookResponse, WebhookRejection> {
        if let Err(error) = self.limiter.check_rate_limit(&request.context.client_id).await {
            return Err(WebhookRejection::new(error, Checkpoint::Received, request.context.correlation_id));
        }
        self.next.handle(request).await
    }
}

/// Buffers the raw body, refusing anything over `max_bytes`.
pub struct BodyStage<S> {
    max_bytes: usize,
    next: S,
}

impl<S> BodyStage<S> {
    pub fn new(max_bytes: usize, next: S) -> Self {
        Self { max_bytes, next }
    }
}

#[async_trait]
impl<S: WebhookStage> WebhookStage for BodyStage<S> {
    async fn handle(&self, mut request: WebhookRequest) -> Result<WebhookResponse, WebhookRejection> {
        let bytes = match request.body {
            WebhookBody::Buffered(bytes) => bytes,
            WebhookBody::Pending(body) => axum::body::to_bytes(body, self.max_bytes).await.map_err(|e| {
                WebhookRejection::new(
                    WebhookError::Validation(format!("unreadable request body: {}", e)),
                    Checkpoint::Received,
                    request.context.correlation_id,
                )
            })?,
        };

        debug!(body_bytes = bytes.len(), "Webhook body buffered");
        request.body = WebhookBody::Buffered(bytes);
        self.next.handle(request).await
    }
}

pub struct SignatureStage<S> {
    validator: SignatureValidator,
    next: S,
}

impl<S> SignatureStage<S> {
    pub fn new(validator: SignatureValidator, next: S) -> Self {
        Self { validator, next }
    }
}

#[async_trait]
impl<S: WebhookStage> WebhookStage for SignatureStage<S> {
    async fn handle(&self, request: WebhookRequest) -> Result<WebhookResponse, WebhookRejection> {
        let verified = match request.body.buffered() {
            Ok(body) => self.validator.verify_request(body, request.signature.as_deref()),
            Err(error) => Err(error),
        };

        if let Err(error) = verified {
            AuditEntry::new(AuditEventType::SignatureRejected, "Webhook signature rejected", AuditOutcome::Denied)
                .with_correlation(request.context.correlation_id)
                .with_ip(request.context.client_id.clone())
                .add_context("reason", error.metric_label())
                .log();

            return Err(WebhookRejection::new(error, Checkpoint::Received, request.context.correlation_id));
        }

        debug!(checkpoint = %Checkpoint::SignatureChecked, "Webhook signature verified");
        self.next.handle(request).await
    }
}

/// Terminal stage: parse, classify every change and hand each one to its
/// handler under the breaker.
pub struct EventRouter {
    messages: MessageHandler,
    statuses: StatusHandler,
    breaker: Arc<CircuitBreaker>,
}

impl EventRouter {
    pub fn new(messages: MessageHandler, statuses: StatusHandler, breaker: Arc<CircuitBreaker>) -> Self {
        Self { messages, statuses, breaker }
    }
}

#[async_trait]
impl WebhookStage for EventRouter {
    async fn handle(&self, request: WebhookRequest) -> Result<WebhookResponse, WebhookRejection> {
        let context = &request.context;
        let reject = |error, checkpoint| WebhookRejection::new(error, checkpoint, context.correlation_id);

        let envelope: WebhookEnvelope = {
            let body = request.body.buffered().map_err(|e| reject(e, Checkpoint::SignatureChecked))?;

            if body.is_empty() {
                return Err(reject(
                    WebhookError::Validation("request body is empty".to_string()),
                    Checkpoint::SignatureChecked,
                ));
            }

            serde_json::from_slice(body).map_err(|e| {
                reject(WebhookError::Validation(format!("malformed JSON payload: {}", e)), Checkpoint::SignatureChecked)
            })?
        };

        let events = EventClassifier::classify_all(&envelope)
            .map_err(|e| reject(e, Checkpoint::SignatureChecked))?;

        // One unsupported change fails the batch before any change is handled.
        for event in &events {
            if let EventKind::Unknown(detail) = &event.kind {
                return Err(reject(WebhookError::UnsupportedEvent(detail.clone()), Checkpoint::Classified));
            }
        }

        debug!(checkpoint = %Checkpoint::Classified, changes = events.len(), "Webhook events classified");

        let mut combined: Option<ProcessingResult> = None;
        for event in &events {
            let result = match &event.kind {
                EventKind::Message => {
                    self.breaker.execute(self.messages.handle_incoming_message(event.value, context)).await
                },
                EventKind::Status => {
                    self.breaker.execute(self.statuses.handle_status_update(event.value, context)).await
                },
                EventKind::Unknown(detail) => Err(WebhookError::UnsupportedEvent(detail.clone())),
            };

            let result = result.map_err(|e| reject(e, Checkpoint::Classified))?;
            debug!(event_kind = event.kind.as_str(), entry_id = ?event.entry_id, "Webhook change handled");

            combined = Some(match combined {
                Some(previous) => previous.merge(result),
                None => result,
            });
        }

        let result = combined.ok_or_else(|| {
            reject(WebhookError::Validation("envelope has no changes".to_string()), Checkpoint::SignatureChecked)
        })?;
        debug!(checkpoint = %Checkpoint::Handled, "Webhook event handled");

        Ok(WebhookResponse {
            status: "success",
            correlation_id: context.correlation_id,
            event_type: result.event_type(),
            processing_time: context.received_at.elapsed().as_secs_f64(),
            result,
        })
    }
}

// =====================================================================================
// DISPATCHER
// =====================================================================================

pub struct WebhookDispatcher {
    pipeline: Box<dyn WebhookStage>,
    metrics: Arc<dyn MetricsSink>,
}

impl WebhookDispatcher {
    /// Fixed order: rate limit, body, signature, then routing.
    pub fn new(
        rate_limiter: Arc<TokenBucketRateLimiter>,
        validator: SignatureValidator,
        router: EventRouter,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let pipeline = RateLimitStage::new(
            rate_limiter,
            BodyStage::new(MAX_BODY_BYTES, SignatureStage::new(validator, router)),
        );
        Self::with_pipeline(Box::new(pipeline), metrics)
    }

    pub fn with_pipeline(pipeline: Box<dyn WebhookStage>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { pipeline, metrics }
    }

    pub async fn dispatch(&self, request: WebhookRequest) -> Result<WebhookResponse, WebhookRejection> {
        let span = info_span!(
            "whatsapp_webhook",
            correlation_id = %request.context.correlation_id,
            client_id = %request.context.client_id,
        );

        async move {
            let received_at = request.context.received_at;
            let client_id = request.context.client_id.clone();
            debug!(checkpoint = %Checkpoint::Received, "Webhook received");

            let result = self.pipeline.handle(request).await;
            let elapsed = received_at.elapsed().as_secs_f64();

            match &result {
                Ok(response) => {
                    self.record("200", elapsed);
                    info!(
                        checkpoint = %Checkpoint::Responded,
                        event_type = response.event_type,
                        processing_time = elapsed,
                        "Webhook processed"
                    );
                },
                Err(rejection) => {
                    let status = rejection.error.status_code();
                    self.record(status.as_str(), elapsed);
                    self.metrics.increment_counter(WEBHOOK_ERRORS_TOTAL, EVENTS_ENDPOINT, rejection.error.metric_label());

                    if status.is_server_error() && rejection.error.is_downstream_failure() {
                        error!(
                            checkpoint = %rejection.checkpoint,
                            client_id = %client_id,
                            error = %rejection.error,
                            "Webhook processing failed"
                        );
                    } else {
                        warn!(
                            checkpoint = %rejection.checkpoint,
                            client_id = %client_id,
                            error = %rejection.error,
                            "Webhook rejected"
                        );
                    }
                },
            }

            result
        }
        .instrument(span)
        .await
    }

    fn record(&self, status: &str, elapsed: f64) {
        self.metrics.increment_counter(WEBHOOK_REQUESTS_TOTAL, EVENTS_ENDPOINT, status);
        self.metrics.observe_histogram(WEBHOOK_LATENCY_SECONDS, EVENTS_ENDPOINT, status, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeliveryStatus, MessageRecord, ProcessingResult, StatusOutcomeKind};
    use crate::services::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::services::metrics::WebhookMetrics;
    use crate::services::rate_limit::RateLimitConfig;
    use crate::services::store::{InMemoryMessageStore, MessageStore};
    use assert_matches::assert_matches;
    use serde_json::json;

    const SECRET: &str = "dispatcher-test-secret";

    struct Fixture {
        dispatcher: WebhookDispatcher,
        store: Arc<InMemoryMessageStore>,
        metrics: Arc<WebhookMetrics>,
    }

    fn fixture(rate_per_second: u32) -> Fixture {
        let store = Arc::new(InMemoryMessageStore::new());
        let metrics = Arc::new(WebhookMetrics::new());
        let breaker = Arc::new(CircuitBreaker::new("events", CircuitBreakerConfig::default()));
        let router = EventRouter::new(
            MessageHandler::new(store.clone()),
            StatusHandler::new(store.clone()),
            breaker,
        );
        let dispatcher = WebhookDispatcher::new(
            Arc::new(TokenBucketRateLimiter::new("events", RateLimitConfig::per_second(rate_per_second))),
            SignatureValidator::new(SECRET),
            router,
            metrics.clone(),
        );
        Fixture { dispatcher, store, metrics }
    }

    fn signed(body: serde_json::Value) -> WebhookRequest {
        let body = Bytes::from(serde_json::to_vec(&body).unwrap());
        WebhookRequest {
            context: CorrelationContext::new("10.1.1.1"),
            signature: Some(SignatureValidator::new(SECRET).sign(&body)),
            body: body.into(),
        }
    }

    fn message_payload(id: &str) -> serde_json::Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{"id": "WABA", "changes": [{"field": "messages", "value": {
                "messaging_product": "whatsapp",
                "contacts": [{"wa_id": "5511999999999", "profile": {"name": "Maria Souza"}}],
                "messages": [{"from": "5511999999999", "id": id, "timestamp": "1717000000", "type": "text", "text": {"body": "oi"}}]
            }}]}]
        })
    }

    #[tokio::test]
    async fn test_message_flows_through_pipeline() {
        let fixture = fixture(100);
        let response = fixture.dispatcher.dispatch(signed(message_payload("wamid.P1"))).await.unwrap();

        assert_eq!(response.status, "success");
        assert_eq!(response.event_type, "message");
        assert!(response.processing_time >= 0.0);
        assert_matches!(response.result, ProcessingResult::Messages(ref stored) if stored.len() == 1);
        assert_eq!(fixture.store.len().await, 1);
        assert_eq!(fixture.metrics.counter_value(WEBHOOK_REQUESTS_TOTAL, EVENTS_ENDPOINT, "200"), 1);
    }

    #[tokio::test]
    async fn test_missing_signature_stops_at_received() {
        let fixture = fixture(100);
        let mut request = signed(message_payload("wamid.P2"));
        request.signature = None;

        let rejection = fixture.dispatcher.dispatch(request).await.unwrap_err();
        assert_matches!(rejection.error, WebhookError::MissingSignature);
        assert_eq!(rejection.checkpoint, Checkpoint::Received);
        assert!(fixture.store.is_empty().await);
        assert_eq!(fixture.metrics.counter_value(WEBHOOK_ERRORS_TOTAL, EVENTS_ENDPOINT, "missing_signature"), 1);
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected_after_signature() {
        let fixture = fixture(100);
        let body = Bytes::from_static(b"{not json");
        let request = WebhookRequest {
            context: CorrelationContext::new("10.1.1.1"),
            signature: Some(SignatureValidator::new(SECRET).sign(&body)),
            body: body.into(),
        };

        let rejection = fixture.dispatcher.dispatch(request).await.unwrap_err();
        assert_matches!(rejection.error, WebhookError::Validation(_));
        assert_eq!(rejection.checkpoint, Checkpoint::SignatureChecked);
    }

    #[tokio::test]
    async fn test_unknown_event_is_unsupported() {
        let fixture = fixture(100);
        let rejection = fixture.dispatcher
            .dispatch(signed(json!({"entry": [{"changes": [{"field": "account_update", "value": {"event": "x"}}]}]})))
            .await
            .unwrap_err();

        assert_matches!(rejection.error, WebhookError::UnsupportedEvent(_));
        assert_eq!(rejection.checkpoint, Checkpoint::Classified);
    }

    #[tokio::test]
    async fn test_status_for_known_message_is_applied() {
        let fixture = fixture(100);
        fixture.store.create_if_absent(MessageRecord::outbound("wamid.OUT", "5511999999999")).await.unwrap();

        let response = fixture.dispatcher
            .dispatch(signed(json!({"entry": [{"changes": [{"field": "messages", "value": {
                "statuses": [{"id": "wamid.OUT", "status": "read", "timestamp": "1717000300"}]
            }}]}]})))
            .await
            .unwrap();

        assert_eq!(response.event_type, "status");
        assert_matches!(response.result, ProcessingResult::Statuses(ref outcomes) if outcomes[0].outcome == StatusOutcomeKind::Applied);
        assert_eq!(fixture.store.get("wamid.OUT").await.unwrap().status, Some(DeliveryStatus::Read));
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_signature() {
        let fixture = fixture(1);
        fixture.dispatcher.dispatch(signed(message_payload("wamid.R1"))).await.unwrap();

        let mut request = signed(message_payload("wamid.R2"));
        request.signature = None;
        let rejection = fixture.dispatcher.dispatch(request).await.unwrap_err();
        assert_matches!(rejection.error, WebhookError::RateLimitExceeded { .. });
    }

    #[tokio::test]
    async fn test_validation_errors_leave_breaker_closed() {
        let store = Arc::new(InMemoryMessageStore::new());
        let breaker = Arc::new(CircuitBreaker::new("events", CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }));
        let dispatcher = WebhookDispatcher::new(
            Arc::new(TokenBucketRateLimiter::new("events", RateLimitConfig::per_second(100))),
            SignatureValidator::new(SECRET),
            EventRouter::new(MessageHandler::new(store.clone()), StatusHandler::new(store), breaker.clone()),
            Arc::new(WebhookMetrics::new()),
        );

        let payload = json!({"entry": [{"changes": [{"value": {
            "messages": [{"id": "wamid.X", "type": "text", "text": {"body": "sem remetente"}}]
        }}]}]});
        for _ in 0..3 {
            let rejection = dispatcher.dispatch(signed(payload.clone())).await.unwrap_err();
            assert_matches!(rejection.error, WebhookError::Validation(_));
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_every_change_in_a_batch_is_handled() {
        let fixture = fixture(100);
        let change = |id: &str| json!({"field": "messages", "value": {
            "messages": [{"from": "5511999999999", "id": id, "type": "text", "text": {"body": "oi"}}]
        }});
        let payload = json!({
            "object": "whatsapp_business_account",
            "entry": [
                {"id": "WABA_1", "changes": [change("wamid.A"), change("wamid.B")]},
                {"id": "WABA_2", "changes": [change("wamid.C")]}
            ]
        });

        let response = fixture.dispatcher.dispatch(signed(payload)).await.unwrap();

        assert_eq!(response.event_type, "message");
        assert_matches!(response.result, ProcessingResult::Messages(ref stored) if stored.len() == 3);
        assert_eq!(fixture.store.len().await, 3);
        for id in ["wamid.A", "wamid.B", "wamid.C"] {
            assert!(fixture.store.get(id).await.is_some(), "{} was not stored", id);
        }
    }

    #[tokio::test]
    async fn test_batch_with_messages_and_statuses_is_mixed() {
        let fixture = fixture(100);
        fixture.store.create_if_absent(MessageRecord::outbound("wamid.OUT", "5511999999999")).await.unwrap();

        let payload = json!({"entry": [{"changes": [
            {"field": "messages", "value": {
                "messages": [{"from": "5511999999999", "id": "wamid.IN", "type": "text", "text": {"body": "oi"}}]
            }},
            {"field": "messages", "value": {
                "statuses": [{"id": "wamid.OUT", "status": "delivered", "timestamp": "1717000100"}]
            }}
        ]}]});

        let response = fixture.dispatcher.dispatch(signed(payload)).await.unwrap();

        assert_eq!(response.event_type, "mixed");
        assert_matches!(
            response.result,
            ProcessingResult::Mixed { ref messages, ref statuses } if messages.len() == 1 && statuses.len() == 1
        );
        assert_eq!(fixture.store.get("wamid.OUT").await.unwrap().status, Some(DeliveryStatus::Delivered));
    }

    #[tokio::test]
    async fn test_unknown_change_rejects_whole_batch() {
        let fixture = fixture(100);
        let payload = json!({"entry": [{"changes": [
            {"field": "messages", "value": {
                "messages": [{"from": "5511999999999", "id": "wamid.KEEP", "type": "text", "text": {"body": "oi"}}]
            }},
            {"field": "account_update", "value": {"ban_info": {}}}
        ]}]});

        let rejection = fixture.dispatcher.dispatch(signed(payload)).await.unwrap_err();

        assert_matches!(rejection.error, WebhookError::UnsupportedEvent(_));
        assert!(fixture.store.is_empty().await, "no change may be handled when the batch is rejected");
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected_and_counted() {
        let fixture = fixture(100);
        let request = WebhookRequest {
            context: CorrelationContext::new("10.1.1.1"),
            signature: Some("sha256=00".to_string()),
            body: Body::from(vec![b'x'; MAX_BODY_BYTES + 1]).into(),
        };

        let rejection = fixture.dispatcher.dispatch(request).await.unwrap_err();

        assert_matches!(rejection.error, WebhookError::Validation(_));
        assert_eq!(rejection.checkpoint, Checkpoint::Received);
        assert_eq!(fixture.metrics.counter_value(WEBHOOK_REQUESTS_TOTAL, EVENTS_ENDPOINT, "400"), 1);
        assert_eq!(fixture.metrics.counter_value(WEBHOOK_ERRORS_TOTAL, EVENTS_ENDPOINT, "validation_error"), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_applies_before_body_is_read() {
        let fixture = fixture(1);
        fixture.dispatcher.dispatch(signed(message_payload("wamid.R3"))).await.unwrap();

        let request = WebhookRequest {
            context: CorrelationContext::new("10.1.1.1"),
            signature: None,
            body: Body::from(vec![b'x'; MAX_BODY_BYTES + 1]).into(),
        };
        let rejection = fixture.dispatcher.dispatch(request).await.unwrap_err();

        assert_matches!(rejection.error, WebhookError::RateLimitExceeded { .. });
        assert_eq!(fixture.metrics.counter_value(WEBHOOK_REQUESTS_TOTAL, EVENTS_ENDPOINT, "429"), 1);
    }

    #[tokio::test]
    async fn test_pending_body_is_buffered_before_signature_check() {
        let fixture = fixture(100);
        let bytes = serde_json::to_vec(&message_payload("wamid.STREAM")).unwrap();
        let request = WebhookRequest {
            context: CorrelationContext::new("10.1.1.1"),
            signature: Some(SignatureValidator::new(SECRET).sign(&bytes)),
            body: Body::from(bytes).into(),
        };

        fixture.dispatcher.dispatch(request).await.unwrap();
        assert!(fixture.store.get("wamid.STREAM").await.is_some());
    }
}
