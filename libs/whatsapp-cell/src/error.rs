use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::Checkpoint;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Message store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid message record: {0}")]
    InvalidRecord(String),
}

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Missing X-Hub-Signature-256 header")]
    MissingSignature,

    #[error("Webhook signature does not match payload")]
    InvalidSignature,

    #[error("Verify token does not match")]
    InvalidVerifyToken,

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported event type: {0}")]
    UnsupportedEvent(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("Circuit breaker is open, retry after {retry_after_secs}s")]
    CircuitOpen { retry_after_secs: u64 },

    #[error("Processing error: {0}")]
    Processing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WebhookError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::MissingSignature => StatusCode::UNAUTHORIZED,
            WebhookError::InvalidSignature | WebhookError::InvalidVerifyToken => StatusCode::FORBIDDEN,
            WebhookError::Verification(_)
            | WebhookError::Validation(_)
            | WebhookError::UnsupportedEvent(_) => StatusCode::BAD_REQUEST,
            WebhookError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            WebhookError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::Processing(_) | WebhookError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Portuguese message shown to API consumers.
    pub fn user_message(&self) -> &'static str {
        match self {
            WebhookError::MissingSignature => "Assinatura do webhook ausente",
            WebhookError::InvalidSignature => "Assinatura do webhook inválida",
            WebhookError::InvalidVerifyToken => "Token de verificação inválido",
            WebhookError::Verification(_) => "Falha na verificação do webhook",
            WebhookError::Validation(_) => "Payload do webhook inválido",
            WebhookError::UnsupportedEvent(_) => "Tipo de evento não suportado",
            WebhookError::RateLimitExceeded { .. } => "Limite de requisições excedido, tente novamente mais tarde",
            WebhookError::CircuitOpen { .. } => "Serviço temporariamente indisponível, tente novamente mais tarde",
            WebhookError::Processing(_) | WebhookError::Store(_) => "Erro interno ao processar o webhook",
        }
    }

    /// Failures that say something about downstream health and feed the
    /// circuit breaker. Client mistakes never do.
    pub fn is_downstream_failure(&self) -> bool {
        matches!(self, WebhookError::Processing(_) | WebhookError::Store(_))
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            WebhookError::MissingSignature => "missing_signature",
            WebhookError::InvalidSignature => "invalid_signature",
            WebhookError::InvalidVerifyToken => "invalid_verify_token",
            WebhookError::Verification(_) => "verification_failed",
            WebhookError::Validation(_) => "validation_error",
            WebhookError::UnsupportedEvent(_) => "unsupported_event",
            WebhookError::RateLimitExceeded { .. } => "rate_limited",
            WebhookError::CircuitOpen { .. } => "circuit_open",
            WebhookError::Processing(_) => "processing_error",
            WebhookError::Store(_) => "store_error",
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            WebhookError::RateLimitExceeded { retry_after_secs }
            | WebhookError::CircuitOpen { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// A request that left the pipeline early, tagged with where it stopped.
#[derive(Debug)]
pub struct WebhookRejection {
    pub error: WebhookError,
    pub checkpoint: Checkpoint,
    pub correlation_id: Uuid,
}

impl WebhookRejection {
    pub fn new(error: WebhookError, checkpoint: Checkpoint, correlation_id: Uuid) -> Self {
        Self { error, checkpoint, correlation_id }
    }
}

impl IntoResponse for WebhookRejection {
    fn into_response(self) -> Response {
        let status = self.error.status_code();

        // Internal details stay in the logs.
        let detail = if status.is_server_error() {
            None
        } else {
            Some(self.error.to_string())
        };

        let body = Json(json!({
            "error": self.error.user_message(),
            "detail": detail,
            "correlation_id": self.correlation_id,
            "checkpoint": self.checkpoint,
            "timestamp": chrono::Utc::now()
        }));

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();

        if let Ok(value) = HeaderValue::from_str(&self.correlation_id.to_string()) {
            headers.insert(CORRELATION_ID_HEADER, value);
        }
        if let Some(retry_after) = self.error.retry_after_secs() {
            headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
        }

        response
    }
}
