pub mod audit;
pub mod circuit_breaker;
pub mod classifier;
pub mod dispatcher;
pub mod message;
pub mod metrics;
pub mod rate_limit;
pub mod signature;
pub mod status;
pub mod store;
pub mod supabase_store;
pub mod verification;

pub use audit::{AuditEntry, AuditEventType, AuditOutcome};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use classifier::{ClassifiedEvent, EventClassifier};
pub use dispatcher::{
    BodyStage, EventRouter, RateLimitStage, SignatureStage, WebhookBody, WebhookDispatcher, WebhookRequest,
    WebhookStage, MAX_BODY_BYTES,
};
pub use message::MessageHandler;
pub use metrics::{MetricsSink, MetricsSnapshot, WebhookMetrics};
pub use rate_limit::{RateLimitConfig, TokenBucketRateLimiter};
pub use signature::{SignatureValidator, SIGNATURE_HEADER};
pub use status::StatusHandler;
pub use store::{InMemoryMessageStore, MessageStore};
pub use supabase_store::SupabaseMessageStore;
pub use verification::VerificationHandshake;
