use std::sync::Arc;
use axum::{
    Router,
    routing::get,
    middleware,
};

use shared_config::AppConfig;
use shared_utils::middleware::compliance_headers;

use crate::handlers::{
    WhatsAppHandlers,
    verify_webhook,
    receive_webhook,
    webhook_health,
    webhook_metrics,
};

pub fn create_whatsapp_router(config: Arc<AppConfig>) -> Router {
    create_whatsapp_router_with_handlers(Arc::new(WhatsAppHandlers::new(config)))
}

pub fn create_whatsapp_router_with_handlers(handlers: Arc<WhatsAppHandlers>) -> Router {
    // The provider authenticates with the HMAC signature, not a JWT.
    Router::new()
        .route("/", get(verify_webhook).post(receive_webhook))
        .route("/health", get(webhook_health))
        .route("/metrics", get(webhook_metrics))
        .layer(middleware::from_fn_with_state(handlers.compliance(), compliance_headers))
        .with_state(handlers)
}
