use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use shared_config::AppConfig;
use whatsapp_cell::router::create_whatsapp_router;

pub fn create_router(state: Arc<AppConfig>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic webhook API is running!" }))
        .nest("/webhooks/whatsapp", create_whatsapp_router(state))
}
