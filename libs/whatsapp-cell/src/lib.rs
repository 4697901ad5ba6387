// =====================================================================================
// WHATSAPP CELL - WEBHOOK INGESTION & DELIVERY STATUS
// =====================================================================================

pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use error::*;
pub use handlers::WhatsAppHandlers;
pub use models::*;
pub use router::{create_whatsapp_router, create_whatsapp_router_with_handlers};
