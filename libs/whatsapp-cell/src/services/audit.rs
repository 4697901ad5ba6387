// =====================================================================================
// WEBHOOK AUDIT TRAIL - LGPD COMPLIANT AUDIT LOGGING
// =====================================================================================

use std::collections::HashMap;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize)]
pub enum AuditEventType {
    SubscriptionVerified,
    SubscriptionRejected,
    SignatureRejected,
    InboundMessageStored,
    DeliveryStatusReceived,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub enum AuditOutcome {
    Success,
    Ignored,
    Denied,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub event_id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: AuditEventType,
    pub action: String,
    pub outcome: AuditOutcome,
    pub correlation_id: Option<Uuid>,
    pub resource_id: Option<String>,
    pub ip_address: Option<String>,
    pub additional_data: HashMap<String, serde_json::Value>,
}

impl AuditEntry {
    pub fn new(event_type: AuditEventType, action: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event_type,
            action: action.into(),
            outcome,
            correlation_id: None,
            resource_id: None,
            ip_address: None,
            additional_data: HashMap::new(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn add_context<T: Serialize>(mut self, key: &str, value: T) -> Self {
        if let Ok(serialized) = serde_json::to_value(value) {
            self.additional_data.insert(key.to_string(), serialized);
        }
        self
    }

    /// Emits the entry on the `audit` tracing target. Phone numbers and
    /// message bodies never go in here.
    pub fn log(&self) {
        let context = serde_json::to_string(&self.additional_data).unwrap_or_default();

        match self.outcome {
            AuditOutcome::Success | AuditOutcome::Ignored => {
                info!(
                    target: "audit",
                    event_id = %self.event_id,
                    event_type = ?self.event_type,
                    outcome = ?self.outcome,
                    correlation_id = ?self.correlation_id,
                    resource_id = ?self.resource_id,
                    context = %context,
                    "AUDIT: {}", self.action
                );
            },
            AuditOutcome::Denied => {
                warn!(
                    target: "audit",
                    event_id = %self.event_id,
                    event_type = ?self.event_type,
                    correlation_id = ?self.correlation_id,
                    ip_address = ?self.ip_address,
                    context = %context,
                    "AUDIT FAILURE: {}", self.action
                );
            },
            AuditOutcome::Error => {
                error!(
                    target: "audit",
                    event_id = %self.event_id,
                    event_type = ?self.event_type,
                    correlation_id = ?self.correlation_id,
                    context = %context,
                    "AUDIT ERROR: {}", self.action
                );
            },
        }
    }
}
