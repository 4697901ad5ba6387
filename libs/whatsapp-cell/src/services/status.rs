use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::error::WebhookError;
use crate::models::{
    parse_provider_timestamp, ChangeValue, CorrelationContext, DeliveryStatus, DeliveryStatusEvent,
    ProcessingResult, RawStatus, StatusOutcome, StatusOutcomeKind, StatusUpdate,
};
use crate::services::audit::{AuditEntry, AuditEventType, AuditOutcome};
use crate::services::store::MessageStore;

const MAX_CAS_ATTEMPTS: usize = 3;

/// Applies delivery callbacks to stored messages, never moving a status backwards.
pub struct StatusHandler {
    store: Arc<dyn MessageStore>,
}

impl StatusHandler {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, value, context), fields(correlation_id = %context.correlation_id))]
    pub async fn handle_status_update(
        &self,
        value: &ChangeValue,
        context: &CorrelationContext,
    ) -> Result<ProcessingResult, WebhookError> {
        if value.statuses.is_empty() {
            return Err(WebhookError::Validation("statuses array is empty".to_string()));
        }

        let events = value.statuses.iter()
            .map(Self::normalize)
            .collect::<Result<Vec<_>, _>>()?;

        let mut outcomes = Vec::with_capacity(events.len());
        for event in &events {
            let outcome = self.apply(event).await?;
            audit(event, &outcome, context);
            outcomes.push(outcome);
        }

        Ok(ProcessingResult::Statuses(outcomes))
    }

    pub fn normalize(raw: &RawStatus) -> Result<DeliveryStatusEvent, WebhookError> {
        let provider_message_id = raw.id.as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| WebhookError::Validation("status is missing message id".to_string()))?;

        let raw_status = raw.status.as_deref()
            .ok_or_else(|| WebhookError::Validation("status is missing status value".to_string()))?;

        let status = DeliveryStatus::from_provider(raw_status)
            .ok_or_else(|| WebhookError::Validation(format!("unrecognized delivery status '{}'", raw_status)))?;

        let failure_reason = match status {
            DeliveryStatus::Failed => Some(
                raw.errors.first()
                    .map(|error| error.reason())
                    .unwrap_or_else(|| "unknown provider error".to_string()),
            ),
            _ => None,
        };

        Ok(DeliveryStatusEvent {
            provider_message_id: provider_message_id.to_string(),
            status,
            timestamp: parse_provider_timestamp(raw.timestamp.as_ref()).unwrap_or_else(Utc::now),
            recipient_id: raw.recipient_id.clone(),
            failure_reason,
        })
    }

    /// Read, decide, compare-and-set. A lost race re-reads and decides again.
    async fn apply(&self, event: &DeliveryStatusEvent) -> Result<StatusOutcome, WebhookError> {
        let update = StatusUpdate::from(event);

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some(record) = self.store.find_by_provider_id(&event.provider_message_id).await? else {
                warn!(
                    provider_message_id = %event.provider_message_id,
                    status = %event.status,
                    "Status update for unknown message, dropping"
                );
                return Ok(outcome(event, StatusOutcomeKind::UnknownMessage, None));
            };

            let current = record.status;
            if !DeliveryStatus::can_advance(current, event.status) {
                debug!(
                    provider_message_id = %event.provider_message_id,
                    current = ?current,
                    received = %event.status,
                    "Stale or duplicate status ignored"
                );
                return Ok(outcome(event, StatusOutcomeKind::Ignored, current));
            }

            if self.store.update_status(&event.provider_message_id, current, &update).await? {
                info!(
                    provider_message_id = %event.provider_message_id,
                    from = ?current,
                    to = %event.status,
                    "Delivery status advanced"
                );
                return Ok(outcome(event, StatusOutcomeKind::Applied, current));
            }

            debug!(
                provider_message_id = %event.provider_message_id,
                attempt,
                "Concurrent status change detected, retrying"
            );
        }

        Err(WebhookError::Processing(format!(
            "status of {} kept changing after {} attempts",
            event.provider_message_id, MAX_CAS_ATTEMPTS
        )))
    }
}

fn outcome(event: &DeliveryStatusEvent, kind: StatusOutcomeKind, previous: Option<DeliveryStatus>) -> StatusOutcome {
    StatusOutcome {
        provider_message_id: event.provider_message_id.clone(),
        status: event.status,
        outcome: kind,
        previous_status: previous,
    }
}

fn audit(event: &DeliveryStatusEvent, outcome: &StatusOutcome, context: &CorrelationContext) {
    let (action, result) = match outcome.outcome {
        StatusOutcomeKind::Applied => ("Delivery status applied", AuditOutcome::Success),
        StatusOutcomeKind::Ignored => ("Stale delivery status ignored", AuditOutcome::Ignored),
        StatusOutcomeKind::UnknownMessage => ("Delivery status for unknown message", AuditOutcome::Ignored),
    };

    let mut entry = AuditEntry::new(AuditEventType::DeliveryStatusReceived, action, result)
        .with_correlation(context.correlation_id)
        .with_resource(event.provider_message_id.clone())
        .add_context("status", event.status)
        .add_context("provider_timestamp", event.timestamp);

    if let Some(previous) = outcome.previous_status {
        entry = entry.add_context("previous_status", previous);
    }
    if let Some(reason) = &event.failure_reason {
        entry = entry.add_context("failure_reason", reason);
    }

    entry.log();
}
