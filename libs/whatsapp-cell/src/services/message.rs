use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::error::WebhookError;
use crate::models::{
    parse_provider_timestamp, ChangeValue, CorrelationContext, InboundMessageEvent,
    MessageContent, MessageRecord, ProcessingResult, RawMessage, StoredMessage,
};
use crate::services::audit::{AuditEntry, AuditEventType, AuditOutcome};
use crate::services::store::MessageStore;

/// Turns inbound customer messages into stored records, once per provider id.
pub struct MessageHandler {
    store: Arc<dyn MessageStore>,
}

impl MessageHandler {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, value, context), fields(correlation_id = %context.correlation_id))]
    pub async fn handle_incoming_message(
        &self,
        value: &ChangeValue,
        context: &CorrelationContext,
    ) -> Result<ProcessingResult, WebhookError> {
        if value.messages.is_empty() {
            return Err(WebhookError::Validation("messages array is empty".to_string()));
        }

        // Validate the whole batch before writing any of it.
        let events = value.messages.iter()
            .map(|raw| Self::normalize(raw, value))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stored = Vec::with_capacity(events.len());

        for event in events {
            let outcome = self.store
                .create_if_absent(MessageRecord::from_inbound(&event))
                .await?;

            if outcome.is_duplicate() {
                info!(
                    provider_message_id = %event.provider_message_id,
                    message_id = %outcome.message_id(),
                    "Duplicate WhatsApp message ignored"
                );
            } else {
                info!(
                    provider_message_id = %event.provider_message_id,
                    message_id = %outcome.message_id(),
                    kind = ?event.kind,
                    "Inbound WhatsApp message stored"
                );

                AuditEntry::new(AuditEventType::InboundMessageStored, "Inbound message stored", AuditOutcome::Success)
                    .with_correlation(context.correlation_id)
                    .with_resource(outcome.message_id().to_string())
                    .add_context("kind", event.kind)
                    .log();
            }

            stored.push(StoredMessage {
                message_id: outcome.message_id(),
                provider_message_id: event.provider_message_id,
                sender: event.sender,
                kind: event.kind,
                duplicate: outcome.is_duplicate(),
            });
        }

        Ok(ProcessingResult::Messages(stored))
    }

    /// Builds the normalized event for one raw provider message.
    pub fn normalize(raw: &RawMessage, value: &ChangeValue) -> Result<InboundMessageEvent, WebhookError> {
        let sender = non_empty(raw.from.as_deref())
            .ok_or_else(|| WebhookError::Validation("message is missing sender".to_string()))?;

        let provider_message_id = non_empty(raw.id.as_deref())
            .ok_or_else(|| WebhookError::Validation("message is missing id".to_string()))?;

        let content = extract_content(raw)?;

        let timestamp = parse_provider_timestamp(raw.timestamp.as_ref()).unwrap_or_else(|| {
            warn!(provider_message_id = %provider_message_id, "Message timestamp missing or invalid, using receive time");
            Utc::now()
        });

        let sender_name = value.contacts.iter()
            .find(|contact| contact.wa_id.as_deref() == Some(sender))
            .and_then(|contact| contact.profile.as_ref())
            .and_then(|profile| profile.name.clone());

        Ok(InboundMessageEvent {
            provider_message_id: provider_message_id.to_string(),
            sender: sender.to_string(),
            sender_name,
            kind: content.kind(),
            content,
            timestamp,
            business_phone_number_id: value.metadata.as_ref()
                .and_then(|metadata| metadata.phone_number_id.clone()),
            reply_to: raw.context.as_ref().and_then(|context| context.id.clone()),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn missing(kind: &str) -> WebhookError {
    WebhookError::Validation(format!("{} message is missing its content", kind))
}

/// Falls back to whichever payload object is present when `type` is absent.
fn infer_kind(raw: &RawMessage) -> Option<&'static str> {
    let candidates = [
        ("text", raw.text.is_some()),
        ("image", raw.image.is_some()),
        ("audio", raw.audio.is_some()),
        ("video", raw.video.is_some()),
        ("document", raw.document.is_some()),
        ("sticker", raw.sticker.is_some()),
        ("location", raw.location.is_some()),
        ("contacts", raw.contacts.is_some()),
        ("button", raw.button.is_some()),
        ("interactive", raw.interactive.is_some()),
    ];

    candidates.into_iter().find(|(_, present)| *present).map(|(kind, _)| kind)
}

fn extract_content(raw: &RawMessage) -> Result<MessageContent, WebhookError> {
    let kind = non_empty(raw.kind.as_deref())
        .or_else(|| infer_kind(raw))
        .ok_or_else(|| WebhookError::Validation("message is missing content".to_string()))?;

    match kind {
        "text" => {
            let body = raw.text.as_ref()
                .and_then(|text| non_empty(text.body.as_deref()))
                .ok_or_else(|| missing(kind))?;
            Ok(MessageContent::Text { body: body.to_string() })
        },
        "image" | "audio" | "video" | "document" | "sticker" => {
            let media = match kind {
                "image" => raw.image.as_ref(),
                "audio" => raw.audio.as_ref(),
                "video" => raw.video.as_ref(),
                "document" => raw.document.as_ref(),
                _ => raw.sticker.as_ref(),
            }
            .ok_or_else(|| missing(kind))?;

            let media_id = non_empty(media.id.as_deref()).ok_or_else(|| missing(kind))?;

            Ok(MessageContent::Media {
                media_type: kind.to_string(),
                media_id: media_id.to_string(),
                mime_type: media.mime_type.clone(),
                caption: media.caption.clone(),
                filename: media.filename.clone(),
            })
        },
        "location" => {
            let location = raw.location.as_ref().ok_or_else(|| missing(kind))?;
            match (location.latitude, location.longitude) {
                (Some(latitude), Some(longitude)) => Ok(MessageContent::Location {
                    latitude,
                    longitude,
                    name: location.name.clone(),
                    address: location.address.clone(),
                }),
                _ => Err(missing(kind)),
            }
        },
        "contacts" => {
            let contacts = raw.contacts.as_ref()
                .filter(|contacts| !contacts.is_empty())
                .ok_or_else(|| missing(kind))?;
            Ok(MessageContent::Contact { contacts: contacts.clone() })
        },
        "button" | "template" => {
            let button = raw.button.as_ref().ok_or_else(|| missing(kind))?;
            let text = non_empty(button.text.as_deref()).ok_or_else(|| missing(kind))?;
            Ok(MessageContent::Template {
                text: text.to_string(),
                payload: button.payload.clone(),
            })
        },
        "interactive" => {
            let interactive = raw.interactive.as_ref().ok_or_else(|| missing(kind))?;
            let reply = interactive.button_reply.as_ref()
                .or(interactive.list_reply.as_ref())
                .ok_or_else(|| missing(kind))?;
            let title = non_empty(reply.title.as_deref()).ok_or_else(|| missing(kind))?;
            Ok(MessageContent::Interactive {
                reply_id: reply.id.clone(),
                title: title.to_string(),
            })
        },
        other => Err(WebhookError::Validation(format!("unsupported message type '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::{CreateOutcome, MessageKind};
    use crate::services::store::{InMemoryMessageStore, MockMessageStore};
    use assert_matches::assert_matches;
    use serde_json::json;
    use uuid::Uuid;

    fn value(json: serde_json::Value) -> ChangeValue {
        serde_json::from_value(json).unwrap()
    }

    fn text_value(from: &str, id: &str, body: &str) -> ChangeValue {
        value(json!({
            "messaging_product": "whatsapp",
            "metadata": {"display_phone_number": "5511888888888", "phone_number_id": "106540352242922"},
            "contacts": [{"wa_id": from, "profile": {"name": "Maria Souza"}}],
            "messages": [{"from": from, "id": id, "timestamp": "1717000000", "type": "text", "text": {"body": body}}]
        }))
    }

    #[tokio::test]
    async fn test_text_message_is_stored() {
        let store = Arc::new(InMemoryMessageStore::new());
        let handler = MessageHandler::new(store.clone());
        let context = CorrelationContext::new("127.0.0.1");

        let result = handler
            .handle_incoming_message(&text_value("5511999999999", "wamid.A1", "Olá, quero agendar"), &context)
            .await
            .unwrap();

        let ProcessingResult::Messages(stored) = result else {
            panic!("expected message result");
        };
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sender, "5511999999999");
        assert_eq!(stored[0].kind, MessageKind::Text);
        assert!(!stored[0].duplicate);

        let record = store.get("wamid.A1").await.unwrap();
        assert_eq!(record.id, stored[0].message_id);
        assert_eq!(record.contact_name.as_deref(), Some("Maria Souza"));
        assert_eq!(record.content, Some(MessageContent::Text { body: "Olá, quero agendar".to_string() }));
        assert_eq!(record.status, None);
    }

    #[tokio::test]
    async fn test_duplicate_returns_existing_id() {
        let store = Arc::new(InMemoryMessageStore::new());
        let handler = MessageHandler::new(store.clone());
        let context = CorrelationContext::new("127.0.0.1");
        let payload = text_value("5511999999999", "wamid.DUP", "oi");

        let first = handler.handle_incoming_message(&payload, &context).await.unwrap();
        let second = handler.handle_incoming_message(&payload, &context).await.unwrap();

        let (ProcessingResult::Messages(first), ProcessingResult::Messages(second)) = (first, second) else {
            panic!("expected message results");
        };
        assert_eq!(first[0].message_id, second[0].message_id);
        assert!(second[0].duplicate);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_missing_sender_is_rejected_without_writes() {
        let mut store = MockMessageStore::new();
        store.expect_create_if_absent().never();
        let handler = MessageHandler::new(Arc::new(store));

        let payload = value(json!({
            "messages": [{"id": "wamid.X", "type": "text", "text": {"body": "oi"}}]
        }));

        let result = handler.handle_incoming_message(&payload, &CorrelationContext::new("test")).await;
        assert_matches!(result, Err(WebhookError::Validation(msg)) if msg.contains("sender"));
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let mut store = MockMessageStore::new();
        store.expect_create_if_absent()
            .times(1)
            .returning(|_| Err(StoreError::Unavailable("connection refused".to_string())));
        let handler = MessageHandler::new(Arc::new(store));

        let result = handler
            .handle_incoming_message(&text_value("5511999999999", "wamid.B", "oi"), &CorrelationContext::new("test"))
            .await;
        assert_matches!(result, Err(WebhookError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_mock_existing_outcome_marks_duplicate() {
        let existing = Uuid::new_v4();
        let mut store = MockMessageStore::new();
        store.expect_create_if_absent()
            .returning(move |_| Ok(CreateOutcome::Existing(existing)));
        let handler = MessageHandler::new(Arc::new(store));

        let result = handler
            .handle_incoming_message(&text_value("5511999999999", "wamid.C", "oi"), &CorrelationContext::new("test"))
            .await
            .unwrap();

        assert_matches!(result, ProcessingResult::Messages(stored) if stored[0].message_id == existing && stored[0].duplicate);
    }

    #[test]
    fn test_media_and_interactive_are_normalized() {
        let payload = value(json!({
            "messages": [
                {"from": "5511", "id": "wamid.img", "type": "image",
                 "image": {"id": "MEDIA_1", "mime_type": "image/jpeg", "caption": "exame"}},
                {"from": "5511", "id": "wamid.int", "type": "interactive",
                 "interactive": {"type": "button_reply", "button_reply": {"id": "confirm", "title": "Confirmar"}},
                 "context": {"from": "5511888888888", "id": "wamid.original"}}
            ]
        }));

        let image = MessageHandler::normalize(&payload.messages[0], &payload).unwrap();
        assert_matches!(image.content, MessageContent::Media { ref media_id, .. } if media_id == "MEDIA_1");

        let reply = MessageHandler::normalize(&payload.messages[1], &payload).unwrap();
        assert_eq!(reply.kind, MessageKind::Interactive);
        assert_eq!(reply.reply_to.as_deref(), Some("wamid.original"));
    }

    #[test]
    fn test_kind_inferred_without_type_field() {
        let payload = value(json!({
            "type": "message",
            "messages": [{"from": "5511999999999", "id": "wamid.X", "text": {"body": "Oi"}}]
        }));

        let event = MessageHandler::normalize(&payload.messages[0], &payload).unwrap();
        assert_eq!(event.content, MessageContent::Text { body: "Oi".to_string() });
        assert_eq!(event.sender_name, None);
    }

    #[test]
    fn test_message_without_any_content_is_rejected() {
        let payload = value(json!({
            "messages": [{"from": "5511999999999", "id": "wamid.empty"}]
        }));

        assert_matches!(
            MessageHandler::normalize(&payload.messages[0], &payload),
            Err(WebhookError::Validation(msg)) if msg.contains("content")
        );
    }

    #[test]
    fn test_unsupported_type_is_validation_error() {
        let payload = value(json!({
            "messages": [{"from": "5511", "id": "wamid.r", "type": "reaction", "reaction": {"emoji": "👍"}}]
        }));

        assert_matches!(
            MessageHandler::normalize(&payload.messages[0], &payload),
            Err(WebhookError::Validation(msg)) if msg.contains("reaction")
        );
    }
}
