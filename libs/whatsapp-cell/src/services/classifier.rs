use tracing::debug;

use crate::error::WebhookError;
use crate::models::{ChangeValue, EventKind, WebhookChange, WebhookEnvelope, WebhookEntry};

/// Routable view over a single `entry[].changes[]` item.
#[derive(Debug)]
pub struct ClassifiedEvent<'a> {
    pub kind: EventKind,
    pub entry_id: Option<&'a str>,
    pub value: &'a ChangeValue,
}

pub struct EventClassifier;

impl EventClassifier {
    /// Classifies `entry[0].changes[0]`. Array presence decides first;
    /// `value.type` and `change.field` are only consulted when neither array
    /// carries items.
    pub fn classify(envelope: &WebhookEnvelope) -> Result<ClassifiedEvent<'_>, WebhookError> {
        let entry = envelope.entry.first()
            .ok_or_else(|| WebhookError::Validation("envelope has no entry".to_string()))?;

        let change = entry.changes.first()
            .ok_or_else(|| WebhookError::Validation("entry has no changes".to_string()))?;

        classify_change(entry, change)
    }

    /// Classifies every change of every entry, in payload order. A batch is
    /// only routable when each entry carries at least one change with a value.
    pub fn classify_all(envelope: &WebhookEnvelope) -> Result<Vec<ClassifiedEvent<'_>>, WebhookError> {
        if envelope.entry.is_empty() {
            return Err(WebhookError::Validation("envelope has no entry".to_string()));
        }

        let mut events = Vec::new();
        for (index, entry) in envelope.entry.iter().enumerate() {
            if entry.changes.is_empty() {
                return Err(WebhookError::Validation(format!("entry {} has no changes", index)));
            }
            for change in &entry.changes {
                events.push(classify_change(entry, change)?);
            }
        }

        Ok(events)
    }
}

fn classify_change<'a>(entry: &'a WebhookEntry, change: &'a WebhookChange) -> Result<ClassifiedEvent<'a>, WebhookError> {
    let value = change.value.as_ref()
        .ok_or_else(|| WebhookError::Validation("change has no value".to_string()))?;

    let kind = if !value.statuses.is_empty() {
        EventKind::Status
    } else if !value.messages.is_empty() {
        EventKind::Message
    } else if let Some(kind) = value.event_type.as_deref().and_then(kind_from_hint) {
        kind
    } else if let Some(kind) = change.field.as_deref().and_then(kind_from_hint) {
        kind
    } else {
        EventKind::Unknown(describe_unknown(change.field.as_deref(), value))
    };

    debug!(event_kind = kind.as_str(), "Classified webhook event");

    Ok(ClassifiedEvent {
        kind,
        entry_id: entry.id.as_deref(),
        value,
    })
}

fn kind_from_hint(hint: &str) -> Option<EventKind> {
    match hint.trim().to_ascii_lowercase().as_str() {
        "message" | "messages" => Some(EventKind::Message),
        "status" | "statuses" => Some(EventKind::Status),
        _ => None,
    }
}

fn describe_unknown(field: Option<&str>, value: &ChangeValue) -> String {
    let mut keys: Vec<&str> = value.extra.keys().map(String::as_str).collect();
    keys.sort_unstable();

    format!(
        "no messages or statuses in payload (field: {}, type: {}, keys: [{}])",
        field.unwrap_or("none"),
        value.event_type.as_deref().unwrap_or("none"),
        keys.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> WebhookEnvelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_statuses_take_precedence() {
        let envelope = envelope(json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "WABA_ID",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "type": "message",
                        "messages": [{"from": "5511999999999", "id": "wamid.A", "type": "text", "text": {"body": "oi"}}],
                        "statuses": [{"id": "wamid.B", "status": "read"}]
                    }
                }]
            }]
        }));

        let event = EventClassifier::classify(&envelope).unwrap();
        assert_eq!(event.kind, EventKind::Status);
        assert_eq!(event.entry_id, Some("WABA_ID"));
    }

    #[test]
    fn test_messages_array_classifies_as_message() {
        let envelope = envelope(json!({
            "entry": [{"changes": [{"field": "messages", "value": {
                "messages": [{"from": "5511999999999", "id": "wamid.A", "type": "text", "text": {"body": "oi"}}]
            }}]}]
        }));

        assert_eq!(EventClassifier::classify(&envelope).unwrap().kind, EventKind::Message);
    }

    #[test]
    fn test_type_hint_used_when_arrays_empty() {
        let envelope = envelope(json!({
            "entry": [{"changes": [{"value": {"type": "statuses", "statuses": []}}]}]
        }));

        assert_eq!(EventClassifier::classify(&envelope).unwrap().kind, EventKind::Status);
    }

    #[test]
    fn test_unknown_event_carries_diagnostic() {
        let envelope = envelope(json!({
            "entry": [{"changes": [{"field": "account_update", "value": {"ban_info": {}}}]}]
        }));

        let event = EventClassifier::classify(&envelope).unwrap();
        assert_matches!(event.kind, EventKind::Unknown(detail) if detail.contains("account_update") && detail.contains("ban_info"));
    }

    #[test]
    fn test_missing_entry_or_changes_is_validation_error() {
        assert_matches!(
            EventClassifier::classify(&envelope(json!({"object": "whatsapp_business_account"}))),
            Err(WebhookError::Validation(_))
        );
        assert_matches!(
            EventClassifier::classify(&envelope(json!({"entry": [{"id": "1", "changes": []}]}))),
            Err(WebhookError::Validation(_))
        );
        assert_matches!(
            EventClassifier::classify(&envelope(json!({"entry": [{"changes": [{"field": "messages"}]}]}))),
            Err(WebhookError::Validation(_))
        );
    }

    #[test]
    fn test_classify_all_walks_every_entry_and_change() {
        let envelope = envelope(json!({
            "entry": [
                {"id": "WABA_1", "changes": [
                    {"field": "messages", "value": {"messages": [{"from": "5511999999999", "id": "wamid.A", "text": {"body": "oi"}}]}},
                    {"field": "messages", "value": {"statuses": [{"id": "wamid.OUT", "status": "delivered"}]}}
                ]},
                {"id": "WABA_2", "changes": [
                    {"field": "messages", "value": {"messages": [{"from": "5511888888888", "id": "wamid.B", "text": {"body": "ola"}}]}}
                ]}
            ]
        }));

        let events = EventClassifier::classify_all(&envelope).unwrap();
        let kinds: Vec<_> = events.iter().map(|event| event.kind.clone()).collect();
        assert_eq!(kinds, vec![EventKind::Message, EventKind::Status, EventKind::Message]);
        assert_eq!(events[2].entry_id, Some("WABA_2"));
    }

    #[test]
    fn test_classify_all_rejects_entry_without_changes() {
        let envelope = envelope(json!({
            "entry": [
                {"changes": [{"value": {"messages": [{"from": "5511999999999", "id": "wamid.A", "text": {"body": "oi"}}]}}]},
                {"id": "WABA_2", "changes": []}
            ]
        }));

        assert_matches!(EventClassifier::classify_all(&envelope), Err(WebhookError::Validation(_)));
    }
}
