// =====================================================================================
// WHATSAPP CELL MODELS
// =====================================================================================

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use uuid::Uuid;

// =====================================================================================
// PROVIDER ENVELOPE
// =====================================================================================

/// Top-level payload delivered by the WhatsApp Business Platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: Option<ChangeValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeValue {
    /// Explicit event hint. Not sent uniformly by the provider.
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub messaging_product: Option<String>,
    #[serde(default)]
    pub metadata: Option<PhoneMetadata>,
    #[serde(default)]
    pub contacts: Vec<ContactProfile>,
    #[serde(default)]
    pub messages: Vec<RawMessage>,
    #[serde(default)]
    pub statuses: Vec<RawStatus>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhoneMetadata {
    #[serde(default)]
    pub display_phone_number: Option<String>,
    #[serde(default)]
    pub phone_number_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactProfile {
    #[serde(default)]
    pub wa_id: Option<String>,
    #[serde(default)]
    pub profile: Option<ProfileName>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileName {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<TextPayload>,
    #[serde(default)]
    pub image: Option<MediaPayload>,
    #[serde(default)]
    pub audio: Option<MediaPayload>,
    #[serde(default)]
    pub video: Option<MediaPayload>,
    #[serde(default)]
    pub document: Option<MediaPayload>,
    #[serde(default)]
    pub sticker: Option<MediaPayload>,
    #[serde(default)]
    pub location: Option<LocationPayload>,
    #[serde(default)]
    pub contacts: Option<Vec<Value>>,
    #[serde(default)]
    pub button: Option<ButtonPayload>,
    #[serde(default)]
    pub interactive: Option<InteractivePayload>,
    #[serde(default)]
    pub context: Option<ReplyContext>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextPayload {
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationPayload {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Quick-reply button pressed on a template message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ButtonPayload {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InteractivePayload {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub button_reply: Option<InteractiveReply>,
    #[serde(default)]
    pub list_reply: Option<InteractiveReply>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InteractiveReply {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyContext {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStatus {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<ProviderError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ProviderError {
    pub fn reason(&self) -> String {
        let text = self.message.as_deref()
            .or(self.title.as_deref())
            .unwrap_or("unknown provider error");

        match self.code {
            Some(code) => format!("{} ({})", text, code),
            None => text.to_string(),
        }
    }
}

/// Provider timestamps are unix seconds, usually as strings.
pub fn parse_provider_timestamp(raw: Option<&Value>) -> Option<DateTime<Utc>> {
    let seconds = match raw? {
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    Utc.timestamp_opt(seconds, 0).single()
}

// =====================================================================================
// EVENT CLASSIFICATION
// =====================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Message,
    Status,
    /// Carries the diagnostic detail returned to the provider.
    Unknown(String),
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Status => "status",
            EventKind::Unknown(_) => "unknown",
        }
    }
}

/// Checkpoints of a webhook request. A rejection records the last one reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Checkpoint {
    Received,
    SignatureChecked,
    Classified,
    Handled,
    Responded,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Checkpoint::Received => "RECEIVED",
            Checkpoint::SignatureChecked => "SIGNATURE_CHECKED",
            Checkpoint::Classified => "CLASSIFIED",
            Checkpoint::Handled => "HANDLED",
            Checkpoint::Responded => "RESPONDED",
        };
        f.write_str(name)
    }
}

/// Request-scoped identity threaded through every log line of one webhook call.
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    pub correlation_id: Uuid,
    pub client_id: String,
    pub received_at: Instant,
}

impl CorrelationContext {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            client_id: client_id.into(),
            received_at: Instant::now(),
        }
    }
}

// =====================================================================================
// NORMALIZED EVENTS
// =====================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Media,
    Template,
    Location,
    Contact,
    Interactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Media {
        media_type: String,
        media_id: String,
        mime_type: Option<String>,
        caption: Option<String>,
        filename: Option<String>,
    },
    Template {
        text: String,
        payload: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
    Contact {
        contacts: Vec<Value>,
    },
    Interactive {
        reply_id: Option<String>,
        title: String,
    },
}

impl MessageContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageContent::Text { .. } => MessageKind::Text,
            MessageContent::Media { .. } => MessageKind::Media,
            MessageContent::Template { .. } => MessageKind::Template,
            MessageContent::Location { .. } => MessageKind::Location,
            MessageContent::Contact { .. } => MessageKind::Contact,
            MessageContent::Interactive { .. } => MessageKind::Interactive,
        }
    }
}

/// Customer message as received. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundMessageEvent {
    pub provider_message_id: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub kind: MessageKind,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    pub business_phone_number_id: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn from_provider(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 3,
        }
    }

    /// Monotonic transition rule. `current == None` means the record has no
    /// delivery status yet, so any status moves it forward.
    pub fn can_advance(current: Option<Self>, next: Self) -> bool {
        let Some(current) = current else {
            return true;
        };

        match (current, next) {
            (Self::Read, _) | (Self::Failed, _) => false,
            (Self::Sent | Self::Delivered, Self::Failed) => true,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized status callback. Audit-logged, never stored as such.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryStatusEvent {
    pub provider_message_id: String,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
    pub recipient_id: Option<String>,
    pub failure_reason: Option<String>,
}

// =====================================================================================
// STORED RECORDS
// =====================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub provider_message_id: String,
    pub direction: MessageDirection,
    pub phone_number: String,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub kind: Option<MessageKind>,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default)]
    pub status: Option<DeliveryStatus>,
    #[serde(default)]
    pub provider_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn from_inbound(event: &InboundMessageEvent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            provider_message_id: event.provider_message_id.clone(),
            direction: MessageDirection::Inbound,
            phone_number: event.sender.clone(),
            contact_name: event.sender_name.clone(),
            kind: Some(event.kind),
            content: Some(event.content.clone()),
            status: None,
            provider_timestamp: Some(event.timestamp),
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A message the platform sent through the provider's send API, stamped
    /// `Sent`. Outbound senders persist it with
    /// [`MessageStore::create_if_absent`](crate::services::MessageStore::create_if_absent)
    /// right after the provider returns the `wamid`, so the delivery callbacks
    /// that follow have a record to advance.
    pub fn outbound(provider_message_id: impl Into<String>, recipient: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            provider_message_id: provider_message_id.into(),
            direction: MessageDirection::Outbound,
            phone_number: recipient.into(),
            contact_name: None,
            kind: None,
            content: None,
            status: Some(DeliveryStatus::Sent),
            provider_timestamp: None,
            sent_at: Some(now),
            delivered_at: None,
            read_at: None,
            failed_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply_status(&mut self, update: &StatusUpdate) {
        self.status = Some(update.status);
        match update.status {
            DeliveryStatus::Sent => self.sent_at = Some(update.at),
            DeliveryStatus::Delivered => self.delivered_at = Some(update.at),
            DeliveryStatus::Read => self.read_at = Some(update.at),
            DeliveryStatus::Failed => {
                self.failed_at = Some(update.at);
                self.failure_reason = update.failure_reason.clone();
            }
        }
        self.updated_at = Utc::now();
    }
}

/// Write applied by the store when a status moves forward.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: DeliveryStatus,
    pub at: DateTime<Utc>,
    pub failure_reason: Option<String>,
}

impl From<&DeliveryStatusEvent> for StatusUpdate {
    fn from(event: &DeliveryStatusEvent) -> Self {
        Self {
            status: event.status,
            at: event.timestamp,
            failure_reason: event.failure_reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Uuid),
    Existing(Uuid),
}

impl CreateOutcome {
    pub fn message_id(&self) -> Uuid {
        match self {
            CreateOutcome::Created(id) | CreateOutcome::Existing(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CreateOutcome::Existing(_))
    }
}

// =====================================================================================
// PROCESSING RESULTS / RESPONSES
// =====================================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingResult {
    Messages(Vec<StoredMessage>),
    Statuses(Vec<StatusOutcome>),
    /// A batch whose changes carried both messages and status callbacks.
    Mixed {
        messages: Vec<StoredMessage>,
        statuses: Vec<StatusOutcome>,
    },
}

impl ProcessingResult {
    pub fn event_type(&self) -> &'static str {
        match self {
            ProcessingResult::Messages(_) => "message",
            ProcessingResult::Statuses(_) => "status",
            ProcessingResult::Mixed { .. } => "mixed",
        }
    }

    /// Folds the result of a later change into this one, keeping payload order.
    pub fn merge(self, other: ProcessingResult) -> ProcessingResult {
        match (self, other) {
            (ProcessingResult::Messages(mut first), ProcessingResult::Messages(second)) => {
                first.extend(second);
                ProcessingResult::Messages(first)
            },
            (ProcessingResult::Statuses(mut first), ProcessingResult::Statuses(second)) => {
                first.extend(second);
                ProcessingResult::Statuses(first)
            },
            (first, second) => {
                let (mut messages, mut statuses) = first.into_parts();
                let (more_messages, more_statuses) = second.into_parts();
                messages.extend(more_messages);
                statuses.extend(more_statuses);
                ProcessingResult::Mixed { messages, statuses }
            },
        }
    }

    fn into_parts(self) -> (Vec<StoredMessage>, Vec<StatusOutcome>) {
        match self {
            ProcessingResult::Messages(messages) => (messages, Vec::new()),
            ProcessingResult::Statuses(statuses) => (Vec::new(), statuses),
            ProcessingResult::Mixed { messages, statuses } => (messages, statuses),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub message_id: Uuid,
    pub provider_message_id: String,
    pub sender: String,
    pub kind: MessageKind,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusOutcomeKind {
    Applied,
    Ignored,
    UnknownMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusOutcome {
    pub provider_message_id: String,
    pub status: DeliveryStatus,
    pub outcome: StatusOutcomeKind,
    pub previous_status: Option<DeliveryStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub correlation_id: Uuid,
    pub event_type: &'static str,
    /// Seconds between receipt and response.
    pub processing_time: f64,
    pub result: ProcessingResult,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerificationQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}
