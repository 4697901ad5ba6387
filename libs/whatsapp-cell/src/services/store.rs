use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::models::{CreateOutcome, DeliveryStatus, MessageRecord, StatusUpdate};

/// Persistence seam for WhatsApp messages, keyed by provider message id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Inserts `record` unless a record with the same provider id exists.
    async fn create_if_absent(&self, record: MessageRecord) -> Result<CreateOutcome, StoreError>;

    async fn find_by_provider_id(&self, provider_message_id: &str) -> Result<Option<MessageRecord>, StoreError>;

    /// Compare-and-set: applies `update` only while the stored status still
    /// equals `expected`. Returns whether the write happened.
    async fn update_status(
        &self,
        provider_message_id: &str,
        expected: Option<DeliveryStatus>,
        update: &StatusUpdate,
    ) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Process-local store used when Supabase is not configured, and in tests.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    records: RwLock<HashMap<String, MessageRecord>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn get(&self, provider_message_id: &str) -> Option<MessageRecord> {
        self.records.read().await.get(provider_message_id).cloned()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_if_absent(&self, record: MessageRecord) -> Result<CreateOutcome, StoreError> {
        if record.provider_message_id.is_empty() {
            return Err(StoreError::InvalidRecord("provider_message_id is empty".to_string()));
        }

        let mut records = self.records.write().await;

        if let Some(existing) = records.get(&record.provider_message_id) {
            debug!(provider_message_id = %record.provider_message_id, "Message already stored");
            return Ok(CreateOutcome::Existing(existing.id));
        }

        let id = record.id;
        records.insert(record.provider_message_id.clone(), record);
        Ok(CreateOutcome::Created(id))
    }

    async fn find_by_provider_id(&self, provider_message_id: &str) -> Result<Option<MessageRecord>, StoreError> {
        Ok(self.get(provider_message_id).await)
    }

    async fn update_status(
        &self,
        provider_message_id: &str,
        expected: Option<DeliveryStatus>,
        update: &StatusUpdate,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;

        match records.get_mut(provider_message_id) {
            Some(record) if record.status == expected => {
                record.apply_status(update);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
