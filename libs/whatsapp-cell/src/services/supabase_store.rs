use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use shared_database::SupabaseClient;

use crate::error::StoreError;
use crate::models::{CreateOutcome, DeliveryStatus, MessageRecord, StatusUpdate};
use crate::services::store::MessageStore;

const MESSAGES_TABLE: &str = "whatsapp_messages";

/// `MessageStore` backed by the `whatsapp_messages` PostgREST table.
/// Relies on a unique index over `provider_message_id`.
pub struct SupabaseMessageStore {
    supabase: SupabaseClient,
}

impl SupabaseMessageStore {
    pub fn new(supabase: SupabaseClient) -> Self {
        Self { supabase }
    }

    fn table_path(query: &str) -> String {
        format!("/rest/v1/{}?{}", MESSAGES_TABLE, query)
    }

    fn status_filter(expected: Option<DeliveryStatus>) -> String {
        match expected {
            Some(status) => format!("status=eq.{}", status.as_str()),
            None => "status=is.null".to_string(),
        }
    }

    fn status_patch(update: &StatusUpdate) -> Value {
        let timestamp_column = match update.status {
            DeliveryStatus::Sent => "sent_at",
            DeliveryStatus::Delivered => "delivered_at",
            DeliveryStatus::Read => "read_at",
            DeliveryStatus::Failed => "failed_at",
        };

        let mut patch = json!({
            "status": update.status,
            timestamp_column: update.at,
            "updated_at": Utc::now(),
        });

        if update.status == DeliveryStatus::Failed {
            patch["failure_reason"] = json!(update.failure_reason);
        }

        patch
    }
}

fn encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

fn unavailable(error: anyhow::Error) -> StoreError {
    error!("Supabase message store request failed: {}", error);
    StoreError::Unavailable(error.to_string())
}

#[async_trait]
impl MessageStore for SupabaseMessageStore {
    async fn create_if_absent(&self, record: MessageRecord) -> Result<CreateOutcome, StoreError> {
        let provider_message_id = record.provider_message_id.clone();
        let body = serde_json::to_value(&record)
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;

        let inserted: Vec<MessageRecord> = self.supabase.request(
            Method::POST,
            &Self::table_path("on_conflict=provider_message_id"),
            Some(&body),
            Some("resolution=ignore-duplicates,return=representation"),
        ).await.map_err(unavailable)?;

        if let Some(created) = inserted.into_iter().next() {
            debug!(provider_message_id = %provider_message_id, message_id = %created.id, "Message stored");
            return Ok(CreateOutcome::Created(created.id));
        }

        // Conflict was ignored: the row already exists.
        match self.find_by_provider_id(&provider_message_id).await? {
            Some(existing) => Ok(CreateOutcome::Existing(existing.id)),
            None => {
                warn!(provider_message_id = %provider_message_id, "Insert ignored but no existing row found");
                Err(StoreError::Unavailable(format!(
                    "insert of {} was ignored but no row exists", provider_message_id
                )))
            }
        }
    }

    async fn find_by_provider_id(&self, provider_message_id: &str) -> Result<Option<MessageRecord>, StoreError> {
        let path = Self::table_path(&format!(
            "provider_message_id=eq.{}&limit=1",
            encode(provider_message_id)
        ));

        let rows: Vec<MessageRecord> = self.supabase
            .request(Method::GET, &path, None, None)
            .await
            .map_err(unavailable)?;

        Ok(rows.into_iter().next())
    }

    async fn update_status(
        &self,
        provider_message_id: &str,
        expected: Option<DeliveryStatus>,
        update: &StatusUpdate,
    ) -> Result<bool, StoreError> {
        let path = Self::table_path(&format!(
            "provider_message_id=eq.{}&{}",
            encode(provider_message_id),
            Self::status_filter(expected)
        ));
        let patch = Self::status_patch(update);

        let updated: Vec<Value> = self.supabase
            .request(Method::PATCH, &path, Some(&patch), Some("return=representation"))
            .await
            .map_err(unavailable)?;

        Ok(!updated.is_empty())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let _: Vec<Value> = self.supabase
            .request(Method::GET, &Self::table_path("select=id&limit=1"), None, None)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
