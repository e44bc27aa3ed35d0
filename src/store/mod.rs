//! Query layer over the messages table.

pub mod rest;
pub mod sqlite;

use crate::chat::{DeliveryStatus, Message, MessageId, NewMessage};
use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

pub use rest::RestStore;
pub use sqlite::SqliteStore;

/// Backend holding the messages table.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Phone numbers with at least one message. Order is not meaningful.
    async fn distinct_phone_numbers(&self) -> Result<Vec<String>, StoreError>;

    /// All messages for `phone_number`, oldest first.
    async fn messages(&self, phone_number: &str) -> Result<Vec<Message>, StoreError>;

    async fn latest_message(&self, phone_number: &str) -> Result<Option<Message>, StoreError>;

    /// The newest message of every phone number in a single round trip.
    async fn latest_per_phone(&self) -> Result<Vec<Message>, StoreError>;

    async fn insert(&self, message: &NewMessage) -> Result<Message, StoreError>;

    /// Moves a message's delivery status forward.
    async fn update_status(&self, id: &MessageId, status: DeliveryStatus) -> Result<Message, StoreError>;
}

/// Handle the rest of the application talks to. Cheap to clone; read
/// failures degrade to empty results and are logged here rather than
/// surfaced.
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn MessageStore>,
}

impl StoreClient {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub async fn list_distinct_phone_numbers(&self) -> Vec<String> {
        match self.store.distinct_phone_numbers().await {
            Ok(phones) => phones,
            Err(e) => {
                error!(error = %e, "Error fetching phone numbers");
                Vec::new()
            }
        }
    }

    pub async fn list_messages(&self, phone_number: &str) -> Vec<Message> {
        match self.try_list_messages(phone_number).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(phone_number, error = %e, "Error fetching messages");
                Vec::new()
            }
        }
    }

    /// Like [`list_messages`](Self::list_messages) but lets the caller keep
    /// its last-known list when the store is unreachable.
    pub async fn try_list_messages(&self, phone_number: &str) -> Result<Vec<Message>, StoreError> {
        self.store.messages(phone_number).await
    }

    pub async fn latest_message(&self, phone_number: &str) -> Result<Option<Message>, StoreError> {
        self.store.latest_message(phone_number).await
    }

    pub async fn latest_per_phone(&self) -> Result<Vec<Message>, StoreError> {
        self.store.latest_per_phone().await
    }

    /// Creates one message with status `sent`. Invalid input never reaches
    /// the backend.
    pub async fn insert_message(&self, message: &NewMessage) -> Result<Message, StoreError> {
        if let Err(e) = message.validate() {
            warn!(phone_number = %message.phone_number, error = %e, "Rejected message insert");
            return Err(e);
        }

        match self.store.insert(message).await {
            Ok(created) => {
                info!(id = %created.id, phone_number = %created.phone_number, "Inserted message");
                Ok(created)
            }
            Err(e) if e.is_unavailable() => {
                error!(phone_number = %message.phone_number, error = %e, "Error inserting message");
                Err(e)
            }
            Err(e) => {
                warn!(phone_number = %message.phone_number, error = %e, "Backend refused message insert");
                Err(e)
            }
        }
    }

    pub async fn mark_status(&self, id: &MessageId, status: DeliveryStatus) -> Result<Message, StoreError> {
        match self.store.update_status(id, status).await {
            Ok(updated) => Ok(updated),
            Err(e) => {
                warn!(id = %id, status = %status, error = %e, "Error updating delivery status");
                Err(e)
            }
        }
    }
}
