use crate::aggregate::load_summaries;
use crate::chat::{ConversationSummary, DeliveryStatus, Message, MessageId, NewMessage};
use crate::error::{RealtimeError, StoreError};
use crate::realtime::ChangeFeed;
use crate::store::StoreClient;
use crate::view::{ConversationListView, ConversationView, ConversationsCallback, ListOptions, MessagesCallback};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// What a front end talks to: the conversation list, at most one open
/// conversation, and the write path.
///
/// Registering a new callback of either kind tears down the view it
/// replaces before the new one subscribes.
pub struct Inbox {
    client: StoreClient,
    feed: Arc<dyn ChangeFeed>,
    options: ListOptions,
    list: Mutex<Option<ConversationListView>>,
    selected: Mutex<Option<ConversationView>>,
}

impl Inbox {
    pub fn new(client: StoreClient, feed: Arc<dyn ChangeFeed>, options: ListOptions) -> Self {
        Self {
            client,
            feed,
            options,
            list: Mutex::new(None),
            selected: Mutex::new(None),
        }
    }

    /// The live list when one is open, otherwise a one-off computation.
    pub async fn conversation_summaries(&self) -> Vec<ConversationSummary> {
        if let Some(view) = self.list.lock().await.as_ref() {
            return view.summaries().await;
        }
        load_summaries(&self.client, self.options.strategy).await
    }

    pub async fn messages(&self, phone_number: &str) -> Vec<Message> {
        if let Some(view) = self.selected.lock().await.as_ref() {
            if view.phone_number() == phone_number {
                return view.messages().await;
            }
        }
        self.client.list_messages(phone_number).await
    }

    pub async fn on_conversations_changed(&self, callback: ConversationsCallback) -> Result<(), RealtimeError> {
        let mut slot = self.list.lock().await;
        if let Some(previous) = slot.take() {
            previous.close().await;
        }
        let view = ConversationListView::open(
            self.client.clone(),
            self.feed.as_ref(),
            self.options.clone(),
            callback,
        )
        .await?;
        *slot = Some(view);
        Ok(())
    }

    /// Opens `phone_number` as the selected conversation, closing whichever
    /// one was open.
    pub async fn on_messages_changed(&self, phone_number: &str, callback: MessagesCallback) -> Result<(), RealtimeError> {
        let mut slot = self.selected.lock().await;
        if let Some(previous) = slot.take() {
            info!(phone_number = previous.phone_number(), "Closing conversation");
            previous.close().await;
        }
        let view = ConversationView::open(
            self.client.clone(),
            self.feed.as_ref(),
            &self.options.table,
            phone_number,
            callback,
        )
        .await?;
        *slot = Some(view);
        Ok(())
    }

    pub async fn selected_phone(&self) -> Option<String> {
        self.selected
            .lock()
            .await
            .as_ref()
            .map(|view| view.phone_number().to_string())
    }

    pub async fn close_conversation(&self) {
        if let Some(view) = self.selected.lock().await.take() {
            view.close().await;
        }
    }

    pub async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.client.insert_message(&message).await
    }

    pub async fn mark_status(&self, id: &MessageId, status: DeliveryStatus) -> Result<Message, StoreError> {
        self.client.mark_status(id, status).await
    }

    pub async fn shutdown(&self) {
        self.close_conversation().await;
        if let Some(view) = self.list.lock().await.take() {
            view.close().await;
        }
        info!("Inbox closed");
    }
}
