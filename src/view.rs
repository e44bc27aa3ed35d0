//! Live views: state kept in step with the change feed.
//!
//! Each view owns one subscription and a single task consuming it, so
//! events for a view are applied one at a time and in delivery order.
//! Every mutation and every callback happens under the view's state lock
//! after checking the `closed` flag; [`close`](ConversationView::close)
//! sets that flag under the same lock, so once it returns no callback for
//! the view can run again.

use crate::aggregate::{apply_to_summaries, load_summaries, SummaryStrategy};
use crate::chat::{ConversationSummary, Message};
use crate::error::RealtimeError;
use crate::merge::MessageList;
use crate::realtime::{
    ChangeFeed, ChangeFilter, ChangeOperation, SubscriptionEvent, SubscriptionGuard, SubscriptionStatus,
};
use crate::store::StoreClient;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type MessagesCallback = Arc<dyn Fn(&str, &[Message]) + Send + Sync>;
pub type ConversationsCallback = Arc<dyn Fn(&[ConversationSummary]) + Send + Sync>;

/// What the conversation list does with a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListRefresh {
    /// Recompute the whole list through the aggregator.
    #[default]
    Reload,
    /// Fold the changed row into the current list.
    Patch,
}

impl FromStr for ListRefresh {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "reload" => Ok(ListRefresh::Reload),
            "patch" => Ok(ListRefresh::Patch),
            other => Err(format!("unknown list refresh mode '{}'", other)),
        }
    }
}

struct Guarded<T> {
    data: T,
    closed: bool,
}

impl<T> Guarded<T> {
    fn new(data: T) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self { data, closed: false }))
    }
}

/// Plumbing shared by both views.
struct Live<T> {
    state: Arc<Mutex<Guarded<T>>>,
    task: JoinHandle<()>,
    guard: SubscriptionGuard,
}

impl<T> Live<T> {
    async fn close(self) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
        }
        self.task.abort();
        info!(topic = %self.guard.topic(), "Unsubscribed view");
        drop(self.guard);
    }
}

/// The open chat pane: every message of one phone number.
pub struct ConversationView {
    phone_number: String,
    client: StoreClient,
    on_change: MessagesCallback,
    live: Live<MessageList>,
}

impl ConversationView {
    /// Subscribes to inserts and updates for `phone_number`, then loads the
    /// conversation. Events that race the load are merged by id.
    pub async fn open(
        client: StoreClient,
        feed: &dyn ChangeFeed,
        table: &str,
        phone_number: &str,
        on_change: MessagesCallback,
    ) -> Result<Self, RealtimeError> {
        let subscription = feed
            .subscribe(ChangeFilter::conversation(table, phone_number))
            .await?;
        info!(phone_number, topic = %subscription.topic(), "Subscribed to conversation");
        let (events, guard) = subscription.split();

        let state = Guarded::new(MessageList::new());
        let task = tokio::spawn(consume_conversation(
            events,
            client.clone(),
            state.clone(),
            phone_number.to_string(),
            on_change.clone(),
        ));

        let view = Self {
            phone_number: phone_number.to_string(),
            client,
            on_change,
            live: Live { state, task, guard },
        };
        view.reload().await;
        Ok(view)
    }

    pub fn phone_number(&self) -> &str {
        &self.phone_number
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.live.state.lock().await.data.as_slice().to_vec()
    }

    pub async fn reload(&self) {
        reload_messages(&self.client, &self.live.state, &self.phone_number, &self.on_change).await;
    }

    pub async fn close(self) {
        self.live.close().await;
    }
}

async fn consume_conversation(
    mut events: mpsc::Receiver<SubscriptionEvent>,
    client: StoreClient,
    state: Arc<Mutex<Guarded<MessageList>>>,
    phone_number: String,
    on_change: MessagesCallback,
) {
    while let Some(event) = events.recv().await {
        match event {
            SubscriptionEvent::Change(change) => match change.operation {
                ChangeOperation::Insert => {
                    debug!(phone_number = %phone_number, id = %change.record.id, "New message received");
                    let mut guarded = state.lock().await;
                    if guarded.closed {
                        break;
                    }
                    if guarded.data.merge_live(change.record) {
                        on_change(&phone_number, guarded.data.as_slice());
                    }
                }
                // Treat an update as "held state may be stale".
                ChangeOperation::Update => {
                    reload_messages(&client, &state, &phone_number, &on_change).await;
                }
            },
            SubscriptionEvent::Status(status) if status.requires_resync() => {
                info!(phone_number = %phone_number, status = %status, "Reloading conversation after gap");
                reload_messages(&client, &state, &phone_number, &on_change).await;
            }
            SubscriptionEvent::Status(SubscriptionStatus::Closed) => {
                warn!(phone_number = %phone_number, "Conversation subscription closed");
                break;
            }
            SubscriptionEvent::Status(status) => {
                info!(phone_number = %phone_number, status = %status, "Conversation subscription status");
            }
        }
    }
}

async fn reload_messages(
    client: &StoreClient,
    state: &Mutex<Guarded<MessageList>>,
    phone_number: &str,
    on_change: &MessagesCallback,
) {
    match client.try_list_messages(phone_number).await {
        Ok(loaded) => {
            let mut guarded = state.lock().await;
            if guarded.closed {
                return;
            }
            guarded.data.merge_snapshot(loaded);
            on_change(phone_number, guarded.data.as_slice());
        }
        Err(e) => {
            warn!(phone_number, error = %e, "Error fetching messages, keeping last-known list");
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub table: String,
    pub strategy: SummaryStrategy,
    pub refresh: ListRefresh,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            table: "messages".to_string(),
            strategy: SummaryStrategy::default(),
            refresh: ListRefresh::default(),
        }
    }
}

/// Summaries plus bookkeeping that lets a slow recompute lose against a
/// newer one that finished first.
///
/// Patches that land while a recompute is in flight are kept in `replay`,
/// tagged with the newest ticket issued at the time, so a load that was
/// read before them does not wipe them out.
#[derive(Default)]
struct SummaryState {
    summaries: Vec<ConversationSummary>,
    issued: u64,
    applied: u64,
    replay: Vec<(u64, Message)>,
}

impl SummaryState {
    fn patch(&mut self, message: &Message) -> bool {
        if self.issued > self.applied {
            self.replay.push((self.issued, message.clone()));
        }
        apply_to_summaries(&mut self.summaries, message) && self.applied > 0
    }

    /// Installs the result of recompute `ticket`. False when a newer one
    /// already won.
    fn install(&mut self, ticket: u64, loaded: Vec<ConversationSummary>) -> bool {
        if ticket <= self.applied {
            return false;
        }
        self.applied = ticket;
        self.summaries = loaded;
        // Anything patched after this load was issued may be missing from it.
        self.replay.retain(|(seen, _)| *seen >= ticket);
        for (_, message) in &self.replay {
            apply_to_summaries(&mut self.summaries, message);
        }
        if self.applied == self.issued {
            self.replay.clear();
        }
        true
    }
}

/// The conversation list pane.
pub struct ConversationListView {
    client: StoreClient,
    options: ListOptions,
    on_change: ConversationsCallback,
    live: Live<SummaryState>,
}

impl ConversationListView {
    pub async fn open(
        client: StoreClient,
        feed: &dyn ChangeFeed,
        options: ListOptions,
        on_change: ConversationsCallback,
    ) -> Result<Self, RealtimeError> {
        let subscription = feed.subscribe(ChangeFilter::table(&options.table)).await?;
        info!(topic = %subscription.topic(), "Subscribed to conversation list");
        let (events, guard) = subscription.split();

        let state = Guarded::new(SummaryState::default());
        let task = tokio::spawn(consume_list(
            events,
            client.clone(),
            state.clone(),
            options.clone(),
            on_change.clone(),
        ));

        let view = Self {
            client,
            options,
            on_change,
            live: Live { state, task, guard },
        };
        view.reload().await;
        Ok(view)
    }

    pub async fn summaries(&self) -> Vec<ConversationSummary> {
        self.live.state.lock().await.data.summaries.clone()
    }

    pub async fn reload(&self) {
        recompute(&self.client, &self.live.state, self.options.strategy, &self.on_change).await;
    }

    pub async fn close(self) {
        self.live.close().await;
    }
}

async fn consume_list(
    mut events: mpsc::Receiver<SubscriptionEvent>,
    client: StoreClient,
    state: Arc<Mutex<Guarded<SummaryState>>>,
    options: ListOptions,
    on_change: ConversationsCallback,
) {
    while let Some(event) = events.recv().await {
        match event {
            SubscriptionEvent::Change(change) => {
                debug!(operation = change.operation.as_str(), phone_number = %change.record.phone_number, "Change detected in messages");
                match options.refresh {
                    ListRefresh::Reload => recompute(&client, &state, options.strategy, &on_change).await,
                    ListRefresh::Patch => {
                        let mut guarded = state.lock().await;
                        if guarded.closed {
                            break;
                        }
                        if guarded.data.patch(&change.record) {
                            on_change(&guarded.data.summaries);
                        }
                    }
                }
            }
            SubscriptionEvent::Status(status) if status.requires_resync() => {
                info!(status = %status, "Recomputing conversation list after gap");
                recompute(&client, &state, options.strategy, &on_change).await;
            }
            SubscriptionEvent::Status(SubscriptionStatus::Closed) => {
                warn!("Conversation list subscription closed");
                break;
            }
            SubscriptionEvent::Status(status) => {
                info!(status = %status, "Conversation list subscription status");
            }
        }
    }
}

async fn recompute(
    client: &StoreClient,
    state: &Mutex<Guarded<SummaryState>>,
    strategy: SummaryStrategy,
    on_change: &ConversationsCallback,
) {
    let ticket = {
        let mut guarded = state.lock().await;
        if guarded.closed {
            return;
        }
        guarded.data.issued += 1;
        guarded.data.issued
    };

    let summaries = load_summaries(client, strategy).await;

    let mut guarded = state.lock().await;
    if guarded.closed || !guarded.data.install(ticket, summaries) {
        return;
    }
    on_change(&guarded.data.summaries);
}
