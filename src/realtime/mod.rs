//! Change-event channel: the row-level notifications the backend pushes when
//! the messages table changes, plus the subscription handles views consume.

pub mod protocol;
pub mod socket;

use crate::chat::Message;
use crate::error::RealtimeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, oneshot};

pub use socket::{RealtimeClient, RealtimeConfig};

/// Capacity of the per-subscription queue feeding a view's consumer task.
pub const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
        }
    }
}

/// A row inserted into or updated in the messages table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub table: String,
    pub record: Message,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, record: Message) -> Self {
        Self {
            operation: ChangeOperation::Insert,
            table: table.into(),
            record,
        }
    }

    pub fn update(table: impl Into<String>, record: Message) -> Self {
        Self {
            operation: ChangeOperation::Update,
            table: table.into(),
            record,
        }
    }
}

/// Which events a subscription wants: one table, optionally narrowed by an
/// equality predicate on the phone number column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub table: String,
    pub phone_number: Option<String>,
    pub operations: Vec<ChangeOperation>,
}

impl ChangeFilter {
    /// Every insert and update on the table.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            phone_number: None,
            operations: vec![ChangeOperation::Insert, ChangeOperation::Update],
        }
    }

    /// Inserts and updates for a single conversation.
    pub fn conversation(table: impl Into<String>, phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: Some(phone_number.into()),
            ..Self::table(table)
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.table == self.table
            && self.operations.contains(&event.operation)
            && self
                .phone_number
                .as_deref()
                .map_or(true, |phone| event.record.phone_number == phone)
    }

    /// PostgREST-style column predicate, e.g. `phone_number=eq.+111`.
    pub fn predicate(&self) -> Option<String> {
        self.phone_number
            .as_ref()
            .map(|phone| format!("phone_number=eq.{}", phone))
    }
}

/// Lifecycle transitions of a subscription's underlying channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Subscribed,
    /// The connection dropped and the channel was joined again; events may
    /// have been missed in between.
    Resubscribed,
    /// The consumer fell behind and events were discarded.
    Lagged(u64),
    ChannelError(String),
    Closed,
}

impl SubscriptionStatus {
    /// Whether held state may be stale and should be reloaded.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Resubscribed | SubscriptionStatus::Lagged(_)
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionStatus::Subscribed => f.write_str("SUBSCRIBED"),
            SubscriptionStatus::Resubscribed => f.write_str("RESUBSCRIBED"),
            SubscriptionStatus::Lagged(n) => write!(f, "LAGGED({})", n),
            SubscriptionStatus::ChannelError(reason) => write!(f, "CHANNEL_ERROR({})", reason),
            SubscriptionStatus::Closed => f.write_str("CLOSED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Change(ChangeEvent),
    Status(SubscriptionStatus),
}

/// Keeps a subscription alive. Dropping it leaves the channel; the feed
/// stops forwarding as soon as it observes the drop.
#[derive(Debug)]
pub struct SubscriptionGuard {
    topic: String,
    _leave: oneshot::Sender<()>,
}

impl SubscriptionGuard {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// A live subscription: the ordered event queue plus the guard holding the
/// channel open.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::Receiver<SubscriptionEvent>,
    guard: SubscriptionGuard,
}

impl Subscription {
    /// Builds the handle pair used by feed implementations. The returned
    /// receiver resolves once the guard is dropped.
    pub fn channel(
        topic: impl Into<String>,
    ) -> (Self, mpsc::Sender<SubscriptionEvent>, oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (leave_tx, leave_rx) = oneshot::channel();
        let subscription = Self {
            events: rx,
            guard: SubscriptionGuard {
                topic: topic.into(),
                _leave: leave_tx,
            },
        };
        (subscription, tx, leave_rx)
    }

    pub fn topic(&self) -> &str {
        self.guard.topic()
    }

    #[cfg(test)]
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    pub fn split(self) -> (mpsc::Receiver<SubscriptionEvent>, SubscriptionGuard) {
        (self.events, self.guard)
    }
}

/// Anything that can deliver change events for the messages table.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, RealtimeError>;
}
