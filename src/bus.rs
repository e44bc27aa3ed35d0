use crate::error::RealtimeError;
use crate::realtime::{
    ChangeEvent, ChangeFeed, ChangeFilter, Subscription, SubscriptionEvent, SubscriptionStatus,
};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// In-process change feed. The SQLite store publishes here after every
/// write, which gives the local backend the same live behaviour as the
/// hosted one.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    #[cfg(test)]
    pub fn raw_subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ChangeEvent) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl ChangeFeed for EventBus {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, RealtimeError> {
        let topic = format!("local:{}:{}", filter.table, Uuid::new_v4().simple());
        let (subscription, tx, mut leave) = Subscription::channel(topic.clone());
        let mut rx = self.tx.subscribe();

        if tx
            .send(SubscriptionEvent::Status(SubscriptionStatus::Subscribed))
            .await
            .is_err()
        {
            return Err(RealtimeError::Closed);
        }

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut leave => break,
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if !filter.matches(&event) {
                                continue;
                            }
                            if tx.send(SubscriptionEvent::Change(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Local change feed lagged");
                            let status = SubscriptionEvent::Status(SubscriptionStatus::Lagged(skipped));
                            if tx.send(status).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = tx.send(SubscriptionEvent::Status(SubscriptionStatus::Closed)).await;
                            break;
                        }
                    },
                }
            }
            debug!(topic = %topic, "Local subscription finished");
        });

        Ok(subscription)
    }
}
