use crate::chat::{Message, MessageId};
use std::collections::{HashMap, HashSet};

/// Messages of one conversation as shown on screen, oldest first, each id
/// at most once.
///
/// Live inserts and full loads can interleave in any order; both paths go
/// through the id index so the result neither loses nor repeats a row.
#[derive(Debug, Clone, Default)]
pub struct MessageList {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    /// Merges a message pushed by the change feed. Returns whether the
    /// visible list changed.
    ///
    /// A known id is only replaced when the pushed copy carries a later
    /// delivery status. A new message goes after every message with the
    /// same or an earlier timestamp, which is a plain append when the feed
    /// delivers in creation order.
    pub fn merge_live(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) else {
                return false;
            };
            if existing.status.can_advance_to(message.status) {
                *existing = message;
                return true;
            }
            return false;
        }

        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.ids.insert(message.id.clone());
        self.messages.insert(at, message);
        true
    }

    /// Merges a full load of the conversation. Rows held locally but absent
    /// from the load (pushed while the load was in flight) are kept.
    pub fn merge_snapshot(&mut self, loaded: Vec<Message>) {
        let held = std::mem::take(&mut self.messages);
        self.ids.clear();

        let mut position = HashMap::with_capacity(loaded.len());
        for message in loaded {
            if self.ids.insert(message.id.clone()) {
                position.insert(message.id.clone(), self.messages.len());
                self.messages.push(message);
            }
        }

        let mut pushed = false;
        for message in held {
            match position.get(&message.id) {
                Some(&index) => {
                    let existing = &mut self.messages[index];
                    if existing.status.can_advance_to(message.status) {
                        existing.status = message.status;
                    }
                }
                None => {
                    self.ids.insert(message.id.clone());
                    self.messages.push(message);
                    pushed = true;
                }
            }
        }

        // Stable, so held rows land after loaded rows with the same timestamp.
        if pushed {
            self.messages.sort_by_key(|m| m.created_at);
        }
    }
}
