//! Conversation list: one summary per phone number, newest first.

use crate::chat::{ConversationSummary, Message};
use crate::store::StoreClient;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, warn};

/// How the latest message of every conversation is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SummaryStrategy {
    /// One newest-first query per phone number, run concurrently.
    PerPhone,
    /// A single query returning every phone number's newest row.
    #[default]
    Aggregate,
}

impl FromStr for SummaryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "per-phone" | "per_phone" => Ok(SummaryStrategy::PerPhone),
            "aggregate" => Ok(SummaryStrategy::Aggregate),
            other => Err(format!("unknown summary strategy '{}'", other)),
        }
    }
}

/// Sorts newest first. The sort is stable, so equal timestamps keep their
/// incoming order.
pub fn sort_by_recency(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
}

/// Builds the summary list from a set of messages.
pub fn summarize<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Vec<ConversationSummary> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, ConversationSummary> = HashMap::new();

    for message in messages {
        match latest.get_mut(&message.phone_number) {
            Some(summary) => {
                if message.created_at >= summary.last_message_at {
                    summary.last_message_at = message.created_at;
                    summary.last_message = message.message.clone();
                }
            }
            None => {
                order.push(message.phone_number.clone());
                latest.insert(message.phone_number.clone(), ConversationSummary::from_message(message));
            }
        }
    }

    let mut summaries: Vec<ConversationSummary> = order
        .into_iter()
        .filter_map(|phone| latest.remove(&phone))
        .collect();
    sort_by_recency(&mut summaries);
    summaries
}

/// Folds one observed message into an existing list without reloading.
/// Returns whether the list changed.
pub fn apply_to_summaries(summaries: &mut Vec<ConversationSummary>, message: &Message) -> bool {
    match summaries
        .iter()
        .position(|s| s.phone_number == message.phone_number)
    {
        Some(index) => {
            let current = &summaries[index];
            if message.created_at < current.last_message_at {
                return false;
            }
            if message.created_at == current.last_message_at && message.message == current.last_message {
                return false;
            }
            let mut summary = summaries.remove(index);
            summary.last_message_at = message.created_at;
            summary.last_message = message.message.clone();
            insert_by_recency(summaries, summary);
            true
        }
        None => {
            insert_by_recency(summaries, ConversationSummary::from_message(message));
            true
        }
    }
}

fn insert_by_recency(summaries: &mut Vec<ConversationSummary>, summary: ConversationSummary) {
    let at = summaries
        .iter()
        .position(|s| s.last_message_at < summary.last_message_at)
        .unwrap_or(summaries.len());
    summaries.insert(at, summary);
}

/// The search box of the conversation list: phone substring or
/// case-insensitive match on the last message.
pub fn filter_summaries(summaries: &[ConversationSummary], query: &str) -> Vec<ConversationSummary> {
    let query = query.trim();
    if query.is_empty() {
        return summaries.to_vec();
    }
    let needle = query.to_lowercase();
    summaries
        .iter()
        .filter(|s| s.phone_number.contains(query) || s.last_message.to_lowercase().contains(&needle))
        .cloned()
        .collect()
}

/// Computes the conversation list from the store. Never fails: phone
/// numbers whose latest message cannot be fetched are left out.
pub async fn load_summaries(client: &StoreClient, strategy: SummaryStrategy) -> Vec<ConversationSummary> {
    if strategy == SummaryStrategy::Aggregate {
        match client.latest_per_phone().await {
            Ok(latest) => return summarize(&latest),
            Err(e) => warn!(error = %e, "Aggregate summary query failed, falling back to per-phone queries"),
        }
    }

    let phones = client.list_distinct_phone_numbers().await;
    if phones.is_empty() {
        return Vec::new();
    }

    let lookups = phones.iter().map(|phone| async move {
        match client.latest_message(phone).await {
            Ok(Some(message)) => Some(ConversationSummary::from_message(&message)),
            Ok(None) => {
                debug!(phone_number = %phone, "Phone number has no messages anymore");
                None
            }
            Err(e) => {
                warn!(phone_number = %phone, error = %e, "Leaving conversation out of the list");
                None
            }
        }
    });

    let mut summaries: Vec<ConversationSummary> = join_all(lookups).await.into_iter().flatten().collect();
    sort_by_recency(&mut summaries);
    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::chat::NewMessage;
    use crate::entity::SenderRole;
    use crate::realtime::tests::message;
    use crate::store::testing::FlakyStore;
    use crate::store::SqliteStore;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    #[test]
    fn latest_message_wins_per_phone() {
        let messages = vec![
            message("1", "+111", "hi", 0),
            message("2", "+222", "yo", 2),
            message("3", "+111", "there", 5),
        ];

        let summaries = summarize(&messages);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].phone_number, "+111");
        assert_eq!(summaries[0].last_message, "there");
        assert_eq!(
            summaries[0].last_message_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap()
        );
        assert_eq!(summaries[1].last_message, "yo");
    }

    #[test]
    fn one_summary_per_phone_sorted_descending() {
        let messages: Vec<Message> = (0..30)
            .map(|i| message(&i.to_string(), &format!("+{}", i % 7), "m", (i * 13 % 60) as u32))
            .collect();

        let summaries = summarize(&messages);
        assert_eq!(summaries.len(), 7);
        for pair in summaries.windows(2) {
            assert!(pair[0].last_message_at >= pair[1].last_message_at);
        }
        for summary in &summaries {
            let max = messages
                .iter()
                .filter(|m| m.phone_number == summary.phone_number)
                .map(|m| m.created_at)
                .max()
                .unwrap();
            assert_eq!(summary.last_message_at, max);
        }
    }

    #[test]
    fn ties_keep_first_seen_order() {
        let messages = vec![message("1", "+b", "x", 1), message("2", "+a", "y", 1)];
        let summaries = summarize(&messages);
        let phones: Vec<_> = summaries.iter().map(|s| s.phone_number.as_str()).collect();
        assert_eq!(phones, ["+b", "+a"]);
    }

    #[test]
    fn patch_moves_conversation_to_top() {
        let mut summaries = summarize(&[message("1", "+111", "old", 0), message("2", "+222", "mid", 3)]);
        assert!(apply_to_summaries(&mut summaries, &message("3", "+111", "new", 9)));
        assert_eq!(summaries[0].phone_number, "+111");
        assert_eq!(summaries[0].last_message, "new");

        // Older than what is shown: nothing to do.
        assert!(!apply_to_summaries(&mut summaries, &message("4", "+222", "stale", 1)));

        assert!(apply_to_summaries(&mut summaries, &message("5", "+333", "first", 5)));
        let phones: Vec<_> = summaries.iter().map(|s| s.phone_number.as_str()).collect();
        assert_eq!(phones, ["+111", "+333", "+222"]);
    }

    #[test]
    fn search_matches_phone_or_body() {
        let summaries = summarize(&[message("1", "+34600", "Hola Mundo", 0), message("2", "+1555", "bye", 1)]);
        assert_eq!(filter_summaries(&summaries, "mundo").len(), 1);
        assert_eq!(filter_summaries(&summaries, "555")[0].phone_number, "+1555");
        assert_eq!(filter_summaries(&summaries, "  ").len(), 2);
        assert!(filter_summaries(&summaries, "nothing").is_empty());
    }

    async fn seeded() -> (StoreClient, Arc<FlakyStore>) {
        let store = SqliteStore::in_memory(EventBus::new()).await.unwrap();
        let flaky = Arc::new(FlakyStore::new(Arc::new(store)));
        let client = StoreClient::new(flaky.clone());
        let at = |m| Utc.with_ymd_and_hms(2024, 3, 1, 10, m, 0).unwrap();
        for (phone, body, minute) in [
            ("+111", "hi", 0),
            ("+111", "there", 5),
            ("+222", "hello", 3),
            ("+333", "hey", 7),
        ] {
            client
                .insert_message(&NewMessage::new(phone, body, SenderRole::User).at(at(minute)))
                .await
                .unwrap();
        }
        (client, flaky)
    }

    #[tokio::test]
    async fn strategies_agree() {
        let (client, _) = seeded().await;
        let aggregate = load_summaries(&client, SummaryStrategy::Aggregate).await;
        let per_phone = load_summaries(&client, SummaryStrategy::PerPhone).await;

        assert_eq!(aggregate, per_phone);
        let phones: Vec<_> = aggregate.iter().map(|s| s.phone_number.as_str()).collect();
        assert_eq!(phones, ["+333", "+111", "+222"]);
        assert_eq!(aggregate[1].last_message, "there");
    }

    #[tokio::test]
    async fn failing_phone_is_excluded() {
        let (client, flaky) = seeded().await;
        flaky.fail_phone("+111");

        for strategy in [SummaryStrategy::PerPhone, SummaryStrategy::Aggregate] {
            let summaries = load_summaries(&client, strategy).await;
            let phones: Vec<_> = summaries.iter().map(|s| s.phone_number.as_str()).collect();
            assert_eq!(phones, ["+333", "+222"]);
        }
    }

    #[tokio::test]
    async fn outage_yields_empty_list() {
        let (client, flaky) = seeded().await;
        flaky.set_down(true);
        assert!(load_summaries(&client, SummaryStrategy::Aggregate).await.is_empty());
    }
}
