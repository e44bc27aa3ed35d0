//! Plain-text rendering of the two panes.

use crate::chat::{ConversationSummary, DeliveryStatus, Message};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt::{Display, Write};

/// Last two characters of the phone number, shown where a picture would be.
pub fn avatar(phone_number: &str) -> String {
    let tail: Vec<char> = phone_number.chars().rev().take(2).collect();
    tail.into_iter().rev().collect()
}

/// `HH:MM` for today, `Yesterday`, otherwise `dd/mm/yyyy`, all in the
/// time zone of `now`.
pub fn format_list_time<Tz>(at: &DateTime<Utc>, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let local = at.with_timezone(&now.timezone());
    let today = now.date_naive();
    if local.date_naive() == today {
        local.format("%H:%M").to_string()
    } else if Some(local.date_naive()) == today.checked_sub_signed(Duration::days(1)) {
        "Yesterday".to_string()
    } else {
        local.format("%d/%m/%Y").to_string()
    }
}

pub fn format_message_time<Tz>(at: &DateTime<Utc>, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.with_timezone(tz).format("%H:%M").to_string()
}

pub fn render_summary<Tz>(summary: &ConversationSummary, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let preview = if summary.last_message.is_empty() {
        "No messages"
    } else {
        summary.last_message.as_str()
    };
    format!(
        "({}) {}  {}\n     {}",
        avatar(&summary.phone_number),
        summary.phone_number,
        format_list_time(&summary.last_message_at, now),
        preview
    )
}

pub fn render_conversation_list<Tz>(summaries: &[ConversationSummary], now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    if summaries.is_empty() {
        return "No conversations found".to_string();
    }
    let mut out = String::new();
    for summary in summaries {
        let _ = writeln!(out, "{}", render_summary(summary, now));
    }
    out
}

/// One chat bubble. Outbound messages carry delivery ticks; inbound ones
/// are indented to the left.
pub fn render_message<Tz>(message: &Message, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let time = format_message_time(&message.created_at, tz);
    let label = message.sender_type.label();
    if message.sender_type.is_outbound() {
        let ticks = if message.status == DeliveryStatus::Read { "✓✓" } else { "✓" };
        format!("{:>8} {}  [{} {} {}]", "", message.message, label, time, ticks)
    } else {
        format!("{}  [{} {}]", message.message, label, time)
    }
}

pub fn render_conversation<Tz>(phone_number: &str, messages: &[Message], tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut out = String::new();
    let _ = writeln!(
        out,
        "({}) {} · {} messages",
        avatar(phone_number),
        phone_number,
        messages.len()
    );
    if messages.is_empty() {
        let _ = writeln!(out, "No messages");
    }
    for message in messages {
        let _ = writeln!(out, "{}", render_message(message, tz));
    }
    out
}
