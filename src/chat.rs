use crate::entity::SenderRole;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Opaque row identifier. PostgREST hands out numeric identities while the
/// local store uses UUIDs, so both shapes are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(i64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => MessageId(s),
            Raw::Int(n) => MessageId(n.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }

    /// Statuses strictly earlier than `self`, i.e. the ones a row may hold
    /// before being moved to `self`.
    pub fn predecessors(&self) -> &'static [DeliveryStatus] {
        match self {
            DeliveryStatus::Sent => &[],
            DeliveryStatus::Delivered => &[DeliveryStatus::Sent],
            DeliveryStatus::Read => &[DeliveryStatus::Sent, DeliveryStatus::Delivered],
        }
    }

    pub fn can_advance_to(&self, next: DeliveryStatus) -> bool {
        next > *self
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            other => Err(format!("unknown delivery status '{}'", other)),
        }
    }
}

/// One row of the messages table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub phone_number: String,
    pub sender_type: SenderRole,
    /// Body text.
    pub message: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A message about to be inserted. Rows are always created as `sent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub phone_number: String,
    pub message: String,
    #[serde(default)]
    pub sender_type: SenderRole,
    /// Left to the backend clock when absent.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp::option")]
    pub created_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn new(phone_number: impl Into<String>, message: impl Into<String>, sender_type: SenderRole) -> Self {
        Self {
            phone_number: phone_number.into(),
            message: message.into(),
            sender_type,
            created_at: None,
        }
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.phone_number.trim().is_empty() {
            return Err(StoreError::Rejected("phone_number is required".to_string()));
        }
        if self.message.trim().is_empty() {
            return Err(StoreError::Rejected("message is required".to_string()));
        }
        Ok(())
    }
}

/// Latest-message view of one conversation, derived from the messages
/// sharing a phone number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub phone_number: String,
    #[serde(with = "timestamp")]
    pub last_message_at: DateTime<Utc>,
    #[serde(rename = "lastMessage")]
    pub last_message: String,
}

impl ConversationSummary {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            id: msg.phone_number.clone(),
            phone_number: msg.phone_number.clone(),
            last_message_at: msg.created_at,
            last_message: msg.message.clone(),
        }
    }
}

/// Serde glue for backend timestamps. Postgres emits RFC 3339 with a full
/// offset through PostgREST but the change feed may send `+00` or no offset.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
            if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
                return Some(dt.with_timezone(&Utc));
            }
        }
        for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
                return Some(naive.and_utc());
            }
        }
        None
    }

    pub fn format(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp '{}'", raw)))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(dt: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => serializer.serialize_str(&super::format(dt)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::parse(&raw)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("invalid timestamp '{}'", raw))),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn decodes_postgrest_row() {
        let row = serde_json::json!({
            "id": 42,
            "phone_number": "+111",
            "sender_type": "bot",
            "message": "hola",
            "created_at": "2024-03-01T10:05:00.123456+00:00",
            "status": "delivered",
            "media_url": null,
            "metadata": {"campaign": "spring"}
        });

        let msg: Message = serde_json::from_value(row).unwrap();
        assert_eq!(msg.id.as_str(), "42");
        assert_eq!(msg.sender_type, SenderRole::Bot);
        assert_eq!(msg.status, DeliveryStatus::Delivered);
        assert_eq!(msg.media_url, None);
        assert_eq!(
            msg.created_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap() + chrono::Duration::microseconds(123456)
        );
    }

    #[test]
    fn accepts_realtime_timestamp_shapes() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(timestamp::parse("2024-03-01 10:00:00+00"), Some(expected));
        assert_eq!(timestamp::parse("2024-03-01T10:00:00"), Some(expected));
        assert_eq!(timestamp::parse("2024-03-01T12:00:00+02:00"), Some(expected));
        assert_eq!(timestamp::parse("yesterday"), None);
    }

    #[test]
    fn status_only_moves_forward() {
        assert!(DeliveryStatus::Sent.can_advance_to(DeliveryStatus::Delivered));
        assert!(DeliveryStatus::Sent.can_advance_to(DeliveryStatus::Read));
        assert!(DeliveryStatus::Delivered.can_advance_to(DeliveryStatus::Read));
        assert!(!DeliveryStatus::Read.can_advance_to(DeliveryStatus::Delivered));
        assert!(!DeliveryStatus::Delivered.can_advance_to(DeliveryStatus::Delivered));
        assert_eq!(DeliveryStatus::Read.predecessors().len(), 2);
    }

    #[test]
    fn new_message_requires_phone_and_body() {
        assert!(NewMessage::new("+1", "hi", SenderRole::User).validate().is_ok());
        assert!(matches!(
            NewMessage::new("  ", "hi", SenderRole::User).validate(),
            Err(StoreError::Rejected(_))
        ));
        assert!(matches!(
            NewMessage::new("+1", "", SenderRole::Bot).validate(),
            Err(StoreError::Rejected(_))
        ));
    }

    #[test]
    fn summary_uses_camel_case_body_field() {
        let msg = Message {
            id: MessageId::new("a"),
            phone_number: "+111".into(),
            sender_type: SenderRole::User,
            message: "there".into(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap(),
            status: DeliveryStatus::Sent,
            media_url: None,
            metadata: None,
        };
        let json = serde_json::to_value(ConversationSummary::from_message(&msg)).unwrap();
        assert_eq!(json["lastMessage"], "there");
        assert_eq!(json["id"], "+111");
    }
}
