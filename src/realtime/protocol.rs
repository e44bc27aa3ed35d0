//! Wire types for the Phoenix channel protocol spoken by the hosted
//! realtime service.

use super::{ChangeEvent, ChangeFilter, ChangeOperation};
use crate::chat::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const PHOENIX_TOPIC: &str = "phoenix";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
pub const EVENT_SYSTEM: &str = "system";

/// One frame on the socket, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn new(topic: impl Into<String>, event: &str, payload: Value, reference: Option<String>) -> Self {
        Self {
            topic: topic.into(),
            event: event.to_string(),
            payload,
            reference,
            join_ref: None,
        }
    }

    pub fn join(topic: &str, payload: Value, reference: String) -> Self {
        Self {
            join_ref: Some(reference.clone()),
            ..Self::new(topic, EVENT_JOIN, payload, Some(reference))
        }
    }

    pub fn leave(topic: &str, reference: String) -> Self {
        Self::new(topic, EVENT_LEAVE, Value::Object(Default::default()), Some(reference))
    }

    pub fn heartbeat(reference: String) -> Self {
        Self::new(
            PHOENIX_TOPIC,
            EVENT_HEARTBEAT,
            Value::Object(Default::default()),
            Some(reference),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyPayload {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

impl ReplyPayload {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn reason(&self) -> String {
        self.response
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.response.to_string())
    }
}

#[derive(Debug, Serialize)]
struct PostgresChangeConfig<'a> {
    event: &'a str,
    schema: &'a str,
    table: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
}

/// `phx_join` payload asking for row changes matching `filter`.
pub fn join_payload(filter: &ChangeFilter, schema: &str, access_token: &str) -> Value {
    let changes: Vec<PostgresChangeConfig<'_>> = filter
        .operations
        .iter()
        .map(|op| PostgresChangeConfig {
            event: op.as_str(),
            schema,
            table: &filter.table,
            filter: filter.predicate(),
        })
        .collect();

    serde_json::json!({
        "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": "" },
            "postgres_changes": changes,
        },
        "access_token": access_token,
    })
}

#[derive(Debug, Deserialize)]
struct ChangesPayload {
    data: ChangeData,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: String,
    table: String,
    #[serde(default)]
    record: Option<Value>,
}

/// Extracts the change carried by a `postgres_changes` push. Deletes and
/// malformed rows yield `None`.
pub fn decode_change(payload: &Value) -> Option<ChangeEvent> {
    let changes: ChangesPayload = match serde_json::from_value(payload.clone()) {
        Ok(changes) => changes,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed postgres_changes payload");
            return None;
        }
    };

    let operation = match changes.data.kind.as_str() {
        "INSERT" => ChangeOperation::Insert,
        "UPDATE" => ChangeOperation::Update,
        _ => return None,
    };

    let record: Message = match changes.data.record.map(serde_json::from_value).transpose() {
        Ok(Some(record)) => record,
        Ok(None) => return None,
        Err(e) => {
            warn!(table = %changes.data.table, error = %e, "Ignoring undecodable change record");
            return None;
        }
    };

    Some(ChangeEvent {
        operation,
        table: changes.data.table,
        record,
    })
}
