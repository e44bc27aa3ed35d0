use crate::{
    bus::EventBus,
    chat::{timestamp, DeliveryStatus, Message, MessageId, NewMessage},
    error::StoreError,
    realtime::ChangeEvent,
    store::MessageStore,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

const COLUMNS: &str = "id, phone_number, sender_type, message, created_at, status, media_url, metadata";

/// Local messages table. Every write is echoed on the [`EventBus`] so
/// subscribers see the same change events the hosted backend would push.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    table: String,
    bus: EventBus,
}

impl SqliteStore {
    /// Create a new store backed by the database file at `db_path`.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>, table: impl Into<String>, bus: EventBus) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        let store = Self {
            pool,
            table: table.into(),
            bus,
        };
        store.init().await?;
        Ok(store)
    }

    /// A private in-memory database, used by tests and dry runs.
    pub async fn in_memory(bus: EventBus) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every pooled connection would get its own empty database otherwise.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        let store = Self {
            pool,
            table: "messages".to_string(),
            bus,
        };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        let table = &self.table;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                phone_number TEXT NOT NULL,
                sender_type TEXT NOT NULL CHECK (sender_type IN ('user', 'bot', 'agent')),
                message TEXT NOT NULL,
                created_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'sent' CHECK (status IN ('sent', 'delivered', 'read')),
                media_url TEXT,
                metadata TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_phone_created ON {table}(phone_number, created_at);
            "#
        ))
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_by_id(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM {} WHERE id = ?", self.table))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }
}

fn decode_row(row: &SqliteRow) -> Result<Message, StoreError> {
    let sender: String = row.try_get("sender_type")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let metadata: Option<String> = row.try_get("metadata")?;

    Ok(Message {
        id: MessageId::new(row.try_get::<String, _>("id")?),
        phone_number: row.try_get("phone_number")?,
        sender_type: sender.parse().map_err(StoreError::Decode)?,
        message: row.try_get("message")?,
        created_at: timestamp::parse(&created_at)
            .ok_or_else(|| StoreError::Decode(format!("bad created_at '{}'", created_at)))?,
        status: status.parse().map_err(StoreError::Decode)?,
        media_url: row.try_get("media_url")?,
        metadata: metadata.as_deref().map(serde_json::from_str).transpose()?,
    })
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn distinct_phone_numbers(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT phone_number FROM {} GROUP BY phone_number ORDER BY MAX(created_at) DESC",
            self.table
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("phone_number").map_err(StoreError::from))
            .collect()
    }

    async fn messages(&self, phone_number: &str) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE phone_number = ? ORDER BY created_at ASC, seq ASC",
            self.table
        ))
        .bind(phone_number)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_row).collect()
    }

    async fn latest_message(&self, phone_number: &str) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE phone_number = ? ORDER BY created_at DESC, seq DESC LIMIT 1",
            self.table
        ))
        .bind(phone_number)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn latest_per_phone(&self) -> Result<Vec<Message>, StoreError> {
        let table = &self.table;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM {table} AS m
            WHERE m.seq = (
                SELECT latest.seq FROM {table} AS latest
                WHERE latest.phone_number = m.phone_number
                ORDER BY latest.created_at DESC, latest.seq DESC
                LIMIT 1
            )
            ORDER BY m.created_at DESC, m.seq DESC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_row).collect()
    }

    async fn insert(&self, new: &NewMessage) -> Result<Message, StoreError> {
        new.validate()?;

        let message = Message {
            id: MessageId::new(Uuid::new_v4().to_string()),
            phone_number: new.phone_number.clone(),
            sender_type: new.sender_type,
            message: new.message.clone(),
            created_at: new.created_at.unwrap_or_else(Utc::now),
            status: DeliveryStatus::Sent,
            media_url: None,
            metadata: None,
        };

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, phone_number, sender_type, message, created_at, status)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            self.table
        ))
        .bind(message.id.as_str())
        .bind(&message.phone_number)
        .bind(message.sender_type.as_str())
        .bind(&message.message)
        .bind(timestamp::format(&message.created_at))
        .bind(message.status.as_str())
        .execute(&self.pool)
        .await?;

        self.bus.publish(ChangeEvent::insert(&self.table, message.clone()));
        Ok(message)
    }

    async fn update_status(&self, id: &MessageId, status: DeliveryStatus) -> Result<Message, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar(&format!("SELECT status FROM {} WHERE id = ?", self.table))
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let current: DeliveryStatus = current
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .parse()
            .map_err(StoreError::Decode)?;

        if current == status {
            tx.commit().await?;
            return self
                .fetch_by_id(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()));
        }
        if !current.can_advance_to(status) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: status,
            });
        }

        sqlx::query(&format!("UPDATE {} SET status = ? WHERE id = ?", self.table))
            .bind(status.as_str())
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let updated = self
            .fetch_by_id(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.bus.publish(ChangeEvent::update(&self.table, updated.clone()));
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SenderRole;
    use crate::realtime::ChangeOperation;
    use chrono::{TimeZone, Utc};

    fn at(minute: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn lists_messages_oldest_first() {
        let store = SqliteStore::in_memory(EventBus::new()).await.unwrap();
        store
            .insert(&NewMessage::new("+111", "there", SenderRole::Bot).at(at(5)))
            .await
            .unwrap();
        store
            .insert(&NewMessage::new("+111", "hi", SenderRole::User).at(at(0)))
            .await
            .unwrap();

        let messages = store.messages("+111").await.unwrap();
        let bodies: Vec<_> = messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, ["hi", "there"]);
        assert_eq!(messages[1].sender_type, SenderRole::Bot);
        assert_eq!(messages[1].created_at, at(5));
    }

    #[tokio::test]
    async fn latest_per_phone_picks_newest_row() {
        let store = SqliteStore::in_memory(EventBus::new()).await.unwrap();
        for (phone, body, minute) in [("+111", "hi", 0), ("+222", "yo", 3), ("+111", "there", 5)] {
            store
                .insert(&NewMessage::new(phone, body, SenderRole::User).at(at(minute)))
                .await
                .unwrap();
        }

        let latest = store.latest_per_phone().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].message, "there");
        assert_eq!(latest[1].message, "yo");

        let mut phones = store.distinct_phone_numbers().await.unwrap();
        phones.sort();
        assert_eq!(phones, ["+111", "+222"]);
        assert_eq!(store.latest_message("+999").await.unwrap(), None);
    }

    #[tokio::test]
    async fn writes_are_published_on_the_bus() {
        let bus = EventBus::new();
        let mut rx = bus.raw_subscribe();
        let store = SqliteStore::in_memory(bus).await.unwrap();

        let created = store
            .insert(&NewMessage::new("+111", "hi", SenderRole::Agent))
            .await
            .unwrap();
        store.update_status(&created.id, DeliveryStatus::Read).await.unwrap();

        let inserted = rx.recv().await.unwrap();
        assert_eq!(inserted.operation, ChangeOperation::Insert);
        assert_eq!(inserted.record.id, created.id);

        let updated = rx.recv().await.unwrap();
        assert_eq!(updated.operation, ChangeOperation::Update);
        assert_eq!(updated.record.status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn status_never_moves_backwards() {
        let store = SqliteStore::in_memory(EventBus::new()).await.unwrap();
        let created = store
            .insert(&NewMessage::new("+111", "hi", SenderRole::Bot))
            .await
            .unwrap();

        store.update_status(&created.id, DeliveryStatus::Read).await.unwrap();
        let err = store
            .update_status(&created.id, DeliveryStatus::Delivered)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let same = store.update_status(&created.id, DeliveryStatus::Read).await.unwrap();
        assert_eq!(same.status, DeliveryStatus::Read);

        let missing = store
            .update_status(&MessageId::new("nope"), DeliveryStatus::Read)
            .await
            .unwrap_err();
        assert!(matches!(missing, StoreError::NotFound(_)));
    }
}
