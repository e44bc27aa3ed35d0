use crate::chat::DeliveryStatus;
use thiserror::Error;

/// Failures surfaced by a [`crate::store::MessageStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or the query failed.
    #[error("message store unavailable: {0}")]
    Unavailable(String),

    /// The backend (or local validation) refused to create the row.
    #[error("insert rejected: {0}")]
    Rejected(String),

    #[error("message {0} not found")]
    NotFound(String),

    /// Delivery status only ever moves forward.
    #[error("message {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("malformed message row: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_check_violation()
                    || db.is_foreign_key_violation() =>
            {
                StoreError::Rejected(db.message().to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Decode(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

/// Failures of the change-event channel.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("realtime connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
