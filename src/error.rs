//! Shared error type for the inbox engine.

/// Errors returned by any component of the inbox engine.
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("key-value backend error: {0}")]
    Kv(#[from] redis::RedisError),

    #[error("invalid configuration for inbox {inbox}: {reason}")]
    Configuration { inbox: String, reason: String },

    #[error("group {group_id} is locked by another worker")]
    GroupLocked { group_id: String },

    #[error("caller {processor_id} does not own message {message_id}")]
    NotOwner {
        processor_id: String,
        message_id: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),
}

impl InboxError {
    /// Whether the operation that produced this error is safe to retry on the
    /// next worker loop iteration without side effects.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(e) => is_retryable_sqlx(e),
            Self::Kv(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            Self::GroupLocked { .. } => true,
            Self::Configuration { .. }
            | Self::NotOwner { .. }
            | Self::Serialization(_)
            | Self::UnknownMessageType(_) => false,
        }
    }
}

fn is_retryable_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => {
            // Lock-wait timeouts and serialization failures are transient.
            matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, InboxError>;
