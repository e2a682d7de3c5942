//! The data model: messages, envelopes, and dead-letter entries (§3.1).

use chrono::{DateTime, Utc};

use crate::ids::MessageId;

/// A message as it exists before it has been written to a backing store.
/// `Writer::write` fills in `id`/`received_at`/`attempts_count` from these
/// defaults unless the caller already populated them.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Option<MessageId>,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub group_id: Option<String>,
    pub collapse_key: Option<String>,
    pub deduplication_id: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: None,
            message_type: message_type.into(),
            payload,
            group_id: None,
            collapse_key: None,
            deduplication_id: None,
            received_at: None,
        }
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_collapse_key(mut self, collapse_key: impl Into<String>) -> Self {
        self.collapse_key = Some(collapse_key.into());
        self
    }

    pub fn with_deduplication_id(mut self, deduplication_id: impl Into<String>) -> Self {
        self.deduplication_id = Some(deduplication_id.into());
        self
    }
}

/// The durable representation of a message, as stored by the backend,
/// independent of lease state.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub inbox_name: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub group_id: Option<String>,
    pub collapse_key: Option<String>,
    pub deduplication_id: Option<String>,
    pub attempts_count: u32,
    pub received_at: DateTime<Utc>,
    pub captured_at: Option<DateTime<Utc>>,
    pub captured_by: Option<String>,
}

impl Message {
    /// Whether this message's lease (if any) has expired as of `now`, given
    /// `max_processing_time`. A message with no lease is always eligible.
    pub fn lease_expired(&self, now: DateTime<Utc>, max_processing_time: chrono::Duration) -> bool {
        match self.captured_at {
            None => true,
            Some(captured_at) => captured_at + max_processing_time < now,
        }
    }
}

/// A message handed to a handler, including its current lease metadata.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: MessageId,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub group_id: Option<String>,
    pub collapse_key: Option<String>,
    pub deduplication_id: Option<String>,
    pub attempts_count: u32,
    pub received_at: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
    pub captured_by: String,
}

impl From<Message> for Envelope {
    fn from(m: Message) -> Self {
        Envelope {
            id: m.id,
            message_type: m.message_type,
            payload: m.payload,
            group_id: m.group_id,
            collapse_key: m.collapse_key,
            deduplication_id: m.deduplication_id,
            attempts_count: m.attempts_count,
            received_at: m.received_at,
            captured_at: m.captured_at.expect("envelope requires a captured message"),
            captured_by: m.captured_by.expect("envelope requires a captured message"),
        }
    }
}

/// A full snapshot of a message plus terminal-failure metadata, persisted in
/// the dead-letter namespace (§3.1 "Dead-Letter Entry").
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub id: MessageId,
    pub inbox_name: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub group_id: Option<String>,
    pub attempts_count: u32,
    pub received_at: DateTime<Utc>,
    pub failure_reason: String,
    pub moved_at: DateTime<Utc>,
}

/// Result of a single `WriteOne` call (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Duplicate,
}

/// Outcome of one handler invocation (§6.1).
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Success,
    Retry,
    Failed { reason: Option<String> },
    MoveToDeadLetter { reason: String },
}

/// One entry of a batched handler's result list (§6.1).
#[derive(Debug, Clone)]
pub struct BatchItemResult {
    pub id: MessageId,
    pub outcome: HandlerOutcome,
}
