//! Public write path (§4.5). Grounded on `federation/queue.rs`'s
//! `OutboundQueue::enqueue()`: generate an id, validate, delegate to a single
//! persistence call, `debug!` on success.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::{InboxOptions, ProcessingMode};
use crate::error::{InboxError, Result};
use crate::message::{Message, NewMessage, WriteOutcome};
use crate::storage::{StorageProvider, WritePolicy};

/// Enforces dedup/collapse policy and delegates persistence to the
/// configured [`StorageProvider`]. One `Writer` serves one inbox.
pub struct Writer {
    inbox_name: String,
    mode: ProcessingMode,
    storage: Arc<dyn StorageProvider>,
    clock: SharedClock,
    dedup_window: Option<Duration>,
}

impl Writer {
    pub fn new(
        inbox_name: impl Into<String>,
        options: &InboxOptions,
        storage: Arc<dyn StorageProvider>,
        clock: SharedClock,
    ) -> Self {
        Self {
            inbox_name: inbox_name.into(),
            mode: options.mode,
            storage,
            clock,
            dedup_window: options.enable_deduplication.then_some(options.deduplication_interval),
        }
    }

    fn into_message(&self, new: NewMessage) -> Result<Message> {
        if new.message_type.trim().is_empty() {
            return Err(InboxError::Configuration {
                inbox: self.inbox_name.clone(),
                reason: "message_type must be non-empty".to_string(),
            });
        }
        if self.mode.requires_group_id() && new.group_id.as_deref().map_or(true, str::is_empty) {
            return Err(InboxError::Configuration {
                inbox: self.inbox_name.clone(),
                reason: "group_id is required for FIFO-mode inboxes".to_string(),
            });
        }

        Ok(Message {
            id: new.id.unwrap_or_default(),
            inbox_name: self.inbox_name.clone(),
            message_type: new.message_type,
            payload: new.payload,
            group_id: new.group_id,
            collapse_key: new.collapse_key,
            deduplication_id: new.deduplication_id,
            attempts_count: 0,
            received_at: new.received_at.unwrap_or_else(|| self.clock.now()),
            captured_at: None,
            captured_by: None,
        })
    }

    /// Writes a single message. Returns `Duplicate` if dedup rejected it.
    pub async fn write(&self, msg: NewMessage) -> Result<WriteOutcome> {
        let message = self.into_message(msg)?;
        let id = message.id;
        let outcome = self
            .storage
            .write_one(
                &self.inbox_name,
                message,
                WritePolicy { deduplication_window: self.dedup_window },
            )
            .await?;

        match outcome {
            WriteOutcome::Inserted => {
                debug!(inbox = %self.inbox_name, message_id = %id, "message written");
                metrics::counter!("inbox_messages_written_total", 1, "inbox" => self.inbox_name.clone());
            }
            WriteOutcome::Duplicate => {
                debug!(inbox = %self.inbox_name, message_id = %id, "duplicate write rejected");
            }
        }
        Ok(outcome)
    }

    /// Writes a batch of messages atomically at the backend. Returns the
    /// count actually inserted (dedup rejects are silently skipped).
    pub async fn write_batch(&self, msgs: Vec<NewMessage>) -> Result<usize> {
        let messages = msgs
            .into_iter()
            .map(|m| self.into_message(m))
            .collect::<Result<Vec<_>>>()?;
        let count = self
            .storage
            .write_batch(
                &self.inbox_name,
                messages,
                WritePolicy { deduplication_window: self.dedup_window },
            )
            .await?;

        if count > 0 {
            debug!(inbox = %self.inbox_name, count, "batch written");
            metrics::counter!("inbox_messages_written_total", count as u64, "inbox" => self.inbox_name.clone());
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SystemClock, TestClock};
    use crate::storage::memory::MemoryStorageProvider;
    use chrono::Utc;

    fn writer(mode: ProcessingMode) -> Writer {
        let options = InboxOptions::new(mode);
        let storage = Arc::new(MemoryStorageProvider::new(Arc::new(SystemClock)));
        Writer::new("test-inbox", &options, storage, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn rejects_empty_message_type() {
        let w = writer(ProcessingMode::Default);
        let err = w.write(NewMessage::new("", vec![])).await.unwrap_err();
        assert!(matches!(err, InboxError::Configuration { .. }));
    }

    #[tokio::test]
    async fn fifo_requires_group_id() {
        let w = writer(ProcessingMode::Fifo);
        let err = w.write(NewMessage::new("demo", vec![])).await.unwrap_err();
        assert!(matches!(err, InboxError::Configuration { .. }));

        let ok = w
            .write(NewMessage::new("demo", vec![]).with_group_id("g1"))
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn write_batch_counts_inserted_only() {
        let clock = TestClock::new(Utc::now());
        let options = InboxOptions::new(ProcessingMode::Default);
        let storage = Arc::new(MemoryStorageProvider::new(Arc::new(clock.clone())));
        let mut options = options;
        options.enable_deduplication = true;
        let w = Writer::new("test-inbox", &options, storage, Arc::new(clock));

        let msgs = vec![
            NewMessage::new("demo", vec![1]).with_deduplication_id("dup"),
            NewMessage::new("demo", vec![2]).with_deduplication_id("dup"),
            NewMessage::new("demo", vec![3]),
        ];
        let inserted = w.write_batch(msgs).await.unwrap();
        assert_eq!(inserted, 2);
    }
}
