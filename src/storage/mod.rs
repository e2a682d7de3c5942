//! The storage protocol (§4.1): the contract every backend must implement,
//! plus the reference realisations.

pub mod memory;
#[cfg(feature = "kv")]
pub mod kv;
#[cfg(feature = "sql")]
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::ProcessingMode;
use crate::error::Result;
use crate::ids::{MessageId, ProcessorId};
use crate::message::{DeadLetterEntry, Envelope, Message, WriteOutcome};

/// A batched finalize request (§4.1 "Finalize (batched)"). Either the whole
/// batch applies atomically, or the caller gets an error and retries nothing
/// inline — the leases will simply expire and be re-leased.
#[derive(Debug, Clone, Default)]
pub struct ProcessResultsBatch {
    pub to_complete: Vec<MessageId>,
    pub to_fail: Vec<MessageId>,
    pub to_release: Vec<MessageId>,
    pub to_dead_letter: Vec<(MessageId, String)>,
}

impl ProcessResultsBatch {
    pub fn is_empty(&self) -> bool {
        self.to_complete.is_empty()
            && self.to_fail.is_empty()
            && self.to_release.is_empty()
            && self.to_dead_letter.is_empty()
    }
}

/// A message and its group, for lock-extension calls.
#[derive(Debug, Clone)]
pub struct LeaseRef {
    pub id: MessageId,
    pub group_id: Option<String>,
}

/// Counts exposed by the health probe (§4.1 "Introspection").
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct HealthMetrics {
    pub pending_count: u64,
    pub captured_count: u64,
    pub dead_letter_count: u64,
    pub oldest_pending_received_at: Option<DateTime<Utc>>,
}

/// Per-write dedup/collapse policy, resolved by the caller (`Writer`) from
/// `InboxOptions` so the storage provider itself stays stateless across
/// inboxes — a single provider instance serves every inbox in the process.
#[derive(Debug, Clone, Copy)]
pub struct WritePolicy {
    pub deduplication_window: Option<Duration>,
}

/// The single source of durable truth for one inbox's messages (§4.1).
///
/// Implementations must make every method atomic with respect to concurrent
/// callers: two workers racing `read_and_capture` against the same inbox must
/// never receive overlapping envelopes, and a write racing a read must leave
/// the store in a state consistent with *some* serial ordering of the two.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn write_one(
        &self,
        inbox_name: &str,
        msg: Message,
        policy: WritePolicy,
    ) -> Result<WriteOutcome>;

    async fn write_batch(
        &self,
        inbox_name: &str,
        msgs: Vec<Message>,
        policy: WritePolicy,
    ) -> Result<usize>;

    async fn read_and_capture(
        &self,
        inbox_name: &str,
        processor_id: &ProcessorId,
        batch_size: u32,
        max_processing_time: Duration,
        mode: ProcessingMode,
    ) -> Result<Vec<Envelope>>;

    async fn complete(&self, inbox_name: &str, id: MessageId) -> Result<()>;

    /// Clears lease fields and increments `attempts_count`. Refreshes the
    /// message's liveness TTL on TTL-based backends.
    async fn fail(&self, inbox_name: &str, id: MessageId) -> Result<()>;

    /// Clears lease fields without incrementing `attempts_count`.
    async fn release(&self, inbox_name: &str, id: MessageId) -> Result<()>;

    async fn dead_letter(
        &self,
        inbox_name: &str,
        id: MessageId,
        reason: String,
        enable_dead_letter: bool,
    ) -> Result<()>;

    async fn process_results_batch(
        &self,
        inbox_name: &str,
        batch: ProcessResultsBatch,
        enable_dead_letter: bool,
    ) -> Result<()>;

    /// Returns the number of message locks actually extended (entries owned
    /// by `processor_id`). A count lower than requested is not an error.
    async fn extend_locks(
        &self,
        inbox_name: &str,
        processor_id: &ProcessorId,
        leases: &[LeaseRef],
        new_deadline: DateTime<Utc>,
    ) -> Result<u32>;

    async fn release_group_locks(&self, inbox_name: &str, group_ids: &[String]) -> Result<()>;

    async fn release_messages_and_group_locks(
        &self,
        inbox_name: &str,
        ids: &[MessageId],
        group_ids: &[String],
    ) -> Result<()>;

    async fn read_dead_letters(&self, inbox_name: &str, limit: u32) -> Result<Vec<DeadLetterEntry>>;

    async fn health_metrics(
        &self,
        inbox_name: &str,
        max_processing_time: Duration,
    ) -> Result<HealthMetrics>;

    /// Deletes dedup records older than `older_than`, in batches of at most
    /// `batch_size`. Returns the number removed in this call. SQL-only: KV
    /// backends rely on native TTL and implement this as a no-op.
    async fn cleanup_dedup(
        &self,
        inbox_name: &str,
        older_than: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64>;

    /// Deletes dead-letter rows older than `older_than`.
    async fn cleanup_dead_letters(
        &self,
        inbox_name: &str,
        older_than: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64>;

    /// Deletes group-lock rows whose deadline has passed. SQL-only: KV
    /// backends rely on native TTL and implement this as a no-op.
    async fn cleanup_group_locks(&self, inbox_name: &str, now: DateTime<Utc>) -> Result<u64>;
}
