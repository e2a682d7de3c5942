//! In-process storage backend, used for unit-testing the worker/strategy
//! state machine without a real database or Redis instance. Grounded on the
//! `fc-queue` `SqliteQueue::create_test_queue()` harness pattern, adapted to
//! an in-memory store rather than a real SQLite connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::config::ProcessingMode;
use crate::error::Result;
use crate::ids::{MessageId, ProcessorId};
use crate::message::{DeadLetterEntry, Envelope, Message, WriteOutcome};

use super::{HealthMetrics, LeaseRef, ProcessResultsBatch, StorageProvider, WritePolicy};

#[derive(Default)]
struct GroupLock {
    locked_by: String,
    deadline: DateTime<Utc>,
}

#[derive(Default)]
struct InboxState {
    messages: HashMap<MessageId, Message>,
    collapse_index: HashMap<String, MessageId>,
    dedup: HashMap<String, DateTime<Utc>>,
    group_locks: HashMap<String, GroupLock>,
    dead_letters: Vec<DeadLetterEntry>,
}

/// Fully in-memory realisation of [`StorageProvider`]. One instance serves
/// every inbox in a process; state is keyed by `inbox_name`.
pub struct MemoryStorageProvider {
    clock: SharedClock,
    inboxes: Mutex<HashMap<String, InboxState>>,
}

impl MemoryStorageProvider {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            inboxes: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    async fn write_one(
        &self,
        inbox_name: &str,
        msg: Message,
        policy: WritePolicy,
    ) -> Result<WriteOutcome> {
        let now = self.clock.now();
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();
        Ok(write_one_locked(state, msg, policy, now))
    }

    async fn write_batch(
        &self,
        inbox_name: &str,
        msgs: Vec<Message>,
        policy: WritePolicy,
    ) -> Result<usize> {
        let now = self.clock.now();
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();
        let mut inserted = 0;
        for msg in msgs {
            if write_one_locked(state, msg, policy, now) == WriteOutcome::Inserted {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn read_and_capture(
        &self,
        inbox_name: &str,
        processor_id: &ProcessorId,
        batch_size: u32,
        max_processing_time: Duration,
        mode: ProcessingMode,
    ) -> Result<Vec<Envelope>> {
        let now = self.clock.now();
        let max_processing_time = chrono::Duration::from_std(max_processing_time)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();

        let mut candidate_ids: Vec<MessageId> = state
            .messages
            .values()
            .filter(|m| m.lease_expired(now, max_processing_time))
            .map(|m| m.id)
            .collect();
        candidate_ids.sort_by_key(|id| {
            let m = &state.messages[id];
            (m.received_at, *id)
        });

        let fifo = mode.requires_group_id();
        let mut newly_locked: HashMap<String, ()> = HashMap::new();
        let mut captured_ids = Vec::new();

        for id in candidate_ids {
            if captured_ids.len() >= batch_size as usize {
                break;
            }
            let group_id = state.messages[&id].group_id.clone();

            if fifo {
                if let Some(group_id) = &group_id {
                    if !newly_locked.contains_key(group_id) {
                        if let Some(lock) = state.group_locks.get(group_id) {
                            if lock.locked_by != processor_id.as_str() && lock.deadline > now {
                                continue;
                            }
                        }
                    }
                }
            }

            let deadline = now + max_processing_time;
            if fifo {
                if let Some(group_id) = &group_id {
                    newly_locked.insert(group_id.clone(), ());
                    let entry = state.group_locks.entry(group_id.clone()).or_insert_with(|| GroupLock {
                        locked_by: processor_id.as_str().to_string(),
                        deadline,
                    });
                    entry.locked_by = processor_id.as_str().to_string();
                    entry.deadline = entry.deadline.max(deadline);
                }
            }

            let msg = state.messages.get_mut(&id).expect("candidate must exist");
            msg.captured_at = Some(now);
            msg.captured_by = Some(processor_id.as_str().to_string());
            captured_ids.push(id);
        }

        captured_ids.sort_by_key(|id| {
            let m = &state.messages[id];
            (m.received_at, *id)
        });

        Ok(captured_ids
            .into_iter()
            .map(|id| Envelope::from(state.messages[&id].clone()))
            .collect())
    }

    async fn complete(&self, inbox_name: &str, id: MessageId) -> Result<()> {
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();
        if let Some(msg) = state.messages.remove(&id) {
            clear_collapse_slot_if_owner(state, &msg, id);
        }
        Ok(())
    }

    async fn fail(&self, inbox_name: &str, id: MessageId) -> Result<()> {
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();
        if collapse_slot_lost_to_newer_write(state, &id) {
            state.messages.remove(&id);
        } else if let Some(msg) = state.messages.get_mut(&id) {
            msg.captured_at = None;
            msg.captured_by = None;
            msg.attempts_count += 1;
        }
        Ok(())
    }

    async fn release(&self, inbox_name: &str, id: MessageId) -> Result<()> {
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();
        if collapse_slot_lost_to_newer_write(state, &id) {
            state.messages.remove(&id);
        } else if let Some(msg) = state.messages.get_mut(&id) {
            msg.captured_at = None;
            msg.captured_by = None;
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        inbox_name: &str,
        id: MessageId,
        reason: String,
        enable_dead_letter: bool,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();
        if let Some(msg) = state.messages.remove(&id) {
            clear_collapse_slot_if_owner(state, &msg, id);
            if enable_dead_letter {
                state.dead_letters.push(DeadLetterEntry {
                    id: msg.id,
                    inbox_name: inbox_name.to_string(),
                    message_type: msg.message_type,
                    payload: msg.payload,
                    group_id: msg.group_id,
                    attempts_count: msg.attempts_count,
                    received_at: msg.received_at,
                    failure_reason: reason,
                    moved_at: now,
                });
            }
        }
        Ok(())
    }

    async fn process_results_batch(
        &self,
        inbox_name: &str,
        batch: ProcessResultsBatch,
        enable_dead_letter: bool,
    ) -> Result<()> {
        for id in batch.to_complete {
            self.complete(inbox_name, id).await?;
        }
        for id in batch.to_fail {
            self.fail(inbox_name, id).await?;
        }
        for id in batch.to_release {
            self.release(inbox_name, id).await?;
        }
        for (id, reason) in batch.to_dead_letter {
            self.dead_letter(inbox_name, id, reason, enable_dead_letter).await?;
        }
        Ok(())
    }

    async fn extend_locks(
        &self,
        inbox_name: &str,
        processor_id: &ProcessorId,
        leases: &[LeaseRef],
        new_deadline: DateTime<Utc>,
    ) -> Result<u32> {
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();
        let mut extended = 0u32;
        let mut groups_to_refresh = Vec::new();

        for lease in leases {
            if let Some(msg) = state.messages.get_mut(&lease.id) {
                if msg.captured_by.as_deref() == Some(processor_id.as_str()) {
                    msg.captured_at = Some(new_deadline);
                    extended += 1;
                    if let Some(group_id) = &lease.group_id {
                        groups_to_refresh.push(group_id.clone());
                    }
                }
            }
        }

        for group_id in groups_to_refresh {
            let entry = state.group_locks.entry(group_id).or_insert_with(|| GroupLock {
                locked_by: processor_id.as_str().to_string(),
                deadline: new_deadline,
            });
            entry.deadline = entry.deadline.max(new_deadline);
        }

        Ok(extended)
    }

    async fn release_group_locks(&self, inbox_name: &str, group_ids: &[String]) -> Result<()> {
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();
        for group_id in group_ids {
            state.group_locks.remove(group_id);
        }
        Ok(())
    }

    async fn release_messages_and_group_locks(
        &self,
        inbox_name: &str,
        ids: &[MessageId],
        group_ids: &[String],
    ) -> Result<()> {
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();
        for id in ids {
            if let Some(msg) = state.messages.get_mut(id) {
                msg.captured_at = None;
                msg.captured_by = None;
            }
        }
        for group_id in group_ids {
            state.group_locks.remove(group_id);
        }
        Ok(())
    }

    async fn read_dead_letters(&self, inbox_name: &str, limit: u32) -> Result<Vec<DeadLetterEntry>> {
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();
        let mut entries = state.dead_letters.clone();
        entries.sort_by_key(|e| e.moved_at);
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn health_metrics(
        &self,
        inbox_name: &str,
        max_processing_time: Duration,
    ) -> Result<HealthMetrics> {
        let now = self.clock.now();
        let max_processing_time = chrono::Duration::from_std(max_processing_time)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();

        let mut pending_count = 0u64;
        let mut captured_count = 0u64;
        let mut oldest_pending: Option<DateTime<Utc>> = None;

        for msg in state.messages.values() {
            if msg.lease_expired(now, max_processing_time) {
                pending_count += 1;
                oldest_pending = Some(match oldest_pending {
                    Some(o) if o <= msg.received_at => o,
                    _ => msg.received_at,
                });
            } else {
                captured_count += 1;
            }
        }

        Ok(HealthMetrics {
            pending_count,
            captured_count,
            dead_letter_count: state.dead_letters.len() as u64,
            oldest_pending_received_at: oldest_pending,
        })
    }

    async fn cleanup_dedup(
        &self,
        inbox_name: &str,
        older_than: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64> {
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();
        let expired: Vec<String> = state
            .dedup
            .iter()
            .filter(|(_, created_at)| **created_at < older_than)
            .take(batch_size as usize)
            .map(|(k, _)| k.clone())
            .collect();
        let count = expired.len() as u64;
        for key in expired {
            state.dedup.remove(&key);
        }
        Ok(count)
    }

    async fn cleanup_dead_letters(
        &self,
        inbox_name: &str,
        older_than: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64> {
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();
        let before = state.dead_letters.len();
        let mut removed = 0u32;
        state.dead_letters.retain(|e| {
            if removed < batch_size && e.moved_at < older_than {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok((before - state.dead_letters.len()) as u64)
    }

    async fn cleanup_group_locks(&self, inbox_name: &str, now: DateTime<Utc>) -> Result<u64> {
        let mut inboxes = self.inboxes.lock();
        let state = inboxes.entry(inbox_name.to_string()).or_default();
        let before = state.group_locks.len();
        state.group_locks.retain(|_, lock| lock.deadline >= now);
        Ok((before - state.group_locks.len()) as u64)
    }
}

fn write_one_locked(
    state: &mut InboxState,
    msg: Message,
    policy: WritePolicy,
    now: DateTime<Utc>,
) -> WriteOutcome {
    if let Some(window) = policy.deduplication_window {
        if let Some(dedup_id) = &msg.deduplication_id {
            let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(0));
            if let Some(created_at) = state.dedup.get(dedup_id) {
                if *created_at + window > now {
                    return WriteOutcome::Duplicate;
                }
            }
            state.dedup.insert(dedup_id.clone(), now);
        }
    }

    if let Some(collapse_key) = &msg.collapse_key {
        if let Some(prior_id) = state.collapse_index.get(collapse_key).copied() {
            let prior_is_pending = state
                .messages
                .get(&prior_id)
                .map(|m| m.captured_at.is_none())
                .unwrap_or(false);
            if prior_is_pending {
                state.messages.remove(&prior_id);
            }
        }
        state.collapse_index.insert(collapse_key.clone(), msg.id);
    }

    state.messages.insert(msg.id, msg);
    WriteOutcome::Inserted
}

fn clear_collapse_slot_if_owner(state: &mut InboxState, msg: &Message, id: MessageId) {
    if let Some(collapse_key) = &msg.collapse_key {
        if state.collapse_index.get(collapse_key) == Some(&id) {
            state.collapse_index.remove(collapse_key);
        }
    }
}

/// True if `id` carries a collapse key whose slot now points at a different
/// message — i.e. a later write superseded it while it was captured. Such a
/// message must never return to pending: re-admitting it would let two
/// messages be pending under the same collapse key at once.
fn collapse_slot_lost_to_newer_write(state: &InboxState, id: &MessageId) -> bool {
    match state.messages.get(id).and_then(|msg| msg.collapse_key.as_ref()) {
        Some(collapse_key) => state.collapse_index.get(collapse_key) != Some(id),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, TestClock};
    use std::sync::Arc;

    fn provider() -> (MemoryStorageProvider, TestClock) {
        let clock = TestClock::new(Utc::now());
        let provider = MemoryStorageProvider::new(Arc::new(clock.clone()));
        (provider, clock)
    }

    fn message(id: MessageId, received_at: DateTime<Utc>) -> Message {
        Message {
            id,
            inbox_name: "test".to_string(),
            message_type: "demo".to_string(),
            payload: vec![1, 2, 3],
            group_id: None,
            collapse_key: None,
            deduplication_id: None,
            attempts_count: 0,
            received_at,
            captured_at: None,
            captured_by: None,
        }
    }

    #[tokio::test]
    async fn write_then_capture_in_order() {
        let (provider, clock) = provider();
        let a = message(MessageId::new(), clock.now());
        clock.advance(chrono::Duration::milliseconds(5));
        let b = message(MessageId::new(), clock.now());

        provider
            .write_one("inbox", a.clone(), WritePolicy { deduplication_window: None })
            .await
            .unwrap();
        provider
            .write_one("inbox", b.clone(), WritePolicy { deduplication_window: None })
            .await
            .unwrap();

        let processor = ProcessorId::new();
        let leased = provider
            .read_and_capture("inbox", &processor, 10, Duration::from_secs(300), ProcessingMode::Default)
            .await
            .unwrap();

        assert_eq!(leased.len(), 2);
        assert_eq!(leased[0].id, a.id);
        assert_eq!(leased[1].id, b.id);
    }

    #[tokio::test]
    async fn expired_lease_is_recapturable() {
        let (provider, clock) = provider();
        let a = message(MessageId::new(), clock.now());
        provider
            .write_one("inbox", a.clone(), WritePolicy { deduplication_window: None })
            .await
            .unwrap();

        let p1 = ProcessorId::new();
        let leased = provider
            .read_and_capture("inbox", &p1, 10, Duration::from_secs(10), ProcessingMode::Default)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);

        // No time has passed; a second worker must not see it.
        let p2 = ProcessorId::new();
        let leased_again = provider
            .read_and_capture("inbox", &p2, 10, Duration::from_secs(10), ProcessingMode::Default)
            .await
            .unwrap();
        assert!(leased_again.is_empty());

        clock.advance(chrono::Duration::seconds(11));
        let leased_after_expiry = provider
            .read_and_capture("inbox", &p2, 10, Duration::from_secs(10), ProcessingMode::Default)
            .await
            .unwrap();
        assert_eq!(leased_after_expiry.len(), 1);
    }

    #[tokio::test]
    async fn collapse_keeps_only_latest_pending() {
        let (provider, clock) = provider();
        let a = message(MessageId::new(), clock.now())
            .tap_collapse("k");
        clock.advance(chrono::Duration::milliseconds(1));
        let b = message(MessageId::new(), clock.now()).tap_collapse("k");

        provider
            .write_one("inbox", a, WritePolicy { deduplication_window: None })
            .await
            .unwrap();
        provider
            .write_one("inbox", b.clone(), WritePolicy { deduplication_window: None })
            .await
            .unwrap();

        let processor = ProcessorId::new();
        let leased = provider
            .read_and_capture("inbox", &processor, 10, Duration::from_secs(300), ProcessingMode::Default)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, b.id);
    }

    #[tokio::test]
    async fn dedup_rejects_within_window() {
        let (provider, clock) = provider();
        let policy = WritePolicy {
            deduplication_window: Some(Duration::from_secs(3600)),
        };
        let mut a = message(MessageId::new(), clock.now());
        a.deduplication_id = Some("d1".to_string());
        let mut b = message(MessageId::new(), clock.now());
        b.deduplication_id = Some("d1".to_string());

        let first = provider.write_one("inbox", a, policy).await.unwrap();
        assert_eq!(first, WriteOutcome::Inserted);
        let second = provider.write_one("inbox", b, policy).await.unwrap();
        assert_eq!(second, WriteOutcome::Duplicate);
    }

    #[tokio::test]
    async fn fifo_excludes_locked_group_from_other_workers() {
        let (provider, clock) = provider();
        let mut a = message(MessageId::new(), clock.now());
        a.group_id = Some("g1".to_string());
        provider
            .write_one("inbox", a, WritePolicy { deduplication_window: None })
            .await
            .unwrap();

        let p1 = ProcessorId::new();
        let leased = provider
            .read_and_capture("inbox", &p1, 10, Duration::from_secs(300), ProcessingMode::Fifo)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);

        let mut b = message(MessageId::new(), clock.now());
        b.group_id = Some("g1".to_string());
        provider
            .write_one("inbox", b, WritePolicy { deduplication_window: None })
            .await
            .unwrap();

        let p2 = ProcessorId::new();
        let leased_p2 = provider
            .read_and_capture("inbox", &p2, 10, Duration::from_secs(300), ProcessingMode::Fifo)
            .await
            .unwrap();
        assert!(leased_p2.is_empty(), "group locked by p1 must exclude p2");
    }

    #[tokio::test]
    async fn superseded_capture_is_discarded_instead_of_repending() {
        let (provider, clock) = provider();
        let a = message(MessageId::new(), clock.now()).tap_collapse("k");
        provider
            .write_one("inbox", a.clone(), WritePolicy { deduplication_window: None })
            .await
            .unwrap();

        let processor = ProcessorId::new();
        let leased = provider
            .read_and_capture("inbox", &processor, 10, Duration::from_secs(300), ProcessingMode::Default)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);

        // A new write under the same collapse key arrives while `a` is captured.
        clock.advance(chrono::Duration::milliseconds(1));
        let b = message(MessageId::new(), clock.now()).tap_collapse("k");
        provider
            .write_one("inbox", b.clone(), WritePolicy { deduplication_window: None })
            .await
            .unwrap();

        // `a`'s lease now fails; it must not return to pending alongside `b`.
        provider.fail("inbox", a.id).await.unwrap();

        let leased = provider
            .read_and_capture("inbox", &processor, 10, Duration::from_secs(300), ProcessingMode::Default)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, b.id);
    }

    trait TapCollapse {
        fn tap_collapse(self, key: &str) -> Self;
    }

    impl TapCollapse for Message {
        fn tap_collapse(mut self, key: &str) -> Self {
            self.collapse_key = Some(key.to_string());
            self
        }
    }
}
