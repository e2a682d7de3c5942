//! Redis realisation of [`StorageProvider`] (§4.1 "KV realisation").
//!
//! Multi-key operations (capture, finalize, lock extension) are expressed as
//! Lua scripts so a batch of candidates is evaluated and mutated atomically
//! from Redis's point of view, rather than racing separate round trips. Keys
//! for one inbox share a hash tag so a Redis Cluster deployment keeps them
//! co-located on one slot. Scripts are compiled once via `once_cell::Lazy`,
//! the same pattern the auth layer uses for its JTI cache, and invoked
//! through a `redis::aio::ConnectionManager` (`tokio-comp` +
//! `connection-manager`, matching the feature set declared for `redis`
//! across the retrieval pack's manifests).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::ProcessingMode;
use crate::error::Result;
use crate::ids::{MessageId, ProcessorId};
use crate::message::{DeadLetterEntry, Envelope, Message, WriteOutcome};

use super::{HealthMetrics, LeaseRef, ProcessResultsBatch, StorageProvider, WritePolicy};

/// Safety-net TTL refreshed on every live message hash so a leaked key does
/// not accumulate forever even if a finalize call is somehow never made.
const LIVE_MESSAGE_SAFETY_TTL_SECS: i64 = 7 * 24 * 60 * 60;

fn sanitize(raw: &str) -> String {
    raw.replace('{', "_OB_").replace('}', "_CB_")
}

fn tag(inbox_name: &str) -> String {
    format!("{{{}}}", sanitize(inbox_name))
}

static WRITE_ONE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local tag = ARGV[1]
        local id = ARGV[2]
        local message_type = ARGV[3]
        local payload = ARGV[4]
        local group_id = ARGV[5]
        local collapse_key = ARGV[6]
        local dedup_id = ARGV[7]
        local dedup_window_ms = tonumber(ARGV[8])
        local received_at_ms = ARGV[9]
        local safety_ttl = tonumber(ARGV[10])

        local pending_key = tag .. ":pending"
        local msg_key = tag .. ":msg:" .. id
        local collapse_hash = tag .. ":collapse"

        if dedup_id ~= "" and dedup_window_ms > 0 then
            local dedup_key = tag .. ":dedup:" .. dedup_id
            if redis.call("EXISTS", dedup_key) == 1 then
                return "DUPLICATE"
            end
            redis.call("SET", dedup_key, "1", "PX", dedup_window_ms)
        end

        if collapse_key ~= "" then
            local prior_id = redis.call("HGET", collapse_hash, collapse_key)
            if prior_id then
                local prior_key = tag .. ":msg:" .. prior_id
                local prior_captured = redis.call("HGET", prior_key, "captured_at")
                if not prior_captured then
                    redis.call("DEL", prior_key)
                    redis.call("ZREM", pending_key, prior_id)
                end
            end
            redis.call("HSET", collapse_hash, collapse_key, id)
        end

        redis.call("HSET", msg_key,
            "id", id,
            "message_type", message_type,
            "payload", payload,
            "group_id", group_id,
            "collapse_key", collapse_key,
            "deduplication_id", dedup_id,
            "attempts_count", "0",
            "received_at", received_at_ms)
        redis.call("EXPIRE", msg_key, safety_ttl)
        redis.call("ZADD", pending_key, received_at_ms, id)
        return "INSERTED"
        "#,
    )
});

static READ_AND_CAPTURE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local tag = ARGV[1]
        local processor_id = ARGV[2]
        local now_ms = ARGV[3]
        local deadline_ms = ARGV[4]
        local batch_size = tonumber(ARGV[5])
        local scan_limit = tonumber(ARGV[6])
        local fifo = ARGV[7]
        local safety_ttl = tonumber(ARGV[8])

        local pending_key = tag .. ":pending"
        local captured_key = tag .. ":captured"

        local candidates = redis.call("ZRANGE", pending_key, 0, scan_limit - 1)
        local locked_groups = {}
        local result = {}

        for _, id in ipairs(candidates) do
            if #result >= batch_size then
                break
            end
            local msg_key = tag .. ":msg:" .. id
            if redis.call("EXISTS", msg_key) == 0 then
                redis.call("ZREM", pending_key, id)
            else
                local group_id = redis.call("HGET", msg_key, "group_id")
                local eligible = true
                if fifo == "1" and group_id and group_id ~= "" then
                    if not locked_groups[group_id] then
                        local lock_key = tag .. ":lock:" .. group_id
                        local locked_by = redis.call("GET", lock_key)
                        if locked_by and locked_by ~= processor_id then
                            eligible = false
                        end
                    end
                end
                if eligible then
                    redis.call("HSET", msg_key, "captured_at", now_ms, "captured_by", processor_id)
                    redis.call("EXPIRE", msg_key, safety_ttl)
                    redis.call("ZREM", pending_key, id)
                    redis.call("ZADD", captured_key, deadline_ms, id)
                    if fifo == "1" and group_id and group_id ~= "" then
                        locked_groups[group_id] = true
                        local lock_key = tag .. ":lock:" .. group_id
                        redis.call("SET", lock_key, processor_id, "PX", deadline_ms - now_ms)
                    end
                    table.insert(result, id)
                end
            end
        end

        return result
        "#,
    )
});

static FINALIZE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    // Generic finalize for Complete/Fail/Release/DeadLetter, selected by `op`:
    // "complete" | "fail" | "release" | "dead_letter".
    Script::new(
        r#"
        local tag = ARGV[1]
        local id = ARGV[2]
        local op = ARGV[3]
        local reason = ARGV[4]
        local now_ms = ARGV[5]
        local enable_dead_letter = ARGV[6]
        local dlq_ttl = tonumber(ARGV[7])

        local pending_key = tag .. ":pending"
        local captured_key = tag .. ":captured"
        local msg_key = tag .. ":msg:" .. id
        local collapse_hash = tag .. ":collapse"

        if redis.call("EXISTS", msg_key) == 0 then
            return "MISSING"
        end

        -- A later write under the same collapse key may have repointed the
        -- slot to a different message while this one was captured. Such a
        -- message must never go back to pending: it is discarded instead,
        -- the same way a missing message is treated as a no-op above.
        local collapse_key = redis.call("HGET", msg_key, "collapse_key")
        local superseded = false
        if collapse_key and collapse_key ~= "" then
            local current_holder = redis.call("HGET", collapse_hash, collapse_key)
            superseded = current_holder ~= id
        end

        if op == "fail" or op == "release" then
            if superseded then
                redis.call("DEL", msg_key)
                redis.call("ZREM", captured_key, id)
                return "OK"
            end
            local received_at = redis.call("HGET", msg_key, "received_at")
            redis.call("HDEL", msg_key, "captured_at", "captured_by")
            if op == "fail" then
                redis.call("HINCRBY", msg_key, "attempts_count", 1)
            end
            redis.call("ZREM", captured_key, id)
            redis.call("ZADD", pending_key, received_at, id)
            return "OK"
        end

        -- complete or dead_letter: remove the live message entirely.
        local message_type, payload, group_id, attempts_count, received_at
        if op == "dead_letter" and enable_dead_letter == "1" then
            message_type = redis.call("HGET", msg_key, "message_type")
            payload = redis.call("HGET", msg_key, "payload")
            group_id = redis.call("HGET", msg_key, "group_id")
            attempts_count = redis.call("HGET", msg_key, "attempts_count")
            received_at = redis.call("HGET", msg_key, "received_at")
        end

        redis.call("DEL", msg_key)
        redis.call("ZREM", pending_key, id)
        redis.call("ZREM", captured_key, id)
        if collapse_key and collapse_key ~= "" then
            local current = redis.call("HGET", collapse_hash, collapse_key)
            if current == id then
                redis.call("HDEL", collapse_hash, collapse_key)
            end
        end

        if op == "dead_letter" and enable_dead_letter == "1" then
            local dlq_key = tag .. ":dlq"
            local dlq_msg_key = tag .. ":dlq:msg:" .. id
            redis.call("HSET", dlq_msg_key,
                "id", id,
                "message_type", message_type,
                "payload", payload,
                "group_id", group_id or "",
                "attempts_count", attempts_count,
                "received_at", received_at,
                "failure_reason", reason,
                "moved_at", now_ms)
            redis.call("EXPIRE", dlq_msg_key, dlq_ttl)
            redis.call("ZADD", dlq_key, now_ms, id)
        end

        return "OK"
        "#,
    )
});

#[derive(Clone)]
pub struct RedisStorageProvider {
    conn: ConnectionManager,
    clock: SharedClock,
    dead_letter_ttl_secs: i64,
}

impl RedisStorageProvider {
    pub async fn connect(redis_url: &str, clock: SharedClock) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            clock,
            dead_letter_ttl_secs: 14 * 24 * 60 * 60,
        })
    }

    pub fn with_dead_letter_ttl(mut self, ttl: Duration) -> Self {
        self.dead_letter_ttl_secs = ttl.as_secs() as i64;
        self
    }

    async fn finalize(
        &self,
        inbox_name: &str,
        id: MessageId,
        op: &str,
        reason: &str,
        enable_dead_letter: bool,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = FINALIZE_SCRIPT
            .arg(tag(inbox_name))
            .arg(id.as_str())
            .arg(op)
            .arg(reason)
            .arg(self.clock.now().timestamp_millis())
            .arg(if enable_dead_letter { "1" } else { "0" })
            .arg(self.dead_letter_ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn load_envelope(&self, inbox_name: &str, id: &str) -> Result<Option<Message>> {
        let mut conn = self.conn.clone();
        let msg_key = format!("{}:msg:{}", tag(inbox_name), id);
        let fields: Vec<(String, String)> = conn.hgetall(&msg_key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(message_from_fields(inbox_name, fields)))
    }
}

fn field(fields: &[(String, String)], name: &str) -> Option<String> {
    fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
}

fn message_from_fields(inbox_name: &str, fields: Vec<(String, String)>) -> Message {
    let id: MessageId = field(&fields, "id")
        .and_then(|s| s.parse().ok())
        .expect("message hash always carries a valid id");
    let non_empty = |s: Option<String>| s.filter(|v| !v.is_empty());
    Message {
        id,
        inbox_name: inbox_name.to_string(),
        message_type: field(&fields, "message_type").unwrap_or_default(),
        payload: field(&fields, "payload").unwrap_or_default().into_bytes(),
        group_id: non_empty(field(&fields, "group_id")),
        collapse_key: non_empty(field(&fields, "collapse_key")),
        deduplication_id: non_empty(field(&fields, "deduplication_id")),
        attempts_count: field(&fields, "attempts_count")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        received_at: millis_to_datetime(field(&fields, "received_at")),
        captured_at: field(&fields, "captured_at").map(|s| millis_to_datetime(Some(s))),
        captured_by: non_empty(field(&fields, "captured_by")),
    }
}

fn millis_to_datetime(raw: Option<String>) -> DateTime<Utc> {
    let ms: i64 = raw.and_then(|s| s.parse().ok()).unwrap_or(0);
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl StorageProvider for RedisStorageProvider {
    async fn write_one(
        &self,
        inbox_name: &str,
        msg: Message,
        policy: WritePolicy,
    ) -> Result<WriteOutcome> {
        let mut conn = self.conn.clone();
        let dedup_window_ms = policy
            .deduplication_window
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let reply: String = WRITE_ONE_SCRIPT
            .arg(tag(inbox_name))
            .arg(msg.id.as_str())
            .arg(&msg.message_type)
            .arg(&msg.payload)
            .arg(msg.group_id.as_deref().map(sanitize).unwrap_or_default())
            .arg(msg.collapse_key.as_deref().map(sanitize).unwrap_or_default())
            .arg(msg.deduplication_id.as_deref().map(sanitize).unwrap_or_default())
            .arg(dedup_window_ms)
            .arg(msg.received_at.timestamp_millis())
            .arg(LIVE_MESSAGE_SAFETY_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;

        Ok(match reply.as_str() {
            "DUPLICATE" => WriteOutcome::Duplicate,
            _ => WriteOutcome::Inserted,
        })
    }

    async fn write_batch(
        &self,
        inbox_name: &str,
        msgs: Vec<Message>,
        policy: WritePolicy,
    ) -> Result<usize> {
        let mut inserted = 0;
        for msg in msgs {
            if self.write_one(inbox_name, msg, policy).await? == WriteOutcome::Inserted {
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
        let mut conn = self.conn.clone();
        let now = self.clock.now();
        let deadline = now + chrono::Duration::from_std(max_processing_time).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let scan_multiplier = if mode.requires_group_id() { 5 } else { 3 };
        let scan_limit = (batch_size as i64) * scan_multiplier;

        let ids: Vec<String> = READ_AND_CAPTURE_SCRIPT
            .arg(tag(inbox_name))
            .arg(processor_id.as_str())
            .arg(now.timestamp_millis())
            .arg(deadline.timestamp_millis())
            .arg(batch_size)
            .arg(scan_limit)
            .arg(if mode.requires_group_id() { "1" } else { "0" })
            .arg(LIVE_MESSAGE_SAFETY_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;

        if !ids.is_empty() {
            debug!(inbox = inbox_name, count = ids.len(), "captured messages from redis");
        }

        let mut envelopes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(msg) = self.load_envelope(inbox_name, &id).await? {
                envelopes.push(Envelope::from(msg));
            }
        }
        Ok(envelopes)
    }

    async fn complete(&self, inbox_name: &str, id: MessageId) -> Result<()> {
        self.finalize(inbox_name, id, "complete", "", false).await
    }

    async fn fail(&self, inbox_name: &str, id: MessageId) -> Result<()> {
        self.finalize(inbox_name, id, "fail", "", false).await
    }

    async fn release(&self, inbox_name: &str, id: MessageId) -> Result<()> {
        self.finalize(inbox_name, id, "release", "", false).await
    }

    async fn dead_letter(
        &self,
        inbox_name: &str,
        id: MessageId,
        reason: String,
        enable_dead_letter: bool,
    ) -> Result<()> {
        self.finalize(inbox_name, id, "dead_letter", &reason, enable_dead_letter)
            .await
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
        let mut conn = self.conn.clone();
        let tag = tag(inbox_name);
        let captured_key = format!("{tag}:captured");
        let now = self.clock.now();
        let ttl_ms = (new_deadline - now).num_milliseconds().max(1);

        let mut extended = 0u32;
        for lease in leases {
            let msg_key = format!("{tag}:msg:{}", lease.id.as_str());
            let captured_by: Option<String> = conn.hget(&msg_key, "captured_by").await?;
            if captured_by.as_deref() != Some(processor_id.as_str()) {
                continue;
            }
            let _: () = conn
                .hset(&msg_key, "captured_at", new_deadline.timestamp_millis())
                .await?;
            let _: () = conn.zadd(&captured_key, lease.id.as_str(), new_deadline.timestamp_millis()).await?;
            extended += 1;

            if let Some(group_id) = &lease.group_id {
                let lock_key = format!("{tag}:lock:{}", sanitize(group_id));
                let _: () = conn.set_ex(&lock_key, processor_id.as_str(), (ttl_ms / 1000).max(1) as u64).await?;
            }
        }
        Ok(extended)
    }

    async fn release_group_locks(&self, inbox_name: &str, group_ids: &[String]) -> Result<()> {
        if group_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let tag = tag(inbox_name);
        let keys: Vec<String> = group_ids
            .iter()
            .map(|g| format!("{tag}:lock:{}", sanitize(g)))
            .collect();
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    async fn release_messages_and_group_locks(
        &self,
        inbox_name: &str,
        ids: &[MessageId],
        group_ids: &[String],
    ) -> Result<()> {
        for id in ids {
            self.release(inbox_name, *id).await?;
        }
        self.release_group_locks(inbox_name, group_ids).await
    }

    async fn read_dead_letters(&self, inbox_name: &str, limit: u32) -> Result<Vec<DeadLetterEntry>> {
        let mut conn = self.conn.clone();
        let tag = tag(inbox_name);
        let dlq_key = format!("{tag}:dlq");
        let ids: Vec<String> = conn.zrange(&dlq_key, 0, (limit as isize).saturating_sub(1)).await?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let dlq_msg_key = format!("{tag}:dlq:msg:{id}");
            let fields: Vec<(String, String)> = conn.hgetall(&dlq_msg_key).await?;
            if fields.is_empty() {
                continue;
            }
            entries.push(DeadLetterEntry {
                id: field(&fields, "id").and_then(|s| s.parse().ok()).unwrap_or_default(),
                inbox_name: inbox_name.to_string(),
                message_type: field(&fields, "message_type").unwrap_or_default(),
                payload: field(&fields, "payload").unwrap_or_default().into_bytes(),
                group_id: field(&fields, "group_id").filter(|s| !s.is_empty()),
                attempts_count: field(&fields, "attempts_count").and_then(|s| s.parse().ok()).unwrap_or(0),
                received_at: millis_to_datetime(field(&fields, "received_at")),
                failure_reason: field(&fields, "failure_reason").unwrap_or_default(),
                moved_at: millis_to_datetime(field(&fields, "moved_at")),
            });
        }
        Ok(entries)
    }

    async fn health_metrics(
        &self,
        inbox_name: &str,
        _max_processing_time: Duration,
    ) -> Result<HealthMetrics> {
        let mut conn = self.conn.clone();
        let tag = tag(inbox_name);
        let pending_key = format!("{tag}:pending");
        let captured_key = format!("{tag}:captured");
        let dlq_key = format!("{tag}:dlq");
        let now_ms = self.clock.now().timestamp_millis();

        let pending_count: u64 = conn.zcard(&pending_key).await?;
        let expired_captured: u64 = conn.zcount(&captured_key, "-inf", now_ms).await?;
        let captured_count: u64 = conn.zcount(&captured_key, format!("({now_ms}"), "+inf").await?;
        let dead_letter_count: u64 = conn.zcard(&dlq_key).await?;

        let oldest: Vec<(String, f64)> = conn.zrange_withscores(&pending_key, 0, 0).await?;
        let oldest_pending_received_at = oldest
            .first()
            .map(|(_, score)| Utc.timestamp_millis_opt(*score as i64).single().unwrap_or_else(Utc::now));

        Ok(HealthMetrics {
            pending_count: pending_count + expired_captured,
            captured_count,
            dead_letter_count,
            oldest_pending_received_at,
        })
    }

    async fn cleanup_dedup(
        &self,
        _inbox_name: &str,
        _older_than: DateTime<Utc>,
        _batch_size: u32,
    ) -> Result<u64> {
        // Dedup keys carry a native Redis TTL; nothing to sweep.
        Ok(0)
    }

    async fn cleanup_dead_letters(
        &self,
        inbox_name: &str,
        older_than: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64> {
        let mut conn = self.conn.clone();
        let tag = tag(inbox_name);
        let dlq_key = format!("{tag}:dlq");
        let ids: Vec<String> = conn
            .zrangebyscore_limit(&dlq_key, "-inf", older_than.timestamp_millis(), 0, batch_size as isize)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len() as u64;
        let _: () = conn.zrem(&dlq_key, ids).await?;
        Ok(count)
    }

    async fn cleanup_group_locks(&self, _inbox_name: &str, _now: DateTime<Utc>) -> Result<u64> {
        // Lock keys carry a native Redis TTL; nothing to sweep.
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::Arc;

    #[tokio::test]
    #[ignore] // Requires a reachable Redis instance (REDIS_URL)
    async fn write_then_capture_round_trips() {
        let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let provider = RedisStorageProvider::connect(&redis_url, Arc::new(SystemClock)).await.unwrap();

        let msg = Message {
            id: MessageId::new(),
            inbox_name: "test".to_string(),
            message_type: "demo".to_string(),
            payload: vec![1, 2, 3],
            group_id: None,
            collapse_key: None,
            deduplication_id: None,
            attempts_count: 0,
            received_at: Utc::now(),
            captured_at: None,
            captured_by: None,
        };
        provider
            .write_one("test", msg, WritePolicy { deduplication_window: None })
            .await
            .unwrap();

        let processor = ProcessorId::new();
        let leased = provider
            .read_and_capture("test", &processor, 10, Duration::from_secs(300), ProcessingMode::Default)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        provider.complete("test", leased[0].id).await.unwrap();
    }
}
