//! PostgreSQL realisation of [`StorageProvider`] (§4.1 "SQL realisation").
//! Grounded on `db.rs`'s runtime-checked `sqlx::query`/`sqlx::query_as` style
//! and `fc-queue`'s `SqliteQueue` (`ROW_NUMBER() OVER (PARTITION BY ...)`
//! FIFO-head-of-group capture and optimistic `UPDATE ... WHERE` races),
//! upgraded to `FOR UPDATE SKIP LOCKED` and `ON CONFLICT DO NOTHING` for true
//! multi-writer atomicity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::{ProcessingMode, StorageConfig};
use crate::error::Result;
use crate::ids::{MessageId, ProcessorId};
use crate::message::{DeadLetterEntry, Envelope, Message, WriteOutcome};

use super::{HealthMetrics, LeaseRef, ProcessResultsBatch, StorageProvider, WritePolicy};

/// PostgreSQL-backed storage provider. One pool serves every inbox; rows are
/// partitioned by the `inbox_name` column rather than by table.
pub struct PgStorageProvider {
    pool: PgPool,
    clock: SharedClock,
}

impl PgStorageProvider {
    pub async fn connect(config: &StorageConfig, clock: SharedClock) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;
        info!(database_url = %redact(&config.database_url), "connected to postgres inbox storage");
        Ok(Self { pool, clock })
    }

    pub fn from_pool(pool: PgPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    /// Creates the schema if it does not already exist. Production
    /// deployments should prefer `sqlx::migrate!`; this is a convenience for
    /// local development and tests.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inbox_messages (
                id TEXT PRIMARY KEY,
                inbox_name TEXT NOT NULL,
                message_type TEXT NOT NULL,
                payload BYTEA NOT NULL,
                group_id TEXT,
                collapse_key TEXT,
                deduplication_id TEXT,
                attempts_count INTEGER NOT NULL DEFAULT 0,
                received_at TIMESTAMPTZ NOT NULL,
                captured_at TIMESTAMPTZ,
                captured_by TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_inbox_messages_poll \
             ON inbox_messages (inbox_name, captured_at, received_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_inbox_messages_collapse \
             ON inbox_messages (inbox_name, collapse_key) WHERE collapse_key IS NOT NULL AND captured_at IS NULL",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inbox_dedup (
                inbox_name TEXT NOT NULL,
                deduplication_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (inbox_name, deduplication_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inbox_group_locks (
                inbox_name TEXT NOT NULL,
                group_id TEXT NOT NULL,
                locked_by TEXT NOT NULL,
                deadline TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (inbox_name, group_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inbox_dead_letters (
                id TEXT PRIMARY KEY,
                inbox_name TEXT NOT NULL,
                message_type TEXT NOT NULL,
                payload BYTEA NOT NULL,
                group_id TEXT,
                attempts_count INTEGER NOT NULL,
                received_at TIMESTAMPTZ NOT NULL,
                failure_reason TEXT NOT NULL,
                moved_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn redact(url: &str) -> String {
    match url.find('@') {
        Some(at) => format!("***{}", &url[at..]),
        None => url.to_string(),
    }
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Message {
    Message {
        id: row
            .get::<String, _>("id")
            .parse()
            .expect("stored id is always a valid ulid"),
        inbox_name: row.get("inbox_name"),
        message_type: row.get("message_type"),
        payload: row.get("payload"),
        group_id: row.get("group_id"),
        collapse_key: row.get("collapse_key"),
        deduplication_id: row.get("deduplication_id"),
        attempts_count: row.get::<i32, _>("attempts_count") as u32,
        received_at: row.get("received_at"),
        captured_at: row.get("captured_at"),
        captured_by: row.get("captured_by"),
    }
}

async fn write_one_tx(
    tx: &mut Transaction<'_, Postgres>,
    inbox_name: &str,
    msg: &Message,
    policy: WritePolicy,
    now: DateTime<Utc>,
) -> Result<WriteOutcome> {
    if let Some(window) = policy.deduplication_window {
        if let Some(dedup_id) = &msg.deduplication_id {
            let cutoff = now - chrono_duration(window);
            let inserted = sqlx::query(
                r#"
                INSERT INTO inbox_dedup (inbox_name, deduplication_id, created_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (inbox_name, deduplication_id) DO UPDATE SET created_at = EXCLUDED.created_at
                WHERE inbox_dedup.created_at < $4
                "#,
            )
            .bind(inbox_name)
            .bind(dedup_id)
            .bind(now)
            .bind(cutoff)
            .execute(&mut **tx)
            .await?;

            if inserted.rows_affected() == 0 {
                return Ok(WriteOutcome::Duplicate);
            }
        }
    }

    if let Some(collapse_key) = &msg.collapse_key {
        sqlx::query(
            "DELETE FROM inbox_messages \
             WHERE inbox_name = $1 AND collapse_key = $2 AND captured_at IS NULL",
        )
        .bind(inbox_name)
        .bind(collapse_key)
        .execute(&mut **tx)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO inbox_messages
            (id, inbox_name, message_type, payload, group_id, collapse_key, deduplication_id,
             attempts_count, received_at, captured_at, captured_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, NULL)
        "#,
    )
    .bind(msg.id.as_str())
    .bind(inbox_name)
    .bind(&msg.message_type)
    .bind(&msg.payload)
    .bind(&msg.group_id)
    .bind(&msg.collapse_key)
    .bind(&msg.deduplication_id)
    .bind(msg.attempts_count as i32)
    .bind(msg.received_at)
    .execute(&mut **tx)
    .await?;

    Ok(WriteOutcome::Inserted)
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Returns a captured message to pending on `fail`/`release` — unless a
/// later write has already claimed the collapse-key slot it held, in which
/// case it is superseded and is deleted instead. Re-admitting it regardless
/// would set `captured_at = NULL` on two rows sharing `(inbox_name,
/// collapse_key)`, tripping `idx_inbox_messages_collapse`.
async fn reclaim_or_discard_tx(
    tx: &mut Transaction<'_, Postgres>,
    inbox_name: &str,
    id: MessageId,
    increment_attempts: bool,
) -> Result<()> {
    let row = sqlx::query("SELECT collapse_key FROM inbox_messages WHERE id = $1 AND inbox_name = $2 FOR UPDATE")
        .bind(id.as_str())
        .bind(inbox_name)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(row) = row else { return Ok(()) };
    let collapse_key: Option<String> = row.get("collapse_key");

    if let Some(collapse_key) = collapse_key {
        let superseded = sqlx::query(
            "SELECT 1 FROM inbox_messages \
             WHERE inbox_name = $1 AND collapse_key = $2 AND captured_at IS NULL AND id <> $3",
        )
        .bind(inbox_name)
        .bind(&collapse_key)
        .bind(id.as_str())
        .fetch_optional(&mut **tx)
        .await?
        .is_some();

        if superseded {
            sqlx::query("DELETE FROM inbox_messages WHERE id = $1 AND inbox_name = $2")
                .bind(id.as_str())
                .bind(inbox_name)
                .execute(&mut **tx)
                .await?;
            return Ok(());
        }
    }

    if increment_attempts {
        sqlx::query(
            r#"
            UPDATE inbox_messages
            SET captured_at = NULL, captured_by = NULL, attempts_count = attempts_count + 1
            WHERE id = $1 AND inbox_name = $2
            "#,
        )
        .bind(id.as_str())
        .bind(inbox_name)
        .execute(&mut **tx)
        .await?;
    } else {
        sqlx::query("UPDATE inbox_messages SET captured_at = NULL, captured_by = NULL WHERE id = $1 AND inbox_name = $2")
            .bind(id.as_str())
            .bind(inbox_name)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[async_trait]
impl StorageProvider for PgStorageProvider {
    async fn write_one(
        &self,
        inbox_name: &str,
        msg: Message,
        policy: WritePolicy,
    ) -> Result<WriteOutcome> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let outcome = write_one_tx(&mut tx, inbox_name, &msg, policy, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn write_batch(
        &self,
        inbox_name: &str,
        msgs: Vec<Message>,
        policy: WritePolicy,
    ) -> Result<usize> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for msg in &msgs {
            if write_one_tx(&mut tx, inbox_name, msg, policy, now).await? == WriteOutcome::Inserted {
                inserted += 1;
            }
        }
        tx.commit().await?;
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
        let deadline = now + chrono_duration(max_processing_time);
        let mut tx = self.pool.begin().await?;

        // Row-level capture happens below via an optimistic UPDATE, so the
        // selecting query here only needs to pick candidate ids; it does not
        // need FOR UPDATE itself.
        let candidate_ids: Vec<String> = if mode.requires_group_id() {
            let rows = sqlx::query(
                r#"
                WITH eligible AS (
                    SELECT m.id, m.group_id,
                           ROW_NUMBER() OVER (
                               PARTITION BY COALESCE(m.group_id, m.id)
                               ORDER BY m.received_at, m.id
                           ) AS rn
                    FROM inbox_messages m
                    LEFT JOIN inbox_group_locks gl
                        ON gl.inbox_name = m.inbox_name AND gl.group_id = m.group_id
                    WHERE m.inbox_name = $1
                      AND (m.captured_at IS NULL OR m.captured_at < $2)
                      AND (gl.group_id IS NULL OR gl.locked_by = $3 OR gl.deadline < $2)
                )
                SELECT id FROM eligible WHERE rn = 1 ORDER BY id LIMIT $4
                "#,
            )
            .bind(inbox_name)
            .bind(now)
            .bind(processor_id.as_str())
            .bind(batch_size as i64)
            .fetch_all(&mut *tx)
            .await?;
            rows.into_iter().map(|r| r.get::<String, _>("id")).collect()
        } else {
            let rows = sqlx::query(
                r#"
                SELECT id FROM inbox_messages
                WHERE inbox_name = $1 AND (captured_at IS NULL OR captured_at < $2)
                ORDER BY received_at, id
                LIMIT $3
                "#,
            )
            .bind(inbox_name)
            .bind(now)
            .bind(batch_size as i64)
            .fetch_all(&mut *tx)
            .await?;
            rows.into_iter().map(|r| r.get::<String, _>("id")).collect()
        };

        let mut captured = Vec::with_capacity(candidate_ids.len());
        let mut locked_groups: std::collections::HashSet<String> = std::collections::HashSet::new();

        for id in candidate_ids {
            let row = sqlx::query(
                r#"
                UPDATE inbox_messages
                SET captured_at = $1, captured_by = $2
                WHERE id = $3 AND inbox_name = $4 AND (captured_at IS NULL OR captured_at < $5)
                RETURNING id, inbox_name, message_type, payload, group_id, collapse_key,
                          deduplication_id, attempts_count, received_at, captured_at, captured_by
                "#,
            )
            .bind(deadline)
            .bind(processor_id.as_str())
            .bind(&id)
            .bind(inbox_name)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else { continue };
            let msg = row_to_message(&row);

            if mode.requires_group_id() {
                if let Some(group_id) = &msg.group_id {
                    if locked_groups.insert(group_id.clone()) {
                        sqlx::query(
                            r#"
                            INSERT INTO inbox_group_locks (inbox_name, group_id, locked_by, deadline)
                            VALUES ($1, $2, $3, $4)
                            ON CONFLICT (inbox_name, group_id)
                            DO UPDATE SET locked_by = EXCLUDED.locked_by,
                                          deadline = GREATEST(inbox_group_locks.deadline, EXCLUDED.deadline)
                            "#,
                        )
                        .bind(inbox_name)
                        .bind(group_id)
                        .bind(processor_id.as_str())
                        .bind(deadline)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            }

            captured.push(msg);
        }

        tx.commit().await?;

        if !captured.is_empty() {
            debug!(inbox = inbox_name, count = captured.len(), "captured messages");
        }

        Ok(captured.into_iter().map(Envelope::from).collect())
    }

    async fn complete(&self, inbox_name: &str, id: MessageId) -> Result<()> {
        sqlx::query("DELETE FROM inbox_messages WHERE id = $1 AND inbox_name = $2")
            .bind(id.as_str())
            .bind(inbox_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, inbox_name: &str, id: MessageId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        reclaim_or_discard_tx(&mut tx, inbox_name, id, true).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn release(&self, inbox_name: &str, id: MessageId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        reclaim_or_discard_tx(&mut tx, inbox_name, id, false).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        inbox_name: &str,
        id: MessageId,
        reason: String,
        enable_dead_letter: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "DELETE FROM inbox_messages WHERE id = $1 AND inbox_name = $2 \
             RETURNING id, inbox_name, message_type, payload, group_id, collapse_key, \
                       deduplication_id, attempts_count, received_at, captured_at, captured_by",
        )
        .bind(id.as_str())
        .bind(inbox_name)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = row {
            if enable_dead_letter {
                let msg = row_to_message(&row);
                sqlx::query(
                    r#"
                    INSERT INTO inbox_dead_letters
                        (id, inbox_name, message_type, payload, group_id, attempts_count,
                         received_at, failure_reason, moved_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(msg.id.as_str())
                .bind(inbox_name)
                .bind(&msg.message_type)
                .bind(&msg.payload)
                .bind(&msg.group_id)
                .bind(msg.attempts_count as i32)
                .bind(msg.received_at)
                .bind(&reason)
                .bind(self.clock.now())
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn process_results_batch(
        &self,
        inbox_name: &str,
        batch: ProcessResultsBatch,
        enable_dead_letter: bool,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
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
        let mut tx = self.pool.begin().await?;
        let mut extended = 0u32;
        let mut groups = Vec::new();

        for lease in leases {
            let result = sqlx::query(
                "UPDATE inbox_messages SET captured_at = $1 \
                 WHERE id = $2 AND inbox_name = $3 AND captured_by = $4",
            )
            .bind(new_deadline)
            .bind(lease.id.as_str())
            .bind(inbox_name)
            .bind(processor_id.as_str())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                extended += 1;
                if let Some(group_id) = &lease.group_id {
                    groups.push(group_id.clone());
                }
            }
        }

        for group_id in groups {
            sqlx::query(
                r#"
                INSERT INTO inbox_group_locks (inbox_name, group_id, locked_by, deadline)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (inbox_name, group_id)
                DO UPDATE SET deadline = GREATEST(inbox_group_locks.deadline, EXCLUDED.deadline)
                "#,
            )
            .bind(inbox_name)
            .bind(&group_id)
            .bind(processor_id.as_str())
            .bind(new_deadline)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(extended)
    }

    async fn release_group_locks(&self, inbox_name: &str, group_ids: &[String]) -> Result<()> {
        if group_ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM inbox_group_locks WHERE inbox_name = $1 AND group_id = ANY($2)")
            .bind(inbox_name)
            .bind(group_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_messages_and_group_locks(
        &self,
        inbox_name: &str,
        ids: &[MessageId],
        group_ids: &[String],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if !ids.is_empty() {
            let ids: Vec<String> = ids.iter().map(|id| id.as_str()).collect();
            sqlx::query(
                "UPDATE inbox_messages SET captured_at = NULL, captured_by = NULL \
                 WHERE inbox_name = $1 AND id = ANY($2)",
            )
            .bind(inbox_name)
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        }
        if !group_ids.is_empty() {
            sqlx::query("DELETE FROM inbox_group_locks WHERE inbox_name = $1 AND group_id = ANY($2)")
                .bind(inbox_name)
                .bind(group_ids)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn read_dead_letters(&self, inbox_name: &str, limit: u32) -> Result<Vec<DeadLetterEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, inbox_name, message_type, payload, group_id, attempts_count,
                   received_at, failure_reason, moved_at
            FROM inbox_dead_letters
            WHERE inbox_name = $1
            ORDER BY moved_at
            LIMIT $2
            "#,
        )
        .bind(inbox_name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DeadLetterEntry {
                id: row
                    .get::<String, _>("id")
                    .parse()
                    .expect("stored id is always a valid ulid"),
                inbox_name: row.get("inbox_name"),
                message_type: row.get("message_type"),
                payload: row.get("payload"),
                group_id: row.get("group_id"),
                attempts_count: row.get::<i32, _>("attempts_count") as u32,
                received_at: row.get("received_at"),
                failure_reason: row.get("failure_reason"),
                moved_at: row.get("moved_at"),
            })
            .collect())
    }

    async fn health_metrics(
        &self,
        inbox_name: &str,
        _max_processing_time: Duration,
    ) -> Result<HealthMetrics> {
        // captured_at already stores the absolute lease deadline (see
        // read_and_capture / extend_locks), so pending-vs-captured can be
        // decided from it directly without max_processing_time.
        let now = self.clock.now();

        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE captured_at IS NULL OR captured_at < $2) AS pending_count,
                COUNT(*) FILTER (WHERE captured_at IS NOT NULL AND captured_at >= $2) AS captured_count,
                MIN(received_at) FILTER (WHERE captured_at IS NULL OR captured_at < $2) AS oldest_pending
            FROM inbox_messages
            WHERE inbox_name = $1
            "#,
        )
        .bind(inbox_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let dead_letter_count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM inbox_dead_letters WHERE inbox_name = $1")
            .bind(inbox_name)
            .fetch_one(&self.pool)
            .await?
            .get("c");

        Ok(HealthMetrics {
            pending_count: row.get::<i64, _>("pending_count") as u64,
            captured_count: row.get::<i64, _>("captured_count") as u64,
            dead_letter_count: dead_letter_count as u64,
            oldest_pending_received_at: row.get("oldest_pending"),
        })
    }

    async fn cleanup_dedup(
        &self,
        inbox_name: &str,
        older_than: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM inbox_dedup
            WHERE (inbox_name, deduplication_id) IN (
                SELECT inbox_name, deduplication_id FROM inbox_dedup
                WHERE inbox_name = $1 AND created_at < $2
                LIMIT $3
            )
            "#,
        )
        .bind(inbox_name)
        .bind(older_than)
        .bind(batch_size as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup_dead_letters(
        &self,
        inbox_name: &str,
        older_than: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM inbox_dead_letters
            WHERE id IN (
                SELECT id FROM inbox_dead_letters
                WHERE inbox_name = $1 AND moved_at < $2
                LIMIT $3
            )
            "#,
        )
        .bind(inbox_name)
        .bind(older_than)
        .bind(batch_size as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            warn!(inbox = inbox_name, count = result.rows_affected(), "purged aged dead letters");
        }
        Ok(result.rows_affected())
    }

    async fn cleanup_group_locks(&self, inbox_name: &str, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM inbox_group_locks WHERE inbox_name = $1 AND deadline < $2")
            .bind(inbox_name)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::Arc;

    async fn connect() -> PgStorageProvider {
        let config = StorageConfig::default();
        let provider = PgStorageProvider::connect(&config, Arc::new(SystemClock)).await.unwrap();
        provider.init_schema().await.unwrap();
        provider
    }

    #[tokio::test]
    #[ignore] // Requires a reachable Postgres instance (DATABASE_URL)
    async fn write_then_capture_round_trips() {
        let provider = connect().await;
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
    }

    #[tokio::test]
    #[ignore] // Requires a reachable Postgres instance (DATABASE_URL)
    async fn dead_letter_after_complete_is_absent() {
        let provider = connect().await;
        let id = MessageId::new();
        let msg = Message {
            id,
            inbox_name: "test".to_string(),
            message_type: "demo".to_string(),
            payload: vec![],
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
        provider.complete("test", id).await.unwrap();

        let dead_letters = provider.read_dead_letters("test", 10).await.unwrap();
        assert!(dead_letters.iter().all(|e| e.id != id));
    }
}
