//! Periodic maintenance for dedup/DLQ/group-lock auxiliary records (§4.6).
//! Grounded on `jobs/delivery_acks_cleanup.rs` and `jobs/key_package_cleanup.rs`:
//! a `tokio::time::interval` ticker wrapping a batched delete loop, with the
//! teacher's `Ok(n) if n > 0 => info!, Ok(_) => {}, Err(e) => error!` shape.
//! KV backends implement the three `StorageProvider::cleanup_*` calls as
//! no-ops (native TTL handles expiry), so running these loops against a
//! `RedisStorageProvider` is harmless but redundant.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::SharedClock;
use crate::config::CleanupOptions;
use crate::storage::StorageProvider;

/// Runs the dedup-record reaper for one inbox until `shutdown` is cancelled
/// (§4.6 "Dedup cleanup"). No-op on backends that rely on native TTL.
pub async fn run_dedup_cleanup(
    storage: Arc<dyn StorageProvider>,
    inbox_name: String,
    clock: SharedClock,
    deduplication_interval: Duration,
    cleanup: CleanupOptions,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(cleanup.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(inbox = %inbox_name, interval_secs = cleanup.interval.as_secs(), "dedup cleanup worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let older_than = clock.now()
                    - chrono::Duration::from_std(deduplication_interval).unwrap_or(chrono::Duration::zero());
                match drain_until_empty(|| storage.cleanup_dedup(&inbox_name, older_than, cleanup.batch_size)).await {
                    Ok(removed) if removed > 0 => info!(inbox = %inbox_name, removed, "cleaned up dedup records"),
                    Ok(_) => {}
                    Err(e) => {
                        error!(inbox = %inbox_name, error = %e, "dedup cleanup failed");
                        tokio::select! {
                            _ = tokio::time::sleep(cleanup.restart_delay) => {}
                            _ = shutdown.cancelled() => break,
                        }
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    info!(inbox = %inbox_name, "dedup cleanup worker stopped");
}

/// Runs the dead-letter reaper for one inbox until `shutdown` is cancelled
/// (§4.6 "DLQ cleanup").
pub async fn run_dead_letter_cleanup(
    storage: Arc<dyn StorageProvider>,
    inbox_name: String,
    clock: SharedClock,
    dead_letter_max_message_lifetime: Duration,
    cleanup: CleanupOptions,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(cleanup.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(inbox = %inbox_name, interval_secs = cleanup.interval.as_secs(), "dead-letter cleanup worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let older_than = clock.now()
                    - chrono::Duration::from_std(dead_letter_max_message_lifetime).unwrap_or(chrono::Duration::zero());
                match drain_until_empty(|| storage.cleanup_dead_letters(&inbox_name, older_than, cleanup.batch_size)).await {
                    Ok(removed) if removed > 0 => info!(inbox = %inbox_name, removed, "cleaned up dead-letter records"),
                    Ok(_) => {}
                    Err(e) => {
                        error!(inbox = %inbox_name, error = %e, "dead-letter cleanup failed");
                        tokio::select! {
                            _ = tokio::time::sleep(cleanup.restart_delay) => {}
                            _ = shutdown.cancelled() => break,
                        }
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    info!(inbox = %inbox_name, "dead-letter cleanup worker stopped");
}

/// Runs the abandoned-group-lock reaper for one inbox until `shutdown` is
/// cancelled (§4.6 "Group-lock cleanup"). SQL-only: KV group locks expire on
/// their own TTL.
pub async fn run_group_lock_cleanup(
    storage: Arc<dyn StorageProvider>,
    inbox_name: String,
    clock: SharedClock,
    cleanup: CleanupOptions,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(cleanup.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(inbox = %inbox_name, interval_secs = cleanup.interval.as_secs(), "group-lock cleanup worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match storage.cleanup_group_locks(&inbox_name, clock.now()).await {
                    Ok(removed) if removed > 0 => info!(inbox = %inbox_name, removed, "cleaned up abandoned group locks"),
                    Ok(_) => {}
                    Err(e) => {
                        error!(inbox = %inbox_name, error = %e, "group-lock cleanup failed");
                        tokio::select! {
                            _ = tokio::time::sleep(cleanup.restart_delay) => {}
                            _ = shutdown.cancelled() => break,
                        }
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    info!(inbox = %inbox_name, "group-lock cleanup worker stopped");
}

async fn drain_until_empty<F, Fut>(mut delete_batch: F) -> crate::error::Result<u64>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::error::Result<u64>>,
{
    let mut total = 0u64;
    loop {
        let removed = delete_batch().await?;
        total += removed;
        if removed == 0 {
            break;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn drain_until_empty_sums_batches() {
        let calls = Arc::new(AtomicU64::new(0));
        let remaining = Arc::new(AtomicU64::new(7));
        let total = drain_until_empty(|| {
            let calls = calls.clone();
            let remaining = remaining.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let take = remaining.load(Ordering::SeqCst).min(3);
                remaining.fetch_sub(take, Ordering::SeqCst);
                Ok(take)
            }
        })
        .await
        .unwrap();

        assert_eq!(total, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4); // 3 + 3 + 1, then an empty pass
    }
}
