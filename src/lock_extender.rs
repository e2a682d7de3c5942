//! Background lease-extension task (§4.4). A handler that runs long is still
//! protected from a competing worker re-capturing its messages: while
//! dispatch is in flight, a ticking task periodically pushes the lease
//! deadline forward. Grounded on `federation/queue.rs::run_worker`'s
//! `interval` + `tokio::select!` shape, adapted from a poll loop to a
//! cancellable background extender.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::SharedClock;
use crate::ids::ProcessorId;
use crate::storage::{LeaseRef, StorageProvider};

/// Owns a background task that re-extends a fixed set of leases until
/// stopped. Dropping without calling [`stop`](Self::stop) cancels the task
/// but does not wait for it.
pub struct LockExtender {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LockExtender {
    /// Spawns the extension loop for `leases`, ticking every
    /// `max_processing_time * threshold` (§6.3 `lock_extension_threshold`).
    pub fn spawn(
        storage: Arc<dyn StorageProvider>,
        clock: SharedClock,
        inbox_name: String,
        processor_id: ProcessorId,
        leases: Vec<LeaseRef>,
        max_processing_time: Duration,
        threshold: f64,
    ) -> Self {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let tick_period = max_processing_time.mul_f64(threshold.clamp(0.1, 0.9));
        let expected = leases.len();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // the first tick fires immediately; skip it

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let new_deadline = clock.now()
                            + chrono::Duration::from_std(max_processing_time).unwrap_or(chrono::Duration::zero());
                        match storage
                            .extend_locks(&inbox_name, &processor_id, &leases, new_deadline)
                            .await
                        {
                            Ok(extended) if extended as usize == expected => {
                                debug!(inbox = %inbox_name, extended, "leases extended");
                            }
                            Ok(extended) => {
                                warn!(
                                    inbox = %inbox_name,
                                    extended,
                                    expected,
                                    "fewer leases extended than held; some may have been reclaimed"
                                );
                            }
                            Err(e) => {
                                error!(inbox = %inbox_name, error = %e, "failed to extend leases");
                            }
                        }
                    }
                    _ = child.cancelled() => break,
                }
            }
        });

        Self { cancel, handle }
    }

    /// Cancels the task and waits for it to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
