//! The per-inbox worker loop (§4.3). Grounded on
//! `federation/queue.rs::run_worker`'s `interval` + `tokio::select!` shape,
//! generalized from a fixed polling cadence to the spec's
//! empty-lease-backs-off / non-empty-lease-applies-`read_delay` cadence.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::SharedClock;
use crate::config::InboxOptions;
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::ids::{MessageId, ProcessorId};
use crate::lock_extender::LockExtender;
use crate::message::Envelope;
use crate::storage::{LeaseRef, StorageProvider};
use crate::strategy::{self, StrategyContext};

/// Releases a lease on drop unless [`disarm`](Self::disarm) was called first.
/// Covers the paths that skip the strategy's normal finalize calls: a panic
/// that unwinds past `run_once`, or a cancellation that aborts dispatch
/// mid-flight (§9 "Scoped resources").
struct LeaseGuard {
    storage: Arc<dyn StorageProvider>,
    inbox_name: String,
    ids: Vec<MessageId>,
    group_ids: Vec<String>,
    armed: bool,
}

impl LeaseGuard {
    fn new(storage: Arc<dyn StorageProvider>, inbox_name: String, lease: &[Envelope]) -> Self {
        let ids = lease.iter().map(|e| e.id).collect();
        let mut group_ids = Vec::new();
        for envelope in lease {
            if let Some(g) = &envelope.group_id {
                if !group_ids.contains(g) {
                    group_ids.push(g.clone());
                }
            }
        }
        Self {
            storage,
            inbox_name,
            ids,
            group_ids,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.armed || self.ids.is_empty() {
            return;
        }
        let storage = self.storage.clone();
        let inbox_name = self.inbox_name.clone();
        let ids = std::mem::take(&mut self.ids);
        let group_ids = std::mem::take(&mut self.group_ids);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = storage
                    .release_messages_and_group_locks(&inbox_name, &ids, &group_ids)
                    .await
                {
                    error!(inbox = %inbox_name, error = %e, "failed to release abandoned lease");
                }
            });
        }
    }
}

/// Runs the read-dispatch-finalize cycle for one inbox until cancelled.
pub struct Worker {
    inbox_name: String,
    options: InboxOptions,
    storage: Arc<dyn StorageProvider>,
    handlers: HandlerRegistry,
    clock: SharedClock,
    processor_id: ProcessorId,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        inbox_name: impl Into<String>,
        options: InboxOptions,
        storage: Arc<dyn StorageProvider>,
        handlers: HandlerRegistry,
        clock: SharedClock,
    ) -> Self {
        Self {
            inbox_name: inbox_name.into(),
            options,
            storage,
            handlers,
            clock,
            processor_id: ProcessorId::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn processor_id(&self) -> &ProcessorId {
        &self.processor_id
    }

    /// A clone of the token that [`stop`](Self::stop) cancels; hand this to
    /// supervising code that needs to trigger shutdown from elsewhere.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Requests shutdown. The running [`run`](Self::run) loop finishes its
    /// current lease (bounded by `shutdown_timeout`) and then returns.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Runs until [`stop`](Self::stop) is called or the process exits.
    pub async fn run(&self) {
        info!(
            inbox = %self.inbox_name,
            processor_id = %self.processor_id,
            mode = ?self.options.mode,
            "worker started"
        );

        while !self.shutdown.is_cancelled() {
            let leased = match self.run_once().await {
                Ok(leased) => leased,
                Err(e) => {
                    error!(inbox = %self.inbox_name, error = %e, "worker iteration failed");
                    0
                }
            };

            let backoff = if leased > 0 {
                self.options.read_delay
            } else {
                self.options.polling_interval
            };
            if backoff.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!(inbox = %self.inbox_name, processor_id = %self.processor_id, "worker stopped");
    }

    /// Leases, dispatches, and finalizes one batch. Returns the number of
    /// envelopes leased (0 if the inbox was empty).
    async fn run_once(&self) -> Result<usize> {
        let lease = self.lease_batch().await?;
        if lease.is_empty() {
            return Ok(0);
        }

        let count = lease.len();
        crate::metrics::record_lease_size(&self.inbox_name, count);
        let mut guard = LeaseGuard::new(self.storage.clone(), self.inbox_name.clone(), &lease);

        let extender = self.options.enable_lock_extension.then(|| {
            let lease_refs: Vec<LeaseRef> = lease
                .iter()
                .map(|e| LeaseRef { id: e.id, group_id: e.group_id.clone() })
                .collect();
            LockExtender::spawn(
                self.storage.clone(),
                self.clock.clone(),
                self.inbox_name.clone(),
                self.processor_id.clone(),
                lease_refs,
                self.options.max_processing_time,
                self.options.lock_extension_threshold,
            )
        });

        let ctx = StrategyContext {
            inbox_name: self.inbox_name.clone(),
            storage: self.storage.clone(),
            handlers: self.handlers.clone(),
            max_attempts: self.options.max_attempts,
            enable_dead_letter: self.options.enable_dead_letter,
            shutdown: self.shutdown.clone(),
        };
        let dispatch_fut = strategy::dispatch(&ctx, self.options.mode, lease);

        // Shutdown may already be requested, or may fire while this dispatch
        // is in flight; either way `shutdown_timeout` is measured from the
        // moment cancellation is actually observed, not from lease pickup.
        // A timeout here leaves the lease captured; the guard's drop then
        // releases it best-effort.
        let result = self.run_dispatch_bounded_by_shutdown(dispatch_fut).await;

        if let Some(extender) = extender {
            extender.stop().await;
        }

        match result {
            // Every envelope in the lease was handed a finalize call by the
            // strategy (or deliberately released, for aborted FIFO groups),
            // so the guard's best-effort drop release is now redundant.
            Some(result) => {
                guard.disarm();
                result?;
            }
            None => {}
        }
        Ok(count)
    }

    /// Races `dispatch_fut` against shutdown, whenever it fires. If shutdown
    /// was already requested the race is immediate; if it fires mid-flight,
    /// `shutdown_timeout` starts counting down from that moment rather than
    /// from when dispatch began.
    async fn run_dispatch_bounded_by_shutdown(
        &self,
        dispatch_fut: impl std::future::Future<Output = Result<()>>,
    ) -> Option<Result<()>> {
        tokio::pin!(dispatch_fut);
        tokio::select! {
            result = &mut dispatch_fut => Some(result),
            _ = self.shutdown.cancelled() => {
                match tokio::time::timeout(self.options.shutdown_timeout, dispatch_fut).await {
                    Ok(result) => Some(result),
                    Err(_) => {
                        error!(inbox = %self.inbox_name, "shutdown grace period elapsed with dispatch still in flight");
                        None
                    }
                }
            }
        }
    }

    async fn lease_batch(&self) -> Result<Vec<Envelope>> {
        self.storage
            .read_and_capture(
                &self.inbox_name,
                &self.processor_id,
                self.options.read_batch_size,
                self.options.max_processing_time,
                self.options.mode,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SystemClock, TestClock};
    use crate::handler::{Handler, PerMessageHandler};
    use crate::message::{HandlerOutcome, NewMessage};
    use crate::storage::memory::MemoryStorageProvider;
    use crate::writer::Writer;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl PerMessageHandler for CountingHandler {
        async fn handle(&self, _envelope: &Envelope, _shutdown: &CancellationToken) -> HandlerOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Success
        }
    }

    #[tokio::test]
    async fn processes_a_written_message_then_stops() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let storage = Arc::new(MemoryStorageProvider::new(clock.clone()));
        let mut options = InboxOptions::new(crate::config::ProcessingMode::Default);
        options.polling_interval = StdDuration::from_millis(5);
        options.enable_lock_extension = false;

        let writer = Writer::new("demo", &options, storage.clone(), clock.clone());
        writer.write(NewMessage::new("greet", vec![1, 2, 3])).await.unwrap();

        let handlers = HandlerRegistry::new();
        let processed = Arc::new(AtomicUsize::new(0));
        handlers.register("greet", Handler::PerMessage(Arc::new(CountingHandler(processed.clone()))));

        let worker = Worker::new("demo", options, storage, handlers, clock);
        let shutdown = worker.shutdown_handle();

        let run = tokio::spawn(async move { worker.run().await });
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        shutdown.cancel();
        run.await.unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_inbox_exits_promptly_on_shutdown() {
        let clock = Arc::new(SystemClock);
        let storage = Arc::new(MemoryStorageProvider::new(clock.clone()));
        let mut options = InboxOptions::new(crate::config::ProcessingMode::Default);
        options.polling_interval = StdDuration::from_secs(30);

        let worker = Worker::new("idle", options, storage, HandlerRegistry::new(), clock);
        let shutdown = worker.shutdown_handle();

        let run = tokio::spawn(async move { worker.run().await });
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        shutdown.cancel();
        tokio::time::timeout(StdDuration::from_secs(1), run)
            .await
            .expect("worker should stop promptly once cancelled")
            .unwrap();
    }
}
