//! Construction-time wiring of named inboxes (§9 "Global state": the storage
//! backend is a value parameter threaded through at registration, never a
//! process-wide singleton — a single provider instance still serves every
//! inbox registered against it). Grounded on `actors/registry.rs`'s
//! `ActorRegistry`: `DashMap`-backed, cheaply `Clone`-via-`Arc`, with a
//! `shutdown_all()` that stops every tracked background task.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::cleanup;
use crate::config::{CleanupOptions, InboxOptions};
use crate::error::{InboxError, Result};
use crate::handler::HandlerRegistry;
use crate::storage::StorageProvider;
use crate::worker::Worker;
use crate::writer::Writer;

/// The handle callers get back from [`InboxRegistry::register`]: a `Writer`
/// to publish messages and a `HandlerRegistry` to wire up handlers before
/// calling [`InboxRegistry::start`].
pub struct Inbox {
    pub writer: Writer,
    pub handlers: HandlerRegistry,
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox").finish_non_exhaustive()
    }
}

struct Entry {
    options: InboxOptions,
    handlers: HandlerRegistry,
    running: Option<Running>,
}

struct Running {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Owns the storage backend and every registered inbox's configuration and
/// background tasks for one process.
pub struct InboxRegistry {
    storage: Arc<dyn StorageProvider>,
    clock: SharedClock,
    entries: Arc<DashMap<String, Entry>>,
}

impl InboxRegistry {
    pub fn new(storage: Arc<dyn StorageProvider>, clock: SharedClock) -> Self {
        Self {
            storage,
            clock,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Registers a new inbox. Does not start its worker or cleanup
    /// tasks — register handlers against the returned [`Inbox::handlers`]
    /// first, then call [`start`](Self::start).
    pub fn register(&self, name: impl Into<String>, options: InboxOptions) -> Result<Inbox> {
        let name = name.into();
        options.validate(&name)?;
        if self.entries.contains_key(&name) {
            return Err(InboxError::Configuration {
                inbox: name,
                reason: "inbox already registered".to_string(),
            });
        }

        let handlers = HandlerRegistry::new();
        let writer = Writer::new(name.clone(), &options, self.storage.clone(), self.clock.clone());

        info!(inbox = %name, mode = ?options.mode, "inbox registered");
        self.entries.insert(
            name,
            Entry {
                options,
                handlers: handlers.clone(),
                running: None,
            },
        );

        Ok(Inbox { writer, handlers })
    }

    /// Starts the worker and the three cleanup loops for a registered inbox.
    pub fn start(&self, name: &str, cleanup_options: CleanupOptions) -> Result<()> {
        let (options, handlers) = {
            let entry = self.entries.get(name).ok_or_else(|| InboxError::Configuration {
                inbox: name.to_string(),
                reason: "inbox not registered".to_string(),
            })?;
            (entry.options.clone(), entry.handlers.clone())
        };

        let mut handles = Vec::new();

        let worker = Worker::new(name, options.clone(), self.storage.clone(), handlers, self.clock.clone());
        let shutdown = worker.shutdown_handle();
        handles.push(tokio::spawn(async move { worker.run().await }));

        handles.push(tokio::spawn(cleanup::run_dedup_cleanup(
            self.storage.clone(),
            name.to_string(),
            self.clock.clone(),
            options.deduplication_interval,
            cleanup_options.clone(),
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(cleanup::run_dead_letter_cleanup(
            self.storage.clone(),
            name.to_string(),
            self.clock.clone(),
            options.dead_letter_max_message_lifetime,
            cleanup_options.clone(),
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(cleanup::run_group_lock_cleanup(
            self.storage.clone(),
            name.to_string(),
            self.clock.clone(),
            cleanup_options,
            shutdown.clone(),
        )));

        if let Some(mut entry) = self.entries.get_mut(name) {
            entry.running = Some(Running { shutdown, handles });
        }
        Ok(())
    }

    /// Requests shutdown for one inbox's worker and cleanup tasks without
    /// waiting for them to finish.
    pub fn stop(&self, name: &str) {
        if let Some(entry) = self.entries.get(name) {
            if let Some(running) = &entry.running {
                running.shutdown.cancel();
            } else {
                warn!(inbox = %name, "stop called on an inbox that was never started");
            }
        }
    }

    /// Stops every running inbox and awaits all of their background tasks.
    pub async fn shutdown_all(&self) {
        info!(count = self.entries.len(), "shutting down all inboxes");
        let mut all_handles = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if let Some(running) = entry.running.take() {
                running.shutdown.cancel();
                all_handles.extend(running.handles);
            }
        }
        for handle in all_handles {
            let _ = handle.await;
        }
        info!("all inboxes shut down");
    }

    pub fn inbox_count(&self) -> usize {
        self.entries.len()
    }
}

impl Clone for InboxRegistry {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            clock: self.clock.clone(),
            entries: self.entries.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::ProcessingMode;
    use crate::storage::memory::MemoryStorageProvider;

    #[test]
    fn register_rejects_duplicate_names() {
        let registry = InboxRegistry::new(
            Arc::new(MemoryStorageProvider::new(Arc::new(SystemClock))),
            Arc::new(SystemClock),
        );
        registry.register("demo", InboxOptions::new(ProcessingMode::Default)).unwrap();
        let err = registry
            .register("demo", InboxOptions::new(ProcessingMode::Default))
            .unwrap_err();
        assert!(matches!(err, InboxError::Configuration { .. }));
        assert_eq!(registry.inbox_count(), 1);
    }

    #[tokio::test]
    async fn start_then_shutdown_all_stops_cleanly() {
        let registry = InboxRegistry::new(
            Arc::new(MemoryStorageProvider::new(Arc::new(SystemClock))),
            Arc::new(SystemClock),
        );
        let mut options = InboxOptions::new(ProcessingMode::Default);
        options.polling_interval = std::time::Duration::from_millis(5);
        registry.register("demo", options).unwrap();

        let mut cleanup_options = CleanupOptions::default();
        cleanup_options.interval = std::time::Duration::from_millis(5);
        registry.start("demo", cleanup_options).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), registry.shutdown_all())
            .await
            .expect("shutdown_all should complete promptly");
    }
}
