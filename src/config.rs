//! Per-inbox configuration (§6.3) plus environment-variable loading.

use std::time::Duration;
use tracing::warn;

/// The four processing modes (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Default,
    Batched,
    Fifo,
    FifoBatched,
}

impl ProcessingMode {
    pub fn requires_group_id(&self) -> bool {
        matches!(self, ProcessingMode::Fifo | ProcessingMode::FifoBatched)
    }
}

/// Configuration for one inbox (§6.3).
#[derive(Debug, Clone)]
pub struct InboxOptions {
    pub mode: ProcessingMode,
    pub read_batch_size: u32,
    pub write_batch_size: u32,
    pub max_processing_time: Duration,
    pub polling_interval: Duration,
    pub read_delay: Duration,
    pub shutdown_timeout: Duration,
    pub max_attempts: u32,
    pub enable_dead_letter: bool,
    pub dead_letter_max_message_lifetime: Duration,
    pub enable_deduplication: bool,
    pub deduplication_interval: Duration,
    pub enable_lock_extension: bool,
    pub lock_extension_threshold: f64,
    pub max_processing_threads: u32,
}

impl InboxOptions {
    /// Builds default options for the given mode. Mirrors the defaults in §6.3.
    pub fn new(mode: ProcessingMode) -> Self {
        Self {
            mode,
            read_batch_size: 100,
            write_batch_size: 100,
            max_processing_time: Duration::from_secs(5 * 60),
            polling_interval: Duration::from_secs(5),
            read_delay: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(30),
            max_attempts: 3,
            enable_dead_letter: true,
            dead_letter_max_message_lifetime: Duration::from_secs(14 * 24 * 60 * 60),
            enable_deduplication: false,
            deduplication_interval: Duration::from_secs(60 * 60),
            enable_lock_extension: true,
            lock_extension_threshold: 0.5,
            max_processing_threads: 1,
        }
    }

    /// Validates invariants that must hold before the inbox is allowed to
    /// start (§7 "Configuration error" — rejected at start-up).
    pub fn validate(&self, inbox_name: &str) -> Result<(), crate::error::InboxError> {
        let fail = |reason: &str| crate::error::InboxError::Configuration {
            inbox: inbox_name.to_string(),
            reason: reason.to_string(),
        };

        if self.read_batch_size == 0 {
            return Err(fail("read_batch_size must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(fail("max_attempts must be > 0"));
        }
        if !(0.1..=0.9).contains(&self.lock_extension_threshold) {
            return Err(fail("lock_extension_threshold must be within 0.1..=0.9"));
        }
        if self.max_processing_threads == 0 {
            return Err(fail("max_processing_threads must be > 0"));
        }
        if self.max_processing_time.is_zero() {
            return Err(fail("max_processing_time must be > 0"));
        }
        Ok(())
    }

    /// Overrides fields from `{PREFIX}_*` environment variables, following
    /// the parse-with-warn-fallback idiom used for cleanup-interval env vars
    /// elsewhere in the ambient configuration stack. Unset or unparsable
    /// variables leave the current value untouched.
    pub fn apply_env_overrides(mut self, prefix: &str) -> Self {
        if let Some(v) = env_u32(prefix, "READ_BATCH_SIZE") {
            self.read_batch_size = v;
        }
        if let Some(v) = env_u32(prefix, "MAX_ATTEMPTS") {
            self.max_attempts = v;
        }
        if let Some(v) = env_secs(prefix, "MAX_PROCESSING_TIME_SECS") {
            self.max_processing_time = v;
        }
        if let Some(v) = env_secs(prefix, "POLLING_INTERVAL_SECS") {
            self.polling_interval = v;
        }
        if let Some(v) = env_secs(prefix, "DEDUPLICATION_INTERVAL_SECS") {
            self.deduplication_interval = v;
        }
        self
    }
}

fn env_u32(prefix: &str, suffix: &str) -> Option<u32> {
    let key = format!("{prefix}_{suffix}");
    match std::env::var(&key) {
        Ok(raw) => match raw.parse::<u32>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value = %raw, "invalid integer env var, keeping default");
                None
            }
        },
        Err(_) => None,
    }
}

fn env_secs(prefix: &str, suffix: &str) -> Option<Duration> {
    env_u32(prefix, suffix).map(|secs| Duration::from_secs(secs as u64))
}

/// Connection parameters for a storage backend, mirroring `DbConfig`'s
/// environment-first-with-defaults shape.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_url: String,
    pub redis_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/inbox".to_string()),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1/".to_string()),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for the periodic cleanup tasks (§4.6), independent of
/// `InboxOptions` since it governs maintenance loops, not the worker itself.
#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub interval: Duration,
    pub batch_size: u32,
    pub restart_delay: Duration,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            batch_size: 500,
            restart_delay: Duration::from_secs(30),
        }
    }
}
