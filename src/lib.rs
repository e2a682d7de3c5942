//! A durable, at-least-once message inbox processing engine: producers write
//! messages through a [`writer::Writer`], workers lease and dispatch them
//! through one of four [`config::ProcessingMode`] strategies, and the result
//! is finalized back to whichever [`storage::StorageProvider`] backs the
//! inbox (in-memory, PostgreSQL, or Redis).

pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod health;
pub mod ids;
pub mod message;
pub mod metrics;
pub mod serializer;
pub mod storage;
pub mod writer;

mod cleanup;
mod lock_extender;
mod strategy;
mod worker;

pub mod registry;

pub use cleanup::{run_dead_letter_cleanup, run_dedup_cleanup, run_group_lock_cleanup};
pub use config::{CleanupOptions, InboxOptions, ProcessingMode, StorageConfig};
pub use error::{InboxError, Result};
pub use handler::{BatchHandler, FifoBatchHandler, Handler, HandlerRegistry, PerMessageHandler};
pub use ids::{MessageId, ProcessorId};
pub use message::{BatchItemResult, DeadLetterEntry, Envelope, HandlerOutcome, Message, NewMessage, WriteOutcome};
pub use registry::{Inbox, InboxRegistry};
pub use storage::{HealthMetrics, ProcessResultsBatch, StorageProvider, WritePolicy};
pub use worker::Worker;
pub use writer::Writer;
