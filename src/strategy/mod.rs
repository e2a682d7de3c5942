//! The four processing strategies (§4.2): the glue between a leased batch of
//! envelopes and the registered handlers. Grounded on the state-machine
//! translation table in §4.2 directly (no single teacher file implements
//! retry/dead-letter pipelines, since MLS chat has none); the sequential
//! per-item dispatch loop follows `federation/queue.rs::process_pending_batch`
//! and `process_item`'s `match` over outcome variants.

pub mod batched;
pub mod default;
pub mod fifo;
pub mod fifo_batched;

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::ProcessingMode;
use crate::error::Result;
use crate::handler::{Handler, HandlerRegistry};
use crate::ids::MessageId;
use crate::message::{Envelope, HandlerOutcome};
use crate::storage::{ProcessResultsBatch, StorageProvider};

/// Everything a strategy needs to translate handler outcomes into finalize
/// calls for one inbox.
#[derive(Clone)]
pub struct StrategyContext {
    pub inbox_name: String,
    pub storage: Arc<dyn StorageProvider>,
    pub handlers: HandlerRegistry,
    pub max_attempts: u32,
    pub enable_dead_letter: bool,
    pub shutdown: CancellationToken,
}

/// Dispatches one leased batch through the strategy matching `mode`.
pub async fn dispatch(ctx: &StrategyContext, mode: ProcessingMode, lease: Vec<Envelope>) -> Result<()> {
    if lease.is_empty() {
        return Ok(());
    }
    match mode {
        ProcessingMode::Default => default::dispatch(ctx, lease).await,
        ProcessingMode::Batched => batched::dispatch(ctx, lease).await,
        ProcessingMode::Fifo => fifo::dispatch(ctx, lease).await,
        ProcessingMode::FifoBatched => fifo_batched::dispatch(ctx, lease).await,
    }
}

/// The finalize action a translated handler outcome maps to (§4.2).
pub(crate) enum Finalize {
    Complete,
    Release,
    Fail,
    DeadLetter(String),
}

/// Translates one handler outcome into a finalize action given the
/// message's current `attempts_count` (§4.2 Default/FIFO translation table).
pub(crate) fn translate(outcome: HandlerOutcome, attempts_count: u32, max_attempts: u32) -> Finalize {
    match outcome {
        HandlerOutcome::Success => Finalize::Complete,
        HandlerOutcome::Retry => Finalize::Release,
        HandlerOutcome::Failed { reason } => {
            if attempts_count + 1 < max_attempts {
                Finalize::Fail
            } else {
                Finalize::DeadLetter(reason.unwrap_or_else(|| "max attempts exceeded".to_string()))
            }
        }
        HandlerOutcome::MoveToDeadLetter { reason } => Finalize::DeadLetter(reason),
    }
}

pub(crate) async fn apply_finalize(ctx: &StrategyContext, id: MessageId, finalize: Finalize) -> Result<()> {
    match finalize {
        Finalize::Complete => {
            ctx.storage.complete(&ctx.inbox_name, id).await?;
            metrics::counter!("inbox_messages_completed_total", 1, "inbox" => ctx.inbox_name.clone());
        }
        Finalize::Release => {
            ctx.storage.release(&ctx.inbox_name, id).await?;
        }
        Finalize::Fail => {
            ctx.storage.fail(&ctx.inbox_name, id).await?;
            metrics::counter!("inbox_messages_failed_total", 1, "inbox" => ctx.inbox_name.clone());
        }
        Finalize::DeadLetter(reason) => {
            ctx.storage
                .dead_letter(&ctx.inbox_name, id, reason, ctx.enable_dead_letter)
                .await?;
            metrics::counter!("inbox_messages_dead_lettered_total", 1, "inbox" => ctx.inbox_name.clone());
        }
    }
    Ok(())
}

/// Pushes `id` into the right bin of a batched finalize request, mirroring
/// [`apply_finalize`] without performing the call itself.
pub(crate) fn bin(batch: &mut ProcessResultsBatch, id: MessageId, finalize: Finalize) {
    match finalize {
        Finalize::Complete => batch.to_complete.push(id),
        Finalize::Release => batch.to_release.push(id),
        Finalize::Fail => batch.to_fail.push(id),
        Finalize::DeadLetter(reason) => batch.to_dead_letter.push((id, reason)),
    }
}

pub(crate) fn record_batch_metrics(inbox_name: &str, batch: &ProcessResultsBatch) {
    if !batch.to_complete.is_empty() {
        metrics::counter!("inbox_messages_completed_total", batch.to_complete.len() as u64, "inbox" => inbox_name.to_string());
    }
    if !batch.to_fail.is_empty() {
        metrics::counter!("inbox_messages_failed_total", batch.to_fail.len() as u64, "inbox" => inbox_name.to_string());
    }
    if !batch.to_dead_letter.is_empty() {
        metrics::counter!("inbox_messages_dead_lettered_total", batch.to_dead_letter.len() as u64, "inbox" => inbox_name.to_string());
    }
}

/// Looks up and invokes the per-message handler registered for the
/// envelope's `message_type`, spawned so a handler panic surfaces as a
/// `JoinError` instead of unwinding the worker loop (§4.2 "An unhandled
/// panic/exception in the handler is treated as Failed").
pub(crate) async fn invoke_per_message(ctx: &StrategyContext, envelope: &Envelope) -> HandlerOutcome {
    let handler = match ctx.handlers.get(&envelope.message_type) {
        Some(Handler::PerMessage(h)) => h,
        Some(_) => {
            error!(
                inbox = %ctx.inbox_name,
                message_type = %envelope.message_type,
                "handler registered for a different processing mode"
            );
            return HandlerOutcome::Failed {
                reason: Some("handler kind mismatch".to_string()),
            };
        }
        None => {
            error!(inbox = %ctx.inbox_name, message_type = %envelope.message_type, "no handler registered");
            return HandlerOutcome::Failed {
                reason: Some(format!("no handler registered for message_type {:?}", envelope.message_type)),
            };
        }
    };

    let envelope_owned = envelope.clone();
    let shutdown = ctx.shutdown.clone();
    let started = Instant::now();
    let outcome = match tokio::spawn(async move { handler.handle(&envelope_owned, &shutdown).await }).await {
        Ok(outcome) => outcome,
        Err(join_err) => {
            error!(inbox = %ctx.inbox_name, message_id = %envelope.id, error = %join_err, "handler panicked");
            HandlerOutcome::Failed {
                reason: Some(format!("handler panicked: {join_err}")),
            }
        }
    };
    metrics::histogram!("inbox_handler_duration_seconds", started.elapsed().as_secs_f64(), "inbox" => ctx.inbox_name.clone());
    debug!(
        inbox = %ctx.inbox_name,
        message_id = %envelope.id,
        attempts = envelope.attempts_count,
        "handler invoked"
    );
    outcome
}

/// Invokes the batch handler registered for `message_type` over one group
/// of envelopes sharing that type (§4.2 Batched strategy).
pub(crate) async fn invoke_batch(
    ctx: &StrategyContext,
    message_type: &str,
    envelopes: &[Envelope],
) -> Vec<crate::message::BatchItemResult> {
    let handler = match ctx.handlers.get(message_type) {
        Some(Handler::Batch(h)) => h,
        Some(_) => {
            error!(inbox = %ctx.inbox_name, message_type, "handler registered for a different processing mode");
            return Vec::new();
        }
        None => {
            error!(inbox = %ctx.inbox_name, message_type, "no batch handler registered");
            return Vec::new();
        }
    };

    let owned: Vec<Envelope> = envelopes.to_vec();
    let shutdown = ctx.shutdown.clone();
    let started = Instant::now();
    let results = match tokio::spawn(async move { handler.handle_batch(&owned, &shutdown).await }).await {
        Ok(results) => results,
        Err(join_err) => {
            error!(inbox = %ctx.inbox_name, message_type, error = %join_err, "batch handler panicked");
            Vec::new()
        }
    };
    metrics::histogram!("inbox_handler_duration_seconds", started.elapsed().as_secs_f64(), "inbox" => ctx.inbox_name.clone());
    results
}

/// Invokes the FIFO-batch handler registered for `message_type` over one
/// group's in-order slice (§4.2 FIFO-Batched strategy).
pub(crate) async fn invoke_fifo_batch(
    ctx: &StrategyContext,
    message_type: &str,
    group_id: &str,
    envelopes: &[Envelope],
) -> Vec<crate::message::BatchItemResult> {
    let handler = match ctx.handlers.get(message_type) {
        Some(Handler::FifoBatch(h)) => h,
        Some(_) => {
            error!(inbox = %ctx.inbox_name, message_type, "handler registered for a different processing mode");
            return Vec::new();
        }
        None => {
            error!(inbox = %ctx.inbox_name, message_type, "no fifo-batch handler registered");
            return Vec::new();
        }
    };

    let owned: Vec<Envelope> = envelopes.to_vec();
    let group_id = group_id.to_string();
    let shutdown = ctx.shutdown.clone();
    let started = Instant::now();
    let results = match tokio::spawn(async move { handler.handle_group(&group_id, &owned, &shutdown).await }).await {
        Ok(results) => results,
        Err(join_err) => {
            error!(inbox = %ctx.inbox_name, message_type, error = %join_err, "fifo-batch handler panicked");
            Vec::new()
        }
    };
    metrics::histogram!("inbox_handler_duration_seconds", started.elapsed().as_secs_f64(), "inbox" => ctx.inbox_name.clone());
    results
}
