//! FIFO-Batched strategy (§4.2): like Batched, but the lease is grouped by
//! `group_id` instead of `message_type`, and the handler registered for a
//! group's messages is invoked once with that group's in-order slice. Every
//! outcome in the lease is still finalized through a single
//! `ProcessResultsBatch` call, and all groups present are released together
//! once finalized.

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::ids::MessageId;
use crate::message::Envelope;
use crate::storage::ProcessResultsBatch;

use super::{bin, invoke_fifo_batch, record_batch_metrics, translate, StrategyContext};

pub async fn dispatch(ctx: &StrategyContext, lease: Vec<Envelope>) -> Result<()> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Envelope>> = HashMap::new();
    for envelope in lease {
        let group_id = envelope.group_id.clone().unwrap_or_default();
        groups
            .entry(group_id.clone())
            .or_insert_with(|| {
                order.push(group_id);
                Vec::new()
            })
            .push(envelope);
    }

    let mut batch = ProcessResultsBatch::default();
    for group_id in &order {
        let envelopes = groups.remove(group_id).unwrap_or_default();
        let Some(first) = envelopes.first() else { continue };
        let message_type = first.message_type.clone();
        let attempts: HashMap<MessageId, u32> =
            envelopes.iter().map(|e| (e.id, e.attempts_count)).collect();
        let ids: Vec<MessageId> = envelopes.iter().map(|e| e.id).collect();

        let results = invoke_fifo_batch(ctx, &message_type, group_id, &envelopes).await;
        let mut seen: HashSet<MessageId> = HashSet::new();
        for result in results {
            seen.insert(result.id);
            let attempts_count = attempts.get(&result.id).copied().unwrap_or(0);
            bin(&mut batch, result.id, translate(result.outcome, attempts_count, ctx.max_attempts));
        }
        for id in ids {
            if !seen.contains(&id) {
                batch.to_release.push(id);
            }
        }
    }

    if !batch.is_empty() {
        record_batch_metrics(&ctx.inbox_name, &batch);
        ctx.storage
            .process_results_batch(&ctx.inbox_name, batch, ctx.enable_dead_letter)
            .await?;
    }

    let group_ids: Vec<String> = order.into_iter().filter(|g| !g.is_empty()).collect();
    if !group_ids.is_empty() {
        ctx.storage.release_group_locks(&ctx.inbox_name, &group_ids).await?;
    }
    Ok(())
}
