//! Batched strategy (§4.2): envelopes are grouped by `message_type`, each
//! group handed to its batch handler in one call, and every outcome in the
//! lease is finalized through a single `ProcessResultsBatch` call.

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::ids::MessageId;
use crate::message::Envelope;
use crate::storage::ProcessResultsBatch;

use super::{bin, invoke_batch, record_batch_metrics, translate, StrategyContext};

pub async fn dispatch(ctx: &StrategyContext, lease: Vec<Envelope>) -> Result<()> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Envelope>> = HashMap::new();
    for envelope in lease {
        groups
            .entry(envelope.message_type.clone())
            .or_insert_with(|| {
                order.push(envelope.message_type.clone());
                Vec::new()
            })
            .push(envelope);
    }

    let mut batch = ProcessResultsBatch::default();
    for message_type in order {
        let envelopes = groups.remove(&message_type).unwrap_or_default();
        let attempts: HashMap<MessageId, u32> =
            envelopes.iter().map(|e| (e.id, e.attempts_count)).collect();
        let ids: Vec<MessageId> = envelopes.iter().map(|e| e.id).collect();

        let results = invoke_batch(ctx, &message_type, &envelopes).await;
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
    Ok(())
}
