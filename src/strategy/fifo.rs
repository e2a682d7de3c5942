//! FIFO strategy (§4.2): identical per-message semantics to Default, but a
//! message whose outcome leaves its slot pending again (`Release`/`Fail`)
//! aborts the rest of its group for this lease — later same-group envelopes
//! are released untouched rather than handed to the handler out of order.
//! Once every group in the lease has reached a terminal disposition, their
//! locks are released in one call so the next worker can pick the group up.

use crate::error::Result;
use crate::message::Envelope;

use super::{apply_finalize, invoke_per_message, translate, Finalize, StrategyContext};

pub async fn dispatch(ctx: &StrategyContext, lease: Vec<Envelope>) -> Result<()> {
    let mut all_groups: Vec<String> = Vec::new();
    for envelope in &lease {
        if let Some(group_id) = &envelope.group_id {
            if !all_groups.contains(group_id) {
                all_groups.push(group_id.clone());
            }
        }
    }

    let mut aborted_groups: Vec<String> = Vec::new();
    for envelope in lease {
        if let Some(group_id) = &envelope.group_id {
            if aborted_groups.contains(group_id) {
                ctx.storage.release(&ctx.inbox_name, envelope.id).await?;
                continue;
            }
        }

        let outcome = invoke_per_message(ctx, &envelope).await;
        let finalize = translate(outcome, envelope.attempts_count, ctx.max_attempts);
        let aborts_group = matches!(finalize, Finalize::Release | Finalize::Fail);
        apply_finalize(ctx, envelope.id, finalize).await?;

        if aborts_group {
            if let Some(group_id) = envelope.group_id {
                if !aborted_groups.contains(&group_id) {
                    aborted_groups.push(group_id);
                }
            }
        }
    }

    if !all_groups.is_empty() {
        ctx.storage.release_group_locks(&ctx.inbox_name, &all_groups).await?;
    }
    Ok(())
}
