//! Default strategy (§4.2): one handler invocation per message, finalized
//! independently and immediately.

use crate::error::Result;
use crate::message::Envelope;

use super::{apply_finalize, invoke_per_message, translate, StrategyContext};

pub async fn dispatch(ctx: &StrategyContext, lease: Vec<Envelope>) -> Result<()> {
    for envelope in lease {
        let outcome = invoke_per_message(ctx, &envelope).await;
        let finalize = translate(outcome, envelope.attempts_count, ctx.max_attempts);
        apply_finalize(ctx, envelope.id, finalize).await?;
    }
    Ok(())
}
