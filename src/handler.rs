//! Handler contracts (§6.1) and the explicit registration map (§9 "Dynamic
//! registration": replace reflection-based dispatch with a `register`d
//! lookup by `message_type`). Grounded on `actors/registry.rs`'s
//! `ActorRegistry` (`DashMap`-backed, `Clone`-via-`Arc`) generalized from
//! `get_or_spawn` to a plain `get(message_type)` lookup.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::message::{BatchItemResult, Envelope, HandlerOutcome};

/// Handles one message at a time (§4.2 Default/FIFO strategies). `shutdown`
/// is cancelled once the worker starts draining for shutdown; long-running
/// handlers should poll it and wind down within `shutdown_timeout` rather
/// than rely on being aborted.
#[async_trait]
pub trait PerMessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope, shutdown: &CancellationToken) -> HandlerOutcome;
}

/// Handles an entire lease at once, returning one outcome per envelope
/// (§4.2 Batched strategy). Envelopes with no entry in the result default to
/// `Retry`.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, envelopes: &[Envelope], shutdown: &CancellationToken) -> Vec<BatchItemResult>;
}

/// Handles one group's in-order slice of envelopes at once (§4.2
/// FIFO-Batched strategy).
#[async_trait]
pub trait FifoBatchHandler: Send + Sync {
    async fn handle_group(
        &self,
        group_id: &str,
        envelopes: &[Envelope],
        shutdown: &CancellationToken,
    ) -> Vec<BatchItemResult>;
}

/// What a registered handler looks like, independent of processing mode.
pub enum Handler {
    PerMessage(Arc<dyn PerMessageHandler>),
    Batch(Arc<dyn BatchHandler>),
    FifoBatch(Arc<dyn FifoBatchHandler>),
}

impl Clone for Handler {
    fn clone(&self) -> Self {
        match self {
            Handler::PerMessage(h) => Handler::PerMessage(h.clone()),
            Handler::Batch(h) => Handler::Batch(h.clone()),
            Handler::FifoBatch(h) => Handler::FifoBatch(h.clone()),
        }
    }
}

/// Maps `message_type` to its registered handler. One registry per inbox.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, message_type: impl Into<String>, handler: Handler) {
        self.handlers.insert(message_type.into(), handler);
    }

    pub fn get(&self, message_type: &str) -> Option<Handler> {
        self.handlers.get(message_type).map(|h| h.clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl PerMessageHandler for Echo {
        async fn handle(&self, _envelope: &Envelope, _shutdown: &CancellationToken) -> HandlerOutcome {
            HandlerOutcome::Success
        }
    }

    #[test]
    fn register_then_get() {
        let registry = HandlerRegistry::new();
        registry.register("demo", Handler::PerMessage(Arc::new(Echo)));
        assert!(registry.get("demo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }
}
