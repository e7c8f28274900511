use std::{collections::HashMap, sync::Arc};

use {async_trait::async_trait, futures::future::BoxFuture, tokio::sync::RwLock};

use crate::{Envelope, EnvelopeKind, Result};

/// Callback invoked with every received envelope of a registered kind.
pub type EnvelopeHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Abstract inter-broker bus.
#[async_trait]
pub trait PubSubProvider: Send + Sync {
    /// Open both legs of the bus. Idempotent. Queued messages are flushed
    /// in order and subscriptions are re-established.
    async fn connect(&self) -> Result<()>;

    /// Close the bus. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Publish an envelope to the fleet. While disconnected the envelope is
    /// queued locally and flushed on the next connect.
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Register a handler for envelopes of the given kind.
    async fn on(&self, kind: EnvelopeKind, handler: EnvelopeHandler);

    /// Number of fleet members currently subscribed, this node included.
    async fn subscriber_count(&self) -> usize;
}

/// Kind-keyed handler table shared by provider implementations.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<EnvelopeKind, Vec<EnvelopeHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, kind: EnvelopeKind, handler: EnvelopeHandler) {
        self.handlers
            .write()
            .await
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Invoke every handler registered for the envelope's kind.
    pub async fn dispatch(&self, envelope: Envelope) {
        let matching: Vec<EnvelopeHandler> = {
            let handlers = self.handlers.read().await;
            handlers.get(&envelope.kind).cloned().unwrap_or_default()
        };
        for handler in matching {
            handler(envelope.clone()).await;
        }
    }
}
