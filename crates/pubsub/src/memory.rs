//! In-process bus implementation.
//!
//! All providers created from the same [`MemoryHub`] form one fleet; a
//! publish from one provider reaches every *other* connected provider.
//! Useful for single-node deployments (where the bus is effectively a
//! no-op) and for exercising fleet behavior in tests without a network.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    async_trait::async_trait,
    tokio::{
        sync::{Mutex, broadcast},
        task::JoinHandle,
    },
    tracing::debug,
};

use crate::{Envelope, EnvelopeHandler, EnvelopeKind, HandlerRegistry, PubSubProvider, Result};

const HUB_CAPACITY: usize = 1024;

#[derive(Clone)]
struct HubMessage {
    origin: u64,
    envelope: Envelope,
}

/// The shared medium connecting a fleet of [`MemoryProvider`]s.
pub struct MemoryHub {
    sender: broadcast::Sender<HubMessage>,
    next_node: AtomicU64,
}

impl MemoryHub {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Arc::new(Self {
            sender,
            next_node: AtomicU64::new(1),
        })
    }
}

struct ProviderState {
    connected: bool,
    queued: VecDeque<Envelope>,
    listener: Option<JoinHandle<()>>,
}

/// One fleet member attached to a [`MemoryHub`].
pub struct MemoryProvider {
    hub: Arc<MemoryHub>,
    node: u64,
    handlers: Arc<HandlerRegistry>,
    state: Mutex<ProviderState>,
}

impl MemoryProvider {
    pub fn new(hub: &Arc<MemoryHub>) -> Arc<Self> {
        Arc::new(Self {
            hub: Arc::clone(hub),
            node: hub.next_node.fetch_add(1, Ordering::Relaxed),
            handlers: Arc::new(HandlerRegistry::new()),
            state: Mutex::new(ProviderState {
                connected: false,
                queued: VecDeque::new(),
                listener: None,
            }),
        })
    }

    fn forward(&self, envelope: Envelope) {
        // No receivers just means no peers yet; that is not an error.
        let _ = self.hub.sender.send(HubMessage {
            origin: self.node,
            envelope,
        });
    }
}

#[async_trait]
impl PubSubProvider for MemoryProvider {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.connected {
            return Ok(());
        }

        let mut receiver = self.hub.sender.subscribe();
        let handlers = Arc::clone(&self.handlers);
        let node = self.node;
        state.listener = Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    // A node never re-delivers its own publishes.
                    Ok(message) if message.origin == node => {},
                    Ok(message) => handlers.dispatch(message.envelope).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(node, skipped, "bus subscriber lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        state.connected = true;

        // Flush anything published while offline, oldest first.
        while let Some(envelope) = state.queued.pop_front() {
            self.forward(envelope);
        }

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(listener) = state.listener.take() {
            listener.abort();
            // Wait for the task to drop its hub receiver so subscriber
            // counts are accurate as soon as we return.
            let _ = listener.await;
        }
        state.connected = false;
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.connected {
            self.forward(envelope);
        } else {
            state.queued.push_back(envelope);
        }
        Ok(())
    }

    async fn on(&self, kind: EnvelopeKind, handler: EnvelopeHandler) {
        self.handlers.add(kind, handler).await;
    }

    async fn subscriber_count(&self) -> usize {
        self.hub.sender.receiver_count()
    }
}
