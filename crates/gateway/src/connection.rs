//! One client connection: identity, activity accounting, send/close.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use {
    dashmap::DashMap, metrics::counter, tokio::sync::mpsc, tokio_util::sync::CancellationToken,
    tracing::warn,
};

use reverb_protocol::{Frame, SocketId};

use crate::{apps::Application, telemetry};

/// A live WebSocket client.
///
/// Frames are queued on an unbounded per-connection channel and drained by
/// the connection's writer task, so a slow consumer never blocks the
/// broker. Closing is signalled through a cancellation token and is
/// idempotent.
#[derive(Debug)]
pub struct Connection {
    socket_id: SocketId,
    app: Arc<Application>,
    origin: Option<String>,
    sender: mpsc::UnboundedSender<String>,
    closer: CancellationToken,
    last_seen: Mutex<Instant>,
    has_been_pinged: AtomicBool,
    max_message_size: usize,
}

impl Connection {
    pub fn new(
        app: Arc<Application>,
        origin: Option<String>,
        sender: mpsc::UnboundedSender<String>,
        closer: CancellationToken,
    ) -> Self {
        let max_message_size = app.max_message_size;
        Self {
            socket_id: SocketId::random(),
            app,
            origin,
            sender,
            closer,
            last_seen: Mutex::new(Instant::now()),
            has_been_pinged: AtomicBool::new(false),
            max_message_size,
        }
    }

    pub fn id(&self) -> &SocketId {
        &self.socket_id
    }

    pub fn app(&self) -> &Arc<Application> {
        &self.app
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// The handle channel subscriptions hold on this connection.
    pub fn channel_sender(&self) -> &mpsc::UnboundedSender<String> {
        &self.sender
    }

    /// Queue a frame for delivery. A connection whose writer has completed
    /// its close sequence swallows the send; callers proceed to unsubscribe.
    pub fn send(&self, frame: &Frame) -> bool {
        match frame.to_json() {
            Ok(json) => self.send_raw(&json),
            Err(e) => {
                warn!(socket_id = %self.socket_id, error = %e, "failed to serialize frame");
                false
            },
        }
    }

    pub fn send_raw(&self, frame: &str) -> bool {
        let delivered = self.sender.send(frame.to_string()).is_ok();
        if delivered {
            counter!(telemetry::message::SENT_TOTAL).increment(1);
        }
        delivered
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        if let Ok(mut last_seen) = self.last_seen.lock() {
            *last_seen = Instant::now();
        }
        self.has_been_pinged.store(false, Ordering::Relaxed);
    }

    fn seconds_since_last_seen(&self) -> u64 {
        self.last_seen
            .lock()
            .map(|last_seen| last_seen.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Heard from recently enough that no ping is due.
    pub fn is_active(&self) -> bool {
        self.seconds_since_last_seen() < self.app.ping_interval
    }

    /// Pinged and silent past the activity timeout: ready to prune.
    pub fn is_stale(&self) -> bool {
        self.has_been_pinged.load(Ordering::Relaxed)
            && self.seconds_since_last_seen() >= self.app.activity_timeout
    }

    pub fn has_been_pinged(&self) -> bool {
        self.has_been_pinged.load(Ordering::Relaxed)
    }

    /// Ask the client to prove liveness.
    pub fn ping(&self) {
        self.send(&Frame::ping());
        self.has_been_pinged.store(true, Ordering::Relaxed);
    }

    /// Close the transport. Idempotent.
    pub fn disconnect(&self) {
        self.closer.cancel();
    }

    pub fn is_disconnecting(&self) -> bool {
        self.closer.is_cancelled()
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Live connections, grouped per tenant.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    by_app: DashMap<String, Arc<DashMap<SocketId, Arc<Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tenant(&self, app_id: &str) -> Arc<DashMap<SocketId, Arc<Connection>>> {
        self.by_app
            .entry(app_id.to_string())
            .or_default()
            .clone()
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        self.tenant(&connection.app().app_id)
            .insert(connection.id().clone(), connection);
    }

    pub fn remove(&self, app_id: &str, socket_id: &SocketId) -> Option<Arc<Connection>> {
        self.by_app
            .get(app_id)
            .and_then(|tenant| tenant.remove(socket_id))
            .map(|(_, connection)| connection)
    }

    pub fn get(&self, app_id: &str, socket_id: &SocketId) -> Option<Arc<Connection>> {
        self.by_app
            .get(app_id)
            .and_then(|tenant| tenant.get(socket_id).map(|entry| Arc::clone(&entry)))
    }

    pub fn count(&self, app_id: &str) -> usize {
        self.by_app
            .get(app_id)
            .map(|tenant| tenant.len())
            .unwrap_or(0)
    }

    /// Snapshot of one tenant's connections.
    pub fn for_app(&self, app_id: &str) -> Vec<Arc<Connection>> {
        self.by_app
            .get(app_id)
            .map(|tenant| tenant.iter().map(|entry| Arc::clone(&entry)).collect())
            .unwrap_or_default()
    }

    /// Snapshot of every connection on the broker.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.by_app
            .iter()
            .flat_map(|tenant| {
                tenant
                    .value()
                    .iter()
                    .map(|entry| Arc::clone(&entry))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
