use {serde_json::Value, tokio::sync::mpsc, tracing::warn};

use reverb_protocol::{Frame, SocketId};

/// A connection's membership in one channel: the outbound handle plus any
/// channel-scoped metadata (`user_id` / `user_info` for presence).
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    socket_id: SocketId,
    sender: mpsc::UnboundedSender<String>,
    data: serde_json::Map<String, Value>,
}

impl ChannelConnection {
    pub fn new(socket_id: SocketId, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            socket_id,
            sender,
            data: serde_json::Map::new(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn socket_id(&self) -> &SocketId {
        &self.socket_id
    }

    pub fn data(&self) -> &serde_json::Map<String, Value> {
        &self.data
    }

    pub fn user_id(&self) -> Option<&str> {
        self.data.get("user_id").and_then(|v| v.as_str())
    }

    pub fn user_info(&self) -> Value {
        self.data
            .get("user_info")
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()))
    }

    /// Queue a pre-serialized frame. Returns false when the connection's
    /// writer has gone away; callers treat that as an unsubscribe signal.
    pub fn send_raw(&self, frame: &str) -> bool {
        self.sender.send(frame.to_string()).is_ok()
    }

    pub fn send(&self, frame: &Frame) -> bool {
        match frame.to_json() {
            Ok(json) => self.send_raw(&json),
            Err(e) => {
                warn!(socket_id = %self.socket_id, error = %e, "failed to serialize frame");
                false
            },
        }
    }
}
