use serde::{Deserialize, Serialize};

use reverb_protocol::SocketId;

/// Kinds of traffic exchanged between fleet members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// A published event to mirror into local channels.
    #[serde(rename = "message")]
    Message,
    /// A request for occupancy data, answered by every peer.
    #[serde(rename = "metrics")]
    Metrics,
    /// One peer's answer to a metrics request.
    #[serde(rename = "metrics-retrieved")]
    MetricsRetrieved,
    /// Force-disconnect every connection of a user.
    #[serde(rename = "terminate")]
    Terminate,
}

/// One unit of bus traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// The serialized application the payload is scoped to. Peers resolve
    /// it locally by id; carrying the record keeps the bus self-contained.
    pub application: serde_json::Value,
    /// Correlation key for metrics request/response pairing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Sender to exclude when mirroring a message (resolves to nothing on
    /// peers that don't host that connection, which is correct).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<SocketId>,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn message(
        application: serde_json::Value,
        socket_id: Option<SocketId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            application,
            key: None,
            socket_id,
            payload,
        }
    }

    pub fn metrics(
        application: serde_json::Value,
        key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Metrics,
            application,
            key: Some(key.into()),
            socket_id: None,
            payload,
        }
    }

    pub fn metrics_retrieved(
        application: serde_json::Value,
        key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: EnvelopeKind::MetricsRetrieved,
            application,
            key: Some(key.into()),
            socket_id: None,
            payload,
        }
    }

    pub fn terminate(application: serde_json::Value, payload: serde_json::Value) -> Self {
        Self {
            kind: EnvelopeKind::Terminate,
            application,
            key: None,
            socket_id: None,
            payload,
        }
    }
}
