//! Pusher wire protocol definitions.
//!
//! All communication uses JSON text frames over WebSocket. Every frame is an
//! object with at least `event`; server-originated frames carry `data` as a
//! JSON-encoded string, while client frames may carry `data` as either a
//! string or an object. [`Payload`] models both shapes.

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

/// Pusher protocol revision accepted on the `/app/{key}` connection path.
pub const PROTOCOL_VERSION: u32 = 7;

/// Prefix marking subscriber-originated events.
pub const CLIENT_EVENT_PREFIX: &str = "client-";

// ── Close / error codes ──────────────────────────────────────────────────────

pub mod close_codes {
    /// Connection must be made over TLS.
    pub const APP_REQUIRES_TLS: u16 = 4000;
    /// No application matches the supplied key.
    pub const APP_NOT_FOUND: u16 = 4001;
    /// The application's connection quota is exhausted.
    pub const CONNECTION_LIMIT_EXCEEDED: u16 = 4004;
    /// Origin not allowed, or channel authorization failed.
    pub const UNAUTHORIZED: u16 = 4009;
    /// Event payload could not be interpreted.
    pub const INVALID_EVENT_DATA: u16 = 4100;
    /// Malformed or unexpected frame; also used on orderly shutdown.
    pub const INVALID_MESSAGE: u16 = 4200;
    /// Pong reply not received in time.
    pub const PONG_TIMEOUT: u16 = 4201;
    /// Frame exceeded the application's message size limit.
    pub const MESSAGE_TOO_LARGE: u16 = 4300;
    /// Subscription could not be completed.
    pub const SUBSCRIPTION_FAILED: u16 = 4301;
}

pub mod events {
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const ERROR: &str = "pusher:error";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
    pub const CACHE_MISS: &str = "pusher:cache_miss";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
    pub const SUBSCRIPTION_ERROR: &str = "pusher_internal:subscription_error";
    pub const MEMBER_ADDED: &str = "pusher_internal:member_added";
    pub const MEMBER_REMOVED: &str = "pusher_internal:member_removed";
}

/// Returns true when `event` is a subscriber-originated `client-*` event.
pub fn is_client_event(event: &str) -> bool {
    event.starts_with(CLIENT_EVENT_PREFIX)
}

// ── Socket ids ───────────────────────────────────────────────────────────────

/// Public identifier of a connection, of the form `<n>.<n>`.
///
/// Both components are random 64-bit integers, which makes ids effectively
/// unique across the whole broker, not just within one application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketId(String);

impl SocketId {
    /// Draw a fresh random id.
    pub fn random() -> Self {
        Self(format!("{}.{}", rand::random::<u64>(), rand::random::<u64>()))
    }

    /// Parse an id supplied by a client, rejecting anything that is not two
    /// decimal integers joined by a dot.
    pub fn parse(raw: &str) -> Option<Self> {
        let (head, tail) = raw.split_once('.')?;
        let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if numeric(head) && numeric(tail) {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────────

/// The `data` field of a frame: a JSON-encoded string or a bare object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    /// Interpret the payload as a JSON value, parsing string payloads.
    ///
    /// Returns `None` when a string payload is not valid JSON.
    pub fn to_value(&self) -> Option<serde_json::Value> {
        match self {
            Self::Text(raw) => serde_json::from_str(raw).ok(),
            Self::Json(value) => Some(value.clone()),
        }
    }

    /// Parse the payload into a concrete type, accepting both shapes.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        match self {
            Self::Text(raw) => serde_json::from_str(raw),
            Self::Json(value) => serde_json::from_value(value.clone()),
        }
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// A single protocol frame in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

impl Frame {
    /// Bare frame with no channel and no data.
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            channel: None,
            data: None,
        }
    }

    /// Server frame whose `data` is the JSON-encoded form of `data`.
    pub fn with_data(event: impl Into<String>, data: &serde_json::Value) -> Self {
        Self {
            event: event.into(),
            channel: None,
            data: Some(Payload::Text(data.to_string())),
        }
    }

    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn connection_established(socket_id: &SocketId, activity_timeout: u64) -> Self {
        Self::with_data(
            events::CONNECTION_ESTABLISHED,
            &serde_json::json!({
                "socket_id": socket_id,
                "activity_timeout": activity_timeout,
            }),
        )
    }

    pub fn ping() -> Self {
        Self::new(events::PING)
    }

    pub fn pong() -> Self {
        Self::with_data(events::PONG, &serde_json::json!({}))
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::with_data(
            events::ERROR,
            &serde_json::json!({ "code": code, "message": message.into() }),
        )
    }

    pub fn subscription_succeeded(channel: &str, data: &serde_json::Value) -> Self {
        Self::with_data(events::SUBSCRIPTION_SUCCEEDED, data).on_channel(channel)
    }

    pub fn member_added(channel: &str, user_id: &str, user_info: &serde_json::Value) -> Self {
        Self::with_data(
            events::MEMBER_ADDED,
            &serde_json::json!({ "user_id": user_id, "user_info": user_info }),
        )
        .on_channel(channel)
    }

    pub fn member_removed(channel: &str, user_id: &str) -> Self {
        Self::with_data(
            events::MEMBER_REMOVED,
            &serde_json::json!({ "user_id": user_id }),
        )
        .on_channel(channel)
    }

    pub fn cache_miss(channel: &str) -> Self {
        Self::new(events::CACHE_MISS).on_channel(channel)
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ── Client frame payloads ────────────────────────────────────────────────────

/// `data` of a `pusher:subscribe` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribePayload {
    pub channel: String,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub channel_data: Option<String>,
}

/// `data` of a `pusher:unsubscribe` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct UnsubscribePayload {
    pub channel: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn socket_id_shape() {
        let id = SocketId::random();
        let (head, tail) = id.as_str().split_once('.').expect("dot separator");
        assert!(head.bytes().all(|b| b.is_ascii_digit()));
        assert!(tail.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn socket_id_parse_rejects_garbage() {
        assert!(SocketId::parse("123.456").is_some());
        assert!(SocketId::parse("123").is_none());
        assert!(SocketId::parse("12a.456").is_none());
        assert!(SocketId::parse(".456").is_none());
        assert!(SocketId::parse("1.2.3").is_none());
    }

    #[test]
    fn connection_established_stringifies_data() {
        let id = SocketId::parse("77.88").expect("valid id");
        let frame = Frame::connection_established(&id, 30);
        let wire = frame.to_json().expect("serializable");
        let parsed: serde_json::Value = serde_json::from_str(&wire).expect("json");
        assert_eq!(parsed["event"], "pusher:connection_established");
        // data is a JSON-encoded string, not a nested object
        let data = parsed["data"].as_str().expect("string data");
        let inner: serde_json::Value = serde_json::from_str(data).expect("inner json");
        assert_eq!(inner["socket_id"], "77.88");
        assert_eq!(inner["activity_timeout"], 30);
    }

    #[test]
    fn error_frame_carries_code() {
        let frame = Frame::error(close_codes::PONG_TIMEOUT, "Pong reply not received in time");
        let wire = frame.to_json().expect("serializable");
        let parsed: serde_json::Value = serde_json::from_str(&wire).expect("json");
        let data = parsed["data"].as_str().expect("string data");
        let inner: serde_json::Value = serde_json::from_str(data).expect("inner json");
        assert_eq!(inner["code"], 4201);
    }

    #[test]
    fn payload_accepts_both_shapes() {
        let object: Frame =
            serde_json::from_str(r#"{"event":"pusher:subscribe","data":{"channel":"room-1"}}"#)
                .expect("object data");
        let string: Frame = serde_json::from_str(
            r#"{"event":"pusher:subscribe","data":"{\"channel\":\"room-1\"}"}"#,
        )
        .expect("string data");
        for frame in [object, string] {
            let sub: SubscribePayload = frame
                .data
                .expect("data present")
                .parse()
                .expect("subscribe payload");
            assert_eq!(sub.channel, "room-1");
        }
    }

    #[test]
    fn client_event_prefix() {
        assert!(is_client_event("client-typing"));
        assert!(!is_client_event("pusher:ping"));
        assert!(!is_client_event("clientish"));
    }
}
