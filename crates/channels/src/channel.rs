use std::collections::{BTreeMap, HashMap, HashSet};

use {
    serde_json::{Value, json},
    tokio::sync::mpsc,
};

use reverb_protocol::{Frame, SocketId};

use crate::{ChannelConnection, ChannelKind, Error, Result};

/// Where a broadcast payload came from.
///
/// Only external payloads (event dispatcher, HTTP publish, client events)
/// update a cache channel's retained payload; traffic the channel subsystem
/// generates itself never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    External,
    Internal,
}

/// A named multicast group and its live subscriber set.
#[derive(Debug)]
pub struct Channel {
    name: String,
    kind: ChannelKind,
    subscribers: HashMap<SocketId, ChannelConnection>,
    /// Presence index: user_id → sockets currently representing that user.
    /// Ordered so presence payloads list ids deterministically.
    users: BTreeMap<String, HashSet<SocketId>>,
    last_payload: Option<Value>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let kind = ChannelKind::of(&name);
        Self {
            name,
            kind,
            subscribers: HashMap::new(),
            users: BTreeMap::new(),
            last_payload: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn has_subscriber(&self, socket_id: &SocketId) -> bool {
        self.subscribers.contains_key(socket_id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &ChannelConnection> {
        self.subscribers.values()
    }

    /// Distinct users currently present (presence channels only).
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }

    pub fn last_payload(&self) -> Option<&Value> {
        self.last_payload.as_ref()
    }

    /// Add a connection to the channel and emit the subscription replies.
    ///
    /// Authorization is the caller's pre-step; this is the core join: the
    /// subscriber receives `subscription_succeeded`, presence peers learn
    /// about a first-of-its-user join, and cache channels replay their
    /// retained payload (or announce a miss) to the newcomer.
    pub fn subscribe(
        &mut self,
        socket_id: &SocketId,
        sender: &mpsc::UnboundedSender<String>,
        channel_data: Option<&str>,
    ) -> Result<()> {
        if !self.subscribers.contains_key(socket_id) {
            let mut connection = ChannelConnection::new(socket_id.clone(), sender.clone());

            if self.kind.is_presence() {
                let raw = channel_data.ok_or_else(|| Error::missing_channel_data(self.name.clone()))?;
                let member = parse_member(raw)?;
                connection = connection.with_data(member);
                let user_id = connection
                    .user_id()
                    .map(str::to_string)
                    .ok_or_else(|| Error::invalid_channel_data("user_id is not a string"))?;

                let sockets = self.users.entry(user_id.clone()).or_default();
                let first_for_user = sockets.is_empty();
                sockets.insert(socket_id.clone());

                if first_for_user {
                    let frame = Frame::member_added(&self.name, &user_id, &connection.user_info());
                    for peer in self.subscribers.values() {
                        peer.send(&frame);
                    }
                }
            }

            self.subscribers.insert(socket_id.clone(), connection);
        }

        let acknowledgement = if self.kind.is_presence() {
            Frame::subscription_succeeded(&self.name, &self.presence_payload())
        } else {
            Frame::subscription_succeeded(&self.name, &json!({}))
        };

        if let Some(connection) = self.subscribers.get(socket_id) {
            connection.send(&acknowledgement);

            if self.kind.caches_last_event() {
                match &self.last_payload {
                    Some(payload) => {
                        connection.send_raw(&payload.to_string());
                    },
                    None => {
                        connection.send(&Frame::cache_miss(&self.name));
                    },
                }
            }
        }

        Ok(())
    }

    /// Remove a connection. When the last socket of a presence user leaves,
    /// the remaining subscribers receive `member_removed`.
    pub fn unsubscribe(&mut self, socket_id: &SocketId) -> Option<ChannelConnection> {
        let removed = self.subscribers.remove(socket_id)?;

        if self.kind.is_presence()
            && let Some(user_id) = removed.user_id()
            && let Some(sockets) = self.users.get_mut(user_id)
        {
            sockets.remove(socket_id);
            if sockets.is_empty() {
                let frame = Frame::member_removed(&self.name, user_id);
                self.users.remove(user_id);
                for peer in self.subscribers.values() {
                    peer.send(&frame);
                }
            }
        }

        Some(removed)
    }

    /// Deliver `payload` verbatim to every subscriber except `except`.
    /// Returns the number of deliveries.
    pub fn broadcast(
        &mut self,
        payload: &Value,
        except: Option<&SocketId>,
        origin: Origin,
    ) -> usize {
        let wire = payload.to_string();
        let mut delivered = 0;
        for (socket_id, connection) in &self.subscribers {
            if except.is_some_and(|excluded| excluded == socket_id) {
                continue;
            }
            if connection.send_raw(&wire) {
                delivered += 1;
            }
        }

        if origin == Origin::External && self.kind.caches_last_event() {
            self.last_payload = Some(payload.clone());
        }

        delivered
    }

    /// The `subscription_succeeded` body for presence channels:
    /// `{"presence":{"ids":[…],"hash":{user_id→user_info},"count":n}}`.
    pub fn presence_payload(&self) -> Value {
        let mut ids = Vec::with_capacity(self.users.len());
        let mut hash = serde_json::Map::new();
        for (user_id, sockets) in &self.users {
            ids.push(Value::String(user_id.clone()));
            let info = sockets
                .iter()
                .find_map(|socket_id| self.subscribers.get(socket_id))
                .map(|connection| connection.user_info())
                .unwrap_or_else(|| json!({}));
            hash.insert(user_id.clone(), info);
        }
        json!({ "presence": { "ids": ids, "hash": hash, "count": self.users.len() } })
    }

    /// user_id → user_info for every present user.
    pub fn members(&self) -> serde_json::Map<String, Value> {
        let mut members = serde_json::Map::new();
        for (user_id, sockets) in &self.users {
            let info = sockets
                .iter()
                .find_map(|socket_id| self.subscribers.get(socket_id))
                .map(|connection| connection.user_info())
                .unwrap_or_else(|| json!({}));
            members.insert(user_id.clone(), info);
        }
        members
    }
}

/// Parse presence `channel_data`: an object with at least `user_id`.
/// Numeric user ids are normalized to their decimal string form.
fn parse_member(raw: &str) -> Result<serde_json::Map<String, Value>> {
    use crate::error::Context as _;

    let value: Value = serde_json::from_str(raw).context("channel_data is not valid JSON")?;
    let Value::Object(mut map) = value else {
        return Err(Error::invalid_channel_data("expected an object"));
    };
    match map.get("user_id") {
        Some(Value::String(_)) => {},
        Some(Value::Number(n)) => {
            let normalized = n.to_string();
            map.insert("user_id".into(), Value::String(normalized));
        },
        _ => return Err(Error::invalid_channel_data("missing user_id")),
    }
    Ok(map)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn socket(n: u64) -> SocketId {
        SocketId::parse(&format!("{n}.{n}")).unwrap()
    }

    fn pipe() -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        mpsc::unbounded_channel()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            frames.push(serde_json::from_str(&raw).unwrap());
        }
        frames
    }

    #[test]
    fn public_subscribe_acknowledges() {
        let mut channel = Channel::new("room-1");
        let (tx, mut rx) = pipe();
        channel.subscribe(&socket(1), &tx, None).unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "pusher_internal:subscription_succeeded");
        assert_eq!(frames[0]["channel"], "room-1");
        assert_eq!(frames[0]["data"], "{}");
        assert_eq!(channel.subscription_count(), 1);
    }

    #[test]
    fn duplicate_subscribe_is_idempotent() {
        let mut channel = Channel::new("room-1");
        let (tx, mut rx) = pipe();
        channel.subscribe(&socket(1), &tx, None).unwrap();
        channel.subscribe(&socket(1), &tx, None).unwrap();
        assert_eq!(channel.subscription_count(), 1);
        // both subscribes are acknowledged
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn presence_requires_channel_data() {
        let mut channel = Channel::new("presence-room");
        let (tx, _rx) = pipe();
        let err = channel.subscribe(&socket(1), &tx, None).unwrap_err();
        assert!(matches!(err, Error::MissingChannelData { .. }));

        let err = channel
            .subscribe(&socket(1), &tx, Some("not-json"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChannelData { .. }));

        let err = channel
            .subscribe(&socket(1), &tx, Some(r#"{"name":"no-id"}"#))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChannelData { .. }));
    }

    #[test]
    fn presence_member_gossip() {
        let mut channel = Channel::new("presence-room");
        let (tx_a, mut rx_a) = pipe();
        let (tx_b, mut rx_b) = pipe();

        channel
            .subscribe(&socket(1), &tx_a, Some(r#"{"user_id":"u1"}"#))
            .unwrap();
        let frames = drain(&mut rx_a);
        let data: Value =
            serde_json::from_str(frames[0]["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["presence"]["count"], 1);
        assert_eq!(data["presence"]["ids"], json!(["u1"]));

        channel
            .subscribe(
                &socket(2),
                &tx_b,
                Some(r#"{"user_id":"u2","user_info":{"name":"Bea"}}"#),
            )
            .unwrap();

        // A hears about u2 joining.
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "pusher_internal:member_added");
        let added: Value =
            serde_json::from_str(frames[0]["data"].as_str().unwrap()).unwrap();
        assert_eq!(added["user_id"], "u2");

        // B's acknowledgement counts both users.
        let frames = drain(&mut rx_b);
        let data: Value =
            serde_json::from_str(frames[0]["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["presence"]["count"], 2);
        assert_eq!(data["presence"]["hash"]["u2"]["name"], "Bea");
    }

    #[test]
    fn presence_dedupes_by_user_id() {
        let mut channel = Channel::new("presence-room");
        let (tx_a, mut rx_a) = pipe();
        let (tx_b1, _rx_b1) = pipe();
        let (tx_b2, _rx_b2) = pipe();

        channel
            .subscribe(&socket(1), &tx_a, Some(r#"{"user_id":"u1"}"#))
            .unwrap();
        drain(&mut rx_a);

        channel
            .subscribe(&socket(2), &tx_b1, Some(r#"{"user_id":"u2"}"#))
            .unwrap();
        assert_eq!(drain(&mut rx_a).len(), 1); // member_added fired once

        channel
            .subscribe(&socket(3), &tx_b2, Some(r#"{"user_id":"u2"}"#))
            .unwrap();
        assert!(drain(&mut rx_a).is_empty()); // second socket of u2 is silent
        assert_eq!(channel.user_count(), 2);
        assert_eq!(channel.subscription_count(), 3);

        // First socket of u2 leaving says nothing…
        channel.unsubscribe(&socket(2));
        assert!(drain(&mut rx_a).is_empty());

        // …the last one announces the departure.
        channel.unsubscribe(&socket(3));
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "pusher_internal:member_removed");
        assert_eq!(channel.user_count(), 1);
    }

    #[test]
    fn numeric_user_ids_are_normalized() {
        let mut channel = Channel::new("presence-room");
        let (tx, mut rx) = pipe();
        channel
            .subscribe(&socket(1), &tx, Some(r#"{"user_id":42}"#))
            .unwrap();
        let frames = drain(&mut rx);
        let data: Value =
            serde_json::from_str(frames[0]["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["presence"]["ids"], json!(["42"]));
    }

    #[test]
    fn broadcast_excludes_sender() {
        let mut channel = Channel::new("room-1");
        let (tx_a, mut rx_a) = pipe();
        let (tx_b, mut rx_b) = pipe();
        channel.subscribe(&socket(1), &tx_a, None).unwrap();
        channel.subscribe(&socket(2), &tx_b, None).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let payload = json!({"event":"client-typing","channel":"room-1","data":"{}"});
        let delivered = channel.broadcast(&payload, Some(&socket(1)), Origin::External);
        assert_eq!(delivered, 1);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn cache_miss_then_replay() {
        let mut channel = Channel::new("cache-x");
        let (tx_a, mut rx_a) = pipe();
        channel.subscribe(&socket(1), &tx_a, None).unwrap();

        let frames = drain(&mut rx_a);
        assert_eq!(frames[0]["event"], "pusher_internal:subscription_succeeded");
        assert_eq!(frames[1]["event"], "pusher:cache_miss");

        let payload = json!({"event":"e","channel":"cache-x","data":"{\"v\":1}"});
        channel.broadcast(&payload, None, Origin::External);
        drain(&mut rx_a);

        let (tx_b, mut rx_b) = pipe();
        channel.subscribe(&socket(2), &tx_b, None).unwrap();
        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["event"], "pusher_internal:subscription_succeeded");
        assert_eq!(frames[1], payload);
    }

    #[test]
    fn internal_broadcasts_do_not_touch_cache() {
        let mut channel = Channel::new("cache-x");
        let (tx, mut rx) = pipe();
        channel.subscribe(&socket(1), &tx, None).unwrap();
        drain(&mut rx);

        let internal = json!({"event":"pusher_internal:subscription_succeeded","channel":"cache-x","data":"{}"});
        channel.broadcast(&internal, None, Origin::Internal);
        assert!(channel.last_payload().is_none());
    }
}
