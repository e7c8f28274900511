//! Per-tenant registry of live channels.
//!
//! Channels are created on first subscribe and reclaimed as soon as their
//! subscriber set empties. Exclusion is per tenant: every mutation of a
//! tenant's channels happens under that tenant's lock, and nothing is
//! awaited while it is held.

use std::{collections::HashMap, sync::Arc};

use {
    dashmap::DashMap,
    metrics::counter,
    serde::{Deserialize, Serialize},
    tokio::sync::Mutex,
    tracing::debug,
};

use {
    reverb_channels::{Channel, ChannelKind, Error as ChannelError, Origin, auth},
    reverb_protocol::SocketId,
};

use crate::{apps::Application, connection::Connection, telemetry};

/// Occupancy data for one channel, as exchanged between fleet members.
///
/// `user_ids` (presence channels only) carries the ids rather than a count
/// so fleet-wide merges can count distinct users instead of double-counting
/// a user connected to two brokers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub subscription_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<serde_json::Value>,
}

impl ChannelSummary {
    fn of(channel: &Channel) -> Self {
        Self {
            subscription_count: channel.subscription_count(),
            user_ids: channel
                .kind()
                .is_presence()
                .then(|| channel.user_ids()),
            cache: channel.last_payload().cloned(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ChannelManager {
    tenants: DashMap<String, Arc<Mutex<HashMap<String, Channel>>>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn tenant(&self, app_id: &str) -> Arc<Mutex<HashMap<String, Channel>>> {
        self.tenants.entry(app_id.to_string()).or_default().clone()
    }

    /// Run the full subscribe contract: authorization pre-step, channel
    /// creation by name prefix, then the channel's own join semantics.
    pub async fn subscribe(
        &self,
        app: &Application,
        name: &str,
        connection: &Connection,
        auth_token: Option<&str>,
        channel_data: Option<&str>,
    ) -> Result<(), ChannelError> {
        let kind = ChannelKind::of(name);
        if kind.requires_auth() {
            let authorized = auth_token.is_some_and(|token| {
                auth::verify_subscription(
                    &app.secret,
                    connection.id(),
                    name,
                    channel_data,
                    token,
                )
            });
            if !authorized {
                return Err(ChannelError::unauthorized(name));
            }
        }

        let tenant = self.tenant(&app.app_id);
        let mut channels = tenant.lock().await;
        let created = !channels.contains_key(name);
        let channel = channels
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(name));
        let result = channel.subscribe(connection.id(), connection.channel_sender(), channel_data);

        match &result {
            Ok(()) if created => {
                counter!(telemetry::channel::CREATED_TOTAL).increment(1);
                debug!(app = %app.app_id, channel = name, "channel created");
            },
            Err(_) if created => {
                // A failed first subscribe must not leave an empty channel.
                channels.remove(name);
            },
            _ => {},
        }

        result
    }

    pub async fn unsubscribe(&self, app_id: &str, name: &str, socket_id: &SocketId) {
        let tenant = self.tenant(app_id);
        let mut channels = tenant.lock().await;
        if let Some(channel) = channels.get_mut(name) {
            channel.unsubscribe(socket_id);
            if channel.is_empty() {
                channels.remove(name);
                counter!(telemetry::channel::REMOVED_TOTAL).increment(1);
                debug!(app = %app_id, channel = name, "channel removed");
            }
        }
    }

    /// Remove a connection from every channel of its tenant, reclaiming
    /// channels it was the last subscriber of.
    pub async fn unsubscribe_from_all(&self, app_id: &str, socket_id: &SocketId) {
        let tenant = self.tenant(app_id);
        let mut channels = tenant.lock().await;
        let mut emptied = Vec::new();
        for (name, channel) in channels.iter_mut() {
            if channel.unsubscribe(socket_id).is_some() && channel.is_empty() {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            channels.remove(&name);
            counter!(telemetry::channel::REMOVED_TOTAL).increment(1);
            debug!(app = %app_id, channel = %name, "channel removed");
        }
    }

    /// Deliver `payload` to a channel's subscribers. Absent channels are
    /// skipped silently; returns the number of deliveries.
    pub async fn broadcast(
        &self,
        app_id: &str,
        name: &str,
        payload: &serde_json::Value,
        except: Option<&SocketId>,
        origin: Origin,
    ) -> usize {
        let tenant = self.tenant(app_id);
        let mut channels = tenant.lock().await;
        let delivered = match channels.get_mut(name) {
            Some(channel) => channel.broadcast(payload, except, origin),
            None => 0,
        };
        if delivered > 0 {
            counter!(telemetry::message::SENT_TOTAL).increment(delivered as u64);
        }
        delivered
    }

    pub async fn is_subscribed(&self, app_id: &str, name: &str, socket_id: &SocketId) -> bool {
        let tenant = self.tenant(app_id);
        let channels = tenant.lock().await;
        channels
            .get(name)
            .is_some_and(|channel| channel.has_subscriber(socket_id))
    }

    /// Occupied channels of a tenant, optionally filtered by name prefix.
    pub async fn summaries(
        &self,
        app_id: &str,
        prefix: Option<&str>,
    ) -> HashMap<String, ChannelSummary> {
        let tenant = self.tenant(app_id);
        let channels = tenant.lock().await;
        channels
            .iter()
            .filter(|(name, _)| prefix.is_none_or(|p| name.starts_with(p)))
            .map(|(name, channel)| (name.clone(), ChannelSummary::of(channel)))
            .collect()
    }

    pub async fn summary(&self, app_id: &str, name: &str) -> Option<ChannelSummary> {
        let tenant = self.tenant(app_id);
        let channels = tenant.lock().await;
        channels.get(name).map(ChannelSummary::of)
    }

    /// Distinct user ids present on a presence channel. `None` when the
    /// channel is not a presence channel.
    pub async fn presence_users(&self, app_id: &str, name: &str) -> Option<Vec<String>> {
        if !ChannelKind::of(name).is_presence() {
            return None;
        }
        let tenant = self.tenant(app_id);
        let channels = tenant.lock().await;
        Some(
            channels
                .get(name)
                .map(|channel| channel.user_ids())
                .unwrap_or_default(),
        )
    }

    /// Sockets representing `user_id` on any presence channel of a tenant.
    pub async fn sockets_for_user(&self, app_id: &str, user_id: &str) -> Vec<SocketId> {
        let tenant = self.tenant(app_id);
        let channels = tenant.lock().await;
        let mut sockets = Vec::new();
        for channel in channels.values() {
            if !channel.kind().is_presence() {
                continue;
            }
            for connection in channel.connections() {
                if connection.user_id() == Some(user_id)
                    && !sockets.contains(connection.socket_id())
                {
                    sockets.push(connection.socket_id().clone());
                }
            }
        }
        sockets
    }
}
