use std::sync::Arc;

use {dashmap::DashMap, tokio::sync::mpsc};

use {reverb_config::ReverbConfig, reverb_pubsub::PubSubProvider};

use crate::{
    apps::AppRegistry,
    channel_manager::ChannelManager,
    connection::ConnectionRegistry,
};

/// Shared broker runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    /// Immutable tenant table.
    pub apps: AppRegistry,
    /// Live channels, per tenant.
    pub channels: ChannelManager,
    /// Live connections, per tenant.
    pub connections: ConnectionRegistry,
    /// Optional inter-broker bus.
    pub bus: Option<Arc<dyn PubSubProvider>>,
    /// Outstanding fleet metrics requests, keyed by correlation key.
    pub pending_metrics: DashMap<String, mpsc::UnboundedSender<serde_json::Value>>,
    /// Maximum accepted control API body, in bytes.
    pub max_request_size: usize,
}

impl GatewayState {
    pub fn from_config(
        config: &ReverbConfig,
        bus: Option<Arc<dyn PubSubProvider>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            apps: AppRegistry::from_config(&config.apps),
            channels: ChannelManager::new(),
            connections: ConnectionRegistry::new(),
            bus,
            pending_metrics: DashMap::new(),
            max_request_size: config.server.max_request_size,
        })
    }

    /// Force-disconnect every connection representing `user_id` on any
    /// presence channel of the tenant. Returns how many were closed.
    pub async fn terminate_user_connections(&self, app_id: &str, user_id: &str) -> usize {
        let sockets = self.channels.sockets_for_user(app_id, user_id).await;
        let mut closed = 0;
        for socket_id in sockets {
            self.channels.unsubscribe_from_all(app_id, &socket_id).await;
            if let Some(connection) = self.connections.get(app_id, &socket_id) {
                connection.disconnect();
                closed += 1;
            }
        }
        closed
    }
}
