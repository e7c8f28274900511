//! Metric name definitions.
//!
//! Centralized so dashboards have one place to discover what the broker
//! emits. Recording goes through the `metrics` facade; wiring an exporter
//! is the host's concern.

pub mod connection {
    /// Total WebSocket connections accepted.
    pub const OPENED_TOTAL: &str = "reverb_connections_opened_total";
    /// Currently open WebSocket connections.
    pub const ACTIVE: &str = "reverb_connections_active";
    /// Connections closed by the stale-prune job.
    pub const PRUNED_TOTAL: &str = "reverb_connections_pruned_total";
}

pub mod message {
    /// Client frames received.
    pub const RECEIVED_TOTAL: &str = "reverb_messages_received_total";
    /// Frames queued for delivery to clients.
    pub const SENT_TOTAL: &str = "reverb_messages_sent_total";
}

pub mod channel {
    /// Channels created on first subscribe.
    pub const CREATED_TOTAL: &str = "reverb_channels_created_total";
    /// Channels reclaimed after their last subscriber left.
    pub const REMOVED_TOTAL: &str = "reverb_channels_removed_total";
}

pub mod bus {
    /// Envelopes published to the inter-broker bus.
    pub const PUBLISHED_TOTAL: &str = "reverb_bus_published_total";
}
