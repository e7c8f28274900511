//! Periodic maintenance: ping quiet connections, prune unresponsive ones.

use std::{sync::Arc, time::Duration};

use {
    metrics::counter,
    tokio::{task::JoinHandle, time},
    tokio_util::sync::CancellationToken,
    tracing::info,
};

use reverb_protocol::{Frame, close_codes};

use crate::{state::GatewayState, telemetry};

/// Cadence of both maintenance jobs.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the ping and prune loops. They stop when `shutdown` fires.
pub fn spawn(state: Arc<GatewayState>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    let ping_state = Arc::clone(&state);
    let ping_shutdown = shutdown.clone();
    let ping = tokio::spawn(async move {
        let mut ticker = time::interval(MAINTENANCE_INTERVAL);
        ticker.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                _ = ticker.tick() => ping_inactive(&ping_state),
                _ = ping_shutdown.cancelled() => break,
            }
        }
    });

    let prune = tokio::spawn(async move {
        let mut ticker = time::interval(MAINTENANCE_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => prune_stale(&state).await,
                _ = shutdown.cancelled() => break,
            }
        }
    });

    vec![ping, prune]
}

/// Ping every connection that has been quiet past its app's ping interval.
/// No reply is awaited here; the prune job handles the timeouts.
pub fn ping_inactive(state: &GatewayState) {
    for app in state.apps.iter() {
        for connection in state.connections.for_app(&app.app_id) {
            if !connection.is_active() {
                connection.ping();
            }
        }
    }
}

/// Disconnect every pinged connection that stayed silent past its app's
/// activity timeout: a final `pusher:error` 4201, removal from all
/// channels, then the transport close.
pub async fn prune_stale(state: &Arc<GatewayState>) {
    for app in state.apps.iter() {
        for connection in state.connections.for_app(&app.app_id) {
            if !connection.is_stale() {
                continue;
            }
            connection.send(&Frame::error(
                close_codes::PONG_TIMEOUT,
                "Pong reply not received in time",
            ));
            state
                .channels
                .unsubscribe_from_all(&app.app_id, connection.id())
                .await;
            connection.disconnect();
            state.connections.remove(&app.app_id, connection.id());
            counter!(telemetry::connection::PRUNED_TOTAL).increment(1);
            info!(
                socket_id = %connection.id(),
                app = %app.app_id,
                "pruned stale connection"
            );
        }
    }
}
