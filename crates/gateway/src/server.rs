//! Router assembly, serving and the shutdown drain.

use std::sync::Arc;

use {
    axum::{
        Router, middleware,
        routing::{get, post},
    },
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tower_http::{cors::CorsLayer, trace::TraceLayer},
    tracing::{info, warn},
};

use {
    reverb_config::ReverbConfig,
    reverb_protocol::{Frame, close_codes},
    reverb_pubsub::PubSubProvider,
};

use crate::{bus, http_api, jobs, state::GatewayState, ws};

/// Build the full HTTP/WS surface for one broker.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let authed = Router::new()
        .route("/events", post(http_api::publish_event))
        .route("/batch_events", post(http_api::publish_batch))
        .route("/channels", get(http_api::list_channels))
        .route("/channels/{channel}", get(http_api::channel_info))
        .route("/channels/{channel}/users", get(http_api::channel_users))
        .route("/connections", get(http_api::connections))
        .route(
            "/users/{user_id}/terminate_connections",
            post(http_api::terminate_user_connections),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            http_api::control_auth,
        ));

    let app_scoped = Router::new()
        .route("/up", get(http_api::up))
        .merge(authed);

    Router::new()
        .route("/up", get(http_api::up))
        .route("/app/{app_key}", get(ws::upgrade_handler))
        .nest("/apps/{app_id}", app_scoped)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run a broker until `shutdown` fires, then drain in order: jobs, client
/// goodbyes, bus, transports.
pub async fn serve(
    config: ReverbConfig,
    bus_provider: Option<Arc<dyn PubSubProvider>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = GatewayState::from_config(&config, bus_provider);

    if let Some(provider) = &state.bus {
        provider
            .connect()
            .await
            .map_err(|e| anyhow::anyhow!("failed to connect pub/sub provider: {e}"))?;
        bus::attach(&state).await;
        info!(channel = %config.server.scaling.channel, "bus attached");
    }

    let jobs = jobs::spawn(Arc::clone(&state), shutdown.clone());

    let mut app = build_router(Arc::clone(&state));
    if let Some(prefix) = config.server.path.as_deref()
        && !prefix.is_empty()
        && prefix != "/"
    {
        let prefix = if prefix.starts_with('/') {
            prefix.to_string()
        } else {
            format!("/{prefix}")
        };
        app = Router::new().nest(&prefix, app);
    }

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, apps = config.apps.apps.len(), "reverb: listening");

    let graceful = {
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            drain(&state, jobs).await;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await?;

    Ok(())
}

/// The orderly goodbye: stop the jobs, tell every client the broker is
/// going away, detach the bus, then close the transports.
async fn drain(state: &Arc<GatewayState>, jobs: Vec<JoinHandle<()>>) {
    for job in jobs {
        job.abort();
    }

    let connections = state.connections.all();
    for connection in &connections {
        connection.send(&Frame::error(
            close_codes::INVALID_MESSAGE,
            "Server is shutting down",
        ));
    }

    if let Some(provider) = &state.bus
        && let Err(e) = provider.disconnect().await
    {
        warn!(error = %e, "bus disconnect failed during shutdown");
    }

    for connection in &connections {
        connection.disconnect();
    }

    info!(connections = connections.len(), "reverb: shutdown complete");
}
