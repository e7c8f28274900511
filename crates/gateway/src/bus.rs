//! Demultiplexes inbound bus traffic onto the local broker.

use std::sync::Arc;

use tracing::warn;

use reverb_pubsub::{Envelope, EnvelopeKind};

use crate::{
    apps::Application,
    dispatch,
    metrics_handler::{self, MetricsRequest},
    state::GatewayState,
};

/// Register one handler per envelope kind on the configured bus.
pub async fn attach(state: &Arc<GatewayState>) {
    let Some(bus) = state.bus.clone() else {
        return;
    };

    {
        let state = Arc::clone(state);
        bus.on(
            EnvelopeKind::Message,
            Arc::new(move |envelope: Envelope| {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    let Some(app) = resolve_application(&state, &envelope.application) else {
                        warn!("bus: message for unresolvable application dropped");
                        return;
                    };
                    // The excluded sender lives on the publishing node, so
                    // locally the exclusion usually resolves to nothing.
                    dispatch::dispatch(
                        &state,
                        &app,
                        &envelope.payload,
                        envelope.socket_id.as_ref(),
                        false,
                    )
                    .await;
                })
            }),
        )
        .await;
    }

    {
        let state = Arc::clone(state);
        bus.on(
            EnvelopeKind::Metrics,
            Arc::new(move |envelope: Envelope| {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    let Some(key) = envelope.key else {
                        return;
                    };
                    let request: MetricsRequest = match serde_json::from_value(envelope.payload) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!(error = %e, "bus: unparsable metrics request dropped");
                            return;
                        },
                    };
                    metrics_handler::answer(&state, envelope.application, &key, &request).await;
                })
            }),
        )
        .await;
    }

    {
        let state = Arc::clone(state);
        bus.on(
            EnvelopeKind::MetricsRetrieved,
            Arc::new(move |envelope: Envelope| {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    if let Some(key) = envelope.key {
                        metrics_handler::accept_answer(&state, &key, envelope.payload);
                    }
                })
            }),
        )
        .await;
    }

    {
        let state = Arc::clone(state);
        bus.on(
            EnvelopeKind::Terminate,
            Arc::new(move |envelope: Envelope| {
                let state = Arc::clone(&state);
                Box::pin(async move {
                    let Some(app) = resolve_application(&state, &envelope.application) else {
                        return;
                    };
                    let Some(user_id) = envelope.payload.get("user_id").and_then(|v| v.as_str())
                    else {
                        return;
                    };
                    state.terminate_user_connections(&app.app_id, user_id).await;
                })
            }),
        )
        .await;
    }
}

/// Prefer the local registry record for an application carried on the bus;
/// fall back to the serialized copy so peers with config drift still work.
fn resolve_application(
    state: &Arc<GatewayState>,
    value: &serde_json::Value,
) -> Option<Arc<Application>> {
    if let Some(app_id) = value.get("app_id").and_then(|v| v.as_str())
        && let Some(app) = state.apps.find_by_id(app_id)
    {
        return Some(app);
    }
    serde_json::from_value(value.clone()).ok().map(Arc::new)
}
