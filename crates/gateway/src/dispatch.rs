//! The event dispatcher: one published payload, N channels, optional
//! sender exclusion, optional bus mirroring.

use std::sync::Arc;

use {metrics::counter, tracing::warn};

use {
    reverb_channels::Origin,
    reverb_protocol::SocketId,
    reverb_pubsub::Envelope,
};

use crate::{apps::Application, state::GatewayState, telemetry};

/// Route `payload` to the channels it names.
///
/// The payload addresses its targets through either `channels` (a list) or
/// `channel` (a single name); each target receives a copy with `channel`
/// rewritten to itself and `channels` stripped. Unoccupied targets are
/// skipped silently. When `mirror` is set and a bus is configured, the
/// original payload is also published for peer brokers, which run this
/// same path with `mirror` off.
pub async fn dispatch(
    state: &Arc<GatewayState>,
    app: &Application,
    payload: &serde_json::Value,
    except: Option<&SocketId>,
    mirror: bool,
) {
    for target in targets(payload) {
        let mut copy = payload.clone();
        if let Some(object) = copy.as_object_mut() {
            object.insert("channel".into(), serde_json::Value::String(target.clone()));
            object.remove("channels");
        }
        state
            .channels
            .broadcast(&app.app_id, &target, &copy, except, Origin::External)
            .await;
    }

    if mirror && let Some(bus) = &state.bus {
        let application = match serde_json::to_value(app) {
            Ok(value) => value,
            Err(e) => {
                warn!(app = %app.app_id, error = %e, "failed to serialize application for bus");
                return;
            },
        };
        let envelope = Envelope::message(application, except.cloned(), payload.clone());
        match bus.publish(envelope).await {
            Ok(()) => counter!(telemetry::bus::PUBLISHED_TOTAL).increment(1),
            Err(e) => warn!(app = %app.app_id, error = %e, "bus publish failed"),
        }
    }
}

fn targets(payload: &serde_json::Value) -> Vec<String> {
    if let Some(list) = payload.get("channels").and_then(|v| v.as_array()) {
        list.iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect()
    } else if let Some(name) = payload.get("channel").and_then(|v| v.as_str()) {
        vec![name.to_string()]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn channels_list_wins_over_single() {
        let payload = serde_json::json!({
            "event": "e",
            "channel": "ignored",
            "channels": ["a", "b"],
        });
        assert_eq!(targets(&payload), vec!["a", "b"]);
    }

    #[test]
    fn single_channel_fallback() {
        let payload = serde_json::json!({"event": "e", "channel": "a"});
        assert_eq!(targets(&payload), vec!["a"]);
    }

    #[test]
    fn no_target_is_empty() {
        let payload = serde_json::json!({"event": "e"});
        assert!(targets(&payload).is_empty());
    }
}
