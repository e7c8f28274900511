//! Occupancy and connection queries, locally and across the fleet.
//!
//! Without a bus every query is answered from local state. With a bus the
//! broker publishes a `metrics` envelope carrying a random correlation key,
//! peers answer with `metrics-retrieved`, and the caller merges whatever
//! arrives within the deadline. A late fleet never turns into an HTTP
//! error, only into a partial result.

use std::{collections::HashSet, sync::Arc, time::Duration};

use {
    rand::{Rng, distr::Alphanumeric},
    serde::{Deserialize, Serialize},
    serde_json::{Value, json},
    tokio::{sync::mpsc, time},
    tracing::warn,
};

use reverb_pubsub::Envelope;

use crate::{apps::Application, channel_manager::ChannelSummary, state::GatewayState};

/// How long a fleet query waits for peer answers.
pub const FLEET_TIMEOUT: Duration = Duration::from_secs(10);

/// A metrics query as carried in bus envelopes:
/// `{"type": "...", "options": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "options", rename_all = "snake_case")]
pub enum MetricsRequest {
    Channels {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
    Channel {
        name: String,
    },
    ChannelUsers {
        name: String,
    },
    Connections,
}

/// Answer a query from this broker's state alone.
pub async fn local(state: &GatewayState, app_id: &str, request: &MetricsRequest) -> Value {
    match request {
        MetricsRequest::Channels { prefix } => {
            let summaries = state.channels.summaries(app_id, prefix.as_deref()).await;
            json!({ "channels": summaries })
        },
        MetricsRequest::Channel { name } => {
            let summary = state.channels.summary(app_id, name).await;
            json!({ "channel": summary })
        },
        MetricsRequest::ChannelUsers { name } => {
            let users = state
                .channels
                .presence_users(app_id, name)
                .await
                .unwrap_or_default();
            json!({ "users": users })
        },
        MetricsRequest::Connections => {
            json!({ "connections": state.connections.count(app_id) })
        },
    }
}

/// Answer a query fleet-wide, merging peer responses until
/// `subscriber_count - 1` have arrived or the deadline passes.
pub async fn gather(
    state: &Arc<GatewayState>,
    app: &Arc<Application>,
    request: MetricsRequest,
) -> Value {
    let mut merged = local(state, &app.app_id, &request).await;
    let Some(bus) = &state.bus else {
        return merged;
    };
    let expected = bus.subscriber_count().await.saturating_sub(1);
    if expected == 0 {
        return merged;
    }

    let key = correlation_key();
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.pending_metrics.insert(key.clone(), tx);

    let published = match (
        serde_json::to_value(&request),
        serde_json::to_value(app.as_ref()),
    ) {
        (Ok(payload), Ok(application)) => bus
            .publish(Envelope::metrics(application, &key, payload))
            .await
            .is_ok(),
        _ => false,
    };

    if published {
        let deadline = time::Instant::now() + FLEET_TIMEOUT;
        let mut received = 0;
        while received < expected {
            match time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(part)) => {
                    merge(&mut merged, &part, &request);
                    received += 1;
                },
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        key = %key,
                        received,
                        expected,
                        "metrics fan-out timed out, returning partial merge"
                    );
                    break;
                },
            }
        }
    }

    state.pending_metrics.remove(&key);
    merged
}

/// Peer side of a fleet query: compute the local answer and publish it back
/// under the request's correlation key.
pub async fn answer(
    state: &Arc<GatewayState>,
    application: Value,
    key: &str,
    request: &MetricsRequest,
) {
    let app_id = application
        .get("app_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let local = local(state, &app_id, request).await;
    if let Some(bus) = &state.bus
        && let Err(e) = bus
            .publish(Envelope::metrics_retrieved(application, key, local))
            .await
    {
        warn!(key, error = %e, "failed to publish metrics answer");
    }
}

/// Feed a peer's answer into the outstanding request it belongs to.
pub fn accept_answer(state: &GatewayState, key: &str, payload: Value) {
    if let Some(sender) = state.pending_metrics.get(key) {
        let _ = sender.send(payload);
    }
}

fn correlation_key() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

// ── Merging ──────────────────────────────────────────────────────────────────

/// Fold one peer's answer into the running merge.
pub fn merge(merged: &mut Value, part: &Value, request: &MetricsRequest) {
    match request {
        MetricsRequest::Channels { .. } => {
            let Some(incoming) = part.get("channels").and_then(|v| v.as_object()) else {
                return;
            };
            if let Some(existing) = merged
                .get_mut("channels")
                .and_then(|v| v.as_object_mut())
            {
                for (name, summary) in incoming {
                    let combined = match existing.get(name) {
                        Some(current) => combine_summaries(current, summary),
                        None => summary.clone(),
                    };
                    existing.insert(name.clone(), combined);
                }
            }
        },
        MetricsRequest::Channel { .. } => {
            let incoming = part.get("channel").cloned().unwrap_or(Value::Null);
            let current = merged.get("channel").cloned().unwrap_or(Value::Null);
            merged["channel"] = combine_summaries(&current, &incoming);
        },
        MetricsRequest::ChannelUsers { .. } => {
            let Some(incoming) = part.get("users").and_then(|v| v.as_array()) else {
                return;
            };
            if let Some(users) = merged.get_mut("users").and_then(|v| v.as_array_mut()) {
                let seen: HashSet<String> = users
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect();
                for user in incoming {
                    if user.as_str().is_some_and(|u| !seen.contains(u)) {
                        users.push(user.clone());
                    }
                }
            }
        },
        MetricsRequest::Connections => {
            let incoming = part.get("connections").and_then(|v| v.as_u64()).unwrap_or(0);
            let current = merged
                .get("connections")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            merged["connections"] = json!(current + incoming);
        },
    }
}

/// Combine two channel summaries: counts add, user ids union, the cache
/// slot takes whichever side has one.
fn combine_summaries(a: &Value, b: &Value) -> Value {
    let parse = |v: &Value| serde_json::from_value::<Option<ChannelSummary>>(v.clone()).ok().flatten();
    match (parse(a), parse(b)) {
        (Some(a), Some(b)) => {
            let user_ids = match (a.user_ids, b.user_ids) {
                (Some(mut left), Some(right)) => {
                    for id in right {
                        if !left.contains(&id) {
                            left.push(id);
                        }
                    }
                    Some(left)
                },
                (left, right) => left.or(right),
            };
            serde_json::to_value(ChannelSummary {
                subscription_count: a.subscription_count + b.subscription_count,
                user_ids,
                cache: a.cache.or(b.cache),
            })
            .unwrap_or(Value::Null)
        },
        (Some(one), None) | (None, Some(one)) => {
            serde_json::to_value(one).unwrap_or(Value::Null)
        },
        (None, None) => Value::Null,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let request = MetricsRequest::Channels {
            prefix: Some("presence-".into()),
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["type"], "channels");
        assert_eq!(wire["options"]["prefix"], "presence-");

        let unit = serde_json::to_value(&MetricsRequest::Connections).unwrap();
        assert_eq!(unit["type"], "connections");

        let back: MetricsRequest = serde_json::from_value(wire).unwrap();
        assert_eq!(
            back,
            MetricsRequest::Channels {
                prefix: Some("presence-".into())
            }
        );
    }

    #[test]
    fn merges_channel_maps() {
        let request = MetricsRequest::Channels { prefix: None };
        let mut merged = json!({"channels": {
            "room-1": {"subscription_count": 2},
            "presence-a": {"subscription_count": 1, "user_ids": ["u1"]},
        }});
        let part = json!({"channels": {
            "room-1": {"subscription_count": 3},
            "presence-a": {"subscription_count": 2, "user_ids": ["u1", "u2"]},
            "room-2": {"subscription_count": 1},
        }});
        merge(&mut merged, &part, &request);

        assert_eq!(merged["channels"]["room-1"]["subscription_count"], 5);
        assert_eq!(merged["channels"]["room-2"]["subscription_count"], 1);
        assert_eq!(
            merged["channels"]["presence-a"]["user_ids"],
            json!(["u1", "u2"])
        );
    }

    #[test]
    fn merges_connection_counts() {
        let request = MetricsRequest::Connections;
        let mut merged = json!({"connections": 4});
        merge(&mut merged, &json!({"connections": 3}), &request);
        assert_eq!(merged["connections"], 7);
    }

    #[test]
    fn merges_distinct_users() {
        let request = MetricsRequest::ChannelUsers {
            name: "presence-a".into(),
        };
        let mut merged = json!({"users": ["u1", "u2"]});
        merge(&mut merged, &json!({"users": ["u2", "u3"]}), &request);
        assert_eq!(merged["users"], json!(["u1", "u2", "u3"]));
    }

    #[test]
    fn absent_channel_merges_to_the_present_side() {
        let request = MetricsRequest::Channel {
            name: "room-1".into(),
        };
        let mut merged = json!({"channel": null});
        merge(
            &mut merged,
            &json!({"channel": {"subscription_count": 2}}),
            &request,
        );
        assert_eq!(merged["channel"]["subscription_count"], 2);
    }
}
