//! The signed HTTP control API.
//!
//! Mounted under `/apps/{appId}`; every route except `/up` passes through
//! [`control_auth`], which resolves the application, bounds the body size
//! and verifies the request signature before handlers run.

use std::sync::Arc;

use {
    axum::{
        Extension, Json,
        body::{Body, Bytes, to_bytes},
        extract::{Path, Query, Request, State},
        middleware::Next,
        response::Response,
    },
    serde::Deserialize,
    serde_json::{Map, Value, json},
    url::form_urlencoded,
};

use {
    reverb_channels::ChannelKind,
    reverb_protocol::SocketId,
    reverb_pubsub::Envelope,
};

use crate::{
    apps::Application,
    dispatch,
    error::HttpError,
    metrics_handler::{self, MetricsRequest},
    signature,
    state::GatewayState,
};

/// Most events a single batch may carry.
const MAX_BATCH_SIZE: usize = 10;

// ── Authentication middleware ────────────────────────────────────────────────

pub async fn control_auth(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    let (parts, body) = request.into_parts();

    let app_id = app_id_from_path(parts.uri.path())
        .ok_or_else(|| HttpError::bad_request("missing app id"))?;
    let app = state
        .apps
        .find_by_id(&app_id)
        .ok_or_else(|| HttpError::not_found(format!("application {app_id} does not exist")))?;

    let params: Vec<(String, String)> =
        form_urlencoded::parse(parts.uri.query().unwrap_or_default().as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

    let body = to_bytes(body, state.max_request_size)
        .await
        .map_err(|_| HttpError::PayloadTooLarge {
            limit: state.max_request_size,
        })?;

    let provided = params
        .iter()
        .find(|(key, _)| key == "auth_signature")
        .map(|(_, value)| value.clone())
        .ok_or(HttpError::Unauthorized)?;

    if !signature::verify(
        &app.secret,
        parts.method.as_str(),
        parts.uri.path(),
        &params,
        &body,
        &provided,
    ) {
        return Err(HttpError::Unauthorized);
    }

    let mut request = Request::from_parts(parts, Body::from(body));
    request.extensions_mut().insert(app);
    Ok(next.run(request).await)
}

fn app_id_from_path(path: &str) -> Option<String> {
    let mut segments = path.split('/').filter(|segment| !segment.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "apps" {
            return segments.next().map(str::to_string);
        }
    }
    None
}

// ── Liveness ─────────────────────────────────────────────────────────────────

pub async fn up() -> Json<Value> {
    Json(json!({ "health": "OK" }))
}

// ── Info field selection ─────────────────────────────────────────────────────

/// The `info=<csv>` attribute selection on inspection endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct InfoFields {
    occupied: bool,
    user_count: bool,
    subscription_count: bool,
    cache: bool,
}

impl InfoFields {
    pub fn parse(csv: Option<&str>) -> Result<Self, HttpError> {
        let mut fields = Self::default();
        let Some(csv) = csv else {
            return Ok(fields);
        };
        for attribute in csv.split(',') {
            match attribute.trim() {
                "" => {},
                "occupied" => fields.occupied = true,
                "user_count" => fields.user_count = true,
                "subscription_count" => fields.subscription_count = true,
                "cache" => fields.cache = true,
                other => {
                    return Err(HttpError::bad_request(format!(
                        "unrecognized info attribute: {other}"
                    )));
                },
            }
        }
        Ok(fields)
    }

    /// Build the response object for one channel summary.
    fn project(&self, summary: Option<&Value>, always_occupied: bool) -> Value {
        let subscription_count = summary
            .and_then(|s| s.get("subscription_count"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let mut object = Map::new();
        if always_occupied || self.occupied {
            object.insert("occupied".into(), json!(subscription_count > 0));
        }
        if self.subscription_count {
            object.insert("subscription_count".into(), json!(subscription_count));
        }
        if self.user_count
            && let Some(user_ids) = summary
                .and_then(|s| s.get("user_ids"))
                .and_then(|v| v.as_array())
        {
            object.insert("user_count".into(), json!(user_ids.len()));
        }
        if self.cache {
            let cache = summary
                .and_then(|s| s.get("cache"))
                .cloned()
                .unwrap_or(Value::Null);
            object.insert("cache".into(), cache);
        }
        Value::Object(object)
    }
}

// ── Event publishing ─────────────────────────────────────────────────────────

/// Body of a publish request. Everything is optional so validation can
/// report per-field errors instead of an opaque parse failure.
#[derive(Debug, Default, Deserialize)]
pub struct EventRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channels: Option<Vec<String>>,
    #[serde(default)]
    pub socket_id: Option<String>,
    #[serde(default)]
    pub info: Option<String>,
}

#[derive(Debug)]
struct ValidEvent {
    name: String,
    data: String,
    channels: Vec<String>,
    except: Option<SocketId>,
    info: Option<InfoFields>,
}

const MAX_EVENT_NAME_LEN: usize = 200;
const MAX_CHANNELS_PER_EVENT: usize = 100;

fn validate_event(request: &EventRequest) -> Result<ValidEvent, Map<String, Value>> {
    let mut errors = Map::new();

    let name = match request.name.as_deref() {
        None | Some("") => {
            errors.insert("name".into(), json!("event name is required"));
            String::new()
        },
        Some(name) if name.len() > MAX_EVENT_NAME_LEN => {
            errors.insert(
                "name".into(),
                json!(format!("event name longer than {MAX_EVENT_NAME_LEN} characters")),
            );
            String::new()
        },
        Some(name) => name.to_string(),
    };

    let data = match &request.data {
        Some(Value::String(data)) => data.clone(),
        Some(_) => {
            errors.insert("data".into(), json!("data must be a JSON-encoded string"));
            String::new()
        },
        None => {
            errors.insert("data".into(), json!("data is required"));
            String::new()
        },
    };

    let channels = match (&request.channel, &request.channels) {
        (_, Some(channels)) if channels.len() > MAX_CHANNELS_PER_EVENT => {
            errors.insert(
                "channels".into(),
                json!(format!("at most {MAX_CHANNELS_PER_EVENT} channels per event")),
            );
            Vec::new()
        },
        (_, Some(channels)) if !channels.is_empty() => channels.clone(),
        (Some(channel), _) if !channel.is_empty() => vec![channel.clone()],
        _ => {
            errors.insert("channel".into(), json!("channel or channels is required"));
            Vec::new()
        },
    };

    let except = match request.socket_id.as_deref() {
        None => None,
        Some(raw) => match SocketId::parse(raw) {
            Some(socket_id) => Some(socket_id),
            None => {
                errors.insert("socket_id".into(), json!("socket_id is malformed"));
                None
            },
        },
    };

    let info = match request.info.as_deref() {
        None => None,
        Some(csv) => match InfoFields::parse(Some(csv)) {
            Ok(fields) => Some(fields),
            Err(_) => {
                errors.insert("info".into(), json!("unrecognized info attribute"));
                None
            },
        },
    };

    if errors.is_empty() {
        Ok(ValidEvent {
            name,
            data,
            channels,
            except,
            info,
        })
    } else {
        Err(errors)
    }
}

fn event_payload(event: &ValidEvent) -> Value {
    json!({
        "event": event.name,
        "channels": event.channels,
        "data": event.data,
    })
}

async fn event_info(
    state: &Arc<GatewayState>,
    app: &Arc<Application>,
    event: &ValidEvent,
    fields: InfoFields,
) -> Value {
    let mut channels = Map::new();
    for name in &event.channels {
        let merged = metrics_handler::gather(
            state,
            app,
            MetricsRequest::Channel { name: name.clone() },
        )
        .await;
        let summary = merged.get("channel").filter(|v| !v.is_null());
        channels.insert(name.clone(), fields.project(summary, false));
    }
    json!({ "channels": channels })
}

pub async fn publish_event(
    State(state): State<Arc<GatewayState>>,
    Extension(app): Extension<Arc<Application>>,
    body: Bytes,
) -> Result<Json<Value>, HttpError> {
    let request: EventRequest = serde_json::from_slice(&body)
        .map_err(|e| HttpError::bad_request(format!("invalid JSON body: {e}")))?;
    let event = validate_event(&request)
        .map_err(|errors| HttpError::Unprocessable(json!({ "errors": errors })))?;

    dispatch::dispatch(&state, &app, &event_payload(&event), event.except.as_ref(), true).await;

    match event.info {
        None => Ok(Json(json!({}))),
        Some(fields) => Ok(Json(event_info(&state, &app, &event, fields).await)),
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub batch: Vec<EventRequest>,
}

pub async fn publish_batch(
    State(state): State<Arc<GatewayState>>,
    Extension(app): Extension<Arc<Application>>,
    body: Bytes,
) -> Result<Json<Value>, HttpError> {
    let request: BatchRequest = serde_json::from_slice(&body)
        .map_err(|e| HttpError::bad_request(format!("invalid JSON body: {e}")))?;

    if request.batch.len() > MAX_BATCH_SIZE {
        return Err(HttpError::Unprocessable(json!({
            "errors": { "batch": format!("at most {MAX_BATCH_SIZE} events per batch") }
        })));
    }

    let mut events = Vec::with_capacity(request.batch.len());
    let mut item_errors = Map::new();
    for (index, item) in request.batch.iter().enumerate() {
        match validate_event(item) {
            Ok(event) => events.push(event),
            Err(errors) => {
                item_errors.insert(index.to_string(), Value::Object(errors));
            },
        }
    }
    if !item_errors.is_empty() {
        return Err(HttpError::Unprocessable(json!({ "errors": item_errors })));
    }

    let mut infos = Vec::with_capacity(events.len());
    for event in &events {
        dispatch::dispatch(&state, &app, &event_payload(event), event.except.as_ref(), true).await;
        match event.info {
            None => infos.push(json!({})),
            Some(fields) => {
                let info = event_info(&state, &app, event, fields).await;
                // Single-target items answer with the flat attribute object.
                if event.channels.len() == 1 {
                    infos.push(info["channels"][&event.channels[0]].clone());
                } else {
                    infos.push(info);
                }
            },
        }
    }

    Ok(Json(json!({ "batch": infos })))
}

// ── Inspection ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChannelsQuery {
    #[serde(default)]
    pub filter_by_prefix: Option<String>,
    #[serde(default)]
    pub info: Option<String>,
}

pub async fn list_channels(
    State(state): State<Arc<GatewayState>>,
    Extension(app): Extension<Arc<Application>>,
    Query(query): Query<ChannelsQuery>,
) -> Result<Json<Value>, HttpError> {
    let fields = InfoFields::parse(query.info.as_deref())?;
    let merged = metrics_handler::gather(
        &state,
        &app,
        MetricsRequest::Channels {
            prefix: query.filter_by_prefix.clone(),
        },
    )
    .await;

    let mut channels = Map::new();
    if let Some(summaries) = merged.get("channels").and_then(|v| v.as_object()) {
        for (name, summary) in summaries {
            channels.insert(name.clone(), fields.project(Some(summary), false));
        }
    }
    Ok(Json(json!({ "channels": channels })))
}

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    #[serde(default)]
    pub info: Option<String>,
}

pub async fn channel_info(
    State(state): State<Arc<GatewayState>>,
    Extension(app): Extension<Arc<Application>>,
    Path((_app_id, channel)): Path<(String, String)>,
    Query(query): Query<ChannelQuery>,
) -> Result<Json<Value>, HttpError> {
    let fields = InfoFields::parse(query.info.as_deref())?;
    let merged = metrics_handler::gather(
        &state,
        &app,
        MetricsRequest::Channel {
            name: channel.clone(),
        },
    )
    .await;
    let summary = merged.get("channel").filter(|v| !v.is_null());
    Ok(Json(fields.project(summary, true)))
}

pub async fn channel_users(
    State(state): State<Arc<GatewayState>>,
    Extension(app): Extension<Arc<Application>>,
    Path((_app_id, channel)): Path<(String, String)>,
) -> Result<Json<Value>, HttpError> {
    if !ChannelKind::of(&channel).is_presence() {
        return Err(HttpError::bad_request(
            "users can only be retrieved for presence channels",
        ));
    }

    let merged = metrics_handler::gather(
        &state,
        &app,
        MetricsRequest::ChannelUsers {
            name: channel.clone(),
        },
    )
    .await;

    let users: Vec<Value> = merged
        .get("users")
        .and_then(|v| v.as_array())
        .map(|users| users.iter().map(|id| json!({ "id": id })).collect())
        .unwrap_or_default();
    Ok(Json(json!({ "users": users })))
}

pub async fn connections(
    State(state): State<Arc<GatewayState>>,
    Extension(app): Extension<Arc<Application>>,
) -> Result<Json<Value>, HttpError> {
    let merged = metrics_handler::gather(&state, &app, MetricsRequest::Connections).await;
    Ok(Json(merged))
}

// ── Termination ──────────────────────────────────────────────────────────────

pub async fn terminate_user_connections(
    State(state): State<Arc<GatewayState>>,
    Extension(app): Extension<Arc<Application>>,
    Path((_app_id, user_id)): Path<(String, String)>,
) -> Result<Json<Value>, HttpError> {
    let closed = state.terminate_user_connections(&app.app_id, &user_id).await;
    tracing::info!(app = %app.app_id, user_id = %user_id, closed, "terminated user connections");

    if let Some(bus) = &state.bus
        && let Ok(application) = serde_json::to_value(app.as_ref())
    {
        let envelope = Envelope::terminate(application, json!({ "user_id": user_id }));
        if let Err(e) = bus.publish(envelope).await {
            tracing::warn!(app = %app.app_id, error = %e, "failed to publish terminate envelope");
        }
    }

    Ok(Json(json!({})))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn app_id_extraction() {
        assert_eq!(app_id_from_path("/apps/123/events"), Some("123".into()));
        assert_eq!(app_id_from_path("/apps/123"), Some("123".into()));
        assert_eq!(app_id_from_path("/up"), None);
        assert_eq!(app_id_from_path("/apps"), None);
    }

    #[test]
    fn info_fields_reject_unknown_attributes() {
        assert!(InfoFields::parse(Some("occupied,subscription_count")).is_ok());
        assert!(InfoFields::parse(Some("bogus")).is_err());
        assert!(InfoFields::parse(None).is_ok());
    }

    #[test]
    fn event_validation_reports_fields() {
        let request = EventRequest {
            data: Some(json!({"not":"a string"})),
            socket_id: Some("nope".into()),
            ..EventRequest::default()
        };
        let errors = validate_event(&request).unwrap_err();
        assert!(errors.contains_key("name"));
        assert!(errors.contains_key("data"));
        assert!(errors.contains_key("channel"));
        assert!(errors.contains_key("socket_id"));
    }

    #[test]
    fn event_validation_accepts_single_channel() {
        let request = EventRequest {
            name: Some("e".into()),
            data: Some(json!("{\"x\":1}")),
            channel: Some("room-1".into()),
            ..EventRequest::default()
        };
        let event = validate_event(&request).unwrap();
        assert_eq!(event.channels, vec!["room-1"]);
        assert!(event.except.is_none());
    }
}
