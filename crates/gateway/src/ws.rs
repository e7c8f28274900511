//! WebSocket connection lifecycle: upgrade → establishment → frame loop →
//! cleanup.
//!
//! Unlike an RPC-style gateway there is no client-driven handshake: the
//! broker validates the application key, origin and connection quota, then
//! immediately emits `pusher:connection_established` and starts
//! interpreting frames.

use std::sync::Arc;

use {
    axum::{
        extract::{
            Path, Query, State, WebSocketUpgrade,
            ws::{Message, WebSocket},
        },
        http::HeaderMap,
        response::Response,
    },
    futures::{SinkExt, stream::StreamExt},
    metrics::{counter, gauge},
    serde::Deserialize,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    reverb_channels::Error as ChannelError,
    reverb_protocol::{
        Frame, SubscribePayload, UnsubscribePayload, close_codes, events, is_client_event,
    },
};

use crate::{connection::Connection, dispatch, state::GatewayState, telemetry};

/// Query parameters on the `/app/{key}` connection path.
#[derive(Debug, Deserialize)]
pub struct ConnectionQuery {
    #[serde(default)]
    pub protocol: Option<u32>,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

pub async fn upgrade_handler(
    State(state): State<Arc<GatewayState>>,
    Path(app_key): Path<String>,
    Query(query): Query<ConnectionQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(axum::http::header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    ws.on_upgrade(move |socket| handle_connection(socket, state, app_key, origin, query))
}

/// Drive one connection through its full lifecycle.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    app_key: String,
    origin: Option<String>,
    query: ConnectionQuery,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();
    let closer = CancellationToken::new();

    // Write loop: forwards queued frames to the socket. On close it drains
    // whatever is still queued (a final pusher:error, typically) before
    // sending the close frame.
    let write_closer = closer.clone();
    let write_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = client_rx.recv() => match maybe {
                    Some(frame) => {
                        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    },
                    None => break,
                },
                _ = write_closer.cancelled() => {
                    while let Ok(frame) = client_rx.try_recv() {
                        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                },
            }
        }
    });

    let refuse = |code: u16, message: &str| {
        if let Ok(json) = Frame::error(code, message).to_json() {
            let _ = client_tx.send(json);
        }
        closer.cancel();
    };

    // ── Establishment ────────────────────────────────────────────────────

    let Some(app) = state.apps.find_by_key(&app_key) else {
        warn!(key = %app_key, "ws: unknown application key");
        refuse(close_codes::APP_NOT_FOUND, "Application does not exist");
        let _ = write_handle.await;
        return;
    };

    if !app.allows_origin(origin.as_deref()) {
        warn!(app = %app.app_id, origin = ?origin, "ws: origin not allowed");
        refuse(close_codes::UNAUTHORIZED, "Origin not allowed");
        let _ = write_handle.await;
        return;
    }

    if let Some(limit) = app.max_connections
        && state.connections.count(&app.app_id) >= limit as usize
    {
        warn!(app = %app.app_id, limit, "ws: connection limit exceeded");
        refuse(
            close_codes::CONNECTION_LIMIT_EXCEEDED,
            "Connection limit exceeded",
        );
        let _ = write_handle.await;
        return;
    }

    let connection = Arc::new(Connection::new(
        Arc::clone(&app),
        origin,
        client_tx.clone(),
        closer.clone(),
    ));
    state.connections.insert(Arc::clone(&connection));
    counter!(telemetry::connection::OPENED_TOTAL).increment(1);
    gauge!(telemetry::connection::ACTIVE).increment(1.0);

    connection.send(&Frame::connection_established(
        connection.id(),
        app.activity_timeout,
    ));

    info!(
        socket_id = %connection.id(),
        app = %app.app_id,
        client = query.client.as_deref().unwrap_or("unknown"),
        version = query.version.as_deref().unwrap_or("unknown"),
        protocol = query.protocol.unwrap_or(reverb_protocol::PROTOCOL_VERSION),
        "ws: connection established"
    );

    // ── Frame loop ───────────────────────────────────────────────────────

    loop {
        tokio::select! {
            _ = closer.cancelled() => break,
            maybe = ws_rx.next() => {
                let Some(message) = maybe else { break };
                match message {
                    Ok(Message::Text(text)) => {
                        handle_frame(&state, &connection, text.as_str()).await;
                    },
                    Ok(Message::Ping(_) | Message::Pong(_)) => connection.touch(),
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Binary(_)) => {
                        connection.touch();
                        connection.send(&Frame::error(
                            close_codes::INVALID_MESSAGE,
                            "Binary frames are not supported",
                        ));
                    },
                    Err(e) => {
                        debug!(socket_id = %connection.id(), error = %e, "ws: read error");
                        break;
                    },
                }
            },
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    state
        .channels
        .unsubscribe_from_all(&app.app_id, connection.id())
        .await;
    state.connections.remove(&app.app_id, connection.id());
    gauge!(telemetry::connection::ACTIVE).decrement(1.0);
    closer.cancel();
    let _ = write_handle.await;

    info!(socket_id = %connection.id(), app = %app.app_id, "ws: connection closed");
}

/// Interpret one inbound text frame.
async fn handle_frame(state: &Arc<GatewayState>, connection: &Arc<Connection>, raw: &str) {
    counter!(telemetry::message::RECEIVED_TOTAL).increment(1);

    if raw.len() > connection.max_message_size() {
        warn!(
            socket_id = %connection.id(),
            size = raw.len(),
            limit = connection.max_message_size(),
            "ws: frame too large"
        );
        connection.send(&Frame::error(
            close_codes::MESSAGE_TOO_LARGE,
            "Message size limit exceeded",
        ));
        connection.disconnect();
        return;
    }

    connection.touch();

    let frame: Frame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(socket_id = %connection.id(), error = %e, "ws: malformed frame");
            connection.send(&Frame::error(close_codes::INVALID_MESSAGE, "Invalid message"));
            return;
        },
    };

    match frame.event.as_str() {
        events::PING => {
            connection.send(&Frame::pong());
        },
        // Accepted with or without data; the touch above is the whole point.
        events::PONG => {},
        events::SUBSCRIBE => handle_subscribe(state, connection, &frame).await,
        events::UNSUBSCRIBE => handle_unsubscribe(state, connection, &frame).await,
        event if is_client_event(event) => handle_client_event(state, connection, &frame).await,
        event => {
            debug!(socket_id = %connection.id(), event, "ws: unexpected event");
            connection.send(&Frame::error(
                close_codes::INVALID_MESSAGE,
                format!("Unexpected event: {event}"),
            ));
        },
    }
}

async fn handle_subscribe(state: &Arc<GatewayState>, connection: &Arc<Connection>, frame: &Frame) {
    let subscription: SubscribePayload = match frame.data.as_ref().map(|data| data.parse()) {
        Some(Ok(subscription)) => subscription,
        _ => {
            connection.send(&Frame::error(
                close_codes::INVALID_MESSAGE,
                "Invalid subscribe payload",
            ));
            return;
        },
    };

    let result = state
        .channels
        .subscribe(
            connection.app(),
            &subscription.channel,
            connection,
            subscription.auth.as_deref(),
            subscription.channel_data.as_deref(),
        )
        .await;

    match result {
        Ok(()) => {
            debug!(
                socket_id = %connection.id(),
                channel = %subscription.channel,
                "ws: subscribed"
            );
        },
        Err(e) => {
            warn!(
                socket_id = %connection.id(),
                channel = %subscription.channel,
                error = %e,
                "ws: subscription refused"
            );
            connection.send(&subscribe_error_frame(&e));
        },
    }
}

// Auth failures, missing presence data and malformed presence data all
// answer on the originating subscribe without closing the connection.
fn subscribe_error_frame(error: &ChannelError) -> Frame {
    Frame::error(close_codes::UNAUTHORIZED, error.to_string())
}

async fn handle_unsubscribe(
    state: &Arc<GatewayState>,
    connection: &Arc<Connection>,
    frame: &Frame,
) {
    let Some(Ok(payload)) = frame
        .data
        .as_ref()
        .map(|data| data.parse::<UnsubscribePayload>())
    else {
        connection.send(&Frame::error(
            close_codes::INVALID_MESSAGE,
            "Invalid unsubscribe payload",
        ));
        return;
    };

    state
        .channels
        .unsubscribe(&connection.app().app_id, &payload.channel, connection.id())
        .await;
    debug!(
        socket_id = %connection.id(),
        channel = %payload.channel,
        "ws: unsubscribed"
    );
}

/// `client-*` events: permitted only on authenticated channels the sender
/// is subscribed to; everything else is dropped. Accepted events become
/// external broadcasts with the sender excluded.
async fn handle_client_event(
    state: &Arc<GatewayState>,
    connection: &Arc<Connection>,
    frame: &Frame,
) {
    let Some(channel) = frame.channel.as_deref() else {
        debug!(socket_id = %connection.id(), "ws: client event without channel dropped");
        return;
    };

    if !reverb_channels::ChannelKind::of(channel).allows_client_events() {
        debug!(
            socket_id = %connection.id(),
            channel,
            "ws: client event on unauthenticated channel dropped"
        );
        return;
    }

    let app_id = &connection.app().app_id;
    if !state
        .channels
        .is_subscribed(app_id, channel, connection.id())
        .await
    {
        debug!(
            socket_id = %connection.id(),
            channel,
            "ws: client event from non-subscriber dropped"
        );
        return;
    }

    let payload = match serde_json::to_value(frame) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(socket_id = %connection.id(), error = %e, "ws: client event not serializable");
            return;
        },
    };

    dispatch::dispatch(
        state,
        connection.app(),
        &payload,
        Some(connection.id()),
        true,
    )
    .await;
}
