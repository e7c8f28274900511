#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Two brokers on one bus: mirrored publishes, fleet-wide metrics and
//! cross-node termination.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    futures::{SinkExt, StreamExt},
    md5::{Digest, Md5},
    serde_json::{Value, json},
    tokio::net::{TcpListener, TcpStream},
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
};

use {
    reverb_channels::auth,
    reverb_config::{AppConfig, ReverbConfig},
    reverb_gateway::{
        bus, dispatch,
        metrics_handler::{self, MetricsRequest},
        server::build_router,
        signature,
        state::GatewayState,
    },
    reverb_protocol::SocketId,
    reverb_pubsub::{
        PubSubProvider,
        memory::{MemoryHub, MemoryProvider},
    },
};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const APP_ID: &str = "100";
const KEY: &str = "test-key";
const SECRET: &str = "test-secret";

fn test_config() -> ReverbConfig {
    let mut config = ReverbConfig::default();
    config.server.scaling.enabled = true;
    config.apps.apps.push(AppConfig {
        app_id: APP_ID.into(),
        key: KEY.into(),
        secret: SECRET.into(),
        ..AppConfig::default()
    });
    config
}

async fn start_node(hub: &Arc<MemoryHub>) -> (SocketAddr, Arc<GatewayState>) {
    let provider: Arc<dyn PubSubProvider> = MemoryProvider::new(hub);
    let state = GatewayState::from_config(&test_config(), Some(provider));
    state.bus.as_ref().unwrap().connect().await.unwrap();
    bus::attach(&state).await;

    let app = build_router(Arc::clone(&state));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn next_json(ws: &mut WsClient) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn subscriber(addr: SocketAddr, channel: &str, user_id: Option<&str>) -> (WsClient, SocketId) {
    let url = format!("ws://{addr}/app/{KEY}?protocol=7");
    let (mut ws, _) = connect_async(url).await.unwrap();
    let established = next_json(&mut ws).await;
    let data: Value = serde_json::from_str(established["data"].as_str().unwrap()).unwrap();
    let socket_id = SocketId::parse(data["socket_id"].as_str().unwrap()).unwrap();

    let subscribe = match user_id {
        Some(user_id) => {
            let channel_data = json!({"user_id": user_id}).to_string();
            let payload = auth::signing_payload(&socket_id, channel, Some(&channel_data));
            let token = format!("{KEY}:{}", auth::sign(SECRET, &payload));
            json!({"event": "pusher:subscribe", "data": {
                "channel": channel, "auth": token, "channel_data": channel_data,
            }})
        },
        None => json!({"event": "pusher:subscribe", "data": {"channel": channel}}),
    };
    ws.send(Message::Text(subscribe.to_string().into()))
        .await
        .unwrap();
    let ack = next_json(&mut ws).await;
    assert_eq!(ack["event"], "pusher_internal:subscription_succeeded");
    (ws, socket_id)
}

fn signed_url(
    addr: SocketAddr,
    method: &str,
    path: &str,
    body: &str,
) -> String {
    let mut params: Vec<(String, String)> = vec![
        ("auth_key".into(), KEY.into()),
        ("auth_timestamp".into(), "1700000000".into()),
        ("auth_version".into(), "1.0".into()),
    ];
    if !body.is_empty() {
        params.push(("body_md5".into(), hex::encode(Md5::digest(body.as_bytes()))));
    }
    let payload = signature::signature_payload(method, path, &params, body.as_bytes());
    params.push(("auth_signature".into(), auth::sign(SECRET, &payload)));
    let query = params
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("http://{addr}{path}?{query}")
}

#[tokio::test]
async fn publishes_are_mirrored_to_peer_brokers() {
    let hub = MemoryHub::new();
    let (_addr_a, state_a) = start_node(&hub).await;
    let (addr_b, _state_b) = start_node(&hub).await;

    let (mut ws_b, _) = subscriber(addr_b, "room-1", None).await;

    let app = state_a.apps.find_by_key(KEY).unwrap();
    let payload = json!({"event": "e", "channel": "room-1", "data": "{\"x\":1}"});
    dispatch::dispatch(&state_a, &app, &payload, None, true).await;

    let received = next_json(&mut ws_b).await;
    assert_eq!(received["event"], "e");
    assert_eq!(received["channel"], "room-1");
}

#[tokio::test]
async fn remote_exclusion_resolves_to_nobody() {
    let hub = MemoryHub::new();
    let (addr_a, state_a) = start_node(&hub).await;
    let (addr_b, _state_b) = start_node(&hub).await;

    let (_ws_a, id_a) = subscriber(addr_a, "room-1", None).await;
    let (mut ws_b, _) = subscriber(addr_b, "room-1", None).await;

    // Excluding a node-A socket must not suppress delivery on node B.
    let app = state_a.apps.find_by_key(KEY).unwrap();
    let payload = json!({"event": "e", "channel": "room-1", "data": "{}"});
    dispatch::dispatch(&state_a, &app, &payload, Some(&id_a), true).await;

    assert_eq!(next_json(&mut ws_b).await["event"], "e");
}

#[tokio::test]
async fn fleet_metrics_merge_counts_and_distinct_users() {
    let hub = MemoryHub::new();
    let (addr_a, state_a) = start_node(&hub).await;
    let (addr_b, _state_b) = start_node(&hub).await;

    let (_ws_a, _) = subscriber(addr_a, "room-1", None).await;
    let (_ws_b, _) = subscriber(addr_b, "room-1", None).await;
    // The same user present on both nodes counts once.
    let (_ws_c, _) = subscriber(addr_a, "presence-lobby", Some("shared")).await;
    let (_ws_d, _) = subscriber(addr_b, "presence-lobby", Some("shared")).await;

    let app = state_a.apps.find_by_key(KEY).unwrap();

    let merged =
        metrics_handler::gather(&state_a, &app, MetricsRequest::Channels { prefix: None }).await;
    assert_eq!(merged["channels"]["room-1"]["subscription_count"], 2);
    assert_eq!(
        merged["channels"]["presence-lobby"]["user_ids"],
        json!(["shared"])
    );

    let merged = metrics_handler::gather(
        &state_a,
        &app,
        MetricsRequest::ChannelUsers {
            name: "presence-lobby".into(),
        },
    )
    .await;
    assert_eq!(merged["users"], json!(["shared"]));

    let merged = metrics_handler::gather(&state_a, &app, MetricsRequest::Connections).await;
    assert_eq!(merged["connections"], 4);
}

#[tokio::test]
async fn terminate_reaches_connections_on_peer_brokers() {
    let hub = MemoryHub::new();
    let (addr_a, _state_a) = start_node(&hub).await;
    let (addr_b, state_b) = start_node(&hub).await;

    let (mut ws_b, _) = subscriber(addr_b, "presence-lobby", Some("doomed")).await;

    // Terminate through node A's control API; node B must follow suit.
    let path = format!("/apps/{APP_ID}/users/doomed/terminate_connections");
    let url = signed_url(addr_a, "POST", &path, "");
    let response = reqwest::Client::new().post(url).send().await.unwrap();
    assert_eq!(response.status(), 200);

    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws_b.next())
            .await
            .expect("timed out waiting for close")
        {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
            Some(Ok(_)) => continue,
        }
    }
    for _ in 0..50 {
        if state_b.connections.count(APP_ID) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state_b.connections.count(APP_ID), 0);
}
