//! End-to-end tests over a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use strider_core::Identity;
use strider_server::{start, PlainTokenDecoder, ServerHandle, ServiceConfig, Services};
use strider_store::{Database, UserRepo, UserStore};
use strider_telemetry::Counters;
use strider_upstream::MockLocationService;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct Harness {
    handle: ServerHandle,
    upstream: Arc<MockLocationService>,
    store: Arc<UserRepo>,
}

impl Harness {
    fn base(&self) -> String {
        format!("http://127.0.0.1:{}", self.handle.port)
    }

    async fn connect(&self, token: &str) -> WsStream {
        let url = format!("ws://127.0.0.1:{}/ws?token={token}", self.handle.port);
        let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
        ws
    }

    async fn exec(&self, token: &str, body: Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}/api/execRoutes?token={token}", self.base()))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

async fn boot(upstream: MockLocationService) -> Harness {
    let upstream = Arc::new(upstream);
    let store = Arc::new(UserRepo::new(Database::in_memory().unwrap()));
    let config = ServiceConfig {
        host: "127.0.0.1".into(),
        port: 0,
        stop_echo_delay_ms: 200,
        ..Default::default()
    };
    let services = Services {
        upstream: upstream.clone(),
        store: store.clone(),
        tokens: Arc::new(PlainTokenDecoder),
        counters: Counters::new(),
    };
    let handle = start(&config, services).await.unwrap();
    Harness {
        handle,
        upstream,
        store,
    }
}

/// Next JSON message, skipping keepalive frames.
async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            if text.as_str() == "ping" {
                continue;
            }
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn route(steps: usize, interval: f64) -> Value {
    let routes: Vec<Value> = (0..steps)
        .map(|i| json!({"lat": 35.0, "lng": 139.0 + i as f64 * 0.001}))
        .collect();
    json!({
        "routes": routes,
        "interval": interval,
        "speed": 4,
        "batteryLevel": 64,
        "expires": "2099-01-01T00:00:00Z"
    })
}

#[tokio::test]
async fn connect_announces_walking_state() {
    let h = boot(MockLocationService::new()).await;
    let mut ws = h.connect("viewer-one").await;

    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "walking");
    assert_eq!(msg["data"], false);

    h.handle.shutdown().await;
}

#[tokio::test]
async fn upgrade_without_token_is_refused() {
    let h = boot(MockLocationService::new()).await;
    let url = format!("ws://127.0.0.1:{}/ws", h.handle.port);
    assert!(connect_async(url).await.is_err());
    h.handle.shutdown().await;
}

#[tokio::test]
async fn route_run_streams_to_viewer() {
    let h = boot(MockLocationService::new()).await;
    let mut ws = h.connect("walker").await;
    assert_eq!(next_json(&mut ws).await["type"], "walking");

    let resp = h.exec("walker", route(3, 0.05)).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "success");

    for i in 0..3 {
        let msg = next_json(&mut ws).await;
        assert_eq!(msg["type"], "location", "step {i}");
        assert_eq!(msg["finish"], false);
    }
    let done = next_json(&mut ws).await;
    assert_eq!(done["type"], "success");
    assert_eq!(done["finish"], true);

    // three steps plus the stationary commit
    assert_eq!(h.upstream.update_count(), 4);
    let record = h.store.get(&Identity::new("walker")).unwrap().unwrap();
    assert!(!record.walking);
    assert_eq!(record.battery, Some(64.0));

    h.handle.shutdown().await;
}

#[tokio::test]
async fn second_start_conflicts_while_walking() {
    let h = boot(MockLocationService::new()).await;
    let mut ws = h.connect("walker").await;
    next_json(&mut ws).await;

    assert_eq!(h.exec("walker", route(5, 10.0)).await.status(), 200);
    assert_eq!(h.exec("walker", route(1, 1.0)).await.status(), 409);

    h.handle.shutdown().await;
}

#[tokio::test]
async fn stop_message_ends_run_and_is_echoed() {
    let h = boot(MockLocationService::new()).await;
    let mut ws = h.connect("walker").await;
    next_json(&mut ws).await;

    assert_eq!(h.exec("walker", route(10, 10.0)).await.status(), 200);
    assert_eq!(next_json(&mut ws).await["type"], "location");

    ws.send(Message::Text(r#"{"type":"stop"}"#.into())).await.unwrap();

    let mut kinds = Vec::new();
    while kinds.last().map(String::as_str) != Some("stop") {
        let msg = next_json(&mut ws).await;
        kinds.push(msg["type"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(kinds, vec!["stopped", "success", "stop"]);

    let record = h.store.get(&Identity::new("walker")).unwrap().unwrap();
    assert!(!record.walking);

    h.handle.shutdown().await;
}

#[tokio::test]
async fn reconnect_replaces_previous_viewer() {
    let h = boot(MockLocationService::new()).await;
    let mut first = h.connect("walker").await;
    next_json(&mut first).await;

    let mut second = h.connect("walker").await;
    assert_eq!(next_json(&mut second).await["type"], "walking");

    // the evicted socket is closed by the server
    let closed = timeout(TIMEOUT, async {
        while let Some(msg) = first.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => return true,
                _ => {}
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);

    h.handle.shutdown().await;
}
