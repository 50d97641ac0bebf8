use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use strider_core::{Identity, Notification, ViewerCommand};

use crate::handlers::ViewerToken;
use crate::registry::{Outbound, ViewerHandle};
use crate::server::AppState;

/// `GET /ws`: the token is checked before the upgrade is accepted.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ViewerToken(identity): ViewerToken,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, identity, state))
}

async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState) {
    let (handle, rx) = state.registry.register(&identity);
    info!(identity = %identity, conn_id = %handle.conn_id, "viewer connected");

    let walking = state.orchestrator.is_walking(&identity);
    state.registry.send(&identity, &Notification::walking(walking));

    run_connection(socket, &identity, Arc::clone(&handle), rx, &state).await;

    state.registry.unregister(&identity, &handle.conn_id);
    info!(identity = %identity, conn_id = %handle.conn_id, "viewer disconnected");
}

/// Split into writer and reader tasks; whichever ends first ends the
/// connection.
async fn run_connection(
    socket: WebSocket,
    identity: &Identity,
    handle: Arc<ViewerHandle>,
    mut rx: mpsc::Receiver<Outbound>,
    state: &AppState,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let closed = handle.closed();
    let mut writer = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                msg = rx.recv() => msg,
                _ = closed.cancelled() => Some(Outbound::Close),
            };
            let frame = match next {
                Some(Outbound::Text(text)) => WsMessage::Text(text.into()),
                Some(Outbound::Ping) => WsMessage::Ping(Default::default()),
                Some(Outbound::Close) | None => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            };
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    let reader_identity = identity.clone();
    let reader_handle = Arc::clone(&handle);
    let orchestrator = Arc::clone(&state.orchestrator);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            reader_handle.mark_alive();
            match msg {
                WsMessage::Text(text) => match ViewerCommand::parse(text.as_str()) {
                    ViewerCommand::Pong => trace!(identity = %reader_identity, "pong"),
                    ViewerCommand::Stop => {
                        orchestrator.request_stop(&reader_identity);
                    }
                    ViewerCommand::Other(other) => {
                        debug!(identity = %reader_identity, len = other.len(), "viewer message")
                    }
                },
                WsMessage::Close(_) => break,
                // axum answers pings; pongs only count as liveness
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
}
