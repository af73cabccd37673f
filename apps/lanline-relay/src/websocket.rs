use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use lanline_proto::ServerMessage;
use metrics::{counter, gauge};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::identity::{ConnectParams, Identity};
use crate::relay::Outbound;
use crate::AppState;

/// WebSocket upgrade handler. Identity is resolved before the upgrade so an
/// unidentified client never gets a registration.
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let identity = match state.identity.resolve(&params) {
        Ok(identity) => identity,
        Err(err) => {
            warn!(remote = %remote_addr, "rejecting connection: {}", err);
            return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, identity, state, remote_addr))
}

/// Handle a WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    identity: Identity,
    state: AppState,
    remote_addr: SocketAddr,
) {
    let (mut sender, mut receiver) = socket.split();

    // Create channel for sending messages to this endpoint
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let peer = state.relay.register(identity, tx);
    let endpoint = peer.identity.endpoint.clone();
    counter!("lanline_relay_connections_total", 1);
    gauge!(
        "lanline_relay_connections_active",
        state.relay.connected_count() as f64
    );
    info!(endpoint = %endpoint, remote = %remote_addr, "endpoint connected");

    // Spawn task to forward queued frames to the WebSocket
    let writer_endpoint = endpoint.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame.to_text() {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(endpoint = %writer_endpoint, "failed to encode frame: {}", e),
            }
        }
        let _ = sender.send(Message::Close(None)).await;
        debug!(endpoint = %writer_endpoint, "writer task ended");
    });

    let _ = peer.tx.send(Outbound::Control(ServerMessage::Welcome {
        endpoint: endpoint.clone(),
        name: peer.identity.name.clone(),
    }));

    loop {
        let msg = tokio::select! {
            _ = peer.evicted.notified() => {
                debug!(endpoint = %endpoint, "connection evicted by heartbeat monitor");
                break;
            }
            next = receiver.next() => match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    debug!(endpoint = %endpoint, "websocket error: {}", e);
                    break;
                }
                None => break,
            },
        };

        match msg {
            Message::Text(text) => state.relay.handle_text(&peer, &text).await,
            Message::Binary(data) => match String::from_utf8(data) {
                // Also accept JSON carried in binary frames
                Ok(text) => state.relay.handle_text(&peer, &text).await,
                Err(_) => debug!(endpoint = %endpoint, "ignoring non-UTF8 binary frame"),
            },
            Message::Close(_) => {
                debug!(endpoint = %endpoint, "received close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // Clean up on disconnect
    state.relay.unregister(&endpoint, peer.connection_id);
    drop(peer);
    gauge!(
        "lanline_relay_connections_active",
        state.relay.connected_count() as f64
    );
    if tokio::time::timeout(std::time::Duration::from_secs(1), writer)
        .await
        .is_err()
    {
        debug!(endpoint = %endpoint, "writer did not drain in time");
    }
    info!(endpoint = %endpoint, "endpoint disconnected");
}
