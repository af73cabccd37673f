use std::sync::Mutex;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lanline_proto::{ClientMessage, EndpointId, ServerMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

use crate::config::RelayConfig;
use crate::error::CallError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound half of the relay connection, as the call session sees it.
pub trait Signaler: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<(), CallError>;
}

enum Outgoing {
    Frame(ClientMessage),
    Close(oneshot::Sender<()>),
}

/// WebSocket connection to the relay.
pub struct SignalingClient {
    endpoint: EndpointId,
    name: Option<String>,
    send_tx: mpsc::UnboundedSender<Outgoing>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect and wait for the relay to confirm our identity. Every later
    /// relay message is delivered on the returned receiver, which closes when
    /// the connection drops.
    pub async fn connect(
        config: &RelayConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>), CallError> {
        let url = config.connect_url();
        let (ws_stream, _) = tokio::time::timeout(WELCOME_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| CallError::Signaling(format!("timed out connecting to {}", config.url)))?
            .map_err(|err| CallError::Signaling(format!("websocket connect failed: {err}")))?;
        debug!(url = %config.url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let (welcome_tx, welcome_rx) = oneshot::channel::<(EndpointId, Option<String>)>();

        let writer_handle = tokio::spawn(async move {
            while let Some(outgoing) = send_rx.recv().await {
                let message = match outgoing {
                    Outgoing::Frame(message) => message,
                    Outgoing::Close(done) => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        let _ = done.send(());
                        return;
                    }
                };
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to encode relay message"),
                }
            }
        });

        let reader_handle = tokio::spawn(async move {
            let mut welcome = Some(welcome_tx);
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!("relay websocket closed: {err}");
                            }
                            _ => warn!("relay websocket error: {err}"),
                        }
                        break;
                    }
                };
                trace!(len = text.len(), "relay frame");
                let message = match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(error = %err, "ignoring unparseable relay frame");
                        continue;
                    }
                };
                if let ServerMessage::Welcome { endpoint, name } = &message {
                    if let Some(tx) = welcome.take() {
                        let _ = tx.send((endpoint.clone(), name.clone()));
                        continue;
                    }
                }
                if inbound_tx.send(message).is_err() {
                    break;
                }
            }
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(Outgoing::Frame(ClientMessage::Ping)).is_err() {
                    break;
                }
            }
        });

        let tasks = vec![writer_handle, reader_handle, heartbeat_handle];
        let (endpoint, name) = match tokio::time::timeout(WELCOME_TIMEOUT, welcome_rx).await {
            Ok(Ok(identity)) => identity,
            Ok(Err(_)) => {
                abort_all(&tasks);
                return Err(CallError::Signaling(
                    "relay closed the connection before registering us".into(),
                ));
            }
            Err(_) => {
                abort_all(&tasks);
                return Err(CallError::Signaling("timed out waiting for relay welcome".into()));
            }
        };
        debug!(%endpoint, "registered with relay");

        Ok((
            Self {
                endpoint,
                name,
                send_tx,
                tasks: Mutex::new(tasks),
            },
            inbound_rx,
        ))
    }

    /// Identity the relay registered us under.
    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        !self.send_tx.is_closed()
    }

    /// Flush everything already queued, then close the socket.
    pub async fn close(&self) {
        let (done, closed) = oneshot::channel();
        if self.send_tx.send(Outgoing::Close(done)).is_ok() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, closed).await;
        }
    }
}

impl Signaler for SignalingClient {
    fn send(&self, message: ClientMessage) -> Result<(), CallError> {
        self.send_tx
            .send(Outgoing::Frame(message))
            .map_err(|_| CallError::Signaling("relay connection closed".into()))
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            abort_all(&tasks);
            tasks.clear();
        }
    }
}

fn abort_all(tasks: &[JoinHandle<()>]) {
    for handle in tasks {
        handle.abort();
    }
}
