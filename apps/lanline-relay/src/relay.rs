use dashmap::DashMap;
use lanline_proto::{EndpointId, ServerMessage, SignalKind};
use metrics::counter;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::identity::Identity;

/// Frame queued for one connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Routed signaling message, payload untouched apart from `type`/`from`
    Forward(Map<String, Value>),
    /// Message generated by the relay itself
    Control(ServerMessage),
}

impl Outbound {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        match self {
            Outbound::Forward(map) => serde_json::to_string(map),
            Outbound::Control(message) => serde_json::to_string(message),
        }
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("endpoint {0} is not connected")]
    NotConnected(EndpointId),
    #[error("connection to {0} is closed")]
    ChannelClosed(EndpointId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FrameKind {
    Ring,
    Answer,
    Ice,
    End,
    Ping,
}

/// Inbound frame as the relay sees it: only `type`, `to` and the ring
/// request id are read, everything else is carried opaquely.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: FrameKind,
    #[serde(default)]
    to: Option<EndpointId>,
    #[serde(default)]
    request_id: Option<u64>,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

/// Live registration for one endpoint
#[derive(Clone)]
struct Registration {
    connection_id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
    last_heartbeat: Arc<RwLock<Instant>>,
    evicted: Arc<Notify>,
}

/// Socket-side context of one connected endpoint
pub struct Peer {
    pub identity: Identity,
    pub connection_id: Uuid,
    pub tx: mpsc::UnboundedSender<Outbound>,
    /// Fires when the heartbeat monitor drops this connection
    pub evicted: Arc<Notify>,
}

impl Peer {
    fn reply(&self, message: ServerMessage) {
        let _ = self.tx.send(Outbound::Control(message));
    }
}

/// Routes signaling frames between connected endpoints by identity. Holds no
/// call state: each frame is routed on its own.
#[derive(Clone, Default)]
pub struct Relay {
    endpoints: Arc<DashMap<EndpointId, Registration>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any older connection for the same
    /// identity.
    pub fn register(&self, identity: Identity, tx: mpsc::UnboundedSender<Outbound>) -> Peer {
        let connection_id = Uuid::new_v4();
        let evicted = Arc::new(Notify::new());
        let registration = Registration {
            connection_id,
            tx: tx.clone(),
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            evicted: evicted.clone(),
        };
        if let Some(previous) = self.endpoints.insert(identity.endpoint.clone(), registration) {
            info!(
                endpoint = %identity.endpoint,
                replaced = %previous.connection_id,
                "endpoint reconnected; newer connection takes over"
            );
        }
        Peer {
            identity,
            connection_id,
            tx,
            evicted,
        }
    }

    /// Remove a registration if it still belongs to `connection_id`.
    pub fn unregister(&self, endpoint: &EndpointId, connection_id: Uuid) -> bool {
        self.endpoints
            .remove_if(endpoint, |_, reg| reg.connection_id == connection_id)
            .is_some()
    }

    pub fn is_connected(&self, endpoint: &EndpointId) -> bool {
        self.endpoints.contains_key(endpoint)
    }

    pub fn connected_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Forward `{type: kind, from, ...payload}` to `to`'s live connection.
    pub fn route(
        &self,
        kind: SignalKind,
        to: &EndpointId,
        mut payload: Map<String, Value>,
        from: &Identity,
    ) -> Result<(), RouteError> {
        let tx = self
            .endpoints
            .get(to)
            .map(|reg| reg.tx.clone())
            .ok_or_else(|| RouteError::NotConnected(to.clone()))?;

        if kind == SignalKind::Ring {
            let has_name = payload
                .get("from_name")
                .and_then(Value::as_str)
                .is_some_and(|name| !name.is_empty());
            if !has_name {
                match &from.name {
                    Some(name) => {
                        payload.insert("from_name".into(), Value::String(name.clone()));
                    }
                    None => {
                        payload.remove("from_name");
                    }
                }
            }
        }
        payload.insert("type".into(), Value::String(kind.as_str().into()));
        payload.insert("from".into(), Value::String(from.endpoint.to_string()));

        tx.send(Outbound::Forward(payload))
            .map_err(|_| RouteError::ChannelClosed(to.clone()))
    }

    /// Handle one text frame received from `peer`.
    pub async fn handle_text(&self, peer: &Peer, text: &str) {
        let frame = match serde_json::from_str::<InboundFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(endpoint = %peer.identity.endpoint, "failed to parse frame: {}", e);
                peer.reply(ServerMessage::Error {
                    message: format!("Invalid message format: {}", e),
                });
                return;
            }
        };

        let kind = match frame.kind {
            FrameKind::Ping => {
                self.touch(&peer.identity.endpoint, peer.connection_id).await;
                peer.reply(ServerMessage::Pong);
                return;
            }
            FrameKind::Ring => SignalKind::Ring,
            FrameKind::Answer => SignalKind::Answer,
            FrameKind::Ice => SignalKind::Ice,
            FrameKind::End => SignalKind::End,
        };

        let Some(to) = frame.to else {
            peer.reply(ServerMessage::Error {
                message: format!("`{}` requires a `to` field", kind),
            });
            return;
        };

        counter!("lanline_relay_frames_total", 1, "kind" => kind.as_str());
        debug!(from = %peer.identity.endpoint, to = %to, kind = %kind, "routing frame");

        match self.route(kind, &to, frame.payload, &peer.identity) {
            Ok(()) => {
                if let (SignalKind::Ring, Some(request_id)) = (kind, frame.request_id) {
                    peer.reply(ServerMessage::RingAck {
                        request_id,
                        ok: true,
                        error: None,
                    });
                }
            }
            Err(err) => {
                counter!("lanline_relay_route_failures_total", 1, "kind" => kind.as_str());
                debug!(from = %peer.identity.endpoint, to = %to, kind = %kind, "route failed: {}", err);
                if let RouteError::ChannelClosed(endpoint) = &err {
                    // Writer task is gone; the registration is stale.
                    self.endpoints
                        .remove_if(endpoint, |_, reg| reg.tx.is_closed());
                }
                match (kind, frame.request_id) {
                    (SignalKind::Ring, Some(request_id)) => peer.reply(ServerMessage::RingAck {
                        request_id,
                        ok: false,
                        error: Some(err.to_string()),
                    }),
                    _ => peer.reply(ServerMessage::Undelivered { kind, to }),
                }
            }
        }
    }

    /// Refresh the heartbeat of a registration
    async fn touch(&self, endpoint: &EndpointId, connection_id: Uuid) {
        // Clone the Arc<RwLock> to avoid holding DashMap guards across await
        let heartbeat_lock = self
            .endpoints
            .get(endpoint)
            .filter(|reg| reg.connection_id == connection_id)
            .map(|reg| reg.last_heartbeat.clone());

        if let Some(lock) = heartbeat_lock {
            *lock.write().await = Instant::now();
        }
    }

    /// Drop registrations whose last heartbeat is older than `timeout`.
    pub async fn evict_stale(&self, timeout: Duration) -> Vec<EndpointId> {
        // Collect heartbeat locks first to avoid holding DashMap guards across await
        let heartbeat_checks: Vec<(EndpointId, Uuid, Arc<RwLock<Instant>>)> = self
            .endpoints
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.connection_id,
                    entry.last_heartbeat.clone(),
                )
            })
            .collect();

        let mut stale = Vec::new();
        for (endpoint, connection_id, heartbeat_lock) in heartbeat_checks {
            let last_heartbeat = *heartbeat_lock.read().await;
            if last_heartbeat.elapsed() > timeout {
                stale.push((endpoint, connection_id));
            }
        }

        let mut evicted = Vec::new();
        for (endpoint, connection_id) in stale {
            if let Some((_, reg)) = self
                .endpoints
                .remove_if(&endpoint, |_, reg| reg.connection_id == connection_id)
            {
                info!(endpoint = %endpoint, "removing stale endpoint (heartbeat timeout)");
                reg.evicted.notify_one();
                evicted.push(endpoint);
            }
        }
        evicted
    }

    /// Periodically evict idle connections
    pub fn spawn_heartbeat_monitor(
        &self,
        scan_interval: Duration,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scan_interval);
            loop {
                interval.tick().await;
                relay.evict_stale(timeout).await;
            }
        })
    }
}
