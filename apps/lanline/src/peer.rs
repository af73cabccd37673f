use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use lanline_proto::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::CallError;
use crate::media::{LocalStream, RemoteTrack};
use crate::session::SessionEvent;

/// Aggregate connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// Asynchronous notifications from a peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    Transport(TransportState),
}

/// Handle through which a peer connection feeds its callbacks into the owning
/// call session. Each sink is tagged with the generation of the session that
/// created it, so events from a torn-down connection are recognisable.
#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl PeerEventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the session has gone away.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(SessionEvent::Peer {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

impl fmt::Debug for PeerEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEventSink")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Which remote media an offer should ask to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
}

/// One peer connection with the remote party.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach every track of the stream, replacing previously attached ones.
    async fn attach_stream(&self, stream: &LocalStream) -> Result<(), CallError>;
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, CallError>;
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), CallError>;
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), CallError>;
    async fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError>;
    async fn close(&self) -> Result<(), CallError>;
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, events: PeerEventSink) -> Result<Box<dyn PeerLink>, CallError>;
}

/// Owns at most one peer connection at a time.
pub struct PeerLifecycle {
    connector: Arc<dyn PeerConnector>,
    link: Option<Box<dyn PeerLink>>,
}

impl PeerLifecycle {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            link: None,
        }
    }

    /// Return the current connection, creating one if none exists.
    pub async fn ensure(&mut self, events: PeerEventSink) -> Result<&dyn PeerLink, CallError> {
        if self.link.is_none() {
            let generation = events.generation();
            let link = self.connector.connect(events).await?;
            debug!(generation, "peer connection created");
            self.link = Some(link);
        }
        self.link
            .as_deref()
            .ok_or_else(|| CallError::Transport("peer connection unavailable".into()))
    }

    pub fn current(&self) -> Option<&dyn PeerLink> {
        self.link.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Close and discard the connection. Returns false if there was none.
    pub async fn close(&mut self) -> bool {
        let Some(link) = self.link.take() else {
            return false;
        };
        if let Err(err) = link.close().await {
            warn!(error = %err, "error while closing peer connection");
        }
        true
    }
}

/// Address family a deployment uses for connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ipv4" | "v4" | "4" => Ok(AddressFamily::Ipv4),
            "ipv6" | "v6" | "6" => Ok(AddressFamily::Ipv6),
            other => Err(format!("unknown address family '{other}'")),
        }
    }
}

/// Connection address of a candidate, classified by family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateAddress {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Hostname(String),
    Unknown,
}

impl CandidateAddress {
    pub fn of(candidate: &IceCandidate) -> Self {
        let Some(address) = candidate.connection_address() else {
            return CandidateAddress::Unknown;
        };
        let bare = address.trim_start_matches('[').trim_end_matches(']');
        match bare.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => CandidateAddress::V4(v4),
            Ok(IpAddr::V6(v6)) => CandidateAddress::V6(v6),
            Err(_) => CandidateAddress::Hostname(address.to_owned()),
        }
    }
}

/// Decides which locally gathered candidates are worth sending.
///
/// Only literal addresses of the other family are dropped; hostname
/// (mDNS) candidates cannot be classified and always pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CandidatePolicy {
    pub family: AddressFamily,
}

impl CandidatePolicy {
    pub fn new(family: AddressFamily) -> Self {
        Self { family }
    }

    pub fn allows(&self, candidate: &IceCandidate) -> bool {
        match CandidateAddress::of(candidate) {
            CandidateAddress::V4(_) => self.family == AddressFamily::Ipv4,
            CandidateAddress::V6(_) => self.family == AddressFamily::Ipv6,
            CandidateAddress::Hostname(_) | CandidateAddress::Unknown => true,
        }
    }
}
