//! In-process doubles for media, peer connections and the relay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lanline_proto::{ClientMessage, EndpointId, IceCandidate, ServerMessage, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{LocalStream, LocalTrack, MediaConstraints, MediaDevices, MediaKind};
use crate::peer::{OfferOptions, PeerConnector, PeerEvent, PeerEventSink, PeerLink, TransportState};
use crate::session::{CallHandle, CallNotice, CallSnapshot, CallState, RemoteEndpoint, SessionDeps};
use crate::signaling::Signaler;

pub const WAIT: Duration = Duration::from_secs(5);

/// Host candidate on the 192.168.1.0/24 segment, distinct per `n`.
pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{n} 1 udp 2122260223 192.168.1.{n} {} typ host",
        50000 + n
    ))
}

#[derive(Default)]
struct LinkState {
    remote_set: bool,
    has_video: bool,
    applied: Vec<String>,
    local: Vec<SessionDescription>,
    remote: Vec<SessionDescription>,
    offers: Vec<OfferOptions>,
    attached: Vec<String>,
    failing: HashMap<String, usize>,
    reject_remote: bool,
    closed: usize,
}

/// Peer connection double that records every call made on it.
#[derive(Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<LinkState>>,
}

impl MockLink {
    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn offers(&self) -> Vec<OfferOptions> {
        self.state.lock().offers.clone()
    }

    pub fn attached_tracks(&self) -> Vec<String> {
        self.state.lock().attached.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closed
    }

    /// Make the next `times` attempts to add `candidate` fail.
    pub fn fail_candidate(&self, candidate: &str, times: usize) {
        self.state.lock().failing.insert(candidate.to_owned(), times);
    }

    pub fn reject_remote_descriptions(&self) {
        self.state.lock().reject_remote = true;
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn attach_stream(&self, stream: &LocalStream) -> Result<(), CallError> {
        let mut state = self.state.lock();
        state.attached = stream.tracks().iter().map(|t| t.id().to_owned()).collect();
        state.has_video = stream.has_video();
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, CallError> {
        let mut state = self.state.lock();
        state.offers.push(options);
        let mut sdp = String::from("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        if options.receive_video || state.has_video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let state = self.state.lock();
        if !state.remote_set {
            return Err(CallError::Negotiation("no remote offer".into()));
        }
        let mut sdp = String::from("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        if state.has_video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), CallError> {
        self.state.lock().local.push(description.clone());
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), CallError> {
        let mut state = self.state.lock();
        if state.reject_remote {
            return Err(CallError::Negotiation("malformed remote description".into()));
        }
        state.remote.push(description.clone());
        state.remote_set = true;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote_set
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        let mut state = self.state.lock();
        if !state.remote_set {
            return Err(CallError::Transport("remote description not set".into()));
        }
        if let Some(remaining) = state.failing.get_mut(&candidate.candidate) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CallError::Transport("candidate rejected".into()));
            }
        }
        state.applied.push(candidate.candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.state.lock().closed += 1;
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorState {
    links: Vec<MockLink>,
    sinks: Vec<PeerEventSink>,
    reject_remote: bool,
}

/// Hands out [`MockLink`]s and keeps their event sinks so tests can play
/// the part of the transport.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn connections(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn last_link(&self) -> MockLink {
        self.state
            .lock()
            .links
            .last()
            .cloned()
            .expect("no peer connection was created")
    }

    pub fn sink(&self, index: usize) -> PeerEventSink {
        self.state.lock().sinks[index].clone()
    }

    /// Emit through the most recently created connection.
    pub fn emit(&self, event: PeerEvent) -> bool {
        let sink = self
            .state
            .lock()
            .sinks
            .last()
            .cloned()
            .expect("no peer connection was created");
        sink.emit(event)
    }

    pub fn reject_remote_descriptions(&self) {
        self.state.lock().reject_remote = true;
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(&self, events: PeerEventSink) -> Result<Box<dyn PeerLink>, CallError> {
        let link = MockLink::default();
        let mut state = self.state.lock();
        if state.reject_remote {
            link.reject_remote_descriptions();
        }
        state.links.push(link.clone());
        state.sinks.push(events);
        Ok(Box::new(link))
    }
}

#[derive(Default)]
pub struct MockDevices {
    deny: AtomicBool,
    requests: Mutex<Vec<MediaConstraints>>,
    streams: Mutex<Vec<LocalStream>>,
}

impl MockDevices {
    pub fn deny(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().clone()
    }

    pub fn last_stream(&self) -> Option<LocalStream> {
        self.streams.lock().last().cloned()
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, CallError> {
        self.requests.lock().push(*constraints);
        if self.deny.load(Ordering::SeqCst) {
            return Err(CallError::MediaAccess("permission denied".into()));
        }
        let mut streams = self.streams.lock();
        let n = streams.len() + 1;
        let mut tracks = vec![Arc::new(LocalTrack::detached(format!("mic-{n}"), MediaKind::Audio))];
        if constraints.wants_video() {
            tracks.push(Arc::new(LocalTrack::detached(format!("cam-{n}"), MediaKind::Video)));
        }
        let stream = LocalStream::new(format!("stream-{n}"), tracks);
        streams.push(stream.clone());
        Ok(stream)
    }
}

pub struct RecordingSignaler {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl Signaler for RecordingSignaler {
    fn send(&self, message: ClientMessage) -> Result<(), CallError> {
        self.tx
            .send(message)
            .map_err(|_| CallError::Signaling("relay connection closed".into()))
    }
}

/// Rewrite what `from` sent into what its addressee receives, the way the
/// relay does.
pub fn relay(from: &EndpointId, message: ClientMessage) -> (EndpointId, ServerMessage) {
    let from = from.clone();
    match message {
        ClientMessage::Ring {
            to,
            offer,
            from_name,
            ..
        } => (
            to,
            ServerMessage::Ring {
                from,
                offer,
                from_name,
            },
        ),
        ClientMessage::Answer { to, answer } => (to, ServerMessage::Answer { from, answer }),
        ClientMessage::Ice { to, candidate } => (to, ServerMessage::Ice { from, candidate }),
        ClientMessage::End { to, reason } => (to, ServerMessage::End { from, reason }),
        ClientMessage::Ping => panic!("ping is not routed"),
    }
}

pub fn request_id_of(message: &ClientMessage) -> u64 {
    match message {
        ClientMessage::Ring {
            request_id: Some(id),
            ..
        } => *id,
        other => panic!("expected a ring with a request id, got {other:?}"),
    }
}

/// A call session wired to doubles.
pub struct Endpoint {
    pub id: EndpointId,
    pub handle: CallHandle,
    pub connector: MockConnector,
    pub devices: Arc<MockDevices>,
    outbox: mpsc::UnboundedReceiver<ClientMessage>,
    notices: broadcast::Receiver<CallNotice>,
}

impl Endpoint {
    pub fn spawn(id: &str) -> Self {
        Self::spawn_with(id, CallConfig::default())
    }

    pub fn spawn_with(id: &str, config: CallConfig) -> Self {
        let (tx, outbox) = mpsc::unbounded_channel();
        let connector = MockConnector::default();
        let devices = Arc::new(MockDevices::default());
        let handle = CallHandle::spawn(
            config,
            SessionDeps {
                devices: devices.clone(),
                connector: Arc::new(connector.clone()),
                signaler: Arc::new(RecordingSignaler { tx }),
            },
        );
        let notices = handle.notices();
        Self {
            id: EndpointId::new(id),
            handle,
            connector,
            devices,
            outbox,
            notices,
        }
    }

    pub fn deliver(&self, message: ServerMessage) {
        self.handle.deliver(message).expect("session is running");
    }

    /// Deliver a message `from` sent to this endpoint.
    pub fn receive(&self, from: &EndpointId, message: ClientMessage) {
        let (to, message) = relay(from, message);
        assert_eq!(to, self.id, "message was addressed to {to}");
        self.deliver(message);
    }

    /// Next message this endpoint sent to the relay.
    pub async fn sent(&mut self) -> ClientMessage {
        tokio::time::timeout(WAIT, self.outbox.recv())
            .await
            .expect("timed out waiting for an outgoing message")
            .expect("signaler dropped")
    }

    pub async fn assert_nothing_sent(&mut self) {
        self.settle().await;
        if let Ok(message) = self.outbox.try_recv() {
            panic!("unexpected outgoing message: {message:?}");
        }
    }

    /// Snapshot after everything queued so far has been handled.
    pub async fn settle(&self) -> CallSnapshot {
        self.handle.current().await.expect("session is running")
    }

    pub async fn wait_for_state(&self, state: CallState) -> CallSnapshot {
        self.wait_for_state_within(state, WAIT).await
    }

    pub async fn wait_for_state_within(&self, state: CallState, within: Duration) -> CallSnapshot {
        let mut snapshots = self.handle.subscribe();
        let snapshot = tokio::time::timeout(within, snapshots.wait_for(|s| s.state == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
            .expect("session stopped");
        snapshot.clone()
    }

    pub async fn next_notice(&mut self) -> CallNotice {
        tokio::time::timeout(WAIT, self.notices.recv())
            .await
            .expect("timed out waiting for a notice")
            .expect("notice channel closed")
    }

    /// Notices published so far.
    pub async fn take_notices(&mut self) -> Vec<CallNotice> {
        self.settle().await;
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }
}

/// Ring `callee`, have it answer, and bring both transports up.
pub async fn connect_call(caller: &mut Endpoint, callee: &mut Endpoint, with_video: bool) {
    caller
        .handle
        .dial(RemoteEndpoint::new(callee.id.clone()), with_video)
        .await
        .expect("dial");
    let ring = caller.sent().await;
    caller.deliver(ServerMessage::RingAck {
        request_id: request_id_of(&ring),
        ok: true,
        error: None,
    });
    callee.receive(&caller.id, ring);
    callee.wait_for_state(CallState::Incoming).await;

    callee.handle.accept().await.expect("accept");
    let answer = callee.sent().await;
    caller.receive(&callee.id, answer);
    caller.wait_for_state(CallState::Connecting).await;

    caller
        .connector
        .emit(PeerEvent::Transport(TransportState::Connected));
    callee
        .connector
        .emit(PeerEvent::Transport(TransportState::Connected));
    caller.wait_for_state(CallState::Active).await;
    callee.wait_for_state(CallState::Active).await;
}
