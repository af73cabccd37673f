//! The call session: a single task that owns all call state.
//!
//! User commands, relay messages, peer connection callbacks and timers are
//! all funnelled into one queue and handled in order, so no two handlers ever
//! observe a half-updated session. Every peer connection and timer is tagged
//! with the session generation it was created under; teardown bumps the
//! generation, which turns anything still in flight from the old call into a
//! no-op.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lanline_proto::{
    ClientMessage, EndReason, EndpointId, IceCandidate, SdpType, ServerMessage, SessionDescription,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::candidates::IceCandidateBuffer;
use crate::config::CallConfig;
use crate::error::{CallError, CallFailure};
use crate::media::{LocalStream, MediaConstraints, MediaDevices, RemoteStream};
use crate::peer::{
    CandidateAddress, OfferOptions, PeerConnector, PeerEvent, PeerEventSink, PeerLifecycle,
    TransportState,
};
use crate::signaling::Signaler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Calling,
    Incoming,
    Connecting,
    Active,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Incoming => "incoming",
            CallState::Connecting => "connecting",
            CallState::Active => "active",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub id: EndpointId,
    pub name: Option<String>,
}

impl RemoteEndpoint {
    pub fn new(id: impl Into<EndpointId>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Display name when known, otherwise the identifier.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Observable state of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub remote: Option<RemoteEndpoint>,
    pub has_video: bool,
    pub muted: bool,
}

/// Outcomes worth telling the user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    Failed(CallFailure),
    /// The remote party ended the call.
    Ended {
        remote: EndpointId,
        reason: EndReason,
    },
    /// A second caller was turned away because a call is in progress.
    Rejected { caller: RemoteEndpoint },
}

#[derive(Debug)]
pub enum CallCommand {
    Dial {
        remote: RemoteEndpoint,
        with_video: bool,
    },
    Accept,
    Decline,
    Hangup,
    SetMuted(bool),
    SetCamera(bool),
}

impl CallCommand {
    fn action(&self) -> &'static str {
        match self {
            CallCommand::Dial { .. } => "dial",
            CallCommand::Accept => "accept",
            CallCommand::Decline => "decline",
            CallCommand::Hangup => "hang up",
            CallCommand::SetMuted(_) => "mute",
            CallCommand::SetCamera(_) => "toggle camera",
        }
    }
}

pub(crate) enum SessionEvent {
    Command {
        command: CallCommand,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Query(oneshot::Sender<CallSnapshot>),
    Signal(ServerMessage),
    Peer {
        generation: u64,
        event: PeerEvent,
    },
    RingTimeout {
        generation: u64,
    },
    SignalingClosed,
    Shutdown(oneshot::Sender<()>),
}

/// Collaborators the session drives.
#[derive(Clone)]
pub struct SessionDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn PeerConnector>,
    pub signaler: Arc<dyn Signaler>,
}

/// Cloneable handle to a running call session.
#[derive(Clone)]
pub struct CallHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: watch::Receiver<CallSnapshot>,
    notices: broadcast::Sender<CallNotice>,
    remote_stream: Arc<RemoteStream>,
}

impl CallHandle {
    /// Start a session task on the current runtime.
    pub fn spawn(config: CallConfig, deps: SessionDeps) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
        let (notices_tx, _) = broadcast::channel(32);
        let remote_stream = Arc::new(RemoteStream::new());

        let session = CallSession {
            config,
            state: CallState::Idle,
            remote: None,
            has_video: false,
            muted: false,
            pending_offer: None,
            local_stream: None,
            peer: PeerLifecycle::new(deps.connector),
            candidates: IceCandidateBuffer::new(),
            generation: 0,
            pending_ring: None,
            next_request_id: 0,
            ring_timer: None,
            devices: deps.devices,
            signaler: deps.signaler,
            remote_stream: remote_stream.clone(),
            events: events_tx.downgrade(),
            snapshot: snapshot_tx,
            notices: notices_tx.clone(),
        };
        tokio::spawn(session.run(events_rx));

        Self {
            events: events_tx,
            snapshot: snapshot_rx,
            notices: notices_tx,
            remote_stream,
        }
    }

    pub async fn dial(&self, remote: RemoteEndpoint, with_video: bool) -> Result<(), CallError> {
        self.command(CallCommand::Dial { remote, with_video }).await
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.command(CallCommand::Accept).await
    }

    pub async fn decline(&self) -> Result<(), CallError> {
        self.command(CallCommand::Decline).await
    }

    pub async fn hangup(&self) -> Result<(), CallError> {
        self.command(CallCommand::Hangup).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.command(CallCommand::SetMuted(muted)).await
    }

    pub async fn set_camera(&self, enabled: bool) -> Result<(), CallError> {
        self.command(CallCommand::SetCamera(enabled)).await
    }

    async fn command(&self, command: CallCommand) -> Result<(), CallError> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(SessionEvent::Command { command, reply })
            .map_err(|_| CallError::SessionClosed)?;
        response.await.map_err(|_| CallError::SessionClosed)?
    }

    /// Hand a message received from the relay to the session.
    pub fn deliver(&self, message: ServerMessage) -> Result<(), CallError> {
        self.events
            .send(SessionEvent::Signal(message))
            .map_err(|_| CallError::SessionClosed)
    }

    /// Forward everything the relay connection receives into the session.
    pub fn attach_inbound(&self, mut inbound: mpsc::UnboundedReceiver<ServerMessage>) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if events.send(SessionEvent::Signal(message)).is_err() {
                    return;
                }
            }
            let _ = events.send(SessionEvent::SignalingClosed);
        })
    }

    /// Last published snapshot.
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    /// Snapshot taken after every event queued before this call was handled.
    pub async fn current(&self) -> Result<CallSnapshot, CallError> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(SessionEvent::Query(reply))
            .map_err(|_| CallError::SessionClosed)?;
        response.await.map_err(|_| CallError::SessionClosed)
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    pub fn remote_stream(&self) -> Arc<RemoteStream> {
        self.remote_stream.clone()
    }

    /// Tear down any call and stop the session task.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.events.send(SessionEvent::Shutdown(done)).is_ok() {
            let _ = finished.await;
        }
    }
}

struct CallSession {
    config: CallConfig,
    state: CallState,
    remote: Option<RemoteEndpoint>,
    has_video: bool,
    muted: bool,
    pending_offer: Option<SessionDescription>,
    local_stream: Option<LocalStream>,
    peer: PeerLifecycle,
    candidates: IceCandidateBuffer,
    generation: u64,
    pending_ring: Option<u64>,
    next_request_id: u64,
    ring_timer: Option<JoinHandle<()>>,
    devices: Arc<dyn MediaDevices>,
    signaler: Arc<dyn Signaler>,
    remote_stream: Arc<RemoteStream>,
    events: mpsc::WeakUnboundedSender<SessionEvent>,
    snapshot: watch::Sender<CallSnapshot>,
    notices: broadcast::Sender<CallNotice>,
}

impl CallSession {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Command { command, reply } => {
                    let result = self.handle_command(command).await;
                    let _ = reply.send(result);
                }
                SessionEvent::Query(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                SessionEvent::Signal(message) => self.handle_signal(message).await,
                SessionEvent::Peer { generation, event } => {
                    if generation != self.generation {
                        trace!(generation, current = self.generation, "dropping stale peer event");
                        continue;
                    }
                    self.handle_peer_event(event).await;
                }
                SessionEvent::RingTimeout { generation } => {
                    if generation == self.generation && self.state == CallState::Calling {
                        self.ring_timed_out().await;
                    }
                }
                SessionEvent::SignalingClosed => self.signaling_closed().await,
                SessionEvent::Shutdown(done) => {
                    self.teardown().await;
                    let _ = done.send(());
                    return;
                }
            }
        }
        self.teardown().await;
        debug!("call session stopped");
    }

    async fn handle_command(&mut self, command: CallCommand) -> Result<(), CallError> {
        let action = command.action();
        match command {
            CallCommand::Dial { remote, with_video } => {
                self.require(action, |s| s == CallState::Idle)?;
                self.dial(remote, with_video).await
            }
            CallCommand::Accept => {
                self.require(action, |s| s == CallState::Incoming)?;
                self.accept().await
            }
            CallCommand::Decline => {
                self.require(action, |s| s == CallState::Incoming)?;
                info!(remote = ?self.remote_id(), "declining call");
                self.send_end(EndReason::Decline);
                self.teardown().await;
                Ok(())
            }
            CallCommand::Hangup => {
                self.require(action, |s| s != CallState::Idle)?;
                info!(remote = ?self.remote_id(), state = %self.state, "hanging up");
                self.send_end(EndReason::Hangup);
                self.teardown().await;
                Ok(())
            }
            CallCommand::SetMuted(muted) => {
                self.require(action, |s| s != CallState::Idle)?;
                self.muted = muted;
                self.apply_mute();
                self.publish();
                Ok(())
            }
            CallCommand::SetCamera(enabled) => {
                self.require(action, |s| s != CallState::Idle)?;
                if let Some(track) = self.local_stream.as_ref().and_then(|s| s.video_tracks().next()) {
                    track.set_enabled(enabled);
                }
                Ok(())
            }
        }
    }

    fn require(
        &self,
        action: &'static str,
        allowed: impl Fn(CallState) -> bool,
    ) -> Result<(), CallError> {
        if allowed(self.state) {
            Ok(())
        } else {
            Err(CallError::InvalidState {
                action,
                state: self.state,
            })
        }
    }

    async fn dial(&mut self, remote: RemoteEndpoint, with_video: bool) -> Result<(), CallError> {
        info!(remote = %remote.id, video = with_video, "placing call");
        self.remote = Some(remote.clone());
        self.has_video = with_video;
        self.enter(CallState::Calling);

        let stream = match self
            .devices
            .acquire(&MediaConstraints::for_call(with_video))
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "could not acquire local media");
                self.fail(CallFailure::from_error(&err)).await;
                return Err(err);
            }
        };

        match self.send_ring(stream, &remote, with_video).await {
            Ok(()) => {
                self.arm_ring_timeout();
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, remote = %remote.id, "could not place call");
                self.fail(CallFailure::from_error(&err)).await;
                Err(err)
            }
        }
    }

    async fn send_ring(
        &mut self,
        stream: LocalStream,
        remote: &RemoteEndpoint,
        with_video: bool,
    ) -> Result<(), CallError> {
        self.install_stream(stream);
        let sink = self.peer_sink()?;
        let offer = {
            let link = self.peer.ensure(sink).await?;
            if let Some(stream) = self.local_stream.as_ref() {
                link.attach_stream(stream).await?;
            }
            let offer = link
                .create_offer(OfferOptions {
                    receive_audio: true,
                    receive_video: with_video,
                })
                .await?;
            link.set_local_description(&offer).await?;
            offer
        };

        self.next_request_id += 1;
        let request_id = self.next_request_id;
        self.pending_ring = Some(request_id);
        self.signaler.send(ClientMessage::Ring {
            to: remote.id.clone(),
            offer,
            from_name: self.config.display_name.clone(),
            request_id: Some(request_id),
        })
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        let (Some(offer), Some(remote)) = (self.pending_offer.clone(), self.remote.clone()) else {
            return Err(CallError::InvalidState {
                action: "accept",
                state: self.state,
            });
        };
        info!(remote = %remote.id, video = self.has_video, "accepting call");

        let stream = match self
            .devices
            .acquire(&MediaConstraints::for_call(self.has_video))
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "could not acquire local media");
                self.send_end(EndReason::Decline);
                self.fail(CallFailure::from_error(&err)).await;
                return Err(err);
            }
        };

        match self.send_answer(stream, &offer, &remote).await {
            Ok(()) => {
                self.pending_offer = None;
                self.enter(CallState::Connecting);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, remote = %remote.id, "could not answer call");
                self.send_end(EndReason::Hangup);
                self.fail(CallFailure::from_error(&err)).await;
                Err(err)
            }
        }
    }

    async fn send_answer(
        &mut self,
        stream: LocalStream,
        offer: &SessionDescription,
        remote: &RemoteEndpoint,
    ) -> Result<(), CallError> {
        self.install_stream(stream);
        let sink = self.peer_sink()?;
        let answer = {
            let link = self.peer.ensure(sink).await?;
            if let Some(stream) = self.local_stream.as_ref() {
                link.attach_stream(stream).await?;
            }
            link.set_remote_description(offer).await?;
            self.candidates.mark_remote_description_set();
            self.candidates.flush(link).await;
            let answer = link.create_answer().await?;
            link.set_local_description(&answer).await?;
            answer
        };
        self.signaler.send(ClientMessage::Answer {
            to: remote.id.clone(),
            answer,
        })
    }

    async fn handle_signal(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Ring {
                from,
                offer,
                from_name,
            } => {
                let caller = RemoteEndpoint {
                    id: from,
                    name: from_name,
                };
                self.on_ring(caller, offer).await;
            }
            ServerMessage::Answer { from, answer } => self.on_answer(from, answer).await,
            ServerMessage::Ice { from, candidate } => self.on_remote_candidate(from, candidate).await,
            ServerMessage::End { from, reason } => self.on_end(from, reason).await,
            ServerMessage::RingAck {
                request_id,
                ok,
                error,
            } => self.on_ring_ack(request_id, ok, error).await,
            ServerMessage::Undelivered { kind, to } => {
                debug!(%kind, %to, "relay could not deliver message");
            }
            ServerMessage::Welcome { endpoint, .. } => {
                debug!(%endpoint, "relay registration confirmed");
            }
            ServerMessage::Pong => trace!("pong"),
            ServerMessage::Error { message } => warn!(%message, "relay reported an error"),
        }
    }

    async fn on_ring(&mut self, caller: RemoteEndpoint, offer: SessionDescription) {
        if offer.kind != SdpType::Offer {
            warn!(from = %caller.id, "ignoring ring without an offer");
            return;
        }
        if self.state != CallState::Idle && self.is_remote(&caller.id) {
            // The current remote rang again, so it restarted its side of the call.
            if self.state == CallState::Incoming {
                info!(from = %caller.id, video = offer.has_video(), "caller rang again; replacing offer");
                self.has_video = offer.has_video();
                self.remote = Some(caller);
                self.pending_offer = Some(offer);
                self.candidates = IceCandidateBuffer::new();
                self.publish();
                return;
            }
            info!(from = %caller.id, state = %self.state, "caller restarted the call");
            self.teardown().await;
        }
        if self.state != CallState::Idle {
            info!(from = %caller.id, state = %self.state, "busy; rejecting incoming ring");
            if let Err(err) = self.signaler.send(ClientMessage::End {
                to: caller.id.clone(),
                reason: EndReason::Busy,
            }) {
                debug!(error = %err, "could not send busy reply");
            }
            self.notify(CallNotice::Rejected { caller });
            return;
        }

        info!(from = %caller.id, name = ?caller.name, video = offer.has_video(), "incoming call");
        self.has_video = offer.has_video();
        self.remote = Some(caller);
        self.pending_offer = Some(offer);
        self.enter(CallState::Incoming);
    }

    async fn on_answer(&mut self, from: EndpointId, answer: SessionDescription) {
        if self.state != CallState::Calling || !self.is_remote(&from) {
            debug!(%from, state = %self.state, "ignoring unexpected answer");
            return;
        }
        let Some(link) = self.peer.current() else {
            self.abort_negotiation(CallError::Negotiation("no peer connection".into()))
                .await;
            return;
        };
        let applied = link.set_remote_description(&answer).await;
        if let Err(err) = applied {
            self.abort_negotiation(err).await;
            return;
        }
        self.candidates.mark_remote_description_set();
        self.candidates.flush(link).await;

        self.pending_ring = None;
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
        info!(remote = %from, "call answered");
        self.enter(CallState::Connecting);
    }

    async fn on_remote_candidate(&mut self, from: EndpointId, candidate: IceCandidate) {
        if self.state == CallState::Idle || !self.is_remote(&from) {
            trace!(%from, "ignoring candidate outside the current call");
            return;
        }
        let outcome = self.candidates.add(self.peer.current(), candidate).await;
        trace!(?outcome, "remote candidate");
    }

    async fn on_end(&mut self, from: EndpointId, reason: EndReason) {
        if self.state == CallState::Idle || !self.is_remote(&from) {
            debug!(%from, %reason, "ignoring end outside the current call");
            return;
        }
        info!(remote = %from, %reason, "remote ended the call");
        self.notify(CallNotice::Ended {
            remote: from,
            reason,
        });
        self.teardown().await;
    }

    async fn on_ring_ack(&mut self, request_id: u64, ok: bool, error: Option<String>) {
        if self.pending_ring != Some(request_id) {
            trace!(request_id, "ignoring stale ring acknowledgment");
            return;
        }
        self.pending_ring = None;
        if ok {
            debug!(request_id, "ring delivered");
            return;
        }
        let detail = error.unwrap_or_else(|| "not connected".into());
        warn!(remote = ?self.remote_id(), %detail, "ring could not be delivered");
        self.fail(CallFailure::Unreachable(detail)).await;
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate),
            PeerEvent::RemoteTrack(track) => {
                let (id, kind) = (track.id.clone(), track.kind);
                if self.remote_stream.add_track(track) {
                    debug!(track = %id, %kind, "remote track added");
                } else {
                    trace!(track = %id, "remote track already present");
                }
            }
            PeerEvent::Transport(state) => self.on_transport_state(state).await,
        }
    }

    fn on_local_candidate(&mut self, candidate: IceCandidate) {
        if !self.config.candidate_policy.allows(&candidate) {
            debug!(
                address = ?CandidateAddress::of(&candidate),
                "dropping candidate outside the deployment address family"
            );
            return;
        }
        let Some(remote) = &self.remote else {
            trace!("no remote party; dropping local candidate");
            return;
        };
        if let Err(err) = self.signaler.send(ClientMessage::Ice {
            to: remote.id.clone(),
            candidate,
        }) {
            debug!(error = %err, "could not send local candidate");
        }
    }

    async fn on_transport_state(&mut self, transport: TransportState) {
        match transport {
            TransportState::Connected => {
                if !matches!(self.state, CallState::Idle | CallState::Active) {
                    info!(remote = ?self.remote_id(), "call connected");
                    self.enter(CallState::Active);
                }
            }
            TransportState::Failed | TransportState::Closed => {
                if matches!(self.state, CallState::Connecting | CallState::Active) {
                    warn!(remote = ?self.remote_id(), state = %transport, "call connection lost");
                    self.notify(CallNotice::Failed(CallFailure::Connectivity(transport)));
                } else {
                    debug!(state = %transport, "transport ended before the call was set up");
                }
                self.teardown().await;
            }
            TransportState::Disconnected => {
                info!("transport disconnected; waiting for it to recover");
            }
            TransportState::New | TransportState::Connecting => {
                trace!(state = %transport, "transport progress");
            }
        }
    }

    async fn ring_timed_out(&mut self) {
        info!(remote = ?self.remote_id(), "ring went unanswered");
        self.send_end(EndReason::Timeout);
        self.fail(CallFailure::Unanswered).await;
    }

    async fn signaling_closed(&mut self) {
        warn!("relay connection closed");
        if self.state == CallState::Calling {
            self.fail(CallFailure::Unreachable("lost connection to relay".into()))
                .await;
        }
    }

    async fn abort_negotiation(&mut self, err: CallError) {
        warn!(error = %err, "negotiation failed");
        self.send_end(EndReason::Hangup);
        self.fail(CallFailure::Negotiation(err.to_string())).await;
    }

    async fn fail(&mut self, failure: CallFailure) {
        self.notify(CallNotice::Failed(failure));
        self.teardown().await;
    }

    /// Return to idle, releasing everything the call held. Safe to call
    /// any number of times.
    async fn teardown(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
        let in_call = self.state != CallState::Idle
            || self.peer.is_open()
            || self.local_stream.is_some()
            || self.remote.is_some();
        if !in_call {
            return;
        }

        self.generation += 1;
        let closed = self.peer.close().await;
        if let Some(stream) = self.local_stream.take() {
            stream.stop();
        }
        let removed_tracks = self.remote_stream.clear();
        self.candidates = IceCandidateBuffer::new();
        self.remote = None;
        self.pending_offer = None;
        self.pending_ring = None;
        self.has_video = false;
        self.muted = false;
        self.state = CallState::Idle;
        self.publish();
        info!(
            generation = self.generation,
            peer_closed = closed,
            removed_tracks,
            "call torn down"
        );
    }

    fn send_end(&self, reason: EndReason) {
        let Some(remote) = &self.remote else {
            return;
        };
        if let Err(err) = self.signaler.send(ClientMessage::End {
            to: remote.id.clone(),
            reason,
        }) {
            debug!(error = %err, %reason, "could not notify remote party");
        }
    }

    fn arm_ring_timeout(&mut self) {
        let Some(timeout) = self.config.ring_timeout else {
            return;
        };
        let Some(events) = self.events.upgrade() else {
            return;
        };
        let generation = self.generation;
        self.ring_timer = Some(tokio::spawn(ring_timer(events, generation, timeout)));
    }

    fn install_stream(&mut self, stream: LocalStream) {
        if let Some(previous) = self.local_stream.replace(stream) {
            previous.stop();
        }
        self.apply_mute();
    }

    fn apply_mute(&self) {
        if let Some(stream) = &self.local_stream {
            for track in stream.audio_tracks() {
                track.set_enabled(!self.muted);
            }
        }
    }

    fn peer_sink(&self) -> Result<PeerEventSink, CallError> {
        let events = self.events.upgrade().ok_or(CallError::SessionClosed)?;
        Ok(PeerEventSink::new(self.generation, events))
    }

    fn is_remote(&self, id: &EndpointId) -> bool {
        self.remote.as_ref().is_some_and(|remote| &remote.id == id)
    }

    fn remote_id(&self) -> Option<&EndpointId> {
        self.remote.as_ref().map(|remote| &remote.id)
    }

    fn enter(&mut self, state: CallState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "call state");
            self.state = state;
        }
        self.publish();
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: self.state,
            remote: self.remote.clone(),
            has_video: self.has_video,
            muted: self.muted,
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.snapshot());
    }

    fn notify(&self, notice: CallNotice) {
        let _ = self.notices.send(notice);
    }
}

async fn ring_timer(events: mpsc::UnboundedSender<SessionEvent>, generation: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let _ = events.send(SessionEvent::RingTimeout { generation });
}
