//! Peer connections backed by webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use lanline_proto::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::CallError;
use crate::media::{LocalStream, RemoteTrack};
use crate::peer::{OfferOptions, PeerConnector, PeerEvent, PeerEventSink, PeerLink, TransportState};

fn transport_error(context: &str) -> impl Fn(webrtc::Error) -> CallError + '_ {
    move |err| CallError::Transport(format!("{context}: {err}"))
}

fn negotiation_error(context: &str) -> impl Fn(webrtc::Error) -> CallError + '_ {
    move |err| CallError::Negotiation(format!("{context}: {err}"))
}

pub struct RtcConnector {
    api: API,
}

impl RtcConnector {
    pub fn new() -> Result<Self, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(transport_error("failed to register codecs"))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(transport_error("failed to register interceptors"))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }

    async fn open(&self, events: PeerEventSink) -> Result<RtcLink, CallError> {
        // Both ends share a LAN segment, so host candidates are enough.
        let config = RTCConfiguration {
            ice_servers: vec![],
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(transport_error("failed to create peer connection"))?,
        );
        install_handlers(&pc, events);
        Ok(RtcLink {
            pc,
            senders: AsyncMutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(&self, events: PeerEventSink) -> Result<Box<dyn PeerLink>, CallError> {
        Ok(Box::new(self.open(events).await?))
    }
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: PeerEventSink) {
    let generation = events.generation();

    let candidate_sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = candidate_sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!(generation, "local candidate gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let address = Some(candidate.address.clone()).filter(|a| !a.is_empty());
                    sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                        address,
                    }));
                }
                Err(err) => warn!(error = %err, "failed to serialize local candidate"),
            }
        })
    }));

    let track_sink = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            debug!(generation, track = %track.id(), kind = ?track.kind(), "remote track");
            track_sink.emit(PeerEvent::RemoteTrack(RemoteTrack::from_rtc(track)));
            Box::pin(async {})
        },
    ));

    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        trace!(generation, ?state, "ice connection state");
        Box::pin(async {})
    }));

    let state_sink = events;
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!(generation, ?state, "peer connection state");
        if let Some(mapped) = transport_state(state) {
            state_sink.emit(PeerEvent::Transport(mapped));
        }
        Box::pin(async {})
    }));
}

pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    senders: AsyncMutex<Vec<Arc<RTCRtpSender>>>,
}

impl RtcLink {
    async fn has_transceiver(&self, kind: RTPCodecType) -> bool {
        self.pc
            .get_transceivers()
            .await
            .iter()
            .any(|transceiver| transceiver.kind() == kind)
    }

    async fn ensure_receiver(&self, kind: RTPCodecType) -> Result<(), CallError> {
        if self.has_transceiver(kind).await {
            return Ok(());
        }
        self.pc
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(negotiation_error("failed to add receive-only transceiver"))?;
        Ok(())
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn attach_stream(&self, stream: &LocalStream) -> Result<(), CallError> {
        let mut senders = self.senders.lock().await;
        for sender in senders.drain(..) {
            if let Err(err) = self.pc.remove_track(&sender).await {
                debug!(error = %err, "failed to detach previous track");
            }
        }
        for track in stream.tracks() {
            let Some(rtc_track) = track.rtc_track() else {
                continue;
            };
            let sender = self
                .pc
                .add_track(rtc_track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(transport_error("failed to attach local track"))?;
            // RTCP must be drained for the interceptors to keep working.
            let reader = Arc::clone(&sender);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while reader.read(&mut buf).await.is_ok() {}
            });
            senders.push(sender);
        }
        debug!(stream = stream.id(), tracks = senders.len(), "local stream attached");
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, CallError> {
        if options.receive_audio {
            self.ensure_receiver(RTPCodecType::Audio).await?;
        }
        if options.receive_video {
            self.ensure_receiver(RTPCodecType::Video).await?;
        }
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(negotiation_error("failed to create offer"))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(negotiation_error("failed to create answer"))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), CallError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(negotiation_error("failed to apply local description"))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), CallError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(negotiation_error("failed to apply remote description"))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(transport_error("failed to add remote candidate"))
    }

    async fn close(&self) -> Result<(), CallError> {
        self.pc
            .close()
            .await
            .map_err(transport_error("failed to close peer connection"))
    }
}

fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, CallError> {
    let sdp = description.sdp.clone();
    let converted = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
    };
    converted.map_err(negotiation_error("malformed session description"))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, CallError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(CallError::Negotiation(format!(
            "unsupported description type {other}"
        ))),
    }
}
