//! Local capture tracks and the long-lived remote stream container.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            frame_rate: 24,
        }
    }
}

/// What to capture for a call. Audio is always requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn for_call(with_video: bool) -> Self {
        Self {
            audio: true,
            video: with_video.then(VideoConstraints::default),
        }
    }

    pub fn wants_video(&self) -> bool {
        self.video.is_some()
    }
}

/// A captured track. Disabling it mutes the track without renegotiating;
/// stopping it releases the capture for good.
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    sink: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalTrack {
    /// Track backed by a sample sink that can be attached to a peer connection.
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let id = format!("{kind}-{}", uuid::Uuid::new_v4());
        let codec = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let sink = TrackLocalStaticSample::new(codec, id.clone(), stream_id.to_owned());
        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            sink: Some(Arc::new(sink)),
        }
    }

    /// Track with no media sink.
    pub fn detached(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            sink: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!(track = %self.id, kind = %self.kind, "local track stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn rtc_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.sink.clone()
    }

    /// Write one encoded sample. Returns false when the sample was withheld
    /// because the track is muted, stopped, or detached.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, CallError> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(false);
        }
        let Some(sink) = &self.sink else {
            return Ok(false);
        };
        sink.write_sample(sample)
            .await
            .map_err(|e| CallError::Transport(format!("failed to write {} sample: {e}", self.kind)))?;
        Ok(true)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Video)
    }

    pub fn has_video(&self) -> bool {
        self.video_tracks().next().is_some()
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Source of local capture for calls.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, CallError>;
}

/// Devices whose tracks are fed by the application through
/// [`LocalTrack::write_sample`].
#[derive(Debug, Default, Clone)]
pub struct SampleDevices;

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, CallError> {
        if !constraints.audio && !constraints.wants_video() {
            return Err(CallError::MediaAccess("no media requested".into()));
        }
        let stream_id = format!("lanline-{}", uuid::Uuid::new_v4());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Audio, &stream_id)));
        }
        if constraints.wants_video() {
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Video, &stream_id)));
        }
        Ok(LocalStream::new(stream_id, tracks))
    }
}

#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: String,
    source: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn from_rtc(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        Self {
            id: track.id(),
            kind,
            stream_id: track.stream_id(),
            source: Some(track),
        }
    }

    pub fn detached(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: String::new(),
            source: None,
        }
    }

    /// The underlying RTP track, for reading media.
    pub fn source(&self) -> Option<Arc<TrackRemote>> {
        self.source.clone()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Container for the remote party's tracks. One instance lives as long as the
/// process; calls add to it and teardown empties it, so consumers can hold on
/// to it across calls.
pub struct RemoteStream {
    tracks: Mutex<Vec<RemoteTrack>>,
    changes: watch::Sender<u64>,
}

impl RemoteStream {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            tracks: Mutex::new(Vec::new()),
            changes,
        }
    }

    /// Returns false if a track with the same id is already present.
    pub fn add_track(&self, track: RemoteTrack) -> bool {
        {
            let mut tracks = self.tracks.lock();
            if tracks.iter().any(|existing| existing.id == track.id) {
                return false;
            }
            tracks.push(track);
        }
        self.changes.send_modify(|version| *version += 1);
        true
    }

    /// Remove every track, returning how many were removed.
    pub fn clear(&self) -> usize {
        let removed = std::mem::take(&mut *self.tracks.lock()).len();
        if removed > 0 {
            self.changes.send_modify(|version| *version += 1);
        }
        removed
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.lock().clone()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.lock().iter().map(|t| t.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }

    pub fn has_video(&self) -> bool {
        self.tracks.lock().iter().any(|t| t.kind == MediaKind::Video)
    }

    /// Receiver that observes a version number bumped on every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

impl Default for RemoteStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn duplicate_track_ids_are_merged_once() {
        let stream = RemoteStream::new();
        let mut changes = stream.subscribe();

        assert!(stream.add_track(RemoteTrack::detached("a1", MediaKind::Audio)));
        assert!(!stream.add_track(RemoteTrack::detached("a1", MediaKind::Audio)));
        assert!(stream.add_track(RemoteTrack::detached("v1", MediaKind::Video)));

        assert_eq!(stream.track_ids(), vec!["a1".to_string(), "v1".to_string()]);
        assert!(stream.has_video());
        assert_eq!(*changes.borrow_and_update(), 2);
    }

    #[test_timeout::timeout]
    fn clear_empties_the_same_container() {
        let stream = RemoteStream::new();
        stream.add_track(RemoteTrack::detached("a1", MediaKind::Audio));
        assert_eq!(stream.clear(), 1);
        assert!(stream.is_empty());
        assert_eq!(stream.clear(), 0);

        assert!(stream.add_track(RemoteTrack::detached("a1", MediaKind::Audio)));
        assert_eq!(stream.len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn muted_track_withholds_samples() {
        let track = LocalTrack::detached("mic", MediaKind::Audio);
        track.set_enabled(false);
        let written = track.write_sample(&Sample::default()).await.unwrap();
        assert!(!written);
        assert!(!track.is_stopped());

        track.stop();
        track.stop();
        assert!(track.is_stopped());
    }

    #[test_timeout::tokio_timeout_test]
    async fn sample_devices_honour_constraints() {
        let devices = SampleDevices;
        let audio_only = devices.acquire(&MediaConstraints::for_call(false)).await.unwrap();
        assert_eq!(audio_only.tracks().len(), 1);
        assert!(!audio_only.has_video());

        let with_video = devices.acquire(&MediaConstraints::for_call(true)).await.unwrap();
        assert!(with_video.has_video());
        assert_eq!(with_video.audio_tracks().count(), 1);
        assert!(with_video.tracks().iter().all(|t| t.rtc_track().is_some()));
    }
}
