use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt::Formatter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            RTPCodecType::Unspecified => None,
        }
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        match self {
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
        }
    }
}

impl From<MediaKind> for RTPCodecType {
    fn from(value: MediaKind) -> Self {
        match value {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        }
    }
}

/// Locally produced media track. Samples written to a stopped or disabled
/// track are dropped.
pub struct LocalTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let track = TrackLocalStaticSample::new(kind.codec(), id.into(), stream_id.into());
        LocalTrack {
            kind,
            track: Arc::new(track),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        self.track.id()
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

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Track handle understood by webrtc-rs senders.
    pub fn rtc(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    pub async fn write_sample(&self, sample: &Sample) -> Result<(), Error> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(());
        }
        self.track.write_sample(sample).await?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Which local tracks [crate::registry::PeerRegistry::create_stream] should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for StreamConstraints {
    fn default() -> Self {
        StreamConstraints {
            audio: true,
            video: true,
        }
    }
}

/// A group of local tracks sharing one stream id.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: Arc<str>,
    tracks: Vec<Arc<LocalTrack>>,
}

impl MediaStream {
    pub fn new(id: &str, tracks: Vec<Arc<LocalTrack>>) -> Self {
        MediaStream {
            id: Arc::from(id),
            tracks,
        }
    }

    pub fn with_constraints(id: &str, constraints: StreamConstraints) -> Self {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::new(
                MediaKind::Audio,
                format!("{id}-audio"),
                id,
            )));
        }
        if constraints.video {
            tracks.push(Arc::new(LocalTrack::new(
                MediaKind::Video,
                format!("{id}-video"),
                id,
            )));
        }
        MediaStream::new(id, tracks)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn stop(&self) {
        for track in self.tracks.iter() {
            track.stop();
        }
    }
}

/// Track received from the remote side of a connection.
#[derive(Clone)]
pub struct RemoteTrack {
    id: Arc<str>,
    stream_id: Arc<str>,
    kind: MediaKind,
    track: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: &str, stream_id: &str, kind: MediaKind) -> Self {
        RemoteTrack {
            id: Arc::from(id),
            stream_id: Arc::from(stream_id),
            kind,
            track: None,
        }
    }

    pub fn from_rtc(track: Arc<TrackRemote>) -> Option<Self> {
        let kind = MediaKind::from_codec_type(track.kind())?;
        Some(RemoteTrack {
            id: Arc::from(track.id()),
            stream_id: Arc::from(track.stream_id()),
            kind,
            track: Some(track),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Underlying webrtc-rs track, used to read RTP packets.
    pub fn rtc(&self) -> Option<&Arc<TrackRemote>> {
        self.track.as_ref()
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Playable composition of remote tracks.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    id: Arc<str>,
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn new(id: &str, tracks: Vec<RemoteTrack>) -> Self {
        RemoteStream {
            id: Arc::from(id),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }
}

/// Destination for composed remote media, the counterpart of a video element.
pub trait MediaSink: Send + Sync {
    fn attach(&self, stream: RemoteStream);
    fn detach(&self);
}

/// Active recording of a contact's media.
pub trait Recorder: Send + Sync {
    fn stop(&self) -> Result<(), Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDevice {
    pub device_id: String,
    pub kind: String,
    pub label: String,
}

#[async_trait::async_trait]
pub trait DeviceProvider: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<MediaDevice>, Error>;
}

/// Buffers remote tracks until the announced number of tracks has arrived and
/// then composes them into a [RemoteStream]. Composition happens at most once.
#[derive(Debug, Default)]
pub struct StreamComposer {
    expected: usize,
    buffered: Vec<RemoteTrack>,
    composed: bool,
}

impl StreamComposer {
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_composed(&self) -> bool {
        self.composed
    }

    /// Announces how many tracks the remote side is going to send.
    pub fn expect(&mut self, count: usize) -> Option<RemoteStream> {
        if self.composed {
            return None;
        }
        self.expected = count;
        self.try_compose()
    }

    pub fn push(&mut self, track: RemoteTrack) -> Option<RemoteStream> {
        if self.composed {
            return None;
        }
        self.buffered.push(track);
        self.try_compose()
    }

    pub fn clear(&mut self) {
        self.buffered.clear();
        self.expected = 0;
        self.composed = false;
    }

    fn try_compose(&mut self) -> Option<RemoteStream> {
        if self.expected == 0 || self.buffered.len() < self.expected {
            return None;
        }
        self.composed = true;
        let tracks: Vec<_> = self.buffered.drain(..self.expected).collect();
        self.buffered.clear();
        let id = tracks[0].stream_id().to_owned();
        Some(RemoteStream::new(&id, tracks))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn track(n: usize) -> RemoteTrack {
        let kind = if n % 2 == 0 {
            MediaKind::Audio
        } else {
            MediaKind::Video
        };
        RemoteTrack::new(&format!("t{n}"), "remote", kind)
    }

    #[test]
    fn composes_once_when_count_matches() {
        let mut composer = StreamComposer::default();
        assert!(composer.expect(2).is_none());
        assert!(composer.push(track(0)).is_none());
        let stream = composer.push(track(1)).expect("composed after second track");
        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(stream.tracks()[0].id(), "t0");
        assert_eq!(stream.tracks()[1].id(), "t1");
        assert!(composer.push(track(2)).is_none());
        assert!(composer.expect(3).is_none());
        assert!(composer.is_composed());
    }

    #[test]
    fn late_expectation_composes_buffered_tracks() {
        let mut composer = StreamComposer::default();
        assert!(composer.push(track(0)).is_none());
        assert!(composer.push(track(1)).is_none());
        let stream = composer.expect(2).expect("composed on expectation");
        assert_eq!(stream.id(), "remote");
    }

    #[test]
    fn muting_stream_disables_only_matching_kind() {
        let stream = MediaStream::with_constraints("local", StreamConstraints::default());
        stream.set_enabled(MediaKind::Audio, false);
        let audio = stream.tracks_of(MediaKind::Audio).next().unwrap();
        let video = stream.tracks_of(MediaKind::Video).next().unwrap();
        assert!(!audio.is_enabled());
        assert!(video.is_enabled());
        stream.stop();
        assert!(audio.is_stopped() && video.is_stopped());
    }
}
