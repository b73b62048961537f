use crate::config::Options;
use crate::data_channel::DataChannel;
use crate::error::Error;
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        }
    }
}

/// Session description as it travels over signalling and REST: `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }

    fn from_rtc(desc: &RTCSessionDescription) -> Option<Self> {
        let sdp_type = match desc.sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Rollback => SdpType::Rollback,
            RTCSdpType::Unspecified => return None,
        };
        Some(SessionDescription {
            sdp_type,
            sdp: desc.sdp.clone(),
        })
    }

    fn to_rtc(&self) -> Result<RTCSessionDescription, Error> {
        let desc = match self.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(self.sdp.clone())?,
            SdpType::Answer => RTCSessionDescription::answer(self.sdp.clone())?,
            SdpType::Pranswer => RTCSessionDescription::pranswer(self.sdp.clone())?,
            SdpType::Rollback => {
                let mut desc = RTCSessionDescription::default();
                desc.sdp_type = RTCSdpType::Rollback;
                desc
            }
        };
        Ok(desc)
    }

    /// Number of audio/video sections in which the author of this description
    /// is going to send media.
    pub fn sending_media_count(&self) -> usize {
        count_sending_media(&self.sdp)
    }
}

fn count_sending_media(sdp: &str) -> usize {
    let mut reader = Cursor::new(sdp.as_bytes());
    let parsed = match webrtc::sdp::description::session::SessionDescription::unmarshal(&mut reader)
    {
        Ok(parsed) => parsed,
        Err(e) => {
            log::debug!("cannot parse session description: {e}");
            return 0;
        }
    };
    parsed
        .media_descriptions
        .iter()
        .filter(|md| matches!(md.media_name.media.as_str(), "audio" | "video"))
        .filter(|md| {
            !md.attributes
                .iter()
                .any(|a| a.key == "recvonly" || a.key == "inactive")
        })
        .count()
}

/// What a new transceiver is created from.
#[derive(Debug, Clone)]
pub enum TransceiverSource {
    Kind(MediaKind),
    Track(Arc<LocalTrack>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverInfo {
    /// Media id, assigned once the transceiver took part in a local description.
    pub mid: Option<String>,
    pub kind: MediaKind,
    pub direction: RTCRtpTransceiverDirection,
    /// Id of the track currently attached to the sender.
    pub track_id: Option<String>,
}

/// Notifications raised by a [Connection].
#[derive(Debug)]
pub enum ConnectionEvent {
    IceCandidate(RTCIceCandidateInit),
    IceConnectionState(RTCIceConnectionState),
    ConnectionState(RTCPeerConnectionState),
    NegotiationNeeded,
    Track(RemoteTrack),
    /// Data channel opened by the remote side.
    DataChannel(DataChannel),
}

/// Peer connection operations used by a contact peer.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, Error>;
    async fn create_answer(&self) -> Result<SessionDescription, Error>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), Error>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), Error>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn remote_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error>;
    async fn add_track(&self, track: &LocalTrack) -> Result<(), Error>;
    async fn add_transceiver(
        &self,
        source: TransceiverSource,
        direction: RTCRtpTransceiverDirection,
    ) -> Result<(), Error>;
    async fn transceivers(&self) -> Vec<TransceiverInfo>;
    /// Detaches every local track from its sender. Returns how many were removed.
    async fn remove_senders(&self) -> Result<usize, Error>;
    async fn create_data_channel(&self, label: &str) -> Result<DataChannel, Error>;
    async fn close(&self) -> Result<(), Error>;
}

/// Creates connections for new contact peers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        options: &Options,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn Connection>, Error>;
}

/// [Connector] producing webrtc-rs peer connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcConnector;

#[async_trait]
impl Connector for RtcConnector {
    async fn connect(
        &self,
        options: &Options,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn Connection>, Error> {
        Ok(Arc::new(RtcConnection::start(options, events).await?))
    }
}

/// webrtc-rs peer connection forwarding its callbacks as [ConnectionEvent]s.
pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
}

impl RtcConnection {
    pub async fn start(
        options: &Options,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Result<Self, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // every peer connection needs its own interceptor registry (NACKs, RTCP reports)
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(options.rtc_config()).await?);

        {
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                let _ = events.send(ConnectionEvent::ConnectionState(s));
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_ice_connection_state_change(Box::new(move |s| {
                let _ = events.send(ConnectionEvent::IceConnectionState(s));
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(ConnectionEvent::IceCandidate(init));
                        }
                        Err(e) => log::warn!("failed to serialize local ICE candidate: {e}"),
                    }
                }
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_negotiation_needed(Box::new(move || {
                let _ = events.send(ConnectionEvent::NegotiationNeeded);
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                match RemoteTrack::from_rtc(track) {
                    Some(track) => {
                        let _ = events.send(ConnectionEvent::Track(track));
                    }
                    None => log::debug!("ignoring remote track of unspecified kind"),
                }
                Box::pin(async move {})
            }));
        }
        {
            pc.on_data_channel(Box::new(move |dc| {
                let _ = events.send(ConnectionEvent::DataChannel(DataChannel::new(dc)));
                Box::pin(async move {})
            }));
        }

        Ok(RtcConnection { pc })
    }
}

impl AsRef<RTCPeerConnection> for RtcConnection {
    fn as_ref(&self) -> &RTCPeerConnection {
        &self.pc
    }
}

#[async_trait]
impl Connection for RtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self.pc.create_offer(None).await?;
        SessionDescription::from_rtc(&offer)
            .ok_or_else(|| Error::InvalidDescription("offer without type".into()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let answer = self.pc.create_answer(None).await?;
        SessionDescription::from_rtc(&answer)
            .ok_or_else(|| Error::InvalidDescription("answer without type".into()))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), Error> {
        self.pc.set_local_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), Error> {
        self.pc.set_remote_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        SessionDescription::from_rtc(&desc)
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.remote_description().await?;
        SessionDescription::from_rtc(&desc)
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), Error> {
        self.pc.add_track(track.rtc()).await?;
        Ok(())
    }

    async fn add_transceiver(
        &self,
        source: TransceiverSource,
        direction: RTCRtpTransceiverDirection,
    ) -> Result<(), Error> {
        match source {
            TransceiverSource::Kind(kind) => {
                // webrtc-rs creates kind-only transceivers as sending or receiving only,
                // an inactive placeholder is negotiated as recvonly
                let direction = match direction {
                    RTCRtpTransceiverDirection::Inactive
                    | RTCRtpTransceiverDirection::Unspecified => {
                        RTCRtpTransceiverDirection::Recvonly
                    }
                    other => other,
                };
                let init = RTCRtpTransceiverInit {
                    direction,
                    send_encodings: vec![],
                };
                self.pc
                    .add_transceiver_from_kind(kind.into(), Some(init))
                    .await?;
            }
            TransceiverSource::Track(track) => {
                let init = RTCRtpTransceiverInit {
                    direction,
                    send_encodings: vec![],
                };
                self.pc
                    .add_transceiver_from_track(track.rtc(), Some(init))
                    .await?;
            }
        }
        Ok(())
    }

    async fn transceivers(&self) -> Vec<TransceiverInfo> {
        let mut result = Vec::new();
        for transceiver in self.pc.get_transceivers().await {
            let Some(kind) = MediaKind::from_codec_type(transceiver.kind()) else {
                continue;
            };
            let sender = transceiver.sender().await;
            let track_id = sender.track().await.map(|t| t.id().to_owned());
            result.push(TransceiverInfo {
                mid: transceiver.mid().map(|mid| mid.to_string()),
                kind,
                direction: transceiver.direction(),
                track_id,
            });
        }
        result
    }

    async fn remove_senders(&self) -> Result<usize, Error> {
        let mut removed = 0;
        for sender in self.pc.get_senders().await {
            if sender.track().await.is_some() {
                self.pc.remove_track(&sender).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn create_data_channel(&self, label: &str) -> Result<DataChannel, Error> {
        let dc = self.pc.create_data_channel(label, None).await?;
        Ok(DataChannel::new(dc))
    }

    async fn close(&self) -> Result<(), Error> {
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Options;
    use tokio::sync::mpsc::unbounded_channel;

    const THREE_SECTION_OFFER: &str = "v=0\r\n\
o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=sendonly\r\n\
a=rtpmap:96 VP8/90000\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:2\r\n\
a=recvonly\r\n\
a=rtpmap:96 VP8/90000\r\n";

    #[test]
    fn counts_only_sending_media_sections() {
        let desc = SessionDescription::offer(THREE_SECTION_OFFER);
        assert_eq!(desc.sending_media_count(), 2);
        assert_eq!(SessionDescription::offer("garbage").sending_media_count(), 0);
    }

    #[test]
    fn session_description_wire_format() {
        let desc: SessionDescription =
            serde_json::from_str(r#"{"type":"answer","sdp":"v=0"}"#).unwrap();
        assert_eq!(desc, SessionDescription::answer("v=0"));
        assert_eq!(
            serde_json::to_value(SessionDescription::offer("x")).unwrap(),
            serde_json::json!({"type": "offer", "sdp": "x"})
        );
    }

    #[tokio::test]
    async fn rtc_connection_offers_transceivers_and_data_channel() -> Result<(), Error> {
        let options = Options {
            ice_servers: vec![],
            ..Options::default()
        };
        let (tx, _rx) = unbounded_channel();
        let conn = RtcConnection::start(&options, tx).await?;
        let _dc = conn.create_data_channel("file").await?;
        conn.add_transceiver(
            TransceiverSource::Kind(MediaKind::Audio),
            RTCRtpTransceiverDirection::Recvonly,
        )
        .await?;

        let offer = conn.create_offer().await?;
        assert!(offer.is_offer());
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=application"));
        conn.set_local_description(&offer).await?;
        assert!(conn.local_description().await.is_some());

        let transceivers = conn.transceivers().await;
        assert_eq!(transceivers.len(), 1);
        assert_eq!(transceivers[0].kind, MediaKind::Audio);
        assert!(transceivers[0].mid.is_some());

        conn.close().await?;
        Ok(())
    }
}
