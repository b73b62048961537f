//! In-process doubles for the connection, HTTP and media sink seams.

use crate::config::Options;
use crate::connection::{
    Connection, ConnectionEvent, Connector, SessionDescription, TransceiverInfo, TransceiverSource,
};
use crate::data_channel::DataChannel;
use crate::error::Error;
use crate::media::{LocalTrack, MediaKind, MediaSink, RemoteStream};
use crate::rest::{FetchRequest, JsonFetch};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

/// Offer with one sending audio and one sending video section.
pub(crate) const TWO_TRACK_OFFER: &str = "v=0\r\n\
o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=sendonly\r\n\
a=rtpmap:96 VP8/90000\r\n";

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
pub(crate) struct MockConnector {
    auto_connect: bool,
    close_delay: Option<Duration>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(MockConnector::default())
    }

    /// Connector whose connections report ICE connected as soon as a remote
    /// description is applied.
    pub fn auto_connect() -> Arc<Self> {
        Arc::new(MockConnector {
            auto_connect: true,
            ..Default::default()
        })
    }

    /// Connector whose connections take `delay` to close.
    pub fn slow_close(delay: Duration) -> Arc<Self> {
        Arc::new(MockConnector {
            close_delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn last(&self) -> Arc<MockConnection> {
        self.connections
            .lock()
            .last()
            .cloned()
            .expect("no connection created yet")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _options: &Options,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn Connection>, Error> {
        let conn = Arc::new(MockConnection {
            events,
            auto_connect: self.auto_connect,
            close_delay: self.close_delay,
            state: Mutex::new(MockState::default()),
        });
        self.connections.lock().push(conn.clone());
        Ok(conn)
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    transceivers: Vec<TransceiverInfo>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<RTCIceCandidateInit>,
    descriptions: usize,
    closed: bool,
}

pub(crate) struct MockConnection {
    events: UnboundedSender<ConnectionEvent>,
    auto_connect: bool,
    close_delay: Option<Duration>,
    state: Mutex<MockState>,
}

impl MockConnection {
    /// Raises `event` as if the connection produced it.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn candidates(&self) -> Vec<RTCIceCandidateInit> {
        self.state.lock().candidates.clone()
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of transceivers with a track attached to their sender.
    pub fn senders(&self) -> usize {
        self.state
            .lock()
            .transceivers
            .iter()
            .filter(|t| t.track_id.is_some())
            .count()
    }

    fn describe(&self, offer: bool) -> SessionDescription {
        let mut state = self.state.lock();
        state.descriptions += 1;
        let n = state.descriptions;
        for (i, t) in state.transceivers.iter_mut().enumerate() {
            if t.mid.is_none() {
                t.mid = Some(i.to_string());
            }
        }
        if offer {
            state.calls.push("create_offer".into());
            SessionDescription::offer(format!("v=0\r\ns=mock-offer-{n}\r\n"))
        } else {
            state.calls.push("create_answer".into());
            SessionDescription::answer(format!("v=0\r\ns=mock-answer-{n}\r\n"))
        }
    }

    fn push_transceiver(
        &self,
        kind: MediaKind,
        direction: RTCRtpTransceiverDirection,
        track_id: Option<String>,
    ) {
        self.state.lock().transceivers.push(TransceiverInfo {
            mid: None,
            kind,
            direction,
            track_id,
        });
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        Ok(self.describe(true))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        if self.state.lock().remote.is_none() {
            return Err(Error::InvalidDescription("no remote offer to answer".into()));
        }
        Ok(self.describe(false))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.calls.push(format!("set_local:{}", desc.sdp_type.as_str()));
        state.local = Some(desc.clone());
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            state.calls.push(format!("set_remote:{}", desc.sdp_type.as_str()));
            state.remote = Some(desc.clone());
        }
        if self.auto_connect {
            self.emit(ConnectionEvent::IceConnectionState(RTCIceConnectionState::Connected));
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.state.lock().candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), Error> {
        self.push_transceiver(
            track.kind(),
            RTCRtpTransceiverDirection::Sendrecv,
            Some(track.id().to_owned()),
        );
        Ok(())
    }

    async fn add_transceiver(
        &self,
        source: TransceiverSource,
        direction: RTCRtpTransceiverDirection,
    ) -> Result<(), Error> {
        match source {
            TransceiverSource::Kind(kind) => self.push_transceiver(kind, direction, None),
            TransceiverSource::Track(track) => {
                self.push_transceiver(track.kind(), direction, Some(track.id().to_owned()))
            }
        }
        Ok(())
    }

    async fn transceivers(&self) -> Vec<TransceiverInfo> {
        self.state.lock().transceivers.clone()
    }

    async fn remove_senders(&self) -> Result<usize, Error> {
        let mut state = self.state.lock();
        let mut removed = 0;
        for t in state.transceivers.iter_mut() {
            if t.track_id.take().is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn create_data_channel(&self, _label: &str) -> Result<DataChannel, Error> {
        Err(Error::Unsupported("data channels on a mock connection"))
    }

    async fn close(&self) -> Result<(), Error> {
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().closed = true;
        Ok(())
    }
}

/// [JsonFetch] answering from canned responses, keyed by the path below
/// `/sessions/`. Unknown paths fail like an unreachable server.
#[derive(Default)]
pub(crate) struct MockFetch {
    responses: Mutex<HashMap<String, VecDeque<Result<Value, Error>>>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MockFetch {
    pub fn new() -> Arc<Self> {
        Arc::new(MockFetch::default())
    }

    pub fn respond(&self, path: &str, response: Result<Value, Error>) {
        self.responses
            .lock()
            .entry(path.to_owned())
            .or_default()
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl JsonFetch for MockFetch {
    async fn fetch(&self, request: FetchRequest) -> Result<Value, Error> {
        let path = request
            .url
            .rsplit("/sessions/")
            .next()
            .unwrap_or_default()
            .to_owned();
        self.requests.lock().push(request);
        self.responses
            .lock()
            .get_mut(&path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(Error::Http(format!("no response for {path}"))))
    }
}

/// [MediaSink] remembering what it was given.
#[derive(Default)]
pub(crate) struct RecordingSink {
    attached: Mutex<Vec<RemoteStream>>,
    detached: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingSink::default())
    }

    pub fn attached(&self) -> Vec<RemoteStream> {
        self.attached.lock().clone()
    }

    pub fn detached(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }
}

impl MediaSink for RecordingSink {
    fn attach(&self, stream: RemoteStream) {
        self.attached.lock().push(stream);
    }

    fn detach(&self) {
        self.detached.fetch_add(1, Ordering::SeqCst);
    }
}
