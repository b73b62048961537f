use crate::config::{CompositionStrategy, Options};
use crate::connection::{
    Connection, ConnectionEvent, Connector, SessionDescription, TransceiverInfo, TransceiverSource,
};
use crate::data_channel::DataChannel;
use crate::error::Error;
use crate::event::{ContactEvent, EventBus};
use crate::file_transfer::{send_file, FileMetadata, FileReceiver, FileSource, ReceiveProgress};
use crate::media::{MediaSink, MediaStream, Recorder, RemoteStream, RemoteTrack, StreamComposer};
use crate::rest::TrackDescriptor;
use crate::signalling::{SignalMessage, SignallingChannel};
use arc_swap::ArcSwap;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Formatter;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

/// Contacts of a registry keyed by identity.
pub(crate) type ContactMap = tokio::sync::Mutex<HashMap<ContactIdentity, Arc<ContactPeer>>>;

/// Identity of a contact peer. A participant may have two peers at once, one
/// for media and one for data only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContactIdentity {
    pub unique_id: String,
    pub application_id: String,
    pub is_data: bool,
}

impl ContactIdentity {
    pub fn new(unique_id: &str, application_id: &str, is_data: bool) -> Self {
        ContactIdentity {
            unique_id: unique_id.to_owned(),
            application_id: application_id.to_owned(),
            is_data,
        }
    }

    /// Data-only counterpart of this identity.
    pub fn data(&self) -> Self {
        ContactIdentity {
            is_data: true,
            ..self.clone()
        }
    }
}

impl std::fmt::Display for ContactIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.unique_id, self.application_id)?;
        if self.is_data {
            write!(f, " (data)")?;
        }
        Ok(())
    }
}

/// Negotiation progress of a contact peer. States only move forward and
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContactState {
    Created,
    LocalOfferSent,
    AwaitingRemoteOffer,
    LocalDescriptionSet,
    RemoteDescriptionSet,
    Connected,
    StreamComposed,
    Closed,
}

#[derive(Default)]
struct Inner {
    remote_tracks: Vec<RemoteTrack>,
    composer: StreamComposer,
    sink: Option<Arc<dyn MediaSink>>,
    recorder: Option<Arc<dyn Recorder>>,
    tracks: Vec<TrackDescriptor>,
    local_session_id: Option<String>,
    remote_session_id: Option<String>,
    /// File announced by the remote side, consumed by the next incoming channel.
    file: Option<FileMetadata>,
    /// File waiting for the outgoing data channel to open.
    staged: Option<Arc<dyn FileSource>>,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

/// One negotiated connection to one remote identity.
pub struct ContactPeer {
    identity: ContactIdentity,
    options: Options,
    conn: Arc<dyn Connection>,
    signalling: Arc<SignallingChannel>,
    events: EventBus,
    contacts: Weak<ContactMap>,
    state: ArcSwap<ContactState>,
    ice_state: watch::Sender<RTCIceConnectionState>,
    inner: parking_lot::Mutex<Inner>,
    outgoing: tokio::sync::Mutex<Option<DataChannel>>,
    /// Remote data channel opened before any file was announced.
    incoming: parking_lot::Mutex<Option<DataChannel>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ContactPeer {
    pub(crate) async fn new(
        identity: ContactIdentity,
        options: Options,
        connector: &dyn Connector,
        signalling: Arc<SignallingChannel>,
        events: EventBus,
        contacts: Weak<ContactMap>,
    ) -> Result<Arc<Self>, Error> {
        let (tx, rx) = unbounded_channel();
        let conn = connector.connect(&options, tx).await?;
        let outgoing = match conn.create_data_channel(&options.data_channel_label).await {
            Ok(dc) => Some(dc),
            Err(e) => {
                log::warn!("contact {identity}: data channel unavailable: {e}");
                None
            }
        };
        let (ice_state, _) = watch::channel(RTCIceConnectionState::New);
        let peer = Arc::new(ContactPeer {
            identity,
            options,
            conn,
            signalling,
            events,
            contacts,
            state: ArcSwap::from_pointee(ContactState::Created),
            ice_state,
            inner: parking_lot::Mutex::new(Inner::default()),
            outgoing: tokio::sync::Mutex::new(outgoing),
            incoming: parking_lot::Mutex::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });
        let task = tokio::spawn(Self::listen(Arc::downgrade(&peer), rx));
        peer.tasks.lock().push(task);
        log::debug!("contact {} created", peer.identity);
        Ok(peer)
    }

    pub fn identity(&self) -> &ContactIdentity {
        &self.identity
    }

    pub fn state(&self) -> ContactState {
        **self.state.load()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ContactState::Closed
    }

    /// Underlying connection handle.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Current ICE connection state. The receiver can be awaited for changes.
    pub fn ice_connection_state(&self) -> watch::Receiver<RTCIceConnectionState> {
        self.ice_state.subscribe()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn advance(&self, next: ContactState) {
        self.state.rcu(|current| {
            if **current < next {
                Arc::new(next)
            } else {
                current.clone()
            }
        });
    }

    pub(crate) fn mark_awaiting_remote_offer(&self) {
        if self.state() == ContactState::Created {
            self.advance(ContactState::AwaitingRemoteOffer);
        }
    }

    fn emit(&self, event: ContactEvent) {
        self.events.contact(&self.identity, event);
    }

    async fn listen(peer: Weak<ContactPeer>, mut rx: UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(peer) = peer.upgrade() else {
                break;
            };
            if peer.is_closed() {
                break;
            }
            peer.on_connection_event(event);
        }
    }

    fn on_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::IceCandidate(candidate) => {
                self.signalling.send_candidate(&self.identity, &candidate);
                self.emit(ContactEvent::IceCandidate(candidate));
            }
            ConnectionEvent::IceConnectionState(state) => {
                self.ice_state.send_replace(state);
                if matches!(
                    state,
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
                ) {
                    self.advance(ContactState::Connected);
                }
                self.emit(ContactEvent::IceConnectionState(state));
            }
            ConnectionEvent::ConnectionState(state) => {
                self.emit(ContactEvent::ConnectionState(state));
            }
            ConnectionEvent::NegotiationNeeded => self.emit(ContactEvent::NegotiationNeeded),
            ConnectionEvent::Track(track) => {
                self.emit(ContactEvent::Track(track.clone()));
                match self.options.receive.strategy {
                    CompositionStrategy::FirstStream => self.set_remote_stream_to_sink(track),
                    CompositionStrategy::Incremental => {
                        self.add_track_stream_to_remote_sink(track);
                    }
                    CompositionStrategy::AllTracks => {
                        self.inner.lock().remote_tracks.push(track);
                        self.set_all_remote_stream_to_sink();
                    }
                }
            }
            ConnectionEvent::DataChannel(dc) => {
                self.emit(ContactEvent::DataChannelOpen {
                    label: dc.label().to_owned(),
                });
                if self.inner.lock().file.is_some() {
                    self.spawn(self.clone().receive_file(dc));
                } else {
                    *self.incoming.lock() = Some(dc);
                }
            }
        }
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(tokio::spawn(fut));
    }

    /// Adds every track of `stream` as a sender. Returns how many were added.
    pub async fn add_stream_tracks(&self, stream: &MediaStream) -> usize {
        if self.is_closed() {
            return 0;
        }
        let mut added = 0;
        for track in stream.tracks() {
            match self.conn.add_track(track).await {
                Ok(()) => added += 1,
                Err(e) => log::warn!(
                    "contact {}: failed to add track {}: {e}",
                    self.identity,
                    track.id()
                ),
            }
        }
        added
    }

    /// Adds every track of `stream` through its own transceiver.
    pub async fn add_stream_tracks_to_transceiver(
        &self,
        stream: &MediaStream,
        direction: RTCRtpTransceiverDirection,
    ) -> usize {
        let mut added = 0;
        for track in stream.tracks() {
            if self
                .add_tracks_to_transceiver(TransceiverSource::Track(track.clone()), direction)
                .await
            {
                added += 1;
            }
        }
        added
    }

    pub async fn add_tracks_to_transceiver(
        &self,
        source: TransceiverSource,
        direction: RTCRtpTransceiverDirection,
    ) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.conn.add_transceiver(source, direction).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("contact {}: failed to add transceiver: {e}", self.identity);
                false
            }
        }
    }

    pub async fn transceivers(&self) -> Vec<TransceiverInfo> {
        self.conn.transceivers().await
    }

    /// Adds receive-only transceivers for the kinds requested in the receive
    /// options that have no transceiver yet.
    async fn ensure_receive_transceivers(&self) {
        if self.identity.is_data {
            return;
        }
        let transceivers = self.conn.transceivers().await;
        let receive = self.options.receive;
        for (kind, wanted) in [
            (crate::media::MediaKind::Audio, receive.audio),
            (crate::media::MediaKind::Video, receive.video),
        ] {
            if wanted && !transceivers.iter().any(|t| t.kind == kind) {
                self.add_tracks_to_transceiver(
                    TransceiverSource::Kind(kind),
                    RTCRtpTransceiverDirection::Recvonly,
                )
                .await;
            }
        }
    }

    pub fn set_media_sink(&self, sink: Arc<dyn MediaSink>) {
        self.inner.lock().sink = Some(sink);
    }

    pub fn set_recorder(&self, recorder: Arc<dyn Recorder>) {
        self.inner.lock().recorder = Some(recorder);
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.inner.lock().remote_tracks.clone()
    }

    fn attach_stream(&self, stream: RemoteStream) {
        let sink = self.inner.lock().sink.clone();
        if let Some(sink) = sink {
            sink.attach(stream.clone());
        }
        self.emit(ContactEvent::StreamAttached(stream));
    }

    /// Replaces the sink content with the stream `track` belongs to.
    pub fn set_remote_stream_to_sink(&self, track: RemoteTrack) {
        let stream = {
            let mut inner = self.inner.lock();
            inner.remote_tracks.push(track.clone());
            let tracks = inner
                .remote_tracks
                .iter()
                .filter(|t| t.stream_id() == track.stream_id())
                .cloned()
                .collect();
            RemoteStream::new(track.stream_id(), tracks)
        };
        self.attach_stream(stream);
    }

    /// Buffers `track` and attaches the composed stream once the expected
    /// number of tracks has arrived. Returns `true` if this call composed it.
    pub fn add_track_stream_to_remote_sink(&self, track: RemoteTrack) -> bool {
        let composed = {
            let mut inner = self.inner.lock();
            inner.remote_tracks.push(track.clone());
            inner.composer.push(track)
        };
        self.finish_composition(composed)
    }

    /// Announces how many remote tracks to wait for before composing.
    pub fn set_expected_track_count(&self, count: usize) -> bool {
        let composed = self.inner.lock().composer.expect(count);
        self.finish_composition(composed)
    }

    fn finish_composition(&self, composed: Option<RemoteStream>) -> bool {
        match composed {
            Some(stream) => {
                log::debug!(
                    "contact {}: composed remote stream of {} tracks",
                    self.identity,
                    stream.tracks().len()
                );
                self.advance(ContactState::StreamComposed);
                self.attach_stream(stream);
                true
            }
            None => false,
        }
    }

    /// Attaches a stream made of every remote track received so far.
    pub fn set_all_remote_stream_to_sink(&self) {
        let stream = {
            let inner = self.inner.lock();
            let Some(first) = inner.remote_tracks.first() else {
                return;
            };
            RemoteStream::new(first.stream_id(), inner.remote_tracks.clone())
        };
        self.attach_stream(stream);
    }

    pub async fn local_description(&self) -> Option<SessionDescription> {
        self.conn.local_description().await
    }

    /// Creates an offer and sets it as the local description.
    pub async fn create_local_offer(&self) -> Result<SessionDescription, Error> {
        self.ensure_open()?;
        let offer = self.conn.create_offer().await?;
        self.conn.set_local_description(&offer).await?;
        self.advance(ContactState::LocalDescriptionSet);
        Ok(offer)
    }

    /// Creates an answer and sets it as the local description.
    pub async fn create_local_answer(&self) -> Result<SessionDescription, Error> {
        self.ensure_open()?;
        let answer = self.conn.create_answer().await?;
        self.conn.set_local_description(&answer).await?;
        self.advance(ContactState::LocalDescriptionSet);
        Ok(answer)
    }

    /// Applies a description received from the remote side, then flushes ICE
    /// candidates that arrived before it.
    pub async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), Error> {
        self.ensure_open()?;
        self.conn.set_remote_description(&desc).await?;
        self.advance(ContactState::RemoteDescriptionSet);

        let expected = desc.sending_media_count();
        if expected > 0 {
            self.set_expected_track_count(expected);
        }

        let pending = std::mem::take(&mut self.inner.lock().pending_candidates);
        for candidate in pending {
            if let Err(e) = self.conn.add_ice_candidate(candidate).await {
                log::warn!("contact {}: failed to apply queued candidate: {e}", self.identity);
            }
        }
        Ok(())
    }

    /// Applies a remote ICE candidate, or queues it until a remote
    /// description is known.
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.ensure_open()?;
        if self.conn.remote_description().await.is_some() {
            self.conn.add_ice_candidate(candidate).await
        } else {
            self.inner.lock().pending_candidates.push(candidate);
            Ok(())
        }
    }

    fn send_description(&self, desc: &SessionDescription, mark: impl FnOnce(&mut SignalMessage)) {
        let mut frame = SignalMessage::to(&self.identity).with_description(desc);
        mark(&mut frame);
        self.signalling.send(&frame);
    }

    pub async fn send_offer_request(&self) -> Result<(), Error> {
        self.ensure_open()?;
        self.advance(ContactState::LocalOfferSent);
        self.ensure_receive_transceivers().await;
        let offer = self.create_local_offer().await?;
        self.send_description(&offer, |f| f.call_offer = Some(Value::Bool(true)));
        Ok(())
    }

    pub async fn send_answer_response(&self) -> Result<(), Error> {
        let answer = self.create_local_answer().await?;
        self.send_description(&answer, |f| f.call_answer = Some(Value::Bool(true)));
        Ok(())
    }

    pub async fn send_join_conference_offer_request(
        &self,
        conference_call: Option<Value>,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        self.advance(ContactState::LocalOfferSent);
        self.ensure_receive_transceivers().await;
        let offer = self.create_local_offer().await?;
        self.send_description(&offer, |f| {
            f.join_conference_offer = Some(Value::Bool(true));
            f.conference_call = conference_call;
        });
        Ok(())
    }

    pub async fn send_join_conference_answer_response(&self) -> Result<(), Error> {
        let answer = self.create_local_answer().await?;
        self.send_description(&answer, |f| f.join_conference_answer = Some(Value::Bool(true)));
        Ok(())
    }

    /// Stages `file`, offers it to the remote side and pushes it once the
    /// outgoing data channel opens.
    pub async fn send_file_transfer_offer_request(
        self: &Arc<Self>,
        file: Arc<dyn FileSource>,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        self.advance(ContactState::LocalOfferSent);
        let metadata = file.metadata().clone();
        self.inner.lock().staged = Some(file);
        let offer = self.create_local_offer().await?;
        let mut frame = SignalMessage::to(&self.identity)
            .with_description(&offer)
            .with_file(&metadata);
        frame.file_transfer_offer = Some(Value::Bool(true));
        self.signalling.send(&frame);
        self.spawn(self.clone().push_staged_file());
        Ok(())
    }

    pub async fn send_file_transfer_answer_response(&self) -> Result<(), Error> {
        let answer = self.create_local_answer().await?;
        self.send_description(&answer, |f| f.file_transfer_answer = Some(Value::Bool(true)));
        Ok(())
    }

    pub fn file_metadata(&self) -> Option<FileMetadata> {
        self.inner.lock().file.clone()
    }

    /// Records the file announced by the remote side. A data channel that is
    /// already open starts receiving it.
    pub fn set_file_metadata(self: &Arc<Self>, file: FileMetadata) {
        if self.is_closed() {
            return;
        }
        self.inner.lock().file = Some(file);
        if let Some(dc) = self.incoming.lock().take() {
            self.spawn(self.clone().receive_file(dc));
        }
    }

    async fn push_staged_file(self: Arc<Self>) {
        let mut outgoing = self.outgoing.lock().await;
        let Some(dc) = outgoing.as_mut() else {
            log::warn!("contact {}: no data channel to send file over", self.identity);
            return;
        };
        match dc.ready().await {
            Ok(true) => {}
            Ok(false) => {
                log::debug!("contact {}: data channel closed before file transfer", self.identity);
                return;
            }
            Err(e) => {
                log::warn!(
                    "contact {}: data channel failed before file transfer: {e}",
                    self.identity
                );
                return;
            }
        }
        let Some(file) = self.inner.lock().staged.take() else {
            return;
        };
        let metadata = file.metadata().clone();
        let total = metadata.size;
        let result = send_file(dc, file.as_ref(), |sent| {
            self.emit(ContactEvent::FileSendProgress { sent, total })
        })
        .await;
        match result {
            Ok(_) => self.emit(ContactEvent::FileSent { file: metadata }),
            Err(e) => log::warn!(
                "contact {}: sending '{}' failed: {e}",
                self.identity,
                metadata.name
            ),
        }
    }

    async fn receive_file(self: Arc<Self>, mut dc: DataChannel) {
        let Some(metadata) = self.inner.lock().file.take() else {
            *self.incoming.lock() = Some(dc);
            return;
        };
        let total = metadata.size;
        let mut receiver = FileReceiver::new(metadata);
        if total == 0 {
            self.emit(ContactEvent::FileReceiveProgress { received: 0, total });
            self.emit(ContactEvent::FileReceived {
                file: receiver.metadata().clone(),
                data: Default::default(),
            });
        } else {
            while let Some(chunk) = dc.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        log::warn!("contact {}: file channel failed: {e}", self.identity);
                        break;
                    }
                };
                match receiver.push(&chunk) {
                    ReceiveProgress::Progress(received) => {
                        self.emit(ContactEvent::FileReceiveProgress { received, total })
                    }
                    ReceiveProgress::Complete(received) => {
                        self.emit(ContactEvent::FileReceiveProgress { received, total });
                        let data = receiver.take().unwrap_or_default();
                        self.emit(ContactEvent::FileReceived {
                            file: receiver.metadata().clone(),
                            data,
                        });
                        break;
                    }
                    ReceiveProgress::Ignored => {}
                }
            }
        }
        if let Err(e) = dc.close().await {
            log::debug!("contact {}: closing file channel: {e}", self.identity);
        }
    }

    /// Tracks this contact sends, as reported by its transceivers.
    pub async fn local_track_descriptors(&self) -> Vec<TrackDescriptor> {
        self.conn
            .transceivers()
            .await
            .into_iter()
            .filter(|t| {
                matches!(
                    t.direction,
                    RTCRtpTransceiverDirection::Sendonly | RTCRtpTransceiverDirection::Sendrecv
                )
            })
            .filter_map(|t| Some(TrackDescriptor::local(t.mid?, t.track_id?)))
            .collect()
    }

    pub fn tracks(&self) -> Vec<TrackDescriptor> {
        self.inner.lock().tracks.clone()
    }

    pub fn set_tracks(&self, tracks: Vec<TrackDescriptor>) {
        self.inner.lock().tracks = tracks;
    }

    pub fn local_session_id(&self) -> Option<String> {
        self.inner.lock().local_session_id.clone()
    }

    pub fn set_local_session_id(&self, session_id: &str) {
        self.inner.lock().local_session_id = Some(session_id.to_owned());
    }

    pub fn remote_session_id(&self) -> Option<String> {
        self.inner.lock().remote_session_id.clone()
    }

    pub fn set_remote_session_id(&self, session_id: &str) {
        self.inner.lock().remote_session_id = Some(session_id.to_owned());
    }

    /// Tears the contact down and removes it from its registry. Every phase
    /// runs even if an earlier one failed. Closing twice is a no-op.
    pub async fn close(&self) {
        let previous = self.state.swap(Arc::new(ContactState::Closed));
        if *previous == ContactState::Closed {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let sink = {
            let mut inner = self.inner.lock();
            inner.remote_tracks.clear();
            inner.composer.clear();
            inner.sink.take()
        };
        if let Some(sink) = sink {
            sink.detach();
        }

        match self.conn.remove_senders().await {
            Ok(removed) => log::debug!("contact {}: removed {removed} senders", self.identity),
            Err(e) => log::warn!("contact {}: failed to remove senders: {e}", self.identity),
        }

        let recorder = {
            let mut inner = self.inner.lock();
            inner.tracks.clear();
            inner.pending_candidates.clear();
            inner.staged = None;
            inner.file = None;
            inner.recorder.take()
        };

        if let Some(mut dc) = self.outgoing.lock().await.take() {
            if let Err(e) = dc.close().await {
                log::debug!("contact {}: closing data channel: {e}", self.identity);
            }
        }
        self.incoming.lock().take();
        if let Err(e) = self.conn.close().await {
            log::warn!("contact {}: failed to close connection: {e}", self.identity);
        }

        if let Some(recorder) = recorder {
            if let Err(e) = recorder.stop() {
                log::warn!("contact {}: failed to stop recorder: {e}", self.identity);
            }
        }

        log::info!("contact {} closed", self.identity);
        self.emit(ContactEvent::Closed);

        if let Some(contacts) = self.contacts.upgrade() {
            let mut contacts = contacts.lock().await;
            let registered = contacts
                .get(&self.identity)
                .map(|peer| std::ptr::eq(peer.as_ref(), self))
                .unwrap_or(false);
            if registered {
                contacts.remove(&self.identity);
            }
        }
    }
}

impl std::fmt::Debug for ContactPeer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactPeer")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}
