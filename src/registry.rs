use crate::config::Options;
use crate::connection::{Connector, RtcConnector};
use crate::contact::{ContactIdentity, ContactMap, ContactPeer};
use crate::error::Error;
use crate::event::{Event, EventBus, Events};
use crate::media::{DeviceProvider, MediaDevice, MediaStream, Recorder, StreamConstraints};
use crate::signalling::{SignallingChannel, SignallingEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinHandle;

/// Stream id of the local stream created by [PeerRegistry::create_stream].
pub const LOCAL_STREAM_ID: &str = "local";

struct Shared {
    options: Options,
    connector: Arc<dyn Connector>,
    signalling: Arc<SignallingChannel>,
    contacts: Arc<ContactMap>,
    events: EventBus,
    local_stream: Mutex<Option<MediaStream>>,
    recorder: Mutex<Option<Arc<dyn Recorder>>>,
    router: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Owns the signalling channel, the local stream and every contact peer.
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct PeerRegistry {
    shared: Arc<Shared>,
}

impl PeerRegistry {
    pub fn new(options: Options) -> Self {
        Self::with_connector(options, Arc::new(RtcConnector))
    }

    pub fn with_connector(options: Options, connector: Arc<dyn Connector>) -> Self {
        Self::with_parts(options, connector, SignallingChannel::new())
    }

    pub(crate) fn with_parts(
        options: Options,
        connector: Arc<dyn Connector>,
        signalling: Arc<SignallingChannel>,
    ) -> Self {
        PeerRegistry {
            shared: Arc::new(Shared {
                options,
                connector,
                signalling,
                contacts: Arc::new(ContactMap::default()),
                events: EventBus::default(),
                local_stream: Mutex::new(None),
                recorder: Mutex::new(None),
                router: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    pub fn signalling(&self) -> &Arc<SignallingChannel> {
        &self.shared.signalling
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn subscribe(&self) -> Events {
        self.shared.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Connects the signalling channel and routes its events through
    /// [Self::handle_signal].
    pub async fn open(&self, url: &str) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.shared.signalling.is_open() {
            return Ok(());
        }
        let (tx, rx) = unbounded_channel();
        self.spawn_router(rx);
        self.shared.signalling.open(url, tx).await
    }

    fn spawn_router(&self, mut rx: UnboundedReceiver<SignallingEvent>) {
        let shared = Arc::downgrade(&self.shared);
        let router = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                PeerRegistry { shared }.handle_signal(event).await;
            }
        });
        if let Some(previous) = self.shared.router.lock().replace(router) {
            previous.abort();
        }
    }

    /// Applies a signalling event to the contact it names, creating that
    /// contact on first mention, then publishes the event.
    pub async fn handle_signal(&self, event: SignallingEvent) {
        match &event {
            SignallingEvent::Sdp {
                contact,
                description,
            } => {
                if let Some(peer) = self.routed(contact).await {
                    if description.is_offer() {
                        peer.mark_awaiting_remote_offer();
                    }
                    if let Err(e) = peer.apply_remote_description(description.clone()).await {
                        log::warn!("contact {contact}: failed to apply remote description: {e}");
                    }
                }
            }
            SignallingEvent::Candidate { contact, candidate } => {
                if let Some(peer) = self.routed(contact).await {
                    if let Err(e) = peer.add_ice_candidate(candidate.clone()).await {
                        log::warn!("contact {contact}: failed to add ICE candidate: {e}");
                    }
                }
            }
            SignallingEvent::CallOffer { contact }
            | SignallingEvent::JoinConferenceOffer { contact, .. } => {
                if let Some(peer) = self.routed(contact).await {
                    peer.mark_awaiting_remote_offer();
                }
            }
            SignallingEvent::FileTransferOffer { contact, file } => {
                if let Some(peer) = self.routed(contact).await {
                    peer.set_file_metadata(file.clone());
                }
            }
            SignallingEvent::EndCallRemote { contact } => self.remove_contact_peer(contact).await,
            _ => {}
        }
        self.shared.events.emit(Event::Signal(event));
    }

    async fn routed(&self, contact: &ContactIdentity) -> Option<Arc<ContactPeer>> {
        match self.create_contact_peer(contact.clone()).await {
            Ok(peer) => Some(peer),
            Err(e) => {
                log::warn!("cannot route signal to {contact}: {e}");
                None
            }
        }
    }

    /// Returns the contact peer for `identity`, creating it if there is none.
    /// A peer that is still closing counts as gone and gets replaced.
    pub async fn create_contact_peer(
        &self,
        identity: ContactIdentity,
    ) -> Result<Arc<ContactPeer>, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let mut contacts = self.shared.contacts.lock().await;
        if let Some(peer) = contacts.get(&identity) {
            if !peer.is_closed() {
                return Ok(peer.clone());
            }
            log::debug!("contact {identity} is closing, replacing it");
        }
        let peer = ContactPeer::new(
            identity.clone(),
            self.shared.options.clone(),
            self.shared.connector.as_ref(),
            self.shared.signalling.clone(),
            self.shared.events.clone(),
            Arc::downgrade(&self.shared.contacts),
        )
        .await?;
        contacts.insert(identity.clone(), peer.clone());
        drop(contacts);
        self.shared.events.emit(Event::ContactCreated(identity));
        Ok(peer)
    }

    pub async fn contact_peer(
        &self,
        unique_id: &str,
        application_id: &str,
        is_data: bool,
    ) -> Option<Arc<ContactPeer>> {
        self.lookup(&ContactIdentity::new(unique_id, application_id, is_data))
            .await
    }

    pub async fn lookup(&self, identity: &ContactIdentity) -> Option<Arc<ContactPeer>> {
        let contacts = self.shared.contacts.lock().await;
        contacts.get(identity).filter(|peer| !peer.is_closed()).cloned()
    }

    pub async fn contact_peers(&self) -> Vec<Arc<ContactPeer>> {
        self.shared.contacts.lock().await.values().cloned().collect()
    }

    /// Closes the contact peer for `identity`, if there is one.
    pub async fn remove_contact_peer(&self, identity: &ContactIdentity) {
        let peer = self.lookup(identity).await;
        if let Some(peer) = peer {
            peer.close().await;
        }
    }

    pub async fn remove_contact_peers(&self) {
        let peers: Vec<_> = self
            .shared
            .contacts
            .lock()
            .await
            .drain()
            .map(|(_, peer)| peer)
            .collect();
        for peer in peers {
            peer.close().await;
        }
    }

    /// Creates the local stream, replacing and stopping any previous one.
    pub fn create_stream(&self, constraints: StreamConstraints) -> MediaStream {
        let stream = MediaStream::with_constraints(LOCAL_STREAM_ID, constraints);
        if let Some(previous) = self.shared.local_stream.lock().replace(stream.clone()) {
            previous.stop();
        }
        stream
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.shared.local_stream.lock().clone()
    }

    pub fn close_stream(&self) {
        if let Some(stream) = self.shared.local_stream.lock().take() {
            stream.stop();
            log::debug!("local stream {} stopped", stream.id());
        }
    }

    pub async fn enumerate_devices(&self, provider: &dyn DeviceProvider) -> Vec<MediaDevice> {
        match provider.enumerate_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                log::warn!("failed to enumerate media devices: {e}");
                Vec::new()
            }
        }
    }

    pub fn set_recorder(&self, recorder: Arc<dyn Recorder>) {
        if let Some(previous) = self.shared.recorder.lock().replace(recorder) {
            if let Err(e) = previous.stop() {
                log::warn!("failed to stop replaced recorder: {e}");
            }
        }
    }

    pub fn stop_recorder(&self) {
        if let Some(recorder) = self.shared.recorder.lock().take() {
            if let Err(e) = recorder.stop() {
                log::warn!("failed to stop recorder: {e}");
            }
        }
    }

    /// Releases the local stream, the signalling channel, the recorder and
    /// every contact peer, in that order. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_stream();
        self.shared.signalling.close();
        self.stop_recorder();
        self.remove_contact_peers().await;
        log::info!("peer registry closed");
        self.shared.events.emit(Event::RegistryClosed);
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("closed", &self.is_closed())
            .field("signalling_open", &self.shared.signalling.is_open())
            .finish()
    }
}
