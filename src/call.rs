use crate::config::Options;
use crate::contact::{ContactIdentity, ContactPeer};
use crate::error::Error;
use crate::event::{Event, Events};
use crate::file_transfer::FileSource;
use crate::media::{MediaKind, MediaStream, StreamConstraints};
use crate::registry::PeerRegistry;
use serde_json::Value;
use std::sync::Arc;

/// Application facade over a [PeerRegistry]: calls, conferences, file
/// transfers and messaging addressed by contact identity.
///
/// Failed operations are logged, returned and also published on the event
/// stream as [Event::Failed].
#[derive(Debug, Clone)]
pub struct CallOrchestrator {
    registry: PeerRegistry,
}

impl CallOrchestrator {
    pub fn new(options: Options) -> Self {
        Self::with_registry(PeerRegistry::new(options))
    }

    pub fn with_registry(registry: PeerRegistry) -> Self {
        CallOrchestrator { registry }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> Events {
        self.registry.subscribe()
    }

    /// Connects to the configured signalling server.
    pub async fn connect(&self) -> Result<(), Error> {
        match self.registry.options().signalling_url.clone() {
            Some(url) => self.connect_to(&url).await,
            None => {
                let missing = Error::Unsupported("no signalling url configured");
                self.report(None, "connect", Err(missing))
            }
        }
    }

    pub async fn connect_to(&self, url: &str) -> Result<(), Error> {
        let result = self.registry.open(url).await;
        self.report(None, "connect", result)
    }

    fn report<T>(
        &self,
        contact: Option<&ContactIdentity>,
        operation: &'static str,
        result: Result<T, Error>,
    ) -> Result<T, Error> {
        if let Err(error) = &result {
            match contact {
                Some(contact) => log::warn!("{operation} {contact} failed: {error}"),
                None => log::warn!("{operation} failed: {error}"),
            }
            self.registry.events().emit(Event::Failed {
                contact: contact.cloned(),
                operation,
                error: error.clone(),
            });
        }
        result
    }

    pub fn create_stream(&self, constraints: StreamConstraints) -> MediaStream {
        self.registry.create_stream(constraints)
    }

    pub fn close_stream(&self) {
        self.registry.close_stream()
    }

    pub async fn create_contact(
        &self,
        unique_id: &str,
        application_id: &str,
        is_data: bool,
    ) -> Result<Arc<ContactPeer>, Error> {
        let identity = ContactIdentity::new(unique_id, application_id, is_data);
        let result = self.registry.create_contact_peer(identity.clone()).await;
        self.report(Some(&identity), "create contact", result)
    }

    /// Adds the tracks of the local stream the contact does not send yet.
    async fn attach_local_stream(&self, peer: &ContactPeer) {
        if peer.identity().is_data {
            return;
        }
        let Some(stream) = self.registry.local_stream() else {
            return;
        };
        let attached: Vec<String> = peer
            .transceivers()
            .await
            .into_iter()
            .filter_map(|t| t.track_id)
            .collect();
        let missing = stream
            .tracks()
            .iter()
            .filter(|t| !attached.iter().any(|id| id == t.id()))
            .cloned()
            .collect();
        peer.add_stream_tracks(&MediaStream::new(stream.id(), missing)).await;
    }

    /// Offers a media call to `contact`, sending the local stream if there is one.
    pub async fn call(&self, contact: &ContactIdentity) -> Result<(), Error> {
        let result = async {
            let peer = self.registry.create_contact_peer(contact.clone()).await?;
            self.attach_local_stream(&peer).await;
            peer.send_offer_request().await
        }
        .await;
        self.report(Some(contact), "call", result)
    }

    /// Answers a call offered by `contact`.
    pub async fn answer(&self, contact: &ContactIdentity) -> Result<(), Error> {
        let result = async {
            let peer = self.registry.create_contact_peer(contact.clone()).await?;
            self.attach_local_stream(&peer).await;
            peer.send_answer_response().await
        }
        .await;
        self.report(Some(contact), "answer", result)
    }

    pub async fn join_conference(
        &self,
        contact: &ContactIdentity,
        conference_call: Option<Value>,
    ) -> Result<(), Error> {
        let result = async {
            let peer = self.registry.create_contact_peer(contact.clone()).await?;
            self.attach_local_stream(&peer).await;
            peer.send_join_conference_offer_request(conference_call).await
        }
        .await;
        self.report(Some(contact), "join conference", result)
    }

    pub async fn answer_conference(&self, contact: &ContactIdentity) -> Result<(), Error> {
        let result = async {
            let peer = self.registry.create_contact_peer(contact.clone()).await?;
            self.attach_local_stream(&peer).await;
            peer.send_join_conference_answer_response().await
        }
        .await;
        self.report(Some(contact), "answer conference", result)
    }

    /// Offers `file` to the data-only contact of `unique_id`/`application_id`.
    pub async fn send_file(
        &self,
        unique_id: &str,
        application_id: &str,
        file: Arc<dyn FileSource>,
    ) -> Result<(), Error> {
        let contact = ContactIdentity::new(unique_id, application_id, true);
        let result = async {
            let peer = self.registry.create_contact_peer(contact.clone()).await?;
            peer.send_file_transfer_offer_request(file).await
        }
        .await;
        self.report(Some(&contact), "send file", result)
    }

    /// Accepts the file offered by the data-only contact `contact`.
    pub async fn accept_file(&self, contact: &ContactIdentity) -> Result<(), Error> {
        let contact = contact.data();
        let result = async {
            let peer = self
                .registry
                .lookup(&contact)
                .await
                .ok_or_else(|| Error::Protocol(format!("no file offered by {contact}")))?;
            peer.send_file_transfer_answer_response().await
        }
        .await;
        self.report(Some(&contact), "accept file", result)
    }

    /// Rejects a pending offer from `contact` and drops its peer.
    pub async fn decline(&self, contact: &ContactIdentity) {
        self.registry.signalling().send_no_answer(contact);
        self.registry.remove_contact_peer(contact).await;
    }

    /// Ends the call with `contact` on both sides.
    pub async fn hang_up(&self, contact: &ContactIdentity) {
        self.registry.signalling().send_end_call(contact);
        self.registry.remove_contact_peer(contact).await;
    }

    pub fn send_message(&self, contact: &ContactIdentity, message: impl Into<Value>) {
        self.registry.signalling().send_contact_message(contact, message);
    }

    pub fn send_typing(&self, contact: &ContactIdentity, typing: bool) {
        self.registry.signalling().send_typing(contact, typing);
    }

    pub fn check_available(&self, contact: &ContactIdentity) {
        self.registry.signalling().send_contact_available(contact);
    }

    pub fn send_client_state(&self, contact: &ContactIdentity, state: Value) {
        self.registry.signalling().send_client_state(contact, state);
    }

    pub fn send_client_details(&self, contact: &ContactIdentity, details: Value) {
        self.registry.signalling().send_client_details(contact, details);
    }

    pub fn request_unique_ids(&self) {
        self.registry.signalling().request_unique_ids();
    }

    pub fn request_application_ids(&self) {
        self.registry.signalling().request_application_ids();
    }

    pub fn request_unique_application(&self) {
        self.registry.signalling().request_unique_application();
    }

    pub fn mute_audio(&self, muted: bool) {
        self.set_muted(MediaKind::Audio, muted);
    }

    pub fn mute_video(&self, muted: bool) {
        self.set_muted(MediaKind::Video, muted);
    }

    fn set_muted(&self, kind: MediaKind, muted: bool) {
        match self.registry.local_stream() {
            Some(stream) => stream.set_enabled(kind, !muted),
            None => log::debug!("no local stream to mute"),
        }
    }

    pub async fn close(&self) {
        self.registry.close().await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::{Connection, SessionDescription};
    use crate::signalling::{captured, SignallingChannel, SignallingEvent};
    use crate::testing::MockConnector;
    use serde_json::json;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio_tungstenite::tungstenite::Message;

    fn orchestrator(
        connector: Arc<MockConnector>,
    ) -> (CallOrchestrator, UnboundedReceiver<Message>) {
        let (tx, _events) = unbounded_channel();
        let (signalling, frames) = SignallingChannel::capture(tx);
        let registry = PeerRegistry::with_parts(Options::default(), connector, signalling);
        (CallOrchestrator::with_registry(registry), frames)
    }

    #[tokio::test]
    async fn call_sends_local_stream_once() {
        let connector = MockConnector::new();
        let (app, mut frames) = orchestrator(connector.clone());
        app.create_stream(StreamConstraints::default());
        let bob = ContactIdentity::new("bob", "app", false);

        app.call(&bob).await.unwrap();
        app.call(&bob).await.unwrap();

        let senders: Vec<_> = connector
            .last()
            .transceivers()
            .await
            .into_iter()
            .filter_map(|t| t.track_id)
            .collect();
        assert_eq!(senders, vec!["local-audio", "local-video"]);
        let frames = captured(&mut frames);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f["callOffer"] == json!(true)));
    }

    #[tokio::test]
    async fn answer_follows_routed_offer() {
        let (app, mut frames) = orchestrator(MockConnector::new());
        let alice = ContactIdentity::new("alice", "app1", false);
        app.registry()
            .handle_signal(SignallingEvent::Sdp {
                contact: alice.clone(),
                description: SessionDescription::offer("v=0"),
            })
            .await;

        app.answer(&alice).await.unwrap();

        let frames = captured(&mut frames);
        assert_eq!(frames[0]["callAnswer"], json!(true));
        assert_eq!(frames[0]["sdp"]["type"], json!("answer"));
    }

    #[tokio::test]
    async fn failures_are_published() {
        let (app, _frames) = orchestrator(MockConnector::new());
        let mut events = app.subscribe();
        let alice = ContactIdentity::new("alice", "app1", false);

        // nothing to answer yet
        assert!(app.answer(&alice).await.is_err());
        assert!(app.connect().await.is_err());

        let failed: Vec<_> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                Event::Failed { operation, .. } => Some(operation),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec!["answer", "connect"]);
    }

    #[tokio::test]
    async fn hang_up_notifies_and_drops_contact() {
        let (app, mut frames) = orchestrator(MockConnector::new());
        let bob = ContactIdentity::new("bob", "app", false);
        let peer = app.create_contact("bob", "app", false).await.unwrap();

        app.hang_up(&bob).await;

        assert!(peer.is_closed());
        assert!(app.registry().lookup(&bob).await.is_none());
        let frames = captured(&mut frames);
        assert_eq!(frames[0]["endCallRemote"], json!(true));
    }

    #[tokio::test]
    async fn mute_toggles_local_tracks() {
        let (app, _frames) = orchestrator(MockConnector::new());
        let stream = app.create_stream(StreamConstraints::default());
        app.mute_audio(true);
        assert!(stream.tracks_of(MediaKind::Audio).all(|t| !t.is_enabled()));
        assert!(stream.tracks_of(MediaKind::Video).all(|t| t.is_enabled()));
        app.mute_audio(false);
        app.mute_video(true);
        assert!(stream.tracks_of(MediaKind::Audio).all(|t| t.is_enabled()));
        assert!(stream.tracks_of(MediaKind::Video).all(|t| !t.is_enabled()));
    }
}
