use super::{RestClient, ServiceResult, TrackDescriptor};
use crate::config::RestConfig;
use crate::connection::{SdpType, TransceiverSource};
use crate::contact::{ContactIdentity, ContactPeer};
use crate::error::Error;
use crate::media::{MediaKind, MediaStream};
use crate::registry::PeerRegistry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

pub const ICE_TIMEOUT_REASON: &str = "timed out waiting for ICE connection";

/// State threaded through one negotiation sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationSession {
    pub session_id: Option<String>,
    pub valid_result: bool,
    pub error: Option<String>,
}

impl NegotiationSession {
    fn failed(error: impl Into<String>) -> Self {
        NegotiationSession {
            session_id: None,
            valid_result: false,
            error: Some(error.into()),
        }
    }
}

/// What a negotiation sequence reports to its caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NegotiationOutcome {
    pub result: bool,
    pub info: ServiceResult,
}

impl NegotiationOutcome {
    fn failed(error: impl Into<String>) -> Self {
        NegotiationOutcome {
            result: false,
            info: ServiceResult::failed(error),
        }
    }
}

/// Session published by another participant, as needed to subscribe to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSessionDetails {
    pub session_id: String,
    pub media_kinds: Vec<MediaKind>,
}

#[derive(Debug, Default)]
struct ClientState {
    session_id: Option<String>,
    tracks_local: Vec<TrackDescriptor>,
    tracks_remote: Vec<TrackDescriptor>,
}

/// Drives contact peers of a [PeerRegistry] through the REST negotiation
/// service instead of relaying descriptions over signalling.
pub struct RestNegotiationClient {
    registry: PeerRegistry,
    rest: RestClient,
    ice_timeout: Duration,
    state: Mutex<ClientState>,
}

impl RestNegotiationClient {
    pub fn new(registry: PeerRegistry, config: RestConfig) -> Result<Self, Error> {
        Ok(Self::with_client(registry, RestClient::new(config)?))
    }

    pub fn with_client(registry: PeerRegistry, rest: RestClient) -> Self {
        RestNegotiationClient {
            registry,
            ice_timeout: rest.config().ice_timeout(),
            rest,
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// Session created by the last successful [Self::new_session_local].
    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    pub fn tracks_local(&self) -> Vec<TrackDescriptor> {
        self.state.lock().tracks_local.clone()
    }

    /// Local tracks as a subscriber on another session has to reference them.
    pub fn tracks_remote(&self) -> Vec<TrackDescriptor> {
        self.state.lock().tracks_remote.clone()
    }

    /// Publishes `stream` through a new session.
    pub async fn init_contact_local(
        &self,
        identity: ContactIdentity,
        stream: &MediaStream,
    ) -> NegotiationOutcome {
        let contact = match self.registry.create_contact_peer(identity).await {
            Ok(contact) => contact,
            Err(e) => return NegotiationOutcome::failed(e.to_string()),
        };
        contact
            .add_stream_tracks_to_transceiver(stream, RTCRtpTransceiverDirection::Sendonly)
            .await;
        if contact.transceivers().await.is_empty() {
            return NegotiationOutcome::failed("no transceivers to publish");
        }
        if let Err(e) = contact.create_local_offer().await {
            return NegotiationOutcome::failed(e.to_string());
        }
        let session = self.new_session_local(&contact).await;
        let Some(session_id) = session.session_id.filter(|_| session.valid_result) else {
            return NegotiationOutcome::failed(session.error.unwrap_or_default());
        };
        if let Err(e) = self.wait_ice_connected(&contact).await {
            return NegotiationOutcome::failed(e.to_string());
        }
        if let Err(e) = contact.create_local_offer().await {
            return NegotiationOutcome::failed(e.to_string());
        }
        let info = self.add_track_local(&contact, &session_id).await;
        if !info.valid {
            return NegotiationOutcome { result: false, info };
        }

        let tracks = contact.local_track_descriptors().await;
        let remote = tracks
            .iter()
            .map(|t| TrackDescriptor::remote(t.mid.clone(), t.track_name.clone(), &session_id))
            .collect();
        contact.set_tracks(tracks.clone());
        {
            let mut state = self.state.lock();
            state.tracks_local = tracks;
            state.tracks_remote = remote;
        }
        log::info!("contact {} published session {session_id}", contact.identity());
        NegotiationOutcome { result: true, info }
    }

    /// Subscribes to `tracks` published by the session in `details`. Only a
    /// renegotiation request carrying an answer is raised as an error.
    pub async fn init_contact_remote(
        &self,
        identity: ContactIdentity,
        tracks: Vec<TrackDescriptor>,
        details: &RemoteSessionDetails,
    ) -> Result<NegotiationOutcome, Error> {
        let contact = match self.registry.create_contact_peer(identity).await {
            Ok(contact) => contact,
            Err(e) => return Ok(NegotiationOutcome::failed(e.to_string())),
        };
        contact.set_tracks(tracks.clone());
        contact.set_remote_session_id(&details.session_id);
        for kind in [MediaKind::Audio, MediaKind::Video] {
            if details.media_kinds.contains(&kind) {
                contact
                    .add_tracks_to_transceiver(
                        TransceiverSource::Kind(kind),
                        RTCRtpTransceiverDirection::Inactive,
                    )
                    .await;
            }
        }
        if let Err(e) = contact.create_local_offer().await {
            return Ok(NegotiationOutcome::failed(e.to_string()));
        }
        let session = self.new_session_local(&contact).await;
        if !session.valid_result {
            return Ok(NegotiationOutcome::failed(session.error.unwrap_or_default()));
        }
        if let Err(e) = self.wait_ice_connected(&contact).await {
            return Ok(NegotiationOutcome::failed(e.to_string()));
        }
        if let Err(e) = contact.create_local_offer().await {
            return Ok(NegotiationOutcome::failed(e.to_string()));
        }
        let info = self.add_track_remote(&contact, &tracks).await?;
        Ok(NegotiationOutcome {
            result: info.valid,
            info,
        })
    }

    /// Creates a session from the contact's local offer and applies the
    /// answer it returns.
    pub async fn new_session_local(&self, contact: &ContactPeer) -> NegotiationSession {
        let Some(offer) = contact.local_description().await else {
            return NegotiationSession::failed("contact has no local description");
        };
        let result = self.rest.create_new_session(&offer).await;
        if !result.valid {
            return NegotiationSession::failed(result.error.unwrap_or_default());
        }
        let Some(session_id) = result.field("sessionId").and_then(Value::as_str) else {
            return NegotiationSession::failed("response carries no sessionId");
        };
        if let Some(answer) = result.session_description() {
            if let Err(e) = contact.apply_remote_description(answer).await {
                return NegotiationSession::failed(e.to_string());
            }
        }
        contact.set_local_session_id(session_id);
        self.state.lock().session_id = Some(session_id.to_owned());
        log::debug!("contact {}: session {session_id} created", contact.identity());
        NegotiationSession {
            session_id: Some(session_id.to_owned()),
            valid_result: true,
            error: None,
        }
    }

    /// Reports the contact's sending tracks to `session_id`.
    pub async fn add_track_local(&self, contact: &ContactPeer, session_id: &str) -> ServiceResult {
        let offer = contact.local_description().await;
        let tracks = contact.local_track_descriptors().await;
        let result = self.rest.add_new_track(session_id, offer.as_ref(), &tracks).await;
        if !result.valid {
            return result;
        }
        if let Some(answer) = result.session_description() {
            if let Err(e) = contact.apply_remote_description(answer).await {
                return ServiceResult {
                    valid: false,
                    error: Some(e.to_string()),
                    ..result
                };
            }
        }
        result
    }

    /// Asks the service to forward `tracks` into the contact's session,
    /// renegotiating when the service demands it.
    pub async fn add_track_remote(
        &self,
        contact: &ContactPeer,
        tracks: &[TrackDescriptor],
    ) -> Result<ServiceResult, Error> {
        let Some(session_id) = contact.local_session_id().or_else(|| self.session_id()) else {
            return Ok(ServiceResult::failed("no session to add tracks to"));
        };
        let offer = contact.local_description().await;
        let result = self.rest.add_new_track(&session_id, offer.as_ref(), tracks).await;
        if !result.valid {
            return Ok(result);
        }
        let description = result.session_description();
        let renegotiate = result
            .field("requiresImmediateRenegotiation")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if renegotiate {
            let offer = match description {
                Some(desc) if desc.sdp_type == SdpType::Offer => desc,
                Some(desc) => {
                    return Err(Error::Protocol(format!(
                        "renegotiation requires an offer, service sent {:?}",
                        desc.sdp_type
                    )))
                }
                None => {
                    return Err(Error::Protocol(
                        "renegotiation requested without a session description".into(),
                    ))
                }
            };
            if let Err(e) = contact.apply_remote_description(offer).await {
                return Ok(ServiceResult::failed(e.to_string()));
            }
            let answer = match contact.create_local_answer().await {
                Ok(answer) => answer,
                Err(e) => return Ok(ServiceResult::failed(e.to_string())),
            };
            return Ok(self.rest.renegotiate_session(&session_id, &answer).await);
        }

        if let Some(desc) = description {
            if let Err(e) = contact.apply_remote_description(desc).await {
                return Ok(ServiceResult {
                    valid: false,
                    error: Some(e.to_string()),
                    ..result
                });
            }
        }
        Ok(result)
    }

    /// Sends the contact's current answer to the service.
    pub async fn renegotiate(&self, contact: &ContactPeer) -> ServiceResult {
        let Some(session_id) = contact.local_session_id() else {
            return ServiceResult::failed("contact has no session");
        };
        match contact.create_local_answer().await {
            Ok(answer) => self.rest.renegotiate_session(&session_id, &answer).await,
            Err(e) => ServiceResult::failed(e.to_string()),
        }
    }

    /// Stops forwarding the tracks with the given mids.
    pub async fn close_tracks(
        &self,
        identity: &ContactIdentity,
        mids: &[String],
        force: bool,
    ) -> ServiceResult {
        let Some(contact) = self.registry.lookup(identity).await else {
            return ServiceResult::failed(format!("no contact {identity}"));
        };
        let Some(session_id) = contact.local_session_id() else {
            return ServiceResult::failed("contact has no session");
        };
        let offer = match contact.create_local_offer().await {
            Ok(offer) => offer,
            Err(e) => return ServiceResult::failed(e.to_string()),
        };
        let result = self.rest.close_track(&session_id, &offer, mids, force).await;
        if !result.valid {
            return result;
        }
        if let Some(answer) = result.session_description() {
            if let Err(e) = contact.apply_remote_description(answer).await {
                log::warn!("contact {identity}: failed to apply close answer: {e}");
            }
        }
        let kept = |t: &TrackDescriptor| t.mid.as_ref().map_or(true, |mid| !mids.contains(mid));
        contact.set_tracks(contact.tracks().into_iter().filter(|t| kept(t)).collect());
        let mut state = self.state.lock();
        state.tracks_local.retain(|t| kept(t));
        state.tracks_remote.retain(|t| kept(t));
        drop(state);
        result
    }

    pub async fn session_info(&self) -> ServiceResult {
        match self.session_id() {
            Some(session_id) => self.rest.get_session_information(&session_id).await,
            None => ServiceResult::failed("no session"),
        }
    }

    /// Waits until the contact's ICE connection is up, at most for the
    /// configured timeout.
    pub async fn wait_ice_connected(&self, contact: &ContactPeer) -> Result<(), Error> {
        let mut state = contact.ice_connection_state();
        let connected = async {
            state
                .wait_for(|s| {
                    matches!(
                        s,
                        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
                    )
                })
                .await
                .map(|_| ())
        };
        let outcome = match tokio::time::timeout(self.ice_timeout, connected).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                log::warn!("contact {}: {ICE_TIMEOUT_REASON}", contact.identity());
                Err(Error::Timeout(ICE_TIMEOUT_REASON))
            }
        };
        outcome
    }
}

impl std::fmt::Debug for RestNegotiationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestNegotiationClient")
            .field("rest", &self.rest)
            .field("session_id", &self.session_id())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Options;
    use crate::rest::TrackLocation;
    use crate::testing::{MockConnector, MockFetch};
    use serde_json::json;
    use std::sync::Arc;

    fn client(connector: Arc<MockConnector>, fetch: Arc<MockFetch>) -> RestNegotiationClient {
        let registry = PeerRegistry::with_connector(Options::default(), connector);
        let config = RestConfig::new("https://calls.example/v1/apps/app", "token");
        let rest = RestClient::with_fetch(config, fetch);
        RestNegotiationClient::with_client(registry, rest)
    }

    fn request_paths(fetch: &MockFetch) -> Vec<String> {
        fetch
            .requests()
            .iter()
            .map(|r| r.url.rsplit("/sessions/").next().unwrap_or_default().to_owned())
            .collect()
    }

    #[tokio::test]
    async fn local_publish_mirrors_tracks_for_subscribers() {
        let connector = MockConnector::auto_connect();
        let fetch = MockFetch::new();
        fetch.respond(
            "new",
            Ok(json!({
                "sessionId": "sess-1",
                "sessionDescription": {"type": "answer", "sdp": "v=0"}
            })),
        );
        fetch.respond(
            "add/sess-1",
            Ok(json!({"sessionDescription": {"type": "answer", "sdp": "..."}})),
        );
        let client = client(connector, fetch.clone());
        let stream = MediaStream::with_constraints("local", Default::default());

        let outcome = client
            .init_contact_local(ContactIdentity::new("alice", "app1", false), &stream)
            .await;

        assert!(outcome.result, "{:?}", outcome.info);
        assert_eq!(client.session_id().as_deref(), Some("sess-1"));
        let remote = client.tracks_remote();
        assert_eq!(remote.len(), 2);
        assert!(remote.iter().all(|t| t.location == TrackLocation::Remote));
        assert!(remote.iter().all(|t| t.session_id.as_deref() == Some("sess-1")));
        let mids: Vec<_> = client.tracks_local().into_iter().filter_map(|t| t.mid).collect();
        assert_eq!(mids, vec!["0", "1"]);
        assert_eq!(request_paths(&fetch), vec!["new", "add/sess-1"]);

        let body = fetch.requests()[1].body.clone().unwrap();
        assert_eq!(body["tracks"][0]["location"], json!("local"));
        assert_eq!(body["sessionDescription"]["type"], json!("offer"));
    }

    #[tokio::test]
    async fn failed_session_creation_never_adds_tracks() {
        let fetch = MockFetch::new();
        fetch.respond("new", Err(Error::Http("500 Internal Server Error".into())));
        let client = client(MockConnector::auto_connect(), fetch.clone());
        let stream = MediaStream::with_constraints("local", Default::default());

        let outcome = client
            .init_contact_local(ContactIdentity::new("alice", "app1", false), &stream)
            .await;

        assert!(!outcome.result);
        assert!(outcome.info.error.is_some());
        assert_eq!(request_paths(&fetch), vec!["new"]);
        assert!(client.session_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ice_timeout_fails_the_sequence() {
        let fetch = MockFetch::new();
        fetch.respond(
            "new",
            Ok(json!({
                "sessionId": "sess-1",
                "sessionDescription": {"type": "answer", "sdp": "v=0"}
            })),
        );
        let client = client(MockConnector::new(), fetch.clone());
        let stream = MediaStream::with_constraints("local", Default::default());

        let started = tokio::time::Instant::now();
        let outcome = client
            .init_contact_local(ContactIdentity::new("alice", "app1", false), &stream)
            .await;

        assert!(!outcome.result);
        assert_eq!(outcome.info.error.as_deref(), Some(ICE_TIMEOUT_REASON));
        assert!(started.elapsed() >= Duration::from_millis(5000));
        assert_eq!(request_paths(&fetch), vec!["new"]);
    }

    #[tokio::test]
    async fn renegotiation_with_answer_is_a_protocol_violation() {
        let connector = MockConnector::auto_connect();
        let fetch = MockFetch::new();
        fetch.respond(
            "add/sess-1",
            Ok(json!({
                "requiresImmediateRenegotiation": true,
                "sessionDescription": {"type": "answer", "sdp": "v=0"}
            })),
        );
        let client = client(connector, fetch.clone());
        let contact = client
            .registry()
            .create_contact_peer(ContactIdentity::new("bob", "app1", false))
            .await
            .unwrap();
        contact.create_local_offer().await.unwrap();
        contact.set_local_session_id("sess-1");
        let tracks = vec![TrackDescriptor::remote(Some("0".into()), "cam".into(), "sess-0")];

        let result = client.add_track_remote(&contact, &tracks).await;

        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_eq!(request_paths(&fetch), vec!["add/sess-1"]);
    }

    #[tokio::test]
    async fn remote_subscription_renegotiates_on_offer() {
        let connector = MockConnector::auto_connect();
        let fetch = MockFetch::new();
        fetch.respond(
            "new",
            Ok(json!({
                "sessionId": "sess-2",
                "sessionDescription": {"type": "answer", "sdp": "v=0"}
            })),
        );
        fetch.respond(
            "add/sess-2",
            Ok(json!({
                "requiresImmediateRenegotiation": true,
                "sessionDescription": {"type": "offer", "sdp": "v=0"}
            })),
        );
        fetch.respond("reneg/sess-2", Ok(json!({})));
        let client = client(connector.clone(), fetch.clone());
        let details = RemoteSessionDetails {
            session_id: "sess-1".into(),
            media_kinds: vec![MediaKind::Audio, MediaKind::Video],
        };
        let tracks = vec![
            TrackDescriptor::remote(Some("0".into()), "local-audio".into(), "sess-1"),
            TrackDescriptor::remote(Some("1".into()), "local-video".into(), "sess-1"),
        ];

        let outcome = client
            .init_contact_remote(
                ContactIdentity::new("carol", "app1", false),
                tracks.clone(),
                &details,
            )
            .await
            .unwrap();

        assert!(outcome.result, "{:?}", outcome.info);
        assert_eq!(request_paths(&fetch), vec!["new", "add/sess-2", "reneg/sess-2"]);
        let reneg = fetch.requests()[2].body.clone().unwrap();
        assert_eq!(reneg["sessionDescription"]["type"], json!("answer"));

        let contact = client
            .registry()
            .contact_peer("carol", "app1", false)
            .await
            .unwrap();
        assert_eq!(contact.remote_session_id().as_deref(), Some("sess-1"));
        assert_eq!(contact.tracks(), tracks);
        let directions: Vec<_> = contact.transceivers().await.iter().map(|t| t.direction).collect();
        assert_eq!(
            directions,
            vec![RTCRtpTransceiverDirection::Inactive, RTCRtpTransceiverDirection::Inactive]
        );
        assert_eq!(
            connector.last().remote().map(|d| d.sdp_type),
            Some(SdpType::Offer)
        );
    }
}
