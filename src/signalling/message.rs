use crate::connection::{SdpType, SessionDescription};
use crate::contact::ContactIdentity;
use crate::file_transfer::FileMetadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Flat signalling frame. Which fields are present decides what the frame
/// means, a single inbound frame may carry several facts at once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "contactUniqueID", skip_serializing_if = "Option::is_none")]
    pub contact_unique_id: Option<String>,
    #[serde(rename = "contactApplicationID", skip_serializing_if = "Option::is_none")]
    pub contact_application_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applications: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uniques: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_available: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_message: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
    /// SDP type when `sdp` is a bare string, otherwise the MIME type of an
    /// offered file.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_data: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_offer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_answer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_conference_offer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_conference_answer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conference_call: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_transfer_offer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_transfer_answer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noanswer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_call_remote: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_typing_message: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typing: Option<Value>,
}

impl SignalMessage {
    /// Empty frame addressed to `contact`.
    pub fn to(contact: &ContactIdentity) -> Self {
        SignalMessage {
            contact_unique_id: Some(contact.unique_id.clone()),
            contact_application_id: Some(contact.application_id.clone()),
            is_data: Some(contact.is_data),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, desc: &SessionDescription) -> Self {
        self.sdp = serde_json::to_value(desc).ok();
        self
    }

    pub fn with_file(mut self, file: &FileMetadata) -> Self {
        self.name = Some(file.name.clone());
        self.size = Some(file.size);
        self.kind = Some(file.mime_type.clone());
        self.last_modified = Some(file.last_modified);
        self
    }

    fn contact(&self) -> ContactIdentity {
        ContactIdentity::new(
            self.contact_unique_id.as_deref().unwrap_or_default(),
            self.contact_application_id.as_deref().unwrap_or_default(),
            self.is_data.unwrap_or(false),
        )
    }

    fn description(&self) -> Option<SessionDescription> {
        match self.sdp.as_ref()? {
            Value::String(sdp) => {
                let sdp_type: SdpType =
                    serde_json::from_value(Value::String(self.kind.clone()?)).ok()?;
                Some(SessionDescription {
                    sdp_type,
                    sdp: sdp.clone(),
                })
            }
            other => serde_json::from_value(other.clone()).ok(),
        }
    }

    fn ice_candidate(&self) -> Option<RTCIceCandidateInit> {
        match self.candidate.as_ref()? {
            Value::String(candidate) => Some(RTCIceCandidateInit {
                candidate: candidate.clone(),
                ..Default::default()
            }),
            other => serde_json::from_value(other.clone()).ok(),
        }
    }

    fn file(&self) -> FileMetadata {
        FileMetadata {
            name: self.name.clone().unwrap_or_default(),
            size: self.size.unwrap_or_default(),
            mime_type: self.kind.clone().unwrap_or_default(),
            last_modified: self.last_modified.unwrap_or_default(),
        }
    }
}

/// Typed meaning of an inbound signalling frame.
#[derive(Debug, Clone)]
pub enum SignallingEvent {
    /// Frame was not JSON or carried no `response` marker.
    UnknownError(String),
    Error(Value),
    Applications(Value),
    Uniques(Value),
    Groups(Value),
    Settings(Value),
    ContactAvailable {
        contact: ContactIdentity,
        available: Value,
    },
    ContactMessage {
        contact: ContactIdentity,
        message: Value,
    },
    ClientState {
        contact: ContactIdentity,
        state: Value,
    },
    ClientDetails {
        contact: ContactIdentity,
        details: Value,
    },
    Sdp {
        contact: ContactIdentity,
        description: SessionDescription,
    },
    Candidate {
        contact: ContactIdentity,
        candidate: RTCIceCandidateInit,
    },
    CallOffer {
        contact: ContactIdentity,
    },
    CallAnswer {
        contact: ContactIdentity,
    },
    JoinConferenceOffer {
        contact: ContactIdentity,
        conference_call: Option<Value>,
    },
    JoinConferenceAnswer {
        contact: ContactIdentity,
    },
    FileTransferOffer {
        contact: ContactIdentity,
        file: FileMetadata,
    },
    FileTransferAnswer {
        contact: ContactIdentity,
    },
    NoAnswer {
        contact: ContactIdentity,
    },
    EndCallRemote {
        contact: ContactIdentity,
    },
    ContactTyping {
        contact: ContactIdentity,
        typing: bool,
    },
    SelfAvailable {
        contact: ContactIdentity,
    },
    ContactUnavailable {
        contact: ContactIdentity,
    },
    TransportError(String),
    Closed,
}

fn truthy(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Splits one inbound frame into the events it carries, in field-check order.
pub fn demux(text: &str) -> Vec<SignallingEvent> {
    let signal: SignalMessage = match serde_json::from_str(text) {
        Ok(signal) => signal,
        Err(_) => return vec![SignallingEvent::UnknownError(text.to_owned())],
    };
    if signal.response.is_none() {
        return vec![SignallingEvent::UnknownError(text.to_owned())];
    }
    if let Some(error) = signal.error {
        return vec![SignallingEvent::Error(error)];
    }

    let contact = signal.contact();
    let mut events = Vec::new();
    if let Some(applications) = &signal.applications {
        events.push(SignallingEvent::Applications(applications.clone()));
    } else if let Some(uniques) = &signal.uniques {
        events.push(SignallingEvent::Uniques(uniques.clone()));
    } else if let Some(groups) = &signal.groups {
        events.push(SignallingEvent::Groups(groups.clone()));
    } else if let Some(settings) = &signal.settings {
        events.push(SignallingEvent::Settings(settings.clone()));
    } else if let Some(available) = &signal.contact_available {
        events.push(SignallingEvent::ContactAvailable {
            contact,
            available: available.clone(),
        });
    } else if let Some(message) = &signal.contact_message {
        events.push(SignallingEvent::ContactMessage {
            contact,
            message: message.clone(),
        });
    } else if signal.client_state.is_some() {
        let state = signal.state.clone().or(signal.client_state.clone());
        events.push(SignallingEvent::ClientState {
            contact,
            state: state.unwrap_or_default(),
        });
    } else if signal.client_details.is_some() {
        let details = signal.details.clone().or(signal.client_details.clone());
        events.push(SignallingEvent::ClientDetails {
            contact,
            details: details.unwrap_or_default(),
        });
    } else if let Some(available) = &signal.available {
        if available == &Value::Bool(true) {
            remote_signal(&signal, contact, &mut events);
        } else {
            events.push(SignallingEvent::ContactUnavailable { contact });
        }
    }
    events
}

/// Second tier of an `available` frame: every marker fires on its own.
fn remote_signal(
    signal: &SignalMessage,
    contact: ContactIdentity,
    events: &mut Vec<SignallingEvent>,
) {
    if truthy(&signal.sdp) {
        match signal.description() {
            Some(description) => events.push(SignallingEvent::Sdp {
                contact: contact.clone(),
                description,
            }),
            None => log::debug!("dropping unparsable sdp from {contact}"),
        }
    }
    if truthy(&signal.candidate) {
        match signal.ice_candidate() {
            Some(candidate) => events.push(SignallingEvent::Candidate {
                contact: contact.clone(),
                candidate,
            }),
            None => log::debug!("dropping unparsable candidate from {contact}"),
        }
    }
    if truthy(&signal.call_offer) {
        events.push(SignallingEvent::CallOffer {
            contact: contact.clone(),
        });
    }
    if truthy(&signal.call_answer) {
        events.push(SignallingEvent::CallAnswer {
            contact: contact.clone(),
        });
    }
    if truthy(&signal.join_conference_offer) {
        events.push(SignallingEvent::JoinConferenceOffer {
            contact: contact.clone(),
            conference_call: signal.conference_call.clone(),
        });
    }
    if truthy(&signal.join_conference_answer) {
        events.push(SignallingEvent::JoinConferenceAnswer {
            contact: contact.clone(),
        });
    }
    if truthy(&signal.file_transfer_offer) {
        events.push(SignallingEvent::FileTransferOffer {
            contact: contact.clone(),
            file: signal.file(),
        });
    }
    if truthy(&signal.file_transfer_answer) {
        events.push(SignallingEvent::FileTransferAnswer {
            contact: contact.clone(),
        });
    }
    if truthy(&signal.noanswer) {
        events.push(SignallingEvent::NoAnswer {
            contact: contact.clone(),
        });
    }
    if truthy(&signal.end_call_remote) {
        events.push(SignallingEvent::EndCallRemote {
            contact: contact.clone(),
        });
    }
    if truthy(&signal.contact_typing_message) {
        events.push(SignallingEvent::ContactTyping {
            contact,
            typing: truthy(&signal.typing),
        });
    } else {
        events.push(SignallingEvent::SelfAvailable { contact });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_response_is_unknown_error() {
        let events = demux(r#"{"applications": []}"#);
        assert!(matches!(events.as_slice(), [SignallingEvent::UnknownError(_)]));
        let events = demux("not json");
        assert!(matches!(events.as_slice(), [SignallingEvent::UnknownError(_)]));
    }

    #[test]
    fn error_short_circuits_other_markers() {
        let events = demux(r#"{"response": true, "error": "denied", "applications": ["a"]}"#);
        assert!(matches!(events.as_slice(), [SignallingEvent::Error(e)] if e == "denied"));
    }

    #[test]
    fn first_tier_fires_exactly_one_event() {
        let events = demux(r#"{"response": true, "uniques": ["u1"], "groups": ["g"]}"#);
        assert!(matches!(events.as_slice(), [SignallingEvent::Uniques(u)] if u == &json!(["u1"])));

        let events = demux(
            r#"{"response": true, "contactUniqueID": "bob", "contactApplicationID": "app",
                "clientState": true, "state": {"busy": true}}"#,
        );
        match events.as_slice() {
            [SignallingEvent::ClientState { contact, state }] => {
                assert_eq!(contact, &ContactIdentity::new("bob", "app", false));
                assert_eq!(state, &json!({"busy": true}));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn one_frame_fires_several_remote_events_in_order() {
        let frame = json!({
            "response": true,
            "available": true,
            "contactUniqueID": "alice",
            "contactApplicationID": "app1",
            "sdp": {"type": "offer", "sdp": "v=0"},
            "candidate": {
                "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            },
            "callOffer": true
        });
        let events = demux(&frame.to_string());
        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[0],
            SignallingEvent::Sdp { description, .. } if description.is_offer()
        ));
        let SignallingEvent::Candidate { candidate, .. } = &events[1] else {
            panic!("expected a candidate, got {:?}", events[1]);
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert!(matches!(&events[2], SignallingEvent::CallOffer { .. }));
        assert!(matches!(&events[3], SignallingEvent::SelfAvailable { .. }));
    }

    #[test]
    fn file_offer_keeps_mime_type_apart_from_sdp_type() {
        let frame = json!({
            "response": true,
            "available": true,
            "contactUniqueID": "alice",
            "contactApplicationID": "app1",
            "isData": true,
            "sdp": {"type": "offer", "sdp": "v=0"},
            "fileTransferOffer": true,
            "name": "notes.txt",
            "size": 12,
            "type": "text/plain",
            "lastModified": 99
        });
        let events = demux(&frame.to_string());
        match &events[1] {
            SignallingEvent::FileTransferOffer { contact, file } => {
                assert!(contact.is_data);
                assert_eq!(file.mime_type, "text/plain");
                assert_eq!(file.size, 12);
                assert_eq!(file.last_modified, 99);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn typing_replaces_self_available() {
        let events = demux(
            r#"{"response": true, "available": true, "contactUniqueID": "a",
                "contactTypingMessage": true, "typing": true}"#,
        );
        assert!(matches!(events.as_slice(), [SignallingEvent::ContactTyping { typing: true, .. }]));

        let events = demux(r#"{"response": true, "available": false, "contactUniqueID": "a"}"#);
        assert!(matches!(events.as_slice(), [SignallingEvent::ContactUnavailable { .. }]));
    }

    #[test]
    fn outbound_frame_omits_absent_fields() {
        let contact = ContactIdentity::new("bob", "app", true);
        let frame =
            SignalMessage::to(&contact).with_description(&SessionDescription::answer("v=0"));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "contactUniqueID": "bob",
                "contactApplicationID": "app",
                "isData": true,
                "sdp": {"type": "answer", "sdp": "v=0"}
            })
        );
    }
}
