use crate::contact::ContactIdentity;
use crate::error::Error;
use crate::file_transfer::FileMetadata;
use crate::media::{RemoteStream, RemoteTrack};
use crate::signalling::SignallingEvent;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Everything an application can observe, signalling and contacts alike.
#[derive(Debug, Clone)]
pub enum Event {
    Signal(SignallingEvent),
    ContactCreated(ContactIdentity),
    Contact {
        contact: ContactIdentity,
        event: ContactEvent,
    },
    /// An application level operation failed. The same error was returned
    /// to its caller.
    Failed {
        contact: Option<ContactIdentity>,
        operation: &'static str,
        error: Error,
    },
    RegistryClosed,
}

#[derive(Debug, Clone)]
pub enum ContactEvent {
    IceCandidate(RTCIceCandidateInit),
    IceConnectionState(RTCIceConnectionState),
    ConnectionState(RTCPeerConnectionState),
    NegotiationNeeded,
    Track(RemoteTrack),
    /// A composed remote stream was handed to the media sink.
    StreamAttached(RemoteStream),
    DataChannelOpen {
        label: String,
    },
    FileSendProgress {
        sent: u64,
        total: u64,
    },
    FileSent {
        file: FileMetadata,
    },
    FileReceiveProgress {
        received: u64,
        total: u64,
    },
    FileReceived {
        file: FileMetadata,
        data: Bytes,
    },
    Closed,
}

/// Fan-out of [Event]s to any number of subscribers. Subscribers that went
/// away are dropped on the next emit.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<UnboundedSender<Event>>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> Events {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().push(tx);
        Events(rx)
    }

    pub fn emit(&self, event: Event) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn contact(&self, contact: &ContactIdentity, event: ContactEvent) {
        self.emit(Event::Contact {
            contact: contact.clone(),
            event,
        });
    }
}

/// Receiving end of an [EventBus] subscription.
#[derive(Debug)]
pub struct Events(UnboundedReceiver<Event>);

impl Events {
    pub async fn next(&mut self) -> Option<Event> {
        self.0.recv().await
    }

    /// Returns an already queued event without waiting.
    pub fn try_next(&mut self) -> Option<Event> {
        self.0.try_recv().ok()
    }

    /// Collects every event queued so far.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.try_next() {
            events.push(event);
        }
        events
    }
}
