//! WebSocket signalling channel.
//!
//! Outbound frames are plain JSON objects ([SignalMessage]) or one of the bare
//! string requests (`"uniqueids"`, `"applicationids"`, `"uniqueapplication"`).
//! Inbound frames are decoded by [demux] and pushed, in order, into the
//! event sender passed to [SignallingChannel::open].

mod message;

pub use message::{demux, SignalMessage, SignallingEvent};

use crate::contact::ContactIdentity;
use crate::error::Error;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

pub const REQUEST_UNIQUE_IDS: &str = "uniqueids";
pub const REQUEST_APPLICATION_IDS: &str = "applicationids";
pub const REQUEST_UNIQUE_APPLICATION: &str = "uniqueapplication";

enum Link {
    Idle,
    Open {
        outgoing: UnboundedSender<Message>,
        events: UnboundedSender<SignallingEvent>,
        reader: Option<JoinHandle<()>>,
    },
    Closed,
}

/// Duplex JSON channel to the signalling server. It keeps no per-contact
/// state, sends are dropped silently while it is not open.
pub struct SignallingChannel {
    link: Mutex<Link>,
}

impl Default for SignallingChannel {
    fn default() -> Self {
        SignallingChannel {
            link: Mutex::new(Link::Idle),
        }
    }
}

impl SignallingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_open(&self) -> bool {
        matches!(&*self.link.lock(), Link::Open { .. })
    }

    /// Connects to `url`. A transport failure is reported both as
    /// [SignallingEvent::TransportError] and as the returned error.
    pub async fn open(
        self: &Arc<Self>,
        url: &str,
        events: UnboundedSender<SignallingEvent>,
    ) -> Result<(), Error> {
        if self.is_open() {
            log::debug!("signalling channel already open, ignoring open({url})");
            return Ok(());
        }
        match connect_async(url).await {
            Ok((ws, _)) => {
                log::info!("signalling channel connected to {url}");
                self.attach(ws, events);
                Ok(())
            }
            Err(e) => {
                let error: Error = e.into();
                log::warn!("signalling channel failed to connect to {url}: {error}");
                let _ = events.send(SignallingEvent::TransportError(error.to_string()));
                Err(error)
            }
        }
    }

    fn attach<S>(self: &Arc<Self>, ws: S, events: UnboundedSender<SignallingEvent>)
    where
        S: Stream<Item = Result<Message, WsError>>
            + futures_util::Sink<Message, Error = WsError>
            + Send
            + Unpin
            + 'static,
    {
        let (mut ws_write, mut ws_read) = ws.split();
        let (outgoing, mut outgoing_rx) = unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = ws_write.send(msg).await {
                    log::debug!("signalling writer stopped: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let channel = Arc::downgrade(self);
        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => dispatch(&reader_events, &text),
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => dispatch(&reader_events, &text),
                        Err(_) => log::debug!("dropping non utf-8 signalling frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        match &e {
                            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                                log::debug!("signalling websocket closed: {e}")
                            }
                            _ => {
                                log::warn!("signalling websocket error: {e}");
                                let _ = reader_events
                                    .send(SignallingEvent::TransportError(e.to_string()));
                            }
                        }
                        break;
                    }
                }
            }
            remote_closed(&channel);
        });

        *self.link.lock() = Link::Open {
            outgoing,
            events,
            reader: Some(reader),
        };
    }

    /// Sends a JSON frame. No-op unless the channel is open.
    pub fn send(&self, message: &SignalMessage) {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(text),
            Err(e) => log::warn!("failed to serialize signalling frame: {e}"),
        }
    }

    /// Sends a raw text frame. No-op unless the channel is open.
    pub fn send_text(&self, text: impl Into<String>) {
        if let Link::Open { outgoing, .. } = &*self.link.lock() {
            let _ = outgoing.send(Message::Text(text.into()));
        }
    }

    pub fn request_unique_ids(&self) {
        self.send_text(REQUEST_UNIQUE_IDS);
    }

    pub fn request_application_ids(&self) {
        self.send_text(REQUEST_APPLICATION_IDS);
    }

    pub fn request_unique_application(&self) {
        self.send_text(REQUEST_UNIQUE_APPLICATION);
    }

    pub fn send_contact_message(&self, contact: &ContactIdentity, message: impl Into<Value>) {
        let mut frame = SignalMessage::to(contact);
        frame.contact_message = Some(message.into());
        self.send(&frame);
    }

    pub fn send_client_state(&self, contact: &ContactIdentity, state: Value) {
        let mut frame = SignalMessage::to(contact);
        frame.client_state = Some(Value::Bool(true));
        frame.state = Some(state);
        self.send(&frame);
    }

    pub fn send_client_details(&self, contact: &ContactIdentity, details: Value) {
        let mut frame = SignalMessage::to(contact);
        frame.client_details = Some(Value::Bool(true));
        frame.details = Some(details);
        self.send(&frame);
    }

    /// Asks the server whether `contact` is currently connected.
    pub fn send_contact_available(&self, contact: &ContactIdentity) {
        let mut frame = SignalMessage::to(contact);
        frame.contact_available = Some(Value::Bool(true));
        self.send(&frame);
    }

    pub fn send_candidate(&self, contact: &ContactIdentity, candidate: &RTCIceCandidateInit) {
        let mut frame = SignalMessage::to(contact);
        frame.candidate = serde_json::to_value(candidate).ok();
        self.send(&frame);
    }

    pub fn send_typing(&self, contact: &ContactIdentity, typing: bool) {
        let mut frame = SignalMessage::to(contact);
        frame.contact_typing_message = Some(Value::Bool(true));
        frame.typing = Some(Value::Bool(typing));
        self.send(&frame);
    }

    pub fn send_no_answer(&self, contact: &ContactIdentity) {
        let mut frame = SignalMessage::to(contact);
        frame.noanswer = Some(Value::Bool(true));
        self.send(&frame);
    }

    pub fn send_end_call(&self, contact: &ContactIdentity) {
        let mut frame = SignalMessage::to(contact);
        frame.end_call_remote = Some(Value::Bool(true));
        self.send(&frame);
    }

    /// Closes the transport. Further calls are no-ops.
    pub fn close(&self) {
        let link = std::mem::replace(&mut *self.link.lock(), Link::Closed);
        if let Link::Open {
            outgoing,
            events,
            reader,
        } = link
        {
            let _ = outgoing.send(Message::Close(None));
            if let Some(reader) = reader {
                reader.abort();
            }
            log::info!("signalling channel closed");
            let _ = events.send(SignallingEvent::Closed);
        }
    }

    /// Channel that is open without a transport. Frames land in the returned
    /// receiver.
    #[cfg(test)]
    pub(crate) fn capture(
        events: UnboundedSender<SignallingEvent>,
    ) -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<Message>) {
        let (outgoing, rx) = unbounded_channel();
        let channel = Arc::new(SignallingChannel {
            link: Mutex::new(Link::Open {
                outgoing,
                events,
                reader: None,
            }),
        });
        (channel, rx)
    }
}

impl Drop for SignallingChannel {
    fn drop(&mut self) {
        if let Link::Open {
            reader: Some(reader),
            ..
        } = &*self.link.lock()
        {
            reader.abort();
        }
    }
}

fn dispatch(events: &UnboundedSender<SignallingEvent>, text: &str) {
    for event in demux(text) {
        let _ = events.send(event);
    }
}

fn remote_closed(channel: &Weak<SignallingChannel>) {
    if let Some(channel) = channel.upgrade() {
        let link = std::mem::replace(&mut *channel.link.lock(), Link::Closed);
        if let Link::Open { events, .. } = link {
            log::info!("signalling channel closed by remote");
            let _ = events.send(SignallingEvent::Closed);
        }
    }
}

/// Drains the frames captured by [SignallingChannel::capture] as JSON values.
#[cfg(test)]
pub(crate) fn captured(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let Message::Text(text) = msg {
            frames.push(serde_json::from_str(&text).unwrap_or(Value::String(text)));
        }
    }
    frames
}
