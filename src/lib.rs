//! `wrtc-call` is a call orchestration toolkit built on top of [webrtc](https://webrtc.rs):
//! - A WebSocket signalling channel relays session descriptions, ICE candidates and
//!   application messages as flat JSON frames.
//! - A registry keeps exactly one contact peer (one peer connection) per remote identity,
//!   optionally doubled by a data-only peer for file transfers.
//! - Remote tracks that arrive independently are composed into a single stream.
//! - An alternative negotiation path publishes and subscribes to media through a
//!   session-based REST service instead of relaying SDP over signalling.
//!
//! Everything observable is delivered through one [Event] stream.
//!
//! # Examples
//!
//! ```rust,no_run
//! use wrtc_call::{CallOrchestrator, ContactIdentity, Error, Event, Options, StreamConstraints};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let options = Options {
//!         signalling_url: Some("wss://signalling.example/ws".into()),
//!         ..Options::default()
//!     };
//!     let app = CallOrchestrator::new(options);
//!     let mut events = app.subscribe();
//!     app.connect().await?;
//!     app.create_stream(StreamConstraints::default());
//!
//!     let bob = ContactIdentity::new("bob", "chat", false);
//!     app.call(&bob).await?;
//!
//!     while let Some(event) = events.next().await {
//!         match event {
//!             Event::Contact { contact, event } => println!("{contact}: {event:?}"),
//!             Event::RegistryClosed => break,
//!             other => println!("{other:?}"),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod config;
pub mod connection;
pub mod contact;
pub mod data_channel;
pub mod error;
pub mod event;
pub mod file_transfer;
pub mod media;
pub mod registry;
pub mod rest;
pub mod signalling;

#[cfg(test)]
pub(crate) mod testing;

pub use call::CallOrchestrator;
pub use config::{Options, RestConfig};
pub use connection::{Connection, Connector, RtcConnector, SessionDescription};
pub use contact::{ContactIdentity, ContactPeer, ContactState};
pub use data_channel::DataChannel;
pub use error::Error;
pub use event::{ContactEvent, Event, EventBus, Events};
pub use file_transfer::{DiskFile, FileMetadata, FileSource, MemoryFile};
pub use media::{MediaKind, MediaSink, MediaStream, StreamConstraints};
pub use registry::PeerRegistry;
pub use rest::{RestClient, RestNegotiationClient};
pub use signalling::{SignallingChannel, SignallingEvent};
