use std::sync::Arc;

/// Errors raised across the crate. Cheap to clone, so the same failure can be
/// handed to a caller and also published on the event bus.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRtc(Arc<webrtc::Error>),
    #[error("signalling transport failure: {0}")]
    Transport(String),
    #[error("http request failed: {0}")]
    Http(String),
    #[error(transparent)]
    Json(Arc<serde_json::Error>),
    #[error(transparent)]
    Io(Arc<std::io::Error>),
    /// The remote side (signalling server or negotiation service) answered with
    /// something the negotiation state does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("{0}")]
    Timeout(&'static str),
    #[error("contact peer is closed")]
    Closed,
    #[error("data channel is not open")]
    ChannelClosed,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl Error {
    pub fn channel_closed() -> Self {
        Error::ChannelClosed
    }
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::WebRtc(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Http(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(value.to_string())
    }
}
