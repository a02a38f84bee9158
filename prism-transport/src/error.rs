use prism_core::CommandError;

use crate::codec::CodecError;
use crate::protocol::ProtocolError;

/// Transport-level failures.
///
/// Per-command failures travel as [`CommandError`] inside each response;
/// this type covers connecting, configuring and driving a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection not started")]
    NotStarted,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("no stream started for render loop {0:?}")]
    NoStream(String),
    #[error("stream already started for render loop {0:?}")]
    StreamExists(String),
    #[error("rendered handlers need a render-loop state")]
    NotRenderLoop,
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(Box::new(e))
    }
}

impl TransportError {
    /// The error a waiting callback sees when its transport fails.
    pub fn to_command_error(&self) -> CommandError {
        match self {
            TransportError::Command(e) => e.clone(),
            other => CommandError::connection(other.to_string()),
        }
    }
}
