use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::types::ParticipantId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid configuration value: {0}")]
    Config(String),

    /// Asking the registry for a connection to ourselves.
    #[error("Refusing to connect participant {0} to itself")]
    SelfConnection(ParticipantId),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Operation not valid in the session's current lifecycle state.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Why local capture could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("No capture device found for {0}")]
    NotFound(String),

    #[error("Capture permission denied for {0}")]
    PermissionDenied(String),

    #[error("Capture device error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, Error>;
