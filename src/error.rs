use thiserror::Error;

/// Failures while turning an inbound audio payload into a playable buffer.
///
/// A decode failure drops the offending message only; the session keeps
/// playing subsequent valid audio.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("PCM payload has odd length {0}; 16-bit samples need an even byte count")]
    OddByteLength(usize),
    #[error("Inline audio is not valid base64: {0}")]
    Base64(String),
    #[error("Cannot convert {from}Hz audio to {to}Hz without the audio-resampling feature")]
    UnsupportedRate { from: u32, to: u32 },
    #[error("Resampling failed: {0}")]
    Resample(String),
}

#[derive(Error, Debug)]
pub enum LiveError {
    #[error("Microphone access was denied")]
    PermissionDenied,
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Handshake did not complete within {0:?}")]
    HandshakeTimeout(std::time::Duration),
    #[error("Audio decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Session not ready")]
    NotReady,
    #[error("Failed to send message to transport task")]
    SendError,
}

pub type LiveResult<T> = Result<T, LiveError>;
