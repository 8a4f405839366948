pub mod builder;
pub mod handle;
pub mod outbound;
pub mod transport;

mod connection;
mod session;
mod state;

#[cfg(test)]
pub(crate) mod mock_transport;

pub use builder::LiveSessionBuilder;
pub use connection::{GEMINI_LIVE_WS_URL, GeminiLiveTransport};
pub use handle::LiveSessionManager;
pub use transport::{Transport, TransportEvent, TransportLink};

/// Lifecycle of the live session as the UI sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// A session task is running, so `connect` is ignored.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}
