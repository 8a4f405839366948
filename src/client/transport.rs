use crate::error::LiveError;
use crate::types::{
    BidiGenerateContentRealtimeInput, BidiGenerateContentSetup, Blob, ClientMessagePayload,
    LiveServerMessage,
};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// What the remote side reports, delivered in arrival order on the session's
/// event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake acknowledged (`setupComplete`).
    Open,
    Message(LiveServerMessage),
    /// Remote closed without an error.
    Close,
    Error(String),
}

/// Opens live connections.
///
/// `open` may start emitting events (including `Open`) before its future
/// resolves to the link; the session buffers outbound audio until it has both.
pub trait Transport: Send + Sync + 'static {
    fn open(
        &self,
        setup: BidiGenerateContentSetup,
        events: mpsc::Sender<TransportEvent>,
    ) -> BoxFuture<'static, Result<TransportLink, LiveError>>;
}

/// Sending half of an open connection.
#[derive(Debug)]
pub struct TransportLink {
    outgoing: Option<mpsc::Sender<ClientMessagePayload>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TransportLink {
    pub fn new(
        outgoing: mpsc::Sender<ClientMessagePayload>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            outgoing: Some(outgoing),
            shutdown: Some(shutdown),
        }
    }

    /// Fire-and-forget send of one realtime audio blob. Never waits: a full
    /// channel hands the payload back so the caller can retry later.
    pub fn send_realtime_input(&self, audio: Blob) -> Result<(), TrySendError<ClientMessagePayload>> {
        let payload = ClientMessagePayload::RealtimeInput(BidiGenerateContentRealtimeInput {
            audio: Some(audio),
            ..Default::default()
        });
        match &self.outgoing {
            Some(sender) => sender.try_send(payload),
            None => Err(TrySendError::Closed(payload)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing
            .as_ref()
            .is_none_or(|sender| sender.is_closed())
    }

    /// Signals the connection task to close. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            if tx.send(()).is_err() {
                info!("[TransportLink] Shutdown signal not delivered: connection task already gone.");
            } else {
                info!("[TransportLink] Shutdown signal sent to connection task.");
            }
        }
        self.outgoing.take();
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        self.close();
    }
}
