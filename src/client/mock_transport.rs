//! Scripted transport for tests: records every handshake and lets the test
//! play the server side.

use super::transport::{Transport, TransportEvent, TransportLink};
use crate::error::LiveError;
use crate::types::{BidiGenerateContentSetup, ClientMessagePayload};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OpenBehavior {
    /// Link resolves and `Open` is emitted straight away.
    Accept,
    /// Link resolves but the server never acknowledges the setup.
    Silent,
    Fail(String),
    /// The connection attempt never completes.
    Hang,
}

struct Inner {
    behavior: OpenBehavior,
    opens: AtomicUsize,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    outgoing: Mutex<Option<mpsc::Receiver<ClientMessagePayload>>>,
    shutdown: Mutex<Option<oneshot::Receiver<()>>>,
    setup: Mutex<Option<BidiGenerateContentSetup>>,
}

#[derive(Clone)]
pub(crate) struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn with_behavior(behavior: OpenBehavior) -> Self {
        Self {
            inner: Arc::new(Inner {
                behavior,
                opens: AtomicUsize::new(0),
                events: Mutex::new(None),
                outgoing: Mutex::new(None),
                shutdown: Mutex::new(None),
                setup: Mutex::new(None),
            }),
        }
    }

    pub fn accepting() -> Self {
        Self::with_behavior(OpenBehavior::Accept)
    }

    pub fn silent() -> Self {
        Self::with_behavior(OpenBehavior::Silent)
    }

    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn last_setup(&self) -> Option<BidiGenerateContentSetup> {
        self.inner.setup.lock().unwrap().clone()
    }

    /// Plays one server event into the most recent connection.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let sender = self.inner.events.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Receiver of everything the session sent on the most recent link.
    pub fn take_outgoing(&self) -> Option<mpsc::Receiver<ClientMessagePayload>> {
        self.inner.outgoing.lock().unwrap().take()
    }

    /// True once the most recent link has been closed or dropped.
    pub fn link_closed(&self) -> bool {
        let mut guard = self.inner.shutdown.lock().unwrap();
        match guard.as_mut() {
            Some(rx) => !matches!(rx.try_recv(), Err(TryRecvError::Empty)),
            None => false,
        }
    }
}

impl Transport for MockTransport {
    fn open(
        &self,
        setup: BidiGenerateContentSetup,
        events: mpsc::Sender<TransportEvent>,
    ) -> BoxFuture<'static, Result<TransportLink, LiveError>> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        *self.inner.setup.lock().unwrap() = Some(setup);
        let behavior = self.inner.behavior.clone();

        match behavior {
            OpenBehavior::Fail(reason) => {
                async move { Err(LiveError::Transport(reason)) }.boxed()
            }
            OpenBehavior::Hang => {
                *self.inner.events.lock().unwrap() = Some(events);
                futures_util::future::pending().boxed()
            }
            OpenBehavior::Accept | OpenBehavior::Silent => {
                let (outgoing_tx, outgoing_rx) = mpsc::channel(64);
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                if behavior == OpenBehavior::Accept {
                    let _ = events.try_send(TransportEvent::Open);
                }
                *self.inner.events.lock().unwrap() = Some(events);
                *self.inner.outgoing.lock().unwrap() = Some(outgoing_rx);
                *self.inner.shutdown.lock().unwrap() = Some(shutdown_rx);
                let link = TransportLink::new(outgoing_tx, shutdown_tx);
                async move { Ok(link) }.boxed()
            }
        }
    }
}
