use super::ConnectionState;
use super::session::{SessionContext, run_session};
use super::state::StatePublisher;
use super::transport::Transport;
use crate::audio::ActivitySignal;
use crate::config::LiveConfig;
use crate::device::AudioBackend;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

struct ActiveSession {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Entry point for the UI: starts and stops live voice sessions and exposes
/// their state and microphone activity.
///
/// At most one session runs at a time. `connect` while a session is
/// connecting or connected does nothing; `disconnect` is safe to call in any
/// state and returns once every resource of the session has been released.
pub struct LiveSessionManager {
    pub(crate) config: Arc<LiveConfig>,
    pub(crate) backend: Arc<dyn AudioBackend>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) runtime: Handle,
    pub(crate) state: Arc<StatePublisher>,
    pub(crate) activity: ActivitySignal,
    pub(crate) last_error: Arc<Mutex<Option<String>>>,
    active: Mutex<Option<ActiveSession>>,
    teardown_gate: TokioMutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LiveSessionManager {
    pub(crate) fn new(
        config: LiveConfig,
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            transport,
            runtime,
            state: Arc::new(StatePublisher::new()),
            activity: ActivitySignal::new(),
            last_error: Arc::new(Mutex::new(None)),
            active: Mutex::new(None),
            teardown_gate: TokioMutex::new(()),
        }
    }

    /// Starts a new session unless one is already connecting or connected.
    /// Returns whether a connection attempt was started.
    pub fn connect(&self) -> bool {
        let mut active = lock(&self.active);
        let previous = match self.state.begin_connecting() {
            Ok(previous) => previous,
            Err(current) => {
                debug!("[Manager] connect ignored: session already {}.", current);
                return false;
            }
        };
        if let Some(finished) = active.take() {
            // Its task has already published a final state and released everything.
            let _ = finished.shutdown_tx.send(());
        }

        *lock(&self.last_error) = None;
        info!("[Manager] Connecting (previous state: {}).", previous);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let ctx = SessionContext {
            config: self.config.clone(),
            backend: self.backend.clone(),
            transport: self.transport.clone(),
            state: self.state.clone(),
            activity: self.activity.clone(),
            last_error: self.last_error.clone(),
        };
        let task = self.runtime.spawn(run_session(ctx, shutdown_rx));
        *active = Some(ActiveSession { shutdown_tx, task });
        true
    }

    /// Ends the current session, if any, and waits for its teardown.
    /// Leaves the manager `Disconnected`.
    pub async fn disconnect(&self) {
        let _gate = self.teardown_gate.lock().await;
        let active = lock(&self.active).take();
        if let Some(ActiveSession { shutdown_tx, task }) = active {
            info!("[Manager] Disconnect requested.");
            if shutdown_tx.send(()).is_err() {
                debug!("[Manager] Session task had already finished.");
            }
            if let Err(e) = task.await {
                error!("[Manager] Session task ended abnormally: {}", e);
            }
        }

        // A connect that raced this call owns the state now.
        if lock(&self.active).is_none() {
            self.activity.reset();
            self.state.publish(ConnectionState::Disconnected);
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Latest state only. A failed session passes through `Error` before
    /// settling on `Disconnected`, which a slow reader may not observe here.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Every state change in order, including the transient `Error`.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.state.transitions()
    }

    /// Latest microphone activity level in [0, 1].
    pub fn volume(&self) -> f32 {
        self.activity.current()
    }

    pub fn subscribe_volume(&self) -> watch::Receiver<f32> {
        self.activity.subscribe()
    }

    /// Why the last session failed. Kept after the manager settles on
    /// `Disconnected` and cleared by the next `connect`.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }
}

impl Drop for LiveSessionManager {
    fn drop(&mut self) {
        let active = self.active.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(session) = active.take() {
            if session.shutdown_tx.send(()).is_ok() {
                info!("[Manager] Dropped with a live session; shutdown signalled.");
            }
        }
    }
}
