use super::ConnectionState;
use tokio::sync::{broadcast, watch};
use tracing::debug;

const TRANSITION_CAPACITY: usize = 16;

/// Single writer for the session state.
///
/// `watch` receivers only see the latest value, so a failure that passes
/// through `Error` on its way back to `Disconnected` can be missed there.
/// Transition receivers get every change, in publication order.
///
/// Every update runs under the watch lock, which keeps both channels in the
/// same order and makes compound updates atomic for other writers.
#[derive(Debug)]
pub(crate) struct StatePublisher {
    current: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl StatePublisher {
    pub fn new() -> Self {
        let (current, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            current,
            transitions,
        }
    }

    fn step(&self, state: &mut ConnectionState, next: ConnectionState) -> bool {
        if *state == next {
            return false;
        }
        debug!("[State] {} -> {}", state, next);
        *state = next;
        let _ = self.transitions.send(next);
        true
    }

    /// Publishes `next` if it differs from the current state.
    pub fn publish(&self, next: ConnectionState) -> bool {
        self.current.send_if_modified(|state| self.step(state, next))
    }

    /// Publishes each state in turn without letting another writer in between.
    pub fn publish_all(&self, states: &[ConnectionState]) -> bool {
        self.current.send_if_modified(|state| {
            states
                .iter()
                .fold(false, |changed, next| self.step(state, *next) || changed)
        })
    }

    /// Moves to `Connecting` unless a session is already active. Returns the
    /// state that was replaced, or the active state that blocked the move.
    pub fn begin_connecting(&self) -> Result<ConnectionState, ConnectionState> {
        let mut outcome = Err(ConnectionState::Connecting);
        self.current.send_if_modified(|state| {
            if state.is_active() {
                outcome = Err(*state);
                return false;
            }
            outcome = Ok(*state);
            self.step(state, ConnectionState::Connecting)
        });
        outcome
    }

    pub fn current(&self) -> ConnectionState {
        *self.current.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.current.subscribe()
    }

    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }
}
