//! Per-component session state
//!
//! Each deployed component owns one session: its socket, its state
//! machine, and the sent-once guard for its function payload. The
//! heavy lifting (queueing, routing, conversion) belongs to the
//! fabric; a session only tracks where one component stands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::store::Language;

use super::channel::ComponentChannel;

/// Lifecycle of a component session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, socket not yet bound
    New,
    /// Socket bound, waiting for the component's ready
    WaitingReady,
    /// Function shipped to the back-end
    FunctionSent,
    /// At least one invocation in flight or completed
    Running,
    /// Stop requested, cleanup in progress
    Closing,
    /// Fully stopped
    Closed,
}

/// One deployed component's session
pub struct ComponentSession {
    /// Component this session belongs to
    pub component_id: String,
    /// Instance identity announced on the socket
    pub instance_id: String,
    /// Session identity used in runtime IDs
    pub session_id: String,
    channel: Arc<dyn ComponentChannel>,
    state: Mutex<SessionState>,
    language: Mutex<Option<Language>>,
    function_sent: AtomicBool,
    cancel_tx: watch::Sender<bool>,
}

impl ComponentSession {
    /// Create a session over an already-bound socket.
    pub fn new(
        component_id: impl Into<String>,
        instance_id: impl Into<String>,
        session_id: impl Into<String>,
        channel: Arc<dyn ComponentChannel>,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            component_id: component_id.into(),
            instance_id: instance_id.into(),
            session_id: session_id.into(),
            channel,
            state: Mutex::new(SessionState::WaitingReady),
            language: Mutex::new(None),
            function_sent: AtomicBool::new(false),
            cancel_tx,
        }
    }

    /// The session's socket
    pub fn channel(&self) -> &Arc<dyn ComponentChannel> {
        &self.channel
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Watch fired when the session is cancelled
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Language of the component's function, once known
    pub fn language(&self) -> Option<Language> {
        *self.language.lock()
    }

    /// Record the function language when it ships.
    pub fn set_language(&self, language: Language) {
        *self.language.lock() = Some(language);
    }

    /// First-time guard for the function payload. True exactly once;
    /// duplicates are suppressed by the caller.
    pub fn mark_function_sent(&self) -> bool {
        let first = !self.function_sent.swap(true, Ordering::SeqCst);
        if first {
            let mut state = self.state.lock();
            if *state == SessionState::WaitingReady {
                *state = SessionState::FunctionSent;
            }
        }
        first
    }

    /// Move to running on the first invocation.
    pub fn mark_running(&self) {
        let mut state = self.state.lock();
        if matches!(*state, SessionState::FunctionSent | SessionState::WaitingReady) {
            *state = SessionState::Running;
        }
    }

    /// Begin shutdown. Idempotent: only the first call wins and
    /// returns true; it fires the cancel watch.
    pub fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, SessionState::Closing | SessionState::Closed) {
            return false;
        }
        *state = SessionState::Closing;
        let _ = self.cancel_tx.send(true);
        true
    }

    /// Final transition after cleanup.
    pub fn finish_close(&self) {
        *self.state.lock() = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::channel::memory_component_pair;

    fn session() -> ComponentSession {
        let (session_side, _component_side) = memory_component_pair();
        ComponentSession::new("comp.1", "inst.1", "sess.1", Arc::new(session_side))
    }

    #[test]
    fn state_machine_walks_forward() {
        let s = session();
        assert_eq!(s.state(), SessionState::WaitingReady);
        assert!(s.mark_function_sent());
        assert_eq!(s.state(), SessionState::FunctionSent);
        s.mark_running();
        assert_eq!(s.state(), SessionState::Running);
    }

    #[test]
    fn function_ships_exactly_once() {
        let s = session();
        assert!(s.mark_function_sent());
        assert!(!s.mark_function_sent());
        assert!(!s.mark_function_sent());
    }

    #[test]
    fn close_is_idempotent_and_fires_cancel() {
        let s = session();
        let cancel = s.cancelled();
        assert!(!*cancel.borrow());

        assert!(s.begin_close());
        assert!(*cancel.borrow());
        assert_eq!(s.state(), SessionState::Closing);

        assert!(!s.begin_close());
        s.finish_close();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(!s.begin_close());
    }
}
