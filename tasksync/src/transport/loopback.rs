//! Loopback transport for testing.
//!
//! [`LoopbackTransport`] talks to no server at all. A paired
//! [`LoopbackController`] plays the remote side: it injects snapshots and
//! link changes into the listening orchestrator and records every
//! broadcast and forced poll for assertions.

use std::sync::Arc;

use parking_lot::Mutex;
use tasksync_proto::remote::RemoteVersion;
use tokio::sync::mpsc;

use super::{LinkStatus, Transport, TransportError, TransportEvent, TransportFactory, TransportKind};
use crate::auth::Identity;
use crate::remote::RemoteError;

#[derive(Debug, Default)]
struct State {
    sink: Option<mpsc::Sender<TransportEvent>>,
    broadcasts: Vec<Vec<u8>>,
    force_polls: usize,
    created_for: Vec<Identity>,
    last_version: u64,
    fail_broadcasts: bool,
}

/// In-process [`Transport`] driven by a [`LoopbackController`].
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    state: Arc<Mutex<State>>,
}

/// Remote side of a [`LoopbackTransport`].
#[derive(Debug, Clone)]
pub struct LoopbackController {
    state: Arc<Mutex<State>>,
}

impl LoopbackTransport {
    /// Creates a transport and its controller.
    #[must_use]
    pub fn new() -> (Self, LoopbackController) {
        let state = Arc::new(Mutex::new(State::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            LoopbackController { state },
        )
    }
}

impl Transport for LoopbackTransport {
    async fn broadcast(&self, payload: Vec<u8>) -> Result<RemoteVersion, TransportError> {
        let mut state = self.state.lock();
        if state.fail_broadcasts {
            return Err(TransportError::Remote(RemoteError::Network(
                "loopback offline".to_string(),
            )));
        }
        state.broadcasts.push(payload);
        state.last_version += 1;
        Ok(RemoteVersion(state.last_version))
    }

    fn start_listening(&self, sink: mpsc::Sender<TransportEvent>) {
        self.state.lock().sink = Some(sink);
    }

    fn stop(&self) {
        self.state.lock().sink = None;
    }

    fn force_poll(&self) {
        self.state.lock().force_polls += 1;
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }
}

impl LoopbackController {
    fn sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.state.lock().sink.clone()
    }

    /// Delivers a remote snapshot. Returns `false` if nobody is listening.
    pub async fn deliver(&self, payload: Vec<u8>) -> bool {
        let Some(sink) = self.sender() else {
            return false;
        };
        let version = {
            let mut state = self.state.lock();
            state.last_version += 1;
            RemoteVersion(state.last_version)
        };
        sink.send(TransportEvent::Remote { version, payload })
            .await
            .is_ok()
    }

    /// Reports a link change. Returns `false` if nobody is listening.
    pub async fn set_link(&self, status: LinkStatus) -> bool {
        let Some(sink) = self.sender() else {
            return false;
        };
        sink.send(TransportEvent::Link(status)).await.is_ok()
    }

    /// Makes broadcasts fail (or succeed again).
    pub fn fail_broadcasts(&self, fail: bool) {
        self.state.lock().fail_broadcasts = fail;
    }

    /// Every payload broadcast so far, oldest first.
    #[must_use]
    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.state.lock().broadcasts.clone()
    }

    /// Number of broadcasts so far.
    #[must_use]
    pub fn broadcast_count(&self) -> usize {
        self.state.lock().broadcasts.len()
    }

    /// Number of forced polls so far.
    #[must_use]
    pub fn force_poll_count(&self) -> usize {
        self.state.lock().force_polls
    }

    /// Whether a listener is attached.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.state.lock().sink.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Identities the paired factory created transports for.
    #[must_use]
    pub fn created_for(&self) -> Vec<Identity> {
        self.state.lock().created_for.clone()
    }
}

/// [`TransportFactory`] whose transports all share one controller.
#[derive(Debug, Clone)]
pub struct LoopbackFactory {
    state: Arc<Mutex<State>>,
}

impl LoopbackFactory {
    /// Creates a factory and the controller of every transport it builds.
    #[must_use]
    pub fn new() -> (Self, LoopbackController) {
        let state = Arc::new(Mutex::new(State::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            LoopbackController { state },
        )
    }
}

impl TransportFactory for LoopbackFactory {
    type Transport = LoopbackTransport;

    fn create(&self, identity: &Identity) -> Result<LoopbackTransport, TransportError> {
        let mut state = self.state.lock();
        state.created_for.push(identity.clone());
        state.sink = None;
        drop(state);
        Ok(LoopbackTransport {
            state: Arc::clone(&self.state),
        })
    }
}
