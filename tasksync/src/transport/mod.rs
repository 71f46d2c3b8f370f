//! Remote transport layer for `TaskSync`.
//!
//! Defines the [`Transport`] trait through which the orchestrator publishes
//! snapshots and learns about remote changes. Concrete implementations:
//! - [`poller::PollingTransport`]: periodic REST polling with backoff
//! - [`push::PushTransport`]: WebSocket subscription with REST writes
//! - [`loopback::LoopbackTransport`]: in-process fake for testing
//!
//! [`AnyTransport`] picks between polling and push at runtime, driven by
//! configuration.

pub mod backoff;
pub mod loopback;
pub mod poller;
pub mod push;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use tasksync_proto::remote::{DeviceId, RemoteEnvelope, RemoteVersion};
use tokio::sync::mpsc;

use crate::auth::{AuthError, AuthToken, Identity, TokenProvider};
use crate::remote::http::HttpRemoteStore;
use crate::remote::{RemoteError, RemoteStore};

use self::backoff::BackoffPolicy;
use self::poller::PollingTransport;
use self::push::PushTransport;

/// Which strategy a transport uses to learn about remote changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Periodic REST polling.
    #[default]
    Poll,
    /// Server push over a WebSocket subscription.
    Push,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poll => write!(f, "poll"),
            Self::Push => write!(f, "push"),
            Self::Loopback => write!(f, "loopback"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    /// Parses the configurable strategies. `loopback` is not selectable.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "poll" | "polling" => Ok(Self::Poll),
            "push" | "subscribe" => Ok(Self::Push),
            other => Err(format!("unknown transport {other:?} (expected poll or push)")),
        }
    }
}

/// Connectivity as reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// The remote is reachable.
    Connected,
    /// The remote has been failing; the message is user-visible.
    Error(String),
}

/// Events a listening transport delivers to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote snapshot that passed deduplication.
    Remote {
        /// Version marker of the snapshot.
        version: RemoteVersion,
        /// Serialized document.
        payload: Vec<u8>,
    },
    /// Connectivity changed.
    Link(LinkStatus),
}

/// Errors that can occur during transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No token could be obtained.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The remote rejected a freshly refreshed token.
    #[error("authentication rejected, sign in again")]
    AuthRejected,

    /// The remote call failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The subscription socket closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport was stopped.
    #[error("transport stopped")]
    Stopped,
}

impl TransportError {
    /// Returns `true` for failures that need user action and must be
    /// surfaced immediately rather than after the failure threshold.
    #[must_use]
    pub const fn is_hard(&self) -> bool {
        matches!(self, Self::AuthRejected | Self::Auth(_))
    }
}

/// Push / pull access to the single shared remote document of an account.
///
/// A transport is created per signed-in identity and discarded on
/// sign-out.
pub trait Transport: Send + Sync + 'static {
    /// Replaces the remote document with `payload`.
    ///
    /// Returns the version the remote assigned to the write.
    fn broadcast(
        &self,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<RemoteVersion, TransportError>> + Send;

    /// Starts delivering [`TransportEvent`]s to `sink` from a background task.
    ///
    /// The first fetch happens immediately. Calling this while already
    /// listening restarts the background task.
    fn start_listening(&self, sink: mpsc::Sender<TransportEvent>);

    /// Stops listening. Results of requests still in flight are discarded.
    fn stop(&self);

    /// Requests an immediate fetch, bypassing the backoff timer.
    ///
    /// Dropped if a fetch is already in flight.
    fn force_poll(&self);

    /// Returns the strategy of this transport.
    fn kind(&self) -> TransportKind;
}

/// Builds a transport for a freshly signed-in identity.
pub trait TransportFactory: Send + Sync + 'static {
    /// Transport type produced by this factory.
    type Transport: Transport;

    /// Creates an idle transport for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the transport cannot be configured.
    fn create(&self, identity: &Identity) -> Result<Self::Transport, TransportError>;
}

impl<F, T> TransportFactory for F
where
    F: Fn(&Identity) -> Result<T, TransportError> + Send + Sync + 'static,
    T: Transport,
{
    type Transport = T;

    fn create(&self, identity: &Identity) -> Result<T, TransportError> {
        self(identity)
    }
}

/// Runs a remote call with a token, refreshing the token once on rejection.
///
/// A second rejection after the refresh becomes
/// [`TransportError::AuthRejected`] and is not retried.
///
/// # Errors
///
/// Returns [`TransportError`] if no token is available, the call fails, or
/// the refreshed token is rejected too.
pub async fn with_auth_retry<P, F, Fut, T>(provider: &P, mut call: F) -> Result<T, TransportError>
where
    P: TokenProvider,
    F: FnMut(AuthToken) -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let token = provider.valid_token(false).await?;
    match call(token).await {
        Err(e) if e.is_auth() => {
            tracing::info!(error = %e, "remote rejected token, refreshing");
            let token = provider.valid_token(true).await?;
            match call(token).await {
                Err(e) if e.is_auth() => {
                    tracing::warn!(error = %e, "remote rejected refreshed token");
                    Err(TransportError::AuthRejected)
                }
                other => other.map_err(TransportError::from),
            }
        }
        other => other.map_err(TransportError::from),
    }
}

/// Filters out remote snapshots this device wrote or already applied.
///
/// The first snapshot seen after construction is accepted even if this
/// device wrote it: a new listening session starts from an empty or freshly
/// loaded document and must learn the remote baseline.
#[derive(Debug)]
pub struct Deduplicator {
    device_id: DeviceId,
    last_applied: Option<RemoteVersion>,
}

impl Deduplicator {
    /// Creates a filter for the device `device_id`.
    #[must_use]
    pub const fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            last_applied: None,
        }
    }

    /// Returns `true` if `envelope` should be applied, and records it.
    pub fn accept(&mut self, envelope: &RemoteEnvelope) -> bool {
        if self.last_applied == Some(envelope.version) {
            tracing::debug!(version = %envelope.version, "ignoring already applied snapshot");
            return false;
        }
        let baseline = self.last_applied.is_none();
        self.last_applied = Some(envelope.version);
        if envelope.device_id == self.device_id && !baseline {
            tracing::debug!(version = %envelope.version, "ignoring own write");
            return false;
        }
        true
    }

    /// Version of the most recently seen snapshot.
    #[must_use]
    pub const fn last_applied(&self) -> Option<RemoteVersion> {
        self.last_applied
    }
}

/// A polling or push transport, chosen at runtime.
pub enum AnyTransport<R: RemoteStore, P: TokenProvider> {
    /// See [`PollingTransport`].
    Poll(PollingTransport<R, P>),
    /// See [`PushTransport`].
    Push(PushTransport<P>),
}

impl<R: RemoteStore, P: TokenProvider> Transport for AnyTransport<R, P> {
    async fn broadcast(&self, payload: Vec<u8>) -> Result<RemoteVersion, TransportError> {
        match self {
            Self::Poll(t) => t.broadcast(payload).await,
            Self::Push(t) => t.broadcast(payload).await,
        }
    }

    fn start_listening(&self, sink: mpsc::Sender<TransportEvent>) {
        match self {
            Self::Poll(t) => t.start_listening(sink),
            Self::Push(t) => t.start_listening(sink),
        }
    }

    fn stop(&self) {
        match self {
            Self::Poll(t) => t.stop(),
            Self::Push(t) => t.stop(),
        }
    }

    fn force_poll(&self) {
        match self {
            Self::Poll(t) => t.force_poll(),
            Self::Push(t) => t.force_poll(),
        }
    }

    fn kind(&self) -> TransportKind {
        match self {
            Self::Poll(t) => t.kind(),
            Self::Push(t) => t.kind(),
        }
    }
}

/// Builds HTTP-backed transports for a configured server.
#[derive(Debug, Clone)]
pub struct RemoteTransportFactory<P> {
    /// Base URL of the document server.
    pub base_url: String,
    /// Polling or push.
    pub kind: TransportKind,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// This device's identifier.
    pub device_id: DeviceId,
    /// Poll interval and failure policy.
    pub policy: BackoffPolicy,
    /// Token source shared by every created transport.
    pub tokens: P,
}

impl<P: TokenProvider + Clone> TransportFactory for RemoteTransportFactory<P> {
    type Transport = AnyTransport<HttpRemoteStore, P>;

    fn create(&self, identity: &Identity) -> Result<Self::Transport, TransportError> {
        let remote = HttpRemoteStore::new(&self.base_url, self.request_timeout)?;
        let account = identity.account.clone();
        let tokens = self.tokens.clone();
        let device_id = self.device_id.clone();
        match self.kind {
            TransportKind::Push => Ok(AnyTransport::Push(PushTransport::new(
                remote, tokens, account, device_id, self.policy,
            )?)),
            TransportKind::Poll | TransportKind::Loopback => Ok(AnyTransport::Poll(
                PollingTransport::new(remote, tokens, account, device_id, self.policy),
            )),
        }
    }
}
