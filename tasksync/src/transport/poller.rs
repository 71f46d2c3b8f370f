//! Polling transport: periodic REST fetches with deduplication and backoff.
//!
//! One background task per listening session fetches the remote document,
//! forwards snapshots that pass the [`Deduplicator`], and sleeps for the
//! [`Backoff`] interval between polls. [`Transport::force_poll`] cuts the
//! sleep short unless a fetch is already in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tasksync_proto::remote::{DeviceId, RemoteEnvelope, RemoteVersion};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use super::backoff::{Backoff, BackoffPolicy};
use super::{
    Deduplicator, LinkStatus, Transport, TransportError, TransportEvent, TransportKind,
    with_auth_retry,
};
use crate::auth::TokenProvider;
use crate::remote::RemoteStore;

/// Result of one guarded poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A snapshot that passed deduplication.
    Updated(RemoteEnvelope),
    /// The remote holds a snapshot this device wrote or already applied.
    Unchanged,
    /// The remote holds no document yet.
    Empty,
    /// Another poll was in flight; this one was dropped.
    Skipped,
    /// The poll failed.
    Failed(TransportError),
}

/// Clears the in-flight flag when the poll finishes or is cancelled.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Shared<R, P> {
    remote: R,
    tokens: P,
    account: String,
    device_id: DeviceId,
    policy: BackoffPolicy,
    dedup: Mutex<Deduplicator>,
    in_flight: AtomicBool,
    wake: Notify,
}

impl<R: RemoteStore, P: TokenProvider> Shared<R, P> {
    async fn poll_once(&self) -> PollOutcome {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            tracing::debug!(account = %self.account, "poll already in flight, dropping request");
            return PollOutcome::Skipped;
        }
        let _guard = InFlight(&self.in_flight);

        let remote = &self.remote;
        let account = self.account.as_str();
        let fetched = with_auth_retry(&self.tokens, move |token| async move {
            remote.fetch(account, &token).await
        })
        .await;

        match fetched {
            Ok(None) => PollOutcome::Empty,
            Ok(Some(envelope)) => {
                if self.dedup.lock().accept(&envelope) {
                    PollOutcome::Updated(envelope)
                } else {
                    PollOutcome::Unchanged
                }
            }
            Err(e) => PollOutcome::Failed(e),
        }
    }

    async fn push(&self, payload: &[u8]) -> Result<RemoteVersion, TransportError> {
        let remote = &self.remote;
        let account = self.account.as_str();
        let device_id = &self.device_id;
        with_auth_retry(&self.tokens, move |token| async move {
            remote.push(account, &token, device_id, payload).await
        })
        .await
    }
}

/// Forwards events to the orchestrator, suppressing repeated link states.
pub(crate) struct EventSink {
    sink: mpsc::Sender<TransportEvent>,
    last_link: Option<LinkStatus>,
}

impl EventSink {
    pub(crate) const fn new(sink: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            sink,
            last_link: None,
        }
    }

    /// Returns `false` once the receiver is gone.
    pub(crate) async fn deliver(&self, envelope: RemoteEnvelope) -> bool {
        tracing::debug!(
            version = %envelope.version,
            device = %envelope.device_id,
            bytes = envelope.payload.len(),
            "delivering remote snapshot"
        );
        self.sink
            .send(TransportEvent::Remote {
                version: envelope.version,
                payload: envelope.payload,
            })
            .await
            .is_ok()
    }

    /// Returns `false` once the receiver is gone.
    pub(crate) async fn link(&mut self, status: LinkStatus) -> bool {
        if self.last_link.as_ref() == Some(&status) {
            return !self.sink.is_closed();
        }
        self.last_link = Some(status.clone());
        self.sink.send(TransportEvent::Link(status)).await.is_ok()
    }

    /// Records a failure, surfacing it when it is hard or the threshold is
    /// reached. Returns the next delay, or `None` once the receiver is gone.
    pub(crate) async fn failure(
        &mut self,
        backoff: &mut Backoff,
        error: &TransportError,
    ) -> Option<Duration> {
        let delay = backoff.on_failure();
        if error.is_hard() || backoff.should_surface() {
            tracing::warn!(
                error = %error,
                failures = backoff.consecutive_failures(),
                retry_in = ?delay,
                "remote sync failing"
            );
            if !self.link(LinkStatus::Error(error.to_string())).await {
                return None;
            }
        } else {
            tracing::warn!(
                error = %error,
                failures = backoff.consecutive_failures(),
                retry_in = ?delay,
                "transient remote failure"
            );
        }
        Some(delay)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }
}

/// [`Transport`] that polls a [`RemoteStore`].
pub struct PollingTransport<R, P> {
    shared: Arc<Shared<R, P>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R: RemoteStore, P: TokenProvider> PollingTransport<R, P> {
    /// Creates an idle transport for `account`.
    pub fn new(
        remote: R,
        tokens: P,
        account: impl Into<String>,
        device_id: DeviceId,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                remote,
                tokens,
                account: account.into(),
                dedup: Mutex::new(Deduplicator::new(device_id.clone())),
                device_id,
                policy,
                in_flight: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Runs one guarded poll without touching the backoff state.
    ///
    /// Returns [`PollOutcome::Skipped`] if another poll is in flight.
    pub async fn poll_now(&self) -> PollOutcome {
        self.shared.poll_once().await
    }

    /// Returns `true` while a fetch is outstanding.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Account this transport syncs.
    #[must_use]
    pub fn account(&self) -> &str {
        &self.shared.account
    }

    pub(crate) fn tokens(&self) -> &P {
        &self.shared.tokens
    }

    pub(crate) fn accept(&self, envelope: &RemoteEnvelope) -> bool {
        self.shared.dedup.lock().accept(envelope)
    }

    pub(crate) fn policy(&self) -> BackoffPolicy {
        self.shared.policy
    }

    fn abort_task(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl<R: RemoteStore, P: TokenProvider> Transport for PollingTransport<R, P> {
    async fn broadcast(&self, payload: Vec<u8>) -> Result<RemoteVersion, TransportError> {
        let version = self.shared.push(&payload).await?;
        tracing::debug!(account = %self.shared.account, %version, bytes = payload.len(), "broadcast stored");
        Ok(version)
    }

    fn start_listening(&self, sink: mpsc::Sender<TransportEvent>) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(poll_loop(shared, sink));
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop(&self) {
        self.abort_task();
    }

    fn force_poll(&self) {
        if self.shared.in_flight.load(Ordering::Acquire) {
            tracing::debug!(account = %self.shared.account, "poll in flight, ignoring force_poll");
            return;
        }
        self.shared.wake.notify_one();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }
}

impl<R, P> Drop for PollingTransport<R, P> {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn poll_loop<R: RemoteStore, P: TokenProvider>(
    shared: Arc<Shared<R, P>>,
    sink: mpsc::Sender<TransportEvent>,
) {
    let mut events = EventSink::new(sink);
    let mut backoff = Backoff::new(shared.policy);
    tracing::info!(account = %shared.account, "polling started");

    loop {
        let delay = match shared.poll_once().await {
            PollOutcome::Updated(envelope) => {
                if !events.deliver(envelope).await || !events.link(LinkStatus::Connected).await {
                    break;
                }
                backoff.on_success()
            }
            PollOutcome::Unchanged | PollOutcome::Empty => {
                if !events.link(LinkStatus::Connected).await {
                    break;
                }
                backoff.on_success()
            }
            PollOutcome::Skipped => backoff.interval(),
            PollOutcome::Failed(e) => {
                let Some(delay) = events.failure(&mut backoff, &e).await else {
                    break;
                };
                if e.is_hard() {
                    tracing::warn!(account = %shared.account, "credentials rejected, polling parked");
                    shared.wake.notified().await;
                    tracing::debug!(account = %shared.account, "polling resumed");
                    continue;
                }
                delay
            }
        };

        if events.is_closed() {
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shared.wake.notified() => {
                tracing::debug!(account = %shared.account, "forced poll");
            }
        }
    }
    tracing::info!(account = %shared.account, "polling stopped");
}
