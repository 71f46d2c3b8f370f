//! Push transport: a WebSocket subscription to the document server.
//!
//! The server replays the current document right after a successful
//! `Subscribe` and then sends every later write. Writes and forced fetches
//! go through the REST binding, sharing its deduplicator so a snapshot seen
//! on one path is not applied again from the other.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tasksync_proto::remote::{self, ClientFrame, DeviceId, RemoteVersion, ServerFrame};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::backoff::{Backoff, BackoffPolicy};
use super::poller::{EventSink, PollOutcome, PollingTransport};
use super::{LinkStatus, Transport, TransportError, TransportEvent, TransportKind, with_auth_retry};
use crate::auth::{AuthToken, TokenProvider};
use crate::remote::RemoteError;
use crate::remote::http::HttpRemoteStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Timeout for the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the `Subscribed` acknowledgment.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// [`Transport`] that subscribes to server pushes.
pub struct PushTransport<P> {
    rest: Arc<PollingTransport<HttpRemoteStore, P>>,
    subscribe_url: Url,
    sink: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    resume: Arc<Notify>,
}

impl<P: TokenProvider> PushTransport<P> {
    /// Creates an idle transport for `account` on the server behind `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Protocol`] if no subscription URL can be
    /// derived from the server URL.
    pub fn new(
        remote: HttpRemoteStore,
        tokens: P,
        account: impl Into<String>,
        device_id: DeviceId,
        policy: BackoffPolicy,
    ) -> Result<Self, RemoteError> {
        let account = account.into();
        let subscribe_url = remote.subscribe_url(&account)?;
        Ok(Self {
            rest: Arc::new(PollingTransport::new(
                remote, tokens, account, device_id, policy,
            )),
            subscribe_url,
            sink: Mutex::new(None),
            task: Mutex::new(None),
            resume: Arc::new(Notify::new()),
        })
    }

    /// WebSocket endpoint this transport subscribes to.
    #[must_use]
    pub const fn subscribe_url(&self) -> &Url {
        &self.subscribe_url
    }
}

impl<P: TokenProvider> Transport for PushTransport<P> {
    async fn broadcast(&self, payload: Vec<u8>) -> Result<RemoteVersion, TransportError> {
        self.rest.broadcast(payload).await
    }

    fn start_listening(&self, sink: mpsc::Sender<TransportEvent>) {
        *self.sink.lock() = Some(sink.clone());
        let handle = tokio::spawn(subscribe_loop(
            Arc::clone(&self.rest),
            self.subscribe_url.clone(),
            Arc::clone(&self.resume),
            sink,
        ));
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop(&self) {
        self.sink.lock().take();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    fn force_poll(&self) {
        self.resume.notify_waiters();
        if self.rest.is_polling() {
            tracing::debug!(account = %self.rest.account(), "fetch in flight, ignoring force_poll");
            return;
        }
        let Some(sink) = self.sink.lock().clone() else {
            return;
        };
        let rest = Arc::clone(&self.rest);
        tokio::spawn(async move {
            match rest.poll_now().await {
                PollOutcome::Updated(envelope) => {
                    EventSink::new(sink).deliver(envelope).await;
                }
                PollOutcome::Failed(e) => {
                    tracing::warn!(error = %e, "forced fetch failed");
                }
                PollOutcome::Unchanged | PollOutcome::Empty | PollOutcome::Skipped => {}
            }
        });
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }
}

impl<P> Drop for PushTransport<P> {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Next server frame, or `None` when the socket closed.
async fn next_frame(ws: &mut WsStream) -> Result<Option<ServerFrame>, RemoteError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                return remote::decode(&data)
                    .map(Some)
                    .map_err(|e| RemoteError::Protocol(e.to_string()));
            }
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(RemoteError::Network(e.to_string())),
        }
    }
}

async fn subscribe(url: &Url, account: &str, token: AuthToken) -> Result<WsStream, RemoteError> {
    let (mut ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| RemoteError::Timeout)?
        .map_err(|e| RemoteError::Network(e.to_string()))?;

    let frame = remote::encode(&ClientFrame::Subscribe {
        account: account.to_string(),
        token: token.as_str().to_string(),
    })
    .map_err(|e| RemoteError::Protocol(e.to_string()))?;
    ws.send(Message::Binary(frame.into()))
        .await
        .map_err(|e| RemoteError::Network(e.to_string()))?;

    let reply = tokio::time::timeout(SUBSCRIBE_TIMEOUT, next_frame(&mut ws))
        .await
        .map_err(|_| RemoteError::Timeout)??
        .ok_or_else(|| RemoteError::Network("closed during subscribe".to_string()))?;
    match reply {
        ServerFrame::Subscribed { .. } => Ok(ws),
        ServerFrame::Rejected {
            reason,
            unauthorized: true,
        } => {
            tracing::debug!(reason = %reason, "subscription unauthorized");
            Err(RemoteError::Unauthorized(401))
        }
        ServerFrame::Rejected { reason, .. } => Err(RemoteError::Protocol(reason)),
        ServerFrame::Updated(_) => Err(RemoteError::Protocol(
            "update received before subscription was acknowledged".to_string(),
        )),
    }
}

/// Reads frames until the subscription breaks. Returns `None` once the
/// receiver is gone.
async fn follow<P: TokenProvider>(
    rest: &PollingTransport<HttpRemoteStore, P>,
    ws: &mut WsStream,
    events: &EventSink,
) -> Option<TransportError> {
    loop {
        match next_frame(ws).await {
            Ok(None) => return Some(TransportError::ConnectionClosed),
            Ok(Some(ServerFrame::Updated(envelope))) => {
                if rest.accept(&envelope) && !events.deliver(envelope).await {
                    return None;
                }
            }
            Ok(Some(ServerFrame::Subscribed { .. })) => {}
            Ok(Some(ServerFrame::Rejected {
                unauthorized: true, ..
            })) => return Some(TransportError::AuthRejected),
            Ok(Some(ServerFrame::Rejected { reason, .. })) => {
                return Some(TransportError::Remote(RemoteError::Protocol(reason)));
            }
            Err(e) => return Some(TransportError::Remote(e)),
        }
    }
}

async fn subscribe_loop<P: TokenProvider>(
    rest: Arc<PollingTransport<HttpRemoteStore, P>>,
    url: Url,
    resume: Arc<Notify>,
    sink: mpsc::Sender<TransportEvent>,
) {
    let mut events = EventSink::new(sink);
    let mut backoff = Backoff::new(rest.policy());
    let account = rest.account().to_string();

    loop {
        let url_ref = &url;
        let account_ref = account.as_str();
        let subscribed = with_auth_retry(rest.tokens(), move |token| {
            subscribe(url_ref, account_ref, token)
        })
        .await;

        let error = match subscribed {
            Ok(mut ws) => {
                tracing::info!(account = %account, url = %url, "subscribed to remote document");
                backoff.on_success();
                if !events.link(LinkStatus::Connected).await {
                    break;
                }
                match follow(&rest, &mut ws, &events).await {
                    Some(error) => error,
                    None => break,
                }
            }
            Err(error) => error,
        };

        let Some(delay) = events.failure(&mut backoff, &error).await else {
            break;
        };
        if error.is_hard() {
            tracing::warn!(account = %account, "credentials rejected, subscription parked");
            resume.notified().await;
            tracing::debug!(account = %account, "subscription resumed");
            continue;
        }
        tokio::time::sleep(delay).await;
    }
    tracing::info!(account = %account, "subscription stopped");
}
