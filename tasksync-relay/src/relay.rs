//! Relay server core: shared state, REST handlers and the WebSocket
//! subscription.
//!
//! Routes:
//! - `GET /v1/documents/{account}`: current [`RemoteEnvelope`] (404 if none)
//! - `PUT /v1/documents/{account}`: store a [`PushRequest`], answer [`PushAck`]
//! - `GET /v1/documents/{account}/subscribe`: WebSocket; the client sends
//!   [`ClientFrame::Subscribe`], the server answers `Subscribed`, replays the
//!   current document and then forwards every later write.
//!
//! All bodies and frames are postcard-encoded.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tasksync_proto::remote::{
    self, ClientFrame, PushAck, PushRequest, RemoteEnvelope, ServerFrame,
};
use tokio::sync::broadcast;

use crate::store::DocumentRegistry;

/// Default maximum allowed document payload size in bytes (1 MiB).
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Room for the device id and framing around the payload in a PUT body.
const BODY_OVERHEAD: usize = 1024;

/// Shared relay server state.
pub struct RelayState {
    /// Latest document per account.
    pub documents: DocumentRegistry,
    /// Configured per-account bearer tokens.
    tokens: HashMap<String, String>,
    /// Maximum allowed payload size in bytes.
    max_payload_size: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a state with no configured tokens and the default size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_PAYLOAD_SIZE, HashMap::new())
    }

    /// Creates a state with a custom payload size limit and token table.
    #[must_use]
    pub fn with_config(max_payload_size: usize, tokens: HashMap<String, String>) -> Self {
        Self {
            documents: DocumentRegistry::new(),
            tokens,
            max_payload_size,
        }
    }

    /// Returns `true` if `token` may access `account`.
    ///
    /// Accounts with a configured token require exactly that token; any
    /// other account accepts any non-empty token.
    #[must_use]
    pub fn authorize(&self, account: &str, token: &str) -> bool {
        match self.tokens.get(account) {
            Some(expected) => expected == token,
            None => !token.is_empty(),
        }
    }
}

/// Request failures, mapped to HTTP status codes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing, malformed or wrong bearer token.
    #[error("missing or invalid bearer token")]
    Unauthorized,
    /// The account id is not usable as a document key.
    #[error("invalid account id")]
    InvalidAccount,
    /// Nothing has been written for the account yet.
    #[error("no document stored for this account")]
    NotFound,
    /// The document exceeds the configured limit.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Configured limit.
        max: usize,
    },
    /// The body is not a valid request.
    #[error("malformed request body: {0}")]
    BadRequest(String),
    /// A response could not be encoded.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidAccount | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn authorize(state: &RelayState, account: &str, headers: &HeaderMap) -> Result<(), ApiError> {
    if !remote::is_valid_account(account) {
        return Err(ApiError::InvalidAccount);
    }
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    if state.authorize(account, token) {
        Ok(())
    } else {
        tracing::warn!(account = %account, "rejected bearer token");
        Err(ApiError::Unauthorized)
    }
}

fn postcard_body(bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response()
}

async fn get_document(
    State(state): State<Arc<RelayState>>,
    Path(account): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &account, &headers)?;
    let envelope = state
        .documents
        .get(&account)
        .await
        .ok_or(ApiError::NotFound)?;
    tracing::debug!(account = %account, version = %envelope.version, "document fetched");
    let bytes = remote::encode(&envelope).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(postcard_body(bytes))
}

async fn put_document(
    State(state): State<Arc<RelayState>>,
    Path(account): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    authorize(&state, &account, &headers)?;
    let request: PushRequest =
        remote::decode(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if request.payload.len() > state.max_payload_size {
        tracing::warn!(
            account = %account,
            size = request.payload.len(),
            max = state.max_payload_size,
            "payload exceeds size limit"
        );
        return Err(ApiError::PayloadTooLarge {
            size: request.payload.len(),
            max: state.max_payload_size,
        });
    }

    let envelope = state
        .documents
        .put(&account, request.device_id, request.payload)
        .await;
    tracing::info!(
        account = %account,
        device_id = %envelope.device_id,
        version = %envelope.version,
        size = envelope.payload.len(),
        "document stored"
    );
    let bytes = remote::encode(&PushAck {
        version: envelope.version,
    })
    .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(postcard_body(bytes))
}

/// axum handler that upgrades an HTTP request to a subscription socket.
async fn subscribe_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    Path(account): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_subscription(socket, account, state))
}

/// Handles one subscription socket.
///
/// The connection lifecycle:
/// 1. Wait for a `Subscribe` frame and check its token.
/// 2. Send `Subscribed`, then the current document if there is one.
/// 3. Forward every later write until either side closes.
pub async fn handle_subscription(socket: WebSocket, account: String, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some((frame_account, token)) = wait_for_subscribe(&mut ws_receiver).await else {
        tracing::warn!(account = %account, "connection closed before subscribing");
        return;
    };

    let rejection = if frame_account != account || !remote::is_valid_account(&account) {
        Some(ServerFrame::Rejected {
            reason: format!("account {frame_account:?} does not match the subscription path"),
            unauthorized: false,
        })
    } else if !state.authorize(&account, &token) {
        Some(ServerFrame::Rejected {
            reason: "invalid token".to_string(),
            unauthorized: true,
        })
    } else {
        None
    };
    if let Some(frame) = rejection {
        tracing::warn!(account = %account, "subscription rejected");
        let _ = send_frame(&mut ws_sender, &frame).await;
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    }

    let (current, mut updates) = state.documents.subscribe(&account).await;
    let ack = ServerFrame::Subscribed {
        account: account.clone(),
    };
    if let Err(e) = send_frame(&mut ws_sender, &ack).await {
        tracing::warn!(account = %account, error = %e, "failed to send Subscribed ack");
        return;
    }
    tracing::info!(account = %account, "subscriber attached");

    if let Some(envelope) = current
        && send_update(&mut ws_sender, envelope).await.is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => {
                let envelope = match update {
                    Ok(envelope) => envelope,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(account = %account, skipped, "subscriber lagged, sending latest");
                        let Some(latest) = state.documents.get(&account).await else {
                            continue;
                        };
                        latest
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if send_update(&mut ws_sender, envelope).await.is_err() {
                    break;
                }
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {
                    // Clients send nothing after subscribing; ignore pings and stray frames.
                }
            },
        }
    }
    tracing::info!(account = %account, "subscriber detached");
}

/// Waits for the first binary frame, expecting `Subscribe`.
async fn wait_for_subscribe(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<(String, String)> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => {
                return match remote::decode::<ClientFrame>(&data) {
                    Ok(ClientFrame::Subscribe { account, token }) => Some((account, token)),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to decode subscribe frame");
                        None
                    }
                };
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn send_update(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    envelope: RemoteEnvelope,
) -> Result<(), String> {
    let version = envelope.version;
    send_frame(ws_sender, &ServerFrame::Updated(envelope))
        .await
        .inspect_err(|e| tracing::warn!(%version, error = %e, "failed to forward update"))
}

/// Encodes and sends a server frame.
async fn send_frame(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), String> {
    let bytes = remote::encode(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Builds the relay's router.
pub fn router(state: Arc<RelayState>) -> axum::Router {
    let body_limit = state.max_payload_size.saturating_add(BODY_OVERHEAD);
    axum::Router::new()
        .route(
            "/v1/documents/{account}",
            axum::routing::get(get_document).put(put_document),
        )
        .route("/v1/documents/{account}/subscribe", axum::routing::get(subscribe_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}
