//! Integration tests: sync engines talking to a real in-process relay.
//!
//! Each test binds a relay on an ephemeral localhost port and drives one or
//! two engines against it over HTTP polling or the WebSocket subscription.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::similar_names)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tasksync::auth::{AuthError, AuthToken, Identity, StaticTokenProvider, TokenProvider};
use tasksync::clock::SystemClock;
use tasksync::store::memory::InMemoryStore;
use tasksync::sync::{AuthState, SyncConfig, SyncEngine, SyncHandle, SyncStatus};
use tasksync::transport::backoff::BackoffPolicy;
use tasksync::transport::{RemoteTransportFactory, TransportKind};
use tasksync_proto::codec;
use tasksync_proto::model::Document;
use tasksync_proto::remote::{self, DeviceId, RemoteEnvelope};
use tasksync_relay::relay::{self, RelayState};

const ACCOUNT: &str = "alice";

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

async fn start_relay() -> String {
    let (addr, _handle) = relay::start_server("127.0.0.1:0").await.unwrap();
    format!("http://{addr}")
}

async fn start_relay_with_tokens(tokens: &[(&str, &str)]) -> String {
    let tokens: HashMap<String, String> = tokens
        .iter()
        .map(|(a, t)| ((*a).to_string(), (*t).to_string()))
        .collect();
    let state = Arc::new(RelayState::with_config(1024 * 1024, tokens));
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", state)
        .await
        .unwrap();
    format!("http://{addr}")
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        debounce: Duration::from_millis(50),
        bootstrap_delay: Duration::from_millis(300),
        ..SyncConfig::default()
    }
}

/// Returns a fixed token and counts forced refreshes.
#[derive(Debug)]
struct CountingTokens {
    token: String,
    refreshes: AtomicUsize,
}

impl TokenProvider for CountingTokens {
    async fn valid_token(&self, force_refresh: bool) -> Result<AuthToken, AuthError> {
        if force_refresh {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(AuthToken::new(self.token.clone()))
    }
}

async fn engine(base_url: &str, device: &str, kind: TransportKind, token: &str) -> SyncHandle {
    engine_with_tokens(base_url, device, kind, StaticTokenProvider::new(token)).await
}

async fn engine_with_tokens<P>(base_url: &str, device: &str, kind: TransportKind, tokens: P) -> SyncHandle
where
    P: TokenProvider + Clone,
{
    let factory = RemoteTransportFactory {
        base_url: base_url.to_string(),
        kind,
        request_timeout: Duration::from_secs(5),
        device_id: DeviceId::new(device),
        policy: BackoffPolicy {
            floor: Duration::from_millis(100),
            ceiling: Duration::from_millis(500),
            multiplier: 2.0,
            error_threshold: 3,
        },
        tokens,
    };
    SyncEngine::spawn(factory, InMemoryStore::new(), SystemClock, fast_config())
        .await
        .unwrap()
}

/// Waits up to ten seconds for `check` to hold on the engine's document.
async fn eventually(handle: &SyncHandle, check: impl Fn(&Document) -> bool) {
    for _ in 0..200 {
        if check(&handle.document()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("document never converged: {:#?}", handle.document());
}

async fn wait_for_status(handle: &SyncHandle, check: impl Fn(&SyncStatus) -> bool) -> SyncStatus {
    let mut status = handle.watch_status();
    let result = tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| check(s)))
        .await
        .expect("status timed out")
        .expect("engine stopped")
        .clone();
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_relay_reports_connected() {
    let url = start_relay().await;
    let handle = engine(&url, "device-a", TransportKind::Poll, "token").await;

    handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    let status = wait_for_status(&handle, |s| *s != SyncStatus::Disconnected).await;
    assert_eq!(status, SyncStatus::Connected);
    assert!(handle.document().is_empty());
}

#[tokio::test]
async fn polling_devices_sync_through_relay() {
    let url = start_relay().await;
    let a = engine(&url, "device-a", TransportKind::Poll, "token").await;
    let b = engine(&url, "device-b", TransportKind::Poll, "token").await;
    a.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    b.sign_in(Identity::new(ACCOUNT)).await.unwrap();

    let list = a.create_list("Groceries").await.unwrap();
    let milk = a.create_item(list, "milk").await.unwrap();
    eventually(&b, |doc| doc.find_item(&milk).is_some()).await;

    b.toggle_completion(milk).await.unwrap();
    eventually(&a, |doc| {
        doc.find_item(&milk).is_some_and(|(_, item)| item.is_completed)
    })
    .await;
}

#[tokio::test]
async fn push_device_receives_updates_from_polling_device() {
    let url = start_relay().await;
    let writer = engine(&url, "device-a", TransportKind::Poll, "token").await;
    let listener = engine(&url, "device-b", TransportKind::Push, "token").await;
    writer.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    listener.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    wait_for_status(&listener, |s| *s == SyncStatus::Connected).await;

    let list = writer.create_list("Reading").await.unwrap();
    let book = writer.create_item(list, "Dune").await.unwrap();
    eventually(&listener, |doc| doc.find_item(&book).is_some()).await;

    listener.delete_item(book).await.unwrap();
    eventually(&writer, |doc| doc.find_item(&book).is_none() && doc.list(&list).is_some()).await;
}

#[tokio::test]
async fn local_document_is_uploaded_to_empty_relay() {
    let url = start_relay().await;
    let a = engine(&url, "device-a", TransportKind::Poll, "token").await;
    // Edits made while signed out are kept and bootstrapped on sign-in.
    let list = a.create_list("Offline").await.unwrap();
    a.flush().await.unwrap();

    a.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    let b = engine(&url, "device-b", TransportKind::Poll, "token").await;
    b.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    eventually(&b, |doc| doc.list(&list).is_some()).await;

    let client = reqwest::Client::new();
    let stored = client
        .get(format!("{url}/v1/documents/{ACCOUNT}"))
        .bearer_auth("token")
        .send()
        .await
        .unwrap();
    assert!(stored.status().is_success());
    let envelope: RemoteEnvelope = remote::decode(&stored.bytes().await.unwrap()).unwrap();
    let (doc, _) = codec::decode_document(&envelope.payload).unwrap();
    assert_eq!(doc.lists.len(), 1);
}

#[tokio::test]
async fn rejected_token_surfaces_as_error() {
    let url = start_relay_with_tokens(&[(ACCOUNT, "secret")]).await;
    let handle = engine(&url, "device-a", TransportKind::Poll, "wrong").await;

    handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    let status = wait_for_status(&handle, |s| *s != SyncStatus::Disconnected).await;
    assert!(matches!(status, SyncStatus::Error(_)), "got {status:?}");
    // The engine stays signed in; the user must fix the credentials.
    assert!(matches!(handle.auth_state(), AuthState::SignedIn(_)));
}

#[tokio::test]
async fn configured_token_is_accepted() {
    let url = start_relay_with_tokens(&[(ACCOUNT, "secret")]).await;
    let a = engine(&url, "device-a", TransportKind::Poll, "secret").await;
    let b = engine(&url, "device-b", TransportKind::Push, "secret").await;
    a.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    b.sign_in(Identity::new(ACCOUNT)).await.unwrap();

    let list = a.create_list("Private").await.unwrap();
    eventually(&b, |doc| doc.list(&list).is_some()).await;
    let status = wait_for_status(&a, |s| *s != SyncStatus::Disconnected).await;
    assert_eq!(status, SyncStatus::Connected);
}

#[tokio::test]
async fn rejected_subscription_is_not_retried() {
    let url = start_relay_with_tokens(&[(ACCOUNT, "secret")]).await;
    let tokens = Arc::new(CountingTokens {
        token: "revoked".to_string(),
        refreshes: AtomicUsize::new(0),
    });
    let handle = engine_with_tokens(&url, "device-a", TransportKind::Push, Arc::clone(&tokens)).await;

    handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    let status = wait_for_status(&handle, |s| *s != SyncStatus::Disconnected).await;
    assert!(matches!(status, SyncStatus::Error(_)), "got {status:?}");

    // Several backoff ceilings pass without another refresh attempt.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    assert!(matches!(handle.status(), SyncStatus::Error(_)));
}
