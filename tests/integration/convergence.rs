//! Integration tests for multi-device convergence.
//!
//! Two engines share one in-memory remote through polling transports and
//! run on paused tokio time, so polls, debounces and the bootstrap delay
//! fire deterministically.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::similar_names)]

use std::sync::Arc;
use std::time::Duration;

use tasksync::auth::{Identity, StaticTokenProvider};
use tasksync::clock::ManualClock;
use tasksync::remote::memory::MemoryRemote;
use tasksync::store::memory::InMemoryStore;
use tasksync::sync::mutation::ItemMutation;
use tasksync::sync::{SyncConfig, SyncEngine, SyncHandle, SyncStatus};
use tasksync::transport::TransportError;
use tasksync::transport::backoff::BackoffPolicy;
use tasksync::transport::poller::PollingTransport;
use tasksync_proto::codec;
use tasksync_proto::model::{Document, TaskList};
use tasksync_proto::remote::DeviceId;

const ACCOUNT: &str = "alice";
const START: u64 = 1_700_000_000_000;

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

struct Device {
    handle: SyncHandle,
    store: Arc<InMemoryStore>,
    clock: ManualClock,
}

fn policy() -> BackoffPolicy {
    BackoffPolicy {
        floor: Duration::from_secs(1),
        ceiling: Duration::from_secs(4),
        multiplier: 2.0,
        error_threshold: 3,
    }
}

/// Starts an engine for `device` against `remote`, backed by `store`.
async fn device_with(remote: &MemoryRemote, device: &str, store: InMemoryStore) -> Device {
    let remote = remote.clone();
    let device_id = DeviceId::new(device);
    let factory = move |identity: &Identity| -> Result<_, TransportError> {
        Ok(PollingTransport::new(
            remote.clone(),
            StaticTokenProvider::new("token"),
            identity.account.clone(),
            device_id.clone(),
            policy(),
        ))
    };
    let store = Arc::new(store);
    let clock = ManualClock::new(START);
    let handle = SyncEngine::spawn(factory, Arc::clone(&store), clock.clone(), SyncConfig::default())
        .await
        .unwrap();
    Device {
        handle,
        store,
        clock,
    }
}

async fn device(remote: &MemoryRemote, device: &str) -> Device {
    device_with(remote, device, InMemoryStore::new()).await
}

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Waits up to 30 simulated seconds for `check` to hold on `handle`'s
/// document.
async fn eventually(handle: &SyncHandle, check: impl Fn(&Document) -> bool) {
    for _ in 0..60 {
        if check(&handle.document()) {
            return;
        }
        settle(500).await;
    }
    panic!("document never converged: {:#?}", handle.document());
}

fn item_contents(doc: &Document) -> Vec<String> {
    let mut contents: Vec<String> = doc
        .lists
        .iter()
        .flat_map(|l| l.items.iter().map(|i| i.content.clone()))
        .collect();
    contents.sort();
    contents
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn edits_propagate_between_devices() {
    let remote = MemoryRemote::new();
    let a = device(&remote, "device-a").await;
    let b = device(&remote, "device-b").await;
    a.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    b.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();

    let list = a.handle.create_list("Groceries").await.unwrap();
    let milk = a.handle.create_item(list, "milk").await.unwrap();

    eventually(&b.handle, |doc| doc.find_item(&milk).is_some()).await;
    assert_eq!(b.handle.document().lists[0].title, "Groceries");

    b.clock.advance(1_000);
    b.handle.toggle_completion(milk).await.unwrap();

    eventually(&a.handle, |doc| {
        doc.find_item(&milk).is_some_and(|(_, item)| item.is_completed)
    })
    .await;
    assert_eq!(a.handle.status(), SyncStatus::Connected);
    assert_eq!(b.handle.status(), SyncStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn newer_edit_wins_on_both_devices() {
    let remote = MemoryRemote::new();
    let a = device(&remote, "device-a").await;
    let b = device(&remote, "device-b").await;
    a.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    b.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();

    let list = a.handle.create_list("Chores").await.unwrap();
    let item = a.handle.create_item(list, "laundry").await.unwrap();
    eventually(&b.handle, |doc| doc.find_item(&item).is_some()).await;

    // Concurrent edits: A's carries the newer stamp.
    a.clock.advance(5_000);
    b.clock.advance(500);
    a.handle
        .update_item(item, ItemMutation::SetContent("laundry (whites)".into()))
        .await
        .unwrap();
    b.handle
        .update_item(item, ItemMutation::SetContent("laundry (darks)".into()))
        .await
        .unwrap();
    settle(3_000).await;

    a.handle.manual_refresh().await.unwrap();
    settle(3_000).await;
    b.handle.manual_refresh().await.unwrap();

    for handle in [&a.handle, &b.handle] {
        eventually(handle, |doc| {
            doc.find_item(&item)
                .is_some_and(|(_, i)| i.content == "laundry (whites)")
        })
        .await;
    }
}

#[tokio::test(start_paused = true)]
async fn deleted_item_is_not_resurrected_by_a_stale_edit() {
    let remote = MemoryRemote::new();
    let a = device(&remote, "device-a").await;
    let b = device(&remote, "device-b").await;
    a.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    b.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();

    let list = a.handle.create_list("Errands").await.unwrap();
    let keep = a.handle.create_item(list, "post office").await.unwrap();
    let doomed = a.handle.create_item(list, "bank").await.unwrap();
    eventually(&b.handle, |doc| doc.find_item(&doomed).is_some()).await;

    // Concurrent: B deletes while A edits the same item with a newer stamp.
    b.clock.advance(1_000);
    a.clock.advance(5_000);
    b.handle.delete_item(doomed).await.unwrap();
    a.handle
        .update_item(doomed, ItemMutation::SetContent("bank (urgent)".into()))
        .await
        .unwrap();
    settle(3_000).await;

    b.handle.manual_refresh().await.unwrap();
    settle(3_000).await;
    a.handle.manual_refresh().await.unwrap();

    for handle in [&a.handle, &b.handle] {
        eventually(handle, |doc| {
            doc.find_item(&doomed).is_none() && doc.find_item(&keep).is_some()
        })
        .await;
        let doc = handle.document();
        assert!(doc.lists[0].deleted_item_ids.is_deleted(&doomed));
        assert!(!doc.merged_task_order.contains(&doomed));
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_additions_converge_after_refresh() {
    let remote = MemoryRemote::new();
    let a = device(&remote, "device-a").await;
    let b = device(&remote, "device-b").await;
    a.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    b.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();

    let list = a.handle.create_list("Shared").await.unwrap();
    eventually(&b.handle, |doc| doc.list(&list).is_some()).await;

    a.clock.advance(100);
    b.clock.advance(200);
    a.handle.create_item(list, "from a").await.unwrap();
    b.handle.create_item(list, "from b").await.unwrap();
    settle(3_000).await;

    // Whichever snapshot landed last, one refresh from each side republishes
    // the merged state.
    a.handle.manual_refresh().await.unwrap();
    settle(3_000).await;
    b.handle.manual_refresh().await.unwrap();

    let both = vec!["from a".to_string(), "from b".to_string()];
    eventually(&a.handle, |doc| item_contents(doc) == both).await;
    eventually(&b.handle, |doc| item_contents(doc) == both).await;
}

#[tokio::test(start_paused = true)]
async fn new_device_downloads_existing_document() {
    let remote = MemoryRemote::new();
    let a = device(&remote, "device-a").await;
    a.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    let list = a.handle.create_list("Books").await.unwrap();
    a.handle.create_item(list, "Dune").await.unwrap();
    settle(1_000).await;
    assert!(remote.document(ACCOUNT).is_some());

    let b = device(&remote, "device-b").await;
    b.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    eventually(&b.handle, |doc| item_contents(doc) == ["Dune"]).await;

    // The download is persisted locally but never echoed back.
    let pushes = remote.push_count();
    settle(5_000).await;
    assert_eq!(remote.push_count(), pushes);
    assert!(b.store.write_count() >= 1);
}

#[tokio::test(start_paused = true)]
async fn offline_data_is_uploaded_when_remote_is_empty() {
    let mut offline = Document::default();
    offline.lists.push(TaskList::new("Offline list", START - 10_000));
    let store = InMemoryStore::with_contents(codec::encode_document(&offline).unwrap());

    let remote = MemoryRemote::new();
    let a = device_with(&remote, "device-a", store).await;
    a.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();

    settle(1_000).await;
    assert!(remote.document(ACCOUNT).is_none(), "bootstrap must wait");
    settle(2_000).await;
    let uploaded = remote.document(ACCOUNT).expect("bootstrap upload");
    let (doc, _) = codec::decode_document(&uploaded.payload).unwrap();
    assert_eq!(doc.lists[0].title, "Offline list");

    let b = device(&remote, "device-b").await;
    b.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    eventually(&b.handle, |doc| doc.lists.len() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn deleted_list_stays_deleted_everywhere() {
    let remote = MemoryRemote::new();
    let a = device(&remote, "device-a").await;
    let b = device(&remote, "device-b").await;
    a.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();
    b.handle.sign_in(Identity::new(ACCOUNT)).await.unwrap();

    let list = a.handle.create_list("Temporary").await.unwrap();
    a.handle.create_item(list, "scratch").await.unwrap();
    eventually(&b.handle, |doc| doc.list(&list).is_some()).await;

    b.clock.advance(1_000);
    b.handle.delete_list(list).await.unwrap();
    eventually(&a.handle, |doc| doc.list(&list).is_none()).await;

    // A later refresh from A must not bring the list back.
    a.handle.manual_refresh().await.unwrap();
    settle(5_000).await;
    for handle in [&a.handle, &b.handle] {
        let doc = handle.document();
        assert!(doc.list(&list).is_none());
        assert!(doc.deleted_list_ids.is_deleted(&list));
        assert!(doc.merged_task_order.is_empty());
    }
}
