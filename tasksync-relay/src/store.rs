//! In-memory per-account document registry.
//!
//! The [`DocumentRegistry`] holds the latest [`RemoteEnvelope`] of every
//! account. Each write replaces the previous document wholesale (the server
//! is a last-write-wins blob store) and is stamped with a version that is
//! strictly greater than any earlier version of the same account. Writes are
//! also fanned out to subscribers over a per-account broadcast channel.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tasksync_proto::remote::{DeviceId, RemoteEnvelope, RemoteVersion};
use tokio::sync::{RwLock, broadcast};

/// Buffered updates per account before slow subscribers start lagging.
const UPDATE_BUFFER: usize = 16;

struct Slot {
    current: Option<RemoteEnvelope>,
    updates: broadcast::Sender<RemoteEnvelope>,
}

impl Slot {
    fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            current: None,
            updates,
        }
    }
}

/// Latest document per account plus live update channels.
pub struct DocumentRegistry {
    slots: RwLock<HashMap<String, Slot>>,
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the account's current document, if one was ever written.
    pub async fn get(&self, account: &str) -> Option<RemoteEnvelope> {
        let slots = self.slots.read().await;
        slots.get(account).and_then(|s| s.current.clone())
    }

    /// Replaces the account's document and notifies subscribers.
    ///
    /// The assigned version is the current wall-clock time in milliseconds,
    /// bumped past the previous version if the clock has not advanced.
    pub async fn put(&self, account: &str, device_id: DeviceId, payload: Vec<u8>) -> RemoteEnvelope {
        let mut slots = self.slots.write().await;
        let slot = slots.entry(account.to_string()).or_insert_with(Slot::new);
        let previous = slot.current.as_ref().map_or(0, |e| e.version.0);
        let envelope = RemoteEnvelope {
            version: RemoteVersion(now_ms().max(previous.saturating_add(1))),
            device_id,
            payload,
        };
        slot.current = Some(envelope.clone());
        // No receivers is fine: nobody is subscribed.
        let _ = slot.updates.send(envelope.clone());
        drop(slots);
        envelope
    }

    /// Subscribes to the account's updates.
    ///
    /// Returns the current document together with a receiver for every later
    /// write, taken atomically so no update falls between the two.
    pub async fn subscribe(
        &self,
        account: &str,
    ) -> (Option<RemoteEnvelope>, broadcast::Receiver<RemoteEnvelope>) {
        let mut slots = self.slots.write().await;
        let slot = slots.entry(account.to_string()).or_insert_with(Slot::new);
        (slot.current.clone(), slot.updates.subscribe())
    }

    /// Number of accounts holding a document.
    pub async fn document_count(&self) -> usize {
        let slots = self.slots.read().await;
        slots.values().filter(|s| s.current.is_some()).count()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
