//! In-process [`RemoteStore`] shared by every clone.
//!
//! Behaves like the relay's registry (one document per account, strictly
//! increasing versions) and adds knobs tests need: queued failures,
//! revoked tokens, artificial latency and call counters.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tasksync_proto::remote::{DeviceId, RemoteEnvelope, RemoteVersion};

use super::{RemoteError, RemoteStore};
use crate::auth::AuthToken;

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<String, RemoteEnvelope>,
    last_version: u64,
    fetch_failures: VecDeque<RemoteError>,
    push_failures: VecDeque<RemoteError>,
    revoked: HashSet<String>,
    fetch_delay: Duration,
    fetch_count: usize,
    push_count: usize,
}

/// Shared in-memory remote document store.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemote {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored document of `account`.
    #[must_use]
    pub fn document(&self, account: &str) -> Option<RemoteEnvelope> {
        self.inner.lock().documents.get(account).cloned()
    }

    /// Writes a document as if another device had pushed it.
    pub fn put(&self, account: &str, device_id: &DeviceId, payload: Vec<u8>) -> RemoteVersion {
        let mut inner = self.inner.lock();
        inner.last_version += 1;
        let version = RemoteVersion(inner.last_version);
        inner.documents.insert(
            account.to_string(),
            RemoteEnvelope {
                version,
                device_id: device_id.clone(),
                payload,
            },
        );
        version
    }

    /// Makes the next fetch fail with `error`. Calls queue up.
    pub fn fail_next_fetch(&self, error: RemoteError) {
        self.inner.lock().fetch_failures.push_back(error);
    }

    /// Makes the next push fail with `error`. Calls queue up.
    pub fn fail_next_push(&self, error: RemoteError) {
        self.inner.lock().push_failures.push_back(error);
    }

    /// Rejects every request carrying `token` with HTTP 401.
    pub fn revoke_token(&self, token: &str) {
        self.inner.lock().revoked.insert(token.to_string());
    }

    /// Accepts `token` again after [`MemoryRemote::revoke_token`].
    pub fn restore_token(&self, token: &str) {
        self.inner.lock().revoked.remove(token);
    }

    /// Delays every fetch by `delay`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.inner.lock().fetch_delay = delay;
    }

    /// Number of fetches attempted so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.inner.lock().fetch_count
    }

    /// Number of pushes attempted so far.
    #[must_use]
    pub fn push_count(&self) -> usize {
        self.inner.lock().push_count
    }
}

impl RemoteStore for MemoryRemote {
    async fn fetch(
        &self,
        account: &str,
        token: &AuthToken,
    ) -> Result<Option<RemoteEnvelope>, RemoteError> {
        let delay = {
            let mut inner = self.inner.lock();
            inner.fetch_count += 1;
            inner.fetch_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        if inner.revoked.contains(token.as_str()) {
            return Err(RemoteError::Unauthorized(401));
        }
        if let Some(error) = inner.fetch_failures.pop_front() {
            return Err(error);
        }
        Ok(inner.documents.get(account).cloned())
    }

    async fn push(
        &self,
        account: &str,
        token: &AuthToken,
        device_id: &DeviceId,
        payload: &[u8],
    ) -> Result<RemoteVersion, RemoteError> {
        {
            let mut inner = self.inner.lock();
            inner.push_count += 1;
            if inner.revoked.contains(token.as_str()) {
                return Err(RemoteError::Unauthorized(401));
            }
            if let Some(error) = inner.push_failures.pop_front() {
                return Err(error);
            }
        }
        Ok(self.put(account, device_id, payload.to_vec()))
    }
}
