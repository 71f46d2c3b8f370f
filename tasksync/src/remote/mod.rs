//! Binding to the remote document store.
//!
//! The remote is a dumb last-write-wins blob store holding one document per
//! account: no locking, no merging. [`RemoteStore`] is the narrow contract
//! the transports build on. Implementations:
//! - [`http::HttpRemoteStore`]: REST client for `tasksync-relay`
//! - [`memory::MemoryRemote`]: in-process store with scriptable failures

pub mod http;
pub mod memory;

use std::future::Future;
use std::sync::Arc;

use tasksync_proto::remote::{DeviceId, RemoteEnvelope, RemoteVersion};

use crate::auth::AuthToken;

/// Errors returned by a [`RemoteStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The token was rejected (HTTP 401 or 403).
    #[error("not authorized (HTTP {0})")]
    Unauthorized(u16),

    /// The server failed (HTTP 5xx).
    #[error("server error (HTTP {0})")]
    Server(u16),

    /// The request never completed (DNS, connection refused, reset).
    #[error("network error: {0}")]
    Network(String),

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The server answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Returns `true` for authentication rejections.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Returns `true` for failures worth retrying with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Server(_) | Self::Network(_) | Self::Timeout)
    }
}

/// Access to the single shared remote document of an account.
pub trait RemoteStore: Send + Sync + 'static {
    /// Fetches the current remote document.
    ///
    /// Returns `Ok(None)` if the account has never synced; a missing
    /// document is not an error.
    fn fetch(
        &self,
        account: &str,
        token: &AuthToken,
    ) -> impl Future<Output = Result<Option<RemoteEnvelope>, RemoteError>> + Send;

    /// Replaces the remote document, returning the version the server
    /// assigned to the write.
    fn push(
        &self,
        account: &str,
        token: &AuthToken,
        device_id: &DeviceId,
        payload: &[u8],
    ) -> impl Future<Output = Result<RemoteVersion, RemoteError>> + Send;
}

impl<R: RemoteStore> RemoteStore for Arc<R> {
    fn fetch(
        &self,
        account: &str,
        token: &AuthToken,
    ) -> impl Future<Output = Result<Option<RemoteEnvelope>, RemoteError>> + Send {
        (**self).fetch(account, token)
    }

    fn push(
        &self,
        account: &str,
        token: &AuthToken,
        device_id: &DeviceId,
        payload: &[u8],
    ) -> impl Future<Output = Result<RemoteVersion, RemoteError>> + Send {
        (**self).push(account, token, device_id, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(RemoteError::Unauthorized(401).is_auth());
        assert!(RemoteError::Unauthorized(403).is_auth());
        assert!(!RemoteError::Unauthorized(401).is_transient());
        assert!(RemoteError::Server(503).is_transient());
        assert!(RemoteError::Timeout.is_transient());
        assert!(RemoteError::Network("dns".into()).is_transient());
        assert!(!RemoteError::Protocol("bad body".into()).is_transient());
    }
}
