//! Account identity and bearer-token provisioning.
//!
//! The authentication protocol itself is external: the engine only needs a
//! [`TokenProvider`] that hands out a currently valid token and can be asked
//! to refresh it after the remote rejected one.

use std::future::Future;
use std::sync::Arc;

/// The signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Account identifier; keys the remote document.
    pub account: String,
    /// Optional human-readable name.
    pub display_name: Option<String>,
}

impl Identity {
    /// Creates an identity with no display name.
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            display_name: None,
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{name} <{}>", self.account),
            None => write!(f, "{}", self.account),
        }
    }
}

/// An opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wraps a raw token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Errors from a [`TokenProvider`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No credentials are available.
    #[error("not signed in")]
    SignedOut,
    /// Obtaining a fresh token failed.
    #[error("token refresh failed: {0}")]
    Refresh(String),
}

/// Supplies bearer tokens for remote calls.
pub trait TokenProvider: Send + Sync + 'static {
    /// Returns a token believed to be valid.
    ///
    /// With `force_refresh`, any cached token must be discarded and a new one
    /// obtained; callers do this at most once per rejected request.
    fn valid_token(
        &self,
        force_refresh: bool,
    ) -> impl Future<Output = Result<AuthToken, AuthError>> + Send;
}

impl<T: TokenProvider> TokenProvider for Arc<T> {
    fn valid_token(
        &self,
        force_refresh: bool,
    ) -> impl Future<Output = Result<AuthToken, AuthError>> + Send {
        (**self).valid_token(force_refresh)
    }
}

/// A provider for a pre-issued token that cannot be refreshed.
///
/// Refreshing returns the same token, so a revoked token fails twice and
/// surfaces as a hard authentication error.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: AuthToken,
}

impl StaticTokenProvider {
    /// Creates a provider that always returns `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: AuthToken::new(token),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    async fn valid_token(&self, _force_refresh: bool) -> Result<AuthToken, AuthError> {
        if self.token.as_str().is_empty() {
            return Err(AuthError::SignedOut);
        }
        Ok(self.token.clone())
    }
}
