//! REST client for the remote document store.
//!
//! `GET {base}/v1/documents/{account}` returns a postcard
//! [`RemoteEnvelope`] (404 when nothing was ever written) and
//! `PUT {base}/v1/documents/{account}` accepts a postcard [`PushRequest`]
//! and answers with a [`PushAck`].

use std::time::Duration;

use reqwest::StatusCode;
use tasksync_proto::remote::{
    self, DeviceId, PushAck, PushRequest, RemoteEnvelope, RemoteVersion,
};
use url::Url;

use super::{RemoteError, RemoteStore};
use crate::auth::AuthToken;

/// [`RemoteStore`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpRemoteStore {
    /// Creates a client for the server at `base_url` (e.g. `http://127.0.0.1:9000`).
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Protocol`] if the URL cannot be parsed or is not
    /// http(s), or [`RemoteError::Network`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, RemoteError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RemoteError::Protocol(format!("invalid remote url {base_url}: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(RemoteError::Protocol(format!(
                "remote url must be http or https, got {}",
                base_url.scheme()
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    /// URL of the account's document resource.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Protocol`] if the base URL cannot carry a path.
    pub fn document_url(&self, account: &str) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RemoteError::Protocol("remote url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(remote::DOCUMENTS_PATH.trim_start_matches('/').split('/'))
            .push(account);
        Ok(url)
    }

    /// WebSocket URL of the account's subscription endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Protocol`] if the URL cannot be converted.
    pub fn subscribe_url(&self, account: &str) -> Result<Url, RemoteError> {
        let mut url = self.document_url(account)?;
        url.path_segments_mut()
            .map_err(|()| RemoteError::Protocol("remote url cannot be a base".to_string()))?
            .push("subscribe");
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| RemoteError::Protocol(format!("cannot use scheme {scheme}")))?;
        Ok(url)
    }
}

fn map_request_error(err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(err.to_string())
    }
}

fn check_status(status: StatusCode) -> Result<(), RemoteError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(RemoteError::Unauthorized(status.as_u16()))
    } else if status.is_server_error() {
        Err(RemoteError::Server(status.as_u16()))
    } else if !status.is_success() {
        Err(RemoteError::Protocol(format!("unexpected status {status}")))
    } else {
        Ok(())
    }
}

impl RemoteStore for HttpRemoteStore {
    async fn fetch(
        &self,
        account: &str,
        token: &AuthToken,
    ) -> Result<Option<RemoteEnvelope>, RemoteError> {
        let url = self.document_url(account)?;
        let response = self
            .client
            .get(url)
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(|e| map_request_error(&e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(response.status())?;

        let body = response.bytes().await.map_err(|e| map_request_error(&e))?;
        remote::decode::<RemoteEnvelope>(&body)
            .map(Some)
            .map_err(|e| RemoteError::Protocol(e.to_string()))
    }

    async fn push(
        &self,
        account: &str,
        token: &AuthToken,
        device_id: &DeviceId,
        payload: &[u8],
    ) -> Result<RemoteVersion, RemoteError> {
        let url = self.document_url(account)?;
        let body = remote::encode(&PushRequest {
            device_id: device_id.clone(),
            payload: payload.to_vec(),
        })
        .map_err(|e| RemoteError::Protocol(e.to_string()))?;

        let response = self
            .client
            .put(url)
            .bearer_auth(token.as_str())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| map_request_error(&e))?;
        check_status(response.status())?;

        let body = response.bytes().await.map_err(|e| map_request_error(&e))?;
        let ack: PushAck =
            remote::decode(&body).map_err(|e| RemoteError::Protocol(e.to_string()))?;
        Ok(ack.version)
    }
}
