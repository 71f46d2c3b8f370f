//! Wire types exchanged with the remote document store.
//!
//! The remote holds one opaque document per account. Every write is
//! stamped by the server with a [`RemoteVersion`] (its update timestamp)
//! and the [`DeviceId`] of the writer, which lets clients skip snapshots
//! they wrote themselves or have already applied.
//!
//! All types here are postcard-encoded: REST bodies for polling, and
//! WebSocket binary frames for the subscription strategy.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::CodecError;

/// Path prefix of the document REST API.
pub const DOCUMENTS_PATH: &str = "/v1/documents";

/// Maximum accepted account identifier length.
pub const MAX_ACCOUNT_LENGTH: usize = 128;

/// Server-assigned update timestamp of the remote document.
///
/// Strictly increasing per account; opaque to clients except for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemoteVersion(pub u64);

impl std::fmt::Display for RemoteVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifier of a writing device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device identifier from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random device identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The remote document as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEnvelope {
    /// Update timestamp assigned by the server on write.
    pub version: RemoteVersion,
    /// Device that performed the write.
    pub device_id: DeviceId,
    /// Opaque serialized document.
    pub payload: Vec<u8>,
}

/// Body of a document write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Writing device.
    pub device_id: DeviceId,
    /// Opaque serialized document.
    pub payload: Vec<u8>,
}

/// Response to a successful document write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    /// Version assigned to the write.
    pub version: RemoteVersion,
}

/// Frames sent by a client on the subscription socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Must be the first frame after connecting.
    Subscribe {
        /// Account whose document to follow.
        account: String,
        /// Bearer token for the account.
        token: String,
    },
}

/// Frames sent by the server on the subscription socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Subscription accepted. The current document, if any, follows.
    Subscribed {
        /// Account echoed back.
        account: String,
    },
    /// The document changed (or is being replayed after subscribing).
    Updated(RemoteEnvelope),
    /// Subscription refused.
    Rejected {
        /// Human-readable reason.
        reason: String,
        /// Whether the refusal was an authentication failure.
        unauthorized: bool,
    },
}

/// Returns `true` if `account` is usable as a document key.
///
/// Accepts 1..=128 characters of ASCII alphanumerics and `-_.@`.
#[must_use]
pub fn is_valid_account(account: &str) -> bool {
    !account.is_empty()
        && account.len() <= MAX_ACCOUNT_LENGTH
        && account
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'@'))
}

/// Encodes a wire value with postcard.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decodes a wire value with postcard.
///
/// # Errors
///
/// Returns [`CodecError::Wire`] if the bytes are not a valid `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Wire(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let env = RemoteEnvelope {
            version: RemoteVersion(1_700_000_000_000),
            device_id: DeviceId::new("laptop"),
            payload: b"{}".to_vec(),
        };
        let bytes = encode(&env).unwrap();
        let back: RemoteEnvelope = decode(&bytes).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn rejected_frame_round_trip() {
        let frame = ServerFrame::Rejected {
            reason: "bad token".to_string(),
            unauthorized: true,
        };
        let back: ServerFrame = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(decode::<PushAck>(&[]).is_err());
        assert!(decode::<ServerFrame>(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn generated_device_ids_differ() {
        assert_ne!(DeviceId::generate(), DeviceId::generate());
    }

    #[test]
    fn account_validation() {
        assert!(is_valid_account("alice@example.com"));
        assert!(is_valid_account("user_42-x"));
        assert!(!is_valid_account(""));
        assert!(!is_valid_account("a/b"));
        assert!(!is_valid_account("has space"));
        assert!(!is_valid_account(&"a".repeat(MAX_ACCOUNT_LENGTH + 1)));
    }
}
