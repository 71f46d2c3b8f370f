//! Encoding and decoding of persisted / broadcast document snapshots.
//!
//! The current schema is a JSON object (see [`Document`]). Older clients
//! wrote a bare JSON array of lists without timestamps or tombstones; that
//! layout is still accepted by [`decode_document`] as a fallback so that
//! snapshots from older installs are never lost.

use serde::Deserialize;

use crate::model::{Document, Geometry, ItemId, ListColor, ListId, TaskItem, TaskList};
use crate::tombstone::Tombstones;

/// Error type for snapshot and wire encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// The payload matched neither the current nor the legacy schema.
    #[error("payload matches no known schema (current: {current}; legacy: {legacy})")]
    Malformed {
        /// Error reported by the current-schema decoder.
        current: String,
        /// Error reported by the legacy-schema decoder.
        legacy: String,
    },
    /// A postcard wire frame could not be decoded.
    #[error("wire decode error: {0}")]
    Wire(String),
}

/// Which schema a snapshot was decoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    /// The current object layout.
    Current,
    /// The legacy bare-array layout.
    Legacy,
}

/// Encodes a [`Document`] as JSON.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode_document(doc: &Document) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(doc).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decodes a [`Document`], falling back to the legacy layout.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if neither schema accepts the bytes.
pub fn decode_document(bytes: &[u8]) -> Result<(Document, SchemaVersion), CodecError> {
    let current = match serde_json::from_slice::<Document>(bytes) {
        Ok(mut doc) => {
            doc.retain_live_order();
            return Ok((doc, SchemaVersion::Current));
        }
        Err(e) => e.to_string(),
    };
    match serde_json::from_slice::<Vec<LegacyList>>(bytes) {
        Ok(lists) => Ok((upgrade_legacy(lists), SchemaVersion::Legacy)),
        Err(e) => Err(CodecError::Malformed {
            current,
            legacy: e.to_string(),
        }),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyList {
    id: ListId,
    #[serde(default)]
    title: String,
    #[serde(default)]
    items: Vec<LegacyItem>,
    #[serde(default, deserialize_with = "crate::model::known_or_default")]
    color: ListColor,
    #[serde(default)]
    window_frame: Option<Geometry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyItem {
    id: ItemId,
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_completed: bool,
    #[serde(default)]
    is_bold: bool,
    #[serde(default)]
    is_italic: bool,
    #[serde(default)]
    is_strikethrough: bool,
}

/// Legacy records carry no clock, so they are stamped at 0 and lose to any
/// edit made under the current schema.
fn upgrade_legacy(lists: Vec<LegacyList>) -> Document {
    let lists = lists
        .into_iter()
        .map(|l| TaskList {
            id: l.id,
            title: l.title,
            items: l
                .items
                .into_iter()
                .map(|i| TaskItem {
                    content: i.text,
                    is_completed: i.is_completed,
                    is_bold: i.is_bold,
                    is_italic: i.is_italic,
                    is_strikethrough: i.is_strikethrough,
                    id: i.id,
                    ..TaskItem::new(String::new(), 0)
                })
                .collect(),
            geometry: l.window_frame.unwrap_or_default(),
            color: l.color,
            sort_descending: false,
            is_visible: true,
            last_modified: 0,
            deleted_item_ids: Tombstones::new(),
        })
        .collect();
    Document {
        lists,
        ..Document::default()
    }
}
