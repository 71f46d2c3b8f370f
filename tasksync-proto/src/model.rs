//! The synchronized document model.
//!
//! A [`Document`] owns an ordered sequence of [`TaskList`]s, each of which
//! owns an ordered sequence of [`TaskItem`]s. Every list and item carries a
//! `last_modified` timestamp (milliseconds since epoch) which is the only
//! signal the merge engine uses to pick a winner between two versions of
//! the same id. Deleted ids are remembered in [`Tombstones`] maps at the
//! list level (item tombstones) and document level (list tombstones).
//!
//! Every field except `id` has a serde default so that snapshots written by
//! older or newer peers always decode; unknown fields are ignored.

use std::collections::HashSet;
use std::num::NonZeroU32;

use serde::de::{DeserializeOwned, IntoDeserializer};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::tombstone::Tombstones;

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Unique identifier for a [`TaskList`] (UUID v7, time-ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListId(Uuid);

impl ListId {
    /// Creates a new time-ordered list identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ListId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ListId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ListId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a [`TaskItem`] (UUID v7, time-ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Uuid);

impl ItemId {
    /// Creates a new time-ordered item identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates an `ItemId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task priority. Ordered: `None < Low < Medium < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    /// No priority assigned.
    #[default]
    None,
    /// Low priority.
    Low,
    /// Medium priority.
    Medium,
    /// High priority.
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Workflow status of a task. Unordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemStatus {
    /// Not started.
    #[default]
    Todo,
    /// Being worked on.
    InProgress,
    /// Waiting on something else.
    Blocked,
    /// Finished.
    Done,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Todo => write!(f, "todo"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Blocked => write!(f, "blocked"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Color tag of a list, from a fixed palette.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ListColor {
    #[default]
    Yellow,
    Blue,
    Green,
    Pink,
    Purple,
    Orange,
    Gray,
}

/// Window position and size. Persisted for the presentation layer only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 300.0,
            height: 400.0,
        }
    }
}

/// Reads a unit-variant name, mapping names this build does not know (and
/// `null`) to the default variant.
pub(crate) fn known_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let Some(name) = Option::<String>::deserialize(deserializer)? else {
        return Ok(T::default());
    };
    Ok(T::deserialize(name.into_deserializer())
        .unwrap_or_else(|_: serde::de::value::Error| T::default()))
}

const fn default_true() -> bool {
    true
}

/// A single task inside a [`TaskList`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskItem {
    /// Unique item identifier.
    pub id: ItemId,
    /// Text content.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub is_bold: bool,
    #[serde(default)]
    pub is_italic: bool,
    #[serde(default)]
    pub is_strikethrough: bool,
    #[serde(default, deserialize_with = "known_or_default")]
    pub priority: Priority,
    #[serde(default, deserialize_with = "known_or_default")]
    pub status: ItemStatus,
    /// Estimated duration in minutes, positive or absent.
    #[serde(default)]
    pub estimated_minutes: Option<NonZeroU32>,
    /// Reminder time (milliseconds since epoch).
    #[serde(default)]
    pub reminder_at: Option<Millis>,
    /// Stamped on every field mutation.
    #[serde(default)]
    pub last_modified: Millis,
}

impl TaskItem {
    /// Creates a new, uncompleted item stamped at `now`.
    #[must_use]
    pub fn new(content: impl Into<String>, now: Millis) -> Self {
        Self {
            id: ItemId::new(),
            content: content.into(),
            is_completed: false,
            is_bold: false,
            is_italic: false,
            is_strikethrough: false,
            priority: Priority::None,
            status: ItemStatus::Todo,
            estimated_minutes: None,
            reminder_at: None,
            last_modified: now,
        }
    }
}

/// An ordered list of tasks plus list-level metadata.
///
/// Item order is user-controlled and is never re-sorted implicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskList {
    /// Unique list identifier.
    pub id: ListId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub items: Vec<TaskItem>,
    #[serde(default)]
    pub geometry: Geometry,
    #[serde(default, deserialize_with = "known_or_default")]
    pub color: ListColor,
    #[serde(default)]
    pub sort_descending: bool,
    #[serde(default = "default_true")]
    pub is_visible: bool,
    /// Stamped on every metadata or membership change.
    #[serde(default)]
    pub last_modified: Millis,
    /// Item-level tombstones.
    #[serde(default, rename = "deletedItemIDs")]
    pub deleted_item_ids: Tombstones<ItemId>,
}

impl TaskList {
    /// Creates a new, empty, visible list stamped at `now`.
    #[must_use]
    pub fn new(title: impl Into<String>, now: Millis) -> Self {
        Self {
            id: ListId::new(),
            title: title.into(),
            items: Vec::new(),
            geometry: Geometry::default(),
            color: ListColor::default(),
            sort_descending: false,
            is_visible: true,
            last_modified: now,
            deleted_item_ids: Tombstones::new(),
        }
    }

    /// Returns the item with the given id, if present.
    #[must_use]
    pub fn item(&self, id: &ItemId) -> Option<&TaskItem> {
        self.items.iter().find(|i| i.id == *id)
    }

    /// Returns the position of the item with the given id, if present.
    #[must_use]
    pub fn position(&self, id: &ItemId) -> Option<usize> {
        self.items.iter().position(|i| i.id == *id)
    }
}

/// The root synchronized aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Document {
    /// All live lists, in display order.
    pub lists: Vec<TaskList>,
    /// Display order for the cross-list "all tasks" view. Not authoritative
    /// over list membership.
    pub merged_task_order: Vec<ItemId>,
    /// Window geometry of the cross-list view.
    pub merged_geometry: Geometry,
    /// List-level tombstones.
    #[serde(rename = "deletedListIDs")]
    pub deleted_list_ids: Tombstones<ListId>,
}

impl Document {
    /// Returns `true` when the document holds no lists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Returns the list with the given id, if present.
    #[must_use]
    pub fn list(&self, id: &ListId) -> Option<&TaskList> {
        self.lists.iter().find(|l| l.id == *id)
    }

    /// Returns a mutable reference to the list with the given id, if present.
    pub fn list_mut(&mut self, id: &ListId) -> Option<&mut TaskList> {
        self.lists.iter_mut().find(|l| l.id == *id)
    }

    /// Returns the id of the list that owns `item`, if any.
    #[must_use]
    pub fn owner_of(&self, item: &ItemId) -> Option<ListId> {
        self.lists
            .iter()
            .find(|l| l.items.iter().any(|i| i.id == *item))
            .map(|l| l.id)
    }

    /// Returns the item with the given id together with its owning list.
    #[must_use]
    pub fn find_item(&self, item: &ItemId) -> Option<(&TaskList, &TaskItem)> {
        self.lists
            .iter()
            .find_map(|l| l.item(item).map(|i| (l, i)))
    }

    /// Iterates over the ids of every live item, list by list.
    pub fn item_ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.lists.iter().flat_map(|l| l.items.iter().map(|i| i.id))
    }

    /// Drops entries of `merged_task_order` that name no live item, keeping
    /// the first occurrence of each id.
    pub fn retain_live_order(&mut self) {
        let live: HashSet<ItemId> = self.item_ids().collect();
        let mut seen = HashSet::with_capacity(live.len());
        self.merged_task_order
            .retain(|id| live.contains(id) && seen.insert(*id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_order_entries_are_dropped() {
        let mut list = TaskList::new("List", 1);
        let kept = TaskItem::new("kept", 1);
        let kept_id = kept.id;
        list.items.push(kept);
        let mut doc = Document {
            lists: vec![list],
            ..Document::default()
        };
        doc.merged_task_order = vec![ItemId::new(), kept_id, kept_id];

        doc.retain_live_order();
        assert_eq!(doc.merged_task_order, vec![kept_id]);
    }

    #[test]
    fn priority_is_ordered() {
        assert!(Priority::None < Priority::Low);
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
    }

    #[test]
    fn new_list_is_visible_and_empty() {
        let list = TaskList::new("Groceries", 42);
        assert!(list.is_visible);
        assert!(list.items.is_empty());
        assert_eq!(list.last_modified, 42);
        assert!(list.deleted_item_ids.is_empty());
    }

    #[test]
    fn item_with_only_id_decodes_with_defaults() {
        let id = ItemId::new();
        let json = format!(r#"{{"id":"{id}"}}"#);
        let item: TaskItem = serde_json::from_str(&json).unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.content, "");
        assert_eq!(item.priority, Priority::None);
        assert_eq!(item.status, ItemStatus::Todo);
        assert_eq!(item.estimated_minutes, None);
        assert_eq!(item.last_modified, 0);
    }

    #[test]
    fn list_missing_visibility_defaults_to_visible() {
        let id = ListId::new();
        let json = format!(r#"{{"id":"{id}","title":"Work"}}"#);
        let list: TaskList = serde_json::from_str(&json).unwrap();
        assert!(list.is_visible);
        assert_eq!(list.color, ListColor::Yellow);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let id = ItemId::new();
        let json = format!(r#"{{"id":"{id}","content":"x","futureField":[1,2,3]}}"#);
        let item: TaskItem = serde_json::from_str(&json).unwrap();
        assert_eq!(item.content, "x");
    }

    #[test]
    fn zero_estimate_is_rejected() {
        let id = ItemId::new();
        let json = format!(r#"{{"id":"{id}","estimatedMinutes":0}}"#);
        assert!(serde_json::from_str::<TaskItem>(&json).is_err());
    }

    #[test]
    fn tombstone_fields_use_wire_names() {
        let mut doc = Document::default();
        doc.deleted_list_ids.record_deletion(ListId::new(), 5);
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"deletedListIDs\""));
        assert!(json.contains("\"mergedTaskOrder\""));
    }

    #[test]
    fn find_item_reports_owner() {
        let mut list = TaskList::new("A", 1);
        let item = TaskItem::new("milk", 1);
        let item_id = item.id;
        list.items.push(item);
        let list_id = list.id;
        let doc = Document {
            lists: vec![list],
            ..Document::default()
        };

        let (owner, found) = doc.find_item(&item_id).unwrap();
        assert_eq!(owner.id, list_id);
        assert_eq!(found.content, "milk");
        assert_eq!(doc.owner_of(&item_id), Some(list_id));
        assert_eq!(doc.item_ids().collect::<Vec<_>>(), vec![item_id]);
    }
}
