//! Edits to the document.
//!
//! [`ItemMutation`] and [`ListMutation`] are pure value updates that return
//! a new record with `last_modified` bumped. The document-level functions
//! below apply them, keep tombstones and the merged task order consistent,
//! and stamp the owning list on every membership change.

use std::num::NonZeroU32;
use std::time::Duration;

use tasksync_proto::model::{
    Document, Geometry, ItemId, ItemStatus, ListColor, ListId, Millis, Priority, TaskItem,
    TaskList,
};

use super::SyncError;

/// Returns a stamp that is at least `now` and strictly after `previous`.
#[must_use]
pub const fn next_stamp(previous: Millis, now: Millis) -> Millis {
    let bumped = previous.saturating_add(1);
    if now > bumped { now } else { bumped }
}

/// A change to a single item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemMutation {
    /// Replace the text.
    SetContent(String),
    /// Mark as done or not done.
    SetCompleted(bool),
    /// Flip the completion flag.
    ToggleCompleted,
    SetBold(bool),
    SetItalic(bool),
    SetStrikethrough(bool),
    SetPriority(Priority),
    SetStatus(ItemStatus),
    /// Set or clear the estimate in minutes.
    SetEstimate(Option<NonZeroU32>),
    /// Set or clear the reminder time.
    SetReminder(Option<Millis>),
}

impl ItemMutation {
    /// Returns `item` with the change applied and its stamp bumped.
    #[must_use]
    pub fn apply(&self, item: &TaskItem, now: Millis) -> TaskItem {
        let mut next = item.clone();
        match self {
            Self::SetContent(content) => next.content.clone_from(content),
            Self::SetCompleted(done) => next.is_completed = *done,
            Self::ToggleCompleted => next.is_completed = !next.is_completed,
            Self::SetBold(on) => next.is_bold = *on,
            Self::SetItalic(on) => next.is_italic = *on,
            Self::SetStrikethrough(on) => next.is_strikethrough = *on,
            Self::SetPriority(priority) => next.priority = *priority,
            Self::SetStatus(status) => next.status = *status,
            Self::SetEstimate(minutes) => next.estimated_minutes = *minutes,
            Self::SetReminder(at) => next.reminder_at = *at,
        }
        next.last_modified = next_stamp(item.last_modified, now);
        next
    }
}

/// A change to a list's metadata or item order.
#[derive(Debug, Clone, PartialEq)]
pub enum ListMutation {
    Rename(String),
    SetColor(ListColor),
    SetGeometry(Geometry),
    SetVisible(bool),
    SetSortDescending(bool),
    /// Move an item to a new position, clamped to the end of the list.
    MoveItem {
        /// Item to move.
        item_id: ItemId,
        /// Target index after removal.
        to_index: usize,
    },
    /// Stable sort by priority, direction from `sort_descending`.
    SortItems,
}

impl ListMutation {
    /// Returns `list` with the change applied and its stamp bumped.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ItemNotFound`] if `MoveItem` names an item the
    /// list does not hold.
    pub fn apply(&self, list: &TaskList, now: Millis) -> Result<TaskList, SyncError> {
        let mut next = list.clone();
        match self {
            Self::Rename(title) => next.title.clone_from(title),
            Self::SetColor(color) => next.color = *color,
            Self::SetGeometry(geometry) => next.geometry = *geometry,
            Self::SetVisible(visible) => next.is_visible = *visible,
            Self::SetSortDescending(descending) => next.sort_descending = *descending,
            Self::MoveItem { item_id, to_index } => {
                let from = next
                    .position(item_id)
                    .ok_or(SyncError::ItemNotFound(*item_id))?;
                let moved = next.items.remove(from);
                let to = (*to_index).min(next.items.len());
                next.items.insert(to, moved);
            }
            Self::SortItems => sort_by_priority(&mut next.items, next.sort_descending),
        }
        next.last_modified = next_stamp(list.last_modified, now);
        Ok(next)
    }
}

/// Stable sort by priority; highest first when `descending`.
pub fn sort_by_priority(items: &mut [TaskItem], descending: bool) {
    if descending {
        items.sort_by(|a, b| b.priority.cmp(&a.priority));
    } else {
        items.sort_by(|a, b| a.priority.cmp(&b.priority));
    }
}

/// Either kind of mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Item(ItemMutation),
    List(ListMutation),
}

impl From<ItemMutation> for Mutation {
    fn from(m: ItemMutation) -> Self {
        Self::Item(m)
    }
}

impl From<ListMutation> for Mutation {
    fn from(m: ListMutation) -> Self {
        Self::List(m)
    }
}

fn list_mut(doc: &mut Document, id: ListId) -> Result<&mut TaskList, SyncError> {
    doc.list_mut(&id).ok_or(SyncError::ListNotFound(id))
}

/// Appends a new list.
pub fn create_list(doc: &mut Document, title: impl Into<String>, now: Millis) -> ListId {
    let list = TaskList::new(title, now);
    let id = list.id;
    doc.lists.push(list);
    id
}

/// Removes a list, tombstoning it and dropping its items from the merged
/// order.
///
/// # Errors
///
/// Returns [`SyncError::ListNotFound`] if no list has this id.
pub fn delete_list(doc: &mut Document, id: ListId, now: Millis) -> Result<TaskList, SyncError> {
    let index = doc
        .lists
        .iter()
        .position(|l| l.id == id)
        .ok_or(SyncError::ListNotFound(id))?;
    let removed = doc.lists.remove(index);
    doc.deleted_list_ids.record_deletion(id, now);
    doc.merged_task_order
        .retain(|item| removed.item(item).is_none());
    Ok(removed)
}

/// Appends a new item to a list.
///
/// # Errors
///
/// Returns [`SyncError::ListNotFound`] if no list has this id.
pub fn create_item(
    doc: &mut Document,
    list_id: ListId,
    content: impl Into<String>,
    now: Millis,
) -> Result<ItemId, SyncError> {
    let list = list_mut(doc, list_id)?;
    let item = TaskItem::new(content, now);
    let id = item.id;
    list.items.push(item);
    list.last_modified = next_stamp(list.last_modified, now);
    doc.merged_task_order.push(id);
    Ok(id)
}

/// Removes an item from whichever list owns it, tombstoning it.
///
/// Returns the owning list's id.
///
/// # Errors
///
/// Returns [`SyncError::ItemNotFound`] if no list holds the item.
pub fn delete_item(doc: &mut Document, item_id: ItemId, now: Millis) -> Result<ListId, SyncError> {
    let owner = doc
        .owner_of(&item_id)
        .ok_or(SyncError::ItemNotFound(item_id))?;
    let list = list_mut(doc, owner)?;
    list.items.retain(|i| i.id != item_id);
    list.deleted_item_ids.record_deletion(item_id, now);
    list.last_modified = next_stamp(list.last_modified, now);
    doc.merged_task_order.retain(|id| *id != item_id);
    Ok(owner)
}

/// Applies `mutation` to a list, or to one of its items.
///
/// Item mutations stamp both the item and its list.
///
/// # Errors
///
/// Returns [`SyncError::ListNotFound`] or [`SyncError::ItemNotFound`] for
/// unknown ids, and [`SyncError::ItemRequired`] for an item mutation
/// without an item id.
pub fn apply(
    doc: &mut Document,
    list_id: ListId,
    item_id: Option<ItemId>,
    mutation: &Mutation,
    now: Millis,
) -> Result<(), SyncError> {
    let list = list_mut(doc, list_id)?;
    match mutation {
        Mutation::List(change) => {
            *list = change.apply(list, now)?;
        }
        Mutation::Item(change) => {
            let item_id = item_id.ok_or(SyncError::ItemRequired)?;
            let index = list
                .position(&item_id)
                .ok_or(SyncError::ItemNotFound(item_id))?;
            list.items[index] = change.apply(&list.items[index], now);
            list.last_modified = next_stamp(list.last_modified, now);
        }
    }
    Ok(())
}

/// Applies an item mutation, locating the owning list first.
///
/// Returns the owning list's id.
///
/// # Errors
///
/// Returns [`SyncError::ItemNotFound`] if no list holds the item.
pub fn update_item(
    doc: &mut Document,
    item_id: ItemId,
    change: ItemMutation,
    now: Millis,
) -> Result<ListId, SyncError> {
    let owner = doc
        .owner_of(&item_id)
        .ok_or(SyncError::ItemNotFound(item_id))?;
    apply(doc, owner, Some(item_id), &Mutation::Item(change), now)?;
    Ok(owner)
}

/// Drops list and item tombstones older than `max_age`.
///
/// Returns the number of records removed.
pub fn prune_tombstones(doc: &mut Document, now: Millis, max_age: Duration) -> usize {
    let lists = doc.deleted_list_ids.prune(now, max_age);
    doc.lists.iter_mut().fold(lists, |removed, list| {
        removed + list.deleted_item_ids.prune(now, max_age)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_list() -> (Document, ListId) {
        let mut doc = Document::default();
        let id = create_list(&mut doc, "Inbox", 100);
        (doc, id)
    }

    #[test]
    fn stamp_is_strictly_increasing() {
        assert_eq!(next_stamp(100, 500), 500);
        assert_eq!(next_stamp(100, 100), 101);
        assert_eq!(next_stamp(100, 50), 101);
        assert_eq!(next_stamp(Millis::MAX, 0), Millis::MAX);
    }

    #[test]
    fn item_mutation_stamps_item_and_list() {
        let (mut doc, list_id) = doc_with_list();
        let item_id = create_item(&mut doc, list_id, "milk", 200).unwrap();

        update_item(
            &mut doc,
            item_id,
            ItemMutation::SetContent("oat milk".into()),
            200,
        )
        .unwrap();

        let (list, item) = doc.find_item(&item_id).unwrap();
        assert_eq!(item.content, "oat milk");
        assert_eq!(item.last_modified, 201);
        assert!(list.last_modified > 200);
    }

    #[test]
    fn toggle_flips_completion() {
        let item = TaskItem::new("x", 1);
        let done = ItemMutation::ToggleCompleted.apply(&item, 2);
        assert!(done.is_completed);
        let undone = ItemMutation::ToggleCompleted.apply(&done, 3);
        assert!(!undone.is_completed);
        assert_eq!(undone.last_modified, 3);
    }

    #[test]
    fn item_mutation_without_item_is_rejected() {
        let (mut doc, list_id) = doc_with_list();
        let result = apply(
            &mut doc,
            list_id,
            None,
            &Mutation::Item(ItemMutation::SetBold(true)),
            5,
        );
        assert_eq!(result, Err(SyncError::ItemRequired));
    }

    #[test]
    fn delete_item_tombstones_and_cleans_order() {
        let (mut doc, list_id) = doc_with_list();
        let keep = create_item(&mut doc, list_id, "keep", 200).unwrap();
        let gone = create_item(&mut doc, list_id, "gone", 200).unwrap();

        let owner = delete_item(&mut doc, gone, 300).unwrap();

        assert_eq!(owner, list_id);
        let list = doc.list(&list_id).unwrap();
        assert!(list.item(&gone).is_none());
        assert_eq!(list.deleted_item_ids.deleted_at(&gone), Some(300));
        assert_eq!(doc.merged_task_order, vec![keep]);
        assert_eq!(
            delete_item(&mut doc, gone, 400),
            Err(SyncError::ItemNotFound(gone))
        );
    }

    #[test]
    fn delete_list_tombstones_and_cleans_order() {
        let (mut doc, list_id) = doc_with_list();
        create_item(&mut doc, list_id, "a", 1).unwrap();
        let other = create_list(&mut doc, "Other", 1);
        let survivor = create_item(&mut doc, other, "b", 1).unwrap();

        delete_list(&mut doc, list_id, 900).unwrap();

        assert!(doc.list(&list_id).is_none());
        assert_eq!(doc.deleted_list_ids.deleted_at(&list_id), Some(900));
        assert_eq!(doc.merged_task_order, vec![survivor]);
    }

    #[test]
    fn move_item_clamps_index() {
        let (mut doc, list_id) = doc_with_list();
        let a = create_item(&mut doc, list_id, "a", 1).unwrap();
        let b = create_item(&mut doc, list_id, "b", 1).unwrap();
        let c = create_item(&mut doc, list_id, "c", 1).unwrap();

        let change = Mutation::List(ListMutation::MoveItem {
            item_id: a,
            to_index: 99,
        });
        apply(&mut doc, list_id, None, &change, 2).unwrap();

        let order: Vec<_> = doc.list(&list_id).unwrap().items.iter().map(|i| i.id).collect();
        assert_eq!(order, vec![b, c, a]);
    }

    #[test]
    fn sort_is_stable_by_priority() {
        let (mut doc, list_id) = doc_with_list();
        let mut ids = Vec::new();
        for (name, priority) in [
            ("low-1", Priority::Low),
            ("high", Priority::High),
            ("low-2", Priority::Low),
            ("none", Priority::None),
        ] {
            let id = create_item(&mut doc, list_id, name, 1).unwrap();
            update_item(&mut doc, id, ItemMutation::SetPriority(priority), 1).unwrap();
            ids.push(id);
        }

        let titles = |doc: &Document| -> Vec<String> {
            doc.list(&list_id)
                .unwrap()
                .items
                .iter()
                .map(|i| i.content.clone())
                .collect()
        };

        apply(&mut doc, list_id, None, &ListMutation::SortItems.into(), 2).unwrap();
        assert_eq!(titles(&doc), ["none", "low-1", "low-2", "high"]);

        apply(
            &mut doc,
            list_id,
            None,
            &ListMutation::SetSortDescending(true).into(),
            3,
        )
        .unwrap();
        apply(&mut doc, list_id, None, &ListMutation::SortItems.into(), 4).unwrap();
        assert_eq!(titles(&doc), ["high", "low-1", "low-2", "none"]);
    }

    #[test]
    fn prune_covers_lists_and_items() {
        const DAY: Millis = 24 * 60 * 60 * 1000;
        let (mut doc, list_id) = doc_with_list();
        let now = 90 * DAY;
        doc.deleted_list_ids.record_deletion(ListId::new(), now - 40 * DAY);
        doc.deleted_list_ids.record_deletion(ListId::new(), now - DAY);
        let list = doc.list_mut(&list_id).unwrap();
        list.deleted_item_ids.record_deletion(ItemId::new(), now - 31 * DAY);
        list.deleted_item_ids.record_deletion(ItemId::new(), now - 2 * DAY);

        let removed = prune_tombstones(&mut doc, now, Duration::from_secs(30 * 24 * 60 * 60));

        assert_eq!(removed, 2);
        assert_eq!(doc.deleted_list_ids.len(), 1);
        assert_eq!(doc.list(&list_id).unwrap().deleted_item_ids.len(), 1);
    }

    #[test]
    fn unknown_list_is_reported() {
        let mut doc = Document::default();
        let missing = ListId::new();
        assert_eq!(
            create_item(&mut doc, missing, "x", 1),
            Err(SyncError::ListNotFound(missing))
        );
        assert!(matches!(
            delete_list(&mut doc, missing, 1),
            Err(SyncError::ListNotFound(_))
        ));
    }
}
