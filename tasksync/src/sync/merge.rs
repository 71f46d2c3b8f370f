//! Last-writer-wins merge of two document snapshots.
//!
//! Lists merge as whole records: the remote copy replaces the local one only
//! if it is strictly newer. Items inside a list present on both sides merge
//! one by one with the same rule, except that on an exact timestamp tie a
//! remote copy whose fields differ is taken. A tombstone on either side
//! always removes the entity, however new the surviving copy is.
//!
//! The tie rule makes `merge` non-associative for conflicting equal stamps;
//! callers apply snapshots in arrival order.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use tasksync_proto::model::{Document, ItemId, ListId, TaskItem, TaskList};
use tasksync_proto::tombstone::Tombstones;

/// Merges `remote` into `local`.
///
/// List order follows `remote`, with local-only lists appended. Item order
/// within a list follows `local`, with remote-only items appended. The
/// merged task order is the remote order restricted to live items,
/// followed by local-order ids not yet present. Merged-view geometry is
/// device-local and kept from `local`.
#[must_use]
pub fn merge_documents(local: &Document, remote: &Document) -> Document {
    let deleted_lists = local.deleted_list_ids.merge(&remote.deleted_list_ids);
    let local_lists: HashMap<ListId, &TaskList> =
        local.lists.iter().map(|l| (l.id, l)).collect();

    let mut seen = HashSet::new();
    let mut lists = Vec::with_capacity(remote.lists.len().max(local.lists.len()));
    for remote_list in &remote.lists {
        if deleted_lists.is_deleted(&remote_list.id) || !seen.insert(remote_list.id) {
            continue;
        }
        lists.push(match local_lists.get(&remote_list.id) {
            Some(local_list) => merge_list(local_list, remote_list),
            None => remote_list.clone(),
        });
    }
    for local_list in &local.lists {
        if deleted_lists.is_deleted(&local_list.id) || !seen.insert(local_list.id) {
            continue;
        }
        lists.push(local_list.clone());
    }

    let merged_task_order = merge_order(&local.merged_task_order, &remote.merged_task_order, &lists);

    Document {
        lists,
        merged_task_order,
        merged_geometry: local.merged_geometry,
        deleted_list_ids: deleted_lists,
    }
}

/// Merges two copies of the same list.
#[must_use]
pub fn merge_list(local: &TaskList, remote: &TaskList) -> TaskList {
    let deleted_items = local.deleted_item_ids.merge(&remote.deleted_item_ids);
    let items = merge_items(&local.items, &remote.items, &deleted_items);
    let metadata = if remote.last_modified > local.last_modified {
        remote
    } else {
        local
    };
    TaskList {
        id: metadata.id,
        title: metadata.title.clone(),
        items,
        geometry: metadata.geometry,
        color: metadata.color,
        sort_descending: metadata.sort_descending,
        is_visible: metadata.is_visible,
        last_modified: metadata.last_modified,
        deleted_item_ids: deleted_items,
    }
}

fn merge_items(
    local: &[TaskItem],
    remote: &[TaskItem],
    deleted: &Tombstones<ItemId>,
) -> Vec<TaskItem> {
    let remote_items: HashMap<ItemId, &TaskItem> = remote.iter().map(|i| (i.id, i)).collect();
    let mut seen = HashSet::new();
    let mut items = Vec::with_capacity(local.len().max(remote.len()));

    for local_item in local {
        if deleted.is_deleted(&local_item.id) || !seen.insert(local_item.id) {
            continue;
        }
        let winner = remote_items
            .get(&local_item.id)
            .map_or(local_item, |remote_item| pick_item(local_item, remote_item));
        items.push(winner.clone());
    }
    for remote_item in remote {
        if deleted.is_deleted(&remote_item.id) || !seen.insert(remote_item.id) {
            continue;
        }
        items.push(remote_item.clone());
    }
    items
}

/// Picks the winning copy of one item.
///
/// The strictly newer copy wins. On a tie, the remote copy wins only if it
/// differs from the local one.
#[must_use]
pub fn pick_item<'a>(local: &'a TaskItem, remote: &'a TaskItem) -> &'a TaskItem {
    match remote.last_modified.cmp(&local.last_modified) {
        Ordering::Greater => remote,
        Ordering::Less => local,
        Ordering::Equal if remote != local => remote,
        Ordering::Equal => local,
    }
}

fn merge_order(local: &[ItemId], remote: &[ItemId], lists: &[TaskList]) -> Vec<ItemId> {
    let live: HashSet<ItemId> = lists
        .iter()
        .flat_map(|l| l.items.iter().map(|i| i.id))
        .collect();
    let mut seen = HashSet::new();
    remote
        .iter()
        .chain(local)
        .filter(|id| live.contains(id) && seen.insert(**id))
        .copied()
        .collect()
}
