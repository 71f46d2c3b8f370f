//! Property tests for document merging.
//!
//! Documents are generated from a small fixed pool of list and item ids so
//! that local and remote snapshots overlap heavily. Each id is either
//! absent, live with some stamp, or tombstoned.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;

use proptest::prelude::*;
use tasksync::sync::merge::merge_documents;
use tasksync_proto::codec;
use tasksync_proto::model::{Document, ItemId, ListId, TaskItem, TaskList};
use uuid::Uuid;

const LISTS: usize = 3;
const ITEMS: usize = 9;

#[derive(Debug, Clone)]
enum Slot {
    Absent,
    Live { stamp: u64, variant: u8 },
    Deleted { at: u64 },
}

fn arb_slot() -> impl Strategy<Value = Slot> {
    prop_oneof![
        Just(Slot::Absent),
        (0u64..12, 0u8..3).prop_map(|(stamp, variant)| Slot::Live { stamp, variant }),
        (0u64..12).prop_map(|at| Slot::Deleted { at }),
    ]
}

fn list_id(i: usize) -> ListId {
    ListId::from_uuid(Uuid::from_u128(0x1000 + i as u128))
}

fn item_id(j: usize) -> ItemId {
    ItemId::from_uuid(Uuid::from_u128(0x2000 + j as u128))
}

/// Item `j` always belongs to list `j % LISTS`. The task order names every
/// pooled id, live or not, and the document then passes through the codec
/// the way a peer's snapshot does.
fn build(lists: &[Slot], items: &[Slot], reversed: bool) -> Document {
    let mut doc = Document::default();
    for (i, slot) in lists.iter().enumerate() {
        match *slot {
            Slot::Absent => {}
            Slot::Deleted { at } => doc.deleted_list_ids.record_deletion(list_id(i), at),
            Slot::Live { stamp, variant } => {
                let mut list = TaskList::new(format!("list {variant}"), stamp);
                list.id = list_id(i);
                for (j, item_slot) in items.iter().enumerate().filter(|(j, _)| j % LISTS == i) {
                    match *item_slot {
                        Slot::Absent => {}
                        Slot::Deleted { at } => list.deleted_item_ids.record_deletion(item_id(j), at),
                        Slot::Live { stamp, variant } => {
                            let mut item = TaskItem::new(format!("item {variant}"), stamp);
                            item.id = item_id(j);
                            list.items.push(item);
                        }
                    }
                }
                if reversed {
                    list.items.reverse();
                }
                doc.lists.push(list);
            }
        }
    }
    if reversed {
        doc.lists.reverse();
    }
    doc.merged_task_order = (0..ITEMS).map(item_id).collect();
    if reversed {
        doc.merged_task_order.reverse();
    }
    let bytes = codec::encode_document(&doc).unwrap();
    codec::decode_document(&bytes).unwrap().0
}

fn arb_document() -> impl Strategy<Value = Document> {
    (
        prop::collection::vec(arb_slot(), LISTS),
        prop::collection::vec(arb_slot(), ITEMS),
        any::<bool>(),
    )
        .prop_map(|(lists, items, reversed)| build(&lists, &items, reversed))
}

fn live_ids(doc: &Document) -> BTreeSet<(ListId, Option<ItemId>)> {
    doc.lists
        .iter()
        .flat_map(|l| {
            std::iter::once((l.id, None)).chain(l.items.iter().map(move |i| (l.id, Some(i.id))))
        })
        .collect()
}

fn item_tombstoned(doc: &Document, list: ListId, item: ItemId) -> bool {
    doc.list(&list)
        .is_some_and(|l| l.deleted_item_ids.is_deleted(&item))
}

proptest! {
    #[test]
    fn merge_is_idempotent(local in arb_document(), remote in arb_document()) {
        let once = merge_documents(&local, &remote);
        let twice = merge_documents(&once, &remote);
        prop_assert_eq!(twice, once);
    }

    #[test]
    fn merging_nothing_changes_nothing(local in arb_document()) {
        prop_assert_eq!(merge_documents(&local, &Document::default()), local.clone());
        prop_assert_eq!(merge_documents(&local, &local), local);
    }

    #[test]
    fn tombstones_always_win(local in arb_document(), remote in arb_document()) {
        let merged = merge_documents(&local, &remote);

        for source in [&local, &remote] {
            for (id, _) in source.deleted_list_ids.iter() {
                prop_assert!(merged.list(id).is_none());
                prop_assert!(merged.deleted_list_ids.is_deleted(id));
            }
            for list in &source.lists {
                for (id, _) in list.deleted_item_ids.iter() {
                    prop_assert!(merged.find_item(id).is_none());
                }
            }
        }
    }

    #[test]
    fn newest_stamp_wins(local in arb_document(), remote in arb_document()) {
        let merged = merge_documents(&local, &remote);

        for list in &merged.lists {
            let stamps = [local.list(&list.id), remote.list(&list.id)]
                .into_iter()
                .flatten()
                .map(|l| l.last_modified);
            prop_assert_eq!(Some(list.last_modified), stamps.max());

            for item in &list.items {
                let stamps = [local.find_item(&item.id), remote.find_item(&item.id)]
                    .into_iter()
                    .flatten()
                    .map(|(_, i)| i.last_modified);
                prop_assert_eq!(Some(item.last_modified), stamps.max());
            }
        }
    }

    #[test]
    fn live_records_are_never_lost(local in arb_document(), remote in arb_document()) {
        let merged = merge_documents(&local, &remote);
        let present = live_ids(&merged);

        for (list, item) in live_ids(&local).into_iter().chain(live_ids(&remote)) {
            let list_deleted = local.deleted_list_ids.is_deleted(&list)
                || remote.deleted_list_ids.is_deleted(&list);
            let item_deleted = item.is_some_and(|item| {
                item_tombstoned(&local, list, item) || item_tombstoned(&remote, list, item)
            });
            if !list_deleted && !item_deleted {
                prop_assert!(present.contains(&(list, item)), "lost {list:?}/{item:?}");
            }
        }
    }

    #[test]
    fn both_directions_agree_on_membership(a in arb_document(), b in arb_document()) {
        let ab = merge_documents(&a, &b);
        let ba = merge_documents(&b, &a);
        prop_assert_eq!(live_ids(&ab), live_ids(&ba));
        prop_assert_eq!(&ab.deleted_list_ids, &ba.deleted_list_ids);
    }

    #[test]
    fn merged_order_lists_each_live_item_once(local in arb_document(), remote in arb_document()) {
        let merged = merge_documents(&local, &remote);
        let live: BTreeSet<ItemId> = merged.item_ids().collect();
        let ordered: BTreeSet<ItemId> = merged.merged_task_order.iter().copied().collect();

        prop_assert_eq!(ordered.len(), merged.merged_task_order.len());
        prop_assert_eq!(ordered, live);
    }
}
