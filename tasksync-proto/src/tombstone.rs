//! Deletion records that keep removed entities from resurrecting.
//!
//! A [`Tombstones`] map remembers, for every deleted id, the earliest time
//! any peer deleted it. Merging two maps is a per-id `min`, which makes it
//! commutative, associative and idempotent. Records older than
//! [`TOMBSTONE_RETENTION`] are pruned to bound payload growth.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Millis;

/// How long a deletion record is retained before it may be pruned.
pub const TOMBSTONE_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Map of deleted id to deletion time (milliseconds since epoch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
#[serde(bound(
    serialize = "K: Serialize",
    deserialize = "K: Deserialize<'de> + Ord"
))]
pub struct Tombstones<K> {
    entries: BTreeMap<K, Millis>,
}

impl<K> Default for Tombstones<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> Tombstones<K> {
    /// Creates an empty tombstone map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `id` was deleted at `when`.
    ///
    /// If `id` is already recorded, the earlier of the two times is kept.
    pub fn record_deletion(&mut self, id: K, when: Millis) {
        self.entries
            .entry(id)
            .and_modify(|t| *t = (*t).min(when))
            .or_insert(when);
    }

    /// Returns `true` if `id` has a deletion record.
    #[must_use]
    pub fn is_deleted(&self, id: &K) -> bool {
        self.entries.contains_key(id)
    }

    /// Returns the recorded deletion time of `id`, if any.
    #[must_use]
    pub fn deleted_at(&self, id: &K) -> Option<Millis> {
        self.entries.get(id).copied()
    }

    /// Returns the union of `self` and `other`, keeping the earliest
    /// deletion time per id.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        merged.merge_from(other);
        merged
    }

    /// Folds `other` into `self`, keeping the earliest deletion time per id.
    pub fn merge_from(&mut self, other: &Self) {
        for (id, when) in &other.entries {
            self.record_deletion(id.clone(), *when);
        }
    }

    /// Drops records older than `max_age` relative to `now`.
    ///
    /// Returns the number of records removed.
    pub fn prune(&mut self, now: Millis, max_age: Duration) -> usize {
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now.saturating_sub(max_age_ms);
        let before = self.entries.len();
        self.entries.retain(|_, when| *when >= cutoff);
        before - self.entries.len()
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of recorded deletions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(id, deletion time)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, Millis)> {
        self.entries.iter().map(|(k, v)| (k, *v))
    }
}

impl<K: Ord + Clone> FromIterator<(K, Millis)> for Tombstones<K> {
    fn from_iter<I: IntoIterator<Item = (K, Millis)>>(iter: I) -> Self {
        let mut tombstones = Self::new();
        for (id, when) in iter {
            tombstones.record_deletion(id, when);
        }
        tombstones
    }
}
