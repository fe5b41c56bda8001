//! In-memory index over the series segments.
//!
//! Rebuilt from the segment files at open. Maps canonical series keys to
//! IDs and IDs to their insert entry's offset, and tracks which IDs have
//! been tombstoned. `key_to_id` may retain entries for tombstoned IDs
//! until compaction rewrites the segments, so lookups always consult the
//! tombstone set.

use std::collections::HashMap;

use crate::series_id_set::SeriesIdSet;
use crate::SeriesId;

#[derive(Default)]
pub struct SeriesIndex {
    key_to_id: HashMap<Vec<u8>, SeriesId>,
    id_to_offset: HashMap<SeriesId, u64>,
    tombstones: SeriesIdSet,
    live: u64,
    max_id: SeriesId,
}

impl SeriesIndex {
    /// Re-inserting a known ID only updates its offset, so replaying a
    /// segment twice cannot skew the live count.
    pub fn insert(&mut self, key: &[u8], id: SeriesId, offset: u64) {
        self.key_to_id.insert(key.to_vec(), id);
        if self.id_to_offset.insert(id, offset).is_none() {
            self.live += 1;
        }
        if id > self.max_id {
            self.max_id = id;
        }
    }

    /// Marks an ID as deleted. No-op for unknown or already deleted IDs.
    pub fn delete(&mut self, id: SeriesId) {
        if self.id_to_offset.contains_key(&id) && self.tombstones.insert(id) {
            self.live -= 1;
        }
    }

    /// Returns the live ID for a key, if any.
    pub fn series_id(&self, key: &[u8]) -> Option<SeriesId> {
        self.key_to_id
            .get(key)
            .copied()
            .filter(|id| !self.tombstones.contains(*id))
    }

    pub fn offset(&self, id: SeriesId) -> Option<u64> {
        self.id_to_offset.get(&id).copied()
    }

    pub fn set_offset(&mut self, id: SeriesId, offset: u64) {
        self.id_to_offset.insert(id, offset);
    }

    pub fn contains_id(&self, id: SeriesId) -> bool {
        self.id_to_offset.contains_key(&id)
    }

    pub fn is_deleted(&self, id: SeriesId) -> bool {
        self.tombstones.contains(id)
    }

    /// Drops all traces of an ID whose insert entry has been compacted away.
    pub fn purge(&mut self, id: SeriesId, key: &[u8]) {
        if self.key_to_id.get(key) == Some(&id) {
            self.key_to_id.remove(key);
        }
        self.id_to_offset.remove(&id);
        self.tombstones.remove(id);
    }

    pub fn tombstones(&self) -> &SeriesIdSet {
        &self.tombstones
    }

    pub fn series_count(&self) -> u64 {
        self.live
    }

    pub fn max_id(&self) -> SeriesId {
        self.max_id
    }

    /// Iterates live (key, id) pairs in map order.
    pub fn iter_live(&self) -> impl Iterator<Item = (&[u8], SeriesId)> {
        self.key_to_id
            .iter()
            .filter(|(_, id)| !self.tombstones.contains(**id))
            .map(|(key, id)| (key.as_slice(), *id))
    }
}
