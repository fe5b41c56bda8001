use std::io;

use roaring::RoaringTreemap;

use crate::SeriesId;

/// A set of series IDs backed by a roaring bitmap. This is the currency of
/// every "which series match" computation: postings lists in index files,
/// per-file added/tombstoned sets, and the intersections and unions the
/// query layer performs on them. Iteration is always ascending.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SeriesIdSet(RoaringTreemap);

impl SeriesIdSet {
    pub fn new() -> Self {
        Self(RoaringTreemap::new())
    }

    pub fn insert(&mut self, id: SeriesId) -> bool {
        self.0.insert(id)
    }

    pub fn remove(&mut self, id: SeriesId) -> bool {
        self.0.remove(id)
    }

    pub fn contains(&self, id: SeriesId) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> u64 {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = SeriesId> + '_ {
        self.0.iter()
    }

    /// Merges `other` into `self`.
    pub fn union_with(&mut self, other: &SeriesIdSet) {
        self.0 |= &other.0;
    }

    /// Removes every ID present in `other`.
    pub fn difference_with(&mut self, other: &SeriesIdSet) {
        self.0 -= &other.0;
    }

    pub fn union(&self, other: &SeriesIdSet) -> SeriesIdSet {
        SeriesIdSet(&self.0 | &other.0)
    }

    pub fn intersection(&self, other: &SeriesIdSet) -> SeriesIdSet {
        SeriesIdSet(&self.0 & &other.0)
    }

    pub fn and_not(&self, other: &SeriesIdSet) -> SeriesIdSet {
        SeriesIdSet(&self.0 - &other.0)
    }

    pub fn serialized_size(&self) -> usize {
        self.0.serialized_size()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        self.0.serialize_into(buf)
    }

    pub fn decode(data: &[u8]) -> io::Result<SeriesIdSet> {
        Ok(SeriesIdSet(RoaringTreemap::deserialize_from(data)?))
    }
}

impl FromIterator<SeriesId> for SeriesIdSet {
    fn from_iter<T: IntoIterator<Item = SeriesId>>(iter: T) -> Self {
        Self(RoaringTreemap::from_iter(iter))
    }
}

impl Extend<SeriesId> for SeriesIdSet {
    fn extend<T: IntoIterator<Item = SeriesId>>(&mut self, iter: T) {
        self.0.extend(iter)
    }
}
