//! Shared building blocks for index file encoding: byte ranges and the
//! in-file robin hood hash indexes used for point lookups.
//!
//! A hash index stores a count, a power-of-two capacity and one u64 slot
//! per bucket holding the absolute file offset of an element, zero meaning
//! empty. Hashes are not stored; probes recompute them from the element
//! key read back through a caller-supplied accessor.

use bytes::{Buf, BufMut};

use tsidx_utils::rhh;

use crate::error::Result;

/// Load factor percentage for hash index capacity sizing.
const LOAD_FACTOR: u64 = 90;

/// An absolute byte range inside an index file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Section {
    pub offset: u64,
    pub size: u64,
}

impl Section {
    pub const ENCODED_LEN: usize = 16;

    pub fn new(offset: u64, size: u64) -> Section {
        Section { offset, size }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_u64(self.offset);
        buf.put_u64(self.size);
    }

    pub fn decode(mut data: &[u8]) -> Option<Section> {
        if data.len() < Self::ENCODED_LEN {
            return None;
        }
        let offset = data.get_u64();
        let size = data.get_u64();
        Some(Section { offset, size })
    }

    /// The bytes this section covers, if in bounds.
    pub fn slice<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(self.size)?;
        data.get(self.offset as usize..end as usize)
    }
}

/// Accumulates (key hash, element offset) pairs and encodes them as an
/// in-file hash index.
#[derive(Default)]
pub struct HashIndexWriter {
    entries: Vec<(u64, u64)>,
}

impl HashIndexWriter {
    pub fn add(&mut self, key: &[u8], offset: u64) {
        self.entries.push((rhh::hash_key(key), offset));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let count = self.entries.len() as u64;
        let capacity = rhh::pow2(count * 100 / LOAD_FACTOR + 1);
        let mask = capacity - 1;

        let mut slots: Vec<(u64, u64)> = vec![(0, 0); capacity as usize];
        for &entry in &self.entries {
            let (mut hash, mut offset) = entry;
            let mut pos = hash & mask;
            let mut d = 0u64;
            loop {
                if slots[pos as usize].1 == 0 {
                    slots[pos as usize] = (hash, offset);
                    break;
                }
                // steal the slot from a richer resident
                let their = rhh::dist(slots[pos as usize].0, pos, capacity);
                if their < d {
                    let evicted = slots[pos as usize];
                    slots[pos as usize] = (hash, offset);
                    hash = evicted.0;
                    offset = evicted.1;
                    d = their;
                }
                pos = (pos + 1) & mask;
                d += 1;
            }
        }

        buf.put_u64(count);
        buf.put_u64(capacity);
        for (_, offset) in slots {
            buf.put_u64(offset);
        }
    }
}

/// Probes an encoded hash index for `target`, returning the element offset
/// on a hit. `read_key` resolves an element offset to its key bytes.
pub fn hash_index_probe<'a, F>(index: &[u8], target: &[u8], read_key: F) -> Result<Option<u64>>
where
    F: Fn(u64) -> Result<&'a [u8]>,
{
    if index.len() < 16 {
        return Ok(None);
    }
    let mut header = index;
    let _count = header.get_u64();
    let capacity = header.get_u64();
    if capacity == 0 || index.len() < 16 + capacity as usize * 8 {
        return Ok(None);
    }
    let mask = capacity - 1;

    let hash = rhh::hash_key(target);
    let mut pos = hash & mask;
    for d in 0..capacity {
        let start = 16 + pos as usize * 8;
        let offset = (&index[start..start + 8]).get_u64();
        if offset == 0 {
            return Ok(None);
        }

        let key = read_key(offset)?;
        if key == target {
            return Ok(Some(offset));
        }

        // a resident closer to home than us means the target is absent
        if d > rhh::dist(rhh::hash_key(key), pos, capacity) {
            return Ok(None);
        }
        pos = (pos + 1) & mask;
    }
    Ok(None)
}
