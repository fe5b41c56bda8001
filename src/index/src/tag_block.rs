//! Tag blocks: the per-measurement region of an index file holding its tag
//! keys, their values and the series IDs under each value.
//!
//! Layout, all offsets absolute within the file:
//!
//! ```text
//! per key:  value elems, then a hash index over them
//! then:     key elems (flag, key, value data + index sections)
//! then:     hash index over key elems
//! trailer:  keys data section | keys index section | version  (34 bytes)
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use bytes::BufMut;

use crate::block::{hash_index_probe, HashIndexWriter, Section};
use crate::codec::{put_uvarint, read_uvarint};
use crate::error::{IndexError, Result};
use crate::iterator::{TagKeyElem, TagValueElem};
use crate::series_id_set::SeriesIdSet;

pub const TAG_BLOCK_VERSION: u16 = 1;
pub const TAG_TOMBSTONE_FLAG: u8 = 0x01;
pub const TAG_BLOCK_TRAILER_LEN: usize = 2 * Section::ENCODED_LEN + 2;

#[derive(Default)]
struct KeyEntry {
    deleted: bool,
    values: BTreeMap<Vec<u8>, (bool, SeriesIdSet)>,
}

/// Accumulates one measurement's tag set and encodes it as a tag block.
#[derive(Default)]
pub struct TagBlockWriter {
    keys: BTreeMap<Vec<u8>, KeyEntry>,
}

impl TagBlockWriter {
    /// Registers a tag key, marking it deleted if `deleted` is set. Adding
    /// values later does not clear the mark.
    pub fn add_tag_key(&mut self, key: &[u8], deleted: bool) {
        let entry = self.keys.entry(key.to_vec()).or_default();
        entry.deleted = deleted;
    }

    pub fn add_tag_value(&mut self, key: &[u8], value: &[u8], deleted: bool, ids: SeriesIdSet) {
        let entry = self.keys.entry(key.to_vec()).or_default();
        entry.values.insert(value.to_vec(), (deleted, ids));
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Appends the encoded block to `buf` and returns its section.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<Section> {
        let block_start = buf.len() as u64;

        struct KeyMeta<'a> {
            key: &'a [u8],
            deleted: bool,
            values_data: Section,
            values_index: Section,
        }
        let mut metas = Vec::with_capacity(self.keys.len());

        for (key, entry) in &self.keys {
            let values_start = buf.len() as u64;
            let mut vindex = HashIndexWriter::default();

            for (value, (deleted, ids)) in &entry.values {
                vindex.add(value, buf.len() as u64);
                buf.push(if *deleted { TAG_TOMBSTONE_FLAG } else { 0 });
                put_uvarint(buf, value.len() as u64);
                buf.extend_from_slice(value);

                let mut set_bytes = Vec::with_capacity(ids.serialized_size());
                ids.encode_into(&mut set_bytes)?;
                put_uvarint(buf, set_bytes.len() as u64);
                buf.extend_from_slice(&set_bytes);
            }
            let values_data = Section::new(values_start, buf.len() as u64 - values_start);

            let vindex_start = buf.len() as u64;
            vindex.encode_into(buf);
            let values_index = Section::new(vindex_start, buf.len() as u64 - vindex_start);

            metas.push(KeyMeta {
                key,
                deleted: entry.deleted,
                values_data,
                values_index,
            });
        }

        let keys_start = buf.len() as u64;
        let mut kindex = HashIndexWriter::default();
        for meta in &metas {
            kindex.add(meta.key, buf.len() as u64);
            buf.push(if meta.deleted { TAG_TOMBSTONE_FLAG } else { 0 });
            put_uvarint(buf, meta.key.len() as u64);
            buf.extend_from_slice(meta.key);
            meta.values_data.encode_into(buf);
            meta.values_index.encode_into(buf);
        }
        let keys_data = Section::new(keys_start, buf.len() as u64 - keys_start);

        let kindex_start = buf.len() as u64;
        kindex.encode_into(buf);
        let keys_index = Section::new(kindex_start, buf.len() as u64 - kindex_start);

        keys_data.encode_into(buf);
        keys_index.encode_into(buf);
        buf.put_u16(TAG_BLOCK_VERSION);

        Ok(Section::new(block_start, buf.len() as u64 - block_start))
    }
}

/// A decoded tag key element, with the sections needed to reach its values.
#[derive(Clone, Debug)]
pub struct TagKeyInfo {
    pub key: Vec<u8>,
    pub deleted: bool,
    values_data: Section,
    values_index: Section,
}

/// Parsed tag block handle; methods take the whole file's bytes.
#[derive(Clone, Copy, Debug)]
pub struct TagBlock {
    keys_data: Section,
    keys_index: Section,
}

impl TagBlock {
    pub fn parse(path: &Path, data: &[u8], section: Section) -> Result<TagBlock> {
        let block = section
            .slice(data)
            .ok_or_else(|| IndexError::corruption(path, "tag block out of bounds"))?;
        if block.len() < TAG_BLOCK_TRAILER_LEN {
            return Err(IndexError::corruption(path, "short tag block"));
        }

        let trailer = &block[block.len() - TAG_BLOCK_TRAILER_LEN..];
        let keys_data = Section::decode(trailer)
            .ok_or_else(|| IndexError::corruption(path, "bad tag block trailer"))?;
        let keys_index = Section::decode(&trailer[Section::ENCODED_LEN..])
            .ok_or_else(|| IndexError::corruption(path, "bad tag block trailer"))?;
        let version = u16::from_be_bytes([trailer[32], trailer[33]]);
        if version != TAG_BLOCK_VERSION {
            return Err(IndexError::corruption(
                path,
                format!("unsupported tag block version {version}"),
            ));
        }
        Ok(TagBlock {
            keys_data,
            keys_index,
        })
    }

    /// Point lookup of one tag key.
    pub fn key_info(&self, path: &Path, data: &[u8], key: &[u8]) -> Result<Option<TagKeyInfo>> {
        let index = self
            .keys_index
            .slice(data)
            .ok_or_else(|| IndexError::corruption(path, "tag key index out of bounds"))?;

        let offset = hash_index_probe(index, key, |offset| {
            let (_, key, _) = decode_key_header(path, data, offset)?;
            Ok(key)
        })?;
        match offset {
            Some(offset) => Ok(Some(decode_key_info(path, data, offset)?.0)),
            None => Ok(None),
        }
    }

    /// Point lookup of one value under a key, decoding its series IDs.
    pub fn value_series_ids(
        &self,
        path: &Path,
        data: &[u8],
        info: &TagKeyInfo,
        value: &[u8],
    ) -> Result<Option<(bool, SeriesIdSet)>> {
        let index = info
            .values_index
            .slice(data)
            .ok_or_else(|| IndexError::corruption(path, "tag value index out of bounds"))?;

        let offset = hash_index_probe(index, value, |offset| {
            let (_, value, _) = decode_value_header(path, data, offset)?;
            Ok(value)
        })?;
        let offset = match offset {
            Some(offset) => offset,
            None => return Ok(None),
        };

        let (flag, _, rest) = decode_value_header(path, data, offset)?;
        let (set_len, n) = read_uvarint(rest)
            .ok_or_else(|| IndexError::corruption(path, "truncated tag value set"))?;
        let set_bytes = rest
            .get(n..n + set_len as usize)
            .ok_or_else(|| IndexError::corruption(path, "truncated tag value set"))?;
        let ids = SeriesIdSet::decode(set_bytes)
            .map_err(|_| IndexError::corruption(path, "invalid tag value set"))?;
        Ok(Some((flag & TAG_TOMBSTONE_FLAG != 0, ids)))
    }

    /// All key elements in key order, without their value sets.
    pub fn key_elems(&self, path: &Path, data: &[u8]) -> Result<Vec<TagKeyElem>> {
        if self.keys_data.slice(data).is_none() {
            return Err(IndexError::corruption(path, "tag key data out of bounds"));
        }

        let mut out = Vec::new();
        let mut pos = self.keys_data.offset;
        let end = self.keys_data.offset + self.keys_data.size;
        while pos < end {
            let (info, consumed) = decode_key_info(path, data, pos)?;
            pos += consumed;
            out.push(TagKeyElem {
                key: info.key,
                deleted: info.deleted,
            });
        }
        Ok(out)
    }

    /// All value elements under a key in value order, without their sets.
    pub fn value_elems(
        &self,
        path: &Path,
        data: &[u8],
        info: &TagKeyInfo,
    ) -> Result<Vec<TagValueElem>> {
        let mut out = Vec::new();
        let mut pos = info.values_data.offset;
        let end = info.values_data.offset + info.values_data.size;
        while pos < end {
            let (flag, value, rest) = decode_value_header(path, data, pos)?;
            let (set_len, n) = read_uvarint(rest)
                .ok_or_else(|| IndexError::corruption(path, "truncated tag value set"))?;
            // header bytes already consumed, then the length-prefixed set
            let header_len = (data.len() as u64 - pos) - rest.len() as u64;
            out.push(TagValueElem {
                value: value.to_vec(),
                deleted: flag & TAG_TOMBSTONE_FLAG != 0,
            });
            pos += header_len + n as u64 + set_len;
        }
        Ok(out)
    }
}

/// Decodes flag and key at an absolute key elem offset, returning the
/// remaining bytes after the key.
fn decode_key_header<'a>(path: &Path, data: &'a [u8], offset: u64) -> Result<(u8, &'a [u8], &'a [u8])> {
    let elem = data
        .get(offset as usize..)
        .ok_or_else(|| IndexError::corruption(path, "tag key offset out of bounds"))?;
    let flag = *elem
        .first()
        .ok_or_else(|| IndexError::corruption(path, "truncated tag key"))?;
    let (key_len, n) = read_uvarint(&elem[1..])
        .ok_or_else(|| IndexError::corruption(path, "truncated tag key"))?;
    let key = elem
        .get(1 + n..1 + n + key_len as usize)
        .ok_or_else(|| IndexError::corruption(path, "truncated tag key"))?;
    Ok((flag, key, &elem[1 + n + key_len as usize..]))
}

/// Decodes a full key element, returning it with its encoded length.
fn decode_key_info(path: &Path, data: &[u8], offset: u64) -> Result<(TagKeyInfo, u64)> {
    let (flag, key, rest) = decode_key_header(path, data, offset)?;
    if rest.len() < 2 * Section::ENCODED_LEN {
        return Err(IndexError::corruption(path, "truncated tag key sections"));
    }
    let values_data = Section::decode(rest)
        .ok_or_else(|| IndexError::corruption(path, "truncated tag key sections"))?;
    let values_index = Section::decode(&rest[Section::ENCODED_LEN..])
        .ok_or_else(|| IndexError::corruption(path, "truncated tag key sections"))?;

    let header_len = (data.len() as u64 - offset) - rest.len() as u64;
    let consumed = header_len + 2 * Section::ENCODED_LEN as u64;
    Ok((
        TagKeyInfo {
            key: key.to_vec(),
            deleted: flag & TAG_TOMBSTONE_FLAG != 0,
            values_data,
            values_index,
        },
        consumed,
    ))
}

/// Decodes flag and value at an absolute value elem offset, returning the
/// remaining bytes after the value.
fn decode_value_header<'a>(
    path: &Path,
    data: &'a [u8],
    offset: u64,
) -> Result<(u8, &'a [u8], &'a [u8])> {
    let elem = data
        .get(offset as usize..)
        .ok_or_else(|| IndexError::corruption(path, "tag value offset out of bounds"))?;
    let flag = *elem
        .first()
        .ok_or_else(|| IndexError::corruption(path, "truncated tag value"))?;
    let (value_len, n) = read_uvarint(&elem[1..])
        .ok_or_else(|| IndexError::corruption(path, "truncated tag value"))?;
    let value = elem
        .get(1 + n..1 + n + value_len as usize)
        .ok_or_else(|| IndexError::corruption(path, "truncated tag value"))?;
    Ok((flag, value, &elem[1 + n + value_len as usize..]))
}
