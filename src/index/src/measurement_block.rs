//! Measurement blocks: the per-file directory of measurements, each entry
//! pointing at the measurement's tag block and carrying its series ID set.
//!
//! Layout, offsets absolute within the file:
//!
//! ```text
//! elems:    flag | name | tag block section | series ID set
//! then:     hash index over elems
//! trailer:  data section | index section | version  (34 bytes)
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use bytes::BufMut;

use crate::block::{hash_index_probe, HashIndexWriter, Section};
use crate::codec::{put_uvarint, read_uvarint};
use crate::error::{IndexError, Result};
use crate::iterator::MeasurementElem;
use crate::series_id_set::SeriesIdSet;

pub const MEASUREMENT_BLOCK_VERSION: u16 = 1;
pub const MEASUREMENT_TOMBSTONE_FLAG: u8 = 0x01;
pub const MEASUREMENT_BLOCK_TRAILER_LEN: usize = 2 * Section::ENCODED_LEN + 2;

/// Accumulates measurements and encodes the block.
#[derive(Default)]
pub struct MeasurementBlockWriter {
    measurements: BTreeMap<Vec<u8>, (bool, Section, SeriesIdSet)>,
}

impl MeasurementBlockWriter {
    pub fn add_measurement(
        &mut self,
        name: &[u8],
        deleted: bool,
        tag_block: Section,
        ids: SeriesIdSet,
    ) {
        self.measurements
            .insert(name.to_vec(), (deleted, tag_block, ids));
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<Section> {
        let block_start = buf.len() as u64;

        let data_start = buf.len() as u64;
        let mut index = HashIndexWriter::default();
        for (name, (deleted, tag_block, ids)) in &self.measurements {
            index.add(name, buf.len() as u64);
            buf.push(if *deleted { MEASUREMENT_TOMBSTONE_FLAG } else { 0 });
            put_uvarint(buf, name.len() as u64);
            buf.extend_from_slice(name);
            tag_block.encode_into(buf);

            let mut set_bytes = Vec::with_capacity(ids.serialized_size());
            ids.encode_into(&mut set_bytes)?;
            put_uvarint(buf, set_bytes.len() as u64);
            buf.extend_from_slice(&set_bytes);
        }
        let data = Section::new(data_start, buf.len() as u64 - data_start);

        let index_start = buf.len() as u64;
        index.encode_into(buf);
        let index_section = Section::new(index_start, buf.len() as u64 - index_start);

        data.encode_into(buf);
        index_section.encode_into(buf);
        buf.put_u16(MEASUREMENT_BLOCK_VERSION);

        Ok(Section::new(block_start, buf.len() as u64 - block_start))
    }
}

/// A fully decoded measurement entry.
#[derive(Clone, Debug)]
pub struct MeasurementInfo {
    pub name: Vec<u8>,
    pub deleted: bool,
    pub tag_block: Section,
    pub series_ids: SeriesIdSet,
}

/// Parsed measurement block handle; methods take the whole file's bytes.
#[derive(Clone, Copy, Debug)]
pub struct MeasurementBlock {
    data: Section,
    index: Section,
}

impl MeasurementBlock {
    pub fn parse(path: &Path, data: &[u8], section: Section) -> Result<MeasurementBlock> {
        let block = section
            .slice(data)
            .ok_or_else(|| IndexError::corruption(path, "measurement block out of bounds"))?;
        if block.len() < MEASUREMENT_BLOCK_TRAILER_LEN {
            return Err(IndexError::corruption(path, "short measurement block"));
        }

        let trailer = &block[block.len() - MEASUREMENT_BLOCK_TRAILER_LEN..];
        let data_section = Section::decode(trailer)
            .ok_or_else(|| IndexError::corruption(path, "bad measurement block trailer"))?;
        let index = Section::decode(&trailer[Section::ENCODED_LEN..])
            .ok_or_else(|| IndexError::corruption(path, "bad measurement block trailer"))?;
        let version = u16::from_be_bytes([trailer[32], trailer[33]]);
        if version != MEASUREMENT_BLOCK_VERSION {
            return Err(IndexError::corruption(
                path,
                format!("unsupported measurement block version {version}"),
            ));
        }
        Ok(MeasurementBlock {
            data: data_section,
            index,
        })
    }

    /// Point lookup of one measurement.
    pub fn elem(&self, path: &Path, data: &[u8], name: &[u8]) -> Result<Option<MeasurementInfo>> {
        let index = self
            .index
            .slice(data)
            .ok_or_else(|| IndexError::corruption(path, "measurement index out of bounds"))?;

        let offset = hash_index_probe(index, name, |offset| {
            let (_, name, _) = decode_elem_header(path, data, offset)?;
            Ok(name)
        })?;
        match offset {
            Some(offset) => Ok(Some(decode_elem(path, data, offset)?.0)),
            None => Ok(None),
        }
    }

    /// All measurements in name order, without their series ID sets.
    pub fn elems(&self, path: &Path, data: &[u8]) -> Result<Vec<MeasurementElem>> {
        if self.data.slice(data).is_none() {
            return Err(IndexError::corruption(path, "measurement data out of bounds"));
        }

        let mut out = Vec::new();
        let mut pos = self.data.offset;
        let end = self.data.offset + self.data.size;
        while pos < end {
            let (flag, name, rest) = decode_elem_header(path, data, pos)?;
            let rest = rest
                .get(Section::ENCODED_LEN..)
                .ok_or_else(|| IndexError::corruption(path, "truncated measurement elem"))?;
            let (set_len, n) = read_uvarint(rest)
                .ok_or_else(|| IndexError::corruption(path, "truncated measurement set"))?;

            out.push(MeasurementElem {
                name: name.to_vec(),
                deleted: flag & MEASUREMENT_TOMBSTONE_FLAG != 0,
            });
            let consumed_to_rest = (data.len() as u64 - pos) - rest.len() as u64;
            pos += consumed_to_rest + n as u64 + set_len;
        }
        Ok(out)
    }
}

fn decode_elem_header<'a>(
    path: &Path,
    data: &'a [u8],
    offset: u64,
) -> Result<(u8, &'a [u8], &'a [u8])> {
    let elem = data
        .get(offset as usize..)
        .ok_or_else(|| IndexError::corruption(path, "measurement offset out of bounds"))?;
    let flag = *elem
        .first()
        .ok_or_else(|| IndexError::corruption(path, "truncated measurement elem"))?;
    let (name_len, n) = read_uvarint(&elem[1..])
        .ok_or_else(|| IndexError::corruption(path, "truncated measurement elem"))?;
    let name = elem
        .get(1 + n..1 + n + name_len as usize)
        .ok_or_else(|| IndexError::corruption(path, "truncated measurement elem"))?;
    Ok((flag, name, &elem[1 + n + name_len as usize..]))
}

fn decode_elem(path: &Path, data: &[u8], offset: u64) -> Result<(MeasurementInfo, u64)> {
    let (flag, name, rest) = decode_elem_header(path, data, offset)?;
    let tag_block = Section::decode(rest)
        .ok_or_else(|| IndexError::corruption(path, "truncated measurement elem"))?;
    let rest = &rest[Section::ENCODED_LEN..];
    let (set_len, n) = read_uvarint(rest)
        .ok_or_else(|| IndexError::corruption(path, "truncated measurement set"))?;
    let set_bytes = rest
        .get(n..n + set_len as usize)
        .ok_or_else(|| IndexError::corruption(path, "truncated measurement set"))?;
    let series_ids = SeriesIdSet::decode(set_bytes)
        .map_err(|_| IndexError::corruption(path, "invalid measurement set"))?;

    let consumed = (data.len() as u64 - offset) - rest.len() as u64 + n as u64 + set_len;
    Ok((
        MeasurementInfo {
            name: name.to_vec(),
            deleted: flag & MEASUREMENT_TOMBSTONE_FLAG != 0,
            tag_block,
            series_ids,
        },
        consumed,
    ))
}
