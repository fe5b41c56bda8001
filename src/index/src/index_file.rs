//! Index files: immutable, memory-mapped output of compaction.
//!
//! Layout:
//!
//! ```text
//! header:   magic "TIDX" + version            (5 bytes)
//! body:     tag blocks, then measurement block, then the file-level
//!           series ID set and tombstone set
//! trailer:  measurement | series set | tombstone set sections + version
//! footer:   crc32 of everything before it     (4 bytes)
//! ```
//!
//! All reads resolve through the memory map; nothing is loaded besides the
//! two file-level sets, decoded once at open.

use std::path::{Path, PathBuf};

use bytes::BufMut;

use tsidx_storage::MmapFile;

use crate::block::Section;
use crate::error::{IndexError, Result};
use crate::file_set::{File, Postings};
use crate::iterator::{
    ElemIterator, MeasurementElem, TagKeyElem, TagValueElem, VecElemIterator,
};
use crate::measurement_block::{MeasurementBlock, MeasurementBlockWriter, MeasurementInfo};
use crate::series_id_set::SeriesIdSet;
use crate::tag_block::{TagBlock, TagBlockWriter};

pub const INDEX_FILE_EXT: &str = ".tsi";
pub const INDEX_FILE_MAGIC: &[u8; 4] = b"TIDX";
pub const INDEX_FILE_VERSION: u8 = 1;
pub const INDEX_FILE_HEADER_LEN: usize = 5;
pub const INDEX_FILE_TRAILER_LEN: usize = 3 * Section::ENCODED_LEN + 2;

/// Assembles an index file image in memory. Measurements must be added in
/// name order with their complete tag sets.
pub struct IndexFileBuilder {
    buf: Vec<u8>,
    mblk: MeasurementBlockWriter,
}

impl Default for IndexFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexFileBuilder {
    pub fn new() -> IndexFileBuilder {
        let mut buf = Vec::new();
        buf.extend_from_slice(INDEX_FILE_MAGIC);
        buf.push(INDEX_FILE_VERSION);
        IndexFileBuilder {
            buf,
            mblk: MeasurementBlockWriter::default(),
        }
    }

    /// Adds one measurement: its tag block is encoded immediately, the
    /// directory entry is buffered until `finish`.
    pub fn add_measurement(
        &mut self,
        name: &[u8],
        deleted: bool,
        ids: SeriesIdSet,
        tags: &TagBlockWriter,
    ) -> Result<()> {
        let tag_section = if tags.is_empty() {
            Section::default()
        } else {
            tags.encode_into(&mut self.buf)?
        };
        self.mblk.add_measurement(name, deleted, tag_section, ids);
        Ok(())
    }

    /// Encodes the measurement block, file-level sets, trailer and
    /// checksum, returning the complete file image.
    pub fn finish(
        mut self,
        series_ids: &SeriesIdSet,
        tombstone_ids: &SeriesIdSet,
    ) -> Result<Vec<u8>> {
        let measurement_section = self.mblk.encode_into(&mut self.buf)?;

        let start = self.buf.len() as u64;
        series_ids.encode_into(&mut self.buf)?;
        let series_section = Section::new(start, self.buf.len() as u64 - start);

        let start = self.buf.len() as u64;
        tombstone_ids.encode_into(&mut self.buf)?;
        let tombstone_section = Section::new(start, self.buf.len() as u64 - start);

        measurement_section.encode_into(&mut self.buf);
        series_section.encode_into(&mut self.buf);
        tombstone_section.encode_into(&mut self.buf);
        self.buf.put_u16(INDEX_FILE_VERSION as u16);

        let crc = crc32fast::hash(&self.buf);
        self.buf.extend_from_slice(&crc.to_be_bytes());
        Ok(self.buf)
    }
}

/// An open, validated index file.
#[derive(Debug)]
pub struct IndexFile {
    id: u64,
    path: PathBuf,
    data: MmapFile,
    mblk: MeasurementBlock,
    series_ids: SeriesIdSet,
    tombstone_ids: SeriesIdSet,
}

impl IndexFile {
    /// Opens and fully validates an index file: magic, version, checksum
    /// and trailer sections. Any mismatch is corruption.
    pub async fn open(path: impl Into<PathBuf>, id: u64) -> Result<IndexFile> {
        let path = path.into();
        let data = MmapFile::open(&path).await?;
        let bytes = data.as_slice();

        if bytes.len() < INDEX_FILE_HEADER_LEN + INDEX_FILE_TRAILER_LEN + 4 {
            return Err(IndexError::corruption(&path, "index file too small"));
        }
        if &bytes[..4] != INDEX_FILE_MAGIC {
            return Err(IndexError::corruption(&path, "bad index file magic"));
        }
        if bytes[4] != INDEX_FILE_VERSION {
            return Err(IndexError::corruption(
                &path,
                format!("unsupported index file version {}", bytes[4]),
            ));
        }

        let crc_start = bytes.len() - 4;
        let stored = u32::from_be_bytes([
            bytes[crc_start],
            bytes[crc_start + 1],
            bytes[crc_start + 2],
            bytes[crc_start + 3],
        ]);
        if crc32fast::hash(&bytes[..crc_start]) != stored {
            return Err(IndexError::corruption(&path, "index file checksum mismatch"));
        }

        let trailer = &bytes[crc_start - INDEX_FILE_TRAILER_LEN..crc_start];
        let measurement_section = Section::decode(trailer)
            .ok_or_else(|| IndexError::corruption(&path, "bad index file trailer"))?;
        let series_section = Section::decode(&trailer[Section::ENCODED_LEN..])
            .ok_or_else(|| IndexError::corruption(&path, "bad index file trailer"))?;
        let tombstone_section = Section::decode(&trailer[2 * Section::ENCODED_LEN..])
            .ok_or_else(|| IndexError::corruption(&path, "bad index file trailer"))?;
        let version = u16::from_be_bytes([trailer[48], trailer[49]]);
        if version != INDEX_FILE_VERSION as u16 {
            return Err(IndexError::corruption(
                &path,
                format!("unsupported index trailer version {version}"),
            ));
        }

        let mblk = MeasurementBlock::parse(&path, bytes, measurement_section)?;

        let series_bytes = series_section
            .slice(bytes)
            .ok_or_else(|| IndexError::corruption(&path, "series set out of bounds"))?;
        let series_ids = SeriesIdSet::decode(series_bytes)
            .map_err(|_| IndexError::corruption(&path, "invalid series set"))?;

        let tombstone_bytes = tombstone_section
            .slice(bytes)
            .ok_or_else(|| IndexError::corruption(&path, "tombstone set out of bounds"))?;
        let tombstone_ids = SeriesIdSet::decode(tombstone_bytes)
            .map_err(|_| IndexError::corruption(&path, "invalid tombstone set"))?;

        Ok(IndexFile {
            id,
            path,
            data,
            mblk,
            series_ids,
            tombstone_ids,
        })
    }

    pub fn measurement(&self, name: &[u8]) -> Result<Option<MeasurementInfo>> {
        self.mblk.elem(&self.path, self.data.as_slice(), name)
    }

    /// All measurement entries, for compaction.
    pub fn measurement_elems(&self) -> Result<Vec<MeasurementElem>> {
        self.mblk.elems(&self.path, self.data.as_slice())
    }

    fn tag_block(&self, info: &MeasurementInfo) -> Result<Option<TagBlock>> {
        if info.tag_block.size == 0 {
            return Ok(None);
        }
        TagBlock::parse(&self.path, self.data.as_slice(), info.tag_block).map(Some)
    }
}

impl File for IndexFile {
    fn id(&self) -> u64 {
        self.id
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn measurement_iterator(&self) -> Result<ElemIterator<MeasurementElem>> {
        Ok(Box::new(VecElemIterator::new(self.measurement_elems()?)))
    }

    fn tag_key_iterator(&self, name: &[u8]) -> Result<Option<ElemIterator<TagKeyElem>>> {
        let info = match self.measurement(name)? {
            Some(info) => info,
            None => return Ok(None),
        };
        let elems = match self.tag_block(&info)? {
            Some(block) => block.key_elems(&self.path, self.data.as_slice())?,
            None => Vec::new(),
        };
        Ok(Some(Box::new(VecElemIterator::new(elems))))
    }

    fn tag_value_iterator(
        &self,
        name: &[u8],
        key: &[u8],
    ) -> Result<Option<ElemIterator<TagValueElem>>> {
        let info = match self.measurement(name)? {
            Some(info) => info,
            None => return Ok(None),
        };
        let block = match self.tag_block(&info)? {
            Some(block) => block,
            None => return Ok(None),
        };
        let key_info = match block.key_info(&self.path, self.data.as_slice(), key)? {
            Some(key_info) => key_info,
            None => return Ok(None),
        };
        let elems = block.value_elems(&self.path, self.data.as_slice(), &key_info)?;
        Ok(Some(Box::new(VecElemIterator::new(elems))))
    }

    fn measurement_series_ids(&self, name: &[u8]) -> Result<Option<Postings>> {
        Ok(self.measurement(name)?.map(|info| Postings {
            ids: info.series_ids,
            tombstoned: info.deleted,
        }))
    }

    fn tag_value_series_ids(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Postings>> {
        let info = match self.measurement(name)? {
            Some(info) => info,
            None => return Ok(None),
        };
        let block = match self.tag_block(&info)? {
            Some(block) => block,
            None => return Ok(None),
        };
        let key_info = match block.key_info(&self.path, self.data.as_slice(), key)? {
            Some(key_info) => key_info,
            None => return Ok(None),
        };
        let hit = block.value_series_ids(&self.path, self.data.as_slice(), &key_info, value)?;
        Ok(hit.map(|(tombstoned, ids)| Postings { ids, tombstoned }))
    }

    fn series_id_set(&self) -> Result<SeriesIdSet> {
        Ok(self.series_ids.clone())
    }

    fn tombstone_series_id_set(&self) -> Result<SeriesIdSet> {
        Ok(self.tombstone_ids.clone())
    }
}
