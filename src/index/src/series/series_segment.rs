//! Append-only series file segments.
//!
//! Segments are the durable storage of the series registry. A segment file
//! is a 32-byte header followed by entries; the active segment also keeps an
//! in-memory mirror of its bytes so readers never touch the write handle,
//! while sealed segments are served from a read-only memory map.

use std::path::{Path, PathBuf};

use regex::Regex;
use tsidx_storage::{FileWriter, MmapFile};

use crate::codec::{put_uvarint, read_uvarint};
use crate::error::{IndexError, Result};
use crate::series::series_key::read_series_key;
use crate::SeriesId;

pub const SERIES_SEGMENT_MAGIC: &[u8; 4] = b"TSEG";
pub const SERIES_SEGMENT_VERSION: u8 = 1;
pub const SERIES_SEGMENT_HEADER_SIZE: usize = 32;

pub const SERIES_ENTRY_INSERT_FLAG: u8 = 0x01;
pub const SERIES_ENTRY_TOMBSTONE_FLAG: u8 = 0x02;

lazy_static! {
    static ref SERIES_SEGMENT_NAME_RE: Regex = Regex::new("^[0-9a-f]{4}$").unwrap();
}

/// Returns the maximum size for a segment: 4 MiB for segment 0, doubling
/// per segment up to 256 MiB.
pub fn series_segment_size(id: u16) -> u64 {
    const MIN: u64 = 4 * 1024 * 1024;
    MIN << (id as u64).min(6)
}

pub fn series_segment_filename(id: u16) -> String {
    format!("{:04x}", id)
}

pub fn is_valid_series_segment_filename(name: &str) -> bool {
    SERIES_SEGMENT_NAME_RE.is_match(name)
}

pub fn parse_series_segment_filename(name: &str) -> Result<u16> {
    u16::from_str_radix(name, 16)
        .map_err(|_| IndexError::corruption(name, "invalid segment filename"))
}

/// Packs a segment ID and a byte position into one series offset.
pub fn join_series_offset(segment_id: u16, pos: u32) -> u64 {
    ((segment_id as u64) << 32) | pos as u64
}

pub fn split_series_offset(offset: u64) -> (u16, u32) {
    ((offset >> 32) as u16, offset as u32)
}

/// One durable statement about a series: its creation or its deletion.
/// Layout: flag, varint ID, key bytes for inserts, then a crc32 of the
/// preceding bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum SeriesEntry {
    Insert { id: SeriesId, key: Vec<u8> },
    Tombstone { id: SeriesId },
}

impl SeriesEntry {
    pub fn id(&self) -> SeriesId {
        match self {
            SeriesEntry::Insert { id, .. } => *id,
            SeriesEntry::Tombstone { id } => *id,
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        match self {
            SeriesEntry::Insert { id, key } => {
                buf.push(SERIES_ENTRY_INSERT_FLAG);
                put_uvarint(buf, *id);
                buf.extend_from_slice(key);
            }
            SeriesEntry::Tombstone { id } => {
                buf.push(SERIES_ENTRY_TOMBSTONE_FLAG);
                put_uvarint(buf, *id);
            }
        }
        let crc = crc32fast::hash(&buf[start..]);
        buf.extend_from_slice(&crc.to_be_bytes());
    }

    pub fn encoded_len(&self) -> usize {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf.len()
    }

    /// Decodes one entry from the front of `data`. Returns `None` on a torn
    /// or invalid entry; callers treat that as the end of the segment.
    pub fn read_from(data: &[u8]) -> Option<(SeriesEntry, usize)> {
        let flag = *data.first()?;
        let (id, n) = read_uvarint(data.get(1..)?)?;

        let body_len = match flag {
            SERIES_ENTRY_INSERT_FLAG => {
                let (key, _) = read_series_key(&data[1 + n..])?;
                1 + n + key.len()
            }
            SERIES_ENTRY_TOMBSTONE_FLAG => 1 + n,
            _ => return None,
        };

        let crc_bytes = data.get(body_len..body_len + 4)?;
        let expect = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crc32fast::hash(&data[..body_len]) != expect {
            return None;
        }

        let entry = match flag {
            SERIES_ENTRY_INSERT_FLAG => {
                let key = &data[1 + n..body_len];
                SeriesEntry::Insert {
                    id,
                    key: key.to_vec(),
                }
            }
            _ => SeriesEntry::Tombstone { id },
        };
        Some((entry, body_len + 4))
    }
}

/// Walks every valid entry in a segment image, returning the entries with
/// their positions and the length of the valid prefix. Anything past
/// `valid_len` is a torn tail.
pub fn scan_segment_entries(data: &[u8]) -> (Vec<(SeriesEntry, u32)>, usize) {
    let mut entries = Vec::new();
    let mut pos = SERIES_SEGMENT_HEADER_SIZE;

    while pos < data.len() {
        match SeriesEntry::read_from(&data[pos..]) {
            Some((entry, n)) => {
                entries.push((entry, pos as u32));
                pos += n;
            }
            None => break,
        }
    }
    (entries, pos)
}

pub fn encode_segment_header() -> [u8; SERIES_SEGMENT_HEADER_SIZE] {
    let mut header = [0u8; SERIES_SEGMENT_HEADER_SIZE];
    header[..4].copy_from_slice(SERIES_SEGMENT_MAGIC);
    header[4] = SERIES_SEGMENT_VERSION;
    header
}

pub fn validate_segment_header(data: &[u8], path: &Path) -> Result<()> {
    if data.len() < SERIES_SEGMENT_HEADER_SIZE {
        return Err(IndexError::corruption(path, "short segment header"));
    }
    if &data[..4] != SERIES_SEGMENT_MAGIC {
        return Err(IndexError::corruption(path, "bad segment magic"));
    }
    if data[4] != SERIES_SEGMENT_VERSION {
        return Err(IndexError::corruption(
            path,
            format!("unsupported segment version {}", data[4]),
        ));
    }
    Ok(())
}

enum SegmentData {
    /// The segment currently receiving writes; `buf` mirrors the file.
    Active(Vec<u8>),
    /// An immutable, memory-mapped segment.
    Sealed(MmapFile),
}

pub struct SeriesSegment {
    id: u16,
    path: PathBuf,
    data: SegmentData,
}

impl SeriesSegment {
    /// Creates a fresh active segment and its writer. The header is written
    /// and flushed before this returns.
    pub async fn create(dir: &Path, id: u16) -> Result<(SeriesSegment, FileWriter)> {
        let path = dir.join(series_segment_filename(id));
        let mut w = FileWriter::create(&path).await?;

        let header = encode_segment_header();
        w.write(&header).await?;
        w.flush().await?;

        let segment = SeriesSegment {
            id,
            path,
            data: SegmentData::Active(header.to_vec()),
        };
        Ok((segment, w))
    }

    pub fn active(id: u16, path: PathBuf, buf: Vec<u8>) -> SeriesSegment {
        SeriesSegment {
            id,
            path,
            data: SegmentData::Active(buf),
        }
    }

    pub async fn open_sealed(path: PathBuf, id: u16) -> Result<SeriesSegment> {
        let mmap = MmapFile::open(&path).await?;
        validate_segment_header(mmap.as_slice(), &path)?;
        Ok(SeriesSegment {
            id,
            path,
            data: SegmentData::Sealed(mmap),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            SegmentData::Active(buf) => buf.as_slice(),
            SegmentData::Sealed(mmap) => mmap.as_slice(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data().len() as u64
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.data, SegmentData::Sealed(_))
    }

    /// Whether `n` more bytes fit under this segment's size ceiling.
    pub fn can_write(&self, n: usize) -> bool {
        self.size() + n as u64 <= series_segment_size(self.id)
    }

    /// Mirrors bytes already written to the file into the in-memory image.
    pub fn append_buf(&mut self, bytes: &[u8]) {
        debug_assert!(!self.is_sealed());
        if let SegmentData::Active(buf) = &mut self.data {
            buf.extend_from_slice(bytes);
        }
    }

    /// Converts this active segment into its sealed, mmap-backed form.
    pub fn into_sealed(self, mmap: MmapFile) -> SeriesSegment {
        SeriesSegment {
            id: self.id,
            path: self.path,
            data: SegmentData::Sealed(mmap),
        }
    }

    /// Reads the series key of the insert entry at `pos`.
    pub fn series_key_at(&self, pos: u32) -> Result<&[u8]> {
        let data = self.data();
        if pos as usize >= data.len() {
            return Err(IndexError::corruption(&self.path, "series offset past end"));
        }
        let rest = &data[pos as usize..];

        // skip flag + varint id, then the self-delimiting key follows
        let flag = rest[0];
        if flag != SERIES_ENTRY_INSERT_FLAG {
            return Err(IndexError::corruption(&self.path, "offset is not an insert"));
        }
        let (_, n) = read_uvarint(&rest[1..])
            .ok_or_else(|| IndexError::corruption(&self.path, "truncated series entry"))?;
        let (key, _) = read_series_key(&rest[1 + n..])
            .ok_or_else(|| IndexError::corruption(&self.path, "truncated series key"))?;
        Ok(key)
    }
}
