//! Log files: the write-ahead side of a partition.
//!
//! Every mutation lands here first as a checksummed entry, then updates an
//! in-memory index keyed by measurement. Within one log file the newest
//! statement about an element wins, so a deletion followed by new writes
//! leaves the element live again. Sealed log files stop accepting writes
//! and wait for compaction into an index file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use tsidx_common::tag::{Tag, Tags};
use tsidx_storage::FileWriter;

use crate::codec::{put_uvarint, read_uvarint};
use crate::error::{IndexError, Result};
use crate::file_set::{File, Postings};
use crate::iterator::{
    ElemIterator, MeasurementElem, TagKeyElem, TagValueElem, VecElemIterator,
};
use crate::series_id_set::SeriesIdSet;
use crate::SeriesId;

pub const LOG_FILE_EXT: &str = ".tsl";

const LOG_ENTRY_ADD_SERIES: u8 = 0x01;
const LOG_ENTRY_DELETE_SERIES: u8 = 0x02;
const LOG_ENTRY_DELETE_MEASUREMENT: u8 = 0x03;
const LOG_ENTRY_DELETE_TAG_KEY: u8 = 0x04;
const LOG_ENTRY_DELETE_TAG_VALUE: u8 = 0x05;

/// One durable statement in a log file.
#[derive(Clone, Debug, PartialEq)]
pub enum LogEntry {
    AddSeries {
        id: SeriesId,
        name: Vec<u8>,
        tags: Tags,
    },
    DeleteSeries {
        id: SeriesId,
    },
    DeleteMeasurement {
        name: Vec<u8>,
    },
    DeleteTagKey {
        name: Vec<u8>,
        key: Vec<u8>,
    },
    DeleteTagValue {
        name: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_uvarint(buf, b.len() as u64);
    buf.extend_from_slice(b);
}

fn read_bytes(data: &[u8]) -> Option<(&[u8], usize)> {
    let (len, n) = read_uvarint(data)?;
    let b = data.get(n..n + len as usize)?;
    Some((b, n + len as usize))
}

impl LogEntry {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        match self {
            LogEntry::AddSeries { id, name, tags } => {
                buf.push(LOG_ENTRY_ADD_SERIES);
                put_uvarint(buf, *id);
                put_bytes(buf, name);
                put_uvarint(buf, tags.len() as u64);
                for tag in tags.iter() {
                    put_bytes(buf, &tag.key);
                    put_bytes(buf, &tag.value);
                }
            }
            LogEntry::DeleteSeries { id } => {
                buf.push(LOG_ENTRY_DELETE_SERIES);
                put_uvarint(buf, *id);
            }
            LogEntry::DeleteMeasurement { name } => {
                buf.push(LOG_ENTRY_DELETE_MEASUREMENT);
                put_bytes(buf, name);
            }
            LogEntry::DeleteTagKey { name, key } => {
                buf.push(LOG_ENTRY_DELETE_TAG_KEY);
                put_bytes(buf, name);
                put_bytes(buf, key);
            }
            LogEntry::DeleteTagValue { name, key, value } => {
                buf.push(LOG_ENTRY_DELETE_TAG_VALUE);
                put_bytes(buf, name);
                put_bytes(buf, key);
                put_bytes(buf, value);
            }
        }
        let crc = crc32fast::hash(&buf[start..]);
        buf.extend_from_slice(&crc.to_be_bytes());
    }

    /// Decodes one entry from the front of `data`. `None` means a torn or
    /// invalid entry.
    pub fn read_from(data: &[u8]) -> Option<(LogEntry, usize)> {
        let flag = *data.first()?;
        let mut pos = 1usize;

        let entry = match flag {
            LOG_ENTRY_ADD_SERIES => {
                let (id, n) = read_uvarint(data.get(pos..)?)?;
                pos += n;
                let (name, n) = read_bytes(data.get(pos..)?)?;
                pos += n;
                let (tag_count, n) = read_uvarint(data.get(pos..)?)?;
                pos += n;

                let mut tags = Tags::default();
                for _ in 0..tag_count {
                    let (key, n) = read_bytes(data.get(pos..)?)?;
                    pos += n;
                    let (value, n) = read_bytes(data.get(pos..)?)?;
                    pos += n;
                    tags.push(Tag {
                        key: key.to_vec(),
                        value: value.to_vec(),
                    });
                }
                LogEntry::AddSeries {
                    id,
                    name: name.to_vec(),
                    tags,
                }
            }
            LOG_ENTRY_DELETE_SERIES => {
                let (id, n) = read_uvarint(data.get(pos..)?)?;
                pos += n;
                LogEntry::DeleteSeries { id }
            }
            LOG_ENTRY_DELETE_MEASUREMENT => {
                let (name, n) = read_bytes(data.get(pos..)?)?;
                pos += n;
                LogEntry::DeleteMeasurement {
                    name: name.to_vec(),
                }
            }
            LOG_ENTRY_DELETE_TAG_KEY => {
                let (name, n) = read_bytes(data.get(pos..)?)?;
                pos += n;
                let (key, n) = read_bytes(data.get(pos..)?)?;
                pos += n;
                LogEntry::DeleteTagKey {
                    name: name.to_vec(),
                    key: key.to_vec(),
                }
            }
            LOG_ENTRY_DELETE_TAG_VALUE => {
                let (name, n) = read_bytes(data.get(pos..)?)?;
                pos += n;
                let (key, n) = read_bytes(data.get(pos..)?)?;
                pos += n;
                let (value, n) = read_bytes(data.get(pos..)?)?;
                pos += n;
                LogEntry::DeleteTagValue {
                    name: name.to_vec(),
                    key: key.to_vec(),
                    value: value.to_vec(),
                }
            }
            _ => return None,
        };

        let crc_bytes = data.get(pos..pos + 4)?;
        let expect = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crc32fast::hash(&data[..pos]) != expect {
            return None;
        }
        Some((entry, pos + 4))
    }
}

/// Walks valid entries, returning them and the valid prefix length.
fn scan_log_entries(data: &[u8]) -> (Vec<LogEntry>, usize) {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        match LogEntry::read_from(&data[pos..]) {
            Some((entry, n)) => {
                entries.push(entry);
                pos += n;
            }
            None => break,
        }
    }
    (entries, pos)
}

/// Rewinds the writer to the last acknowledged size after a failed append,
/// so later appends land at an entry boundary replay can reach. If the
/// rewind itself fails the writer is retired and the log stops accepting
/// writes.
async fn rewind_failed_append(w: &mut Option<FileWriter>, path: &Path, size: u64) {
    let writer = match w.as_mut() {
        Some(writer) => writer,
        None => return,
    };
    if let Err(e) = writer.truncate(size).await {
        warn!(
            path = %path.display(),
            error = %e,
            "log file rewind failed after append error, retiring writer"
        );
        *w = None;
    }
}

#[derive(Default)]
struct LogTagValue {
    deleted: bool,
    series_ids: SeriesIdSet,
}

#[derive(Default)]
struct LogTagKey {
    deleted: bool,
    tag_values: BTreeMap<Vec<u8>, LogTagValue>,
}

#[derive(Default)]
struct LogMeasurement {
    deleted: bool,
    tag_set: BTreeMap<Vec<u8>, LogTagKey>,
    series_ids: SeriesIdSet,
}

#[derive(Default)]
struct LogState {
    mms: BTreeMap<Vec<u8>, LogMeasurement>,
    series_ids: SeriesIdSet,
    tombstone_series_ids: SeriesIdSet,
}

impl LogState {
    fn apply(&mut self, entry: &LogEntry) {
        match entry {
            LogEntry::AddSeries { id, name, tags } => {
                let mm = self.mms.entry(name.clone()).or_default();
                mm.deleted = false;
                mm.series_ids.insert(*id);
                for tag in tags.iter() {
                    let tk = mm.tag_set.entry(tag.key.clone()).or_default();
                    tk.deleted = false;
                    let tv = tk.tag_values.entry(tag.value.clone()).or_default();
                    tv.deleted = false;
                    tv.series_ids.insert(*id);
                }
                self.series_ids.insert(*id);
            }
            LogEntry::DeleteSeries { id } => {
                self.series_ids.remove(*id);
                self.tombstone_series_ids.insert(*id);
            }
            LogEntry::DeleteMeasurement { name } => {
                let mm = self.mms.entry(name.clone()).or_default();
                mm.deleted = true;
                mm.tag_set.clear();
                mm.series_ids = SeriesIdSet::default();
            }
            LogEntry::DeleteTagKey { name, key } => {
                let mm = self.mms.entry(name.clone()).or_default();
                let tk = mm.tag_set.entry(key.clone()).or_default();
                tk.deleted = true;
                tk.tag_values.clear();
            }
            LogEntry::DeleteTagValue { name, key, value } => {
                let mm = self.mms.entry(name.clone()).or_default();
                let tk = mm.tag_set.entry(key.clone()).or_default();
                let tv = tk.tag_values.entry(value.clone()).or_default();
                tv.deleted = true;
                tv.series_ids = SeriesIdSet::default();
            }
        }
    }
}

pub struct LogFile {
    id: u64,
    path: PathBuf,
    size: AtomicU64,
    w: Mutex<Option<FileWriter>>,
    state: RwLock<LogState>,
}

impl LogFile {
    /// Creates an empty log file. Fails if the path exists.
    pub async fn create(path: impl Into<PathBuf>, id: u64) -> Result<LogFile> {
        let path = path.into();
        let w = FileWriter::create(&path).await?;
        Ok(LogFile {
            id,
            path,
            size: AtomicU64::new(0),
            w: Mutex::new(Some(w)),
            state: RwLock::new(LogState::default()),
        })
    }

    /// Opens an existing log file and replays it. A torn tail is truncated
    /// with a warning, anything before it is kept.
    pub async fn open(path: impl Into<PathBuf>, id: u64) -> Result<LogFile> {
        let path = path.into();
        let data = fs::read(&path).await?;
        let (entries, valid_len) = scan_log_entries(&data);

        let mut w = FileWriter::append(&path).await?;
        if valid_len < data.len() {
            warn!(
                path = %path.display(),
                dropped = data.len() - valid_len,
                "truncating torn tail of log file"
            );
            w.truncate(valid_len as u64).await?;
        }

        let mut state = LogState::default();
        for entry in &entries {
            state.apply(entry);
        }

        Ok(LogFile {
            id,
            path,
            size: AtomicU64::new(valid_len as u64),
            w: Mutex::new(Some(w)),
            state: RwLock::new(state),
        })
    }

    /// Appends a batch of entries, flushed to the OS before they become
    /// visible to readers. A failed batch is rewound so the file never
    /// holds torn bytes between acknowledged entries.
    pub async fn append(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut guard = self.w.lock().await;
        let w = guard
            .as_mut()
            .ok_or_else(|| IndexError::conflict("log file is sealed"))?;

        let mut buf = Vec::new();
        for entry in entries {
            entry.encode_into(&mut buf);
        }

        let prev = self.size.load(Ordering::Relaxed);
        let mut res = w.write(&buf).await;
        if res.is_ok() {
            res = w.flush().await;
        }
        if let Err(e) = res {
            rewind_failed_append(&mut guard, &self.path, prev).await;
            return Err(e.into());
        }

        let mut state = self.state.write()?;
        for entry in entries {
            state.apply(entry);
        }
        self.size.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Syncs and permanently stops writes. Idempotent.
    pub async fn seal(&self) -> Result<()> {
        let mut guard = self.w.lock().await;
        if let Some(w) = guard.as_mut() {
            w.sync().await?;
        }
        *guard = None;
        Ok(())
    }

    /// Measurement names currently live in this file.
    pub fn measurement_names(&self) -> Result<Vec<Vec<u8>>> {
        let state = self.state.read()?;
        Ok(state
            .mms
            .iter()
            .filter(|(_, mm)| !mm.deleted)
            .map(|(name, _)| name.clone())
            .collect())
    }
}

impl File for LogFile {
    fn id(&self) -> u64 {
        self.id
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    fn measurement_iterator(&self) -> Result<ElemIterator<MeasurementElem>> {
        let state = self.state.read()?;
        let elems: Vec<MeasurementElem> = state
            .mms
            .iter()
            .map(|(name, mm)| MeasurementElem {
                name: name.clone(),
                deleted: mm.deleted,
            })
            .collect();
        Ok(Box::new(VecElemIterator::new(elems)))
    }

    fn tag_key_iterator(&self, name: &[u8]) -> Result<Option<ElemIterator<TagKeyElem>>> {
        let state = self.state.read()?;
        let mm = match state.mms.get(name) {
            Some(mm) => mm,
            None => return Ok(None),
        };
        let elems: Vec<TagKeyElem> = mm
            .tag_set
            .iter()
            .map(|(key, tk)| TagKeyElem {
                key: key.clone(),
                deleted: tk.deleted,
            })
            .collect();
        Ok(Some(Box::new(VecElemIterator::new(elems))))
    }

    fn tag_value_iterator(
        &self,
        name: &[u8],
        key: &[u8],
    ) -> Result<Option<ElemIterator<TagValueElem>>> {
        let state = self.state.read()?;
        let tk = match state.mms.get(name).and_then(|mm| mm.tag_set.get(key)) {
            Some(tk) => tk,
            None => return Ok(None),
        };
        let elems: Vec<TagValueElem> = tk
            .tag_values
            .iter()
            .map(|(value, tv)| TagValueElem {
                value: value.clone(),
                deleted: tv.deleted,
            })
            .collect();
        Ok(Some(Box::new(VecElemIterator::new(elems))))
    }

    fn measurement_series_ids(&self, name: &[u8]) -> Result<Option<Postings>> {
        let state = self.state.read()?;
        Ok(state.mms.get(name).map(|mm| Postings {
            ids: mm.series_ids.clone(),
            tombstoned: mm.deleted,
        }))
    }

    fn tag_value_series_ids(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Postings>> {
        let state = self.state.read()?;
        let tv = state
            .mms
            .get(name)
            .and_then(|mm| mm.tag_set.get(key))
            .and_then(|tk| tk.tag_values.get(value));
        Ok(tv.map(|tv| Postings {
            ids: tv.series_ids.clone(),
            tombstoned: tv.deleted,
        }))
    }

    fn series_id_set(&self) -> Result<SeriesIdSet> {
        Ok(self.state.read()?.series_ids.clone())
    }

    fn tombstone_series_id_set(&self) -> Result<SeriesIdSet> {
        Ok(self.state.read()?.tombstone_series_ids.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::collect_elems;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    fn add(id: SeriesId, name: &str, pairs: &[(&str, &str)]) -> LogEntry {
        LogEntry::AddSeries {
            id,
            name: name.as_bytes().to_vec(),
            tags: tags(pairs),
        }
    }

    #[test]
    fn test_entry_round_trip() {
        let entries = vec![
            add(1, "cpu", &[("region", "east"), ("host", "a")]),
            LogEntry::DeleteSeries { id: 1 },
            LogEntry::DeleteMeasurement {
                name: b"cpu".to_vec(),
            },
            LogEntry::DeleteTagKey {
                name: b"cpu".to_vec(),
                key: b"region".to_vec(),
            },
            LogEntry::DeleteTagValue {
                name: b"cpu".to_vec(),
                key: b"region".to_vec(),
                value: b"east".to_vec(),
            },
        ];

        let mut buf = Vec::new();
        for entry in &entries {
            entry.encode_into(&mut buf);
        }

        let (decoded, valid_len) = scan_log_entries(&buf);
        assert_eq!(decoded, entries);
        assert_eq!(valid_len, buf.len());
    }

    #[test]
    fn test_entry_rejects_bad_crc() {
        let mut buf = Vec::new();
        add(1, "cpu", &[]).encode_into(&mut buf);
        let end = buf.len() - 1;
        buf[end] ^= 0x01;
        assert!(LogEntry::read_from(&buf).is_none());
    }

    #[tokio::test]
    async fn test_append_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::create(dir.path().join("00000001.tsl"), 1)
            .await
            .unwrap();

        log.append(&[
            add(1, "cpu", &[("region", "east")]),
            add(2, "cpu", &[("region", "west")]),
            add(3, "mem", &[]),
        ])
        .await
        .unwrap();

        let names: Vec<_> = collect_elems(log.measurement_iterator().unwrap())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![b"cpu".to_vec(), b"mem".to_vec()]);

        let postings = log.measurement_series_ids(b"cpu").unwrap().unwrap();
        assert!(!postings.tombstoned);
        assert_eq!(postings.ids.iter().collect::<Vec<_>>(), vec![1, 2]);

        let postings = log
            .tag_value_series_ids(b"cpu", b"region", b"east")
            .unwrap()
            .unwrap();
        assert_eq!(postings.ids.iter().collect::<Vec<_>>(), vec![1]);

        assert!(log.measurement_series_ids(b"disk").unwrap().is_none());
        assert_eq!(log.series_id_set().unwrap().len(), 3);
        assert!(log.size() > 0);
    }

    #[tokio::test]
    async fn test_delete_series_moves_id_to_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::create(dir.path().join("00000001.tsl"), 1)
            .await
            .unwrap();

        log.append(&[add(1, "cpu", &[("region", "east")])])
            .await
            .unwrap();
        log.append(&[LogEntry::DeleteSeries { id: 1 }]).await.unwrap();

        assert!(!log.series_id_set().unwrap().contains(1));
        assert!(log.tombstone_series_id_set().unwrap().contains(1));

        // the measurement-level set keeps the raw id; readers subtract
        // tombstones at the file set layer
        let postings = log.measurement_series_ids(b"cpu").unwrap().unwrap();
        assert!(postings.ids.contains(1));
    }

    #[tokio::test]
    async fn test_delete_measurement_masks_until_new_write() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::create(dir.path().join("00000001.tsl"), 1)
            .await
            .unwrap();

        log.append(&[add(1, "cpu", &[("region", "east")])])
            .await
            .unwrap();
        log.append(&[LogEntry::DeleteMeasurement {
            name: b"cpu".to_vec(),
        }])
        .await
        .unwrap();

        let postings = log.measurement_series_ids(b"cpu").unwrap().unwrap();
        assert!(postings.tombstoned);
        assert!(postings.ids.is_empty());

        // a later write revives the measurement with only the new series
        log.append(&[add(9, "cpu", &[("region", "north")])])
            .await
            .unwrap();
        let postings = log.measurement_series_ids(b"cpu").unwrap().unwrap();
        assert!(!postings.tombstoned);
        assert_eq!(postings.ids.iter().collect::<Vec<_>>(), vec![9]);
    }

    #[tokio::test]
    async fn test_reopen_replays_and_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000001.tsl");

        {
            let log = LogFile::create(&path, 1).await.unwrap();
            log.append(&[add(1, "cpu", &[("region", "east")]), add(2, "mem", &[])])
                .await
                .unwrap();
            log.seal().await.unwrap();
        }

        // simulate a torn write
        let mut data = std::fs::read(&path).unwrap();
        let mut torn = Vec::new();
        add(3, "disk", &[]).encode_into(&mut torn);
        data.extend_from_slice(&torn[..torn.len() - 2]);
        std::fs::write(&path, &data).unwrap();

        let log = LogFile::open(&path, 1).await.unwrap();
        assert_eq!(log.series_id_set().unwrap().len(), 2);
        assert!(log.measurement_series_ids(b"disk").unwrap().is_none());

        // appending after recovery produces a clean file
        log.append(&[add(3, "disk", &[])]).await.unwrap();
        drop(log);
        let log = LogFile::open(&path, 1).await.unwrap();
        assert_eq!(log.series_id_set().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rewind_failed_append_keeps_later_entries_replayable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000001.tsl");

        let mut buf = Vec::new();
        add(1, "cpu", &[("region", "east")]).encode_into(&mut buf);
        let good_len = buf.len() as u64;

        // a batch that errors midway leaves part of its bytes in the file
        let mut torn = Vec::new();
        add(9, "disk", &[]).encode_into(&mut torn);
        torn.truncate(torn.len() - 2);

        let mut w = FileWriter::create(&path).await.unwrap();
        w.write(&buf).await.unwrap();
        w.write(&torn).await.unwrap();
        w.flush().await.unwrap();

        let mut writer = Some(w);
        rewind_failed_append(&mut writer, &path, good_len).await;
        assert!(writer.is_some());

        // the next batch lands where the acknowledged entries end
        let mut next = Vec::new();
        add(2, "mem", &[]).encode_into(&mut next);
        let w = writer.as_mut().unwrap();
        w.write(&next).await.unwrap();
        w.sync().await.unwrap();
        drop(writer);

        // reopen replays both acknowledged entries with nothing truncated
        let log = LogFile::open(&path, 1).await.unwrap();
        assert_eq!(log.size(), good_len + next.len() as u64);
        let ids: Vec<_> = log.series_id_set().unwrap().iter().collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_sealed_log_rejects_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::create(dir.path().join("00000001.tsl"), 1)
            .await
            .unwrap();
        log.seal().await.unwrap();

        let err = log.append(&[add(1, "cpu", &[])]).await.unwrap_err();
        assert!(matches!(err, IndexError::Conflict(_)));
    }
}
