//! The series file: a durable, database-wide registry mapping canonical
//! series keys to unique u64 IDs.
//!
//! IDs are issued once and never reused; re-creating a deleted key issues a
//! fresh ID. Storage is a chain of append-only segments where only the
//! newest accepts writes. Readers resolve everything from an in-memory
//! index rebuilt at open, so lookups never block behind the writer.

pub mod series_index;
pub mod series_key;
pub mod series_segment;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use tsidx_storage::{install_file, FileWriter, MmapFile, TMP_FILE_SUFFIX};

use crate::error::{IndexError, Result};
use crate::series_id_set::SeriesIdSet;
use crate::SeriesId;

use series_index::SeriesIndex;
use series_key::compare_series_keys;
use series_segment::{
    encode_segment_header, is_valid_series_segment_filename, join_series_offset,
    parse_series_segment_filename, scan_segment_entries, series_segment_filename,
    series_segment_size, split_series_offset, validate_segment_header, SeriesEntry,
    SeriesSegment,
};

struct State {
    active: SeriesSegment,
    /// Immutable segments in ascending ID order.
    sealed: Vec<Arc<SeriesSegment>>,
    index: SeriesIndex,
}

struct ActiveWriter {
    segment_id: u16,
    /// Last issued series ID; the writer lock serializes allocation.
    seq: SeriesId,
    w: FileWriter,
}

pub struct SeriesFile {
    dir: PathBuf,
    state: RwLock<State>,
    writer: Mutex<ActiveWriter>,
}

impl SeriesFile {
    /// Opens the series file under `dir`, replaying every segment to rebuild
    /// the in-memory index. A torn tail on the newest segment is truncated;
    /// torn data anywhere else is corruption.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<SeriesFile> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut ids = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(dirent) = read_dir.next_entry().await? {
            let name = dirent.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if name.ends_with(TMP_FILE_SUFFIX) {
                warn!(file = name, "removing leftover temporary series segment");
                fs::remove_file(dirent.path()).await?;
                continue;
            }
            if is_valid_series_segment_filename(name) {
                ids.push(parse_series_segment_filename(name)?);
            }
        }
        ids.sort_unstable();

        if ids.is_empty() {
            let (active, w) = SeriesSegment::create(&dir, 0).await?;
            return Ok(SeriesFile {
                dir,
                state: RwLock::new(State {
                    active,
                    sealed: Vec::new(),
                    index: SeriesIndex::default(),
                }),
                writer: Mutex::new(ActiveWriter {
                    segment_id: 0,
                    seq: 0,
                    w,
                }),
            });
        }

        let mut index = SeriesIndex::default();
        let mut sealed = Vec::new();
        let last = ids.len() - 1;
        let mut opened = None;

        for (i, id) in ids.iter().enumerate() {
            let path = dir.join(series_segment_filename(*id));

            if i < last {
                let segment = SeriesSegment::open_sealed(path.clone(), *id).await?;
                let (entries, valid_len) = scan_segment_entries(segment.data());
                if valid_len < segment.data().len() {
                    return Err(IndexError::corruption(
                        &path,
                        "invalid entry inside sealed series segment",
                    ));
                }
                replay_entries(&mut index, *id, &entries);
                sealed.push(Arc::new(segment));
            } else {
                let mut buf = fs::read(&path).await?;
                validate_segment_header(&buf, &path)?;
                let (entries, valid_len) = scan_segment_entries(&buf);

                let mut w = FileWriter::append(&path).await?;
                if valid_len < buf.len() {
                    warn!(
                        path = %path.display(),
                        dropped = buf.len() - valid_len,
                        "truncating torn tail of series segment"
                    );
                    w.truncate(valid_len as u64).await?;
                    buf.truncate(valid_len);
                }
                replay_entries(&mut index, *id, &entries);
                opened = Some((SeriesSegment::active(*id, path, buf), *id, w));
            }
        }

        // ids is non-empty so the last iteration always populates this
        let (active, segment_id, w) = match opened {
            Some(v) => v,
            None => return Err(IndexError::corruption(&dir, "no active series segment")),
        };

        let seq = index.max_id();
        info!(
            path = %dir.display(),
            segments = ids.len(),
            series = index.series_count(),
            "opened series file"
        );

        Ok(SeriesFile {
            dir,
            state: RwLock::new(State {
                active,
                sealed,
                index,
            }),
            writer: Mutex::new(ActiveWriter { segment_id, seq, w }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Looks up or creates one series per key, returning `(id, created)`
    /// pairs positionally. New entries are written through to the active
    /// segment before this returns.
    pub async fn create_series_list_if_not_exists(
        &self,
        keys: &[Vec<u8>],
    ) -> Result<Vec<(SeriesId, bool)>> {
        let mut writer = self.writer.lock().await;
        let mut out = Vec::with_capacity(keys.len());
        let mut wrote = false;

        for key in keys {
            let existing = self.state.read()?.index.series_id(key);
            if let Some(id) = existing {
                out.push((id, false));
                continue;
            }

            writer.seq += 1;
            let id = writer.seq;
            let entry = SeriesEntry::Insert {
                id,
                key: key.clone(),
            };
            let mut buf = Vec::new();
            entry.encode_into(&mut buf);

            self.append_entry(&mut writer, &buf).await?;
            wrote = true;

            let mut state = self.state.write()?;
            let pos = state.active.size() as u32;
            state.active.append_buf(&buf);
            state
                .index
                .insert(key, id, join_series_offset(writer.segment_id, pos));
            out.push((id, true));
        }

        if wrote {
            writer.w.flush().await?;
        }
        Ok(out)
    }

    /// Tombstones a series ID. Returns `NotFound` for IDs never issued (or
    /// already compacted away); deleting a tombstoned ID is a no-op.
    pub async fn delete_series_id(&self, id: SeriesId) -> Result<()> {
        let mut writer = self.writer.lock().await;

        {
            let state = self.state.read()?;
            if !state.index.contains_id(id) {
                return Err(IndexError::NotFound);
            }
            if state.index.is_deleted(id) {
                return Ok(());
            }
        }

        let mut buf = Vec::new();
        SeriesEntry::Tombstone { id }.encode_into(&mut buf);
        self.append_entry(&mut writer, &buf).await?;
        writer.w.flush().await?;

        let mut state = self.state.write()?;
        state.active.append_buf(&buf);
        state.index.delete(id);
        Ok(())
    }

    /// Writes one encoded entry, rolling to a new segment when the active
    /// one is full. The caller updates the in-memory mirror afterwards.
    async fn append_entry(&self, writer: &mut ActiveWriter, buf: &[u8]) -> Result<()> {
        let fits = self.state.read()?.active.can_write(buf.len());
        if !fits {
            self.roll_segment(writer).await?;
        }
        writer.w.write(buf).await?;
        Ok(())
    }

    async fn roll_segment(&self, writer: &mut ActiveWriter) -> Result<()> {
        if writer.segment_id == u16::MAX {
            return Err(IndexError::conflict("series file is out of segment IDs"));
        }
        writer.w.sync().await?;

        let path = {
            let state = self.state.read()?;
            state.active.path().to_path_buf()
        };
        let mmap = MmapFile::open(&path).await?;

        let next_id = writer.segment_id + 1;
        let (new_active, new_w) = SeriesSegment::create(&self.dir, next_id).await?;
        info!(segment = next_id, "rolled to new series segment");

        {
            let mut state = self.state.write()?;
            let old = std::mem::replace(&mut state.active, new_active);
            state.sealed.push(Arc::new(old.into_sealed(mmap)));
        }
        writer.segment_id = next_id;
        writer.w = new_w;
        Ok(())
    }

    /// Returns the live ID for a canonical series key.
    pub fn series_id(&self, key: &[u8]) -> Result<Option<SeriesId>> {
        Ok(self.state.read()?.index.series_id(key))
    }

    /// Returns the canonical key for an ID. Tombstoned IDs still resolve
    /// until compaction drops their insert entries.
    pub fn series_key(&self, id: SeriesId) -> Result<Vec<u8>> {
        let state = self.state.read()?;
        let offset = state.index.offset(id).ok_or(IndexError::NotFound)?;
        Self::key_at(&state, offset)
    }

    /// Resolves many IDs at once; unknown IDs yield `None` positionally.
    pub fn series_keys(&self, ids: &[SeriesId]) -> Result<Vec<Option<Vec<u8>>>> {
        let state = self.state.read()?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match state.index.offset(*id) {
                Some(offset) => out.push(Some(Self::key_at(&state, offset)?)),
                None => out.push(None),
            }
        }
        Ok(out)
    }

    fn key_at(state: &State, offset: u64) -> Result<Vec<u8>> {
        let (segment_id, pos) = split_series_offset(offset);
        if segment_id == state.active.id() {
            return Ok(state.active.series_key_at(pos)?.to_vec());
        }
        let segment = state
            .sealed
            .iter()
            .find(|s| s.id() == segment_id)
            .ok_or(IndexError::NotFound)?;
        Ok(segment.series_key_at(pos)?.to_vec())
    }

    pub fn is_deleted(&self, id: SeriesId) -> Result<bool> {
        Ok(self.state.read()?.index.is_deleted(id))
    }

    /// Snapshot of every tombstoned ID.
    pub fn tombstone_series_id_set(&self) -> Result<SeriesIdSet> {
        Ok(self.state.read()?.index.tombstones().clone())
    }

    pub fn series_count(&self) -> Result<u64> {
        Ok(self.state.read()?.index.series_count())
    }

    /// All live series IDs ordered by their keys.
    pub fn series_ids(&self) -> Result<Vec<SeriesId>> {
        let mut pairs: Vec<(Vec<u8>, SeriesId)> = {
            let state = self.state.read()?;
            state
                .index
                .iter_live()
                .map(|(key, id)| (key.to_vec(), id))
                .collect()
        };
        pairs.sort_by(|a, b| compare_series_keys(&a.0, &b.0));
        Ok(pairs.into_iter().map(|(_, id)| id).collect())
    }

    /// Whether enough tombstones have accumulated in sealed segments to be
    /// worth rewriting them.
    pub fn needs_compaction(&self, tombstone_threshold: u64) -> Result<bool> {
        let state = self.state.read()?;
        Ok(!state.sealed.is_empty() && state.index.tombstones().len() >= tombstone_threshold)
    }

    /// Rewrites sealed segments without entries for dead series. Inserts of
    /// tombstoned IDs are dropped together with their tombstones; a
    /// tombstone whose insert still lives in the active segment is kept so
    /// a replay cannot resurrect the series.
    pub async fn compact(&self) -> Result<()> {
        let _writer = self.writer.lock().await;

        let (sealed, tombstones) = {
            let state = self.state.read()?;
            (state.sealed.clone(), state.index.tombstones().clone())
        };
        if sealed.is_empty() {
            return Ok(());
        }

        let mut outputs: Vec<(u16, Vec<u8>)> = Vec::new();
        let mut cur_id = sealed[0].id();
        let mut cur = encode_segment_header().to_vec();
        let mut new_offsets: Vec<(SeriesId, u64)> = Vec::new();
        let mut purged: Vec<(SeriesId, Vec<u8>)> = Vec::new();
        let mut seen_inserts = SeriesIdSet::default();

        for segment in &sealed {
            let (entries, _) = scan_segment_entries(segment.data());
            for (entry, _) in entries {
                let keep = match &entry {
                    SeriesEntry::Insert { id, key } => {
                        seen_inserts.insert(*id);
                        if tombstones.contains(*id) {
                            purged.push((*id, key.clone()));
                            false
                        } else {
                            true
                        }
                    }
                    // The insert is either in an earlier input (both die) or
                    // still in the active segment (tombstone must survive).
                    SeriesEntry::Tombstone { id } => !seen_inserts.contains(*id),
                };
                if !keep {
                    continue;
                }

                let mut ebuf = Vec::new();
                entry.encode_into(&mut ebuf);
                if cur.len() + ebuf.len() > series_segment_size(cur_id) as usize {
                    outputs.push((cur_id, std::mem::replace(&mut cur, encode_segment_header().to_vec())));
                    cur_id += 1;
                }
                if let SeriesEntry::Insert { id, .. } = &entry {
                    new_offsets.push((*id, join_series_offset(cur_id, cur.len() as u32)));
                }
                cur.extend_from_slice(&ebuf);
            }
        }
        outputs.push((cur_id, cur));

        for (id, buf) in &outputs {
            let dst = self.dir.join(series_segment_filename(*id));
            let tmp = self
                .dir
                .join(format!("{}{}", series_segment_filename(*id), TMP_FILE_SUFFIX));
            // a failed earlier pass may have left the temp file behind
            let _ = fs::remove_file(&tmp).await;
            let mut w = FileWriter::create(&tmp).await?;
            w.write(buf).await?;
            w.sync().await?;
            install_file(&tmp, &dst).await?;
        }

        // inputs not overwritten by an output are dead files now
        for segment in &sealed {
            if !outputs.iter().any(|(id, _)| *id == segment.id()) {
                fs::remove_file(segment.path()).await?;
            }
        }

        let mut new_sealed = Vec::with_capacity(outputs.len());
        for (id, _) in &outputs {
            let path = self.dir.join(series_segment_filename(*id));
            new_sealed.push(Arc::new(SeriesSegment::open_sealed(path, *id).await?));
        }

        let dropped = purged.len();
        {
            let mut state = self.state.write()?;
            state.sealed = new_sealed;
            for (id, offset) in new_offsets {
                state.index.set_offset(id, offset);
            }
            for (id, key) in purged {
                state.index.purge(id, &key);
            }
        }
        info!(dropped, "compacted series file segments");
        Ok(())
    }
}

fn replay_entries(index: &mut SeriesIndex, segment_id: u16, entries: &[(SeriesEntry, u32)]) {
    for (entry, pos) in entries {
        match entry {
            SeriesEntry::Insert { id, key } => {
                index.insert(key, *id, join_series_offset(segment_id, *pos));
            }
            SeriesEntry::Tombstone { id } => index.delete(*id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::series_key::encode_series_key;
    use tsidx_common::tag::Tags;

    fn key(name: &str, pairs: &[(&str, &str)]) -> Vec<u8> {
        let tags: Tags = pairs
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect();
        encode_series_key(name.as_bytes(), &tags)
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_ids() {
        let dir = tempfile::tempdir().unwrap();
        let sfile = SeriesFile::open(dir.path()).await.unwrap();

        let keys = vec![
            key("cpu", &[("region", "east")]),
            key("cpu", &[("region", "west")]),
            key("mem", &[("region", "east")]),
        ];
        let ids = sfile.create_series_list_if_not_exists(&keys).await.unwrap();
        assert_eq!(ids, vec![(1, true), (2, true), (3, true)]);

        // same keys come back with the same ids
        let again = sfile.create_series_list_if_not_exists(&keys).await.unwrap();
        assert_eq!(again, vec![(1, false), (2, false), (3, false)]);

        assert_eq!(sfile.series_id(&keys[1]).unwrap(), Some(2));
        assert_eq!(sfile.series_key(2).unwrap(), keys[1]);
        assert_eq!(sfile.series_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reopen_recovers_index() {
        let dir = tempfile::tempdir().unwrap();
        let keys = vec![key("cpu", &[("region", "east")]), key("mem", &[])];

        {
            let sfile = SeriesFile::open(dir.path()).await.unwrap();
            sfile.create_series_list_if_not_exists(&keys).await.unwrap();
            sfile.delete_series_id(2).await.unwrap();
        }

        let sfile = SeriesFile::open(dir.path()).await.unwrap();
        assert_eq!(sfile.series_id(&keys[0]).unwrap(), Some(1));
        assert_eq!(sfile.series_id(&keys[1]).unwrap(), None);
        assert!(sfile.is_deleted(2).unwrap());
        assert_eq!(sfile.series_count().unwrap(), 1);

        // new series get fresh ids, never a reused one
        let ids = sfile
            .create_series_list_if_not_exists(&[key("disk", &[])])
            .await
            .unwrap();
        assert_eq!(ids, vec![(3, true)]);
    }

    #[tokio::test]
    async fn test_recreated_series_gets_fresh_id() {
        let dir = tempfile::tempdir().unwrap();
        let sfile = SeriesFile::open(dir.path()).await.unwrap();
        let k = key("cpu", &[("region", "east")]);

        let ids = sfile
            .create_series_list_if_not_exists(std::slice::from_ref(&k))
            .await
            .unwrap();
        assert_eq!(ids, vec![(1, true)]);

        sfile.delete_series_id(1).await.unwrap();
        assert_eq!(sfile.series_id(&k).unwrap(), None);

        let ids = sfile
            .create_series_list_if_not_exists(std::slice::from_ref(&k))
            .await
            .unwrap();
        assert_eq!(ids, vec![(2, true)]);
        assert!(sfile.is_deleted(1).unwrap());
        assert!(!sfile.is_deleted(2).unwrap());
    }

    #[tokio::test]
    async fn test_delete_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let sfile = SeriesFile::open(dir.path()).await.unwrap();
        let err = sfile.delete_series_id(99).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let keys = vec![key("cpu", &[("region", "east")])];

        {
            let sfile = SeriesFile::open(dir.path()).await.unwrap();
            sfile.create_series_list_if_not_exists(&keys).await.unwrap();
        }

        // simulate a crash mid-append
        let path = dir.path().join(series_segment_filename(0));
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&[0x01, 0x07, 0xde, 0xad]);
        std::fs::write(&path, &data).unwrap();

        let sfile = SeriesFile::open(dir.path()).await.unwrap();
        assert_eq!(sfile.series_id(&keys[0]).unwrap(), Some(1));

        // the segment keeps working after truncation
        let ids = sfile
            .create_series_list_if_not_exists(&[key("mem", &[])])
            .await
            .unwrap();
        assert_eq!(ids, vec![(2, true)]);

        drop(sfile);
        let sfile = SeriesFile::open(dir.path()).await.unwrap();
        assert_eq!(sfile.series_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_series_ids_ordered_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let sfile = SeriesFile::open(dir.path()).await.unwrap();

        // insertion order differs from key order
        let keys = vec![
            key("mem", &[("region", "east")]),
            key("cpu", &[("region", "west")]),
            key("cpu", &[("region", "east")]),
        ];
        sfile.create_series_list_if_not_exists(&keys).await.unwrap();

        // cpu,east < cpu,west < mem,east
        assert_eq!(sfile.series_ids().unwrap(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_compact_drops_dead_series_from_sealed_segments() {
        let dir = tempfile::tempdir().unwrap();
        let k_dead = key("cpu", &[("region", "east")]);
        let k_live = key("mem", &[]);

        // build a sealed segment by hand: segment 0000 full of entries,
        // then an empty 0001 that open() treats as the active one
        {
            let (mut segment, mut w) = SeriesSegment::create(dir.path(), 0).await.unwrap();
            let mut buf = Vec::new();
            SeriesEntry::Insert { id: 1, key: k_dead.clone() }.encode_into(&mut buf);
            SeriesEntry::Insert { id: 2, key: k_live.clone() }.encode_into(&mut buf);
            SeriesEntry::Tombstone { id: 1 }.encode_into(&mut buf);
            w.write(&buf).await.unwrap();
            w.sync().await.unwrap();
            segment.append_buf(&buf);
            SeriesSegment::create(dir.path(), 1).await.unwrap();
        }

        let sfile = SeriesFile::open(dir.path()).await.unwrap();
        assert!(sfile.is_deleted(1).unwrap());
        assert!(sfile.needs_compaction(1).unwrap());

        sfile.compact().await.unwrap();

        // id 1 is gone entirely; id 2 still resolves through new offsets
        assert!(sfile.series_key(1).unwrap_err().is_not_found());
        assert!(!sfile.is_deleted(1).unwrap());
        assert_eq!(sfile.series_key(2).unwrap(), k_live);
        assert_eq!(sfile.series_id(&k_live).unwrap(), Some(2));
        assert_eq!(sfile.tombstone_series_id_set().unwrap().len(), 0);

        // survives a reopen
        drop(sfile);
        let sfile = SeriesFile::open(dir.path()).await.unwrap();
        assert_eq!(sfile.series_id(&k_live).unwrap(), Some(2));
        assert_eq!(sfile.series_id(&k_dead).unwrap(), None);
        assert_eq!(sfile.series_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compact_keeps_tombstone_for_active_segment_insert() {
        let dir = tempfile::tempdir().unwrap();

        // sealed segment holds only an unrelated series; the tombstoned
        // series lives in the active segment
        {
            let (mut segment, mut w) = SeriesSegment::create(dir.path(), 0).await.unwrap();
            let mut buf = Vec::new();
            SeriesEntry::Insert { id: 1, key: key("mem", &[]) }.encode_into(&mut buf);
            w.write(&buf).await.unwrap();
            w.sync().await.unwrap();
            segment.append_buf(&buf);

            let (mut active, mut aw) = SeriesSegment::create(dir.path(), 1).await.unwrap();
            let mut buf = Vec::new();
            SeriesEntry::Insert { id: 2, key: key("cpu", &[]) }.encode_into(&mut buf);
            SeriesEntry::Tombstone { id: 2 }.encode_into(&mut buf);
            aw.write(&buf).await.unwrap();
            aw.sync().await.unwrap();
            active.append_buf(&buf);
        }

        // rewrite the sealed segment by forging a tombstone into it so the
        // keep rule is exercised: a tombstone whose insert is in the active
        // segment must survive compaction
        {
            let path = dir.path().join(series_segment_filename(0));
            let mut data = std::fs::read(&path).unwrap();
            let mut buf = Vec::new();
            SeriesEntry::Tombstone { id: 2 }.encode_into(&mut buf);
            data.extend_from_slice(&buf);
            std::fs::write(&path, &data).unwrap();
        }

        let sfile = SeriesFile::open(dir.path()).await.unwrap();
        assert!(sfile.is_deleted(2).unwrap());

        sfile.compact().await.unwrap();
        assert!(sfile.is_deleted(2).unwrap());

        // a replay from disk still sees the series as deleted
        drop(sfile);
        let sfile = SeriesFile::open(dir.path()).await.unwrap();
        assert!(sfile.is_deleted(2).unwrap());
        assert_eq!(sfile.series_count().unwrap(), 1);
    }
}
