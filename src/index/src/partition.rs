//! A partition: one shard of the index, owning an active log file, sealed
//! log files awaiting compaction and a stack of index files.
//!
//! The MANIFEST file records which files make up the partition, newest
//! first. It is rewritten through a temp file and a rename, so a crash
//! leaves either the old or the new manifest. Files on disk that the
//! manifest does not reference are leftovers from an interrupted
//! compaction and are removed at open; their content is still covered by
//! the log files the manifest does reference.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{info, warn};

use tsidx_common::iterator::TryIterator;
use tsidx_storage::{install_file, FileWriter, TMP_FILE_SUFFIX};

use crate::compact::CompactionCmd;
use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::file_set::{File, FileSet};
use crate::index_file::{IndexFile, INDEX_FILE_EXT};
use crate::log_file::{LogEntry, LogFile, LOG_FILE_EXT};
use crate::series::series_key::parse_series_key;
use crate::series::SeriesFile;
use crate::SeriesId;

pub const MANIFEST_FILE_NAME: &str = "MANIFEST";
const MANIFEST_VERSION: u32 = 1;

lazy_static! {
    static ref PARTITION_FILE_NAME_RE: Regex =
        Regex::new(r"^[0-9a-f]{8}\.(tsl|tsi)$").unwrap();
}

pub fn partition_file_name(id: u64, ext: &str) -> String {
    format!("{id:08x}{ext}")
}

pub fn is_valid_partition_file_name(name: &str) -> bool {
    PARTITION_FILE_NAME_RE.is_match(name)
}

pub fn parse_partition_file_name(name: &str) -> Result<(u64, &str)> {
    if !is_valid_partition_file_name(name) {
        return Err(IndexError::corruption(name, "invalid partition file name"));
    }
    let (stem, ext) = name.split_at(8);
    let id = u64::from_str_radix(stem, 16)
        .map_err(|_| IndexError::corruption(name, "invalid partition file name"))?;
    Ok((id, ext))
}

/// On-disk record of a partition's files, newest first.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub version: u32,
    pub files: Vec<String>,
}

impl Manifest {
    fn new() -> Manifest {
        Manifest {
            version: MANIFEST_VERSION,
            files: Vec::new(),
        }
    }

    fn parse(data: &[u8], path: &Path) -> Result<Manifest> {
        let manifest: Manifest = serde_json::from_slice(data)
            .map_err(|e| IndexError::corruption(path, format!("invalid manifest: {e}")))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(IndexError::corruption(
                path,
                format!("unsupported manifest version {}", manifest.version),
            ));
        }
        Ok(manifest)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum CompactionState {
    Idle,
    Compacting,
}

struct PartitionState {
    active: Arc<LogFile>,
    /// Sealed log files, newest first.
    sealed_logs: Vec<Arc<LogFile>>,
    /// Index files, newest first.
    index_files: Vec<Arc<IndexFile>>,
}

impl PartitionState {
    fn manifest(&self) -> Manifest {
        let mut files = vec![partition_file_name(self.active.id(), LOG_FILE_EXT)];
        for log in &self.sealed_logs {
            files.push(partition_file_name(log.id(), LOG_FILE_EXT));
        }
        for file in &self.index_files {
            files.push(partition_file_name(file.id(), INDEX_FILE_EXT));
        }
        Manifest {
            version: MANIFEST_VERSION,
            files,
        }
    }
}

pub struct Partition {
    id: usize,
    dir: PathBuf,
    sfile: Arc<SeriesFile>,
    config: IndexConfig,
    /// Serializes log appends and sealing.
    write_lock: tokio::sync::Mutex<()>,
    /// Serializes state swaps with their manifest rewrite, so a slower
    /// writer can never install an older view of the partition.
    manifest_lock: tokio::sync::Mutex<()>,
    state: RwLock<PartitionState>,
    /// Files replaced by compaction, kept until no file set references them.
    obsolete: Mutex<Vec<Arc<dyn File>>>,
    compaction: Mutex<CompactionState>,
    compaction_tx: Mutex<Option<mpsc::Sender<CompactionCmd>>>,
    /// Next file ID for this partition.
    seq: AtomicU64,
}

impl Partition {
    pub async fn open(
        id: usize,
        dir: impl Into<PathBuf>,
        sfile: Arc<SeriesFile>,
        config: IndexConfig,
    ) -> Result<Partition> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let manifest_path = dir.join(MANIFEST_FILE_NAME);

        let manifest = match fs::read(&manifest_path).await {
            Ok(data) => Manifest::parse(&data, &manifest_path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Manifest::new(),
            Err(e) => return Err(e.into()),
        };

        // drop temp files and anything the manifest does not reference
        let mut max_id = 0u64;
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(dirent) = read_dir.next_entry().await? {
            let name = dirent.file_name();
            let name = match name.to_str() {
                Some(name) => name.to_string(),
                None => continue,
            };
            if name == MANIFEST_FILE_NAME {
                continue;
            }
            if name.ends_with(TMP_FILE_SUFFIX) {
                warn!(file = %name, "removing leftover temporary file");
                fs::remove_file(dirent.path()).await?;
                continue;
            }
            if !is_valid_partition_file_name(&name) {
                continue;
            }
            let (fid, _) = parse_partition_file_name(&name)?;
            max_id = max_id.max(fid);
            if !manifest.files.iter().any(|f| f == &name) {
                warn!(file = %name, "removing file not referenced by manifest");
                fs::remove_file(dirent.path()).await?;
            }
        }

        let mut active: Option<Arc<LogFile>> = None;
        let mut sealed_logs = Vec::new();
        let mut index_files = Vec::new();

        for name in &manifest.files {
            let (fid, ext) = parse_partition_file_name(name)?;
            max_id = max_id.max(fid);
            let path = dir.join(name);

            if ext == LOG_FILE_EXT {
                let log = Arc::new(LogFile::open(&path, fid).await?);
                if active.is_none() {
                    active = Some(log);
                } else {
                    log.seal().await?;
                    sealed_logs.push(log);
                }
            } else {
                match IndexFile::open(&path, fid).await {
                    Ok(file) => index_files.push(Arc::new(file)),
                    // a bad index file is excluded rather than fatal so the
                    // rest of the partition still opens
                    Err(e) => {
                        warn!(file = %name, error = %e, "excluding unreadable index file")
                    }
                }
            }
        }

        let seq = AtomicU64::new(max_id + 1);
        let created_fresh = active.is_none();
        let active = match active {
            Some(active) => active,
            None => {
                let fid = seq.fetch_add(1, Ordering::SeqCst);
                let path = dir.join(partition_file_name(fid, LOG_FILE_EXT));
                Arc::new(LogFile::create(&path, fid).await?)
            }
        };

        let partition = Partition {
            id,
            dir,
            sfile,
            config,
            write_lock: tokio::sync::Mutex::new(()),
            manifest_lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(PartitionState {
                active,
                sealed_logs,
                index_files,
            }),
            obsolete: Mutex::new(Vec::new()),
            compaction: Mutex::new(CompactionState::Idle),
            compaction_tx: Mutex::new(None),
            seq,
        };

        if created_fresh {
            partition.write_manifest_from_state().await?;
        }
        info!(partition = partition.id, path = %partition.dir.display(), "opened partition");
        Ok(partition)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn series_file(&self) -> &Arc<SeriesFile> {
        &self.sfile
    }

    pub fn next_file_id(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn set_compaction_sender(&self, tx: mpsc::Sender<CompactionCmd>) -> Result<()> {
        *self.compaction_tx.lock()? = Some(tx);
        Ok(())
    }

    fn nudge_compaction(&self) {
        if let Ok(guard) = self.compaction_tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.try_send(CompactionCmd::Maybe);
            }
        }
    }

    /// Snapshot of the partition's current files, newest first.
    pub fn file_set(&self) -> Result<FileSet> {
        let state = self.state.read()?;
        let mut files: Vec<Arc<dyn File>> = Vec::with_capacity(
            1 + state.sealed_logs.len() + state.index_files.len(),
        );
        files.push(state.active.clone());
        for log in &state.sealed_logs {
            files.push(log.clone());
        }
        for file in &state.index_files {
            files.push(file.clone());
        }
        Ok(FileSet::new(self.sfile.clone(), files))
    }

    async fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let data = serde_json::to_vec_pretty(manifest)
            .map_err(|e| IndexError::conflict(format!("manifest encoding failed: {e}")))?;

        let dst = self.dir.join(MANIFEST_FILE_NAME);
        let tmp = self
            .dir
            .join(format!("{MANIFEST_FILE_NAME}{TMP_FILE_SUFFIX}"));
        // a failed write may have left the temp file behind
        let _ = fs::remove_file(&tmp).await;
        let mut w = FileWriter::create(&tmp).await?;
        w.write(&data).await?;
        w.sync().await?;
        install_file(&tmp, &dst).await?;
        Ok(())
    }

    async fn write_manifest_from_state(&self) -> Result<()> {
        let manifest = self.state.read()?.manifest();
        self.write_manifest(&manifest).await
    }

    /// Appends series creations to the log. `entries` pairs each new ID
    /// with its canonical key; the caller has already registered them in
    /// the series file.
    pub async fn create_series_if_not_exists(
        &self,
        entries: &[(SeriesId, Vec<u8>)],
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        self.maybe_seal_active().await?;

        let mut log_entries = Vec::with_capacity(entries.len());
        for (id, key) in entries {
            let (name, tags) = parse_series_key(key)?;
            log_entries.push(LogEntry::AddSeries {
                id: *id,
                name: name.to_vec(),
                tags,
            });
        }
        let active = self.state.read()?.active.clone();
        active.append(&log_entries).await
    }

    /// Tombstones series IDs in this partition's log.
    pub async fn delete_series(&self, ids: &[SeriesId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        self.maybe_seal_active().await?;

        let entries: Vec<LogEntry> = ids.iter().map(|id| LogEntry::DeleteSeries { id: *id }).collect();
        let active = self.state.read()?.active.clone();
        active.append(&entries).await
    }

    /// Tombstones a measurement in this partition as one log batch: every
    /// live tag value and key, every live series, then the measurement
    /// itself. Returns the series IDs that were tombstoned so the caller
    /// can drop them from the series file.
    pub async fn delete_measurement(&self, name: &[u8]) -> Result<Vec<SeriesId>> {
        let fs = self.file_set()?;
        let mut entries = Vec::new();

        let mut keys = fs.tag_key_iterator(name)?;
        while let Some(k) = keys.try_next()? {
            let mut values = fs.tag_value_iterator(name, &k.key)?;
            while let Some(v) = values.try_next()? {
                entries.push(LogEntry::DeleteTagValue {
                    name: name.to_vec(),
                    key: k.key.clone(),
                    value: v.value,
                });
            }
            entries.push(LogEntry::DeleteTagKey {
                name: name.to_vec(),
                key: k.key,
            });
        }

        let ids: Vec<SeriesId> = fs.measurement_series_id_set(name)?.iter().collect();
        for id in &ids {
            entries.push(LogEntry::DeleteSeries { id: *id });
        }
        entries.push(LogEntry::DeleteMeasurement {
            name: name.to_vec(),
        });

        let _guard = self.write_lock.lock().await;
        self.maybe_seal_active().await?;
        let active = self.state.read()?.active.clone();
        active.append(&entries).await?;
        Ok(ids)
    }

    pub async fn delete_tag_key(&self, name: &[u8], key: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.maybe_seal_active().await?;

        let active = self.state.read()?.active.clone();
        active
            .append(&[LogEntry::DeleteTagKey {
                name: name.to_vec(),
                key: key.to_vec(),
            }])
            .await
    }

    pub async fn delete_tag_value(&self, name: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.maybe_seal_active().await?;

        let active = self.state.read()?.active.clone();
        active
            .append(&[LogEntry::DeleteTagValue {
                name: name.to_vec(),
                key: key.to_vec(),
                value: value.to_vec(),
            }])
            .await
    }

    /// Seals the active log once it outgrows the configured size. Caller
    /// must hold the write lock.
    async fn maybe_seal_active(&self) -> Result<()> {
        let (size, old) = {
            let state = self.state.read()?;
            (state.active.size(), state.active.clone())
        };
        if size < self.config.max_log_file_size {
            return Ok(());
        }

        old.seal().await?;
        let fid = self.next_file_id();
        let path = self.dir.join(partition_file_name(fid, LOG_FILE_EXT));
        let new_log = Arc::new(LogFile::create(&path, fid).await?);
        info!(partition = self.id, log = fid, "sealed log file");

        // the manifest lists the new log before any entry lands in it;
        // appends only resume once this returns
        let _mguard = self.manifest_lock.lock().await;
        {
            let mut state = self.state.write()?;
            let prev = std::mem::replace(&mut state.active, new_log);
            state.sealed_logs.insert(0, prev);
        }
        self.write_manifest_from_state().await?;
        self.nudge_compaction();
        Ok(())
    }

    /// The next log file compaction should fold into an index file.
    pub fn oldest_sealed_log(&self) -> Result<Option<Arc<LogFile>>> {
        Ok(self.state.read()?.sealed_logs.last().cloned())
    }

    pub fn index_file_count(&self) -> Result<usize> {
        Ok(self.state.read()?.index_files.len())
    }

    /// Current index files, newest first.
    pub fn index_files(&self) -> Result<Vec<Arc<IndexFile>>> {
        Ok(self.state.read()?.index_files.clone())
    }

    /// Claims the partition for one compaction pass. Returns false if a
    /// pass is already running.
    pub fn begin_compaction(&self) -> Result<bool> {
        let mut state = self.compaction.lock()?;
        if *state == CompactionState::Compacting {
            return Ok(false);
        }
        *state = CompactionState::Compacting;
        Ok(true)
    }

    pub fn end_compaction(&self) -> Result<()> {
        *self.compaction.lock()? = CompactionState::Idle;
        Ok(())
    }

    /// Swaps a compacted log file for its replacement index file.
    pub async fn publish_log_compaction(
        &self,
        log_id: u64,
        new_file: Arc<IndexFile>,
    ) -> Result<()> {
        let _mguard = self.manifest_lock.lock().await;
        {
            let mut state = self.state.write()?;
            match state.sealed_logs.last().map(|log| log.id()) {
                None => return Err(IndexError::conflict("no sealed log to replace")),
                Some(id) if id != log_id => {
                    return Err(IndexError::conflict(
                        "sealed log changed during compaction",
                    ))
                }
                Some(_) => {}
            }
            if let Some(old) = state.sealed_logs.pop() {
                self.obsolete.lock()?.push(old);
            }
            state.index_files.insert(0, new_file);
        }
        self.write_manifest_from_state().await
    }

    /// Swaps the full stack of index files for one merged replacement.
    pub async fn publish_full_compaction(
        &self,
        input_ids: &[u64],
        new_file: Arc<IndexFile>,
    ) -> Result<()> {
        let _mguard = self.manifest_lock.lock().await;
        {
            let mut state = self.state.write()?;
            let current: Vec<u64> = state.index_files.iter().map(|f| f.id()).collect();
            if current != input_ids {
                return Err(IndexError::conflict(
                    "index files changed during compaction",
                ));
            }
            let olds = std::mem::replace(&mut state.index_files, vec![new_file]);
            let mut obsolete = self.obsolete.lock()?;
            for old in olds {
                obsolete.push(old);
            }
        }
        self.write_manifest_from_state().await
    }

    /// Deletes retired files no file set references anymore.
    pub async fn purge_obsolete(&self) -> Result<()> {
        let mut paths = Vec::new();
        {
            let mut obsolete = self.obsolete.lock()?;
            obsolete.retain(|file| {
                if Arc::strong_count(file) == 1 {
                    paths.push(file.path().to_path_buf());
                    false
                } else {
                    true
                }
            });
        }
        for path in paths {
            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove retired file");
            } else {
                info!(path = %path.display(), "removed retired file");
            }
        }
        Ok(())
    }

    /// Syncs the active log to disk.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let active = self.state.read()?.active.clone();
        active.seal().await
    }
}
