//! The composite index: one shared series file and a set of partitions
//! that series keys are hashed across. All write operations fan out to
//! the owning partition; read operations merge every partition's view.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use tsidx_common::iterator::TryIterator;
use tsidx_common::tag::Tags;
use tsidx_utils::rhh;

use crate::compact::{self, CompactionCmd};
use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::iterator::{
    ElemIterator, MeasurementElem, MergeElemIterator, SeriesIdIterator, SeriesIdMergeIterator,
    SeriesIdSetIterator, TagKeyElem, TagValueElem,
};
use crate::partition::Partition;
use crate::series::series_key::encode_series_key;
use crate::series::SeriesFile;
use crate::series_id_set::SeriesIdSet;
use crate::SeriesId;

/// Directory under the index path holding the series file.
pub const SERIES_FILE_DIR: &str = "_series";

const COMPACTION_QUEUE_DEPTH: usize = 16;

pub struct Index {
    path: PathBuf,
    sfile: Arc<SeriesFile>,
    partitions: Vec<Arc<Partition>>,
    partition_txs: Vec<mpsc::Sender<CompactionCmd>>,
    series_tx: mpsc::Sender<CompactionCmd>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Index {
    /// Opens the index, recovering any existing state under `path`. The
    /// partition count of an existing index wins over the configured one.
    pub async fn open(path: impl Into<PathBuf>, config: IndexConfig) -> Result<Index> {
        let path = path.into();
        fs::create_dir_all(&path).await?;

        let sfile = Arc::new(SeriesFile::open(path.join(SERIES_FILE_DIR)).await?);

        let mut count = config.partition_count.max(1);
        let mut max_existing: Option<usize> = None;
        let mut read_dir = fs::read_dir(&path).await?;
        while let Some(dirent) = read_dir.next_entry().await? {
            if !dirent.file_type().await?.is_dir() {
                continue;
            }
            let name = dirent.file_name();
            if let Some(n) = name.to_str().and_then(|s| s.parse::<usize>().ok()) {
                max_existing = Some(max_existing.map_or(n, |m| m.max(n)));
            }
        }
        if let Some(max) = max_existing {
            count = max + 1;
        }

        let mut partitions = Vec::with_capacity(count);
        for i in 0..count {
            let partition =
                Partition::open(i, path.join(i.to_string()), sfile.clone(), config.clone())
                    .await?;
            partitions.push(Arc::new(partition));
        }

        let mut partition_txs = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count + 1);
        for partition in &partitions {
            let (tx, rx) = mpsc::channel(COMPACTION_QUEUE_DEPTH);
            partition.set_compaction_sender(tx.clone())?;
            partition_txs.push(tx);
            workers.push(compact::spawn_partition_worker(
                partition.clone(),
                config.clone(),
                rx,
            ));
        }
        let (series_tx, series_rx) = mpsc::channel(COMPACTION_QUEUE_DEPTH);
        workers.push(compact::spawn_series_maintenance(
            sfile.clone(),
            config.clone(),
            series_rx,
        ));

        info!(path = %path.display(), partitions = count, "opened index");
        Ok(Index {
            path,
            sfile,
            partitions,
            partition_txs,
            series_tx,
            workers: Mutex::new(workers),
        })
    }

    /// Stops the compaction workers and syncs the partitions to disk.
    pub async fn close(&self) -> Result<()> {
        for tx in &self.partition_txs {
            let _ = tx.send(CompactionCmd::Shutdown).await;
        }
        let _ = self.series_tx.send(CompactionCmd::Shutdown).await;
        let workers = std::mem::take(&mut *self.workers.lock()?);
        let _ = futures::future::join_all(workers).await;
        for partition in &self.partitions {
            partition.close().await?;
        }
        info!(path = %self.path.display(), "closed index");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn series_file(&self) -> &Arc<SeriesFile> {
        &self.sfile
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn partition_for_key(&self, key: &[u8]) -> &Arc<Partition> {
        let i = (rhh::hash_key(key) % self.partitions.len() as u64) as usize;
        &self.partitions[i]
    }

    /// Registers the given series, returning one ID per input. Series that
    /// already exist keep their ID; new ones are assigned fresh IDs and
    /// indexed in their partition.
    pub async fn create_series_list_if_not_exists(
        &self,
        names: &[Vec<u8>],
        tag_sets: &[Tags],
    ) -> Result<Vec<SeriesId>> {
        if names.len() != tag_sets.len() {
            return Err(IndexError::conflict(
                "names and tag sets must have equal length",
            ));
        }
        let keys: Vec<Vec<u8>> = names
            .iter()
            .zip(tag_sets)
            .map(|(name, tags)| encode_series_key(name, tags))
            .collect();
        let results = self.sfile.create_series_list_if_not_exists(&keys).await?;

        // only newly created series need log entries, bucketed per partition
        let mut buckets: Vec<Vec<(SeriesId, Vec<u8>)>> =
            vec![Vec::new(); self.partitions.len()];
        for ((id, created), key) in results.iter().zip(keys) {
            if *created {
                let i = (rhh::hash_key(&key) % self.partitions.len() as u64) as usize;
                buckets[i].push((*id, key));
            }
        }
        for (i, bucket) in buckets.into_iter().enumerate() {
            if !bucket.is_empty() {
                self.partitions[i].create_series_if_not_exists(&bucket).await?;
            }
        }
        Ok(results.into_iter().map(|(id, _)| id).collect())
    }

    pub async fn create_series_if_not_exists(
        &self,
        name: &[u8],
        tags: &Tags,
    ) -> Result<SeriesId> {
        let ids = self
            .create_series_list_if_not_exists(&[name.to_vec()], std::slice::from_ref(tags))
            .await?;
        Ok(ids[0])
    }

    /// The ID of a series, if it exists and is not deleted.
    pub fn series_id(&self, name: &[u8], tags: &Tags) -> Result<Option<SeriesId>> {
        let key = encode_series_key(name, tags);
        self.sfile.series_id(&key)
    }

    /// The canonical key of a series ID.
    pub fn series_key(&self, id: SeriesId) -> Result<Vec<u8>> {
        self.sfile.series_key(id)
    }

    /// Resolves IDs back to canonical keys, positionally. Unknown or purged
    /// IDs yield `None`.
    pub fn series_keys(&self, ids: &[SeriesId]) -> Result<Vec<Option<Vec<u8>>>> {
        self.sfile.series_keys(ids)
    }

    pub fn series_count(&self) -> Result<u64> {
        self.sfile.series_count()
    }

    /// Tombstones one series in its partition and the series file.
    pub async fn delete_series(&self, name: &[u8], tags: &Tags) -> Result<()> {
        let key = encode_series_key(name, tags);
        let id = self.sfile.series_id(&key)?.ok_or(IndexError::NotFound)?;
        self.partition_for_key(&key).delete_series(&[id]).await?;
        self.sfile.delete_series_id(id).await
    }

    pub async fn delete_series_id(&self, id: SeriesId) -> Result<()> {
        let key = self.sfile.series_key(id)?;
        self.partition_for_key(&key).delete_series(&[id]).await?;
        self.sfile.delete_series_id(id).await
    }

    /// Tombstones a measurement everywhere: each partition writes
    /// tombstones for the measurement's tag values, tag keys and series,
    /// and the series IDs are dropped from the series file.
    pub async fn delete_measurement(&self, name: &[u8]) -> Result<()> {
        for partition in &self.partitions {
            let ids = partition.delete_measurement(name).await?;
            for id in ids {
                match self.sfile.delete_series_id(id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        info!(measurement = %String::from_utf8_lossy(name), "deleted measurement");
        Ok(())
    }

    pub async fn delete_tag_key(&self, name: &[u8], key: &[u8]) -> Result<()> {
        for partition in &self.partitions {
            partition.delete_tag_key(name, key).await?;
        }
        Ok(())
    }

    pub async fn delete_tag_value(&self, name: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        for partition in &self.partitions {
            partition.delete_tag_value(name, key, value).await?;
        }
        Ok(())
    }

    /// Live measurement names across all partitions, ordered.
    pub fn measurement_iterator(&self) -> Result<MergeElemIterator<MeasurementElem>> {
        let mut itrs: Vec<ElemIterator<MeasurementElem>> =
            Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            let fs = partition.file_set()?;
            itrs.push(Box::new(fs.measurement_iterator()?));
        }
        MergeElemIterator::new(itrs)
    }

    pub fn measurement_names(&self) -> Result<Vec<Vec<u8>>> {
        let mut itr = self.measurement_iterator()?;
        let mut names = Vec::new();
        while let Some(m) = itr.try_next()? {
            names.push(m.name);
        }
        Ok(names)
    }

    pub fn has_measurement(&self, name: &[u8]) -> Result<bool> {
        let mut itr = self.measurement_iterator()?;
        while let Some(m) = itr.try_next()? {
            match m.name.as_slice().cmp(name) {
                Ordering::Equal => return Ok(true),
                Ordering::Greater => return Ok(false),
                Ordering::Less => {}
            }
        }
        Ok(false)
    }

    /// Live tag keys of a measurement, ordered.
    pub fn tag_key_iterator(&self, name: &[u8]) -> Result<MergeElemIterator<TagKeyElem>> {
        let mut itrs: Vec<ElemIterator<TagKeyElem>> = Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            let fs = partition.file_set()?;
            itrs.push(Box::new(fs.tag_key_iterator(name)?));
        }
        MergeElemIterator::new(itrs)
    }

    /// Live values of a tag key, ordered.
    pub fn tag_value_iterator(
        &self,
        name: &[u8],
        key: &[u8],
    ) -> Result<MergeElemIterator<TagValueElem>> {
        let mut itrs: Vec<ElemIterator<TagValueElem>> =
            Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            let fs = partition.file_set()?;
            itrs.push(Box::new(fs.tag_value_iterator(name, key)?));
        }
        MergeElemIterator::new(itrs)
    }

    /// Live series IDs under a measurement, across all partitions.
    pub fn measurement_series_id_set(&self, name: &[u8]) -> Result<SeriesIdSet> {
        let mut ids = SeriesIdSet::default();
        for partition in &self.partitions {
            ids.union_with(&partition.file_set()?.measurement_series_id_set(name)?);
        }
        Ok(ids)
    }

    pub fn measurement_series_id_iterator(&self, name: &[u8]) -> Result<SeriesIdSetIterator> {
        Ok(SeriesIdSetIterator::new(
            self.measurement_series_id_set(name)?,
        ))
    }

    /// Live series IDs matching one tag key/value pair.
    pub fn tag_value_series_id_set(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Result<SeriesIdSet> {
        let mut ids = SeriesIdSet::default();
        for partition in &self.partitions {
            ids.union_with(
                &partition
                    .file_set()?
                    .tag_value_series_id_set(name, key, value)?,
            );
        }
        Ok(ids)
    }

    pub fn tag_value_series_id_iterator(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Result<SeriesIdSetIterator> {
        Ok(SeriesIdSetIterator::new(
            self.tag_value_series_id_set(name, key, value)?,
        ))
    }

    /// Every live series ID in the index, ascending.
    pub fn series_id_iterator(&self) -> Result<SeriesIdMergeIterator> {
        let mut itrs: Vec<SeriesIdIterator> = Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            itrs.push(Box::new(partition.file_set()?.series_id_iterator()?));
        }
        SeriesIdMergeIterator::new(itrs)
    }

    /// Runs log and index compaction on every partition, plus series file
    /// compaction, and waits for all of it to finish.
    pub async fn compact(&self) -> Result<()> {
        let mut acks = Vec::with_capacity(self.partition_txs.len() + 1);
        for tx in &self.partition_txs {
            let (ack_tx, ack_rx) = oneshot::channel();
            tx.send(CompactionCmd::Force { ack: ack_tx })
                .await
                .map_err(|_| IndexError::conflict("compaction worker stopped"))?;
            acks.push(ack_rx);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.series_tx
            .send(CompactionCmd::Force { ack: ack_tx })
            .await
            .map_err(|_| IndexError::conflict("compaction worker stopped"))?;
        acks.push(ack_rx);

        for ack in acks {
            ack.await
                .map_err(|_| IndexError::conflict("compaction worker stopped"))??;
        }
        Ok(())
    }
}
