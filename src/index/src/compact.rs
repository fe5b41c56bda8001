//! Background compaction.
//!
//! Each partition gets one worker task. Sealed log files are folded into
//! index files one at a time, oldest first, preserving tombstones exactly
//! as the log stated them. Once enough index files pile up they are merged
//! into a single file; the merge resolves tombstones, so the output
//! carries only live entries and an empty tombstone set.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use tsidx_common::iterator::TryIterator;
use tsidx_storage::{install_file, FileWriter, TMP_FILE_SUFFIX};

use crate::config::IndexConfig;
use crate::error::Result;
use crate::file_set::{File, FileSet};
use crate::index_file::{IndexFile, IndexFileBuilder, INDEX_FILE_EXT};
use crate::log_file::LogFile;
use crate::partition::{partition_file_name, Partition};
use crate::series::SeriesFile;
use crate::series_id_set::SeriesIdSet;
use crate::tag_block::TagBlockWriter;

/// Commands accepted by compaction workers.
pub enum CompactionCmd {
    /// Wake up and compact if there is anything to do.
    Maybe,
    /// Compact everything that can be compacted, then acknowledge.
    Force { ack: oneshot::Sender<Result<()>> },
    Shutdown,
}

/// Runs the compaction loop for one partition until shutdown.
pub fn spawn_partition_worker(
    partition: Arc<Partition>,
    config: IndexConfig,
    mut rx: mpsc::Receiver<CompactionCmd>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.compact_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = config.compact_backoff();

        loop {
            let (force, ack) = tokio::select! {
                cmd = rx.recv() => match cmd {
                    None | Some(CompactionCmd::Shutdown) => break,
                    Some(CompactionCmd::Maybe) => (false, None),
                    Some(CompactionCmd::Force { ack }) => (true, Some(ack)),
                },
                _ = interval.tick() => (false, None),
            };

            let result = compact_partition(&partition, &config, force).await;
            match &result {
                Ok(()) => backoff = config.compact_backoff(),
                Err(e) => {
                    warn!(partition = partition.id(), error = %e, "compaction pass failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(config.compact_backoff_max());
                }
            }
            if let Some(ack) = ack {
                let _ = ack.send(result);
            }
        }
    })
}

/// Runs series file compaction on the same cadence as the partitions.
pub fn spawn_series_maintenance(
    sfile: Arc<SeriesFile>,
    config: IndexConfig,
    mut rx: mpsc::Receiver<CompactionCmd>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.compact_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = config.compact_backoff();

        loop {
            let (force, ack) = tokio::select! {
                cmd = rx.recv() => match cmd {
                    None | Some(CompactionCmd::Shutdown) => break,
                    Some(CompactionCmd::Maybe) => (false, None),
                    Some(CompactionCmd::Force { ack }) => (true, Some(ack)),
                },
                _ = interval.tick() => (false, None),
            };

            let threshold = if force {
                0
            } else {
                config.series_compact_threshold
            };
            let result = match sfile.needs_compaction(threshold) {
                Ok(true) => sfile.compact().await,
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            };
            match &result {
                Ok(()) => backoff = config.compact_backoff(),
                Err(e) => {
                    warn!(error = %e, "series file compaction failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(config.compact_backoff_max());
                }
            }
            if let Some(ack) = ack {
                let _ = ack.send(result);
            }
        }
    })
}

/// One compaction pass over a partition. With `force` set, index files are
/// merged whenever more than one exists rather than waiting for the
/// configured limit.
pub async fn compact_partition(
    partition: &Arc<Partition>,
    config: &IndexConfig,
    force: bool,
) -> Result<()> {
    if !partition.begin_compaction()? {
        return Ok(());
    }
    let result = compact_partition_inner(partition, config, force).await;
    if let Err(e) = partition.end_compaction() {
        warn!(partition = partition.id(), error = %e, "failed to release compaction claim");
    }
    result
}

async fn compact_partition_inner(
    partition: &Arc<Partition>,
    config: &IndexConfig,
    force: bool,
) -> Result<()> {
    partition.purge_obsolete().await?;

    while let Some(log) = partition.oldest_sealed_log()? {
        compact_log_file(partition, &log).await?;
        drop(log);
        partition.purge_obsolete().await?;
    }

    let count = partition.index_file_count()?;
    let threshold = config.max_index_files.max(2);
    if count >= threshold || (force && count >= 2) {
        full_compact(partition).await?;
        partition.purge_obsolete().await?;
    }
    Ok(())
}

/// Folds one sealed log file into an index file. Tombstones and deletion
/// flags are carried through unchanged; resolution happens later, at the
/// full merge.
async fn compact_log_file(partition: &Arc<Partition>, log: &Arc<LogFile>) -> Result<()> {
    let mut builder = IndexFileBuilder::new();

    let mut measurements = log.measurement_iterator()?;
    while let Some(m) = measurements.try_next()? {
        let postings = log.measurement_series_ids(&m.name)?.unwrap_or_default();

        let mut tags = TagBlockWriter::default();
        if let Some(mut keys) = log.tag_key_iterator(&m.name)? {
            while let Some(k) = keys.try_next()? {
                tags.add_tag_key(&k.key, k.deleted);
                if let Some(mut values) = log.tag_value_iterator(&m.name, &k.key)? {
                    while let Some(v) = values.try_next()? {
                        let vp = log
                            .tag_value_series_ids(&m.name, &k.key, &v.value)?
                            .unwrap_or_default();
                        tags.add_tag_value(&k.key, &v.value, v.deleted, vp.ids);
                    }
                }
            }
        }
        builder.add_measurement(&m.name, m.deleted, postings.ids, &tags)?;
    }

    let series_ids = log.series_id_set()?;
    let tombstone_ids = log.tombstone_series_id_set()?;
    let data = builder.finish(&series_ids, &tombstone_ids)?;

    let file = write_index_file(partition, data).await?;
    info!(
        partition = partition.id(),
        log = log.id(),
        file = file.id(),
        size = file.size(),
        "compacted log file"
    );
    partition.publish_log_compaction(log.id(), file).await
}

/// Merges every index file in the partition into one. Entries shadowed or
/// tombstoned by newer files are dropped, as are measurements, tag keys
/// and tag values left with no live series.
async fn full_compact(partition: &Arc<Partition>) -> Result<()> {
    let inputs = partition.index_files()?;
    if inputs.len() < 2 {
        return Ok(());
    }
    let input_ids: Vec<u64> = inputs.iter().map(|f| f.id()).collect();
    let files: Vec<Arc<dyn File>> = inputs
        .iter()
        .map(|f| f.clone() as Arc<dyn File>)
        .collect();
    let sub = FileSet::new(partition.series_file().clone(), files);

    let mut builder = IndexFileBuilder::new();
    let mut all_ids = SeriesIdSet::default();

    let mut measurements = sub.measurement_iterator()?;
    while let Some(m) = measurements.try_next()? {
        let ids = sub.measurement_series_id_set(&m.name)?;
        if ids.is_empty() {
            continue;
        }
        all_ids.union_with(&ids);

        let mut tags = TagBlockWriter::default();
        let mut keys = sub.tag_key_iterator(&m.name)?;
        while let Some(k) = keys.try_next()? {
            // the key entry materializes with its first surviving value, so
            // keys whose series all died fall away here
            let mut values = sub.tag_value_iterator(&m.name, &k.key)?;
            while let Some(v) = values.try_next()? {
                let vids = sub.tag_value_series_id_set(&m.name, &k.key, &v.value)?;
                if vids.is_empty() {
                    continue;
                }
                tags.add_tag_value(&k.key, &v.value, false, vids);
            }
        }
        builder.add_measurement(&m.name, false, ids, &tags)?;
    }

    let data = builder.finish(&all_ids, &SeriesIdSet::default())?;
    let file = write_index_file(partition, data).await?;
    info!(
        partition = partition.id(),
        inputs = input_ids.len(),
        file = file.id(),
        size = file.size(),
        "merged index files"
    );
    partition.publish_full_compaction(&input_ids, file).await
}

/// Writes an encoded index file image through a temp file and opens it.
async fn write_index_file(partition: &Arc<Partition>, data: Vec<u8>) -> Result<Arc<IndexFile>> {
    let fid = partition.next_file_id();
    let name = partition_file_name(fid, INDEX_FILE_EXT);
    let dst = partition.dir().join(&name);
    let tmp = partition.dir().join(format!("{name}{TMP_FILE_SUFFIX}"));

    let mut w = FileWriter::create(&tmp).await?;
    w.write(&data).await?;
    w.sync().await?;
    drop(w);
    install_file(&tmp, &dst).await?;

    Ok(Arc::new(IndexFile::open(&dst, fid).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::series_key::encode_series_key;
    use std::path::Path;
    use std::time::Duration;
    use tsidx_common::tag::Tags;

    fn test_config() -> IndexConfig {
        IndexConfig {
            partition_count: 1,
            max_log_file_size: 256,
            max_index_files: 4,
            ..IndexConfig::default()
        }
    }

    fn key(name: &str, pairs: &[(&str, &str)]) -> Vec<u8> {
        let tags: Tags = pairs
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect();
        encode_series_key(name.as_bytes(), &tags)
    }

    async fn series_file(dir: &Path) -> Arc<SeriesFile> {
        Arc::new(SeriesFile::open(dir.join("_series")).await.unwrap())
    }

    async fn add_series(
        partition: &Arc<Partition>,
        sfile: &Arc<SeriesFile>,
        k: Vec<u8>,
    ) -> crate::SeriesId {
        let ids = sfile
            .create_series_list_if_not_exists(std::slice::from_ref(&k))
            .await
            .unwrap();
        partition
            .create_series_if_not_exists(&[(ids[0].0, k)])
            .await
            .unwrap();
        ids[0].0
    }

    #[tokio::test]
    async fn test_log_compaction_preserves_visibility() {
        let dir = tempfile::tempdir().unwrap();
        let sfile = series_file(dir.path()).await;
        let config = test_config();
        let partition = Arc::new(
            Partition::open(0, dir.path().join("0"), sfile.clone(), config.clone())
                .await
                .unwrap(),
        );

        for i in 0..20 {
            add_series(&partition, &sfile, key("cpu", &[("host", &format!("h{i:02}"))])).await;
        }
        assert!(partition.oldest_sealed_log().unwrap().is_some());

        compact_partition(&partition, &config, false).await.unwrap();

        assert!(partition.oldest_sealed_log().unwrap().is_none());
        assert!(partition.index_file_count().unwrap() >= 1);

        let fs = partition.file_set().unwrap();
        assert_eq!(fs.measurement_series_id_set(b"cpu").unwrap().len(), 20);

        // the compacted logs are gone from disk
        let logs: Vec<_> = std::fs::read_dir(dir.path().join("0"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tsl"))
            .collect();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn test_full_compaction_resolves_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let sfile = series_file(dir.path()).await;
        let config = test_config();
        let partition = Arc::new(
            Partition::open(0, dir.path().join("0"), sfile.clone(), config.clone())
                .await
                .unwrap(),
        );

        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(add_series(&partition, &sfile, key("cpu", &[("host", &format!("h{i:02}"))])).await);
        }
        // tombstone one series, then push enough writes that the log
        // holding the tombstone gets sealed too
        let victim = ids[3];
        sfile.delete_series_id(victim).await.unwrap();
        partition.delete_series(&[victim]).await.unwrap();
        for i in 10..30 {
            add_series(&partition, &sfile, key("cpu", &[("host", &format!("h{i:02}"))])).await;
        }

        compact_partition(&partition, &config, true).await.unwrap();

        assert_eq!(partition.index_file_count().unwrap(), 1);
        let merged = &partition.index_files().unwrap()[0];
        assert!(merged.tombstone_series_id_set().unwrap().is_empty());
        assert!(!merged.series_id_set().unwrap().contains(victim));

        let fs = partition.file_set().unwrap();
        let live = fs.measurement_series_id_set(b"cpu").unwrap();
        assert_eq!(live.len(), 29);
        assert!(!live.contains(victim));

        // retired files were reaped
        let tsi: Vec<_> = std::fs::read_dir(dir.path().join("0"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tsi"))
            .collect();
        assert_eq!(tsi.len(), 1);
    }

    #[tokio::test]
    async fn test_full_compaction_drops_dead_measurement() {
        let dir = tempfile::tempdir().unwrap();
        let sfile = series_file(dir.path()).await;
        let config = test_config();
        let partition = Arc::new(
            Partition::open(0, dir.path().join("0"), sfile.clone(), config.clone())
                .await
                .unwrap(),
        );

        let doomed = add_series(&partition, &sfile, key("mem", &[("host", "a")])).await;
        for i in 0..10 {
            add_series(&partition, &sfile, key("cpu", &[("host", &format!("h{i:02}"))])).await;
        }
        let dropped = partition.delete_measurement(b"mem").await.unwrap();
        assert_eq!(dropped, vec![doomed]);
        sfile.delete_series_id(doomed).await.unwrap();
        for i in 10..30 {
            add_series(&partition, &sfile, key("cpu", &[("host", &format!("h{i:02}"))])).await;
        }

        compact_partition(&partition, &config, true).await.unwrap();

        assert_eq!(partition.index_file_count().unwrap(), 1);
        let merged = &partition.index_files().unwrap()[0];
        assert!(merged.measurement(b"mem").unwrap().is_none());
        assert!(merged.measurement(b"cpu").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_worker_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let sfile = series_file(dir.path()).await;
        let config = test_config();
        let partition = Arc::new(
            Partition::open(0, dir.path().join("0"), sfile, config.clone())
                .await
                .unwrap(),
        );

        let (tx, rx) = mpsc::channel(8);
        partition.set_compaction_sender(tx.clone()).unwrap();
        let handle = spawn_partition_worker(partition, config, rx);

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(CompactionCmd::Force { ack: ack_tx }).await.unwrap();
        ack_rx.await.unwrap().unwrap();

        tx.send(CompactionCmd::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
