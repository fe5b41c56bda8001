//! A file set is an immutable snapshot of one partition's files, newest
//! first. Reads run against a file set without any coordination with
//! writers or compaction; files stay alive as long as any set references
//! them, so a snapshot taken before a compaction keeps working after it.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::iterator::{
    ElemIterator, MeasurementElem, MergeElemIterator, SeriesIdSetIterator, TagKeyElem,
    TagValueElem,
};
use crate::series::SeriesFile;
use crate::series_id_set::SeriesIdSet;

/// Series IDs one file holds under one element, plus whether the file's
/// newest statement tombstones the element itself. A tombstoned element
/// shadows everything older, so accumulation stops there.
#[derive(Clone, Debug, Default)]
pub struct Postings {
    pub ids: SeriesIdSet,
    pub tombstoned: bool,
}

/// Common read interface over log files and index files.
pub trait File: Send + Sync {
    fn id(&self) -> u64;
    fn path(&self) -> &Path;
    fn size(&self) -> u64;

    /// All measurements stated by this file, including tombstoned ones.
    fn measurement_iterator(&self) -> Result<ElemIterator<MeasurementElem>>;
    /// Tag keys under a measurement, or `None` if the file never mentions it.
    fn tag_key_iterator(&self, name: &[u8]) -> Result<Option<ElemIterator<TagKeyElem>>>;
    fn tag_value_iterator(
        &self,
        name: &[u8],
        key: &[u8],
    ) -> Result<Option<ElemIterator<TagValueElem>>>;

    fn measurement_series_ids(&self, name: &[u8]) -> Result<Option<Postings>>;
    fn tag_value_series_ids(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Postings>>;

    /// Every series ID this file references.
    fn series_id_set(&self) -> Result<SeriesIdSet>;
    /// Series IDs this file tombstones.
    fn tombstone_series_id_set(&self) -> Result<SeriesIdSet>;
}

#[derive(Clone)]
pub struct FileSet {
    files: Vec<Arc<dyn File>>,
    series_file: Arc<SeriesFile>,
}

impl FileSet {
    /// `files` must be ordered newest first.
    pub fn new(series_file: Arc<SeriesFile>, files: Vec<Arc<dyn File>>) -> FileSet {
        FileSet { files, series_file }
    }

    pub fn files(&self) -> &[Arc<dyn File>] {
        &self.files
    }

    pub fn series_file(&self) -> &Arc<SeriesFile> {
        &self.series_file
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Live measurements across all files, name-ordered.
    pub fn measurement_iterator(&self) -> Result<MergeElemIterator<MeasurementElem>> {
        let mut itrs = Vec::with_capacity(self.files.len());
        for file in &self.files {
            itrs.push(file.measurement_iterator()?);
        }
        MergeElemIterator::new(itrs)
    }

    /// Live tag keys under a measurement, key-ordered.
    pub fn tag_key_iterator(&self, name: &[u8]) -> Result<MergeElemIterator<TagKeyElem>> {
        let mut itrs = Vec::new();
        for file in &self.files {
            if let Some(itr) = file.tag_key_iterator(name)? {
                itrs.push(itr);
            }
        }
        MergeElemIterator::new(itrs)
    }

    /// Live values under a measurement's tag key, value-ordered.
    pub fn tag_value_iterator(
        &self,
        name: &[u8],
        key: &[u8],
    ) -> Result<MergeElemIterator<TagValueElem>> {
        let mut itrs = Vec::new();
        for file in &self.files {
            if let Some(itr) = file.tag_value_iterator(name, key)? {
                itrs.push(itr);
            }
        }
        MergeElemIterator::new(itrs)
    }

    /// Live series IDs under a measurement.
    pub fn measurement_series_id_set(&self, name: &[u8]) -> Result<SeriesIdSet> {
        let mut ids = SeriesIdSet::default();
        for file in &self.files {
            if let Some(postings) = file.measurement_series_ids(name)? {
                ids.union_with(&postings.ids);
                if postings.tombstoned {
                    break;
                }
            }
        }
        self.filter_tombstones(ids)
    }

    pub fn measurement_series_id_iterator(&self, name: &[u8]) -> Result<SeriesIdSetIterator> {
        Ok(SeriesIdSetIterator::new(
            self.measurement_series_id_set(name)?,
        ))
    }

    /// Live series IDs under one tag value.
    pub fn tag_value_series_id_set(
        &self,
        name: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Result<SeriesIdSet> {
        let mut ids = SeriesIdSet::default();
        for file in &self.files {
            if let Some(postings) = file.tag_value_series_ids(name, key, value)? {
                ids.union_with(&postings.ids);
                if postings.tombstoned {
                    break;
                }
            }
        }
        self.filter_tombstones(ids)
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

    /// Every live series ID in the set's files.
    pub fn series_id_set(&self) -> Result<SeriesIdSet> {
        let mut ids = SeriesIdSet::default();
        for file in &self.files {
            ids.union_with(&file.series_id_set()?);
        }
        self.filter_tombstones(ids)
    }

    pub fn series_id_iterator(&self) -> Result<SeriesIdSetIterator> {
        Ok(SeriesIdSetIterator::new(self.series_id_set()?))
    }

    /// Union of every file's tombstoned series IDs.
    pub fn tombstone_series_id_set(&self) -> Result<SeriesIdSet> {
        let mut ids = SeriesIdSet::default();
        for file in &self.files {
            ids.union_with(&file.tombstone_series_id_set()?);
        }
        Ok(ids)
    }

    /// IDs are never reissued, so a tombstone in any file or in the series
    /// file is final regardless of which file contributed the ID.
    fn filter_tombstones(&self, mut ids: SeriesIdSet) -> Result<SeriesIdSet> {
        for file in &self.files {
            ids.difference_with(&file.tombstone_series_id_set()?);
        }
        ids.difference_with(&self.series_file.tombstone_series_id_set()?);
        Ok(ids)
    }
}
