use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{CardScanError, Result};
use crate::media::{FileRecord, MediaKind};

/// Result of [`MediaIndex::insert`].
#[derive(Debug, Clone, PartialEq)]
pub struct Inserted {
    pub position: usize,
    /// A record of the same name that was removed first, with its former
    /// position.
    pub replaced: Option<(usize, FileRecord)>,
}

/// Ordered file list plus name index.
///
/// Records are sorted by `date`, newest first. Records sharing a date keep
/// their insertion order. The name index maps each name to its record's date,
/// which is enough to binary search back to its position.
#[derive(Debug, Default)]
pub struct MediaIndex {
    files: Vec<FileRecord>,
    dates: HashMap<String, i64>,
    dirty: bool,
}

impl MediaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index from a list that must already be in order with unique
    /// names, as decoded from a persisted index.
    pub fn from_sorted(files: Vec<FileRecord>) -> Result<Self> {
        let mut dates = HashMap::with_capacity(files.len());
        for (idx, record) in files.iter().enumerate() {
            if idx > 0 && files[idx - 1].date < record.date {
                return Err(CardScanError::Index(format!(
                    "records out of order at {}: {}",
                    idx, record.name
                )));
            }
            if dates.insert(record.name.clone(), record.date).is_some() {
                return Err(CardScanError::Index(format!(
                    "duplicate record name: {}",
                    record.name
                )));
            }
        }
        Ok(Self {
            files,
            dates,
            dirty: false,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[FileRecord] {
        &self.files
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dates.contains_key(name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        let date = *self.dates.get(name)?;
        let start = self.files.partition_point(|record| record.date > date);
        self.files[start..]
            .iter()
            .take_while(|record| record.date == date)
            .position(|record| record.name == name)
            .map(|offset| start + offset)
    }

    pub fn get(&self, name: &str) -> Option<&FileRecord> {
        self.position(name).map(|idx| &self.files[idx])
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut FileRecord> {
        let idx = self.position(name)?;
        Some(&mut self.files[idx])
    }

    /// Inserts `record`, removing any record of the same name first.
    pub fn insert(&mut self, record: FileRecord) -> Inserted {
        let replaced = self.remove(&record.name);
        let position = if self
            .files
            .first()
            .is_none_or(|newest| record.date > newest.date)
        {
            0
        } else {
            self.files.partition_point(|existing| existing.date >= record.date)
        };
        self.dates.insert(record.name.clone(), record.date);
        self.files.insert(position, record);
        self.dirty = true;
        Inserted { position, replaced }
    }

    /// Removes the named record, returning its former position.
    pub fn remove(&mut self, name: &str) -> Option<(usize, FileRecord)> {
        let idx = self.position(name)?;
        self.dates.remove(name);
        let record = self.files.remove(idx);
        self.dirty = true;
        Some((idx, record))
    }

    pub fn newest_date(&self, kind: &MediaKind) -> Option<i64> {
        self.files
            .iter()
            .find(|record| &record.kind == kind)
            .map(|record| record.date)
    }

    /// Flags every record of `kind` as awaiting verification.
    pub fn mark_unverified(&mut self, kind: &MediaKind) {
        for record in self.files.iter_mut().filter(|record| &record.kind == kind) {
            record.unverified = true;
        }
    }

    /// Names of the still-unverified records of `kind`, in list order.
    pub fn unverified_names(&self, kind: &MediaKind) -> Vec<String> {
        self.files
            .iter()
            .filter(|record| &record.kind == kind && record.unverified)
            .map(|record| record.name.clone())
            .collect()
    }

    pub fn set_verified(&mut self, name: &str) {
        if let Some(record) = self.get_mut(name) {
            record.unverified = false;
        }
    }

    /// Records of `kind`, sorted by name.
    pub fn files_of_kind(&self, kind: &MediaKind) -> Vec<FileRecord> {
        let mut files: Vec<FileRecord> = self
            .files
            .iter()
            .filter(|record| &record.kind == kind)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    pub fn thumbnail(&self, name: &str) -> Option<Bytes> {
        self.get(name)
            .and_then(|record| record.metadata.thumbnail.clone())
    }

    /// The live record of `snapshot`'s name, if it is still the same version.
    fn current_mut(&mut self, snapshot: &FileRecord) -> Option<&mut FileRecord> {
        self.get_mut(&snapshot.name)
            .filter(|record| record.size == snapshot.size && record.date == snapshot.date)
    }

    /// Drops an in-memory thumbnail that now lives in its own blob. A record
    /// replaced since `snapshot` was taken keeps its thumbnail.
    pub fn evict_thumbnail(&mut self, snapshot: &FileRecord) -> bool {
        match self.current_mut(snapshot) {
            Some(record) => {
                record.metadata.thumbnail = None;
                true
            }
            None => false,
        }
    }

    /// Flags the record as durably written if it is still the version in
    /// `snapshot`.
    pub fn mark_persisted(&mut self, snapshot: &FileRecord) -> bool {
        match self.current_mut(snapshot) {
            Some(record) => {
                record.persisted = true;
                true
            }
            None => false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clears the dirty flag, returning whether it was set.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> std::result::Result<(), String> {
        for pair in self.files.windows(2) {
            if pair[0].date < pair[1].date {
                return Err(format!("{} sorts before newer {}", pair[0].name, pair[1].name));
            }
        }
        if self.dates.len() != self.files.len() {
            return Err(format!(
                "name index has {} keys for {} records",
                self.dates.len(),
                self.files.len()
            ));
        }
        for record in &self.files {
            if self.dates.get(&record.name) != Some(&record.date) {
                return Err(format!("name index out of sync for {}", record.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaFile, MediaMetadata};
    use proptest::prelude::*;

    fn record(name: &str, date: i64) -> FileRecord {
        FileRecord::new(
            MediaKind::from("pictures"),
            MediaFile::new(name, "image/jpeg", 1, date),
            MediaMetadata::default(),
        )
    }

    fn names(index: &MediaIndex) -> Vec<&str> {
        index.files().iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn insert_keeps_newest_first() {
        let mut index = MediaIndex::new();
        assert_eq!(index.insert(record("b", 200)).position, 0);
        assert_eq!(index.insert(record("c", 300)).position, 0);
        assert_eq!(index.insert(record("a", 100)).position, 2);
        assert_eq!(names(&index), vec!["c", "b", "a"]);
        assert!(index.is_dirty());
        index.check_invariants().unwrap();
    }

    #[test]
    fn equal_dates_keep_insertion_order() {
        let mut index = MediaIndex::new();
        index.insert(record("first", 100));
        index.insert(record("second", 100));
        index.insert(record("third", 100));
        assert_eq!(names(&index), vec!["first", "second", "third"]);
        assert_eq!(index.position("second"), Some(1));
        assert_eq!(index.position("third"), Some(2));
    }

    #[test]
    fn insert_replaces_same_name() {
        let mut index = MediaIndex::new();
        index.insert(record("a", 100));
        index.insert(record("b", 50));
        let outcome = index.insert(record("b", 150));
        assert_eq!(outcome.position, 0);
        let (old_pos, old) = outcome.replaced.unwrap();
        assert_eq!(old_pos, 1);
        assert_eq!(old.date, 50);
        assert_eq!(index.len(), 2);
        index.check_invariants().unwrap();
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut index = MediaIndex::new();
        index.insert(record("a", 100));
        index.take_dirty();
        assert!(index.remove("missing").is_none());
        assert!(!index.is_dirty());
        assert_eq!(index.remove("a").map(|(pos, _)| pos), Some(0));
        assert!(index.is_empty());
    }

    #[test]
    fn from_sorted_rejects_bad_lists() {
        assert!(MediaIndex::from_sorted(vec![record("a", 1), record("b", 2)]).is_err());
        assert!(MediaIndex::from_sorted(vec![record("a", 2), record("a", 1)]).is_err());
        let index = MediaIndex::from_sorted(vec![record("a", 2), record("b", 2)]).unwrap();
        assert!(!index.is_dirty());
        assert_eq!(index.position("b"), Some(1));
    }

    #[test]
    fn verification_flags_follow_kind_and_order() {
        let mut index = MediaIndex::new();
        index.insert(record("old", 100));
        index.insert(record("new", 200));
        let mut video = record("clip.mp4", 150);
        video.kind = MediaKind::from("videos");
        index.insert(video);

        let pictures = MediaKind::from("pictures");
        index.mark_unverified(&pictures);
        assert_eq!(index.unverified_names(&pictures), vec!["new", "old"]);
        assert!(index.unverified_names(&MediaKind::from("videos")).is_empty());

        index.set_verified("new");
        assert_eq!(index.unverified_names(&pictures), vec!["old"]);
        assert_eq!(index.newest_date(&pictures), Some(200));
        assert_eq!(index.newest_date(&MediaKind::from("videos")), Some(150));
        assert_eq!(index.newest_date(&MediaKind::from("music")), None);
    }

    #[test]
    fn files_of_kind_sorted_by_name() {
        let mut index = MediaIndex::new();
        index.insert(record("b", 300));
        index.insert(record("c", 100));
        index.insert(record("a", 200));
        let listed: Vec<String> = index
            .files_of_kind(&MediaKind::from("pictures"))
            .into_iter()
            .map(|record| record.name)
            .collect();
        assert_eq!(listed, vec!["a", "b", "c"]);
    }

    #[test]
    fn eviction_skips_replaced_records() {
        let mut index = MediaIndex::new();
        let mut old = record("a", 100);
        old.metadata = old.metadata.with_thumbnail(Bytes::from_static(b"old"));
        index.insert(old.clone());
        let mut newer = record("a", 200);
        newer.metadata = newer.metadata.with_thumbnail(Bytes::from_static(b"new"));
        index.insert(newer);

        assert!(!index.evict_thumbnail(&old));
        assert!(!index.mark_persisted(&old));
        assert_eq!(index.thumbnail("a").as_deref(), Some(&b"new"[..]));
        assert!(!index.get("a").unwrap().persisted);

        let current = index.get("a").unwrap().clone();
        assert!(index.mark_persisted(&current));
        assert!(index.evict_thumbnail(&current));
        assert!(index.thumbnail("a").is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u8, i64),
        Remove(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..12, 0i64..20).prop_map(|(name, date)| Op::Insert(name, date)),
            (0u8..12).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn order_and_uniqueness_hold(ops in prop::collection::vec(op_strategy(), 0..64)) {
            let mut index = MediaIndex::new();
            for op in ops {
                match op {
                    Op::Insert(name, date) => {
                        let outcome = index.insert(record(&format!("f{name}"), date));
                        prop_assert_eq!(index.files()[outcome.position].date, date);
                    }
                    Op::Remove(name) => {
                        index.remove(&format!("f{name}"));
                    }
                }
                prop_assert!(index.check_invariants().is_ok());
            }
        }
    }
}
