use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{CardScanError, Result};
use crate::media::{MediaFile, guess_mime_type};

use super::{Availability, FileCursor, StorageCapability, StorageChange};

const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;

struct Entry {
    file: MediaFile,
    content: Bytes,
}

/// A card held entirely in memory.
///
/// `insert_file`/`remove_file` change the contents silently, the way a
/// desktop computer writing to the card does. The `StorageCapability`
/// methods emit change events like a live medium would.
pub struct MemoryStorage {
    files: RwLock<BTreeMap<String, Entry>>,
    availability: RwLock<Availability>,
    capacity: u64,
    clock: AtomicI64,
    signal: broadcast::Sender<StorageChange>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: u64) -> Self {
        let (signal, _) = broadcast::channel(64);
        Self {
            files: RwLock::new(BTreeMap::new()),
            availability: RwLock::new(Availability::Available),
            capacity,
            clock: AtomicI64::new(1),
            signal,
        }
    }

    /// Places a file on the card without emitting a change event.
    pub fn insert_file(&self, file: MediaFile, content: impl Into<Bytes>) {
        self.clock.fetch_max(file.date + 1, Ordering::Relaxed);
        let content = content.into();
        self.files
            .write()
            .insert(file.name.clone(), Entry { file, content });
    }

    /// Convenience for tests: a file of `size` zero bytes.
    pub fn insert(&self, name: &str, size: u64, date: i64) {
        let file = MediaFile::new(name, guess_mime_type(name), size, date);
        self.insert_file(file, vec![0u8; size as usize]);
    }

    /// Removes a file without emitting a change event.
    pub fn remove_file(&self, name: &str) -> bool {
        self.files.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }

    /// Changes availability and broadcasts the transition.
    pub fn set_availability(&self, availability: Availability) {
        *self.availability.write() = availability;
        let change = match availability {
            Availability::Available => StorageChange::Available,
            Availability::Unavailable => StorageChange::Unavailable,
            Availability::Shared => StorageChange::Shared,
        };
        self.emit(change);
    }

    /// Broadcasts an arbitrary change, e.g. to replay a missed event.
    pub fn emit(&self, change: StorageChange) {
        trace!("memory storage change: {:?}", change);
        let _ = self.signal.send(change);
    }

    fn ensure_available(&self) -> Result<()> {
        match *self.availability.read() {
            Availability::Available => Ok(()),
            Availability::Unavailable => Err(CardScanError::Storage("no card present".into())),
            Availability::Shared => Err(CardScanError::Storage("card is shared".into())),
        }
    }

    fn used(&self) -> u64 {
        self.files.read().values().map(|entry| entry.file.size).sum()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageCapability for MemoryStorage {
    async fn enumerate(&self, directory: &str, since: Option<i64>) -> Result<FileCursor> {
        self.ensure_available()?;
        let files = self
            .files
            .read()
            .values()
            .filter(|entry| entry.file.name.starts_with(directory))
            .filter(|entry| since.is_none_or(|since| entry.file.date >= since))
            .map(|entry| entry.file.clone())
            .collect();
        Ok(FileCursor::from_files(files))
    }

    async fn get(&self, name: &str) -> Result<MediaFile> {
        self.ensure_available()?;
        self.files
            .read()
            .get(name)
            .map(|entry| entry.file.clone())
            .ok_or_else(|| CardScanError::NotFound(name.to_owned()))
    }

    async fn read(&self, name: &str) -> Result<Bytes> {
        self.ensure_available()?;
        self.files
            .read()
            .get(name)
            .map(|entry| entry.content.clone())
            .ok_or_else(|| CardScanError::NotFound(name.to_owned()))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.ensure_available()?;
        if self.files.write().remove(name).is_none() {
            return Err(CardScanError::NotFound(name.to_owned()));
        }
        self.emit(StorageChange::Deleted(name.to_owned()));
        Ok(())
    }

    async fn add_named(&self, blob: Bytes, name: &str) -> Result<()> {
        self.ensure_available()?;
        let size = blob.len() as u64;
        if self.used() + size > self.capacity {
            return Err(CardScanError::Storage(format!("no space left for {name}")));
        }
        let date = self.clock.fetch_add(1, Ordering::Relaxed);
        {
            let mut files = self.files.write();
            if files.contains_key(name) {
                return Err(CardScanError::Storage(format!("{name} already exists")));
            }
            let file = MediaFile::new(name, guess_mime_type(name), size, date);
            files.insert(name.to_owned(), Entry { file, content: blob });
        }
        self.emit(StorageChange::Modified(name.to_owned()));
        Ok(())
    }

    async fn free_space(&self) -> Result<u64> {
        self.ensure_available()?;
        Ok(self.capacity.saturating_sub(self.used()))
    }

    async fn available(&self) -> Result<Availability> {
        Ok(*self.availability.read())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.signal.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enumerate_filters_directory_and_since() {
        let storage = MemoryStorage::new();
        storage.insert("DCIM/a.jpg", 1, 100);
        storage.insert("DCIM/b.jpg", 1, 200);
        storage.insert("other/c.jpg", 1, 300);

        let mut cursor = storage.enumerate("DCIM/", Some(150)).await.unwrap();
        let first = cursor.next().await.unwrap().unwrap();
        assert_eq!(first.name, "DCIM/b.jpg");
        assert!(cursor.next().await.is_none());

        let mut all = storage.enumerate("", None).await.unwrap();
        let mut count = 0;
        while all.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn writes_emit_change_events() {
        let storage = MemoryStorage::new();
        let mut rx = storage.subscribe();

        storage
            .add_named(Bytes::from_static(b"jpeg"), "new.jpg")
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            StorageChange::Modified("new.jpg".into())
        );
        assert_eq!(storage.get("new.jpg").await.unwrap().mime_type, "image/jpeg");

        storage.delete("new.jpg").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            StorageChange::Deleted("new.jpg".into())
        );
        assert!(storage.get("new.jpg").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unavailable_card_rejects_io_but_answers_probe() {
        let storage = MemoryStorage::new();
        storage.insert("a.jpg", 1, 1);
        storage.set_availability(Availability::Shared);

        assert_eq!(storage.available().await.unwrap(), Availability::Shared);
        let err = storage.get("a.jpg").await.unwrap_err();
        assert!(matches!(err, CardScanError::Storage(_)));
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn free_space_tracks_usage() {
        let storage = MemoryStorage::with_capacity(10);
        storage.insert("a.jpg", 4, 1);
        assert_eq!(storage.free_space().await.unwrap(), 6);
        let err = storage
            .add_named(Bytes::from(vec![0u8; 7]), "b.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, CardScanError::Storage(_)));
    }
}
