use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;
use crate::media::MediaFile;

mod memory;
pub use memory::MemoryStorage;

/// Buffer between an enumerating producer and the scanner.
pub const CURSOR_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Available,
    Unavailable,
    /// Mounted by another party, e.g. a host PC over USB mass storage.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageChange {
    Available,
    Unavailable,
    Shared,
    Modified(String),
    Deleted(String),
}

/// Asynchronous cursor over an enumeration.
pub struct FileCursor {
    rx: mpsc::Receiver<Result<MediaFile>>,
}

impl FileCursor {
    /// Returns the producer half along with the cursor. Enumeration ends when
    /// every sender is dropped.
    pub fn channel() -> (mpsc::Sender<Result<MediaFile>>, Self) {
        let (tx, rx) = mpsc::channel(CURSOR_CAPACITY);
        (tx, Self { rx })
    }

    /// A cursor over an already materialized listing.
    pub fn from_files(files: Vec<MediaFile>) -> Self {
        let (tx, rx) = mpsc::channel(files.len().max(1));
        for file in files {
            // capacity covers every file, so this never fails
            let _ = tx.try_send(Ok(file));
        }
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Result<MediaFile>> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for FileCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCursor").finish_non_exhaustive()
    }
}

/// Access to one removable medium.
#[async_trait]
pub trait StorageCapability: Send + Sync {
    /// Files under `directory`, optionally only those modified at or after
    /// `since` (epoch milliseconds).
    async fn enumerate(&self, directory: &str, since: Option<i64>) -> Result<FileCursor>;
    async fn get(&self, name: &str) -> Result<MediaFile>;
    async fn read(&self, name: &str) -> Result<Bytes>;
    async fn delete(&self, name: &str) -> Result<()>;
    async fn add_named(&self, blob: Bytes, name: &str) -> Result<()>;
    async fn free_space(&self) -> Result<u64>;
    async fn available(&self) -> Result<Availability>;
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}
