use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use cardscan_core::prelude::*;
use cardscan_core::guess_mime_type;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// A directory standing in for a removable card.
///
/// File names are paths relative to the root with `/` separators. A missing
/// root reads as "no card"; [`DirectoryStorage::set_shared`] simulates a host
/// PC holding the card over USB mass storage.
pub struct DirectoryStorage {
    root: PathBuf,
    capacity: u64,
    shared: AtomicBool,
    signal: broadcast::Sender<StorageChange>,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>, capacity: u64) -> Self {
        let (signal, _) = broadcast::channel(256);
        Self {
            root: root.into(),
            capacity,
            shared: AtomicBool::new(false),
            signal,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_shared(&self, shared: bool) {
        if self.shared.swap(shared, Ordering::AcqRel) == shared {
            return;
        }
        let change = if shared {
            StorageChange::Shared
        } else {
            StorageChange::Available
        };
        debug!("{} is now {:?}", self.root.display(), change);
        let _ = self.signal.send(change);
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(CardScanError::Storage(format!("invalid file name: {name}")));
        }
        Ok(self.root.join(name))
    }

    fn ensure_accessible(&self) -> Result<()> {
        if self.shared.load(Ordering::Acquire) {
            return Err(CardScanError::Storage("card is shared with a host".into()));
        }
        Ok(())
    }

    async fn used(&self) -> Result<u64> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            WalkDir::new(&root)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| entry.metadata().ok())
                .map(|meta| meta.len())
                .sum::<u64>()
        })
        .await
        .map_err(|err| CardScanError::Storage(format!("usage walk failed: {err}")))
    }
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect();
    Some(parts?.join("/"))
}

fn epoch_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        Err(err) => -(err.duration().as_millis() as i64),
    }
}

fn describe(name: &str, meta: &std::fs::Metadata) -> Result<MediaFile> {
    let date = epoch_millis(meta.modified()?);
    Ok(MediaFile::new(name, guess_mime_type(name), meta.len(), date))
}

fn map_io(name: &str, err: io::Error) -> CardScanError {
    if err.kind() == io::ErrorKind::NotFound {
        CardScanError::NotFound(name.to_owned())
    } else {
        CardScanError::Io(err)
    }
}

#[async_trait]
impl StorageCapability for DirectoryStorage {
    async fn enumerate(&self, directory: &str, since: Option<i64>) -> Result<FileCursor> {
        self.ensure_accessible()?;
        if !tokio::fs::try_exists(&self.root).await? {
            return Err(CardScanError::Storage(format!(
                "{} is not present",
                self.root.display()
            )));
        }

        let (tx, cursor) = FileCursor::channel();
        let root = self.root.clone();
        let directory = directory.to_owned();
        tokio::task::spawn_blocking(move || {
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        let _ = tx.blocking_send(Err(CardScanError::Storage(err.to_string())));
                        return;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(name) = relative_name(&root, entry.path()) else {
                    trace!("skipping non-utf8 path {}", entry.path().display());
                    continue;
                };
                if !name.starts_with(&directory) {
                    continue;
                }
                let file = match entry
                    .metadata()
                    .map_err(|err| CardScanError::Storage(err.to_string()))
                    .and_then(|meta| describe(&name, &meta))
                {
                    Ok(file) => file,
                    Err(err) => {
                        warn!("cannot stat {}: {}", name, err);
                        continue;
                    }
                };
                if since.is_some_and(|since| file.date < since) {
                    continue;
                }
                if tx.blocking_send(Ok(file)).is_err() {
                    return;
                }
            }
        });
        Ok(cursor)
    }

    async fn get(&self, name: &str) -> Result<MediaFile> {
        self.ensure_accessible()?;
        let path = self.path_of(name)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|err| map_io(name, err))?;
        if !meta.is_file() {
            return Err(CardScanError::NotFound(name.to_owned()));
        }
        describe(name, &meta)
    }

    async fn read(&self, name: &str) -> Result<Bytes> {
        self.ensure_accessible()?;
        let path = self.path_of(name)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|err| map_io(name, err))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.ensure_accessible()?;
        let path = self.path_of(name)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|err| map_io(name, err))?;
        let _ = self.signal.send(StorageChange::Deleted(name.to_owned()));
        Ok(())
    }

    async fn add_named(&self, blob: Bytes, name: &str) -> Result<()> {
        self.ensure_accessible()?;
        let path = self.path_of(name)?;
        if tokio::fs::try_exists(&path).await? {
            return Err(CardScanError::Storage(format!("{name} already exists")));
        }
        let free = self.capacity.saturating_sub(self.used().await?);
        if blob.len() as u64 > free {
            return Err(CardScanError::Storage(format!(
                "{name} needs {} bytes, {free} free",
                blob.len()
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &blob).await?;
        let _ = self.signal.send(StorageChange::Modified(name.to_owned()));
        Ok(())
    }

    async fn free_space(&self) -> Result<u64> {
        self.ensure_accessible()?;
        Ok(self.capacity.saturating_sub(self.used().await?))
    }

    async fn available(&self) -> Result<Availability> {
        if self.shared.load(Ordering::Acquire) {
            return Ok(Availability::Shared);
        }
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(Availability::Available),
            Ok(_) => Ok(Availability::Unavailable),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Availability::Unavailable),
            Err(err) => Err(err.into()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.signal.subscribe()
    }
}
