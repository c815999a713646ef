//! On-card index file.
//!
//! Layout: `(u32 LE length, thumbnail bytes)*`, a zero length terminator,
//! then a UTF-8 JSON array of records. Thumbnail frames attach to records by
//! position, so only a leading run of records can carry one.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ScannerConfig;
use crate::error::{CardScanError, Result};
use crate::media::FileRecord;
use crate::model::MediaIndex;
use crate::storage::StorageCapability;

/// Root of the scanner's private area on the card.
pub const INDEX_ROOT: &str = ".cardscan";
/// Suffix of standalone thumbnail blobs. Not a media extension.
pub const THUMBNAIL_SUFFIX: &str = ".thumb";
/// Upper bound on a single thumbnail frame.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

pub fn encode(frames: &[Bytes], records: &[FileRecord]) -> Result<Bytes> {
    let json = serde_json::to_vec(records)
        .map_err(|err| CardScanError::Index(format!("failed to serialize records: {err}")))?;
    let framed: usize = frames.iter().map(|frame| frame.len() + 4).sum();
    let mut buf = BytesMut::with_capacity(framed + 4 + json.len());
    for frame in frames {
        let len = u32::try_from(frame.len())
            .map_err(|_| CardScanError::Index(format!("frame of {} bytes", frame.len())))?;
        buf.put_u32_le(len);
        buf.put_slice(frame);
    }
    buf.put_u32_le(0);
    buf.put_slice(&json);
    Ok(buf.freeze())
}

/// Decodes an index file, attaching each frame to the record at the same
/// position. Decoded records are flagged `persisted`.
pub fn decode(mut data: Bytes) -> Result<Vec<FileRecord>> {
    let mut frames = Vec::new();
    loop {
        if data.remaining() < 4 {
            return Err(CardScanError::Index("truncated frame header".into()));
        }
        let len = data.get_u32_le() as usize;
        if len == 0 {
            break;
        }
        if len > MAX_FRAME_LEN {
            return Err(CardScanError::Index(format!("oversize frame of {len} bytes")));
        }
        if len > data.remaining() {
            return Err(CardScanError::Index(format!(
                "frame of {len} bytes overruns {} remaining",
                data.remaining()
            )));
        }
        frames.push(data.split_to(len));
    }

    let mut records: Vec<FileRecord> = serde_json::from_slice(&data)
        .map_err(|err| CardScanError::Index(format!("malformed record list: {err}")))?;
    if frames.len() > records.len() {
        return Err(CardScanError::Index(format!(
            "{} frames for {} records",
            frames.len(),
            records.len()
        )));
    }
    for (record, frame) in records.iter_mut().zip(frames) {
        record.metadata.thumbnail = Some(frame);
    }
    for record in &mut records {
        record.persisted = true;
    }
    Ok(records)
}

/// Reads and writes the index and thumbnail blobs through one storage.
pub struct IndexPersistence {
    storage: Arc<dyn StorageCapability>,
    index_path: String,
    thumbnail_dir: String,
    page_size: usize,
    save_lock: tokio::sync::Mutex<()>,
}

impl IndexPersistence {
    pub fn new(config: &ScannerConfig, storage: Arc<dyn StorageCapability>) -> Self {
        let base = format!("{INDEX_ROOT}/{}", config.name);
        Self {
            storage,
            index_path: format!("{base}/index.v{}", config.version),
            thumbnail_dir: format!("{base}/thumbnails"),
            page_size: config.page_size,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn index_path(&self) -> &str {
        &self.index_path
    }

    pub fn thumbnail_path(&self, name: &str) -> String {
        format!("{}/{}{}", self.thumbnail_dir, name, THUMBNAIL_SUFFIX)
    }

    /// Loads the persisted model. Any failure yields an empty model, which
    /// the next scan rebuilds.
    pub async fn load(&self) -> MediaIndex {
        let data = match self.storage.read(&self.index_path).await {
            Ok(data) => data,
            Err(err) if err.is_not_found() => {
                debug!("no index at {}", self.index_path);
                return MediaIndex::new();
            }
            Err(err) => {
                warn!("failed to read index {}: {}", self.index_path, err);
                return MediaIndex::new();
            }
        };
        match decode(data).and_then(MediaIndex::from_sorted) {
            Ok(model) => {
                info!("loaded {} records from {}", model.len(), self.index_path);
                model
            }
            Err(err) => {
                warn!("discarding corrupt index {}: {}", self.index_path, err);
                MediaIndex::new()
            }
        }
    }

    /// Writes the model if it changed since the last save. Returns whether a
    /// write happened.
    pub async fn save(&self, model: &Mutex<MediaIndex>) -> Result<bool> {
        let _guard = self.save_lock.lock().await;
        let records = {
            let mut model = model.lock();
            if !model.take_dirty() {
                return Ok(false);
            }
            model.files().to_vec()
        };

        match self.write(&records).await {
            Ok(offloaded) => {
                settle(&mut model.lock(), &records, &offloaded);
                debug!("saved {} records to {}", records.len(), self.index_path);
                Ok(true)
            }
            Err(err) => {
                model.lock().mark_dirty();
                error!("failed to save index {}: {}", self.index_path, err);
                Err(err)
            }
        }
    }

    /// Returns the records whose thumbnails moved out to blobs.
    async fn write<'a>(&self, records: &'a [FileRecord]) -> Result<Vec<&'a FileRecord>> {
        let mut frames = Vec::new();
        for record in records.iter().take(self.page_size) {
            let thumbnail = match &record.metadata.thumbnail {
                Some(thumbnail) => Some(thumbnail.clone()),
                None if record.persisted => self.read_thumbnail(&record.name).await,
                None => None,
            };
            match thumbnail {
                Some(thumbnail) => frames.push(thumbnail),
                None => break,
            }
        }

        // everything past the frame run, including first-page records after a gap
        let mut offloaded = Vec::new();
        for record in records.iter().skip(frames.len()) {
            let Some(thumbnail) = &record.metadata.thumbnail else {
                continue;
            };
            let path = self.thumbnail_path(&record.name);
            let _ = self.storage.delete(&path).await;
            match self.storage.add_named(thumbnail.clone(), &path).await {
                Ok(()) => offloaded.push(record),
                Err(err) => warn!("failed to write thumbnail {}: {}", path, err),
            }
        }

        // thumbnails never reach the JSON, framed or not
        let data = encode(&frames, records)?;

        match self.storage.delete(&self.index_path).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        self.storage.add_named(data, &self.index_path).await?;
        Ok(offloaded)
    }

    pub async fn read_thumbnail(&self, name: &str) -> Option<Bytes> {
        let path = self.thumbnail_path(name);
        match self.storage.read(&path).await {
            Ok(data) => Some(data),
            Err(err) => {
                debug!("no thumbnail blob {}: {}", path, err);
                None
            }
        }
    }

    pub async fn discard_thumbnail(&self, name: &str) {
        let path = self.thumbnail_path(name);
        if let Err(err) = self.storage.delete(&path).await {
            if !err.is_not_found() {
                warn!("failed to delete thumbnail {}: {}", path, err);
            }
        }
    }
}

/// Applies a finished write to the live model. Records replaced while the
/// write was in flight are left alone.
fn settle(model: &mut MediaIndex, written: &[FileRecord], offloaded: &[&FileRecord]) {
    for record in written {
        model.mark_persisted(record);
    }
    for record in offloaded {
        model.evict_thumbnail(record);
    }
}
