use async_trait::async_trait;

use crate::error::Result;
use crate::media::{MediaFile, MediaMetadata};
use crate::storage::StorageCapability;

/// Extracts metadata for one media kind.
///
/// An `Err` means the file is malformed for this kind. The scanner drops it
/// without recording it, and it stays dropped until it changes on storage.
#[async_trait]
pub trait MetadataParser: Send + Sync {
    async fn parse(&self, file: &MediaFile, storage: &dyn StorageCapability) -> Result<MediaMetadata>;
}

/// Accepts every file with empty metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughParser;

#[async_trait]
impl MetadataParser for PassthroughParser {
    async fn parse(&self, _file: &MediaFile, _storage: &dyn StorageCapability) -> Result<MediaMetadata> {
        Ok(MediaMetadata::default())
    }
}
