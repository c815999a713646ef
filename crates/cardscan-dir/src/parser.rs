use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use cardscan_core::prelude::*;
use image::{DynamicImage, ImageFormat};
use tracing::trace;

/// Longest edge of generated thumbnails, in pixels.
pub const THUMBNAIL_EDGE: u32 = 120;

/// Decodes still images for their dimensions and a small JPEG thumbnail.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageParser;

impl ImageParser {
    fn extract(data: &[u8]) -> Result<MediaMetadata> {
        let image = image::load_from_memory(data)
            .map_err(|err| CardScanError::Parse(format!("undecodable image: {err}")))?;
        let (width, height) = (image.width(), image.height());

        let thumbnail = DynamicImage::ImageRgb8(
            image.thumbnail(THUMBNAIL_EDGE, THUMBNAIL_EDGE).to_rgb8(),
        );
        let mut encoded = Vec::new();
        thumbnail
            .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Jpeg)
            .map_err(|err| CardScanError::Parse(format!("thumbnail encoding failed: {err}")))?;

        Ok(MediaMetadata::default()
            .with_field("width", MetaValue::Number(width.into()))
            .with_field("height", MetaValue::Number(height.into()))
            .with_thumbnail(encoded))
    }
}

#[async_trait]
impl MetadataParser for ImageParser {
    async fn parse(&self, file: &MediaFile, storage: &dyn StorageCapability) -> Result<MediaMetadata> {
        let data: Bytes = storage.read(&file.name).await?;
        trace!("decoding {} ({} bytes)", file.name, data.len());
        tokio::task::spawn_blocking(move || Self::extract(&data))
            .await
            .map_err(|err| CardScanError::Parse(format!("decoder task failed: {err}")))?
    }
}

/// Video metadata without decoding: the container type and a fixed rotation.
#[derive(Debug, Default, Clone, Copy)]
pub struct VideoParser;

#[async_trait]
impl MetadataParser for VideoParser {
    async fn parse(&self, file: &MediaFile, _storage: &dyn StorageCapability) -> Result<MediaMetadata> {
        if !file.mime_type.starts_with("video/") {
            return Err(CardScanError::Parse(format!(
                "{} is not a video ({})",
                file.name, file.mime_type
            )));
        }
        Ok(MediaMetadata::default()
            .with_field("container", MetaValue::Text(file.mime_type.clone()))
            .with_field("rotation", MetaValue::Number(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([200, 30, 30]));
        let mut data = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
            .unwrap();
        data
    }

    #[tokio::test]
    async fn image_parser_reads_dimensions_and_thumbnails() {
        let storage = MemoryStorage::new();
        let data = png(400, 200);
        let file = MediaFile::new("DCIM/wide.png", "image/png", data.len() as u64, 1);
        storage.insert_file(file.clone(), data);

        let metadata = ImageParser.parse(&file, &storage).await.unwrap();
        assert_eq!(metadata.get("width"), Some(&MetaValue::Number(400)));
        assert_eq!(metadata.get("height"), Some(&MetaValue::Number(200)));

        let thumbnail = metadata.thumbnail.unwrap();
        let decoded = image::load_from_memory_with_format(&thumbnail, ImageFormat::Jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (120, 60));
    }

    #[tokio::test]
    async fn image_parser_rejects_garbage() {
        let storage = MemoryStorage::new();
        let file = MediaFile::new("bad.jpg", "image/jpeg", 4, 1);
        storage.insert_file(file.clone(), Bytes::from_static(b"nope"));
        assert!(matches!(
            ImageParser.parse(&file, &storage).await,
            Err(CardScanError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn video_parser_records_container() {
        let storage = MemoryStorage::new();
        let clip = MediaFile::new("clip.webm", "video/webm", 1, 1);
        let metadata = VideoParser.parse(&clip, &storage).await.unwrap();
        assert_eq!(
            metadata.get("container"),
            Some(&MetaValue::Text("video/webm".into()))
        );
        assert_eq!(metadata.get("rotation"), Some(&MetaValue::Number(0)));

        let still = MediaFile::new("a.jpg", "image/jpeg", 1, 1);
        assert!(VideoParser.parse(&still, &storage).await.is_err());
    }
}
