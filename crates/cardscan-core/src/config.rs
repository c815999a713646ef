use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::media::MediaKind;
use crate::parser::MetadataParser;
use crate::storage::StorageCapability;

/// Number of records whose thumbnails are framed into the index file.
pub const DEFAULT_PAGE_SIZE: usize = 15;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScannerConfig {
    /// Names the on-card index directory, so it must be a single path segment.
    pub name: String,
    /// Embedded in the index file name; bumping it abandons the old index.
    pub version: u32,
    pub page_size: usize,
    pub scan_mode: ScanMode,
}

impl ScannerConfig {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            ..Self::default()
        }
    }

    pub fn with_scan_mode(mut self, mode: ScanMode) -> Self {
        self.scan_mode = mode;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.name.is_empty() {
            return Err(ConfigValidationError::EmptyName);
        }
        if self.name.contains(['/', '\\']) || self.name.starts_with('.') {
            return Err(ConfigValidationError::InvalidName(self.name.clone()));
        }
        if self.page_size == 0 {
            return Err(ConfigValidationError::ZeroPageSize);
        }
        Ok(())
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            name: "media".into(),
            version: 1,
            page_size: DEFAULT_PAGE_SIZE,
            scan_mode: ScanMode::Incremental,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Enumerate files newer than the newest known one, then verify the rest.
    #[default]
    Incremental,
    /// Enumerate everything and merge-join it against the known files.
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct KindConfig {
    /// Only files under this prefix belong to the kind.
    pub directory: Option<String>,
    /// Allowlist of MIME types; `None` accepts everything.
    pub mime_types: Option<Vec<String>>,
}

impl KindConfig {
    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_mime_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mime_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn directory(&self) -> &str {
        self.directory.as_deref().unwrap_or("")
    }
}

/// Binds a media kind to the storage it lives on and the parser for it.
#[derive(Clone)]
pub struct MediaSource {
    pub kind: MediaKind,
    pub config: KindConfig,
    pub storage: Arc<dyn StorageCapability>,
    pub parser: Arc<dyn MetadataParser>,
}

impl MediaSource {
    pub fn new(
        kind: impl Into<MediaKind>,
        config: KindConfig,
        storage: Arc<dyn StorageCapability>,
        parser: Arc<dyn MetadataParser>,
    ) -> Self {
        Self {
            kind: kind.into(),
            config,
            storage,
            parser,
        }
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("kind", &self.kind)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub(crate) fn validate_sources(sources: &[MediaSource]) -> Result<(), ConfigValidationError> {
    if sources.is_empty() {
        return Err(ConfigValidationError::EmptySources);
    }
    for (idx, source) in sources.iter().enumerate() {
        if sources[..idx].iter().any(|other| other.kind == source.kind) {
            return Err(ConfigValidationError::DuplicateKind(source.kind.to_string()));
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("scanner name must be provided")]
    EmptyName,
    #[error("scanner name must be a plain, non-hidden path segment: {0}")]
    InvalidName(String),
    #[error("page size must be at least one record")]
    ZeroPageSize,
    #[error("no media sources configured")]
    EmptySources,
    #[error("media kind configured twice: {0}")]
    DuplicateKind(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ScannerConfig::default();
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.scan_mode, ScanMode::Incremental);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_names_and_page_size() {
        assert_eq!(
            ScannerConfig::new("", 1).validate(),
            Err(ConfigValidationError::EmptyName)
        );
        assert_eq!(
            ScannerConfig::new("a/b", 1).validate(),
            Err(ConfigValidationError::InvalidName("a/b".into()))
        );
        assert_eq!(
            ScannerConfig::new(".hidden", 1).validate(),
            Err(ConfigValidationError::InvalidName(".hidden".into()))
        );
        assert_eq!(
            ScannerConfig::new("gallery", 1).with_page_size(0).validate(),
            Err(ConfigValidationError::ZeroPageSize)
        );
    }

    #[test]
    fn kind_config_roundtrips_through_json() {
        let config = KindConfig::default()
            .with_directory("DCIM/")
            .with_mime_types(["image/jpeg", "image/png"]);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: KindConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.directory(), "DCIM/");
        assert_eq!(KindConfig::default().directory(), "");
    }

    #[test]
    fn empty_sources_are_rejected() {
        assert_eq!(
            validate_sources(&[]),
            Err(ConfigValidationError::EmptySources)
        );
    }
}
