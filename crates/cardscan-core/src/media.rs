use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A configured media category such as `pictures` or `videos`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(transparent)]
pub struct MediaKind(pub String);

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaKind {
    fn from(value: &str) -> Self {
        MediaKind(value.to_owned())
    }
}

impl From<String> for MediaKind {
    fn from(value: String) -> Self {
        MediaKind(value)
    }
}

/// File descriptor as reported by a storage capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFile {
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    /// Last modification, epoch milliseconds.
    pub date: i64,
}

impl MediaFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, size: u64, date: i64) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size,
            date,
        }
    }
}

/// Either a resolved file or just its name, as delivered by change events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRef {
    Known(MediaFile),
    NameOnly(String),
}

impl FileRef {
    pub fn name(&self) -> &str {
        match self {
            FileRef::Known(file) => &file.name,
            FileRef::NameOnly(name) => name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetaValue {
    Text(String),
    Number(i64),
    Float(f64),
    Bool(bool),
    List(Vec<MetaValue>),
}

/// Parser output. Fields are opaque to the scanner; the thumbnail is kept
/// out of the JSON and framed separately by the index file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MediaMetadata {
    #[serde(skip)]
    pub thumbnail: Option<Bytes>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, MetaValue>,
}

impl MediaMetadata {
    pub fn with_field(mut self, key: impl Into<String>, value: MetaValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<Bytes>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.fields.get(key)
    }
}

/// One indexed media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub name: String,
    pub kind: MediaKind,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    pub date: i64,
    pub metadata: MediaMetadata,
    #[serde(skip)]
    pub unverified: bool,
    #[serde(skip)]
    pub persisted: bool,
}

impl FileRecord {
    pub fn new(kind: MediaKind, file: MediaFile, metadata: MediaMetadata) -> Self {
        Self {
            name: file.name,
            kind,
            mime_type: file.mime_type,
            size: file.size,
            date: file.date,
            metadata,
            unverified: false,
            persisted: false,
        }
    }

    /// Whether the file on storage still matches what was indexed.
    pub fn matches(&self, file: &MediaFile) -> bool {
        self.size == file.size && self.date == file.date
    }
}

/// Best-effort MIME type from a file name's extension.
pub fn guess_mime_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "mp4" | "m4v" => "video/mp4",
        "3gp" => "video/3gpp",
        "webm" => "video/webm",
        "ogv" => "video/ogg",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}
