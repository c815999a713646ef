pub use crate::config::{KindConfig, MediaSource, ScanMode, ScannerConfig};
pub use crate::enumerate::{EnumerationHandle, EnumerationState};
pub use crate::error::{CardScanError, Result};
pub use crate::event::{CardState, ScannerEvent};
pub use crate::media::{FileRecord, MediaFile, MediaKind, MediaMetadata, MetaValue};
pub use crate::parser::{MetadataParser, PassthroughParser};
pub use crate::scanner::Scanner;
pub use crate::storage::{Availability, FileCursor, MemoryStorage, StorageCapability, StorageChange};
