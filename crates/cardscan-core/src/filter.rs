//! Ignore rules applied before a file reaches the metadata parser.

use crate::config::KindConfig;
use crate::media::MediaFile;

/// Hidden files and anything under a hidden directory. This also covers the
/// scanner's own `.cardscan/` index directory.
pub fn ignore_name(name: &str) -> bool {
    name.starts_with('.') || name.contains("/.")
}

/// Whether `file` belongs in the model for a kind configured with `config`.
pub fn accepts(config: &KindConfig, file: &MediaFile) -> bool {
    if ignore_name(&file.name) || !in_directory(config, &file.name) {
        return false;
    }
    match &config.mime_types {
        Some(types) => types.iter().any(|allowed| allowed == &file.mime_type),
        None => true,
    }
}

/// Whether `name` lies under the kind's directory, matching whole path
/// segments so `DCIM` does not take in `DCIMX/`.
pub fn in_directory(config: &KindConfig, name: &str) -> bool {
    let directory = config.directory().trim_end_matches('/');
    if directory.is_empty() {
        return true;
    }
    name.strip_prefix(directory)
        .is_some_and(|rest| rest.starts_with('/'))
}
