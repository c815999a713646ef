pub mod parser;
pub mod storage;

pub use parser::{ImageParser, VideoParser};
pub use storage::DirectoryStorage;
