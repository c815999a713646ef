pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod index;
pub mod media;
pub mod model;
pub mod parser;
pub mod prelude;
pub mod reconcile;
pub mod scanner;
pub mod storage;
pub mod enumerate;
mod pipeline;

pub use config::*;
pub use error::*;
pub use event::*;
pub use media::*;
pub use scanner::Scanner;
