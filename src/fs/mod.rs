pub mod backend;
pub mod chunk_store;
pub mod errors;
pub mod flusher;
pub mod key;
pub mod lock_manager;
pub mod metadata;
pub mod types;

pub use chunk_store::ChunkStore;
pub use errors::Status;
pub use flusher::Flusher;
pub use metadata::MetadataMode;
pub use types::{DirEntry, FileStat, Timespec};
