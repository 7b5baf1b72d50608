pub mod error;
pub mod fs;
pub mod operation;
pub mod mirror;
pub mod storage;
pub mod config;
pub mod lock;

pub use error::{FsError, Result};
pub use fs::{Context, File, FileMetadata, FileSystem, OpenFlags};
pub use mirror::{MirrorFile, MirrorFs};
pub use operation::Operation;
pub use storage::{DirStorage, MemoryStorage};
pub use config::MirrorConfig;
pub use lock::BackendLock;
