//! AgentFS: a user-space copy-on-write overlay filesystem whose entire
//! state lives in a single database file.
//!
//! The overlay presents a POSIX-like hierarchy layered over an immutable,
//! pre-seeded base and a mutable delta. Reads fall through to the base
//! until a path is touched; the first mutation materializes the object
//! into the delta while preserving its inode number, so external inode
//! caches stay coherent across copy-up.

pub mod config;
pub mod error;
pub mod ffi;
pub mod overlay;
pub mod store;

pub use config::{CacheConfig, MountConfig, MEMORY_PATH};
pub use error::{FsError, Result};
pub use overlay::types::{CacheStats, DirEntry, FileKind, FileStat, StatFs};
pub use overlay::{AgentFs, CancelToken};
pub use store::record::Provenance;
pub use store::seed::SeedBuilder;
pub use store::ROOT_INO;
