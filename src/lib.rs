//! # tarfs — mount a TAR archive as a read-only filesystem
//!
//! Indexes a (optionally compressed) TAR archive into a persisted SQLite
//! database once, then serves the archive's contents over FUSE without
//! re-scanning it on every mount. See [`lifecycle`] for index discovery and
//! creation, [`read_path`] for how a virtual path turns into archive bytes,
//! and [`mount`] for the `fuser::Filesystem` binding.

pub mod compressed;
pub mod config;
pub mod error;
pub mod index_store;
pub mod indexer;
pub mod lifecycle;
pub mod mount;
pub mod read_path;
pub mod stencil;
pub mod tar_scanner;

pub use config::MountConfig;
pub use error::{Result, TarFsError};
pub use lifecycle::{open_or_create, open_serving_reader, OpenedIndex};
pub use mount::TarFs;
pub use read_path::ReadPath;
