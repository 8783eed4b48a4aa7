//! Crate-wide error type.
//!
//! Every fallible operation in `tarfs` returns [`TarFsError`]. The variants
//! are exactly the error kinds named in the design: lookups fail with
//! [`TarFsError::NotFound`], corrupt compressed streams with
//! [`TarFsError::DecodeError`], and so on. [`TarFsError::errno`] maps each
//! variant to the POSIX error code the Mount Facade hands back to the
//! kernel — lookups become `ENOENT`, everything else that reaches the read
//! path becomes `EIO`. No variant here is allowed to unwind a mount.

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum TarFsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("unsupported compression (magic bytes not recognized): {0}")]
    UnsupportedCompression(String),

    #[error("compressed stream is corrupt: {0}")]
    DecodeError(String),

    #[error("archive truncated after {bytes_read} bytes")]
    UnexpectedEnd { bytes_read: u64 },

    #[error("index at {path} is stale (archive size/mtime changed)")]
    IndexStale { path: PathBuf },

    #[error("index at {path} is corrupt: {reason}")]
    IndexCorrupt { path: PathBuf, reason: String },

    #[error("seek table for {path} disagrees with the archive; rebuilding")]
    SeekTableStale { path: PathBuf },

    #[error("invalid seek: {0}")]
    InvalidSeek(String),

    #[error("a symlink/hardlink dereference loop was detected at {0}")]
    LinkLoop(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("index database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl TarFsError {
    /// POSIX errno this error should surface as at the FUSE boundary.
    ///
    /// Matches the policy table in the design: lookups fail `ENOENT`;
    /// everything else that can reach a mounted filesystem operation is
    /// `EIO`. Errors that only occur during index *creation* (IndexStale,
    /// IndexCorrupt, SeekTableStale) are recovered internally and should
    /// never reach this function in practice, but are mapped to `EIO` as a
    /// safe fallback.
    pub fn errno(&self) -> libc::c_int {
        match self {
            TarFsError::NotFound(_) => libc::ENOENT,
            _ => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, TarFsError>;
