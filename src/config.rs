//! Mount configuration.
//!
//! Threaded explicitly through the [`crate::indexer::Indexer`] and
//! [`crate::mount::TarFs`] instead of living behind a process-wide mutable
//! verbosity flag, so a future caller embedding this crate can mount more
//! than one archive with different settings in the same process.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Discard any existing index and rebuild from scratch (`-c`).
    pub recreate_index: bool,
    /// Descend into nested `.tar` members and mount them as directories (`-r`).
    pub recursive: bool,
    /// Spacing between gzip seek-table checkpoints, in MiB (`-gs`).
    pub gzip_seek_point_spacing_mib: u32,
    /// 0 = warnings only, higher values emit more `log::debug!` detail (`-d`).
    pub debug_level: u8,
    /// Virtual path prefix every member is mounted under (`-p`).
    pub prefix: Option<PathBuf>,
    /// Stay attached to the controlling terminal instead of daemonizing (`-f`).
    pub foreground: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            recreate_index: false,
            recursive: false,
            gzip_seek_point_spacing_mib: 16,
            debug_level: 0,
            prefix: None,
            foreground: false,
        }
    }
}

impl MountConfig {
    pub fn gzip_seek_point_spacing_bytes(&self) -> u64 {
        u64::from(self.gzip_seek_point_spacing_mib) * 1024 * 1024
    }
}
