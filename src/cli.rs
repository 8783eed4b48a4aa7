//! Command-line surface — mirrors the flags a `ratarmount`-style tool is
//! expected to expose (see the CLI surface note in the design). Argument
//! parsing is deliberately kept out of the library crate: the rest of
//! `tarfs` only knows about [`MountConfig`], never about `clap`.

use std::path::PathBuf;

use clap::Parser;

use tarfs::MountConfig;

#[derive(Parser, Debug)]
#[command(name = "tarfs", version, about = "Mount a TAR archive as a read-only filesystem")]
pub struct Cli {
    /// Path to the (optionally compressed) TAR archive.
    pub archive_path: PathBuf,

    /// Where to mount it. Defaults to the archive path with its
    /// `.tar`/`.tar.gz`/`.tgz`/`.tar.bz2`/`.tbz2` suffix stripped.
    pub mount_path: Option<PathBuf>,

    /// Delete any pre-existing index before mounting and rebuild from scratch.
    #[arg(short = 'c', long = "recreate-index")]
    pub recreate_index: bool,

    /// Recurse into nested `.tar` members and mount them as directories.
    /// Only honored at index-creation time.
    #[arg(short = 'r', long = "recursive")]
    pub recursive: bool,

    /// Uncompressed-byte spacing between gzip index points, in MiB.
    #[arg(long = "gzip-seek-point-spacing", visible_alias = "gs", default_value_t = 16)]
    pub gzip_seek_point_spacing: u32,

    /// Stay attached to the controlling terminal instead of daemonizing.
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Verbosity level; repeat-independent, 0 = warnings only.
    #[arg(short = 'd', long = "debug", default_value_t = 0)]
    pub debug: u8,

    /// Raw FUSE mount options, comma-separated (e.g. `allow_other,ro`).
    #[arg(short = 'o', long = "fuse")]
    pub fuse_options: Option<String>,

    /// Virtual path prefix every member is mounted under.
    #[arg(short = 'p', long = "prefix")]
    pub prefix: Option<PathBuf>,
}

impl Cli {
    pub fn to_mount_config(&self) -> MountConfig {
        MountConfig {
            recreate_index: self.recreate_index,
            recursive: self.recursive,
            gzip_seek_point_spacing_mib: self.gzip_seek_point_spacing,
            debug_level: self.debug,
            prefix: self.prefix.clone(),
            foreground: self.foreground,
        }
    }

    /// Where to mount when `mount_path` wasn't given: the archive path with
    /// one of the well-known compound extensions stripped.
    pub fn resolved_mount_path(&self) -> PathBuf {
        if let Some(p) = &self.mount_path {
            return p.clone();
        }
        let name = self.archive_path.to_string_lossy();
        for suffix in [".tar.bz2", ".tar.gz", ".tbz2", ".tgz", ".tar"] {
            if let Some(stripped) = name.strip_suffix(suffix) {
                return PathBuf::from(stripped);
            }
        }
        PathBuf::from(format!("{name}.mount"))
    }
}
