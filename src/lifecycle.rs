//! Index lifecycle — discovery, validation, atomic creation, and
//! compression seek-table reconciliation.
//!
//! On every mount the Index Store is either loaded from a prior run or
//! built fresh. Discovery tries, in order, `<archive>.index.sqlite` next to
//! the archive, then `~/.ratarmount/<path with / -> _>.index.sqlite`; the
//! first candidate that exists and validates wins. Any rejection — missing
//! tables, a leftover `files_tmp`/`parent_folders` from a crashed run, a
//! version mismatch, or archive stats that no longer match — falls back to
//! recreating the index at the first writable candidate path.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::compressed::{detect_compression, Bzip2Reader, CompressionKind, GzipReader, SeekTable, SeekableDecompressor};
use crate::config::MountConfig;
use crate::error::{Result, TarFsError};
use crate::index_store::{ArchiveStats, IndexStore, INDEX_MAJOR, INDEX_MINOR, INDEX_PATCH};
use crate::indexer::Indexer;

/// An opened, validated (or freshly built) index, ready for the read path.
pub struct OpenedIndex {
    pub store: IndexStore,
    pub compression: CompressionKind,
}

/// Adapts a [`SeekableDecompressor`] to `std::io::Read` so the Indexer —
/// which only needs forward sequential reads during a scan — doesn't need
/// to know about seeking at all.
struct DecompressorRead<'a> {
    inner: &'a mut dyn SeekableDecompressor,
}

impl<'a> Read for DecompressorRead<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner
            .read(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

fn sibling_index_path(archive_path: &Path) -> PathBuf {
    let mut name = archive_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".index.sqlite");
    archive_path.with_file_name(name)
}

fn fallback_index_path(archive_path: &Path) -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let canonical = archive_path.canonicalize().unwrap_or_else(|_| archive_path.to_path_buf());
    let flattened = canonical.to_string_lossy().replace('/', "_");
    Some(home.join(".ratarmount").join(format!("{flattened}.index.sqlite")))
}

fn candidate_paths(archive_path: &Path) -> Vec<PathBuf> {
    let mut out = vec![sibling_index_path(archive_path)];
    if let Some(p) = fallback_index_path(archive_path) {
        out.push(p);
    }
    out
}

fn stat_archive(archive_path: &Path) -> Result<ArchiveStats> {
    let meta = std::fs::metadata(archive_path)?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(ArchiveStats { st_size: meta.len() as i64, st_mtime: mtime })
}

/// Opens the candidate index at `path` read-only and checks it against
/// `current_stats`. Returns `Ok(None)` for any problem short of an I/O
/// error opening the file at all — a rejected candidate is not a failure,
/// just a signal to try the next one or rebuild.
fn try_load(path: &Path, current_stats: ArchiveStats) -> Result<Option<IndexStore>> {
    if !path.exists() {
        return Ok(None);
    }
    let store = match IndexStore::open_for_read(path) {
        Ok(s) => s,
        Err(e) => {
            warn!("index at {} failed to open: {e}", path.display());
            return Ok(None);
        }
    };

    if store.table_exists("files_tmp")? || store.table_exists("parent_folders")? {
        warn!("index at {} has leftover scan state from a crashed run", path.display());
        return Ok(None);
    }
    if !store.table_exists("files")? {
        return Ok(None);
    }

    match store.load_index_version()? {
        Some(v) if v.major == INDEX_MAJOR && v.minor == INDEX_MINOR && v.patch == INDEX_PATCH => {}
        Some(v) => {
            warn!(
                "index at {} has incompatible version {}.{}.{}",
                path.display(),
                v.major,
                v.minor,
                v.patch
            );
            return Ok(None);
        }
        None => return Ok(None),
    }

    match store.load_archive_stats()? {
        Some(stats) if stats == current_stats => {}
        Some(_) => {
            warn!("index at {} is stale: archive size/mtime changed", path.display());
            return Ok(None);
        }
        None => return Ok(None),
    }

    Ok(Some(store))
}

/// Sniffs `archive_path`'s first few bytes to decide which reader to build.
fn detect_archive_compression(archive_path: &Path) -> Result<CompressionKind> {
    let mut file = File::open(archive_path)?;
    let mut sniff = [0u8; 6];
    let n = file.read(&mut sniff)?;
    detect_compression(&sniff[..n])
}

/// Builds a decompressor (or a plain passthrough for an uncompressed
/// archive) positioned at the start of the logical byte stream.
fn open_reader(archive_path: &Path, kind: CompressionKind, config: &MountConfig) -> Result<Box<dyn SeekableDecompressor>> {
    let mut file = File::open(archive_path)?;
    file.seek(SeekFrom::Start(0))?;
    let reader: Box<dyn SeekableDecompressor> = match kind {
        CompressionKind::None => Box::new(PlainReader { file, position: 0 }),
        CompressionKind::Bzip2 => Box::new(Bzip2Reader::new(file)?),
        CompressionKind::Gzip => Box::new(GzipReader::new(file, config.gzip_seek_point_spacing_bytes())?),
    };
    Ok(reader)
}

struct PlainReader {
    file: File,
    position: u64,
}

impl SeekableDecompressor for PlainReader {
    fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.position = pos;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = std::io::Read::read(&mut self.file, buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn export_seek_table(&self) -> SeekTable {
        SeekTable::Gzip(Vec::new())
    }

    fn import_seek_table(&mut self, _table: SeekTable) -> Result<()> {
        Ok(())
    }
}

/// Runs the indexing algorithm against `archive_path`, recursing into
/// `.tar`-named regular files when `config.recursive` is set. Writes the
/// result (including the compression seek table, if any) into `store`.
fn create_index(archive_path: &Path, kind: CompressionKind, store: &IndexStore, config: &MountConfig) -> Result<()> {
    let mut reader = open_reader(archive_path, kind, config)?;

    let mut indexer = Indexer::new(store, config);
    indexer.begin()?;

    let (_count, mut pending) = {
        let adapter = DecompressorRead { inner: reader.as_mut() };
        indexer.scan(adapter, "", 0)?
    };

    // Breadth-first: nested archives discovered inside nested archives are
    // appended to `pending` and drained in the same loop.
    let mut i = 0;
    while i < pending.len() {
        let candidate = pending[i].clone();
        i += 1;
        reader.seek_to(candidate.offset_data)?;
        let mut limited = Limited { inner: reader.as_mut(), remaining: candidate.size };
        let prefix = if candidate.path.is_empty() {
            format!("/{}", candidate.name)
        } else {
            format!("{}/{}", candidate.path, candidate.name)
        };
        match indexer.scan(&mut limited, &prefix, candidate.offset_data) {
            Ok((_, mut nested)) => {
                indexer.promote_to_directory(&candidate.path, &candidate.name)?;
                pending.append(&mut nested);
            }
            Err(e) => {
                // Resolved Open Question: a nested archive that fails to
                // parse is silently left mounted as its own plain file.
                warn!("nested archive {prefix} failed to index, leaving it as a file: {e}");
            }
        }
    }

    indexer.finish()?;

    store.store_archive_stats(stat_archive(archive_path)?)?;
    match reader.export_seek_table() {
        SeekTable::Bzip2(entries) if !entries.is_empty() => store.store_bzip2_table(&entries)?,
        SeekTable::Gzip(blob) if !blob.is_empty() => store.store_gzip_index(&blob)?,
        _ => {}
    }
    Ok(())
}

/// A forward-only view over a [`SeekableDecompressor`] bounded to `remaining`
/// bytes, used to hand the Indexer exactly one nested member's payload.
struct Limited<'a> {
    inner: &'a mut dyn SeekableDecompressor,
    remaining: u64,
}

impl<'a> Read for Limited<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let take = (buf.len() as u64).min(self.remaining) as usize;
        let n = self
            .inner
            .read(&mut buf[..take])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Builds a decompressor for serving reads against an already-opened index,
/// restoring whatever compression seek table was persisted alongside it so
/// repeat mounts don't re-scan the whole archive just to seek.
pub fn open_serving_reader(
    archive_path: &Path,
    opened: &OpenedIndex,
    config: &MountConfig,
) -> Result<Box<dyn SeekableDecompressor>> {
    let mut reader = open_reader(archive_path, opened.compression, config)?;
    match opened.compression {
        CompressionKind::Bzip2 => {
            if let Some(entries) = opened.store.load_bzip2_table()? {
                reader.import_seek_table(SeekTable::Bzip2(entries))?;
            }
        }
        CompressionKind::Gzip => {
            if let Some(blob) = opened.store.load_gzip_index()? {
                reader.import_seek_table(SeekTable::Gzip(blob))?;
            }
        }
        CompressionKind::None => {}
    }
    Ok(reader)
}

/// Discovers, validates, or (re)creates the index for `archive_path`,
/// returning it opened read-only and ready to serve lookups.
pub fn open_or_create(archive_path: &Path, config: &MountConfig) -> Result<OpenedIndex> {
    let current_stats = stat_archive(archive_path)?;
    let kind = detect_archive_compression(archive_path)?;

    if !config.recreate_index {
        for candidate in candidate_paths(archive_path) {
            if let Some(store) = try_load(&candidate, current_stats)? {
                info!("using existing index at {}", candidate.display());
                return Ok(OpenedIndex { store, compression: kind });
            }
        }
    }

    let candidates = candidate_paths(archive_path);
    let mut last_err = None;
    for candidate in &candidates {
        if let Some(parent) = candidate.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                continue;
            }
        }
        let _ = std::fs::remove_file(candidate);
        match IndexStore::open_for_write(candidate) {
            Ok(store) => {
                info!("creating index at {}", candidate.display());
                create_index(archive_path, kind, &store, config)?;
                store.close()?;
                let store = IndexStore::open_for_read(candidate)?;
                return Ok(OpenedIndex { store, compression: kind });
            }
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| TarFsError::IndexCorrupt {
        path: candidates.first().cloned().unwrap_or_default(),
        reason: "no writable location for the index".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pad_to_block(size: u64) -> u64 {
        (size + 511) / 512 * 512
    }

    fn write_header(buf: &mut [u8; 512], name: &str, size: u64) {
        buf.iter_mut().for_each(|b| *b = 0);
        buf[0..name.len()].copy_from_slice(name.as_bytes());
        buf[100..108].copy_from_slice(b"0000644\0");
        buf[108..116].copy_from_slice(b"0000000\0");
        buf[116..124].copy_from_slice(b"0000000\0");
        let size_str = format!("{size:011o}\0");
        buf[124..124 + size_str.len()].copy_from_slice(size_str.as_bytes());
        buf[136..148].copy_from_slice(b"00000000000\0");
        buf[148..156].copy_from_slice(b"        ");
        buf[156] = b'0';
        buf[257..263].copy_from_slice(b"ustar\0");
        let mut sum: u64 = 0;
        for &b in buf.iter() {
            sum += b as u64;
        }
        let chksum = format!("{sum:06o}\0 ");
        buf[148..148 + chksum.len()].copy_from_slice(chksum.as_bytes());
    }

    fn pack(name: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut header = [0u8; 512];
        write_header(&mut header, name, data.len() as u64);
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        let pad = pad_to_block(data.len() as u64) as usize - data.len();
        out.extend(std::iter::repeat(0u8).take(pad));
        out
    }

    #[test]
    fn creates_then_reuses_index() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("sample.tar");
        let mut archive = pack("a.txt", b"hello world");
        archive.extend([0u8; 1024]);
        std::fs::write(&archive_path, &archive).unwrap();

        let config = MountConfig::default();
        let opened = open_or_create(&archive_path, &config).unwrap();
        let row = opened.store.stat("", "a.txt").unwrap().unwrap();
        assert_eq!(row.size, 11);
        drop(opened);

        let index_path = sibling_index_path(&archive_path);
        assert!(index_path.exists());

        // Second open should load the cached index rather than fail, even
        // though `create_index` is never invoked again.
        let opened_again = open_or_create(&archive_path, &config).unwrap();
        let row_again = opened_again.store.stat("", "a.txt").unwrap().unwrap();
        assert_eq!(row_again.size, 11);
    }

    #[test]
    fn recreate_flag_forces_rebuild() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("sample2.tar");
        let mut archive = pack("a.txt", b"v1");
        archive.extend([0u8; 1024]);
        std::fs::write(&archive_path, &archive).unwrap();

        let config = MountConfig::default();
        open_or_create(&archive_path, &config).unwrap();

        let mut recreate_config = MountConfig::default();
        recreate_config.recreate_index = true;
        let opened = open_or_create(&archive_path, &recreate_config).unwrap();
        let row = opened.store.stat("", "a.txt").unwrap().unwrap();
        assert_eq!(row.size, 2);
    }
}
