//! Indexer — orchestrates a scan of the archive and populates the Index
//! Store, recursing into nested `.tar` members when the caller asks for
//! recursive mounting.

use std::collections::VecDeque;
use std::io::Read;

use log::warn;

use crate::config::MountConfig;
use crate::error::{Result, TarFsError};
use crate::index_store::{IndexStore, MemberRecord, VersionRecord, INDEX_MAJOR, INDEX_MINOR, INDEX_PATCH, INDEX_VERSION_NAME};
use crate::tar_scanner::{type_mode_bits, ScannedMember, TarScanner};

/// Bound on the parent-folder insertion cache: once it exceeds `K`, it is
/// shrunk back to the most recently tried `SHRINK_TO` entries. This turns
/// the hot loop of re-inserting the same ancestor directories (every file
/// re-derives its full ancestor chain) into a near no-op for archives with
/// deep common path prefixes.
const PARENT_CACHE_MAX: usize = 16;
const PARENT_CACHE_SHRINK_TO: usize = 8;

/// Splits a normalized absolute path (leading `/`, no trailing `/` except
/// root) into `(path, name)`, the way the Indexer stores every member.
pub(crate) fn split_path(full_path: &str) -> (String, String) {
    match full_path.rfind('/') {
        Some(0) => ("".to_string(), full_path[1..].to_string()),
        Some(i) => (full_path[..i].to_string(), full_path[i + 1..].to_string()),
        None => ("".to_string(), full_path.to_string()),
    }
}

pub(crate) fn normalize_path(prefix: &str, raw_name: &str) -> String {
    let joined = if prefix.is_empty() {
        format!("/{}", raw_name.trim_start_matches('/'))
    } else {
        format!("{}/{}", prefix, raw_name.trim_start_matches('/'))
    };
    let mut normalized = String::with_capacity(joined.len());
    let mut prev_slash = false;
    for c in joined.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        normalized.push(c);
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// A plain file, recorded during a scan, that is a candidate for recursive
/// descent: its name ends in `.tar` and its TAR typeflag is a regular file.
/// The orchestration layer (`lifecycle`) decides whether to actually descend
/// — this module never re-seeks the raw archive itself.
#[derive(Debug, Clone)]
pub struct NestedCandidate {
    pub path: String,
    pub name: String,
    pub offset_data: u64,
    pub size: u64,
}

pub struct Indexer<'a> {
    store: &'a IndexStore,
    config: &'a MountConfig,
    parent_cache: VecDeque<(String, String)>,
}

impl<'a> Indexer<'a> {
    pub fn new(store: &'a IndexStore, config: &'a MountConfig) -> Self {
        Self { store, config, parent_cache: VecDeque::new() }
    }

    /// Creates `files`, `files_tmp`, `parent_folders`, `versions`, and
    /// `metadata` if absent. Lifecycle is responsible for verifying these
    /// are empty before a fresh scan begins.
    pub fn begin(&self) -> Result<()> {
        self.store.create_schema()
    }

    /// Step 4 and 5 of the indexing algorithm: bulk-copies `files_tmp` into
    /// `files`, synthesizes parent directories, and records the index
    /// format version. Call once after every `scan` (top-level and any
    /// nested descents) has run.
    pub fn finish(&self) -> Result<()> {
        self.store.finalize_files()?;
        self.store.insert_version(&VersionRecord {
            name: INDEX_VERSION_NAME.to_string(),
            version: format!("{INDEX_MAJOR}.{INDEX_MINOR}.{INDEX_PATCH}"),
            major: INDEX_MAJOR,
            minor: INDEX_MINOR,
            patch: INDEX_PATCH,
        })?;
        Ok(())
    }

    /// Runs `begin`, a single scan with no path prefix, and `finish` in one
    /// call — the non-recursive, single-archive case.
    pub fn run<R: Read>(&mut self, reader: R) -> Result<u64> {
        self.begin()?;
        let (count, _nested) = self.scan(reader, "", 0)?;
        self.finish()?;
        Ok(count)
    }

    /// Scans every member of `reader` into `files_tmp`, prefixing each path
    /// with `path_prefix` (used when descending into a nested archive) and
    /// shifting every recorded offset by `base_offset` — the absolute
    /// archive position this `reader` starts at. `TarScanner` always
    /// numbers positions from zero, so a nested scan's own offsets are
    /// relative to the nested member's payload unless corrected here; the
    /// read path later seeks the shared archive stream directly by these
    /// offsets, so they must always be absolute.
    /// Returns the member count and any `.tar`-named regular files found,
    /// for the caller to recurse into if `spec.md`'s recursive mode is on.
    pub fn scan<R: Read>(&mut self, reader: R, path_prefix: &str, base_offset: u64) -> Result<(u64, Vec<NestedCandidate>)> {
        let mut scanner = TarScanner::new(reader);
        let mut nested = Vec::new();
        let mut count = 0u64;
        loop {
            let member = match scanner.next_member() {
                Ok(Some(m)) => m,
                Ok(None) => break,
                Err(TarFsError::UnexpectedEnd { bytes_read }) => {
                    warn!("archive truncated after {bytes_read} bytes; keeping partial index");
                    break;
                }
                Err(e) => return Err(e),
            };
            if let Some(candidate) = self.index_member(path_prefix, base_offset, member)? {
                nested.push(candidate);
            }
            count += 1;
        }
        Ok((count, nested))
    }

    fn index_member(&mut self, path_prefix: &str, base_offset: u64, member: ScannedMember) -> Result<Option<NestedCandidate>> {
        let full_path = normalize_path(path_prefix, &member.name);
        let (path, name) = split_path(&full_path);
        let offset_header = base_offset + member.offset_header;
        let offset_data = base_offset + member.offset_data;

        let mode = (member.mode & 0o7777) | type_mode_bits(member.typeflag);
        let is_regular = matches!(member.typeflag, crate::tar_scanner::TYPE_REGULAR | crate::tar_scanner::TYPE_REGULAR_NUL);
        let candidate = if self.config.recursive && is_regular && name.ends_with(".tar") {
            Some(NestedCandidate {
                path: path.clone(),
                name: name.clone(),
                offset_data,
                size: member.size,
            })
        } else {
            None
        };

        // Marking `is_tar` speculatively here would be wrong if a later
        // descent attempt fails, so every member is first inserted as a
        // plain file and rewritten via `promote_to_directory` only once a
        // descent actually succeeds.
        self.store.insert_tmp(&MemberRecord {
            path: path.clone(),
            name,
            offset_header: offset_header as i64,
            offset_data: offset_data as i64,
            size: member.size as i64,
            mtime: member.mtime,
            mode: mode as i64,
            type_: member.typeflag as i64,
            linkname: member.linkname,
            uid: member.uid as i64,
            gid: member.gid as i64,
            is_tar: false,
            is_sparse: member.is_sparse,
        })?;

        self.insert_ancestors(&full_path)?;
        Ok(candidate)
    }

    /// Promotes a previously-indexed file row to a synthesized directory
    /// after its nested-archive descent has succeeded, by appending an
    /// override row to `files_tmp`: the scan that found this candidate is
    /// still in progress, so `finalize_files` hasn't copied anything into
    /// `files` yet, and `finalize_files`'s bulk copy takes the last row per
    /// `(path, name)` in rowid order, so this override row wins. On
    /// failure the row is left untouched, silently reverting to a plain
    /// file per the resolved Open Question in `spec.md` §9.
    pub fn promote_to_directory(&self, path: &str, name: &str) -> Result<()> {
        if let Some(mut m) = self.store.stat_tmp(path, name)? {
            m.mode = (m.mode & 0o7777) | 0o040000;
            m.type_ = crate::tar_scanner::TYPE_DIR as i64;
            m.is_tar = true;
            self.store.insert_tmp(&m)?;
        }
        Ok(())
    }

    /// Walks `full_path`'s ancestor chain (excluding the member itself) and
    /// registers each directory in `parent_folders`, so `finalize_files` can
    /// synthesize a directory row for any ancestor with no explicit member
    /// of its own in the archive.
    fn insert_ancestors(&mut self, full_path: &str) -> Result<()> {
        let (mut current, _) = split_path(full_path);
        loop {
            if current.is_empty() {
                break;
            }
            let (ancestor_path, ancestor_name) = split_path(&current);
            let key = (ancestor_path.clone(), ancestor_name.clone());
            if !self.parent_cache.contains(&key) {
                self.store.insert_parent_folder(&ancestor_path, &ancestor_name)?;
                self.parent_cache.push_back(key);
                if self.parent_cache.len() > PARENT_CACHE_MAX {
                    while self.parent_cache.len() > PARENT_CACHE_SHRINK_TO {
                        self.parent_cache.pop_front();
                    }
                }
            }
            current = ancestor_path;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    fn pad_to_block(size: u64) -> u64 {
        (size + 511) / 512 * 512
    }

    fn write_header(buf: &mut [u8; 512], name: &str, size: u64) {
        buf.iter_mut().for_each(|b| *b = 0);
        buf[0..name.len()].copy_from_slice(name.as_bytes());
        let mode_str = b"0000644\0";
        buf[100..108].copy_from_slice(mode_str);
        let id_str = b"0000000\0";
        buf[108..116].copy_from_slice(id_str);
        buf[116..124].copy_from_slice(id_str);
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
    fn split_path_handles_root_members() {
        assert_eq!(split_path("/a.txt"), ("".to_string(), "a.txt".to_string()));
        assert_eq!(split_path("/dir/b.txt"), ("/dir".to_string(), "b.txt".to_string()));
    }

    #[test]
    fn normalize_collapses_duplicate_slashes() {
        assert_eq!(normalize_path("", "a//b/"), "/a/b");
        assert_eq!(normalize_path("/inner.tar", "hello"), "/inner.tar/hello");
    }

    #[test]
    fn indexes_flat_archive_and_synthesizes_dir() {
        let mut archive = pack("a.txt", b"0123456789");
        archive.extend(pack("dir/b.txt", b"xyz"));
        archive.extend([0u8; 1024]);

        let tmp = NamedTempFile::new().unwrap();
        let store = IndexStore::open_for_write(tmp.path()).unwrap();
        let config = MountConfig::default();
        let mut indexer = Indexer::new(&store, &config);
        let count = indexer.run(Cursor::new(archive)).unwrap();
        assert_eq!(count, 2);

        let root_entries = store.list_dir("").unwrap();
        let names: Vec<_> = root_entries.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"a.txt"));
        assert!(names.contains(&"dir"));

        let dir_row = store.stat("", "dir").unwrap().unwrap();
        assert_eq!(dir_row.mode, 0o555 | 0o040000);
    }
}
