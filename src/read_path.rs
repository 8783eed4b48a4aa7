//! Read Path — maps a virtual path to an archive byte range and streams
//! bytes through the compression layer, resolving hard links and expanding
//! sparse members along the way.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Mutex;

use crate::compressed::SeekableDecompressor;
use crate::error::{Result, TarFsError};
use crate::index_store::{IndexStore, MemberRecord};
use crate::indexer::{normalize_path, split_path};
use crate::stencil::{Stencil, StencilFile};
use crate::tar_scanner::{ScannedMember, TarScanner, TYPE_HARDLINK, TYPE_SYMLINK};

/// Adapts a [`SeekableDecompressor`] to `std::io::{Read, Seek}` so it can
/// back a [`StencilFile`], which needs both to bound a single member's
/// header-plus-payload span for the nested rescan described below.
struct DecompressorIo<'a> {
    inner: &'a mut dyn SeekableDecompressor,
}

impl<'a> Read for DecompressorIo<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .read(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

impl<'a> Seek for DecompressorIo<'a> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(n) => (self.inner.position() as i64 + n).max(0) as u64,
            SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "seek from end is not supported on a compressed archive stream",
                ))
            }
        };
        self.inner
            .seek_to(target)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(target)
    }
}

/// Resolves virtual paths against the Index Store and streams member bytes
/// out of the archive. Both the database connection and the archive handle
/// are serialized behind a `Mutex`: `rusqlite::Connection` is `Send` but not
/// `Sync`, and the single decompressor handle can only service one seek+read
/// at a time regardless.
pub struct ReadPath {
    store: Mutex<IndexStore>,
    reader: Mutex<Box<dyn SeekableDecompressor>>,
}

impl ReadPath {
    pub fn new(store: IndexStore, reader: Box<dyn SeekableDecompressor>) -> Self {
        Self { store: Mutex::new(store), reader: Mutex::new(reader) }
    }

    /// Looks up `(path, name)` and returns its member record verbatim. Does
    /// *not* dereference hard links — callers that need the real content
    /// (`read`) go through [`ReadPath::resolve`] instead; callers that only
    /// need to report an entry's own identity (`readdir`) want the raw row.
    pub fn lookup(&self, path: &str, name: &str) -> Result<MemberRecord> {
        let store = self.store.lock().unwrap();
        store
            .stat(path, name)?
            .ok_or_else(|| TarFsError::NotFound(join(path, name)))
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<MemberRecord>> {
        let store = self.store.lock().unwrap();
        store.list_dir(path)
    }

    pub fn readlink(&self, path: &str, name: &str) -> Result<String> {
        let member = self.lookup(path, name)?;
        if member.type_ as u8 != TYPE_SYMLINK {
            return Err(TarFsError::DecodeError(format!("{} is not a symlink", join(path, name))));
        }
        Ok(member.linkname)
    }

    /// Resolves `(path, name)` to the member whose content should actually
    /// be served: itself, unless it is a hard link, in which case its single
    /// target is looked up. A link whose target is the link's own path is
    /// rejected as a loop rather than followed.
    pub fn resolve(&self, path: &str, name: &str) -> Result<MemberRecord> {
        let member = self.lookup(path, name)?;
        if member.type_ as u8 != TYPE_HARDLINK {
            return Ok(member);
        }

        let target_full = normalize_path("", &member.linkname);
        let (target_path, target_name) = split_path(&target_full);
        if target_path == path && target_name == name {
            return Err(TarFsError::LinkLoop(join(path, name)));
        }

        let mut resolved = {
            let store = self.store.lock().unwrap();
            store
                .stat(&target_path, &target_name)?
                .ok_or_else(|| TarFsError::NotFound(join(&target_path, &target_name)))?
        };

        // Single-hop only: if the target is itself a hard link, take it at
        // face value unless it points straight back to where we started.
        if resolved.type_ as u8 == TYPE_HARDLINK {
            let back_full = normalize_path("", &resolved.linkname);
            let (back_path, back_name) = split_path(&back_full);
            if back_path == path && back_name == name {
                return Err(TarFsError::LinkLoop(join(path, name)));
            }
        }

        resolved.path = path.to_string();
        resolved.name = name.to_string();
        Ok(resolved)
    }

    /// Reads up to `want` bytes starting at `offset` from `(path, name)`'s
    /// content, dereferencing a hard link first if needed.
    pub fn read(&self, path: &str, name: &str, offset: u64, want: u32) -> Result<Vec<u8>> {
        let member = self.resolve(path, name)?;
        if member.is_sparse {
            self.read_sparse(&member, offset, want)
        } else {
            self.read_direct(&member, offset, want)
        }
    }

    fn read_direct(&self, member: &MemberRecord, offset: u64, want: u32) -> Result<Vec<u8>> {
        let size = member.size.max(0) as u64;
        if offset >= size {
            return Ok(Vec::new());
        }
        let to_read = (size - offset).min(want as u64) as usize;
        let mut buf = vec![0u8; to_read];
        let mut reader = self.reader.lock().unwrap();
        reader.seek_to(member.offset_data as u64 + offset)?;
        let mut filled = 0;
        while filled < to_read {
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Re-parses just this member's header (plus any old-GNU sparse
    /// extension blocks) to recover its `sparse_map`, which the Index Store
    /// does not persist. The span handed to the nested `TarScanner` is
    /// bounded to `offset_header .. offset_data + size`, matching the single
    /// TAR block group this member occupies.
    fn rescan_sparse_header(&self, member: &MemberRecord) -> Result<ScannedMember> {
        let span_len = (member.offset_data - member.offset_header) as u64 + member.size as u64;
        let stencil = Stencil::new(member.offset_header as u64, span_len.max(1));
        let mut reader = self.reader.lock().unwrap();
        let backing = DecompressorIo { inner: reader.as_mut() };
        let span_file = StencilFile::new(backing, vec![stencil])?;
        let mut scanner = TarScanner::new(span_file);
        scanner.next_member()?.ok_or_else(|| {
            TarFsError::DecodeError(format!(
                "expected a sparse member header at offset {}",
                member.offset_header
            ))
        })
    }

    fn read_sparse(&self, member: &MemberRecord, offset: u64, want: u32) -> Result<Vec<u8>> {
        let scanned = self.rescan_sparse_header(member)?;
        let total = scanned.size;
        if offset >= total {
            return Ok(Vec::new());
        }
        let to_read = (total - offset).min(want as u64) as usize;
        // Zero-initialized: any byte this loop doesn't explicitly fill from
        // the archive is a hole, and a hole reads as zero.
        let mut out = vec![0u8; to_read];
        let data_start = member.offset_data as u64;
        let end = offset + to_read as u64;

        let mut reader = self.reader.lock().unwrap();
        let mut compact_pos = 0u64;
        let mut cur = offset;
        for seg in &scanned.sparse_map {
            if cur >= end {
                break;
            }
            let seg_start = seg.offset;
            let seg_end = seg.offset + seg.numbytes;
            if seg_end <= cur {
                compact_pos += seg.numbytes;
                continue;
            }
            if seg_start > cur {
                cur = seg_start.min(end);
            }
            if cur >= end {
                compact_pos += seg.numbytes;
                continue;
            }
            let inner_offset = cur - seg_start;
            let take = (seg_end.min(end) - cur) as usize;
            reader.seek_to(data_start + compact_pos + inner_offset)?;
            let dest_start = (cur - offset) as usize;
            let mut got = 0;
            while got < take {
                let n = reader.read(&mut out[dest_start + got..dest_start + take])?;
                if n == 0 {
                    break;
                }
                got += n;
            }
            cur += take as u64;
            compact_pos += seg.numbytes;
        }
        Ok(out)
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        format!("/{name}")
    } else {
        format!("{path}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressed::{SeekTable, SeekableDecompressor};
    use crate::config::MountConfig;
    use crate::indexer::Indexer;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    struct MemDecompressor {
        data: Vec<u8>,
        position: u64,
    }

    impl SeekableDecompressor for MemDecompressor {
        fn seek_to(&mut self, pos: u64) -> Result<()> {
            self.position = pos;
            Ok(())
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let start = self.position as usize;
            if start >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - start);
            buf[..n].copy_from_slice(&self.data[start..start + n]);
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

    fn pad_to_block(size: u64) -> u64 {
        (size + 511) / 512 * 512
    }

    fn write_header(buf: &mut [u8; 512], name: &str, typeflag: u8, size: u64, linkname: &str) {
        buf.iter_mut().for_each(|b| *b = 0);
        buf[0..name.len()].copy_from_slice(name.as_bytes());
        buf[100..108].copy_from_slice(b"0000644\0");
        buf[108..116].copy_from_slice(b"0000000\0");
        buf[116..124].copy_from_slice(b"0000000\0");
        let size_str = format!("{size:011o}\0");
        buf[124..124 + size_str.len()].copy_from_slice(size_str.as_bytes());
        buf[136..148].copy_from_slice(b"00000000000\0");
        buf[148..156].copy_from_slice(b"        ");
        buf[156] = typeflag;
        buf[157..157 + linkname.len()].copy_from_slice(linkname.as_bytes());
        buf[257..263].copy_from_slice(b"ustar\0");
        let mut sum: u64 = 0;
        for &b in buf.iter() {
            sum += b as u64;
        }
        let chksum = format!("{sum:06o}\0 ");
        buf[148..148 + chksum.len()].copy_from_slice(chksum.as_bytes());
    }

    fn pack(name: &str, typeflag: u8, data: &[u8], linkname: &str) -> Vec<u8> {
        let mut out = Vec::new();
        let mut header = [0u8; 512];
        write_header(&mut header, name, typeflag, data.len() as u64, linkname);
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        let pad = pad_to_block(data.len() as u64) as usize - data.len();
        out.extend(std::iter::repeat(0u8).take(pad));
        out
    }

    fn build_read_path(archive: Vec<u8>) -> ReadPath {
        let tmp = NamedTempFile::new().unwrap();
        let store = IndexStore::open_for_write(tmp.path()).unwrap();
        let config = MountConfig::default();
        {
            let mut indexer = Indexer::new(&store, &config);
            indexer.run(Cursor::new(archive.clone())).unwrap();
        }
        let reader: Box<dyn SeekableDecompressor> = Box::new(MemDecompressor { data: archive, position: 0 });
        ReadPath::new(store, reader)
    }

    #[test]
    fn reads_plain_file_content() {
        let mut archive = pack("a.txt", crate::tar_scanner::TYPE_REGULAR, b"hello world", "");
        archive.extend([0u8; 1024]);
        let rp = build_read_path(archive);
        let data = rp.read("", "a.txt", 0, 100).unwrap();
        assert_eq!(data, b"hello world");
        let partial = rp.read("", "a.txt", 6, 5).unwrap();
        assert_eq!(partial, b"world");
    }

    #[test]
    fn lookup_missing_entry_is_not_found() {
        let mut archive = pack("a.txt", crate::tar_scanner::TYPE_REGULAR, b"x", "");
        archive.extend([0u8; 1024]);
        let rp = build_read_path(archive);
        assert!(matches!(rp.lookup("", "missing.txt"), Err(TarFsError::NotFound(_))));
    }

    #[test]
    fn hardlink_dereferences_to_target_content() {
        let mut archive = pack("real.txt", crate::tar_scanner::TYPE_REGULAR, b"payload", "");
        archive.extend(pack("alias.txt", crate::tar_scanner::TYPE_HARDLINK, b"", "real.txt"));
        archive.extend([0u8; 1024]);
        let rp = build_read_path(archive);
        let data = rp.read("", "alias.txt", 0, 100).unwrap();
        assert_eq!(data, b"payload");
    }

    #[test]
    fn hardlink_pointing_to_itself_is_a_loop() {
        let mut archive = pack("self.txt", crate::tar_scanner::TYPE_HARDLINK, b"", "self.txt");
        archive.extend([0u8; 1024]);
        let rp = build_read_path(archive);
        assert!(matches!(rp.read("", "self.txt", 0, 10), Err(TarFsError::LinkLoop(_))));
    }

    #[test]
    fn symlink_readlink_returns_target() {
        let mut archive = pack("link", crate::tar_scanner::TYPE_SYMLINK, b"", "/real/target");
        archive.extend([0u8; 1024]);
        let rp = build_read_path(archive);
        assert_eq!(rp.readlink("", "link").unwrap(), "/real/target");
    }

    #[test]
    fn readdir_lists_directory_members() {
        let mut archive = pack("a.txt", crate::tar_scanner::TYPE_REGULAR, b"1", "");
        archive.extend(pack("b.txt", crate::tar_scanner::TYPE_REGULAR, b"2", ""));
        archive.extend([0u8; 1024]);
        let rp = build_read_path(archive);
        let names: Vec<String> = rp.readdir("").unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }
}
