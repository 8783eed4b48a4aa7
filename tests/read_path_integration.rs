//! End-to-end coverage of indexing + reading through the public API,
//! without a real FUSE mount: builds small TAR byte streams by hand, runs
//! them through the Indexer into a real (file-backed) SQLite index, then
//! drives `ReadPath` against an in-memory stand-in for the archive stream.

use std::io::Cursor;

use tempfile::NamedTempFile;

use tarfs::compressed::{SeekTable, SeekableDecompressor};
use tarfs::config::MountConfig;
use tarfs::error::{Result, TarFsError};
use tarfs::index_store::IndexStore;
use tarfs::indexer::Indexer;
use tarfs::read_path::ReadPath;
use tarfs::tar_scanner::{TYPE_GNU_SPARSE, TYPE_HARDLINK, TYPE_REGULAR, TYPE_SYMLINK};

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

fn checksum(buf: &mut [u8; 512]) {
    let mut sum: u64 = 0;
    for &b in buf.iter() {
        sum += b as u64;
    }
    let chksum = format!("{sum:06o}\0 ");
    buf[148..148 + chksum.len()].copy_from_slice(chksum.as_bytes());
}

fn write_common(buf: &mut [u8; 512], name: &str, typeflag: u8, size: u64, linkname: &str) {
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
}

fn pack(name: &str, typeflag: u8, data: &[u8], linkname: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let mut header = [0u8; 512];
    write_common(&mut header, name, typeflag, data.len() as u64, linkname);
    checksum(&mut header);
    out.extend_from_slice(&header);
    out.extend_from_slice(data);
    let pad = pad_to_block(data.len() as u64) as usize - data.len();
    out.extend(std::iter::repeat(0u8).take(pad));
    out
}

/// Packs an old-GNU sparse member: `segments` describe the logical layout,
/// `compact_data` is the real bytes stored contiguously (holes elided).
fn pack_sparse(name: &str, logical_size: u64, segments: &[(u64, u64)], compact_data: &[u8]) -> Vec<u8> {
    assert!(segments.len() <= 4, "test helper only fills the inline sparse slots");
    let mut header = [0u8; 512];
    write_common(&mut header, name, TYPE_GNU_SPARSE, compact_data.len() as u64, "");
    for (i, &(offset, numbytes)) in segments.iter().enumerate() {
        let base = 386 + i * 24;
        let offset_str = format!("{offset:011o}\0");
        header[base..base + offset_str.len()].copy_from_slice(offset_str.as_bytes());
        let numbytes_str = format!("{numbytes:011o}\0");
        header[base + 12..base + 12 + numbytes_str.len()].copy_from_slice(numbytes_str.as_bytes());
    }
    header[482] = 0; // no extension blocks needed for <= 4 segments
    let realsize_str = format!("{logical_size:011o}\0");
    header[483..483 + realsize_str.len()].copy_from_slice(realsize_str.as_bytes());
    checksum(&mut header);

    let mut out = Vec::new();
    out.extend_from_slice(&header);
    out.extend_from_slice(compact_data);
    let pad = pad_to_block(compact_data.len() as u64) as usize - compact_data.len();
    out.extend(std::iter::repeat(0u8).take(pad));
    out
}

fn build_read_path(archive: Vec<u8>, recursive: bool) -> ReadPath {
    let tmp = NamedTempFile::new().unwrap();
    let store = IndexStore::open_for_write(tmp.path()).unwrap();
    let mut config = MountConfig::default();
    config.recursive = recursive;
    {
        let mut indexer = Indexer::new(&store, &config);
        indexer.begin().unwrap();
        let (_count, mut pending) = indexer.scan(Cursor::new(archive.clone()), "", 0).unwrap();
        let mut i = 0;
        while i < pending.len() {
            let candidate = pending[i].clone();
            i += 1;
            let prefix = if candidate.path.is_empty() {
                format!("/{}", candidate.name)
            } else {
                format!("{}/{}", candidate.path, candidate.name)
            };
            let start = candidate.offset_data as usize;
            let end = start + candidate.size as usize;
            let inner = Cursor::new(archive[start..end].to_vec());
            if let Ok((_, mut nested)) = indexer.scan(inner, &prefix, candidate.offset_data) {
                indexer.promote_to_directory(&candidate.path, &candidate.name).unwrap();
                pending.append(&mut nested);
            }
        }
        indexer.finish().unwrap();
    }
    let reader: Box<dyn SeekableDecompressor> = Box::new(MemDecompressor { data: archive, position: 0 });
    ReadPath::new(store, reader)
}

#[test]
fn flat_archive_round_trips_full_and_partial_reads() {
    let mut archive = pack("greeting.txt", TYPE_REGULAR, b"hello, tarfs!", "");
    archive.extend([0u8; 1024]);
    let rp = build_read_path(archive, false);

    assert_eq!(rp.read("", "greeting.txt", 0, 64).unwrap(), b"hello, tarfs!");
    assert_eq!(rp.read("", "greeting.txt", 7, 5).unwrap(), b"tarfs");
    assert_eq!(rp.read("", "greeting.txt", 100, 10).unwrap(), Vec::<u8>::new());
}

#[test]
fn recursive_descent_mounts_nested_archive_as_directory() {
    let inner = pack("hello", TYPE_REGULAR, b"world", "");
    let mut outer = pack("inner.tar", TYPE_REGULAR, &inner, "");
    outer.extend([0u8; 1024]);

    let rp = build_read_path(outer, true);

    let dir_entry = rp.lookup("", "inner.tar").unwrap();
    assert_eq!(dir_entry.mode, 0o555 | 0o040000);

    let data = rp.read("/inner.tar", "hello", 0, 16).unwrap();
    assert_eq!(data, b"world");
}

#[test]
fn sparse_member_expands_holes_as_zero() {
    const LOGICAL_SIZE: u64 = 1024 * 1024;
    const REGION_LEN: u64 = 4096;
    const SECOND_REGION_OFFSET: u64 = 512 * 1024;

    let first_region: Vec<u8> = (0..REGION_LEN).map(|i| (i % 251) as u8).collect();
    let second_region: Vec<u8> = (0..REGION_LEN).map(|i| ((i * 3) % 251) as u8).collect();
    let mut compact = first_region.clone();
    compact.extend_from_slice(&second_region);

    let segments = [(0u64, REGION_LEN), (SECOND_REGION_OFFSET, REGION_LEN)];
    let mut archive = pack_sparse("hole.bin", LOGICAL_SIZE, &segments, &compact);
    archive.extend([0u8; 1024]);

    let rp = build_read_path(archive, false);

    let head = rp.read("", "hole.bin", 0, REGION_LEN as u32).unwrap();
    assert_eq!(head, first_region);

    let hole = rp.read("", "hole.bin", REGION_LEN + 100, 256).unwrap();
    assert_eq!(hole, vec![0u8; 256]);

    let second = rp.read("", "hole.bin", SECOND_REGION_OFFSET, REGION_LEN as u32).unwrap();
    assert_eq!(second, second_region);

    // Read the whole expanded file in one shot (well within u32, since
    // LOGICAL_SIZE is 1 MiB) and check every byte lands where expected.
    let whole = rp.read("", "hole.bin", 0, LOGICAL_SIZE as u32).unwrap();
    assert_eq!(whole.len(), LOGICAL_SIZE as usize);
    assert_eq!(&whole[0..REGION_LEN as usize], &first_region[..]);
    assert!(whole[REGION_LEN as usize..SECOND_REGION_OFFSET as usize].iter().all(|&b| b == 0));
    assert_eq!(&whole[SECOND_REGION_OFFSET as usize..(SECOND_REGION_OFFSET + REGION_LEN) as usize], &second_region[..]);
    assert!(whole[(SECOND_REGION_OFFSET + REGION_LEN) as usize..].iter().all(|&b| b == 0));
}

#[test]
fn hardlink_across_directories_resolves_to_target_bytes() {
    let mut archive = pack("real/payload.bin", TYPE_REGULAR, b"shared content", "");
    archive.extend(pack("links/alias.bin", TYPE_HARDLINK, b"", "real/payload.bin"));
    archive.extend([0u8; 1024]);
    let rp = build_read_path(archive, false);

    let data = rp.read("/links", "alias.bin", 0, 64).unwrap();
    assert_eq!(data, b"shared content");
}

#[test]
fn self_referential_hardlink_is_rejected_as_a_loop() {
    let mut archive = pack("cycle.bin", TYPE_HARDLINK, b"", "cycle.bin");
    archive.extend([0u8; 1024]);
    let rp = build_read_path(archive, false);

    match rp.read("", "cycle.bin", 0, 16) {
        Err(TarFsError::LinkLoop(_)) => {}
        other => panic!("expected LinkLoop, got {other:?}"),
    }
}

#[test]
fn symlink_readlink_names_target_and_target_reads_normally() {
    // A symlink's own `read` is never exercised through `ReadPath`: a real
    // mount relies on the kernel following the link (via `readlink`) before
    // ever issuing a `read` against the resolved path. This checks both
    // halves of that contract independently.
    let mut archive = pack("a.txt", TYPE_REGULAR, b"0123456789", "");
    archive.extend(pack("link", TYPE_SYMLINK, b"", "a.txt"));
    archive.extend([0u8; 1024]);
    let rp = build_read_path(archive, false);

    assert_eq!(rp.readlink("", "link").unwrap(), "a.txt");
    assert_eq!(rp.read("", "a.txt", 2, 5).unwrap(), b"23456");
}

#[test]
fn missing_entry_reports_not_found() {
    let mut archive = pack("only.txt", TYPE_REGULAR, b"x", "");
    archive.extend([0u8; 1024]);
    let rp = build_read_path(archive, false);

    match rp.lookup("", "absent.txt") {
        Err(TarFsError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}
