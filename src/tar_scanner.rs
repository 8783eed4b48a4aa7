//! TAR Scanner — sequential header parser.
//!
//! # On-disk layout (512-byte USTAR/GNU header, all numeric fields ASCII octal)
//!
//! ```text
//! Offset  Size  Field
//!    0    100   name
//!  100      8   mode    (octal)
//!  108      8   uid     (octal, or GNU base-256 if high bit of byte 0 set)
//!  116      8   gid     (octal, or GNU base-256)
//!  124     12   size    (octal, or GNU base-256)
//!  136     12   mtime   (octal)
//!  148      8   chksum  (octal, header checksummed with this field blanked)
//!  156      1   typeflag
//!  157    100   linkname
//!  257      6   magic        "ustar\0" or "ustar  \0" (GNU)
//!  263      2   version
//!  265     32   uname
//!  297     32   gname
//!  329      8   devmajor (octal)
//!  337      8   devminor (octal)
//!  345    155   prefix (USTAR long-path extension)
//!  500     12   padding to 512
//! ```
//!
//! GNU long-name/long-link entries (`typeflag` `L`/`K`) and PAX extended
//! headers (`x`/`g`) precede the member they describe and are consumed
//! transparently: their payload overrides `name`/`linkname`/other fields on
//! the next real member. Old-GNU sparse headers (`typeflag` `S`) and PAX 0.1
//! `GNU.sparse.map` records are parsed into a [`SparseSegment`] list so the
//! read path can expand the member without re-deriving the layout. PAX 1.0
//! sparse (map embedded in the file payload) is not supported — archives
//! using it are vanishingly rare outside GNU tar's own test suite.

use std::collections::HashMap;
use std::io::Read;

use crate::error::{Result, TarFsError};

pub const BLOCK_SIZE: u64 = 512;

pub const TYPE_REGULAR: u8 = b'0';
pub const TYPE_REGULAR_NUL: u8 = 0;
pub const TYPE_HARDLINK: u8 = b'1';
pub const TYPE_SYMLINK: u8 = b'2';
pub const TYPE_CHR: u8 = b'3';
pub const TYPE_BLK: u8 = b'4';
pub const TYPE_DIR: u8 = b'5';
pub const TYPE_FIFO: u8 = b'6';
pub const TYPE_CONTIGUOUS: u8 = b'7';
pub const TYPE_GNU_LONGLINK: u8 = b'K';
pub const TYPE_GNU_LONGNAME: u8 = b'L';
pub const TYPE_GNU_SPARSE: u8 = b'S';
pub const TYPE_PAX_EXTENDED: u8 = b'x';
pub const TYPE_PAX_GLOBAL: u8 = b'g';

#[derive(Debug, Clone, Copy)]
pub struct SparseSegment {
    /// Offset in the expanded logical file where this run of real data begins.
    pub offset: u64,
    /// Length of the run of real (non-hole) data.
    pub numbytes: u64,
}

#[derive(Debug, Clone)]
pub struct ScannedMember {
    pub name: String,
    pub typeflag: u8,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub linkname: String,
    pub is_sparse: bool,
    pub sparse_map: Vec<SparseSegment>,
    /// Absolute offset (relative to the start of this scan) of the header block.
    pub offset_header: u64,
    /// Absolute offset of the member's payload.
    pub offset_data: u64,
}

/// Parses ASCII-octal tar numeric fields, including the GNU base-256
/// extension used for values too large to fit in octal (sizes > 8 GiB,
/// negative mtimes): when the first byte has its high bit set, the
/// remaining bytes are a big-endian two's-complement integer.
fn parse_numeric(buf: &[u8]) -> Result<u64> {
    if buf.is_empty() {
        return Ok(0);
    }
    if buf[0] & 0x80 != 0 {
        let mut v: u64 = (buf[0] & 0x7f) as u64;
        for &b in &buf[1..] {
            v = (v << 8) | b as u64;
        }
        return Ok(v);
    }
    let mut n: u64 = 0;
    for &c in buf {
        if c == 0 || c == b' ' {
            if n != 0 || c == 0 {
                break;
            }
            continue;
        }
        if !(b'0'..=b'7').contains(&c) {
            return Err(TarFsError::DecodeError(format!(
                "illegal octal digit {c:#04x} in tar header"
            )));
        }
        n = n * 8 + (c - b'0') as u64;
    }
    Ok(n)
}

fn parse_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn is_zero_block(buf: &[u8; 512]) -> bool {
    buf.iter().all(|&b| b == 0)
}

fn checksum_ok(buf: &[u8; 512]) -> bool {
    let stored = parse_numeric(&buf[148..156]).unwrap_or(u64::MAX);
    let mut unsigned_sum: u64 = 0;
    for (i, &b) in buf.iter().enumerate() {
        unsigned_sum += if (148..156).contains(&i) { b' ' as u64 } else { b as u64 };
    }
    unsigned_sum == stored
}

struct RawHeader {
    name: String,
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    mtime: i64,
    typeflag: u8,
    linkname: String,
    prefix: String,
}

fn parse_raw_header(buf: &[u8; 512]) -> Result<RawHeader> {
    let name = parse_string(&buf[0..100]);
    let mode = parse_numeric(&buf[100..108])? as u32;
    let uid = parse_numeric(&buf[108..116])? as u32;
    let gid = parse_numeric(&buf[116..124])? as u32;
    let size = parse_numeric(&buf[124..136])?;
    let mtime = parse_numeric(&buf[136..148])? as i64;
    let typeflag = buf[156];
    let linkname = parse_string(&buf[157..257]);
    let prefix = parse_string(&buf[345..500]);
    Ok(RawHeader { name, mode, uid, gid, size, mtime, typeflag, linkname, prefix })
}

fn rounded_up(size: u64) -> u64 {
    (size + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE
}

/// Parses PAX extended-header records (`"%d %s=%s\n"`, length-prefixed).
fn parse_pax_records(data: &[u8]) -> HashMap<String, String> {
    let mut records = HashMap::new();
    let mut pos = 0;
    while pos < data.len() {
        // Leading decimal length, a space, "key=value", trailing '\n'.
        let len_start = pos;
        while pos < data.len() && data[pos] != b' ' {
            pos += 1;
        }
        if pos >= data.len() {
            break;
        }
        let len_str = match std::str::from_utf8(&data[len_start..pos]) {
            Ok(s) => s,
            Err(_) => break,
        };
        let record_len: usize = match len_str.parse() {
            Ok(n) => n,
            Err(_) => break,
        };
        let record_end = len_start + record_len;
        if record_len == 0 || record_end > data.len() {
            break;
        }
        let body = &data[pos + 1..record_end.saturating_sub(1)];
        if let Some(eq) = body.iter().position(|&b| b == b'=') {
            let key = String::from_utf8_lossy(&body[..eq]).into_owned();
            let value = String::from_utf8_lossy(&body[eq + 1..]).into_owned();
            records.insert(key, value);
        }
        pos = record_end;
    }
    records
}

/// Parses `GNU.sparse.map`'s comma-separated `offset,numbytes,offset,numbytes,...`.
fn parse_pax_sparse_map(raw: &str) -> Vec<SparseSegment> {
    let nums: Vec<u64> = raw.split(',').filter_map(|s| s.parse().ok()).collect();
    nums.chunks_exact(2)
        .map(|pair| SparseSegment { offset: pair[0], numbytes: pair[1] })
        .collect()
}

/// Parses an old-GNU sparse header's four inline `(offset, numbytes)` entries
/// plus any `isextended` continuation blocks, each holding 21 more entries.
struct OldGnuSparse<'a, R: Read> {
    reader: &'a mut R,
}

impl<'a, R: Read> OldGnuSparse<'a, R> {
    fn parse_entries(buf: &[u8]) -> Result<Vec<SparseSegment>> {
        let mut out = Vec::new();
        for chunk in buf.chunks_exact(24) {
            let offset = parse_numeric(&chunk[0..12])?;
            let numbytes = parse_numeric(&chunk[12..24])?;
            if offset == 0 && numbytes == 0 {
                continue;
            }
            out.push(SparseSegment { offset, numbytes });
        }
        Ok(out)
    }

    /// Returns `(realsize, segments, extension_blocks_consumed)`.
    fn read(&mut self, header: &[u8; 512]) -> Result<(u64, Vec<SparseSegment>, u64)> {
        let realsize = parse_numeric(&header[483..495])?;
        let mut segments = Self::parse_entries(&header[386..482])?;
        let mut is_extended = header[482] != 0;
        let mut extension_blocks = 0u64;
        while is_extended {
            let mut ext = [0u8; 512];
            self.reader.read_exact(&mut ext)?;
            extension_blocks += 1;
            segments.extend(Self::parse_entries(&ext[0..504])?);
            is_extended = ext[504] != 0;
        }
        Ok((realsize, segments, extension_blocks))
    }
}

pub struct TarScanner<R: Read> {
    reader: R,
    position: u64,
    pending_long_name: Option<String>,
    pending_long_link: Option<String>,
    pending_pax: HashMap<String, String>,
    ended: bool,
}

impl<R: Read> TarScanner<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            position: 0,
            pending_long_name: None,
            pending_long_link: None,
            pending_pax: HashMap::new(),
            ended: false,
        }
    }

    fn read_block(&mut self) -> Result<Option<[u8; 512]>> {
        let mut buf = [0u8; 512];
        let mut read_total = 0usize;
        while read_total < 512 {
            let n = self.reader.read(&mut buf[read_total..])?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        if read_total == 0 {
            return Ok(None);
        }
        if read_total < 512 {
            return Err(TarFsError::UnexpectedEnd { bytes_read: self.position + read_total as u64 });
        }
        self.position += 512;
        Ok(Some(buf))
    }

    fn read_payload(&mut self, size: u64) -> Result<Vec<u8>> {
        let padded = rounded_up(size);
        let mut buf = vec![0u8; padded as usize];
        self.reader.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TarFsError::UnexpectedEnd { bytes_read: self.position }
            } else {
                TarFsError::Io(e)
            }
        })?;
        self.position += padded;
        buf.truncate(size as usize);
        Ok(buf)
    }

    /// Skips (and discards) `size` bytes of payload, rounded to the next
    /// block boundary, without allocating a buffer for data we never use.
    fn skip_payload(&mut self, size: u64) -> Result<()> {
        let padded = rounded_up(size);
        let mut remaining = padded;
        let mut scratch = [0u8; 4096];
        while remaining > 0 {
            let take = remaining.min(scratch.len() as u64) as usize;
            self.reader.read_exact(&mut scratch[..take]).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    TarFsError::UnexpectedEnd { bytes_read: self.position }
                } else {
                    TarFsError::Io(e)
                }
            })?;
            remaining -= take as u64;
        }
        self.position += padded;
        Ok(())
    }

    /// Returns the next member, or `Ok(None)` at a clean end-of-archive
    /// (two consecutive zero blocks, or a clean EOF). Internal long-name /
    /// PAX accumulation state is cleared once a real member is yielded, so
    /// memory use stays O(1) per member regardless of archive size.
    pub fn next_member(&mut self) -> Result<Option<ScannedMember>> {
        if self.ended {
            return Ok(None);
        }
        loop {
            let offset_header = self.position;
            let block = match self.read_block()? {
                Some(b) => b,
                None => {
                    self.ended = true;
                    return Ok(None);
                }
            };
            if is_zero_block(&block) {
                self.ended = true;
                return Ok(None);
            }
            if !checksum_ok(&block) {
                return Err(TarFsError::DecodeError(format!(
                    "header checksum mismatch at offset {offset_header}"
                )));
            }

            let raw = parse_raw_header(&block)?;

            match raw.typeflag {
                TYPE_GNU_LONGNAME => {
                    let payload = self.read_payload(raw.size)?;
                    self.pending_long_name = Some(strip_trailing_nul(&payload));
                    continue;
                }
                TYPE_GNU_LONGLINK => {
                    let payload = self.read_payload(raw.size)?;
                    self.pending_long_link = Some(strip_trailing_nul(&payload));
                    continue;
                }
                TYPE_PAX_EXTENDED | TYPE_PAX_GLOBAL => {
                    let payload = self.read_payload(raw.size)?;
                    let records = parse_pax_records(&payload);
                    if raw.typeflag == TYPE_PAX_EXTENDED {
                        self.pending_pax.extend(records);
                    }
                    continue;
                }
                _ => {}
            }

            let mut offset_data = self.position;

            let mut is_sparse = raw.typeflag == TYPE_GNU_SPARSE;
            let mut sparse_map = Vec::new();
            let mut size = raw.size;

            if is_sparse {
                let mut parser = OldGnuSparse { reader: &mut self.reader };
                let (realsize, segments, extension_blocks) = parser.read(&block)?;
                self.position += extension_blocks * 512;
                offset_data = self.position;
                size = realsize;
                sparse_map = segments;
            } else if let Some(map) = self.pending_pax.get("GNU.sparse.map") {
                is_sparse = true;
                sparse_map = parse_pax_sparse_map(map);
                if let Some(realsize) = self.pending_pax.get("GNU.sparse.realsize") {
                    if let Ok(n) = realsize.parse() {
                        size = n;
                    }
                }
            }

            let mut name = if raw.prefix.is_empty() {
                raw.name.clone()
            } else {
                format!("{}/{}", raw.prefix, raw.name)
            };
            let mut linkname = raw.linkname.clone();
            let mut mtime = raw.mtime;
            let mut mode = raw.mode;
            let mut uid = raw.uid;
            let mut gid = raw.gid;

            if let Some(n) = self.pending_long_name.take() {
                name = n;
            }
            if let Some(l) = self.pending_long_link.take() {
                linkname = l;
            }
            if let Some(v) = self.pending_pax.remove("path") {
                name = v;
            }
            if let Some(v) = self.pending_pax.remove("linkpath") {
                linkname = v;
            }
            if let Some(v) = self.pending_pax.remove("size") {
                if let Ok(n) = v.parse() {
                    size = n;
                }
            }
            if let Some(v) = self.pending_pax.remove("mtime") {
                if let Ok(n) = v.parse::<f64>() {
                    mtime = n as i64;
                }
            }
            if let Some(v) = self.pending_pax.remove("uid") {
                if let Ok(n) = v.parse() {
                    uid = n;
                }
            }
            if let Some(v) = self.pending_pax.remove("gid") {
                if let Ok(n) = v.parse() {
                    gid = n;
                }
            }
            self.pending_pax.clear();

            // `raw.size` is always the number of bytes actually stored on
            // disk for this member (for sparse members that is the
            // compacted size, not the expanded `size` computed above).
            self.skip_payload(raw.size)?;

            return Ok(Some(ScannedMember {
                name,
                typeflag: raw.typeflag,
                size,
                mtime,
                mode,
                uid,
                gid,
                linkname,
                is_sparse,
                sparse_map,
                offset_header,
                offset_data,
            }));
        }
    }
}

fn strip_trailing_nul(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Filesystem type bits to OR into `mode`, chosen by TAR typeflag — mirrors
/// what the indexer does with `S_IFDIR`/`S_IFREG`/etc in the original.
pub fn type_mode_bits(typeflag: u8) -> u32 {
    const S_IFREG: u32 = 0o100000;
    const S_IFLNK: u32 = 0o120000;
    const S_IFCHR: u32 = 0o020000;
    const S_IFBLK: u32 = 0o060000;
    const S_IFDIR: u32 = 0o040000;
    const S_IFIFO: u32 = 0o010000;
    match typeflag {
        TYPE_REGULAR | TYPE_REGULAR_NUL | TYPE_CONTIGUOUS => S_IFREG,
        TYPE_HARDLINK => S_IFREG,
        TYPE_SYMLINK => S_IFLNK,
        TYPE_CHR => S_IFCHR,
        TYPE_BLK => S_IFBLK,
        TYPE_DIR => S_IFDIR,
        TYPE_FIFO => S_IFIFO,
        _ => S_IFREG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_header(
        buf: &mut [u8; 512],
        name: &str,
        typeflag: u8,
        size: u64,
        mode: u32,
        linkname: &str,
    ) {
        buf.iter_mut().for_each(|b| *b = 0);
        buf[0..name.len()].copy_from_slice(name.as_bytes());
        let mode_str = format!("{mode:07o}\0");
        buf[100..100 + mode_str.len()].copy_from_slice(mode_str.as_bytes());
        let uid_str = b"0000000\0";
        buf[108..116].copy_from_slice(uid_str);
        buf[116..124].copy_from_slice(uid_str);
        let size_str = format!("{size:011o}\0");
        buf[124..124 + size_str.len()].copy_from_slice(size_str.as_bytes());
        let mtime_str = b"00000000000\0";
        buf[136..148].copy_from_slice(mtime_str);
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

    fn pack_member(name: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut header = [0u8; 512];
        write_header(&mut header, name, TYPE_REGULAR, data.len() as u64, 0o644, "");
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        let pad = rounded_up(data.len() as u64) as usize - data.len();
        out.extend(std::iter::repeat(0u8).take(pad));
        out
    }

    #[test]
    fn parses_single_regular_member() {
        let archive = pack_member("a.txt", b"0123456789");
        let mut scanner = TarScanner::new(Cursor::new(archive));
        let m = scanner.next_member().unwrap().unwrap();
        assert_eq!(m.name, "a.txt");
        assert_eq!(m.size, 10);
        assert_eq!(m.offset_header, 0);
        assert_eq!(m.offset_data, 512);
        assert!(scanner.next_member().unwrap().is_none());
    }

    #[test]
    fn parses_multiple_members_sequentially() {
        let mut archive = pack_member("a.txt", b"hello");
        archive.extend(pack_member("dir/b.txt", b"xyz"));
        archive.extend([0u8; 1024]);
        let mut scanner = TarScanner::new(Cursor::new(archive));
        let m1 = scanner.next_member().unwrap().unwrap();
        assert_eq!(m1.name, "a.txt");
        let m2 = scanner.next_member().unwrap().unwrap();
        assert_eq!(m2.name, "dir/b.txt");
        assert!(scanner.next_member().unwrap().is_none());
    }

    #[test]
    fn gnu_long_name_overrides_short_name() {
        let long_name = "a/".to_string() + &"b".repeat(200);
        let mut archive = Vec::new();
        let mut long_header = [0u8; 512];
        write_header(
            &mut long_header,
            "././@LongLink",
            TYPE_GNU_LONGNAME,
            (long_name.len() + 1) as u64,
            0,
            "",
        );
        archive.extend_from_slice(&long_header);
        let mut name_payload = long_name.clone().into_bytes();
        name_payload.push(0);
        let pad = rounded_up(name_payload.len() as u64) as usize - name_payload.len();
        archive.extend_from_slice(&name_payload);
        archive.extend(std::iter::repeat(0u8).take(pad));

        let mut real_header = [0u8; 512];
        write_header(&mut real_header, "", TYPE_REGULAR, 4, 0o644, "");
        archive.extend_from_slice(&real_header);
        archive.extend_from_slice(b"data");
        archive.extend(std::iter::repeat(0u8).take(508));

        let mut scanner = TarScanner::new(Cursor::new(archive));
        let m = scanner.next_member().unwrap().unwrap();
        assert_eq!(m.name, long_name);
        assert_eq!(m.size, 4);
    }

    #[test]
    fn truncated_archive_surfaces_unexpected_end() {
        let mut header = [0u8; 512];
        write_header(&mut header, "a.txt", TYPE_REGULAR, 100, 0o644, "");
        let mut archive = header.to_vec();
        archive.extend(vec![0u8; 10]); // much less than the declared 100 bytes + padding
        let mut scanner = TarScanner::new(Cursor::new(archive));
        match scanner.next_member() {
            Err(TarFsError::UnexpectedEnd { .. }) => {}
            other => panic!("expected UnexpectedEnd, got {other:?}"),
        }
    }
}
