//! Stenciled file — a virtual byte stream assembled from disjoint
//! `(offset, length)` slices of a backing file.
//!
//! Used by the read path to reconstruct a sparse TAR member: the member's
//! encoded payload plus its header live in one contiguous span of the
//! underlying (decompressed) archive, and a fresh TAR parser is pointed at
//! that span through a [`StencilFile`] to pull out the single entry it
//! contains.

use std::io::{self, Read, Seek, SeekFrom};

use crate::error::{Result, TarFsError};

/// One `(offset, length)` slice into a backing file. `offset` is measured
/// from the start of the backing file; `length` must be greater than zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stencil {
    pub offset: u64,
    pub length: u64,
}

impl Stencil {
    pub fn new(offset: u64, length: u64) -> Self {
        assert!(length > 0, "stencil length must be > 0");
        Self { offset, length }
    }
}

/// A virtual file over an ordered list of stencils. Duplicates are allowed:
/// the same backing range may be stenciled in more than once.
pub struct StencilFile<F> {
    backing: F,
    stencils: Vec<Stencil>,
    /// `cumulative[i]` is the virtual offset at which `stencils[i]` begins;
    /// `cumulative[stencils.len()]` is the total virtual size.
    cumulative: Vec<u64>,
    position: u64,
}

impl<F: Read + Seek> StencilFile<F> {
    pub fn new(mut backing: F, stencils: Vec<Stencil>) -> io::Result<Self> {
        let mut cumulative = Vec::with_capacity(stencils.len() + 1);
        let mut total = 0u64;
        cumulative.push(0);
        for s in &stencils {
            total += s.length;
            cumulative.push(total);
        }

        let mut file = Self {
            backing: {
                backing.seek(SeekFrom::Start(0))?;
                backing
            },
            stencils,
            cumulative,
            position: 0,
        };
        file.seek_virtual(0)?;
        Ok(file)
    }

    pub fn size(&self) -> u64 {
        *self.cumulative.last().unwrap_or(&0)
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    /// Leftmost stencil index `i` such that `cumulative[i+1] > pos`, i.e.
    /// the stencil containing virtual offset `pos`. Callers must ensure
    /// `pos < size()`.
    fn find_stencil(&self, pos: u64) -> usize {
        // partition_point returns the first index where the predicate is
        // false; we want the first `i` with cumulative[i+1] > pos, which is
        // the same as one less than the first `i` with cumulative[i] > pos.
        let idx = self.cumulative.partition_point(|&c| c <= pos);
        idx.saturating_sub(1)
    }

    fn seek_virtual(&mut self, pos: u64) -> io::Result<()> {
        self.position = pos;
        if self.stencils.is_empty() || pos >= self.size() {
            return Ok(());
        }
        let i = self.find_stencil(pos);
        let inside = pos - self.cumulative[i];
        self.backing
            .seek(SeekFrom::Start(self.stencils[i].offset + inside))?;
        Ok(())
    }

    pub fn seek(&mut self, offset: i64, whence: SeekFrom) -> Result<u64> {
        let base = match whence {
            SeekFrom::Start(_) => 0,
            SeekFrom::Current(_) => self.position as i64,
            SeekFrom::End(_) => self.size() as i64,
        };
        let new_pos = base + offset;
        if new_pos < 0 {
            return Err(TarFsError::InvalidSeek(format!(
                "seek to negative offset {new_pos}"
            )));
        }
        self.seek_virtual(new_pos as u64)?;
        Ok(self.position)
    }

    /// Reads up to `buf.len()` bytes, transparently crossing stencil
    /// boundaries. Returns fewer bytes than requested only at end-of-stream.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() && self.position < self.size() {
            let i = self.find_stencil(self.position);
            let stencil = self.stencils[i];
            let inside = self.position - self.cumulative[i];
            let remaining_in_stencil = stencil.length - inside;
            let want = (buf.len() - filled) as u64;
            let take = want.min(remaining_in_stencil) as usize;

            self.backing.read_exact(&mut buf[filled..filled + take])?;
            filled += take;
            self.position += take as u64;

            // Crossing into the next stencil: the backing file's position
            // tracks ours automatically unless we just exhausted this one,
            // in which case the next loop iteration reseeks explicitly.
            if take as u64 == remaining_in_stencil && self.position < self.size() {
                let next = self.find_stencil(self.position);
                self.backing
                    .seek(SeekFrom::Start(self.stencils[next].offset))?;
            }
        }
        Ok(filled)
    }
}

impl<F: Read + Seek> Read for StencilFile<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        StencilFile::read(self, buf)
    }
}

impl<F: Read + Seek> Seek for StencilFile<F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let offset = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(n) => n,
            SeekFrom::End(n) => n,
        };
        StencilFile::seek(self, offset, pos)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn backing() -> Cursor<Vec<u8>> {
        Cursor::new((0u8..100).collect())
    }

    #[test]
    fn single_stencil_is_transparent() {
        let mut f = StencilFile::new(backing(), vec![Stencil::new(10, 20)]).unwrap();
        let mut buf = [0u8; 20];
        assert_eq!(f.read(&mut buf).unwrap(), 20);
        assert_eq!(buf.to_vec(), (10u8..30).collect::<Vec<u8>>());
    }

    #[test]
    fn crosses_stencil_boundary() {
        let stencils = vec![Stencil::new(0, 5), Stencil::new(50, 5)];
        let mut f = StencilFile::new(backing(), stencils).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(f.read(&mut buf).unwrap(), 10);
        let mut expected: Vec<u8> = (0u8..5).collect();
        expected.extend(50u8..55);
        assert_eq!(buf.to_vec(), expected);
    }

    #[test]
    fn seek_into_second_stencil() {
        let stencils = vec![Stencil::new(0, 5), Stencil::new(50, 5)];
        let mut f = StencilFile::new(backing(), stencils).unwrap();
        f.seek(7, SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(f.read(&mut buf).unwrap(), 3);
        assert_eq!(buf.to_vec(), vec![52, 53, 54]);
    }

    #[test]
    fn negative_seek_is_rejected() {
        let mut f = StencilFile::new(backing(), vec![Stencil::new(0, 5)]).unwrap();
        assert!(f.seek(-1, SeekFrom::Start(0)).is_err());
    }

    #[test]
    fn read_past_eof_yields_short_read() {
        let mut f = StencilFile::new(backing(), vec![Stencil::new(0, 5)]).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(f.read(&mut buf).unwrap(), 5);
        assert_eq!(f.read(&mut buf).unwrap(), 0);
    }
}
