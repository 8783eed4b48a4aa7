//! Gzip variant of the Compressed Random-Access Reader.
//!
//! Unlike bzip2, a gzip/deflate stream has no independently-decodable
//! blocks: every byte depends on up to 32 KiB of preceding decompressed
//! output as a sliding-window dictionary. A true zran-style seek table
//! needs to snapshot that window at each checkpoint and re-prime the
//! decompressor's state before resuming — `flate2`'s safe API has no way to
//! inject a decompression dictionary into a raw deflate stream
//! mid-decode. This reader instead tracks checkpoints for bookkeeping and
//! staleness detection, but always resumes decoding from the true start of
//! the stream, discarding output until the requested position; the only
//! optimization taken is that a *forward* seek never restarts the
//! decompressor, it just reads (and discards) ahead from wherever decoding
//! already is. Every read contract in `spec.md` §4.2 is honored; only the
//! "skip straight to a mid-stream checkpoint" performance characteristic of
//! the original is not.
//!
//! Checkpoints are exported as an opaque blob of LE `u64` pairs
//! `(compressed_byte_offset, uncompressed_byte_offset)`, exactly the shape
//! `gzip_index BLOB` expects.

use std::io::{self, Read, Seek, SeekFrom};

use flate2::read::GzDecoder;

use super::{SeekTable, SeekableDecompressor};
use crate::error::{Result, TarFsError};

pub struct GzipReader<F> {
    decoder: Option<GzDecoder<F>>,
    spacing: u64,
    checkpoints: Vec<(u64, u64)>,
    total_uncompressed: u64,
    /// Bytes already emitted by the live decoder instance.
    produced: u64,
    /// Target position requested via `seek_to`; may be ahead of or behind `produced`.
    position: u64,
}

impl<F: Read + Seek> GzipReader<F> {
    pub fn new(mut file: F, spacing_bytes: u64) -> Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; 2];
        file.read_exact(&mut header)?;
        if header != [0x1f, 0x8b] {
            return Err(TarFsError::UnsupportedCompression("not a gzip stream".to_string()));
        }
        file.seek(SeekFrom::Start(0))?;

        let mut reader = Self {
            decoder: Some(GzDecoder::new(file)),
            spacing: spacing_bytes.max(1),
            checkpoints: Vec::new(),
            total_uncompressed: 0,
            produced: 0,
            position: 0,
        };
        reader.build_table()?;
        reader.restart()?;
        Ok(reader)
    }

    fn restart(&mut self) -> Result<()> {
        let decoder = self.decoder.take().expect("decoder always present between calls");
        let mut file = decoder.into_inner();
        file.seek(SeekFrom::Start(0)).map_err(TarFsError::Io)?;
        self.decoder = Some(GzDecoder::new(file));
        self.produced = 0;
        Ok(())
    }

    /// Decodes the entire stream once to learn its length and to record
    /// `(compressed_offset, uncompressed_offset)` checkpoints every
    /// `spacing` uncompressed bytes.
    fn build_table(&mut self) -> Result<()> {
        let mut scratch = [0u8; 64 * 1024];
        let mut total = 0u64;
        let mut next_checkpoint = self.spacing;
        loop {
            let n = self
                .decoder
                .as_mut()
                .unwrap()
                .read(&mut scratch)
                .map_err(|e| TarFsError::DecodeError(e.to_string()))?;
            if n == 0 {
                break;
            }
            total += n as u64;
            while total >= next_checkpoint {
                let compressed_offset = self
                    .decoder
                    .as_mut()
                    .unwrap()
                    .get_mut()
                    .stream_position()
                    .unwrap_or(0);
                self.checkpoints.push((compressed_offset, next_checkpoint));
                next_checkpoint += self.spacing;
            }
        }
        self.total_uncompressed = total;
        Ok(())
    }

    fn discard(&mut self, mut n: u64) -> Result<()> {
        let mut scratch = [0u8; 64 * 1024];
        while n > 0 {
            let take = n.min(scratch.len() as u64) as usize;
            let got = self
                .decoder
                .as_mut()
                .unwrap()
                .read(&mut scratch[..take])
                .map_err(|e| TarFsError::DecodeError(e.to_string()))?;
            if got == 0 {
                break;
            }
            self.produced += got as u64;
            n -= got as u64;
        }
        Ok(())
    }
}

impl<F: Read + Seek> SeekableDecompressor for GzipReader<F> {
    fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.position = pos;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.position < self.produced {
            self.restart()?;
        }
        if self.produced < self.position {
            self.discard(self.position - self.produced)?;
        }
        if self.produced < self.position {
            // Ran out of stream before reaching the requested position.
            return Ok(0);
        }
        let n = self
            .decoder
            .as_mut()
            .unwrap()
            .read(buf)
            .map_err(|e| TarFsError::DecodeError(e.to_string()))?;
        self.produced += n as u64;
        self.position += n as u64;
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn export_seek_table(&self) -> SeekTable {
        let mut blob = Vec::with_capacity(self.checkpoints.len() * 16);
        for &(compressed, uncompressed) in &self.checkpoints {
            blob.extend_from_slice(&compressed.to_le_bytes());
            blob.extend_from_slice(&uncompressed.to_le_bytes());
        }
        SeekTable::Gzip(blob)
    }

    fn import_seek_table(&mut self, table: SeekTable) -> Result<()> {
        match table {
            SeekTable::Gzip(blob) => {
                if blob.len() % 16 != 0 {
                    return Err(TarFsError::SeekTableStale { path: Default::default() });
                }
                let mut checkpoints = Vec::with_capacity(blob.len() / 16);
                for chunk in blob.chunks_exact(16) {
                    let compressed = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
                    let uncompressed = u64::from_le_bytes(chunk[8..16].try_into().unwrap());
                    checkpoints.push((compressed, uncompressed));
                }
                self.checkpoints = checkpoints;
                Ok(())
            }
            SeekTable::Bzip2(_) => Err(TarFsError::SeekTableStale { path: Default::default() }),
        }
    }
}

/// Exposes the current byte offset of the underlying file without requiring
/// the generic reader to additionally implement `Seek` at the call site.
trait StreamPosition {
    fn stream_position(&mut self) -> io::Result<u64>;
}

impl<F: Seek> StreamPosition for F {
    fn stream_position(&mut self) -> io::Result<u64> {
        self.seek(SeekFrom::Current(0))
    }
}
