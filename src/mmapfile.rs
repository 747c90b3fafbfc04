//! Chunked memory-mapped files with a movable read cursor.
//!
//! A file is mapped as a sequence of chunks of at most `2^chunk_size_power`
//! bytes each, and read through [`MmapInput`], an absolute-position cursor.
//! Cursors are cheap to clone; every clone addresses the same mapping but
//! keeps its own position, which is how one loaded model serves several
//! threads. Closing any cursor invalidates them all; the mapping itself is
//! unmapped once the last cursor is dropped.

use std::cell::Cell;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};

use crate::error::{Error, Result};
use crate::io::{io_err_to_map_failed, BinRead};

/// 1 GiB chunks on 64-bit targets, 256 MiB on 32-bit ones.
pub const DEFAULT_CHUNK_SIZE_POWER: u32 = if cfg!(target_pointer_width = "64") { 30 } else { 28 };

#[derive(Debug)]
struct Mapping {
    chunks: Vec<Mmap>,
    len: u64,
    chunk_size_power: u32,
    closed: AtomicBool,
}

/// A file to be opened through mmap.
#[derive(Debug, Clone)]
pub struct MmapFile {
    path: PathBuf,
    chunk_size_power: u32,
    preload: bool,
}

impl MmapFile {
    pub fn new<P: AsRef<Path>>(path: P) -> MmapFile {
        MmapFile {
            path: path.as_ref().to_path_buf(),
            chunk_size_power: DEFAULT_CHUNK_SIZE_POWER,
            preload: false,
        }
    }

    /// Override the maximum chunk size (as a power of two). Mostly useful
    /// for exercising chunk-boundary handling with small files.
    pub fn with_chunk_size_power<P: AsRef<Path>>(path: P, power: u32) -> Result<MmapFile> {
        if !(1..=30).contains(&power) {
            return Err(Error::InvalidArgument(format!(
                "chunk size power must be in 1..=30, got {power}"
            )));
        }
        Ok(MmapFile {
            path: path.as_ref().to_path_buf(),
            chunk_size_power: power,
            preload: false,
        })
    }

    /// Ask the OS to page the mapping in on open. Best-effort.
    pub fn set_preload(&mut self, preload: bool) {
        self.preload = preload;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Map the file and return a cursor positioned at byte 0.
    pub fn open_input(&self) -> Result<MmapInput> {
        let file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        let chunk_size = 1u64 << self.chunk_size_power;

        let mut chunks = Vec::with_capacity((len >> self.chunk_size_power) as usize + 1);
        let mut start = 0u64;
        while start < len {
            let size = chunk_size.min(len - start);
            let chunk = unsafe {
                MmapOptions::new()
                    .offset(start)
                    .len(size as usize)
                    .map(&file)
            }
            .map_err(|e| io_err_to_map_failed(&self.path, e))?;
            #[cfg(unix)]
            if self.preload {
                let _ = chunk.advise(memmap2::Advice::WillNeed);
            }
            chunks.push(chunk);
            start += size;
        }

        Ok(MmapInput {
            map: Arc::new(Mapping {
                chunks,
                len,
                chunk_size_power: self.chunk_size_power,
                closed: AtomicBool::new(false),
            }),
            pos: Cell::new(0),
        })
    }
}

/// Read cursor over a mapped file.
///
/// Reads take `&self`; the position lives in a [`Cell`], so the type is
/// deliberately not `Sync` — a cursor belongs to one thread, and other
/// threads get their own via [`Clone`].
#[derive(Debug)]
pub struct MmapInput {
    map: Arc<Mapping>,
    pos: Cell<u64>,
}

impl Clone for MmapInput {
    fn clone(&self) -> MmapInput {
        MmapInput {
            map: Arc::clone(&self.map),
            pos: Cell::new(self.pos.get()),
        }
    }
}

impl MmapInput {
    fn check_open(&self) -> Result<()> {
        if self.map.closed.load(Ordering::Acquire) {
            Err(Error::AlreadyClosed("memory-mapped input"))
        } else {
            Ok(())
        }
    }

    pub fn len(&self) -> u64 {
        self.map.len
    }

    pub fn is_empty(&self) -> bool {
        self.map.len == 0
    }

    pub fn position(&self) -> u64 {
        self.pos.get()
    }

    pub fn seek(&self, pos: u64) -> Result<()> {
        self.check_open()?;
        if pos > self.map.len {
            return Err(Error::Truncated("seek past end of mapping"));
        }
        self.pos.set(pos);
        Ok(())
    }

    pub fn skip(&self, n: u64) -> Result<()> {
        self.seek(self.pos.get() + n)
    }

    pub fn read_bytes(&self, dst: &mut [u8]) -> Result<()> {
        self.check_open()?;
        let mut pos = self.pos.get();
        if dst.len() as u64 > self.map.len - pos.min(self.map.len) {
            return Err(Error::Truncated("mapped field"));
        }
        let power = self.map.chunk_size_power;
        let mask = (1u64 << power) - 1;
        let mut written = 0;
        while written < dst.len() {
            let chunk = &self.map.chunks[(pos >> power) as usize];
            let off = (pos & mask) as usize;
            let take = (chunk.len() - off).min(dst.len() - written);
            dst[written..written + take].copy_from_slice(&chunk[off..off + take]);
            written += take;
            pos += take as u64;
        }
        self.pos.set(pos);
        Ok(())
    }

    pub fn read_u8(&self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_bytes(&mut b)?;
        Ok(b[0])
    }

    pub fn read_i32(&self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_bytes(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    pub fn read_i64(&self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.read_bytes(&mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    pub fn read_f32(&self) -> Result<f32> {
        let mut b = [0u8; 4];
        self.read_bytes(&mut b)?;
        Ok(f32::from_le_bytes(b))
    }

    pub fn read_f64(&self) -> Result<f64> {
        let mut b = [0u8; 8];
        self.read_bytes(&mut b)?;
        Ok(f64::from_le_bytes(b))
    }

    pub fn read_bool(&self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Invalidate every cursor sharing this mapping. The mapping is
    /// released once the last cursor drops.
    pub fn close(&self) {
        self.map.closed.store(true, Ordering::Release);
    }
}

impl BinRead for MmapInput {
    fn read_u8(&mut self) -> Result<u8> {
        MmapInput::read_u8(self)
    }

    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        MmapInput::read_bytes(self, dst)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn temp_file_with(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn reads_across_chunk_boundaries() {
        let data: Vec<u8> = (0u8..=99).collect();
        let f = temp_file_with(&data);
        // 16-byte chunks force several boundary crossings
        let mf = MmapFile::with_chunk_size_power(f.path(), 4).unwrap();
        let input = mf.open_input().unwrap();
        assert_eq!(input.len(), 100);

        let mut buf = [0u8; 40];
        input.seek(10).unwrap();
        input.read_bytes(&mut buf).unwrap();
        assert_eq!(&buf[..], &data[10..50]);
        assert_eq!(input.position(), 50);
    }

    #[test]
    fn scalar_reads_are_little_endian() {
        let f = temp_file_with(&[1, 2, 3, 4, 0xFF, 0, 0, 0, 0, 0, 0, 0]);
        let input = MmapFile::new(f.path()).open_input().unwrap();
        assert_eq!(input.read_i32().unwrap(), 0x0403_0201);
        assert_eq!(input.read_i64().unwrap(), 0xFF);
    }

    #[test]
    fn clones_keep_independent_positions() {
        let data: Vec<u8> = (0u8..32).collect();
        let f = temp_file_with(&data);
        let a = MmapFile::new(f.path()).open_input().unwrap();
        let b = a.clone();

        a.seek(10).unwrap();
        b.seek(20).unwrap();
        assert_eq!(a.read_u8().unwrap(), 10);
        assert_eq!(b.read_u8().unwrap(), 20);
        assert_eq!(a.position(), 11);
        assert_eq!(b.position(), 21);
    }

    #[test]
    fn close_invalidates_all_clones() {
        let f = temp_file_with(&[0; 8]);
        let a = MmapFile::new(f.path()).open_input().unwrap();
        let b = a.clone();
        a.close();
        assert!(matches!(b.read_u8(), Err(Error::AlreadyClosed(_))));
        assert!(matches!(a.seek(0), Err(Error::AlreadyClosed(_))));
    }

    #[test]
    fn reading_past_end_is_truncated() {
        let f = temp_file_with(&[0; 4]);
        let input = MmapFile::new(f.path()).open_input().unwrap();
        assert!(input.read_i32().is_ok());
        assert!(matches!(input.read_u8(), Err(Error::Truncated(_))));
        assert!(matches!(input.seek(5), Err(Error::Truncated(_))));
    }
}
