//! Binary reading and writing for the two on-disk dialects.
//!
//! The native dialect is what the original trainer emits: little-endian
//! scalars and strings stored as raw UTF-8 terminated by `\0`, space or
//! newline. The sidecar (memory-mapped) dialect keeps the same scalar
//! encodings but length-prefixes its strings so records can be laid out
//! with fixed widths.

use std::io::{self, ErrorKind, Read, Write};

use crate::error::{Error, Result};

/// Low-level typed reads shared by the streaming reader and the
/// memory-mapped cursor. Scalars are little-endian.
pub trait BinRead {
    fn read_u8(&mut self) -> Result<u8>;
    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()>;

    fn read_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_bytes(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.read_bytes(&mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    fn read_f32(&mut self) -> Result<f32> {
        let mut b = [0u8; 4];
        self.read_bytes(&mut b)?;
        Ok(f32::from_le_bytes(b))
    }

    fn read_f64(&mut self) -> Result<f64> {
        let mut b = [0u8; 8];
        self.read_bytes(&mut b)?;
        Ok(f64::from_le_bytes(b))
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Bulk-read `dst.len()` f32 values.
    fn read_f32_into(&mut self, dst: &mut [f32]) -> Result<()> {
        self.read_bytes(bytemuck::cast_slice_mut::<f32, u8>(dst))
    }

    /// Native-dialect string: UTF-8 bytes up to (and consuming) one of
    /// `\0`, `' '` or `'\n'`.
    fn read_cstr(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let b = self.read_u8()?;
            if b == 0 || b == b' ' || b == b'\n' {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8(bytes)?)
    }

    /// Sidecar-dialect string: a 4-byte length followed by that many
    /// UTF-8 bytes.
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(Error::InvalidModel(format!("negative string length {len}")));
        }
        let mut bytes = vec![0u8; len as usize];
        self.read_bytes(&mut bytes)?;
        Ok(String::from_utf8(bytes)?)
    }
}

/// Streaming reader over any `Read` source.
#[derive(Debug, Clone)]
pub struct Reader<R> {
    inner: R,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R) -> Self {
        Reader { inner }
    }
}

impl<R: Read> BinRead for Reader<R> {
    fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_bytes(&mut b)?;
        Ok(b[0])
    }

    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        self.inner.read_exact(dst).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::Truncated("binary field")
            } else {
                Error::Io(e)
            }
        })
    }
}

/// Typed writer for both dialects. Keeps a running CRC32 and a byte
/// counter so section sizes and checksums can be reported after a save.
pub struct Writer<W> {
    inner: W,
    crc: crc32fast::Hasher,
    written: u64,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Self {
        Writer {
            inner,
            crc: crc32fast::Hasher::new(),
            written: 0,
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.crc.update(bytes);
        self.written += bytes.len() as u64;
        Ok(())
    }

    pub fn write_u8(&mut self, b: u8) -> Result<()> {
        self.write_bytes(&[b])
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }

    pub fn write_f32_slice(&mut self, src: &[f32]) -> Result<()> {
        self.write_bytes(bytemuck::cast_slice::<f32, u8>(src))
    }

    /// Native-dialect string, terminated by `\0`.
    pub fn write_cstr(&mut self, s: &str) -> Result<()> {
        self.write_bytes(s.as_bytes())?;
        self.write_u8(0)
    }

    /// Sidecar-dialect string: length prefix plus bytes.
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_i32(s.as_bytes().len() as i32)?;
        self.write_bytes(s.as_bytes())
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// CRC32 of everything written so far.
    pub fn checksum(&self) -> u32 {
        self.crc.clone().finalize()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub(crate) fn io_err_to_map_failed(path: &std::path::Path, e: io::Error) -> Error {
    Error::MapFailed {
        path: path.to_path_buf(),
        source: e,
    }
}
