use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};

use super::AbortHandle;
use crate::structs::fourcc::FourCC;
use crate::utils::errors::IoError;

pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Buffered, seekable byte source consumed by the demuxers.
///
/// Every read and seek first checks the [`AbortHandle`]; once it is raised,
/// all further calls fail with [`IoError::Aborted`].
pub struct IoReader {
    inner: BufReader<Box<dyn ReadSeek>>,
    pos: u64,
    size: u64,
    abort: AbortHandle,
}

impl std::fmt::Debug for IoReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoReader")
            .field("pos", &self.pos)
            .field("size", &self.size)
            .finish()
    }
}

macro_rules! read_num {
    ($($name:ident: $t:ty => $from:ident),+ $(,)?) => { $(
        #[inline]
        pub fn $name(&mut self) -> Result<$t, IoError> {
            let mut buf = [0u8; std::mem::size_of::<$t>()];
            self.read_exact(&mut buf)?;
            Ok(<$t>::$from(buf))
        }
    )+ }
}

impl IoReader {
    /// Wraps a seekable source. The total size is probed once; sources that
    /// cannot seek to the end report a size of 0 (unknown).
    pub fn new<R: Read + Seek + Send + 'static>(mut reader: R) -> Result<Self, IoError> {
        let pos = reader.stream_position()?;
        let size = match reader.seek(SeekFrom::End(0)) {
            Ok(end) => {
                reader.seek(SeekFrom::Start(pos))?;
                end
            }
            Err(_) => 0,
        };

        Ok(Self {
            inner: BufReader::with_capacity(64 * 1024, Box::new(reader)),
            pos,
            size,
            abort: AbortHandle::default(),
        })
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self {
            inner: BufReader::new(Box::new(Cursor::new(data))),
            pos: 0,
            size,
            abort: AbortHandle::default(),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    #[inline]
    fn check_abort(&self) -> Result<(), IoError> {
        if self.abort.is_aborted() {
            return Err(IoError::Aborted);
        }
        Ok(())
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Total size in bytes, 0 when unknown.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn remaining(&self) -> Option<u64> {
        (self.size > 0).then(|| self.size.saturating_sub(self.pos))
    }

    pub fn is_eof(&self) -> bool {
        self.size > 0 && self.pos >= self.size
    }

    /// Reads up to `buf.len()` bytes, returning 0 at end of input.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        self.check_abort()?;
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), IoError> {
        self.check_abort()?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                self.pos += filled as u64;
                return Err(IoError::Eof(self.pos));
            }
            filled += n;
        }
        self.pos += filled as u64;
        Ok(())
    }

    /// Reads exactly `len` bytes into a new buffer.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, IoError> {
        let mut buf = Vec::new();
        self.read_bytes_into(&mut buf, len)?;
        Ok(buf)
    }

    /// Replaces the contents of `buf` with the next `len` bytes, reusing its
    /// allocation.
    pub fn read_bytes_into(&mut self, buf: &mut Vec<u8>, len: usize) -> Result<(), IoError> {
        if let Some(remaining) = self.remaining() {
            if len as u64 > remaining {
                return Err(IoError::Eof(self.size));
            }
        }
        buf.clear();
        buf.resize(len, 0);
        self.read_exact(buf)
    }

    /// Returns up to `len` upcoming bytes without consuming them.
    pub fn peek(&mut self, len: usize) -> Result<Vec<u8>, IoError> {
        self.check_abort()?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.inner.seek_relative(-(filled as i64))?;
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn seek(&mut self, pos: u64) -> Result<(), IoError> {
        self.check_abort()?;
        if self.size > 0 && pos > self.size {
            return Err(IoError::OutOfRange(pos));
        }
        let delta = pos as i128 - self.pos as i128;
        if delta.unsigned_abs() <= 64 * 1024 {
            self.inner.seek_relative(delta as i64)?;
        } else {
            self.inner.seek(SeekFrom::Start(pos))?;
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, len: u64) -> Result<(), IoError> {
        let target = self.pos.saturating_add(len);
        if self.size > 0 && target > self.size {
            self.seek(self.size)?;
            return Err(IoError::Eof(self.size));
        }
        self.seek(target)
    }

    read_num! {
        read_u8: u8 => from_be_bytes,
        read_i8: i8 => from_be_bytes,
        read_u16_be: u16 => from_be_bytes,
        read_u16_le: u16 => from_le_bytes,
        read_i16_be: i16 => from_be_bytes,
        read_u32_be: u32 => from_be_bytes,
        read_u32_le: u32 => from_le_bytes,
        read_i32_be: i32 => from_be_bytes,
        read_u64_be: u64 => from_be_bytes,
        read_u64_le: u64 => from_le_bytes,
        read_i64_be: i64 => from_be_bytes,
        read_f64_be: f64 => from_be_bytes,
    }

    pub fn read_u24_be(&mut self) -> Result<u32, IoError> {
        let mut buf = [0u8; 3];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes([0, buf[0], buf[1], buf[2]]))
    }

    pub fn read_u24_le(&mut self) -> Result<u32, IoError> {
        let mut buf = [0u8; 3];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], 0]))
    }

    pub fn read_fourcc(&mut self) -> Result<FourCC, IoError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(FourCC(buf))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], IoError> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads `len` bytes as text, stopping at the first NUL.
    pub fn read_string(&mut self, len: usize) -> Result<String, IoError> {
        let bytes = self.read_bytes(len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Reads a NUL-terminated string of at most `max` bytes.
    pub fn read_cstring(&mut self, max: u64) -> Result<String, IoError> {
        let mut bytes = Vec::new();
        while (bytes.len() as u64) < max {
            let b = self.read_u8()?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endian_reads_and_peek() -> anyhow::Result<()> {
        let mut reader = IoReader::from_bytes(vec![
            0x00, 0x00, 0x00, 0x10, b'f', b't', b'y', b'p', 0x34, 0x12, 0xAA,
        ]);
        assert_eq!(reader.size(), 11);

        assert_eq!(reader.peek(4)?, vec![0, 0, 0, 0x10]);
        assert_eq!(reader.pos(), 0);
        assert_eq!(reader.read_u32_be()?, 16);
        assert_eq!(reader.read_fourcc()?, b"ftyp");
        assert_eq!(reader.read_u16_le()?, 0x1234);
        assert_eq!(reader.peek(8)?, vec![0xAA]);
        assert!(matches!(reader.read_u16_be(), Err(IoError::Eof(_))));
        Ok(())
    }

    #[test]
    fn seek_and_skip_bounds() -> anyhow::Result<()> {
        let mut reader = IoReader::from_bytes((0u8..200).collect());
        reader.skip(100)?;
        assert_eq!(reader.read_u8()?, 100);
        reader.seek(10)?;
        assert_eq!(reader.read_u8()?, 10);
        assert!(reader.seek(201).is_err());
        assert!(reader.skip(1000).is_err());
        assert!(reader.is_eof());
        Ok(())
    }

    #[test]
    fn abort_fails_pending_reads() {
        let mut reader = IoReader::from_bytes(vec![0; 16]);
        let handle = reader.abort_handle();
        assert!(reader.read_u8().is_ok());
        handle.abort();
        assert!(matches!(reader.read_u8(), Err(IoError::Aborted)));
        assert!(matches!(reader.seek(0), Err(IoError::Aborted)));
    }
}
