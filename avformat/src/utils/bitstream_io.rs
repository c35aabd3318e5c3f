//! Bit-level readers and writers for codec headers.
//!
//! Thin wrappers over `bitstream-io` used by the ADTS, AudioSpecificConfig,
//! FLAC STREAMINFO and FLAC frame header parsers.

use std::io;
use std::io::SeekFrom;

use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter, UnsignedInteger};

#[derive(Debug)]
pub struct BitstreamIoReader<R: io::Read + io::Seek> {
    bs: BitReader<R, BigEndian>,
    len: u64,
}

pub type BsIoSliceReader<'a> = BitstreamIoReader<io::Cursor<&'a [u8]>>;

impl<R> BitstreamIoReader<R>
where
    R: io::Read + io::Seek,
{
    pub fn new(read: R, len_bytes: u64) -> Self {
        Self {
            bs: BitReader::new(read),
            len: len_bytes << 3,
        }
    }

    #[inline(always)]
    pub fn get(&mut self) -> io::Result<bool> {
        self.bs.read_bit()
    }

    #[inline(always)]
    pub fn get_n<I: UnsignedInteger>(&mut self, n: u32) -> io::Result<I> {
        if n as u64 > self.available()? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "get_n({}): out of bounds bits at {}",
                    n,
                    self.bs.position_in_bits().unwrap_or(0)
                ),
            ));
        }
        self.bs.read_unsigned_var(n)
    }

    #[inline(always)]
    pub fn skip_n(&mut self, n: u32) -> io::Result<()> {
        if n as u64 > self.available()? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "skip_n: out of bounds bits",
            ));
        }
        self.bs.skip(n)
    }

    /// Reads `n` whole bytes. The reader must be byte aligned.
    pub fn get_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        if (n as u64) << 3 > self.available()? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("get_bytes({n}): out of bounds bytes"),
            ));
        }
        self.bs.read_to_vec(n)
    }

    /// Reads an unsigned Exp-Golomb code.
    pub fn get_ue(&mut self) -> io::Result<u32> {
        let mut leading_zeros = 0u32;
        while !self.get()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "get_ue: exp-golomb prefix too long",
                ));
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.get_n::<u32>(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + suffix as u64) as u32)
    }

    /// Reads a signed Exp-Golomb code.
    pub fn get_se(&mut self) -> io::Result<i32> {
        let code = self.get_ue()? as i64;
        Ok(if code & 1 == 1 {
            ((code + 1) / 2) as i32
        } else {
            -(code / 2) as i32
        })
    }

    /// Reads a UTF-8 style coded number (FLAC frame/sample numbers, up to 36 bits).
    pub fn get_utf8_coded(&mut self) -> io::Result<u64> {
        let first = self.get_n::<u8>(8)?;
        let extra = first.leading_ones();
        if extra == 1 || extra > 7 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid coded number prefix {first:#04X}"),
            ));
        }
        if extra == 0 {
            return Ok(first as u64);
        }

        let mut value = (first & (0x7F >> extra)) as u64;
        for _ in 1..extra {
            let byte = self.get_n::<u8>(8)?;
            if byte & 0xC0 != 0x80 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid coded number continuation byte",
                ));
            }
            value = (value << 6) | (byte & 0x3F) as u64;
        }

        Ok(value)
    }

    #[inline(always)]
    pub fn byte_align(&mut self) {
        self.bs.byte_align();
    }

    #[inline(always)]
    pub fn seek_bits(&mut self, position: u64) -> io::Result<u64> {
        if position > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("seek_bits({position}): out of bounds"),
            ));
        }
        self.bs.seek_bits(SeekFrom::Start(position))
    }

    #[inline(always)]
    pub fn available(&mut self) -> io::Result<u64> {
        self.bs
            .position_in_bits()
            .map(|pos| self.len.saturating_sub(pos))
    }

    #[inline(always)]
    pub fn position(&mut self) -> io::Result<u64> {
        self.bs.position_in_bits()
    }
}

impl<'a> BsIoSliceReader<'a> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        let len = buf.len() as u64;
        let read = io::Cursor::new(buf);

        Self::new(read, len)
    }
}

impl Default for BsIoSliceReader<'_> {
    fn default() -> Self {
        Self::from_slice(&[])
    }
}

/// Big-endian bit writer into an owned buffer.
pub struct BitstreamIoWriter {
    bs: BitWriter<Vec<u8>, BigEndian>,
}

impl Default for BitstreamIoWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BitstreamIoWriter {
    pub fn new() -> Self {
        Self {
            bs: BitWriter::new(Vec::new()),
        }
    }

    #[inline(always)]
    pub fn put(&mut self, bit: bool) -> io::Result<()> {
        self.bs.write_bit(bit)
    }

    #[inline(always)]
    pub fn put_n<I: UnsignedInteger>(&mut self, n: u32, value: I) -> io::Result<()> {
        self.bs.write_unsigned_var(n, value)
    }

    /// Pads to the next byte boundary with zero bits and returns the bytes.
    pub fn finish(mut self) -> io::Result<Vec<u8>> {
        self.bs.byte_align()?;
        Ok(self.bs.into_writer())
    }
}
