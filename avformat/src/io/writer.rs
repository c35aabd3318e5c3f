use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};

use crate::structs::fourcc::FourCC;
use crate::utils::byteorder::{WriteBytesBe, WriteBytesLe};
use crate::utils::errors::IoError;

pub trait WriteSeek: Write + Seek + Send {}

impl<T: Write + Seek + Send> WriteSeek for T {}

enum Sink {
    /// Random-access sink, earlier offsets can be patched.
    Seekable(BufWriter<Box<dyn WriteSeek>>),
    /// Whole output kept in memory, patchable.
    Buffer(Cursor<Vec<u8>>),
    /// Append-only sink.
    Stream(BufWriter<Box<dyn Write + Send>>),
}

/// Byte sink consumed by the muxers.
///
/// Muxers ask [`IoWriter::seekable`] to decide between patching header fields
/// in place at trailer time and buffering their output until all packets are
/// known.
pub struct IoWriter {
    sink: Sink,
    pos: u64,
}

impl std::fmt::Debug for IoWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoWriter")
            .field("pos", &self.pos)
            .field("seekable", &self.is_seekable())
            .finish()
    }
}

macro_rules! write_num {
    ($($name:ident: $t:ty => $to:ident),+ $(,)?) => { $(
        #[inline]
        pub fn $name(&mut self, value: $t) -> Result<(), IoError> {
            self.write_all(&value.$to())
        }
    )+ }
}

impl IoWriter {
    pub fn seekable<W: Write + Seek + Send + 'static>(mut writer: W) -> Result<Self, IoError> {
        let pos = writer.stream_position()?;
        Ok(Self {
            sink: Sink::Seekable(BufWriter::new(Box::new(writer))),
            pos,
        })
    }

    pub fn buffer() -> Self {
        Self {
            sink: Sink::Buffer(Cursor::new(Vec::new())),
            pos: 0,
        }
    }

    pub fn stream<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            sink: Sink::Stream(BufWriter::new(Box::new(writer))),
            pos: 0,
        }
    }

    pub fn is_seekable(&self) -> bool {
        !matches!(self.sink, Sink::Stream(_))
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        match &mut self.sink {
            Sink::Seekable(w) => w.write_all(data)?,
            Sink::Buffer(c) => c.write_all(data)?,
            Sink::Stream(w) => w.write_all(data)?,
        }
        self.pos += data.len() as u64;
        Ok(())
    }

    pub fn seek(&mut self, pos: u64) -> Result<(), IoError> {
        match &mut self.sink {
            Sink::Seekable(w) => {
                w.seek(SeekFrom::Start(pos))?;
            }
            Sink::Buffer(c) => {
                c.seek(SeekFrom::Start(pos))?;
            }
            Sink::Stream(_) => return Err(IoError::NotSeekable),
        }
        self.pos = pos;
        Ok(())
    }

    /// Overwrites bytes at `pos` and returns to the current position.
    pub fn patch(&mut self, pos: u64, data: &[u8]) -> Result<(), IoError> {
        let current = self.pos;
        self.seek(pos)?;
        self.write_all(data)?;
        self.seek(current)
    }

    write_num! {
        write_u8: u8 => to_be_bytes,
        write_u16_be: u16 => to_be_bytes,
        write_u16_le: u16 => to_le_bytes,
        write_u32_be: u32 => to_be_bytes,
        write_u32_le: u32 => to_le_bytes,
        write_i32_be: i32 => to_be_bytes,
        write_u64_be: u64 => to_be_bytes,
        write_u64_le: u64 => to_le_bytes,
        write_f64_be: f64 => to_be_bytes,
    }

    pub fn write_u24_be(&mut self, value: u32) -> Result<(), IoError> {
        self.write_all(&value.to_be_bytes()[1..])
    }

    pub fn write_fourcc(&mut self, tag: FourCC) -> Result<(), IoError> {
        self.write_all(tag.as_bytes())
    }

    pub fn write_le<T: WriteBytesLe>(&mut self, value: &T) -> Result<(), IoError> {
        let mut buf = Vec::new();
        value.write_le(&mut buf);
        self.write_all(&buf)
    }

    pub fn write_be<T: WriteBytesBe>(&mut self, value: &T) -> Result<(), IoError> {
        let mut buf = Vec::new();
        value.write_be(&mut buf);
        self.write_all(&buf)
    }

    pub fn flush(&mut self) -> Result<(), IoError> {
        match &mut self.sink {
            Sink::Seekable(w) => w.flush()?,
            Sink::Buffer(_) => {}
            Sink::Stream(w) => w.flush()?,
        }
        Ok(())
    }

    /// Returns the in-memory output of a [`IoWriter::buffer`] sink.
    pub fn into_buffer(self) -> Option<Vec<u8>> {
        match self.sink {
            Sink::Buffer(c) => Some(c.into_inner()),
            _ => None,
        }
    }

    /// Borrows the in-memory output of a [`IoWriter::buffer`] sink.
    pub fn buffer_ref(&self) -> Option<&[u8]> {
        match &self.sink {
            Sink::Buffer(c) => Some(c.get_ref()),
            _ => None,
        }
    }
}
