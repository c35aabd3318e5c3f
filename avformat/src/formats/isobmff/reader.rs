//! Box tree walker.
//!
//! [`parse_box`] dispatches a box to its handler, or recurses into it when it
//! is a plain container, and always leaves the reader at the box's declared
//! end: short reads are skipped over, over-reads are logged and the reader is
//! moved back to the boundary. Declared sizes running past the parent box or
//! the end of input are logged and clamped.

use super::boxes;
use super::context::MovContext;
use crate::io::IoReader;
use crate::log_or_err;
use crate::structs::fourcc::FourCC;
use crate::utils::errors::{BoxError, FormatError, IoError};

/// Boxes that only hold other boxes.
pub const CONTAINER_BOXES: [&[u8; 4]; 16] = [
    b"moov", b"trak", b"mdia", b"minf", b"stbl", b"dinf", b"edts", b"mvex", b"moof", b"mfra",
    b"udta", b"sinf", b"schi", b"iprp", b"ipco", b"wave",
];

/// Boxes whose failure leaves the rest of the file uninterpretable; their
/// errors reach the caller instead of being skipped.
const STRUCTURAL_BOXES: [&[u8; 4]; 3] = [b"tfhd", b"traf", b"iref"];

/// Signature of a box body parser. `track` is the owning track index while
/// inside a `trak`.
pub type BoxHandler =
    fn(&mut IoReader, &mut MovContext, Option<usize>, &BoxHeader) -> Result<(), FormatError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub kind: FourCC,
    /// Whole box size including the header.
    pub size: u64,
    pub start: u64,
    pub header_size: u8,
}

impl BoxHeader {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    /// The header with its size cut so the box ends no later than `limit`.
    pub fn clamped(&self, limit: u64) -> Self {
        let size = self
            .size
            .min(limit.saturating_sub(self.start))
            .max(self.header_size as u64);
        Self { size, ..*self }
    }

    pub fn body_start(&self) -> u64 {
        self.start + self.header_size as u64
    }

    pub fn body_size(&self) -> u64 {
        self.size - self.header_size as u64
    }

    pub fn is_container(&self) -> bool {
        CONTAINER_BOXES.iter().any(|&kind| self.kind == kind)
    }

    fn is_structural(&self) -> bool {
        STRUCTURAL_BOXES.iter().any(|&kind| self.kind == kind)
    }
}

/// Reads a box header at the current position. A size of 0 extends the box
/// to `parent_end`.
pub fn read_box_header(io: &mut IoReader, parent_end: u64) -> Result<BoxHeader, FormatError> {
    let start = io.pos();
    let size = io.read_u32_be()?;
    let kind = io.read_fourcc()?;
    let (size, header_size) = match size {
        0 => (parent_end.saturating_sub(start), 8),
        1 => (io.read_u64_be()?, 16),
        size => (size as u64, 8),
    };
    if size < header_size as u64 {
        return Err(BoxError::SizeTooSmall {
            kind: kind.to_string(),
            start,
            size,
        }
        .into());
    }
    Ok(BoxHeader {
        kind,
        size,
        start,
        header_size,
    })
}

/// Version and flags of a full box.
pub fn read_full_box_header(io: &mut IoReader) -> Result<(u8, u32), IoError> {
    let value = io.read_u32_be()?;
    Ok(((value >> 24) as u8, value & 0x00FF_FFFF))
}

/// Parses every box between the current position and `end`.
pub fn parse_children(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    end: u64,
) -> Result<(), FormatError> {
    while io.pos().saturating_add(8) <= end {
        let mut header = read_box_header(io, end)?;
        if header.end() > end {
            log::warn!(
                "box '{}' at {} runs {} bytes past its parent",
                header.kind,
                header.start,
                header.end() - end
            );
            header = header.clamped(end);
        }
        parse_box(io, ctx, track, &header)?;
    }
    if io.pos() < end {
        io.skip(end - io.pos())?;
    }
    Ok(())
}

/// Runs the handler for `header`, whose header has already been read, and
/// moves the reader to the box end.
pub fn parse_box(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let input_size = io.size();
    let truncated;
    let header = if input_size != 0 && header.end() > input_size {
        log::warn!(
            "box '{}' at {} declares {} bytes, input ends after {}",
            header.kind,
            header.start,
            header.size,
            input_size.saturating_sub(header.start)
        );
        truncated = header.clamped(input_size);
        &truncated
    } else {
        header
    };

    log::trace!(
        "box '{}' at {} ({} bytes, track {track:?})",
        header.kind,
        header.start,
        header.size
    );

    let result = if let Some(handler) = boxes::handler(header.kind) {
        handler(io, ctx, track, header)
    } else if header.is_container() {
        parse_children(io, ctx, track, header.end())
    } else {
        Ok(())
    };

    match result {
        Ok(()) => {}
        Err(err) if err.is_recoverable() && !header.is_structural() => {
            log_or_err!(
                ctx,
                log::Level::Warn,
                FormatError::invalid(format!("box '{}' at {}: {err}", header.kind, header.start))
            );
        }
        Err(err) => return Err(err),
    }

    finish_box(io, header)
}

/// Moves the reader to the end of `header`'s box.
pub fn finish_box(io: &mut IoReader, header: &BoxHeader) -> Result<(), FormatError> {
    let pos = io.pos();
    let end = header.end();
    if pos < end {
        let known_end = match io.size() {
            0 => end,
            size => end.min(size),
        };
        if pos < known_end {
            io.seek(known_end)?;
        }
        if known_end < end {
            log::warn!(
                "box '{}' at {} truncated by {} bytes",
                header.kind,
                header.start,
                end - known_end
            );
        }
    } else if pos > end {
        log::error!(
            "{}",
            BoxError::Overrun {
                kind: header.kind.to_string(),
                start: header.start,
                overrun: pos - end,
            }
        );
        io.seek(end)?;
    }
    Ok(())
}
