//! AVI demuxer.
//!
//! Little-endian RIFF `AVI ` with OpenDML `AVIX` extension chunks. Stream
//! descriptions come from the `strl` lists: `strh` gives type, scale and
//! rate, `strf` a BITMAPINFOHEADER or WAVEFORMATEX. The legacy `idx1` index
//! after `movi` supplies keyframe flags and seek points. Files flagged as
//! non-interleaved are read in index order.

use log::Level;

use super::wav::read_format_chunk;
use super::{IFormat, InputContext, PROBE_SCORE_MAX, SeekFlags};
use crate::codecs::aac::AudioSpecificConfig;
use crate::io::IoReader;
use crate::log_or_err;
use crate::structs::fourcc::FourCC;
use crate::structs::packet::{BitFormat, Packet, PacketFlags};
use crate::structs::rational::{MILLI_TIME_BASE, NOPTS_VALUE, Rational, rescale};
use crate::structs::stream::{CodecId, CodecParameters, MediaType, Stream};
use crate::utils::errors::FormatError;

const AVIF_MUSTUSEINDEX: u32 = 0x20;
const AVIIF_KEYFRAME: u32 = 0x10;
const MAIN_HEADER_SIZE: u64 = 40;
const STREAM_HEADER_SIZE: u64 = 48;
const BITMAPINFOHEADER_SIZE: u64 = 40;
const INDEX_ENTRY_SIZE: u64 = 16;
/// A `dwStart` beyond this many seconds is ignored.
const MAX_START_SECONDS: u64 = 3600;
const MAX_SYNC_SIZE: u64 = 1024 * 1024;

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Stream number of a `##xx` chunk id.
fn stream_number(id: &[u8; 4]) -> Option<usize> {
    if id[0].is_ascii_digit() && id[1].is_ascii_digit() {
        Some(((id[0] - b'0') * 10 + (id[1] - b'0')) as usize)
    } else {
        None
    }
}

fn plausible_id(id: &[u8]) -> bool {
    id.iter().all(|&b| b.is_ascii_alphanumeric() || b == b' ')
}

/// Video codec of a BITMAPINFOHEADER compression fourcc.
fn bitmap_codec(compression: FourCC) -> CodecId {
    let mut tag = *compression.as_bytes();
    tag.make_ascii_uppercase();
    match &tag {
        b"H264" | b"X264" | b"AVC1" | b"DAVC" | b"VSSH" => CodecId::H264,
        b"HEVC" | b"H265" | b"X265" | b"HVC1" | b"HEV1" => CodecId::Hevc,
        b"FMP4" | b"DIVX" | b"DX50" | b"XVID" | b"MP4S" | b"M4S2" | b"MP4V" | b"3IV2" => {
            CodecId::Mpeg4
        }
        b"MPG1" | b"MPG2" | b"MPEG" | b"MMES" | b"PIM1" | b"EM2V" => CodecId::Mpeg2Video,
        _ => CodecId::None,
    }
}

/// RIFF INFO chunk ids and their metadata keys.
fn info_key(id: &[u8; 4]) -> String {
    match id {
        b"INAM" => "title".to_string(),
        b"IART" => "artist".to_string(),
        b"ICMT" => "comment".to_string(),
        b"ICRD" => "date".to_string(),
        b"IGNR" => "genre".to_string(),
        b"ICOP" => "copyright".to_string(),
        b"IPRD" => "album".to_string(),
        b"ISFT" => "encoder".to_string(),
        _ => String::from_utf8_lossy(id).to_ascii_lowercase(),
    }
}

/// Skips the rest of a chunk, stopping at the end of the input.
fn skip_chunk(io: &mut IoReader, chunk_start: u64, size: u64) -> Result<(), FormatError> {
    let mut next = chunk_start + 8 + size + (size & 1);
    if io.size() > 0 {
        next = next.min(io.size());
    }
    io.seek(next)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    /// Chunk header position.
    pos: u64,
    size: u32,
    key: bool,
    /// Stream clock before this chunk.
    dts: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct MainHeader {
    micro_sec_per_frame: u32,
    flags: u32,
    total_frames: u32,
    streams: u32,
    width: u32,
    height: u32,
}

#[derive(Debug)]
struct AviStream {
    /// Demuxed stream index, `None` for text, data and unknown stream types.
    index: Option<usize>,
    /// Stream under construction while the header lists are read.
    pending: Option<Stream>,
    handler: FourCC,
    /// Bytes per sample for streams whose clock counts bytes, else 0.
    sample_size: u32,
    block_align: u32,
    /// Clock of the next chunk: bytes when `sample_size` is set, chunks or
    /// blocks otherwise.
    clock: i64,
    start_clock: i64,
    entries: Vec<IndexEntry>,
    /// Next entry when reading in index order.
    cursor: usize,
    seen_key: bool,
    media_type: MediaType,
    reorders: bool,
    bit_format: Option<BitFormat>,
}

impl AviStream {
    fn chunk_duration(&self, len: u32) -> i64 {
        if self.sample_size > 0 {
            len as i64
        } else if self.block_align > 0 {
            len.div_ceil(self.block_align) as i64
        } else {
            1
        }
    }

    fn clock_unit(&self) -> i64 {
        self.sample_size.max(1) as i64
    }

    /// Entry to start from for a seek to `clock`.
    fn seek_entry(&self, clock: i64, forward: bool) -> Option<usize> {
        let needs_key = self.media_type == MediaType::Video;
        if forward {
            let from = self.entries.partition_point(|e| e.dts < clock);
            (from..self.entries.len()).find(|&i| !needs_key || self.entries[i].key)
        } else {
            let to = self.entries.partition_point(|e| e.dts <= clock);
            (0..to)
                .rev()
                .find(|&i| !needs_key || self.entries[i].key)
                .or_else(|| (0..self.entries.len()).find(|&i| !needs_key || self.entries[i].key))
        }
    }

    fn index_end(&self) -> i64 {
        self.entries
            .last()
            .map_or(self.start_clock, |e| e.dts + self.chunk_duration(e.size))
    }
}

#[derive(Debug, Default)]
pub struct IAviFormat {
    header: MainHeader,
    streams: Vec<AviStream>,
    /// Position of the `movi` list type.
    movi_list: u64,
    movi_end: u64,
    has_index: bool,
    non_interleaved: bool,
}

impl IAviFormat {
    fn read_main_header(&mut self, io: &mut IoReader, size: u64) -> Result<(), FormatError> {
        if size < MAIN_HEADER_SIZE {
            return Err(FormatError::invalid(format!("avi: avih of {size} bytes")));
        }
        self.header.micro_sec_per_frame = io.read_u32_le()?;
        let _max_bytes_per_sec = io.read_u32_le()?;
        let _padding_granularity = io.read_u32_le()?;
        self.header.flags = io.read_u32_le()?;
        self.header.total_frames = io.read_u32_le()?;
        let _initial_frames = io.read_u32_le()?;
        self.header.streams = io.read_u32_le()?;
        let _suggested_buffer_size = io.read_u32_le()?;
        self.header.width = io.read_u32_le()?;
        self.header.height = io.read_u32_le()?;
        log::debug!(
            "avi: {} streams, {} frames, {} us per frame, flags {:#x}",
            self.header.streams,
            self.header.total_frames,
            self.header.micro_sec_per_frame,
            self.header.flags
        );
        Ok(())
    }

    fn read_stream_header(&mut self, io: &mut IoReader, size: u64) -> Result<(), FormatError> {
        if size < STREAM_HEADER_SIZE {
            return Err(FormatError::invalid(format!("avi: strh of {size} bytes")));
        }
        let kind = io.read_fourcc()?;
        let handler = io.read_fourcc()?;
        if kind == b"pads" {
            return Ok(());
        }
        let _flags = io.read_u32_le()?;
        let _priority = io.read_u16_le()?;
        let _language = io.read_u16_le()?;
        let _initial_frames = io.read_u32_le()?;
        let mut scale = io.read_u32_le()?;
        let mut rate = io.read_u32_le()?;
        let mut start = io.read_u32_le()?;
        let length = io.read_u32_le()?;
        let _suggested_buffer_size = io.read_u32_le()?;
        let _quality = io.read_u32_le()?;
        let mut sample_size = io.read_u32_le()?;

        if scale == 0 || rate == 0 {
            (scale, rate) = match self.header.micro_sec_per_frame {
                0 => (1, 25),
                us => (us, 1_000_000),
            };
        }
        if start as u64 > MAX_START_SECONDS * rate as u64 / scale as u64 {
            log::warn!("avi: ignoring start {start} of stream {}", self.streams.len());
            start = 0;
        }

        let media_type = match kind.as_bytes() {
            b"vids" => {
                sample_size = 0;
                MediaType::Video
            }
            b"auds" => MediaType::Audio,
            _ => {
                log::info!("avi: stream {} of type {kind} is not demuxed", self.streams.len());
                MediaType::Unknown
            }
        };
        let pending = (media_type != MediaType::Unknown).then(|| {
            let mut stream = Stream::new(0, Rational::new(to_i32(scale), to_i32(rate)).reduce());
            stream.codecpar.media_type = media_type;
            stream.codecpar.codec_tag = handler;
            stream.start_time = start as i64;
            stream.duration = length as i64;
            stream
        });

        let start_clock = start as i64 * sample_size.max(1) as i64;
        self.streams.push(AviStream {
            index: None,
            pending,
            handler,
            sample_size,
            block_align: 0,
            clock: start_clock,
            start_clock,
            entries: Vec::new(),
            cursor: 0,
            seen_key: false,
            media_type,
            reorders: false,
            bit_format: None,
        });
        Ok(())
    }

    fn read_stream_format(&mut self, io: &mut IoReader, size: u64) -> Result<(), FormatError> {
        let (main_width, main_height) = (self.header.width, self.header.height);
        let Some(avi) = self.streams.last_mut() else {
            return Ok(());
        };
        let Some(stream) = avi.pending.as_mut() else {
            return Ok(());
        };
        match avi.media_type {
            MediaType::Video => {
                if size < BITMAPINFOHEADER_SIZE {
                    return Err(FormatError::invalid(format!("avi: video strf of {size} bytes")));
                }
                let _header_size = io.read_u32_le()?;
                let width = io.read_u32_le()? as i32;
                let height = io.read_u32_le()? as i32;
                let _planes = io.read_u16_le()?;
                let bit_count = io.read_u16_le()?;
                let compression = io.read_fourcc()?;
                io.skip(5 * 4)?;

                let (width, height) = match (width.unsigned_abs(), height.unsigned_abs()) {
                    (0, 0) => (main_width, main_height),
                    dims => dims,
                };
                let mut par = CodecParameters::video(bitmap_codec(compression), width, height);
                par.codec_tag = compression;
                par.bits_per_coded_sample = bit_count as u32;
                if size > BITMAPINFOHEADER_SIZE {
                    par.extradata = io.read_bytes((size - BITMAPINFOHEADER_SIZE) as usize)?;
                }
                stream.codecpar = par;
            }
            _ => {
                let size = u32::try_from(size).map_err(|_| FormatError::invalid("avi: oversized audio strf"))?;
                let mut par = CodecParameters::default();
                read_format_chunk(io, size, false, &mut par)?;
                avi.block_align = par.block_align;
                if avi.sample_size > 0 && par.block_align > 0 && avi.sample_size != par.block_align {
                    log::warn!("avi: sample size {} != block align {}", avi.sample_size, par.block_align);
                    avi.sample_size = par.block_align;
                }
                let compressed = matches!(par.codec_id, CodecId::Aac | CodecId::Mp3 | CodecId::Flac);
                if compressed && (1..=4).contains(&avi.block_align) {
                    avi.block_align = 0;
                }
                if (par.codec_id == CodecId::Aac && matches!((avi.block_align, avi.sample_size), (1024, 1024) | (4096, 4096)))
                    || (par.codec_id == CodecId::Mp3 && avi.block_align == 1152 && avi.sample_size == 1152)
                {
                    avi.sample_size = 0;
                }
                // Same as `avi.clock_unit()`, spelled via fields so `stream` can stay borrowed.
                avi.start_clock = stream.start_time.max(0) * avi.sample_size.max(1) as i64;
                avi.clock = avi.start_clock;
                stream.codecpar = par;
            }
        }
        Ok(())
    }

    fn read_info(ctx: &mut InputContext, end: u64) -> Result<(), FormatError> {
        while ctx.io.pos() + 8 <= end {
            let chunk_start = ctx.io.pos();
            let id = ctx.io.read_fourcc()?;
            let size = ctx.io.read_u32_le()? as u64;
            if chunk_start + 8 + size > end {
                break;
            }
            let value = ctx.io.read_string(size as usize)?;
            let value = value.trim();
            if !value.is_empty() {
                ctx.metadata.insert(info_key(id.as_bytes()), value.to_string());
            }
            skip_chunk(&mut ctx.io, chunk_start, size)?;
        }
        Ok(())
    }

    /// Walks the header lists up to `movi`.
    fn read_lists(&mut self, ctx: &mut InputContext, file_end: u64) -> Result<(), FormatError> {
        let mut list_end = 0;
        loop {
            let chunk_start = ctx.io.pos();
            if chunk_start + 8 > file_end {
                return Err(FormatError::invalid("avi: no movi list"));
            }
            let id = ctx.io.read_fourcc()?;
            let size = ctx.io.read_u32_le()? as u64;
            let body_end = chunk_start + 8 + size;
            match id.as_bytes() {
                b"LIST" => {
                    let kind = ctx.io.read_fourcc()?;
                    match kind.as_bytes() {
                        b"movi" => {
                            self.movi_list = chunk_start + 8;
                            self.movi_end = if size > 0 { body_end + (size & 1) } else { file_end };
                            return Ok(());
                        }
                        b"INFO" => Self::read_info(ctx, body_end)?,
                        _ => {
                            list_end = body_end;
                            continue;
                        }
                    }
                }
                b"avih" => self.read_main_header(&mut ctx.io, size)?,
                b"strh" => self.read_stream_header(&mut ctx.io, size)?,
                b"strf" => {
                    let size = if chunk_start < list_end {
                        size.min(list_end.saturating_sub(chunk_start + 8))
                    } else {
                        size
                    };
                    self.read_stream_format(&mut ctx.io, size)?;
                }
                b"strd" => {
                    let pending = self.streams.last_mut().and_then(|s| s.pending.as_mut());
                    if let Some(stream) = pending {
                        if stream.codecpar.extradata.is_empty() {
                            stream.codecpar.extradata = ctx.io.read_bytes(size as usize)?;
                        }
                    }
                }
                b"strn" => {
                    let name = ctx.io.read_string(size as usize)?;
                    let pending = self.streams.last_mut().and_then(|s| s.pending.as_mut());
                    if let Some(stream) = pending {
                        stream.metadata.insert("title".to_string(), name);
                    }
                }
                b"IDIT" => {
                    let date = ctx.io.read_string(size.min(63) as usize)?;
                    ctx.metadata.insert("creation_time".to_string(), date.trim().to_string());
                }
                b"dmlh" => log::debug!("avi: OpenDML header"),
                _ => log::trace!("avi: skipping {id} chunk of {size} bytes"),
            }
            skip_chunk(&mut ctx.io, chunk_start, size)?;
        }
    }

    fn add_streams(&mut self, ctx: &mut InputContext) {
        for (number, avi) in self.streams.iter_mut().enumerate() {
            let Some(mut stream) = avi.pending.take() else {
                continue;
            };
            let par = &mut stream.codecpar;
            if par.codec_id.is_nalu_based() {
                let bit_format = if par.extradata.first() == Some(&1) { BitFormat::Avcc } else { BitFormat::AnnexB };
                par.bit_format = Some(bit_format);
                avi.bit_format = Some(bit_format);
            }
            if par.codec_id == CodecId::Aac && par.extradata.is_empty() {
                par.extradata = AudioSpecificConfig::new(2, par.sample_rate, par.channels.min(7) as u8).to_bytes();
            }
            avi.reorders = matches!(
                par.codec_id,
                CodecId::H264 | CodecId::Hevc | CodecId::Vvc | CodecId::Mpeg2Video | CodecId::Mpeg4
            );
            stream.id = number as u32;
            log::debug!(
                "avi: stream {number}: {} ({}), time base {}",
                par.codec_id,
                avi.handler,
                stream.time_base
            );
            avi.index = Some(ctx.add_stream(stream));
        }
    }

    /// Checks which base makes the first `idx1` offset point at its chunk:
    /// the `movi` list or the start of the file.
    fn index_base(
        &self,
        io: &mut IoReader,
        entries: &[([u8; 4], u32, u32, u32)],
    ) -> Result<Option<u64>, FormatError> {
        let Some(&(id, _, offset, _)) = entries.iter().find(|e| stream_number(&e.0).is_some()) else {
            return Ok(None);
        };
        for base in [self.movi_list, 0] {
            let pos = base + offset as u64;
            if io.size() > 0 && pos + 4 > io.size() {
                continue;
            }
            io.seek(pos)?;
            if io.read_array::<4>()? == id {
                return Ok(Some(base));
            }
        }
        Ok(None)
    }

    fn read_index(&mut self, ctx: &mut InputContext, size: u64) -> Result<(), FormatError> {
        let mut raw = Vec::with_capacity((size / INDEX_ENTRY_SIZE) as usize);
        for _ in 0..size / INDEX_ENTRY_SIZE {
            let id = ctx.io.read_array::<4>()?;
            let flags = ctx.io.read_u32_le()?;
            let offset = ctx.io.read_u32_le()?;
            let len = ctx.io.read_u32_le()?;
            raw.push((id, flags, offset, len));
        }
        let Some(base) = self.index_base(&mut ctx.io, &raw)? else {
            log_or_err!(ctx, Level::Warn, FormatError::invalid("avi: idx1 offsets do not point at movi chunks"));
            return Ok(());
        };

        let mut clocks: Vec<i64> = self.streams.iter().map(|s| s.start_clock).collect();
        let mut any_key = false;
        for (id, flags, offset, len) in raw {
            let Some(number) = stream_number(&id) else {
                continue;
            };
            let Some(avi) = self.streams.get_mut(number) else {
                continue;
            };
            if &id[2..] == b"pc" {
                continue;
            }
            let key = flags & AVIIF_KEYFRAME != 0;
            any_key |= key;
            if len > 0 {
                avi.entries.push(IndexEntry {
                    pos: base + offset as u64,
                    size: len,
                    key: key || avi.media_type != MediaType::Video,
                    dts: clocks[number],
                });
            }
            clocks[number] += avi.chunk_duration(len);
        }
        if !any_key {
            for avi in &mut self.streams {
                if let Some(first) = avi.entries.first_mut() {
                    first.key = true;
                }
            }
        }
        self.has_index = true;
        log::debug!(
            "avi: idx1 with {} entries, offsets from {base}",
            self.streams.iter().map(|s| s.entries.len()).sum::<usize>()
        );
        Ok(())
    }

    /// Looks for `idx1` after the `movi` list.
    fn load_index(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        let size = ctx.io.size();
        if size == 0 || self.movi_end >= size {
            return Ok(());
        }
        ctx.io.seek(self.movi_end)?;
        while ctx.io.pos() + 8 <= size {
            let chunk_start = ctx.io.pos();
            let id = ctx.io.read_fourcc()?;
            let chunk_size = ctx.io.read_u32_le()? as u64;
            if id == b"idx1" {
                return self.read_index(ctx, chunk_size);
            }
            skip_chunk(&mut ctx.io, chunk_start, chunk_size)?;
        }
        Ok(())
    }

    /// Moves to the next data chunk and returns its stream number, size and
    /// position, with the reader on the chunk payload.
    fn next_chunk(&mut self, io: &mut IoReader) -> Result<Option<(usize, u32, u64)>, FormatError> {
        let start = io.pos();
        loop {
            let pos = io.pos();
            let head = io.peek(12)?;
            if head.len() < 8 {
                return Ok(None);
            }
            let id = [head[0], head[1], head[2], head[3]];
            let size = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
            let fits = io.size() == 0 || pos + 8 + size as u64 <= io.size();
            if !plausible_id(&id) || !fits {
                if pos - start >= MAX_SYNC_SIZE {
                    return Err(FormatError::invalid(format!("avi: no chunk within {MAX_SYNC_SIZE} bytes of {start}")));
                }
                io.skip(1)?;
                continue;
            }
            if pos > start {
                log::debug!("avi: skipped {} bytes to resync", pos - start);
            }
            match &id {
                b"RIFF" => {
                    io.skip(12)?;
                    continue;
                }
                b"LIST" if matches!(head.get(8..12), Some(b"movi") | Some(b"rec ")) => {
                    io.skip(12)?;
                    continue;
                }
                _ => {}
            }
            let number = stream_number(&id).filter(|&n| n < self.streams.len());
            let payload = !matches!(&id[2..], b"ix" | b"pc");
            match number {
                Some(n) if payload => {
                    io.skip(8)?;
                    return Ok(Some((n, size, pos)));
                }
                _ => skip_chunk(io, pos, size as u64)?,
            }
        }
    }

    /// Positions the reader on the chunk with the lowest timestamp among the
    /// streams' next index entries.
    fn next_indexed(&mut self, io: &mut IoReader, time_bases: &[Rational]) -> Result<bool, FormatError> {
        let mut best: Option<(i64, usize)> = None;
        for (n, avi) in self.streams.iter().enumerate() {
            let (Some(index), Some(entry)) = (avi.index, avi.entries.get(avi.cursor)) else {
                continue;
            };
            let ms = rescale(entry.dts / avi.clock_unit(), time_bases[index], MILLI_TIME_BASE);
            if best.is_none_or(|(b, _)| ms < b) {
                best = Some((ms, n));
            }
        }
        let Some((_, n)) = best else {
            return Ok(false);
        };
        let avi = &mut self.streams[n];
        let entry = avi.entries[avi.cursor];
        avi.cursor += 1;
        avi.clock = entry.dts;
        io.seek(entry.pos)?;
        Ok(true)
    }
}

impl IFormat for IAviFormat {
    fn name(&self) -> &'static str {
        "avi"
    }

    fn probe(buf: &[u8]) -> u8 {
        if buf.len() >= 12 && &buf[..4] == b"RIFF" && matches!(&buf[8..12], b"AVI " | b"AVIX") {
            PROBE_SCORE_MAX
        } else {
            0
        }
    }

    fn read_header(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        let riff = ctx.io.read_fourcc()?;
        let riff_size = ctx.io.read_u32_le()? as u64;
        let form = ctx.io.read_fourcc()?;
        if riff != b"RIFF" || form != b"AVI " {
            return Err(FormatError::invalid("avi: not a RIFF AVI file"));
        }
        let file_end = match ctx.io.size() {
            0 if riff_size == 0 => u64::MAX,
            0 => 8 + riff_size,
            size => size,
        };

        self.read_lists(ctx, file_end)?;
        self.add_streams(ctx);
        if ctx.streams.is_empty() {
            return Err(FormatError::invalid("avi: no audio or video stream"));
        }
        if self.header.streams as usize != self.streams.len() {
            log::debug!("avi: avih announces {} streams, found {}", self.header.streams, self.streams.len());
        }

        self.load_index(ctx)?;
        for avi in &self.streams {
            if let Some(index) = avi.index {
                if !avi.entries.is_empty() {
                    ctx.streams[index].nb_frames = avi.entries.len() as u64;
                }
            }
        }
        self.non_interleaved = self.header.flags & AVIF_MUSTUSEINDEX != 0 && self.has_index && ctx.streams.len() > 1;
        if let Some(duration) = ctx
            .streams
            .iter()
            .filter(|s| s.duration > 0)
            .map(|s| rescale(s.duration, s.time_base, MILLI_TIME_BASE))
            .max()
        {
            ctx.duration = duration;
        }
        ctx.io.seek(self.movi_list + 4)?;
        Ok(())
    }

    fn read_packet(&mut self, ctx: &mut InputContext) -> Result<Packet, FormatError> {
        loop {
            if self.non_interleaved {
                let time_bases: Vec<Rational> = ctx.streams.iter().map(|s| s.time_base).collect();
                if !self.next_indexed(&mut ctx.io, &time_bases)? {
                    return Err(FormatError::Eof);
                }
            }
            let Some((number, len, pos)) = self.next_chunk(&mut ctx.io)? else {
                return Err(FormatError::Eof);
            };
            let avi = &mut self.streams[number];
            let Some(index) = avi.index else {
                skip_chunk(&mut ctx.io, pos, len as u64)?;
                continue;
            };
            if len == 0 {
                avi.clock += avi.chunk_duration(0);
                continue;
            }

            let mut packet = ctx.read_packet_data(len as usize)?;
            if len & 1 == 1 && (ctx.io.size() == 0 || ctx.io.pos() < ctx.io.size()) {
                ctx.io.skip(1)?;
            }
            let unit = avi.clock_unit();
            let dts = avi.clock / unit;
            let key = match avi.media_type {
                MediaType::Video if avi.entries.is_empty() => !std::mem::replace(&mut avi.seen_key, true),
                MediaType::Video => {
                    let i = avi.entries.partition_point(|e| e.dts < avi.clock);
                    avi.entries.get(i).is_some_and(|e| e.dts == avi.clock && e.key)
                }
                _ => true,
            };
            packet.stream_index = index;
            packet.dts = dts;
            packet.pts = if avi.reorders { NOPTS_VALUE } else { dts };
            packet.duration = avi.chunk_duration(len) / unit;
            packet.pos = pos as i64;
            packet.bit_format = avi.bit_format;
            if key {
                packet.flags |= PacketFlags::KEY;
            }
            avi.clock += avi.chunk_duration(len);
            return Ok(packet);
        }
    }

    fn seek(
        &mut self,
        ctx: &mut InputContext,
        stream_index: usize,
        timestamp: i64,
        flags: SeekFlags,
    ) -> Result<(), FormatError> {
        let time_base = ctx.stream(stream_index)?.time_base;
        if flags.contains(SeekFlags::BYTE) {
            let mut target = (timestamp.max(0) as u64).max(self.movi_list + 4);
            if ctx.io.size() > 0 {
                target = target.min(ctx.io.size());
            }
            ctx.io.seek(target)?;
            return Ok(());
        }
        if !self.has_index {
            return Err(FormatError::unsupported("avi: seeking needs an idx1 index"));
        }

        let forward = flags.contains(SeekFlags::FORWARD);
        let mut starts = vec![None; self.streams.len()];
        let mut target_ms = None;
        for (n, avi) in self.streams.iter().enumerate() {
            if avi.index == Some(stream_index) {
                starts[n] = avi.seek_entry(timestamp * avi.clock_unit(), forward);
                let entry = starts[n].map(|i| avi.entries[i]).ok_or(FormatError::Eof)?;
                target_ms = Some(rescale(entry.dts / avi.clock_unit(), time_base, MILLI_TIME_BASE));
            }
        }
        let target_ms = target_ms.ok_or_else(|| FormatError::params(format!("avi: stream {stream_index} not indexed")))?;
        for (n, avi) in self.streams.iter().enumerate() {
            let Some(index) = avi.index else {
                continue;
            };
            if index != stream_index {
                let ts = rescale(target_ms, MILLI_TIME_BASE, ctx.streams[index].time_base);
                starts[n] = avi.seek_entry(ts * avi.clock_unit(), false);
            }
        }

        let pos = starts
            .iter()
            .zip(&self.streams)
            .filter_map(|(start, avi)| start.map(|i| avi.entries[i].pos))
            .min()
            .ok_or(FormatError::Eof)?;
        for (avi, start) in self.streams.iter_mut().zip(starts) {
            let from = if self.non_interleaved {
                start.unwrap_or(avi.entries.len())
            } else {
                avi.entries.partition_point(|e| e.pos < pos)
            };
            avi.cursor = from;
            avi.clock = avi.entries.get(from).map_or_else(|| avi.index_end(), |e| e.dts);
        }
        log::debug!("avi: seek to {timestamp} on stream {stream_index} lands at {pos}");
        ctx.io.seek(pos)?;
        Ok(())
    }

    fn estimated_packet_count(&self, _ctx: &InputContext) -> Option<u64> {
        self.has_index
            .then(|| self.streams.iter().filter(|s| s.index.is_some()).map(|s| s.entries.len() as u64).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut out = id.to_vec();
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(0);
        }
        out
    }

    fn list(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut data = kind.to_vec();
        data.extend_from_slice(body);
        chunk(b"LIST", &data)
    }

    fn le32(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn avih(flags: u32, streams: u32) -> Vec<u8> {
        let mut data = le32(&[40_000, 0, 0, flags, 0, 0, streams, 0, 320, 240]);
        data.extend_from_slice(&[0; 16]);
        chunk(b"avih", &data)
    }

    fn strh(kind: &[u8; 4], handler: &[u8; 4], scale: u32, rate: u32, length: u32, sample_size: u32) -> Vec<u8> {
        let mut data = kind.to_vec();
        data.extend_from_slice(handler);
        data.extend(le32(&[0, 0, 0, scale, rate, 0, length, 0, 0, sample_size]));
        data.extend_from_slice(&[0; 8]);
        chunk(b"strh", &data)
    }

    fn video_strl() -> Vec<u8> {
        let mut bitmap = le32(&[40, 320, 240]);
        bitmap.extend_from_slice(&1u16.to_le_bytes());
        bitmap.extend_from_slice(&24u16.to_le_bytes());
        bitmap.extend_from_slice(b"H264");
        bitmap.extend(le32(&[0; 5]));
        let mut body = strh(b"vids", b"H264", 1, 25, 10, 0);
        body.extend(chunk(b"strf", &bitmap));
        body.extend(chunk(b"strn", b"Camera\0"));
        list(b"strl", &body)
    }

    fn audio_strl() -> Vec<u8> {
        let mut wave = Vec::new();
        wave.extend_from_slice(&1u16.to_le_bytes());
        wave.extend_from_slice(&2u16.to_le_bytes());
        wave.extend(le32(&[48_000, 192_000]));
        wave.extend_from_slice(&4u16.to_le_bytes());
        wave.extend_from_slice(&16u16.to_le_bytes());
        let mut body = strh(b"auds", b"\0\0\0\0", 4, 192_000, 19_200, 4);
        body.extend(chunk(b"strf", &wave));
        list(b"strl", &body)
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Index {
        None,
        Relative,
        Absolute,
    }

    /// Odd-sized video frame `i`.
    fn video_frame(i: usize) -> Vec<u8> {
        let nal = if i % 3 == 0 { 0x65 } else { 0x41 };
        vec![0, 0, 0, 1, nal, i as u8, 0x80, 0x40, 0x20]
    }

    const AUDIO_CHUNK: usize = 7680;

    /// `frames` video frames (keyframe every third), each followed by 40 ms
    /// of 16-bit stereo PCM. `garbage` is inserted after the second frame.
    fn avi_file(frames: usize, index: Index, flags: u32, garbage: &[u8]) -> Vec<u8> {
        let mut hdrl = avih(flags, 2);
        hdrl.extend(video_strl());
        hdrl.extend(audio_strl());
        let mut out = b"RIFF\0\0\0\0AVI ".to_vec();
        out.extend(list(b"hdrl", &hdrl));
        out.extend(list(b"INFO", &chunk(b"INAM", b"Clip\0")));
        out.extend(chunk(b"JUNK", &[0; 6]));

        let movi_list = out.len() as u32 + 8;
        let mut movi = Vec::new();
        let mut entries = Vec::new();
        for i in 0..frames {
            let pos = movi_list + 4 + movi.len() as u32;
            let frame = video_frame(i);
            entries.push((b"00dc", if i % 3 == 0 { AVIIF_KEYFRAME } else { 0 }, pos, frame.len() as u32));
            movi.extend(chunk(b"00dc", &frame));
            let pos = movi_list + 4 + movi.len() as u32;
            entries.push((b"01wb", AVIIF_KEYFRAME, pos, AUDIO_CHUNK as u32));
            movi.extend(chunk(b"01wb", &vec![i as u8; AUDIO_CHUNK]));
            if i == 1 {
                movi.extend_from_slice(garbage);
            }
        }
        out.extend(list(b"movi", &movi));

        if index != Index::None {
            let base = if index == Index::Relative { movi_list } else { 0 };
            let mut idx1 = Vec::new();
            for (id, flags, pos, len) in entries {
                idx1.extend_from_slice(id);
                idx1.extend(le32(&[flags, pos - base, len]));
            }
            out.extend(chunk(b"idx1", &idx1));
        }
        let riff_size = (out.len() - 8) as u32;
        out[4..8].copy_from_slice(&riff_size.to_le_bytes());
        out
    }

    fn open(data: Vec<u8>) -> anyhow::Result<(IAviFormat, InputContext)> {
        let mut ctx = InputContext::new(IoReader::from_bytes(data));
        let mut format = IAviFormat::default();
        format.read_header(&mut ctx)?;
        Ok((format, ctx))
    }

    fn read_all(format: &mut IAviFormat, ctx: &mut InputContext) -> anyhow::Result<Vec<Packet>> {
        let mut packets = Vec::new();
        loop {
            match format.read_packet(ctx) {
                Ok(packet) => packets.push(packet),
                Err(FormatError::Eof) => return Ok(packets),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn video_keys(packets: &[Packet]) -> Vec<bool> {
        packets.iter().filter(|p| p.stream_index == 0).map(|p| p.is_key()).collect()
    }

    #[test]
    fn probe_riff_form() {
        assert_eq!(IAviFormat::probe(&avi_file(1, Index::None, 0, &[])), PROBE_SCORE_MAX);
        assert_eq!(IAviFormat::probe(b"RIFF\0\0\0\0WAVEfmt "), 0);
    }

    #[test]
    fn stream_headers() -> anyhow::Result<()> {
        let (_, ctx) = open(avi_file(3, Index::Relative, 0, &[]))?;
        assert_eq!(ctx.streams.len(), 2);

        let video = &ctx.streams[0];
        assert_eq!(video.codecpar.codec_id, CodecId::H264);
        assert_eq!((video.codecpar.width, video.codecpar.height), (320, 240));
        assert_eq!(video.codecpar.bit_format, Some(BitFormat::AnnexB));
        assert_eq!(video.time_base, Rational::new(1, 25));
        assert_eq!(video.duration, 10);
        assert_eq!(video.nb_frames, 3);
        assert_eq!(video.metadata.get("title").map(String::as_str), Some("Camera"));

        let audio = &ctx.streams[1];
        assert_eq!(audio.codecpar.codec_id, CodecId::PcmS16Le);
        assert_eq!((audio.codecpar.sample_rate, audio.codecpar.channels), (48_000, 2));
        assert_eq!(audio.time_base, Rational::new(1, 48_000));
        assert_eq!(audio.duration, 19_200);

        assert_eq!(ctx.metadata.get("title").map(String::as_str), Some("Clip"));
        assert_eq!(ctx.duration, 400);
        Ok(())
    }

    #[test]
    fn packets_follow_movi() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(avi_file(4, Index::Relative, 0, &[]))?;
        let packets = read_all(&mut format, &mut ctx)?;
        assert_eq!(packets.len(), 8);

        let video: Vec<_> = packets.iter().filter(|p| p.stream_index == 0).collect();
        assert_eq!(video.iter().map(|p| p.dts).collect::<Vec<_>>(), [0, 1, 2, 3]);
        assert!(video.iter().all(|p| p.pts == NOPTS_VALUE));
        assert_eq!(video[1].data(), video_frame(1).as_slice());
        assert_eq!(video_keys(&packets), [true, false, false, true]);

        let audio: Vec<_> = packets.iter().filter(|p| p.stream_index == 1).collect();
        assert_eq!(audio.iter().map(|p| p.pts).collect::<Vec<_>>(), [0, 1920, 3840, 5760]);
        assert!(audio.iter().all(|p| p.duration == 1920 && p.size() == AUDIO_CHUNK && p.is_key()));
        Ok(())
    }

    #[test]
    fn absolute_index_offsets() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(avi_file(4, Index::Absolute, 0, &[]))?;
        let packets = read_all(&mut format, &mut ctx)?;
        assert_eq!(video_keys(&packets), [true, false, false, true]);
        Ok(())
    }

    #[test]
    fn without_index() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(avi_file(4, Index::None, 0, &[]))?;
        assert_eq!(ctx.streams[0].nb_frames, 0);
        let packets = read_all(&mut format, &mut ctx)?;
        assert_eq!(packets.len(), 8);
        assert_eq!(video_keys(&packets), [true, false, false, false]);
        assert!(format.seek(&mut ctx, 0, 2, SeekFlags::empty()).is_err());
        Ok(())
    }

    #[test]
    fn resync_after_garbage() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(avi_file(4, Index::None, 0, &[0xFF, 0xFE, b'x', 0x00, 0x01, 0x02]))?;
        let packets = read_all(&mut format, &mut ctx)?;
        assert_eq!(packets.len(), 8);
        assert_eq!(packets[4].stream_index, 0);
        assert_eq!(packets[4].dts, 2);
        Ok(())
    }

    #[test]
    fn seek_to_keyframe() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(avi_file(10, Index::Relative, 0, &[]))?;
        format.seek(&mut ctx, 0, 5, SeekFlags::empty())?;
        let video = format.read_packet(&mut ctx)?;
        assert_eq!((video.stream_index, video.dts), (0, 3));
        assert!(video.is_key());
        let audio = format.read_packet(&mut ctx)?;
        assert_eq!((audio.stream_index, audio.dts), (1, 3 * 1920));

        format.seek(&mut ctx, 0, 5, SeekFlags::FORWARD)?;
        assert_eq!(format.read_packet(&mut ctx)?.dts, 6);

        format.seek(&mut ctx, 1, 0, SeekFlags::empty())?;
        assert_eq!(format.read_packet(&mut ctx)?.dts, 0);
        Ok(())
    }

    #[test]
    fn non_interleaved_reads_in_time_order() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(avi_file(3, Index::Relative, AVIF_MUSTUSEINDEX, &[]))?;
        let packets = read_all(&mut format, &mut ctx)?;
        let order: Vec<_> = packets.iter().map(|p| (p.stream_index, p.dts)).collect();
        assert_eq!(order, [(0, 0), (1, 0), (0, 1), (1, 1920), (0, 2), (1, 3840)]);
        Ok(())
    }
}
