//! Native FLAC demuxer.
//!
//! Frames carry no length field, so a frame ends where the next valid frame
//! header begins: sync code, CRC-8 and a frame or sample number continuing
//! the current one. The frame's CRC-16 footer is verified afterwards.

use log::Level;

use super::{IFormat, InputContext, PROBE_SCORE_MAX, SeekFlags};
use crate::codecs::flac::{
    FrameHeader, MAX_FRAME_HEADER_SIZE, METADATA_SEEKTABLE, METADATA_STREAMINFO,
    METADATA_VORBIS_COMMENT, STREAMINFO_SIZE, StreamInfo, parse_block_header,
};
use crate::io::IoReader;
use crate::log_or_err;
use crate::structs::packet::{Packet, PacketFlags};
use crate::structs::rational::{MILLI_TIME_BASE, Rational, rescale};
use crate::structs::stream::{CodecId, CodecParameters, Stream};
use crate::utils::crc::FLAC_FRAME_CRC;
use crate::utils::errors::FormatError;

const MARKER: &[u8; 4] = b"fLaC";
const SEEKPOINT_SIZE: usize = 18;
const PLACEHOLDER_POINT: u64 = u64::MAX;

/// First window searched for the end of a frame.
const FRAME_WINDOW: usize = 16 * 1024;
/// Frames are never longer than this.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const SYNC_WINDOW: usize = 64 * 1024;
const MAX_SYNC_SCAN: u64 = 1024 * 1024;
/// Below this distance bisection stops and frames are walked.
const BISECT_THRESHOLD: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SeekPoint {
    sample: u64,
    /// Relative to the first frame.
    offset: u64,
}

/// Vendor string and `KEY=value` pairs of a VORBIS_COMMENT block.
pub(crate) fn parse_vorbis_comment(data: &[u8]) -> Result<(String, Vec<(String, String)>), FormatError> {
    let mut io = IoReader::from_bytes(data.to_vec());
    let vendor_len = io.read_u32_le()? as usize;
    let vendor = io.read_string(vendor_len)?;
    let count = io.read_u32_le()?;
    let mut comments = Vec::new();
    for _ in 0..count {
        let len = io.read_u32_le()? as usize;
        let comment = io.read_string(len)?;
        match comment.split_once('=') {
            Some((key, value)) => comments.push((key.to_ascii_lowercase(), value.to_string())),
            None => log::debug!("flac: comment without '=' ignored: {comment}"),
        }
    }
    Ok((vendor, comments))
}

#[derive(Debug, Default)]
pub struct IFlacFormat {
    info: StreamInfo,
    data_start: u64,
    seek_points: Vec<SeekPoint>,
    /// Block size used to turn frame numbers into sample numbers.
    block_size: u32,
    variable_block_size: Option<bool>,
    /// `(pts, pos)` of frames read so far, in file order.
    index: Vec<(i64, u64)>,
}

impl IFlacFormat {
    fn header_at(&self, buf: &[u8]) -> Option<FrameHeader> {
        let header = FrameHeader::parse(buf).ok()?;
        if self.variable_block_size.is_some_and(|v| v != header.variable_block_size) {
            return None;
        }
        if header.sample_rate != 0 && header.sample_rate != self.info.sample_rate {
            return None;
        }
        Some(header)
    }

    fn first_sample(&self, header: &FrameHeader) -> i64 {
        header.first_sample(self.block_size) as i64
    }

    /// Whether `next` is the frame right after `cur`.
    fn follows(cur: &FrameHeader, next: &FrameHeader) -> bool {
        if cur.variable_block_size {
            next.number == cur.number + cur.block_size as u64
        } else {
            next.number == cur.number + 1
        }
    }

    /// Length of the frame starting at the current position, found by
    /// looking for the next frame's header. The position is not moved.
    fn frame_len(&self, io: &mut IoReader, header: &FrameHeader) -> Result<usize, FormatError> {
        let mut window = FRAME_WINDOW.max(self.info.max_frame_size as usize + MAX_FRAME_HEADER_SIZE);
        let mut from = header.header_len;
        loop {
            let buf = io.peek(window)?;
            let at_end = buf.len() < window;
            let limit = buf.len().saturating_sub(if at_end { 2 } else { MAX_FRAME_HEADER_SIZE });
            for i in from..limit {
                if !FrameHeader::has_sync(&buf[i..]) {
                    continue;
                }
                if let Some(next) = self.header_at(&buf[i..]) {
                    if Self::follows(header, &next) {
                        return Ok(i);
                    }
                }
            }
            if at_end {
                return Ok(buf.len());
            }
            if window >= MAX_FRAME_SIZE {
                return Err(FormatError::invalid(format!(
                    "flac: frame at {} exceeds {MAX_FRAME_SIZE} bytes",
                    io.pos()
                )));
            }
            from = limit.max(from);
            window = (window * 2).min(MAX_FRAME_SIZE);
        }
    }

    /// Moves to the next valid frame header. Returns `false` when the input
    /// ends first.
    fn resync(&self, io: &mut IoReader) -> Result<bool, FormatError> {
        let start = io.pos();
        while io.pos() - start < MAX_SYNC_SCAN {
            let window = io.peek(SYNC_WINDOW)?;
            let at_end = window.len() < SYNC_WINDOW;
            let found = (0..window.len())
                .find(|&i| FrameHeader::has_sync(&window[i..]) && self.header_at(&window[i..]).is_some());
            if let Some(skip) = found {
                if io.pos() + skip as u64 > start {
                    log::debug!("flac: skipped {} bytes to resync", io.pos() + skip as u64 - start);
                }
                io.skip(skip as u64)?;
                return Ok(true);
            }
            if at_end {
                return Ok(false);
            }
            io.skip((window.len() - MAX_FRAME_HEADER_SIZE) as u64)?;
        }
        Err(FormatError::invalid(format!(
            "flac: no frame header within {MAX_SYNC_SCAN} bytes of {start}"
        )))
    }

    /// pts of the frame at the current position, after resyncing.
    fn probe_pts(&self, io: &mut IoReader) -> Result<Option<i64>, FormatError> {
        if !self.resync(io)? {
            return Ok(None);
        }
        let head = io.peek(MAX_FRAME_HEADER_SIZE)?;
        Ok(self.header_at(&head).map(|h| self.first_sample(&h)))
    }

    /// Narrows `[lo, hi)` down to a start position at or before `timestamp`.
    fn bisect(&self, io: &mut IoReader, timestamp: i64, mut lo: u64) -> Result<u64, FormatError> {
        let mut hi = io.size();
        while hi > lo + BISECT_THRESHOLD {
            let mid = lo + (hi - lo) / 2;
            io.seek(mid)?;
            match self.probe_pts(io)? {
                Some(pts) if pts <= timestamp => lo = io.pos(),
                _ => hi = mid,
            }
        }
        Ok(lo)
    }

    /// Walks frames from the current position to the one covering
    /// `timestamp`, or the first one after it with `forward`.
    fn walk_to(&self, io: &mut IoReader, timestamp: i64, forward: bool) -> Result<(), FormatError> {
        let mut last = io.pos();
        loop {
            let pos = io.pos();
            let head = io.peek(MAX_FRAME_HEADER_SIZE)?;
            let Some(header) = self.header_at(&head) else {
                io.seek(last)?;
                return Ok(());
            };
            let pts = self.first_sample(&header);
            let end = pts + header.block_size as i64;
            if (forward && pts >= timestamp) || (!forward && end > timestamp) {
                return Ok(());
            }
            let len = self.frame_len(io, &header)?;
            last = pos;
            io.skip(len as u64)?;
        }
    }
}

impl IFormat for IFlacFormat {
    fn name(&self) -> &'static str {
        "flac"
    }

    fn probe(buf: &[u8]) -> u8 {
        if buf.len() < 8 || &buf[..4] != MARKER {
            return 0;
        }
        let (_, kind, len) = parse_block_header([buf[4], buf[5], buf[6], buf[7]]);
        if kind == METADATA_STREAMINFO && len == STREAMINFO_SIZE {
            PROBE_SCORE_MAX
        } else {
            0
        }
    }

    fn read_header(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        let marker = ctx.io.read_array::<4>()?;
        if &marker != MARKER {
            return Err(FormatError::invalid("flac: missing fLaC marker"));
        }

        let mut streaminfo = None;
        let mut stream_metadata = Vec::new();
        loop {
            let (last, kind, len) = parse_block_header(ctx.io.read_array::<4>()?);
            let block_start = ctx.io.pos();
            match kind {
                METADATA_STREAMINFO => {
                    let data = ctx.io.read_bytes(len)?;
                    self.info = StreamInfo::parse(&data)?;
                    streaminfo = Some(data[..STREAMINFO_SIZE].to_vec());
                }
                METADATA_SEEKTABLE => {
                    for _ in 0..len / SEEKPOINT_SIZE {
                        let sample = ctx.io.read_u64_be()?;
                        let offset = ctx.io.read_u64_be()?;
                        ctx.io.skip(2)?;
                        if sample != PLACEHOLDER_POINT {
                            self.seek_points.push(SeekPoint { sample, offset });
                        }
                    }
                }
                METADATA_VORBIS_COMMENT => {
                    let data = ctx.io.read_bytes(len)?;
                    match parse_vorbis_comment(&data) {
                        Ok((vendor, comments)) => {
                            stream_metadata.push(("encoder".to_string(), vendor));
                            ctx.metadata.extend(comments);
                        }
                        Err(e) => {
                            log_or_err!(ctx, Level::Warn, FormatError::invalid(format!("flac: bad VORBIS_COMMENT: {e}")))
                        }
                    }
                }
                _ => log::debug!("flac: skipping metadata block {kind} ({len} bytes)"),
            }
            ctx.io.seek(block_start + len as u64)?;
            if last {
                break;
            }
        }

        let extradata = streaminfo.ok_or_else(|| FormatError::invalid("flac: no STREAMINFO block"))?;
        self.data_start = ctx.io.pos();
        self.seek_points.sort_by_key(|p| p.sample);
        self.seek_points.dedup_by_key(|p| p.sample);

        let info = &self.info;
        if info.min_block_size == info.max_block_size {
            self.block_size = info.max_block_size as u32;
        }
        let mut stream = Stream::new(0, Rational::new(1, info.sample_rate as i32));
        stream.codecpar = CodecParameters::audio(CodecId::Flac, info.sample_rate, info.channels as u32);
        stream.codecpar.bits_per_raw_sample = info.bits_per_sample as u32;
        stream.codecpar.extradata = extradata;
        if self.block_size > 0 {
            stream.codecpar.frame_size = self.block_size;
        }
        stream.start_time = 0;
        stream.metadata.extend(stream_metadata);
        if info.total_samples > 0 {
            stream.duration = info.total_samples as i64;
            ctx.duration = rescale(stream.duration, stream.time_base, MILLI_TIME_BASE);
            if ctx.io.size() > self.data_start {
                let bits = (ctx.io.size() - self.data_start) as i64 * 8;
                stream.codecpar.bit_rate = bits * info.sample_rate as i64 / stream.duration;
            }
        }
        log::debug!(
            "flac: {} Hz, {} channels, {} bits, {} samples, {} seek points",
            info.sample_rate,
            info.channels,
            info.bits_per_sample,
            info.total_samples,
            self.seek_points.len()
        );
        ctx.add_stream(stream);
        Ok(())
    }

    fn read_packet(&mut self, ctx: &mut InputContext) -> Result<Packet, FormatError> {
        loop {
            let pos = ctx.io.pos();
            let head = ctx.io.peek(MAX_FRAME_HEADER_SIZE)?;
            if head.is_empty() {
                return Err(FormatError::Eof);
            }
            let Some(header) = self.header_at(&head) else {
                log_or_err!(ctx, Level::Warn, FormatError::invalid(format!("flac: lost sync at {pos}")));
                ctx.io.skip(1)?;
                if !self.resync(&mut ctx.io)? {
                    return Err(FormatError::Eof);
                }
                continue;
            };

            if self.variable_block_size.is_none() {
                self.variable_block_size = Some(header.variable_block_size);
                if self.block_size == 0 {
                    self.block_size = header.block_size;
                }
            }

            let len = self.frame_len(&mut ctx.io, &header)?;
            let data = ctx.io.read_bytes(len)?;
            let mut packet = Packet::from_vec(data);
            if FLAC_FRAME_CRC.checksum(packet.data()) != 0 {
                packet.flags |= PacketFlags::CORRUPT;
                log_or_err!(ctx, Level::Warn, FormatError::invalid(format!("flac: frame CRC mismatch at {pos}")));
            }
            let pts = self.first_sample(&header);
            packet.stream_index = 0;
            packet.pts = pts;
            packet.dts = pts;
            packet.duration = header.block_size as i64;
            packet.pos = pos as i64;
            packet.flags |= PacketFlags::KEY;

            if self.index.last().is_none_or(|&(_, p)| p < pos) {
                self.index.push((pts, pos));
            }
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
        ctx.stream(stream_index)?;
        if flags.contains(SeekFlags::BYTE) {
            let mut target = (timestamp.max(0) as u64).max(self.data_start);
            if ctx.io.size() > 0 {
                target = target.min(ctx.io.size());
            }
            ctx.io.seek(target)?;
            if !flags.contains(SeekFlags::ANY) && !self.resync(&mut ctx.io)? {
                return Err(FormatError::Eof);
            }
            return Ok(());
        }

        let timestamp = timestamp.max(0);
        let forward = flags.contains(SeekFlags::FORWARD);
        let i = self.index.partition_point(|&(pts, _)| pts <= timestamp);
        let start = if i > 0 && i < self.index.len() {
            log::debug!("flac: seek from read index entry {}", i - 1);
            self.index[i - 1].1
        } else {
            let j = self.seek_points.partition_point(|p| p.sample as i64 <= timestamp);
            let from_table = j.checked_sub(1).map(|j| self.data_start + self.seek_points[j].offset);
            match from_table {
                Some(pos) => {
                    log::debug!("flac: seek from seek point {} at {pos}", j - 1);
                    pos
                }
                None if ctx.io.size() > 0 => self.bisect(&mut ctx.io, timestamp, self.data_start)?,
                None => self.data_start,
            }
        };
        ctx.io.seek(start)?;
        if !self.resync(&mut ctx.io)? {
            return Err(FormatError::Eof);
        }
        self.walk_to(&mut ctx.io, timestamp, forward)
    }

    fn estimated_packet_count(&self, ctx: &InputContext) -> Option<u64> {
        let stream = ctx.streams.first()?;
        (self.block_size > 0 && stream.duration > 0)
            .then(|| (stream.duration as u64).div_ceil(self.block_size as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::flac::tests::{frame_header, streaminfo};

    fn frame(number: u8) -> Vec<u8> {
        let mut data = frame_header(number);
        data.extend((0..40).map(|i| (i as u8).wrapping_add(number) & 0x7F));
        let crc = FLAC_FRAME_CRC.checksum(&data);
        data.extend_from_slice(&crc.to_be_bytes());
        data
    }

    fn block(last: bool, kind: u8, body: &[u8]) -> Vec<u8> {
        let len = body.len() as u32;
        let mut out = vec![kind | if last { 0x80 } else { 0 }];
        out.extend_from_slice(&len.to_be_bytes()[1..]);
        out.extend_from_slice(body);
        out
    }

    fn vorbis_comment() -> Vec<u8> {
        let mut body = 5u32.to_le_bytes().to_vec();
        body.extend_from_slice(b"avmux");
        let comments: [&[u8]; 2] = [b"TITLE=Test tone", b"ARTIST=Nobody"];
        body.extend_from_slice(&(comments.len() as u32).to_le_bytes());
        for c in comments {
            body.extend_from_slice(&(c.len() as u32).to_le_bytes());
            body.extend_from_slice(c);
        }
        body
    }

    fn seektable(points: &[(u64, u64)]) -> Vec<u8> {
        let mut body = Vec::new();
        for &(sample, offset) in points {
            body.extend_from_slice(&sample.to_be_bytes());
            body.extend_from_slice(&offset.to_be_bytes());
            body.extend_from_slice(&4096u16.to_be_bytes());
        }
        body.extend_from_slice(&PLACEHOLDER_POINT.to_be_bytes());
        body.extend_from_slice(&[0; 10]);
        body
    }

    fn file(frames: u8, seek_points: &[(u64, u64)]) -> Vec<u8> {
        let mut out = MARKER.to_vec();
        out.extend(block(false, METADATA_STREAMINFO, &streaminfo(frames as u64 * 4096)));
        out.extend(block(false, METADATA_SEEKTABLE, &seektable(seek_points)));
        out.extend(block(true, METADATA_VORBIS_COMMENT, &vorbis_comment()));
        for n in 0..frames {
            out.extend(frame(n));
        }
        out
    }

    fn open(data: Vec<u8>) -> anyhow::Result<(IFlacFormat, InputContext)> {
        let mut ctx = InputContext::new(IoReader::from_bytes(data));
        let mut format = IFlacFormat::default();
        format.read_header(&mut ctx)?;
        Ok((format, ctx))
    }

    #[test]
    fn probe_marker() {
        assert_eq!(IFlacFormat::probe(&file(1, &[])), PROBE_SCORE_MAX);
        assert_eq!(IFlacFormat::probe(b"fLaC\x01\x00\x00\x22"), 0);
        assert_eq!(IFlacFormat::probe(b"OggS"), 0);
    }

    #[test]
    fn header_and_metadata() -> anyhow::Result<()> {
        let (format, ctx) = open(file(3, &[(4096, 48)]))?;
        let stream = &ctx.streams[0];
        assert_eq!(stream.codecpar.codec_id, CodecId::Flac);
        assert_eq!((stream.codecpar.sample_rate, stream.codecpar.channels), (44100, 2));
        assert_eq!(stream.codecpar.bits_per_raw_sample, 16);
        assert_eq!(stream.codecpar.extradata.len(), STREAMINFO_SIZE);
        assert_eq!(stream.duration, 3 * 4096);
        assert_eq!(stream.metadata.get("encoder").map(String::as_str), Some("avmux"));
        assert_eq!(ctx.metadata.get("title").map(String::as_str), Some("Test tone"));
        assert_eq!(ctx.metadata.get("artist").map(String::as_str), Some("Nobody"));
        assert_eq!(format.seek_points, vec![SeekPoint { sample: 4096, offset: 48 }]);
        assert_eq!(format.estimated_packet_count(&ctx), Some(3));
        Ok(())
    }

    #[test]
    fn frames_split_on_next_header() -> anyhow::Result<()> {
        let data = file(3, &[]);
        let (mut format, mut ctx) = open(data)?;
        let start = format.data_start as i64;
        let mut packets = Vec::new();
        loop {
            match format.read_packet(&mut ctx) {
                Ok(packet) => packets.push(packet),
                Err(FormatError::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }
        assert_eq!(packets.len(), 3);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet.data(), &frame(i as u8)[..]);
            assert_eq!(packet.pts, i as i64 * 4096);
            assert_eq!(packet.duration, 4096);
            assert_eq!(packet.pos, start + i as i64 * 48);
            assert!(packet.is_key());
            assert!(!packet.flags.contains(PacketFlags::CORRUPT));
        }
        Ok(())
    }

    #[test]
    fn corrupt_frame_is_flagged() -> anyhow::Result<()> {
        let mut data = file(2, &[]);
        let (mut format, mut ctx) = open(data.clone())?;
        let at = format.data_start as usize + 10;
        data[at] ^= 0x01;
        ctx.io = IoReader::from_bytes(data);
        ctx.io.seek(format.data_start)?;
        let packet = format.read_packet(&mut ctx)?;
        assert!(packet.flags.contains(PacketFlags::CORRUPT));
        assert_eq!(packet.size(), 48);

        ctx.fail_level = Level::Warn;
        ctx.io.seek(format.data_start)?;
        assert!(format.read_packet(&mut ctx).is_err());
        Ok(())
    }

    #[test]
    fn seek_with_and_without_table() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(file(8, &[(4 * 4096, 4 * 48)]))?;
        format.seek(&mut ctx, 0, 5 * 4096 + 10, SeekFlags::BACKWARD)?;
        assert_eq!(format.read_packet(&mut ctx)?.pts, 5 * 4096);

        let (mut format, mut ctx) = open(file(8, &[]))?;
        format.seek(&mut ctx, 0, 2 * 4096 + 1, SeekFlags::FORWARD)?;
        assert_eq!(format.read_packet(&mut ctx)?.pts, 3 * 4096);
        format.seek(&mut ctx, 0, 7 * 4096, SeekFlags::BACKWARD)?;
        assert_eq!(format.read_packet(&mut ctx)?.pts, 7 * 4096);
        Ok(())
    }
}
