//! MPEG program stream demuxer.
//!
//! Pack headers, system headers and padding are skipped. Stream types come
//! from the program stream map when there is one, otherwise from the stream
//! id and a look at the first payload. A video access unit may be split over
//! several PES packets of which only the first carries a timestamp, so
//! payloads are collected until the next timestamped PES of the same stream.

use std::collections::{BTreeMap, HashMap, VecDeque};

use log::Level;

use super::mpegts::packet::{PesHeader, read_timestamp, unwrap_timestamp};
use super::mpegts::psi::stream_type_codec;
use super::mpegts::{PesStream, es_stream};
use super::{IFormat, InputContext, PROBE_SCORE_MAX, PROBE_SCORE_PARTIAL, SeekFlags};
use crate::io::IoReader;
use crate::log_or_err;
use crate::structs::packet::Packet;
use crate::structs::rational::{MPEGTS_TIME_BASE, NOPTS_VALUE, rescale};
use crate::structs::stream::{CodecId, Stream};
use crate::utils::crc::MPEG2_CRC;
use crate::utils::errors::{FormatError, IoError};

const END_CODE: u8 = 0xB9;
const PACK_START: u8 = 0xBA;
const SYSTEM_HEADER: u8 = 0xBB;
const PROGRAM_STREAM_MAP: u8 = 0xBC;
const PRIVATE_STREAM_1: u8 = 0xBD;
const PADDING_STREAM: u8 = 0xBE;
const PRIVATE_STREAM_2: u8 = 0xBF;
const EXTENDED_STREAM: u8 = 0xFD;

/// Bytes scanned for a start code before giving up.
const MAX_SYNC_SIZE: u64 = 100_000;
const SCAN_WINDOW: usize = 4096;
/// Bytes read at open to discover the streams.
const HEADER_SCAN: u64 = 512 * 1024;
/// Tail of the input scanned for the last timestamps.
const DURATION_SCAN: u64 = 500 * 1000;
/// Bytes scanned for a timestamp from one bisection point.
const MAX_SEEK_SCAN: u64 = 1024 * 1024;

/// Map key of a stream: the PES stream id, or `0xBD << 8 | substream id`
/// for private stream 1.
type StreamKey = u16;

#[derive(Debug)]
struct PsStream {
    es: PesStream,
    pts: i64,
    dts: i64,
    data: Vec<u8>,
}

impl PsStream {
    fn flush(&mut self, ctx: &mut InputContext, queue: &mut VecDeque<Packet>) -> Result<(), FormatError> {
        let data = std::mem::take(&mut self.data);
        self.es.emit(ctx, queue, self.pts, self.dts, &data)?;
        self.pts = NOPTS_VALUE;
        self.dts = NOPTS_VALUE;
        Ok(())
    }
}

/// Maps the end of input to `None`.
fn until_eof<T>(result: Result<T, IoError>) -> Result<Option<T>, FormatError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(IoError::Eof(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Header of an MPEG-1 system stream packet: stuffing, optional STD buffer
/// size, then the timestamp fields.
fn parse_mpeg1_pes(data: &[u8]) -> Result<PesHeader, FormatError> {
    let length = u16::from_be_bytes([data[4], data[5]]) as usize;
    let mut header = PesHeader {
        stream_id: data[3],
        packet_length: length + 6,
        header_len: 6,
        pts: NOPTS_VALUE,
        dts: NOPTS_VALUE,
    };
    let mut p = 6;
    while data.get(p) == Some(&0xFF) {
        p += 1;
    }
    if data.get(p).is_some_and(|b| b & 0xC0 == 0x40) {
        p += 2;
    }
    let truncated = || FormatError::invalid("mpegps: truncated MPEG-1 packet header");
    let flags = *data.get(p).ok_or_else(truncated)?;
    match flags & 0xF0 {
        0x20 => {
            header.pts = read_timestamp(data.get(p..p + 5).ok_or_else(truncated)?);
            p += 5;
        }
        0x30 => {
            header.pts = read_timestamp(data.get(p..p + 5).ok_or_else(truncated)?);
            header.dts = read_timestamp(data.get(p + 5..p + 10).ok_or_else(truncated)?);
            p += 10;
        }
        _ => p += 1,
    }
    header.header_len = p;
    Ok(header)
}

/// Guesses the codec of a video stream without a program stream map.
fn sniff_video(payload: &[u8]) -> CodecId {
    let code = payload
        .windows(4)
        .find(|w| w[..3] == [0, 0, 1])
        .map(|w| w[3]);
    match code {
        Some(0xB3 | 0xB5 | 0xB8 | 0x00) | None => CodecId::Mpeg2Video,
        Some(nal) if nal & 0x80 == 0 && matches!(nal & 0x1F, 1 | 5 | 6 | 7 | 9) => CodecId::H264,
        Some(_) => CodecId::Mpeg2Video,
    }
}

/// DVD LPCM sample rate and channel count from the substream header.
fn lpcm_format(header: &[u8]) -> Option<(u32, u32)> {
    const RATES: [u32; 4] = [48000, 96000, 44100, 32000];
    let b = *header.get(5)?;
    if b >> 6 != 0 {
        log::info!("mpegps: only 16 bit LPCM is supported");
        return None;
    }
    Some((RATES[((b >> 4) & 3) as usize], (b & 7) as u32 + 1))
}

#[derive(Debug, Default)]
pub struct IMpegpsFormat {
    mpeg1: bool,
    data_start: u64,
    /// Stream type per stream id, from the program stream map.
    psm: HashMap<u8, u8>,
    streams: BTreeMap<StreamKey, PsStream>,
    /// Last timestamp of each stream near the end of input.
    last_pts: HashMap<StreamKey, i64>,
    queue: VecDeque<Packet>,
    eof: bool,
}

impl IMpegpsFormat {
    /// Moves to the next system start code and returns its code byte.
    fn find_start_code(io: &mut IoReader) -> Result<Option<u8>, FormatError> {
        let start = io.pos();
        loop {
            let window = io.peek(SCAN_WINDOW)?;
            if window.len() < 4 {
                return Ok(None);
            }
            let found = (0..window.len() - 3)
                .find(|&i| window[i..i + 3] == [0, 0, 1] && window[i + 3] >= END_CODE);
            if let Some(i) = found {
                if io.pos() + i as u64 > start {
                    log::debug!("mpegps: skipped {} bytes to resync", io.pos() + i as u64 - start);
                }
                io.skip(i as u64)?;
                return Ok(Some(window[i + 3]));
            }
            io.skip((window.len() - 3) as u64)?;
            if window.len() < SCAN_WINDOW {
                return Ok(None);
            }
            if io.pos() - start > MAX_SYNC_SIZE {
                return Err(FormatError::invalid(format!(
                    "mpegps: no start code within {MAX_SYNC_SIZE} bytes of {start}"
                )));
            }
        }
    }

    /// Reads the length-prefixed unit at the current start code.
    fn read_unit(io: &mut IoReader) -> Result<Option<Vec<u8>>, FormatError> {
        let head = io.peek(6)?;
        if head.len() < 6 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([head[4], head[5]]) as usize;
        until_eof(io.read_bytes(6 + len))
    }

    fn skip_pack_header(io: &mut IoReader) -> Result<Option<()>, FormatError> {
        let head = io.peek(14)?;
        let len = match head.get(4) {
            Some(b) if b & 0xC0 == 0x40 && head.len() == 14 => 14 + (head[13] & 0x07) as u64,
            Some(b) if b & 0xF0 == 0x20 => 12,
            _ => 4,
        };
        until_eof(io.skip(len))
    }

    fn parse_psm(&mut self, ctx: &mut InputContext, data: &[u8]) -> Result<(), FormatError> {
        if MPEG2_CRC.checksum(data) != 0 {
            log_or_err!(ctx, Level::Warn, FormatError::invalid("mpegps: CRC mismatch in program stream map"));
            return Ok(());
        }
        let body = &data[6..];
        if body.len() < 4 {
            return Ok(());
        }
        let mut p = 4 + u16::from_be_bytes([body[2], body[3]]) as usize;
        let Some(map_len) = body.get(p..p + 2) else {
            return Ok(());
        };
        let end = (p + 2 + u16::from_be_bytes([map_len[0], map_len[1]]) as usize).min(body.len());
        p += 2;
        while p + 4 <= end {
            let (stream_type, id) = (body[p], body[p + 1]);
            let info_len = u16::from_be_bytes([body[p + 2], body[p + 3]]) as usize;
            if self.psm.insert(id, stream_type) != Some(stream_type) {
                log::debug!("mpegps: stream {id:#04x} has stream type {stream_type:#04x}");
            }
            p += 4 + info_len;
        }
        Ok(())
    }

    /// Next PES packet with its offset, `None` at the end of input.
    fn next_pes(&mut self, ctx: &mut InputContext) -> Result<Option<(u64, Vec<u8>)>, FormatError> {
        loop {
            let Some(code) = Self::find_start_code(&mut ctx.io)? else {
                return Ok(None);
            };
            let pos = ctx.io.pos();
            match code {
                PACK_START => {
                    if Self::skip_pack_header(&mut ctx.io)?.is_none() {
                        return Ok(None);
                    }
                }
                END_CODE => {
                    if until_eof(ctx.io.skip(4))?.is_none() {
                        return Ok(None);
                    }
                }
                PRIVATE_STREAM_1 | 0xC0..=0xEF | EXTENDED_STREAM => {
                    return Ok(Self::read_unit(&mut ctx.io)?.map(|data| (pos, data)));
                }
                _ => {
                    let Some(data) = Self::read_unit(&mut ctx.io)? else {
                        return Ok(None);
                    };
                    match code {
                        PROGRAM_STREAM_MAP => self.parse_psm(ctx, &data)?,
                        SYSTEM_HEADER | PADDING_STREAM | PRIVATE_STREAM_2 => {}
                        _ => log::trace!("mpegps: stream {code:#04x} skipped at {pos}"),
                    }
                }
            }
        }
    }

    fn parse_header(&self, data: &[u8]) -> Result<PesHeader, FormatError> {
        if self.mpeg1 {
            parse_mpeg1_pes(data)
        } else {
            PesHeader::parse(data)
        }
    }

    /// Stream key and payload of a PES packet, without any substream header.
    fn split_payload<'a>(header: &PesHeader, data: &'a [u8]) -> Option<(StreamKey, &'a [u8], &'a [u8])> {
        let payload = data.get(header.header_len..)?;
        if header.stream_id != PRIVATE_STREAM_1 {
            return Some((header.stream_id as StreamKey, payload, payload));
        }
        let &sub = payload.first()?;
        let skip = match sub {
            0x80..=0x87 => 4,
            0xA0..=0xA7 => 7,
            _ => 1,
        };
        let key = (PRIVATE_STREAM_1 as StreamKey) << 8 | sub as StreamKey;
        Some((key, payload, payload.get(skip..).unwrap_or(&[])))
    }

    fn new_stream(&self, key: StreamKey, full: &[u8], payload: &[u8]) -> Option<Stream> {
        if key > 0xFF {
            return match key as u8 {
                0x80..=0x87 => Some(es_stream(key as u32, CodecId::Ac3)),
                0xA0..=0xA7 => {
                    let (sample_rate, channels) = lpcm_format(full)?;
                    let mut stream = es_stream(key as u32, CodecId::PcmS16Be);
                    stream.codecpar.sample_rate = sample_rate;
                    stream.codecpar.channels = channels;
                    stream.codecpar.bits_per_coded_sample = 16;
                    stream.codecpar.block_align = 2 * channels;
                    Some(stream)
                }
                sub => {
                    log::info!("mpegps: private substream {sub:#04x} not supported");
                    None
                }
            };
        }
        let id = key as u8;
        let from_map = self
            .psm
            .get(&id)
            .map(|&stream_type| stream_type_codec(stream_type))
            .filter(|&codec_id| codec_id != CodecId::None);
        let codec_id = match (from_map, id) {
            (Some(codec_id), _) => codec_id,
            (None, 0xE0..=0xEF) => sniff_video(payload),
            (None, 0xC0..=0xDF) => CodecId::Mp3,
            (None, _) => {
                log::info!("mpegps: stream {id:#04x} not supported");
                return None;
            }
        };
        Some(es_stream(key as u32, codec_id))
    }

    /// Creates the stream for `key` on first sight. Returns whether the
    /// stream is demuxed.
    fn ensure_stream(
        &mut self,
        ctx: &mut InputContext,
        key: StreamKey,
        full: &[u8],
        payload: &[u8],
    ) -> Result<bool, FormatError> {
        if self.streams.contains_key(&key) {
            return Ok(true);
        }
        let Some(stream) = self.new_stream(key, full, payload) else {
            return Ok(false);
        };
        let codec_id = stream.codecpar.codec_id;
        let es = PesStream::attach(ctx, stream)?;
        log::debug!("mpegps: stream {} from id {key:#06x}: {codec_id}", es.index);
        self.streams.insert(
            key,
            PsStream {
                es,
                pts: NOPTS_VALUE,
                dts: NOPTS_VALUE,
                data: Vec::new(),
            },
        );
        Ok(true)
    }

    fn handle_pes(&mut self, ctx: &mut InputContext, pos: u64, data: &[u8]) -> Result<(), FormatError> {
        let header = match self.parse_header(data) {
            Ok(header) => header,
            Err(e) => {
                log_or_err!(ctx, Level::Warn, e);
                return Ok(());
            }
        };
        let Some((key, full, payload)) = Self::split_payload(&header, data) else {
            return Ok(());
        };
        if !self.ensure_stream(ctx, key, full, payload)? {
            return Ok(());
        }
        let last_pts = self.last_pts.get(&key).copied();
        let Some(ps) = self.streams.get_mut(&key) else {
            return Ok(());
        };

        if header.pts != NOPTS_VALUE && !ps.data.is_empty() {
            ps.flush(ctx, &mut self.queue)?;
        }
        if ps.data.is_empty() {
            ps.pts = header.pts;
            ps.dts = header.dts;
            ps.es.pos = pos;
            let stream = &mut ctx.streams[ps.es.index];
            if stream.start_time == NOPTS_VALUE && header.pts != NOPTS_VALUE {
                stream.start_time = header.pts;
                if let Some(last) = last_pts {
                    stream.duration = unwrap_timestamp(header.pts, last) - header.pts;
                }
            }
        }
        ps.data.extend_from_slice(payload);
        Ok(())
    }

    fn flush_streams(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        for ps in self.streams.values_mut() {
            if !ps.data.is_empty() {
                ps.flush(ctx, &mut self.queue)?;
            }
        }
        Ok(())
    }

    fn reset_streams(&mut self, last_dts: i64) {
        for ps in self.streams.values_mut() {
            ps.data.clear();
            ps.pts = NOPTS_VALUE;
            ps.dts = NOPTS_VALUE;
            ps.es.reset();
            ps.es.last_dts = last_dts;
        }
        self.queue.clear();
        self.eof = false;
    }

    /// Stream key and timestamp of the next PES carrying one.
    fn next_timestamp(&mut self, ctx: &mut InputContext) -> Result<Option<(u64, StreamKey, i64)>, FormatError> {
        while let Some((pos, data)) = self.next_pes(ctx)? {
            let Ok(header) = self.parse_header(&data) else {
                continue;
            };
            let Some((key, _, _)) = Self::split_payload(&header, &data) else {
                continue;
            };
            if header.pts != NOPTS_VALUE {
                return Ok(Some((pos, key, header.pts)));
            }
        }
        Ok(None)
    }

    /// Records the last timestamp of every stream in the tail of the input.
    fn scan_tail(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        let size = ctx.io.size();
        if size == 0 {
            return Ok(());
        }
        let resume = ctx.io.pos();
        ctx.io.seek(size.saturating_sub(DURATION_SCAN).max(resume))?;
        loop {
            match self.next_timestamp(ctx) {
                Ok(Some((_, key, pts))) => {
                    self.last_pts.insert(key, pts);
                }
                Ok(None) => break,
                Err(e) => {
                    log::debug!("mpegps: tail scan stopped: {e}");
                    break;
                }
            }
        }
        ctx.io.seek(resume)?;
        Ok(())
    }

    /// Creates the streams of the first packets so they are known before
    /// any packet is read.
    fn scan_head(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        while ctx.io.pos() < self.data_start + HEADER_SCAN {
            let Some((_, data)) = self.next_pes(ctx)? else {
                break;
            };
            let Ok(header) = self.parse_header(&data) else {
                continue;
            };
            if let Some((key, full, payload)) = Self::split_payload(&header, &data) {
                self.ensure_stream(ctx, key, full, payload)?;
            }
        }
        ctx.io.seek(self.data_start)?;
        Ok(())
    }
}

impl IFormat for IMpegpsFormat {
    fn name(&self) -> &'static str {
        "mpegps"
    }

    fn probe(buf: &[u8]) -> u8 {
        if buf.len() < 12 || buf[..4] != [0, 0, 1, PACK_START] {
            return 0;
        }
        let next = if buf[4] & 0xC0 == 0x40 {
            buf.get(13).map(|b| 14 + (b & 0x07) as usize)
        } else if buf[4] & 0xF0 == 0x20 {
            Some(12)
        } else {
            return 0;
        };
        let followed = next
            .and_then(|n| buf.get(n..n + 4))
            .is_some_and(|code| code[..3] == [0, 0, 1] && code[3] >= END_CODE);
        if followed {
            PROBE_SCORE_MAX - 1
        } else {
            PROBE_SCORE_PARTIAL
        }
    }

    fn read_header(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        let head = ctx.io.peek(5)?;
        if head.len() < 5 || head[..4] != [0, 0, 1, PACK_START] {
            return Err(FormatError::invalid("mpegps: missing pack header"));
        }
        self.mpeg1 = head[4] & 0xF0 == 0x20;
        self.data_start = ctx.io.pos();
        log::debug!(
            "mpegps: {} program stream",
            if self.mpeg1 { "MPEG-1" } else { "MPEG-2" }
        );

        self.scan_tail(ctx)?;
        self.scan_head(ctx)?;
        if self.streams.is_empty() {
            log::warn!("mpegps: no elementary stream in the first {HEADER_SCAN} bytes");
        }
        Ok(())
    }

    fn read_packet(&mut self, ctx: &mut InputContext) -> Result<Packet, FormatError> {
        loop {
            if let Some(packet) = self.queue.pop_front() {
                return Ok(packet);
            }
            if self.eof {
                return Err(FormatError::Eof);
            }
            match self.next_pes(ctx)? {
                Some((pos, data)) => self.handle_pes(ctx, pos, &data)?,
                None => {
                    self.flush_streams(ctx)?;
                    self.eof = true;
                }
            }
        }
    }

    fn seek(
        &mut self,
        ctx: &mut InputContext,
        stream_index: usize,
        timestamp: i64,
        flags: SeekFlags,
    ) -> Result<(), FormatError> {
        let size = ctx.io.size();
        if flags.contains(SeekFlags::BYTE) {
            let mut target = (timestamp.max(0) as u64).max(self.data_start);
            if size > 0 {
                target = target.min(size);
            }
            ctx.io.seek(target)?;
            self.reset_streams(NOPTS_VALUE);
            return Ok(());
        }
        if size == 0 {
            return Err(FormatError::unsupported("mpegps: seeking needs a known input size"));
        }

        let stream = ctx.stream(stream_index)?;
        let key = stream.id as StreamKey;
        let target = rescale(timestamp, stream.time_base, MPEGTS_TIME_BASE);
        let mut best = self.data_start;
        let (mut lo, mut hi) = (self.data_start, size);
        while hi > lo + SCAN_WINDOW as u64 {
            let mid = lo + (hi - lo) / 2;
            ctx.io.seek(mid)?;
            let mut found = None;
            while ctx.io.pos() < hi.min(mid + MAX_SEEK_SCAN) {
                match self.next_timestamp(ctx)? {
                    Some((pos, k, pts)) if k == key => {
                        found = Some((pos, pts));
                        break;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            match found {
                Some((pos, pts)) if pos < hi && unwrap_timestamp(target, pts) <= target => {
                    best = pos;
                    lo = pos + 1;
                }
                _ => hi = mid,
            }
        }
        log::debug!("mpegps: seek to {target} on stream {key:#06x} lands at byte {best}");

        ctx.io.seek(best)?;
        self.reset_streams(target);
        Ok(())
    }

    fn max_analyze_duration_ms(&self) -> Option<u64> {
        Some(2000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::aac::tests::ADTS_HEADER;
    use crate::codecs::h264::tests::{PPS, SPS_320X240};
    use crate::codecs::nalu::{StartCodeMode, join_nalu_by_start_code};
    use crate::formats::mpegts::packet::tests::pes;
    use crate::structs::packet::BitFormat;

    fn pack_header() -> Vec<u8> {
        vec![0, 0, 1, PACK_START, 0x44, 0, 0x04, 0, 0x04, 0x01, 0x01, 0x89, 0xC3, 0xF8]
    }

    /// Program stream map giving `(stream_type, stream_id)`.
    fn psm(entries: &[(u8, u8)]) -> Vec<u8> {
        let mut map = Vec::new();
        for &(stream_type, id) in entries {
            map.extend_from_slice(&[stream_type, id, 0, 0]);
        }
        let mut body = vec![0x80, 0x01, 0, 0];
        body.extend_from_slice(&(map.len() as u16).to_be_bytes());
        body.extend_from_slice(&map);
        let mut out = vec![0, 0, 1, PROGRAM_STREAM_MAP];
        out.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
        out.extend_from_slice(&body);
        let crc = MPEG2_CRC.checksum(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    /// PES packet without timestamps.
    fn continuation(stream_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0, 0, 1, stream_id];
        out.extend_from_slice(&((3 + payload.len()) as u16).to_be_bytes());
        out.extend_from_slice(&[0x80, 0x00, 0x00]);
        out.extend_from_slice(payload);
        out
    }

    fn access_unit() -> Vec<u8> {
        let idr = [0x65, 0x88, 0x84, 0x00, 0x33, 0x10, 0x20, 0x30];
        join_nalu_by_start_code(&[&SPS_320X240[..], &PPS[..], &idr[..]], StartCodeMode::Long)
    }

    fn adts_frames(count: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..count {
            out.extend_from_slice(&ADTS_HEADER);
            out.resize(out.len() + 364, i as u8);
        }
        out
    }

    /// `frames` packs, each with a video access unit split over two PES
    /// packets and one audio PES of two ADTS frames.
    fn program_stream(frames: i64, with_map: bool) -> Vec<u8> {
        let mut out = pack_header();
        if with_map {
            out.extend(psm(&[(0x1B, 0xE0), (0x0F, 0xC0)]));
        }
        let au = access_unit();
        let (head, tail) = au.split_at(au.len() / 2);
        for i in 0..frames {
            let pts = 90_000 + i * 3600;
            out.extend(pack_header());
            out.extend(pes(0xE0, pts + 3600, Some(pts), head));
            out.extend(continuation(0xE0, tail));
            out.extend(pes(0xC0, pts, None, &adts_frames(2)));
        }
        out.extend_from_slice(&[0, 0, 1, END_CODE]);
        out
    }

    fn open(data: Vec<u8>) -> anyhow::Result<(IMpegpsFormat, InputContext)> {
        let mut ctx = InputContext::new(IoReader::from_bytes(data));
        let mut format = IMpegpsFormat::default();
        format.read_header(&mut ctx)?;
        Ok((format, ctx))
    }

    fn read_all(format: &mut IMpegpsFormat, ctx: &mut InputContext) -> anyhow::Result<Vec<Packet>> {
        let mut packets = Vec::new();
        loop {
            match format.read_packet(ctx) {
                Ok(packet) => packets.push(packet),
                Err(FormatError::Eof) => return Ok(packets),
                Err(e) => return Err(e.into()),
            }
        }
    }

    #[test]
    fn probe_pack_header() {
        assert_eq!(IMpegpsFormat::probe(&program_stream(1, true)), PROBE_SCORE_MAX - 1);
        assert_eq!(IMpegpsFormat::probe(&pack_header()), PROBE_SCORE_PARTIAL);
        assert_eq!(IMpegpsFormat::probe(&[0, 0, 1, 0xB3, 0, 0, 0, 0, 0, 0, 0, 0]), 0);
    }

    #[test]
    fn streams_from_stream_map() -> anyhow::Result<()> {
        let (_, ctx) = open(program_stream(3, true))?;
        assert_eq!(ctx.streams.len(), 2);
        let video = &ctx.streams[0];
        assert_eq!(video.id, 0xE0);
        assert_eq!(video.codecpar.codec_id, CodecId::H264);
        assert_eq!(video.codecpar.bit_format, Some(BitFormat::AnnexB));
        assert_eq!(video.time_base, MPEGTS_TIME_BASE);
        assert_eq!(ctx.streams[1].codecpar.codec_id, CodecId::Aac);
        Ok(())
    }

    #[test]
    fn access_units_span_pes_packets() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(program_stream(3, true))?;
        let packets = read_all(&mut format, &mut ctx)?;

        let video: Vec<_> = packets.iter().filter(|p| p.stream_index == 0).collect();
        assert_eq!(video.len(), 3);
        assert_eq!(video[0].data(), access_unit().as_slice());
        assert!(video.iter().all(|p| p.is_key()));
        assert_eq!((video[1].dts, video[1].pts), (93_600, 97_200));

        let audio: Vec<_> = packets.iter().filter(|p| p.stream_index == 1).collect();
        assert_eq!(audio.len(), 6);
        assert!(audio.iter().all(|p| p.size() == 364));
        assert_eq!(ctx.streams[1].codecpar.sample_rate, 44100);

        let video = &ctx.streams[0];
        assert_eq!((video.codecpar.width, video.codecpar.height), (320, 240));
        assert_eq!(video.start_time, 93_600);
        assert_eq!(video.duration, 2 * 3600);
        Ok(())
    }

    #[test]
    fn stream_types_without_map() -> anyhow::Result<()> {
        let (_, ctx) = open(program_stream(1, false))?;
        let codecs: Vec<_> = ctx.streams.iter().map(|s| s.codecpar.codec_id).collect();
        assert_eq!(codecs, vec![CodecId::H264, CodecId::Mp3]);

        let mut mpeg2 = pack_header();
        mpeg2.extend(pes(0xE0, 0, None, &[0, 0, 1, 0xB3, 0x14, 0x00, 0xF0, 0x13]));
        let (mut format, mut ctx) = open(mpeg2)?;
        assert_eq!(ctx.streams[0].codecpar.codec_id, CodecId::Mpeg2Video);
        assert!(format.read_packet(&mut ctx)?.is_key());
        Ok(())
    }

    #[test]
    fn private_stream_substreams() -> anyhow::Result<()> {
        let ac3_frame = [0x0B, 0x77, 0x12, 0x34, 0x00, 0x40, 0xAA, 0xBB];
        let mut ac3 = vec![0x80, 0x01, 0x00, 0x01];
        ac3.extend_from_slice(&ac3_frame);
        let mut lpcm = vec![0xA0, 0x01, 0x00, 0x04, 0x00, 0x00, 0x80];
        lpcm.extend_from_slice(&[0x11, 0x22, 0x33, 0x44]);

        let mut data = pack_header();
        data.extend(pes(PRIVATE_STREAM_1, 9000, None, &ac3));
        data.extend(pes(PRIVATE_STREAM_1, 9000, None, &lpcm));
        data.extend(pes(PRIVATE_STREAM_1, 9000, None, &[0x20, 0x00, 0x01]));
        let (mut format, mut ctx) = open(data)?;
        assert_eq!(ctx.streams.len(), 2);
        assert_eq!(ctx.streams[0].id, 0xBD80);
        let lpcm_par = &ctx.streams[1].codecpar;
        assert_eq!(lpcm_par.codec_id, CodecId::PcmS16Be);
        assert_eq!((lpcm_par.sample_rate, lpcm_par.channels), (48000, 1));

        let packets = read_all(&mut format, &mut ctx)?;
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].data(), &ac3_frame[..]);
        assert_eq!(ctx.streams[0].codecpar.sample_rate, 48000);
        assert_eq!(packets[1].data(), &[0x11, 0x22, 0x33, 0x44]);
        Ok(())
    }

    #[test]
    fn mpeg1_packet_headers() -> anyhow::Result<()> {
        let mut data = vec![0, 0, 1, PACK_START, 0x21, 0, 0x01, 0, 0x01, 0x80, 0x00, 0x01];
        let payload = [0xFF, 0xFB, 0x90, 0x64, 0x00, 0x00];
        let mut unit = vec![0, 0, 1, 0xC0, 0, 0, 0xFF, 0x40, 0x20];
        unit.extend_from_slice(&crate::formats::mpegts::packet::write_timestamp(2, 4500));
        unit.extend_from_slice(&payload);
        let len = (unit.len() - 6) as u16;
        unit[4..6].copy_from_slice(&len.to_be_bytes());
        data.extend(unit);

        let (mut format, mut ctx) = open(data)?;
        assert!(format.mpeg1);
        let packet = format.read_packet(&mut ctx)?;
        assert_eq!(packet.pts, 4500);
        assert_eq!(packet.data(), &payload[..]);
        Ok(())
    }

    #[test]
    fn resync_after_garbage() -> anyhow::Result<()> {
        let mut data = program_stream(3, true);
        let cut = data.len() / 2;
        data.splice(cut..cut, [0x5Au8; 301]);
        let (mut format, mut ctx) = open(data)?;
        let packets = read_all(&mut format, &mut ctx)?;
        assert!(packets.iter().filter(|p| p.stream_index == 0).count() >= 2);
        assert!(packets.iter().any(|p| p.stream_index == 1));
        Ok(())
    }

    #[test]
    fn seek_by_timestamp() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(program_stream(60, true))?;
        let target = 90_000 + 30 * 3600;
        format.seek(&mut ctx, 0, target, SeekFlags::BACKWARD)?;
        let packet = loop {
            let packet = format.read_packet(&mut ctx)?;
            if packet.stream_index == 0 {
                break packet;
            }
        };
        assert!(packet.dts <= target);
        assert!(packet.dts >= target - 10 * 3600);
        assert_eq!(packet.data(), access_unit().as_slice());
        Ok(())
    }
}
