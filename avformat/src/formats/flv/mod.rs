//! FLV demuxer, legacy and enhanced (FourCC) tag headers. The muxer lives
//! in [`mux`].
//!
//! Streams are created when their first tag is seen. `read_header` scans a
//! few tags ahead so the usual audio and video streams exist with their
//! codec configuration before the first packet is read.

pub mod amf;
pub mod mux;

pub use mux::OFlvFormat;

use log::Level;

use self::amf::AmfValue;
use super::{IFormat, InputContext, PROBE_SCORE_MAX, SeekFlags};
use crate::codecs::aac::AudioSpecificConfig;
use crate::codecs::{h264, hevc, mp3, opus};
use crate::io::IoReader;
use crate::log_or_err;
use crate::structs::fourcc::FourCC;
use crate::structs::packet::{BitFormat, Packet, PacketFlags, SideData};
use crate::structs::rational::{MILLI_TIME_BASE, Rational, rescale};
use crate::structs::stream::{CodecId, CodecParameters, Disposition, MediaType, Stream};
use crate::utils::errors::{FormatError, IoError};

const SIGNATURE: &[u8; 3] = b"FLV";
const HEADER_SIZE: u32 = 9;
const TAG_HEADER_SIZE: usize = 11;
const PREV_TAG_SIZE: u64 = 4;

const TAG_AUDIO: u8 = 8;
const TAG_VIDEO: u8 = 9;
const TAG_SCRIPT: u8 = 18;

const FLAG_AUDIO: u8 = 0x04;
const FLAG_VIDEO: u8 = 0x01;

/// Tags larger than this are treated as corruption.
const MAX_TAG_SIZE: usize = 10 * 1024 * 1024;
const SYNC_WINDOW: usize = 64 * 1024;
const MAX_SYNC_SCAN: u64 = 4 * 1024 * 1024;
/// Tags read by `read_header` looking for stream configuration.
const MAX_SCAN_TAGS: usize = 64;

const FRAME_KEY: u8 = 1;
const FRAME_COMMAND: u8 = 5;

const AUDIO_EX_HEADER: u8 = 9;
const AAC_SEQUENCE_HEADER: u8 = 0;

// Legacy AVC packet types.
const AVC_SEQUENCE_HEADER: u8 = 0;
const AVC_NALU: u8 = 1;
const AVC_END_OF_SEQUENCE: u8 = 2;

// Enhanced packet types, shared by audio and video where they overlap.
const PACKET_SEQUENCE_START: u8 = 0;
const PACKET_CODED_FRAMES: u8 = 1;
const PACKET_SEQUENCE_END: u8 = 2;
const VIDEO_CODED_FRAMES_X: u8 = 3;
const VIDEO_METADATA: u8 = 4;
const AUDIO_MULTICHANNEL_CONFIG: u8 = 4;
const AUDIO_MULTITRACK: u8 = 5;
const VIDEO_MULTITRACK: u8 = 6;
const PACKET_MOD_EX: u8 = 7;

const MOD_EX_TIMESTAMP_OFFSET_NANO: u8 = 0;

#[derive(Debug, Clone, Copy)]
struct TagHeader {
    kind: u8,
    size: usize,
    /// Milliseconds.
    timestamp: i64,
    stream_id: u32,
}

impl TagHeader {
    fn parse(head: &[u8]) -> Option<Self> {
        if head.len() < TAG_HEADER_SIZE {
            return None;
        }
        let u24 = |b: &[u8]| u32::from_be_bytes([0, b[0], b[1], b[2]]);
        let timestamp = u24(&head[4..7]) | (head[7] as u32) << 24;
        Some(Self {
            kind: head[0] & 0x1F,
            size: u24(&head[1..4]) as usize,
            timestamp: timestamp as i32 as i64,
            stream_id: u24(&head[8..11]),
        })
    }

    fn plausible(&self) -> bool {
        matches!(self.kind, TAG_AUDIO | TAG_VIDEO | TAG_SCRIPT)
            && self.size <= MAX_TAG_SIZE
            && self.stream_id == 0
    }

    fn total_len(&self) -> u64 {
        (TAG_HEADER_SIZE + self.size) as u64 + PREV_TAG_SIZE
    }
}

fn read_i24(io: &mut IoReader) -> Result<i64, FormatError> {
    let v = io.read_u24_be()?;
    Ok(((v << 8) as i32 >> 8) as i64)
}

/// `onMetaData` fields used for stream setup and seeking.
#[derive(Debug, Clone, Default)]
struct OnMetaData {
    duration_ms: Option<i64>,
    width: u32,
    height: u32,
    frame_rate: Option<f64>,
    /// `(time in ms, tag position)` from the `keyframes` object.
    keyframes: Vec<(i64, u64)>,
}

impl OnMetaData {
    fn parse(value: &AmfValue) -> Self {
        let number = |key: &str| value.get(key).and_then(AmfValue::as_f64);
        let mut meta = Self {
            duration_ms: number("duration").filter(|d| *d > 0.0).map(|d| (d * 1000.0).round() as i64),
            width: number("width").unwrap_or(0.0) as u32,
            height: number("height").unwrap_or(0.0) as u32,
            frame_rate: number("framerate").filter(|r| *r > 0.0),
            keyframes: Vec::new(),
        };
        if let Some(keyframes) = value.get("keyframes") {
            let list = |key: &str| -> Vec<f64> {
                keyframes
                    .get(key)
                    .and_then(AmfValue::as_array)
                    .map(|a| a.iter().filter_map(AmfValue::as_f64).collect())
                    .unwrap_or_default()
            };
            meta.keyframes = list("times")
                .into_iter()
                .zip(list("filepositions"))
                .filter(|&(_, pos)| pos > 0.0)
                .map(|(t, pos)| ((t * 1000.0).round() as i64, pos as u64))
                .collect();
            meta.keyframes.sort_unstable();
        }
        meta
    }
}

#[derive(Debug, Default)]
pub struct IFlvFormat {
    data_start: u64,
    has_audio: bool,
    has_video: bool,
    audio: Option<usize>,
    video: Option<usize>,
    meta: OnMetaData,
    /// `(dts, pos)` of keyframe tags before `indexed_end`.
    index: Vec<(i64, u64)>,
    indexed_end: u64,
}

impl IFlvFormat {
    fn seek_on_video(&self) -> bool {
        self.video.is_some() || self.has_video
    }

    fn is_seek_point(&self, tag: &TagHeader, first_body_byte: u8) -> bool {
        match tag.kind {
            TAG_VIDEO => (first_body_byte >> 4) & 0x07 == FRAME_KEY,
            TAG_AUDIO => !self.seek_on_video(),
            _ => false,
        }
    }

    fn create_stream(&mut self, ctx: &mut InputContext, media_type: MediaType, codec_id: CodecId) -> usize {
        let mut stream = Stream::new(0, MILLI_TIME_BASE);
        stream.disposition |= Disposition::DEFAULT;
        if let Some(duration) = self.meta.duration_ms {
            stream.duration = duration;
        }
        if media_type == MediaType::Video {
            stream.codecpar = CodecParameters::video(codec_id, self.meta.width, self.meta.height);
            if let Some(rate) = self.meta.frame_rate {
                stream.codecpar.frame_rate = Rational::new((rate * 1000.0).round() as i32, 1000).reduce();
            }
            if codec_id.is_nalu_based() {
                stream.codecpar.bit_format = Some(BitFormat::Avcc);
            }
        } else {
            stream.codecpar = CodecParameters::audio(codec_id, 0, 0);
        }
        let index = ctx.add_stream(stream);
        log::debug!("flv: new {media_type:?} stream {index} ({})", codec_id.name());
        match media_type {
            MediaType::Video => self.video = Some(index),
            _ => self.audio = Some(index),
        }
        index
    }

    fn audio_stream(&mut self, ctx: &mut InputContext, codec_id: CodecId) -> usize {
        match self.audio {
            Some(index) => index,
            None => self.create_stream(ctx, MediaType::Audio, codec_id),
        }
    }

    fn video_stream(&mut self, ctx: &mut InputContext, codec_id: CodecId) -> usize {
        match self.video {
            Some(index) => index,
            None => self.create_stream(ctx, MediaType::Video, codec_id),
        }
    }

    /// Stores a sequence header. Returns an extradata-only packet when it
    /// replaces a different one.
    fn codec_config(ctx: &mut InputContext, index: usize, data: Vec<u8>) -> Option<Packet> {
        let stream = &mut ctx.streams[index];
        if stream.codecpar.extradata == data || data.is_empty() {
            return None;
        }
        fill_codec_parameters(&mut stream.codecpar, &data);
        if stream.codecpar.extradata.is_empty() {
            stream.codecpar.extradata = data;
            return None;
        }
        log::info!("flv: stream {index} codec configuration changed");
        stream.codecpar.extradata = data.clone();
        let mut packet = Packet::from_vec(Vec::new());
        packet.stream_index = index;
        packet.add_side_data(SideData::NewExtradata(data));
        Some(packet)
    }

    /// Skips `ModEx` blocks, applying timestamp offsets. Returns the packet
    /// type that follows.
    fn read_mod_ex(body: &mut IoReader, mut packet_type: u8, dts: &mut i64) -> Result<u8, FormatError> {
        while packet_type == PACKET_MOD_EX {
            let mut size = body.read_u8()? as usize + 1;
            if size == 256 {
                size = body.read_u16_be()? as usize + 1;
            }
            let data = body.read_bytes(size)?;
            let next = body.read_u8()?;
            if next >> 4 == MOD_EX_TIMESTAMP_OFFSET_NANO && size == 3 {
                let nanos = u32::from_be_bytes([0, data[0], data[1], data[2]]) as i64;
                *dts += nanos / 1_000_000;
            } else {
                log::debug!("flv: ModEx type {} ignored", next >> 4);
            }
            packet_type = next & 0x0F;
        }
        Ok(packet_type)
    }

    fn audio_tag(
        &mut self,
        ctx: &mut InputContext,
        tag: &TagHeader,
        body: Vec<u8>,
    ) -> Result<Option<Packet>, FormatError> {
        let len = body.len() as u64;
        let mut body = IoReader::from_bytes(body);
        let flags = body.read_u8()?;
        let mut dts = tag.timestamp;
        let format = flags >> 4;

        if format == AUDIO_EX_HEADER {
            let packet_type = Self::read_mod_ex(&mut body, flags & 0x0F, &mut dts)?;
            if packet_type == AUDIO_MULTITRACK {
                log::warn!("flv: multitrack audio is not supported, tag skipped");
                return Ok(None);
            }
            let fourcc = body.read_fourcc()?;
            let codec_id = match &fourcc.0 {
                b"mp4a" => CodecId::Aac,
                b"Opus" => CodecId::Opus,
                b".mp3" => CodecId::Mp3,
                b"fLaC" => CodecId::Flac,
                b"ac-3" => CodecId::Ac3,
                b"ec-3" => CodecId::Eac3,
                _ => {
                    log::warn!("flv: unknown audio FourCC {fourcc}");
                    CodecId::None
                }
            };
            let index = self.audio_stream(ctx, codec_id);
            if codec_id == CodecId::Opus && ctx.streams[index].codecpar.sample_rate == 0 {
                ctx.streams[index].codecpar.sample_rate = opus::SAMPLE_RATE;
            }
            let rest = (len - body.pos()) as usize;
            return Ok(match packet_type {
                PACKET_SEQUENCE_START => Self::codec_config(ctx, index, body.read_bytes(rest)?),
                PACKET_CODED_FRAMES => Some(Self::audio_packet(ctx, index, body.read_bytes(rest)?, dts)),
                PACKET_SEQUENCE_END => Some(end_packet(index, dts)),
                AUDIO_MULTICHANNEL_CONFIG => {
                    let _order = body.read_u8()?;
                    ctx.streams[index].codecpar.channels = body.read_u8()? as u32;
                    None
                }
                other => {
                    log::warn!("flv: audio packet type {other} ignored");
                    None
                }
            });
        }

        let bits = if flags & 0x02 != 0 { 16 } else { 8 };
        let (codec_id, rate) = match format {
            0 | 3 if bits == 8 => (CodecId::PcmU8, None),
            0 | 3 => (CodecId::PcmS16Le, None),
            2 => (CodecId::Mp3, None),
            14 => (CodecId::Mp3, Some(8000)),
            7 => (CodecId::PcmAlaw, Some(8000)),
            8 => (CodecId::PcmMulaw, Some(8000)),
            10 => (CodecId::Aac, None),
            other => {
                log::warn!("flv: audio codec {other} is not supported");
                (CodecId::None, None)
            }
        };
        let new = self.audio.is_none();
        let index = self.audio_stream(ctx, codec_id);
        if new {
            let par = &mut ctx.streams[index].codecpar;
            par.channels = if flags & 0x01 != 0 { 2 } else { 1 };
            par.sample_rate = rate.unwrap_or((44100 << ((flags >> 2) & 0x03)) >> 3);
            par.bits_per_coded_sample = bits;
            if codec_id.is_pcm() {
                par.block_align = par.channels * bits / 8;
            }
        }

        if ctx.streams[index].codecpar.codec_id == CodecId::Aac {
            let packet_type = body.read_u8()?;
            let rest = body.read_bytes((len - body.pos()) as usize)?;
            if packet_type == AAC_SEQUENCE_HEADER {
                return Ok(Self::codec_config(ctx, index, rest));
            }
            return Ok(Some(Self::audio_packet(ctx, index, rest, dts)));
        }
        let rest = body.read_bytes((len - body.pos()) as usize)?;
        Ok(Some(Self::audio_packet(ctx, index, rest, dts)))
    }

    fn audio_packet(ctx: &mut InputContext, index: usize, data: Vec<u8>, dts: i64) -> Packet {
        let par = &mut ctx.streams[index].codecpar;
        if par.codec_id == CodecId::Mp3 && par.bit_rate == 0 {
            if let Some(header) = mp3::FrameHeader::parse(&data) {
                par.sample_rate = header.sample_rate;
                par.channels = header.channels;
                par.bit_rate = header.bit_rate as i64 * 1000;
                par.frame_size = header.samples;
            }
        }
        let mut packet = Packet::from_vec(data);
        packet.stream_index = index;
        packet.pts = dts;
        packet.dts = dts;
        packet.flags |= PacketFlags::KEY;
        packet
    }

    fn video_tag(
        &mut self,
        ctx: &mut InputContext,
        tag: &TagHeader,
        body: Vec<u8>,
    ) -> Result<Option<Packet>, FormatError> {
        let len = body.len() as u64;
        let mut body = IoReader::from_bytes(body);
        let flags = body.read_u8()?;
        let mut dts = tag.timestamp;
        let frame_type = (flags >> 4) & 0x07;

        let (index, packet_type, has_cts) = if flags & 0x80 != 0 {
            let packet_type = Self::read_mod_ex(&mut body, flags & 0x0F, &mut dts)?;
            if frame_type == FRAME_COMMAND || packet_type == VIDEO_METADATA {
                log::trace!("flv: video command or metadata tag skipped");
                return Ok(None);
            }
            if packet_type == VIDEO_MULTITRACK {
                log::warn!("flv: multitrack video is not supported, tag skipped");
                return Ok(None);
            }
            let fourcc = body.read_fourcc()?;
            let codec_id = video_codec_from_fourcc(fourcc);
            let index = self.video_stream(ctx, codec_id);
            let has_cts =
                ctx.streams[index].codecpar.codec_id.is_nalu_based() && packet_type == PACKET_CODED_FRAMES;
            let packet_type = match packet_type {
                VIDEO_CODED_FRAMES_X => PACKET_CODED_FRAMES,
                PACKET_SEQUENCE_START | PACKET_CODED_FRAMES | PACKET_SEQUENCE_END => packet_type,
                other => {
                    log::warn!("flv: video packet type {other} ignored");
                    return Ok(None);
                }
            };
            (index, packet_type, has_cts)
        } else {
            if frame_type == FRAME_COMMAND {
                log::trace!("flv: video command frame skipped");
                return Ok(None);
            }
            let codec_id = match flags & 0x0F {
                7 => CodecId::H264,
                12 => CodecId::Hevc,
                other => {
                    log::warn!("flv: video codec {other} is not supported");
                    CodecId::None
                }
            };
            let index = self.video_stream(ctx, codec_id);
            if !ctx.streams[index].codecpar.codec_id.is_nalu_based() {
                (index, PACKET_CODED_FRAMES, false)
            } else {
                let packet_type = match body.read_u8()? {
                    AVC_SEQUENCE_HEADER => PACKET_SEQUENCE_START,
                    AVC_NALU => PACKET_CODED_FRAMES,
                    AVC_END_OF_SEQUENCE => PACKET_SEQUENCE_END,
                    other => {
                        log::warn!("flv: AVC packet type {other} ignored");
                        return Ok(None);
                    }
                };
                (index, packet_type, true)
            }
        };

        let cts = if has_cts {
            read_i24(&mut body)?
        } else {
            0
        };
        let rest = body.read_bytes((len - body.pos()) as usize)?;
        Ok(match packet_type {
            PACKET_SEQUENCE_START => Self::codec_config(ctx, index, rest),
            PACKET_SEQUENCE_END => Some(end_packet(index, dts)),
            _ => {
                let mut packet = Packet::from_vec(rest);
                packet.stream_index = index;
                packet.dts = dts;
                packet.pts = dts + cts;
                if frame_type == FRAME_KEY {
                    packet.flags |= PacketFlags::KEY;
                }
                if ctx.streams[index].codecpar.codec_id.is_nalu_based() {
                    packet.bit_format = Some(BitFormat::Avcc);
                }
                Some(packet)
            }
        })
    }

    fn script_tag(&mut self, ctx: &mut InputContext, body: Vec<u8>) -> Result<(), FormatError> {
        let end = body.len() as u64;
        let mut io = IoReader::from_bytes(body);
        let name = amf::read_value(&mut io, end)?;
        if name.as_str() != Some("onMetaData") {
            log::debug!("flv: script tag {name:?} ignored");
            return Ok(());
        }
        let value = amf::read_value(&mut io, end)?;
        if let AmfValue::Object(members) = &value {
            for (key, member) in members {
                if let Some(text) = member.to_metadata() {
                    ctx.metadata.insert(key.clone(), text);
                }
            }
        }
        self.meta = OnMetaData::parse(&value);
        if let Some(duration) = self.meta.duration_ms {
            ctx.duration = duration;
        }
        log::debug!(
            "flv: onMetaData duration {:?} ms, {} keyframes",
            self.meta.duration_ms,
            self.meta.keyframes.len()
        );
        Ok(())
    }

    /// Reads one tag. `None` for tags that carry no packet.
    fn read_tag(&mut self, ctx: &mut InputContext) -> Result<Option<Packet>, FormatError> {
        let pos = ctx.io.pos();
        let head = ctx.io.peek(TAG_HEADER_SIZE)?;
        if head.is_empty() {
            return Err(FormatError::Eof);
        }
        let Some(tag) = TagHeader::parse(&head).filter(TagHeader::plausible) else {
            if head.len() < TAG_HEADER_SIZE {
                log::debug!("flv: {} trailing bytes ignored", head.len());
                ctx.io.skip(head.len() as u64)?;
                return Err(FormatError::Eof);
            }
            log_or_err!(ctx, Level::Warn, FormatError::invalid(format!("flv: invalid tag at {pos}")));
            ctx.io.skip(1)?;
            if !self.resync(&mut ctx.io)? {
                return Err(FormatError::Eof);
            }
            return Ok(None);
        };
        ctx.io.skip(TAG_HEADER_SIZE as u64)?;
        let body = match ctx.io.read_bytes(tag.size) {
            Ok(body) => body,
            Err(e) => {
                log::warn!("flv: truncated tag at {pos}");
                return Err(e.into());
            }
        };
        match ctx.io.read_u32_be() {
            Ok(prev) if prev as usize != TAG_HEADER_SIZE + tag.size => {
                log_or_err!(
                    ctx,
                    Level::Warn,
                    FormatError::invalid(format!(
                        "flv: tag at {pos} is {} bytes, previous tag size says {prev}",
                        TAG_HEADER_SIZE + tag.size
                    ))
                );
            }
            Ok(_) => {}
            Err(IoError::Eof(_)) => log::debug!("flv: last previous tag size missing"),
            Err(e) => return Err(e.into()),
        }

        if pos == self.indexed_end {
            if body.first().is_some_and(|&b| self.is_seek_point(&tag, b)) {
                self.index.push((tag.timestamp, pos));
            }
            self.indexed_end = ctx.io.pos();
        }

        let packet = match tag.kind {
            TAG_AUDIO if tag.size > 0 => self.audio_tag(ctx, &tag, body)?,
            TAG_VIDEO if tag.size > 0 => self.video_tag(ctx, &tag, body)?,
            TAG_SCRIPT => {
                if let Err(e) = self.script_tag(ctx, body) {
                    log_or_err!(ctx, Level::Warn, FormatError::invalid(format!("flv: bad script tag at {pos}: {e}")));
                }
                None
            }
            _ => None,
        };
        Ok(packet.map(|mut p| {
            p.pos = pos as i64;
            p
        }))
    }

    /// Moves to the next position where a tag's previous-tag-size checks
    /// out. Returns `false` when the input ends first.
    fn resync(&self, io: &mut IoReader) -> Result<bool, FormatError> {
        let start = io.pos();
        while io.pos() - start < MAX_SYNC_SCAN {
            let window = io.peek(SYNC_WINDOW)?;
            let at_end = window.len() < SYNC_WINDOW;
            let found = (0..window.len()).find(|&i| {
                let Some(tag) = TagHeader::parse(&window[i..]).filter(TagHeader::plausible) else {
                    return false;
                };
                let prev_at = i + TAG_HEADER_SIZE + tag.size;
                match window.get(prev_at..prev_at + 4) {
                    Some(prev) => {
                        u32::from_be_bytes([prev[0], prev[1], prev[2], prev[3]]) as usize
                            == TAG_HEADER_SIZE + tag.size
                    }
                    None => !at_end,
                }
            });
            if let Some(skip) = found {
                log::debug!("flv: skipped {} bytes to resync", io.pos() + skip as u64 - start);
                io.skip(skip as u64)?;
                return Ok(true);
            }
            if at_end {
                return Ok(false);
            }
            io.skip((window.len() - TAG_HEADER_SIZE) as u64)?;
        }
        Err(FormatError::invalid(format!("flv: no tag within {MAX_SYNC_SCAN} bytes of {start}")))
    }

    /// Walks tag headers from the end of the index until `until` is passed
    /// or the input ends, then restores the read position.
    fn extend_index(&mut self, io: &mut IoReader, until: i64) -> Result<(), FormatError> {
        let saved = io.pos();
        let mut pos = self.indexed_end;
        loop {
            if self.index.last().is_some_and(|&(dts, _)| dts > until) {
                break;
            }
            io.seek(pos)?;
            let head = io.peek(TAG_HEADER_SIZE + 1)?;
            let Some(tag) = TagHeader::parse(&head).filter(TagHeader::plausible) else {
                break;
            };
            if io.size() > 0 && pos + tag.total_len() > io.size() + PREV_TAG_SIZE {
                break;
            }
            if head.get(TAG_HEADER_SIZE).is_some_and(|&b| self.is_seek_point(&tag, b)) {
                self.index.push((tag.timestamp, pos));
            }
            pos += tag.total_len();
        }
        self.indexed_end = pos;
        io.seek(saved)?;
        Ok(())
    }

    /// Creates streams from the first tags, then rewinds.
    fn scan_streams(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        let start = ctx.io.pos();
        // Some writers leave both flags clear.
        let unflagged = !self.has_audio && !self.has_video;
        let wants_audio = self.has_audio || unflagged;
        let wants_video = self.has_video || unflagged;
        for _ in 0..MAX_SCAN_TAGS {
            let ready = |index: Option<usize>, wanted: bool, ctx: &InputContext| match index {
                Some(i) => !needs_config(&ctx.streams[i].codecpar),
                None => !wanted,
            };
            if ready(self.audio, wants_audio, &*ctx) && ready(self.video, wants_video, &*ctx) {
                break;
            }
            match self.read_tag(ctx) {
                Ok(_) => {}
                Err(FormatError::Eof) => break,
                Err(e) => return Err(e),
            }
        }
        ctx.io.seek(start)?;
        Ok(())
    }
}

/// Codecs whose packets need a sequence header first.
fn needs_config(par: &CodecParameters) -> bool {
    matches!(par.codec_id, CodecId::Aac | CodecId::H264 | CodecId::Hevc | CodecId::Vvc)
        && par.extradata.is_empty()
}

fn video_codec_from_fourcc(fourcc: FourCC) -> CodecId {
    match &fourcc.0 {
        b"avc1" => CodecId::H264,
        b"hvc1" => CodecId::Hevc,
        b"vvc1" => CodecId::Vvc,
        _ => {
            log::warn!("flv: unsupported video FourCC {fourcc}");
            CodecId::None
        }
    }
}

fn end_packet(index: usize, dts: i64) -> Packet {
    let mut packet = Packet::from_vec(Vec::new());
    packet.stream_index = index;
    packet.pts = dts;
    packet.dts = dts;
    packet.flags |= PacketFlags::END;
    packet
}

/// Fills codec parameters from a sequence header.
fn fill_codec_parameters(par: &mut CodecParameters, data: &[u8]) {
    match par.codec_id {
        CodecId::Aac => match AudioSpecificConfig::parse(data) {
            Ok(config) => {
                par.sample_rate = config.sample_rate;
                par.channels = config.channels();
                par.profile = config.object_type as i32 - 1;
            }
            Err(e) => log::warn!("flv: {e}"),
        },
        CodecId::Opus if data.len() >= 19 && &data[..8] == b"OpusHead" => {
            par.channels = data[9] as u32;
        }
        CodecId::H264 => match h264::AvcConfig::parse(data) {
            Ok(config) => {
                par.profile = config.profile as i32;
                par.level = config.level as i32;
                if let Some(sps) = config.sps.first().and_then(|nalu| h264::Sps::parse(nalu).ok()) {
                    par.width = sps.width;
                    par.height = sps.height;
                    if let Some(rate) = sps.frame_rate() {
                        par.frame_rate = rate;
                    }
                    par.video_delay = sps.max_num_reorder_frames.unwrap_or(0);
                }
            }
            Err(e) => log::warn!("flv: {e}"),
        },
        CodecId::Hevc => match hevc::HevcConfig::parse(data) {
            Ok(config) => {
                par.profile = config.profile_idc as i32;
                par.level = config.level_idc as i32;
                let sps = config.units(hevc::NAL_SPS).next().and_then(|nalu| hevc::Sps::parse(nalu).ok());
                if let Some(sps) = sps {
                    par.width = sps.width;
                    par.height = sps.height;
                }
            }
            Err(e) => log::warn!("flv: {e}"),
        },
        _ => {}
    }
}

impl IFormat for IFlvFormat {
    fn name(&self) -> &'static str {
        "flv"
    }

    fn probe(buf: &[u8]) -> u8 {
        if buf.len() < HEADER_SIZE as usize || &buf[..3] != SIGNATURE || buf[3] == 0 {
            return 0;
        }
        let offset = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
        if offset < HEADER_SIZE || buf[4] & !(FLAG_AUDIO | FLAG_VIDEO) != 0 {
            return 0;
        }
        PROBE_SCORE_MAX
    }

    fn read_header(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        let signature = ctx.io.read_array::<3>()?;
        if &signature != SIGNATURE {
            return Err(FormatError::invalid("flv: missing FLV signature"));
        }
        let version = ctx.io.read_u8()?;
        let flags = ctx.io.read_u8()?;
        let offset = ctx.io.read_u32_be()?;
        if offset < HEADER_SIZE {
            return Err(FormatError::invalid(format!("flv: header size {offset}")));
        }
        self.has_audio = flags & FLAG_AUDIO != 0;
        self.has_video = flags & FLAG_VIDEO != 0;
        ctx.io.seek(offset as u64)?;
        let prev = ctx.io.read_u32_be()?;
        if prev != 0 {
            log::warn!("flv: first previous tag size is {prev}, expected 0");
        }
        log::debug!(
            "flv: version {version}, audio {}, video {}",
            self.has_audio,
            self.has_video
        );

        let head = ctx.io.peek(TAG_HEADER_SIZE)?;
        if TagHeader::parse(&head).is_some_and(|t| t.kind == TAG_SCRIPT && t.plausible()) {
            self.read_tag(ctx)?;
        }
        self.data_start = ctx.io.pos();
        self.indexed_end = self.data_start;
        self.scan_streams(ctx)?;
        Ok(())
    }

    fn read_packet(&mut self, ctx: &mut InputContext) -> Result<Packet, FormatError> {
        loop {
            if let Some(packet) = self.read_tag(ctx)? {
                return Ok(packet);
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
        let time_base = ctx.stream(stream_index)?.time_base;
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

        let target = rescale(timestamp, time_base, MILLI_TIME_BASE);
        let forward = flags.contains(SeekFlags::FORWARD);
        let scanned = self.index.last().is_some_and(|&(dts, _)| dts > target);
        if !scanned && !self.meta.keyframes.is_empty() {
            let keyframes = &self.meta.keyframes;
            let i = keyframes.partition_point(|&(t, _)| t <= target);
            let entry = if forward {
                keyframes.get(i).or(keyframes.last())
            } else {
                keyframes.get(i.saturating_sub(1))
            };
            if let Some(&(time, pos)) = entry {
                log::debug!("flv: seek to {target} ms via keyframe table, {time} ms at {pos}");
                ctx.io.seek(pos)?;
                let head = ctx.io.peek(TAG_HEADER_SIZE)?;
                if !TagHeader::parse(&head).is_some_and(|t| t.plausible()) && !self.resync(&mut ctx.io)? {
                    return Err(FormatError::Eof);
                }
                return Ok(());
            }
        }

        self.extend_index(&mut ctx.io, target)?;
        let i = self.index.partition_point(|&(dts, _)| dts <= target);
        let entry = if forward {
            self.index.get(i).or(self.index.last())
        } else {
            self.index.get(i.saturating_sub(1))
        };
        let pos = entry.map_or(self.data_start, |&(_, pos)| pos);
        log::debug!("flv: seek to {target} ms lands on tag at {pos}");
        ctx.io.seek(pos)?;
        Ok(())
    }

    fn max_analyze_duration_ms(&self) -> Option<u64> {
        Some(2000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::h264::tests::{PPS, SPS_320X240};
    use crate::formats::flv::amf::{object_end, write_key, write_number, write_number_array, write_string};

    const FRAMES: u32 = 10;
    const CTS: u32 = 80;

    fn tag(kind: u8, timestamp: u32, body: &[u8]) -> Vec<u8> {
        let size = body.len() as u32;
        let mut out = vec![kind];
        out.extend_from_slice(&size.to_be_bytes()[1..]);
        out.extend_from_slice(&timestamp.to_be_bytes()[1..]);
        out.push((timestamp >> 24) as u8);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(body);
        out.extend_from_slice(&(TAG_HEADER_SIZE as u32 + size).to_be_bytes());
        out
    }

    fn avc_config() -> Vec<u8> {
        h264::AvcConfig::from_param_sets(vec![SPS_320X240.to_vec()], vec![PPS.to_vec()], Vec::new())
            .map(|c| c.to_bytes())
            .unwrap_or_default()
    }

    fn video_frame(i: u32) -> Vec<u8> {
        let key = if i % 5 == 0 { 0x17 } else { 0x27 };
        let mut body = vec![key, AVC_NALU];
        body.extend_from_slice(&CTS.to_be_bytes()[1..]);
        body.extend_from_slice(&[0, 0, 0, 2, 0x65, i as u8]);
        tag(TAG_VIDEO, i * 40, &body)
    }

    fn audio_frame(i: u32) -> Vec<u8> {
        tag(TAG_AUDIO, i * 40 + 10, &[0xAF, 1, 0x21, i as u8])
    }

    /// Sequence headers then interleaved frames. The second value holds the
    /// indices of the keyframe tags.
    fn stream_tags() -> (Vec<Vec<u8>>, Vec<usize>) {
        let mut sequence_header = vec![0x17, AVC_SEQUENCE_HEADER, 0, 0, 0];
        sequence_header.extend_from_slice(&avc_config());
        let mut tags = vec![
            tag(TAG_VIDEO, 0, &sequence_header),
            tag(TAG_AUDIO, 0, &[0xAF, AAC_SEQUENCE_HEADER, 0x12, 0x10]),
        ];
        let mut keys = Vec::new();
        for i in 0..FRAMES {
            if i % 5 == 0 {
                keys.push(tags.len());
            }
            tags.push(video_frame(i));
            tags.push(audio_frame(i));
        }
        (tags, keys)
    }

    fn on_meta_data(positions: Option<&[f64]>) -> Vec<u8> {
        let mut body = Vec::new();
        write_string(&mut body, "onMetaData");
        body.extend_from_slice(&[8, 0, 0, 0, 5]);
        write_key(&mut body, "duration");
        write_number(&mut body, FRAMES as f64 * 0.04);
        write_key(&mut body, "width");
        write_number(&mut body, 320.0);
        write_key(&mut body, "height");
        write_number(&mut body, 240.0);
        write_key(&mut body, "encoder");
        write_string(&mut body, "avmux test");
        if let Some(positions) = positions {
            write_key(&mut body, "keyframes");
            body.push(3);
            write_key(&mut body, "times");
            write_number_array(&mut body, &[0.0, 0.2]);
            write_key(&mut body, "filepositions");
            write_number_array(&mut body, positions);
            object_end(&mut body);
        }
        object_end(&mut body);
        tag(TAG_SCRIPT, 0, &body)
    }

    fn header() -> Vec<u8> {
        vec![b'F', b'L', b'V', 1, FLAG_AUDIO | FLAG_VIDEO, 0, 0, 0, 9, 0, 0, 0, 0]
    }

    /// A complete file and the byte positions of its keyframe tags.
    fn sample(keyframes: bool) -> (Vec<u8>, Vec<u64>) {
        let (tags, keys) = stream_tags();
        let placeholder = on_meta_data(keyframes.then_some(&[0.0, 0.0][..]));
        let mut pos = (header().len() + placeholder.len()) as u64;
        let mut key_positions = Vec::new();
        for (i, tag) in tags.iter().enumerate() {
            if keys.contains(&i) {
                key_positions.push(pos);
            }
            pos += tag.len() as u64;
        }
        let positions: Vec<f64> = key_positions.iter().map(|&p| p as f64).collect();
        let mut out = header();
        out.extend_from_slice(&on_meta_data(keyframes.then_some(&positions[..])));
        out.extend(tags.into_iter().flatten());
        (out, key_positions)
    }

    fn open(data: Vec<u8>) -> anyhow::Result<(IFlvFormat, InputContext)> {
        let mut ctx = InputContext::new(IoReader::from_bytes(data));
        let mut format = IFlvFormat::default();
        format.read_header(&mut ctx)?;
        Ok((format, ctx))
    }

    fn read_all(format: &mut IFlvFormat, ctx: &mut InputContext) -> anyhow::Result<Vec<Packet>> {
        let mut packets = Vec::new();
        loop {
            match format.read_packet(ctx) {
                Ok(packet) => packets.push(packet),
                Err(e) if e.is_eof() => return Ok(packets),
                Err(e) => return Err(e.into()),
            }
        }
    }

    #[test]
    fn probe() {
        let (data, _) = sample(false);
        assert_eq!(IFlvFormat::probe(&data), PROBE_SCORE_MAX);
        let mut bad_version = data.clone();
        bad_version[3] = 0;
        assert_eq!(IFlvFormat::probe(&bad_version), 0);
        let mut reserved = data;
        reserved[4] |= 0x20;
        assert_eq!(IFlvFormat::probe(&reserved), 0);
        assert_eq!(IFlvFormat::probe(b"FLV"), 0);
    }

    #[test]
    fn header_streams_and_metadata() -> anyhow::Result<()> {
        let (format, ctx) = open(sample(false).0)?;
        assert_eq!(ctx.streams.len(), 2);
        assert_eq!(ctx.duration, 400);
        assert_eq!(ctx.metadata.get("encoder").map(String::as_str), Some("avmux test"));
        assert_eq!(ctx.metadata.get("width").map(String::as_str), Some("320"));

        let video = &ctx.streams[0];
        assert_eq!(video.codecpar.codec_id, CodecId::H264);
        assert_eq!((video.codecpar.width, video.codecpar.height), (320, 240));
        assert_eq!(video.codecpar.extradata, avc_config());
        assert_eq!(video.codecpar.bit_format, Some(BitFormat::Avcc));
        assert_eq!(video.time_base, MILLI_TIME_BASE);
        assert_eq!(video.duration, 400);

        let audio = &ctx.streams[1];
        assert_eq!(audio.codecpar.codec_id, CodecId::Aac);
        assert_eq!((audio.codecpar.sample_rate, audio.codecpar.channels), (44100, 2));
        assert_eq!(audio.codecpar.extradata, vec![0x12, 0x10]);

        assert_eq!(ctx.io.pos(), format.data_start);
        Ok(())
    }

    #[test]
    fn packets() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(sample(false).0)?;
        let packets = read_all(&mut format, &mut ctx)?;
        assert_eq!(packets.len(), 2 * FRAMES as usize);

        let video: Vec<_> = packets.iter().filter(|p| p.stream_index == 0).collect();
        assert_eq!(video.len(), FRAMES as usize);
        assert_eq!((video[1].dts, video[1].pts), (40, 40 + CTS as i64));
        assert_eq!(video[1].data(), &[0, 0, 0, 2, 0x65, 1]);
        assert_eq!(video[1].bit_format, Some(BitFormat::Avcc));
        let keys: Vec<i64> = video.iter().filter(|p| p.is_key()).map(|p| p.dts).collect();
        assert_eq!(keys, vec![0, 200]);

        let audio: Vec<_> = packets.iter().filter(|p| p.stream_index == 1).collect();
        assert_eq!(audio[2].pts, 90);
        assert_eq!(audio[2].data(), &[0x21, 2]);
        assert!(audio.iter().all(|p| p.is_key()));
        Ok(())
    }

    #[test]
    fn config_change_emits_new_extradata() -> anyhow::Result<()> {
        let (mut data, _) = sample(false);
        data.extend_from_slice(&tag(TAG_AUDIO, 420, &[0xAF, AAC_SEQUENCE_HEADER, 0x11, 0x90]));
        data.extend_from_slice(&tag(TAG_AUDIO, 430, &[0xAF, 1, 0x21, 0x42]));
        let (mut format, mut ctx) = open(data)?;
        let packets = read_all(&mut format, &mut ctx)?;

        let change = &packets[packets.len() - 2];
        assert!(change.is_empty());
        assert_eq!(change.stream_index, 1);
        assert_eq!(change.new_extradata(), Some(&[0x11, 0x90][..]));
        assert_eq!(ctx.streams[1].codecpar.sample_rate, 48000);
        assert_eq!(packets[packets.len() - 1].data(), &[0x21, 0x42]);
        Ok(())
    }

    #[test]
    fn previous_tag_size_mismatch() -> anyhow::Result<()> {
        let (mut data, _) = sample(false);
        let last = data.len() - 1;
        data[last] ^= 0x01;

        let (mut format, mut ctx) = open(data.clone())?;
        assert_eq!(read_all(&mut format, &mut ctx)?.len(), 2 * FRAMES as usize);

        let (mut format, mut ctx) = open(data)?;
        ctx.fail_level = Level::Warn;
        assert!(read_all(&mut format, &mut ctx).is_err());
        Ok(())
    }

    #[test]
    fn garbage_between_tags_is_skipped() -> anyhow::Result<()> {
        let (mut data, _) = sample(false);
        data.extend_from_slice(&[0xFF; 7]);
        data.extend_from_slice(&audio_frame(FRAMES));
        let (mut format, mut ctx) = open(data)?;
        let packets = read_all(&mut format, &mut ctx)?;
        assert_eq!(packets.len(), 2 * FRAMES as usize + 1);
        assert_eq!(packets.last().map(|p| p.pts), Some(FRAMES as i64 * 40 + 10));
        Ok(())
    }

    #[test]
    fn seek_with_keyframe_table() -> anyhow::Result<()> {
        let (data, keys) = sample(true);
        let (mut format, mut ctx) = open(data)?;
        assert_eq!(format.meta.keyframes, vec![(0, keys[0]), (200, keys[1])]);

        format.seek(&mut ctx, 0, 210, SeekFlags::BACKWARD)?;
        assert_eq!(ctx.io.pos(), keys[1]);
        let packet = format.read_packet(&mut ctx)?;
        assert_eq!((packet.dts, packet.pts), (200, 280));
        assert!(packet.is_key());

        format.seek(&mut ctx, 0, 10, SeekFlags::FORWARD)?;
        assert_eq!(ctx.io.pos(), keys[1]);
        format.seek(&mut ctx, 0, 150, SeekFlags::BACKWARD)?;
        assert_eq!(ctx.io.pos(), keys[0]);
        Ok(())
    }

    #[test]
    fn seek_by_scanning_tags() -> anyhow::Result<()> {
        let (data, keys) = sample(false);
        let (mut format, mut ctx) = open(data)?;
        assert!(format.meta.keyframes.is_empty());

        format.seek(&mut ctx, 1, 330, SeekFlags::BACKWARD)?;
        assert_eq!(ctx.io.pos(), keys[1]);
        assert_eq!(format.read_packet(&mut ctx)?.dts, 200);

        format.seek(&mut ctx, 0, 10, SeekFlags::FORWARD)?;
        assert_eq!(ctx.io.pos(), keys[1]);
        format.seek(&mut ctx, 0, 0, SeekFlags::BACKWARD)?;
        let packet = format.read_packet(&mut ctx)?;
        assert_eq!((packet.stream_index, packet.dts), (0, 0));
        Ok(())
    }

    #[test]
    fn enhanced_video_tags() -> anyhow::Result<()> {
        let mut start = vec![0x80 | (FRAME_KEY << 4) | PACKET_SEQUENCE_START];
        start.extend_from_slice(b"avc1");
        start.extend_from_slice(&avc_config());
        let mut coded_x = vec![0x80 | (FRAME_KEY << 4) | VIDEO_CODED_FRAMES_X];
        coded_x.extend_from_slice(b"avc1");
        coded_x.extend_from_slice(&[0, 0, 0, 1, 0x65]);
        let mut coded = vec![0x80 | (2 << 4) | PACKET_CODED_FRAMES];
        coded.extend_from_slice(b"avc1");
        coded.extend_from_slice(&[0, 0, 40]);
        coded.extend_from_slice(&[0, 0, 0, 1, 0x41]);

        let mut data = vec![b'F', b'L', b'V', 1, FLAG_VIDEO, 0, 0, 0, 9, 0, 0, 0, 0];
        data.extend_from_slice(&tag(TAG_VIDEO, 0, &start));
        data.extend_from_slice(&tag(TAG_VIDEO, 0, &coded_x));
        data.extend_from_slice(&tag(TAG_VIDEO, 40, &coded));
        let (mut format, mut ctx) = open(data)?;
        assert_eq!(ctx.streams.len(), 1);
        assert_eq!(ctx.streams[0].codecpar.codec_id, CodecId::H264);
        assert_eq!(ctx.streams[0].codecpar.width, 320);

        let packets = read_all(&mut format, &mut ctx)?;
        assert_eq!(packets.len(), 2);
        assert_eq!((packets[0].dts, packets[0].pts), (0, 0));
        assert!(packets[0].is_key());
        assert_eq!((packets[1].dts, packets[1].pts), (40, 80));
        assert!(!packets[1].is_key());
        Ok(())
    }
}
