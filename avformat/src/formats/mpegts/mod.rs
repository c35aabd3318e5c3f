//! MPEG transport stream demuxer. The muxer lives in [`mux`].
//!
//! Handles 188, 192 (M2TS) and 204 byte packets. The first program listed in
//! the PAT is demuxed; PMT updates add streams on the fly. Elementary streams
//! are reassembled from PES packets and timestamps are kept in the 90 kHz
//! clock, unwrapped across the 33-bit rollover.

use std::collections::{BTreeMap, HashMap, VecDeque};

use log::Level;

use super::{IFormat, InputContext, PROBE_SCORE_MAX, PROBE_SCORE_PARTIAL, SeekFlags};
use crate::codecs::nalu::{StartCodeMode, join_nalu_by_start_code, split_nalu_by_start_code};
use crate::codecs::{NalCodec, NalKind, h264, hevc, mp3, opus};
use crate::io::IoReader;
use crate::log_or_err;
use crate::process::bsf::{Adts2Raw, BitstreamFilter};
use crate::process::timestamp::{
    PROBE_PACKET_MAX_BUF, TS_FEC_PACKET_SIZE, TS_PACKET_SIZE, guess_packet_size,
};
use crate::structs::packet::{BitFormat, Packet, PacketFlags, SideDataKind, SideData};
use crate::structs::rational::{MPEGTS_TIME_BASE, NOPTS_VALUE, Rational, rescale};
use crate::structs::stream::{CodecId, CodecParameters, MediaType, Stream};
use crate::utils::errors::{FormatError, IoError};

pub mod mux;
pub mod packet;
pub mod psi;

pub use mux::OMpegtsFormat;

use packet::{PID_NULL, PID_PAT, PesHeader, SYNC_BYTE, TsPacket, sync_offset, unwrap_timestamp};
use psi::{PmtStream, SectionAssembler, parse_pat, parse_pmt, section_crc_ok};

/// Bytes scanned for a sync byte before giving up.
const MAX_RESYNC_SIZE: usize = 65536;
/// Consecutive sync bytes required to accept a resync position.
const RESYNC_PACKETS: usize = 3;
/// Bytes read while looking for the PAT and PMT.
const MAX_HEADER_SCAN: u64 = 8 * 1024 * 1024;
/// Bytes scanned for a timestamp from one bisection point.
const MAX_SEEK_SCAN: u64 = 1024 * 1024;

/// Reassembly state of one elementary stream.
#[derive(Debug)]
pub(crate) struct PesStream {
    pub(crate) index: usize,
    codec_id: CodecId,
    buffer: Vec<u8>,
    /// Byte offset of the packet that started `buffer`.
    pub(crate) pos: u64,
    pub(crate) random_access: bool,
    /// Full PES length once known, 0 when unbounded.
    expected: usize,
    started: bool,
    continuity: Option<u8>,
    adts: Option<Adts2Raw>,
    pub(crate) last_dts: i64,
}

/// Stream descriptor for an elementary stream of `codec_id` in the 90 kHz
/// clock.
pub(crate) fn es_stream(id: u32, codec_id: CodecId) -> Stream {
    let mut stream = Stream::new(0, MPEGTS_TIME_BASE);
    stream.id = id;
    stream.codecpar = match codec_id.media_type() {
        MediaType::Video => CodecParameters::video(codec_id, 0, 0),
        _ => CodecParameters::audio(codec_id, 0, 0),
    };
    if codec_id.is_nalu_based() {
        stream.codecpar.bit_format = Some(BitFormat::AnnexB);
    }
    stream
}

impl PesStream {
    /// Adds `stream` to the context and returns its reassembly state.
    pub(crate) fn attach(ctx: &mut InputContext, stream: Stream) -> Result<Self, FormatError> {
        let codec_id = stream.codecpar.codec_id;
        let adts = if codec_id == CodecId::Aac {
            let mut filter = Adts2Raw::default();
            filter.init(&stream.codecpar, stream.time_base)?;
            Some(filter)
        } else {
            None
        };
        let index = ctx.add_stream(stream);
        Ok(Self {
            index,
            codec_id,
            buffer: Vec::new(),
            pos: 0,
            random_access: false,
            expected: 0,
            started: false,
            continuity: None,
            adts,
            last_dts: NOPTS_VALUE,
        })
    }

    pub(crate) fn reset(&mut self) {
        self.buffer.clear();
        self.started = false;
        self.expected = 0;
        self.continuity = None;
        if let Some(adts) = &mut self.adts {
            adts.reset();
        }
    }

    /// Turns the buffered PES packet into output packets.
    fn finish(&mut self, ctx: &mut InputContext, queue: &mut VecDeque<Packet>) -> Result<(), FormatError> {
        let data = std::mem::take(&mut self.buffer);
        self.started = false;
        self.expected = 0;

        let header = match PesHeader::parse(&data) {
            Ok(header) => header,
            Err(e) => {
                log_or_err!(ctx, Level::Warn, e);
                return Ok(());
            }
        };
        let mut end = data.len();
        if header.packet_length > 0 {
            if header.packet_length > data.len() {
                log_or_err!(
                    ctx,
                    Level::Warn,
                    FormatError::invalid(format!(
                        "mpegts: PES of stream {} truncated to {} of {} bytes",
                        self.index,
                        data.len(),
                        header.packet_length
                    ))
                );
            } else {
                end = header.packet_length;
            }
        }
        if header.header_len >= end {
            return Ok(());
        }
        self.emit(ctx, queue, header.pts, header.dts, &data[header.header_len..end])
    }

    /// Queues the packets of one access unit's `payload`, taking position
    /// and random access from `self`.
    pub(crate) fn emit(
        &mut self,
        ctx: &mut InputContext,
        queue: &mut VecDeque<Packet>,
        pts: i64,
        dts: i64,
        payload: &[u8],
    ) -> Result<(), FormatError> {
        let pts = unwrap_timestamp(self.last_dts, pts);
        let dts = if dts == NOPTS_VALUE {
            pts
        } else {
            unwrap_timestamp(self.last_dts, dts)
        };
        if dts != NOPTS_VALUE {
            self.last_dts = dts;
        }

        let mut packet = Packet::from_vec(payload.to_vec());
        packet.stream_index = self.index;
        packet.pts = pts;
        packet.dts = dts;
        packet.pos = self.pos as i64;

        let stream = &mut ctx.streams[self.index];
        if self.random_access || stream.media_type() == MediaType::Audio {
            packet.flags |= PacketFlags::KEY;
        }

        match self.codec_id {
            CodecId::H264 | CodecId::Hevc | CodecId::Vvc => {
                annexb_packet(stream, &mut packet, payload)
            }
            CodecId::Aac => {
                if let Some(adts) = &mut self.adts {
                    return split_adts(adts, stream, packet, queue);
                }
            }
            CodecId::Opus => return split_opus(stream, &packet, payload, queue),
            CodecId::Mp3 => {
                if let Some(header) = mp3::FrameHeader::parse(payload) {
                    let par = &mut stream.codecpar;
                    if par.sample_rate == 0 {
                        par.sample_rate = header.sample_rate;
                        par.channels = header.channels;
                        par.frame_size = header.samples;
                        par.bit_rate = header.bit_rate as i64 * 1000;
                    }
                }
            }
            CodecId::Ac3 | CodecId::Eac3 => {
                if stream.codecpar.sample_rate == 0 {
                    if let Some(rate) = ac3_sample_rate(payload) {
                        stream.codecpar.sample_rate = rate;
                    }
                }
            }
            CodecId::Mpeg2Video => {
                if mpeg_video_keyframe(payload) {
                    packet.flags |= PacketFlags::KEY;
                }
            }
            _ => {}
        }
        queue.push_back(packet);
        Ok(())
    }
}

/// Whether an MPEG-1/2 video payload starts a GOP or carries an I picture.
fn mpeg_video_keyframe(payload: &[u8]) -> bool {
    let mut i = 0;
    while i + 5 < payload.len() {
        if payload[i..i + 3] == [0, 0, 1] {
            match payload[i + 3] {
                0xB3 | 0xB8 => return true,
                // picture_coding_type sits in bits 3..6 of the second byte
                0x00 => return (payload[i + 5] >> 3) & 0x07 == 1,
                _ => {}
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    false
}

/// Tags a NAL unit packet and fills in the parameter sets and picture size
/// the first time they are seen.
fn annexb_packet(stream: &mut Stream, packet: &mut Packet, payload: &[u8]) {
    packet.bit_format = Some(BitFormat::AnnexB);
    let Some(codec) = NalCodec::from_codec_id(stream.codecpar.codec_id) else {
        return;
    };
    let nalus = split_nalu_by_start_code(payload);
    if nalus.iter().any(|nalu| codec.kind(nalu) == NalKind::Irap) {
        packet.flags |= PacketFlags::KEY;
    }
    if !stream.codecpar.extradata.is_empty() {
        return;
    }
    let sets = codec.collect_param_sets(&nalus);
    if sets.sps.is_empty() || sets.pps.is_empty() {
        return;
    }
    let units: Vec<&Vec<u8>> = sets.iter().collect();
    let par = &mut stream.codecpar;
    par.extradata = join_nalu_by_start_code(&units, StartCodeMode::Long);
    match codec {
        NalCodec::H264 => match h264::Sps::parse(&sets.sps[0]) {
            Ok(sps) => {
                par.width = sps.width;
                par.height = sps.height;
                par.profile = sps.profile_idc as i32;
                par.level = sps.level_idc as i32;
                if let Some(rate) = sps.frame_rate() {
                    par.frame_rate = rate;
                }
                if let Some(delay) = sps.max_num_reorder_frames {
                    par.video_delay = delay;
                }
            }
            Err(e) => log::warn!("mpegts: stream {}: {e}", stream.index),
        },
        NalCodec::Hevc => match hevc::Sps::parse(&sets.sps[0]) {
            Ok(sps) => {
                par.width = sps.width;
                par.height = sps.height;
                par.profile = sps.profile_idc as i32;
                par.level = sps.level_idc as i32;
            }
            Err(e) => log::warn!("mpegts: stream {}: {e}", stream.index),
        },
        NalCodec::Vvc => {}
    }
    log::debug!(
        "mpegts: stream {} parameter sets found, {}x{}",
        stream.index,
        par.width,
        par.height
    );
}

/// Runs an ADTS PES payload through the splitter.
fn split_adts(
    adts: &mut Adts2Raw,
    stream: &mut Stream,
    packet: Packet,
    queue: &mut VecDeque<Packet>,
) -> Result<(), FormatError> {
    if let Err(e) = adts.send_packet(packet) {
        log::warn!("mpegts: stream {}: {e}", stream.index);
        return Ok(());
    }
    while let Ok(mut frame) = adts.receive_packet() {
        if stream.codecpar.extradata.is_empty() {
            if let Some(SideData::NewExtradata(extradata)) =
                frame.take_side_data(SideDataKind::NewExtradata)
            {
                let out = adts.codecpar_out();
                stream.codecpar.extradata = extradata;
                stream.codecpar.sample_rate = out.sample_rate;
                stream.codecpar.channels = out.channels;
                stream.codecpar.profile = out.profile;
                stream.codecpar.frame_size = 1024;
            }
        }
        queue.push_back(frame);
    }
    Ok(())
}

/// Splits an Opus PES payload at its control headers.
fn split_opus(
    stream: &Stream,
    props: &Packet,
    mut payload: &[u8],
    queue: &mut VecDeque<Packet>,
) -> Result<(), FormatError> {
    let mut pts = props.pts;
    while payload.len() >= 2 {
        if u16::from_be_bytes([payload[0], payload[1]]) >> 5 != 0x3FF {
            log::warn!("mpegts: stream {}: bad opus control header", stream.index);
            break;
        }
        let start_trim = payload[1] & 0x10 != 0;
        let end_trim = payload[1] & 0x08 != 0;
        let extension = payload[1] & 0x04 != 0;
        let mut pos = 2;
        let mut size = 0usize;
        loop {
            let Some(&b) = payload.get(pos) else {
                return Ok(());
            };
            pos += 1;
            size += b as usize;
            if b != 0xFF {
                break;
            }
        }
        pos += 2 * (start_trim as usize + end_trim as usize);
        if extension {
            pos += 1 + payload.get(pos).copied().unwrap_or(0) as usize;
        }
        if pos + size > payload.len() {
            log::warn!(
                "mpegts: stream {}: opus frame of {size} bytes overruns the PES",
                stream.index
            );
            break;
        }

        let data = &payload[pos..pos + size];
        let mut packet = Packet::from_vec(data.to_vec());
        packet.copy_props(props);
        packet.pts = pts;
        packet.dts = pts;
        if let Some(samples) = opus::packet_samples(data) {
            packet.duration = rescale(
                samples as i64,
                Rational::new(1, opus::SAMPLE_RATE as i32),
                MPEGTS_TIME_BASE,
            );
            if pts != NOPTS_VALUE {
                pts += packet.duration;
            }
        }
        queue.push_back(packet);
        payload = &payload[pos + size..];
    }
    Ok(())
}

fn ac3_sample_rate(data: &[u8]) -> Option<u32> {
    const RATES: [u32; 3] = [48000, 44100, 32000];
    if data.len() < 6 || data[..2] != [0x0B, 0x77] {
        return None;
    }
    let bsid = data[5] >> 3;
    if bsid > 10 {
        // E-AC-3: fscod sits in the same byte, fscod 3 selects the reduced rates.
        let fscod = (data[4] >> 6) as usize;
        return if fscod == 3 {
            RATES.get(((data[4] >> 4) & 3) as usize).map(|r| r / 2)
        } else {
            Some(RATES[fscod])
        };
    }
    RATES.get((data[4] >> 6) as usize).copied()
}

#[derive(Debug)]
pub struct IMpegtsFormat {
    packet_size: usize,
    first_packet_pos: u64,
    program: Option<u16>,
    pmt_pid: Option<u16>,
    pmt_version: Option<u8>,
    sections: HashMap<u16, SectionAssembler>,
    streams: BTreeMap<u16, PesStream>,
    queue: VecDeque<Packet>,
    eof: bool,
}

impl Default for IMpegtsFormat {
    fn default() -> Self {
        Self {
            packet_size: TS_PACKET_SIZE,
            first_packet_pos: 0,
            program: None,
            pmt_pid: None,
            pmt_version: None,
            sections: HashMap::new(),
            streams: BTreeMap::new(),
            queue: VecDeque::new(),
            eof: false,
        }
    }
}

impl IMpegtsFormat {
    /// Moves to the next position with `RESYNC_PACKETS` sync bytes in a row.
    /// Returns `false` when the input ends first.
    fn resync(&self, io: &mut IoReader) -> Result<bool, FormatError> {
        let size = self.packet_size;
        let offset = sync_offset(size);
        let window = io.peek(MAX_RESYNC_SIZE + size * RESYNC_PACKETS)?;
        let found = (0..window.len().min(MAX_RESYNC_SIZE)).find(|&i| {
            window.get(i + offset) == Some(&SYNC_BYTE)
                && (1..RESYNC_PACKETS)
                    .all(|k| window.get(i + offset + k * size).is_none_or(|&b| b == SYNC_BYTE))
        });
        match found {
            Some(skip) => {
                if skip > 0 {
                    log::warn!("mpegts: skipped {skip} bytes to resync at {}", io.pos() + skip as u64);
                }
                io.skip(skip as u64)?;
                Ok(true)
            }
            None if window.len() < MAX_RESYNC_SIZE => Ok(false),
            None => Err(FormatError::invalid(format!(
                "mpegts: no sync byte within {MAX_RESYNC_SIZE} bytes of {}",
                io.pos()
            ))),
        }
    }

    /// Next packet with its byte offset, `None` at the end of input.
    fn read_raw(&self, io: &mut IoReader) -> Result<Option<(u64, [u8; TS_PACKET_SIZE])>, FormatError> {
        let offset = sync_offset(self.packet_size);
        let mut raw = [0u8; TS_FEC_PACKET_SIZE];
        loop {
            let pos = io.pos();
            match io.read_exact(&mut raw[..self.packet_size]) {
                Ok(()) => {}
                Err(IoError::Eof(_)) => {
                    if io.pos() > pos {
                        log::debug!("mpegts: {} trailing bytes ignored", io.pos() - pos);
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
            if raw[offset] != SYNC_BYTE {
                io.seek(pos + 1)?;
                if !self.resync(io)? {
                    return Ok(None);
                }
                continue;
            }
            let mut packet = [0u8; TS_PACKET_SIZE];
            packet.copy_from_slice(&raw[offset..offset + TS_PACKET_SIZE]);
            return Ok(Some((pos, packet)));
        }
    }

    /// Feeds PAT and PMT packets to their parsers. Returns whether the packet
    /// was on a PSI PID.
    fn handle_psi(&mut self, ctx: &mut InputContext, packet: &TsPacket) -> Result<bool, FormatError> {
        let pid = packet.pid;
        if pid != PID_PAT && Some(pid) != self.pmt_pid {
            return Ok(false);
        }
        let sections = self
            .sections
            .entry(pid)
            .or_default()
            .push(packet.payload_unit_start, packet.payload);
        for section in sections {
            if !section_crc_ok(&section) {
                log_or_err!(
                    ctx,
                    Level::Warn,
                    FormatError::invalid(format!("mpegts: CRC mismatch in section on pid {pid:#x}"))
                );
                continue;
            }
            if pid == PID_PAT {
                self.on_pat(ctx, &section)?;
            } else {
                self.on_pmt(ctx, &section)?;
            }
        }
        Ok(true)
    }

    fn on_pat(&mut self, ctx: &mut InputContext, section: &[u8]) -> Result<(), FormatError> {
        let programs = match parse_pat(section) {
            Ok(programs) => programs,
            Err(e) => {
                log_or_err!(ctx, Level::Warn, e);
                return Ok(());
            }
        };
        let selected = programs
            .iter()
            .find(|(program, _)| Some(*program) == self.program)
            .or(programs.first());
        let Some(&(program, pmt_pid)) = selected else {
            return Ok(());
        };
        if self.program != Some(program) || self.pmt_pid != Some(pmt_pid) {
            log::debug!("mpegts: program {program}, PMT on pid {pmt_pid:#x}");
            if programs.len() > 1 && self.program.is_none() {
                log::info!("mpegts: {} programs, demuxing program {program}", programs.len());
            }
            self.program = Some(program);
            self.pmt_pid = Some(pmt_pid);
            self.pmt_version = None;
        }
        Ok(())
    }

    fn on_pmt(&mut self, ctx: &mut InputContext, section: &[u8]) -> Result<(), FormatError> {
        let pmt = match parse_pmt(section) {
            Ok(pmt) => pmt,
            Err(e) => {
                log_or_err!(ctx, Level::Warn, e);
                return Ok(());
            }
        };
        if Some(pmt.program) != self.program || Some(pmt.version) == self.pmt_version {
            return Ok(());
        }
        log::debug!(
            "mpegts: PMT version {} with {} streams, PCR on pid {:#x}",
            pmt.version,
            pmt.streams.len(),
            pmt.pcr_pid
        );
        self.pmt_version = Some(pmt.version);

        for es in &pmt.streams {
            if self.streams.contains_key(&es.pid) {
                continue;
            }
            let codec_id = es.codec_id(pmt.registration());
            if codec_id == CodecId::None {
                log::info!(
                    "mpegts: pid {:#x} with stream type {:#04x} not supported",
                    es.pid,
                    es.stream_type
                );
                continue;
            }
            self.add_stream(ctx, es, codec_id)?;
        }
        Ok(())
    }

    fn add_stream(&mut self, ctx: &mut InputContext, es: &PmtStream, codec_id: CodecId) -> Result<(), FormatError> {
        let mut stream = es_stream(es.pid as u32, codec_id);
        if codec_id == CodecId::Opus {
            let channels = es.opus_channels().unwrap_or(2);
            stream.codecpar.sample_rate = opus::SAMPLE_RATE;
            stream.codecpar.channels = channels;
            stream.codecpar.extradata = opus::opus_head(channels, opus::DEFAULT_PRE_SKIP);
        }
        if let Some(language) = es.language() {
            stream.metadata.insert("language".into(), language);
        }

        let es_state = PesStream::attach(ctx, stream)?;
        log::debug!("mpegts: stream {} on pid {:#x}: {codec_id}", es_state.index, es.pid);
        self.streams.insert(es.pid, es_state);
        Ok(())
    }

    fn handle_pes(&mut self, ctx: &mut InputContext, packet: &TsPacket, pos: u64) -> Result<(), FormatError> {
        let Some(stream) = self.streams.get_mut(&packet.pid) else {
            return Ok(());
        };
        if packet.scrambling != 0 {
            log::trace!("mpegts: scrambled packet on pid {:#x} dropped", packet.pid);
            return Ok(());
        }
        if !packet.has_payload {
            return Ok(());
        }

        if let Some(last) = stream.continuity {
            if packet.continuity == last && !packet.payload_unit_start {
                log::trace!("mpegts: duplicate packet on pid {:#x}", packet.pid);
                return Ok(());
            }
            let expected = (last + 1) & 0x0F;
            if packet.continuity != expected && !packet.discontinuity() {
                log::warn!(
                    "mpegts: continuity gap on pid {:#x}: {} after {last}",
                    packet.pid,
                    packet.continuity
                );
            }
        }
        stream.continuity = Some(packet.continuity);

        if packet.payload_unit_start {
            if stream.started && !stream.buffer.is_empty() {
                stream.finish(ctx, &mut self.queue)?;
            }
            stream.started = true;
            stream.pos = pos;
            stream.random_access = packet.random_access();
            stream.buffer.extend_from_slice(packet.payload);
            stream.expected = match packet.payload {
                [_, _, _, _, hi, lo, ..] => match u16::from_be_bytes([*hi, *lo]) as usize {
                    0 => 0,
                    len => len + 6,
                },
                _ => 0,
            };
        } else if stream.started {
            stream.buffer.extend_from_slice(packet.payload);
        } else {
            return Ok(());
        }

        if stream.expected > 0 && stream.buffer.len() >= stream.expected {
            stream.finish(ctx, &mut self.queue)?;
        }
        Ok(())
    }

    /// Completes every partial PES at the end of input.
    fn flush_streams(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        for stream in self.streams.values_mut() {
            if stream.started && !stream.buffer.is_empty() {
                stream.finish(ctx, &mut self.queue)?;
            }
        }
        Ok(())
    }

    fn reset_streams(&mut self) {
        for stream in self.streams.values_mut() {
            stream.reset();
        }
        for assembler in self.sections.values_mut() {
            assembler.reset();
        }
        self.queue.clear();
        self.eof = false;
    }

    /// First PES timestamp of `pid` at or after `from`, with its packet offset.
    fn next_timestamp(
        &self,
        io: &mut IoReader,
        from: u64,
        pid: u16,
        limit: u64,
    ) -> Result<Option<(u64, i64)>, FormatError> {
        io.seek(from)?;
        if !self.resync(io)? {
            return Ok(None);
        }
        while io.pos() < limit.min(from + MAX_SEEK_SCAN) {
            let Some((pos, raw)) = self.read_raw(io)? else {
                return Ok(None);
            };
            let Ok(packet) = TsPacket::parse(&raw) else {
                continue;
            };
            if packet.pid != pid || !packet.payload_unit_start {
                continue;
            }
            if let Ok(header) = PesHeader::parse(packet.payload) {
                let ts = if header.dts != NOPTS_VALUE { header.dts } else { header.pts };
                if ts != NOPTS_VALUE {
                    return Ok(Some((pos, ts)));
                }
            }
        }
        Ok(None)
    }
}

impl IFormat for IMpegtsFormat {
    fn name(&self) -> &'static str {
        "mpegts"
    }

    fn probe(buf: &[u8]) -> u8 {
        let Some(size) = guess_packet_size(buf) else {
            return 0;
        };
        let offset = sync_offset(size);
        let Some(start) = (0..size).find(|&i| {
            buf.get(i + offset) == Some(&SYNC_BYTE) && buf.get(i + offset + size) == Some(&SYNC_BYTE)
        }) else {
            return 0;
        };
        let count = (start + offset..buf.len())
            .step_by(size)
            .take_while(|&i| buf[i] == SYNC_BYTE)
            .count();
        let whole = start + offset + count * size >= buf.len();
        if count >= 10 || (count >= RESYNC_PACKETS && whole) {
            PROBE_SCORE_MAX
        } else if count >= RESYNC_PACKETS {
            PROBE_SCORE_PARTIAL
        } else {
            0
        }
    }

    fn read_header(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        let head = ctx.io.peek(PROBE_PACKET_MAX_BUF)?;
        self.packet_size = guess_packet_size(&head)
            .ok_or_else(|| FormatError::invalid("mpegts: input shorter than one packet"))?;
        if !self.resync(&mut ctx.io)? {
            return Err(FormatError::invalid("mpegts: no sync byte found"));
        }
        self.first_packet_pos = ctx.io.pos();
        log::debug!(
            "mpegts: {} byte packets from offset {}",
            self.packet_size,
            self.first_packet_pos
        );

        while self.pmt_version.is_none() && ctx.io.pos() < self.first_packet_pos + MAX_HEADER_SCAN {
            let Some((_, raw)) = self.read_raw(&mut ctx.io)? else {
                break;
            };
            match TsPacket::parse(&raw) {
                Ok(packet) => {
                    self.handle_psi(ctx, &packet)?;
                }
                Err(e) => log_or_err!(ctx, Level::Warn, e),
            }
        }
        if self.pmt_version.is_none() {
            return Err(FormatError::invalid(if self.pmt_pid.is_some() {
                "mpegts: no PMT found"
            } else {
                "mpegts: no PAT found"
            }));
        }

        ctx.io.seek(self.first_packet_pos)?;
        for assembler in self.sections.values_mut() {
            assembler.reset();
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
            let Some((pos, raw)) = self.read_raw(&mut ctx.io)? else {
                self.flush_streams(ctx)?;
                self.eof = true;
                continue;
            };
            let packet = match TsPacket::parse(&raw) {
                Ok(packet) => packet,
                Err(e) => {
                    log_or_err!(ctx, Level::Warn, e);
                    continue;
                }
            };
            if packet.transport_error {
                log_or_err!(
                    ctx,
                    Level::Warn,
                    FormatError::invalid(format!(
                        "mpegts: transport error on pid {:#x} at {pos}",
                        packet.pid
                    ))
                );
                continue;
            }
            if packet.pid == PID_NULL || self.handle_psi(ctx, &packet)? {
                continue;
            }
            self.handle_pes(ctx, &packet, pos)?;
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
            let mut target = (timestamp.max(0) as u64).max(self.first_packet_pos);
            if size > 0 {
                target = target.min(size);
            }
            ctx.io.seek(target)?;
            self.resync(&mut ctx.io)?;
            self.reset_streams();
            return Ok(());
        }
        if size == 0 {
            return Err(FormatError::unsupported("mpegts: seeking needs a known input size"));
        }

        let pid = ctx.stream(stream_index)?.id as u16;
        let target = rescale(timestamp, ctx.stream(stream_index)?.time_base, MPEGTS_TIME_BASE);
        let step = self.packet_size as u64;
        let mut best = self.first_packet_pos;
        let (mut lo, mut hi) = (self.first_packet_pos, size);
        while hi > lo + step {
            let mid = lo + ((hi - lo) / 2) / step * step;
            if mid <= lo {
                break;
            }
            match self.next_timestamp(&mut ctx.io, mid, pid, hi)? {
                Some((pos, ts)) if unwrap_timestamp(target, ts) <= target => {
                    best = pos;
                    lo = pos + step;
                }
                _ => hi = mid,
            }
        }
        log::debug!("mpegts: seek to {target} on pid {pid:#x} lands at byte {best}");

        ctx.io.seek(best)?;
        self.reset_streams();
        for stream in self.streams.values_mut() {
            stream.last_dts = target;
        }
        Ok(())
    }

    fn max_analyze_duration_ms(&self) -> Option<u64> {
        Some(2000)
    }
}

#[cfg(test)]
mod tests {
    use super::packet::tests::{pes, ts_packets};
    use super::psi::tests::{pat, pmt};
    use super::*;
    use crate::codecs::aac::tests::ADTS_HEADER;
    use crate::codecs::h264::tests::{PPS, SPS_320X240};

    const PMT_PID: u16 = 0x1000;
    const VIDEO_PID: u16 = 0x100;
    const AUDIO_PID: u16 = 0x101;

    fn section_packet(pid: u16, section: &[u8], cc: &mut u8) -> Vec<u8> {
        let mut payload = vec![0];
        payload.extend_from_slice(section);
        let mut packet = vec![SYNC_BYTE, 0x40 | (pid >> 8) as u8, pid as u8, 0x10 | (*cc & 0x0F)];
        *cc = cc.wrapping_add(1);
        packet.extend_from_slice(&payload);
        packet.resize(TS_PACKET_SIZE, 0xFF);
        packet
    }

    fn idr_access_unit() -> Vec<u8> {
        let idr = [0x65, 0x88, 0x84, 0x00, 0x33];
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

    /// PAT, PMT, then `frames` video PES and one audio PES per video PES.
    fn transport_stream(frames: i64) -> Vec<u8> {
        let mut cc = [0u8; 4];
        let mut ts = section_packet(PID_PAT, &pat(1, PMT_PID), &mut cc[0]);
        let streams = [(0x1B, VIDEO_PID, Vec::new()), (0x0F, AUDIO_PID, Vec::new())];
        ts.extend(section_packet(PMT_PID, &pmt(1, 0, VIDEO_PID, &streams), &mut cc[1]));
        for i in 0..frames {
            let pts = 90_000 + i * 3600;
            let video = pes(0xE0, pts + 3600, Some(pts), &idr_access_unit());
            ts.extend(ts_packets(VIDEO_PID, &video, true, &mut cc[2]));
            let audio = pes(0xC0, pts, None, &adts_frames(2));
            ts.extend(ts_packets(AUDIO_PID, &audio, false, &mut cc[3]));
        }
        ts
    }

    fn open(data: Vec<u8>) -> anyhow::Result<(IMpegtsFormat, InputContext)> {
        let mut ctx = InputContext::new(IoReader::from_bytes(data));
        let mut format = IMpegtsFormat::default();
        format.read_header(&mut ctx)?;
        Ok((format, ctx))
    }

    fn read_all(format: &mut IMpegtsFormat, ctx: &mut InputContext) -> anyhow::Result<Vec<Packet>> {
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
    fn probe_scores() {
        let ts = transport_stream(4);
        assert_eq!(IMpegtsFormat::probe(&ts), PROBE_SCORE_MAX);
        assert_eq!(IMpegtsFormat::probe(&ts[..TS_PACKET_SIZE * 3 + 10]), PROBE_SCORE_MAX);

        let mut partial = ts[..TS_PACKET_SIZE * 5].to_vec();
        partial[TS_PACKET_SIZE * 3] = 0;
        assert_eq!(IMpegtsFormat::probe(&partial), PROBE_SCORE_PARTIAL);
        assert_eq!(IMpegtsFormat::probe(&[0u8; 1024]), 0);
    }

    #[test]
    fn streams_from_pmt() -> anyhow::Result<()> {
        let (_, ctx) = open(transport_stream(1))?;
        assert_eq!(ctx.streams.len(), 2);
        let video = &ctx.streams[0];
        assert_eq!(video.id, VIDEO_PID as u32);
        assert_eq!(video.codecpar.codec_id, CodecId::H264);
        assert_eq!(video.codecpar.bit_format, Some(BitFormat::AnnexB));
        assert_eq!(video.time_base, MPEGTS_TIME_BASE);
        assert_eq!(ctx.streams[1].codecpar.codec_id, CodecId::Aac);
        Ok(())
    }

    #[test]
    fn video_and_audio_packets() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(transport_stream(3))?;
        let packets = read_all(&mut format, &mut ctx)?;

        let video: Vec<_> = packets.iter().filter(|p| p.stream_index == 0).collect();
        assert_eq!(video.len(), 3);
        assert!(video.iter().all(|p| p.is_key() && p.bit_format == Some(BitFormat::AnnexB)));
        assert_eq!(video[1].dts, 93_600);
        assert_eq!(video[1].pts, 97_200);
        assert_eq!(video[0].data(), idr_access_unit().as_slice());

        let par = &ctx.streams[0].codecpar;
        assert_eq!((par.width, par.height), (320, 240));
        assert!(is_annexb_extradata(&par.extradata));

        let audio: Vec<_> = packets.iter().filter(|p| p.stream_index == 1).collect();
        assert_eq!(audio.len(), 6);
        assert!(audio.iter().all(|p| p.size() == 364));
        assert_eq!(audio[1].pts, 90_000 + 2090);
        let par = &ctx.streams[1].codecpar;
        assert_eq!(par.extradata, vec![0x12, 0x10]);
        assert_eq!((par.sample_rate, par.channels), (44100, 2));
        Ok(())
    }

    fn is_annexb_extradata(extradata: &[u8]) -> bool {
        crate::codecs::nalu::is_annexb(extradata) && split_nalu_by_start_code(extradata).len() == 2
    }

    #[test]
    fn resync_after_garbage() -> anyhow::Result<()> {
        let mut data = transport_stream(2);
        let cut = TS_PACKET_SIZE * 4 + 20;
        data.splice(cut..cut, [0x12u8; 37]);
        let (mut format, mut ctx) = open(data)?;
        let packets = read_all(&mut format, &mut ctx)?;
        assert!(packets.iter().any(|p| p.stream_index == 1));
        assert!(packets.iter().filter(|p| p.stream_index == 0).count() >= 1);
        Ok(())
    }

    #[test]
    fn m2ts_packets() -> anyhow::Result<()> {
        let data: Vec<u8> = transport_stream(2)
            .chunks(TS_PACKET_SIZE)
            .flat_map(|packet| [&[0, 0, 0, 0][..], packet].concat())
            .collect();
        let (mut format, mut ctx) = open(data)?;
        assert_eq!(format.packet_size, 192);
        let packets = read_all(&mut format, &mut ctx)?;
        assert_eq!(packets.iter().filter(|p| p.stream_index == 0).count(), 2);
        Ok(())
    }

    #[test]
    fn missing_pmt_is_an_error() {
        let mut cc = 0;
        let mut data = section_packet(PID_PAT, &pat(1, PMT_PID), &mut cc);
        for _ in 0..20 {
            data.extend(section_packet(PID_PAT, &pat(1, PMT_PID), &mut cc));
        }
        assert!(open(data).is_err());
    }

    #[test]
    fn seek_by_timestamp() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(transport_stream(40))?;
        format.seek(&mut ctx, 0, 90_000 + 20 * 3600, SeekFlags::BACKWARD)?;
        let dts = loop {
            let packet = format.read_packet(&mut ctx)?;
            if packet.stream_index == 0 {
                break packet.dts;
            }
        };
        assert!(dts <= 90_000 + 20 * 3600);
        assert!(dts >= 90_000 + 15 * 3600);
        Ok(())
    }
}
