//! MPEG transport stream muxer.
//!
//! One program on PMT PID 0x1000 with elementary streams from PID 0x100 on.
//! PAT, PMT and SDT are written up front and repeated every 100 ms of
//! decode time. Video access units get a PES packet each; audio frames are
//! gathered into PES packets of up to [`PES_MAX_SIZE`] bytes. The PCR rides
//! on the first video stream, or the first stream when there is no video.

use log::Level;

use super::packet::{AdaptationField, PID_PAT, SYNC_BYTE, write_timestamp};
use super::psi::{
    DESC_EXT_OPUS, DESC_EXTENSION, DESC_LANGUAGE, DESC_REGISTRATION, Descriptor, Pmt, PmtStream,
    STREAM_TYPE_AAC, STREAM_TYPE_AC3, STREAM_TYPE_EAC3, STREAM_TYPE_H264, STREAM_TYPE_HEVC,
    STREAM_TYPE_MPEG1_AUDIO, STREAM_TYPE_MPEG2_AUDIO, STREAM_TYPE_MPEG2_VIDEO,
    STREAM_TYPE_MPEG4_VIDEO, STREAM_TYPE_PRIVATE_DATA, STREAM_TYPE_VVC, pat_section, sdt_section,
};
use crate::codecs::nalu::split_nalu_by_start_code;
use crate::codecs::{NalCodec, NalKind};
use crate::formats::{OFormat, OutputContext};
use crate::process::bsf::{Avcc2AnnexB, BitstreamFilter, Bsf, Raw2Adts};
use crate::process::timestamp::TS_PACKET_SIZE;
use crate::structs::packet::{BitFormat, Packet, SideData};
use crate::structs::rational::{MPEGTS_TIME_BASE, NOPTS_VALUE};
use crate::structs::stream::{CodecId, CodecParameters, MediaType};
use crate::utils::errors::FormatError;

pub const PMT_PID: u16 = 0x1000;
pub const PID_SDT: u16 = 0x0011;
pub const FIRST_ES_PID: u16 = 0x0100;
const PROGRAM: u16 = 1;
const TRANSPORT_STREAM_ID: u16 = 1;

/// Largest audio PES payload, sized to fill 16 transport packets.
pub const PES_MAX_SIZE: usize = 2930;
/// Offset in 90 kHz ticks put between the PCR and the decode timestamps.
pub const MUX_DELAY: i64 = 126_000;
/// Tables are repeated whenever this much decode time has passed.
const TABLE_PERIOD: i64 = 9000;

const PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;

const STREAM_ID_PRIVATE_1: u8 = 0xBD;
const STREAM_ID_AUDIO: u8 = 0xC0;
const STREAM_ID_VIDEO: u8 = 0xE0;

/// Stream type and descriptors announcing `par` in the PMT.
fn stream_type(par: &CodecParameters, language: Option<&str>) -> (u8, Vec<Descriptor>) {
    let registration = |tag: &[u8; 4]| Descriptor {
        tag: DESC_REGISTRATION,
        data: tag.to_vec(),
    };
    let (stream_type, mut descriptors) = match par.codec_id {
        CodecId::Mpeg2Video => (STREAM_TYPE_MPEG2_VIDEO, Vec::new()),
        CodecId::Mpeg4 => (STREAM_TYPE_MPEG4_VIDEO, Vec::new()),
        CodecId::H264 => (STREAM_TYPE_H264, Vec::new()),
        CodecId::Hevc => (STREAM_TYPE_HEVC, Vec::new()),
        CodecId::Vvc => (STREAM_TYPE_VVC, Vec::new()),
        CodecId::Mp3 if par.sample_rate > 0 && par.sample_rate < 32000 => {
            (STREAM_TYPE_MPEG2_AUDIO, Vec::new())
        }
        CodecId::Mp3 => (STREAM_TYPE_MPEG1_AUDIO, Vec::new()),
        CodecId::Aac => (STREAM_TYPE_AAC, Vec::new()),
        CodecId::Ac3 => (STREAM_TYPE_AC3, vec![registration(b"AC-3")]),
        CodecId::Eac3 => (STREAM_TYPE_EAC3, vec![registration(b"EAC3")]),
        CodecId::Opus => (
            STREAM_TYPE_PRIVATE_DATA,
            vec![
                registration(b"Opus"),
                Descriptor {
                    tag: DESC_EXTENSION,
                    data: vec![DESC_EXT_OPUS, par.channels.clamp(1, 8) as u8],
                },
            ],
        ),
        codec => {
            log::warn!("mpegts: {codec} has no stream type, writing it as private data");
            (STREAM_TYPE_PRIVATE_DATA, Vec::new())
        }
    };
    if par.media_type == MediaType::Audio {
        let mut code = [b'u', b'n', b'd', 0];
        if let Some(lang) = language.filter(|l| l.len() == 3 && l.is_ascii()) {
            code[..3].copy_from_slice(lang.as_bytes());
        }
        descriptors.push(Descriptor {
            tag: DESC_LANGUAGE,
            data: code.to_vec(),
        });
    }
    (stream_type, descriptors)
}

fn stream_id(par: &CodecParameters) -> u8 {
    match (par.media_type, par.codec_id) {
        (MediaType::Video, _) => STREAM_ID_VIDEO,
        (MediaType::Audio, CodecId::Mp3 | CodecId::Aac) => STREAM_ID_AUDIO,
        _ => STREAM_ID_PRIVATE_1,
    }
}

/// Wraps an Opus packet in its transport control header.
fn opus_control_header(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packet.len() + 2 + packet.len() / 255 + 1);
    out.extend_from_slice(&[0x7F, 0xE0]);
    let mut size = packet.len();
    while size >= 0xFF {
        out.push(0xFF);
        size -= 0xFF;
    }
    out.push(size as u8);
    out.extend_from_slice(packet);
    out
}

/// Appends one transport packet carrying as much of `payload` as fits and
/// returns the number of payload bytes taken.
fn write_ts_packet(
    out: &mut Vec<u8>,
    pid: u16,
    unit_start: bool,
    cc: &mut u8,
    field: Option<AdaptationField>,
    payload: &[u8],
) -> usize {
    let mut body = field.map(|f| f.to_bytes()).unwrap_or_default();
    let room = match field {
        Some(_) => PAYLOAD_SIZE - 1 - body.len(),
        None => PAYLOAD_SIZE,
    };
    let take = payload.len().min(room);
    let mut stuffing = room - take;
    let has_field = field.is_some() || stuffing > 0;
    if field.is_none() && stuffing > 0 {
        // Length byte, then a flags byte if there is room for one.
        stuffing -= 1;
        if stuffing > 0 {
            body.push(0);
            stuffing -= 1;
        }
    }
    body.resize(body.len() + stuffing, 0xFF);

    let mut control = if take > 0 { 0x10 } else { 0 };
    if has_field {
        control |= 0x20;
    }
    out.push(SYNC_BYTE);
    out.push(u8::from(unit_start) << 6 | ((pid >> 8) as u8 & 0x1F));
    out.push(pid as u8);
    out.push(control | (*cc & 0x0F));
    if take > 0 {
        *cc = (*cc + 1) & 0x0F;
    }
    if has_field {
        out.push(body.len() as u8);
        out.extend_from_slice(&body);
    }
    out.extend_from_slice(&payload[..take]);
    take
}

/// Appends a section behind a pointer field, 0xFF filling the last packet.
fn write_section(out: &mut Vec<u8>, pid: u16, cc: &mut u8, section: &[u8]) {
    let mut payload = Vec::with_capacity(section.len() + 1);
    payload.push(0);
    payload.extend_from_slice(section);
    for (i, chunk) in payload.chunks(PAYLOAD_SIZE).enumerate() {
        out.extend_from_slice(&[
            SYNC_BYTE,
            u8::from(i == 0) << 6 | ((pid >> 8) as u8 & 0x1F),
            pid as u8,
            0x10 | (*cc & 0x0F),
        ]);
        *cc = (*cc + 1) & 0x0F;
        out.extend_from_slice(chunk);
        out.resize(out.len() + PAYLOAD_SIZE - chunk.len(), 0xFF);
    }
}

/// Per elementary stream writer state.
#[derive(Debug)]
struct EsWriter {
    pid: u16,
    stream_id: u8,
    media_type: MediaType,
    codec_id: CodecId,
    extradata: Vec<u8>,
    filter: Option<Bsf>,
    cc: u8,
    /// PES payload gathered so far.
    payload: Vec<u8>,
    pts: i64,
    dts: i64,
    key: bool,
    extradata_sent: bool,
}

impl EsWriter {
    fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }

    /// Converts a packet to its transport encapsulation.
    fn encapsulate(&mut self, packet: &Packet) -> Result<Vec<u8>, FormatError> {
        let Some(filter) = self.filter.as_mut() else {
            return Ok(match self.codec_id {
                CodecId::Opus => opus_control_header(packet.data()),
                _ => packet.data().to_vec(),
            });
        };

        let mut packet = packet.clone();
        let nal = NalCodec::from_codec_id(self.codec_id);
        if nal.is_some()
            && !self.extradata_sent
            && packet.is_key()
            && packet.new_extradata().is_none()
            && !self.extradata.is_empty()
        {
            packet.add_side_data(SideData::NewExtradata(self.extradata.clone()));
        }
        if nal.is_some() && packet.is_key() {
            self.extradata_sent = true;
        }
        filter.send_packet(packet)?;
        let mut data = Vec::new();
        while let Ok(out) = filter.receive_packet() {
            data.extend_from_slice(out.data());
        }

        if let Some(codec) = nal {
            let first = split_nalu_by_start_code(&data).first().map(|n| codec.kind(n));
            if first != Some(NalKind::Aud) {
                let mut with_aud = Vec::with_capacity(data.len() + 8);
                with_aud.extend_from_slice(&[0, 0, 0, 1]);
                with_aud.extend_from_slice(codec.aud());
                with_aud.extend_from_slice(&data);
                data = with_aud;
            }
        }
        Ok(data)
    }

    /// Writes the gathered payload as one PES packet.
    fn flush_pes(&mut self, out: &mut Vec<u8>, pcr_pid: u16) {
        if self.payload.is_empty() {
            return;
        }
        let (pts, dts) = match (self.pts, self.dts) {
            (NOPTS_VALUE, dts) => (dts, dts),
            (pts, NOPTS_VALUE) => (pts, pts),
            ts => ts,
        };
        let mut fields = Vec::with_capacity(10);
        let mut flags = 0;
        if pts != NOPTS_VALUE {
            if dts != pts {
                fields.extend_from_slice(&write_timestamp(3, pts));
                fields.extend_from_slice(&write_timestamp(1, dts));
                flags = 0xC0;
            } else {
                fields.extend_from_slice(&write_timestamp(2, pts));
                flags = 0x80;
            }
        }

        let length = 3 + fields.len() + self.payload.len();
        let length = if self.is_video() || length > u16::MAX as usize { 0 } else { length };
        let mut pes = Vec::with_capacity(9 + fields.len() + self.payload.len());
        pes.extend_from_slice(&[0, 0, 1, self.stream_id]);
        pes.extend_from_slice(&(length as u16).to_be_bytes());
        pes.extend_from_slice(&[0x80, flags, fields.len() as u8]);
        pes.extend_from_slice(&fields);
        pes.append(&mut self.payload);

        let pcr = (self.pid == pcr_pid && dts != NOPTS_VALUE).then(|| (dts - MUX_DELAY).max(0) * 300);
        let mut field = (pcr.is_some() || self.key).then(|| AdaptationField {
            random_access: self.key,
            pcr,
            ..Default::default()
        });
        let mut rest = pes.as_slice();
        let mut unit_start = true;
        while !rest.is_empty() {
            let taken = write_ts_packet(out, self.pid, unit_start, &mut self.cc, field.take(), rest);
            rest = &rest[taken..];
            unit_start = false;
        }
        self.key = false;
    }
}

/// Transport stream writer.
#[derive(Debug, Default)]
pub struct OMpegtsFormat {
    es: Vec<EsWriter>,
    pcr_pid: u16,
    tables: Vec<(u16, Vec<u8>)>,
    table_cc: Vec<u8>,
    /// Added to every timestamp, fixed by the first packet.
    delay: Option<i64>,
    last_tables: i64,
    packets: u64,
}

impl OMpegtsFormat {
    fn write_tables(&mut self, out: &mut Vec<u8>) {
        for ((pid, section), cc) in self.tables.iter().zip(self.table_cc.iter_mut()) {
            write_section(out, *pid, cc, section);
        }
    }
}

impl OFormat for OMpegtsFormat {
    fn name(&self) -> &'static str {
        "mpegts"
    }

    fn init(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        if ctx.streams.len() > usize::from(PMT_PID - FIRST_ES_PID) {
            return Err(FormatError::params(format!(
                "mpegts: {} streams do not fit in one program",
                ctx.streams.len()
            )));
        }
        self.es.clear();
        let mut pmt_streams = Vec::with_capacity(ctx.streams.len());
        for (i, stream) in ctx.streams.iter_mut().enumerate() {
            stream.time_base = MPEGTS_TIME_BASE;
            let par = &stream.codecpar;
            let pid = FIRST_ES_PID + i as u16;
            let (stream_type, descriptors) =
                stream_type(par, stream.metadata.get("language").map(String::as_str));

            let mut filter = match par.codec_id {
                CodecId::H264 | CodecId::Hevc | CodecId::Vvc => {
                    Some(Bsf::Avcc2AnnexB(Avcc2AnnexB::default()))
                }
                CodecId::Aac => Some(Bsf::Raw2Adts(Raw2Adts::default())),
                _ => None,
            };
            if let Some(filter) = filter.as_mut() {
                filter.init(par, stream.time_base)?;
            }

            log::debug!(
                "mpegts: stream {i} ({}) on pid {pid:#x}, stream type {stream_type:#04x}",
                par.codec_id
            );
            pmt_streams.push(PmtStream {
                stream_type,
                pid,
                descriptors,
            });
            self.es.push(EsWriter {
                pid,
                stream_id: stream_id(par),
                media_type: par.media_type,
                codec_id: par.codec_id,
                extradata: if par.bit_format == Some(BitFormat::AnnexB) {
                    Vec::new()
                } else {
                    par.extradata.clone()
                },
                filter,
                cc: 0,
                payload: Vec::new(),
                pts: NOPTS_VALUE,
                dts: NOPTS_VALUE,
                key: false,
                extradata_sent: false,
            });
        }

        self.pcr_pid = self
            .es
            .iter()
            .find(|es| es.is_video())
            .or(self.es.first())
            .map_or(FIRST_ES_PID, |es| es.pid);
        let pmt = Pmt {
            program: PROGRAM,
            version: 0,
            pcr_pid: self.pcr_pid,
            descriptors: Vec::new(),
            streams: pmt_streams,
        };
        let provider = ctx.metadata.get("publisher").map_or("avmux", String::as_str);
        let service = ctx.metadata.get("title").map_or("Service01", String::as_str);
        self.tables = vec![
            (PID_SDT, sdt_section(TRANSPORT_STREAM_ID, provider, service)),
            (PID_PAT, pat_section(TRANSPORT_STREAM_ID, &[(PROGRAM, PMT_PID)])),
            (PMT_PID, pmt.to_section()),
        ];
        self.table_cc = vec![0; self.tables.len()];
        self.delay = None;
        self.packets = 0;
        Ok(())
    }

    fn write_header(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        let mut out = Vec::with_capacity(3 * TS_PACKET_SIZE);
        self.write_tables(&mut out);
        ctx.io.write_all(&out)?;
        Ok(())
    }

    fn write_packet(&mut self, ctx: &mut OutputContext, packet: &Packet) -> Result<(), FormatError> {
        if packet.is_empty() {
            log::warn!("empty packet on stream {}, ignoring", packet.stream_index);
            return Ok(());
        }
        let Some(es) = self.es.get(packet.stream_index) else {
            log::warn!("mpegts: packet for unknown stream {}, ignoring", packet.stream_index);
            return Ok(());
        };
        let video = es.is_video();

        let dts = if packet.dts == NOPTS_VALUE { packet.pts } else { packet.dts };
        let delay = match self.delay {
            Some(delay) => delay,
            None => {
                let delay = if dts != NOPTS_VALUE && dts < MUX_DELAY { MUX_DELAY - dts } else { 0 };
                log::debug!("mpegts: timestamps shifted by {delay}");
                self.delay = Some(delay);
                self.last_tables = dts;
                delay
            }
        };

        let mut out = Vec::new();
        if dts != NOPTS_VALUE && dts - self.last_tables > TABLE_PERIOD {
            self.write_tables(&mut out);
            self.last_tables = dts;
        }

        let pcr_pid = self.pcr_pid;
        let es = &mut self.es[packet.stream_index];
        let data = es.encapsulate(packet)?;
        if data.is_empty() {
            return Ok(());
        }
        if !es.payload.is_empty() && es.payload.len() + data.len() > PES_MAX_SIZE {
            es.flush_pes(&mut out, pcr_pid);
        }
        if es.payload.is_empty() {
            let shift = |ts: i64| if ts == NOPTS_VALUE { ts } else { ts + delay };
            es.pts = shift(packet.pts);
            es.dts = shift(dts);
        }
        es.key |= packet.is_key();
        es.payload.extend_from_slice(&data);
        if video {
            es.flush_pes(&mut out, pcr_pid);
        }

        self.packets += 1;
        ctx.io.write_all(&out)?;
        Ok(())
    }

    fn write_trailer(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        let mut out = Vec::new();
        let pcr_pid = self.pcr_pid;
        for es in &mut self.es {
            es.flush_pes(&mut out, pcr_pid);
        }
        ctx.io.write_all(&out)?;
        if log::log_enabled!(Level::Debug) {
            log::debug!(
                "mpegts: {} packets in {} bytes",
                self.packets,
                ctx.io.pos()
            );
        }
        Ok(ctx.io.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::h264::AvcConfig;
    use crate::codecs::h264::tests::{PPS, SPS_320X240};
    use crate::codecs::nalu::{StartCodeMode, join_nalu_by_length, join_nalu_by_start_code};
    use crate::formats::mpegts::packet::TsPacket;
    use crate::formats::mpegts::psi::{parse_pmt, section_crc_ok};
    use crate::formats::{IFormat, IMpegtsFormat, InputContext};
    use crate::io::{IoReader, IoWriter};
    use crate::process::mux::MuxOptions;
    use crate::structs::packet::PacketFlags;
    use crate::structs::rational::Rational;
    use crate::structs::stream::Stream;
    use crate::utils::errors::FormatError;

    const IDR: [u8; 5] = [0x65, 0x88, 0x84, 0x00, 0x33];

    fn output() -> anyhow::Result<OutputContext> {
        let avcc = AvcConfig::from_param_sets(vec![SPS_320X240.to_vec()], vec![PPS.to_vec()], vec![])?;
        let mut video = Stream::new(0, Rational::new(1, 1000));
        video.codecpar = CodecParameters::video(CodecId::H264, 320, 240);
        video.codecpar.extradata = avcc.to_bytes();
        video.codecpar.bit_format = Some(BitFormat::Avcc);
        let mut audio = Stream::new(1, Rational::new(1, 1000));
        audio.codecpar = CodecParameters::audio(CodecId::Aac, 44100, 2);
        audio.codecpar.extradata = vec![0x12, 0x10];
        audio.metadata.insert("language".into(), "eng".into());

        let mut ctx = OutputContext::new(IoWriter::buffer(), MuxOptions::default());
        ctx.streams = vec![video, audio];
        Ok(ctx)
    }

    /// Muxes `frames` 40 ms video frames, each followed by two AAC frames.
    fn mux(frames: i64) -> anyhow::Result<Vec<u8>> {
        let mut ctx = output()?;
        let mut format = OMpegtsFormat::default();
        format.init(&mut ctx)?;
        assert_eq!(ctx.streams[0].time_base, MPEGTS_TIME_BASE);
        format.write_header(&mut ctx)?;
        for i in 0..frames {
            let mut video = Packet::from_vec(join_nalu_by_length(&[&IDR[..]], 4));
            video.stream_index = 0;
            video.dts = i * 3600;
            video.pts = video.dts + 3600;
            video.bit_format = Some(BitFormat::Avcc);
            if i % 10 == 0 {
                video.flags |= PacketFlags::KEY;
            }
            format.write_packet(&mut ctx, &video)?;
            for j in 0..2 {
                let mut audio = Packet::from_vec(vec![(i * 2 + j) as u8; 300]);
                audio.stream_index = 1;
                audio.pts = i * 3600 + j * 1800;
                audio.dts = audio.pts;
                audio.flags |= PacketFlags::KEY;
                format.write_packet(&mut ctx, &audio)?;
            }
        }
        format.write_trailer(&mut ctx)?;
        Ok(ctx.io.into_buffer().unwrap_or_default())
    }

    #[test]
    fn tables_lead_the_stream() -> anyhow::Result<()> {
        let out = mux(1)?;
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        let pids: Vec<u16> = out
            .chunks(TS_PACKET_SIZE)
            .take(3)
            .map(|p| TsPacket::parse(p).map(|p| p.pid))
            .collect::<Result<_, _>>()?;
        assert_eq!(pids, vec![PID_SDT, PID_PAT, PMT_PID]);

        let pmt_packet = TsPacket::parse(&out[2 * TS_PACKET_SIZE..])?;
        let len = 3 + u16::from_be_bytes([pmt_packet.payload[2] & 0x0F, pmt_packet.payload[3]]) as usize;
        let section = &pmt_packet.payload[1..1 + len];
        assert!(section_crc_ok(section));
        let pmt = parse_pmt(section)?;
        assert_eq!(pmt.pcr_pid, FIRST_ES_PID);
        assert_eq!(pmt.streams[0].stream_type, STREAM_TYPE_H264);
        assert_eq!(pmt.streams[1].stream_type, STREAM_TYPE_AAC);
        assert_eq!(pmt.streams[1].language().as_deref(), Some("eng"));
        Ok(())
    }

    #[test]
    fn continuity_and_pcr() -> anyhow::Result<()> {
        let out = mux(30)?;
        let mut next_cc = std::collections::HashMap::new();
        let mut pcrs = Vec::new();
        for chunk in out.chunks(TS_PACKET_SIZE) {
            let packet = TsPacket::parse(chunk)?;
            if let Some(expected) = next_cc.insert(packet.pid, (packet.continuity + 1) & 0x0F) {
                assert_eq!(packet.continuity, expected, "pid {:#x}", packet.pid);
            }
            if let Some(pcr) = packet.adaptation.and_then(|a| a.pcr) {
                assert_eq!(packet.pid, FIRST_ES_PID);
                pcrs.push(pcr);
            }
        }
        assert_eq!(pcrs.len(), 30);
        assert_eq!(pcrs[0], 0);
        assert!(pcrs.windows(2).all(|w| w[1] - w[0] == 3600 * 300));

        // Tables repeat every 100 ms.
        let pats = out
            .chunks(TS_PACKET_SIZE)
            .filter(|p| TsPacket::parse(p).is_ok_and(|p| p.pid == PID_PAT))
            .count();
        assert_eq!(pats, 10);
        Ok(())
    }

    #[test]
    fn demuxes_what_it_writes() -> anyhow::Result<()> {
        let mut ctx = InputContext::new(IoReader::from_bytes(mux(12)?));
        let mut demuxer = IMpegtsFormat::default();
        demuxer.read_header(&mut ctx)?;
        assert_eq!(ctx.streams.len(), 2);
        assert_eq!(ctx.streams[0].codecpar.codec_id, CodecId::H264);
        assert_eq!(ctx.streams[1].codecpar.codec_id, CodecId::Aac);

        let mut packets = Vec::new();
        loop {
            match demuxer.read_packet(&mut ctx) {
                Ok(packet) => packets.push(packet),
                Err(FormatError::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }
        let video: Vec<_> = packets.iter().filter(|p| p.stream_index == 0).collect();
        assert_eq!(video.len(), 12);
        assert_eq!(video[0].dts, MUX_DELAY);
        assert_eq!(video[0].pts, MUX_DELAY + 3600);
        assert_eq!(video[5].dts, MUX_DELAY + 5 * 3600);
        assert!(video[0].is_key());

        let nalus = split_nalu_by_start_code(video[0].data());
        let aud = NalCodec::H264.aud();
        assert_eq!(nalus, vec![aud, &SPS_320X240[..], &PPS[..], &IDR[..]]);
        let nalus = split_nalu_by_start_code(video[1].data());
        assert_eq!(nalus, vec![aud, &IDR[..]]);

        let audio: Vec<_> = packets.iter().filter(|p| p.stream_index == 1).collect();
        assert_eq!(audio.len(), 24);
        assert!(audio.iter().all(|p| p.size() == 300));
        assert_eq!(audio[3].data(), &[3u8; 300][..]);
        assert_eq!(audio[0].pts, MUX_DELAY);
        Ok(())
    }

    #[test]
    fn annexb_input_passes_through() -> anyhow::Result<()> {
        let mut ctx = output()?;
        ctx.streams.truncate(1);
        ctx.streams[0].codecpar.bit_format = Some(BitFormat::AnnexB);
        let mut format = OMpegtsFormat::default();
        format.init(&mut ctx)?;
        format.write_header(&mut ctx)?;

        let aud = NalCodec::H264.aud();
        let access_unit = join_nalu_by_start_code(&[aud, &IDR[..]], StartCodeMode::Long);
        let mut packet = Packet::from_vec(access_unit.clone());
        packet.bit_format = Some(BitFormat::AnnexB);
        packet.pts = 0;
        packet.dts = 0;
        format.write_packet(&mut ctx, &packet)?;
        format.write_trailer(&mut ctx)?;

        let out = ctx.io.into_buffer().unwrap_or_default();
        let pes = TsPacket::parse(&out[3 * TS_PACKET_SIZE..])?;
        assert!(pes.payload_unit_start);
        assert!(pes.payload.ends_with(&access_unit));
        Ok(())
    }

    #[test]
    fn long_pes_spans_packets() {
        let mut out = Vec::new();
        let mut cc = 15;
        let payload = vec![0xAB; 400];
        let mut rest = payload.as_slice();
        let mut first = Some(AdaptationField {
            pcr: Some(300),
            ..Default::default()
        });
        while !rest.is_empty() {
            let taken = write_ts_packet(&mut out, 0x100, first.is_some(), &mut cc, first.take(), rest);
            rest = &rest[taken..];
        }
        assert_eq!(out.len(), 3 * TS_PACKET_SIZE);
        assert_eq!(cc, 2);
        let packets: Vec<_> = out.chunks(TS_PACKET_SIZE).map(TsPacket::parse).collect();
        let sizes: Vec<usize> = packets.iter().flatten().map(|p| p.payload.len()).collect();
        assert_eq!(sizes, vec![176, 184, 40]);
        assert_eq!(packets[0].as_ref().ok().and_then(|p| p.adaptation).and_then(|a| a.pcr), Some(300));
    }

    #[test]
    fn opus_control_header_sizes() {
        let framed = opus_control_header(&[1; 300]);
        assert_eq!(&framed[..4], &[0x7F, 0xE0, 0xFF, 45]);
        assert_eq!(framed.len(), 304);
        assert_eq!(opus_control_header(&[1; 255])[2..4], [0xFF, 0]);
    }
}
