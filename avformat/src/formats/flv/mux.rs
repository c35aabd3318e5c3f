//! FLV muxer.
//!
//! Carries at most one video and one audio stream. H.264, AAC, MP3, PCM and
//! G.711 use the legacy tag headers; HEVC, VVC, Opus, FLAC, AC-3 and E-AC-3
//! use the enhanced (FourCC) ones. An `onMetaData` script tag leads the file;
//! its `duration` and `filesize` are filled in at trailer time when the
//! output is seekable.

use log::Level;

use super::amf::{self, AmfValue};
use super::{FLAG_AUDIO, FLAG_VIDEO, HEADER_SIZE, SIGNATURE, TAG_AUDIO, TAG_HEADER_SIZE, TAG_SCRIPT, TAG_VIDEO};
use crate::codecs::aac::AdtsHeader;
use crate::codecs::{nalu, opus};
use crate::formats::{OFormat, OutputContext};
use crate::process::bsf::{Adts2Raw, AnnexB2Avcc, BitstreamFilter, Bsf};
use crate::structs::packet::{BitFormat, Packet};
use crate::structs::rational::{MILLI_TIME_BASE, NOPTS_VALUE};
use crate::structs::stream::{CodecId, CodecParameters, MediaType};
use crate::utils::errors::FormatError;

const FRAME_KEY: u8 = 1;
const FRAME_INTER: u8 = 2;

const LEGACY_AVC: u8 = 7;
const LEGACY_AAC: u8 = 10;

const SEQUENCE_START: u8 = 0;
const CODED_FRAMES: u8 = 1;
const SEQUENCE_END: u8 = 2;
const CODED_FRAMES_X: u8 = 3;

const ENHANCED: u8 = 0x80;
const AUDIO_EX_HEADER: u8 = 9 << 4;

/// How one stream's tags start.
#[derive(Debug, Clone, Copy, PartialEq)]
enum TagCodec {
    /// Legacy video codec id.
    Avc,
    /// Enhanced video FourCC.
    VideoFourCC([u8; 4]),
    /// Legacy audio flags byte; AAC adds a packet type byte after it.
    Audio(u8),
    /// Enhanced audio FourCC.
    AudioFourCC([u8; 4]),
}

impl TagCodec {
    fn needs_config(self) -> bool {
        match self {
            Self::Avc | Self::VideoFourCC(_) => true,
            Self::Audio(flags) => flags >> 4 == LEGACY_AAC,
            Self::AudioFourCC(tag) => &tag == b"Opus",
        }
    }

    /// Number stored as `videocodecid` / `audiocodecid`.
    fn metadata_id(self) -> f64 {
        match self {
            Self::Avc => LEGACY_AVC as f64,
            Self::Audio(flags) => (flags >> 4) as f64,
            Self::VideoFourCC(tag) | Self::AudioFourCC(tag) => u32::from_be_bytes(tag) as f64,
        }
    }

    /// Tag body prefix for `packet_type`. `cts` is only used by NAL video.
    fn prefix(self, packet_type: u8, key: bool, cts: i64) -> Vec<u8> {
        let frame_type = if key { FRAME_KEY } else { FRAME_INTER };
        let cts = (cts.clamp(-0x80_0000, 0x7F_FFFF) as i32).to_be_bytes();
        match self {
            Self::Avc => vec![frame_type << 4 | LEGACY_AVC, packet_type, cts[1], cts[2], cts[3]],
            Self::VideoFourCC(tag) => {
                let packet_type = if packet_type == CODED_FRAMES && cts == [0; 4] {
                    CODED_FRAMES_X
                } else {
                    packet_type
                };
                let mut out = vec![ENHANCED | frame_type << 4 | packet_type];
                out.extend_from_slice(&tag);
                if packet_type == CODED_FRAMES {
                    out.extend_from_slice(&cts[1..]);
                }
                out
            }
            Self::Audio(flags) if flags >> 4 == LEGACY_AAC => vec![flags, packet_type],
            Self::Audio(flags) => vec![flags],
            Self::AudioFourCC(tag) => {
                let mut out = vec![AUDIO_EX_HEADER | packet_type];
                out.extend_from_slice(&tag);
                out
            }
        }
    }
}

/// Legacy sound rate index, when `rate` is one of the four FLV rates.
fn sound_rate(rate: u32) -> Option<u8> {
    match rate {
        5512 | 5513 => Some(0),
        11025 => Some(1),
        22050 => Some(2),
        44100 => Some(3),
        _ => None,
    }
}

fn audio_codec(par: &CodecParameters) -> Result<TagCodec, FormatError> {
    let stereo = u8::from(par.channels > 1);
    let legacy = |format: u8, rate: u8, bits16: bool| format << 4 | rate << 2 | u8::from(bits16) << 1 | stereo;
    let unsupported =
        || FormatError::unsupported(format!("flv: {} at {} Hz cannot be stored", par.codec_id, par.sample_rate));
    Ok(match par.codec_id {
        CodecId::Aac => TagCodec::Audio(legacy(LEGACY_AAC, 3, true) | 1),
        CodecId::Mp3 if par.sample_rate == 8000 => TagCodec::Audio(legacy(14, 0, true)),
        CodecId::Mp3 => TagCodec::Audio(legacy(2, sound_rate(par.sample_rate).unwrap_or(3), true)),
        CodecId::PcmU8 => TagCodec::Audio(legacy(3, sound_rate(par.sample_rate).ok_or_else(unsupported)?, false)),
        CodecId::PcmS16Le => TagCodec::Audio(legacy(3, sound_rate(par.sample_rate).ok_or_else(unsupported)?, true)),
        CodecId::PcmAlaw if par.sample_rate == 8000 => TagCodec::Audio(legacy(7, 0, false)),
        CodecId::PcmMulaw if par.sample_rate == 8000 => TagCodec::Audio(legacy(8, 0, false)),
        CodecId::Opus => TagCodec::AudioFourCC(*b"Opus"),
        CodecId::Flac => TagCodec::AudioFourCC(*b"fLaC"),
        CodecId::Ac3 => TagCodec::AudioFourCC(*b"ac-3"),
        CodecId::Eac3 => TagCodec::AudioFourCC(*b"ec-3"),
        _ => return Err(unsupported()),
    })
}

fn video_codec(par: &CodecParameters) -> Result<TagCodec, FormatError> {
    Ok(match par.codec_id {
        CodecId::H264 => TagCodec::Avc,
        CodecId::Hevc => TagCodec::VideoFourCC(*b"hvc1"),
        CodecId::Vvc => TagCodec::VideoFourCC(*b"vvc1"),
        codec => return Err(FormatError::unsupported(format!("flv: video codec {codec} cannot be stored"))),
    })
}

/// Appends a complete tag followed by its previous-tag-size field.
fn write_tag(out: &mut Vec<u8>, kind: u8, timestamp: i64, body: &[u8]) {
    let ts = timestamp as u32;
    out.push(kind);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    out.extend_from_slice(&ts.to_be_bytes()[1..]);
    out.push((ts >> 24) as u8);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(body);
    out.extend_from_slice(&((TAG_HEADER_SIZE + body.len()) as u32).to_be_bytes());
}

#[derive(Debug)]
struct TrackWriter {
    index: usize,
    kind: u8,
    codec: TagCodec,
    filter: Option<Bsf>,
    /// Configuration written so far, or waiting to be written.
    config: Vec<u8>,
    config_written: bool,
    last_dts: i64,
}

impl TrackWriter {
    fn new(index: usize, media_type: MediaType, par: &CodecParameters) -> Result<Self, FormatError> {
        let (kind, codec) = match media_type {
            MediaType::Video => (TAG_VIDEO, video_codec(par)?),
            _ => (TAG_AUDIO, audio_codec(par)?),
        };
        let mut filter = match par.codec_id {
            CodecId::H264 | CodecId::Hevc | CodecId::Vvc => Some(Bsf::AnnexB2Avcc(AnnexB2Avcc::default())),
            CodecId::Aac => Some(Bsf::Adts2Raw(Adts2Raw::default())),
            _ => None,
        };
        if let Some(filter) = filter.as_mut() {
            filter.init(par, MILLI_TIME_BASE)?;
        }
        let config = match (&filter, par.codec_id) {
            (Some(filter), _) => filter.codecpar_out().extradata.clone(),
            (None, CodecId::Opus) if par.extradata.is_empty() => {
                opus::opus_head(par.channels.max(1), opus::DEFAULT_PRE_SKIP)
            }
            _ => par.extradata.clone(),
        };
        Ok(Self {
            index,
            kind,
            codec,
            filter,
            config,
            config_written: false,
            last_dts: NOPTS_VALUE,
        })
    }

    fn sequence_header(&mut self, out: &mut Vec<u8>, timestamp: i64) {
        if self.config.is_empty() {
            return;
        }
        let mut body = self.codec.prefix(SEQUENCE_START, true, 0);
        body.extend_from_slice(&self.config);
        write_tag(out, self.kind, timestamp, &body);
        self.config_written = true;
    }

    /// Writes a new sequence header when `config` differs from the last one.
    fn update_config(&mut self, out: &mut Vec<u8>, config: &[u8], timestamp: i64) {
        if config.is_empty() || (self.config_written && self.config == config) {
            return;
        }
        if self.config_written {
            log::info!("flv: stream {} codec configuration changed", self.index);
        }
        self.config = config.to_vec();
        self.sequence_header(out, timestamp);
    }

    /// Brings a packet into the form FLV stores: length-prefixed NAL units
    /// or raw AAC frames.
    fn filter(&mut self, packet: &Packet) -> Result<Vec<Packet>, FormatError> {
        let Some(filter) = self.filter.as_mut() else {
            return Ok(vec![packet.clone()]);
        };
        let mut packet = packet.clone();
        match filter {
            Bsf::AnnexB2Avcc(_) => {
                if packet.bit_format.is_none() && !nalu::is_annexb(packet.data()) {
                    packet.bit_format = Some(BitFormat::Avcc);
                }
            }
            _ if !AdtsHeader::has_sync(packet.data()) || AdtsHeader::parse(packet.data()).is_none() => {
                return Ok(vec![packet]);
            }
            _ => {}
        }
        filter.send_packet(packet)?;
        let mut filtered = Vec::new();
        while let Ok(out) = filter.receive_packet() {
            filtered.push(out);
        }
        Ok(filtered)
    }

    fn frame(&mut self, out: &mut Vec<u8>, packet: &Packet, offset: i64) {
        let dts = if packet.dts == NOPTS_VALUE { packet.pts } else { packet.dts };
        let dts = if dts == NOPTS_VALUE { self.last_dts.max(0) } else { dts + offset };
        let cts = match packet.pts {
            NOPTS_VALUE => 0,
            pts => pts + offset - dts,
        };
        if let Some(config) = packet.new_extradata() {
            self.update_config(out, config, dts);
        } else if !self.config_written && self.codec.needs_config() {
            if self.config.is_empty() {
                log::warn!("flv: stream {} has no codec configuration before its first frame", self.index);
            }
            self.sequence_header(out, dts);
        }
        if packet.is_empty() {
            return;
        }
        let mut body = self.codec.prefix(CODED_FRAMES, packet.is_key(), cts);
        body.extend_from_slice(packet.data());
        write_tag(out, self.kind, dts, &body);
        self.last_dts = dts;
    }
}

/// FLV writer.
#[derive(Debug, Default)]
pub struct OFlvFormat {
    video: Option<TrackWriter>,
    audio: Option<TrackWriter>,
    /// Absolute positions of the `duration` and `filesize` numbers.
    duration_pos: u64,
    filesize_pos: u64,
    /// Added to every timestamp, fixed by the first packet.
    offset: Option<i64>,
    end: i64,
    tags: u64,
}

impl OFlvFormat {
    fn track(&mut self, stream_index: usize) -> Option<&mut TrackWriter> {
        [self.video.as_mut(), self.audio.as_mut()]
            .into_iter()
            .flatten()
            .find(|t| t.index == stream_index)
    }

    /// `onMetaData` body. Returns it with the offsets of the `duration` and
    /// `filesize` values inside it.
    fn on_meta_data(&self, ctx: &OutputContext) -> (Vec<u8>, usize, usize) {
        let mut members: Vec<(String, AmfValue)> = Vec::new();
        let mut add = |key: &str, value: AmfValue| members.push((key.to_owned(), value));
        if let Some(video) = &self.video {
            let par = &ctx.streams[video.index].codecpar;
            add("width", AmfValue::Number(par.width as f64));
            add("height", AmfValue::Number(par.height as f64));
            if par.frame_rate.is_valid() {
                add("framerate", AmfValue::Number(par.frame_rate.to_f64()));
            }
            add("videocodecid", AmfValue::Number(video.codec.metadata_id()));
        }
        if let Some(audio) = &self.audio {
            let par = &ctx.streams[audio.index].codecpar;
            add("audiocodecid", AmfValue::Number(audio.codec.metadata_id()));
            add("audiosamplerate", AmfValue::Number(par.sample_rate as f64));
            let bits = if par.codec_id == CodecId::PcmU8 { 8.0 } else { 16.0 };
            add("audiosamplesize", AmfValue::Number(bits));
            add("stereo", AmfValue::Boolean(par.channels > 1));
        }
        add("encoder", AmfValue::String("avmux".to_owned()));
        for (key, value) in &ctx.metadata {
            if !matches!(key.as_str(), "duration" | "filesize") && !members.iter().any(|(k, _)| k == key) {
                members.push((key.clone(), AmfValue::String(value.clone())));
            }
        }

        let mut body = Vec::new();
        amf::write_string(&mut body, "onMetaData");
        amf::ecma_array_start(&mut body, members.len() as u32 + 2);
        amf::write_key(&mut body, "duration");
        let duration_at = body.len() + 1;
        amf::write_number(&mut body, 0.0);
        amf::write_key(&mut body, "filesize");
        let filesize_at = body.len() + 1;
        amf::write_number(&mut body, 0.0);
        for (key, value) in &members {
            amf::write_key(&mut body, key);
            value.write(&mut body);
        }
        amf::object_end(&mut body);
        (body, duration_at, filesize_at)
    }
}

impl OFormat for OFlvFormat {
    fn name(&self) -> &'static str {
        "flv"
    }

    fn init(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        self.video = None;
        self.audio = None;
        for (i, stream) in ctx.streams.iter_mut().enumerate() {
            stream.time_base = MILLI_TIME_BASE;
            let media_type = stream.codecpar.media_type;
            let slot = match media_type {
                MediaType::Video => &mut self.video,
                MediaType::Audio => &mut self.audio,
                _ => {
                    log::warn!("flv: {media_type:?} stream {i} cannot be stored, dropping it");
                    continue;
                }
            };
            if slot.is_some() {
                log::warn!("flv: only one {media_type:?} stream is stored, dropping stream {i}");
                continue;
            }
            let track = TrackWriter::new(i, media_type, &stream.codecpar)?;
            log::debug!("flv: stream {i} ({}) as {:?}", stream.codecpar.codec_id, track.codec);
            *slot = Some(track);
        }
        if self.video.is_none() && self.audio.is_none() {
            return Err(FormatError::params("flv: no audio or video stream to write"));
        }
        self.offset = None;
        self.end = 0;
        self.tags = 0;
        Ok(())
    }

    fn write_header(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        let start = ctx.io.pos();
        let mut flags = 0;
        if self.audio.is_some() {
            flags |= FLAG_AUDIO;
        }
        if self.video.is_some() {
            flags |= FLAG_VIDEO;
        }
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(SIGNATURE);
        out.extend_from_slice(&[1, flags]);
        out.extend_from_slice(&HEADER_SIZE.to_be_bytes());
        out.extend_from_slice(&[0; 4]);

        let (body, duration_at, filesize_at) = self.on_meta_data(ctx);
        let body_start = start + (out.len() + TAG_HEADER_SIZE) as u64;
        self.duration_pos = body_start + duration_at as u64;
        self.filesize_pos = body_start + filesize_at as u64;
        write_tag(&mut out, TAG_SCRIPT, 0, &body);

        for track in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            track.sequence_header(&mut out, 0);
        }
        ctx.io.write_all(&out)?;
        Ok(())
    }

    fn write_packet(&mut self, ctx: &mut OutputContext, packet: &Packet) -> Result<(), FormatError> {
        let dts = if packet.dts == NOPTS_VALUE { packet.pts } else { packet.dts };
        let offset = *self.offset.get_or_insert_with(|| {
            let offset = if dts != NOPTS_VALUE && dts < 0 { -dts } else { 0 };
            log::debug!("flv: timestamps shifted by {offset} ms");
            offset
        });
        let Some(track) = self.track(packet.stream_index) else {
            log::trace!("flv: packet for dropped stream {} ignored", packet.stream_index);
            return Ok(());
        };
        if packet.is_empty() && packet.new_extradata().is_none() {
            log::warn!("empty packet on stream {}, ignoring", packet.stream_index);
            return Ok(());
        }

        let mut out = Vec::new();
        let mut tags = 0;
        for filtered in track.filter(packet)? {
            track.frame(&mut out, &filtered, offset);
            tags += 1;
        }
        let end = match packet.pts {
            NOPTS_VALUE => track.last_dts,
            pts => pts + offset + packet.duration.max(0),
        };
        self.end = self.end.max(end);
        self.tags += tags;
        ctx.io.write_all(&out)?;
        Ok(())
    }

    fn write_trailer(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        let mut out = Vec::new();
        if let Some(video) = self.video.as_mut() {
            let body = video.codec.prefix(SEQUENCE_END, true, 0);
            write_tag(&mut out, TAG_VIDEO, video.last_dts.max(0), &body);
        }
        ctx.io.write_all(&out)?;

        let size = ctx.io.pos();
        let duration = self.end as f64 / 1000.0;
        if ctx.io.is_seekable() {
            ctx.io.patch(self.duration_pos, &duration.to_be_bytes())?;
            ctx.io.patch(self.filesize_pos, &(size as f64).to_be_bytes())?;
        } else {
            log::debug!("flv: output is not seekable, onMetaData keeps zero duration and size");
        }
        if log::log_enabled!(Level::Debug) {
            log::debug!("flv: {} frame tags, {duration:.3} s, {size} bytes", self.tags);
        }
        Ok(ctx.io.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::aac::{AudioSpecificConfig, OBJECT_TYPE_LC, write_adts_header};
    use crate::codecs::h264::AvcConfig;
    use crate::codecs::h264::tests::{PPS, SPS_320X240};
    use crate::codecs::nalu::{StartCodeMode, join_nalu_by_length, join_nalu_by_start_code};
    use crate::formats::flv::IFlvFormat;
    use crate::formats::{IFormat, InputContext};
    use crate::io::{IoReader, IoWriter};
    use crate::process::mux::MuxOptions;
    use crate::structs::packet::PacketFlags;
    use crate::structs::rational::Rational;
    use crate::structs::stream::Stream;

    const IDR: [u8; 5] = [0x65, 0x88, 0x84, 0x00, 0x33];

    fn avc_config() -> anyhow::Result<Vec<u8>> {
        Ok(AvcConfig::from_param_sets(vec![SPS_320X240.to_vec()], vec![PPS.to_vec()], vec![])?.to_bytes())
    }

    fn output(io: IoWriter) -> anyhow::Result<OutputContext> {
        let mut video = Stream::new(0, Rational::new(1, 1000));
        video.codecpar = CodecParameters::video(CodecId::H264, 320, 240);
        video.codecpar.frame_rate = Rational::new(25, 1);
        video.codecpar.extradata = avc_config()?;
        video.codecpar.bit_format = Some(BitFormat::Avcc);
        let mut audio = Stream::new(1, Rational::new(1, 1000));
        audio.codecpar = CodecParameters::audio(CodecId::Aac, 44100, 2);
        audio.codecpar.extradata = vec![0x12, 0x10];

        let mut ctx = OutputContext::new(io, MuxOptions::default());
        ctx.streams = vec![video, audio];
        ctx.metadata.insert("title".into(), "clip".into());
        Ok(ctx)
    }

    /// Six 40 ms frames with a two frame reorder delay, each followed by an
    /// AAC frame.
    fn write_frames(format: &mut OFlvFormat, ctx: &mut OutputContext) -> anyhow::Result<()> {
        for i in 0..6 {
            let mut video = Packet::from_vec(join_nalu_by_length(&[&IDR[..]], 4));
            video.stream_index = 0;
            video.dts = i * 40;
            video.pts = video.dts + 80;
            video.duration = 40;
            video.bit_format = Some(BitFormat::Avcc);
            if i == 0 {
                video.flags |= PacketFlags::KEY;
            }
            format.write_packet(ctx, &video)?;

            let mut audio = Packet::from_vec(vec![0x21, i as u8]);
            audio.stream_index = 1;
            audio.pts = i * 40;
            audio.dts = audio.pts;
            audio.flags |= PacketFlags::KEY;
            format.write_packet(ctx, &audio)?;
        }
        Ok(())
    }

    fn mux(ctx: &mut OutputContext) -> anyhow::Result<()> {
        let mut format = OFlvFormat::default();
        format.init(ctx)?;
        format.write_header(ctx)?;
        write_frames(&mut format, ctx)?;
        format.write_trailer(ctx)?;
        Ok(())
    }

    fn demux(data: Vec<u8>) -> anyhow::Result<(InputContext, Vec<Packet>)> {
        let mut ctx = InputContext::new(IoReader::from_bytes(data));
        let mut demuxer = IFlvFormat::default();
        demuxer.read_header(&mut ctx)?;
        let mut packets = Vec::new();
        loop {
            match demuxer.read_packet(&mut ctx) {
                Ok(packet) => packets.push(packet),
                Err(e) if e.is_eof() => break,
                Err(e) => return Err(e.into()),
            }
        }
        packets.retain(|p| !p.flags.contains(PacketFlags::END));
        Ok((ctx, packets))
    }

    #[test]
    fn demuxes_what_it_writes() -> anyhow::Result<()> {
        let mut ctx = output(IoWriter::buffer())?;
        mux(&mut ctx)?;
        let data = ctx.io.into_buffer().unwrap_or_default();
        assert_eq!(IFlvFormat::probe(&data), crate::formats::PROBE_SCORE_MAX);

        let (input, packets) = demux(data)?;
        assert_eq!(input.duration, 320);
        assert_eq!(input.metadata.get("encoder").map(String::as_str), Some("avmux"));
        assert_eq!(input.metadata.get("title").map(String::as_str), Some("clip"));
        assert_eq!(input.metadata.get("framerate").map(String::as_str), Some("25"));
        assert_eq!(input.streams.len(), 2);
        assert_eq!(input.streams[0].codecpar.extradata, avc_config()?);
        assert_eq!((input.streams[0].codecpar.width, input.streams[0].codecpar.height), (320, 240));
        assert_eq!(input.streams[1].codecpar.extradata, vec![0x12, 0x10]);

        let video: Vec<_> = packets.iter().filter(|p| p.stream_index == 0).collect();
        assert_eq!(video.len(), 6);
        assert_eq!((video[2].dts, video[2].pts), (80, 160));
        assert!(video[0].is_key() && !video[1].is_key());
        assert_eq!(video[0].data(), join_nalu_by_length(&[&IDR[..]], 4));
        let audio: Vec<_> = packets.iter().filter(|p| p.stream_index == 1).collect();
        assert_eq!(audio.len(), 6);
        assert_eq!(audio[3].data(), &[0x21, 3]);
        Ok(())
    }

    #[test]
    fn annexb_input_becomes_length_prefixed() -> anyhow::Result<()> {
        let mut ctx = output(IoWriter::buffer())?;
        ctx.streams.truncate(1);
        ctx.streams[0].codecpar.extradata.clear();
        ctx.streams[0].codecpar.bit_format = Some(BitFormat::AnnexB);
        let mut format = OFlvFormat::default();
        format.init(&mut ctx)?;
        format.write_header(&mut ctx)?;
        for i in 0..2 {
            let units: Vec<&[u8]> = if i == 0 { vec![&SPS_320X240[..], &PPS[..], &IDR[..]] } else { vec![&IDR[..]] };
            let mut packet = Packet::from_vec(join_nalu_by_start_code(&units, StartCodeMode::Long));
            packet.bit_format = Some(BitFormat::AnnexB);
            packet.pts = i * 40;
            packet.dts = packet.pts;
            packet.flags |= PacketFlags::KEY;
            format.write_packet(&mut ctx, &packet)?;
        }
        format.write_trailer(&mut ctx)?;

        let (input, packets) = demux(ctx.io.into_buffer().unwrap_or_default())?;
        assert_eq!(input.streams[0].codecpar.extradata, avc_config()?);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].data(), join_nalu_by_length(&[&IDR[..]], 4));
        assert_eq!(packets[1].bit_format, Some(BitFormat::Avcc));
        Ok(())
    }

    #[test]
    fn adts_input_is_unwrapped() -> anyhow::Result<()> {
        let mut ctx = output(IoWriter::buffer())?;
        ctx.streams.remove(0);
        ctx.streams[0].codecpar.extradata.clear();
        let mut format = OFlvFormat::default();
        format.init(&mut ctx)?;
        format.write_header(&mut ctx)?;
        let config = AudioSpecificConfig::new(OBJECT_TYPE_LC, 44100, 2);
        let mut adts = write_adts_header(&config, 4)?.to_vec();
        adts.extend_from_slice(&[1, 2, 3, 4]);
        let mut packet = Packet::from_vec(adts);
        packet.pts = 0;
        packet.dts = 0;
        format.write_packet(&mut ctx, &packet)?;
        format.write_trailer(&mut ctx)?;

        let (input, packets) = demux(ctx.io.into_buffer().unwrap_or_default())?;
        assert_eq!(input.streams[0].codecpar.extradata, vec![0x12, 0x10]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data(), &[1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn opus_uses_enhanced_audio_tags() -> anyhow::Result<()> {
        let mut stream = Stream::new(0, Rational::new(1, 1000));
        stream.codecpar = CodecParameters::audio(CodecId::Opus, 48000, 2);
        let mut ctx = OutputContext::new(IoWriter::buffer(), MuxOptions::default());
        ctx.streams = vec![stream];
        let mut format = OFlvFormat::default();
        format.init(&mut ctx)?;
        format.write_header(&mut ctx)?;
        let mut packet = Packet::from_vec(vec![0xFC, 0xFF, 0xFE]);
        packet.pts = 20;
        packet.dts = 20;
        format.write_packet(&mut ctx, &packet)?;
        format.write_trailer(&mut ctx)?;

        let (input, packets) = demux(ctx.io.into_buffer().unwrap_or_default())?;
        let par = &input.streams[0].codecpar;
        assert_eq!(par.codec_id, CodecId::Opus);
        assert_eq!(par.sample_rate, opus::SAMPLE_RATE);
        assert_eq!(par.channels, 2);
        assert!(par.extradata.starts_with(b"OpusHead"));
        assert_eq!(packets[0].data(), &[0xFC, 0xFF, 0xFE]);
        assert_eq!(packets[0].pts, 20);
        Ok(())
    }

    #[test]
    fn unsupported_codecs_are_rejected() {
        let mut stream = Stream::new(0, Rational::new(1, 1000));
        stream.codecpar = CodecParameters::audio(CodecId::PcmS16Le, 48000, 2);
        let mut ctx = OutputContext::new(IoWriter::buffer(), MuxOptions::default());
        ctx.streams = vec![stream];
        assert!(OFlvFormat::default().init(&mut ctx).is_err());

        ctx.streams[0].codecpar = CodecParameters::video(CodecId::Mpeg2Video, 720, 576);
        assert!(OFlvFormat::default().init(&mut ctx).is_err());
    }

    #[test]
    fn legacy_audio_flags() -> anyhow::Result<()> {
        assert_eq!(audio_codec(&CodecParameters::audio(CodecId::Aac, 48000, 2))?, TagCodec::Audio(0xAF));
        assert_eq!(audio_codec(&CodecParameters::audio(CodecId::Mp3, 8000, 1))?, TagCodec::Audio(0xE2));
        assert_eq!(audio_codec(&CodecParameters::audio(CodecId::PcmU8, 22050, 1))?, TagCodec::Audio(0x38));
        assert_eq!(audio_codec(&CodecParameters::audio(CodecId::PcmAlaw, 8000, 1))?, TagCodec::Audio(0x70));
        Ok(())
    }

    #[test]
    fn stream_output_keeps_placeholders() -> anyhow::Result<()> {
        let mut ctx = output(IoWriter::stream(std::io::sink()))?;
        mux(&mut ctx)?;
        assert!(ctx.io.pos() > 0);
        Ok(())
    }
}
