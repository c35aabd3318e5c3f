//! MP4 muxer.
//!
//! Three layouts, picked in `init`:
//! - streaming: `mdat` with a 64-bit size field written in place, size
//!   patched and `moov` appended by the trailer (seekable sinks);
//! - buffered: payload kept in memory, `moov` written before `mdat` once all
//!   chunk offsets are known (non-seekable sinks, `fast_start`);
//! - fragmented: `moov` with `mvex` ahead of `moof`/`mdat` pairs, closed by an
//!   `mfra` index.

use super::fragment::{
    TFHD_DEFAULT_BASE_IS_MOOF, TRUN_DATA_OFFSET, TRUN_SAMPLE_CTS, TRUN_SAMPLE_DURATION,
    TRUN_SAMPLE_FLAGS, TRUN_SAMPLE_SIZE,
};
use super::writer::{
    BoxBody, MediaHeader, MovieFragmentHeader, MovieFragmentRandomAccessOffset, MovieHeader,
    SoundMediaHeader, TrackExtends, TrackFragmentDecodeTime, TrackFragmentHeader, TrackHeader,
    VideoMediaHeader, chunk_offsets, container, ctts, dinf, edts, ftyp, full_box, hdlr,
    sample_entry, stsc, stss, stsz, stts,
};
use crate::codecs::NalCodec;
use crate::codecs::nalu::{is_annexb, split_nalu_by_start_code};
use crate::formats::{OFormat, OutputContext};
use crate::structs::packet::{BitFormat, Packet};
use crate::structs::rational::{MICRO_TIME_BASE, MPEGTS_TIME_BASE, NOPTS_VALUE, Rational, rescale};
use crate::structs::stream::{CodecId, CodecParameters, MediaType, Stream};
use crate::utils::errors::FormatError;

const MOVIE_TIMESCALE: u32 = 1000;
/// A new chunk starts once the current one holds this many bytes.
const MAX_CHUNK_SIZE: u64 = 1 << 20;
/// Fragment length for streams without keyframes to cut at.
const FRAGMENT_DURATION_US: i64 = 1_000_000;

const SAMPLE_FLAGS_KEY: u32 = 0x0200_0000;
const SAMPLE_FLAGS_NON_KEY: u32 = 0x0101_0000;
const TRUN_FLAGS: u32 =
    TRUN_DATA_OFFSET | TRUN_SAMPLE_DURATION | TRUN_SAMPLE_SIZE | TRUN_SAMPLE_FLAGS | TRUN_SAMPLE_CTS;

const SUPPORTED_CODECS: [CodecId; 7] = [
    CodecId::H264,
    CodecId::Hevc,
    CodecId::Vvc,
    CodecId::Aac,
    CodecId::Mp3,
    CodecId::Opus,
    CodecId::Flac,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Layout {
    #[default]
    Streaming,
    Buffered,
    Fragmented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MuxSample {
    size: u32,
    dts: i64,
    /// pts - dts
    cts: i64,
    duration: u32,
    key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chunk {
    /// Relative to the start of the `mdat` payload.
    offset: u64,
    samples: u32,
}

#[derive(Debug, Clone, Default)]
struct MuxTrack {
    track_id: u32,
    timescale: u32,
    first_dts: i64,
    samples: Vec<MuxSample>,
    chunks: Vec<Chunk>,
    /// First sample of the pending fragment.
    frag_start: usize,
    frag_data: Vec<u8>,
    /// `(decode time, moof position)` of every written fragment.
    frag_index: Vec<(u64, u64)>,
}

impl MuxTrack {
    fn new(track_id: u32, timescale: u32) -> Self {
        Self {
            track_id,
            timescale,
            first_dts: NOPTS_VALUE,
            ..Self::default()
        }
    }

    fn time_base(&self) -> Rational {
        Rational::new(1, self.timescale as i32)
    }

    fn pending(&self) -> &[MuxSample] {
        &self.samples[self.frag_start..]
    }

    /// Gives a trailing zero-duration sample its predecessor's duration.
    fn fill_last_duration(&mut self) {
        if let [.., prev, last] = self.samples.as_mut_slice() {
            if last.duration == 0 {
                last.duration = prev.duration;
            }
        }
    }

    fn media_duration(&self) -> u64 {
        self.samples.iter().map(|s| s.duration as u64).sum()
    }

    /// Media time of the first presented sample.
    fn presentation_offset(&self) -> i64 {
        self.samples
            .iter()
            .map(|s| s.dts - self.first_dts + s.cts)
            .min()
            .unwrap_or(0)
    }

    fn trak(
        &self,
        stream: &Stream,
        base: u64,
        fragmented: bool,
    ) -> Result<(Vec<u8>, u64), FormatError> {
        let par = &stream.codecpar;
        let media_duration = if fragmented { 0 } else { self.media_duration() };
        let movie_duration = rescale(
            media_duration as i64,
            self.time_base(),
            Rational::new(1, MOVIE_TIMESCALE as i32),
        ) as u64;

        let mut children = vec![TrackHeader::new(self.track_id, movie_duration, par).to_box()];
        let offset = self.presentation_offset();
        if offset != 0 {
            children.push(edts(movie_duration, offset));
        }

        let (handler, name, media_header) = match par.media_type {
            MediaType::Video => (
                b"vide",
                "VideoHandler",
                VideoMediaHeader {
                    version_flags: 1,
                    ..VideoMediaHeader::default()
                }
                .to_box(),
            ),
            _ => (b"soun", "SoundHandler", SoundMediaHeader::default().to_box()),
        };
        let stbl = self.stbl(par, base, fragmented)?;
        let minf = container(b"minf", &[media_header, dinf(), stbl]);
        children.push(container(
            b"mdia",
            &[
                MediaHeader::new(self.timescale, media_duration).to_box(),
                hdlr(handler, name),
                minf,
            ],
        ));
        Ok((container(b"trak", &children), movie_duration))
    }

    fn stbl(&self, par: &CodecParameters, base: u64, fragmented: bool) -> Result<Vec<u8>, FormatError> {
        if par.codec_id.is_nalu_based() && par.extradata.is_empty() {
            return Err(FormatError::invalid(format!(
                "track {}: {} without parameter sets",
                self.track_id, par.codec_id
            )));
        }
        let samples: &[MuxSample] = if fragmented { &[] } else { &self.samples };
        let chunks: &[Chunk] = if fragmented { &[] } else { &self.chunks };

        let durations: Vec<u32> = samples.iter().map(|s| s.duration).collect();
        let mut children = vec![sample_entry(self.track_id, par)?, stts(&durations)];
        if samples.iter().any(|s| s.cts != 0) {
            let offsets: Vec<i64> = samples.iter().map(|s| s.cts).collect();
            children.push(ctts(&offsets));
        }
        if par.media_type == MediaType::Video && samples.iter().any(|s| !s.key) {
            let sync: Vec<u32> = (1..)
                .zip(samples)
                .filter(|(_, s)| s.key)
                .map(|(n, _)| n)
                .collect();
            children.push(stss(&sync));
        }
        let counts: Vec<u32> = chunks.iter().map(|c| c.samples).collect();
        let sizes: Vec<u32> = samples.iter().map(|s| s.size).collect();
        let offsets: Vec<u64> = chunks.iter().map(|c| base + c.offset).collect();
        children.push(stsc(&counts));
        children.push(stsz(&sizes));
        children.push(chunk_offsets(&offsets));
        Ok(container(b"stbl", &children))
    }

    fn traf(&self, data_offset: u64) -> Result<Vec<u8>, FormatError> {
        let samples = self.pending();
        let tfhd = TrackFragmentHeader {
            version_flags: TFHD_DEFAULT_BASE_IS_MOOF,
            track_id: self.track_id,
        };
        let decode_time = samples.first().map_or(0, |s| s.dts - self.first_dts);
        let tfdt = TrackFragmentDecodeTime {
            version_flags: 1 << 24,
            base_media_decode_time: decode_time.max(0) as u64,
        };

        let data_offset = i32::try_from(data_offset)
            .map_err(|_| FormatError::unsupported("fragment too large for a trun data offset"))?;
        let mut trun = Vec::with_capacity(8 + samples.len() * 16);
        trun.extend_from_slice(&(samples.len() as u32).to_be_bytes());
        trun.extend_from_slice(&data_offset.to_be_bytes());
        for sample in samples {
            let flags = if sample.key { SAMPLE_FLAGS_KEY } else { SAMPLE_FLAGS_NON_KEY };
            trun.extend_from_slice(&sample.duration.to_be_bytes());
            trun.extend_from_slice(&sample.size.to_be_bytes());
            trun.extend_from_slice(&flags.to_be_bytes());
            trun.extend_from_slice(&(sample.cts as i32).to_be_bytes());
        }
        Ok(container(
            b"traf",
            &[tfhd.to_box(), tfdt.to_box(), full_box(b"trun", 1, TRUN_FLAGS, &trun)],
        ))
    }

    fn tfra(&self) -> Vec<u8> {
        let mut body = self.track_id.to_be_bytes().to_vec();
        // 1-byte traf, trun and sample numbers
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&(self.frag_index.len() as u32).to_be_bytes());
        for (time, pos) in &self.frag_index {
            body.extend_from_slice(&time.to_be_bytes());
            body.extend_from_slice(&pos.to_be_bytes());
            body.extend_from_slice(&[1, 1, 1]);
        }
        full_box(b"tfra", 1, 0, &body)
    }
}

fn mdat_header(payload_len: u64) -> Vec<u8> {
    if payload_len + 8 > u32::MAX as u64 {
        let mut header = 1u32.to_be_bytes().to_vec();
        header.extend_from_slice(b"mdat");
        header.extend_from_slice(&(payload_len + 16).to_be_bytes());
        header
    } else {
        let mut header = ((payload_len + 8) as u32).to_be_bytes().to_vec();
        header.extend_from_slice(b"mdat");
        header
    }
}

/// avcC/hvcC/vvcC from parameter sets given as an Annex B byte stream.
fn annexb_extradata(codec: NalCodec, extradata: &[u8]) -> Result<Vec<u8>, FormatError> {
    let nalus = split_nalu_by_start_code(extradata);
    codec.build_extradata(codec.collect_param_sets(&nalus))
}

#[derive(Debug, Default)]
pub struct OMovFormat {
    layout: Layout,
    tracks: Vec<MuxTrack>,
    /// Streaming layout: start of the 16-byte `mdat` header.
    mdat_pos: u64,
    payload_len: u64,
    /// Buffered layout: the whole `mdat` payload.
    buffer: Vec<u8>,
    last_track: Option<usize>,
    chunk_bytes: u64,
    sequence: u32,
    moov_written: bool,
    /// Track whose packets decide fragment boundaries.
    reference_track: usize,
}

impl OMovFormat {
    fn moov(&self, ctx: &OutputContext, base: u64) -> Result<Vec<u8>, FormatError> {
        let fragmented = self.layout == Layout::Fragmented;
        let mut traks = Vec::with_capacity(self.tracks.len());
        let mut duration = 0;
        for (track, stream) in self.tracks.iter().zip(&ctx.streams) {
            let (trak, track_duration) = track.trak(stream, base, fragmented)?;
            duration = duration.max(track_duration);
            traks.push(trak);
        }

        let next_track_id = self.tracks.len() as u32 + 1;
        let mut children = vec![MovieHeader::new(MOVIE_TIMESCALE, duration, next_track_id).to_box()];
        children.extend(traks);
        if fragmented {
            let trex: Vec<Vec<u8>> = self
                .tracks
                .iter()
                .map(|t| TrackExtends::new(t.track_id).to_box())
                .collect();
            children.push(container(b"mvex", &trex));
        }
        Ok(container(b"moov", &children))
    }

    /// Whether the packet about to be added to `index` opens a new fragment.
    fn starts_fragment(&self, ctx: &OutputContext, index: usize, dts: i64, key: bool) -> bool {
        if index != self.reference_track {
            return false;
        }
        let track = &self.tracks[index];
        let Some(first) = track.pending().first() else {
            return false;
        };
        if ctx.streams[index].codecpar.media_type == MediaType::Video {
            return key;
        }
        rescale(dts - first.dts, track.time_base(), MICRO_TIME_BASE) >= FRAGMENT_DURATION_US
    }

    fn flush_fragment(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        if self.tracks.iter().all(|t| t.pending().is_empty()) {
            return Ok(());
        }
        if !self.moov_written {
            let moov = self.moov(ctx, 0)?;
            ctx.io.write_all(&moov)?;
            self.moov_written = true;
        }
        for track in &mut self.tracks {
            track.fill_last_duration();
        }

        let sequence = self.sequence + 1;
        let payload_len: u64 = self.tracks.iter().map(|t| t.frag_data.len() as u64).sum();
        let header = mdat_header(payload_len);
        // The moof size does not depend on the offsets it carries.
        let probe = self.moof(sequence, 0)?;
        let moof = self.moof(sequence, (probe.len() + header.len()) as u64)?;

        let moof_pos = ctx.io.pos();
        ctx.io.write_all(&moof)?;
        ctx.io.write_all(&header)?;
        for track in &mut self.tracks {
            let Some(first) = track.pending().first() else {
                continue;
            };
            let decode_time = (first.dts - track.first_dts).max(0) as u64;
            track.frag_index.push((decode_time, moof_pos));
            ctx.io.write_all(&track.frag_data)?;
            track.frag_data.clear();
            track.frag_start = track.samples.len();
        }
        log::trace!("mov: fragment {sequence} at {moof_pos}, {payload_len} bytes");
        self.sequence = sequence;
        Ok(())
    }

    fn moof(&self, sequence: u32, data_start: u64) -> Result<Vec<u8>, FormatError> {
        let mfhd = MovieFragmentHeader {
            version_flags: 0,
            sequence_number: sequence,
        };
        let mut children = vec![mfhd.to_box()];
        let mut offset = data_start;
        for track in self.tracks.iter().filter(|t| !t.pending().is_empty()) {
            children.push(track.traf(offset)?);
            offset += track.frag_data.len() as u64;
        }
        Ok(container(b"moof", &children))
    }

    fn mfra(&self) -> Vec<u8> {
        let mut children: Vec<Vec<u8>> = self.tracks.iter().map(MuxTrack::tfra).collect();
        let size: usize = children.iter().map(Vec::len).sum::<usize>() + 8 + 16;
        let mfro = MovieFragmentRandomAccessOffset {
            version_flags: 0,
            mfra_size: size as u32,
        };
        children.push(mfro.to_box());
        container(b"mfra", &children)
    }

    fn append_chunked(&mut self, index: usize, size: u64) {
        let offset = self.payload_len;
        let track = &mut self.tracks[index];
        match track.chunks.last_mut() {
            Some(chunk)
                if self.last_track == Some(index) && self.chunk_bytes + size <= MAX_CHUNK_SIZE =>
            {
                chunk.samples += 1;
                self.chunk_bytes += size;
            }
            _ => {
                track.chunks.push(Chunk { offset, samples: 1 });
                self.chunk_bytes = size;
            }
        }
        self.last_track = Some(index);
        self.payload_len += size;
    }
}

impl OFormat for OMovFormat {
    fn name(&self) -> &'static str {
        "mov"
    }

    fn init(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        if ctx.streams.is_empty() {
            return Err(FormatError::params("mp4 needs at least one stream"));
        }
        self.tracks.clear();
        for (i, stream) in ctx.streams.iter_mut().enumerate() {
            let par = &mut stream.codecpar;
            if !SUPPORTED_CODECS.contains(&par.codec_id) {
                return Err(FormatError::unsupported(format!("{} in mp4", par.codec_id)));
            }
            if par.media_type == MediaType::Unknown {
                par.media_type = par.codec_id.media_type();
            }
            if let Some(codec) = NalCodec::from_codec_id(par.codec_id) {
                if is_annexb(&par.extradata) {
                    par.extradata = annexb_extradata(codec, &par.extradata)?;
                }
            }

            stream.time_base = match par.media_type {
                MediaType::Audio if par.sample_rate > 0 => Rational::new(1, par.sample_rate as i32),
                _ if stream.time_base.num == 1 && stream.time_base.den > 0 => stream.time_base,
                _ => MPEGTS_TIME_BASE,
            };
            self.tracks
                .push(MuxTrack::new(i as u32 + 1, stream.time_base.den as u32));
        }
        self.reference_track = ctx
            .streams
            .iter()
            .position(|s| s.codecpar.media_type == MediaType::Video)
            .unwrap_or(0);

        self.layout = if ctx.options.fragmented {
            Layout::Fragmented
        } else if ctx.io.is_seekable() && !ctx.options.fast_start {
            Layout::Streaming
        } else {
            Layout::Buffered
        };
        log::debug!("mov: {:?} layout, {} tracks", self.layout, self.tracks.len());
        Ok(())
    }

    fn write_header(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        let mut brands: Vec<&[u8; 4]> = vec![b"isom", b"iso2", b"mp41"];
        if ctx.streams.iter().any(|s| s.codecpar.codec_id == CodecId::H264) {
            brands.push(b"avc1");
        }
        if self.layout == Layout::Fragmented {
            brands.push(b"iso6");
        }
        ctx.io.write_all(&ftyp(b"isom", 0x200, &brands))?;

        if self.layout == Layout::Streaming {
            self.mdat_pos = ctx.io.pos();
            ctx.io.write_all(&mdat_header(u32::MAX as u64))?;
        }
        Ok(())
    }

    fn write_packet(&mut self, ctx: &mut OutputContext, packet: &Packet) -> Result<(), FormatError> {
        let index = packet.stream_index;
        if index >= self.tracks.len() {
            return Err(FormatError::params(format!("packet for unknown stream {index}")));
        }
        let par = &mut ctx.streams[index].codecpar;
        if let Some(extradata) = packet.new_extradata() {
            if self.moov_written {
                log::warn!("mov: stream {index} changed extradata after moov, ignored");
            } else {
                par.extradata = match NalCodec::from_codec_id(par.codec_id) {
                    Some(codec) if is_annexb(extradata) => annexb_extradata(codec, extradata)?,
                    _ => extradata.to_vec(),
                };
            }
        }
        if packet.is_empty() {
            log::warn!("empty packet on stream {index}, ignoring");
            return Ok(());
        }
        if par.codec_id.is_nalu_based() {
            let annexb = match packet.bit_format {
                Some(format) => format == BitFormat::AnnexB,
                None => is_annexb(packet.data()),
            };
            if annexb {
                return Err(FormatError::params(format!(
                    "stream {index}: annexb packets need the annexb2avcc filter"
                )));
            }
        }
        let size = u32::try_from(packet.size())
            .map_err(|_| FormatError::unsupported("sample larger than 4 GiB"))?;
        let key = par.media_type != MediaType::Video || packet.is_key();

        let track = &mut self.tracks[index];
        let dts = match (packet.dts, track.samples.last()) {
            (NOPTS_VALUE, Some(last)) => last.dts + last.duration as i64,
            (NOPTS_VALUE, None) => 0,
            (dts, _) => dts,
        };
        let pts = if packet.pts == NOPTS_VALUE { dts } else { packet.pts };
        match track.samples.last_mut() {
            Some(last) => last.duration = (dts - last.dts).clamp(0, u32::MAX as i64) as u32,
            None => track.first_dts = dts,
        }

        if self.layout == Layout::Fragmented && self.starts_fragment(ctx, index, dts, key) {
            self.flush_fragment(ctx)?;
        }

        let track = &mut self.tracks[index];
        track.samples.push(MuxSample {
            size,
            dts,
            cts: pts - dts,
            duration: packet.duration.clamp(0, u32::MAX as i64) as u32,
            key,
        });
        match self.layout {
            Layout::Fragmented => track.frag_data.extend_from_slice(packet.data()),
            Layout::Streaming => {
                ctx.io.write_all(packet.data())?;
                self.append_chunked(index, size as u64);
            }
            Layout::Buffered => {
                self.buffer.extend_from_slice(packet.data());
                self.append_chunked(index, size as u64);
            }
        }
        Ok(())
    }

    fn write_trailer(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        match self.layout {
            Layout::Streaming => {
                for track in &mut self.tracks {
                    track.fill_last_duration();
                }
                let payload_start = self.mdat_pos + 16;
                let mdat_size = 16 + self.payload_len;
                ctx.io.patch(self.mdat_pos + 8, &mdat_size.to_be_bytes())?;
                let moov = self.moov(ctx, payload_start)?;
                ctx.io.write_all(&moov)?;
            }
            Layout::Buffered => {
                for track in &mut self.tracks {
                    track.fill_last_duration();
                }
                let header = mdat_header(self.buffer.len() as u64);
                let start = ctx.io.pos() + header.len() as u64;
                // co64 grows the moov, which moves every offset again.
                let mut moov_len = 0;
                let moov = loop {
                    let moov = self.moov(ctx, start + moov_len)?;
                    if moov.len() as u64 == moov_len {
                        break moov;
                    }
                    moov_len = moov.len() as u64;
                };
                ctx.io.write_all(&moov)?;
                ctx.io.write_all(&header)?;
                ctx.io.write_all(&self.buffer)?;
                self.buffer = Vec::new();
            }
            Layout::Fragmented => {
                self.flush_fragment(ctx)?;
                if !self.moov_written {
                    let moov = self.moov(ctx, 0)?;
                    ctx.io.write_all(&moov)?;
                    self.moov_written = true;
                }
                let mfra = self.mfra();
                ctx.io.write_all(&mfra)?;
                log::debug!("mov: {} fragments", self.sequence);
            }
        }
        ctx.io.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::h264::AvcConfig;
    use crate::codecs::h264::tests::{PPS, SPS_320X240};
    use crate::formats::isobmff::demux::tests::{open, read_all};
    use crate::formats::{IFormat, SeekFlags};
    use crate::io::IoWriter;
    use crate::process::mux::MuxOptions;
    use crate::structs::packet::{PacketFlags, SideData};

    fn avc_stream() -> anyhow::Result<Stream> {
        let mut par = CodecParameters::video(CodecId::H264, 320, 240);
        par.extradata =
            AvcConfig::from_param_sets(vec![SPS_320X240.to_vec()], vec![PPS.to_vec()], vec![])?
                .to_bytes();
        let mut stream = Stream::new(0, Rational::new(1, 1000));
        stream.codecpar = par;
        Ok(stream)
    }

    fn aac_stream() -> Stream {
        let mut par = CodecParameters::audio(CodecId::Aac, 48000, 2);
        par.extradata = vec![0x11, 0x90];
        let mut stream = Stream::new(1, Rational::new(1, 1000));
        stream.codecpar = par;
        stream
    }

    fn packet(stream_index: usize, dts: i64, pts: i64, key: bool, fill: u8) -> Packet {
        let mut packet = Packet::from_vec(vec![0, 0, 0, 4, 0x65, fill, fill, fill]);
        packet.stream_index = stream_index;
        packet.dts = dts;
        packet.pts = pts;
        packet.bit_format = Some(BitFormat::Avcc);
        if key {
            packet.flags |= PacketFlags::KEY;
        }
        packet
    }

    fn mux(
        options: MuxOptions,
        streams: Vec<Stream>,
        packets: &[Packet],
    ) -> anyhow::Result<Vec<u8>> {
        let mut ctx = OutputContext::new(IoWriter::buffer(), options);
        ctx.streams = streams;
        let mut format = OMovFormat::default();
        format.init(&mut ctx)?;
        format.write_header(&mut ctx)?;
        for packet in packets {
            format.write_packet(&mut ctx, packet)?;
        }
        format.write_trailer(&mut ctx)?;
        Ok(ctx.io.into_buffer().unwrap())
    }

    fn find(data: &[u8], tag: &[u8; 4]) -> Option<usize> {
        data.windows(4).position(|w| w == tag)
    }

    #[test]
    fn streaming_round_trip() -> anyhow::Result<()> {
        let packets = [
            packet(0, 0, 40, true, 1),
            packet(1, 0, 0, true, 2),
            packet(0, 40, 120, false, 3),
            packet(0, 80, 80, false, 4),
            packet(1, 1024, 1024, true, 5),
        ];
        let out = mux(MuxOptions::default(), vec![avc_stream()?, aac_stream()], &packets)?;
        assert!(find(&out, b"mdat") < find(&out, b"moov"));
        assert_eq!(&out[4..12], b"ftypisom");

        let (mut format, mut ctx) = open(out)?;
        assert_eq!(ctx.streams.len(), 2);
        assert_eq!(ctx.streams[0].codecpar.codec_id, CodecId::H264);
        assert_eq!(ctx.streams[0].codecpar.width, 320);
        assert_eq!(ctx.streams[1].codecpar.sample_rate, 48000);
        assert_eq!(ctx.streams[1].time_base, Rational::new(1, 48000));

        let read = read_all(&mut format, &mut ctx)?;
        let video: Vec<_> = read
            .iter()
            .filter(|p| p.stream_index == 0)
            .map(|p| (p.dts, p.pts, p.is_key(), p.data()[5]))
            .collect();
        assert_eq!(
            video,
            [(-40, 0, true, 1), (0, 80, false, 3), (40, 40, false, 4)]
        );
        let audio: Vec<_> = read
            .iter()
            .filter(|p| p.stream_index == 1)
            .map(|p| (p.pts, p.data()[5]))
            .collect();
        assert_eq!(audio, [(0, 2), (1024, 5)]);
        Ok(())
    }

    #[test]
    fn fast_start_puts_moov_first() -> anyhow::Result<()> {
        let options = MuxOptions {
            fast_start: true,
            ..MuxOptions::default()
        };
        let packets: Vec<Packet> = (0..4)
            .map(|i| packet(0, i * 1024, i * 1024, true, i as u8))
            .collect();
        let mut audio = aac_stream();
        audio.index = 0;
        let out = mux(options, vec![audio], &packets)?;
        assert!(find(&out, b"moov") < find(&out, b"mdat"));

        let (mut format, mut ctx) = open(out)?;
        let read = read_all(&mut format, &mut ctx)?;
        let fills: Vec<u8> = read.iter().map(|p| p.data()[5]).collect();
        assert_eq!(fills, [0, 1, 2, 3]);
        assert_eq!(ctx.streams[0].duration, 4096);
        Ok(())
    }

    #[test]
    fn fragmented_round_trip() -> anyhow::Result<()> {
        let options = MuxOptions {
            fragmented: true,
            ..MuxOptions::default()
        };
        let packets: Vec<Packet> = (0..4)
            .map(|i| packet(0, i * 40, i * 40, i % 2 == 0, i as u8))
            .collect();
        let out = mux(options, vec![avc_stream()?], &packets)?;
        assert_eq!(out.windows(4).filter(|w| w == b"moof").count(), 2);
        assert_eq!(&out[out.len() - 12..out.len() - 8], b"mfro");

        let (mut format, mut ctx) = open(out)?;
        let read = read_all(&mut format, &mut ctx)?;
        let got: Vec<_> = read.iter().map(|p| (p.dts, p.is_key(), p.data()[5])).collect();
        assert_eq!(got, [(0, true, 0), (40, false, 1), (80, true, 2), (120, false, 3)]);

        format.seek(&mut ctx, 0, 100, SeekFlags::BACKWARD)?;
        assert_eq!(format.read_packet(&mut ctx)?.dts, 80);
        Ok(())
    }

    #[test]
    fn annexb_extradata_is_converted() -> anyhow::Result<()> {
        let mut stream = avc_stream()?;
        let mut annexb = vec![0, 0, 0, 1];
        annexb.extend_from_slice(&SPS_320X240);
        annexb.extend_from_slice(&[0, 0, 0, 1]);
        annexb.extend_from_slice(&PPS);
        stream.codecpar.extradata = annexb;

        let mut ctx = OutputContext::new(IoWriter::buffer(), MuxOptions::default());
        ctx.streams = vec![stream];
        OMovFormat::default().init(&mut ctx)?;
        assert_eq!(ctx.streams[0].codecpar.extradata[0], 1);
        assert_eq!(ctx.streams[0].time_base, Rational::new(1, 1000));
        Ok(())
    }

    #[test]
    fn rejects_unsupported_input() -> anyhow::Result<()> {
        let mut ctx = OutputContext::new(IoWriter::buffer(), MuxOptions::default());
        let mut pcm = Stream::new(0, Rational::new(1, 1000));
        pcm.codecpar = CodecParameters::audio(CodecId::PcmS16Le, 48000, 2);
        ctx.streams = vec![pcm];
        assert!(matches!(
            OMovFormat::default().init(&mut ctx),
            Err(FormatError::Unsupported(_))
        ));

        ctx.streams = vec![avc_stream()?];
        let mut format = OMovFormat::default();
        format.init(&mut ctx)?;
        format.write_header(&mut ctx)?;
        let mut annexb = Packet::from_vec(vec![0, 0, 0, 1, 0x65, 0]);
        annexb.bit_format = Some(BitFormat::AnnexB);
        assert!(format.write_packet(&mut ctx, &annexb).is_err());

        let mut update = Packet::new();
        update.add_side_data(SideData::NewExtradata(vec![1, 2, 3]));
        format.write_packet(&mut ctx, &update)?;
        assert_eq!(ctx.streams[0].codecpar.extradata, [1, 2, 3]);
        Ok(())
    }
}
