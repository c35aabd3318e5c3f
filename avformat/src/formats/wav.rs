//! RIFF/RIFX/RF64/BW64 WAVE demuxer and muxer.

use avmux_macros::{ToBytes, riff_chunk};

use super::{IFormat, InputContext, OFormat, OutputContext, PROBE_SCORE_MAX, PROBE_SCORE_PARTIAL, SeekFlags};
use crate::io::{IoReader, IoWriter};
use crate::structs::fourcc::FourCC;
use crate::structs::packet::{Packet, PacketFlags};
use crate::structs::rational::{MILLI_TIME_BASE, NOPTS_VALUE, Rational, gcd, rescale};
use crate::structs::stream::{CodecId, CodecParameters, MediaType, Stream};
use crate::utils::byteorder::WriteBytesLe;
use crate::utils::errors::{FormatError, IoError};

pub const WAVE_FORMAT_PCM: u16 = 0x0001;
pub const WAVE_FORMAT_ADPCM_MS: u16 = 0x0002;
pub const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
pub const WAVE_FORMAT_ALAW: u16 = 0x0006;
pub const WAVE_FORMAT_MULAW: u16 = 0x0007;
pub const WAVE_FORMAT_IMA_ADPCM: u16 = 0x0011;
pub const WAVE_FORMAT_MPEGLAYER3: u16 = 0x0055;
pub const WAVE_FORMAT_AAC: u16 = 0x00FF;
pub const WAVE_FORMAT_MPEG_HEAAC: u16 = 0x1610;
pub const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Bytes 4..16 shared by every `KSDATAFORMAT_SUBTYPE_*` GUID.
const KSDATAFORMAT_SUBTYPE_BASE: [u8; 12] = [
    0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
];

/// Sample frames per demuxed packet.
const PACKET_SAMPLES: u64 = 1024;

const DS64_SIZE: u32 = 28;

pub trait RiffChunk {
    fn chunk_id(&self) -> &[u8; 4];
    fn chunk_data(&self) -> Vec<u8>;

    fn to_chunk_bytes(&self) -> Vec<u8> {
        let data = self.chunk_data();
        let mut out = Vec::with_capacity(data.len() + 9);
        out.extend_from_slice(self.chunk_id());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&data);
        if data.len() % 2 == 1 {
            out.push(0);
        }
        out
    }

    fn write_chunk(&self, io: &mut IoWriter) -> Result<(), IoError> {
        io.write_all(&self.to_chunk_bytes())
    }
}

/// `WAVEFORMAT` with the PCM `wBitsPerSample` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ToBytes)]
#[riff_chunk(b"fmt ")]
pub struct WaveFormat {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ToBytes)]
#[riff_chunk(b"ds64")]
pub struct DataSize64 {
    pub riff_size: u64,
    pub data_size: u64,
    pub sample_count: u64,
    pub table_length: u32,
}

/// Placeholder reserving room for a `ds64` chunk.
#[derive(Debug, Clone, Copy, Default, ToBytes)]
#[riff_chunk(b"JUNK")]
pub struct Junk {
    pub reserved: [u8; DS64_SIZE as usize],
}

fn read_u16(io: &mut IoReader, big_endian: bool) -> Result<u16, IoError> {
    if big_endian { io.read_u16_be() } else { io.read_u16_le() }
}

fn read_u32(io: &mut IoReader, big_endian: bool) -> Result<u32, IoError> {
    if big_endian { io.read_u32_be() } else { io.read_u32_le() }
}

/// Maps a WAVE format tag to a codec.
pub fn codec_from_tag(tag: u16, bits: u32, big_endian: bool) -> CodecId {
    let endian = |le: CodecId, be: CodecId| if big_endian { be } else { le };
    match (tag, bits) {
        (WAVE_FORMAT_PCM, 8) => CodecId::PcmU8,
        (WAVE_FORMAT_PCM, 16) => endian(CodecId::PcmS16Le, CodecId::PcmS16Be),
        (WAVE_FORMAT_PCM, 24) => endian(CodecId::PcmS24Le, CodecId::PcmS24Be),
        (WAVE_FORMAT_PCM, 32) => endian(CodecId::PcmS32Le, CodecId::PcmS32Be),
        (WAVE_FORMAT_PCM, 64) => endian(CodecId::PcmS64Le, CodecId::PcmS64Be),
        (WAVE_FORMAT_IEEE_FLOAT, 32) => endian(CodecId::PcmF32Le, CodecId::PcmF32Be),
        (WAVE_FORMAT_IEEE_FLOAT, 64) => endian(CodecId::PcmF64Le, CodecId::PcmF64Be),
        (WAVE_FORMAT_ALAW, _) => CodecId::PcmAlaw,
        (WAVE_FORMAT_MULAW, _) => CodecId::PcmMulaw,
        (WAVE_FORMAT_ADPCM_MS, _) => CodecId::AdpcmMs,
        (WAVE_FORMAT_IMA_ADPCM, 8) => CodecId::AdpcmZork,
        (WAVE_FORMAT_IMA_ADPCM, _) => CodecId::AdpcmImaWav,
        (WAVE_FORMAT_MPEGLAYER3, _) => CodecId::Mp3,
        (WAVE_FORMAT_AAC | WAVE_FORMAT_MPEG_HEAAC, _) => CodecId::Aac,
        _ => CodecId::None,
    }
}

/// Format tag the muxer writes for `codec_id`.
fn tag_from_codec(codec_id: CodecId) -> Option<u16> {
    match codec_id {
        CodecId::PcmU8
        | CodecId::PcmS16Le
        | CodecId::PcmS24Le
        | CodecId::PcmS32Le
        | CodecId::PcmS64Le => Some(WAVE_FORMAT_PCM),
        CodecId::PcmF32Le | CodecId::PcmF64Le => Some(WAVE_FORMAT_IEEE_FLOAT),
        _ => None,
    }
}

/// Parses a `fmt ` chunk body of `size` bytes into `par`.
pub(crate) fn read_format_chunk(
    io: &mut IoReader,
    size: u32,
    big_endian: bool,
    par: &mut CodecParameters,
) -> Result<(), FormatError> {
    if size < 14 {
        return Err(FormatError::invalid(format!("fmt chunk of {size} bytes")));
    }
    let start = io.pos();
    let mut tag = read_u16(io, big_endian)?;
    par.channels = read_u16(io, big_endian)? as u32;
    par.sample_rate = read_u32(io, big_endian)?;
    par.bit_rate = read_u32(io, big_endian)? as i64 * 8;
    par.block_align = read_u16(io, big_endian)? as u32;
    par.bits_per_coded_sample = if size == 14 {
        8
    } else {
        read_u16(io, big_endian)? as u32
    };

    if tag == WAVE_FORMAT_EXTENSIBLE && size >= 40 {
        let _cb_size = read_u16(io, big_endian)?;
        par.bits_per_raw_sample = read_u16(io, big_endian)? as u32;
        par.channel_layout = read_u32(io, big_endian)? as u64;
        let guid: [u8; 16] = io.read_array()?;
        if guid[4..] == KSDATAFORMAT_SUBTYPE_BASE {
            tag = u16::from_le_bytes([guid[0], guid[1]]);
        } else {
            log::warn!("unknown WAVEFORMATEXTENSIBLE sub-format {guid:02x?}");
        }
        let rest = size as u64 - (io.pos() - start);
        if rest > 0 {
            par.extradata = io.read_bytes(rest as usize)?;
        }
    } else if size >= 18 {
        let cb_size = read_u16(io, big_endian)? as u64;
        let available = size as u64 - (io.pos() - start);
        if cb_size > 0 {
            par.extradata = io.read_bytes(cb_size.min(available) as usize)?;
        }
    }

    let consumed = io.pos() - start;
    if consumed < size as u64 {
        io.skip(size as u64 - consumed)?;
    }

    par.media_type = MediaType::Audio;
    par.codec_tag = FourCC::from_u32_be(tag as u32);
    par.codec_id = codec_from_tag(tag, par.bits_per_coded_sample, big_endian);
    if par.bits_per_raw_sample == 0 {
        par.bits_per_raw_sample = par.bits_per_coded_sample;
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct IWavFormat {
    data_start: u64,
    data_size: u64,
    sample_count: u64,
    block_align: u64,
    /// Bytes per second, used for compressed payloads.
    byte_rate: u64,
    sample_rate: u64,
    pcm: bool,
    current_pts: i64,
}

impl IWavFormat {
    fn data_end(&self) -> u64 {
        self.data_start + self.data_size
    }

    fn packet_bytes(&self) -> u64 {
        if self.pcm {
            PACKET_SAMPLES * self.block_align
        } else {
            // about 1/10 s of compressed data, whole blocks
            let target = (self.byte_rate / 10).max(self.block_align);
            target - target % self.block_align
        }
    }

    /// Timestamp of a byte offset inside the data chunk.
    fn pts_at(&self, pos: u64) -> i64 {
        let offset = pos.saturating_sub(self.data_start);
        if self.pcm {
            (offset / self.block_align) as i64
        } else if self.byte_rate > 0 {
            (offset as u128 * self.sample_rate as u128 / self.byte_rate as u128) as i64
        } else {
            0
        }
    }

    fn pos_of(&self, timestamp: i64) -> u64 {
        let timestamp = timestamp.max(0) as u64;
        let offset = if self.pcm {
            timestamp.saturating_mul(self.block_align)
        } else if self.sample_rate > 0 {
            let bytes = (timestamp as u128 * self.byte_rate as u128 / self.sample_rate as u128) as u64;
            bytes - bytes % self.block_align
        } else {
            0
        };
        (self.data_start + offset).min(self.data_end())
    }
}

impl IFormat for IWavFormat {
    fn name(&self) -> &'static str {
        "wav"
    }

    fn probe(buf: &[u8]) -> u8 {
        if buf.len() < 4 || !matches!(&buf[..4], b"RIFF" | b"RIFX" | b"RF64" | b"BW64") {
            return 0;
        }
        if buf.len() >= 12 && &buf[8..12] == b"WAVE" {
            PROBE_SCORE_MAX
        } else {
            PROBE_SCORE_PARTIAL
        }
    }

    fn read_header(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        let io = &mut ctx.io;
        let signature = io.read_fourcc()?;
        let (big_endian, is_rf64) = match signature.as_bytes() {
            b"RIFF" => (false, false),
            b"RF64" | b"BW64" => (false, true),
            b"RIFX" => (true, false),
            _ => return Err(FormatError::invalid(format!("not a WAVE file: {signature}"))),
        };
        let _riff_size = read_u32(io, big_endian)?;
        let form = io.read_fourcc()?;
        if form != b"WAVE" {
            return Err(FormatError::invalid(format!("invalid RIFF form type {form}")));
        }

        self.data_size = 0;
        self.sample_count = 0;
        if is_rf64 {
            let tag = io.read_fourcc()?;
            if tag != b"ds64" {
                return Err(FormatError::invalid(format!("expected ds64, found {tag}")));
            }
            let size = io.read_u32_le()?;
            if size < 24 {
                return Err(FormatError::invalid(format!("ds64 chunk of {size} bytes")));
            }
            let _riff_size = io.read_u64_le()?;
            self.data_size = io.read_u64_le()?;
            self.sample_count = io.read_u64_le()?;
            io.skip((size - 24) as u64)?;
        }

        let mut stream = Stream::new(0, Rational::new(1, 1));
        let file_size = io.size();
        let mut found_fmt = false;
        let mut found_data = false;

        while file_size == 0 || io.pos() + 8 <= file_size {
            let tag = match io.read_fourcc() {
                Ok(tag) => tag,
                Err(IoError::Eof(_)) if found_data => break,
                Err(e) => return Err(e.into()),
            };
            let size = read_u32(io, big_endian)?;
            log::trace!("wav chunk {tag} ({size} bytes) at {}", io.pos() - 8);

            match tag.as_bytes() {
                b"fmt " if !found_fmt => {
                    read_format_chunk(io, size, big_endian, &mut stream.codecpar)?;
                    found_fmt = true;
                }
                b"fmt " => {
                    log::warn!("more than one fmt chunk, ignoring");
                    io.skip(size as u64)?;
                }
                b"data" => {
                    self.data_start = io.pos();
                    found_data = true;
                    if self.data_size == 0 {
                        self.data_size = if size == u32::MAX && file_size > 0 {
                            file_size - self.data_start
                        } else {
                            size as u64
                        };
                    }
                    if file_size > 0 {
                        self.data_size = self.data_size.min(file_size - self.data_start);
                    }
                    if file_size == 0 || self.data_end() >= file_size {
                        break;
                    }
                    io.seek(self.data_end() + (self.data_size & 1))?;
                }
                _ => {
                    let padded = size as u64 + (size as u64 & 1);
                    if file_size > 0 && io.pos() + padded > file_size {
                        break;
                    }
                    io.skip(padded)?;
                }
            }
        }

        if !found_fmt {
            return Err(FormatError::invalid("no fmt chunk"));
        }
        if !found_data {
            return Err(FormatError::invalid("no data chunk"));
        }

        let par = &mut stream.codecpar;
        if par.sample_rate == 0 || par.channels == 0 {
            return Err(FormatError::invalid(format!(
                "invalid fmt: {} Hz, {} channels",
                par.sample_rate, par.channels
            )));
        }
        if par.codec_id == CodecId::None {
            crate::log_or_err!(
                ctx,
                log::Level::Warn,
                FormatError::unsupported(format!("WAVE format tag {}", par.codec_tag))
            );
        }
        if par.block_align == 0 {
            par.block_align = (par.channels * par.bits_per_coded_sample).div_ceil(8).max(1);
        }

        self.pcm = par.codec_id.is_pcm();
        self.block_align = par.block_align as u64;
        self.sample_rate = par.sample_rate as u64;
        self.byte_rate = (par.bit_rate / 8) as u64;
        if self.pcm {
            if par.bit_rate == 0 {
                par.bit_rate = self.block_align as i64 * self.sample_rate as i64 * 8;
                self.byte_rate = self.block_align * self.sample_rate;
            }
            par.frame_size = PACKET_SAMPLES as u32;
        }

        if self.sample_count == 0 {
            let bits = par.channels as u64 * par.bits_per_coded_sample as u64;
            if self.pcm && bits > 0 {
                self.sample_count = self.data_size * 8 / bits;
            } else if self.byte_rate > 0 {
                self.sample_count = self.data_size * self.sample_rate / self.byte_rate;
            }
        }

        stream.time_base = Rational::new(1, par.sample_rate as i32);
        stream.start_time = 0;
        if self.sample_count > 0 {
            stream.duration = self.sample_count as i64;
            ctx.duration = rescale(stream.duration, stream.time_base, MILLI_TIME_BASE);
        }
        log::info!(
            "wav: {} {} Hz, {} channels, {} samples",
            stream.codecpar.codec_id,
            stream.codecpar.sample_rate,
            stream.codecpar.channels,
            self.sample_count
        );
        ctx.add_stream(stream);

        self.current_pts = 0;
        ctx.io.seek(self.data_start)?;
        Ok(())
    }

    fn read_packet(&mut self, ctx: &mut InputContext) -> Result<Packet, FormatError> {
        let pos = ctx.io.pos();
        let data_end = self.data_end();
        if pos >= data_end {
            // surfaces an abort before end of stream
            ctx.io.seek(pos)?;
            return Err(FormatError::Eof);
        }
        let mut len = self.packet_bytes().min(data_end - pos);
        if len > self.block_align {
            len -= len % self.block_align;
        }

        let mut packet = ctx.read_packet_data(len as usize)?;
        packet.stream_index = 0;
        packet.pos = pos as i64;
        packet.pts = self.current_pts;
        packet.dts = self.current_pts;
        let next_pts = self.pts_at(pos + len);
        packet.duration = next_pts - self.current_pts;
        packet.flags = PacketFlags::KEY;
        self.current_pts = next_pts;
        Ok(packet)
    }

    fn seek(
        &mut self,
        ctx: &mut InputContext,
        _stream_index: usize,
        timestamp: i64,
        flags: SeekFlags,
    ) -> Result<(), FormatError> {
        let pos = if flags.contains(SeekFlags::BYTE) {
            let pos = (timestamp.max(0) as u64).clamp(self.data_start, self.data_end());
            let offset = pos - self.data_start;
            self.data_start + offset - offset % self.block_align
        } else {
            self.pos_of(timestamp)
        };
        ctx.io.seek(pos)?;
        self.current_pts = self.pts_at(pos);
        log::debug!("wav seek to {pos} (pts {})", self.current_pts);
        Ok(())
    }

    fn estimated_packet_count(&self, _ctx: &InputContext) -> Option<u64> {
        let per_packet = self.packet_bytes();
        (per_packet > 0).then(|| self.data_size.div_ceil(per_packet))
    }
}

#[derive(Debug)]
pub struct OWavFormat {
    ds64_pos: u64,
    data_pos: u64,
    block_align: u64,
    sample_count: u64,
    min_pts: i64,
    max_pts: i64,
    last_duration: i64,
}

impl Default for OWavFormat {
    fn default() -> Self {
        Self {
            ds64_pos: 0,
            data_pos: 0,
            block_align: 1,
            sample_count: 0,
            min_pts: i64::MAX,
            max_pts: 0,
            last_duration: 0,
        }
    }
}

impl OFormat for OWavFormat {
    fn name(&self) -> &'static str {
        "wav"
    }

    fn init(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        if ctx.streams.len() != 1 {
            return Err(FormatError::params(format!(
                "wav holds exactly one audio stream, got {}",
                ctx.streams.len()
            )));
        }
        let stream = &mut ctx.streams[0];
        let par = &mut stream.codecpar;
        if par.media_type != MediaType::Audio || par.sample_rate == 0 || par.channels == 0 {
            return Err(FormatError::params("wav needs an audio stream with rate and channels"));
        }
        let tag = tag_from_codec(par.codec_id)
            .ok_or_else(|| FormatError::unsupported(format!("{} in wav", par.codec_id)))?;
        par.codec_tag = FourCC::from_u32_be(tag as u32);
        if par.bits_per_coded_sample == 0 {
            par.bits_per_coded_sample = par.codec_id.pcm_bits().unwrap_or(16);
        }
        if par.block_align == 0 {
            let bits = par.bits_per_coded_sample as u64;
            par.block_align = (bits * par.channels as u64 / gcd(8, bits)) as u32;
        }
        if par.bit_rate == 0 {
            par.bit_rate = par.sample_rate as i64 * par.channels as i64 * par.bits_per_coded_sample as i64;
        }
        self.block_align = par.block_align as u64;
        stream.time_base = Rational::new(1, par.sample_rate as i32);
        Ok(())
    }

    fn write_header(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        let par = &ctx.streams[0].codecpar;
        let format = WaveFormat {
            format_tag: par.codec_tag.to_u32_be() as u16,
            channels: par.channels as u16,
            sample_rate: par.sample_rate,
            byte_rate: (par.bit_rate / 8) as u32,
            block_align: par.block_align as u16,
            bits_per_sample: par.bits_per_coded_sample as u16,
        };

        let io = &mut ctx.io;
        io.write_all(b"RIFF")?;
        io.write_u32_le(u32::MAX)?;
        io.write_all(b"WAVE")?;

        self.ds64_pos = io.pos();
        Junk::default().write_chunk(io)?;
        format.write_chunk(io)?;

        self.data_pos = io.pos();
        io.write_all(b"data")?;
        io.write_u32_le(u32::MAX)?;
        Ok(())
    }

    fn write_packet(&mut self, ctx: &mut OutputContext, packet: &Packet) -> Result<(), FormatError> {
        if packet.is_empty() {
            log::warn!("empty packet on stream {}, ignoring", packet.stream_index);
            return Ok(());
        }
        ctx.io.write_all(packet.data())?;

        if packet.pts != NOPTS_VALUE {
            self.min_pts = self.min_pts.min(packet.pts);
            self.max_pts = self.max_pts.max(packet.pts);
        }
        if packet.duration > 0 {
            self.last_duration = packet.duration;
        }
        self.sample_count += packet.size() as u64 / self.block_align;
        Ok(())
    }

    fn write_trailer(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        let io = &mut ctx.io;
        let mut data_size = io.pos() - self.data_pos - 8;
        if data_size % 2 == 1 {
            io.write_u8(0)?;
        }
        io.flush()?;

        if !io.is_seekable() {
            log::debug!("wav: sink is not seekable, sizes left open");
            return Ok(());
        }

        let file_size = io.pos();
        let rf64 = ctx.options.force_rf64 || file_size - 8 > u32::MAX as u64;
        if !rf64 {
            io.patch(4, &((file_size - 8) as u32).to_le_bytes())?;
            io.patch(self.data_pos + 4, &(data_size as u32).to_le_bytes())?;
        } else {
            let stream = &ctx.streams[0];
            let mut sample_count = self.sample_count;
            if sample_count == 0 && self.min_pts <= self.max_pts {
                sample_count = rescale(
                    self.max_pts - self.min_pts + self.last_duration,
                    stream.time_base,
                    Rational::new(1, stream.codecpar.sample_rate as i32),
                ) as u64;
            }
            data_size = data_size.min(file_size - self.data_pos - 8);
            let ds64 = DataSize64 {
                riff_size: file_size - 8,
                data_size,
                sample_count,
                table_length: 0,
            };
            io.patch(0, b"RF64")?;
            io.patch(self.ds64_pos, &ds64.to_chunk_bytes())?;
            log::debug!("wav: wrote RF64 with {data_size} data bytes");
        }
        io.flush()?;
        Ok(())
    }
}
