//! Sample descriptions (`stsd`) and codec configuration boxes.

use super::boxes::{track_index, track_mut, unsupported_version};
use super::context::MovContext;
use super::reader::{BoxHeader, finish_box, parse_children, read_box_header, read_full_box_header};
use crate::codecs::aac::AudioSpecificConfig;
use crate::codecs::flac::{METADATA_STREAMINFO, StreamInfo, parse_block_header};
use crate::codecs::{h264, hevc, vvc};
use crate::io::IoReader;
use crate::structs::fourcc::FourCC;
use crate::structs::packet::BitFormat;
use crate::structs::stream::{CodecId, CodecParameters, MediaType};
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::FormatError;

const AC3_CHANNELS: [u32; 8] = [2, 1, 2, 3, 3, 4, 4, 5];
const AC3_BIT_RATES: [i64; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];
const AC3_SAMPLE_RATES: [u32; 3] = [48000, 44100, 32000];

/// Codec for a sample entry type. PCM types that depend on the sample size
/// take it from `bits`.
pub fn codec_from_tag(tag: FourCC, bits: u32) -> CodecId {
    match &tag.0 {
        b"avc1" | b"avc3" => CodecId::H264,
        b"hvc1" | b"hev1" => CodecId::Hevc,
        b"vvc1" | b"vvi1" => CodecId::Vvc,
        b"m2v1" | b"mp2v" => CodecId::Mpeg2Video,
        b"mp4a" => CodecId::Aac,
        b".mp3" | b"ms\0U" => CodecId::Mp3,
        b"Opus" => CodecId::Opus,
        b"fLaC" => CodecId::Flac,
        b"ac-3" | b"sac3" => CodecId::Ac3,
        b"ec-3" => CodecId::Eac3,
        b"raw " => CodecId::PcmU8,
        b"alaw" => CodecId::PcmAlaw,
        b"ulaw" => CodecId::PcmMulaw,
        b"in24" => CodecId::PcmS24Be,
        b"in32" => CodecId::PcmS32Be,
        b"fl32" => CodecId::PcmF32Be,
        b"fl64" => CodecId::PcmF64Be,
        b"twos" | b"ipcm" => match bits {
            24 => CodecId::PcmS24Be,
            32 => CodecId::PcmS32Be,
            _ => CodecId::PcmS16Be,
        },
        b"sowt" => match bits {
            24 => CodecId::PcmS24Le,
            32 => CodecId::PcmS32Le,
            _ => CodecId::PcmS16Le,
        },
        _ => CodecId::None,
    }
}

/// Sample entry type for a codec, the reverse of [`codec_from_tag`].
pub fn tag_from_codec(codec_id: CodecId) -> Option<FourCC> {
    Some(FourCC::new(match codec_id {
        CodecId::H264 => b"avc1",
        CodecId::Hevc => b"hvc1",
        CodecId::Vvc => b"vvc1",
        CodecId::Aac | CodecId::Mp3 => b"mp4a",
        CodecId::Opus => b"Opus",
        CodecId::Flac => b"fLaC",
        CodecId::Ac3 => b"ac-3",
        CodecId::Eac3 => b"ec-3",
        _ => return None,
    }))
}

fn media_type_from_tag(tag: FourCC) -> MediaType {
    match &tag.0 {
        b"encv" => MediaType::Video,
        b"enca" | b"lpcm" | b"fpcm" | b"ipcm" => MediaType::Audio,
        b"tx3g" | b"text" | b"wvtt" | b"stpp" | b"c608" => MediaType::Subtitle,
        _ => codec_from_tag(tag, 16).media_type(),
    }
}

/// Little endian variant of a big endian PCM codec.
fn pcm_little_endian(codec_id: CodecId) -> CodecId {
    match codec_id {
        CodecId::PcmS16Be => CodecId::PcmS16Le,
        CodecId::PcmS24Be => CodecId::PcmS24Le,
        CodecId::PcmS32Be => CodecId::PcmS32Le,
        CodecId::PcmS64Be => CodecId::PcmS64Le,
        CodecId::PcmF32Be => CodecId::PcmF32Le,
        CodecId::PcmF64Be => CodecId::PcmF64Le,
        other => other,
    }
}

/// PCM codec of a QuickTime `lpcm` description.
fn lpcm_codec(bits: u32, flags: u32) -> CodecId {
    let float = flags & 0x1 != 0;
    let big_endian = flags & 0x2 != 0;
    let codec = match (float, bits) {
        (true, 32) => CodecId::PcmF32Be,
        (true, 64) => CodecId::PcmF64Be,
        (false, 8) => return CodecId::PcmU8,
        (false, 16) => CodecId::PcmS16Be,
        (false, 24) => CodecId::PcmS24Be,
        (false, 32) => CodecId::PcmS32Be,
        (false, 64) => CodecId::PcmS64Be,
        _ => return CodecId::None,
    };
    if big_endian { codec } else { pcm_little_endian(codec) }
}

pub fn stsd(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let index = track_index(ctx, track, header)?;
    let (version, _) = read_full_box_header(io)?;
    if version > 1 {
        return Err(unsupported_version(header, version));
    }
    let count = io.read_u32_be()?;
    for i in 0..count {
        if io.pos() + 8 > header.end() {
            break;
        }
        let entry = read_box_header(io, header.end())?;
        if i == 0 {
            sample_entry(io, ctx, index, &entry)?;
        } else {
            log::debug!("track {index}: ignoring extra sample entry '{}'", entry.kind);
        }
        finish_box(io, &entry)?;
    }
    Ok(())
}

fn sample_entry(
    io: &mut IoReader,
    ctx: &mut MovContext,
    index: usize,
    entry: &BoxHeader,
) -> Result<(), FormatError> {
    if entry.body_size() < 8 {
        return Err(FormatError::invalid(format!(
            "sample entry '{}' is {} bytes",
            entry.kind, entry.size
        )));
    }
    // reserved, data reference index
    io.skip(8)?;

    let track = &mut ctx.tracks[index];
    let par = &mut track.stream.codecpar;
    if matches!(par.media_type, MediaType::Unknown | MediaType::Data) {
        let inferred = media_type_from_tag(entry.kind);
        if inferred != MediaType::Unknown {
            par.media_type = inferred;
        }
    }
    par.codec_tag = entry.kind;

    let has_children = match par.media_type {
        MediaType::Video => {
            par.codec_id = codec_from_tag(entry.kind, 0);
            video_entry(io, par)?;
            if par.width == 0 && par.height == 0 {
                par.width = track.width;
                par.height = track.height;
            }
            true
        }
        MediaType::Audio => {
            audio_entry(io, par, entry.kind)?;
            true
        }
        _ => false,
    };

    if has_children {
        parse_children(io, ctx, Some(index), entry.end())?;
    }

    let track = &mut ctx.tracks[index];
    if matches!(&entry.kind.0, b"encv" | b"enca") {
        match track.original_format {
            Some(original) => {
                let par = &mut track.stream.codecpar;
                if par.codec_id == CodecId::None {
                    par.codec_id = codec_from_tag(original, par.bits_per_coded_sample);
                }
                par.codec_tag = original;
            }
            None => log::warn!("track {}: protected sample entry without 'frma'", track.track_id),
        }
    }

    let par = &mut track.stream.codecpar;
    if let Some(bits) = par.codec_id.pcm_bits() {
        par.bits_per_coded_sample = bits;
        if par.block_align == 0 {
            par.block_align = bits / 8 * par.channels;
        }
    }
    if par.codec_id == CodecId::None && par.media_type != MediaType::Subtitle {
        log::warn!(
            "track {}: unsupported sample entry '{}'",
            track.track_id,
            entry.kind
        );
    }
    Ok(())
}

fn video_entry(io: &mut IoReader, par: &mut CodecParameters) -> Result<(), FormatError> {
    // version, revision, vendor, temporal and spatial quality
    io.skip(16)?;
    par.width = io.read_u16_be()? as u32;
    par.height = io.read_u16_be()? as u32;
    // resolution, data size, frame count
    io.skip(14)?;
    let name_len = (io.read_u8()? as usize).min(31);
    let name = io.read_bytes(31)?;
    let name = String::from_utf8_lossy(&name[..name_len]).trim().to_string();
    if !name.is_empty() {
        log::trace!("compressor: {name}");
    }
    par.bits_per_coded_sample = io.read_u16_be()? as u32;
    io.skip(2)?;
    Ok(())
}

fn audio_entry(io: &mut IoReader, par: &mut CodecParameters, tag: FourCC) -> Result<(), FormatError> {
    let sound_version = io.read_u16_be()?;
    // revision, vendor
    io.skip(6)?;
    par.channels = io.read_u16_be()? as u32;
    par.bits_per_coded_sample = io.read_u16_be()? as u32;
    // compression id, packet size
    io.skip(4)?;
    par.sample_rate = io.read_u32_be()? >> 16;

    match sound_version {
        1 => {
            par.frame_size = io.read_u32_be()?;
            io.skip(4)?;
            par.block_align = io.read_u32_be()?;
            io.skip(4)?;
        }
        2 => {
            io.skip(4)?;
            par.sample_rate = io.read_f64_be()?.round() as u32;
            par.channels = io.read_u32_be()?;
            io.skip(4)?;
            par.bits_per_coded_sample = io.read_u32_be()?;
            let flags = io.read_u32_be()?;
            par.block_align = io.read_u32_be()?;
            par.frame_size = io.read_u32_be()?;
            if tag == b"lpcm" {
                par.codec_id = lpcm_codec(par.bits_per_coded_sample, flags);
                return Ok(());
            }
        }
        _ => {}
    }
    par.codec_id = codec_from_tag(tag, par.bits_per_coded_sample);
    Ok(())
}

/// Installs a codec configuration. Descriptions met after `moov` (in a
/// fragment) are held back for the next key packet.
fn set_extradata(ctx: &mut MovContext, index: usize, data: Vec<u8>) {
    let found_moov = ctx.found_moov;
    let track = &mut ctx.tracks[index];
    if found_moov {
        track.pending_extradata = Some(data);
    } else {
        track.stream.codecpar.extradata = data;
    }
}

fn body(io: &mut IoReader, header: &BoxHeader) -> Result<Vec<u8>, FormatError> {
    let len = header.end().saturating_sub(io.pos());
    Ok(io.read_bytes(len as usize)?)
}

/// `avcC`, `hvcC`, `vvcC`.
pub fn nal_config(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let index = track_index(ctx, track, header)?;
    let mut data = body(io, header)?;
    // vvcC is a full box, the record starts after version and flags.
    if header.kind == b"vvcC" && data.len() >= 4 {
        data.drain(..4);
    }

    let par = &mut ctx.tracks[index].stream.codecpar;
    match &header.kind.0 {
        b"avcC" => {
            let config = h264::AvcConfig::parse(&data)?;
            par.codec_id = CodecId::H264;
            par.profile = config.profile as i32;
            par.level = config.level as i32;
            if let Some(sps) = config.sps.first().and_then(|nalu| h264::Sps::parse(nalu).ok()) {
                if let Some(rate) = sps.frame_rate() {
                    par.frame_rate = rate;
                }
                par.video_delay = sps.max_num_reorder_frames.unwrap_or(0);
            }
        }
        b"hvcC" => {
            let config = hevc::HevcConfig::parse(&data)?;
            par.codec_id = CodecId::Hevc;
            par.profile = config.profile_idc as i32;
            par.level = config.level_idc as i32;
        }
        _ => {
            vvc::VvcConfig::parse(&data)?;
            par.codec_id = CodecId::Vvc;
        }
    }
    par.bit_format = Some(BitFormat::Avcc);
    set_extradata(ctx, index, data);
    Ok(())
}

fn read_descriptor_length(io: &mut IoReader) -> Result<u64, FormatError> {
    let mut len = 0u64;
    for _ in 0..4 {
        let c = io.read_u8()?;
        len = (len << 7) | (c & 0x7F) as u64;
        if c & 0x80 == 0 {
            break;
        }
    }
    Ok(len)
}

const ES_DESCR_TAG: u8 = 0x03;
const DEC_CONFIG_DESCR_TAG: u8 = 0x04;
const DEC_SPECIFIC_DESCR_TAG: u8 = 0x05;

fn codec_from_object_type(object_type: u8) -> Option<CodecId> {
    Some(match object_type {
        0x40 | 0x66..=0x68 => CodecId::Aac,
        0x69 | 0x6B => CodecId::Mp3,
        0x21 => CodecId::H264,
        0x23 => CodecId::Hevc,
        0x60..=0x65 => CodecId::Mpeg2Video,
        0xA5 => CodecId::Ac3,
        0xA6 => CodecId::Eac3,
        0xAD => CodecId::Opus,
        _ => return None,
    })
}

/// MPEG-4 elementary stream descriptor.
pub fn esds(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let index = track_index(ctx, track, header)?;
    read_full_box_header(io)?;

    let end = header.end();
    let mut extradata = None;
    while io.pos() + 2 <= end {
        let tag = io.read_u8()?;
        let len = read_descriptor_length(io)?;
        let descr_end = (io.pos() + len).min(end);
        match tag {
            ES_DESCR_TAG => {
                io.skip(2)?;
                let flags = io.read_u8()?;
                if flags & 0x80 != 0 {
                    io.skip(2)?;
                }
                if flags & 0x40 != 0 {
                    let url_len = io.read_u8()?;
                    io.skip(url_len as u64)?;
                }
                if flags & 0x20 != 0 {
                    io.skip(2)?;
                }
                // Nested descriptors follow in the same loop.
                continue;
            }
            DEC_CONFIG_DESCR_TAG => {
                let object_type = io.read_u8()?;
                // stream type, buffer size
                io.skip(4)?;
                let max_bitrate = io.read_u32_be()?;
                let avg_bitrate = io.read_u32_be()?;

                let par = &mut ctx.tracks[index].stream.codecpar;
                match codec_from_object_type(object_type) {
                    Some(codec) => par.codec_id = codec,
                    None => log::debug!("esds: unknown object type 0x{object_type:02X}"),
                }
                let bit_rate = if avg_bitrate > 0 { avg_bitrate } else { max_bitrate };
                par.bit_rate = bit_rate as i64;
                continue;
            }
            DEC_SPECIFIC_DESCR_TAG => {
                extradata = Some(io.read_bytes(len as usize)?);
            }
            _ => {}
        }
        io.seek(descr_end)?;
    }

    let Some(extradata) = extradata else {
        return Ok(());
    };
    let par = &mut ctx.tracks[index].stream.codecpar;
    if par.codec_id == CodecId::Aac {
        let config = AudioSpecificConfig::parse(&extradata)?;
        par.profile = config.object_type as i32;
        if config.sample_rate > 0 {
            par.sample_rate = config.sample_rate;
        }
        if config.channel_config > 0 {
            par.channels = config.channels();
        }
        par.frame_size = crate::codecs::aac::FRAME_SAMPLES;
    }
    set_extradata(ctx, index, extradata);
    Ok(())
}

/// Opus specific box, stored as an `OpusHead` header.
pub fn d_ops(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let index = track_index(ctx, track, header)?;
    let version = io.read_u8()?;
    if version != 0 {
        return Err(unsupported_version(header, version));
    }
    let channels = io.read_u8()?;
    let pre_skip = io.read_u16_be()?;
    let input_rate = io.read_u32_be()?;
    let gain = io.read_i16_be()?;
    let family = io.read_u8()?;
    let mapping = body(io, header)?;

    let mut head = Vec::with_capacity(19 + mapping.len());
    head.extend_from_slice(b"OpusHead");
    head.push(1);
    head.push(channels);
    head.extend_from_slice(&pre_skip.to_le_bytes());
    head.extend_from_slice(&input_rate.to_le_bytes());
    head.extend_from_slice(&gain.to_le_bytes());
    head.push(family);
    head.extend_from_slice(&mapping);

    let par = &mut ctx.tracks[index].stream.codecpar;
    par.codec_id = CodecId::Opus;
    par.channels = channels as u32;
    par.sample_rate = 48000;
    set_extradata(ctx, index, head);
    Ok(())
}

/// FLAC specific box; the STREAMINFO block becomes the extradata.
pub fn dfla(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let index = track_index(ctx, track, header)?;
    let (version, _) = read_full_box_header(io)?;
    if version != 0 {
        return Err(unsupported_version(header, version));
    }
    while io.pos() + 4 <= header.end() {
        let (last, kind, len) = parse_block_header(io.read_array::<4>()?);
        if kind == METADATA_STREAMINFO {
            let data = io.read_bytes(len)?;
            let info = StreamInfo::parse(&data)?;
            let par = &mut ctx.tracks[index].stream.codecpar;
            par.codec_id = CodecId::Flac;
            par.sample_rate = info.sample_rate;
            par.channels = info.channels as u32;
            par.bits_per_raw_sample = info.bits_per_sample as u32;
            if info.min_block_size == info.max_block_size {
                par.frame_size = info.max_block_size as u32;
            }
            set_extradata(ctx, index, data);
        } else {
            io.skip(len as u64)?;
        }
        if last {
            break;
        }
    }
    Ok(())
}

/// Sample rate, channel count and bit rate code of a `dac3` payload.
fn ac3_parse(data: &[u8]) -> std::io::Result<(u32, u32, u8)> {
    let mut bs = BsIoSliceReader::from_slice(data);
    let fscod = bs.get_n::<u8>(2)?;
    // bsid, bsmod
    bs.skip_n(8)?;
    let acmod = bs.get_n::<u8>(3)?;
    let lfeon = bs.get()?;
    let bit_rate_code = bs.get_n::<u8>(5)?;
    let channels = AC3_CHANNELS[acmod as usize] + lfeon as u32;
    Ok((
        AC3_SAMPLE_RATES.get(fscod as usize).copied().unwrap_or(0),
        channels,
        bit_rate_code,
    ))
}

pub fn dac3(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let index = track_index(ctx, track, header)?;
    let data = body(io, header)?;
    let (sample_rate, channels, bit_rate_code) =
        ac3_parse(&data).map_err(|e| FormatError::invalid(format!("dac3: {e}")))?;

    let par = &mut ctx.tracks[index].stream.codecpar;
    par.codec_id = CodecId::Ac3;
    if sample_rate > 0 {
        par.sample_rate = sample_rate;
    }
    par.channels = channels;
    if let Some(rate) = AC3_BIT_RATES.get(bit_rate_code as usize) {
        par.bit_rate = rate * 1000;
    }
    par.frame_size = 1536;
    Ok(())
}

pub fn dec3(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let index = track_index(ctx, track, header)?;
    let data = body(io, header)?;
    let parse = |data: &[u8]| -> std::io::Result<(u32, u32)> {
        let mut bs = BsIoSliceReader::from_slice(data);
        let data_rate = bs.get_n::<u32>(13)?;
        // num_ind_sub, fscod, bsid, reserved, asvc, bsmod
        bs.skip_n(3 + 2 + 5 + 1 + 1 + 3)?;
        let acmod = bs.get_n::<u8>(3)?;
        let lfeon = bs.get()?;
        Ok((data_rate, AC3_CHANNELS[acmod as usize] + lfeon as u32))
    };
    let (data_rate, channels) = parse(&data).map_err(|e| FormatError::invalid(format!("dec3: {e}")))?;

    let par = &mut ctx.tracks[index].stream.codecpar;
    par.codec_id = CodecId::Eac3;
    par.channels = channels;
    par.bit_rate = data_rate as i64 * 1000;
    par.frame_size = 1536;
    Ok(())
}

/// Bit rate box.
pub fn btrt(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    // buffer size
    io.skip(4)?;
    let max_bitrate = io.read_u32_be()?;
    let avg_bitrate = io.read_u32_be()?;
    let par = &mut track_mut(ctx, track, header)?.stream.codecpar;
    if par.bit_rate == 0 {
        let bit_rate = if avg_bitrate > 0 { avg_bitrate } else { max_bitrate };
        par.bit_rate = bit_rate as i64;
    }
    Ok(())
}

/// QuickTime endianness atom inside `wave`.
pub fn enda(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let little_endian = io.read_u16_be()? == 1;
    let par = &mut track_mut(ctx, track, header)?.stream.codecpar;
    if little_endian {
        par.codec_id = pcm_little_endian(par.codec_id);
    }
    Ok(())
}

/// ISO/IEC 23003-5 PCM configuration.
pub fn pcm_c(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    read_full_box_header(io)?;
    let little_endian = io.read_u8()? & 0x1 != 0;
    let bits = io.read_u8()? as u32;

    let par = &mut track_mut(ctx, track, header)?.stream.codecpar;
    let codec = match (&par.codec_tag.0, bits) {
        (b"fpcm", 32) => CodecId::PcmF32Be,
        (b"fpcm", 64) => CodecId::PcmF64Be,
        (b"ipcm", 16) => CodecId::PcmS16Be,
        (b"ipcm", 24) => CodecId::PcmS24Be,
        (b"ipcm", 32) => CodecId::PcmS32Be,
        _ => {
            return Err(FormatError::unsupported(format!(
                "pcmC: {bits} bit '{}'",
                par.codec_tag
            )));
        }
    };
    par.codec_id = if little_endian { pcm_little_endian(codec) } else { codec };
    par.bits_per_coded_sample = bits;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::formats::isobmff::context::TrackContext;
    use crate::formats::isobmff::reader::parse_box;
    use crate::formats::isobmff::reader::tests::{full_box, mp4_box};

    /// `mp4a` entry for AAC-LC.
    pub(crate) fn mp4a_entry(sample_rate: u32, channels: u16, asc: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; 6];
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&[0; 8]);
        body.extend_from_slice(&channels.to_be_bytes());
        body.extend_from_slice(&16u16.to_be_bytes());
        body.extend_from_slice(&[0; 4]);
        body.extend_from_slice(&(sample_rate << 16).to_be_bytes());

        let mut dsi = vec![DEC_SPECIFIC_DESCR_TAG, asc.len() as u8];
        dsi.extend_from_slice(asc);
        let mut dcd = vec![DEC_CONFIG_DESCR_TAG, (13 + dsi.len()) as u8, 0x40, 0x15, 0, 0, 0];
        dcd.extend_from_slice(&128_000u32.to_be_bytes());
        dcd.extend_from_slice(&128_000u32.to_be_bytes());
        dcd.extend_from_slice(&dsi);
        let mut es = vec![ES_DESCR_TAG, (3 + dcd.len() + 3) as u8, 0, 1, 0];
        es.extend_from_slice(&dcd);
        es.extend_from_slice(&[0x06, 0x01, 0x02]);
        body.extend_from_slice(&full_box(b"esds", 0, 0, &es));
        mp4_box(b"mp4a", &body)
    }

    pub(crate) fn avc1_entry(width: u16, height: u16, avcc: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; 6];
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&[0; 16]);
        body.extend_from_slice(&width.to_be_bytes());
        body.extend_from_slice(&height.to_be_bytes());
        body.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        body.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        body.extend_from_slice(&[0; 4]);
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&[0; 32]);
        body.extend_from_slice(&24u16.to_be_bytes());
        body.extend_from_slice(&(-1i16).to_be_bytes());
        body.extend_from_slice(&mp4_box(b"avcC", avcc));
        mp4_box(b"avc1", &body)
    }

    pub(crate) fn stsd_box(entry: &[u8]) -> Vec<u8> {
        let mut body = 1u32.to_be_bytes().to_vec();
        body.extend_from_slice(entry);
        full_box(b"stsd", 0, 0, &body)
    }

    fn parse_stsd(entry: &[u8], handler: MediaType) -> anyhow::Result<MovContext> {
        let mut ctx = MovContext::default();
        let mut track = TrackContext::new(0);
        track.stream.codecpar.media_type = handler;
        ctx.tracks.push(track);

        let data = stsd_box(entry);
        let end = data.len() as u64;
        let mut io = IoReader::from_bytes(data);
        let header = read_box_header(&mut io, end)?;
        parse_box(&mut io, &mut ctx, Some(0), &header)?;
        assert_eq!(io.pos(), end);
        Ok(ctx)
    }

    #[test]
    fn aac_entry() -> anyhow::Result<()> {
        let ctx = parse_stsd(&mp4a_entry(44100, 2, &[0x12, 0x10]), MediaType::Audio)?;
        let par = &ctx.tracks[0].stream.codecpar;
        assert_eq!(par.codec_id, CodecId::Aac);
        assert_eq!(par.codec_tag, b"mp4a");
        assert_eq!(par.sample_rate, 44100);
        assert_eq!(par.channels, 2);
        assert_eq!(par.bit_rate, 128_000);
        assert_eq!(par.extradata, vec![0x12, 0x10]);
        Ok(())
    }

    #[test]
    fn avc_entry_without_handler() -> anyhow::Result<()> {
        let avcc = crate::codecs::NalCodec::H264.build_extradata(crate::codecs::ParamSets {
            sps: vec![h264::tests::SPS_320X240.to_vec()],
            pps: vec![h264::tests::PPS.to_vec()],
            ..Default::default()
        })?;
        let ctx = parse_stsd(&avc1_entry(320, 240, &avcc), MediaType::Unknown)?;
        let par = &ctx.tracks[0].stream.codecpar;
        assert_eq!(par.media_type, MediaType::Video);
        assert_eq!(par.codec_id, CodecId::H264);
        assert_eq!((par.width, par.height), (320, 240));
        assert_eq!(par.bit_format, Some(BitFormat::Avcc));
        assert_eq!(par.extradata, avcc);
        Ok(())
    }

    #[test]
    fn opus_head_from_dops() -> anyhow::Result<()> {
        let mut body = vec![0u8; 6];
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&[0; 8]);
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&16u16.to_be_bytes());
        body.extend_from_slice(&[0; 4]);
        body.extend_from_slice(&(48000u32 << 16).to_be_bytes());
        body.extend_from_slice(&mp4_box(b"dOps", &[0, 2, 0x01, 0x38, 0, 0, 0xBB, 0x80, 0, 0, 0]));
        let ctx = parse_stsd(&mp4_box(b"Opus", &body), MediaType::Audio)?;

        let par = &ctx.tracks[0].stream.codecpar;
        assert_eq!(par.codec_id, CodecId::Opus);
        assert_eq!(&par.extradata[..8], b"OpusHead");
        assert_eq!(par.extradata[9], 2);
        assert_eq!(&par.extradata[10..12], &312u16.to_le_bytes());
        assert_eq!(&par.extradata[12..16], &48000u32.to_le_bytes());
        Ok(())
    }

    #[test]
    fn pcm_tags() {
        assert_eq!(codec_from_tag(FourCC::new(b"sowt"), 24), CodecId::PcmS24Le);
        assert_eq!(codec_from_tag(FourCC::new(b"twos"), 16), CodecId::PcmS16Be);
        assert_eq!(lpcm_codec(32, 0x1), CodecId::PcmF32Le);
        assert_eq!(lpcm_codec(24, 0x2 | 0x4), CodecId::PcmS24Be);
        assert_eq!(tag_from_codec(CodecId::Mp3), Some(FourCC::new(b"mp4a")));
    }
}
