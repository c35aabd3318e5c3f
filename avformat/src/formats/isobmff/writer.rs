//! Box serialization for the MP4 muxer.
//!
//! Fixed-layout bodies are plain structs deriving [`ToBytes`] with a
//! `#[box_type]` attribute; variable ones are assembled by the functions at
//! the bottom of this file.

use avmux_macros::{ToBytes, box_type};

use crate::codecs::flac::{METADATA_STREAMINFO, STREAMINFO_SIZE};
use crate::structs::stream::{CodecId, CodecParameters, MediaType};
use crate::utils::byteorder::{U24, WriteBytesBe};
use crate::utils::errors::FormatError;

/// Unity transform of `mvhd`/`tkhd`.
pub const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// `und` packed as an ISO-639-2/T language code.
pub const LANGUAGE_UNDEFINED: u16 = 0x55C4;

pub trait BoxBody {
    fn box_type(&self) -> &[u8; 4];
    fn box_data(&self) -> Vec<u8>;

    fn to_box(&self) -> Vec<u8> {
        make_box(self.box_type(), &self.box_data())
    }
}

/// Frames `body` as a box, with a 64-bit size when it does not fit in 32.
pub fn make_box(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let size = body.len() as u64 + 8;
    let mut out = Vec::with_capacity(body.len() + 16);
    if size > u32::MAX as u64 {
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(&(size + 8).to_be_bytes());
    } else {
        out.extend_from_slice(&(size as u32).to_be_bytes());
        out.extend_from_slice(kind);
    }
    out.extend_from_slice(body);
    out
}

pub fn full_box(kind: &[u8; 4], version: u8, flags: u32, body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(body.len() + 4);
    data.push(version);
    U24(flags).write_be(&mut data);
    data.extend_from_slice(body);
    make_box(kind, &data)
}

pub fn container(kind: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
    make_box(kind, &children.concat())
}

fn version_flags(version: u8, flags: u32) -> u32 {
    ((version as u32) << 24) | (flags & 0x00FF_FFFF)
}

#[derive(Debug, Clone, ToBytes)]
#[box_type(b"mvhd")]
pub struct MovieHeader {
    pub version_flags: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub timescale: u32,
    pub duration: u64,
    pub rate: u32,
    pub volume: u16,
    pub reserved: [u8; 10],
    pub matrix: [u32; 9],
    pub pre_defined: [u32; 6],
    pub next_track_id: u32,
}

impl MovieHeader {
    pub fn new(timescale: u32, duration: u64, next_track_id: u32) -> Self {
        Self {
            version_flags: version_flags(1, 0),
            creation_time: 0,
            modification_time: 0,
            timescale,
            duration,
            rate: 0x0001_0000,
            volume: 0x0100,
            reserved: [0; 10],
            matrix: UNITY_MATRIX,
            pre_defined: [0; 6],
            next_track_id,
        }
    }
}

#[derive(Debug, Clone, ToBytes)]
#[box_type(b"tkhd")]
pub struct TrackHeader {
    pub version_flags: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub track_id: u32,
    pub reserved: u32,
    pub duration: u64,
    pub reserved2: [u32; 2],
    pub layer: i16,
    pub alternate_group: i16,
    pub volume: i16,
    pub reserved3: u16,
    pub matrix: [u32; 9],
    /// 16.16 fixed point.
    pub width: u32,
    pub height: u32,
}

impl TrackHeader {
    /// Enabled, in-movie track header.
    pub fn new(track_id: u32, duration: u64, par: &CodecParameters) -> Self {
        let is_audio = par.media_type == MediaType::Audio;
        Self {
            version_flags: version_flags(1, 0x3),
            creation_time: 0,
            modification_time: 0,
            track_id,
            reserved: 0,
            duration,
            reserved2: [0; 2],
            layer: 0,
            alternate_group: if is_audio { 1 } else { 0 },
            volume: if is_audio { 0x0100 } else { 0 },
            reserved3: 0,
            matrix: UNITY_MATRIX,
            width: par.width << 16,
            height: par.height << 16,
        }
    }
}

#[derive(Debug, Clone, ToBytes)]
#[box_type(b"mdhd")]
pub struct MediaHeader {
    pub version_flags: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub timescale: u32,
    pub duration: u64,
    pub language: u16,
    pub pre_defined: u16,
}

impl MediaHeader {
    pub fn new(timescale: u32, duration: u64) -> Self {
        Self {
            version_flags: version_flags(1, 0),
            creation_time: 0,
            modification_time: 0,
            timescale,
            duration,
            language: LANGUAGE_UNDEFINED,
            pre_defined: 0,
        }
    }
}

#[derive(Debug, Clone, Default, ToBytes)]
#[box_type(b"vmhd")]
pub struct VideoMediaHeader {
    pub version_flags: u32,
    pub graphics_mode: u16,
    pub opcolor: [u16; 3],
}

#[derive(Debug, Clone, Default, ToBytes)]
#[box_type(b"smhd")]
pub struct SoundMediaHeader {
    pub version_flags: u32,
    pub balance: i16,
    pub reserved: u16,
}

#[derive(Debug, Clone, Default, ToBytes)]
#[box_type(b"trex")]
pub struct TrackExtends {
    pub version_flags: u32,
    pub track_id: u32,
    pub sample_description_index: u32,
    pub sample_duration: u32,
    pub sample_size: u32,
    pub sample_flags: u32,
}

#[derive(Debug, Clone, Default, ToBytes)]
#[box_type(b"mfhd")]
pub struct MovieFragmentHeader {
    pub version_flags: u32,
    pub sequence_number: u32,
}

#[derive(Debug, Clone, Default, ToBytes)]
#[box_type(b"tfhd")]
pub struct TrackFragmentHeader {
    pub version_flags: u32,
    pub track_id: u32,
}

#[derive(Debug, Clone, Default, ToBytes)]
#[box_type(b"tfdt")]
pub struct TrackFragmentDecodeTime {
    pub version_flags: u32,
    pub base_media_decode_time: u64,
}

#[derive(Debug, Clone, Default, ToBytes)]
#[box_type(b"mfro")]
pub struct MovieFragmentRandomAccessOffset {
    pub version_flags: u32,
    pub mfra_size: u32,
}

impl TrackExtends {
    pub fn new(track_id: u32) -> Self {
        Self {
            track_id,
            sample_description_index: 1,
            ..Self::default()
        }
    }
}

pub fn ftyp(major: &[u8; 4], minor_version: u32, compatible: &[&[u8; 4]]) -> Vec<u8> {
    let mut body = major.to_vec();
    body.extend_from_slice(&minor_version.to_be_bytes());
    for brand in compatible {
        body.extend_from_slice(*brand);
    }
    make_box(b"ftyp", &body)
}

pub fn hdlr(handler: &[u8; 4], name: &str) -> Vec<u8> {
    let mut body = vec![0u8; 4];
    body.extend_from_slice(handler);
    body.extend_from_slice(&[0u8; 12]);
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    full_box(b"hdlr", 0, 0, &body)
}

/// `dinf` with a self-contained `url ` reference.
pub fn dinf() -> Vec<u8> {
    let url = full_box(b"url ", 0, 1, &[]);
    let mut dref = 1u32.to_be_bytes().to_vec();
    dref.extend_from_slice(&url);
    container(b"dinf", &[full_box(b"dref", 0, 0, &dref)])
}

/// Run-length `(count, delta)` pairs of `values`.
pub fn run_lengths<T: Copy + PartialEq>(values: impl IntoIterator<Item = T>) -> Vec<(u32, T)> {
    let mut runs: Vec<(u32, T)> = Vec::new();
    for value in values {
        match runs.last_mut() {
            Some((count, last)) if *last == value => *count += 1,
            _ => runs.push((1, value)),
        }
    }
    runs
}

pub fn stts(durations: &[u32]) -> Vec<u8> {
    let runs = run_lengths(durations.iter().copied());
    let mut body = (runs.len() as u32).to_be_bytes().to_vec();
    for (count, delta) in runs {
        body.extend_from_slice(&count.to_be_bytes());
        body.extend_from_slice(&delta.to_be_bytes());
    }
    full_box(b"stts", 0, 0, &body)
}

/// Composition offsets; version 1 when any offset is negative.
pub fn ctts(offsets: &[i64]) -> Vec<u8> {
    let version = u8::from(offsets.iter().any(|&o| o < 0));
    let runs = run_lengths(offsets.iter().copied());
    let mut body = (runs.len() as u32).to_be_bytes().to_vec();
    for (count, offset) in runs {
        body.extend_from_slice(&count.to_be_bytes());
        body.extend_from_slice(&(offset as i32).to_be_bytes());
    }
    full_box(b"ctts", version, 0, &body)
}

/// Sync sample table from 1-based sample numbers.
pub fn stss(sync: &[u32]) -> Vec<u8> {
    let mut body = (sync.len() as u32).to_be_bytes().to_vec();
    for number in sync {
        body.extend_from_slice(&number.to_be_bytes());
    }
    full_box(b"stss", 0, 0, &body)
}

/// Sample-to-chunk table from the sample count of every chunk.
pub fn stsc(chunk_samples: &[u32]) -> Vec<u8> {
    let mut entries: Vec<(u32, u32)> = Vec::new();
    for (i, &count) in chunk_samples.iter().enumerate() {
        if entries.last().is_none_or(|&(_, last)| last != count) {
            entries.push((i as u32 + 1, count));
        }
    }
    let mut body = (entries.len() as u32).to_be_bytes().to_vec();
    for (first_chunk, count) in entries {
        body.extend_from_slice(&first_chunk.to_be_bytes());
        body.extend_from_slice(&count.to_be_bytes());
        body.extend_from_slice(&1u32.to_be_bytes());
    }
    full_box(b"stsc", 0, 0, &body)
}

pub fn stsz(sizes: &[u32]) -> Vec<u8> {
    let constant = match sizes {
        [first, rest @ ..] if rest.iter().all(|s| s == first) => *first,
        _ => 0,
    };
    let mut body = constant.to_be_bytes().to_vec();
    body.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
    if constant == 0 {
        for size in sizes {
            body.extend_from_slice(&size.to_be_bytes());
        }
    }
    full_box(b"stsz", 0, 0, &body)
}

/// `stco`, or `co64` once an offset needs more than 32 bits.
pub fn chunk_offsets(offsets: &[u64]) -> Vec<u8> {
    let mut body = (offsets.len() as u32).to_be_bytes().to_vec();
    if offsets.iter().any(|&o| o > u32::MAX as u64) {
        for offset in offsets {
            body.extend_from_slice(&offset.to_be_bytes());
        }
        full_box(b"co64", 0, 0, &body)
    } else {
        for &offset in offsets {
            body.extend_from_slice(&(offset as u32).to_be_bytes());
        }
        full_box(b"stco", 0, 0, &body)
    }
}

/// Single-entry edit list starting the presentation at `media_time`.
pub fn edts(segment_duration: u64, media_time: i64) -> Vec<u8> {
    let mut body = 1u32.to_be_bytes().to_vec();
    body.extend_from_slice(&segment_duration.to_be_bytes());
    body.extend_from_slice(&media_time.to_be_bytes());
    body.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    container(b"edts", &[full_box(b"elst", 1, 0, &body)])
}

fn visual_sample_entry(kind: &[u8; 4], par: &CodecParameters, config: Vec<u8>) -> Vec<u8> {
    let mut body = vec![0u8; 6];
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(&[0u8; 16]);
    body.extend_from_slice(&(par.width as u16).to_be_bytes());
    body.extend_from_slice(&(par.height as u16).to_be_bytes());
    body.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    body.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    body.extend_from_slice(&[0u8; 4]);
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(&[0u8; 32]);
    body.extend_from_slice(&0x0018u16.to_be_bytes());
    body.extend_from_slice(&(-1i16).to_be_bytes());
    body.extend_from_slice(&config);
    make_box(kind, &body)
}

fn audio_sample_entry(kind: &[u8; 4], par: &CodecParameters, config: Vec<u8>) -> Vec<u8> {
    let mut body = vec![0u8; 6];
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(&[0u8; 8]);
    body.extend_from_slice(&(par.channels as u16).to_be_bytes());
    body.extend_from_slice(&16u16.to_be_bytes());
    body.extend_from_slice(&[0u8; 4]);
    let rate = if par.sample_rate > u16::MAX as u32 { 0 } else { par.sample_rate };
    body.extend_from_slice(&(rate << 16).to_be_bytes());
    body.extend_from_slice(&config);
    make_box(kind, &body)
}

/// MPEG-4 descriptor with a 4-byte expandable length.
fn descriptor(tag: u8, body: &[u8]) -> Vec<u8> {
    let len = body.len() as u32;
    let mut out = vec![
        tag,
        0x80 | ((len >> 21) & 0x7F) as u8,
        0x80 | ((len >> 14) & 0x7F) as u8,
        0x80 | ((len >> 7) & 0x7F) as u8,
        (len & 0x7F) as u8,
    ];
    out.extend_from_slice(body);
    out
}

pub fn esds(track_id: u16, par: &CodecParameters, object_type: u8) -> Vec<u8> {
    let bit_rate = par.bit_rate.clamp(0, u32::MAX as i64) as u32;
    let mut config = vec![object_type, 0x15];
    U24(0).write_be(&mut config);
    config.extend_from_slice(&bit_rate.to_be_bytes());
    config.extend_from_slice(&bit_rate.to_be_bytes());
    if !par.extradata.is_empty() {
        config.extend_from_slice(&descriptor(0x05, &par.extradata));
    }

    let mut es = track_id.to_be_bytes().to_vec();
    es.push(0);
    es.extend_from_slice(&descriptor(0x04, &config));
    es.extend_from_slice(&descriptor(0x06, &[0x02]));
    full_box(b"esds", 0, 0, &descriptor(0x03, &es))
}

/// `dOps` from an `OpusHead` extradata, or a plain stereo mapping without one.
fn d_ops(par: &CodecParameters) -> Result<Vec<u8>, FormatError> {
    let head = &par.extradata;
    let mut body = vec![0u8];
    if head.len() >= 19 && &head[..8] == b"OpusHead" {
        body.push(head[9]);
        body.extend_from_slice(&u16::from_le_bytes([head[10], head[11]]).to_be_bytes());
        body.extend_from_slice(&u32::from_le_bytes([head[12], head[13], head[14], head[15]]).to_be_bytes());
        body.extend_from_slice(&i16::from_le_bytes([head[16], head[17]]).to_be_bytes());
        body.extend_from_slice(&head[18..]);
    } else if par.channels <= 2 {
        body.push(par.channels.max(1) as u8);
        body.extend_from_slice(&312u16.to_be_bytes());
        body.extend_from_slice(&48000u32.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.push(0);
    } else {
        return Err(FormatError::params(format!(
            "opus with {} channels needs an OpusHead",
            par.channels
        )));
    }
    Ok(make_box(b"dOps", &body))
}

/// `dfLa` holding the STREAMINFO block of the extradata.
fn dfla(par: &CodecParameters) -> Result<Vec<u8>, FormatError> {
    let data = par.extradata.as_slice();
    let info = match data.len() {
        STREAMINFO_SIZE => data,
        n if n >= STREAMINFO_SIZE + 8 && &data[..4] == b"fLaC" => &data[8..8 + STREAMINFO_SIZE],
        n if n >= STREAMINFO_SIZE + 4 => &data[4..4 + STREAMINFO_SIZE],
        n => return Err(FormatError::params(format!("flac extradata of {n} bytes"))),
    };
    let mut body = vec![0x80 | METADATA_STREAMINFO];
    U24(STREAMINFO_SIZE as u32).write_be(&mut body);
    body.extend_from_slice(info);
    Ok(full_box(b"dfLa", 0, 0, &body))
}

/// The single sample description of a track.
pub fn sample_entry(track_id: u32, par: &CodecParameters) -> Result<Vec<u8>, FormatError> {
    let entry = match par.codec_id {
        CodecId::H264 => visual_sample_entry(b"avc1", par, make_box(b"avcC", &par.extradata)),
        CodecId::Hevc => visual_sample_entry(b"hvc1", par, make_box(b"hvcC", &par.extradata)),
        CodecId::Vvc => visual_sample_entry(b"vvc1", par, full_box(b"vvcC", 0, 0, &par.extradata)),
        CodecId::Aac => audio_sample_entry(b"mp4a", par, esds(track_id as u16, par, 0x40)),
        CodecId::Mp3 => audio_sample_entry(b"mp4a", par, esds(track_id as u16, par, 0x6B)),
        CodecId::Opus => audio_sample_entry(b"Opus", par, d_ops(par)?),
        CodecId::Flac => audio_sample_entry(b"fLaC", par, dfla(par)?),
        codec => return Err(FormatError::unsupported(format!("{codec} in mp4"))),
    };
    let mut body = 1u32.to_be_bytes().to_vec();
    body.extend_from_slice(&entry);
    Ok(full_box(b"stsd", 0, 0, &body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_layouts() {
        let mvhd = MovieHeader::new(1000, 5000, 3).to_box();
        assert_eq!(mvhd.len(), 120);
        assert_eq!(&mvhd[4..8], b"mvhd");
        assert_eq!(mvhd[8], 1);

        let par = CodecParameters::video(CodecId::H264, 1920, 1080);
        let tkhd = TrackHeader::new(1, 0, &par).to_box();
        assert_eq!(tkhd.len(), 104);
        assert_eq!(&tkhd[96..100], &(1920u32 << 16).to_be_bytes());

        assert_eq!(MediaHeader::new(90000, 0).to_box().len(), 44);
        assert_eq!(VideoMediaHeader::default().to_box().len(), 20);
        assert_eq!(TrackExtends::new(2).to_box().len(), 32);
    }

    #[test]
    fn table_compaction() {
        assert_eq!(run_lengths([3, 3, 1, 3]), [(2, 3), (1, 1), (1, 3)]);

        let stsc = stsc(&[5, 5, 2, 5]);
        assert_eq!(u32::from_be_bytes(stsc[12..16].try_into().unwrap()), 3);
        assert_eq!(&stsc[16..20], &1u32.to_be_bytes());
        assert_eq!(&stsc[28..32], &3u32.to_be_bytes());

        let constant = stsz(&[7, 7, 7]);
        assert_eq!(constant.len(), 20);
        assert_eq!(stsz(&[7, 8]).len(), 28);

        assert_eq!(&chunk_offsets(&[8, 16])[4..8], b"stco");
        assert_eq!(&chunk_offsets(&[8, 1 << 33])[4..8], b"co64");
        assert_eq!(ctts(&[0, -2])[8], 1);
    }

    #[test]
    fn large_box_header() {
        let kind = b"mdat";
        let small = make_box(kind, &[0; 4]);
        assert_eq!(&small[..4], &12u32.to_be_bytes());
    }

    #[test]
    fn flac_description() -> anyhow::Result<()> {
        let mut par = CodecParameters::audio(CodecId::Flac, 44100, 2);
        par.extradata = vec![0; STREAMINFO_SIZE];
        let stsd = sample_entry(1, &par)?;
        assert_eq!(&stsd[20..24], b"fLaC");

        par.extradata = vec![0; 10];
        assert!(sample_entry(1, &par).is_err());
        par.codec_id = CodecId::PcmS16Le;
        assert!(sample_entry(1, &par).is_err());
        Ok(())
    }
}
