//! Stream descriptors and codec parameters.

use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;

use super::encryption::EncryptionInitInfo;
use super::fourcc::FourCC;
use super::packet::BitFormat;
use super::rational::{NOPTS_VALUE, Rational};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
    Data,
    Attachment,
    #[default]
    Unknown,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Subtitle => "subtitle",
            MediaType::Data => "data",
            MediaType::Attachment => "attachment",
            MediaType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CodecId {
    #[default]
    None,
    H264,
    Hevc,
    Vvc,
    Mpeg2Video,
    Mpeg4,
    Aac,
    Mp3,
    Flac,
    Opus,
    Vorbis,
    Ac3,
    Eac3,
    PcmU8,
    PcmS16Le,
    PcmS16Be,
    PcmS24Le,
    PcmS24Be,
    PcmS32Le,
    PcmS32Be,
    PcmS64Le,
    PcmS64Be,
    PcmF32Le,
    PcmF32Be,
    PcmF64Le,
    PcmF64Be,
    PcmAlaw,
    PcmMulaw,
    AdpcmImaWav,
    AdpcmMs,
    AdpcmZork,
}

impl CodecId {
    pub fn media_type(self) -> MediaType {
        match self {
            CodecId::None => MediaType::Unknown,
            CodecId::H264
            | CodecId::Hevc
            | CodecId::Vvc
            | CodecId::Mpeg2Video
            | CodecId::Mpeg4 => {
                MediaType::Video
            }
            _ => MediaType::Audio,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecId::None => "none",
            CodecId::H264 => "h264",
            CodecId::Hevc => "hevc",
            CodecId::Vvc => "vvc",
            CodecId::Mpeg2Video => "mpeg2video",
            CodecId::Mpeg4 => "mpeg4",
            CodecId::Aac => "aac",
            CodecId::Mp3 => "mp3",
            CodecId::Flac => "flac",
            CodecId::Opus => "opus",
            CodecId::Vorbis => "vorbis",
            CodecId::Ac3 => "ac3",
            CodecId::Eac3 => "eac3",
            CodecId::PcmU8 => "pcm_u8",
            CodecId::PcmS16Le => "pcm_s16le",
            CodecId::PcmS16Be => "pcm_s16be",
            CodecId::PcmS24Le => "pcm_s24le",
            CodecId::PcmS24Be => "pcm_s24be",
            CodecId::PcmS32Le => "pcm_s32le",
            CodecId::PcmS32Be => "pcm_s32be",
            CodecId::PcmS64Le => "pcm_s64le",
            CodecId::PcmS64Be => "pcm_s64be",
            CodecId::PcmF32Le => "pcm_f32le",
            CodecId::PcmF32Be => "pcm_f32be",
            CodecId::PcmF64Le => "pcm_f64le",
            CodecId::PcmF64Be => "pcm_f64be",
            CodecId::PcmAlaw => "pcm_alaw",
            CodecId::PcmMulaw => "pcm_mulaw",
            CodecId::AdpcmImaWav => "adpcm_ima_wav",
            CodecId::AdpcmMs => "adpcm_ms",
            CodecId::AdpcmZork => "adpcm_zork",
        }
    }

    pub fn is_pcm(self) -> bool {
        self.pcm_bits().is_some()
    }

    /// Sample width of uncompressed PCM codecs.
    pub fn pcm_bits(self) -> Option<u32> {
        match self {
            CodecId::PcmU8 | CodecId::PcmAlaw | CodecId::PcmMulaw => Some(8),
            CodecId::PcmS16Le | CodecId::PcmS16Be => Some(16),
            CodecId::PcmS24Le | CodecId::PcmS24Be => Some(24),
            CodecId::PcmS32Le | CodecId::PcmS32Be | CodecId::PcmF32Le | CodecId::PcmF32Be => {
                Some(32)
            }
            CodecId::PcmS64Le | CodecId::PcmS64Be | CodecId::PcmF64Le | CodecId::PcmF64Be => {
                Some(64)
            }
            _ => None,
        }
    }

    /// Video codecs whose payload is a sequence of NAL units.
    pub fn is_nalu_based(self) -> bool {
        matches!(self, CodecId::H264 | CodecId::Hevc | CodecId::Vvc)
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Disposition: u32 {
        const DEFAULT = 0x0001;
        const DEPENDENT = 0x0002;
        const ATTACHED_PIC = 0x0400;
        const TIMED_THUMBNAILS = 0x0800;
        const ATTACHMENT = 0x1000;
    }
}

/// Codec description of one stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CodecParameters {
    pub media_type: MediaType,
    pub codec_id: CodecId,
    /// Container-level codec tag (sample entry type, WAV format tag, ...).
    pub codec_tag: FourCC,
    pub profile: i32,
    pub level: i32,
    pub bit_rate: i64,
    pub bits_per_coded_sample: u32,
    pub bits_per_raw_sample: u32,

    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    /// Maximum number of frames presentation order can lead decode order by.
    pub video_delay: u32,

    pub sample_rate: u32,
    pub channels: u32,
    pub channel_layout: u64,
    pub block_align: u32,
    /// Samples per coded frame, 0 when variable or unknown.
    pub frame_size: u32,

    pub extradata: Vec<u8>,
    pub bit_format: Option<BitFormat>,
}

impl CodecParameters {
    pub fn audio(codec_id: CodecId, sample_rate: u32, channels: u32) -> Self {
        Self {
            media_type: MediaType::Audio,
            codec_id,
            sample_rate,
            channels,
            ..Self::default()
        }
    }

    pub fn video(codec_id: CodecId, width: u32, height: u32) -> Self {
        Self {
            media_type: MediaType::Video,
            codec_id,
            width,
            height,
            ..Self::default()
        }
    }
}

/// One elementary stream of a container.
#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    pub index: usize,
    /// Container-level identifier (track id, PID, ...).
    pub id: u32,
    pub codecpar: CodecParameters,
    pub time_base: Rational,
    pub nb_frames: u64,
    pub start_time: i64,
    pub duration: i64,
    pub metadata: BTreeMap<String, String>,
    pub disposition: Disposition,
    /// Protection system headers that apply to the whole stream.
    pub encryption_init: Vec<EncryptionInitInfo>,
}

impl Default for Stream {
    fn default() -> Self {
        Self {
            index: 0,
            id: 0,
            codecpar: CodecParameters::default(),
            time_base: Rational::new(1, 1000),
            nb_frames: 0,
            start_time: NOPTS_VALUE,
            duration: NOPTS_VALUE,
            metadata: BTreeMap::new(),
            disposition: Disposition::empty(),
            encryption_init: Vec::new(),
        }
    }
}

impl Stream {
    pub fn new(index: usize, time_base: Rational) -> Self {
        Self {
            index,
            time_base,
            ..Self::default()
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.codecpar.media_type
    }

    /// Duration in seconds, if known.
    pub fn duration_secs(&self) -> Option<f64> {
        if self.duration == NOPTS_VALUE || !self.time_base.is_valid() {
            return None;
        }
        Some(self.duration as f64 * self.time_base.to_f64())
    }
}
