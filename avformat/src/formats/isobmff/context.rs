//! Streaming state of an open MP4/MOV file, filled in by the box handlers.

use std::collections::BTreeMap;

use crate::structs::encryption::{EncryptionInitInfo, SampleEncryption, TrackEncryption};
use crate::structs::fourcc::FourCC;
use crate::structs::packet::PacketFlags;
use crate::structs::rational::Rational;
use crate::structs::stream::Stream;

/// One entry of a built sample index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sample {
    pub dts: i64,
    pub pts: i64,
    pub pos: u64,
    pub size: u32,
    pub duration: u32,
    pub flags: PacketFlags,
}

impl Sample {
    pub fn is_key(&self) -> bool {
        self.flags.contains(PacketFlags::KEY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElstEntry {
    /// In movie timescale units.
    pub segment_duration: u64,
    /// In media timescale units, -1 for an empty edit.
    pub media_time: i64,
    pub media_rate: i32,
}

/// Fragment defaults from `trex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trex {
    pub track_id: u32,
    pub sample_description_index: u32,
    pub sample_duration: u32,
    pub sample_size: u32,
    pub sample_flags: u32,
}

/// `tfra` entry: the `moof` at `pos` starts at `time` (track timescale).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragIndexEntry {
    pub time: i64,
    pub pos: u64,
}

/// Sample auxiliary information (`saiz`/`saio`/`senc`) of a track or fragment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CencAux {
    pub default_sample_info_size: u8,
    pub sample_info_sizes: Vec<u8>,
    pub sample_count: u32,
    pub offsets: Vec<u64>,
    pub samples: Vec<SampleEncryption>,
}

impl CencAux {
    pub fn info_size(&self, sample: usize) -> usize {
        if self.default_sample_info_size > 0 {
            self.default_sample_info_size as usize
        } else {
            self.sample_info_sizes.get(sample).copied().unwrap_or(0) as usize
        }
    }

    /// Aux info was described by `saiz`/`saio` but not yet loaded.
    pub fn needs_load(&self) -> bool {
        self.samples.is_empty() && self.sample_count > 0 && !self.offsets.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrunSample {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
    pub cts_offset: i64,
}

/// One `trun`, with `tfhd`/`trex` defaults already applied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackRun {
    pub data_offset: Option<i32>,
    pub samples: Vec<TrunSample>,
}

/// State of one `traf`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FragmentTrack {
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
    pub base_is_moof: bool,
    pub base_media_decode_time: Option<u64>,
    pub runs: Vec<TrackRun>,
    pub cenc: CencAux,
}

impl FragmentTrack {
    pub fn sample_count(&self) -> usize {
        self.runs.iter().map(|run| run.samples.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fragment {
    /// Start of the `moof` box.
    pub pos: u64,
    pub size: u64,
    pub sequence: u32,
    pub tracks: Vec<FragmentTrack>,
}

/// Per-track tables and cursor.
#[derive(Debug, Clone, Default)]
pub struct TrackContext {
    pub stream: Stream,
    pub track_id: u32,
    pub handler: Option<FourCC>,
    /// `tkhd` presentation size, 16.16 truncated.
    pub width: u32,
    pub height: u32,
    pub timescale: u32,

    pub chunk_offsets: Vec<u64>,
    pub stsc: Vec<StscEntry>,
    pub sample_sizes: Vec<u32>,
    pub stts: Vec<(u32, u32)>,
    pub ctts: Vec<(u32, i64)>,
    /// 1-based sync sample numbers; `None` when every sample is a sync sample.
    pub stss: Option<Vec<u32>>,
    pub elst: Vec<ElstEntry>,

    pub samples: Vec<Sample>,
    pub current_sample: usize,
    /// Decode time following the last fragment sample.
    pub next_fragment_dts: i64,
    pub frag_index: Vec<FragIndexEntry>,

    pub scheme: Option<FourCC>,
    pub original_format: Option<FourCC>,
    pub tenc: Option<TrackEncryption>,
    pub cenc: CencAux,
    /// Per-sample encryption, parallel to `samples`.
    pub sample_encryption: Vec<Option<SampleEncryption>>,

    /// Extradata to attach to the next key packet.
    pub pending_extradata: Option<Vec<u8>>,
}

impl TrackContext {
    pub fn new(index: usize) -> Self {
        Self {
            stream: Stream::new(index, Rational::new(1, 1000)),
            ..Self::default()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.current_sample >= self.samples.len()
    }

    pub fn current(&self) -> Option<&Sample> {
        self.samples.get(self.current_sample)
    }

    pub fn is_encrypted(&self) -> bool {
        self.tenc.as_ref().is_some_and(|t| t.is_protected)
    }
}

/// HEIF item from `iinf`/`infe`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemInfo {
    pub id: u32,
    pub protection_index: u16,
    pub item_type: Option<FourCC>,
    pub name: String,
}

/// `iref` entry: `from` references every item in `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReference {
    pub kind: FourCC,
    pub from: u32,
    pub to: Vec<u32>,
}

#[derive(Debug)]
pub struct MovContext {
    pub fail_level: log::Level,
    /// Movie timescale from `mvhd`.
    pub timescale: u32,
    pub duration: u64,
    pub major_brand: Option<FourCC>,
    pub minor_version: u32,
    pub compatible_brands: Vec<FourCC>,
    pub is_quicktime: bool,

    pub found_moov: bool,
    pub found_mdat: bool,
    pub first_mdat_pos: Option<u64>,
    pub is_fragment: bool,
    pub fragment_duration: u64,
    pub trex: Vec<Trex>,

    pub tracks: Vec<TrackContext>,
    pub current_fragment: Option<Fragment>,
    /// The `traf` being parsed.
    pub current_traf: Option<FragmentTrack>,
    pub first_moof: Option<u64>,

    pub pssh: Vec<EncryptionInitInfo>,
    /// `pssh` boxes seen in fragments, not yet attached to a packet.
    pub pending_pssh: Vec<EncryptionInitInfo>,

    pub items: Vec<ItemInfo>,
    pub item_refs: Vec<ItemReference>,
    pub primary_item: Option<u32>,

    pub metadata: BTreeMap<String, String>,
}

impl Default for MovContext {
    fn default() -> Self {
        Self {
            fail_level: log::Level::Error,
            timescale: 1000,
            duration: 0,
            major_brand: None,
            minor_version: 0,
            compatible_brands: Vec::new(),
            is_quicktime: false,
            found_moov: false,
            found_mdat: false,
            first_mdat_pos: None,
            is_fragment: false,
            fragment_duration: 0,
            trex: Vec::new(),
            tracks: Vec::new(),
            current_fragment: None,
            current_traf: None,
            first_moof: None,
            pssh: Vec::new(),
            pending_pssh: Vec::new(),
            items: Vec::new(),
            item_refs: Vec::new(),
            primary_item: None,
            metadata: BTreeMap::new(),
        }
    }
}

impl MovContext {
    pub fn track_by_id(&self, track_id: u32) -> Option<usize> {
        self.tracks.iter().position(|t| t.track_id == track_id)
    }

    pub fn trex(&self, track_id: u32) -> Trex {
        self.trex
            .iter()
            .find(|t| t.track_id == track_id)
            .copied()
            .unwrap_or_default()
    }
}
