//! H.264/AVC helpers: NAL types, `avcC` records and SPS fields.

use std::io;

use super::nalu::nalu_unescape;
use crate::structs::rational::Rational;
use crate::utils::bitstream_io::{BitstreamIoReader, BsIoSliceReader};
use crate::utils::errors::FormatError;

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;
pub const NAL_SPS_EXT: u8 = 13;

/// Access unit delimiter, primary_pic_type 7 (any slice type).
pub const AUD: [u8; 2] = [0x09, 0xF0];

#[inline]
pub fn nal_type(nalu: &[u8]) -> u8 {
    nalu.first().map_or(0, |b| b & 0x1F)
}

/// Profiles whose SPS carries chroma format and bit depth fields.
fn has_chroma_info(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

/// Parsed `AVCDecoderConfigurationRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AvcConfig {
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    pub length_size: usize,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
    pub sps_ext: Vec<Vec<u8>>,
    pub chroma_format: u8,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
}

impl AvcConfig {
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < 7 || data[0] != 1 {
            return Err(FormatError::invalid("avcC: bad version or too short"));
        }
        Self::parse_bits(&mut BsIoSliceReader::from_slice(data))
            .map_err(|e| FormatError::invalid(format!("avcC: {e}")))
    }

    fn parse_bits(bs: &mut BsIoSliceReader) -> io::Result<Self> {
        bs.skip_n(8)?;
        let profile = bs.get_n::<u8>(8)?;
        let compatibility = bs.get_n::<u8>(8)?;
        let level = bs.get_n::<u8>(8)?;
        bs.skip_n(6)?;
        let length_size = bs.get_n::<u8>(2)? as usize + 1;

        bs.skip_n(3)?;
        let sps_count = bs.get_n::<u8>(5)?;
        let sps = read_param_sets(bs, sps_count as usize)?;
        let pps_count = bs.get_n::<u8>(8)?;
        let pps = read_param_sets(bs, pps_count as usize)?;

        let mut config = Self {
            profile,
            compatibility,
            level,
            length_size,
            sps,
            pps,
            chroma_format: 1,
            bit_depth_luma: 8,
            bit_depth_chroma: 8,
            ..Default::default()
        };

        if has_chroma_info(profile) && bs.available()? >= 32 {
            bs.skip_n(6)?;
            config.chroma_format = bs.get_n::<u8>(2)?;
            bs.skip_n(5)?;
            config.bit_depth_luma = bs.get_n::<u8>(3)? + 8;
            bs.skip_n(5)?;
            config.bit_depth_chroma = bs.get_n::<u8>(3)? + 8;
            let ext_count = bs.get_n::<u8>(8)?;
            config.sps_ext = read_param_sets(bs, ext_count as usize)?;
        }

        Ok(config)
    }

    /// Builds a record from parameter set NAL units, taking profile, level,
    /// chroma format and bit depths from the first SPS.
    pub fn from_param_sets(
        sps: Vec<Vec<u8>>,
        pps: Vec<Vec<u8>>,
        sps_ext: Vec<Vec<u8>>,
    ) -> Result<Self, FormatError> {
        let first = sps
            .first()
            .ok_or_else(|| FormatError::invalid("avcC: no SPS"))?;
        if first.len() < 4 {
            return Err(FormatError::invalid("avcC: SPS too short"));
        }
        let info = Sps::parse(first)?;

        Ok(Self {
            profile: first[1],
            compatibility: first[2],
            level: first[3],
            length_size: 4,
            chroma_format: info.chroma_format_idc as u8,
            bit_depth_luma: info.bit_depth_luma as u8,
            bit_depth_chroma: info.bit_depth_chroma as u8,
            sps,
            pps,
            sps_ext,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let sps = &self.sps[..self.sps.len().min(31)];
        let mut out = vec![
            1,
            self.profile,
            self.compatibility,
            self.level,
            0xFC | (self.length_size.saturating_sub(1) as u8 & 3),
            0xE0 | sps.len() as u8,
        ];
        write_param_sets(&mut out, sps);
        out.push(self.pps.len().min(255) as u8);
        write_param_sets(&mut out, &self.pps[..self.pps.len().min(255)]);

        if has_chroma_info(self.profile) {
            out.push(0xFC | (self.chroma_format & 3));
            out.push(0xF8 | (self.bit_depth_luma.saturating_sub(8) & 7));
            out.push(0xF8 | (self.bit_depth_chroma.saturating_sub(8) & 7));
            out.push(self.sps_ext.len().min(255) as u8);
            write_param_sets(&mut out, &self.sps_ext[..self.sps_ext.len().min(255)]);
        }
        out
    }
}

pub(crate) fn read_param_sets<R: io::Read + io::Seek>(
    bs: &mut BitstreamIoReader<R>,
    count: usize,
) -> io::Result<Vec<Vec<u8>>> {
    (0..count)
        .map(|_| {
            let len = bs.get_n::<u16>(16)? as usize;
            bs.get_bytes(len)
        })
        .collect()
}

pub(crate) fn write_param_sets(out: &mut Vec<u8>, sets: &[Vec<u8>]) {
    for set in sets {
        out.extend_from_slice(&(set.len() as u16).to_be_bytes());
        out.extend_from_slice(set);
    }
}

/// Fields of a sequence parameter set used for stream description.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub sps_id: u32,
    pub chroma_format_idc: u32,
    pub bit_depth_luma: u32,
    pub bit_depth_chroma: u32,
    pub width: u32,
    pub height: u32,
    pub frame_mbs_only: bool,
    pub max_num_ref_frames: u32,
    /// `time_scale / num_units_in_tick` from VUI timing info.
    pub timing: Option<(u32, u32)>,
    pub max_num_reorder_frames: Option<u32>,
}

impl Sps {
    /// Parses an SPS NAL unit including its one byte header.
    pub fn parse(nalu: &[u8]) -> Result<Self, FormatError> {
        if nalu.len() < 4 || nal_type(nalu) != NAL_SPS {
            return Err(FormatError::invalid("h264: not an SPS"));
        }
        let rbsp = nalu_unescape(&nalu[1..]);
        Self::parse_rbsp(&mut BsIoSliceReader::from_slice(&rbsp))
            .map_err(|e| FormatError::invalid(format!("h264 sps: {e}")))
    }

    fn parse_rbsp(bs: &mut BsIoSliceReader) -> io::Result<Self> {
        let mut sps = Self {
            profile_idc: bs.get_n(8)?,
            constraint_flags: bs.get_n(8)?,
            level_idc: bs.get_n(8)?,
            sps_id: bs.get_ue()?,
            chroma_format_idc: 1,
            bit_depth_luma: 8,
            bit_depth_chroma: 8,
            ..Default::default()
        };

        let mut separate_colour_plane = false;
        if has_chroma_info(sps.profile_idc) {
            sps.chroma_format_idc = bs.get_ue()?;
            if sps.chroma_format_idc == 3 {
                separate_colour_plane = bs.get()?;
            }
            sps.bit_depth_luma = bs.get_ue()? + 8;
            sps.bit_depth_chroma = bs.get_ue()? + 8;
            // qpprime_y_zero_transform_bypass_flag
            bs.skip_n(1)?;
            if bs.get()? {
                let lists = if sps.chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..lists {
                    if bs.get()? {
                        skip_scaling_list(bs, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        // log2_max_frame_num_minus4
        bs.get_ue()?;
        match bs.get_ue()? {
            0 => {
                bs.get_ue()?;
            }
            1 => {
                bs.skip_n(1)?;
                bs.get_se()?;
                bs.get_se()?;
                let cycle = bs.get_ue()?;
                for _ in 0..cycle {
                    bs.get_se()?;
                }
            }
            _ => {}
        }

        sps.max_num_ref_frames = bs.get_ue()?;
        // gaps_in_frame_num_value_allowed_flag
        bs.skip_n(1)?;
        let width_mbs = bs.get_ue()? + 1;
        let height_map_units = bs.get_ue()? + 1;
        sps.frame_mbs_only = bs.get()?;
        if !sps.frame_mbs_only {
            // mb_adaptive_frame_field_flag
            bs.skip_n(1)?;
        }
        // direct_8x8_inference_flag
        bs.skip_n(1)?;

        let field_factor = if sps.frame_mbs_only { 1 } else { 2 };
        let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
        if bs.get()? {
            crop_left = bs.get_ue()?;
            crop_right = bs.get_ue()?;
            crop_top = bs.get_ue()?;
            crop_bottom = bs.get_ue()?;
        }

        let chroma_array_type = if separate_colour_plane {
            0
        } else {
            sps.chroma_format_idc
        };
        let (unit_x, unit_y) = match chroma_array_type {
            0 => (1, field_factor),
            1 => (2, 2 * field_factor),
            2 => (2, field_factor),
            _ => (1, field_factor),
        };

        sps.width = (width_mbs * 16).saturating_sub(unit_x * (crop_left + crop_right));
        sps.height = (field_factor * height_map_units * 16)
            .saturating_sub(unit_y * (crop_top + crop_bottom));

        if bs.get().unwrap_or(false) {
            // Truncated VUI still leaves a usable SPS.
            if let Err(e) = parse_vui(bs, &mut sps) {
                log::debug!("h264 sps: incomplete VUI: {e}");
            }
        }

        Ok(sps)
    }

    pub fn frame_rate(&self) -> Option<Rational> {
        let (time_scale, units) = self.timing?;
        if time_scale == 0 || units == 0 {
            return None;
        }
        // One frame is two ticks.
        Some(Rational::new(time_scale as i32, (units * 2) as i32).reduce())
    }
}

fn skip_scaling_list(bs: &mut BsIoSliceReader, size: usize) -> io::Result<()> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = bs.get_se()?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

fn skip_hrd(bs: &mut BsIoSliceReader) -> io::Result<()> {
    let cpb_cnt = bs.get_ue()? + 1;
    // bit_rate_scale, cpb_size_scale
    bs.skip_n(8)?;
    for _ in 0..cpb_cnt {
        bs.get_ue()?;
        bs.get_ue()?;
        bs.skip_n(1)?;
    }
    bs.skip_n(20)
}

fn parse_vui(bs: &mut BsIoSliceReader, sps: &mut Sps) -> io::Result<()> {
    if bs.get()? {
        let aspect_ratio_idc = bs.get_n::<u8>(8)?;
        if aspect_ratio_idc == 255 {
            bs.skip_n(32)?;
        }
    }
    if bs.get()? {
        // overscan_appropriate_flag
        bs.skip_n(1)?;
    }
    if bs.get()? {
        // video_format, video_full_range_flag
        bs.skip_n(4)?;
        if bs.get()? {
            bs.skip_n(24)?;
        }
    }
    if bs.get()? {
        bs.get_ue()?;
        bs.get_ue()?;
    }
    if bs.get()? {
        let units = bs.get_n::<u32>(32)?;
        let time_scale = bs.get_n::<u32>(32)?;
        bs.skip_n(1)?;
        sps.timing = Some((time_scale, units));
    }
    let nal_hrd = bs.get()?;
    if nal_hrd {
        skip_hrd(bs)?;
    }
    let vcl_hrd = bs.get()?;
    if vcl_hrd {
        skip_hrd(bs)?;
    }
    if nal_hrd || vcl_hrd {
        // low_delay_hrd_flag
        bs.skip_n(1)?;
    }
    // pic_struct_present_flag
    bs.skip_n(1)?;
    if bs.get()? {
        bs.skip_n(1)?;
        for _ in 0..4 {
            bs.get_ue()?;
        }
        sps.max_num_reorder_frames = Some(bs.get_ue()?);
        // max_dec_frame_buffering
        bs.get_ue()?;
    }
    Ok(())
}
