//! VVC helpers: NAL types and `vvcC` records.

use std::io;

use super::h264::{read_param_sets, write_param_sets};
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::FormatError;

pub const NAL_IDR_W_RADL: u8 = 7;
pub const NAL_IDR_N_LP: u8 = 8;
pub const NAL_CRA: u8 = 9;
pub const NAL_GDR: u8 = 10;
pub const NAL_OPI: u8 = 12;
pub const NAL_DCI: u8 = 13;
pub const NAL_VPS: u8 = 14;
pub const NAL_SPS: u8 = 15;
pub const NAL_PPS: u8 = 16;
pub const NAL_PREFIX_APS: u8 = 17;
pub const NAL_AUD: u8 = 20;
pub const NAL_PREFIX_SEI: u8 = 23;
pub const NAL_SUFFIX_SEI: u8 = 24;

/// Access unit delimiter with irap flag set, pic_type 2.
pub const AUD: [u8; 3] = [0x00, 0xA1, 0xD0];

#[inline]
pub fn nal_type(nalu: &[u8]) -> u8 {
    nalu.get(1).map_or(0, |b| (b >> 3) & 0x1F)
}

pub fn is_irap(nal_type: u8) -> bool {
    (NAL_IDR_W_RADL..=NAL_GDR).contains(&nal_type)
}

/// `VvcPTLRecord` plus the picture fields that follow it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VvcPtl {
    pub ols_idx: u16,
    pub num_sublayers: u8,
    pub constant_frame_rate: u8,
    pub chroma_format: u8,
    pub bit_depth: u8,
    pub profile_idc: u8,
    pub tier: bool,
    pub level_idc: u8,
    pub frame_only_constraint: bool,
    pub multilayer_enabled: bool,
    /// Raw general_constraint_info bytes, first two bits are the flags above.
    pub constraint_info: Vec<u8>,
    pub sublayer_levels: Vec<Option<u8>>,
    pub sub_profiles: Vec<u32>,
    pub max_picture_width: u16,
    pub max_picture_height: u16,
    pub avg_frame_rate: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NalArray {
    pub completeness: bool,
    pub nal_type: u8,
    pub units: Vec<Vec<u8>>,
}

/// Parsed `VvcDecoderConfigurationRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VvcConfig {
    pub length_size: usize,
    pub ptl: Option<VvcPtl>,
    pub arrays: Vec<NalArray>,
}

impl VvcConfig {
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if data.is_empty() {
            return Err(FormatError::invalid("vvcC: empty"));
        }
        Self::parse_bits(&mut BsIoSliceReader::from_slice(data))
            .map_err(|e| FormatError::invalid(format!("vvcC: {e}")))
    }

    fn parse_bits(bs: &mut BsIoSliceReader) -> io::Result<Self> {
        bs.skip_n(5)?;
        let length_size = bs.get_n::<u8>(2)? as usize + 1;
        let ptl_present = bs.get()?;

        let ptl = if ptl_present {
            Some(parse_ptl(bs)?)
        } else {
            None
        };

        let num_arrays = bs.get_n::<u8>(8)?;
        let mut arrays = Vec::with_capacity(num_arrays as usize);
        for _ in 0..num_arrays {
            let completeness = bs.get()?;
            bs.skip_n(2)?;
            let nal_type = bs.get_n::<u8>(5)?;
            let count = if nal_type == NAL_DCI || nal_type == NAL_OPI {
                1
            } else {
                bs.get_n::<u16>(16)?
            };
            arrays.push(NalArray {
                completeness,
                nal_type,
                units: read_param_sets(bs, count as usize)?,
            });
        }

        Ok(Self {
            length_size,
            ptl,
            arrays,
        })
    }

    /// Builds a record without profile information from parameter sets.
    pub fn from_param_sets(vps: Vec<Vec<u8>>, sps: Vec<Vec<u8>>, pps: Vec<Vec<u8>>) -> Self {
        let arrays = [(NAL_VPS, vps), (NAL_SPS, sps), (NAL_PPS, pps)]
            .into_iter()
            .filter(|(_, units)| !units.is_empty())
            .map(|(nal_type, units)| NalArray {
                completeness: true,
                nal_type,
                units,
            })
            .collect();
        Self {
            length_size: 4,
            ptl: None,
            arrays,
        }
    }

    pub fn units(&self, nal_type: u8) -> impl Iterator<Item = &Vec<u8>> {
        self.arrays
            .iter()
            .filter(move |a| a.nal_type == nal_type)
            .flat_map(|a| a.units.iter())
    }

    /// Serializes the record. Profile information is written only when it
    /// was present; sub-layer and sub-profile details are kept as parsed.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![
            0xF8 | ((self.length_size.saturating_sub(1) as u8 & 3) << 1)
                | self.ptl.is_some() as u8,
        ];
        if let Some(ptl) = &self.ptl {
            write_ptl(&mut out, ptl);
        }

        out.push(self.arrays.len() as u8);
        for array in &self.arrays {
            out.push(((array.completeness as u8) << 7) | (array.nal_type & 0x1F));
            if array.nal_type != NAL_DCI && array.nal_type != NAL_OPI {
                out.extend_from_slice(&(array.units.len() as u16).to_be_bytes());
            }
            write_param_sets(&mut out, &array.units);
        }
        out
    }
}

fn parse_ptl(bs: &mut BsIoSliceReader) -> io::Result<VvcPtl> {
    let mut ptl = VvcPtl {
        ols_idx: bs.get_n(9)?,
        num_sublayers: bs.get_n(3)?,
        constant_frame_rate: bs.get_n(2)?,
        chroma_format: bs.get_n(2)?,
        bit_depth: bs.get_n::<u8>(3)? + 8,
        ..Default::default()
    };
    bs.skip_n(5)?;

    // VvcPTLRecord
    bs.skip_n(2)?;
    let num_bytes_constraint_info = bs.get_n::<u8>(6)? as usize;
    ptl.profile_idc = bs.get_n(7)?;
    ptl.tier = bs.get()?;
    ptl.level_idc = bs.get_n(8)?;
    ptl.constraint_info = bs.get_bytes(num_bytes_constraint_info)?;
    if let Some(&first) = ptl.constraint_info.first() {
        ptl.frame_only_constraint = first & 0x80 != 0;
        ptl.multilayer_enabled = first & 0x40 != 0;
    }

    if ptl.num_sublayers > 1 {
        let flags = bs.get_n::<u8>(8)?;
        let count = ptl.num_sublayers as usize - 1;
        let present: Vec<bool> = (0..count).map(|i| flags & (0x80 >> i) != 0).collect();
        for is_present in present {
            ptl.sublayer_levels.push(if is_present {
                Some(bs.get_n::<u8>(8)?)
            } else {
                None
            });
        }
    }

    let num_sub_profiles = bs.get_n::<u8>(8)?;
    for _ in 0..num_sub_profiles {
        ptl.sub_profiles.push(bs.get_n(32)?);
    }

    ptl.max_picture_width = bs.get_n(16)?;
    ptl.max_picture_height = bs.get_n(16)?;
    ptl.avg_frame_rate = bs.get_n(16)?;
    Ok(ptl)
}

fn write_ptl(out: &mut Vec<u8>, ptl: &VvcPtl) {
    let packed: u32 = ((ptl.ols_idx as u32 & 0x1FF) << 15)
        | ((ptl.num_sublayers as u32 & 7) << 12)
        | ((ptl.constant_frame_rate as u32 & 3) << 10)
        | ((ptl.chroma_format as u32 & 3) << 8)
        | ((ptl.bit_depth.saturating_sub(8) as u32 & 7) << 5)
        | 0x1F;
    out.extend_from_slice(&packed.to_be_bytes()[1..]);

    out.push(ptl.constraint_info.len() as u8 & 0x3F);
    out.push((ptl.profile_idc << 1) | ptl.tier as u8);
    out.push(ptl.level_idc);
    out.extend_from_slice(&ptl.constraint_info);

    if ptl.num_sublayers > 1 {
        let flags = ptl
            .sublayer_levels
            .iter()
            .enumerate()
            .filter(|(_, level)| level.is_some())
            .fold(0u8, |acc, (i, _)| acc | (0x80 >> i));
        out.push(flags);
        out.extend(ptl.sublayer_levels.iter().flatten());
    }

    out.push(ptl.sub_profiles.len() as u8);
    for sub_profile in &ptl.sub_profiles {
        out.extend_from_slice(&sub_profile.to_be_bytes());
    }
    out.extend_from_slice(&ptl.max_picture_width.to_be_bytes());
    out.extend_from_slice(&ptl.max_picture_height.to_be_bytes());
    out.extend_from_slice(&ptl.avg_frame_rate.to_be_bytes());
}
