//! HEVC helpers: NAL types, `hvcC` records and SPS fields.

use std::io;

use super::h264::{read_param_sets, write_param_sets};
use super::nalu::nalu_unescape;
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::FormatError;

pub const NAL_BLA_W_LP: u8 = 16;
pub const NAL_BLA_N_LP: u8 = 18;
pub const NAL_IDR_W_RADL: u8 = 19;
pub const NAL_IDR_N_LP: u8 = 20;
pub const NAL_CRA: u8 = 21;
pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;
pub const NAL_AUD: u8 = 35;
pub const NAL_SEI_PREFIX: u8 = 39;
pub const NAL_SEI_SUFFIX: u8 = 40;

/// Access unit delimiter, pic_type 2 (I, P or B slices).
pub const AUD: [u8; 3] = [0x46, 0x01, 0x50];

#[inline]
pub fn nal_type(nalu: &[u8]) -> u8 {
    nalu.first().map_or(0, |b| (b >> 1) & 0x3F)
}

/// IRAP pictures: BLA, IDR and CRA.
pub fn is_irap(nal_type: u8) -> bool {
    (NAL_BLA_W_LP..=NAL_CRA).contains(&nal_type)
}

/// One `hvcC` NAL unit array.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NalArray {
    pub completeness: bool,
    pub nal_type: u8,
    pub units: Vec<Vec<u8>>,
}

/// Parsed `HEVCDecoderConfigurationRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HevcConfig {
    pub profile_space: u8,
    pub tier: bool,
    pub profile_idc: u8,
    pub compatibility_flags: u32,
    pub constraint_flags: u64,
    pub level_idc: u8,
    pub min_spatial_segmentation: u16,
    pub parallelism_type: u8,
    pub chroma_format: u8,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    pub avg_frame_rate: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    pub temporal_id_nested: bool,
    pub length_size: usize,
    pub arrays: Vec<NalArray>,
}

impl HevcConfig {
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < 23 {
            return Err(FormatError::invalid("hvcC: too short"));
        }
        Self::parse_bits(&mut BsIoSliceReader::from_slice(data))
            .map_err(|e| FormatError::invalid(format!("hvcC: {e}")))
    }

    fn parse_bits(bs: &mut BsIoSliceReader) -> io::Result<Self> {
        // configurationVersion
        bs.skip_n(8)?;
        let mut config = Self {
            profile_space: bs.get_n(2)?,
            tier: bs.get()?,
            profile_idc: bs.get_n(5)?,
            compatibility_flags: bs.get_n(32)?,
            constraint_flags: bs.get_n(48)?,
            level_idc: bs.get_n(8)?,
            ..Default::default()
        };
        bs.skip_n(4)?;
        config.min_spatial_segmentation = bs.get_n(12)?;
        bs.skip_n(6)?;
        config.parallelism_type = bs.get_n(2)?;
        bs.skip_n(6)?;
        config.chroma_format = bs.get_n(2)?;
        bs.skip_n(5)?;
        config.bit_depth_luma = bs.get_n::<u8>(3)? + 8;
        bs.skip_n(5)?;
        config.bit_depth_chroma = bs.get_n::<u8>(3)? + 8;
        config.avg_frame_rate = bs.get_n(16)?;
        config.constant_frame_rate = bs.get_n(2)?;
        config.num_temporal_layers = bs.get_n(3)?;
        config.temporal_id_nested = bs.get()?;
        config.length_size = bs.get_n::<u8>(2)? as usize + 1;

        let num_arrays = bs.get_n::<u8>(8)?;
        for _ in 0..num_arrays {
            let completeness = bs.get()?;
            bs.skip_n(1)?;
            let nal_type = bs.get_n::<u8>(6)?;
            let count = bs.get_n::<u16>(16)?;
            config.arrays.push(NalArray {
                completeness,
                nal_type,
                units: read_param_sets(bs, count as usize)?,
            });
        }

        Ok(config)
    }

    /// Builds a record from parameter set NAL units. Profile, tier, level,
    /// chroma format and bit depths come from the first SPS.
    pub fn from_param_sets(
        vps: Vec<Vec<u8>>,
        sps: Vec<Vec<u8>>,
        pps: Vec<Vec<u8>>,
    ) -> Result<Self, FormatError> {
        let first = sps
            .first()
            .ok_or_else(|| FormatError::invalid("hvcC: no SPS"))?;
        let info = Sps::parse(first)?;

        let arrays = [(NAL_VPS, vps), (NAL_SPS, sps), (NAL_PPS, pps)]
            .into_iter()
            .filter(|(_, units)| !units.is_empty())
            .map(|(nal_type, units)| NalArray {
                completeness: true,
                nal_type,
                units,
            })
            .collect();

        Ok(Self {
            profile_space: info.profile_space,
            tier: info.tier,
            profile_idc: info.profile_idc,
            compatibility_flags: info.compatibility_flags,
            constraint_flags: info.constraint_flags,
            level_idc: info.level_idc,
            chroma_format: info.chroma_format_idc as u8,
            bit_depth_luma: info.bit_depth_luma as u8,
            bit_depth_chroma: info.bit_depth_chroma as u8,
            num_temporal_layers: info.max_sub_layers,
            temporal_id_nested: info.temporal_id_nesting,
            length_size: 4,
            arrays,
            ..Default::default()
        })
    }

    pub fn units(&self, nal_type: u8) -> impl Iterator<Item = &Vec<u8>> {
        self.arrays
            .iter()
            .filter(move |a| a.nal_type == nal_type)
            .flat_map(|a| a.units.iter())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(1);
        out.push((self.profile_space << 6) | ((self.tier as u8) << 5) | (self.profile_idc & 0x1F));
        out.extend_from_slice(&self.compatibility_flags.to_be_bytes());
        out.extend_from_slice(&self.constraint_flags.to_be_bytes()[2..]);
        out.push(self.level_idc);
        out.extend_from_slice(&(0xF000 | (self.min_spatial_segmentation & 0x0FFF)).to_be_bytes());
        out.push(0xFC | (self.parallelism_type & 3));
        out.push(0xFC | (self.chroma_format & 3));
        out.push(0xF8 | (self.bit_depth_luma.saturating_sub(8) & 7));
        out.push(0xF8 | (self.bit_depth_chroma.saturating_sub(8) & 7));
        out.extend_from_slice(&self.avg_frame_rate.to_be_bytes());
        out.push(
            ((self.constant_frame_rate & 3) << 6)
                | ((self.num_temporal_layers & 7) << 3)
                | ((self.temporal_id_nested as u8) << 2)
                | (self.length_size.saturating_sub(1) as u8 & 3),
        );

        out.push(self.arrays.len() as u8);
        for array in &self.arrays {
            out.push(((array.completeness as u8) << 7) | (array.nal_type & 0x3F));
            out.extend_from_slice(&(array.units.len() as u16).to_be_bytes());
            write_param_sets(&mut out, &array.units);
        }
        out
    }
}

/// Fields of a sequence parameter set used for stream description.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sps {
    pub max_sub_layers: u8,
    pub temporal_id_nesting: bool,
    pub profile_space: u8,
    pub tier: bool,
    pub profile_idc: u8,
    pub compatibility_flags: u32,
    pub constraint_flags: u64,
    pub level_idc: u8,
    pub sps_id: u32,
    pub chroma_format_idc: u32,
    pub width: u32,
    pub height: u32,
    pub bit_depth_luma: u32,
    pub bit_depth_chroma: u32,
}

impl Sps {
    /// Parses an SPS NAL unit including its two byte header.
    pub fn parse(nalu: &[u8]) -> Result<Self, FormatError> {
        if nalu.len() < 4 || nal_type(nalu) != NAL_SPS {
            return Err(FormatError::invalid("hevc: not an SPS"));
        }
        let rbsp = nalu_unescape(&nalu[2..]);
        Self::parse_rbsp(&mut BsIoSliceReader::from_slice(&rbsp))
            .map_err(|e| FormatError::invalid(format!("hevc sps: {e}")))
    }

    fn parse_rbsp(bs: &mut BsIoSliceReader) -> io::Result<Self> {
        // sps_video_parameter_set_id
        bs.skip_n(4)?;
        let mut sps = Self {
            max_sub_layers: bs.get_n::<u8>(3)? + 1,
            temporal_id_nesting: bs.get()?,
            ..Default::default()
        };

        // profile_tier_level(1, sps_max_sub_layers_minus1)
        sps.profile_space = bs.get_n(2)?;
        sps.tier = bs.get()?;
        sps.profile_idc = bs.get_n(5)?;
        sps.compatibility_flags = bs.get_n(32)?;
        sps.constraint_flags = bs.get_n(48)?;
        sps.level_idc = bs.get_n(8)?;

        let sub_layers = (sps.max_sub_layers - 1) as usize;
        let mut present = [(false, false); 8];
        for flags in present.iter_mut().take(sub_layers) {
            *flags = (bs.get()?, bs.get()?);
        }
        if sub_layers > 0 {
            for _ in sub_layers..8 {
                bs.skip_n(2)?;
            }
        }
        for &(profile_present, level_present) in present.iter().take(sub_layers) {
            if profile_present {
                bs.skip_n(88)?;
            }
            if level_present {
                bs.skip_n(8)?;
            }
        }

        sps.sps_id = bs.get_ue()?;
        sps.chroma_format_idc = bs.get_ue()?;
        if sps.chroma_format_idc == 3 {
            // separate_colour_plane_flag
            bs.skip_n(1)?;
        }
        let width = bs.get_ue()?;
        let height = bs.get_ue()?;

        let (sub_width, sub_height) = match sps.chroma_format_idc {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };
        let (mut left, mut right, mut top, mut bottom) = (0, 0, 0, 0);
        if bs.get()? {
            left = bs.get_ue()?;
            right = bs.get_ue()?;
            top = bs.get_ue()?;
            bottom = bs.get_ue()?;
        }
        sps.width = width.saturating_sub(sub_width * (left + right));
        sps.height = height.saturating_sub(sub_height * (top + bottom));

        sps.bit_depth_luma = bs.get_ue()? + 8;
        sps.bit_depth_chroma = bs.get_ue()? + 8;

        Ok(sps)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    // Main profile, level 3.1, 416x240, 4:2:0 8 bit.
    pub(crate) const VPS: [u8; 4] = [0x40, 0x01, 0x0C, 0x01];
    pub(crate) const SPS_416X240: [u8; 23] = [
        0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03, 0x00,
        0x00, 0x03, 0x00, 0x5D, 0xA0, 0x0D, 0x08, 0x0F, 0x17,
    ];
    pub(crate) const PPS: [u8; 4] = [0x44, 0x01, 0xC1, 0x72];

    #[test]
    fn parse_main_sps() -> anyhow::Result<()> {
        let sps = Sps::parse(&SPS_416X240)?;
        assert_eq!(sps.max_sub_layers, 1);
        assert_eq!(sps.profile_idc, 1);
        assert_eq!(sps.level_idc, 93);
        assert_eq!(sps.chroma_format_idc, 1);
        assert_eq!((sps.width, sps.height), (416, 240));
        assert_eq!(sps.bit_depth_luma, 8);
        Ok(())
    }

    #[test]
    fn hvcc_build_and_parse() -> anyhow::Result<()> {
        let config = HevcConfig::from_param_sets(
            vec![VPS.to_vec()],
            vec![SPS_416X240.to_vec()],
            vec![PPS.to_vec()],
        )?;
        let bytes = config.to_bytes();
        assert_eq!(bytes[21] & 3, 3);
        assert_eq!(bytes[22], 3);

        let parsed = HevcConfig::parse(&bytes)?;
        assert_eq!(parsed, config);
        assert_eq!(parsed.units(NAL_SPS).count(), 1);
        assert_eq!(parsed.units(NAL_PPS).next(), Some(&PPS.to_vec()));
        Ok(())
    }

    #[test]
    fn nal_types() {
        assert_eq!(nal_type(&AUD), NAL_AUD);
        assert_eq!(nal_type(&SPS_416X240), NAL_SPS);
        assert!(is_irap(nal_type(&[0x26, 0x01])));
        assert!(!is_irap(nal_type(&[0x02, 0x01])));
    }
}
