pub mod aac;
pub mod flac;
pub mod h264;
pub mod hevc;
pub mod mp3;
pub mod nalu;
pub mod opus;
pub mod vvc;

use crate::structs::stream::CodecId;
use crate::utils::errors::FormatError;

/// Role of a NAL unit, independent of the codec numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalKind {
    Aud,
    Vps,
    Sps,
    Pps,
    SpsExt,
    Sei,
    /// Random access picture (IDR, CRA, BLA, GDR).
    Irap,
    Other,
}

/// Parameter set NAL units taken out of a decoder configuration record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSets {
    pub vps: Vec<Vec<u8>>,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
    pub sps_ext: Vec<Vec<u8>>,
}

impl ParamSets {
    pub fn is_empty(&self) -> bool {
        self.vps.is_empty() && self.sps.is_empty() && self.pps.is_empty()
    }

    /// In-band order: VPS, SPS, PPS, SPS extensions.
    pub fn iter(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.vps
            .iter()
            .chain(&self.sps)
            .chain(&self.pps)
            .chain(&self.sps_ext)
    }
}

/// The NAL unit based video codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalCodec {
    H264,
    Hevc,
    Vvc,
}

impl NalCodec {
    pub fn from_codec_id(codec_id: CodecId) -> Option<Self> {
        match codec_id {
            CodecId::H264 => Some(Self::H264),
            CodecId::Hevc => Some(Self::Hevc),
            CodecId::Vvc => Some(Self::Vvc),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Vvc => "vvc",
        }
    }

    pub fn kind(self, nalu: &[u8]) -> NalKind {
        match self {
            Self::H264 => match h264::nal_type(nalu) {
                h264::NAL_AUD => NalKind::Aud,
                h264::NAL_SPS => NalKind::Sps,
                h264::NAL_PPS => NalKind::Pps,
                h264::NAL_SPS_EXT => NalKind::SpsExt,
                h264::NAL_SEI => NalKind::Sei,
                h264::NAL_IDR => NalKind::Irap,
                _ => NalKind::Other,
            },
            Self::Hevc => match hevc::nal_type(nalu) {
                hevc::NAL_AUD => NalKind::Aud,
                hevc::NAL_VPS => NalKind::Vps,
                hevc::NAL_SPS => NalKind::Sps,
                hevc::NAL_PPS => NalKind::Pps,
                hevc::NAL_SEI_PREFIX | hevc::NAL_SEI_SUFFIX => NalKind::Sei,
                t if hevc::is_irap(t) => NalKind::Irap,
                _ => NalKind::Other,
            },
            Self::Vvc => match vvc::nal_type(nalu) {
                vvc::NAL_AUD => NalKind::Aud,
                vvc::NAL_VPS => NalKind::Vps,
                vvc::NAL_SPS => NalKind::Sps,
                vvc::NAL_PPS => NalKind::Pps,
                vvc::NAL_PREFIX_SEI | vvc::NAL_SUFFIX_SEI => NalKind::Sei,
                t if vvc::is_irap(t) => NalKind::Irap,
                _ => NalKind::Other,
            },
        }
    }

    pub fn aud(self) -> &'static [u8] {
        match self {
            Self::H264 => &h264::AUD,
            Self::Hevc => &hevc::AUD,
            Self::Vvc => &vvc::AUD,
        }
    }

    /// NAL length prefix width declared by a configuration record.
    pub fn length_size(self, extradata: &[u8]) -> Option<usize> {
        match self {
            Self::H264 => extradata.get(4).map(|b| (b & 3) as usize + 1),
            Self::Hevc => extradata.get(21).map(|b| (b & 3) as usize + 1),
            Self::Vvc => extradata.first().map(|b| ((b >> 1) & 3) as usize + 1),
        }
    }

    pub fn param_sets(self, extradata: &[u8]) -> Result<ParamSets, FormatError> {
        Ok(match self {
            Self::H264 => {
                let config = h264::AvcConfig::parse(extradata)?;
                ParamSets {
                    sps: config.sps,
                    pps: config.pps,
                    sps_ext: config.sps_ext,
                    ..Default::default()
                }
            }
            Self::Hevc => {
                let config = hevc::HevcConfig::parse(extradata)?;
                ParamSets {
                    vps: config.units(hevc::NAL_VPS).cloned().collect(),
                    sps: config.units(hevc::NAL_SPS).cloned().collect(),
                    pps: config.units(hevc::NAL_PPS).cloned().collect(),
                    ..Default::default()
                }
            }
            Self::Vvc => {
                let config = vvc::VvcConfig::parse(extradata)?;
                ParamSets {
                    vps: config.units(vvc::NAL_VPS).cloned().collect(),
                    sps: config.units(vvc::NAL_SPS).cloned().collect(),
                    pps: config.units(vvc::NAL_PPS).cloned().collect(),
                    ..Default::default()
                }
            }
        })
    }

    /// Builds a configuration record with 4-byte length prefixes.
    pub fn build_extradata(self, sets: ParamSets) -> Result<Vec<u8>, FormatError> {
        Ok(match self {
            Self::H264 => h264::AvcConfig::from_param_sets(sets.sps, sets.pps, sets.sps_ext)?.to_bytes(),
            Self::Hevc => hevc::HevcConfig::from_param_sets(sets.vps, sets.sps, sets.pps)?.to_bytes(),
            Self::Vvc => vvc::VvcConfig::from_param_sets(sets.vps, sets.sps, sets.pps).to_bytes(),
        })
    }

    /// Collects parameter sets from a list of NAL units.
    pub fn collect_param_sets<T: AsRef<[u8]>>(self, nalus: &[T]) -> ParamSets {
        let mut sets = ParamSets::default();
        for nalu in nalus {
            let nalu = nalu.as_ref();
            match self.kind(nalu) {
                NalKind::Vps => sets.vps.push(nalu.to_vec()),
                NalKind::Sps => sets.sps.push(nalu.to_vec()),
                NalKind::Pps => sets.pps.push(nalu.to_vec()),
                NalKind::SpsExt => sets.sps_ext.push(nalu.to_vec()),
                _ => {}
            }
        }
        sets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_size_from_records() {
        let avcc = [1, 0x42, 0xC0, 0x0D, 0xFD, 0xE0, 0];
        assert_eq!(NalCodec::H264.length_size(&avcc), Some(2));
        assert_eq!(NalCodec::H264.length_size(&avcc[..3]), None);

        let mut hvcc = [0u8; 23];
        hvcc[21] = 0x0F;
        assert_eq!(NalCodec::Hevc.length_size(&hvcc), Some(4));

        assert_eq!(NalCodec::Vvc.length_size(&[0xFB]), Some(2));
        assert_eq!(NalCodec::Vvc.length_size(&[0xFD]), Some(3));
        assert_eq!(NalCodec::H264.length_size(&[1, 0x64, 0, 0x1F, 0xFE]), Some(3));
    }

    #[test]
    fn extradata_round_trip() -> anyhow::Result<()> {
        let sets = ParamSets {
            sps: vec![h264::tests::SPS_320X240.to_vec()],
            pps: vec![h264::tests::PPS.to_vec()],
            ..Default::default()
        };
        let extradata = NalCodec::H264.build_extradata(sets.clone())?;
        assert_eq!(NalCodec::H264.param_sets(&extradata)?, sets);

        let nalus: [&[u8]; 3] = [&h264::AUD, &h264::tests::SPS_320X240, &h264::tests::PPS];
        assert_eq!(NalCodec::H264.collect_param_sets(&nalus), sets);
        assert_eq!(NalCodec::H264.kind(&h264::AUD), NalKind::Aud);
        Ok(())
    }
}
