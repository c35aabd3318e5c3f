//! MPEG-1/2/2.5 audio frame headers.

const SAMPLE_RATES: [u32; 3] = [44100, 48000, 32000];

const BITRATES_V1_L3: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L3: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// 1 for MPEG-1, 2 for MPEG-2 and 2.5.
    pub version: u8,
    pub layer: u8,
    pub sample_rate: u32,
    pub channels: u32,
    /// kbit/s, 0 for free format.
    pub bit_rate: u32,
    pub samples: u32,
}

impl FrameHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let [b0, b1, b2, b3, ..] = *data else {
            return None;
        };
        if b0 != 0xFF || b1 & 0xE0 != 0xE0 {
            return None;
        }
        let version_bits = (b1 >> 3) & 3;
        let layer = match (b1 >> 1) & 3 {
            3 => 1,
            2 => 2,
            1 => 3,
            _ => return None,
        };
        let rate_index = ((b2 >> 2) & 3) as usize;
        if version_bits == 1 || rate_index == 3 {
            return None;
        }
        let (version, sample_rate) = match version_bits {
            3 => (1, SAMPLE_RATES[rate_index]),
            2 => (2, SAMPLE_RATES[rate_index] / 2),
            _ => (2, SAMPLE_RATES[rate_index] / 4),
        };
        let bitrate_index = (b2 >> 4) as usize;
        if bitrate_index == 15 {
            return None;
        }
        let bit_rate = if layer == 3 {
            if version == 1 {
                BITRATES_V1_L3[bitrate_index]
            } else {
                BITRATES_V2_L3[bitrate_index]
            }
        } else {
            0
        };
        let samples = match (layer, version) {
            (1, _) => 384,
            (3, 2) => 576,
            _ => 1152,
        };
        Some(Self {
            version,
            layer,
            sample_rate,
            channels: if b3 >> 6 == 3 { 1 } else { 2 },
            bit_rate,
            samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer3_headers() {
        let header = FrameHeader::parse(&[0xFF, 0xFB, 0x90, 0x64]).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.layer, 3);
        assert_eq!(header.sample_rate, 44100);
        assert_eq!(header.channels, 2);
        assert_eq!(header.bit_rate, 128);
        assert_eq!(header.samples, 1152);

        let mono = FrameHeader::parse(&[0xFF, 0xF3, 0x84, 0xC4]).unwrap();
        assert_eq!(mono.sample_rate, 24000);
        assert_eq!(mono.channels, 1);
        assert_eq!(mono.samples, 576);

        assert!(FrameHeader::parse(&[0xFF, 0xFB, 0x9C, 0x64]).is_none());
        assert!(FrameHeader::parse(&[0xFF, 0xFB]).is_none());
    }
}
