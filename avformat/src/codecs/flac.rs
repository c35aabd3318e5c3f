//! FLAC STREAMINFO and frame header parsing.

use std::io;

use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::crc::FLAC_HEADER_CRC;
use crate::utils::errors::FormatError;

pub const STREAMINFO_SIZE: usize = 34;
pub const MIN_FRAME_SIZE: usize = 10;
/// Longest frame header: sync, 7 byte coded number, 16 bit block size and
/// rate, CRC-8.
pub const MAX_FRAME_HEADER_SIZE: usize = 16;

pub const METADATA_STREAMINFO: u8 = 0;
pub const METADATA_PADDING: u8 = 1;
pub const METADATA_APPLICATION: u8 = 2;
pub const METADATA_SEEKTABLE: u8 = 3;
pub const METADATA_VORBIS_COMMENT: u8 = 4;
pub const METADATA_CUESHEET: u8 = 5;
pub const METADATA_PICTURE: u8 = 6;

const SAMPLE_RATE_TABLE: [u32; 12] = [
    0, 88200, 176400, 192000, 8000, 16000, 22050, 24000, 32000, 44100, 48000, 96000,
];

const SAMPLE_SIZE_TABLE: [u32; 8] = [0, 8, 12, 0, 16, 20, 24, 32];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamInfo {
    pub min_block_size: u16,
    pub max_block_size: u16,
    pub min_frame_size: u32,
    pub max_frame_size: u32,
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    /// 0 when unknown.
    pub total_samples: u64,
    pub md5: [u8; 16],
}

impl StreamInfo {
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < STREAMINFO_SIZE {
            return Err(FormatError::invalid(format!(
                "STREAMINFO is {} bytes, expected {STREAMINFO_SIZE}",
                data.len()
            )));
        }
        let mut bs = BsIoSliceReader::from_slice(&data[..STREAMINFO_SIZE]);
        let parse = |bs: &mut BsIoSliceReader| -> io::Result<Self> {
            let mut info = Self {
                min_block_size: bs.get_n(16)?,
                max_block_size: bs.get_n(16)?,
                min_frame_size: bs.get_n(24)?,
                max_frame_size: bs.get_n(24)?,
                sample_rate: bs.get_n(20)?,
                channels: bs.get_n::<u8>(3)? + 1,
                bits_per_sample: bs.get_n::<u8>(5)? + 1,
                total_samples: bs.get_n(36)?,
                ..Default::default()
            };
            info.md5.copy_from_slice(&bs.get_bytes(16)?);
            Ok(info)
        };
        let info = parse(&mut bs).map_err(|e| FormatError::invalid(format!("STREAMINFO: {e}")))?;
        if info.sample_rate == 0 {
            return Err(FormatError::invalid("STREAMINFO: sample rate 0"));
        }
        Ok(info)
    }
}

/// Metadata block header: last flag, type, length.
pub fn parse_block_header(header: [u8; 4]) -> (bool, u8, usize) {
    let last = header[0] & 0x80 != 0;
    let kind = header[0] & 0x7F;
    let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
    (last, kind, len)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub variable_block_size: bool,
    pub block_size: u32,
    /// 0 when the STREAMINFO rate applies.
    pub sample_rate: u32,
    pub channels: u8,
    /// 0 when the STREAMINFO sample size applies.
    pub bits_per_sample: u32,
    /// Frame number for fixed block size streams, sample number otherwise.
    pub number: u64,
    pub header_len: usize,
}

impl FrameHeader {
    #[inline]
    pub fn has_sync(data: &[u8]) -> bool {
        data.len() >= 2 && data[0] == 0xFF && data[1] & 0xFE == 0xF8
    }

    /// Parses and CRC-checks the frame header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if !Self::has_sync(data) {
            return Err(FormatError::invalid("FLAC frame: missing sync code"));
        }
        let mut bs = BsIoSliceReader::from_slice(data);
        let mut header = Self::parse_bits(&mut bs)
            .map_err(|e| FormatError::invalid(format!("FLAC frame: {e}")))?;

        let bits = bs.position().map_err(FormatError::from)?;
        let len = (bits / 8) as usize;
        let crc = *data
            .get(len)
            .ok_or_else(|| FormatError::invalid("FLAC frame: truncated header"))?;
        if FLAC_HEADER_CRC.checksum(&data[..len]) != crc {
            return Err(FormatError::invalid("FLAC frame: header CRC mismatch"));
        }
        header.header_len = len + 1;
        Ok(header)
    }

    fn parse_bits(bs: &mut BsIoSliceReader) -> io::Result<Self> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

        bs.skip_n(15)?;
        let variable_block_size = bs.get()?;
        let block_size_code = bs.get_n::<u8>(4)?;
        let sample_rate_code = bs.get_n::<u8>(4)?;
        let channel_code = bs.get_n::<u8>(4)?;
        let sample_size_code = bs.get_n::<u8>(3)?;
        if bs.get()? {
            return Err(invalid("reserved bit set"));
        }

        let channels = match channel_code {
            0..=7 => channel_code + 1,
            8..=10 => 2,
            _ => return Err(invalid("reserved channel assignment")),
        };
        if sample_size_code == 3 {
            return Err(invalid("reserved sample size"));
        }
        let number = bs.get_utf8_coded()?;

        let block_size = match block_size_code {
            0 => return Err(invalid("reserved block size")),
            1 => 192,
            2..=5 => 576 << (block_size_code - 2),
            6 => bs.get_n::<u32>(8)? + 1,
            7 => bs.get_n::<u32>(16)? + 1,
            _ => 256 << (block_size_code - 8),
        };
        let sample_rate = match sample_rate_code {
            0..=11 => SAMPLE_RATE_TABLE[sample_rate_code as usize],
            12 => bs.get_n::<u32>(8)? * 1000,
            13 => bs.get_n::<u32>(16)?,
            14 => bs.get_n::<u32>(16)? * 10,
            _ => return Err(invalid("invalid sample rate code")),
        };

        Ok(Self {
            variable_block_size,
            block_size,
            sample_rate,
            channels,
            bits_per_sample: SAMPLE_SIZE_TABLE[sample_size_code as usize],
            number,
            header_len: 0,
        })
    }

    /// First sample of this frame.
    pub fn first_sample(&self, fixed_block_size: u32) -> u64 {
        if self.variable_block_size {
            self.number
        } else {
            self.number * fixed_block_size as u64
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a fixed block size frame header for frame `number` (< 128),
    /// 4096 samples, 44.1 kHz, stereo, 16 bit.
    pub(crate) fn frame_header(number: u8) -> Vec<u8> {
        let mut header = vec![0xFF, 0xF8, 0xC9, 0x18, number];
        header.push(FLAC_HEADER_CRC.checksum(&header));
        header
    }

    pub(crate) fn streaminfo(total_samples: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(STREAMINFO_SIZE);
        data.extend_from_slice(&4096u16.to_be_bytes());
        data.extend_from_slice(&4096u16.to_be_bytes());
        data.extend_from_slice(&[0, 0, 14, 0, 0x40, 0]);
        // 44100 Hz (20), 2 channels (3), 16 bits (5), total samples (36)
        let packed: u64 = (44100u64 << 44) | (1 << 41) | (15 << 36) | total_samples;
        data.extend_from_slice(&packed.to_be_bytes());
        data.extend_from_slice(&[0; 16]);
        data
    }

    #[test]
    fn parse_streaminfo() -> anyhow::Result<()> {
        let info = StreamInfo::parse(&streaminfo(441_000))?;
        assert_eq!(info.max_block_size, 4096);
        assert_eq!(info.min_frame_size, 14);
        assert_eq!(info.max_frame_size, 0x4000);
        assert_eq!(info.sample_rate, 44100);
        assert_eq!(info.channels, 2);
        assert_eq!(info.bits_per_sample, 16);
        assert_eq!(info.total_samples, 441_000);
        assert!(StreamInfo::parse(&[0; 10]).is_err());
        Ok(())
    }

    #[test]
    fn parse_frame_header() -> anyhow::Result<()> {
        let data = frame_header(3);
        let header = FrameHeader::parse(&data)?;
        assert!(!header.variable_block_size);
        assert_eq!(header.block_size, 4096);
        assert_eq!(header.sample_rate, 44100);
        assert_eq!(header.channels, 2);
        assert_eq!(header.bits_per_sample, 16);
        assert_eq!(header.number, 3);
        assert_eq!(header.header_len, 6);
        assert_eq!(header.first_sample(4096), 3 * 4096);

        let mut corrupt = data.clone();
        corrupt[5] ^= 0xFF;
        assert!(FrameHeader::parse(&corrupt).is_err());
        Ok(())
    }

    #[test]
    fn block_headers() {
        assert_eq!(parse_block_header([0x80, 0, 0, 34]), (true, METADATA_STREAMINFO, 34));
        assert_eq!(parse_block_header([0x04, 0, 1, 0]), (false, METADATA_VORBIS_COMMENT, 256));
    }
}
