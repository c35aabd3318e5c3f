//! AAC framing: ADTS headers and `AudioSpecificConfig`.

use std::io;

use crate::utils::bitstream_io::{BitstreamIoWriter, BsIoSliceReader};
use crate::utils::errors::FormatError;

pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Samples per raw data block.
pub const FRAME_SAMPLES: u32 = 1024;

pub const ADTS_HEADER_SIZE: usize = 7;
pub const ADTS_CRC_SIZE: usize = 2;

/// AAC-LC object type.
pub const OBJECT_TYPE_LC: u8 = 2;

pub fn sample_rate_index(sample_rate: u32) -> Option<u8> {
    SAMPLE_RATES
        .iter()
        .position(|&rate| rate == sample_rate)
        .map(|i| i as u8)
}

/// Fixed and variable ADTS header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdtsHeader {
    pub protection_absent: bool,
    /// Audio object type (profile + 1).
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub channel_config: u8,
    /// Whole frame length including the header.
    pub frame_length: usize,
    pub raw_blocks: u8,
}

impl AdtsHeader {
    #[inline]
    pub fn has_sync(data: &[u8]) -> bool {
        data.len() >= 2 && data[0] == 0xFF && data[1] & 0xF0 == 0xF0
    }

    /// Parses the header at the start of `data`. `None` when the sync word or
    /// the sampling index is invalid, or fewer than 7 bytes are present.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ADTS_HEADER_SIZE || !Self::has_sync(data) {
            return None;
        }
        let header = Self {
            protection_absent: data[1] & 0x01 != 0,
            object_type: ((data[2] & 0xC0) >> 6) + 1,
            sample_rate_index: (data[2] & 0x3C) >> 2,
            channel_config: ((data[2] & 0x01) << 2) | ((data[3] & 0xC0) >> 6),
            frame_length: (((data[3] & 0x03) as usize) << 11)
                | ((data[4] as usize) << 3)
                | (((data[5] & 0xE0) as usize) >> 5),
            raw_blocks: data[6] & 0x03,
        };
        if header.sample_rate_index as usize >= SAMPLE_RATES.len() {
            return None;
        }
        Some(header)
    }

    pub fn header_len(&self) -> usize {
        if self.protection_absent {
            ADTS_HEADER_SIZE
        } else {
            ADTS_HEADER_SIZE + ADTS_CRC_SIZE
        }
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATES[self.sample_rate_index as usize]
    }

    /// Samples carried by this frame.
    pub fn samples(&self) -> u32 {
        (self.raw_blocks as u32 + 1) * FRAME_SAMPLES
    }

    pub fn audio_specific_config(&self) -> AudioSpecificConfig {
        AudioSpecificConfig {
            object_type: self.object_type,
            sample_rate_index: self.sample_rate_index,
            sample_rate: self.sample_rate(),
            channel_config: self.channel_config,
        }
    }
}

/// Writes a 7-byte ADTS header (no CRC) for a raw payload of `payload_len`.
pub fn write_adts_header(
    config: &AudioSpecificConfig,
    payload_len: usize,
) -> Result<[u8; ADTS_HEADER_SIZE], FormatError> {
    let frame_length = payload_len + ADTS_HEADER_SIZE;
    if frame_length > 0x1FFF {
        return Err(FormatError::params(format!(
            "AAC frame of {payload_len} bytes does not fit an ADTS header"
        )));
    }
    let sample_rate_index = match config.sample_rate_index {
        i if (i as usize) < SAMPLE_RATES.len() => i,
        _ => sample_rate_index(config.sample_rate).ok_or_else(|| {
            FormatError::params(format!("no ADTS index for {} Hz", config.sample_rate))
        })?,
    };

    let bits = || -> io::Result<Vec<u8>> {
        let mut w = BitstreamIoWriter::new();
        w.put_n(12, 0xFFFu16)?;
        // MPEG-4, layer 0, no CRC
        w.put(false)?;
        w.put_n(2, 0u8)?;
        w.put(true)?;
        w.put_n(2, config.object_type.saturating_sub(1).min(3))?;
        w.put_n(4, sample_rate_index)?;
        w.put(false)?;
        w.put_n(3, config.channel_config & 7)?;
        // original/copy, home, copyright id bit and start
        w.put_n(4, 0u8)?;
        w.put_n(13, frame_length as u16)?;
        w.put_n(11, 0x7FFu16)?;
        w.put_n(2, 0u8)?;
        w.finish()
    };
    let bytes = bits().map_err(FormatError::from)?;

    let mut header = [0u8; ADTS_HEADER_SIZE];
    header.copy_from_slice(&bytes);
    Ok(header)
}

/// MPEG-4 `AudioSpecificConfig`, the fields needed for framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    /// 15 when the sample rate is explicit.
    pub sample_rate_index: u8,
    pub sample_rate: u32,
    pub channel_config: u8,
}

impl AudioSpecificConfig {
    pub fn new(object_type: u8, sample_rate: u32, channel_config: u8) -> Self {
        Self {
            object_type,
            sample_rate_index: sample_rate_index(sample_rate).unwrap_or(15),
            sample_rate,
            channel_config,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < 2 {
            return Err(FormatError::invalid("AudioSpecificConfig too short"));
        }
        let mut bs = BsIoSliceReader::from_slice(data);
        let parse = |bs: &mut BsIoSliceReader| -> io::Result<Self> {
            let mut object_type = bs.get_n::<u8>(5)?;
            if object_type == 31 {
                object_type = 32 + bs.get_n::<u8>(6)?;
            }
            let sample_rate_index = bs.get_n::<u8>(4)?;
            let sample_rate = if sample_rate_index == 15 {
                bs.get_n::<u32>(24)?
            } else {
                SAMPLE_RATES
                    .get(sample_rate_index as usize)
                    .copied()
                    .unwrap_or(0)
            };
            let channel_config = bs.get_n::<u8>(4)?;
            Ok(Self {
                object_type,
                sample_rate_index,
                sample_rate,
                channel_config,
            })
        };
        let config = parse(&mut bs)
            .map_err(|e| FormatError::invalid(format!("AudioSpecificConfig: {e}")))?;
        if config.sample_rate == 0 {
            return Err(FormatError::invalid(format!(
                "AudioSpecificConfig: reserved sampling index {}",
                config.sample_rate_index
            )));
        }
        Ok(config)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let bits = || -> io::Result<Vec<u8>> {
            let mut w = BitstreamIoWriter::new();
            if self.object_type >= 32 {
                w.put_n(5, 31u8)?;
                w.put_n(6, self.object_type - 32)?;
            } else {
                w.put_n(5, self.object_type)?;
            }
            match sample_rate_index(self.sample_rate) {
                Some(index) => w.put_n(4, index)?,
                None => {
                    w.put_n(4, 15u8)?;
                    w.put_n(24, self.sample_rate)?;
                }
            }
            w.put_n(4, self.channel_config & 0x0F)?;
            // GASpecificConfig: frame length 1024, no core coder, no extension
            w.put_n(3, 0u8)?;
            w.finish()
        };
        // Writing into a Vec cannot fail.
        bits().unwrap_or_default()
    }

    pub fn channels(&self) -> u32 {
        match self.channel_config {
            7 => 8,
            c => c as u32,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    // 44.1 kHz stereo LC, 371 byte frame, one raw block.
    pub(crate) const ADTS_HEADER: [u8; 7] = [0xFF, 0xF1, 0x50, 0x80, 0x2E, 0x7F, 0xFC];

    #[test]
    fn parse_adts_header() {
        let header = AdtsHeader::parse(&ADTS_HEADER).unwrap();
        assert!(header.protection_absent);
        assert_eq!(header.object_type, OBJECT_TYPE_LC);
        assert_eq!(header.sample_rate(), 44100);
        assert_eq!(header.channel_config, 2);
        assert_eq!(header.frame_length, 371);
        assert_eq!(header.header_len(), 7);
        assert_eq!(header.samples(), 1024);

        assert!(AdtsHeader::parse(&ADTS_HEADER[..6]).is_none());
        assert!(AdtsHeader::parse(&[0xFF, 0x01, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn write_matches_parse() -> anyhow::Result<()> {
        let config = AudioSpecificConfig::new(OBJECT_TYPE_LC, 44100, 2);
        let header = write_adts_header(&config, 364)?;
        assert_eq!(header, ADTS_HEADER);
        assert!(write_adts_header(&config, 0x2000).is_err());
        Ok(())
    }

    #[test]
    fn audio_specific_config() -> anyhow::Result<()> {
        let config = AudioSpecificConfig::new(OBJECT_TYPE_LC, 44100, 2);
        assert_eq!(config.to_bytes(), [0x12, 0x10]);
        assert_eq!(AudioSpecificConfig::parse(&[0x12, 0x10])?, config);

        let explicit = AudioSpecificConfig::new(OBJECT_TYPE_LC, 37800, 1);
        assert_eq!(AudioSpecificConfig::parse(&explicit.to_bytes())?, explicit);

        assert!(AudioSpecificConfig::parse(&[0x16, 0x90]).is_err());
        Ok(())
    }
}
