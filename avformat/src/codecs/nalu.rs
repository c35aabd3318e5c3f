//! NAL unit delimiting: start codes, length prefixes and emulation prevention.

use crate::utils::errors::BsfError;

pub const START_CODE_LONG: [u8; 4] = [0, 0, 0, 1];
pub const START_CODE_SHORT: [u8; 3] = [0, 0, 1];

/// Start code width used when joining NAL units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCodeMode {
    /// Every unit gets `00 00 00 01`.
    Long,
    /// First unit gets `00 00 00 01`, the rest `00 00 01`.
    FirstLong,
    /// Every unit gets `00 00 01`.
    Short,
}

/// Whether `data` begins with a start code.
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&START_CODE_SHORT) || data.starts_with(&START_CODE_LONG)
}

/// Finds the next start code at or after `from`.
///
/// Returns `(offset, len)`: where the start code begins and its width (3 or 4).
/// Zero bytes beyond the fourth stay with the preceding unit.
pub fn next_nalu_start(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut zeros = 0usize;
    for (i, &b) in data.iter().enumerate().skip(from) {
        match b {
            0 => zeros += 1,
            1 if zeros >= 2 => {
                let prefix = zeros.min(3);
                return Some((i - prefix, prefix + 1));
            }
            _ => zeros = 0,
        }
    }
    None
}

/// Splits a start-code delimited buffer. Bytes before the first start code
/// are ignored.
pub fn split_nalu_by_start_code(data: &[u8]) -> Vec<&[u8]> {
    let mut nalus = Vec::new();
    let Some((first, len)) = next_nalu_start(data, 0) else {
        return nalus;
    };

    let mut begin = first + len;
    while let Some((offset, len)) = next_nalu_start(data, begin) {
        if offset > begin {
            nalus.push(&data[begin..offset]);
        }
        begin = offset + len;
    }
    if begin < data.len() {
        nalus.push(&data[begin..]);
    }

    nalus
}

/// Splits a length-prefixed buffer with `length_size` byte prefixes (1..=4).
pub fn split_nalu_by_length(data: &[u8], length_size: usize) -> Result<Vec<&[u8]>, BsfError> {
    let mut nalus = Vec::new();
    let mut pos = 0usize;

    while pos + length_size <= data.len() {
        let length = data[pos..pos + length_size]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        pos += length_size;

        let remaining = data.len() - pos;
        if length > remaining {
            return Err(BsfError::NaluOverrun { length, remaining });
        }
        if length > 0 {
            nalus.push(&data[pos..pos + length]);
        }
        pos += length;
    }

    if pos < data.len() {
        log::debug!(
            "{} trailing bytes after last length-prefixed NAL unit",
            data.len() - pos
        );
    }

    Ok(nalus)
}

pub fn join_nalu_by_start_code<T: AsRef<[u8]>>(nalus: &[T], mode: StartCodeMode) -> Vec<u8> {
    let total: usize = nalus.iter().map(|n| n.as_ref().len() + 4).sum();
    let mut out = Vec::with_capacity(total);
    for (i, nalu) in nalus.iter().enumerate() {
        let long = match mode {
            StartCodeMode::Long => true,
            StartCodeMode::FirstLong => i == 0,
            StartCodeMode::Short => false,
        };
        if long {
            out.extend_from_slice(&START_CODE_LONG);
        } else {
            out.extend_from_slice(&START_CODE_SHORT);
        }
        out.extend_from_slice(nalu.as_ref());
    }
    out
}

pub fn join_nalu_by_length<T: AsRef<[u8]>>(nalus: &[T], length_size: usize) -> Vec<u8> {
    let total: usize = nalus.iter().map(|n| n.as_ref().len() + length_size).sum();
    let mut out = Vec::with_capacity(total);
    for nalu in nalus {
        let nalu = nalu.as_ref();
        let len = (nalu.len() as u64).to_be_bytes();
        out.extend_from_slice(&len[8 - length_size..]);
        out.extend_from_slice(nalu);
    }
    out
}

/// Removes emulation prevention bytes (`00 00 03` → `00 00`).
pub fn nalu_unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    out
}

/// Inserts emulation prevention bytes before `00`..`03` following two zeros.
pub fn nalu_escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64);
    let mut zeros = 0usize;
    for &b in data {
        if zeros >= 2 && b <= 3 {
            out.push(3);
            zeros = 0;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNITS: [&[u8]; 4] = [
        &[0x09, 0xF0],
        &[0x67, 0x42, 0x00, 0x1E, 0xAB],
        &[0x68, 0xCE, 0x38, 0x80],
        &[0x65, 0x88, 0x84, 0x00, 0x00, 0x7F, 0x12],
    ];

    #[test]
    fn start_code_search() {
        let data = [0xAA, 0, 0, 1, 0x65, 0, 0, 0, 1, 0x41, 0, 0, 0, 0, 1, 0x41];
        assert_eq!(next_nalu_start(&data, 0), Some((1, 3)));
        assert_eq!(next_nalu_start(&data, 4), Some((5, 4)));
        assert_eq!(next_nalu_start(&data, 9), Some((11, 4)));
        assert_eq!(next_nalu_start(&data, 15), None);

        let units = split_nalu_by_start_code(&data);
        assert_eq!(units, vec![&[0x65][..], &[0x41, 0][..], &[0x41][..]]);
    }

    #[test]
    fn start_code_length_start_code_round_trip() -> Result<(), BsfError> {
        let annexb = join_nalu_by_start_code(&UNITS, StartCodeMode::FirstLong);
        let split = split_nalu_by_start_code(&annexb);
        assert_eq!(split, UNITS.to_vec());

        for length_size in [1, 2, 4] {
            let avcc = join_nalu_by_length(&split, length_size);
            let back = split_nalu_by_length(&avcc, length_size)?;
            assert_eq!(back, UNITS.to_vec());

            let annexb_again = join_nalu_by_start_code(&back, StartCodeMode::Long);
            assert_eq!(split_nalu_by_start_code(&annexb_again), UNITS.to_vec());
        }
        Ok(())
    }

    #[test]
    fn length_start_code_length_round_trip() -> Result<(), BsfError> {
        let avcc = join_nalu_by_length(&UNITS, 4);
        let units = split_nalu_by_length(&avcc, 4)?;
        let annexb = join_nalu_by_start_code(&units, StartCodeMode::Short);
        let back = join_nalu_by_length(&split_nalu_by_start_code(&annexb), 4);
        assert_eq!(back, avcc);
        Ok(())
    }

    #[test]
    fn length_overrun_is_an_error() {
        let data = [0, 0, 0, 9, 0x65, 0x88];
        assert!(matches!(
            split_nalu_by_length(&data, 4),
            Err(BsfError::NaluOverrun {
                length: 9,
                remaining: 2
            })
        ));
    }

    #[test]
    fn emulation_prevention() {
        let raw = [0x65, 0, 0, 1, 0, 0, 0, 0, 0, 3];
        let escaped = nalu_escape(&raw);
        assert_eq!(escaped, [0x65, 0, 0, 3, 1, 0, 0, 3, 0, 0, 3, 0, 3]);
        assert_eq!(nalu_unescape(&escaped), raw);
    }
}
