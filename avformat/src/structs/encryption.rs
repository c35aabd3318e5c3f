//! Common Encryption (CENC) metadata carried as packet and stream side data.

use super::fourcc::FourCC;

pub const SCHEME_CENC: FourCC = FourCC::new(b"cenc");
pub const SCHEME_CBC1: FourCC = FourCC::new(b"cbc1");
pub const SCHEME_CENS: FourCC = FourCC::new(b"cens");
pub const SCHEME_CBCS: FourCC = FourCC::new(b"cbcs");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Subsample {
    pub bytes_of_clear_data: u32,
    pub bytes_of_protected_data: u32,
}

/// Per-sample encryption parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncryptionInfo {
    pub scheme: FourCC,
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
    pub key_id: [u8; 16],
    pub iv: Vec<u8>,
    pub subsamples: Vec<Subsample>,
}

/// Protection system header (`pssh`) content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncryptionInitInfo {
    pub system_id: [u8; 16],
    pub key_ids: Vec<[u8; 16]>,
    pub data: Vec<u8>,
}

/// Track defaults from `tenc`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackEncryption {
    pub is_protected: bool,
    pub per_sample_iv_size: u8,
    pub key_id: [u8; 16],
    pub constant_iv: Vec<u8>,
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
}

/// Sample auxiliary data read from `senc`, before track defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SampleEncryption {
    pub iv: Vec<u8>,
    pub subsamples: Vec<Subsample>,
}

impl EncryptionInfo {
    pub fn from_track(
        scheme: FourCC,
        track: &TrackEncryption,
        sample: Option<&SampleEncryption>,
    ) -> Self {
        let iv = match sample {
            Some(s) if !s.iv.is_empty() => s.iv.clone(),
            _ => track.constant_iv.clone(),
        };
        Self {
            scheme,
            crypt_byte_block: track.crypt_byte_block,
            skip_byte_block: track.skip_byte_block,
            key_id: track.key_id,
            iv,
            subsamples: sample.map(|s| s.subsamples.clone()).unwrap_or_default(),
        }
    }
}
