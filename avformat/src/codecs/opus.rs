//! Opus packet durations and the `OpusHead` identification header.

/// Opus always runs at 48 kHz.
pub const SAMPLE_RATE: u32 = 48_000;

/// Pre-skip assumed when the container carries none, in 48 kHz samples.
pub const DEFAULT_PRE_SKIP: u16 = 312;

const STREAMS: [u8; 9] = [1, 1, 1, 2, 2, 3, 4, 4, 5];
const COUPLED: [u8; 9] = [1, 0, 1, 1, 2, 2, 2, 3, 3];
const CHANNEL_MAP: [&[u8]; 8] = [
    &[0],
    &[0, 1],
    &[0, 2, 1],
    &[0, 1, 2, 3],
    &[0, 4, 1, 2, 3],
    &[0, 4, 1, 2, 3, 5],
    &[0, 4, 1, 2, 3, 5, 6],
    &[0, 6, 1, 2, 3, 4, 5, 7],
];

/// `OpusHead` for `channels` channels in Vorbis channel order.
pub fn opus_head(channels: u32, pre_skip: u16) -> Vec<u8> {
    let channels = channels.clamp(1, 8) as usize;
    let mut out = b"OpusHead".to_vec();
    out.push(1);
    out.push(channels as u8);
    out.extend_from_slice(&pre_skip.to_le_bytes());
    out.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    if channels <= 2 {
        out.push(0);
    } else {
        out.push(1);
        out.push(STREAMS[channels]);
        out.push(COUPLED[channels]);
        out.extend_from_slice(CHANNEL_MAP[channels - 1]);
    }
    out
}

/// Samples per frame at 48 kHz for a TOC byte.
fn frame_samples(toc: u8) -> u32 {
    let config = toc >> 3;
    match config {
        0..=11 => [480, 960, 1920, 2880][(config & 3) as usize],
        12..=15 => [480, 960][(config & 1) as usize],
        _ => [120, 240, 480, 960][(config & 3) as usize],
    }
}

/// Samples in one Opus packet at 48 kHz.
pub fn packet_samples(packet: &[u8]) -> Option<u32> {
    let toc = *packet.first()?;
    let frames = match toc & 3 {
        0 => 1,
        1 | 2 => 2,
        _ => (*packet.get(1)? & 0x3F) as u32,
    };
    Some(frames * frame_samples(toc))
}
