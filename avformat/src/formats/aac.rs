//! Raw ADTS AAC demuxer.

use log::Level;

use super::{IFormat, InputContext, PROBE_SCORE_MAX, PROBE_SCORE_PARTIAL, SeekFlags};
use crate::codecs::aac::{ADTS_HEADER_SIZE, AdtsHeader, AudioSpecificConfig, FRAME_SAMPLES};
use crate::io::IoReader;
use crate::log_or_err;
use crate::structs::packet::{Packet, PacketFlags, SideData};
use crate::structs::rational::{MILLI_TIME_BASE, Rational, rescale};
use crate::structs::stream::{CodecId, CodecParameters, Stream};
use crate::utils::errors::FormatError;

pub const ID3V2_HEADER_SIZE: usize = 10;

/// Window searched per resync attempt.
const SYNC_WINDOW: usize = 64 * 1024;
/// Bytes skipped looking for a frame before giving up.
const MAX_SYNC_SCAN: u64 = 1024 * 1024;
/// Frames in a row needed to trust a sync position.
const SYNC_FRAMES: usize = 2;

/// Length of an ID3v2 tag at the start of `buf`, footer included.
pub fn id3v2_size(buf: &[u8]) -> Option<u64> {
    if buf.len() < ID3V2_HEADER_SIZE || &buf[..3] != b"ID3" || buf[6..10].iter().any(|&b| b & 0x80 != 0) {
        return None;
    }
    let size = buf[6..10].iter().fold(0u64, |acc, &b| (acc << 7) | b as u64);
    let footer = if buf[5] & 0x10 != 0 { 10 } else { 0 };
    Some(ID3V2_HEADER_SIZE as u64 + size + footer)
}

/// ADTS header at the start of `data` with a plausible frame length.
fn frame_header(data: &[u8]) -> Option<AdtsHeader> {
    // Layer bits are always zero; this keeps MPEG audio frames out.
    if data.len() < 2 || data[1] & 0x06 != 0 {
        return None;
    }
    AdtsHeader::parse(data).filter(|h| h.frame_length >= h.header_len())
}

/// Back-to-back frames at the start of `buf`. A frame cut off by the end of
/// `buf` still counts.
fn count_frames(buf: &[u8]) -> usize {
    let mut pos = 0;
    let mut count = 0;
    while pos < buf.len() {
        let Some(header) = frame_header(&buf[pos..]) else {
            break;
        };
        count += 1;
        pos += header.frame_length;
    }
    count
}

#[derive(Debug, Default)]
pub struct IAacFormat {
    data_start: u64,
    next_pts: i64,
    config: Option<AudioSpecificConfig>,
    /// `(pts, pos)` of every frame before `indexed_end`.
    index: Vec<(i64, u64)>,
    indexed_end: u64,
    indexed_pts: i64,
    index_complete: bool,
}

impl IAacFormat {
    /// Moves to the next position where frames follow each other. Returns
    /// `false` when the input ends first.
    fn resync(&self, io: &mut IoReader) -> Result<bool, FormatError> {
        let start = io.pos();
        while io.pos() - start < MAX_SYNC_SCAN {
            let window = io.peek(SYNC_WINDOW)?;
            let at_end = window.len() < SYNC_WINDOW;
            let found = (0..window.len()).find(|&i| {
                let rest = &window[i..];
                let Some(header) = frame_header(rest) else {
                    return false;
                };
                count_frames(rest) >= SYNC_FRAMES || (at_end && header.frame_length >= rest.len())
            });
            if let Some(skip) = found {
                if io.pos() + skip as u64 > start {
                    log::warn!("aac: skipped {} bytes to resync", io.pos() + skip as u64 - start);
                }
                io.skip(skip as u64)?;
                return Ok(true);
            }
            if at_end {
                return Ok(false);
            }
            // Keep a header's worth of overlap with the next window.
            io.skip((window.len() - ADTS_HEADER_SIZE) as u64)?;
        }
        Err(FormatError::invalid(format!(
            "aac: no ADTS frame within {MAX_SYNC_SCAN} bytes of {start}"
        )))
    }

    /// Walks frame headers from the end of the index until `until_pts` is
    /// covered or the input ends, then restores the read position.
    fn extend_index(&mut self, io: &mut IoReader, until_pts: i64) -> Result<(), FormatError> {
        if self.index_complete {
            return Ok(());
        }
        let saved = io.pos();
        let (mut pts, mut pos) = (self.indexed_pts, self.indexed_end);
        while pts <= until_pts {
            io.seek(pos)?;
            let head = io.peek(ADTS_HEADER_SIZE)?;
            let Some(header) = frame_header(&head) else {
                self.index_complete = true;
                break;
            };
            if io.size() > 0 && pos + header.frame_length as u64 > io.size() {
                self.index_complete = true;
                break;
            }
            self.index.push((pts, pos));
            pts += header.samples() as i64;
            pos += header.frame_length as u64;
        }
        self.indexed_pts = pts;
        self.indexed_end = pos;
        io.seek(saved)?;
        Ok(())
    }

    fn seek_to_entry(&mut self, io: &mut IoReader, entry: (i64, u64)) -> Result<(), FormatError> {
        io.seek(entry.1)?;
        self.next_pts = entry.0;
        Ok(())
    }
}

impl IFormat for IAacFormat {
    fn name(&self) -> &'static str {
        "aac"
    }

    fn probe(buf: &[u8]) -> u8 {
        let start = id3v2_size(buf).unwrap_or(0);
        if start as usize >= buf.len() {
            return 0;
        }
        match count_frames(&buf[start as usize..]) {
            0 => 0,
            1 | 2 => PROBE_SCORE_PARTIAL,
            _ => PROBE_SCORE_MAX,
        }
    }

    fn read_header(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        let head = ctx.io.peek(ID3V2_HEADER_SIZE)?;
        if let Some(size) = id3v2_size(&head) {
            log::debug!("aac: skipping {size} byte ID3v2 tag");
            ctx.io.skip(size)?;
        }
        if frame_header(&ctx.io.peek(ADTS_HEADER_SIZE)?).is_none() && !self.resync(&mut ctx.io)? {
            return Err(FormatError::invalid("aac: no ADTS frame found"));
        }
        self.data_start = ctx.io.pos();
        self.indexed_end = self.data_start;

        let head = ctx.io.peek(ADTS_HEADER_SIZE)?;
        let header = frame_header(&head)
            .ok_or_else(|| FormatError::invalid("aac: invalid first ADTS header"))?;
        let config = header.audio_specific_config();
        let mut stream = Stream::new(0, Rational::new(1, config.sample_rate as i32));
        stream.codecpar = CodecParameters::audio(CodecId::Aac, config.sample_rate, config.channels());
        stream.codecpar.profile = config.object_type as i32 - 1;
        stream.codecpar.frame_size = FRAME_SAMPLES;
        stream.codecpar.extradata = config.to_bytes();
        stream.start_time = 0;
        self.config = Some(config);

        if ctx.io.size() > 0 {
            self.extend_index(&mut ctx.io, i64::MAX)?;
            let duration = self.indexed_pts;
            stream.duration = duration;
            stream.nb_frames = self.index.len() as u64;
            let bytes = self.indexed_end - self.data_start;
            if duration > 0 {
                stream.codecpar.bit_rate =
                    (bytes as i64 * 8 * config.sample_rate as i64) / duration;
            }
            ctx.duration = rescale(duration, stream.time_base, MILLI_TIME_BASE);
        }
        log::debug!(
            "aac: object type {}, {} Hz, channel config {}, {} frames",
            config.object_type,
            config.sample_rate,
            config.channel_config,
            self.index.len()
        );
        ctx.add_stream(stream);
        Ok(())
    }

    fn read_packet(&mut self, ctx: &mut InputContext) -> Result<Packet, FormatError> {
        loop {
            let pos = ctx.io.pos();
            let head = ctx.io.peek(ADTS_HEADER_SIZE)?;
            if head.is_empty() {
                return Err(FormatError::Eof);
            }
            if head.len() < ADTS_HEADER_SIZE {
                log::debug!("aac: {} trailing bytes ignored", head.len());
                ctx.io.skip(head.len() as u64)?;
                return Err(FormatError::Eof);
            }
            let Some(header) = frame_header(&head) else {
                log_or_err!(ctx, Level::Warn, FormatError::invalid(format!("aac: lost sync at {pos}")));
                ctx.io.skip(1)?;
                if !self.resync(&mut ctx.io)? {
                    return Err(FormatError::Eof);
                }
                continue;
            };

            let frame = match ctx.io.read_bytes(header.frame_length) {
                Ok(frame) => frame,
                Err(e) => {
                    let err = FormatError::from(e);
                    if err.is_eof() {
                        log::warn!("aac: truncated final frame at {pos}");
                    }
                    return Err(err);
                }
            };

            let mut packet = Packet::from_vec(frame[header.header_len()..].to_vec());
            packet.stream_index = 0;
            packet.pts = self.next_pts;
            packet.dts = self.next_pts;
            packet.duration = header.samples() as i64;
            packet.pos = pos as i64;
            packet.flags |= PacketFlags::KEY;

            let config = header.audio_specific_config();
            if self.config != Some(config) {
                log::info!(
                    "aac: config changed at {pos}: object type {}, {} Hz, channel config {}",
                    config.object_type,
                    config.sample_rate,
                    config.channel_config
                );
                packet.add_side_data(SideData::NewExtradata(config.to_bytes()));
                self.config = Some(config);
            }

            self.next_pts += packet.duration;
            if pos == self.indexed_end && !self.index_complete {
                self.index.push((packet.pts, pos));
                self.indexed_end = pos + header.frame_length as u64;
                self.indexed_pts = self.next_pts;
            }
            return Ok(packet);
        }
    }

    fn seek(
        &mut self,
        ctx: &mut InputContext,
        stream_index: usize,
        timestamp: i64,
        flags: SeekFlags,
    ) -> Result<(), FormatError> {
        ctx.stream(stream_index)?;
        if flags.contains(SeekFlags::BYTE) {
            let mut target = (timestamp.max(0) as u64).max(self.data_start);
            if ctx.io.size() > 0 {
                target = target.min(ctx.io.size());
            }
            ctx.io.seek(target)?;
            if !flags.contains(SeekFlags::ANY) && !self.resync(&mut ctx.io)? {
                return Err(FormatError::Eof);
            }
            let pos = ctx.io.pos();
            let i = self.index.partition_point(|&(_, p)| p < pos);
            self.next_pts = match self.index.get(i) {
                Some(&(pts, _)) => pts,
                None => self.index.last().map_or(0, |&(pts, _)| pts),
            };
            return Ok(());
        }

        self.extend_index(&mut ctx.io, timestamp)?;
        let i = self.index.partition_point(|&(pts, _)| pts <= timestamp);
        let entry = if flags.contains(SeekFlags::FORWARD) {
            self.index
                .get(i)
                .or(self.index.last())
                .copied()
        } else {
            self.index.get(i.saturating_sub(1)).copied()
        };
        let entry = entry.unwrap_or((0, self.data_start));
        log::debug!("aac: seek to {timestamp} lands on frame at {} (pts {})", entry.1, entry.0);
        self.seek_to_entry(&mut ctx.io, entry)
    }

    fn estimated_packet_count(&self, _ctx: &InputContext) -> Option<u64> {
        self.index_complete.then_some(self.index.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::aac::tests::ADTS_HEADER;

    fn adts(frames: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..frames {
            out.extend_from_slice(&ADTS_HEADER);
            out.resize(out.len() + 364, i as u8);
        }
        out
    }

    fn id3_tag(body: usize) -> Vec<u8> {
        let mut tag = b"ID3\x04\x00\x00".to_vec();
        tag.extend_from_slice(&[0, 0, (body >> 7) as u8 & 0x7F, body as u8 & 0x7F]);
        tag.resize(ID3V2_HEADER_SIZE + body, 0);
        tag
    }

    fn open(data: Vec<u8>) -> anyhow::Result<(IAacFormat, InputContext)> {
        let mut ctx = InputContext::new(IoReader::from_bytes(data));
        let mut format = IAacFormat::default();
        format.read_header(&mut ctx)?;
        Ok((format, ctx))
    }

    #[test]
    fn probe_scores() {
        assert_eq!(IAacFormat::probe(&adts(4)), PROBE_SCORE_MAX);
        assert_eq!(IAacFormat::probe(&adts(1)), PROBE_SCORE_PARTIAL);
        assert_eq!(IAacFormat::probe(&[id3_tag(300), adts(3)].concat()), PROBE_SCORE_MAX);
        // MPEG audio layer 3 frame header.
        assert_eq!(IAacFormat::probe(&[0xFF, 0xFB, 0x90, 0x64, 0, 0, 0, 0]), 0);
        assert_eq!(IAacFormat::probe(b"RIFF\0\0\0\0WAVE"), 0);
    }

    #[test]
    fn header_and_packets() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open([id3_tag(200), adts(5)].concat())?;
        let par = &ctx.streams[0].codecpar;
        assert_eq!(par.codec_id, CodecId::Aac);
        assert_eq!((par.sample_rate, par.channels), (44100, 2));
        assert_eq!(par.extradata, vec![0x12, 0x10]);
        assert_eq!(ctx.streams[0].time_base, Rational::new(1, 44100));
        assert_eq!(ctx.streams[0].duration, 5 * 1024);
        assert_eq!(format.estimated_packet_count(&ctx), Some(5));

        let first = format.read_packet(&mut ctx)?;
        assert_eq!(first.size(), 364);
        assert_eq!(first.pos, 210);
        assert!(first.is_key() && first.new_extradata().is_none());
        let second = format.read_packet(&mut ctx)?;
        assert_eq!((second.pts, second.duration), (1024, 1024));
        assert_eq!(second.data()[0], 1);
        Ok(())
    }

    #[test]
    fn resync_skips_garbage() -> anyhow::Result<()> {
        let mut data = adts(3);
        data.splice(371..371, [0xAB; 13]);
        let (mut format, mut ctx) = open(data)?;
        let mut sizes = Vec::new();
        loop {
            match format.read_packet(&mut ctx) {
                Ok(packet) => sizes.push((packet.data()[0], packet.pts)),
                Err(FormatError::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }
        assert_eq!(sizes, vec![(0, 0), (1, 1024), (2, 2048)]);
        Ok(())
    }

    #[test]
    fn strict_mode_fails_on_lost_sync() -> anyhow::Result<()> {
        let mut data = adts(3);
        data.splice(371..371, [0xAB; 13]);
        let (mut format, mut ctx) = open(data)?;
        ctx.fail_level = Level::Warn;
        format.read_packet(&mut ctx)?;
        assert!(format.read_packet(&mut ctx).is_err());
        Ok(())
    }

    #[test]
    fn seek_by_timestamp_and_byte() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(adts(10))?;
        format.seek(&mut ctx, 0, 5000, SeekFlags::BACKWARD)?;
        let packet = format.read_packet(&mut ctx)?;
        assert_eq!(packet.pts, 4096);
        assert_eq!(packet.data()[0], 4);

        format.seek(&mut ctx, 0, 5000, SeekFlags::FORWARD)?;
        assert_eq!(format.read_packet(&mut ctx)?.pts, 5120);

        format.seek(&mut ctx, 0, 371 * 7 + 100, SeekFlags::BYTE)?;
        let packet = format.read_packet(&mut ctx)?;
        assert_eq!((packet.pts, packet.data()[0]), (8 * 1024, 8));
        Ok(())
    }
}
