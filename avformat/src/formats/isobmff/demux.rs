//! MP4/MOV demuxer.

use super::context::{Fragment, MovContext, TrackContext};
use super::encryption::load_aux_info;
use super::index::{build_fragment_index, build_index};
use super::reader::{BoxHeader, parse_box, parse_children, read_box_header};
use crate::formats::{IFormat, InputContext, PROBE_SCORE_MAX, PROBE_SCORE_PARTIAL, SeekFlags};
use crate::io::IoReader;
use crate::log_or_err;
use crate::structs::encryption::{EncryptionInfo, SCHEME_CENC};
use crate::structs::packet::{BitFormat, Packet, SideData};
use crate::structs::rational::{MICRO_TIME_BASE, MILLI_TIME_BASE, Rational, rescale};
use crate::utils::errors::FormatError;

/// Tracks whose next samples are further apart than this (in microseconds)
/// are interleaved by time instead of by file position.
const MAX_INTERLEAVE_DRIFT_US: i64 = 1_000_000;

const TOP_LEVEL_BOXES: [&[u8; 4]; 10] = [
    b"ftyp", b"moov", b"mdat", b"free", b"skip", b"wide", b"pnot", b"styp", b"sidx", b"moof",
];

#[derive(Debug, Default)]
pub struct IMovFormat {
    mov: MovContext,
    /// Where the search for the next `moof` resumes.
    next_box: u64,
}

impl IMovFormat {
    pub fn context(&self) -> &MovContext {
        &self.mov
    }

    fn is_fragmented(&self) -> bool {
        self.mov.first_moof.is_some()
    }

    /// Picks the track whose current sample comes next, by file position
    /// while tracks stay within [`MAX_INTERLEAVE_DRIFT_US`] of each other.
    fn next_track(&self) -> Option<usize> {
        let mut best: Option<(usize, u64, i64)> = None;
        for (index, track) in self.mov.tracks.iter().enumerate() {
            let Some(sample) = track.current() else {
                continue;
            };
            let dts = rescale(sample.dts, track.stream.time_base, MICRO_TIME_BASE);
            let better = match best {
                None => true,
                Some((_, best_pos, best_dts)) => {
                    if (best_dts - dts).abs() <= MAX_INTERLEAVE_DRIFT_US {
                        sample.pos < best_pos
                    } else {
                        dts < best_dts
                    }
                }
            };
            if better {
                best = Some((index, sample.pos, dts));
            }
        }
        best.map(|(index, _, _)| index)
    }

    /// Parses the next `moof` and appends its samples. Returns `false` when
    /// the input holds no further fragment.
    fn read_fragment(&mut self, ctx: &mut InputContext) -> Result<bool, FormatError> {
        let io = &mut ctx.io;
        let end = io.size();
        let mov = &mut self.mov;

        for track in mov.tracks.iter_mut().filter(|t| t.is_finished()) {
            track.samples.clear();
            track.sample_encryption.clear();
            track.current_sample = 0;
        }

        while self.next_box + 8 <= end {
            io.seek(self.next_box)?;
            let header = read_box_header(io, end)?;
            self.next_box = header.end();
            if header.kind != b"moof" {
                log::trace!("skipping top-level '{}' at {}", header.kind, header.start);
                continue;
            }

            mov.current_fragment = Some(Fragment {
                pos: header.start,
                size: header.size,
                ..Fragment::default()
            });
            let result = parse_children(io, mov, None, header.end());
            let fragment = mov.current_fragment.take();
            result?;

            let Some(mut fragment) = fragment else {
                continue;
            };
            log::debug!(
                "moof #{} at {} with {} track fragments",
                fragment.sequence,
                fragment.pos,
                fragment.tracks.len()
            );
            for traf in fragment.tracks.iter_mut() {
                if let Some(index) = mov.track_by_id(traf.track_id) {
                    build_fragment_index(io, &mut mov.tracks[index], traf, fragment.pos, mov.timescale)?;
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Reads the `mfra` random access index located through the trailing
    /// `mfro` box.
    fn read_mfra(&mut self, io: &mut IoReader) -> Result<(), FormatError> {
        let size = io.size();
        if size < 16 {
            return Ok(());
        }
        let pos = io.pos();
        io.seek(size - 16)?;
        let _mfro_size = io.read_u32_be()?;
        if io.read_fourcc()? != b"mfro" {
            io.seek(pos)?;
            return Ok(());
        }
        io.skip(4)?;
        let mfra_size = io.read_u32_be()? as u64;
        if mfra_size < 8 || mfra_size > size {
            io.seek(pos)?;
            return Err(FormatError::invalid(format!("mfro: mfra size {mfra_size}")));
        }

        io.seek(size - mfra_size)?;
        let header = read_box_header(io, size)?;
        let result = if header.kind == b"mfra" {
            parse_box(io, &mut self.mov, None, &header)
        } else {
            Err(FormatError::invalid(format!("mfro points at '{}'", header.kind)))
        };
        io.seek(pos)?;
        result
    }

    fn finish_tracks(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        let mov = &mut self.mov;
        for track in mov.tracks.iter_mut() {
            let iv_size = track.tenc.as_ref().map_or(0, |t| t.per_sample_iv_size);
            load_aux_info(&mut ctx.io, &mut track.cenc, iv_size, 0)?;
            if let Err(e) = build_index(track, mov.timescale) {
                track.samples.clear();
                log_or_err!(
                    ctx,
                    log::Level::Warn,
                    FormatError::invalid(format!("track {}: {e}", track.track_id))
                );
            }
        }

        for track in &mov.tracks {
            let mut stream = track.stream.clone();
            stream.encryption_init.extend(mov.pssh.iter().cloned());
            if let Some(handler) = track.handler {
                stream.metadata.insert("handler".to_string(), handler.to_string());
            }
            ctx.add_stream(stream);
        }
        ctx.metadata.extend(mov.metadata.clone());
        if let Some(item) = mov.primary_item {
            ctx.metadata.insert("primary_item".to_string(), item.to_string());
        }

        let movie_duration = if mov.duration > 0 {
            mov.duration
        } else {
            mov.fragment_duration
        };
        ctx.duration = if movie_duration > 0 {
            rescale(
                movie_duration as i64,
                Rational::new(1, mov.timescale as i32),
                MILLI_TIME_BASE,
            )
        } else {
            ctx.streams
                .iter()
                .filter(|s| s.duration > 0)
                .map(|s| rescale(s.duration, s.time_base, MILLI_TIME_BASE))
                .max()
                .unwrap_or(ctx.duration)
        };
        Ok(())
    }

    fn packet_for(&mut self, ctx: &mut InputContext, index: usize) -> Result<Packet, FormatError> {
        let mov = &mut self.mov;
        let track = &mut mov.tracks[index];
        let sample_index = track.current_sample;
        let sample = track.samples[sample_index];
        track.current_sample += 1;

        ctx.io.seek(sample.pos)?;
        let mut packet = ctx.read_packet_data(sample.size as usize)?;
        packet.stream_index = index;
        packet.dts = sample.dts;
        packet.pts = sample.pts;
        packet.duration = sample.duration as i64;
        packet.pos = sample.pos as i64;
        packet.flags = sample.flags;
        if track.stream.codecpar.codec_id.is_nalu_based() {
            packet.bit_format = Some(BitFormat::Avcc);
        }

        if let Some(tenc) = track.tenc.as_ref().filter(|t| t.is_protected) {
            let scheme = track.scheme.unwrap_or(SCHEME_CENC);
            let sample_info = track.sample_encryption.get(sample_index).and_then(Option::as_ref);
            packet.add_side_data(SideData::EncryptionInfo(EncryptionInfo::from_track(
                scheme,
                tenc,
                sample_info,
            )));
        }
        if sample.is_key() {
            if let Some(extradata) = track.pending_extradata.take() {
                packet.add_side_data(SideData::NewExtradata(extradata));
            }
        }
        if !mov.pending_pssh.is_empty() {
            packet.add_side_data(SideData::EncryptionInitInfo(std::mem::take(&mut mov.pending_pssh)));
        }
        Ok(packet)
    }

    /// Loads fragments until `stream_index` has a sample at or after
    /// `timestamp`, starting from the closest `tfra` entry.
    fn seek_fragment(
        &mut self,
        ctx: &mut InputContext,
        stream_index: usize,
        timestamp: i64,
    ) -> Result<(), FormatError> {
        let track = &self.mov.tracks[stream_index];
        let loaded = track.samples.first().is_some_and(|s| s.pts <= timestamp)
            && track.samples.last().is_some_and(|s| s.pts >= timestamp);
        if loaded {
            return Ok(());
        }

        let entry = track
            .frag_index
            .iter()
            .rev()
            .find(|e| e.time <= timestamp)
            .copied();
        let first_moof = self.mov.first_moof.unwrap_or(0);
        let pos = entry.map_or(first_moof, |e| e.pos);
        log::debug!("fragment seek to {timestamp}: moof at {pos}");

        for track in self.mov.tracks.iter_mut() {
            track.samples.clear();
            track.sample_encryption.clear();
            track.current_sample = 0;
            if entry.is_none() {
                track.next_fragment_dts = 0;
            }
        }
        if let Some(entry) = entry {
            self.mov.tracks[stream_index].next_fragment_dts = entry.time;
        }
        self.next_box = pos;

        while self.read_fragment(ctx)? {
            let track = &self.mov.tracks[stream_index];
            if track.samples.last().is_some_and(|s| s.pts >= timestamp) {
                break;
            }
        }
        Ok(())
    }
}

/// Index of the sample to resume `track` at for `timestamp`.
fn find_sample(track: &TrackContext, timestamp: i64, flags: SeekFlags) -> Option<usize> {
    let samples = &track.samples;
    if samples.is_empty() {
        return None;
    }
    if flags.contains(SeekFlags::FORWARD) {
        let start = samples.partition_point(|s| s.pts < timestamp);
        if flags.contains(SeekFlags::ANY) {
            return Some(start.min(samples.len() - 1));
        }
        return samples[start..]
            .iter()
            .position(|s| s.is_key())
            .map(|i| start + i);
    }

    let candidate = samples.partition_point(|s| s.pts <= timestamp).saturating_sub(1);
    if flags.contains(SeekFlags::ANY) {
        return Some(candidate);
    }
    samples[..=candidate]
        .iter()
        .rposition(|s| s.is_key())
        .or_else(|| samples.iter().position(|s| s.is_key()))
}

impl IFormat for IMovFormat {
    fn name(&self) -> &'static str {
        "mov"
    }

    fn probe(buf: &[u8]) -> u8 {
        let mut score = 0;
        let mut offset = 0usize;
        while offset + 8 <= buf.len() {
            let size = u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]);
            let kind = &buf[offset + 4..offset + 8];
            if !TOP_LEVEL_BOXES.iter().any(|&k| k == kind) {
                break;
            }
            if kind == b"ftyp" || kind == b"moov" {
                return PROBE_SCORE_MAX;
            }
            score = PROBE_SCORE_PARTIAL;
            let size = match size {
                0 => break,
                1 if offset + 16 <= buf.len() => {
                    let mut wide = [0u8; 8];
                    wide.copy_from_slice(&buf[offset + 8..offset + 16]);
                    u64::from_be_bytes(wide)
                }
                size => size as u64,
            };
            if size < 8 {
                break;
            }
            offset = match offset.checked_add(size as usize) {
                Some(next) => next,
                None => break,
            };
        }
        score
    }

    fn read_header(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        self.mov = MovContext {
            fail_level: ctx.fail_level,
            ..MovContext::default()
        };
        let mov = &mut self.mov;
        let io = &mut ctx.io;
        let end = io.size();

        while io.pos() + 8 <= end {
            let header: BoxHeader = read_box_header(io, end)?;
            match &header.kind.0 {
                b"moof" => {
                    mov.first_moof = Some(header.start);
                    self.next_box = header.start;
                    break;
                }
                b"mdat" => {
                    mov.found_mdat = true;
                    mov.first_mdat_pos.get_or_insert(header.body_start());
                    if mov.found_moov && !mov.is_fragment {
                        break;
                    }
                    io.seek(header.end().min(end))?;
                }
                b"moov" if mov.found_moov => {
                    log_or_err!(ctx, log::Level::Warn, FormatError::invalid("duplicate moov box"));
                    io.seek(header.end().min(end))?;
                }
                _ => {
                    parse_box(io, mov, None, &header)?;
                    if header.kind == b"moov" {
                        mov.found_moov = true;
                        if mov.found_mdat && !mov.is_fragment {
                            break;
                        }
                    }
                }
            }
        }

        if !mov.found_moov {
            return Err(FormatError::invalid("no moov box"));
        }
        if mov.tracks.is_empty() {
            if mov.items.is_empty() {
                return Err(FormatError::invalid("moov holds no tracks"));
            }
            log::warn!("file holds {} items and no tracks", mov.items.len());
        }
        if mov.is_fragment {
            if let Err(e) = self.read_mfra(&mut ctx.io) {
                log_or_err!(ctx, log::Level::Warn, e);
            }
        }

        self.finish_tracks(ctx)?;
        log::info!(
            "mov: {} tracks{}, major brand {}",
            self.mov.tracks.len(),
            if self.mov.is_fragment { " (fragmented)" } else { "" },
            self.mov.major_brand.map(|b| b.to_string()).unwrap_or_default()
        );
        Ok(())
    }

    fn read_packet(&mut self, ctx: &mut InputContext) -> Result<Packet, FormatError> {
        let index = loop {
            if let Some(index) = self.next_track() {
                break index;
            }
            if !self.is_fragmented() || !self.read_fragment(ctx)? {
                return Err(FormatError::Eof);
            }
        };
        self.packet_for(ctx, index)
    }

    fn seek(
        &mut self,
        ctx: &mut InputContext,
        stream_index: usize,
        timestamp: i64,
        flags: SeekFlags,
    ) -> Result<(), FormatError> {
        if stream_index >= self.mov.tracks.len() {
            return Err(FormatError::params(format!("no stream {stream_index}")));
        }
        if flags.contains(SeekFlags::BYTE) {
            return Err(FormatError::unsupported("byte seek in mov"));
        }
        if self.is_fragmented() {
            self.seek_fragment(ctx, stream_index, timestamp)?;
        }

        let target = &mut self.mov.tracks[stream_index];
        let index = find_sample(target, timestamp, flags)
            .ok_or_else(|| FormatError::invalid(format!("stream {stream_index}: no sample near {timestamp}")))?;
        target.current_sample = index;
        let sample = target.samples[index];
        let time_base = target.stream.time_base;
        log::debug!("mov seek stream {stream_index} to sample {index} (pts {})", sample.pts);

        for (i, track) in self.mov.tracks.iter_mut().enumerate() {
            if i == stream_index {
                continue;
            }
            let dts = rescale(sample.dts, time_base, track.stream.time_base);
            track.current_sample = track.samples.partition_point(|s| s.dts < dts);
        }
        Ok(())
    }

    fn estimated_packet_count(&self, _ctx: &InputContext) -> Option<u64> {
        if self.is_fragmented() {
            return None;
        }
        Some(self.mov.tracks.iter().map(|t| t.samples.len() as u64).sum())
    }
}
