//! Sample index construction from `stbl` tables and track fragments.

use std::iter::repeat_n;

use super::context::{FragmentTrack, Sample, TrackContext};
use super::encryption::load_aux_info;
use super::fragment::is_sync_sample;
use crate::io::IoReader;
use crate::structs::packet::PacketFlags;
use crate::structs::rational::{Rational, rescale};
use crate::structs::stream::MediaType;
use crate::utils::errors::FormatError;

/// PCM samples per merged index entry.
const PCM_RUN_SAMPLES: usize = 1024;

/// Offset added to every timestamp of `track` by its edit list: leading
/// empty edits delay the track, the first media edit skips `media_time`.
pub fn edit_shift(track: &TrackContext, movie_timescale: u32) -> i64 {
    let mut empty = 0u64;
    for edit in &track.elst {
        if edit.media_time == -1 {
            empty += edit.segment_duration;
            continue;
        }
        if edit.media_rate != 0x1_0000 {
            log::debug!("track {}: edit rate {:#x} ignored", track.track_id, edit.media_rate);
        }
        let delay = if empty > 0 && movie_timescale > 0 && track.timescale > 0 {
            rescale(
                empty as i64,
                Rational::new(1, movie_timescale as i32),
                Rational::new(1, track.timescale as i32),
            )
        } else {
            0
        };
        return delay - edit.media_time;
    }
    0
}

/// Expands the `stco`/`stsc`/`stsz`/`stts`/`ctts`/`stss` tables of `track`
/// into `track.samples`.
pub fn build_index(track: &mut TrackContext, movie_timescale: u32) -> Result<(), FormatError> {
    let count = track.sample_sizes.len();
    track.samples.clear();
    track.current_sample = 0;
    if count == 0 {
        return Ok(());
    }
    if track.stsc.is_empty() || track.chunk_offsets.is_empty() {
        return Err(FormatError::invalid(format!(
            "track {}: {count} samples without chunk tables",
            track.track_id
        )));
    }

    let mut samples: Vec<Sample> = Vec::new();
    samples
        .try_reserve_exact(count)
        .map_err(|_| FormatError::NoMemory)?;
    let mut chunk_starts = Vec::with_capacity(track.chunk_offsets.len());

    let mut stsc_index = 0;
    'chunks: for (chunk, &offset) in track.chunk_offsets.iter().enumerate() {
        let chunk_number = chunk as u32 + 1;
        while stsc_index + 1 < track.stsc.len() && track.stsc[stsc_index + 1].first_chunk <= chunk_number {
            stsc_index += 1;
        }
        chunk_starts.push(samples.len());
        let mut pos = offset;
        for _ in 0..track.stsc[stsc_index].samples_per_chunk {
            let Some(&size) = track.sample_sizes.get(samples.len()) else {
                break 'chunks;
            };
            samples.push(Sample {
                pos,
                size,
                ..Sample::default()
            });
            pos += size as u64;
        }
    }
    if samples.len() < count {
        log::warn!(
            "track {}: chunk tables cover {} of {count} samples",
            track.track_id,
            samples.len()
        );
    }

    let mut durations = track.stts.iter().flat_map(|&(n, delta)| repeat_n(delta, n as usize));
    let mut offsets = track.ctts.iter().flat_map(|&(n, offset)| repeat_n(offset, n as usize));
    let mut dts = 0i64;
    for sample in samples.iter_mut() {
        sample.duration = durations.next().unwrap_or(0);
        sample.dts = dts;
        sample.pts = dts + offsets.next().unwrap_or(0);
        dts += sample.duration as i64;
    }
    if let [.., prev, last] = samples.as_mut_slice() {
        if last.duration == 0 {
            last.duration = prev.duration;
        }
    }

    let is_audio = track.stream.codecpar.media_type == MediaType::Audio;
    match &track.stss {
        Some(stss) if !is_audio => {
            for number in stss {
                let sample = number
                    .checked_sub(1)
                    .and_then(|i| samples.get_mut(i as usize));
                if let Some(sample) = sample {
                    sample.flags |= PacketFlags::KEY;
                }
            }
        }
        _ => samples.iter_mut().for_each(|s| s.flags |= PacketFlags::KEY),
    }

    let shift = edit_shift(track, movie_timescale);
    if shift != 0 {
        for sample in samples.iter_mut() {
            sample.dts += shift;
            sample.pts += shift;
        }
    }

    if track.is_encrypted() {
        let mut info = std::mem::take(&mut track.cenc.samples).into_iter();
        track.sample_encryption = samples.iter().map(|_| info.next()).collect();
    } else if track.stream.codecpar.codec_id.is_pcm() {
        samples = merge_pcm_runs(&samples, &chunk_starts);
    }

    let stream = &mut track.stream;
    stream.nb_frames = samples.len() as u64;
    stream.start_time = samples.iter().map(|s| s.pts).min().unwrap_or(0);
    if stream.duration <= 0 {
        stream.duration = samples.last().map_or(0, |s| s.dts + s.duration as i64 - shift);
    }
    track.samples = samples;
    Ok(())
}

/// Joins per-frame PCM samples into runs that stay inside one chunk.
fn merge_pcm_runs(samples: &[Sample], chunk_starts: &[usize]) -> Vec<Sample> {
    let mut merged = Vec::new();
    for (i, &start) in chunk_starts.iter().enumerate() {
        let end = chunk_starts.get(i + 1).copied().unwrap_or(samples.len());
        let Some(chunk) = samples.get(start..end.min(samples.len())) else {
            continue;
        };
        for run in chunk.chunks(PCM_RUN_SAMPLES) {
            merged.push(Sample {
                size: run.iter().map(|s| s.size).sum(),
                duration: run.iter().map(|s| s.duration).sum(),
                ..run[0]
            });
        }
    }
    merged
}

/// Appends the samples of one `traf` to `track.samples`.
///
/// `moof_pos` is the start of the enclosing `moof`, the data base whenever
/// `tfhd` sets `default-base-is-moof` or gives no explicit base.
pub fn build_fragment_index(
    io: &mut IoReader,
    track: &mut TrackContext,
    traf: &mut FragmentTrack,
    moof_pos: u64,
    movie_timescale: u32,
) -> Result<(), FormatError> {
    let base = match traf.base_data_offset {
        Some(offset) if !traf.base_is_moof => offset,
        _ => moof_pos,
    };
    let iv_size = track.tenc.as_ref().map_or(0, |t| t.per_sample_iv_size);
    load_aux_info(io, &mut traf.cenc, iv_size, base)?;

    let shift = edit_shift(track, movie_timescale);
    let is_audio = track.stream.codecpar.media_type == MediaType::Audio;
    let first = track.samples.len();
    let mut dts = match traf.base_media_decode_time {
        Some(time) => time as i64,
        None => track.next_fragment_dts,
    };
    let mut pos = base;
    for run in &traf.runs {
        if let Some(offset) = run.data_offset {
            pos = base.checked_add_signed(offset as i64).ok_or_else(|| {
                FormatError::invalid(format!("trun data offset {offset} before file start"))
            })?;
        }
        for entry in &run.samples {
            let flags = if is_audio || is_sync_sample(entry.flags) {
                PacketFlags::KEY
            } else {
                PacketFlags::empty()
            };
            track.samples.push(Sample {
                dts: dts + shift,
                pts: dts + entry.cts_offset + shift,
                pos,
                size: entry.size,
                duration: entry.duration,
                flags,
            });
            pos += entry.size as u64;
            dts += entry.duration as i64;
        }
    }
    track.next_fragment_dts = dts;
    track.stream.nb_frames += (track.samples.len() - first) as u64;

    if track.is_encrypted() {
        track.sample_encryption.resize(first, None);
        let mut info = std::mem::take(&mut traf.cenc.samples).into_iter();
        for _ in first..track.samples.len() {
            track.sample_encryption.push(info.next());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::isobmff::context::{ElstEntry, StscEntry, TrackRun, TrunSample};
    use crate::structs::encryption::{SampleEncryption, TrackEncryption};
    use crate::structs::stream::CodecId;

    fn video_track() -> TrackContext {
        let mut track = TrackContext::new(0);
        track.track_id = 1;
        track.timescale = 90000;
        track.stream.codecpar.media_type = MediaType::Video;
        track.chunk_offsets = vec![100, 1000];
        track.stsc = vec![
            StscEntry {
                first_chunk: 1,
                samples_per_chunk: 3,
                sample_description_index: 1,
            },
            StscEntry {
                first_chunk: 2,
                samples_per_chunk: 2,
                sample_description_index: 1,
            },
        ];
        track.sample_sizes = vec![10, 20, 30, 40, 50];
        track.stts = vec![(4, 3000), (1, 0)];
        track.ctts = vec![(1, 3000), (1, 9000), (3, 0)];
        track.stss = Some(vec![1, 4]);
        track
    }

    #[test]
    fn expands_sample_tables() -> anyhow::Result<()> {
        let mut track = video_track();
        build_index(&mut track, 1000)?;

        let positions: Vec<u64> = track.samples.iter().map(|s| s.pos).collect();
        assert_eq!(positions, [100, 110, 130, 1000, 1040]);
        let dts: Vec<i64> = track.samples.iter().map(|s| s.dts).collect();
        assert_eq!(dts, [0, 3000, 6000, 9000, 12000]);
        assert_eq!(track.samples[1].pts, 12000);
        assert_eq!(track.samples[4].duration, 3000);
        let keys: Vec<bool> = track.samples.iter().map(|s| s.flags.contains(PacketFlags::KEY)).collect();
        assert_eq!(keys, [true, false, false, true, false]);
        assert_eq!(track.stream.nb_frames, 5);
        assert_eq!(track.stream.start_time, 3000);
        Ok(())
    }

    #[test]
    fn edit_list_offsets_timestamps() -> anyhow::Result<()> {
        let mut track = video_track();
        track.elst = vec![
            ElstEntry {
                segment_duration: 100,
                media_time: -1,
                media_rate: 0x1_0000,
            },
            ElstEntry {
                segment_duration: 1000,
                media_time: 3000,
                media_rate: 0x1_0000,
            },
        ];
        assert_eq!(edit_shift(&track, 1000), 9000 - 3000);
        build_index(&mut track, 1000)?;
        assert_eq!(track.samples[0].dts, 6000);
        assert_eq!(track.samples[0].pts, 9000);
        Ok(())
    }

    #[test]
    fn missing_chunk_tables() {
        let mut track = video_track();
        track.chunk_offsets.clear();
        assert!(build_index(&mut track, 1000).is_err());
    }

    #[test]
    fn pcm_runs_stay_in_chunks() -> anyhow::Result<()> {
        let mut track = TrackContext::new(0);
        track.timescale = 8000;
        track.stream.codecpar.media_type = MediaType::Audio;
        track.stream.codecpar.codec_id = CodecId::PcmS16Be;
        track.chunk_offsets = vec![0, 10_000];
        track.stsc = vec![StscEntry {
            first_chunk: 1,
            samples_per_chunk: 1500,
            sample_description_index: 1,
        }];
        track.sample_sizes = vec![2; 2000];
        track.stts = vec![(2000, 1)];
        build_index(&mut track, 1000)?;

        let runs: Vec<(u64, u32, i64)> = track.samples.iter().map(|s| (s.pos, s.size, s.dts)).collect();
        assert_eq!(runs, [(0, 2048, 0), (2048, 952, 1024), (10_000, 1000, 1500)]);
        assert_eq!(track.stream.duration, 2000);
        Ok(())
    }

    #[test]
    fn fragment_samples() -> anyhow::Result<()> {
        let mut track = video_track();
        track.tenc = Some(TrackEncryption {
            is_protected: true,
            per_sample_iv_size: 8,
            ..Default::default()
        });
        let mut traf = FragmentTrack {
            track_id: 1,
            base_is_moof: true,
            base_media_decode_time: Some(90000),
            runs: vec![
                TrackRun {
                    data_offset: Some(200),
                    samples: vec![
                        TrunSample {
                            duration: 3000,
                            size: 100,
                            flags: 0x0200_0000,
                            cts_offset: 3000,
                        },
                        TrunSample {
                            duration: 3000,
                            size: 50,
                            flags: 0x0101_0000,
                            cts_offset: 0,
                        },
                    ],
                },
                TrackRun {
                    data_offset: None,
                    samples: vec![TrunSample {
                        duration: 3000,
                        size: 10,
                        flags: 0x0101_0000,
                        cts_offset: 0,
                    }],
                },
            ],
            ..Default::default()
        };
        traf.cenc.samples = vec![SampleEncryption {
            iv: vec![1; 8],
            subsamples: Vec::new(),
        }];

        let mut io = IoReader::from_bytes(Vec::new());
        build_fragment_index(&mut io, &mut track, &mut traf, 5000, 1000)?;
        let samples: Vec<(i64, i64, u64, bool)> = track
            .samples
            .iter()
            .map(|s| (s.dts, s.pts, s.pos, s.is_key()))
            .collect();
        assert_eq!(
            samples,
            [
                (90000, 93000, 5200, true),
                (93000, 93000, 5300, false),
                (96000, 96000, 5350, false),
            ]
        );
        assert_eq!(track.next_fragment_dts, 99000);
        assert_eq!(track.sample_encryption.len(), 3);
        assert!(track.sample_encryption[0].is_some());
        assert!(track.sample_encryption[2].is_none());
        Ok(())
    }
}
