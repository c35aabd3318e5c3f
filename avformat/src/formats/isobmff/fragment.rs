//! Movie fragment boxes (`mvex`, `moof`, `mfra` children).

use super::boxes::{table, unsupported_version};
use super::context::{FragIndexEntry, FragmentTrack, MovContext, TrackRun, Trex, TrunSample};
use super::reader::{BoxHeader, parse_children, read_full_box_header};
use crate::io::IoReader;
use crate::utils::errors::{BoxError, FormatError};

pub const TFHD_BASE_DATA_OFFSET: u32 = 0x01;
pub const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x02;
pub const TFHD_DEFAULT_DURATION: u32 = 0x08;
pub const TFHD_DEFAULT_SIZE: u32 = 0x10;
pub const TFHD_DEFAULT_FLAGS: u32 = 0x20;
pub const TFHD_DURATION_IS_EMPTY: u32 = 0x1_0000;
pub const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x2_0000;

pub const TRUN_DATA_OFFSET: u32 = 0x01;
pub const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x04;
pub const TRUN_SAMPLE_DURATION: u32 = 0x100;
pub const TRUN_SAMPLE_SIZE: u32 = 0x200;
pub const TRUN_SAMPLE_FLAGS: u32 = 0x400;
pub const TRUN_SAMPLE_CTS: u32 = 0x800;

/// `sample_is_non_sync_sample`.
pub const SAMPLE_FLAG_NON_SYNC: u32 = 0x1_0000;
/// `sample_depends_on` = 1.
pub const SAMPLE_FLAG_DEPENDS: u32 = 0x100_0000;

/// Whether fragment sample `flags` mark a sync sample.
pub fn is_sync_sample(flags: u32) -> bool {
    flags & (SAMPLE_FLAG_NON_SYNC | SAMPLE_FLAG_DEPENDS) == 0
}

fn current_traf<'a>(
    ctx: &'a mut MovContext,
    header: &BoxHeader,
) -> Result<&'a mut FragmentTrack, FormatError> {
    ctx.current_traf
        .as_mut()
        .ok_or_else(|| FormatError::invalid(format!("'{}' outside of 'traf'", header.kind)))
}

pub fn mehd(
    io: &mut IoReader,
    ctx: &mut MovContext,
    _track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, _) = read_full_box_header(io)?;
    ctx.fragment_duration = match version {
        0 => io.read_u32_be()? as u64,
        1 => io.read_u64_be()?,
        v => return Err(unsupported_version(header, v)),
    };
    Ok(())
}

pub fn trex(
    io: &mut IoReader,
    ctx: &mut MovContext,
    _track: Option<usize>,
    _header: &BoxHeader,
) -> Result<(), FormatError> {
    read_full_box_header(io)?;
    let trex = Trex {
        track_id: io.read_u32_be()?,
        sample_description_index: io.read_u32_be()?,
        sample_duration: io.read_u32_be()?,
        sample_size: io.read_u32_be()?,
        sample_flags: io.read_u32_be()?,
    };
    ctx.trex.retain(|t| t.track_id != trex.track_id);
    ctx.trex.push(trex);
    Ok(())
}

pub fn mfhd(
    io: &mut IoReader,
    ctx: &mut MovContext,
    _track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    read_full_box_header(io)?;
    let sequence = io.read_u32_be()?;
    let fragment = ctx
        .current_fragment
        .as_mut()
        .ok_or_else(|| FormatError::invalid(format!("'{}' outside of 'moof'", header.kind)))?;
    fragment.sequence = sequence;
    Ok(())
}

pub fn traf(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    if ctx.current_fragment.is_none() {
        return Err(FormatError::invalid("'traf' outside of 'moof'"));
    }
    ctx.current_traf = Some(FragmentTrack::default());
    let result = parse_children(io, ctx, track, header.end());
    let traf = ctx.current_traf.take();
    result?;

    let traf = traf.ok_or_else(|| FormatError::invalid("'traf' state lost"))?;
    if ctx.track_by_id(traf.track_id).is_none() {
        return Err(BoxError::UnknownTrack {
            kind: header.kind.to_string(),
            track_id: traf.track_id,
        }
        .into());
    }
    if let Some(fragment) = ctx.current_fragment.as_mut() {
        fragment.tracks.push(traf);
    }
    Ok(())
}

pub fn tfhd(
    io: &mut IoReader,
    ctx: &mut MovContext,
    _track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (_, flags) = read_full_box_header(io)?;
    let track_id = io.read_u32_be()?;
    if ctx.track_by_id(track_id).is_none() {
        return Err(BoxError::UnknownTrack {
            kind: header.kind.to_string(),
            track_id,
        }
        .into());
    }
    let trex = ctx.trex(track_id);
    let traf = current_traf(ctx, header)?;
    traf.track_id = track_id;
    traf.sample_description_index = trex.sample_description_index;
    traf.default_sample_duration = trex.sample_duration;
    traf.default_sample_size = trex.sample_size;
    traf.default_sample_flags = trex.sample_flags;

    if flags & TFHD_BASE_DATA_OFFSET != 0 {
        traf.base_data_offset = Some(io.read_u64_be()?);
    }
    if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
        traf.sample_description_index = io.read_u32_be()?;
    }
    if flags & TFHD_DEFAULT_DURATION != 0 {
        traf.default_sample_duration = io.read_u32_be()?;
    }
    if flags & TFHD_DEFAULT_SIZE != 0 {
        traf.default_sample_size = io.read_u32_be()?;
    }
    if flags & TFHD_DEFAULT_FLAGS != 0 {
        traf.default_sample_flags = io.read_u32_be()?;
    }
    traf.base_is_moof = flags & TFHD_DEFAULT_BASE_IS_MOOF != 0;
    Ok(())
}

pub fn tfdt(
    io: &mut IoReader,
    ctx: &mut MovContext,
    _track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, _) = read_full_box_header(io)?;
    let time = match version {
        0 => io.read_u32_be()? as u64,
        1 => io.read_u64_be()?,
        v => return Err(unsupported_version(header, v)),
    };
    current_traf(ctx, header)?.base_media_decode_time = Some(time);
    Ok(())
}

pub fn trun(
    io: &mut IoReader,
    ctx: &mut MovContext,
    _track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, flags) = read_full_box_header(io)?;
    let count = io.read_u32_be()?;
    let data_offset = if flags & TRUN_DATA_OFFSET != 0 {
        Some(io.read_i32_be()?)
    } else {
        None
    };
    let first_sample_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        Some(io.read_u32_be()?)
    } else {
        None
    };

    let traf = current_traf(ctx, header)?;
    let mut samples = table(count)?;
    for i in 0..count {
        let mut sample = TrunSample {
            duration: traf.default_sample_duration,
            size: traf.default_sample_size,
            flags: traf.default_sample_flags,
            cts_offset: 0,
        };
        if flags & TRUN_SAMPLE_DURATION != 0 {
            sample.duration = io.read_u32_be()?;
        }
        if flags & TRUN_SAMPLE_SIZE != 0 {
            sample.size = io.read_u32_be()?;
        }
        if flags & TRUN_SAMPLE_FLAGS != 0 {
            sample.flags = io.read_u32_be()?;
        } else if let (0, Some(first)) = (i, first_sample_flags) {
            sample.flags = first;
        }
        if flags & TRUN_SAMPLE_CTS != 0 {
            sample.cts_offset = match version {
                0 => io.read_u32_be()? as i64,
                _ => io.read_i32_be()? as i64,
            };
        }
        samples.push(sample);
    }
    traf.runs.push(TrackRun {
        data_offset,
        samples,
    });
    Ok(())
}

/// Track fragment random access table.
pub fn tfra(
    io: &mut IoReader,
    ctx: &mut MovContext,
    _track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, _) = read_full_box_header(io)?;
    let track_id = io.read_u32_be()?;
    let sizes = io.read_u32_be()?;
    let traf_bytes = ((sizes >> 4) & 3) as u8 + 1;
    let trun_bytes = ((sizes >> 2) & 3) as u8 + 1;
    let sample_bytes = (sizes & 3) as u8 + 1;
    let count = io.read_u32_be()?;

    let mut entries = table(count)?;
    for _ in 0..count {
        let (time, pos) = match version {
            1 => (io.read_u64_be()? as i64, io.read_u64_be()?),
            _ => (io.read_u32_be()? as i64, io.read_u32_be()? as u64),
        };
        // traf, trun and sample numbers
        io.skip((traf_bytes + trun_bytes + sample_bytes) as u64)?;
        entries.push(FragIndexEntry { time, pos });
    }

    let Some(index) = ctx.track_by_id(track_id) else {
        return Err(BoxError::UnknownTrack {
            kind: header.kind.to_string(),
            track_id,
        }
        .into());
    };
    log::debug!("tfra: track {track_id}, {} entries", entries.len());
    ctx.tracks[index].frag_index = entries;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::formats::isobmff::context::{Fragment, TrackContext};
    use crate::formats::isobmff::reader::tests::{full_box, mp4_box};
    use crate::formats::isobmff::reader::{parse_box, read_box_header};

    fn u32s(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    /// `traf` for `track_id` with `sizes.len()` samples of 1000 ticks.
    pub(crate) fn traf_box(track_id: u32, decode_time: u64, sizes: &[u32], data_offset: i32) -> Vec<u8> {
        let tfhd = full_box(
            b"tfhd",
            0,
            TFHD_DEFAULT_DURATION | TFHD_DEFAULT_BASE_IS_MOOF,
            &u32s(&[track_id, 1000]),
        );
        let tfdt = full_box(b"tfdt", 1, 0, &decode_time.to_be_bytes());
        let mut trun_body = u32s(&[sizes.len() as u32, data_offset as u32, 0x0200_0000]);
        for (i, &size) in sizes.iter().enumerate() {
            trun_body.extend_from_slice(&size.to_be_bytes());
            let flags = if i == 0 { 0x0200_0000 } else { 0x0101_0000 };
            trun_body.extend_from_slice(&u32s(&[flags]));
        }
        let trun = full_box(
            b"trun",
            0,
            TRUN_DATA_OFFSET | TRUN_FIRST_SAMPLE_FLAGS | TRUN_SAMPLE_SIZE | TRUN_SAMPLE_FLAGS,
            &trun_body,
        );
        mp4_box(b"traf", &[tfhd, tfdt, trun].concat())
    }

    fn context_with_track(track_id: u32) -> MovContext {
        let mut ctx = MovContext::default();
        let mut track = TrackContext::new(0);
        track.track_id = track_id;
        ctx.tracks.push(track);
        ctx.current_fragment = Some(Fragment::default());
        ctx
    }

    fn parse(data: Vec<u8>, ctx: &mut MovContext) -> Result<(), FormatError> {
        let end = data.len() as u64;
        let mut io = IoReader::from_bytes(data);
        let header = read_box_header(&mut io, end)?;
        parse_box(&mut io, ctx, None, &header)
    }

    #[test]
    fn track_fragment() -> anyhow::Result<()> {
        let mut ctx = context_with_track(1);
        parse(full_box(b"mfhd", 0, 0, &u32s(&[7])), &mut ctx)?;
        parse(traf_box(1, 90_000, &[10, 20, 30], 100), &mut ctx)?;

        let fragment = ctx.current_fragment.as_ref().unwrap();
        assert_eq!(fragment.sequence, 7);
        let traf = &fragment.tracks[0];
        assert_eq!(traf.track_id, 1);
        assert!(traf.base_is_moof);
        assert_eq!(traf.base_media_decode_time, Some(90_000));
        assert_eq!(traf.sample_count(), 3);

        let run = &traf.runs[0];
        assert_eq!(run.data_offset, Some(100));
        assert_eq!(run.samples.iter().map(|s| s.size).collect::<Vec<_>>(), vec![10, 20, 30]);
        assert!(run.samples.iter().all(|s| s.duration == 1000));
        assert!(is_sync_sample(run.samples[0].flags));
        assert!(!is_sync_sample(run.samples[1].flags));
        Ok(())
    }

    #[test]
    fn unknown_track_is_fatal() {
        let mut ctx = context_with_track(1);
        assert!(parse(traf_box(2, 0, &[10], 8), &mut ctx).is_err());
        assert!(ctx.current_traf.is_none());
    }

    #[test]
    fn trex_defaults() -> anyhow::Result<()> {
        let mut ctx = context_with_track(1);
        parse(full_box(b"trex", 0, 0, &u32s(&[1, 1, 512, 64, 0x0101_0000])), &mut ctx)?;
        let tfhd = full_box(b"tfhd", 0, 0, &u32s(&[1]));
        let trun = full_box(b"trun", 0, 0, &u32s(&[2]));
        parse(mp4_box(b"traf", &[tfhd, trun].concat()), &mut ctx)?;

        let traf = &ctx.current_fragment.as_ref().unwrap().tracks[0];
        assert_eq!(traf.runs[0].samples.len(), 2);
        assert_eq!(traf.runs[0].samples[1].duration, 512);
        assert_eq!(traf.runs[0].samples[1].size, 64);
        assert!(!is_sync_sample(traf.runs[0].samples[0].flags));
        Ok(())
    }

    #[test]
    fn random_access_table() -> anyhow::Result<()> {
        let mut ctx = context_with_track(3);
        let mut body = u32s(&[3, 0, 2]);
        body.extend_from_slice(&u32s(&[0, 1000]));
        body.extend_from_slice(&[1, 1, 1]);
        body.extend_from_slice(&u32s(&[90_000, 5000]));
        body.extend_from_slice(&[1, 1, 1]);
        parse(full_box(b"tfra", 0, 0, &body), &mut ctx)?;
        assert_eq!(
            ctx.tracks[0].frag_index,
            vec![
                FragIndexEntry { time: 0, pos: 1000 },
                FragIndexEntry { time: 90_000, pos: 5000 }
            ]
        );
        Ok(())
    }
}
