//! Common Encryption boxes: scheme information, sample auxiliary data and
//! protection system headers.

use super::boxes::{table, track_index, track_mut};
use super::context::{CencAux, MovContext};
use super::reader::{BoxHeader, read_full_box_header};
use crate::io::IoReader;
use crate::structs::encryption::{EncryptionInitInfo, SampleEncryption, Subsample, TrackEncryption};
use crate::utils::errors::FormatError;

/// `senc` flag: entries carry subsample maps.
pub const SENC_USE_SUBSAMPLES: u32 = 0x2;

/// Auxiliary data of the `traf` being parsed, or of the enclosing track.
fn cenc_target<'a>(
    ctx: &'a mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<&'a mut CencAux, FormatError> {
    if ctx.current_traf.is_some() {
        return ctx
            .current_traf
            .as_mut()
            .map(|traf| &mut traf.cenc)
            .ok_or_else(|| FormatError::invalid(format!("'{}' outside of 'traf'", header.kind)));
    }
    Ok(&mut track_mut(ctx, track, header)?.cenc)
}

/// Per-sample IV size of the track owning the current box.
fn iv_size(ctx: &MovContext, track: Option<usize>) -> u8 {
    let index = match &ctx.current_traf {
        Some(traf) => ctx.track_by_id(traf.track_id),
        None => track,
    };
    index
        .and_then(|i| ctx.tracks.get(i))
        .and_then(|t| t.tenc.as_ref())
        .map_or(0, |tenc| tenc.per_sample_iv_size)
}

/// Original sample entry type of a protected entry.
pub fn frma(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let format = io.read_fourcc()?;
    track_mut(ctx, track, header)?.original_format = Some(format);
    Ok(())
}

pub fn schm(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    read_full_box_header(io)?;
    let scheme = io.read_fourcc()?;
    let version = io.read_u32_be()?;
    log::debug!("protection scheme '{scheme}' version 0x{version:08X}");
    track_mut(ctx, track, header)?.scheme = Some(scheme);
    Ok(())
}

pub fn tenc(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, _) = read_full_box_header(io)?;
    io.skip(1)?;
    let pattern = io.read_u8()?;
    let mut tenc = TrackEncryption::default();
    if version > 0 {
        tenc.crypt_byte_block = pattern >> 4;
        tenc.skip_byte_block = pattern & 0x0F;
    }
    tenc.is_protected = io.read_u8()? != 0;
    tenc.per_sample_iv_size = io.read_u8()?;
    tenc.key_id = io.read_array::<16>()?;
    if tenc.is_protected && tenc.per_sample_iv_size == 0 {
        let len = io.read_u8()?;
        tenc.constant_iv = io.read_bytes(len as usize)?;
    }
    if !matches!(tenc.per_sample_iv_size, 0 | 8 | 16) {
        return Err(FormatError::invalid(format!(
            "tenc: per-sample IV size {}",
            tenc.per_sample_iv_size
        )));
    }
    track_mut(ctx, track, header)?.tenc = Some(tenc);
    Ok(())
}

pub fn saiz(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (_, flags) = read_full_box_header(io)?;
    if flags & 0x1 != 0 {
        // aux_info_type, aux_info_type_parameter
        io.skip(8)?;
    }
    let default_size = io.read_u8()?;
    let count = io.read_u32_be()?;
    let sizes = if default_size == 0 {
        io.read_bytes(count as usize)?
    } else {
        Vec::new()
    };
    let cenc = cenc_target(ctx, track, header)?;
    cenc.default_sample_info_size = default_size;
    cenc.sample_count = count;
    cenc.sample_info_sizes = sizes;
    Ok(())
}

pub fn saio(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, flags) = read_full_box_header(io)?;
    if flags & 0x1 != 0 {
        let info_type = io.read_u32_be()?;
        let param = io.read_u32_be()?;
        if param != 0 {
            log::warn!("saio: ignoring aux info type 0x{info_type:08X} parameter {param}");
            return Ok(());
        }
    }
    let count = io.read_u32_be()?;
    let mut offsets = table(count)?;
    for _ in 0..count {
        offsets.push(match version {
            0 => io.read_u32_be()? as u64,
            _ => io.read_u64_be()?,
        });
    }
    cenc_target(ctx, track, header)?.offsets = offsets;
    Ok(())
}

fn read_sample_encryption(
    io: &mut IoReader,
    iv_size: u8,
    with_subsamples: bool,
) -> Result<SampleEncryption, FormatError> {
    let iv = io.read_bytes(iv_size as usize)?;
    let mut subsamples = Vec::new();
    if with_subsamples {
        let count = io.read_u16_be()?;
        subsamples.reserve(count as usize);
        for _ in 0..count {
            subsamples.push(Subsample {
                bytes_of_clear_data: io.read_u16_be()? as u32,
                bytes_of_protected_data: io.read_u32_be()?,
            });
        }
    }
    Ok(SampleEncryption { iv, subsamples })
}

pub fn senc(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (_, flags) = read_full_box_header(io)?;
    let iv_size = iv_size(ctx, track);
    let count = io.read_u32_be()?;
    let mut samples = table(count)?;
    for _ in 0..count {
        samples.push(read_sample_encryption(io, iv_size, flags & SENC_USE_SUBSAMPLES != 0)?);
    }
    cenc_target(ctx, track, header)?.samples = samples;
    Ok(())
}

/// Protection system specific header.
pub fn pssh(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, _) = read_full_box_header(io)?;
    let system_id = io.read_array::<16>()?;
    let mut key_ids = Vec::new();
    if version > 0 {
        let count = io.read_u32_be()?;
        key_ids = table(count)?;
        for _ in 0..count {
            key_ids.push(io.read_array::<16>()?);
        }
    }
    let len = io.read_u32_be()?;
    let data = io.read_bytes(len as usize)?;
    let info = EncryptionInitInfo {
        system_id,
        key_ids,
        data,
    };

    if ctx.found_moov || ctx.current_fragment.is_some() {
        ctx.pending_pssh.push(info);
    } else if let Ok(index) = track_index(ctx, track, header) {
        ctx.tracks[index].stream.encryption_init.push(info);
    } else {
        ctx.pssh.push(info);
    }
    Ok(())
}

/// Reads sample auxiliary information described by `saiz`/`saio` from
/// `base + offsets[0]`, then returns to the current position.
pub fn load_aux_info(io: &mut IoReader, cenc: &mut CencAux, iv_size: u8, base: u64) -> Result<(), FormatError> {
    if !cenc.needs_load() {
        return Ok(());
    }
    if cenc.offsets.len() != 1 {
        log::warn!(
            "saio: {} offsets for {} samples, only a single contiguous run is supported",
            cenc.offsets.len(),
            cenc.sample_count
        );
        return Ok(());
    }

    let pos = io.pos();
    io.seek(base + cenc.offsets[0])?;
    let mut samples = table(cenc.sample_count)?;
    for i in 0..cenc.sample_count as usize {
        let info_size = cenc.info_size(i);
        let with_subsamples = info_size > iv_size as usize;
        samples.push(read_sample_encryption(io, iv_size, with_subsamples)?);
    }
    io.seek(pos)?;
    cenc.samples = samples;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::isobmff::context::{Fragment, FragmentTrack, TrackContext};
    use crate::formats::isobmff::reader::tests::full_box;
    use crate::formats::isobmff::reader::{parse_box, read_box_header};

    fn parse(data: Vec<u8>, ctx: &mut MovContext, track: Option<usize>) -> anyhow::Result<()> {
        let end = data.len() as u64;
        let mut io = IoReader::from_bytes(data);
        let header = read_box_header(&mut io, end)?;
        parse_box(&mut io, ctx, track, &header)?;
        assert_eq!(io.pos(), end);
        Ok(())
    }

    fn tenc_box(iv_size: u8) -> Vec<u8> {
        let mut body = vec![0, 0x19, 1, iv_size];
        body.extend_from_slice(&[0xAB; 16]);
        full_box(b"tenc", 1, 0, &body)
    }

    fn protected_context() -> anyhow::Result<MovContext> {
        let mut ctx = MovContext::default();
        let mut track = TrackContext::new(0);
        track.track_id = 1;
        ctx.tracks.push(track);
        parse(tenc_box(8), &mut ctx, Some(0))?;
        Ok(ctx)
    }

    #[test]
    fn track_encryption() -> anyhow::Result<()> {
        let ctx = protected_context()?;
        let tenc = ctx.tracks[0].tenc.as_ref().unwrap();
        assert!(tenc.is_protected);
        assert_eq!(tenc.per_sample_iv_size, 8);
        assert_eq!((tenc.crypt_byte_block, tenc.skip_byte_block), (1, 9));
        assert_eq!(tenc.key_id, [0xAB; 16]);
        assert!(ctx.tracks[0].is_encrypted());
        Ok(())
    }

    #[test]
    fn sample_encryption_in_fragment() -> anyhow::Result<()> {
        let mut ctx = protected_context()?;
        ctx.current_fragment = Some(Fragment::default());
        ctx.current_traf = Some(FragmentTrack {
            track_id: 1,
            ..Default::default()
        });

        let mut body = 2u32.to_be_bytes().to_vec();
        for n in 0..2u8 {
            body.extend_from_slice(&[n; 8]);
            body.extend_from_slice(&1u16.to_be_bytes());
            body.extend_from_slice(&16u16.to_be_bytes());
            body.extend_from_slice(&100u32.to_be_bytes());
        }
        parse(full_box(b"senc", 0, SENC_USE_SUBSAMPLES, &body), &mut ctx, None)?;

        let cenc = &ctx.current_traf.as_ref().unwrap().cenc;
        assert_eq!(cenc.samples.len(), 2);
        assert_eq!(cenc.samples[1].iv, vec![1; 8]);
        assert_eq!(
            cenc.samples[1].subsamples,
            vec![Subsample {
                bytes_of_clear_data: 16,
                bytes_of_protected_data: 100
            }]
        );
        Ok(())
    }

    #[test]
    fn aux_info_from_offsets() -> anyhow::Result<()> {
        let mut data = vec![0u8; 10];
        data.extend_from_slice(&[7; 8]);
        data.extend_from_slice(&[9; 8]);
        let mut io = IoReader::from_bytes(data);
        io.seek(3)?;

        let mut cenc = CencAux {
            default_sample_info_size: 8,
            sample_count: 2,
            offsets: vec![6],
            ..Default::default()
        };
        load_aux_info(&mut io, &mut cenc, 8, 4)?;
        assert_eq!(io.pos(), 3);
        assert_eq!(cenc.samples[0].iv, vec![7; 8]);
        assert_eq!(cenc.samples[1].iv, vec![9; 8]);
        assert!(cenc.samples[0].subsamples.is_empty());
        Ok(())
    }

    #[test]
    fn protection_headers() -> anyhow::Result<()> {
        let mut ctx = MovContext::default();
        let mut body = vec![0x10; 16];
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&[0x20; 16]);
        body.extend_from_slice(&3u32.to_be_bytes());
        body.extend_from_slice(&[1, 2, 3]);
        parse(full_box(b"pssh", 1, 0, &body), &mut ctx, None)?;

        assert_eq!(ctx.pssh.len(), 1);
        assert_eq!(ctx.pssh[0].system_id, [0x10; 16]);
        assert_eq!(ctx.pssh[0].key_ids, vec![[0x20; 16]]);
        assert_eq!(ctx.pssh[0].data, vec![1, 2, 3]);
        Ok(())
    }
}
