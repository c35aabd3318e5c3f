//! Handler registry, movie/track headers and sample tables.

use super::context::{ElstEntry, MovContext, StscEntry, TrackContext};
use super::reader::{BoxHandler, BoxHeader, parse_children, read_full_box_header};
use super::{encryption, fragment, items, sample_entry};
use crate::io::IoReader;
use crate::structs::fourcc::FourCC;
use crate::structs::rational::Rational;
use crate::structs::stream::{Disposition, MediaType};
use crate::utils::errors::{BoxError, FormatError};

/// Handler for `kind`, `None` for boxes that are skipped or plain containers.
pub fn handler(kind: FourCC) -> Option<BoxHandler> {
    let handler: BoxHandler = match &kind.0 {
        b"ftyp" => ftyp,
        b"mvhd" => mvhd,
        b"trak" => trak,
        b"tkhd" => tkhd,
        b"mdhd" => mdhd,
        b"hdlr" => hdlr,
        b"meta" => meta,
        b"ilst" => ilst,
        b"stts" => stts,
        b"ctts" => ctts,
        b"stss" => stss,
        b"stsc" => stsc,
        b"stsz" => stsz,
        b"stz2" => stz2,
        b"stco" => stco,
        b"co64" => co64,
        b"elst" => elst,

        b"stsd" => sample_entry::stsd,
        b"avcC" | b"hvcC" | b"vvcC" => sample_entry::nal_config,
        b"esds" => sample_entry::esds,
        b"dOps" => sample_entry::d_ops,
        b"dfLa" => sample_entry::dfla,
        b"dac3" => sample_entry::dac3,
        b"dec3" => sample_entry::dec3,
        b"btrt" => sample_entry::btrt,
        b"enda" => sample_entry::enda,
        b"pcmC" => sample_entry::pcm_c,

        b"mvex" => mvex,
        b"mehd" => fragment::mehd,
        b"trex" => fragment::trex,
        b"mfhd" => fragment::mfhd,
        b"traf" => fragment::traf,
        b"tfhd" => fragment::tfhd,
        b"tfdt" => fragment::tfdt,
        b"trun" => fragment::trun,
        b"tfra" => fragment::tfra,

        b"frma" => encryption::frma,
        b"schm" => encryption::schm,
        b"tenc" => encryption::tenc,
        b"saiz" => encryption::saiz,
        b"saio" => encryption::saio,
        b"senc" => encryption::senc,
        b"pssh" => encryption::pssh,

        b"iinf" => items::iinf,
        b"iref" => items::iref,
        b"pitm" => items::pitm,

        [0xA9, ..] => udta_text,
        _ => return None,
    };
    Some(handler)
}

/// Track a table box belongs to, an error outside `trak`.
pub fn track_mut<'a>(
    ctx: &'a mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<&'a mut TrackContext, FormatError> {
    track
        .and_then(|index| ctx.tracks.get_mut(index))
        .ok_or_else(|| FormatError::invalid(format!("'{}' outside of a track", header.kind)))
}

/// Index of the enclosing track, an error outside `trak`.
pub fn track_index(
    ctx: &MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<usize, FormatError> {
    track
        .filter(|&index| index < ctx.tracks.len())
        .ok_or_else(|| FormatError::invalid(format!("'{}' outside of a track", header.kind)))
}

pub fn unsupported_version(header: &BoxHeader, version: u8) -> FormatError {
    BoxError::UnsupportedVersion {
        kind: header.kind.to_string(),
        version,
    }
    .into()
}

/// Allocates room for `count` table entries.
pub fn table<T>(count: u32) -> Result<Vec<T>, FormatError> {
    let mut entries = Vec::new();
    entries
        .try_reserve_exact(count as usize)
        .map_err(|_| FormatError::NoMemory)?;
    Ok(entries)
}

fn ftyp(
    io: &mut IoReader,
    ctx: &mut MovContext,
    _track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let major = io.read_fourcc()?;
    ctx.minor_version = io.read_u32_be()?;
    ctx.compatible_brands.clear();
    while io.pos() + 4 <= header.end() {
        ctx.compatible_brands.push(io.read_fourcc()?);
    }
    ctx.is_quicktime = major == b"qt  ";
    ctx.major_brand = Some(major);
    ctx.metadata
        .insert("major_brand".to_string(), major.to_string().trim_end().to_string());
    Ok(())
}

fn mvhd(
    io: &mut IoReader,
    ctx: &mut MovContext,
    _track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, _) = read_full_box_header(io)?;
    let (timescale, duration) = match version {
        0 => {
            io.skip(8)?;
            let timescale = io.read_u32_be()?;
            let duration = io.read_u32_be()?;
            (timescale, if duration == u32::MAX { 0 } else { duration as u64 })
        }
        1 => {
            io.skip(16)?;
            (io.read_u32_be()?, io.read_u64_be()?)
        }
        v => return Err(unsupported_version(header, v)),
    };
    if timescale == 0 {
        return Err(FormatError::invalid("mvhd: timescale 0"));
    }
    ctx.timescale = timescale;
    ctx.duration = duration;
    Ok(())
}

fn trak(
    io: &mut IoReader,
    ctx: &mut MovContext,
    _track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let index = ctx.tracks.len();
    ctx.tracks.push(TrackContext::new(index));
    parse_children(io, ctx, Some(index), header.end())?;

    let track = &mut ctx.tracks[index];
    if track.timescale == 0 {
        log::warn!("track {}: no mdhd, assuming timescale 1000", track.track_id);
        track.timescale = 1000;
    }
    log::debug!(
        "track {}: {} {} ({} samples)",
        track.track_id,
        track.stream.codecpar.media_type,
        track.stream.codecpar.codec_id,
        track.sample_sizes.len()
    );
    Ok(())
}

fn mvex(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    ctx.is_fragment = true;
    parse_children(io, ctx, track, header.end())
}

fn tkhd(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, flags) = read_full_box_header(io)?;
    let track_id = match version {
        0 => {
            io.skip(8)?;
            let id = io.read_u32_be()?;
            io.skip(8)?;
            id
        }
        1 => {
            io.skip(16)?;
            let id = io.read_u32_be()?;
            io.skip(12)?;
            id
        }
        v => return Err(unsupported_version(header, v)),
    };
    // reserved, layer, alternate group, volume, reserved, matrix
    io.skip(8 + 8 + 36)?;
    let width = io.read_u32_be()? >> 16;
    let height = io.read_u32_be()? >> 16;

    let track = track_mut(ctx, track, header)?;
    track.track_id = track_id;
    track.stream.id = track_id;
    track.width = width;
    track.height = height;
    if flags & 0x1 != 0 {
        track.stream.disposition |= Disposition::DEFAULT;
    }
    Ok(())
}

/// ISO-639-2/T code packed as three 5-bit letters.
fn unpack_language(code: u16) -> Option<String> {
    if code == 0 || code == 0x7FFF {
        return None;
    }
    let letters: String = [10, 5, 0]
        .iter()
        .map(|shift| (((code >> shift) & 0x1F) as u8 + 0x60) as char)
        .collect();
    letters
        .chars()
        .all(|c| c.is_ascii_lowercase())
        .then_some(letters)
        .filter(|l| l != "und")
}

fn mdhd(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, _) = read_full_box_header(io)?;
    let (timescale, duration) = match version {
        0 => {
            io.skip(8)?;
            let timescale = io.read_u32_be()?;
            let duration = io.read_u32_be()?;
            (timescale, if duration == u32::MAX { 0 } else { duration as u64 })
        }
        1 => {
            io.skip(16)?;
            (io.read_u32_be()?, io.read_u64_be()?)
        }
        v => return Err(unsupported_version(header, v)),
    };
    let language = io.read_u16_be()?;
    if timescale == 0 {
        return Err(FormatError::invalid("mdhd: timescale 0"));
    }

    let track = track_mut(ctx, track, header)?;
    track.timescale = timescale;
    track.stream.time_base = Rational::new(1, timescale as i32);
    track.stream.duration = duration as i64;
    if let Some(language) = unpack_language(language) {
        track.stream.metadata.insert("language".to_string(), language);
    }
    Ok(())
}

fn hdlr(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    read_full_box_header(io)?;
    let component_type = io.read_fourcc()?;
    let handler_type = io.read_fourcc()?;
    io.skip(12)?;
    let name_len = header.end().saturating_sub(io.pos());
    let name = io.read_cstring(name_len)?;

    // QuickTime data references carry a 'dhlr' component type, `meta`
    // handlers describe metadata rather than the track.
    if component_type == b"dhlr" || matches!(&handler_type.0, b"mdir" | b"mdta" | b"ID32") {
        return Ok(());
    }
    let Some(index) = track else {
        return Ok(());
    };
    let track = track_mut(ctx, Some(index), header)?;
    track.handler = Some(handler_type);
    track.stream.codecpar.media_type = match &handler_type.0 {
        b"vide" => MediaType::Video,
        b"soun" => MediaType::Audio,
        b"subt" | b"text" | b"sbtl" => MediaType::Subtitle,
        _ => MediaType::Data,
    };
    let name = name.trim_matches(char::from(0)).trim();
    if !name.is_empty() {
        track
            .stream
            .metadata
            .insert("handler_name".to_string(), name.to_string());
    }
    Ok(())
}

/// ISO `meta` is a full box, QuickTime `meta` is a plain container.
fn meta(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let peek = io.peek(8)?;
    if &peek[4..8] != b"hdlr" {
        read_full_box_header(io)?;
    }
    parse_children(io, ctx, track, header.end())
}

fn metadata_key(kind: FourCC) -> Option<&'static str> {
    Some(match &kind.0 {
        b"\xA9nam" => "title",
        b"\xA9ART" => "artist",
        b"aART" => "album_artist",
        b"\xA9alb" => "album",
        b"\xA9day" => "date",
        b"\xA9cmt" => "comment",
        b"\xA9gen" => "genre",
        b"\xA9too" => "encoder",
        b"\xA9wrt" => "composer",
        b"cprt" | b"\xA9cpy" => "copyright",
        b"desc" => "description",
        _ => return None,
    })
}

fn insert_metadata(ctx: &mut MovContext, track: Option<usize>, key: &str, value: String) {
    let value = value.trim_end_matches(char::from(0)).to_string();
    match track.and_then(|index| ctx.tracks.get_mut(index)) {
        Some(track) => track.stream.metadata.insert(key.to_string(), value),
        None => ctx.metadata.insert(key.to_string(), value),
    };
}

/// iTunes item list: each item holds a `data` box.
fn ilst(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    while io.pos() + 8 <= header.end() {
        let item = super::reader::read_box_header(io, header.end())?;
        if let Some(key) = metadata_key(item.kind) {
            while io.pos() + 16 <= item.end() {
                let data = super::reader::read_box_header(io, item.end())?;
                if data.kind == b"data" {
                    let data_type = io.read_u32_be()? & 0x00FF_FFFF;
                    io.skip(4)?;
                    let len = data.end().saturating_sub(io.pos()) as usize;
                    // 1: UTF-8
                    if data_type == 1 {
                        let value = io.read_string(len)?;
                        insert_metadata(ctx, track, key, value);
                    }
                }
                io.seek(data.end())?;
            }
        }
        io.seek(item.end())?;
    }
    Ok(())
}

/// QuickTime `udta` text atom: a list of (size, language, text).
fn udta_text(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let Some(key) = metadata_key(header.kind) else {
        return Ok(());
    };
    if header.body_size() < 4 {
        return Ok(());
    }
    let len = io.read_u16_be()? as u64;
    io.skip(2)?;
    let len = len.min(header.end().saturating_sub(io.pos()));
    let value = io.read_string(len as usize)?;
    insert_metadata(ctx, track, key, value);
    Ok(())
}

fn stts(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    read_full_box_header(io)?;
    let count = io.read_u32_be()?;
    let mut entries = table(count)?;
    for _ in 0..count {
        let sample_count = io.read_u32_be()?;
        let delta = io.read_u32_be()?;
        entries.push((sample_count, delta));
    }
    track_mut(ctx, track, header)?.stts = entries;
    Ok(())
}

fn ctts(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    // Version 0 offsets are unsigned on paper but signed in practice.
    read_full_box_header(io)?;
    let count = io.read_u32_be()?;
    let mut entries = table(count)?;
    for _ in 0..count {
        let sample_count = io.read_u32_be()?;
        let offset = io.read_i32_be()?;
        entries.push((sample_count, offset as i64));
    }
    track_mut(ctx, track, header)?.ctts = entries;
    Ok(())
}

fn stss(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    read_full_box_header(io)?;
    let count = io.read_u32_be()?;
    let mut entries = table(count)?;
    for _ in 0..count {
        entries.push(io.read_u32_be()?);
    }
    track_mut(ctx, track, header)?.stss = Some(entries);
    Ok(())
}

fn stsc(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    read_full_box_header(io)?;
    let count = io.read_u32_be()?;
    let mut entries = table(count)?;
    for _ in 0..count {
        entries.push(StscEntry {
            first_chunk: io.read_u32_be()?,
            samples_per_chunk: io.read_u32_be()?,
            sample_description_index: io.read_u32_be()?,
        });
    }
    if entries.first().is_some_and(|e| e.first_chunk == 0) {
        return Err(FormatError::invalid("stsc: chunk numbers start at 1"));
    }
    track_mut(ctx, track, header)?.stsc = entries;
    Ok(())
}

fn stsz(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    read_full_box_header(io)?;
    let sample_size = io.read_u32_be()?;
    let count = io.read_u32_be()?;
    let mut sizes = table(count)?;
    if sample_size != 0 {
        sizes.resize(count as usize, sample_size);
    } else {
        for _ in 0..count {
            sizes.push(io.read_u32_be()?);
        }
    }
    track_mut(ctx, track, header)?.sample_sizes = sizes;
    Ok(())
}

fn stz2(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    read_full_box_header(io)?;
    let field_size = io.read_u32_be()? & 0xFF;
    let count = io.read_u32_be()?;
    let mut sizes = table(count)?;
    match field_size {
        4 => {
            for i in 0..count {
                if i % 2 == 0 {
                    let byte = io.read_u8()?;
                    sizes.push((byte >> 4) as u32);
                    if i + 1 < count {
                        sizes.push((byte & 0x0F) as u32);
                    }
                }
            }
        }
        8 => {
            for _ in 0..count {
                sizes.push(io.read_u8()? as u32);
            }
        }
        16 => {
            for _ in 0..count {
                sizes.push(io.read_u16_be()? as u32);
            }
        }
        n => return Err(FormatError::invalid(format!("stz2: field size {n}"))),
    }
    track_mut(ctx, track, header)?.sample_sizes = sizes;
    Ok(())
}

fn stco(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    read_full_box_header(io)?;
    let count = io.read_u32_be()?;
    let mut offsets = table(count)?;
    for _ in 0..count {
        offsets.push(io.read_u32_be()? as u64);
    }
    track_mut(ctx, track, header)?.chunk_offsets = offsets;
    Ok(())
}

fn co64(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    read_full_box_header(io)?;
    let count = io.read_u32_be()?;
    let mut offsets = table(count)?;
    for _ in 0..count {
        offsets.push(io.read_u64_be()?);
    }
    track_mut(ctx, track, header)?.chunk_offsets = offsets;
    Ok(())
}

fn elst(
    io: &mut IoReader,
    ctx: &mut MovContext,
    track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, _) = read_full_box_header(io)?;
    let count = io.read_u32_be()?;
    let mut entries = table(count)?;
    for _ in 0..count {
        let (segment_duration, media_time) = match version {
            0 => (io.read_u32_be()? as u64, io.read_i32_be()? as i64),
            1 => (io.read_u64_be()?, io.read_i64_be()?),
            v => return Err(unsupported_version(header, v)),
        };
        entries.push(ElstEntry {
            segment_duration,
            media_time,
            media_rate: io.read_i32_be()?,
        });
    }
    track_mut(ctx, track, header)?.elst = entries;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::isobmff::reader::parse_box;
    use crate::formats::isobmff::reader::read_box_header;
    use crate::formats::isobmff::reader::tests::{full_box, mp4_box};

    fn parse_in_track(data: Vec<u8>, ctx: &mut MovContext) -> anyhow::Result<()> {
        if ctx.tracks.is_empty() {
            ctx.tracks.push(TrackContext::new(0));
        }
        let end = data.len() as u64;
        let mut io = IoReader::from_bytes(data);
        let header = read_box_header(&mut io, end)?;
        parse_box(&mut io, ctx, Some(0), &header)?;
        assert_eq!(io.pos(), end);
        Ok(())
    }

    fn u32s(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    #[test]
    fn sample_tables() -> anyhow::Result<()> {
        let mut ctx = MovContext::default();
        parse_in_track(full_box(b"stts", 0, 0, &u32s(&[2, 3, 10, 1, 1, 5])), &mut ctx)?;
        parse_in_track(full_box(b"stsz", 0, 0, &u32s(&[0, 3, 100, 200, 300])), &mut ctx)?;
        parse_in_track(full_box(b"stsc", 0, 0, &u32s(&[1, 1, 2, 1])), &mut ctx)?;
        parse_in_track(full_box(b"co64", 0, 0, &u32s(&[1, 1, 0])), &mut ctx)?;
        parse_in_track(full_box(b"ctts", 0, 0, &u32s(&[1, (-2i32) as u32])), &mut ctx)?;
        parse_in_track(full_box(b"stss", 0, 0, &u32s(&[1, 1])), &mut ctx)?;

        let track = &ctx.tracks[0];
        assert_eq!(track.stts, vec![(2, 3), (10, 1), (1, 5)]);
        assert_eq!(track.sample_sizes, vec![100, 200, 300]);
        assert_eq!(track.stsc[0].samples_per_chunk, 2);
        assert_eq!(track.chunk_offsets, vec![1 << 32]);
        assert_eq!(track.ctts, vec![(1, -2)]);
        assert_eq!(track.stss, Some(vec![1]));
        Ok(())
    }

    #[test]
    fn compact_sample_sizes() -> anyhow::Result<()> {
        let mut ctx = MovContext::default();
        let mut body = u32s(&[4, 3]);
        body.extend_from_slice(&[0x12, 0x30]);
        parse_in_track(full_box(b"stz2", 0, 0, &body), &mut ctx)?;
        assert_eq!(ctx.tracks[0].sample_sizes, vec![1, 2, 3]);

        let mut body = u32s(&[16, 2]);
        body.extend_from_slice(&[0x01, 0x00, 0x00, 0x20]);
        parse_in_track(full_box(b"stz2", 0, 0, &body), &mut ctx)?;
        assert_eq!(ctx.tracks[0].sample_sizes, vec![256, 32]);
        Ok(())
    }

    #[test]
    fn media_header_and_handler() -> anyhow::Result<()> {
        let mut ctx = MovContext::default();
        let mut body = vec![0u8; 8];
        body.extend_from_slice(&u32s(&[48000, 96000]));
        // "eng"
        let lang: u16 = ((b'e' - 0x60) as u16) << 10 | ((b'n' - 0x60) as u16) << 5 | (b'g' - 0x60) as u16;
        body.extend_from_slice(&lang.to_be_bytes());
        body.extend_from_slice(&[0, 0]);
        parse_in_track(full_box(b"mdhd", 0, 0, &body), &mut ctx)?;

        let mut body = vec![0u8; 4];
        body.extend_from_slice(b"soun");
        body.extend_from_slice(&[0; 12]);
        body.extend_from_slice(b"SoundHandler\0");
        parse_in_track(full_box(b"hdlr", 0, 0, &body), &mut ctx)?;

        let stream = &ctx.tracks[0].stream;
        assert_eq!(stream.time_base, Rational::new(1, 48000));
        assert_eq!(stream.duration, 96000);
        assert_eq!(stream.metadata.get("language").map(String::as_str), Some("eng"));
        assert_eq!(stream.metadata.get("handler_name").map(String::as_str), Some("SoundHandler"));
        assert_eq!(stream.codecpar.media_type, MediaType::Audio);
        Ok(())
    }

    #[test]
    fn edit_list_versions() -> anyhow::Result<()> {
        let mut ctx = MovContext::default();
        parse_in_track(full_box(b"elst", 0, 0, &u32s(&[2, 500, u32::MAX, 0x10000, 1000, 1024, 0x10000])), &mut ctx)?;
        let elst = &ctx.tracks[0].elst;
        assert_eq!(elst.len(), 2);
        assert_eq!(elst[0].media_time, -1);
        assert_eq!(elst[1].media_time, 1024);
        assert_eq!(elst[1].segment_duration, 1000);
        Ok(())
    }

    #[test]
    fn itunes_metadata() -> anyhow::Result<()> {
        let mut data_body = u32s(&[1, 0]);
        data_body.extend_from_slice(b"A title");
        let item = mp4_box(b"\xA9nam", &mp4_box(b"data", &data_body));
        let ilst = mp4_box(b"ilst", &item);

        let mut hdlr_body = vec![0u8; 4];
        hdlr_body.extend_from_slice(b"mdir");
        hdlr_body.extend_from_slice(&[0; 13]);
        let mut meta_body = full_box(b"hdlr", 0, 0, &hdlr_body);
        meta_body.extend_from_slice(&ilst);
        let meta = full_box(b"meta", 0, 0, &meta_body);
        let udta = mp4_box(b"udta", &meta);

        let end = udta.len() as u64;
        let mut io = IoReader::from_bytes(udta);
        let mut ctx = MovContext::default();
        let header = read_box_header(&mut io, end)?;
        parse_box(&mut io, &mut ctx, None, &header)?;
        assert_eq!(ctx.metadata.get("title").map(String::as_str), Some("A title"));
        Ok(())
    }

    #[test]
    fn table_outside_track_is_skipped() -> anyhow::Result<()> {
        let data = full_box(b"stss", 0, 0, &u32s(&[1, 1]));
        let end = data.len() as u64;
        let mut io = IoReader::from_bytes(data);
        let mut ctx = MovContext::default();
        let header = read_box_header(&mut io, end)?;
        parse_box(&mut io, &mut ctx, None, &header)?;
        assert_eq!(io.pos(), end);
        Ok(())
    }
}
