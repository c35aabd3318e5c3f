//! Item boxes of a `meta` box (`iinf`, `iref`, `pitm`).

use super::boxes::unsupported_version;
use super::context::{ItemInfo, ItemReference, MovContext};
use super::reader::{BoxHeader, read_box_header, read_full_box_header};
use crate::io::IoReader;
use crate::utils::errors::FormatError;

fn read_item_id(io: &mut IoReader, wide: bool) -> Result<u32, FormatError> {
    Ok(if wide {
        io.read_u32_be()?
    } else {
        io.read_u16_be()? as u32
    })
}

pub fn iinf(
    io: &mut IoReader,
    ctx: &mut MovContext,
    _track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, _) = read_full_box_header(io)?;
    let count = read_item_id(io, version > 0)?;
    for _ in 0..count {
        if io.pos() + 8 > header.end() {
            break;
        }
        let entry = read_box_header(io, header.end())?;
        if entry.kind == b"infe" {
            let (version, _) = read_full_box_header(io)?;
            if version < 2 {
                log::warn!("infe version {version} is not supported");
                io.seek(entry.end())?;
                continue;
            }
            let id = read_item_id(io, version > 2)?;
            let protection_index = io.read_u16_be()?;
            let item_type = io.read_fourcc()?;
            let name = io.read_cstring(entry.end().saturating_sub(io.pos()))?;

            let info = ItemInfo {
                id,
                protection_index,
                item_type: Some(item_type),
                name,
            };
            match ctx.items.iter_mut().find(|item| item.id == id) {
                Some(item) => *item = info,
                None => ctx.items.push(info),
            }
        }
        io.seek(entry.end())?;
    }
    Ok(())
}

pub fn iref(
    io: &mut IoReader,
    ctx: &mut MovContext,
    _track: Option<usize>,
    header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, _) = read_full_box_header(io)?;
    if version > 1 {
        return Err(unsupported_version(header, version));
    }
    let wide = version == 1;
    while io.pos() + 8 <= header.end() {
        let entry = read_box_header(io, header.end())?;
        let from = read_item_id(io, wide)?;
        let count = io.read_u16_be()?;
        let mut to = Vec::with_capacity(count as usize);
        for _ in 0..count {
            to.push(read_item_id(io, wide)?);
        }
        ctx.item_refs.push(ItemReference {
            kind: entry.kind,
            from,
            to,
        });
        io.seek(entry.end())?;
    }
    Ok(())
}

pub fn pitm(
    io: &mut IoReader,
    ctx: &mut MovContext,
    _track: Option<usize>,
    _header: &BoxHeader,
) -> Result<(), FormatError> {
    let (version, _) = read_full_box_header(io)?;
    ctx.primary_item = Some(read_item_id(io, version > 0)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::isobmff::reader::tests::{full_box, mp4_box};
    use crate::formats::isobmff::reader::parse_box;

    fn parse(data: Vec<u8>, ctx: &mut MovContext) -> Result<(), FormatError> {
        let end = data.len() as u64;
        let mut io = IoReader::from_bytes(data);
        let header = read_box_header(&mut io, end)?;
        parse_box(&mut io, ctx, None, &header)
    }

    #[test]
    fn item_info_and_references() -> anyhow::Result<()> {
        let mut ctx = MovContext::default();
        let mut infe = vec![0, 1, 0, 0];
        infe.extend_from_slice(b"hvc1");
        infe.extend_from_slice(b"Image\0");
        let mut iinf = 1u16.to_be_bytes().to_vec();
        iinf.extend_from_slice(&full_box(b"infe", 2, 0, &infe));
        parse(full_box(b"iinf", 0, 0, &iinf), &mut ctx)?;
        parse(full_box(b"pitm", 0, 0, &[0, 1]), &mut ctx)?;
        parse(full_box(b"iref", 0, 0, &mp4_box(b"thmb", &[0, 2, 0, 1, 0, 1])), &mut ctx)?;

        assert_eq!(ctx.items.len(), 1);
        assert_eq!(ctx.items[0].id, 1);
        assert_eq!(ctx.items[0].item_type, Some(b"hvc1".into()));
        assert_eq!(ctx.items[0].name, "Image");
        assert_eq!(ctx.primary_item, Some(1));
        assert_eq!(ctx.item_refs[0].from, 2);
        assert_eq!(ctx.item_refs[0].to, vec![1]);
        Ok(())
    }

    #[test]
    fn unknown_iref_version_is_fatal() {
        let mut ctx = MovContext::default();
        assert!(parse(full_box(b"iref", 2, 0, &[]), &mut ctx).is_err());
    }
}
