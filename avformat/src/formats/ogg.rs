//! Ogg demuxer.
//!
//! Every page is checked against its CRC. A page failing the check is
//! dropped together with the packet it would continue, and reading resumes
//! at the next capture pattern. Opus, Vorbis and FLAC logical streams are
//! mapped, pages of any other logical stream are skipped.
//!
//! Packet timestamps come from the granule position of the page a packet
//! ends on. When the codec tells packet durations they are counted back from
//! that granule, otherwise the span since the previous page is shared evenly.

use std::collections::{BTreeMap, HashMap, VecDeque};

use log::Level;

use super::flac::parse_vorbis_comment;
use super::{IFormat, InputContext, PROBE_SCORE_MAX, PROBE_SCORE_PARTIAL, SeekFlags};
use crate::codecs::flac::{FrameHeader, METADATA_VORBIS_COMMENT, STREAMINFO_SIZE, StreamInfo};
use crate::codecs::opus;
use crate::io::IoReader;
use crate::log_or_err;
use crate::structs::packet::{Packet, PacketFlags};
use crate::structs::rational::{MILLI_TIME_BASE, NOPTS_VALUE, Rational, rescale};
use crate::structs::stream::{CodecId, CodecParameters, Stream};
use crate::utils::crc::OGG_CRC;
use crate::utils::errors::FormatError;

const CAPTURE: &[u8; 4] = b"OggS";
const HEADER_SIZE: usize = 27;
const CRC_OFFSET: usize = 22;
const FLAG_CONTINUED: u8 = 0x01;
const FLAG_BOS: u8 = 0x02;
const FLAG_EOS: u8 = 0x04;
/// Granule position of a page on which no packet ends.
const NO_GRANULE: i64 = -1;
const MAX_PAGE_SIZE: usize = HEADER_SIZE + 255 + 255 * 255;

const SYNC_WINDOW: usize = 64 * 1024;
const MAX_SYNC_SIZE: u64 = 1024 * 1024;
/// Bytes read at open while looking for the header packets.
const HEADER_SCAN: u64 = 1024 * 1024;
/// Tail scanned for the last granule position, three maximum size pages.
const DURATION_SCAN: u64 = 3 * 65_024;

/// Result of reading at a page boundary.
#[derive(Debug)]
pub enum PageRead {
    Page(OggPage),
    /// A capture pattern at this position led to a page failing its CRC. The
    /// reader has moved one byte past it.
    Corrupt(u64),
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OggPage {
    pub pos: u64,
    pub flags: u8,
    pub granule: i64,
    pub serial: u32,
    pub sequence: u32,
    pub lacing: Vec<u8>,
    pub body: Vec<u8>,
}

impl OggPage {
    pub fn continued(&self) -> bool {
        self.flags & FLAG_CONTINUED != 0
    }

    pub fn bos(&self) -> bool {
        self.flags & FLAG_BOS != 0
    }

    pub fn eos(&self) -> bool {
        self.flags & FLAG_EOS != 0
    }

    pub fn size(&self) -> u64 {
        (HEADER_SIZE + self.lacing.len() + self.body.len()) as u64
    }

    /// Packet pieces in page order with whether each ends on this page. Only
    /// the last piece can be unfinished.
    pub fn pieces(&self) -> Vec<(&[u8], bool)> {
        let mut pieces = Vec::new();
        let (mut start, mut len) = (0, 0);
        for &lace in &self.lacing {
            len += lace as usize;
            if lace < 255 {
                pieces.push((&self.body[start..start + len], true));
                start += len;
                len = 0;
            }
        }
        if len > 0 {
            pieces.push((&self.body[start..start + len], false));
        }
        pieces
    }

    /// Reads the next page, scanning forward to a capture pattern first.
    pub fn read(io: &mut IoReader) -> Result<PageRead, FormatError> {
        if !seek_capture(io)? {
            return Ok(PageRead::End);
        }
        let pos = io.pos();
        let head = io.peek(HEADER_SIZE)?;
        if head.len() < HEADER_SIZE {
            return Ok(PageRead::End);
        }
        let segments = head[26] as usize;
        let header = io.peek(HEADER_SIZE + segments)?;
        let body_len: usize = header.get(HEADER_SIZE..).map_or(0, |l| l.iter().map(|&v| v as usize).sum());
        let total = HEADER_SIZE + segments + body_len;
        let mut raw = io.peek(total)?;
        if head[4] != 0 || raw.len() < total {
            io.skip(1)?;
            return Ok(PageRead::Corrupt(pos));
        }

        let stored = u32::from_le_bytes([
            raw[CRC_OFFSET],
            raw[CRC_OFFSET + 1],
            raw[CRC_OFFSET + 2],
            raw[CRC_OFFSET + 3],
        ]);
        raw[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
        if OGG_CRC.checksum(&raw) != stored {
            io.skip(1)?;
            return Ok(PageRead::Corrupt(pos));
        }
        io.skip(total as u64)?;

        let field = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let (serial, sequence) = (field(14), field(18));
        let mut granule = [0u8; 8];
        granule.copy_from_slice(&raw[6..14]);
        let body = raw.split_off(HEADER_SIZE + segments);
        Ok(PageRead::Page(OggPage {
            pos,
            flags: raw[5],
            granule: i64::from_le_bytes(granule),
            serial,
            sequence,
            lacing: raw.split_off(HEADER_SIZE),
            body,
        }))
    }
}

/// Moves to the next capture pattern. Returns `false` when the input ends
/// first.
fn seek_capture(io: &mut IoReader) -> Result<bool, FormatError> {
    let start = io.pos();
    while io.pos() - start < MAX_SYNC_SIZE {
        let window = io.peek(SYNC_WINDOW)?;
        if let Some(skip) = window.windows(CAPTURE.len()).position(|w| w == CAPTURE) {
            io.skip(skip as u64)?;
            return Ok(true);
        }
        if window.len() < SYNC_WINDOW {
            return Ok(false);
        }
        io.skip((window.len() - CAPTURE.len() + 1) as u64)?;
    }
    Err(FormatError::invalid(format!("ogg: no page within {MAX_SYNC_SIZE} bytes of {start}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mapping {
    Opus,
    Vorbis,
    Flac,
}

impl Mapping {
    fn packet_duration(self, packet: &[u8]) -> Option<i64> {
        match self {
            Mapping::Opus => opus::packet_samples(packet).map(i64::from),
            Mapping::Flac => FrameHeader::parse(packet).ok().map(|h| h.block_size as i64),
            Mapping::Vorbis => None,
        }
    }

    fn is_header(self, packet: &[u8], headers_left: usize) -> bool {
        match self {
            Mapping::Opus => headers_left > 0,
            Mapping::Vorbis => headers_left > 0 && packet[0] & 1 == 1,
            Mapping::Flac => packet[0] != 0xFF,
        }
    }
}

struct Identification {
    mapping: Mapping,
    codecpar: CodecParameters,
    /// Header packets following the identification packet.
    headers: usize,
}

/// Recognizes the identification packet opening a logical stream.
fn identify(packet: &[u8]) -> Result<Option<Identification>, FormatError> {
    if packet.starts_with(b"OpusHead") {
        if packet.len() < 19 {
            return Err(FormatError::invalid("ogg: short OpusHead"));
        }
        let mut codecpar = CodecParameters::audio(CodecId::Opus, opus::SAMPLE_RATE, packet[9] as u32);
        codecpar.extradata = packet.to_vec();
        return Ok(Some(Identification { mapping: Mapping::Opus, codecpar, headers: 1 }));
    }

    if packet.starts_with(b"\x01vorbis") {
        if packet.len() < 30 {
            return Err(FormatError::invalid("ogg: short Vorbis identification header"));
        }
        let le32 = |at: usize| u32::from_le_bytes([packet[at], packet[at + 1], packet[at + 2], packet[at + 3]]);
        let rate = le32(12);
        if rate == 0 {
            return Err(FormatError::invalid("ogg: Vorbis stream with a zero sample rate"));
        }
        let mut codecpar = CodecParameters::audio(CodecId::Vorbis, rate, packet[11] as u32);
        codecpar.bit_rate = (le32(20) as i32).max(0) as i64;
        return Ok(Some(Identification { mapping: Mapping::Vorbis, codecpar, headers: 2 }));
    }

    if packet.starts_with(b"\x7FFLAC") {
        // mapping version (2), header packet count (2), "fLaC", block header (4)
        let info_start = 9 + 4 + 4;
        if packet.len() < info_start + STREAMINFO_SIZE || &packet[9..13] != b"fLaC" {
            return Err(FormatError::invalid("ogg: malformed FLAC mapping header"));
        }
        let streaminfo = &packet[info_start..info_start + STREAMINFO_SIZE];
        let info = StreamInfo::parse(streaminfo)?;
        let mut codecpar = CodecParameters::audio(CodecId::Flac, info.sample_rate, info.channels as u32);
        codecpar.bits_per_raw_sample = info.bits_per_sample as u32;
        codecpar.extradata = streaminfo.to_vec();
        if info.min_block_size == info.max_block_size {
            codecpar.frame_size = info.max_block_size as u32;
        }
        let headers = u16::from_be_bytes([packet[7], packet[8]]) as usize;
        return Ok(Some(Identification { mapping: Mapping::Flac, codecpar, headers }));
    }

    Ok(None)
}

#[derive(Debug)]
struct LogicalStream {
    /// Stream index and mapping, `None` for codecs that are not demuxed.
    mapped: Option<(usize, Mapping)>,
    headers_left: usize,
    /// Vorbis header packets collected for the extradata.
    headers: Vec<Vec<u8>>,
    partial: Option<Vec<u8>>,
    sequence: Option<u32>,
    /// Granule of the last page of this stream, `NOPTS_VALUE` after a seek.
    granule: i64,
    /// Granule before the first data page.
    start_granule: i64,
}

impl LogicalStream {
    fn header_packet(
        &mut self,
        ctx: &mut InputContext,
        index: usize,
        mapping: Mapping,
        packet: &[u8],
    ) -> Result<(), FormatError> {
        self.headers_left = self.headers_left.saturating_sub(1);
        let comment = match mapping {
            Mapping::Opus => packet.strip_prefix(b"OpusTags"),
            Mapping::Vorbis => {
                self.headers.push(packet.to_vec());
                if self.headers.len() == 3 {
                    let mut extradata = Vec::new();
                    for header in &self.headers {
                        extradata.extend_from_slice(&(header.len() as u16).to_be_bytes());
                        extradata.extend_from_slice(header);
                    }
                    ctx.streams[index].codecpar.extradata = extradata;
                }
                packet.strip_prefix(b"\x03vorbis")
            }
            Mapping::Flac => (packet[0] & 0x7F == METADATA_VORBIS_COMMENT).then(|| packet.get(4..)).flatten(),
        };
        let Some(comment) = comment else {
            return Ok(());
        };
        match parse_vorbis_comment(comment) {
            Ok((vendor, comments)) => {
                ctx.streams[index].metadata.insert("encoder".to_string(), vendor);
                ctx.metadata.extend(comments);
            }
            Err(e) => log_or_err!(ctx, Level::Warn, FormatError::invalid(format!("ogg: bad comment header: {e}"))),
        }
        Ok(())
    }

    /// `(pts, duration)` of the packets ending on a page with `granule`.
    fn timestamps(&self, mapping: Mapping, granule: i64, packets: &[Vec<u8>]) -> Vec<(i64, i64)> {
        let unknown = vec![(NOPTS_VALUE, 0); packets.len()];
        if granule == NO_GRANULE {
            return unknown;
        }
        let durations: Option<Vec<i64>> = packets.iter().map(|p| mapping.packet_duration(p)).collect();
        if let Some(durations) = durations {
            let mut pts = granule - durations.iter().sum::<i64>();
            return durations
                .into_iter()
                .map(|duration| {
                    let start = pts;
                    pts += duration;
                    (start, duration)
                })
                .collect();
        }
        if self.granule == NOPTS_VALUE || self.granule > granule {
            return unknown;
        }
        let span = granule - self.granule;
        let n = packets.len() as i64;
        (0..n)
            .map(|i| (self.granule + span * i / n, span * (i + 1) / n - span * i / n))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct IOggFormat {
    streams: BTreeMap<u32, LogicalStream>,
    /// First page carrying data packets.
    data_start: Option<u64>,
    queue: VecDeque<Packet>,
}

impl IOggFormat {
    fn next_page(&mut self, ctx: &mut InputContext) -> Result<Option<OggPage>, FormatError> {
        loop {
            let start = ctx.io.pos();
            match OggPage::read(&mut ctx.io)? {
                PageRead::End => return Ok(None),
                PageRead::Corrupt(pos) if pos == start => {
                    for stream in self.streams.values_mut() {
                        stream.partial = None;
                    }
                    log_or_err!(ctx, Level::Warn, FormatError::invalid(format!("ogg: page at {pos} fails its CRC")));
                }
                PageRead::Corrupt(_) => {}
                PageRead::Page(page) => {
                    if page.pos > start {
                        log::debug!("ogg: skipped {} bytes to resync", page.pos - start);
                    }
                    return Ok(Some(page));
                }
            }
        }
    }

    fn open_stream(&mut self, ctx: &mut InputContext, page: &OggPage) -> Result<(), FormatError> {
        let pieces = page.pieces();
        let id: &[u8] = match pieces.first() {
            Some(&(data, true)) => data,
            _ => &[],
        };
        let identified = match identify(id) {
            Ok(identified) => identified,
            Err(e) => {
                log_or_err!(ctx, Level::Warn, e);
                None
            }
        };

        let mut logical = LogicalStream {
            mapped: None,
            headers_left: 0,
            headers: Vec::new(),
            partial: None,
            sequence: Some(page.sequence),
            granule: page.granule.max(0),
            start_granule: 0,
        };
        match identified {
            Some(ident) => {
                let mut stream = Stream::new(0, Rational::new(1, ident.codecpar.sample_rate as i32));
                stream.id = page.serial;
                stream.codecpar = ident.codecpar;
                stream.start_time = 0;
                log::debug!(
                    "ogg: logical stream {:08x}: {}, {} Hz, {} channels",
                    page.serial,
                    stream.codecpar.codec_id,
                    stream.codecpar.sample_rate,
                    stream.codecpar.channels
                );
                let index = ctx.add_stream(stream);
                logical.mapped = Some((index, ident.mapping));
                logical.headers_left = ident.headers;
                if ident.mapping == Mapping::Vorbis {
                    logical.headers.push(id.to_vec());
                }
            }
            None => log::info!("ogg: skipping logical stream {:08x} of an unsupported codec", page.serial),
        }
        self.streams.insert(page.serial, logical);
        Ok(())
    }

    fn handle_page(&mut self, ctx: &mut InputContext, page: OggPage) -> Result<(), FormatError> {
        if page.bos() && !self.streams.contains_key(&page.serial) {
            return self.open_stream(ctx, &page);
        }
        let Some(stream) = self.streams.get_mut(&page.serial) else {
            log::trace!("ogg: page of unknown logical stream {:08x}", page.serial);
            return Ok(());
        };
        let Some((index, mapping)) = stream.mapped else {
            return Ok(());
        };
        if stream.sequence.is_some_and(|s| s.wrapping_add(1) != page.sequence) && stream.partial.take().is_some() {
            log::debug!("ogg: page missing before {}, unfinished packet dropped", page.sequence);
        }
        stream.sequence = Some(page.sequence);

        let mut complete = Vec::new();
        for (i, (data, done)) in page.pieces().into_iter().enumerate() {
            let packet = if i == 0 && page.continued() {
                match stream.partial.take() {
                    Some(mut head) => {
                        head.extend_from_slice(data);
                        head
                    }
                    None => {
                        log::debug!("ogg: continuation without its start at {}", page.pos);
                        continue;
                    }
                }
            } else {
                if let Some(lost) = stream.partial.take() {
                    log::debug!("ogg: unfinished packet of {} bytes dropped", lost.len());
                }
                data.to_vec()
            };
            if done {
                complete.push(packet);
            } else {
                stream.partial = Some(packet);
            }
        }

        let mut data = Vec::new();
        for packet in complete.into_iter().filter(|p| !p.is_empty()) {
            if mapping.is_header(&packet, stream.headers_left) {
                stream.header_packet(ctx, index, mapping, &packet)?;
            } else {
                stream.headers_left = 0;
                data.push(packet);
            }
        }

        if !data.is_empty() {
            if self.data_start.is_none() {
                self.data_start = Some(page.pos);
                stream.start_granule = stream.granule;
            }
            let timestamps = stream.timestamps(mapping, page.granule, &data);
            for (payload, (pts, duration)) in data.into_iter().zip(timestamps) {
                let mut packet = Packet::from_vec(payload);
                packet.stream_index = index;
                packet.pts = pts;
                packet.dts = pts;
                packet.duration = duration;
                packet.pos = page.pos as i64;
                packet.flags |= PacketFlags::KEY;
                self.queue.push_back(packet);
            }
        }
        if page.granule != NO_GRANULE {
            stream.granule = page.granule;
        }
        if page.eos() {
            log::debug!("ogg: end of logical stream {:08x}", page.serial);
        }
        Ok(())
    }

    /// Last granule position of each logical stream, taken from the tail.
    fn scan_durations(&self, ctx: &mut InputContext) -> Result<(), FormatError> {
        let resume = ctx.io.pos();
        ctx.io.seek(ctx.io.size().saturating_sub(DURATION_SCAN).max(resume))?;
        let mut last = HashMap::new();
        loop {
            match OggPage::read(&mut ctx.io)? {
                PageRead::End => break,
                PageRead::Corrupt(_) => {}
                PageRead::Page(page) if page.granule != NO_GRANULE => {
                    last.insert(page.serial, page.granule);
                }
                PageRead::Page(_) => {}
            }
        }
        ctx.io.seek(resume)?;

        for (serial, granule) in last {
            if let Some((index, _)) = self.streams.get(&serial).and_then(|s| s.mapped) {
                let stream = &mut ctx.streams[index];
                stream.duration = granule;
                ctx.duration = ctx.duration.max(rescale(granule, stream.time_base, MILLI_TIME_BASE));
            }
        }
        Ok(())
    }

    /// End position and granule of the next page of `serial` with a granule,
    /// if it starts before `limit`.
    fn next_granule(io: &mut IoReader, serial: u32, limit: u64) -> Result<Option<(u64, i64)>, FormatError> {
        loop {
            match OggPage::read(io)? {
                PageRead::End => return Ok(None),
                PageRead::Corrupt(_) => {}
                PageRead::Page(page) => {
                    if page.pos >= limit {
                        return Ok(None);
                    }
                    if page.serial == serial && page.granule != NO_GRANULE {
                        return Ok(Some((page.pos + page.size(), page.granule)));
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        self.queue.clear();
        for stream in self.streams.values_mut() {
            stream.partial = None;
            stream.sequence = None;
            stream.granule = NOPTS_VALUE;
        }
    }
}

impl IFormat for IOggFormat {
    fn name(&self) -> &'static str {
        "ogg"
    }

    fn probe(buf: &[u8]) -> u8 {
        if buf.len() < 5 || &buf[..4] != CAPTURE || buf[4] != 0 {
            return 0;
        }
        if buf.len() >= HEADER_SIZE && buf[5] & FLAG_BOS != 0 {
            PROBE_SCORE_MAX
        } else {
            PROBE_SCORE_PARTIAL
        }
    }

    fn read_header(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        let mut past_bos = false;
        while let Some(page) = self.next_page(ctx)? {
            past_bos |= !page.bos();
            self.handle_page(ctx, page)?;
            let pending = self.streams.values().any(|s| s.mapped.is_some() && s.headers_left > 0);
            if past_bos && !pending {
                break;
            }
            if ctx.io.pos() > HEADER_SCAN {
                log_or_err!(
                    ctx,
                    Level::Warn,
                    FormatError::invalid(format!("ogg: header packets incomplete after {HEADER_SCAN} bytes"))
                );
                break;
            }
        }
        if ctx.streams.is_empty() {
            return Err(FormatError::invalid("ogg: no supported logical stream"));
        }
        if ctx.io.size() > 0 {
            self.scan_durations(ctx)?;
        }
        Ok(())
    }

    fn read_packet(&mut self, ctx: &mut InputContext) -> Result<Packet, FormatError> {
        loop {
            if let Some(packet) = self.queue.pop_front() {
                return Ok(packet);
            }
            let Some(page) = self.next_page(ctx)? else {
                return Err(FormatError::Eof);
            };
            self.handle_page(ctx, page)?;
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
        let data_start = self.data_start.unwrap_or(ctx.io.pos());
        self.reset();

        if flags.contains(SeekFlags::BYTE) {
            let mut target = (timestamp.max(0) as u64).max(data_start);
            if ctx.io.size() > 0 {
                target = target.min(ctx.io.size());
            }
            ctx.io.seek(target)?;
            return Ok(());
        }

        let serial = self
            .streams
            .iter()
            .find(|(_, s)| s.mapped.is_some_and(|(index, _)| index == stream_index))
            .map(|(&serial, _)| serial)
            .ok_or_else(|| FormatError::params(format!("ogg: stream {stream_index} is not demuxed")))?;
        let target = timestamp.max(0);

        let mut best = (data_start, None);
        if ctx.io.size() > 0 {
            let (mut lo, mut hi) = (data_start, ctx.io.size());
            while hi > lo + MAX_PAGE_SIZE as u64 {
                let mid = lo + (hi - lo) / 2;
                ctx.io.seek(mid)?;
                match Self::next_granule(&mut ctx.io, serial, hi)? {
                    Some((end, granule)) if granule <= target => {
                        best = (end, Some(granule));
                        lo = end;
                    }
                    _ => hi = mid,
                }
            }
        }
        ctx.io.seek(best.0)?;
        while let Some((end, granule)) = Self::next_granule(&mut ctx.io, serial, u64::MAX)? {
            if granule > target {
                break;
            }
            best = (end, Some(granule));
        }
        ctx.io.seek(best.0)?;
        log::debug!("ogg: seek to {target} lands at {} (granule {:?})", best.0, best.1);

        for (&s, stream) in self.streams.iter_mut() {
            if s == serial {
                stream.granule = best.1.unwrap_or(stream.start_granule);
            } else if best.1.is_none() {
                stream.granule = stream.start_granule;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codecs::flac::tests::{frame_header, streaminfo};

    /// Page with an explicit lacing table.
    pub(crate) fn raw_page(serial: u32, sequence: u32, flags: u8, granule: i64, lacing: &[u8], body: &[u8]) -> Vec<u8> {
        let mut out = CAPTURE.to_vec();
        out.push(0);
        out.push(flags);
        out.extend_from_slice(&granule.to_le_bytes());
        out.extend_from_slice(&serial.to_le_bytes());
        out.extend_from_slice(&sequence.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.push(lacing.len() as u8);
        out.extend_from_slice(lacing);
        out.extend_from_slice(body);
        let crc = OGG_CRC.checksum(&out);
        out[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Page holding whole packets.
    pub(crate) fn page(serial: u32, sequence: u32, flags: u8, granule: i64, packets: &[&[u8]]) -> Vec<u8> {
        let mut lacing = Vec::new();
        let mut body = Vec::new();
        for packet in packets {
            lacing.extend(std::iter::repeat_n(255, packet.len() / 255));
            lacing.push((packet.len() % 255) as u8);
            body.extend_from_slice(packet);
        }
        raw_page(serial, sequence, flags, granule, &lacing, &body)
    }

    fn comment(magic: &[u8], vendor: &str, comments: &[&str]) -> Vec<u8> {
        let mut out = magic.to_vec();
        out.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
        out.extend_from_slice(vendor.as_bytes());
        out.extend_from_slice(&(comments.len() as u32).to_le_bytes());
        for c in comments {
            out.extend_from_slice(&(c.len() as u32).to_le_bytes());
            out.extend_from_slice(c.as_bytes());
        }
        out
    }

    /// 20 ms CELT frame, 960 samples.
    const OPUS_PACKET: [u8; 4] = [0xF8, 0xFF, 0xFE, 0x01];
    const SERIAL: u32 = 0x1234_5678;

    /// Opus stream with `pages` data pages of three packets each.
    fn opus_file(pages: u32) -> Vec<u8> {
        let mut out = page(SERIAL, 0, FLAG_BOS, 0, &[&opus::opus_head(2, 312)]);
        let tags = comment(b"OpusTags", "test encoder", &["TITLE=Tone", "broken"]);
        out.extend(page(SERIAL, 1, 0, 0, &[&tags]));
        for i in 0..pages {
            let flags = if i + 1 == pages { FLAG_EOS } else { 0 };
            let granule = (i as i64 + 1) * 3 * 960;
            out.extend(page(SERIAL, i + 2, flags, granule, &[&OPUS_PACKET[..]; 3]));
        }
        out
    }

    fn open(data: Vec<u8>) -> anyhow::Result<(IOggFormat, InputContext)> {
        let mut ctx = InputContext::new(IoReader::from_bytes(data));
        let mut format = IOggFormat::default();
        format.read_header(&mut ctx)?;
        Ok((format, ctx))
    }

    fn read_all(format: &mut IOggFormat, ctx: &mut InputContext) -> anyhow::Result<Vec<Packet>> {
        let mut packets = Vec::new();
        loop {
            match format.read_packet(ctx) {
                Ok(packet) => packets.push(packet),
                Err(FormatError::Eof) => return Ok(packets),
                Err(e) => return Err(e.into()),
            }
        }
    }

    #[test]
    fn probe_capture_pattern() {
        assert_eq!(IOggFormat::probe(&opus_file(1)), PROBE_SCORE_MAX);
        assert_eq!(IOggFormat::probe(b"OggS\0"), PROBE_SCORE_PARTIAL);
        assert_eq!(IOggFormat::probe(b"OggS\x01\x02"), 0);
        assert_eq!(IOggFormat::probe(b"RIFF\0\0\0\0WAVE"), 0);
    }

    #[test]
    fn page_pieces() -> anyhow::Result<()> {
        let data = raw_page(1, 0, 0, 10, &[3, 255, 255, 2, 255], &[7; 3 + 512 + 255]);
        let PageRead::Page(page) = OggPage::read(&mut IoReader::from_bytes(data))? else {
            anyhow::bail!("page not read");
        };
        let pieces = page.pieces();
        assert_eq!(pieces.len(), 3);
        assert_eq!((pieces[0].0.len(), pieces[0].1), (3, true));
        assert_eq!((pieces[1].0.len(), pieces[1].1), (512, true));
        assert_eq!((pieces[2].0.len(), pieces[2].1), (255, false));
        Ok(())
    }

    #[test]
    fn opus_stream() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(opus_file(2))?;
        assert_eq!(ctx.streams.len(), 1);
        let stream = &ctx.streams[0];
        assert_eq!(stream.id, SERIAL);
        assert_eq!(stream.codecpar.codec_id, CodecId::Opus);
        assert_eq!(stream.codecpar.sample_rate, 48_000);
        assert_eq!(stream.codecpar.channels, 2);
        assert_eq!(stream.codecpar.extradata, opus::opus_head(2, 312));
        assert_eq!(stream.time_base, Rational::new(1, 48_000));
        assert_eq!(stream.duration, 5760);
        assert_eq!(stream.metadata.get("encoder").map(String::as_str), Some("test encoder"));
        assert_eq!(ctx.metadata.get("title").map(String::as_str), Some("Tone"));
        assert_eq!(ctx.duration, 120);

        let packets = read_all(&mut format, &mut ctx)?;
        assert_eq!(packets.len(), 6);
        let pts: Vec<_> = packets.iter().map(|p| p.pts).collect();
        assert_eq!(pts, [0, 960, 1920, 2880, 3840, 4800]);
        assert!(packets.iter().all(|p| p.duration == 960 && p.is_key() && p.data() == OPUS_PACKET));
        Ok(())
    }

    #[test]
    fn packet_spanning_pages() -> anyhow::Result<()> {
        let big: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        let mut data = page(SERIAL, 0, FLAG_BOS, 0, &[&opus::opus_head(1, 0)]);
        data.extend(page(SERIAL, 1, 0, 0, &[&comment(b"OpusTags", "", &[])]));
        data.extend(raw_page(SERIAL, 2, 0, NO_GRANULE, &[255, 255], &big[..510]));
        data.extend(raw_page(SERIAL, 3, FLAG_CONTINUED, 960, &[90], &big[510..]));

        let (mut format, mut ctx) = open(data)?;
        let packets = read_all(&mut format, &mut ctx)?;
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data(), big.as_slice());
        // TOC byte 0: one 10 ms frame
        assert_eq!((packets[0].pts, packets[0].duration), (480, 480));
        Ok(())
    }

    #[test]
    fn corrupt_page_is_skipped() -> anyhow::Result<()> {
        let mut data = opus_file(3);
        // second data page
        let start = data.len() - 2 * (HEADER_SIZE + 3 + 12);
        data[start + HEADER_SIZE + 5] ^= 0x55;

        let (mut format, mut ctx) = open(data.clone())?;
        let pts: Vec<_> = read_all(&mut format, &mut ctx)?.iter().map(|p| p.pts).collect();
        assert_eq!(pts, [0, 960, 1920, 5760, 6720, 7680]);

        let (mut format, mut ctx) = open(data)?;
        ctx.fail_level = Level::Warn;
        let result = (0..6).try_for_each(|_| format.read_packet(&mut ctx).map(drop));
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn resync_after_garbage() -> anyhow::Result<()> {
        let mut data = opus_file(1);
        let mut tail = page(SERIAL, 3, 0, 5760, &[&OPUS_PACKET[..]; 3]);
        data.extend_from_slice(b"OggS garbage between pages");
        data.append(&mut tail);

        let (mut format, mut ctx) = open(data)?;
        let packets = read_all(&mut format, &mut ctx)?;
        assert_eq!(packets.len(), 6);
        assert_eq!(packets[3].pts, 2880);
        Ok(())
    }

    #[test]
    fn vorbis_headers_and_interpolation() -> anyhow::Result<()> {
        let mut id = b"\x01vorbis".to_vec();
        id.extend_from_slice(&0u32.to_le_bytes());
        id.push(2);
        id.extend_from_slice(&44_100u32.to_le_bytes());
        id.extend_from_slice(&0i32.to_le_bytes());
        id.extend_from_slice(&128_000i32.to_le_bytes());
        id.extend_from_slice(&0i32.to_le_bytes());
        id.extend_from_slice(&[0xB8, 0x01]);
        let comments = comment(b"\x03vorbis", "Xiph", &["ARTIST=Someone"]);
        let setup = b"\x05vorbis setup".to_vec();

        let mut data = page(7, 0, FLAG_BOS, 0, &[&id]);
        data.extend(page(7, 1, 0, 0, &[&comments, &setup]));
        data.extend(page(7, 2, FLAG_EOS, 4096, &[&[0x00, 1], &[0x00, 2], &[0x00, 3], &[0x00, 4]]));

        let (mut format, mut ctx) = open(data)?;
        let codecpar = &ctx.streams[0].codecpar;
        assert_eq!(codecpar.codec_id, CodecId::Vorbis);
        assert_eq!(codecpar.sample_rate, 44_100);
        assert_eq!(codecpar.bit_rate, 128_000);
        let mut extradata = Vec::new();
        for header in [&id, &comments, &setup] {
            extradata.extend_from_slice(&(header.len() as u16).to_be_bytes());
            extradata.extend_from_slice(header);
        }
        assert_eq!(codecpar.extradata, extradata);
        assert_eq!(ctx.metadata.get("artist").map(String::as_str), Some("Someone"));

        let packets = read_all(&mut format, &mut ctx)?;
        let timing: Vec<_> = packets.iter().map(|p| (p.pts, p.duration)).collect();
        assert_eq!(timing, [(0, 1024), (1024, 1024), (2048, 1024), (3072, 1024)]);
        Ok(())
    }

    #[test]
    fn flac_mapping() -> anyhow::Result<()> {
        let mut head = b"\x7FFLAC\x01\x00\x00\x01fLaC".to_vec();
        head.extend_from_slice(&[0x00, 0, 0, 34]);
        head.extend(streaminfo(8192));
        let mut vc = vec![0x84, 0, 0, 0];
        vc.extend(comment(b"", "flac", &[]));
        let frames: Vec<Vec<u8>> = (0..2u8)
            .map(|n| {
                let mut frame = frame_header(n);
                frame.extend_from_slice(&[0; 8]);
                frame
            })
            .collect();

        let mut data = page(9, 0, FLAG_BOS, 0, &[&head]);
        data.extend(page(9, 1, 0, 0, &[&vc]));
        data.extend(page(9, 2, FLAG_EOS, 8192, &[&frames[0], &frames[1]]));

        let (mut format, mut ctx) = open(data)?;
        let stream = &ctx.streams[0];
        assert_eq!(stream.codecpar.codec_id, CodecId::Flac);
        assert_eq!(stream.codecpar.sample_rate, 44_100);
        assert_eq!(stream.codecpar.extradata, streaminfo(8192));
        assert_eq!(stream.metadata.get("encoder").map(String::as_str), Some("flac"));

        let packets = read_all(&mut format, &mut ctx)?;
        let timing: Vec<_> = packets.iter().map(|p| (p.pts, p.duration)).collect();
        assert_eq!(timing, [(0, 4096), (4096, 4096)]);
        Ok(())
    }

    #[test]
    fn unsupported_streams_are_skipped() -> anyhow::Result<()> {
        let mut data = page(1, 0, FLAG_BOS, 0, &[b"\x80theora\x03\x02\x01"]);
        data.extend(opus_file(1));
        data.extend(page(1, 1, 0, 0, &[b"\x81theora"]));

        let (mut format, mut ctx) = open(data)?;
        assert_eq!(ctx.streams.len(), 1);
        let packets = read_all(&mut format, &mut ctx)?;
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.stream_index == 0));

        assert!(open(page(1, 0, FLAG_BOS, 0, &[b"\x80theora"])).is_err());
        Ok(())
    }

    #[test]
    fn seek_by_granule() -> anyhow::Result<()> {
        let (mut format, mut ctx) = open(opus_file(40))?;
        read_all(&mut format, &mut ctx)?;

        format.seek(&mut ctx, 0, 30 * 960 + 100, SeekFlags::empty())?;
        let packet = format.read_packet(&mut ctx)?;
        assert_eq!(packet.pts, 30 * 960);
        assert_eq!(format.read_packet(&mut ctx)?.pts, 31 * 960);

        format.seek(&mut ctx, 0, 0, SeekFlags::empty())?;
        assert_eq!(format.read_packet(&mut ctx)?.pts, 0);

        format.seek(&mut ctx, 0, i64::MAX, SeekFlags::empty())?;
        assert!(matches!(format.read_packet(&mut ctx), Err(FormatError::Eof)));
        Ok(())
    }
}
