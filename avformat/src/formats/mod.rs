//! Container format plugins.
//!
//! Demuxers implement [`IFormat`] and muxers [`OFormat`]. Each plugin keeps
//! its own parsing state; the shared, format-independent state (byte stream,
//! stream table, metadata) lives in [`InputContext`] / [`OutputContext`] and is
//! passed in by `&mut` on every call.
//!
//! | Name     | Demux | Mux | Extensions            |
//! |----------|-------|-----|-----------------------|
//! | `wav`    | yes   | yes | wav, rf64, bw64       |
//! | `mov`    | yes   | yes | mp4, m4a, m4v, mov    |
//! | `mpegts` | yes   | yes | ts, m2ts, mts         |
//! | `aac`    | yes   | yes | aac, adts             |
//! | `flac`   | yes   | no  | flac                  |
//! | `flv`    | yes   | yes | flv                   |
//! | `mpegps` | yes   | no  | ps, mpg, vob          |
//! | `ogg`    | yes   | no  | ogg, oga, opus        |
//! | `avi`    | yes   | no  | avi                   |

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::io::{IoReader, IoWriter};
use crate::process::mux::MuxOptions;
use crate::structs::packet::Packet;
use crate::structs::rational::NOPTS_VALUE;
use crate::structs::stream::Stream;
use crate::utils::buffer_pool::PacketPool;
use crate::utils::errors::{FormatError, IoError};

pub mod aac;
pub mod avi;
pub mod flac;
pub mod flv;
pub mod isobmff;
pub mod mpegps;
pub mod mpegts;
pub mod oaac;
pub mod ogg;
pub mod wav;

pub use aac::IAacFormat;
pub use avi::IAviFormat;
pub use flac::IFlacFormat;
pub use flv::{IFlvFormat, OFlvFormat};
pub use isobmff::demux::IMovFormat;
pub use isobmff::mux::OMovFormat;
pub use mpegps::IMpegpsFormat;
pub use mpegts::{IMpegtsFormat, OMpegtsFormat};
pub use oaac::OAacFormat;
pub use ogg::IOggFormat;
pub use wav::{IWavFormat, OWavFormat};

/// Probe score of a certain match.
pub const PROBE_SCORE_MAX: u8 = 100;
/// Probe score when only part of the signature matched.
pub const PROBE_SCORE_PARTIAL: u8 = 50;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SeekFlags: u32 {
        /// Land on the nearest keyframe at or before the target.
        const BACKWARD = 0x1;
        /// Land on the nearest keyframe at or after the target.
        const FORWARD = 0x2;
        /// Any frame, not only keyframes.
        const ANY = 0x4;
        /// Timestamp is a byte offset.
        const BYTE = 0x8;
    }
}

/// Demuxer side state shared with the format plugin.
#[derive(Debug)]
pub struct InputContext {
    pub io: IoReader,
    pub streams: Vec<Stream>,
    pub metadata: BTreeMap<String, String>,
    /// Whole-file duration in milliseconds, [`NOPTS_VALUE`] when unknown.
    pub duration: i64,
    /// Recoverable errors at or above this level abort instead of logging.
    pub fail_level: log::Level,
    /// Source of recycled payload buffers.
    pub pool: Option<PacketPool>,
}

impl InputContext {
    pub fn new(io: IoReader) -> Self {
        Self {
            io,
            streams: Vec::new(),
            metadata: BTreeMap::new(),
            duration: NOPTS_VALUE,
            fail_level: log::Level::Error,
            pool: None,
        }
    }

    /// Reads a `len` byte payload into a packet, in a pooled buffer when a
    /// pool is attached.
    pub fn read_packet_data(&mut self, len: usize) -> Result<Packet, IoError> {
        let mut data = match &self.pool {
            Some(pool) => pool.take_buffer(),
            None => Vec::new(),
        };
        self.io.read_bytes_into(&mut data, len)?;
        Ok(Packet::from_vec(data))
    }

    /// Appends a stream and returns its index.
    pub fn add_stream(&mut self, mut stream: Stream) -> usize {
        stream.index = self.streams.len();
        self.streams.push(stream);
        self.streams.len() - 1
    }

    pub fn stream(&self, index: usize) -> Result<&Stream, FormatError> {
        self.streams
            .get(index)
            .ok_or_else(|| FormatError::params(format!("no stream {index}")))
    }
}

/// Muxer side state shared with the format plugin.
#[derive(Debug)]
pub struct OutputContext {
    pub io: IoWriter,
    pub streams: Vec<Stream>,
    pub metadata: BTreeMap<String, String>,
    pub options: MuxOptions,
}

impl OutputContext {
    pub fn new(io: IoWriter, options: MuxOptions) -> Self {
        Self {
            io,
            streams: Vec::new(),
            metadata: BTreeMap::new(),
            options,
        }
    }
}

pub trait IFormat {
    fn name(&self) -> &'static str;

    /// Scores how likely `buf`, the start of the input, is this format.
    fn probe(buf: &[u8]) -> u8
    where
        Self: Sized;

    /// Parses headers and fills the stream table.
    fn read_header(&mut self, ctx: &mut InputContext) -> Result<(), FormatError>;

    /// Next packet, [`FormatError::Eof`] at the end of input.
    fn read_packet(&mut self, ctx: &mut InputContext) -> Result<Packet, FormatError>;

    /// Repositions so the next packet of `stream_index` is near `timestamp`,
    /// given in that stream's time base.
    fn seek(
        &mut self,
        ctx: &mut InputContext,
        stream_index: usize,
        timestamp: i64,
        flags: SeekFlags,
    ) -> Result<(), FormatError>;

    /// Default analysis window in milliseconds.
    fn max_analyze_duration_ms(&self) -> Option<u64> {
        None
    }

    fn estimated_packet_count(&self, _ctx: &InputContext) -> Option<u64> {
        None
    }
}

pub trait OFormat {
    fn name(&self) -> &'static str;

    /// Validates the stream table before anything is written.
    fn init(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError>;

    fn write_header(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError>;

    /// Writes one packet with timestamps in its stream's time base.
    fn write_packet(&mut self, ctx: &mut OutputContext, packet: &Packet) -> Result<(), FormatError>;

    fn write_trailer(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError>;

    fn flush(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        Ok(ctx.io.flush()?)
    }
}

#[derive(Debug)]
pub enum InputFormat {
    Wav(IWavFormat),
    Mov(Box<IMovFormat>),
    Mpegts(IMpegtsFormat),
    Aac(IAacFormat),
    Flac(IFlacFormat),
    Flv(IFlvFormat),
    Mpegps(IMpegpsFormat),
    Ogg(IOggFormat),
    Avi(IAviFormat),
}

macro_rules! dispatch_input {
    ($self:expr, $f:ident => $body:expr) => {
        match $self {
            InputFormat::Wav($f) => $body,
            InputFormat::Mov($f) => $body,
            InputFormat::Mpegts($f) => $body,
            InputFormat::Aac($f) => $body,
            InputFormat::Flac($f) => $body,
            InputFormat::Flv($f) => $body,
            InputFormat::Mpegps($f) => $body,
            InputFormat::Ogg($f) => $body,
            InputFormat::Avi($f) => $body,
        }
    };
}

impl InputFormat {
    pub fn by_name(name: &str) -> Option<Self> {
        Some(match name {
            "wav" => Self::Wav(IWavFormat::default()),
            "mov" | "mp4" => Self::Mov(Box::default()),
            "mpegts" | "ts" => Self::Mpegts(IMpegtsFormat::default()),
            "aac" | "adts" => Self::Aac(IAacFormat::default()),
            "flac" => Self::Flac(IFlacFormat::default()),
            "flv" => Self::Flv(IFlvFormat::default()),
            "mpegps" | "ps" | "mpg" | "vob" => Self::Mpegps(IMpegpsFormat::default()),
            "ogg" | "opus" | "oga" => Self::Ogg(IOggFormat::default()),
            "avi" => Self::Avi(IAviFormat::default()),
            _ => return None,
        })
    }

    /// Every demuxer's score for `buf`.
    pub fn probe_scores(buf: &[u8]) -> [(&'static str, u8); 9] {
        [
            ("wav", IWavFormat::probe(buf)),
            ("mov", IMovFormat::probe(buf)),
            ("mpegts", IMpegtsFormat::probe(buf)),
            ("aac", IAacFormat::probe(buf)),
            ("flac", IFlacFormat::probe(buf)),
            ("flv", IFlvFormat::probe(buf)),
            ("mpegps", IMpegpsFormat::probe(buf)),
            ("ogg", IOggFormat::probe(buf)),
            ("avi", IAviFormat::probe(buf)),
        ]
    }
}

/// Picks the demuxer scoring highest on `buf`; ties go to the earlier entry
/// of [`InputFormat::probe_scores`].
pub fn probe_format(buf: &[u8]) -> Option<InputFormat> {
    let mut best: Option<(&str, u8)> = None;
    for (name, score) in InputFormat::probe_scores(buf) {
        log::trace!("probe {name}: {score}");
        if score > 0 && best.is_none_or(|(_, s)| score > s) {
            best = Some((name, score));
        }
    }
    let (name, score) = best?;
    log::debug!("probed format {name} (score {score})");
    InputFormat::by_name(name)
}

impl IFormat for InputFormat {
    fn name(&self) -> &'static str {
        dispatch_input!(self, f => f.name())
    }

    fn probe(buf: &[u8]) -> u8 {
        Self::probe_scores(buf)
            .into_iter()
            .map(|(_, score)| score)
            .max()
            .unwrap_or(0)
    }

    fn read_header(&mut self, ctx: &mut InputContext) -> Result<(), FormatError> {
        dispatch_input!(self, f => f.read_header(ctx))
    }

    fn read_packet(&mut self, ctx: &mut InputContext) -> Result<Packet, FormatError> {
        dispatch_input!(self, f => f.read_packet(ctx))
    }

    fn seek(
        &mut self,
        ctx: &mut InputContext,
        stream_index: usize,
        timestamp: i64,
        flags: SeekFlags,
    ) -> Result<(), FormatError> {
        dispatch_input!(self, f => f.seek(ctx, stream_index, timestamp, flags))
    }

    fn max_analyze_duration_ms(&self) -> Option<u64> {
        dispatch_input!(self, f => f.max_analyze_duration_ms())
    }

    fn estimated_packet_count(&self, ctx: &InputContext) -> Option<u64> {
        dispatch_input!(self, f => f.estimated_packet_count(ctx))
    }
}

#[derive(Debug)]
pub enum OutputFormat {
    Wav(OWavFormat),
    Mov(OMovFormat),
    Aac(OAacFormat),
    Mpegts(OMpegtsFormat),
    Flv(OFlvFormat),
}

macro_rules! dispatch_output {
    ($self:expr, $f:ident => $body:expr) => {
        match $self {
            OutputFormat::Wav($f) => $body,
            OutputFormat::Mov($f) => $body,
            OutputFormat::Aac($f) => $body,
            OutputFormat::Mpegts($f) => $body,
            OutputFormat::Flv($f) => $body,
        }
    };
}

impl OutputFormat {
    pub fn by_name(name: &str) -> Option<Self> {
        Some(match name {
            "wav" => Self::Wav(OWavFormat::default()),
            "mov" | "mp4" | "m4a" => Self::Mov(OMovFormat::default()),
            "aac" | "adts" => Self::Aac(OAacFormat::default()),
            "mpegts" | "ts" => Self::Mpegts(OMpegtsFormat::default()),
            "flv" => Self::Flv(OFlvFormat::default()),
            _ => return None,
        })
    }

    /// Muxer for an output file name's extension.
    pub fn from_extension(path: &str) -> Option<Self> {
        let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "wav" | "rf64" | "bw64" => Self::by_name("wav"),
            "mp4" | "m4a" | "m4v" | "mov" => Self::by_name("mov"),
            "aac" | "adts" => Self::by_name("aac"),
            "ts" | "m2ts" | "mts" => Self::by_name("mpegts"),
            "flv" => Self::by_name("flv"),
            _ => None,
        }
    }
}

impl OFormat for OutputFormat {
    fn name(&self) -> &'static str {
        dispatch_output!(self, f => f.name())
    }

    fn init(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        dispatch_output!(self, f => f.init(ctx))
    }

    fn write_header(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        dispatch_output!(self, f => f.write_header(ctx))
    }

    fn write_packet(&mut self, ctx: &mut OutputContext, packet: &Packet) -> Result<(), FormatError> {
        dispatch_output!(self, f => f.write_packet(ctx, packet))
    }

    fn write_trailer(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        dispatch_output!(self, f => f.write_trailer(ctx))
    }

    fn flush(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        dispatch_output!(self, f => f.flush(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_format_from_extension() {
        let name = |path: &str| OutputFormat::from_extension(path).map(|f| f.name());
        assert_eq!(name("out.TS"), Some("mpegts"));
        assert_eq!(name("a.b/out.m2ts"), Some("mpegts"));
        assert_eq!(name("live.flv"), Some("flv"));
        assert_eq!(name("song.m4a"), Some("mov"));
        assert_eq!(name("noext"), None);
        assert_eq!(OutputFormat::by_name("ts").map(|f| f.name()), Some("mpegts"));
    }
}
