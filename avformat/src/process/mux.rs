//! Muxing front end: stream setup, timestamp checks and format calls.

use crate::formats::{OFormat, OutputContext, OutputFormat};
use crate::io::IoWriter;
use crate::structs::packet::Packet;
use crate::structs::rational::{NOPTS_VALUE, Rational};
use crate::structs::stream::{CodecParameters, Stream};
use crate::utils::errors::FormatError;

#[derive(Debug, Clone, Default)]
pub struct MuxOptions {
    /// MP4: write `moof`/`mdat` fragments instead of one `mdat`.
    pub fragmented: bool,
    /// MP4: place `moov` before `mdat`.
    pub fast_start: bool,
    /// WAV: always write an RF64 header.
    pub force_rf64: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Setup,
    Writing,
    Finished,
}

/// An output being written.
///
/// ```rust,no_run
/// use avformat::formats::OutputFormat;
/// use avformat::io::IoWriter;
/// use avformat::process::mux::{MuxContext, MuxOptions};
/// use avformat::structs::packet::Packet;
/// use avformat::structs::rational::Rational;
/// use avformat::structs::stream::{CodecId, CodecParameters};
///
/// let file = std::fs::File::create("out.wav")?;
/// let format = OutputFormat::by_name("wav").unwrap();
/// let mut mux = MuxContext::new(IoWriter::seekable(file)?, format, MuxOptions::default());
///
/// let mut par = CodecParameters::audio(CodecId::PcmS16Le, 48000, 2);
/// par.bits_per_coded_sample = 16;
/// let stream = mux.add_stream(par, Rational::new(1, 48000))?;
/// mux.write_header()?;
///
/// let mut packet = Packet::from_vec(vec![0; 4096]);
/// packet.stream_index = stream;
/// packet.pts = 0;
/// packet.dts = 0;
/// mux.write_packet(packet, Rational::new(1, 48000))?;
/// mux.write_trailer()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct MuxContext {
    pub ctx: OutputContext,
    format: OutputFormat,
    last_dts: Vec<i64>,
    state: State,
}

impl MuxContext {
    pub fn new(io: IoWriter, format: OutputFormat, options: MuxOptions) -> Self {
        Self {
            ctx: OutputContext::new(io, options),
            format,
            last_dts: Vec::new(),
            state: State::Setup,
        }
    }

    pub fn format_name(&self) -> &'static str {
        self.format.name()
    }

    /// Adds a stream before the header is written and returns its index.
    pub fn add_stream(
        &mut self,
        codecpar: CodecParameters,
        time_base: Rational,
    ) -> Result<usize, FormatError> {
        if self.state != State::Setup {
            return Err(FormatError::params("streams must be added before write_header"));
        }
        let index = self.ctx.streams.len();
        let mut stream = Stream::new(index, time_base);
        stream.codecpar = codecpar;
        self.ctx.streams.push(stream);
        self.last_dts.push(NOPTS_VALUE);
        Ok(index)
    }

    /// Lets the format validate the streams, possibly adjusting their time
    /// bases, and writes the header.
    pub fn write_header(&mut self) -> Result<(), FormatError> {
        if self.state != State::Setup {
            return Err(FormatError::params("header already written"));
        }
        if self.ctx.streams.is_empty() {
            return Err(FormatError::params("no streams to mux"));
        }
        self.format.init(&mut self.ctx)?;
        self.format.write_header(&mut self.ctx)?;
        self.state = State::Writing;
        Ok(())
    }

    /// Time base a stream's packets end up in after `write_header`.
    pub fn stream_time_base(&self, index: usize) -> Option<Rational> {
        self.ctx.streams.get(index).map(|s| s.time_base)
    }

    /// Writes `packet`, whose timestamps are in `time_base`.
    ///
    /// Decode timestamps must not go backwards within a stream and may not
    /// exceed the presentation timestamp.
    pub fn write_packet(&mut self, mut packet: Packet, time_base: Rational) -> Result<(), FormatError> {
        self.write_packet_mut(&mut packet, time_base)
    }

    /// [`write_packet`](Self::write_packet) on a borrowed packet, which is
    /// left rescaled to the stream time base so the caller can recycle it.
    pub fn write_packet_mut(
        &mut self,
        packet: &mut Packet,
        time_base: Rational,
    ) -> Result<(), FormatError> {
        if self.state != State::Writing {
            return Err(FormatError::params("write_packet outside header/trailer"));
        }
        let index = packet.stream_index;
        let stream = self
            .ctx
            .streams
            .get(index)
            .ok_or_else(|| FormatError::params(format!("packet for unknown stream {index}")))?;

        packet.rescale_ts(time_base, stream.time_base);
        if packet.dts == NOPTS_VALUE {
            packet.dts = packet.pts;
        }
        if packet.pts == NOPTS_VALUE {
            packet.pts = packet.dts;
        }

        let last = self.last_dts[index];
        if packet.dts != NOPTS_VALUE {
            if last != NOPTS_VALUE && packet.dts < last {
                return Err(FormatError::params(format!(
                    "stream {index}: dts {} after {last} is not monotonic",
                    packet.dts
                )));
            }
            if packet.pts < packet.dts {
                return Err(FormatError::params(format!(
                    "stream {index}: pts {} < dts {}",
                    packet.pts, packet.dts
                )));
            }
            self.last_dts[index] = packet.dts;
        }

        self.format.write_packet(&mut self.ctx, packet)
    }

    pub fn write_trailer(&mut self) -> Result<(), FormatError> {
        if self.state != State::Writing {
            return Err(FormatError::params("write_trailer without header"));
        }
        self.format.write_trailer(&mut self.ctx)?;
        self.format.flush(&mut self.ctx)?;
        self.state = State::Finished;
        Ok(())
    }

    /// The sink, for in-memory outputs once the trailer is written.
    pub fn into_writer(self) -> IoWriter {
        self.ctx.io
    }
}
