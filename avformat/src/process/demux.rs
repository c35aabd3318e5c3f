//! Demuxing front end: probing, stream analysis and packet delivery.

use std::collections::{BTreeMap, HashMap, VecDeque};

use super::timestamp::{guess_delay_from_pts, guess_dts_from_pts};
use crate::formats::{IFormat, InputContext, InputFormat, SeekFlags, probe_format};
use crate::io::{AbortHandle, IoReader};
use crate::structs::packet::{Packet, PacketFlags, SideData};
use crate::structs::rational::{MILLI_TIME_BASE, NOPTS_VALUE, Rational, rescale};
use crate::structs::stream::{MediaType, Stream};
use crate::utils::buffer_pool::{PacketPool, PooledPacket};
use crate::utils::errors::FormatError;

/// Packets per stream inspected before its timing is estimated.
pub const MIN_ANALYZE_SAMPLES: usize = 16;
/// Analysis window when the format does not suggest one.
pub const MAX_ANALYZE_DURATION_MS: u64 = 15_000;
/// Upper bound for the reorder delay of a video stream.
pub const MAX_VIDEO_DELAY: usize = 16;

/// Upper bound on packets buffered by one read-ahead.
pub const MAX_READ_AHEAD_PACKETS: usize = 100_000;

const PROBE_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct DemuxOptions {
    /// Overrides the format's analysis window.
    pub max_analyze_duration_ms: Option<u64>,
    pub min_analyze_samples: usize,
    /// Skip stream analysis; packets are read straight from the format.
    pub fast_open: bool,
    pub fail_level: log::Level,
    /// Payload buffers are taken from, and packets handed out through, this
    /// pool.
    pub pool: Option<PacketPool>,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            max_analyze_duration_ms: None,
            min_analyze_samples: MIN_ANALYZE_SAMPLES,
            fast_open: false,
            fail_level: log::Level::Error,
            pool: None,
        }
    }
}

/// Decode timestamp recovery for a stream whose packets carry only pts.
///
/// Holds the largest `delay` presentation timestamps seen so far; each new
/// pts is sorted in and the smallest one leaves as the next dts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct DtsContext {
    delay: usize,
    queue: VecDeque<i64>,
}

impl DtsContext {
    fn fill(&mut self, packet: &mut Packet) {
        if packet.dts != NOPTS_VALUE || packet.pts == NOPTS_VALUE {
            return;
        }
        if self.delay == 0 {
            packet.dts = packet.pts;
            return;
        }
        let at = self.queue.partition_point(|&v| v < packet.pts);
        self.queue.insert(at, packet.pts);
        if self.queue.len() > self.delay {
            if let Some(dts) = self.queue.pop_front() {
                packet.dts = dts;
            }
        }
    }
}

/// Gives the buffered packets of `stream_index` that lack a dts one derived
/// from their pts, and returns the context continuing that sequence.
fn assign_dts(buffer: &mut VecDeque<Packet>, stream_index: usize, delay: usize) -> DtsContext {
    let needs_dts = |p: &Packet| {
        p.stream_index == stream_index && p.dts == NOPTS_VALUE && p.pts != NOPTS_VALUE
    };

    let pts: Vec<i64> = buffer.iter().filter(|p| needs_dts(p)).map(|p| p.pts).collect();
    let dts = guess_dts_from_pts(delay, &pts);
    for (packet, dts) in buffer.iter_mut().filter(|p| needs_dts(p)).zip(dts) {
        packet.dts = dts;
    }

    let mut sorted = pts;
    sorted.sort_unstable();
    let tail = sorted.len().saturating_sub(delay);
    DtsContext {
        delay,
        queue: sorted[tail..].iter().copied().collect(),
    }
}

/// Samples gathered for one stream during analysis.
/// Limit of a read-ahead: a span of timestamps or a packet count, whichever
/// runs out first.
#[derive(Debug)]
struct ReadAhead {
    window_ms: i64,
    start_ms: Option<i64>,
    packets: usize,
}

impl ReadAhead {
    fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            start_ms: None,
            packets: 0,
        }
    }

    /// Accounts one packet with timestamp `ts_ms`, returns `true` once the
    /// limit is passed.
    fn exhausted(&mut self, ts_ms: i64) -> bool {
        self.packets += 1;
        if self.packets >= MAX_READ_AHEAD_PACKETS {
            return true;
        }
        if ts_ms == NOPTS_VALUE {
            return false;
        }
        let start = self.start_ms.map_or(ts_ms, |start| start.min(ts_ms));
        self.start_ms = Some(start);
        ts_ms - start > self.window_ms
    }
}

#[derive(Debug, Clone, Default)]
struct StreamProbe {
    pts: Vec<i64>,
    dts: Vec<i64>,
    bytes: u64,
    done: bool,
}

/// Fills in frame rate, frame size, bit rate and start time from decode
/// timestamps in the stream's time base.
fn estimate_timing(stream: &mut Stream, dts: &[i64], pts: &[i64], bytes: u64) {
    let tb = stream.time_base;
    if stream.start_time == NOPTS_VALUE {
        if let Some(&start) = pts.iter().chain(dts).min() {
            stream.start_time = start;
        }
    }
    if dts.len() < 2 || !tb.is_valid() {
        return;
    }

    let (span, count) = dts
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|&d| d > 0)
        .fold((0i64, 0i64), |(sum, n), d| (sum + d, n + 1));
    if count == 0 {
        return;
    }
    let avg = span as f64 / count as f64;
    let par = &mut stream.codecpar;

    match par.media_type {
        MediaType::Video if !par.frame_rate.is_valid() => {
            let fps = tb.den as f64 * count as f64 / (span as f64 * tb.num as f64);
            par.frame_rate = Rational::from_f64(fps, 1_001_000);
        }
        MediaType::Audio if par.frame_size == 0 && par.sample_rate > 0 => {
            par.frame_size = (avg * tb.to_f64() * par.sample_rate as f64).round() as u32;
        }
        _ => {}
    }

    if par.bit_rate == 0 {
        let seconds = (span as f64 + avg) * tb.to_f64();
        if seconds > 0.0 {
            par.bit_rate = (bytes as f64 * 8.0 / seconds) as i64;
        }
    }
}

/// An open input: format plugin plus the analysis and timestamp state
/// layered on top of it.
///
/// ```rust,no_run
/// use avformat::io::IoReader;
/// use avformat::process::demux::{DemuxContext, DemuxOptions};
///
/// let file = std::fs::File::open("input.mp4")?;
/// let mut demux = DemuxContext::open(IoReader::new(file)?, None, DemuxOptions::default())?;
/// for stream in demux.streams() {
///     println!("#{} {} {}", stream.index, stream.media_type(), stream.codecpar.codec_id);
/// }
/// while let Ok(packet) = demux.read_packet() {
///     println!("{} {} {}", packet.stream_index, packet.dts, packet.size());
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct DemuxContext {
    pub ctx: InputContext,
    format: InputFormat,
    options: DemuxOptions,
    abort: AbortHandle,
    packet_buffer: VecDeque<Packet>,
    dts_contexts: HashMap<usize, DtsContext>,
    /// Extradata from empty packets, waiting for the stream's next payload.
    pending_extradata: BTreeMap<usize, Vec<u8>>,
    /// Streams without dts get their context from analysis, not lazily.
    analyzing: bool,
}

impl DemuxContext {
    /// Opens `io` with `format`, or with whichever format probes best on the
    /// first bytes, reads the headers and, unless `fast_open` is set,
    /// analyzes the streams.
    pub fn open(
        mut io: IoReader,
        format: Option<InputFormat>,
        options: DemuxOptions,
    ) -> Result<Self, FormatError> {
        let format = match format {
            Some(format) => format,
            None => {
                let window = io.peek(PROBE_BUF_SIZE)?;
                probe_format(&window)
                    .ok_or_else(|| FormatError::unsupported("input format not recognized"))?
            }
        };

        let abort = io.abort_handle();
        let mut ctx = InputContext::new(io);
        ctx.fail_level = options.fail_level;
        ctx.pool = options.pool.clone();

        let mut demux = Self {
            ctx,
            format,
            options,
            abort,
            packet_buffer: VecDeque::new(),
            dts_contexts: HashMap::new(),
            pending_extradata: BTreeMap::new(),
            analyzing: false,
        };
        demux.format.read_header(&mut demux.ctx)?;
        log::info!(
            "opened {} input with {} streams",
            demux.format.name(),
            demux.ctx.streams.len()
        );

        if !demux.options.fast_open {
            demux.analyze_streams()?;
        }
        Ok(demux)
    }

    pub fn format_name(&self) -> &'static str {
        self.format.name()
    }

    pub fn streams(&self) -> &[Stream] {
        &self.ctx.streams
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn estimated_packet_count(&self) -> Option<u64> {
        self.format.estimated_packet_count(&self.ctx)
    }

    /// Reads one packet from the format, merging extradata-only packets into
    /// the following payload and filling missing dts.
    fn read_format_packet(&mut self) -> Result<Packet, FormatError> {
        loop {
            let mut packet = self.format.read_packet(&mut self.ctx)?;

            if packet.is_empty() {
                if let Some(extradata) = packet.new_extradata() {
                    self.pending_extradata
                        .insert(packet.stream_index, extradata.to_vec());
                }
                if packet.flags.contains(PacketFlags::END) {
                    log::trace!("stream {} signalled end", packet.stream_index);
                }
                continue;
            }

            if let Some(extradata) = self.pending_extradata.remove(&packet.stream_index) {
                if packet.new_extradata().is_none() {
                    packet.add_side_data(SideData::NewExtradata(extradata));
                }
            }

            if packet.dts == NOPTS_VALUE {
                if let Some(context) = self.dts_contexts.get_mut(&packet.stream_index) {
                    context.fill(&mut packet);
                } else if !self.analyzing {
                    let delay = self
                        .ctx
                        .streams
                        .get(packet.stream_index)
                        .map_or(0, |s| s.codecpar.video_delay as usize);
                    let mut context = DtsContext {
                        delay,
                        ..Default::default()
                    };
                    context.fill(&mut packet);
                    self.dts_contexts.insert(packet.stream_index, context);
                }
            }
            return Ok(packet);
        }
    }

    /// Reads ahead until every stream has enough samples or the analysis
    /// window is exhausted, then estimates reorder delay, decode timestamps,
    /// frame rate and bit rate. The packets read stay buffered for
    /// [`read_packet`](Self::read_packet).
    pub fn analyze_streams(&mut self) -> Result<(), FormatError> {
        let max_duration = self.analyze_window_ms();
        let min_samples = self.options.min_analyze_samples.max(1);

        self.analyzing = true;
        let result = self.analyze_packets(max_duration, min_samples);
        self.analyzing = false;
        result?;

        if self.ctx.duration == NOPTS_VALUE {
            self.ctx.duration = self
                .ctx
                .streams
                .iter()
                .filter(|s| s.duration != NOPTS_VALUE)
                .map(|s| rescale(s.duration, s.time_base, MILLI_TIME_BASE))
                .max()
                .unwrap_or(NOPTS_VALUE);
        }
        log::debug!("analysis buffered {} packets", self.packet_buffer.len());
        Ok(())
    }

    fn analyze_window_ms(&self) -> i64 {
        self.options
            .max_analyze_duration_ms
            .or_else(|| self.format.max_analyze_duration_ms())
            .unwrap_or(MAX_ANALYZE_DURATION_MS) as i64
    }

    /// Timestamp of `packet` in milliseconds, dts preferred.
    fn packet_ms(&self, packet: &Packet) -> i64 {
        let ts = if packet.dts != NOPTS_VALUE { packet.dts } else { packet.pts };
        match self.ctx.streams.get(packet.stream_index) {
            Some(stream) => rescale(ts, stream.time_base, MILLI_TIME_BASE),
            None => NOPTS_VALUE,
        }
    }

    fn analyze_packets(&mut self, max_duration: i64, min_samples: usize) -> Result<(), FormatError> {
        let mut probes = vec![StreamProbe::default(); self.ctx.streams.len()];
        let mut window = ReadAhead::new(max_duration);

        loop {
            let packet = match self.read_format_packet() {
                Ok(packet) => packet,
                Err(FormatError::Eof) => break,
                Err(e) => return Err(e),
            };
            let index = packet.stream_index;
            if index >= probes.len() {
                probes.resize(self.ctx.streams.len().max(index + 1), StreamProbe::default());
            }

            self.ctx.stream(index)?;
            let ts_ms = self.packet_ms(&packet);

            let probe = &mut probes[index];
            if !probe.done {
                if packet.pts != NOPTS_VALUE {
                    probe.pts.push(packet.pts);
                }
                if packet.dts != NOPTS_VALUE {
                    probe.dts.push(packet.dts);
                }
                probe.bytes += packet.size() as u64;
            }
            self.packet_buffer.push_back(packet);

            if !probe.done && probe.pts.len().max(probe.dts.len()) >= min_samples {
                probe.done = true;
                let probe = probe.clone();
                self.calculate(index, &probe);
            }

            if window.exhausted(ts_ms) {
                log::debug!("analysis window of {max_duration} ms reached");
                break;
            }
            if probes.iter().all(|p| p.done) {
                break;
            }
        }

        for (index, probe) in probes.iter_mut().enumerate() {
            if !probe.done && !(probe.pts.is_empty() && probe.dts.is_empty()) {
                probe.done = true;
                let probe = probe.clone();
                self.calculate(index, &probe);
            }
        }
        Ok(())
    }

    fn calculate(&mut self, index: usize, probe: &StreamProbe) {
        let Some(stream) = self.ctx.streams.get_mut(index) else {
            return;
        };

        let mut delay = 0;
        if stream.media_type() == MediaType::Video {
            delay = guess_delay_from_pts(&probe.pts)
                .max(stream.codecpar.video_delay as usize)
                .min(MAX_VIDEO_DELAY);
            stream.codecpar.video_delay = delay as u32;
        }

        let dts = if probe.dts.is_empty() {
            let context = assign_dts(&mut self.packet_buffer, index, delay);
            self.dts_contexts.insert(index, context);
            self.packet_buffer
                .iter()
                .filter(|p| p.stream_index == index && p.dts != NOPTS_VALUE)
                .map(|p| p.dts)
                .collect()
        } else {
            probe.dts.clone()
        };

        estimate_timing(stream, &dts, &probe.pts, probe.bytes);
        log::debug!(
            "stream {index}: delay {delay}, frame rate {}, bit rate {}",
            stream.codecpar.frame_rate,
            stream.codecpar.bit_rate
        );
    }

    /// Next packet in decode order, [`FormatError::Eof`] at the end.
    pub fn read_packet(&mut self) -> Result<Packet, FormatError> {
        if let Some(packet) = self.packet_buffer.pop_front() {
            return Ok(packet);
        }
        self.read_format_packet()
    }

    /// [`read_packet`](Self::read_packet) through the pool given in
    /// [`DemuxOptions::pool`]; the caller returns the slot with
    /// [`PacketPool::free`] or [`PacketPool::release`].
    pub fn read_pooled(&mut self) -> Result<PooledPacket, FormatError> {
        let pool = self
            .ctx
            .pool
            .clone()
            .ok_or_else(|| FormatError::params("read_pooled without a packet pool"))?;
        let packet = self.read_packet()?;
        Ok(pool.adopt(packet))
    }

    pub fn pool(&self) -> Option<&PacketPool> {
        self.ctx.pool.as_ref()
    }

    /// Picks the stream seeks apply to when none is given: the first video,
    /// then audio, then subtitle stream.
    fn default_stream(&self) -> Option<usize> {
        [MediaType::Video, MediaType::Audio, MediaType::Subtitle]
            .into_iter()
            .find_map(|kind| self.ctx.streams.iter().position(|s| s.media_type() == kind))
            .or_else(|| (!self.ctx.streams.is_empty()).then_some(0))
    }

    /// Seeks to `timestamp_ms` on `stream_index` (or the default stream).
    ///
    /// Buffered packets are dropped. Streams whose dts is being recovered
    /// read ahead to refill their queue before returning, so packets after a
    /// seek carry dts again.
    pub fn seek(
        &mut self,
        stream_index: Option<usize>,
        timestamp_ms: i64,
        flags: SeekFlags,
    ) -> Result<(), FormatError> {
        let index = stream_index
            .or_else(|| self.default_stream())
            .ok_or_else(|| FormatError::params("no stream to seek in"))?;
        let tb = self.ctx.stream(index)?.time_base;
        let timestamp = rescale(timestamp_ms, MILLI_TIME_BASE, tb);
        log::debug!("seek stream {index} to {timestamp_ms} ms ({timestamp} in {tb})");

        self.format.seek(&mut self.ctx, index, timestamp, flags)?;
        self.packet_buffer.clear();
        self.pending_extradata.clear();

        let mut priming: Vec<(usize, usize)> = Vec::new();
        for (&stream, context) in self.dts_contexts.iter_mut() {
            context.queue.clear();
            if context.delay > 0 {
                priming.push((stream, context.delay));
                context.delay = MIN_ANALYZE_SAMPLES;
            }
        }
        if priming.is_empty() {
            return Ok(());
        }

        let mut window = ReadAhead::new(self.analyze_window_ms());
        loop {
            let primed = priming.iter().all(|(stream, _)| {
                self.dts_contexts
                    .get(stream)
                    .is_some_and(|c| c.queue.len() >= MIN_ANALYZE_SAMPLES)
            });
            if primed {
                break;
            }
            let packet = match self.read_format_packet() {
                Ok(packet) => packet,
                Err(FormatError::Eof) => break,
                Err(e) => return Err(e),
            };
            let ts_ms = self.packet_ms(&packet);
            self.packet_buffer.push_back(packet);
            if window.exhausted(ts_ms) {
                log::debug!(
                    "seek read-ahead stopped after {} packets",
                    self.packet_buffer.len()
                );
                break;
            }
        }

        for (stream, delay) in priming {
            let context = assign_dts(&mut self.packet_buffer, stream, delay);
            self.dts_contexts.insert(stream, context);
        }
        Ok(())
    }

    /// Raises the abort flag; reads in flight and later fail with
    /// [`FormatError::Aborted`].
    pub fn close(&mut self) {
        self.abort.abort();
        self.packet_buffer.clear();
    }
}
