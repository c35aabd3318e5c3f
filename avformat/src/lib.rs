//! Media container demuxing and muxing.
//!
//! ## Technical Overview
//!
//! Reads and writes compressed elementary streams packaged in container
//! formats without decoding them.
//!
//! ### Containers
//!
//! - ISOBMFF / QuickTime (`mov`, `mp4`, fragmented MP4, CENC)
//! - MPEG transport streams (188, 192 and 204 byte packets)
//! - RIFF WAVE, RF64 and BW64
//! - FLV, legacy and enhanced
//! - raw ADTS AAC and native FLAC
//!
//! ### Packet Flow
//!
//! A demuxer fills a stream table in [`formats::InputContext`] and then
//! produces one [`structs::packet::Packet`] per call. Packets can be rewritten
//! between NAL unit encapsulations (length prefixed and Annex B) or AAC
//! framings (ADTS and raw) by the filters in [`process::bsf`] before they
//! reach a muxer.
//!
//! ## Quick Start
//!
//! 1. Open an input with [`process::demux::DemuxContext`]
//! 2. Add its streams to a [`process::mux::MuxContext`]
//! 3. Move packets across until the demuxer reports end of stream
//!
//! ```rust,no_run
//! use std::fs::File;
//!
//! use avformat::formats::OutputFormat;
//! use avformat::io::{IoReader, IoWriter};
//! use avformat::process::demux::{DemuxContext, DemuxOptions};
//! use avformat::process::mux::{MuxContext, MuxOptions};
//!
//! let input = IoReader::new(File::open("input.mp4")?)?;
//! let mut demuxer = DemuxContext::open(input, None, DemuxOptions::default())?;
//!
//! let output = IoWriter::seekable(File::create("output.mp4")?)?;
//! let mut muxer = MuxContext::new(output, OutputFormat::Mov(Default::default()), MuxOptions::default());
//! for stream in demuxer.streams() {
//!     muxer.add_stream(stream.codecpar.clone(), stream.time_base)?;
//! }
//! muxer.write_header()?;
//!
//! loop {
//!     match demuxer.read_packet() {
//!         Ok(packet) => {
//!             let time_base = demuxer.streams()[packet.stream_index].time_base;
//!             muxer.write_packet(packet, time_base)?;
//!         }
//!         Err(e) if e.is_eof() => break,
//!         Err(e) => return Err(e.into()),
//!     }
//! }
//! muxer.write_trailer()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Codec bitstream helpers.
///
/// Only the headers needed for container work are parsed: decoder
/// configuration records, parameter sets, ADTS and FLAC frame headers.
pub mod codecs;

/// Container format plugins.
///
/// - **Demuxers** ([`formats::IFormat`]): wav, mov, mpegts, aac, flac, flv
/// - **Muxers** ([`formats::OFormat`]): wav, mov, adts
pub mod formats;

/// Synchronous byte-stream contract.
pub mod io;

/// Processing built on top of the format plugins.
///
/// 1. **Demuxing** ([`process::demux`]): probing, stream analysis and
///    decode timestamp recovery.
///
/// 2. **Muxing** ([`process::mux`]): stream setup and timestamp checks.
///
/// 3. **Bitstream Filters** ([`process::bsf`]): payload encapsulation
///    rewrites.
///
/// 4. **Timestamps** ([`process::timestamp`]): reorder delay and packet size
///    heuristics.
pub mod process;

/// Data structures shared by every container format.
///
/// - **Packets** ([`structs::packet`]): coded data with timing and side data
/// - **Streams** ([`structs::stream`]): codec parameters and dispositions
/// - **Rationals** ([`structs::rational`]): time bases and rescaling
/// - **FourCC** ([`structs::fourcc`]): four character codes
/// - **Encryption** ([`structs::encryption`]): CENC sample and init info
pub mod structs;

/// Utility functions and supporting infrastructure.
///
/// - **Bitstream I/O** ([`utils::bitstream_io`]): Bit-level reading/writing
/// - **Byte Order** ([`utils::byteorder`]): Structured header emission
/// - **CRC Validation** ([`utils::crc`]): Error detection
/// - **Error Handling** ([`utils::errors`]): Error types
/// - **Buffer Management** ([`utils::buffer_pool`]): Packet recycling
pub mod utils;
