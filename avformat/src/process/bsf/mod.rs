//! Packet bitstream filters.
//!
//! A filter rewrites the payload encapsulation of one stream's packets
//! without decoding them. Packets go in through
//! [`send_packet`](BitstreamFilter::send_packet) and come out of
//! [`receive_packet`](BitstreamFilter::receive_packet); a filter may hold
//! packets back (an ADTS frame split across two inputs) or emit several
//! packets for one input. [`FormatError::Eof`] from `receive_packet` means
//! nothing more is available until the next send.
//!
//! ```rust,no_run
//! use avformat::process::bsf::{BitstreamFilter, Bsf};
//! use avformat::structs::packet::Packet;
//! use avformat::structs::rational::Rational;
//! use avformat::structs::stream::{CodecId, CodecParameters};
//!
//! let par = CodecParameters::audio(CodecId::Aac, 44100, 2);
//! let mut bsf = Bsf::by_name("adts2raw").unwrap();
//! bsf.init(&par, Rational::new(1, 44100))?;
//!
//! bsf.send_packet(Packet::from_vec(std::fs::read("audio.aac")?))?;
//! while let Ok(packet) = bsf.receive_packet() {
//!     println!("raw frame of {} bytes at {}", packet.size(), packet.pts);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::structs::packet::Packet;
use crate::structs::rational::Rational;
use crate::structs::stream::{CodecId, CodecParameters};
use crate::utils::errors::FormatError;

pub mod adts2raw;
pub mod annexb2avcc;
pub mod avcc2annexb;
pub mod raw2adts;

pub use adts2raw::Adts2Raw;
pub use annexb2avcc::AnnexB2Avcc;
pub use avcc2annexb::Avcc2AnnexB;
pub use raw2adts::Raw2Adts;

pub trait BitstreamFilter {
    /// Prepares the filter for a stream described by `codecpar` whose packet
    /// timestamps are in `time_base`.
    fn init(&mut self, codecpar: &CodecParameters, time_base: Rational) -> Result<(), FormatError>;

    fn send_packet(&mut self, packet: Packet) -> Result<(), FormatError>;

    /// Next filtered packet, [`FormatError::Eof`] when none is ready.
    fn receive_packet(&mut self) -> Result<Packet, FormatError>;

    /// Drops cached and pending data, returning to the state after `init`.
    fn reset(&mut self);

    /// Codec parameters of the filtered stream.
    fn codecpar_out(&self) -> &CodecParameters;
}

/// The available filters.
#[derive(Debug)]
pub enum Bsf {
    Avcc2AnnexB(Avcc2AnnexB),
    AnnexB2Avcc(AnnexB2Avcc),
    Adts2Raw(Adts2Raw),
    Raw2Adts(Raw2Adts),
}

macro_rules! dispatch {
    ($self:expr, $f:ident => $body:expr) => {
        match $self {
            Bsf::Avcc2AnnexB($f) => $body,
            Bsf::AnnexB2Avcc($f) => $body,
            Bsf::Adts2Raw($f) => $body,
            Bsf::Raw2Adts($f) => $body,
        }
    };
}

impl Bsf {
    pub fn by_name(name: &str) -> Option<Self> {
        Some(match name {
            "avcc2annexb" => Self::Avcc2AnnexB(Avcc2AnnexB::default()),
            "annexb2avcc" => Self::AnnexB2Avcc(AnnexB2Avcc::default()),
            "adts2raw" => Self::Adts2Raw(Adts2Raw::default()),
            "raw2adts" => Self::Raw2Adts(Raw2Adts::default()),
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Avcc2AnnexB(_) => "avcc2annexb",
            Self::AnnexB2Avcc(_) => "annexb2avcc",
            Self::Adts2Raw(_) => "adts2raw",
            Self::Raw2Adts(_) => "raw2adts",
        }
    }

    /// Whether the filter accepts streams of `codec_id`.
    pub fn supports(&self, codec_id: CodecId) -> bool {
        match self {
            Self::Avcc2AnnexB(_) | Self::AnnexB2Avcc(_) => codec_id.is_nalu_based(),
            Self::Adts2Raw(_) | Self::Raw2Adts(_) => codec_id == CodecId::Aac,
        }
    }
}

impl BitstreamFilter for Bsf {
    fn init(&mut self, codecpar: &CodecParameters, time_base: Rational) -> Result<(), FormatError> {
        dispatch!(self, f => f.init(codecpar, time_base))
    }

    fn send_packet(&mut self, packet: Packet) -> Result<(), FormatError> {
        dispatch!(self, f => f.send_packet(packet))
    }

    fn receive_packet(&mut self) -> Result<Packet, FormatError> {
        dispatch!(self, f => f.receive_packet())
    }

    fn reset(&mut self) {
        dispatch!(self, f => f.reset())
    }

    fn codecpar_out(&self) -> &CodecParameters {
        dispatch!(self, f => f.codecpar_out())
    }
}

/// Filters applied one after another, each fed by the previous one's output.
#[derive(Debug, Default)]
pub struct BsfChain {
    filters: Vec<Bsf>,
    codecpar: CodecParameters,
}

impl BsfChain {
    pub fn new(filters: Vec<Bsf>) -> Self {
        Self {
            filters,
            codecpar: CodecParameters::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Moves everything ready in filter `index` into the filters after it.
    fn drain_from(&mut self, index: usize) -> Result<(), FormatError> {
        let (head, tail) = self.filters.split_at_mut(index + 1);
        let Some(next) = tail.first_mut() else {
            return Ok(());
        };
        loop {
            match head[index].receive_packet() {
                Ok(packet) => next.send_packet(packet)?,
                Err(FormatError::Eof) => break,
                Err(e) => return Err(e),
            }
        }
        self.drain_from(index + 1)
    }
}

impl BitstreamFilter for BsfChain {
    fn init(&mut self, codecpar: &CodecParameters, time_base: Rational) -> Result<(), FormatError> {
        let mut par = codecpar.clone();
        for filter in &mut self.filters {
            filter.init(&par, time_base)?;
            par = filter.codecpar_out().clone();
        }
        self.codecpar = par;
        Ok(())
    }

    fn send_packet(&mut self, packet: Packet) -> Result<(), FormatError> {
        let Some(first) = self.filters.first_mut() else {
            return Err(FormatError::params("empty filter chain"));
        };
        first.send_packet(packet)?;
        self.drain_from(0)
    }

    fn receive_packet(&mut self) -> Result<Packet, FormatError> {
        match self.filters.last_mut() {
            Some(last) => last.receive_packet(),
            None => Err(FormatError::Eof),
        }
    }

    fn reset(&mut self) {
        self.filters.iter_mut().for_each(BitstreamFilter::reset);
    }

    fn codecpar_out(&self) -> &CodecParameters {
        match self.filters.last() {
            Some(last) => last.codecpar_out(),
            None => &self.codecpar,
        }
    }
}
