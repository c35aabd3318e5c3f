//! Length-prefixed NAL units to start-code delimited NAL units.

use std::collections::VecDeque;

use super::BitstreamFilter;
use crate::codecs::nalu::{self, StartCodeMode};
use crate::codecs::{NalCodec, NalKind};
use crate::structs::packet::{BitFormat, Packet, SideDataKind};
use crate::structs::rational::Rational;
use crate::structs::stream::CodecParameters;
use crate::utils::errors::{BsfError, FormatError};

/// Rewrites `avcC`/`hvcC`/`vvcC` style packets into Annex B.
///
/// NAL units keep their order and bytes. A packet carrying new extradata gets
/// the record's parameter sets right after its access unit delimiter, or at
/// the start when it has none, unless it already holds an SPS in band.
#[derive(Debug)]
pub struct Avcc2AnnexB {
    codec: Option<NalCodec>,
    length_size: usize,
    param_sets: Vec<Vec<u8>>,
    cache: VecDeque<Packet>,
    par_out: CodecParameters,
}

impl Default for Avcc2AnnexB {
    fn default() -> Self {
        Self {
            codec: None,
            length_size: 4,
            param_sets: Vec::new(),
            cache: VecDeque::new(),
            par_out: CodecParameters::default(),
        }
    }
}

impl Avcc2AnnexB {
    fn codec(&self) -> Result<NalCodec, FormatError> {
        self.codec
            .ok_or_else(|| FormatError::params("avcc2annexb used before init"))
    }

    fn load_extradata(&mut self, extradata: &[u8]) -> Result<(), FormatError> {
        let codec = self.codec()?;
        if extradata.is_empty() || nalu::is_annexb(extradata) {
            self.param_sets = nalu::split_nalu_by_start_code(extradata)
                .into_iter()
                .map(<[u8]>::to_vec)
                .collect();
            return Ok(());
        }

        self.length_size = codec.length_size(extradata).ok_or_else(|| {
            FormatError::invalid(format!("{}: truncated configuration record", codec.name()))
        })?;
        self.param_sets = codec.param_sets(extradata)?.iter().cloned().collect();
        log::debug!(
            "{}: {} byte NAL lengths, {} parameter sets",
            codec.name(),
            self.length_size,
            self.param_sets.len()
        );
        Ok(())
    }

    fn filter(&mut self, mut packet: Packet) -> Result<Packet, FormatError> {
        let codec = self.codec()?;
        let new_extradata = match packet.new_extradata().map(<[u8]>::to_vec) {
            Some(extradata) => {
                self.load_extradata(&extradata)?;
                packet.take_side_data(SideDataKind::NewExtradata);
                true
            }
            None => false,
        };

        let nalus = nalu::split_nalu_by_length(packet.data(), self.length_size)?;
        let has_sps = nalus.iter().any(|nal| codec.kind(nal) == NalKind::Sps);

        let out: Vec<&[u8]> = if new_extradata && !has_sps {
            let at = nalus
                .iter()
                .position(|nal| codec.kind(nal) == NalKind::Aud)
                .map_or(0, |i| i + 1);
            let mut out = Vec::with_capacity(nalus.len() + self.param_sets.len());
            out.extend_from_slice(&nalus[..at]);
            out.extend(self.param_sets.iter().map(Vec::as_slice));
            out.extend_from_slice(&nalus[at..]);
            out
        } else {
            nalus
        };

        let data = nalu::join_nalu_by_start_code(&out, StartCodeMode::Long);
        packet.set_data(data);
        packet.bit_format = Some(BitFormat::AnnexB);
        Ok(packet)
    }
}

impl BitstreamFilter for Avcc2AnnexB {
    fn init(&mut self, codecpar: &CodecParameters, _time_base: Rational) -> Result<(), FormatError> {
        let codec = NalCodec::from_codec_id(codecpar.codec_id)
            .ok_or_else(|| BsfError::UnsupportedCodec(codecpar.codec_id.to_string()))?;
        self.codec = Some(codec);
        self.length_size = 4;
        self.load_extradata(&codecpar.extradata)?;

        self.par_out = codecpar.clone();
        self.par_out.bit_format = Some(BitFormat::AnnexB);
        self.cache.clear();
        Ok(())
    }

    fn send_packet(&mut self, packet: Packet) -> Result<(), FormatError> {
        if packet.bit_format == Some(BitFormat::AnnexB) {
            self.cache.push_back(packet);
            return Ok(());
        }
        let packet = self.filter(packet)?;
        self.cache.push_back(packet);
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Packet, FormatError> {
        self.cache.pop_front().ok_or(FormatError::Eof)
    }

    fn reset(&mut self) {
        self.cache.clear();
    }

    fn codecpar_out(&self) -> &CodecParameters {
        &self.par_out
    }
}
