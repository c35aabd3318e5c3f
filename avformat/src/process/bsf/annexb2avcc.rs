//! Start-code delimited NAL units to 4-byte length-prefixed NAL units.

use std::collections::VecDeque;

use super::BitstreamFilter;
use crate::codecs::nalu;
use crate::codecs::NalCodec;
use crate::structs::packet::{BitFormat, Packet, SideData};
use crate::structs::rational::Rational;
use crate::structs::stream::CodecParameters;
use crate::utils::errors::{BsfError, FormatError};

const LENGTH_SIZE: usize = 4;

/// Rewrites Annex B packets into length-prefixed form.
///
/// Every NAL unit is kept, delimiters included. Parameter sets stay in band;
/// when they differ from the last ones seen, a configuration record rebuilt
/// from them is attached as [`SideData::NewExtradata`].
#[derive(Debug, Default)]
pub struct AnnexB2Avcc {
    codec: Option<NalCodec>,
    last_sets: Vec<Vec<u8>>,
    cache: VecDeque<Packet>,
    par_out: CodecParameters,
}

impl AnnexB2Avcc {
    fn filter(&mut self, codec: NalCodec, mut packet: Packet) -> Result<Packet, FormatError> {
        let nalus = nalu::split_nalu_by_start_code(packet.data());

        let sets = codec.collect_param_sets(&nalus);
        let extradata = if !sets.sps.is_empty() && sets.iter().ne(self.last_sets.iter()) {
            match codec.build_extradata(sets.clone()) {
                Ok(record) => {
                    self.last_sets = sets.iter().cloned().collect();
                    Some(record)
                }
                Err(e) => {
                    log::warn!("{}: cannot rebuild configuration record: {e}", codec.name());
                    None
                }
            }
        } else {
            None
        };

        let data = nalu::join_nalu_by_length(&nalus, LENGTH_SIZE);
        packet.set_data(data);
        packet.bit_format = Some(BitFormat::Avcc);
        if let Some(record) = extradata {
            if self.par_out.extradata.is_empty() {
                self.par_out.extradata = record.clone();
            }
            packet.add_side_data(SideData::NewExtradata(record));
        }
        Ok(packet)
    }
}

impl BitstreamFilter for AnnexB2Avcc {
    fn init(&mut self, codecpar: &CodecParameters, _time_base: Rational) -> Result<(), FormatError> {
        let codec = NalCodec::from_codec_id(codecpar.codec_id)
            .ok_or_else(|| BsfError::UnsupportedCodec(codecpar.codec_id.to_string()))?;
        self.codec = Some(codec);
        self.par_out = codecpar.clone();
        self.par_out.bit_format = Some(BitFormat::Avcc);
        self.last_sets.clear();
        self.cache.clear();

        if nalu::is_annexb(&codecpar.extradata) {
            let units = nalu::split_nalu_by_start_code(&codecpar.extradata);
            let sets = codec.collect_param_sets(&units);
            self.par_out.extradata = codec.build_extradata(sets.clone())?;
            self.last_sets = sets.iter().cloned().collect();
        } else if !codecpar.extradata.is_empty() {
            self.last_sets = codec.param_sets(&codecpar.extradata)?.iter().cloned().collect();
        }
        Ok(())
    }

    fn send_packet(&mut self, packet: Packet) -> Result<(), FormatError> {
        let codec = self
            .codec
            .ok_or_else(|| FormatError::params("annexb2avcc used before init"))?;
        if packet.bit_format == Some(BitFormat::Avcc) {
            self.cache.push_back(packet);
            return Ok(());
        }
        let packet = self.filter(codec, packet)?;
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
