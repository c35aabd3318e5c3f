//! Raw AAC access units to ADTS frames.

use std::collections::VecDeque;

use super::BitstreamFilter;
use crate::codecs::aac::{AdtsHeader, AudioSpecificConfig, OBJECT_TYPE_LC, write_adts_header};
use crate::structs::packet::{Packet, SideDataKind};
use crate::structs::rational::Rational;
use crate::structs::stream::CodecParameters;
use crate::utils::errors::{BsfError, FormatError};

/// Prepends a 7-byte ADTS header to each raw AAC packet.
#[derive(Debug, Default)]
pub struct Raw2Adts {
    config: Option<AudioSpecificConfig>,
    cache: VecDeque<Packet>,
    par_out: CodecParameters,
}

impl BitstreamFilter for Raw2Adts {
    fn init(&mut self, codecpar: &CodecParameters, _time_base: Rational) -> Result<(), FormatError> {
        self.config = if !codecpar.extradata.is_empty() {
            Some(AudioSpecificConfig::parse(&codecpar.extradata)?)
        } else if codecpar.sample_rate > 0 && codecpar.channels > 0 {
            log::debug!("raw2adts: no extradata, assuming AAC-LC");
            Some(AudioSpecificConfig::new(
                OBJECT_TYPE_LC,
                codecpar.sample_rate,
                codecpar.channels.min(7) as u8,
            ))
        } else {
            None
        };
        self.par_out = codecpar.clone();
        self.par_out.extradata.clear();
        self.cache.clear();
        Ok(())
    }

    fn send_packet(&mut self, mut packet: Packet) -> Result<(), FormatError> {
        if let Some(extradata) = packet.new_extradata() {
            self.config = Some(AudioSpecificConfig::parse(extradata)?);
        }
        packet.take_side_data(SideDataKind::NewExtradata);

        // Already framed.
        if AdtsHeader::parse(packet.data()).is_some_and(|h| h.frame_length == packet.size()) {
            self.cache.push_back(packet);
            return Ok(());
        }

        let config = self.config.ok_or(BsfError::MissingExtradata("aac"))?;
        let header = write_adts_header(&config, packet.size())?;
        let payload = packet.take_data();
        let mut data = Vec::with_capacity(header.len() + payload.len());
        data.extend_from_slice(&header);
        data.extend_from_slice(&payload);
        packet.set_data(data);

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::aac::tests::ADTS_HEADER;
    use crate::structs::packet::SideData;
    use crate::structs::stream::CodecId;

    #[test]
    fn prepends_header_from_extradata() -> anyhow::Result<()> {
        let mut par = CodecParameters::audio(CodecId::Aac, 44100, 2);
        par.extradata = vec![0x12, 0x10];
        let mut bsf = Raw2Adts::default();
        bsf.init(&par, Rational::new(1, 44100))?;
        assert!(bsf.codecpar_out().extradata.is_empty());

        let mut packet = Packet::from_vec(vec![0x21; 364]);
        packet.pts = 1024;
        bsf.send_packet(packet)?;

        let out = bsf.receive_packet()?;
        assert_eq!(&out.data()[..7], &ADTS_HEADER);
        assert_eq!(out.size(), 371);
        assert_eq!(out.pts, 1024);
        Ok(())
    }

    #[test]
    fn follows_new_extradata() -> anyhow::Result<()> {
        let mut bsf = Raw2Adts::default();
        bsf.init(&CodecParameters::audio(CodecId::Aac, 0, 0), Rational::new(1, 48000))?;
        assert!(bsf.send_packet(Packet::from_vec(vec![1; 10])).is_err());

        let mono_48k = AudioSpecificConfig::new(OBJECT_TYPE_LC, 48000, 1);
        let mut packet = Packet::from_vec(vec![1; 10]);
        packet.add_side_data(SideData::NewExtradata(mono_48k.to_bytes()));
        bsf.send_packet(packet)?;

        let out = bsf.receive_packet()?;
        assert!(out.new_extradata().is_none());
        let header = AdtsHeader::parse(out.data()).unwrap();
        assert_eq!(header.sample_rate(), 48000);
        assert_eq!(header.channel_config, 1);
        assert_eq!(header.frame_length, 17);
        Ok(())
    }
}
