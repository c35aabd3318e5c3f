//! ADTS AAC muxer.

use super::{OFormat, OutputContext};
use crate::process::bsf::{BitstreamFilter, Raw2Adts};
use crate::structs::packet::Packet;
use crate::structs::rational::Rational;
use crate::structs::stream::{CodecId, Disposition, MediaType};
use crate::utils::errors::FormatError;

/// Writes the first AAC stream as back-to-back ADTS frames. Packets of any
/// other stream are dropped.
#[derive(Debug, Default)]
pub struct OAacFormat {
    stream_index: usize,
    filter: Raw2Adts,
    frames: u64,
}

impl OFormat for OAacFormat {
    fn name(&self) -> &'static str {
        "aac"
    }

    fn init(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        let index = ctx
            .streams
            .iter()
            .position(|s| {
                s.codecpar.codec_id == CodecId::Aac && !s.disposition.contains(Disposition::ATTACHED_PIC)
            })
            .ok_or_else(|| FormatError::params("adts output needs an AAC stream"))?;
        if ctx.streams.len() > 1 {
            log::warn!(
                "adts output keeps stream {index} only, {} other streams dropped",
                ctx.streams.len() - 1
            );
        }

        let stream = &mut ctx.streams[index];
        stream.codecpar.media_type = MediaType::Audio;
        if stream.codecpar.sample_rate > 0 {
            stream.time_base = Rational::new(1, stream.codecpar.sample_rate as i32);
        }
        self.filter.init(&stream.codecpar, stream.time_base)?;
        self.stream_index = index;
        Ok(())
    }

    fn write_header(&mut self, _ctx: &mut OutputContext) -> Result<(), FormatError> {
        Ok(())
    }

    fn write_packet(&mut self, ctx: &mut OutputContext, packet: &Packet) -> Result<(), FormatError> {
        if packet.stream_index != self.stream_index {
            log::trace!("adts: packet of stream {} ignored", packet.stream_index);
            return Ok(());
        }
        if packet.is_empty() {
            log::warn!("empty packet on stream {}, ignoring", packet.stream_index);
            return Ok(());
        }
        self.filter.send_packet(packet.clone())?;
        while let Ok(frame) = self.filter.receive_packet() {
            ctx.io.write_all(frame.data())?;
            self.frames += 1;
        }
        Ok(())
    }

    fn write_trailer(&mut self, ctx: &mut OutputContext) -> Result<(), FormatError> {
        log::debug!("adts: {} frames written", self.frames);
        Ok(ctx.io.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::aac::tests::ADTS_HEADER;
    use crate::formats::{IAacFormat, IFormat, InputContext};
    use crate::io::{IoReader, IoWriter};
    use crate::process::mux::MuxOptions;
    use crate::structs::packet::SideData;
    use crate::structs::stream::{CodecParameters, Stream};

    fn output(streams: Vec<Stream>) -> OutputContext {
        let mut ctx = OutputContext::new(IoWriter::buffer(), MuxOptions::default());
        ctx.streams = streams;
        ctx
    }

    fn aac_stream(extradata: Vec<u8>) -> Stream {
        let mut stream = Stream::new(0, Rational::new(1, 1000));
        stream.codecpar = CodecParameters::audio(CodecId::Aac, 44100, 2);
        stream.codecpar.extradata = extradata;
        stream
    }

    #[test]
    fn frames_round_trip() -> anyhow::Result<()> {
        let mut video = Stream::new(0, Rational::new(1, 90000));
        video.codecpar = CodecParameters::video(CodecId::H264, 16, 16);
        let mut ctx = output(vec![video, aac_stream(vec![0x12, 0x10])]);

        let mut format = OAacFormat::default();
        format.init(&mut ctx)?;
        assert_eq!(ctx.streams[1].time_base, Rational::new(1, 44100));
        format.write_header(&mut ctx)?;
        for i in 0..3 {
            let mut packet = Packet::from_vec(vec![i as u8; 364]);
            packet.stream_index = 1;
            packet.pts = i * 1024;
            format.write_packet(&mut ctx, &packet)?;
        }
        let mut other = Packet::from_vec(vec![9; 10]);
        other.stream_index = 0;
        format.write_packet(&mut ctx, &other)?;
        format.write_trailer(&mut ctx)?;

        let out = ctx.io.into_buffer().unwrap_or_default();
        assert_eq!(out.len(), 3 * 371);
        assert_eq!(&out[..7], &ADTS_HEADER);

        let mut input = InputContext::new(IoReader::from_bytes(out));
        let mut demuxer = IAacFormat::default();
        demuxer.read_header(&mut input)?;
        assert_eq!(input.streams[0].codecpar.extradata, vec![0x12, 0x10]);
        assert_eq!(demuxer.read_packet(&mut input)?.data(), &[0u8; 364][..]);
        Ok(())
    }

    #[test]
    fn config_from_side_data() -> anyhow::Result<()> {
        let mut ctx = output(vec![aac_stream(Vec::new())]);
        ctx.streams[0].codecpar.sample_rate = 0;
        let mut format = OAacFormat::default();
        format.init(&mut ctx)?;

        let mut packet = Packet::from_vec(vec![1; 20]);
        assert!(format.write_packet(&mut ctx, &packet).is_err());
        packet.add_side_data(SideData::NewExtradata(vec![0x12, 0x10]));
        format.write_packet(&mut ctx, &packet)?;
        let out = ctx.io.into_buffer().unwrap_or_default();
        assert_eq!(out.len(), 27);
        Ok(())
    }

    #[test]
    fn needs_an_aac_stream() {
        let mut stream = Stream::new(0, Rational::new(1, 48000));
        stream.codecpar = CodecParameters::audio(CodecId::Opus, 48000, 2);
        let mut ctx = output(vec![stream]);
        assert!(OAacFormat::default().init(&mut ctx).is_err());
    }
}
