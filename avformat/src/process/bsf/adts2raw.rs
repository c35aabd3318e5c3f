//! ADTS framed AAC to raw access units.

use std::collections::VecDeque;

use super::BitstreamFilter;
use crate::codecs::aac::{ADTS_HEADER_SIZE, AdtsHeader, AudioSpecificConfig};
use crate::structs::packet::{Packet, SideData};
use crate::structs::rational::{NOPTS_VALUE, Rational, rescale};
use crate::structs::stream::CodecParameters;
use crate::utils::errors::{BsfError, FormatError};

/// A frame whose bytes straddle two input packets.
#[derive(Debug)]
struct Pending {
    buffer: Vec<u8>,
    /// Bytes still needed; while the header is incomplete this counts up to
    /// the header only.
    missing: usize,
    props: Packet,
}

/// Splits ADTS streams into one raw AAC packet per frame.
///
/// Each output packet carries the duration of its frame and timestamps
/// advance by that duration within one input packet. A frame cut short at the
/// end of an input is held until the rest arrives. Changes of profile, rate or
/// channel layout attach the new `AudioSpecificConfig` as
/// [`SideData::NewExtradata`].
#[derive(Debug)]
pub struct Adts2Raw {
    time_base: Rational,
    initial_config: Option<AudioSpecificConfig>,
    config: Option<AudioSpecificConfig>,
    pending: Option<Pending>,
    cache: VecDeque<Packet>,
    par_out: CodecParameters,
}

impl Default for Adts2Raw {
    fn default() -> Self {
        Self {
            time_base: Rational::new(1, 90_000),
            initial_config: None,
            config: None,
            pending: None,
            cache: VecDeque::new(),
            par_out: CodecParameters::default(),
        }
    }
}

impl Adts2Raw {
    /// Offset of the first valid header at or after `from`.
    fn resync(data: &[u8], from: usize) -> Option<usize> {
        (from..data.len().saturating_sub(1))
            .find(|&i| AdtsHeader::has_sync(&data[i..]) && AdtsHeader::parse(&data[i..]).is_some())
    }

    /// Emits one complete frame. `frame` starts with its ADTS header.
    fn emit(&mut self, header: &AdtsHeader, frame: &[u8], props: &Packet) -> Result<i64, FormatError> {
        let header_len = header.header_len();
        if header.frame_length < header_len {
            return Err(BsfError::FrameTooShort(header.frame_length).into());
        }

        let config = header.audio_specific_config();
        let duration = rescale(
            header.samples() as i64,
            Rational::new(1, config.sample_rate as i32),
            self.time_base,
        );

        let mut packet = Packet::from_vec(frame[header_len..header.frame_length].to_vec());
        packet.copy_props(props);
        packet.duration = duration;

        if self.config != Some(config) {
            if self.config.is_some() {
                log::info!(
                    "ADTS config changed: object type {}, {} Hz, channel config {}",
                    config.object_type,
                    config.sample_rate,
                    config.channel_config
                );
            }
            let extradata = config.to_bytes();
            self.par_out.sample_rate = config.sample_rate;
            self.par_out.channels = config.channels();
            self.par_out.profile = config.object_type as i32 - 1;
            self.par_out.extradata = extradata.clone();
            packet.add_side_data(SideData::NewExtradata(extradata));
            self.config = Some(config);
        }

        self.cache.push_back(packet);
        Ok(duration)
    }

    /// Completes the pending frame from the head of `data`, returning how many
    /// bytes were taken.
    fn fill_pending(&mut self, data: &[u8]) -> Result<usize, FormatError> {
        let mut taken = 0;
        while let Some(mut pending) = self.pending.take() {
            let n = pending.missing.min(data.len() - taken);
            pending.buffer.extend_from_slice(&data[taken..taken + n]);
            pending.missing -= n;
            taken += n;

            if pending.missing > 0 {
                self.pending = Some(pending);
                return Ok(taken);
            }

            let Some(header) = AdtsHeader::parse(&pending.buffer) else {
                log::warn!("ADTS: dropped {} bytes of a truncated header", pending.buffer.len());
                return Ok(0);
            };
            if pending.buffer.len() < header.frame_length {
                pending.missing = header.frame_length - pending.buffer.len();
                self.pending = Some(pending);
                continue;
            }
            self.emit(&header, &pending.buffer, &pending.props)?;
        }
        Ok(taken)
    }
}

impl BitstreamFilter for Adts2Raw {
    fn init(&mut self, codecpar: &CodecParameters, time_base: Rational) -> Result<(), FormatError> {
        self.time_base = time_base;
        self.initial_config = if codecpar.extradata.is_empty() {
            None
        } else {
            Some(AudioSpecificConfig::parse(&codecpar.extradata)?)
        };
        self.par_out = codecpar.clone();
        self.reset();
        Ok(())
    }

    fn send_packet(&mut self, packet: Packet) -> Result<(), FormatError> {
        let data = packet.data();
        let mut pos = self.fill_pending(data)?;

        let mut props = packet.clone();
        props.set_data(Vec::new());

        while pos < data.len() {
            let header = match AdtsHeader::parse(&data[pos..]) {
                Some(header) => header,
                None if data.len() - pos < ADTS_HEADER_SIZE && AdtsHeader::has_sync(&data[pos..]) => {
                    self.pending = Some(Pending {
                        buffer: data[pos..].to_vec(),
                        missing: ADTS_HEADER_SIZE - (data.len() - pos),
                        props,
                    });
                    return Ok(());
                }
                None => {
                    let Some(next) = Self::resync(data, pos + 1) else {
                        return Err(BsfError::SyncNotFound(data.len() - pos).into());
                    };
                    log::warn!("ADTS: skipped {} bytes to resync", next - pos);
                    pos = next;
                    continue;
                }
            };

            let available = data.len() - pos;
            if header.frame_length > available {
                self.pending = Some(Pending {
                    buffer: data[pos..].to_vec(),
                    missing: header.frame_length - available,
                    props,
                });
                return Ok(());
            }

            let duration = self.emit(&header, &data[pos..], &props)?;
            pos += header.frame_length;
            for ts in [&mut props.pts, &mut props.dts] {
                if *ts != NOPTS_VALUE {
                    *ts += duration;
                }
            }
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Packet, FormatError> {
        self.cache.pop_front().ok_or(FormatError::Eof)
    }

    fn reset(&mut self) {
        self.cache.clear();
        self.pending = None;
        self.config = self.initial_config;
    }

    fn codecpar_out(&self) -> &CodecParameters {
        &self.par_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::aac::tests::ADTS_HEADER;
    use crate::codecs::aac::write_adts_header;
    use crate::structs::stream::CodecId;

    fn frame(fill: u8) -> Vec<u8> {
        let mut frame = ADTS_HEADER.to_vec();
        frame.resize(371, fill);
        frame
    }

    fn filter() -> anyhow::Result<Adts2Raw> {
        let mut bsf = Adts2Raw::default();
        bsf.init(&CodecParameters::audio(CodecId::Aac, 44100, 2), Rational::new(1, 44100))?;
        Ok(bsf)
    }

    fn drain(bsf: &mut Adts2Raw) -> Vec<Packet> {
        std::iter::from_fn(|| bsf.receive_packet().ok()).collect()
    }

    fn packet(data: Vec<u8>, pts: i64) -> Packet {
        let mut packet = Packet::from_vec(data);
        packet.pts = pts;
        packet.dts = pts;
        packet
    }

    #[test]
    fn splits_frames_and_advances_timestamps() -> anyhow::Result<()> {
        let mut bsf = filter()?;
        let data = [frame(1), frame(2), frame(3)].concat();
        bsf.send_packet(packet(data, 0))?;

        let out = drain(&mut bsf);
        assert_eq!(out.len(), 3);
        assert_eq!(out.iter().map(|p| p.pts).collect::<Vec<_>>(), vec![0, 1024, 2048]);
        assert!(out.iter().all(|p| p.size() == 364 && p.duration == 1024));
        assert_eq!(out[2].data()[0], 3);

        assert_eq!(out[0].new_extradata(), Some(&[0x12, 0x10][..]));
        assert!(out[1].new_extradata().is_none());
        assert_eq!(bsf.codecpar_out().extradata, vec![0x12, 0x10]);
        Ok(())
    }

    #[test]
    fn split_frame_waits_for_second_send() -> anyhow::Result<()> {
        let mut bsf = filter()?;
        let data = [frame(1), frame(2)].concat();
        // Cut inside the second frame's header.
        let (a, b) = data.split_at(371 + 3);

        bsf.send_packet(packet(a.to_vec(), 0))?;
        assert_eq!(drain(&mut bsf).len(), 1);

        bsf.send_packet(packet(b.to_vec(), 5000))?;
        let out = drain(&mut bsf);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data(), &frame(2)[7..]);
        // Timing comes from the packet the frame started in.
        assert_eq!(out[0].pts, 1024);
        assert_eq!(out[0].duration, 1024);
        Ok(())
    }

    #[test]
    fn half_a_frame_is_held_back() -> anyhow::Result<()> {
        let mut bsf = Adts2Raw::default();
        bsf.init(&CodecParameters::audio(CodecId::Aac, 44100, 2), Rational::new(1, 90_000))?;

        let config = AudioSpecificConfig::parse(&[0x12, 0x10])?;
        let mut frame = write_adts_header(&config, 3)?.to_vec();
        // two raw data blocks
        frame[6] |= 1;
        frame.extend_from_slice(&[0xA1, 0xA2, 0xA3]);
        assert_eq!(frame.len(), 10);

        bsf.send_packet(packet(frame[..5].to_vec(), 900))?;
        assert!(bsf.receive_packet().is_err_and(|e| e.is_eof()));

        bsf.send_packet(packet(frame[5..].to_vec(), 5000))?;
        let out = drain(&mut bsf);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data(), &[0xA1, 0xA2, 0xA3]);
        assert_eq!(out[0].pts, 900);
        // 2048 samples at 44.1 kHz in 1/90000
        assert_eq!(out[0].duration, 4180);
        Ok(())
    }

    #[test]
    fn resyncs_over_garbage() -> anyhow::Result<()> {
        let mut bsf = filter()?;
        let data = [vec![0x00, 0x12, 0xFF, 0x00], frame(1)].concat();
        bsf.send_packet(packet(data, 0))?;
        assert_eq!(drain(&mut bsf).len(), 1);

        let err = bsf.send_packet(packet(vec![0x11; 64], 0)).unwrap_err();
        assert!(matches!(err, FormatError::DataInvalid(_)));
        Ok(())
    }

    #[test]
    fn reset_then_refeed_is_identical() -> anyhow::Result<()> {
        let mut bsf = filter()?;
        let data = [frame(1), frame(2)].concat();
        let (a, b) = data.split_at(500);

        let run = |bsf: &mut Adts2Raw| -> anyhow::Result<Vec<(Vec<u8>, i64)>> {
            bsf.send_packet(packet(a.to_vec(), 0))?;
            bsf.send_packet(packet(b.to_vec(), 1024))?;
            Ok(drain(bsf)
                .into_iter()
                .map(|p| (p.data().to_vec(), p.pts))
                .collect())
        };

        let first = run(&mut bsf)?;
        // Leave a partial frame behind before resetting.
        bsf.send_packet(packet(a.to_vec(), 0))?;
        bsf.reset();
        let second = run(&mut bsf)?;
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        Ok(())
    }
}
