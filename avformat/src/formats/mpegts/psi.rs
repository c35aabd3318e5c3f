//! Program specific information: section reassembly, PAT and PMT.

use crate::structs::stream::CodecId;
use crate::utils::crc::MPEG2_CRC;
use crate::utils::errors::FormatError;

pub const TABLE_PAT: u8 = 0x00;
pub const TABLE_PMT: u8 = 0x02;
pub const TABLE_SDT: u8 = 0x42;

/// Largest private section, header included.
const MAX_SECTION_SIZE: usize = 4096 + 3;

pub const STREAM_TYPE_MPEG1_VIDEO: u8 = 0x01;
pub const STREAM_TYPE_MPEG2_VIDEO: u8 = 0x02;
pub const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
pub const STREAM_TYPE_MPEG2_AUDIO: u8 = 0x04;
pub const STREAM_TYPE_PRIVATE_DATA: u8 = 0x06;
pub const STREAM_TYPE_MPEG4_VIDEO: u8 = 0x10;
pub const STREAM_TYPE_AAC: u8 = 0x0F;
pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const STREAM_TYPE_HEVC: u8 = 0x24;
pub const STREAM_TYPE_VVC: u8 = 0x33;
pub const STREAM_TYPE_AC3: u8 = 0x81;
pub const STREAM_TYPE_EAC3: u8 = 0x87;

pub const DESC_REGISTRATION: u8 = 0x05;
pub const DESC_LANGUAGE: u8 = 0x0A;
pub const DESC_AC3: u8 = 0x6A;
pub const DESC_EAC3: u8 = 0x7A;
pub const DESC_EXTENSION: u8 = 0x7F;
pub const DESC_EXT_OPUS: u8 = 0x80;

/// Collects the sections carried on one PID.
#[derive(Debug, Clone, Default)]
pub struct SectionAssembler {
    buffer: Vec<u8>,
    started: bool,
}

impl SectionAssembler {
    /// Feeds one packet payload and returns the sections it completed.
    pub fn push(&mut self, unit_start: bool, payload: &[u8]) -> Vec<Vec<u8>> {
        let mut sections = Vec::new();
        if unit_start {
            let Some((&pointer, rest)) = payload.split_first() else {
                return sections;
            };
            let pointer = pointer as usize;
            if pointer > rest.len() {
                log::warn!("mpegts: section pointer {pointer} past the payload");
                self.reset();
                return sections;
            }
            if self.started {
                self.buffer.extend_from_slice(&rest[..pointer]);
                self.drain(&mut sections);
            }
            self.buffer.clear();
            self.buffer.extend_from_slice(&rest[pointer..]);
            self.started = true;
        } else if self.started {
            self.buffer.extend_from_slice(payload);
        } else {
            return sections;
        }
        self.drain(&mut sections);
        sections
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.started = false;
    }

    fn drain(&mut self, out: &mut Vec<Vec<u8>>) {
        loop {
            match self.buffer.first() {
                None => {
                    self.started = false;
                    return;
                }
                // Stuffing up to the end of the packet.
                Some(&0xFF) => {
                    self.reset();
                    return;
                }
                _ => {}
            }
            if self.buffer.len() < 3 {
                return;
            }
            let len = (u16::from_be_bytes([self.buffer[1] & 0x0F, self.buffer[2]]) as usize) + 3;
            if len > MAX_SECTION_SIZE {
                log::warn!("mpegts: section of {len} bytes dropped");
                self.reset();
                return;
            }
            if self.buffer.len() < len {
                return;
            }
            out.push(self.buffer.drain(..len).collect());
        }
    }
}

/// Checks the CRC-32 trailing a long-form section.
pub fn section_crc_ok(section: &[u8]) -> bool {
    section.len() >= 12 && MPEG2_CRC.checksum(section) == 0
}

/// Fixed header of a long-form section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LongHeader {
    id: u16,
    version: u8,
    current: bool,
}

fn long_header(section: &[u8], table_id: u8) -> Result<LongHeader, FormatError> {
    if section.len() < 12 {
        return Err(FormatError::invalid(format!(
            "mpegts: section of {} bytes",
            section.len()
        )));
    }
    if section[0] != table_id {
        return Err(FormatError::invalid(format!(
            "mpegts: table id {:#04x}, expected {table_id:#04x}",
            section[0]
        )));
    }
    if section[1] & 0x80 == 0 {
        return Err(FormatError::invalid("mpegts: section syntax indicator not set"));
    }
    Ok(LongHeader {
        id: u16::from_be_bytes([section[3], section[4]]),
        version: (section[5] >> 1) & 0x1F,
        current: section[5] & 1 != 0,
    })
}

/// `(program_number, pmt_pid)` pairs of a PAT, the network PID excluded.
pub fn parse_pat(section: &[u8]) -> Result<Vec<(u16, u16)>, FormatError> {
    let header = long_header(section, TABLE_PAT)?;
    log::trace!("PAT transport stream id {}, version {}", header.id, header.version);
    let body = &section[8..section.len() - 4];
    Ok(body
        .chunks_exact(4)
        .map(|e| {
            (
                u16::from_be_bytes([e[0], e[1]]),
                u16::from_be_bytes([e[2] & 0x1F, e[3]]),
            )
        })
        .filter(|&(program, _)| program != 0)
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub tag: u8,
    pub data: Vec<u8>,
}

fn parse_descriptors(mut data: &[u8]) -> Vec<Descriptor> {
    let mut out = Vec::new();
    while data.len() >= 2 {
        let len = data[1] as usize;
        if 2 + len > data.len() {
            log::warn!("mpegts: descriptor {:#04x} overruns its loop", data[0]);
            break;
        }
        out.push(Descriptor {
            tag: data[0],
            data: data[2..2 + len].to_vec(),
        });
        data = &data[2 + len..];
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: u8,
    pub pid: u16,
    pub descriptors: Vec<Descriptor>,
}

impl PmtStream {
    fn descriptor(&self, tag: u8) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.tag == tag)
    }

    fn registration(&self) -> Option<&[u8]> {
        self.descriptor(DESC_REGISTRATION)
            .filter(|d| d.data.len() >= 4)
            .map(|d| &d.data[..4])
    }

    /// ISO 639 language code.
    pub fn language(&self) -> Option<String> {
        let d = self.descriptor(DESC_LANGUAGE).filter(|d| d.data.len() >= 3)?;
        let code = String::from_utf8_lossy(&d.data[..3]).trim_end_matches('\0').to_string();
        (!code.is_empty()).then_some(code)
    }

    /// Opus channel count from the extension descriptor.
    pub fn opus_channels(&self) -> Option<u32> {
        let d = self
            .descriptors
            .iter()
            .find(|d| d.tag == DESC_EXTENSION && d.data.first() == Some(&DESC_EXT_OPUS))?;
        match d.data.get(1).copied()? {
            0 | 0x80 => Some(2),
            code @ 1..=8 => Some(code as u32),
            code => {
                log::warn!("mpegts: unsupported opus channel config {code:#04x}");
                None
            }
        }
    }

    pub fn codec_id(&self, program_registration: Option<&[u8]>) -> CodecId {
        match self.stream_type {
            STREAM_TYPE_PRIVATE_DATA => {
                match self.registration().or(program_registration) {
                    Some(b"Opus") => return CodecId::Opus,
                    Some(b"AC-3") => return CodecId::Ac3,
                    Some(b"EAC3") => return CodecId::Eac3,
                    _ => {}
                }
                if self.descriptor(DESC_AC3).is_some() {
                    CodecId::Ac3
                } else if self.descriptor(DESC_EAC3).is_some() {
                    CodecId::Eac3
                } else {
                    CodecId::None
                }
            }
            stream_type => stream_type_codec(stream_type),
        }
    }
}

/// Codec of an ISO 13818-1 stream type that needs no descriptor.
pub fn stream_type_codec(stream_type: u8) -> CodecId {
    match stream_type {
        STREAM_TYPE_MPEG1_VIDEO | STREAM_TYPE_MPEG2_VIDEO => CodecId::Mpeg2Video,
        STREAM_TYPE_MPEG1_AUDIO | STREAM_TYPE_MPEG2_AUDIO => CodecId::Mp3,
        STREAM_TYPE_AAC => CodecId::Aac,
        STREAM_TYPE_MPEG4_VIDEO => CodecId::Mpeg4,
        STREAM_TYPE_H264 => CodecId::H264,
        STREAM_TYPE_HEVC => CodecId::Hevc,
        STREAM_TYPE_VVC => CodecId::Vvc,
        STREAM_TYPE_AC3 => CodecId::Ac3,
        STREAM_TYPE_EAC3 => CodecId::Eac3,
        _ => CodecId::None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pmt {
    pub program: u16,
    pub version: u8,
    pub pcr_pid: u16,
    pub descriptors: Vec<Descriptor>,
    pub streams: Vec<PmtStream>,
}

impl Pmt {
    pub fn registration(&self) -> Option<&[u8]> {
        self.descriptors
            .iter()
            .find(|d| d.tag == DESC_REGISTRATION && d.data.len() >= 4)
            .map(|d| &d.data[..4])
    }
}

pub fn parse_pmt(section: &[u8]) -> Result<Pmt, FormatError> {
    let header = long_header(section, TABLE_PMT)?;
    if !header.current {
        return Err(FormatError::unsupported("mpegts: PMT not yet applicable"));
    }
    let end = section.len() - 4;
    let pcr_pid = u16::from_be_bytes([section[8] & 0x1F, section[9]]);
    let info_len = u16::from_be_bytes([section[10] & 0x0F, section[11]]) as usize;
    let mut pos = 12 + info_len;
    if pos > end {
        return Err(FormatError::invalid("mpegts: PMT program info overruns the section"));
    }
    let descriptors = parse_descriptors(&section[12..pos]);

    let mut streams = Vec::new();
    while pos + 5 <= end {
        let stream_type = section[pos];
        let pid = u16::from_be_bytes([section[pos + 1] & 0x1F, section[pos + 2]]);
        let es_len = u16::from_be_bytes([section[pos + 3] & 0x0F, section[pos + 4]]) as usize;
        pos += 5;
        if pos + es_len > end {
            return Err(FormatError::invalid(format!(
                "mpegts: ES info of pid {pid:#x} overruns the PMT"
            )));
        }
        streams.push(PmtStream {
            stream_type,
            pid,
            descriptors: parse_descriptors(&section[pos..pos + es_len]),
        });
        pos += es_len;
    }

    Ok(Pmt {
        program: header.id,
        version: header.version,
        pcr_pid,
        descriptors,
        streams,
    })
}

fn write_descriptors(out: &mut Vec<u8>, descriptors: &[Descriptor]) {
    let len_at = out.len();
    out.extend_from_slice(&[0, 0]);
    for d in descriptors {
        out.push(d.tag);
        out.push(d.data.len() as u8);
        out.extend_from_slice(&d.data);
    }
    let len = (out.len() - len_at - 2) as u16;
    out[len_at..len_at + 2].copy_from_slice(&(0xF000 | len).to_be_bytes());
}

/// Completes a long-form section started with `table_id`, `id` and
/// version 0: fills in the section length and appends the CRC-32.
fn finish_section(table_id: u8, id: u16, body: &[u8]) -> Vec<u8> {
    let len = 5 + body.len() + 4;
    let mut section = Vec::with_capacity(3 + len);
    section.push(table_id);
    section.extend_from_slice(&(0xB000 | len as u16).to_be_bytes());
    section.extend_from_slice(&id.to_be_bytes());
    section.extend_from_slice(&[0xC1, 0, 0]);
    section.extend_from_slice(body);
    let crc = MPEG2_CRC.checksum(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

/// PAT mapping each program number to its PMT PID.
pub fn pat_section(transport_stream_id: u16, programs: &[(u16, u16)]) -> Vec<u8> {
    let mut body = Vec::with_capacity(programs.len() * 4);
    for (program, pmt_pid) in programs {
        body.extend_from_slice(&program.to_be_bytes());
        body.extend_from_slice(&(0xE000 | pmt_pid).to_be_bytes());
    }
    finish_section(TABLE_PAT, transport_stream_id, &body)
}

/// SDT describing service 1 of `transport_stream_id` as a digital
/// television service.
pub fn sdt_section(transport_stream_id: u16, provider: &str, service: &str) -> Vec<u8> {
    // original_network_id, reserved
    let mut body = vec![0xFF, 0x01, 0xFF];
    body.extend_from_slice(&1u16.to_be_bytes());
    // no EIT
    body.push(0xFC);

    let mut descriptor = vec![0x01, provider.len() as u8];
    descriptor.extend_from_slice(provider.as_bytes());
    descriptor.push(service.len() as u8);
    descriptor.extend_from_slice(service.as_bytes());

    // running status 4, not scrambled
    let loop_len = 2 + descriptor.len() as u16;
    body.extend_from_slice(&((4 << 13) | loop_len).to_be_bytes());
    body.push(0x48);
    body.push(descriptor.len() as u8);
    body.extend_from_slice(&descriptor);
    finish_section(TABLE_SDT, transport_stream_id, &body)
}

impl Pmt {
    /// Serializes the table as a version 0 section.
    pub fn to_section(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(0xE000 | self.pcr_pid).to_be_bytes());
        write_descriptors(&mut body, &self.descriptors);
        for es in &self.streams {
            body.push(es.stream_type);
            body.extend_from_slice(&(0xE000 | es.pid).to_be_bytes());
            write_descriptors(&mut body, &es.descriptors);
        }
        finish_section(TABLE_PMT, self.program, &body)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn with_crc(mut section: Vec<u8>) -> Vec<u8> {
        let len = section.len() + 4 - 3;
        section[1] = 0xB0 | ((len >> 8) as u8 & 0x0F);
        section[2] = len as u8;
        let crc = MPEG2_CRC.checksum(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    pub(crate) fn pat(program: u16, pmt_pid: u16) -> Vec<u8> {
        let mut s = vec![TABLE_PAT, 0, 0, 0, 1, 0xC1, 0, 0];
        s.extend_from_slice(&[0, 0, 0xE0, 0x10]);
        s.extend_from_slice(&program.to_be_bytes());
        s.extend_from_slice(&(0xE000 | pmt_pid).to_be_bytes());
        with_crc(s)
    }

    /// PMT listing `(stream_type, pid, descriptors)`.
    pub(crate) fn pmt(program: u16, version: u8, pcr_pid: u16, streams: &[(u8, u16, Vec<u8>)]) -> Vec<u8> {
        let mut s = vec![TABLE_PMT, 0, 0];
        s.extend_from_slice(&program.to_be_bytes());
        s.push(0xC1 | (version << 1));
        s.extend_from_slice(&[0, 0]);
        s.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());
        s.extend_from_slice(&[0xF0, 0]);
        for (stream_type, pid, descriptors) in streams {
            s.push(*stream_type);
            s.extend_from_slice(&(0xE000 | pid).to_be_bytes());
            s.extend_from_slice(&(0xF000 | descriptors.len() as u16).to_be_bytes());
            s.extend_from_slice(descriptors);
        }
        with_crc(s)
    }

    #[test]
    fn pat_entries() -> anyhow::Result<()> {
        let section = pat(1, 0x1000);
        assert!(section_crc_ok(&section));
        assert_eq!(parse_pat(&section)?, vec![(1, 0x1000)]);

        let mut broken = section.clone();
        broken[9] ^= 1;
        assert!(!section_crc_ok(&broken));
        assert!(parse_pmt(&section).is_err());
        Ok(())
    }

    #[test]
    fn pmt_streams_and_codecs() -> anyhow::Result<()> {
        let opus = [DESC_REGISTRATION, 4, b'O', b'p', b'u', b's', DESC_EXTENSION, 2, 0x80, 6].to_vec();
        let lang = [DESC_LANGUAGE, 4, b'e', b'n', b'g', 0].to_vec();
        let section = pmt(
            1,
            3,
            0x100,
            &[(0x1B, 0x100, Vec::new()), (0x0F, 0x101, lang), (0x06, 0x102, opus), (0x06, 0x103, vec![DESC_AC3, 0])],
        );
        let pmt = parse_pmt(&section)?;
        assert_eq!(pmt.program, 1);
        assert_eq!(pmt.version, 3);
        assert_eq!(pmt.pcr_pid, 0x100);

        let codecs: Vec<_> = pmt.streams.iter().map(|s| s.codec_id(None)).collect();
        assert_eq!(codecs, vec![CodecId::H264, CodecId::Aac, CodecId::Opus, CodecId::Ac3]);
        assert_eq!(pmt.streams[1].language().as_deref(), Some("eng"));
        assert_eq!(pmt.streams[2].opus_channels(), Some(6));
        Ok(())
    }

    #[test]
    fn sections_across_packets() {
        let section = pat(1, 0x1000);
        let mut assembler = SectionAssembler::default();

        // Continuation before a PUSI is ignored.
        assert!(assembler.push(false, &section).is_empty());

        let mut first = vec![0];
        first.extend_from_slice(&section[..10]);
        assert!(assembler.push(true, &first).is_empty());
        let mut rest = section[10..].to_vec();
        rest.extend_from_slice(&[0xFF; 8]);
        assert_eq!(assembler.push(false, &rest), vec![section.clone()]);

        // Two sections in one payload behind a pointer field.
        let mut both = vec![2, 0xAA, 0xBB];
        both.extend_from_slice(&section);
        both.extend_from_slice(&section);
        both.push(0xFF);
        assert_eq!(assembler.push(true, &both), vec![section.clone(), section]);
    }

    #[test]
    fn written_tables_parse_back() -> anyhow::Result<()> {
        let section = pat_section(1, &[(1, 0x1000)]);
        assert!(section_crc_ok(&section));
        assert_eq!(parse_pat(&section)?, vec![(1, 0x1000)]);

        let table = Pmt {
            program: 1,
            version: 0,
            pcr_pid: 0x100,
            descriptors: Vec::new(),
            streams: vec![
                PmtStream { stream_type: STREAM_TYPE_H264, pid: 0x100, descriptors: Vec::new() },
                PmtStream {
                    stream_type: STREAM_TYPE_PRIVATE_DATA,
                    pid: 0x101,
                    descriptors: vec![
                        Descriptor { tag: DESC_REGISTRATION, data: b"Opus".to_vec() },
                        Descriptor { tag: DESC_EXTENSION, data: vec![DESC_EXT_OPUS, 2] },
                    ],
                },
            ],
        };
        let section = table.to_section();
        assert!(section_crc_ok(&section));
        assert_eq!(parse_pmt(&section)?, table);

        let sdt = sdt_section(1, "avmux", "Service01");
        assert!(section_crc_ok(&sdt));
        assert_eq!(sdt[0], TABLE_SDT);
        assert_eq!(u16::from_be_bytes([sdt[1] & 0x0F, sdt[2]]) as usize, sdt.len() - 3);
        Ok(())
    }
}
