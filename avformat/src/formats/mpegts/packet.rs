//! Transport packet and PES header parsing.

use crate::process::timestamp::{TS_DVHS_PACKET_SIZE, TS_PACKET_SIZE};
use crate::structs::rational::NOPTS_VALUE;
use crate::utils::errors::FormatError;

pub const SYNC_BYTE: u8 = 0x47;
pub const PID_PAT: u16 = 0x0000;
pub const PID_NULL: u16 = 0x1FFF;

/// Timestamps are 33-bit counters.
pub const TIMESTAMP_WRAP: i64 = 1 << 33;

/// Bytes in front of the sync byte: the 4-byte arrival timestamp of
/// 192-byte packets.
pub fn sync_offset(packet_size: usize) -> usize {
    if packet_size == TS_DVHS_PACKET_SIZE { 4 } else { 0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdaptationField {
    pub discontinuity: bool,
    pub random_access: bool,
    /// 27 MHz program clock reference.
    pub pcr: Option<i64>,
}

impl AdaptationField {
    fn parse(data: &[u8]) -> Self {
        let flags = data[0];
        let pcr = match data {
            [_, b1, b2, b3, b4, b5, b6, ..] if flags & 0x10 != 0 => {
                let base = (*b1 as i64) << 25
                    | (*b2 as i64) << 17
                    | (*b3 as i64) << 9
                    | (*b4 as i64) << 1
                    | (*b5 as i64) >> 7;
                let ext = ((*b5 as i64 & 1) << 8) | *b6 as i64;
                Some(base * 300 + ext)
            }
            _ => None,
        };
        Self {
            discontinuity: flags & 0x80 != 0,
            random_access: flags & 0x40 != 0,
            pcr,
        }
    }

    /// Flags byte and PCR, without the leading length byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut flags = 0;
        if self.discontinuity {
            flags |= 0x80;
        }
        if self.random_access {
            flags |= 0x40;
        }
        let Some(pcr) = self.pcr else {
            return vec![flags];
        };
        let (base, ext) = (pcr / 300, pcr % 300);
        vec![
            flags | 0x10,
            (base >> 25) as u8,
            (base >> 17) as u8,
            (base >> 9) as u8,
            (base >> 1) as u8,
            ((base & 1) as u8) << 7 | 0x7E | (ext >> 8) as u8,
            ext as u8,
        ]
    }
}

/// One 188-byte transport packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsPacket<'a> {
    pub transport_error: bool,
    pub payload_unit_start: bool,
    pub pid: u16,
    pub scrambling: u8,
    pub continuity: u8,
    pub has_payload: bool,
    pub adaptation: Option<AdaptationField>,
    pub payload: &'a [u8],
}

impl<'a> TsPacket<'a> {
    /// Parses a packet starting at its sync byte.
    pub fn parse(data: &'a [u8]) -> Result<Self, FormatError> {
        if data.len() < TS_PACKET_SIZE || data[0] != SYNC_BYTE {
            return Err(FormatError::invalid("mpegts: packet does not start with a sync byte"));
        }
        let control = (data[3] >> 4) & 0x3;
        let mut start = 4;
        let mut adaptation = None;
        if control & 0x2 != 0 {
            let len = data[4] as usize;
            if 5 + len > TS_PACKET_SIZE {
                return Err(FormatError::invalid(format!(
                    "mpegts: adaptation field of {len} bytes"
                )));
            }
            if len > 0 {
                adaptation = Some(AdaptationField::parse(&data[5..5 + len]));
            }
            start = 5 + len;
        }
        let has_payload = control & 0x1 != 0;

        Ok(Self {
            transport_error: data[1] & 0x80 != 0,
            payload_unit_start: data[1] & 0x40 != 0,
            pid: u16::from_be_bytes([data[1] & 0x1F, data[2]]),
            scrambling: data[3] >> 6,
            continuity: data[3] & 0x0F,
            has_payload,
            adaptation,
            payload: if has_payload { &data[start..TS_PACKET_SIZE] } else { &[] },
        })
    }

    pub fn random_access(&self) -> bool {
        self.adaptation.is_some_and(|a| a.random_access)
    }

    pub fn discontinuity(&self) -> bool {
        self.adaptation.is_some_and(|a| a.discontinuity)
    }
}

/// Stream ids whose PES packets carry no optional header.
fn has_optional_header(stream_id: u8) -> bool {
    !matches!(stream_id, 0xBC | 0xBE | 0xBF | 0xF0 | 0xF1 | 0xF2 | 0xF8 | 0xFF)
}

/// Reads a 5-byte PTS/DTS field.
pub fn read_timestamp(b: &[u8]) -> i64 {
    (((b[0] as i64) >> 1) & 0x07) << 30
        | (b[1] as i64) << 22
        | ((b[2] as i64) >> 1) << 15
        | (b[3] as i64) << 7
        | (b[4] as i64) >> 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesHeader {
    pub stream_id: u8,
    /// Whole PES packet length including the 6-byte prefix, 0 when unbounded.
    pub packet_length: usize,
    /// Offset of the payload.
    pub header_len: usize,
    pub pts: i64,
    pub dts: i64,
}

impl PesHeader {
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < 6 || data[..3] != [0, 0, 1] {
            return Err(FormatError::invalid("mpegts: missing PES start code"));
        }
        let stream_id = data[3];
        let length = u16::from_be_bytes([data[4], data[5]]) as usize;
        let mut header = Self {
            stream_id,
            packet_length: if length == 0 { 0 } else { length + 6 },
            header_len: 6,
            pts: NOPTS_VALUE,
            dts: NOPTS_VALUE,
        };
        if !has_optional_header(stream_id) {
            return Ok(header);
        }

        if data.len() < 9 {
            return Err(FormatError::invalid("mpegts: truncated PES header"));
        }
        let flags = data[7];
        header.header_len = 9 + data[8] as usize;
        if data.len() < header.header_len {
            return Err(FormatError::invalid(format!(
                "mpegts: PES header of {} bytes in {} bytes",
                header.header_len,
                data.len()
            )));
        }
        if flags & 0x80 != 0 && header.header_len >= 14 {
            header.pts = read_timestamp(&data[9..14]);
            if flags & 0x40 != 0 && header.header_len >= 19 {
                header.dts = read_timestamp(&data[14..19]);
            }
        }
        Ok(header)
    }
}

/// Moves `ts` by whole wrap periods to the value closest to `reference`.
pub fn unwrap_timestamp(reference: i64, ts: i64) -> i64 {
    if reference == NOPTS_VALUE || ts == NOPTS_VALUE {
        return ts;
    }
    let periods = (reference - ts + TIMESTAMP_WRAP / 2).div_euclid(TIMESTAMP_WRAP);
    ts + periods * TIMESTAMP_WRAP
}

/// Encodes a 33-bit PES timestamp behind a 4-bit `marker` prefix.
pub fn write_timestamp(marker: u8, ts: i64) -> [u8; 5] {
    [
        (marker << 4) | (((ts >> 30) & 0x07) as u8) << 1 | 1,
        (ts >> 22) as u8,
        (((ts >> 15) & 0x7F) as u8) << 1 | 1,
        (ts >> 7) as u8,
        ((ts & 0x7F) as u8) << 1 | 1,
    ]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// PES packet with a PTS and an optional DTS.
    pub(crate) fn pes(stream_id: u8, pts: i64, dts: Option<i64>, payload: &[u8]) -> Vec<u8> {
        let mut fields = write_timestamp(if dts.is_some() { 3 } else { 2 }, pts).to_vec();
        let mut flags = 0x80;
        if let Some(dts) = dts {
            fields.extend_from_slice(&write_timestamp(1, dts));
            flags |= 0x40;
        }
        let length = 3 + fields.len() + payload.len();
        let mut out = vec![0, 0, 1, stream_id];
        out.extend_from_slice(&(length as u16).to_be_bytes());
        out.extend_from_slice(&[0x80, flags, fields.len() as u8]);
        out.extend_from_slice(&fields);
        out.extend_from_slice(payload);
        out
    }

    /// 188-byte packets carrying `payload`, padded with adaptation stuffing.
    pub(crate) fn ts_packets(pid: u16, payload: &[u8], random_access: bool, cc: &mut u8) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, chunk) in payload.chunks(170).enumerate() {
            let first = i == 0;
            let mut packet = vec![SYNC_BYTE, ((pid >> 8) as u8) & 0x1F, pid as u8, 0x30 | (*cc & 0x0F)];
            if first {
                packet[1] |= 0x40;
            }
            *cc = cc.wrapping_add(1);
            let stuffing = TS_PACKET_SIZE - 4 - chunk.len();
            let mut adaptation = vec![(stuffing - 1) as u8];
            if stuffing > 1 {
                adaptation.push(if first && random_access { 0x40 } else { 0 });
                adaptation.resize(stuffing, 0xFF);
            }
            packet.extend_from_slice(&adaptation);
            packet.extend_from_slice(chunk);
            out.extend_from_slice(&packet);
        }
        out
    }

    #[test]
    fn packet_header_fields() -> anyhow::Result<()> {
        let mut cc = 5;
        let data = ts_packets(0x100, &[0xAA; 10], true, &mut cc);
        assert_eq!(data.len(), TS_PACKET_SIZE);
        let packet = TsPacket::parse(&data)?;
        assert_eq!(packet.pid, 0x100);
        assert!(packet.payload_unit_start);
        assert_eq!(packet.continuity, 5);
        assert!(packet.random_access());
        assert_eq!(packet.payload, &[0xAA; 10]);
        assert_eq!(cc, 6);

        let mut bad = data.clone();
        bad[0] = 0;
        assert!(TsPacket::parse(&bad).is_err());
        Ok(())
    }

    #[test]
    fn pcr_from_adaptation_field() {
        let field = AdaptationField::parse(&[0x10, 0, 0, 0, 1, 0x80, 0x05]);
        assert_eq!(field.pcr, Some(3 * 300 + 5));

        let field = AdaptationField {
            random_access: true,
            pcr: Some(0x1_2345_6789 * 300 + 299),
            ..Default::default()
        };
        let bytes = field.to_bytes();
        assert_eq!(bytes.len(), 7);
        assert_eq!(AdaptationField::parse(&bytes), field);
        assert_eq!(AdaptationField::default().to_bytes(), vec![0]);
    }

    #[test]
    fn pes_timestamps() -> anyhow::Result<()> {
        let data = pes(0xE0, 0x1_2345_6789, Some(900), b"xy");
        let header = PesHeader::parse(&data)?;
        assert_eq!(header.pts, 0x1_2345_6789);
        assert_eq!(header.dts, 900);
        assert_eq!(&data[header.header_len..], b"xy");
        assert_eq!(header.packet_length, data.len());

        assert!(PesHeader::parse(&[0, 0, 2, 0xE0, 0, 0]).is_err());
        Ok(())
    }

    #[test]
    fn wrapped_timestamps() {
        assert_eq!(unwrap_timestamp(TIMESTAMP_WRAP - 10, 5), TIMESTAMP_WRAP + 5);
        assert_eq!(unwrap_timestamp(100, 90), 90);
        assert_eq!(unwrap_timestamp(NOPTS_VALUE, 90), 90);
    }
}
