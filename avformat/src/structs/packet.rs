//! Coded data unit exchanged between demuxers, filters and muxers.

use std::sync::Arc;

use bitflags::bitflags;

use super::encryption::{EncryptionInfo, EncryptionInitInfo};
use super::rational::{NOPTS_VALUE, Rational, rescale};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u32 {
        /// Packet starts a random access point.
        const KEY = 0x0001;
        /// Packet content is known to be damaged.
        const CORRUPT = 0x0002;
        /// Packet is required for decoding but should not be output.
        const DISCARD = 0x0004;
        /// Last packet of a stream or fragment.
        const END = 0x0008;
    }
}

/// NAL unit delimiting of a packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitFormat {
    /// Length-prefixed NAL units (`avcC`/`hvcC`/`vvcC` style).
    Avcc,
    /// Start-code delimited NAL units.
    AnnexB,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideDataKind {
    NewExtradata,
    EncryptionInfo,
    EncryptionInitInfo,
    Palette,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideData {
    NewExtradata(Vec<u8>),
    EncryptionInfo(EncryptionInfo),
    EncryptionInitInfo(Vec<EncryptionInitInfo>),
    Palette(Vec<u8>),
}

impl SideData {
    pub fn kind(&self) -> SideDataKind {
        match self {
            SideData::NewExtradata(_) => SideDataKind::NewExtradata,
            SideData::EncryptionInfo(_) => SideDataKind::EncryptionInfo,
            SideData::EncryptionInitInfo(_) => SideDataKind::EncryptionInitInfo,
            SideData::Palette(_) => SideDataKind::Palette,
        }
    }
}

#[derive(Debug, Clone)]
enum Buffer {
    Owned(Vec<u8>),
    Shared(Arc<[u8]>),
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::Owned(Vec::new())
    }
}

/// A coded packet.
///
/// Timestamps are expressed in the time base of the stream the packet belongs
/// to. A buffer that has been [shared](Packet::share) is never written through;
/// [`Packet::data_mut`] copies it first.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: Buffer,
    pub stream_index: usize,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    /// Byte offset in the source, -1 when unknown.
    pub pos: i64,
    pub flags: PacketFlags,
    pub bit_format: Option<BitFormat>,
    side_data: Vec<SideData>,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            buf: Buffer::default(),
            stream_index: 0,
            pts: NOPTS_VALUE,
            dts: NOPTS_VALUE,
            duration: 0,
            pos: -1,
            flags: PacketFlags::empty(),
            bit_format: None,
            side_data: Vec::new(),
        }
    }
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            buf: Buffer::Owned(data),
            ..Self::default()
        }
    }

    pub fn from_shared(data: Arc<[u8]>) -> Self {
        Self {
            buf: Buffer::Shared(data),
            ..Self::default()
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.buf {
            Buffer::Owned(v) => v,
            Buffer::Shared(a) => a,
        }
    }

    pub fn size(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Mutable access, copying a shared buffer first.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        if let Buffer::Shared(a) = &self.buf {
            self.buf = Buffer::Owned(a.to_vec());
        }
        match &mut self.buf {
            Buffer::Owned(v) => v,
            Buffer::Shared(_) => unreachable!("shared buffer was converted above"),
        }
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.buf = Buffer::Owned(data);
    }

    /// Takes the payload out, leaving the packet empty.
    pub fn take_data(&mut self) -> Vec<u8> {
        match std::mem::take(&mut self.buf) {
            Buffer::Owned(v) => v,
            Buffer::Shared(a) => a.to_vec(),
        }
    }

    /// Freezes the payload into a refcounted buffer and returns a handle to it.
    pub fn share(&mut self) -> Arc<[u8]> {
        if let Buffer::Owned(v) = &mut self.buf {
            let shared: Arc<[u8]> = Arc::from(std::mem::take(v));
            self.buf = Buffer::Shared(shared);
        }
        match &self.buf {
            Buffer::Shared(a) => Arc::clone(a),
            Buffer::Owned(_) => unreachable!("owned buffer was converted above"),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.buf, Buffer::Shared(_))
    }

    pub fn is_key(&self) -> bool {
        self.flags.contains(PacketFlags::KEY)
    }

    pub fn side_data(&self, kind: SideDataKind) -> Option<&SideData> {
        self.side_data.iter().find(|s| s.kind() == kind)
    }

    pub fn side_data_list(&self) -> &[SideData] {
        &self.side_data
    }

    pub fn new_extradata(&self) -> Option<&[u8]> {
        match self.side_data(SideDataKind::NewExtradata) {
            Some(SideData::NewExtradata(data)) => Some(data),
            _ => None,
        }
    }

    pub fn encryption_info(&self) -> Option<&EncryptionInfo> {
        match self.side_data(SideDataKind::EncryptionInfo) {
            Some(SideData::EncryptionInfo(info)) => Some(info),
            _ => None,
        }
    }

    /// Adds side data, replacing any entry of the same kind.
    pub fn add_side_data(&mut self, data: SideData) {
        let kind = data.kind();
        self.side_data.retain(|s| s.kind() != kind);
        self.side_data.push(data);
    }

    pub fn take_side_data(&mut self, kind: SideDataKind) -> Option<SideData> {
        let index = self.side_data.iter().position(|s| s.kind() == kind)?;
        Some(self.side_data.remove(index))
    }

    /// Copies timing, position, flags and side data from `other`.
    pub fn copy_props(&mut self, other: &Packet) {
        self.stream_index = other.stream_index;
        self.pts = other.pts;
        self.dts = other.dts;
        self.duration = other.duration;
        self.pos = other.pos;
        self.flags = other.flags;
        self.bit_format = other.bit_format;
        self.side_data = other.side_data.clone();
    }

    pub fn rescale_ts(&mut self, from: Rational, to: Rational) {
        if from == to {
            return;
        }
        self.pts = rescale(self.pts, from, to);
        self.dts = rescale(self.dts, from, to);
        if self.duration > 0 {
            self.duration = rescale(self.duration, from, to);
        }
    }

    /// Clears everything but keeps an owned allocation for reuse.
    pub fn reset(&mut self) {
        match &mut self.buf {
            Buffer::Owned(v) => v.clear(),
            Buffer::Shared(_) => self.buf = Buffer::default(),
        }
        self.stream_index = 0;
        self.pts = NOPTS_VALUE;
        self.dts = NOPTS_VALUE;
        self.duration = 0;
        self.pos = -1;
        self.flags = PacketFlags::empty();
        self.bit_format = None;
        self.side_data.clear();
    }

    /// Capacity of the owned allocation, used by the pool.
    pub(crate) fn capacity(&self) -> usize {
        match &self.buf {
            Buffer::Owned(v) => v.capacity(),
            Buffer::Shared(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_buffer_is_copied_on_write() {
        let mut packet = Packet::from_vec(vec![1, 2, 3]);
        let handle = packet.share();
        assert!(packet.is_shared());

        packet.data_mut()[0] = 9;
        assert_eq!(packet.data(), &[9, 2, 3]);
        assert_eq!(&handle[..], &[1, 2, 3]);
    }

    #[test]
    fn side_data_replaces_same_kind() {
        let mut packet = Packet::new();
        packet.add_side_data(SideData::NewExtradata(vec![1]));
        packet.add_side_data(SideData::Palette(vec![0; 4]));
        packet.add_side_data(SideData::NewExtradata(vec![2]));

        assert_eq!(packet.side_data_list().len(), 2);
        assert_eq!(packet.new_extradata(), Some(&[2u8][..]));
        assert!(packet.take_side_data(SideDataKind::NewExtradata).is_some());
        assert!(packet.new_extradata().is_none());
    }

    #[test]
    fn rescale_keeps_nopts() {
        let mut packet = Packet::new();
        packet.pts = 90_000;
        packet.duration = 3000;
        packet.rescale_ts(Rational::new(1, 90_000), Rational::new(1, 1000));
        assert_eq!(packet.pts, 1000);
        assert_eq!(packet.dts, NOPTS_VALUE);
        assert_eq!(packet.duration, 33);
    }
}
