//! Endian-explicit serialization for fixed-layout box and chunk bodies.
//!
//! Structs deriving [`avmux_macros::ToBytes`] write their fields in
//! declaration order through these traits.

pub trait WriteBytesLe {
    fn write_le(&self, dst: &mut Vec<u8>);
}

pub trait WriteBytesBe {
    fn write_be(&self, dst: &mut Vec<u8>);
}

macro_rules! impl_num_le_be {
    ($($t:ty),+) => { $(
        impl WriteBytesLe for $t { #[inline] fn write_le(&self, dst: &mut Vec<u8>) { dst.extend_from_slice(&self.to_le_bytes()); }}
        impl WriteBytesBe for $t { #[inline] fn write_be(&self, dst: &mut Vec<u8>) { dst.extend_from_slice(&self.to_be_bytes()); }}
    )+ }
}

impl_num_le_be!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

macro_rules! impl_collection {
    ($trait:ident, $method:ident) => {
        impl<T: $trait> $trait for Vec<T> {
            #[inline]
            fn $method(&self, dst: &mut Vec<u8>) {
                self.iter().for_each(|item| item.$method(dst));
            }
        }
        impl<T: $trait, const N: usize> $trait for [T; N] {
            #[inline]
            fn $method(&self, dst: &mut Vec<u8>) {
                self.iter().for_each(|item| item.$method(dst));
            }
        }
    };
}

impl_collection!(WriteBytesLe, write_le);
impl_collection!(WriteBytesBe, write_be);

/// 24-bit unsigned field, as used by full-box flags and FLV tag headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct U24(pub u32);

impl WriteBytesLe for U24 {
    #[inline]
    fn write_le(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.0.to_le_bytes()[..3]);
    }
}

impl WriteBytesBe for U24 {
    #[inline]
    fn write_be(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.0.to_be_bytes()[1..]);
    }
}

#[cfg(test)]
mod tests {
    use crate::utils::byteorder::{U24, WriteBytesBe, WriteBytesLe};
    use avmux_macros::ToBytes;

    #[derive(ToBytes)]
    struct Mini {
        a: u16,
        b: U24,
        tag: [u8; 4],
    }

    #[test]
    fn to_bytes_both_orders() {
        let s = Mini {
            a: 0x1234,
            b: U24(0xABCDEF),
            tag: *b"mdat",
        };

        let vec_le = &mut Vec::new();
        let vec_be = &mut Vec::new();

        s.write_le(vec_le);
        s.write_be(vec_be);

        let expected_le = [0x34, 0x12, 0xEF, 0xCD, 0xAB, b'm', b'd', b'a', b't'];
        let expected_be = [0x12, 0x34, 0xAB, 0xCD, 0xEF, b'm', b'd', b'a', b't'];

        assert_eq!(&vec_le[..], &expected_le);
        assert_eq!(&vec_be[..], &expected_be);
    }
}
