//! CRC validation for container framing.
//!
//! MSB-first (non-reflected) CRC-8, CRC-16 and CRC-32 with table-driven
//! updates: FLAC frame headers and footers, MPEG-TS PSI sections, Ogg pages.

/// CRC parameters: width, polynomial and initial value.
pub struct Algorithm<T> {
    poly: T,
    init: T,
}

/// CRC-8 over FLAC frame headers.
pub const CRC_FLAC_HEADER_ALG: Algorithm<u8> = Algorithm {
    poly: 0x07,
    init: 0x00,
};

/// CRC-16 over whole FLAC frames.
pub const CRC_FLAC_FRAME_ALG: Algorithm<u16> = Algorithm {
    poly: 0x8005,
    init: 0x0000,
};

/// CRC-32 over Ogg pages, computed with the checksum field zeroed.
pub const CRC_OGG_ALG: Algorithm<u32> = Algorithm {
    poly: 0x04C1_1DB7,
    init: 0x0000_0000,
};

/// CRC-32/MPEG-2 over PSI sections.
pub const CRC_MPEG2_ALG: Algorithm<u32> = Algorithm {
    poly: 0x04C1_1DB7,
    init: 0xFFFF_FFFF,
};

const fn crc8_table(poly: u8) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < table.len() {
        let mut value = i as u8;
        let mut bit = 0;
        while bit < 8 {
            value = if value & 0x80 != 0 {
                (value << 1) ^ poly
            } else {
                value << 1
            };
            bit += 1;
        }
        table[i] = value;
        i += 1;
    }

    table
}

const fn crc16_table(poly: u16) -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < table.len() {
        let mut value = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            value = if value & 0x8000 != 0 {
                (value << 1) ^ poly
            } else {
                value << 1
            };
            bit += 1;
        }
        table[i] = value;
        i += 1;
    }

    table
}

const fn crc32_table(poly: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < table.len() {
        let mut value = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            value = if value & 0x8000_0000 != 0 {
                (value << 1) ^ poly
            } else {
                value << 1
            };
            bit += 1;
        }
        table[i] = value;
        i += 1;
    }

    table
}

#[derive(Debug)]
pub struct Crc8 {
    pub poly: u8,
    pub init: u8,
    table: [u8; 256],
}

#[derive(Debug)]
pub struct Crc16 {
    pub poly: u16,
    pub init: u16,
    table: [u16; 256],
}

#[derive(Debug)]
pub struct Crc32 {
    pub poly: u32,
    pub init: u32,
    table: [u32; 256],
}

impl Crc8 {
    pub const fn new(algorithm: &Algorithm<u8>) -> Self {
        Self {
            poly: algorithm.poly,
            init: algorithm.init,
            table: crc8_table(algorithm.poly),
        }
    }

    #[inline(always)]
    pub const fn update(&self, mut crc: u8, bytes: &[u8]) -> u8 {
        let mut i = 0;

        while i < bytes.len() {
            crc = self.table[(crc ^ bytes[i]) as usize];
            i += 1;
        }

        crc
    }

    pub const fn checksum(&self, bytes: &[u8]) -> u8 {
        self.update(self.init, bytes)
    }
}

impl Crc16 {
    pub const fn new(algorithm: &Algorithm<u16>) -> Self {
        Self {
            poly: algorithm.poly,
            init: algorithm.init,
            table: crc16_table(algorithm.poly),
        }
    }

    #[inline(always)]
    pub const fn update(&self, mut crc: u16, bytes: &[u8]) -> u16 {
        let mut i = 0;

        while i < bytes.len() {
            crc = (crc << 8) ^ self.table[(((crc >> 8) as u8) ^ bytes[i]) as usize];
            i += 1;
        }

        crc
    }

    pub const fn checksum(&self, bytes: &[u8]) -> u16 {
        self.update(self.init, bytes)
    }
}

impl Crc32 {
    pub const fn new(algorithm: &Algorithm<u32>) -> Self {
        Self {
            poly: algorithm.poly,
            init: algorithm.init,
            table: crc32_table(algorithm.poly),
        }
    }

    #[inline(always)]
    pub const fn update(&self, mut crc: u32, bytes: &[u8]) -> u32 {
        let mut i = 0;

        while i < bytes.len() {
            crc = (crc << 8) ^ self.table[(((crc >> 24) as u8) ^ bytes[i]) as usize];
            i += 1;
        }

        crc
    }

    pub const fn checksum(&self, bytes: &[u8]) -> u32 {
        self.update(self.init, bytes)
    }
}

pub static FLAC_HEADER_CRC: Crc8 = Crc8::new(&CRC_FLAC_HEADER_ALG);
pub static FLAC_FRAME_CRC: Crc16 = Crc16::new(&CRC_FLAC_FRAME_ALG);
pub static MPEG2_CRC: Crc32 = Crc32::new(&CRC_MPEG2_ALG);
pub static OGG_CRC: Crc32 = Crc32::new(&CRC_OGG_ALG);

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK: &[u8] = b"123456789";

    #[test]
    fn check_values() {
        assert_eq!(FLAC_HEADER_CRC.checksum(CHECK), 0xF4);
        assert_eq!(FLAC_FRAME_CRC.checksum(CHECK), 0xFEE8);
        assert_eq!(MPEG2_CRC.checksum(CHECK), 0x0376_E6E7);
        assert_eq!(OGG_CRC.checksum(CHECK), 0x89A1_897F);
    }

    #[test]
    fn incremental_update() {
        let crc = MPEG2_CRC.update(MPEG2_CRC.init, &CHECK[..4]);
        assert_eq!(MPEG2_CRC.update(crc, &CHECK[4..]), MPEG2_CRC.checksum(CHECK));
    }
}
