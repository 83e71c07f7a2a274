//! CRC validation utilities for container pages.
//!
//! Provides the CRC-32 used by Ogg page headers: polynomial 0x04C11DB7,
//! zero initial value, no reflection and no final xor. The checksum is
//! computed over the whole page with the CRC field itself set to zero.

/// CRC algorithm specification with polynomial and initial value.
pub struct Algorithm<T> {
    poly: T,
    init: T,
}

/// CRC-32 algorithm for page header validation.
pub const CRC_PAGE_ALG: Algorithm<u32> = Algorithm {
    poly: 0x04c1_1db7,
    init: 0x0000_0000,
};

/// Byte range of the CRC field inside a page header.
pub const PAGE_CRC_RANGE: std::ops::Range<usize> = 22..26;

/// Computes CRC-32 checksum using specified polynomial.
#[inline(always)]
pub const fn crc32(poly: u32, mut value: u32, len: usize) -> u32 {
    value <<= 24;

    let mut i = 0;
    while i < len {
        value = (value << 1) ^ (((value >> 31) & 1) * poly);
        i += 1;
    }

    value
}

#[inline(always)]
const fn crc32_table(poly: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < table.len() {
        table[i] = crc32(poly, i as u32, 8);
        i += 1;
    }

    table
}

#[derive(Debug)]
pub struct Crc32 {
    pub poly: u32,
    pub init: u32,
    table: [u32; 256],
}

impl Crc32 {
    pub const fn new(algorithm: &Algorithm<u32>) -> Self {
        Self {
            poly: algorithm.poly,
            init: algorithm.init,
            table: crc32_table(algorithm.poly),
        }
    }

    const fn table_entry(&self, index: u32) -> u32 {
        self.table[(index & 0xFF) as usize]
    }

    #[inline(always)]
    pub const fn update(&self, mut crc: u32, bytes: &[u8]) -> u32 {
        let mut i = 0;

        while i < bytes.len() {
            crc = (crc << 8) ^ self.table_entry((crc >> 24) ^ bytes[i] as u32);
            i += 1;
        }

        crc
    }

    /// Checksum of a complete page, treating the embedded CRC field as zero.
    pub fn page_checksum(&self, page: &[u8]) -> u32 {
        let crc = self.update(self.init, &page[..PAGE_CRC_RANGE.start]);
        let crc = self.update(crc, &[0; 4]);
        self.update(crc, &page[PAGE_CRC_RANGE.end..])
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new(&CRC_PAGE_ALG)
    }
}

#[test]
fn crc32_known_vector() {
    let crc = Crc32::default();
    // CRC-32/MPEG-2 without init/xorout ("CRC-32/POSIX" core) of "123456789"
    assert_eq!(crc.update(0, b"123456789"), 0x89a1_897f);
    assert_eq!(crc.update(0, &[]), 0);
}

#[test]
fn page_checksum_ignores_crc_field() {
    let crc = Crc32::default();
    let mut page = vec![0u8; 40];
    page[..4].copy_from_slice(b"OggS");
    let reference = crc.page_checksum(&page);
    page[PAGE_CRC_RANGE].copy_from_slice(&[1, 2, 3, 4]);
    assert_eq!(crc.page_checksum(&page), reference);
}
