//! Bitstream I/O utilities for header parsing.
//!
//! Codec identification headers mix two layouts: bit-packed big-endian
//! fields (video) and byte-aligned little-endian fields (audio and index).
//! Both are read through [`BitstreamIoReader`], parameterised by the bit
//! order.

use std::io;

use bitstream_io::{
    BigEndian, BitRead, BitReader, Endianness, LittleEndian, SignedInteger, UnsignedInteger,
};

#[derive(Debug)]
pub struct BitstreamIoReader<R: io::Read + io::Seek, E: Endianness> {
    bs: BitReader<R, E>,
    len: u64,
}

/// Big-endian bit reader over a byte slice.
pub type BsIoSliceReader<'a> = BitstreamIoReader<io::Cursor<&'a [u8]>, BigEndian>;

/// Little-endian reader over a byte slice; byte-aligned reads of 16/32/64
/// bits yield little-endian integers.
pub type LeSliceReader<'a> = BitstreamIoReader<io::Cursor<&'a [u8]>, LittleEndian>;

impl<R, E> BitstreamIoReader<R, E>
where
    R: io::Read + io::Seek,
    E: Endianness,
{
    pub fn new(read: R, len_bytes: u64) -> Self {
        Self {
            bs: BitReader::new(read),
            len: len_bytes << 3,
        }
    }

    #[inline(always)]
    pub fn get(&mut self) -> io::Result<bool> {
        self.bs.read_bit()
    }

    #[inline(always)]
    pub fn get_n<I: UnsignedInteger>(&mut self, n: u32) -> io::Result<I> {
        self.available().and_then(|avail| {
            if n as u64 > avail {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "get_n({}): out of bounds bits at {}",
                        n,
                        self.bs.position_in_bits().unwrap_or(0)
                    ),
                ))
            } else {
                self.bs.read_unsigned_var(n)
            }
        })
    }

    #[inline(always)]
    pub fn get_s<S: SignedInteger>(&mut self, n: u32) -> io::Result<S> {
        self.available().and_then(|avail| {
            if n as u64 > avail {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "get_s({}): out of bounds bits at {}",
                        n,
                        self.bs.position_in_bits().unwrap_or(0)
                    ),
                ))
            } else {
                self.bs.read_signed_var(n)
            }
        })
    }

    /// Reads `buf.len()` whole bytes. The reader must be byte aligned.
    pub fn get_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if (buf.len() as u64) << 3 > self.available()? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("get_bytes({}): out of bounds", buf.len()),
            ));
        }
        self.bs.read_bytes(buf)
    }

    /// Reads one variable-length integer as stored in index keypoints:
    /// seven value bits per byte, least significant group first, the
    /// final byte flagged by its high bit.
    pub fn get_var_length(&mut self) -> io::Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;

        loop {
            let byte: u8 = self.get_n(8)?;
            if shift < 64 {
                value |= ((byte & 0x7F) as u64) << shift;
            }
            shift += 7;
            if byte & 0x80 != 0 {
                return Ok(value);
            }
        }
    }

    #[inline(always)]
    pub fn available(&mut self) -> io::Result<u64> {
        self.bs.position_in_bits().map(|pos| self.len - pos)
    }

    #[inline(always)]
    pub fn skip_n(&mut self, n: u32) -> io::Result<()> {
        self.available().and_then(|avail| {
            if n as u64 > avail {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "skip_n: out of bounds bits",
                ))
            } else {
                self.bs.skip(n)
            }
        })
    }

    #[inline(always)]
    pub fn position(&mut self) -> io::Result<u64> {
        self.bs.position_in_bits()
    }
}

impl<'a, E: Endianness> BitstreamIoReader<io::Cursor<&'a [u8]>, E> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        let len = buf.len() as u64;
        let read = io::Cursor::new(buf);

        Self::new(read, len)
    }
}

#[test]
fn reads_big_endian_bit_fields() -> anyhow::Result<()> {
    let mut reader = BsIoSliceReader::from_slice(&[0b1010_0000, 0xFF, 0x01]);
    assert!(reader.get()?);
    assert_eq!(reader.get_n::<u8>(3)?, 0b010);
    assert_eq!(reader.get_n::<u16>(12)?, 0x0FF);
    assert_eq!(reader.available()?, 8);
    assert!(reader.get_n::<u16>(9).is_err());
    Ok(())
}

#[test]
fn reads_little_endian_words() -> anyhow::Result<()> {
    let mut reader = LeSliceReader::from_slice(&[0x34, 0x12, 0x78, 0x56, 0x34, 0x12]);
    assert_eq!(reader.get_n::<u16>(16)?, 0x1234);
    assert_eq!(reader.get_n::<u32>(32)?, 0x1234_5678);
    Ok(())
}

#[test]
fn reads_variable_length_integers() -> anyhow::Result<()> {
    // 300 = 0b10_0101100 -> groups 0x2C, 0x02 (last flagged)
    let mut reader = LeSliceReader::from_slice(&[0x2C, 0x82, 0x85]);
    assert_eq!(reader.get_var_length()?, 300);
    assert_eq!(reader.get_var_length()?, 5);
    assert!(reader.get_var_length().is_err());
    Ok(())
}
