//! Video codec (Theora) header structures.
//!
//! ## Header packets
//!
//! | Type   | Packet         |
//! |--------|----------------|
//! | `0x80` | identification |
//! | `0x81` | comment        |
//! | `0x82` | setup          |
//!
//! Every header packet starts with its type byte and the six bytes
//! `theora`. Data packets have the high bit of the first byte clear; of
//! those, an intra frame also has bit 6 clear. A zero-length data packet
//! repeats the previous frame.
//!
//! ## Granule positions
//!
//! `granule = (keyframe_number << shift) | frames_since_keyframe`, where
//! `shift` comes from the identification header. Streams of bitstream
//! version 3.2.1 and later count frames from one.

use anyhow::{Result, bail};
use log::trace;

use crate::structs::comment::CommentHeader;
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::HeaderError;

pub const THEORA_SIGNATURE: &[u8; 6] = b"theora";

pub const PACKET_IDENTIFICATION: u8 = 0x80;
pub const PACKET_COMMENT: u8 = 0x81;
pub const PACKET_SETUP: u8 = 0x82;

const IDENTIFICATION_LEN: usize = 42;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PixelFormat {
    #[default]
    Yuv420,
    Reserved,
    Yuv422,
    Yuv444,
}

impl PixelFormat {
    fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => Self::Yuv420,
            1 => Self::Reserved,
            2 => Self::Yuv422,
            _ => Self::Yuv444,
        }
    }

    /// Horizontal and vertical chroma decimation, each 0 or 1.
    pub fn chroma_shift(&self) -> (u32, u32) {
        let bits = *self as u8;
        ((bits & 1 == 0) as u32, (bits & 2 == 0) as u32)
    }
}

/// Identification header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TheoraInfo {
    pub version: (u8, u8, u8),
    /// Coded frame size in pixels (macroblock count times 16).
    pub frame_width: u32,
    pub frame_height: u32,
    pub pic_width: u32,
    pub pic_height: u32,
    pub pic_x: u32,
    /// Picture offset from the top edge of the coded frame.
    pub pic_y: u32,
    pub fps_numerator: u32,
    pub fps_denominator: u32,
    pub aspect_numerator: u32,
    pub aspect_denominator: u32,
    pub colorspace: u8,
    pub nominal_bitrate: u32,
    pub quality: u8,
    pub keyframe_granule_shift: u8,
    pub pixel_format: PixelFormat,
}

impl TheoraInfo {
    pub fn read(data: &[u8]) -> Result<Self> {
        check_header(data, PACKET_IDENTIFICATION)?;

        if data.len() < IDENTIFICATION_LEN {
            bail!(HeaderError::Truncated {
                needed: IDENTIFICATION_LEN,
                actual: data.len(),
            });
        }

        let mut reader = BsIoSliceReader::from_slice(&data[7..]);

        let version = (reader.get_n(8)?, reader.get_n(8)?, reader.get_n(8)?);
        if version.0 != 3 || version.1 > 2 {
            bail!(HeaderError::UnsupportedVersion {
                codec: "theora",
                version: format!("{}.{}.{}", version.0, version.1, version.2),
            });
        }

        let mb_width: u32 = reader.get_n(16)?;
        let mb_height: u32 = reader.get_n(16)?;
        let mut info = Self {
            version,
            frame_width: mb_width << 4,
            frame_height: mb_height << 4,
            pic_width: reader.get_n(24)?,
            pic_height: reader.get_n(24)?,
            pic_x: reader.get_n(8)?,
            pic_y: reader.get_n(8)?,
            fps_numerator: reader.get_n(32)?,
            fps_denominator: reader.get_n(32)?,
            aspect_numerator: reader.get_n(24)?,
            aspect_denominator: reader.get_n(24)?,
            colorspace: reader.get_n(8)?,
            nominal_bitrate: reader.get_n(24)?,
            quality: reader.get_n(6)?,
            keyframe_granule_shift: reader.get_n(5)?,
            pixel_format: PixelFormat::from_bits(reader.get_n(2)?),
        };

        let reserved: u8 = reader.get_n(3)?;

        if mb_width == 0 || mb_height == 0 {
            bail!(invalid("frame_size", 0));
        }
        if info.pic_width + info.pic_x > info.frame_width {
            bail!(invalid("pic_width", (info.pic_width + info.pic_x) as i64));
        }
        if info.pic_height + info.pic_y > info.frame_height {
            bail!(invalid("pic_height", (info.pic_height + info.pic_y) as i64));
        }
        if info.fps_numerator == 0 || info.fps_denominator == 0 {
            bail!(invalid("fps", 0));
        }
        if info.pixel_format == PixelFormat::Reserved {
            bail!(invalid("pixel_format", 1));
        }
        if reserved != 0 {
            bail!(invalid("reserved", reserved as i64));
        }

        // Stored as an offset from the bottom edge.
        info.pic_y = info.frame_height - info.pic_height - info.pic_y;

        trace!("Theora identification header: {info:?}");

        Ok(info)
    }

    pub fn read_comment(data: &[u8]) -> Result<CommentHeader> {
        check_header(data, PACKET_COMMENT)?;
        CommentHeader::read(&data[7..])
    }

    pub fn check_setup(data: &[u8]) -> Result<()> {
        check_header(data, PACKET_SETUP)
    }

    pub fn fps(&self) -> f64 {
        self.fps_numerator as f64 / self.fps_denominator as f64
    }

    pub fn frame_duration(&self) -> f64 {
        self.fps_denominator as f64 / self.fps_numerator as f64
    }

    pub fn aspect_ratio(&self) -> f64 {
        if self.aspect_numerator == 0 || self.aspect_denominator == 0 {
            1.0
        } else {
            self.aspect_numerator as f64 / self.aspect_denominator as f64
        }
    }

    fn frame_offset(&self) -> i64 {
        (self.version >= (3, 2, 1)) as i64
    }

    /// Zero-based frame number of the frame a granule position refers to.
    pub fn granule_frame(&self, granule: i64) -> i64 {
        let shift = self.keyframe_granule_shift as u32;
        let iframe = granule >> shift;
        let pframe = granule - (iframe << shift);
        iframe + pframe - self.frame_offset()
    }

    /// Zero-based frame number of the keyframe a granule position refers
    /// back to.
    pub fn granule_keyframe(&self, granule: i64) -> i64 {
        (granule >> self.keyframe_granule_shift as u32) - self.frame_offset()
    }

    /// Presentation time of a zero-based frame number.
    pub fn frame_time(&self, frame: i64) -> f64 {
        frame as f64 * self.fps_denominator as f64 / self.fps_numerator as f64
    }
}

/// Header packets have the high bit of the first byte set.
pub fn is_header_packet(data: &[u8]) -> bool {
    data.first().is_some_and(|b| b & 0x80 != 0)
}

pub fn is_keyframe_packet(data: &[u8]) -> bool {
    data.first().is_some_and(|b| b & 0xC0 == 0)
}

fn check_header(data: &[u8], packet_type: u8) -> Result<()> {
    if data.len() < 7 {
        bail!(HeaderError::Truncated {
            needed: 7,
            actual: data.len(),
        });
    }
    if data[0] != packet_type {
        bail!(HeaderError::UnexpectedPacketType {
            found: data[0],
            expected: packet_type,
        });
    }
    if &data[1..7] != THEORA_SIGNATURE {
        bail!(HeaderError::BadSignature("theora"));
    }

    Ok(())
}

fn invalid(field: &'static str, value: i64) -> HeaderError {
    HeaderError::InvalidField {
        codec: "theora",
        field,
        value,
    }
}

#[cfg(test)]
fn identification_for_test() -> TheoraInfo {
    TheoraInfo {
        version: (3, 2, 1),
        frame_width: 64,
        frame_height: 48,
        pic_width: 60,
        pic_height: 40,
        pic_x: 2,
        pic_y: 2,
        fps_numerator: 25,
        fps_denominator: 1,
        aspect_numerator: 1,
        aspect_denominator: 1,
        keyframe_granule_shift: 6,
        ..Default::default()
    }
}

#[test]
fn read_identification_header() -> anyhow::Result<()> {
    use crate::utils::testing::theora_identification;

    let source = identification_for_test();
    let data = theora_identification(&source);
    let info = TheoraInfo::read(&data)?;

    assert_eq!(info.frame_width, 64);
    assert_eq!(info.frame_height, 48);
    assert_eq!(info.pic_width, 60);
    // 48 - 40 - 2 measured from the top
    assert_eq!(info.pic_y, 6);
    assert_eq!(info.fps(), 25.0);
    assert_eq!(info.keyframe_granule_shift, 6);
    assert_eq!(info.pixel_format.chroma_shift(), (1, 1));

    assert!(TheoraInfo::read(&data[..30]).is_err());

    let mut bad = data.clone();
    bad[1] = b'T';
    assert!(TheoraInfo::read(&bad).is_err());
    Ok(())
}

#[test]
fn granule_to_frame_numbers() {
    let mut info = identification_for_test();

    // keyframe 2 (counted from one), 3 frames later
    let granule = (3 << 6) | 3;
    assert_eq!(info.granule_frame(granule), 5);
    assert_eq!(info.granule_keyframe(granule), 2);
    assert!((info.frame_time(5) - 0.2).abs() < 1e-9);

    info.version = (3, 2, 0);
    assert_eq!(info.granule_frame(granule), 6);
    assert_eq!(info.granule_keyframe(granule), 3);
}

#[test]
fn packet_shape() {
    assert!(is_header_packet(&[0x81, b't']));
    assert!(!is_header_packet(&[0x40]));
    assert!(!is_header_packet(&[]));
    assert!(is_keyframe_packet(&[0x00]));
    assert!(!is_keyframe_packet(&[0x40]));
    assert!(!is_keyframe_packet(&[]));
}
