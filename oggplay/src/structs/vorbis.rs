//! Primary audio codec (Vorbis) header structures.
//!
//! Three header packets precede audio data: identification (`0x01`),
//! comment (`0x03`) and setup (`0x05`), each followed by the six bytes
//! `vorbis`. Audio packets have the low bit of the first byte clear.
//! Granule positions count PCM samples at the stream's sample rate.

use anyhow::{Result, bail};

use crate::structs::comment::CommentHeader;
use crate::utils::bitstream_io::LeSliceReader;
use crate::utils::errors::HeaderError;

pub const VORBIS_SIGNATURE: &[u8; 6] = b"vorbis";

pub const PACKET_IDENTIFICATION: u8 = 0x01;
pub const PACKET_COMMENT: u8 = 0x03;
pub const PACKET_SETUP: u8 = 0x05;

pub const VORBIS_HEADER_COUNT: usize = 3;

const IDENTIFICATION_LEN: usize = 30;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VorbisInfo {
    pub version: u32,
    pub channels: u8,
    pub rate: u32,
    pub bitrate_maximum: i32,
    pub bitrate_nominal: i32,
    pub bitrate_minimum: i32,
    pub blocksize_0: u32,
    pub blocksize_1: u32,
}

impl VorbisInfo {
    pub fn read(data: &[u8]) -> Result<Self> {
        check_header(data, PACKET_IDENTIFICATION)?;

        if data.len() < IDENTIFICATION_LEN {
            bail!(HeaderError::Truncated {
                needed: IDENTIFICATION_LEN,
                actual: data.len(),
            });
        }

        let mut reader = LeSliceReader::from_slice(&data[7..]);

        let version: u32 = reader.get_n(32)?;
        if version != 0 {
            bail!(HeaderError::UnsupportedVersion {
                codec: "vorbis",
                version: version.to_string(),
            });
        }

        let channels: u8 = reader.get_n(8)?;
        let rate: u32 = reader.get_n(32)?;
        let bitrate_maximum = reader.get_s(32)?;
        let bitrate_nominal = reader.get_s(32)?;
        let bitrate_minimum = reader.get_s(32)?;
        let exp_0: u32 = reader.get_n(4)?;
        let exp_1: u32 = reader.get_n(4)?;
        let framing = reader.get()?;

        if channels == 0 {
            bail!(invalid("channels", 0));
        }
        if rate == 0 {
            bail!(invalid("rate", 0));
        }
        if !(6..=13).contains(&exp_0) || !(6..=13).contains(&exp_1) || exp_0 > exp_1 {
            bail!(invalid("blocksize", ((exp_1 << 4) | exp_0) as i64));
        }
        if !framing {
            bail!(HeaderError::FramingBit("vorbis"));
        }

        Ok(Self {
            version,
            channels,
            rate,
            bitrate_maximum,
            bitrate_nominal,
            bitrate_minimum,
            blocksize_0: 1 << exp_0,
            blocksize_1: 1 << exp_1,
        })
    }

    pub fn read_comment(data: &[u8]) -> Result<CommentHeader> {
        check_header(data, PACKET_COMMENT)?;
        CommentHeader::read(&data[7..])
    }

    pub fn check_setup(data: &[u8]) -> Result<()> {
        check_header(data, PACKET_SETUP)
    }

    pub fn granule_time(&self, granule: i64) -> f64 {
        granule as f64 / self.rate as f64
    }
}

pub fn is_header_packet(data: &[u8]) -> bool {
    data.first().is_some_and(|b| b & 1 != 0)
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
    if &data[1..7] != VORBIS_SIGNATURE {
        bail!(HeaderError::BadSignature("vorbis"));
    }

    Ok(())
}

fn invalid(field: &'static str, value: i64) -> HeaderError {
    HeaderError::InvalidField {
        codec: "vorbis",
        field,
        value,
    }
}

#[test]
fn read_identification_header() -> anyhow::Result<()> {
    use crate::utils::testing::vorbis_identification;

    let data = vorbis_identification(2, 44100);
    let info = VorbisInfo::read(&data)?;
    assert_eq!(info.channels, 2);
    assert_eq!(info.rate, 44100);
    assert_eq!(info.blocksize_0, 256);
    assert_eq!(info.blocksize_1, 2048);
    assert_eq!(info.granule_time(88200), 2.0);

    let mut no_framing = data.clone();
    no_framing[29] = 0;
    assert!(VorbisInfo::read(&no_framing).is_err());

    let mut wrong_type = data;
    wrong_type[0] = PACKET_COMMENT;
    assert!(VorbisInfo::read(&wrong_type).is_err());
    Ok(())
}
