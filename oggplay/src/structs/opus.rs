//! Secondary audio codec (Opus) header structures.
//!
//! Two header packets: `OpusHead` then `OpusTags`. Decoded audio is always
//! produced at 48 kHz, and granule positions count 48 kHz samples including
//! the pre-skip region.

use anyhow::{Result, bail};

use crate::structs::comment::CommentHeader;
use crate::utils::bitstream_io::LeSliceReader;
use crate::utils::errors::HeaderError;

pub const OPUS_HEAD_SIGNATURE: &[u8; 8] = b"OpusHead";
pub const OPUS_TAGS_SIGNATURE: &[u8; 8] = b"OpusTags";

pub const OPUS_HEADER_COUNT: usize = 2;

pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// Largest packet duration: 120 ms at 48 kHz.
pub const OPUS_MAX_FRAME_SIZE: usize = 5760;

const HEAD_LEN: usize = 19;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpusHead {
    pub version: u8,
    pub channels: u8,
    pub pre_skip: u16,
    pub input_sample_rate: u32,
    /// Q7.8 dB.
    pub output_gain: i16,
    pub mapping_family: u8,
    pub stream_count: u8,
    pub coupled_count: u8,
    pub mapping: Vec<u8>,
}

impl OpusHead {
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < HEAD_LEN {
            bail!(HeaderError::Truncated {
                needed: HEAD_LEN,
                actual: data.len(),
            });
        }
        if &data[..8] != OPUS_HEAD_SIGNATURE {
            bail!(HeaderError::BadSignature("OpusHead"));
        }

        let mut reader = LeSliceReader::from_slice(&data[8..]);
        let mut head = Self {
            version: reader.get_n(8)?,
            channels: reader.get_n(8)?,
            pre_skip: reader.get_n(16)?,
            input_sample_rate: reader.get_n(32)?,
            output_gain: reader.get_s(16)?,
            mapping_family: reader.get_n(8)?,
            ..Default::default()
        };

        // Only the major version nibble is binding.
        if head.version >> 4 != 0 {
            bail!(HeaderError::UnsupportedVersion {
                codec: "opus",
                version: head.version.to_string(),
            });
        }
        if head.channels == 0 {
            bail!(invalid("channels", 0));
        }

        if head.mapping_family == 0 {
            if head.channels > 2 {
                bail!(invalid("channels", head.channels as i64));
            }
            head.stream_count = 1;
            head.coupled_count = head.channels - 1;
            head.mapping = (0..head.channels).collect();
        } else {
            head.stream_count = reader.get_n(8)?;
            head.coupled_count = reader.get_n(8)?;
            if head.stream_count == 0 || head.coupled_count > head.stream_count {
                bail!(invalid("stream_count", head.stream_count as i64));
            }
            head.mapping = vec![0u8; head.channels as usize];
            reader.get_bytes(&mut head.mapping)?;
        }

        Ok(head)
    }

    pub fn read_tags(data: &[u8]) -> Result<CommentHeader> {
        if data.len() < 8 || &data[..8] != OPUS_TAGS_SIGNATURE {
            bail!(HeaderError::BadSignature("OpusTags"));
        }
        CommentHeader::read(&data[8..])
    }

    /// Playback time of a granule position, with the pre-skip removed.
    pub fn granule_time(&self, granule: i64) -> f64 {
        (granule - self.pre_skip as i64) as f64 / OPUS_SAMPLE_RATE as f64
    }
}

/// Number of 48 kHz samples a packet decodes to, from its TOC byte and
/// frame count. Returns `None` for malformed packets.
pub fn packet_samples(data: &[u8]) -> Option<usize> {
    let toc = *data.first()?;
    let config = toc >> 3;

    let frame_size = match config {
        0..=11 => [480, 960, 1920, 2880][(config & 3) as usize],
        12..=15 => [480, 960][(config & 1) as usize],
        _ => [120, 240, 480, 960][(config & 3) as usize],
    };

    let frames = match toc & 3 {
        0 => 1,
        1 | 2 => 2,
        _ => (*data.get(1)? & 0x3F) as usize,
    };

    let samples = frame_size * frames;
    (frames > 0 && samples <= OPUS_MAX_FRAME_SIZE).then_some(samples)
}

fn invalid(field: &'static str, value: i64) -> HeaderError {
    HeaderError::InvalidField {
        codec: "opus",
        field,
        value,
    }
}

#[test]
fn read_opus_head() -> anyhow::Result<()> {
    use crate::utils::testing::opus_head;

    let head = OpusHead::read(&opus_head(2, 312))?;
    assert_eq!(head.channels, 2);
    assert_eq!(head.pre_skip, 312);
    assert_eq!(head.coupled_count, 1);
    assert_eq!(head.mapping, vec![0, 1]);
    assert!((head.granule_time(48_312) - 1.0).abs() < 1e-9);

    assert!(OpusHead::read(b"OpusHea").is_err());
    assert!(OpusHead::read(&opus_head(3, 0)).is_err());
    Ok(())
}

#[test]
fn toc_sample_counts() {
    // CELT 20 ms, one frame
    assert_eq!(packet_samples(&[31 << 3]), Some(960));
    // SILK 60 ms, two frames: exactly the 120 ms limit
    assert_eq!(packet_samples(&[(3 << 3) | 1]), Some(5760));
    // hybrid 10 ms, arbitrary frame count 3
    assert_eq!(packet_samples(&[(12 << 3) | 3, 3]), Some(1440));
    // code 3 without a count byte
    assert_eq!(packet_samples(&[(12 << 3) | 3]), None);
    assert_eq!(packet_samples(&[]), None);
}
