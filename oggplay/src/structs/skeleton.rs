//! Index/metadata stream (Skeleton) structures.
//!
//! The stream starts with a `fishead` packet describing the segment, then
//! carries one `fisbone` per described logical stream and, from version 4,
//! one `index` packet per stream listing keypoints. Its last packet is an
//! empty end-of-stream packet.
//!
//! ## Index packet
//!
//! | Offset | Size | Field                              |
//! |--------|------|------------------------------------|
//! | 0      | 6    | `index\0`                          |
//! | 6      | 4    | serial of the described stream     |
//! | 10     | 8    | number of keypoints                |
//! | 18     | 8    | timestamp denominator              |
//! | 26     | 8    | first sample time numerator        |
//! | 34     | 8    | last sample time numerator         |
//! | 42     | ...  | keypoints                          |
//!
//! Each keypoint stores a byte offset delta and a time numerator delta,
//! both as variable-length integers.

use anyhow::{Result, bail};

use crate::utils::bitstream_io::LeSliceReader;
use crate::utils::errors::HeaderError;

pub const FISHEAD_SIGNATURE: &[u8; 8] = b"fishead\0";
pub const FISBONE_SIGNATURE: &[u8; 8] = b"fisbone\0";
pub const INDEX_SIGNATURE: &[u8; 6] = b"index\0";

const FISHEAD_LEN: usize = 64;
const FISHEAD_V4_LEN: usize = 80;
const FISBONE_LEN: usize = 52;
const INDEX_HEADER_LEN: usize = 42;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fishead {
    pub version_major: u16,
    pub version_minor: u16,
    pub presentation_time: (i64, i64),
    pub base_time: (i64, i64),
    pub utc: [u8; 20],
    /// Total size of the segment in bytes (version 4 and later).
    pub segment_length: Option<u64>,
    /// Offset of the first non-header page (version 4 and later).
    pub content_offset: Option<u64>,
}

impl Fishead {
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < 8 || &data[..8] != FISHEAD_SIGNATURE {
            bail!(HeaderError::BadSignature("fishead"));
        }
        if data.len() < FISHEAD_LEN {
            bail!(HeaderError::Truncated {
                needed: FISHEAD_LEN,
                actual: data.len(),
            });
        }

        let mut reader = LeSliceReader::from_slice(&data[8..]);
        let mut head = Self {
            version_major: reader.get_n(16)?,
            version_minor: reader.get_n(16)?,
            presentation_time: (reader.get_s(64)?, reader.get_s(64)?),
            base_time: (reader.get_s(64)?, reader.get_s(64)?),
            ..Default::default()
        };
        reader.get_bytes(&mut head.utc)?;

        if !(3..=4).contains(&head.version_major) {
            bail!(HeaderError::UnsupportedVersion {
                codec: "skeleton",
                version: format!("{}.{}", head.version_major, head.version_minor),
            });
        }

        if head.version_major >= 4 {
            if data.len() < FISHEAD_V4_LEN {
                bail!(HeaderError::Truncated {
                    needed: FISHEAD_V4_LEN,
                    actual: data.len(),
                });
            }
            head.segment_length = Some(reader.get_n(64)?);
            head.content_offset = Some(reader.get_n(64)?);
        }

        Ok(head)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fisbone {
    pub serial: u32,
    pub header_packets: u32,
    pub granule_rate: (i64, i64),
    pub base_granule: i64,
    pub preroll: u32,
    pub granule_shift: u8,
    pub message_headers: Vec<(String, String)>,
}

impl Fisbone {
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < 8 || &data[..8] != FISBONE_SIGNATURE {
            bail!(HeaderError::BadSignature("fisbone"));
        }
        if data.len() < FISBONE_LEN {
            bail!(HeaderError::Truncated {
                needed: FISBONE_LEN,
                actual: data.len(),
            });
        }

        let mut reader = LeSliceReader::from_slice(&data[8..]);
        let message_offset: u32 = reader.get_n(32)?;
        let bone = Self {
            serial: reader.get_n(32)?,
            header_packets: reader.get_n(32)?,
            granule_rate: (reader.get_s(64)?, reader.get_s(64)?),
            base_granule: reader.get_s(64)?,
            preroll: reader.get_n(32)?,
            granule_shift: reader.get_n(8)?,
            message_headers: Vec::new(),
        };

        let start = 8 + message_offset as usize;
        let message_headers = data
            .get(start..)
            .map(|bytes| {
                String::from_utf8_lossy(bytes)
                    .split("\r\n")
                    .filter_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        Some((name.trim().to_string(), value.trim().to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            message_headers,
            ..bone
        })
    }

    pub fn message_header(&self, name: &str) -> Option<&str> {
        self.message_headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Keypoint {
    pub offset: u64,
    pub time_numerator: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkeletonIndex {
    pub serial: u32,
    pub timestamp_denominator: i64,
    pub first_sample_numerator: i64,
    pub last_sample_numerator: i64,
    pub keypoints: Vec<Keypoint>,
}

impl SkeletonIndex {
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < 6 || &data[..6] != INDEX_SIGNATURE {
            bail!(HeaderError::BadSignature("index"));
        }
        if data.len() < INDEX_HEADER_LEN {
            bail!(HeaderError::Truncated {
                needed: INDEX_HEADER_LEN,
                actual: data.len(),
            });
        }

        let mut reader = LeSliceReader::from_slice(&data[6..]);
        let serial = reader.get_n(32)?;
        let count: u64 = reader.get_n(64)?;
        let timestamp_denominator: i64 = reader.get_s(64)?;
        let first_sample_numerator = reader.get_s(64)?;
        let last_sample_numerator = reader.get_s(64)?;

        if timestamp_denominator <= 0 {
            bail!(HeaderError::InvalidField {
                codec: "skeleton",
                field: "timestamp_denominator",
                value: timestamp_denominator,
            });
        }

        // Every keypoint takes at least two bytes.
        if count.saturating_mul(16) > reader.available()? {
            bail!(HeaderError::InvalidField {
                codec: "skeleton",
                field: "keypoints",
                value: count as i64,
            });
        }

        let mut keypoints = Vec::with_capacity(count as usize);
        let mut offset = 0u64;
        let mut time_numerator = 0i64;
        for _ in 0..count {
            offset = offset.wrapping_add(reader.get_var_length()?);
            time_numerator = time_numerator.wrapping_add(reader.get_var_length()? as i64);
            keypoints.push(Keypoint {
                offset,
                time_numerator,
            });
        }

        Ok(Self {
            serial,
            timestamp_denominator,
            first_sample_numerator,
            last_sample_numerator,
            keypoints,
        })
    }

    pub fn first_sample_time(&self) -> f64 {
        self.first_sample_numerator as f64 / self.timestamp_denominator as f64
    }

    pub fn last_sample_time(&self) -> f64 {
        self.last_sample_numerator as f64 / self.timestamp_denominator as f64
    }

    pub fn keypoint_time(&self, keypoint: &Keypoint) -> f64 {
        keypoint.time_numerator as f64 / self.timestamp_denominator as f64
    }

    /// The last keypoint whose time is at or before `time` seconds.
    pub fn keypoint_at_or_before(&self, time: f64) -> Option<&Keypoint> {
        let idx = self
            .keypoints
            .partition_point(|k| self.keypoint_time(k) <= time);
        idx.checked_sub(1).map(|i| &self.keypoints[i])
    }
}

/// Everything collected from a complete index/metadata stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkeletonInfo {
    pub head: Fishead,
    pub bones: Vec<Fisbone>,
    pub indexes: Vec<SkeletonIndex>,
}

impl SkeletonInfo {
    pub fn bone(&self, serial: u32) -> Option<&Fisbone> {
        self.bones.iter().find(|b| b.serial == serial)
    }

    pub fn index(&self, serial: u32) -> Option<&SkeletonIndex> {
        self.indexes.iter().find(|i| i.serial == serial)
    }
}

#[test]
fn read_fishead_v4() -> anyhow::Result<()> {
    use crate::utils::testing::fishead;

    let head = Fishead::read(&fishead(123_456, 2048))?;
    assert_eq!(head.version_major, 4);
    assert_eq!(head.segment_length, Some(123_456));
    assert_eq!(head.content_offset, Some(2048));

    assert!(Fishead::read(&fishead(1, 1)[..70]).is_err());
    Ok(())
}

#[test]
fn read_fisbone_message_headers() -> anyhow::Result<()> {
    use crate::utils::testing::fisbone;

    let bone = Fisbone::read(&fisbone(0x1234, (25, 1), 6, "Content-Type: video/theora\r\nRole: video/main\r\n"))?;
    assert_eq!(bone.serial, 0x1234);
    assert_eq!(bone.granule_rate, (25, 1));
    assert_eq!(bone.granule_shift, 6);
    assert_eq!(bone.message_header("content-type"), Some("video/theora"));
    assert_eq!(bone.message_header("Role"), Some("video/main"));
    Ok(())
}

#[test]
fn read_index_keypoints() -> anyhow::Result<()> {
    use crate::utils::testing::skeleton_index;

    let data = skeleton_index(7, 1000, 0, 10_000, &[(4096, 0), (50_000, 2000), (90_000, 4000)]);
    let index = SkeletonIndex::read(&data)?;

    assert_eq!(index.serial, 7);
    assert_eq!(index.keypoints.len(), 3);
    assert_eq!(index.keypoints[1].offset, 50_000);
    assert_eq!(index.last_sample_time(), 10.0);

    assert_eq!(index.keypoint_at_or_before(3.0).map(|k| k.offset), Some(50_000));
    assert_eq!(index.keypoint_at_or_before(4.0).map(|k| k.offset), Some(90_000));
    assert_eq!(index.keypoint_at_or_before(-1.0), None);

    let mut lying = data.clone();
    lying[10] = 0xFF;
    assert!(SkeletonIndex::read(&lying).is_err());
    Ok(())
}
