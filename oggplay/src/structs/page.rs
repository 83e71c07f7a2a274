//! Container page structure.
//!
//! A page is the self-delimiting framing unit of the container:
//!
//! | Offset | Size | Field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 4    | capture pattern `OggS`                 |
//! | 4      | 1    | structure version (always 0)           |
//! | 5      | 1    | header type flags                      |
//! | 6      | 8    | granule position (little-endian, -1)   |
//! | 14     | 4    | stream serial number                   |
//! | 18     | 4    | page sequence number                   |
//! | 22     | 4    | CRC-32 checksum                        |
//! | 26     | 1    | number of lacing values                |
//! | 27     | n    | lacing table                           |
//!
//! The body follows the lacing table. A lacing value of 255 means the
//! packet continues in the next segment.

use std::sync::Arc;

use anyhow::{Result, bail};

use crate::utils::bitstream_io::LeSliceReader;
use crate::utils::errors::SyncError;

pub const CAPTURE_PATTERN: &[u8; 4] = b"OggS";

/// Size of the fixed part of a page header, up to and including the
/// lacing value count.
pub const PAGE_HEADER_LEN: usize = 27;

/// Largest possible page: full header, full lacing table, full body.
pub const MAX_PAGE_LEN: usize = PAGE_HEADER_LEN + 255 + 255 * 255;

pub const FLAG_CONTINUED: u8 = 0x01;
pub const FLAG_BOS: u8 = 0x02;
pub const FLAG_EOS: u8 = 0x04;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageHeader {
    pub version: u8,
    pub flags: u8,
    pub granule: Option<i64>,
    pub serial: u32,
    pub sequence: u32,
    pub checksum: u32,
    pub lacing: Vec<u8>,
}

impl PageHeader {
    /// Parses the header at the start of `bytes`, which must begin with
    /// the capture pattern and include the whole lacing table.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PAGE_HEADER_LEN || &bytes[..4] != CAPTURE_PATTERN {
            bail!(SyncError::LostSync(0));
        }

        let mut reader = LeSliceReader::from_slice(&bytes[4..]);
        let version = reader.get_n(8)?;
        let flags = reader.get_n(8)?;
        let granule: i64 = reader.get_s(64)?;
        let serial = reader.get_n(32)?;
        let sequence = reader.get_n(32)?;
        let checksum = reader.get_n(32)?;
        let segments: u8 = reader.get_n(8)?;

        let mut lacing = vec![0u8; segments as usize];
        reader.get_bytes(&mut lacing)?;

        Ok(Self {
            version,
            flags,
            granule: (granule != -1).then_some(granule),
            serial,
            sequence,
            checksum,
            lacing,
        })
    }

    pub fn header_len(&self) -> usize {
        PAGE_HEADER_LEN + self.lacing.len()
    }

    pub fn body_len(&self) -> usize {
        self.lacing.iter().map(|&v| v as usize).sum()
    }

    /// Writes the header bytes. The checksum field is written as stored.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(CAPTURE_PATTERN);
        out.push(self.version);
        out.push(self.flags);
        out.extend_from_slice(&self.granule.unwrap_or(-1).to_le_bytes());
        out.extend_from_slice(&self.serial.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.push(self.lacing.len() as u8);
        out.extend_from_slice(&self.lacing);
    }
}

/// One complete, checksum-verified page.
#[derive(Debug, Clone)]
pub struct Page {
    /// Byte offset of the capture pattern, counted from the last
    /// synchronizer reset.
    pub offset: u64,
    pub header: PageHeader,
    pub data: Arc<[u8]>,
}

impl AsRef<[u8]> for Page {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Page {
    pub fn serial(&self) -> u32 {
        self.header.serial
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn granule(&self) -> Option<i64> {
        self.header.granule
    }

    pub fn is_continued(&self) -> bool {
        self.header.flags & FLAG_CONTINUED != 0
    }

    pub fn is_bos(&self) -> bool {
        self.header.flags & FLAG_BOS != 0
    }

    pub fn is_eos(&self) -> bool {
        self.header.flags & FLAG_EOS != 0
    }

    pub fn body(&self) -> &[u8] {
        &self.data[self.header.header_len()..]
    }

    /// Splits the body into segment runs. Each item is a slice of the body
    /// and whether it terminates a packet (its last lacing value was below
    /// 255). A page ending in a 255 lacing value yields a final unterminated
    /// run.
    pub fn segments(&self) -> Vec<(&[u8], bool)> {
        let body = self.body();
        let mut runs = Vec::new();
        let mut start = 0;
        let mut end = 0;

        for &lacing in &self.header.lacing {
            end += lacing as usize;
            if lacing < 255 {
                runs.push((&body[start..end], true));
                start = end;
            }
        }

        if start < end {
            runs.push((&body[start..end], false));
        }

        runs
    }
}

#[test]
fn page_header_round_trip_fields() -> anyhow::Result<()> {
    let header = PageHeader {
        version: 0,
        flags: FLAG_BOS,
        granule: Some(0x1234),
        serial: 0xDEAD_BEEF,
        sequence: 7,
        checksum: 0,
        lacing: vec![255, 10],
    };
    let mut bytes = Vec::new();
    header.write_to(&mut bytes);
    assert_eq!(bytes.len(), 29);

    let parsed = PageHeader::read(&bytes)?;
    assert_eq!(parsed, header);
    assert_eq!(parsed.body_len(), 265);

    let mut no_granule = header.clone();
    no_granule.granule = None;
    bytes.clear();
    no_granule.write_to(&mut bytes);
    assert_eq!(&bytes[6..14], &[0xFF; 8]);
    assert_eq!(PageHeader::read(&bytes)?.granule, None);
    Ok(())
}

#[test]
fn page_segments_split_on_short_lacing() -> anyhow::Result<()> {
    let header = PageHeader {
        lacing: vec![3, 255, 2, 255],
        ..Default::default()
    };
    let mut bytes = Vec::new();
    header.write_to(&mut bytes);
    bytes.extend(std::iter::repeat_n(1u8, 3));
    bytes.extend(std::iter::repeat_n(2u8, 257));
    bytes.extend(std::iter::repeat_n(3u8, 255));

    let page = Page {
        offset: 0,
        header,
        data: bytes.into(),
    };
    let runs = page.segments();
    assert_eq!(runs.len(), 3);
    assert_eq!((runs[0].0.len(), runs[0].1), (3, true));
    assert_eq!((runs[1].0.len(), runs[1].1), (257, true));
    assert_eq!((runs[2].0.len(), runs[2].1), (255, false));
    Ok(())
}
