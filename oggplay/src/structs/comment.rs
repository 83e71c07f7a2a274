//! Comment header shared by the video, primary audio and secondary audio
//! codecs: a length-prefixed vendor string followed by a list of
//! length-prefixed `NAME=value` entries, all lengths little-endian.

use anyhow::Result;

use crate::utils::bitstream_io::LeSliceReader;
use crate::utils::errors::HeaderError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentHeader {
    pub vendor: String,
    pub comments: Vec<String>,
}

impl CommentHeader {
    /// Reads the comment list from `data`, which starts right after the
    /// codec-specific signature.
    pub fn read(data: &[u8]) -> Result<Self> {
        let mut reader = LeSliceReader::from_slice(data);

        let vendor = read_string(&mut reader)?;
        let count: u32 = reader.get_n(32)?;

        // Every entry needs at least its 4-byte length.
        if count as u64 * 32 > reader.available()? {
            return Err(HeaderError::InvalidField {
                codec: "comment",
                field: "count",
                value: count as i64,
            }
            .into());
        }

        let comments = (0..count)
            .map(|_| read_string(&mut reader))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { vendor, comments })
    }

    /// Returns the value of the first entry whose name matches `name`,
    /// compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.comments.iter().find_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            key.eq_ignore_ascii_case(name).then_some(value)
        })
    }
}

fn read_string(reader: &mut LeSliceReader) -> Result<String> {
    let len: u32 = reader.get_n(32)?;
    let mut bytes = vec![0u8; len as usize];
    reader.get_bytes(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[test]
fn read_comment_list() -> anyhow::Result<()> {
    let mut data = Vec::new();
    data.extend_from_slice(&3u32.to_le_bytes());
    data.extend_from_slice(b"abc");
    data.extend_from_slice(&2u32.to_le_bytes());
    for entry in ["TITLE=Sintel", "artist=Blender"] {
        data.extend_from_slice(&(entry.len() as u32).to_le_bytes());
        data.extend_from_slice(entry.as_bytes());
    }

    let header = CommentHeader::read(&data)?;
    assert_eq!(header.vendor, "abc");
    assert_eq!(header.comments.len(), 2);
    assert_eq!(header.get("title"), Some("Sintel"));
    assert_eq!(header.get("ARTIST"), Some("Blender"));
    assert_eq!(header.get("album"), None);

    data.truncate(data.len() - 1);
    assert!(CommentHeader::read(&data).is_err());
    Ok(())
}
