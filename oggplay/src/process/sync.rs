use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace};

use crate::structs::page::{CAPTURE_PATTERN, PAGE_HEADER_LEN, Page, PageHeader};
use crate::utils::crc::Crc32;
use crate::utils::errors::SyncError;

/// Recovers complete pages from a byte stream delivered in arbitrary
/// chunks.
///
/// Bytes are appended with [`push_bytes`](PageSync::push_bytes) and pages
/// are pulled through the [`Iterator`] implementation. Iteration returns
/// `None` when the buffered bytes do not hold another complete page; push
/// more data and iterate again.
///
/// Garbage before a capture pattern is skipped silently (it is expected
/// right after the transport repositions). A page that fails its checksum
/// or carries an unknown structure version is reported as an error item
/// and the search resumes one byte later.
///
/// # Example
///
/// ```rust
/// use oggplay::process::sync::PageSync;
///
/// let mut sync = PageSync::default();
/// sync.push_bytes(b"not a page");
/// assert!(sync.next().is_none());
/// ```
#[derive(Debug)]
pub struct PageSync {
    buffer: VecDeque<u8>,
    /// Offset of `buffer[0]`, counted from the last reset.
    offset: u64,
    crc: Crc32,
    skipped: usize,
    pages: usize,
    errors: usize,
}

impl Default for PageSync {
    fn default() -> Self {
        Self {
            buffer: VecDeque::with_capacity(64 * 1024),
            offset: 0,
            crc: Crc32::default(),
            skipped: 0,
            pages: 0,
            errors: 0,
        }
    }
}

impl PageSync {
    /// Appends bytes to the internal buffer.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend(data);
    }

    /// Drops buffered bytes and restarts offset counting at zero.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.offset = 0;
        self.skipped = 0;
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn errors(&self) -> usize {
        self.errors
    }

    fn consume_front(&mut self, cnt: usize) {
        self.buffer.drain(..cnt);
        self.offset += cnt as u64;
    }

    fn skip(&mut self, cnt: usize) {
        self.skipped += cnt;
        self.consume_front(cnt);
    }

    /// Moves the buffer front to the next capture pattern. Returns `false`
    /// when none is buffered; up to three trailing bytes are kept since they
    /// may start a pattern completed by the next chunk.
    fn seek_capture(&mut self) -> bool {
        let len = self.buffer.len();
        if len < CAPTURE_PATTERN.len() {
            return false;
        }

        let (a, b) = self.buffer.as_slices();
        let found = (0..=len - CAPTURE_PATTERN.len()).find(|&i| {
            (0..CAPTURE_PATTERN.len()).all(|j| {
                let k = i + j;
                let byte = if k < a.len() { a[k] } else { b[k - a.len()] };
                byte == CAPTURE_PATTERN[j]
            })
        });

        match found {
            Some(i) => {
                self.skip(i);
                true
            }
            None => {
                self.skip(len - (CAPTURE_PATTERN.len() - 1));
                false
            }
        }
    }

    fn reject(&mut self, error: SyncError) -> Option<Result<Page, SyncError>> {
        self.errors += 1;
        self.skip(1);
        Some(Err(error))
    }
}

impl Iterator for PageSync {
    type Item = Result<Page, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.seek_capture() {
            return None;
        }

        if self.buffer.len() < PAGE_HEADER_LEN {
            return None;
        }

        let version = self.buffer[4];
        if version != 0 {
            let offset = self.offset;
            return self.reject(SyncError::UnsupportedVersion { offset, version });
        }

        let header_len = PAGE_HEADER_LEN + self.buffer[26] as usize;
        if self.buffer.len() < header_len {
            return None;
        }

        let body_len: usize = self
            .buffer
            .range(PAGE_HEADER_LEN..header_len)
            .map(|&v| v as usize)
            .sum();
        let page_len = header_len + body_len;
        if self.buffer.len() < page_len {
            return None;
        }

        let bytes = self.buffer.range(..page_len).copied().collect::<Vec<_>>();
        let header = match PageHeader::read(&bytes) {
            Ok(header) => header,
            Err(_) => {
                let offset = self.offset;
                return self.reject(SyncError::UnsupportedVersion { offset, version });
            }
        };

        let calculated = self.crc.page_checksum(&bytes);
        if calculated != header.checksum {
            let offset = self.offset;
            return self.reject(SyncError::CrcMismatch {
                offset,
                read: header.checksum,
                calculated,
            });
        }

        if self.skipped > 0 {
            debug!("{}", SyncError::LostSync(self.skipped));
            self.skipped = 0;
        }

        let page = Page {
            offset: self.offset,
            header,
            data: Arc::from(bytes),
        };
        self.consume_front(page_len);
        self.pages += 1;

        trace!(
            "Page at {}: serial {:#010X}, seq {}, granule {:?}, {} bytes",
            page.offset,
            page.serial(),
            page.sequence(),
            page.granule(),
            page_len
        );

        Some(Ok(page))
    }
}

#[test]
fn pages_across_chunk_boundaries() -> anyhow::Result<()> {
    use crate::structs::page::FLAG_BOS;
    use crate::utils::testing::OggWriter;

    let mut writer = OggWriter::new();
    writer.page(1, FLAG_BOS, Some(0), &[b"first".as_slice()]);
    writer.page(1, 0, Some(10), &[vec![7u8; 600]]);
    let bytes = writer.into_bytes();

    let mut sync = PageSync::default();
    let mut pages = Vec::new();
    for chunk in bytes.chunks(13) {
        sync.push_bytes(chunk);
        for page in &mut sync {
            pages.push(page?);
        }
    }

    assert_eq!(pages.len(), 2);
    assert_eq!(pages[0].offset, 0);
    assert!(pages[0].is_bos());
    assert_eq!(pages[0].body(), b"first");
    assert_eq!(pages[1].offset, pages[0].data.len() as u64);
    assert_eq!(pages[1].granule(), Some(10));
    assert_eq!(sync.buffered(), 0);
    Ok(())
}

#[test]
fn resync_after_garbage_and_corruption() -> anyhow::Result<()> {
    use crate::utils::testing::OggWriter;

    let mut writer = OggWriter::new();
    writer.extend(b"garbage OggS and more garbage");
    let corrupt_at = writer.len();
    writer.page(5, 0, Some(1), &[b"damaged".as_slice()]);
    let good_at = writer.len();
    writer.page(5, 0, Some(2), &[b"intact".as_slice()]);
    let mut bytes = writer.into_bytes();
    // flip a body byte of the first page
    bytes[good_at - 1] ^= 0xFF;

    let mut sync = PageSync::default();
    sync.push_bytes(&bytes);

    let mut crc_errors = 0;
    let mut version_errors = 0;
    let mut pages = Vec::new();
    for item in &mut sync {
        match item {
            Ok(page) => pages.push(page),
            Err(SyncError::CrcMismatch { offset, .. }) => {
                assert_eq!(offset, corrupt_at as u64);
                crc_errors += 1;
            }
            // the capture pattern inside the garbage
            Err(SyncError::UnsupportedVersion { offset, .. }) => {
                assert_eq!(offset, 8);
                version_errors += 1;
            }
            Err(e) => panic!("unexpected {e}"),
        }
    }

    assert_eq!(crc_errors, 1);
    assert_eq!(version_errors, 1);
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].offset, good_at as u64);
    assert_eq!(pages[0].body(), b"intact");
    Ok(())
}

#[test]
fn reset_restarts_offsets() -> anyhow::Result<()> {
    use crate::utils::testing::OggWriter;

    let mut writer = OggWriter::new();
    writer.page(9, 0, None, &[b"abc".as_slice()]);
    let bytes = writer.into_bytes();

    let mut sync = PageSync::default();
    sync.push_bytes(&bytes[..10]);
    assert!(sync.next().is_none());

    sync.reset();
    sync.push_bytes(&bytes[3..]);
    sync.push_bytes(&bytes);
    let page = sync.next().ok_or_else(|| anyhow::anyhow!("no page"))??;
    assert_eq!(page.offset, (bytes.len() - 3) as u64);
    Ok(())
}
