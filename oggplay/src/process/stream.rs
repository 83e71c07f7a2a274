use std::collections::VecDeque;
use std::collections::vec_deque;

use log::{debug, trace, warn};

use crate::structs::packet::Packet;
use crate::structs::page::Page;
use crate::utils::errors::StreamError;

/// Packet assembly state of one logical stream.
///
/// Pages are offered with [`page_in`](LogicalStream::page_in); pages of
/// other serials are refused without side effects. Completed packets queue
/// up in arrival order and are inspected with [`peek`](LogicalStream::peek)
/// or taken with [`packet_out`](LogicalStream::packet_out).
#[derive(Debug, Clone)]
pub struct LogicalStream {
    serial: u32,
    expected_sequence: Option<u32>,
    partial: Option<Vec<u8>>,
    packets: VecDeque<Packet>,
    packet_no: u64,
    bos_pending: bool,
    eos: bool,
}

impl LogicalStream {
    pub fn new(serial: u32) -> Self {
        Self {
            serial,
            expected_sequence: None,
            partial: None,
            packets: VecDeque::new(),
            packet_no: 0,
            bos_pending: true,
            eos: false,
        }
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Adds the packets of `page` to the queue. Returns `false` when the
    /// page belongs to another stream.
    pub fn page_in(&mut self, page: &Page) -> bool {
        if page.serial() != self.serial {
            return false;
        }

        match self.expected_sequence {
            Some(expected) if expected != page.sequence() => {
                warn!(
                    "{}",
                    StreamError::SequenceGap {
                        serial: self.serial,
                        expected,
                        found: page.sequence(),
                    }
                );
                self.partial = None;
            }
            _ => {}
        }
        self.expected_sequence = Some(page.sequence().wrapping_add(1));

        let mut runs = page.segments().into_iter();

        if page.is_continued() {
            if self.partial.is_none() {
                // The first run belongs to a packet whose start we never saw.
                if runs.next().is_some() {
                    debug!("{}", StreamError::OrphanedContinuation(self.serial));
                }
            }
        } else if self.partial.take().is_some() {
            debug!(
                "Stream {:#010X}: dropped unterminated packet before page {}",
                self.serial,
                page.sequence()
            );
        }

        let mut completed = Vec::new();
        for (bytes, terminated) in runs {
            let mut data = self.partial.take().unwrap_or_default();
            data.extend_from_slice(bytes);
            if terminated {
                completed.push(data);
            } else {
                self.partial = Some(data);
            }
        }

        let count = completed.len();
        for (i, data) in completed.into_iter().enumerate() {
            let last = i + 1 == count;
            let packet = Packet {
                data: data.into(),
                granule: if last { page.granule() } else { None },
                bos: std::mem::take(&mut self.bos_pending) && page.is_bos(),
                eos: last && page.is_eos(),
                packet_no: self.packet_no,
            };
            self.packet_no += 1;
            trace!(
                "Stream {:#010X}: packet {} ({} bytes, granule {:?})",
                self.serial,
                packet.packet_no,
                packet.len(),
                packet.granule
            );
            self.packets.push_back(packet);
        }

        if page.is_eos() {
            self.eos = true;
        }

        true
    }

    pub fn peek(&self) -> Option<&Packet> {
        self.packets.front()
    }

    pub fn packet_out(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    pub fn iter(&self) -> vec_deque::Iter<'_, Packet> {
        self.packets.iter()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn is_eos(&self) -> bool {
        self.eos
    }

    /// Drops queued packets and partial data; the next page is accepted
    /// regardless of its sequence number.
    pub fn reset(&mut self) {
        self.expected_sequence = None;
        self.partial = None;
        self.packets.clear();
        self.eos = false;
    }
}

#[cfg(test)]
fn pages_of(bytes: &[u8]) -> Vec<Page> {
    use crate::process::sync::PageSync;

    let mut sync = PageSync::default();
    sync.push_bytes(bytes);
    sync.filter_map(Result::ok).collect()
}

#[test]
fn assembles_packets_and_granules() {
    use crate::structs::page::{FLAG_BOS, FLAG_EOS};
    use crate::utils::testing::OggWriter;

    let mut writer = OggWriter::new();
    writer.page(3, FLAG_BOS, Some(0), &[b"head".as_slice()]);
    writer.page(3, 0, Some(20), &[b"a".as_slice(), b"bb", b"ccc"]);
    writer.split_packet(3, Some(30), &[9u8; 600], 510);
    writer.page(3, FLAG_EOS, Some(40), &[b"end".as_slice()]);
    writer.page(4, 0, Some(0), &[b"other".as_slice()]);

    let mut stream = LogicalStream::new(3);
    let accepted = pages_of(&writer.into_bytes())
        .iter()
        .filter(|page| stream.page_in(page))
        .count();
    assert_eq!(accepted, 5);

    let packets = std::iter::from_fn(|| stream.packet_out()).collect::<Vec<_>>();
    assert_eq!(packets.len(), 6);

    assert!(packets[0].bos);
    assert_eq!(packets[0].granule, Some(0));
    assert_eq!(packets[1].granule, None);
    assert_eq!(packets[2].granule, None);
    assert_eq!(&*packets[3].data, b"ccc");
    assert_eq!(packets[3].granule, Some(20));
    assert_eq!(packets[4].len(), 600);
    assert_eq!(packets[4].granule, Some(30));
    assert!(packets[5].eos);
    assert!(!packets[4].eos);
    assert!(stream.is_eos());
    assert_eq!(packets[5].packet_no, 5);
}

#[test]
fn drops_orphaned_continuation() {
    use crate::utils::testing::OggWriter;

    let mut writer = OggWriter::new();
    writer.split_packet(8, Some(5), &[1u8; 300], 255);
    writer.page(8, 0, Some(6), &[b"next".as_slice()]);
    let pages = pages_of(&writer.into_bytes());

    // Start reading at the continuation page, as after a reposition.
    let mut stream = LogicalStream::new(8);
    assert!(stream.page_in(&pages[1]));
    assert!(stream.is_empty());
    assert!(stream.page_in(&pages[2]));
    assert_eq!(stream.peek().map(|p| &*p.data), Some(&b"next"[..]));
}

#[test]
fn sequence_gap_drops_partial_packet() {
    use crate::utils::testing::OggWriter;

    let mut writer = OggWriter::new();
    writer.split_packet(2, Some(5), &[1u8; 300], 255);
    writer.page(2, 0, Some(6), &[b"after".as_slice()]);
    let pages = pages_of(&writer.into_bytes());

    let mut stream = LogicalStream::new(2);
    stream.page_in(&pages[0]);
    // skip the continuation page
    stream.page_in(&pages[2]);

    let packets = std::iter::from_fn(|| stream.packet_out()).collect::<Vec<_>>();
    assert_eq!(packets.len(), 1);
    assert_eq!(&*packets[0].data, b"after");
}
