//! Stream classification and multi-packet header bootstrap.
//!
//! Each beginning-of-stream page opens a [`LogicalStream`] whose first
//! packet is offered to the classifiers in priority order: video, primary
//! audio, secondary audio, index. The first one that parses it claims the
//! stream; a stream nobody claims is ignored from then on. Claimed streams
//! then consume their remaining header packets one per step until every
//! one reports completion.

use anyhow::{Result, anyhow, bail};
use log::{debug, info};

use crate::log_or_err;
use crate::process::DecoderOptions;
use crate::process::stream::LogicalStream;
use crate::structs::comment::CommentHeader;
use crate::structs::opus::OpusHead;
use crate::structs::packet::Packet;
use crate::structs::page::Page;
use crate::structs::skeleton::{
    FISBONE_SIGNATURE, Fisbone, Fishead, INDEX_SIGNATURE, SkeletonIndex, SkeletonInfo,
};
use crate::structs::theora::{self, TheoraInfo};
use crate::structs::vorbis::{self, VorbisInfo};
use crate::utils::errors::HeaderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderProgress {
    /// The packet was a header; more are required.
    NeedMore,
    /// The packet was the last header.
    Done,
    /// The packet is the first data packet and is left queued.
    DataReached,
}

/// Codec-specific header state fed one packet at a time.
pub trait HeaderBootstrap: Default {
    const CODEC: &'static str;

    fn header_in(&mut self, packet: &Packet) -> Result<HeaderProgress>;
}

#[derive(Debug, Clone, Default)]
pub struct TheoraHeaders {
    pub info: Option<TheoraInfo>,
    pub comment: Option<CommentHeader>,
    setup: bool,
}

impl HeaderBootstrap for TheoraHeaders {
    const CODEC: &'static str = "theora";

    fn header_in(&mut self, packet: &Packet) -> Result<HeaderProgress> {
        let data = &packet.data;

        if !theora::is_header_packet(data) {
            if self.setup {
                return Ok(HeaderProgress::DataReached);
            }
            bail!(HeaderError::PrematureData(Self::CODEC));
        }

        let (has_info, has_comment) = (self.info.is_some(), self.comment.is_some());
        match (data[0], has_info, has_comment, self.setup) {
            (theora::PACKET_IDENTIFICATION, false, _, _) => {
                self.info = Some(TheoraInfo::read(data)?);
            }
            (theora::PACKET_COMMENT, true, false, _) => {
                self.comment = Some(TheoraInfo::read_comment(data)?);
            }
            (theora::PACKET_SETUP, true, true, false) => {
                TheoraInfo::check_setup(data)?;
                self.setup = true;
                // Without data packets the stream ends here.
                if packet.eos {
                    return Ok(HeaderProgress::Done);
                }
            }
            (found, ..) => {
                let expected = if !has_info {
                    theora::PACKET_IDENTIFICATION
                } else if !has_comment {
                    theora::PACKET_COMMENT
                } else {
                    theora::PACKET_SETUP
                };
                bail!(HeaderError::UnexpectedPacketType { found, expected });
            }
        }

        Ok(HeaderProgress::NeedMore)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VorbisHeaders {
    pub info: Option<VorbisInfo>,
    pub comment: Option<CommentHeader>,
    count: usize,
}

impl HeaderBootstrap for VorbisHeaders {
    const CODEC: &'static str = "vorbis";

    fn header_in(&mut self, packet: &Packet) -> Result<HeaderProgress> {
        let data = &packet.data;

        match self.count {
            0 => self.info = Some(VorbisInfo::read(data)?),
            1 => self.comment = Some(VorbisInfo::read_comment(data)?),
            2 => VorbisInfo::check_setup(data)?,
            _ => bail!(HeaderError::PrematureData(Self::CODEC)),
        }
        self.count += 1;

        Ok(if self.count == vorbis::VORBIS_HEADER_COUNT {
            HeaderProgress::Done
        } else {
            HeaderProgress::NeedMore
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct OpusHeaders {
    pub head: Option<OpusHead>,
    pub tags: Option<CommentHeader>,
}

impl HeaderBootstrap for OpusHeaders {
    const CODEC: &'static str = "opus";

    fn header_in(&mut self, packet: &Packet) -> Result<HeaderProgress> {
        if self.head.is_none() {
            self.head = Some(OpusHead::read(&packet.data)?);
            return Ok(HeaderProgress::NeedMore);
        }

        self.tags = Some(OpusHead::read_tags(&packet.data)?);
        Ok(HeaderProgress::Done)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SkeletonHeaders {
    head: Option<Fishead>,
    bones: Vec<Fisbone>,
    indexes: Vec<SkeletonIndex>,
}

impl SkeletonHeaders {
    pub fn info(&self) -> Option<SkeletonInfo> {
        Some(SkeletonInfo {
            head: self.head.clone()?,
            bones: self.bones.clone(),
            indexes: self.indexes.clone(),
        })
    }
}

impl HeaderBootstrap for SkeletonHeaders {
    const CODEC: &'static str = "skeleton";

    fn header_in(&mut self, packet: &Packet) -> Result<HeaderProgress> {
        let data = &packet.data;

        if self.head.is_none() {
            self.head = Some(Fishead::read(data)?);
        } else if data.starts_with(FISBONE_SIGNATURE) {
            self.bones.push(Fisbone::read(data)?);
        } else if data.starts_with(INDEX_SIGNATURE) {
            self.indexes.push(SkeletonIndex::read(data)?);
        } else if !data.is_empty() {
            debug!("Skipping unrecognised skeleton packet of {} bytes", data.len());
        }

        Ok(if packet.eos {
            HeaderProgress::Done
        } else {
            HeaderProgress::NeedMore
        })
    }
}

/// A classified stream with its header bootstrap state.
#[derive(Debug, Clone)]
pub struct Track<B> {
    pub stream: LogicalStream,
    pub headers: B,
    /// Header packets consumed so far, in stream order.
    pub packets: Vec<Packet>,
    pub complete: bool,
}

impl<B: HeaderBootstrap> Track<B> {
    /// Claims `stream` if its first packet parses as this codec's first
    /// header; otherwise gives the stream back untouched.
    pub fn claim(mut stream: LogicalStream) -> Result<Self, LogicalStream> {
        let mut headers = B::default();

        let progress = match stream.peek().map(|p| headers.header_in(p)) {
            Some(Ok(progress)) if progress != HeaderProgress::DataReached => progress,
            _ => return Err(stream),
        };

        let packets = stream.packet_out().into_iter().collect();
        Ok(Self {
            stream,
            headers,
            packets,
            complete: progress == HeaderProgress::Done,
        })
    }

    /// Consumes at most one header packet. Returns whether anything
    /// changed.
    pub fn step(&mut self) -> Result<bool> {
        if self.complete {
            return Ok(false);
        }
        let Some(packet) = self.stream.peek() else {
            return Ok(false);
        };

        match self.headers.header_in(packet)? {
            HeaderProgress::NeedMore => {}
            HeaderProgress::Done => self.complete = true,
            HeaderProgress::DataReached => {
                self.complete = true;
                return Ok(true);
            }
        }

        self.packets.extend(self.stream.packet_out());
        Ok(true)
    }
}

fn step_slot<B: HeaderBootstrap>(slot: &mut Option<Track<B>>) -> Result<bool, (u32, anyhow::Error)> {
    let Some(track) = slot else {
        return Ok(false);
    };

    match track.step() {
        Ok(progressed) => Ok(progressed),
        Err(e) => {
            let serial = track.stream.serial();
            *slot = None;
            Err((serial, e))
        }
    }
}

fn claim_slot<B: HeaderBootstrap>(
    slot: &mut Option<Track<B>>,
    ignored: &mut Vec<u32>,
    enabled: bool,
    stream: LogicalStream,
) -> Result<(), LogicalStream> {
    if !enabled {
        return Err(stream);
    }

    let track = Track::<B>::claim(stream)?;
    let serial = track.stream.serial();
    match slot {
        Some(existing) => {
            info!(
                "Ignoring {} stream {serial:#010X}; already decoding {:#010X}",
                B::CODEC,
                existing.stream.serial()
            );
            ignored.push(serial);
        }
        None => {
            info!("Found {} stream {serial:#010X}", B::CODEC);
            *slot = Some(track);
        }
    }

    Ok(())
}

/// Classification and header state for every stream of a container.
#[derive(Debug, Clone)]
pub struct Negotiator {
    pub video: Option<Track<TheoraHeaders>>,
    pub vorbis: Option<Track<VorbisHeaders>>,
    pub opus: Option<Track<OpusHeaders>>,
    pub skeleton: Option<Track<SkeletonHeaders>>,
    ignored: Vec<u32>,
    options: DecoderOptions,
    pub fail_level: log::Level,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::with_options(DecoderOptions::default())
    }
}

impl Negotiator {
    pub fn with_options(options: DecoderOptions) -> Self {
        Self {
            video: None,
            vorbis: None,
            opus: None,
            skeleton: None,
            ignored: Vec::new(),
            options,
            fail_level: options.fail_level,
        }
    }

    fn serials(&self) -> impl Iterator<Item = u32> + '_ {
        let video = self.video.iter().map(|t| t.stream.serial());
        let vorbis = self.vorbis.iter().map(|t| t.stream.serial());
        let opus = self.opus.iter().map(|t| t.stream.serial());
        let skeleton = self.skeleton.iter().map(|t| t.stream.serial());
        video
            .chain(vorbis)
            .chain(opus)
            .chain(skeleton)
            .chain(self.ignored.iter().copied())
    }

    pub fn is_known(&self, serial: u32) -> bool {
        self.serials().any(|s| s == serial)
    }

    pub fn is_ignored(&self, serial: u32) -> bool {
        self.ignored.contains(&serial)
    }

    /// Classifies the stream opened by a beginning-of-stream page.
    pub fn identify(&mut self, page: &Page) {
        if self.is_known(page.serial()) {
            self.route(page);
            return;
        }

        let mut stream = LogicalStream::new(page.serial());
        stream.page_in(page);

        let video = self.options.video;
        let audio = self.options.audio;

        let ignored = &mut self.ignored;
        let result = claim_slot(&mut self.video, ignored, video, stream)
            .or_else(|s| claim_slot(&mut self.vorbis, ignored, audio, s))
            .or_else(|s| claim_slot(&mut self.opus, ignored, audio, s))
            .or_else(|s| claim_slot(&mut self.skeleton, ignored, true, s));

        if let Err(stream) = result {
            info!("Ignoring stream {:#010X} of unknown type", stream.serial());
            self.ignored.push(stream.serial());
        }
    }

    /// Offers a page to the claimed streams. Returns whether one took it.
    pub fn route(&mut self, page: &Page) -> bool {
        self.video.as_mut().is_some_and(|t| t.stream.page_in(page))
            || self.vorbis.as_mut().is_some_and(|t| t.stream.page_in(page))
            || self.opus.as_mut().is_some_and(|t| t.stream.page_in(page))
            || self.skeleton.as_mut().is_some_and(|t| t.stream.page_in(page))
    }

    /// Advances every incomplete stream by one header packet. A stream
    /// whose headers fail to parse is abandoned.
    pub fn step(&mut self) -> Result<bool> {
        let mut progressed = false;

        let results = [
            step_slot(&mut self.video),
            step_slot(&mut self.vorbis),
            step_slot(&mut self.opus),
            step_slot(&mut self.skeleton),
        ];

        for result in results {
            match result {
                Ok(p) => progressed |= p,
                Err((serial, e)) => {
                    self.ignored.push(serial);
                    progressed = true;
                    log_or_err!(
                        self,
                        log::Level::Warn,
                        anyhow!("Abandoning stream {serial:#010X}: {e:#}")
                    );
                }
            }
        }

        Ok(progressed)
    }

    /// True once every claimed stream has all of its headers.
    pub fn is_complete(&self) -> bool {
        self.video.as_ref().is_none_or(|t| t.complete)
            && self.vorbis.as_ref().is_none_or(|t| t.complete)
            && self.opus.as_ref().is_none_or(|t| t.complete)
            && self.skeleton.as_ref().is_none_or(|t| t.complete)
    }

    pub fn ignored(&self) -> &[u32] {
        &self.ignored
    }

    /// Marks `serial` as ignored, e.g. a negotiated stream that will not be
    /// decoded.
    pub fn ignore(&mut self, serial: u32) {
        if !self.ignored.contains(&serial) {
            self.ignored.push(serial);
        }
    }
}

#[cfg(test)]
fn feed(negotiator: &mut Negotiator, bytes: &[u8]) {
    use crate::process::sync::PageSync;

    let mut sync = PageSync::default();
    sync.push_bytes(bytes);
    for page in sync.filter_map(Result::ok) {
        if page.is_bos() {
            negotiator.identify(&page);
        } else {
            negotiator.route(&page);
        }
    }
}

#[test]
fn classifies_in_priority_order() -> anyhow::Result<()> {
    use crate::utils::testing::{Fixture, OPUS_SERIAL, SKELETON_SERIAL, VIDEO_SERIAL, VORBIS_SERIAL};

    let bytes = Fixture {
        frames: 10,
        opus_packets: 10,
        vorbis_packets: 10,
        skeleton: true,
        ..Default::default()
    }
    .build();

    let mut negotiator = Negotiator::default();
    feed(&mut negotiator, &bytes);

    assert_eq!(negotiator.video.as_ref().map(|t| t.stream.serial()), Some(VIDEO_SERIAL));
    assert_eq!(negotiator.vorbis.as_ref().map(|t| t.stream.serial()), Some(VORBIS_SERIAL));
    assert_eq!(negotiator.opus.as_ref().map(|t| t.stream.serial()), Some(OPUS_SERIAL));
    assert_eq!(negotiator.skeleton.as_ref().map(|t| t.stream.serial()), Some(SKELETON_SERIAL));
    assert!(!negotiator.is_complete());

    while negotiator.step()? {}
    assert!(negotiator.is_complete());

    let video = negotiator.video.as_ref().ok_or_else(|| anyhow!("no video"))?;
    assert_eq!(video.packets.len(), 3);
    // the first data packet stays queued for decoding
    assert_eq!(video.stream.peek().map(|p| p.data[0]), Some(0x00));
    assert_eq!(negotiator.vorbis.as_ref().map(|t| t.packets.len()), Some(3));
    assert_eq!(negotiator.opus.as_ref().map(|t| t.packets.len()), Some(2));
    Ok(())
}

#[test]
fn disabled_and_unknown_streams_are_ignored() -> anyhow::Result<()> {
    use crate::structs::page::FLAG_BOS;
    use crate::utils::testing::{Fixture, OggWriter, VIDEO_SERIAL};

    let mut writer = OggWriter::new();
    writer.page(0x77, FLAG_BOS, Some(0), &[b"\x7fFLAC-ish".as_slice()]);
    writer.extend(
        &Fixture {
            frames: 5,
            ..Default::default()
        }
        .build(),
    );
    let bytes = writer.into_bytes();

    let mut negotiator = Negotiator::with_options(DecoderOptions {
        video: false,
        ..Default::default()
    });
    feed(&mut negotiator, &bytes);

    assert!(negotiator.video.is_none());
    assert!(negotiator.is_ignored(0x77));
    assert!(negotiator.is_ignored(VIDEO_SERIAL));
    assert!(negotiator.is_complete());
    Ok(())
}

#[test]
fn broken_headers_abandon_only_that_stream() -> anyhow::Result<()> {
    use crate::structs::page::FLAG_BOS;
    use crate::utils::testing::{OggWriter, opus_head, test_theora_info, theora_identification};

    let mut writer = OggWriter::new();
    writer.page(1, FLAG_BOS, Some(0), &[theora_identification(&test_theora_info((25, 1), 6))]);
    writer.page(2, FLAG_BOS, Some(0), &[opus_head(1, 0)]);
    // a setup packet where the comment header belongs
    writer.page(1, 0, Some(0), &[crate::utils::testing::theora_setup()]);
    writer.page(2, 0, Some(0), &[crate::utils::testing::opus_tags()]);

    let mut negotiator = Negotiator::default();
    feed(&mut negotiator, &writer.into_bytes());

    while negotiator.step()? {}
    assert!(negotiator.video.is_none());
    assert!(negotiator.is_ignored(1));
    assert!(negotiator.opus.as_ref().is_some_and(|t| t.complete));
    assert!(negotiator.is_complete());
    Ok(())
}

#[test]
fn second_stream_of_a_kind_is_ignored() -> anyhow::Result<()> {
    use crate::structs::page::FLAG_BOS;
    use crate::utils::testing::{OggWriter, opus_head, opus_tags};

    let mut writer = OggWriter::new();
    writer.page(1, FLAG_BOS, Some(0), &[opus_head(2, 312)]);
    writer.page(2, FLAG_BOS, Some(0), &[opus_head(1, 312)]);
    writer.page(1, 0, Some(0), &[opus_tags()]);
    writer.page(2, 0, Some(0), &[opus_tags()]);

    let mut negotiator = Negotiator::default();
    feed(&mut negotiator, &writer.into_bytes());
    while negotiator.step()? {}

    assert_eq!(negotiator.opus.as_ref().map(|t| t.stream.serial()), Some(1));
    assert_eq!(negotiator.ignored(), [2]);
    assert!(negotiator.is_complete());
    Ok(())
}
