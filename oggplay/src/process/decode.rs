use std::sync::Arc;

use anyhow::Result;
use log::{debug, info, trace, warn};

use crate::codec::null::NullBackend;
use crate::codec::{AudioDecoder, AudioSetup, CodecBackend, DecodedPicture, VideoDecoder, VideoSetup};
use crate::log_or_err;
use crate::process::DecoderOptions;
use crate::process::index::IndexReader;
use crate::process::negotiate::{Negotiator, Track, TheoraHeaders};
use crate::process::stream::LogicalStream;
use crate::process::sync::PageSync;
use crate::structs::audio::{AudioBuffer, AudioCodecInfo, AudioLayout};
use crate::structs::comment::CommentHeader;
use crate::structs::frame::{FrameBuffer, FrameLayout, PlaneBuffer};
use crate::structs::packet::Packet;
use crate::structs::page::Page;
use crate::structs::theora::{self, TheoraInfo};
use crate::utils::errors::CodecError;

/// Position of the decode session in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// Only beginning-of-stream pages seen so far.
    #[default]
    AwaitingStreamIdentification,
    NegotiatingHeaders,
    SteadyStateDecoding,
}

/// Demuxes a container byte stream and decodes it to timestamped buffers.
///
/// Input arrives through [`receive_input`](Decoder::receive_input) in
/// chunks of any size. Each call to [`process`](Decoder::process) performs
/// one step of work: a header packet per stream while negotiating, or
/// preparing the next frame and audio packet afterwards. Decoding happens
/// only on request, and at most one decoded buffer of each kind may be
/// outstanding.
///
/// ```
/// use oggplay::process::decode::Decoder;
///
/// let mut decoder = Decoder::default();
/// decoder.receive_input(b"not a container")?;
/// while decoder.process()? {}
/// assert!(!decoder.has_video());
/// assert_eq!(decoder.duration(), None);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Decoder {
    state: DecoderState,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(Box::new(NullBackend))
    }
}

impl Decoder {
    pub fn new(backend: Box<dyn CodecBackend>) -> Self {
        Self::with_options(backend, DecoderOptions::default())
    }

    pub fn with_options(backend: Box<dyn CodecBackend>, options: DecoderOptions) -> Self {
        Self {
            state: DecoderState::new(backend, options),
        }
    }

    /// Sets the failure level for recoverable anomalies.
    ///
    /// - `log::Level::Error`: anomalies are logged and absorbed (default)
    /// - `log::Level::Warn`: framing and header anomalies become errors
    pub fn set_fail_level(&mut self, level: log::Level) {
        self.state.fail_level = level;
        self.state.negotiator.fail_level = level;
    }

    /// Registers a callback fired once, when header negotiation completes.
    pub fn on_loaded_metadata(&mut self, callback: impl FnOnce() + 'static) {
        self.state.on_loaded = Some(Box::new(callback));
    }

    /// Appends a chunk of container bytes and demuxes every complete page.
    pub fn receive_input(&mut self, data: &[u8]) -> Result<()> {
        self.state.receive_input(data)
    }

    /// Performs one step of work. Returns whether anything changed; `false`
    /// means more input is needed or a buffered item must be consumed.
    pub fn process(&mut self) -> Result<bool> {
        self.state.process()
    }

    pub fn session_state(&self) -> SessionState {
        self.state.session
    }

    /// True once header negotiation has completed.
    pub fn is_loaded(&self) -> bool {
        self.state.session == SessionState::SteadyStateDecoding
    }

    pub fn has_video(&self) -> bool {
        self.state.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.state.audio.is_some()
    }

    pub fn frame_layout(&self) -> Option<Arc<FrameLayout>> {
        self.state.video.as_ref().map(|v| v.layout.clone())
    }

    pub fn audio_layout(&self) -> Option<Arc<AudioLayout>> {
        self.state.audio.as_ref().map(|a| a.layout.clone())
    }

    pub fn video_info(&self) -> Option<&TheoraInfo> {
        self.state.video.as_ref().map(|v| &v.info)
    }

    pub fn audio_info(&self) -> Option<&AudioCodecInfo> {
        self.state.audio.as_ref().map(|a| &a.codec)
    }

    pub fn video_comment(&self) -> Option<&CommentHeader> {
        self.state.video.as_ref().and_then(|v| v.comment.as_ref())
    }

    pub fn audio_comment(&self) -> Option<&CommentHeader> {
        self.state.audio.as_ref().and_then(|a| a.comment.as_ref())
    }

    pub fn video_serial(&self) -> Option<u32> {
        self.state.video.as_ref().map(|v| v.stream.serial())
    }

    pub fn audio_serial(&self) -> Option<u32> {
        self.state.audio.as_ref().map(|a| a.stream.serial())
    }

    pub fn index_serial(&self) -> Option<u32> {
        self.state.index_serial
    }

    /// Serials of streams that are not decoded.
    pub fn ignored_serials(&self) -> &[u32] {
        self.state.negotiator.ignored()
    }

    pub fn index(&self) -> Option<&IndexReader> {
        self.state.index.as_ref()
    }

    pub fn is_frame_ready(&self) -> bool {
        self.state.video.as_ref().is_some_and(|v| v.ready.is_some())
    }

    pub fn is_audio_ready(&self) -> bool {
        self.state.audio.as_ref().is_some_and(|a| a.ready)
    }

    /// Presentation time of the ready frame.
    pub fn frame_timestamp(&self) -> Option<f64> {
        let timing = self.state.video.as_ref()?.ready?;
        Some(timing.timestamp)
    }

    /// Time of the latest keyframe at or before the ready frame.
    pub fn keyframe_timestamp(&self) -> Option<f64> {
        self.state.video.as_ref()?.ready?.keyframe_timestamp
    }

    /// Start time of the ready audio packet. While the stream position is
    /// unknown and cannot be counted back from a later granule, this falls
    /// back to the end time carried by the packet.
    pub fn audio_timestamp(&self) -> Option<f64> {
        self.state.audio.as_ref()?.timestamp()
    }

    /// Duration of the ready audio packet, when its codec tells it without
    /// decoding.
    pub fn audio_duration(&self) -> Option<f64> {
        self.state.audio.as_ref()?.duration()
    }

    /// Decodes the ready frame. Returns `false` if no frame was ready or the
    /// codec rejected the packet; the next packet may still decode.
    ///
    /// # Panics
    ///
    /// If the previously decoded frame has not been dequeued.
    pub fn decode_frame(&mut self) -> bool {
        self.state.video.as_mut().is_some_and(VideoPipe::decode)
    }

    pub fn dequeue_frame(&mut self) -> Option<FrameBuffer> {
        self.state.video.as_mut()?.queued.take()
    }

    /// Decodes the ready frame and hands it to `f`.
    pub fn decode_frame_with(&mut self, f: impl FnOnce(FrameBuffer)) -> bool {
        if !self.decode_frame() {
            return false;
        }
        self.dequeue_frame().map(f).is_some()
    }

    /// Drops the ready frame's packet without decoding it. A no-op when no
    /// frame is ready.
    pub fn discard_frame(&mut self) {
        if let Some(video) = self.state.video.as_mut() {
            video.discard();
        }
    }

    /// Decodes the ready audio packet. Returns `false` if nothing was ready,
    /// the codec rejected the packet, or no samples remained after trimming.
    ///
    /// # Panics
    ///
    /// If previously decoded audio has not been dequeued.
    pub fn decode_audio(&mut self) -> bool {
        self.state.audio.as_mut().is_some_and(AudioPipe::decode)
    }

    pub fn dequeue_audio(&mut self) -> Option<AudioBuffer> {
        self.state.audio.as_mut()?.queued.take()
    }

    pub fn decode_audio_with(&mut self, f: impl FnOnce(AudioBuffer)) -> bool {
        if !self.decode_audio() {
            return false;
        }
        self.dequeue_audio().map(f).is_some()
    }

    pub fn discard_audio(&mut self) {
        if let Some(audio) = self.state.audio.as_mut() {
            audio.discard();
        }
    }

    /// Drops buffered input, queued packets, ready flags and unclaimed
    /// buffers. Negotiated stream state is kept, so input may resume at any
    /// page boundary of the same container.
    pub fn flush(&mut self) {
        self.state.flush();
    }

    /// Segment length in bytes recorded by the index stream.
    pub fn segment_length(&self) -> Option<u64> {
        self.state.index.as_ref()?.segment_length()
    }

    /// Duration in seconds over the decoded streams, from the index.
    pub fn duration(&self) -> Option<f64> {
        let serials = self
            .video_serial()
            .into_iter()
            .chain(self.audio_serial())
            .collect::<Vec<_>>();
        self.state.index.as_ref()?.duration(&serials)
    }

    /// Byte offset of the latest indexed keypoint at or before `time`, keyed
    /// on the video stream when there is one, else on the audio stream.
    pub fn keypoint_offset(&self, time: f64) -> Option<u64> {
        let serial = self.video_serial().or(self.audio_serial())?;
        self.state.index.as_ref()?.keypoint_offset(&[serial], time)
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameTiming {
    timestamp: f64,
    keyframe_timestamp: Option<f64>,
}

struct VideoPipe {
    stream: LogicalStream,
    info: TheoraInfo,
    comment: Option<CommentHeader>,
    layout: Arc<FrameLayout>,
    decoder: Box<dyn VideoDecoder>,
    /// Frame number of the latest packet with a derived position.
    frame: Option<i64>,
    keyframe: Option<i64>,
    ready: Option<FrameTiming>,
    last_planes: Option<[PlaneBuffer; 3]>,
    queued: Option<FrameBuffer>,
}

impl VideoPipe {
    fn prepare(&mut self) -> bool {
        if self.ready.is_some() {
            return false;
        }

        while self
            .stream
            .peek()
            .is_some_and(|p| theora::is_header_packet(&p.data))
        {
            if let Some(packet) = self.stream.packet_out() {
                trace!("Skipping video header packet {}", packet.packet_no);
            }
        }
        let Some(packet) = self.stream.peek() else {
            return false;
        };

        let intra = theora::is_keyframe_packet(&packet.data);
        let (frame, keyframe) = match (packet.granule, self.frame) {
            (Some(granule), _) => (
                self.info.granule_frame(granule),
                Some(self.info.granule_keyframe(granule)),
            ),
            (None, Some(previous)) => {
                let frame = previous + 1;
                (frame, if intra { Some(frame) } else { self.keyframe })
            }
            (None, None) => match self.look_ahead() {
                Some(position) => position,
                None => return false,
            },
        };

        self.frame = Some(frame);
        self.keyframe = keyframe;
        let timing = FrameTiming {
            timestamp: self.info.frame_time(frame),
            keyframe_timestamp: keyframe.map(|k| self.info.frame_time(k)),
        };
        trace!(
            "Frame {frame} ready at {:.3}s (keyframe {keyframe:?})",
            timing.timestamp
        );
        self.ready = Some(timing);
        true
    }

    /// Back-computes the front packet's position from the first queued
    /// packet that carries a granule, one frame per packet.
    fn look_ahead(&self) -> Option<(i64, Option<i64>)> {
        let (distance, granule) = self
            .stream
            .iter()
            .enumerate()
            .find_map(|(i, p)| p.granule.map(|g| (i as i64, g)))?;

        let frame = self.info.granule_frame(granule) - distance;
        let front = self.stream.peek()?;
        let keyframe = if theora::is_keyframe_packet(&front.data) {
            Some(frame)
        } else {
            let key = self.info.granule_keyframe(granule);
            (key <= frame).then_some(key)
        };

        debug!("Video position recovered at frame {frame} from {distance} packets ahead");
        Some((frame, keyframe))
    }

    fn decode(&mut self) -> bool {
        assert!(
            self.queued.is_none(),
            "decode_frame called while a decoded frame is unclaimed"
        );

        let Some(timing) = self.ready.take() else {
            return false;
        };
        let Some(packet) = self.stream.packet_out() else {
            return false;
        };

        let planes = match self.decoder.decode(&packet) {
            Ok(DecodedPicture::Picture(planes)) => {
                self.last_planes = Some(planes.clone());
                planes
            }
            Ok(DecodedPicture::Duplicate) => match &self.last_planes {
                Some(planes) => planes.clone(),
                None => {
                    warn!("Video packet {}: {}", packet.packet_no, CodecError::NoReferenceFrame);
                    return false;
                }
            },
            Err(e) => {
                warn!("Video: {e}");
                return false;
            }
        };

        let [y, cb, cr] = planes;
        self.queued = Some(FrameBuffer {
            layout: self.layout.clone(),
            timestamp: timing.timestamp,
            keyframe_timestamp: timing.keyframe_timestamp,
            y,
            cb,
            cr,
        });
        true
    }

    fn discard(&mut self) {
        if self.ready.take().is_some() {
            self.stream.packet_out();
        }
    }

    fn flush(&mut self) {
        self.stream.reset();
        self.decoder.reset();
        self.frame = None;
        self.keyframe = None;
        self.ready = None;
        self.last_planes = None;
        self.queued = None;
    }
}

struct AudioPipe {
    stream: LogicalStream,
    codec: AudioCodecInfo,
    comment: Option<CommentHeader>,
    layout: Arc<AudioLayout>,
    decoder: Box<dyn AudioDecoder>,
    /// Granule position just past the last decoded sample.
    position: Option<i64>,
    ready: bool,
    queued: Option<AudioBuffer>,
}

impl AudioPipe {
    fn prepare(&mut self) -> bool {
        if self.ready {
            return false;
        }

        while self
            .stream
            .peek()
            .is_some_and(|p| self.codec.is_header_packet(&p.data))
        {
            if let Some(packet) = self.stream.packet_out() {
                trace!("Skipping audio header packet {}", packet.packet_no);
            }
        }

        self.ready = !self.stream.is_empty();
        self.ready
    }

    fn timestamp(&self) -> Option<f64> {
        if !self.ready {
            return None;
        }

        match self.position.or_else(|| self.look_ahead()) {
            Some(position) => {
                let first = position.max(self.codec.pre_skip() as i64);
                Some(self.codec.granule_time(first))
            }
            None => {
                let granule = self.stream.peek()?.granule?;
                Some(self.codec.granule_time(granule))
            }
        }
    }

    fn duration(&self) -> Option<f64> {
        if !self.ready {
            return None;
        }
        let samples = self.codec.packet_samples(&self.stream.peek()?.data)?;
        Some(samples as f64 / self.layout.sample_rate as f64)
    }

    /// Start position of the front packet, counted back from the first
    /// queued packet that carries a granule.
    fn look_ahead(&self) -> Option<i64> {
        let mut samples = 0;
        for packet in self.stream.iter() {
            samples += self.codec.packet_samples(&packet.data)?;
            if let Some(granule) = packet.granule {
                trace!("Audio position recovered {samples} samples before {granule}");
                return Some(granule - samples);
            }
        }
        None
    }

    fn decode(&mut self) -> bool {
        assert!(
            self.queued.is_none(),
            "decode_audio called while decoded audio is unclaimed"
        );

        if !std::mem::take(&mut self.ready) {
            return false;
        }
        if self.position.is_none() {
            self.position = self.look_ahead();
        }
        let Some(packet) = self.stream.packet_out() else {
            return false;
        };

        let mut pcm = match self.decoder.decode(&packet) {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!("Audio: {e}");
                return false;
            }
        };

        let (start, count) = self.place(&packet, pcm.first().map_or(0, Vec::len) as i64);
        let skip = start.map_or(0, |s| (self.codec.pre_skip() as i64 - s).clamp(0, count));
        let emitted = (count - skip) as usize;
        if emitted == 0 {
            trace!("Audio packet {} produced no output samples", packet.packet_no);
            return false;
        }

        let skip = skip as usize;
        for channel in &mut pcm {
            channel.truncate(skip + emitted);
            channel.drain(..skip);
        }

        self.queued = Some(AudioBuffer {
            layout: self.layout.clone(),
            sample_count: emitted,
            samples: pcm,
            timestamp: start.map(|s| self.codec.granule_time(s + skip as i64)),
        });
        true
    }

    /// Derives the granule position of the packet's first sample and its
    /// usable sample count, clipping to the end position it declares, and
    /// advances the running position.
    fn place(&mut self, packet: &Packet, decoded: i64) -> (Option<i64>, i64) {
        let mut count = decoded;
        let start = match (packet.granule, self.position) {
            (Some(end), Some(previous)) => {
                if end < previous + count {
                    count = (end - previous).max(0);
                    debug!("Clipped audio packet {} to {count} samples", packet.packet_no);
                }
                Some(previous)
            }
            (Some(end), None) => Some(end - count),
            (None, previous) => previous,
        };

        let end = packet.granule.or(start.map(|s| s + count));
        self.position = match (self.position, end) {
            (Some(previous), Some(end)) => Some(previous.max(end)),
            (previous, end) => end.or(previous),
        };
        (start, count)
    }

    fn discard(&mut self) {
        if !std::mem::take(&mut self.ready) {
            return;
        }
        let start = self.position.or_else(|| self.look_ahead());
        if let Some(packet) = self.stream.packet_out() {
            let samples = self.codec.packet_samples(&packet.data);
            let end = packet.granule.or_else(|| Some(start? + samples?));
            self.position = match (start, end) {
                (Some(previous), Some(end)) => Some(previous.max(end)),
                (_, end) => end,
            };
        }
    }

    fn flush(&mut self) {
        self.stream.reset();
        self.decoder.reset();
        self.position = None;
        self.ready = false;
        self.queued = None;
    }
}

struct DecoderState {
    fail_level: log::Level,
    backend: Box<dyn CodecBackend>,
    sync: PageSync,
    session: SessionState,
    negotiator: Negotiator,
    video: Option<VideoPipe>,
    audio: Option<AudioPipe>,
    index: Option<IndexReader>,
    index_serial: Option<u32>,
    on_loaded: Option<Box<dyn FnOnce()>>,
}

impl DecoderState {
    fn new(backend: Box<dyn CodecBackend>, options: DecoderOptions) -> Self {
        Self {
            fail_level: options.fail_level,
            backend,
            sync: PageSync::default(),
            session: SessionState::default(),
            negotiator: Negotiator::with_options(options),
            video: None,
            audio: None,
            index: None,
            index_serial: None,
            on_loaded: None,
        }
    }

    fn receive_input(&mut self, data: &[u8]) -> Result<()> {
        self.sync.push_bytes(data);

        while let Some(item) = self.sync.next() {
            match item {
                Ok(page) => self.page_in(&page),
                Err(e) => log_or_err!(self, log::Level::Warn, anyhow::Error::from(e)),
            }
        }

        Ok(())
    }

    fn page_in(&mut self, page: &Page) {
        match self.session {
            SessionState::AwaitingStreamIdentification => {
                if page.is_bos() {
                    self.negotiator.identify(page);
                    return;
                }
                debug!(
                    "First non-BOS page at offset {}; negotiating headers",
                    page.offset
                );
                self.session = SessionState::NegotiatingHeaders;
                self.negotiator.route(page);
            }
            SessionState::NegotiatingHeaders => {
                if page.is_bos() && !self.negotiator.is_known(page.serial()) {
                    debug!(
                        "Ignoring late beginning-of-stream page for {:#010X}",
                        page.serial()
                    );
                    return;
                }
                self.negotiator.route(page);
            }
            SessionState::SteadyStateDecoding => {
                let taken = self.video.as_mut().is_some_and(|v| v.stream.page_in(page))
                    || self.audio.as_mut().is_some_and(|a| a.stream.page_in(page));
                if !taken {
                    trace!(
                        "Dropping page {} of stream {:#010X}",
                        page.sequence(),
                        page.serial()
                    );
                }
            }
        }
    }

    fn process(&mut self) -> Result<bool> {
        match self.session {
            SessionState::AwaitingStreamIdentification => Ok(false),
            SessionState::NegotiatingHeaders => {
                let progressed = self.negotiator.step()?;
                if self.negotiator.is_complete() {
                    self.finish_negotiation();
                    return Ok(true);
                }
                Ok(progressed)
            }
            SessionState::SteadyStateDecoding => {
                let video = self.video.as_mut().is_some_and(VideoPipe::prepare);
                let audio = self.audio.as_mut().is_some_and(AudioPipe::prepare);
                Ok(video || audio)
            }
        }
    }

    fn finish_negotiation(&mut self) {
        let video = self.negotiator.video.take();
        self.video = video.and_then(|track| self.open_video(track));

        let opus = self.negotiator.opus.take();
        let vorbis = self.negotiator.vorbis.take();
        let audio = match (opus, vorbis) {
            (Some(opus), vorbis) => {
                if let Some(vorbis) = vorbis {
                    let serial = vorbis.stream.serial();
                    info!("Both vorbis and opus present; ignoring vorbis stream {serial:#010X}");
                    self.negotiator.ignore(serial);
                }
                let Track {
                    stream,
                    headers,
                    packets,
                    ..
                } = opus;
                headers
                    .head
                    .map(|head| (stream, AudioCodecInfo::Opus(head), headers.tags, packets))
            }
            (None, Some(vorbis)) => {
                let Track {
                    stream,
                    headers,
                    packets,
                    ..
                } = vorbis;
                headers
                    .info
                    .map(|info| (stream, AudioCodecInfo::Vorbis(info), headers.comment, packets))
            }
            (None, None) => None,
        };
        self.audio = audio.and_then(|(stream, codec, comment, packets)| {
            self.open_audio(stream, codec, comment, &packets)
        });

        if let Some(track) = self.negotiator.skeleton.take() {
            let serial = track.stream.serial();
            self.index_serial = Some(serial);
            match track.headers.info() {
                Some(info) => {
                    info!(
                        "Index stream {serial:#010X}: {} bones, {} indexes",
                        info.bones.len(),
                        info.indexes.len()
                    );
                    self.index = Some(IndexReader::new(info));
                }
                None => debug!("Index stream {serial:#010X} carried no head packet"),
            }
        }

        self.session = SessionState::SteadyStateDecoding;
        info!(
            "Headers complete: video {}, audio {}",
            self.video.as_ref().map_or("none", |_| "theora"),
            self.audio.as_ref().map_or("none", |a| a.codec.name())
        );

        if let Some(callback) = self.on_loaded.take() {
            callback();
        }
    }

    fn open_video(&self, track: Track<TheoraHeaders>) -> Option<VideoPipe> {
        let serial = track.stream.serial();
        let info = track.headers.info?;
        let layout = Arc::new(FrameLayout::from_theora(&info));

        let setup = VideoSetup {
            info: &info,
            layout: &layout,
            headers: &track.packets,
        };
        let decoder = match self.backend.video_decoder(&setup) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!("Video stream {serial:#010X} disabled: {e}");
                return None;
            }
        };

        info!(
            "Video {serial:#010X}: {}x{} frame, {}x{} picture at {:.3} fps",
            layout.frame.width,
            layout.frame.height,
            layout.picture.width,
            layout.picture.height,
            layout.fps
        );

        Some(VideoPipe {
            stream: track.stream,
            info,
            comment: track.headers.comment,
            layout,
            decoder,
            frame: None,
            keyframe: None,
            ready: None,
            last_planes: None,
            queued: None,
        })
    }

    fn open_audio(
        &self,
        stream: LogicalStream,
        codec: AudioCodecInfo,
        comment: Option<CommentHeader>,
        headers: &[Packet],
    ) -> Option<AudioPipe> {
        let serial = stream.serial();
        let decoder = match self.backend.audio_decoder(&AudioSetup {
            info: &codec,
            headers,
        }) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!("Audio stream {serial:#010X} disabled: {e}");
                return None;
            }
        };

        let layout = Arc::new(codec.layout());
        info!(
            "Audio {serial:#010X}: {} with {} channels at {} Hz",
            codec.name(),
            layout.channels,
            layout.sample_rate
        );

        Some(AudioPipe {
            stream,
            codec,
            comment,
            layout,
            decoder,
            position: Some(0),
            ready: false,
            queued: None,
        })
    }

    fn flush(&mut self) {
        self.sync.reset();

        if self.session != SessionState::SteadyStateDecoding {
            debug!("Flush during {:?}; only buffered input dropped", self.session);
            return;
        }
        if let Some(video) = self.video.as_mut() {
            video.flush();
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.flush();
        }
        debug!("Decoder flushed");
    }
}

#[cfg(test)]
fn run(decoder: &mut Decoder, bytes: &[u8], chunk: usize) -> Result<()> {
    for piece in bytes.chunks(chunk) {
        decoder.receive_input(piece)?;
        while decoder.process()? {}
    }
    Ok(())
}

#[cfg(test)]
fn drain_frames(decoder: &mut Decoder) -> Result<Vec<FrameBuffer>> {
    let mut frames = Vec::new();
    loop {
        decoder.process()?;
        if !decoder.is_frame_ready() {
            return Ok(frames);
        }
        decoder.decode_frame_with(|frame| frames.push(frame));
    }
}

#[test]
fn negotiation_completes_once_after_all_headers() -> Result<()> {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::utils::testing::Fixture;

    let (bytes, layout) = Fixture {
        frames: 25,
        opus_packets: 50,
        skeleton: true,
        index: true,
        ..Default::default()
    }
    .build_with_layout();

    let fired = Rc::new(Cell::new(0));
    let mut decoder = Decoder::default();
    let counter = fired.clone();
    decoder.on_loaded_metadata(move || counter.set(counter.get() + 1));

    let mut fed = 0;
    for piece in bytes.chunks(97) {
        decoder.receive_input(piece)?;
        fed += piece.len();
        while decoder.process()? {}
        if fed < layout.content_offset {
            assert!(!decoder.has_video() && !decoder.has_audio());
            assert_eq!(fired.get(), 0);
        }
    }

    assert_eq!(fired.get(), 1);
    assert!(decoder.has_video() && decoder.has_audio());
    assert_eq!(decoder.session_state(), SessionState::SteadyStateDecoding);

    let audio = decoder.audio_layout().ok_or_else(|| anyhow::anyhow!("no audio"))?;
    assert_eq!((audio.channels, audio.sample_rate), (2, 48_000));
    let video = decoder.frame_layout().ok_or_else(|| anyhow::anyhow!("no video"))?;
    assert_eq!((video.picture.width, video.picture.height), (32, 32));
    assert_eq!(video.fps, 25.0);
    Ok(())
}

#[test]
fn duplicate_frames_advance_one_interval() -> Result<()> {
    use crate::structs::page::{FLAG_BOS, FLAG_EOS};
    use crate::utils::testing::{
        OggWriter, VIDEO_SERIAL, test_theora_info, theora_comment, theora_frame, theora_granule,
        theora_identification, theora_setup,
    };

    let info = test_theora_info((25, 1), 6);
    let mut writer = OggWriter::new();
    writer.page(VIDEO_SERIAL, FLAG_BOS, Some(0), &[theora_identification(&info)]);
    writer.page(VIDEO_SERIAL, 0, Some(0), &[theora_comment(), theora_setup()]);
    writer.page(
        VIDEO_SERIAL,
        FLAG_EOS,
        Some(theora_granule(2, 0, 6)),
        &[theora_frame(true, 10), Vec::new(), theora_frame(false, 10)],
    );

    let mut decoder = Decoder::default();
    run(&mut decoder, &writer.into_bytes(), 4096)?;
    let frames = drain_frames(&mut decoder)?;

    assert_eq!(frames.len(), 3);
    for (i, frame) in frames.iter().enumerate() {
        assert!((frame.timestamp - i as f64 / 25.0).abs() < 1e-9);
        assert_eq!(frame.keyframe_timestamp, Some(0.0));
    }
    assert_eq!(frames[1].y, frames[0].y);
    Ok(())
}

#[test]
fn flush_clears_ready_state_and_recovers_position() -> Result<()> {
    use crate::utils::testing::Fixture;

    let (bytes, layout) = Fixture {
        frames: 50,
        ..Default::default()
    }
    .build_with_layout();

    let mut decoder = Decoder::default();
    run(&mut decoder, &bytes[..layout.content_offset + 100], 4096)?;
    run(&mut decoder, &bytes[layout.content_offset + 100..], 4096)?;
    assert!(decoder.is_frame_ready());
    assert!(decoder.decode_frame());

    decoder.flush();
    assert!(!decoder.is_frame_ready());
    assert!(decoder.dequeue_frame().is_none());
    assert!(!decoder.decode_frame());
    decoder.discard_frame();
    decoder.discard_audio();

    // Resume at the page holding the second keyframe.
    let (offset, frame) = layout.keyframe_pages[1];
    assert_eq!(frame, 25);
    run(&mut decoder, &bytes[offset..], 1000)?;

    assert_eq!(decoder.frame_timestamp(), Some(1.0));
    assert_eq!(decoder.keyframe_timestamp(), Some(1.0));
    let frames = drain_frames(&mut decoder)?;
    assert_eq!(frames.len(), 25);
    assert!(frames.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    Ok(())
}

#[test]
fn index_queries_unknown_until_negotiated() -> Result<()> {
    use crate::utils::testing::Fixture;

    let (bytes, layout) = Fixture {
        frames: 50,
        skeleton: true,
        index: true,
        ..Default::default()
    }
    .build_with_layout();

    let mut decoder = Decoder::default();
    run(&mut decoder, &bytes[..layout.content_offset / 2], 64)?;
    for t in [-1.0, 0.0, 1.5, 1e9] {
        assert_eq!(decoder.keypoint_offset(t), None);
    }
    assert_eq!(decoder.segment_length(), None);
    assert_eq!(decoder.duration(), None);

    run(&mut decoder, &bytes[layout.content_offset / 2..], 64)?;
    assert_eq!(decoder.segment_length(), Some(layout.total as u64));
    assert_eq!(decoder.duration(), Some(2.0));
    assert_eq!(
        decoder.keypoint_offset(1.5),
        Some(layout.keyframe_pages[1].0 as u64)
    );
    assert_eq!(
        decoder.keypoint_offset(0.5),
        Some(layout.keyframe_pages[0].0 as u64)
    );
    Ok(())
}

#[test]
fn data_only_container_produces_nothing() -> Result<()> {
    use crate::utils::testing::Fixture;

    let bytes = Fixture {
        skeleton: true,
        ..Default::default()
    }
    .build();

    let mut decoder = Decoder::default();
    run(&mut decoder, &bytes, 50)?;

    assert!(decoder.is_loaded());
    assert!(!decoder.has_video() && !decoder.has_audio());
    assert!(!decoder.process()?);
    assert!(!decoder.decode_frame() && !decoder.decode_audio());
    assert!(decoder.dequeue_frame().is_none() && decoder.dequeue_audio().is_none());
    assert_eq!(decoder.segment_length(), Some(bytes.len() as u64));
    Ok(())
}

#[test]
fn opus_pre_skip_and_end_clipping() -> Result<()> {
    use crate::structs::page::{FLAG_BOS, FLAG_EOS};
    use crate::utils::testing::{OPUS_SERIAL, OggWriter, opus_head, opus_packet, opus_tags};

    let mut writer = OggWriter::new();
    writer.page(OPUS_SERIAL, FLAG_BOS, Some(0), &[opus_head(1, 312)]);
    writer.page(OPUS_SERIAL, 0, Some(0), &[opus_tags()]);
    writer.page(OPUS_SERIAL, 0, Some(2880), &[opus_packet(20), opus_packet(20), opus_packet(20)]);
    writer.page(OPUS_SERIAL, FLAG_EOS, Some(4000), &[opus_packet(20), opus_packet(20)]);

    let mut decoder = Decoder::default();
    run(&mut decoder, &writer.into_bytes(), 4096)?;

    let mut buffers = Vec::new();
    loop {
        decoder.process()?;
        if !decoder.is_audio_ready() {
            break;
        }
        decoder.decode_audio_with(|buffer| buffers.push(buffer));
    }

    let counts = buffers.iter().map(|b| b.sample_count).collect::<Vec<_>>();
    assert_eq!(counts, [648, 960, 960, 960, 160]);
    assert_eq!(buffers[0].timestamp, Some(0.0));
    assert_eq!(buffers[0].samples[0].len(), 648);
    let second = buffers[1].timestamp.unwrap_or_default();
    assert!((second - 648.0 / 48_000.0).abs() < 1e-9);
    assert_eq!(counts.iter().sum::<usize>(), 4000 - 312);
    Ok(())
}

#[test]
fn audio_start_recovered_after_flush() -> Result<()> {
    use crate::structs::page::{FLAG_BOS, FLAG_EOS};
    use crate::utils::testing::{OPUS_SERIAL, OggWriter, opus_head, opus_packet, opus_tags};

    let packets = vec![opus_packet(20); 3];
    let mut writer = OggWriter::new();
    writer.page(OPUS_SERIAL, FLAG_BOS, Some(0), &[opus_head(1, 312)]);
    writer.page(OPUS_SERIAL, 0, Some(0), &[opus_tags()]);
    writer.page(OPUS_SERIAL, 0, Some(2880), &packets[..]);
    let second = writer.page(OPUS_SERIAL, FLAG_EOS, Some(5760), &packets[..]);
    let bytes = writer.into_bytes();

    let mut decoder = Decoder::default();
    run(&mut decoder, &bytes[..second], 4096)?;
    decoder.flush();
    run(&mut decoder, &bytes[second..], 4096)?;

    // Only the last packet of the page carries a granule.
    assert!(decoder.is_audio_ready());
    let start = decoder.audio_timestamp().unwrap_or(f64::NAN);
    assert!((start - (2880.0 - 312.0) / 48_000.0).abs() < 1e-9);

    let mut buffers = Vec::new();
    loop {
        decoder.process()?;
        if !decoder.is_audio_ready() {
            break;
        }
        decoder.decode_audio_with(|buffer| buffers.push(buffer));
    }
    let starts = buffers
        .iter()
        .map(|b| b.timestamp.unwrap_or(f64::NAN))
        .collect::<Vec<_>>();
    assert_eq!(starts.len(), 3);
    for (i, ts) in starts.iter().enumerate() {
        let expected = (2880.0 + 960.0 * i as f64 - 312.0) / 48_000.0;
        assert!((ts - expected).abs() < 1e-9);
    }
    Ok(())
}

#[test]
fn audio_position_never_moves_backwards() -> Result<()> {
    use crate::structs::page::{FLAG_BOS, FLAG_EOS};
    use crate::utils::testing::{OPUS_SERIAL, OggWriter, opus_head, opus_packet, opus_tags};

    let mut writer = OggWriter::new();
    writer.page(OPUS_SERIAL, FLAG_BOS, Some(0), &[opus_head(1, 312)]);
    writer.page(OPUS_SERIAL, 0, Some(0), &[opus_tags()]);
    writer.page(OPUS_SERIAL, 0, Some(2880), &vec![opus_packet(20); 3][..]);
    writer.page(OPUS_SERIAL, 0, Some(1000), &[opus_packet(20)]);
    writer.page(OPUS_SERIAL, FLAG_EOS, Some(4800), &vec![opus_packet(20); 2][..]);

    let mut decoder = Decoder::default();
    run(&mut decoder, &writer.into_bytes(), 4096)?;

    let mut buffers = Vec::new();
    loop {
        decoder.process()?;
        if !decoder.is_audio_ready() {
            break;
        }
        decoder.decode_audio_with(|buffer| buffers.push(buffer));
    }

    // The packet ending before the running position yields nothing.
    let counts = buffers.iter().map(|b| b.sample_count).collect::<Vec<_>>();
    assert_eq!(counts, [648, 960, 960, 960, 960]);
    let fourth = buffers[3].timestamp.unwrap_or(f64::NAN);
    assert!((fourth - (2880.0 - 312.0) / 48_000.0).abs() < 1e-9);
    let fifth = buffers[4].timestamp.unwrap_or(f64::NAN);
    assert!((fifth - (3840.0 - 312.0) / 48_000.0).abs() < 1e-9);
    Ok(())
}

#[test]
fn opus_preferred_over_vorbis() -> Result<()> {
    use crate::utils::testing::{Fixture, OPUS_SERIAL, VORBIS_SERIAL};

    let bytes = Fixture {
        opus_packets: 10,
        vorbis_packets: 10,
        ..Default::default()
    }
    .build();

    let mut decoder = Decoder::default();
    run(&mut decoder, &bytes, 512)?;

    assert_eq!(decoder.audio_info().map(AudioCodecInfo::name), Some("opus"));
    assert_eq!(decoder.audio_serial(), Some(OPUS_SERIAL));
    assert!(decoder.ignored_serials().contains(&VORBIS_SERIAL));
    Ok(())
}

#[test]
fn strict_mode_turns_corruption_into_errors() -> Result<()> {
    use crate::utils::testing::Fixture;

    let (mut bytes, layout) = Fixture {
        frames: 10,
        ..Default::default()
    }
    .build_with_layout();
    bytes[layout.content_offset + 40] ^= 0xFF;

    let mut lenient = Decoder::default();
    run(&mut lenient, &bytes, 4096)?;
    assert!(lenient.has_video());

    let mut strict = Decoder::default();
    strict.set_fail_level(log::Level::Warn);
    assert!(run(&mut strict, &bytes, 4096).is_err());
    Ok(())
}
