//! Playback and seek orchestration on top of the [`Decoder`].
//!
//! The player is single threaded and event driven. It never blocks: the
//! host delivers transport, timer and audio notifications as
//! [`PlayerEvent`]s through [`Player::handle_event`], and the player reacts
//! by feeding the decoder, drawing frames, queueing audio and requesting
//! more input or another timer tick.
//!
//! Seeking flushes the decoder and either jumps to an indexed keypoint or
//! bisects the byte range by decoded timestamps, then decodes forward to
//! the requested time. See [`seek`] for the phases.

use anyhow::Result;
use log::{debug, error, info, trace, warn};

use crate::process::decode::Decoder;
use crate::structs::audio::{AudioBuffer, AudioLayout};
use crate::structs::frame::FrameBuffer;
use crate::structs::theora::TheoraInfo;
use crate::utils::errors::{SeekError, TransportError};

pub mod bisect;
pub mod host;
pub mod seek;

use seek::{Direction, SeekJob, SeekPath, SeekReport, SeekState};

/// Bytes read from the end of the input when probing for its duration.
pub const TAIL_PROBE_BYTES: u64 = 128 * 1024;

/// Timer interval used while only audio needs attention.
const AUDIO_POLL: f64 = 0.05;

/// Queued audio shorter than this counts as drained.
const AUDIO_DRAINED: f64 = 0.001;

/// Shortest delay handed to the timer while playing.
const MIN_TIMEOUT: f64 = 0.001;

/// Byte source with random access.
pub trait Transport {
    /// Begins loading; [`PlayerEvent::Started`] follows once the size is
    /// known.
    fn open(&mut self);

    /// Requests up to `max` further bytes, delivered later as
    /// [`PlayerEvent::Data`] or [`PlayerEvent::Done`].
    fn read_bytes(&mut self, max: usize);

    /// Repositions the next read. Data not yet delivered from the old
    /// position is discarded.
    fn seek(&mut self, offset: u64);

    fn abort(&mut self);

    fn response_header(&self, name: &str) -> Option<String>;

    /// Total size in bytes, or zero when the input cannot be repositioned.
    fn bytes_total(&self) -> u64;

    fn bytes_buffered(&self) -> u64;

    fn bytes_read(&self) -> u64;

    fn is_seekable(&self) -> bool;
}

/// Audio output device.
pub trait AudioSink {
    /// Called once with the negotiated layout before any other method.
    fn configure(&mut self, layout: &AudioLayout);

    fn start(&mut self);

    /// Stops output and drops queued audio.
    fn stop(&mut self);

    fn buffer_data(&mut self, buffer: AudioBuffer);

    /// Seconds of audio played since creation.
    fn playback_position(&self) -> f64;

    /// Seconds of audio queued and not yet played.
    fn buffered_time(&self) -> f64;

    fn mute(&mut self);

    fn unmute(&mut self);
}

pub trait FrameSink {
    fn draw_frame(&mut self, frame: &FrameBuffer);
}

pub trait Timer {
    /// Monotonic time in seconds.
    fn timestamp(&self) -> f64;

    /// Requests a [`PlayerEvent::Timeout`] after `delay` seconds.
    fn set_timeout(&mut self, delay: f64);
}

/// Playback notifications for the host application.
pub trait PlayerDelegate {
    fn on_loaded_metadata(&mut self) {}

    fn on_play(&mut self) {}

    fn on_pause(&mut self) {}

    fn on_ended(&mut self) {}

    fn on_seeked(&mut self) {}

    fn on_error(&mut self, _message: &str) {}
}

/// Notifications the host delivers to [`Player::handle_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// The transport opened and knows its size.
    Started,
    Buffered,
    Data(Vec<u8>),
    /// No more bytes at the current position.
    Done,
    Error(String),
    /// The audio sink is running low.
    AudioStarved,
    Timeout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaybackState {
    #[default]
    Initial,
    Loading,
    /// Reading the tail of the input to find its duration.
    SeekingEnd,
    Loaded,
    Playing,
    Paused,
    Seeking,
    Ended,
}

#[derive(Debug, Clone)]
pub struct PlayerOptions {
    /// Start playing as soon as metadata is loaded.
    pub autoplay: bool,
    /// Read the end of seekable inputs when no other duration source
    /// exists.
    pub probe_duration: bool,
    pub read_chunk_size: usize,
    /// Seconds of audio kept queued in the sink.
    pub audio_buffer_ahead: f64,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            autoplay: false,
            probe_duration: true,
            read_chunk_size: 64 * 1024,
            audio_buffer_ahead: 0.5,
        }
    }
}

/// The platform side of a [`Player`].
pub struct Collaborators {
    pub transport: Box<dyn Transport>,
    pub timer: Box<dyn Timer>,
    pub frame_sink: Box<dyn FrameSink>,
    /// Audio is decoded and dropped when no sink is given.
    pub audio_sink: Option<Box<dyn AudioSink>>,
    pub delegate: Box<dyn PlayerDelegate>,
}

/// Media time reference: audio position while audio runs, else the timer.
#[derive(Debug, Clone, Copy, Default)]
struct Clock {
    offset: f64,
    audio_base: Option<f64>,
    timer_base: Option<f64>,
}

pub struct Player {
    options: PlayerOptions,
    decoder: Decoder,
    transport: Box<dyn Transport>,
    timer: Box<dyn Timer>,
    frame_sink: Box<dyn FrameSink>,
    audio_sink: Option<Box<dyn AudioSink>>,
    delegate: Box<dyn PlayerDelegate>,
    state: PlaybackState,
    seek: SeekJob,
    last_seek: Option<SeekReport>,
    byte_length: u64,
    duration_hint: Option<f64>,
    duration: Option<f64>,
    tail_end: Option<f64>,
    reading: bool,
    input_done: bool,
    audio_active: bool,
    muted: bool,
    clock: Clock,
    frame_timestamp: Option<f64>,
}

impl Player {
    pub fn new(decoder: Decoder, collaborators: Collaborators, options: PlayerOptions) -> Self {
        let Collaborators {
            transport,
            timer,
            frame_sink,
            audio_sink,
            delegate,
        } = collaborators;

        Self {
            options,
            decoder,
            transport,
            timer,
            frame_sink,
            audio_sink,
            delegate,
            state: PlaybackState::Initial,
            seek: SeekJob::default(),
            last_seek: None,
            byte_length: 0,
            duration_hint: None,
            duration: None,
            tail_end: None,
            reading: false,
            input_done: false,
            audio_active: false,
            muted: false,
            clock: Clock::default(),
            frame_timestamp: None,
        }
    }

    /// Opens the transport. Has no effect after the first call.
    pub fn load(&mut self) {
        if self.state != PlaybackState::Initial {
            debug!("load() ignored in {:?}", self.state);
            return;
        }
        self.state = PlaybackState::Loading;
        self.transport.open();
    }

    pub fn handle_event(&mut self, event: PlayerEvent) -> Result<()> {
        match event {
            PlayerEvent::Started => self.on_start(),
            PlayerEvent::Buffered => trace!(
                "Buffered {} of {} bytes",
                self.transport.bytes_buffered(),
                self.byte_length
            ),
            PlayerEvent::Data(bytes) => {
                self.reading = false;
                trace!("Received {} bytes", bytes.len());
                self.decoder.receive_input(&bytes)?;
                self.ping();
            }
            PlayerEvent::Done => {
                self.reading = false;
                self.input_done = true;
                debug!("Input exhausted after {} bytes read", self.transport.bytes_read());
                self.ping();
            }
            PlayerEvent::Error(message) => self.on_transport_error(&message),
            PlayerEvent::AudioStarved => self.ping(),
            PlayerEvent::Timeout => self.tick()?,
        }
        Ok(())
    }

    pub fn play(&mut self) {
        match self.state {
            PlaybackState::Loaded | PlaybackState::Paused => {
                self.state = PlaybackState::Playing;
                self.start_clock(self.clock.offset);
                info!("Playing from {:.3}s", self.clock.offset);
                self.delegate.on_play();
                self.ping();
            }
            PlaybackState::Ended => {
                if self.seek(0.0).is_ok() {
                    self.seek.resume = PlaybackState::Playing;
                }
            }
            PlaybackState::Seeking => self.seek.resume = PlaybackState::Playing,
            PlaybackState::Initial | PlaybackState::Loading | PlaybackState::SeekingEnd => {
                self.options.autoplay = true;
            }
            PlaybackState::Playing => {}
        }
    }

    pub fn pause(&mut self) {
        match self.state {
            PlaybackState::Playing => {
                self.stop_clock();
                self.state = PlaybackState::Paused;
                info!("Paused at {:.3}s", self.clock.offset);
                self.delegate.on_pause();
            }
            PlaybackState::Seeking => self.seek.resume = PlaybackState::Paused,
            PlaybackState::Initial | PlaybackState::Loading | PlaybackState::SeekingEnd => {
                self.options.autoplay = false;
            }
            _ => {}
        }
    }

    /// Starts a seek to `time` seconds.
    ///
    /// Rejected while another seek runs, before metadata is loaded, and on
    /// inputs that cannot be repositioned.
    pub fn seek(&mut self, time: f64) -> Result<(), SeekError> {
        if !time.is_finite() || time < 0.0 {
            return Err(SeekError::InvalidTarget(time));
        }
        if self.seek.is_active() {
            return Err(SeekError::InProgress);
        }
        let resume = match self.state {
            PlaybackState::Playing => PlaybackState::Playing,
            PlaybackState::Loaded | PlaybackState::Paused | PlaybackState::Ended => {
                PlaybackState::Paused
            }
            _ => return Err(SeekError::NotLoaded),
        };
        if self.transport.bytes_total() == 0 {
            error!("{}", SeekError::NotSeekable);
            return Err(SeekError::NotSeekable);
        }

        info!("Seeking to {time:.3}s");
        self.stop_clock();
        self.decoder.flush();
        self.state = PlaybackState::Seeking;
        self.seek.begin(time, resume);

        if !self.decoder.has_video() && !self.decoder.has_audio() {
            self.finish_seek();
            return Ok(());
        }

        match self.decoder.keypoint_offset(time) {
            Some(offset) => {
                debug!("Index keypoint for {time:.3}s at byte {offset}");
                self.seek.linear();
                self.seek.path = SeekPath::Index;
                self.reposition(offset);
            }
            None => self.bisect(SeekState::BisectingToTarget, time),
        }
        Ok(())
    }

    pub fn mute(&mut self) {
        self.muted = true;
        if let Some(sink) = self.audio_sink.as_mut() {
            sink.mute();
        }
    }

    pub fn unmute(&mut self) {
        self.muted = false;
        if let Some(sink) = self.audio_sink.as_mut() {
            sink.unmute();
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn seek_state(&self) -> SeekState {
        self.seek.state
    }

    pub fn is_paused(&self) -> bool {
        !self.is_playing()
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    pub fn is_seeking(&self) -> bool {
        self.seek.is_active()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    fn is_loaded(&self) -> bool {
        !matches!(
            self.state,
            PlaybackState::Initial | PlaybackState::Loading | PlaybackState::SeekingEnd
        )
    }

    /// Duration in seconds once metadata is loaded; infinite when no
    /// source could tell.
    pub fn duration(&self) -> Option<f64> {
        self.is_loaded()
            .then(|| self.duration.unwrap_or(f64::INFINITY))
    }

    /// Current media time in seconds.
    pub fn current_time(&self) -> f64 {
        if let (Some(base), Some(sink)) = (self.clock.audio_base, self.audio_sink.as_ref()) {
            return sink.playback_position() - base + self.clock.offset;
        }
        match self.clock.timer_base {
            Some(base) => self.timer.timestamp() - base + self.clock.offset,
            None => self.clock.offset,
        }
    }

    pub fn video_width(&self) -> Option<u32> {
        self.decoder.frame_layout().map(|l| l.picture.width)
    }

    pub fn video_height(&self) -> Option<u32> {
        self.decoder.frame_layout().map(|l| l.picture.height)
    }

    /// Timestamp of the most recently drawn frame.
    pub fn frame_timestamp(&self) -> Option<f64> {
        self.frame_timestamp
    }

    pub fn last_seek(&self) -> Option<&SeekReport> {
        self.last_seek.as_ref()
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    fn on_start(&mut self) {
        self.byte_length = self.transport.bytes_total();
        self.duration_hint = self
            .transport
            .response_header("X-Content-Duration")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0);

        info!(
            "Input opened: {} bytes, seekable {}, duration hint {:?}",
            self.byte_length,
            self.transport.is_seekable(),
            self.duration_hint
        );
        self.read_more();
    }

    fn on_transport_error(&mut self, message: &str) {
        let e = TransportError::Reported(message.to_string());
        error!("{e}");

        self.reading = false;
        self.transport.abort();

        if self.seek.is_active() {
            warn!("Seek to {:.3}s aborted", self.seek.target);
            self.seek.finish();
            self.state = PlaybackState::Paused;
        } else if self.state == PlaybackState::Playing {
            self.stop_clock();
            self.state = PlaybackState::Paused;
        }

        self.delegate.on_error(&e.to_string());
    }

    fn tick(&mut self) -> Result<()> {
        match self.state {
            PlaybackState::Initial
            | PlaybackState::Loaded
            | PlaybackState::Paused
            | PlaybackState::Ended => Ok(()),
            PlaybackState::Loading => self.process_loading(),
            PlaybackState::SeekingEnd => self.process_tail_probe(),
            PlaybackState::Playing => self.process_playback(),
            PlaybackState::Seeking => self.process_seek(),
        }
    }

    fn ping(&mut self) {
        self.timer.set_timeout(0.0);
    }

    fn read_more(&mut self) {
        if self.reading || self.input_done {
            return;
        }
        self.reading = true;
        self.transport.read_bytes(self.options.read_chunk_size);
    }

    fn reposition(&mut self, offset: u64) {
        trace!("Reposition to byte {offset}");
        self.decoder.flush();
        self.transport.seek(offset);
        self.input_done = false;
        self.reading = false;
        self.read_more();
    }

    fn frame_duration(&self) -> f64 {
        self.decoder
            .video_info()
            .map_or(0.0, TheoraInfo::frame_duration)
    }

    fn start_clock(&mut self, offset: f64) {
        self.clock = Clock {
            offset,
            ..Clock::default()
        };

        if self.audio_active {
            if let Some(sink) = self.audio_sink.as_mut() {
                sink.start();
                self.clock.audio_base = Some(sink.playback_position());
                return;
            }
        }
        self.clock.timer_base = Some(self.timer.timestamp());
    }

    fn stop_clock(&mut self) {
        self.clock.offset = self.current_time();
        self.clock.timer_base = None;
        if self.clock.audio_base.take().is_some() {
            if let Some(sink) = self.audio_sink.as_mut() {
                sink.stop();
            }
        }
    }

    fn process_loading(&mut self) -> Result<()> {
        while !self.decoder.is_loaded() && self.decoder.process()? {}

        if !self.decoder.is_loaded() {
            if self.input_done {
                let message = "input ended before stream headers were complete";
                error!("{message}");
                self.state = PlaybackState::Ended;
                self.delegate.on_error(message);
            } else {
                self.read_more();
            }
            return Ok(());
        }

        if let Some(layout) = self.decoder.audio_layout() {
            if let Some(sink) = self.audio_sink.as_mut() {
                sink.configure(&layout);
                if self.muted {
                    sink.mute();
                }
                self.audio_active = true;
            }
        }

        self.duration = self.decoder.duration().or(self.duration_hint);
        let probe = self.duration.is_none()
            && self.options.probe_duration
            && self.transport.is_seekable()
            && self.byte_length > 0;

        if probe {
            self.state = PlaybackState::SeekingEnd;
            self.tail_end = None;
            let start = self.byte_length.saturating_sub(TAIL_PROBE_BYTES);
            debug!("Probing duration from byte {start}");
            self.reposition(start);
        } else {
            self.finish_loading();
        }
        Ok(())
    }

    fn finish_loading(&mut self) {
        self.state = PlaybackState::Loaded;
        info!(
            "Metadata loaded: video {}, audio {}, duration {:?}",
            self.decoder.has_video(),
            self.decoder.has_audio(),
            self.duration
        );
        self.delegate.on_loaded_metadata();

        if self.options.autoplay {
            self.play();
        }
    }

    fn note_end(&mut self, time: f64) {
        self.tail_end = Some(self.tail_end.map_or(time, |t| t.max(time)));
    }

    fn process_tail_probe(&mut self) -> Result<()> {
        let frame_duration = self.frame_duration();

        loop {
            let progressed = self.decoder.process()?;
            let mut consumed = false;

            if self.decoder.is_frame_ready() {
                if let Some(ts) = self.decoder.frame_timestamp() {
                    self.note_end(ts + frame_duration);
                }
                self.decoder.discard_frame();
                consumed = true;
            }
            if self.decoder.is_audio_ready() {
                if self.decoder.decode_audio() {
                    let end = self
                        .decoder
                        .dequeue_audio()
                        .and_then(|b| b.timestamp.map(|ts| ts + b.duration()));
                    if let Some(end) = end {
                        self.note_end(end);
                    }
                }
                consumed = true;
            }

            if !progressed && !consumed {
                break;
            }
        }

        if !self.input_done {
            self.read_more();
            return Ok(());
        }

        self.duration = self.tail_end.take();
        info!("Duration from tail probe: {:?}", self.duration);
        self.reposition(0);
        self.finish_loading();
        Ok(())
    }

    fn feed_audio(&mut self) -> Result<()> {
        let active = self.audio_active;

        while self.decoder.is_audio_ready() {
            match self.audio_sink.as_mut() {
                Some(sink) if active => {
                    if sink.buffered_time() >= self.options.audio_buffer_ahead {
                        break;
                    }
                    if self.decoder.decode_audio() {
                        if let Some(buffer) = self.decoder.dequeue_audio() {
                            sink.buffer_data(buffer);
                        }
                    }
                }
                _ => self.decoder.discard_audio(),
            }
            self.decoder.process()?;
        }
        Ok(())
    }

    fn draw_frame(&mut self) -> bool {
        let sink = &mut self.frame_sink;
        let mut drawn = None;
        self.decoder.decode_frame_with(|frame| {
            sink.draw_frame(&frame);
            drawn = Some(frame.timestamp);
        });

        if drawn.is_some() {
            self.frame_timestamp = drawn;
        }
        drawn.is_some()
    }

    fn audio_buffered(&self) -> f64 {
        match (self.clock.audio_base, self.audio_sink.as_ref()) {
            (Some(_), Some(sink)) => {
                let buffered = sink.buffered_time();
                if buffered < AUDIO_DRAINED { 0.0 } else { buffered }
            }
            _ => 0.0,
        }
    }

    fn process_playback(&mut self) -> Result<()> {
        while self.decoder.process()? {}
        self.feed_audio()?;

        loop {
            let now = self.current_time();
            match self.decoder.frame_timestamp() {
                Some(ts) if ts <= now => {
                    self.draw_frame();
                    self.decoder.process()?;
                    self.feed_audio()?;
                }
                _ => break,
            }
        }

        let frame_ready = self.decoder.is_frame_ready();
        let audio_ready = self.decoder.is_audio_ready();
        let buffered = self.audio_buffered();

        if self.input_done && !audio_ready && buffered <= 0.0 && self.clock.audio_base.is_some() {
            // Audio ran out first; keep time with the timer.
            let now = self.current_time();
            self.stop_clock();
            self.clock.offset = now;
            self.clock.timer_base = Some(self.timer.timestamp());
        }

        if self.input_done && !frame_ready && !audio_ready {
            if buffered > 0.0 {
                self.timer.set_timeout(buffered.max(MIN_TIMEOUT));
                return Ok(());
            }
            info!("Playback ended at {:.3}s", self.current_time());
            self.stop_clock();
            self.state = PlaybackState::Ended;
            self.delegate.on_ended();
            return Ok(());
        }

        let has_video = self.decoder.has_video();
        let has_audio = self.decoder.has_audio();
        if (has_video && !frame_ready) || (has_audio && !audio_ready) || (!has_video && !has_audio)
        {
            self.read_more();
        }

        let mut delay = self
            .decoder
            .frame_timestamp()
            .map(|ts| (ts - self.current_time()).max(0.0));
        if audio_ready || buffered > 0.0 {
            delay = Some(delay.map_or(AUDIO_POLL, |d| d.min(AUDIO_POLL)));
        }
        if let Some(delay) = delay {
            self.timer.set_timeout(delay.max(MIN_TIMEOUT));
        }
        Ok(())
    }

    fn bisect(&mut self, state: SeekState, time: f64) {
        let last_byte = self.byte_length.saturating_sub(1);
        match self.seek.bisect(state, time, last_byte) {
            Some(offset) => self.reposition(offset),
            None => {
                self.seek.linear();
                self.reposition(0);
            }
        }
    }

    fn process_seek(&mut self) -> Result<()> {
        while self.decoder.process()? {}

        match self.seek.state {
            SeekState::Idle => Ok(()),
            SeekState::BisectingToTarget | SeekState::BisectingToKeyframe => {
                self.process_bisection()
            }
            SeekState::LinearAdvanceToTarget => self.process_linear(),
        }
    }

    /// Timestamp and duration of the first decodable item at the current
    /// probe position.
    fn probe_timestamp(&mut self) -> Result<Option<(f64, f64)>> {
        if self.decoder.has_video() {
            let duration = self.frame_duration();
            return Ok(self.decoder.frame_timestamp().map(|ts| (ts, duration)));
        }

        // A packet measured in place stays queued for the linear advance.
        if let (Some(ts), Some(duration)) =
            (self.decoder.audio_timestamp(), self.decoder.audio_duration())
        {
            return Ok(Some((ts, duration)));
        }

        while self.decoder.is_audio_ready() {
            if self.decoder.decode_audio() {
                if let Some(buffer) = self.decoder.dequeue_audio() {
                    if let Some(ts) = buffer.timestamp {
                        return Ok(Some((ts, buffer.duration())));
                    }
                }
            }
            self.decoder.process()?;
        }
        Ok(None)
    }

    fn process_bisection(&mut self) -> Result<()> {
        let Some((timestamp, duration)) = self.probe_timestamp()? else {
            if !self.input_done {
                self.read_more();
            } else if self.seek.is_converged() {
                self.seek.linear();
                self.reposition(0);
            } else {
                // Nothing decodable past this offset.
                self.narrow(Direction::Earlier);
            }
            return Ok(());
        };

        let target = self.seek.bisect_target;
        let direction = if self.seek.is_converged() {
            Direction::Hit
        } else if self.seek.state == SeekState::BisectingToKeyframe {
            Direction::of_keyframe(timestamp, duration, target)
        } else {
            Direction::of(timestamp, duration, target)
        };
        trace!(
            "Probe {} at {timestamp:.3}s for {target:.3}s: {direction:?}",
            self.seek.probes
        );

        match direction {
            Direction::Hit => self.bisection_hit(timestamp),
            _ => self.narrow(direction),
        }
        Ok(())
    }

    fn narrow(&mut self, direction: Direction) {
        match self.seek.narrow(direction) {
            Some(offset) => self.reposition(offset),
            None => {
                // Settle on the latest offset known to precede the target.
                let start = self.seek.range_start();
                debug!(
                    "Bisection converged after {} probes; resuming at byte {start}",
                    self.seek.probes
                );
                self.seek.converge();
                self.reposition(start);
            }
        }
    }

    fn bisection_hit(&mut self, timestamp: f64) {
        let keyframe = self.decoder.keyframe_timestamp();

        match (self.seek.state, keyframe) {
            (SeekState::BisectingToTarget, Some(keyframe)) if keyframe < timestamp => {
                debug!("Found {timestamp:.3}s; bisecting to its keyframe at {keyframe:.3}s");
                self.bisect(SeekState::BisectingToKeyframe, keyframe);
            }
            _ => {
                debug!(
                    "Decoding forward from {timestamp:.3}s to {:.3}s",
                    self.seek.target
                );
                self.seek.linear();
                self.ping();
            }
        }
    }

    fn process_linear(&mut self) -> Result<()> {
        let target = self.seek.target;
        let frame_duration = self.frame_duration();

        loop {
            self.decoder.process()?;
            let mut consumed = false;

            let video_settled = if !self.decoder.has_video() {
                true
            } else {
                match self.decoder.frame_timestamp() {
                    Some(ts) if ts + frame_duration < target => {
                        self.decoder.discard_frame();
                        consumed = true;
                        false
                    }
                    Some(_) => true,
                    None => self.input_done,
                }
            };

            let audio_settled = if !self.decoder.has_audio() {
                true
            } else if self.decoder.is_audio_ready() {
                match self.decoder.audio_timestamp() {
                    Some(ts) if ts >= target => true,
                    _ => {
                        // Decoded rather than discarded so the position stays known.
                        if self.decoder.decode_audio() {
                            self.decoder.dequeue_audio();
                        }
                        consumed = true;
                        false
                    }
                }
            } else {
                self.input_done
            };

            if video_settled && audio_settled {
                self.finish_seek();
                return Ok(());
            }
            if !consumed {
                self.read_more();
                return Ok(());
            }
        }
    }

    fn finish_seek(&mut self) {
        let target = self.seek.target;
        let drawn = if self.decoder.is_frame_ready() && self.draw_frame() {
            self.frame_timestamp
        } else {
            None
        };

        let report = SeekReport {
            target,
            path: self.seek.path,
            probes: self.seek.probes,
            frame_timestamp: drawn,
            audio_timestamp: self.decoder.audio_timestamp(),
        };
        info!(
            "Seek to {target:.3}s done via {:?} after {} probes; frame at {:?}",
            report.path, report.probes, report.frame_timestamp
        );
        let audio_start = report.audio_timestamp;
        self.last_seek = Some(report);

        // The clock starts at the first queued audio sample.
        let start = match audio_start {
            Some(ts) if self.audio_active && ts > target => ts,
            _ => target,
        };

        let resume = self.seek.resume;
        self.seek.finish();
        self.clock = Clock {
            offset: start,
            ..Clock::default()
        };
        self.state = PlaybackState::Paused;
        if resume == PlaybackState::Playing {
            self.state = PlaybackState::Playing;
            self.start_clock(start);
        }

        self.delegate.on_seeked();
        self.ping();
    }
}

#[cfg(test)]
fn player_for(
    bytes: Vec<u8>,
    options: PlayerOptions,
) -> (Player, host::Host) {
    use std::io::Cursor;

    let host = host::Host::new();
    let transport = host::ReaderTransport::new(Cursor::new(bytes), host.queue.clone());
    let player = Player::new(Decoder::default(), host.collaborators(transport), options);
    (player, host)
}

#[cfg(test)]
fn test_options() -> PlayerOptions {
    PlayerOptions {
        read_chunk_size: 4096,
        probe_duration: false,
        ..Default::default()
    }
}

#[cfg(test)]
fn load(player: &mut Player, host: &host::Host) -> Result<()> {
    player.load();
    assert!(host.pump(player, 10_000, |p| p.state() == PlaybackState::Loaded)?);
    Ok(())
}

#[test]
fn bisection_seek_lands_within_one_frame() -> Result<()> {
    use crate::utils::testing::Fixture;

    let bytes = Fixture {
        frames: 250,
        ..Default::default()
    }
    .build();

    let (mut player, host) = player_for(bytes, test_options());
    load(&mut player, &host)?;
    assert_eq!(player.duration(), Some(f64::INFINITY));

    player.seek(4.0)?;
    assert!(player.is_seeking());
    assert!(host.pump(&mut player, 10_000, |p| !p.is_seeking())?);

    assert_eq!(player.seek_state(), SeekState::Idle);
    assert_eq!(player.state(), PlaybackState::Paused);

    let report = player.last_seek().cloned().ok_or_else(|| anyhow::anyhow!("no report"))?;
    assert_eq!(report.path, SeekPath::Bisection);
    assert!(report.probes > 0 && report.probes <= seek::MAX_PROBES);

    let drawn = host.frames.last_timestamp().ok_or_else(|| anyhow::anyhow!("nothing drawn"))?;
    assert!((drawn - 4.0).abs() <= 1.0 / 25.0 + 1e-9, "drew {drawn}");
    assert_eq!(report.frame_timestamp, Some(drawn));
    assert!(host.notifications.contains(&host::Notification::Seeked));
    Ok(())
}

#[test]
fn index_seek_jumps_to_keypoint() -> Result<()> {
    use crate::utils::testing::Fixture;

    let bytes = Fixture {
        frames: 250,
        skeleton: true,
        index: true,
        ..Default::default()
    }
    .build();

    let (mut player, host) = player_for(bytes, test_options());
    load(&mut player, &host)?;
    assert_eq!(player.duration(), Some(10.0));

    player.seek(4.0)?;
    assert!(host.pump(&mut player, 10_000, |p| !p.is_seeking())?);

    let report = player.last_seek().cloned().ok_or_else(|| anyhow::anyhow!("no report"))?;
    assert_eq!(report.path, SeekPath::Index);
    assert_eq!(report.probes, 0);
    assert_eq!(report.frame_timestamp, Some(4.0));
    Ok(())
}

#[test]
fn tail_probe_resolves_duration() -> Result<()> {
    use crate::utils::testing::Fixture;

    let bytes = Fixture {
        frames: 250,
        frame_bytes: 800,
        opus_packets: 500,
        ..Default::default()
    }
    .build();
    assert!(bytes.len() as u64 > TAIL_PROBE_BYTES);

    let (mut player, host) = player_for(
        bytes,
        PlayerOptions {
            probe_duration: true,
            ..test_options()
        },
    );
    load(&mut player, &host)?;

    let duration = player.duration().unwrap_or_default();
    assert!((duration - 10.0).abs() < 0.05, "duration {duration}");
    assert_eq!((player.video_width(), player.video_height()), (Some(32), Some(32)));
    Ok(())
}

#[test]
fn plays_audio_and_video_to_the_end() -> Result<()> {
    use crate::utils::testing::Fixture;

    let bytes = Fixture {
        frames: 50,
        opus_packets: 100,
        ..Default::default()
    }
    .build();

    let (mut player, host) = player_for(
        bytes,
        PlayerOptions {
            autoplay: true,
            ..test_options()
        },
    );
    player.load();
    assert!(host.pump(&mut player, 100_000, |p| p.state() == PlaybackState::Ended)?);

    let timestamps = host.frames.timestamps();
    assert_eq!(timestamps.len(), 50);
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    assert!(host.audio.buffers() > 0);
    assert!(host.notifications.contains(&host::Notification::Play));
    assert!(host.notifications.contains(&host::Notification::Ended));
    Ok(())
}

#[test]
fn data_only_container_never_produces_output() -> Result<()> {
    use crate::utils::testing::Fixture;

    let bytes = Fixture {
        skeleton: true,
        ..Default::default()
    }
    .build();

    let (mut player, host) = player_for(
        bytes,
        PlayerOptions {
            autoplay: true,
            probe_duration: true,
            ..test_options()
        },
    );
    player.load();
    assert!(host.pump(&mut player, 10_000, |p| p.state() == PlaybackState::Ended)?);

    assert!(!player.decoder().has_video() && !player.decoder().has_audio());
    assert!(host.frames.timestamps().is_empty());
    assert_eq!(host.audio.buffers(), 0);
    Ok(())
}

#[test]
fn seek_requests_are_validated() -> Result<()> {
    use std::io::Cursor;

    use crate::utils::testing::Fixture;

    let bytes = Fixture {
        frames: 50,
        ..Default::default()
    }
    .build();

    let (mut player, host) = player_for(bytes.clone(), test_options());
    assert_eq!(player.seek(1.0), Err(SeekError::NotLoaded));
    load(&mut player, &host)?;
    assert!(player.seek(f64::NAN).is_err());
    assert_eq!(player.seek(-1.0), Err(SeekError::InvalidTarget(-1.0)));
    player.seek(1.0)?;
    assert_eq!(player.seek(1.5), Err(SeekError::InProgress));

    let host = host::Host::new();
    let transport = host::ReaderTransport::new(Cursor::new(bytes), host.queue.clone()).non_seekable();
    let mut player = Player::new(Decoder::default(), host.collaborators(transport), test_options());
    load(&mut player, &host)?;
    assert_eq!(player.seek(1.0), Err(SeekError::NotSeekable));
    assert_eq!(player.seek_state(), SeekState::Idle);
    assert_eq!(player.state(), PlaybackState::Loaded);
    Ok(())
}

#[test]
fn transport_error_aborts_seek() -> Result<()> {
    use std::io::{self, Cursor, Read, Seek, SeekFrom};

    use crate::utils::testing::Fixture;

    /// Fails every read after the first reposition.
    struct Flaky {
        inner: Cursor<Vec<u8>>,
        broken: bool,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.broken {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
            }
            self.inner.read(buf)
        }
    }

    impl Seek for Flaky {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            if let SeekFrom::Start(offset) = pos {
                self.broken = offset > 0;
            }
            self.inner.seek(pos)
        }
    }

    let bytes = Fixture {
        frames: 100,
        ..Default::default()
    }
    .build();

    let host = host::Host::new();
    let reader = Flaky {
        inner: Cursor::new(bytes),
        broken: false,
    };
    let transport = host::ReaderTransport::new(reader, host.queue.clone());
    let mut player = Player::new(Decoder::default(), host.collaborators(transport), test_options());
    load(&mut player, &host)?;

    player.seek(2.0)?;
    assert!(host.pump(&mut player, 10_000, |p| !p.is_seeking())?);

    assert_eq!(player.seek_state(), SeekState::Idle);
    assert_eq!(player.state(), PlaybackState::Paused);
    assert!(player.last_seek().is_none());
    assert!(
        host.notifications
            .all()
            .iter()
            .any(|n| matches!(n, host::Notification::Error(_)))
    );
    Ok(())
}

#[test]
fn audio_only_seek_keeps_audio_from_the_target() -> Result<()> {
    use crate::utils::testing::Fixture;

    let bytes = Fixture {
        opus_packets: 100,
        ..Default::default()
    }
    .build();

    let (mut player, host) = player_for(bytes, test_options());
    load(&mut player, &host)?;

    for target in [0.0, 1.0] {
        player.seek(target)?;
        assert!(host.pump(&mut player, 10_000, |p| !p.is_seeking())?);

        let report = player.last_seek().cloned().ok_or_else(|| anyhow::anyhow!("no report"))?;
        let audio = report.audio_timestamp.unwrap_or(f64::NAN);
        assert!(audio >= target && audio < target + 0.02, "audio at {audio}");
        assert!((player.current_time() - audio).abs() < 1e-9);
    }
    Ok(())
}

#[test]
fn seek_while_playing_resumes_from_the_target() -> Result<()> {
    use crate::utils::testing::Fixture;

    let bytes = Fixture {
        frames: 250,
        opus_packets: 500,
        ..Default::default()
    }
    .build();

    let (mut player, host) = player_for(
        bytes,
        PlayerOptions {
            autoplay: true,
            ..test_options()
        },
    );
    player.load();
    assert!(host.pump(&mut player, 100_000, |p| p.is_playing() && p.current_time() >= 1.0)?);

    player.seek(6.0)?;
    assert!(player.is_seeking());
    assert!(host.pump(&mut player, 100_000, |p| !p.is_seeking())?);

    assert_eq!(player.state(), PlaybackState::Playing);
    assert_eq!(player.seek_state(), SeekState::Idle);
    assert!(host.notifications.contains(&host::Notification::Seeked));
    let report = player.last_seek().cloned().ok_or_else(|| anyhow::anyhow!("no report"))?;
    let frame = report.frame_timestamp.unwrap_or(f64::NAN);
    assert!((frame - 6.0).abs() <= 1.0 / 25.0 + 1e-9);
    let resumed = player.current_time();
    assert!((6.0..6.02).contains(&resumed));

    let drawn = host.frames.timestamps().len();
    let buffers = host.audio.buffers();
    assert!(host.pump(&mut player, 100_000, |p| p.current_time() >= 6.2)?);

    let after = host.frames.timestamps()[drawn..].to_vec();
    assert!(after.len() >= 3);
    assert!(after.iter().all(|&ts| ts >= frame));
    assert!(after.windows(2).all(|w| w[0] < w[1]));
    assert!(host.audio.buffers() > buffers);
    assert!(player.is_playing());
    Ok(())
}
