//! In-process host for a [`Player`]: a reader-backed transport, a virtual
//! clock and recording sinks, driven by [`Host::pump`].
//!
//! Nothing here waits on wall-clock time. Timer deadlines are met by
//! advancing the virtual clock, so a whole playback session runs as fast
//! as the decoder can go.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use anyhow::Result;
use log::trace;

use crate::player::{
    AudioSink, Collaborators, FrameSink, Player, PlayerDelegate, PlayerEvent, Timer, Transport,
};
use crate::structs::audio::{AudioBuffer, AudioLayout};
use crate::structs::frame::FrameBuffer;
use crate::utils::errors::TransportError;

/// Pending notifications for the player, shared with the transport.
#[derive(Debug, Clone, Default)]
pub struct EventQueue(Rc<RefCell<VecDeque<PlayerEvent>>>);

impl EventQueue {
    pub fn push(&self, event: PlayerEvent) {
        self.0.borrow_mut().push_back(event);
    }

    pub fn pop(&self) -> Option<PlayerEvent> {
        self.0.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Drops undelivered input from a previous read position.
    fn discard_input(&self) {
        self.0.borrow_mut().retain(|e| {
            !matches!(
                e,
                PlayerEvent::Data(_) | PlayerEvent::Done | PlayerEvent::Buffered
            )
        });
    }
}

/// [`Transport`] over any seekable reader. Reads complete immediately and
/// are delivered through the [`EventQueue`].
pub struct ReaderTransport<R> {
    reader: R,
    queue: EventQueue,
    total: u64,
    read: u64,
    seekable: bool,
    headers: Vec<(String, String)>,
}

impl<R: Read + Seek> ReaderTransport<R> {
    pub fn new(reader: R, queue: EventQueue) -> Self {
        Self {
            reader,
            queue,
            total: 0,
            read: 0,
            seekable: true,
            headers: Vec::new(),
        }
    }

    /// Adds a response header, e.g. `X-Content-Duration`.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Reports the input as a stream of unknown length.
    pub fn non_seekable(mut self) -> Self {
        self.seekable = false;
        self
    }

    fn fail(&self, e: std::io::Error) {
        let e = TransportError::Io(e.to_string());
        self.queue.push(PlayerEvent::Error(e.to_string()));
    }
}

impl<R: Read + Seek> Transport for ReaderTransport<R> {
    fn open(&mut self) {
        let size = self
            .reader
            .seek(SeekFrom::End(0))
            .and_then(|end| self.reader.seek(SeekFrom::Start(0)).map(|_| end));

        match size {
            Ok(end) => {
                self.total = end;
                self.queue.push(PlayerEvent::Started);
            }
            Err(e) => self.fail(e),
        }
    }

    fn read_bytes(&mut self, max: usize) {
        let mut buf = vec![0u8; max.max(1)];
        match self.reader.read(&mut buf) {
            Ok(0) => self.queue.push(PlayerEvent::Done),
            Ok(n) => {
                buf.truncate(n);
                self.read += n as u64;
                self.queue.push(PlayerEvent::Buffered);
                self.queue.push(PlayerEvent::Data(buf));
            }
            Err(e) => self.fail(e),
        }
    }

    fn seek(&mut self, offset: u64) {
        self.queue.discard_input();
        if let Err(e) = self.reader.seek(SeekFrom::Start(offset)) {
            self.fail(e);
        }
    }

    fn abort(&mut self) {
        self.queue.discard_input();
    }

    fn response_header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    fn bytes_total(&self) -> u64 {
        if self.seekable { self.total } else { 0 }
    }

    fn bytes_buffered(&self) -> u64 {
        self.total
    }

    fn bytes_read(&self) -> u64 {
        self.read
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }
}

/// Shared virtual time and the earliest pending timer deadline.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    now: Rc<Cell<f64>>,
    deadline: Rc<Cell<Option<f64>>>,
}

impl VirtualClock {
    pub fn now(&self) -> f64 {
        self.now.get()
    }

    pub fn advance_to(&self, time: f64) {
        if time > self.now.get() {
            self.now.set(time);
        }
    }

    fn schedule(&self, at: f64) {
        let at = self.deadline.get().map_or(at, |d| d.min(at));
        self.deadline.set(Some(at));
    }

    fn take_deadline(&self) -> Option<f64> {
        self.deadline.take()
    }
}

pub struct VirtualTimer(VirtualClock);

impl VirtualTimer {
    pub fn new(clock: VirtualClock) -> Self {
        Self(clock)
    }
}

impl Timer for VirtualTimer {
    fn timestamp(&self) -> f64 {
        self.0.now()
    }

    fn set_timeout(&mut self, delay: f64) {
        self.0.schedule(self.0.now() + delay.max(0.0));
    }
}

/// Keeps every drawn frame.
#[derive(Debug, Clone, Default)]
pub struct MemoryFrameSink(Rc<RefCell<Vec<FrameBuffer>>>);

impl MemoryFrameSink {
    pub fn timestamps(&self) -> Vec<f64> {
        self.0.borrow().iter().map(|f| f.timestamp).collect()
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.0.borrow().last().map(|f| f.timestamp)
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn frames(&self) -> Vec<FrameBuffer> {
        self.0.borrow().clone()
    }
}

impl FrameSink for MemoryFrameSink {
    fn draw_frame(&mut self, frame: &FrameBuffer) {
        self.0.borrow_mut().push(frame.clone());
    }
}

/// Rounding residue left in the queue once it has played out.
const DRAINED: f64 = 1e-9;

#[derive(Debug, Default)]
struct AudioDevice {
    layout: Option<AudioLayout>,
    running: bool,
    muted: bool,
    played: f64,
    pending: f64,
    updated: f64,
    buffers: usize,
    samples: usize,
}

impl AudioDevice {
    /// Plays queued audio up to `now`. Returns true when the queue just ran
    /// dry.
    fn advance(&mut self, now: f64) -> bool {
        let mut drained = false;
        if self.running && self.pending > 0.0 {
            let played = (now - self.updated).clamp(0.0, self.pending);
            self.played += played;
            self.pending -= played;
            if self.pending < DRAINED {
                self.played += self.pending;
                self.pending = 0.0;
                drained = true;
            }
        }
        self.updated = now;
        drained
    }
}

/// Audio output that plays silently against the virtual clock.
#[derive(Debug, Clone)]
pub struct NullAudioSink {
    clock: VirtualClock,
    device: Rc<RefCell<AudioDevice>>,
    starved: Option<EventQueue>,
}

impl NullAudioSink {
    pub fn new(clock: VirtualClock) -> Self {
        Self {
            clock,
            device: Rc::default(),
            starved: None,
        }
    }

    /// Posts [`PlayerEvent::AudioStarved`] to `queue` whenever queued audio
    /// runs out while output is running.
    pub fn with_events(mut self, queue: EventQueue) -> Self {
        self.starved = Some(queue);
        self
    }

    fn device(&self) -> std::cell::RefMut<'_, AudioDevice> {
        let mut device = self.device.borrow_mut();
        if device.advance(self.clock.now()) {
            trace!("Audio output starved at {:.3}s", device.played);
            if let Some(queue) = &self.starved {
                queue.push(PlayerEvent::AudioStarved);
            }
        }
        device
    }

    pub fn layout(&self) -> Option<AudioLayout> {
        self.device.borrow().layout
    }

    /// Number of buffers received.
    pub fn buffers(&self) -> usize {
        self.device.borrow().buffers
    }

    /// Number of samples per channel received.
    pub fn samples(&self) -> usize {
        self.device.borrow().samples
    }

    pub fn is_muted(&self) -> bool {
        self.device.borrow().muted
    }
}

impl AudioSink for NullAudioSink {
    fn configure(&mut self, layout: &AudioLayout) {
        self.device().layout = Some(*layout);
    }

    fn start(&mut self) {
        self.device().running = true;
    }

    fn stop(&mut self) {
        let mut device = self.device();
        device.running = false;
        device.pending = 0.0;
    }

    fn buffer_data(&mut self, buffer: AudioBuffer) {
        let mut device = self.device();
        device.pending += buffer.duration();
        device.buffers += 1;
        device.samples += buffer.sample_count;
    }

    fn playback_position(&self) -> f64 {
        self.device().played
    }

    fn buffered_time(&self) -> f64 {
        self.device().pending
    }

    fn mute(&mut self) {
        self.device().muted = true;
    }

    fn unmute(&mut self) {
        self.device().muted = false;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    LoadedMetadata,
    Play,
    Pause,
    Ended,
    Seeked,
    Error(String),
}

/// Remembers every delegate callback in order.
#[derive(Debug, Clone, Default)]
pub struct RecordingDelegate(Rc<RefCell<Vec<Notification>>>);

impl RecordingDelegate {
    pub fn all(&self) -> Vec<Notification> {
        self.0.borrow().clone()
    }

    pub fn contains(&self, notification: &Notification) -> bool {
        self.0.borrow().contains(notification)
    }

    fn record(&self, notification: Notification) {
        trace!("Delegate: {notification:?}");
        self.0.borrow_mut().push(notification);
    }
}

impl PlayerDelegate for RecordingDelegate {
    fn on_loaded_metadata(&mut self) {
        self.record(Notification::LoadedMetadata);
    }

    fn on_play(&mut self) {
        self.record(Notification::Play);
    }

    fn on_pause(&mut self) {
        self.record(Notification::Pause);
    }

    fn on_ended(&mut self) {
        self.record(Notification::Ended);
    }

    fn on_seeked(&mut self) {
        self.record(Notification::Seeked);
    }

    fn on_error(&mut self, message: &str) {
        self.record(Notification::Error(message.to_string()));
    }
}

/// The shared halves of every host collaborator.
#[derive(Debug, Clone)]
pub struct Host {
    pub queue: EventQueue,
    pub clock: VirtualClock,
    pub frames: MemoryFrameSink,
    pub audio: NullAudioSink,
    pub notifications: RecordingDelegate,
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    pub fn new() -> Self {
        let clock = VirtualClock::default();
        let queue = EventQueue::default();
        Self {
            audio: NullAudioSink::new(clock.clone()).with_events(queue.clone()),
            queue,
            clock,
            frames: MemoryFrameSink::default(),
            notifications: RecordingDelegate::default(),
        }
    }

    pub fn collaborators(&self, transport: impl Transport + 'static) -> Collaborators {
        Collaborators {
            transport: Box::new(transport),
            timer: Box::new(VirtualTimer::new(self.clock.clone())),
            frame_sink: Box::new(self.frames.clone()),
            audio_sink: Some(Box::new(self.audio.clone())),
            delegate: Box::new(self.notifications.clone()),
        }
    }

    /// Delivers events until `done` holds, nothing is pending, or `limit`
    /// events have been handled. Queued events go first; otherwise the
    /// clock jumps to the next timer deadline. Returns whether `done` held.
    pub fn pump(
        &self,
        player: &mut Player,
        limit: usize,
        mut done: impl FnMut(&Player) -> bool,
    ) -> Result<bool> {
        for _ in 0..limit {
            if done(player) {
                return Ok(true);
            }

            let event = match self.queue.pop() {
                Some(event) => event,
                None => match self.clock.take_deadline() {
                    Some(at) => {
                        self.clock.advance_to(at);
                        PlayerEvent::Timeout
                    }
                    None => break,
                },
            };
            player.handle_event(event)?;
        }
        Ok(done(player))
    }
}

#[test]
fn transport_reads_and_repositions() {
    use std::io::Cursor;

    let queue = EventQueue::default();
    let mut transport = ReaderTransport::new(Cursor::new((0u8..100).collect::<Vec<_>>()), queue.clone())
        .with_header("X-Content-Duration", "12.5");

    transport.open();
    assert_eq!(queue.pop(), Some(PlayerEvent::Started));
    assert_eq!(transport.bytes_total(), 100);
    assert_eq!(transport.response_header("x-content-duration").as_deref(), Some("12.5"));

    transport.read_bytes(40);
    transport.seek(90);
    assert!(queue.is_empty());

    transport.read_bytes(40);
    assert_eq!(queue.pop(), Some(PlayerEvent::Buffered));
    assert_eq!(queue.pop(), Some(PlayerEvent::Data((90u8..100).collect())));
    transport.read_bytes(40);
    assert_eq!(queue.pop(), Some(PlayerEvent::Done));
    assert_eq!(transport.bytes_read(), 50);
}

#[test]
fn null_sink_plays_only_what_was_queued() {
    use std::sync::Arc;

    let clock = VirtualClock::default();
    let mut sink = NullAudioSink::new(clock.clone());
    let layout = AudioLayout {
        channels: 1,
        sample_rate: 100,
    };
    sink.configure(&layout);
    sink.start();
    sink.buffer_data(AudioBuffer {
        layout: Arc::new(layout),
        sample_count: 50,
        samples: vec![vec![0.0; 50]],
        timestamp: Some(0.0),
    });

    clock.advance_to(0.2);
    assert!((sink.playback_position() - 0.2).abs() < 1e-9);
    assert!((sink.buffered_time() - 0.3).abs() < 1e-9);

    clock.advance_to(2.0);
    assert!((sink.playback_position() - 0.5).abs() < 1e-9);
    assert_eq!(sink.buffered_time(), 0.0);
    assert_eq!(sink.samples(), 50);
}

#[test]
fn null_sink_reports_starvation_once() {
    use std::sync::Arc;

    let clock = VirtualClock::default();
    let queue = EventQueue::default();
    let mut sink = NullAudioSink::new(clock.clone()).with_events(queue.clone());
    let layout = AudioLayout {
        channels: 2,
        sample_rate: 10,
    };
    sink.configure(&layout);
    sink.start();
    sink.buffer_data(AudioBuffer {
        layout: Arc::new(layout),
        sample_count: 5,
        samples: vec![vec![0.0; 5]; 2],
        timestamp: Some(0.0),
    });

    clock.advance_to(0.25);
    assert!(sink.buffered_time() > 0.0);
    assert_eq!(queue.pop(), None);

    clock.advance_to(1.0);
    assert_eq!(sink.buffered_time(), 0.0);
    assert_eq!(sink.playback_position(), 0.5);
    assert_eq!(queue.pop(), Some(PlayerEvent::AudioStarved));
    assert_eq!(queue.pop(), None);
}

#[test]
fn null_sink_clears_rounding_residue() {
    use std::sync::Arc;

    let clock = VirtualClock::default();
    let queue = EventQueue::default();
    let mut sink = NullAudioSink::new(clock.clone()).with_events(queue.clone());
    let layout = Arc::new(AudioLayout {
        channels: 1,
        sample_rate: 10,
    });
    sink.configure(&layout);
    sink.start();
    for samples in [1, 2] {
        sink.buffer_data(AudioBuffer {
            layout: layout.clone(),
            sample_count: samples,
            samples: vec![vec![0.0; samples]],
            timestamp: None,
        });
    }

    // 0.1 + 0.2 queued leaves a residue once 0.3 seconds have played.
    clock.advance_to(0.3);
    assert_eq!(sink.buffered_time(), 0.0);
    assert!((sink.playback_position() - 0.3).abs() < 1e-9);
    assert_eq!(queue.pop(), Some(PlayerEvent::AudioStarved));
}
