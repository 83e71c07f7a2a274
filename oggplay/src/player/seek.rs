use std::cell::Cell;
use std::rc::Rc;

use log::{debug, trace};

use crate::player::PlaybackState;
use crate::player::bisect::Bisector;

/// Upper bound on bisection probes for one search.
pub const MAX_PROBES: usize = 64;

/// Phase of an in-flight seek.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SeekState {
    #[default]
    Idle,
    BisectingToTarget,
    BisectingToKeyframe,
    LinearAdvanceToTarget,
}

/// How the decode position for a seek was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPath {
    /// Jumped straight to an indexed keypoint.
    Index,
    /// Searched byte offsets by decoded timestamp.
    Bisection,
}

/// Outcome of the latest completed seek.
#[derive(Debug, Clone, PartialEq)]
pub struct SeekReport {
    pub target: f64,
    pub path: SeekPath,
    pub probes: usize,
    /// Timestamp of the frame drawn when the seek completed.
    pub frame_timestamp: Option<f64>,
    /// Start time of the first audio packet after the seek.
    pub audio_timestamp: Option<f64>,
}

/// Where a probed timestamp lies relative to the bisection target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Earlier,
    Later,
    Hit,
}

impl Direction {
    /// Classifies a decoded item starting at `timestamp` and lasting
    /// `duration`; anything within one duration of `target` is a hit.
    pub fn of(timestamp: f64, duration: f64, target: f64) -> Self {
        if timestamp - duration > target {
            Self::Earlier
        } else if timestamp + duration < target {
            Self::Later
        } else {
            Self::Hit
        }
    }

    /// Classifies a probe against a keyframe: the keyframe must not lie
    /// before the probed item, and the item may start at most one duration
    /// ahead of it.
    pub fn of_keyframe(timestamp: f64, duration: f64, keyframe: f64) -> Self {
        if timestamp > keyframe {
            Self::Earlier
        } else if timestamp + duration < keyframe {
            Self::Later
        } else {
            Self::Hit
        }
    }
}

type ProbeFn = Box<dyn FnMut(u64, u64, u64) -> bool>;

/// State of one seek request, from acceptance until the decoder reaches
/// the target.
pub(crate) struct SeekJob {
    pub state: SeekState,
    pub target: f64,
    pub bisect_target: f64,
    pub path: SeekPath,
    /// Playback state to restore once the seek completes.
    pub resume: PlaybackState,
    pub probes: usize,
    /// The range is exhausted; the next probe result is taken as the hit.
    converged: bool,
    bisector: Option<Bisector<ProbeFn>>,
    request: Rc<Cell<Option<u64>>>,
}

impl Default for SeekJob {
    fn default() -> Self {
        Self {
            state: SeekState::Idle,
            target: 0.0,
            bisect_target: 0.0,
            path: SeekPath::Index,
            resume: PlaybackState::Paused,
            probes: 0,
            converged: false,
            bisector: None,
            request: Rc::new(Cell::new(None)),
        }
    }
}

impl SeekJob {
    pub fn begin(&mut self, target: f64, resume: PlaybackState) {
        *self = Self {
            target,
            bisect_target: target,
            resume,
            ..Self::default()
        };
    }

    /// Starts a bisection over `[0, last_byte]` towards `time`. Returns the
    /// first offset to probe.
    pub fn bisect(&mut self, state: SeekState, time: f64, last_byte: u64) -> Option<u64> {
        self.state = state;
        self.path = SeekPath::Bisection;
        self.bisect_target = time;
        self.converged = false;

        let request = self.request.clone();
        let mut last = None;
        let probe: ProbeFn = Box::new(move |start, end, position| {
            if last == Some(position) {
                trace!("Probe at {position} repeats; [{start}, {end}] exhausted");
                return false;
            }
            last = Some(position);
            request.set(Some(position));
            true
        });

        let mut bisector = Bisector::new(0, last_byte, probe);
        let offset = if bisector.start() {
            self.request.take()
        } else {
            None
        };
        self.bisector = Some(bisector);
        self.count(offset)
    }

    /// Narrows the search in `direction`. Returns the next offset to probe,
    /// or `None` once the search has converged.
    pub fn narrow(&mut self, direction: Direction) -> Option<u64> {
        let bisector = self.bisector.as_mut()?;
        if bisector.probes() >= MAX_PROBES {
            debug!("Bisection stopped after {MAX_PROBES} probes");
            return None;
        }

        let going = match direction {
            Direction::Earlier => bisector.left(),
            Direction::Later => bisector.right(),
            Direction::Hit => false,
        };
        let offset = if going { self.request.take() } else { None };
        self.count(offset)
    }

    fn count(&mut self, offset: Option<u64>) -> Option<u64> {
        if offset.is_some() {
            self.probes += 1;
        }
        offset
    }

    /// Lower bound of the remaining search range.
    pub fn range_start(&self) -> u64 {
        self.bisector.as_ref().map_or(0, |b| b.range().0)
    }

    pub fn converge(&mut self) {
        self.converged = true;
        self.bisector = None;
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }

    pub fn linear(&mut self) {
        self.state = SeekState::LinearAdvanceToTarget;
        self.converged = false;
        self.bisector = None;
    }

    pub fn finish(&mut self) {
        self.state = SeekState::Idle;
        self.converged = false;
        self.bisector = None;
    }

    pub fn is_active(&self) -> bool {
        self.state != SeekState::Idle
    }
}

#[test]
fn classifies_probe_timestamps() {
    let frame = 1.0 / 25.0;
    assert_eq!(Direction::of(4.2, frame, 4.0), Direction::Earlier);
    assert_eq!(Direction::of(3.8, frame, 4.0), Direction::Later);
    assert_eq!(Direction::of(4.0, frame, 4.0), Direction::Hit);
    assert_eq!(Direction::of(3.97, frame, 4.0), Direction::Hit);

    assert_eq!(Direction::of_keyframe(4.04, frame, 4.0), Direction::Earlier);
    assert_eq!(Direction::of_keyframe(3.97, frame, 4.0), Direction::Hit);
    assert_eq!(Direction::of_keyframe(3.9, frame, 4.0), Direction::Later);
}

#[test]
fn job_stops_on_repeated_offset() {
    let mut job = SeekJob::default();
    job.begin(1.0, PlaybackState::Playing);

    assert_eq!(job.bisect(SeekState::BisectingToTarget, 1.0, 3), Some(1));
    assert_eq!(job.narrow(Direction::Later), Some(2));
    assert_eq!(job.narrow(Direction::Earlier), Some(1));
    assert_eq!(job.narrow(Direction::Later), None);
    assert_eq!(job.probes, 3);
    assert_eq!(job.range_start(), 1);
    assert_eq!(job.path, SeekPath::Bisection);

    job.converge();
    assert!(job.is_converged());
    assert_eq!(job.narrow(Direction::Later), None);

    job.finish();
    assert!(!job.is_active());
}
