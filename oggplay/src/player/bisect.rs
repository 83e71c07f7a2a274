/// Binary search driver over an inclusive integer range.
///
/// Each iteration computes the midpoint and hands `(start, end, midpoint)`
/// to the probe, which starts whatever work decides the direction and
/// returns whether the search should go on. The caller later calls
/// [`left`](Bisector::left) or [`right`](Bisector::right) with the
/// outcome. The bisector never detects exhaustion itself; a probe that
/// refuses a repeated midpoint is the usual way to stop.
#[derive(Debug, Clone)]
pub struct Bisector<F> {
    start: u64,
    end: u64,
    position: u64,
    probes: usize,
    probe: F,
}

impl<F> Bisector<F>
where
    F: FnMut(u64, u64, u64) -> bool,
{
    pub fn new(start: u64, end: u64, probe: F) -> Self {
        Self {
            start,
            end: end.max(start),
            position: start,
            probes: 0,
            probe,
        }
    }

    fn iterate(&mut self) -> bool {
        self.probes += 1;
        self.position = self.start + (self.end - self.start) / 2;
        (self.probe)(self.start, self.end, self.position)
    }

    pub fn start(&mut self) -> bool {
        self.iterate()
    }

    /// Continues in `[start, midpoint]`.
    pub fn left(&mut self) -> bool {
        self.end = self.position;
        self.iterate()
    }

    /// Continues in `[midpoint, end]`.
    pub fn right(&mut self) -> bool {
        self.start = self.position;
        self.iterate()
    }

    /// Latest midpoint.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn range(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    /// Number of times the probe has been invoked.
    pub fn probes(&self) -> usize {
        self.probes
    }
}

#[cfg(test)]
fn search(end: u64, target: u64) -> (u64, Vec<u64>) {
    use std::cmp::Ordering;

    let mut seen = Vec::new();
    let mut bisector = Bisector::new(0, end, |_, _, position| {
        if seen.last() == Some(&position) {
            return false;
        }
        seen.push(position);
        true
    });

    let mut going = bisector.start();
    while going {
        going = match bisector.position().cmp(&target) {
            Ordering::Less => bisector.right(),
            Ordering::Greater => bisector.left(),
            Ordering::Equal => false,
        };
    }

    let last = bisector.position();
    (last, seen)
}

#[test]
fn converges_within_log_bound() {
    let n = 1001u64;
    let bound = (n as f64).log2().ceil() as usize + 1;

    for target in [0, 1, 250, 500, 637, 999, 1000] {
        let (last, seen) = search(n - 1, target);
        assert!(seen.len() <= bound, "{target}: {} probes", seen.len());
        assert!(last.abs_diff(target) <= 1, "{target}: stopped at {last}");
    }
}

#[test]
fn narrows_inclusively() {
    let mut calls = Vec::new();
    let mut bisector = Bisector::new(10, 20, |s, e, p| {
        calls.push((s, e, p));
        true
    });

    bisector.start();
    bisector.left();
    bisector.right();
    assert_eq!(bisector.range(), (12, 15));
    assert_eq!(bisector.probes(), 3);
    drop(bisector);

    assert_eq!(calls, [(10, 20, 15), (10, 15, 12), (12, 15, 13)]);
}
