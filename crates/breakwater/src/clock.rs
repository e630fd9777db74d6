//! Monotonic time source behind every wait, refill and transition.
//!
//! Timeout and refresh arithmetic must never move backwards, so the clock
//! abstraction is deliberately narrow: a [`Clock`] only answers "where on
//! the monotonic timeline are we now". Wall-clock time (which NTP steps and
//! manual adjustments can move) is used solely to stamp events, and never
//! flows through this trait.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A monotonic time source.
///
/// Production code uses [`SystemClock`]; tests inject a [`MockClock`] and
/// advance it explicitly, which makes timeout behavior deterministic
/// without real delays.
pub trait Clock: Send + Sync + 'static {
    /// The current position on the monotonic timeline.
    fn now(&self) -> Instant;

    /// Time elapsed since `earlier`, saturating to zero so a reading taken
    /// before `earlier` can never produce a wait in the past.
    fn since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// The process monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A hand-driven clock for tests.
///
/// The clock holds an explicit position on the timeline rather than a
/// delta, and refuses to move backwards: every mutation lands at
/// `max(current, requested)`, so test code cannot accidentally violate the
/// monotonicity the primitives rely on. Clones share one position, which
/// lets the handle given to a primitive be driven from the test body.
#[derive(Debug, Clone)]
pub struct MockClock {
    timeline: Arc<Mutex<Timeline>>,
}

#[derive(Debug, Clone, Copy)]
struct Timeline {
    birth: Instant,
    position: Instant,
}

impl MockClock {
    /// Creates a clock frozen at its birth instant.
    pub fn new() -> Self {
        let birth = Instant::now();
        Self { timeline: Arc::new(Mutex::new(Timeline { birth, position: birth })) }
    }

    fn timeline(&self) -> std::sync::MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut timeline = self.timeline();
        timeline.position += duration;
    }

    /// Moves the clock forward by `millis` milliseconds.
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Moves the clock to `elapsed` past its birth. A target behind the
    /// current position is clamped: the clock never rewinds.
    pub fn advance_to(&self, elapsed: Duration) {
        let mut timeline = self.timeline();
        let target = timeline.birth + elapsed;
        if target > timeline.position {
            timeline.position = target;
        }
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        let timeline = self.timeline();
        timeline.position.saturating_duration_since(timeline.birth)
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.timeline().position
    }
}
