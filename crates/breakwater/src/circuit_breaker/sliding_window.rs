//! Sliding aggregation of call outcomes.
//!
//! A window records `(duration, failed)` pairs and answers with a
//! [`Snapshot`] of totals and rates. Two aggregations exist:
//!
//! - [`CountWindow`]: the last N outcomes in a round-robin slot array;
//!   recording is O(1) because the overwritten outcome is subtracted from
//!   the running totals as the new one is added.
//! - [`TimeWindow`]: one-second buckets of partial totals covering the last
//!   N seconds; stale buckets are evicted as time advances.
//!
//! Rates are reported as `-1.0` until the window holds its minimum number of
//! calls, so an un-warmed window can never trip a threshold.

use std::time::Duration;

/// Rate value meaning "not enough calls recorded to evaluate".
pub const RATE_NOT_EVALUABLE: f32 = -1.0;

/// Aggregated view of the window's contents.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Snapshot {
    /// Outcomes currently inside the window.
    pub total_calls: u32,
    /// Outcomes recorded as failures.
    pub failed_calls: u32,
    /// Outcomes slower than the slow-call threshold.
    pub slow_calls: u32,
    /// Failures × 100 / total, or [`RATE_NOT_EVALUABLE`].
    pub failure_rate: f32,
    /// Slow calls × 100 / total, or [`RATE_NOT_EVALUABLE`].
    pub slow_call_rate: f32,
}

#[derive(Clone, Copy, Debug, Default)]
struct Totals {
    calls: u32,
    failures: u32,
    slow: u32,
}

impl Totals {
    fn add(&mut self, failed: bool, slow: bool) {
        self.calls += 1;
        self.failures += u32::from(failed);
        self.slow += u32::from(slow);
    }

    fn subtract(&mut self, failed: bool, slow: bool) {
        self.calls = self.calls.saturating_sub(1);
        self.failures = self.failures.saturating_sub(u32::from(failed));
        self.slow = self.slow.saturating_sub(u32::from(slow));
    }

    fn snapshot(&self, minimum: u32) -> Snapshot {
        let (failure_rate, slow_call_rate) = if self.calls < minimum {
            (RATE_NOT_EVALUABLE, RATE_NOT_EVALUABLE)
        } else {
            (
                self.failures as f32 * 100.0 / self.calls as f32,
                self.slow as f32 * 100.0 / self.calls as f32,
            )
        };
        Snapshot {
            total_calls: self.calls,
            failed_calls: self.failures,
            slow_calls: self.slow,
            failure_rate,
            slow_call_rate,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Call {
    failed: bool,
    slow: bool,
}

/// Count-based window over the last `size` outcomes.
///
/// Outcomes occupy a fixed slot array written round-robin: while filling,
/// each record lands in the next free slot; once full, the write cursor
/// wraps and each record displaces the oldest outcome, whose contribution
/// is subtracted from the running totals.
#[derive(Debug)]
pub struct CountWindow {
    slots: Vec<Call>,
    write_at: usize,
    size: usize,
    totals: Totals,
    slow_threshold: Duration,
}

impl CountWindow {
    /// Creates a window over the last `size` calls (clamped to at least
    /// one). The minimum number of calls for rate evaluation equals `size`.
    pub fn new(size: u32, slow_threshold: Duration) -> Self {
        let size = size.max(1) as usize;
        Self {
            slots: Vec::with_capacity(size),
            write_at: 0,
            size,
            totals: Totals::default(),
            slow_threshold,
        }
    }

    /// Records one outcome and returns the updated snapshot.
    pub fn record(&mut self, duration: Duration, failed: bool) -> Snapshot {
        let call = Call { failed, slow: duration >= self.slow_threshold };
        if self.slots.len() < self.size {
            self.slots.push(call);
        } else {
            let displaced = std::mem::replace(&mut self.slots[self.write_at], call);
            self.totals.subtract(displaced.failed, displaced.slow);
        }
        self.write_at = (self.write_at + 1) % self.size;
        self.totals.add(call.failed, call.slow);
        self.snapshot()
    }

    /// Current aggregate view.
    pub fn snapshot(&self) -> Snapshot {
        self.totals.snapshot(self.size as u32)
    }

    /// Maximum number of buffered outcomes.
    pub fn size(&self) -> u32 {
        self.size as u32
    }

    /// Forgets every recorded outcome.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.write_at = 0;
        self.totals = Totals::default();
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Bucket {
    totals: Totals,
}

/// Time-based window over the last `window_secs` seconds.
///
/// Callers pass the elapsed time since window creation on every operation;
/// the window itself holds no clock.
#[derive(Debug)]
pub struct TimeWindow {
    buckets: Vec<Bucket>,
    totals: Totals,
    slow_threshold: Duration,
    minimum: u32,
    head_sec: u64,
}

impl TimeWindow {
    /// Creates a window covering `window_secs` seconds that evaluates rates
    /// once `minimum` calls are buffered.
    pub fn new(window_secs: u32, minimum: u32, slow_threshold: Duration) -> Self {
        let window_secs = window_secs.max(1);
        Self {
            buckets: vec![Bucket::default(); window_secs as usize],
            totals: Totals::default(),
            slow_threshold,
            minimum,
            head_sec: 0,
        }
    }

    fn advance(&mut self, elapsed: Duration) {
        let now_sec = elapsed.as_secs();
        if now_sec <= self.head_sec {
            return;
        }
        let span = self.buckets.len() as u64;
        if now_sec - self.head_sec >= span {
            // Everything buffered is stale.
            for bucket in &mut self.buckets {
                *bucket = Bucket::default();
            }
            self.totals = Totals::default();
        } else {
            for sec in (self.head_sec + 1)..=now_sec {
                let idx = (sec % span) as usize;
                let stale = self.buckets[idx];
                self.totals.calls = self.totals.calls.saturating_sub(stale.totals.calls);
                self.totals.failures = self.totals.failures.saturating_sub(stale.totals.failures);
                self.totals.slow = self.totals.slow.saturating_sub(stale.totals.slow);
                self.buckets[idx] = Bucket::default();
            }
        }
        self.head_sec = now_sec;
    }

    /// Records one outcome at `elapsed` since creation.
    pub fn record(&mut self, elapsed: Duration, duration: Duration, failed: bool) -> Snapshot {
        self.advance(elapsed);
        let slow = duration >= self.slow_threshold;
        let span = self.buckets.len() as u64;
        let idx = (self.head_sec % span) as usize;
        self.buckets[idx].totals.add(failed, slow);
        self.totals.add(failed, slow);
        self.totals.snapshot(self.minimum)
    }

    /// Aggregate view at `elapsed` since creation.
    pub fn snapshot(&mut self, elapsed: Duration) -> Snapshot {
        self.advance(elapsed);
        self.totals.snapshot(self.minimum)
    }

    /// The configured minimum number of calls.
    pub fn minimum(&self) -> u32 {
        self.minimum
    }

    /// Forgets every recorded outcome.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            *bucket = Bucket::default();
        }
        self.totals = Totals::default();
    }
}

/// The window actually held by a circuit breaker state.
#[derive(Debug)]
pub(crate) enum Window {
    Count(CountWindow),
    Time(TimeWindow),
}

impl Window {
    pub(crate) fn record(
        &mut self,
        elapsed: Duration,
        duration: Duration,
        failed: bool,
    ) -> Snapshot {
        match self {
            Window::Count(w) => w.record(duration, failed),
            Window::Time(w) => w.record(elapsed, duration, failed),
        }
    }

    pub(crate) fn snapshot(&mut self, elapsed: Duration) -> Snapshot {
        match self {
            Window::Count(w) => w.snapshot(),
            Window::Time(w) => w.snapshot(elapsed),
        }
    }

    /// Upper bound on buffered outcomes, reported by metrics.
    pub(crate) fn max_buffered(&self) -> u32 {
        match self {
            Window::Count(w) => w.size(),
            Window::Time(w) => w.minimum(),
        }
    }
}
