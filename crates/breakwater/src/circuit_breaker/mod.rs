//! Circuit breaker: a concurrent state machine over a sliding window of call
//! outcomes.
//!
//! A breaker starts `Closed` and records every guarded outcome into its
//! window. Once the window is full and the failure rate (or, when
//! configured, the slow-call rate) reaches its threshold the breaker opens
//! and denies permissions. After `wait_duration_in_open_state` it admits a
//! bounded set of probe calls (`HalfOpen`); their outcomes decide between
//! closing again and re-opening. Two special states bypass the machinery:
//! `Disabled` permits everything and records nothing, `ForcedOpen` denies
//! everything.
//!
//! Callers either use the permission protocol directly
//! ([`try_acquire_permission`](CircuitBreaker::try_acquire_permission) /
//! [`on_success`](CircuitBreaker::on_success) /
//! [`on_error`](CircuitBreaker::on_error)) or wrap the operation with
//! [`call`](CircuitBreaker::call) / [`execute`](CircuitBreaker::execute).

mod config;
pub mod sliding_window;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

pub use config::{
    CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerProperties, ErrorPredicate,
    SlidingWindowType,
};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, GuardError};
use crate::event::{EventPublisher, EventSubscription};
use crate::registry::Registry;
use sliding_window::{CountWindow, Snapshot, TimeWindow, Window};

/// The five circuit breaker states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Normal operation; outcomes are recorded and evaluated.
    Closed,
    /// Calls are denied until the open wait elapses.
    Open,
    /// A bounded number of probe calls decide the next state.
    HalfOpen,
    /// All calls permitted, nothing recorded.
    Disabled,
    /// All calls denied until manually changed.
    ForcedOpen,
}

impl State {
    /// Stable numeric identifier used in metrics.
    pub fn ordinal(self) -> u8 {
        match self {
            State::Closed => 0,
            State::Open => 1,
            State::HalfOpen => 2,
            State::Disabled => 3,
            State::ForcedOpen => 4,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Closed => "CLOSED",
            State::Open => "OPEN",
            State::HalfOpen => "HALF_OPEN",
            State::Disabled => "DISABLED",
            State::ForcedOpen => "FORCED_OPEN",
        };
        f.write_str(s)
    }
}

/// One circuit breaker lifecycle event.
#[derive(Clone, Debug)]
pub struct CircuitBreakerEvent {
    /// Name of the breaker that produced the event.
    pub circuit_breaker_name: String,
    /// Wall-clock time the event was created.
    pub created_at: DateTime<Utc>,
    pub kind: CircuitBreakerEventKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CircuitBreakerEventKind {
    /// A recorded success.
    Success { duration: Duration },
    /// A recorded failure.
    Error { duration: Duration },
    /// An error classified as ignored; no failure recorded.
    IgnoredError { duration: Duration },
    /// A denied permission request.
    NotPermitted,
    /// The state machine moved.
    StateTransition { from: State, to: State },
    /// The breaker was reset to pristine `Closed`.
    Reset,
}

/// Event surface of one breaker, with per-kind subscription helpers.
pub struct CircuitBreakerEventPublisher {
    inner: EventPublisher<CircuitBreakerEvent>,
}

impl CircuitBreakerEventPublisher {
    fn new() -> Self {
        Self { inner: EventPublisher::new() }
    }

    fn emit(&self, name: &str, kind: CircuitBreakerEventKind) {
        if !self.inner.has_consumers() {
            return;
        }
        self.inner.publish(CircuitBreakerEvent {
            circuit_breaker_name: name.to_string(),
            created_at: Utc::now(),
            kind,
        });
    }

    /// Registers a callback for every event.
    pub fn on_event(&self, consumer: impl Fn(&CircuitBreakerEvent) + Send + Sync + 'static) {
        self.inner.on_event(consumer);
    }

    /// Registers a callback for recorded successes.
    pub fn on_success(&self, consumer: impl Fn(&CircuitBreakerEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if matches!(e.kind, CircuitBreakerEventKind::Success { .. }) {
                consumer(e);
            }
        });
    }

    /// Registers a callback for recorded failures.
    pub fn on_error(&self, consumer: impl Fn(&CircuitBreakerEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if matches!(e.kind, CircuitBreakerEventKind::Error { .. }) {
                consumer(e);
            }
        });
    }

    /// Registers a callback for ignored errors.
    pub fn on_ignored_error(
        &self,
        consumer: impl Fn(&CircuitBreakerEvent) + Send + Sync + 'static,
    ) {
        self.inner.on_event(move |e| {
            if matches!(e.kind, CircuitBreakerEventKind::IgnoredError { .. }) {
                consumer(e);
            }
        });
    }

    /// Registers a callback for denied permissions.
    pub fn on_not_permitted(
        &self,
        consumer: impl Fn(&CircuitBreakerEvent) + Send + Sync + 'static,
    ) {
        self.inner.on_event(move |e| {
            if matches!(e.kind, CircuitBreakerEventKind::NotPermitted) {
                consumer(e);
            }
        });
    }

    /// Registers a callback for state transitions.
    pub fn on_state_transition(
        &self,
        consumer: impl Fn(&CircuitBreakerEvent) + Send + Sync + 'static,
    ) {
        self.inner.on_event(move |e| {
            if matches!(e.kind, CircuitBreakerEventKind::StateTransition { .. }) {
                consumer(e);
            }
        });
    }

    /// Registers a callback for resets.
    pub fn on_reset(&self, consumer: impl Fn(&CircuitBreakerEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if matches!(e.kind, CircuitBreakerEventKind::Reset) {
                consumer(e);
            }
        });
    }

    /// Creates a bounded ring subscription over all events.
    pub fn subscribe(&self, capacity: usize) -> EventSubscription<CircuitBreakerEvent> {
        self.inner.subscribe(capacity)
    }
}

/// Point-in-time metrics of one breaker.
#[derive(Clone, Copy, Debug)]
pub struct CircuitBreakerMetrics {
    pub state: State,
    /// Failure rate of the current window, or `-1.0` when not evaluable.
    pub failure_rate: f32,
    /// Slow-call rate of the current window, or `-1.0` when not evaluable.
    pub slow_call_rate: f32,
    /// Outcomes currently buffered in the active window.
    pub buffered_calls: u32,
    /// Upper bound of the active window (ring size for the current state).
    pub max_buffered_calls: u32,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub not_permitted_calls: u64,
    pub ignored_calls: u64,
}

struct Shared {
    state: State,
    window: Window,
    opened_at: Option<Instant>,
    /// Bumped on every transition to `Open`; lets a stale timer recognize
    /// that the breaker has moved on.
    open_generation: u64,
    half_open_inflight: u32,
    half_open_recorded: u32,
}

/// A named circuit breaker instance. Construct with
/// [`CircuitBreaker::of`] or through a [`CircuitBreakerRegistry`].
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: String,
    config: CircuitBreakerConfig,
    shared: RwLock<Shared>,
    successful: AtomicU64,
    failed: AtomicU64,
    not_permitted: AtomicU64,
    ignored: AtomicU64,
    events: CircuitBreakerEventPublisher,
    clock: Arc<C>,
    birth: Instant,
    weak: Weak<CircuitBreaker<C>>,
}

impl CircuitBreaker<SystemClock> {
    /// Creates a breaker named `name` with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics when the configuration is invalid; build configurations through
    /// [`CircuitBreakerConfig::builder`] to validate them first.
    pub fn of(name: impl Into<String>, config: CircuitBreakerConfig) -> Arc<Self> {
        Self::with_clock(name, config, SystemClock)
    }

    /// Creates a breaker with the default configuration.
    pub fn of_defaults(name: impl Into<String>) -> Arc<Self> {
        Self::of(name, CircuitBreakerConfig::default())
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Creates a breaker measuring time on `clock`. Tests pass a
    /// [`MockClock`](crate::clock::MockClock) to drive the open wait
    /// deterministically.
    ///
    /// # Panics
    ///
    /// Panics when the configuration is invalid.
    pub fn with_clock(name: impl Into<String>, config: CircuitBreakerConfig, clock: C) -> Arc<Self> {
        config.validate().expect("invalid circuit breaker configuration");
        let name = name.into();
        let clock = Arc::new(clock);
        let birth = clock.now();
        Arc::new_cyclic(|weak| {
            let window = closed_window(&config);
            Self {
                name,
                config,
                shared: RwLock::new(Shared {
                    state: State::Closed,
                    window,
                    opened_at: None,
                    open_generation: 0,
                    half_open_inflight: 0,
                    half_open_recorded: 0,
                }),
                successful: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                not_permitted: AtomicU64::new(0),
                ignored: AtomicU64::new(0),
                events: CircuitBreakerEventPublisher::new(),
                clock,
                birth,
                weak: weak.clone(),
            }
        })
    }

    /// The instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The immutable configuration this breaker was created with.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.shared.read().unwrap_or_else(PoisonError::into_inner).state
    }

    /// The breaker's event surface.
    pub fn event_publisher(&self) -> &CircuitBreakerEventPublisher {
        &self.events
    }

    fn elapsed(&self) -> Duration {
        self.clock.since(self.birth)
    }

    /// Non-blocking permission request.
    ///
    /// In `Open`, a denial increments the not-permitted counter by exactly
    /// one; once the open wait has elapsed the request itself drives the
    /// transition to `HalfOpen` and is admitted as a probe.
    pub fn try_acquire_permission(&self) -> bool {
        {
            let shared = self.shared.read().unwrap_or_else(PoisonError::into_inner);
            if matches!(shared.state, State::Closed | State::Disabled) {
                return true;
            }
        }

        let (permitted, events) = {
            let mut shared = self.shared.write().unwrap_or_else(PoisonError::into_inner);
            let mut events = Vec::new();
            let permitted = match shared.state {
                State::Closed | State::Disabled => true,
                State::ForcedOpen => false,
                State::Open => {
                    let wait_elapsed = shared.opened_at.is_some_and(|at| {
                        self.clock.since(at) >= self.config.wait_duration_in_open_state
                    });
                    if wait_elapsed {
                        if let Some(event) = self.transition_locked(&mut shared, State::HalfOpen) {
                            events.push(event);
                        }
                        self.admit_probe(&mut shared)
                    } else {
                        false
                    }
                }
                State::HalfOpen => self.admit_probe(&mut shared),
            };
            if !permitted {
                self.not_permitted.fetch_add(1, Ordering::Relaxed);
                events.push(CircuitBreakerEventKind::NotPermitted);
            }
            (permitted, events)
        };

        self.publish_all(events);
        permitted
    }

    /// Permission request that fails with
    /// [`GuardError::CallNotPermitted`] when denied.
    pub fn acquire_permission(&self) -> Result<(), GuardError> {
        if self.try_acquire_permission() {
            Ok(())
        } else {
            debug!(breaker = %self.name, state = %self.state(), "call not permitted");
            Err(GuardError::CallNotPermitted { name: self.name.clone() })
        }
    }

    /// Returns an acquired permission without recording an outcome, for
    /// cancel paths. Only half-open probe slots are tracked, so this is a
    /// no-op in other states.
    pub fn release_permission(&self) {
        let mut shared = self.shared.write().unwrap_or_else(PoisonError::into_inner);
        if shared.state == State::HalfOpen {
            shared.half_open_inflight = shared.half_open_inflight.saturating_sub(1);
        }
    }

    /// Records a successful call of the given duration.
    pub fn on_success(&self, duration: Duration) {
        self.record_outcome(duration, false);
    }

    /// Classifies and records a failed call.
    ///
    /// Errors matching the ignore predicate, or not matching a configured
    /// record predicate, only move the ignored counter and return any
    /// half-open probe slot.
    pub fn on_error(&self, duration: Duration, error: &(dyn std::error::Error + 'static)) {
        {
            let shared = self.shared.read().unwrap_or_else(PoisonError::into_inner);
            if shared.state == State::Disabled {
                return;
            }
        }

        if self.is_ignored(error) {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            self.release_permission();
            self.events.emit(&self.name, CircuitBreakerEventKind::IgnoredError { duration });
            return;
        }

        self.record_outcome(duration, true);
    }

    fn is_ignored(&self, error: &(dyn std::error::Error + 'static)) -> bool {
        if let Some(ignore) = &self.config.ignore_predicate {
            if ignore(error) {
                return true;
            }
        }
        if let Some(record) = &self.config.record_predicate {
            if !record(error) {
                return true;
            }
        }
        false
    }

    fn record_outcome(&self, duration: Duration, failed: bool) {
        let events = {
            let mut shared = self.shared.write().unwrap_or_else(PoisonError::into_inner);
            match shared.state {
                State::Disabled => return,
                State::Open | State::ForcedOpen => {
                    debug!(breaker = %self.name, "outcome reported without a permission");
                    return;
                }
                State::Closed => {
                    self.count_outcome(failed);
                    let elapsed = self.elapsed();
                    let snapshot = shared.window.record(elapsed, duration, failed);
                    let mut events = vec![outcome_event(duration, failed)];
                    // A success cannot worsen the failure rate, so only the
                    // slow-call rate is evaluated for it.
                    let trip = if failed {
                        self.should_trip(&snapshot)
                    } else {
                        self.slow_rate_trips(&snapshot)
                    };
                    if trip {
                        if let Some(event) = self.transition_locked(&mut shared, State::Open) {
                            events.push(event);
                        }
                    }
                    events
                }
                State::HalfOpen => {
                    self.count_outcome(failed);
                    shared.half_open_inflight = shared.half_open_inflight.saturating_sub(1);
                    shared.half_open_recorded += 1;
                    let elapsed = self.elapsed();
                    let snapshot = shared.window.record(elapsed, duration, failed);
                    let mut events = vec![outcome_event(duration, failed)];
                    if snapshot.failure_rate >= 0.0 {
                        // Probe buffer is full: decide.
                        let next =
                            if self.should_trip(&snapshot) { State::Open } else { State::Closed };
                        if let Some(event) = self.transition_locked(&mut shared, next) {
                            events.push(event);
                        }
                    }
                    events
                }
            }
        };
        self.publish_all(events);
    }

    fn count_outcome(&self, failed: bool) {
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.successful.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn should_trip(&self, snapshot: &Snapshot) -> bool {
        if snapshot.failure_rate >= 0.0
            && snapshot.failure_rate >= self.config.failure_rate_threshold
        {
            return true;
        }
        self.slow_rate_trips(snapshot)
    }

    fn slow_rate_trips(&self, snapshot: &Snapshot) -> bool {
        match self.config.slow_call_rate_threshold {
            Some(threshold) => {
                snapshot.slow_call_rate >= 0.0 && snapshot.slow_call_rate >= threshold
            }
            None => false,
        }
    }

    fn admit_probe(&self, shared: &mut Shared) -> bool {
        let budget = self.config.ring_buffer_size_in_half_open_state;
        if shared.half_open_inflight + shared.half_open_recorded < budget {
            shared.half_open_inflight += 1;
            true
        } else {
            false
        }
    }

    fn transition_locked(&self, shared: &mut Shared, to: State) -> Option<CircuitBreakerEventKind> {
        if shared.state == to {
            return None;
        }
        let from = shared.state;
        shared.state = to;
        match to {
            State::Closed => {
                shared.window = closed_window(&self.config);
                shared.opened_at = None;
                shared.half_open_inflight = 0;
                shared.half_open_recorded = 0;
            }
            State::Open => {
                shared.opened_at = Some(self.clock.now());
                shared.open_generation = shared.open_generation.wrapping_add(1);
                if self.config.automatic_transition_from_open_to_half_open_enabled {
                    self.schedule_half_open(shared.open_generation);
                }
            }
            State::HalfOpen => {
                shared.window = Window::Count(CountWindow::new(
                    self.config.ring_buffer_size_in_half_open_state,
                    self.config.slow_call_duration_threshold,
                ));
                shared.half_open_inflight = 0;
                shared.half_open_recorded = 0;
            }
            State::Disabled | State::ForcedOpen => {
                shared.opened_at = None;
            }
        }
        warn!(breaker = %self.name, %from, %to, "state transition");
        Some(CircuitBreakerEventKind::StateTransition { from, to })
    }

    /// Arms the timer that drives `Open` → `HalfOpen` without traffic. The
    /// timer runs on real time, so the lazy per-request path remains the
    /// authoritative fallback outside a tokio runtime.
    fn schedule_half_open(&self, generation: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(breaker = %self.name, "no tokio runtime; open wait is evaluated lazily");
            return;
        };
        let weak = self.weak.clone();
        let wait = self.config.wait_duration_in_open_state;
        handle.spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(breaker) = weak.upgrade() {
                breaker.half_open_after_wait(generation);
            }
        });
    }

    fn half_open_after_wait(&self, generation: u64) {
        let events = {
            let mut shared = self.shared.write().unwrap_or_else(PoisonError::into_inner);
            if shared.state == State::Open && shared.open_generation == generation {
                self.transition_locked(&mut shared, State::HalfOpen).into_iter().collect()
            } else {
                Vec::new()
            }
        };
        self.publish_all(events);
    }

    fn manual_transition(&self, to: State) {
        let events = {
            let mut shared = self.shared.write().unwrap_or_else(PoisonError::into_inner);
            self.transition_locked(&mut shared, to).into_iter().collect::<Vec<_>>()
        };
        self.publish_all(events);
    }

    /// Moves to `Closed` with a fresh window.
    pub fn transition_to_closed(&self) {
        self.manual_transition(State::Closed);
    }

    /// Moves to `Open` immediately.
    pub fn transition_to_open(&self) {
        self.manual_transition(State::Open);
    }

    /// Moves to `HalfOpen` immediately.
    pub fn transition_to_half_open(&self) {
        self.manual_transition(State::HalfOpen);
    }

    /// Permits every call and stops recording.
    pub fn transition_to_disabled(&self) {
        self.manual_transition(State::Disabled);
    }

    /// Denies every call until another manual transition.
    pub fn transition_to_forced_open(&self) {
        self.manual_transition(State::ForcedOpen);
    }

    /// Returns to pristine `Closed`: fresh window, zeroed counters.
    pub fn reset(&self) {
        let events = {
            let mut shared = self.shared.write().unwrap_or_else(PoisonError::into_inner);
            let mut events = Vec::new();
            if shared.state != State::Closed {
                events.push(CircuitBreakerEventKind::StateTransition {
                    from: shared.state,
                    to: State::Closed,
                });
            }
            shared.state = State::Closed;
            shared.window = closed_window(&self.config);
            shared.opened_at = None;
            shared.half_open_inflight = 0;
            shared.half_open_recorded = 0;
            events.push(CircuitBreakerEventKind::Reset);
            events
        };
        self.successful.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.not_permitted.store(0, Ordering::Relaxed);
        self.ignored.store(0, Ordering::Relaxed);
        self.publish_all(events);
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let (state, snapshot, max_buffered) = {
            let mut shared = self.shared.write().unwrap_or_else(PoisonError::into_inner);
            let elapsed = self.elapsed();
            let snapshot = shared.window.snapshot(elapsed);
            (shared.state, snapshot, shared.window.max_buffered())
        };
        CircuitBreakerMetrics {
            state,
            failure_rate: snapshot.failure_rate,
            slow_call_rate: snapshot.slow_call_rate,
            buffered_calls: snapshot.total_calls,
            max_buffered_calls: max_buffered,
            successful_calls: self.successful.load(Ordering::Relaxed),
            failed_calls: self.failed.load(Ordering::Relaxed),
            not_permitted_calls: self.not_permitted.load(Ordering::Relaxed),
            ignored_calls: self.ignored.load(Ordering::Relaxed),
        }
    }

    fn publish_all(&self, events: Vec<CircuitBreakerEventKind>) {
        for kind in events {
            self.events.emit(&self.name, kind);
        }
    }

    /// Runs a synchronous operation under this breaker.
    #[instrument(skip(self, operation), fields(breaker = %self.name))]
    pub fn call<F, T, E>(&self, operation: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.acquire_permission().map_err(GuardError::widen)?;
        let started = self.clock.now();
        match operation() {
            Ok(value) => {
                self.on_success(self.clock.since(started));
                Ok(value)
            }
            Err(error) => {
                self.on_error(self.clock.since(started), &error);
                Err(GuardError::Inner { source: error })
            }
        }
    }

    /// Runs an asynchronous operation under this breaker.
    #[instrument(skip(self, operation), fields(breaker = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.acquire_permission().map_err(GuardError::widen)?;
        let started = self.clock.now();
        match operation().await {
            Ok(value) => {
                self.on_success(self.clock.since(started));
                Ok(value)
            }
            Err(error) => {
                self.on_error(self.clock.since(started), &error);
                Err(GuardError::Inner { source: error })
            }
        }
    }
}

impl<C: Clock> std::fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn closed_window(config: &CircuitBreakerConfig) -> Window {
    match config.sliding_window_type {
        SlidingWindowType::CountBased => Window::Count(CountWindow::new(
            config.ring_buffer_size_in_closed_state,
            config.slow_call_duration_threshold,
        )),
        SlidingWindowType::TimeBased => Window::Time(TimeWindow::new(
            config.ring_buffer_size_in_closed_state,
            config.ring_buffer_size_in_closed_state,
            config.slow_call_duration_threshold,
        )),
    }
}

fn outcome_event(duration: Duration, failed: bool) -> CircuitBreakerEventKind {
    if failed {
        CircuitBreakerEventKind::Error { duration }
    } else {
        CircuitBreakerEventKind::Success { duration }
    }
}

/// Registry of named circuit breakers sharing named configurations.
pub struct CircuitBreakerRegistry {
    inner: Registry<CircuitBreaker, CircuitBreakerConfig>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry with the given default configuration.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self { inner: Registry::new(default_config) }
    }

    /// Creates a registry using [`CircuitBreakerConfig::default`].
    pub fn of_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Returns the breaker named `name`, creating it with the default
    /// configuration on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let config = self.inner.default_config();
        self.inner.compute_if_absent(name, || CircuitBreaker::of(name, (*config).clone()))
    }

    /// Returns the breaker named `name`, creating it with `config` on first
    /// use.
    pub fn get_with_config(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.inner.compute_if_absent(name, || CircuitBreaker::of(name, config))
    }

    /// Returns the breaker named `name`, creating it from the configuration
    /// produced by `config_supplier` on first use.
    pub fn get_with_config_supplier(
        &self,
        name: &str,
        config_supplier: impl FnOnce() -> CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        self.inner.compute_if_absent(name, || CircuitBreaker::of(name, config_supplier()))
    }

    /// Returns the breaker named `name`, creating it from the shared
    /// configuration `config_name` on first use.
    pub fn get_with_config_name(
        &self,
        name: &str,
        config_name: &str,
    ) -> Result<Arc<CircuitBreaker>, ConfigError> {
        let config = self
            .inner
            .get_configuration(config_name)
            .ok_or_else(|| ConfigError::not_found(config_name))?;
        Ok(self.inner.compute_if_absent(name, || CircuitBreaker::of(name, (*config).clone())))
    }

    /// Returns the breaker named `name`, composing its configuration from
    /// `properties`: the referenced base (or the default) first, explicitly
    /// set fields on top.
    pub fn get_from_properties(
        &self,
        name: &str,
        properties: &CircuitBreakerProperties,
    ) -> Result<Arc<CircuitBreaker>, ConfigError> {
        let base = self.inner.resolve_base(properties.base_config.as_deref())?;
        let config = properties.overlay(&base);
        config.validate()?;
        Ok(self.inner.compute_if_absent(name, || CircuitBreaker::of(name, config)))
    }

    /// Looks up an existing breaker without creating one.
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.find(name)
    }

    /// Removes the breaker named `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.remove(name)
    }

    /// Replaces the breaker named `name` with a freshly built one using
    /// `config`, returning the old handle.
    pub fn replace(&self, name: &str, config: CircuitBreakerConfig) -> Option<Arc<CircuitBreaker>> {
        self.inner.replace(name, CircuitBreaker::of(name, config))
    }

    /// Registers a shared configuration.
    pub fn add_configuration(
        &self,
        config_name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<(), ConfigError> {
        self.inner.add_configuration(config_name, config)
    }

    /// Looks up a shared configuration.
    pub fn get_configuration(&self, config_name: &str) -> Option<Arc<CircuitBreakerConfig>> {
        self.inner.get_configuration(config_name)
    }

    /// The default configuration.
    pub fn default_config(&self) -> Arc<CircuitBreakerConfig> {
        self.inner.default_config()
    }

    /// Snapshot of every registered breaker.
    pub fn get_all(&self) -> Vec<(String, Arc<CircuitBreaker>)> {
        self.inner.get_all()
    }

    /// The underlying generic registry, for event subscriptions.
    pub fn registry(&self) -> &Registry<CircuitBreaker, CircuitBreakerConfig> {
        &self.inner
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::of_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn breaker_with(
        clock: MockClock,
        build: impl FnOnce(CircuitBreakerConfigBuilder) -> CircuitBreakerConfigBuilder,
    ) -> Arc<CircuitBreaker<MockClock>> {
        let config = build(CircuitBreakerConfig::builder()).build().expect("valid config");
        CircuitBreaker::with_clock("test", config, clock)
    }

    /// A closed breaker permits calls and stays closed below the threshold.
    #[test]
    fn test_closed_permits_and_records() {
        let cb = breaker_with(MockClock::new(), |b| b.ring_buffer_size_in_closed_state(4));
        assert!(cb.try_acquire_permission());
        cb.on_success(Duration::from_millis(5));
        assert_eq!(cb.state(), State::Closed);
        assert_eq!(cb.metrics().successful_calls, 1);
    }

    /// The breaker opens only once the window is full and a failure pushes
    /// the rate to the threshold: F,F,S,S stays closed, the fifth F trips
    /// with the buffer now holding F,S,S,F at 50%.
    #[test]
    fn test_opens_on_failure_rate_with_full_buffer() {
        let cb = breaker_with(MockClock::new(), |b| {
            b.ring_buffer_size_in_closed_state(4).failure_rate_threshold(50.0)
        });
        let fail = std::io::Error::other("boom");

        cb.on_error(Duration::ZERO, &fail);
        cb.on_error(Duration::ZERO, &fail);
        cb.on_success(Duration::ZERO);
        assert_eq!(cb.state(), State::Closed);
        cb.on_success(Duration::ZERO);
        assert_eq!(cb.state(), State::Closed);

        cb.on_error(Duration::ZERO, &fail);
        assert_eq!(cb.state(), State::Open);
    }

    /// Denials in the open state count exactly once per attempt.
    #[test]
    fn test_open_denies_and_counts() {
        let clock = MockClock::new();
        let cb = breaker_with(clock.clone(), |b| {
            b.ring_buffer_size_in_closed_state(1)
                .failure_rate_threshold(50.0)
                .wait_duration_in_open_state(Duration::from_secs(10))
        });
        cb.on_error(Duration::ZERO, &std::io::Error::other("boom"));
        assert_eq!(cb.state(), State::Open);

        assert!(!cb.try_acquire_permission());
        assert!(!cb.try_acquire_permission());
        assert_eq!(cb.metrics().not_permitted_calls, 2);
    }

    /// The open wait elapsing converts the next permission request into a
    /// half-open probe.
    #[test]
    fn test_open_wait_elapsed_half_opens() {
        let clock = MockClock::new();
        let cb = breaker_with(clock.clone(), |b| {
            b.ring_buffer_size_in_closed_state(1)
                .failure_rate_threshold(50.0)
                .wait_duration_in_open_state(Duration::from_secs(10))
        });
        cb.on_error(Duration::ZERO, &std::io::Error::other("boom"));
        assert_eq!(cb.state(), State::Open);

        clock.advance(Duration::from_secs(10));
        assert!(cb.try_acquire_permission());
        assert_eq!(cb.state(), State::HalfOpen);
    }

    /// Half-open closes after a clean probe buffer, reopens on failure.
    #[test]
    fn test_half_open_probe_decisions() {
        let cb = breaker_with(MockClock::new(), |b| {
            b.ring_buffer_size_in_half_open_state(2).failure_rate_threshold(50.0)
        });
        cb.transition_to_half_open();

        assert!(cb.try_acquire_permission());
        assert!(cb.try_acquire_permission());
        cb.on_success(Duration::ZERO);
        cb.on_success(Duration::ZERO);
        assert_eq!(cb.state(), State::Closed);

        cb.transition_to_half_open();
        assert!(cb.try_acquire_permission());
        assert!(cb.try_acquire_permission());
        cb.on_success(Duration::ZERO);
        cb.on_error(Duration::ZERO, &std::io::Error::other("boom"));
        assert_eq!(cb.state(), State::Open);
    }

    /// Half-open admits at most the configured number of probes.
    #[test]
    fn test_half_open_caps_probes() {
        let cb = breaker_with(MockClock::new(), |b| b.ring_buffer_size_in_half_open_state(2));
        cb.transition_to_half_open();

        assert!(cb.try_acquire_permission());
        assert!(cb.try_acquire_permission());
        assert!(!cb.try_acquire_permission());

        // Releasing a probe slot re-admits without recording.
        cb.release_permission();
        assert!(cb.try_acquire_permission());
    }

    /// Disabled permits everything and records nothing.
    #[test]
    fn test_disabled_records_nothing() {
        let cb = breaker_with(MockClock::new(), |b| b.ring_buffer_size_in_closed_state(1));
        cb.transition_to_disabled();

        assert!(cb.try_acquire_permission());
        cb.on_error(Duration::ZERO, &std::io::Error::other("boom"));
        cb.on_success(Duration::ZERO);

        let metrics = cb.metrics();
        assert_eq!(metrics.state, State::Disabled);
        assert_eq!(metrics.successful_calls, 0);
        assert_eq!(metrics.failed_calls, 0);
    }

    /// Forced-open denies everything regardless of outcomes.
    #[test]
    fn test_forced_open_denies_all() {
        let cb = breaker_with(MockClock::new(), |b| b);
        cb.transition_to_forced_open();
        assert!(!cb.try_acquire_permission());
        assert_eq!(cb.metrics().not_permitted_calls, 1);
    }

    /// Ignored errors touch only the ignored counter.
    #[test]
    fn test_ignored_errors_do_not_count_as_failures() {
        let cb = breaker_with(MockClock::new(), |b| {
            b.ring_buffer_size_in_closed_state(1)
                .ignore_error(|e| e.to_string().contains("ignore-me"))
        });
        cb.on_error(Duration::ZERO, &std::io::Error::other("ignore-me"));

        let metrics = cb.metrics();
        assert_eq!(metrics.ignored_calls, 1);
        assert_eq!(metrics.failed_calls, 0);
        assert_eq!(cb.state(), State::Closed);
    }

    /// A record predicate turns non-matching errors into ignored ones.
    #[test]
    fn test_record_predicate_filters_failures() {
        let cb = breaker_with(MockClock::new(), |b| {
            b.ring_buffer_size_in_closed_state(1)
                .failure_rate_threshold(100.0)
                .record_error(|e| e.to_string().contains("fatal"))
        });
        cb.on_error(Duration::ZERO, &std::io::Error::other("transient"));
        assert_eq!(cb.state(), State::Closed);
        assert_eq!(cb.metrics().ignored_calls, 1);

        cb.on_error(Duration::ZERO, &std::io::Error::other("fatal"));
        assert_eq!(cb.state(), State::Open);
    }

    /// A slow-call rate threshold trips the breaker on slow successes.
    #[test]
    fn test_slow_calls_trip() {
        let cb = breaker_with(MockClock::new(), |b| {
            b.ring_buffer_size_in_closed_state(2)
                .failure_rate_threshold(100.0)
                .slow_call_rate_threshold(50.0)
                .slow_call_duration_threshold(Duration::from_millis(100))
        });
        cb.on_success(Duration::from_millis(500));
        cb.on_success(Duration::from_millis(500));
        assert_eq!(cb.state(), State::Open);
    }

    /// Reset returns to pristine closed and zeroes every counter.
    #[test]
    fn test_reset() {
        let cb = breaker_with(MockClock::new(), |b| {
            b.ring_buffer_size_in_closed_state(1).failure_rate_threshold(50.0)
        });
        cb.on_error(Duration::ZERO, &std::io::Error::other("boom"));
        assert_eq!(cb.state(), State::Open);

        cb.reset();
        assert_eq!(cb.state(), State::Closed);
        let metrics = cb.metrics();
        assert_eq!(metrics.failed_calls, 0);
        assert_eq!(metrics.not_permitted_calls, 0);
        assert_eq!(metrics.buffered_calls, 0);
    }

    /// The sync decorator records outcomes and re-raises the user error.
    #[test]
    fn test_call_decorator() {
        let cb = breaker_with(MockClock::new(), |b| b);
        let ok: Result<u32, GuardError<std::io::Error>> = cb.call(|| Ok(41));
        assert_eq!(ok.expect("success"), 41);

        let err: Result<u32, GuardError<std::io::Error>> =
            cb.call(|| Err(std::io::Error::other("boom")));
        assert!(matches!(err, Err(GuardError::Inner { .. })));
        assert_eq!(cb.metrics().failed_calls, 1);
    }

    /// The async decorator denies with `CallNotPermitted` when open.
    #[tokio::test]
    async fn test_execute_denied_when_forced_open() {
        let cb = breaker_with(MockClock::new(), |b| b);
        cb.transition_to_forced_open();

        let result: Result<u32, GuardError<std::io::Error>> =
            cb.execute(|| async { Ok(1) }).await;
        assert!(matches!(result, Err(GuardError::CallNotPermitted { .. })));
    }

    /// Identical outcome sequences produce identical transition sequences.
    #[test]
    fn test_transition_sequence_deterministic() {
        let run = || {
            let cb = breaker_with(MockClock::new(), |b| {
                b.ring_buffer_size_in_closed_state(2)
                    .ring_buffer_size_in_half_open_state(1)
                    .failure_rate_threshold(50.0)
            });
            let transitions = cb.event_publisher().subscribe(16);
            let fail = std::io::Error::other("boom");
            cb.on_error(Duration::ZERO, &fail);
            cb.on_error(Duration::ZERO, &fail);
            cb.transition_to_half_open();
            assert!(cb.try_acquire_permission());
            cb.on_success(Duration::ZERO);
            transitions
                .drain()
                .into_iter()
                .filter_map(|e| match e.kind {
                    CircuitBreakerEventKind::StateTransition { from, to } => Some((from, to)),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    /// State ordinals are stable.
    #[test]
    fn test_state_ordinals() {
        assert_eq!(State::Closed.ordinal(), 0);
        assert_eq!(State::Open.ordinal(), 1);
        assert_eq!(State::HalfOpen.ordinal(), 2);
        assert_eq!(State::Disabled.ordinal(), 3);
        assert_eq!(State::ForcedOpen.ordinal(), 4);
    }

    /// Registry facade hands out one instance per name.
    #[test]
    fn test_registry_same_instance_per_name() {
        let registry = CircuitBreakerRegistry::of_defaults();
        let a = registry.get("svc");
        let b = registry.get("svc");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.get_all().len(), 1);
    }

    /// Missing shared configurations surface as `NotFound`.
    #[test]
    fn test_registry_unknown_config_name() {
        let registry = CircuitBreakerRegistry::of_defaults();
        assert!(matches!(
            registry.get_with_config_name("svc", "nope"),
            Err(ConfigError::NotFound { .. })
        ));
    }

    /// Properties compose on top of a registered base configuration.
    #[test]
    fn test_registry_properties_composition() {
        let registry = CircuitBreakerRegistry::of_defaults();
        let shared = CircuitBreakerConfig::builder()
            .failure_rate_threshold(30.0)
            .ring_buffer_size_in_closed_state(7)
            .build()
            .expect("valid config");
        registry.add_configuration("shared", shared).expect("add");

        let props = CircuitBreakerProperties {
            base_config: Some("shared".to_string()),
            failure_rate_threshold: Some(60.0),
            ..Default::default()
        };
        let breaker = registry.get_from_properties("svc", &props).expect("compose");
        assert_eq!(breaker.config().failure_rate_threshold, 60.0);
        assert_eq!(breaker.config().ring_buffer_size_in_closed_state, 7);
    }
}
