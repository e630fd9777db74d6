//! Rate limiter with atomic cycle-based permit accounting.
//!
//! Time since limiter creation is partitioned into fixed cycles of
//! `limit_refresh_period`; each cycle start credits `limit_for_period`
//! permits. The entire accounting state lives in one packed `AtomicU64`
//! (cycle number in the high half, a signed permit balance in the low half)
//! updated by a CAS loop — the only write point, with no lock on the
//! acquisition path.
//!
//! Permits can be reserved ahead: the balance goes negative and the caller
//! learns how many nanoseconds to sleep until its reservation matures.
//! A reservation that would exceed `timeout_duration` is refused without
//! touching the balance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, GuardError};
use crate::event::{EventPublisher, EventSubscription};
use crate::registry::Registry;
use crate::utils::option_duration_millis;

/// Sentinel returned by [`RateLimiter::reserve_permission`] when the wait
/// would exceed the configured timeout.
pub const RESERVATION_REFUSED: i64 = -1;

/// Tuning knobs for a [`RateLimiter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Permits credited at the start of every refresh cycle.
    pub limit_for_period: u32,
    /// Length of one refresh cycle.
    pub limit_refresh_period: Duration,
    /// Longest reservation a caller is willing to wait out.
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            limit_refresh_period: Duration::from_nanos(500),
            timeout_duration: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::new()
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit_for_period == 0 {
            return Err(ConfigError::invalid("limit_for_period must be greater than 0"));
        }
        if self.limit_for_period > (i32::MAX / 2) as u32 {
            return Err(ConfigError::invalid("limit_for_period is too large"));
        }
        if self.limit_refresh_period.is_zero() {
            return Err(ConfigError::invalid("limit_refresh_period must be greater than zero"));
        }
        Ok(())
    }
}

/// Fluent builder for [`RateLimiterConfig`].
#[derive(Debug, Default)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterConfigBuilder {
    pub fn new() -> Self {
        Self { config: RateLimiterConfig::default() }
    }

    pub fn limit_for_period(mut self, limit: u32) -> Self {
        self.config.limit_for_period = limit;
        self
    }

    pub fn limit_refresh_period(mut self, period: Duration) -> Self {
        self.config.limit_refresh_period = period;
        self
    }

    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    pub fn build(self) -> Result<RateLimiterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Partially-specified settings for one named instance; see
/// [`CircuitBreakerProperties`](crate::circuit_breaker::CircuitBreakerProperties)
/// for the overlay rules.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimiterProperties {
    pub base_config: Option<String>,
    pub limit_for_period: Option<u32>,
    #[serde(with = "option_duration_millis")]
    pub limit_refresh_period: Option<Duration>,
    #[serde(with = "option_duration_millis")]
    pub timeout_duration: Option<Duration>,
}

impl RateLimiterProperties {
    /// Applies the explicitly set fields on top of `base`.
    pub fn overlay(&self, base: &RateLimiterConfig) -> RateLimiterConfig {
        let mut config = base.clone();
        if let Some(v) = self.limit_for_period {
            config.limit_for_period = v;
        }
        if let Some(v) = self.limit_refresh_period {
            config.limit_refresh_period = v;
        }
        if let Some(v) = self.timeout_duration {
            config.timeout_duration = v;
        }
        config
    }
}

/// One rate limiter lifecycle event.
#[derive(Clone, Debug)]
pub struct RateLimiterEvent {
    pub rate_limiter_name: String,
    pub created_at: DateTime<Utc>,
    pub kind: RateLimiterEventKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimiterEventKind {
    /// A permit was granted, possibly after a reservation wait.
    SuccessfulAcquire,
    /// No permit could be granted within the timeout.
    FailedAcquire,
}

/// Event surface of one limiter.
pub struct RateLimiterEventPublisher {
    inner: EventPublisher<RateLimiterEvent>,
}

impl RateLimiterEventPublisher {
    fn new() -> Self {
        Self { inner: EventPublisher::new() }
    }

    fn emit(&self, name: &str, kind: RateLimiterEventKind) {
        if !self.inner.has_consumers() {
            return;
        }
        self.inner.publish(RateLimiterEvent {
            rate_limiter_name: name.to_string(),
            created_at: Utc::now(),
            kind,
        });
    }

    /// Registers a callback for every event.
    pub fn on_event(&self, consumer: impl Fn(&RateLimiterEvent) + Send + Sync + 'static) {
        self.inner.on_event(consumer);
    }

    /// Registers a callback for granted permits.
    pub fn on_success(&self, consumer: impl Fn(&RateLimiterEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if e.kind == RateLimiterEventKind::SuccessfulAcquire {
                consumer(e);
            }
        });
    }

    /// Registers a callback for refused permits.
    pub fn on_failure(&self, consumer: impl Fn(&RateLimiterEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if e.kind == RateLimiterEventKind::FailedAcquire {
                consumer(e);
            }
        });
    }

    /// Creates a bounded ring subscription over all events.
    pub fn subscribe(&self, capacity: usize) -> EventSubscription<RateLimiterEvent> {
        self.inner.subscribe(capacity)
    }
}

/// Point-in-time metrics of one limiter.
#[derive(Clone, Copy, Debug)]
pub struct RateLimiterMetrics {
    /// Permits available in the current cycle; negative when reservations
    /// have borrowed from future cycles.
    pub available_permissions: i32,
    /// Callers currently sleeping on a reservation, estimated from the
    /// borrowed permit count.
    pub number_of_waiting_threads: u32,
}

// The packed atomic record: cycle index in the high 32 bits (wrapping),
// signed permit balance in the low 32 bits.
fn pack(cycle: u32, permissions: i32) -> u64 {
    ((cycle as u64) << 32) | (permissions as u32 as u64)
}

fn unpack(packed: u64) -> (u32, i32) {
    ((packed >> 32) as u32, packed as u32 as i32)
}

/// A named rate limiter instance. Construct with [`RateLimiter::of`] or
/// through a [`RateLimiterRegistry`].
pub struct RateLimiter<C: Clock = SystemClock> {
    name: String,
    config: RwLock<RateLimiterConfig>,
    state: AtomicU64,
    birth: Instant,
    clock: Arc<C>,
    events: RateLimiterEventPublisher,
}

impl RateLimiter<SystemClock> {
    /// Creates a limiter named `name` with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics when the configuration is invalid; build configurations through
    /// [`RateLimiterConfig::builder`] to validate them first.
    pub fn of(name: impl Into<String>, config: RateLimiterConfig) -> Arc<Self> {
        Self::with_clock(name, config, SystemClock)
    }

    /// Creates a limiter with the default configuration.
    pub fn of_defaults(name: impl Into<String>) -> Arc<Self> {
        Self::of(name, RateLimiterConfig::default())
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Creates a limiter measuring time on `clock`.
    ///
    /// # Panics
    ///
    /// Panics when the configuration is invalid.
    pub fn with_clock(name: impl Into<String>, config: RateLimiterConfig, clock: C) -> Arc<Self> {
        config.validate().expect("invalid rate limiter configuration");
        let clock = Arc::new(clock);
        Arc::new(Self {
            name: name.into(),
            state: AtomicU64::new(pack(0, config.limit_for_period as i32)),
            config: RwLock::new(config),
            birth: clock.now(),
            clock,
            events: RateLimiterEventPublisher::new(),
        })
    }

    /// The instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A copy of the current configuration.
    pub fn config(&self) -> RateLimiterConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The limiter's event surface.
    pub fn event_publisher(&self) -> &RateLimiterEventPublisher {
        &self.events
    }

    /// Replaces the permit budget per cycle, visible to subsequent
    /// acquisitions. Already-borrowed permits keep their reservations.
    pub fn change_limit_for_period(&self, limit: u32) -> Result<(), ConfigError> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let candidate = RateLimiterConfig { limit_for_period: limit, ..config.clone() };
        candidate.validate()?;
        *config = candidate;
        Ok(())
    }

    /// Replaces the reservation timeout, visible to subsequent acquisitions.
    pub fn change_timeout_duration(&self, timeout: Duration) -> Result<(), ConfigError> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        config.timeout_duration = timeout;
        Ok(())
    }

    /// Reserves one permit.
    ///
    /// Returns the nanoseconds the caller must sleep before proceeding (zero
    /// means proceed immediately), or [`RESERVATION_REFUSED`] when the wait
    /// would exceed `timeout_duration` — in which case nothing was reserved.
    pub fn reserve_permission(&self) -> i64 {
        let timeout = self.config.read().unwrap_or_else(PoisonError::into_inner).timeout_duration;
        self.reserve_with_timeout(timeout)
    }

    /// Takes a permit only when one is available right now.
    pub fn try_acquire_permission(&self) -> bool {
        self.reserve_with_timeout(Duration::ZERO) == 0
    }

    /// Acquires one permit, sleeping out the reservation when needed.
    ///
    /// Cancelling the returned future mid-sleep forfeits the reserved
    /// permit; it still counts against its cycle.
    pub async fn acquire_permission(&self) -> Result<(), GuardError> {
        match self.reserve_permission() {
            RESERVATION_REFUSED => {
                debug!(limiter = %self.name, "request not permitted");
                Err(GuardError::RequestNotPermitted { name: self.name.clone() })
            }
            0 => Ok(()),
            nanos => {
                tokio::time::sleep(Duration::from_nanos(nanos as u64)).await;
                Ok(())
            }
        }
    }

    fn reserve_with_timeout(&self, timeout: Duration) -> i64 {
        let (limit, period) = {
            let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
            (
                config.limit_for_period as i64,
                config.limit_refresh_period.as_nanos().max(1).min(i64::MAX as u128) as i64,
            )
        };
        let timeout_nanos = timeout.as_nanos().min(i64::MAX as u128) as i64;

        loop {
            let observed = self.state.load(Ordering::Acquire);
            let (cycle, permissions) = unpack(observed);
            // Time is read after the state so a freshly installed cycle is
            // never ahead of this reading on a monotonic clock.
            let now_nanos =
                self.clock.since(self.birth).as_nanos().min(u64::MAX as u128) as u64;
            let current_cycle = (now_nanos / period as u64) as u32;
            let nanos_into_cycle = (now_nanos % period as u64) as i64;

            // Deltas use wrapping arithmetic; a "negative" wrap means a
            // racing caller installed the cycle we are just short of, in
            // which case the stored cycle is kept as-is.
            let raw_delta = current_cycle.wrapping_sub(cycle);
            let (effective_cycle, delta) = if raw_delta > u32::MAX / 2 {
                (cycle, 0)
            } else {
                (current_cycle, raw_delta as i64)
            };
            let refreshed = if delta > 0 {
                (permissions as i64).saturating_add(delta.saturating_mul(limit)).min(limit)
            } else {
                permissions as i64
            };

            let nanos_to_wait = if refreshed >= 1 {
                0
            } else {
                let nanos_to_next_cycle = period - nanos_into_cycle;
                // Permits still missing once the next cycle's budget lands.
                let shortfall = 1 - (refreshed + limit);
                let full_cycles =
                    if shortfall <= 0 { 0 } else { (shortfall + limit - 1) / limit };
                full_cycles.saturating_mul(period).saturating_add(nanos_to_next_cycle)
            };

            let granted = nanos_to_wait <= timeout_nanos;
            let next_permissions = if granted { refreshed - 1 } else { refreshed };
            let next = pack(
                effective_cycle,
                next_permissions.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            );

            if self
                .state
                .compare_exchange_weak(observed, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return if granted {
                    self.events.emit(&self.name, RateLimiterEventKind::SuccessfulAcquire);
                    nanos_to_wait
                } else {
                    self.events.emit(&self.name, RateLimiterEventKind::FailedAcquire);
                    RESERVATION_REFUSED
                };
            }
        }
    }

    /// Point-in-time metrics snapshot. The balance is refreshed virtually;
    /// the shared state is not modified.
    pub fn metrics(&self) -> RateLimiterMetrics {
        let (limit, period) = {
            let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
            (
                config.limit_for_period as i64,
                config.limit_refresh_period.as_nanos().max(1).min(i64::MAX as u128) as i64,
            )
        };
        let (cycle, permissions) = unpack(self.state.load(Ordering::Acquire));
        let now_nanos =
            self.clock.since(self.birth).as_nanos().min(u64::MAX as u128) as u64;
        let current_cycle = (now_nanos / period as u64) as u32;

        let raw_delta = current_cycle.wrapping_sub(cycle);
        let delta = if raw_delta > u32::MAX / 2 { 0 } else { raw_delta as i64 };
        let available = if delta > 0 {
            (permissions as i64).saturating_add(delta.saturating_mul(limit)).min(limit)
        } else {
            permissions as i64
        };

        RateLimiterMetrics {
            available_permissions: available.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            number_of_waiting_threads: (-available).max(0) as u32,
        }
    }

    /// Runs an asynchronous operation once a permit is granted.
    #[instrument(skip(self, operation), fields(limiter = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.acquire_permission().await.map_err(GuardError::widen)?;
        match operation().await {
            Ok(value) => Ok(value),
            Err(error) => Err(GuardError::Inner { source: error }),
        }
    }
}

impl<C: Clock> std::fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let metrics = self.metrics();
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("available_permissions", &metrics.available_permissions)
            .finish_non_exhaustive()
    }
}

/// Registry of named rate limiters sharing named configurations.
pub struct RateLimiterRegistry {
    inner: Registry<RateLimiter, RateLimiterConfig>,
}

impl RateLimiterRegistry {
    /// Creates a registry with the given default configuration.
    pub fn new(default_config: RateLimiterConfig) -> Self {
        Self { inner: Registry::new(default_config) }
    }

    /// Creates a registry using [`RateLimiterConfig::default`].
    pub fn of_defaults() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    /// Returns the limiter named `name`, creating it with the default
    /// configuration on first use.
    pub fn get(&self, name: &str) -> Arc<RateLimiter> {
        let config = self.inner.default_config();
        self.inner.compute_if_absent(name, || RateLimiter::of(name, (*config).clone()))
    }

    /// Returns the limiter named `name`, creating it with `config` on first
    /// use.
    pub fn get_with_config(&self, name: &str, config: RateLimiterConfig) -> Arc<RateLimiter> {
        self.inner.compute_if_absent(name, || RateLimiter::of(name, config))
    }

    /// Returns the limiter named `name`, creating it from the configuration
    /// produced by `config_supplier` on first use.
    pub fn get_with_config_supplier(
        &self,
        name: &str,
        config_supplier: impl FnOnce() -> RateLimiterConfig,
    ) -> Arc<RateLimiter> {
        self.inner.compute_if_absent(name, || RateLimiter::of(name, config_supplier()))
    }

    /// Returns the limiter named `name`, creating it from the shared
    /// configuration `config_name` on first use.
    pub fn get_with_config_name(
        &self,
        name: &str,
        config_name: &str,
    ) -> Result<Arc<RateLimiter>, ConfigError> {
        let config = self
            .inner
            .get_configuration(config_name)
            .ok_or_else(|| ConfigError::not_found(config_name))?;
        Ok(self.inner.compute_if_absent(name, || RateLimiter::of(name, (*config).clone())))
    }

    /// Returns the limiter named `name`, composing its configuration from
    /// `properties`.
    pub fn get_from_properties(
        &self,
        name: &str,
        properties: &RateLimiterProperties,
    ) -> Result<Arc<RateLimiter>, ConfigError> {
        let base = self.inner.resolve_base(properties.base_config.as_deref())?;
        let config = properties.overlay(&base);
        config.validate()?;
        Ok(self.inner.compute_if_absent(name, || RateLimiter::of(name, config)))
    }

    /// Looks up an existing limiter without creating one.
    pub fn find(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.inner.find(name)
    }

    /// Removes the limiter named `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.inner.remove(name)
    }

    /// Replaces the limiter named `name` with a freshly built one using
    /// `config`, returning the old handle.
    pub fn replace(&self, name: &str, config: RateLimiterConfig) -> Option<Arc<RateLimiter>> {
        self.inner.replace(name, RateLimiter::of(name, config))
    }

    /// Registers a shared configuration.
    pub fn add_configuration(
        &self,
        config_name: &str,
        config: RateLimiterConfig,
    ) -> Result<(), ConfigError> {
        self.inner.add_configuration(config_name, config)
    }

    /// Looks up a shared configuration.
    pub fn get_configuration(&self, config_name: &str) -> Option<Arc<RateLimiterConfig>> {
        self.inner.get_configuration(config_name)
    }

    /// The default configuration.
    pub fn default_config(&self) -> Arc<RateLimiterConfig> {
        self.inner.default_config()
    }

    /// Snapshot of every registered limiter.
    pub fn get_all(&self) -> Vec<(String, Arc<RateLimiter>)> {
        self.inner.get_all()
    }

    /// The underlying generic registry, for event subscriptions.
    pub fn registry(&self) -> &Registry<RateLimiter, RateLimiterConfig> {
        &self.inner
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::of_defaults()
    }
}
