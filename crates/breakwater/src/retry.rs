//! Bounded re-execution with configurable backoff.
//!
//! A [`Retry`] instance carries configuration and counters; each logical
//! call gets its own [`RetryContext`]. After every attempt the caller
//! reports the outcome ([`on_result`](RetryContext::on_result) /
//! [`on_error`](RetryContext::on_error)) and either re-invokes after the
//! advised wait, re-raises, or finalizes with
//! [`on_success`](RetryContext::on_success). The first attempt is never
//! delayed, and the operation runs at most `max_attempts` times.
//!
//! The [`call`](Retry::call) and [`execute`](Retry::execute) decorators
//! drive a context and sleep between attempts for you.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{ConfigError, ErrorPredicate, GuardError};
use crate::event::{EventPublisher, EventSubscription};
use crate::registry::Registry;
use crate::utils::option_duration_millis;

/// Predicate over a call's successful result, deciding whether the result
/// itself warrants a retry. Typed predicates are installed through
/// [`RetryConfigBuilder::retry_on_result`].
pub type ResultPredicate = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Advises how long to wait before attempt `n + 1`, given `n` completed
/// attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum IntervalFunction {
    /// The same wait after every attempt.
    Fixed(Duration),
    /// `initial * multiplier^(n-1)`, capped at `max`.
    Exponential { initial: Duration, multiplier: f64, max: Duration },
    /// `initial * (1 ± factor · rand)`.
    Randomized { initial: Duration, factor: f64 },
}

impl IntervalFunction {
    /// A fixed wait.
    pub fn of_fixed(wait: Duration) -> Self {
        IntervalFunction::Fixed(wait)
    }

    /// Exponential backoff capped at thirty seconds.
    pub fn of_exponential(initial: Duration, multiplier: f64) -> Self {
        IntervalFunction::Exponential { initial, multiplier, max: Duration::from_secs(30) }
    }

    /// Exponential backoff with an explicit cap.
    pub fn of_exponential_with_max(initial: Duration, multiplier: f64, max: Duration) -> Self {
        IntervalFunction::Exponential { initial, multiplier, max }
    }

    /// Uniformly randomized wait around `initial`.
    pub fn of_randomized(initial: Duration, factor: f64) -> Self {
        IntervalFunction::Randomized { initial, factor }
    }

    /// The base wait before backoff or randomization.
    pub fn initial(&self) -> Duration {
        match self {
            IntervalFunction::Fixed(wait) => *wait,
            IntervalFunction::Exponential { initial, .. }
            | IntervalFunction::Randomized { initial, .. } => *initial,
        }
    }

    /// The wait after `attempt` completed attempts (1-based).
    pub fn wait_for(&self, attempt: u32) -> Duration {
        match self {
            IntervalFunction::Fixed(wait) => *wait,
            IntervalFunction::Exponential { initial, multiplier, max } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let scaled = initial.as_secs_f64() * multiplier.powi(exponent);
                Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
            }
            IntervalFunction::Randomized { initial, factor } => {
                let jitter = rand::thread_rng().gen_range(-factor..=*factor);
                initial.mul_f64((1.0 + jitter).max(0.0))
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            IntervalFunction::Fixed(_) => Ok(()),
            IntervalFunction::Exponential { multiplier, .. } => {
                if *multiplier < 1.0 {
                    Err(ConfigError::invalid("backoff multiplier must be at least 1"))
                } else {
                    Ok(())
                }
            }
            IntervalFunction::Randomized { factor, .. } => {
                if !(0.0..=1.0).contains(factor) {
                    Err(ConfigError::invalid("randomization factor must be within [0, 1]"))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Tuning knobs for a [`Retry`].
#[derive(Clone)]
pub struct RetryConfig {
    /// Upper bound on invocations of the guarded operation.
    pub max_attempts: u32,
    /// Advises the inter-attempt waits.
    pub interval: IntervalFunction,
    /// When present, only matching errors are retried; others re-raise
    /// immediately.
    pub retry_on_error: Option<ErrorPredicate>,
    /// When present, matching errors re-raise immediately without counting
    /// as a failed sequence. Checked before `retry_on_error`.
    pub ignore_errors: Option<ErrorPredicate>,
    /// When present, a successful result matching the predicate is retried.
    pub retry_on_result: Option<ResultPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval: IntervalFunction::Fixed(Duration::from_millis(500)),
            retry_on_error: None,
            ignore_errors: None,
            retry_on_result: None,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be greater than 0"));
        }
        self.interval.validate()
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("interval", &self.interval)
            .field("retry_on_error", &self.retry_on_error.as_ref().map(|_| "<predicate>"))
            .field("ignore_errors", &self.ignore_errors.as_ref().map(|_| "<predicate>"))
            .field("retry_on_result", &self.retry_on_result.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

/// Fluent builder for [`RetryConfig`].
///
/// Exponential backoff and randomized waits are mutually exclusive;
/// requesting both fails at [`build`](RetryConfigBuilder::build).
pub struct RetryConfigBuilder {
    config: RetryConfig,
    wait: Duration,
    multiplier: Option<f64>,
    random_factor: Option<f64>,
    explicit_interval: Option<IntervalFunction>,
}

impl Default for RetryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
            wait: Duration::from_millis(500),
            multiplier: None,
            random_factor: None,
            explicit_interval: None,
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Base wait between attempts.
    pub fn wait_duration(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Grows the wait exponentially by `multiplier` per attempt.
    pub fn exponential_backoff(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Randomizes each wait by up to `factor` in both directions.
    pub fn randomized_wait(mut self, factor: f64) -> Self {
        self.random_factor = Some(factor);
        self
    }

    /// Installs a fully custom interval function, overriding the wait,
    /// backoff and randomization settings.
    pub fn interval_function(mut self, interval: IntervalFunction) -> Self {
        self.explicit_interval = Some(interval);
        self
    }

    /// Only errors matching `predicate` are retried.
    pub fn retry_on_error(
        mut self,
        predicate: impl Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.config.retry_on_error = Some(Arc::new(predicate));
        self
    }

    /// Errors matching `predicate` re-raise immediately.
    pub fn ignore_error(
        mut self,
        predicate: impl Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.config.ignore_errors = Some(Arc::new(predicate));
        self
    }

    /// Retries when a successful result of type `T` matches `predicate`.
    pub fn retry_on_result<T: 'static>(
        mut self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.config.retry_on_result = Some(Arc::new(move |value: &dyn Any| {
            value.downcast_ref::<T>().map(|v| predicate(v)).unwrap_or(false)
        }));
        self
    }

    pub fn build(mut self) -> Result<RetryConfig, ConfigError> {
        self.config.interval = match self.explicit_interval {
            Some(interval) => interval,
            None => match (self.multiplier, self.random_factor) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::invalid(
                        "exponential backoff and randomized wait cannot be combined",
                    ));
                }
                (Some(multiplier), None) => IntervalFunction::of_exponential(self.wait, multiplier),
                (None, Some(factor)) => IntervalFunction::of_randomized(self.wait, factor),
                (None, None) => IntervalFunction::Fixed(self.wait),
            },
        };
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Partially-specified settings for one named instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryProperties {
    pub base_config: Option<String>,
    pub max_attempts: Option<u32>,
    #[serde(with = "option_duration_millis")]
    pub wait_duration: Option<Duration>,
    pub backoff_multiplier: Option<f64>,
    pub randomized_wait_factor: Option<f64>,
}

impl RetryProperties {
    /// Applies the explicitly set fields on top of `base`.
    ///
    /// Setting both `backoff_multiplier` and `randomized_wait_factor` is
    /// rejected, mirroring the builder.
    pub fn overlay(&self, base: &RetryConfig) -> Result<RetryConfig, ConfigError> {
        let mut config = base.clone();
        if let Some(v) = self.max_attempts {
            config.max_attempts = v;
        }
        if self.wait_duration.is_some()
            || self.backoff_multiplier.is_some()
            || self.randomized_wait_factor.is_some()
        {
            let initial = self.wait_duration.unwrap_or_else(|| base.interval.initial());
            config.interval = match (self.backoff_multiplier, self.randomized_wait_factor) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::invalid(
                        "exponential backoff and randomized wait cannot be combined",
                    ));
                }
                (Some(multiplier), None) => IntervalFunction::of_exponential(initial, multiplier),
                (None, Some(factor)) => IntervalFunction::of_randomized(initial, factor),
                (None, None) => IntervalFunction::Fixed(initial),
            };
        }
        Ok(config)
    }
}

/// One retry lifecycle event.
#[derive(Clone, Debug)]
pub struct RetryEvent {
    pub retry_name: String,
    pub created_at: DateTime<Utc>,
    pub kind: RetryEventKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryEventKind {
    /// Another attempt was scheduled after `wait`.
    Retry { attempt: u32, wait: Duration },
    /// The sequence succeeded after at least one retry.
    Success { attempts: u32 },
    /// The sequence failed for good.
    Error { attempts: u32 },
    /// An error was classified as ignored and re-raised untouched.
    IgnoredError,
}

/// Event surface of one retry instance.
pub struct RetryEventPublisher {
    inner: EventPublisher<RetryEvent>,
}

impl RetryEventPublisher {
    fn new() -> Self {
        Self { inner: EventPublisher::new() }
    }

    fn emit(&self, name: &str, kind: RetryEventKind) {
        if !self.inner.has_consumers() {
            return;
        }
        self.inner.publish(RetryEvent {
            retry_name: name.to_string(),
            created_at: Utc::now(),
            kind,
        });
    }

    /// Registers a callback for every event.
    pub fn on_event(&self, consumer: impl Fn(&RetryEvent) + Send + Sync + 'static) {
        self.inner.on_event(consumer);
    }

    /// Registers a callback for scheduled retries.
    pub fn on_retry(&self, consumer: impl Fn(&RetryEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if matches!(e.kind, RetryEventKind::Retry { .. }) {
                consumer(e);
            }
        });
    }

    /// Registers a callback for sequences that succeeded after retries.
    pub fn on_success(&self, consumer: impl Fn(&RetryEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if matches!(e.kind, RetryEventKind::Success { .. }) {
                consumer(e);
            }
        });
    }

    /// Registers a callback for exhausted or non-retryable failures.
    pub fn on_error(&self, consumer: impl Fn(&RetryEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if matches!(e.kind, RetryEventKind::Error { .. }) {
                consumer(e);
            }
        });
    }

    /// Registers a callback for ignored errors.
    pub fn on_ignored_error(&self, consumer: impl Fn(&RetryEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if matches!(e.kind, RetryEventKind::IgnoredError) {
                consumer(e);
            }
        });
    }

    /// Creates a bounded ring subscription over all events.
    pub fn subscribe(&self, capacity: usize) -> EventSubscription<RetryEvent> {
        self.inner.subscribe(capacity)
    }
}

/// Point-in-time metrics of one retry instance.
#[derive(Clone, Copy, Debug)]
pub struct RetryMetrics {
    pub successful_calls_without_retry: u64,
    pub successful_calls_with_retry: u64,
    pub failed_calls_without_retry: u64,
    pub failed_calls_with_retry: u64,
}

/// What the caller must do after reporting a failed attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// The error is ignored or non-retryable: re-raise it unchanged.
    Rethrow,
    /// Wait this long, then re-invoke the operation.
    RetryAfter(Duration),
    /// The attempt budget is spent: fail the sequence.
    Exhausted { attempts: u32 },
}

/// A named retry instance. Construct with [`Retry::of`] or through a
/// [`RetryRegistry`].
pub struct Retry {
    name: String,
    config: RetryConfig,
    succeeded_without_retry: AtomicU64,
    succeeded_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
    events: RetryEventPublisher,
}

impl Retry {
    /// Creates a retry instance named `name` with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics when the configuration is invalid; build configurations through
    /// [`RetryConfig::builder`] to validate them first.
    pub fn of(name: impl Into<String>, config: RetryConfig) -> Arc<Self> {
        config.validate().expect("invalid retry configuration");
        Arc::new(Self {
            name: name.into(),
            config,
            succeeded_without_retry: AtomicU64::new(0),
            succeeded_with_retry: AtomicU64::new(0),
            failed_without_retry: AtomicU64::new(0),
            failed_with_retry: AtomicU64::new(0),
            events: RetryEventPublisher::new(),
        })
    }

    /// Creates a retry instance with the default configuration.
    pub fn of_defaults(name: impl Into<String>) -> Arc<Self> {
        Self::of(name, RetryConfig::default())
    }

    /// The instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The immutable configuration this instance was created with.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The instance's event surface.
    pub fn event_publisher(&self) -> &RetryEventPublisher {
        &self.events
    }

    /// Starts the per-invocation state for one logical call.
    pub fn context(&self) -> RetryContext<'_> {
        RetryContext { retry: self, attempts: 0 }
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            successful_calls_without_retry: self.succeeded_without_retry.load(Ordering::Relaxed),
            successful_calls_with_retry: self.succeeded_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: self.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: self.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    /// Runs a synchronous operation under this retry policy, sleeping on the
    /// current thread between attempts.
    #[instrument(skip(self, operation), fields(retry = %self.name))]
    pub fn call<F, T, E>(&self, mut operation: F) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Result<T, E>,
        T: 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut context = self.context();
        loop {
            match operation() {
                Ok(value) => {
                    if let Some(wait) = context.on_result(&value) {
                        std::thread::sleep(wait);
                        continue;
                    }
                    context.on_success();
                    return Ok(value);
                }
                Err(error) => match context.on_error(&error) {
                    RetryDecision::RetryAfter(wait) => std::thread::sleep(wait),
                    RetryDecision::Rethrow => return Err(GuardError::Inner { source: error }),
                    RetryDecision::Exhausted { attempts } => {
                        return Err(GuardError::MaxRetriesExceeded {
                            attempts,
                            source: Some(error),
                        });
                    }
                },
            }
        }
    }

    /// Runs an asynchronous operation under this retry policy.
    #[instrument(skip(self, operation), fields(retry = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        T: 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut context = self.context();
        loop {
            match operation().await {
                Ok(value) => {
                    if let Some(wait) = context.on_result(&value) {
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    context.on_success();
                    return Ok(value);
                }
                Err(error) => match context.on_error(&error) {
                    RetryDecision::RetryAfter(wait) => tokio::time::sleep(wait).await,
                    RetryDecision::Rethrow => return Err(GuardError::Inner { source: error }),
                    RetryDecision::Exhausted { attempts } => {
                        return Err(GuardError::MaxRetriesExceeded {
                            attempts,
                            source: Some(error),
                        });
                    }
                },
            }
        }
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.name)
            .field("max_attempts", &self.config.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Per-invocation retry state: the attempt counter and outcome evaluation.
pub struct RetryContext<'r> {
    retry: &'r Retry,
    attempts: u32,
}

impl RetryContext<'_> {
    /// Failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Evaluates a successful result. `Some(wait)` means the result demands
    /// a retry: sleep `wait`, then re-invoke. `None` means the caller keeps
    /// the result (also returned when the attempt budget is spent).
    pub fn on_result<T: 'static>(&mut self, value: &T) -> Option<Duration> {
        let predicate = self.retry.config.retry_on_result.as_ref()?;
        if !predicate(value) {
            return None;
        }
        if self.attempts + 1 >= self.retry.config.max_attempts {
            debug!(retry = %self.retry.name, "result demands retry but budget is spent");
            return None;
        }
        self.attempts += 1;
        let wait = self.retry.config.interval.wait_for(self.attempts);
        self.retry
            .events
            .emit(&self.retry.name, RetryEventKind::Retry { attempt: self.attempts, wait });
        Some(wait)
    }

    /// Classifies a failed attempt.
    pub fn on_error(&mut self, error: &(dyn std::error::Error + 'static)) -> RetryDecision {
        if let Some(ignore) = &self.retry.config.ignore_errors {
            if ignore(error) {
                self.retry.events.emit(&self.retry.name, RetryEventKind::IgnoredError);
                return RetryDecision::Rethrow;
            }
        }
        if let Some(retryable) = &self.retry.config.retry_on_error {
            if !retryable(error) {
                self.count_failure();
                self.retry
                    .events
                    .emit(&self.retry.name, RetryEventKind::Error { attempts: self.attempts + 1 });
                return RetryDecision::Rethrow;
            }
        }

        self.attempts += 1;
        if self.attempts >= self.retry.config.max_attempts {
            self.count_failure();
            self.retry
                .events
                .emit(&self.retry.name, RetryEventKind::Error { attempts: self.attempts });
            return RetryDecision::Exhausted { attempts: self.attempts };
        }
        let wait = self.retry.config.interval.wait_for(self.attempts);
        self.retry
            .events
            .emit(&self.retry.name, RetryEventKind::Retry { attempt: self.attempts, wait });
        RetryDecision::RetryAfter(wait)
    }

    /// Finalizes the sequence after the caller decided no retry is needed.
    pub fn on_success(&mut self) {
        if self.attempts > 0 {
            self.retry.succeeded_with_retry.fetch_add(1, Ordering::Relaxed);
            self.retry
                .events
                .emit(&self.retry.name, RetryEventKind::Success { attempts: self.attempts });
        } else {
            self.retry.succeeded_without_retry.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn count_failure(&self) {
        if self.attempts > 1 {
            self.retry.failed_with_retry.fetch_add(1, Ordering::Relaxed);
        } else {
            self.retry.failed_without_retry.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Registry of named retry instances sharing named configurations.
pub struct RetryRegistry {
    inner: Registry<Retry, RetryConfig>,
}

impl RetryRegistry {
    /// Creates a registry with the given default configuration.
    pub fn new(default_config: RetryConfig) -> Self {
        Self { inner: Registry::new(default_config) }
    }

    /// Creates a registry using [`RetryConfig::default`].
    pub fn of_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Returns the retry instance named `name`, creating it with the default
    /// configuration on first use.
    pub fn get(&self, name: &str) -> Arc<Retry> {
        let config = self.inner.default_config();
        self.inner.compute_if_absent(name, || Retry::of(name, (*config).clone()))
    }

    /// Returns the retry instance named `name`, creating it with `config` on
    /// first use.
    pub fn get_with_config(&self, name: &str, config: RetryConfig) -> Arc<Retry> {
        self.inner.compute_if_absent(name, || Retry::of(name, config))
    }

    /// Returns the retry instance named `name`, creating it from the
    /// configuration produced by `config_supplier` on first use.
    pub fn get_with_config_supplier(
        &self,
        name: &str,
        config_supplier: impl FnOnce() -> RetryConfig,
    ) -> Arc<Retry> {
        self.inner.compute_if_absent(name, || Retry::of(name, config_supplier()))
    }

    /// Returns the retry instance named `name`, creating it from the shared
    /// configuration `config_name` on first use.
    pub fn get_with_config_name(
        &self,
        name: &str,
        config_name: &str,
    ) -> Result<Arc<Retry>, ConfigError> {
        let config = self
            .inner
            .get_configuration(config_name)
            .ok_or_else(|| ConfigError::not_found(config_name))?;
        Ok(self.inner.compute_if_absent(name, || Retry::of(name, (*config).clone())))
    }

    /// Returns the retry instance named `name`, composing its configuration
    /// from `properties`.
    pub fn get_from_properties(
        &self,
        name: &str,
        properties: &RetryProperties,
    ) -> Result<Arc<Retry>, ConfigError> {
        let base = self.inner.resolve_base(properties.base_config.as_deref())?;
        let config = properties.overlay(&base)?;
        config.validate()?;
        Ok(self.inner.compute_if_absent(name, || Retry::of(name, config)))
    }

    /// Looks up an existing retry instance without creating one.
    pub fn find(&self, name: &str) -> Option<Arc<Retry>> {
        self.inner.find(name)
    }

    /// Removes the retry instance named `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<Retry>> {
        self.inner.remove(name)
    }

    /// Replaces the retry instance named `name` with a freshly built one
    /// using `config`, returning the old handle.
    pub fn replace(&self, name: &str, config: RetryConfig) -> Option<Arc<Retry>> {
        self.inner.replace(name, Retry::of(name, config))
    }

    /// Registers a shared configuration.
    pub fn add_configuration(
        &self,
        config_name: &str,
        config: RetryConfig,
    ) -> Result<(), ConfigError> {
        self.inner.add_configuration(config_name, config)
    }

    /// Looks up a shared configuration.
    pub fn get_configuration(&self, config_name: &str) -> Option<Arc<RetryConfig>> {
        self.inner.get_configuration(config_name)
    }

    /// The default configuration.
    pub fn default_config(&self) -> Arc<RetryConfig> {
        self.inner.default_config()
    }

    /// Snapshot of every registered retry instance.
    pub fn get_all(&self) -> Vec<(String, Arc<Retry>)> {
        self.inner.get_all()
    }

    /// The underlying generic registry, for event subscriptions.
    pub fn registry(&self) -> &Registry<Retry, RetryConfig> {
        &self.inner
    }
}

impl Default for RetryRegistry {
    fn default() -> Self {
        Self::of_defaults()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    /// Exponential waits double per attempt and respect the cap.
    #[test]
    fn test_exponential_interval() {
        let interval =
            IntervalFunction::of_exponential_with_max(Duration::from_millis(100), 2.0, Duration::from_secs(1));
        assert_eq!(interval.wait_for(1), Duration::from_millis(100));
        assert_eq!(interval.wait_for(2), Duration::from_millis(200));
        assert_eq!(interval.wait_for(3), Duration::from_millis(400));
        assert_eq!(interval.wait_for(10), Duration::from_secs(1));
    }

    /// Randomized waits stay within `initial · (1 ± factor)`.
    #[test]
    fn test_randomized_interval_bounds() {
        let interval = IntervalFunction::of_randomized(Duration::from_millis(100), 0.5);
        for _ in 0..100 {
            let wait = interval.wait_for(1);
            assert!(wait >= Duration::from_millis(50), "wait {wait:?} below bound");
            assert!(wait <= Duration::from_millis(150), "wait {wait:?} above bound");
        }
    }

    /// Exponential and randomized settings cannot be combined.
    #[test]
    fn test_builder_rejects_conflicting_backoff() {
        let result = RetryConfig::builder()
            .exponential_backoff(2.0)
            .randomized_wait(0.3)
            .build();
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    /// Zero attempts and bad interval parameters are rejected.
    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::builder().max_attempts(0).build().is_err());
        assert!(RetryConfig::builder().exponential_backoff(0.5).build().is_err());
        assert!(RetryConfig::builder().randomized_wait(1.5).build().is_err());
    }

    /// The context advises retries until the budget is spent, then fails.
    #[test]
    fn test_context_error_budget() {
        let retry = Retry::of(
            "ctx",
            RetryConfig::builder()
                .max_attempts(3)
                .wait_duration(Duration::from_millis(10))
                .build()
                .expect("valid config"),
        );
        let mut context = retry.context();
        let error = std::io::Error::other("boom");

        assert!(matches!(context.on_error(&error), RetryDecision::RetryAfter(_)));
        assert!(matches!(context.on_error(&error), RetryDecision::RetryAfter(_)));
        assert_eq!(context.on_error(&error), RetryDecision::Exhausted { attempts: 3 });
    }

    /// Ignored errors re-raise without consuming the budget.
    #[test]
    fn test_context_ignored_error() {
        let retry = Retry::of(
            "ctx",
            RetryConfig::builder()
                .ignore_error(|e| e.to_string().contains("fatal"))
                .build()
                .expect("valid config"),
        );
        let mut context = retry.context();
        assert_eq!(
            context.on_error(&std::io::Error::other("fatal: nope")),
            RetryDecision::Rethrow
        );
        assert_eq!(context.attempts(), 0);
    }

    /// Non-retryable errors re-raise immediately.
    #[test]
    fn test_context_non_retryable() {
        let retry = Retry::of(
            "ctx",
            RetryConfig::builder()
                .retry_on_error(|e| e.to_string().contains("transient"))
                .build()
                .expect("valid config"),
        );
        let mut context = retry.context();
        assert_eq!(
            context.on_error(&std::io::Error::other("permanent")),
            RetryDecision::Rethrow
        );
        assert_eq!(retry.metrics().failed_calls_without_retry, 1);
    }

    /// The async decorator invokes at most `max_attempts` times and carries
    /// the last error out.
    #[tokio::test]
    async fn test_execute_exhausts_budget() {
        let retry = Retry::of(
            "exec",
            RetryConfig::builder()
                .max_attempts(3)
                .wait_duration(Duration::from_millis(1))
                .build()
                .expect("valid config"),
        );
        let invocations = AtomicU32::new(0);

        let result: Result<(), GuardError<std::io::Error>> = retry
            .execute(|| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async { Err(std::io::Error::other("still down")) }
            })
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        match result {
            Err(GuardError::MaxRetriesExceeded { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.expect("last error").to_string(), "still down");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(retry.metrics().failed_calls_with_retry, 1);
    }

    /// A success mid-sequence stops retrying and counts as recovered.
    #[tokio::test]
    async fn test_execute_recovers() {
        let retry = Retry::of(
            "exec",
            RetryConfig::builder()
                .max_attempts(5)
                .wait_duration(Duration::from_millis(1))
                .build()
                .expect("valid config"),
        );
        let invocations = AtomicU32::new(0);

        let result: Result<u32, GuardError<std::io::Error>> = retry
            .execute(|| {
                let n = invocations.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(std::io::Error::other("transient"))
                    } else {
                        Ok(99)
                    }
                }
            })
            .await;

        assert_eq!(result.expect("recovered"), 99);
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert_eq!(retry.metrics().successful_calls_with_retry, 1);
    }

    /// Result predicates drive retries of nominally successful calls.
    #[tokio::test]
    async fn test_execute_retry_on_result() {
        let retry = Retry::of(
            "exec",
            RetryConfig::builder()
                .max_attempts(3)
                .wait_duration(Duration::from_millis(1))
                .retry_on_result(|value: &u32| *value == 0)
                .build()
                .expect("valid config"),
        );
        let invocations = AtomicU32::new(0);

        let result: Result<u32, GuardError<std::io::Error>> = retry
            .execute(|| {
                let n = invocations.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n) }
            })
            .await;

        // First result 0 demands a retry; the second (1) is kept.
        assert_eq!(result.expect("kept"), 1);
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    /// When results keep matching, the budget bounds invocations.
    #[tokio::test]
    async fn test_retry_on_result_budget() {
        let retry = Retry::of(
            "exec",
            RetryConfig::builder()
                .max_attempts(3)
                .wait_duration(Duration::from_millis(1))
                .retry_on_result(|_: &u32| true)
                .build()
                .expect("valid config"),
        );
        let invocations = AtomicU32::new(0);

        let result: Result<u32, GuardError<std::io::Error>> = retry
            .execute(|| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async { Ok(0) }
            })
            .await;

        // The budget is spent; the last result is returned as-is.
        assert_eq!(result.expect("last result"), 0);
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
    }

    /// The sync decorator behaves like the async one.
    #[test]
    fn test_call_sync() {
        let retry = Retry::of(
            "sync",
            RetryConfig::builder()
                .max_attempts(2)
                .wait_duration(Duration::from_millis(1))
                .build()
                .expect("valid config"),
        );
        let invocations = AtomicU32::new(0);

        let result: Result<u32, GuardError<std::io::Error>> = retry.call(|| {
            let n = invocations.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(std::io::Error::other("transient"))
            } else {
                Ok(5)
            }
        });

        assert_eq!(result.expect("recovered"), 5);
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    /// Retry events carry the attempt number and advised wait.
    #[tokio::test]
    async fn test_events() {
        let retry = Retry::of(
            "events",
            RetryConfig::builder()
                .max_attempts(2)
                .wait_duration(Duration::from_millis(1))
                .build()
                .expect("valid config"),
        );
        let sub = retry.event_publisher().subscribe(8);

        let _: Result<(), GuardError<std::io::Error>> =
            retry.execute(|| async { Err(std::io::Error::other("boom")) }).await;

        let kinds: Vec<_> = sub.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RetryEventKind::Retry { attempt: 1, wait: Duration::from_millis(1) },
                RetryEventKind::Error { attempts: 2 },
            ]
        );
    }

    /// Properties overlay composes interval settings on a base.
    #[test]
    fn test_properties_overlay() {
        let base = RetryConfig::builder()
            .max_attempts(4)
            .wait_duration(Duration::from_millis(100))
            .build()
            .expect("valid config");

        let props = RetryProperties {
            backoff_multiplier: Some(2.0),
            ..Default::default()
        };
        let config = props.overlay(&base).expect("compose");
        assert_eq!(config.max_attempts, 4);
        assert_eq!(
            config.interval,
            IntervalFunction::of_exponential(Duration::from_millis(100), 2.0)
        );

        let conflicting = RetryProperties {
            backoff_multiplier: Some(2.0),
            randomized_wait_factor: Some(0.5),
            ..Default::default()
        };
        assert!(conflicting.overlay(&base).is_err());
    }
}
