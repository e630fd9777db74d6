//! Bounded wait around a future producer, with optional cancel-on-timeout.
//!
//! [`execute_future_supplier`](TimeLimiter::execute_future_supplier) obtains
//! the future from the supplier, runs it as a task and waits up to
//! `timeout_duration`. On timeout the task receives exactly one cancel
//! signal when `cancel_running_future` is set, and is left running detached
//! otherwise; either way the caller gets [`GuardError::Timeout`]. Errors of
//! the wrapped future propagate unchanged.

use std::future::Future;
use std::panic;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{ConfigError, GuardError};
use crate::event::{EventPublisher, EventSubscription};
use crate::registry::Registry;
use crate::utils::option_duration_millis;

/// Tuning knobs for a [`TimeLimiter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeLimiterConfig {
    /// Longest the wrapped future may run before the caller gives up.
    pub timeout_duration: Duration,
    /// Whether a timed-out future is cancelled or left running detached.
    pub cancel_running_future: bool,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self { timeout_duration: Duration::from_secs(1), cancel_running_future: true }
    }
}

impl TimeLimiterConfig {
    pub fn builder() -> TimeLimiterConfigBuilder {
        TimeLimiterConfigBuilder::new()
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_duration.is_zero() {
            return Err(ConfigError::invalid("timeout_duration must be greater than zero"));
        }
        Ok(())
    }
}

/// Fluent builder for [`TimeLimiterConfig`].
#[derive(Debug, Default)]
pub struct TimeLimiterConfigBuilder {
    config: TimeLimiterConfig,
}

impl TimeLimiterConfigBuilder {
    pub fn new() -> Self {
        Self { config: TimeLimiterConfig::default() }
    }

    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    pub fn cancel_running_future(mut self, cancel: bool) -> Self {
        self.config.cancel_running_future = cancel;
        self
    }

    pub fn build(self) -> Result<TimeLimiterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Partially-specified settings for one named instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeLimiterProperties {
    pub base_config: Option<String>,
    #[serde(with = "option_duration_millis")]
    pub timeout_duration: Option<Duration>,
    pub cancel_running_future: Option<bool>,
}

impl TimeLimiterProperties {
    /// Applies the explicitly set fields on top of `base`.
    pub fn overlay(&self, base: &TimeLimiterConfig) -> TimeLimiterConfig {
        let mut config = base.clone();
        if let Some(v) = self.timeout_duration {
            config.timeout_duration = v;
        }
        if let Some(v) = self.cancel_running_future {
            config.cancel_running_future = v;
        }
        config
    }
}

/// One time limiter lifecycle event.
#[derive(Clone, Debug)]
pub struct TimeLimiterEvent {
    pub time_limiter_name: String,
    pub created_at: DateTime<Utc>,
    pub kind: TimeLimiterEventKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeLimiterEventKind {
    /// The wrapped future completed in time.
    Success,
    /// The wrapped future failed in time; its error propagated.
    Error,
    /// The wait elapsed.
    Timeout,
}

/// Event surface of one time limiter.
pub struct TimeLimiterEventPublisher {
    inner: EventPublisher<TimeLimiterEvent>,
}

impl TimeLimiterEventPublisher {
    fn new() -> Self {
        Self { inner: EventPublisher::new() }
    }

    fn emit(&self, name: &str, kind: TimeLimiterEventKind) {
        if !self.inner.has_consumers() {
            return;
        }
        self.inner.publish(TimeLimiterEvent {
            time_limiter_name: name.to_string(),
            created_at: Utc::now(),
            kind,
        });
    }

    /// Registers a callback for every event.
    pub fn on_event(&self, consumer: impl Fn(&TimeLimiterEvent) + Send + Sync + 'static) {
        self.inner.on_event(consumer);
    }

    /// Registers a callback for in-time completions.
    pub fn on_success(&self, consumer: impl Fn(&TimeLimiterEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if e.kind == TimeLimiterEventKind::Success {
                consumer(e);
            }
        });
    }

    /// Registers a callback for in-time failures.
    pub fn on_error(&self, consumer: impl Fn(&TimeLimiterEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if e.kind == TimeLimiterEventKind::Error {
                consumer(e);
            }
        });
    }

    /// Registers a callback for timeouts.
    pub fn on_timeout(&self, consumer: impl Fn(&TimeLimiterEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if e.kind == TimeLimiterEventKind::Timeout {
                consumer(e);
            }
        });
    }

    /// Creates a bounded ring subscription over all events.
    pub fn subscribe(&self, capacity: usize) -> EventSubscription<TimeLimiterEvent> {
        self.inner.subscribe(capacity)
    }
}

/// A named time limiter instance. Construct with [`TimeLimiter::of`] or
/// through a [`TimeLimiterRegistry`].
pub struct TimeLimiter {
    name: String,
    config: TimeLimiterConfig,
    events: TimeLimiterEventPublisher,
}

impl TimeLimiter {
    /// Creates a time limiter named `name` with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics when the configuration is invalid; build configurations through
    /// [`TimeLimiterConfig::builder`] to validate them first.
    pub fn of(name: impl Into<String>, config: TimeLimiterConfig) -> Arc<Self> {
        config.validate().expect("invalid time limiter configuration");
        Arc::new(Self { name: name.into(), config, events: TimeLimiterEventPublisher::new() })
    }

    /// Creates a time limiter with the default configuration.
    pub fn of_defaults(name: impl Into<String>) -> Arc<Self> {
        Self::of(name, TimeLimiterConfig::default())
    }

    /// The instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The immutable configuration this limiter was created with.
    pub fn config(&self) -> &TimeLimiterConfig {
        &self.config
    }

    /// The limiter's event surface.
    pub fn event_publisher(&self) -> &TimeLimiterEventPublisher {
        &self.events
    }

    /// Obtains a future from `supplier` and waits out its completion.
    ///
    /// The future runs as its own task so that a timeout can cancel it;
    /// a panic inside it resumes on the caller.
    #[instrument(skip(self, supplier), fields(time_limiter = %self.name))]
    pub async fn execute_future_supplier<F, Fut, T, E>(
        &self,
        supplier: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let handle = tokio::spawn(supplier());
        let abort_handle = handle.abort_handle();
        let timeout = self.config.timeout_duration;

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(value))) => {
                self.events.emit(&self.name, TimeLimiterEventKind::Success);
                Ok(value)
            }
            Ok(Ok(Err(error))) => {
                self.events.emit(&self.name, TimeLimiterEventKind::Error);
                Err(GuardError::Inner { source: error })
            }
            Ok(Err(join_error)) => {
                // The task itself died; surface a panic on this thread.
                match join_error.try_into_panic() {
                    Ok(payload) => panic::resume_unwind(payload),
                    Err(join_error) => {
                        debug!(time_limiter = %self.name, %join_error, "wrapped task cancelled");
                        self.events.emit(&self.name, TimeLimiterEventKind::Timeout);
                        Err(GuardError::Timeout { timeout })
                    }
                }
            }
            Err(_elapsed) => {
                if self.config.cancel_running_future {
                    // The single cancel signal.
                    abort_handle.abort();
                } else {
                    debug!(time_limiter = %self.name, "timed-out future left running");
                }
                self.events.emit(&self.name, TimeLimiterEventKind::Timeout);
                Err(GuardError::Timeout { timeout })
            }
        }
    }
}

impl std::fmt::Debug for TimeLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeLimiter")
            .field("name", &self.name)
            .field("timeout_duration", &self.config.timeout_duration)
            .field("cancel_running_future", &self.config.cancel_running_future)
            .finish()
    }
}

/// Registry of named time limiters sharing named configurations.
pub struct TimeLimiterRegistry {
    inner: Registry<TimeLimiter, TimeLimiterConfig>,
}

impl TimeLimiterRegistry {
    /// Creates a registry with the given default configuration.
    pub fn new(default_config: TimeLimiterConfig) -> Self {
        Self { inner: Registry::new(default_config) }
    }

    /// Creates a registry using [`TimeLimiterConfig::default`].
    pub fn of_defaults() -> Self {
        Self::new(TimeLimiterConfig::default())
    }

    /// Returns the limiter named `name`, creating it with the default
    /// configuration on first use.
    pub fn get(&self, name: &str) -> Arc<TimeLimiter> {
        let config = self.inner.default_config();
        self.inner.compute_if_absent(name, || TimeLimiter::of(name, (*config).clone()))
    }

    /// Returns the limiter named `name`, creating it with `config` on first
    /// use.
    pub fn get_with_config(&self, name: &str, config: TimeLimiterConfig) -> Arc<TimeLimiter> {
        self.inner.compute_if_absent(name, || TimeLimiter::of(name, config))
    }

    /// Returns the limiter named `name`, creating it from the configuration
    /// produced by `config_supplier` on first use.
    pub fn get_with_config_supplier(
        &self,
        name: &str,
        config_supplier: impl FnOnce() -> TimeLimiterConfig,
    ) -> Arc<TimeLimiter> {
        self.inner.compute_if_absent(name, || TimeLimiter::of(name, config_supplier()))
    }

    /// Returns the limiter named `name`, creating it from the shared
    /// configuration `config_name` on first use.
    pub fn get_with_config_name(
        &self,
        name: &str,
        config_name: &str,
    ) -> Result<Arc<TimeLimiter>, ConfigError> {
        let config = self
            .inner
            .get_configuration(config_name)
            .ok_or_else(|| ConfigError::not_found(config_name))?;
        Ok(self.inner.compute_if_absent(name, || TimeLimiter::of(name, (*config).clone())))
    }

    /// Returns the limiter named `name`, composing its configuration from
    /// `properties`.
    pub fn get_from_properties(
        &self,
        name: &str,
        properties: &TimeLimiterProperties,
    ) -> Result<Arc<TimeLimiter>, ConfigError> {
        let base = self.inner.resolve_base(properties.base_config.as_deref())?;
        let config = properties.overlay(&base);
        config.validate()?;
        Ok(self.inner.compute_if_absent(name, || TimeLimiter::of(name, config)))
    }

    /// Looks up an existing limiter without creating one.
    pub fn find(&self, name: &str) -> Option<Arc<TimeLimiter>> {
        self.inner.find(name)
    }

    /// Removes the limiter named `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<TimeLimiter>> {
        self.inner.remove(name)
    }

    /// Replaces the limiter named `name` with a freshly built one using
    /// `config`, returning the old handle.
    pub fn replace(&self, name: &str, config: TimeLimiterConfig) -> Option<Arc<TimeLimiter>> {
        self.inner.replace(name, TimeLimiter::of(name, config))
    }

    /// Registers a shared configuration.
    pub fn add_configuration(
        &self,
        config_name: &str,
        config: TimeLimiterConfig,
    ) -> Result<(), ConfigError> {
        self.inner.add_configuration(config_name, config)
    }

    /// Looks up a shared configuration.
    pub fn get_configuration(&self, config_name: &str) -> Option<Arc<TimeLimiterConfig>> {
        self.inner.get_configuration(config_name)
    }

    /// The default configuration.
    pub fn default_config(&self) -> Arc<TimeLimiterConfig> {
        self.inner.default_config()
    }

    /// Snapshot of every registered limiter.
    pub fn get_all(&self) -> Vec<(String, Arc<TimeLimiter>)> {
        self.inner.get_all()
    }

    /// The underlying generic registry, for event subscriptions.
    pub fn registry(&self) -> &Registry<TimeLimiter, TimeLimiterConfig> {
        &self.inner
    }
}

impl Default for TimeLimiterRegistry {
    fn default() -> Self {
        Self::of_defaults()
    }
}
