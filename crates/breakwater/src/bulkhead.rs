//! Semaphore bulkhead limiting concurrent calls.
//!
//! A bulkhead grants at most `max_concurrent_calls` permissions at a time.
//! [`acquire_permission`](Bulkhead::acquire_permission) waits up to
//! `max_wait_time` for a slot; every acquired permission must be returned
//! with [`on_complete`](Bulkhead::on_complete), on success and failure paths
//! alike. The decorators do this bookkeeping for you.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, GuardError};
use crate::event::{EventPublisher, EventSubscription};
use crate::registry::Registry;
use crate::utils::option_duration_millis;

/// Tuning knobs for a [`Bulkhead`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkheadConfig {
    /// Maximum permissions outstanding at any instant.
    pub max_concurrent_calls: u32,
    /// How long an acquisition may wait for a slot. Zero means fail fast.
    pub max_wait_time: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent_calls: 25, max_wait_time: Duration::ZERO }
    }
}

impl BulkheadConfig {
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::new()
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::invalid("max_concurrent_calls must be greater than 0"));
        }
        Ok(())
    }
}

/// Fluent builder for [`BulkheadConfig`].
#[derive(Debug, Default)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl BulkheadConfigBuilder {
    pub fn new() -> Self {
        Self { config: BulkheadConfig::default() }
    }

    pub fn max_concurrent_calls(mut self, max: u32) -> Self {
        self.config.max_concurrent_calls = max;
        self
    }

    pub fn max_wait_time(mut self, wait: Duration) -> Self {
        self.config.max_wait_time = wait;
        self
    }

    pub fn build(self) -> Result<BulkheadConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Partially-specified settings for one named instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BulkheadProperties {
    pub base_config: Option<String>,
    pub max_concurrent_calls: Option<u32>,
    #[serde(with = "option_duration_millis")]
    pub max_wait_time: Option<Duration>,
}

impl BulkheadProperties {
    /// Applies the explicitly set fields on top of `base`.
    pub fn overlay(&self, base: &BulkheadConfig) -> BulkheadConfig {
        let mut config = base.clone();
        if let Some(v) = self.max_concurrent_calls {
            config.max_concurrent_calls = v;
        }
        if let Some(v) = self.max_wait_time {
            config.max_wait_time = v;
        }
        config
    }
}

/// One bulkhead lifecycle event.
#[derive(Clone, Debug)]
pub struct BulkheadEvent {
    pub bulkhead_name: String,
    pub created_at: DateTime<Utc>,
    pub kind: BulkheadEventKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BulkheadEventKind {
    /// A permission was granted.
    CallPermitted,
    /// The wait for a permission timed out or was refused.
    CallRejected,
    /// A permission was returned.
    CallFinished,
}

/// Event surface of one bulkhead.
pub struct BulkheadEventPublisher {
    inner: EventPublisher<BulkheadEvent>,
}

impl BulkheadEventPublisher {
    fn new() -> Self {
        Self { inner: EventPublisher::new() }
    }

    fn emit(&self, name: &str, kind: BulkheadEventKind) {
        if !self.inner.has_consumers() {
            return;
        }
        self.inner.publish(BulkheadEvent {
            bulkhead_name: name.to_string(),
            created_at: Utc::now(),
            kind,
        });
    }

    /// Registers a callback for every event.
    pub fn on_event(&self, consumer: impl Fn(&BulkheadEvent) + Send + Sync + 'static) {
        self.inner.on_event(consumer);
    }

    /// Registers a callback for granted permissions.
    pub fn on_call_permitted(&self, consumer: impl Fn(&BulkheadEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if e.kind == BulkheadEventKind::CallPermitted {
                consumer(e);
            }
        });
    }

    /// Registers a callback for rejected calls.
    pub fn on_call_rejected(&self, consumer: impl Fn(&BulkheadEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if e.kind == BulkheadEventKind::CallRejected {
                consumer(e);
            }
        });
    }

    /// Registers a callback for returned permissions.
    pub fn on_call_finished(&self, consumer: impl Fn(&BulkheadEvent) + Send + Sync + 'static) {
        self.inner.on_event(move |e| {
            if e.kind == BulkheadEventKind::CallFinished {
                consumer(e);
            }
        });
    }

    /// Creates a bounded ring subscription over all events.
    pub fn subscribe(&self, capacity: usize) -> EventSubscription<BulkheadEvent> {
        self.inner.subscribe(capacity)
    }
}

/// Point-in-time metrics of one bulkhead.
#[derive(Clone, Copy, Debug)]
pub struct BulkheadMetrics {
    /// Permissions that could be granted right now.
    pub available_concurrent_calls: u32,
    /// The configured concurrency cap.
    pub max_allowed_concurrent_calls: u32,
    pub rejected_calls: u64,
}

/// A named bulkhead instance. Construct with [`Bulkhead::of`] or through a
/// [`BulkheadRegistry`].
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    semaphore: Semaphore,
    rejected: AtomicU64,
    events: BulkheadEventPublisher,
}

impl Bulkhead {
    /// Creates a bulkhead named `name` with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics when the configuration is invalid; build configurations through
    /// [`BulkheadConfig::builder`] to validate them first.
    pub fn of(name: impl Into<String>, config: BulkheadConfig) -> Arc<Self> {
        config.validate().expect("invalid bulkhead configuration");
        Arc::new(Self {
            name: name.into(),
            semaphore: Semaphore::new(config.max_concurrent_calls as usize),
            config,
            rejected: AtomicU64::new(0),
            events: BulkheadEventPublisher::new(),
        })
    }

    /// Creates a bulkhead with the default configuration.
    pub fn of_defaults(name: impl Into<String>) -> Arc<Self> {
        Self::of(name, BulkheadConfig::default())
    }

    /// The instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The immutable configuration this bulkhead was created with.
    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// The bulkhead's event surface.
    pub fn event_publisher(&self) -> &BulkheadEventPublisher {
        &self.events
    }

    /// Takes a permission only when one is free right now.
    pub fn try_acquire_permission(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.events.emit(&self.name, BulkheadEventKind::CallPermitted);
                true
            }
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                self.events.emit(&self.name, BulkheadEventKind::CallRejected);
                false
            }
        }
    }

    /// Acquires a permission, waiting up to `max_wait_time`.
    ///
    /// A zero `max_wait_time` fails fast: a free permit is always granted
    /// and a saturated bulkhead rejects immediately. Timeout (and
    /// cancellation of the wait) fail with [`GuardError::BulkheadFull`].
    pub async fn acquire_permission(&self) -> Result<(), GuardError> {
        if self.config.max_wait_time.is_zero() {
            // A zero-length timer must not race the semaphore; the
            // non-blocking path decides deterministically.
            return if self.try_acquire_permission() {
                Ok(())
            } else {
                Err(GuardError::BulkheadFull { name: self.name.clone() })
            };
        }

        match tokio::time::timeout(self.config.max_wait_time, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.events.emit(&self.name, BulkheadEventKind::CallPermitted);
                Ok(())
            }
            // The semaphore is never closed; treat both arms as saturation.
            Ok(Err(_)) | Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                self.events.emit(&self.name, BulkheadEventKind::CallRejected);
                debug!(bulkhead = %self.name, "bulkhead full");
                Err(GuardError::BulkheadFull { name: self.name.clone() })
            }
        }
    }

    /// Returns one permission. Must be called exactly once per successful
    /// acquisition; surplus releases saturate at the configured cap.
    pub fn on_complete(&self) {
        if self.semaphore.available_permits() >= self.config.max_concurrent_calls as usize {
            warn!(bulkhead = %self.name, "on_complete without a matching acquisition");
            return;
        }
        self.semaphore.add_permits(1);
        self.events.emit(&self.name, BulkheadEventKind::CallFinished);
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            available_concurrent_calls: self.semaphore.available_permits() as u32,
            max_allowed_concurrent_calls: self.config.max_concurrent_calls,
            rejected_calls: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Runs an asynchronous operation inside the bulkhead, returning the
    /// permission on every path.
    #[instrument(skip(self, operation), fields(bulkhead = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.acquire_permission().await.map_err(GuardError::widen)?;
        let result = operation().await;
        self.on_complete();
        match result {
            Ok(value) => Ok(value),
            Err(error) => Err(GuardError::Inner { source: error }),
        }
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("available", &self.semaphore.available_permits())
            .field("max_concurrent_calls", &self.config.max_concurrent_calls)
            .finish()
    }
}

/// Registry of named bulkheads sharing named configurations.
pub struct BulkheadRegistry {
    inner: Registry<Bulkhead, BulkheadConfig>,
}

impl BulkheadRegistry {
    /// Creates a registry with the given default configuration.
    pub fn new(default_config: BulkheadConfig) -> Self {
        Self { inner: Registry::new(default_config) }
    }

    /// Creates a registry using [`BulkheadConfig::default`].
    pub fn of_defaults() -> Self {
        Self::new(BulkheadConfig::default())
    }

    /// Returns the bulkhead named `name`, creating it with the default
    /// configuration on first use.
    pub fn get(&self, name: &str) -> Arc<Bulkhead> {
        let config = self.inner.default_config();
        self.inner.compute_if_absent(name, || Bulkhead::of(name, (*config).clone()))
    }

    /// Returns the bulkhead named `name`, creating it with `config` on first
    /// use.
    pub fn get_with_config(&self, name: &str, config: BulkheadConfig) -> Arc<Bulkhead> {
        self.inner.compute_if_absent(name, || Bulkhead::of(name, config))
    }

    /// Returns the bulkhead named `name`, creating it from the configuration
    /// produced by `config_supplier` on first use.
    pub fn get_with_config_supplier(
        &self,
        name: &str,
        config_supplier: impl FnOnce() -> BulkheadConfig,
    ) -> Arc<Bulkhead> {
        self.inner.compute_if_absent(name, || Bulkhead::of(name, config_supplier()))
    }

    /// Returns the bulkhead named `name`, creating it from the shared
    /// configuration `config_name` on first use.
    pub fn get_with_config_name(
        &self,
        name: &str,
        config_name: &str,
    ) -> Result<Arc<Bulkhead>, ConfigError> {
        let config = self
            .inner
            .get_configuration(config_name)
            .ok_or_else(|| ConfigError::not_found(config_name))?;
        Ok(self.inner.compute_if_absent(name, || Bulkhead::of(name, (*config).clone())))
    }

    /// Returns the bulkhead named `name`, composing its configuration from
    /// `properties`.
    pub fn get_from_properties(
        &self,
        name: &str,
        properties: &BulkheadProperties,
    ) -> Result<Arc<Bulkhead>, ConfigError> {
        let base = self.inner.resolve_base(properties.base_config.as_deref())?;
        let config = properties.overlay(&base);
        config.validate()?;
        Ok(self.inner.compute_if_absent(name, || Bulkhead::of(name, config)))
    }

    /// Looks up an existing bulkhead without creating one.
    pub fn find(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.inner.find(name)
    }

    /// Removes the bulkhead named `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.inner.remove(name)
    }

    /// Replaces the bulkhead named `name` with a freshly built one using
    /// `config`, returning the old handle.
    pub fn replace(&self, name: &str, config: BulkheadConfig) -> Option<Arc<Bulkhead>> {
        self.inner.replace(name, Bulkhead::of(name, config))
    }

    /// Registers a shared configuration.
    pub fn add_configuration(
        &self,
        config_name: &str,
        config: BulkheadConfig,
    ) -> Result<(), ConfigError> {
        self.inner.add_configuration(config_name, config)
    }

    /// Looks up a shared configuration.
    pub fn get_configuration(&self, config_name: &str) -> Option<Arc<BulkheadConfig>> {
        self.inner.get_configuration(config_name)
    }

    /// The default configuration.
    pub fn default_config(&self) -> Arc<BulkheadConfig> {
        self.inner.default_config()
    }

    /// Snapshot of every registered bulkhead.
    pub fn get_all(&self) -> Vec<(String, Arc<Bulkhead>)> {
        self.inner.get_all()
    }

    /// The underlying generic registry, for event subscriptions.
    pub fn registry(&self) -> &Registry<Bulkhead, BulkheadConfig> {
        &self.inner
    }
}

impl Default for BulkheadRegistry {
    fn default() -> Self {
        Self::of_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulkhead(max: u32, wait: Duration) -> Arc<Bulkhead> {
        let config = BulkheadConfig::builder()
            .max_concurrent_calls(max)
            .max_wait_time(wait)
            .build()
            .expect("valid config");
        Bulkhead::of("test", config)
    }

    /// Permissions are bounded by the configured cap.
    #[test]
    fn test_try_acquire_bounded() {
        let bh = bulkhead(2, Duration::ZERO);
        assert!(bh.try_acquire_permission());
        assert!(bh.try_acquire_permission());
        assert!(!bh.try_acquire_permission());

        bh.on_complete();
        assert!(bh.try_acquire_permission());
    }

    /// A zero wait time rejects immediately when saturated.
    #[tokio::test]
    async fn test_acquire_fail_fast() {
        let bh = bulkhead(1, Duration::ZERO);
        bh.acquire_permission().await.expect("first slot");
        let denied = bh.acquire_permission().await;
        assert!(matches!(denied, Err(GuardError::BulkheadFull { .. })));
        assert_eq!(bh.metrics().rejected_calls, 1);
    }

    /// With a zero wait time, `acquire_permission` is deterministic: a free
    /// permit is never spuriously rejected, however often it is exercised.
    #[tokio::test]
    async fn test_zero_wait_never_spuriously_rejects() {
        let bh = bulkhead(1, Duration::ZERO);
        for round in 0..1000 {
            bh.acquire_permission()
                .await
                .unwrap_or_else(|_| panic!("free permit rejected in round {round}"));
            bh.on_complete();
        }
        assert_eq!(bh.metrics().rejected_calls, 0);
    }

    /// A saturated bulkhead rejects after the wait elapses, and a released
    /// permission admits the next caller.
    #[tokio::test]
    async fn test_acquire_times_out_then_recovers() {
        let bh = bulkhead(1, Duration::from_millis(10));
        bh.acquire_permission().await.expect("first slot");

        let denied = bh.acquire_permission().await;
        assert!(matches!(denied, Err(GuardError::BulkheadFull { .. })));

        bh.on_complete();
        bh.acquire_permission().await.expect("freed slot");
    }

    /// A waiting acquisition succeeds once a permission is returned.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_waiter_wakes_on_release() {
        let bh = bulkhead(1, Duration::from_secs(5));
        bh.acquire_permission().await.expect("first slot");

        let contender = {
            let bh = Arc::clone(&bh);
            tokio::spawn(async move { bh.acquire_permission().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bh.on_complete();

        contender.await.expect("join").expect("granted after release");
    }

    /// Surplus releases saturate at the cap instead of minting permits.
    #[test]
    fn test_on_complete_saturates() {
        let bh = bulkhead(1, Duration::ZERO);
        bh.on_complete();
        bh.on_complete();

        assert!(bh.try_acquire_permission());
        assert!(!bh.try_acquire_permission());
    }

    /// The decorator returns the permission on both outcome paths.
    #[tokio::test]
    async fn test_execute_releases_on_error() {
        let bh = bulkhead(1, Duration::ZERO);

        let failed: Result<(), GuardError<std::io::Error>> =
            bh.execute(|| async { Err(std::io::Error::other("boom")) }).await;
        assert!(matches!(failed, Err(GuardError::Inner { .. })));

        let ok: Result<u32, GuardError<std::io::Error>> = bh.execute(|| async { Ok(9) }).await;
        assert_eq!(ok.expect("slot released"), 9);
    }

    /// Permitted, rejected and finished calls publish their events.
    #[tokio::test]
    async fn test_events() {
        let bh = bulkhead(1, Duration::ZERO);
        let sub = bh.event_publisher().subscribe(8);

        assert!(bh.try_acquire_permission());
        assert!(!bh.try_acquire_permission());
        bh.on_complete();

        let kinds: Vec<_> = sub.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BulkheadEventKind::CallPermitted,
                BulkheadEventKind::CallRejected,
                BulkheadEventKind::CallFinished,
            ]
        );
    }
}
