//! Worker-pool bulkhead with a bounded queue.
//!
//! [`submit`](ThreadPoolBulkhead::submit) hands a task to the pool: it runs
//! immediately when a worker is free, queues when the bounded queue has room,
//! and otherwise is rejected with [`GuardError::BulkheadFull`] — tasks are
//! never silently discarded, and the submitter never blocks beyond the lock
//! on the queue head. Core workers live forever; workers above
//! `core_thread_pool_size` retire after `keep_alive_duration` idle.
//!
//! This is the one primitive that creates threads.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{ConfigError, GuardError};
use crate::event::{EventPublisher, EventSubscription};
use crate::registry::Registry;
use crate::utils::option_duration_millis;

fn default_pool_size() -> u32 {
    std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
}

/// Tuning knobs for a [`ThreadPoolBulkhead`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadPoolBulkheadConfig {
    /// Workers kept alive permanently.
    pub core_thread_pool_size: u32,
    /// Upper bound on workers, including temporary ones.
    pub max_thread_pool_size: u32,
    /// Tasks buffered while all workers are busy.
    pub queue_capacity: u32,
    /// Idle time after which a non-core worker retires.
    pub keep_alive_duration: Duration,
}

impl Default for ThreadPoolBulkheadConfig {
    fn default() -> Self {
        let size = default_pool_size();
        Self {
            core_thread_pool_size: size,
            max_thread_pool_size: size,
            queue_capacity: 100,
            keep_alive_duration: Duration::from_millis(20),
        }
    }
}

impl ThreadPoolBulkheadConfig {
    pub fn builder() -> ThreadPoolBulkheadConfigBuilder {
        ThreadPoolBulkheadConfigBuilder::new()
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core_thread_pool_size == 0 {
            return Err(ConfigError::invalid("core_thread_pool_size must be greater than 0"));
        }
        if self.max_thread_pool_size < self.core_thread_pool_size {
            return Err(ConfigError::invalid(
                "max_thread_pool_size must be at least core_thread_pool_size",
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`ThreadPoolBulkheadConfig`].
#[derive(Debug, Default)]
pub struct ThreadPoolBulkheadConfigBuilder {
    config: ThreadPoolBulkheadConfig,
}

impl ThreadPoolBulkheadConfigBuilder {
    pub fn new() -> Self {
        Self { config: ThreadPoolBulkheadConfig::default() }
    }

    pub fn core_thread_pool_size(mut self, size: u32) -> Self {
        self.config.core_thread_pool_size = size;
        self
    }

    pub fn max_thread_pool_size(mut self, size: u32) -> Self {
        self.config.max_thread_pool_size = size;
        self
    }

    pub fn queue_capacity(mut self, capacity: u32) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn keep_alive_duration(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive_duration = keep_alive;
        self
    }

    pub fn build(self) -> Result<ThreadPoolBulkheadConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Partially-specified settings for one named instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThreadPoolBulkheadProperties {
    pub base_config: Option<String>,
    pub core_thread_pool_size: Option<u32>,
    pub max_thread_pool_size: Option<u32>,
    pub queue_capacity: Option<u32>,
    #[serde(with = "option_duration_millis")]
    pub keep_alive_duration: Option<Duration>,
}

impl ThreadPoolBulkheadProperties {
    /// Applies the explicitly set fields on top of `base`.
    pub fn overlay(&self, base: &ThreadPoolBulkheadConfig) -> ThreadPoolBulkheadConfig {
        let mut config = base.clone();
        if let Some(v) = self.core_thread_pool_size {
            config.core_thread_pool_size = v;
        }
        if let Some(v) = self.max_thread_pool_size {
            config.max_thread_pool_size = v;
        }
        if let Some(v) = self.queue_capacity {
            config.queue_capacity = v;
        }
        if let Some(v) = self.keep_alive_duration {
            config.keep_alive_duration = v;
        }
        config
    }
}

/// One pool bulkhead lifecycle event.
#[derive(Clone, Debug)]
pub struct ThreadPoolBulkheadEvent {
    pub bulkhead_name: String,
    pub created_at: DateTime<Utc>,
    pub kind: ThreadPoolBulkheadEventKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadPoolBulkheadEventKind {
    /// A task was accepted (running or queued).
    CallPermitted,
    /// Workers and queue were saturated; the task was rejected.
    CallRejected,
    /// A task finished executing.
    CallFinished,
}

/// Event surface of one pool bulkhead.
pub struct ThreadPoolBulkheadEventPublisher {
    inner: EventPublisher<ThreadPoolBulkheadEvent>,
}

impl ThreadPoolBulkheadEventPublisher {
    fn new() -> Self {
        Self { inner: EventPublisher::new() }
    }

    fn emit(&self, name: &str, kind: ThreadPoolBulkheadEventKind) {
        if !self.inner.has_consumers() {
            return;
        }
        self.inner.publish(ThreadPoolBulkheadEvent {
            bulkhead_name: name.to_string(),
            created_at: Utc::now(),
            kind,
        });
    }

    /// Registers a callback for every event.
    pub fn on_event(
        &self,
        consumer: impl Fn(&ThreadPoolBulkheadEvent) + Send + Sync + 'static,
    ) {
        self.inner.on_event(consumer);
    }

    /// Registers a callback for accepted tasks.
    pub fn on_call_permitted(
        &self,
        consumer: impl Fn(&ThreadPoolBulkheadEvent) + Send + Sync + 'static,
    ) {
        self.inner.on_event(move |e| {
            if e.kind == ThreadPoolBulkheadEventKind::CallPermitted {
                consumer(e);
            }
        });
    }

    /// Registers a callback for rejected tasks.
    pub fn on_call_rejected(
        &self,
        consumer: impl Fn(&ThreadPoolBulkheadEvent) + Send + Sync + 'static,
    ) {
        self.inner.on_event(move |e| {
            if e.kind == ThreadPoolBulkheadEventKind::CallRejected {
                consumer(e);
            }
        });
    }

    /// Registers a callback for finished tasks.
    pub fn on_call_finished(
        &self,
        consumer: impl Fn(&ThreadPoolBulkheadEvent) + Send + Sync + 'static,
    ) {
        self.inner.on_event(move |e| {
            if e.kind == ThreadPoolBulkheadEventKind::CallFinished {
                consumer(e);
            }
        });
    }

    /// Creates a bounded ring subscription over all events.
    pub fn subscribe(&self, capacity: usize) -> EventSubscription<ThreadPoolBulkheadEvent> {
        self.inner.subscribe(capacity)
    }
}

/// Point-in-time metrics of one pool bulkhead.
#[derive(Clone, Copy, Debug)]
pub struct ThreadPoolBulkheadMetrics {
    /// Live workers, core and temporary.
    pub thread_count: u32,
    /// Tasks currently buffered.
    pub queue_depth: u32,
    /// The configured queue bound.
    pub queue_capacity: u32,
    /// Queue slots still free.
    pub remaining_queue_capacity: u32,
}

/// Completion handle for a submitted task.
///
/// Awaiting resolves to `None` when the task panicked or the pool shut down
/// before the task produced a value.
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Waits for the task's result.
    pub async fn join(self) -> Option<T> {
        self.receiver.await.ok()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    worker_count: u32,
    shutdown: bool,
}

struct PoolShared {
    name: String,
    keep_alive: Duration,
    state: Mutex<PoolState>,
    work_available: Condvar,
    events: ThreadPoolBulkheadEventPublisher,
}

/// A named pool bulkhead instance. Construct with [`ThreadPoolBulkhead::of`]
/// or through a [`ThreadPoolBulkheadRegistry`].
pub struct ThreadPoolBulkhead {
    config: ThreadPoolBulkheadConfig,
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPoolBulkhead {
    /// Creates a pool bulkhead named `name` with the given configuration.
    /// Workers are spawned on demand, up to `core_thread_pool_size`
    /// permanently and `max_thread_pool_size` in total.
    ///
    /// # Panics
    ///
    /// Panics when the configuration is invalid; build configurations through
    /// [`ThreadPoolBulkheadConfig::builder`] to validate them first.
    pub fn of(name: impl Into<String>, config: ThreadPoolBulkheadConfig) -> Arc<Self> {
        config.validate().expect("invalid thread pool bulkhead configuration");
        Arc::new(Self {
            shared: Arc::new(PoolShared {
                name: name.into(),
                keep_alive: config.keep_alive_duration,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    worker_count: 0,
                    shutdown: false,
                }),
                work_available: Condvar::new(),
                events: ThreadPoolBulkheadEventPublisher::new(),
            }),
            config,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Creates a pool bulkhead with the default configuration.
    pub fn of_defaults(name: impl Into<String>) -> Arc<Self> {
        Self::of(name, ThreadPoolBulkheadConfig::default())
    }

    /// The instance name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The immutable configuration this pool was created with.
    pub fn config(&self) -> &ThreadPoolBulkheadConfig {
        &self.config
    }

    /// The pool's event surface.
    pub fn event_publisher(&self) -> &ThreadPoolBulkheadEventPublisher {
        &self.shared.events
    }

    /// Submits `task` for execution: run now, queue, or reject.
    pub fn submit<T, F>(&self, task: F) -> Result<TaskHandle<T>, GuardError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let job: Job = Box::new(move || {
            match catch_unwind(AssertUnwindSafe(task)) {
                // The caller may have dropped the handle; that loss is fine.
                Ok(value) => {
                    let _ = sender.send(value);
                }
                Err(_) => warn!("pool bulkhead task panicked"),
            }
        });

        let accepted = {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.shutdown {
                false
            } else if state.worker_count < self.config.core_thread_pool_size {
                state.queue.push_back(job);
                self.spawn_worker(&mut state, true);
                true
            } else if (state.queue.len() as u32) < self.config.queue_capacity {
                state.queue.push_back(job);
                true
            } else if state.worker_count < self.config.max_thread_pool_size {
                // Direct handoff to a fresh temporary worker.
                state.queue.push_back(job);
                self.spawn_worker(&mut state, false);
                true
            } else {
                false
            }
        };

        if accepted {
            self.shared.work_available.notify_one();
            self.shared.events.emit(&self.shared.name, ThreadPoolBulkheadEventKind::CallPermitted);
            Ok(TaskHandle { receiver })
        } else {
            debug!(bulkhead = %self.shared.name, "pool bulkhead rejected task");
            self.shared.events.emit(&self.shared.name, ThreadPoolBulkheadEventKind::CallRejected);
            Err(GuardError::BulkheadFull { name: self.shared.name.clone() })
        }
    }

    fn spawn_worker(&self, state: &mut PoolState, is_core: bool) {
        state.worker_count += 1;
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || worker_loop(shared, is_core));
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> ThreadPoolBulkheadMetrics {
        let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        let queue_depth = state.queue.len() as u32;
        ThreadPoolBulkheadMetrics {
            thread_count: state.worker_count,
            queue_depth,
            queue_capacity: self.config.queue_capacity,
            remaining_queue_capacity: self.config.queue_capacity.saturating_sub(queue_depth),
        }
    }

    /// Stops accepting tasks, lets the workers drain the queue, and joins
    /// them.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.work_available.notify_all();
        let handles =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPoolBulkhead {
    fn drop(&mut self) {
        // Workers exit once the queue drains; dropping must not block, so
        // they are not joined here.
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.shutdown = true;
        drop(state);
        self.shared.work_available.notify_all();
    }
}

impl std::fmt::Debug for ThreadPoolBulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let metrics = self.metrics();
        f.debug_struct("ThreadPoolBulkhead")
            .field("name", &self.shared.name)
            .field("thread_count", &metrics.thread_count)
            .field("queue_depth", &metrics.queue_depth)
            .finish()
    }
}

fn worker_loop(shared: Arc<PoolShared>, is_core: bool) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break Some(job);
                }
                if state.shutdown {
                    state.worker_count = state.worker_count.saturating_sub(1);
                    break None;
                }
                if is_core {
                    state = shared
                        .work_available
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                } else {
                    let (guard, timeout) = shared
                        .work_available
                        .wait_timeout(state, shared.keep_alive)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                    if timeout.timed_out() && state.queue.is_empty() {
                        // Idle past keep-alive: retire.
                        state.worker_count = state.worker_count.saturating_sub(1);
                        break None;
                    }
                }
            }
        };
        match job {
            Some(job) => {
                job();
                shared.events.emit(&shared.name, ThreadPoolBulkheadEventKind::CallFinished);
            }
            None => return,
        }
    }
}

/// Registry of named pool bulkheads sharing named configurations.
pub struct ThreadPoolBulkheadRegistry {
    inner: Registry<ThreadPoolBulkhead, ThreadPoolBulkheadConfig>,
}

impl ThreadPoolBulkheadRegistry {
    /// Creates a registry with the given default configuration.
    pub fn new(default_config: ThreadPoolBulkheadConfig) -> Self {
        Self { inner: Registry::new(default_config) }
    }

    /// Creates a registry using [`ThreadPoolBulkheadConfig::default`].
    pub fn of_defaults() -> Self {
        Self::new(ThreadPoolBulkheadConfig::default())
    }

    /// Returns the pool named `name`, creating it with the default
    /// configuration on first use.
    pub fn get(&self, name: &str) -> Arc<ThreadPoolBulkhead> {
        let config = self.inner.default_config();
        self.inner.compute_if_absent(name, || ThreadPoolBulkhead::of(name, (*config).clone()))
    }

    /// Returns the pool named `name`, creating it with `config` on first use.
    pub fn get_with_config(
        &self,
        name: &str,
        config: ThreadPoolBulkheadConfig,
    ) -> Arc<ThreadPoolBulkhead> {
        self.inner.compute_if_absent(name, || ThreadPoolBulkhead::of(name, config))
    }

    /// Returns the pool named `name`, creating it from the configuration
    /// produced by `config_supplier` on first use.
    pub fn get_with_config_supplier(
        &self,
        name: &str,
        config_supplier: impl FnOnce() -> ThreadPoolBulkheadConfig,
    ) -> Arc<ThreadPoolBulkhead> {
        self.inner.compute_if_absent(name, || ThreadPoolBulkhead::of(name, config_supplier()))
    }

    /// Returns the pool named `name`, creating it from the shared
    /// configuration `config_name` on first use.
    pub fn get_with_config_name(
        &self,
        name: &str,
        config_name: &str,
    ) -> Result<Arc<ThreadPoolBulkhead>, ConfigError> {
        let config = self
            .inner
            .get_configuration(config_name)
            .ok_or_else(|| ConfigError::not_found(config_name))?;
        Ok(self.inner.compute_if_absent(name, || ThreadPoolBulkhead::of(name, (*config).clone())))
    }

    /// Returns the pool named `name`, composing its configuration from
    /// `properties`.
    pub fn get_from_properties(
        &self,
        name: &str,
        properties: &ThreadPoolBulkheadProperties,
    ) -> Result<Arc<ThreadPoolBulkhead>, ConfigError> {
        let base = self.inner.resolve_base(properties.base_config.as_deref())?;
        let config = properties.overlay(&base);
        config.validate()?;
        Ok(self.inner.compute_if_absent(name, || ThreadPoolBulkhead::of(name, config)))
    }

    /// Looks up an existing pool without creating one.
    pub fn find(&self, name: &str) -> Option<Arc<ThreadPoolBulkhead>> {
        self.inner.find(name)
    }

    /// Removes the pool named `name`. The caller decides when to
    /// [`shutdown`](ThreadPoolBulkhead::shutdown) it.
    pub fn remove(&self, name: &str) -> Option<Arc<ThreadPoolBulkhead>> {
        self.inner.remove(name)
    }

    /// Registers a shared configuration.
    pub fn add_configuration(
        &self,
        config_name: &str,
        config: ThreadPoolBulkheadConfig,
    ) -> Result<(), ConfigError> {
        self.inner.add_configuration(config_name, config)
    }

    /// Looks up a shared configuration.
    pub fn get_configuration(&self, config_name: &str) -> Option<Arc<ThreadPoolBulkheadConfig>> {
        self.inner.get_configuration(config_name)
    }

    /// The default configuration.
    pub fn default_config(&self) -> Arc<ThreadPoolBulkheadConfig> {
        self.inner.default_config()
    }

    /// Snapshot of every registered pool.
    pub fn get_all(&self) -> Vec<(String, Arc<ThreadPoolBulkhead>)> {
        self.inner.get_all()
    }

    /// The underlying generic registry, for event subscriptions.
    pub fn registry(&self) -> &Registry<ThreadPoolBulkhead, ThreadPoolBulkheadConfig> {
        &self.inner
    }
}

impl Default for ThreadPoolBulkheadRegistry {
    fn default() -> Self {
        Self::of_defaults()
    }
}
