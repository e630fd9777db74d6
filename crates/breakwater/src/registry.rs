//! Concurrent name→instance table shared by every primitive.
//!
//! A [`Registry`] owns two maps: entries (the live primitives) and named
//! shared configurations, with the reserved `"default"` key always present.
//! Entry creation is atomic per name: among concurrent
//! [`compute_if_absent`](Registry::compute_if_absent) callers exactly one
//! factory runs and everyone receives the same handle. Every entry mutation
//! publishes one [`RegistryEvent`].
//!
//! The per-primitive facades (`CircuitBreakerRegistry`, …) wrap this
//! container with concrete construction and properties-based configuration
//! composition; they live next to their primitive.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::error::ConfigError;
use crate::event::{EventPublisher, EventSubscription};

/// Reserved name of the default configuration.
pub const DEFAULT_CONFIG: &str = "default";

/// Lifecycle event of a registry's entry table.
pub enum RegistryEvent<E> {
    /// A factory ran and its entry was bound to `name`.
    EntryAdded { name: String, created_at: DateTime<Utc>, entry: Arc<E> },
    /// The entry bound to `name` was removed.
    EntryRemoved { name: String, created_at: DateTime<Utc>, entry: Arc<E> },
    /// The entry bound to `name` was swapped for a new one.
    EntryReplaced { name: String, created_at: DateTime<Utc>, old: Arc<E>, new: Arc<E> },
}

impl<E> RegistryEvent<E> {
    /// Name of the affected entry.
    pub fn name(&self) -> &str {
        match self {
            RegistryEvent::EntryAdded { name, .. }
            | RegistryEvent::EntryRemoved { name, .. }
            | RegistryEvent::EntryReplaced { name, .. } => name,
        }
    }
}

// Entries are shared as `Arc`s, so events clone without an `E: Clone`
// bound.
impl<E> Clone for RegistryEvent<E> {
    fn clone(&self) -> Self {
        match self {
            RegistryEvent::EntryAdded { name, created_at, entry } => RegistryEvent::EntryAdded {
                name: name.clone(),
                created_at: *created_at,
                entry: Arc::clone(entry),
            },
            RegistryEvent::EntryRemoved { name, created_at, entry } => {
                RegistryEvent::EntryRemoved {
                    name: name.clone(),
                    created_at: *created_at,
                    entry: Arc::clone(entry),
                }
            }
            RegistryEvent::EntryReplaced { name, created_at, old, new } => {
                RegistryEvent::EntryReplaced {
                    name: name.clone(),
                    created_at: *created_at,
                    old: Arc::clone(old),
                    new: Arc::clone(new),
                }
            }
        }
    }
}

impl<E> fmt::Debug for RegistryEvent<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, name) = match self {
            RegistryEvent::EntryAdded { name, .. } => ("EntryAdded", name),
            RegistryEvent::EntryRemoved { name, .. } => ("EntryRemoved", name),
            RegistryEvent::EntryReplaced { name, .. } => ("EntryReplaced", name),
        };
        f.debug_struct(kind).field("name", name).finish()
    }
}

/// Concurrent registry of named entries and named configurations.
pub struct Registry<E, C> {
    entries: DashMap<String, Arc<OnceCell<Arc<E>>>>,
    configurations: DashMap<String, Arc<C>>,
    default_config: Arc<C>,
    events: EventPublisher<RegistryEvent<E>>,
}

impl<E, C> Registry<E, C> {
    /// Creates a registry whose `"default"` configuration is `default_config`.
    pub fn new(default_config: C) -> Self {
        let default_config = Arc::new(default_config);
        let configurations = DashMap::new();
        configurations.insert(DEFAULT_CONFIG.to_string(), Arc::clone(&default_config));
        Self {
            entries: DashMap::new(),
            configurations,
            default_config,
            events: EventPublisher::new(),
        }
    }

    /// Returns the entry bound to `name`, running `factory` to create it if
    /// absent.
    ///
    /// The factory runs while holding no map-wide lock, so it may recurse
    /// into this registry for a *different* name. Recursing for the same
    /// name deadlocks, as it would in any per-name serialization scheme.
    pub fn compute_if_absent(
        &self,
        name: &str,
        factory: impl FnOnce() -> Arc<E>,
    ) -> Arc<E> {
        let cell = match self.entries.get(name) {
            Some(cell) => Arc::clone(&cell),
            None => {
                let cell = self
                    .entries
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new()));
                Arc::clone(&cell)
            }
        };

        let mut created = false;
        let entry = cell.get_or_init(|| {
            created = true;
            factory()
        });
        let entry = Arc::clone(entry);
        if created {
            self.events.publish(RegistryEvent::EntryAdded {
                name: name.to_string(),
                created_at: Utc::now(),
                entry: Arc::clone(&entry),
            });
        }
        entry
    }

    /// Looks up the entry bound to `name`.
    pub fn find(&self, name: &str) -> Option<Arc<E>> {
        self.entries.get(name).and_then(|cell| cell.get().cloned())
    }

    /// Removes and returns the entry bound to `name`. Publishes
    /// [`RegistryEvent::EntryRemoved`] only when an entry existed.
    pub fn remove(&self, name: &str) -> Option<Arc<E>> {
        let (_, cell) = self.entries.remove(name)?;
        let entry = cell.get().cloned()?;
        self.events.publish(RegistryEvent::EntryRemoved {
            name: name.to_string(),
            created_at: Utc::now(),
            entry: Arc::clone(&entry),
        });
        Some(entry)
    }

    /// Swaps the entry bound to `name` for `new_entry`, returning the old
    /// one. Does nothing when `name` is unbound.
    pub fn replace(&self, name: &str, new_entry: Arc<E>) -> Option<Arc<E>> {
        let cell = Arc::new(OnceCell::new());
        let _ = cell.set(Arc::clone(&new_entry));

        let old = match self.entries.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(cell);
                previous.get().cloned()
            }
            Entry::Vacant(_) => None,
        }?;

        self.events.publish(RegistryEvent::EntryReplaced {
            name: name.to_string(),
            created_at: Utc::now(),
            old: Arc::clone(&old),
            new: new_entry,
        });
        Some(old)
    }

    /// Registers a shared configuration under `config_name`.
    ///
    /// The `"default"` key is reserved and cannot be replaced.
    pub fn add_configuration(&self, config_name: &str, config: C) -> Result<(), ConfigError> {
        if config_name == DEFAULT_CONFIG {
            return Err(ConfigError::invalid(
                "'default' is reserved for the default configuration",
            ));
        }
        self.configurations.insert(config_name.to_string(), Arc::new(config));
        Ok(())
    }

    /// Looks up a shared configuration by name.
    pub fn get_configuration(&self, config_name: &str) -> Option<Arc<C>> {
        self.configurations.get(config_name).map(|c| Arc::clone(&c))
    }

    /// The configuration bound to the reserved `"default"` key.
    pub fn default_config(&self) -> Arc<C> {
        Arc::clone(&self.default_config)
    }

    /// Resolves the base configuration for an instance: the named shared
    /// configuration when `base_config` is set, the default otherwise.
    pub fn resolve_base(&self, base_config: Option<&str>) -> Result<Arc<C>, ConfigError> {
        match base_config {
            Some(name) => {
                self.get_configuration(name).ok_or_else(|| ConfigError::not_found(name))
            }
            None => Ok(self.default_config()),
        }
    }

    /// Snapshot of all bound entries.
    pub fn get_all(&self) -> Vec<(String, Arc<E>)> {
        self.entries
            .iter()
            .filter_map(|item| {
                item.value().get().map(|entry| (item.key().clone(), Arc::clone(entry)))
            })
            .collect()
    }

    /// Registers a callback for entry additions.
    pub fn on_entry_added(
        &self,
        consumer: impl Fn(&RegistryEvent<E>) + Send + Sync + 'static,
    ) {
        self.events.on_event(move |event| {
            if matches!(event, RegistryEvent::EntryAdded { .. }) {
                consumer(event);
            }
        });
    }

    /// Registers a callback for entry removals.
    pub fn on_entry_removed(
        &self,
        consumer: impl Fn(&RegistryEvent<E>) + Send + Sync + 'static,
    ) {
        self.events.on_event(move |event| {
            if matches!(event, RegistryEvent::EntryRemoved { .. }) {
                consumer(event);
            }
        });
    }

    /// Registers a callback for entry replacements.
    pub fn on_entry_replaced(
        &self,
        consumer: impl Fn(&RegistryEvent<E>) + Send + Sync + 'static,
    ) {
        self.events.on_event(move |event| {
            if matches!(event, RegistryEvent::EntryReplaced { .. }) {
                consumer(event);
            }
        });
    }

    /// Creates a bounded ring subscription over all registry events.
    pub fn subscribe_events(&self, capacity: usize) -> EventSubscription<RegistryEvent<E>> {
        self.events.subscribe(capacity)
    }
}

impl<E, C> fmt::Debug for Registry<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries.len())
            .field("configurations", &self.configurations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    /// The factory runs once; later calls get the cached entry.
    #[test]
    fn test_compute_if_absent_runs_factory_once() {
        let registry: Registry<String, ()> = Registry::new(());
        let runs = AtomicU32::new(0);

        let first = registry.compute_if_absent("a", || {
            runs.fetch_add(1, Ordering::SeqCst);
            Arc::new("entry".to_string())
        });
        let second = registry.compute_if_absent("a", || {
            runs.fetch_add(1, Ordering::SeqCst);
            Arc::new("other".to_string())
        });

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    /// Concurrent callers for one name all receive the same instance.
    #[test]
    fn test_compute_if_absent_concurrent() {
        let registry: Arc<Registry<u32, ()>> = Arc::new(Registry::new(()));
        let runs = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let runs = Arc::clone(&runs);
                std::thread::spawn(move || {
                    registry.compute_if_absent("shared", || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Arc::new(7)
                    })
                })
            })
            .collect();

        let entries: Vec<_> = handles.into_iter().map(|h| h.join().expect("join")).collect();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(entries.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    /// Remove only publishes and returns for names that were bound.
    #[test]
    fn test_remove_absent_is_silent() {
        let registry: Registry<u32, ()> = Registry::new(());
        let sub = registry.subscribe_events(8);

        assert!(registry.remove("missing").is_none());
        assert!(sub.is_empty());

        registry.compute_if_absent("present", || Arc::new(1));
        assert_eq!(registry.remove("present").as_deref(), Some(&1));
        let kinds: Vec<_> = sub.drain();
        assert_eq!(kinds.len(), 2); // added + removed
    }

    /// Replace swaps only existing bindings and reports both handles.
    #[test]
    fn test_replace() {
        let registry: Registry<u32, ()> = Registry::new(());
        assert!(registry.replace("missing", Arc::new(2)).is_none());
        assert!(registry.find("missing").is_none());

        registry.compute_if_absent("n", || Arc::new(1));
        let old = registry.replace("n", Arc::new(2)).expect("old entry");
        assert_eq!(*old, 1);
        assert_eq!(registry.find("n").as_deref(), Some(&2));
    }

    /// The reserved default key cannot be overwritten.
    #[test]
    fn test_default_config_reserved() {
        let registry: Registry<u32, u32> = Registry::new(10);
        assert!(registry.add_configuration("default", 99).is_err());
        assert_eq!(*registry.default_config(), 10);

        registry.add_configuration("shared", 20).expect("add");
        assert_eq!(registry.get_configuration("shared").as_deref(), Some(&20));
    }

    /// Resolving an unknown base configuration is an error.
    #[test]
    fn test_resolve_base() {
        let registry: Registry<u32, u32> = Registry::new(10);
        registry.add_configuration("shared", 20).expect("add");

        assert_eq!(*registry.resolve_base(None).expect("default"), 10);
        assert_eq!(*registry.resolve_base(Some("shared")).expect("shared"), 20);
        assert!(matches!(
            registry.resolve_base(Some("nope")),
            Err(ConfigError::NotFound { .. })
        ));
    }
}
