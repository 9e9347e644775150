//! Per-storage context: injected services and memoized handles.
//!
//! Every storage instance owns one [`StorageContext`]. It carries the
//! configuration and the actor lookup the storage was constructed with, and
//! lazily builds the cache-layer handles so each is created once per
//! instance.

// Mutex.lock().unwrap() only panics on lock poisoning (prior panic
// while holding lock). This is intentional - corrupted state should not propagate.
#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex, OnceLock};

use crate::cache::{Cache, Propagator, Scanner, Updater, WatchPolicy, Watcher};
use crate::config::StorageConfig;
use crate::types::Availability;
use crate::validation::FilenameValidator;

/// Source of the currently authenticated actor.
pub trait ActorContext: Send + Sync {
    /// User id of the current actor, if anyone is authenticated.
    fn current_user(&self) -> Option<String>;
}

/// Actor context that always reports the same user.
#[derive(Debug, Clone)]
pub struct StaticActor(pub String);

impl ActorContext for StaticActor {
    fn current_user(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Actor context with nobody logged in.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoActor;

impl ActorContext for NoActor {
    fn current_user(&self) -> Option<String> {
        None
    }
}

/// Services and memoized state owned by one storage instance.
pub struct StorageContext {
    config: Arc<StorageConfig>,
    validator: FilenameValidator,
    actor: Arc<dyn ActorContext>,
    owner: OnceLock<Option<String>>,
    availability: Mutex<Availability>,
    watch_policy: WatchPolicy,
    cache: OnceLock<Arc<Cache>>,
    scanner: OnceLock<Arc<Scanner>>,
    watcher: OnceLock<Arc<Watcher>>,
    propagator: OnceLock<Arc<Propagator>>,
    updater: OnceLock<Arc<Updater>>,
}

impl Default for StorageContext {
    fn default() -> Self {
        Self::new(Arc::new(StorageConfig::default()), Arc::new(NoActor))
    }
}

impl std::fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageContext")
            .field("config", &self.config)
            .field("availability", &self.availability)
            .finish_non_exhaustive()
    }
}

impl StorageContext {
    pub fn new(config: Arc<StorageConfig>, actor: Arc<dyn ActorContext>) -> Self {
        Self {
            validator: FilenameValidator::new(&config),
            config,
            actor,
            owner: OnceLock::new(),
            availability: Mutex::new(Availability::default()),
            watch_policy: WatchPolicy::Once,
            cache: OnceLock::new(),
            scanner: OnceLock::new(),
            watcher: OnceLock::new(),
            propagator: OnceLock::new(),
            updater: OnceLock::new(),
        }
    }

    /// Context with the given configuration and no authenticated actor.
    pub fn with_config(config: StorageConfig) -> Self {
        Self::new(Arc::new(config), Arc::new(NoActor))
    }

    /// Set the watcher policy used when the watcher is first built.
    pub fn watch_policy(mut self, policy: WatchPolicy) -> Self {
        self.watch_policy = policy;
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<StorageConfig> {
        self.config.clone()
    }

    pub fn actor(&self) -> Arc<dyn ActorContext> {
        self.actor.clone()
    }

    pub fn validator(&self) -> &FilenameValidator {
        &self.validator
    }

    /// Current actor, looked up once per storage instance.
    pub fn owner(&self) -> Option<String> {
        self.owner
            .get_or_init(|| self.actor.current_user())
            .clone()
    }

    pub fn availability(&self) -> Availability {
        *self.availability.lock().unwrap()
    }

    /// Record availability. The timestamp only moves when the state changes.
    pub fn set_availability(&self, available: bool) {
        let mut record = self.availability.lock().unwrap();
        if record.available != available || record.last_checked == 0 {
            record.last_checked = chrono::Utc::now().timestamp();
        }
        record.available = available;
    }

    /// Record availability with an explicit check time.
    pub fn set_availability_at(&self, available: bool, checked_at: i64) {
        *self.availability.lock().unwrap() = Availability {
            available,
            last_checked: checked_at,
        };
    }

    pub fn cache(&self) -> Arc<Cache> {
        self.cache.get_or_init(|| Arc::new(Cache::new())).clone()
    }

    pub fn scanner(&self) -> Arc<Scanner> {
        self.scanner
            .get_or_init(|| Arc::new(Scanner::new(self.cache())))
            .clone()
    }

    pub fn watcher(&self) -> Arc<Watcher> {
        self.watcher
            .get_or_init(|| Arc::new(Watcher::new(self.scanner(), self.watch_policy)))
            .clone()
    }

    pub fn propagator(&self) -> Arc<Propagator> {
        self.propagator
            .get_or_init(|| Arc::new(Propagator::new(self.cache())))
            .clone()
    }

    pub fn updater(&self) -> Arc<Updater> {
        self.updater
            .get_or_init(|| Arc::new(Updater::new(self.scanner(), self.propagator())))
            .clone()
    }
}
