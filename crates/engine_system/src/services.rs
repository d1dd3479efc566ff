//! Service registration and lookup.
//!
//! Services are registered on a mutable [`ServiceRegistry`] during engine
//! initialisation, either as ready instances or as factories with a
//! [`ServiceLifetime`]. [`ServiceRegistry::freeze`] turns it into an immutable
//! [`ServiceLocator`] that is shared with every system through its
//! [`SystemContext`](crate::SystemContext). Once frozen nothing can be added.
//!
//! Each system receives its own scope ([`ServiceLocator::create_scope`]):
//! singletons are shared by all scopes, scoped services are built once per
//! scope, transient ones on every resolve.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// The key a service is registered under: its Rust type, or an explicit name.
#[derive(Debug, Clone)]
pub enum ServiceKey {
    /// Keyed by the registered type.
    Type {
        /// `TypeId` of the registered type.
        id: TypeId,
        /// Type name, for diagnostics only.
        name: &'static str,
    },
    /// Keyed by a stable string name.
    Named(String),
}

impl ServiceKey {
    /// The key for type `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self::Type {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// A name key.
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Type { id: a, .. }, Self::Type { id: b, .. }) => a == b,
            (Self::Named(a), Self::Named(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ServiceKey {}

impl std::hash::Hash for ServiceKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Self::Type { id, .. } => {
                0u8.hash(state);
                id.hash(state);
            }
            Self::Named(name) => {
                1u8.hash(state);
                name.hash(state);
            }
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type { name, .. } => write!(f, "<{name}>"),
            Self::Named(name) => write!(f, "`{name}`"),
        }
    }
}

/// How long a factory-built service lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLifetime {
    /// Built on first resolve, then shared by every scope.
    Singleton,
    /// Built once per scope, i.e. once per system.
    Scoped,
    /// Built on every resolve.
    Transient,
}

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Box<dyn Fn(&ServiceLocator) -> Result<Instance, ServiceError> + Send + Sync>;

enum Provider {
    Instance(Instance),
    Factory {
        lifetime: ServiceLifetime,
        build: Factory,
        singleton: OnceLock<Instance>,
    },
}

struct Entry {
    type_name: &'static str,
    provider: Provider,
}

impl Entry {
    fn instance<T: Send + Sync + 'static>(instance: Arc<T>) -> Self {
        Self {
            type_name: type_name::<T>(),
            provider: Provider::Instance(instance),
        }
    }

    fn factory<T, F>(lifetime: ServiceLifetime, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceLocator) -> Result<Arc<T>, ServiceError> + Send + Sync + 'static,
    {
        let build: Factory = Box::new(move |locator| {
            let instance: Instance = factory(locator)?;
            Ok(instance)
        });
        Self {
            type_name: type_name::<T>(),
            provider: Provider::Factory {
                lifetime,
                build,
                singleton: OnceLock::new(),
            },
        }
    }
}

/// Init-phase service registry. Consumed by [`ServiceRegistry::freeze`].
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<ServiceKey, Entry>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, key: ServiceKey, entry: Entry) -> Result<(), ServiceError> {
        if self.services.contains_key(&key) {
            return Err(ServiceError::Duplicate { key });
        }
        self.services.insert(key, entry);
        Ok(())
    }

    /// Register `instance` under its own type.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Duplicate`] if `T` is already registered.
    pub fn register<T: Send + Sync + 'static>(&mut self, instance: Arc<T>) -> Result<(), ServiceError> {
        self.insert(ServiceKey::of::<T>(), Entry::instance(instance))
    }

    /// Register `instance` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Duplicate`] if `name` is already taken.
    pub fn register_named<T: Send + Sync + 'static>(
        &mut self,
        name: impl Into<String>,
        instance: Arc<T>,
    ) -> Result<(), ServiceError> {
        self.insert(ServiceKey::named(name), Entry::instance(instance))
    }

    /// Register a factory for `T`. It receives the resolving scope, so it
    /// can resolve its own dependencies. Factories must not depend on each
    /// other in a cycle.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Duplicate`] if `T` is already registered.
    pub fn register_factory<T, F>(&mut self, lifetime: ServiceLifetime, factory: F) -> Result<(), ServiceError>
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceLocator) -> Result<Arc<T>, ServiceError> + Send + Sync + 'static,
    {
        self.insert(ServiceKey::of::<T>(), Entry::factory(lifetime, factory))
    }

    /// Register a factory under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Duplicate`] if `name` is already taken.
    pub fn register_named_factory<T, F>(
        &mut self,
        name: impl Into<String>,
        lifetime: ServiceLifetime,
        factory: F,
    ) -> Result<(), ServiceError>
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceLocator) -> Result<Arc<T>, ServiceError> + Send + Sync + 'static,
    {
        self.insert(ServiceKey::named(name), Entry::factory(lifetime, factory))
    }

    /// Whether `key` has been registered.
    #[must_use]
    pub fn contains(&self, key: &ServiceKey) -> bool {
        self.services.contains_key(key)
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// End the registration phase. The result is the root scope.
    #[must_use]
    pub fn freeze(self) -> ServiceLocator {
        ServiceLocator {
            catalog: Arc::new(Catalog {
                services: self.services,
            }),
            scoped: Mutex::default(),
        }
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.services.keys()).finish()
    }
}

#[derive(Default)]
struct Catalog {
    services: HashMap<ServiceKey, Entry>,
}

/// Service lookup for one scope, shared across threads behind an [`Arc`].
///
/// The set of services is fixed at [`ServiceRegistry::freeze`]; only the
/// lazily built instances change.
#[derive(Default)]
pub struct ServiceLocator {
    catalog: Arc<Catalog>,
    /// Instances of scoped services built in this scope.
    scoped: Mutex<HashMap<ServiceKey, Instance>>,
}

impl ServiceLocator {
    /// A new scope over the same services. Singletons are shared with this
    /// locator; scoped services are not.
    #[must_use]
    pub fn create_scope(&self) -> Self {
        Self {
            catalog: Arc::clone(&self.catalog),
            scoped: Mutex::default(),
        }
    }

    fn provide(&self, key: &ServiceKey, entry: &Entry) -> Result<Instance, ServiceError> {
        match &entry.provider {
            Provider::Instance(instance) => Ok(Arc::clone(instance)),
            Provider::Factory {
                lifetime: ServiceLifetime::Singleton,
                build,
                singleton,
            } => {
                if let Some(instance) = singleton.get() {
                    return Ok(Arc::clone(instance));
                }
                // Built without holding a lock; a concurrent loser is discarded.
                let built = build(self)?;
                Ok(Arc::clone(singleton.get_or_init(|| built)))
            }
            Provider::Factory {
                lifetime: ServiceLifetime::Scoped,
                build,
                ..
            } => {
                if let Some(instance) = self.scoped.lock().get(key) {
                    return Ok(Arc::clone(instance));
                }
                let built = build(self)?;
                Ok(Arc::clone(self.scoped.lock().entry(key.clone()).or_insert(built)))
            }
            Provider::Factory {
                lifetime: ServiceLifetime::Transient,
                build,
                ..
            } => build(self),
        }
    }

    fn lookup<T: Send + Sync + 'static>(&self, key: ServiceKey) -> Result<Arc<T>, ServiceError> {
        let Some(entry) = self.catalog.services.get(&key) else {
            return Err(ServiceError::NotFound { key });
        };
        self.provide(&key, entry)?
            .downcast::<T>()
            .map_err(|_| ServiceError::TypeMismatch {
                key,
                registered: entry.type_name,
                requested: type_name::<T>(),
            })
    }

    /// Resolve the service registered under type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if `T` was never registered.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ServiceError> {
        self.lookup(ServiceKey::of::<T>())
    }

    /// Resolve the service registered under `name`, expecting type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if `name` was never registered, or
    /// [`ServiceError::TypeMismatch`] if it holds a different type.
    pub fn resolve_named<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, ServiceError> {
        self.lookup(ServiceKey::named(name))
    }

    /// Whether `key` is registered.
    #[must_use]
    pub fn contains(&self, key: &ServiceKey) -> bool {
        self.catalog.services.contains_key(key)
    }

    /// The lifetime `key` was registered with, or `None` for a ready
    /// instance or an unknown key.
    #[must_use]
    pub fn lifetime(&self, key: &ServiceKey) -> Option<ServiceLifetime> {
        match self.catalog.services.get(key)?.provider {
            Provider::Factory { lifetime, .. } => Some(lifetime),
            Provider::Instance(_) => None,
        }
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.catalog.services.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.catalog.services.is_empty()
    }

    /// All registered keys, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &ServiceKey> {
        self.catalog.services.keys()
    }
}

impl fmt::Debug for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceLocator")
            .field("services", &self.catalog.services.len())
            .field("scoped_instances", &self.scoped.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[derive(Debug, PartialEq)]
    struct AudioDevice {
        sample_rate: u32,
    }

    #[derive(Debug)]
    struct Clock;

    #[test]
    fn test_resolve_by_type() {
        let mut registry = ServiceRegistry::new();
        registry
            .register(Arc::new(AudioDevice { sample_rate: 48_000 }))
            .unwrap();
        let locator = registry.freeze();

        let device = locator.resolve::<AudioDevice>().unwrap();
        assert_eq!(device.sample_rate, 48_000);
    }

    #[test]
    fn test_resolve_missing_is_not_found() {
        let locator = ServiceRegistry::new().freeze();
        let err = locator.resolve::<Clock>().unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
        assert!(err.to_string().contains("Clock"));
    }

    #[test]
    fn test_named_type_mismatch() {
        let mut registry = ServiceRegistry::new();
        registry.register_named("clock", Arc::new(Clock)).unwrap();
        let locator = registry.freeze();

        assert!(locator.resolve_named::<Clock>("clock").is_ok());
        let err = locator.resolve_named::<AudioDevice>("clock").unwrap_err();
        assert!(matches!(err, ServiceError::TypeMismatch { .. }));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.register(Arc::new(Clock)).unwrap();
        let err = registry.register(Arc::new(Clock)).unwrap_err();
        assert!(matches!(err, ServiceError::Duplicate { .. }));

        registry.register_named("clock", Arc::new(Clock)).unwrap();
        assert!(registry.register_named("clock", Arc::new(Clock)).is_err());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_type_and_name_keys_do_not_collide() {
        let mut registry = ServiceRegistry::new();
        registry.register(Arc::new(Clock)).unwrap();
        registry.register_named(type_name::<Clock>(), Arc::new(Clock)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_singleton_factory_built_once_across_scopes() {
        let built = Arc::new(AtomicUsize::new(0));
        let mut registry = ServiceRegistry::new();
        {
            let built = Arc::clone(&built);
            registry
                .register_factory(ServiceLifetime::Singleton, move |_| {
                    built.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(AudioDevice { sample_rate: 48_000 }))
                })
                .unwrap();
        }
        let root = registry.freeze();
        let scope = root.create_scope();

        let first = root.resolve::<AudioDevice>().unwrap();
        let second = scope.resolve::<AudioDevice>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(
            root.lifetime(&ServiceKey::of::<AudioDevice>()),
            Some(ServiceLifetime::Singleton)
        );
    }

    #[test]
    fn test_scoped_factory_one_instance_per_scope() {
        let mut registry = ServiceRegistry::new();
        registry
            .register_factory(ServiceLifetime::Scoped, |_| Ok(Arc::new(Mutex::new(Vec::<u32>::new()))))
            .unwrap();
        let root = registry.freeze();
        let physics = root.create_scope();
        let audio = root.create_scope();

        let a = physics.resolve::<Mutex<Vec<u32>>>().unwrap();
        let b = physics.resolve::<Mutex<Vec<u32>>>().unwrap();
        let c = audio.resolve::<Mutex<Vec<u32>>>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_transient_factory_builds_every_time() {
        let mut registry = ServiceRegistry::new();
        registry
            .register_named_factory("scratch", ServiceLifetime::Transient, |_| Ok(Arc::new(Clock)))
            .unwrap();
        let locator = registry.freeze();

        let a = locator.resolve_named::<Clock>("scratch").unwrap();
        let b = locator.resolve_named::<Clock>("scratch").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(locator.resolve_named::<AudioDevice>("scratch").is_err());
    }

    #[test]
    fn test_factory_resolves_its_dependencies() {
        struct Mixer {
            device: Arc<AudioDevice>,
        }

        let mut registry = ServiceRegistry::new();
        registry
            .register(Arc::new(AudioDevice { sample_rate: 22_050 }))
            .unwrap();
        registry
            .register_factory(ServiceLifetime::Singleton, |services| {
                Ok(Arc::new(Mixer {
                    device: services.resolve::<AudioDevice>()?,
                }))
            })
            .unwrap();
        registry
            .register_factory(ServiceLifetime::Scoped, |services| {
                services.resolve::<Clock>().map(|_| Arc::new(0u64))
            })
            .unwrap();
        let locator = registry.freeze();

        assert_eq!(locator.resolve::<Mixer>().unwrap().device.sample_rate, 22_050);
        // A factory's own lookup failure comes back to the caller.
        let err = locator.resolve::<u64>().unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
        assert!(err.to_string().contains("Clock"));
    }

    #[test]
    fn test_concurrent_lookups_after_freeze() {
        let mut registry = ServiceRegistry::new();
        registry
            .register(Arc::new(AudioDevice { sample_rate: 44_100 }))
            .unwrap();
        let locator = Arc::new(registry.freeze());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locator = Arc::clone(&locator);
                thread::spawn(move || locator.resolve::<AudioDevice>().unwrap().sample_rate)
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 44_100);
        }
    }
}
