//! Scoped services for invocations.
//!
//! Every invocation owns one [`ServiceScope`], opened lazily the first
//! time the function asks for it and disposed when the invocation ends.
//! Singletons are shared by every scope; scoped services are built once
//! per scope from a registered factory.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

/// A shared, type-erased service instance.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

type ScopedFactory = Arc<dyn Fn() -> ServiceInstance + Send + Sync>;

/// Services available to one invocation.
#[async_trait]
pub trait ServiceScope: Send + Sync {
    /// Resolves a service by type id.
    fn resolve(&self, type_id: TypeId) -> Option<ServiceInstance>;

    /// Releases scoped instances.
    async fn dispose(&self);
}

impl dyn ServiceScope {
    /// Resolves a service of type `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resolve(TypeId::of::<T>())
            .and_then(|instance| instance.downcast::<T>().ok())
    }
}

/// Opens new service scopes.
pub trait ScopeFactory: Send + Sync {
    /// Opens a scope exclusively owned by the caller.
    fn create_scope(&self) -> Arc<dyn ServiceScope>;
}

/// Registrations used to build a [`ServiceProvider`].
///
/// ```ignore
/// let provider = ServiceCollection::new()
///     .add_singleton(HttpClient::new())
///     .add_scoped(|| RequestCache::default())
///     .build();
/// ```
#[derive(Default)]
pub struct ServiceCollection {
    singletons: HashMap<TypeId, ServiceInstance>,
    scoped: HashMap<TypeId, ScopedFactory>,
}

impl ServiceCollection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a singleton shared by every scope.
    pub fn add_singleton<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.singletons.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    /// Registers a factory invoked once per scope.
    pub fn add_scoped<T, F>(mut self, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let factory: ScopedFactory = Arc::new(move || Arc::new(factory()) as ServiceInstance);
        self.scoped.insert(TypeId::of::<T>(), factory);
        self
    }

    /// Builds the provider.
    pub fn build(self) -> ServiceProvider {
        ServiceProvider {
            registrations: Arc::new(Registrations {
                singletons: self.singletons,
                scoped: self.scoped,
            }),
        }
    }
}

struct Registrations {
    singletons: HashMap<TypeId, ServiceInstance>,
    scoped: HashMap<TypeId, ScopedFactory>,
}

/// Root provider holding registrations. Cheap to clone.
#[derive(Clone)]
pub struct ServiceProvider {
    registrations: Arc<Registrations>,
}

impl ServiceProvider {
    /// Creates a provider without registrations.
    pub fn empty() -> Self {
        ServiceCollection::new().build()
    }
}

impl Default for ServiceProvider {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("singletons", &self.registrations.singletons.len())
            .field("scoped", &self.registrations.scoped.len())
            .finish()
    }
}

impl ScopeFactory for ServiceProvider {
    fn create_scope(&self) -> Arc<dyn ServiceScope> {
        Arc::new(ProviderScope {
            registrations: Arc::clone(&self.registrations),
            instances: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        })
    }
}

/// Scope opened from a [`ServiceProvider`].
pub struct ProviderScope {
    registrations: Arc<Registrations>,
    instances: Mutex<HashMap<TypeId, ServiceInstance>>,
    disposed: AtomicBool,
}

#[async_trait]
impl ServiceScope for ProviderScope {
    fn resolve(&self, type_id: TypeId) -> Option<ServiceInstance> {
        if let Some(singleton) = self.registrations.singletons.get(&type_id) {
            return Some(Arc::clone(singleton));
        }
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }

        let factory = self.registrations.scoped.get(&type_id)?;
        let mut instances = self.instances.lock();
        let instance = instances.entry(type_id).or_insert_with(|| factory());
        Some(Arc::clone(instance))
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let released = std::mem::take(&mut *self.instances.lock());
        debug!(instances = released.len(), "Service scope disposed");
    }
}
