//! Binding container backed by a [`dill`] catalog.
//!
//! A [`Container`] maps a [`ServiceKey`] (a Rust type, sized or not) to a binding. Every
//! binding is registered into a dill [`Catalog`] as a value: an `Arc<T>` for instances, a
//! [`Transient`] factory for transient services. Three lifetimes are supported:
//!
//! - `Singleton`: a constructed instance, shared by every resolution.
//! - `Transient`: built on every resolution.
//! - `Request`: never built by the container; the instance lives in the [`RequestScope`]
//!   of the request being served.
//!
//! Bindings are installed through a [`Binder`], usually from a [`Module`]. Once a binder is
//! done the catalog is rebuilt from the ordered binding list and swapped in, so a key bound
//! again replaces the previous binding instead of making the catalog ambiguous.

use crate::error::ResolveError;
use dill::{Catalog, CatalogBuilder};
use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Type-erased instance. The payload is always an `Arc<T>` for the bound `T`, which keeps
/// unsized services such as `dyn Trait` resolvable.
pub type AnyArc = Arc<dyn Any + Send + Sync>;

type Register = Arc<dyn Fn(&mut CatalogBuilder) + Send + Sync>;
type ErasedGet = fn(&Container, Option<&RequestScope>) -> Result<AnyArc, ResolveError>;
type Factory<T> = dyn Fn(&Container) -> Result<Arc<T>, ResolveError> + Send + Sync;

#[derive(Clone, Copy)]
pub struct ServiceKey {
    id: TypeId,
    name: &'static str,
    get: ErasedGet,
}

impl ServiceKey {
    pub fn of<T: ?Sized + Send + Sync + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
            get: erased_get::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceKey").field(&self.name).finish()
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

fn erased_get<T: ?Sized + Send + Sync + 'static>(
    container: &Container,
    scope: Option<&RequestScope>,
) -> Result<AnyArc, ResolveError> {
    container
        .get_scoped::<T>(scope)
        .map(|instance| Arc::new(instance) as AnyArc)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    Singleton,
    Transient,
    Request,
}

/// Catalog value for a transient binding: the factory, run on every resolution.
struct Transient<T: ?Sized>(Arc<Factory<T>>);

impl<T: ?Sized> Clone for Transient<T> {
    fn clone(&self) -> Self {
        Transient(Arc::clone(&self.0))
    }
}

#[derive(Clone)]
struct Entry {
    key: ServiceKey,
    lifetime: Lifetime,
    register: Register,
}

impl Entry {
    fn value<T: ?Sized + Send + Sync + 'static>(lifetime: Lifetime, value: Arc<T>) -> Self {
        Self {
            key: ServiceKey::of::<T>(),
            lifetime,
            register: Arc::new(move |builder| {
                builder.add_value(Arc::clone(&value));
            }),
        }
    }
}

/// Ordered bindings a catalog is built from.
#[derive(Clone, Default)]
struct Entries(Vec<Entry>);

impl Entries {
    /// Add `entry`, dropping an earlier one for the same key. Returns whether one was dropped.
    fn put(&mut self, entry: Entry) -> bool {
        let before = self.0.len();
        self.0.retain(|existing| existing.key != entry.key);
        let replaced = self.0.len() != before;
        self.0.push(entry);
        replaced
    }

    fn lifetime(&self, key: &ServiceKey) -> Option<Lifetime> {
        self.0
            .iter()
            .find(|entry| entry.key == *key)
            .map(|entry| entry.lifetime)
    }

    fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().map(|entry| entry.key.name())
    }

    fn catalog(&self) -> Catalog {
        let mut builder = CatalogBuilder::new();
        for entry in &self.0 {
            (entry.register)(&mut builder);
        }
        builder.build()
    }
}

struct State {
    entries: Entries,
    catalog: Catalog,
}

impl Default for State {
    fn default() -> Self {
        let entries = Entries::default();
        let catalog = entries.catalog();
        Self { entries, catalog }
    }
}

fn catalog_error(key: &ServiceKey, err: impl fmt::Debug) -> ResolveError {
    ResolveError::Provider {
        service: key.name(),
        message: format!("{:?}", err),
    }
}

/// Per-request instances for request-scoped bindings, held in their own catalog.
///
/// Cloning shares the same instances. The request pipeline clears the scope once the
/// response is produced.
#[derive(Clone, Default)]
pub struct RequestScope {
    state: Arc<RwLock<State>>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: ?Sized + Send + Sync + 'static>(self, value: Arc<T>) -> Self {
        self.insert(value);
        self
    }

    pub fn insert<T: ?Sized + Send + Sync + 'static>(&self, value: Arc<T>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.entries.put(Entry::value(Lifetime::Request, value));
        state.catalog = state.entries.catalog();
    }

    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let catalog = self.catalog();
        catalog
            .get_one::<Arc<T>>()
            .ok()
            .map(|instance| Arc::clone(&*instance))
    }

    /// Drop every instance held for the request.
    pub fn clear(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = State::default();
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .0
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn catalog(&self) -> Catalog {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .catalog
            .clone()
    }
}

impl fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_set().entries(state.entries.names()).finish()
    }
}

#[derive(Default)]
pub struct Container {
    state: RwLock<State>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bindings added through the returned binder take effect when it is dropped.
    pub fn binder(&self) -> Binder<'_> {
        Binder {
            container: self,
            pending: Vec::new(),
        }
    }

    /// Apply every binding of `module` to this container.
    pub fn install<M: Module + ?Sized>(&self, module: &M) {
        self.binder().install(module);
    }

    pub fn is_bound(&self, key: &ServiceKey) -> bool {
        self.lifetime(key).is_some()
    }

    pub fn lifetime(&self, key: &ServiceKey) -> Option<Lifetime> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .lifetime(key)
    }

    /// Snapshot of the current catalog.
    pub fn catalog(&self) -> Catalog {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .catalog
            .clone()
    }

    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolveError> {
        self.get_scoped(None)
    }

    /// Resolve `T`. The state lock is released before a transient factory runs, so factories
    /// may resolve their own dependencies from the same container.
    pub fn get_scoped<T: ?Sized + Send + Sync + 'static>(
        &self,
        scope: Option<&RequestScope>,
    ) -> Result<Arc<T>, ResolveError> {
        let key = ServiceKey::of::<T>();
        let (lifetime, catalog) = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            (state.entries.lifetime(&key), state.catalog.clone())
        };

        match lifetime.ok_or(ResolveError::Unbound(key.name()))? {
            Lifetime::Request => scope
                .and_then(|scope| scope.get::<T>())
                .ok_or(ResolveError::NotInScope(key.name())),
            Lifetime::Singleton => catalog
                .get_one::<Arc<T>>()
                .map(|instance| Arc::clone(&*instance))
                .map_err(|err| catalog_error(&key, err)),
            Lifetime::Transient => {
                let factory = catalog
                    .get_one::<Transient<T>>()
                    .map_err(|err| catalog_error(&key, err))?;
                (factory.0)(self)
            }
        }
    }

    /// Resolve `key` to its type-erased instance.
    pub fn get_any(
        &self,
        key: &ServiceKey,
        scope: Option<&RequestScope>,
    ) -> Result<AnyArc, ResolveError> {
        (key.get)(self, scope)
    }

    fn commit(&self, pending: Vec<Entry>) {
        if pending.is_empty() {
            return;
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for entry in pending {
            let (service, lifetime) = (entry.key.name(), entry.lifetime);
            let replaced = state.entries.put(entry);
            debug!(service, ?lifetime, replaced, "binding installed");
        }
        state.catalog = state.entries.catalog();
        debug!(bindings = state.entries.0.len(), "catalog rebuilt");
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Container")
            .field("bindings", &state.entries.0.len())
            .finish()
    }
}

/// Write handle used by modules to add bindings. Its bindings are committed together when
/// it is dropped.
pub struct Binder<'a> {
    container: &'a Container,
    pending: Vec<Entry>,
}

impl Binder<'_> {
    /// Bind an already constructed singleton.
    pub fn bind_instance<T: ?Sized + Send + Sync + 'static>(&mut self, instance: Arc<T>) -> &mut Self {
        self.pending.push(Entry::value(Lifetime::Singleton, instance));
        self
    }

    /// Bind a factory invoked on every resolution.
    pub fn bind_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Container) -> Result<Arc<T>, ResolveError> + Send + Sync + 'static,
    {
        let transient: Transient<T> = Transient(Arc::new(factory));
        self.pending.push(Entry {
            key: ServiceKey::of::<T>(),
            lifetime: Lifetime::Transient,
            register: Arc::new(move |builder| {
                builder.add_value(transient.clone());
            }),
        });
        self
    }

    /// Declare `T` as supplied by the request pipeline through a [`RequestScope`].
    pub fn bind_request_scoped<T: ?Sized + Send + Sync + 'static>(&mut self) -> &mut Self {
        self.pending.push(Entry {
            key: ServiceKey::of::<T>(),
            lifetime: Lifetime::Request,
            register: Arc::new(|_| {}),
        });
        self
    }

    pub fn install<M: Module + ?Sized>(&mut self, module: &M) -> &mut Self {
        module.configure(self);
        self
    }
}

impl Drop for Binder<'_> {
    fn drop(&mut self) {
        self.container.commit(mem::take(&mut self.pending));
    }
}

/// A batch of bindings installed together.
pub trait Module: Send + Sync {
    fn configure(&self, binder: &mut Binder<'_>);
}

impl<F> Module for F
where
    F: Fn(&mut Binder<'_>) + Send + Sync,
{
    fn configure(&self, binder: &mut Binder<'_>) {
        self(binder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".to_string()
        }
    }

    struct French;

    impl Greeter for French {
        fn greet(&self) -> String {
            "bonjour".to_string()
        }
    }

    #[test]
    fn test_unbound_service() {
        let container = Container::new();
        let err = container.get::<String>().unwrap_err();
        assert!(matches!(err, ResolveError::Unbound(name) if name.contains("String")));
    }

    #[test]
    fn test_instance_is_shared() {
        let container = Container::new();
        container
            .binder()
            .bind_instance(Arc::new("shared".to_string()));

        let first = container.get::<String>().unwrap();
        let second = container.get::<String>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(container.lifetime(&ServiceKey::of::<String>()), Some(Lifetime::Singleton));
    }

    #[test]
    fn test_transient_is_built_per_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let container = Container::new();
        container.binder().bind_transient::<Vec<u8>, _>(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(vec![1, 2, 3]))
        });

        let first = container.get::<Vec<u8>>().unwrap();
        let second = container.get::<Vec<u8>>().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_trait_object_binding() {
        let container = Container::new();
        container
            .binder()
            .bind_instance::<dyn Greeter>(Arc::new(English));

        assert_eq!(container.get::<dyn Greeter>().unwrap().greet(), "hello");
    }

    #[test]
    fn test_later_module_wins() {
        let container = Container::new();
        let english = |binder: &mut Binder<'_>| {
            binder.bind_instance::<dyn Greeter>(Arc::new(English));
        };
        let french = |binder: &mut Binder<'_>| {
            binder.bind_instance::<dyn Greeter>(Arc::new(French));
        };

        container.install(&english);
        container.install(&french);

        assert_eq!(container.get::<dyn Greeter>().unwrap().greet(), "bonjour");
    }

    #[test]
    fn test_rebinding_within_one_binder() {
        let container = Container::new();
        container
            .binder()
            .bind_instance::<dyn Greeter>(Arc::new(English))
            .bind_instance::<dyn Greeter>(Arc::new(French));

        assert_eq!(container.get::<dyn Greeter>().unwrap().greet(), "bonjour");
    }

    #[test]
    fn test_bindings_apply_when_binder_drops() {
        let container = Container::new();
        let key = ServiceKey::of::<u32>();
        {
            let mut binder = container.binder();
            binder.bind_instance(Arc::new(1u32));
            assert!(!container.is_bound(&key));
        }
        assert!(container.is_bound(&key));
    }

    #[test]
    fn test_transient_resolves_dependencies() {
        let container = Container::new();
        container.binder().bind_instance(Arc::new(21u32));
        container.binder().bind_transient::<u64, _>(|c| {
            let base = c.get::<u32>()?;
            Ok(Arc::new(u64::from(*base) * 2))
        });

        assert_eq!(*container.get::<u64>().unwrap(), 42);
    }

    #[test]
    fn test_request_scoped_lookup() {
        let container = Container::new();
        container.binder().bind_request_scoped::<String>();

        let err = container.get::<String>().unwrap_err();
        assert!(matches!(err, ResolveError::NotInScope(_)));

        let scope = RequestScope::new().with(Arc::new("per-request".to_string()));
        let value = container.get_scoped::<String>(Some(&scope)).unwrap();
        assert_eq!(value.as_str(), "per-request");

        scope.clear();
        assert!(scope.is_empty());
        assert!(matches!(
            container.get_scoped::<String>(Some(&scope)),
            Err(ResolveError::NotInScope(_))
        ));
    }

    #[test]
    fn test_request_scope_replaces_value() {
        let scope = RequestScope::new()
            .with(Arc::new("first".to_string()))
            .with(Arc::new("second".to_string()));
        assert_eq!(scope.len(), 1);
        assert_eq!(scope.get::<String>().unwrap().as_str(), "second");
    }

    #[test]
    fn test_erased_lookup() {
        let container = Container::new();
        container
            .binder()
            .bind_instance::<dyn Greeter>(Arc::new(French));

        let any = container
            .get_any(&ServiceKey::of::<dyn Greeter>(), None)
            .unwrap();
        let greeter = any.downcast_ref::<Arc<dyn Greeter>>().unwrap();
        assert_eq!(greeter.greet(), "bonjour");
    }

    #[test]
    fn test_factory_failure_propagates() {
        let container = Container::new();
        container.binder().bind_transient::<String, _>(|_| {
            Err(ResolveError::Provider {
                service: "String",
                message: "boom".to_string(),
            })
        });

        assert!(matches!(
            container.get::<String>(),
            Err(ResolveError::Provider { .. })
        ));
    }

    #[test]
    fn test_concurrent_resolution() {
        let container = Arc::new(Container::new());
        container
            .binder()
            .bind_instance(Arc::new("value".to_string()));

        let resolved: Vec<Arc<String>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| container.get::<String>().unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let first = &resolved[0];
        assert!(resolved.iter().all(|v| Arc::ptr_eq(v, first)));
    }
}
