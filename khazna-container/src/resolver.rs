//! Resolvers: lifetime policy around a construction strategy.
//!
//! A registration lazily builds one resolver. The resolver owns the
//! lifetime state (nothing, a per-scope cache, or a singleton slot) and
//! delegates actual construction to its strategy: constructor matching or
//! a user factory.
//!
//! # Concurrency
//! - Per-scope instances are published with insert-if-absent. A thread
//!   that loses the race disposes its surplus instance and returns the
//!   winner.
//! - Singletons are built under a re-entrant lock. Observers are notified
//!   after the lock is released.

use std::any::TypeId;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use once_cell::sync::OnceCell;
use parking_lot::ReentrantMutex;
use tracing::debug;

use crate::cleanup::{CleanupScope, Dispose};
use crate::constructor::ConstructorSet;
use crate::container::{Container, ContainerInner};
use crate::error::{KhaznaError, Result};
use crate::events::CreationEventKind;
use crate::inject::{Implements, Injectable};
use crate::key::{ContainerKey, TypeKey};
use crate::param::{BoxedValue, Param};
use crate::scope::Lifetime;
use crate::settings::LifespanTracking;

/// Resolves instances of `T` under one lifetime policy.
pub trait Resolve<T: ?Sized>: Send + Sync {
    /// The concrete type this resolver produces.
    fn target(&self) -> TypeKey;

    /// The lifetime policy.
    fn lifetime(&self) -> Lifetime;

    /// Arities of the constructor plans, when constructors are used.
    fn arities(&self) -> Vec<usize> {
        Vec::new()
    }

    /// Produces an instance for `container`.
    ///
    /// `Ok(None)` means no constructor plan binds the supplied
    /// parameters. Every successful call fires exactly one creation event.
    fn try_resolve(
        &self,
        container: &Container,
        tracking: LifespanTracking,
        name: Option<&str>,
        params: &[Param],
    ) -> Result<Option<Arc<T>>>;

    /// Evicts and disposes every cached instance.
    fn release(&self);
}

/// A freshly built instance and its disposal hook.
pub struct Produced<C: ?Sized> {
    pub instance: Arc<C>,
    pub disposer: Option<Arc<dyn Dispose>>,
}

impl<C: ?Sized> Produced<C> {
    fn dispose(&self) {
        if let Some(ref disposer) = self.disposer {
            disposer.dispose();
        }
    }
}

impl<C: ?Sized> Clone for Produced<C> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            disposer: self.disposer.clone(),
        }
    }
}

/// Where a registration lives: its container and that container's scope.
#[derive(Clone)]
pub(crate) struct Site {
    pub(crate) owner: Weak<ContainerInner>,
    pub(crate) key: ContainerKey,
    pub(crate) scope: Weak<CleanupScope>,
}

impl fmt::Debug for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Site").field("key", &self.key).finish()
    }
}

pub(crate) type FactoryFn<C> = Arc<dyn Fn(&Container, &[Param]) -> Result<Produced<C>> + Send + Sync>;

pub(crate) enum Strategy<C> {
    Constructors {
        set: Arc<ConstructorSet<C>>,
        disposer: fn(&Arc<C>) -> Option<Arc<dyn Dispose>>,
    },
    Factory(FactoryFn<C>),
}

type SingletonSlot<C> = ReentrantMutex<RefCell<Option<Produced<C>>>>;

enum LifetimeState<C> {
    PerRequest,
    PerScope(Arc<DashMap<ContainerKey, Produced<C>>>),
    Singleton(Arc<SingletonSlot<C>>),
}

type Outcome<C> = Option<(Arc<C>, CreationEventKind)>;

/// Resolver for requested type `T` built from concrete type `C`.
pub(crate) struct Resolver<T: ?Sized, C> {
    strategy: Strategy<C>,
    state: LifetimeState<C>,
    site: Site,
    _requested: PhantomData<fn() -> Box<T>>,
}

impl<T, C> Resolver<T, C>
where
    T: ?Sized + Send + Sync + 'static,
    C: Implements<T>,
{
    pub(crate) fn new(strategy: Strategy<C>, lifetime: Lifetime, site: Site) -> Self {
        let state = match lifetime {
            Lifetime::PerRequest => LifetimeState::PerRequest,
            Lifetime::PerScope => LifetimeState::PerScope(Arc::new(DashMap::new())),
            Lifetime::Singleton => {
                LifetimeState::Singleton(Arc::new(ReentrantMutex::new(RefCell::new(None))))
            }
        };
        debug!(
            service = %TypeKey::of::<T>(),
            target_type = %TypeKey::of::<C>(),
            lifetime = %lifetime,
            "Resolver built"
        );
        Self {
            strategy,
            state,
            site,
            _requested: PhantomData,
        }
    }

    fn produce(&self, container: &Container, params: &[Param]) -> Result<Option<Produced<C>>> {
        match &self.strategy {
            Strategy::Constructors { set, disposer } => {
                Ok(set.construct(container, params)?.map(|value| {
                    let instance = Arc::new(value);
                    let disposer = disposer(&instance);
                    Produced { instance, disposer }
                }))
            }
            Strategy::Factory(factory) => factory(container, params).map(Some),
        }
    }

    fn per_request(
        &self,
        container: &Container,
        tracking: LifespanTracking,
        params: &[Param],
    ) -> Result<Outcome<C>> {
        let Some(produced) = self.produce(container, params)? else {
            return Ok(None);
        };

        // The container is never queued for disposal in its own scope.
        let is_container = TypeId::of::<C>() == TypeId::of::<Container>();
        if let Some(disposer) = produced.disposer {
            if tracking == LifespanTracking::Automatic && !is_container {
                container.scope().add_disposable(disposer);
            }
        }

        Ok(Some((produced.instance, CreationEventKind::Created)))
    }

    fn per_scope(
        &self,
        cache: &Arc<DashMap<ContainerKey, Produced<C>>>,
        container: &Container,
        params: &[Param],
    ) -> Result<Outcome<C>> {
        let key = container.key();

        let cached = cache.get(&key).map(|entry| entry.instance.clone());
        if let Some(instance) = cached {
            return Ok(Some((instance, CreationEventKind::Reissued)));
        }

        let Some(produced) = self.produce(container, params)? else {
            return Ok(None);
        };

        let published = match cache.entry(key) {
            Entry::Occupied(existing) => Err(existing.get().instance.clone()),
            Entry::Vacant(slot) => {
                slot.insert(produced.clone());
                Ok(produced.instance.clone())
            }
        };

        match published {
            Ok(instance) => {
                let cache = Arc::clone(cache);
                container.scope().add_action(move || {
                    if let Some((_, evicted)) = cache.remove(&key) {
                        evicted.dispose();
                    }
                });
                debug!(
                    target_type = %TypeKey::of::<C>(),
                    container = %key,
                    "Per-scope instance created"
                );
                Ok(Some((instance, CreationEventKind::Created)))
            }
            Err(winner) => {
                debug!(
                    target_type = %TypeKey::of::<C>(),
                    container = %key,
                    "Lost per-scope publication race, disposing surplus instance"
                );
                produced.dispose();
                Ok(Some((winner, CreationEventKind::Reissued)))
            }
        }
    }

    fn singleton(
        &self,
        slot: &Arc<SingletonSlot<C>>,
        container: &Container,
        params: &[Param],
    ) -> Result<Outcome<C>> {
        let guard = slot.lock();

        let existing = guard.borrow().as_ref().map(|p| p.instance.clone());
        if let Some(instance) = existing {
            return Ok(Some((instance, CreationEventKind::Reissued)));
        }

        let Some(produced) = self.produce(container, params)? else {
            return Ok(None);
        };

        let Some(scope) = self.site.scope.upgrade() else {
            produced.dispose();
            return Err(KhaznaError::ContainerReleased {
                registered: TypeKey::of::<T>(),
            });
        };

        let instance = produced.instance.clone();
        *guard.borrow_mut() = Some(produced);
        drop(guard);

        // Released when the defining container's scope is disposed.
        let weak = Arc::downgrade(&instance);
        let slot = Arc::clone(slot);
        scope.add_action(move || {
            let evicted = {
                let guard = slot.lock();
                let mut cell = guard.borrow_mut();
                let ours = cell
                    .as_ref()
                    .is_some_and(|p| std::ptr::eq(Arc::as_ptr(&p.instance), weak.as_ptr()));
                let taken = if ours { cell.take() } else { None };
                taken
            };
            if let Some(produced) = evicted {
                produced.dispose();
            }
        });

        debug!(
            target_type = %TypeKey::of::<C>(),
            defined_in = %self.site.key,
            "Singleton created"
        );
        Ok(Some((instance, CreationEventKind::Created)))
    }
}

impl<T, C> Resolve<T> for Resolver<T, C>
where
    T: ?Sized + Send + Sync + 'static,
    C: Implements<T>,
{
    fn target(&self) -> TypeKey {
        TypeKey::of::<C>()
    }

    fn lifetime(&self) -> Lifetime {
        match self.state {
            LifetimeState::PerRequest => Lifetime::PerRequest,
            LifetimeState::PerScope(_) => Lifetime::PerScope,
            LifetimeState::Singleton(_) => Lifetime::Singleton,
        }
    }

    fn arities(&self) -> Vec<usize> {
        match &self.strategy {
            Strategy::Constructors { set, .. } => set.arities(),
            Strategy::Factory(_) => Vec::new(),
        }
    }

    fn try_resolve(
        &self,
        container: &Container,
        tracking: LifespanTracking,
        name: Option<&str>,
        params: &[Param],
    ) -> Result<Option<Arc<T>>> {
        let outcome = match &self.state {
            LifetimeState::PerRequest => self.per_request(container, tracking, params)?,
            LifetimeState::PerScope(cache) => self.per_scope(cache, container, params)?,
            LifetimeState::Singleton(slot) => self.singleton(slot, container, params)?,
        };

        let Some((instance, kind)) = outcome else {
            return Ok(None);
        };

        let instance: Arc<T> = instance.upcast();
        container.notify_creation(&instance, TypeKey::of::<C>(), name, kind);
        Ok(Some(instance))
    }

    fn release(&self) {
        match &self.state {
            LifetimeState::PerRequest => {}
            LifetimeState::PerScope(cache) => {
                let keys: Vec<ContainerKey> = cache.iter().map(|entry| *entry.key()).collect();
                for key in keys {
                    if let Some((_, evicted)) = cache.remove(&key) {
                        evicted.dispose();
                    }
                }
            }
            LifetimeState::Singleton(slot) => {
                let evicted = slot.lock().borrow_mut().take();
                if let Some(produced) = evicted {
                    produced.dispose();
                }
            }
        }
    }
}

// ═══════════════════════════════════════════
// Implementation recipes
// ═══════════════════════════════════════════

pub(crate) type Recipe<T> = Box<dyn Fn(Lifetime, &Site) -> Arc<dyn Resolve<T>> + Send + Sync>;

/// How to build instances of `T`: a concrete type's constructors or a
/// factory.
///
/// Used by lazy registrations, auto-implementation providers and
/// open-generic closing, all of which pick an implementation at runtime.
pub struct Implementation<T: ?Sized> {
    target: TypeKey,
    recipe: Result<Recipe<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> Implementation<T> {
    /// Construct `C` through its constructor plans.
    pub fn of<C: Injectable + Implements<T>>() -> Self {
        Self::with_params::<C>(Vec::new())
    }

    /// Construct `C`, binding `defaults` as registration-time defaults.
    pub fn with_params<C: Injectable + Implements<T>>(defaults: Vec<Param>) -> Self {
        let recipe = ConstructorSet::<C>::for_injectable(&defaults).map(|set| {
            let set = Arc::new(set);
            Box::new(move |lifetime: Lifetime, site: &Site| {
                let strategy = Strategy::Constructors {
                    set: set.clone(),
                    disposer: C::disposer,
                };
                Arc::new(Resolver::<T, C>::new(strategy, lifetime, site.clone())) as Arc<dyn Resolve<T>>
            }) as Recipe<T>
        });
        Self {
            target: TypeKey::of::<C>(),
            recipe,
        }
    }

    /// Construct through a factory function.
    pub fn factory<C, F>(factory: F) -> Self
    where
        C: Implements<T>,
        F: Fn(&Container, &[Param]) -> Result<C> + Send + Sync + 'static,
    {
        let factory: FactoryFn<C> = Arc::new(move |container: &Container, params: &[Param]| {
            factory(container, params).map(|value| Produced {
                instance: Arc::new(value),
                disposer: None,
            })
        });
        Self::from_factory(factory)
    }

    /// Construct through a factory whose instances need disposal.
    pub fn disposable_factory<C, F>(factory: F) -> Self
    where
        C: Implements<T> + Dispose,
        F: Fn(&Container, &[Param]) -> Result<C> + Send + Sync + 'static,
    {
        let factory: FactoryFn<C> = Arc::new(move |container: &Container, params: &[Param]| {
            factory(container, params).map(|value| {
                let instance = Arc::new(value);
                Produced {
                    disposer: Some(instance.clone() as Arc<dyn Dispose>),
                    instance,
                }
            })
        });
        Self::from_factory(factory)
    }

    fn from_factory<C: Implements<T>>(factory: FactoryFn<C>) -> Self {
        let recipe: Recipe<T> = Box::new(move |lifetime: Lifetime, site: &Site| {
            Arc::new(Resolver::<T, C>::new(
                Strategy::Factory(factory.clone()),
                lifetime,
                site.clone(),
            )) as Arc<dyn Resolve<T>>
        });
        Self {
            target: TypeKey::of::<C>(),
            recipe: Ok(recipe),
        }
    }

    /// The concrete type this implementation produces.
    pub fn target(&self) -> TypeKey {
        self.target
    }

    pub(crate) fn into_recipe(self) -> Result<Recipe<T>> {
        self.recipe
    }
}

impl<T: ?Sized> fmt::Debug for Implementation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Implementation")
            .field("target", &self.target)
            .field("valid", &self.recipe.is_ok())
            .finish()
    }
}

// ═══════════════════════════════════════════
// LazyResolver
// ═══════════════════════════════════════════

pub(crate) type Selector<T> = Arc<dyn Fn(&Container) -> Result<Implementation<T>> + Send + Sync>;

/// Defers the choice of implementation until the first resolution.
pub(crate) struct LazyResolver<T: ?Sized> {
    selector: Selector<T>,
    lifetime: Lifetime,
    site: Site,
    inner: OnceCell<Arc<dyn Resolve<T>>>,
}

impl<T: ?Sized + Send + Sync + 'static> LazyResolver<T> {
    pub(crate) fn new(selector: Selector<T>, lifetime: Lifetime, site: Site) -> Self {
        Self {
            selector,
            lifetime,
            site,
            inner: OnceCell::new(),
        }
    }

    fn inner(&self, container: &Container) -> Result<&Arc<dyn Resolve<T>>> {
        self.inner.get_or_try_init(|| {
            let implementation = (self.selector)(container)?;
            debug!(
                service = %TypeKey::of::<T>(),
                target_type = %implementation.target(),
                "Lazy registration selected its implementation"
            );
            let recipe = implementation.into_recipe()?;
            Ok::<_, KhaznaError>(recipe(self.lifetime, &self.site))
        })
    }
}

impl<T: ?Sized + Send + Sync + 'static> Resolve<T> for LazyResolver<T> {
    fn target(&self) -> TypeKey {
        self.inner
            .get()
            .map_or_else(TypeKey::of::<T>, |inner| inner.target())
    }

    fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    fn arities(&self) -> Vec<usize> {
        self.inner.get().map(|inner| inner.arities()).unwrap_or_default()
    }

    fn try_resolve(
        &self,
        container: &Container,
        tracking: LifespanTracking,
        name: Option<&str>,
        params: &[Param],
    ) -> Result<Option<Arc<T>>> {
        self.inner(container)?
            .try_resolve(container, tracking, name, params)
    }

    fn release(&self) {
        if let Some(inner) = self.inner.get() {
            inner.release();
        }
    }
}

// ═══════════════════════════════════════════
// Untyped access
// ═══════════════════════════════════════════

/// Type-erased view of a resolver, for lookups by [`TypeKey`].
pub(crate) trait ResolveAny: Send + Sync {
    fn target(&self) -> TypeKey;

    fn arities(&self) -> Vec<usize>;

    /// Like [`Resolve::try_resolve`]; the value is a boxed `Arc<T>`.
    fn try_resolve_any(
        &self,
        container: &Container,
        tracking: LifespanTracking,
        name: Option<&str>,
        params: &[Param],
    ) -> Result<Option<BoxedValue>>;
}

pub(crate) struct Untyped<T: ?Sized>(pub(crate) Arc<dyn Resolve<T>>);

impl<T: ?Sized + Send + Sync + 'static> ResolveAny for Untyped<T> {
    fn target(&self) -> TypeKey {
        self.0.target()
    }

    fn arities(&self) -> Vec<usize> {
        self.0.arities()
    }

    fn try_resolve_any(
        &self,
        container: &Container,
        tracking: LifespanTracking,
        name: Option<&str>,
        params: &[Param],
    ) -> Result<Option<BoxedValue>> {
        Ok(self
            .0
            .try_resolve(container, tracking, name, params)?
            .map(|instance| Box::new(instance) as BoxedValue))
    }
}
