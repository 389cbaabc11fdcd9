//! Per-type registries and the registrations they hold.
//!
//! A [`TypeRegistry<T>`] belongs to one container and keeps the *current*
//! registration of `T` plus any number of named alternatives. Replacing the
//! current registration is a compare-and-set: it fails loudly when the
//! existing registration disallows specialization, or when another thread
//! replaced it first.
//!
//! # Examples
//! ```
//! use khazna_container::prelude::*;
//! use std::sync::Arc;
//!
//! struct Clock;
//! impl Injectable for Clock {
//!     fn constructors(ctors: &mut Constructors<Self>) {
//!         ctors.nullary(|| Clock);
//!     }
//! }
//!
//! let root = RootContainer::new();
//! root.for_type::<Clock>()
//!     .register::<Clock>()?
//!     .resolve_as_singleton()?
//!     .end()?;
//!
//! let a: Arc<Clock> = root.resolve()?;
//! let b: Arc<Clock> = root.resolve()?;
//! assert!(Arc::ptr_eq(&a, &b));
//! # Ok::<(), KhaznaError>(())
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::cleanup::Dispose;
use crate::container::Container;
use crate::error::{KhaznaError, Result};
use crate::inject::{Implements, Injectable};
use crate::key::{ContainerKey, TypeKey};
use crate::param::Param;
use crate::registry::ContainerRegistry;
use crate::resolver::{Implementation, LazyResolver, Recipe, Resolve, Selector, Site};
use crate::scope::{Lifetime, ScopeBehavior};

// ═══════════════════════════════════════════
// RegistrationState
// ═══════════════════════════════════════════

/// Scope behavior and end-of-configuration flags of one registration.
pub(crate) struct RegistrationState {
    registered: TypeKey,
    behavior: AtomicU32,
    ended: AtomicBool,
    frozen: AtomicBool,
}

impl RegistrationState {
    pub(crate) fn new(registered: TypeKey, behavior: ScopeBehavior) -> Self {
        Self {
            registered,
            behavior: AtomicU32::new(behavior.bits()),
            ended: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
        }
    }

    pub(crate) fn behavior(&self) -> ScopeBehavior {
        ScopeBehavior::from_bits(self.behavior.load(Ordering::Acquire))
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Changes the behavior unless the registration is ended, already in
    /// use, or locked against a different behavior.
    pub(crate) fn update(&self, change: impl Fn(ScopeBehavior) -> ScopeBehavior) -> Result<()> {
        if self.is_ended() || self.frozen.load(Ordering::Acquire) {
            return Err(KhaznaError::RegistrationEnded {
                registered: self.registered,
            });
        }

        let current = self.behavior();
        let next = change(current);
        if current.is_specialization_disallowed() && next != current {
            return Err(KhaznaError::RegistrationLocked {
                registered: self.registered,
            });
        }

        self.behavior.store(next.bits(), Ordering::Release);
        Ok(())
    }

    pub(crate) fn end(&self) -> Result<()> {
        if self.ended.swap(true, Ordering::AcqRel) {
            return Err(KhaznaError::RegistrationEnded {
                registered: self.registered,
            });
        }
        Ok(())
    }

    /// Called when the resolver is built; the lifetime is fixed from here on.
    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }
}

// ═══════════════════════════════════════════
// TypeRegistration
// ═══════════════════════════════════════════

enum Build<T: ?Sized> {
    Recipe(Recipe<T>),
    Lazy(Selector<T>),
}

/// One binding of `T` to a concrete type or factory.
pub(crate) struct TypeRegistration<T: ?Sized> {
    state: RegistrationState,
    target: TypeKey,
    name: Option<String>,
    build: Build<T>,
    resolver: OnceCell<Arc<dyn Resolve<T>>>,
    site: Site,
}

impl<T: ?Sized + Send + Sync + 'static> TypeRegistration<T> {
    fn new(
        target: TypeKey,
        name: Option<String>,
        build: Build<T>,
        behavior: ScopeBehavior,
        site: Site,
    ) -> Self {
        Self {
            state: RegistrationState::new(TypeKey::of::<T>(), behavior),
            target,
            name,
            build,
            resolver: OnceCell::new(),
            site,
        }
    }

    /// Builds the resolver on first use, fixing the lifetime.
    pub(crate) fn resolver(&self) -> Arc<dyn Resolve<T>> {
        self.resolver
            .get_or_init(|| {
                self.state.freeze();
                let lifetime = self.state.behavior().lifetime();
                match self.build {
                    Build::Recipe(ref recipe) => recipe(lifetime, &self.site),
                    Build::Lazy(ref selector) => Arc::new(LazyResolver::new(
                        selector.clone(),
                        lifetime,
                        self.site.clone(),
                    )),
                }
            })
            .clone()
    }

    pub(crate) fn behavior(&self) -> ScopeBehavior {
        self.state.behavior()
    }

    pub(crate) fn owner_key(&self) -> ContainerKey {
        self.site.key
    }

    /// Releases cached instances, if the resolver was ever built.
    pub(crate) fn release(&self) {
        if let Some(resolver) = self.resolver.get() {
            resolver.release();
        }
    }
}

// ═══════════════════════════════════════════
// Registration handle
// ═══════════════════════════════════════════

/// Handle for configuring a registration.
///
/// Scope behavior must be configured before [`end`](Registration::end)
/// is called and before the type is first resolved.
pub struct Registration<T: ?Sized> {
    inner: Arc<TypeRegistration<T>>,
}

impl<T: ?Sized> Clone for Registration<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Registration<T> {
    /// One instance for the lifetime of the defining container.
    pub fn resolve_as_singleton(self) -> Result<Self> {
        self.inner
            .state
            .update(|b| b.with_lifetime(Lifetime::Singleton))?;
        Ok(self)
    }

    /// One instance per resolving container.
    pub fn resolve_an_instance_per_scope(self) -> Result<Self> {
        self.inner
            .state
            .update(|b| b.with_lifetime(Lifetime::PerScope))?;
        Ok(self)
    }

    /// A new instance on every resolution.
    pub fn resolve_an_instance_per_request(self) -> Result<Self> {
        self.inner
            .state
            .update(|b| b.with_lifetime(Lifetime::PerRequest))?;
        Ok(self)
    }

    /// Forbids replacing this registration, here or in child containers.
    pub fn disallow_specialization(self) -> Result<Self> {
        self.inner
            .state
            .update(|b| b | ScopeBehavior::SPECIALIZATION_DISALLOWED)?;
        Ok(self)
    }

    /// Replaces the scope behavior wholesale.
    pub fn with_behavior(self, behavior: ScopeBehavior) -> Result<Self> {
        self.inner.state.update(|_| behavior)?;
        Ok(self)
    }

    /// Ends configuration and returns the owning container.
    ///
    /// # Errors
    /// [`KhaznaError::RegistrationEnded`] when already ended,
    /// [`KhaznaError::ContainerReleased`] when the owner is gone.
    pub fn end(self) -> Result<Container> {
        self.inner.state.end()?;
        debug!(
            service = %TypeKey::of::<T>(),
            target_type = %self.inner.target,
            behavior = %self.inner.state.behavior(),
            "Registration ended"
        );
        self.inner
            .site
            .owner
            .upgrade()
            .map(Container::from_inner)
            .ok_or(KhaznaError::ContainerReleased {
                registered: TypeKey::of::<T>(),
            })
    }

    pub fn behavior(&self) -> ScopeBehavior {
        self.inner.state.behavior()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.state.is_ended()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn registered_type(&self) -> TypeKey {
        TypeKey::of::<T>()
    }

    /// The concrete type; `T` itself for lazy registrations.
    pub fn target_type(&self) -> TypeKey {
        self.inner.target
    }
}

impl<T: ?Sized + Send + Sync + 'static> fmt::Debug for Registration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("registered", &TypeKey::of::<T>())
            .field("target", &self.inner.target)
            .field("name", &self.inner.name)
            .field("behavior", &self.inner.state.behavior())
            .finish()
    }
}

// ═══════════════════════════════════════════
// TypeRegistry
// ═══════════════════════════════════════════

/// Registrations of `T` within one container.
pub struct TypeRegistry<T: ?Sized> {
    site: Site,
    current: RwLock<Option<Arc<TypeRegistration<T>>>>,
    named: DashMap<String, Arc<TypeRegistration<T>>>,
    base: Option<Arc<ContainerRegistry>>,
}

impl<T: ?Sized + Send + Sync + 'static> TypeRegistry<T> {
    pub(crate) fn new(site: Site, base: Option<Arc<ContainerRegistry>>) -> Self {
        Self {
            site,
            current: RwLock::new(None),
            named: DashMap::new(),
            base,
        }
    }

    /// Registers `C`, constructed through its constructor plans.
    pub fn register<C: Injectable + Implements<T>>(&self) -> Result<Registration<T>> {
        self.register_implementation(Implementation::of::<C>())
    }

    /// Registers `C` with registration-time default parameters.
    pub fn register_with_params<C: Injectable + Implements<T>>(
        &self,
        params: Vec<Param>,
    ) -> Result<Registration<T>> {
        self.register_implementation(Implementation::with_params::<C>(params))
    }

    /// Registers a factory function.
    pub fn register_factory<C, F>(&self, factory: F) -> Result<Registration<T>>
    where
        C: Implements<T>,
        F: Fn(&Container, &[Param]) -> Result<C> + Send + Sync + 'static,
    {
        self.register_implementation(Implementation::factory::<C, F>(factory))
    }

    /// Registers a factory whose instances are disposed with their scope.
    pub fn register_disposable_factory<C, F>(&self, factory: F) -> Result<Registration<T>>
    where
        C: Implements<T> + Dispose,
        F: Fn(&Container, &[Param]) -> Result<C> + Send + Sync + 'static,
    {
        self.register_implementation(Implementation::disposable_factory::<C, F>(factory))
    }

    /// Registers a prepared [`Implementation`].
    pub fn register_implementation(&self, implementation: Implementation<T>) -> Result<Registration<T>> {
        self.register_implementation_with(implementation, ScopeBehavior::DEFAULT)
    }

    /// Registers `implementation` with its scope behavior already set, so
    /// no resolution can observe the registration before it is configured.
    pub(crate) fn register_implementation_with(
        &self,
        implementation: Implementation<T>,
        behavior: ScopeBehavior,
    ) -> Result<Registration<T>> {
        let observed = self.observe_specializable()?;
        let target = implementation.target();
        let recipe = implementation.into_recipe()?;
        self.install_current(observed, target, Build::Recipe(recipe), behavior)
    }

    /// Registers a named alternative constructed from `C`.
    ///
    /// Named registrations never conflict: registering a name again
    /// replaces the previous entry.
    pub fn register_with_name<C: Injectable + Implements<T>>(
        &self,
        name: &str,
        params: Vec<Param>,
    ) -> Result<Registration<T>> {
        self.register_named_implementation(name, Implementation::with_params::<C>(params))
    }

    /// Registers a named factory.
    pub fn register_named_factory<C, F>(&self, name: &str, factory: F) -> Result<Registration<T>>
    where
        C: Implements<T>,
        F: Fn(&Container, &[Param]) -> Result<C> + Send + Sync + 'static,
    {
        self.register_named_implementation(name, Implementation::factory::<C, F>(factory))
    }

    pub fn register_named_implementation(
        &self,
        name: &str,
        implementation: Implementation<T>,
    ) -> Result<Registration<T>> {
        let target = implementation.target();
        let recipe = implementation.into_recipe()?;
        let registration = Arc::new(TypeRegistration::new(
            target,
            Some(name.to_string()),
            Build::Recipe(recipe),
            ScopeBehavior::DEFAULT,
            self.site.clone(),
        ));

        let replaced = self.named.insert(name.to_string(), registration.clone());
        if let Some(replaced) = replaced {
            if replaced.owner_key() == self.site.key {
                replaced.release();
            }
            debug!(service = %TypeKey::of::<T>(), name, "Named registration replaced");
        }

        info!(
            service = %TypeKey::of::<T>(),
            target_type = %target,
            name,
            container = %self.site.key,
            "Named registration added"
        );
        Ok(Registration {
            inner: registration,
        })
    }

    /// Defers the choice of implementation until `T` is first resolved.
    pub fn lazy_register<F>(&self, producer: F) -> Result<Registration<T>>
    where
        F: Fn(&Container) -> Result<Implementation<T>> + Send + Sync + 'static,
    {
        let observed = self.observe_specializable()?;
        let selector: Selector<T> = Arc::new(producer);
        self.install_current(
            observed,
            TypeKey::of::<T>(),
            Build::Lazy(selector),
            ScopeBehavior::DEFAULT,
        )
    }

    /// Returns `true` when the current registration may be replaced,
    /// here and in every parent container.
    pub fn can_specialize_registration(&self) -> bool {
        !self.is_locked_here() && !self.is_locked_above()
    }

    pub(crate) fn is_locked_here(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|current| current.behavior().is_specialization_disallowed())
    }

    fn is_locked_above(&self) -> bool {
        self.base.as_ref().is_some_and(|base| base.is_locked::<T>())
    }

    pub fn has_registration(&self) -> bool {
        self.current.read().is_some()
    }

    /// Handle for the current registration.
    pub fn current_registration(&self) -> Option<Registration<T>> {
        let current = self.current.read().clone();
        current.map(|inner| Registration { inner })
    }

    /// Handle for a named registration.
    pub fn named_registration(&self, name: &str) -> Option<Registration<T>> {
        let named = self.named.get(name).map(|entry| entry.value().clone());
        named.map(|inner| Registration { inner })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.named.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolver of the current registration, if it was made in this
    /// container. Inherited entries are answered by the parent chain.
    pub(crate) fn resolver(&self) -> Option<Arc<dyn Resolve<T>>> {
        let current = self.current.read().clone();
        current
            .filter(|registration| registration.owner_key() == self.site.key)
            .map(|registration| registration.resolver())
    }

    pub(crate) fn named_resolver(&self, name: &str) -> Option<Arc<dyn Resolve<T>>> {
        let named = self.named.get(name).map(|entry| entry.value().clone());
        named
            .filter(|registration| registration.owner_key() == self.site.key)
            .map(|registration| registration.resolver())
    }

    /// Independent registry for `site`, seeded with this one's state.
    pub(crate) fn make_copy_for_container(
        &self,
        site: Site,
        base: Option<Arc<ContainerRegistry>>,
    ) -> Self {
        let named = DashMap::new();
        for entry in self.named.iter() {
            named.insert(entry.key().clone(), entry.value().clone());
        }
        Self {
            site,
            current: RwLock::new(self.current.read().clone()),
            named,
            base,
        }
    }

    /// Releases the registrations created by container `key`.
    pub(crate) fn release_owned(&self, key: ContainerKey) {
        let current = self.current.read().clone();
        if let Some(current) = current {
            if current.owner_key() == key {
                current.release();
            }
        }

        let named: Vec<Arc<TypeRegistration<T>>> = self
            .named
            .iter()
            .filter(|entry| entry.value().owner_key() == key)
            .map(|entry| entry.value().clone())
            .collect();
        for registration in named {
            registration.release();
        }
    }

    /// Snapshot of the current registration, taken after checking that
    /// neither it nor any parent's registration of `T` is locked.
    fn observe_specializable(&self) -> Result<Option<Arc<TypeRegistration<T>>>> {
        let observed = self.current.read().clone();
        if let Some(ref existing) = observed {
            if existing.behavior().is_specialization_disallowed() {
                warn!(
                    service = %TypeKey::of::<T>(),
                    existing = %existing.target,
                    container = %self.site.key,
                    "Rejected specialization of a locked registration"
                );
                return Err(KhaznaError::SpecializationDisallowed {
                    registered: TypeKey::of::<T>(),
                });
            }
        }
        if self.is_locked_above() {
            warn!(
                service = %TypeKey::of::<T>(),
                container = %self.site.key,
                "Rejected specialization of a registration locked by a parent"
            );
            return Err(KhaznaError::SpecializationDisallowed {
                registered: TypeKey::of::<T>(),
            });
        }
        Ok(observed)
    }

    fn install_current(
        &self,
        observed: Option<Arc<TypeRegistration<T>>>,
        target: TypeKey,
        build: Build<T>,
        behavior: ScopeBehavior,
    ) -> Result<Registration<T>> {
        let registration = Arc::new(TypeRegistration::new(
            target,
            None,
            build,
            behavior,
            self.site.clone(),
        ));

        {
            let mut current = self.current.write();
            let unchanged = match (current.as_ref(), observed.as_ref()) {
                (Some(now), Some(seen)) => Arc::ptr_eq(now, seen),
                (None, None) => true,
                _ => false,
            };
            if !unchanged {
                drop(current);
                registration.release();
                warn!(
                    service = %TypeKey::of::<T>(),
                    container = %self.site.key,
                    "Lost a concurrent registration race"
                );
                return Err(KhaznaError::ConcurrentRegistration {
                    registered: TypeKey::of::<T>(),
                });
            }
            *current = Some(registration.clone());
        }

        if let Some(replaced) = observed {
            if replaced.owner_key() == self.site.key {
                replaced.release();
            }
            debug!(
                service = %TypeKey::of::<T>(),
                replaced = %replaced.target,
                "Registration specialized"
            );
        }

        info!(
            service = %TypeKey::of::<T>(),
            target_type = %target,
            container = %self.site.key,
            "Registered"
        );
        Ok(Registration {
            inner: registration,
        })
    }
}

impl<T: ?Sized + Send + Sync + 'static> fmt::Debug for TypeRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("registered", &TypeKey::of::<T>())
            .field("container", &self.site.key)
            .field("has_current", &self.has_registration())
            .field("named", &self.names())
            .finish()
    }
}
