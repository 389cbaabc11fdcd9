//! Open generic registrations.
//!
//! Rust has no runtime generic type definitions, so an open definition is
//! stood in for by a marker type wrapped in a [`GenericDefinition`]. A
//! closed service type (for example `dyn Repository<User>`) implements
//! [`GenericService`] to say which definitions it belongs to and how to
//! close a registered target definition over its own type arguments.
//!
//! ```text
//! for_generic(RepositoryDef) ── register(SqlRepositoryDef)
//!                                        │
//! resolve_generic::<dyn Repository<User>>()
//!     └─ definitions()  →  RepositoryDef  →  close(SqlRepositoryDef)
//!                                            └─ SqlRepository<User>
//! ```
//!
//! Closed resolvers are built once per closed type and cached in the
//! open registration.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::container::Container;
use crate::error::{KhaznaError, NoMatchingConstructorError, NotResolvableError, Result};
use crate::key::{ContainerKey, TypeKey};
use crate::param::Param;
use crate::registration::RegistrationState;
use crate::registry::ContainerRegistry;
use crate::resolver::{Implementation, Resolve, Site};
use crate::scope::{Lifetime, ScopeBehavior};
use crate::settings::LifespanTracking;

/// Marker standing for an open generic type definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenericDefinition {
    key: TypeKey,
}

impl GenericDefinition {
    /// The definition represented by marker type `D`.
    pub fn of<D: ?Sized + 'static>() -> Self {
        Self {
            key: TypeKey::of::<D>(),
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }
}

impl fmt::Display for GenericDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<..>", self.key.short_name())
    }
}

/// A target definition closed over a service's type arguments.
pub type ClosedTarget<T> = Implementation<T>;

/// A closed service type that can be produced from open registrations.
pub trait GenericService: Send + Sync + 'static {
    /// Definitions to try, in order: the type's own definition, then the
    /// interfaces it implements, then its bases.
    fn definitions() -> Vec<GenericDefinition>;

    /// Closes the registered `target` definition over this type's
    /// arguments, or `None` if this type cannot be built from it.
    fn close(target: &GenericDefinition) -> Option<ClosedTarget<Self>>;
}

// ═══════════════════════════════════════════
// Closed resolver cache
// ═══════════════════════════════════════════

trait ClosedResolver: Send + Sync {
    fn as_any(&self) -> &(dyn Any + Send + Sync);
    fn release(&self);
}

impl<T: ?Sized + Send + Sync + 'static> ClosedResolver for Arc<dyn Resolve<T>> {
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn release(&self) {
        (**self).release();
    }
}

/// One open registration: `definition` is implemented by `target`.
pub(crate) struct GenericRegistration {
    state: RegistrationState,
    target: GenericDefinition,
    closed: DashMap<TypeId, Box<dyn ClosedResolver>>,
    site: Site,
}

impl GenericRegistration {
    fn cached<T: GenericService + ?Sized>(&self) -> Option<Arc<dyn Resolve<T>>> {
        self.closed
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.as_any().downcast_ref::<Arc<dyn Resolve<T>>>().cloned())
    }

    /// Resolver for the closed type `T`, built on first request.
    ///
    /// `Ok(None)` when `T` cannot be closed from this registration's target.
    pub(crate) fn closed_resolver<T: GenericService + ?Sized>(
        &self,
    ) -> Result<Option<Arc<dyn Resolve<T>>>> {
        if let Some(resolver) = self.cached::<T>() {
            return Ok(Some(resolver));
        }

        let Some(implementation) = T::close(&self.target) else {
            return Ok(None);
        };

        self.state.freeze();
        let recipe = implementation.into_recipe()?;
        let resolver = recipe(self.state.behavior().lifetime(), &self.site);

        self.closed
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(resolver) as Box<dyn ClosedResolver>);

        debug!(
            service = %TypeKey::of::<T>(),
            target = %self.target,
            "Closed generic resolver built"
        );
        Ok(self.cached::<T>())
    }

    fn owner_key(&self) -> ContainerKey {
        self.site.key
    }

    fn release(&self) {
        let resolvers: Vec<TypeId> = self.closed.iter().map(|entry| *entry.key()).collect();
        for id in resolvers {
            if let Some((_, resolver)) = self.closed.remove(&id) {
                resolver.release();
            }
        }
    }
}

/// Handle for configuring an open registration.
#[derive(Clone)]
pub struct OpenRegistration {
    definition: GenericDefinition,
    inner: Arc<GenericRegistration>,
}

impl OpenRegistration {
    pub fn resolve_as_singleton(self) -> Result<Self> {
        self.inner
            .state
            .update(|b| b.with_lifetime(Lifetime::Singleton))?;
        Ok(self)
    }

    pub fn resolve_an_instance_per_scope(self) -> Result<Self> {
        self.inner
            .state
            .update(|b| b.with_lifetime(Lifetime::PerScope))?;
        Ok(self)
    }

    pub fn resolve_an_instance_per_request(self) -> Result<Self> {
        self.inner
            .state
            .update(|b| b.with_lifetime(Lifetime::PerRequest))?;
        Ok(self)
    }

    pub fn disallow_specialization(self) -> Result<Self> {
        self.inner
            .state
            .update(|b| b | ScopeBehavior::SPECIALIZATION_DISALLOWED)?;
        Ok(self)
    }

    /// Ends configuration and returns the owning container.
    pub fn end(self) -> Result<Container> {
        self.inner.state.end()?;
        self.inner
            .site
            .owner
            .upgrade()
            .map(Container::from_inner)
            .ok_or(KhaznaError::ContainerReleased {
                registered: self.definition.key(),
            })
    }

    pub fn behavior(&self) -> ScopeBehavior {
        self.inner.state.behavior()
    }

    pub fn definition(&self) -> GenericDefinition {
        self.definition
    }

    pub fn target(&self) -> GenericDefinition {
        self.inner.target
    }
}

impl fmt::Debug for OpenRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenRegistration")
            .field("definition", &self.definition)
            .field("target", &self.inner.target)
            .field("behavior", &self.inner.state.behavior())
            .finish()
    }
}

// ═══════════════════════════════════════════
// GenericTypeRegistry
// ═══════════════════════════════════════════

/// Open registrations of one generic definition within a container.
pub struct GenericTypeRegistry {
    site: Site,
    definition: GenericDefinition,
    current: RwLock<Option<Arc<GenericRegistration>>>,
    base: Option<Arc<ContainerRegistry>>,
}

impl GenericTypeRegistry {
    pub(crate) fn new(
        definition: GenericDefinition,
        site: Site,
        base: Option<Arc<ContainerRegistry>>,
    ) -> Self {
        Self {
            site,
            definition,
            current: RwLock::new(None),
            base,
        }
    }

    /// Registers `target` as the implementation of this definition.
    ///
    /// Follows the same specialization policy as
    /// [`TypeRegistry`](crate::registration::TypeRegistry).
    pub fn register(&self, target: GenericDefinition) -> Result<OpenRegistration> {
        let observed = self.current.read().clone();
        if let Some(ref existing) = observed {
            if existing.state.behavior().is_specialization_disallowed() {
                warn!(
                    definition = %self.definition,
                    container = %self.site.key,
                    "Rejected specialization of a locked open registration"
                );
                return Err(KhaznaError::SpecializationDisallowed {
                    registered: self.definition.key(),
                });
            }
        }
        if self.is_locked_above() {
            warn!(
                definition = %self.definition,
                container = %self.site.key,
                "Rejected specialization of an open registration locked by a parent"
            );
            return Err(KhaznaError::SpecializationDisallowed {
                registered: self.definition.key(),
            });
        }

        let registration = Arc::new(GenericRegistration {
            state: RegistrationState::new(self.definition.key(), ScopeBehavior::DEFAULT),
            target,
            closed: DashMap::new(),
            site: self.site.clone(),
        });

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
                    definition = %self.definition,
                    container = %self.site.key,
                    "Lost a concurrent open registration race"
                );
                return Err(KhaznaError::ConcurrentRegistration {
                    registered: self.definition.key(),
                });
            }
            *current = Some(registration.clone());
        }

        if let Some(replaced) = observed {
            if replaced.owner_key() == self.site.key {
                replaced.release();
            }
        }

        info!(
            definition = %self.definition,
            target = %target,
            container = %self.site.key,
            "Open generic registered"
        );
        Ok(OpenRegistration {
            definition: self.definition,
            inner: registration,
        })
    }

    pub fn can_specialize_registration(&self) -> bool {
        !self.is_locked_here() && !self.is_locked_above()
    }

    pub(crate) fn is_locked_here(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|current| current.state.behavior().is_specialization_disallowed())
    }

    fn is_locked_above(&self) -> bool {
        self.base
            .as_ref()
            .is_some_and(|base| base.is_generic_locked(&self.definition))
    }

    pub fn has_registration(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn definition(&self) -> GenericDefinition {
        self.definition
    }

    /// The current registration, if it was made in this container.
    pub(crate) fn registration(&self) -> Option<Arc<GenericRegistration>> {
        let current = self.current.read().clone();
        current.filter(|registration| registration.owner_key() == self.site.key)
    }

    pub(crate) fn make_copy_for_container(
        &self,
        site: Site,
        base: Option<Arc<ContainerRegistry>>,
    ) -> Self {
        Self {
            site,
            definition: self.definition,
            current: RwLock::new(self.current.read().clone()),
            base,
        }
    }

    pub(crate) fn release_owned(&self, key: ContainerKey) {
        let current = self.current.read().clone();
        if let Some(current) = current {
            if current.owner_key() == key {
                current.release();
            }
        }
    }
}

impl fmt::Debug for GenericTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericTypeRegistry")
            .field("definition", &self.definition)
            .field("container", &self.site.key)
            .field("has_current", &self.has_registration())
            .finish()
    }
}

// ═══════════════════════════════════════════
// Resolution
// ═══════════════════════════════════════════

impl Container {
    /// Resolves a closed generic service through open registrations.
    ///
    /// # Errors
    /// [`KhaznaError::NotResolvable`] when no definition of `T` has a
    /// registration that closes over `T`.
    pub fn resolve_generic<T: GenericService + ?Sized>(&self) -> Result<Arc<T>> {
        let tracking = self.settings().default_tracking;
        self.try_resolve_generic::<T>(tracking, &[])?.ok_or_else(|| {
            KhaznaError::NotResolvable(NotResolvableError {
                requested: TypeKey::of::<T>(),
                name: None,
                suggestions: Vec::new(),
            })
        })
    }

    pub(crate) fn try_resolve_generic<T: GenericService + ?Sized>(
        &self,
        tracking: LifespanTracking,
        params: &[Param],
    ) -> Result<Option<Arc<T>>> {
        for definition in T::definitions() {
            let Some(registration) = self.registry().generic_registration_for(&definition) else {
                continue;
            };
            let Some(resolver) = registration.closed_resolver::<T>()? else {
                continue;
            };

            debug!(
                service = %TypeKey::of::<T>(),
                definition = %definition,
                "Resolving through open generic registration"
            );
            return match resolver.try_resolve(self, tracking, None, params)? {
                Some(instance) => Ok(Some(instance)),
                None => Err(KhaznaError::NoMatchingConstructor(NoMatchingConstructorError {
                    target: resolver.target(),
                    supplied: params.len(),
                    available: resolver.arities(),
                })),
            };
        }
        Ok(None)
    }
}
