//! Fallback sources consulted when nothing is registered for a type.
//!
//! In resolution order:
//! 1. **Concrete types** declared with [`concrete!`](crate::concrete) or
//!    [`RootContainer::declare_concrete`](crate::root::RootContainer::declare_concrete)
//!    register themselves at the root.
//! 2. **Auto-implementation providers** pick an implementation and a
//!    recommended scope behavior.
//! 3. **Open generics** declared with
//!    [`RootContainer::declare_generic`](crate::root::RootContainer::declare_generic).
//! 4. The **next factory** chain, a last-resort external source.

use std::any::TypeId;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::container::Container;
use crate::error::{KhaznaError, Result};
use crate::generic::GenericService;
use crate::inject::Injectable;
use crate::key::TypeKey;
use crate::param::{BoxedValue, Param};
use crate::resolver::Implementation;
use crate::scope::ScopeBehavior;
use crate::settings::LifespanTracking;

// ═══════════════════════════════════════════
// Concrete types
// ═══════════════════════════════════════════

/// A type that may be registered against itself on first resolution.
///
/// Collected at link time from [`concrete!`](crate::concrete).
pub struct ConcreteType {
    type_id: fn() -> TypeId,
    type_name: fn() -> &'static str,
    register: fn(&Container) -> Result<()>,
}

impl ConcreteType {
    pub const fn new<C: Injectable>() -> Self {
        Self {
            type_id: TypeId::of::<C>,
            type_name: std::any::type_name::<C>,
            register: register_concrete::<C>,
        }
    }

    pub fn type_id(&self) -> TypeId {
        (self.type_id)()
    }

    pub fn type_name(&self) -> &'static str {
        (self.type_name)()
    }
}

inventory::collect!(ConcreteType);

/// Declares types as concrete, so that resolving them without a
/// registration registers them against themselves.
///
/// ```rust,ignore
/// khazna_container::concrete!(SmtpMailer, AuditLog);
/// ```
#[macro_export]
macro_rules! concrete {
    ($($ty:ty),+ $(,)?) => {
        $(
            $crate::inventory::submit! {
                $crate::catalog::ConcreteType::new::<$ty>()
            }
        )+
    };
}

fn register_concrete<C: Injectable>(root: &Container) -> Result<()> {
    let registry = root.for_type::<C>();
    if registry.has_registration() {
        return Ok(());
    }
    match registry.register::<C>() {
        Ok(_) => {
            info!(service = %TypeKey::of::<C>(), "Concrete type auto-registered");
            Ok(())
        }
        Err(KhaznaError::ConcurrentRegistration { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}

// ═══════════════════════════════════════════
// Auto-implementation
// ═══════════════════════════════════════════

/// What an auto-implementation provider chose for a type.
pub struct AutoImplementation<T: ?Sized> {
    pub implementation: Implementation<T>,
    pub behavior: ScopeBehavior,
}

impl<T: ?Sized + Send + Sync + 'static> AutoImplementation<T> {
    pub fn new(implementation: Implementation<T>, behavior: ScopeBehavior) -> Self {
        Self {
            implementation,
            behavior,
        }
    }
}

/// Supplies implementations for types tagged with
/// [`RootContainer::auto_implement`](crate::root::RootContainer::auto_implement).
pub trait AutoImplement<T: ?Sized>: Send + Sync {
    /// Chooses an implementation, or declines with `None`.
    fn implement(&self, container: &Container) -> Option<AutoImplementation<T>>;
}

impl<T, F> AutoImplement<T> for F
where
    T: ?Sized,
    F: Fn(&Container) -> Option<AutoImplementation<T>> + Send + Sync,
{
    fn implement(&self, container: &Container) -> Option<AutoImplementation<T>> {
        self(container)
    }
}

// ═══════════════════════════════════════════
// Next factory
// ═══════════════════════════════════════════

/// External construction source consulted last.
///
/// [`construct`](NextFactory::construct) must return a boxed `Arc<T>`
/// for the requested `T`.
pub trait NextFactory: Send + Sync {
    fn can_construct(&self, key: TypeKey) -> bool;
    fn construct(&self, key: TypeKey, container: &Container) -> Result<BoxedValue>;
}

// ═══════════════════════════════════════════
// Catalog
// ═══════════════════════════════════════════

type RegisterFn = fn(&Container) -> Result<()>;
type GenericFn = fn(&Container, LifespanTracking, &[Param]) -> Result<Option<BoxedValue>>;
type AutoFn = Arc<dyn Fn(&Container, &Container) -> Result<bool> + Send + Sync>;

/// Fallback side tables of a root container.
pub(crate) struct Catalog {
    concrete: DashMap<TypeId, RegisterFn>,
    generic: DashMap<TypeId, GenericFn>,
    auto: DashMap<TypeId, AutoFn>,
}

impl Catalog {
    pub(crate) fn new() -> Self {
        let concrete = DashMap::new();
        for declared in inventory::iter::<ConcreteType> {
            concrete.insert(declared.type_id(), declared.register);
        }
        debug!(declared = concrete.len(), "Concrete type catalog loaded");

        Self {
            concrete,
            generic: DashMap::new(),
            auto: DashMap::new(),
        }
    }

    pub(crate) fn declare_concrete<C: Injectable>(&self) {
        self.concrete
            .insert(TypeId::of::<C>(), register_concrete::<C> as RegisterFn);
    }

    pub(crate) fn declare_generic<T: GenericService + ?Sized>(&self) {
        self.generic
            .insert(TypeId::of::<T>(), resolve_generic_boxed::<T> as GenericFn);
    }

    pub(crate) fn auto_implement<T, P>(&self, provider: P)
    where
        T: ?Sized + Send + Sync + 'static,
        P: AutoImplement<T> + 'static,
    {
        let thunk: AutoFn = Arc::new(move |root: &Container, requesting: &Container| {
            let registry = root.for_type::<T>();
            if registry.has_registration() {
                return Ok(true);
            }
            let Some(chosen) = provider.implement(requesting) else {
                return Ok(false);
            };
            let target = chosen.implementation.target();
            match registry.register_implementation_with(chosen.implementation, chosen.behavior) {
                Ok(_) => {
                    info!(
                        service = %TypeKey::of::<T>(),
                        target_type = %target,
                        behavior = %chosen.behavior,
                        "Auto-implementation registered"
                    );
                    Ok(true)
                }
                Err(KhaznaError::ConcurrentRegistration { .. }) => {
                    debug!(
                        service = %TypeKey::of::<T>(),
                        target_type = %target,
                        "Auto-implementation lost the registration race, using the winner"
                    );
                    Ok(true)
                }
                Err(err) => Err(err),
            }
        });
        self.auto.insert(TypeId::of::<T>(), thunk);
    }

    /// Registers `key` at `root` if it is a declared concrete type.
    pub(crate) fn try_register_concrete(&self, key: TypeKey, root: &Container) -> Result<bool> {
        let register = self.concrete.get(&key.type_id()).map(|entry| *entry.value());
        match register {
            Some(register) => register(root).map(|_| true),
            None => Ok(false),
        }
    }

    pub(crate) fn try_auto_implement(
        &self,
        key: TypeKey,
        root: &Container,
        requesting: &Container,
    ) -> Result<bool> {
        let thunk = self.auto.get(&key.type_id()).map(|entry| entry.value().clone());
        match thunk {
            Some(thunk) => thunk(root, requesting),
            None => Ok(false),
        }
    }

    pub(crate) fn generic_resolver(&self, key: TypeKey) -> Option<GenericFn> {
        self.generic.get(&key.type_id()).map(|entry| *entry.value())
    }

    pub(crate) fn is_concrete(&self, key: TypeKey) -> bool {
        self.concrete.contains_key(&key.type_id())
    }

    pub(crate) fn has_auto_implementation(&self, key: TypeKey) -> bool {
        self.auto.contains_key(&key.type_id())
    }
}

fn resolve_generic_boxed<T: GenericService + ?Sized>(
    container: &Container,
    tracking: LifespanTracking,
    params: &[Param],
) -> Result<Option<BoxedValue>> {
    Ok(container
        .try_resolve_generic::<T>(tracking, params)?
        .map(|instance| Box::new(instance) as BoxedValue))
}
