//! Container registry: the per-container map of type registries.
//!
//! Each container owns one [`ContainerRegistry`] chained to its parent's.
//! Lookups walk the chain towards the root; writes always land in the
//! local registry, which is seeded from the parent's state the first time
//! a type is touched here.

use std::any::TypeId;
use std::collections::HashSet;
use std::sync::Arc;

use anymap2::SendSyncAnyMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::generic::{GenericDefinition, GenericRegistration, GenericTypeRegistry};
use crate::key::{ContainerKey, TypeKey};
use crate::registration::TypeRegistry;
use crate::resolver::{Resolve, ResolveAny, Site, Untyped};

/// Type-erased view of a [`TypeRegistry`].
trait AnyTypeRegistry: Send + Sync {
    fn registered(&self) -> TypeKey;
    fn has_registration(&self) -> bool;
    fn untyped_resolver(&self, name: Option<&str>) -> Option<Box<dyn ResolveAny>>;
    fn release_owned(&self, key: ContainerKey);
}

impl<T: ?Sized + Send + Sync + 'static> AnyTypeRegistry for TypeRegistry<T> {
    fn registered(&self) -> TypeKey {
        TypeKey::of::<T>()
    }

    fn has_registration(&self) -> bool {
        TypeRegistry::has_registration(self)
    }

    fn untyped_resolver(&self, name: Option<&str>) -> Option<Box<dyn ResolveAny>> {
        let resolver = match name {
            Some(name) => self.named_resolver(name),
            None => self.resolver(),
        };
        resolver.map(|resolver| Box::new(Untyped(resolver)) as Box<dyn ResolveAny>)
    }

    fn release_owned(&self, key: ContainerKey) {
        TypeRegistry::release_owned(self, key)
    }
}

/// All registrations made in one container.
pub(crate) struct ContainerRegistry {
    site: Site,
    typed: RwLock<SendSyncAnyMap>,
    erased: DashMap<TypeId, Arc<dyn AnyTypeRegistry>>,
    generics: DashMap<TypeId, Arc<GenericTypeRegistry>>,
    base: Option<Arc<ContainerRegistry>>,
}

impl ContainerRegistry {
    pub(crate) fn new(site: Site, base: Option<Arc<ContainerRegistry>>) -> Self {
        Self {
            site,
            typed: RwLock::new(SendSyncAnyMap::new()),
            erased: DashMap::new(),
            generics: DashMap::new(),
            base,
        }
    }

    /// The local registry for `T`, created on first access.
    pub(crate) fn for_type<T: ?Sized + Send + Sync + 'static>(&self) -> Arc<TypeRegistry<T>> {
        if let Some(existing) = self.local::<T>() {
            return existing;
        }

        let mut typed = self.typed.write();
        if let Some(existing) = typed.get::<Arc<TypeRegistry<T>>>() {
            return existing.clone();
        }

        let registry = Arc::new(match self.base.as_ref().and_then(|base| base.find::<T>()) {
            Some(inherited) => inherited.make_copy_for_container(self.site.clone(), self.base.clone()),
            None => TypeRegistry::new(self.site.clone(), self.base.clone()),
        });
        typed.insert(registry.clone());
        self.erased
            .insert(TypeId::of::<T>(), registry.clone() as Arc<dyn AnyTypeRegistry>);

        trace!(
            service = %TypeKey::of::<T>(),
            container = %self.site.key,
            "Type registry created"
        );
        registry
    }

    /// The local registry for an open definition, created on first access.
    pub(crate) fn for_generic(&self, definition: GenericDefinition) -> Arc<GenericTypeRegistry> {
        let id = definition.key().type_id();
        let existing = self.generics.get(&id).map(|entry| entry.value().clone());
        if let Some(existing) = existing {
            return existing;
        }

        let inherited = self
            .base
            .as_ref()
            .and_then(|base| base.find_generic(&definition));
        let site = self.site.clone();
        let base = self.base.clone();
        self.generics
            .entry(id)
            .or_insert_with(|| {
                Arc::new(match inherited {
                    Some(inherited) => inherited.make_copy_for_container(site, base),
                    None => GenericTypeRegistry::new(definition, site, base),
                })
            })
            .value()
            .clone()
    }

    fn local<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<TypeRegistry<T>>> {
        self.typed.read().get::<Arc<TypeRegistry<T>>>().cloned()
    }

    /// Nearest registry for `T` along the chain, without creating one.
    fn find<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<TypeRegistry<T>>> {
        self.local::<T>()
            .or_else(|| self.base.as_ref().and_then(|base| base.find::<T>()))
    }

    fn find_generic(&self, definition: &GenericDefinition) -> Option<Arc<GenericTypeRegistry>> {
        let local = self
            .generics
            .get(&definition.key().type_id())
            .map(|entry| entry.value().clone());
        local.or_else(|| self.base.as_ref().and_then(|base| base.find_generic(definition)))
    }

    /// Whether this registry or one of its parents holds a registration of
    /// `T` that disallows specialization.
    pub(crate) fn is_locked<T: ?Sized + Send + Sync + 'static>(&self) -> bool {
        self.local::<T>().is_some_and(|types| types.is_locked_here())
            || self.base.as_ref().is_some_and(|base| base.is_locked::<T>())
    }

    pub(crate) fn is_generic_locked(&self, definition: &GenericDefinition) -> bool {
        let local = self
            .generics
            .get(&definition.key().type_id())
            .map(|entry| entry.value().clone());
        local.is_some_and(|types| types.is_locked_here())
            || self
                .base
                .as_ref()
                .is_some_and(|base| base.is_generic_locked(definition))
    }

    /// Resolver of the nearest current registration of `T`.
    pub(crate) fn resolver_for<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<dyn Resolve<T>>> {
        self.local::<T>()
            .and_then(|registry| registry.resolver())
            .or_else(|| self.base.as_ref().and_then(|base| base.resolver_for::<T>()))
    }

    /// Resolver of the nearest named registration of `T`.
    pub(crate) fn named_resolver_for<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Option<Arc<dyn Resolve<T>>> {
        self.local::<T>()
            .and_then(|registry| registry.named_resolver(name))
            .or_else(|| {
                self.base
                    .as_ref()
                    .and_then(|base| base.named_resolver_for::<T>(name))
            })
    }

    /// Untyped lookup along the chain.
    pub(crate) fn untyped_resolver(
        &self,
        key: TypeKey,
        name: Option<&str>,
    ) -> Option<Box<dyn ResolveAny>> {
        let local = self
            .erased
            .get(&key.type_id())
            .map(|entry| entry.value().clone());
        local
            .and_then(|registry| registry.untyped_resolver(name))
            .or_else(|| {
                self.base
                    .as_ref()
                    .and_then(|base| base.untyped_resolver(key, name))
            })
    }

    pub(crate) fn generic_registration_for(
        &self,
        definition: &GenericDefinition,
    ) -> Option<Arc<GenericRegistration>> {
        let local = self
            .generics
            .get(&definition.key().type_id())
            .and_then(|entry| entry.value().registration());
        local.or_else(|| {
            self.base
                .as_ref()
                .and_then(|base| base.generic_registration_for(definition))
        })
    }

    pub(crate) fn is_type_registered(&self, key: TypeKey) -> bool {
        let local = self
            .erased
            .get(&key.type_id())
            .is_some_and(|entry| entry.value().has_registration());
        local
            || self
                .base
                .as_ref()
                .is_some_and(|base| base.is_type_registered(key))
    }

    /// Every type with a current registration along the chain.
    pub(crate) fn registered_keys(&self) -> Vec<TypeKey> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut next = Some(self);
        while let Some(registry) = next {
            for entry in registry.erased.iter() {
                if entry.value().has_registration() && seen.insert(*entry.key()) {
                    keys.push(entry.value().registered());
                }
            }
            next = registry.base.as_deref();
        }
        keys
    }

    /// Releases the registrations this container created.
    pub(crate) fn release_owned(&self) {
        let registries: Vec<Arc<dyn AnyTypeRegistry>> =
            self.erased.iter().map(|entry| entry.value().clone()).collect();
        for registry in registries {
            registry.release_owned(self.site.key);
        }

        let generics: Vec<Arc<GenericTypeRegistry>> =
            self.generics.iter().map(|entry| entry.value().clone()).collect();
        for registry in generics {
            registry.release_owned(self.site.key);
        }

        trace!(container = %self.site.key, "Registry released");
    }
}
