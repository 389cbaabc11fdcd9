//! The root of a container tree, and its tenant partitions.
//!
//! A [`RootContainer`] owns everything shared by its whole tree: settings,
//! the fallback catalog, the next-factory chain and the tenant roots.
//! Tenant roots are children of the root that act as roots of their own
//! subtrees; they are created on demand and live until the root is
//! disposed.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::catalog::{AutoImplement, Catalog, NextFactory};
use crate::container::Container;
use crate::error::{KhaznaError, Result};
use crate::generic::GenericService;
use crate::inject::{Implements, Injectable};
use crate::key::{TenantId, TypeKey};
use crate::param::Param;
use crate::settings::{ContainerSettings, CreationContextOptions};

/// Identifies the tenant the current call belongs to.
pub trait TenantResolver: Send + Sync {
    fn try_resolve_current_tenant(&self) -> Option<TenantId>;
}

// ═══════════════════════════════════════════
// RootState
// ═══════════════════════════════════════════

pub(crate) struct RootState {
    settings: ContainerSettings,
    catalog: Catalog,
    tenants: DashMap<TenantId, Container>,
    has_tenant_resolver: AtomicBool,
    next: RwLock<Option<Arc<dyn NextFactory>>>,
}

impl RootState {
    fn new(settings: ContainerSettings) -> Self {
        Self {
            settings,
            catalog: Catalog::new(),
            tenants: DashMap::new(),
            has_tenant_resolver: AtomicBool::new(false),
            next: RwLock::new(None),
        }
    }

    pub(crate) fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub(crate) fn next_factory(&self) -> Option<Arc<dyn NextFactory>> {
        self.next.read().clone()
    }

    /// Disposes every tenant root. Tenant roots hold their parent, so this
    /// is what lets a disposed root be dropped.
    pub(crate) fn dispose(&self) {
        let tenants: Vec<Container> = self.tenants.iter().map(|t| t.value().clone()).collect();
        self.tenants.clear();
        for tenant in tenants {
            tenant.dispose();
        }
        self.next.write().take();
    }
}

// ═══════════════════════════════════════════
// RootContainer
// ═══════════════════════════════════════════

/// The top-level container. Dereferences to [`Container`].
///
/// Dropping it disposes the root, which releases singletons, tenant roots
/// and every registration made at the root.
pub struct RootContainer {
    container: Container,
}

impl RootContainer {
    pub fn new() -> Self {
        Self::with_settings(ContainerSettings::default())
    }

    pub fn with_settings(settings: ContainerSettings) -> Self {
        let state = Arc::new(RootState::new(settings));
        let container = Container::create(None, CreationContextOptions::NONE, true, None, state);
        register_self(&container);
        info!(container = %container.key(), "Root container created");
        Self { container }
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    fn state(&self) -> &RootState {
        self.container.root_state()
    }

    // ── Tenants ──

    /// Registers `R` as the tenant resolver of this root.
    ///
    /// # Errors
    /// [`KhaznaError::MultipleTenantResolvers`] on a second call.
    pub fn register_multi_tenant<R>(&self) -> Result<&Self>
    where
        R: Injectable + Implements<dyn TenantResolver>,
    {
        self.claim_tenant_resolver()?;
        self.container
            .for_type::<dyn TenantResolver>()
            .register::<R>()?
            .resolve_as_singleton()?
            .disallow_specialization()?;
        info!(resolver = %TypeKey::of::<R>(), "Tenant resolver registered");
        Ok(self)
    }

    pub fn register_multi_tenant_factory<R, F>(&self, factory: F) -> Result<&Self>
    where
        R: Implements<dyn TenantResolver>,
        F: Fn(&Container, &[Param]) -> Result<R> + Send + Sync + 'static,
    {
        self.claim_tenant_resolver()?;
        self.container
            .for_type::<dyn TenantResolver>()
            .register_factory(factory)?
            .resolve_as_singleton()?
            .disallow_specialization()?;
        info!(resolver = %TypeKey::of::<R>(), "Tenant resolver registered");
        Ok(self)
    }

    fn claim_tenant_resolver(&self) -> Result<()> {
        if self.state().has_tenant_resolver.swap(true, Ordering::AcqRel) {
            return Err(KhaznaError::MultipleTenantResolvers);
        }
        Ok(())
    }

    pub fn supports_multiple_tenants(&self) -> bool {
        self.state().has_tenant_resolver.load(Ordering::Acquire)
    }

    /// Returns the root of tenant `id`, creating it on first use.
    ///
    /// Tenant roots are not made current on the ambient stack; only their
    /// children are.
    pub fn register_tenant(&self, id: impl Into<TenantId>) -> Container {
        let id = id.into();
        let existing = self.state().tenants.get(&id).map(|t| t.value().clone());
        if let Some(tenant) = existing {
            return tenant;
        }

        let candidate = Container::create(
            Some(&self.container),
            CreationContextOptions::NONE,
            true,
            Some(id.clone()),
            self.container.root_state().clone(),
        );
        let (tenant, surplus) = match self.state().tenants.entry(id.clone()) {
            Entry::Occupied(winner) => (winner.get().clone(), Some(candidate)),
            Entry::Vacant(slot) => {
                slot.insert(candidate.clone());
                (candidate, None)
            }
        };

        match surplus {
            Some(surplus) => surplus.dispose(),
            None => info!(tenant = %id, container = %tenant.key(), "Tenant root created"),
        }
        tenant
    }

    pub fn try_resolve_tenant(&self, id: &TenantId) -> Option<Container> {
        self.state().tenants.get(id).map(|t| t.value().clone())
    }

    /// Asks the tenant resolver who the current tenant is and returns a
    /// fresh child of that tenant's root.
    ///
    /// # Errors
    /// - [`KhaznaError::MissingTenantResolver`] if none is registered
    /// - [`KhaznaError::UnknownTenant`] if the resolver cannot tell
    pub fn resolve_current_tenant(&self) -> Result<Container> {
        if !self.supports_multiple_tenants() {
            return Err(KhaznaError::MissingTenantResolver);
        }
        let resolver = self.container.resolve::<dyn TenantResolver>()?;
        let Some(id) = resolver.try_resolve_current_tenant() else {
            return Err(KhaznaError::UnknownTenant { tenant: None });
        };

        debug!(tenant = %id, "Current tenant resolved");
        Ok(self.register_tenant(id).child())
    }

    /// Returns a fresh child of an already registered tenant's root.
    pub fn resolve_tenant_by_id(&self, id: &TenantId) -> Result<Container> {
        match self.try_resolve_tenant(id) {
            Some(tenant) => Ok(tenant.child()),
            None => Err(KhaznaError::UnknownTenant {
                tenant: Some(id.clone()),
            }),
        }
    }

    // ── Fallbacks ──

    /// Installs the factory consulted when nothing else can resolve a type.
    pub fn set_next(&self, next: impl NextFactory + 'static) -> &Self {
        let replaced = self.state().next.write().replace(Arc::new(next)).is_some();
        info!(replaced, "Next factory installed");
        self
    }

    /// Declares `C` as concrete: resolving it unregistered registers it
    /// against itself at the root.
    pub fn declare_concrete<C: Injectable>(&self) -> &Self {
        self.state().catalog().declare_concrete::<C>();
        debug!(service = %TypeKey::of::<C>(), "Concrete type declared");
        self
    }

    /// Routes plain resolution of `T` through its open-generic registry.
    pub fn declare_generic<T: GenericService + ?Sized>(&self) -> &Self {
        self.state().catalog().declare_generic::<T>();
        debug!(service = %TypeKey::of::<T>(), "Generic service declared");
        self
    }

    /// Lets `provider` pick an implementation for `T` the first time it is
    /// resolved without a registration.
    pub fn auto_implement<T, P>(&self, provider: P) -> &Self
    where
        T: ?Sized + Send + Sync + 'static,
        P: AutoImplement<T> + 'static,
    {
        self.state().catalog().auto_implement::<T, P>(provider);
        debug!(service = %TypeKey::of::<T>(), "Auto-implementation provider added");
        self
    }
}

fn register_self(container: &Container) {
    let registered = container
        .for_type::<Container>()
        .register_factory(|resolving: &Container, _: &[Param]| Ok(resolving.clone()))
        .and_then(|registration| registration.disallow_specialization());
    if let Err(err) = registered {
        warn!(error = %err, "Container self-registration failed");
    }
}

impl Default for RootContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for RootContainer {
    type Target = Container;

    fn deref(&self) -> &Container {
        &self.container
    }
}

impl Drop for RootContainer {
    fn drop(&mut self) {
        self.container.dispose();
    }
}

impl std::fmt::Debug for RootContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootContainer")
            .field("container", &self.container)
            .field("tenants", &self.state().tenants.len())
            .field("multi_tenant", &self.supports_multiple_tenants())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::AutoImplementation;
    use crate::constructor::Constructors;
    use crate::param::BoxedValue;
    use crate::resolver::Implementation;
    use crate::scope::ScopeBehavior;

    struct FixedTenant(Option<&'static str>);

    impl TenantResolver for FixedTenant {
        fn try_resolve_current_tenant(&self) -> Option<TenantId> {
            self.0.map(TenantId::from)
        }
    }

    crate::implements!(FixedTenant => dyn TenantResolver);

    impl Injectable for FixedTenant {
        fn constructors(ctors: &mut Constructors<Self>) {
            ctors.nullary(|| FixedTenant(Some("acme")));
        }
    }

    trait Branding: Send + Sync {
        fn name(&self) -> &str;
    }

    struct Plain;
    struct Fancy;

    impl Branding for Plain {
        fn name(&self) -> &str {
            "plain"
        }
    }

    impl Branding for Fancy {
        fn name(&self) -> &str {
            "fancy"
        }
    }

    crate::implements!(Plain => dyn Branding);
    crate::implements!(Fancy => dyn Branding);

    impl Injectable for Plain {
        fn constructors(ctors: &mut Constructors<Self>) {
            ctors.nullary(|| Plain);
        }
    }

    impl Injectable for Fancy {
        fn constructors(ctors: &mut Constructors<Self>) {
            ctors.nullary(|| Fancy);
        }
    }

    #[test]
    fn register_tenant_is_idempotent() {
        let root = RootContainer::new();
        let a = root.register_tenant("acme");
        let b = root.register_tenant("acme");
        assert!(a.ptr_eq(&b));
        assert!(a.is_root());
        assert_eq!(a.tenant(), Some(&TenantId::from("acme")));
        assert!(a.parent().unwrap().ptr_eq(&root));
    }

    #[test]
    fn tenant_roots_are_not_current() {
        let root = RootContainer::new();
        let before = crate::context::ContextFlow::depth();
        let tenant = root.register_tenant("acme");
        assert_eq!(crate::context::ContextFlow::depth(), before);

        let request = tenant.child();
        assert_eq!(crate::context::ContextFlow::depth(), before + 1);
        assert_eq!(request.tenant(), Some(&TenantId::from("acme")));
    }

    #[test]
    fn tenant_registrations_stay_in_their_partition() {
        let root = RootContainer::new();
        root.for_type::<dyn Branding>().register::<Plain>().unwrap();

        let acme = root.register_tenant("acme");
        acme.for_type::<dyn Branding>().register::<Fancy>().unwrap();
        let globex = root.register_tenant("globex");

        assert_eq!(acme.child().resolve::<dyn Branding>().unwrap().name(), "fancy");
        assert_eq!(globex.child().resolve::<dyn Branding>().unwrap().name(), "plain");
        assert_eq!(root.resolve::<dyn Branding>().unwrap().name(), "plain");
    }

    #[test]
    fn current_tenant_comes_from_resolver() {
        let root = RootContainer::new();
        assert!(matches!(
            root.resolve_current_tenant(),
            Err(KhaznaError::MissingTenantResolver)
        ));

        root.register_multi_tenant::<FixedTenant>().unwrap();
        assert!(root.supports_multiple_tenants());

        let request = root.resolve_current_tenant().unwrap();
        assert_eq!(request.tenant(), Some(&TenantId::from("acme")));
        assert!(!request.is_root());
        assert!(root.try_resolve_tenant(&TenantId::from("acme")).is_some());
    }

    #[test]
    fn undetermined_tenant_is_unknown() {
        let root = RootContainer::new();
        root.register_multi_tenant_factory(|_, _| Ok(FixedTenant(None)))
            .unwrap();
        assert!(matches!(
            root.resolve_current_tenant(),
            Err(KhaznaError::UnknownTenant { tenant: None })
        ));
    }

    #[test]
    fn second_tenant_resolver_is_rejected() {
        let root = RootContainer::new();
        root.register_multi_tenant::<FixedTenant>().unwrap();
        let err = root
            .register_multi_tenant_factory(|_, _| Ok(FixedTenant(None)))
            .unwrap_err();
        assert!(matches!(err, KhaznaError::MultipleTenantResolvers));
    }

    #[test]
    fn resolve_tenant_by_id_requires_registration() {
        let root = RootContainer::new();
        let err = root.resolve_tenant_by_id(&TenantId::from("nobody")).unwrap_err();
        assert!(matches!(err, KhaznaError::UnknownTenant { tenant: Some(_) }));

        root.register_tenant("acme");
        let request = root.resolve_tenant_by_id(&TenantId::from("acme")).unwrap();
        assert!(request.parent().unwrap().is_root());
    }

    #[test]
    fn disposing_root_disposes_tenants() {
        let root = RootContainer::new();
        let tenant = root.register_tenant("acme");
        root.dispose();
        assert!(tenant.is_disposed());
        assert!(root.try_resolve_tenant(&TenantId::from("acme")).is_none());
    }

    struct Legacy(u8);

    struct LegacyFactory;

    impl NextFactory for LegacyFactory {
        fn can_construct(&self, key: TypeKey) -> bool {
            key.is::<Legacy>()
        }

        fn construct(&self, key: TypeKey, _: &Container) -> Result<BoxedValue> {
            if key.is::<Legacy>() {
                Ok(Box::new(Arc::new(Legacy(7))))
            } else {
                Err(KhaznaError::construction(key, "not a legacy type"))
            }
        }
    }

    #[test]
    fn next_factory_is_the_last_resort() {
        let root = RootContainer::new();
        assert!(root.resolve::<Legacy>().err().unwrap().is_not_resolvable());

        root.set_next(LegacyFactory);
        assert!(root.can_construct::<Legacy>());
        assert_eq!(root.resolve::<Legacy>().unwrap().0, 7);
    }

    #[test]
    fn auto_implementation_registers_at_root() {
        let root = RootContainer::new();
        root.auto_implement::<dyn Branding, _>(|_: &Container| {
            Some(AutoImplementation::new(
                Implementation::of::<Fancy>(),
                ScopeBehavior::SINGLETON,
            ))
        });

        let child = root.child();
        let a = child.resolve::<dyn Branding>().unwrap();
        let b = root.resolve::<dyn Branding>().unwrap();
        assert_eq!(a.name(), "fancy");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(root.is_type_registered::<dyn Branding>());
    }

    #[test]
    fn concurrent_auto_implementation_yields_one_singleton() {
        let root = RootContainer::new();
        root.auto_implement::<dyn Branding, _>(|_: &Container| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            Some(AutoImplementation::new(
                Implementation::of::<Fancy>(),
                ScopeBehavior::SINGLETON,
            ))
        });

        let scopes: Vec<Container> = (0..8).map(|_| root.child()).collect();
        let results: Vec<Arc<dyn Branding>> = std::thread::scope(|s| {
            let handles: Vec<_> = scopes
                .iter()
                .map(|scope| s.spawn(move || scope.resolve::<dyn Branding>().unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for r in &results {
            assert!(Arc::ptr_eq(r, &results[0]));
        }
        let registration = root
            .for_type::<dyn Branding>()
            .current_registration()
            .unwrap();
        assert_eq!(registration.behavior(), ScopeBehavior::SINGLETON);
    }

    #[test]
    fn declined_auto_implementation_is_not_resolvable() {
        let root = RootContainer::new();
        root.auto_implement::<dyn Branding, _>(|_: &Container| None);
        assert!(root.resolve::<dyn Branding>().err().unwrap().is_not_resolvable());
    }

    #[test]
    fn settings_reach_the_whole_tree() {
        let root = RootContainer::with_settings(ContainerSettings {
            suggestions: 0,
            child_options: CreationContextOptions::ENABLE_CACHING,
            ..ContainerSettings::default()
        });
        let child = root.child();
        assert_eq!(child.settings().suggestions, 0);
        assert!(child.options().contains(CreationContextOptions::ENABLE_CACHING));
    }
}
