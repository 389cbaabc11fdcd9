//! # The Container: heart of Khazna
//!
//! A node in the scope tree. Every container owns a registry chained to
//! its parent's, a cleanup scope (its own, or its parent's when created
//! with [`CreationContextOptions::INHERIT_SCOPE`]) and the resolution
//! entry points.
//!
//! # Architecture
//! ```text
//! RootContainer ── make_child() ──> Container ── make_child() ──> Container
//!       │                               │
//!  register_tenant()               share() / dispose()
//!       │
//!       ▼
//!  tenant root ── child() ──> Container
//! ```
//!
//! # Resolution order
//! 1. The registry chain (this container, then ancestors).
//! 2. Declared concrete types, registered against themselves at the root.
//! 3. Auto-implementation providers.
//! 4. Declared open generics.
//! 5. The next-factory chain.
//!
//! # Examples
//! ```rust
//! use khazna_container::prelude::*;
//! use std::sync::Arc;
//!
//! trait Notifier: Send + Sync {
//!     fn notify(&self, who: &str);
//! }
//!
//! struct EmailNotifier;
//! impl Notifier for EmailNotifier {
//!     fn notify(&self, who: &str) { println!("mail to {who}"); }
//! }
//!
//! struct Signup {
//!     notifier: Arc<dyn Notifier>,
//! }
//!
//! impl Injectable for Signup {
//!     fn constructors(ctors: &mut Constructors<Self>) {
//!         ctors.add(vec![ParamDecl::service::<dyn Notifier>("notifier")], |args| {
//!             Ok(Signup { notifier: args.service(0)? })
//!         });
//!     }
//! }
//!
//! khazna_container::implements!(EmailNotifier => dyn Notifier);
//!
//! let root = RootContainer::new();
//! root.for_type::<dyn Notifier>()
//!     .register_factory(|_, _| Ok(EmailNotifier))?
//!     .resolve_as_singleton()?;
//! root.for_type::<Signup>().register::<Signup>()?;
//!
//! let request = root.child();
//! let signup: Arc<Signup> = request.resolve()?;
//! signup.notifier.notify("ada@example.com");
//! # Ok::<(), KhaznaError>(())
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use anymap2::SendSyncAnyMap;
use khazna_support::rendering::{LineageEntry, render_lineage, suggest_similar};
use parking_lot::RwLock;
use tracing::{debug, instrument, trace};

use crate::catalog::Catalog;
use crate::cleanup::CleanupScope;
use crate::context::ContextFlow;
use crate::error::{KhaznaError, NoMatchingConstructorError, NotResolvableError, Result};
use crate::generic::{GenericDefinition, GenericTypeRegistry};
use crate::inject::Implements;
use crate::key::{ContainerKey, TenantId, TypeKey};
use crate::param::{BoxedValue, Param};
use crate::registration::TypeRegistry;
use crate::registry::ContainerRegistry;
use crate::resolver::{ResolveAny, Site};
use crate::root::RootState;
use crate::settings::{ContainerSettings, CreationContextOptions, LifespanTracking};

// ═══════════════════════════════════════════
// ContainerInner
// ═══════════════════════════════════════════

pub(crate) struct ContainerInner {
    key: ContainerKey,
    parent: Option<Container>,
    registry: Arc<ContainerRegistry>,
    scope: Arc<CleanupScope>,
    owns_scope: bool,
    options: CreationContextOptions,
    is_root: bool,
    tenant: Option<TenantId>,
    root_state: Arc<RootState>,
    shares: AtomicUsize,
    torn_down: AtomicBool,
    caches: RwLock<SendSyncAnyMap>,
    observers: RwLock<SendSyncAnyMap>,
}

impl ContainerInner {
    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        ContextFlow::try_pop(self.key);
        if self.owns_scope {
            self.scope.dispose();
        }
        self.registry.release_owned();
        self.observers.write().clear();
        self.caches.write().clear();

        if self.parent.is_none() {
            self.root_state.dispose();
        }

        debug!(container = %self.key, "Container torn down");
    }
}

impl Drop for ContainerInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ═══════════════════════════════════════════
// Container
// ═══════════════════════════════════════════

/// Handle to a container. Cloning is cheap and yields the same container.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    pub(crate) fn create(
        parent: Option<&Container>,
        options: CreationContextOptions,
        is_root: bool,
        tenant: Option<TenantId>,
        root_state: Arc<RootState>,
    ) -> Container {
        let key = ContainerKey::next();
        let (scope, owns_scope) = match parent {
            Some(parent) if options.contains(CreationContextOptions::INHERIT_SCOPE) => {
                (parent.inner.scope.clone(), false)
            }
            _ => (Arc::new(CleanupScope::new()), true),
        };

        let inner = Arc::new_cyclic(|owner: &Weak<ContainerInner>| {
            let site = Site {
                owner: owner.clone(),
                key,
                scope: Arc::downgrade(&scope),
            };
            let base = parent.map(|parent| parent.inner.registry.clone());
            ContainerInner {
                key,
                parent: parent.cloned(),
                registry: Arc::new(ContainerRegistry::new(site, base)),
                scope,
                owns_scope,
                options,
                is_root,
                tenant,
                root_state,
                shares: AtomicUsize::new(1),
                torn_down: AtomicBool::new(false),
                caches: RwLock::new(SendSyncAnyMap::new()),
                observers: RwLock::new(SendSyncAnyMap::new()),
            }
        });

        Container { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ContainerInner>) -> Container {
        Container { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ContainerInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn registry(&self) -> &ContainerRegistry {
        &self.inner.registry
    }

    pub(crate) fn observers(&self) -> &RwLock<SendSyncAnyMap> {
        &self.inner.observers
    }

    pub(crate) fn caches(&self) -> &RwLock<SendSyncAnyMap> {
        &self.inner.caches
    }

    pub(crate) fn root_state(&self) -> &Arc<RootState> {
        &self.inner.root_state
    }

    fn catalog(&self) -> &Catalog {
        self.inner.root_state.catalog()
    }

    // ── Identity ──

    pub fn key(&self) -> ContainerKey {
        self.inner.key
    }

    /// Returns `true` if both handles refer to the same container.
    pub fn ptr_eq(&self, other: &Container) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn parent(&self) -> Option<&Container> {
        self.inner.parent.as_ref()
    }

    /// Returns `true` for the root and for tenant roots.
    pub fn is_root(&self) -> bool {
        self.inner.is_root
    }

    pub fn tenant(&self) -> Option<&TenantId> {
        self.inner.tenant.as_ref()
    }

    pub fn options(&self) -> CreationContextOptions {
        self.inner.options
    }

    pub fn settings(&self) -> &ContainerSettings {
        self.inner.root_state.settings()
    }

    /// The cleanup scope collecting this container's teardown actions.
    pub fn scope(&self) -> &CleanupScope {
        &self.inner.scope
    }

    /// The top of the tree.
    pub fn root(&self) -> Container {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.torn_down.load(Ordering::Acquire)
    }

    // ── Registration ──

    /// The registry of `T` in this container.
    ///
    /// The first access in a child seeds it from the nearest ancestor, so
    /// named registrations and specialization locks carry over.
    pub fn for_type<T: ?Sized + Send + Sync + 'static>(&self) -> Arc<TypeRegistry<T>> {
        self.inner.registry.for_type::<T>()
    }

    /// The open-generic registry of `definition` in this container.
    pub fn for_generic(&self, definition: GenericDefinition) -> Arc<GenericTypeRegistry> {
        self.inner.registry.for_generic(definition)
    }

    /// Returns `true` if `T` has a current registration here or in an
    /// ancestor.
    pub fn is_type_registered<T: ?Sized + 'static>(&self) -> bool {
        self.inner.registry.is_type_registered(TypeKey::of::<T>())
    }

    // ── Resolution ──

    /// Resolves `T` with no parameters and the default tracking.
    pub fn resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.resolve_with(self.settings().default_tracking, None, &[])
    }

    pub fn resolve_tracked<T: ?Sized + Send + Sync + 'static>(
        &self,
        tracking: LifespanTracking,
    ) -> Result<Arc<T>> {
        self.resolve_with(tracking, None, &[])
    }

    /// Resolves `T`, binding `params` to the constructor of equal arity.
    pub fn resolve_with_params<T: ?Sized + Send + Sync + 'static>(
        &self,
        params: &[Param],
    ) -> Result<Arc<T>> {
        self.resolve_with(self.settings().default_tracking, None, params)
    }

    pub fn resolve_named<T: ?Sized + Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        self.resolve_with(self.settings().default_tracking, Some(name), &[])
    }

    pub fn resolve_named_with_params<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
        params: &[Param],
    ) -> Result<Arc<T>> {
        self.resolve_with(self.settings().default_tracking, Some(name), params)
    }

    /// Full-control resolution.
    ///
    /// # Errors
    /// - [`KhaznaError::NotResolvable`] when nothing can produce `T`
    /// - [`KhaznaError::NoMatchingConstructor`] when a registration exists
    ///   but no constructor accepts `params`
    /// - [`KhaznaError::MissingParameter`] when a required value is absent
    #[instrument(level = "debug", skip_all, fields(service = %TypeKey::of::<T>(), container = %self.key(), name = ?name))]
    pub fn resolve_with<T: ?Sized + Send + Sync + 'static>(
        &self,
        tracking: LifespanTracking,
        name: Option<&str>,
        params: &[Param],
    ) -> Result<Arc<T>> {
        self.resolve_through_fallbacks(
            TypeKey::of::<T>(),
            tracking,
            name,
            params,
            |container| container.try_registered::<T>(tracking, name, params),
            downcast_instance::<T>,
        )
    }

    /// Resolves by [`TypeKey`]; the value is a boxed `Arc<T>`.
    pub fn resolve_untyped(&self, key: TypeKey) -> Result<BoxedValue> {
        self.resolve_untyped_with(key, self.settings().default_tracking, None, &[])
    }

    #[instrument(level = "debug", skip_all, fields(service = %key, container = %self.key(), name = ?name))]
    pub fn resolve_untyped_with(
        &self,
        key: TypeKey,
        tracking: LifespanTracking,
        name: Option<&str>,
        params: &[Param],
    ) -> Result<BoxedValue> {
        self.resolve_through_fallbacks(
            key,
            tracking,
            name,
            params,
            |container| container.try_registered_untyped(key, tracking, name, params),
            Ok,
        )
    }

    /// Resolves the concrete `C` and hands it out as a `T`.
    pub fn resolve_implementation_of<T, C>(&self) -> Result<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
        C: Implements<T>,
    {
        Ok(self.resolve::<C>()?.upcast())
    }

    /// Returns `true` if resolving `T` could succeed without parameters
    /// being considered.
    pub fn can_construct<T: ?Sized + 'static>(&self) -> bool {
        let key = TypeKey::of::<T>();
        let catalog = self.catalog();
        self.inner.registry.is_type_registered(key)
            || catalog.is_concrete(key)
            || catalog.has_auto_implementation(key)
            || catalog.generic_resolver(key).is_some()
            || self
                .inner
                .root_state
                .next_factory()
                .is_some_and(|next| next.can_construct(key))
    }

    /// The concrete type currently registered for `T`.
    pub fn implementation_type<T: ?Sized + Send + Sync + 'static>(&self) -> Option<TypeKey> {
        self.inner
            .registry
            .resolver_for::<T>()
            .map(|resolver| resolver.target())
    }

    fn try_registered<T: ?Sized + Send + Sync + 'static>(
        &self,
        tracking: LifespanTracking,
        name: Option<&str>,
        params: &[Param],
    ) -> Result<Option<Arc<T>>> {
        let resolver = match name {
            Some(name) => self.inner.registry.named_resolver_for::<T>(name),
            None => self.inner.registry.resolver_for::<T>(),
        };
        let Some(resolver) = resolver else {
            return Ok(None);
        };

        match resolver.try_resolve(self, tracking, name, params)? {
            Some(instance) => Ok(Some(instance)),
            None => Err(KhaznaError::NoMatchingConstructor(NoMatchingConstructorError {
                target: resolver.target(),
                supplied: params.len(),
                available: resolver.arities(),
            })),
        }
    }

    fn try_registered_untyped(
        &self,
        key: TypeKey,
        tracking: LifespanTracking,
        name: Option<&str>,
        params: &[Param],
    ) -> Result<Option<BoxedValue>> {
        let Some(resolver) = self.inner.registry.untyped_resolver(key, name) else {
            return Ok(None);
        };

        match resolver.try_resolve_any(self, tracking, name, params)? {
            Some(value) => Ok(Some(value)),
            None => Err(no_binding(resolver.as_ref(), params.len())),
        }
    }

    fn resolve_through_fallbacks<R>(
        &self,
        key: TypeKey,
        tracking: LifespanTracking,
        name: Option<&str>,
        params: &[Param],
        lookup: impl Fn(&Container) -> Result<Option<R>>,
        from_boxed: impl Fn(BoxedValue) -> Result<R>,
    ) -> Result<R> {
        if let Some(found) = lookup(self)? {
            return Ok(found);
        }
        if name.is_some() {
            return Err(self.not_resolvable(key, name));
        }

        let root = self.root();
        let catalog = self.catalog();
        if catalog.try_register_concrete(key, &root)? || catalog.try_auto_implement(key, &root, self)? {
            if let Some(found) = lookup(self)? {
                return Ok(found);
            }
        }

        if let Some(resolve_generic) = catalog.generic_resolver(key) {
            if let Some(value) = resolve_generic(self, tracking, params)? {
                return from_boxed(value);
            }
        }

        if let Some(next) = self.inner.root_state.next_factory() {
            if next.can_construct(key) {
                debug!(service = %key, "Delegating to next factory");
                return from_boxed(next.construct(key, self)?);
            }
        }

        Err(self.not_resolvable(key, None))
    }

    fn not_resolvable(&self, requested: TypeKey, name: Option<&str>) -> KhaznaError {
        let registered = self.inner.registry.registered_keys();
        let available: Vec<&str> = registered.iter().map(|key| key.type_name()).collect();
        let suggestions = suggest_similar(
            requested.type_name(),
            &available,
            self.settings().suggestions,
        );

        trace!(service = %requested, suggestions = suggestions.len(), "Not resolvable");
        KhaznaError::NotResolvable(NotResolvableError {
            requested,
            name: name.map(str::to_string),
            suggestions,
        })
    }

    // ── Scopes ──

    /// Creates a child container and makes it current on this thread.
    pub fn make_child(&self, options: CreationContextOptions) -> Container {
        let child = Container::create(
            Some(self),
            options,
            false,
            self.inner.tenant.clone(),
            self.inner.root_state.clone(),
        );
        ContextFlow::push(&child);
        debug!(
            parent = %self.key(),
            child = %child.key(),
            options = ?options,
            "Child container created"
        );
        child
    }

    /// [`make_child`](Self::make_child) with the configured child options.
    pub fn child(&self) -> Container {
        self.make_child(self.settings().child_options)
    }

    /// Registers one more owner; each owner must call
    /// [`dispose`](Self::dispose).
    pub fn share(&self) -> Container {
        let shares = self.inner.shares.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(container = %self.key(), shares, "Container shared");
        self.clone()
    }

    /// Releases one owner; the last one tears the container down.
    ///
    /// Teardown pops the container from the ambient stack, disposes its
    /// cleanup scope (unless inherited) and releases the registrations it
    /// made. Extra calls are ignored.
    pub fn dispose(&self) {
        let previous = self
            .inner
            .shares
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => self.inner.teardown(),
            Ok(n) => trace!(container = %self.key(), shares = n - 1, "Share released"),
            Err(_) => {}
        }
    }

    /// Renders the path from the root down to this container.
    pub fn lineage(&self) -> String {
        let mut entries = Vec::new();
        let mut next = Some(self);
        while let Some(container) = next {
            let tag = match (container.parent().is_none(), container.is_root()) {
                (true, _) => "root",
                (false, true) => "tenant",
                (false, false) => "child",
            };
            let note = match (container.tenant(), container.is_disposed()) {
                (_, true) => Some("disposed".to_string()),
                (Some(tenant), false) => Some(format!("tenant: {tenant}")),
                (None, false) => None,
            };
            entries.push(LineageEntry {
                label: container.key().to_string(),
                tag: tag.to_string(),
                note,
            });
            next = container.parent();
        }
        entries.reverse();
        render_lineage(&entries)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("key", &self.inner.key)
            .field("parent", &self.inner.parent.as_ref().map(|p| p.key()))
            .field("is_root", &self.inner.is_root)
            .field("tenant", &self.inner.tenant)
            .field("options", &self.inner.options)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn no_binding(resolver: &dyn ResolveAny, supplied: usize) -> KhaznaError {
    KhaznaError::NoMatchingConstructor(NoMatchingConstructorError {
        target: resolver.target(),
        supplied,
        available: resolver.arities(),
    })
}

fn downcast_instance<T: ?Sized + Send + Sync + 'static>(value: BoxedValue) -> Result<Arc<T>> {
    value.downcast::<Arc<T>>().map(|b| *b).map_err(|_| {
        KhaznaError::construction(
            TypeKey::of::<T>(),
            format!("Type mismatch: expected Arc<{}>", std::any::type_name::<T>()),
        )
    })
}

// ═══════════════════════════════════════════
// Prelude
// ═══════════════════════════════════════════

pub mod prelude {
    pub use super::Container;
    pub use crate::adapter::Adapter;
    pub use crate::catalog::{AutoImplement, AutoImplementation, NextFactory};
    pub use crate::cleanup::{CleanupScope, Dispose};
    pub use crate::constructor::{Args, Constructors, ParamDecl};
    pub use crate::context::{ContextFlow, FlowCapture, FlowGuard};
    pub use crate::error::{KhaznaError, Result};
    pub use crate::events::{CreationEvent, CreationEventKind};
    pub use crate::generic::{ClosedTarget, GenericDefinition, GenericService};
    pub use crate::inject::{Implements, Injectable};
    pub use crate::key::{ContainerKey, TenantId, TypeKey};
    pub use crate::param::{Param, ParamKind, ParamsExt};
    pub use crate::provider::Provider;
    pub use crate::registration::{Registration, TypeRegistry};
    pub use crate::resolver::Implementation;
    pub use crate::root::{RootContainer, TenantResolver};
    pub use crate::scope::{Lifetime, ScopeBehavior};
    pub use crate::settings::{ContainerSettings, CreationContextOptions, LifespanTracking};
}

// ═══════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    trait Shape: Send + Sync {
        fn kind(&self) -> &str;
    }

    struct Circle;
    struct Square;

    impl Shape for Circle {
        fn kind(&self) -> &str {
            "Circle"
        }
    }

    impl Shape for Square {
        fn kind(&self) -> &str {
            "Square"
        }
    }

    impl Injectable for Circle {
        fn constructors(ctors: &mut Constructors<Self>) {
            ctors.nullary(|| Circle);
        }
    }

    impl Injectable for Square {
        fn constructors(ctors: &mut Constructors<Self>) {
            ctors.nullary(|| Square);
        }
    }

    crate::implements!(Circle => dyn Shape);
    crate::implements!(Square => dyn Shape);

    #[derive(Debug)]
    struct Point {
        x: i32,
        y: i32,
        arity: usize,
    }

    impl Injectable for Point {
        fn constructors(ctors: &mut Constructors<Self>) {
            ctors.nullary(|| Point { x: 0, y: 0, arity: 0 });
            ctors.add(
                vec![ParamDecl::value::<i32>("x"), ParamDecl::value::<i32>("y")],
                |args| {
                    Ok(Point {
                        x: args.take(0)?,
                        y: args.take(1)?,
                        arity: 2,
                    })
                },
            );
        }
    }

    struct Widget {
        _required_count: i32,
    }

    impl Injectable for Widget {
        fn constructors(ctors: &mut Constructors<Self>) {
            ctors.add(vec![ParamDecl::value::<i32>("required_count")], |args| {
                Ok(Widget {
                    _required_count: args.take(0)?,
                })
            });
        }
    }

    struct Greeting {
        text: String,
    }

    impl Injectable for Greeting {
        fn constructors(ctors: &mut Constructors<Self>) {
            ctors.add(vec![ParamDecl::value::<String>("text")], |args| {
                Ok(Greeting { text: args.take(0)? })
            });
        }
    }

    struct Connection {
        closed: Arc<AtomicBool>,
    }

    impl Dispose for Connection {
        fn dispose(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    trait Unregistered: Send + Sync {}

    // ── Self-registration ──

    #[test]
    fn every_container_resolves_to_itself() {
        let root = RootContainer::new();
        let child = root.child();
        let grandchild = child.child();

        for container in [&*root, &child, &grandchild] {
            let resolved = container.resolve::<Container>().unwrap();
            assert!(resolved.ptr_eq(container));
        }
    }

    #[test]
    fn self_registration_cannot_be_specialized() {
        let root = RootContainer::new();
        let child = root.child();
        let err = child
            .for_type::<Container>()
            .register_factory(|c, _| Ok(c.clone()))
            .unwrap_err();
        assert!(matches!(err, KhaznaError::SpecializationDisallowed { .. }));
    }

    // ── Constructor arity selection ──

    #[test]
    fn zero_params_use_nullary_constructor() {
        let root = RootContainer::new();
        root.for_type::<Point>().register::<Point>().unwrap();

        let p = root.resolve::<Point>().unwrap();
        assert_eq!(p.arity, 0);
    }

    #[test]
    fn two_params_bind_in_order() {
        let root = RootContainer::new();
        root.for_type::<Point>().register::<Point>().unwrap();

        let p = root
            .resolve_with_params::<Point>(&[Param::value(3i32), Param::value(4i32)])
            .unwrap();
        assert_eq!((p.x, p.y, p.arity), (3, 4, 2));
    }

    #[test]
    fn unmatched_arity_is_no_matching_constructor() {
        let root = RootContainer::new();
        root.for_type::<Point>().register::<Point>().unwrap();

        let err = root
            .resolve_with_params::<Point>(&[Param::value(1i32)])
            .unwrap_err();
        match err {
            KhaznaError::NoMatchingConstructor(e) => {
                assert_eq!(e.supplied, 1);
                assert_eq!(e.available, vec![0, 2]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // ── Parameter precedence ──

    #[test]
    fn explicit_parameter_beats_registered_default() {
        let root = RootContainer::new();
        root.for_type::<Greeting>()
            .register_with_params::<Greeting>(vec![Param::named("text", String::from("hello"))])
            .unwrap();

        let defaulted = root.resolve::<Greeting>().unwrap();
        assert_eq!(defaulted.text, "hello");

        let explicit = root
            .resolve_with_params::<Greeting>(&[Param::value(String::from("howdy"))])
            .unwrap();
        assert_eq!(explicit.text, "howdy");
    }

    // ── Singleton identity ──

    #[test]
    fn singleton_is_shared_across_children_until_root_disposes() {
        let root = RootContainer::new();
        root.for_type::<dyn Shape>()
            .register::<Circle>()
            .unwrap()
            .resolve_as_singleton()
            .unwrap();

        let left = root.child();
        let right = root.child();
        let a = left.resolve::<dyn Shape>().unwrap();
        let b = right.resolve::<dyn Shape>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        left.dispose();
        let c = right.resolve::<dyn Shape>().unwrap();
        assert!(Arc::ptr_eq(&a, &c));

        right.dispose();
        root.dispose();
        let d = root.resolve::<dyn Shape>().unwrap();
        assert!(!Arc::ptr_eq(&a, &d));
    }

    #[test]
    fn singleton_disposer_runs_with_defining_scope() {
        let root = RootContainer::new();
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        root.for_type::<Connection>()
            .register_disposable_factory(move |_, _| {
                Ok(Connection {
                    closed: flag.clone(),
                })
            })
            .unwrap()
            .resolve_as_singleton()
            .unwrap();

        let child = root.child();
        child.resolve::<Connection>().unwrap();
        child.dispose();
        assert!(!closed.load(Ordering::SeqCst));

        root.dispose();
        assert!(closed.load(Ordering::SeqCst));
    }

    // ── Per-scope identity ──

    #[test]
    fn per_scope_instances_follow_the_resolving_container() {
        let root = RootContainer::new();
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        root.for_type::<Connection>()
            .register_disposable_factory(move |_, _| {
                Ok(Connection {
                    closed: flag.clone(),
                })
            })
            .unwrap()
            .resolve_an_instance_per_scope()
            .unwrap();

        let left = root.child();
        let right = root.child();
        let l1 = left.resolve::<Connection>().unwrap();
        let l2 = left.resolve::<Connection>().unwrap();
        let r1 = right.resolve::<Connection>().unwrap();
        assert!(Arc::ptr_eq(&l1, &l2));
        assert!(!Arc::ptr_eq(&l1, &r1));

        right.dispose();
        assert!(closed.load(Ordering::SeqCst));
        let l3 = left.resolve::<Connection>().unwrap();
        assert!(Arc::ptr_eq(&l1, &l3));
    }

    #[test]
    fn per_scope_race_yields_one_instance() {
        let root = RootContainer::new();
        let built = Arc::new(AtomicUsize::new(0));
        let disposed = Arc::new(AtomicUsize::new(0));

        struct Slow {
            disposed: Arc<AtomicUsize>,
        }
        impl Dispose for Slow {
            fn dispose(&self) {
                self.disposed.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (b, d) = (built.clone(), disposed.clone());
        root.for_type::<Slow>()
            .register_disposable_factory(move |_, _| {
                b.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                Ok(Slow { disposed: d.clone() })
            })
            .unwrap()
            .resolve_an_instance_per_scope()
            .unwrap();

        let scope = root.child();
        let results: Vec<Arc<Slow>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| scope.resolve::<Slow>().unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for r in &results {
            assert!(Arc::ptr_eq(r, &results[0]));
        }
        let surplus = built.load(Ordering::SeqCst) - 1;
        assert_eq!(disposed.load(Ordering::SeqCst), surplus);
    }

    #[test]
    fn singleton_race_builds_once() {
        let root = RootContainer::new();
        let built = Arc::new(AtomicUsize::new(0));

        struct Pool;

        let b = built.clone();
        root.for_type::<Pool>()
            .register_factory(move |_, _| {
                b.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                Ok(Pool)
            })
            .unwrap()
            .resolve_as_singleton()
            .unwrap();

        let scopes: Vec<Container> = (0..8).map(|_| root.child()).collect();
        let results: Vec<Arc<Pool>> = std::thread::scope(|s| {
            let handles: Vec<_> = scopes
                .iter()
                .map(|scope| s.spawn(move || scope.resolve::<Pool>().unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for r in &results {
            assert!(Arc::ptr_eq(r, &results[0]));
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    // ── Per-request tracking ──

    #[test]
    fn per_request_disposables_follow_tracking_mode() {
        let root = RootContainer::new();
        let closed = Arc::new(AtomicUsize::new(0));

        struct Handle {
            closed: Arc<AtomicUsize>,
        }
        impl Dispose for Handle {
            fn dispose(&self) {
                self.closed.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = closed.clone();
        root.for_type::<Handle>()
            .register_disposable_factory(move |_, _| {
                Ok(Handle {
                    closed: counter.clone(),
                })
            })
            .unwrap();

        let child = root.child();
        child.resolve::<Handle>().unwrap();
        child
            .resolve_tracked::<Handle>(LifespanTracking::External)
            .unwrap();
        child.dispose();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    // ── Specialization ──

    #[test]
    fn locked_registration_survives_child_override_attempt() {
        let root = RootContainer::new();
        root.for_type::<dyn Shape>()
            .register::<Circle>()
            .unwrap()
            .with_behavior(ScopeBehavior::LOCKED_SINGLETON)
            .unwrap();

        let child = root.child();
        let err = child.for_type::<dyn Shape>().register::<Square>().unwrap_err();
        assert!(matches!(err, KhaznaError::SpecializationDisallowed { .. }));
        assert_eq!(child.resolve::<dyn Shape>().unwrap().kind(), "Circle");
    }

    // ── Round trip ──

    #[test]
    fn grandchild_specialization_does_not_leak_upwards() {
        let root = RootContainer::new();
        root.for_type::<dyn Shape>().register::<Circle>().unwrap();

        let child = root.child();
        assert_eq!(child.resolve::<dyn Shape>().unwrap().kind(), "Circle");

        let grandchild = child.child();
        grandchild
            .for_type::<dyn Shape>()
            .register::<Square>()
            .unwrap();
        assert_eq!(grandchild.resolve::<dyn Shape>().unwrap().kind(), "Square");
        assert_eq!(child.resolve::<dyn Shape>().unwrap().kind(), "Circle");
    }

    // ── Failures ──

    #[test]
    fn missing_parameter_names_it() {
        let root = RootContainer::new();
        root.for_type::<Widget>().register::<Widget>().unwrap();

        match root.resolve::<Widget>() {
            Err(KhaznaError::MissingParameter(e)) => {
                assert_eq!(e.name, "required_count");
                assert_eq!(e.position, 0);
                assert_eq!(e.value_type, TypeKey::of::<i32>());
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("Widget should not resolve"),
        }
    }

    #[test]
    fn unregistered_interface_is_not_resolvable() {
        let root = RootContainer::new();
        match root.resolve::<dyn Unregistered>() {
            Err(KhaznaError::NotResolvable(e)) => {
                assert_eq!(e.requested, TypeKey::of::<dyn Unregistered>());
                assert!(e.name.is_none());
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("nothing is registered"),
        }
    }

    #[test]
    fn unknown_name_is_not_resolvable() {
        let root = RootContainer::new();
        root.for_type::<dyn Shape>().register::<Circle>().unwrap();
        let err = root.resolve_named::<dyn Shape>("missing").err().unwrap();
        match err {
            KhaznaError::NotResolvable(e) => assert_eq!(e.name.as_deref(), Some("missing")),
            other => panic!("unexpected error: {other}"),
        }
    }

    // ── Untyped and helpers ──

    #[test]
    fn untyped_resolution_boxes_an_arc() {
        let root = RootContainer::new();
        root.for_type::<dyn Shape>().register::<Circle>().unwrap();

        let boxed = root.resolve_untyped(TypeKey::of::<dyn Shape>()).unwrap();
        let shape = boxed.downcast::<Arc<dyn Shape>>().unwrap();
        assert_eq!(shape.kind(), "Circle");
    }

    #[test]
    fn implementation_of_resolves_the_concrete_type() {
        let root = RootContainer::new();
        root.for_type::<Square>().register::<Square>().unwrap();

        let shape = root.resolve_implementation_of::<dyn Shape, Square>().unwrap();
        assert_eq!(shape.kind(), "Square");
    }

    #[test]
    fn can_construct_and_implementation_type() {
        let root = RootContainer::new();
        assert!(!root.can_construct::<dyn Shape>());
        root.for_type::<dyn Shape>().register::<Square>().unwrap();
        assert!(root.can_construct::<dyn Shape>());
        assert_eq!(
            root.implementation_type::<dyn Shape>(),
            Some(TypeKey::of::<Square>())
        );
    }

    // ── Sharing ──

    #[test]
    fn shared_container_needs_every_release() {
        let root = RootContainer::new();
        let child = root.child();
        let shared = child.share();

        child.dispose();
        assert!(!shared.is_disposed());
        shared.dispose();
        assert!(child.is_disposed());
        shared.dispose();
        assert!(child.is_disposed());
    }

    #[test]
    fn inherited_scope_defers_disposal_to_parent() {
        let root = RootContainer::new();
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        root.for_type::<Connection>()
            .register_disposable_factory(move |_, _| {
                Ok(Connection {
                    closed: flag.clone(),
                })
            })
            .unwrap();

        let parent = root.child();
        let inner = parent.make_child(CreationContextOptions::INHERIT_SCOPE);
        inner.resolve::<Connection>().unwrap();
        inner.dispose();
        assert!(!closed.load(Ordering::SeqCst));
        parent.dispose();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn lineage_lists_root_first() {
        let root = RootContainer::new();
        let child = root.child();
        let text = child.lineage();
        let root_at = text.find(&root.key().to_string()).unwrap();
        let child_at = text.find(&child.key().to_string()).unwrap();
        assert!(root_at < child_at);
        assert!(text.contains("[root ]"));
    }
}
