//! Adapting instances to other interfaces, and initialise-after-resolve.
//!
//! Adapters are ordinary registrations of `dyn Adapter<T, S>`, so they
//! follow the same specialization rules as any other service.

use std::sync::Arc;

use tracing::debug;

use crate::container::Container;
use crate::error::Result;
use crate::events::CreationEventKind;
use crate::key::TypeKey;

/// Produces a `T` backed by a source `S`.
pub trait Adapter<T: ?Sized, S: ?Sized>: Send + Sync {
    fn adapt(&self, source: Arc<S>) -> Arc<T>;
}

impl Container {
    /// Adapts `source` to `T` with the registered `dyn Adapter<T, S>`.
    ///
    /// Fires a [`CreationEventKind::DuckType`] event for the result.
    pub fn as_if<T, S>(&self, source: Arc<S>) -> Result<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
        S: ?Sized + Send + Sync + 'static,
    {
        let adapter = self.resolve::<dyn Adapter<T, S>>()?;
        let adapted = adapter.adapt(source);
        debug!(
            service = %TypeKey::of::<T>(),
            source = %TypeKey::of::<S>(),
            "Instance adapted"
        );
        self.notify_creation(&adapted, TypeKey::of::<S>(), None, CreationEventKind::DuckType);
        Ok(adapted)
    }

    /// Resolves `T` and runs `init` on it before handing it out.
    ///
    /// Fires a [`CreationEventKind::Initialized`] event after `init`
    /// succeeds.
    pub fn new_init<T, F>(&self, init: F) -> Result<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
        F: FnOnce(&Arc<T>) -> Result<()>,
    {
        let instance = self.resolve::<T>()?;
        init(&instance)?;
        let target = self.implementation_type::<T>().unwrap_or_else(TypeKey::of::<T>);
        self.notify_creation(&instance, target, None, CreationEventKind::Initialized);
        Ok(instance)
    }
}
