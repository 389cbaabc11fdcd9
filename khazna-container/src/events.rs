//! Creation events: a small typed pub/sub local to each container.
//!
//! Every successful resolution fires exactly one event. Events propagate
//! from the resolving container up through its ancestors, so a
//! subscription on an outer scope observes everything created in inner
//! scopes. A disposed container drops its subscriptions.

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::trace;

use crate::container::Container;
use crate::key::TypeKey;
use crate::settings::CreationContextOptions;

/// Why an instance was handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreationEventKind {
    /// Newly constructed.
    Created,
    /// Constructed, then initialised by the caller.
    Initialized,
    /// Copied from another instance.
    Copied,
    /// Stored in a container cache.
    Cached,
    /// Served again from a per-scope or singleton cache.
    Reissued,
    /// Produced by adapting another instance.
    DuckType,
}

impl fmt::Display for CreationEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CreationEventKind::Created => "created",
            CreationEventKind::Initialized => "initialized",
            CreationEventKind::Copied => "copied",
            CreationEventKind::Cached => "cached",
            CreationEventKind::Reissued => "reissued",
            CreationEventKind::DuckType => "duck-typed",
        };
        f.write_str(s)
    }
}

/// One creation event for a `T`.
pub struct CreationEvent<'a, T: ?Sized> {
    /// The container that resolved the instance.
    pub container: &'a Container,
    pub instance: &'a Arc<T>,
    /// The concrete type behind `instance`.
    pub target: TypeKey,
    pub name: Option<&'a str>,
    pub kind: CreationEventKind,
}

type Observer<T> = Arc<dyn Fn(&CreationEvent<'_, T>) + Send + Sync>;

/// Observation table for one type, stored in a container's observer map.
pub(crate) struct ObservationKey<T: ?Sized> {
    observers: Vec<Observer<T>>,
    tracked: Vec<Weak<T>>,
}

impl<T: ?Sized> Default for ObservationKey<T> {
    fn default() -> Self {
        Self {
            observers: Vec::new(),
            tracked: Vec::new(),
        }
    }
}

impl Container {
    /// Subscribes to creation events for `T` in this container and all of
    /// its descendants.
    pub fn subscribe<T, F>(&self, observer: F) -> &Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&CreationEvent<'_, T>) + Send + Sync + 'static,
    {
        let mut observers = self.observers().write();
        if observers.get::<ObservationKey<T>>().is_none() {
            observers.insert(ObservationKey::<T>::default());
        }
        if let Some(table) = observers.get_mut::<ObservationKey<T>>() {
            table.observers.push(Arc::new(observer));
        }
        drop(observers);
        trace!(service = %TypeKey::of::<T>(), container = %self.key(), "Observer subscribed");
        self
    }

    /// Fires a creation event here and in every ancestor.
    ///
    /// Observers run without any container lock held.
    pub fn notify_creation<T>(
        &self,
        instance: &Arc<T>,
        target: TypeKey,
        name: Option<&str>,
        kind: CreationEventKind,
    ) where
        T: ?Sized + Send + Sync + 'static,
    {
        if self.options().contains(CreationContextOptions::INSTANCE_TRACKING) {
            let mut observers = self.observers().write();
            if observers.get::<ObservationKey<T>>().is_none() {
                observers.insert(ObservationKey::<T>::default());
            }
            if let Some(table) = observers.get_mut::<ObservationKey<T>>() {
                table.tracked.retain(|weak| weak.strong_count() > 0);
                table.tracked.push(Arc::downgrade(instance));
            }
        }

        let event = CreationEvent {
            container: self,
            instance,
            target,
            name,
            kind,
        };

        let mut next = Some(self.clone());
        while let Some(container) = next {
            let observers: Vec<Observer<T>> = container
                .observers()
                .read()
                .get::<ObservationKey<T>>()
                .map(|table| table.observers.clone())
                .unwrap_or_default();

            for observer in observers {
                observer(&event);
            }
            next = container.parent().cloned();
        }
    }

    /// Live instances of `T` observed in this container.
    ///
    /// Empty unless the container was created with
    /// [`CreationContextOptions::INSTANCE_TRACKING`].
    pub fn tracked_instances<T: ?Sized + Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        self.observers()
            .read()
            .get::<ObservationKey<T>>()
            .map(|table| table.tracked.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }
}
