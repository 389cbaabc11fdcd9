//! Auxiliary per-container caches.
//!
//! A container can hold any number of keyed caches, one table per
//! `(key type, value type)` pair. Containers created with
//! [`CreationContextOptions::INHERIT_CACHE`] forward every cache operation
//! to their parent, so expensive derived state is built once per scope
//! tree instead of once per child.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;
use std::sync::Arc;

use tracing::trace;

use crate::container::Container;
use crate::events::CreationEventKind;
use crate::key::TypeKey;
use crate::settings::CreationContextOptions;

type Table<K, C> = HashMap<K, Arc<C>>;

impl Container {
    fn cache_owner(&self) -> &Container {
        let mut owner = self;
        while owner.options().contains(CreationContextOptions::INHERIT_CACHE) {
            match owner.parent() {
                Some(parent) => owner = parent,
                None => break,
            }
        }
        owner
    }

    /// Returns the cached value for `key`, creating it with `factory` when
    /// absent.
    ///
    /// The factory runs without any lock held; if two threads race, the
    /// first insert wins and both get the same value. A new entry fires a
    /// [`CreationEventKind::Cached`] event.
    pub fn ensure_cache<K, C, F>(&self, key: K, factory: F) -> Arc<C>
    where
        K: Eq + Hash + Send + Sync + 'static,
        C: Send + Sync + 'static,
        F: FnOnce(&K) -> C,
    {
        let owner = self.cache_owner();
        if !owner.ptr_eq(self) {
            trace!(container = %self.key(), owner = %owner.key(), "Cache delegated to parent");
        }

        let cached = owner
            .caches()
            .read()
            .get::<Table<K, C>>()
            .and_then(|table| table.get(&key).cloned());
        if let Some(value) = cached {
            return value;
        }

        let created = Arc::new(factory(&key));
        let (value, fresh) = {
            let mut caches = owner.caches().write();
            if caches.get::<Table<K, C>>().is_none() {
                caches.insert(Table::<K, C>::new());
            }
            match caches.get_mut::<Table<K, C>>() {
                Some(table) => match table.entry(key) {
                    Entry::Occupied(existing) => (existing.get().clone(), false),
                    Entry::Vacant(slot) => (slot.insert(created).clone(), true),
                },
                None => (created, true),
            }
        };

        if fresh {
            owner.notify_creation(&value, TypeKey::of::<C>(), None, CreationEventKind::Cached);
        }
        value
    }

    /// [`ensure_cache`](Self::ensure_cache) with `C::default()` as the factory.
    pub fn ensure_default_cache<K, C>(&self, key: K) -> Arc<C>
    where
        K: Eq + Hash + Send + Sync + 'static,
        C: Default + Send + Sync + 'static,
    {
        self.ensure_cache(key, |_| C::default())
    }

    /// Looks up a cached value without creating it.
    ///
    /// Only containers with caching enabled (directly or through an
    /// inherited cache) answer; others always return `None`.
    pub fn try_get_cache<K, C>(&self, key: &K) -> Option<Arc<C>>
    where
        K: Eq + Hash + Send + Sync + 'static,
        C: Send + Sync + 'static,
    {
        let owner = self.cache_owner();
        if !owner.ptr_eq(self) {
            return owner.try_get_cache(key);
        }
        if !self.options().contains(CreationContextOptions::ENABLE_CACHING) && !self.is_root() {
            return None;
        }

        self.caches()
            .read()
            .get::<Table<K, C>>()
            .and_then(|table| table.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::root::RootContainer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Metadata {
        fields: Vec<&'static str>,
    }

    #[test]
    fn ensure_cache_builds_once() {
        let root = RootContainer::new();
        let calls = AtomicUsize::new(0);

        let build = |_: &&str| {
            calls.fetch_add(1, Ordering::SeqCst);
            Metadata {
                fields: vec!["id", "name"],
            }
        };
        let a = root.ensure_cache("user", build);
        let b = root.ensure_cache("user", build);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.fields.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inherited_cache_is_shared_with_parent() {
        let root = RootContainer::new();
        let child = root.make_child(CreationContextOptions::INHERIT_CACHE);

        let from_child = child.ensure_default_cache::<&str, Metadata>("user");
        let from_root = root.try_get_cache::<&str, Metadata>(&"user").unwrap();
        assert!(Arc::ptr_eq(&from_child, &from_root));
        assert!(child.try_get_cache::<&str, Metadata>(&"user").is_some());
    }

    #[test]
    fn local_cache_needs_enable_caching() {
        let root = RootContainer::new();
        let plain = root.make_child(CreationContextOptions::NONE);
        plain.ensure_default_cache::<u32, Metadata>(1);
        assert!(plain.try_get_cache::<u32, Metadata>(&1).is_none());

        let caching = root.make_child(CreationContextOptions::ENABLE_CACHING);
        caching.ensure_default_cache::<u32, Metadata>(1);
        assert!(caching.try_get_cache::<u32, Metadata>(&1).is_some());
        assert!(root.try_get_cache::<u32, Metadata>(&1).is_none());
    }

    #[test]
    fn new_entries_fire_cached_event() {
        let root = RootContainer::new();
        let kinds = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = kinds.clone();
        root.subscribe::<Metadata, _>(move |event| seen.lock().push(event.kind));

        root.ensure_default_cache::<u8, Metadata>(0);
        root.ensure_default_cache::<u8, Metadata>(0);
        assert_eq!(*kinds.lock(), vec![CreationEventKind::Cached]);
    }
}
