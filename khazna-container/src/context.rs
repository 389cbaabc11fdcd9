//! Ambient "current container" tracking.
//!
//! Every thread carries a stack of the containers created on it; child
//! creation pushes, teardown pops. The stack holds weak references only,
//! so it never keeps a container alive. A container torn down on another
//! thread cannot pop itself here; such entries are pruned the next time
//! this thread's stack is pushed or read.
//!
//! Crossing a thread boundary is explicit: [`ContextFlow::capture`]
//! shares the current container into a [`FlowCapture`], and
//! [`FlowCapture::attach`] makes it current on the receiving thread until
//! the returned guard is dropped.
//!
//! ```
//! use khazna_container::prelude::*;
//!
//! let root = RootContainer::new();
//! let child = root.child();
//! let capture = ContextFlow::capture().unwrap();
//!
//! std::thread::spawn(move || {
//!     let _guard = capture.attach();
//!     assert!(ContextFlow::current().is_some());
//! })
//! .join()
//! .unwrap();
//! # drop(child);
//! ```

use std::cell::RefCell;
use std::sync::Weak;

use tracing::{trace, warn};

use crate::container::{Container, ContainerInner};
use crate::key::ContainerKey;

thread_local! {
    static FLOW: RefCell<Vec<(ContainerKey, Weak<ContainerInner>)>> = const { RefCell::new(Vec::new()) };
}

#[cfg(feature = "async")]
tokio::task_local! {
    static TASK_CONTAINER: Container;
}

/// Access to the ambient container stack of the current thread.
pub struct ContextFlow;

impl ContextFlow {
    pub(crate) fn push(container: &Container) {
        Self::prune();
        let entry = (container.key(), container.downgrade());
        let _ = FLOW.try_with(|flow| flow.borrow_mut().push(entry));
        trace!(container = %container.key(), "Pushed onto context flow");
    }

    /// Pops `key` from this thread's stack.
    ///
    /// Containers above `key` were never popped; they are dropped as
    /// orphans. Returns `false` when `key` is not on the stack.
    pub(crate) fn try_pop(key: ContainerKey) -> bool {
        FLOW.try_with(|flow| {
            let mut flow = flow.borrow_mut();
            let Some(position) = flow.iter().rposition(|(k, _)| *k == key) else {
                return false;
            };

            let orphans = flow.len() - position - 1;
            if orphans > 0 {
                warn!(
                    container = %key,
                    orphans,
                    "Context flow popped out of order, discarding orphaned scopes"
                );
            }
            flow.truncate(position);
            true
        })
        .unwrap_or(false)
    }

    /// Removes entries whose container was dropped or torn down.
    fn prune() {
        let entries: Vec<(ContainerKey, Weak<ContainerInner>)> = FLOW
            .try_with(|flow| flow.borrow().clone())
            .unwrap_or_default();

        // Upgrading happens outside the borrow: a temporary handle may be
        // the last one, and its teardown pops from this stack.
        let stale: Vec<ContainerKey> = entries
            .into_iter()
            .filter(|(_, weak)| {
                weak.upgrade()
                    .map(Container::from_inner)
                    .is_none_or(|container| container.is_disposed())
            })
            .map(|(key, _)| key)
            .collect();
        if stale.is_empty() {
            return;
        }

        let _ = FLOW.try_with(|flow| flow.borrow_mut().retain(|(key, _)| !stale.contains(key)));
        trace!(pruned = stale.len(), "Pruned stale context flow entries");
    }

    /// The innermost live container on this thread's stack.
    pub fn peek() -> Option<Container> {
        Self::prune();
        // Upgraded handles may be the last ones, so the stack must not be
        // borrowed when they drop.
        let entries: Vec<Weak<ContainerInner>> = FLOW
            .try_with(|flow| flow.borrow().iter().rev().map(|(_, weak)| weak.clone()).collect())
            .unwrap_or_default();

        entries
            .into_iter()
            .filter_map(|weak| weak.upgrade().map(Container::from_inner))
            .find(|container| !container.is_disposed())
    }

    /// The container bound to the current task, else [`peek`](Self::peek).
    pub fn current() -> Option<Container> {
        #[cfg(feature = "async")]
        if let Ok(container) = TASK_CONTAINER.try_with(Container::clone) {
            return Some(container);
        }
        Self::peek()
    }

    /// Number of live entries on this thread's stack.
    pub fn depth() -> usize {
        Self::prune();
        FLOW.try_with(|flow| flow.borrow().len()).unwrap_or(0)
    }

    /// Shares the current container so another thread can adopt it.
    pub fn capture() -> Option<FlowCapture> {
        Self::current().map(|container| FlowCapture {
            container: container.share(),
            attached: false,
        })
    }

    /// Runs `future` with `container` as the task's current container.
    #[cfg(feature = "async")]
    pub async fn scope<F: std::future::Future>(container: Container, future: F) -> F::Output {
        TASK_CONTAINER.scope(container, future).await
    }
}

/// A shared container on its way to another thread.
///
/// Dropping an unattached capture releases the share.
pub struct FlowCapture {
    container: Container,
    attached: bool,
}

impl FlowCapture {
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Makes the captured container current on this thread.
    pub fn attach(mut self) -> FlowGuard {
        self.attached = true;
        let container = self.container.clone();
        ContextFlow::push(&container);
        FlowGuard { container }
    }
}

impl Drop for FlowCapture {
    fn drop(&mut self) {
        if !self.attached {
            self.container.dispose();
        }
    }
}

/// Keeps a captured container current until dropped.
pub struct FlowGuard {
    container: Container,
}

impl FlowGuard {
    pub fn container(&self) -> &Container {
        &self.container
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        ContextFlow::try_pop(self.container.key());
        self.container.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::root::RootContainer;

    #[test]
    fn child_creation_pushes_and_dispose_pops() {
        let root = RootContainer::new();
        let before = ContextFlow::depth();

        let child = root.child();
        assert_eq!(ContextFlow::depth(), before + 1);
        assert!(ContextFlow::peek().unwrap().ptr_eq(&child));

        child.dispose();
        assert_eq!(ContextFlow::depth(), before);
    }

    #[test]
    fn out_of_order_dispose_discards_orphans() {
        let root = RootContainer::new();
        let before = ContextFlow::depth();

        let outer = root.child();
        let inner = outer.child();
        assert_eq!(ContextFlow::depth(), before + 2);

        outer.dispose();
        assert_eq!(ContextFlow::depth(), before);
        assert!(!ContextFlow::try_pop(inner.key()));
    }

    #[test]
    fn teardown_on_another_thread_does_not_grow_the_stack() {
        let root = RootContainer::new();
        let before = ContextFlow::depth();

        for _ in 0..5 {
            let child = root.child();
            std::thread::spawn(move || child.dispose()).join().unwrap();
        }
        assert_eq!(ContextFlow::depth(), before);

        let kept = root.child();
        let remote = kept.clone();
        std::thread::spawn(move || remote.dispose()).join().unwrap();
        assert!(kept.is_disposed());
        assert_eq!(ContextFlow::depth(), before);
        assert!(ContextFlow::peek().is_none());

        let next = root.child();
        assert_eq!(ContextFlow::depth(), before + 1);
        assert!(ContextFlow::peek().unwrap().ptr_eq(&next));
    }

    #[test]
    fn capture_keeps_container_alive_across_threads() {
        let root = RootContainer::new();
        let child = root.child();
        let key = child.key();

        let capture = ContextFlow::capture().unwrap();
        child.dispose();
        assert!(!child.is_disposed());

        std::thread::spawn(move || {
            let guard = capture.attach();
            assert_eq!(ContextFlow::current().unwrap().key(), key);
            drop(guard);
            assert!(ContextFlow::current().is_none());
        })
        .join()
        .unwrap();

        assert!(child.is_disposed());
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn task_scope_binds_container() {
        let root = RootContainer::new();
        assert!(ContextFlow::current().is_none());

        let container: Container = (*root).clone();
        let seen = ContextFlow::scope(container, async {
            ContextFlow::current().map(|c| c.key())
        })
        .await;
        assert_eq!(seen, Some(root.key()));
    }
}
