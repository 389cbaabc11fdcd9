//! Cleanup scopes: the teardown list owned by a container.
//!
//! Everything that has to happen when a container ends (disposing
//! per-request instances, evicting per-scope and singleton caches) is
//! queued here as an action. Actions run in reverse order of addition.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// Disposal contract for instances that hold resources.
///
/// # Examples
/// ```
/// use khazna_container::cleanup::{CleanupScope, Dispose};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// struct Connection { closed: AtomicBool }
///
/// impl Dispose for Connection {
///     fn dispose(&self) { self.closed.store(true, Ordering::SeqCst); }
/// }
///
/// let conn = Arc::new(Connection { closed: AtomicBool::new(false) });
/// let scope = CleanupScope::new();
/// scope.add_disposable(conn.clone());
/// scope.dispose();
/// assert!(conn.closed.load(Ordering::SeqCst));
/// ```
pub trait Dispose: Send + Sync {
    /// Releases the resources held by this instance.
    fn dispose(&self);
}

type Action = Box<dyn FnOnce() + Send>;

/// LIFO list of teardown actions.
///
/// A scope may be disposed more than once: actions added after a
/// dispose are kept until the next one. Dropping the scope runs
/// whatever is still queued.
#[derive(Default)]
pub struct CleanupScope {
    actions: Mutex<Vec<Action>>,
}

impl CleanupScope {
    /// Creates an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an action to run when the scope is disposed.
    pub fn add_action(&self, action: impl FnOnce() + Send + 'static) {
        self.actions.lock().push(Box::new(action));
    }

    /// Queues a disposable instance.
    pub fn add_disposable(&self, instance: Arc<dyn Dispose>) {
        self.add_action(move || instance.dispose());
    }

    /// Number of queued actions.
    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.lock().is_empty()
    }

    /// Runs every queued action, most recent first.
    ///
    /// Actions run outside the internal lock, so an action may queue
    /// further actions; those run before this call returns.
    pub fn dispose(&self) {
        loop {
            let batch = std::mem::take(&mut *self.actions.lock());
            if batch.is_empty() {
                break;
            }
            trace!(actions = batch.len(), "Running cleanup actions");
            for action in batch.into_iter().rev() {
                action();
            }
        }
    }
}

impl Drop for CleanupScope {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for CleanupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupScope")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_run_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let scope = CleanupScope::new();

        for i in 0..3 {
            let order = order.clone();
            scope.add_action(move || order.lock().push(i));
        }

        assert_eq!(scope.len(), 3);
        scope.dispose();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert!(scope.is_empty());
    }

    #[test]
    fn scope_is_reusable_after_dispose() {
        let hits = Arc::new(Mutex::new(0));
        let scope = CleanupScope::new();

        let h = hits.clone();
        scope.add_action(move || *h.lock() += 1);
        scope.dispose();

        let h = hits.clone();
        scope.add_action(move || *h.lock() += 10);
        scope.dispose();

        assert_eq!(*hits.lock(), 11);
    }

    #[test]
    fn actions_queued_during_dispose_also_run() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let scope = Arc::new(CleanupScope::new());

        let inner_scope = scope.clone();
        let h = hits.clone();
        scope.add_action(move || {
            h.lock().push("outer");
            let h = h.clone();
            inner_scope.add_action(move || h.lock().push("nested"));
        });

        scope.dispose();
        assert_eq!(*hits.lock(), vec!["outer", "nested"]);
    }

    #[test]
    fn drop_runs_pending_actions() {
        let hits = Arc::new(Mutex::new(0));
        {
            let scope = CleanupScope::new();
            let h = hits.clone();
            scope.add_action(move || *h.lock() += 1);
        }
        assert_eq!(*hits.lock(), 1);
    }
}
