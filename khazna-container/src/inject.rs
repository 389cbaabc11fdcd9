//! How concrete types describe themselves to the container.
//!
//! A concrete type becomes constructible by implementing [`Injectable`],
//! which lists its constructor plans explicitly. It becomes usable as an
//! implementation of a trait object through [`Implements`], usually
//! generated with the [`implements!`](crate::implements) macro.
//!
//! # Examples
//! ```
//! use khazna_container::prelude::*;
//! use std::sync::Arc;
//!
//! trait Shape: Send + Sync {
//!     fn kind(&self) -> &str;
//! }
//!
//! struct Circle;
//! impl Shape for Circle {
//!     fn kind(&self) -> &str { "Circle" }
//! }
//!
//! impl Injectable for Circle {
//!     fn constructors(ctors: &mut Constructors<Self>) {
//!         ctors.nullary(|| Circle);
//!     }
//! }
//!
//! khazna_container::implements!(Circle => dyn Shape);
//!
//! let root = RootContainer::new();
//! root.for_type::<dyn Shape>().register::<Circle>().unwrap();
//! let shape: Arc<dyn Shape> = root.resolve().unwrap();
//! assert_eq!(shape.kind(), "Circle");
//! ```

use std::sync::Arc;

use crate::cleanup::Dispose;
use crate::constructor::Constructors;

/// Converts a shared concrete instance into a shared `I`.
///
/// Every sized type implements `Implements<Self>`. Trait-object
/// implementations are declared with [`implements!`](crate::implements).
pub trait Implements<I: ?Sized>: Send + Sync + 'static {
    /// Upcasts the instance.
    fn upcast(self: Arc<Self>) -> Arc<I>;
}

impl<T: Send + Sync + 'static> Implements<T> for T {
    #[inline]
    fn upcast(self: Arc<Self>) -> Arc<T> {
        self
    }
}

/// Declares that a concrete type implements one or more trait objects.
///
/// ```rust,ignore
/// implements!(SqlRepository => dyn Repository, dyn HealthCheck);
/// ```
#[macro_export]
macro_rules! implements {
    ($concrete:ty => $($iface:ty),+ $(,)?) => {
        $(
            impl $crate::inject::Implements<$iface> for $concrete {
                #[inline]
                fn upcast(self: ::std::sync::Arc<Self>) -> ::std::sync::Arc<$iface> {
                    self
                }
            }
        )+
    };
}

/// A concrete type the container can construct.
pub trait Injectable: Send + Sync + Sized + 'static {
    /// Lists the constructor plans of this type.
    ///
    /// Plans are selected by arity, so each plan must take a distinct
    /// number of parameters.
    fn constructors(ctors: &mut Constructors<Self>);

    /// Returns the disposal hook of a freshly built instance, if it has one.
    ///
    /// A disposable per-request instance is disposed with the resolving
    /// container's cleanup scope; cached instances are disposed when their
    /// cache entry is evicted.
    fn disposer(_instance: &Arc<Self>) -> Option<Arc<dyn Dispose>> {
        None
    }
}
