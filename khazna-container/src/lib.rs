//! Core container implementation for Khazna.
//!
//! Start from [`RootContainer`], register services through
//! [`Container::for_type`], and resolve them from the root or from child
//! scopes. Most applications only need the [`prelude`].

pub mod adapter;
pub mod cache;
pub mod catalog;
pub mod cleanup;
pub mod constructor;
pub mod container;
pub mod context;
pub mod error;
pub mod events;
pub mod generic;
pub mod inject;
pub mod key;
pub mod param;
pub mod provider;
pub mod registration;
pub(crate) mod registry;
pub mod resolver;
pub mod root;
pub mod scope;
pub mod settings;

#[doc(hidden)]
pub use inventory;

pub use container::Container;
pub use container::prelude;
pub use error::{KhaznaError, Result};
pub use key::{ContainerKey, TenantId, TypeKey};
pub use root::RootContainer;
pub use scope::{Lifetime, ScopeBehavior};
