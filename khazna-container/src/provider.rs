//! Provider trait: a module of related registrations.
//!
//! Providers group the registrations of one area of an application, so
//! startup code reads as a list of modules rather than one long block.
//!
//! # Examples
//! ```rust
//! use khazna_container::prelude::*;
//!
//! struct Clock;
//! impl Injectable for Clock {
//!     fn constructors(ctors: &mut Constructors<Self>) {
//!         ctors.nullary(|| Clock);
//!     }
//! }
//!
//! struct TimeProvider;
//!
//! impl Provider for TimeProvider {
//!     fn register(&self, container: &Container) -> Result<()> {
//!         container.for_type::<Clock>().register::<Clock>()?.resolve_as_singleton()?;
//!         Ok(())
//!     }
//! }
//!
//! let root = RootContainer::new();
//! root.add_provider(&TimeProvider)?;
//! assert!(root.is_type_registered::<Clock>());
//! # Ok::<(), KhaznaError>(())
//! ```

use tracing::{debug, warn};

use crate::container::Container;
use crate::error::Result;

/// A module that registers related services into a container.
pub trait Provider: Send + Sync {
    /// Registers this provider's services into `container`.
    fn register(&self, container: &Container) -> Result<()>;

    /// Human-readable name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl Container {
    /// Applies `provider` to this container.
    ///
    /// Registrations made before a failure stay in place.
    pub fn add_provider(&self, provider: &dyn Provider) -> Result<&Self> {
        match provider.register(self) {
            Ok(()) => {
                debug!(provider = provider.name(), container = %self.key(), "Provider applied");
                Ok(self)
            }
            Err(err) => {
                warn!(provider = provider.name(), error = %err, "Provider failed");
                Err(err)
            }
        }
    }
}
