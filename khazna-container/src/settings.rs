//! Container configuration.
//!
//! [`ContainerSettings`] configures a root container and everything created
//! below it. Settings are plain serde data, so they can come from any
//! configuration source an application already uses.

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// Options applied when a child container is created.
///
/// # Examples
/// ```
/// use khazna_container::settings::CreationContextOptions;
///
/// let opts = CreationContextOptions::INHERIT_CACHE;
/// assert!(opts.contains(CreationContextOptions::ENABLE_CACHING));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CreationContextOptions(u32);

impl CreationContextOptions {
    pub const NONE: Self = Self(0);
    /// Keep weak references to instances observed through creation events.
    pub const INSTANCE_TRACKING: Self = Self(1);
    /// Keep auxiliary caches local to the container.
    pub const ENABLE_CACHING: Self = Self(2);
    /// Delegate auxiliary caches to the parent. Implies caching.
    pub const INHERIT_CACHE: Self = Self(6);
    /// Share the parent's cleanup scope instead of owning one.
    pub const INHERIT_SCOPE: Self = Self(8);

    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CreationContextOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Who owns the cleanup of a resolved disposable instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifespanTracking {
    /// The resolving container disposes the instance with its scope.
    #[default]
    Automatic,
    /// The caller takes over cleanup.
    External,
}

/// Settings shared by a root container and all of its descendants.
///
/// # Examples
/// ```
/// use khazna_container::settings::{ContainerSettings, LifespanTracking};
///
/// let settings: ContainerSettings =
///     serde_json::from_str(r#"{ "default_tracking": "external" }"#).unwrap();
/// assert_eq!(settings.default_tracking, LifespanTracking::External);
/// assert_eq!(settings.suggestions, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Tracking mode used by the plain `resolve*` calls.
    pub default_tracking: LifespanTracking,
    /// Options used by [`Container::child`](crate::container::Container::child).
    pub child_options: CreationContextOptions,
    /// Maximum number of "did you mean" entries in resolution errors.
    pub suggestions: usize,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            default_tracking: LifespanTracking::Automatic,
            child_options: CreationContextOptions::NONE,
            suggestions: 3,
        }
    }
}
