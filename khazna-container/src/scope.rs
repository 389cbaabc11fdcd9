//! Registration scope behavior and instance lifetimes.
//!
//! A registration carries a [`ScopeBehavior`] bit set. Its lifetime part
//! decides how long a resolved instance lives:
//! - [`Lifetime::Singleton`]: one instance for the defining container
//! - [`Lifetime::PerScope`]: one instance per resolving container
//! - [`Lifetime::PerRequest`]: a new instance every time
//!
//! The remaining bit, [`ScopeBehavior::SPECIALIZATION_DISALLOWED`], forbids
//! replacing the registration in the same or any descendant container.
//!
//! # Ordering
//! Lifetimes have a natural ordering: `Singleton > PerScope > PerRequest`.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// Scope behavior flags of a registration.
///
/// # Examples
/// ```
/// use khazna_container::scope::{Lifetime, ScopeBehavior};
///
/// let b = ScopeBehavior::LOCKED_SINGLETON;
/// assert!(b.is_specialization_disallowed());
/// assert_eq!(b.lifetime(), Lifetime::Singleton);
/// assert_eq!(ScopeBehavior::DEFAULT.lifetime(), Lifetime::PerRequest);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeBehavior(u32);

impl ScopeBehavior {
    /// Per-request instances, specialization allowed.
    pub const DEFAULT: Self = Self(0);
    /// A new instance on every resolution.
    pub const INSTANCE_PER_REQUEST: Self = Self(0);
    /// The registration may not be replaced in this or any child container.
    pub const SPECIALIZATION_DISALLOWED: Self = Self(1);
    /// One instance per resolving container.
    pub const INSTANCE_PER_SCOPE: Self = Self(2);
    /// One instance for the lifetime of the defining container.
    pub const SINGLETON: Self = Self(4);
    /// Singleton that may not be replaced.
    pub const LOCKED_SINGLETON: Self = Self(5);

    const LIFETIME_MASK: u32 = 2 | 4;

    /// Returns the raw bits.
    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Builds a behavior from raw bits.
    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if the registration may not be replaced.
    #[inline]
    pub fn is_specialization_disallowed(&self) -> bool {
        self.contains(Self::SPECIALIZATION_DISALLOWED)
    }

    /// Returns the lifetime encoded in these flags.
    ///
    /// When both lifetime bits are set the singleton wins.
    pub fn lifetime(&self) -> Lifetime {
        if self.contains(Self::SINGLETON) {
            Lifetime::Singleton
        } else if self.contains(Self::INSTANCE_PER_SCOPE) {
            Lifetime::PerScope
        } else {
            Lifetime::PerRequest
        }
    }

    /// Returns a copy of these flags with the lifetime replaced.
    pub fn with_lifetime(&self, lifetime: Lifetime) -> Self {
        let kept = self.0 & !Self::LIFETIME_MASK;
        let bits = match lifetime {
            Lifetime::PerRequest => Self::INSTANCE_PER_REQUEST.0,
            Lifetime::PerScope => Self::INSTANCE_PER_SCOPE.0,
            Lifetime::Singleton => Self::SINGLETON.0,
        };
        Self(kept | bits)
    }
}

impl BitOr for ScopeBehavior {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for ScopeBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lifetime())?;
        if self.is_specialization_disallowed() {
            write!(f, " (locked)")?;
        }
        Ok(())
    }
}

/// How long a resolved instance lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// One instance shared by everything resolved through the defining
    /// container and its descendants.
    ///
    /// Created on first resolution, released when the defining container's
    /// cleanup scope is disposed.
    Singleton,

    /// One instance per resolving container.
    ///
    /// Cached under the resolving container's key and released when that
    /// container's cleanup scope is disposed.
    PerScope,

    /// A new instance on every resolution.
    PerRequest,
}

impl Lifetime {
    /// Returns `true` if instances are cached.
    #[inline]
    pub fn is_cached(&self) -> bool {
        matches!(self, Lifetime::Singleton | Lifetime::PerScope)
    }

    #[inline]
    fn ordering(&self) -> u8 {
        match self {
            Lifetime::Singleton => 2,
            Lifetime::PerScope => 1,
            Lifetime::PerRequest => 0,
        }
    }
}

impl PartialOrd for Lifetime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Lifetime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ordering().cmp(&other.ordering())
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifetime::Singleton => write!(f, "Singleton"),
            Lifetime::PerScope => write!(f, "PerScope"),
            Lifetime::PerRequest => write!(f, "PerRequest"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifetime_ordering() {
        assert!(Lifetime::Singleton > Lifetime::PerScope);
        assert!(Lifetime::PerScope > Lifetime::PerRequest);
    }

    #[test]
    fn lifetime_is_cached() {
        assert!(Lifetime::Singleton.is_cached());
        assert!(Lifetime::PerScope.is_cached());
        assert!(!Lifetime::PerRequest.is_cached());
    }

    #[test]
    fn locked_singleton_is_composite() {
        let b = ScopeBehavior::SINGLETON | ScopeBehavior::SPECIALIZATION_DISALLOWED;
        assert_eq!(b, ScopeBehavior::LOCKED_SINGLETON);
        assert!(b.contains(ScopeBehavior::SINGLETON));
    }

    #[test]
    fn with_lifetime_keeps_lock() {
        let b = ScopeBehavior::LOCKED_SINGLETON.with_lifetime(Lifetime::PerScope);
        assert!(b.is_specialization_disallowed());
        assert_eq!(b.lifetime(), Lifetime::PerScope);
        assert!(!b.contains(ScopeBehavior::SINGLETON));
    }

    #[test]
    fn behavior_display() {
        assert_eq!(ScopeBehavior::DEFAULT.to_string(), "PerRequest");
        assert_eq!(ScopeBehavior::LOCKED_SINGLETON.to_string(), "Singleton (locked)");
    }

    #[test]
    fn behavior_serializes_as_bits() {
        let json = serde_json::to_string(&ScopeBehavior::LOCKED_SINGLETON).unwrap();
        assert_eq!(json, "5");
        let back: ScopeBehavior = serde_json::from_str("2").unwrap();
        assert_eq!(back.lifetime(), Lifetime::PerScope);
    }
}
