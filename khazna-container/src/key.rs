//! Identification keys.
//!
//! [`TypeKey`] identifies a requested or concrete type, including unsized
//! types such as `dyn Trait`. [`ContainerKey`] identifies one container in
//! a hierarchy and [`TenantId`] names a tenant partition.

use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use khazna_support::rendering::shorten_type_name;

/// Identifies a type known to the container.
///
/// Combines a [`TypeId`] with the readable type name so that errors and
/// logs can say *which* type was involved.
///
/// # Examples
/// ```
/// use khazna_container::key::TypeKey;
///
/// let key = TypeKey::of::<String>();
/// assert_eq!(key.type_name(), "alloc::string::String");
/// assert_eq!(key.short_name(), "String");
///
/// trait Shape {}
/// let key = TypeKey::of::<dyn Shape>();
/// assert!(key.type_name().contains("Shape"));
/// ```
#[derive(Clone, Copy)]
pub struct TypeKey {
    type_id: TypeId,
    type_name: &'static str,
}

impl TypeKey {
    /// Creates a key for type `T`.
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    /// Creates a key from a raw [`TypeId`] and type name.
    #[inline]
    pub fn from_raw(type_id: TypeId, type_name: &'static str) -> Self {
        Self { type_id, type_name }
    }

    /// Returns the [`TypeId`] of this type.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Returns the fully qualified type name.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns the type name with module paths stripped.
    pub fn short_name(&self) -> String {
        shorten_type_name(self.type_name)
    }

    /// Returns `true` if this key identifies `T`.
    #[inline]
    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

// Equality and hashing go through the TypeId only; names are for humans.
impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.type_name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

// ═══════════════════════════════════════════
// ContainerKey
// ═══════════════════════════════════════════

static NEXT_CONTAINER_KEY: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a container within the process.
///
/// Per-scope resolvers cache their instances under the key of the
/// container that resolved them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerKey(u64);

impl ContainerKey {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONTAINER_KEY.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container#{}", self.0)
    }
}

// ═══════════════════════════════════════════
// TenantId
// ═══════════════════════════════════════════

/// Names a tenant partition of a root container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
