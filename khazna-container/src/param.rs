//! Constructor parameters and their provenance.
//!
//! A [`Param`] is one constructor argument: a fixed value, a value the
//! resolving container computes on demand, or a placeholder that records
//! where the value is expected to come from. The [`ParamKind`] flags
//! carry that provenance into constructor matching.
//!
//! ```rust,ignore
//! let greeter = container.resolve_with_params::<Greeter>(&[
//!     Param::value(String::from("hello")),
//!     Param::resolve::<dyn Clock>(),
//! ])?;
//! ```

use std::any::Any;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::container::Container;
use crate::error::{KhaznaError, MissingParameterError, Result};
use crate::key::TypeKey;

/// A type-erased argument value.
pub type BoxedValue = Box<dyn Any + Send + Sync>;

/// Provenance flags of a [`Param`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamKind(u32);

impl ParamKind {
    /// A value supplied by the caller.
    pub const USER_SUPPLIED: Self = Self(0);
    /// A value the resolving container computes.
    pub const CONTAINER_SUPPLIED: Self = Self(1);
    /// A default declared by the constructor or registration.
    pub const DECLARED_DEFAULT: Self = Self(2);
    /// A service the constructor expects the container to supply.
    pub const CONTAINER_DEFAULT: Self = Self(4);
    /// The parameter carries a name.
    pub const NAMED: Self = Self(8);
    /// A named service the container supplies by default.
    pub const DEFAULT_NAMED: Self = Self(12);
    /// No value is available.
    pub const MISSING: Self = Self(0x4000_0000);

    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ParamKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

type CloneFn = fn(&(dyn Any + Send + Sync)) -> Option<BoxedValue>;
type ResolveFn = fn(&Container) -> Result<BoxedValue>;
type ResolveNamedFn = fn(&Container, &str) -> Result<BoxedValue>;

#[derive(Clone)]
enum Source {
    Value(Arc<dyn Any + Send + Sync>, CloneFn),
    Resolve(ResolveFn),
    ResolveNamed(Arc<str>, ResolveNamedFn),
    Missing(usize),
}

/// One constructor argument.
///
/// Params are immutable. Cloning one is cheap: fixed values are shared
/// and cloned only when a constructor actually consumes them.
#[derive(Clone)]
pub struct Param {
    kind: ParamKind,
    value_type: TypeKey,
    name: Option<Arc<str>>,
    source: Source,
}

fn clone_value<V: Clone + Send + Sync + 'static>(value: &(dyn Any + Send + Sync)) -> Option<BoxedValue> {
    value
        .downcast_ref::<V>()
        .map(|v| Box::new(v.clone()) as BoxedValue)
}

fn resolve_boxed<T: ?Sized + Send + Sync + 'static>(container: &Container) -> Result<BoxedValue> {
    container
        .resolve::<T>()
        .map(|instance| Box::new(instance) as BoxedValue)
}

fn resolve_named_boxed<T: ?Sized + Send + Sync + 'static>(
    container: &Container,
    name: &str,
) -> Result<BoxedValue> {
    container
        .resolve_named::<T>(name)
        .map(|instance| Box::new(instance) as BoxedValue)
}

impl Param {
    /// A fixed, unnamed value.
    ///
    /// ```
    /// use khazna_container::param::{Param, ParamKind};
    ///
    /// let p = Param::value(42u32);
    /// assert_eq!(p.kind(), ParamKind::USER_SUPPLIED);
    /// assert!(p.value_type().is::<u32>());
    /// ```
    pub fn value<V: Clone + Send + Sync + 'static>(value: V) -> Self {
        Self {
            kind: ParamKind::USER_SUPPLIED,
            value_type: TypeKey::of::<V>(),
            name: None,
            source: Source::Value(Arc::new(value), clone_value::<V>),
        }
    }

    /// A fixed value carrying a name.
    pub fn named<V: Clone + Send + Sync + 'static>(name: impl Into<Arc<str>>, value: V) -> Self {
        Self {
            kind: ParamKind::NAMED,
            name: Some(name.into()),
            ..Self::value(value)
        }
    }

    /// A value resolved from the container as `Arc<T>` when needed.
    ///
    /// Passed at a position where the constructor declares its own
    /// default, this placeholder yields to that default.
    pub fn resolve<T: ?Sized + Send + Sync + 'static>() -> Self {
        Self {
            kind: ParamKind::CONTAINER_SUPPLIED,
            value_type: TypeKey::of::<Arc<T>>(),
            name: None,
            source: Source::Resolve(resolve_boxed::<T>),
        }
    }

    /// A value resolved from the container's named registration.
    pub fn resolve_named<T: ?Sized + Send + Sync + 'static>(name: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        Self {
            kind: ParamKind::CONTAINER_SUPPLIED | ParamKind::NAMED,
            value_type: TypeKey::of::<Arc<T>>(),
            name: Some(name.clone()),
            source: Source::ResolveNamed(name, resolve_named_boxed::<T>),
        }
    }

    pub(crate) fn declared<V: Clone + Send + Sync + 'static>(name: Arc<str>, value: V) -> Self {
        Self {
            kind: ParamKind::DECLARED_DEFAULT,
            name: Some(name),
            ..Self::value(value)
        }
    }

    pub(crate) fn container_default<T: ?Sized + Send + Sync + 'static>(name: Arc<str>) -> Self {
        Self {
            kind: ParamKind::CONTAINER_DEFAULT,
            name: Some(name),
            ..Self::resolve::<T>()
        }
    }

    pub(crate) fn container_default_named<T: ?Sized + Send + Sync + 'static>(
        name: Arc<str>,
        registration: Arc<str>,
    ) -> Self {
        Self {
            kind: ParamKind::DEFAULT_NAMED,
            value_type: TypeKey::of::<Arc<T>>(),
            name: Some(name),
            source: Source::ResolveNamed(registration, resolve_named_boxed::<T>),
        }
    }

    pub(crate) fn missing(name: Arc<str>, position: usize, value_type: TypeKey) -> Self {
        Self {
            kind: ParamKind::MISSING,
            value_type,
            name: Some(name),
            source: Source::Missing(position),
        }
    }

    /// Provenance flags.
    #[inline]
    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    /// Type of the value this parameter produces.
    #[inline]
    pub fn value_type(&self) -> TypeKey {
        self.value_type
    }

    /// Parameter name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns `true` for a placeholder without a value.
    #[inline]
    pub fn is_missing(&self) -> bool {
        self.kind.contains(ParamKind::MISSING)
    }

    /// Returns `true` for a bare container-supplied placeholder passed by
    /// a caller, the only kind that yields to a constructor's own default.
    #[inline]
    pub(crate) fn yields_to_default(&self) -> bool {
        self.kind == ParamKind::CONTAINER_SUPPLIED
    }

    pub(crate) fn missing_error(&self, fallback_position: usize) -> KhaznaError {
        let position = match self.source {
            Source::Missing(position) => position,
            _ => fallback_position,
        };
        KhaznaError::MissingParameter(MissingParameterError {
            name: self.name().unwrap_or("<unnamed>").to_string(),
            position,
            value_type: self.value_type,
        })
    }

    /// Produces the value, resolving it from `container` if needed.
    ///
    /// # Errors
    /// [`KhaznaError::MissingParameter`] for a missing placeholder, or any
    /// error raised while resolving a container-supplied value.
    pub fn fetch(&self, container: &Container) -> Result<BoxedValue> {
        match &self.source {
            Source::Value(value, clone_fn) => clone_fn(value.as_ref()).ok_or_else(|| {
                KhaznaError::construction(self.value_type, "parameter value has an unexpected type")
            }),
            Source::Resolve(resolve) => resolve(container),
            Source::ResolveNamed(name, resolve) => resolve(container, &**name),
            Source::Missing(position) => Err(self.missing_error(*position)),
        }
    }

    /// Produces the value as `V`.
    pub fn fetch_as<V: 'static>(&self, container: &Container) -> Result<V> {
        let boxed = self.fetch(container)?;
        boxed.downcast::<V>().map(|v| *v).map_err(|_| {
            KhaznaError::construction(
                TypeKey::of::<V>(),
                format!("parameter holds a {}", self.value_type),
            )
        })
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("kind", &self.kind.bits())
            .field("value_type", &self.value_type)
            .field("name", &self.name)
            .finish()
    }
}

/// Lookup helpers over a supplied parameter list, for factory functions.
///
/// ```rust,ignore
/// registry.register_factory(|c, params| {
///     let size: u32 = params.named("size", c)?.unwrap_or(10);
///     Ok(Pool::new(size))
/// })?;
/// ```
pub trait ParamsExt {
    /// The value at `position`.
    fn at<V: 'static>(&self, position: usize, container: &Container) -> Result<V>;

    /// The first parameter whose value type is `V`.
    fn of_type<V: 'static>(&self, container: &Container) -> Result<Option<V>>;

    /// The parameter carrying `name`.
    fn named<V: 'static>(&self, name: &str, container: &Container) -> Result<Option<V>>;
}

impl ParamsExt for [Param] {
    fn at<V: 'static>(&self, position: usize, container: &Container) -> Result<V> {
        match self.get(position) {
            Some(param) => param.fetch_as(container),
            None => Err(KhaznaError::MissingParameter(MissingParameterError {
                name: format!("#{position}"),
                position,
                value_type: TypeKey::of::<V>(),
            })),
        }
    }

    fn of_type<V: 'static>(&self, container: &Container) -> Result<Option<V>> {
        let wanted = TypeKey::of::<V>();
        self.iter()
            .find(|p| p.value_type() == wanted)
            .map(|p| p.fetch_as(container))
            .transpose()
    }

    fn named<V: 'static>(&self, name: &str, container: &Container) -> Result<Option<V>> {
        self.iter()
            .find(|p| p.name() == Some(name))
            .map(|p| p.fetch_as(container))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::root::RootContainer;

    #[test]
    fn value_params_clone_on_fetch() {
        let root = RootContainer::new();
        let p = Param::value(String::from("hello"));

        let a: String = p.fetch_as(&root).unwrap();
        let b: String = p.fetch_as(&root).unwrap();
        assert_eq!(a, "hello");
        assert_eq!(b, "hello");
    }

    #[test]
    fn named_param_carries_name() {
        let p = Param::named("size", 3usize);
        assert_eq!(p.name(), Some("size"));
        assert!(p.kind().contains(ParamKind::NAMED));
    }

    #[test]
    fn resolve_named_is_not_a_bare_placeholder() {
        assert!(Param::resolve::<String>().yields_to_default());
        assert!(!Param::resolve_named::<String>("x").yields_to_default());
        assert!(!Param::value(1u8).yields_to_default());
    }

    #[test]
    fn missing_param_fails_with_details() {
        let root = RootContainer::new();
        let p = Param::missing("required_count".into(), 2, TypeKey::of::<i32>());

        assert!(p.is_missing());
        match p.fetch(&root) {
            Err(KhaznaError::MissingParameter(e)) => {
                assert_eq!(e.name, "required_count");
                assert_eq!(e.position, 2);
                assert!(e.value_type.is::<i32>());
            }
            other => panic!("Expected MissingParameter, got: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn fetch_as_wrong_type_fails() {
        let root = RootContainer::new();
        let p = Param::value(1u8);
        assert!(matches!(
            p.fetch_as::<String>(&root),
            Err(KhaznaError::ConstructionFailed { .. })
        ));
    }

    #[test]
    fn resolve_param_asks_the_container() {
        let root = RootContainer::new();
        root.for_type::<String>()
            .register_factory(|_, _| Ok(String::from("from container")))
            .unwrap();

        let p = Param::resolve::<String>();
        let value: Arc<String> = p.fetch_as(&root).unwrap();
        assert_eq!(*value, "from container");
    }

    #[test]
    fn params_ext_lookups() {
        let root = RootContainer::new();
        let params = vec![Param::value(7u32), Param::named("label", String::from("x"))];

        let first: u32 = params.at(0, &root).unwrap();
        assert_eq!(first, 7);

        let label: Option<String> = params.named("label", &root).unwrap();
        assert_eq!(label.as_deref(), Some("x"));

        let by_type: Option<u32> = params.of_type(&root).unwrap();
        assert_eq!(by_type, Some(7));

        let absent: Option<bool> = params.of_type(&root).unwrap();
        assert!(absent.is_none());

        assert!(matches!(
            params.at::<u32>(5, &root),
            Err(KhaznaError::MissingParameter(_))
        ));
    }
}
