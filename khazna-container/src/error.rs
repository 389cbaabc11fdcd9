//! Error types for Khazna container operations.
//!
//! Every error says which type was involved and, where it helps, what to
//! do about it. Callers can tell "nothing is registered" apart from "no
//! constructor accepts these parameters" and from "that registration is
//! locked", since each calls for a different fix.

use std::fmt;

use crate::key::{TenantId, TypeKey};

/// Main error type for all Khazna operations.
#[derive(Debug, thiserror::Error)]
pub enum KhaznaError {
    /// Nothing is registered for the type and no fallback produced it.
    #[error("{}", .0)]
    NotResolvable(NotResolvableError),

    /// A registration exists but no constructor accepts the supplied
    /// parameters.
    #[error("{}", .0)]
    NoMatchingConstructor(NoMatchingConstructorError),

    /// A required parameter had no value.
    #[error("{}", .0)]
    MissingParameter(MissingParameterError),

    /// Tried to replace a registration that disallows specialization.
    #[error(
        "Registration for {registered} cannot be specialized: it disallows specialization\n  \
         Hint: register a named alternative, or remove DisallowSpecialization from the original registration"
    )]
    SpecializationDisallowed { registered: TypeKey },

    /// Another thread replaced the registration first.
    #[error(
        "Registration for {registered} lost a concurrent registration race\n  \
         Hint: perform registrations from a single thread during startup"
    )]
    ConcurrentRegistration { registered: TypeKey },

    /// Tried to reconfigure a registration that disallows specialization.
    #[error("Registration for {registered} is locked and cannot change its scope behavior")]
    RegistrationLocked { registered: TypeKey },

    /// Tried to reconfigure a registration after it was ended or used.
    #[error(
        "Registration for {registered} has already ended\n  \
         Hint: configure scope behavior before calling .end() or resolving the type"
    )]
    RegistrationEnded { registered: TypeKey },

    /// Two constructor plans with the same number of parameters.
    #[error(
        "{target} declares more than one constructor taking {arity} parameter(s)\n  \
         Hint: constructor plans are selected by arity, give each plan a distinct parameter count"
    )]
    AmbiguousConstructors { target: TypeKey, arity: usize },

    /// A root container accepts a single tenant resolver.
    #[error("Each root container may register only one tenant resolver")]
    MultipleTenantResolvers,

    /// Tenant resolution was requested but no resolver is registered.
    #[error(
        "Missing tenant resolver\n  \
         Hint: call .register_multi_tenant() on the root container first"
    )]
    MissingTenantResolver,

    /// No tenant partition exists for the identifier.
    #[error("{}", unknown_tenant_message(.tenant))]
    UnknownTenant { tenant: Option<TenantId> },

    /// The container owning a registration no longer exists.
    #[error("The container that owned the registration for {registered} has been released")]
    ContainerReleased { registered: TypeKey },

    /// A constructor or factory failed, or produced a value of the wrong type.
    #[error("Failed to construct {target}: {source}")]
    ConstructionFailed {
        target: TypeKey,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl KhaznaError {
    /// Wraps any error as a construction failure of `target`.
    pub fn construction(
        target: TypeKey,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        KhaznaError::ConstructionFailed {
            target,
            source: source.into(),
        }
    }

    /// Returns `true` for [`KhaznaError::NotResolvable`].
    pub fn is_not_resolvable(&self) -> bool {
        matches!(self, KhaznaError::NotResolvable(_))
    }
}

fn unknown_tenant_message(tenant: &Option<TenantId>) -> String {
    match tenant {
        Some(id) => format!("No such tenant: {id}"),
        None => "No current tenant could be determined".to_string(),
    }
}

/// Error when no registration or fallback can produce a type.
#[derive(Debug)]
pub struct NotResolvableError {
    /// The type that was requested
    pub requested: TypeKey,
    /// The registration name, for named requests
    pub name: Option<String>,
    /// Registered types with similar names
    pub suggestions: Vec<String>,
}

impl fmt::Display for NotResolvableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name {
            Some(ref name) => write!(f, "Cannot resolve type: {} (name={name:?})", self.requested)?,
            None => write!(f, "Cannot resolve type: {}", self.requested)?,
        }

        if !self.suggestions.is_empty() {
            write!(f, "\n  Did you mean one of:")?;
            for suggestion in &self.suggestions {
                write!(f, "\n    - {suggestion}")?;
            }
        }

        write!(
            f,
            "\n  Hint: Did you forget to call .for_type::<{}>().register::<..>()?",
            self.requested.short_name()
        )
    }
}

/// Error when a registration cannot bind the supplied parameters.
#[derive(Debug)]
pub struct NoMatchingConstructorError {
    /// The concrete type whose constructors were tried
    pub target: TypeKey,
    /// Number of parameters the caller supplied
    pub supplied: usize,
    /// Parameter counts of the available constructor plans
    pub available: Vec<usize>,
}

impl fmt::Display for NoMatchingConstructorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "No constructor of {} matches {} supplied parameter(s)",
            self.target, self.supplied
        )?;

        if !self.available.is_empty() {
            let arities: Vec<String> = self.available.iter().map(|a| a.to_string()).collect();
            write!(f, "\n  Available arities: {}", arities.join(", "))?;
        }

        write!(
            f,
            "\n  Hint: supply one value per constructor parameter, with matching types"
        )
    }
}

/// Error when a required parameter has no value.
#[derive(Debug)]
pub struct MissingParameterError {
    /// Declared parameter name
    pub name: String,
    /// Zero-based position in the constructor
    pub position: usize,
    /// Declared value type
    pub value_type: TypeKey,
}

impl fmt::Display for MissingParameterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Missing parameter `{}` at position {} of type {}",
            self.name, self.position, self.value_type
        )?;
        write!(
            f,
            "\n  Hint: supply it with Param::value(..) or declare a default with ParamDecl::value_or(..)"
        )
    }
}

/// Convenient Result type for Khazna operations.
pub type Result<T> = std::result::Result<T, KhaznaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_resolvable_display() {
        let err = KhaznaError::NotResolvable(NotResolvableError {
            requested: TypeKey::of::<String>(),
            name: None,
            suggestions: vec!["alloc::string::Strings".to_string()],
        });

        let msg = format!("{err}");
        assert!(msg.contains("Cannot resolve type"));
        assert!(msg.contains("String"));
        assert!(msg.contains("Did you mean"));
        assert!(err.is_not_resolvable());
    }

    #[test]
    fn named_not_resolvable_mentions_name() {
        let err = KhaznaError::NotResolvable(NotResolvableError {
            requested: TypeKey::of::<String>(),
            name: Some("primary".to_string()),
            suggestions: vec![],
        });
        assert!(err.to_string().contains("\"primary\""));
    }

    #[test]
    fn missing_parameter_display() {
        let err = KhaznaError::MissingParameter(MissingParameterError {
            name: "required_count".to_string(),
            position: 0,
            value_type: TypeKey::of::<i32>(),
        });

        let msg = format!("{err}");
        assert!(msg.contains("required_count"));
        assert!(msg.contains("position 0"));
        assert!(msg.contains("i32"));
    }

    #[test]
    fn no_matching_constructor_display() {
        let err = KhaznaError::NoMatchingConstructor(NoMatchingConstructorError {
            target: TypeKey::of::<Vec<u8>>(),
            supplied: 3,
            available: vec![0, 2],
        });

        let msg = format!("{err}");
        assert!(msg.contains("3 supplied"));
        assert!(msg.contains("0, 2"));
    }

    #[test]
    fn specialization_error_names_type() {
        let err = KhaznaError::SpecializationDisallowed {
            registered: TypeKey::of::<u64>(),
        };
        assert!(err.to_string().contains("u64"));
    }

    #[test]
    fn unknown_tenant_display() {
        let err = KhaznaError::UnknownTenant {
            tenant: Some(TenantId::from("acme")),
        };
        assert!(err.to_string().contains("acme"));

        let err = KhaznaError::UnknownTenant { tenant: None };
        assert!(err.to_string().contains("No current tenant"));
    }

    #[test]
    fn construction_failure_keeps_source() {
        use std::error::Error;

        let err = KhaznaError::construction(TypeKey::of::<u8>(), "boom");
        assert!(err.to_string().contains("boom"));
        assert!(err.source().is_some());
    }
}
