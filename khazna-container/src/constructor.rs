//! Constructor plans and constructor matching.
//!
//! An [`Injectable`] type lists its constructor plans through
//! [`Constructors`]. At registration the plans become a
//! [`ConstructorSet`]: sorted by arity, with a default parameter array per
//! plan. At resolution the set picks one plan for the supplied parameters,
//! binds every position and invokes it.
//!
//! # Selection
//! ```text
//! zero supplied    → default plan (bound to registration defaults, else arity 0)
//!                  → lowest-arity plan whose parameters are all satisfiable
//!                  → MissingParameter for the lowest-arity plan
//! n supplied       → most recently used plan of arity n, else the plan of arity n
//!                  → no plan of arity n: no binding
//! ```
//!
//! At each position a caller's value wins over the plan's default, except
//! a bare [`Param::resolve`] placeholder, which yields to it.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{trace, warn};

use crate::container::Container;
use crate::error::{KhaznaError, Result};
use crate::inject::Injectable;
use crate::key::TypeKey;
use crate::param::{BoxedValue, Param};

/// Declares one constructor parameter.
pub struct ParamDecl {
    name: Arc<str>,
    value_type: TypeKey,
    default: Option<Param>,
}

impl ParamDecl {
    /// A value parameter without a default.
    ///
    /// Callers must supply it; the container cannot.
    pub fn value<V: Send + Sync + 'static>(name: &str) -> Self {
        Self {
            name: name.into(),
            value_type: TypeKey::of::<V>(),
            default: None,
        }
    }

    /// A value parameter with a declared default.
    pub fn value_or<V: Clone + Send + Sync + 'static>(name: &str, default: V) -> Self {
        let name: Arc<str> = name.into();
        Self {
            value_type: TypeKey::of::<V>(),
            default: Some(Param::declared(name.clone(), default)),
            name,
        }
    }

    /// A service the container supplies as `Arc<T>`.
    pub fn service<T: ?Sized + Send + Sync + 'static>(name: &str) -> Self {
        let name: Arc<str> = name.into();
        Self {
            value_type: TypeKey::of::<Arc<T>>(),
            default: Some(Param::container_default::<T>(name.clone())),
            name,
        }
    }

    /// A service the container supplies from a named registration.
    pub fn named_service<T: ?Sized + Send + Sync + 'static>(name: &str, registration: &str) -> Self {
        let name: Arc<str> = name.into();
        Self {
            value_type: TypeKey::of::<Arc<T>>(),
            default: Some(Param::container_default_named::<T>(name.clone(), registration.into())),
            name,
        }
    }

    /// Declared parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared value type.
    pub fn value_type(&self) -> TypeKey {
        self.value_type
    }
}

/// Arguments handed to a constructor plan, in declaration order.
pub struct Args {
    target: TypeKey,
    names: Vec<Arc<str>>,
    values: Vec<Option<BoxedValue>>,
}

impl Args {
    /// Takes the value at `position`.
    ///
    /// # Errors
    /// [`KhaznaError::ConstructionFailed`] if the position was already
    /// taken, is out of range, or holds another type.
    pub fn take<V: 'static>(&mut self, position: usize) -> Result<V> {
        let target = self.target;
        let name = self
            .names
            .get(position)
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("#{position}"));

        let boxed = self
            .values
            .get_mut(position)
            .and_then(Option::take)
            .ok_or_else(|| {
                KhaznaError::construction(target, format!("argument `{name}` is not available"))
            })?;

        boxed.downcast::<V>().map(|v| *v).map_err(|_| {
            KhaznaError::construction(
                target,
                format!("argument `{name}` is not a {}", type_name::<V>()),
            )
        })
    }

    /// Takes the service at `position`.
    pub fn service<T: ?Sized + Send + Sync + 'static>(&mut self, position: usize) -> Result<Arc<T>> {
        self.take::<Arc<T>>(position)
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

type Invoke<C> = Arc<dyn Fn(&mut Args) -> Result<C> + Send + Sync>;

struct PlanDef<C> {
    decls: Vec<ParamDecl>,
    invoke: Invoke<C>,
}

/// Collects the constructor plans of `C`.
pub struct Constructors<C> {
    plans: Vec<PlanDef<C>>,
}

impl<C: Send + Sync + 'static> Constructors<C> {
    fn new() -> Self {
        Self { plans: Vec::new() }
    }

    /// Adds a plan without parameters.
    pub fn nullary(&mut self, construct: impl Fn() -> C + Send + Sync + 'static) -> &mut Self {
        self.plans.push(PlanDef {
            decls: Vec::new(),
            invoke: Arc::new(move |_: &mut Args| Ok(construct())),
        });
        self
    }

    /// Adds a plan taking the declared parameters.
    ///
    /// ```rust,ignore
    /// ctors.add(
    ///     vec![ParamDecl::value::<i32>("x"), ParamDecl::value_or("label", String::new())],
    ///     |args| Ok(Point { x: args.take(0)?, label: args.take(1)? }),
    /// );
    /// ```
    pub fn add(
        &mut self,
        params: Vec<ParamDecl>,
        construct: impl Fn(&mut Args) -> Result<C> + Send + Sync + 'static,
    ) -> &mut Self {
        self.plans.push(PlanDef {
            decls: params,
            invoke: Arc::new(construct),
        });
        self
    }

    /// Number of plans collected so far.
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

struct ConstructorPlan<C> {
    names: Vec<Arc<str>>,
    types: Vec<TypeKey>,
    /// Default per position; `Param::missing` where nothing can supply one.
    defaults: Vec<Param>,
    bound_to_supplied: bool,
    invoke: Invoke<C>,
}

impl<C> ConstructorPlan<C> {
    fn arity(&self) -> usize {
        self.types.len()
    }

    fn is_satisfiable(&self) -> bool {
        !self.defaults.iter().any(Param::is_missing)
    }

    /// Binds registration-time defaults; all positions must match.
    fn accepts_defaults(&self, supplied: &[Param]) -> bool {
        supplied.len() == self.arity()
            && supplied.iter().enumerate().all(|(i, p)| {
                let name_ok = match p.name() {
                    Some(name) => *name == *self.names[i],
                    None => true,
                };
                name_ok && (p.yields_to_default() || p.value_type() == self.types[i])
            })
    }

    /// Merges caller values with the plan's defaults.
    ///
    /// `Ok(None)` when a value has the wrong type.
    fn bind(&self, supplied: &[Param]) -> Result<Option<Vec<Param>>> {
        let mut bound = Vec::with_capacity(self.arity());
        for (i, given) in supplied.iter().enumerate() {
            let chosen = if given.yields_to_default() {
                &self.defaults[i]
            } else {
                given
            };
            if chosen.value_type() != self.types[i] {
                trace!(position = i, expected = %self.types[i], got = %chosen.value_type(), "Parameter type mismatch");
                return Ok(None);
            }
            if chosen.is_missing() {
                return Err(chosen.missing_error(i));
            }
            bound.push(chosen.clone());
        }
        Ok(Some(bound))
    }
}

const NO_PLAN: usize = usize::MAX;

/// The constructor plans of a concrete type, ready for matching.
pub struct ConstructorSet<C> {
    target: TypeKey,
    plans: Vec<ConstructorPlan<C>>,
    /// Plan used when the caller supplies nothing.
    zero_plan: Option<usize>,
    most_recent: AtomicUsize,
}

impl<C: Injectable> ConstructorSet<C> {
    /// Builds the set for `C`, binding registration-time defaults.
    ///
    /// # Errors
    /// [`KhaznaError::AmbiguousConstructors`] if two plans share an arity.
    pub fn for_injectable(defaults: &[Param]) -> Result<Self> {
        let mut ctors = Constructors::new();
        C::constructors(&mut ctors);
        Self::from_constructors(ctors, defaults)
    }
}

impl<C: Send + Sync + 'static> ConstructorSet<C> {
    pub(crate) fn from_constructors(ctors: Constructors<C>, defaults: &[Param]) -> Result<Self> {
        let target = TypeKey::of::<C>();

        let mut plans: Vec<ConstructorPlan<C>> = ctors
            .plans
            .into_iter()
            .map(|def| {
                let names: Vec<Arc<str>> = def.decls.iter().map(|d| d.name.clone()).collect();
                let types: Vec<TypeKey> = def.decls.iter().map(|d| d.value_type).collect();
                let own: Vec<Param> = def
                    .decls
                    .into_iter()
                    .enumerate()
                    .map(|(i, d)| match d.default {
                        Some(param) => param,
                        None => Param::missing(d.name, i, d.value_type),
                    })
                    .collect();
                ConstructorPlan {
                    names,
                    types,
                    defaults: own,
                    bound_to_supplied: false,
                    invoke: def.invoke,
                }
            })
            .collect();

        plans.sort_by_key(|p| p.arity());

        if let Some(pair) = plans.windows(2).find(|w| w[0].arity() == w[1].arity()) {
            return Err(KhaznaError::AmbiguousConstructors {
                target,
                arity: pair[0].arity(),
            });
        }

        if !defaults.is_empty() {
            let bound = plans.iter_mut().find(|p| p.accepts_defaults(defaults));
            match bound {
                Some(plan) => {
                    plan.defaults = plan
                        .defaults
                        .iter()
                        .zip(defaults)
                        .map(|(own, given)| {
                            if given.yields_to_default() {
                                own.clone()
                            } else {
                                given.clone()
                            }
                        })
                        .collect();
                    plan.bound_to_supplied = true;
                }
                None => warn!(
                    target_type = %target,
                    supplied = defaults.len(),
                    "Registration defaults match no constructor plan"
                ),
            }
        }

        let default_plan = plans
            .iter()
            .position(|p| p.bound_to_supplied)
            .or_else(|| plans.iter().position(|p| p.arity() == 0));
        let zero_plan = default_plan.or_else(|| plans.iter().position(|p| p.is_satisfiable()));

        Ok(Self {
            target,
            plans,
            zero_plan,
            most_recent: AtomicUsize::new(NO_PLAN),
        })
    }

    /// The concrete type this set constructs.
    pub fn target(&self) -> TypeKey {
        self.target
    }

    /// Parameter counts of the plans, ascending.
    pub fn arities(&self) -> Vec<usize> {
        self.plans.iter().map(|p| p.arity()).collect()
    }

    /// Selects a plan and binds its parameters.
    ///
    /// `Ok(None)` is a structural failure: no plan accepts the supplied
    /// parameters.
    fn select(&self, supplied: &[Param]) -> Result<Option<(usize, Vec<Param>)>> {
        if supplied.is_empty() {
            if let Some(index) = self.zero_plan {
                return Ok(Some((index, self.plans[index].defaults.clone())));
            }
            return match self.plans.first() {
                Some(plan) => {
                    let (i, missing) = plan
                        .defaults
                        .iter()
                        .enumerate()
                        .find(|(_, p)| p.is_missing())
                        .ok_or_else(|| KhaznaError::construction(self.target, "no satisfiable constructor"))?;
                    Err(missing.missing_error(i))
                }
                None => Ok(None),
            };
        }

        let recent = self.most_recent.load(Ordering::Relaxed);
        if let Some(plan) = self.plans.get(recent).filter(|p| p.arity() == supplied.len()) {
            if let Some(bound) = plan.bind(supplied)? {
                return Ok(Some((recent, bound)));
            }
        }

        let Some(index) = self.plans.iter().position(|p| p.arity() == supplied.len()) else {
            return Ok(None);
        };

        match self.plans[index].bind(supplied)? {
            Some(bound) => {
                self.most_recent.store(index, Ordering::Relaxed);
                Ok(Some((index, bound)))
            }
            None => Ok(None),
        }
    }

    /// Selects a plan, fetches its arguments and constructs `C`.
    pub(crate) fn construct(&self, container: &Container, supplied: &[Param]) -> Result<Option<C>> {
        let Some((index, bound)) = self.select(supplied)? else {
            return Ok(None);
        };
        let plan = &self.plans[index];

        let values = bound
            .iter()
            .map(|p| p.fetch(container).map(Some))
            .collect::<Result<Vec<_>>>()?;

        trace!(target_type = %self.target, arity = plan.arity(), "Invoking constructor plan");

        let mut args = Args {
            target: self.target,
            names: plan.names.clone(),
            values,
        };
        (plan.invoke)(&mut args).map(Some)
    }
}

impl<C> fmt::Debug for ConstructorSet<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstructorSet")
            .field("target", &self.target)
            .field("arities", &self.plans.iter().map(|p| p.arity()).collect::<Vec<_>>())
            .field("zero_plan", &self.zero_plan)
            .finish()
    }
}
