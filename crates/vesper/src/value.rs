//! The runtime value model.
//!
//! [`Value`] is one tagged sum over every value the language manipulates.
//! Values with reference semantics (vectors, maps, functions, boxes,
//! instances, lambdas) share their payload behind `Rc`; the interpreter is
//! single-threaded, so interior mutability is plain `RefCell`. Scalar values
//! copy.
//!
//! The generic-function machinery lives here too: concrete variants carry a
//! specificity score summed from their parameters' given weights, and a
//! [`GenericFunction`] keeps its variants ordered by descending specificity
//! with insertion order breaking ties.

use std::{
    cell::RefCell,
    fmt::{self, Write},
    rc::Rc,
};

use ahash::AHashMap;
use bigdecimal::{BigDecimal, Zero};
use indexmap::IndexMap;
use strum::Display;

use crate::{actions::Builtin, error::ModelCastError};

/// One lexical scope: name to value.
pub type Scope = AHashMap<String, Value>;

/// A shared scope, the unit lambdas capture.
pub type ScopeRef = Rc<RefCell<Scope>>;

/// Refuse to enumerate ranges wider than this many elements.
pub const RANGE_TO_VEC_CEILING: u32 = 100_000;

/// Categories a value can belong to, and the payload of type values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ValueType {
    Num,
    Str,
    Bool,
    Regex,
    Vec,
    Map,
    Range,
    /// Any callable: concrete, builtin, generic or partial.
    Function,
    Lambda,
    Box,
    Instance,
    Type,
    Any,
    Hole,
    Internal,
}

impl ValueType {
    /// Whether the type describes a family rather than one concrete
    /// category. Abstract types weigh less in dispatch.
    #[must_use]
    pub fn is_abstract(self) -> bool {
        matches!(self, Self::Function | Self::Any)
    }
}

/// A compiled regex value. Equality is source equality.
#[derive(Debug, Clone)]
pub struct VRegex {
    pub source: Rc<str>,
    pub pattern: Rc<regex::Regex>,
}

impl VRegex {
    pub fn new(source: &str) -> Result<Self, ModelCastError> {
        let pattern = regex::Regex::new(source)
            .map_err(|e| ModelCastError::new(format!("malformed regex pattern: {e}")))?;
        Ok(Self {
            source: Rc::from(source),
            pattern: Rc::new(pattern),
        })
    }
}

impl PartialEq for VRegex {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// A full (`a to b`) or partial (`from a`, `to b`) inclusive range.
#[derive(Debug, Clone, PartialEq)]
pub struct VRange {
    pub start: Option<BigDecimal>,
    pub end: Option<BigDecimal>,
}

impl VRange {
    #[must_use]
    pub fn full(start: BigDecimal, end: BigDecimal) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// Whether `n` falls inside the range, bounds inclusive.
    #[must_use]
    pub fn contains(&self, n: &BigDecimal) -> bool {
        if let Some(start) = &self.start
            && n < start
        {
            return false;
        }
        if let Some(end) = &self.end
            && n > end
        {
            return false;
        }
        true
    }

    /// Number of integer steps between the bounds, when both are present.
    #[must_use]
    pub fn distance(&self) -> Option<BigDecimal> {
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => Some((end - start).abs()),
            _ => None,
        }
    }

    /// Enumerates the range into a vector of Nums, stepping by one.
    ///
    /// Refuses unbounded ranges and ranges wider than
    /// [`RANGE_TO_VEC_CEILING`].
    pub fn enumerate(&self) -> Result<Vec<Value>, ModelCastError> {
        let (Some(start), Some(end)) = (&self.start, &self.end) else {
            return Err(ModelCastError::new("cannot enumerate a partial range"));
        };
        let distance = (end - start).abs();
        if distance > BigDecimal::from(RANGE_TO_VEC_CEILING) {
            return Err(ModelCastError::new(format!(
                "range too wide to enumerate: distance {distance} exceeds {RANGE_TO_VEC_CEILING}"
            )));
        }
        let descending = end < start;
        let step = if descending {
            BigDecimal::from(-1)
        } else {
            BigDecimal::from(1)
        };
        let mut items = Vec::new();
        let mut cursor = start.clone();
        loop {
            let past = if descending { cursor < *end } else { cursor > *end };
            if past {
                break;
            }
            items.push(Value::Num(cursor.clone()));
            cursor += step.clone();
        }
        Ok(items)
    }
}

/// An `a or b or c` type alternative: the lead type plus the alternatives.
#[derive(Debug, Clone)]
pub struct CompoundType {
    pub lead: ValueType,
    pub contents: Vec<Value>,
}

impl CompoundType {
    /// Structural equality over the alternatives.
    #[must_use]
    pub fn eqv(&self, other: &Self) -> bool {
        self.lead == other.lead
            && self.contents.len() == other.contents.len()
            && self.contents.iter().zip(&other.contents).all(|(a, b)| a.eqv(b))
    }
}

/// A single typed variant of a function.
#[derive(Debug, Clone)]
pub struct ConcreteFunction {
    pub name: String,
    /// Chunk index of the body in the shared pool.
    pub target: usize,
    pub params: Vec<String>,
    /// One given value per parameter, in declaration order.
    pub givens: Vec<Value>,
    /// Fixed positional arity (the slurpy tail and contextual parameter not
    /// included).
    pub arity: usize,
    pub slurpy: bool,
    pub contextual: Option<String>,
    /// Sum of the parameters' given weights; higher wins dispatch.
    pub specificity: u32,
}

impl ConcreteFunction {
    /// Whether `other` declares the same signature, making a re-definition
    /// replace this variant instead of joining it.
    #[must_use]
    pub fn same_signature(&self, other: &Self) -> bool {
        self.arity == other.arity
            && self.slurpy == other.slurpy
            && self.givens.len() == other.givens.len()
            && self.givens.iter().zip(&other.givens).all(|(a, b)| a.eqv(b))
    }
}

/// A named, insertion-ordered set of concrete variants.
#[derive(Debug, Clone)]
pub struct GenericFunction {
    pub name: String,
    /// Sorted by descending specificity; insertion order breaks ties.
    pub variants: Vec<Rc<ConcreteFunction>>,
}

impl GenericFunction {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variants: Vec::new(),
        }
    }

    /// Adds a variant, replacing an existing one with the same signature.
    ///
    /// Insertion keeps variants sorted by descending specificity and is
    /// stable: a new variant lands after every existing one of equal
    /// specificity.
    pub fn add(&mut self, variant: Rc<ConcreteFunction>) {
        if let Some(existing) = self.variants.iter_mut().find(|v| v.same_signature(&variant)) {
            *existing = variant;
            return;
        }
        let at = self
            .variants
            .iter()
            .position(|v| v.specificity < variant.specificity)
            .unwrap_or(self.variants.len());
        self.variants.insert(at, variant);
    }
}

/// A box template: a function-like constructor with a field namespace.
#[derive(Debug, Clone)]
pub struct BoxTemplate {
    pub name: String,
    pub target: usize,
    pub params: Vec<String>,
    pub givens: Vec<Value>,
    pub arity: usize,
    pub specificity: u32,
}

/// A box instance: the parent template plus an owned scope.
///
/// Two instances of the same box have independent scopes.
#[derive(Debug)]
pub struct BoxInstance {
    pub parent: Rc<BoxTemplate>,
    pub scope: RefCell<Scope>,
}

/// A closure: captured scope chain, parameters and a body chunk.
///
/// The captured chain is shared by every invocation; calling a lambda never
/// inherits the caller's locals.
#[derive(Debug, Clone)]
pub struct VLambda {
    pub target: usize,
    pub params: Vec<String>,
    pub arity: usize,
    pub slurpy: bool,
    pub scopes: Vec<ScopeRef>,
}

/// A call head with some arguments already bound (`v.f` binds `v`).
#[derive(Debug, Clone)]
pub struct Partial {
    pub callee: Value,
    pub bound: Vec<Value>,
}

/// A read-only host-defined field bag.
#[derive(Debug, Clone)]
pub struct Internal {
    pub fields: IndexMap<String, Value>,
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Num(BigDecimal),
    Str(Rc<str>),
    Bool(bool),
    Regex(VRegex),
    Vec(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<IndexMap<String, Value>>>),
    Range(Rc<VRange>),
    /// The `any` singleton.
    Any,
    /// The spread filter sentinel; falsy and invisible in collected output.
    Hole,
    Type(ValueType),
    CompoundType(Rc<CompoundType>),
    Concrete(Rc<ConcreteFunction>),
    Builtin(Builtin),
    Generic(Rc<RefCell<GenericFunction>>),
    Partial(Rc<Partial>),
    Box(Rc<BoxTemplate>),
    Instance(Rc<BoxInstance>),
    Lambda(Rc<VLambda>),
    Internal(Rc<Internal>),
}

impl Value {
    /// Builds a Str value.
    pub fn str(s: impl AsRef<str>) -> Self {
        Self::Str(Rc::from(s.as_ref()))
    }

    /// Builds a Vec value.
    #[must_use]
    pub fn vec(items: Vec<Self>) -> Self {
        Self::Vec(Rc::new(RefCell::new(items)))
    }

    /// Builds a Map value.
    #[must_use]
    pub fn map(pairs: IndexMap<String, Self>) -> Self {
        Self::Map(Rc::new(RefCell::new(pairs)))
    }

    /// The category this value belongs to.
    #[must_use]
    pub fn type_of(&self) -> ValueType {
        match self {
            Self::Num(_) => ValueType::Num,
            Self::Str(_) => ValueType::Str,
            Self::Bool(_) => ValueType::Bool,
            Self::Regex(_) => ValueType::Regex,
            Self::Vec(_) => ValueType::Vec,
            Self::Map(_) => ValueType::Map,
            Self::Range(_) => ValueType::Range,
            Self::Any => ValueType::Any,
            Self::Hole => ValueType::Hole,
            Self::Type(_) | Self::CompoundType(_) => ValueType::Type,
            Self::Concrete(_) | Self::Builtin(_) | Self::Generic(_) | Self::Partial(_) => ValueType::Function,
            Self::Box(_) => ValueType::Box,
            Self::Instance(_) => ValueType::Instance,
            Self::Lambda(_) => ValueType::Lambda,
            Self::Internal(_) => ValueType::Internal,
        }
    }

    /// `true?`: the value's truthiness.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Num(n) => !n.is_zero(),
            Self::Str(s) => !s.is_empty(),
            Self::Vec(items) => !items.borrow().is_empty(),
            Self::Map(pairs) => !pairs.borrow().is_empty(),
            Self::Hole => false,
            _ => true,
        }
    }

    /// `to_num`: numeric coercion.
    pub fn to_num(&self) -> Result<BigDecimal, ModelCastError> {
        match self {
            Self::Num(n) => Ok(n.clone()),
            Self::Bool(b) => Ok(BigDecimal::from(u8::from(*b))),
            Self::Str(s) => s
                .trim()
                .parse::<BigDecimal>()
                .map_err(|_| ModelCastError::new(format!("cannot make a num out of {s:?}"))),
            other => Err(ModelCastError::new(format!(
                "cannot make a num out of a {}",
                other.type_of()
            ))),
        }
    }

    /// `to_vec`: sequence coercion. Everything converts; scalars wrap.
    pub fn to_vec(&self) -> Result<Vec<Self>, ModelCastError> {
        match self {
            Self::Vec(items) => Ok(items.borrow().clone()),
            Self::Range(range) => range.enumerate(),
            Self::Str(s) => Ok(s.chars().map(|c| Self::str(c.to_string())).collect()),
            Self::Map(pairs) => Ok(pairs.borrow().keys().map(Self::str).collect()),
            other => Ok(vec![other.clone()]),
        }
    }

    /// `length`: element count; scalars count one.
    pub fn length(&self) -> Result<usize, ModelCastError> {
        match self {
            Self::Str(s) => Ok(s.chars().count()),
            Self::Vec(items) => Ok(items.borrow().len()),
            Self::Map(pairs) => Ok(pairs.borrow().len()),
            Self::Range(range) => Ok(range.enumerate()?.len()),
            _ => Ok(1),
        }
    }

    /// Value equality: structural, disjoint from `is?` semantics.
    #[must_use]
    pub fn eqv(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Num(a), Self::Num(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a == b,
            (Self::Vec(a), Self::Vec(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eqv(y))
            }
            (Self::Map(a), Self::Map(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter()
                        .all(|(key, value)| b.get(key).is_some_and(|other| value.eqv(other)))
            }
            (Self::Range(a), Self::Range(b)) => a == b,
            (Self::Any, Self::Any) | (Self::Hole, Self::Hole) => true,
            (Self::Type(a), Self::Type(b)) => a == b,
            (Self::CompoundType(a), Self::CompoundType(b)) => a.eqv(b),
            (Self::Concrete(a), Self::Concrete(b)) => Rc::ptr_eq(a, b),
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::Generic(a), Self::Generic(b)) => Rc::ptr_eq(a, b),
            (Self::Partial(a), Self::Partial(b)) => Rc::ptr_eq(a, b),
            (Self::Box(a), Self::Box(b)) => Rc::ptr_eq(a, b),
            (Self::Instance(a), Self::Instance(b)) => Rc::ptr_eq(a, b),
            (Self::Lambda(a), Self::Lambda(b)) => Rc::ptr_eq(a, b),
            (Self::Internal(a), Self::Internal(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The dispatch weight of this value when used as a given.
    ///
    /// Ascending: anonymous any, any, anonymous type, abstract type,
    /// concrete type, anonymous value, value. Anonymity costs one point.
    #[must_use]
    pub fn weight(&self, anonymous: bool) -> u32 {
        match self {
            Self::Any => {
                if anonymous {
                    1
                } else {
                    2
                }
            }
            Self::Type(t) => {
                if anonymous {
                    3
                } else if t.is_abstract() {
                    4
                } else {
                    5
                }
            }
            Self::CompoundType(_) => {
                if anonymous {
                    3
                } else {
                    4
                }
            }
            _ => {
                if anonymous {
                    6
                } else {
                    7
                }
            }
        }
    }

    /// The quoted, container-friendly rendering.
    fn repr(&self, out: &mut String) {
        match self {
            Self::Str(s) => {
                let _ = write!(out, "{s:?}");
            }
            Self::Regex(r) => {
                let _ = write!(out, "`{}`", r.source);
            }
            other => {
                let _ = write!(out, "{other}");
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{}", n.clone().normalized()),
            Self::Str(s) => write!(f, "{s}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Regex(r) => write!(f, "`{}`", r.source),
            Self::Vec(items) => {
                let mut out = String::from("[");
                for (index, item) in items.borrow().iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    item.repr(&mut out);
                }
                out.push(']');
                f.write_str(&out)
            }
            Self::Map(pairs) => {
                let mut out = String::from("%{");
                for (index, (key, value)) in pairs.borrow().iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{key}: ");
                    value.repr(&mut out);
                }
                out.push('}');
                f.write_str(&out)
            }
            Self::Range(range) => match (&range.start, &range.end) {
                (Some(start), Some(end)) => write!(f, "{start} to {end}"),
                (Some(start), None) => write!(f, "from {start}"),
                (None, Some(end)) => write!(f, "to {end}"),
                (None, None) => write!(f, "from to"),
            },
            Self::Any => write!(f, "any"),
            Self::Hole => write!(f, "hole"),
            Self::Type(t) => write!(f, "type {t}"),
            Self::CompoundType(t) => write!(f, "type {}", t.lead),
            Self::Concrete(fun) => write!(f, "fun {}/{}", fun.name, fun.arity),
            Self::Builtin(builtin) => write!(f, "builtin {}", builtin.name()),
            Self::Generic(generic) => {
                let generic = generic.borrow();
                write!(f, "generic {} with {} variant(s)", generic.name, generic.variants.len())
            }
            Self::Partial(partial) => write!(f, "partial {}", partial.callee),
            Self::Box(template) => write!(f, "box {}", template.name),
            Self::Instance(instance) => write!(f, "instance of {}", instance.parent.name),
            Self::Lambda(lambda) => write!(f, "lambda/{}", lambda.arity),
            Self::Internal(_) => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_ladder_is_ascending() {
        let any = Value::Any;
        let abstract_type = Value::Type(ValueType::Function);
        let concrete_type = Value::Type(ValueType::Num);
        let value = Value::Num(3.into());
        assert_eq!(any.weight(true), 1);
        assert_eq!(any.weight(false), 2);
        assert_eq!(concrete_type.weight(true), 3);
        assert_eq!(abstract_type.weight(false), 4);
        assert_eq!(concrete_type.weight(false), 5);
        assert_eq!(value.weight(true), 6);
        assert_eq!(value.weight(false), 7);
    }

    fn variant(name: &str, specificity: u32, given: Value) -> Rc<ConcreteFunction> {
        Rc::new(ConcreteFunction {
            name: name.to_owned(),
            target: 0,
            params: vec!["x".to_owned()],
            givens: vec![given],
            arity: 1,
            slurpy: false,
            contextual: None,
            specificity,
        })
    }

    #[test]
    fn variants_sort_by_descending_specificity() {
        let mut generic = GenericFunction::new("g");
        generic.add(variant("g", 2, Value::Any));
        generic.add(variant("g", 7, Value::Num(1.into())));
        generic.add(variant("g", 5, Value::Type(ValueType::Num)));
        let weights: Vec<u32> = generic.variants.iter().map(|v| v.specificity).collect();
        assert_eq!(weights, vec![7, 5, 2]);
    }

    #[test]
    fn equal_specificity_keeps_insertion_order() {
        let mut generic = GenericFunction::new("g");
        let first = variant("g", 5, Value::Type(ValueType::Num));
        let second = variant("g", 5, Value::Type(ValueType::Str));
        generic.add(Rc::clone(&first));
        generic.add(Rc::clone(&second));
        assert!(Rc::ptr_eq(&generic.variants[0], &first));
        assert!(Rc::ptr_eq(&generic.variants[1], &second));
    }

    #[test]
    fn same_signature_redefinition_replaces() {
        let mut generic = GenericFunction::new("g");
        generic.add(variant("g", 5, Value::Type(ValueType::Num)));
        let replacement = variant("g", 5, Value::Type(ValueType::Num));
        generic.add(Rc::clone(&replacement));
        assert_eq!(generic.variants.len(), 1);
        assert!(Rc::ptr_eq(&generic.variants[0], &replacement));
    }

    #[test]
    fn oversized_range_refuses_enumeration() {
        let range = VRange::full(0.into(), 200_000.into());
        assert!(range.enumerate().is_err());
    }

    #[test]
    fn range_enumeration_is_inclusive() {
        let range = VRange::full(1.into(), 3.into());
        let items = range.enumerate().unwrap();
        assert_eq!(items.len(), 3);
        assert!(items[2].eqv(&Value::Num(3.into())));
    }

    #[test]
    fn eqv_is_structural_for_containers() {
        let a = Value::vec(vec![Value::Num(1.into()), Value::str("x")]);
        let b = Value::vec(vec![Value::Num(1.into()), Value::str("x")]);
        assert!(a.eqv(&b));
        assert!(!a.eqv(&Value::vec(vec![Value::Num(1.into())])));
    }
}
