//! Quotes are the tree the reader produces and every later stage consumes.
//!
//! A [`Quote`] pairs a [`QTag`] (file and line) with a [`QuoteKind`]
//! discriminant. The tree is plain owned data: cloning a quote deep-clones
//! the subtree, which is exactly what read-time macro expansion needs.

use std::rc::Rc;

use bigdecimal::BigDecimal;

use crate::error::{ReadError, ReadResult};

/// Source position carried by every quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QTag {
    pub file: Rc<str>,
    pub line: u32,
}

impl QTag {
    pub fn new(file: &Rc<str>, line: u32) -> Self {
        Self {
            file: Rc::clone(file),
            line,
        }
    }
}

/// Field access path step in `a.b`, `a.(expr)` and `a.[x, y]`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldAccessor {
    /// A literal field name: `a.b`.
    Immediate(String),
    /// A computed field name: `a.(expr)`.
    Dynamic(Quote),
    /// A branching access producing a vector: `a.[x, y]`.
    Branches(Vec<FieldAccessor>),
}

/// Scope selector of a `next` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextScope {
    Fun,
    Loop,
}

/// One declared parameter of a fun, box, lambda or macro.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Position in the declaration, 0-based.
    pub index: usize,
    /// The binding name. Anonymous parameters (`_`, bare `*`) have none.
    pub name: Option<String>,
    /// A given expression attached positionally, once zipped.
    pub given: Option<Quote>,
    /// A `*`-parameter capturing trailing arguments as a vector.
    pub slurpy: bool,
    /// An anonymous `_` parameter: takes part in arity, binds nothing.
    pub underscore: bool,
    /// An `&`-parameter bound from the caller's superlocal instead of a
    /// positional argument.
    pub contextual: bool,
    /// A pattern standing in parameter position; compiled into the
    /// parameter's given.
    pub pattern: Option<Box<Quote>>,
}

impl Parameter {
    #[must_use]
    pub fn named(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: Some(name.into()),
            given: None,
            slurpy: false,
            underscore: false,
            contextual: false,
            pattern: None,
        }
    }

    /// Whether the parameter scores as anonymous for specificity purposes.
    #[must_use]
    pub fn anonymous(&self) -> bool {
        self.name.is_none() || self.underscore
    }
}

/// A validated parameter list.
///
/// Construction enforces the structural invariants: at most one slurpy, at
/// most one contextual, and the slurpy (if present) is last.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Parameters {
    items: Vec<Parameter>,
}

impl Parameters {
    pub fn new(items: Vec<Parameter>, file: &str, line: u32) -> ReadResult<Self> {
        let slurpies = items.iter().filter(|p| p.slurpy).count();
        if slurpies > 1 {
            return Err(ReadError::new("more than one slurpy parameter", file, line));
        }
        if slurpies == 1 && !items.last().is_some_and(|p| p.slurpy) {
            return Err(ReadError::new("the slurpy parameter must be last", file, line));
        }
        if items.iter().filter(|p| p.contextual).count() > 1 {
            return Err(ReadError::new("more than one contextual parameter", file, line));
        }
        Ok(Self { items })
    }

    #[must_use]
    pub fn items(&self) -> &[Parameter] {
        &self.items
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list ends with a slurpy parameter.
    #[must_use]
    pub fn slurpy(&self) -> bool {
        self.items.last().is_some_and(|p| p.slurpy)
    }

    /// Number of fixed positional parameters (slurpy and contextual ones
    /// excluded).
    #[must_use]
    pub fn fixed_arity(&self) -> usize {
        self.items.iter().filter(|p| !p.slurpy && !p.contextual).count()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Parameter> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Parameter> {
        self.items.iter_mut()
    }
}

/// An AST node.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub tag: QTag,
    pub kind: QuoteKind,
}

impl Quote {
    pub fn new(tag: QTag, kind: QuoteKind) -> Self {
        Self { tag, kind }
    }

    /// Shorthand for a runtime symbol quote.
    pub fn symbol(tag: QTag, name: impl Into<String>) -> Self {
        Self::new(tag, QuoteKind::Symbol(name.into()))
    }

    /// Whether this quote is a statement form, i.e. only legal at statement
    /// position. Used to validate macro expansions.
    #[must_use]
    pub fn is_statement(&self) -> bool {
        matches!(
            self.kind,
            QuoteKind::Fun { .. }
                | QuoteKind::Box { .. }
                | QuoteKind::ImmediateBox(_)
                | QuoteKind::EnsureTest { .. }
                | QuoteKind::ReturnStatement(_)
                | QuoteKind::ReturnQueue
                | QuoteKind::Next { .. }
                | QuoteKind::Queue(_)
                | QuoteKind::Loop { .. }
        )
    }

    /// Substitutes read-time symbols with bound quotes, in place.
    ///
    /// This is the macro expansion visitor: every `$name` occurrence whose
    /// name appears in `bindings` is replaced by a deep clone of the bound
    /// quote. Unbound read-time symbols are left untouched; the transformer
    /// rejects any that leak through to compilation.
    pub fn expand_readtime(&mut self, bindings: &ahash::AHashMap<String, Quote>) {
        if let QuoteKind::ReadtimeSymbol(name) = &self.kind {
            if let Some(bound) = bindings.get(name) {
                let tag = self.tag.clone();
                *self = bound.clone();
                self.tag = tag;
            }
            return;
        }
        self.visit_children_mut(&mut |child| child.expand_readtime(bindings));
    }

    /// Applies `visit` to every direct child quote, mutably.
    pub fn visit_children_mut(&mut self, visit: &mut impl FnMut(&mut Quote)) {
        match &mut self.kind {
            QuoteKind::Symbol(_)
            | QuoteKind::ReadtimeSymbol(_)
            | QuoteKind::Number(_)
            | QuoteKind::Str(_)
            | QuoteKind::Regex(_)
            | QuoteKind::ReturnIncrement(_)
            | QuoteKind::ReturnDecrement(_)
            | QuoteKind::ReturnQueue
            | QuoteKind::Hole
            | QuoteKind::True
            | QuoteKind::False
            | QuoteKind::SuperlocalTake
            | QuoteKind::SuperlocalTap => {}
            QuoteKind::Vector { items } => {
                for item in items {
                    visit(item);
                }
            }
            QuoteKind::FilterOver { vector, predicate } => {
                visit(vector);
                visit(predicate);
            }
            QuoteKind::Map { pairs } => {
                for (key, value) in pairs {
                    if let MapKey::Expr(key) = key {
                        visit(key);
                    }
                    visit(value);
                }
            }
            QuoteKind::Unary { operand, .. } => visit(operand),
            QuoteKind::Binary { left, right, .. } => {
                visit(left);
                visit(right);
            }
            QuoteKind::Call { callee, args } | QuoteKind::Access { head: callee, args } => {
                visit(callee);
                for arg in args {
                    visit(arg);
                }
            }
            QuoteKind::AccessField { head, path } => {
                visit(head);
                for accessor in path.iter_mut() {
                    visit_accessor(accessor, visit);
                }
            }
            QuoteKind::Assign { target, value, .. } => {
                visit(target);
                visit(value);
            }
            QuoteKind::BinaryAssign { target, value, .. } => {
                visit(target);
                visit(value);
            }
            QuoteKind::IntoBool(inner)
            | QuoteKind::Dies(inner)
            | QuoteKind::Queue(inner)
            | QuoteKind::Ensure(inner)
            | QuoteKind::PatternEnvelope(inner)
            | QuoteKind::QuoteEnvelope(inner)
            | QuoteKind::ReadtimeEnvelope(inner)
            | QuoteKind::ReturnStatement(inner)
            | QuoteKind::ReturnExpression(inner)
            | QuoteKind::ImmediateBox(inner) => visit(inner),
            QuoteKind::If { cond, suc, alt } => {
                visit(cond);
                visit(suc);
                if let Some(alt) = alt {
                    visit(alt);
                }
            }
            QuoteKind::Block(statements) | QuoteKind::Group(statements) => {
                for statement in statements {
                    visit(statement);
                }
            }
            QuoteKind::Fun { params, givens, body, .. } => {
                for param in params.iter_mut() {
                    if let Some(pattern) = &mut param.pattern {
                        visit(pattern);
                    }
                }
                for given in givens {
                    visit(given);
                }
                for statement in body {
                    visit(statement);
                }
            }
            QuoteKind::Box { params, givens, fields, .. } => {
                for param in params.iter_mut() {
                    if let Some(pattern) = &mut param.pattern {
                        visit(pattern);
                    }
                }
                for given in givens {
                    visit(given);
                }
                for (_, value) in fields {
                    visit(value);
                }
            }
            QuoteKind::Lambda { body, .. } => visit(body),
            QuoteKind::Loop { start, base, step, body } => {
                for part in [start, base, step].into_iter().flatten() {
                    visit(part);
                }
                visit(body);
            }
            QuoteKind::Next { args, .. } => {
                for arg in args {
                    visit(arg);
                }
            }
            QuoteKind::EnsureTest { title, cases } => {
                visit(title);
                for case in cases {
                    visit(case);
                }
            }
            QuoteKind::EnsureShould { cases, .. } => {
                for case in cases {
                    visit(case);
                }
            }
            QuoteKind::MapSpread { operator, operand, .. } => {
                visit(operator);
                visit(operand);
            }
            QuoteKind::ReduceSpread { operand, .. } => visit(operand),
        }
    }
}

fn visit_accessor(accessor: &mut FieldAccessor, visit: &mut impl FnMut(&mut Quote)) {
    match accessor {
        FieldAccessor::Immediate(_) => {}
        FieldAccessor::Dynamic(quote) => visit(quote),
        FieldAccessor::Branches(branches) => {
            for branch in branches {
                visit_accessor(branch, visit);
            }
        }
    }
}

/// A map literal key: a literal string or a computed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum MapKey {
    Str(String),
    Expr(Quote),
}

/// The quote discriminant.
#[derive(Debug, Clone, PartialEq)]
pub enum QuoteKind {
    /// A runtime symbol reference.
    Symbol(String),
    /// A `$name` read-time symbol; legal only inside macro bodies.
    ReadtimeSymbol(String),
    /// Arbitrary-precision decimal literal.
    Number(BigDecimal),
    /// String literal, escapes and interpolation already resolved into the
    /// surrounding tree.
    Str(String),
    /// Regex literal source.
    Regex(String),
    Vector {
        items: Vec<Quote>,
    },
    /// `[items | predicate]`: keep the elements the predicate accepts.
    FilterOver {
        vector: Box<Quote>,
        predicate: Box<Quote>,
    },
    Map {
        pairs: Vec<(MapKey, Quote)>,
    },
    Unary {
        op: &'static str,
        operand: Box<Quote>,
    },
    Binary {
        op: String,
        left: Box<Quote>,
        right: Box<Quote>,
    },
    Call {
        callee: Box<Quote>,
        args: Vec<Quote>,
    },
    /// `a[b, c]` subscript access; invocation semantics decide at runtime.
    Access {
        head: Box<Quote>,
        args: Vec<Quote>,
    },
    AccessField {
        head: Box<Quote>,
        path: Vec<FieldAccessor>,
    },
    Assign {
        target: Box<Quote>,
        value: Box<Quote>,
        /// `:=` writes the global scope; `=` the nearest binding.
        global: bool,
    },
    BinaryAssign {
        op: String,
        target: Box<Quote>,
        value: Box<Quote>,
    },
    /// The `?` postfix: truthiness of the operand.
    IntoBool(Box<Quote>),
    /// `x++`: yields the old value, then increments the binding.
    ReturnIncrement(String),
    /// `x--`: yields the old value, then decrements the binding.
    ReturnDecrement(String),
    /// The `dies` postfix: true when the operand's evaluation died.
    Dies(Box<Quote>),
    If {
        cond: Box<Quote>,
        suc: Box<Quote>,
        alt: Option<Box<Quote>>,
    },
    /// `{ … }`: a sequence evaluating to its last statement.
    Block(Vec<Quote>),
    /// A spliced statement sequence (macro expansion, lowering).
    Group(Vec<Quote>),
    Fun {
        name: String,
        params: Parameters,
        givens: Vec<Quote>,
        body: Vec<Quote>,
    },
    Box {
        name: String,
        params: Parameters,
        givens: Vec<Quote>,
        fields: Vec<(String, Quote)>,
    },
    Lambda {
        params: Parameters,
        body: Box<Quote>,
    },
    Loop {
        start: Option<Box<Quote>>,
        base: Option<Box<Quote>>,
        step: Option<Box<Quote>>,
        body: Box<Quote>,
    },
    Next {
        scope: Option<NextScope>,
        args: Vec<Quote>,
    },
    /// `return expr;` as a statement: returns from the enclosing function.
    ReturnStatement(Box<Quote>),
    /// `return expr` in expression position.
    ReturnExpression(Box<Quote>),
    /// `return queue;`: returns the accumulated queue.
    ReturnQueue,
    /// `queue expr;`: appends to the frame's queue.
    Queue(Box<Quote>),
    /// `ensure expr`: dies unless the expression holds.
    Ensure(Box<Quote>),
    /// `ensure "title" { should … }` test block.
    EnsureTest {
        title: Box<Quote>,
        cases: Vec<Quote>,
    },
    /// `should "case" expr…` inside an ensure test.
    EnsureShould {
        title: String,
        cases: Vec<Quote>,
    },
    /// `'expr` in a read-time body: the quoted tree itself.
    QuoteEnvelope(Box<Quote>),
    /// `'pattern`: compiled into a verification lambda by the transformer.
    PatternEnvelope(Box<Quote>),
    /// `|f| v` and `|f|: v`.
    MapSpread {
        operator: Box<Quote>,
        operand: Box<Quote>,
        iterative: bool,
    },
    /// `|+| v`: fold the vector with a binary operator.
    ReduceSpread {
        op: String,
        operand: Box<Quote>,
    },
    /// `immediate box Name { … }`.
    ImmediateBox(Box<Quote>),
    /// `<expr>` inside a read-time body, evaluated at expansion.
    ReadtimeEnvelope(Box<Quote>),
    /// The `hole` filter sentinel.
    Hole,
    True,
    False,
    /// `_`: consume one superlocal value.
    SuperlocalTake,
    /// `&_`: peek at the superlocal top.
    SuperlocalTap,
}

#[cfg(test)]
mod tests {
    use ahash::AHashMap;

    use super::*;

    fn tag() -> QTag {
        QTag {
            file: Rc::from("test.vsp"),
            line: 1,
        }
    }

    #[test]
    fn parameters_reject_double_slurpy() {
        let mut a = Parameter::named(0, "a");
        a.slurpy = true;
        let mut b = Parameter::named(1, "b");
        b.slurpy = true;
        assert!(Parameters::new(vec![a, b], "test.vsp", 1).is_err());
    }

    #[test]
    fn parameters_require_slurpy_last() {
        let mut a = Parameter::named(0, "a");
        a.slurpy = true;
        let b = Parameter::named(1, "b");
        assert!(Parameters::new(vec![a, b], "test.vsp", 1).is_err());
    }

    #[test]
    fn readtime_expansion_replaces_bound_symbols() {
        let mut body = Quote::new(
            tag(),
            QuoteKind::Binary {
                op: "+".to_owned(),
                left: Box::new(Quote::new(tag(), QuoteKind::ReadtimeSymbol("a".to_owned()))),
                right: Box::new(Quote::new(tag(), QuoteKind::ReadtimeSymbol("b".to_owned()))),
            },
        );
        let mut bindings = AHashMap::new();
        bindings.insert("a".to_owned(), Quote::new(tag(), QuoteKind::Number(1.into())));
        body.expand_readtime(&bindings);
        match &body.kind {
            QuoteKind::Binary { left, right, .. } => {
                assert_eq!(left.kind, QuoteKind::Number(1.into()));
                assert_eq!(right.kind, QuoteKind::ReadtimeSymbol("b".to_owned()));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
