//! The quote-to-chunk compiler.
//!
//! A tagged-dispatch visitor over transformed quotes. Every unit compiles
//! into chunk 0 plus one chunk per fun, box and lambda body. The compiler
//! tracks scope depth to assign symbol nests: 0 is the global scope, -1 a
//! dynamic lookup, anything else the declaration depth.
//!
//! Compile errors carry the traces accumulated by the guards around nested
//! body compilation, so a failure deep inside `fun a { fun b { … } }`
//! reports the whole chain.

use std::rc::Rc;

use ahash::AHashSet;

use crate::{
    error::{CompileError, CompileResult, Trace},
    quote::{FieldAccessor, MapKey, NextScope, Parameter, Quote, QuoteKind},
    bytecode::{
        chunk::{Chunk, Label, VFunction, VStatic, VSymbol},
        op::Opcode,
    },
};

/// The name a bare slurpy parameter binds its vector to.
const SLURPY_NAME: &str = "rest";

/// Context for `next loop` jumps.
struct LoopContext {
    continue_label: Label,
}

/// Compiles one unit's quotes into chunks.
pub struct Compiler {
    file: Rc<str>,
    chunks: Vec<Chunk>,
    /// Index of the chunk being emitted into.
    current: usize,
    /// Names declared per scope depth; depth 0 is the global scope.
    scopes: Vec<AHashSet<String>>,
    /// Enclosing loops of the body being compiled.
    loops: Vec<LoopContext>,
    /// Trace guards around nested body compilation, outermost first.
    traces: Vec<Trace>,
}

impl Compiler {
    /// Creates a compiler whose global scope already holds `globals`.
    pub fn new(file: &Rc<str>, unit_name: &str, globals: impl IntoIterator<Item = String>) -> Self {
        let mut global_scope = AHashSet::new();
        global_scope.extend(globals);
        Self {
            chunks: vec![Chunk::new(file, unit_name)],
            file: Rc::clone(file),
            current: 0,
            scopes: vec![global_scope],
            loops: Vec::new(),
            traces: Vec::new(),
        }
    }

    /// Compiles the unit body, returning the chunk list.
    ///
    /// The unit evaluates to its last statement's value, or false when it
    /// has no statements.
    pub fn compile(mut self, quotes: &[Quote]) -> CompileResult<Vec<Chunk>> {
        self.body(quotes, 1)?;
        self.emit(Opcode::Ret, None, last_line(quotes));
        Ok(self.chunks)
    }

    // ------------------------------------------------------------------
    // Emission helpers
    // ------------------------------------------------------------------

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.chunks[self.current]
    }

    fn emit(&mut self, opcode: Opcode, arg: Option<i32>, line: u32) {
        self.chunk().emit(opcode, arg, line);
    }

    fn emit_label(&mut self, opcode: Opcode, label: Label, line: u32) {
        self.chunk().emit_label(opcode, label, line);
    }

    fn emit_static(&mut self, opcode: Opcode, payload: VStatic, line: u32) {
        let arg = self.chunk().add_static(payload);
        self.emit(opcode, Some(arg), line);
    }

    fn emit_symbol(&mut self, opcode: Opcode, symbol: VSymbol, line: u32) {
        let arg = self.chunk().add_symbol(symbol);
        self.emit(opcode, Some(arg), line);
    }

    fn die(&self, message: impl Into<String>, line: u32) -> CompileError {
        let mut error = CompileError::new(message, self.file.as_ref(), line);
        error.traces = self.traces.clone();
        error
    }

    // ------------------------------------------------------------------
    // Scope bookkeeping
    // ------------------------------------------------------------------

    /// The nest of a symbol read: its declaration depth, or -1 for a
    /// dynamic innermost-outward lookup.
    fn nest_of(&self, name: &str) -> i32 {
        for (depth, scope) in self.scopes.iter().enumerate().rev() {
            if scope.contains(name) {
                return i32::try_from(depth).unwrap_or(-1);
            }
        }
        -1
    }

    /// The nest of an assignment target, declaring the name if fresh.
    fn assign_nest(&mut self, name: &str, global: bool) -> i32 {
        if global {
            self.scopes[0].insert(name.to_owned());
            return 0;
        }
        let existing = self.nest_of(name);
        if existing >= 0 {
            return existing;
        }
        let depth = self.scopes.len() - 1;
        self.scopes[depth].insert(name.to_owned());
        i32::try_from(depth).unwrap_or(-1)
    }

    fn declare_here(&mut self, name: &str) -> i32 {
        let depth = self.scopes.len() - 1;
        self.scopes[depth].insert(name.to_owned());
        i32::try_from(depth).unwrap_or(-1)
    }

    // ------------------------------------------------------------------
    // Statements and bodies
    // ------------------------------------------------------------------

    /// Emits a statement sequence leaving one value: the last statement's,
    /// or false when the sequence is empty.
    fn body(&mut self, quotes: &[Quote], line: u32) -> CompileResult<()> {
        if quotes.is_empty() {
            self.emit(Opcode::False, None, line);
            return Ok(());
        }
        for (index, quote) in quotes.iter().enumerate() {
            self.quote(quote)?;
            if index + 1 < quotes.len() {
                self.emit(Opcode::Pop, None, quote.tag.line);
            }
        }
        Ok(())
    }

    /// Emits one quote, leaving exactly one value on the stack (except for
    /// forms that never fall through).
    fn quote(&mut self, quote: &Quote) -> CompileResult<()> {
        let line = quote.tag.line;
        match &quote.kind {
            QuoteKind::Symbol(name) => {
                let nest = self.nest_of(name);
                self.emit_symbol(Opcode::Sym, VSymbol::new(name, nest), line);
            }
            QuoteKind::Number(n) => self.emit_static(Opcode::Num, VStatic::Num(n.clone()), line),
            QuoteKind::Str(s) => self.emit_static(Opcode::Str, VStatic::Str(s.clone()), line),
            QuoteKind::Regex(s) => self.emit_static(Opcode::Pcre, VStatic::Str(s.clone()), line),
            QuoteKind::True => self.emit(Opcode::True, None, line),
            QuoteKind::False => self.emit(Opcode::False, None, line),
            QuoteKind::Hole => self.emit(Opcode::Hole, None, line),
            QuoteKind::SuperlocalTake => self.emit(Opcode::Upop, None, line),
            QuoteKind::SuperlocalTap => self.emit(Opcode::Uref, None, line),
            QuoteKind::Vector { items } => {
                for item in items {
                    self.quote(item)?;
                }
                self.emit_static(Opcode::Vec, VStatic::Int(int(items.len())), line);
            }
            QuoteKind::Map { pairs } => {
                for (key, value) in pairs {
                    match key {
                        MapKey::Str(name) => self.emit_static(Opcode::Str, VStatic::Str(name.clone()), line),
                        MapKey::Expr(expr) => {
                            self.quote(expr)?;
                            self.emit(Opcode::Tos, None, line);
                        }
                    }
                    self.quote(value)?;
                }
                self.emit_static(Opcode::Map, VStatic::Int(int(pairs.len())), line);
            }
            QuoteKind::Unary { op, operand } => {
                match *op {
                    "to" => {
                        self.emit(Opcode::Hole, None, line);
                        self.quote(operand)?;
                        self.emit_static(Opcode::Binary, VStatic::Str("to".to_owned()), line);
                    }
                    "from" => {
                        self.quote(operand)?;
                        self.emit(Opcode::Hole, None, line);
                        self.emit_static(Opcode::Binary, VStatic::Str("to".to_owned()), line);
                    }
                    _ => {
                        self.quote(operand)?;
                        match *op {
                            "+" => self.emit(Opcode::Ton, None, line),
                            "-" => {
                                self.emit(Opcode::Ton, None, line);
                                self.emit(Opcode::Neg, None, line);
                            }
                            "~" => self.emit(Opcode::Tos, None, line),
                            "#" => self.emit(Opcode::Len, None, line),
                            "not" => self.emit(Opcode::Toib, None, line),
                            "&" => self.emit_static(Opcode::Vec, VStatic::Int(1), line),
                            other => return Err(self.die(format!("unknown unary operator: {other}"), line)),
                        }
                    }
                }
            }
            QuoteKind::Binary { op, left, right } => match op.as_str() {
                "and" => {
                    let end = self.chunk().label();
                    self.quote(left)?;
                    self.emit_label(Opcode::JifElsePop, end, line);
                    self.quote(right)?;
                    self.chunk().open(end);
                }
                "or" => {
                    let end = self.chunk().label();
                    self.quote(left)?;
                    self.emit_label(Opcode::JitElsePop, end, line);
                    self.quote(right)?;
                    self.chunk().open(end);
                }
                _ => {
                    self.quote(left)?;
                    self.quote(right)?;
                    self.emit_static(Opcode::Binary, VStatic::Str(op.clone()), line);
                }
            },
            QuoteKind::Call { callee, args } | QuoteKind::Access { head: callee, args } => {
                self.quote(callee)?;
                for arg in args {
                    self.quote(arg)?;
                }
                self.emit_static(Opcode::Call, VStatic::Int(int(args.len())), line);
            }
            QuoteKind::AccessField { head, path } => {
                self.quote(head)?;
                for accessor in path {
                    self.accessor(accessor, line)?;
                }
            }
            QuoteKind::Assign { target, value, global } => match &target.kind {
                QuoteKind::Symbol(name) => {
                    self.quote(value)?;
                    let nest = self.assign_nest(name, *global);
                    self.emit_symbol(Opcode::SetTap, VSymbol::new(name, nest), line);
                }
                QuoteKind::AccessField { head, path } => {
                    self.field_assign(head, path, value, line)?;
                }
                _ => return Err(self.die("this cannot be assigned to", line)),
            },
            QuoteKind::BinaryAssign { op, target, value } => match &target.kind {
                QuoteKind::Symbol(name) => {
                    let nest = self.nest_of(name);
                    self.emit_symbol(Opcode::Sym, VSymbol::new(name, nest), line);
                    self.quote(value)?;
                    self.emit_static(Opcode::Binary, VStatic::Str(op.clone()), line);
                    let nest = self.assign_nest(name, false);
                    self.emit_symbol(Opcode::SetTap, VSymbol::new(name, nest), line);
                }
                _ => return Err(self.die("this cannot be assigned to", line)),
            },
            QuoteKind::IntoBool(inner) => {
                self.quote(inner)?;
                self.emit(Opcode::Tob, None, line);
            }
            QuoteKind::ReturnIncrement(name) | QuoteKind::ReturnDecrement(name) => {
                let bump = if matches!(quote.kind, QuoteKind::ReturnIncrement(_)) {
                    Opcode::Inc
                } else {
                    Opcode::Dec
                };
                let nest = self.nest_of(name);
                self.emit_symbol(Opcode::Sym, VSymbol::new(name, nest), line);
                self.emit(Opcode::Dup, None, line);
                self.emit(Opcode::Ton, None, line);
                self.emit(bump, None, line);
                let nest = self.assign_nest(name, false);
                self.emit_symbol(Opcode::SetPop, VSymbol::new(name, nest), line);
            }
            QuoteKind::Dies(inner) => {
                let catch = self.chunk().label();
                let end = self.chunk().label();
                self.emit_label(Opcode::SetupDies, catch, line);
                self.quote(inner)?;
                self.emit(Opcode::EndDies, None, line);
                self.emit(Opcode::Pop, None, line);
                self.emit(Opcode::False, None, line);
                self.emit_label(Opcode::J, end, line);
                self.chunk().open(catch);
                self.emit(Opcode::True, None, line);
                self.chunk().open(end);
            }
            QuoteKind::If { cond, suc, alt } => {
                let fail = self.chunk().label();
                let end = self.chunk().label();
                self.quote(cond)?;
                self.emit_label(Opcode::Jif, fail, line);
                self.quote(suc)?;
                self.emit_label(Opcode::J, end, line);
                self.chunk().open(fail);
                match alt {
                    Some(alt) => self.quote(alt)?,
                    None => self.emit(Opcode::False, None, line),
                }
                self.chunk().open(end);
            }
            QuoteKind::Block(statements) | QuoteKind::Group(statements) => {
                self.body(statements, line)?;
            }
            QuoteKind::Fun {
                name,
                params,
                givens,
                body,
            } => {
                self.function(name, params.items(), givens, body, line, Definition::Fun)?;
            }
            QuoteKind::Box {
                name,
                params,
                givens,
                fields,
            } => {
                self.box_template(name, params.items(), givens, fields, line)?;
            }
            QuoteKind::Lambda { params, body } => {
                self.lambda(params.items(), body, line)?;
            }
            QuoteKind::Loop { start, base, step, body } => {
                self.loop_quote(start.as_deref(), base.as_deref(), step.as_deref(), body, line)?;
            }
            QuoteKind::Next { scope, args } => self.next(scope, args, line)?,
            QuoteKind::ReturnStatement(value) | QuoteKind::ReturnExpression(value) => {
                self.quote(value)?;
                self.emit(Opcode::Ret, None, line);
            }
            QuoteKind::ReturnQueue => {
                self.emit(Opcode::QueueVec, None, line);
                self.emit(Opcode::Ret, None, line);
            }
            QuoteKind::Queue(value) => {
                self.quote(value)?;
                self.emit(Opcode::Queue, None, line);
            }
            QuoteKind::Ensure(subject) => self.ensure(subject, None, line)?,
            QuoteKind::EnsureTest { title, cases } => {
                let suite = match &title.kind {
                    QuoteKind::Str(text) => text.clone(),
                    _ => "ensure".to_owned(),
                };
                for case in cases {
                    let QuoteKind::EnsureShould { title, cases } = &case.kind else {
                        return Err(self.die("an ensure block holds should cases only", case.tag.line));
                    };
                    let label = format!("{suite} should {title}");
                    for check in cases {
                        self.ensure(check, Some(&label), check.tag.line)?;
                        self.emit(Opcode::Pop, None, check.tag.line);
                    }
                }
                self.emit(Opcode::True, None, line);
            }
            QuoteKind::EnsureShould { .. } => {
                return Err(self.die("should is only legal inside an ensure block", line));
            }
            QuoteKind::MapSpread {
                operator,
                operand,
                iterative,
            } => self.map_spread(operator, operand, *iterative, line)?,
            QuoteKind::ReduceSpread { op, operand } => {
                self.quote(operand)?;
                self.emit(Opcode::Tov, None, line);
                self.emit_static(Opcode::Reduce, VStatic::Str(op.clone()), line);
            }
            QuoteKind::FilterOver { .. }
            | QuoteKind::PatternEnvelope(_)
            | QuoteKind::ImmediateBox(_)
            | QuoteKind::ReadtimeSymbol(_)
            | QuoteKind::ReadtimeEnvelope(_)
            | QuoteKind::QuoteEnvelope(_) => {
                return Err(self.die("an untransformed quote reached the compiler", line));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Field access
    // ------------------------------------------------------------------

    fn accessor(&mut self, accessor: &FieldAccessor, line: u32) -> CompileResult<()> {
        match accessor {
            FieldAccessor::Immediate(name) => {
                self.emit_static(Opcode::Field, VStatic::Str(name.clone()), line);
            }
            FieldAccessor::Dynamic(expr) => {
                self.quote(expr)?;
                self.emit(Opcode::Tos, None, line);
                self.emit(Opcode::FieldEval, None, line);
            }
            FieldAccessor::Branches(branches) => {
                // Resolve every branch against a copy of the head, then drop
                // the head and pack the results.
                for branch in branches {
                    self.emit(Opcode::Dup, None, line);
                    self.accessor(branch, line)?;
                    self.emit(Opcode::Swap, None, line);
                }
                self.emit(Opcode::Pop, None, line);
                self.emit_static(Opcode::Vec, VStatic::Int(int(branches.len())), line);
            }
        }
        Ok(())
    }

    /// `a.b.c = v` lowers onto `__access_assign` against the resolved head.
    fn field_assign(&mut self, head: &Quote, path: &[FieldAccessor], value: &Quote, line: u32) -> CompileResult<()> {
        let Some((last, walk)) = path.split_last() else {
            return Err(self.die("an empty field path cannot be assigned to", line));
        };
        let nest = self.nest_of("__access_assign");
        self.emit_symbol(Opcode::Sym, VSymbol::new("__access_assign", nest), line);
        self.quote(head)?;
        for accessor in walk {
            self.accessor(accessor, line)?;
        }
        self.quote(value)?;
        match last {
            FieldAccessor::Immediate(name) => {
                self.emit_static(Opcode::Str, VStatic::Str(name.clone()), line);
            }
            FieldAccessor::Dynamic(expr) => {
                self.quote(expr)?;
                self.emit(Opcode::Tos, None, line);
            }
            FieldAccessor::Branches(_) => {
                return Err(self.die("a branching field cannot be assigned to", line));
            }
        }
        self.emit_static(Opcode::Call, VStatic::Int(3), line);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ensure
    // ------------------------------------------------------------------

    /// `ensure expr` keeps the interesting operand: for a comparison the
    /// left side stays on the stack, otherwise the expression itself.
    fn ensure(&mut self, subject: &Quote, label: Option<&str>, line: u32) -> CompileResult<()> {
        let arg = label.map(|text| self.chunk().add_static(VStatic::Str(text.to_owned())));
        if let QuoteKind::Binary { op, left, right } = &subject.kind
            && matches!(op.as_str(), "is" | "in" | "<" | ">" | "<=" | ">=")
        {
            self.quote(left)?;
            self.emit(Opcode::Dup, None, line);
            self.quote(right)?;
            self.emit_static(Opcode::Binary, VStatic::Str(op.clone()), line);
            self.emit(Opcode::Ens, arg, line);
            return Ok(());
        }
        self.quote(subject)?;
        self.emit(Opcode::Dup, None, line);
        self.emit(Opcode::Ens, arg, line);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Functions, boxes, lambdas
    // ------------------------------------------------------------------

    /// Compiles a body chunk with the standard parameter prologue; returns
    /// the chunk index.
    fn body_chunk(
        &mut self,
        name: &str,
        params: &[Parameter],
        body: impl FnOnce(&mut Self) -> CompileResult<()>,
        line: u32,
    ) -> CompileResult<usize> {
        let target = self.chunks.len();
        self.chunks.push(Chunk::new(&self.file.clone(), name));
        let enclosing = std::mem::replace(&mut self.current, target);
        let enclosing_loops = std::mem::take(&mut self.loops);
        self.scopes.push(AHashSet::new());
        self.traces.push(Trace::new(name, self.file.as_ref(), line));

        for param in params {
            if param.slurpy {
                self.emit(Opcode::RemToVec, None, line);
            }
            if param.contextual {
                self.emit(Opcode::Ctx, None, line);
            }
            match binding_name(param) {
                Some(binding) => {
                    let nest = self.declare_here(&binding);
                    self.emit_symbol(Opcode::SetPop, VSymbol::new(binding, nest), line);
                }
                None => self.emit(Opcode::Pop, None, line),
            }
        }
        let result = body(self);

        self.traces.pop();
        self.scopes.pop();
        self.loops = enclosing_loops;
        self.current = enclosing;
        result?;
        Ok(target)
    }

    /// Emits a given expression.
    ///
    /// Unlike ordinary expressions, `or` at the top of a given is the type
    /// alternative: both sides evaluate and `BINARY or` joins them, so
    /// `given num or str` builds a compound type instead of short-circuiting
    /// to the first truthy operand.
    fn given(&mut self, quote: &Quote) -> CompileResult<()> {
        if let QuoteKind::Binary { op, left, right } = &quote.kind
            && op == "or"
        {
            self.given(left)?;
            self.given(right)?;
            self.emit_static(Opcode::Binary, VStatic::Str("or".to_owned()), quote.tag.line);
            return Ok(());
        }
        self.quote(quote)
    }

    /// The effective given quote for each parameter: its pattern lambda, the
    /// positional given, the last given repeated, or `any`.
    fn effective_givens<'q>(&self, params: &'q [Parameter], givens: &'q [Quote]) -> Vec<QuoteOrAny<'q>> {
        params
            .iter()
            .enumerate()
            .map(|(index, param)| {
                if let Some(pattern) = &param.pattern {
                    QuoteOrAny::Quote(pattern.as_ref())
                } else if index < givens.len() {
                    QuoteOrAny::Quote(&givens[index])
                } else if let Some(last) = givens.last() {
                    QuoteOrAny::Quote(last)
                } else {
                    QuoteOrAny::Any
                }
            })
            .collect()
    }

    fn function(
        &mut self,
        name: &str,
        params: &[Parameter],
        givens: &[Quote],
        body: &[Quote],
        line: u32,
        definition: Definition,
    ) -> CompileResult<()> {
        let target = self.body_chunk(
            name,
            params,
            |compiler| {
                compiler.body(body, line)?;
                compiler.emit(Opcode::Ret, None, last_line(body).max(line));
                Ok(())
            },
            line,
        )?;
        self.definition_tail(name, params, givens, target, line, definition)
    }

    fn box_template(
        &mut self,
        name: &str,
        params: &[Parameter],
        givens: &[Quote],
        fields: &[(String, Quote)],
        line: u32,
    ) -> CompileResult<()> {
        let fields = fields.to_vec();
        let target = self.body_chunk(
            name,
            params,
            |compiler| {
                for (field, value) in &fields {
                    compiler.quote(value)?;
                    let nest = compiler.declare_here(field);
                    compiler.emit_symbol(Opcode::SetPop, VSymbol::new(field, nest), value.tag.line);
                }
                compiler.emit(Opcode::BoxInstance, None, line);
                Ok(())
            },
            line,
        )?;
        self.definition_tail(name, params, givens, target, line, Definition::Box)
    }

    fn lambda(&mut self, params: &[Parameter], body: &Quote, line: u32) -> CompileResult<()> {
        let target = self.body_chunk(
            "lambda",
            params,
            |compiler| {
                compiler.quote(body)?;
                compiler.emit(Opcode::Ret, None, body.tag.line);
                Ok(())
            },
            line,
        )?;
        let payload = VFunction {
            symbol: VSymbol::new("lambda", -1),
            target: u32::try_from(target).unwrap_or(u32::MAX),
            params: params.iter().map(|p| binding_name(p).unwrap_or_else(|| "_".to_owned())).collect(),
            given: 0,
            arity: u32::try_from(fixed_arity(params)).unwrap_or(u32::MAX),
            slurpy: params.last().is_some_and(|p| p.slurpy),
            contextual: None,
        };
        let arg = self.chunk().add_function(payload);
        self.emit(Opcode::Lam, Some(arg), line);
        Ok(())
    }

    /// Emits the given values and the defining instruction back in the
    /// enclosing chunk.
    fn definition_tail(
        &mut self,
        name: &str,
        params: &[Parameter],
        givens: &[Quote],
        target: usize,
        line: u32,
        definition: Definition,
    ) -> CompileResult<()> {
        let effective = self.effective_givens(params, givens);
        for given in &effective {
            match given {
                QuoteOrAny::Quote(quote) => self.given(quote)?,
                QuoteOrAny::Any => {
                    let nest = self.nest_of("any");
                    self.emit_symbol(Opcode::Sym, VSymbol::new("any", nest), line);
                }
            }
        }
        let nest = self.assign_nest(name, false);
        let payload = VFunction {
            symbol: VSymbol::new(name, nest),
            target: u32::try_from(target).unwrap_or(u32::MAX),
            params: params
                .iter()
                .map(|p| binding_name(p).unwrap_or_else(|| "_".to_owned()))
                .collect(),
            given: u32::try_from(effective.len()).unwrap_or(u32::MAX),
            arity: u32::try_from(fixed_arity(params)).unwrap_or(u32::MAX),
            slurpy: params.last().is_some_and(|p| p.slurpy),
            contextual: params
                .iter()
                .find(|p| p.contextual)
                .and_then(|p| p.name.clone()),
        };
        let arg = self.chunk().add_function(payload);
        let opcode = match definition {
            Definition::Fun => Opcode::Fun,
            Definition::Box => Opcode::Box,
        };
        self.emit(opcode, Some(arg), line);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loops and next
    // ------------------------------------------------------------------

    fn loop_quote(
        &mut self,
        start: Option<&Quote>,
        base: Option<&Quote>,
        step: Option<&Quote>,
        body: &Quote,
        line: u32,
    ) -> CompileResult<()> {
        if let Some(start) = start {
            self.quote(start)?;
            self.emit(Opcode::Pop, None, line);
        }
        let head = self.chunk().label();
        let continue_label = self.chunk().label();
        let out = self.chunk().label();
        self.chunk().open(head);
        if let Some(base) = base {
            self.quote(base)?;
            self.emit_label(Opcode::Jif, out, line);
        }
        self.emit(Opcode::TryPop, None, line);
        self.loops.push(LoopContext { continue_label });
        let body_result = self.quote(body);
        self.loops.pop();
        body_result?;
        self.chunk().open(continue_label);
        if let Some(step) = step {
            self.quote(step)?;
            self.emit(Opcode::Pop, None, line);
        }
        self.emit_label(Opcode::J, head, line);
        self.chunk().open(out);
        self.emit(Opcode::FalseIfEmpty, None, line);
        Ok(())
    }

    fn next(&mut self, scope: &Option<NextScope>, args: &[Quote], line: u32) -> CompileResult<()> {
        match scope {
            Some(NextScope::Loop) => {
                if !args.is_empty() {
                    return Err(self.die("next loop does not take arguments", line));
                }
                let Some(context) = self.loops.last() else {
                    return Err(self.die("next loop outside of a loop", line));
                };
                let continue_label = context.continue_label;
                self.emit(Opcode::Clear, None, line);
                self.emit_label(Opcode::J, continue_label, line);
                // Unreachable, but keeps the one-value contract visible.
                self.emit(Opcode::False, None, line);
            }
            Some(NextScope::Fun) | None => {
                for arg in args {
                    self.quote(arg)?;
                }
                self.emit_static(Opcode::NextFun, VStatic::Int(int(args.len())), line);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Spreads
    // ------------------------------------------------------------------

    fn map_spread(&mut self, operator: &Quote, operand: &Quote, iterative: bool, line: u32) -> CompileResult<()> {
        self.quote(operand)?;
        self.emit(Opcode::Tov, None, line);
        self.emit_static(Opcode::Vec, VStatic::Int(0), line);
        let iter = self.chunk().label();
        let out = self.chunk().label();
        self.emit_label(Opcode::MapSetup, out, line);
        self.chunk().open(iter);
        self.emit_label(Opcode::MapIter, out, line);
        self.emit(Opcode::Uput, None, line);
        // A named callable is applied to the element; any other operator
        // expression consumes the element through the superlocal itself.
        if matches!(operator.kind, QuoteKind::Symbol(_) | QuoteKind::Lambda { .. }) {
            self.quote(operator)?;
            self.emit(Opcode::Upop, None, line);
            self.emit_static(Opcode::Call, VStatic::Int(1), line);
        } else {
            self.quote(operator)?;
        }
        self.emit(Opcode::MapAppend, None, line);
        self.emit_label(Opcode::J, iter, line);
        self.chunk().open(out);
        if iterative {
            // Keep the source, drop the accumulator.
            self.emit(Opcode::Pop, None, line);
        } else {
            // Keep the accumulator, drop the source.
            self.emit(Opcode::Pop2, None, line);
        }
        Ok(())
    }
}

/// Whether a definition is a fun or a box.
#[derive(Clone, Copy)]
enum Definition {
    Fun,
    Box,
}

enum QuoteOrAny<'q> {
    Quote(&'q Quote),
    Any,
}

/// The name a parameter binds, if it binds one.
fn binding_name(param: &Parameter) -> Option<String> {
    if param.underscore || param.pattern.is_some() {
        return None;
    }
    if param.slurpy {
        return Some(param.name.clone().unwrap_or_else(|| SLURPY_NAME.to_owned()));
    }
    param.name.clone()
}

/// Fixed positional arity: everything but the slurpy tail and the
/// contextual parameter.
fn fixed_arity(params: &[Parameter]) -> usize {
    params.iter().filter(|p| !p.slurpy && !p.contextual).count()
}

fn int(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn last_line(quotes: &[Quote]) -> u32 {
    quotes.last().map_or(1, |quote| quote.tag.line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read::Reader, transform::transform_all};

    fn compile(src: &str) -> Vec<Chunk> {
        let mut reader = Reader::new("test.vsp", src).unwrap();
        let mut quotes = reader.read().unwrap();
        transform_all(&mut quotes).unwrap();
        let file = Rc::from("test.vsp");
        Compiler::new(&file, "core", ["any".to_owned()]).compile(&quotes).unwrap()
    }

    fn opcodes(chunk: &Chunk) -> Vec<Opcode> {
        chunk.snippets.iter().flat_map(|s| s.code.iter().map(|i| i.opcode)).collect()
    }

    #[test]
    fn literals_and_binary_emit_in_order() {
        let chunks = compile("1 + 2");
        assert_eq!(
            opcodes(&chunks[0]),
            vec![Opcode::Num, Opcode::Num, Opcode::Binary, Opcode::Ret]
        );
    }

    #[test]
    fn fun_compiles_into_its_own_chunk() {
        let chunks = compile("fun add(a, b) given num, num = a + b;");
        assert_eq!(chunks.len(), 2);
        // The body chunk starts with the parameter prologue.
        let body = opcodes(&chunks[1]);
        assert_eq!(&body[..2], &[Opcode::SetPop, Opcode::SetPop]);
        assert_eq!(*body.last().unwrap(), Opcode::Ret);
        // The definition site pushes two givens, then defines.
        let core = opcodes(&chunks[0]);
        assert_eq!(core.iter().filter(|op| **op == Opcode::Sym).count(), 2);
        assert!(core.contains(&Opcode::Fun));
    }

    #[test]
    fn slurpy_prologue_gathers_the_rest() {
        let chunks = compile("fun f(a, *rest) = rest;");
        let body = opcodes(&chunks[1]);
        assert_eq!(&body[..3], &[Opcode::SetPop, Opcode::RemToVec, Opcode::SetPop]);
    }

    #[test]
    fn statements_are_separated_by_pops() {
        let chunks = compile("1; 2; 3");
        assert_eq!(
            opcodes(&chunks[0]),
            vec![Opcode::Num, Opcode::Pop, Opcode::Num, Opcode::Pop, Opcode::Num, Opcode::Ret]
        );
    }

    #[test]
    fn next_loop_with_arguments_is_unsupported() {
        let mut reader = Reader::new("test.vsp", "loop (true) { next loop 1; }").unwrap();
        let mut quotes = reader.read().unwrap();
        transform_all(&mut quotes).unwrap();
        let file = Rc::from("test.vsp");
        let result = Compiler::new(&file, "core", None).compile(&quotes);
        assert!(result.is_err());
        assert!(result.unwrap_err().message.contains("does not take arguments"));
    }

    #[test]
    fn next_loop_outside_a_loop_dies() {
        let mut reader = Reader::new("test.vsp", "next loop;").unwrap();
        let mut quotes = reader.read().unwrap();
        transform_all(&mut quotes).unwrap();
        let file = Rc::from("test.vsp");
        assert!(Compiler::new(&file, "core", None).compile(&quotes).is_err());
    }

    #[test]
    fn compile_errors_carry_traces_from_nested_bodies() {
        let src = "fun outer() { fun inner() { next loop; } }";
        let mut reader = Reader::new("test.vsp", src).unwrap();
        let mut quotes = reader.read().unwrap();
        transform_all(&mut quotes).unwrap();
        let file = Rc::from("test.vsp");
        let error = Compiler::new(&file, "core", None).compile(&quotes).unwrap_err();
        let names: Vec<&str> = error.traces.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["outer", "inner"]);
    }

    #[test]
    fn global_assign_targets_nest_zero() {
        let chunks = compile("a := 1");
        let chunk = &chunks[0];
        assert!(chunk.symbols.iter().any(|s| s.name == "a" && s.nest == 0));
    }
}
