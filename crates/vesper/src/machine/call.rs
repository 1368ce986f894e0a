//! The invocation protocol.
//!
//! `CALL n` pops n arguments and a callee. Vectors, strings and maps invoke
//! as n-ary indexing; builtins run synchronously; functions, boxes and
//! lambdas push a frame. Generic functions select the best variant by
//! walking the specificity-ordered list and taking the first whose arity
//! and typed-parameter checks pass; pattern givens contribute the bindings
//! their verification lambdas collected.

use std::rc::Rc;

use bigdecimal::{BigDecimal, ToPrimitive};

use crate::{
    error::RunResult,
    machine::{Frame, FrameGoal, Machine, binary, scope_from_bindings, seed_stack},
    value::{BoxTemplate, ConcreteFunction, VLambda, VRange, Value},
};

/// Pattern bindings a matching variant wants injected into its scope.
type Bindings = Vec<(String, Value)>;

impl Machine<'_> {
    /// Invokes `callee` with `args`, leaving the result on the stack or a
    /// new frame on the frame stack.
    pub(super) fn invoke(&mut self, callee: Value, args: Vec<Value>) -> RunResult<()> {
        match callee {
            Value::Vec(items) => {
                let result = index_sequence(self, &items.borrow(), &args)?;
                self.push(result);
            }
            Value::Str(text) => {
                let chars: Vec<Value> = text.chars().map(|c| Value::str(c.to_string())).collect();
                let result = index_sequence(self, &chars, &args)?;
                let result = match result {
                    // A sliced string comes back as one Str, not a Vec.
                    Value::Vec(parts) => {
                        let joined: String = parts.borrow().iter().map(ToString::to_string).collect();
                        Value::str(joined)
                    }
                    other => other,
                };
                self.push(result);
            }
            Value::Map(pairs) => {
                let [key] = args.as_slice() else {
                    return Err(self.fail("a map takes exactly one key"));
                };
                let key = key.to_string();
                let value = pairs
                    .borrow()
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| self.fail(format!("no key {key:?} in the map")))?;
                self.push(value);
            }
            Value::Regex(regex) => {
                let [subject] = args.as_slice() else {
                    return Err(self.fail("a regex takes exactly one subject"));
                };
                let subject = subject.to_string();
                let result = match regex.pattern.find(&subject) {
                    Some(found) => Value::str(found.as_str()),
                    None => Value::Bool(false),
                };
                self.push(result);
            }
            Value::Builtin(builtin) => {
                let result = builtin.call(self, args)?;
                self.push(result);
            }
            Value::Concrete(function) => {
                let Some(bindings) = self.variant_bindings(&function, &args)? else {
                    return Err(self.fail(format!(
                        "no concrete variant of {} matches the arguments (typecheck failed)",
                        function.name
                    )));
                };
                self.push_function_frame(function, args, bindings);
            }
            Value::Generic(generic) => {
                let variants = generic.borrow().variants.clone();
                let name = generic.borrow().name.clone();
                let Some((variant, bindings)) = self.select_variant(&variants, &args)? else {
                    return Err(self.fail(format!(
                        "no concrete variant of {name} matches the arguments (typecheck failed)"
                    )));
                };
                self.push_function_frame(variant, args, bindings);
            }
            Value::Lambda(lambda) => self.push_lambda_frame(lambda, args),
            Value::Box(template) => {
                if args.len() != template.arity {
                    return Err(self.fail(format!(
                        "{} takes {} argument(s), got {} (typecheck failed)",
                        template.name,
                        template.arity,
                        args.len()
                    )));
                }
                for (argument, given) in args.iter().zip(&template.givens) {
                    if self.given_bindings(argument, given)?.is_none() {
                        return Err(self.fail(format!(
                            "no concrete variant of {} matches the arguments (typecheck failed)",
                            template.name
                        )));
                    }
                }
                self.push_box_frame(template, args);
            }
            Value::Partial(partial) => {
                let mut joined = partial.bound.clone();
                joined.extend(args);
                return self.invoke(partial.callee.clone(), joined);
            }
            other => {
                return Err(self.fail(format!("a {} is not callable", other.type_of())));
            }
        }
        Ok(())
    }

    /// Runs a nested call to completion and returns its value.
    ///
    /// Dies regions and traces of the nested frames are handled by whoever
    /// catches an error above this call.
    pub fn call_value(&mut self, callee: Value, args: Vec<Value>) -> RunResult<Value> {
        let depth = self.frames.len();
        self.invoke(callee, args)?;
        if self.frames.len() == depth {
            // The callee ran synchronously; its result is on the stack.
            return self.pop();
        }
        self.run_to_depth(depth)
    }

    // ------------------------------------------------------------------
    // Variant selection
    // ------------------------------------------------------------------

    /// Walks the specificity-ordered variants, returning the first match.
    fn select_variant(
        &mut self,
        variants: &[Rc<ConcreteFunction>],
        args: &[Value],
    ) -> RunResult<Option<(Rc<ConcreteFunction>, Bindings)>> {
        for variant in variants {
            if let Some(bindings) = self.variant_bindings(variant, args)? {
                return Ok(Some((Rc::clone(variant), bindings)));
            }
        }
        Ok(None)
    }

    /// Checks one variant against the arguments.
    ///
    /// Returns the pattern bindings to inject on a match, `None` on a
    /// mismatch. The given list is per-parameter; positional givens cover
    /// the fixed parameters, the slurpy given (when the last parameter
    /// slurps) covers every trailing argument.
    fn variant_bindings(&mut self, variant: &ConcreteFunction, args: &[Value]) -> RunResult<Option<Bindings>> {
        if variant.slurpy {
            if args.len() < variant.arity {
                return Ok(None);
            }
        } else if args.len() != variant.arity {
            return Ok(None);
        }

        let mut positional = Vec::new();
        let mut slurpy_given = None;
        for (index, name) in variant.params.iter().enumerate() {
            let Some(given) = variant.givens.get(index) else { continue };
            if variant.slurpy && index == variant.params.len() - 1 {
                slurpy_given = Some(given);
            } else if variant.contextual.as_deref() == Some(name.as_str()) {
                // The contextual parameter binds from the superlocal, not
                // from a positional argument.
            } else {
                positional.push(given);
            }
        }

        let mut bindings = Bindings::new();
        for (argument, given) in args.iter().zip(&positional) {
            match self.given_bindings(argument, given)? {
                Some(mut found) => bindings.append(&mut found),
                None => return Ok(None),
            }
        }
        if let Some(given) = slurpy_given {
            for argument in &args[variant.arity..] {
                if self.given_bindings(argument, given)?.is_none() {
                    return Ok(None);
                }
            }
        }
        Ok(Some(bindings))
    }

    /// One typed-parameter check via `is`; a map result carries bindings.
    fn given_bindings(&mut self, argument: &Value, given: &Value) -> RunResult<Option<Bindings>> {
        let verdict = binary::binary(self, "is", argument.clone(), given.clone())?;
        if !verdict.truthy() {
            return Ok(None);
        }
        if let Value::Map(pairs) = &verdict {
            let bindings = pairs
                .borrow()
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            return Ok(Some(bindings));
        }
        Ok(Some(Bindings::new()))
    }

    // ------------------------------------------------------------------
    // Frame seeding
    // ------------------------------------------------------------------

    fn push_function_frame(&mut self, function: Rc<ConcreteFunction>, args: Vec<Value>, bindings: Bindings) {
        let scope_base = self.scopes.len();
        self.scopes.push(scope_from_bindings(bindings));
        let mut frame = Frame::new(function.target, FrameGoal::Fun(Rc::clone(&function)), scope_base);
        frame.stack = seed_stack(&args, function.arity, function.slurpy);
        if function.slurpy {
            frame.underscores = args.iter().rev().cloned().collect();
        }
        frame.args = args;
        self.frames.push(frame);
    }

    fn push_box_frame(&mut self, template: Rc<BoxTemplate>, args: Vec<Value>) {
        let scope_base = self.scopes.len();
        self.scopes.push(scope_from_bindings(Bindings::new()));
        let mut frame = Frame::new(template.target, FrameGoal::BoxBody(Rc::clone(&template)), scope_base);
        frame.stack = seed_stack(&args, template.arity, false);
        frame.args = args;
        self.frames.push(frame);
    }

    /// A lambda runs under its captured chain plus one fresh scope; the
    /// caller's locals are invisible inside. Every argument also feeds the
    /// lambda's superlocal, first argument on top.
    fn push_lambda_frame(&mut self, lambda: Rc<VLambda>, args: Vec<Value>) {
        let scope_base = self.scopes.len();
        let mut chain = lambda.scopes.clone();
        chain.push(scope_from_bindings(Bindings::new()));
        let saved = std::mem::replace(&mut self.scopes, chain);
        let mut frame = Frame::new(lambda.target, FrameGoal::Lambda(Rc::clone(&lambda)), scope_base);
        frame.saved_scopes = Some(saved);
        frame.stack = seed_stack(&args, lambda.arity, lambda.slurpy);
        frame.underscores = args.iter().rev().cloned().collect();
        frame.args = args;
        self.frames.push(frame);
    }

    // ------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------

    /// Resolves `head.name`.
    ///
    /// Box instances read their scope, maps their keys, internals their
    /// field bag. Anything else (and any miss) falls back to binding the
    /// head into a partial call of a globally visible function, which is
    /// how `value.f(x)` reads as `f(value, x)`.
    pub(super) fn resolve_field(&mut self, head: Value, name: &str) -> RunResult<Value> {
        match &head {
            Value::Instance(instance) => {
                if let Some(value) = instance.scope.borrow().get(name) {
                    return Ok(value.clone());
                }
            }
            Value::Map(pairs) => {
                if let Some(value) = pairs.borrow().get(name) {
                    return Ok(value.clone());
                }
            }
            Value::Internal(internal) => {
                if let Some(value) = internal.fields.get(name) {
                    return Ok(value.clone());
                }
            }
            _ => {}
        }
        if let Some(function) = self.lookup(name, -1)
            && matches!(
                function,
                Value::Concrete(_) | Value::Generic(_) | Value::Builtin(_) | Value::Lambda(_)
            )
        {
            return Ok(Value::Partial(Rc::new(crate::value::Partial {
                callee: function,
                bound: vec![head],
            })));
        }
        Err(self.fail(format!("a {} has no field {name:?}", head.type_of())))
    }
}

/// N-ary indexing of a sequence: numeric indices pick elements, a single
/// range slices. Bounds are inclusive and zero-based.
fn index_sequence(machine: &Machine<'_>, items: &[Value], args: &[Value]) -> RunResult<Value> {
    if let [Value::Range(range)] = args {
        return slice_range(machine, items, range);
    }
    let mut picked = Vec::with_capacity(args.len());
    for arg in args {
        let index = numeric_index(machine, arg, items.len())?;
        picked.push(items[index].clone());
    }
    if picked.len() == 1 {
        return Ok(picked.remove(0));
    }
    Ok(Value::vec(picked))
}

fn slice_range(machine: &Machine<'_>, items: &[Value], range: &VRange) -> RunResult<Value> {
    let start = match &range.start {
        Some(start) => decimal_index(machine, start, items.len())?,
        None => 0,
    };
    let end = match &range.end {
        Some(end) => decimal_index(machine, end, items.len())?,
        None => items.len().saturating_sub(1),
    };
    if start > end {
        return Ok(Value::vec(Vec::new()));
    }
    Ok(Value::vec(items[start..=end].to_vec()))
}

fn numeric_index(machine: &Machine<'_>, arg: &Value, length: usize) -> RunResult<usize> {
    let Value::Num(n) = arg else {
        return Err(machine.fail(format!("cannot index with a {}", arg.type_of())));
    };
    decimal_index(machine, n, length)
}

fn decimal_index(machine: &Machine<'_>, n: &BigDecimal, length: usize) -> RunResult<usize> {
    let index = n
        .to_u64()
        .filter(|_| n.is_integer())
        .and_then(|index| usize::try_from(index).ok())
        .ok_or_else(|| machine.fail(format!("{n} is not a valid index")))?;
    if index >= length {
        return Err(machine.fail(format!("index {index} is out of bounds (length {length})")));
    }
    Ok(index)
}
