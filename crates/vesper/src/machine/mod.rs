//! The stack virtual machine.
//!
//! One frame stack, one chunk pool, one global-and-nested scope chain.
//! Each frame owns its value stack, an integer control stack for iteration
//! bookkeeping, and the underscores stack backing the superlocal `_` and
//! `&_` forms. Invocation pushes a frame (and usually a scope); `RET` pops
//! both, exporting the frame's return value.
//!
//! Runtime errors unwind frames innermost-out, stopping at the nearest open
//! `dies` region; frames unwound past contribute their traces.

mod binary;
mod call;

use std::{cell::RefCell, rc::Rc};

use ahash::AHashMap;
use bigdecimal::BigDecimal;
use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{
    actions::{ActionIo, ActionPermissions},
    bytecode::{Chunk, Instruction, Opcode, VFunction, VStatic},
    error::{InternalError, RunResult, RuntimeError, Trace, VesperError},
    value::{
        BoxInstance, BoxTemplate, ConcreteFunction, GenericFunction, Scope, ScopeRef, VLambda, VRegex, Value,
    },
};

/// Why a frame was pushed; decides return and restart behavior.
#[derive(Debug, Clone)]
enum FrameGoal {
    /// The unit body (or a dependency unit run for its side effects).
    Main,
    Fun(Rc<ConcreteFunction>),
    Lambda(Rc<VLambda>),
    BoxBody(Rc<BoxTemplate>),
}

impl FrameGoal {
    fn trace_name(&self) -> Option<&str> {
        match self {
            Self::Main => None,
            Self::Fun(f) => Some(&f.name),
            Self::Lambda(_) => Some("lambda"),
            Self::BoxBody(b) => Some(&b.name),
        }
    }
}

/// An open `dies` region inside a frame.
#[derive(Debug, Clone, Copy)]
struct DiesRecord {
    handler: usize,
    stack_len: usize,
    control_len: usize,
    underscores_len: usize,
}

/// One activation record.
#[derive(Debug)]
struct Frame {
    /// Chunk pointer: index into the shared pool.
    cp: usize,
    /// Instruction pointer into the chunk's seamless stream.
    ip: usize,
    stack: Vec<Value>,
    /// Iteration bookkeeping (spread cursors). Rarely more than a couple
    /// of nesting levels, so it lives inline.
    control: SmallVec<[usize; 4]>,
    /// The superlocal stack.
    underscores: Vec<Value>,
    goal: FrameGoal,
    /// Open `dies` regions, innermost last.
    dies: SmallVec<[DiesRecord; 2]>,
    /// The value the frame exports when popped.
    returns: Option<Value>,
    /// Errors caught by `dies` regions in this frame, for post-mortems.
    failures: Vec<VesperError>,
    /// Values accumulated by `queue` statements.
    queue: Vec<Value>,
    /// The invocation arguments, kept for an argument-less `next`.
    args: Vec<Value>,
    /// Scope chain length to restore on return.
    scope_base: usize,
    /// The caller's chain, when this frame swapped in a lambda's.
    saved_scopes: Option<Vec<ScopeRef>>,
}

impl Frame {
    fn new(cp: usize, goal: FrameGoal, scope_base: usize) -> Self {
        Self {
            cp,
            ip: 0,
            stack: Vec::new(),
            control: SmallVec::new(),
            underscores: Vec::new(),
            goal,
            dies: SmallVec::new(),
            returns: None,
            failures: Vec::new(),
            queue: Vec::new(),
            args: Vec::new(),
            scope_base,
            saved_scopes: None,
        }
    }
}

/// The virtual machine. One per executed unit; the scope chain's global
/// scope is shared across units by the orchestrator.
pub struct Machine<'a> {
    chunks: &'a [Chunk],
    io: &'a mut dyn ActionIo,
    permissions: ActionPermissions,
    scopes: Vec<ScopeRef>,
    frames: Vec<Frame>,
}

impl<'a> Machine<'a> {
    pub fn new(
        chunks: &'a [Chunk],
        globals: ScopeRef,
        permissions: ActionPermissions,
        io: &'a mut dyn ActionIo,
    ) -> Self {
        Self {
            chunks,
            io,
            permissions,
            scopes: vec![globals],
            frames: Vec::new(),
        }
    }

    /// The I/O seam, for builtins.
    pub fn io(&mut self) -> &mut dyn ActionIo {
        &mut *self.io
    }

    /// The action permission set, for builtins.
    #[must_use]
    pub fn permissions(&self) -> &ActionPermissions {
        &self.permissions
    }

    /// Executes the chunk at `entry` to completion and returns its value.
    pub fn execute(&mut self, entry: usize) -> RunResult<Value> {
        self.frames.push(Frame::new(entry, FrameGoal::Main, self.scopes.len()));
        self.run_to_depth(0)
    }

    /// Runs until the frame stack drops back to `floor` frames, returning
    /// the value the last finished frame exported.
    fn run_to_depth(&mut self, floor: usize) -> RunResult<Value> {
        loop {
            let instruction = self.fetch()?;
            match self.step(&instruction) {
                // The frame stack emptied entirely: the unit is done.
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    if floor > 0 && self.frames.len() <= floor {
                        // A nested call finished; its value sits on the
                        // caller's stack.
                        return self.pop();
                    }
                }
                Err(error) => {
                    let error = self.localize(error);
                    self.unwind(error, floor)?;
                }
            }
        }
    }

    fn fetch(&mut self) -> RunResult<Instruction> {
        let frame = self.frame();
        let chunk = &self.chunks[frame.cp];
        let Some(instruction) = chunk.seamless.get(frame.ip) else {
            return Err(InternalError::new(format!(
                "instruction pointer ran off the end of {}",
                chunk.name
            ))
            .into());
        };
        let instruction = instruction.clone();
        self.frame_mut().ip += 1;
        Ok(instruction)
    }

    fn frame(&self) -> &Frame {
        self.frames.last().expect("the machine always runs inside a frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("the machine always runs inside a frame")
    }

    /// The file and line of the instruction that just executed.
    fn position(&self) -> (String, u32) {
        let frame = self.frame();
        let chunk = &self.chunks[frame.cp];
        let line = chunk
            .seamless
            .get(frame.ip.saturating_sub(1))
            .map_or(0, |instruction| instruction.line);
        (chunk.file.to_string(), line)
    }

    /// A runtime error at the current position.
    fn fail(&self, message: impl Into<String>) -> VesperError {
        let (file, line) = self.position();
        RuntimeError::new(message, file, line).into()
    }

    /// Fills in the position of errors raised without one (builtins,
    /// value-model casts).
    fn localize(&self, error: VesperError) -> VesperError {
        if let VesperError::Runtime(e) = &error
            && e.file.is_empty()
        {
            let (file, line) = self.position();
            let mut e = e.clone();
            e.file = file;
            e.line = line;
            return VesperError::Runtime(e);
        }
        error
    }

    // ------------------------------------------------------------------
    // Stack primitives
    // ------------------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.frame_mut().stack.push(value);
    }

    fn pop(&mut self) -> RunResult<Value> {
        self.frame_mut()
            .stack
            .pop()
            .ok_or_else(|| InternalError::new("value stack underflow").into())
    }

    fn top(&self) -> RunResult<&Value> {
        self.frame()
            .stack
            .last()
            .ok_or_else(|| InternalError::new("value stack underflow").into())
    }

    // ------------------------------------------------------------------
    // Scope primitives
    // ------------------------------------------------------------------

    fn lookup(&self, name: &str, nest: i32) -> Option<Value> {
        if nest == 0 {
            return self.scopes[0].borrow().get(name).cloned();
        }
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.borrow().get(name) {
                return Some(value.clone());
            }
        }
        None
    }

    fn assign(&mut self, name: &str, nest: i32, value: Value) {
        if nest == 0 {
            self.scopes[0].borrow_mut().insert(name.to_owned(), value);
            return;
        }
        for scope in self.scopes.iter().rev() {
            if scope.borrow().contains_key(name) {
                scope.borrow_mut().insert(name.to_owned(), value);
                return;
            }
        }
        if let Some(innermost) = self.scopes.last() {
            innermost.borrow_mut().insert(name.to_owned(), value);
        }
    }

    // ------------------------------------------------------------------
    // Payload access
    // ------------------------------------------------------------------

    fn static_at(&self, instruction: &Instruction) -> RunResult<&VStatic> {
        let frame = self.frame();
        let chunk = &self.chunks[frame.cp];
        instruction
            .arg
            .and_then(|arg| usize::try_from(arg).ok())
            .and_then(|arg| chunk.statics.get(arg))
            .ok_or_else(|| InternalError::new("missing static payload").into())
    }

    fn static_int(&self, instruction: &Instruction) -> RunResult<usize> {
        match self.static_at(instruction)? {
            VStatic::Int(n) => usize::try_from(*n).map_err(|_| InternalError::new("negative count payload").into()),
            _ => Err(InternalError::new("expected an integer payload").into()),
        }
    }

    fn static_str(&self, instruction: &Instruction) -> RunResult<String> {
        match self.static_at(instruction)? {
            VStatic::Str(s) => Ok(s.clone()),
            _ => Err(InternalError::new("expected a string payload").into()),
        }
    }

    fn jump_target(&self, instruction: &Instruction) -> RunResult<usize> {
        let frame = self.frame();
        self.chunks[frame.cp]
            .jump_target(instruction)
            .ok_or_else(|| InternalError::new("missing jump payload").into())
    }

    fn symbol_at(&self, instruction: &Instruction) -> RunResult<(String, i32)> {
        let frame = self.frame();
        let chunk = &self.chunks[frame.cp];
        instruction
            .arg
            .and_then(|arg| usize::try_from(arg).ok())
            .and_then(|arg| chunk.symbols.get(arg))
            .map(|symbol| (symbol.name.clone(), symbol.nest))
            .ok_or_else(|| InternalError::new("missing symbol payload").into())
    }

    fn function_at(&self, instruction: &Instruction) -> RunResult<VFunction> {
        let frame = self.frame();
        let chunk = &self.chunks[frame.cp];
        instruction
            .arg
            .and_then(|arg| usize::try_from(arg).ok())
            .and_then(|arg| chunk.functions.get(arg))
            .cloned()
            .ok_or_else(|| InternalError::new("missing function payload").into())
    }

    // ------------------------------------------------------------------
    // The dispatch loop body
    // ------------------------------------------------------------------

    /// Executes one instruction. Returns the final value when the frame
    /// stack empties below the caller's floor.
    fn step(&mut self, instruction: &Instruction) -> RunResult<Option<Value>> {
        match instruction.opcode {
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Pop2 => {
                let top = self.pop()?;
                self.pop()?;
                self.push(top);
            }
            Opcode::TryPop => {
                let frame = self.frame_mut();
                frame.stack.pop();
            }
            Opcode::Dup => {
                let top = self.top()?.clone();
                self.push(top);
            }
            Opcode::Swap => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a);
                self.push(b);
            }
            Opcode::Ton => {
                let n = self.pop()?.to_num()?;
                self.push(Value::Num(n));
            }
            Opcode::Tos => {
                let s = self.pop()?.to_string();
                self.push(Value::str(s));
            }
            Opcode::Tob => {
                let truth = self.pop()?.truthy();
                self.push(Value::Bool(truth));
            }
            Opcode::Toib => {
                let truth = self.pop()?.truthy();
                self.push(Value::Bool(!truth));
            }
            Opcode::Tov => {
                let items = self.pop()?.to_vec()?;
                self.push(Value::vec(items));
            }
            Opcode::True => self.push(Value::Bool(true)),
            Opcode::False => self.push(Value::Bool(false)),
            Opcode::Hole => self.push(Value::Hole),
            Opcode::Neg => {
                let n = self.pop()?.to_num()?;
                self.push(Value::Num(-n));
            }
            Opcode::Len => {
                let length = self.pop()?.length()?;
                self.push(Value::Num(BigDecimal::from(length as u64)));
            }
            Opcode::Ens => {
                let value = self.pop()?;
                if !value.truthy() {
                    let message = match instruction.arg {
                        Some(_) => format!("ensure failed: {}", self.static_str(instruction)?),
                        None => "ensure failed".to_owned(),
                    };
                    return Err(self.fail(message));
                }
            }
            Opcode::Uput => {
                let value = self.pop()?;
                self.frame_mut().underscores.push(value);
            }
            Opcode::Upop => {
                let value = self
                    .frame_mut()
                    .underscores
                    .pop()
                    .ok_or_else(|| self.fail("the superlocal is empty"))?;
                self.push(value);
            }
            Opcode::Uref => {
                let value = self
                    .frame()
                    .underscores
                    .last()
                    .cloned()
                    .ok_or_else(|| self.fail("the superlocal is empty"))?;
                self.push(value);
            }
            Opcode::Ctx => {
                let caller = self
                    .frames
                    .len()
                    .checked_sub(2)
                    .and_then(|index| self.frames.get(index));
                let value = caller
                    .and_then(|frame| frame.underscores.last())
                    .cloned()
                    .ok_or_else(|| self.fail("no contextual value is available"))?;
                self.push(value);
            }
            Opcode::Clear => self.frame_mut().stack.clear(),
            Opcode::Ret => {
                let value = self
                    .frame_mut()
                    .stack
                    .pop()
                    .ok_or_else(|| self.fail("void expression"))?;
                self.frame_mut().returns = Some(value);
                return Ok(self.pop_frame());
            }
            Opcode::Inc | Opcode::Dec => {
                let n = self.pop()?.to_num()?;
                let bumped = if instruction.opcode == Opcode::Inc {
                    n + BigDecimal::from(1)
                } else {
                    n - BigDecimal::from(1)
                };
                self.push(Value::Num(bumped));
            }
            Opcode::FastInc | Opcode::FastDec => {
                self.pop()?.to_num()?;
            }
            Opcode::MapAppend => {
                let result = self.pop()?;
                if !matches!(result, Value::Hole) {
                    match self.top()? {
                        Value::Vec(items) => items.borrow_mut().push(result),
                        _ => return Err(InternalError::new("spread accumulator is not a vec").into()),
                    }
                }
            }
            Opcode::RemToVec => {
                // The prologue seeded arguments reversed (first on top), so
                // draining top-down restores call order.
                let mut items = std::mem::take(&mut self.frame_mut().stack);
                items.reverse();
                self.push(Value::vec(items));
            }
            Opcode::FalseIfEmpty => {
                if self.frame().stack.is_empty() {
                    self.push(Value::Bool(false));
                }
            }
            Opcode::Queue => {
                let value = self.top()?.clone();
                self.frame_mut().queue.push(value);
            }
            Opcode::QueueVec => {
                let queue = self.frame().queue.clone();
                self.push(Value::vec(queue));
            }
            Opcode::BoxInstance => {
                let FrameGoal::BoxBody(template) = self.frame().goal.clone() else {
                    return Err(InternalError::new("BOX_INSTANCE outside of a box body").into());
                };
                let scope = self
                    .scopes
                    .last()
                    .map_or_else(Scope::default, |scope| scope.borrow().clone());
                let instance = Value::Instance(Rc::new(BoxInstance {
                    parent: template,
                    scope: RefCell::new(scope),
                }));
                self.frame_mut().returns = Some(instance);
                return Ok(self.pop_frame());
            }
            Opcode::FieldEval => {
                let name = self.pop()?.to_string();
                let head = self.pop()?;
                let value = self.resolve_field(head, &name)?;
                self.push(value);
            }
            Opcode::EndDies => {
                self.frame_mut().dies.pop();
            }
            Opcode::Num => {
                let VStatic::Num(n) = self.static_at(instruction)? else {
                    return Err(InternalError::new("NUM without a numeric payload").into());
                };
                let n = n.clone();
                self.push(Value::Num(n));
            }
            Opcode::Str => {
                let s = self.static_str(instruction)?;
                self.push(Value::str(s));
            }
            Opcode::Pcre => {
                let source = self.static_str(instruction)?;
                let regex = VRegex::new(&source)?;
                self.push(Value::Regex(regex));
            }
            Opcode::Vec => {
                let count = self.static_int(instruction)?;
                let items = self.pop_many(count)?;
                self.push(Value::vec(items));
            }
            Opcode::Map => {
                let count = self.static_int(instruction)?;
                let mut flat = self.pop_many(count * 2)?.into_iter();
                let mut pairs = IndexMap::new();
                while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
                    pairs.insert(key.to_string(), value);
                }
                self.push(Value::map(pairs));
            }
            Opcode::Call => {
                let count = self.static_int(instruction)?;
                let args = self.pop_many(count)?;
                let callee = self.pop()?;
                self.invoke(callee, args)?;
            }
            Opcode::Reduce => {
                let op = self.static_str(instruction)?;
                let items = self.pop()?.to_vec()?;
                let mut items = items.into_iter();
                let Some(first) = items.next() else {
                    self.push(Value::Bool(false));
                    return Ok(None);
                };
                let mut folded = first;
                for item in items {
                    folded = binary::binary(self, &op, folded, item)?;
                }
                self.push(folded);
            }
            Opcode::Binary => {
                let op = self.static_str(instruction)?;
                let right = self.pop()?;
                let left = self.pop()?;
                let result = binary::binary(self, &op, left, right)?;
                self.push(result);
            }
            Opcode::Field => {
                let name = self.static_str(instruction)?;
                let head = self.pop()?;
                let value = self.resolve_field(head, &name)?;
                self.push(value);
            }
            Opcode::NextFun => {
                let count = self.static_int(instruction)?;
                self.restart_frame(count)?;
            }
            Opcode::J => {
                let target = self.jump_target(instruction)?;
                self.frame_mut().ip = target;
            }
            Opcode::Jit | Opcode::Jif => {
                let target = self.jump_target(instruction)?;
                let truth = self.pop()?.truthy();
                if truth == (instruction.opcode == Opcode::Jit) {
                    self.frame_mut().ip = target;
                }
            }
            Opcode::JitElsePop | Opcode::JifElsePop => {
                let target = self.jump_target(instruction)?;
                let truth = self.top()?.truthy();
                if truth == (instruction.opcode == Opcode::JitElsePop) {
                    self.frame_mut().ip = target;
                } else {
                    self.pop()?;
                }
            }
            Opcode::MapSetup => {
                let target = self.jump_target(instruction)?;
                let source = self.spread_source()?;
                if source.borrow().is_empty() {
                    self.frame_mut().ip = target;
                } else {
                    self.frame_mut().control.push(0);
                }
            }
            Opcode::MapIter => {
                let target = self.jump_target(instruction)?;
                let source = self.spread_source()?;
                let cursor = *self
                    .frame()
                    .control
                    .last()
                    .ok_or_else(|| InternalError::new("spread iteration without a cursor"))?;
                let element = source.borrow().get(cursor).cloned();
                match element {
                    // The element lands on the value stack; the following
                    // UPUT moves it onto the superlocal for the body.
                    Some(element) => {
                        let frame = self.frame_mut();
                        frame.stack.push(element);
                        *frame.control.last_mut().expect("cursor checked above") += 1;
                    }
                    None => {
                        let frame = self.frame_mut();
                        frame.control.pop();
                        frame.ip = target;
                    }
                }
            }
            Opcode::SetupDies => {
                let handler = self.jump_target(instruction)?;
                let frame = self.frame_mut();
                let record = DiesRecord {
                    handler,
                    stack_len: frame.stack.len(),
                    control_len: frame.control.len(),
                    underscores_len: frame.underscores.len(),
                };
                frame.dies.push(record);
            }
            Opcode::Sym => {
                let (name, nest) = self.symbol_at(instruction)?;
                let value = self
                    .lookup(&name, nest)
                    .ok_or_else(|| self.fail(format!("undefined symbol: {name}")))?;
                self.push(value);
            }
            Opcode::SetPop => {
                let (name, nest) = self.symbol_at(instruction)?;
                let value = self.pop()?;
                self.assign(&name, nest, value);
            }
            Opcode::SetTap => {
                let (name, nest) = self.symbol_at(instruction)?;
                let value = self.top()?.clone();
                self.assign(&name, nest, value);
            }
            Opcode::Fun => {
                let payload = self.function_at(instruction)?;
                let bound = self.define_function(&payload)?;
                self.push(bound);
            }
            Opcode::Box => {
                let payload = self.function_at(instruction)?;
                let bound = self.define_box(&payload)?;
                self.push(bound);
            }
            Opcode::Lam => {
                let payload = self.function_at(instruction)?;
                let lambda = Value::Lambda(Rc::new(VLambda {
                    target: payload.target as usize,
                    params: payload.params.clone(),
                    arity: payload.arity as usize,
                    slurpy: payload.slurpy,
                    scopes: self.scopes.clone(),
                }));
                self.push(lambda);
            }
        }
        Ok(None)
    }

    /// Pops `count` values, returning them in push order.
    fn pop_many(&mut self, count: usize) -> RunResult<Vec<Value>> {
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.pop()?);
        }
        values.reverse();
        Ok(values)
    }

    /// The source vector of the innermost spread: below the accumulator.
    fn spread_source(&self) -> RunResult<Rc<RefCell<Vec<Value>>>> {
        let stack = &self.frame().stack;
        let source = stack
            .len()
            .checked_sub(2)
            .and_then(|index| stack.get(index))
            .ok_or_else(|| InternalError::new("spread source missing from the stack"))?;
        match source {
            Value::Vec(items) => Ok(Rc::clone(items)),
            _ => Err(InternalError::new("spread source is not a vec").into()),
        }
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    /// Pops the current frame, exporting its return value.
    ///
    /// A non-empty queue overrides the returned value: a function that
    /// queued anything returns its queue.
    fn pop_frame(&mut self) -> Option<Value> {
        let mut frame = self.frames.pop().expect("pop_frame runs inside a frame");
        let mut value = frame.returns.take().unwrap_or(Value::Bool(false));
        if !frame.queue.is_empty() && matches!(frame.goal, FrameGoal::Fun(_) | FrameGoal::Lambda(_)) {
            value = Value::vec(std::mem::take(&mut frame.queue));
        }
        match frame.saved_scopes {
            Some(saved) => self.scopes = saved,
            None => self.scopes.truncate(frame.scope_base),
        }
        if let Some(parent) = self.frames.last_mut() {
            parent.stack.push(value);
            None
        } else {
            Some(value)
        }
    }

    /// Pops a frame while unwinding, discarding its value.
    fn discard_frame(&mut self) {
        let frame = self.frames.pop().expect("discard_frame runs inside a frame");
        match frame.saved_scopes {
            Some(saved) => self.scopes = saved,
            None => self.scopes.truncate(frame.scope_base),
        }
    }

    /// `next`: restarts the enclosing function with fresh or original
    /// arguments, re-running the parameter prologue.
    fn restart_frame(&mut self, count: usize) -> RunResult<()> {
        let args = if count == 0 {
            self.frame().args.clone()
        } else {
            self.pop_many(count)?
        };
        let goal = self.frame().goal.clone();
        let (arity, slurpy, feed_underscores) = match &goal {
            FrameGoal::Fun(f) => (f.arity, f.slurpy, f.slurpy),
            FrameGoal::Lambda(l) => (l.arity, l.slurpy, true),
            FrameGoal::BoxBody(b) => (b.arity, false, false),
            FrameGoal::Main => return Err(self.fail("next outside of a function")),
        };
        if let Some(scope) = self.scopes.last() {
            scope.borrow_mut().clear();
        }
        let seeded = seed_stack(&args, arity, slurpy);
        let frame = self.frame_mut();
        frame.ip = 0;
        frame.control.clear();
        frame.dies.clear();
        frame.queue.clear();
        frame.underscores = if feed_underscores {
            args.iter().rev().cloned().collect()
        } else {
            Vec::new()
        };
        frame.stack = seeded;
        frame.args = args;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unwinding
    // ------------------------------------------------------------------

    /// Unwinds after an error, stopping at the nearest open `dies` region
    /// above `floor`. Uncaught errors propagate with their traces.
    fn unwind(&mut self, error: VesperError, floor: usize) -> RunResult<()> {
        let mut error = error;
        if !error.dies_catchable() {
            return Err(self.with_traces(error, floor));
        }
        while self.frames.len() > floor {
            if let Some(record) = self.frame_mut().dies.pop() {
                let frame = self.frame_mut();
                frame.stack.truncate(record.stack_len);
                frame.control.truncate(record.control_len);
                frame.underscores.truncate(record.underscores_len);
                frame.ip = record.handler;
                frame.failures.push(error);
                return Ok(());
            }
            if let Some(name) = self.frame().goal.trace_name() {
                let (file, line) = self.position();
                if let VesperError::Runtime(e) = &mut error {
                    e.traces.push(Trace::new(name, file, line));
                }
            }
            self.discard_frame();
        }
        Err(error)
    }

    /// Attaches frame traces to an error that will propagate.
    fn with_traces(&mut self, mut error: VesperError, floor: usize) -> VesperError {
        while self.frames.len() > floor {
            if let Some(name) = self.frame().goal.trace_name() {
                let (file, line) = self.position();
                if let VesperError::Runtime(e) = &mut error {
                    e.traces.push(Trace::new(name, file, line));
                }
            }
            self.discard_frame();
        }
        error
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// `FUN`: builds a concrete function from the payload and the given
    /// values on the stack, and merges it into the symbol's binding.
    fn define_function(&mut self, payload: &VFunction) -> RunResult<Value> {
        let givens = self.pop_many(payload.given as usize)?;
        let specificity = specificity_of(&payload.params, &givens);
        let function = Rc::new(ConcreteFunction {
            name: payload.symbol.name.clone(),
            target: payload.target as usize,
            params: payload.params.clone(),
            givens,
            arity: payload.arity as usize,
            slurpy: payload.slurpy,
            contextual: payload.contextual.clone(),
            specificity,
        });

        let existing = self.lookup(&payload.symbol.name, payload.symbol.nest);
        let bound = match existing {
            Some(Value::Generic(generic)) => {
                generic.borrow_mut().add(function);
                Value::Generic(generic)
            }
            Some(Value::Concrete(prior)) => {
                let mut generic = GenericFunction::new(&payload.symbol.name);
                generic.add(prior);
                generic.add(function);
                Value::Generic(Rc::new(RefCell::new(generic)))
            }
            _ => Value::Concrete(function),
        };
        self.assign(&payload.symbol.name, payload.symbol.nest, bound.clone());
        Ok(bound)
    }

    /// `BOX`: builds a box template and binds it.
    fn define_box(&mut self, payload: &VFunction) -> RunResult<Value> {
        let givens = self.pop_many(payload.given as usize)?;
        let specificity = specificity_of(&payload.params, &givens);
        let template = Value::Box(Rc::new(BoxTemplate {
            name: payload.symbol.name.clone(),
            target: payload.target as usize,
            params: payload.params.clone(),
            givens,
            arity: payload.arity as usize,
            specificity,
        }));
        self.assign(&payload.symbol.name, payload.symbol.nest, template.clone());
        Ok(template)
    }
}

/// Sum of given weights; parameters named `_` are anonymous and weigh one
/// point less.
fn specificity_of(params: &[String], givens: &[Value]) -> u32 {
    givens
        .iter()
        .enumerate()
        .map(|(index, given)| {
            let anonymous = params.get(index).is_none_or(|name| name == "_");
            given.weight(anonymous)
        })
        .sum()
}

/// Seeds a fresh scope from pattern bindings collected during dispatch.
fn scope_from_bindings(bindings: Vec<(String, Value)>) -> ScopeRef {
    let mut scope: Scope = AHashMap::new();
    for (name, value) in bindings {
        scope.insert(name, value);
    }
    Rc::new(RefCell::new(scope))
}

/// The initial frame stack for an invocation: reversed, so the first
/// `SET_POP` of the prologue reads the first positional argument.
///
/// Slurpy callees get every argument (the prologue's `REM_TO_VEC` gathers
/// the tail); fixed-arity callees get exactly the first `arity`.
fn seed_stack(args: &[Value], arity: usize, slurpy: bool) -> Vec<Value> {
    if slurpy {
        args.iter().rev().cloned().collect()
    } else {
        args.iter().take(arity).rev().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::CollectIo;

    /// Runs a hand-built chunk on a bare machine.
    fn run_chunk(build: impl FnOnce(&mut Chunk)) -> RunResult<Value> {
        let file: Rc<str> = Rc::from("test.vsp");
        let mut chunk = Chunk::new(&file, "test");
        build(&mut chunk);
        chunk.complete();
        let chunks = vec![chunk];
        let globals: ScopeRef = Rc::new(RefCell::new(Scope::default()));
        let mut io = CollectIo::default();
        let mut machine = Machine::new(&chunks, globals, ActionPermissions::default(), &mut io);
        machine.execute(0)
    }

    fn num(chunk: &mut Chunk, n: i32) {
        let arg = chunk.add_static(VStatic::Num(n.into()));
        chunk.emit(Opcode::Num, Some(arg), 1);
    }

    #[test]
    fn ret_exports_the_stack_top() {
        let value = run_chunk(|chunk| {
            num(chunk, 42);
            chunk.emit(Opcode::Ret, None, 1);
        })
        .unwrap();
        assert!(value.eqv(&Value::Num(42.into())));
    }

    #[test]
    fn ret_on_an_empty_stack_is_a_void_expression() {
        let error = run_chunk(|chunk| chunk.emit(Opcode::Ret, None, 1)).unwrap_err();
        assert!(error.to_string().contains("void expression"));
    }

    #[test]
    fn the_superlocal_round_trips() {
        let value = run_chunk(|chunk| {
            num(chunk, 7);
            let plus = chunk.add_static(VStatic::Str("+".to_owned()));
            chunk.emit(Opcode::Uput, None, 1);
            chunk.emit(Opcode::Uref, None, 1);
            chunk.emit(Opcode::Upop, None, 1);
            chunk.emit(Opcode::Binary, Some(plus), 1);
            chunk.emit(Opcode::Ret, None, 1);
        })
        .unwrap();
        assert!(value.eqv(&Value::Num(14.into())));
    }

    #[test]
    fn taking_from_an_empty_superlocal_dies() {
        let error = run_chunk(|chunk| {
            chunk.emit(Opcode::Upop, None, 1);
            chunk.emit(Opcode::Ret, None, 1);
        })
        .unwrap_err();
        assert!(error.to_string().contains("superlocal"));
    }

    #[test]
    fn try_pop_tolerates_an_empty_stack() {
        let value = run_chunk(|chunk| {
            chunk.emit(Opcode::TryPop, None, 1);
            chunk.emit(Opcode::True, None, 1);
            chunk.emit(Opcode::Ret, None, 1);
        })
        .unwrap();
        assert!(value.truthy());
    }

    #[test]
    fn rem_to_vec_restores_call_order() {
        let value = run_chunk(|chunk| {
            num(chunk, 2);
            num(chunk, 1);
            chunk.emit(Opcode::RemToVec, None, 1);
            chunk.emit(Opcode::Ret, None, 1);
        })
        .unwrap();
        assert!(value.eqv(&Value::vec(vec![Value::Num(1.into()), Value::Num(2.into())])));
    }

    #[test]
    fn jumps_follow_resolved_targets() {
        let value = run_chunk(|chunk| {
            let skip = chunk.label();
            chunk.emit_label(Opcode::J, skip, 1);
            chunk.emit(Opcode::False, None, 1);
            chunk.emit(Opcode::Ret, None, 1);
            chunk.open(skip);
            chunk.emit(Opcode::True, None, 1);
            chunk.emit(Opcode::Ret, None, 1);
        })
        .unwrap();
        assert!(value.truthy());
    }

    #[test]
    fn queue_vec_reads_the_accumulated_queue() {
        let value = run_chunk(|chunk| {
            num(chunk, 1);
            chunk.emit(Opcode::Queue, None, 1);
            chunk.emit(Opcode::Pop, None, 1);
            chunk.emit(Opcode::QueueVec, None, 1);
            chunk.emit(Opcode::Ret, None, 1);
        })
        .unwrap();
        assert!(value.eqv(&Value::vec(vec![Value::Num(1.into())])));
    }
}
