//! The orchestrator: multiple source units, one shared world.
//!
//! Each unit gets its own reader (so read-time macros stay unit-local); the
//! chunk pool, the global scope and the filename cache are shared. Exposes
//! resolve through the [`Oracle`] and recurse: dependencies compile into
//! the pool and run for their side effects before the target unit runs.
//! The filename cache cuts self-reference and cycles.

use std::{cell::RefCell, fmt::Write as _, rc::Rc};

use ahash::AHashSet;

use crate::{
    actions::{ActionIo, ActionPermissions, Builtin},
    bytecode::{Chunk, Compiler, DEFAULT_PASSES, optimize},
    error::{ExposeError, RunResult},
    machine::Machine,
    oracle::{Oracle, SourceLoader},
    read::Reader,
    transform::transform_all,
    value::{Scope, ScopeRef, Value, ValueType},
};

/// Interpreter knobs carried by the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Peephole pass count per chunk.
    pub passes: u32,
    /// Module resolution chatter on stderr when above zero.
    pub verbose_expose: u8,
    pub permissions: ActionPermissions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            passes: DEFAULT_PASSES,
            verbose_expose: 0,
            permissions: ActionPermissions::default(),
        }
    }
}

/// Coordinates reading, compiling and running source units.
pub struct Orchestra<O, L, Io> {
    oracle: O,
    loader: L,
    io: Io,
    settings: Settings,
    chunks: Vec<Chunk>,
    globals: ScopeRef,
    /// Filenames already compiled into the pool; cuts expose cycles.
    compiled: AHashSet<String>,
}

impl<O: Oracle, L: SourceLoader, Io: ActionIo> Orchestra<O, L, Io> {
    pub fn new(oracle: O, loader: L, io: Io, settings: Settings) -> Self {
        Self {
            oracle,
            loader,
            io,
            settings,
            chunks: Vec::new(),
            globals: seeded_globals(),
            compiled: AHashSet::new(),
        }
    }

    /// The I/O seam, so hosts can read captured output back.
    pub fn io_mut(&mut self) -> &mut Io {
        &mut self.io
    }

    /// Runs one unit to completion and returns its value.
    pub fn run(&mut self, filename: &str, source: &str) -> RunResult<Value> {
        let entry = self.prepare(filename, source)?;
        self.execute(entry)
    }

    /// Reads, resolves exposes, compiles and stitches a unit; returns its
    /// entry chunk index without running it.
    pub fn prepare(&mut self, filename: &str, source: &str) -> RunResult<usize> {
        self.compiled.insert(filename.to_owned());

        let mut reader = Reader::new(filename, source)?;
        let distinct = reader.distinct()?;
        if self.settings.verbose_expose >= 2
            && let Some(path) = &distinct
        {
            eprintln!("[expose] {filename} is distinct {}", path.join("."));
        }
        let exposes = reader.exposes()?;
        for path in &exposes {
            self.expose(&path.join("."))?;
        }

        let mut quotes = reader.read()?;
        transform_all(&mut quotes)?;

        let file: Rc<str> = Rc::from(filename);
        let globals: Vec<String> = self.globals.borrow().keys().cloned().collect();
        let compiler = Compiler::new(&file, unit_name(filename), globals);
        let mut unit = compiler.compile(&quotes)?;

        let base = self.chunks.len();
        for chunk in &mut unit {
            optimize(chunk, self.settings.passes);
            // Function targets are unit-relative; rebase into the pool.
            for function in &mut chunk.functions {
                function.target += u32::try_from(base).unwrap_or(0);
            }
            chunk.complete();
        }
        self.chunks.extend(unit);
        Ok(base)
    }

    /// Runs a prepared chunk against the shared global context.
    pub fn execute(&mut self, entry: usize) -> RunResult<Value> {
        let globals = Rc::clone(&self.globals);
        let mut machine = Machine::new(&self.chunks, globals, self.settings.permissions, &mut self.io);
        machine.execute(entry)
    }

    /// Prepares a unit and renders its chunks' disassembly, both forms.
    pub fn disassemble(&mut self, filename: &str, source: &str) -> RunResult<String> {
        let entry = self.prepare(filename, source)?;
        let mut out = String::new();
        for chunk in &self.chunks[entry..] {
            let _ = writeln!(out, "{}", chunk.disassemble_seamless());
        }
        Ok(out)
    }

    /// Resolves one expose path: asks the oracle, then compiles and runs
    /// every not-yet-seen file it names.
    fn expose(&mut self, distinct: &str) -> RunResult<()> {
        let files = self.oracle.files_for(distinct)?;
        if self.settings.verbose_expose >= 1 {
            eprintln!("[expose] {distinct} -> {files:?}");
        }
        if files.is_empty() {
            return Err(ExposeError::new(format!("nothing provides distinct {distinct}"))
                .with_distinct(distinct)
                .into());
        }
        for file in files {
            if self.compiled.contains(&file) {
                continue;
            }
            let source = self.loader.load(&file)?;
            let entry = self.prepare(&file, &source)?;
            // Dependencies run for their side effects on the globals.
            self.execute(entry)?;
        }
        Ok(())
    }
}

/// The unit name shown in disassembly and traces: the filename without its
/// extension.
fn unit_name(filename: &str) -> &str {
    filename.rsplit('/').next().map_or(filename, |base| {
        base.strip_suffix(".vsp").unwrap_or(base)
    })
}

/// The global scope every orchestrator starts with: builtin functions,
/// the `any` singleton and the type names dispatch relies on.
fn seeded_globals() -> ScopeRef {
    let mut scope = Scope::default();
    for builtin in Builtin::all() {
        scope.insert(builtin.name().to_owned(), Value::Builtin(*builtin));
    }
    scope.insert("any".to_owned(), Value::Any);
    scope.insert("hole".to_owned(), Value::Hole);
    for (name, t) in [
        ("num", ValueType::Num),
        ("str", ValueType::Str),
        ("bool", ValueType::Bool),
        ("regex", ValueType::Regex),
        ("vec", ValueType::Vec),
        ("map", ValueType::Map),
        ("range", ValueType::Range),
        ("function", ValueType::Function),
        ("lambda", ValueType::Lambda),
        ("box", ValueType::Box),
        ("instance", ValueType::Instance),
        ("type", ValueType::Type),
    ] {
        scope.insert(name.to_owned(), Value::Type(t));
    }
    Rc::new(RefCell::new(scope))
}
