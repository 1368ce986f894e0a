//! Chunks, snippets, labels and payload storages.
//!
//! A [`Chunk`] is one compiled body: the unit itself, a function, a box or a
//! lambda. While compiling, instructions accumulate in [`Snippet`]s (basic
//! blocks) under [`Label`]s; jump instructions reference labels. Stitching
//! (`complete`) flattens the snippets into the `seamless` stream and rewrites
//! every label reference into an absolute jump payload.
//!
//! Labels are arena indices into a per-chunk table, never pointers. A
//! label's target is a snippet index during compilation and an instruction
//! index after stitching.

use std::fmt::{self, Write};
use std::rc::Rc;

use bigdecimal::BigDecimal;

use crate::bytecode::op::{Opcode, Payload};

/// A forward reference with a settable target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

impl Label {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A basic block: a label and its instructions.
#[derive(Debug, Clone)]
pub struct Snippet {
    pub label: Label,
    pub code: Vec<Instruction>,
}

/// One instruction.
///
/// `arg` indexes into the payload storage selected by the opcode's payload
/// category. `label` is used transiently for jump instructions until the
/// stitcher resolves it into a jump payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub arg: Option<i32>,
    pub line: u32,
    pub label: Option<Label>,
}

impl Instruction {
    pub fn new(opcode: Opcode, arg: Option<i32>, line: u32) -> Self {
        Self {
            opcode,
            arg,
            line,
            label: None,
        }
    }
}

/// Jump payload: an absolute instruction index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VJump {
    pub target: u32,
}

/// Static payload: a machine integer, a decimal or a string.
#[derive(Debug, Clone, PartialEq)]
pub enum VStatic {
    Int(i32),
    Num(BigDecimal),
    Str(String),
}

impl fmt::Display for VStatic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Num(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value:?}"),
        }
    }
}

/// Symbol payload: a name and the scope nest it was declared in.
///
/// Nest 0 is the global scope; -1 requests a dynamic innermost-outward
/// lookup; any other value is the compiler's declaration-depth hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VSymbol {
    pub name: String,
    pub nest: i32,
}

impl VSymbol {
    pub fn new(name: impl Into<String>, nest: i32) -> Self {
        Self {
            name: name.into(),
            nest,
        }
    }
}

impl fmt::Display for VSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.nest)
    }
}

/// Function payload: everything `FUN`, `BOX` and `LAM` need to build their
/// runtime value.
#[derive(Debug, Clone, PartialEq)]
pub struct VFunction {
    /// The symbol the definition binds (lambdas use a placeholder).
    pub symbol: VSymbol,
    /// Chunk index of the body, unit-relative until the orchestrator rebases
    /// it into the shared pool.
    pub target: u32,
    /// Parameter names in declaration order; anonymous parameters are `_`.
    pub params: Vec<String>,
    /// How many given values the definition site pushes.
    pub given: u32,
    /// Fixed positional arity.
    pub arity: u32,
    pub slurpy: bool,
    /// Name of the contextual parameter, if the list has one.
    pub contextual: Option<String>,
}

/// A compiled body with its payload storages.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub file: Rc<str>,
    pub name: String,
    pub snippets: Vec<Snippet>,
    /// The stitched instruction stream; empty until [`Chunk::complete`].
    pub seamless: Vec<Instruction>,
    labels: Vec<Option<u32>>,
    pub jumps: Vec<VJump>,
    pub statics: Vec<VStatic>,
    pub symbols: Vec<VSymbol>,
    pub functions: Vec<VFunction>,
}

impl Chunk {
    /// Creates a chunk with one open snippet under the core label.
    pub fn new(file: &Rc<str>, name: impl Into<String>) -> Self {
        let mut chunk = Self {
            file: Rc::clone(file),
            name: name.into(),
            snippets: Vec::new(),
            seamless: Vec::new(),
            labels: Vec::new(),
            jumps: Vec::new(),
            statics: Vec::new(),
            symbols: Vec::new(),
            functions: Vec::new(),
        };
        let core = chunk.label();
        chunk.open(core);
        chunk
    }

    /// Allocates a fresh, unresolved label.
    #[must_use]
    pub fn label(&mut self) -> Label {
        let label = Label(u32::try_from(self.labels.len()).unwrap_or(u32::MAX));
        self.labels.push(None);
        label
    }

    /// Opens a new snippet under `label`, making it the emission target.
    ///
    /// The label's target becomes the new snippet's index.
    pub fn open(&mut self, label: Label) {
        self.labels[label.index()] = Some(u32::try_from(self.snippets.len()).unwrap_or(u32::MAX));
        self.snippets.push(Snippet {
            label,
            code: Vec::new(),
        });
    }

    fn current(&mut self) -> &mut Vec<Instruction> {
        let snippet = self.snippets.last_mut().expect("a chunk always has its core snippet");
        &mut snippet.code
    }

    /// Emits a payload-free or pre-resolved instruction.
    pub fn emit(&mut self, opcode: Opcode, arg: Option<i32>, line: u32) {
        self.current().push(Instruction::new(opcode, arg, line));
    }

    /// Emits a jump-family instruction referencing `label`.
    pub fn emit_label(&mut self, opcode: Opcode, label: Label, line: u32) {
        let mut instruction = Instruction::new(opcode, None, line);
        instruction.label = Some(label);
        self.current().push(instruction);
    }

    /// Interns a static payload, returning its offset.
    pub fn add_static(&mut self, payload: VStatic) -> i32 {
        intern(&mut self.statics, payload)
    }

    /// Interns a symbol payload, returning its offset.
    pub fn add_symbol(&mut self, payload: VSymbol) -> i32 {
        intern(&mut self.symbols, payload)
    }

    /// Interns a function payload, returning its offset.
    pub fn add_function(&mut self, payload: VFunction) -> i32 {
        intern(&mut self.functions, payload)
    }

    fn add_jump(&mut self, payload: VJump) -> i32 {
        intern(&mut self.jumps, payload)
    }

    /// Stitches the snippets into the seamless stream.
    ///
    /// First pass: each snippet's label target becomes the current seamless
    /// length, then its instructions are appended. Second pass: every
    /// instruction carrying a label is rewritten to reference a jump payload
    /// holding the label's absolute target. Labels are ignored at runtime
    /// afterwards.
    pub fn complete(&mut self) {
        let mut seamless = Vec::new();
        for snippet in &self.snippets {
            self.labels[snippet.label.index()] = Some(u32::try_from(seamless.len()).unwrap_or(u32::MAX));
            seamless.extend(snippet.code.iter().cloned());
        }
        for index in 0..seamless.len() {
            let Some(label) = seamless[index].label else { continue };
            let target = self.labels[label.index()].unwrap_or(0);
            let arg = self.add_jump(VJump { target });
            seamless[index].arg = Some(arg);
        }
        self.seamless = seamless;
    }

    /// The instruction at `ip`. Panics on invalid indices, which only valid
    /// stitched bytecode can avoid; the compiler guarantees it.
    #[must_use]
    pub fn at(&self, ip: usize) -> &Instruction {
        &self.seamless[ip]
    }

    /// Resolved jump target of a stitched jump instruction.
    #[must_use]
    pub fn jump_target(&self, instruction: &Instruction) -> Option<usize> {
        let arg = usize::try_from(instruction.arg?).ok()?;
        self.jumps.get(arg).map(|j| j.target as usize)
    }

    fn fmt_instruction(&self, f: &mut String, instruction: &Instruction, seamless: bool) {
        let _ = write!(f, "  {}", instruction.opcode);
        match instruction.opcode.payload() {
            Payload::None => {
                if instruction.opcode == Opcode::Ens
                    && let Some(arg) = instruction.arg
                    && let Some(payload) = self.statics.get(usize::try_from(arg).unwrap_or(usize::MAX))
                {
                    let _ = write!(f, " {payload}");
                }
            }
            Payload::Static => {
                if let Some(payload) = instruction
                    .arg
                    .and_then(|arg| self.statics.get(usize::try_from(arg).unwrap_or(usize::MAX)))
                {
                    let _ = write!(f, " {payload}");
                }
            }
            Payload::Jump => {
                if seamless {
                    if let Some(target) = self.jump_target(instruction) {
                        let _ = write!(f, " ->{target}");
                    }
                } else if let Some(label) = instruction.label {
                    let _ = write!(f, " @{}", label.index());
                }
            }
            Payload::Symbol => {
                if let Some(payload) = instruction
                    .arg
                    .and_then(|arg| self.symbols.get(usize::try_from(arg).unwrap_or(usize::MAX)))
                {
                    let _ = write!(f, " {payload}");
                }
            }
            Payload::Function => {
                if let Some(payload) = instruction
                    .arg
                    .and_then(|arg| self.functions.get(usize::try_from(arg).unwrap_or(usize::MAX)))
                {
                    let _ = write!(f, " {}/{}", payload.symbol.name, payload.arity);
                }
            }
        }
        f.push('\n');
    }

    /// Disassembles the snippet form.
    #[must_use]
    pub fn disassemble_snippets(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} ({}):", self.name, self.file);
        for snippet in &self.snippets {
            let _ = writeln!(out, " @{}:", snippet.label.index());
            for instruction in &snippet.code {
                self.fmt_instruction(&mut out, instruction, false);
            }
        }
        out
    }

    /// Disassembles the seamless form. Meaningful after [`Chunk::complete`].
    #[must_use]
    pub fn disassemble_seamless(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} ({}):", self.name, self.file);
        for instruction in &self.seamless {
            self.fmt_instruction(&mut out, instruction, true);
        }
        out
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seamless.is_empty() {
            f.write_str(&self.disassemble_snippets())
        } else {
            f.write_str(&self.disassemble_seamless())
        }
    }
}

/// Appends `payload` unless an equal one exists, returning its offset.
fn intern<T: PartialEq>(storage: &mut Vec<T>, payload: T) -> i32 {
    if let Some(index) = storage.iter().position(|existing| *existing == payload) {
        return i32::try_from(index).unwrap_or(i32::MAX);
    }
    storage.push(payload);
    i32::try_from(storage.len() - 1).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> Chunk {
        Chunk::new(&Rc::from("test.vsp"), "core")
    }

    #[test]
    fn statics_deduplicate_on_insert() {
        let mut chunk = chunk();
        let a = chunk.add_static(VStatic::Num(3.into()));
        let b = chunk.add_static(VStatic::Str("3".to_owned()));
        let c = chunk.add_static(VStatic::Num(3.into()));
        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[test]
    fn complete_resolves_labels_to_instruction_indices() {
        let mut chunk = chunk();
        let skip = chunk.label();
        chunk.emit_label(Opcode::J, skip, 1);
        chunk.emit(Opcode::True, None, 1);
        chunk.open(skip);
        chunk.emit(Opcode::False, None, 1);
        chunk.emit(Opcode::Ret, None, 1);
        chunk.complete();

        assert_eq!(chunk.seamless.len(), 4);
        // The jump lands on the FALSE at index 2.
        assert_eq!(chunk.jump_target(&chunk.seamless[0]), Some(2));
    }

    #[test]
    fn every_jump_targets_a_valid_instruction() {
        let mut chunk = chunk();
        let again = chunk.label();
        let out = chunk.label();
        chunk.open(again);
        chunk.emit(Opcode::True, None, 1);
        chunk.emit_label(Opcode::Jif, out, 1);
        chunk.emit_label(Opcode::J, again, 1);
        chunk.open(out);
        chunk.emit(Opcode::Ret, None, 1);
        chunk.complete();

        for instruction in &chunk.seamless {
            if instruction.opcode.payload() == Payload::Jump {
                let target = chunk.jump_target(instruction).unwrap();
                assert!(target < chunk.seamless.len());
            }
        }
    }

    #[test]
    fn snippet_and_seamless_forms_agree_modulo_labels() {
        let mut chunk = chunk();
        let out = chunk.label();
        chunk.emit(Opcode::True, None, 1);
        chunk.emit_label(Opcode::Jif, out, 1);
        chunk.emit(Opcode::False, None, 1);
        chunk.open(out);
        chunk.emit(Opcode::Ret, None, 1);
        chunk.complete();

        let opcodes = |text: String| -> Vec<String> {
            text.lines()
                .filter(|line| line.starts_with("  "))
                .map(|line| line.trim().split(' ').next().unwrap_or("").to_owned())
                .collect()
        };
        assert_eq!(
            opcodes(chunk.disassemble_snippets()),
            opcodes(chunk.disassemble_seamless())
        );
    }
}
