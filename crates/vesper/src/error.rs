//! Error taxonomy for the interpreter pipeline.
//!
//! Each pipeline stage owns one error kind: the reader raises [`ReadError`],
//! the compiler [`CompileError`], the machine [`RuntimeError`], the
//! orchestrator [`ExposeError`]. [`InternalError`] marks interpreter
//! invariant violations and is always fatal. [`ActionError`] is the
//! permission-gated rejection of a side-effecting builtin, and
//! [`ModelCastError`] a refused value coercion.
//!
//! Every kind serializes to a `{"Type": …, "Payload": …}` record so machine
//! consumers can route on the kind without parsing the message.

use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};

/// Result alias for reader operations.
pub type ReadResult<T> = Result<T, ReadError>;

/// Result alias for compiler operations.
pub type CompileResult<T> = Result<T, CompileError>;

/// Result alias for anything executed under the machine, where every kind of
/// failure can surface.
pub type RunResult<T> = Result<T, VesperError>;

/// One entry of an error traceback.
///
/// Traces accumulate outermost-first while the compiler descends into
/// function bodies, and innermost-first while the machine unwinds frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    /// What the traced region is (a function name, an ensure title, …).
    pub name: String,
    /// File the region was read from.
    pub file: String,
    /// Line the region starts at (compile) or was executing (runtime).
    pub line: u32,
}

impl Trace {
    pub fn new(name: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.file, self.line)
    }
}

/// Lexical or parse failure. Aborts the unit immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadError {
    pub message: String,
    pub file: String,
    pub line: u32,
    /// The nearest lexeme, when one was available at the failure point.
    pub lexeme: Option<String>,
}

impl ReadError {
    pub fn new(message: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            file: file.into(),
            line,
            lexeme: None,
        }
    }

    #[must_use]
    pub fn with_lexeme(mut self, lexeme: impl Into<String>) -> Self {
        self.lexeme = Some(lexeme.into());
        self
    }
}

/// Semantic failure during compilation: unknown symbol in a strict context,
/// an illegal construct, a leaked read-time form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileError {
    pub message: String,
    pub file: String,
    pub line: u32,
    /// Traces accumulated by `trace(tag, name)` guards around nested
    /// function compilation, outermost first.
    pub traces: Vec<Trace>,
}

impl CompileError {
    pub fn new(message: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            file: file.into(),
            line,
            traces: Vec::new(),
        }
    }
}

/// Failure during machine execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeError {
    pub message: String,
    pub file: String,
    pub line: u32,
    /// Frames unwound past on the way out, innermost first.
    pub traces: Vec<Trace>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            file: file.into(),
            line,
            traces: Vec::new(),
        }
    }
}

/// An interpreter invariant violation. Not recoverable by the program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalError {
    pub message: String,
}

impl InternalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Module resolution failure: unknown distinct, transport failure, or a
/// denied/cyclic expose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposeError {
    pub message: String,
    /// The dotted distinct path being resolved, when known.
    pub distinct: Option<String>,
}

impl ExposeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            distinct: None,
        }
    }

    #[must_use]
    pub fn with_distinct(mut self, distinct: impl Into<String>) -> Self {
        self.distinct = Some(distinct.into());
        self
    }
}

/// Rejection of a permission-gated side effect.
///
/// The message names the flag that would allow the action, e.g.
/// `say not allowed: try with --with-screen`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    /// The action that was invoked.
    pub name: String,
    /// The permission category the action is tagged with.
    pub category: String,
}

impl ActionError {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }
}

/// A value could not be coerced as requested (`to_num` on a non-numeric
/// string, `to_vec` on an oversized range, …).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCastError {
    pub message: String,
}

impl ModelCastError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The umbrella over every error kind the interpreter can produce.
///
/// Serializes adjacently tagged, so the wire form is
/// `{"Type": "Runtime", "Payload": {…}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Payload")]
pub enum VesperError {
    Read(ReadError),
    Compile(CompileError),
    Runtime(RuntimeError),
    Internal(InternalError),
    Expose(ExposeError),
    Action(ActionError),
    ModelCast(ModelCastError),
}

impl VesperError {
    /// The lowercase kind name used in the `[kind] message` display form.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read(_) => "read error",
            Self::Compile(_) => "compile error",
            Self::Runtime(_) => "runtime error",
            Self::Internal(_) => "internal error",
            Self::Expose(_) => "expose error",
            Self::Action(_) => "action error",
            Self::ModelCast(_) => "model cast error",
        }
    }

    /// The bare message, without kind prefix or traces.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Read(e) => e.message.clone(),
            Self::Compile(e) => e.message.clone(),
            Self::Runtime(e) => e.message.clone(),
            Self::Internal(e) => e.message.clone(),
            Self::Expose(e) => e.message.clone(),
            Self::Action(e) => format!("{} not allowed: try with --with-{}", e.name, e.category),
            Self::ModelCast(e) => e.message.clone(),
        }
    }

    /// Traces attached to this error, if the kind carries any.
    #[must_use]
    pub fn traces(&self) -> &[Trace] {
        match self {
            Self::Compile(e) => &e.traces,
            Self::Runtime(e) => &e.traces,
            _ => &[],
        }
    }

    /// Whether this error may be caught by a `dies` region.
    ///
    /// Read, compile, expose and internal failures are never observable from
    /// inside the running program.
    #[must_use]
    pub fn dies_catchable(&self) -> bool {
        matches!(self, Self::Runtime(_) | Self::Action(_) | Self::ModelCast(_))
    }

    /// Serializes to the `{"Type": …, "Payload": …}` machine record.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"Type\":\"Internal\",\"Payload\":{{\"message\":\"unserializable error: {self}\"}}}}"))
    }
}

impl fmt::Display for VesperError {
    /// Formats as `[kind] message`, traces appended one per line, each with
    /// the offending source line indented underneath when the file is
    /// readable on disk.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind(), self.message())?;
        if let Self::Read(e) = self
            && let Some(lexeme) = &e.lexeme
        {
            write!(f, " (near {lexeme:?}, {}:{})", e.file, e.line)?;
        }
        for trace in self.traces() {
            write!(f, "\n  {trace}")?;
            if let Some(excerpt) = source_line(&trace.file, trace.line) {
                write!(f, "\n    {excerpt}")?;
            }
        }
        Ok(())
    }
}

impl From<ReadError> for VesperError {
    fn from(e: ReadError) -> Self {
        Self::Read(e)
    }
}

impl From<CompileError> for VesperError {
    fn from(e: CompileError) -> Self {
        Self::Compile(e)
    }
}

impl From<RuntimeError> for VesperError {
    fn from(e: RuntimeError) -> Self {
        Self::Runtime(e)
    }
}

impl From<InternalError> for VesperError {
    fn from(e: InternalError) -> Self {
        Self::Internal(e)
    }
}

impl From<ExposeError> for VesperError {
    fn from(e: ExposeError) -> Self {
        Self::Expose(e)
    }
}

impl From<ActionError> for VesperError {
    fn from(e: ActionError) -> Self {
        Self::Action(e)
    }
}

impl From<ModelCastError> for VesperError {
    fn from(e: ModelCastError) -> Self {
        Self::ModelCast(e)
    }
}

/// Reads the offending source line for a trace, if the file exists on disk.
///
/// Lines are 1-based; returns the trimmed line text.
fn source_line(file: &str, line: u32) -> Option<String> {
    if line == 0 {
        return None;
    }
    let contents = std::fs::read_to_string(file).ok()?;
    let text = contents.lines().nth(line as usize - 1)?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_owned())
}

/// Renders an error the way the CLI shows it, including the kind prefix.
///
/// Exists so hosts embedding the interpreter don't have to re-implement the
/// trace formatting to match the CLI byte for byte.
#[must_use]
pub fn user_visible(error: &VesperError) -> String {
    let mut out = String::new();
    // Display cannot fail when writing into a String.
    let _ = write!(out, "{error}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_has_kind_prefix() {
        let err = VesperError::Read(ReadError::new("malformed input", "test.vsp", 3));
        assert_eq!(format!("{err}"), "[read error] malformed input");
    }

    #[test]
    fn action_message_names_the_flag() {
        let err = VesperError::Action(ActionError::new("slurp", "disk"));
        assert_eq!(format!("{err}"), "[action error] slurp not allowed: try with --with-disk");
    }

    #[test]
    fn json_record_is_adjacently_tagged() {
        let err = VesperError::Internal(InternalError::new("boom"));
        let json: serde_json::Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(json["Type"], "Internal");
        assert_eq!(json["Payload"]["message"], "boom");
    }

    #[test]
    fn traces_render_with_location() {
        let mut err = RuntimeError::new("division by zero", "main.vsp", 9);
        err.traces.push(Trace::new("half", "main.vsp", 4));
        let shown = format!("{}", VesperError::Runtime(err));
        assert!(shown.starts_with("[runtime error] division by zero"));
        assert!(shown.contains("half (main.vsp:4)"));
    }
}
