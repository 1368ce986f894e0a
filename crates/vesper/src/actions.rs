//! Side-effecting builtins and their permission gate.
//!
//! Every action is tagged with a [`Category`]; invocation consults the
//! per-category [`ActionPermissions`] and fails with an
//! [`ActionError`](crate::error::ActionError) when the category is disabled.
//! The actual I/O goes through the [`ActionIo`] seam so embedders and tests
//! can capture or fake it.
//!
//! The double-underscore builtins (`__filter`, `__access_assign`) are core
//! plumbing targeted by the transformer's rewrites, not part of the action
//! surface; they carry no category and are always allowed.

use std::collections::VecDeque;
use std::io::{BufRead, Write as _};

use strum::Display;

use crate::{
    error::{ActionError, RunResult, RuntimeError, VesperError},
    machine::Machine,
    value::Value,
};

/// Permission category of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    Screen,
    Disk,
}

/// Per-category enable flags.
///
/// The screen defaults on so plain programs can speak; the disk defaults
/// off and must be granted explicitly.
#[derive(Debug, Clone, Copy)]
pub struct ActionPermissions {
    pub screen: bool,
    pub disk: bool,
}

impl Default for ActionPermissions {
    fn default() -> Self {
        Self {
            screen: true,
            disk: false,
        }
    }
}

impl ActionPermissions {
    #[must_use]
    pub fn allows(&self, category: Category) -> bool {
        match category {
            Category::Screen => self.screen,
            Category::Disk => self.disk,
        }
    }
}

/// The I/O seam actions go through.
pub trait ActionIo {
    /// Prints a line to the screen.
    fn say(&mut self, line: &str);
    /// Prints without a newline.
    fn burp(&mut self, text: &str);
    /// Prompts and reads one line; `None` at end of input.
    fn ask(&mut self, prompt: &str) -> Option<String>;
    /// Reads a file.
    fn slurp(&mut self, path: &str) -> Result<String, String>;
    /// Writes a file.
    fn write(&mut self, path: &str, text: &str) -> Result<(), String>;
}

/// The process's real stdin/stdout and filesystem.
#[derive(Debug, Default)]
pub struct StdIo;

impl ActionIo for StdIo {
    fn say(&mut self, line: &str) {
        println!("{line}");
    }

    fn burp(&mut self, text: &str) {
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    fn ask(&mut self, prompt: &str) -> Option<String> {
        print!("{prompt}");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\n', '\r']).to_owned()),
        }
    }

    fn slurp(&mut self, path: &str) -> Result<String, String> {
        std::fs::read_to_string(path).map_err(|e| format!("cannot slurp {path}: {e}"))
    }

    fn write(&mut self, path: &str, text: &str) -> Result<(), String> {
        std::fs::write(path, text).map_err(|e| format!("cannot write {path}: {e}"))
    }
}

/// Captures output and replays canned answers. For tests and embedders.
#[derive(Debug, Default)]
pub struct CollectIo {
    pub lines: Vec<String>,
    pub answers: VecDeque<String>,
}

impl ActionIo for CollectIo {
    fn say(&mut self, line: &str) {
        self.lines.push(line.to_owned());
    }

    fn burp(&mut self, text: &str) {
        self.lines.push(text.to_owned());
    }

    fn ask(&mut self, _prompt: &str) -> Option<String> {
        self.answers.pop_front()
    }

    fn slurp(&mut self, path: &str) -> Result<String, String> {
        Err(format!("cannot slurp {path}: no disk in this session"))
    }

    fn write(&mut self, _path: &str, _text: &str) -> Result<(), String> {
        Ok(())
    }
}

/// A builtin function value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Say,
    Ask,
    Burp,
    Slurp,
    Write,
    /// `__filter`: keep the elements a predicate accepts.
    Filter,
    /// `__access_assign`: the lowered form of `a[k] = v`.
    AccessAssign,
}

impl Builtin {
    /// The surface name the builtin is bound to.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Say => "say",
            Self::Ask => "ask",
            Self::Burp => "burp",
            Self::Slurp => "slurp",
            Self::Write => "write",
            Self::Filter => "__filter",
            Self::AccessAssign => "__access_assign",
        }
    }

    /// The permission category, if the builtin is an action.
    #[must_use]
    pub fn category(self) -> Option<Category> {
        match self {
            Self::Say | Self::Ask | Self::Burp => Some(Category::Screen),
            Self::Slurp | Self::Write => Some(Category::Disk),
            Self::Filter | Self::AccessAssign => None,
        }
    }

    /// All builtins that get seeded into the global scope.
    #[must_use]
    pub fn all() -> &'static [Self] {
        &[
            Self::Say,
            Self::Ask,
            Self::Burp,
            Self::Slurp,
            Self::Write,
            Self::Filter,
            Self::AccessAssign,
        ]
    }

    /// Invokes the builtin.
    ///
    /// Runtime errors raised here carry no position; the machine patches in
    /// the current file and line before surfacing them.
    pub fn call(self, machine: &mut Machine<'_>, args: Vec<Value>) -> RunResult<Value> {
        if let Some(category) = self.category()
            && !machine.permissions().allows(category)
        {
            return Err(ActionError::new(self.name(), category.to_string()).into());
        }
        match self {
            Self::Say => {
                let line = join_displayed(&args);
                machine.io().say(&line);
                Ok(Value::str(line))
            }
            Self::Burp => {
                let text = join_displayed(&args);
                machine.io().burp(&text);
                Ok(Value::str(text))
            }
            Self::Ask => {
                let prompt = join_displayed(&args);
                match machine.io().ask(&prompt) {
                    Some(answer) => Ok(Value::str(answer)),
                    None => Ok(Value::Bool(false)),
                }
            }
            Self::Slurp => {
                let path = one_str(self, &args)?;
                let contents = machine.io().slurp(&path).map_err(here)?;
                Ok(Value::str(contents))
            }
            Self::Write => {
                let [path, text] = args.as_slice() else {
                    return Err(here(format!("write expects a path and a text, got {} argument(s)", args.len())));
                };
                let path = path.to_string();
                let text = text.to_string();
                machine.io().write(&path, &text).map_err(here)?;
                Ok(Value::Bool(true))
            }
            Self::Filter => {
                let [source, predicate] = args.as_slice() else {
                    return Err(here(format!(
                        "__filter expects a vector and a predicate, got {} argument(s)",
                        args.len()
                    )));
                };
                let mut kept = Vec::new();
                for item in source.to_vec()? {
                    let verdict = machine.call_value(predicate.clone(), vec![item.clone()])?;
                    if verdict.truthy() {
                        kept.push(item);
                    }
                }
                Ok(Value::vec(kept))
            }
            Self::AccessAssign => access_assign(&args),
        }
    }
}

fn join_displayed(args: &[Value]) -> String {
    args.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
}

fn one_str(builtin: Builtin, args: &[Value]) -> RunResult<String> {
    let [arg] = args else {
        return Err(here(format!(
            "{} expects one argument, got {}",
            builtin.name(),
            args.len()
        )));
    };
    Ok(arg.to_string())
}

/// A runtime error without a position; the machine fills it in.
fn here(message: impl Into<String>) -> VesperError {
    RuntimeError::new(message, "", 0).into()
}

/// `a[key, …] = value`, lowered: mutates the container in place and yields
/// the assigned value.
fn access_assign(args: &[Value]) -> RunResult<Value> {
    let [head, value, keys @ ..] = args else {
        return Err(here("__access_assign expects a container, a value and at least one key"));
    };
    if keys.is_empty() {
        return Err(here("__access_assign expects at least one key"));
    }
    for key in keys {
        match head {
            Value::Vec(items) => {
                let index = key.to_num()?;
                let mut items = items.borrow_mut();
                let index: usize = index
                    .to_string()
                    .parse()
                    .map_err(|_| here(format!("cannot index a vec with {key}")))?;
                if index >= items.len() {
                    return Err(here(format!("index {index} is out of bounds (length {})", items.len())));
                }
                items[index] = value.clone();
            }
            Value::Map(pairs) => {
                pairs.borrow_mut().insert(key.to_string(), value.clone());
            }
            Value::Instance(instance) => {
                instance.scope.borrow_mut().insert(key.to_string(), value.clone());
            }
            other => {
                return Err(here(format!("cannot assign into a {}", other.type_of())));
            }
        }
    }
    Ok(value.clone())
}
