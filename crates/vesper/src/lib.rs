//! Vesper: a bytecode interpreter for a dynamically typed,
//! expression-oriented scripting language.
//!
//! The pipeline: the reader (a Pratt parser with read-time macros) turns
//! source into quotes; the transformer lowers sugar and patterns; the
//! compiler emits labeled snippets into chunks; the peephole optimizer and
//! the stitcher finish them; the stack machine runs them. The orchestrator
//! coordinates multiple units, resolving `distinct`/`expose` against an
//! external oracle.
//!
//! # Example
//!
//! ```
//! use vesper::{CollectIo, MapLoader, NullOracle, Orchestra, Settings};
//!
//! let mut orchestra = Orchestra::new(NullOracle, MapLoader::new(), CollectIo::default(), Settings::default());
//! let result = orchestra.run("demo.vsp", "fun add(a, b) given num, num = a + b; add(2, 3)").unwrap();
//! assert_eq!(result.to_string(), "5");
//! ```

pub use crate::{
    actions::{ActionIo, ActionPermissions, Builtin, Category, CollectIo, StdIo},
    bytecode::{Chunk, Compiler, DEFAULT_PASSES, Instruction, Opcode, Payload, optimize},
    error::{
        ActionError, CompileError, ExposeError, InternalError, ModelCastError, ReadError, RuntimeError, Trace,
        VesperError, user_visible,
    },
    machine::Machine,
    oracle::{FsLoader, MapLoader, MapOracle, NullOracle, Oracle, SourceLoader, TcpOracle},
    orchestra::{Orchestra, Settings},
    read::Reader,
    transform::{transform, transform_all},
    value::{Value, ValueType},
};

mod actions;
mod bytecode;
mod error;
mod lexer;
mod machine;
mod oracle;
mod orchestra;
mod parselets;
mod pattern;
mod quote;
mod read;
mod transform;
mod value;
mod word;

pub use lexer::{Lexer, Trigger};
pub use quote::{FieldAccessor, Parameter, Parameters, QTag, Quote, QuoteKind};
pub use word::{Word, kind};
