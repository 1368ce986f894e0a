//! Bytecode representation, compiler, optimizer and stitcher.
//!
//! A source unit compiles into a list of [`Chunk`]s: one for the unit body
//! and one per function, box or lambda body. Each chunk is built as labeled
//! snippets (basic blocks), peephole-optimized, then stitched into a
//! seamless instruction stream with absolute jump payloads.
//!
//! # Module structure
//!
//! - `op` - the opcode set and payload taxonomy
//! - `chunk` - labels, snippets, instructions, payload storages, stitching
//! - `compile` - the quote-to-chunk compiler
//! - `optimize` - iterated peephole passes

pub use chunk::{Chunk, Instruction, Label, Snippet, VFunction, VJump, VStatic, VSymbol};
pub use compile::Compiler;
pub use op::{Opcode, Payload};
pub use optimize::{DEFAULT_PASSES, optimize};

mod chunk;
mod compile;
mod op;
mod optimize;
