//! The opcode set.
//!
//! Opcodes fall into five payload categories: no payload, a static payload
//! (index into the chunk's statics), a jump payload (index into the chunk's
//! jumps, holding an absolute instruction index after stitching), a symbol
//! payload, and a function payload. The category decides how the `arg` field
//! of an [`Instruction`](super::Instruction) is interpreted.
//!
//! `JIF` doubles as the guard-if-false-then-pop jump the compiler uses for
//! `if`: it pops the condition and jumps when it was falsy.

use strum::{Display, IntoStaticStr};

/// How an instruction's `arg` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    None,
    /// Index into `statics`. `ENS` alone may omit the payload.
    Static,
    /// Index into `jumps`.
    Jump,
    /// Index into `symbols`.
    Symbol,
    /// Index into `functions`.
    Function,
}

/// One opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    // --- no payload ---
    /// Pop the stack top.
    Pop,
    /// Pop the value below the stack top.
    Pop2,
    /// Pop the stack top if the stack is not empty.
    TryPop,
    /// Duplicate the stack top.
    Dup,
    /// Swap the two topmost values.
    Swap,
    /// Convert the top to Num.
    Ton,
    /// Convert the top to Str.
    Tos,
    /// Convert the top to Bool (truthiness).
    Tob,
    /// Convert the top to the inverse Bool.
    Toib,
    /// Convert the top to Vec (wrapping non-sequences).
    Tov,
    /// Push true.
    True,
    /// Push false.
    False,
    /// Push the hole sentinel.
    Hole,
    /// Negate the numeric top.
    Neg,
    /// Replace the top with its length.
    Len,
    /// Die unless the top is truthy; payload optionally names the assertion.
    Ens,
    /// Move the stack top onto the underscores stack.
    Uput,
    /// Pop the underscores stack onto the value stack.
    Upop,
    /// Copy the underscores top onto the value stack.
    Uref,
    /// Push the calling frame's underscores top (contextual parameters).
    Ctx,
    /// Empty the frame's value stack.
    Clear,
    /// Return from the current frame.
    Ret,
    /// Increment the numeric top.
    Inc,
    /// Decrement the numeric top.
    Dec,
    /// Increment folded with the following pop.
    FastInc,
    /// Decrement folded with the following pop.
    FastDec,
    /// Pop a value and append it to the spread accumulator unless it is the
    /// hole sentinel.
    MapAppend,
    /// Drain the remaining frame stack into one Vec, topmost value first.
    RemToVec,
    /// Push false if the frame stack is empty.
    FalseIfEmpty,
    /// Append the stack top to the frame's queue, leaving it in place.
    Queue,
    /// Push the frame's queue as a Vec.
    QueueVec,
    /// Collapse the frame into a box instance and return it.
    BoxInstance,
    /// Pop the field name, then the head, and push the resolved field.
    FieldEval,
    /// Close the innermost `dies` region.
    EndDies,

    // --- static payload ---
    /// Push a Num static.
    Num,
    /// Push a Str static.
    Str,
    /// Compile and push a Regex from a Str static.
    Pcre,
    /// Pop N values and push them as a Vec.
    Vec,
    /// Pop N key/value pairs and push them as a Map.
    Map,
    /// Pop N arguments and a callee, and invoke.
    Call,
    /// Fold the Vec on top with the named binary operator.
    Reduce,
    /// Apply the named binary operator to the two topmost values.
    Binary,
    /// Resolve the named field on the stack top.
    Field,
    /// Restart the enclosing function with N fresh arguments.
    NextFun,

    // --- jump payload ---
    /// Unconditional jump.
    J,
    /// Pop the top; jump if it was truthy.
    Jit,
    /// Pop the top; jump if it was falsy.
    Jif,
    /// Jump keeping the top if truthy, else pop (short-circuit `or`).
    JitElsePop,
    /// Jump keeping the top if falsy, else pop (short-circuit `and`).
    JifElsePop,
    /// Begin a spread over the Vec on top; jump out when it is empty.
    MapSetup,
    /// Feed the next element to the superlocal, or jump out when done.
    MapIter,
    /// Open a `dies` region whose handler is the jump target.
    SetupDies,

    // --- symbol payload ---
    /// Push the symbol's value.
    Sym,
    /// Pop the top into the symbol.
    SetPop,
    /// Assign the top to the symbol, leaving it in place.
    SetTap,

    // --- function payload ---
    /// Define a concrete function (or a variant of a generic one).
    Fun,
    /// Define a box template.
    Box,
    /// Close over the current scopes and push a lambda.
    Lam,
}

impl Opcode {
    /// The payload category of this opcode.
    #[must_use]
    pub fn payload(self) -> Payload {
        match self {
            Self::Pop
            | Self::Pop2
            | Self::TryPop
            | Self::Dup
            | Self::Swap
            | Self::Ton
            | Self::Tos
            | Self::Tob
            | Self::Toib
            | Self::Tov
            | Self::True
            | Self::False
            | Self::Hole
            | Self::Neg
            | Self::Len
            | Self::Ens
            | Self::Uput
            | Self::Upop
            | Self::Uref
            | Self::Ctx
            | Self::Clear
            | Self::Ret
            | Self::Inc
            | Self::Dec
            | Self::FastInc
            | Self::FastDec
            | Self::MapAppend
            | Self::RemToVec
            | Self::FalseIfEmpty
            | Self::Queue
            | Self::QueueVec
            | Self::BoxInstance
            | Self::FieldEval
            | Self::EndDies => Payload::None,
            Self::Num
            | Self::Str
            | Self::Pcre
            | Self::Vec
            | Self::Map
            | Self::Call
            | Self::Reduce
            | Self::Binary
            | Self::Field
            | Self::NextFun => Payload::Static,
            Self::J
            | Self::Jit
            | Self::Jif
            | Self::JitElsePop
            | Self::JifElsePop
            | Self::MapSetup
            | Self::MapIter
            | Self::SetupDies => Payload::Jump,
            Self::Sym | Self::SetPop | Self::SetTap => Payload::Symbol,
            Self::Fun | Self::Box | Self::Lam => Payload::Function,
        }
    }

    /// Whether the opcode's whole effect is pushing exactly one value.
    ///
    /// These are the instructions a following `POP` cancels out.
    #[must_use]
    pub fn puts_one(self) -> bool {
        matches!(
            self,
            Self::Num | Self::Str | Self::Pcre | Self::True | Self::False | Self::Hole | Self::Dup | Self::Sym
        )
    }

    /// Whether execution never falls through to the next instruction.
    #[must_use]
    pub fn terminal(self) -> bool {
        matches!(self, Self::J | Self::Ret | Self::BoxInstance | Self::NextFun)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_the_disassembly_names() {
        assert_eq!(Opcode::SetPop.to_string(), "SET_POP");
        assert_eq!(Opcode::JifElsePop.to_string(), "JIF_ELSE_POP");
        assert_eq!(Opcode::FalseIfEmpty.to_string(), "FALSE_IF_EMPTY");
    }

    #[test]
    fn payload_classification() {
        assert_eq!(Opcode::Pop.payload(), Payload::None);
        assert_eq!(Opcode::Num.payload(), Payload::Static);
        assert_eq!(Opcode::J.payload(), Payload::Jump);
        assert_eq!(Opcode::Sym.payload(), Payload::Symbol);
        assert_eq!(Opcode::Fun.payload(), Payload::Function);
    }
}
