//! Iterated peephole passes over a chunk's snippets.
//!
//! Rewrites happen strictly inside basic blocks, so jump labels (which
//! target snippets, not instruction offsets) stay valid. Each pass scans
//! every snippet with a sliding window; passes repeat up to the configured
//! count or until a whole pass changes nothing.

use bigdecimal::Zero;

use crate::bytecode::{
    chunk::{Chunk, Instruction, VStatic},
    op::Opcode,
};

/// The default pass count; the CLI's `-O LEVEL` multiplies it.
pub const DEFAULT_PASSES: u32 = 8;

/// Runs the peephole passes over one chunk.
pub fn optimize(chunk: &mut Chunk, passes: u32) {
    for _ in 0..passes {
        let mut changed = false;
        for index in 0..chunk.snippets.len() {
            let mut code = std::mem::take(&mut chunk.snippets[index].code);
            changed |= optimize_code(&mut code, chunk);
            chunk.snippets[index].code = code;
        }
        if !changed {
            return;
        }
    }
}

/// One pass over one snippet. Returns whether anything changed.
fn optimize_code(code: &mut Vec<Instruction>, chunk: &mut Chunk) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i < code.len() {
        // Dead tail after an instruction that never falls through.
        if code[i].opcode.terminal() && i + 1 < code.len() {
            code.truncate(i + 1);
            changed = true;
            continue;
        }
        if i + 2 < code.len() && fold_triple(code, i, chunk) {
            changed = true;
            i = i.saturating_sub(2);
            continue;
        }
        if i + 1 < code.len() && fold_pair(code, i) {
            changed = true;
            i = i.saturating_sub(2);
            continue;
        }
        i += 1;
    }
    changed
}

fn static_num(chunk: &Chunk, instruction: &Instruction) -> Option<bigdecimal::BigDecimal> {
    let arg = usize::try_from(instruction.arg?).ok()?;
    match chunk.statics.get(arg)? {
        VStatic::Num(n) => Some(n.clone()),
        _ => None,
    }
}

fn static_str<'c>(chunk: &'c Chunk, instruction: &Instruction) -> Option<&'c str> {
    let arg = usize::try_from(instruction.arg?).ok()?;
    match chunk.statics.get(arg)? {
        VStatic::Str(s) => Some(s.as_str()),
        _ => None,
    }
}

/// Windows of three: constant folding and empty-concat elimination.
fn fold_triple(code: &mut Vec<Instruction>, i: usize, chunk: &mut Chunk) -> bool {
    let (a, b, c) = (&code[i], &code[i + 1], &code[i + 2]);
    match (a.opcode, b.opcode, c.opcode) {
        // NUM n, NUM m, BINARY op -> NUM (n op m).
        (Opcode::Num, Opcode::Num, Opcode::Binary) => {
            let Some(op) = static_str(chunk, c) else { return false };
            if !matches!(op, "+" | "-" | "*" | "/") {
                return false;
            }
            let (Some(n), Some(m)) = (static_num(chunk, a), static_num(chunk, b)) else {
                return false;
            };
            if op == "/" && m.is_zero() {
                return false;
            }
            let folded = match op {
                "+" => n + m,
                "-" => n - m,
                "*" => n * m,
                _ => n / m,
            };
            let line = code[i].line;
            let arg = chunk.add_static(VStatic::Num(folded));
            code.splice(i..i + 3, [Instruction::new(Opcode::Num, Some(arg), line)]);
            true
        }
        // STR s, STR t, BINARY "~" -> STR (s ++ t).
        (Opcode::Str, Opcode::Str, Opcode::Binary) => {
            if static_str(chunk, c) != Some("~") {
                return false;
            }
            let (Some(s), Some(t)) = (static_str(chunk, a), static_str(chunk, b)) else {
                return false;
            };
            let joined = format!("{s}{t}");
            let line = code[i].line;
            let arg = chunk.add_static(VStatic::Str(joined));
            code.splice(i..i + 3, [Instruction::new(Opcode::Str, Some(arg), line)]);
            true
        }
        // BINARY "~", STR "", BINARY "~" -> BINARY "~".
        (Opcode::Binary, Opcode::Str, Opcode::Binary) => {
            if static_str(chunk, a) != Some("~") || static_str(chunk, c) != Some("~") {
                return false;
            }
            if static_str(chunk, b) != Some("") {
                return false;
            }
            code.drain(i + 1..i + 3);
            true
        }
        _ => false,
    }
}

/// Windows of two: redundant conversions, assign-then-pop, fast bumps and
/// push-then-pop elimination.
fn fold_pair(code: &mut Vec<Instruction>, i: usize) -> bool {
    let (a, b) = (&code[i], &code[i + 1]);
    match (a.opcode, b.opcode) {
        // A literal is already its own conversion.
        (Opcode::Num, Opcode::Ton) | (Opcode::Str, Opcode::Tos) | (Opcode::Vec, Opcode::Tov) => {
            code.remove(i + 1);
            true
        }
        // Assign-then-discard keeps nothing on the stack.
        (Opcode::SetTap, Opcode::Pop) => {
            code[i].opcode = Opcode::SetPop;
            code.remove(i + 1);
            true
        }
        (Opcode::Inc, Opcode::Pop) => {
            code[i].opcode = Opcode::FastInc;
            code.remove(i + 1);
            true
        }
        (Opcode::Dec, Opcode::Pop) => {
            code[i].opcode = Opcode::FastDec;
            code.remove(i + 1);
            true
        }
        // A negation feeding a conditional jump inverts the jump instead.
        (Opcode::Toib, Opcode::Jif) => {
            code.remove(i);
            code[i].opcode = Opcode::Jit;
            true
        }
        (Opcode::Toib, Opcode::Jit) => {
            code.remove(i);
            code[i].opcode = Opcode::Jif;
            true
        }
        // Pushing one value and dropping it does nothing.
        (puts_one, Opcode::Pop) if puts_one.puts_one() => {
            code.drain(i..i + 2);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::{bytecode::Compiler, read::Reader, transform::transform_all};

    fn optimized(src: &str) -> Vec<Chunk> {
        let mut reader = Reader::new("test.vsp", src).unwrap();
        let mut quotes = reader.read().unwrap();
        transform_all(&mut quotes).unwrap();
        let file = Rc::from("test.vsp");
        let mut chunks = Compiler::new(&file, "core", None).compile(&quotes).unwrap();
        for chunk in &mut chunks {
            optimize(chunk, DEFAULT_PASSES);
        }
        chunks
    }

    fn opcodes(chunk: &Chunk) -> Vec<Opcode> {
        chunk.snippets.iter().flat_map(|s| s.code.iter().map(|i| i.opcode)).collect()
    }

    #[test]
    fn constant_arithmetic_folds_to_one_num() {
        let chunks = optimized("1 + 2 * 3");
        let ops = opcodes(&chunks[0]);
        assert_eq!(ops, vec![Opcode::Num, Opcode::Ret]);
        assert!(chunks[0].statics.contains(&VStatic::Num(7.into())));
    }

    #[test]
    fn division_by_literal_zero_is_left_alone() {
        let chunks = optimized("1 / 0");
        assert!(opcodes(&chunks[0]).contains(&Opcode::Binary));
    }

    #[test]
    fn string_concat_folds() {
        let chunks = optimized(r#""a" ~ "b""#);
        let ops = opcodes(&chunks[0]);
        assert_eq!(ops, vec![Opcode::Str, Opcode::Ret]);
        assert!(chunks[0].statics.contains(&VStatic::Str("ab".to_owned())));
    }

    #[test]
    fn tap_assign_then_pop_becomes_pop_assign() {
        let chunks = optimized("a = 1; 2");
        let ops = opcodes(&chunks[0]);
        assert!(ops.contains(&Opcode::SetPop));
        assert!(!ops.contains(&Opcode::SetTap));
    }

    #[test]
    fn pushed_then_popped_literals_vanish() {
        // The first statement's value is unused and folds away entirely.
        let chunks = optimized("1; 2");
        assert_eq!(opcodes(&chunks[0]), vec![Opcode::Num, Opcode::Ret]);
    }

    #[test]
    fn negated_conditions_invert_the_jump() {
        let chunks = optimized("fun f(c) { if not c 1 else 2; }");
        let body = opcodes(&chunks[1]);
        assert!(body.contains(&Opcode::Jit));
        assert!(!body.contains(&Opcode::Toib));
    }

    #[test]
    fn dead_code_after_a_jump_is_trimmed() {
        let chunks = optimized("loop (false) 1");
        for snippet in &chunks[0].snippets {
            for (index, instruction) in snippet.code.iter().enumerate() {
                if instruction.opcode.terminal() {
                    assert_eq!(index, snippet.code.len() - 1);
                }
            }
        }
    }
}
