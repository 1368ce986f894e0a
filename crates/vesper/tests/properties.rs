//! Universal pipeline properties over whole programs.

use std::rc::Rc;

use pretty_assertions::assert_eq;
use vesper::{Chunk, Compiler, DEFAULT_PASSES, Opcode, Payload, Reader, optimize, transform_all};

const PROGRAM: &str = "\
    fun add(a, b) given num, num = a + b;\n\
    fun greet(who) = \"hi, $who\";\n\
    box Point(x, y) { sum = x + y; }\n\
    v = [1, 2, 3 | _ > 1];\n\
    m = %{a: 1};\n\
    m[\"b\"] = add(1, 1);\n\
    loop (i = 0; i < 3; i++) greet(i);\n\
    ensure 1 + 2 is 3;\n\
    '[a, b];\n\
    |+| v";

fn compiled(src: &str, passes: u32) -> Vec<Chunk> {
    let mut reader = Reader::new("prop.vsp", src).unwrap();
    let mut quotes = reader.read().unwrap();
    transform_all(&mut quotes).unwrap();
    let file: Rc<str> = Rc::from("prop.vsp");
    let mut chunks = Compiler::new(&file, "prop", None).compile(&quotes).unwrap();
    for chunk in &mut chunks {
        optimize(chunk, passes);
        chunk.complete();
    }
    chunks
}

#[test]
fn transformation_is_idempotent() {
    let mut reader = Reader::new("prop.vsp", PROGRAM).unwrap();
    let mut quotes = reader.read().unwrap();
    transform_all(&mut quotes).unwrap();
    let once = quotes.clone();
    transform_all(&mut quotes).unwrap();
    assert_eq!(once, quotes);
}

#[test]
fn constant_foldable_arithmetic_becomes_one_num() {
    for src in ["1 + 2 * 3", "(4 - 1) * (2 + 5)", "10 / 4 + 0.5"] {
        let chunks = compiled(src, DEFAULT_PASSES);
        let ops: Vec<Opcode> = chunks[0].seamless.iter().map(|i| i.opcode).collect();
        assert_eq!(ops, vec![Opcode::Num, Opcode::Ret], "{src} did not fold");
    }
}

#[test]
fn every_jump_lands_on_a_valid_instruction_after_completion() {
    for chunk in compiled(PROGRAM, DEFAULT_PASSES) {
        for instruction in &chunk.seamless {
            if instruction.opcode.payload() == Payload::Jump {
                let target = chunk
                    .jump_target(instruction)
                    .expect("a stitched jump always has a payload");
                assert!(
                    target < chunk.seamless.len(),
                    "jump to {target} escapes chunk {} (length {})",
                    chunk.name,
                    chunk.seamless.len()
                );
            }
        }
    }
}

#[test]
fn disassembly_forms_agree_modulo_labels() {
    for chunk in compiled(PROGRAM, DEFAULT_PASSES) {
        let opcodes = |text: String| -> Vec<String> {
            text.lines()
                .filter(|line| line.starts_with("  "))
                .map(|line| line.trim().split(' ').next().unwrap_or("").to_owned())
                .collect()
        };
        assert_eq!(
            opcodes(chunk.disassemble_snippets()),
            opcodes(chunk.disassemble_seamless()),
            "chunk {} disagrees between forms",
            chunk.name
        );
    }
}

#[test]
fn optimization_level_zero_still_runs_correctly() {
    // The optimizer is an optimization, not a semantic stage.
    let unoptimized = compiled("1 + 2 * 3", 0);
    let ops: Vec<Opcode> = unoptimized[0].seamless.iter().map(|i| i.opcode).collect();
    assert!(ops.contains(&Opcode::Binary));
}
