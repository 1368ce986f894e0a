//! Error taxonomy behavior over whole programs: kinds, wire records,
//! traces and the user-visible rendering.

use pretty_assertions::assert_eq;
use vesper::{CollectIo, MapLoader, MapOracle, Orchestra, Settings, VesperError, user_visible};

fn run_err(src: &str) -> VesperError {
    let mut orchestra = Orchestra::new(MapOracle::new(), MapLoader::new(), CollectIo::default(), Settings::default());
    orchestra
        .run("err.vsp", src)
        .expect_err("the program should have died")
}

#[test]
fn lexical_garbage_is_a_read_error() {
    let error = run_err("1 + @");
    assert!(matches!(error, VesperError::Read(_)));
    assert!(error.to_string().contains("malformed input"));
}

#[test]
fn parse_failures_carry_the_nearest_lexeme() {
    let VesperError::Read(e) = run_err("fun 3() = 1;") else {
        panic!("expected a read error");
    };
    assert_eq!(e.file, "err.vsp");
    assert!(e.lexeme.is_some());
}

#[test]
fn illegal_constructs_are_compile_errors_with_traces() {
    let error = run_err("fun outer() { next loop; }");
    let VesperError::Compile(e) = &error else {
        panic!("expected a compile error, got {error}");
    };
    assert_eq!(e.traces.len(), 1);
    assert_eq!(e.traces[0].name, "outer");
}

#[test]
fn runtime_failures_report_file_and_line() {
    let VesperError::Runtime(e) = run_err("1;\n2;\n1 / 0") else {
        panic!("expected a runtime error");
    };
    assert_eq!(e.file, "err.vsp");
    assert_eq!(e.line, 3);
}

#[test]
fn undefined_symbols_die_at_runtime() {
    let error = run_err("nowhere + 1");
    assert!(error.to_string().contains("undefined symbol: nowhere"));
}

#[test]
fn wire_records_are_type_and_payload() {
    let error = run_err("1 / 0");
    let record: serde_json::Value = serde_json::from_str(&error.to_json()).unwrap();
    assert_eq!(record["Type"], "Runtime");
    assert_eq!(record["Payload"]["message"], "division by zero");
    assert_eq!(record["Payload"]["file"], "err.vsp");
}

#[test]
fn wire_records_round_trip() {
    let error = run_err("fun f(x) given num = x; f(\"s\")");
    let reparsed: VesperError = serde_json::from_str(&error.to_json()).unwrap();
    assert_eq!(reparsed, error);
}

#[test]
fn user_visible_form_is_kind_then_message() {
    let error = run_err("1 / 0");
    let shown = user_visible(&error);
    assert!(shown.starts_with("[runtime error] division by zero"));
}

#[test]
fn model_casts_are_their_own_kind() {
    // An oversized range refuses measurement with a model cast error.
    let error = run_err("#(0 to 999999)");
    assert!(matches!(error, VesperError::ModelCast(_)), "got {error}");
    assert!(error.to_string().contains("too wide"));
}
