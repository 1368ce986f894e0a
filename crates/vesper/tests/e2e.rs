//! End-to-end scenarios: source in, value (and screen output) out.

use pretty_assertions::assert_eq;
use vesper::{CollectIo, MapLoader, MapOracle, Orchestra, Settings, Value, VesperError};

fn run(src: &str) -> Result<(Value, Vec<String>), VesperError> {
    let mut orchestra = Orchestra::new(MapOracle::new(), MapLoader::new(), CollectIo::default(), Settings::default());
    let result = orchestra.run("main.vsp", src)?;
    let lines = std::mem::take(&mut orchestra.io_mut().lines);
    Ok((result, lines))
}

fn eval(src: &str) -> String {
    match run(src) {
        Ok((value, _)) => value.to_string(),
        Err(error) => panic!("{src:?} died: {error}"),
    }
}

fn dies(src: &str) -> VesperError {
    match run(src) {
        Ok((value, _)) => panic!("{src:?} unexpectedly survived with {value}"),
        Err(error) => error,
    }
}

#[test]
fn ensure_arithmetic_yields_the_left_operand() {
    assert_eq!(eval("ensure 1 + 2 is 3;"), "3");
}

#[test]
fn ensure_dies_on_a_false_claim() {
    let error = dies("ensure 1 + 2 is 4;");
    assert!(error.to_string().contains("ensure failed"));
}

#[test]
fn typed_function_dispatches_and_typechecks() {
    let src = "fun add(a, b) given num, num = a + b; add(2, 3)";
    assert_eq!(eval(src), "5");

    let bad = "fun add(a, b) given num, num = a + b; add(\"x\", \"y\")";
    let error = dies(bad).to_string();
    assert!(
        error.contains("typecheck") || error.contains("no concrete"),
        "unexpected message: {error}"
    );
}

#[test]
fn pattern_givens_bind_and_reject() {
    let src = "fun f(n) given '[a, b] = a + b; f([10, 20])";
    assert_eq!(eval(src), "30");

    let bad = "fun f(n) given '[a, b] = a + b; f([1, 2, 3])";
    dies(bad);
}

#[test]
fn patterns_work_directly_in_parameter_position() {
    let src = "fun f('[a, b]) = a * b; f([6, 7])";
    assert_eq!(eval(src), "42");
}

#[test]
fn pattern_parity_requires_equal_elements() {
    let src = "fun pair(p) given '[a, a] = a; pair([4, 4])";
    assert_eq!(eval(src), "4");
    dies("fun pair(p) given '[a, a] = a; pair([4, 5])");
}

#[test]
fn generic_dispatch_picks_by_argument_type() {
    let base = "fun g(x) given num = \"num\"; fun g(x) given str = \"str\";";
    assert_eq!(eval(&format!("{base} g(1)")), "num");
    assert_eq!(eval(&format!("{base} g(\"x\")")), "str");
    dies(&format!("{base} g(true)"));
}

#[test]
fn more_specific_variants_win_regardless_of_order() {
    let src = "\
        fun size(x) given any = \"anything\";\n\
        fun size(x) given num = \"a num\";\n\
        fun size(x) given 7 = \"seven itself\";\n\
        [size(7), size(1), size(\"s\")]";
    assert_eq!(eval(src), r#"["seven itself", "a num", "anything"]"#);
}

#[test]
fn compound_givens_accept_either_alternative() {
    let base = "fun show(x) given num or str = \"ok\";";
    assert_eq!(eval(&format!("{base} show(1)")), "ok");
    assert_eq!(eval(&format!("{base} show(\"s\")")), "ok");
    dies(&format!("{base} show([1])"));
}

#[test]
fn loop_with_counter_says_each_value() {
    let (_, lines) = run("loop (i = 0; i < 3; i++) say(i)").unwrap();
    assert_eq!(lines, vec!["0", "1", "2"]);
}

#[test]
fn loop_yields_false_when_the_body_never_ran() {
    assert_eq!(eval("loop (false) 1"), "false");
}

#[test]
fn loop_yields_the_last_body_value() {
    assert_eq!(eval("loop (i = 0; i < 3; i++) i * 10"), "20");
}

#[test]
fn next_restarts_the_function_with_fresh_arguments() {
    let src = "fun count(n) { if n < 3 { next n + 1; } else { n; } } count(0)";
    assert_eq!(eval(src), "3");
}

#[test]
fn slurpy_functions_gather_and_feed_the_superlocal() {
    assert_eq!(eval("fun total(*xs) = |+| xs; total(1, 2, 3)"), "6");
    assert_eq!(eval("fun first(*) = _; first(9, 8)"), "9");
}

#[test]
fn dies_turns_failures_into_bools() {
    assert_eq!(eval("(1 / 0) dies"), "true");
    assert_eq!(eval("1 dies"), "false");
}

#[test]
fn dies_catches_deep_failures_across_frames() {
    let src = "fun boom() = 1 / 0; fun callsite() = boom(); callsite() dies";
    assert_eq!(eval(src), "true");
}

#[test]
fn uncaught_errors_carry_frame_traces() {
    let src = "fun inner() = 1 / 0; fun outer() = inner(); outer()";
    let error = dies(src);
    let shown = error.to_string();
    assert!(shown.contains("division by zero"));
    assert!(shown.contains("inner"));
    assert!(shown.contains("outer"));
}

#[test]
fn queue_collects_into_the_return_value() {
    assert_eq!(eval("fun f() { queue 1; queue 2; 3; } f()"), "[1, 2]");
    assert_eq!(eval("fun f() { queue 1; return queue; } f()"), "[1]");
}

#[test]
fn boxes_instantiate_with_independent_scopes() {
    let src = "\
        box Point(x, y) given num, num { sum = x + y; }\n\
        a = Point(1, 2);\n\
        b = Point(10, 20);\n\
        a.sum + b.sum";
    assert_eq!(eval(src), "33");
}

#[test]
fn box_field_assignment_stays_per_instance() {
    let src = "\
        box Cell(v) { value = v; }\n\
        a = Cell(1);\n\
        b = Cell(1);\n\
        a.value = 5;\n\
        [a.value, b.value]";
    assert_eq!(eval(src), "[5, 1]");
}

#[test]
fn immediate_boxes_declare_and_instantiate() {
    assert_eq!(eval("immediate box Config { port = 8080; } Config.port"), "8080");
}

#[test]
fn box_typechecks_its_arguments() {
    dies("box Point(x) given num { v = x; } Point(\"nope\")");
}

#[test]
fn reduce_spread_folds() {
    assert_eq!(eval("|+| [1, 2, 3]"), "6");
    assert_eq!(eval("|~| [\"a\", \"b\"]"), "ab");
}

#[test]
fn map_spread_collects_and_filters_holes() {
    assert_eq!(eval("|_ + 1| [1, 2, 3]"), "[2, 3, 4]");
    assert_eq!(eval("|if &_ > 1 _ else hole| [1, 2, 3]"), "[2, 3]");
}

#[test]
fn iterative_spread_runs_for_effect_and_keeps_the_source() {
    let (value, lines) = run("|say(_)|: [1, 2]").unwrap();
    assert_eq!(lines, vec!["1", "2"]);
    assert_eq!(value.to_string(), "[1, 2]");
}

#[test]
fn filter_over_vector_keeps_accepted_elements() {
    assert_eq!(eval("[1, 2, 3, 4 | _ > 2]"), "[3, 4]");
}

#[test]
fn ranges_measure_shift_and_slice() {
    assert_eq!(eval("#(1 to 5)"), "5");
    assert_eq!(eval("(1 to 3) + 1"), "2 to 4");
    assert_eq!(eval("[1, 2, 3, 4][1 to 2]"), "[2, 3]");
    assert_eq!(eval("4 in (1 to 5)"), "true");
}

#[test]
fn oversized_ranges_refuse_vectorization() {
    assert_eq!(eval("((0 to 200000) & []) dies"), "true");
}

#[test]
fn string_interpolation_splices_values() {
    assert_eq!(eval("x = 5; \"val: $x\""), "val: 5");
    assert_eq!(eval("\"cost: \\$5\""), "cost: $5");
}

#[test]
fn access_assignment_mutates_in_place() {
    assert_eq!(eval("v = [1, 2, 3]; v[0] = 9; v"), "[9, 2, 3]");
    assert_eq!(eval("m = %{a: 1}; m[\"b\"] = 2; m"), "%{a: 1, b: 2}");
}

#[test]
fn compound_access_assignment_reads_then_writes() {
    assert_eq!(eval("v = [1, 2]; v[1] += 10; v"), "[1, 12]");
}

#[test]
fn lambda_mutations_to_captured_scope_persist() {
    let src = "\
        fun tally() {\n\
            count = 0;\n\
            [1, 2, 3 | (count = count + 1) > 0];\n\
            count;\n\
        }\n\
        tally()";
    assert_eq!(eval(src), "3");
}

#[test]
fn pattern_lambdas_bind_from_their_own_chain() {
    let src = "\
        check := '[a, b];\n\
        fun use(v) { a = 1; check(v) }\n\
        use([7, 8])";
    assert_eq!(eval(src), "%{a: 7, b: 8}");
}

#[test]
fn ensure_blocks_report_suite_and_case() {
    let good = "ensure \"math\" { should \"add\" 1 + 1 is 2; should \"mul\" 2 * 2 is 4; }";
    assert_eq!(eval(good), "true");

    let bad = "ensure \"math\" { should \"add\" 1 + 1 is 3; }";
    let shown = dies(bad).to_string();
    assert!(shown.contains("math should add"), "unexpected message: {shown}");
}

#[test]
fn read_time_macros_install_new_syntax() {
    let src = "nud unless(cond, then) = if not $cond $then; unless false, \"yes\"";
    assert_eq!(eval(src), "yes");
}

#[test]
fn regex_macros_splice_named_captures() {
    let src = "nud `#(?P<hex>[0-9a-f]{6})`() = $hex; #a1b2c3";
    assert_eq!(eval(src), "a1b2c3");
}

#[test]
fn regex_literals_match_strings() {
    assert_eq!(eval("\"hello42\" is `[0-9]+`"), "42");
    assert_eq!(eval("\"hello\" is `[0-9]+`"), "false");
}

#[test]
fn x_repeats_with_operand_rotation() {
    assert_eq!(eval("\"ab\" x 3"), "ababab");
    assert_eq!(eval("3 x \"ab\""), "ababab");
}

#[test]
fn field_access_falls_back_to_partial_application() {
    let src = "fun double(n) given num = n * 2; 21.double()";
    assert_eq!(eval(src), "42");
}

#[test]
fn superlocal_is_frame_local() {
    // The callee's underscores are its own; the caller's stay untouched.
    let src = "fun pick(*) = _; fun outer(*) { pick(1, 2); _; } outer(9)";
    assert_eq!(eval(src), "9");
}

#[test]
fn actions_respect_the_permission_gate() {
    let mut settings = Settings::default();
    settings.permissions.screen = false;
    let mut orchestra = Orchestra::new(MapOracle::new(), MapLoader::new(), CollectIo::default(), settings);
    let error = orchestra.run("main.vsp", "say(1)").unwrap_err();
    assert_eq!(error.to_string(), "[action error] say not allowed: try with --with-screen");
}

#[test]
fn disk_actions_are_gated_separately() {
    let error = dies("slurp(\"/etc/passwd\")").to_string();
    assert!(error.contains("slurp not allowed: try with --with-disk"));
}

#[test]
fn dynamic_and_branching_fields_resolve() {
    let src = "box P(x, y) { } p = P(1, 2); p.(\"x\")";
    assert_eq!(eval(src), "1");
    let src = "box P(x, y) { } p = P(1, 2); p.[x, y]";
    assert_eq!(eval(src), "[1, 2]");
}

#[test]
fn into_bool_postfix_reads_truthiness() {
    assert_eq!(eval("(0)?"), "false");
    assert_eq!(eval("(5)?"), "true");
    assert_eq!(eval("(\"\")?"), "false");
}

#[test]
fn superlocal_tap_peeks_without_consuming() {
    assert_eq!(eval("fun peek(*) = [&_, &_, _]; peek(7)"), "[7, 7, 7]");
}

#[test]
fn partial_ranges_contain_and_refuse_measurement() {
    assert_eq!(eval("7 in from 5"), "true");
    assert_eq!(eval("3 in from 5"), "false");
    assert_eq!(eval("4 in to 10"), "true");
    assert_eq!(eval("(#(from 5)) dies"), "true");
}

#[test]
fn ask_reads_canned_answers_in_tests() {
    let mut orchestra = Orchestra::new(MapOracle::new(), MapLoader::new(), CollectIo::default(), Settings::default());
    orchestra.io_mut().answers.push_back("blue".to_owned());
    let result = orchestra.run("main.vsp", "ask(\"color? \")").unwrap();
    assert_eq!(result.to_string(), "blue");
}

#[test]
fn block_bodied_macros_splice_statements() {
    let src = "nud twice(body) { $body; $body; } twice say(\"hi\");";
    let (_, lines) = run(src).unwrap();
    assert_eq!(lines, vec!["hi", "hi"]);
}

#[test]
fn sessions_share_globals_between_runs() {
    let mut orchestra = Orchestra::new(MapOracle::new(), MapLoader::new(), CollectIo::default(), Settings::default());
    orchestra.run("repl:1", "x := 5").unwrap();
    let result = orchestra.run("repl:2", "x + 1").unwrap();
    assert_eq!(result.to_string(), "6");
}
